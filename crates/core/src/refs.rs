//! Named refs and their compare-and-swap update
//!
//! A ref is a text file under `refs/` holding one hex commit id. Updates take
//! an exclusive `<ref>.lock` file, compare the current value with the value
//! the caller observed, write the new value into the lock file and rename it
//! over the ref.

use crate::error::StoreError;
use crate::hash::ObjectId;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const HEADS_PREFIX: &str = "refs/heads/";

/// A validated full ref name such as `refs/heads/home`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefName(String);

impl RefName {
    /// Ref for a backup set: `refs/heads/<name>`
    pub fn backup_set(name: &str) -> Result<Self, StoreError> {
        validate_name(name, name)?;
        Ok(Self(format!("{HEADS_PREFIX}{name}")))
    }

    /// Parse a full ref name (must start with `refs/`)
    pub fn new(full: &str) -> Result<Self, StoreError> {
        let rest = full.strip_prefix("refs/").ok_or(StoreError::InvalidRefName {
            name: full.to_string(),
            reason: "must start with refs/",
        })?;
        validate_name(full, rest)?;
        Ok(Self(full.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name without the `refs/heads/` prefix
    pub fn short(&self) -> &str {
        self.0.strip_prefix(HEADS_PREFIX).unwrap_or(&self.0)
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_name(full: &str, name: &str) -> Result<(), StoreError> {
    let invalid = |reason| StoreError::InvalidRefName {
        name: full.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("empty name"));
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err(invalid("empty path component"));
    }
    if name.starts_with('-') {
        return Err(invalid("must not start with '-'"));
    }
    if name.contains("..") {
        return Err(invalid("must not contain '..'"));
    }
    if name.ends_with(".lock") || name.ends_with('.') {
        return Err(invalid("must not end with '.lock' or '.'"));
    }
    if name.split('/').any(|part| part.starts_with('.')) {
        return Err(invalid("components must not start with '.'"));
    }
    if name
        .chars()
        .any(|c| c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return Err(invalid("contains a forbidden character"));
    }
    Ok(())
}

fn ref_path(root: &Path, name: &RefName) -> PathBuf {
    root.join(name.as_str())
}

/// Read the current value of a ref, `None` if it does not exist yet
pub fn read_ref(root: &Path, name: &RefName) -> Result<Option<ObjectId>, StoreError> {
    let path = ref_path(root, name);
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let id = ObjectId::from_hex(text.trim())
                .map_err(|e| StoreError::Corrupt(format!("ref {name}: {e}")))?;
            Ok(Some(id))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(format!("failed to read ref {name}"), e)),
    }
}

/// Exclusive lock on one ref, removed on drop unless committed
struct RefLock {
    path: PathBuf,
    target: PathBuf,
    file: File,
    committed: bool,
}

impl RefLock {
    fn acquire(root: &Path, name: &RefName) -> Result<Self, StoreError> {
        let target = ref_path(root, name);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::io("failed to create refs directory", e))?;
        }
        let mut path = target.clone().into_os_string();
        path.push(".lock");
        let path = PathBuf::from(path);

        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::RefLocked(name.to_string()))
            }
            Err(e) => return Err(StoreError::io(format!("failed to lock ref {name}"), e)),
        };

        Ok(Self {
            path,
            target,
            file,
            committed: false,
        })
    }

    fn commit(mut self, id: ObjectId) -> Result<(), StoreError> {
        self.file
            .write_all(format!("{id}\n").as_bytes())
            .and_then(|_| self.file.sync_all())
            .map_err(|e| StoreError::io("failed to write ref lock", e))?;
        std::fs::rename(&self.path, &self.target)
            .map_err(|e| StoreError::io("failed to move ref into place", e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for RefLock {
    fn drop(&mut self) {
        // A committed lock has already been renamed away
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Compare-and-swap `name` from `expected` to `new`
///
/// `verify` runs while the lock is held, after the comparison succeeded.
pub fn update_ref(
    root: &Path,
    name: &RefName,
    new: ObjectId,
    expected: Option<ObjectId>,
    verify: impl FnOnce(ObjectId) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    let lock = RefLock::acquire(root, name)?;

    let actual = read_ref(root, name)?;
    if actual != expected {
        return Err(StoreError::RefConflict {
            name: name.to_string(),
            expected,
            actual,
        });
    }
    verify(new)?;

    lock.commit(new)?;
    tracing::debug!(%name, %new, "ref updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::OID_LEN;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; OID_LEN])
    }

    fn ok(_: ObjectId) -> Result<(), StoreError> {
        Ok(())
    }

    #[test]
    fn test_backup_set_names() {
        assert_eq!(RefName::backup_set("home").unwrap().as_str(), "refs/heads/home");
        assert_eq!(RefName::backup_set("hosts/alpha").unwrap().short(), "hosts/alpha");
        for bad in ["", "a..b", "-x", "x.lock", "a//b", "/a", "a b", ".hidden", "x:y"] {
            assert!(RefName::backup_set(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(RefName::new("heads/x").is_err());
    }

    #[test]
    fn test_create_and_advance() {
        let temp_dir = tempfile::tempdir().unwrap();
        let name = RefName::backup_set("docs").unwrap();

        assert_eq!(read_ref(temp_dir.path(), &name).unwrap(), None);
        update_ref(temp_dir.path(), &name, oid(1), None, ok).unwrap();
        assert_eq!(read_ref(temp_dir.path(), &name).unwrap(), Some(oid(1)));
        update_ref(temp_dir.path(), &name, oid(2), Some(oid(1)), ok).unwrap();
        assert_eq!(read_ref(temp_dir.path(), &name).unwrap(), Some(oid(2)));
    }

    #[test]
    fn test_conflict_leaves_ref_untouched() {
        let temp_dir = tempfile::tempdir().unwrap();
        let name = RefName::backup_set("docs").unwrap();
        update_ref(temp_dir.path(), &name, oid(2), None, ok).unwrap();

        let err = update_ref(temp_dir.path(), &name, oid(3), Some(oid(1)), ok).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(read_ref(temp_dir.path(), &name).unwrap(), Some(oid(2)));

        // Lock must have been released
        update_ref(temp_dir.path(), &name, oid(3), Some(oid(2)), ok).unwrap();
    }

    #[test]
    fn test_held_lock_is_reported() {
        let temp_dir = tempfile::tempdir().unwrap();
        let name = RefName::backup_set("docs").unwrap();
        let _held = RefLock::acquire(temp_dir.path(), &name).unwrap();

        let err = update_ref(temp_dir.path(), &name, oid(1), None, ok).unwrap_err();
        assert!(matches!(err, StoreError::RefLocked(_)));
    }

    #[test]
    fn test_failed_verify_does_not_move_ref() {
        let temp_dir = tempfile::tempdir().unwrap();
        let name = RefName::backup_set("docs").unwrap();

        let err = update_ref(temp_dir.path(), &name, oid(9), None, |id| {
            Err(StoreError::MissingObject(id))
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::MissingObject(_)));
        assert_eq!(read_ref(temp_dir.path(), &name).unwrap(), None);
    }
}
