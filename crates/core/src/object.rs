//! Git object encoding: blobs, trees and commits
//!
//! Objects are framed as `"<kind> <len>\0<body>"` and identified by the
//! SHA-1 of that frame, so ids match what `git hash-object` would produce.

use crate::error::StoreError;
use crate::hash::{IncrementalHasher, ObjectId, ParseOidError, OID_LEN};
use chrono::{DateTime, FixedOffset, Local};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Kind of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(StoreError::Corrupt(format!("unknown object kind {other:?}"))),
        }
    }
}

/// Mode tag of a tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Regular file (`100644`)
    Regular,
    /// Executable file (`100755`)
    Executable,
    /// Symbolic link (`120000`)
    Symlink,
    /// Subtree (`40000`); also used for files split into chunk trees
    Directory,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Regular => "100644",
            Mode::Executable => "100755",
            Mode::Symlink => "120000",
            Mode::Directory => "40000",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "100644" => Ok(Mode::Regular),
            "100755" => Ok(Mode::Executable),
            "120000" => Ok(Mode::Symlink),
            "40000" => Ok(Mode::Directory),
            other => Err(StoreError::Corrupt(format!("unknown tree entry mode {other:?}"))),
        }
    }
}

/// One `(mode, name, id)` entry of a tree object
///
/// Names are raw bytes, as on disk; they need not be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: Mode,
    pub name: Vec<u8>,
    pub id: ObjectId,
}

impl TreeEntry {
    pub fn new(mode: Mode, name: impl Into<Vec<u8>>, id: ObjectId) -> Self {
        Self {
            mode,
            name: name.into(),
            id,
        }
    }

    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    /// Git compares subtree names as if they ended in `/`
    fn sort_key(&self) -> impl Iterator<Item = u8> + '_ {
        let suffix = (self.mode == Mode::Directory).then_some(b'/');
        self.name.iter().copied().chain(suffix)
    }
}

/// Build the `"<kind> <len>\0"` header
pub fn frame_header(kind: ObjectKind, len: usize) -> Vec<u8> {
    format!("{} {}\0", kind, len).into_bytes()
}

/// Compute the id an object body will be stored under
pub fn object_id(kind: ObjectKind, body: &[u8]) -> ObjectId {
    let mut hasher = IncrementalHasher::new();
    hasher.update(&frame_header(kind, body.len()));
    hasher.update(body);
    hasher.finalize()
}

/// Split a framed object back into kind and body
pub fn split_frame(frame: &[u8]) -> Result<(ObjectKind, &[u8]), StoreError> {
    let nul = frame
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| StoreError::Corrupt("object header not terminated".into()))?;
    let header = std::str::from_utf8(&frame[..nul])
        .map_err(|_| StoreError::Corrupt("object header is not utf-8".into()))?;
    let (kind, len) = header
        .split_once(' ')
        .ok_or_else(|| StoreError::Corrupt(format!("malformed object header {header:?}")))?;
    let kind: ObjectKind = kind.parse()?;
    let len: usize = len
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("bad object length {len:?}")))?;
    let body = &frame[nul + 1..];
    if body.len() != len {
        return Err(StoreError::Corrupt(format!(
            "object length mismatch: header says {len}, body has {}",
            body.len()
        )));
    }
    Ok((kind, body))
}

/// Encode tree entries in git canonical order
///
/// Entry names must be non-empty and must not contain `/` or NUL.
pub fn encode_tree(entries: &[TreeEntry]) -> Vec<u8> {
    let mut sorted: Vec<&TreeEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));

    let mut body = Vec::with_capacity(entries.len() * (OID_LEN + 32));
    for entry in sorted {
        debug_assert!(!entry.name.is_empty() && !entry.name.iter().any(|&b| b == b'/' || b == 0));
        body.extend_from_slice(entry.mode.as_str().as_bytes());
        body.push(b' ');
        body.extend_from_slice(&entry.name);
        body.push(0);
        body.extend_from_slice(entry.id.as_bytes());
    }
    body
}

/// Parse a tree object body
pub fn parse_tree(mut body: &[u8]) -> Result<Vec<TreeEntry>, StoreError> {
    let mut entries = Vec::new();
    while !body.is_empty() {
        let space = body
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| StoreError::Corrupt("tree entry without mode".into()))?;
        let mode = std::str::from_utf8(&body[..space])
            .map_err(|_| StoreError::Corrupt("tree mode is not utf-8".into()))?
            .parse()?;
        let rest = &body[space + 1..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| StoreError::Corrupt("tree entry name not terminated".into()))?;
        let name = rest[..nul].to_vec();
        let id_start = nul + 1;
        let id = rest
            .get(id_start..id_start + OID_LEN)
            .and_then(ObjectId::from_slice)
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "truncated id for tree entry {:?}",
                    String::from_utf8_lossy(&name)
                ))
            })?;
        entries.push(TreeEntry { mode, name, id });
        body = &rest[id_start + OID_LEN..];
    }
    Ok(entries)
}

/// Author / committer identity line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub email: String,
    pub when: DateTime<FixedOffset>,
}

impl Signature {
    pub fn new(
        name: impl Into<String>,
        email: impl Into<String>,
        when: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            when,
        }
    }

    /// Identity of the current user at the current local time
    pub fn from_env() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "cairn".to_string());
        let host = std::env::var("HOSTNAME")
            .ok()
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
            })
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        let now = Local::now();
        Self::new(user.clone(), format!("{user}@{host}"), now.with_timezone(now.offset()))
    }

    fn to_git(&self) -> String {
        format!(
            "{} <{}> {} {}",
            self.name,
            self.email,
            self.when.timestamp(),
            self.when.format("%z")
        )
    }
}

/// A commit pointing at one snapshot tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: ObjectId,
    pub parent: Option<ObjectId>,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
}

impl Commit {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("tree {}\n", self.tree);
        if let Some(parent) = self.parent {
            out.push_str(&format!("parent {}\n", parent));
        }
        out.push_str(&format!("author {}\n", self.author.to_git()));
        out.push_str(&format!("committer {}\n", self.committer.to_git()));
        out.push('\n');
        out.push_str(&self.message);
        if !self.message.ends_with('\n') {
            out.push('\n');
        }
        out.into_bytes()
    }

    /// Read back the `tree` and `parent` headers of an encoded commit
    pub fn parse_links(body: &[u8]) -> Result<(ObjectId, Option<ObjectId>), StoreError> {
        let text = std::str::from_utf8(body)
            .map_err(|_| StoreError::Corrupt("commit is not utf-8".into()))?;
        let mut tree = None;
        let mut parent = None;
        for line in text.lines().take_while(|l| !l.is_empty()) {
            let corrupt =
                |e: ParseOidError| StoreError::Corrupt(format!("bad commit header {line:?}: {e}"));
            if let Some(hex) = line.strip_prefix("tree ") {
                tree = Some(ObjectId::from_hex(hex).map_err(corrupt)?);
            } else if let Some(hex) = line.strip_prefix("parent ") {
                parent = Some(ObjectId::from_hex(hex).map_err(corrupt)?);
            }
        }
        let tree = tree.ok_or_else(|| StoreError::Corrupt("commit without tree".into()))?;
        Ok((tree, parent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes([byte; OID_LEN])
    }

    #[test]
    fn test_blob_id_matches_git() {
        // git hash-object -t blob --stdin <<< "hello world" (with trailing newline)
        assert_eq!(
            object_id(ObjectKind::Blob, b"hello world\n").to_hex(),
            "3b18e512dba79e4c8300dd08aeb37f8e728b8dad"
        );
    }

    #[test]
    fn test_empty_tree_id_matches_git() {
        assert_eq!(
            object_id(ObjectKind::Tree, &encode_tree(&[])).to_hex(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }

    #[test]
    fn test_tree_encoding_is_canonical() {
        let a = vec![
            TreeEntry::new(Mode::Regular, "b.txt", oid(1)),
            TreeEntry::new(Mode::Directory, "a", oid(2)),
            TreeEntry::new(Mode::Regular, "a.txt", oid(3)),
        ];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(encode_tree(&a), encode_tree(&b));

        // "a.txt" sorts before the directory "a" because '.' < '/'
        let names: Vec<_> = parse_tree(&encode_tree(&a))
            .unwrap()
            .into_iter()
            .map(|e| e.name_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.txt", "a", "b.txt"]);
    }

    #[test]
    fn test_tree_names_are_bytes() {
        let latin1 = b"caf\xe9.txt".to_vec();
        let entries = vec![TreeEntry::new(Mode::Regular, latin1.clone(), oid(4))];
        let body = encode_tree(&entries);
        assert!(body.windows(latin1.len()).any(|w| w == latin1));

        let parsed = parse_tree(&body).unwrap();
        assert_eq!(parsed[0].name, latin1);
        assert_eq!(parsed[0].name_lossy(), "caf\u{fffd}.txt");
    }

    #[test]
    fn test_parse_tree_roundtrip_preserves_modes() {
        let entries = vec![
            TreeEntry::new(Mode::Symlink, "link", oid(7)),
            TreeEntry::new(Mode::Regular, "file", oid(8)),
        ];
        let parsed = parse_tree(&encode_tree(&entries)).unwrap();
        assert_eq!(parsed[0], entries[1]);
        assert_eq!(parsed[1], entries[0]);
    }

    #[test]
    fn test_parse_tree_truncated() {
        let mut body = encode_tree(&[TreeEntry::new(Mode::Regular, "f", oid(1))]);
        body.truncate(body.len() - 3);
        assert!(parse_tree(&body).is_err());
    }

    #[test]
    fn test_split_frame() {
        let mut frame = frame_header(ObjectKind::Blob, 3);
        frame.extend_from_slice(b"abc");
        let (kind, body) = split_frame(&frame).unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(body, b"abc");

        frame.push(b'x');
        assert!(split_frame(&frame).is_err());
    }

    #[test]
    fn test_commit_encoding() {
        let when = DateTime::parse_from_rfc3339("2024-01-02T03:04:05+01:00").unwrap();
        let sig = Signature::new("alice", "alice@host", when);
        let commit = Commit {
            tree: oid(1),
            parent: Some(oid(2)),
            author: sig.clone(),
            committer: sig,
            message: "cairn save".into(),
        };
        let text = String::from_utf8(commit.encode()).unwrap();
        assert!(text.starts_with(&format!("tree {}\nparent {}\n", oid(1), oid(2))));
        assert!(text.contains("author alice <alice@host> 1704161045 +0100\n"));
        assert!(text.ends_with("\n\ncairn save\n"));

        let (tree, parent) = Commit::parse_links(text.as_bytes()).unwrap();
        assert_eq!(tree, oid(1));
        assert_eq!(parent, Some(oid(2)));
    }
}
