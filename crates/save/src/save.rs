//! Save orchestration
//!
//! A [`SaveSession`] moves through `Init -> Collecting -> Finalizing` and
//! ends in `Done` or `Failed`:
//!
//! - `begin` reads the current value of the target ref, if any.
//! - `collect` expands input paths, stores each file's content and adds it
//!   to the snapshot tree. Per-file failures go to the error log and the
//!   walk continues.
//! - `finalize` writes the trees and the commit, closes the store, and
//!   moves the ref from the value seen by `begin` to the new commit.
//!
//! Only traversal errors the expander cannot classify, store failures and
//! a ref conflict are fatal. A fatal error leaves the ref untouched.

use crate::errors::{ErrorLog, SoftError, SoftErrorKind};
use crate::expand::{ExpandError, FileKind, FileStatus, PathExpander};
use crate::hashsplit::{self, EncodeError};
use crate::tree::{TreeBuilder, TreeError};
use cairn_core::{
    ChunkingConfig, Commit, Mode, ObjectId, ObjectStore, RefName, Signature, StoreError,
};
use std::fs::{self, File};
use std::path::Path;
use thiserror::Error;

/// Stage of a save session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Init,
    Collecting,
    Finalizing,
    Done,
    Failed,
}

#[derive(Error, Debug)]
pub enum SaveError {
    #[error(transparent)]
    Expand(#[from] ExpandError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Another writer moved the ref after this save read it
    ///
    /// `tree` and `commit` were written and are durable; only the ref
    /// was left alone.
    #[error(
        "{name} was moved to {} by another save (this save started from {}); \
         tree {tree} and commit {commit} were written but the ref was not updated, \
         run the save again",
        short_id(.actual),
        short_id(.expected)
    )]
    RefConflict {
        name: String,
        expected: Option<ObjectId>,
        actual: Option<ObjectId>,
        tree: ObjectId,
        commit: ObjectId,
    },

    #[error("save session is {0:?}")]
    InvalidState(SaveState),
}

impl SaveError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SaveError::RefConflict { .. })
    }
}

fn short_id(id: &Option<ObjectId>) -> String {
    match id {
        Some(id) => id.to_hex()[..12].to_string(),
        None => "nothing".to_string(),
    }
}

/// What to produce at the end of a save
#[derive(Debug, Clone)]
pub struct SaveOptions {
    /// Write a commit even when no ref is named
    pub commit: bool,
    /// Backup set to advance; implies a commit
    pub ref_name: Option<RefName>,
    pub message: String,
    pub chunking: ChunkingConfig,
    /// Author and committer; the current user when unset
    pub author: Option<Signature>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            commit: false,
            ref_name: None,
            message: Self::command_message(["cairn", "save"]),
            chunking: ChunkingConfig::default(),
            author: None,
        }
    }
}

impl SaveOptions {
    /// Commit message recording the command line that produced the save
    pub fn command_message<I, S>(argv: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let argv: Vec<String> = argv.into_iter().map(|a| a.as_ref().to_string()).collect();
        format!("cairn save\n\nGenerated by command:\n{argv:?}\n")
    }

    pub fn wants_commit(&self) -> bool {
        self.commit || self.ref_name.is_some()
    }
}

/// Observer for per-file progress
pub trait SaveProgress {
    fn file_saved(&mut self, _path: &Path, _bytes: u64) {}
    fn file_skipped(&mut self, _path: &Path) {}
}

impl SaveProgress for () {}

/// Outcome of a finished save
#[derive(Debug, Clone)]
pub struct SaveReport {
    pub tree: ObjectId,
    pub commit: Option<ObjectId>,
    /// Value of the ref when the save began
    pub parent: Option<ObjectId>,
    pub files: u64,
    pub bytes: u64,
    pub errors: Vec<SoftError>,
}

impl SaveReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// One save run against an exclusively borrowed store
pub struct SaveSession<'s, S: ObjectStore + ?Sized> {
    store: &'s mut S,
    options: SaveOptions,
    oldref: Option<ObjectId>,
    tree: TreeBuilder,
    errors: ErrorLog,
    state: SaveState,
    files: u64,
    bytes: u64,
}

impl<'s, S: ObjectStore + ?Sized> SaveSession<'s, S> {
    /// Start a session, reading the current value of the target ref
    pub fn begin(store: &'s mut S, options: SaveOptions) -> Result<Self, SaveError> {
        let oldref = match &options.ref_name {
            Some(name) => store.read_ref(name)?,
            None => None,
        };
        tracing::info!(
            ref_name = options.ref_name.as_ref().map(RefName::as_str),
            oldref = ?oldref,
            "save started"
        );
        Ok(Self {
            store,
            options,
            oldref,
            tree: TreeBuilder::new(),
            errors: ErrorLog::new(),
            state: SaveState::Init,
            files: 0,
            bytes: 0,
        })
    }

    pub fn state(&self) -> SaveState {
        self.state
    }

    pub fn oldref(&self) -> Option<ObjectId> {
        self.oldref
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    fn expect_collecting(&self) -> Result<(), SaveError> {
        match self.state {
            SaveState::Init | SaveState::Collecting => Ok(()),
            state => Err(SaveError::InvalidState(state)),
        }
    }

    /// Expand `roots` and add every file found to the snapshot
    ///
    /// May be called more than once before [`SaveSession::finalize`].
    pub fn collect<P: AsRef<Path>>(
        &mut self,
        roots: &[P],
        progress: &mut dyn SaveProgress,
    ) -> Result<(), SaveError> {
        self.expect_collecting()?;
        self.state = SaveState::Collecting;
        let result = self.collect_roots(roots, progress);
        if result.is_err() {
            self.state = SaveState::Failed;
        }
        result
    }

    fn collect_roots<P: AsRef<Path>>(
        &mut self,
        roots: &[P],
        progress: &mut dyn SaveProgress,
    ) -> Result<(), SaveError> {
        let mut leaf = LeafWriter {
            store: &mut *self.store,
            tree: &mut self.tree,
            errors: &self.errors,
            chunking: &self.options.chunking,
        };
        for item in PathExpander::new(roots, &self.errors) {
            let (path, status) = item?;
            match leaf.save(&path, &status)? {
                Some(bytes) => {
                    self.files += 1;
                    self.bytes += bytes;
                    progress.file_saved(&path, bytes);
                }
                None => progress.file_skipped(&path),
            }
        }
        Ok(())
    }

    /// Write the snapshot, its commit, and advance the ref
    pub fn finalize(&mut self) -> Result<SaveReport, SaveError> {
        self.expect_collecting()?;
        self.state = SaveState::Finalizing;
        let result = self.write_snapshot();
        self.state = match result {
            Ok(_) => SaveState::Done,
            Err(_) => SaveState::Failed,
        };
        result
    }

    fn write_snapshot(&mut self) -> Result<SaveReport, SaveError> {
        tracing::info!(files = self.files, bytes = self.bytes, "writing snapshot");
        let tree = std::mem::take(&mut self.tree).freeze();
        let tree_id = tree.generate(&mut *self.store)?;

        let commit = if self.options.wants_commit() {
            let author = self.options.author.clone().unwrap_or_else(Signature::from_env);
            let commit = Commit {
                tree: tree_id,
                parent: self.oldref,
                committer: author.clone(),
                author,
                message: self.options.message.clone(),
            };
            Some(self.store.write_commit(&commit)?)
        } else {
            None
        };

        self.store.close()?;

        if let (Some(name), Some(commit)) = (&self.options.ref_name, commit) {
            self.store
                .update_ref(name, commit, self.oldref)
                .map_err(|err| match err {
                    StoreError::RefConflict {
                        name,
                        expected,
                        actual,
                    } => SaveError::RefConflict {
                        name,
                        expected,
                        actual,
                        tree: tree_id,
                        commit,
                    },
                    other => SaveError::Store(other),
                })?;
            tracing::info!(ref_name = %name, %commit, "ref updated");
        }

        let errors = std::mem::take(&mut self.errors).into_inner();
        if !errors.is_empty() {
            tracing::warn!(count = errors.len(), "errors encountered while saving");
        }
        Ok(SaveReport {
            tree: tree_id,
            commit,
            parent: self.oldref,
            files: self.files,
            bytes: self.bytes,
            errors,
        })
    }
}

/// Run a whole save: begin, collect every root, finalize
pub fn save<S, P>(
    store: &mut S,
    roots: &[P],
    options: SaveOptions,
    progress: &mut dyn SaveProgress,
) -> Result<SaveReport, SaveError>
where
    S: ObjectStore + ?Sized,
    P: AsRef<Path>,
{
    let mut session = SaveSession::begin(store, options)?;
    session.collect(roots, progress)?;
    session.finalize()
}

/// Stores single leaves and places them in the tree
struct LeafWriter<'a, S: ObjectStore + ?Sized> {
    store: &'a mut S,
    tree: &'a mut TreeBuilder,
    errors: &'a ErrorLog,
    chunking: &'a ChunkingConfig,
}

impl<S: ObjectStore + ?Sized> LeafWriter<'_, S> {
    /// Save one expanded path; `Some(bytes)` if it made it into the tree
    fn save(&mut self, path: &Path, status: &FileStatus) -> Result<Option<u64>, SaveError> {
        let (mode, id, size) = match status.kind {
            FileKind::Regular => {
                let file = match File::open(path) {
                    Ok(file) => file,
                    Err(e) => return Ok(self.skip(SoftError::from_io(path, &e))),
                };
                match hashsplit::encode_content(&mut *self.store, file, self.chunking) {
                    Ok(encoded) => (encoded.mode, encoded.id, encoded.size),
                    Err(EncodeError::Read(e)) => return Ok(self.skip(SoftError::from_io(path, &e))),
                    Err(EncodeError::Store(e)) => return Err(e.into()),
                }
            }
            FileKind::Symlink => {
                let target = match fs::read_link(path) {
                    Ok(target) => link_bytes(&target),
                    Err(e) => return Ok(self.skip(SoftError::from_io(path, &e))),
                };
                let id = self.store.write_blob(&target)?;
                (Mode::Symlink, id, target.len() as u64)
            }
            FileKind::Directory => {
                return Ok(self.skip(SoftError::new(
                    path,
                    SoftErrorKind::Unsupported,
                    "directory given as a leaf",
                )));
            }
            FileKind::Special => {
                return Ok(self.skip(SoftError::new(
                    path,
                    SoftErrorKind::Unsupported,
                    "skipping special file",
                )));
            }
        };

        match self.tree.add_file(path, mode, id) {
            Ok(None) => {}
            Ok(Some(previous)) => self.errors.record(SoftError::new(
                path,
                SoftErrorKind::Duplicate,
                format!("saved more than once, replacing {}", previous.id),
            )),
            Err(e) => {
                let kind = match e {
                    TreeError::NotADirectory(_) | TreeError::IsADirectory(_) => {
                        SoftErrorKind::PathConflict
                    }
                    _ => SoftErrorKind::Unsupported,
                };
                return Ok(self.skip(SoftError::new(e.path(), kind, e.to_string())));
            }
        }
        tracing::info!(path = %path.display(), %id, size, "saved");
        Ok(Some(size))
    }

    fn skip(&self, error: SoftError) -> Option<u64> {
        self.errors.record(error);
        None
    }
}

#[cfg(unix)]
fn link_bytes(target: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    target.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn link_bytes(target: &Path) -> Vec<u8> {
    target.to_string_lossy().into_owned().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::object::{object_id, ObjectKind};
    use cairn_core::MemoryStore;
    use std::path::PathBuf;

    fn options_with_ref(name: &str) -> SaveOptions {
        SaveOptions {
            ref_name: Some(RefName::backup_set(name).unwrap()),
            ..SaveOptions::default()
        }
    }

    #[test]
    fn test_tree_only_save_writes_no_commit() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"a").unwrap();

        let mut store = MemoryStore::new();
        let report = save(&mut store, &[temp_dir.path()], SaveOptions::default(), &mut ()).unwrap();
        assert_eq!(report.commit, None);
        assert_eq!(report.files, 1);
        assert_eq!(store.counts().commits, 0);
        assert!(store.is_closed());
    }

    #[test]
    fn test_named_save_advances_ref() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"a").unwrap();
        let name = RefName::backup_set("docs").unwrap();

        let mut store = MemoryStore::new();
        let first =
            save(&mut store, &[temp_dir.path()], options_with_ref("docs"), &mut ()).unwrap();
        assert_eq!(store.read_ref(&name).unwrap(), first.commit);
        assert_eq!(first.parent, None);

        // A fresh store handle for the second run
        let mut second_store = MemoryStore::new();
        second_store.set_ref(&name, first.commit.unwrap());
        let second =
            save(&mut second_store, &[temp_dir.path()], options_with_ref("docs"), &mut ()).unwrap();
        assert_eq!(second.parent, first.commit);
        assert_eq!(second.tree, first.tree);
    }

    #[test]
    fn test_conflict_is_distinct() {
        let name = RefName::backup_set("docs").unwrap();
        let a = object_id(ObjectKind::Commit, b"a");
        let b = object_id(ObjectKind::Commit, b"b");

        let mut store = MemoryStore::new();
        store.set_ref(&name, a);
        let mut session = SaveSession::begin(&mut store, options_with_ref("docs")).unwrap();
        assert_eq!(session.oldref(), Some(a));
        session.collect::<PathBuf>(&[], &mut ()).unwrap();

        // Pretend the session started from a value that has since moved
        session.oldref = Some(b);
        let err = session.finalize().unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(session.state(), SaveState::Failed);
        let message = err.to_string();
        match err {
            SaveError::RefConflict {
                expected,
                actual,
                tree,
                commit,
                ..
            } => {
                assert_eq!(expected, Some(b));
                assert_eq!(actual, Some(a));
                assert!(message.contains(&tree.to_hex()), "{message}");
                assert!(message.contains(&commit.to_hex()), "{message}");
                assert!(store.get(&tree).is_some());
                assert!(store.get(&commit).is_some());
            }
            other => panic!("unexpected {other}"),
        }
        assert_eq!(store.read_ref(&name).unwrap(), Some(a));
    }

    #[test]
    fn test_store_failure_is_fatal() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("a.txt"), b"a").unwrap();

        let mut store = MemoryStore::failing();
        let mut session = SaveSession::begin(&mut store, options_with_ref("x")).unwrap();
        let err = session.collect(&[temp_dir.path()], &mut ()).unwrap_err();
        assert!(matches!(err, SaveError::Store(_)));
        assert_eq!(session.state(), SaveState::Failed);
        assert!(matches!(session.finalize(), Err(SaveError::InvalidState(SaveState::Failed))));
    }

    #[test]
    fn test_finalize_only_once() {
        let mut store = MemoryStore::new();
        let mut session = SaveSession::begin(&mut store, SaveOptions::default()).unwrap();
        assert_eq!(session.state(), SaveState::Init);
        session.finalize().unwrap();
        assert_eq!(session.state(), SaveState::Done);
        assert!(matches!(
            session.collect::<PathBuf>(&[], &mut ()),
            Err(SaveError::InvalidState(SaveState::Done))
        ));
    }

    #[test]
    fn test_duplicate_input_recorded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, b"a").unwrap();

        let mut store = MemoryStore::new();
        let roots = [temp_dir.path(), file.as_path()];
        let report = save(&mut store, &roots, SaveOptions::default(), &mut ()).unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, SoftErrorKind::Duplicate);
        assert_eq!(report.errors[0].path, file);
    }

    #[test]
    fn test_progress_observer() {
        #[derive(Default)]
        struct Counter {
            saved: Vec<u64>,
            skipped: usize,
        }
        impl SaveProgress for Counter {
            fn file_saved(&mut self, _path: &Path, bytes: u64) {
                self.saved.push(bytes);
            }
            fn file_skipped(&mut self, _path: &Path) {
                self.skipped += 1;
            }
        }

        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("five"), b"12345").unwrap();

        let mut counter = Counter::default();
        let mut store = MemoryStore::new();
        let report =
            save(&mut store, &[temp_dir.path()], SaveOptions::default(), &mut counter).unwrap();
        assert_eq!(counter.saved, [5]);
        assert_eq!(counter.skipped, 0);
        assert_eq!(report.bytes, 5);
    }

    #[test]
    fn test_command_message() {
        let message = SaveOptions::command_message(["cairn", "save", "-n", "home"]);
        assert_eq!(
            message,
            "cairn save\n\nGenerated by command:\n[\"cairn\", \"save\", \"-n\", \"home\"]\n"
        );
    }
}
