//! Collector for non-fatal errors of one save run

use parking_lot::Mutex;
use std::fmt;
use std::path::{Path, PathBuf};

/// Why a path was skipped or only partly saved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoftErrorKind {
    /// The path disappeared or never existed
    Missing,
    /// The path could not be opened or listed
    PermissionDenied,
    /// Sockets, devices, fifos and other unsupported node types
    Unsupported,
    /// Opening or reading the file failed part way
    Unreadable,
    /// Another input already produced an entry at the same position
    Duplicate,
    /// The path clashes with the shape of the tree built so far
    PathConflict,
}

impl SoftErrorKind {
    /// Classify an I/O error raised while touching a single path
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SoftErrorKind::Missing,
            std::io::ErrorKind::PermissionDenied => SoftErrorKind::PermissionDenied,
            _ => SoftErrorKind::Unreadable,
        }
    }
}

/// One recorded non-fatal failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoftError {
    pub path: PathBuf,
    pub kind: SoftErrorKind,
    pub message: String,
}

impl SoftError {
    pub fn new(path: impl Into<PathBuf>, kind: SoftErrorKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn from_io(path: &Path, err: &std::io::Error) -> Self {
        Self::new(path, SoftErrorKind::from_io(err), err.to_string())
    }
}

impl fmt::Display for SoftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

/// Append-only, ordered list of soft errors
///
/// Appends go through a lock so one log can be shared by concurrent
/// producers.
#[derive(Debug, Default)]
pub struct ErrorLog {
    entries: Mutex<Vec<SoftError>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error and report it immediately
    pub fn record(&self, error: SoftError) {
        tracing::warn!(path = %error.path.display(), kind = ?error.kind, "{}", error.message);
        self.entries.lock().push(error);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Copy of everything recorded so far, in order
    pub fn snapshot(&self) -> Vec<SoftError> {
        self.entries.lock().clone()
    }

    pub fn into_inner(self) -> Vec<SoftError> {
        self.entries.into_inner()
    }
}
