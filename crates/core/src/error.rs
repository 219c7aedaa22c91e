//! Errors raised by object stores and ref updates

use crate::config::ConfigError;
use crate::hash::ObjectId;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not a cairn repository: {} (run 'cairn init')", .0.display())]
    NotARepository(PathBuf),

    #[error("repository already initialized at {}", .0.display())]
    AlreadyInitialized(PathBuf),

    #[error("invalid ref name {name:?}: {reason}")]
    InvalidRefName { name: String, reason: &'static str },

    /// The ref moved between the read at the start of a run and the update
    #[error(
        "ref {name} changed concurrently (expected {}, found {})",
        fmt_opt(.expected),
        fmt_opt(.actual)
    )]
    RefConflict {
        name: String,
        expected: Option<ObjectId>,
        actual: Option<ObjectId>,
    },

    #[error("ref {0} is locked by another writer")]
    RefLocked(String),

    #[error("object {0} is not in the store")]
    MissingObject(ObjectId),

    #[error("corrupt object data: {0}")]
    Corrupt(String),

    #[error("object writer is already closed")]
    WriterClosed,

    #[error("remote protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    /// True for a clean compare-and-swap mismatch
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::RefConflict { .. })
    }
}

fn fmt_opt(id: &Option<ObjectId>) -> String {
    match id {
        Some(id) => id.to_hex(),
        None => "nothing".to_string(),
    }
}
