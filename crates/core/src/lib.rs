//! Cairn Core - git-compatible content-addressed object store
//!
//! This crate provides the storage layer used by `cairn save`:
//! - SHA-1 object ids
//! - Blob/tree/commit encoding in git's object format
//! - On-disk repository with loose objects and compare-and-swap refs
//! - The remote protocol (client and server) over any byte stream

pub mod config;
pub mod error;
pub mod hash;
pub mod memory;
pub mod object;
pub mod refs;
pub mod remote;
pub mod store;

// Re-export main types for convenience
pub use config::{ChunkingConfig, ConfigError, RepoConfig, StoreConfig};
pub use error::StoreError;
pub use hash::ObjectId;
pub use memory::MemoryStore;
pub use object::{Commit, Mode, ObjectKind, Signature, TreeEntry};
pub use refs::RefName;
pub use remote::{Client, RemoteLocation};
pub use store::{ObjectStore, Repository, WriteStats};
