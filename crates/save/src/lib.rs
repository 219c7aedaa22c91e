//! Cairn Save - snapshot a set of paths into an object store
//!
//! The pieces, leaves first:
//! - [`expand`]: turns input paths into a flat stream of files
//! - [`hashsplit`]: chunks file contents into blobs
//! - [`tree`]: assembles the nested snapshot tree and hashes it
//! - [`save`]: drives all of the above and updates the backup ref
//!
//! Works against any [`cairn_core::ObjectStore`], local or remote.

pub mod errors;
pub mod expand;
pub mod hashsplit;
pub mod save;
pub mod tree;

pub use errors::{ErrorLog, SoftError, SoftErrorKind};
pub use expand::{ExpandError, FileKind, FileStatus, PathExpander};
pub use hashsplit::{encode_content, EncodeError, Encoded};
pub use save::{save, SaveError, SaveOptions, SaveProgress, SaveReport, SaveSession, SaveState};
pub use tree::{FrozenTree, Lookup, NodeId, TreeBuilder, TreeError};
