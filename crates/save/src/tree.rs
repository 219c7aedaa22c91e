//! Snapshot tree assembled from a flat stream of files
//!
//! Construction and hashing are split in two types. A [`TreeBuilder`] is
//! mutable and only grows; [`TreeBuilder::freeze`] turns it into a
//! [`FrozenTree`] that can no longer change and computes each directory's
//! tree id at most once.
//!
//! Directories live in an arena and refer to their parent by [`NodeId`].

use cairn_core::{Mode, ObjectId, ObjectStore, StoreError, TreeEntry};
use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// A path that cannot be placed in the tree
///
/// Messages leave the path out; it is carried alongside for the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("path names no file")]
    EmptyPath(PathBuf),

    #[error("'..' climbs above the top of the tree")]
    ParentComponent(PathBuf),

    #[error("a parent directory was already saved as a file")]
    NotADirectory(PathBuf),

    #[error("already saved as a directory")]
    IsADirectory(PathBuf),
}

impl TreeError {
    pub fn path(&self) -> &Path {
        match self {
            TreeError::EmptyPath(path)
            | TreeError::ParentComponent(path)
            | TreeError::NotADirectory(path)
            | TreeError::IsADirectory(path) => path,
        }
    }
}

/// Index of a directory node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

#[derive(Debug, Clone)]
enum Child {
    Dir(NodeId),
    File(TreeEntry),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    name: Vec<u8>,
    children: BTreeMap<Vec<u8>, Child>,
}

/// Result of looking a path up in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Directory(NodeId),
    File(&'a TreeEntry),
}

#[derive(Debug, Clone)]
struct Arena {
    nodes: Vec<Node>,
}

impl Arena {
    fn new() -> Self {
        Self {
            nodes: vec![Node {
                parent: None,
                name: Vec::new(),
                children: BTreeMap::new(),
            }],
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn full_path(&self, id: NodeId) -> PathBuf {
        let mut names = Vec::new();
        let mut current = Some(id);
        while let Some(id) = current {
            let node = self.node(id);
            if node.parent.is_some() {
                names.push(name_path(&node.name));
            }
            current = node.parent;
        }
        names.iter().rev().collect()
    }

    fn lookup(&self, path: &Path) -> Option<Lookup<'_>> {
        let parts = normalize(path).ok()?;
        let mut current = NodeId::ROOT;
        let mut iter = parts.iter().peekable();
        while let Some(part) = iter.next() {
            match self.node(current).children.get(part)? {
                Child::Dir(id) => current = *id,
                Child::File(entry) if iter.peek().is_none() => return Some(Lookup::File(entry)),
                Child::File(_) => return None,
            }
        }
        Some(Lookup::Directory(current))
    }
}

/// Split a path into tree components
///
/// Leading separators and `.` are dropped and `..` cancels the component
/// before it, so `/a/./b`, `a/b/`, and `a/x/../b` all name the same place;
/// an empty result is the root. A `..` with nothing left to cancel is an
/// error.
pub fn normalize(path: &Path) -> Result<Vec<Vec<u8>>, TreeError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                parts
                    .pop()
                    .ok_or_else(|| TreeError::ParentComponent(path.to_path_buf()))?;
            }
            Component::Normal(name) => parts.push(name_bytes(name)),
        }
    }
    Ok(parts)
}

#[cfg(unix)]
fn name_bytes(name: &OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn name_bytes(name: &OsStr) -> Vec<u8> {
    name.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn name_path(name: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(OsStr::from_bytes(name))
}

#[cfg(not(unix))]
fn name_path(name: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(name).into_owned())
}

/// Mutable tree under construction
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    arena: Arena,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self { arena: Arena::new() }
    }

    /// Number of directory nodes, root included
    pub fn len(&self) -> usize {
        self.arena.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.node(NodeId::ROOT).children.is_empty()
    }

    /// Find or create the directory node for `dir`
    ///
    /// Missing intermediate directories are created in order.
    pub fn resolve_directory(&mut self, dir: &Path) -> Result<NodeId, TreeError> {
        let parts = normalize(dir)?;
        self.resolve_parts(&parts, dir)
    }

    fn resolve_parts(&mut self, parts: &[Vec<u8>], path: &Path) -> Result<NodeId, TreeError> {
        let mut current = NodeId::ROOT;
        for part in parts {
            current = match self.arena.node(current).children.get(part) {
                Some(Child::Dir(id)) => *id,
                Some(Child::File(_)) => return Err(TreeError::NotADirectory(path.to_path_buf())),
                None => {
                    let id = NodeId(self.arena.nodes.len());
                    self.arena.nodes.push(Node {
                        parent: Some(current),
                        name: part.clone(),
                        children: BTreeMap::new(),
                    });
                    self.arena.nodes[current.0]
                        .children
                        .insert(part.clone(), Child::Dir(id));
                    id
                }
            };
        }
        Ok(current)
    }

    /// Insert a file entry at `path`
    ///
    /// An existing file at the same path is replaced and returned. A
    /// directory at that path is kept and the insert is rejected.
    pub fn add_file(
        &mut self,
        path: &Path,
        mode: Mode,
        id: ObjectId,
    ) -> Result<Option<TreeEntry>, TreeError> {
        let mut parts = normalize(path)?;
        let leaf = parts
            .pop()
            .ok_or_else(|| TreeError::EmptyPath(path.to_path_buf()))?;
        let dir = self.resolve_parts(&parts, path)?;

        let children = &mut self.arena.nodes[dir.0].children;
        if let Some(Child::Dir(_)) = children.get(&leaf) {
            return Err(TreeError::IsADirectory(path.to_path_buf()));
        }
        let entry = TreeEntry::new(mode, leaf.clone(), id);
        match children.insert(leaf, Child::File(entry)) {
            Some(Child::File(previous)) => Ok(Some(previous)),
            _ => Ok(None),
        }
    }

    pub fn lookup(&self, path: &Path) -> Option<Lookup<'_>> {
        self.arena.lookup(path)
    }

    pub fn full_path(&self, node: NodeId) -> PathBuf {
        self.arena.full_path(node)
    }

    /// Stop accepting files and prepare for hashing
    pub fn freeze(self) -> FrozenTree {
        let ids = (0..self.arena.nodes.len()).map(|_| OnceCell::new()).collect();
        FrozenTree {
            arena: self.arena,
            ids,
        }
    }
}

/// Immutable tree whose directory ids are computed lazily, once each
#[derive(Debug)]
pub struct FrozenTree {
    arena: Arena,
    ids: Vec<OnceCell<ObjectId>>,
}

impl FrozenTree {
    pub fn lookup(&self, path: &Path) -> Option<Lookup<'_>> {
        self.arena.lookup(path)
    }

    pub fn full_path(&self, node: NodeId) -> PathBuf {
        self.arena.full_path(node)
    }

    /// Id of `node` if it has been generated already
    pub fn id(&self, node: NodeId) -> Option<ObjectId> {
        self.ids[node.0].get().copied()
    }

    /// Write the whole tree and return the root id
    pub fn generate<S: ObjectStore + ?Sized>(&self, store: &mut S) -> Result<ObjectId, StoreError> {
        self.generate_node(NodeId::ROOT, store)
    }

    /// Write `node` and every subdirectory below it, children first
    ///
    /// Nodes that already have an id are not written again.
    pub fn generate_node<S: ObjectStore + ?Sized>(
        &self,
        node: NodeId,
        store: &mut S,
    ) -> Result<ObjectId, StoreError> {
        if let Some(id) = self.ids[node.0].get() {
            return Ok(*id);
        }

        let children = &self.arena.node(node).children;
        let mut entries = Vec::with_capacity(children.len());
        for (name, child) in children {
            let entry = match child {
                Child::File(entry) => entry.clone(),
                Child::Dir(sub) => {
                    TreeEntry::new(Mode::Directory, name.clone(), self.generate_node(*sub, store)?)
                }
            };
            entries.push(entry);
        }

        let id = store.write_tree(&entries)?;
        tracing::debug!(path = %self.full_path(node).display(), %id, "tree written");
        Ok(*self.ids[node.0].get_or_init(|| id))
    }
}
