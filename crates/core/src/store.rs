//! Object store capability set and the on-disk repository

use crate::config::RepoConfig;
use crate::error::StoreError;
use crate::hash::ObjectId;
use crate::object::{self, Commit, ObjectKind, TreeEntry};
use crate::refs::{self, RefName};
use ahash::AHashSet;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Everything a save needs from a store, local or remote
///
/// Object writes may be buffered; [`ObjectStore::close`] is the durability
/// barrier and must complete before [`ObjectStore::update_ref`] can see the
/// new objects.
pub trait ObjectStore {
    /// Current value of a ref
    fn read_ref(&mut self, name: &RefName) -> Result<Option<ObjectId>, StoreError>;

    /// Store one object body and return its id
    fn write_object(&mut self, kind: ObjectKind, body: &[u8]) -> Result<ObjectId, StoreError>;

    /// Flush everything written so far; further writes fail
    fn close(&mut self) -> Result<(), StoreError>;

    /// Compare-and-swap a ref from `expected` to `new`
    fn update_ref(
        &mut self,
        name: &RefName,
        new: ObjectId,
        expected: Option<ObjectId>,
    ) -> Result<(), StoreError>;

    fn write_blob(&mut self, data: &[u8]) -> Result<ObjectId, StoreError> {
        self.write_object(ObjectKind::Blob, data)
    }

    fn write_tree(&mut self, entries: &[TreeEntry]) -> Result<ObjectId, StoreError> {
        self.write_object(ObjectKind::Tree, &object::encode_tree(entries))
    }

    fn write_commit(&mut self, commit: &Commit) -> Result<ObjectId, StoreError> {
        self.write_object(ObjectKind::Commit, &commit.encode())
    }
}

impl<S: ObjectStore + ?Sized> ObjectStore for Box<S> {
    fn read_ref(&mut self, name: &RefName) -> Result<Option<ObjectId>, StoreError> {
        (**self).read_ref(name)
    }

    fn write_object(&mut self, kind: ObjectKind, body: &[u8]) -> Result<ObjectId, StoreError> {
        (**self).write_object(kind, body)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        (**self).close()
    }

    fn update_ref(
        &mut self,
        name: &RefName,
        new: ObjectId,
        expected: Option<ObjectId>,
    ) -> Result<(), StoreError> {
        (**self).update_ref(name, new, expected)
    }
}

/// Counters for objects handled by a writer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    /// New objects written to disk
    pub objects_written: u64,
    /// Objects skipped because they were already stored
    pub objects_deduplicated: u64,
    /// Uncompressed bytes of new objects
    pub bytes_written: u64,
}

struct PendingObject {
    id: ObjectId,
    kind: ObjectKind,
    body: Vec<u8>,
}

/// On-disk repository
///
/// Manages the repository directory structure:
/// ```text
/// <repo>/
///   config.toml
///   objects/
///     ab/cdef0123...   (zlib-compressed loose objects)
///   refs/
///     heads/
/// ```
pub struct Repository {
    root: PathBuf,
    config: RepoConfig,
    pending: Vec<PendingObject>,
    pending_ids: AHashSet<ObjectId>,
    pending_bytes: usize,
    closed: bool,
    stats: WriteStats,
}

impl Repository {
    /// Create a new repository at `root`
    pub fn init(root: &Path) -> Result<Self, StoreError> {
        if root.join("objects").is_dir() {
            return Err(StoreError::AlreadyInitialized(root.to_path_buf()));
        }
        for dir in ["objects", "refs/heads"] {
            std::fs::create_dir_all(root.join(dir))
                .map_err(|e| StoreError::io(format!("failed to create {dir}"), e))?;
        }
        let config = RepoConfig::default();
        atomic_write(&root.join("config.toml"), config.to_toml()?.as_bytes())?;

        tracing::info!(root = %root.display(), "initialized repository");
        Ok(Self::with_config(root.to_path_buf(), config))
    }

    /// Open an existing repository
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        if !root.join("objects").is_dir() || !root.join("refs").is_dir() {
            return Err(StoreError::NotARepository(root.to_path_buf()));
        }
        let config = RepoConfig::load(&root.join("config.toml"))?;
        Ok(Self::with_config(root.to_path_buf(), config))
    }

    fn with_config(root: PathBuf, config: RepoConfig) -> Self {
        Self {
            root,
            config,
            pending: Vec::new(),
            pending_ids: AHashSet::new(),
            pending_bytes: 0,
            closed: false,
            stats: WriteStats::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn stats(&self) -> WriteStats {
        self.stats
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    /// True if the object is on disk or waiting to be flushed
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.pending_ids.contains(id) || self.object_path(id).is_file()
    }

    /// Read an object that has already been flushed
    pub fn read_object(&self, id: &ObjectId) -> Result<(ObjectKind, Vec<u8>), StoreError> {
        let path = self.object_path(id);
        let compressed = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MissingObject(*id))
            }
            Err(e) => return Err(StoreError::io(format!("failed to read object {id}"), e)),
        };
        let mut frame = Vec::new();
        ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut frame)
            .map_err(|e| StoreError::Corrupt(format!("object {id}: {e}")))?;
        let (kind, body) = object::split_frame(&frame)?;
        if object::object_id(kind, body) != *id {
            return Err(StoreError::Corrupt(format!("object {id} fails its checksum")));
        }
        Ok((kind, body.to_vec()))
    }

    /// Ids of every flushed object, used to sync a remote client's index
    pub fn list_objects(&self) -> Result<Vec<ObjectId>, StoreError> {
        let objects = self.root.join("objects");
        let read_dir = |dir: &Path| {
            std::fs::read_dir(dir)
                .map_err(|e| StoreError::io(format!("failed to list {}", dir.display()), e))
        };

        let mut ids = Vec::new();
        for fanout in read_dir(&objects)? {
            let fanout = fanout.map_err(|e| StoreError::io("failed to list objects", e))?;
            let prefix = fanout.file_name().to_string_lossy().into_owned();
            if prefix.len() != 2 || !fanout.path().is_dir() {
                continue;
            }
            for entry in read_dir(&fanout.path())? {
                let entry = entry.map_err(|e| StoreError::io("failed to list objects", e))?;
                let rest = entry.file_name().to_string_lossy().into_owned();
                // Skips in-flight temp files
                if let Ok(id) = ObjectId::from_hex(&format!("{prefix}{rest}")) {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }

    /// Write pending objects to disk without closing the writer
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let level = Compression::new(self.config.store.compression_level);
        let pending = std::mem::take(&mut self.pending);
        tracing::debug!(count = pending.len(), bytes = self.pending_bytes, "flushing objects");

        for object in &pending {
            let path = self.object_path(&object.id);
            if path.is_file() {
                continue;
            }
            let mut encoder = ZlibEncoder::new(Vec::new(), level);
            encoder
                .write_all(&object::frame_header(object.kind, object.body.len()))
                .and_then(|_| encoder.write_all(&object.body))
                .map_err(|e| StoreError::io("failed to compress object", e))?;
            let compressed = encoder
                .finish()
                .map_err(|e| StoreError::io("failed to compress object", e))?;

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::io("failed to create object directory", e))?;
            }
            atomic_write(&path, &compressed)?;
        }

        self.pending_ids.clear();
        self.pending_bytes = 0;
        Ok(())
    }
}

impl ObjectStore for Repository {
    fn read_ref(&mut self, name: &RefName) -> Result<Option<ObjectId>, StoreError> {
        refs::read_ref(&self.root, name)
    }

    fn write_object(&mut self, kind: ObjectKind, body: &[u8]) -> Result<ObjectId, StoreError> {
        if self.closed {
            return Err(StoreError::WriterClosed);
        }
        let id = object::object_id(kind, body);
        if self.contains(&id) {
            self.stats.objects_deduplicated += 1;
            return Ok(id);
        }

        self.pending.push(PendingObject {
            id,
            kind,
            body: body.to_vec(),
        });
        self.pending_ids.insert(id);
        self.pending_bytes += body.len();
        self.stats.objects_written += 1;
        self.stats.bytes_written += body.len() as u64;
        tracing::trace!(%id, %kind, len = body.len(), "object queued");

        if self.pending_bytes >= self.config.store.flush_threshold_bytes {
            self.flush()?;
        }
        Ok(id)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.closed = true;
        tracing::info!(
            written = self.stats.objects_written,
            deduplicated = self.stats.objects_deduplicated,
            "object writer closed"
        );
        Ok(())
    }

    fn update_ref(
        &mut self,
        name: &RefName,
        new: ObjectId,
        expected: Option<ObjectId>,
    ) -> Result<(), StoreError> {
        let repo = &*self;
        refs::update_ref(&self.root, name, new, expected, |id| {
            // Reads from disk only, so an unflushed commit is reported missing
            match repo.read_object(&id)? {
                (ObjectKind::Commit, _) => Ok(()),
                (kind, _) => Err(StoreError::Corrupt(format!(
                    "ref {name} must point at a commit, {id} is a {kind}"
                ))),
            }
        })
    }
}

/// Atomic write helper
///
/// Writes data to a temporary file in the target's directory, fsyncs it,
/// then renames it over the target.
pub fn atomic_write(target: &Path, data: &[u8]) -> Result<(), StoreError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)
        .map_err(|e| {
            StoreError::io(format!("failed to create temp file in {}", dir.display()), e)
        })?;
    tmp.write_all(data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| StoreError::io("failed to write temp file", e))?;
    tmp.persist(target)
        .map_err(|e| StoreError::io(format!("failed to persist {}", target.display()), e.error))?;
    Ok(())
}
