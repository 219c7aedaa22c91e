//! In-memory object store

use crate::error::StoreError;
use crate::hash::ObjectId;
use crate::object::{self, ObjectKind};
use crate::refs::RefName;
use crate::store::ObjectStore;
use ahash::AHashMap;

/// Per-kind write counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub blobs: usize,
    pub trees: usize,
    pub commits: usize,
}

/// Object store held entirely in memory
///
/// Counts every write call, including writes of objects it already holds, so
/// callers can observe how often they reach the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: AHashMap<ObjectId, (ObjectKind, Vec<u8>)>,
    refs: AHashMap<String, ObjectId>,
    counts: WriteCounts,
    fail_writes: bool,
    closed: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose object writes all fail
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn counts(&self) -> WriteCounts {
        self.counts
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn get(&self, id: &ObjectId) -> Option<(ObjectKind, &[u8])> {
        self.objects.get(id).map(|(kind, body)| (*kind, body.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Move a ref without any comparison
    pub fn set_ref(&mut self, name: &RefName, id: ObjectId) {
        self.refs.insert(name.as_str().to_string(), id);
    }
}

impl ObjectStore for MemoryStore {
    fn read_ref(&mut self, name: &RefName) -> Result<Option<ObjectId>, StoreError> {
        Ok(self.refs.get(name.as_str()).copied())
    }

    fn write_object(&mut self, kind: ObjectKind, body: &[u8]) -> Result<ObjectId, StoreError> {
        if self.fail_writes {
            return Err(StoreError::io(
                "memory store refused write",
                std::io::Error::new(std::io::ErrorKind::Other, "injected failure"),
            ));
        }
        if self.closed {
            return Err(StoreError::WriterClosed);
        }
        match kind {
            ObjectKind::Blob => self.counts.blobs += 1,
            ObjectKind::Tree => self.counts.trees += 1,
            ObjectKind::Commit => self.counts.commits += 1,
        }
        let id = object::object_id(kind, body);
        self.objects.entry(id).or_insert_with(|| (kind, body.to_vec()));
        Ok(id)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        Ok(())
    }

    fn update_ref(
        &mut self,
        name: &RefName,
        new: ObjectId,
        expected: Option<ObjectId>,
    ) -> Result<(), StoreError> {
        let actual = self.refs.get(name.as_str()).copied();
        if actual != expected {
            return Err(StoreError::RefConflict {
                name: name.to_string(),
                expected,
                actual,
            });
        }
        if !self.closed {
            return Err(StoreError::MissingObject(new));
        }
        self.refs.insert(name.as_str().to_string(), new);
        Ok(())
    }
}
