//! Content-defined chunking of file contents
//!
//! A rolling checksum over a 64-byte window cuts a boundary wherever its low
//! `blob_bits` bits are all ones, so an edit only disturbs the chunks around
//! it. A file that fits in one chunk is stored as a plain blob; anything
//! larger becomes a tree of chunk blobs named by their byte offset.

use cairn_core::{ChunkingConfig, Mode, ObjectId, ObjectStore, StoreError, TreeEntry};
use smallvec::SmallVec;
use std::io::{self, Read};
use thiserror::Error;

const WINDOW_BITS: u32 = 6;
const WINDOW_SIZE: usize = 1 << WINDOW_BITS;
const CHAR_OFFSET: u32 = 31;

/// Maximum entries in one chunk tree before it gains another level
pub const FANOUT: usize = 256;

const READ_BUFFER: usize = 64 * 1024;

/// Failure while encoding one file
#[derive(Error, Debug)]
pub enum EncodeError {
    /// The source could not be read; the file is skipped
    #[error("failed to read file contents: {0}")]
    Read(#[source] io::Error),

    /// The store rejected a write; the save cannot continue
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Rolling checksum in the rsync / bup style
#[derive(Clone)]
pub struct Rollsum {
    s1: u32,
    s2: u32,
    window: [u8; WINDOW_SIZE],
    offset: usize,
}

impl Default for Rollsum {
    fn default() -> Self {
        Self::new()
    }
}

impl Rollsum {
    pub fn new() -> Self {
        let window = WINDOW_SIZE as u32;
        Self {
            s1: window.wrapping_mul(CHAR_OFFSET),
            s2: window.wrapping_mul(window - 1).wrapping_mul(CHAR_OFFSET),
            window: [0; WINDOW_SIZE],
            offset: 0,
        }
    }

    #[inline]
    pub fn roll(&mut self, add: u8) {
        let drop = self.window[self.offset];
        self.window[self.offset] = add;
        self.offset = (self.offset + 1) & (WINDOW_SIZE - 1);

        self.s1 = self.s1.wrapping_add(add as u32).wrapping_sub(drop as u32);
        self.s2 = self.s2.wrapping_add(self.s1).wrapping_sub(
            (WINDOW_SIZE as u32).wrapping_mul((drop as u32).wrapping_add(CHAR_OFFSET)),
        );
    }

    #[inline]
    pub fn digest(&self) -> u32 {
        (self.s1 << 16) | (self.s2 & 0xffff)
    }
}

/// Splits a byte stream into chunks
pub struct Chunker {
    mask: u32,
    max_chunk: usize,
    sum: Rollsum,
    current: Vec<u8>,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        let bits = config.blob_bits.clamp(1, 31);
        Self {
            mask: (1u32 << bits) - 1,
            max_chunk: config.max_chunk_bytes.max(1),
            sum: Rollsum::new(),
            current: Vec::new(),
        }
    }

    /// Feed bytes, calling `emit` for every chunk that completes
    pub fn push<E>(
        &mut self,
        mut data: &[u8],
        emit: &mut impl FnMut(&[u8]) -> Result<(), E>,
    ) -> Result<(), E> {
        while !data.is_empty() {
            let mut cut = None;
            for (i, &byte) in data.iter().enumerate() {
                self.sum.roll(byte);
                let len = self.current.len() + i + 1;
                if self.sum.digest() & self.mask == self.mask || len >= self.max_chunk {
                    cut = Some(i + 1);
                    break;
                }
            }
            match cut {
                Some(n) => {
                    self.current.extend_from_slice(&data[..n]);
                    emit(&self.current)?;
                    self.current.clear();
                    self.sum = Rollsum::new();
                    data = &data[n..];
                }
                None => {
                    self.current.extend_from_slice(data);
                    data = &[];
                }
            }
        }
        Ok(())
    }

    /// Emit whatever is left over; returns true if anything was emitted
    pub fn finish<E>(mut self, emit: &mut impl FnMut(&[u8]) -> Result<(), E>) -> Result<bool, E> {
        if self.current.is_empty() {
            return Ok(false);
        }
        emit(&self.current)?;
        self.current.clear();
        Ok(true)
    }
}

/// Result of storing one file's contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoded {
    pub mode: Mode,
    pub id: ObjectId,
    pub size: u64,
    pub chunks: usize,
}

/// Chunk `reader` and store it as a blob or a chunk tree
pub fn encode_content<S, R>(
    store: &mut S,
    mut reader: R,
    config: &ChunkingConfig,
) -> Result<Encoded, EncodeError>
where
    S: ObjectStore + ?Sized,
    R: Read,
{
    let mut chunker = Chunker::new(config);
    // (offset, blob id) of every chunk; most files have exactly one
    let mut chunks: SmallVec<[(u64, ObjectId); 1]> = SmallVec::new();
    let mut size = 0u64;
    let mut emit = |chunk: &[u8]| -> Result<(), EncodeError> {
        let id = store.write_blob(chunk)?;
        chunks.push((size, id));
        size += chunk.len() as u64;
        Ok(())
    };

    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EncodeError::Read(e)),
        };
        chunker.push(&buffer[..n], &mut emit)?;
    }
    chunker.finish(&mut emit)?;

    match chunks.as_slice() {
        [] => {
            let id = store.write_blob(&[])?;
            Ok(Encoded {
                mode: Mode::Regular,
                id,
                size: 0,
                chunks: 1,
            })
        }
        [(_, id)] => Ok(Encoded {
            mode: Mode::Regular,
            id: *id,
            size,
            chunks: 1,
        }),
        _ => {
            let count = chunks.len();
            let entries = chunks
                .iter()
                .map(|&(offset, id)| (offset, Mode::Regular, id))
                .collect();
            let id = write_chunk_tree(store, entries)?;
            Ok(Encoded {
                mode: Mode::Directory,
                id,
                size,
                chunks: count,
            })
        }
    }
}

/// Write a chunk tree, nesting levels until each holds at most [`FANOUT`] entries
fn write_chunk_tree<S: ObjectStore + ?Sized>(
    store: &mut S,
    mut level: Vec<(u64, Mode, ObjectId)>,
) -> Result<ObjectId, StoreError> {
    while level.len() > FANOUT {
        let mut next = Vec::with_capacity(level.len().div_ceil(FANOUT));
        for group in level.chunks(FANOUT) {
            let id = store.write_tree(&tree_entries(group))?;
            next.push((group[0].0, Mode::Directory, id));
        }
        level = next;
    }
    store.write_tree(&tree_entries(&level))
}

fn tree_entries(group: &[(u64, Mode, ObjectId)]) -> Vec<TreeEntry> {
    group
        .iter()
        .map(|&(offset, mode, id)| TreeEntry::new(mode, format!("{offset:016x}"), id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_core::object::{object_id, parse_tree, ObjectKind};
    use cairn_core::MemoryStore;
    use rand::{RngCore, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        ChaCha8Rng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    fn chunk_lengths(data: &[u8], config: &ChunkingConfig, step: usize) -> Vec<usize> {
        let mut lengths = Vec::new();
        let mut chunker = Chunker::new(config);
        let mut emit = |c: &[u8]| -> Result<(), ()> {
            lengths.push(c.len());
            Ok(())
        };
        for piece in data.chunks(step) {
            chunker.push(piece, &mut emit).unwrap();
        }
        chunker.finish(&mut emit).unwrap();
        lengths
    }

    #[test]
    fn test_small_file_is_single_blob() {
        let mut store = MemoryStore::new();
        let encoded =
            encode_content(&mut store, &b"hello world\n"[..], &ChunkingConfig::default()).unwrap();

        assert_eq!(encoded.mode, Mode::Regular);
        assert_eq!(encoded.id, object_id(ObjectKind::Blob, b"hello world\n"));
        assert_eq!(encoded.size, 12);
        assert_eq!(encoded.chunks, 1);
    }

    #[test]
    fn test_empty_file() {
        let mut store = MemoryStore::new();
        let encoded = encode_content(&mut store, io::empty(), &ChunkingConfig::default()).unwrap();
        assert_eq!(encoded.id, object_id(ObjectKind::Blob, b""));
        assert_eq!(encoded.size, 0);
    }

    #[test]
    fn test_boundaries_ignore_read_sizes() {
        let data = random_bytes(200_000, 7);
        let config = ChunkingConfig {
            blob_bits: 10,
            ..ChunkingConfig::default()
        };

        let whole = chunk_lengths(&data, &config, data.len());
        let pieces = chunk_lengths(&data, &config, 333);
        assert_eq!(whole, pieces);
        assert!(whole.len() > 1);
        assert_eq!(whole.iter().sum::<usize>(), data.len());
    }

    #[test]
    fn test_max_chunk_caps_length() {
        let data = vec![0u8; 10_000];
        let config = ChunkingConfig {
            blob_bits: 20,
            max_chunk_bytes: 4096,
        };
        assert_eq!(chunk_lengths(&data, &config, 1000), vec![4096, 4096, 1808]);
    }

    #[test]
    fn test_large_file_becomes_chunk_tree() {
        let data = random_bytes(100_000, 1);
        let config = ChunkingConfig {
            blob_bits: 10,
            ..ChunkingConfig::default()
        };
        let mut store = MemoryStore::new();
        let encoded = encode_content(&mut store, data.as_slice(), &config).unwrap();

        assert_eq!(encoded.mode, Mode::Directory);
        assert_eq!(encoded.size, data.len() as u64);

        let (kind, body) = store.get(&encoded.id).unwrap();
        assert_eq!(kind, ObjectKind::Tree);
        let entries = parse_tree(body).unwrap();
        assert_eq!(entries.len(), encoded.chunks);
        assert_eq!(entries[0].name_lossy(), "0000000000000000");

        // Chunks concatenate back to the original bytes
        let mut rebuilt = Vec::new();
        for entry in &entries {
            rebuilt.extend_from_slice(store.get(&entry.id).unwrap().1);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_chunk_tree_fanout() {
        let data = vec![0u8; (FANOUT + 10) * 16];
        let config = ChunkingConfig {
            blob_bits: 20,
            max_chunk_bytes: 16,
        };
        let mut store = MemoryStore::new();
        let encoded = encode_content(&mut store, data.as_slice(), &config).unwrap();

        let top = parse_tree(store.get(&encoded.id).unwrap().1).unwrap();
        assert_eq!(top.len(), 2);
        assert!(top.iter().all(|e| e.mode == Mode::Directory));
        assert_eq!(top[1].name_lossy(), format!("{:016x}", FANOUT * 16));
    }

    #[test]
    fn test_read_error_is_distinct() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "bad sector"))
            }
        }
        let mut store = MemoryStore::new();
        let result = encode_content(&mut store, Broken, &ChunkingConfig::default());
        assert!(matches!(result, Err(EncodeError::Read(_))));
    }

    #[test]
    fn test_store_error_is_distinct() {
        let mut store = MemoryStore::failing();
        let result = encode_content(&mut store, &b"data"[..], &ChunkingConfig::default());
        assert!(matches!(result, Err(EncodeError::Store(_))));
    }
}
