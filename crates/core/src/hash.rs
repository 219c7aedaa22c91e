//! SHA-1 object identifiers for the git-compatible object store

use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;

/// Length of a raw object id in bytes
pub const OID_LEN: usize = 20;

/// A SHA-1 object id (20 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ObjectId([u8; OID_LEN]);

/// Error returned when parsing a malformed hex object id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid object id {input:?}: {reason}")]
pub struct ParseOidError {
    input: String,
    reason: &'static str,
}

impl ObjectId {
    /// Create an id from raw bytes
    pub const fn from_bytes(bytes: [u8; OID_LEN]) -> Self {
        Self(bytes)
    }

    /// Create an id from a raw slice, as found inside tree objects
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; OID_LEN] = bytes.try_into().ok()?;
        Some(Self(raw))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; OID_LEN] {
        &self.0
    }

    /// Lowercase hex encoding (40 characters)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 40 character hex string
    pub fn from_hex(input: &str) -> Result<Self, ParseOidError> {
        if input.len() != OID_LEN * 2 {
            return Err(ParseOidError {
                input: input.to_string(),
                reason: "expected 40 hex characters",
            });
        }
        let mut bytes = [0u8; OID_LEN];
        hex::decode_to_slice(input, &mut bytes).map_err(|_| ParseOidError {
            input: input.to_string(),
            reason: "not a hex string",
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = ParseOidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Hash raw bytes with SHA-1
pub fn hash_bytes(data: &[u8]) -> ObjectId {
    let mut hasher = IncrementalHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Incremental hasher producing an [`ObjectId`]
#[derive(Default)]
pub struct IncrementalHasher {
    inner: Sha1,
}

impl IncrementalHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> ObjectId {
        let digest = self.inner.finalize();
        let mut bytes = [0u8; OID_LEN];
        bytes.copy_from_slice(&digest);
        ObjectId(bytes)
    }
}
