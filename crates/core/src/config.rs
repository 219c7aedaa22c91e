//! Repository configuration (`<repo>/config.toml`)

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors raised while loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level repository configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub chunking: ChunkingConfig,
    pub store: StoreConfig,
}

/// Content-defined chunking parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// A boundary is cut where this many low digest bits are all ones (13 = ~8 KiB chunks)
    pub blob_bits: u32,
    /// Hard upper bound on a single chunk
    pub max_chunk_bytes: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            blob_bits: 13,
            max_chunk_bytes: 1024 * 1024,
        }
    }
}

/// Object store tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// zlib level for loose objects (0-9)
    pub compression_level: u32,
    /// Pending bytes buffered by a writer before it flushes on its own
    pub flush_threshold_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compression_level: 1,
            flush_threshold_bytes: 16 * 1024 * 1024,
        }
    }
}

impl RepoConfig {
    /// Load configuration, falling back to defaults when the file is absent
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(4..=24).contains(&self.chunking.blob_bits) {
            return Err(ConfigError::Invalid(format!(
                "chunking.blob_bits must be between 4 and 24, got {}",
                self.chunking.blob_bits
            )));
        }
        if self.chunking.max_chunk_bytes == 0 {
            return Err(ConfigError::Invalid(
                "chunking.max_chunk_bytes must be positive".into(),
            ));
        }
        if self.store.compression_level > 9 {
            return Err(ConfigError::Invalid(format!(
                "store.compression_level must be 0-9, got {}",
                self.store.compression_level
            )));
        }
        if self.store.flush_threshold_bytes == 0 {
            return Err(ConfigError::Invalid(
                "store.flush_threshold_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}
