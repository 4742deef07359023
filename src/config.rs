use crate::core::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How eagerly journal appends reach the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// fsync after every append.
    Sync,
    /// Flush to the OS after every append.
    #[default]
    Async,
    /// No journal; state reaches disk only when a snapshot is written.
    None,
}

/// Options that change how the record codec treats undeclared fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecOptions {
    /// Skip fields that have no policy instead of failing with `MissingFieldPolicy`.
    #[serde(default)]
    pub ignore_missing_fields: bool,
}

/// Object store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the snapshot and journal; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,

    pub durability: DurabilityMode,

    /// Journal entries written before the journal is folded into a snapshot
    pub compact_after_ops: usize,

    /// Keep running on an in-memory engine when the durable store cannot be opened
    pub fallback_to_memory: bool,

    pub codec: CodecOptions,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            durability: DurabilityMode::default(),
            compact_after_ops: 256,
            fallback_to_memory: true,
            codec: CodecOptions::default(),
        }
    }
}

impl StoreConfig {
    /// In-memory store configuration
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Durable store rooted at `data_dir`
    pub fn on_disk(data_dir: impl AsRef<Path>) -> Self {
        Self {
            data_dir: Some(data_dir.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Parse a JSON configuration document; missing keys take their defaults
    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input)
            .map_err(|e| GraphError::Serialization(format!("invalid store config: {}", e)))
    }

    /// Set the durability mode
    pub fn durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    /// Set the journal compaction threshold
    pub fn compact_after_ops(mut self, ops: usize) -> Self {
        self.compact_after_ops = ops.max(1);
        self
    }

    /// Enable or disable the in-memory fallback
    pub fn fallback_to_memory(mut self, enabled: bool) -> Self {
        self.fallback_to_memory = enabled;
        self
    }

    /// Skip undeclared fields while encoding, decoding and duplicating
    pub fn ignore_missing_fields(mut self, ignore: bool) -> Self {
        self.codec.ignore_missing_fields = ignore;
        self
    }
}
