//! Snapshot + journal persistence for the object store

use crate::config::DurabilityMode;
use crate::core::error::{io_error, serde_error};
use crate::core::{GraphError, Result};
use crate::storage::engine::{JournalEntry, StorageEngine};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{Level, event};

pub const SNAPSHOT_FILE: &str = "graph_snapshot.json";
pub const JOURNAL_FILE: &str = "graph_journal.wal";
const SNAPSHOT_FORMAT_VERSION: u32 = 1;

// ============================================================================
// Snapshot
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub metadata: SnapshotMetadata,
    pub entries: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub entry_count: usize,
}

impl StoreSnapshot {
    pub fn new(entries: BTreeMap<String, JsonValue>) -> Self {
        Self {
            version: SNAPSHOT_FORMAT_VERSION,
            metadata: SnapshotMetadata {
                created_at: Utc::now(),
                entry_count: entries.len(),
            },
            entries,
        }
    }
}

// ============================================================================
// Journal framing
// ============================================================================

/// Encodes an entry as a little-endian u32 length followed by MessagePack bytes.
pub fn encode_frame(entry: &JournalEntry) -> Result<Vec<u8>> {
    let payload =
        rmp_serde::to_vec(entry).map_err(|e| serde_error("Failed to serialize journal entry", e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| GraphError::Serialization("journal entry too large".to_string()))?;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes every complete frame in `bytes`.
///
/// A truncated final frame, as left by a crash mid-append, is dropped; a
/// complete frame that fails to decode is an error.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<JournalEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if bytes.len() - offset < 4 {
            event!(Level::WARN, offset, "dropping torn journal frame header");
            break;
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        let start = offset + 4;
        if bytes.len() - start < len {
            event!(Level::WARN, offset, len, "dropping torn journal frame");
            break;
        }
        let entry: JournalEntry = rmp_serde::from_slice(&bytes[start..start + len])
            .map_err(|e| serde_error("Failed to deserialize journal entry", e))?;
        entries.push(entry);
        offset = start + len;
    }
    Ok(entries)
}

// ============================================================================
// File engine
// ============================================================================

/// Stores entries as a JSON snapshot plus an append-only journal.
pub struct FileEngine {
    root_dir: PathBuf,
    durability: DurabilityMode,
    journal: Option<BufWriter<File>>,
    entries_since_compaction: usize,
}

impl FileEngine {
    pub fn new<P: AsRef<Path>>(root_dir: P, durability: DurabilityMode) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
            durability,
            journal: None,
            entries_since_compaction: 0,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root_dir.join(SNAPSHOT_FILE)
    }

    fn journal_path(&self) -> PathBuf {
        self.root_dir.join(JOURNAL_FILE)
    }

    async fn read_snapshot(&self) -> Result<Option<StoreSnapshot>> {
        let path = self.snapshot_path();
        if !fs::try_exists(&path)
            .await
            .map_err(|e| io_error("Failed to stat snapshot", e))?
        {
            return Ok(None);
        }
        let data = fs::read(&path)
            .await
            .map_err(|e| io_error("Failed to read snapshot", e))?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&data)
            .map_err(|e| serde_error("Failed to deserialize snapshot", e))?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(GraphError::Serialization(format!(
                "Unsupported snapshot format version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    async fn read_journal(&self) -> Result<Vec<JournalEntry>> {
        let path = self.journal_path();
        if !fs::try_exists(&path)
            .await
            .map_err(|e| io_error("Failed to stat journal", e))?
        {
            return Ok(Vec::new());
        }
        let data = fs::read(&path)
            .await
            .map_err(|e| io_error("Failed to read journal", e))?;
        decode_frames(&data)
    }

    async fn open_journal(&mut self, truncate: bool) -> Result<()> {
        if self.durability == DurabilityMode::None {
            return Ok(());
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options
            .open(self.journal_path())
            .await
            .map_err(|e| io_error("Failed to open journal", e))?;
        self.journal = Some(BufWriter::new(file));
        Ok(())
    }

    async fn write_snapshot(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let temp_path = self.snapshot_path().with_extension("tmp");
        let serialized = serde_json::to_vec(snapshot)
            .map_err(|e| serde_error("Failed to serialize snapshot", e))?;
        let mut file = File::create(&temp_path)
            .await
            .map_err(|e| io_error("Failed to create temp snapshot", e))?;
        file.write_all(&serialized)
            .await
            .map_err(|e| io_error("Failed to write snapshot", e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("Failed to sync snapshot", e))?;
        fs::rename(&temp_path, self.snapshot_path())
            .await
            .map_err(|e| io_error("Failed to rename snapshot", e))?;
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for FileEngine {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn load(&mut self) -> Result<BTreeMap<String, JsonValue>> {
        fs::create_dir_all(&self.root_dir)
            .await
            .map_err(|e| io_error("Failed to create store directory", e))?;

        let mut entries = self
            .read_snapshot()
            .await?
            .map(|snapshot| snapshot.entries)
            .unwrap_or_default();
        let journal = self.read_journal().await?;
        self.entries_since_compaction = journal.len();
        for entry in journal {
            entry.apply(&mut entries);
        }

        self.open_journal(false).await?;
        event!(
            Level::DEBUG,
            dir = %self.root_dir.display(),
            entries = entries.len(),
            replayed = self.entries_since_compaction,
            "file engine loaded"
        );
        Ok(entries)
    }

    async fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        self.entries_since_compaction += 1;
        if self.durability == DurabilityMode::None {
            return Ok(());
        }
        let frame = encode_frame(entry)?;
        let journal = self
            .journal
            .as_mut()
            .ok_or_else(|| GraphError::Io("journal is not open".to_string()))?;
        journal
            .write_all(&frame)
            .await
            .map_err(|e| io_error("Failed to write journal", e))?;
        journal
            .flush()
            .await
            .map_err(|e| io_error("Failed to flush journal", e))?;
        if self.durability == DurabilityMode::Sync {
            journal
                .get_mut()
                .sync_all()
                .await
                .map_err(|e| io_error("Failed to sync journal", e))?;
        }
        Ok(())
    }

    async fn compact(&mut self, entries: &BTreeMap<String, JsonValue>) -> Result<()> {
        self.write_snapshot(&StoreSnapshot::new(entries.clone()))
            .await?;
        self.journal = None;
        if self.durability != DurabilityMode::None {
            self.open_journal(true).await?;
        } else if fs::try_exists(self.journal_path())
            .await
            .map_err(|e| io_error("Failed to stat journal", e))?
        {
            // Entries left by an earlier journaled run are already in the snapshot.
            fs::remove_file(self.journal_path())
                .await
                .map_err(|e| io_error("Failed to remove journal", e))?;
        }
        self.entries_since_compaction = 0;
        event!(Level::DEBUG, entries = entries.len(), "journal compacted into snapshot");
        Ok(())
    }

    fn journal_len(&self) -> usize {
        self.entries_since_compaction
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut journal) = self.journal.take() {
            journal
                .flush()
                .await
                .map_err(|e| io_error("Failed to flush journal", e))?;
            journal
                .get_mut()
                .sync_all()
                .await
                .map_err(|e| io_error("Failed to sync journal", e))?;
        }
        Ok(())
    }
}
