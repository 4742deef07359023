use crate::core::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// A single mutation recorded by a storage engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    Put { key: String, value: JsonValue },
    Delete { key: String },
    Clear,
}

impl JournalEntry {
    /// Applies the entry to an in-memory image of the store.
    pub fn apply(self, entries: &mut BTreeMap<String, JsonValue>) {
        match self {
            JournalEntry::Put { key, value } => {
                entries.insert(key, value);
            }
            JournalEntry::Delete { key } => {
                entries.remove(&key);
            }
            JournalEntry::Clear => entries.clear(),
        }
    }
}

/// Durable medium underneath a `PersistentMap`.
///
/// The map keeps the authoritative in-memory image; an engine only has to
/// reproduce it on `load` from whatever it has written so far.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reads back every stored entry.
    async fn load(&mut self) -> Result<BTreeMap<String, JsonValue>>;

    async fn append(&mut self, entry: &JournalEntry) -> Result<()>;

    /// Replaces the stored state with `entries` and resets the journal.
    async fn compact(&mut self, entries: &BTreeMap<String, JsonValue>) -> Result<()>;

    /// Entries appended since the last compaction.
    fn journal_len(&self) -> usize;

    async fn close(&mut self) -> Result<()>;
}

/// Engine that keeps nothing beyond the process lifetime.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    seed: BTreeMap<String, JsonValue>,
    appended: usize,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine that loads `seed` on open.
    pub fn with_entries(seed: BTreeMap<String, JsonValue>) -> Self {
        Self { seed, appended: 0 }
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&mut self) -> Result<BTreeMap<String, JsonValue>> {
        Ok(std::mem::take(&mut self.seed))
    }

    async fn append(&mut self, _entry: &JournalEntry) -> Result<()> {
        self.appended += 1;
        Ok(())
    }

    async fn compact(&mut self, _entries: &BTreeMap<String, JsonValue>) -> Result<()> {
        self.appended = 0;
        Ok(())
    }

    fn journal_len(&self) -> usize {
        self.appended
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
