//! Asynchronous, ordered, durable key→value map.

use crate::config::StoreConfig;
use crate::core::{GraphError, Result};
use crate::storage::engine::{JournalEntry, MemoryEngine, StorageEngine};
use crate::storage::persistence::FileEngine;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{Level, event};

/// Lifecycle of a [`PersistentMap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MapState {
    Unopened,
    Opening,
    Open,
    Closed,
    /// Opening failed; the map is unusable for the rest of its life.
    Failed(String),
}

struct MapInner {
    engine: Box<dyn StorageEngine>,
    cache: BTreeMap<String, JsonValue>,
}

/// Key→value map over a [`StorageEngine`], with the whole key set cached on open.
///
/// Every operation opens the map first if nobody has yet; callers arriving
/// while an open is in progress wait for it. Operations after [`close`] fail
/// with [`GraphError::StoreClosed`].
///
/// [`close`]: PersistentMap::close
pub struct PersistentMap {
    inner: Mutex<MapInner>,
    state: StdMutex<MapState>,
    compact_after_ops: usize,
}

impl PersistentMap {
    pub fn new(engine: Box<dyn StorageEngine>, compact_after_ops: usize) -> Self {
        Self {
            inner: Mutex::new(MapInner {
                engine,
                cache: BTreeMap::new(),
            }),
            state: StdMutex::new(MapState::Unopened),
            compact_after_ops: compact_after_ops.max(1),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryEngine::new()), usize::MAX)
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        let engine: Box<dyn StorageEngine> = match &config.data_dir {
            Some(dir) => Box::new(FileEngine::new(dir, config.durability)),
            None => Box::new(MemoryEngine::new()),
        };
        Self::new(engine, config.compact_after_ops)
    }

    pub fn state(&self) -> MapState {
        self.state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_state(&self, next: MapState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = next;
    }

    async fn ensure_open(&self) -> Result<MutexGuard<'_, MapInner>> {
        let mut inner = self.inner.lock().await;
        match self.state() {
            MapState::Open => return Ok(inner),
            MapState::Closed => return Err(GraphError::StoreClosed),
            MapState::Failed(reason) => return Err(GraphError::StoreInit(reason)),
            MapState::Unopened | MapState::Opening => {}
        }

        self.set_state(MapState::Opening);
        match inner.engine.load().await {
            Ok(entries) => {
                event!(
                    Level::DEBUG,
                    engine = inner.engine.name(),
                    keys = entries.len(),
                    "persistent map opened"
                );
                inner.cache = entries;
                self.set_state(MapState::Open);
                Ok(inner)
            }
            Err(err) => {
                let reason = err.to_string();
                event!(Level::ERROR, engine = inner.engine.name(), error = %reason, "persistent map failed to open");
                self.set_state(MapState::Failed(reason.clone()));
                Err(GraphError::StoreInit(reason))
            }
        }
    }

    pub async fn open(&self) -> Result<()> {
        self.ensure_open().await.map(|_| ())
    }

    pub async fn has(&self, key: &str) -> Result<bool> {
        let inner = self.ensure_open().await?;
        Ok(inner.cache.contains_key(key))
    }

    pub async fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        let inner = self.ensure_open().await?;
        Ok(inner.cache.get(key).cloned())
    }

    /// Stores `value` under `key`. Writing a value equal to the stored one is a no-op.
    pub async fn put(&self, key: &str, value: JsonValue) -> Result<()> {
        let mut inner = self.ensure_open().await?;
        if inner.cache.get(key) == Some(&value) {
            return Ok(());
        }
        let entry = JournalEntry::Put {
            key: key.to_string(),
            value,
        };
        inner.engine.append(&entry).await?;
        entry.apply(&mut inner.cache);
        self.maybe_compact(&mut inner).await;
        Ok(())
    }

    /// Removes `key`. Returns whether it was present.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.ensure_open().await?;
        if !inner.cache.contains_key(key) {
            return Ok(false);
        }
        let entry = JournalEntry::Delete {
            key: key.to_string(),
        };
        inner.engine.append(&entry).await?;
        entry.apply(&mut inner.cache);
        self.maybe_compact(&mut inner).await;
        Ok(true)
    }

    /// All keys in ascending order.
    pub async fn all_keys(&self) -> Result<Vec<String>> {
        let inner = self.ensure_open().await?;
        Ok(inner.cache.keys().cloned().collect())
    }

    pub async fn len(&self) -> Result<usize> {
        let inner = self.ensure_open().await?;
        Ok(inner.cache.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn clear(&self) -> Result<()> {
        let mut inner = self.ensure_open().await?;
        if inner.cache.is_empty() {
            return Ok(());
        }
        inner.engine.append(&JournalEntry::Clear).await?;
        inner.cache.clear();
        self.maybe_compact(&mut inner).await;
        Ok(())
    }

    /// Folds the journal into a snapshot now.
    pub async fn compact(&self) -> Result<()> {
        let mut inner = self.ensure_open().await?;
        let MapInner { engine, cache } = &mut *inner;
        engine.compact(cache).await
    }

    /// Compacts and releases the engine. Closing twice is harmless.
    ///
    /// Operations still in flight on other tasks when this is called are not
    /// waited for beyond the internal lock.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match self.state() {
            MapState::Open => {
                let MapInner { engine, cache } = &mut *inner;
                let result = match engine.compact(cache).await {
                    Ok(()) => engine.close().await,
                    Err(err) => Err(err),
                };
                self.set_state(MapState::Closed);
                result
            }
            MapState::Failed(_) => Ok(()),
            _ => {
                self.set_state(MapState::Closed);
                Ok(())
            }
        }
    }

    /// Compacts once the journal reaches the threshold. The triggering write is
    /// already journaled, so a failed compaction only leaves a longer journal.
    async fn maybe_compact(&self, inner: &mut MapInner) {
        if inner.engine.journal_len() < self.compact_after_ops {
            return;
        }
        let MapInner { engine, cache } = inner;
        if let Err(err) = engine.compact(cache).await {
            event!(
                Level::WARN,
                engine = engine.name(),
                journal = engine.journal_len(),
                error = %err,
                "compaction failed, keeping journal"
            );
        }
    }
}
