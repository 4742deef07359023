use crate::config::{CodecOptions, StoreConfig};
use crate::core::{GraphError, ObjectRef, Puuid, Result};
use crate::graph::{GraphContext, LoadOutcome, RecordCodec, ResolveContext, StorableRecord};
use crate::storage::PersistentMap;
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tracing::{Instrument, Level, event, info_span};

/// Reserved key of the collection manifest. Object ids cannot start with `$`.
pub const MANIFEST_KEY: &str = "$manifest";

type Manifest = BTreeMap<String, BTreeSet<Puuid>>;

/// Durable home of an object graph: records keyed by id in a [`PersistentMap`].
pub struct ObjectStore {
    context: GraphContext,
    codec: RecordCodec,
    map: PersistentMap,
    degraded: bool,
    manifest_lock: Mutex<()>,
}

impl ObjectStore {
    /// Opens the store described by `config`.
    ///
    /// When the durable engine cannot be initialised and
    /// `config.fallback_to_memory` is set, the store warns once and keeps
    /// running on an in-memory map instead of failing.
    pub async fn open(config: StoreConfig, context: GraphContext) -> Result<Self> {
        let mut map = PersistentMap::from_config(&config);
        let mut degraded = false;
        match map.open().await {
            Ok(()) => {}
            Err(GraphError::StoreInit(reason)) if config.fallback_to_memory => {
                log::warn!(
                    "object store unavailable, operating in memory only: dir='{}' error='{}'",
                    config
                        .data_dir
                        .as_ref()
                        .map(|dir| dir.display().to_string())
                        .unwrap_or_default(),
                    reason
                );
                map = PersistentMap::in_memory();
                degraded = true;
            }
            Err(err) => return Err(err),
        }

        let mut store = Self::with_map(map, context, config.codec.clone()).await?;
        store.degraded = degraded;
        Ok(store)
    }

    /// Builds a store over an already constructed map, opening it if needed.
    pub async fn with_map(
        map: PersistentMap,
        context: GraphContext,
        codec: CodecOptions,
    ) -> Result<Self> {
        map.open().await?;
        let store = Self {
            codec: RecordCodec::with_options(context.clone(), codec),
            context,
            map,
            degraded: false,
            manifest_lock: Mutex::new(()),
        };
        store.rebuild_reference_index().await?;
        Ok(store)
    }

    pub async fn in_memory(context: GraphContext) -> Result<Self> {
        Self::open(StoreConfig::in_memory(), context).await
    }

    pub fn context(&self) -> &GraphContext {
        &self.context
    }

    pub fn codec(&self) -> &RecordCodec {
        &self.codec
    }

    pub fn map(&self) -> &PersistentMap {
        &self.map
    }

    /// Whether the store fell back to memory because storage was unavailable.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Writes `root` and every object reachable from it through persisted fields.
    ///
    /// Returns the ids written, `root` first.
    pub async fn save(&self, root: &ObjectRef) -> Result<Vec<Puuid>> {
        let span = info_span!("object_store.save", root = ?root);
        async {
            let objects = self.codec.collect_graph(root)?;
            let mut records = Vec::with_capacity(objects.len());
            for object in &objects {
                let record = self.codec.to_record(object)?;
                self.context.tracker().add(object)?;
                records.push(record);
            }

            let encoded = records
                .iter()
                .map(|record| Ok((record.id.to_string(), record.to_json()?)))
                .collect::<Result<Vec<(String, JsonValue)>>>()?;
            let written = join_all(
                encoded
                    .into_iter()
                    .map(|(key, value)| async move { self.map.put(&key, value).await }),
            )
            .await;

            // Index every record that landed, even when a sibling write failed.
            let mut first_error = None;
            for (record, result) in records.iter().zip(written) {
                match result {
                    Ok(()) => {
                        self.context.references().record_written(record)?;
                    }
                    Err(err) => {
                        event!(Level::WARN, id = %record.id, error = %err, "record write failed");
                        first_error.get_or_insert(err);
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
            event!(Level::DEBUG, records = records.len(), "object graph saved");
            Ok::<_, GraphError>(records.into_iter().map(|record| record.id).collect())
        }
        .instrument(span)
        .await
    }

    /// Returns the live object for `id`, loading it (and, lazily, everything it
    /// references) from storage if it is not in memory.
    ///
    /// Returns `None` when no record exists. Broken references inside the graph
    /// are reported through [`LoadOutcome::issues`].
    pub async fn load(&self, id: &Puuid) -> Result<Option<LoadOutcome>> {
        if let Some(object) = self.context.tracker().get(id) {
            return Ok(Some(LoadOutcome {
                object,
                issues: Vec::new(),
            }));
        }

        let session = LoadSession {
            store: self,
            issues: StdMutex::new(Vec::new()),
        };
        let outcome = self
            .load_record(id, &session)
            .instrument(info_span!("object_store.load", id = %id))
            .await?;
        Ok(outcome.map(|mut outcome| {
            let nested = session
                .issues
                .into_inner()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            outcome.issues.extend(nested);
            outcome
        }))
    }

    async fn load_record(
        &self,
        id: &Puuid,
        session: &LoadSession<'_>,
    ) -> Result<Option<LoadOutcome>> {
        let Some(stored) = self.map.get(id.as_str()).await? else {
            return Ok(None);
        };
        let record = StorableRecord::from_json(stored)?;
        if record.id != *id {
            return Err(GraphError::Serialization(format!(
                "record stored under '{}' carries id '{}'",
                id, record.id
            )));
        }
        let outcome = self.codec.from_record(&record, session).await?;
        self.context.references().record_written(&record)?;
        Ok(Some(outcome))
    }

    /// The stored record for `id`, without materializing an object.
    pub async fn record(&self, id: &Puuid) -> Result<Option<StorableRecord>> {
        match self.map.get(id.as_str()).await? {
            Some(stored) => Ok(Some(StorableRecord::from_json(stored)?)),
            None => Ok(None),
        }
    }

    pub async fn contains(&self, id: &Puuid) -> Result<bool> {
        self.map.has(id.as_str()).await
    }

    /// Ids of every stored record, ascending.
    pub async fn stored_ids(&self) -> Result<Vec<Puuid>> {
        Ok(self
            .map
            .all_keys()
            .await?
            .into_iter()
            .filter(|key| !key.starts_with('$'))
            .filter_map(|key| Puuid::parse(&key).ok())
            .collect())
    }

    /// Deletes the record for `id`.
    ///
    /// Refuses with [`GraphError::StillReferenced`] while other records point at
    /// it, unless `force` is set. Live instances are left untouched.
    pub async fn delete(&self, id: &Puuid, force: bool) -> Result<bool> {
        let mut referrers = self.context.references().referenced_by(id)?;
        referrers.remove(id);
        if !referrers.is_empty() && !force {
            return Err(GraphError::StillReferenced {
                id: id.to_string(),
                referrers: referrers.iter().map(ToString::to_string).collect(),
            });
        }

        let removed = self.map.delete(id.as_str()).await?;
        self.context.references().record_removed(id)?;
        self.remove_from_all_collections(id).await?;
        event!(Level::DEBUG, id = %id, removed, forced = force, "record deleted");
        Ok(removed)
    }

    /// Re-reads every stored record into the reference index.
    pub async fn rebuild_reference_index(&self) -> Result<usize> {
        let references = self.context.references();
        references.clear()?;
        let mut indexed = 0;
        for id in self.stored_ids().await? {
            if let Some(record) = self.record(&id).await? {
                references.record_written(&record)?;
                indexed += 1;
            }
        }
        Ok(indexed)
    }

    pub async fn add_to_collection(&self, collection: &str, id: &Puuid) -> Result<bool> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.read_manifest().await?;
        let inserted = manifest
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone());
        if inserted {
            self.write_manifest(&manifest).await?;
        }
        Ok(inserted)
    }

    pub async fn remove_from_collection(&self, collection: &str, id: &Puuid) -> Result<bool> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.read_manifest().await?;
        let removed = manifest
            .get_mut(collection)
            .map(|ids| ids.remove(id))
            .unwrap_or(false);
        if removed {
            manifest.retain(|_, ids| !ids.is_empty());
            self.write_manifest(&manifest).await?;
        }
        Ok(removed)
    }

    pub async fn collection(&self, collection: &str) -> Result<BTreeSet<Puuid>> {
        let manifest = self.read_manifest().await?;
        Ok(manifest.get(collection).cloned().unwrap_or_default())
    }

    pub async fn collection_names(&self) -> Result<Vec<String>> {
        Ok(self.read_manifest().await?.into_keys().collect())
    }

    async fn remove_from_all_collections(&self, id: &Puuid) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.read_manifest().await?;
        let mut changed = false;
        for ids in manifest.values_mut() {
            changed |= ids.remove(id);
        }
        if changed {
            manifest.retain(|_, ids| !ids.is_empty());
            self.write_manifest(&manifest).await?;
        }
        Ok(())
    }

    async fn read_manifest(&self) -> Result<Manifest> {
        match self.map.get(MANIFEST_KEY).await? {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| GraphError::Serialization(format!("invalid manifest: {}", e))),
            None => Ok(Manifest::new()),
        }
    }

    async fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        if manifest.is_empty() {
            self.map.delete(MANIFEST_KEY).await?;
            return Ok(());
        }
        self.map
            .put(MANIFEST_KEY, serde_json::to_value(manifest)?)
            .await
    }

    /// Deep-copies `object` under a fresh identity. The copy is not saved.
    pub fn duplicate(&self, object: &ObjectRef) -> Result<ObjectRef> {
        self.codec.duplicate(object)
    }

    pub async fn close(&self) -> Result<()> {
        self.map.close().await
    }
}

/// Resolution state for one top-level load; collects issues from nested loads.
struct LoadSession<'a> {
    store: &'a ObjectStore,
    issues: StdMutex<Vec<GraphError>>,
}

#[async_trait]
impl ResolveContext for LoadSession<'_> {
    fn register(&self, object: &ObjectRef) -> Result<()> {
        self.store.context.tracker().add(object).map(|_| ())
    }

    async fn resolve(&self, id: &Puuid) -> Result<ObjectRef> {
        if let Some(object) = self.store.context.tracker().get(id) {
            return Ok(object);
        }
        match self.store.load_record(id, self).await? {
            Some(outcome) => {
                self.issues.lock()?.extend(outcome.issues);
                Ok(outcome.object)
            }
            None => Err(GraphError::ReferenceResolution {
                from: String::new(),
                target: id.to_string(),
                reason: "no stored record".to_string(),
            }),
        }
    }
}
