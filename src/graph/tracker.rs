//! Enumerable set of weakly held live objects, keyed by identity.

use crate::core::{
    GraphError, IdentityListener, IdentityRegistry, ObjectRef, Puuid, Result, WeakObjectRef,
    same_object,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

/// Tracks live instances without keeping them alive.
///
/// Entries whose object has been dropped linger in the backing map until the
/// next lookup, enumeration, or [`WeakTracker::sweep`] removes them; they are
/// never returned as live values. Callbacks passed to [`WeakTracker::for_each`]
/// run without the internal lock held and may call back into the tracker.
pub struct WeakTracker {
    identities: Arc<IdentityRegistry>,
    entries: Mutex<BTreeMap<Puuid, WeakObjectRef>>,
}

impl WeakTracker {
    pub fn new(identities: Arc<IdentityRegistry>) -> Self {
        Self {
            identities,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers `value` under its identity. Adding the same object twice is a no-op.
    pub fn add(&self, value: &ObjectRef) -> Result<Puuid> {
        let id = self.identities.id_of(value.as_ref());
        let mut entries = self.entries.lock()?;
        if let Some(existing) = entries.get(&id).and_then(Weak::upgrade) {
            if same_object(&existing, value) {
                return Ok(id);
            }
            return Err(GraphError::InvalidValue(format!(
                "identity '{}' is already tracked for another live {}",
                id,
                existing.type_name()
            )));
        }
        entries.insert(id.clone(), Arc::downgrade(value));
        Ok(id)
    }

    /// Registers an object given only a weak handle.
    ///
    /// A handle that no longer resolves is indistinguishable from "no value"
    /// and is rejected.
    pub fn add_weak(&self, value: &WeakObjectRef) -> Result<Puuid> {
        let strong = value.upgrade().ok_or_else(|| {
            GraphError::InvalidValue(
                "cannot track a value that is absent or already reclaimed".to_string(),
            )
        })?;
        self.add(&strong)
    }

    pub fn has(&self, value: &ObjectRef) -> bool {
        let Some(id) = self.identities.peek_id(value.as_ref()) else {
            return false;
        };
        self.get(&id)
            .map(|tracked| same_object(&tracked, value))
            .unwrap_or(false)
    }

    pub fn has_id(&self, id: &Puuid) -> bool {
        self.get(id).is_some()
    }

    /// Resolves an id to its live object, dropping the entry if it was reclaimed.
    pub fn get(&self, id: &Puuid) -> Option<ObjectRef> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match entries.get(id).map(Weak::upgrade) {
            Some(Some(object)) => Some(object),
            Some(None) => {
                entries.remove(id);
                None
            }
            None => None,
        }
    }

    /// Removes `value`. Returns whether a live entry for it was removed.
    pub fn delete(&self, value: &ObjectRef) -> Result<bool> {
        let Some(id) = self.identities.peek_id(value.as_ref()) else {
            return Ok(false);
        };
        let mut entries = self.entries.lock()?;
        let Some(weak) = entries.get(&id) else {
            return Ok(false);
        };
        match weak.upgrade() {
            Some(tracked) if same_object(&tracked, value) => {
                entries.remove(&id);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => {
                entries.remove(&id);
                Ok(false)
            }
        }
    }

    pub fn delete_id(&self, id: &Puuid) -> Result<bool> {
        let mut entries = self.entries.lock()?;
        Ok(entries
            .remove(id)
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false))
    }

    /// Live values in id order. Stale entries are pruned as a side effect.
    pub fn values(&self) -> Result<Vec<ObjectRef>> {
        let mut entries = self.entries.lock()?;
        let mut live = Vec::with_capacity(entries.len());
        entries.retain(|_, weak| match weak.upgrade() {
            Some(object) => {
                live.push(object);
                true
            }
            None => false,
        });
        Ok(live)
    }

    pub fn ids(&self) -> Result<Vec<Puuid>> {
        let mut entries = self.entries.lock()?;
        entries.retain(|_, weak| weak.strong_count() > 0);
        Ok(entries.keys().cloned().collect())
    }

    pub fn for_each(&self, mut visit: impl FnMut(&ObjectRef)) -> Result<()> {
        for value in self.values()? {
            visit(&value);
        }
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let mut entries = self.entries.lock()?;
        entries.retain(|_, weak| weak.strong_count() > 0);
        Ok(entries.len())
    }

    /// Drops every stale entry and returns how many were removed.
    pub fn sweep(&self) -> Result<usize> {
        let mut entries = self.entries.lock()?;
        let before = entries.len();
        entries.retain(|_, weak| weak.strong_count() > 0);
        Ok(before - entries.len())
    }

    /// Number of entries held, stale ones included.
    pub fn raw_len(&self) -> usize {
        self.entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or_default()
    }
}

impl IdentityListener for WeakTracker {
    fn on_rekey(&self, old: &Puuid, new: &Puuid, object: &ObjectRef) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tracked = entries
            .get(old)
            .and_then(Weak::upgrade)
            .map(|existing| same_object(&existing, object))
            .unwrap_or(false);
        if tracked {
            entries.remove(old);
            entries.insert(new.clone(), Arc::downgrade(object));
        }
    }
}
