//! Durable object identity (PUUID) generation and assignment.

use crate::core::error::{GraphError, Result};
use crate::core::object::{DurableObject, ObjectRef};
use rand::rngs::{OsRng, SmallRng};
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{Level, event};

pub const PUUID_LENGTH: usize = 10;

const PUUID_ALPHABET: &[u8; 62] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Largest multiple of the alphabet size that fits in a byte; bytes at or
/// above it are rejected so every symbol is equally likely.
const UNBIASED_BYTE_LIMIT: u8 = 248;

/// A permanent unique identifier for a durable object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Puuid(String);

impl Puuid {
    /// Validates an externally supplied identifier.
    ///
    /// Stored identifiers are not required to match the generated length, but
    /// they must be non-empty and limited to `[A-Za-z0-9_-]` so they can never
    /// collide with reserved store keys.
    pub fn parse(value: &str) -> Result<Self> {
        if value.trim().is_empty() {
            return Err(GraphError::InvalidIdentity(
                "identity must not be empty".to_string(),
            ));
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(GraphError::InvalidIdentity(format!(
                "identity '{}' contains invalid character '{}'",
                value, bad
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Puuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Puuid {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Puuid> for String {
    fn from(value: Puuid) -> Self {
        value.0
    }
}

impl AsRef<str> for Puuid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

static FALLBACK_RNG: OnceLock<Mutex<SmallRng>> = OnceLock::new();
static FALLBACK_WARNED: AtomicBool = AtomicBool::new(false);

fn fallback_rng() -> &'static Mutex<SmallRng> {
    FALLBACK_RNG.get_or_init(|| {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let seed = nanos ^ (u64::from(std::process::id()) << 32);
        Mutex::new(SmallRng::seed_from_u64(seed))
    })
}

fn fill_random(buf: &mut [u8]) {
    if OsRng.try_fill_bytes(buf).is_ok() {
        return;
    }
    if !FALLBACK_WARNED.swap(true, Ordering::Relaxed) {
        event!(
            Level::WARN,
            "OS random source unavailable, identities use a pseudo-random generator"
        );
    }
    let mut rng = fallback_rng()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    rng.fill_bytes(buf);
}

/// Generates a fresh 10-character identifier over `[A-Za-z0-9]`.
pub fn generate_puuid() -> Puuid {
    let mut id = String::with_capacity(PUUID_LENGTH);
    let mut buf = [0u8; 16];
    while id.len() < PUUID_LENGTH {
        fill_random(&mut buf);
        for byte in buf {
            if byte >= UNBIASED_BYTE_LIMIT {
                continue;
            }
            id.push(PUUID_ALPHABET[(byte % 62) as usize] as char);
            if id.len() == PUUID_LENGTH {
                break;
            }
        }
    }
    Puuid(id)
}

/// Per-object storage for an identity that has not necessarily been assigned yet.
///
/// Objects embed a slot instead of keeping the id in their field map, so the
/// identity never shows up when fields are enumerated or persisted.
#[derive(Debug, Default)]
pub struct IdentitySlot {
    id: RwLock<Option<Puuid>>,
}

impl IdentitySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Puuid> {
        self.id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn get_or_assign(&self, generate: impl FnOnce() -> Puuid) -> Puuid {
        if let Some(id) = self.get() {
            return id;
        }
        let mut guard = self
            .id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get_or_insert_with(generate).clone()
    }

    fn replace(&self, id: Puuid) -> Option<Puuid> {
        let mut guard = self
            .id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.replace(id)
    }
}

/// Receives notifications when an already identified object is given a new id.
pub trait IdentityListener: Send + Sync {
    fn on_rekey(&self, old: &Puuid, new: &Puuid, object: &ObjectRef);
}

/// Assigns and looks up object identities.
#[derive(Default)]
pub struct IdentityRegistry {
    listeners: Mutex<Vec<Weak<dyn IdentityListener>>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the object's id, assigning a fresh one on first access.
    pub fn id_of(&self, object: &dyn DurableObject) -> Puuid {
        object.identity().get_or_assign(generate_puuid)
    }

    /// Returns the object's id without assigning one.
    pub fn peek_id(&self, object: &dyn DurableObject) -> Option<Puuid> {
        object.identity().get()
    }

    /// Forces the object's id, used when rebuilding an object from a stored record.
    ///
    /// Returns the id that was replaced, if any. Listeners are told about the
    /// change so keyed indexes can move their entries instead of dangling.
    /// Stored records are not moved: they keep the old key until saved again.
    pub fn set_id(&self, object: &ObjectRef, id: &str) -> Result<Option<Puuid>> {
        let new_id = Puuid::parse(id)?;
        let previous = object.identity().replace(new_id.clone());
        if let Some(old_id) = &previous {
            if *old_id != new_id {
                for listener in self.live_listeners()? {
                    listener.on_rekey(old_id, &new_id, object);
                }
            }
        }
        Ok(previous)
    }

    /// Type-qualified id: `{type}{role suffix}_{puuid}`.
    ///
    /// The `_` before the id keeps the type name from running into it: type
    /// `Note1` with id `abc` and type `Note` with id `1abc` would both read
    /// `Note1abc` without it.
    pub fn type_id(&self, object: &dyn DurableObject) -> String {
        format!(
            "{}{}_{}",
            object.type_name(),
            object.role().suffix(),
            self.id_of(object)
        )
    }

    pub fn add_listener(&self, listener: &Arc<dyn IdentityListener>) -> Result<()> {
        let mut listeners = self.listeners.lock()?;
        listeners.push(Arc::downgrade(listener));
        Ok(())
    }

    fn live_listeners(&self) -> Result<Vec<Arc<dyn IdentityListener>>> {
        let mut listeners = self.listeners.lock()?;
        listeners.retain(|listener| listener.strong_count() > 0);
        Ok(listeners.iter().filter_map(Weak::upgrade).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::Entity;
    use std::collections::HashSet;

    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
    }

    impl IdentityListener for Recorder {
        fn on_rekey(&self, old: &Puuid, new: &Puuid, _object: &ObjectRef) {
            self.seen
                .lock()
                .unwrap()
                .push((old.to_string(), new.to_string()));
        }
    }

    #[test]
    fn test_generated_ids_use_alphabet_and_length() {
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let id = generate_puuid();
            assert_eq!(id.as_str().len(), PUUID_LENGTH);
            assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_id_of_is_lazy_and_stable() {
        let registry = IdentityRegistry::new();
        let entity = Entity::new("Note");
        assert!(registry.peek_id(entity.as_ref()).is_none());
        let first = registry.id_of(entity.as_ref());
        assert_eq!(registry.id_of(entity.as_ref()), first);
        assert_eq!(registry.peek_id(entity.as_ref()), Some(first));
    }

    #[test]
    fn test_set_id_rejects_empty() {
        let registry = IdentityRegistry::new();
        let entity = Entity::new("Note");
        let err = registry.set_id(&entity, "  ").unwrap_err();
        assert!(matches!(err, GraphError::InvalidIdentity(_)));
        assert!(registry.peek_id(entity.as_ref()).is_none());
    }

    #[test]
    fn test_set_id_notifies_listeners_on_rekey() {
        let registry = IdentityRegistry::new();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let listener: Arc<dyn IdentityListener> = recorder.clone();
        registry.add_listener(&listener).unwrap();

        let entity = Entity::new("Note");
        assert_eq!(registry.set_id(&entity, "first").unwrap(), None);
        let replaced = registry.set_id(&entity, "second").unwrap();
        assert_eq!(replaced.unwrap().as_str(), "first");

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("first".to_string(), "second".to_string())]);
    }

    #[test]
    fn test_type_id_includes_role_suffix() {
        let registry = IdentityRegistry::new();
        let entity = Entity::new("Note");
        registry.set_id(&entity, "abc123").unwrap();
        assert_eq!(registry.type_id(entity.as_ref()), "Note_abc123");
    }
}
