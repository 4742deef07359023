use crate::core::{IdentityListener, IdentityRegistry, Result};
use crate::graph::references::ReferenceIndex;
use crate::graph::tracker::WeakTracker;
use crate::graph::types::{TypeDescriptor, TypeRegistry};
use std::sync::Arc;

/// Shared state of one object population.
///
/// Constructed explicitly and passed down instead of living in globals, so
/// every test (or every embedded store) gets an isolated population. Cloning is
/// cheap and yields a handle to the same population.
#[derive(Clone)]
pub struct GraphContext {
    identities: Arc<IdentityRegistry>,
    tracker: Arc<WeakTracker>,
    references: Arc<ReferenceIndex>,
    types: Arc<TypeRegistry>,
}

impl GraphContext {
    pub fn new() -> Self {
        let identities = Arc::new(IdentityRegistry::new());
        let tracker = Arc::new(WeakTracker::new(identities.clone()));
        let references = Arc::new(ReferenceIndex::new());

        // The reference index follows stored record ids, which a rekey of a
        // live object does not move, so only the tracker listens.
        let tracker_listener: Arc<dyn IdentityListener> = tracker.clone();
        // A fresh registry has no listeners yet and cannot be poisoned.
        let _ = identities.add_listener(&tracker_listener);

        Self {
            identities,
            tracker,
            references,
            types: Arc::new(TypeRegistry::new()),
        }
    }

    pub fn identities(&self) -> &Arc<IdentityRegistry> {
        &self.identities
    }

    pub fn tracker(&self) -> &Arc<WeakTracker> {
        &self.tracker
    }

    pub fn references(&self) -> &Arc<ReferenceIndex> {
        &self.references
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn register_type(&self, descriptor: TypeDescriptor) -> Result<()> {
        self.types.register(descriptor)
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}
