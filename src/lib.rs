// ============================================================================
// graphpersist
// ============================================================================
//
// Durable identities, weak instance tracking, policy-driven record encoding,
// a reference graph index, an async persistent map, and a deduplicating
// action scheduler for synchronizing object graphs.

pub mod config;
pub mod core;
pub mod graph;
pub mod storage;
pub mod store;
pub mod sync;

// Re-export main types for convenience
pub use config::{CodecOptions, DurabilityMode, StoreConfig};
pub use core::{
    DurableObject, Entity, FieldMap, FieldValue, GraphError, IdentityListener, IdentityRegistry,
    IdentitySlot, ObjectRef, ObjectRole, Puuid, Result, WeakObjectRef, generate_puuid,
    same_object,
};
pub use graph::{
    FieldPolicy, FieldSpec, GraphContext, LoadOutcome, RecordCodec, ReferenceIndex,
    ResolveContext, StorableRecord, TypeDescriptor, TypeRegistry, WeakTracker, references_of,
};
pub use storage::{MapState, PersistentMap};
pub use store::ObjectStore;
pub use sync::{
    ActionScheduler, ActionTarget, DurableTarget, FlushReport, ObservedVec, SchedulerWorker,
    TargetRef, spawn_scheduler_worker,
};
