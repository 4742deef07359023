pub mod codec;
pub mod context;
pub mod references;
pub mod tracker;
pub mod types;

pub use codec::{
    INLINE_MAP_KEY, LoadOutcome, REFERENCE_TOKEN_KEY, RecordCodec, ResolveContext,
    StorableRecord, reference_token,
};
pub use context::GraphContext;
pub use references::{ReferenceDiff, ReferenceIndex, references_of};
pub use tracker::WeakTracker;
pub use types::{FieldPolicy, FieldSpec, ObjectFactory, TypeDescriptor, TypeRegistry};
