pub mod error;
pub mod identity;
pub mod object;
pub mod value;

pub use error::{GraphError, Result};
pub use identity::{
    IdentityListener, IdentityRegistry, IdentitySlot, PUUID_LENGTH, Puuid, generate_puuid,
};
pub use object::{DurableObject, Entity, ObjectRef, ObjectRole, WeakObjectRef, same_object};
pub use value::{FieldMap, FieldValue};
