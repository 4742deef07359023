use crate::core::error::Result;
use crate::core::identity::IdentitySlot;
use crate::core::value::{FieldMap, FieldValue};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

pub type ObjectRef = Arc<dyn DurableObject>;
pub type WeakObjectRef = Weak<dyn DurableObject>;

/// What an object stands for, used to qualify type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectRole {
    #[default]
    Instance,
    Prototype,
    Class,
}

impl ObjectRole {
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Instance => "",
            Self::Prototype => "_Prototype",
            Self::Class => "_Class",
        }
    }
}

/// An object that can be given a durable identity and stored as a record.
///
/// Implementors keep their own interior mutability; every method takes `&self`
/// because objects are shared through [`ObjectRef`] across the graph.
pub trait DurableObject: Send + Sync + 'static {
    /// Registered type name, used to pick the policy table and factory.
    fn type_name(&self) -> &str;

    fn role(&self) -> ObjectRole {
        ObjectRole::Instance
    }

    fn identity(&self) -> &IdentitySlot;

    /// Current field values, keyed by field name.
    fn field_values(&self) -> Result<FieldMap>;

    /// Assigns the given fields, leaving fields that are not mentioned untouched.
    fn load_field_values(&self, fields: FieldMap) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn field(&self, name: &str) -> Result<Option<FieldValue>> {
        Ok(self.field_values()?.remove(name))
    }

    fn set_field(&self, name: &str, value: FieldValue) -> Result<()> {
        let mut fields = FieldMap::new();
        fields.insert(name.to_string(), value);
        self.load_field_values(fields)
    }
}

/// Whether two references point at the same object.
pub fn same_object(a: &ObjectRef, b: &ObjectRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl fmt::Debug for dyn DurableObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.identity().get() {
            Some(id) => write!(f, "{}({})", self.type_name(), id),
            None => write!(f, "{}(<unidentified>)", self.type_name()),
        }
    }
}

/// A generic durable object whose fields live in a map.
///
/// This is the default instance the type registry allocates, and a convenient
/// base for tests and for types without dedicated Rust structs.
pub struct Entity {
    type_name: String,
    role: ObjectRole,
    identity: IdentitySlot,
    fields: RwLock<FieldMap>,
}

impl Entity {
    pub fn new(type_name: impl Into<String>) -> ObjectRef {
        Self::with_fields(type_name, FieldMap::new())
    }

    pub fn with_fields(type_name: impl Into<String>, fields: FieldMap) -> ObjectRef {
        Arc::new(Self {
            type_name: type_name.into(),
            role: ObjectRole::Instance,
            identity: IdentitySlot::new(),
            fields: RwLock::new(fields),
        })
    }

    pub fn with_role(type_name: impl Into<String>, role: ObjectRole) -> ObjectRef {
        Arc::new(Self {
            type_name: type_name.into(),
            role,
            identity: IdentitySlot::new(),
            fields: RwLock::new(FieldMap::new()),
        })
    }
}

impl DurableObject for Entity {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn role(&self) -> ObjectRole {
        self.role
    }

    fn identity(&self) -> &IdentitySlot {
        &self.identity
    }

    fn field_values(&self) -> Result<FieldMap> {
        Ok(self.fields.read()?.clone())
    }

    fn load_field_values(&self, fields: FieldMap) -> Result<()> {
        let mut current = self.fields.write()?;
        current.extend(fields);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn field(&self, name: &str) -> Result<Option<FieldValue>> {
        Ok(self.fields.read()?.get(name).cloned())
    }

    fn set_field(&self, name: &str, value: FieldValue) -> Result<()> {
        self.fields.write()?.insert(name.to_string(), value);
        Ok(())
    }
}
