//! Declared-at-registration policy tables for durable types.

use crate::core::{Entity, GraphError, ObjectRef, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

/// How a field is treated when an object is stored or deep-copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// Not part of identity-preserving copies; not written to records.
    Skip,
    /// The raw value is copied; nested objects stay shared.
    Copy,
    /// Owned sub-objects: duplicated recursively, stored as references.
    Duplicate,
    /// Shared pointer to another durable object.
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub policy: FieldPolicy,
    /// Whether the field is written to the storable record.
    pub persist: bool,
}

pub type ObjectFactory = Arc<dyn Fn() -> ObjectRef + Send + Sync>;

/// A durable type: its name, its field policy table, and how to allocate it.
#[derive(Clone)]
pub struct TypeDescriptor {
    name: String,
    fields: Vec<FieldSpec>,
    factory: ObjectFactory,
}

impl TypeDescriptor {
    pub fn new(
        name: impl Into<String>,
        factory: impl Fn() -> ObjectRef + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    /// A descriptor whose instances are generic [`Entity`] objects.
    pub fn entity(name: impl Into<String>) -> Self {
        let name = name.into();
        let type_name = name.clone();
        Self::new(name, move || Entity::new(type_name.clone()))
    }

    /// Declares a persisted field.
    pub fn field(mut self, name: impl Into<String>, policy: FieldPolicy) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            policy,
            persist: true,
        });
        self
    }

    /// Declares a field that takes part in duplication but is never stored.
    pub fn transient(mut self, name: impl Into<String>, policy: FieldPolicy) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            policy,
            persist: false,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn spec(&self, field: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|spec| spec.name == field)
    }

    /// Allocates a blank instance, checking the factory produced the right type.
    pub fn instantiate(&self) -> Result<ObjectRef> {
        let object = (self.factory)();
        if object.type_name() != self.name {
            return Err(GraphError::Schema(format!(
                "factory for '{}' produced an instance of '{}'",
                self.name,
                object.type_name()
            )));
        }
        Ok(object)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GraphError::Schema("type name must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        for spec in &self.fields {
            if spec.name.trim().is_empty() {
                return Err(GraphError::Schema(format!(
                    "type '{}' declares a field with an empty name",
                    self.name
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(GraphError::Schema(format!(
                    "type '{}' declares field '{}' twice",
                    self.name, spec.name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .finish()
    }
}

/// Registered durable types, keyed by type name.
#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<HashMap<String, Arc<TypeDescriptor>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: TypeDescriptor) -> Result<()> {
        descriptor.validate()?;
        let mut types = self.types.write()?;
        if types.contains_key(descriptor.name()) {
            return Err(GraphError::Schema(format!(
                "type '{}' is already registered",
                descriptor.name()
            )));
        }
        types.insert(descriptor.name().to_string(), Arc::new(descriptor));
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Result<Arc<TypeDescriptor>> {
        self.types
            .read()?
            .get(type_name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types
            .read()
            .map(|types| types.contains_key(type_name))
            .unwrap_or(false)
    }

    pub fn type_names(&self) -> Result<Vec<String>> {
        let mut names = self.types.read()?.keys().cloned().collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }
}
