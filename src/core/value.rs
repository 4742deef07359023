use crate::core::identity::Puuid;
use crate::core::object::{ObjectRef, same_object};
use std::collections::BTreeMap;
use std::fmt;

pub type FieldMap = BTreeMap<String, FieldValue>;

/// An in-memory field value of a durable object.
#[derive(Clone)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
    /// Points at another durable object without owning a private copy.
    Object(ObjectRef),
    /// Placeholder left where a stored reference could not be resolved.
    BrokenRef(Puuid),
    /// Placeholder for a stored reference whose target is not a valid id.
    MalformedRef(String),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Integer(_) => "INTEGER",
            Self::Float(_) => "FLOAT",
            Self::Text(_) => "TEXT",
            Self::List(_) => "LIST",
            Self::Map(_) => "MAP",
            Self::Object(_) => "OBJECT",
            Self::BrokenRef(_) => "BROKEN_REF",
            Self::MalformedRef(_) => "MALFORMED_REF",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Self::Object(v) => Some(v),
            _ => None,
        }
    }

    pub fn broken_ref(&self) -> Option<&Puuid> {
        match self {
            Self::BrokenRef(id) => Some(id),
            _ => None,
        }
    }

    /// Visits every object reachable inside this value, depth first.
    pub fn for_each_object(&self, visit: &mut dyn FnMut(&ObjectRef)) {
        match self {
            Self::Object(object) => visit(object),
            Self::List(items) => {
                for item in items {
                    item.for_each_object(visit);
                }
            }
            Self::Map(entries) => {
                for value in entries.values() {
                    value.for_each_object(visit);
                }
            }
            _ => {}
        }
    }

    /// Rebuilds the value with every nested object passed through `map`.
    pub fn try_map_objects<E>(
        &self,
        map: &mut dyn FnMut(&ObjectRef) -> std::result::Result<ObjectRef, E>,
    ) -> std::result::Result<FieldValue, E> {
        Ok(match self {
            Self::Object(object) => Self::Object(map(object)?),
            Self::List(items) => Self::List(
                items
                    .iter()
                    .map(|item| item.try_map_objects(map))
                    .collect::<std::result::Result<Vec<_>, E>>()?,
            ),
            Self::Map(entries) => {
                let mut mapped = BTreeMap::new();
                for (key, value) in entries {
                    mapped.insert(key.clone(), value.try_map_objects(map)?);
                }
                Self::Map(mapped)
            }
            other => other.clone(),
        })
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            // Objects compare by identity, not by content.
            (Self::Object(a), Self::Object(b)) => same_object(a, b),
            (Self::BrokenRef(a), Self::BrokenRef(b)) => a == b,
            (Self::MalformedRef(a), Self::MalformedRef(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Bool(v) => write!(f, "Bool({})", v),
            Self::Integer(v) => write!(f, "Integer({})", v),
            Self::Float(v) => write!(f, "Float({})", v),
            Self::Text(v) => write!(f, "Text({:?})", v),
            Self::List(v) => f.debug_list().entries(v).finish(),
            Self::Map(v) => f.debug_map().entries(v).finish(),
            Self::Object(object) => write!(f, "Object({:?})", object),
            Self::BrokenRef(id) => write!(f, "BrokenRef({})", id),
            Self::MalformedRef(raw) => write!(f, "MalformedRef({:?})", raw),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<ObjectRef> for FieldValue {
    fn from(value: ObjectRef) -> Self {
        Self::Object(value)
    }
}

impl From<&ObjectRef> for FieldValue {
    fn from(value: &ObjectRef) -> Self {
        Self::Object(value.clone())
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(value: Vec<FieldValue>) -> Self {
        Self::List(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::object::Entity;

    #[test]
    fn test_objects_compare_by_identity() {
        let a = Entity::new("Note");
        let b = Entity::new("Note");
        assert_eq!(FieldValue::from(&a), FieldValue::from(&a));
        assert_ne!(FieldValue::from(&a), FieldValue::from(&b));
    }

    #[test]
    fn test_for_each_object_walks_nested_values() {
        let a = Entity::new("Note");
        let b = Entity::new("Tag");
        let mut inner = BTreeMap::new();
        inner.insert("tag".to_string(), FieldValue::from(&b));
        let value = FieldValue::List(vec![
            FieldValue::from(&a),
            FieldValue::Integer(3),
            FieldValue::Map(inner),
        ]);

        let mut types = Vec::new();
        value.for_each_object(&mut |object| types.push(object.type_name().to_string()));
        assert_eq!(types, vec!["Note", "Tag"]);
    }
}
