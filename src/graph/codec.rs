//! Conversion between live objects and storable records.
//!
//! A record stores each persisted field as JSON. References to other durable
//! objects are written as `{"$ref": "<id>"}` tokens instead of being embedded,
//! which is what lets cyclic graphs round-trip. Inline maps that happen to use
//! `$`-prefixed keys are wrapped as `{"$map": {...}}` so they can never be read
//! back as a token.

use crate::config::CodecOptions;
use crate::core::{FieldMap, FieldValue, GraphError, ObjectRef, Puuid, Result};
use crate::graph::context::GraphContext;
use crate::graph::references::{malformed_references_of, references_of};
use crate::graph::types::{FieldPolicy, FieldSpec, TypeDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{Level, event};

pub const REFERENCE_TOKEN_KEY: &str = "$ref";
pub const INLINE_MAP_KEY: &str = "$map";

/// The serializable, id-tagged representation of a durable object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorableRecord {
    pub id: Puuid,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub fields: JsonMap<String, JsonValue>,
}

impl StorableRecord {
    pub fn new(id: Puuid, type_name: impl Into<String>) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            fields: JsonMap::new(),
        }
    }

    pub fn to_json(&self) -> Result<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: JsonValue) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|err| GraphError::Serialization(format!("invalid stored record: {}", err)))
    }
}

/// Builds a reference token for `id`.
pub fn reference_token(id: &Puuid) -> JsonValue {
    raw_reference_token(id.as_str())
}

fn raw_reference_token(target: &str) -> JsonValue {
    let mut token = JsonMap::new();
    token.insert(
        REFERENCE_TOKEN_KEY.to_string(),
        JsonValue::String(target.to_string()),
    );
    JsonValue::Object(token)
}

/// Returns the target id if `map` is a reference token.
pub fn reference_token_target(map: &JsonMap<String, JsonValue>) -> Option<&str> {
    if map.len() != 1 {
        return None;
    }
    map.get(REFERENCE_TOKEN_KEY).and_then(JsonValue::as_str)
}

/// Returns the wrapped entries if `map` is an escaped inline map.
pub fn unwrap_inline_map(map: &JsonMap<String, JsonValue>) -> Option<&JsonMap<String, JsonValue>> {
    if map.len() != 1 {
        return None;
    }
    map.get(INLINE_MAP_KEY).and_then(JsonValue::as_object)
}

/// Live object lookup used while decoding records.
#[async_trait]
pub trait ResolveContext: Send + Sync {
    /// Called once a freshly allocated instance carries its stored id and
    /// before any of its references are resolved, so cycles find it.
    fn register(&self, object: &ObjectRef) -> Result<()>;

    /// Returns the live object for `id`, loading it if necessary.
    async fn resolve(&self, id: &Puuid) -> Result<ObjectRef>;
}

/// A decoded object together with the recoverable problems found while loading it.
#[derive(Debug)]
pub struct LoadOutcome {
    pub object: ObjectRef,
    pub issues: Vec<GraphError>,
}

impl LoadOutcome {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Encodes, decodes, and duplicates objects according to their type's policy table.
#[derive(Clone)]
pub struct RecordCodec {
    context: GraphContext,
    options: CodecOptions,
}

impl RecordCodec {
    pub fn new(context: GraphContext) -> Self {
        Self::with_options(context, CodecOptions::default())
    }

    pub fn with_options(context: GraphContext, options: CodecOptions) -> Self {
        Self { context, options }
    }

    pub fn options(&self) -> &CodecOptions {
        &self.options
    }

    pub fn context(&self) -> &GraphContext {
        &self.context
    }

    pub fn to_record(&self, object: &ObjectRef) -> Result<StorableRecord> {
        let descriptor = self.context.types().get(object.type_name())?;
        let id = self.context.identities().id_of(object.as_ref());
        let mut record = StorableRecord::new(id, descriptor.name());

        for (name, value) in object.field_values()? {
            let Some(spec) = self.spec_for(&descriptor, &name, &self.options)? else {
                continue;
            };
            if !spec.persist {
                continue;
            }
            let encoded = match spec.policy {
                FieldPolicy::Skip => continue,
                FieldPolicy::Copy => self.encode_value(&value)?,
                FieldPolicy::Duplicate | FieldPolicy::Reference => {
                    if !holds_only_references(&value) {
                        return Err(GraphError::InvalidValue(format!(
                            "field '{}' of '{}' must hold object references, found {}",
                            name,
                            descriptor.name(),
                            value.type_name()
                        )));
                    }
                    self.encode_value(&value)?
                }
            };
            record.fields.insert(name, encoded);
        }

        event!(Level::DEBUG, id = %record.id, type_name = %record.type_name, "record encoded");
        Ok(record)
    }

    /// Rebuilds an object from its record, resolving references through `resolver`.
    ///
    /// References that cannot be resolved become [`FieldValue::BrokenRef`]
    /// placeholders and are reported in [`LoadOutcome::issues`]; they never
    /// abort the load.
    pub async fn from_record(
        &self,
        record: &StorableRecord,
        resolver: &dyn ResolveContext,
    ) -> Result<LoadOutcome> {
        let descriptor = self.context.types().get(&record.type_name)?;
        let object = descriptor.instantiate()?;
        self.context
            .identities()
            .set_id(&object, record.id.as_str())?;
        resolver.register(&object)?;

        let mut issues = Vec::new();
        for target in malformed_references_of(record) {
            let issue = GraphError::ReferenceResolution {
                from: record.id.to_string(),
                reason: format!("'{}' is not a valid identity", target),
                target,
            };
            event!(Level::WARN, from = %record.id, error = %issue, "malformed reference");
            issues.push(issue);
        }

        let mut resolved = HashMap::new();
        for target in references_of(record) {
            match resolver.resolve(&target).await {
                Ok(live) => {
                    resolved.insert(target, live);
                }
                Err(err) => {
                    let issue = match err {
                        GraphError::ReferenceResolution {
                            target: failed,
                            reason,
                            ..
                        } if failed == target.as_str() => GraphError::ReferenceResolution {
                            from: record.id.to_string(),
                            target: failed,
                            reason,
                        },
                        other => GraphError::ReferenceResolution {
                            from: record.id.to_string(),
                            target: target.to_string(),
                            reason: other.to_string(),
                        },
                    };
                    event!(Level::WARN, from = %record.id, target = %target, error = %issue, "reference resolution failed");
                    issues.push(issue);
                }
            }
        }

        let mut fields = FieldMap::new();
        for (name, stored) in &record.fields {
            let Some(spec) = self.spec_for(&descriptor, name, &self.options)? else {
                continue;
            };
            if spec.policy == FieldPolicy::Skip {
                continue;
            }
            fields.insert(name.clone(), decode_value(stored, &resolved)?);
        }
        object.load_field_values(fields)?;

        event!(
            Level::DEBUG,
            id = %record.id,
            type_name = %record.type_name,
            broken = issues.len(),
            "record decoded"
        );
        Ok(LoadOutcome { object, issues })
    }

    /// Deep-copies `object` under a fresh identity.
    pub fn duplicate(&self, object: &ObjectRef) -> Result<ObjectRef> {
        self.duplicate_with(object, &self.options)
    }

    pub fn duplicate_with(&self, object: &ObjectRef, options: &CodecOptions) -> Result<ObjectRef> {
        let mut visited = HashMap::new();
        self.duplicate_into(object, options, &mut visited)
    }

    /// One duplication pass. `visited` maps original ids to their copies so a
    /// cycle through owned fields reuses the copy instead of recursing forever.
    fn duplicate_into(
        &self,
        original: &ObjectRef,
        options: &CodecOptions,
        visited: &mut HashMap<Puuid, ObjectRef>,
    ) -> Result<ObjectRef> {
        let identities = self.context.identities();
        let original_id = identities.id_of(original.as_ref());
        if let Some(copy) = visited.get(&original_id) {
            return Ok(copy.clone());
        }

        let descriptor = self.context.types().get(original.type_name())?;
        let copy = descriptor.instantiate()?;
        visited.insert(original_id, copy.clone());

        let mut fields = FieldMap::new();
        for (name, value) in original.field_values()? {
            let Some(spec) = self.spec_for(&descriptor, &name, options)? else {
                continue;
            };
            match spec.policy {
                FieldPolicy::Skip => {}
                FieldPolicy::Copy | FieldPolicy::Reference => {
                    fields.insert(name, value);
                }
                FieldPolicy::Duplicate => {
                    let owned = value.try_map_objects(&mut |nested| {
                        self.duplicate_into(nested, options, visited)
                    })?;
                    fields.insert(name, owned);
                }
            }
        }
        copy.load_field_values(fields)?;
        identities.id_of(copy.as_ref());
        Ok(copy)
    }

    /// Every object reachable from `root` through persisted fields, `root` first.
    pub fn collect_graph(&self, root: &ObjectRef) -> Result<Vec<ObjectRef>> {
        let identities = self.context.identities();
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        let mut queue = VecDeque::from([root.clone()]);

        while let Some(current) = queue.pop_front() {
            if !seen.insert(identities.id_of(current.as_ref())) {
                continue;
            }
            let descriptor = self.context.types().get(current.type_name())?;
            for (name, value) in current.field_values()? {
                let Some(spec) = self.spec_for(&descriptor, &name, &self.options)? else {
                    continue;
                };
                if !spec.persist || spec.policy == FieldPolicy::Skip {
                    continue;
                }
                value.for_each_object(&mut |nested| queue.push_back(nested.clone()));
            }
            ordered.push(current);
        }
        Ok(ordered)
    }

    pub fn encode_value(&self, value: &FieldValue) -> Result<JsonValue> {
        Ok(match value {
            FieldValue::Null => JsonValue::Null,
            FieldValue::Bool(v) => JsonValue::Bool(*v),
            FieldValue::Integer(v) => JsonValue::Number(Number::from(*v)),
            FieldValue::Float(v) => Number::from_f64(*v).map(JsonValue::Number).ok_or_else(|| {
                GraphError::InvalidValue(format!("non-finite float {} cannot be stored", v))
            })?,
            FieldValue::Text(v) => JsonValue::String(v.clone()),
            FieldValue::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(|item| self.encode_value(item))
                    .collect::<Result<Vec<_>>>()?,
            ),
            FieldValue::Map(entries) => {
                let mut map = JsonMap::new();
                for (key, nested) in entries {
                    map.insert(key.clone(), self.encode_value(nested)?);
                }
                if entries.keys().any(|key| key.starts_with('$')) {
                    let mut wrapper = JsonMap::new();
                    wrapper.insert(INLINE_MAP_KEY.to_string(), JsonValue::Object(map));
                    JsonValue::Object(wrapper)
                } else {
                    JsonValue::Object(map)
                }
            }
            FieldValue::Object(object) => {
                reference_token(&self.context.identities().id_of(object.as_ref()))
            }
            FieldValue::BrokenRef(id) => reference_token(id),
            FieldValue::MalformedRef(raw) => raw_reference_token(raw),
        })
    }

    fn spec_for<'a>(
        &self,
        descriptor: &'a TypeDescriptor,
        field: &str,
        options: &CodecOptions,
    ) -> Result<Option<&'a FieldSpec>> {
        match descriptor.spec(field) {
            Some(spec) => Ok(Some(spec)),
            None if options.ignore_missing_fields => Ok(None),
            None => Err(GraphError::MissingFieldPolicy {
                type_name: descriptor.name().to_string(),
                field: field.to_string(),
            }),
        }
    }
}

fn holds_only_references(value: &FieldValue) -> bool {
    match value {
        FieldValue::Null
        | FieldValue::Object(_)
        | FieldValue::BrokenRef(_)
        | FieldValue::MalformedRef(_) => true,
        FieldValue::List(items) => items.iter().all(holds_only_references),
        FieldValue::Map(entries) => entries.values().all(holds_only_references),
        _ => false,
    }
}

/// Decodes a stored JSON value, substituting resolved objects for tokens.
pub fn decode_value(
    value: &JsonValue,
    resolved: &HashMap<Puuid, ObjectRef>,
) -> Result<FieldValue> {
    Ok(match value {
        JsonValue::Null => FieldValue::Null,
        JsonValue::Bool(v) => FieldValue::Bool(*v),
        JsonValue::Number(n) => match n.as_i64() {
            Some(v) => FieldValue::Integer(v),
            None => FieldValue::Float(n.as_f64().ok_or_else(|| {
                GraphError::Serialization(format!("unsupported number {}", n))
            })?),
        },
        JsonValue::String(v) => FieldValue::Text(v.clone()),
        JsonValue::Array(items) => FieldValue::List(
            items
                .iter()
                .map(|item| decode_value(item, resolved))
                .collect::<Result<Vec<_>>>()?,
        ),
        JsonValue::Object(map) => {
            if let Some(target) = reference_token_target(map) {
                let Ok(id) = Puuid::parse(target) else {
                    return Ok(FieldValue::MalformedRef(target.to_string()));
                };
                return Ok(match resolved.get(&id) {
                    Some(object) => FieldValue::Object(object.clone()),
                    None => FieldValue::BrokenRef(id),
                });
            }
            let entries = unwrap_inline_map(map).unwrap_or(map);
            let mut decoded = BTreeMap::new();
            for (key, nested) in entries {
                decoded.insert(key.clone(), decode_value(nested, resolved)?);
            }
            FieldValue::Map(decoded)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Entity;
    use crate::graph::types::TypeDescriptor;
    use serde_json::json;

    fn codec() -> RecordCodec {
        let context = GraphContext::new();
        context
            .register_type(
                TypeDescriptor::entity("Note")
                    .field("title", FieldPolicy::Copy)
                    .field("meta", FieldPolicy::Copy)
                    .field("owner", FieldPolicy::Reference)
                    .field("draft", FieldPolicy::Skip)
                    .transient("cursor", FieldPolicy::Copy),
            )
            .unwrap();
        context
            .register_type(TypeDescriptor::entity("User").field("name", FieldPolicy::Copy))
            .unwrap();
        RecordCodec::new(context)
    }

    #[test]
    fn test_to_record_encodes_policies() {
        let codec = codec();
        let identities = codec.context().identities();
        let user = Entity::new("User");
        identities.set_id(&user, "U1").unwrap();
        let note = Entity::new("Note");
        identities.set_id(&note, "N1").unwrap();
        note.set_field("title", "hi".into()).unwrap();
        note.set_field("owner", FieldValue::from(&user)).unwrap();
        note.set_field("draft", "scratch".into()).unwrap();
        note.set_field("cursor", 4.into()).unwrap();

        let record = codec.to_record(&note).unwrap();
        assert_eq!(
            record.to_json().unwrap(),
            json!({"id": "N1", "type": "Note", "fields": {"title": "hi", "owner": {"$ref": "U1"}}})
        );
    }

    #[test]
    fn test_inline_maps_with_dollar_keys_are_escaped() {
        let codec = codec();
        let mut meta = BTreeMap::new();
        meta.insert("$ref".to_string(), FieldValue::from("not a reference"));
        let encoded = codec.encode_value(&FieldValue::Map(meta.clone())).unwrap();
        assert_eq!(encoded, json!({"$map": {"$ref": "not a reference"}}));

        let decoded = decode_value(&encoded, &HashMap::new()).unwrap();
        assert_eq!(decoded, FieldValue::Map(meta));
    }

    #[test]
    fn test_missing_policy_is_an_error_unless_ignored() {
        let codec = codec();
        let note = Entity::new("Note");
        note.set_field("color", "red".into()).unwrap();
        assert!(matches!(
            codec.to_record(&note).unwrap_err(),
            GraphError::MissingFieldPolicy { .. }
        ));

        let lenient = RecordCodec::with_options(
            codec.context().clone(),
            CodecOptions {
                ignore_missing_fields: true,
            },
        );
        let record = lenient.to_record(&note).unwrap();
        assert!(record.fields.is_empty());
    }

    #[test]
    fn test_reference_fields_reject_plain_values() {
        let codec = codec();
        let note = Entity::new("Note");
        note.set_field("owner", "U1".into()).unwrap();
        assert!(matches!(
            codec.to_record(&note).unwrap_err(),
            GraphError::InvalidValue(_)
        ));
    }

    #[test]
    fn test_malformed_token_decodes_to_placeholder() {
        let stored = json!([{"$ref": "bad id"}, {"$ref": "U1"}]);
        let decoded = decode_value(&stored, &HashMap::new()).unwrap();
        assert_eq!(
            decoded,
            FieldValue::List(vec![
                FieldValue::MalformedRef("bad id".to_string()),
                FieldValue::BrokenRef(Puuid::parse("U1").unwrap()),
            ])
        );
        assert_eq!(codec().encode_value(&decoded).unwrap(), stored);
    }

    #[test]
    fn test_non_finite_float_is_rejected() {
        let codec = codec();
        assert!(codec.encode_value(&FieldValue::Float(f64::NAN)).is_err());
    }
}
