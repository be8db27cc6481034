//! Ingestion inputs and persisted graph elements.
//!
//! [`Element`]s arrive with an open-ended property map. They are projected
//! onto [`VertexData`], which keeps the attributes known for the element's
//! label in a typed [`VertexAttributes`] and everything else in `extra`.

use crate::schema::{EdgeLabel, PropertyScope, VertexLabel, prop};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Ingestion inputs
// ---------------------------------------------------------------------------

/// A provenance node descriptor as delivered by the upstream producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub guid: String,
    pub qualified_name: String,
    #[serde(rename = "type")]
    pub element_type: VertexLabel,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

impl Element {
    pub fn new(
        guid: impl Into<String>,
        qualified_name: impl Into<String>,
        element_type: VertexLabel,
    ) -> Self {
        Self {
            guid: guid.into(),
            qualified_name: qualified_name.into(),
            element_type,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Technical-asset chain of an event, keyed by element type.
pub type AssetContext = BTreeMap<VertexLabel, Element>;

/// Identity of the technical asset a glossary term is assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    pub guid: String,
    #[serde(rename = "type")]
    pub asset_type: VertexLabel,
}

/// The unit of ingestion: one glossary-term-to-asset link plus the asset's
/// containment chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipEvent {
    pub glossary_term: Element,
    pub asset_context: AssetContext,
    pub base_asset: AssetRef,
}

impl RelationshipEvent {
    pub fn base_guid(&self) -> &str {
        &self.base_asset.guid
    }
}

// ---------------------------------------------------------------------------
// Persisted elements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VertexId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub i64);

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Attributes the engine understands for each vertex label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum VertexAttributes {
    GlossaryTerm {
        glossary: Option<String>,
    },
    Column {
        table_display_name: Option<String>,
        schema_display_name: Option<String>,
        host_display_name: Option<String>,
    },
    Table {
        schema_display_name: Option<String>,
        host_display_name: Option<String>,
    },
    SchemaType,
    Host,
    Process {
        formula: Option<String>,
        description_uri: Option<String>,
        version: Option<i64>,
        process_type: Option<String>,
    },
    SubProcess {
        parent_process_guid: Option<String>,
        formula: Option<String>,
    },
    Condensed,
}

impl VertexAttributes {
    /// Attributes with every field unset.
    pub fn empty(label: VertexLabel) -> Self {
        match label {
            VertexLabel::GlossaryTerm => VertexAttributes::GlossaryTerm { glossary: None },
            VertexLabel::Column => VertexAttributes::Column {
                table_display_name: None,
                schema_display_name: None,
                host_display_name: None,
            },
            VertexLabel::Table => VertexAttributes::Table {
                schema_display_name: None,
                host_display_name: None,
            },
            VertexLabel::SchemaType => VertexAttributes::SchemaType,
            VertexLabel::Host => VertexAttributes::Host,
            VertexLabel::Process => VertexAttributes::Process {
                formula: None,
                description_uri: None,
                version: None,
                process_type: None,
            },
            VertexLabel::SubProcess => VertexAttributes::SubProcess {
                parent_process_guid: None,
                formula: None,
            },
            VertexLabel::Condensed => VertexAttributes::Condensed,
        }
    }

    /// Set a recognised attribute. Returns `Ok(false)` when `name` is not an
    /// attribute of this label.
    fn set(&mut self, name: &str, value: AttributeValue) -> Result<bool, String> {
        use VertexAttributes as A;
        let slot_str = |slot: &mut Option<String>, value: AttributeValue| -> Result<bool, String> {
            *slot = Some(value.into_string()?);
            Ok(true)
        };
        match (self, name) {
            (A::GlossaryTerm { glossary }, prop::GLOSSARY) => slot_str(glossary, value),
            (
                A::Column {
                    table_display_name, ..
                },
                prop::TABLE_DISPLAY_NAME,
            ) => slot_str(table_display_name, value),
            (
                A::Column {
                    schema_display_name,
                    ..
                }
                | A::Table {
                    schema_display_name,
                    ..
                },
                prop::SCHEMA_DISPLAY_NAME,
            ) => slot_str(schema_display_name, value),
            (
                A::Column {
                    host_display_name, ..
                }
                | A::Table {
                    host_display_name, ..
                },
                prop::HOST_DISPLAY_NAME,
            ) => slot_str(host_display_name, value),
            (A::Process { formula, .. } | A::SubProcess { formula, .. }, prop::FORMULA) => {
                slot_str(formula, value)
            }
            (A::Process {
                description_uri, ..
            }, prop::DESCRIPTION_URI) => slot_str(description_uri, value),
            (A::Process { process_type, .. }, prop::PROCESS_TYPE) => slot_str(process_type, value),
            (A::Process { version, .. }, prop::VERSION) => {
                *version = Some(value.into_long()?);
                Ok(true)
            }
            (
                A::SubProcess {
                    parent_process_guid,
                    ..
                },
                prop::PARENT_PROCESS_GUID,
            ) => slot_str(parent_process_guid, value),
            _ => Ok(false),
        }
    }

    /// Set attributes as short-name/value pairs, in a stable order.
    fn entries(&self) -> Vec<(&'static str, String)> {
        use VertexAttributes as A;
        let mut out = Vec::new();
        let mut push = |name: &'static str, value: &Option<String>| {
            if let Some(v) = value {
                out.push((name, v.clone()));
            }
        };
        match self {
            A::GlossaryTerm { glossary } => push(prop::GLOSSARY, glossary),
            A::Column {
                table_display_name,
                schema_display_name,
                host_display_name,
            } => {
                push(prop::TABLE_DISPLAY_NAME, table_display_name);
                push(prop::SCHEMA_DISPLAY_NAME, schema_display_name);
                push(prop::HOST_DISPLAY_NAME, host_display_name);
            }
            A::Table {
                schema_display_name,
                host_display_name,
            } => {
                push(prop::SCHEMA_DISPLAY_NAME, schema_display_name);
                push(prop::HOST_DISPLAY_NAME, host_display_name);
            }
            A::Process {
                formula,
                description_uri,
                version,
                process_type,
            } => {
                push(prop::FORMULA, formula);
                push(prop::DESCRIPTION_URI, description_uri);
                push(prop::VERSION, &version.map(|v| v.to_string()));
                push(prop::PROCESS_TYPE, process_type);
            }
            A::SubProcess {
                parent_process_guid,
                formula,
            } => {
                push(prop::PARENT_PROCESS_GUID, parent_process_guid);
                push(prop::FORMULA, formula);
            }
            A::SchemaType | A::Host | A::Condensed => {}
        }
        out
    }
}

/// A property value on its way into a typed attribute slot.
enum AttributeValue {
    Json(Value),
    Text(String),
}

impl AttributeValue {
    fn into_string(self) -> Result<String, String> {
        match self {
            AttributeValue::Text(s) | AttributeValue::Json(Value::String(s)) => Ok(s),
            AttributeValue::Json(other) => Err(format!("expected a string, got {other}")),
        }
    }

    fn into_long(self) -> Result<i64, String> {
        match self {
            AttributeValue::Json(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| format!("expected an integer, got {n}")),
            AttributeValue::Json(Value::String(s)) | AttributeValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| format!("expected an integer, got '{s}'")),
            AttributeValue::Json(other) => Err(format!("expected an integer, got {other}")),
        }
    }
}

/// A property that could not be mapped onto a vertex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyError {
    pub key: String,
    pub reason: String,
}

impl fmt::Display for PropertyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "property '{}': {}", self.key, self.reason)
    }
}

impl std::error::Error for PropertyError {}

fn property_error(key: &str, reason: impl Into<String>) -> PropertyError {
    PropertyError {
        key: key.to_string(),
        reason: reason.into(),
    }
}

const RESERVED_NAMES: [&str; 3] = [prop::GUID, prop::QUALIFIED_NAME, prop::LABEL];

/// A property name must survive namespacing: the prefixed key has to strip
/// back to the same non-empty name and be writable as an XML attribute.
fn check_property_name(name: &str) -> Result<(), PropertyError> {
    if name.trim().is_empty() {
        return Err(property_error(name, "empty property name"));
    }
    if name.chars().any(char::is_control) {
        return Err(property_error(name, "control character in property name"));
    }
    Ok(())
}

/// Everything stored for a vertex except its store-assigned id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VertexData {
    pub label: VertexLabel,
    pub guid: String,
    pub qualified_name: String,
    pub display_name: Option<String>,
    pub attributes: VertexAttributes,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl VertexData {
    pub fn new(label: VertexLabel, guid: impl Into<String>, qualified_name: impl Into<String>) -> Self {
        Self {
            label,
            guid: guid.into(),
            qualified_name: qualified_name.into(),
            display_name: None,
            attributes: VertexAttributes::empty(label),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Project an ingested element onto vertex data.
    ///
    /// Known attributes must have a compatible JSON type; unknown ones are
    /// stringified into `extra`. `null` values are treated as absent. Blank
    /// names and names with control characters are rejected.
    pub fn from_element(element: &Element) -> Result<Self, PropertyError> {
        let mut data = VertexData::new(
            element.element_type,
            element.guid.clone(),
            element.qualified_name.clone(),
        );
        for (key, value) in &element.properties {
            check_property_name(key)?;
            if value.is_null() {
                continue;
            }
            if RESERVED_NAMES.contains(&key.as_str()) {
                return Err(property_error(key, "reserved name"));
            }
            if key == prop::DISPLAY_NAME {
                let name = AttributeValue::Json(value.clone())
                    .into_string()
                    .map_err(|reason| property_error(key, reason))?;
                data.display_name = Some(name);
                continue;
            }
            let known = data
                .attributes
                .set(key, AttributeValue::Json(value.clone()))
                .map_err(|reason| property_error(key, reason))?;
            if !known {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                data.extra.insert(key.clone(), text);
            }
        }
        Ok(data)
    }

    /// Flatten into vertex-scoped (`ve`-prefixed) keys.
    pub fn to_property_bag(&self) -> BTreeMap<String, String> {
        let scope = PropertyScope::Vertex;
        let mut bag = BTreeMap::new();
        bag.insert(scope.key(prop::LABEL), self.label.to_string());
        bag.insert(scope.key(prop::GUID), self.guid.clone());
        bag.insert(scope.key(prop::QUALIFIED_NAME), self.qualified_name.clone());
        if let Some(name) = &self.display_name {
            bag.insert(scope.key(prop::DISPLAY_NAME), name.clone());
        }
        for (name, value) in self.attributes.entries() {
            bag.insert(scope.key(name), value);
        }
        for (name, value) in &self.extra {
            bag.entry(scope.key(name)).or_insert_with(|| value.clone());
        }
        bag
    }

    /// Rebuild vertex data from a property bag written by
    /// [`VertexData::to_property_bag`].
    pub fn from_property_bag(bag: &BTreeMap<String, String>) -> Result<Self, PropertyError> {
        let scope = PropertyScope::Vertex;
        let required = |name: &str| {
            bag.get(&scope.key(name))
                .cloned()
                .ok_or_else(|| property_error(&scope.key(name), "missing"))
        };
        let label_key = scope.key(prop::LABEL);
        let label: VertexLabel = required(prop::LABEL)?
            .parse()
            .map_err(|reason: String| property_error(&label_key, reason))?;
        let mut data = VertexData::new(
            label,
            required(prop::GUID)?,
            required(prop::QUALIFIED_NAME)?,
        );
        for (key, value) in bag {
            let Some(name) = scope.strip(key) else {
                return Err(property_error(key, "not a vertex-scoped key"));
            };
            if RESERVED_NAMES.contains(&name) {
                continue;
            }
            if name == prop::DISPLAY_NAME {
                data.display_name = Some(value.clone());
                continue;
            }
            let known = data
                .attributes
                .set(name, AttributeValue::Text(value.clone()))
                .map_err(|reason| property_error(key, reason))?;
            if !known {
                data.extra.insert(name.to_string(), value.clone());
            }
        }
        Ok(data)
    }

    /// Label/guid identity used for upsert.
    pub fn identity(&self) -> (VertexLabel, &str) {
        (self.label, &self.guid)
    }
}

/// A persisted vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vertex {
    pub id: VertexId,
    #[serde(flatten)]
    pub data: VertexData,
}

impl Vertex {
    pub fn label(&self) -> VertexLabel {
        self.data.label
    }

    pub fn guid(&self) -> &str {
        &self.data.guid
    }
}

/// A persisted edge. Property names are short; they are namespaced with the
/// edge scope when written out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub label: EdgeLabel,
    pub from: VertexId,
    pub to: VertexId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

/// Whether an upsert created the element or found it already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted<T> {
    Created(T),
    Existing(T),
}

impl<T: Copy> Upserted<T> {
    pub fn id(&self) -> T {
        match *self {
            Upserted::Created(id) | Upserted::Existing(id) => id,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Upserted::Created(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn process_element() -> Element {
        Element::new("p1", "etl::load_orders", VertexLabel::Process)
            .with_property("displayName", "Load orders")
            .with_property("formula", "SELECT * FROM orders")
            .with_property("version", 3)
            .with_property("owner", "data-eng")
            .with_property("retries", 2)
    }

    #[test]
    fn test_from_element_maps_known_and_extra() {
        let data = VertexData::from_element(&process_element()).unwrap();
        assert_eq!(data.display_name.as_deref(), Some("Load orders"));
        assert_eq!(
            data.attributes,
            VertexAttributes::Process {
                formula: Some("SELECT * FROM orders".into()),
                description_uri: None,
                version: Some(3),
                process_type: None,
            }
        );
        assert_eq!(data.extra.get("owner").map(String::as_str), Some("data-eng"));
        assert_eq!(data.extra.get("retries").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_from_element_rejects_wrong_type() {
        let element = Element::new("p1", "etl", VertexLabel::Process).with_property("version", "v2");
        let err = VertexData::from_element(&element).unwrap_err();
        assert_eq!(err.key, "version");

        let element =
            Element::new("c1", "db.t.c", VertexLabel::Column).with_property("displayName", 7);
        assert!(VertexData::from_element(&element).is_err());
    }

    #[test]
    fn test_from_element_rejects_reserved_name() {
        let element = Element::new("c1", "db.t.c", VertexLabel::Column).with_property("guid", "x");
        let err = VertexData::from_element(&element).unwrap_err();
        assert_eq!(err.reason, "reserved name");
    }

    #[test]
    fn test_from_element_rejects_blank_and_control_names() {
        for name in ["", "  ", "bad\u{0}key"] {
            let element =
                Element::new("t1", "db.t", VertexLabel::Table).with_property(name, "x");
            let err = VertexData::from_element(&element).unwrap_err();
            assert_eq!(err.key, name);
        }
        // Rejected even when the value would otherwise be skipped.
        let element = Element::new("t1", "db.t", VertexLabel::Table).with_property("", json!(null));
        assert!(VertexData::from_element(&element).is_err());
    }

    #[test]
    fn test_attribute_not_known_for_label_goes_to_extra() {
        // `formula` belongs to processes, not columns.
        let element =
            Element::new("c1", "db.t.c", VertexLabel::Column).with_property("formula", "x + 1");
        let data = VertexData::from_element(&element).unwrap();
        assert_eq!(data.extra.get("formula").map(String::as_str), Some("x + 1"));
    }

    #[test]
    fn test_null_properties_are_absent() {
        let element = Element::new("t1", "db.t", VertexLabel::Table)
            .with_property("displayName", json!(null));
        let data = VertexData::from_element(&element).unwrap();
        assert_eq!(data.display_name, None);
    }

    #[test]
    fn test_property_bag_roundtrip() {
        let data = VertexData::from_element(&process_element()).unwrap();
        let bag = data.to_property_bag();
        assert_eq!(bag.get("veguid").map(String::as_str), Some("p1"));
        assert_eq!(bag.get("velabel").map(String::as_str), Some("process"));
        assert_eq!(bag.get("veversion").map(String::as_str), Some("3"));
        assert!(bag.keys().all(|k| k.starts_with("ve")));
        assert_eq!(VertexData::from_property_bag(&bag).unwrap(), data);
    }

    #[test]
    fn test_property_bag_rejects_edge_keys() {
        let mut bag = VertexData::new(VertexLabel::Host, "h1", "host1").to_property_bag();
        bag.insert("edguid".into(), "r1".into());
        let err = VertexData::from_property_bag(&bag).unwrap_err();
        assert_eq!(err.key, "edguid");
    }

    #[test]
    fn test_event_deserializes_from_json() {
        let raw = json!({
            "glossaryTerm": {"guid": "g1", "qualifiedName": "Customer Id", "type": "glossaryTerm"},
            "assetContext": {
                "table": {"guid": "t1", "qualifiedName": "db.orders", "type": "table"},
                "schemaType": {"guid": "s1", "qualifiedName": "db.schema", "type": "schemaType"},
                "database": {"guid": "h1", "qualifiedName": "db", "type": "database"}
            },
            "baseAsset": {"guid": "t1", "type": "table"}
        });
        let event: RelationshipEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.base_guid(), "t1");
        assert_eq!(event.asset_context.len(), 3);
        assert!(event.asset_context.contains_key(&VertexLabel::Host));
    }
}
