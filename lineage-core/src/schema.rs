//! Schema registry — the fixed catalogue of vertex labels, edge labels,
//! property-key namespacing and ingestion chain shapes.
//!
//! Everything here is static. The builder walks chains in the order defined
//! here, and the query engine uses the edge classification to decide which
//! edges carry lineage and which are annotations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Vertex labels known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VertexLabel {
    #[serde(rename = "glossaryTerm")]
    GlossaryTerm,
    #[serde(rename = "column")]
    Column,
    #[serde(rename = "table")]
    Table,
    #[serde(rename = "schemaType")]
    SchemaType,
    /// The host/database level of the containment hierarchy.
    #[serde(rename = "host", alias = "database")]
    Host,
    #[serde(rename = "process")]
    Process,
    #[serde(rename = "subProcess")]
    SubProcess,
    /// Only ever synthesized inside query results.
    #[serde(rename = "condensedNode")]
    Condensed,
}

impl VertexLabel {
    pub const ALL: [VertexLabel; 8] = [
        VertexLabel::GlossaryTerm,
        VertexLabel::Column,
        VertexLabel::Table,
        VertexLabel::SchemaType,
        VertexLabel::Host,
        VertexLabel::Process,
        VertexLabel::SubProcess,
        VertexLabel::Condensed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            VertexLabel::GlossaryTerm => "glossaryTerm",
            VertexLabel::Column => "column",
            VertexLabel::Table => "table",
            VertexLabel::SchemaType => "schemaType",
            VertexLabel::Host => "host",
            VertexLabel::Process => "process",
            VertexLabel::SubProcess => "subProcess",
            VertexLabel::Condensed => "condensedNode",
        }
    }

    /// Position in the containment hierarchy, innermost first.
    pub fn containment_rank(self) -> Option<usize> {
        CONTAINMENT_ORDER.iter().position(|l| *l == self)
    }
}

impl fmt::Display for VertexLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VertexLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "database" {
            return Ok(VertexLabel::Host);
        }
        VertexLabel::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("unknown vertex label '{s}'"))
    }
}

/// Edge labels known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeLabel {
    #[serde(rename = "includedIn")]
    IncludedIn,
    #[serde(rename = "semantic-assignment")]
    SemanticAssignment,
    #[serde(rename = "synonym")]
    Synonym,
    #[serde(rename = "processColumn")]
    ColumnAndProcess,
    #[serde(rename = "processTable")]
    TableAndProcess,
    #[serde(rename = "sub-process")]
    SubProcessOf,
    #[serde(rename = "condensed")]
    Condensed,
}

/// How the query engine treats an edge label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeClass {
    /// Data flows along the edge; traversals follow it.
    Flow,
    /// Child-to-container edge; attached as context, never walked as flow.
    Containment,
    /// Annotation only; never traversed.
    Cosmetic,
}

impl EdgeLabel {
    pub const ALL: [EdgeLabel; 7] = [
        EdgeLabel::IncludedIn,
        EdgeLabel::SemanticAssignment,
        EdgeLabel::Synonym,
        EdgeLabel::ColumnAndProcess,
        EdgeLabel::TableAndProcess,
        EdgeLabel::SubProcessOf,
        EdgeLabel::Condensed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EdgeLabel::IncludedIn => "includedIn",
            EdgeLabel::SemanticAssignment => "semantic-assignment",
            EdgeLabel::Synonym => "synonym",
            EdgeLabel::ColumnAndProcess => "processColumn",
            EdgeLabel::TableAndProcess => "processTable",
            EdgeLabel::SubProcessOf => "sub-process",
            EdgeLabel::Condensed => "condensed",
        }
    }

    pub fn class(self) -> EdgeClass {
        match self {
            EdgeLabel::ColumnAndProcess
            | EdgeLabel::TableAndProcess
            | EdgeLabel::SubProcessOf
            | EdgeLabel::Condensed => EdgeClass::Flow,
            EdgeLabel::IncludedIn => EdgeClass::Containment,
            EdgeLabel::SemanticAssignment | EdgeLabel::Synonym => EdgeClass::Cosmetic,
        }
    }

    pub fn is_flow(self) -> bool {
        self.class() == EdgeClass::Flow
    }

    /// Whether an edge of this label may run from a `from` vertex to a `to`
    /// vertex. Edges are directed, so swapped endpoints are usually rejected.
    pub fn allows(self, from: VertexLabel, to: VertexLabel) -> bool {
        use VertexLabel as V;
        match self {
            EdgeLabel::IncludedIn => matches!(
                (from, to),
                (V::Column, V::Table)
                    | (V::Table, V::SchemaType)
                    | (V::SchemaType, V::Host)
                    | (V::Table, V::Host)
            ),
            EdgeLabel::SemanticAssignment => {
                matches!((from, to), (V::Column | V::Table, V::GlossaryTerm))
            }
            EdgeLabel::Synonym => from == V::GlossaryTerm && to == V::GlossaryTerm,
            EdgeLabel::ColumnAndProcess => matches!(
                (from, to),
                (V::Column, V::Process | V::SubProcess) | (V::Process | V::SubProcess, V::Column)
            ),
            EdgeLabel::TableAndProcess => matches!(
                (from, to),
                (V::Table, V::Process | V::SubProcess) | (V::Process | V::SubProcess, V::Table)
            ),
            EdgeLabel::SubProcessOf => from == V::SubProcess && to == V::Process,
            EdgeLabel::Condensed => (from == V::Condensed) != (to == V::Condensed),
        }
    }
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EdgeLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EdgeLabel::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("unknown edge label '{s}'"))
    }
}

/// Containment hierarchy, innermost first.
pub const CONTAINMENT_ORDER: [VertexLabel; 4] = [
    VertexLabel::Column,
    VertexLabel::Table,
    VertexLabel::SchemaType,
    VertexLabel::Host,
];

// ---------------------------------------------------------------------------
// Property keys
// ---------------------------------------------------------------------------

/// Short property names. Stored keys are namespaced via [`PropertyScope`].
pub mod prop {
    pub const GUID: &str = "guid";
    pub const QUALIFIED_NAME: &str = "qualifiedName";
    pub const DISPLAY_NAME: &str = "displayName";
    pub const LABEL: &str = "label";
    pub const VERSION: &str = "version";
    pub const GLOSSARY: &str = "glossary";
    pub const TABLE_DISPLAY_NAME: &str = "tableDisplayname";
    pub const SCHEMA_DISPLAY_NAME: &str = "schemaDisplayname";
    pub const HOST_DISPLAY_NAME: &str = "hostDisplayname";
    pub const FORMULA: &str = "formula";
    pub const DESCRIPTION_URI: &str = "descriptionURI";
    pub const PROCESS_TYPE: &str = "processType";
    pub const PARENT_PROCESS_GUID: &str = "parentProcessGuid";
}

pub const VERTEX_KEY_PREFIX: &str = "ve";
pub const EDGE_KEY_PREFIX: &str = "ed";

/// Which element a stored property key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyScope {
    Vertex,
    Edge,
}

impl PropertyScope {
    pub fn prefix(self) -> &'static str {
        match self {
            PropertyScope::Vertex => VERTEX_KEY_PREFIX,
            PropertyScope::Edge => EDGE_KEY_PREFIX,
        }
    }

    /// Namespaced storage key for a short property name.
    pub fn key(self, name: &str) -> String {
        format!("{}{name}", self.prefix())
    }

    /// Short name of a namespaced key, if it belongs to this scope.
    pub fn strip(self, key: &str) -> Option<&str> {
        key.strip_prefix(self.prefix()).filter(|rest| !rest.is_empty())
    }

    /// Scope a stored key belongs to.
    pub fn of(key: &str) -> Option<PropertyScope> {
        [PropertyScope::Vertex, PropertyScope::Edge]
            .into_iter()
            .find(|scope| scope.strip(key).is_some())
    }
}

// ---------------------------------------------------------------------------
// Ingestion chains
// ---------------------------------------------------------------------------

/// Direction of an edge relative to the chain walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    /// `chain[i] -> chain[i + 1]`
    Forward,
    /// `chain[i + 1] -> chain[i]`
    Reverse,
}

/// Edge created between two adjacent chain elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeStep {
    pub label: EdgeLabel,
    pub orientation: Orientation,
}

impl EdgeStep {
    const fn forward(label: EdgeLabel) -> Self {
        Self {
            label,
            orientation: Orientation::Forward,
        }
    }

    const fn reverse(label: EdgeLabel) -> Self {
        Self {
            label,
            orientation: Orientation::Reverse,
        }
    }

    /// Resolve the `(from, to)` pair for adjacent chain items `a` then `b`.
    pub fn endpoints<T>(&self, a: T, b: T) -> (T, T) {
        match self.orientation {
            Orientation::Forward => (a, b),
            Orientation::Reverse => (b, a),
        }
    }
}

/// Recognised technical-asset chain shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainShape {
    ColumnRooted,
    TableRooted,
}

const COLUMN_CHAIN: [VertexLabel; 5] = [
    VertexLabel::GlossaryTerm,
    VertexLabel::Column,
    VertexLabel::Table,
    VertexLabel::SchemaType,
    VertexLabel::Host,
];

const COLUMN_STEPS: [EdgeStep; 4] = [
    EdgeStep::reverse(EdgeLabel::SemanticAssignment),
    EdgeStep::forward(EdgeLabel::IncludedIn),
    EdgeStep::forward(EdgeLabel::IncludedIn),
    EdgeStep::forward(EdgeLabel::IncludedIn),
];

const TABLE_CHAIN: [VertexLabel; 4] = [
    VertexLabel::GlossaryTerm,
    VertexLabel::Table,
    VertexLabel::SchemaType,
    VertexLabel::Host,
];

const TABLE_STEPS: [EdgeStep; 3] = [
    EdgeStep::reverse(EdgeLabel::SemanticAssignment),
    EdgeStep::forward(EdgeLabel::IncludedIn),
    EdgeStep::forward(EdgeLabel::IncludedIn),
];

impl ChainShape {
    /// Chain shape for a base technical asset, if the label roots one.
    pub fn for_base(label: VertexLabel) -> Option<Self> {
        match label {
            VertexLabel::Column => Some(ChainShape::ColumnRooted),
            VertexLabel::Table => Some(ChainShape::TableRooted),
            _ => None,
        }
    }

    /// Labels in chain order, glossary term first.
    pub fn labels(self) -> &'static [VertexLabel] {
        match self {
            ChainShape::ColumnRooted => &COLUMN_CHAIN,
            ChainShape::TableRooted => &TABLE_CHAIN,
        }
    }

    /// One edge step per adjacent pair of [`ChainShape::labels`].
    pub fn edge_steps(self) -> &'static [EdgeStep] {
        match self {
            ChainShape::ColumnRooted => &COLUMN_STEPS,
            ChainShape::TableRooted => &TABLE_STEPS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_label_roundtrip() {
        for label in VertexLabel::ALL {
            assert_eq!(label.as_str().parse::<VertexLabel>().unwrap(), label);
        }
        assert_eq!("database".parse::<VertexLabel>().unwrap(), VertexLabel::Host);
        assert!("bogus".parse::<VertexLabel>().is_err());
    }

    #[test]
    fn test_edge_label_roundtrip() {
        for label in EdgeLabel::ALL {
            assert_eq!(label.as_str().parse::<EdgeLabel>().unwrap(), label);
        }
    }

    #[test]
    fn test_serde_names_match_as_str() {
        for label in VertexLabel::ALL {
            let json = serde_json::to_string(&label).unwrap();
            assert_eq!(json, format!("\"{}\"", label.as_str()));
        }
        for label in EdgeLabel::ALL {
            let json = serde_json::to_string(&label).unwrap();
            assert_eq!(json, format!("\"{}\"", label.as_str()));
        }
        let host: VertexLabel = serde_json::from_str("\"database\"").unwrap();
        assert_eq!(host, VertexLabel::Host);
    }

    #[test]
    fn test_property_scopes_do_not_collide() {
        let names = [prop::GUID, prop::VERSION, prop::LABEL, prop::DISPLAY_NAME];
        for name in names {
            let v = PropertyScope::Vertex.key(name);
            let e = PropertyScope::Edge.key(name);
            assert_ne!(v, e);
            assert_eq!(PropertyScope::Vertex.strip(&v), Some(name));
            assert_eq!(PropertyScope::Edge.strip(&v), None);
            assert_eq!(PropertyScope::of(&e), Some(PropertyScope::Edge));
        }
        assert_eq!(PropertyScope::Vertex.key(prop::GUID), "veguid");
        assert_eq!(PropertyScope::Edge.key(prop::GUID), "edguid");
    }

    #[test]
    fn test_chain_steps_match_chain_length() {
        for shape in [ChainShape::ColumnRooted, ChainShape::TableRooted] {
            assert_eq!(shape.edge_steps().len() + 1, shape.labels().len());
        }
        assert!(
            ChainShape::ColumnRooted.edge_steps().len() > ChainShape::TableRooted.edge_steps().len()
        );
    }

    #[test]
    fn test_chain_technical_part_follows_containment_order() {
        for shape in [ChainShape::ColumnRooted, ChainShape::TableRooted] {
            let ranks: Vec<usize> = shape.labels()[1..]
                .iter()
                .map(|l| l.containment_rank().unwrap())
                .collect();
            assert!(ranks.windows(2).all(|w| w[0] + 1 == w[1]));
        }
    }

    #[test]
    fn test_chain_steps_are_valid_and_not_reversible() {
        for shape in [ChainShape::ColumnRooted, ChainShape::TableRooted] {
            let labels = shape.labels();
            for (i, step) in shape.edge_steps().iter().enumerate() {
                let (from, to) = step.endpoints(labels[i], labels[i + 1]);
                assert!(step.label.allows(from, to), "{:?} {from}->{to}", step.label);
                assert!(!step.label.allows(to, from), "{:?} {to}->{from}", step.label);
            }
        }
    }

    #[test]
    fn test_for_base_only_roots_column_and_table() {
        assert_eq!(
            ChainShape::for_base(VertexLabel::Column),
            Some(ChainShape::ColumnRooted)
        );
        assert_eq!(
            ChainShape::for_base(VertexLabel::Table),
            Some(ChainShape::TableRooted)
        );
        assert_eq!(ChainShape::for_base(VertexLabel::Process), None);
        assert_eq!(ChainShape::for_base(VertexLabel::Host), None);
    }

    #[test]
    fn test_edge_classes() {
        assert!(EdgeLabel::ColumnAndProcess.is_flow());
        assert!(EdgeLabel::TableAndProcess.is_flow());
        assert_eq!(EdgeLabel::IncludedIn.class(), EdgeClass::Containment);
        assert_eq!(EdgeLabel::SemanticAssignment.class(), EdgeClass::Cosmetic);
        assert_eq!(EdgeLabel::Synonym.class(), EdgeClass::Cosmetic);
    }
}
