//! Whole-graph export and re-import.
//!
//! GraphML output declares a `<key>` for every namespaced property it uses:
//! vertex keys (`ve*`) are declared `for="node"` and edge keys (`ed*`)
//! `for="edge"`, so the two never collide. Artifacts are written through
//! [`crate::persistence::atomic_write`].

use crate::config::ExportFormat;
use crate::error::ExportError;
use crate::model::{Edge, EdgeId, Vertex, VertexData, VertexId};
use crate::persistence;
use crate::schema::{EdgeLabel, PropertyScope, VertexLabel, prop};
use crate::store::{GraphStore, GraphTransaction};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const GRAPHML_NS: &str = "http://graphml.graphdrawing.org/xmlns";

/// A store's vertices and edges, detached from the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDocument {
    pub vertices: Vec<Vertex>,
    pub edges: Vec<Edge>,
}

type EdgeKey = (EdgeLabel, (VertexLabel, String), (VertexLabel, String), BTreeMap<String, String>);

impl GraphDocument {
    pub fn from_store<S: GraphStore>(store: &S) -> Result<Self, ExportError> {
        Ok(Self {
            vertices: store.vertices()?,
            edges: store.all_edges()?,
        })
    }

    /// Vertices and edges keyed by identity rather than store id, sorted.
    fn canonical(&self) -> (Vec<VertexData>, Vec<Option<EdgeKey>>) {
        let mut vertices: Vec<VertexData> = self.vertices.iter().map(|v| v.data.clone()).collect();
        vertices.sort_by(|a, b| {
            (a.label, &a.guid, &a.qualified_name).cmp(&(b.label, &b.guid, &b.qualified_name))
        });

        let identity: HashMap<VertexId, (VertexLabel, String)> = self
            .vertices
            .iter()
            .map(|v| (v.id, (v.label(), v.guid().to_string())))
            .collect();
        let mut edges: Vec<Option<EdgeKey>> = self
            .edges
            .iter()
            .map(|e| {
                Some((
                    e.label,
                    identity.get(&e.from)?.clone(),
                    identity.get(&e.to)?.clone(),
                    e.properties.clone(),
                ))
            })
            .collect();
        edges.sort();
        (vertices, edges)
    }

    /// Order- and id-insensitive equality: same vertex multiset and same
    /// edge multiset, with edges compared by their endpoints' identities.
    pub fn same_multiset(&self, other: &GraphDocument) -> bool {
        self.canonical() == other.canonical()
    }

    /// Import into an empty store, preserving every vertex and edge. Store
    /// ids are reassigned.
    pub fn load_into<S: GraphStore>(&self, store: &S) -> Result<(), ExportError> {
        let existing = store.counts()?.vertices;
        if existing > 0 {
            return Err(ExportError::TargetNotEmpty { vertices: existing });
        }
        let mut tx = store.begin()?;
        let mut ids: HashMap<VertexId, VertexId> = HashMap::with_capacity(self.vertices.len());
        for vertex in &self.vertices {
            ids.insert(vertex.id, tx.create_vertex(&vertex.data)?);
        }
        for edge in &self.edges {
            let endpoint = |id: &VertexId| {
                ids.get(id).copied().ok_or_else(|| {
                    ExportError::Parse(format!("edge {} references unknown vertex {id}", edge.id))
                })
            };
            let (from, to) = (endpoint(&edge.from)?, endpoint(&edge.to)?);
            tx.create_edge(edge.label, from, to, &edge.properties)?;
        }
        tx.commit()?;
        info!(
            vertices = self.vertices.len(),
            edges = self.edges.len(),
            "graph document imported"
        );
        Ok(())
    }
}

/// A serialized graph held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedGraph {
    pub format: ExportFormat,
    pub content: String,
    pub vertices: usize,
    pub edges: usize,
}

/// What an export to disk produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub format: ExportFormat,
    pub vertices: usize,
    pub edges: usize,
    pub bytes: usize,
}

pub struct GraphExporter<S: GraphStore> {
    store: Arc<S>,
}

impl<S: GraphStore> GraphExporter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn export_full(&self, format: ExportFormat) -> Result<SerializedGraph, ExportError> {
        let document = GraphDocument::from_store(&*self.store)?;
        let content = match format {
            ExportFormat::Graphml => write_graphml(&document)?,
            ExportFormat::Json => serde_json::to_string_pretty(&document)?,
        };
        Ok(SerializedGraph {
            format,
            content,
            vertices: document.vertices.len(),
            edges: document.edges.len(),
        })
    }

    /// Export to `path`. The file is replaced atomically, so a failed export
    /// leaves any previous artifact untouched.
    pub fn export_to_path(
        &self,
        path: &Path,
        format: ExportFormat,
    ) -> Result<ExportSummary, ExportError> {
        let serialized = self.export_full(format)?;
        if let Err(e) = persistence::atomic_write(path, serialized.content.as_bytes()) {
            warn!(path = %path.display(), error = %e, "export failed");
            return Err(e.into());
        }
        info!(
            path = %path.display(),
            %format,
            vertices = serialized.vertices,
            edges = serialized.edges,
            "graph exported"
        );
        Ok(ExportSummary {
            path: path.to_path_buf(),
            format,
            vertices: serialized.vertices,
            edges: serialized.edges,
            bytes: serialized.content.len(),
        })
    }
}

/// Read an exported artifact back.
pub fn read_document(path: &Path, format: ExportFormat) -> Result<GraphDocument, ExportError> {
    match format {
        ExportFormat::Json => persistence::load_json(path)?.ok_or_else(|| {
            ExportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            ))
        }),
        ExportFormat::Graphml => parse_graphml(&std::fs::read_to_string(path)?),
    }
}

pub fn parse_json(content: &str) -> Result<GraphDocument, ExportError> {
    Ok(serde_json::from_str(content)?)
}

// ---------------------------------------------------------------------------
// GraphML writer
// ---------------------------------------------------------------------------

fn xml_err(e: impl fmt::Display) -> ExportError {
    ExportError::Xml(e.to_string())
}

fn parse_err(e: impl fmt::Display) -> ExportError {
    ExportError::Parse(e.to_string())
}

fn edge_bag(edge: &Edge) -> BTreeMap<String, String> {
    let scope = PropertyScope::Edge;
    let mut bag: BTreeMap<String, String> = edge
        .properties
        .iter()
        .map(|(name, value)| (scope.key(name), value.clone()))
        .collect();
    bag.insert(scope.key(prop::LABEL), edge.label.to_string());
    bag
}

fn write_data<W: std::io::Write>(
    writer: &mut Writer<W>,
    key: &str,
    value: &str,
) -> Result<(), ExportError> {
    let mut data = BytesStart::new("data");
    data.push_attribute(("key", key));
    writer.write_event(Event::Start(data)).map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("data")))
        .map_err(xml_err)?;
    Ok(())
}

pub fn write_graphml(document: &GraphDocument) -> Result<String, ExportError> {
    let node_bags: Vec<(VertexId, BTreeMap<String, String>)> = document
        .vertices
        .iter()
        .map(|v| (v.id, v.data.to_property_bag()))
        .collect();
    let edge_bags: Vec<(&Edge, BTreeMap<String, String>)> =
        document.edges.iter().map(|e| (e, edge_bag(e))).collect();

    let node_keys: BTreeSet<&str> = node_bags
        .iter()
        .flat_map(|(_, bag)| bag.keys().map(String::as_str))
        .collect();
    let edge_keys: BTreeSet<&str> = edge_bags
        .iter()
        .flat_map(|(_, bag)| bag.keys().map(String::as_str))
        .collect();

    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_err)?;
    let mut root = BytesStart::new("graphml");
    root.push_attribute(("xmlns", GRAPHML_NS));
    writer.write_event(Event::Start(root)).map_err(xml_err)?;

    for (keys, target) in [(&node_keys, "node"), (&edge_keys, "edge")] {
        for key in keys.iter() {
            let mut decl = BytesStart::new("key");
            decl.push_attribute(("id", *key));
            decl.push_attribute(("for", target));
            decl.push_attribute(("attr.name", *key));
            decl.push_attribute(("attr.type", "string"));
            writer.write_event(Event::Empty(decl)).map_err(xml_err)?;
        }
    }

    let mut graph = BytesStart::new("graph");
    graph.push_attribute(("id", "lineage"));
    graph.push_attribute(("edgedefault", "directed"));
    writer.write_event(Event::Start(graph)).map_err(xml_err)?;

    for (id, bag) in &node_bags {
        let mut node = BytesStart::new("node");
        node.push_attribute(("id", id.to_string().as_str()));
        writer.write_event(Event::Start(node)).map_err(xml_err)?;
        for (key, value) in bag {
            write_data(&mut writer, key, value)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("node")))
            .map_err(xml_err)?;
    }

    for (edge, bag) in &edge_bags {
        let mut element = BytesStart::new("edge");
        element.push_attribute(("id", edge.id.to_string().as_str()));
        element.push_attribute(("source", edge.from.to_string().as_str()));
        element.push_attribute(("target", edge.to.to_string().as_str()));
        writer.write_event(Event::Start(element)).map_err(xml_err)?;
        for (key, value) in bag {
            write_data(&mut writer, key, value)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("edge")))
            .map_err(xml_err)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("graph")))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("graphml")))
        .map_err(xml_err)?;

    String::from_utf8(writer.into_inner()).map_err(xml_err)
}

// ---------------------------------------------------------------------------
// GraphML reader
// ---------------------------------------------------------------------------

enum OpenElement {
    Node {
        id: VertexId,
        bag: BTreeMap<String, String>,
    },
    Edge {
        id: EdgeId,
        source: VertexId,
        target: VertexId,
        bag: BTreeMap<String, String>,
    },
}

#[derive(Default)]
struct GraphmlParser {
    keys: HashMap<String, PropertyScope>,
    open: Option<OpenElement>,
    data_key: Option<String>,
    text: String,
    document: GraphDocument,
}

fn attributes(e: &BytesStart<'_>) -> Result<BTreeMap<String, String>, ExportError> {
    let mut out = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(parse_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(parse_err)?.into_owned();
        out.insert(key, value);
    }
    Ok(out)
}

fn required<'a>(
    attrs: &'a BTreeMap<String, String>,
    element: &str,
    name: &str,
) -> Result<&'a str, ExportError> {
    attrs
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ExportError::Parse(format!("<{element}> without '{name}'")))
}

fn element_id(raw: &str, prefix: char) -> Result<i64, ExportError> {
    raw.strip_prefix(prefix)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| ExportError::Parse(format!("malformed id '{raw}'")))
}

impl GraphmlParser {
    fn open(&mut self, e: &BytesStart<'_>, empty: bool) -> Result<(), ExportError> {
        let name = e.name();
        let attrs = attributes(e)?;
        match name.as_ref() {
            b"key" => {
                let id = required(&attrs, "key", "id")?;
                let scope = match required(&attrs, "key", "for")? {
                    "node" => PropertyScope::Vertex,
                    "edge" => PropertyScope::Edge,
                    other => return Err(ExportError::Parse(format!("key for '{other}'"))),
                };
                if scope.strip(id).is_none() {
                    return Err(ExportError::Parse(format!(
                        "key '{id}' is declared for {} data but lacks the '{}' prefix",
                        if scope == PropertyScope::Vertex { "node" } else { "edge" },
                        scope.prefix()
                    )));
                }
                self.keys.insert(id.to_string(), scope);
            }
            b"node" => {
                let id = VertexId(element_id(required(&attrs, "node", "id")?, 'v')?);
                self.open = Some(OpenElement::Node {
                    id,
                    bag: BTreeMap::new(),
                });
                if empty {
                    self.close(b"node")?;
                }
            }
            b"edge" => {
                let id = EdgeId(element_id(required(&attrs, "edge", "id")?, 'e')?);
                let source = VertexId(element_id(required(&attrs, "edge", "source")?, 'v')?);
                let target = VertexId(element_id(required(&attrs, "edge", "target")?, 'v')?);
                self.open = Some(OpenElement::Edge {
                    id,
                    source,
                    target,
                    bag: BTreeMap::new(),
                });
                if empty {
                    self.close(b"edge")?;
                }
            }
            b"data" => {
                let key = required(&attrs, "data", "key")?.to_string();
                let expected = match &self.open {
                    Some(OpenElement::Node { .. }) => PropertyScope::Vertex,
                    Some(OpenElement::Edge { .. }) => PropertyScope::Edge,
                    None => return Err(ExportError::Parse("<data> outside node or edge".into())),
                };
                match self.keys.get(&key) {
                    Some(scope) if *scope == expected => {}
                    Some(_) => {
                        return Err(ExportError::Parse(format!(
                            "key '{key}' used on the wrong element kind"
                        )));
                    }
                    None => return Err(ExportError::Parse(format!("undeclared key '{key}'"))),
                }
                self.data_key = Some(key);
                self.text.clear();
                if empty {
                    self.close(b"data")?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, name: &[u8]) -> Result<(), ExportError> {
        match name {
            b"data" => {
                if let Some(key) = self.data_key.take() {
                    let value = std::mem::take(&mut self.text);
                    match &mut self.open {
                        Some(OpenElement::Node { bag, .. } | OpenElement::Edge { bag, .. }) => {
                            bag.insert(key, value);
                        }
                        None => {}
                    }
                }
            }
            b"node" => {
                if let Some(OpenElement::Node { id, bag }) = self.open.take() {
                    let data = VertexData::from_property_bag(&bag)
                        .map_err(|e| ExportError::Parse(format!("node {id}: {e}")))?;
                    self.document.vertices.push(Vertex { id, data });
                }
            }
            b"edge" => {
                if let Some(OpenElement::Edge {
                    id,
                    source,
                    target,
                    mut bag,
                }) = self.open.take()
                {
                    let scope = PropertyScope::Edge;
                    let label: EdgeLabel = bag
                        .remove(&scope.key(prop::LABEL))
                        .ok_or_else(|| ExportError::Parse(format!("edge {id} has no label")))?
                        .parse()
                        .map_err(|e: String| ExportError::Parse(format!("edge {id}: {e}")))?;
                    let properties = bag
                        .into_iter()
                        .map(|(key, value)| {
                            scope
                                .strip(&key)
                                .map(|name| (name.to_string(), value))
                                .ok_or_else(|| {
                                    ExportError::Parse(format!("edge {id}: stray key '{key}'"))
                                })
                        })
                        .collect::<Result<BTreeMap<_, _>, _>>()?;
                    self.document.edges.push(Edge {
                        id,
                        label,
                        from: source,
                        to: target,
                        properties,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }
}

pub fn parse_graphml(content: &str) -> Result<GraphDocument, ExportError> {
    let mut reader = Reader::from_str(content);
    let mut parser = GraphmlParser::default();
    loop {
        match reader.read_event().map_err(parse_err)? {
            Event::Start(e) => parser.open(&e, false)?,
            Event::Empty(e) => parser.open(&e, true)?,
            Event::Text(t) => {
                if parser.data_key.is_some() {
                    parser.text.push_str(&t.unescape().map_err(parse_err)?);
                }
            }
            Event::End(e) => parser.close(e.name().as_ref())?,
            Event::Eof => break,
            _ => {}
        }
    }
    if parser.open.is_some() {
        return Err(ExportError::Parse("unterminated node or edge".into()));
    }
    Ok(parser.document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryGraphStore, SqliteGraphStore};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample_store() -> Arc<MemoryGraphStore> {
        let store = Arc::new(MemoryGraphStore::new());
        let mut tx = store.begin().unwrap();
        let mut column = VertexData::new(VertexLabel::Column, "c1", "db.orders.id")
            .with_display_name("id <pk> & \"key\"");
        column.extra.insert("owner".into(), "finance".into());
        let c = tx.create_vertex(&column).unwrap();
        let t = tx
            .create_vertex(&VertexData::new(VertexLabel::Table, "t1", "db.orders"))
            .unwrap();
        let g = tx
            .create_vertex(&VertexData::new(VertexLabel::GlossaryTerm, "g1", "Order Id"))
            .unwrap();
        tx.insert_edge_if_absent(EdgeLabel::IncludedIn, c, t).unwrap();
        let mut props = BTreeMap::new();
        props.insert("guid".to_string(), "rel-7".to_string());
        tx.create_edge(EdgeLabel::SemanticAssignment, c, g, &props)
            .unwrap();
        tx.commit().unwrap();
        store
    }

    #[test]
    fn test_graphml_declares_scoped_keys() {
        let exporter = GraphExporter::new(sample_store());
        let out = exporter.export_full(ExportFormat::Graphml).unwrap();
        assert_eq!(out.vertices, 3);
        assert_eq!(out.edges, 2);
        assert!(out.content.contains(r#"<key id="veguid" for="node""#));
        assert!(out.content.contains(r#"<key id="edguid" for="edge""#));
        assert!(out.content.contains(r#"<key id="edlabel" for="edge""#));
        assert!(out.content.contains(r#"<data key="edlabel">semantic-assignment</data>"#));
    }

    #[test]
    fn test_graphml_roundtrip_preserves_graph() {
        let store = sample_store();
        let original = GraphDocument::from_store(&*store).unwrap();
        let xml = write_graphml(&original).unwrap();
        let parsed = parse_graphml(&xml).unwrap();
        assert_eq!(parsed, original);
        assert!(parsed.same_multiset(&original));
    }

    #[test]
    fn test_json_roundtrip_preserves_graph() {
        let exporter = GraphExporter::new(sample_store());
        let out = exporter.export_full(ExportFormat::Json).unwrap();
        let parsed = parse_json(&out.content).unwrap();
        let original = GraphDocument::from_store(&*sample_store()).unwrap();
        assert!(parsed.same_multiset(&original));
    }

    #[test]
    fn test_load_into_reassigns_ids_but_keeps_shape() {
        let original = GraphDocument::from_store(&*sample_store()).unwrap();
        let target = SqliteGraphStore::open_in_memory().unwrap();
        original.load_into(&target).unwrap();
        let reloaded = GraphDocument::from_store(&target).unwrap();
        assert!(reloaded.same_multiset(&original));

        let err = original.load_into(&target).unwrap_err();
        assert!(matches!(err, ExportError::TargetNotEmpty { vertices: 3 }));
    }

    #[test]
    fn test_same_multiset_detects_differences() {
        let original = GraphDocument::from_store(&*sample_store()).unwrap();
        let mut changed = original.clone();
        changed.edges.pop();
        assert!(!original.same_multiset(&changed));

        let mut reordered = original.clone();
        reordered.vertices.reverse();
        reordered.edges.reverse();
        assert!(original.same_multiset(&reordered));
    }

    #[test]
    fn test_parse_rejects_undeclared_key() {
        let xml = r#"<graphml><graph><node id="v0"><data key="veguid">x</data></node></graph></graphml>"#;
        assert!(matches!(parse_graphml(xml), Err(ExportError::Parse(_))));
    }

    #[test]
    fn test_parse_rejects_edge_key_on_node() {
        let xml = r#"<graphml>
            <key id="edguid" for="edge"/>
            <graph><node id="v0"><data key="edguid">x</data></node></graph>
        </graphml>"#;
        assert!(matches!(parse_graphml(xml), Err(ExportError::Parse(_))));
    }

    #[test]
    fn test_export_to_path_writes_atomically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("graph.graphml");
        let exporter = GraphExporter::new(sample_store());
        let summary = exporter.export_to_path(&path, ExportFormat::Graphml).unwrap();
        assert_eq!(summary.vertices, 3);
        assert!(!persistence::staging_path(&path).exists());

        let doc = read_document(&path, ExportFormat::Graphml).unwrap();
        assert_eq!(doc.vertices.len(), 3);
    }

    #[test]
    fn test_failed_export_keeps_previous_artifact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, "previous").unwrap();
        std::fs::create_dir(persistence::staging_path(&path)).unwrap();

        let exporter = GraphExporter::new(sample_store());
        let err = exporter.export_to_path(&path, ExportFormat::Json).unwrap_err();
        assert!(matches!(err, ExportError::Io(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "previous");
    }

    #[test]
    fn test_read_missing_json_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = read_document(&dir.path().join("none.json"), ExportFormat::Json).unwrap_err();
        assert!(matches!(err, ExportError::Io(_)));
    }
}
