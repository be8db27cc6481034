//! Graph store seam.
//!
//! The engine never owns a process-wide store handle. Callers open a backend,
//! wrap it in an `Arc` and hand it to the builder, query engine, exporter or
//! generator. Writes go through a [`GraphTransaction`]: `commit` consumes it,
//! and dropping it uncommitted rolls everything back.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryGraphStore;
pub use sqlite::SqliteGraphStore;

use crate::error::StoreError;
use crate::model::{Edge, EdgeId, Upserted, Vertex, VertexData, VertexId};
use crate::schema::{EdgeLabel, VertexLabel};
use petgraph::Direction;
use serde::Serialize;
use std::collections::BTreeMap;

/// Vertex/edge totals, overall and per label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphCounts {
    pub vertices: usize,
    pub edges: usize,
    pub vertices_by_label: BTreeMap<VertexLabel, usize>,
    pub edges_by_label: BTreeMap<EdgeLabel, usize>,
}

impl GraphCounts {
    pub fn vertices_of(&self, label: VertexLabel) -> usize {
        self.vertices_by_label.get(&label).copied().unwrap_or(0)
    }

    pub fn edges_of(&self, label: EdgeLabel) -> usize {
        self.edges_by_label.get(&label).copied().unwrap_or(0)
    }
}

/// Read access to a property-graph store.
pub trait GraphStore: Send + Sync {
    /// Scoped write unit; see [`GraphTransaction`].
    type Tx<'a>: GraphTransaction
    where
        Self: 'a;

    /// Begin a write transaction. Backends serialise writers, so this blocks
    /// while another transaction is open.
    fn begin(&self) -> Result<Self::Tx<'_>, StoreError>;

    fn vertex(&self, id: VertexId) -> Result<Option<Vertex>, StoreError>;

    fn find_vertex(&self, label: VertexLabel, guid: &str) -> Result<Option<Vertex>, StoreError>;

    /// Look a vertex up by guid alone. Guids are globally unique across
    /// labels; if a store nonetheless holds several, the lowest id wins.
    fn find_by_guid(&self, guid: &str) -> Result<Option<Vertex>, StoreError>;

    /// Edges leaving (`Outgoing`) or entering (`Incoming`) a vertex, by id.
    fn edges(&self, vertex: VertexId, direction: Direction) -> Result<Vec<Edge>, StoreError>;

    /// All vertices, by id.
    fn vertices(&self) -> Result<Vec<Vertex>, StoreError>;

    /// All edges, by id.
    fn all_edges(&self) -> Result<Vec<Edge>, StoreError>;

    fn counts(&self) -> Result<GraphCounts, StoreError> {
        let mut counts = GraphCounts::default();
        for vertex in self.vertices()? {
            counts.vertices += 1;
            *counts.vertices_by_label.entry(vertex.label()).or_default() += 1;
        }
        for edge in self.all_edges()? {
            counts.edges += 1;
            *counts.edges_by_label.entry(edge.label).or_default() += 1;
        }
        Ok(counts)
    }
}

/// A write transaction. Identity rules enforced by every backend:
/// at most one vertex per `(label, guid)` and at most one edge per
/// `(label, from, to)`.
pub trait GraphTransaction {
    fn find_vertex(&mut self, label: VertexLabel, guid: &str)
    -> Result<Option<VertexId>, StoreError>;

    fn vertex_data(&mut self, id: VertexId) -> Result<Option<VertexData>, StoreError>;

    /// Atomic upsert-if-absent. An existing vertex is left untouched.
    fn insert_vertex_if_absent(&mut self, data: &VertexData)
    -> Result<Upserted<VertexId>, StoreError>;

    /// Atomic upsert-if-absent for an edge with no properties.
    fn insert_edge_if_absent(
        &mut self,
        label: EdgeLabel,
        from: VertexId,
        to: VertexId,
    ) -> Result<Upserted<EdgeId>, StoreError>;

    /// Create a vertex that must not exist yet (`DuplicateConflict` otherwise).
    fn create_vertex(&mut self, data: &VertexData) -> Result<VertexId, StoreError>;

    /// Create an edge that must not exist yet (`DuplicateConflict` otherwise).
    fn create_edge(
        &mut self,
        label: EdgeLabel,
        from: VertexId,
        to: VertexId,
        properties: &BTreeMap<String, String>,
    ) -> Result<EdgeId, StoreError>;

    fn commit(self) -> Result<(), StoreError>;
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every backend must share.

    use super::*;

    fn host(guid: &str) -> VertexData {
        VertexData::new(VertexLabel::Host, guid, format!("host:{guid}"))
    }

    fn table(guid: &str) -> VertexData {
        VertexData::new(VertexLabel::Table, guid, format!("table:{guid}")).with_display_name(guid)
    }

    pub fn upsert_is_idempotent<S: GraphStore>(store: &S) {
        let mut tx = store.begin().unwrap();
        let t = tx.insert_vertex_if_absent(&table("t1")).unwrap();
        let h = tx.insert_vertex_if_absent(&host("h1")).unwrap();
        assert!(t.was_created() && h.was_created());
        let e = tx
            .insert_edge_if_absent(EdgeLabel::IncludedIn, t.id(), h.id())
            .unwrap();
        assert!(e.was_created());
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        let t2 = tx.insert_vertex_if_absent(&table("t1")).unwrap();
        assert_eq!(t2, Upserted::Existing(t.id()));
        let e2 = tx
            .insert_edge_if_absent(EdgeLabel::IncludedIn, t.id(), h.id())
            .unwrap();
        assert_eq!(e2, Upserted::Existing(e.id()));
        tx.commit().unwrap();

        let counts = store.counts().unwrap();
        assert_eq!(counts.vertices, 2);
        assert_eq!(counts.edges, 1);
        assert_eq!(counts.vertices_of(VertexLabel::Table), 1);
        assert_eq!(counts.edges_of(EdgeLabel::IncludedIn), 1);
    }

    pub fn same_guid_different_label_is_distinct<S: GraphStore>(store: &S) {
        let mut tx = store.begin().unwrap();
        tx.insert_vertex_if_absent(&table("x")).unwrap();
        tx.insert_vertex_if_absent(&host("x")).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.counts().unwrap().vertices, 2);
        assert!(store.find_vertex(VertexLabel::Host, "x").unwrap().is_some());
    }

    pub fn dropped_transaction_rolls_back<S: GraphStore>(store: &S) {
        {
            let mut tx = store.begin().unwrap();
            let t = tx.insert_vertex_if_absent(&table("t1")).unwrap().id();
            let h = tx.insert_vertex_if_absent(&host("h1")).unwrap().id();
            tx.insert_edge_if_absent(EdgeLabel::IncludedIn, t, h)
                .unwrap();
            assert!(tx.find_vertex(VertexLabel::Table, "t1").unwrap().is_some());
        }
        let counts = store.counts().unwrap();
        assert_eq!(counts.vertices, 0);
        assert_eq!(counts.edges, 0);
        assert!(store.find_by_guid("t1").unwrap().is_none());

        // The store stays usable afterwards.
        let mut tx = store.begin().unwrap();
        tx.insert_vertex_if_absent(&table("t2")).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.counts().unwrap().vertices, 1);
    }

    pub fn create_reports_duplicates<S: GraphStore>(store: &S) {
        let mut tx = store.begin().unwrap();
        let t = tx.create_vertex(&table("t1")).unwrap();
        let h = tx.create_vertex(&host("h1")).unwrap();
        let err = tx.create_vertex(&table("t1")).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateConflict { .. }));
        let mut props = BTreeMap::new();
        props.insert("guid".to_string(), "rel-1".to_string());
        tx.create_edge(EdgeLabel::IncludedIn, t, h, &props).unwrap();
        let err = tx
            .create_edge(EdgeLabel::IncludedIn, t, h, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateConflict { .. }));
        tx.commit().unwrap();

        let edges = store.edges(t, Direction::Outgoing).unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].properties.get("guid").map(String::as_str), Some("rel-1"));
    }

    pub fn reads_round_trip_vertex_data<S: GraphStore>(store: &S) {
        let mut data = table("t1");
        data.extra.insert("owner".into(), "finance".into());
        let mut tx = store.begin().unwrap();
        let id = tx.insert_vertex_if_absent(&data).unwrap().id();
        let h = tx.insert_vertex_if_absent(&host("h1")).unwrap().id();
        tx.insert_edge_if_absent(EdgeLabel::IncludedIn, id, h).unwrap();
        assert_eq!(tx.vertex_data(id).unwrap(), Some(data.clone()));
        tx.commit().unwrap();

        let stored = store.vertex(id).unwrap().unwrap();
        assert_eq!(stored.data, data);
        assert_eq!(store.find_by_guid("t1").unwrap().unwrap().id, id);
        assert_eq!(store.edges(h, Direction::Incoming).unwrap().len(), 1);
        assert_eq!(store.edges(h, Direction::Outgoing).unwrap().len(), 0);
        let all = store.vertices().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
    }

    pub fn edge_to_missing_vertex_is_corrupt<S: GraphStore>(store: &S) {
        let mut tx = store.begin().unwrap();
        let t = tx.insert_vertex_if_absent(&table("t1")).unwrap().id();
        let missing = VertexId(999);
        let err = tx
            .insert_edge_if_absent(EdgeLabel::IncludedIn, t, missing)
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)), "got {err}");
        let err = tx
            .create_edge(EdgeLabel::IncludedIn, t, missing, &BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)), "got {err}");
    }
}
