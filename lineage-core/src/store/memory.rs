//! In-memory graph store on top of a `petgraph` directed graph.
//!
//! Writes are applied directly and recorded in an undo log; rolling back
//! replays the log in reverse. Because the log only ever removes the most
//! recently added node or edge, petgraph's swap-remove never moves an index
//! that is still referenced.

use super::{GraphStore, GraphTransaction};
use crate::error::StoreError;
use crate::model::{Edge, EdgeId, Upserted, Vertex, VertexData, VertexId};
use crate::schema::{EdgeLabel, VertexLabel};
use petgraph::Direction;
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

type VertexKey = (VertexLabel, String);
type EdgeKey = (EdgeLabel, NodeIndex, NodeIndex);

#[derive(Debug, Clone)]
struct EdgeWeight {
    label: EdgeLabel,
    properties: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct MemoryGraph {
    graph: DiGraph<VertexData, EdgeWeight>,
    vertex_index: HashMap<VertexKey, NodeIndex>,
    edge_index: HashMap<EdgeKey, EdgeIndex>,
}

impl MemoryGraph {
    fn node(&self, id: VertexId) -> Option<NodeIndex> {
        let idx = NodeIndex::new(usize::try_from(id.0).ok()?);
        self.graph.node_weight(idx).map(|_| idx)
    }

    fn to_vertex(&self, idx: NodeIndex) -> Option<Vertex> {
        self.graph.node_weight(idx).map(|data| Vertex {
            id: vertex_id(idx),
            data: data.clone(),
        })
    }

    fn to_edge(&self, idx: EdgeIndex) -> Option<Edge> {
        let (from, to) = self.graph.edge_endpoints(idx)?;
        let weight = self.graph.edge_weight(idx)?;
        Some(Edge {
            id: EdgeId(idx.index() as i64),
            label: weight.label,
            from: vertex_id(from),
            to: vertex_id(to),
            properties: weight.properties.clone(),
        })
    }
}

fn vertex_id(idx: NodeIndex) -> VertexId {
    VertexId(idx.index() as i64)
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("in-memory graph lock poisoned".into())
}

/// Volatile store, used for tests and isolated synthetic graphs.
#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    inner: RwLock<MemoryGraph>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryGraph>, StoreError> {
        self.inner.read().map_err(|_| poisoned())
    }
}

impl GraphStore for MemoryGraphStore {
    type Tx<'a> = MemoryTransaction<'a>;

    fn begin(&self) -> Result<MemoryTransaction<'_>, StoreError> {
        let graph = self.inner.write().map_err(|_| poisoned())?;
        Ok(MemoryTransaction {
            graph,
            undo: Vec::new(),
            committed: false,
        })
    }

    fn vertex(&self, id: VertexId) -> Result<Option<Vertex>, StoreError> {
        let g = self.read()?;
        Ok(g.node(id).and_then(|idx| g.to_vertex(idx)))
    }

    fn find_vertex(&self, label: VertexLabel, guid: &str) -> Result<Option<Vertex>, StoreError> {
        let g = self.read()?;
        Ok(g.vertex_index
            .get(&(label, guid.to_string()))
            .and_then(|idx| g.to_vertex(*idx)))
    }

    fn find_by_guid(&self, guid: &str) -> Result<Option<Vertex>, StoreError> {
        let g = self.read()?;
        let first = VertexLabel::ALL
            .into_iter()
            .filter_map(|label| g.vertex_index.get(&(label, guid.to_string())).copied())
            .min();
        Ok(first.and_then(|idx| g.to_vertex(idx)))
    }

    fn edges(&self, vertex: VertexId, direction: Direction) -> Result<Vec<Edge>, StoreError> {
        let g = self.read()?;
        let Some(idx) = g.node(vertex) else {
            return Ok(Vec::new());
        };
        let mut edges: Vec<Edge> = g
            .graph
            .edges_directed(idx, direction)
            .filter_map(|e| g.to_edge(e.id()))
            .collect();
        edges.sort_by_key(|e| e.id);
        Ok(edges)
    }

    fn vertices(&self) -> Result<Vec<Vertex>, StoreError> {
        let g = self.read()?;
        Ok(g.graph
            .node_indices()
            .filter_map(|idx| g.to_vertex(idx))
            .collect())
    }

    fn all_edges(&self) -> Result<Vec<Edge>, StoreError> {
        let g = self.read()?;
        Ok(g.graph
            .edge_indices()
            .filter_map(|idx| g.to_edge(idx))
            .collect())
    }
}

enum Undo {
    Vertex(VertexKey),
    Edge(EdgeKey, EdgeIndex),
}

/// Write transaction holding the store's write lock until commit or drop.
pub struct MemoryTransaction<'a> {
    graph: RwLockWriteGuard<'a, MemoryGraph>,
    undo: Vec<Undo>,
    committed: bool,
}

impl MemoryTransaction<'_> {
    fn node(&self, id: VertexId) -> Result<NodeIndex, StoreError> {
        self.graph
            .node(id)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown vertex {id}")))
    }

    fn add_vertex(&mut self, data: &VertexData) -> NodeIndex {
        let key = (data.label, data.guid.clone());
        let idx = self.graph.graph.add_node(data.clone());
        self.graph.vertex_index.insert(key.clone(), idx);
        self.undo.push(Undo::Vertex(key));
        idx
    }

    fn add_edge(
        &mut self,
        key: EdgeKey,
        properties: BTreeMap<String, String>,
    ) -> EdgeIndex {
        let (label, from, to) = key;
        let idx = self
            .graph
            .graph
            .add_edge(from, to, EdgeWeight { label, properties });
        self.graph.edge_index.insert(key, idx);
        self.undo.push(Undo::Edge(key, idx));
        idx
    }

    fn rollback(&mut self) {
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Edge(key, idx) => {
                    self.graph.graph.remove_edge(idx);
                    self.graph.edge_index.remove(&key);
                }
                Undo::Vertex(key) => {
                    if let Some(idx) = self.graph.vertex_index.remove(&key) {
                        self.graph.graph.remove_node(idx);
                    }
                }
            }
        }
    }
}

impl GraphTransaction for MemoryTransaction<'_> {
    fn find_vertex(
        &mut self,
        label: VertexLabel,
        guid: &str,
    ) -> Result<Option<VertexId>, StoreError> {
        Ok(self
            .graph
            .vertex_index
            .get(&(label, guid.to_string()))
            .map(|idx| vertex_id(*idx)))
    }

    fn vertex_data(&mut self, id: VertexId) -> Result<Option<VertexData>, StoreError> {
        Ok(self
            .graph
            .node(id)
            .and_then(|idx| self.graph.graph.node_weight(idx).cloned()))
    }

    fn insert_vertex_if_absent(
        &mut self,
        data: &VertexData,
    ) -> Result<Upserted<VertexId>, StoreError> {
        if let Some(id) = self.find_vertex(data.label, &data.guid)? {
            return Ok(Upserted::Existing(id));
        }
        Ok(Upserted::Created(vertex_id(self.add_vertex(data))))
    }

    fn insert_edge_if_absent(
        &mut self,
        label: EdgeLabel,
        from: VertexId,
        to: VertexId,
    ) -> Result<Upserted<EdgeId>, StoreError> {
        let key = (label, self.node(from)?, self.node(to)?);
        if let Some(idx) = self.graph.edge_index.get(&key) {
            return Ok(Upserted::Existing(EdgeId(idx.index() as i64)));
        }
        let idx = self.add_edge(key, BTreeMap::new());
        Ok(Upserted::Created(EdgeId(idx.index() as i64)))
    }

    fn create_vertex(&mut self, data: &VertexData) -> Result<VertexId, StoreError> {
        if self.find_vertex(data.label, &data.guid)?.is_some() {
            return Err(StoreError::duplicate_vertex(data.label, &data.guid));
        }
        Ok(vertex_id(self.add_vertex(data)))
    }

    fn create_edge(
        &mut self,
        label: EdgeLabel,
        from: VertexId,
        to: VertexId,
        properties: &BTreeMap<String, String>,
    ) -> Result<EdgeId, StoreError> {
        let key = (label, self.node(from)?, self.node(to)?);
        if self.graph.edge_index.contains_key(&key) {
            return Err(StoreError::duplicate_edge(label, from.0, to.0));
        }
        let idx = self.add_edge(key, properties.clone());
        Ok(EdgeId(idx.index() as i64))
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.undo.clear();
        self.committed = true;
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    #[test]
    fn test_upsert_is_idempotent() {
        conformance::upsert_is_idempotent(&MemoryGraphStore::new());
    }

    #[test]
    fn test_same_guid_different_label() {
        conformance::same_guid_different_label_is_distinct(&MemoryGraphStore::new());
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        conformance::dropped_transaction_rolls_back(&MemoryGraphStore::new());
    }

    #[test]
    fn test_create_reports_duplicates() {
        conformance::create_reports_duplicates(&MemoryGraphStore::new());
    }

    #[test]
    fn test_reads_round_trip_vertex_data() {
        conformance::reads_round_trip_vertex_data(&MemoryGraphStore::new());
    }

    #[test]
    fn test_edge_to_missing_vertex_is_corrupt() {
        conformance::edge_to_missing_vertex_is_corrupt(&MemoryGraphStore::new());
    }

    #[test]
    fn test_rollback_preserves_earlier_commits() {
        let store = MemoryGraphStore::new();
        let mut tx = store.begin().unwrap();
        let a = tx
            .create_vertex(&VertexData::new(VertexLabel::Table, "a", "a"))
            .unwrap();
        tx.commit().unwrap();

        {
            let mut tx = store.begin().unwrap();
            let b = tx
                .create_vertex(&VertexData::new(VertexLabel::Host, "b", "b"))
                .unwrap();
            tx.insert_edge_if_absent(EdgeLabel::IncludedIn, a, b).unwrap();
        }

        assert_eq!(store.vertices().unwrap().len(), 1);
        assert!(store.edges(a, Direction::Outgoing).unwrap().is_empty());
        assert!(store.find_vertex(VertexLabel::Host, "b").unwrap().is_none());
    }
}
