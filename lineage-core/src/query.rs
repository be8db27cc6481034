//! Lineage query engine.
//!
//! A traversal walks flow edges (`processColumn`, `processTable`,
//! `sub-process`) from a start vertex, condenses long uninteresting chains
//! and then attaches the containment ancestry of every remaining flow vertex
//! as context. A [`LineageView`] picks the granularity of the answer. The
//! glossary lookup follows semantic assignments instead of flow edges.
//! Queries only read the store.

use crate::config::QueryConfig;
use crate::error::QueryError;
use crate::model::{Edge, EdgeId, Vertex, VertexId};
use crate::schema::{EdgeClass, EdgeLabel, VertexLabel};
use crate::store::GraphStore;
use petgraph::Direction;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Display marker carried by every condensed node.
pub const CONDENSED_MARKER: &str = "condensed";

/// Directionality of a traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// Walk backward to the root producers.
    UltimateSource,
    /// Walk forward to the terminal consumers.
    UltimateDestination,
    /// Union of an independent backward walk and forward walk.
    EndToEnd,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::UltimateSource => "ultimate-source",
            Scope::UltimateDestination => "ultimate-destination",
            Scope::EndToEnd => "end-to-end",
        }
    }

    fn directions(self) -> &'static [Direction] {
        match self {
            Scope::UltimateSource => &[Direction::Incoming],
            Scope::UltimateDestination => &[Direction::Outgoing],
            Scope::EndToEnd => &[Direction::Incoming, Direction::Outgoing],
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "ultimate-source" | "source" => Ok(Scope::UltimateSource),
            "ultimate-destination" | "destination" => Ok(Scope::UltimateDestination),
            "end-to-end" | "both" => Ok(Scope::EndToEnd),
            other => Err(format!("unknown scope '{other}'")),
        }
    }
}

/// Granularity of a traversal answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineageView {
    /// Hosts and the processes moving data between them.
    Host,
    /// Tables and processes; column-level flow is not followed.
    Table,
    /// Everything, down to columns.
    #[default]
    Column,
}

impl LineageView {
    pub fn as_str(self) -> &'static str {
        match self {
            LineageView::Host => "host",
            LineageView::Table => "table",
            LineageView::Column => "column",
        }
    }

    /// Whether the walk follows edges with this label.
    fn follows(self, label: EdgeLabel) -> bool {
        match self {
            LineageView::Column => label.is_flow(),
            LineageView::Table | LineageView::Host => {
                label.is_flow() && label != EdgeLabel::ColumnAndProcess
            }
        }
    }

    /// Whether vertices with this label appear in the answer.
    pub fn shows(self, label: VertexLabel) -> bool {
        match self {
            LineageView::Column => true,
            LineageView::Table => label != VertexLabel::Column,
            LineageView::Host => matches!(
                label,
                VertexLabel::Host
                    | VertexLabel::Process
                    | VertexLabel::SubProcess
                    | VertexLabel::Condensed
            ),
        }
    }
}

impl fmt::Display for LineageView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LineageView {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_ascii_lowercase().replace('_', "-");
        match s.strip_suffix("-view").unwrap_or(&s) {
            "host" => Ok(LineageView::Host),
            "table" => Ok(LineageView::Table),
            "column" => Ok(LineageView::Column),
            other => Err(format!("unknown view '{other}'")),
        }
    }
}

/// Hard limits and abort signals for a traversal.
#[derive(Debug, Clone)]
pub struct TraversalBudget {
    /// Maximum number of flow hops from the start vertex.
    pub max_depth: usize,
    /// Maximum number of vertices collected, context included.
    pub max_nodes: usize,
    pub deadline: Option<Instant>,
    pub cancel: Option<CancellationToken>,
}

impl Default for TraversalBudget {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_nodes: 10_000,
            deadline: None,
            cancel: None,
        }
    }
}

impl TraversalBudget {
    /// Budget from configuration; the deadline starts counting now.
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_nodes: config.max_nodes,
            deadline: config
                .timeout_secs
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn check(&self, visited: usize) -> Result<(), QueryError> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(QueryError::Cancelled { visited });
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(QueryError::DeadlineExceeded { visited });
        }
        Ok(())
    }
}

/// Why a traversal result is incomplete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Truncation {
    DepthLimit,
    NodeLimit,
}

/// Identifier of a node inside a query result: either a stored vertex or a
/// condensed node synthesised for this result only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    Vertex(VertexId),
    Condensed(u32),
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeId::Vertex(id) => write!(f, "{id}"),
            NodeId::Condensed(n) => write!(f, "c{n}"),
        }
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A run of elided flow vertices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CondensedNode {
    pub marker: &'static str,
    /// Boundary vertex before the run.
    pub from_guid: String,
    /// Boundary vertex after the run.
    pub to_guid: String,
    pub first_elided_guid: String,
    pub last_elided_guid: String,
    pub elided_count: usize,
    /// The traversal's start vertex is one of the elided vertices.
    pub contains_start: bool,
}

/// How a stored vertex got into a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Reached over flow edges (or the start vertex).
    Flow,
    /// Containment ancestor of a flow vertex.
    Context,
    /// The vertex a glossary lookup was asked about.
    Subject,
    /// Linked to the subject by a semantic assignment or a synonym.
    Assigned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SubgraphNode {
    Vertex {
        id: NodeId,
        role: NodeRole,
        vertex: Vertex,
    },
    Condensed {
        id: NodeId,
        condensed: CondensedNode,
    },
}

impl SubgraphNode {
    pub fn id(&self) -> NodeId {
        match self {
            SubgraphNode::Vertex { id, .. } | SubgraphNode::Condensed { id, .. } => *id,
        }
    }

    pub fn vertex(&self) -> Option<&Vertex> {
        match self {
            SubgraphNode::Vertex { vertex, .. } => Some(vertex),
            SubgraphNode::Condensed { .. } => None,
        }
    }

    pub fn condensed(&self) -> Option<&CondensedNode> {
        match self {
            SubgraphNode::Condensed { condensed, .. } => Some(condensed),
            SubgraphNode::Vertex { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubgraphEdge {
    /// Stored edge id; `None` for condensed edges.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<EdgeId>,
    pub label: EdgeLabel,
    pub from: NodeId,
    pub to: NodeId,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl SubgraphEdge {
    fn stored(edge: &Edge) -> Self {
        Self {
            id: Some(edge.id),
            label: edge.label,
            from: NodeId::Vertex(edge.from),
            to: NodeId::Vertex(edge.to),
            properties: edge.properties.clone(),
        }
    }

    fn condensed(from: NodeId, to: NodeId) -> Self {
        Self {
            id: None,
            label: EdgeLabel::Condensed,
            from,
            to,
            properties: BTreeMap::new(),
        }
    }
}

/// Vertices and edges of a query result. Nodes are sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Subgraph {
    pub nodes: Vec<SubgraphNode>,
    pub edges: Vec<SubgraphEdge>,
}

impl Subgraph {
    pub fn find_guid(&self, guid: &str) -> Option<&SubgraphNode> {
        self.nodes
            .iter()
            .find(|n| n.vertex().is_some_and(|v| v.guid() == guid))
    }

    pub fn contains_guid(&self, guid: &str) -> bool {
        self.find_guid(guid).is_some()
    }

    pub fn condensed_nodes(&self) -> impl Iterator<Item = &CondensedNode> {
        self.nodes.iter().filter_map(SubgraphNode::condensed)
    }

    /// Flow nodes with no incoming (`Incoming`) or outgoing (`Outgoing`)
    /// flow edge inside this subgraph.
    pub fn flow_endpoints(&self, direction: Direction) -> Vec<&Vertex> {
        let linked: HashSet<NodeId> = self
            .edges
            .iter()
            .filter(|e| e.label.is_flow())
            .map(|e| match direction {
                Direction::Incoming => e.to,
                Direction::Outgoing => e.from,
            })
            .collect();
        self.nodes
            .iter()
            .filter_map(|n| match n {
                SubgraphNode::Vertex {
                    id,
                    role: NodeRole::Flow,
                    vertex,
                } if !linked.contains(id) => Some(vertex),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineageResult {
    /// Start vertex after view lifting: a column start becomes its table in
    /// the table and host views.
    pub start: Vertex,
    pub scope: Scope,
    pub view: LineageView,
    pub subgraph: Subgraph,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<Truncation>,
}

impl LineageResult {
    pub fn is_truncated(&self) -> bool {
        self.truncated.is_some()
    }
}

/// Glossary terms of an asset, or assets and synonyms of a glossary term,
/// with the containment context of every asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlossaryResult {
    pub subject: Vertex,
    pub subgraph: Subgraph,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<Truncation>,
}

impl GlossaryResult {
    /// Vertices linked to the subject, in id order.
    pub fn assigned(&self) -> impl Iterator<Item = &Vertex> {
        self.subgraph.nodes.iter().filter_map(|n| match n {
            SubgraphNode::Vertex {
                role: NodeRole::Assigned,
                vertex,
                ..
            } => Some(vertex),
            _ => None,
        })
    }
}

/// Flow vertices and edges gathered by the walks, before condensation.
#[derive(Default)]
struct Collected {
    vertices: BTreeMap<VertexId, Vertex>,
    edges: BTreeMap<EdgeId, Edge>,
    truncated: Option<Truncation>,
    visited: usize,
}

impl Collected {
    fn truncate(&mut self, reason: Truncation) {
        self.truncated.get_or_insert(reason);
    }
}

fn far_end(edge: &Edge, direction: Direction) -> VertexId {
    match direction {
        Direction::Outgoing => edge.to,
        Direction::Incoming => edge.from,
    }
}

/// Answers scoped lineage traversals over an injected store.
pub struct LineageQuery<S: GraphStore> {
    store: Arc<S>,
    condensation_threshold: usize,
    view: LineageView,
}

impl<S: GraphStore> LineageQuery<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            condensation_threshold: 3,
            view: LineageView::Column,
        }
    }

    /// Chains longer than `hops` flow hops are condensed. Clamped to at
    /// least one.
    pub fn with_condensation_threshold(mut self, hops: usize) -> Self {
        self.condensation_threshold = hops.max(1);
        self
    }

    pub fn with_view(mut self, view: LineageView) -> Self {
        self.view = view;
        self
    }

    pub fn condensation_threshold(&self) -> usize {
        self.condensation_threshold
    }

    pub fn view(&self) -> LineageView {
        self.view
    }

    pub fn traverse(
        &self,
        start_guid: &str,
        scope: Scope,
        budget: &TraversalBudget,
    ) -> Result<LineageResult, QueryError> {
        let start = self
            .store
            .find_by_guid(start_guid)?
            .ok_or_else(|| QueryError::VertexNotFound(start_guid.to_string()))?;
        let start = self.lift_start(start)?;

        let mut collected = Collected::default();
        collected.vertices.insert(start.id, start.clone());
        for &direction in scope.directions() {
            self.walk(start.id, direction, budget, &mut collected)?;
        }

        let mut subgraph = Subgraph::default();
        let mut nodes: BTreeMap<NodeId, SubgraphNode> = BTreeMap::new();
        let mut edges: Vec<SubgraphEdge> = Vec::new();
        let elided = self.condense(start.id, &collected, &mut nodes, &mut edges);
        self.attach_context(budget, &elided, &mut collected, &mut nodes, &mut edges)?;
        if self.view != LineageView::Column {
            self.project(&mut nodes, &mut edges);
        }

        edges.sort_by(|a, b| (a.from, a.to, a.label).cmp(&(b.from, b.to, b.label)));
        subgraph.nodes = nodes.into_values().collect();
        subgraph.edges = edges;

        info!(
            start = %start_guid,
            %scope,
            view = %self.view,
            nodes = subgraph.nodes.len(),
            edges = subgraph.edges.len(),
            truncated = ?collected.truncated,
            "traversal complete"
        );
        Ok(LineageResult {
            start,
            scope,
            view: self.view,
            subgraph,
            truncated: collected.truncated,
        })
    }

    /// Flow vertices with no upstream flow edge, reached walking backward.
    pub fn ultimate_sources(
        &self,
        start_guid: &str,
        budget: &TraversalBudget,
    ) -> Result<Vec<Vertex>, QueryError> {
        let result = self.traverse(start_guid, Scope::UltimateSource, budget)?;
        Ok(result
            .subgraph
            .flow_endpoints(Direction::Incoming)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Flow vertices with no downstream flow edge, reached walking forward.
    pub fn ultimate_destinations(
        &self,
        start_guid: &str,
        budget: &TraversalBudget,
    ) -> Result<Vec<Vertex>, QueryError> {
        let result = self.traverse(start_guid, Scope::UltimateDestination, budget)?;
        Ok(result
            .subgraph
            .flow_endpoints(Direction::Outgoing)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Semantic assignments around a vertex. For a glossary term: the assets
    /// assigned to it and its synonyms. For any other vertex: the glossary
    /// terms assigned to it. Assets carry their containment context.
    pub fn glossary(
        &self,
        guid: &str,
        budget: &TraversalBudget,
    ) -> Result<GlossaryResult, QueryError> {
        let subject = self
            .store
            .find_by_guid(guid)?
            .ok_or_else(|| QueryError::VertexNotFound(guid.to_string()))?;

        let mut collected = Collected::default();
        let mut nodes: BTreeMap<NodeId, SubgraphNode> = BTreeMap::new();
        let mut edges: Vec<SubgraphEdge> = Vec::new();
        let subject_id = NodeId::Vertex(subject.id);
        nodes.insert(
            subject_id,
            SubgraphNode::Vertex {
                id: subject_id,
                role: NodeRole::Subject,
                vertex: subject.clone(),
            },
        );

        let is_term = subject.label() == VertexLabel::GlossaryTerm;
        let directions: &[Direction] = if is_term {
            &[Direction::Incoming, Direction::Outgoing]
        } else {
            &[Direction::Outgoing]
        };
        let mut links = Vec::new();
        for &direction in directions {
            budget.check(collected.visited)?;
            collected.visited += 1;
            for edge in self.store.edges(subject.id, direction)? {
                let wanted = match (edge.label, direction) {
                    (EdgeLabel::SemanticAssignment, Direction::Incoming) => is_term,
                    (EdgeLabel::SemanticAssignment, Direction::Outgoing) => !is_term,
                    (EdgeLabel::Synonym, _) => is_term,
                    _ => false,
                };
                if wanted {
                    links.push((far_end(&edge, direction), edge));
                }
            }
        }

        for (other, edge) in links {
            let id = NodeId::Vertex(other);
            if !nodes.contains_key(&id) {
                if nodes.len() >= budget.max_nodes {
                    collected.truncate(Truncation::NodeLimit);
                    continue;
                }
                let Some(vertex) = self.store.vertex(other)? else {
                    continue;
                };
                nodes.insert(
                    id,
                    SubgraphNode::Vertex {
                        id,
                        role: NodeRole::Assigned,
                        vertex,
                    },
                );
            }
            edges.push(SubgraphEdge::stored(&edge));
        }
        self.attach_context(budget, &BTreeSet::new(), &mut collected, &mut nodes, &mut edges)?;

        edges.sort_by(|a, b| (a.from, a.to, a.label).cmp(&(b.from, b.to, b.label)));
        let subgraph = Subgraph {
            nodes: nodes.into_values().collect(),
            edges,
        };
        info!(
            subject = %guid,
            nodes = subgraph.nodes.len(),
            edges = subgraph.edges.len(),
            "glossary lookup complete"
        );
        Ok(GlossaryResult {
            subject,
            subgraph,
            truncated: collected.truncated,
        })
    }

    /// Table and host views start from a column's table.
    fn lift_start(&self, start: Vertex) -> Result<Vertex, QueryError> {
        if self.view == LineageView::Column || start.label() != VertexLabel::Column {
            return Ok(start);
        }
        for edge in self.store.edges(start.id, Direction::Outgoing)? {
            if edge.label == EdgeLabel::IncludedIn
                && let Some(table) = self.store.vertex(edge.to)?
                && table.label() == VertexLabel::Table
            {
                debug!(column = %start.guid(), table = %table.guid(), "lifted start to its table");
                return Ok(table);
            }
        }
        Ok(start)
    }

    fn flow_edges(&self, id: VertexId, direction: Direction) -> Result<Vec<Edge>, QueryError> {
        Ok(self
            .store
            .edges(id, direction)?
            .into_iter()
            .filter(|e| self.view.follows(e.label))
            .collect())
    }

    /// Breadth-first walk in one direction. Each walk keeps its own visited
    /// set so an end-to-end query never turns around mid-path.
    fn walk(
        &self,
        start: VertexId,
        direction: Direction,
        budget: &TraversalBudget,
        collected: &mut Collected,
    ) -> Result<(), QueryError> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([(start, 0usize)]);

        while let Some((id, depth)) = queue.pop_front() {
            budget.check(collected.visited)?;
            collected.visited += 1;

            for edge in self.flow_edges(id, direction)? {
                let next = far_end(&edge, direction);
                if depth >= budget.max_depth {
                    if !collected.vertices.contains_key(&next) {
                        collected.truncate(Truncation::DepthLimit);
                    }
                    continue;
                }
                if !collected.vertices.contains_key(&next) {
                    if collected.vertices.len() >= budget.max_nodes {
                        collected.truncate(Truncation::NodeLimit);
                        continue;
                    }
                    let Some(vertex) = self.store.vertex(next)? else {
                        continue;
                    };
                    collected.vertices.insert(next, vertex);
                }
                collected.edges.insert(edge.id, edge);
                if seen.insert(next) {
                    queue.push_back((next, depth + 1));
                }
            }
        }
        Ok(())
    }

    /// Replace every chain of more than `condensation_threshold` hops between
    /// interesting vertices with a condensed node, then emit what is left of
    /// the flow part. Returns the elided vertices.
    ///
    /// Tables are always interesting, and so is a process joined to a table
    /// by a `processTable` edge. Any other vertex is interesting when its
    /// flow in-degree or out-degree is not exactly one.
    fn condense(
        &self,
        start: VertexId,
        collected: &Collected,
        nodes: &mut BTreeMap<NodeId, SubgraphNode>,
        edges: &mut Vec<SubgraphEdge>,
    ) -> BTreeSet<VertexId> {
        let mut outgoing: BTreeMap<VertexId, Vec<&Edge>> = BTreeMap::new();
        let mut in_degree: BTreeMap<VertexId, usize> = BTreeMap::new();
        let mut table_linked: HashSet<VertexId> = HashSet::new();
        for edge in collected.edges.values() {
            outgoing.entry(edge.from).or_default().push(edge);
            *in_degree.entry(edge.to).or_default() += 1;
            if edge.label == EdgeLabel::TableAndProcess {
                table_linked.extend([edge.from, edge.to]);
            }
        }
        let label_of = |v: &VertexId| collected.vertices.get(v).map(Vertex::label);
        let out_degree = |v: &VertexId| outgoing.get(v).map_or(0, Vec::len);
        let interesting = |v: &VertexId| match label_of(v) {
            Some(VertexLabel::Table) => true,
            Some(VertexLabel::Process | VertexLabel::SubProcess) if table_linked.contains(v) => {
                true
            }
            _ => in_degree.get(v).copied().unwrap_or(0) != 1 || out_degree(v) != 1,
        };

        let mut elided: BTreeSet<VertexId> = BTreeSet::new();
        let mut dropped_edges: HashSet<EdgeId> = HashSet::new();
        let mut next_condensed = 0u32;

        for (&boundary, out) in &outgoing {
            if !interesting(&boundary) {
                continue;
            }
            for first in out {
                let mut run = Vec::new();
                let mut run_edges = vec![first.id];
                let mut cursor = first.to;
                while !interesting(&cursor) && run.len() <= collected.vertices.len() {
                    run.push(cursor);
                    let Some(step) = outgoing.get(&cursor).and_then(|o| o.first()) else {
                        break;
                    };
                    run_edges.push(step.id);
                    cursor = step.to;
                }
                let hops = run.len() + 1;
                if hops <= self.condensation_threshold || run.is_empty() {
                    continue;
                }
                let guid = |id: &VertexId| {
                    collected
                        .vertices
                        .get(id)
                        .map(|v| v.guid().to_string())
                        .unwrap_or_default()
                };
                let id = NodeId::Condensed(next_condensed);
                next_condensed += 1;
                let condensed = CondensedNode {
                    marker: CONDENSED_MARKER,
                    from_guid: guid(&boundary),
                    to_guid: guid(&cursor),
                    first_elided_guid: run.first().map(&guid).unwrap_or_default(),
                    last_elided_guid: run.last().map(&guid).unwrap_or_default(),
                    elided_count: run.len(),
                    contains_start: run.contains(&start),
                };
                debug!(
                    from = %condensed.from_guid,
                    to = %condensed.to_guid,
                    elided = condensed.elided_count,
                    "condensed flow chain"
                );
                nodes.insert(id, SubgraphNode::Condensed { id, condensed });
                edges.push(SubgraphEdge::condensed(NodeId::Vertex(boundary), id));
                edges.push(SubgraphEdge::condensed(id, NodeId::Vertex(cursor)));
                elided.extend(run);
                dropped_edges.extend(run_edges);
            }
        }

        for (id, vertex) in &collected.vertices {
            if elided.contains(id) {
                continue;
            }
            let node = NodeId::Vertex(*id);
            nodes.insert(
                node,
                SubgraphNode::Vertex {
                    id: node,
                    role: NodeRole::Flow,
                    vertex: vertex.clone(),
                },
            );
        }
        edges.extend(
            collected
                .edges
                .values()
                .filter(|e| !dropped_edges.contains(&e.id))
                .map(SubgraphEdge::stored),
        );
        elided
    }

    /// Attach the `includedIn` ancestry of every vertex still present.
    /// Elided vertices never come back as context.
    fn attach_context(
        &self,
        budget: &TraversalBudget,
        elided: &BTreeSet<VertexId>,
        collected: &mut Collected,
        nodes: &mut BTreeMap<NodeId, SubgraphNode>,
        edges: &mut Vec<SubgraphEdge>,
    ) -> Result<(), QueryError> {
        let present: Vec<VertexId> = nodes
            .keys()
            .filter_map(|id| match id {
                NodeId::Vertex(v) => Some(*v),
                NodeId::Condensed(_) => None,
            })
            .collect();
        let mut vertex_count = present.len();
        let mut linked: HashSet<EdgeId> = HashSet::new();

        for root in present {
            let mut frontier = vec![root];
            while let Some(id) = frontier.pop() {
                budget.check(collected.visited)?;
                collected.visited += 1;
                let ancestry = self
                    .store
                    .edges(id, Direction::Outgoing)?
                    .into_iter()
                    .filter(|e| e.label.class() == EdgeClass::Containment);
                for edge in ancestry {
                    if elided.contains(&edge.to) || !linked.insert(edge.id) {
                        continue;
                    }
                    let parent = NodeId::Vertex(edge.to);
                    if !nodes.contains_key(&parent) {
                        if vertex_count >= budget.max_nodes {
                            collected.truncate(Truncation::NodeLimit);
                            continue;
                        }
                        let Some(vertex) = self.store.vertex(edge.to)? else {
                            continue;
                        };
                        vertex_count += 1;
                        nodes.insert(
                            parent,
                            SubgraphNode::Vertex {
                                id: parent,
                                role: NodeRole::Context,
                                vertex,
                            },
                        );
                        frontier.push(edge.to);
                    }
                    edges.push(SubgraphEdge::stored(&edge));
                }
            }
        }
        Ok(())
    }

    /// Drop vertices the view hides. In the host view a hidden table or
    /// column is replaced on its flow edges by its host, which then counts
    /// as a flow vertex.
    fn project(&self, nodes: &mut BTreeMap<NodeId, SubgraphNode>, edges: &mut Vec<SubgraphEdge>) {
        let view = self.view;
        let label_of = |nodes: &BTreeMap<NodeId, SubgraphNode>, id: &NodeId| {
            nodes.get(id).and_then(SubgraphNode::vertex).map(Vertex::label)
        };
        let parent: HashMap<NodeId, NodeId> = edges
            .iter()
            .filter(|e| e.label.class() == EdgeClass::Containment)
            .map(|e| (e.from, e.to))
            .collect();
        let stand_in = |nodes: &BTreeMap<NodeId, SubgraphNode>, id: NodeId| -> Option<NodeId> {
            match label_of(nodes, &id) {
                None => Some(id),
                Some(label) if view.shows(label) => Some(id),
                Some(_) if view == LineageView::Host => {
                    let mut cursor = id;
                    for _ in 0..crate::schema::CONTAINMENT_ORDER.len() {
                        cursor = *parent.get(&cursor)?;
                        if label_of(nodes, &cursor) == Some(VertexLabel::Host) {
                            return Some(cursor);
                        }
                    }
                    None
                }
                Some(_) => None,
            }
        };

        let mut kept: BTreeMap<(NodeId, NodeId, EdgeLabel), SubgraphEdge> = BTreeMap::new();
        let mut promoted: BTreeSet<NodeId> = BTreeSet::new();
        for edge in edges.drain(..) {
            let (Some(from), Some(to)) = (stand_in(nodes, edge.from), stand_in(nodes, edge.to))
            else {
                continue;
            };
            if from == to {
                continue;
            }
            if edge.label.is_flow() {
                promoted.extend([from, to]);
            }
            let projected = if (from, to) == (edge.from, edge.to) {
                edge
            } else {
                SubgraphEdge {
                    id: None,
                    from,
                    to,
                    ..edge
                }
            };
            kept.entry((from, to, projected.label)).or_insert(projected);
        }
        edges.extend(kept.into_values());

        nodes.retain(|_, node| node.vertex().is_none_or(|v| view.shows(v.label())));
        for id in promoted {
            if let Some(SubgraphNode::Vertex { role, .. }) = nodes.get_mut(&id) {
                *role = NodeRole::Flow;
            }
        }
    }
}
