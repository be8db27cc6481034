//! Graph builder — turns provenance events into vertices and edges.
//!
//! Each event is resolved into an ordered chain (glossary term first, then
//! the technical asset and its containers) before anything is written. The
//! chain is then upserted in one transaction: vertices by `(label, guid)`,
//! edges by `(label, from, to)`, in canonical chain order. Any failure drops
//! the transaction, which rolls the whole event back.

use crate::error::{IngestError, StoreError};
use crate::model::{RelationshipEvent, Upserted, VertexData, VertexId};
use crate::schema::{ChainShape, EdgeLabel, VertexLabel};
use crate::store::{GraphStore, GraphTransaction};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happens when an event carries a vertex that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Stored vertices are never revised. Differing incoming properties are
    /// counted in [`IngestSummary::ignored_updates`] and otherwise dropped.
    #[default]
    AppendOnly,
}

/// Outcome of a successful ingestion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub base_guid: String,
    pub vertices_created: usize,
    pub vertices_existing: usize,
    pub edges_created: usize,
    pub edges_existing: usize,
    /// Existing vertices whose incoming properties differed from the stored ones.
    pub ignored_updates: usize,
}

impl IngestSummary {
    fn new(base_guid: &str) -> Self {
        Self {
            base_guid: base_guid.to_string(),
            ..Self::default()
        }
    }

    /// True when the event added nothing to the graph.
    pub fn is_noop(&self) -> bool {
        self.vertices_created == 0 && self.edges_created == 0
    }
}

/// An event resolved against the schema registry, ready to write.
#[derive(Debug, Clone)]
pub struct ResolvedChain {
    pub shape: ChainShape,
    /// Vertex data in chain order.
    pub links: Vec<VertexData>,
}

impl ResolvedChain {
    /// Validate an event and project its elements, without touching a store.
    pub fn resolve(event: &RelationshipEvent) -> Result<Self, IngestError> {
        let base = &event.base_asset;
        let base_guid = base.guid.as_str();
        if base_guid.is_empty() {
            return Err(IngestError::malformed(base_guid, "base asset has no guid"));
        }
        let shape = ChainShape::for_base(base.asset_type).ok_or_else(|| {
            IngestError::malformed(
                base_guid,
                format!("'{}' does not root a column or table chain", base.asset_type),
            )
        })?;

        let mut links = Vec::with_capacity(shape.labels().len());
        for &label in shape.labels() {
            let element = if label == VertexLabel::GlossaryTerm {
                &event.glossary_term
            } else {
                event.asset_context.get(&label).ok_or_else(|| {
                    IngestError::malformed(base_guid, format!("asset context has no {label}"))
                })?
            };
            if element.element_type != label {
                return Err(IngestError::malformed(
                    base_guid,
                    format!(
                        "{label} slot holds a {} element '{}'",
                        element.element_type, element.guid
                    ),
                ));
            }
            if element.guid.is_empty() {
                return Err(IngestError::malformed(
                    base_guid,
                    format!("{label} element has no guid"),
                ));
            }
            let data = VertexData::from_element(element).map_err(|e| {
                IngestError::PropertyMapping {
                    label,
                    guid: element.guid.clone(),
                    key: e.key,
                    reason: e.reason,
                }
            })?;
            links.push(data);
        }

        if let Some(asset) = event.asset_context.get(&base.asset_type)
            && asset.guid != base.guid
        {
            return Err(IngestError::malformed(
                base_guid,
                format!("asset context {} is '{}'", base.asset_type, asset.guid),
            ));
        }

        for label in event.asset_context.keys() {
            if !shape.labels().contains(label) {
                debug!(base_guid, %label, "ignoring asset context entry outside the chain");
            }
        }

        Ok(Self { shape, links })
    }

    /// `(label, from, to)` for each edge, in chain order.
    pub fn edges(&self) -> impl Iterator<Item = (EdgeLabel, &VertexData, &VertexData)> {
        self.shape
            .edge_steps()
            .iter()
            .zip(self.links.windows(2))
            .map(|(step, pair)| {
                let (from, to) = step.endpoints(&pair[0], &pair[1]);
                (step.label, from, to)
            })
    }
}

/// Writes provenance events into a graph store.
pub struct GraphBuilder<S: GraphStore> {
    store: Arc<S>,
    policy: UpdatePolicy,
}

impl<S: GraphStore> GraphBuilder<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            policy: UpdatePolicy::AppendOnly,
        }
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Ingest one event. Safe to repeat: re-ingesting an event leaves the
    /// graph unchanged.
    pub fn ingest(&self, event: &RelationshipEvent) -> Result<IngestSummary, IngestError> {
        let result = self.ingest_inner(event);
        match &result {
            Ok(summary) => info!(
                base_guid = %summary.base_guid,
                vertices_created = summary.vertices_created,
                edges_created = summary.edges_created,
                "event ingested"
            ),
            Err(e) => warn!(base_guid = %event.base_guid(), error = %e, "event rejected"),
        }
        result
    }

    /// Ingest events one transaction each. A failing event never affects
    /// the others.
    pub fn ingest_batch(
        &self,
        events: &[RelationshipEvent],
    ) -> Vec<Result<IngestSummary, IngestError>> {
        events.iter().map(|event| self.ingest(event)).collect()
    }

    fn ingest_inner(&self, event: &RelationshipEvent) -> Result<IngestSummary, IngestError> {
        let chain = ResolvedChain::resolve(event)?;
        let mut summary = IngestSummary::new(event.base_guid());

        let mut tx = self.store.begin()?;
        for data in &chain.links {
            self.upsert_vertex(&mut tx, data, &mut summary)?;
        }
        for (label, from, to) in chain.edges() {
            if !label.allows(from.label, to.label) {
                return Err(IngestError::malformed(
                    event.base_guid(),
                    format!("{label} cannot join {} to {}", from.label, to.label),
                ));
            }
            let from_id = Self::chain_vertex(&mut tx, from)?;
            let to_id = Self::chain_vertex(&mut tx, to)?;
            Self::upsert_edge(&mut tx, label, from_id, to_id, &mut summary)?;
        }
        tx.commit()?;
        Ok(summary)
    }

    fn chain_vertex(tx: &mut S::Tx<'_>, data: &VertexData) -> Result<VertexId, IngestError> {
        tx.find_vertex(data.label, &data.guid)?
            .ok_or_else(|| IngestError::VertexNotFound {
                label: data.label,
                guid: data.guid.clone(),
            })
    }

    fn upsert_vertex(
        &self,
        tx: &mut S::Tx<'_>,
        data: &VertexData,
        summary: &mut IngestSummary,
    ) -> Result<VertexId, IngestError> {
        let upserted = match tx.insert_vertex_if_absent(data) {
            Ok(upserted) => upserted,
            // A store without native upsert lost a race; accept the winner
            // when it has the identity we asked for.
            Err(StoreError::DuplicateConflict { label, guid }) => {
                match tx.find_vertex(data.label, &data.guid)? {
                    Some(id) => Upserted::Existing(id),
                    None => return Err(IngestError::DuplicateConflict { label, guid }),
                }
            }
            Err(e) => return Err(e.into()),
        };

        match upserted {
            Upserted::Created(id) => {
                summary.vertices_created += 1;
                debug!(label = %data.label, guid = %data.guid, %id, "vertex created");
            }
            Upserted::Existing(id) => {
                summary.vertices_existing += 1;
                match self.policy {
                    UpdatePolicy::AppendOnly => {
                        if tx.vertex_data(id)?.is_some_and(|stored| stored != *data) {
                            summary.ignored_updates += 1;
                            debug!(
                                label = %data.label,
                                guid = %data.guid,
                                "stored vertex differs from event; keeping stored properties"
                            );
                        }
                    }
                }
            }
        }
        Ok(upserted.id())
    }

    fn upsert_edge(
        tx: &mut S::Tx<'_>,
        label: EdgeLabel,
        from: VertexId,
        to: VertexId,
        summary: &mut IngestSummary,
    ) -> Result<(), IngestError> {
        match tx.insert_edge_if_absent(label, from, to) {
            Ok(Upserted::Created(id)) => {
                summary.edges_created += 1;
                debug!(%label, %from, %to, %id, "edge created");
            }
            Ok(Upserted::Existing(_)) => summary.edges_existing += 1,
            Err(StoreError::DuplicateConflict { .. }) => summary.edges_existing += 1,
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
