//! Background ingestion worker.
//!
//! Events arrive on a bounded channel (the upstream topic listener feeds it)
//! and are ingested one at a time on the blocking pool, since store writes
//! are synchronous. Failures are logged with the base asset guid and kept
//! in the report so the caller can ask the producer to redeliver them.

use crate::builder::{GraphBuilder, IngestSummary};
use crate::model::RelationshipEvent;
use crate::store::GraphStore;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// An event that could not be ingested.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedEvent {
    pub base_guid: String,
    pub error: String,
    /// The rejected event, kept for redelivery. Absent when the event never
    /// parsed or was lost with a panicked task.
    #[serde(skip)]
    pub event: Option<RelationshipEvent>,
}

/// Totals for a worker run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub ingested: usize,
    /// Ingested events that added nothing (redeliveries).
    pub unchanged: usize,
    pub vertices_created: usize,
    pub edges_created: usize,
    pub failed: Vec<FailedEvent>,
    /// The worker stopped on cancellation rather than on channel close.
    pub cancelled: bool,
}

impl IngestReport {
    fn record(&mut self, summary: &IngestSummary) {
        self.ingested += 1;
        if summary.is_noop() {
            self.unchanged += 1;
        }
        self.vertices_created += summary.vertices_created;
        self.edges_created += summary.edges_created;
    }

    fn fail(&mut self, base_guid: String, error: String, event: Option<RelationshipEvent>) {
        self.failed.push(FailedEvent {
            base_guid,
            error,
            event,
        });
    }

    /// Base guids of failed events, for replay.
    pub fn failed_guids(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|f| f.base_guid.as_str())
    }

    /// Failed events that can be sent again as they are.
    pub fn replayable(&self) -> impl Iterator<Item = &RelationshipEvent> {
        self.failed.iter().filter_map(|f| f.event.as_ref())
    }
}

pub struct IngestWorker<S: GraphStore + 'static> {
    builder: Arc<GraphBuilder<S>>,
    events: mpsc::Receiver<RelationshipEvent>,
    cancel: CancellationToken,
}

impl<S: GraphStore + 'static> IngestWorker<S> {
    /// Create a worker and the sending half of its queue.
    pub fn new(
        builder: Arc<GraphBuilder<S>>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (mpsc::Sender<RelationshipEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = Self {
            builder,
            events: rx,
            cancel,
        };
        (tx, worker)
    }

    /// Drain the queue until every sender is dropped or the token fires.
    /// An event already handed to the blocking pool is finished first.
    pub async fn run(mut self) -> IngestReport {
        let mut report = IngestReport::default();
        info!("ingestion worker started");

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    report.cancelled = true;
                    debug!("ingestion worker cancelled");
                    break;
                }
                next = self.events.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            let base_guid = event.base_guid().to_string();
            let builder = Arc::clone(&self.builder);
            let task = tokio::task::spawn_blocking(move || {
                let outcome = builder.ingest(&event);
                (event, outcome)
            });
            match task.await {
                Ok((_, Ok(summary))) => report.record(&summary),
                Ok((event, Err(e))) => report.fail(base_guid, e.to_string(), Some(event)),
                Err(e) => {
                    error!(base_guid = %base_guid, error = %e, "ingestion task panicked");
                    report.fail(base_guid, format!("ingestion task failed: {e}"), None);
                }
            }
        }

        if !report.failed.is_empty() {
            warn!(
                failed = report.failed.len(),
                "some events were rejected and need redelivery"
            );
        }
        info!(
            ingested = report.ingested,
            unchanged = report.unchanged,
            failed = report.failed.len(),
            "ingestion worker stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetContext, AssetRef, Element};
    use crate::schema::VertexLabel;
    use crate::store::MemoryGraphStore;
    use pretty_assertions::assert_eq;

    fn table_event(table: &str) -> RelationshipEvent {
        let mut ctx = AssetContext::new();
        ctx.insert(
            VertexLabel::Table,
            Element::new(table, format!("db.{table}"), VertexLabel::Table),
        );
        ctx.insert(
            VertexLabel::SchemaType,
            Element::new("s1", "db.schema", VertexLabel::SchemaType),
        );
        ctx.insert(VertexLabel::Host, Element::new("h1", "db", VertexLabel::Host));
        RelationshipEvent {
            glossary_term: Element::new("g1", "Order", VertexLabel::GlossaryTerm),
            asset_context: ctx,
            base_asset: AssetRef {
                guid: table.into(),
                asset_type: VertexLabel::Table,
            },
        }
    }

    fn worker(
        capacity: usize,
    ) -> (
        mpsc::Sender<RelationshipEvent>,
        IngestWorker<MemoryGraphStore>,
        Arc<MemoryGraphStore>,
        CancellationToken,
    ) {
        let store = Arc::new(MemoryGraphStore::new());
        let builder = Arc::new(GraphBuilder::new(Arc::clone(&store)));
        let cancel = CancellationToken::new();
        let (tx, worker) = IngestWorker::new(builder, capacity, cancel.clone());
        (tx, worker, store, cancel)
    }

    #[tokio::test]
    async fn test_worker_drains_queue_and_reports() {
        let (tx, worker, store, _cancel) = worker(8);
        let handle = tokio::spawn(worker.run());

        tx.send(table_event("t1")).await.unwrap();
        tx.send(table_event("t1")).await.unwrap();
        let mut bad = table_event("t2");
        bad.asset_context.remove(&VertexLabel::Host);
        tx.send(bad).await.unwrap();
        tx.send(table_event("t3")).await.unwrap();
        drop(tx);

        let report = handle.await.unwrap();
        assert_eq!(report.ingested, 3);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.failed_guids().collect::<Vec<_>>(), vec!["t2"]);
        let replay: Vec<_> = report.replayable().collect();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].base_guid(), "t2");
        assert!(!replay[0].asset_context.contains_key(&VertexLabel::Host));
        assert!(!report.cancelled);

        let counts = store.counts().unwrap();
        assert_eq!(counts.vertices_of(VertexLabel::Table), 2);
        assert_eq!(report.vertices_created, counts.vertices);
        assert_eq!(report.edges_created, counts.edges);
    }

    #[tokio::test]
    async fn test_worker_stops_on_cancel() {
        let (tx, worker, store, cancel) = worker(4);
        cancel.cancel();
        tx.send(table_event("t1")).await.unwrap();

        let report = worker.run().await;
        assert!(report.cancelled);
        assert_eq!(report.ingested, 0);
        assert_eq!(store.counts().unwrap().vertices, 0);
    }
}
