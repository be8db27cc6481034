//! Lineage graph engine.
//!
//! Ingests provenance events (a glossary term assigned to a table or column,
//! plus the asset's containment chain) into a persistent property graph,
//! and answers scoped lineage traversals over it:
//!
//! - [`schema`]: vertex/edge labels, chain shapes and property key namespaces
//! - [`store`]: the graph store seam with SQLite and in-memory backends
//! - [`builder`] and [`ingest`]: idempotent event ingestion
//! - [`query`]: traversal with budgets, views and chain condensation, plus
//!   the glossary lookup
//! - [`export`]: GraphML/JSON export and re-import
//! - [`generator`]: deterministic synthetic graphs for testing at scale

pub mod builder;
pub mod config;
pub mod error;
pub mod export;
pub mod generator;
pub mod ingest;
pub mod model;
pub mod persistence;
pub mod query;
pub mod schema;
pub mod store;

pub use builder::{GraphBuilder, IngestSummary, ResolvedChain, UpdatePolicy};
pub use config::{ExportFormat, LineageConfig, StoreBackend, load_config};
pub use error::{ExportError, IngestError, LineageError, QueryError, Result, StoreError};
pub use export::{GraphDocument, GraphExporter, SerializedGraph};
pub use generator::{GeneratorParams, GraphGenerator, GraphSizeSummary};
pub use ingest::{IngestReport, IngestWorker};
pub use model::{AssetContext, AssetRef, Edge, Element, RelationshipEvent, Vertex, VertexData};
pub use query::{
    GlossaryResult, LineageQuery, LineageResult, LineageView, Scope, Subgraph, TraversalBudget,
    Truncation,
};
pub use schema::{EdgeLabel, VertexLabel};
pub use store::{GraphStore, GraphTransaction, MemoryGraphStore, SqliteGraphStore};
