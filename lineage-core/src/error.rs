//! Error types for the lineage engine.
//!
//! Each component surfaces its own `thiserror` enum; [`LineageError`] wraps
//! them for callers that drive several components at once.

use crate::schema::{EdgeLabel, VertexLabel};
use thiserror::Error;

/// Top-level lineage engine error.
#[derive(Debug, Error)]
pub enum LineageError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),
    #[error("query error: {0}")]
    Query(#[from] QueryError),
    #[error("export error: {0}")]
    Export(#[from] ExportError),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors raised by a graph store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("graph store unavailable: {0}")]
    Unavailable(String),
    #[error("{label} '{guid}' already exists")]
    DuplicateConflict { label: String, guid: String },
    #[error("graph store holds corrupt data: {0}")]
    Corrupt(String),
    #[error("graph store already holds {vertices} vertices")]
    NotEmpty { vertices: usize },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("property serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn duplicate_vertex(label: VertexLabel, guid: &str) -> Self {
        StoreError::DuplicateConflict {
            label: label.to_string(),
            guid: guid.to_string(),
        }
    }

    pub(crate) fn duplicate_edge(label: EdgeLabel, from: i64, to: i64) -> Self {
        StoreError::DuplicateConflict {
            label: label.to_string(),
            guid: format!("{from}->{to}"),
        }
    }
}

/// Errors from ingesting a single provenance event.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("graph store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("no {label} vertex '{guid}' in this transaction")]
    VertexNotFound { label: VertexLabel, guid: String },
    #[error("conflicting {label} '{guid}' already stored")]
    DuplicateConflict { label: String, guid: String },
    #[error("malformed event for base asset '{base_guid}': {reason}")]
    MalformedEvent { base_guid: String, reason: String },
    #[error("property '{key}' on {label} '{guid}': {reason}")]
    PropertyMapping {
        label: VertexLabel,
        guid: String,
        key: String,
        reason: String,
    },
}

impl IngestError {
    pub(crate) fn malformed(base_guid: &str, reason: impl Into<String>) -> Self {
        IngestError::MalformedEvent {
            base_guid: base_guid.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateConflict { label, guid } => {
                IngestError::DuplicateConflict { label, guid }
            }
            other => IngestError::StoreUnavailable(other.to_string()),
        }
    }
}

/// Errors from lineage queries. Budget cutoffs are not errors; see
/// [`crate::query::Truncation`].
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no vertex with guid '{0}'")]
    VertexNotFound(String),
    #[error("graph store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("traversal cancelled after visiting {visited} vertices")]
    Cancelled { visited: usize },
    #[error("traversal deadline exceeded after visiting {visited} vertices")]
    DeadlineExceeded { visited: usize },
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        QueryError::StoreUnavailable(err.to_string())
    }
}

/// Errors from exporting or re-reading a serialized graph.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("GraphML write error: {0}")]
    Xml(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("cannot import into a store that already holds {vertices} vertices")]
    TargetNotEmpty { vertices: usize },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A type alias for results using the top-level `LineageError`.
pub type Result<T> = std::result::Result<T, LineageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_store_error_maps_to_ingest_conflict() {
        let err: IngestError = StoreError::duplicate_vertex(VertexLabel::Table, "t1").into();
        match err {
            IngestError::DuplicateConflict { label, guid } => {
                assert_eq!(label, "table");
                assert_eq!(guid, "t1");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_other_store_errors_are_unavailability() {
        let err: IngestError = StoreError::Unavailable("disk gone".into()).into();
        assert!(matches!(err, IngestError::StoreUnavailable(msg) if msg.contains("disk gone")));
        let err: QueryError = StoreError::Corrupt("bad row".into()).into();
        assert!(matches!(err, QueryError::StoreUnavailable(_)));
    }

    #[test]
    fn test_lineage_error_wraps_components() {
        let err: LineageError = QueryError::VertexNotFound("x".into()).into();
        assert_eq!(err.to_string(), "query error: no vertex with guid 'x'");
    }
}
