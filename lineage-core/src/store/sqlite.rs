//! SQLite-backed persistent graph store.
//!
//! Vertices and edges live in two tables whose `UNIQUE` constraints encode
//! the identity rules, so upsert-if-absent is a single
//! `INSERT ... ON CONFLICT DO NOTHING`. The connection sits behind a mutex
//! that a transaction holds until it commits or is dropped.

use super::{GraphCounts, GraphStore, GraphTransaction};
use crate::error::StoreError;
use crate::model::{Edge, EdgeId, Upserted, Vertex, VertexData, VertexId};
use crate::schema::{EdgeLabel, VertexLabel};
use petgraph::Direction;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

const SCHEMA_SQL: &str = "\
CREATE TABLE IF NOT EXISTS vertices (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  label TEXT NOT NULL,
  guid TEXT NOT NULL,
  qualified_name TEXT NOT NULL,
  properties TEXT NOT NULL,
  UNIQUE(label, guid)
);
CREATE INDEX IF NOT EXISTS idx_vertices_guid ON vertices(guid);
CREATE TABLE IF NOT EXISTS edges (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  label TEXT NOT NULL,
  from_id INTEGER NOT NULL REFERENCES vertices(id),
  to_id INTEGER NOT NULL REFERENCES vertices(id),
  properties TEXT NOT NULL DEFAULT '{}',
  UNIQUE(label, from_id, to_id)
);
CREATE INDEX IF NOT EXISTS idx_edges_from ON edges(from_id);
CREATE INDEX IF NOT EXISTS idx_edges_to ON edges(to_id);";

const INSERT_VERTEX_IF_ABSENT_SQL: &str = "\
INSERT INTO vertices (label, guid, qualified_name, properties)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(label, guid) DO NOTHING";

const INSERT_VERTEX_SQL: &str = "\
INSERT INTO vertices (label, guid, qualified_name, properties)
VALUES (?1, ?2, ?3, ?4)";

const INSERT_EDGE_IF_ABSENT_SQL: &str = "\
INSERT INTO edges (label, from_id, to_id, properties)
VALUES (?1, ?2, ?3, '{}')
ON CONFLICT(label, from_id, to_id) DO NOTHING";

const INSERT_EDGE_SQL: &str = "\
INSERT INTO edges (label, from_id, to_id, properties)
VALUES (?1, ?2, ?3, ?4)";

const SELECT_VERTEX_ID_SQL: &str = "SELECT id FROM vertices WHERE label = ?1 AND guid = ?2";
const SELECT_EDGE_ID_SQL: &str =
    "SELECT id FROM edges WHERE label = ?1 AND from_id = ?2 AND to_id = ?3";
const SELECT_VERTEX_SQL: &str = "SELECT id, properties FROM vertices WHERE id = ?1";

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Persistent store in a single SQLite file (or in memory).
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteGraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGraphStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteGraphStore {
    /// Open (creating if needed) a store at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Unavailable(format!("cannot open {}: {e}", path.display()))
        })?;
        // Other connections to the same file hold the write lock while they
        // commit; wait for it instead of failing with SQLITE_BUSY.
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(format!("cannot open in-memory db: {e}")))?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        debug!(path = ?path, "graph store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".into()))
    }
}

// ---------------------------------------------------------------------------
// Row converters
// ---------------------------------------------------------------------------

fn bag_from_json(raw: &str) -> Result<BTreeMap<String, String>, StoreError> {
    Ok(serde_json::from_str(raw)?)
}

fn vertex_from_parts(id: i64, properties: &str) -> Result<Vertex, StoreError> {
    let bag = bag_from_json(properties)?;
    let data = VertexData::from_property_bag(&bag)
        .map_err(|e| StoreError::Corrupt(format!("vertex {id}: {e}")))?;
    Ok(Vertex {
        id: VertexId(id),
        data,
    })
}

fn edge_from_parts(
    id: i64,
    label: &str,
    from: i64,
    to: i64,
    properties: &str,
) -> Result<Edge, StoreError> {
    let label: EdgeLabel = label
        .parse()
        .map_err(|e: String| StoreError::Corrupt(format!("edge {id}: {e}")))?;
    Ok(Edge {
        id: EdgeId(id),
        label,
        from: VertexId(from),
        to: VertexId(to),
        properties: bag_from_json(properties)?,
    })
}

type VertexRow = (i64, String);
type EdgeRow = (i64, String, i64, i64, String);

fn vertex_row(row: &Row<'_>) -> rusqlite::Result<VertexRow> {
    Ok((row.get(0)?, row.get(1)?))
}

fn edge_row(row: &Row<'_>) -> rusqlite::Result<EdgeRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn query_vertices(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Vertex>, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, vertex_row)?;
    let mut out = Vec::new();
    for row in rows {
        let (id, props) = row?;
        out.push(vertex_from_parts(id, &props)?);
    }
    Ok(out)
}

fn query_edges(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Edge>, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, edge_row)?;
    let mut out = Vec::new();
    for row in rows {
        let (id, label, from, to, props) = row?;
        out.push(edge_from_parts(id, &label, from, to, &props)?);
    }
    Ok(out)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

fn missing_endpoint(label: EdgeLabel, from: VertexId, to: VertexId) -> StoreError {
    StoreError::Corrupt(format!("{label} edge {from}->{to} references an unknown vertex"))
}

impl GraphStore for SqliteGraphStore {
    type Tx<'a> = SqliteTransaction<'a>;

    fn begin(&self) -> Result<SqliteTransaction<'_>, StoreError> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| StoreError::Unavailable(format!("cannot begin transaction: {e}")))?;
        Ok(SqliteTransaction {
            conn,
            finished: false,
        })
    }

    fn vertex(&self, id: VertexId) -> Result<Option<Vertex>, StoreError> {
        let conn = self.lock()?;
        Ok(query_vertices(&conn, SELECT_VERTEX_SQL, params![id.0])?
            .into_iter()
            .next())
    }

    fn find_vertex(&self, label: VertexLabel, guid: &str) -> Result<Option<Vertex>, StoreError> {
        let conn = self.lock()?;
        Ok(query_vertices(
            &conn,
            "SELECT id, properties FROM vertices WHERE label = ?1 AND guid = ?2",
            params![label.as_str(), guid],
        )?
        .into_iter()
        .next())
    }

    fn find_by_guid(&self, guid: &str) -> Result<Option<Vertex>, StoreError> {
        let conn = self.lock()?;
        Ok(query_vertices(
            &conn,
            "SELECT id, properties FROM vertices WHERE guid = ?1 ORDER BY id LIMIT 1",
            params![guid],
        )?
        .into_iter()
        .next())
    }

    fn edges(&self, vertex: VertexId, direction: Direction) -> Result<Vec<Edge>, StoreError> {
        let sql = match direction {
            Direction::Outgoing => {
                "SELECT id, label, from_id, to_id, properties FROM edges WHERE from_id = ?1 ORDER BY id"
            }
            Direction::Incoming => {
                "SELECT id, label, from_id, to_id, properties FROM edges WHERE to_id = ?1 ORDER BY id"
            }
        };
        let conn = self.lock()?;
        query_edges(&conn, sql, params![vertex.0])
    }

    fn vertices(&self) -> Result<Vec<Vertex>, StoreError> {
        let conn = self.lock()?;
        query_vertices(&conn, "SELECT id, properties FROM vertices ORDER BY id", [])
    }

    fn all_edges(&self) -> Result<Vec<Edge>, StoreError> {
        let conn = self.lock()?;
        query_edges(
            &conn,
            "SELECT id, label, from_id, to_id, properties FROM edges ORDER BY id",
            [],
        )
    }

    fn counts(&self) -> Result<GraphCounts, StoreError> {
        let conn = self.lock()?;
        let mut counts = GraphCounts::default();

        let mut stmt =
            conn.prepare_cached("SELECT label, COUNT(*) FROM vertices GROUP BY label")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (label, n) = row?;
            let label: VertexLabel = label.parse().map_err(StoreError::Corrupt)?;
            counts.vertices += n as usize;
            counts.vertices_by_label.insert(label, n as usize);
        }

        let mut stmt = conn.prepare_cached("SELECT label, COUNT(*) FROM edges GROUP BY label")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (label, n) = row?;
            let label: EdgeLabel = label.parse().map_err(StoreError::Corrupt)?;
            counts.edges += n as usize;
            counts.edges_by_label.insert(label, n as usize);
        }
        Ok(counts)
    }
}

/// Write transaction. Rolls back on drop unless committed.
pub struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    finished: bool,
}

impl SqliteTransaction<'_> {
    fn vertex_params(data: &VertexData) -> Result<(String, String), StoreError> {
        let properties = serde_json::to_string(&data.to_property_bag())?;
        Ok((data.label.as_str().to_string(), properties))
    }

    fn edge_id(&self, label: EdgeLabel, from: VertexId, to: VertexId) -> Result<i64, StoreError> {
        let mut stmt = self.conn.prepare_cached(SELECT_EDGE_ID_SQL)?;
        Ok(stmt.query_row(params![label.as_str(), from.0, to.0], |row| row.get(0))?)
    }
}

impl GraphTransaction for SqliteTransaction<'_> {
    fn find_vertex(
        &mut self,
        label: VertexLabel,
        guid: &str,
    ) -> Result<Option<VertexId>, StoreError> {
        let mut stmt = self.conn.prepare_cached(SELECT_VERTEX_ID_SQL)?;
        let id: Option<i64> = stmt
            .query_row(params![label.as_str(), guid], |row| row.get(0))
            .optional()?;
        Ok(id.map(VertexId))
    }

    fn vertex_data(&mut self, id: VertexId) -> Result<Option<VertexData>, StoreError> {
        Ok(query_vertices(&self.conn, SELECT_VERTEX_SQL, params![id.0])?
            .into_iter()
            .next()
            .map(|v| v.data))
    }

    fn insert_vertex_if_absent(
        &mut self,
        data: &VertexData,
    ) -> Result<Upserted<VertexId>, StoreError> {
        let (label, properties) = Self::vertex_params(data)?;
        let changed = self
            .conn
            .prepare_cached(INSERT_VERTEX_IF_ABSENT_SQL)?
            .execute(params![label, data.guid, data.qualified_name, properties])?;
        if changed == 1 {
            return Ok(Upserted::Created(VertexId(self.conn.last_insert_rowid())));
        }
        let id = self.find_vertex(data.label, &data.guid)?.ok_or_else(|| {
            StoreError::Corrupt(format!("{} '{}' vanished after upsert", data.label, data.guid))
        })?;
        Ok(Upserted::Existing(id))
    }

    fn insert_edge_if_absent(
        &mut self,
        label: EdgeLabel,
        from: VertexId,
        to: VertexId,
    ) -> Result<Upserted<EdgeId>, StoreError> {
        let changed = self
            .conn
            .prepare_cached(INSERT_EDGE_IF_ABSENT_SQL)?
            .execute(params![label.as_str(), from.0, to.0])
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    missing_endpoint(label, from, to)
                } else {
                    e.into()
                }
            })?;
        if changed == 1 {
            return Ok(Upserted::Created(EdgeId(self.conn.last_insert_rowid())));
        }
        Ok(Upserted::Existing(EdgeId(self.edge_id(label, from, to)?)))
    }

    fn create_vertex(&mut self, data: &VertexData) -> Result<VertexId, StoreError> {
        let (label, properties) = Self::vertex_params(data)?;
        let result = self
            .conn
            .prepare_cached(INSERT_VERTEX_SQL)?
            .execute(params![label, data.guid, data.qualified_name, properties]);
        match result {
            Ok(_) => Ok(VertexId(self.conn.last_insert_rowid())),
            Err(e) if is_constraint_violation(&e) => {
                Err(StoreError::duplicate_vertex(data.label, &data.guid))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_edge(
        &mut self,
        label: EdgeLabel,
        from: VertexId,
        to: VertexId,
        properties: &BTreeMap<String, String>,
    ) -> Result<EdgeId, StoreError> {
        let properties = serde_json::to_string(properties)?;
        let result = self
            .conn
            .prepare_cached(INSERT_EDGE_SQL)?
            .execute(params![label.as_str(), from.0, to.0, properties]);
        match result {
            Ok(_) => Ok(EdgeId(self.conn.last_insert_rowid())),
            Err(e) if is_foreign_key_violation(&e) => Err(missing_endpoint(label, from, to)),
            Err(e) if is_constraint_violation(&e) => {
                Err(StoreError::duplicate_edge(label, from.0, to.0))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn commit(mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("COMMIT")
            .map_err(|e| StoreError::Unavailable(format!("commit failed: {e}")))?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished
            && let Err(e) = self.conn.execute_batch("ROLLBACK")
        {
            warn!(error = %e, "rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;
    use tempfile::TempDir;

    #[test]
    fn test_upsert_is_idempotent() {
        conformance::upsert_is_idempotent(&SqliteGraphStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_same_guid_different_label() {
        conformance::same_guid_different_label_is_distinct(
            &SqliteGraphStore::open_in_memory().unwrap(),
        );
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        conformance::dropped_transaction_rolls_back(&SqliteGraphStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_create_reports_duplicates() {
        conformance::create_reports_duplicates(&SqliteGraphStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_reads_round_trip_vertex_data() {
        conformance::reads_round_trip_vertex_data(&SqliteGraphStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("lineage.db");
        {
            let store = SqliteGraphStore::open(&path).unwrap();
            let mut tx = store.begin().unwrap();
            tx.insert_vertex_if_absent(&VertexData::new(VertexLabel::Table, "t1", "db.t1"))
                .unwrap();
            tx.commit().unwrap();
        }
        let store = SqliteGraphStore::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        let t = store.find_vertex(VertexLabel::Table, "t1").unwrap().unwrap();
        assert_eq!(t.data.qualified_name, "db.t1");
    }

    #[test]
    fn test_edge_to_missing_vertex_is_corrupt() {
        conformance::edge_to_missing_vertex_is_corrupt(&SqliteGraphStore::open_in_memory().unwrap());
    }
}
