use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::debug;

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::graph::{GraphDocument, GraphSnapshot};
use nodeflow_core::traits::GraphPersister;

use crate::{db_err, open_connection};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS graphs (
        flow_key TEXT PRIMARY KEY,
        document_json TEXT NOT NULL,
        saved_at TEXT NOT NULL
    );";

/// Latest saved graph per flow key.
pub struct SqliteGraphStore {
    conn: Mutex<Connection>,
}

impl SqliteGraphStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!(path = %path.display(), "Graph store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Load the saved graph for a flow key, if any.
    pub fn load(&self, flow_key: &str) -> Result<Option<GraphSnapshot>> {
        let conn = self.conn.lock().map_err(|e| NodeflowError::Database(e.to_string()))?;
        let row = conn.query_row(
            "SELECT document_json, saved_at FROM graphs WHERE flow_key = ?1",
            params![flow_key],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        );

        let (json, saved_at) = match row {
            Ok(row) => row,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(db_err(e)),
        };

        let graph: GraphDocument = serde_json::from_str(&json)?;
        let saved_at = DateTime::parse_from_rfc3339(&saved_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                NodeflowError::Database(format!(
                    "corrupt saved_at '{}' for flow '{}': {}",
                    saved_at, flow_key, e
                ))
            })?;
        Ok(Some(GraphSnapshot {
            flow_key: flow_key.to_string(),
            graph,
            saved_at,
        }))
    }
}

impl GraphPersister for SqliteGraphStore {
    fn persist(&self, snapshot: &GraphSnapshot) -> Result<()> {
        let json = serde_json::to_string(&snapshot.graph)?;
        let conn = self.conn.lock().map_err(|e| NodeflowError::Persist(e.to_string()))?;
        conn.execute(
            "INSERT INTO graphs (flow_key, document_json, saved_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(flow_key) DO UPDATE SET
                 document_json = excluded.document_json,
                 saved_at = excluded.saved_at",
            params![snapshot.flow_key, json, snapshot.saved_at.to_rfc3339()],
        )
        .map_err(|e| NodeflowError::Persist(e.to_string()))?;
        debug!(
            flow_key = %snapshot.flow_key,
            nodes = snapshot.graph.nodes.len(),
            "Graph persisted"
        );
        Ok(())
    }
}
