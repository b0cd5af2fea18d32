use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::debug;

use nodeflow_core::error::{NodeflowError, Result};
use nodeflow_core::traits::HistoryStore;
use nodeflow_core::types::FlowRunResult;

use crate::{db_err, open_connection};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        flow_key TEXT NOT NULL,
        run_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        record_json TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_runs_flow
        ON runs(flow_key, id DESC);";

/// Run history persisted in SQLite, capped per flow key.
///
/// Rows are ordered by insertion id, so "most recent first" means most
/// recently appended, independent of clock skew between runs.
pub struct SqliteHistoryStore {
    conn: Mutex<Connection>,
    cap: usize,
}

impl SqliteHistoryStore {
    /// Open or create the history database.
    pub fn open(path: &Path, cap: usize) -> Result<Self> {
        let conn = open_connection(path)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        debug!(path = %path.display(), cap, "History store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            cap: cap.max(1),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory(cap: usize) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cap: cap.max(1),
        })
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn append(&self, flow_key: &str, result: &FlowRunResult) -> Result<()> {
        let json = serde_json::to_string(result)?;
        let mut conn = self.conn.lock().map_err(|e| NodeflowError::Database(e.to_string()))?;
        let tx = conn.transaction().map_err(db_err)?;

        tx.execute(
            "INSERT INTO runs (flow_key, run_id, status, started_at, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                flow_key,
                result.run_id,
                result.status.to_string(),
                result.started_at.to_rfc3339(),
                json,
            ],
        )
        .map_err(db_err)?;

        let evicted = tx
            .execute(
                "DELETE FROM runs WHERE flow_key = ?1 AND id NOT IN (
                     SELECT id FROM runs WHERE flow_key = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                params![flow_key, self.cap as i64],
            )
            .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        if evicted > 0 {
            debug!(flow_key, evicted, "Evicted oldest runs");
        }
        Ok(())
    }

    fn list(&self, flow_key: &str) -> Result<Vec<FlowRunResult>> {
        let conn = self.conn.lock().map_err(|e| NodeflowError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare("SELECT record_json FROM runs WHERE flow_key = ?1 ORDER BY id DESC")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![flow_key], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut runs = Vec::new();
        for row in rows {
            let json = row.map_err(db_err)?;
            runs.push(serde_json::from_str(&json)?);
        }
        Ok(runs)
    }

    fn get(&self, flow_key: &str, run_id: &str) -> Result<FlowRunResult> {
        let conn = self.conn.lock().map_err(|e| NodeflowError::Database(e.to_string()))?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record_json FROM runs WHERE flow_key = ?1 AND run_id = ?2
                 ORDER BY id DESC LIMIT 1",
                params![flow_key, run_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(db_err(other)),
            })?;

        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(NodeflowError::RunNotFound {
                flow_key: flow_key.to_string(),
                run_id: run_id.to_string(),
            }),
        }
    }
}
