pub mod graphs;
pub mod history;

pub use graphs::SqliteGraphStore;
pub use history::SqliteHistoryStore;

use std::path::Path;

use rusqlite::Connection;

use nodeflow_core::error::{NodeflowError, Result};

/// Open a database file, creating parent directories and enabling WAL.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            NodeflowError::Database(format!("Failed to create db directory: {}", e))
        })?;
    }

    let conn = Connection::open(path).map_err(db_err)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        .map_err(db_err)?;
    Ok(conn)
}

pub(crate) fn db_err(e: rusqlite::Error) -> NodeflowError {
    NodeflowError::Database(e.to_string())
}
