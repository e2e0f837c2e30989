//! SQLite schema and connection setup for the durable queue.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i64 = 1;

/// Busy timeout for concurrent access to the database file
const BUSY_TIMEOUT_MS: u64 = 5_000;

// AUTOINCREMENT keeps queue ids from ever being reused, which keeps
// dead_letter_queue.original_id unique across reinstatements.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS telemetry_queue (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp   TEXT    NOT NULL,
    payload     TEXT    NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT    NOT NULL,
    uploaded_at TEXT,
    batch_id    TEXT
);
CREATE INDEX IF NOT EXISTS idx_queue_pending ON telemetry_queue (uploaded_at, created_at);

CREATE TABLE IF NOT EXISTS upload_batches (
    batch_id        TEXT    PRIMARY KEY,
    record_count    INTEGER NOT NULL,
    uploaded_at     TEXT    NOT NULL,
    server_response TEXT
);

CREATE TABLE IF NOT EXISTS upload_stats (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp        TEXT    NOT NULL,
    records_uploaded INTEGER NOT NULL,
    batch_size       INTEGER NOT NULL,
    network_quality  TEXT    NOT NULL,
    success          INTEGER NOT NULL,
    error            TEXT
);
CREATE INDEX IF NOT EXISTS idx_stats_timestamp ON upload_stats (timestamp);

CREATE TABLE IF NOT EXISTS dead_letter_queue (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    original_id INTEGER NOT NULL UNIQUE,
    timestamp   TEXT    NOT NULL,
    payload     TEXT    NOT NULL,
    retry_count INTEGER NOT NULL,
    created_at  TEXT    NOT NULL,
    failed_at   TEXT    NOT NULL,
    last_error  TEXT
);
";

/// Apply durability pragmas
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    // journal_mode answers with the resulting mode ("memory" for in-memory databases)
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// Create tables if missing and record the schema version
pub fn initialize(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS schema_meta (version INTEGER NOT NULL);")?;

    let version: Option<i64> = tx
        .query_row("SELECT version FROM schema_meta LIMIT 1", params![], |row| row.get(0))
        .optional()?;

    tx.execute_batch(SCHEMA_SQL)?;

    match version {
        None => {
            tx.execute("INSERT INTO schema_meta (version) VALUES (?1)", params![SCHEMA_VERSION])?;
            info!("Initialized queue schema v{}", SCHEMA_VERSION);
        }
        Some(v) if v != SCHEMA_VERSION => {
            warn!("Queue schema version {} differs from expected {}", v, SCHEMA_VERSION);
        }
        Some(_) => {}
    }

    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_pragmas(&conn).unwrap();
        initialize(&mut conn).unwrap();
        initialize(&mut conn).unwrap();

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_meta", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);

        let version: i64 = conn
            .query_row("SELECT version FROM schema_meta", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_exist() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn).unwrap();

        for table in ["telemetry_queue", "upload_batches", "upload_stats", "dead_letter_queue"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {}", table);
        }
    }
}
