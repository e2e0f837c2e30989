//! SQLite-backed durable queue.
//!
//! Every multi-row operation runs inside one transaction, so a crash or error
//! leaves either all affected rows changed or none of them.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql, Transaction, TransactionBehavior};
use tracing::{debug, error, info, warn};

use super::models::*;
use super::schema;
use crate::error::{Result, UplinkError};
use crate::protocol::TelemetryRecord;

/// Maximum ids bound into a single `IN (...)` list
const ID_CHUNK_SIZE: usize = 500;

const QUEUE_COLUMNS: &str = "id, timestamp, payload, retry_count, created_at, uploaded_at, batch_id";

const DEAD_LETTER_COLUMNS: &str =
    "original_id, timestamp, payload, retry_count, created_at, failed_at, last_error";

/// Durable queue handle
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteQueue").finish_non_exhaustive()
    }
}

impl SqliteQueue {
    /// Open (or create) the queue database at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the parent directory cannot be created or the database
    /// cannot be opened and initialized
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let queue = Self::from_connection(Connection::open(path)?)?;
        info!("Opened telemetry queue at {}", path.display());
        Ok(queue)
    }

    /// Open a private in-memory queue (tests and dry runs)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        schema::apply_pragmas(&conn)?;
        schema::initialize(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied transaction behind
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Main queue
    // ------------------------------------------------------------------

    /// Append records as pending rows
    ///
    /// # Returns
    ///
    /// * `Result<Vec<i64>>` - Assigned ids, in record order
    ///
    /// # Errors
    ///
    /// Returns `QueueWriteFailure` if any row cannot be written; no row of the
    /// batch is stored in that case
    pub fn append_batch(&self, records: &[TelemetryRecord]) -> Result<Vec<i64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        self.insert_records(records)
            .map_err(|e| UplinkError::QueueWriteFailure(e.to_string()))
    }

    fn insert_records(&self, records: &[TelemetryRecord]) -> Result<Vec<i64>> {
        let now = format_timestamp(&Utc::now());
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut ids = Vec::with_capacity(records.len());
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO telemetry_queue (timestamp, payload, retry_count, created_at)
                 VALUES (?1, ?2, 0, ?3)",
            )?;
            for record in records {
                let payload = serde_json::to_string(record)?;
                stmt.execute(params![format_timestamp(&record.timestamp), payload, now])?;
                ids.push(tx.last_insert_rowid());
            }
        }

        tx.commit()?;
        debug!("Queued {} records", ids.len());
        Ok(ids)
    }

    /// Oldest `limit` rows that are not uploaded yet, FIFO order
    pub fn fetch_unsent(&self, limit: usize) -> Result<Vec<QueueEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM telemetry_queue
             WHERE uploaded_at IS NULL
             ORDER BY created_at ASC, id ASC
             LIMIT ?1",
            QUEUE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_queue_entry)?;
        let entries = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Mark rows delivered under `batch_id`
    ///
    /// An updated count below `ids.len()` means rows vanished (e.g. retention
    /// ran concurrently) and the caller should re-check queue state.
    pub fn mark_uploaded(&self, ids: &[i64], batch_id: &str) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = format_timestamp(&Utc::now());
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = update_ids(
            &tx,
            "UPDATE telemetry_queue SET uploaded_at = ?1, batch_id = ?2 WHERE id IN",
            &[&now, &batch_id],
            ids,
        )?;
        tx.commit()?;

        if updated < ids.len() {
            warn!(
                "Marked {} of {} rows uploaded for batch {}, queue changed underneath",
                updated,
                ids.len(),
                batch_id
            );
        }
        Ok(updated)
    }

    /// Add one failed attempt to each pending row in `ids`
    pub fn increment_retry(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = update_ids(
            &tx,
            "UPDATE telemetry_queue SET retry_count = retry_count + 1
             WHERE uploaded_at IS NULL AND id IN",
            &[],
            ids,
        )?;
        tx.commit()?;
        Ok(updated)
    }

    /// Rows still waiting for delivery
    pub fn pending_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM telemetry_queue WHERE uploaded_at IS NULL")
    }

    /// Delivered rows not yet removed by retention
    pub fn uploaded_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM telemetry_queue WHERE uploaded_at IS NOT NULL")
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ------------------------------------------------------------------
    // Dead-letter store
    // ------------------------------------------------------------------

    /// Move every pending row with `retry_count >= threshold` to the dead-letter store
    ///
    /// Insert and delete happen in one transaction; a row is never visible in
    /// both stores.
    ///
    /// # Returns
    ///
    /// * `Result<Vec<i64>>` - Original ids of the promoted rows
    pub fn promote_dead_letters(&self, threshold: u32, last_error: Option<&str>) -> Result<Vec<i64>> {
        let now = format_timestamp(&Utc::now());
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids = {
            let mut stmt = tx.prepare_cached(
                "SELECT id FROM telemetry_queue
                 WHERE retry_count >= ?1 AND uploaded_at IS NULL
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![threshold], |row| row.get::<_, i64>(0))?;
            let ids = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };

        if ids.is_empty() {
            return Ok(ids);
        }

        tx.execute(
            "INSERT INTO dead_letter_queue
                 (original_id, timestamp, payload, retry_count, created_at, failed_at, last_error)
             SELECT id, timestamp, payload, retry_count, created_at, ?1, ?2
             FROM telemetry_queue
             WHERE retry_count >= ?3 AND uploaded_at IS NULL",
            params![now, last_error, threshold],
        )?;
        tx.execute(
            "DELETE FROM telemetry_queue WHERE retry_count >= ?1 AND uploaded_at IS NULL",
            params![threshold],
        )?;
        tx.commit()?;

        error!(
            "Moved {} records to dead-letter store after {} failed attempts (last error: {})",
            ids.len(),
            threshold,
            last_error.unwrap_or("none")
        );
        Ok(ids)
    }

    /// Oldest dead-lettered records
    pub fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM dead_letter_queue ORDER BY failed_at ASC, original_id ASC LIMIT ?1",
            DEAD_LETTER_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit as i64], map_dead_letter)?;
        let records = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Put one dead-lettered record back into the main queue
    ///
    /// The record gets a fresh id and `retry_count = 0`; the dead-letter row is
    /// deleted in the same transaction.
    ///
    /// # Returns
    ///
    /// * `Result<Option<i64>>` - New queue id, or `None` if `original_id` is unknown
    pub fn reinstate_dead_letter(&self, original_id: i64) -> Result<Option<i64>> {
        let now = format_timestamp(&Utc::now());
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT timestamp, payload FROM dead_letter_queue WHERE original_id = ?1",
                params![original_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((timestamp, payload)) = row else {
            return Ok(None);
        };

        tx.execute(
            "INSERT INTO telemetry_queue (timestamp, payload, retry_count, created_at)
             VALUES (?1, ?2, 0, ?3)",
            params![timestamp, payload, now],
        )?;
        let new_id = tx.last_insert_rowid();
        tx.execute("DELETE FROM dead_letter_queue WHERE original_id = ?1", params![original_id])?;
        tx.commit()?;

        info!("Reinstated dead-lettered record {} as {}", original_id, new_id);
        Ok(Some(new_id))
    }

    /// Put every dead-lettered record back into the main queue
    pub fn reinstate_all_dead_letters(&self) -> Result<usize> {
        let now = format_timestamp(&Utc::now());
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT INTO telemetry_queue (timestamp, payload, retry_count, created_at)
             SELECT timestamp, payload, 0, ?1 FROM dead_letter_queue ORDER BY original_id",
            params![now],
        )?;
        tx.execute("DELETE FROM dead_letter_queue", [])?;
        tx.commit()?;

        if inserted > 0 {
            info!("Reinstated {} dead-lettered records", inserted);
        }
        Ok(inserted)
    }

    pub fn dead_letter_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM dead_letter_queue")
    }

    // ------------------------------------------------------------------
    // Idempotency and statistics
    // ------------------------------------------------------------------

    /// Whether `batch_id` was already delivered
    pub fn is_batch_processed(&self, batch_id: &str) -> Result<bool> {
        let conn = self.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM upload_batches WHERE batch_id = ?1",
                params![batch_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record a delivered batch; repeated calls keep a single row
    pub fn mark_batch_processed(&self, batch: &UploadBatch) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO upload_batches (batch_id, record_count, uploaded_at, server_response)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                batch.batch_id,
                batch.record_count as i64,
                format_timestamp(&batch.uploaded_at),
                batch.server_response
            ],
        )?;
        Ok(())
    }

    pub fn batch_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM upload_batches")
    }

    /// Append an upload statistic
    pub fn record_stat(&self, stat: &UploadStat) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO upload_stats
                 (timestamp, records_uploaded, batch_size, network_quality, success, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                format_timestamp(&stat.timestamp),
                stat.records_uploaded as i64,
                stat.batch_size as i64,
                stat.network_quality,
                stat.success,
                stat.error
            ],
        )?;
        Ok(())
    }

    /// Most recent statistics, newest first
    pub fn recent_stats(&self, limit: usize) -> Result<Vec<UploadStat>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT timestamp, records_uploaded, batch_size, network_quality, success, error
             FROM upload_stats ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], map_upload_stat)?;
        let stats = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats)
    }

    /// Time of the last successful upload attempt
    pub fn last_successful_upload(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock();
        let value: Option<String> = conn.query_row(
            "SELECT MAX(timestamp) FROM upload_stats WHERE success = 1",
            [],
            |row| row.get(0),
        )?;
        let parsed = value.map(|v| parse_timestamp(0, v)).transpose()?;
        Ok(parsed)
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Delete delivered rows older than `days`
    pub fn prune_uploaded(&self, days: u32) -> Result<usize> {
        self.prune_uploaded_before(cutoff(days))
    }

    pub fn prune_uploaded_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.delete_before(
            "DELETE FROM telemetry_queue WHERE uploaded_at IS NOT NULL AND uploaded_at < ?1",
            cutoff,
        )
    }

    /// Delete batch idempotency records older than `days`
    pub fn prune_batches(&self, days: u32) -> Result<usize> {
        self.prune_batches_before(cutoff(days))
    }

    pub fn prune_batches_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.delete_before("DELETE FROM upload_batches WHERE uploaded_at < ?1", cutoff)
    }

    /// Delete upload statistics older than `days`
    pub fn prune_stats(&self, days: u32) -> Result<usize> {
        self.prune_stats_before(cutoff(days))
    }

    pub fn prune_stats_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.delete_before("DELETE FROM upload_stats WHERE timestamp < ?1", cutoff)
    }

    /// Delete dead-lettered records older than `days`
    pub fn prune_dead_letters(&self, days: u32) -> Result<usize> {
        self.prune_dead_letters_before(cutoff(days))
    }

    pub fn prune_dead_letters_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.delete_before("DELETE FROM dead_letter_queue WHERE failed_at < ?1", cutoff)
    }

    /// Apply every retention rule with the same age threshold
    pub fn run_retention(&self, days: u32) -> Result<RetentionReport> {
        let report = RetentionReport {
            uploaded_rows: self.prune_uploaded(days)?,
            batches: self.prune_batches(days)?,
            stats: self.prune_stats(days)?,
            dead_letters: self.prune_dead_letters(days)?,
        };

        if report.total() > 0 {
            info!(
                "Retention removed {} uploaded rows, {} batches, {} stats, {} dead letters",
                report.uploaded_rows, report.batches, report.stats, report.dead_letters
            );
        }
        Ok(report)
    }

    fn delete_before(&self, sql: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        let deleted = conn.execute(sql, params![format_timestamp(&cutoff)])?;
        Ok(deleted)
    }
}

fn cutoff(days: u32) -> DateTime<Utc> {
    Utc::now() - Duration::days(days as i64)
}

/// Run `sql_prefix (?n, ?n+1, ...)` over `ids` in chunks inside `tx`
fn update_ids(
    tx: &Transaction<'_>,
    sql_prefix: &str,
    leading: &[&dyn ToSql],
    ids: &[i64],
) -> Result<usize> {
    let mut updated = 0;

    for chunk in ids.chunks(ID_CHUNK_SIZE) {
        let first = leading.len() + 1;
        let placeholders = (0..chunk.len())
            .map(|i| format!("?{}", first + i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("{} ({})", sql_prefix, placeholders);

        let mut bound: Vec<&dyn ToSql> = leading.to_vec();
        bound.extend(chunk.iter().map(|id| id as &dyn ToSql));

        updated += tx.execute(&sql, bound.as_slice())?;
    }

    Ok(updated)
}

fn parse_timestamp(index: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn parse_optional_timestamp(index: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(index, v)).transpose()
}

fn map_queue_entry(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    Ok(QueueEntry {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        payload: row.get(2)?,
        retry_count: row.get(3)?,
        created_at: parse_timestamp(4, row.get(4)?)?,
        uploaded_at: parse_optional_timestamp(5, row.get(5)?)?,
        batch_id: row.get(6)?,
    })
}

fn map_dead_letter(row: &Row<'_>) -> rusqlite::Result<DeadLetterRecord> {
    Ok(DeadLetterRecord {
        original_id: row.get(0)?,
        timestamp: row.get(1)?,
        payload: row.get(2)?,
        retry_count: row.get(3)?,
        created_at: parse_timestamp(4, row.get(4)?)?,
        failed_at: parse_timestamp(5, row.get(5)?)?,
        last_error: row.get(6)?,
    })
}

fn map_upload_stat(row: &Row<'_>) -> rusqlite::Result<UploadStat> {
    Ok(UploadStat {
        timestamp: parse_timestamp(0, row.get(0)?)?,
        records_uploaded: row.get::<_, i64>(1)? as usize,
        batch_size: row.get::<_, i64>(2)? as usize,
        network_quality: row.get(3)?,
        success: row.get(4)?,
        error: row.get(5)?,
    })
}
