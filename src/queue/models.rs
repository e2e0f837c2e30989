//! Row types of the durable queue.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::Result;
use crate::protocol::TelemetryRecord;

/// A persisted record that has not been confirmed delivered
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    /// Store-assigned id, never reused
    pub id: i64,

    /// Sample time (RFC 3339)
    pub timestamp: String,

    /// Serialized `TelemetryRecord`
    pub payload: String,

    /// Failed delivery attempts so far
    pub retry_count: u32,

    /// When the row was enqueued
    pub created_at: DateTime<Utc>,

    /// When delivery was confirmed
    pub uploaded_at: Option<DateTime<Utc>>,

    /// Batch the row was delivered in
    pub batch_id: Option<String>,
}

impl QueueEntry {
    /// Deserialize the stored payload
    pub fn record(&self) -> Result<TelemetryRecord> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Idempotency record: a batch id that must not be sent again
#[derive(Debug, Clone, PartialEq)]
pub struct UploadBatch {
    pub batch_id: String,
    pub record_count: usize,
    pub uploaded_at: DateTime<Utc>,
    pub server_response: Option<String>,
}

/// Append-only upload attempt statistic
#[derive(Debug, Clone, PartialEq)]
pub struct UploadStat {
    pub timestamp: DateTime<Utc>,
    pub records_uploaded: usize,
    pub batch_size: usize,
    pub network_quality: String,
    pub success: bool,
    pub error: Option<String>,
}

/// A record that exhausted its retries
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRecord {
    /// Id of the row in the main queue when it was promoted
    pub original_id: i64,
    pub timestamp: String,
    pub payload: String,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Rows removed by one retention pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub uploaded_rows: usize,
    pub batches: usize,
    pub stats: usize,
    pub dead_letters: usize,
}

impl RetentionReport {
    pub fn total(&self) -> usize {
        self.uploaded_rows + self.batches + self.stats + self.dead_letters
    }
}

/// Format a timestamp for storage
///
/// Fixed millisecond precision with a `Z` suffix keeps lexicographic and
/// chronological order identical.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
