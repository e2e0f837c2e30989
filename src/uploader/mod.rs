//! # Batch Uploader Module
//!
//! Moves queued records to the collector in quality-sized batches.
//!
//! This module handles:
//! - The per-attempt state machine (Idle -> Uploading -> Success/Failure -> Idle)
//! - A single-flight guard so attempts never overlap
//! - Batch idempotency checks before anything is sent
//! - Retry accounting and dead-letter promotion on failure
//! - Health signals (pending, dead letters, last success, last error)
//!
//! Wire conversion lives in [`wire`], HTTP delivery in [`client`], and the
//! timer/connectivity driven loop in [`scheduler`].

pub mod client;
pub mod scheduler;
pub mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, UplinkError};
use crate::network::{NetworkMonitor, NetworkQuality};
use crate::protocol::TelemetryRecord;
use crate::queue::{QueueEntry, SqliteQueue, UploadBatch, UploadStat};

pub use client::{BatchAck, CollectorClient, HttpCollectorClient};
pub use scheduler::UploadScheduler;

/// Failed attempts after which a row is dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Statistic note for a batch id that was already delivered
const DUPLICATE_NOTE: &str = "duplicate batch detected";

/// Uploader state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    #[default]
    Idle,
    Uploading,
    Success,
    Failure,
}

/// Why an attempt did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another attempt was running
    InFlight,
    /// No connectivity
    Offline,
}

/// Result of one upload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Skipped(SkipReason),
    /// Nothing pending
    Empty,
    /// Rows delivered and marked uploaded
    Uploaded { batch_id: String, records: usize },
    /// Batch id was already delivered; rows marked without re-sending
    Duplicate { batch_id: String, records: usize },
    /// Delivery failed; rows stay pending with one more retry counted
    Failed {
        batch_id: String,
        error: String,
        dead_lettered: usize,
    },
}

/// Health signals exposed to the host
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub pending: usize,
    pub dead_letters: usize,
    pub last_success: Option<DateTime<Utc>>,
    /// Error of the most recent attempt, cleared by the next success
    pub last_error: Option<String>,
    pub state: UploadState,
    /// Success or Failure of the most recent completed attempt
    pub last_result: Option<UploadState>,
    pub quality: Option<NetworkQuality>,
}

#[derive(Debug, Clone, Default)]
struct Status {
    state: UploadState,
    last_result: Option<UploadState>,
    last_error: Option<String>,
    quality: Option<NetworkQuality>,
}

/// Clears the in-flight flag when the attempt ends, however it ends
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Batch uploader over a durable queue
pub struct BatchUploader {
    queue: SqliteQueue,
    client: Arc<dyn CollectorClient>,
    monitor: NetworkMonitor,
    max_retries: u32,
    in_flight: AtomicBool,
    status: Mutex<Status>,
}

impl std::fmt::Debug for BatchUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchUploader")
            .field("max_retries", &self.max_retries)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl BatchUploader {
    /// Create an uploader
    ///
    /// # Arguments
    ///
    /// * `queue` - Durable queue to drain
    /// * `client` - Collector client
    /// * `monitor` - Quality monitor deciding batch size
    pub fn new(queue: SqliteQueue, client: Arc<dyn CollectorClient>, monitor: NetworkMonitor) -> Self {
        Self {
            queue,
            client,
            monitor,
            max_retries: DEFAULT_MAX_RETRIES,
            in_flight: AtomicBool::new(false),
            status: Mutex::new(Status::default()),
        }
    }

    /// Failed attempts after which rows are dead-lettered (at least 1)
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn is_uploading(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Quality observed by the most recent attempt
    pub fn last_quality(&self) -> Option<NetworkQuality> {
        self.lock_status().quality
    }

    fn lock_status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one attempt under a fresh batch id
    pub async fn attempt_upload(&self) -> Result<UploadOutcome> {
        let batch_id = Uuid::new_v4().to_string();
        self.attempt_upload_with_batch(&batch_id).await
    }

    /// Run one attempt under `batch_id`
    ///
    /// Returns `Skipped(InFlight)` immediately if another attempt is running.
    /// Collector failures are reported as `Ok(Failed { .. })` after the queue
    /// has recorded them; `Err` means the queue itself failed.
    pub async fn attempt_upload_with_batch(&self, batch_id: &str) -> Result<UploadOutcome> {
        let Some(_flight) = FlightGuard::acquire(&self.in_flight) else {
            debug!("Upload already in progress, skipping");
            return Ok(UploadOutcome::Skipped(SkipReason::InFlight));
        };

        self.lock_status().state = UploadState::Uploading;
        let result = self.run_cycle(batch_id).await;
        self.finish(&result);
        result
    }

    fn finish(&self, result: &Result<UploadOutcome>) {
        let mut status = self.lock_status();
        status.state = UploadState::Idle;

        match result {
            Ok(UploadOutcome::Skipped(_)) => {}
            Ok(UploadOutcome::Failed { error, .. }) => {
                status.last_result = Some(UploadState::Failure);
                status.last_error = Some(error.clone());
            }
            Ok(_) => {
                status.last_result = Some(UploadState::Success);
                status.last_error = None;
            }
            Err(e) => {
                status.last_result = Some(UploadState::Failure);
                status.last_error = Some(e.to_string());
            }
        }
    }

    async fn run_cycle(&self, batch_id: &str) -> Result<UploadOutcome> {
        let quality = self.monitor.current_quality().await;
        self.lock_status().quality = Some(quality);

        if !quality.is_online() {
            debug!("Offline, upload skipped");
            return Ok(UploadOutcome::Skipped(SkipReason::Offline));
        }

        let entries = self.queue.fetch_unsent(quality.batch_size())?;
        if entries.is_empty() {
            debug!("Nothing to upload");
            return Ok(UploadOutcome::Empty);
        }

        if self.queue.is_batch_processed(batch_id)? {
            return self.settle_duplicate(batch_id, quality, &entries);
        }

        let (ids, records) = self.decode_entries(&entries)?;
        if records.is_empty() {
            return Ok(UploadOutcome::Empty);
        }

        debug!("Uploading {} records as batch {} ({})", records.len(), batch_id, quality);
        match self.client.send_batch(batch_id, &records).await {
            Ok(ack) => self.settle_success(batch_id, quality, &ids, ack),
            Err(e) => self.settle_failure(batch_id, quality, &ids, e),
        }
    }

    /// Split rows into sendable records and rows whose payload no longer decodes
    ///
    /// Undecodable rows are charged a failed attempt so they eventually reach
    /// the dead-letter store instead of blocking the head of the queue.
    fn decode_entries(&self, entries: &[QueueEntry]) -> Result<(Vec<i64>, Vec<TelemetryRecord>)> {
        let mut ids = Vec::with_capacity(entries.len());
        let mut records = Vec::with_capacity(entries.len());
        let mut corrupt = Vec::new();

        for entry in entries {
            match entry.record() {
                Ok(record) => {
                    ids.push(entry.id);
                    records.push(record);
                }
                Err(e) => {
                    warn!("Queue row {} has an undecodable payload: {}", entry.id, e);
                    corrupt.push(entry.id);
                }
            }
        }

        if !corrupt.is_empty() {
            self.queue.increment_retry(&corrupt)?;
            self.queue.promote_dead_letters(self.max_retries, Some("undecodable payload"))?;
        }

        Ok((ids, records))
    }

    fn settle_duplicate(
        &self,
        batch_id: &str,
        quality: NetworkQuality,
        entries: &[QueueEntry],
    ) -> Result<UploadOutcome> {
        let ids: Vec<i64> = entries.iter().map(|e| e.id).collect();
        warn!(
            "Batch {} was already delivered, marking {} rows without re-sending",
            batch_id,
            ids.len()
        );

        let updated = self.queue.mark_uploaded(&ids, batch_id)?;
        self.record_stat(quality, updated, true, Some(DUPLICATE_NOTE.to_string()));

        Ok(UploadOutcome::Duplicate {
            batch_id: batch_id.to_string(),
            records: updated,
        })
    }

    fn settle_success(
        &self,
        batch_id: &str,
        quality: NetworkQuality,
        ids: &[i64],
        ack: BatchAck,
    ) -> Result<UploadOutcome> {
        let updated = self.queue.mark_uploaded(ids, batch_id)?;
        if updated < ids.len() {
            let pending = self.queue.pending_count()?;
            warn!(
                "Batch {} delivered {} records but only {} rows were marked; {} rows pending",
                batch_id,
                ids.len(),
                updated,
                pending
            );
        }

        self.queue.mark_batch_processed(&UploadBatch {
            batch_id: batch_id.to_string(),
            record_count: ids.len(),
            uploaded_at: Utc::now(),
            server_response: Some(ack.body),
        })?;
        self.record_stat(quality, ids.len(), true, None);

        if ack.duplicate {
            info!("Collector already had batch {}", batch_id);
        }
        info!("Uploaded {} records in batch {} ({})", ids.len(), batch_id, quality);

        Ok(UploadOutcome::Uploaded {
            batch_id: batch_id.to_string(),
            records: ids.len(),
        })
    }

    fn settle_failure(
        &self,
        batch_id: &str,
        quality: NetworkQuality,
        ids: &[i64],
        error: UplinkError,
    ) -> Result<UploadOutcome> {
        let message = error.to_string();
        warn!("Upload of batch {} ({} records) failed: {}", batch_id, ids.len(), message);

        // 4xx rejections are charged like any other failure
        self.queue.increment_retry(ids)?;
        let promoted = self.queue.promote_dead_letters(self.max_retries, Some(&message))?;
        self.record_stat(quality, 0, false, Some(message.clone()));

        Ok(UploadOutcome::Failed {
            batch_id: batch_id.to_string(),
            error: message,
            dead_lettered: promoted.len(),
        })
    }

    fn record_stat(&self, quality: NetworkQuality, records_uploaded: usize, success: bool, error: Option<String>) {
        let stat = UploadStat {
            timestamp: Utc::now(),
            records_uploaded,
            batch_size: quality.batch_size(),
            network_quality: quality.label().to_string(),
            success,
            error,
        };

        if let Err(e) = self.queue.record_stat(&stat) {
            warn!("Failed to record upload statistic: {}", e);
        }
    }

    /// Current health signals
    pub fn health(&self) -> Result<HealthSnapshot> {
        let status = self.lock_status().clone();

        Ok(HealthSnapshot {
            pending: self.queue.pending_count()?,
            dead_letters: self.queue.dead_letter_count()?,
            last_success: self.queue.last_successful_upload()?,
            last_error: status.last_error,
            state: status.state,
            last_result: status.last_result,
            quality: status.quality,
        })
    }
}
