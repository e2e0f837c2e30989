//! Single scheduling loop for upload attempts and queue maintenance.
//!
//! Timer ticks and connectivity-up events both funnel into the same attempt
//! path inside one task, so they can never race each other.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::BatchUploader;
use crate::network::NetworkQuality;
use crate::queue::SqliteQueue;

/// Drives a [`BatchUploader`] on the tier interval
pub struct UploadScheduler {
    uploader: Arc<BatchUploader>,
    queue: SqliteQueue,
    connectivity: watch::Receiver<bool>,
    retention_days: u32,
    maintenance_interval: Duration,
}

impl UploadScheduler {
    /// Create a scheduler with 7 day retention applied hourly
    ///
    /// # Arguments
    ///
    /// * `uploader` - Uploader to drive
    /// * `queue` - Queue the retention pass runs against
    /// * `connectivity` - Connectivity changes; a `true` forces an immediate attempt
    pub fn new(uploader: Arc<BatchUploader>, queue: SqliteQueue, connectivity: watch::Receiver<bool>) -> Self {
        Self {
            uploader,
            queue,
            connectivity,
            retention_days: 7,
            maintenance_interval: Duration::from_secs(3600),
        }
    }

    pub fn with_retention(mut self, retention_days: u32, maintenance_interval: Duration) -> Self {
        self.retention_days = retention_days;
        self.maintenance_interval = maintenance_interval;
        self
    }

    /// Run until `shutdown` changes or its sender is dropped
    ///
    /// The first attempt starts immediately; afterwards the delay follows the
    /// quality observed by the previous attempt.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let timer = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(timer);

        let mut maintenance = tokio::time::interval(self.maintenance_interval);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut watching = true;
        info!("Upload scheduler started");

        loop {
            tokio::select! {
                _ = &mut timer => match self.attempt_until(&mut shutdown).await {
                    Some(next) => timer.as_mut().reset(Instant::now() + next),
                    None => break,
                },

                changed = self.connectivity.changed(), if watching => {
                    if changed.is_err() {
                        debug!("Connectivity source closed, relying on timer only");
                        watching = false;
                        continue;
                    }

                    if *self.connectivity.borrow_and_update() {
                        info!("Connectivity restored, uploading now");
                        match self.attempt_until(&mut shutdown).await {
                            Some(next) => timer.as_mut().reset(Instant::now() + next),
                            None => break,
                        }
                    } else {
                        info!("Connectivity lost");
                    }
                }

                _ = maintenance.tick() => self.maintain(),

                _ = shutdown.changed() => {
                    info!("Upload scheduler stopping");
                    break;
                }
            }
        }
    }

    /// Run an attempt unless shutdown arrives first; `None` means stop
    ///
    /// An abandoned attempt is dropped while waiting on the network, before it
    /// has touched the queue, so its rows stay pending with no retry charged.
    async fn attempt_until(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Duration> {
        tokio::select! {
            next = self.attempt() => Some(next),
            _ = shutdown.changed() => {
                info!("Upload scheduler stopping, abandoning attempt in flight");
                None
            }
        }
    }

    /// One attempt; returns the delay until the next scheduled one
    async fn attempt(&self) -> Duration {
        match self.uploader.attempt_upload().await {
            Ok(outcome) => debug!("Upload attempt finished: {:?}", outcome),
            Err(e) => error!("Upload attempt failed: {}", e),
        }

        self.uploader
            .last_quality()
            .unwrap_or(NetworkQuality::Offline)
            .upload_interval()
    }

    fn maintain(&self) {
        match self.queue.run_retention(self.retention_days) {
            Ok(report) => debug!("Retention pass removed {} rows", report.total()),
            Err(e) => warn!("Retention pass failed: {}", e),
        }
    }
}
