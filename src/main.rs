//! # Telemetry Uplink
//!
//! Ingest GPS/motion telemetry from a serial sensor and deliver it reliably to
//! a remote collector.
//!
//! Usage: `telemetry-uplink [config.toml]` (default `config/default.toml`).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use telemetry_uplink::aggregation::AggregationBuffer;
use telemetry_uplink::config::{Config, DeviceConfig, LoggingConfig};
use telemetry_uplink::network::{HttpHealthProbe, LinkWatcher, NetworkMonitor};
use telemetry_uplink::pipeline::IngestPipeline;
use telemetry_uplink::protocol::StreamReassembler;
use telemetry_uplink::queue::SqliteQueue;
use telemetry_uplink::serial::DeviceSerial;
use telemetry_uplink::uploader::{BatchUploader, HttpCollectorClient, UploadScheduler};

/// Configuration file used when none is given on the command line
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// How often collector reachability is re-checked
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Delay before reopening the sensor after it failed or disconnected
const DEVICE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Install the tracing subscriber
///
/// `RUST_LOG` overrides the configured level. With `log_dir` set, output is
/// also written to a daily rolling file; the returned guard must live until
/// exit so buffered lines are flushed.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_ascii_lowercase()));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "telemetry-uplink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
            None
        }
    }
}

/// Keep the sensor open and feed the pipeline, reopening after failures
///
/// Runs until `shutdown` changes.
async fn ingest_loop(pipeline: &mut IngestPipeline, device: &DeviceConfig, mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        match DeviceSerial::open(&device.port, device.baud_rate, device.read_chunk_size) {
            Ok(mut serial) => {
                pipeline.reset_stream();
                match pipeline.run(&mut serial, &mut shutdown).await {
                    Ok(()) => info!("Stopped reading {}", serial.device_path()),
                    Err(e) => warn!("Reading {} failed: {}", serial.device_path(), e),
                }
            }
            Err(e) => warn!("{}", e),
        }

        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(DEVICE_RETRY_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Main entry point for Telemetry Uplink
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration and set up logging
///    - Open the durable queue
///    - Start the link watcher and the upload scheduler
///
/// 2. **Main Loop**
///    - Read the sensor, reassemble and decode frames, buffer and queue records
///    - Upload queued records in the background on the quality-tier interval
///    - Handle Ctrl+C for graceful shutdown
///
/// 3. **Graceful Shutdown**
///    - Flush the aggregation buffer into the queue
///    - Stop the scheduler, abandoning any upload in flight
///    - Log final queue health
///
/// # Errors
///
/// Returns error if the configuration is invalid or the queue cannot be opened
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let _log_guard = init_logging(&config.logging);
    info!("Telemetry Uplink v{} starting...", env!("CARGO_PKG_VERSION"));

    let queue = SqliteQueue::open(&config.queue.database_path)
        .with_context(|| format!("Failed to open queue at {}", config.queue.database_path))?;
    info!(
        "Queue holds {} pending and {} dead-lettered records",
        queue.pending_count()?,
        queue.dead_letter_count()?
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Connectivity
    let (watcher, link_rx) = LinkWatcher::new(config.collector_addr()?, LINK_CHECK_INTERVAL, true);
    let watcher_task = tokio::spawn(watcher.run());

    // Upload
    let http = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;
    let probe = HttpHealthProbe::new(
        http.clone(),
        config.health_url(),
        Duration::from_millis(config.collector.probe_timeout_ms),
    );
    let monitor = NetworkMonitor::new(Arc::new(probe), Arc::new(link_rx.clone()));
    let client = HttpCollectorClient::from_config(http, &config);
    let uploader = Arc::new(
        BatchUploader::new(queue.clone(), Arc::new(client), monitor).with_max_retries(config.queue.max_retries),
    );
    let scheduler = UploadScheduler::new(uploader.clone(), queue.clone(), link_rx).with_retention(
        config.queue.retention_days,
        Duration::from_secs(config.queue.maintenance_interval_s),
    );
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    // Ingestion
    let mut pipeline = IngestPipeline::new(
        queue.clone(),
        AggregationBuffer::with_capacity(config.buffer.capacity, config.buffer.flush_threshold),
        StreamReassembler::with_max_payload_len(config.device.max_payload_len),
    );

    info!("Reading sensor at {} ({} baud)", config.device.port, config.device.baud_rate);
    info!("Press Ctrl+C to exit");

    tokio::select! {
        _ = ingest_loop(&mut pipeline, &config.device, shutdown_rx.clone()) => {}

        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(e) => error!("Failed to listen for Ctrl+C, shutting down: {}", e),
        }
    }

    let _ = shutdown_tx.send(true);

    // Buffered samples reach the queue before anything else is waited on
    let stats = pipeline.shutdown().await;
    info!(
        "Ingested {} records ({} written, {} write failures, {} frames dropped)",
        stats.records_ingested, stats.records_written, stats.write_failures, stats.frames_dropped
    );

    if let Err(e) = scheduler_task.await {
        warn!("Upload scheduler ended abnormally: {}", e);
    }
    watcher_task.abort();

    match uploader.health() {
        Ok(health) => info!(
            "Exiting with {} pending and {} dead-lettered records",
            health.pending, health.dead_letters
        ),
        Err(e) => warn!("Failed to read queue health: {}", e),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shipped_config_is_valid() {
        let config = Config::load(DEFAULT_CONFIG_PATH).unwrap();
        assert_eq!(config.buffer.capacity, 125);
        assert_eq!(config.collector_addr().unwrap(), "localhost:8080");
    }

    #[test]
    fn test_retry_intervals() {
        assert!(DEVICE_RETRY_INTERVAL < LINK_CHECK_INTERVAL);
    }
}
