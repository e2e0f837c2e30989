//! # Ingestion Pipeline
//!
//! Device bytes -> frames -> telemetry records -> aggregation buffer -> durable queue.
//!
//! Reassembly and decoding run inline on the caller's task. Buffer flushes are
//! handed to a separate queue-writer task, so a slow or failing store never
//! blocks the 25Hz producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::aggregation::{AggregationBuffer, BufferStats};
use crate::error::Result;
use crate::protocol::reassembler::ReassemblerStats;
use crate::protocol::{StreamReassembler, TelemetryRecord};
use crate::queue::SqliteQueue;
use crate::serial::ByteSource;

/// Records between progress log lines (one minute at 25Hz)
const LOG_INTERVAL_RECORDS: u64 = 1_500;

/// Ingestion counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngestStats {
    /// Frames that passed validation
    pub frames_decoded: u64,
    /// Frames rejected by the codec
    pub frames_dropped: u64,
    /// Telemetry frames whose payload failed to decode
    pub decode_errors: u64,
    /// Valid frames of other message types
    pub unknown_messages: u64,
    /// Records pushed into the buffer
    pub records_ingested: u64,
    /// Records persisted in the queue
    pub records_written: u64,
    /// Flush batches lost after the write retry also failed
    pub write_failures: u64,
    pub buffer: BufferStats,
}

#[derive(Debug, Default)]
struct WriterCounters {
    records_written: AtomicU64,
    write_failures: AtomicU64,
}

/// Ingestion front end for one device
pub struct IngestPipeline {
    reassembler: StreamReassembler,
    buffer: AggregationBuffer<TelemetryRecord>,
    queue: SqliteQueue,
    writer: JoinHandle<()>,
    counters: Arc<WriterCounters>,
    decode_errors: u64,
    unknown_messages: u64,
    records_ingested: u64,
}

impl std::fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl IngestPipeline {
    /// Create a pipeline and spawn its queue writer
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Arguments
    ///
    /// * `queue` - Destination of flushed records
    /// * `buffer` - Aggregation buffer; any previous subscriber is replaced
    /// * `reassembler` - Stream reassembler for the device byte stream
    pub fn new(
        queue: SqliteQueue,
        mut buffer: AggregationBuffer<TelemetryRecord>,
        reassembler: StreamReassembler,
    ) -> Self {
        let handoffs = buffer.subscribe();
        let counters = Arc::new(WriterCounters::default());
        let writer = tokio::spawn(write_handoffs(queue.clone(), handoffs, counters.clone()));

        Self {
            reassembler,
            buffer,
            queue,
            writer,
            counters,
            decode_errors: 0,
            unknown_messages: 0,
            records_ingested: 0,
        }
    }

    /// Feed one chunk of device bytes
    ///
    /// # Returns
    ///
    /// * `usize` - Number of telemetry records accepted from this chunk
    pub fn ingest_chunk(&mut self, chunk: &[u8]) -> usize {
        let mut accepted = 0;

        for frame in self.reassembler.push(chunk) {
            if !frame.is_telemetry() {
                self.unknown_messages += 1;
                trace!("Ignoring message class 0x{:02X} id 0x{:02X}", frame.class, frame.id);
                continue;
            }

            match TelemetryRecord::from_frame(&frame) {
                Ok(record) => {
                    // One at a time so a large chunk flushes instead of overflowing
                    self.buffer.add(record);
                    accepted += 1;
                }
                Err(e) => {
                    self.decode_errors += 1;
                    warn!("Dropped telemetry frame: {}", e);
                }
            }
        }

        let before = self.records_ingested;
        self.records_ingested += accepted as u64;
        if before / LOG_INTERVAL_RECORDS != self.records_ingested / LOG_INTERVAL_RECORDS {
            info!("Ingested {} records", self.records_ingested);
        }

        accepted
    }

    /// Read from `source` until it closes or `shutdown` changes
    ///
    /// # Errors
    ///
    /// Returns the source's error if reading fails; already ingested records
    /// stay buffered for [`IngestPipeline::shutdown`]
    pub async fn run<S: ByteSource + ?Sized>(
        &mut self,
        source: &mut S,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                chunk = source.read_chunk() => match chunk? {
                    Some(bytes) => {
                        self.ingest_chunk(&bytes);
                    }
                    None => {
                        info!("Device stream closed");
                        return Ok(());
                    }
                },

                _ = shutdown.changed() => {
                    debug!("Ingestion stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Drop any partial frame, e.g. after the device was reopened
    pub fn reset_stream(&mut self) {
        self.reassembler.reset();
    }

    pub fn stats(&self) -> IngestStats {
        let ReassemblerStats {
            frames_emitted,
            frames_dropped,
            ..
        } = self.reassembler.stats();

        IngestStats {
            frames_decoded: frames_emitted,
            frames_dropped,
            decode_errors: self.decode_errors,
            unknown_messages: self.unknown_messages,
            records_ingested: self.records_ingested,
            records_written: self.counters.records_written.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
            buffer: self.buffer.stats(),
        }
    }

    /// Persist everything still buffered and stop the writer
    ///
    /// Handoffs already queued are written first, then the buffer remainder,
    /// so queue order matches arrival order.
    pub async fn shutdown(mut self) -> IngestStats {
        let remaining = self.buffer.flush();
        self.buffer.unsubscribe();

        if let Err(e) = (&mut self.writer).await {
            warn!("Queue writer ended abnormally: {}", e);
        }

        if !remaining.is_empty() {
            persist(&self.queue, &remaining, &self.counters);
            info!("Flushed {} buffered records on shutdown", remaining.len());
        }

        self.stats()
    }
}

async fn write_handoffs(
    queue: SqliteQueue,
    mut handoffs: mpsc::UnboundedReceiver<Vec<TelemetryRecord>>,
    counters: Arc<WriterCounters>,
) {
    while let Some(batch) = handoffs.recv().await {
        persist(&queue, &batch, &counters);
    }
    debug!("Queue writer finished");
}

/// Append a flushed batch, retrying once
fn persist(queue: &SqliteQueue, batch: &[TelemetryRecord], counters: &WriterCounters) {
    let result = queue.append_batch(batch).or_else(|first| {
        warn!("{} ({} records), retrying once", first, batch.len());
        queue.append_batch(batch)
    });

    match result {
        Ok(ids) => {
            counters.records_written.fetch_add(ids.len() as u64, Ordering::Relaxed);
        }
        Err(e) => {
            error!("{}; {} records lost", e, batch.len());
            counters.write_failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::encode_frame;
    use crate::protocol::frame::{CLASS_TELEMETRY, ID_TELEMETRY_SAMPLE};
    use crate::protocol::telemetry::encode_telemetry_payload;
    use crate::serial::port_trait::mocks::MockByteSource;
    use crate::test_support::sample_record;
    use tokio_test::{assert_err, assert_ok};

    fn telemetry_frame(seq: u32) -> Vec<u8> {
        encode_frame(
            CLASS_TELEMETRY,
            ID_TELEMETRY_SAMPLE,
            &encode_telemetry_payload(&sample_record(seq)),
        )
        .unwrap()
    }

    fn stream(count: u32) -> Vec<u8> {
        (0..count).flat_map(telemetry_frame).collect()
    }

    fn pipeline(queue: &SqliteQueue, capacity: usize, threshold: f64) -> IngestPipeline {
        IngestPipeline::new(
            queue.clone(),
            AggregationBuffer::with_capacity(capacity, threshold),
            StreamReassembler::new(),
        )
    }

    fn queued_itows(queue: &SqliteQueue) -> Vec<u32> {
        queue
            .fetch_unsent(10_000)
            .unwrap()
            .iter()
            .map(|e| e.record().unwrap().itow_ms)
            .collect()
    }

    #[tokio::test]
    async fn test_chunked_stream_reaches_queue_in_order() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let mut pipeline = pipeline(&queue, 10, 0.5);

        let bytes = stream(12);
        let mut accepted = 0;
        for chunk in bytes.chunks(7) {
            accepted += pipeline.ingest_chunk(chunk);
        }
        assert_eq!(accepted, 12);

        let stats = pipeline.shutdown().await;
        assert_eq!(stats.frames_decoded, 12);
        assert_eq!(stats.records_ingested, 12);
        assert_eq!(stats.records_written, 12);
        assert_eq!(stats.write_failures, 0);
        assert!(stats.buffer.total_flushes >= 2);

        let expected: Vec<u32> = (0..12).map(|i| sample_record(i).itow_ms).collect();
        assert_eq!(queued_itows(&queue), expected);
    }

    #[tokio::test]
    async fn test_large_chunk_flushes_instead_of_overflowing() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let mut pipeline = pipeline(&queue, 10, 0.8);

        assert_eq!(pipeline.ingest_chunk(&stream(30)), 30);
        let stats = pipeline.shutdown().await;

        assert_eq!(stats.buffer.total_overflows, 0);
        assert_eq!(queue.pending_count().unwrap(), 30);
    }

    #[tokio::test]
    async fn test_other_messages_and_bad_frames_are_counted() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let mut pipeline = pipeline(&queue, 10, 1.0);

        let mut bytes = encode_frame(0x01, 0x07, &[1, 2, 3, 4]).unwrap();
        let mut corrupt = telemetry_frame(0);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        bytes.extend(corrupt);
        bytes.extend(encode_frame(CLASS_TELEMETRY, ID_TELEMETRY_SAMPLE, &[0u8; 79]).unwrap());
        bytes.extend(telemetry_frame(1));

        assert_eq!(pipeline.ingest_chunk(&bytes), 1);

        let stats = pipeline.stats();
        assert_eq!(stats.unknown_messages, 1);
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.decode_errors, 1);
        assert_eq!(stats.records_ingested, 1);

        pipeline.shutdown().await;
        assert_eq!(queued_itows(&queue), vec![sample_record(1).itow_ms]);
    }

    #[tokio::test]
    async fn test_run_until_source_closes() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let mut pipeline = pipeline(&queue, 125, 0.8);

        let bytes = stream(5);
        let mut source = MockByteSource::new(bytes.chunks(13).map(<[u8]>::to_vec).collect());
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        assert_ok!(pipeline.run(&mut source, &mut stop_rx).await);
        let stats = pipeline.shutdown().await;

        assert_eq!(stats.records_written, 5);
        assert_eq!(queue.pending_count().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_run_surfaces_device_errors() {
        let queue = SqliteQueue::open_in_memory().unwrap();
        let mut pipeline = pipeline(&queue, 125, 0.8);

        let mut source = MockByteSource::new(vec![stream(2)]).failing();
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        assert_err!(pipeline.run(&mut source, &mut stop_rx).await);

        // Records read before the error are still persisted
        pipeline.shutdown().await;
        assert_eq!(queue.pending_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_is_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let queue = SqliteQueue::open(&path).unwrap();

        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("DROP TABLE telemetry_queue;").unwrap();
        drop(conn);

        let mut pipeline = pipeline(&queue, 10, 1.0);
        pipeline.ingest_chunk(&stream(3));
        let stats = pipeline.shutdown().await;

        assert_eq!(stats.records_ingested, 3);
        assert_eq!(stats.records_written, 0);
        assert_eq!(stats.write_failures, 1);
    }
}
