//! # Telemetry Uplink Library
//!
//! Ingest 25Hz GPS/motion telemetry from a serial sensor and deliver it
//! reliably to a remote collector.
//!
//! Device bytes are reassembled into checksummed frames, decoded into
//! telemetry records, batched in a small aggregation buffer and persisted in a
//! SQLite-backed queue. A batch uploader drains the queue in quality-sized
//! batches, with idempotent batch ids, retry accounting and a dead-letter store
//! for records that keep failing.

pub mod aggregation;
pub mod config;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod serial;
pub mod uploader;

#[cfg(test)]
pub(crate) mod test_support;
