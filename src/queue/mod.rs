//! # Durable Queue Module
//!
//! Crash-safe, ordered store of records awaiting delivery.
//!
//! This module handles:
//! - Appending decoded records as pending queue rows
//! - Strict FIFO fetch of rows not yet uploaded
//! - Atomic multi-row upload marking and retry accounting
//! - Dead-letter promotion and reinstatement
//! - Batch idempotency records and upload statistics
//! - Age-based retention

pub mod models;
pub mod schema;
pub mod store;

pub use models::{DeadLetterRecord, QueueEntry, RetentionReport, UploadBatch, UploadStat};
pub use store::SqliteQueue;
