//! # Device Protocol Module
//!
//! Implementation of the binary frame protocol spoken by the GPS/motion sensor.
//!
//! This module handles:
//! - Frame layout constants and the `Frame` type
//! - Two-accumulator (8-bit Fletcher) checksum calculation
//! - Frame encoding and validating decode
//! - Telemetry payload decoding into `TelemetryRecord`
//! - Stream reassembly and resynchronization over a raw byte stream

pub mod frame;
pub mod checksum;
pub mod codec;
pub mod telemetry;
pub mod reassembler;

pub use frame::Frame;
pub use reassembler::StreamReassembler;
pub use telemetry::TelemetryRecord;
