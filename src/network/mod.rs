//! # Network Quality Module
//!
//! Classifies the link to the collector into quality tiers that drive batch
//! sizing and upload cadence.
//!
//! This module handles:
//! - The fixed tier policy table (batch size and interval per tier)
//! - Latency probing against the collector health endpoint
//! - Device-level connectivity checks that short-circuit probing when offline

pub mod monitor;
pub mod quality;

pub use monitor::{Connectivity, HttpHealthProbe, LatencyProbe, LinkWatcher, NetworkMonitor};
pub use quality::NetworkQuality;
