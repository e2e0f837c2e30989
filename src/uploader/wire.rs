//! Collector wire format.
//!
//! The collector accepts a JSON array of camelCase telemetry objects, optionally
//! gzip-compressed. Conversion from `TelemetryRecord` happens only here.

use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::telemetry::{VALID_DATE, VALID_FULLY_RESOLVED, VALID_TIME};
use crate::protocol::TelemetryRecord;
use crate::queue::models::format_timestamp;

/// One telemetry object of a batch upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTelemetry {
    #[serde(rename = "iTOW")]
    pub itow: u32,
    pub timestamp: String,
    pub device_id: String,
    pub session_id: Option<String>,
    pub gps: WireGps,
    pub motion: WireMotion,
    pub battery: WireBattery,
    pub flags: WireFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireGps {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub altitude_msl: f64,
    pub speed: f64,
    pub heading: f64,
    pub satellites: u8,
    pub fix_type: u8,
    pub horizontal_accuracy: f64,
    pub vertical_accuracy: f64,
    pub speed_accuracy: f64,
    pub heading_accuracy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axes {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMotion {
    pub g_force: Axes,
    pub rotation_rate: Axes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBattery {
    pub percent: u8,
    pub voltage: Option<f64>,
    pub charging: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFlags {
    pub fix_valid: bool,
    pub valid_date: bool,
    pub valid_time: bool,
    pub fully_resolved: bool,
    pub time_accuracy_ns: u32,
}

impl WireTelemetry {
    /// Build the wire object for `record` sent by `device_id`
    pub fn from_record(record: &TelemetryRecord, device_id: &str, session_id: Option<&str>) -> Self {
        let gps = &record.gps;
        let motion = &record.motion;

        Self {
            itow: record.itow_ms,
            timestamp: format_timestamp(&record.timestamp),
            device_id: device_id.to_string(),
            session_id: session_id.map(str::to_string),
            gps: WireGps {
                latitude: gps.latitude,
                longitude: gps.longitude,
                altitude: gps.altitude_ellipsoid_m,
                altitude_msl: gps.altitude_msl_m,
                speed: gps.speed_kmh,
                heading: gps.heading_deg,
                satellites: gps.satellites,
                fix_type: gps.fix_type,
                horizontal_accuracy: gps.horizontal_accuracy_m,
                vertical_accuracy: gps.vertical_accuracy_m,
                speed_accuracy: gps.speed_accuracy_mps,
                heading_accuracy: gps.heading_accuracy_deg,
            },
            motion: WireMotion {
                g_force: Axes { x: motion.g_x, y: motion.g_y, z: motion.g_z },
                rotation_rate: Axes { x: motion.rot_x, y: motion.rot_y, z: motion.rot_z },
            },
            battery: WireBattery {
                percent: record.battery_percent,
                voltage: record.battery_voltage,
                charging: record.is_charging,
            },
            flags: WireFlags {
                fix_valid: gps.fix_valid,
                valid_date: record.validity_flags & VALID_DATE != 0,
                valid_time: record.validity_flags & VALID_TIME != 0,
                fully_resolved: record.validity_flags & VALID_FULLY_RESOLVED != 0,
                time_accuracy_ns: record.time_accuracy_ns,
            },
        }
    }
}

/// Serialize a batch body, gzip-compressed when `compress` is set
pub fn encode_body(batch: &[WireTelemetry], compress: bool) -> Result<Bytes> {
    let json = serde_json::to_vec(batch)?;
    if !compress {
        return Ok(Bytes::from(json));
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder.write_all(&json)?;
    Ok(Bytes::from(encoder.finish()?))
}
