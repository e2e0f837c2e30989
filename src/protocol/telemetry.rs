//! # Telemetry Sample Decoding
//!
//! Decodes the 80-byte telemetry payload (class `0xFF`, id `0x01`) into a
//! [`TelemetryRecord`] and encodes records back into payloads.
//!
//! ## Payload Layout (little-endian)
//!
//! | Offset | Type | Field | Scale |
//! |--------|------|-------|-------|
//! | 0 | u32 | iTOW | ms |
//! | 4 | u16 | year | |
//! | 6..=10 | u8 | month, day, hour, minute, second | |
//! | 11 | u8 | date/time validity flags | bitfield |
//! | 12 | u32 | time accuracy | ns |
//! | 16 | i32 | nanosecond fraction | ns |
//! | 20 | u8 | fix type | |
//! | 21 | u8 | fix flags (bit 0 = fix valid) | bitfield |
//! | 22 | u8 | satellites | |
//! | 23 | u8 | battery (bit 7 = charging, bits 0-6 = %) | |
//! | 24 | i32 | longitude | 1e-7 deg |
//! | 28 | i32 | latitude | 1e-7 deg |
//! | 32 | i32 | height above ellipsoid | mm |
//! | 36 | i32 | height above mean sea level | mm |
//! | 40 | u32 | horizontal accuracy | mm |
//! | 44 | u32 | vertical accuracy | mm |
//! | 48 | i32 | ground speed | mm/s |
//! | 52 | i32 | heading of motion | 1e-5 deg |
//! | 56 | u32 | speed accuracy | mm/s |
//! | 60 | u32 | heading accuracy | 1e-5 deg |
//! | 64 | 3 × i16 | g-force x/y/z | mg |
//! | 70 | 3 × i16 | rotation rate x/y/z | 0.01 deg/s |
//! | 76 | u16 | battery voltage (0 = not reported) | mV |
//! | 78 | u16 | reserved | |

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::frame::{Frame, TELEMETRY_PAYLOAD_SIZE};
use crate::error::{Result, UplinkError};

/// Validity bit: UTC date is valid
pub const VALID_DATE: u8 = 0x01;
/// Validity bit: UTC time of day is valid
pub const VALID_TIME: u8 = 0x02;
/// Validity bit: UTC time of day fully resolved
pub const VALID_FULLY_RESOLVED: u8 = 0x04;

/// Fix flags bit: fix is valid within accuracy masks
const FIX_FLAG_VALID: u8 = 0x01;

/// Battery byte bit: device is charging
const BATTERY_CHARGING_BIT: u8 = 0x80;

/// Speed conversion from m/s to km/h
const MPS_TO_KMH: f64 = 3.6;

/// GPS fix portion of a telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    /// Latitude in degrees
    pub latitude: f64,

    /// Longitude in degrees
    pub longitude: f64,

    /// Height above the WGS84 ellipsoid in meters
    pub altitude_ellipsoid_m: f64,

    /// Height above mean sea level in meters
    pub altitude_msl_m: f64,

    /// Ground speed in km/h
    pub speed_kmh: f64,

    /// Heading of motion in degrees
    pub heading_deg: f64,

    /// Satellites used in the solution
    pub satellites: u8,

    /// Fix quality code (0 = no fix, 2 = 2D, 3 = 3D, ...)
    pub fix_type: u8,

    /// Horizontal accuracy estimate in meters
    pub horizontal_accuracy_m: f64,

    /// Vertical accuracy estimate in meters
    pub vertical_accuracy_m: f64,

    /// Speed accuracy estimate in m/s
    pub speed_accuracy_mps: f64,

    /// Heading accuracy estimate in degrees
    pub heading_accuracy_deg: f64,

    /// Fix is valid
    pub fix_valid: bool,
}

/// Motion portion of a telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Motion {
    /// Acceleration along x in g
    pub g_x: f64,
    /// Acceleration along y in g
    pub g_y: f64,
    /// Acceleration along z in g
    pub g_z: f64,
    /// Rotation rate around x in deg/s
    pub rot_x: f64,
    /// Rotation rate around y in deg/s
    pub rot_y: f64,
    /// Rotation rate around z in deg/s
    pub rot_z: f64,
}

/// One decoded sensor sample
///
/// Immutable once constructed; this is also the payload persisted in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// GPS time of week in milliseconds
    pub itow_ms: u32,

    /// UTC time of the sample
    pub timestamp: DateTime<Utc>,

    /// GPS fix
    pub gps: GpsFix,

    /// Accelerometer and gyroscope readings
    pub motion: Motion,

    /// Battery level in percent (0-100)
    pub battery_percent: u8,

    /// Battery voltage in volts, when the device reports it
    pub battery_voltage: Option<f64>,

    /// Device is charging
    pub is_charging: bool,

    /// Time accuracy estimate in nanoseconds
    pub time_accuracy_ns: u32,

    /// Date/time validity bitfield (`VALID_*`)
    pub validity_flags: u8,
}

impl TelemetryRecord {
    /// Decode a telemetry record from a validated frame
    ///
    /// # Errors
    ///
    /// Returns `MalformedFrame` if the frame is not a telemetry sample, otherwise
    /// the errors of [`decode_telemetry_payload`]
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        if !frame.is_telemetry() {
            return Err(UplinkError::MalformedFrame(format!(
                "Not a telemetry frame: class 0x{:02X} id 0x{:02X}",
                frame.class, frame.id
            )));
        }

        decode_telemetry_payload(&frame.payload)
    }

    /// Whether both UTC date and time were flagged valid by the device
    pub fn has_valid_time(&self) -> bool {
        self.validity_flags & (VALID_DATE | VALID_TIME) == (VALID_DATE | VALID_TIME)
    }
}

/// Bounds-checked little-endian field reader
struct PayloadReader<'a> {
    bytes: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        self.bytes
            .get(offset..offset + N)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| UplinkError::DecodeFailure(format!("Field at offset {} out of bounds", offset)))
    }

    fn u8(&self, offset: usize) -> Result<u8> {
        Ok(self.array::<1>(offset)?[0])
    }

    fn u16(&self, offset: usize) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array(offset)?))
    }

    fn i16(&self, offset: usize) -> Result<i16> {
        Ok(i16::from_le_bytes(self.array(offset)?))
    }

    fn u32(&self, offset: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array(offset)?))
    }

    fn i32(&self, offset: usize) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array(offset)?))
    }
}

/// Decode an 80-byte telemetry payload
///
/// Decoding is all-or-nothing: any failing field aborts the whole record.
///
/// # Arguments
///
/// * `payload` - Telemetry payload (exactly 80 bytes)
///
/// # Returns
///
/// * `Result<TelemetryRecord>` - Decoded record in physical units
///
/// # Errors
///
/// Returns `UnexpectedPayloadSize` if the payload is not 80 bytes, or
/// `DecodeFailure` if a field cannot be extracted (e.g. an impossible date)
pub fn decode_telemetry_payload(payload: &[u8]) -> Result<TelemetryRecord> {
    if payload.len() != TELEMETRY_PAYLOAD_SIZE {
        return Err(UplinkError::UnexpectedPayloadSize {
            expected: TELEMETRY_PAYLOAD_SIZE,
            actual: payload.len(),
        });
    }

    let r = PayloadReader::new(payload);

    let timestamp = decode_timestamp(&r)?;

    let battery = r.u8(23)?;
    let battery_mv = r.u16(76)?;

    let gps = GpsFix {
        longitude: r.i32(24)? as f64 * 1e-7,
        latitude: r.i32(28)? as f64 * 1e-7,
        altitude_ellipsoid_m: r.i32(32)? as f64 / 1000.0,
        altitude_msl_m: r.i32(36)? as f64 / 1000.0,
        horizontal_accuracy_m: r.u32(40)? as f64 / 1000.0,
        vertical_accuracy_m: r.u32(44)? as f64 / 1000.0,
        speed_kmh: r.i32(48)? as f64 / 1000.0 * MPS_TO_KMH,
        heading_deg: r.i32(52)? as f64 * 1e-5,
        speed_accuracy_mps: r.u32(56)? as f64 / 1000.0,
        heading_accuracy_deg: r.u32(60)? as f64 * 1e-5,
        satellites: r.u8(22)?,
        fix_type: r.u8(20)?,
        fix_valid: r.u8(21)? & FIX_FLAG_VALID != 0,
    };

    let motion = Motion {
        g_x: r.i16(64)? as f64 / 1000.0,
        g_y: r.i16(66)? as f64 / 1000.0,
        g_z: r.i16(68)? as f64 / 1000.0,
        rot_x: r.i16(70)? as f64 / 100.0,
        rot_y: r.i16(72)? as f64 / 100.0,
        rot_z: r.i16(74)? as f64 / 100.0,
    };

    Ok(TelemetryRecord {
        itow_ms: r.u32(0)?,
        timestamp,
        gps,
        motion,
        battery_percent: battery & !BATTERY_CHARGING_BIT,
        battery_voltage: (battery_mv != 0).then(|| battery_mv as f64 / 1000.0),
        is_charging: battery & BATTERY_CHARGING_BIT != 0,
        time_accuracy_ns: r.u32(12)?,
        validity_flags: r.u8(11)?,
    })
}

/// UTC timestamp of a sample
///
/// Before the device resolves UTC the date/time fields are zero and the
/// validity flags are clear. Such samples are stamped with the Unix epoch plus
/// the time-of-week counter and keep their flags, so consumers can tell them
/// apart via [`TelemetryRecord::has_valid_time`]. Fields flagged valid that do
/// not form a real date/time are a decode failure.
fn decode_timestamp(r: &PayloadReader<'_>) -> Result<DateTime<Utc>> {
    let year = r.u16(4)?;
    let (month, day) = (r.u8(6)?, r.u8(7)?);
    let (hour, minute, second) = (r.u8(8)?, r.u8(9)?, r.u8(10)?);
    let nano = r.i32(16)?;
    let flags = r.u8(11)?;

    let naive = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, second as u32));

    match naive {
        Some(naive) => Ok(Utc.from_utc_datetime(&naive) + Duration::nanoseconds(nano as i64)),
        None if flags & (VALID_DATE | VALID_TIME) == 0 => {
            let itow_ms = r.u32(0)?;
            Utc.timestamp_millis_opt(itow_ms as i64).single().ok_or_else(|| {
                UplinkError::DecodeFailure(format!("Unrepresentable time of week {} ms", itow_ms))
            })
        }
        None => Err(UplinkError::DecodeFailure(format!(
            "Invalid UTC date/time {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hour, minute, second
        ))),
    }
}

/// Encode a record back into an 80-byte telemetry payload
///
/// Physical values are rounded to the nearest wire unit.
pub fn encode_telemetry_payload(record: &TelemetryRecord) -> Vec<u8> {
    let mut payload = vec![0u8; TELEMETRY_PAYLOAD_SIZE];

    let mut put = |offset: usize, bytes: &[u8]| {
        payload[offset..offset + bytes.len()].copy_from_slice(bytes);
    };

    let ts = record.timestamp;
    let gps = &record.gps;
    let motion = &record.motion;

    put(0, &record.itow_ms.to_le_bytes());
    put(4, &(ts.year() as u16).to_le_bytes());
    put(6, &[ts.month() as u8, ts.day() as u8, ts.hour() as u8, ts.minute() as u8, ts.second() as u8]);
    put(11, &[record.validity_flags]);
    put(12, &record.time_accuracy_ns.to_le_bytes());
    put(16, &(ts.nanosecond() as i32).to_le_bytes());
    put(20, &[gps.fix_type, if gps.fix_valid { FIX_FLAG_VALID } else { 0 }, gps.satellites]);

    let mut battery = record.battery_percent & !BATTERY_CHARGING_BIT;
    if record.is_charging {
        battery |= BATTERY_CHARGING_BIT;
    }
    put(23, &[battery]);

    put(24, &((gps.longitude * 1e7).round() as i32).to_le_bytes());
    put(28, &((gps.latitude * 1e7).round() as i32).to_le_bytes());
    put(32, &((gps.altitude_ellipsoid_m * 1000.0).round() as i32).to_le_bytes());
    put(36, &((gps.altitude_msl_m * 1000.0).round() as i32).to_le_bytes());
    put(40, &((gps.horizontal_accuracy_m * 1000.0).round() as u32).to_le_bytes());
    put(44, &((gps.vertical_accuracy_m * 1000.0).round() as u32).to_le_bytes());
    put(48, &((gps.speed_kmh / MPS_TO_KMH * 1000.0).round() as i32).to_le_bytes());
    put(52, &((gps.heading_deg * 1e5).round() as i32).to_le_bytes());
    put(56, &((gps.speed_accuracy_mps * 1000.0).round() as u32).to_le_bytes());
    put(60, &((gps.heading_accuracy_deg * 1e5).round() as u32).to_le_bytes());

    for (i, g) in [motion.g_x, motion.g_y, motion.g_z].iter().enumerate() {
        put(64 + i * 2, &((g * 1000.0).round() as i16).to_le_bytes());
    }
    for (i, rot) in [motion.rot_x, motion.rot_y, motion.rot_z].iter().enumerate() {
        put(70 + i * 2, &((rot * 100.0).round() as i16).to_le_bytes());
    }

    let battery_mv = record.battery_voltage.map_or(0, |v| (v * 1000.0).round() as u16);
    put(76, &battery_mv.to_le_bytes());

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{CLASS_TELEMETRY, ID_TELEMETRY_SAMPLE};

    /// Hand-built payload: 2026-03-14 09:26:53.5 UTC near Zurich, driving east
    fn sample_payload() -> Vec<u8> {
        let mut p = vec![0u8; TELEMETRY_PAYLOAD_SIZE];
        p[0..4].copy_from_slice(&345_600_000u32.to_le_bytes());
        p[4..6].copy_from_slice(&2026u16.to_le_bytes());
        p[6..11].copy_from_slice(&[3, 14, 9, 26, 53]);
        p[11] = VALID_DATE | VALID_TIME | VALID_FULLY_RESOLVED;
        p[12..16].copy_from_slice(&25u32.to_le_bytes());
        p[16..20].copy_from_slice(&500_000_000i32.to_le_bytes());
        p[20] = 3; // 3D fix
        p[21] = 0x01; // fix valid
        p[22] = 14; // satellites
        p[23] = 0x80 | 87; // charging, 87%
        p[24..28].copy_from_slice(&85_417_000i32.to_le_bytes());
        p[28..32].copy_from_slice(&473_769_000i32.to_le_bytes());
        p[32..36].copy_from_slice(&456_789i32.to_le_bytes());
        p[36..40].copy_from_slice(&408_123i32.to_le_bytes());
        p[40..44].copy_from_slice(&1_500u32.to_le_bytes());
        p[44..48].copy_from_slice(&2_250u32.to_le_bytes());
        p[48..52].copy_from_slice(&10_000i32.to_le_bytes()); // 10 m/s
        p[52..56].copy_from_slice(&9_000_000i32.to_le_bytes()); // 90 deg
        p[56..60].copy_from_slice(&300u32.to_le_bytes());
        p[60..64].copy_from_slice(&150_000u32.to_le_bytes()); // 1.5 deg
        p[64..66].copy_from_slice(&(-250i16).to_le_bytes());
        p[66..68].copy_from_slice(&120i16.to_le_bytes());
        p[68..70].copy_from_slice(&1_000i16.to_le_bytes());
        p[70..72].copy_from_slice(&1_550i16.to_le_bytes());
        p[72..74].copy_from_slice(&(-300i16).to_le_bytes());
        p[74..76].copy_from_slice(&5i16.to_le_bytes());
        p[76..78].copy_from_slice(&3_912u16.to_le_bytes());
        p
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_decode_sample_payload() {
        let record = decode_telemetry_payload(&sample_payload()).unwrap();

        assert_eq!(record.itow_ms, 345_600_000);
        assert_eq!(record.timestamp.to_rfc3339(), "2026-03-14T09:26:53.500+00:00");
        assert!(record.has_valid_time());
        assert_eq!(record.time_accuracy_ns, 25);

        let gps = &record.gps;
        assert!(approx(gps.longitude, 8.5417));
        assert!(approx(gps.latitude, 47.3769));
        assert!(approx(gps.altitude_ellipsoid_m, 456.789));
        assert!(approx(gps.altitude_msl_m, 408.123));
        assert!(approx(gps.horizontal_accuracy_m, 1.5));
        assert!(approx(gps.vertical_accuracy_m, 2.25));
        assert!(approx(gps.speed_kmh, 36.0));
        assert!(approx(gps.heading_deg, 90.0));
        assert!(approx(gps.speed_accuracy_mps, 0.3));
        assert!(approx(gps.heading_accuracy_deg, 1.5));
        assert_eq!(gps.satellites, 14);
        assert_eq!(gps.fix_type, 3);
        assert!(gps.fix_valid);

        let motion = &record.motion;
        assert!(approx(motion.g_x, -0.25));
        assert!(approx(motion.g_y, 0.12));
        assert!(approx(motion.g_z, 1.0));
        assert!(approx(motion.rot_x, 15.5));
        assert!(approx(motion.rot_y, -3.0));
        assert!(approx(motion.rot_z, 0.05));

        assert_eq!(record.battery_percent, 87);
        assert!(record.is_charging);
        assert!(approx(record.battery_voltage.unwrap(), 3.912));
    }

    #[test]
    fn test_decode_not_charging_and_no_voltage() {
        let mut payload = sample_payload();
        payload[23] = 42;
        payload[76] = 0;
        payload[77] = 0;

        let record = decode_telemetry_payload(&payload).unwrap();
        assert_eq!(record.battery_percent, 42);
        assert!(!record.is_charging);
        assert_eq!(record.battery_voltage, None);
    }

    #[test]
    fn test_decode_wrong_size() {
        for size in [0, 79, 81, 92] {
            let result = decode_telemetry_payload(&vec![0u8; size]);
            match result {
                Err(UplinkError::UnexpectedPayloadSize { expected, actual }) => {
                    assert_eq!(expected, 80);
                    assert_eq!(actual, size);
                }
                other => panic!("Expected UnexpectedPayloadSize, got: {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_invalid_date_is_all_or_nothing() {
        let mut payload = sample_payload();
        payload[6] = 13; // month 13 while flagged valid

        let result = decode_telemetry_payload(&payload);
        assert!(matches!(result, Err(UplinkError::DecodeFailure(_))));

        payload[11] = VALID_DATE;
        let result = decode_telemetry_payload(&payload);
        assert!(matches!(result, Err(UplinkError::DecodeFailure(_))));
    }

    #[test]
    fn test_decode_sample_before_time_resolved() {
        let mut payload = vec![0u8; TELEMETRY_PAYLOAD_SIZE];
        payload[0..4].copy_from_slice(&90_061_000u32.to_le_bytes()); // 1d 1h 1m 1s into the week
        payload[22] = 5; // satellites
        payload[23] = 80; // 80%
        payload[66..68].copy_from_slice(&1_000i16.to_le_bytes()); // 1 g on y

        let record = decode_telemetry_payload(&payload).unwrap();

        assert_eq!(record.timestamp.to_rfc3339(), "1970-01-02T01:01:01+00:00");
        assert_eq!(record.validity_flags, 0);
        assert!(!record.has_valid_time());
        assert_eq!(record.gps.satellites, 5);
        assert_eq!(record.battery_percent, 80);
        assert!(approx(record.motion.g_y, 1.0));
        assert_eq!(record.battery_voltage, None);
    }

    #[test]
    fn test_encode_matches_hand_built_payload() {
        let record = decode_telemetry_payload(&sample_payload()).unwrap();
        assert_eq!(encode_telemetry_payload(&record), sample_payload());
    }

    #[test]
    fn test_from_frame_rejects_other_messages() {
        let frame = Frame::new(0x01, 0x07, sample_payload());
        assert!(matches!(TelemetryRecord::from_frame(&frame), Err(UplinkError::MalformedFrame(_))));

        let frame = Frame::new(CLASS_TELEMETRY, ID_TELEMETRY_SAMPLE, sample_payload());
        assert!(TelemetryRecord::from_frame(&frame).is_ok());
    }

    #[test]
    fn test_record_json_round_trip() {
        let record = decode_telemetry_payload(&sample_payload()).unwrap();
        let json = serde_json::to_string(&record).unwrap();
        let back: TelemetryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
