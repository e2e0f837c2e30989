//! # Frame Constants and Types
//!
//! Core wire definitions for the sensor protocol.
//!
//! ```text
//! 0xB5 0x62 | class(1) | id(1) | len(2, LE) | payload(len) | ck_a(1) ck_b(1)
//! ```

/// First header byte
pub const SYNC_CHAR_1: u8 = 0xB5;

/// Second header byte
pub const SYNC_CHAR_2: u8 = 0x62;

/// Header + class + id + length
pub const FRAME_PREFIX_LEN: usize = 6;

/// Everything that is not payload: header(2) + class(1) + id(1) + length(2) + checksum(2)
pub const FRAME_OVERHEAD: usize = 8;

/// Telemetry message class
pub const CLASS_TELEMETRY: u8 = 0xFF;

/// Telemetry message id within `CLASS_TELEMETRY`
pub const ID_TELEMETRY_SAMPLE: u8 = 0x01;

/// Telemetry sample payload size
pub const TELEMETRY_PAYLOAD_SIZE: usize = 80;

/// Largest payload a length field can declare
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// One validated protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message class
    pub class: u8,

    /// Message id within the class
    pub id: u8,

    /// Payload bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame
    pub fn new(class: u8, id: u8, payload: Vec<u8>) -> Self {
        Self { class, id, payload }
    }

    /// Whether this is a telemetry sample message
    pub fn is_telemetry(&self) -> bool {
        self.class == CLASS_TELEMETRY && self.id == ID_TELEMETRY_SAMPLE
    }

    /// Total encoded size including header and checksum
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}
