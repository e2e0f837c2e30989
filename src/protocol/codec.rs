//! # Frame Codec
//!
//! Encodes and validates complete protocol frames.

use super::checksum::checksum;
use super::frame::*;
use crate::error::{Result, UplinkError};

/// Encode a message into a complete frame
///
/// # Arguments
///
/// * `class` - Message class byte
/// * `id` - Message id byte
/// * `payload` - Payload bytes (at most 65535)
///
/// # Returns
///
/// * `Result<Vec<u8>>` - Header + class/id/length + payload + checksum
///
/// # Errors
///
/// Returns `MalformedFrame` if the payload does not fit the 16-bit length field
///
/// # Examples
///
/// ```
/// use telemetry_uplink::protocol::codec::{decode_frame, encode_frame};
///
/// let bytes = encode_frame(0x0A, 0x04, &[1, 2, 3]).unwrap();
/// let frame = decode_frame(&bytes).unwrap();
/// assert_eq!((frame.class, frame.id, frame.payload), (0x0A, 0x04, vec![1, 2, 3]));
/// ```
pub fn encode_frame(class: u8, id: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(UplinkError::MalformedFrame(format!(
            "Payload size {} exceeds maximum {}",
            payload.len(),
            MAX_PAYLOAD_LEN
        )));
    }

    let length = (payload.len() as u16).to_le_bytes();

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    frame.push(SYNC_CHAR_1);
    frame.push(SYNC_CHAR_2);
    frame.push(class);
    frame.push(id);
    frame.extend_from_slice(&length);
    frame.extend_from_slice(payload);

    // Checksum over Class + Id + Length + Payload
    let (ck_a, ck_b) = checksum(&frame[2..]);
    frame.push(ck_a);
    frame.push(ck_b);

    Ok(frame)
}

/// Decode and validate a complete frame
///
/// # Arguments
///
/// * `bytes` - Exactly one frame (header through checksum)
///
/// # Returns
///
/// * `Result<Frame>` - Class, id and payload of the frame
///
/// # Errors
///
/// Returns `MalformedFrame` if:
/// - Fewer than 8 bytes are supplied
/// - Header bytes are not `0xB5 0x62`
/// - Declared length + 8 differs from the byte count
/// - Checksum does not match the trailing two bytes
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(UplinkError::MalformedFrame(format!(
            "Frame too short: {} bytes",
            bytes.len()
        )));
    }

    if bytes[0] != SYNC_CHAR_1 || bytes[1] != SYNC_CHAR_2 {
        return Err(UplinkError::MalformedFrame(format!(
            "Invalid header: 0x{:02X} 0x{:02X}",
            bytes[0], bytes[1]
        )));
    }

    let payload_len = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
    if payload_len + FRAME_OVERHEAD != bytes.len() {
        return Err(UplinkError::MalformedFrame(format!(
            "Length mismatch: declared payload {} bytes, frame has {} bytes",
            payload_len,
            bytes.len()
        )));
    }

    let checksum_at = FRAME_PREFIX_LEN + payload_len;
    let (ck_a, ck_b) = checksum(&bytes[2..checksum_at]);
    let (rx_a, rx_b) = (bytes[checksum_at], bytes[checksum_at + 1]);

    if (ck_a, ck_b) != (rx_a, rx_b) {
        return Err(UplinkError::MalformedFrame(format!(
            "Checksum mismatch: expected 0x{:02X}{:02X}, got 0x{:02X}{:02X}",
            ck_a, ck_b, rx_a, rx_b
        )));
    }

    Ok(Frame::new(
        bytes[2],
        bytes[3],
        bytes[FRAME_PREFIX_LEN..checksum_at].to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Vec<u8> {
        let payload: Vec<u8> = (0..TELEMETRY_PAYLOAD_SIZE as u8).collect();
        encode_frame(CLASS_TELEMETRY, ID_TELEMETRY_SAMPLE, &payload).unwrap()
    }

    #[test]
    fn test_encode_frame_structure() {
        let frame = encode_frame(0x01, 0x07, &[]).unwrap();
        assert_eq!(frame, vec![0xB5, 0x62, 0x01, 0x07, 0x00, 0x00, 0x08, 0x19]);
    }

    #[test]
    fn test_encode_length_little_endian() {
        let frame = encode_frame(0x01, 0x02, &vec![0u8; 0x0123]).unwrap();
        assert_eq!(frame[4], 0x23);
        assert_eq!(frame[5], 0x01);
        assert_eq!(frame.len(), 0x0123 + FRAME_OVERHEAD);
    }

    #[test]
    fn test_encode_payload_too_large() {
        let result = encode_frame(0x01, 0x02, &vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert!(matches!(result, Err(UplinkError::MalformedFrame(_))));
    }

    #[test]
    fn test_round_trip() {
        for (class, id, payload) in [
            (0xFFu8, 0x01u8, vec![0xAAu8; 80]),
            (0x01, 0x07, vec![]),
            (0x0A, 0x04, vec![0xB5, 0x62, 0x00]),
        ] {
            let bytes = encode_frame(class, id, &payload).unwrap();
            let frame = decode_frame(&bytes).unwrap();
            assert_eq!(frame, Frame::new(class, id, payload));
        }
    }

    #[test]
    fn test_decode_too_short() {
        let result = decode_frame(&[0xB5, 0x62, 0x01, 0x07, 0x00, 0x00, 0x08]);
        assert!(matches!(result, Err(UplinkError::MalformedFrame(_))));
    }

    #[test]
    fn test_decode_invalid_header() {
        let mut frame = sample_frame();
        frame[1] = 0x63;
        assert!(decode_frame(&frame).is_err());
    }

    #[test]
    fn test_decode_length_mismatch() {
        let mut frame = sample_frame();
        frame.push(0x00);
        assert!(decode_frame(&frame).is_err());

        let frame = sample_frame();
        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn test_any_payload_or_checksum_mutation_fails() {
        let frame = sample_frame();

        // Every byte from class through ck_b is covered
        for index in 2..frame.len() {
            let mut corrupted = frame.clone();
            corrupted[index] ^= 0x01;
            assert!(
                decode_frame(&corrupted).is_err(),
                "Mutation at byte {} was not detected",
                index
            );
        }
    }
}
