//! # Frame Checksum
//!
//! Two-accumulator running checksum (8-bit Fletcher) used by the device protocol.
//!
//! For every byte: `ck_a = (ck_a + byte) & 0xFF`, then `ck_b = (ck_b + ck_a) & 0xFF`.
//! The checksum covers class, id, length and payload, never the two header bytes.

/// Calculate the two checksum bytes over `data`
///
/// # Arguments
///
/// * `data` - Byte slice to checksum (Class + Id + Length + Payload)
///
/// # Returns
///
/// * `(u8, u8)` - `(ck_a, ck_b)` in transmission order
///
/// # Examples
///
/// ```
/// use telemetry_uplink::protocol::checksum::checksum;
///
/// let (ck_a, ck_b) = checksum(&[0xFF, 0x01, 0x00, 0x00]);
/// assert_eq!((ck_a, ck_b), (0x00, 0xFF));
/// ```
pub fn checksum(data: &[u8]) -> (u8, u8) {
    let mut ck_a: u8 = 0;
    let mut ck_b: u8 = 0;

    for &byte in data {
        ck_a = ck_a.wrapping_add(byte);
        ck_b = ck_b.wrapping_add(ck_a);
    }

    (ck_a, ck_b)
}
