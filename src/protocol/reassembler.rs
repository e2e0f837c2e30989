//! # Stream Reassembler
//!
//! Turns an unbounded byte stream into complete, checksum-valid frames.
//!
//! The transport hands over arbitrary chunks; frames can straddle chunks and
//! noise can appear anywhere. The reassembler:
//! - drops everything before the next `0xB5 0x62` header
//! - discards the accumulator when no header candidate exists (a trailing `0xB5`
//!   is kept, it may be the first half of a header)
//! - waits for the length field, then for the full frame
//! - removes exactly one frame worth of bytes and validates it with the codec;
//!   invalid frames are dropped and scanning resumes at the next header

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use super::codec::decode_frame;
use super::frame::*;

/// Initial accumulator capacity (a few telemetry frames)
const INITIAL_CAPACITY: usize = 1024;

/// Reassembly diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    /// Valid frames handed out
    pub frames_emitted: u64,
    /// Frames removed from the stream that failed validation
    pub frames_dropped: u64,
    /// Noise bytes skipped while searching for a header
    pub bytes_discarded: u64,
}

/// Incremental frame reassembler
#[derive(Debug)]
pub struct StreamReassembler {
    buffer: BytesMut,
    max_payload_len: usize,
    stats: ReassemblerStats,
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamReassembler {
    /// Create a reassembler accepting any 16-bit payload length
    pub fn new() -> Self {
        Self::with_max_payload_len(MAX_PAYLOAD_LEN)
    }

    /// Create a reassembler that treats larger declared lengths as corruption
    ///
    /// Without a bound a corrupted length field can make the reassembler wait
    /// for up to 64 KiB before it notices.
    pub fn with_max_payload_len(max_payload_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            max_payload_len: max_payload_len.min(MAX_PAYLOAD_LEN),
            stats: ReassemblerStats::default(),
        }
    }

    /// Feed a chunk and collect every frame it completes
    ///
    /// # Arguments
    ///
    /// * `chunk` - Bytes as read from the transport
    ///
    /// # Returns
    ///
    /// * `Vec<Frame>` - Zero or more validated frames, in stream order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// Extract the next valid frame from the accumulator, if one is complete
    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if !self.sync_to_header() {
                return None;
            }

            if self.buffer.len() < FRAME_PREFIX_LEN {
                return None;
            }

            let payload_len = u16::from_le_bytes([self.buffer[4], self.buffer[5]]) as usize;
            if payload_len > self.max_payload_len {
                debug!("Declared payload length {} exceeds {}, resyncing", payload_len, self.max_payload_len);
                self.discard(1);
                continue;
            }

            let total_len = FRAME_OVERHEAD + payload_len;
            if self.buffer.len() < total_len {
                return None;
            }

            let raw = self.buffer.split_to(total_len);
            match decode_frame(&raw) {
                Ok(frame) => {
                    self.stats.frames_emitted += 1;
                    trace!("Reassembled frame class=0x{:02X} id=0x{:02X} len={}", frame.class, frame.id, payload_len);
                    return Some(frame);
                }
                Err(e) => {
                    self.stats.frames_dropped += 1;
                    debug!("Dropping invalid frame: {}", e);
                }
            }
        }
    }

    /// Move the accumulator start to the next header candidate
    ///
    /// Returns `false` when no candidate exists.
    fn sync_to_header(&mut self) -> bool {
        let position = self
            .buffer
            .windows(2)
            .position(|pair| pair[0] == SYNC_CHAR_1 && pair[1] == SYNC_CHAR_2);

        match position {
            Some(index) => {
                self.discard(index);
                true
            }
            None => {
                let keep = usize::from(self.buffer.last() == Some(&SYNC_CHAR_1));
                let drop = self.buffer.len() - keep;
                self.discard(drop);
                false
            }
        }
    }

    fn discard(&mut self, count: usize) {
        if count > 0 {
            self.buffer.advance(count);
            self.stats.bytes_discarded += count as u64;
        }
    }

    /// Bytes currently waiting in the accumulator
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Reassembly diagnostics
    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }

    /// Drop any partial frame, e.g. after a transport reconnect
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
