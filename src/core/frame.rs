use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

/// Anything at or below this length is a parsing artifact, not a JPEG.
pub const MIN_FRAME_BYTES: usize = 100;

/// One complete JPEG image as recovered from the upstream stream, stamped
/// with the wall clock at extraction time.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub data: Bytes,
    pub timestamp_us: u64,
}

impl Frame {
    pub fn capture(data: Bytes) -> Self {
        Self {
            data,
            timestamp_us: now_micros(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `seconds.microseconds` value used for the X-Timestamp part header.
    pub fn timestamp_header(&self) -> String {
        format!(
            "{}.{:06}",
            self.timestamp_us / 1_000_000,
            self.timestamp_us % 1_000_000
        )
    }
}

pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
