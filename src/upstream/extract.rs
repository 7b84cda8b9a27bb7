use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::frame::{Frame, MIN_FRAME_BYTES};

const BOUNDARY_MARKER: &[u8] = b"Content-Type: multipart/x-mixed-replace; boundary=";
const MAX_BUFFER_BYTES: usize = 4 * 1024 * 1024;
const READ_CHUNK_BYTES: usize = 16 * 1024;

/// Incremental multipart parser. Bytes are appended in whatever chunk sizes
/// the transport delivers; complete JPEG bodies come out in order. The
/// boundary token is either preset or learned once from the upstream
/// response headers and is immutable afterwards.
pub struct MultipartExtractor {
    buffer: Vec<u8>,
    delimiter: Option<Vec<u8>>,
}

impl MultipartExtractor {
    pub fn new(preset_boundary: Option<&str>) -> Self {
        Self {
            buffer: Vec::new(),
            delimiter: preset_boundary.map(delimiter_for),
        }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_BUFFER_BYTES {
            let overflow = self.buffer.len() - MAX_BUFFER_BYTES;
            self.buffer.drain(0..overflow);
        }
    }

    pub fn boundary(&self) -> Option<&[u8]> {
        self.delimiter.as_deref().map(|delimiter| &delimiter[2..])
    }

    fn learn_boundary(&mut self) -> bool {
        let Some(marker) = find(&self.buffer, BOUNDARY_MARKER) else {
            return false;
        };
        let value_start = marker + BOUNDARY_MARKER.len();
        let Some(value_len) = find(&self.buffer[value_start..], b"\r\n") else {
            return false;
        };
        if value_len == 0 {
            return false;
        }
        let token = &self.buffer[value_start..value_start + value_len];
        self.delimiter = Some([b"--", token].concat());
        true
    }

    /// Next complete frame body already held in the buffer, if any.
    ///
    /// A candidate at or below `MIN_FRAME_BYTES` means the terminating
    /// boundary is not fully buffered yet; nothing is consumed so the
    /// candidate stays available once more bytes arrive. On emission the
    /// buffer is drained exactly through the end of the body, leaving the
    /// next opening boundary in place.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.delimiter.is_none() && !self.learn_boundary() {
            return None;
        }
        let delimiter = self.delimiter.as_deref()?;

        let open = find(&self.buffer, delimiter)?;
        let headers_from = open + delimiter.len();
        let blank = find(&self.buffer[headers_from..], b"\r\n\r\n")?;

        let mut body_start = headers_from + blank + 4;
        while body_start < self.buffer.len() && self.buffer[body_start].is_ascii_whitespace() {
            body_start += 1;
        }

        let close = find(&self.buffer[body_start..], delimiter)?;
        let mut body_end = body_start + close;
        while body_end > body_start && self.buffer[body_end - 1].is_ascii_whitespace() {
            body_end -= 1;
        }

        if body_end - body_start <= MIN_FRAME_BYTES {
            return None;
        }

        let body = self.buffer[body_start..body_end].to_vec();
        self.buffer.drain(0..body_end);
        Some(body)
    }
}

fn delimiter_for(boundary: &str) -> Vec<u8> {
    [b"--", boundary.as_bytes()].concat()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Lazy, non-restartable frame sequence pulled from an upstream byte source.
pub struct FrameStream<R> {
    reader: R,
    extractor: MultipartExtractor,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameStream<R> {
    pub fn new(reader: R, preset_boundary: Option<&str>) -> Self {
        Self {
            reader,
            extractor: MultipartExtractor::new(preset_boundary),
            chunk: vec![0_u8; READ_CHUNK_BYTES],
        }
    }

    /// The next complete frame, or `Ok(None)` once the upstream closes the
    /// connection with no further boundary in sight.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(body) = self.extractor.next_frame() {
                return Ok(Some(Frame::capture(Bytes::from(body))));
            }

            let read = self
                .reader
                .read(&mut self.chunk)
                .await
                .context("failed to read from upstream stream")?;
            if read == 0 {
                return Ok(None);
            }
            self.extractor.extend(&self.chunk[..read]);
        }
    }
}
