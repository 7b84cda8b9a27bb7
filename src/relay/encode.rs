use bytes::Bytes;

use crate::core::frame::Frame;

/// Serializes frames into the outbound multipart stream for one client.
/// The boundary is configured locally and is independent of whatever the
/// upstream camera uses.
pub struct MultipartEncoder {
    boundary: String,
}

impl MultipartEncoder {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
        }
    }

    pub fn content_type(&self) -> String {
        format!("multipart/x-mixed-replace; boundary={}", self.boundary)
    }

    /// Opening delimiter written once, before the first part.
    pub fn preamble(&self) -> Bytes {
        Bytes::from(format!("--{}\r\n", self.boundary))
    }

    /// One self-contained part: headers, blank line, raw JPEG bytes, and
    /// the delimiter for the part that follows.
    pub fn part(&self, frame: &Frame) -> Bytes {
        let header = format!(
            "Content-Type: image/jpeg\r\nContent-Length: {}\r\nX-Timestamp: {}\r\n\r\n",
            frame.len(),
            frame.timestamp_header()
        );
        let trailer = format!("\r\n--{}\r\n", self.boundary);

        let mut out = Vec::with_capacity(header.len() + frame.len() + trailer.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&frame.data);
        out.extend_from_slice(trailer.as_bytes());
        Bytes::from(out)
    }
}
