//! `Content-Length` framing codec.
//!
//! Each frame on a stdio channel is a header block terminated by a blank
//! line, then exactly N bytes of UTF-8 JSON:
//!
//! ```text
//! Content-Length: 42\r\n
//! \r\n
//! {"jsonrpc":"2.0", ...}
//! ```
//!
//! Headers other than `Content-Length` are skipped. A zero-length frame
//! decodes to `{}` so the dispatcher can answer it with invalid-request
//! instead of stalling the stream.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TransportError;

/// Upper bound on the header block; a stream that never produces the blank
/// line is broken, not patient.
const MAX_HEADER_BYTES: usize = 4 * 1024;

/// Upper bound on a single frame payload.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Codec implementing the `Content-Length` wire format.
#[derive(Debug, Default)]
pub struct ContentLengthCodec;

impl ContentLengthCodec {
    /// Create a new codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

fn parse_content_length(header: &[u8]) -> Result<usize, TransportError> {
    let header = std::str::from_utf8(header)
        .map_err(|utf8_error| TransportError::Framing(format!("Non-UTF-8 header: {utf8_error}")))?;

    for line in header.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse::<usize>().map_err(|parse_error| {
                    TransportError::Framing(format!("Invalid Content-Length: {parse_error}"))
                });
            }
        }
    }

    Err(TransportError::Framing(
        "Missing Content-Length header".to_string(),
    ))
}

impl Decoder for ContentLengthCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        let Some(header_end) = find_terminator(src) else {
            if src.len() > MAX_HEADER_BYTES {
                return Err(TransportError::Framing(
                    "Header block exceeds maximum size".to_string(),
                ));
            }
            return Ok(None);
        };

        let content_length = parse_content_length(&src[..header_end])?;
        if content_length > MAX_FRAME_BYTES {
            return Err(TransportError::Framing(format!(
                "Frame of {content_length} bytes exceeds maximum"
            )));
        }

        let frame_start = header_end + HEADER_TERMINATOR.len();
        let frame_end = frame_start + content_length;
        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }

        src.advance(frame_start);
        let payload = src.split_to(content_length).freeze();
        if payload.is_empty() {
            return Ok(Some(Bytes::from_static(b"{}")));
        }
        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for ContentLengthCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        let header = format!("Content-Length: {}\r\n\r\n", frame.len());
        dst.reserve(header.len() + frame.len());
        dst.extend_from_slice(header.as_bytes());
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
