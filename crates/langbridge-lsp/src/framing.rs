//! `Content-Length` message framing.
//!
//! A message is a block of ASCII header lines terminated by `\r\n`, an empty
//! line, then exactly `Content-Length` bytes of body. The transport makes no
//! promise about chunking, so the decoder works on an accumulating buffer and
//! only yields complete bodies.

use crate::error::{LspError, LspResult};
use crate::protocol::Message;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "content-length";
const CONTENT_TYPE: &str = "content-type";

/// Largest body accepted from a server.
pub const MAX_CONTENT_LENGTH: usize = 64 * 1024 * 1024;

/// Codec for LSP base-protocol frames. Decodes to raw bodies.
#[derive(Debug, Default, Clone, Copy)]
pub struct LspCodec;

#[derive(Debug)]
struct Header {
    content_length: Option<usize>,
    charset_error: Option<String>,
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

fn parse_header(block: &[u8]) -> LspResult<Header> {
    let text = std::str::from_utf8(block)
        .map_err(|_| LspError::framing("header block is not ASCII"))?;

    let mut header = Header {
        content_length: None,
        charset_error: None,
    };

    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            return Err(LspError::framing(format!("malformed header line: {line:?}")));
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            CONTENT_LENGTH => {
                let length = value
                    .parse()
                    .map_err(|_| LspError::framing(format!("invalid Content-Length: {value}")))?;
                header.content_length = Some(length);
            }
            CONTENT_TYPE => {
                let charset = value
                    .split(';')
                    .filter_map(|part| part.trim().strip_prefix("charset="))
                    .next();
                if let Some(charset) = charset {
                    let charset = charset.trim_matches('"').to_ascii_lowercase();
                    if charset != "utf-8" && charset != "utf8" {
                        header.charset_error = Some(format!("unsupported charset: {charset}"));
                    }
                }
            }
            _ => {}
        }
    }

    Ok(header)
}

impl Decoder for LspCodec {
    type Item = Bytes;
    type Error = LspError;

    fn decode(&mut self, src: &mut BytesMut) -> LspResult<Option<Bytes>> {
        let Some(header_end) = find_header_end(src) else {
            return Ok(None);
        };
        let body_start = header_end + HEADER_TERMINATOR.len();

        let header = match parse_header(&src[..header_end]) {
            Ok(header) => header,
            Err(e) => {
                src.advance(body_start);
                return Err(e);
            }
        };

        let Some(length) = header.content_length else {
            src.advance(body_start);
            return Err(LspError::framing("missing Content-Length header"));
        };

        let frame_end = match body_start.checked_add(length) {
            Some(end) if length <= MAX_CONTENT_LENGTH => end,
            _ => {
                src.advance(body_start);
                return Err(LspError::framing(format!(
                    "Content-Length {length} exceeds the {MAX_CONTENT_LENGTH} byte limit"
                )));
            }
        };

        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }

        src.advance(body_start);
        let body = src.split_to(length).freeze();

        if let Some(error) = header.charset_error {
            return Err(LspError::framing(error));
        }

        Ok(Some(body))
    }
}

impl Encoder<Bytes> for LspCodec {
    type Error = LspError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> LspResult<()> {
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

/// Frame a serialized body for the wire.
pub fn frame(body: &[u8]) -> Bytes {
    let mut dst = BytesMut::new();
    // Encoding into memory cannot fail.
    let _ = LspCodec.encode(Bytes::copy_from_slice(body), &mut dst);
    dst.freeze()
}

/// Serialize a protocol value and frame it.
pub fn frame_json<T: serde::Serialize>(message: &T) -> LspResult<Bytes> {
    let body = serde_json::to_vec(message)?;
    Ok(frame(&body))
}

/// Push-style framer fed with whatever chunks the transport produces.
#[derive(Debug, Default)]
pub struct MessageFramer {
    codec: LspCodec,
    buffer: BytesMut,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every complete message now available.
    ///
    /// Framing and JSON errors are returned in place of the message they
    /// broke; decoding continues with the following frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<LspResult<Message>> {
        self.buffer.extend_from_slice(chunk);
        let mut messages = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(body)) => {
                    trace!(body = %String::from_utf8_lossy(&body), "Received LSP message");
                    messages.push(Message::from_slice(&body).map_err(|e| {
                        LspError::protocol(format!("invalid JSON-RPC message: {e}"))
                    }));
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Dropping malformed frame");
                    messages.push(Err(e));
                }
            }
        }
        messages
    }

    /// Bytes received but not yet forming a complete message.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial message (used when the connection is reset).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
