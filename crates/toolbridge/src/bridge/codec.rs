//! Newline-delimited JSON codec for the stdio transport.
//!
//! One JSON value per line. Works over any AsyncRead/AsyncWrite via
//! `FramedRead`/`FramedWrite`. Lines that fail to parse are surfaced as
//! [`Frame::Raw`] instead of erroring, so a chatty or buggy child cannot take
//! the connection down by printing garbage to stdout.

use std::io;

use serde::Serialize;
use serde_json::Value;
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on a single frame (8 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A single decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Json(Value),
    /// Line was not valid JSON; carried as (lossy UTF-8) text.
    Raw(String),
}

/// Parse one frame body. Never fails.
pub fn decode_frame(line: &[u8]) -> Frame {
    match serde_json::from_slice::<Value>(line) {
        Ok(value) => Frame::Json(value),
        Err(_) => Frame::Raw(String::from_utf8_lossy(line).into_owned()),
    }
}

/// Codec that splits on `\n` and parses each line as JSON.
pub struct JsonLinesCodec {
    max_frame_bytes: usize,
    /// Offset already scanned for a delimiter, so partial frames are not rescanned.
    next_index: usize,
}

impl Default for JsonLinesCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl JsonLinesCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            next_index: 0,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    fn too_large(&self, len: usize) -> CodecError {
        CodecError::FrameTooLarge {
            len,
            max: self.max_frame_bytes,
        }
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

impl Decoder for JsonLinesCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = src.len();
            let newline = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if read_to > self.max_frame_bytes {
                    return Err(self.too_large(read_to));
                }
                self.next_index = read_to;
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let raw = src.split_to(end + 1);
            let line = strip_cr(&raw[..raw.len() - 1]);

            if line.len() > self.max_frame_bytes {
                return Err(self.too_large(line.len()));
            }
            if line.trim_ascii().is_empty() {
                continue;
            }

            tracing::trace!(frame_bytes = line.len(), "Decoded frame");
            return Ok(Some(decode_frame(line)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        // Trailing frame without a delimiter at EOF.
        self.next_index = 0;
        let rest = src.split();
        let line = strip_cr(&rest);
        if line.trim_ascii().is_empty() {
            return Ok(None);
        }
        Ok(Some(decode_frame(line)))
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > self.max_frame_bytes {
            return Err(self.too_large(json.len()));
        }
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Push-style wrapper around [`JsonLinesCodec`] for callers that receive raw
/// chunks rather than an `AsyncRead`.
pub struct FrameBuffer {
    codec: JsonLinesCodec,
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            codec: JsonLinesCodec::new(max_frame_bytes),
            buf: BytesMut::new(),
        }
    }

    /// Append `bytes` and yield every complete frame now available.
    ///
    /// The trailing partial frame stays buffered for the next call. After a
    /// `FrameTooLarge` error the buffer should be discarded.
    pub fn feed<'a>(
        &'a mut self,
        bytes: &[u8],
    ) -> impl Iterator<Item = Result<Frame, CodecError>> + 'a {
        self.buf.extend_from_slice(bytes);
        let mut failed = false;
        std::iter::from_fn(move || {
            if failed {
                return None;
            }
            match self.codec.decode(&mut self.buf) {
                Ok(Some(frame)) => Some(Ok(frame)),
                Ok(None) => None,
                Err(e) => {
                    failed = true;
                    Some(Err(e))
                }
            }
        })
    }

    /// Bytes held for an incomplete frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}
