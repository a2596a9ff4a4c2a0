//! Framed codec for the remote debugging wire format.
//!
//! Each message is `<decimal byte length>:<JSON payload>`, where the length
//! counts payload bytes only. Works over any AsyncRead/AsyncWrite.
//!
//! A bad length prefix is skipped one byte at a time until a valid frame
//! start is found. A payload that is not valid JSON is reported as a
//! [`FramingError`] item rather than a stream error, so `FramedRead` keeps
//! going.

use std::io;

use serde_json::Value;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FramingError;

/// Longest length prefix accepted before the colon.
pub const MAX_PREFIX_LEN: usize = 20;

/// Largest payload accepted by default (256 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    fn parse_prefix(prefix: &[u8]) -> Option<usize> {
        if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
            return None;
        }
        std::str::from_utf8(prefix).ok()?.parse().ok()
    }
}

impl Decoder for FrameCodec {
    type Item = Result<Value, FramingError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut skipped = 0usize;
        loop {
            let colon = src
                .iter()
                .take(MAX_PREFIX_LEN + 1)
                .position(|b| *b == b':');

            let Some(colon) = colon else {
                if src.len() > MAX_PREFIX_LEN {
                    src.advance(1);
                    skipped += 1;
                    continue;
                }
                if skipped > 0 {
                    tracing::debug!(skipped, "Skipped bytes while looking for a frame start");
                }
                return Ok(None);
            };

            let length = match Self::parse_prefix(&src[..colon]) {
                Some(length) if length <= self.max_frame_length => length,
                _ => {
                    src.advance(1);
                    skipped += 1;
                    continue;
                }
            };

            if skipped > 0 {
                tracing::debug!(skipped, "Resynchronized frame stream");
                skipped = 0;
            }

            let frame_end = colon + 1 + length;
            if src.len() < frame_end {
                src.reserve(frame_end - src.len());
                return Ok(None);
            }

            src.advance(colon + 1);
            let payload = src.split_to(length);
            tracing::trace!(json_size_bytes = length, "Decoded frame");

            let item = serde_json::from_slice::<Value>(&payload).map_err(|e| FramingError {
                length,
                reason: e.to_string(),
            });
            if let Err(ref e) = item {
                tracing::warn!(error = %e, "Dropping malformed frame");
            }
            return Ok(Some(item));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !buf.is_empty() {
                    tracing::trace!(remaining = buf.len(), "Discarding partial frame at end of stream");
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Value> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let prefix = json.len().to_string();
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");

        dst.reserve(prefix.len() + 1 + json.len());
        dst.put_slice(prefix.as_bytes());
        dst.put_u8(b':');
        dst.put_slice(&json);
        Ok(())
    }
}
