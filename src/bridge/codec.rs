//! Content-Length framed JSON codec.
//!
//! Frames are an LSP-style header block followed by a JSON body:
//! `Content-Length: <N>\r\n\r\n` + exactly N bytes of UTF-8 JSON.
//! Works over any AsyncRead/AsyncWrite (pipes, duplex streams, etc).

use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

const CONTENT_LENGTH: &str = "Content-Length:";

/// Bodies past this size are rejected as corrupt rather than buffered.
const MAX_BODY_LENGTH: usize = 8 * 1024 * 1024;

/// Frame-level failure. Fatal to the stream it occurred on: the connection
/// owner is expected to tear the channel down rather than resynchronize.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("invalid Content-Length value {0:?}")]
    InvalidLength(String),

    #[error("stream ended mid-frame")]
    UnexpectedEof,

    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

enum DecodeState {
    /// Scanning lines for the Content-Length header. Anything before it is
    /// ignored (peer banners, stray output).
    Header,
    /// Length known; consuming header lines until the blank separator.
    Separator { length: usize },
    /// Blank line seen; waiting for the full body.
    Body { length: usize },
}

/// Codec that frames messages with a Content-Length header block and
/// serializes bodies with JSON.
///
/// Decoding is incremental: `decode` returns `Ok(None)` until a complete
/// frame is buffered, so partial deliveries from a pipe are handled.
pub struct RpcCodec<T> {
    state: DecodeState,
    _phantom: PhantomData<T>,
}

impl<T> Default for RpcCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RpcCodec<T> {
    pub fn new() -> Self {
        Self {
            state: DecodeState::Header,
            _phantom: PhantomData,
        }
    }
}

/// Removes one newline-terminated line from the buffer, without its
/// terminator. Accepts both `\r\n` and bare `\n`. Returns `None` when no
/// complete line is buffered yet.
fn take_line(src: &mut BytesMut) -> Option<String> {
    let newline = src.iter().position(|&b| b == b'\n')?;
    let line = src.split_to(newline + 1);
    let line = &line[..newline];
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Some(String::from_utf8_lossy(line).into_owned())
}

impl<T: DeserializeOwned> Decoder for RpcCodec<T> {
    type Item = T;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let Some(line) = take_line(src) else {
                        return Ok(None);
                    };
                    if let Some(value) = line.strip_prefix(CONTENT_LENGTH) {
                        let value = value.trim();
                        let length = value
                            .parse::<usize>()
                            .ok()
                            .filter(|&length| length <= MAX_BODY_LENGTH)
                            .ok_or_else(|| FramingError::InvalidLength(value.to_string()))?;
                        self.state = DecodeState::Separator { length };
                    }
                }
                DecodeState::Separator { length } => {
                    let Some(line) = take_line(src) else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        src.reserve(length.saturating_sub(src.len()));
                        self.state = DecodeState::Body { length };
                    }
                }
                DecodeState::Body { length } => {
                    if src.len() < length {
                        return Ok(None);
                    }
                    let body = src.split_to(length);
                    self.state = DecodeState::Header;
                    return Ok(Some(serde_json::from_slice(&body)?));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            // A clean close lands exactly on a frame boundary with nothing
            // buffered. Anything else is a truncated frame.
            None if src.is_empty() && matches!(self.state, DecodeState::Header) => Ok(None),
            None => Err(FramingError::UnexpectedEof),
        }
    }
}

impl<T: Serialize> Encoder<T> for RpcCodec<T> {
    type Error = FramingError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        tracing::trace!(body_size_bytes = body.len(), "Encoding frame");
        dst.extend_from_slice(format!("{CONTENT_LENGTH} {}\r\n\r\n", body.len()).as_bytes());
        dst.extend_from_slice(&body);
        Ok(())
    }
}
