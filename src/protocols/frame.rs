//! Length-prefixed framing shared by every protocol.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (LE)  | payload: len bytes        |
//! +----------------+---------------------------+
//! ```
//!
//! Requests and responses use the same framing. `len` must not exceed the
//! configured maximum payload; a larger header is a protocol violation and
//! the peer is disconnected without a response.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Default maximum payload size.
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;

/// A decoded frame borrowing its payload from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub payload: &'a [u8],
}

/// Framing errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Declared or supplied payload exceeds the configured maximum.
    #[error("frame payload too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },
    /// Output buffer cannot hold the encoded frame.
    #[error("output buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Stateless encoder/decoder for length-prefixed frames.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        debug_assert!(max_payload <= u32::MAX as usize);
        Self { max_payload }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Largest encoded frame, header included.
    pub fn max_frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.max_payload
    }

    /// Try to extract one frame from the front of `input`.
    ///
    /// Returns `Ok(None)` when more bytes are needed, or the frame together
    /// with the number of bytes it occupies. The size limit is checked as
    /// soon as the header is available.
    pub fn decode<'a>(&self, input: &'a [u8]) -> Result<Option<(Frame<'a>, usize)>, FrameError> {
        if input.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = (&input[..FRAME_HEADER_LEN]).get_u32_le() as usize;
        if len > self.max_payload {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_payload,
            });
        }

        let end = FRAME_HEADER_LEN + len;
        if input.len() < end {
            return Ok(None);
        }

        let frame = Frame {
            payload: &input[FRAME_HEADER_LEN..end],
        };
        Ok(Some((frame, end)))
    }

    /// Encode `payload` into the front of `output`, returning bytes written.
    pub fn encode(&self, payload: &[u8], output: &mut [u8]) -> Result<usize, FrameError> {
        self.check_len(payload)?;

        let needed = FRAME_HEADER_LEN + payload.len();
        if output.len() < needed {
            return Err(FrameError::BufferTooSmall {
                needed,
                available: output.len(),
            });
        }

        let mut dst = &mut output[..needed];
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(payload);
        Ok(needed)
    }

    /// Append an encoded frame to `output`.
    pub fn encode_to_vec(&self, payload: &[u8], output: &mut Vec<u8>) -> Result<(), FrameError> {
        self.check_len(payload)?;
        output.reserve(FRAME_HEADER_LEN + payload.len());
        output.put_u32_le(payload.len() as u32);
        output.put_slice(payload);
        Ok(())
    }

    fn check_len(&self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() > self.max_payload {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: self.max_payload,
            });
        }
        Ok(())
    }
}
