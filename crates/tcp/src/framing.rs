//! Length-prefixed framing: `[4-byte LE length N][N bytes payload]`.
//!
//! The accumulator keeps a rolling buffer; every chunk fed in yields all
//! complete frames and retains the remainder, so payloads survive arbitrary
//! TCP segmentation. A declared length above the configured maximum is a
//! framing error and callers close the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default upper bound on one frame's payload: 64 MiB.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("frame of {declared} bytes exceeds the {max} byte maximum")]
    InvalidFrame { declared: usize, max: usize },

    #[error("connection lost")]
    Disconnected,

    #[error("message codec failed: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Prefix a payload with its little-endian length.
pub fn frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Rolling reassembly buffer for inbound chunks.
#[derive(Debug)]
pub struct FrameAccumulator {
    buf: BytesMut,
    max_frame: usize,
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameAccumulator {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
        }
    }

    /// Absorb a chunk and extract every complete frame payload.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, TransportError> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            if self.buf.len() < LENGTH_PREFIX {
                break;
            }
            let declared = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if declared > self.max_frame {
                return Err(TransportError::InvalidFrame {
                    declared,
                    max: self.max_frame,
                });
            }
            if self.buf.len() < LENGTH_PREFIX + declared {
                break;
            }
            self.buf.advance(LENGTH_PREFIX);
            frames.push(self.buf.split_to(declared).freeze());
        }
        Ok(frames)
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
