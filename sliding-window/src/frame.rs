//! Wire-format definitions for protocol frames.
//!
//! Every unit exchanged between peers after the handshake is a [`Frame`].
//! This module is responsible for:
//! - Defining the on-wire binary layout of the two frame kinds.
//! - Serialising a [`Frame`] into a byte buffer ready for the channel.
//! - Deserialising a raw byte slice back into a [`Frame`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.  Every frame starts with a
//! length prefix counting the bytes that follow it, so a stream reader can
//! always find the next frame boundary.
//!
//! ```text
//!  Ack (len = 5)
//! +---------------+------+---------------+
//! |   len (u32)   | 0x02 |   seq (u32)   |
//! +---------------+------+---------------+
//!
//!  Data (len = 10 + payload_len)
//! +---------------+------+---------------+------+---------------+---------+
//! |   len (u32)   | 0x01 |   seq (u32)   | last | payload_len   | payload |
//! +---------------+------+---------------+------+---------------+---------+
//! ```

/// Byte length of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Largest `len` value a reader will buffer.  Anything bigger is skipped.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest payload a data frame can carry and still fit in [`MAX_FRAME_LEN`].
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - DATA_HEADER_LEN;

/// Discriminator byte values.
pub mod kind {
    pub const DATA: u8 = 0x01;
    pub const ACK: u8 = 0x02;
}

/// Body length of an ack (kind + seq).
const ACK_BODY_LEN: usize = 5;
/// Body length of a data frame without its payload (kind + seq + last + payload_len).
const DATA_HEADER_LEN: usize = 10;

// Byte offsets within the body (after the length prefix).
const OFF_KIND: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_LAST: usize = 5;
const OFF_PAYLOAD_LEN: usize = 6;

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One chunk of the message.
    Data {
        seq: u32,
        /// Set on the final chunk of the message.
        is_last: bool,
        payload: Vec<u8>,
    },
    /// Acknowledges receipt of the data frame carrying `seq`.
    Ack { seq: u32 },
}

impl Frame {
    /// Sequence number carried by either kind.
    pub fn seq(&self) -> u32 {
        match self {
            Frame::Data { seq, .. } | Frame::Ack { seq } => *seq,
        }
    }

    /// Serialise this frame, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Ack { seq } => {
                let mut buf = Vec::with_capacity(LEN_PREFIX + ACK_BODY_LEN);
                buf.extend_from_slice(&(ACK_BODY_LEN as u32).to_be_bytes());
                buf.push(kind::ACK);
                buf.extend_from_slice(&seq.to_be_bytes());
                buf
            }
            Frame::Data {
                seq,
                is_last,
                payload,
            } => {
                let body_len = DATA_HEADER_LEN + payload.len();
                let mut buf = Vec::with_capacity(LEN_PREFIX + body_len);
                buf.extend_from_slice(&(body_len as u32).to_be_bytes());
                buf.push(kind::DATA);
                buf.extend_from_slice(&seq.to_be_bytes());
                buf.push(u8::from(*is_last));
                buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Parse a complete frame (length prefix included) from `buf`.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than the length prefix,
    /// - the prefix disagrees with `buf.len()`,
    /// - the kind byte is unknown,
    /// - the body is too short for its kind or `payload_len` disagrees with it, or
    /// - the `last` byte is neither 0 nor 1.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < LEN_PREFIX {
            return Err(FrameError::BufferTooShort);
        }
        let declared = read_u32(buf, 0) as usize;
        let body = &buf[LEN_PREFIX..];
        if declared != body.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
        Self::decode_body(body)
    }

    /// Parse a frame body (everything after the length prefix).
    pub fn decode_body(body: &[u8]) -> Result<Self, FrameError> {
        let Some(&tag) = body.get(OFF_KIND) else {
            return Err(FrameError::BufferTooShort);
        };
        match tag {
            kind::ACK => {
                if body.len() != ACK_BODY_LEN {
                    return Err(FrameError::LengthMismatch {
                        declared: ACK_BODY_LEN,
                        actual: body.len(),
                    });
                }
                Ok(Frame::Ack {
                    seq: read_u32(body, OFF_SEQ),
                })
            }
            kind::DATA => {
                if body.len() < DATA_HEADER_LEN {
                    return Err(FrameError::BufferTooShort);
                }
                let is_last = match body[OFF_LAST] {
                    0 => false,
                    1 => true,
                    other => return Err(FrameError::InvalidLastFlag(other)),
                };
                let payload_len = read_u32(body, OFF_PAYLOAD_LEN) as usize;
                let payload = &body[DATA_HEADER_LEN..];
                if payload.len() != payload_len {
                    return Err(FrameError::LengthMismatch {
                        declared: payload_len,
                        actual: payload.len(),
                    });
                }
                Ok(Frame::Data {
                    seq: read_u32(body, OFF_SEQ),
                    is_last,
                    payload: payload.to_vec(),
                })
            }
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Errors that can arise when parsing a raw frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short to contain a frame header")]
    BufferTooShort,
    #[error("declared length {declared} does not match {actual} remaining bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),
    #[error("invalid last-chunk flag {0}")]
    InvalidLastFlag(u8),
    #[error("frame of {0} bytes exceeds the maximum frame length")]
    Oversized(usize),
}
