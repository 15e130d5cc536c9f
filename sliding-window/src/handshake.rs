//! Parameter exchange performed once per connection, before any frame.
//!
//! The initiator announces the chunk size it would like to use together with
//! its window size and retransmission timeout.  The responder answers with the
//! chunk size it is willing to accept (never larger than proposed) and echoes
//! the other two values, which it adopts for its own side of the session.
//!
//! ```text
//! +------+------------------+------------------+------------------+
//! | 0x48 | chunk_size (u32) | window_size(u32) | timeout_ms (u32) |
//! +------+------------------+------------------+------------------+
//! ```

use std::time::Duration;

use crate::config::SessionConfig;
use crate::frame::MAX_PAYLOAD_LEN;

/// Byte length of the handshake record.
pub const HANDSHAKE_LEN: usize = 13;

/// Leading tag byte of every handshake record.
pub const HANDSHAKE_TAG: u8 = 0x48;

/// The fixed-format parameter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub chunk_size: u32,
    pub window_size: u32,
    pub timeout_ms: u32,
}

impl Handshake {
    /// Record announcing a validated local configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            chunk_size: config.chunk_size as u32,
            window_size: config.window_size as u32,
            timeout_ms: config.timeout_millis(),
        }
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = HANDSHAKE_TAG;
        buf[1..5].copy_from_slice(&self.chunk_size.to_be_bytes());
        buf[5..9].copy_from_slice(&self.window_size.to_be_bytes());
        buf[9..13].copy_from_slice(&self.timeout_ms.to_be_bytes());
        buf
    }

    /// Parse and sanity-check a record; every field must be positive.
    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self, HandshakeError> {
        if buf[0] != HANDSHAKE_TAG {
            return Err(HandshakeError::BadTag(buf[0]));
        }
        let field = |off: usize| {
            u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
        };
        let record = Self {
            chunk_size: field(1),
            window_size: field(5),
            timeout_ms: field(9),
        };
        record.check_positive()?;
        Ok(record)
    }

    fn check_positive(&self) -> Result<(), HandshakeError> {
        for (name, value) in [
            ("chunk_size", self.chunk_size),
            ("window_size", self.window_size),
            ("timeout_ms", self.timeout_ms),
        ] {
            if value == 0 {
                return Err(HandshakeError::NonPositive(name));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.timeout_ms))
    }
}

/// Responder side: answer a proposal and derive the session config to run.
///
/// The chunk size is capped at the responder's own `chunk_size` and at the
/// largest payload a frame can carry; window and timeout are taken from the
/// initiator.  Fault flags stay local, and an ack delay left at its default
/// follows the adopted timeout.
pub fn negotiate(proposal: &Handshake, local: &SessionConfig) -> (Handshake, SessionConfig) {
    let cap = local.chunk_size.min(MAX_PAYLOAD_LEN) as u32;
    let reply = Handshake {
        chunk_size: proposal.chunk_size.min(cap),
        window_size: proposal.window_size,
        timeout_ms: proposal.timeout_ms,
    };
    let mut agreed = local.clone();
    agreed.chunk_size = reply.chunk_size as usize;
    agreed.window_size = reply.window_size as usize;
    agreed.timeout = reply.timeout();
    (reply, agreed)
}

/// Initiator side: check the responder's answer against what was proposed.
pub fn verify_reply(
    proposal: &Handshake,
    reply: &Handshake,
    local: &SessionConfig,
) -> Result<SessionConfig, HandshakeError> {
    reply.check_positive()?;
    if reply.chunk_size > proposal.chunk_size {
        return Err(HandshakeError::ChunkSizeMismatch {
            proposed: proposal.chunk_size,
            answered: reply.chunk_size,
        });
    }
    if reply.window_size != proposal.window_size {
        return Err(HandshakeError::Mismatch("window_size"));
    }
    if reply.timeout_ms != proposal.timeout_ms {
        return Err(HandshakeError::Mismatch("timeout_ms"));
    }
    let mut agreed = local.clone();
    agreed.chunk_size = reply.chunk_size as usize;
    agreed.timeout = reply.timeout();
    Ok(agreed)
}

/// Reasons the parameter exchange fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("unexpected handshake tag 0x{0:02x}")]
    BadTag(u8),
    #[error("handshake field {0} must be positive")]
    NonPositive(&'static str),
    #[error("peer answered chunk size {answered}, larger than the {proposed} proposed")]
    ChunkSizeMismatch { proposed: u32, answered: u32 },
    #[error("peer did not echo {0}")]
    Mismatch(&'static str),
    #[error("peer closed the connection during the handshake")]
    PeerClosed,
    #[error("handshake timed out")]
    TimedOut,
}
