//! Per-session parameters.
//!
//! A [`SessionConfig`] is supplied by whoever owns the session (CLI flags, a
//! parameter file, a test) and must pass [`SessionConfig::validate`] before
//! any byte is written to the channel.

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::frame::MAX_PAYLOAD_LEN;

/// Parameters for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum payload bytes per data frame, at most [`MAX_PAYLOAD_LEN`].
    ///
    /// On the accepting side this is the upper bound offered to the peer.
    pub chunk_size: usize,
    /// Maximum number of unacknowledged chunks in flight.
    pub window_size: usize,
    /// Retransmission timeout applied to every in-flight chunk.
    pub timeout: Duration,
    /// Permute each freshly filled window before writing it.
    pub shuffle_on_send: bool,
    /// Hold each outgoing ack for a random delay drawn from `ack_delay`.
    pub delay_acks: bool,
    /// Range the ack delay is drawn from when `delay_acks` is set.
    ///
    /// `None` means `0 ..= 2 × timeout` of whatever timeout the handshake
    /// settles on.
    pub ack_delay: Option<RangeInclusive<Duration>>,
    /// Seed for the fault injector; `None` seeds from the OS.
    pub fault_seed: Option<u64>,
    /// Malformed frames tolerated before the session fails.
    pub max_malformed: usize,
    /// Upper bound on the handshake exchange.
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            window_size: 4,
            timeout: Duration::from_secs(1),
            shuffle_on_send: false,
            delay_acks: false,
            ack_delay: None,
            fault_seed: None,
            max_malformed: 16,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Convenience constructor for the three negotiated values, faults off.
    pub fn new(chunk_size: usize, window_size: usize, timeout: Duration) -> Self {
        Self {
            chunk_size,
            window_size,
            timeout,
            ..Self::default()
        }
    }

    /// Reject values the protocol cannot run with.
    ///
    /// Numeric fields must also fit the `u32` fields of the handshake record,
    /// a full chunk must fit in one frame, and the timeout must be whole
    /// milliseconds so both peers run the value that went on the wire.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.window_size == 0 {
            return Err(ConfigError::ZeroWindowSize);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.chunk_size > MAX_PAYLOAD_LEN {
            return Err(ConfigError::OutOfRange("chunk_size"));
        }
        if u32::try_from(self.window_size).is_err() {
            return Err(ConfigError::OutOfRange("window_size"));
        }
        if u32::try_from(self.timeout.as_millis()).is_err() || self.timeout_millis() == 0 {
            return Err(ConfigError::OutOfRange("timeout"));
        }
        if self.timeout.subsec_nanos() % 1_000_000 != 0 {
            return Err(ConfigError::FractionalTimeout);
        }
        let delay = self.ack_delay_range();
        if self.delay_acks && delay.start() > delay.end() {
            return Err(ConfigError::EmptyAckDelay);
        }
        Ok(())
    }

    /// The explicit `ack_delay`, or `0 ..= 2 × timeout`.
    pub fn ack_delay_range(&self) -> RangeInclusive<Duration> {
        self.ack_delay
            .clone()
            .unwrap_or_else(|| Duration::ZERO..=self.timeout * 2)
    }

    /// Timeout as whole milliseconds, the unit used on the wire.
    pub fn timeout_millis(&self) -> u32 {
        u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX)
    }
}

/// Reasons a [`SessionConfig`] is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("window size must be greater than zero")]
    ZeroWindowSize,
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("{0} does not fit the handshake record or a frame")]
    OutOfRange(&'static str),
    #[error("timeout must be a whole number of milliseconds")]
    FractionalTimeout,
    #[error("ack delay range is empty")]
    EmptyAckDelay,
    #[error("message needs more than {} chunks", u32::MAX)]
    MessageTooLarge,
}
