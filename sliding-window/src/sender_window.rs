//! Selective-repeat send-side state machine.
//!
//! [`SenderWindow`] splits one message into sequenced chunks and keeps up to
//! `window_size` of them in flight.
//!
//! # Protocol contract
//!
//! - Sequence numbers start at 0 and number chunks, not bytes.
//! - At most `window_size` chunks lie between `base` and `next_seq`.
//! - ACKs are **selective**: `Ack { seq }` retires exactly that chunk.  A later
//!   chunk may be acknowledged before an earlier one; `base` only moves past
//!   a contiguous run of acknowledged chunks.
//! - Every in-flight chunk owns its own deadline and is retransmitted alone
//!   when that deadline passes.  There is no retry ceiling here.
//!
//! This module only manages state; all channel I/O is the caller's
//! responsibility.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{ConfigError, SessionConfig};
use crate::frame::Frame;

// ---------------------------------------------------------------------------
// InFlightEntry
// ---------------------------------------------------------------------------

/// A chunk that has been handed to the channel at least once.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub seq: u32,
    pub payload: Vec<u8>,
    pub is_last: bool,
    /// Retransmission deadline; cleared once acknowledged.
    pub deadline: Option<Instant>,
    pub acknowledged: bool,
}

impl InFlightEntry {
    fn to_frame(&self) -> Frame {
        Frame::Data {
            seq: self.seq,
            is_last: self.is_last,
            payload: self.payload.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// SenderWindow
// ---------------------------------------------------------------------------

/// Send-side state for one message on one connection.
///
/// # Sequence-number layout
///
/// ```text
///   base               next_seq
///     │                    │
///  ───┼────────────────────┼──────────────────▶ seq space
///     │ <── in flight ───▶ │ <── unsent ─────▶
///     (some may already be acked)
/// ```
#[derive(Debug)]
pub struct SenderWindow {
    /// Oldest chunk not yet acknowledged (left window edge).
    base: u32,
    /// Sequence number the next fresh chunk will carry.
    next_seq: u32,
    window_size: usize,
    timeout: Duration,
    /// Chunks not yet transmitted, front = `next_seq`.
    unsent: VecDeque<Vec<u8>>,
    /// Everything in `[base, next_seq)`, keyed by seq.
    in_flight: BTreeMap<u32, InFlightEntry>,
    total_chunks: u32,
    acked_chunks: u32,
    retransmissions: u64,
}

impl SenderWindow {
    /// Split `message` into chunks of at most `config.chunk_size` bytes.
    ///
    /// An empty message still produces one (empty) chunk so the peer learns
    /// where the message ends.
    pub fn start(message: &[u8], config: &SessionConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut unsent: VecDeque<Vec<u8>> = message
            .chunks(config.chunk_size)
            .map(<[u8]>::to_vec)
            .collect();
        if unsent.is_empty() {
            unsent.push_back(Vec::new());
        }
        let total_chunks = u32::try_from(unsent.len()).map_err(|_| ConfigError::MessageTooLarge)?;

        Ok(Self {
            base: 0,
            next_seq: 0,
            window_size: config.window_size,
            timeout: config.timeout,
            unsent,
            in_flight: BTreeMap::new(),
            total_chunks,
            acked_chunks: 0,
            retransmissions: 0,
        })
    }

    /// Admit as many unsent chunks as the window allows.
    ///
    /// Each admitted chunk gets a deadline of `now + timeout`.  The returned
    /// frames are in sequence order; the caller writes them (after any fault
    /// injection).
    pub fn fill_window(&mut self, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        while self.span() < self.window_size {
            let Some(payload) = self.unsent.pop_front() else {
                break;
            };
            let seq = self.next_seq;
            let entry = InFlightEntry {
                seq,
                payload,
                is_last: seq + 1 == self.total_chunks,
                deadline: Some(now + self.timeout),
                acknowledged: false,
            };
            frames.push(entry.to_frame());
            self.in_flight.insert(seq, entry);
            self.next_seq += 1;
        }
        frames
    }

    /// Apply an acknowledgment.
    ///
    /// Returns `true` if `seq` was in flight and not yet acknowledged.  Unknown
    /// or repeated acks return `false` and change nothing.
    pub fn on_ack(&mut self, seq: u32) -> bool {
        let Some(entry) = self.in_flight.get_mut(&seq) else {
            return false;
        };
        if entry.acknowledged {
            return false;
        }
        entry.acknowledged = true;
        entry.deadline = None;
        self.acked_chunks += 1;

        // Slide past the contiguous acknowledged prefix.
        while let Some(first) = self.in_flight.first_entry() {
            if !first.get().acknowledged {
                break;
            }
            first.remove();
            self.base += 1;
        }
        true
    }

    /// Re-emit every unacknowledged chunk whose deadline is at or before `now`.
    ///
    /// Retransmitted frames carry the original seq and payload; their
    /// deadlines move to `now + timeout`.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<Frame> {
        let mut frames = Vec::new();
        for entry in self.in_flight.values_mut() {
            match entry.deadline {
                Some(deadline) if deadline <= now => {
                    entry.deadline = Some(now + self.timeout);
                    frames.push(entry.to_frame());
                }
                _ => {}
            }
        }
        self.retransmissions += frames.len() as u64;
        frames
    }

    /// `true` once all chunks, the last one included, are acknowledged.
    pub fn is_complete(&self) -> bool {
        self.acked_chunks == self.total_chunks
    }

    /// Earliest pending retransmission deadline, `None` when nothing is waiting.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.in_flight.values().filter_map(|e| e.deadline).min()
    }

    /// Chunks transmitted but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.in_flight.values().filter(|e| !e.acknowledged).count()
    }

    /// `next_seq - base`: slots of the window currently occupied.
    pub fn span(&self) -> usize {
        (self.next_seq - self.base) as usize
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Number of frames re-emitted by [`check_timeouts`](Self::check_timeouts).
    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
