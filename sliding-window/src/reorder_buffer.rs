//! Receive-side reorder buffer.
//!
//! [`ReorderBuffer`] accepts data frames in any arrival order and releases
//! their payloads strictly by sequence number:
//!
//! - `seq < next_expected`: already delivered; ack again, deliver nothing.
//! - `seq == next_expected`: deliver, then drain any contiguous run that
//!   arrived early.
//! - `seq > next_expected`: park in `pending` until the gap closes, but ack
//!   right away.
//!
//! Every accepted arrival produces exactly one ack for the seq it carried.
//! Frames at or beyond `next_expected + window_size` cannot come from a peer
//! honouring its window and are dropped without an ack, as are frames past
//! the already-known last chunk.
//!
//! This module only manages state; all channel I/O is the caller's
//! responsibility.

use std::collections::BTreeMap;

/// Result of feeding one data frame to the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Delivery {
    /// Seq to acknowledge, `None` when the frame was dropped.
    pub ack: Option<u32>,
    /// Payload bytes released in order by this frame (possibly several chunks).
    pub delivered: Vec<u8>,
    /// `true` once the last chunk has been delivered.
    pub done: bool,
}

#[derive(Debug)]
struct Pending {
    payload: Vec<u8>,
    is_last: bool,
}

/// Receive-side state for one message on one connection.
#[derive(Debug)]
pub struct ReorderBuffer {
    next_expected: u32,
    pending: BTreeMap<u32, Pending>,
    window_size: usize,
    /// Seq of the chunk flagged `is_last`, once seen.
    last_seq: Option<u32>,
    done: bool,
    duplicates: u64,
    dropped: u64,
}

impl ReorderBuffer {
    pub fn new(window_size: usize) -> Self {
        Self {
            next_expected: 0,
            pending: BTreeMap::new(),
            window_size,
            last_seq: None,
            done: false,
            duplicates: 0,
            dropped: 0,
        }
    }

    /// Process one inbound data frame.
    pub fn on_data_frame(&mut self, seq: u32, payload: Vec<u8>, is_last: bool) -> Delivery {
        if seq < self.next_expected {
            self.duplicates += 1;
            return Delivery {
                ack: Some(seq),
                delivered: Vec::new(),
                done: self.done,
            };
        }

        let beyond_window = (seq - self.next_expected) as usize >= self.window_size;
        let beyond_last = self.last_seq.is_some_and(|last| seq > last);
        if beyond_window || beyond_last {
            self.dropped += 1;
            return Delivery {
                ack: None,
                delivered: Vec::new(),
                done: self.done,
            };
        }
        if is_last {
            self.last_seq = Some(seq);
        }

        if seq > self.next_expected {
            if self
                .pending
                .insert(seq, Pending { payload, is_last })
                .is_some()
            {
                self.duplicates += 1;
            }
            return Delivery {
                ack: Some(seq),
                delivered: Vec::new(),
                done: self.done,
            };
        }

        let mut delivered = payload;
        self.deliver_one(is_last);
        while let Some(next) = self.pending.remove(&self.next_expected) {
            delivered.extend_from_slice(&next.payload);
            self.deliver_one(next.is_last);
        }

        Delivery {
            ack: Some(seq),
            delivered,
            done: self.done,
        }
    }

    fn deliver_one(&mut self, is_last: bool) {
        self.next_expected += 1;
        if is_last {
            self.done = true;
        }
    }

    /// Next seq that would be delivered.
    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// Chunks received ahead of `next_expected`.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// `true` once the last chunk has been delivered in order.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Arrivals of chunks that were already delivered or already buffered.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Frames ignored as outside the window or past the last chunk.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
