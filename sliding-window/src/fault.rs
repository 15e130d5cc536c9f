//! Fault injection at the transmission boundary.
//!
//! Real networks reorder and delay traffic.  To exercise the reorder buffer
//! and the retransmission timers without depending on actual network
//! conditions, a [`FaultInjector`] perturbs frames just before they reach the
//! channel:
//!
//! | Fault        | Side     | Effect                                           |
//! |--------------|----------|--------------------------------------------------|
//! | Shuffle      | sender   | Permute each batch produced by `fill_window`.    |
//! | Delayed ack  | receiver | Hold each ack for a random delay before writing. |
//!
//! Neither fault drops, duplicates, or alters a frame.  With both flags off
//! the injector is a transparent pass-through.

use std::ops::RangeInclusive;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::SessionConfig;
use crate::frame::Frame;

/// Which faults are active and how large the ack delay may get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultConfig {
    pub shuffle_on_send: bool,
    pub delay_acks: bool,
    pub ack_delay: RangeInclusive<Duration>,
    pub seed: Option<u64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        // No faults: a transparent pass-through.
        Self {
            shuffle_on_send: false,
            delay_acks: false,
            ack_delay: Duration::ZERO..=Duration::ZERO,
            seed: None,
        }
    }
}

impl From<&SessionConfig> for FaultConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shuffle_on_send: config.shuffle_on_send,
            delay_acks: config.delay_acks,
            ack_delay: config.ack_delay_range(),
            seed: config.fault_seed,
        }
    }
}

/// Seeded source of reorderings and delays for one session.
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultConfig,
    rng: StdRng,
}

impl FaultInjector {
    pub fn new(config: FaultConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { config, rng }
    }

    /// Permute the write order of one outgoing batch when shuffling is on.
    pub fn shuffle(&mut self, mut frames: Vec<Frame>) -> Vec<Frame> {
        if self.config.shuffle_on_send && frames.len() > 1 {
            frames.shuffle(&mut self.rng);
        }
        frames
    }

    /// Pair an outgoing ack with how long to hold it before writing.
    ///
    /// Each call draws independently; with delays off the hold is zero.
    pub fn delayed_ack(&mut self, ack: Frame) -> (Frame, Duration) {
        if !self.config.delay_acks {
            return (ack, Duration::ZERO);
        }
        let lo = self.config.ack_delay.start().as_micros() as u64;
        let hi = self.config.ack_delay.end().as_micros() as u64;
        let micros = if lo >= hi {
            lo
        } else {
            self.rng.random_range(lo..=hi)
        };
        (ack, Duration::from_micros(micros))
    }
}
