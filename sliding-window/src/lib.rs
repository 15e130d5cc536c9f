//! `sliding-window`: reliable, in-order message delivery with selective
//! repeat over any duplex byte stream.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐   DATA frames   ┌───────────────┐
//!  │ SenderWindow │────────────────▶│ ReorderBuffer │
//!  └──────┬───────┘                 └───────┬───────┘
//!         │        per-chunk ACKs           │
//!         │◀────────────────────────────────┘
//!         │
//!  ┌──────▼──────────────────────────────────┐
//!  │               Session                   │
//!  │ (handshake + state machine + flows)     │
//!  └──────┬──────────────────────────────────┘
//!         │ frames, optionally via FaultInjector
//!  ┌──────▼──────┐
//!  │   Channel   │  (FrameReader / FrameWriter over AsyncRead + AsyncWrite)
//!  └─────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`frame`]          : wire format (encode / decode)
//! - [`handshake`]      : parameter record and negotiation rules
//! - [`config`]         : per-session parameters and validation
//! - [`params`]         : `key:value` parameter files
//! - [`sender_window`]  : selective-repeat outbound window
//! - [`reorder_buffer`] : inbound buffering and in-order delivery
//! - [`fault`]          : send-order shuffling and ack delays
//! - [`channel`]        : frame I/O over a byte stream
//! - [`state`]          : session finite-state-machine types
//! - [`session`]        : one connection, end to end
//! - [`server`]         : multi-client TCP receiver
//! - [`client`]         : TCP sender

pub mod channel;
pub mod client;
pub mod config;
pub mod fault;
pub mod frame;
pub mod handshake;
pub mod params;
pub mod reorder_buffer;
pub mod sender_window;
pub mod server;
pub mod session;
pub mod state;

pub use config::SessionConfig;
pub use session::{Report, Session, SessionError, Transfer};
