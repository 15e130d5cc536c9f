//! Session finite-state machine types.
//!
//! Transitions are driven by [`crate::session::Session`]; this module only
//! names the states and which moves between them are legal.
//!
//! ```text
//!  HANDSHAKING ──params agreed──▶ DATA_TRANSFER ──message done──▶ COMPLETED
//!       │                               │
//!       │ bad params / channel error    │ channel closed / too many bad frames
//!       ▼                               ▼
//!     FAILED ◀──────────────────────────┘
//! ```

/// All possible states of one connection's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Exchanging and validating parameters; no data frame has been sent.
    #[default]
    Handshaking,
    /// Send and receive flows are running.
    DataTransfer,
    /// The local side finished its message(s); terminal.
    Completed,
    /// The session ended on an error; terminal.
    Failed,
}

impl SessionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Handshaking, DataTransfer)
                | (Handshaking, Failed)
                | (DataTransfer, Completed)
                | (DataTransfer, Failed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Handshaking => "handshaking",
            Self::DataTransfer => "data-transfer",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
