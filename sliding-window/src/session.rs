//! One connection: handshake, then selective-repeat transfer.
//!
//! # Architecture
//!
//! ```text
//!             Session::transfer (one task, four joined futures)
//!  ┌───────────────┐   Frame    ┌──────────────┐   bytes   ┌──────────┐
//!  │  send flow    │──────────▶ │              │─────────▶ │          │
//!  │ SenderWindow  │            │ write flow   │           │  write   │
//!  └──────▲────────┘            │ (sole owner  │           │  half    │
//!         │ Notify              │  of the      │           └──────────┘
//!  ┌──────┴────────┐   Ack      │  write half) │
//!  │  recv flow    │──────────▶ │              │
//!  │ ReorderBuffer │            └──────▲───────┘
//!  └──────▲───┬────┘                   │ due acks
//!         │   │ delayed acks    ┌──────┴───────┐
//!         │   └───────────────▶ │  ack pacer   │
//!         │                     └──────────────┘
//!   read half
//! ```
//!
//! [`SenderWindow`] and [`ReorderBuffer`] each sit behind one `Mutex`.  Locks
//! are never held across an `.await`.  The writer is fed through an unbounded
//! queue so the receive flow never blocks on the outbound direction.
//!
//! Nothing is shared between sessions.
//!
//! # Usage
//!
//! ```ignore
//! let mut session = Session::connect(stream, config).await?;
//! let report = session.transfer(Transfer::Send(b"hello".to_vec())).await?;
//! ```

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::channel::{ChannelError, FrameReader, FrameWriter, Inbound};
use crate::config::{ConfigError, SessionConfig};
use crate::fault::{FaultConfig, FaultInjector};
use crate::frame::{Frame, FrameError};
use crate::handshake::{self, Handshake, HandshakeError};
use crate::reorder_buffer::ReorderBuffer;
use crate::sender_window::SenderWindow;
use crate::state::SessionState;

/// After completion, keep draining the peer for this many timeouts at most.
const LINGER_TIMEOUTS: u32 = 8;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// What the local side does with the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    /// Send one message, expect nothing back.
    Send(Vec<u8>),
    /// Receive one message, send nothing.
    Receive,
    /// Send one message and receive one, concurrently.
    Exchange(Vec<u8>),
}

impl Transfer {
    fn outgoing(&self) -> Option<&[u8]> {
        match self {
            Transfer::Send(m) | Transfer::Exchange(m) => Some(m),
            Transfer::Receive => None,
        }
    }

    fn receives(&self) -> bool {
        !matches!(self, Transfer::Send(_))
    }
}

/// Counters collected over one transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames written, retransmissions and acks included.
    pub frames_sent: u64,
    pub retransmissions: u64,
    pub acks_received: u64,
    /// Acks for chunks already acknowledged or never sent.
    pub duplicate_acks: u64,
    /// Data frames for chunks already delivered or already buffered.
    pub duplicate_data: u64,
    /// Data frames ignored as outside the receive window.
    pub data_dropped: u64,
    pub malformed: u64,
}

/// Terminal result of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// The peer's message, when the transfer included receiving.
    pub delivered: Option<Vec<u8>>,
    pub stats: SessionStats,
}

/// Session-level failures; each one terminates the session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("channel closed before the transfer completed")]
    ChannelClosed,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("{count} malformed frames exceeded the tolerance (last: {last})")]
    Malformed { count: u64, last: FrameError },
    #[error("session is {0}; transfer needs data-transfer")]
    BadState(SessionState),
}

impl SessionError {
    /// `true` when the underlying transport ended, cleanly or not.
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Self::ChannelClosed | Self::Channel(_))
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One connection and its lifecycle.
///
/// [`Session::connect`] (initiator) and [`Session::accept`] (responder) return
/// a session that has completed its handshake.  [`Session::new`] plus
/// [`Session::initiate`] or [`Session::respond`] does the same in two steps
/// and leaves the session inspectable if the handshake fails.
#[derive(Debug)]
pub struct Session<S> {
    stream: S,
    /// Local parameters until the handshake, negotiated ones after it.
    config: SessionConfig,
    state: SessionState,
    /// Prefix for log lines, e.g. the peer address.
    label: String,
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Initiator,
    Responder,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // -----------------------------------------------------------------------
    // Constructors
    // -----------------------------------------------------------------------

    /// Wrap `stream` in the `Handshaking` state; nothing is written yet.
    pub fn new(stream: S, config: SessionConfig) -> Self {
        Self {
            stream,
            config,
            state: SessionState::Handshaking,
            label: "session".to_owned(),
        }
    }

    /// Validate `config`, announce it, and check the peer's answer.
    ///
    /// Fails with [`SessionError::InvalidConfig`] before any byte is written
    /// if the configuration is unusable.
    pub async fn connect(stream: S, config: SessionConfig) -> Result<Self, SessionError> {
        let mut session = Self::new(stream, config);
        session.initiate().await?;
        Ok(session)
    }

    /// Wait for the peer's proposal and answer it.
    ///
    /// `config.chunk_size` is the largest chunk this side accepts.
    pub async fn accept(stream: S, config: SessionConfig) -> Result<Self, SessionError> {
        let mut session = Self::new(stream, config);
        session.respond().await?;
        Ok(session)
    }

    /// Run the initiator side of the handshake.
    pub async fn initiate(&mut self) -> Result<(), SessionError> {
        self.handshake(Role::Initiator).await
    }

    /// Run the responder side of the handshake.
    pub async fn respond(&mut self) -> Result<(), SessionError> {
        self.handshake(Role::Responder).await
    }

    /// Replace the log prefix.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Parameters agreed during the handshake.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    async fn handshake(&mut self, role: Role) -> Result<(), SessionError> {
        if !self.state.can_transition_to(SessionState::DataTransfer) {
            return Err(SessionError::BadState(self.state));
        }
        let result = self.exchange_params(role).await;
        match result {
            Ok(agreed) => {
                log::debug!(
                    "[{}] handshake done ({role:?}): chunk={} window={} timeout={:?}",
                    self.label,
                    agreed.chunk_size,
                    agreed.window_size,
                    agreed.timeout
                );
                self.config = agreed;
                self.enter(SessionState::DataTransfer);
                Ok(())
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn exchange_params(&mut self, role: Role) -> Result<SessionConfig, SessionError> {
        self.config.validate()?;
        let limit = self.config.handshake_timeout;
        let stream = &mut self.stream;
        let config = &self.config;
        let agreed = match role {
            Role::Initiator => tokio::time::timeout(limit, initiate(stream, config)).await,
            Role::Responder => tokio::time::timeout(limit, respond(stream, config)).await,
        };
        agreed.map_err(|_| HandshakeError::TimedOut)?
    }

    fn enter(&mut self, next: SessionState) {
        debug_assert!(self.state.can_transition_to(next));
        log::debug!("[{}] {} -> {next}", self.label, self.state);
        self.state = next;
    }

    /// Enter `Failed` and half-close the stream so the peer reads EOF.
    async fn fail(&mut self, e: &SessionError) {
        log::warn!("[{}] {} failed: {e}", self.label, self.state);
        self.enter(SessionState::Failed);
        if let Err(e) = self.stream.shutdown().await {
            log::debug!("[{}] shutdown after failure: {e}", self.label);
        }
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Run the transfer to completion or failure.
    ///
    /// On success every queued frame (delayed acks included) has been written
    /// and the write half is shut down.  On failure the stream is shut down
    /// too.  Either way the session ends in a terminal state and cannot be
    /// reused.
    pub async fn transfer(&mut self, transfer: Transfer) -> Result<Report, SessionError> {
        if !self.state.can_transition_to(SessionState::Completed) {
            return Err(SessionError::BadState(self.state));
        }
        let result = self.run(transfer).await;
        match result {
            Ok(report) => {
                log::info!(
                    "[{}] transfer completed: {} frame(s) sent, {} retransmission(s)",
                    self.label,
                    report.stats.frames_sent,
                    report.stats.retransmissions
                );
                self.enter(SessionState::Completed);
                Ok(report)
            }
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn run(&mut self, transfer: Transfer) -> Result<Report, SessionError> {
        let config = self.config.clone();
        let label = self.label.as_str();

        let sender = match transfer.outgoing() {
            Some(message) => Some(Mutex::new(SenderWindow::start(message, &config)?)),
            None => None,
        };
        let receiver = transfer
            .receives()
            .then(|| Mutex::new(ReorderBuffer::new(config.window_size)));
        let injector = Mutex::new(FaultInjector::new(FaultConfig::from(&config)));
        let acked = Notify::new();

        let (read_half, write_half) = tokio::io::split(&mut self.stream);
        let mut reader = FrameReader::new(read_half);
        let writer = FrameWriter::new(write_half);

        // The writer stops once all three producers have dropped their sender.
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Frame>();
        let send_out = out_tx.clone();
        let recv_out = out_tx.clone();
        let (held_tx, held_rx) = mpsc::unbounded_channel::<(Instant, u32)>();

        let flows = Flows {
            sender: sender.as_ref(),
            receiver: receiver.as_ref(),
            injector: &injector,
            acked: &acked,
            config: &config,
            label,
        };

        let (frames_sent, (), inbound, ()) = tokio::try_join!(
            write_flow(writer, out_rx, label),
            flows.send(send_out),
            flows.receive(&mut reader, recv_out, held_tx),
            pace_acks(held_rx, out_tx),
        )?;

        linger(&mut reader, config.timeout * LINGER_TIMEOUTS, label).await;

        let mut stats = SessionStats {
            frames_sent,
            acks_received: inbound.acks_received,
            duplicate_acks: inbound.duplicate_acks,
            malformed: inbound.malformed,
            ..SessionStats::default()
        };
        if let Some(window) = sender {
            stats.retransmissions = into_inner(window).retransmissions();
        }
        if let Some(buffer) = receiver {
            let buffer = into_inner(buffer);
            stats.duplicate_data = buffer.duplicates();
            stats.data_dropped = buffer.dropped();
        }

        Ok(Report {
            delivered: transfer.receives().then_some(inbound.message),
            stats,
        })
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

async fn initiate<S>(stream: &mut S, config: &SessionConfig) -> Result<SessionConfig, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let proposal = Handshake::from_config(config);
    FrameWriter::new(&mut *stream)
        .write_handshake(&proposal)
        .await?;
    log::debug!("[session] → HELLO {proposal:?}");

    let raw = FrameReader::new(&mut *stream)
        .read_handshake()
        .await
        .map_err(handshake_read_error)?;
    let reply = Handshake::decode(&raw)?;
    log::debug!("[session] ← HELLO {reply:?}");
    Ok(handshake::verify_reply(&proposal, &reply, config)?)
}

async fn respond<S>(stream: &mut S, config: &SessionConfig) -> Result<SessionConfig, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let raw = FrameReader::new(&mut *stream)
        .read_handshake()
        .await
        .map_err(handshake_read_error)?;
    let proposal = Handshake::decode(&raw)?;
    log::debug!("[session] ← HELLO {proposal:?}");

    let (reply, agreed) = handshake::negotiate(&proposal, config);
    FrameWriter::new(&mut *stream).write_handshake(&reply).await?;
    log::debug!("[session] → HELLO {reply:?}");
    Ok(agreed)
}

fn handshake_read_error(e: ChannelError) -> SessionError {
    match e {
        ChannelError::Truncated => HandshakeError::PeerClosed.into(),
        other => other.into(),
    }
}

// ---------------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------------

/// What the receive flow hands back when the local side is done.
#[derive(Debug, Default)]
struct InboundSummary {
    message: Vec<u8>,
    acks_received: u64,
    duplicate_acks: u64,
    malformed: u64,
}

/// Borrowed per-session state shared by the send and receive flows.
struct Flows<'a> {
    sender: Option<&'a Mutex<SenderWindow>>,
    receiver: Option<&'a Mutex<ReorderBuffer>>,
    injector: &'a Mutex<FaultInjector>,
    acked: &'a Notify,
    config: &'a SessionConfig,
    label: &'a str,
}

impl Flows<'_> {
    fn local_done(&self) -> bool {
        self.sender.map_or(true, |w| lock(w).is_complete())
            && self.receiver.map_or(true, |r| lock(r).is_done())
    }

    /// Fill the window, retransmit expired chunks, sleep until the next
    /// deadline or ack.  Returns once every chunk is acknowledged.
    async fn send(&self, out: mpsc::UnboundedSender<Frame>) -> Result<(), SessionError> {
        let Some(sender) = self.sender else {
            return Ok(());
        };

        loop {
            let now = Instant::now();
            let (resend, fresh, complete, next_deadline) = {
                let mut window = lock(sender);
                let resend = window.check_timeouts(now);
                let fresh = window.fill_window(now);
                (resend, fresh, window.is_complete(), window.next_deadline())
            };
            if complete {
                return Ok(());
            }

            if !resend.is_empty() {
                log::debug!(
                    "[{}] timeout, retransmitting {} chunk(s)",
                    self.label,
                    resend.len()
                );
            }
            let fresh = lock(self.injector).shuffle(fresh);
            for frame in resend.into_iter().chain(fresh) {
                if let Frame::Data {
                    seq,
                    is_last,
                    payload,
                } = &frame
                {
                    log::debug!(
                        "[{}] → DATA seq={seq} len={} last={is_last}",
                        self.label,
                        payload.len()
                    );
                }
                out.send(frame).map_err(|_| SessionError::ChannelClosed)?;
            }

            let tick = now + self.config.timeout;
            let wake_at = next_deadline.map_or(tick, |d| d.min(tick));
            tokio::select! {
                _ = self.acked.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Read and dispatch frames until the local side is done.
    async fn receive<R>(
        &self,
        reader: &mut FrameReader<R>,
        out: mpsc::UnboundedSender<Frame>,
        held: mpsc::UnboundedSender<(Instant, u32)>,
    ) -> Result<InboundSummary, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut summary = InboundSummary::default();

        while !self.local_done() {
            let frame = match reader.next_frame().await? {
                Some(Inbound::Frame(frame)) => frame,
                Some(Inbound::Malformed(e)) => {
                    self.malformed(&mut summary, e)?;
                    continue;
                }
                None => return Err(SessionError::ChannelClosed),
            };

            match frame {
                Frame::Ack { seq } => {
                    let Some(sender) = self.sender else {
                        log::debug!("[{}] ← ACK seq={seq} ignored, nothing sent", self.label);
                        continue;
                    };
                    summary.acks_received += 1;
                    let fresh = lock(sender).on_ack(seq);
                    log::debug!("[{}] ← ACK seq={seq} new={fresh}", self.label);
                    if fresh {
                        self.acked.notify_one();
                    } else {
                        summary.duplicate_acks += 1;
                    }
                }
                Frame::Data {
                    seq,
                    is_last,
                    payload,
                } => {
                    let Some(receiver) = self.receiver else {
                        log::debug!("[{}] ← DATA seq={seq} ignored, not receiving", self.label);
                        continue;
                    };
                    if payload.len() > self.config.chunk_size {
                        self.malformed(
                            &mut summary,
                            FrameError::LengthMismatch {
                                declared: self.config.chunk_size,
                                actual: payload.len(),
                            },
                        )?;
                        continue;
                    }

                    let len = payload.len();
                    let delivery = lock(receiver).on_data_frame(seq, payload, is_last);
                    summary.message.extend_from_slice(&delivery.delivered);
                    log::debug!(
                        "[{}] ← DATA seq={seq} len={len} delivered={} done={}",
                        self.label,
                        delivery.delivered.len(),
                        delivery.done
                    );

                    let Some(ack_seq) = delivery.ack else {
                        log::warn!("[{}] DATA seq={seq} outside the window, dropped", self.label);
                        continue;
                    };
                    let (ack, hold) = lock(self.injector).delayed_ack(Frame::Ack { seq: ack_seq });
                    if hold.is_zero() {
                        log::debug!("[{}] → ACK seq={ack_seq}", self.label);
                        out.send(ack).map_err(|_| SessionError::ChannelClosed)?;
                    } else {
                        log::debug!("[{}] → ACK seq={ack_seq} held {hold:?}", self.label);
                        held.send((Instant::now() + hold, ack.seq()))
                            .map_err(|_| SessionError::ChannelClosed)?;
                    }
                }
            }
        }
        Ok(summary)
    }

    fn malformed(&self, summary: &mut InboundSummary, e: FrameError) -> Result<(), SessionError> {
        summary.malformed += 1;
        log::warn!("[{}] dropping malformed frame: {e}", self.label);
        if summary.malformed > self.config.max_malformed as u64 {
            return Err(SessionError::Malformed {
                count: summary.malformed,
                last: e,
            });
        }
        Ok(())
    }
}

/// Sole owner of the write half.  Ends once every queue feeding it is closed,
/// then half-closes the stream.
async fn write_flow<W>(
    mut writer: FrameWriter<WriteHalf<W>>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    label: &str,
) -> Result<u64, SessionError>
where
    W: AsyncWrite,
{
    let mut sent = 0u64;
    while let Some(frame) = frames.recv().await {
        writer.send(&frame).await?;
        sent += 1;
    }
    if let Err(e) = writer.shutdown().await {
        log::debug!("[{label}] shutdown after final write failed: {e}");
    }
    Ok(sent)
}

/// Hold delayed acks until they are due, then pass them to the writer.
async fn pace_acks(
    mut incoming: mpsc::UnboundedReceiver<(Instant, u32)>,
    out: mpsc::UnboundedSender<Frame>,
) -> Result<(), SessionError> {
    let mut held: BinaryHeap<Reverse<(Instant, u32)>> = BinaryHeap::new();
    let mut open = true;

    loop {
        let next_due = held.peek().map(|Reverse((at, _))| *at);
        if !open && next_due.is_none() {
            return Ok(());
        }
        tokio::select! {
            item = incoming.recv(), if open => match item {
                Some(entry) => held.push(Reverse(entry)),
                None => open = false,
            },
            _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let now = Instant::now();
                while let Some(&Reverse((at, seq))) = held.peek() {
                    if at > now {
                        break;
                    }
                    held.pop();
                    out.send(Frame::Ack { seq }).map_err(|_| SessionError::ChannelClosed)?;
                }
            }
        }
    }
}

/// Drain the peer until it closes or `limit` passes.
///
/// Closing with unread bytes can make the transport reset the connection and
/// discard acks the peer has not read yet.
async fn linger<R>(reader: &mut FrameReader<ReadHalf<R>>, limit: Duration, label: &str)
where
    R: AsyncRead,
{
    let drain = async {
        loop {
            match reader.next_frame().await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => return,
            }
        }
    };
    if tokio::time::timeout(limit, drain).await.is_err() {
        log::debug!("[{label}] peer still open after {limit:?}; closing");
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn into_inner<T>(m: Mutex<T>) -> T {
    m.into_inner().unwrap_or_else(PoisonError::into_inner)
}
