//! Integration tests for whole sessions.
//!
//! Both endpoints run in the test task over an in-memory `tokio::io::duplex`
//! pair, so no sockets are involved.  Most tests pause the tokio clock: timers
//! only fire once both sides are idle, which makes retransmission counts
//! deterministic.

use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

use sliding_window::channel::{FrameReader, Inbound};
use sliding_window::config::{ConfigError, SessionConfig};
use sliding_window::frame::{Frame, MAX_PAYLOAD_LEN};
use sliding_window::handshake::{Handshake, HandshakeError, HANDSHAKE_LEN};
use sliding_window::session::{Report, Session, SessionError, Transfer};
use sliding_window::state::SessionState;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const BUF: usize = 64 * 1024;

fn cfg(chunk: usize, window: usize, timeout_ms: u64) -> SessionConfig {
    SessionConfig::new(chunk, window, Duration::from_millis(timeout_ms))
}

/// Handshake both ends of a fresh duplex pair.
async fn pair(
    initiator: SessionConfig,
    responder: SessionConfig,
) -> (Session<DuplexStream>, Session<DuplexStream>) {
    let (a, b) = duplex(BUF);
    tokio::try_join!(Session::connect(a, initiator), Session::accept(b, responder))
        .expect("handshake")
}

/// Send `message` from the initiator to the responder; returns both reports.
async fn deliver(
    message: &[u8],
    initiator: SessionConfig,
    responder: SessionConfig,
) -> (Report, Report) {
    let (mut client, mut server) = pair(initiator, responder).await;
    let (sent, received) = tokio::join!(
        client.transfer(Transfer::Send(message.to_vec())),
        server.transfer(Transfer::Receive),
    );
    assert_eq!(client.state(), SessionState::Completed);
    assert_eq!(server.state(), SessionState::Completed);
    (sent.expect("sender"), received.expect("receiver"))
}

fn text(n: usize) -> Vec<u8> {
    (0..n).map(|i| b'a' + (i % 26) as u8).collect()
}

fn data(seq: u32, is_last: bool, payload: &[u8]) -> Frame {
    Frame::Data {
        seq,
        is_last,
        payload: payload.to_vec(),
    }
}

/// Play the initiator by hand.
async fn raw_propose(stream: &mut DuplexStream, proposal: Handshake) {
    stream.write_all(&proposal.encode()).await.unwrap();
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn round_trip_reproduces_message() {
    let message = text(1000);
    let (sent, received) = deliver(&message, cfg(7, 3, 200), cfg(1024, 4, 1000)).await;

    assert_eq!(received.delivered.as_deref(), Some(&message[..]));
    assert_eq!(sent.delivered, None);
    assert_eq!(sent.stats.retransmissions, 0);
    // 143 chunks of at most 7 bytes, each acknowledged once.
    assert_eq!(sent.stats.frames_sent, 143);
    assert_eq!(sent.stats.acks_received, 143);
    assert_eq!(received.stats.frames_sent, 143);
}

#[tokio::test(start_paused = true)]
async fn empty_message_completes() {
    let (sent, received) = deliver(b"", cfg(4, 2, 100), cfg(4, 2, 100)).await;
    assert_eq!(received.delivered, Some(Vec::new()));
    assert_eq!(sent.stats.frames_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn helloworld_in_four_chunks() {
    let (sent, received) = deliver(b"HELLOWORLD!", cfg(3, 2, 50), cfg(3, 2, 50)).await;
    assert_eq!(received.delivered.as_deref(), Some(&b"HELLOWORLD!"[..]));
    assert_eq!(sent.stats.frames_sent, 4);
    assert_eq!(sent.stats.acks_received, 4);
    assert_eq!(sent.stats.duplicate_acks, 0);
    assert_eq!(received.stats.duplicate_data, 0);
}

#[tokio::test(start_paused = true)]
async fn message_of_exact_chunk_multiple() {
    let message = text(12);
    let (sent, received) = deliver(&message, cfg(4, 2, 100), cfg(4, 2, 100)).await;
    assert_eq!(received.delivered, Some(message));
    assert_eq!(sent.stats.frames_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn shuffled_send_order_still_delivers_in_order() {
    let message = text(500);
    let mut client = cfg(3, 8, 200);
    client.shuffle_on_send = true;
    client.fault_seed = Some(7);

    let (_, received) = deliver(&message, client, cfg(1024, 4, 200)).await;
    assert_eq!(received.delivered, Some(message));
}

#[tokio::test(start_paused = true)]
async fn delayed_acks_force_retransmission() {
    let timeout = Duration::from_millis(50);
    let mut server = cfg(3, 2, 50);
    server.delay_acks = true;
    server.ack_delay = Some(timeout * 3..=timeout * 3);
    server.fault_seed = Some(1);

    let (sent, received) = deliver(b"HELLOWORLD!", cfg(3, 2, 50), server).await;
    assert!(sent.stats.retransmissions >= 1, "{:?}", sent.stats);
    assert_eq!(received.delivered.as_deref(), Some(&b"HELLOWORLD!"[..]));
}

#[tokio::test(start_paused = true)]
async fn random_ack_delays_with_shuffle() {
    let message = text(300);
    let mut client = cfg(5, 4, 40);
    client.shuffle_on_send = true;
    client.fault_seed = Some(11);
    let mut server = cfg(1024, 4, 40);
    server.delay_acks = true;
    server.fault_seed = Some(12);

    let (_, received) = deliver(&message, client, server).await;
    assert_eq!(received.delivered, Some(message));
}

#[tokio::test(start_paused = true)]
async fn exchange_runs_both_directions() {
    let (mut left, mut right) = pair(cfg(4, 3, 100), cfg(4, 3, 100)).await;
    let (l, r) = tokio::join!(
        left.transfer(Transfer::Exchange(b"ping from the left".to_vec())),
        right.transfer(Transfer::Exchange(b"pong from the right side".to_vec())),
    );
    let (l, r) = (l.unwrap(), r.unwrap());
    assert_eq!(l.delivered.as_deref(), Some(&b"pong from the right side"[..]));
    assert_eq!(r.delivered.as_deref(), Some(&b"ping from the left"[..]));
}

#[tokio::test(start_paused = true)]
async fn session_cannot_be_reused() {
    let (mut client, mut server) = pair(cfg(4, 2, 100), cfg(4, 2, 100)).await;
    let (a, b) = tokio::join!(
        client.transfer(Transfer::Send(b"once".to_vec())),
        server.transfer(Transfer::Receive),
    );
    a.unwrap();
    b.unwrap();

    let err = client
        .transfer(Transfer::Send(b"twice".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::BadState(SessionState::Completed)));
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn responder_caps_chunk_size_and_adopts_window() {
    let (client, server) = pair(cfg(64, 5, 300), cfg(8, 2, 1000)).await;
    assert_eq!(client.config().chunk_size, 8);
    assert_eq!(server.config().chunk_size, 8);
    assert_eq!(server.config().window_size, 5);
    assert_eq!(server.config().timeout, Duration::from_millis(300));
    assert_eq!(client.state(), SessionState::DataTransfer);
}

#[tokio::test]
async fn zero_window_fails_before_any_byte() {
    let (a, mut b) = duplex(BUF);
    let err = Session::connect(a, cfg(3, 0, 50)).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::InvalidConfig(ConfigError::ZeroWindowSize)
    ));

    let mut seen = Vec::new();
    b.read_to_end(&mut seen).await.unwrap();
    assert!(seen.is_empty(), "wrote {seen:?}");
}

#[tokio::test]
async fn larger_answered_chunk_is_rejected() {
    let (a, mut b) = duplex(BUF);
    let peer = async move {
        let mut proposal = [0u8; HANDSHAKE_LEN];
        b.read_exact(&mut proposal).await.unwrap();
        let mut reply = Handshake::decode(&proposal).unwrap();
        reply.chunk_size += 1;
        b.write_all(&reply.encode()).await.unwrap();
        b
    };
    let (result, _b) = tokio::join!(Session::connect(a, cfg(16, 2, 100)), peer);
    let err = result.unwrap_err();
    assert!(
        matches!(
            err,
            SessionError::Handshake(HandshakeError::ChunkSizeMismatch {
                proposed: 16,
                answered: 17
            })
        ),
        "{err}"
    );
}

#[tokio::test]
async fn changed_window_is_rejected() {
    let (a, mut b) = duplex(BUF);
    let peer = async move {
        let mut proposal = [0u8; HANDSHAKE_LEN];
        b.read_exact(&mut proposal).await.unwrap();
        let mut reply = Handshake::decode(&proposal).unwrap();
        reply.window_size = 9;
        b.write_all(&reply.encode()).await.unwrap();
        b
    };
    let (result, _b) = tokio::join!(Session::connect(a, cfg(16, 2, 100)), peer);
    assert!(matches!(
        result.unwrap_err(),
        SessionError::Handshake(HandshakeError::Mismatch("window_size"))
    ));
}

#[tokio::test]
async fn bad_tag_is_rejected() {
    let (a, mut b) = duplex(BUF);
    b.write_all(&[0u8; HANDSHAKE_LEN]).await.unwrap();
    let err = Session::accept(a, cfg(16, 2, 100)).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Handshake(HandshakeError::BadTag(0))
    ));
}

#[tokio::test]
async fn zero_window_proposal_is_rejected() {
    let (a, mut b) = duplex(BUF);
    raw_propose(
        &mut b,
        Handshake {
            chunk_size: 4,
            window_size: 0,
            timeout_ms: 100,
        },
    )
    .await;
    let err = Session::accept(a, cfg(16, 2, 100)).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Handshake(HandshakeError::NonPositive("window_size"))
    ));
}

#[tokio::test]
async fn peer_closing_during_handshake() {
    let (a, b) = duplex(BUF);
    drop(b);
    let err = Session::accept(a, cfg(16, 2, 100)).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Handshake(HandshakeError::PeerClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out() {
    let (a, _b) = duplex(BUF);
    let mut config = cfg(16, 2, 100);
    config.handshake_timeout = Duration::from_millis(250);
    let err = Session::accept(a, config).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Handshake(HandshakeError::TimedOut)
    ));
}

// ---------------------------------------------------------------------------
// Channel failures and bad frames
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn peer_dropping_mid_transfer_fails_session() {
    let (a, mut b) = duplex(BUF);
    let peer = tokio::spawn(async move {
        let mut proposal = [0u8; HANDSHAKE_LEN];
        b.read_exact(&mut proposal).await.unwrap();
        b.write_all(&proposal).await.unwrap();
        // Read part of the first frame, then vanish.
        let mut some = [0u8; 8];
        b.read_exact(&mut some).await.unwrap();
    });

    let mut client = Session::connect(a, cfg(4, 2, 100)).await.unwrap();
    let err = client
        .transfer(Transfer::Send(text(64)))
        .await
        .unwrap_err();
    assert!(err.is_channel_closed(), "{err}");
    assert_eq!(client.state(), SessionState::Failed);
    peer.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_tolerated_up_to_limit() {
    let (a, mut b) = duplex(BUF);
    raw_propose(&mut b, Handshake::from_config(&cfg(4, 4, 100))).await;
    let mut server = Session::accept(a, cfg(4, 4, 100)).await.unwrap();

    let mut reply = [0u8; HANDSHAKE_LEN];
    b.read_exact(&mut reply).await.unwrap();

    // Unknown kind byte, then the real message with one duplicate.
    b.write_all(&[0, 0, 0, 2, 0x09, 0x00]).await.unwrap();
    let frames = [
        data(1, true, b"ld"),
        data(0, false, b"wor"),
        data(1, true, b"ld"),
    ];
    for frame in &frames {
        b.write_all(&frame.encode()).await.unwrap();
    }

    let report = server.transfer(Transfer::Receive).await.unwrap();
    assert_eq!(report.delivered.as_deref(), Some(&b"world"[..]));
    assert_eq!(report.stats.malformed, 1);
    drop(b);
}

#[tokio::test(start_paused = true)]
async fn too_many_malformed_frames_fail_session() {
    let (a, mut b) = duplex(BUF);
    raw_propose(&mut b, Handshake::from_config(&cfg(4, 4, 100))).await;
    let mut config = cfg(4, 4, 100);
    config.max_malformed = 2;
    let mut server = Session::accept(a, config).await.unwrap();

    for _ in 0..3 {
        b.write_all(&[0, 0, 0, 2, 0x09, 0x00]).await.unwrap();
    }

    let err = server.transfer(Transfer::Receive).await.unwrap_err();
    assert!(matches!(err, SessionError::Malformed { count: 3, .. }), "{err}");
    assert_eq!(server.state(), SessionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn oversized_payload_counts_as_malformed() {
    let (a, mut b) = duplex(BUF);
    raw_propose(&mut b, Handshake::from_config(&cfg(4, 4, 100))).await;
    let mut server = Session::accept(a, cfg(4, 4, 100)).await.unwrap();

    let too_big = data(0, true, b"abcdefgh");
    let fine = data(0, true, b"abcd");
    b.write_all(&too_big.encode()).await.unwrap();
    b.write_all(&fine.encode()).await.unwrap();

    let report = server.transfer(Transfer::Receive).await.unwrap();
    assert_eq!(report.delivered.as_deref(), Some(&b"abcd"[..]));
    assert_eq!(report.stats.malformed, 1);
    drop(b);
}

#[tokio::test(start_paused = true)]
async fn failed_transfer_releases_the_channel() {
    let (a, mut b) = duplex(BUF);
    raw_propose(&mut b, Handshake::from_config(&cfg(4, 4, 100))).await;
    let mut config = cfg(4, 4, 100);
    config.max_malformed = 0;
    let mut server = Session::accept(a, config).await.unwrap();

    b.write_all(&[0, 0, 0, 2, 0x09, 0x00]).await.unwrap();
    let err = server.transfer(Transfer::Receive).await.unwrap_err();
    assert!(matches!(err, SessionError::Malformed { count: 1, .. }), "{err}");
    assert_eq!(server.state(), SessionState::Failed);

    // The session is still alive, yet the peer reads EOF after the reply.
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), b.read_to_end(&mut seen))
        .await
        .expect("no EOF after failure")
        .unwrap();
    assert_eq!(seen.len(), HANDSHAKE_LEN);
    drop(server);
}

#[tokio::test]
async fn failed_handshake_ends_in_failed_state() {
    let (a, mut b) = duplex(BUF);
    let mut session = Session::new(a, cfg(16, 2, 100));
    assert_eq!(session.state(), SessionState::Handshaking);

    b.write_all(&[0u8; HANDSHAKE_LEN]).await.unwrap();
    let err = session.respond().await.unwrap_err();
    assert!(matches!(err, SessionError::Handshake(HandshakeError::BadTag(0))));
    assert_eq!(session.state(), SessionState::Failed);

    let mut seen = Vec::new();
    b.read_to_end(&mut seen).await.unwrap();
    assert!(seen.is_empty());

    let err = session
        .transfer(Transfer::Send(b"late".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::BadState(SessionState::Failed)));
}

#[tokio::test]
async fn transfer_before_handshake_is_refused() {
    let (a, _b) = duplex(BUF);
    let mut session = Session::new(a, cfg(16, 2, 100));
    let err = session.transfer(Transfer::Receive).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::BadState(SessionState::Handshaking)
    ));
    assert_eq!(session.state(), SessionState::Handshaking);
}

#[tokio::test]
async fn chunk_larger_than_a_frame_is_invalid() {
    let (a, _b) = duplex(BUF);
    let err = Session::connect(a, cfg(MAX_PAYLOAD_LEN + 1, 1, 100))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::InvalidConfig(ConfigError::OutOfRange("chunk_size"))
    ));
}

#[tokio::test(start_paused = true)]
async fn largest_chunk_still_fits_a_frame() {
    let message = vec![7u8; MAX_PAYLOAD_LEN + 3];
    let mut server = cfg(MAX_PAYLOAD_LEN, 2, 30_000);
    server.max_malformed = 0;

    let (sent, received) = deliver(&message, cfg(MAX_PAYLOAD_LEN, 2, 30_000), server).await;
    assert_eq!(received.stats.malformed, 0);
    assert_eq!(sent.stats.frames_sent, 2);
    assert!(received.delivered == Some(message));
}

#[tokio::test(start_paused = true)]
async fn ack_for_unsent_seq_is_ignored() {
    let (a, mut b) = duplex(BUF);
    let peer = tokio::spawn(async move {
        let mut proposal = [0u8; HANDSHAKE_LEN];
        b.read_exact(&mut proposal).await.unwrap();
        b.write_all(&proposal).await.unwrap();

        let first = FrameReader::new(&mut b).next_frame().await.unwrap();
        assert_eq!(first, Some(Inbound::Frame(data(0, true, b"abcd"))));

        b.write_all(&Frame::Ack { seq: 99 }.encode()).await.unwrap();
        b.write_all(&Frame::Ack { seq: 0 }.encode()).await.unwrap();
        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
    });

    let mut client = Session::connect(a, cfg(4, 1, 100)).await.unwrap();
    let report = client
        .transfer(Transfer::Send(b"abcd".to_vec()))
        .await
        .unwrap();
    assert_eq!(report.stats.acks_received, 2);
    assert_eq!(report.stats.duplicate_acks, 1);
    assert_eq!(client.state(), SessionState::Completed);
    peer.await.unwrap();
}
