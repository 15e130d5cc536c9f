//! Sending client: connect, negotiate, deliver one message.

use tokio::net::{TcpStream, ToSocketAddrs};

use crate::channel::ChannelError;
use crate::config::SessionConfig;
use crate::session::{Report, Session, SessionError, Transfer};

/// Connect to `server` and send `message` with selective repeat.
///
/// The configuration is validated before the TCP connection is opened.
pub async fn send_message(
    server: impl ToSocketAddrs,
    message: Vec<u8>,
    config: SessionConfig,
) -> Result<Report, SessionError> {
    config.validate()?;
    let stream = TcpStream::connect(server).await.map_err(ChannelError::from)?;
    let peer = stream.peer_addr().map_err(ChannelError::from)?;
    log::info!("{{{peer}}} Connection established");

    let mut session = Session::connect(stream, config)
        .await?
        .with_label(peer.to_string());
    log::info!(
        "{{{peer}}} agreed chunk size {} bytes, window {}",
        session.config().chunk_size,
        session.config().window_size
    );
    session.transfer(Transfer::Send(message)).await
}
