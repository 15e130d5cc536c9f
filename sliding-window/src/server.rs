//! Multi-client receiving server.
//!
//! Each accepted TCP connection gets its own tokio task running one
//! [`Session`] in [`Transfer::Receive`] mode.  Sessions share nothing; the
//! server only keeps their join handles so shutdown can wait for them.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::{ConfigError, SessionConfig};
use crate::session::{Session, SessionError, Transfer};

/// A message delivered by one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMessage {
    pub peer: SocketAddr,
    pub message: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("listener I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Listening socket plus the configuration offered to every client.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    config: SessionConfig,
    deliveries: Option<mpsc::UnboundedSender<ClientMessage>>,
}

impl Server {
    /// Validate `config` and bind the listener.
    ///
    /// `config.chunk_size` is the largest chunk any client may use.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: SessionConfig,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config,
            deliveries: None,
        })
    }

    /// Forward every delivered message to `tx` in addition to logging it.
    pub fn with_deliveries(mut self, tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        self.deliveries = Some(tx);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until `shutdown` resolves, then wait for running
    /// sessions to finish.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Listening on {}", self.local_addr()?);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let config = self.config.clone();
                    let deliveries = self.deliveries.clone();
                    sessions.spawn(async move {
                        if let Err(e) = handle_client(stream, peer, config, deliveries).await {
                            log::warn!("{{{peer}}} session failed: {e}");
                        }
                    });
                    log::debug!("{} active session(s)", sessions.len());
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("session task ended abnormally: {e}");
                    }
                }
            }
        }

        log::info!("Shutdown initiated, waiting for {} session(s)", sessions.len());
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                log::error!("session task ended abnormally: {e}");
            }
        }
        Ok(())
    }
}

/// Run one receive session on an accepted connection.
pub async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    config: SessionConfig,
    deliveries: Option<mpsc::UnboundedSender<ClientMessage>>,
) -> Result<Vec<u8>, SessionError> {
    log::info!("Connection established with {peer}");
    let mut session = Session::accept(stream, config)
        .await?
        .with_label(peer.to_string());
    let report = session.transfer(Transfer::Receive).await?;
    let message = report.delivered.unwrap_or_default();

    log::info!("{{{peer}}} says: '{}'", String::from_utf8_lossy(&message));
    if let Some(tx) = deliveries {
        // The consumer may have gone away; the message is already logged.
        let _ = tx.send(ClientMessage {
            peer,
            message: message.clone(),
        });
    }
    log::info!("{{{peer}}} Connection closed");
    Ok(message)
}
