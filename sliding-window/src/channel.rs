//! Frame-level adapters over a duplex byte channel.
//!
//! [`FrameReader`] and [`FrameWriter`] wrap the two halves of any tokio
//! `AsyncRead + AsyncWrite` stream (a `TcpStream`, an in-memory `duplex`
//! pair) and speak [`Frame`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::{Frame, FrameError, LEN_PREFIX, MAX_FRAME_LEN};
use crate::handshake::{Handshake, HANDSHAKE_LEN};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that end the channel for this session.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Underlying I/O error from the OS.
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the stream in the middle of a frame or record.
    #[error("channel closed mid-frame")]
    Truncated,
}

/// One item read from the channel.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Frame(Frame),
    /// The bytes up to the next boundary could not be decoded; they have been
    /// consumed and the reader is positioned at the following frame.
    Malformed(FrameError),
}

// ---------------------------------------------------------------------------
// FrameReader
// ---------------------------------------------------------------------------

/// Reads length-prefixed frames from the inbound half.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream at a frame
    /// boundary.  Oversized frames are skipped without buffering them.
    pub async fn next_frame(&mut self) -> Result<Option<Inbound>, ChannelError> {
        let mut prefix = [0u8; LEN_PREFIX];
        match read_full(&mut self.inner, &mut prefix).await? {
            0 => return Ok(None),
            LEN_PREFIX => {}
            _ => return Err(ChannelError::Truncated),
        }
        let len = u32::from_be_bytes(prefix) as usize;

        if len > MAX_FRAME_LEN {
            let skipped = tokio::io::copy(
                &mut (&mut self.inner).take(len as u64),
                &mut tokio::io::sink(),
            )
            .await?;
            if skipped < len as u64 {
                return Err(ChannelError::Truncated);
            }
            return Ok(Some(Inbound::Malformed(FrameError::Oversized(len))));
        }

        let mut body = vec![0u8; len];
        if read_full(&mut self.inner, &mut body).await? < len {
            return Err(ChannelError::Truncated);
        }
        Ok(Some(match Frame::decode_body(&body) {
            Ok(frame) => Inbound::Frame(frame),
            Err(e) => Inbound::Malformed(e),
        }))
    }

    /// Read the fixed-size handshake record.
    pub async fn read_handshake(&mut self) -> Result<[u8; HANDSHAKE_LEN], ChannelError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        if read_full(&mut self.inner, &mut buf).await? < HANDSHAKE_LEN {
            return Err(ChannelError::Truncated);
        }
        Ok(buf)
    }
}

/// Fill `buf` unless EOF comes first; returns how many bytes were read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// FrameWriter
// ---------------------------------------------------------------------------

/// Writes frames to the outbound half.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode `frame` and write it in full.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), ChannelError> {
        self.inner.write_all(&frame.encode()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_handshake(&mut self, record: &Handshake) -> Result<(), ChannelError> {
        self.inner.write_all(&record.encode()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Half-close: the peer's reader sees EOF after everything already written.
    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
