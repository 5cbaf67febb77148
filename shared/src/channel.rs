//! Transport channel capability.
//!
//! The session core never touches sockets directly: it sends bytes through a
//! `MessageChannel` and receives inbound traffic as messages on its queue.
//! Channels are fire-and-forget: a send must never block the tick loop, and
//! a failed send is dropped (state traffic is superseded by the next tick;
//! reliable-leg failures surface separately as a disconnect).

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Upper bound for a single framed message on the reliable leg.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
}

pub trait MessageChannel: Send {
    fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError>;
}

/// In-process channel leg backed by an unbounded queue. Used for embedded
/// clients and as the hand-off into socket writer tasks.
pub struct QueueChannel(pub mpsc::UnboundedSender<Vec<u8>>);

impl MessageChannel for QueueChannel {
    fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.0.send(payload).map_err(|_| ChannelError::Closed)
    }
}

/// Writes one length-prefixed frame (4-byte big-endian length + payload).
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame. Returns `Ok(None)` on a clean
/// end-of-stream at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds maximum length",
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
