use super::codec::Frame;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// The narrow interface the session kernel consumes.
///
/// Frames are delivered in order; `receive` returning `Ok(None)` means the
/// peer closed cleanly, an `Err` is terminal. Implementations may suspend
/// only inside `send`/`receive`.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;
    async fn receive(&self) -> Result<Option<Frame>, TransportError>;
    async fn abort(&self, reason: String);
}
