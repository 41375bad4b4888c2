// In-memory duplex transport: two endpoints cross-wired over unbounded
// channels. FIFO by construction. This is the MessagePort analogue and the
// workhorse for two-session tests.

use async_trait::async_trait;
use ocapweb_core::protocol::codec::Frame;
use ocapweb_core::protocol::transport::{RpcTransport, TransportError};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

pub struct ChannelTransport {
    tx: StdMutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    severed: watch::Sender<bool>,
}

/// Two connected endpoints; frames sent on one arrive on the other in
/// order.
pub fn duplex_pair() -> (ChannelTransport, ChannelTransport) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    (
        ChannelTransport::new(tx_a, rx_b),
        ChannelTransport::new(tx_b, rx_a),
    )
}

impl ChannelTransport {
    fn new(tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        let (severed, _) = watch::channel(false);
        ChannelTransport {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            severed,
        }
    }

    /// A handle that simulates the carrier dying under this endpoint:
    /// subsequent send/receive fail instead of closing cleanly.
    pub fn sever_handle(&self) -> SeverHandle {
        SeverHandle {
            severed: self.severed.clone(),
        }
    }

    fn is_severed(&self) -> bool {
        *self.severed.borrow()
    }
}

#[derive(Clone)]
pub struct SeverHandle {
    severed: watch::Sender<bool>,
}

impl SeverHandle {
    pub fn sever(&self) {
        self.severed.send_replace(true);
    }
}

#[async_trait]
impl RpcTransport for ChannelTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_severed() {
            return Err(TransportError::ConnectionClosed);
        }
        let guard = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match guard.as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| TransportError::ConnectionClosed),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    async fn receive(&self) -> Result<Option<Frame>, TransportError> {
        let mut severed = self.severed.subscribe();
        if *severed.borrow_and_update() {
            return Err(TransportError::ConnectionClosed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = severed.changed() => Err(TransportError::ConnectionClosed),
            frame = rx.recv() => Ok(frame),
        }
    }

    async fn abort(&self, reason: String) {
        debug!("channel transport aborted: {}", reason);
        // Dropping our sender closes the peer's receive cleanly.
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.severed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_in_order() {
        let (a, b) = duplex_pair();
        a.send(Frame::Text("one".into())).await.unwrap();
        a.send(Frame::Text("two".into())).await.unwrap();

        assert_eq!(b.receive().await.unwrap(), Some(Frame::Text("one".into())));
        assert_eq!(b.receive().await.unwrap(), Some(Frame::Text("two".into())));
    }

    #[tokio::test]
    async fn test_abort_closes_peer_cleanly() {
        let (a, b) = duplex_pair();
        a.abort("done".into()).await;
        assert_eq!(b.receive().await.unwrap(), None);
        assert!(a.send(Frame::Text("late".into())).await.is_err());
    }

    #[tokio::test]
    async fn test_sever_fails_receive() {
        let (a, _b) = duplex_pair();
        let handle = a.sever_handle();

        let pending = tokio::spawn(async move { a.receive().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        handle.sever();

        assert!(matches!(
            pending.await.unwrap(),
            Err(TransportError::ConnectionClosed)
        ));
    }
}
