// Batch mode: HTTP-style request/response carriers exchange one
// newline-delimited body of messages per direction. Semantically this is a
// streaming transport that survives exactly one round trip: the session
// drains the inbound batch, runs to quiescence, and the accumulated
// outbound frames become the response body.

use async_trait::async_trait;
use ocapweb_core::protocol::codec::Frame;
use ocapweb_core::protocol::transport::{RpcTransport, TransportError};
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use tokio::sync::{watch, Mutex};

/// Join text frames into a newline-delimited batch body.
pub fn encode_batch(frames: &[Frame]) -> Result<String, TransportError> {
    let mut lines = Vec::with_capacity(frames.len());
    for frame in frames {
        match frame {
            Frame::Text(text) => lines.push(text.as_str()),
            Frame::Binary(_) | Frame::Tree(_) => {
                return Err(TransportError::Codec(
                    "batch bodies carry text frames only".to_string(),
                ))
            }
        }
    }
    Ok(lines.join("\n"))
}

/// Split a batch body into one text frame per line.
pub fn decode_batch(body: &str) -> Vec<Frame> {
    body.lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|line| Frame::Text(line.to_string()))
        .collect()
}

/// One-round-trip transport: replays a fixed inbound batch, records the
/// outbound batch. Once the inbound side is drained, `receive` parks until
/// the driver collects the response; it never reports a clean close, so
/// in-flight turns are not torn down mid-batch.
pub struct BatchTransport {
    inbound: Mutex<VecDeque<Frame>>,
    outbound: StdMutex<Vec<Frame>>,
    sent_count: watch::Sender<usize>,
}

impl BatchTransport {
    pub fn new(inbound: Vec<Frame>) -> Self {
        let (sent_count, _) = watch::channel(0);
        BatchTransport {
            inbound: Mutex::new(inbound.into()),
            outbound: StdMutex::new(Vec::new()),
            sent_count,
        }
    }

    pub fn from_body(body: &str) -> Self {
        Self::new(decode_batch(body))
    }

    /// Wait until at least `min` outbound frames have accumulated.
    pub async fn wait_for_outbound(&self, min: usize) {
        let mut rx = self.sent_count.subscribe();
        loop {
            if *rx.borrow_and_update() >= min {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Drain the recorded response frames.
    pub fn take_outbound(&self) -> Vec<Frame> {
        std::mem::take(
            &mut *self
                .outbound
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

#[async_trait]
impl RpcTransport for BatchTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let count = {
            let mut outbound = self
                .outbound
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            outbound.push(frame);
            outbound.len()
        };
        self.sent_count.send_replace(count);
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Frame>, TransportError> {
        let next = self.inbound.lock().await.pop_front();
        match next {
            Some(frame) => Ok(Some(frame)),
            // Batch exhausted: park forever, the driver decides when the
            // round trip is over.
            None => std::future::pending().await,
        }
    }

    async fn abort(&self, _reason: String) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_body_round_trip() {
        let body = "[\"push\",[\"pipeline\",0,[\"add\"],[5,3]]]\n[\"pull\",1]";
        let frames = decode_batch(body);
        assert_eq!(frames.len(), 2);
        assert_eq!(encode_batch(&frames).unwrap(), body);
    }

    #[test]
    fn test_batch_rejects_binary_frames() {
        let frames = vec![Frame::Binary(bytes::Bytes::from_static(b"x"))];
        assert!(encode_batch(&frames).is_err());
    }

    #[tokio::test]
    async fn test_batch_transport_replays_then_parks() {
        let transport = BatchTransport::from_body("[\"pull\",1]");
        assert_eq!(
            transport.receive().await.unwrap(),
            Some(Frame::Text("[\"pull\",1]".into()))
        );

        // Drained: receive never completes.
        let timeout = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            transport.receive(),
        )
        .await;
        assert!(timeout.is_err());
    }

    #[tokio::test]
    async fn test_outbound_accumulates() {
        let transport = BatchTransport::new(vec![]);
        transport.send(Frame::Text("a".into())).await.unwrap();
        transport.send(Frame::Text("b".into())).await.unwrap();
        transport.wait_for_outbound(2).await;
        assert_eq!(transport.take_outbound().len(), 2);
    }
}
