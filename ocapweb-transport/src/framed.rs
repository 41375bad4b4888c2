// Byte-stream framing.
//
// Each logical message is prefixed by a 4-byte big-endian unsigned length,
// or carried one-per-line for text streams. `StreamTransport` adapts any
// AsyncRead + AsyncWrite into the transport interface using the
// length-prefixed codec.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use ocapweb_core::protocol::codec::Frame;
use ocapweb_core::protocol::transport::{RpcTransport, TransportError};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, Framed};

fn frame_bytes(frame: Frame) -> Result<Bytes, FramingError> {
    match frame {
        Frame::Text(text) => Ok(Bytes::from(text.into_bytes())),
        Frame::Binary(bytes) => Ok(bytes),
        Frame::Tree(_) => Err(FramingError::Structured),
    }
}

/// 4-byte big-endian length prefix framing with a max-frame guard.
pub struct LengthPrefixedCodec {
    max_frame_size: usize,
}

impl LengthPrefixedCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: 10 * 1024 * 1024,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LengthPrefixedCodec {
    type Item = Frame;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let frame_len = u32::from_be_bytes(length_bytes) as usize;

        if frame_len > self.max_frame_size {
            return Err(FramingError::FrameTooLarge(frame_len));
        }

        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_data = src.split_to(frame_len);
        Ok(Some(Frame::Binary(frame_data.freeze())))
    }
}

impl Encoder<Frame> for LengthPrefixedCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = frame_bytes(item)?;
        if bytes.len() > self.max_frame_size {
            return Err(FramingError::FrameTooLarge(bytes.len()));
        }

        dst.reserve(4 + bytes.len());
        dst.put_u32(bytes.len() as u32);
        dst.put_slice(&bytes);
        Ok(())
    }
}

/// One frame per line, for text streams and batch bodies.
pub struct NewlineDelimitedCodec {
    max_line_length: usize,
}

impl NewlineDelimitedCodec {
    pub fn new() -> Self {
        Self {
            max_line_length: 1024 * 1024,
        }
    }
}

impl Default for NewlineDelimitedCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NewlineDelimitedCodec {
    type Item = Frame;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline_pos = src.iter().position(|&b| b == b'\n');

        if let Some(pos) = newline_pos {
            if pos > self.max_line_length {
                return Err(FramingError::LineTooLong(pos));
            }
            let line = src.split_to(pos);
            src.advance(1);
            let text = String::from_utf8(line.to_vec()).map_err(|_| FramingError::Utf8)?;
            Ok(Some(Frame::Text(text)))
        } else {
            if src.len() > self.max_line_length {
                return Err(FramingError::LineTooLong(src.len()));
            }
            Ok(None)
        }
    }
}

impl Encoder<Frame> for NewlineDelimitedCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = frame_bytes(item)?;
        if bytes.len() > self.max_line_length {
            return Err(FramingError::LineTooLong(bytes.len()));
        }
        dst.reserve(bytes.len() + 1);
        dst.put_slice(&bytes);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("line too long: {0} bytes")]
    LineTooLong(usize),

    #[error("frame is not valid UTF-8")]
    Utf8,

    #[error("structured frames cannot cross a byte stream")]
    Structured,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Adapt a duplex byte stream into the transport interface with
/// length-prefixed framing.
pub struct StreamTransport<T> {
    framed: Mutex<Framed<T, LengthPrefixedCodec>>,
}

impl<T> StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: T) -> Self {
        StreamTransport {
            framed: Mutex::new(Framed::new(stream, LengthPrefixedCodec::new())),
        }
    }
}

#[async_trait]
impl<T> RpcTransport for StreamTransport<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.framed
            .lock()
            .await
            .send(frame)
            .await
            .map_err(|e| TransportError::Codec(e.to_string()))
    }

    async fn receive(&self) -> Result<Option<Frame>, TransportError> {
        match self.framed.lock().await.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(TransportError::Codec(e.to_string())),
            None => Ok(None),
        }
    }

    async fn abort(&self, _reason: String) {
        let _ = self.framed.lock().await.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefixed_round_trip() {
        let mut codec = LengthPrefixedCodec::new();
        let mut buffer = BytesMut::new();

        codec
            .encode(Frame::Text("[\"pull\",1]".into()), &mut buffer)
            .unwrap();
        assert_eq!(&buffer[..4], &[0, 0, 0, 10]);

        let decoded = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(decoded, Frame::Binary(Bytes::from_static(b"[\"pull\",1]")));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_frame_needs_more_data() {
        let mut codec = LengthPrefixedCodec::new();
        let mut buffer = BytesMut::new();

        buffer.put_u8(0);
        buffer.put_u8(0);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.put_u8(0);
        buffer.put_u8(10);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_frame_too_large_is_rejected() {
        let mut codec = LengthPrefixedCodec::with_max_frame_size(8);
        let mut buffer = BytesMut::new();
        assert!(codec
            .encode(Frame::Text("x".repeat(100)), &mut buffer)
            .is_err());
    }

    #[test]
    fn test_newline_round_trip_multiple() {
        let mut codec = NewlineDelimitedCodec::new();
        let mut buffer = BytesMut::new();

        codec.encode(Frame::Text("[\"pull\",1]".into()), &mut buffer).unwrap();
        codec.encode(Frame::Text("[\"pull\",2]".into()), &mut buffer).unwrap();

        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(Frame::Text("[\"pull\",1]".into()))
        );
        assert_eq!(
            codec.decode(&mut buffer).unwrap(),
            Some(Frame::Text("[\"pull\",2]".into()))
        );
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
    }

    #[test]
    fn test_structured_frames_do_not_cross() {
        let mut codec = LengthPrefixedCodec::new();
        let mut buffer = BytesMut::new();
        assert!(matches!(
            codec.encode(Frame::Tree(vec![]), &mut buffer),
            Err(FramingError::Structured)
        ));
    }

    #[tokio::test]
    async fn test_stream_transport_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let client = StreamTransport::new(client_io);
        let server = StreamTransport::new(server_io);

        client.send(Frame::Text("[\"pull\",7]".into())).await.unwrap();
        let got = server.receive().await.unwrap().unwrap();
        assert_eq!(got, Frame::Binary(Bytes::from_static(b"[\"pull\",7]")));

        client.abort("done".into()).await;
        assert!(matches!(server.receive().await, Ok(None)));
    }
}
