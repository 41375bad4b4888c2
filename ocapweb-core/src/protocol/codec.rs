// Codec layer: frame encoding/decoding and host-value classification.
//
// The wire format is newline-delimited JSON arrays, one message per line.
// The structured variant skips serialization entirely and hands the decoded
// message trees across as-is, for in-process transports.

use super::message::Message;
use super::value::Value;
use bytes::Bytes;
use serde_json::Value as JsonValue;
use std::fmt;
use tracing::{debug, trace, warn};

/// Classification kinds. `classify` must be deterministic: the same host
/// value under the same codec always yields the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Unsupported,
    /// Booleans, numbers (finite or not), strings, null.
    Primitive,
    Undefined,
    BigInt,
    Date,
    Bytes,
    Array,
    Object,
    Function,
    /// A local stub handle.
    Stub,
    /// A local promise handle.
    RpcPromise,
    /// A host object marked as remotely invocable.
    RpcTarget,
    /// A host promise-like that resolves to a target. No host value maps to
    /// this kind in this implementation; it is part of the classification
    /// contract for codecs that can observe one.
    RpcThenable,
    Error,
    /// An error passed verbatim, bypassing the send-error hook.
    ErrorRaw,
    /// A scalar to pass through without tag rewriting.
    Raw,
    /// A tree marked raw at its root; never traversed.
    RawSubtree,
}

/// One transport frame. The codec decides which shape it produces.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    /// Structured passthrough: the message trees themselves, no
    /// serialization. Only meaningful for in-process transports.
    Tree(Vec<Message>),
}

pub trait Codec: Send + Sync + fmt::Debug {
    fn classify(&self, value: &Value) -> Kind;
    fn encode(&self, batch: &[Message]) -> Result<Frame, CodecError>;
    fn decode(&self, frame: &Frame) -> Result<Vec<Message>, CodecError>;
}

fn classify_capabilities(value: &Value) -> Option<Kind> {
    match value {
        Value::Stub(_) => Some(Kind::Stub),
        Value::Promise(_) => Some(Kind::RpcPromise),
        Value::Target(_) => Some(Kind::RpcTarget),
        Value::Function(_) => Some(Kind::Function),
        Value::Opaque(_) => Some(Kind::Unsupported),
        Value::Raw(_) => Some(Kind::RawSubtree),
        Value::Error(e) if e.raw => Some(Kind::ErrorRaw),
        _ => None,
    }
}

/// Parse a newline-delimited batch of messages.
pub fn parse_batch(input: &str) -> Result<Vec<Message>, CodecError> {
    trace!("parsing batch, input length: {} chars", input.len());
    let mut messages = Vec::new();

    for (line_num, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let json: JsonValue = serde_json::from_str(line).map_err(|e| {
            warn!("invalid JSON on line {}: {}", line_num + 1, e);
            CodecError::Json(format!("line {}: {}", line_num + 1, e))
        })?;

        let msg = Message::from_json(&json)
            .map_err(|e| CodecError::Message(format!("line {}: {}", line_num + 1, e)))?;
        messages.push(msg);
    }

    debug!("parsed {} messages from batch", messages.len());
    Ok(messages)
}

/// Serialize messages to newline-delimited format.
pub fn serialize_batch(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|msg| msg.to_json().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tagged JSON codec: text frames, non-JSON values rewritten to
/// `[tag, payload]` forms. The default.
#[derive(Debug, Default)]
pub struct TaggedCodec;

impl Codec for TaggedCodec {
    fn classify(&self, value: &Value) -> Kind {
        if let Some(kind) = classify_capabilities(value) {
            return kind;
        }
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => Kind::Primitive,
            Value::Undefined => Kind::Undefined,
            Value::BigInt(_) => Kind::BigInt,
            Value::Date(_) => Kind::Date,
            Value::Bytes(_) => Kind::Bytes,
            Value::Array(_) => Kind::Array,
            Value::Object(_) => Kind::Object,
            Value::Error(_) => Kind::Error,
            _ => unreachable!("capability kinds handled above"),
        }
    }

    fn encode(&self, batch: &[Message]) -> Result<Frame, CodecError> {
        Ok(Frame::Text(serialize_batch(batch)))
    }

    fn decode(&self, frame: &Frame) -> Result<Vec<Message>, CodecError> {
        match frame {
            Frame::Text(text) => parse_batch(text),
            Frame::Binary(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
                parse_batch(text)
            }
            Frame::Tree(messages) => Ok(messages.clone()),
        }
    }
}

/// Structured-clone codec: scalars classify as raw (no tag rewriting ever
/// happens, because frames carry the trees themselves), containers are still
/// walked to find capabilities.
#[derive(Debug, Default)]
pub struct StructuredCodec;

fn classify_structured(value: &Value) -> Kind {
    if let Some(kind) = classify_capabilities(value) {
        return kind;
    }
    match value {
        Value::Array(_) => Kind::Array,
        Value::Object(_) => Kind::Object,
        _ => Kind::Raw,
    }
}

impl Codec for StructuredCodec {
    fn classify(&self, value: &Value) -> Kind {
        classify_structured(value)
    }

    fn encode(&self, batch: &[Message]) -> Result<Frame, CodecError> {
        Ok(Frame::Tree(batch.to_vec()))
    }

    fn decode(&self, frame: &Frame) -> Result<Vec<Message>, CodecError> {
        match frame {
            Frame::Tree(messages) => Ok(messages.clone()),
            Frame::Text(_) => Err(CodecError::UnsupportedFrame("text")),
            Frame::Binary(_) => Err(CodecError::UnsupportedFrame("binary")),
        }
    }
}

/// Binary codec: defers encoding to the serializer; classification matches
/// the structured-clone codec.
#[derive(Debug, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn classify(&self, value: &Value) -> Kind {
        classify_structured(value)
    }

    fn encode(&self, batch: &[Message]) -> Result<Frame, CodecError> {
        Ok(Frame::Binary(Bytes::from(
            serialize_batch(batch).into_bytes(),
        )))
    }

    fn decode(&self, frame: &Frame) -> Result<Vec<Message>, CodecError> {
        match frame {
            Frame::Binary(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)?;
                parse_batch(text)
            }
            Frame::Text(text) => parse_batch(text),
            Frame::Tree(messages) => Ok(messages.clone()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(String),

    #[error("message parse error: {0}")]
    Message(String),

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("codec does not accept {0} frames")]
    UnsupportedFrame(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::expression::Expression;
    use crate::protocol::ids::ImportId;

    #[test]
    fn test_tagged_batch_round_trip() {
        let codec = TaggedCodec;
        let batch = vec![
            Message::Push(Expression::Pipeline {
                id: ImportId(0),
                path: Some(vec![crate::protocol::expression::PropertyKey::String(
                    "add".into(),
                )]),
                args: Some(vec![Expression::Number(5.0), Expression::Number(3.0)]),
            }),
            Message::Pull(ImportId(1)),
        ];

        let frame = codec.encode(&batch).unwrap();
        match &frame {
            Frame::Text(text) => {
                assert_eq!(
                    text,
                    "[\"push\",[\"pipeline\",0,[\"add\"],[5,3]]]\n[\"pull\",1]"
                );
            }
            _ => panic!("expected text frame"),
        }

        assert_eq!(codec.decode(&frame).unwrap(), batch);
    }

    #[test]
    fn test_tagged_classification() {
        let codec = TaggedCodec;
        assert_eq!(codec.classify(&Value::Null), Kind::Primitive);
        assert_eq!(codec.classify(&Value::Number(f64::NAN)), Kind::Primitive);
        assert_eq!(codec.classify(&Value::Undefined), Kind::Undefined);
        assert_eq!(codec.classify(&Value::bigint("1")), Kind::BigInt);
        assert_eq!(codec.classify(&Value::Array(vec![])), Kind::Array);
        assert_eq!(
            codec.classify(&Value::Raw(serde_json::json!([1]))),
            Kind::RawSubtree
        );
        assert_eq!(
            codec.classify(&Value::Opaque(std::sync::Arc::new(123u32))),
            Kind::Unsupported
        );
        let raw_err = Value::Error(
            crate::protocol::value::ErrorValue::new("Error", "secret").into_raw(),
        );
        assert_eq!(codec.classify(&raw_err), Kind::ErrorRaw);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let codec = TaggedCodec;
        let v = Value::object([("k", Value::Number(1.0))]);
        assert_eq!(codec.classify(&v), codec.classify(&v));
    }

    #[test]
    fn test_structured_codec_passthrough() {
        let codec = StructuredCodec;
        assert_eq!(codec.classify(&Value::Number(1.0)), Kind::Raw);
        assert_eq!(codec.classify(&Value::Array(vec![])), Kind::Array);
        assert_eq!(
            codec.classify(&Value::Opaque(std::sync::Arc::new(1u8))),
            Kind::Unsupported
        );

        let batch = vec![Message::Pull(ImportId(7))];
        let frame = codec.encode(&batch).unwrap();
        assert_eq!(frame, Frame::Tree(batch.clone()));
        assert_eq!(codec.decode(&frame).unwrap(), batch);
        assert!(codec.decode(&Frame::Text("x".into())).is_err());
    }

    #[test]
    fn test_binary_codec_round_trip() {
        let codec = BinaryCodec;
        let batch = vec![Message::Release(ImportId(-2), 3)];
        let frame = codec.encode(&batch).unwrap();
        match &frame {
            Frame::Binary(bytes) => assert_eq!(&bytes[..], b"[\"release\",-2,3]"),
            _ => panic!("expected binary frame"),
        }
        assert_eq!(codec.decode(&frame).unwrap(), batch);
    }

    #[test]
    fn test_parse_batch_rejects_garbage() {
        assert!(parse_batch("not json").is_err());
        assert!(parse_batch("[\"unknown-kind\",1]").is_err());
        assert!(parse_batch("").unwrap().is_empty());
    }
}
