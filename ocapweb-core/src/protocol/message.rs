use super::expression::Expression;
use super::ids::{ExportId, ImportId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Top-level message envelope. Messages are JSON arrays with the message
/// kind as the first element.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// ["push", expression] - evaluate an expression; the result takes the
    /// sender's next sequential import ID
    Push(Expression),

    /// ["pull", importId] - ask the peer to resolve and deliver the named
    /// promise
    Pull(ImportId),

    /// ["resolve", exportId, expression] - deliver a successful resolution
    Resolve(ExportId, Expression),

    /// ["reject", exportId, expression] - deliver a rejection
    Reject(ExportId, Expression),

    /// ["release", importId, count] - sender gives up `count` references to
    /// the receiver's export
    Release(ImportId, u32),

    /// ["abort", expression] - fatal session error
    Abort(Expression),
}

impl Message {
    pub fn from_json(value: &JsonValue) -> Result<Self, MessageError> {
        let arr = value.as_array().ok_or(MessageError::NotAnArray)?;

        if arr.is_empty() {
            return Err(MessageError::EmptyMessage);
        }

        let kind = arr[0].as_str().ok_or(MessageError::InvalidMessageKind)?;

        match kind {
            "push" => {
                if arr.len() != 2 {
                    return Err(MessageError::InvalidArity("push"));
                }
                Ok(Message::Push(Expression::from_json(&arr[1])?))
            }

            "pull" => {
                if arr.len() != 2 {
                    return Err(MessageError::InvalidArity("pull"));
                }
                let id = arr[1].as_i64().ok_or(MessageError::InvalidId)?;
                Ok(Message::Pull(ImportId(id)))
            }

            "resolve" => {
                if arr.len() != 3 {
                    return Err(MessageError::InvalidArity("resolve"));
                }
                let id = arr[1].as_i64().ok_or(MessageError::InvalidId)?;
                Ok(Message::Resolve(ExportId(id), Expression::from_json(&arr[2])?))
            }

            "reject" => {
                if arr.len() != 3 {
                    return Err(MessageError::InvalidArity("reject"));
                }
                let id = arr[1].as_i64().ok_or(MessageError::InvalidId)?;
                Ok(Message::Reject(ExportId(id), Expression::from_json(&arr[2])?))
            }

            "release" => {
                if arr.len() != 3 {
                    return Err(MessageError::InvalidArity("release"));
                }
                let id = arr[1].as_i64().ok_or(MessageError::InvalidId)?;
                let count = arr[2].as_u64().ok_or(MessageError::InvalidRefcount)? as u32;
                Ok(Message::Release(ImportId(id), count))
            }

            "abort" => {
                if arr.len() != 2 {
                    return Err(MessageError::InvalidArity("abort"));
                }
                Ok(Message::Abort(Expression::from_json(&arr[1])?))
            }

            other => Err(MessageError::UnknownMessageKind(other.to_string())),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Message::Push(expr) => serde_json::json!(["push", expr.to_json()]),
            Message::Pull(id) => serde_json::json!(["pull", id.0]),
            Message::Resolve(id, expr) => serde_json::json!(["resolve", id.0, expr.to_json()]),
            Message::Reject(id, expr) => serde_json::json!(["reject", id.0, expr.to_json()]),
            Message::Release(id, count) => serde_json::json!(["release", id.0, count]),
            Message::Abort(expr) => serde_json::json!(["abort", expr.to_json()]),
        }
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        Message::from_json(&value).map_err(|e| serde::de::Error::custom(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message must be a JSON array")]
    NotAnArray,

    #[error("message array cannot be empty")]
    EmptyMessage,

    #[error("message kind must be a string")]
    InvalidMessageKind,

    #[error("invalid {0} message format")]
    InvalidArity(&'static str),

    #[error("invalid message id")]
    InvalidId,

    #[error("invalid refcount")]
    InvalidRefcount,

    #[error("unknown message kind: {0}")]
    UnknownMessageKind(String),

    #[error("expression error: {0}")]
    ExpressionError(#[from] super::expression::ExpressionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_message() {
        let json = json!(["push", "hello"]);
        let msg = Message::from_json(&json).unwrap();
        match &msg {
            Message::Push(expr) => assert_eq!(expr, &Expression::String("hello".into())),
            _ => panic!("expected push"),
        }
        assert_eq!(msg.to_json(), json);
    }

    #[test]
    fn test_pull_message() {
        let json = json!(["pull", 42]);
        let msg = Message::from_json(&json).unwrap();
        assert_eq!(msg, Message::Pull(ImportId(42)));
        assert_eq!(msg.to_json(), json);
    }

    #[test]
    fn test_release_message() {
        let json = json!(["release", -3, 2]);
        let msg = Message::from_json(&json).unwrap();
        assert_eq!(msg, Message::Release(ImportId(-3), 2));
        assert_eq!(msg.to_json(), json);
    }

    #[test]
    fn test_resolve_reject_messages() {
        let resolve = Message::from_json(&json!(["resolve", 1, "done"])).unwrap();
        assert_eq!(
            resolve,
            Message::Resolve(ExportId(1), Expression::String("done".into()))
        );

        let reject = Message::from_json(&json!(["reject", 1, ["error", "Error", "no"]])).unwrap();
        match reject {
            Message::Reject(id, Expression::Error(err)) => {
                assert_eq!(id, ExportId(1));
                assert_eq!(err.message, "no");
            }
            _ => panic!("expected reject with error"),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(Message::from_json(&json!(["frobnicate", 1])).is_err());
        assert!(Message::from_json(&json!({"push": 1})).is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let original = Message::Push(Expression::Pipeline {
            id: ImportId(0),
            path: Some(vec![super::super::expression::PropertyKey::String(
                "add".into(),
            )]),
            args: Some(vec![Expression::Number(5.0), Expression::Number(3.0)]),
        });
        let json = serde_json::to_value(&original).unwrap();
        assert_eq!(json, json!(["push", ["pipeline", 0, ["add"], [5, 3]]]));
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(original, back);
    }
}
