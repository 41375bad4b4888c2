// Wire expression grammar.
//
// Expressions are JSON trees. Special forms are bare arrays whose first
// element is a string tag; a literal array is therefore escaped by wrapping
// it in a one-element array: [[e0, e1, ...]]. A bare array that is neither a
// known special form nor the escape form is a decode error.

use super::ids::{ExportId, ImportId};
use base64::Engine;
use serde_json::{Number, Value as JsonValue};
use std::collections::HashMap;

/// Wire expressions: the stable surface exchanged between peers.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    // Literal values
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Expression>),
    Object(HashMap<String, Expression>),

    // Tagged scalar forms
    /// ["bigint", "<decimal>"]
    BigInt(String),
    /// ["date", millis]
    Date(f64),
    /// ["bytes", "<base64>"]
    Bytes(Vec<u8>),
    /// ["error", name, message, stack?]
    Error(ErrorExpression),
    /// ["raw", any] - passthrough subtree, never traversed
    Raw(JsonValue),

    // Reference forms
    /// ["export", id, path?] - sender gives the receiver a reference to a
    /// capability the sender holds locally
    Export {
        id: ExportId,
        path: Option<Vec<PropertyKey>>,
    },
    /// ["promise", id, path?] - like export, but the referenced result has
    /// not settled yet; a resolve/reject for `id` follows
    Promise {
        id: ExportId,
        path: Option<Vec<PropertyKey>>,
    },
    /// ["import", id, path?] - sender references a capability the *receiver*
    /// exported earlier (a re-reference from the receiver's point of view)
    Import {
        id: ImportId,
        path: Option<Vec<PropertyKey>>,
    },
    /// ["pipeline", id, path?, args?] - projection of, or call through, the
    /// sender's import `id`. With args this is a call whose method name is
    /// the last path segment (an empty path invokes the target as a
    /// function); without args it is a symbolic property projection.
    Pipeline {
        id: ImportId,
        path: Option<Vec<PropertyKey>>,
        args: Option<Vec<Expression>>,
    },
    /// ["map", id, path, callbackExpr] - apply a callback capability to each
    /// element of the array the projection resolves to
    Map {
        id: ImportId,
        path: Option<Vec<PropertyKey>>,
        callback: Box<Expression>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorExpression {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    String(String),
    Number(usize),
}

impl std::fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyKey::String(s) => write!(f, "{}", s),
            PropertyKey::Number(n) => write!(f, "{}", n),
        }
    }
}

impl PropertyKey {
    pub fn parse_path(value: &JsonValue) -> Result<Vec<PropertyKey>, ExpressionError> {
        let arr = value
            .as_array()
            .ok_or(ExpressionError::InvalidPropertyPath)?;

        arr.iter()
            .map(|v| {
                if let Some(s) = v.as_str() {
                    Ok(PropertyKey::String(s.to_string()))
                } else if let Some(n) = v.as_u64() {
                    Ok(PropertyKey::Number(n as usize))
                } else {
                    Err(ExpressionError::InvalidPropertyPath)
                }
            })
            .collect()
    }

    pub fn path_to_json(path: &[PropertyKey]) -> JsonValue {
        JsonValue::Array(
            path.iter()
                .map(|key| match key {
                    PropertyKey::String(s) => JsonValue::String(s.clone()),
                    PropertyKey::Number(n) => JsonValue::Number(Number::from(*n)),
                })
                .collect(),
        )
    }
}

/// JSON numbers that fit losslessly stay integers on the wire.
fn number_to_json(v: f64) -> JsonValue {
    if v.is_finite() && v.fract() == 0.0 && v.abs() <= 9_007_199_254_740_991.0 {
        JsonValue::Number(Number::from(v as i64))
    } else {
        Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

impl Expression {
    pub fn from_json(value: &JsonValue) -> Result<Self, ExpressionError> {
        match value {
            JsonValue::Null => Ok(Expression::Null),
            JsonValue::Bool(b) => Ok(Expression::Bool(*b)),
            JsonValue::Number(n) => Ok(Expression::Number(
                n.as_f64().ok_or(ExpressionError::InvalidNumber)?,
            )),
            JsonValue::String(s) => Ok(Expression::String(s.clone())),

            JsonValue::Array(arr) => {
                if let Some(JsonValue::String(tag)) = arr.first() {
                    Self::parse_tagged(tag, arr)
                } else if arr.len() == 1 && arr[0].is_array() {
                    // Escaped literal array: [[...]]
                    let inner = arr[0].as_array().unwrap();
                    let elements = inner
                        .iter()
                        .map(Self::from_json)
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Expression::Array(elements))
                } else {
                    Err(ExpressionError::UnescapedArray)
                }
            }

            JsonValue::Object(obj) => {
                let mut map = HashMap::new();
                for (key, val) in obj {
                    map.insert(key.clone(), Self::from_json(val)?);
                }
                Ok(Expression::Object(map))
            }
        }
    }

    fn parse_tagged(tag: &str, arr: &[JsonValue]) -> Result<Self, ExpressionError> {
        match tag {
            "undefined" => {
                if arr.len() != 1 {
                    return Err(ExpressionError::InvalidForm("undefined"));
                }
                Ok(Expression::Undefined)
            }

            "number" => {
                if arr.len() != 2 {
                    return Err(ExpressionError::InvalidForm("number"));
                }
                let v = match arr[1].as_str() {
                    Some("Infinity") => f64::INFINITY,
                    Some("-Infinity") => f64::NEG_INFINITY,
                    Some("NaN") => f64::NAN,
                    _ => return Err(ExpressionError::InvalidForm("number")),
                };
                Ok(Expression::Number(v))
            }

            "bigint" => {
                if arr.len() != 2 {
                    return Err(ExpressionError::InvalidForm("bigint"));
                }
                let digits = arr[1].as_str().ok_or(ExpressionError::InvalidForm("bigint"))?;
                let rest = digits.strip_prefix('-').unwrap_or(digits);
                if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ExpressionError::InvalidForm("bigint"));
                }
                Ok(Expression::BigInt(digits.to_string()))
            }

            "date" => {
                if arr.len() != 2 {
                    return Err(ExpressionError::InvalidForm("date"));
                }
                let millis = arr[1].as_f64().ok_or(ExpressionError::InvalidForm("date"))?;
                Ok(Expression::Date(millis))
            }

            "bytes" => {
                if arr.len() != 2 {
                    return Err(ExpressionError::InvalidForm("bytes"));
                }
                let b64 = arr[1].as_str().ok_or(ExpressionError::InvalidForm("bytes"))?;
                let data = base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|_| ExpressionError::InvalidForm("bytes"))?;
                Ok(Expression::Bytes(data))
            }

            "error" => {
                if arr.len() < 3 || arr.len() > 4 {
                    return Err(ExpressionError::InvalidForm("error"));
                }
                let name = arr[1]
                    .as_str()
                    .ok_or(ExpressionError::InvalidForm("error"))?
                    .to_string();
                let message = arr[2]
                    .as_str()
                    .ok_or(ExpressionError::InvalidForm("error"))?
                    .to_string();
                let stack = arr.get(3).and_then(|v| v.as_str()).map(String::from);
                Ok(Expression::Error(ErrorExpression {
                    name,
                    message,
                    stack,
                }))
            }

            "raw" => {
                if arr.len() != 2 {
                    return Err(ExpressionError::InvalidForm("raw"));
                }
                Ok(Expression::Raw(arr[1].clone()))
            }

            "export" | "promise" | "import" => {
                if arr.len() < 2 || arr.len() > 3 {
                    return Err(ExpressionError::InvalidForm("reference"));
                }
                let id = arr[1]
                    .as_i64()
                    .ok_or(ExpressionError::InvalidForm("reference"))?;
                let path = arr.get(2).map(PropertyKey::parse_path).transpose()?;
                Ok(match tag {
                    "export" => Expression::Export {
                        id: ExportId(id),
                        path,
                    },
                    "promise" => Expression::Promise {
                        id: ExportId(id),
                        path,
                    },
                    _ => Expression::Import {
                        id: ImportId(id),
                        path,
                    },
                })
            }

            "pipeline" => {
                if arr.len() < 2 || arr.len() > 4 {
                    return Err(ExpressionError::InvalidForm("pipeline"));
                }
                let id = arr[1]
                    .as_i64()
                    .ok_or(ExpressionError::InvalidForm("pipeline"))?;
                let path = arr.get(2).map(PropertyKey::parse_path).transpose()?;
                let args = arr
                    .get(3)
                    .map(|v| {
                        v.as_array()
                            .ok_or(ExpressionError::InvalidForm("pipeline"))?
                            .iter()
                            .map(Expression::from_json)
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .transpose()?;
                Ok(Expression::Pipeline {
                    id: ImportId(id),
                    path,
                    args,
                })
            }

            "map" => {
                if arr.len() != 4 {
                    return Err(ExpressionError::InvalidForm("map"));
                }
                let id = arr[1].as_i64().ok_or(ExpressionError::InvalidForm("map"))?;
                let path = if arr[2].is_null() {
                    None
                } else {
                    Some(PropertyKey::parse_path(&arr[2])?)
                };
                let callback = Box::new(Expression::from_json(&arr[3])?);
                Ok(Expression::Map {
                    id: ImportId(id),
                    path,
                    callback,
                })
            }

            other => Err(ExpressionError::UnknownTag(other.to_string())),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Expression::Null => JsonValue::Null,
            Expression::Undefined => serde_json::json!(["undefined"]),
            Expression::Bool(b) => JsonValue::Bool(*b),
            Expression::Number(v) => {
                if v.is_finite() {
                    number_to_json(*v)
                } else if v.is_nan() {
                    serde_json::json!(["number", "NaN"])
                } else if *v > 0.0 {
                    serde_json::json!(["number", "Infinity"])
                } else {
                    serde_json::json!(["number", "-Infinity"])
                }
            }
            Expression::String(s) => JsonValue::String(s.clone()),

            Expression::Array(elements) => {
                // Literal arrays are escaped so they cannot collide with
                // tagged forms.
                let inner: Vec<JsonValue> = elements.iter().map(|e| e.to_json()).collect();
                JsonValue::Array(vec![JsonValue::Array(inner)])
            }

            Expression::Object(map) => {
                let mut obj = serde_json::Map::new();
                for (key, val) in map {
                    obj.insert(key.clone(), val.to_json());
                }
                JsonValue::Object(obj)
            }

            Expression::BigInt(digits) => serde_json::json!(["bigint", digits]),
            Expression::Date(millis) => {
                let n = Number::from_f64(*millis).unwrap_or_else(|| Number::from(0));
                JsonValue::Array(vec![JsonValue::String("date".into()), JsonValue::Number(n)])
            }
            Expression::Bytes(data) => {
                let b64 = base64::engine::general_purpose::STANDARD.encode(data);
                serde_json::json!(["bytes", b64])
            }

            Expression::Error(err) => {
                if let Some(stack) = &err.stack {
                    serde_json::json!(["error", &err.name, &err.message, stack])
                } else {
                    serde_json::json!(["error", &err.name, &err.message])
                }
            }

            Expression::Raw(value) => serde_json::json!(["raw", value]),

            Expression::Export { id, path } => reference_to_json("export", id.0, path),
            Expression::Promise { id, path } => reference_to_json("promise", id.0, path),
            Expression::Import { id, path } => reference_to_json("import", id.0, path),

            Expression::Pipeline { id, path, args } => {
                let mut arr = vec![
                    JsonValue::String("pipeline".into()),
                    JsonValue::Number(Number::from(id.0)),
                ];
                if let Some(path) = path {
                    arr.push(PropertyKey::path_to_json(path));
                } else if args.is_some() {
                    // Args without a path still need the path slot filled.
                    arr.push(JsonValue::Array(vec![]));
                }
                if let Some(args) = args {
                    arr.push(JsonValue::Array(args.iter().map(|a| a.to_json()).collect()));
                }
                JsonValue::Array(arr)
            }

            Expression::Map { id, path, callback } => {
                let path_json = path
                    .as_ref()
                    .map(|p| PropertyKey::path_to_json(p))
                    .unwrap_or(JsonValue::Null);
                JsonValue::Array(vec![
                    JsonValue::String("map".into()),
                    JsonValue::Number(Number::from(id.0)),
                    path_json,
                    callback.to_json(),
                ])
            }
        }
    }
}

fn reference_to_json(tag: &str, id: i64, path: &Option<Vec<PropertyKey>>) -> JsonValue {
    let mut arr = vec![
        JsonValue::String(tag.to_string()),
        JsonValue::Number(Number::from(id)),
    ];
    if let Some(path) = path {
        arr.push(PropertyKey::path_to_json(path));
    }
    JsonValue::Array(arr)
}

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("number is not representable")]
    InvalidNumber,

    #[error("invalid {0} expression")]
    InvalidForm(&'static str),

    #[error("invalid property path")]
    InvalidPropertyPath,

    #[error("bare array is neither a special form nor an escape")]
    UnescapedArray,

    #[error("unknown expression tag: {0}")]
    UnknownTag(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_expressions() {
        assert_eq!(Expression::from_json(&json!(null)).unwrap(), Expression::Null);
        assert_eq!(
            Expression::from_json(&json!(true)).unwrap(),
            Expression::Bool(true)
        );
        assert_eq!(
            Expression::from_json(&json!(42)).unwrap(),
            Expression::Number(42.0)
        );
        assert_eq!(
            Expression::from_json(&json!("hello")).unwrap(),
            Expression::String("hello".to_string())
        );
    }

    #[test]
    fn test_integer_stays_integer_on_wire() {
        let expr = Expression::Number(42.0);
        assert_eq!(expr.to_json(), json!(42));
    }

    #[test]
    fn test_nonfinite_numbers() {
        let inf = Expression::Number(f64::INFINITY);
        assert_eq!(inf.to_json(), json!(["number", "Infinity"]));
        assert_eq!(Expression::from_json(&inf.to_json()).unwrap(), inf);

        let neg = Expression::Number(f64::NEG_INFINITY);
        assert_eq!(neg.to_json(), json!(["number", "-Infinity"]));

        let nan = Expression::from_json(&json!(["number", "NaN"])).unwrap();
        match nan {
            Expression::Number(v) => assert!(v.is_nan()),
            _ => panic!("expected number"),
        }
    }

    #[test]
    fn test_array_escaping_round_trip() {
        let expr = Expression::Array(vec![
            Expression::Number(1.0),
            Expression::Array(vec![Expression::String("bigint".into())]),
        ]);
        let json = expr.to_json();
        assert_eq!(json, json!([[1, [["bigint"]]]]));
        assert_eq!(Expression::from_json(&json).unwrap(), expr);
    }

    #[test]
    fn test_bare_array_is_rejected() {
        assert!(Expression::from_json(&json!([1, 2, 3])).is_err());
        assert!(Expression::from_json(&json!(["no-such-tag", 1])).is_err());
        assert!(Expression::from_json(&json!([])).is_err());
    }

    #[test]
    fn test_bigint_round_trip() {
        let expr = Expression::BigInt("-170141183460469231731687303715884105728".into());
        let json = expr.to_json();
        assert_eq!(Expression::from_json(&json).unwrap(), expr);
        assert!(Expression::from_json(&json!(["bigint", "12x"])).is_err());
    }

    #[test]
    fn test_bytes_round_trip() {
        let expr = Expression::Bytes(vec![0, 1, 254, 255]);
        let json = expr.to_json();
        assert_eq!(json, json!(["bytes", "AAH+/w=="]));
        assert_eq!(Expression::from_json(&json).unwrap(), expr);

        let empty = Expression::Bytes(vec![]);
        assert_eq!(Expression::from_json(&empty.to_json()).unwrap(), empty);
    }

    #[test]
    fn test_error_expression() {
        let json = json!(["error", "TypeError", "boom", "at line 1"]);
        let expr = Expression::from_json(&json).unwrap();
        match &expr {
            Expression::Error(err) => {
                assert_eq!(err.name, "TypeError");
                assert_eq!(err.message, "boom");
                assert_eq!(err.stack.as_deref(), Some("at line 1"));
            }
            _ => panic!("expected error expression"),
        }
        assert_eq!(expr.to_json(), json);
    }

    #[test]
    fn test_raw_passthrough() {
        let payload = json!({"weird": [1, {"deep": ["bigint", "not-a-tag-here"]}]});
        let expr = Expression::Raw(payload.clone());
        let json = expr.to_json();
        assert_eq!(json, json!(["raw", payload]));
        assert_eq!(Expression::from_json(&json).unwrap(), expr);
    }

    #[test]
    fn test_pipeline_with_args() {
        let json = json!(["pipeline", 1, ["add"], [5, 3]]);
        let expr = Expression::from_json(&json).unwrap();
        match &expr {
            Expression::Pipeline { id, path, args } => {
                assert_eq!(*id, ImportId(1));
                assert_eq!(
                    path.as_deref(),
                    Some(&[PropertyKey::String("add".into())][..])
                );
                assert_eq!(args.as_ref().unwrap().len(), 2);
            }
            _ => panic!("expected pipeline"),
        }
        assert_eq!(expr.to_json(), json);
    }

    #[test]
    fn test_pipeline_args_without_path() {
        let expr = Expression::Pipeline {
            id: ImportId(3),
            path: None,
            args: Some(vec![Expression::Number(1.0)]),
        };
        assert_eq!(expr.to_json(), json!(["pipeline", 3, [], [1]]));
    }

    #[test]
    fn test_map_round_trip() {
        let json = json!(["map", 2, ["items"], ["import", -1]]);
        let expr = Expression::from_json(&json).unwrap();
        match &expr {
            Expression::Map { id, path, callback } => {
                assert_eq!(*id, ImportId(2));
                assert_eq!(
                    path.as_deref(),
                    Some(&[PropertyKey::String("items".into())][..])
                );
                assert_eq!(
                    **callback,
                    Expression::Import {
                        id: ImportId(-1),
                        path: None
                    }
                );
            }
            _ => panic!("expected map"),
        }
        assert_eq!(expr.to_json(), json);
    }

    #[test]
    fn test_reference_forms() {
        let json = json!(["export", -2, ["a", 0]]);
        let expr = Expression::from_json(&json).unwrap();
        assert_eq!(
            expr,
            Expression::Export {
                id: ExportId(-2),
                path: Some(vec![
                    PropertyKey::String("a".into()),
                    PropertyKey::Number(0)
                ]),
            }
        );
        assert_eq!(expr.to_json(), json);

        let promise = Expression::from_json(&json!(["promise", -4])).unwrap();
        assert_eq!(
            promise,
            Expression::Promise {
                id: ExportId(-4),
                path: None
            }
        );
    }

    #[test]
    fn test_undefined_round_trip() {
        let expr = Expression::Undefined;
        assert_eq!(expr.to_json(), json!(["undefined"]));
        assert_eq!(Expression::from_json(&expr.to_json()).unwrap(), expr);
    }
}
