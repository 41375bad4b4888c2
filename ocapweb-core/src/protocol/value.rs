use super::stub::{RpcPromise, Stub};
use crate::error::{ErrorCode, RpcError};
use crate::RpcTarget;
use bytes::Bytes;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Host values: everything the devaluator can marshal and the evaluator can
/// produce.
#[derive(Clone)]
pub enum Value {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    BigInt(String),
    String(String),
    Date(f64),
    Bytes(Bytes),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
    Error(ErrorValue),
    /// Passthrough subtree; never traversed, never registers capabilities.
    Raw(JsonValue),
    /// Handle to a capability, local or remote.
    Stub(Stub),
    /// Handle to a result that has not settled.
    Promise(RpcPromise),
    /// A local object to be exported on marshal.
    Target(Arc<dyn RpcTarget>),
    /// A local function to be exported on marshal; invoked with an empty
    /// method name.
    Function(Arc<dyn RpcTarget>),
    /// A host value no codec understands; classification `unsupported`.
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
    pub fn object<I, K>(entries: I) -> Value
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn bigint(digits: impl Into<String>) -> Value {
        Value::BigInt(digits.into())
    }

    pub fn bytes(data: impl Into<Bytes>) -> Value {
        Value::Bytes(data.into())
    }

    pub fn target(target: impl RpcTarget + 'static) -> Value {
        Value::Target(Arc::new(target))
    }

    /// Wrap a plain closure as an exportable function capability.
    pub fn from_fn<F>(f: F) -> Value
    where
        F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        Value::Function(Arc::new(FnTarget::new(f)))
    }

    /// Short name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Undefined => "undefined",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Error(_) => "error",
            Value::Raw(_) => "raw",
            Value::Stub(_) => "stub",
            Value::Promise(_) => "promise",
            Value::Target(_) => "target",
            Value::Function(_) => "function",
            Value::Opaque(_) => "opaque",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(v as f64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Undefined => write!(f, "Undefined"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::Number(v) => write!(f, "Number({})", v),
            Value::BigInt(v) => write!(f, "BigInt({})", v),
            Value::String(v) => write!(f, "String({:?})", v),
            Value::Date(v) => write!(f, "Date({})", v),
            Value::Bytes(v) => write!(f, "Bytes(len={})", v.len()),
            Value::Array(v) => f.debug_tuple("Array").field(v).finish(),
            Value::Object(v) => f.debug_tuple("Object").field(v).finish(),
            Value::Error(v) => f.debug_tuple("Error").field(v).finish(),
            Value::Raw(v) => write!(f, "Raw({})", v),
            Value::Stub(s) => write!(f, "Stub({:?})", s),
            Value::Promise(p) => write!(f, "Promise({:?})", p),
            Value::Target(t) => write!(f, "Target({:?})", t),
            Value::Function(t) => write!(f, "Function({:?})", t),
            Value::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

/// Error value carried through the protocol. `name` preserves the wire error
/// name even when it does not map onto a local [`ErrorCode`]. `raw` marks an
/// error that bypasses the `on_send_error` scrubbing hook.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub raw: bool,
}

impl ErrorValue {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorValue {
            name: name.into(),
            message: message.into(),
            stack: None,
            raw: false,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Mark the error to be sent verbatim, bypassing `on_send_error`.
    pub fn into_raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn from_rpc(err: &RpcError) -> Self {
        ErrorValue {
            name: err.code.wire_name().to_string(),
            message: err.message.clone(),
            stack: None,
            raw: false,
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        let code = ErrorCode::from_wire_name(&self.name);
        let mut data = serde_json::Map::new();
        data.insert("name".into(), JsonValue::String(self.name.clone()));
        if let Some(stack) = &self.stack {
            data.insert("stack".into(), JsonValue::String(stack.clone()));
        }
        RpcError::with_data(code, self.message.clone(), JsonValue::Object(data))
    }
}

impl From<RpcError> for ErrorValue {
    fn from(err: RpcError) -> Self {
        ErrorValue::from_rpc(&err)
    }
}

/// Kind-appropriate structural equality, used by tests and by nothing on the
/// hot path. NaN compares equal to NaN; capabilities compare by identity.
pub fn structurally_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Undefined, Value::Undefined) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => {
            (x.is_nan() && y.is_nan()) || x == y
        }
        (Value::BigInt(x), Value::BigInt(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Date(x), Value::Date(y)) => x == y,
        (Value::Bytes(x), Value::Bytes(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| structurally_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| structurally_equal(v, w)))
        }
        (Value::Error(x), Value::Error(y)) => {
            x.name == y.name && x.message == y.message && x.stack == y.stack
        }
        (Value::Raw(x), Value::Raw(y)) => x == y,
        (Value::Target(x), Value::Target(y)) => Arc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => Arc::ptr_eq(x, y),
        _ => false,
    }
}

type FnFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;

/// Adapter exposing a closure as a function capability: responds to an empty
/// method name (and the conventional "call"), rejects everything else.
pub struct FnTarget {
    f: Box<dyn Fn(Vec<Value>) -> FnFuture + Send + Sync>,
}

impl FnTarget {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        FnTarget {
            f: Box::new(move |args| {
                let result = f(args);
                Box::pin(async move { result })
            }),
        }
    }
}

impl fmt::Debug for FnTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnTarget")
    }
}

#[async_trait::async_trait]
impl RpcTarget for FnTarget {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        if method.is_empty() || method == "call" {
            (self.f)(args).await
        } else {
            Err(RpcError::not_found(format!(
                "function capability has no method {:?}",
                method
            )))
        }
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        Err(RpcError::not_found(format!(
            "function capability has no property {:?}",
            property
        )))
    }
}
