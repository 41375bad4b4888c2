// Devaluation: host values into wire expressions.
//
// Traversal is synchronous and never yields, so export allocations and
// refcount updates stay coherent with the rest of the turn. Capability
// registration happens here: marshaling a local target allocates (or
// reuses) an export entry, marshaling an import-backed stub emits a
// reference into the peer's own table.

use super::codec::Kind;
use super::expression::{ErrorExpression, Expression, PropertyKey};
use super::session::SessionCore;
use super::stub::{wait_local, PromiseInner, Stub, StubHook};
use super::value::{ErrorValue, Value};
use crate::error::RpcError;
use std::sync::Arc;
use tracing::trace;

/// Values nested deeper than this are assumed cyclic and rejected locally.
const MAX_DEPTH: usize = 64;

pub(crate) struct Devaluator<'a> {
    core: &'a Arc<SessionCore>,
}

impl<'a> Devaluator<'a> {
    pub(crate) fn new(core: &'a Arc<SessionCore>) -> Self {
        Devaluator { core }
    }

    pub(crate) fn devaluate(&self, value: &Value) -> Result<Expression, RpcError> {
        self.devaluate_at(value, 0)
    }

    fn devaluate_at(&self, value: &Value, depth: usize) -> Result<Expression, RpcError> {
        if depth > MAX_DEPTH {
            return Err(RpcError::bad_request(
                "value graph exceeds the marshaling depth limit",
            ));
        }

        let kind = self.core.codec.classify(value);
        trace!("devaluate {} as {:?}", value.kind_name(), kind);

        match kind {
            Kind::Unsupported => Err(RpcError::bad_request(format!(
                "cannot marshal unsupported value of kind {}",
                value.kind_name()
            ))),

            Kind::Primitive | Kind::Raw => Ok(match value {
                Value::Null => Expression::Null,
                Value::Undefined => Expression::Undefined,
                Value::Bool(b) => Expression::Bool(*b),
                Value::Number(n) => Expression::Number(*n),
                Value::String(s) => Expression::String(s.clone()),
                Value::BigInt(d) => Expression::BigInt(d.clone()),
                Value::Date(ms) => Expression::Date(*ms),
                Value::Bytes(b) => Expression::Bytes(b.to_vec()),
                Value::Error(e) => self.error_expression(e.clone(), true),
                other => {
                    return Err(RpcError::internal(format!(
                        "codec classified a {} as a scalar",
                        other.kind_name()
                    )))
                }
            }),

            Kind::Undefined => Ok(Expression::Undefined),
            Kind::BigInt => match value {
                Value::BigInt(d) => Ok(Expression::BigInt(d.clone())),
                _ => Err(classification_mismatch(value, kind)),
            },
            Kind::Date => match value {
                Value::Date(ms) => Ok(Expression::Date(*ms)),
                _ => Err(classification_mismatch(value, kind)),
            },
            Kind::Bytes => match value {
                Value::Bytes(b) => Ok(Expression::Bytes(b.to_vec())),
                _ => Err(classification_mismatch(value, kind)),
            },

            Kind::Array => match value {
                Value::Array(items) => {
                    let elements = items
                        .iter()
                        .map(|v| self.devaluate_at(v, depth + 1))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(Expression::Array(elements))
                }
                _ => Err(classification_mismatch(value, kind)),
            },

            Kind::Object => match value {
                Value::Object(map) => {
                    let mut out = std::collections::HashMap::with_capacity(map.len());
                    for (k, v) in map {
                        out.insert(k.clone(), self.devaluate_at(v, depth + 1)?);
                    }
                    Ok(Expression::Object(out))
                }
                _ => Err(classification_mismatch(value, kind)),
            },

            Kind::Error | Kind::ErrorRaw => match value {
                Value::Error(e) => Ok(self.error_expression(e.clone(), kind == Kind::Error)),
                _ => Err(classification_mismatch(value, kind)),
            },

            Kind::RawSubtree => match value {
                Value::Raw(json) => Ok(Expression::Raw(json.clone())),
                _ => Err(classification_mismatch(value, kind)),
            },

            Kind::RpcTarget | Kind::Function => {
                let id = self
                    .core
                    .exports
                    .export_capability(&self.core.allocator, value)
                    .map_err(|e| RpcError::internal(e.to_string()))?;
                Ok(Expression::Export { id, path: None })
            }

            Kind::Stub => match value {
                Value::Stub(stub) => self.devaluate_stub(stub),
                _ => Err(classification_mismatch(value, kind)),
            },

            Kind::RpcPromise | Kind::RpcThenable => match value {
                Value::Promise(promise) => self.devaluate_promise(promise),
                _ => Err(classification_mismatch(value, kind)),
            },
        }
    }

    fn devaluate_stub(&self, stub: &Stub) -> Result<Expression, RpcError> {
        let path = path_option(stub.path());

        match &stub.hook {
            StubHook::Local(target) => {
                let value = Value::Target(target.clone());
                let id = self
                    .core
                    .exports
                    .export_capability(&self.core.allocator, &value)
                    .map_err(|e| RpcError::internal(e.to_string()))?;
                Ok(Expression::Export { id, path })
            }

            StubHook::Import { session, id } => {
                self.check_same_session(session)?;
                Ok(Expression::Import { id: *id, path })
            }

            StubHook::Export { session, id } => {
                self.check_same_session(session)?;
                // Re-emitting our own export hands the peer one more
                // reference.
                self.core
                    .exports
                    .add_ref(*id)
                    .map_err(|_| RpcError::cap_revoked(format!("{} is disposed", id)))?;
                Ok(Expression::Export { id: *id, path })
            }
        }
    }

    fn devaluate_promise(
        &self,
        promise: &super::stub::RpcPromise,
    ) -> Result<Expression, RpcError> {
        match &promise.inner {
            // A pending push result on the peer: reference it symbolically.
            PromiseInner::Remote(stub) => match &stub.hook {
                StubHook::Import { session, id } => {
                    self.check_same_session(session)?;
                    Ok(Expression::Pipeline {
                        id: *id,
                        path: path_option(stub.path()),
                        args: None,
                    })
                }
                _ => Err(RpcError::internal("remote promise without import hook")),
            },

            // A locally running turn: allocate a marshal-side promise entry,
            // announce its resolution when the turn settles.
            PromiseInner::Local { rx, path } => {
                let (id, _entry) = self.core.exports.export_pending(&self.core.allocator);
                let core = Arc::clone(self.core);
                let mut rx = rx.clone();
                let path = path.clone();
                tokio::spawn(async move {
                    let result = match wait_local(&mut rx).await {
                        Ok(v) => super::pipeline::project(v, &path).await,
                        Err(e) => Err(e),
                    };
                    core.resolve_marshal_promise(id, result);
                });
                Ok(Expression::Promise { id, path: None })
            }
        }
    }

    fn error_expression(&self, mut error: ErrorValue, apply_hook: bool) -> Expression {
        if apply_hook {
            if let Some(hook) = &self.core.on_send_error {
                error = hook(error);
            }
        }
        Expression::Error(ErrorExpression {
            name: error.name,
            message: error.message,
            stack: error.stack,
        })
    }

    fn check_same_session(
        &self,
        session: &std::sync::Weak<SessionCore>,
    ) -> Result<(), RpcError> {
        let same = session
            .upgrade()
            .map(|s| Arc::ptr_eq(&s, self.core))
            .unwrap_or(false);
        if same {
            Ok(())
        } else {
            Err(RpcError::bad_request(
                "stub belongs to a different session",
            ))
        }
    }
}

fn path_option(path: &[PropertyKey]) -> Option<Vec<PropertyKey>> {
    if path.is_empty() {
        None
    } else {
        Some(path.to_vec())
    }
}

fn classification_mismatch(value: &Value, kind: Kind) -> RpcError {
    RpcError::internal(format!(
        "codec classified a {} as {:?}",
        value.kind_name(),
        kind
    ))
}
