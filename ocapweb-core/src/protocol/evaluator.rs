// Evaluation: wire expressions back into host values.
//
// Inbound `["export", id]` allocates (or bumps) an import entry and yields a
// remote-backed stub; inbound `["import", id]` re-references one of our own
// exports; `["pipeline", ...]` and `["map", ...]` hand off to the pipelining
// engine, queueing behind the referenced entry if it has not settled.

use super::expression::Expression;
use super::ids::ExportId;
use super::pipeline;
use super::session::SessionCore;
use super::stub::{RpcPromise, Stub};
use super::tables::{ExportEntry, ExportState};
use super::value::{ErrorValue, Value};
use crate::error::RpcError;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::trace;

/// Evaluation failures come in two severities: an application error rejects
/// the current operation only; a protocol error (unknown ids, table
/// corruption) faults the whole session.
#[derive(Debug)]
pub(crate) enum EvalError {
    App(RpcError),
    Protocol(RpcError),
}

impl EvalError {
    pub(crate) fn into_inner(self) -> RpcError {
        match self {
            EvalError::App(e) | EvalError::Protocol(e) => e,
        }
    }
}

impl From<RpcError> for EvalError {
    fn from(e: RpcError) -> Self {
        EvalError::App(e)
    }
}

pub(crate) struct Evaluator {
    core: Arc<SessionCore>,
}

impl Evaluator {
    pub(crate) fn new(core: Arc<SessionCore>) -> Self {
        Evaluator { core }
    }

    pub(crate) fn evaluate(
        &self,
        expr: Expression,
    ) -> Pin<Box<dyn Future<Output = Result<Value, EvalError>> + Send + '_>> {
        Box::pin(async move {
            match expr {
                Expression::Null => Ok(Value::Null),
                Expression::Undefined => Ok(Value::Undefined),
                Expression::Bool(b) => Ok(Value::Bool(b)),
                Expression::Number(n) => Ok(Value::Number(n)),
                Expression::String(s) => Ok(Value::String(s)),
                Expression::BigInt(d) => Ok(Value::BigInt(d)),
                Expression::Date(ms) => Ok(Value::Date(ms)),
                Expression::Bytes(data) => Ok(Value::Bytes(Bytes::from(data))),
                Expression::Raw(json) => Ok(Value::Raw(json)),

                Expression::Error(err) => Ok(Value::Error(ErrorValue {
                    name: err.name,
                    message: err.message,
                    stack: err.stack,
                    raw: false,
                })),

                Expression::Array(elements) => {
                    let mut values = Vec::with_capacity(elements.len());
                    for elem in elements {
                        values.push(self.evaluate(elem).await?);
                    }
                    Ok(Value::Array(values))
                }

                Expression::Object(map) => {
                    let mut result = std::collections::HashMap::with_capacity(map.len());
                    for (key, val) in map {
                        let value = self.evaluate(val).await?;
                        result.insert(key, value);
                    }
                    Ok(Value::Object(result))
                }

                // The peer gives us a reference to a capability it holds.
                Expression::Export { id, path } => {
                    let import_id = id.as_import();
                    trace!("inbound export becomes {}", import_id);
                    self.core.imports.record_received(import_id);
                    let stub = Stub::adopt_import(&self.core, import_id)
                        .with_path(path.unwrap_or_default());
                    Ok(Value::Stub(stub))
                }

                // Same, but the referenced result has not settled; the peer
                // announces it with a later resolve/reject.
                Expression::Promise { id, path } => {
                    let import_id = id.as_import();
                    trace!("inbound promise becomes {}", import_id);
                    self.core.imports.record_received(import_id);
                    let stub = Stub::adopt_import(&self.core, import_id)
                        .with_path(path.unwrap_or_default());
                    Ok(Value::Promise(RpcPromise::remote(stub)))
                }

                // The peer re-references one of our own exports.
                Expression::Import { id, path } => {
                    let export_id = ExportId(id.0);
                    let entry = self.core.exports.get(export_id).ok_or_else(|| {
                        EvalError::Protocol(RpcError::not_found(format!(
                            "peer re-referenced unknown {}",
                            export_id
                        )))
                    })?;
                    let path = path.unwrap_or_default();

                    match entry.state_now() {
                        ExportState::Pending => {
                            let entry = entry.clone();
                            Ok(Value::Promise(RpcPromise::from_task(async move {
                                let base = wait_export(&entry).await?;
                                pipeline::project(base, &path).await
                            })))
                        }
                        ExportState::Resolved(value) => match value {
                            Value::Target(_) | Value::Function(_) => {
                                // The produced handle owns one more count on
                                // the entry; it is dropped locally when the
                                // handle goes.
                                self.core.exports.add_ref(export_id).map_err(|e| {
                                    EvalError::Protocol(RpcError::internal(e.to_string()))
                                })?;
                                let stub = Stub::adopt_export(&self.core, export_id)
                                    .with_path(path);
                                Ok(Value::Stub(stub))
                            }
                            other => pipeline::project(other, &path)
                                .await
                                .map_err(EvalError::App),
                        },
                        ExportState::Rejected(e) => Err(EvalError::App(e)),
                    }
                }

                // Projection of, or call through, the sender's import: our
                // export with the same id. Arguments are fully evaluated
                // before the call body runs.
                Expression::Pipeline { id, path, args } => {
                    let export_id = id.as_export();
                    let entry = self.core.exports.get(export_id).ok_or_else(|| {
                        EvalError::Protocol(RpcError::not_found(format!(
                            "pipeline references unknown {}",
                            export_id
                        )))
                    })?;

                    let arg_values = match args {
                        Some(exprs) => {
                            let mut values = Vec::with_capacity(exprs.len());
                            for expr in exprs {
                                values.push(self.evaluate(expr).await?);
                            }
                            Some(values)
                        }
                        None => None,
                    };

                    let base = wait_export(&entry).await.map_err(EvalError::App)?;
                    let path = path.unwrap_or_default();

                    match arg_values {
                        Some(args) => pipeline::call_on_value(base, path, args)
                            .await
                            .map_err(EvalError::App),
                        None => pipeline::project(base, &path)
                            .await
                            .map_err(EvalError::App),
                    }
                }

                Expression::Map { id, path, callback } => {
                    let export_id = id.as_export();
                    let entry = self.core.exports.get(export_id).ok_or_else(|| {
                        EvalError::Protocol(RpcError::not_found(format!(
                            "map references unknown {}",
                            export_id
                        )))
                    })?;

                    let callback = self.evaluate(*callback).await?;
                    let base = wait_export(&entry).await.map_err(EvalError::App)?;
                    let path = path.unwrap_or_default();
                    let projected = pipeline::project(base, &path)
                        .await
                        .map_err(EvalError::App)?;
                    pipeline::map_elements(projected, callback)
                        .await
                        .map_err(EvalError::App)
                }
            }
        })
    }
}

/// Wait until an export entry settles; queued pipelined operations resume
/// here when the resolution lands.
pub(crate) async fn wait_export(entry: &Arc<ExportEntry>) -> Result<Value, RpcError> {
    let mut rx = entry.subscribe();
    loop {
        let state = rx.borrow_and_update().clone();
        match state {
            ExportState::Pending => {
                rx.changed()
                    .await
                    .map_err(|_| RpcError::aborted("session is gone"))?;
            }
            ExportState::Resolved(v) => return Ok(v),
            ExportState::Rejected(e) => return Err(e),
        }
    }
}

/// Extract the rejection error a reject message carried.
pub(crate) fn value_to_rpc_error(value: &Value) -> RpcError {
    match value {
        Value::Error(e) => e.to_rpc(),
        other => RpcError::internal(format!(
            "promise rejected with a non-error value ({})",
            other.kind_name()
        )),
    }
}
