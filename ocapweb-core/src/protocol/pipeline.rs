// Pipelining engine: property-path application over resolved values, call
// dispatch through whatever capability a path lands on, and the ordered map
// operation.
//
// The algebraic contract is resolve(P).follow(path) == resolve(P.follow(path)):
// walking a path over a settled value must agree with shipping the same path
// to the peer symbolically.

use super::expression::PropertyKey;
use super::value::Value;
use crate::error::RpcError;
use std::future::Future;
use std::pin::Pin;

type ValueFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send + 'a>>;

/// Walk `path` over `base`. Containers are indexed directly; landing on a
/// stub or promise turns the remaining segments into a symbolic path
/// extension; landing on a target asks it for the property.
pub(crate) fn project<'a>(base: Value, path: &'a [PropertyKey]) -> ValueFuture<'a> {
    Box::pin(async move {
        let Some((key, rest)) = path.split_first() else {
            return Ok(base);
        };

        match base {
            Value::Object(mut map) => {
                let key_str = match key {
                    PropertyKey::String(s) => s,
                    PropertyKey::Number(_) => {
                        return Err(RpcError::not_found(format!(
                            "no numeric property {} on an object",
                            key
                        )))
                    }
                };
                let next = map
                    .remove(key_str)
                    .ok_or_else(|| RpcError::not_found(format!("no property {:?}", key_str)))?;
                project(next, rest).await
            }

            Value::Array(mut items) => {
                let index = match key {
                    PropertyKey::Number(n) => *n,
                    PropertyKey::String(s) => {
                        return Err(RpcError::not_found(format!(
                            "no property {:?} on an array",
                            s
                        )))
                    }
                };
                if index >= items.len() {
                    return Err(RpcError::not_found(format!(
                        "index {} out of bounds (len {})",
                        index,
                        items.len()
                    )));
                }
                project(items.swap_remove(index), rest).await
            }

            // Remaining segments stay symbolic: no round trip, no await.
            Value::Stub(stub) => {
                let mut extended = stub;
                for key in path {
                    extended = extended.get(key.clone());
                }
                Ok(Value::Stub(extended))
            }
            Value::Promise(promise) => {
                let mut extended = promise;
                for key in path {
                    extended = extended.get(key.clone());
                }
                Ok(Value::Promise(extended))
            }

            // Reading a field off a target is the target's decision; method
            // only targets reject it rather than yielding undefined.
            Value::Target(target) | Value::Function(target) => {
                let key_str = match key {
                    PropertyKey::String(s) => s.as_str(),
                    PropertyKey::Number(_) => {
                        return Err(RpcError::not_found(format!(
                            "no numeric property {} on a capability",
                            key
                        )))
                    }
                };
                let next = target.get_property(key_str).await?;
                project(next, rest).await
            }

            other => Err(RpcError::bad_request(format!(
                "cannot read property {} of a {}",
                key,
                other.kind_name()
            ))),
        }
    })
}

/// Dispatch a call: walk everything but the last path segment, then invoke
/// the method it names. An empty path invokes `base` itself as a function.
pub(crate) async fn call_on_value(
    base: Value,
    path: Vec<PropertyKey>,
    args: Vec<Value>,
) -> Result<Value, RpcError> {
    let (receiver, method) = match path.split_last() {
        None => (base, String::new()),
        Some((last, prefix)) => {
            let method = match last {
                PropertyKey::String(s) => s.clone(),
                PropertyKey::Number(_) => {
                    return Err(RpcError::bad_request("method name must be a string"))
                }
            };
            (project(base, prefix).await?, method)
        }
    };

    dispatch(receiver, &method, args).await
}

/// Invoke `method` on whatever capability `receiver` is. Calls through
/// stubs/promises forward (and for remote hooks, pipeline) transparently.
pub(crate) async fn dispatch(
    receiver: Value,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, RpcError> {
    match receiver {
        Value::Target(target) | Value::Function(target) => target.call(method, args).await,
        Value::Stub(stub) => stub.call(method, args)?.pull().await,
        Value::Promise(promise) => promise.call(method, args)?.pull().await,
        other => Err(RpcError::bad_request(format!(
            "cannot call {:?} on a {}",
            method,
            other.kind_name()
        ))),
    }
}

/// Apply a callback capability to each element of an array, in order. The
/// result array preserves element order.
pub(crate) async fn map_elements(value: Value, callback: Value) -> Result<Value, RpcError> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(RpcError::bad_request(format!(
                "map target must be an array, got {}",
                other.kind_name()
            )))
        }
    };

    let mut mapped = Vec::with_capacity(items.len());
    for item in items {
        let out = dispatch(callback.clone(), "", vec![item]).await?;
        mapped.push(out);
    }
    Ok(Value::Array(mapped))
}
