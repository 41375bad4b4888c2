// In-band cancellation.
//
// An abort signal crosses the session as an ordinary capability: the caller
// passes `controller.signal()` as an argument, the callee's method body
// calls `aborted()` through the received stub and races it against its own
// work. The core only guarantees delivery; cancellation semantics stay in
// user code.

use super::value::Value;
use crate::error::RpcError;
use crate::RpcTarget;
use tokio::sync::watch;

/// Caller-side handle. Firing it resolves every outstanding `aborted()`
/// call on the matching signal.
pub struct AbortController {
    tx: watch::Sender<Option<String>>,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        AbortController { tx }
    }

    /// The signal capability to pass as a call argument. Marshaling it
    /// exports it like any other target.
    pub fn signal(&self) -> Value {
        Value::target(AbortSignal {
            rx: self.tx.subscribe(),
        })
    }

    pub fn abort(&self, reason: impl Into<String>) {
        self.tx.send_replace(Some(reason.into()));
    }

    pub fn is_aborted(&self) -> bool {
        self.tx.borrow().is_some()
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct AbortSignal {
    rx: watch::Receiver<Option<String>>,
}

#[async_trait::async_trait]
impl RpcTarget for AbortSignal {
    async fn call(&self, method: &str, _args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            // Suspends until the controller fires, then resolves with the
            // reason. The callee races this promise against its work.
            "aborted" => {
                let mut rx = self.rx.clone();
                loop {
                    if let Some(reason) = rx.borrow_and_update().clone() {
                        return Ok(Value::String(reason));
                    }
                    rx.changed()
                        .await
                        .map_err(|_| RpcError::canceled("abort controller was dropped"))?;
                }
            }
            "isAborted" => Ok(Value::Bool(self.rx.borrow().is_some())),
            other => Err(RpcError::not_found(format!(
                "abort signal has no method {:?}",
                other
            ))),
        }
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        Err(RpcError::not_found(format!(
            "abort signal has no property {:?}",
            property
        )))
    }
}
