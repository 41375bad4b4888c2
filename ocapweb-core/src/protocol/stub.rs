// Stub and promise handles.
//
// A stub is a cheap handle to a capability: a hook (local target, remote
// import, or a re-referenced local export) plus a property path. Cloning a
// stub duplicates the reference (one more table count); dropping it releases
// the reference, enqueued through the session so a drop from any execution
// context is safe.

use super::expression::PropertyKey;
use super::ids::{ExportId, ImportId};
use super::pipeline;
use super::session::SessionCore;
use super::tables::ExportState;
use super::value::Value;
use crate::error::RpcError;
use crate::RpcTarget;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::watch;

#[derive(Clone)]
pub(crate) enum StubHook {
    /// A plain local object, not (yet) in any table.
    Local(Arc<dyn RpcTarget>),
    /// A capability the peer exported to us.
    Import {
        session: Weak<SessionCore>,
        id: ImportId,
    },
    /// One of our own exports, re-referenced by the peer.
    Export {
        session: Weak<SessionCore>,
        id: ExportId,
    },
}

pub struct Stub {
    pub(crate) hook: StubHook,
    pub(crate) path: Vec<PropertyKey>,
}

impl Stub {
    /// Wrap a local object. It is exported on first marshal.
    pub fn local(target: impl RpcTarget + 'static) -> Stub {
        Stub {
            hook: StubHook::Local(Arc::new(target)),
            path: Vec::new(),
        }
    }

    /// Build a handle onto an import entry. The caller is responsible for
    /// having counted the reference this handle owns.
    pub(crate) fn adopt_import(session: &Arc<SessionCore>, id: ImportId) -> Stub {
        Stub {
            hook: StubHook::Import {
                session: Arc::downgrade(session),
                id,
            },
            path: Vec::new(),
        }
    }

    /// Build a handle onto one of our own export entries; same counting
    /// contract as [`Stub::adopt_import`].
    pub(crate) fn adopt_export(session: &Arc<SessionCore>, id: ExportId) -> Stub {
        Stub {
            hook: StubHook::Export {
                session: Arc::downgrade(session),
                id,
            },
            path: Vec::new(),
        }
    }

    pub(crate) fn with_path(mut self, path: Vec<PropertyKey>) -> Stub {
        self.path = path;
        self
    }

    pub fn path(&self) -> &[PropertyKey] {
        &self.path
    }

    pub(crate) fn import_id(&self) -> Option<ImportId> {
        match &self.hook {
            StubHook::Import { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Explicitly duplicate the handle, extending the lifetime of the
    /// underlying reference.
    pub fn dup(&self) -> Stub {
        self.clone()
    }

    /// Symbolic property access: a new handle sharing the same entry with
    /// the path extended. The original is untouched.
    pub fn get(&self, key: impl Into<PropertyKey>) -> Stub {
        let mut next = self.clone();
        next.path.push(key.into());
        next
    }

    /// Resolve the value this handle's path points at: a property read, as a
    /// promise. Remote-backed stubs push a projection; local stubs walk the
    /// path on a spawned turn.
    pub fn fetch(&self) -> Result<RpcPromise, RpcError> {
        match &self.hook {
            StubHook::Import { session, id } => {
                let core = session
                    .upgrade()
                    .ok_or_else(|| RpcError::aborted("session is gone"))?;
                core.push_projection(*id, self.path.clone())
            }
            StubHook::Local(target) => {
                let base = Value::Target(target.clone());
                let path = self.path.clone();
                Ok(RpcPromise::from_task(async move {
                    pipeline::project(base, &path).await
                }))
            }
            StubHook::Export { session, id } => {
                let core = session
                    .upgrade()
                    .ok_or_else(|| RpcError::aborted("session is gone"))?;
                let entry = core
                    .exports
                    .get(*id)
                    .ok_or_else(|| RpcError::cap_revoked(format!("{} is disposed", id)))?;
                let mut rx = entry.subscribe();
                let path = self.path.clone();
                Ok(RpcPromise::from_task(async move {
                    let base = loop {
                        let state = rx.borrow_and_update().clone();
                        match state {
                            ExportState::Pending => {
                                rx.changed()
                                    .await
                                    .map_err(|_| RpcError::aborted("session is gone"))?;
                            }
                            ExportState::Resolved(v) => break v,
                            ExportState::Rejected(e) => return Err(e),
                        }
                    };
                    pipeline::project(base, &path).await
                }))
            }
        }
    }

    /// Invoke a method through this stub. Remote-backed stubs pipeline the
    /// call without waiting for anything to resolve; local stubs dispatch on
    /// a spawned turn. Marshaling failures (unsupported argument values)
    /// surface here and nothing is sent.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<RpcPromise, RpcError> {
        let mut path = self.path.clone();
        path.push(PropertyKey::String(method.to_string()));

        match &self.hook {
            StubHook::Import { session, id } => {
                let core = session
                    .upgrade()
                    .ok_or_else(|| RpcError::aborted("session is gone"))?;
                core.push_call(*id, path, args)
            }
            StubHook::Local(target) => {
                let base = Value::Target(target.clone());
                Ok(RpcPromise::from_task(pipeline::call_on_value(
                    base, path, args,
                )))
            }
            StubHook::Export { session, id } => {
                let core = session
                    .upgrade()
                    .ok_or_else(|| RpcError::aborted("session is gone"))?;
                let entry = core
                    .exports
                    .get(*id)
                    .ok_or_else(|| RpcError::cap_revoked(format!("{} is disposed", id)))?;
                let mut rx = entry.subscribe();
                Ok(RpcPromise::from_task(async move {
                    let base = loop {
                        let state = rx.borrow_and_update().clone();
                        match state {
                            ExportState::Pending => {
                                rx.changed().await.map_err(|_| {
                                    RpcError::aborted("session is gone")
                                })?;
                            }
                            ExportState::Resolved(v) => break v,
                            ExportState::Rejected(e) => return Err(e),
                        }
                    };
                    pipeline::call_on_value(base, path, args).await
                }))
            }
        }
    }

    /// Eagerly release this handle.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Clone for Stub {
    fn clone(&self) -> Stub {
        match &self.hook {
            StubHook::Local(_) => {}
            StubHook::Import { session, id } => {
                if let Some(core) = session.upgrade() {
                    core.imports.add_local_ref(*id);
                }
            }
            StubHook::Export { session, id } => {
                if let Some(core) = session.upgrade() {
                    let _ = core.exports.add_ref(*id);
                }
            }
        }
        Stub {
            hook: self.hook.clone(),
            path: self.path.clone(),
        }
    }
}

impl Drop for Stub {
    fn drop(&mut self) {
        match &self.hook {
            StubHook::Local(_) => {}
            StubHook::Import { session, id } => {
                if let Some(core) = session.upgrade() {
                    core.schedule_import_release(*id);
                }
            }
            StubHook::Export { session, id } => {
                if let Some(core) = session.upgrade() {
                    core.schedule_export_release(*id);
                }
            }
        }
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hook = match &self.hook {
            StubHook::Local(_) => "local".to_string(),
            StubHook::Import { id, .. } => format!("{}", id),
            StubHook::Export { id, .. } => format!("{}", id),
        };
        write!(f, "Stub({}, path={:?})", hook, self.path)
    }
}

impl From<&str> for PropertyKey {
    fn from(s: &str) -> Self {
        PropertyKey::String(s.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(s: String) -> Self {
        PropertyKey::String(s)
    }
}

impl From<usize> for PropertyKey {
    fn from(n: usize) -> Self {
        PropertyKey::Number(n)
    }
}

pub(crate) type LocalResult = Option<Result<Value, RpcError>>;

#[derive(Clone)]
pub(crate) enum PromiseInner {
    /// An unresolved push result on the peer; the stub's hook is always an
    /// import.
    Remote(Stub),
    /// A locally running turn; `path` is applied after it settles.
    Local {
        rx: watch::Receiver<LocalResult>,
        path: Vec<PropertyKey>,
    },
}

/// A stub whose target has not resolved. Calls and property accesses chain
/// without waiting; `pull` asks the peer for the resolution.
pub struct RpcPromise {
    pub(crate) inner: PromiseInner,
}

impl RpcPromise {
    pub(crate) fn remote(stub: Stub) -> RpcPromise {
        RpcPromise {
            inner: PromiseInner::Remote(stub),
        }
    }

    /// Run a local turn and expose its eventual result as a promise.
    pub(crate) fn from_task<F>(task: F) -> RpcPromise
    where
        F: std::future::Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let result = task.await;
            tx.send_replace(Some(result));
        });
        RpcPromise {
            inner: PromiseInner::Local {
                rx,
                path: Vec::new(),
            },
        }
    }

    /// Path extension; symbolic, no round trip.
    pub fn get(&self, key: impl Into<PropertyKey>) -> RpcPromise {
        let key = key.into();
        match &self.inner {
            PromiseInner::Remote(stub) => RpcPromise::remote(stub.get(key)),
            PromiseInner::Local { rx, path } => {
                let mut path = path.clone();
                path.push(key);
                RpcPromise {
                    inner: PromiseInner::Local {
                        rx: rx.clone(),
                        path,
                    },
                }
            }
        }
    }

    /// Pipelined call on the unresolved result.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<RpcPromise, RpcError> {
        match &self.inner {
            PromiseInner::Remote(stub) => stub.call(method, args),
            PromiseInner::Local { rx, path } => {
                let mut rx = rx.clone();
                let mut path = path.clone();
                path.push(PropertyKey::String(method.to_string()));
                Ok(RpcPromise::from_task(async move {
                    let base = wait_local(&mut rx).await?;
                    pipeline::call_on_value(base, path, args).await
                }))
            }
        }
    }

    /// Apply a callback capability to each element of the array this promise
    /// resolves to. The peer runs the callback without further round trips.
    pub fn map(&self, callback: Value) -> Result<RpcPromise, RpcError> {
        match &self.inner {
            PromiseInner::Remote(stub) => {
                let (session, id) = match &stub.hook {
                    StubHook::Import { session, id } => (session, *id),
                    _ => return Err(RpcError::bad_request("map requires a remote promise")),
                };
                let core = session
                    .upgrade()
                    .ok_or_else(|| RpcError::aborted("session is gone"))?;
                core.push_map(id, stub.path.clone(), callback)
            }
            PromiseInner::Local { rx, path } => {
                let mut rx = rx.clone();
                let path = path.clone();
                Ok(RpcPromise::from_task(async move {
                    let base = wait_local(&mut rx).await?;
                    let projected = pipeline::project(base, &path).await?;
                    pipeline::map_elements(projected, callback).await
                }))
            }
        }
    }

    /// Request the resolution and wait for it. Issues at most one `pull` per
    /// import; a promise with a pending path first pushes the projection.
    pub async fn pull(&self) -> Result<Value, RpcError> {
        let mut current = self.clone();
        loop {
            let next = match &current.inner {
                PromiseInner::Remote(stub) => {
                    let (session, id) = match &stub.hook {
                        StubHook::Import { session, id } => (session, *id),
                        _ => return Err(RpcError::internal("remote promise without import hook")),
                    };
                    let core = session
                        .upgrade()
                        .ok_or_else(|| RpcError::aborted("session is gone"))?;
                    if stub.path.is_empty() {
                        return core.pull_and_wait(id).await;
                    }
                    core.push_projection(id, stub.path.clone())?
                }
                PromiseInner::Local { rx, path } => {
                    let mut rx = rx.clone();
                    let base = wait_local(&mut rx).await?;
                    let value = pipeline::project(base, path).await?;
                    match value {
                        Value::Promise(p) => p,
                        other => return Ok(other),
                    }
                }
            };
            current = next;
        }
    }

    /// Eagerly release the handle without pulling.
    pub fn dispose(self) {
        drop(self);
    }
}

pub(crate) async fn wait_local(rx: &mut watch::Receiver<LocalResult>) -> Result<Value, RpcError> {
    loop {
        if let Some(result) = rx.borrow_and_update().clone() {
            return result;
        }
        rx.changed()
            .await
            .map_err(|_| RpcError::canceled("local turn was dropped"))?;
    }
}

impl Clone for RpcPromise {
    fn clone(&self) -> RpcPromise {
        RpcPromise {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for RpcPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            PromiseInner::Remote(stub) => write!(f, "RpcPromise({:?})", stub),
            PromiseInner::Local { path, .. } => write!(f, "RpcPromise(local, path={:?})", path),
        }
    }
}
