// Session kernel.
//
// One cooperative read loop per session: receive -> decode -> dispatch.
// Dispatch never blocks; inbound pushes evaluate on spawned turns that
// settle the matching export entry and announce the resolution once a pull
// has asked for it. Stub releases arrive over a command channel so handles
// are safe to drop from any execution context; accumulated release counts
// are coalesced per id and flushed before other outbound traffic.

use super::codec::{Codec, TaggedCodec};
use super::devaluator::Devaluator;
use super::evaluator::{value_to_rpc_error, EvalError, Evaluator};
use super::expression::{ErrorExpression, Expression, PropertyKey};
use super::ids::{ExportId, IdAllocator, ImportId};
use super::message::Message;
use super::stub::{RpcPromise, Stub};
use super::tables::{ExportTable, ImportState, ImportTable};
use super::transport::RpcTransport;
use super::value::{ErrorValue, Value};
use crate::error::RpcError;
use crate::RpcTarget;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Hook applied to application errors before they are marshaled; errors
/// classified `error-raw` bypass it.
pub type SendErrorHook = Arc<dyn Fn(ErrorValue) -> ErrorValue + Send + Sync>;

pub struct SessionOptions {
    /// The capability exposed to the peer as import 0.
    pub main: Option<Arc<dyn RpcTarget>>,
    pub codec: Arc<dyn Codec>,
    pub on_send_error: Option<SendErrorHook>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            main: None,
            codec: Arc::new(TaggedCodec),
            on_send_error: None,
        }
    }
}

impl SessionOptions {
    pub fn with_main(main: impl RpcTarget + 'static) -> Self {
        SessionOptions {
            main: Some(Arc::new(main)),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opening,
    Active,
    Draining,
    Closed,
    Faulted,
}

pub(crate) enum Command {
    ReleaseImport(ImportId),
    ReleaseExport(ExportId),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct SessionCore {
    state: Mutex<SessionState>,
    terminal: Mutex<Option<RpcError>>,
    pub(crate) allocator: IdAllocator,
    pub(crate) imports: ImportTable,
    pub(crate) exports: ExportTable,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) on_send_error: Option<SendErrorHook>,
    transport: Arc<dyn RpcTransport>,
    outbound: mpsc::UnboundedSender<Message>,
    commands: mpsc::UnboundedSender<Command>,
    pending_releases: Mutex<BTreeMap<ImportId, u32>>,
    next_peer_push: AtomicI64,
}

impl SessionCore {
    pub(crate) fn state_now(&self) -> SessionState {
        *lock(&self.state)
    }

    fn set_state(&self, next: SessionState) {
        *lock(&self.state) = next;
    }

    pub(crate) fn terminal_error(&self) -> Option<RpcError> {
        lock(&self.terminal).clone()
    }

    /// Every new outbound operation passes through here; a faulted session
    /// rejects synchronously with its terminal error.
    fn check_callable(&self) -> Result<(), RpcError> {
        match self.state_now() {
            SessionState::Opening | SessionState::Active => Ok(()),
            SessionState::Draining | SessionState::Closed => {
                Err(RpcError::canceled("session is shutting down"))
            }
            SessionState::Faulted => Err(self
                .terminal_error()
                .unwrap_or_else(|| RpcError::aborted("session faulted"))),
        }
    }

    fn send_message(&self, msg: Message) {
        self.flush_releases();
        let _ = self.outbound.send(msg);
    }

    fn flush_releases(&self) {
        let drained: Vec<(ImportId, u32)> = {
            let mut pending = lock(&self.pending_releases);
            std::mem::take(&mut *pending).into_iter().collect()
        };
        for (id, count) in drained {
            trace!("release {} x{}", id, count);
            let _ = self.outbound.send(Message::Release(id, count));
        }
    }

    pub(crate) fn schedule_import_release(&self, id: ImportId) {
        if id.is_main() {
            return;
        }
        let _ = self.commands.send(Command::ReleaseImport(id));
    }

    pub(crate) fn schedule_export_release(&self, id: ExportId) {
        if id.is_main() {
            return;
        }
        let _ = self.commands.send(Command::ReleaseExport(id));
    }

    fn handle_command(&self, command: Command) {
        match command {
            Command::ReleaseImport(id) => {
                if let Some(wire_count) = self.imports.release_local(id) {
                    if wire_count > 0 {
                        lock(&self.pending_releases)
                            .entry(id)
                            .and_modify(|c| *c += wire_count)
                            .or_insert(wire_count);
                    }
                }
            }
            Command::ReleaseExport(id) => {
                // Local bookkeeping only; the peer's counts are untouched.
                // Entries may already be gone after a fault.
                if let Err(e) = self.exports.release(id, 1) {
                    debug!("local export release skipped: {}", e);
                }
            }
        }
    }

    // ---- outgoing operations -------------------------------------------

    pub(crate) fn push_expression(
        self: &Arc<Self>,
        expr: Expression,
    ) -> Result<RpcPromise, RpcError> {
        self.check_callable()?;
        let id = self.allocator.allocate_push();
        self.imports
            .insert_fresh(id)
            .map_err(|e| RpcError::internal(e.to_string()))?;
        debug!("push {} -> {:?}", id, expr);
        self.send_message(Message::Push(expr));
        Ok(RpcPromise::remote(Stub::adopt_import(self, id)))
    }

    /// Pipelined call: arguments marshal now, against a result that may not
    /// exist yet. Marshaling failures surface here and nothing is sent.
    pub(crate) fn push_call(
        self: &Arc<Self>,
        id: ImportId,
        path: Vec<PropertyKey>,
        args: Vec<Value>,
    ) -> Result<RpcPromise, RpcError> {
        self.check_callable()?;
        if self.imports.get(id).is_none() {
            return Err(RpcError::cap_revoked(format!("{} is disposed", id)));
        }
        let devaluator = Devaluator::new(self);
        let args = args
            .iter()
            .map(|a| devaluator.devaluate(a))
            .collect::<Result<Vec<_>, _>>()?;
        self.push_expression(Expression::Pipeline {
            id,
            path: Some(path),
            args: Some(args),
        })
    }

    pub(crate) fn push_projection(
        self: &Arc<Self>,
        id: ImportId,
        path: Vec<PropertyKey>,
    ) -> Result<RpcPromise, RpcError> {
        self.check_callable()?;
        if self.imports.get(id).is_none() {
            return Err(RpcError::cap_revoked(format!("{} is disposed", id)));
        }
        self.push_expression(Expression::Pipeline {
            id,
            path: Some(path),
            args: None,
        })
    }

    pub(crate) fn push_map(
        self: &Arc<Self>,
        id: ImportId,
        path: Vec<PropertyKey>,
        callback: Value,
    ) -> Result<RpcPromise, RpcError> {
        self.check_callable()?;
        if self.imports.get(id).is_none() {
            return Err(RpcError::cap_revoked(format!("{} is disposed", id)));
        }
        let callback = Devaluator::new(self).devaluate(&callback)?;
        self.push_expression(Expression::Map {
            id,
            path: if path.is_empty() { None } else { Some(path) },
            callback: Box::new(callback),
        })
    }

    /// Issue a pull (once per import) and wait for the resolution.
    pub(crate) async fn pull_and_wait(self: &Arc<Self>, id: ImportId) -> Result<Value, RpcError> {
        if let Some(terminal) = self.terminal_error() {
            return Err(terminal);
        }
        let entry = self
            .imports
            .get(id)
            .ok_or_else(|| RpcError::cap_revoked(format!("{} is disposed", id)))?;

        if entry.mark_pulled() {
            self.send_message(Message::Pull(id));
        }

        let mut rx = entry.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ImportState::Pending => {
                    rx.changed().await.map_err(|_| {
                        self.terminal_error()
                            .unwrap_or_else(|| RpcError::aborted("session is gone"))
                    })?;
                }
                ImportState::Resolved(v) => return Ok(v),
                ImportState::Rejected(e) => return Err(e),
            }
        }
    }

    /// Settle a marshal-side promise entry and announce it eagerly; the
    /// peer holds an unresolved import and is not expected to pull.
    pub(crate) fn resolve_marshal_promise(
        self: &Arc<Self>,
        id: ExportId,
        result: Result<Value, RpcError>,
    ) {
        if self.exports.resolve(id, result).is_ok() {
            self.announce(id);
        }
    }

    /// Emit the resolve/reject for a settled export, at most once.
    fn announce(self: &Arc<Self>, id: ExportId) {
        let Some(entry) = self.exports.get(id) else {
            return;
        };
        let state = entry.state_now();
        if matches!(state, super::tables::ExportState::Pending) {
            return;
        }
        if !entry.claim_announce() {
            return;
        }

        match state {
            super::tables::ExportState::Resolved(value) => {
                match Devaluator::new(self).devaluate(&value) {
                    Ok(expr) => self.send_message(Message::Resolve(id, expr)),
                    Err(e) => {
                        // The resolution itself cannot marshal; the promise
                        // rejects with the classification error instead.
                        self.send_message(Message::Reject(id, self.error_expr(&e)));
                    }
                }
            }
            super::tables::ExportState::Rejected(e) => {
                let expr = {
                    let mut ev = ErrorValue::from_rpc(&e);
                    if let Some(hook) = &self.on_send_error {
                        ev = hook(ev);
                    }
                    Expression::Error(ErrorExpression {
                        name: ev.name,
                        message: ev.message,
                        stack: ev.stack,
                    })
                };
                self.send_message(Message::Reject(id, expr));
            }
            super::tables::ExportState::Pending => unreachable!("checked above"),
        }
    }

    fn error_expr(&self, error: &RpcError) -> Expression {
        let ev = ErrorValue::from_rpc(error);
        Expression::Error(ErrorExpression {
            name: ev.name,
            message: ev.message,
            stack: ev.stack,
        })
    }

    // ---- inbound dispatch ----------------------------------------------

    fn dispatch(self: &Arc<Self>, msg: Message) {
        if self.state_now() == SessionState::Faulted {
            return;
        }
        trace!("dispatch {:?}", msg);

        match msg {
            Message::Push(expr) => {
                let id = ExportId(self.next_peer_push.fetch_add(1, Ordering::SeqCst));
                if self.exports.insert_pending(id).is_err() {
                    self.fault(
                        RpcError::internal(format!("push id collision on {}", id)),
                        true,
                    );
                    return;
                }
                let core = Arc::clone(self);
                tokio::spawn(async move {
                    let result = Evaluator::new(Arc::clone(&core)).evaluate(expr).await;
                    match result {
                        Ok(value) => core.settle_push(id, Ok(value)),
                        Err(EvalError::App(e)) => core.settle_push(id, Err(e)),
                        Err(EvalError::Protocol(e)) => core.fault(e, true),
                    }
                });
            }

            Message::Pull(id) => {
                let export_id = ExportId(id.0);
                let Some(entry) = self.exports.get(export_id) else {
                    self.fault(
                        RpcError::not_found(format!("pull for unknown {}", export_id)),
                        true,
                    );
                    return;
                };
                entry.mark_pulled();
                // Re-check after marking: the resolving turn may have
                // settled in between and seen the flag unset.
                if !matches!(entry.state_now(), super::tables::ExportState::Pending) {
                    self.announce(export_id);
                }
            }

            Message::Resolve(id, expr) => {
                let import_id = ImportId(id.0);
                let core = Arc::clone(self);
                tokio::spawn(async move {
                    match Evaluator::new(Arc::clone(&core)).evaluate(expr).await {
                        Ok(value) => {
                            let _ = core.imports.resolve(import_id, Ok(value));
                        }
                        Err(EvalError::App(e)) => {
                            let _ = core.imports.resolve(import_id, Err(e));
                        }
                        Err(EvalError::Protocol(e)) => core.fault(e, true),
                    }
                });
            }

            Message::Reject(id, expr) => {
                let import_id = ImportId(id.0);
                let core = Arc::clone(self);
                tokio::spawn(async move {
                    let error = match Evaluator::new(Arc::clone(&core)).evaluate(expr).await {
                        Ok(value) => value_to_rpc_error(&value),
                        Err(e) => e.into_inner(),
                    };
                    let _ = core.imports.resolve(import_id, Err(error));
                });
            }

            Message::Release(id, count) => {
                let export_id = ExportId(id.0);
                if let Err(e) = self.exports.release(export_id, count) {
                    // Refcount accounting violations indicate a protocol
                    // bug; the session cannot be trusted further.
                    self.fault(RpcError::internal(e.to_string()), true);
                }
            }

            Message::Abort(expr) => {
                let reason = match expr {
                    Expression::Error(err) => ErrorValue {
                        name: err.name,
                        message: err.message,
                        stack: err.stack,
                        raw: false,
                    }
                    .to_rpc(),
                    _ => RpcError::aborted("peer aborted the session"),
                };
                self.fault(reason, false);
            }
        }
    }

    fn settle_push(self: &Arc<Self>, id: ExportId, result: Result<Value, RpcError>) {
        let _ = self.exports.resolve(id, result);
        let Some(entry) = self.exports.get(id) else {
            return;
        };
        if entry.was_pulled() {
            self.announce(id);
        }
    }

    // ---- lifecycle ------------------------------------------------------

    pub(crate) fn fault(self: &Arc<Self>, error: RpcError, notify_peer: bool) {
        if self.state_now() == SessionState::Closed {
            return;
        }
        {
            let mut terminal = lock(&self.terminal);
            if terminal.is_some() {
                return;
            }
            *terminal = Some(error.clone());
        }
        warn!("session faulted: {}", error);
        self.set_state(SessionState::Faulted);

        if notify_peer {
            let _ = self.outbound.send(Message::Abort(self.error_expr(&error)));
        }

        self.imports.fault_all(&error);
        self.exports.fault_all(&error);
        lock(&self.pending_releases).clear();

        let transport = self.transport.clone();
        let reason = error.message.clone();
        tokio::spawn(async move {
            transport.abort(reason).await;
        });
    }

    fn handle_transport_closed(self: &Arc<Self>) {
        if self.state_now() == SessionState::Draining {
            self.set_state(SessionState::Closed);
            let error = RpcError::canceled("session closed");
            self.imports.fault_all(&error);
            self.exports.fault_all(&error);
        } else {
            self.fault(RpcError::aborted("connection closed"), false);
        }
    }
}

/// One live session over one transport.
pub struct RpcSession {
    pub(crate) core: Arc<SessionCore>,
}

impl RpcSession {
    /// Build a session over an open transport and return it together with a
    /// stub for the peer's main capability. Must be called within a tokio
    /// runtime; the read and write loops are spawned immediately.
    pub fn connect(
        transport: Arc<dyn RpcTransport>,
        options: SessionOptions,
    ) -> (RpcSession, Stub) {
        let SessionOptions {
            main,
            codec,
            on_send_error,
        } = options;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let core = Arc::new(SessionCore {
            state: Mutex::new(SessionState::Active),
            terminal: Mutex::new(None),
            allocator: IdAllocator::new(),
            imports: ImportTable::new(),
            exports: ExportTable::new(),
            codec: codec.clone(),
            on_send_error,
            transport: transport.clone(),
            outbound: outbound_tx,
            commands: commands_tx,
            pending_releases: Mutex::new(BTreeMap::new()),
            next_peer_push: AtomicI64::new(1),
        });

        if let Some(main) = main {
            let _ = core
                .exports
                .insert_resolved(ExportId::main(), Value::Target(main));
        }
        let _ = core.imports.insert_fresh(ImportId::main());

        tokio::spawn(write_loop(
            Arc::downgrade(&core),
            transport,
            codec,
            outbound_rx,
        ));
        tokio::spawn(read_loop(Arc::clone(&core), commands_rx));

        let main_stub = Stub::adopt_import(&core, ImportId::main());
        (RpcSession { core }, main_stub)
    }

    /// Another handle onto the peer's main capability.
    pub fn peer_main(&self) -> Stub {
        self.core.imports.add_local_ref(ImportId::main());
        Stub::adopt_import(&self.core, ImportId::main())
    }

    pub fn state(&self) -> SessionState {
        self.core.state_now()
    }

    /// The terminal error, once the session has faulted.
    pub fn terminal_error(&self) -> Option<RpcError> {
        self.core.terminal_error()
    }

    /// Orderly shutdown: new outbound calls fail, inbound traffic is still
    /// served until the peer goes away.
    pub fn shutdown(&self) {
        if self.core.state_now() == SessionState::Active {
            self.core.set_state(SessionState::Draining);
        }
    }

    /// Tear the transport down and reject everything still in flight.
    pub async fn close(&self) {
        self.shutdown();
        self.core.transport.abort("session closed".to_string()).await;
        if self.core.state_now() == SessionState::Draining {
            self.core.set_state(SessionState::Closed);
            let error = RpcError::canceled("session closed");
            self.core.imports.fault_all(&error);
            self.core.exports.fault_all(&error);
        }
    }

    pub fn import_count(&self) -> usize {
        self.core.imports.len()
    }

    pub fn export_count(&self) -> usize {
        self.core.exports.len()
    }

    /// True when the export table holds nothing but the main entry: every
    /// reference the peer held has been released.
    pub fn exports_at_rest(&self) -> bool {
        self.core.exports.at_rest()
    }
}

async fn read_loop(core: Arc<SessionCore>, mut commands: mpsc::UnboundedReceiver<Command>) {
    loop {
        tokio::select! {
            biased;

            command = commands.recv() => {
                let Some(command) = command else { break };
                core.handle_command(command);
                while let Ok(next) = commands.try_recv() {
                    core.handle_command(next);
                }
                core.flush_releases();
            }

            received = core.transport.receive() => {
                match received {
                    Ok(Some(frame)) => match core.codec.decode(&frame) {
                        Ok(batch) => {
                            for msg in batch {
                                core.dispatch(msg);
                            }
                        }
                        Err(e) => {
                            core.fault(
                                RpcError::bad_request(format!("decode error: {}", e)),
                                true,
                            );
                            break;
                        }
                    },
                    Ok(None) => {
                        core.handle_transport_closed();
                        break;
                    }
                    Err(e) => {
                        core.fault(
                            RpcError::aborted(format!("transport error: {}", e)),
                            false,
                        );
                        break;
                    }
                }
            }
        }

        if matches!(
            core.state_now(),
            SessionState::Faulted | SessionState::Closed
        ) {
            break;
        }
    }
    debug!("session read loop ended");
}

async fn write_loop(
    core: Weak<SessionCore>,
    transport: Arc<dyn RpcTransport>,
    codec: Arc<dyn Codec>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = outbound.recv().await {
        match codec.encode(std::slice::from_ref(&msg)) {
            Ok(frame) => {
                if let Err(e) = transport.send(frame).await {
                    if let Some(core) = core.upgrade() {
                        core.fault(
                            RpcError::aborted(format!("transport error: {}", e)),
                            false,
                        );
                    }
                    break;
                }
            }
            Err(e) => {
                if let Some(core) = core.upgrade() {
                    core.fault(RpcError::internal(format!("encode error: {}", e)), true);
                }
                break;
            }
        }
    }
    debug!("session write loop ended");
}
