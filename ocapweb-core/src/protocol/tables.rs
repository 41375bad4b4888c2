// Import/export table discipline.
//
// Each side owns an export table (capabilities it has given out) and an
// import table (capabilities it references on the peer). An import ID on one
// side corresponds to the export ID with the same value on the other.
//
// Import entries carry two counts: `local_refs` is the number of live local
// handles, `wire_refs` is the number of references the peer believes we
// hold. When the last local handle drops, a single release message carrying
// the accumulated wire count settles the books on both sides.

use super::ids::{ExportId, IdAllocator, ImportId};
use super::value::Value;
use crate::error::RpcError;
use crate::RpcTarget;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Resolution state of an import.
#[derive(Debug, Clone)]
pub enum ImportState {
    Pending,
    Resolved(Value),
    Rejected(RpcError),
}

#[derive(Debug)]
pub struct ImportEntry {
    pub id: ImportId,
    debug_id: Uuid,
    local_refs: AtomicU32,
    wire_refs: AtomicU32,
    pulled: AtomicBool,
    state: watch::Sender<ImportState>,
}

impl ImportEntry {
    fn new(id: ImportId) -> Self {
        let (state, _) = watch::channel(ImportState::Pending);
        ImportEntry {
            id,
            debug_id: Uuid::new_v4(),
            local_refs: AtomicU32::new(1),
            wire_refs: AtomicU32::new(1),
            pulled: AtomicBool::new(false),
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ImportState> {
        self.state.subscribe()
    }

    pub fn state_now(&self) -> ImportState {
        self.state.borrow().clone()
    }

    /// Returns true the first time only; a pull is sent at most once per
    /// import.
    pub fn mark_pulled(&self) -> bool {
        !self.pulled.swap(true, Ordering::SeqCst)
    }

    fn settle(&self, result: Result<Value, RpcError>) {
        let state = match result {
            Ok(v) => ImportState::Resolved(v),
            Err(e) => ImportState::Rejected(e),
        };
        self.state.send_replace(state);
    }
}

/// The import table: entries for every peer capability we reference.
pub struct ImportTable {
    entries: DashMap<ImportId, Arc<ImportEntry>>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert a freshly allocated entry (a push result, or the peer main).
    pub fn insert_fresh(&self, id: ImportId) -> Result<Arc<ImportEntry>, TableError> {
        let entry = Arc::new(ImportEntry::new(id));
        trace!("import {} created ({})", id, entry.debug_id);
        if self.entries.insert(id, entry.clone()).is_some() {
            return Err(TableError::DuplicateImport(id));
        }
        Ok(entry)
    }

    /// Record one inbound reference to `id`: a new entry with both counts at
    /// one, or one more local handle plus one more wire reference on an
    /// existing entry.
    pub fn record_received(&self, id: ImportId) -> Arc<ImportEntry> {
        let entry = self
            .entries
            .entry(id)
            .and_modify(|e| {
                e.local_refs.fetch_add(1, Ordering::SeqCst);
                e.wire_refs.fetch_add(1, Ordering::SeqCst);
            })
            .or_insert_with(|| Arc::new(ImportEntry::new(id)));
        entry.clone()
    }

    pub fn get(&self, id: ImportId) -> Option<Arc<ImportEntry>> {
        self.entries.get(&id).map(|e| e.clone())
    }

    /// One more local handle (stub duplication).
    pub fn add_local_ref(&self, id: ImportId) {
        if let Some(entry) = self.entries.get(&id) {
            entry.local_refs.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drop one local handle. When the last one goes, the entry is removed
    /// and the accumulated wire count is returned so the caller can schedule
    /// a release message.
    pub fn release_local(&self, id: ImportId) -> Option<u32> {
        let mut send_count = None;
        let mut remove = false;

        if let Some(entry) = self.entries.get(&id) {
            let prev = entry.local_refs.fetch_sub(1, Ordering::SeqCst);
            if prev == 0 {
                warn!("import {} local refcount underflow", id);
                entry.local_refs.store(0, Ordering::SeqCst);
            } else if prev == 1 {
                remove = true;
                send_count = Some(entry.wire_refs.load(Ordering::SeqCst));
            }
        }

        if remove {
            self.entries.remove(&id);
            debug!("import {} released (wire count {:?})", id, send_count);
        }
        send_count
    }

    pub fn resolve(&self, id: ImportId, result: Result<Value, RpcError>) -> Result<(), TableError> {
        let entry = self.get(id).ok_or(TableError::UnknownImport(id))?;
        entry.settle(result);
        Ok(())
    }

    /// Reject every entry with the terminal error and tear the table down.
    pub fn fault_all(&self, error: &RpcError) {
        for entry in self.entries.iter() {
            entry.settle(Err(error.clone()));
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ImportTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolution state of an export.
#[derive(Debug, Clone)]
pub enum ExportState {
    Pending,
    Resolved(Value),
    Rejected(RpcError),
}

#[derive(Debug)]
pub struct ExportEntry {
    pub id: ExportId,
    debug_id: Uuid,
    refcount: AtomicU32,
    pulled: AtomicBool,
    announced: AtomicBool,
    target_ptr: Option<usize>,
    state: watch::Sender<ExportState>,
}

impl ExportEntry {
    fn new(id: ExportId, state: ExportState, target_ptr: Option<usize>) -> Self {
        let (tx, _) = watch::channel(state);
        ExportEntry {
            id,
            debug_id: Uuid::new_v4(),
            refcount: AtomicU32::new(1),
            pulled: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            target_ptr,
            state: tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ExportState> {
        self.state.subscribe()
    }

    pub fn state_now(&self) -> ExportState {
        self.state.borrow().clone()
    }

    pub fn mark_pulled(&self) {
        self.pulled.store(true, Ordering::SeqCst);
    }

    pub fn was_pulled(&self) -> bool {
        self.pulled.load(Ordering::SeqCst)
    }

    /// A resolution is announced to the peer at most once; the first caller
    /// wins.
    pub fn claim_announce(&self) -> bool {
        !self.announced.swap(true, Ordering::SeqCst)
    }

    pub fn settle(&self, result: Result<Value, RpcError>) {
        let state = match result {
            Ok(v) => ExportState::Resolved(v),
            Err(e) => ExportState::Rejected(e),
        };
        self.state.send_replace(state);
    }
}

fn target_addr(target: &Arc<dyn RpcTarget>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

/// The export table: entries for every capability the peer can reference.
pub struct ExportTable {
    entries: DashMap<ExportId, Arc<ExportEntry>>,
    by_target: DashMap<usize, ExportId>,
}

impl ExportTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_target: DashMap::new(),
        }
    }

    /// Insert a pending entry for an inbound push result.
    pub fn insert_pending(&self, id: ExportId) -> Result<Arc<ExportEntry>, TableError> {
        let entry = Arc::new(ExportEntry::new(id, ExportState::Pending, None));
        trace!("export {} created pending ({})", id, entry.debug_id);
        if self.entries.insert(id, entry.clone()).is_some() {
            return Err(TableError::DuplicateExport(id));
        }
        Ok(entry)
    }

    /// Insert a settled entry (the main capability at construction).
    pub fn insert_resolved(&self, id: ExportId, value: Value) -> Result<(), TableError> {
        let entry = Arc::new(ExportEntry::new(id, ExportState::Resolved(value), None));
        if self.entries.insert(id, entry).is_some() {
            return Err(TableError::DuplicateExport(id));
        }
        Ok(())
    }

    /// Export a capability value (target or function), reusing the existing
    /// entry when the same object is marshaled twice.
    pub fn export_capability(
        &self,
        allocator: &IdAllocator,
        value: &Value,
    ) -> Result<ExportId, TableError> {
        let target = match value {
            Value::Target(t) | Value::Function(t) => t,
            _ => return Err(TableError::NotACapability),
        };

        let addr = target_addr(target);
        if let Some(existing) = self.by_target.get(&addr) {
            let id = *existing;
            if let Some(entry) = self.entries.get(&id) {
                entry.refcount.fetch_add(1, Ordering::SeqCst);
                trace!("export {} reused for target @{:x}", id, addr);
                return Ok(id);
            }
        }

        let id = allocator.allocate_marshal();
        let entry = Arc::new(ExportEntry::new(
            id,
            ExportState::Resolved(value.clone()),
            Some(addr),
        ));
        debug!("export {} allocated for target @{:x}", id, addr);
        self.entries.insert(id, entry);
        self.by_target.insert(addr, id);
        Ok(id)
    }

    /// Allocate a marshal-side entry for a value that has not settled yet
    /// (an outgoing `["promise", id]`).
    pub fn export_pending(&self, allocator: &IdAllocator) -> (ExportId, Arc<ExportEntry>) {
        let id = allocator.allocate_marshal();
        let entry = Arc::new(ExportEntry::new(id, ExportState::Pending, None));
        self.entries.insert(id, entry.clone());
        (id, entry)
    }

    pub fn get(&self, id: ExportId) -> Option<Arc<ExportEntry>> {
        self.entries.get(&id).map(|e| e.clone())
    }

    /// One more remote reference (the peer re-received this export, or
    /// re-referenced it with an inbound `["import", id]`).
    pub fn add_ref(&self, id: ExportId) -> Result<(), TableError> {
        self.entries
            .get(&id)
            .map(|entry| {
                entry.refcount.fetch_add(1, Ordering::SeqCst);
            })
            .ok_or(TableError::UnknownExport(id))
    }

    /// Give up `count` references. Returns true when the entry was removed.
    /// Releasing the main entry or more references than are outstanding is a
    /// protocol violation.
    pub fn release(&self, id: ExportId, count: u32) -> Result<bool, TableError> {
        if id.is_main() {
            return Err(TableError::MainReleased);
        }

        let entry = self.get(id).ok_or(TableError::UnknownExport(id))?;
        let current = entry.refcount.load(Ordering::SeqCst);
        if count > current {
            return Err(TableError::RefcountUnderflow(id));
        }

        let remaining = entry.refcount.fetch_sub(count, Ordering::SeqCst) - count;
        if remaining == 0 {
            self.entries.remove(&id);
            if let Some(addr) = entry.target_ptr {
                self.by_target.remove(&addr);
            }
            debug!("export {} removed", id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn resolve(&self, id: ExportId, result: Result<Value, RpcError>) -> Result<(), TableError> {
        let entry = self.get(id).ok_or(TableError::UnknownExport(id))?;
        entry.settle(result);
        Ok(())
    }

    /// Tear the table down; pending entries reject with the terminal error.
    pub fn fault_all(&self, error: &RpcError) {
        for entry in self.entries.iter() {
            if matches!(entry.state_now(), ExportState::Pending) {
                entry.settle(Err(error.clone()));
            }
        }
        self.entries.clear();
        self.by_target.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the only remaining entry (if any) is the main capability.
    pub fn at_rest(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| entry.key().is_main())
    }
}

impl Default for ExportTable {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("duplicate import ID: {0}")]
    DuplicateImport(ImportId),

    #[error("duplicate export ID: {0}")]
    DuplicateExport(ExportId),

    #[error("unknown import ID: {0}")]
    UnknownImport(ImportId),

    #[error("unknown export ID: {0}")]
    UnknownExport(ExportId),

    #[error("refcount underflow on export {0}")]
    RefcountUnderflow(ExportId),

    #[error("the main export is never released")]
    MainReleased,

    #[error("value is not an exportable capability")]
    NotACapability,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_release_reports_wire_count() {
        let table = ImportTable::new();
        let id = ImportId(1);
        table.insert_fresh(id).unwrap();

        // Received twice more from the wire, duplicated once locally.
        table.record_received(id);
        table.record_received(id);
        table.add_local_ref(id);

        // Four local handles, three wire references.
        assert_eq!(table.release_local(id), None);
        assert_eq!(table.release_local(id), None);
        assert_eq!(table.release_local(id), None);
        assert_eq!(table.release_local(id), Some(3));
        assert!(table.get(id).is_none());
    }

    #[test]
    fn test_import_resolution_broadcast() {
        let table = ImportTable::new();
        let entry = table.insert_fresh(ImportId(2)).unwrap();
        let mut rx = entry.subscribe();

        table
            .resolve(ImportId(2), Ok(Value::String("done".into())))
            .unwrap();

        match &*rx.borrow_and_update() {
            ImportState::Resolved(Value::String(s)) => assert_eq!(s, "done"),
            other => panic!("unexpected state: {:?}", other),
        };
    }

    #[test]
    fn test_export_release_and_underflow() {
        let table = ExportTable::new();
        let id = ExportId(1);
        table.insert_pending(id).unwrap();
        table.add_ref(id).unwrap();

        assert!(!table.release(id, 1).unwrap());
        assert!(matches!(
            table.release(id, 5),
            Err(TableError::RefcountUnderflow(_))
        ));
        assert!(table.release(id, 1).unwrap());
        assert!(table.get(id).is_none());
    }

    #[test]
    fn test_main_export_is_never_released() {
        let table = ExportTable::new();
        table
            .insert_resolved(ExportId::main(), Value::Null)
            .unwrap();
        assert!(matches!(
            table.release(ExportId::main(), 1),
            Err(TableError::MainReleased)
        ));
        assert!(table.at_rest());
    }

    #[test]
    fn test_export_capability_reuse() {
        let table = ExportTable::new();
        let allocator = IdAllocator::new();
        let value = Value::from_fn(|_| Ok(Value::Null));

        let a = table.export_capability(&allocator, &value).unwrap();
        let b = table.export_capability(&allocator, &value).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);

        // Two outstanding references: two releases to drop it.
        assert!(!table.release(a, 1).unwrap());
        assert!(table.release(a, 1).unwrap());
        assert!(table.is_empty());
    }

    #[test]
    fn test_fault_all_rejects_pending() {
        let table = ExportTable::new();
        let entry = table.insert_pending(ExportId(3)).unwrap();
        let mut rx = entry.subscribe();

        table.fault_all(&RpcError::aborted("gone"));
        assert!(table.is_empty());
        match &*rx.borrow_and_update() {
            ExportState::Rejected(err) => assert_eq!(err.message, "gone"),
            other => panic!("unexpected state: {:?}", other),
        };
    }
}
