use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Import ID - an entry in the import table.
///
/// IDs allocated by the side sending `push` are positive and sequential
/// (1, 2, 3...). IDs allocated when marshaling a capability into an outgoing
/// expression are negative. ID 0 names the peer's main capability. An import
/// ID on one side corresponds to the export ID with the same value on the
/// other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportId(pub i64);

impl ImportId {
    /// The peer's main capability.
    pub fn main() -> Self {
        ImportId(0)
    }

    pub fn is_main(&self) -> bool {
        self.0 == 0
    }

    /// The matching entry in the peer's export table.
    pub fn as_export(&self) -> ExportId {
        ExportId(self.0)
    }
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Import#{}", self.0)
    }
}

/// Export ID - an entry in the export table.
///
/// Mirrors the peer's import table: positive IDs were chosen by the peer's
/// pushes, negative IDs by our own capability marshaling, 0 is our main.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportId(pub i64);

impl ExportId {
    /// Our own main capability.
    pub fn main() -> Self {
        ExportId(0)
    }

    pub fn is_main(&self) -> bool {
        self.0 == 0
    }

    /// The matching entry in the peer's import table.
    pub fn as_import(&self) -> ImportId {
        ImportId(self.0)
    }
}

impl fmt::Display for ExportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Export#{}", self.0)
    }
}

/// Allocates the two locally-owned ID ranges: positive sequential ids for
/// our pushes, negative sequential ids for capabilities we marshal out.
#[derive(Debug)]
pub struct IdAllocator {
    next_push: AtomicI64,
    next_marshal: AtomicI64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next_push: AtomicI64::new(1),
            next_marshal: AtomicI64::new(-1),
        }
    }

    /// Allocate the import ID naming the result of our next `push`.
    pub fn allocate_push(&self) -> ImportId {
        ImportId(self.next_push.fetch_add(1, Ordering::SeqCst))
    }

    /// Allocate the export ID for a capability marshaled into an outgoing
    /// expression.
    pub fn allocate_marshal(&self) -> ExportId {
        ExportId(self.next_marshal.fetch_sub(1, Ordering::SeqCst))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_ids() {
        assert!(ImportId::main().is_main());
        assert!(ExportId::main().is_main());
        assert_eq!(ImportId::main().0, 0);
    }

    #[test]
    fn test_mirroring() {
        assert_eq!(ImportId(5).as_export(), ExportId(5));
        assert_eq!(ExportId(-3).as_import(), ImportId(-3));
    }

    #[test]
    fn test_allocator_sequences() {
        let allocator = IdAllocator::new();
        assert_eq!(allocator.allocate_push(), ImportId(1));
        assert_eq!(allocator.allocate_push(), ImportId(2));
        assert_eq!(allocator.allocate_marshal(), ExportId(-1));
        assert_eq!(allocator.allocate_marshal(), ExportId(-2));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", ImportId(42)), "Import#42");
        assert_eq!(format!("{}", ExportId(-17)), "Export#-17");
    }
}
