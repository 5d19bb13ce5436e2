use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::store::{FieldMap, TableEntries};

/// Write side of the runtime state store.
pub trait StateTable: Send + Sync {
    /// Merge `fields` into the entry at `key`.
    fn set(&self, key: &str, fields: FieldMap);

    /// Remove the entry at `key`.
    fn del(&self, key: &str);
}

/// State table handle shared between the reconciler and its workers.
pub type SharedStateTable = Arc<dyn StateTable>;

/// In-memory state table.
#[derive(Clone, Default)]
pub struct MemoryStateTable {
    entries: Arc<Mutex<TableEntries>>,
}

impl MemoryStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TableEntries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<FieldMap> {
        self.lock().get(key).cloned()
    }

    pub fn entries(&self) -> TableEntries {
        self.lock().clone()
    }
}

impl StateTable for MemoryStateTable {
    fn set(&self, key: &str, fields: FieldMap) {
        tracing::trace!(key, ?fields, "state set");
        self.lock()
            .entry(key.to_string())
            .or_default()
            .extend(fields);
    }

    fn del(&self, key: &str) {
        tracing::trace!(key, "state del");
        self.lock().remove(key);
    }
}

impl std::fmt::Debug for MemoryStateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStateTable")
            .field("entries", &self.lock().len())
            .finish()
    }
}
