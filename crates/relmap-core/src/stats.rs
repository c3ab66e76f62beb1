//! Per-unit-of-work counters

use serde::Serialize;

/// Round-trip and write counters of one unit of work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// SELECT statements sent to the store
    pub queries_executed: u64,
    /// Write statements sent to the store
    pub statements_executed: u64,
    /// Entities materialised from rows (identity-map hits excluded)
    pub entities_loaded: u64,
    /// Collections initialised from the store
    pub collections_loaded: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub link_rows_inserted: u64,
    pub link_rows_deleted: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

impl Statistics {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
