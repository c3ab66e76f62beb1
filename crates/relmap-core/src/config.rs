//! Unit-of-work configuration

use serde::{Deserialize, Serialize};

/// Bound on bind parameters per statement. SQLite's compile-time default
/// limit is 999 on older builds.
pub const DEFAULT_MAX_IN_PARAMS: usize = 500;

/// Tunables of a unit of work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Largest `IN (...)` list a single statement may carry
    pub max_in_params: usize,
    /// Chunk size for to-many edges of fetch graphs without a per-path
    /// override. `None` loads all owners in one query, up to `max_in_params`.
    pub default_batch_size: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_in_params: DEFAULT_MAX_IN_PARAMS,
            default_batch_size: None,
        }
    }
}

impl SessionConfig {
    /// Effective chunk size for an `IN` load with the requested size
    pub fn chunk_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.max_in_params)
            .clamp(1, self.max_in_params.max(1))
    }
}
