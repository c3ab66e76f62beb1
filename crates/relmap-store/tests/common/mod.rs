#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::{Path, PathBuf};

use relmap_core::Registry;
use relmap_store::demo::{self, Strategy};
use relmap_store::{SqliteStore, StoreConfig};

/// In-memory store with the demo schema installed
pub fn demo_store() -> SqliteStore {
    let store = SqliteStore::in_memory().unwrap();
    demo::install_schema(store.connection()).unwrap();
    store
}

/// File-backed store with the demo schema installed
#[allow(dead_code)]
pub fn demo_file_store(path: &Path, busy_timeout_ms: u64) -> SqliteStore {
    let config = StoreConfig {
        busy_timeout_ms,
        ..StoreConfig::file(path)
    };
    let store = SqliteStore::open(&config).unwrap();
    demo::install_schema(store.connection()).unwrap();
    store
}

#[allow(dead_code)]
pub fn registry(strategy: Strategy) -> Registry {
    demo::registry(strategy).unwrap()
}

/// Row count of a table, read directly from the connection
#[allow(dead_code)]
pub fn count(store: &SqliteStore, table: &str) -> i64 {
    store
        .connection()
        .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
        .unwrap()
}

#[allow(dead_code)]
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}
