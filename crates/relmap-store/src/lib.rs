//! Relmap Store - SQLite row store, configuration and seed import
//!
//! Provides:
//! - [`SqliteStore`], the `RowStore` implementation over rusqlite
//! - Connection setup (foreign keys, busy timeout, journal mode)
//! - `relmap.toml` configuration
//! - Seed format v0 parser and importer
//! - The demo domain used to compare fetch strategies

pub mod config;
pub mod db;
pub mod demo;
pub mod errors;
pub mod seed;
pub mod sqlite;

// Re-export key types
pub use config::{LoggingConfig, RelmapConfig, StoreConfig};
pub use errors::Result;
pub use sqlite::SqliteStore;
