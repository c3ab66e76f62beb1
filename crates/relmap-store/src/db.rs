//! Database connection management
//!
//! Provides utilities for opening and configuring SQLite connections

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::config::StoreConfig;
use crate::errors::{from_rusqlite, Result};

/// Open a SQLite database at the given path
pub fn open<P: AsRef<Path>>(path: P) -> Result<Connection> {
    Connection::open(path).map_err(from_rusqlite)
}

/// Open an in-memory SQLite database (for testing)
pub fn open_in_memory() -> Result<Connection> {
    Connection::open_in_memory().map_err(from_rusqlite)
}

/// Open the database named by the configuration and apply its settings
pub fn open_configured(config: &StoreConfig) -> Result<Connection> {
    let conn = match &config.path {
        Some(path) => open(path)?,
        None => open_in_memory()?,
    };
    configure(&conn, config)?;
    Ok(conn)
}

/// Apply connection settings
pub fn configure(conn: &Connection, config: &StoreConfig) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", config.foreign_keys)
        .map_err(from_rusqlite)?;

    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
        .map_err(from_rusqlite)?;

    if let Some(mode) = &config.journal_mode {
        // journal_mode answers with the mode actually in effect
        let effective: String = conn
            .pragma_update_and_check(None, "journal_mode", mode, |row| row.get(0))
            .map_err(from_rusqlite)?;
        tracing::debug!(requested = %mode, effective = %effective, "journal mode set");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_keys_enabled_by_default() {
        let conn = open_configured(&StoreConfig::in_memory()).unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_configured(&StoreConfig::file(dir.path().join("wal.db"))).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
    }
}
