//! `relmap.toml` configuration
//!
//! ```toml
//! [store]
//! path = "library.db"      # omit for an in-memory database
//! busy_timeout_ms = 5000
//! foreign_keys = true
//! journal_mode = "wal"
//!
//! [session]
//! max_in_params = 500
//! default_batch_size = 25
//!
//! [logging]
//! profile = "development"
//! filter = "relmap_core=debug"
//! ```
//!
//! Every section and every key is optional.

use std::fs;
use std::path::{Path, PathBuf};

use relmap_core::logging_facility::Profile;
use relmap_core::SessionConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{config_error, io_error, Result};

/// Connection settings of the SQLite store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file; `None` opens a private in-memory database
    pub path: Option<PathBuf>,
    /// How long a statement waits for a lock before failing with a timeout
    pub busy_timeout_ms: u64,
    pub foreign_keys: bool,
    /// `PRAGMA journal_mode` value; in-memory databases ignore it
    pub journal_mode: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5_000,
            foreign_keys: true,
            journal_mode: Some("wal".to_string()),
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub profile: Profile,
    /// `EnvFilter` directive replacing the profile default
    pub filter: Option<String>,
}

/// Whole configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelmapConfig {
    pub store: StoreConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

impl RelmapConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| config_error(&format!("invalid relmap.toml: {}", e)))
    }

    /// Load from a file. Relative store paths resolve against the file's
    /// directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| io_error("load_config", e))?;
        let mut config = Self::from_toml_str(&content)?;
        if let (Some(db), Some(dir)) = (&config.store.path, path.parent()) {
            if db.is_relative() {
                config.store.path = Some(dir.join(db));
            }
        }
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = RelmapConfig::from_toml_str("").unwrap();
        assert_eq!(config, RelmapConfig::default());
        assert_eq!(config.store.busy_timeout_ms, 5_000);
        assert!(config.store.foreign_keys);
        assert_eq!(config.session.max_in_params, 500);
        assert_eq!(config.logging.profile, Profile::Development);
    }

    #[test]
    fn test_sections_are_read() {
        let config = RelmapConfig::from_toml_str(
            r#"
[store]
path = "library.db"
busy_timeout_ms = 250

[session]
default_batch_size = 25

[logging]
profile = "production"
"#,
        )
        .unwrap();

        assert_eq!(config.store.path, Some(PathBuf::from("library.db")));
        assert_eq!(config.store.busy_timeout_ms, 250);
        assert_eq!(config.session.default_batch_size, Some(25));
        assert_eq!(config.logging.profile, Profile::Production);
    }

    #[test]
    fn test_unknown_profile_is_rejected() {
        let err = RelmapConfig::from_toml_str("[logging]\nprofile = \"verbose\"").unwrap_err();
        assert_eq!(err.op(), Some("load_config"));
    }
}
