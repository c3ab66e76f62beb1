//! Logging initialization module

use std::sync::Once;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

const DEVELOPMENT_FILTER: &str = "relmap_core=debug,relmap_store=debug,relmap_cli=debug";
const PRODUCTION_FILTER: &str = "relmap_core=info,relmap_store=info,relmap_cli=info";

/// Logging profile configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Human-readable output, SQL statements at debug
    #[default]
    Development,
    /// JSON structured output with info level
    Production,
    /// Test capture mode for deterministic testing
    Test,
}

static INIT_ONCE: Once = Once::new();

/// Initialize the logging facility
///
/// Only the first call has an effect. `RUST_LOG` overrides the profile's
/// default filter.
///
/// # Example
///
/// ```
/// use relmap_core::logging_facility::{init, Profile};
///
/// init(Profile::Development);
/// ```
pub fn init(profile: Profile) {
    init_with_filter(profile, None);
}

/// Initialize with an explicit filter directive (e.g. from `relmap.toml`)
pub fn init_with_filter(profile: Profile, filter: Option<&str>) {
    INIT_ONCE.call_once(|| {
        let directive = |default: &str| {
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(default)))
        };
        match profile {
            Profile::Development => {
                tracing_subscriber::fmt()
                    .with_env_filter(directive(DEVELOPMENT_FILTER))
                    .init();
            }
            Profile::Production => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(directive(PRODUCTION_FILTER))
                    .init();
            }
            Profile::Test => {
                // Tests install their own capture layer via init_test_capture()
                tracing_subscriber::registry().init();
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_idempotent() {
        init(Profile::Test);
        init(Profile::Test);
        init_with_filter(Profile::Development, Some("relmap_core=trace"));
    }

    #[test]
    fn test_profile_parses_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            profile: Profile,
        }
        let w: Wrapper = serde_json::from_str(r#"{"profile":"production"}"#).unwrap();
        assert_eq!(w.profile, Profile::Production);
    }
}
