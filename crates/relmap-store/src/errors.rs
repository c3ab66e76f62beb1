//! Error handling for relmap-store
//!
//! Driver errors become [`StoreError`] at the `RowStore` boundary; the
//! helpers around it (connection setup, configuration, seed import) report
//! the structured `ExError` from relmap-core.

use relmap_core::errors::{ExError, ExErrorKind};
use relmap_core::{RelmapError, StoreError};
use rusqlite::ErrorCode;

/// Result type alias using ExError
pub type Result<T> = std::result::Result<T, ExError>;

/// Classify a driver error for the mapper
pub fn classify(err: &rusqlite::Error) -> StoreError {
    let message = err.to_string();
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation => StoreError::constraint(message),
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::timeout(message),
            ErrorCode::OperationInterrupted => StoreError::cancelled(message),
            _ => StoreError::other(message),
        },
        _ => StoreError::other(message),
    }
}

/// Create a database error from rusqlite::Error
pub fn from_rusqlite(err: rusqlite::Error) -> ExError {
    let kind = match classify(&err).kind() {
        relmap_core::StoreErrorKind::Timeout => ExErrorKind::Timeout,
        relmap_core::StoreErrorKind::Cancelled => ExErrorKind::Cancelled,
        relmap_core::StoreErrorKind::Constraint => ExErrorKind::ConstraintViolation,
        relmap_core::StoreErrorKind::Other => ExErrorKind::Persistence,
    };
    ExError::new(kind)
        .with_op("sqlite")
        .with_message(err.to_string())
}

/// Mapper errors raised while driving a unit of work from this crate
pub fn from_relmap(err: RelmapError) -> ExError {
    err.into()
}

/// Create a configuration error
pub fn config_error(reason: &str) -> ExError {
    ExError::new(ExErrorKind::InvalidInput)
        .with_op("load_config")
        .with_message(reason.to_string())
}

/// Create a seed validation error
pub fn seed_validation(reason: &str) -> ExError {
    ExError::new(ExErrorKind::InvalidInput)
        .with_op("seed_parse")
        .with_message(reason.to_string())
}

/// Create an IO error
pub fn io_error(operation: &str, err: std::io::Error) -> ExError {
    ExError::new(ExErrorKind::Persistence)
        .with_op(operation.to_string())
        .with_message(err.to_string())
}
