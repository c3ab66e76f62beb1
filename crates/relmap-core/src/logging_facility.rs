//! Structured logging facility
//!
//! - Single initialization point via `init(profile)`
//! - Structured logging macros (`log_op_start!`, `log_op_end!`, `log_op_error!`)
//! - SQL statement logging with sensitive parameters redacted
//! - Test capture mode for deterministic assertions
//!
//! # Usage
//!
//! ```rust
//! use relmap_core::logging_facility::{init, Profile};
//!
//! // Initialize once at application startup
//! init(Profile::Development);
//! ```

pub mod init;
pub mod macros;
pub mod test_capture;

pub use init::{init, init_with_filter, Profile};
pub use test_capture::{init_test_capture, CapturedEvent, TestCapture};

use relmap_core_types::Sensitive;

use crate::model::Value;

/// Render statement parameters for a log line, redacting flagged positions
pub fn render_params(params: &[Value], redact: &[bool]) -> String {
    let rendered: Vec<String> = params
        .iter()
        .enumerate()
        .map(|(i, value)| {
            if redact.get(i).copied().unwrap_or(false) {
                Sensitive::new(value).to_string()
            } else {
                value.to_string()
            }
        })
        .collect();
    format!("[{}]", rendered.join(", "))
}
