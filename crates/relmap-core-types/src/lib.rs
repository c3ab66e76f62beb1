//! Core types shared across relmap facilities
//!
//! This crate provides foundational types used by both error handling
//! and logging facilities:
//!
//! - **Correlation types**: RequestId, TraceId, UnitOfWorkId, RequestContext
//! - **Sensitive data**: Sensitive<T> marker for redacting column values
//! - **Schema constants**: Canonical field keys and event names

pub mod correlation;
pub mod schema;
pub mod sensitive;

pub use correlation::{RequestContext, RequestId, TraceId, UnitOfWorkId};
pub use sensitive::Sensitive;
