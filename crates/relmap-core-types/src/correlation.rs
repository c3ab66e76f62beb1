//! Correlation types for request tracking and tracing
//!
//! A unit of work is tagged with a [`UnitOfWorkId`] and optionally with the
//! [`RequestContext`] of the caller, so that every SQL statement and every
//! lifecycle event it logs can be tied back to the request that caused it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! correlation_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Generate a new time-ordered identifier (UUIDv7)
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Get the string representation
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Create from an existing string (for deserialization)
            pub fn from_string(s: String) -> Self {
                Self(s)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

correlation_id!(
    /// Unique identifier for a single request or operation
    RequestId
);

correlation_id!(
    /// Trace identifier for distributed tracing across service boundaries
    TraceId
);

correlation_id!(
    /// Identifier of one unit of work (one persistence context)
    UnitOfWorkId
);

/// Context carried through operation boundaries for correlation
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub trace_id: Option<TraceId>,
}

impl RequestContext {
    /// Create a new context with a fresh RequestId
    pub fn new() -> Self {
        Self {
            request_id: RequestId::new(),
            trace_id: None,
        }
    }

    /// Create a context with an existing RequestId
    pub fn with_request_id(request_id: RequestId) -> Self {
        Self {
            request_id,
            trace_id: None,
        }
    }

    /// Add a TraceId to the context
    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_generation() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();

        assert_ne!(id1, id2);
        assert!(!id1.as_str().is_empty());
    }

    #[test]
    fn test_unit_of_work_ids_are_unique() {
        let first = UnitOfWorkId::new();
        let second = UnitOfWorkId::new();

        assert_ne!(first, second);
    }

    #[test]
    fn test_display_matches_as_str() {
        let id = TraceId::new();
        assert_eq!(format!("{}", id), id.as_str());
    }

    #[test]
    fn test_request_context_with_trace_id() {
        let trace_id = TraceId::new();
        let ctx = RequestContext::new().with_trace_id(trace_id.clone());

        assert_eq!(ctx.trace_id, Some(trace_id));
    }

    #[test]
    fn test_serialization() {
        let id = UnitOfWorkId::from_string("uow-1".to_string());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"uow-1\"");
        let back: UnitOfWorkId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
