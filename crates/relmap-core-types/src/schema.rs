//! Canonical schema constants for structured logging and events
//!
//! These constants ensure consistency across all logging and error reporting.

// Canonical field keys for structured logging
pub const FIELD_COMPONENT: &str = "component";
pub const FIELD_OP: &str = "op";
pub const FIELD_EVENT: &str = "event";
pub const FIELD_DURATION_MS: &str = "duration_ms";
pub const FIELD_REQUEST_ID: &str = "request_id";
pub const FIELD_UOW_ID: &str = "uow_id";

// Mapping identifiers
pub const FIELD_ENTITY_TYPE: &str = "entity_type";
pub const FIELD_ENTITY_KEY: &str = "entity_key";
pub const FIELD_RELATIONSHIP: &str = "relationship";

// SQL round-trips
pub const FIELD_SQL: &str = "sql";
pub const FIELD_PARAMS: &str = "params";
pub const FIELD_ROW_COUNT: &str = "row_count";

// Error fields
pub const FIELD_ERR_KIND: &str = "err.kind";
pub const FIELD_ERR_CODE: &str = "err.code";

// Canonical event names
pub const EVENT_START: &str = "start";
pub const EVENT_END: &str = "end";
pub const EVENT_END_ERROR: &str = "end_error";
