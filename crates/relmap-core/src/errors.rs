use relmap_core_types::{RequestId, UnitOfWorkId};
use thiserror::Error;

use crate::store::{StoreError, StoreErrorKind};

/// Result type alias using RelmapError
pub type Result<T> = std::result::Result<T, RelmapError>;

// ========== Error Facility ==========

/// Canonical error kind taxonomy
///
/// Each kind maps to a stable error code that can be used for programmatic
/// error handling, testing and log correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExErrorKind {
    // Registry (fatal at startup)
    DuplicateMapping,
    UnresolvedReference,
    InvalidMapping,

    // Caller errors
    InvalidInput,
    NotFound,
    AlreadyExists,
    UnsupportedFetchGraph,
    InvalidState,

    // Lifecycle
    LazyInitialization,
    TransientObject,
    Closed,

    // Store
    ConstraintViolation,
    Persistence,
    Timeout,
    Cancelled,
    Serialization,

    // Internal
    Internal,
}

impl ExErrorKind {
    /// Get the stable error code for this kind
    pub fn code(&self) -> &'static str {
        match self {
            ExErrorKind::DuplicateMapping => "ERR_DUPLICATE_MAPPING",
            ExErrorKind::UnresolvedReference => "ERR_UNRESOLVED_REFERENCE",
            ExErrorKind::InvalidMapping => "ERR_INVALID_MAPPING",
            ExErrorKind::InvalidInput => "ERR_INVALID_INPUT",
            ExErrorKind::NotFound => "ERR_NOT_FOUND",
            ExErrorKind::AlreadyExists => "ERR_ALREADY_EXISTS",
            ExErrorKind::UnsupportedFetchGraph => "ERR_UNSUPPORTED_FETCH_GRAPH",
            ExErrorKind::InvalidState => "ERR_INVALID_STATE",
            ExErrorKind::LazyInitialization => "ERR_LAZY_INITIALIZATION",
            ExErrorKind::TransientObject => "ERR_TRANSIENT_OBJECT",
            ExErrorKind::Closed => "ERR_UNIT_OF_WORK_CLOSED",
            ExErrorKind::ConstraintViolation => "ERR_CONSTRAINT_VIOLATION",
            ExErrorKind::Persistence => "ERR_PERSISTENCE",
            ExErrorKind::Timeout => "ERR_TIMEOUT",
            ExErrorKind::Cancelled => "ERR_CANCELLED",
            ExErrorKind::Serialization => "ERR_SERIALIZATION",
            ExErrorKind::Internal => "ERR_INTERNAL",
        }
    }

    /// Whether an error of this kind is fatal at startup rather than per-operation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExErrorKind::DuplicateMapping
                | ExErrorKind::UnresolvedReference
                | ExErrorKind::InvalidMapping
        )
    }
}

/// Canonical structured error type
///
/// Carries the classification plus mapping context (entity type, key,
/// relationship) for logs and programmatic handling.
#[derive(Debug, Clone)]
pub struct ExError {
    kind: ExErrorKind,
    op: Option<String>,
    entity_type: Option<String>,
    entity_key: Option<String>,
    relationship: Option<String>,
    request_id: Option<RequestId>,
    uow_id: Option<UnitOfWorkId>,
    message: String,
}

impl ExError {
    /// Create a new error with the specified kind
    pub fn new(kind: ExErrorKind) -> Self {
        Self {
            kind,
            op: None,
            entity_type: None,
            entity_key: None,
            relationship: None,
            request_id: None,
            uow_id: None,
            message: String::new(),
        }
    }

    /// Add operation context
    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    /// Add entity type context
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Add primary key context
    pub fn with_entity_key(mut self, key: impl Into<String>) -> Self {
        self.entity_key = Some(key.into());
        self
    }

    /// Add relationship context
    pub fn with_relationship(mut self, relationship: impl Into<String>) -> Self {
        self.relationship = Some(relationship.into());
        self
    }

    /// Add request ID context
    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Add unit of work context
    pub fn with_uow_id(mut self, uow_id: UnitOfWorkId) -> Self {
        self.uow_id = Some(uow_id);
        self
    }

    /// Add custom message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn kind(&self) -> ExErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn op(&self) -> Option<&str> {
        self.op.as_deref()
    }

    pub fn entity_type(&self) -> Option<&str> {
        self.entity_type.as_deref()
    }

    pub fn entity_key(&self) -> Option<&str> {
        self.entity_key.as_deref()
    }

    pub fn relationship(&self) -> Option<&str> {
        self.relationship.as_deref()
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    pub fn uow_id(&self) -> Option<&UnitOfWorkId> {
        self.uow_id.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for ExError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.code())?;
        if let Some(op) = &self.op {
            write!(f, " in operation '{}'", op)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        if let Some(entity_type) = &self.entity_type {
            write!(f, " (entity_type: {})", entity_type)?;
        }
        if let Some(key) = &self.entity_key {
            write!(f, " (entity_key: {})", key)?;
        }
        if let Some(relationship) = &self.relationship {
            write!(f, " (relationship: {})", relationship)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExError {}

// ========== End Error Facility ==========

/// Error taxonomy for mapping, loading and flushing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RelmapError {
    // ===== Registry =====
    /// An entity type was registered twice
    #[error("Entity type already registered: {entity_type}")]
    DuplicateMapping { entity_type: String },

    /// A mapping points at a type or relationship that was never registered
    #[error("Unresolved reference from {entity_type}.{member}: {target} is not registered")]
    UnresolvedReference {
        entity_type: String,
        member: String,
        target: String,
    },

    /// A descriptor is structurally impossible to map
    #[error("Invalid mapping for {entity_type}: {reason}")]
    InvalidMapping { entity_type: String, reason: String },

    /// Lookup of a type the registry does not know
    #[error("Unknown entity type: {entity_type}")]
    UnknownEntityType { entity_type: String },

    /// Lookup of a relationship the type does not declare
    #[error("Entity type {entity_type} has no relationship {relationship}")]
    UnknownRelationship {
        entity_type: String,
        relationship: String,
    },

    /// Lookup of a field the type does not map
    #[error("Entity type {entity_type} has no field {field}")]
    UnknownField { entity_type: String, field: String },

    /// A value does not fit the column it is written to
    #[error("Invalid value for {entity_type}.{field}: {reason}")]
    InvalidValue {
        entity_type: String,
        field: String,
        reason: String,
    },

    // ===== Loading =====
    /// Unloaded association accessed after the owning unit of work let go of the entity
    #[error("Cannot lazily load {entity_type}.{relationship} (key {key}): entity is detached")]
    LazyInitialization {
        entity_type: String,
        key: String,
        relationship: String,
    },

    /// A fetch graph or join fetch path that cannot be planned
    #[error("Unsupported fetch path '{path}' on {entity_type}: {reason}")]
    UnsupportedFetchGraph {
        entity_type: String,
        path: String,
        reason: String,
    },

    /// Lookup by key found no row
    #[error("{entity_type} with key {key} not found")]
    EntityNotFound { entity_type: String, key: String },

    // ===== Lifecycle =====
    /// Persisting an entity that references an unsaved entity without cascade
    #[error("{entity_type}.{relationship} references a transient {target_type}; persist it first or cascade persist")]
    TransientObject {
        entity_type: String,
        relationship: String,
        target_type: String,
    },

    /// Another entity with the same identity is already managed
    #[error("{entity_type} with key {key} is already managed by this unit of work")]
    EntityExists { entity_type: String, key: String },

    /// An entity with an assigned id strategy has no key
    #[error("{entity_type} uses assigned keys but no value was set for {field}")]
    MissingPrimaryKey { entity_type: String, field: String },

    /// Operation not allowed in the entity's current lifecycle state
    #[error("Cannot {op} {entity_type} in state {state}")]
    InvalidState {
        op: String,
        entity_type: String,
        state: String,
    },

    /// The unit of work was closed
    #[error("Unit of work is closed: cannot {op}")]
    UnitOfWorkClosed { op: String },

    /// A handle issued by a different unit of work
    #[error("Entity handle does not belong to this unit of work")]
    ForeignEntity,

    /// A handle issued before the unit of work was cleared
    #[error("Entity handle was released when the unit of work was cleared")]
    ReleasedEntity,

    // ===== Store =====
    /// The store rejected a write; the whole flush was rolled back
    #[error("Constraint violation during {op}: {cause}")]
    ConstraintViolation {
        op: String,
        #[source]
        cause: StoreError,
    },

    /// Any other store failure (I/O, timeout, cancellation)
    #[error("Store failure during {op}: {cause}")]
    Store {
        op: String,
        #[source]
        cause: StoreError,
    },

    /// A row could not be converted into mapped values
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl RelmapError {
    /// Wrap a store failure, classifying constraint rejections separately
    pub fn from_store(op: impl Into<String>, cause: StoreError) -> Self {
        let op = op.into();
        match cause.kind() {
            StoreErrorKind::Constraint => RelmapError::ConstraintViolation { op, cause },
            _ => RelmapError::Store { op, cause },
        }
    }

    /// Canonical kind for this error
    pub fn kind(&self) -> ExErrorKind {
        ExError::from(self.clone()).kind()
    }
}

/// Conversion from RelmapError to ExError
impl From<RelmapError> for ExError {
    fn from(err: RelmapError) -> Self {
        let message = err.to_string();
        match err {
            RelmapError::DuplicateMapping { entity_type } => {
                ExError::new(ExErrorKind::DuplicateMapping)
                    .with_op("register")
                    .with_entity_type(entity_type)
                    .with_message(message)
            }
            RelmapError::UnresolvedReference {
                entity_type,
                member,
                ..
            } => ExError::new(ExErrorKind::UnresolvedReference)
                .with_op("validate")
                .with_entity_type(entity_type)
                .with_relationship(member)
                .with_message(message),
            RelmapError::InvalidMapping { entity_type, .. } => {
                ExError::new(ExErrorKind::InvalidMapping)
                    .with_op("validate")
                    .with_entity_type(entity_type)
                    .with_message(message)
            }
            RelmapError::UnknownEntityType { entity_type } => {
                ExError::new(ExErrorKind::InvalidInput)
                    .with_entity_type(entity_type)
                    .with_message(message)
            }
            RelmapError::UnknownRelationship {
                entity_type,
                relationship,
            } => ExError::new(ExErrorKind::InvalidInput)
                .with_entity_type(entity_type)
                .with_relationship(relationship)
                .with_message(message),
            RelmapError::UnknownField { entity_type, .. }
            | RelmapError::InvalidValue { entity_type, .. } => {
                ExError::new(ExErrorKind::InvalidInput)
                    .with_entity_type(entity_type)
                    .with_message(message)
            }
            RelmapError::LazyInitialization {
                entity_type,
                key,
                relationship,
            } => ExError::new(ExErrorKind::LazyInitialization)
                .with_op("load_association")
                .with_entity_type(entity_type)
                .with_entity_key(key)
                .with_relationship(relationship)
                .with_message(message),
            RelmapError::UnsupportedFetchGraph { entity_type, .. } => {
                ExError::new(ExErrorKind::UnsupportedFetchGraph)
                    .with_op("plan")
                    .with_entity_type(entity_type)
                    .with_message(message)
            }
            RelmapError::EntityNotFound { entity_type, key } => {
                ExError::new(ExErrorKind::NotFound)
                    .with_entity_type(entity_type)
                    .with_entity_key(key)
                    .with_message(message)
            }
            RelmapError::TransientObject {
                entity_type,
                relationship,
                ..
            } => ExError::new(ExErrorKind::TransientObject)
                .with_op("persist")
                .with_entity_type(entity_type)
                .with_relationship(relationship)
                .with_message(message),
            RelmapError::EntityExists { entity_type, key } => {
                ExError::new(ExErrorKind::AlreadyExists)
                    .with_entity_type(entity_type)
                    .with_entity_key(key)
                    .with_message(message)
            }
            RelmapError::MissingPrimaryKey { entity_type, .. } => {
                ExError::new(ExErrorKind::InvalidInput)
                    .with_op("persist")
                    .with_entity_type(entity_type)
                    .with_message(message)
            }
            RelmapError::InvalidState {
                op, entity_type, ..
            } => ExError::new(ExErrorKind::InvalidState)
                .with_op(op)
                .with_entity_type(entity_type)
                .with_message(message),
            RelmapError::UnitOfWorkClosed { op } => ExError::new(ExErrorKind::Closed)
                .with_op(op)
                .with_message(message),
            RelmapError::ForeignEntity => {
                ExError::new(ExErrorKind::InvalidInput).with_message(message)
            }
            RelmapError::ReleasedEntity => ExError::new(ExErrorKind::InvalidState)
                .with_op("access")
                .with_message(message),
            RelmapError::ConstraintViolation { op, .. } => {
                ExError::new(ExErrorKind::ConstraintViolation)
                    .with_op(op)
                    .with_message(message)
            }
            RelmapError::Store { op, cause } => {
                let kind = match cause.kind() {
                    StoreErrorKind::Timeout => ExErrorKind::Timeout,
                    StoreErrorKind::Cancelled => ExErrorKind::Cancelled,
                    StoreErrorKind::Constraint => ExErrorKind::ConstraintViolation,
                    StoreErrorKind::Other => ExErrorKind::Persistence,
                };
                ExError::new(kind).with_op(op).with_message(message)
            }
            RelmapError::Serialization { .. } => {
                ExError::new(ExErrorKind::Serialization).with_message(message)
            }
        }
    }
}
