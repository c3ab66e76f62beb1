//! Relmap Core - object-relational mapping kernel
//!
//! This crate maps application entities onto relational rows through a
//! validated registry of descriptors, including:
//! - Entity registry with table-per-class inheritance and resolved associations
//! - Unit of work with an identity map and entity lifecycle tracking
//! - Fetch planner (lazy, batched, joined, graph-directed and eager loading)
//! - Cascade executor with orphan removal
//! - Atomic commit through the [`RowStore`] boundary
//!
//! The crate performs no I/O of its own; a store implementation (see
//! `relmap-store`) executes the SQL it produces.

mod cascade;
pub mod config;
pub mod errors;
pub mod fetch;
mod flush;
pub mod logging_facility;
pub mod model;
pub mod registry;
pub mod session;
pub mod sql;
pub mod stats;
pub mod store;

// Re-export commonly used types
pub use config::SessionConfig;
pub use errors::{ExError, ExErrorKind, RelmapError, Result};
pub use fetch::{FetchPlan, FetchPlanner, FetchRequest, PlannedFetch};
pub use model::{
    AttributeConverter, Cardinality, CascadeOp, CascadeSet, ColumnMapping, ColumnType, Converter,
    Embeddable, Embedded, EntityData, EntityDescriptor, FetchGraph, FetchMode, FetchOverride,
    IdStrategy, Key, RelationshipDescriptor, Value,
};
pub use registry::{Registry, RegistryBuilder};
pub use session::{EntityRef, EntityState, Query, UnitOfWork};
pub use stats::Statistics;
pub use store::{Row, RowStore, StoreError, StoreErrorKind};
