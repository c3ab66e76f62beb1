//! Mapping model: values, descriptors, fetch graphs and detached entity data

pub mod component;
pub mod convert;
pub mod data;
pub mod descriptor;
pub mod graph;
pub mod value;

pub use component::{Embeddable, Embedded};
pub use convert::{AttributeConverter, Converter};
pub use data::EntityData;
pub use descriptor::{
    Cardinality, CascadeOp, CascadeSet, ColumnMapping, EntityDescriptor, FetchMode, IdStrategy,
    JoinTable, PrimaryKey, RelationshipDescriptor,
};
pub use graph::{FetchGraph, FetchOverride, GraphPath};
pub use value::{ColumnType, Key, Value};
