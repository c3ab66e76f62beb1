//! Seed import
//!
//! Provides:
//! - Seed format v0 schema
//! - YAML parser with validation
//! - Importer that persists a seed through a unit of work

pub mod format;
pub mod importer;
pub mod parser;

pub use format::{SeedLink, SeedV0};
pub use importer::{import_seed, import_seed_file, ImportReport};
pub use parser::{parse_seed_file, parse_seed_str};
