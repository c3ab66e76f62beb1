//! Seed format v0 schema
//!
//! ```yaml
//! schema_version: 0
//! entities:
//!   - entity_type: Author
//!     values: { id: 1, name: Pushkin }
//!   - entity_type: Book
//!     values: { id: b1, title: Ruslan and Ludmila }
//!     references: { author: 1 }
//!   - entity_type: Tag
//!     values: { id: t1, label: poem }
//! links:
//!   - { entity_type: Book, key: b1, relationship: tags, target: t1 }
//! ```

use relmap_core::{EntityData, Key};
use serde::{Deserialize, Serialize};

/// Top-level seed file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedV0 {
    /// Schema version (must be 0 for this format)
    pub schema_version: u32,

    /// Entities in insertion order; `references` name owning to-one targets
    #[serde(default)]
    pub entities: Vec<EntityData>,

    /// Associations set after every entity exists
    #[serde(default)]
    pub links: Vec<SeedLink>,
}

/// Association between two seeded (or already stored) entities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedLink {
    pub entity_type: String,
    pub key: Key,
    pub relationship: String,
    pub target: Key,
}
