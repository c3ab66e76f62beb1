//! Static mapping metadata
//!
//! Descriptors are plain values built once at startup and handed to the
//! registry. They replace annotation-driven mapping: nothing is reflected at
//! runtime.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::component::Embedded;
use super::convert::Converter;
use super::graph::FetchGraph;
use super::value::{ColumnType, Value};

/// How new primary keys are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// The caller sets the key field before persisting
    Assigned,
    /// A UUIDv7 string is generated on persist
    Uuid,
    /// The store generates an integer key when the row is inserted. The key
    /// is unknown until commit; the caller may still assign one.
    Identity,
}

/// Primary key mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKey {
    pub field: String,
    pub column: String,
    pub ty: ColumnType,
    pub strategy: IdStrategy,
}

/// Mapping of one scalar field to one column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub field: String,
    pub column: String,
    pub ty: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    /// Redacted in statement logs
    pub sensitive: bool,
    /// Maps field values to and from the column type
    pub converter: Option<Converter>,
}

impl ColumnMapping {
    /// Nullable column named after the field
    pub fn new(field: impl Into<String>, ty: ColumnType) -> Self {
        let field = field.into();
        Self {
            column: field.clone(),
            field,
            ty,
            nullable: true,
            unique: false,
            sensitive: false,
            converter: None,
        }
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    #[must_use]
    pub fn convert(mut self, converter: Converter) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Type of the field value: the converter's, else the column's
    pub fn field_type(&self) -> ColumnType {
        self.converter
            .as_ref()
            .map_or(self.ty, Converter::field_type)
    }

    /// Coerce a value assigned to the field
    pub fn accept(&self, value: Value) -> Result<Value, String> {
        self.field_type().coerce(value)
    }

    /// Field value of a raw store value
    pub fn to_field(&self, raw: Value) -> Result<Value, String> {
        let stored = self.ty.coerce(raw)?;
        match &self.converter {
            Some(converter) if !stored.is_null() => {
                converter.field_type().coerce(converter.to_field(stored)?)
            }
            _ => Ok(stored),
        }
    }

    /// Stored form of a field value
    pub fn to_store(&self, value: Value) -> Result<Value, String> {
        match &self.converter {
            Some(converter) if !value.is_null() => self.ty.coerce(converter.to_column(value)?),
            _ => Ok(value),
        }
    }
}

/// Relationship cardinality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl Cardinality {
    pub fn is_to_many(&self) -> bool {
        matches!(self, Cardinality::OneToMany | Cardinality::ManyToMany)
    }
}

impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Cardinality::OneToOne => "one-to-one",
            Cardinality::OneToMany => "one-to-many",
            Cardinality::ManyToOne => "many-to-one",
            Cardinality::ManyToMany => "many-to-many",
        };
        f.write_str(s)
    }
}

/// Operation that may propagate along a relationship edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeOp {
    Persist,
    Merge,
    Remove,
    Refresh,
    Detach,
}

impl CascadeOp {
    const fn bit(self) -> u8 {
        match self {
            CascadeOp::Persist => 1,
            CascadeOp::Merge => 1 << 1,
            CascadeOp::Remove => 1 << 2,
            CascadeOp::Refresh => 1 << 3,
            CascadeOp::Detach => 1 << 4,
        }
    }
}

/// Set of cascaded operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CascadeSet(u8);

impl CascadeSet {
    pub const fn none() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(0b1_1111)
    }

    pub fn of(ops: &[CascadeOp]) -> Self {
        ops.iter().fold(Self::none(), |set, op| set.with(*op))
    }

    #[must_use]
    pub const fn with(self, op: CascadeOp) -> Self {
        Self(self.0 | op.bit())
    }

    pub const fn contains(&self, op: CascadeOp) -> bool {
        self.0 & op.bit() != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Declared loading strategy of a relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Loaded right after the owner, one query per owner
    Eager,
    /// Loaded on first access, one query per owner
    #[default]
    Lazy,
    /// Loaded on first access together with up to n-1 other pending owners
    Batched(usize),
    /// Joined into the owner's query
    Joined,
}

/// Link table of an owning many-to-many relationship
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub table: String,
    /// Column holding the owner's key
    pub owner_column: String,
    /// Column holding the target's key
    pub target_column: String,
}

/// Relationship between two entity types
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    /// Name of the owning relationship on the target (inverse side only)
    pub mapped_by: Option<String>,
    /// Foreign key column on this entity's table (owning to-one only)
    pub join_column: Option<String>,
    pub join_table: Option<JoinTable>,
    pub cascade: CascadeSet,
    pub fetch: FetchMode,
    pub orphan_removal: bool,
    pub optional: bool,
}

impl RelationshipDescriptor {
    fn new(name: impl Into<String>, target: impl Into<String>, cardinality: Cardinality) -> Self {
        let name = name.into();
        let join_column = match cardinality {
            Cardinality::ManyToOne | Cardinality::OneToOne => Some(format!("{}_id", name)),
            _ => None,
        };
        Self {
            name,
            target: target.into(),
            cardinality,
            mapped_by: None,
            join_column,
            join_table: None,
            cascade: CascadeSet::none(),
            fetch: FetchMode::Lazy,
            orphan_removal: false,
            optional: true,
        }
    }

    /// Owning many-to-one with join column `<name>_id`
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Cardinality::ManyToOne)
    }

    /// One-to-many; must be made the inverse of a many-to-one with `mapped_by`
    pub fn one_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Cardinality::OneToMany)
    }

    /// Owning one-to-one with join column `<name>_id`, unless `mapped_by` is set
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Cardinality::OneToOne)
    }

    /// Many-to-many; owning side needs `join_table`, inverse side `mapped_by`
    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Cardinality::ManyToMany)
    }

    #[must_use]
    pub fn mapped_by(mut self, relationship: impl Into<String>) -> Self {
        self.mapped_by = Some(relationship.into());
        self.join_column = None;
        self
    }

    #[must_use]
    pub fn join_column(mut self, column: impl Into<String>) -> Self {
        self.join_column = Some(column.into());
        self
    }

    #[must_use]
    pub fn join_table(
        mut self,
        table: impl Into<String>,
        owner_column: impl Into<String>,
        target_column: impl Into<String>,
    ) -> Self {
        self.join_table = Some(JoinTable {
            table: table.into(),
            owner_column: owner_column.into(),
            target_column: target_column.into(),
        });
        self
    }

    #[must_use]
    pub fn cascade(mut self, cascade: CascadeSet) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub fn fetch(mut self, fetch: FetchMode) -> Self {
        self.fetch = fetch;
        self
    }

    #[must_use]
    pub fn orphan_removal(mut self, enabled: bool) -> Self {
        self.orphan_removal = enabled;
        self
    }

    #[must_use]
    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn is_to_many(&self) -> bool {
        self.cardinality.is_to_many()
    }

    /// Inverse sides are never written; the owning side carries the link
    pub fn is_inverse(&self) -> bool {
        self.mapped_by.is_some()
    }
}

/// Mapping metadata of one entity type
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    pub primary_key: PrimaryKey,
    pub columns: Vec<ColumnMapping>,
    pub relationships: Vec<RelationshipDescriptor>,
    pub graphs: BTreeMap<String, FetchGraph>,
    /// Embedded component fields and their member names; the members are
    /// mapped in `columns` as `<field>.<member>`
    pub components: BTreeMap<String, Vec<String>>,
    /// Parent type for table-per-class inheritance
    pub parent: Option<String>,
    /// Abstract types have no table of their own
    pub is_abstract: bool,
}

impl EntityDescriptor {
    /// Descriptor with a generated text key `id`
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_key: PrimaryKey {
                field: "id".to_string(),
                column: "id".to_string(),
                ty: ColumnType::Text,
                strategy: IdStrategy::Uuid,
            },
            columns: Vec::new(),
            relationships: Vec::new(),
            graphs: BTreeMap::new(),
            components: BTreeMap::new(),
            parent: None,
            is_abstract: false,
        }
    }

    #[must_use]
    pub fn id(mut self, field: impl Into<String>, ty: ColumnType, strategy: IdStrategy) -> Self {
        let field = field.into();
        self.primary_key = PrimaryKey {
            column: field.clone(),
            field,
            ty,
            strategy,
        };
        self
    }

    #[must_use]
    pub fn column(mut self, column: ColumnMapping) -> Self {
        self.columns.push(column);
        self
    }

    /// Map an embedded component's members as columns of this entity
    #[must_use]
    pub fn embed(mut self, embedded: Embedded) -> Self {
        self.columns.extend(embedded.columns());
        self.components
            .insert(embedded.field.clone(), embedded.members());
        self
    }

    #[must_use]
    pub fn relationship(mut self, relationship: RelationshipDescriptor) -> Self {
        self.relationships.push(relationship);
        self
    }

    #[must_use]
    pub fn named_graph(mut self, name: impl Into<String>, graph: FetchGraph) -> Self {
        self.graphs.insert(name.into(), graph);
        self
    }

    /// Inherit key, columns and relationships from `parent` (table per class)
    #[must_use]
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    #[must_use]
    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn column_for(&self, field: &str) -> Option<&ColumnMapping> {
        self.columns.iter().find(|c| c.field == field)
    }

    pub fn relationship_for(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Owning to-one relationships, i.e. those that hold a foreign key column
    pub fn foreign_keys(&self) -> impl Iterator<Item = &RelationshipDescriptor> {
        self.relationships
            .iter()
            .filter(|r| !r.is_to_many() && !r.is_inverse())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cascade_set_membership() {
        let set = CascadeSet::of(&[CascadeOp::Persist, CascadeOp::Remove]);
        assert!(set.contains(CascadeOp::Persist));
        assert!(set.contains(CascadeOp::Remove));
        assert!(!set.contains(CascadeOp::Merge));
        assert!(CascadeSet::all().contains(CascadeOp::Detach));
        assert!(CascadeSet::none().is_empty());
    }

    #[test]
    fn test_many_to_one_defaults_join_column() {
        let rel = RelationshipDescriptor::many_to_one("author", "Author");
        assert_eq!(rel.join_column.as_deref(), Some("author_id"));
        assert!(!rel.is_inverse());
    }

    #[test]
    fn test_mapped_by_clears_join_column() {
        let rel = RelationshipDescriptor::one_to_one("profile", "Profile").mapped_by("user");
        assert!(rel.join_column.is_none());
        assert!(rel.is_inverse());
    }

    #[test]
    fn test_embed_flattens_members_into_columns() {
        use crate::model::component::Embeddable;

        let name = Embeddable::new("FullName")
            .column(ColumnMapping::new("first", ColumnType::Text))
            .column(ColumnMapping::new("last", ColumnType::Text));
        let desc = EntityDescriptor::new("Person", "people")
            .embed(Embedded::new("name", name).prefix("name_"));

        assert_eq!(desc.column_for("name.last").unwrap().column, "name_last");
        assert_eq!(
            desc.components.get("name"),
            Some(&vec!["first".to_string(), "last".to_string()])
        );
    }

    #[test]
    fn test_column_without_converter_passes_values_through() {
        let column = ColumnMapping::new("score", ColumnType::Real);
        assert_eq!(column.field_type(), ColumnType::Real);
        assert_eq!(column.to_field(Value::Integer(3)), Ok(Value::Real(3.0)));
        assert_eq!(column.to_store(Value::Real(2.5)), Ok(Value::Real(2.5)));
        assert!(column.accept(Value::from("high")).is_err());
    }

    #[test]
    fn test_foreign_keys_only_owning_to_one() {
        let desc = EntityDescriptor::new("Book", "books")
            .relationship(RelationshipDescriptor::many_to_one("author", "Author"))
            .relationship(
                RelationshipDescriptor::many_to_many("tags", "Tag")
                    .join_table("book_tags", "book_id", "tag_id"),
            );
        let names: Vec<_> = desc.foreign_keys().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["author"]);
    }
}
