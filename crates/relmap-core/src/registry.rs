//! Entity registry
//!
//! Descriptors are collected by a [`RegistryBuilder`] and validated once into
//! an immutable [`Registry`]. Validation flattens table-per-class inheritance,
//! resolves both sides of every relationship to a physical association
//! mapping, and precomputes the polymorphic row source of each type. After
//! that every lookup is a plain map read.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

use crate::errors::{RelmapError, Result};
use crate::model::component::MEMBER_SEPARATOR;
use crate::model::{
    Cardinality, ColumnType, EntityDescriptor, FetchGraph, FetchMode, IdStrategy,
    RelationshipDescriptor,
};

/// Label of the discriminator column in polymorphic row sources
pub const DISCRIMINATOR: &str = "__type";

/// Physical representation of a relationship
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationMapping {
    /// Foreign key column on the source table referencing the target key
    FkOnSource { column: String },
    /// Foreign key column on the target table referencing the source key
    FkOnTarget { column: String },
    /// Link table; `owner_column` references the source key
    JoinTable {
        table: String,
        owner_column: String,
        target_column: String,
    },
}

/// Relationship together with its physical mapping and opposite side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRelationship {
    pub descriptor: RelationshipDescriptor,
    pub mapping: AssociationMapping,
    /// Name of the relationship on the target that forms the other side
    pub inverse: Option<String>,
}

impl ResolvedRelationship {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn target(&self) -> &str {
        &self.descriptor.target
    }

    pub fn is_to_many(&self) -> bool {
        self.descriptor.is_to_many()
    }

    /// Whether changes on this side are written to the store
    pub fn is_owning(&self) -> bool {
        !self.descriptor.is_inverse()
    }
}

/// Where rows of a type are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSource {
    /// Table name, or a parenthesised `UNION ALL` over variant tables
    pub from: String,
    /// Physical columns available on the source
    pub columns: Vec<String>,
    /// Whether rows carry a [`DISCRIMINATOR`] column
    pub polymorphic: bool,
}

/// Validated metadata of one entity type
#[derive(Debug, Clone)]
pub struct EntityMeta {
    /// Descriptor with inherited key, columns and relationships folded in
    pub descriptor: EntityDescriptor,
    /// Topmost ancestor; identities are unique per root
    pub root: String,
    /// Concrete types whose rows are instances of this type
    pub variants: Vec<String>,
    pub relationships: BTreeMap<String, ResolvedRelationship>,
    pub source: RowSource,
}

impl EntityMeta {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Physical columns of the type's own table in insert order
    pub fn table_columns(&self) -> Vec<String> {
        physical_columns(&self.descriptor)
    }
}

fn physical_columns(desc: &EntityDescriptor) -> Vec<String> {
    let mut columns = vec![desc.primary_key.column.clone()];
    columns.extend(desc.columns.iter().map(|c| c.column.clone()));
    columns.extend(desc.foreign_keys().filter_map(|r| r.join_column.clone()));
    columns
}

/// Collects descriptors before validation
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    descriptors: Vec<EntityDescriptor>,
    names: BTreeSet<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor
    ///
    /// # Errors
    ///
    /// `DuplicateMapping` if a type with the same name is already registered.
    pub fn register(&mut self, descriptor: EntityDescriptor) -> Result<&mut Self> {
        if !self.names.insert(descriptor.name.clone()) {
            return Err(RelmapError::DuplicateMapping {
                entity_type: descriptor.name,
            });
        }
        self.descriptors.push(descriptor);
        Ok(self)
    }

    /// Finalize into an immutable registry
    ///
    /// # Errors
    ///
    /// `UnresolvedReference` for targets, parents or `mapped_by` names that do
    /// not exist; `InvalidMapping` for mappings that cannot be stored.
    pub fn validate(self) -> Result<Registry> {
        let by_name: HashMap<&str, &EntityDescriptor> = self
            .descriptors
            .iter()
            .map(|d| (d.name.as_str(), d))
            .collect();

        for desc in &self.descriptors {
            check_shape(desc)?;
        }

        let mut flattened: BTreeMap<String, (EntityDescriptor, String)> = BTreeMap::new();
        for desc in &self.descriptors {
            let (flat, root) = flatten(desc, &by_name, &mut Vec::new())?;
            check_unique_names(&flat)?;
            flattened.insert(desc.name.clone(), (flat, root));
        }

        let mut entities = BTreeMap::new();
        for (name, (flat, root)) in &flattened {
            let relationships = resolve_relationships(flat, &flattened)?;
            let variants = concrete_variants(name, &flattened);
            // Each variant table would generate its own keys and collide
            // within the hierarchy
            if flat.primary_key.strategy == IdStrategy::Identity && variants.len() > 1 {
                return Err(invalid(
                    flat,
                    "store-generated keys cannot span the tables of an inheritance hierarchy",
                ));
            }
            let source = row_source(name, &variants, &flattened)?;
            entities.insert(
                name.clone(),
                EntityMeta {
                    descriptor: flat.clone(),
                    root: root.clone(),
                    variants,
                    relationships,
                    source,
                },
            );
        }

        let registry = Registry { entities };
        for meta in registry.entities.values() {
            for (graph_name, graph) in &meta.descriptor.graphs {
                registry
                    .check_graph(meta.name(), graph)
                    .map_err(|reason| RelmapError::InvalidMapping {
                        entity_type: meta.name().to_string(),
                        reason: format!("named graph '{}': {}", graph_name, reason),
                    })?;
            }
        }
        Ok(registry)
    }
}

fn invalid(desc: &EntityDescriptor, reason: impl Into<String>) -> RelmapError {
    RelmapError::InvalidMapping {
        entity_type: desc.name.clone(),
        reason: reason.into(),
    }
}

fn check_shape(desc: &EntityDescriptor) -> Result<()> {
    if desc.name.is_empty() {
        return Err(invalid(desc, "entity type name is empty"));
    }
    if !desc.is_abstract && desc.table.is_empty() {
        return Err(invalid(desc, "concrete type needs a table"));
    }
    if !desc.primary_key.ty.is_key_type() {
        return Err(invalid(
            desc,
            format!("primary key type {:?} is not integer or text", desc.primary_key.ty),
        ));
    }
    if desc.primary_key.strategy == IdStrategy::Uuid && desc.primary_key.ty != ColumnType::Text {
        return Err(invalid(desc, "generated UUID keys need a text primary key"));
    }
    if desc.primary_key.strategy == IdStrategy::Identity
        && desc.primary_key.ty != ColumnType::Integer
    {
        return Err(invalid(desc, "store-generated keys need an integer primary key"));
    }
    for column in &desc.columns {
        if let Some((component, _)) = column.field.split_once(MEMBER_SEPARATOR) {
            if !desc.components.contains_key(component) {
                return Err(invalid(
                    desc,
                    format!("field '{}' names no embedded component", column.field),
                ));
            }
        }
    }
    for rel in &desc.relationships {
        let fail = |reason: &str| invalid(desc, format!("relationship '{}': {}", rel.name, reason));
        match rel.cardinality {
            Cardinality::OneToMany if rel.mapped_by.is_none() => {
                return Err(fail("one-to-many must be the inverse side (mapped_by)"));
            }
            Cardinality::ManyToOne if rel.mapped_by.is_some() => {
                return Err(fail("many-to-one is always the owning side"));
            }
            Cardinality::ManyToMany if rel.mapped_by.is_none() && rel.join_table.is_none() => {
                return Err(fail("owning many-to-many needs a join table"));
            }
            Cardinality::ManyToOne | Cardinality::OneToOne
                if rel.mapped_by.is_none() && rel.join_column.is_none() =>
            {
                return Err(fail("owning to-one needs a join column"));
            }
            _ => {}
        }
        if rel.fetch == FetchMode::Batched(0) {
            return Err(fail("batch size must be at least 1"));
        }
        if rel.orphan_removal
            && !matches!(rel.cardinality, Cardinality::OneToMany | Cardinality::OneToOne)
        {
            return Err(fail("orphan removal applies to one-to-many and one-to-one only"));
        }
    }
    Ok(())
}

/// Fold ancestors into the descriptor. Returns the flattened descriptor and
/// the hierarchy root.
fn flatten(
    desc: &EntityDescriptor,
    by_name: &HashMap<&str, &EntityDescriptor>,
    path: &mut Vec<String>,
) -> Result<(EntityDescriptor, String)> {
    if path.contains(&desc.name) {
        return Err(invalid(
            desc,
            format!("inheritance cycle through {}", path.join(" -> ")),
        ));
    }
    let Some(parent_name) = &desc.parent else {
        return Ok((desc.clone(), desc.name.clone()));
    };
    let parent = by_name
        .get(parent_name.as_str())
        .ok_or_else(|| RelmapError::UnresolvedReference {
            entity_type: desc.name.clone(),
            member: "extends".to_string(),
            target: parent_name.clone(),
        })?;

    path.push(desc.name.clone());
    let (parent_flat, root) = flatten(parent, by_name, path)?;
    path.pop();

    let mut flat = desc.clone();
    flat.primary_key = parent_flat.primary_key.clone();
    flat.columns = parent_flat
        .columns
        .iter()
        .cloned()
        .chain(desc.columns.iter().cloned())
        .collect();
    flat.relationships = parent_flat
        .relationships
        .iter()
        .cloned()
        .chain(desc.relationships.iter().cloned())
        .collect();
    let mut graphs = parent_flat.graphs.clone();
    graphs.extend(desc.graphs.clone());
    flat.graphs = graphs;
    let mut components = parent_flat.components.clone();
    components.extend(desc.components.clone());
    flat.components = components;
    Ok((flat, root))
}

fn check_unique_names(desc: &EntityDescriptor) -> Result<()> {
    let mut fields = BTreeSet::new();
    let mut columns = BTreeSet::new();
    let field_names = std::iter::once(desc.primary_key.field.as_str())
        .chain(desc.columns.iter().map(|c| c.field.as_str()))
        .chain(desc.relationships.iter().map(|r| r.name.as_str()))
        .chain(desc.components.keys().map(String::as_str));
    for name in field_names {
        if !fields.insert(name) {
            return Err(invalid(desc, format!("duplicate field name '{}'", name)));
        }
    }
    for column in physical_columns(desc) {
        if column == DISCRIMINATOR || column.contains("__") {
            return Err(invalid(desc, format!("column name '{}' is reserved", column)));
        }
        if !columns.insert(column.clone()) {
            return Err(invalid(desc, format!("duplicate column name '{}'", column)));
        }
    }
    Ok(())
}

fn is_same_hierarchy(
    a: &str,
    b: &str,
    flattened: &BTreeMap<String, (EntityDescriptor, String)>,
) -> bool {
    match (flattened.get(a), flattened.get(b)) {
        (Some((_, ra)), Some((_, rb))) => ra == rb,
        _ => false,
    }
}

fn resolve_relationships(
    desc: &EntityDescriptor,
    flattened: &BTreeMap<String, (EntityDescriptor, String)>,
) -> Result<BTreeMap<String, ResolvedRelationship>> {
    let mut resolved = BTreeMap::new();
    for rel in &desc.relationships {
        let unresolved = |target: String| RelmapError::UnresolvedReference {
            entity_type: desc.name.clone(),
            member: rel.name.clone(),
            target,
        };
        let (target, _) = flattened
            .get(&rel.target)
            .ok_or_else(|| unresolved(rel.target.clone()))?;

        let (mapping, inverse) = match &rel.mapped_by {
            Some(owner_name) => {
                let owning = target
                    .relationship_for(owner_name)
                    .ok_or_else(|| unresolved(format!("{}.{}", rel.target, owner_name)))?;
                if owning.is_inverse() {
                    return Err(invalid(
                        desc,
                        format!(
                            "relationship '{}' is mapped by {}.{} which is not an owning side",
                            rel.name, rel.target, owner_name
                        ),
                    ));
                }
                let compatible = matches!(
                    (rel.cardinality, owning.cardinality),
                    (Cardinality::OneToMany, Cardinality::ManyToOne)
                        | (Cardinality::OneToOne, Cardinality::OneToOne)
                        | (Cardinality::ManyToMany, Cardinality::ManyToMany)
                );
                if !compatible || !is_same_hierarchy(&owning.target, &desc.name, flattened) {
                    return Err(invalid(
                        desc,
                        format!(
                            "relationship '{}' ({}) cannot be the inverse of {}.{} ({} -> {})",
                            rel.name, rel.cardinality, rel.target, owner_name,
                            owning.cardinality, owning.target
                        ),
                    ));
                }
                let mapping = match (&owning.join_table, &owning.join_column) {
                    (Some(jt), _) => AssociationMapping::JoinTable {
                        table: jt.table.clone(),
                        owner_column: jt.target_column.clone(),
                        target_column: jt.owner_column.clone(),
                    },
                    (None, Some(column)) => AssociationMapping::FkOnTarget {
                        column: column.clone(),
                    },
                    (None, None) => {
                        return Err(invalid(
                            desc,
                            format!("{}.{} has no join column", rel.target, owner_name),
                        ))
                    }
                };
                (mapping, Some(owner_name.clone()))
            }
            None => {
                let mapping = match (&rel.join_table, &rel.join_column) {
                    (Some(jt), _) if rel.cardinality == Cardinality::ManyToMany => {
                        AssociationMapping::JoinTable {
                            table: jt.table.clone(),
                            owner_column: jt.owner_column.clone(),
                            target_column: jt.target_column.clone(),
                        }
                    }
                    (_, Some(column)) if !rel.is_to_many() => AssociationMapping::FkOnSource {
                        column: column.clone(),
                    },
                    _ => {
                        return Err(invalid(
                            desc,
                            format!("relationship '{}' has no usable physical mapping", rel.name),
                        ))
                    }
                };
                let inverse = target
                    .relationships
                    .iter()
                    .find(|r| {
                        r.mapped_by.as_deref() == Some(rel.name.as_str())
                            && is_same_hierarchy(&r.target, &desc.name, flattened)
                    })
                    .map(|r| r.name.clone());
                (mapping, inverse)
            }
        };

        resolved.insert(
            rel.name.clone(),
            ResolvedRelationship {
                descriptor: rel.clone(),
                mapping,
                inverse,
            },
        );
    }
    Ok(resolved)
}

fn is_descendant(
    name: &str,
    ancestor: &str,
    flattened: &BTreeMap<String, (EntityDescriptor, String)>,
) -> bool {
    let mut current = Some(name.to_string());
    while let Some(n) = current {
        if n == ancestor {
            return true;
        }
        current = flattened.get(&n).and_then(|(d, _)| d.parent.clone());
    }
    false
}

fn concrete_variants(
    name: &str,
    flattened: &BTreeMap<String, (EntityDescriptor, String)>,
) -> Vec<String> {
    flattened
        .iter()
        .filter(|(n, (d, _))| !d.is_abstract && is_descendant(n, name, flattened))
        .map(|(n, _)| n.clone())
        .collect()
}

fn row_source(
    name: &str,
    variants: &[String],
    flattened: &BTreeMap<String, (EntityDescriptor, String)>,
) -> Result<RowSource> {
    let lookup = |n: &str| {
        flattened
            .get(n)
            .map(|(d, _)| d)
            .ok_or_else(|| RelmapError::UnknownEntityType {
                entity_type: n.to_string(),
            })
    };
    let own = lookup(name)?;
    if variants.len() == 1 && variants[0] == name {
        return Ok(RowSource {
            from: own.table.clone(),
            columns: physical_columns(own),
            polymorphic: false,
        });
    }

    let mut columns: Vec<String> = physical_columns(own);
    for variant in variants {
        for column in physical_columns(lookup(variant)?) {
            if !columns.contains(&column) {
                columns.push(column);
            }
        }
    }

    let mut selects = Vec::with_capacity(variants.len());
    for variant in variants {
        let desc = lookup(variant)?;
        let present = physical_columns(desc);
        let projected: Vec<String> = columns
            .iter()
            .map(|c| {
                if present.contains(c) {
                    format!("{c} AS {c}")
                } else {
                    format!("NULL AS {c}")
                }
            })
            .collect();
        selects.push(format!(
            "SELECT {}, '{}' AS {} FROM {}",
            projected.join(", "),
            variant,
            DISCRIMINATOR,
            desc.table
        ));
    }
    // A type with no concrete variant yields no rows
    let from = if selects.is_empty() {
        let projected: Vec<String> = columns.iter().map(|c| format!("NULL AS {c}")).collect();
        format!(
            "(SELECT {}, NULL AS {} WHERE 0)",
            projected.join(", "),
            DISCRIMINATOR
        )
    } else {
        format!("({})", selects.join(" UNION ALL "))
    };

    Ok(RowSource {
        from,
        columns,
        polymorphic: true,
    })
}

/// Validated, immutable mapping metadata
#[derive(Debug, Clone)]
pub struct Registry {
    entities: BTreeMap<String, EntityMeta>,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Install as the process-wide registry. Hands the registry back if one
    /// was installed already.
    pub fn install_global(self) -> std::result::Result<&'static Registry, Registry> {
        let mut pending = Some(self);
        let installed = GLOBAL.get_or_init(|| {
            pending.take().unwrap_or_else(|| Registry {
                entities: BTreeMap::new(),
            })
        });
        match pending {
            Some(rejected) => Err(rejected),
            None => Ok(installed),
        }
    }

    pub fn global() -> Option<&'static Registry> {
        GLOBAL.get()
    }

    /// Flattened descriptor of a type
    ///
    /// # Errors
    ///
    /// `UnknownEntityType` if the type is not registered.
    pub fn describe(&self, entity_type: &str) -> Result<&EntityDescriptor> {
        self.entity(entity_type).map(|m| &m.descriptor)
    }

    pub fn entity(&self, entity_type: &str) -> Result<&EntityMeta> {
        self.entities
            .get(entity_type)
            .ok_or_else(|| RelmapError::UnknownEntityType {
                entity_type: entity_type.to_string(),
            })
    }

    pub fn relationship(&self, entity_type: &str, name: &str) -> Result<&ResolvedRelationship> {
        self.entity(entity_type)?
            .relationships
            .get(name)
            .ok_or_else(|| RelmapError::UnknownRelationship {
                entity_type: entity_type.to_string(),
                relationship: name.to_string(),
            })
    }

    pub fn root_of(&self, entity_type: &str) -> Result<&str> {
        self.entity(entity_type).map(|m| m.root.as_str())
    }

    /// Whether `entity_type` is `ancestor` or inherits from it
    pub fn is_a(&self, entity_type: &str, ancestor: &str) -> bool {
        let mut current = Some(entity_type);
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self
                .entities
                .get(name)
                .and_then(|m| m.descriptor.parent.as_deref());
        }
        false
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Link table columns that reference rows of `entity_type`, as
    /// (table, column). Used to drop link rows before the row itself.
    pub fn link_references(&self, entity_type: &str) -> Vec<(String, String)> {
        let mut refs: Vec<(String, String)> = Vec::new();
        let mut push = |table: &str, column: &str| {
            let pair = (table.to_string(), column.to_string());
            if !refs.contains(&pair) {
                refs.push(pair);
            }
        };
        for meta in self.entities.values() {
            for rel in meta.relationships.values() {
                if !rel.is_owning() {
                    continue;
                }
                let AssociationMapping::JoinTable {
                    table,
                    owner_column,
                    target_column,
                } = &rel.mapping
                else {
                    continue;
                };
                if meta.name() == entity_type {
                    push(table, owner_column);
                }
                if self.is_a(entity_type, rel.target()) {
                    push(table, target_column);
                }
            }
        }
        refs
    }

    /// Named graph declared on the type. Accepts `name` or `Type.name`.
    pub fn named_graph(&self, entity_type: &str, name: &str) -> Option<&FetchGraph> {
        let meta = self.entities.get(entity_type)?;
        let local = name
            .strip_prefix(entity_type)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(name);
        meta.descriptor.graphs.get(local)
    }

    /// Resolve a relationship path starting at `entity_type`
    pub fn resolve_path(
        &self,
        entity_type: &str,
        segments: &[String],
    ) -> std::result::Result<Vec<&ResolvedRelationship>, String> {
        let mut current = entity_type;
        let mut resolved = Vec::with_capacity(segments.len());
        for segment in segments {
            let rel = self
                .entities
                .get(current)
                .and_then(|m| m.relationships.get(segment))
                .ok_or_else(|| format!("{} has no relationship '{}'", current, segment))?;
            resolved.push(rel);
            current = rel.target();
        }
        Ok(resolved)
    }

    fn check_graph(&self, entity_type: &str, graph: &FetchGraph) -> std::result::Result<(), String> {
        for path in graph.paths() {
            self.resolve_path(entity_type, &path.segments)?;
        }
        Ok(())
    }
}
