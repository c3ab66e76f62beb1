//! Plan execution
//!
//! A query unit is one SQL statement: a base (root rows, or the targets of
//! one relationship for a set of owners) plus the relationships joined into
//! it. Rows are folded into the identity map; an entity that is already
//! managed is never overwritten, and a collection that was loaded before the
//! statement ran keeps its current membership.

use std::collections::{BTreeMap, HashSet};

use crate::errors::{RelmapError, Result};
use crate::fetch::plan::{FetchNode, FetchPlan, FetchPlanner, PlannedFetch};
use crate::model::{FetchMode, Key, Value};
use crate::registry::{AssociationMapping, EntityMeta, ResolvedRelationship, DISCRIMINATOR};
use crate::session::{Collection, EntityState, Query, Slot, ToOne, UnitOfWork};
use crate::sql::{label, placeholders, Select, Statement};
use crate::store::{Row, RowStore};

/// Label of the owner key column in association loads
const OWNER_LABEL: &str = "__owner";

struct Member {
    alias: String,
    entity_type: String,
    parent: usize,
    /// Edge from the parent member; `None` for the base
    relationship: Option<ResolvedRelationship>,
    /// Edges loaded by separate statements once this unit has run
    deferred: Vec<FetchNode>,
}

enum Base {
    Root {
        filters: Vec<(String, Value, bool)>,
    },
    Association {
        owner_type: String,
        relationship: ResolvedRelationship,
    },
}

struct Unit {
    base: Base,
    members: Vec<Member>,
}

fn serialization(entity_type: &str, field: &str, reason: impl std::fmt::Display) -> RelmapError {
    RelmapError::Serialization {
        message: format!("{}.{}: {}", entity_type, field, reason),
    }
}

impl<'a, S: RowStore + ?Sized> UnitOfWork<'a, S> {
    /// Run a root query with its plan; returns root slots in row order
    pub(crate) fn load_roots(&mut self, query: &Query, plan: &FetchPlan) -> Result<Vec<usize>> {
        let registry = self.registry;
        let meta = registry.entity(&query.entity_type)?;
        let mut filters = Vec::with_capacity(query.filters.len());
        for (field, value) in &query.filters {
            filters.push(filter_column(meta, registry, field, value.clone())?);
        }

        let mut unit = Unit {
            base: Base::Root { filters },
            members: vec![Member {
                alias: "t0".to_string(),
                entity_type: query.entity_type.clone(),
                parent: 0,
                relationship: None,
                deferred: Vec::new(),
            }],
        };
        self.add_members(&mut unit, 0, &plan.nodes)?;

        let found = self.run_unit(&unit, &[])?;
        self.run_deferred(&unit, &found, &found[0])?;
        Ok(found[0]
            .iter()
            .copied()
            .filter(|&i| {
                self.map
                    .get(i)
                    .is_some_and(|s| s.state != EntityState::Removed)
            })
            .collect())
    }

    /// Materialise one association of a slot, honouring its declared mode
    pub(crate) fn ensure_loaded(&mut self, slot: usize, relationship: &str) -> Result<()> {
        let registry = self.registry;
        let current = self.map.get(slot).ok_or(RelmapError::ForeignEntity)?;
        let entity_type = current.entity_type.clone();
        let rel = registry.relationship(&entity_type, relationship)?;

        match (
            current.collections.get(relationship),
            current.to_one.get(relationship),
        ) {
            (Some(Collection::Loaded { .. }), _) | (_, Some(ToOne::Loaded { .. })) => {
                return Ok(())
            }
            (_, Some(ToOne::Unloaded { fk })) => {
                if let Some(resolved) = self.resolve_from_map(rel, fk.clone())? {
                    if let Some(s) = self.map.get_mut(slot) {
                        s.to_one.insert(relationship.to_string(), resolved);
                    }
                    return Ok(());
                }
            }
            _ => {}
        }

        if !self.can_load(slot) {
            return Err(RelmapError::LazyInitialization {
                entity_type,
                key: current
                    .key
                    .as_ref()
                    .map(Key::to_string)
                    .unwrap_or_default(),
                relationship: relationship.to_string(),
            });
        }

        let owners = match rel.descriptor.fetch {
            FetchMode::Batched(n) => self.batch_owners(slot, &entity_type, rel, n),
            _ => vec![slot],
        };
        let chunk = self.config.chunk_size(Some(owners.len()));
        let children = FetchPlanner::new(registry, &self.config).declared(rel.target())?;
        tracing::debug!(
            uow_id = %self.id,
            entity_type = %entity_type,
            relationship,
            owners = owners.len() as u64,
            "loading association"
        );
        self.load_association(&owners, &entity_type, relationship, chunk, &children)
    }

    /// To-one state resolvable without a query, if any
    fn resolve_from_map(
        &self,
        rel: &ResolvedRelationship,
        fk: Option<Key>,
    ) -> Result<Option<ToOne>> {
        if !matches!(rel.mapping, AssociationMapping::FkOnSource { .. }) {
            return Ok(None);
        }
        Ok(match self.resolve_fk(rel.target(), fk)? {
            loaded @ ToOne::Loaded { .. } => Some(loaded),
            ToOne::Unloaded { .. } => None,
        })
    }

    /// The accessed owner followed by up to `size - 1` other pending owners
    /// in load order, wrapping around
    fn batch_owners(
        &self,
        slot: usize,
        entity_type: &str,
        rel: &ResolvedRelationship,
        size: usize,
    ) -> Vec<usize> {
        let registry = self.registry;
        let anchor = self.map.get(slot).and_then(|s| s.load_seq).unwrap_or(0);
        let mut candidates: Vec<(u64, usize)> = self
            .map
            .managed()
            .into_iter()
            .filter(|&i| i != slot && self.can_load(i) && self.is_unloaded(i, rel.name()))
            .filter_map(|i| {
                let other = self.map.get(i)?;
                let same_edge = other.entity_type == entity_type
                    || registry
                        .relationship(&other.entity_type, rel.name())
                        .is_ok_and(|r| r.mapping == rel.mapping && r.target() == rel.target());
                same_edge.then_some((other.load_seq.unwrap_or(0), i))
            })
            .collect();
        candidates.sort_unstable();

        let (before, after): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|(seq, _)| *seq < anchor);
        let limit = size.min(self.config.max_in_params).max(1);
        std::iter::once(slot)
            .chain(after.into_iter().chain(before).map(|(_, i)| i))
            .take(limit)
            .collect()
    }

    fn is_unloaded(&self, slot: usize, relationship: &str) -> bool {
        self.map.get(slot).is_some_and(|s| {
            matches!(s.collections.get(relationship), Some(Collection::Unloaded))
                || matches!(s.to_one.get(relationship), Some(ToOne::Unloaded { .. }))
        })
    }

    /// Load `relationship` for every unloaded owner, `chunk` owners per
    /// statement, then the `children` edges of the loaded targets
    pub(crate) fn load_association(
        &mut self,
        owners: &[usize],
        owner_type: &str,
        relationship: &str,
        chunk: usize,
        children: &[FetchNode],
    ) -> Result<()> {
        let registry = self.registry;
        let rel = registry.relationship(owner_type, relationship)?.clone();

        let mut pending: Vec<usize> = Vec::new();
        for &owner in owners {
            if !self.is_unloaded(owner, relationship) || pending.contains(&owner) {
                continue;
            }
            let fk = match self.map.get(owner).and_then(|s| s.to_one.get(relationship)) {
                Some(ToOne::Unloaded { fk }) => fk.clone(),
                _ => None,
            };
            if let Some(resolved) = self.resolve_from_map(&rel, fk)? {
                if let Some(s) = self.map.get_mut(owner) {
                    s.to_one.insert(relationship.to_string(), resolved);
                }
                continue;
            }
            pending.push(owner);
        }

        let mut unit = Unit {
            base: Base::Association {
                owner_type: owner_type.to_string(),
                relationship: rel.clone(),
            },
            members: vec![Member {
                alias: "t0".to_string(),
                entity_type: rel.target().to_string(),
                parent: 0,
                relationship: None,
                deferred: Vec::new(),
            }],
        };
        self.add_members(&mut unit, 0, children)?;

        let mut found: Vec<Vec<usize>> = vec![Vec::new(); unit.members.len()];
        let keyed: Vec<(usize, Key)> = pending
            .iter()
            .filter_map(|&owner| {
                let s = self.map.get(owner)?;
                let key = match &rel.mapping {
                    AssociationMapping::FkOnSource { .. } => match s.to_one.get(relationship) {
                        Some(ToOne::Unloaded { fk: Some(fk) }) => fk.clone(),
                        _ => return None,
                    },
                    _ => s.key.clone()?,
                };
                Some((owner, key))
            })
            .collect();

        for batch in keyed.chunks(chunk.max(1)) {
            let mut keys: Vec<Key> = Vec::with_capacity(batch.len());
            for (_, key) in batch {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
            let chunk_found = self.run_unit(&unit, &keys)?;
            for (acc, new) in found.iter_mut().zip(chunk_found) {
                for slot in new {
                    if !acc.contains(&slot) {
                        acc.push(slot);
                    }
                }
            }
            let batch_owners: Vec<usize> = batch.iter().map(|(o, _)| *o).collect();
            self.finish_owners(&batch_owners, &rel)?;
        }
        // Owners without a usable key (e.g. dangling) resolve to nothing
        self.finish_owners(&pending, &rel)?;

        let mut targets: Vec<usize> = Vec::new();
        for &owner in owners {
            for t in self.loaded_targets(owner, relationship) {
                if !targets.contains(&t) {
                    targets.push(t);
                }
            }
        }
        self.run_deferred(&unit, &found, &targets)
    }

    /// Mark owners whose association is still unloaded after its statement
    /// ran as loaded: the store had no rows for them
    fn finish_owners(&mut self, owners: &[usize], rel: &ResolvedRelationship) -> Result<()> {
        let name = rel.name();
        for &owner in owners {
            if !self.is_unloaded(owner, name) {
                continue;
            }
            if rel.is_to_many() {
                if let Some(s) = self.map.get_mut(owner) {
                    s.collections.insert(name.to_string(), Collection::empty());
                }
                self.stats.collections_loaded += 1;
            } else {
                let fk = match self.map.get(owner).and_then(|s| s.to_one.get(name)) {
                    Some(ToOne::Unloaded { fk }) => fk.clone(),
                    _ => None,
                };
                let resolved = match (&rel.mapping, fk) {
                    (AssociationMapping::FkOnSource { .. }, Some(key)) => {
                        let root = self.registry.root_of(rel.target())?;
                        self.map.lookup(root, &key)
                    }
                    _ => None,
                };
                if let Some(s) = self.map.get_mut(owner) {
                    s.to_one.insert(name.to_string(), ToOne::fresh(resolved));
                }
            }
        }
        Ok(())
    }

    fn loaded_targets(&self, owner: usize, relationship: &str) -> Vec<usize> {
        let Some(s) = self.map.get(owner) else {
            return Vec::new();
        };
        match (s.collections.get(relationship), s.to_one.get(relationship)) {
            (Some(Collection::Loaded { items, .. }), _) => items.clone(),
            (_, Some(ToOne::Loaded { current, .. })) => current.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    /// Run edges deferred by a unit. `base_targets` are the owners for edges
    /// deferred on the base member.
    fn run_deferred(&mut self, unit: &Unit, found: &[Vec<usize>], base_targets: &[usize]) -> Result<()> {
        for (k, member) in unit.members.iter().enumerate() {
            let owners: &[usize] = if k == 0 { base_targets } else { &found[k] };
            for node in &member.deferred {
                self.load_node(owners, node)?;
            }
        }
        Ok(())
    }

    fn load_node(&mut self, owners: &[usize], node: &FetchNode) -> Result<()> {
        if owners.is_empty() {
            return Ok(());
        }
        let chunk = match node.strategy {
            PlannedFetch::Batch(n) => self.config.chunk_size(Some(n)),
            PlannedFetch::SelectEach => 1,
            PlannedFetch::Join => self.config.chunk_size(None),
        };
        self.load_association(owners, &node.owner_type, &node.relationship, chunk, &node.children)
    }

    /// Turn join edges into members of the unit; other edges are deferred
    fn add_members(&self, unit: &mut Unit, parent: usize, nodes: &[FetchNode]) -> Result<()> {
        for node in nodes {
            if node.strategy != PlannedFetch::Join {
                unit.members[parent].deferred.push(node.clone());
                continue;
            }
            let rel = self
                .registry
                .relationship(&node.owner_type, &node.relationship)?
                .clone();
            let index = unit.members.len();
            unit.members.push(Member {
                alias: format!("j{}", index),
                entity_type: node.target_type.clone(),
                parent,
                relationship: Some(rel),
                deferred: Vec::new(),
            });
            self.add_members(unit, index, &node.children)?;
        }
        Ok(())
    }

    fn unit_statement(&self, unit: &Unit, keys: &[Key]) -> Result<Statement> {
        let registry = self.registry;
        let base_meta = registry.entity(&unit.members[0].entity_type)?;
        let base_pk = &base_meta.descriptor.primary_key.column;
        let mut select = Select::from(&base_meta.source.from, "t0");
        let mut statement = Statement::new(String::new());
        let mut order_by = Vec::new();

        match &unit.base {
            Base::Root { filters } => {
                for (column, value, sensitive) in filters {
                    if value.is_null() {
                        select.condition(format!("t0.{} IS NULL", column));
                    } else {
                        select.condition(format!("t0.{} = ?", column));
                        statement.push(value.clone(), *sensitive);
                    }
                }
            }
            Base::Association { relationship, .. } => {
                let list = placeholders(keys.len());
                match &relationship.mapping {
                    AssociationMapping::FkOnTarget { column } => {
                        select.column_as(&format!("t0.{}", column), OWNER_LABEL);
                        select.condition(format!("t0.{} IN ({})", column, list));
                        order_by.push(OWNER_LABEL.to_string());
                    }
                    AssociationMapping::JoinTable {
                        table,
                        owner_column,
                        target_column,
                    } => {
                        select.join(format!(
                            "JOIN {} l0 ON l0.{} = t0.{}",
                            table, target_column, base_pk
                        ));
                        select.column_as(&format!("l0.{}", owner_column), OWNER_LABEL);
                        select.condition(format!("l0.{} IN ({})", owner_column, list));
                        order_by.push(OWNER_LABEL.to_string());
                    }
                    AssociationMapping::FkOnSource { .. } => {
                        select.condition(format!("t0.{} IN ({})", base_pk, list));
                    }
                }
                for key in keys {
                    statement.push(key.to_value(), false);
                }
            }
        }

        if unit.members.len() > 1 {
            select.distinct();
        }
        for (k, member) in unit.members.iter().enumerate() {
            let meta = registry.entity(&member.entity_type)?;
            for column in &meta.source.columns {
                select.column(&member.alias, column);
            }
            if meta.source.polymorphic {
                select.column(&member.alias, DISCRIMINATOR);
            }
            order_by.push(label(&member.alias, &meta.descriptor.primary_key.column));
            if k == 0 {
                continue;
            }
            let parent = &unit.members[member.parent];
            let parent_pk = &registry.entity(&parent.entity_type)?.descriptor.primary_key.column;
            let Some(rel) = &member.relationship else {
                continue;
            };
            let pk = &meta.descriptor.primary_key.column;
            let (alias, palias) = (&member.alias, &parent.alias);
            match &rel.mapping {
                AssociationMapping::FkOnSource { column } => select.join(format!(
                    "LEFT JOIN {} {} ON {}.{} = {}.{}",
                    meta.source.from, alias, alias, pk, palias, column
                )),
                AssociationMapping::FkOnTarget { column } => select.join(format!(
                    "LEFT JOIN {} {} ON {}.{} = {}.{}",
                    meta.source.from, alias, alias, column, palias, parent_pk
                )),
                AssociationMapping::JoinTable {
                    table,
                    owner_column,
                    target_column,
                } => {
                    let link = format!("l{}", k);
                    select.join(format!(
                        "LEFT JOIN {} {} ON {}.{} = {}.{}",
                        table, link, link, owner_column, palias, parent_pk
                    ));
                    select.join(format!(
                        "LEFT JOIN {} {} ON {}.{} = {}.{}",
                        meta.source.from, alias, alias, pk, link, target_column
                    ));
                }
            }
        }
        for by in order_by {
            select.order_by(by);
        }
        statement.sql = select.to_sql();
        Ok(statement)
    }

    /// Execute one unit; returns the distinct slots found per member
    fn run_unit(&mut self, unit: &Unit, keys: &[Key]) -> Result<Vec<Vec<usize>>> {
        let statement = self.unit_statement(unit, keys)?;
        let rows = self.query(&statement)?;
        let mut found: Vec<Vec<usize>> = vec![Vec::new(); unit.members.len()];
        let mut initializing: HashSet<(usize, String)> = HashSet::new();

        let owner_root = match &unit.base {
            Base::Association { owner_type, .. } => {
                Some(self.registry.root_of(owner_type)?.to_string())
            }
            Base::Root { .. } => None,
        };

        for row in &rows {
            let mut row_slots: Vec<Option<usize>> = Vec::with_capacity(unit.members.len());
            for (k, member) in unit.members.iter().enumerate() {
                let slot = self.hydrate_member(row, member)?;
                if let Some(s) = slot {
                    if !found[k].contains(&s) {
                        found[k].push(s);
                    }
                }
                if let (Some(rel), Some(Some(parent))) =
                    (&member.relationship, row_slots.get(member.parent))
                {
                    self.attach_loaded(*parent, rel, slot, &mut initializing);
                }
                row_slots.push(slot);
            }

            if let (
                Base::Association {
                    owner_type,
                    relationship,
                },
                Some(root),
            ) = (&unit.base, &owner_root)
            {
                if matches!(relationship.mapping, AssociationMapping::FkOnSource { .. }) {
                    continue;
                }
                let owner_key = row
                    .get(OWNER_LABEL)
                    .and_then(Key::from_value)
                    .ok_or_else(|| serialization(owner_type, OWNER_LABEL, "missing owner key"))?;
                if let Some(owner) = self.map.lookup(root, &owner_key) {
                    self.attach_loaded(owner, relationship, row_slots[0], &mut initializing);
                }
            }
        }
        Ok(found)
    }

    /// Record `child` as loaded into `parent.rel`, unless the association was
    /// already loaded before the current statement
    fn attach_loaded(
        &mut self,
        parent: usize,
        rel: &ResolvedRelationship,
        child: Option<usize>,
        initializing: &mut HashSet<(usize, String)>,
    ) {
        let name = rel.name().to_string();
        let Some(slot) = self.map.get_mut(parent) else {
            return;
        };
        if rel.is_to_many() {
            let fresh = initializing.contains(&(parent, name.clone()));
            if !fresh {
                match slot.collections.get(&name) {
                    Some(Collection::Loaded { .. }) => return,
                    _ => {
                        slot.collections.insert(name.clone(), Collection::empty());
                        initializing.insert((parent, name.clone()));
                        self.stats.collections_loaded += 1;
                    }
                }
            }
            if let (Some(c), Some(Collection::Loaded { items, snapshot })) =
                (child, slot.collections.get_mut(&name))
            {
                if !items.contains(&c) {
                    items.push(c);
                    snapshot.push(c);
                }
            }
        } else if !matches!(slot.to_one.get(&name), Some(ToOne::Loaded { .. })) {
            slot.to_one.insert(name, ToOne::fresh(child));
        }
    }

    fn hydrate_member(&mut self, row: &Row, member: &Member) -> Result<Option<usize>> {
        let meta = self.registry.entity(&member.entity_type)?;
        let pk_label = label(&member.alias, &meta.descriptor.primary_key.column);
        if row.get(&pk_label).is_none_or(Value::is_null) {
            return Ok(None);
        }
        let concrete = if meta.source.polymorphic {
            row.get(&label(&member.alias, DISCRIMINATOR))
                .and_then(Value::as_str)
                .ok_or_else(|| serialization(&member.entity_type, DISCRIMINATOR, "missing"))?
                .to_string()
        } else {
            member.entity_type.clone()
        };
        self.hydrate(&concrete, row, &member.alias).map(Some)
    }

    /// Identity-map lookup, or a new persistent slot built from the row
    fn hydrate(&mut self, entity_type: &str, row: &Row, alias: &str) -> Result<usize> {
        let registry = self.registry;
        let meta = registry.entity(entity_type)?;
        let key = read_key(meta, row, alias)?;
        if let Some(existing) = self.map.lookup(&meta.root, &key) {
            return Ok(existing);
        }

        let (values, fks) = read_state(meta, row, alias)?;
        let mut slot = Slot::new(entity_type, &meta.root);
        self.install_state(&mut slot, meta, values, fks)?;
        slot.key = Some(key);
        slot.state = EntityState::Persistent;
        slot.in_store = true;
        slot.seq = self.map.next_seq();
        slot.load_seq = Some(slot.seq);
        let i = self.map.push(slot);
        self.map.register(i);
        self.stats.entities_loaded += 1;
        Ok(i)
    }

    fn install_state(
        &self,
        slot: &mut Slot,
        meta: &EntityMeta,
        values: BTreeMap<String, Value>,
        fks: BTreeMap<String, Option<Key>>,
    ) -> Result<()> {
        slot.snapshot = values.clone();
        slot.values = values;
        slot.to_one.clear();
        slot.collections.clear();
        for rel in meta.relationships.values() {
            let name = rel.name().to_string();
            if rel.is_to_many() {
                slot.collections.insert(name, Collection::Unloaded);
            } else if let Some(fk) = fks.get(&name) {
                slot.to_one
                    .insert(name, self.resolve_fk(rel.target(), fk.clone())?);
            } else {
                slot.to_one.insert(name, ToOne::Unloaded { fk: None });
            }
        }
        slot.fk_snapshot = fks;
        Ok(())
    }

    /// Re-read the slot's row, discarding in-memory changes
    pub(crate) fn reload(&mut self, slot: usize) -> Result<()> {
        let registry = self.registry;
        let (entity_type, key) = {
            let s = self.map.get(slot).ok_or(RelmapError::ForeignEntity)?;
            (s.entity_type.clone(), s.key.clone())
        };
        let meta = registry.entity(&entity_type)?;
        let key = key.ok_or_else(|| RelmapError::MissingPrimaryKey {
            entity_type: entity_type.clone(),
            field: meta.descriptor.primary_key.field.clone(),
        })?;

        let mut select = Select::from(&meta.descriptor.table, "t0");
        for column in meta.table_columns() {
            select.column("t0", &column);
        }
        select.condition(format!("t0.{} = ?", meta.descriptor.primary_key.column));
        let statement = Statement::new(select.to_sql()).bind(key.to_value());
        let rows = self.query(&statement)?;
        let row = rows.first().ok_or_else(|| RelmapError::EntityNotFound {
            entity_type: entity_type.clone(),
            key: key.to_string(),
        })?;

        let (values, fks) = read_state(meta, row, "t0")?;
        let mut refreshed = self
            .map
            .get(slot)
            .cloned()
            .ok_or(RelmapError::ForeignEntity)?;
        self.install_state(&mut refreshed, meta, values, fks)?;
        if let Some(s) = self.map.get_mut(slot) {
            *s = refreshed;
        }
        Ok(())
    }
}

fn read_key(meta: &EntityMeta, row: &Row, alias: &str) -> Result<Key> {
    let pk = &meta.descriptor.primary_key;
    let raw = row
        .get(&label(alias, &pk.column))
        .cloned()
        .unwrap_or(Value::Null);
    let value = pk
        .ty
        .coerce(raw)
        .map_err(|e| serialization(meta.name(), &pk.field, e))?;
    Key::from_value(&value).ok_or_else(|| serialization(meta.name(), &pk.field, "null key"))
}

/// Column values and stored foreign keys of a row
fn read_state(
    meta: &EntityMeta,
    row: &Row,
    alias: &str,
) -> Result<(BTreeMap<String, Value>, BTreeMap<String, Option<Key>>)> {
    let mut values = BTreeMap::new();
    for column in &meta.descriptor.columns {
        let raw = row
            .get(&label(alias, &column.column))
            .cloned()
            .unwrap_or(Value::Null);
        let value = column
            .to_field(raw)
            .map_err(|e| serialization(meta.name(), &column.field, e))?;
        values.insert(column.field.clone(), value);
    }
    let mut fks = BTreeMap::new();
    for rel in meta.relationships.values() {
        if let AssociationMapping::FkOnSource { column } = &rel.mapping {
            let fk = row
                .get(&label(alias, column))
                .and_then(Key::from_value);
            fks.insert(rel.name().to_string(), fk);
        }
    }
    Ok((values, fks))
}

/// Resolve a query filter to (column, coerced value, sensitive)
fn filter_column(
    meta: &EntityMeta,
    registry: &crate::registry::Registry,
    field: &str,
    value: Value,
) -> Result<(String, Value, bool)> {
    let desc = &meta.descriptor;
    let invalid = |reason: String| RelmapError::InvalidValue {
        entity_type: desc.name.clone(),
        field: field.to_string(),
        reason,
    };
    if field == desc.primary_key.field {
        let v = desc.primary_key.ty.coerce(value).map_err(invalid)?;
        return Ok((desc.primary_key.column.clone(), v, false));
    }
    if let Some(column) = desc.column_for(field) {
        let v = column
            .accept(value)
            .and_then(|v| column.to_store(v))
            .map_err(invalid)?;
        return Ok((column.column.clone(), v, column.sensitive));
    }
    if let Some(rel) = meta.relationships.get(field) {
        if let AssociationMapping::FkOnSource { column } = &rel.mapping {
            let target_pk = &registry.describe(rel.target())?.primary_key;
            let v = target_pk.ty.coerce(value).map_err(invalid)?;
            return Ok((column.clone(), v, false));
        }
    }
    Err(RelmapError::UnknownField {
        entity_type: desc.name.clone(),
        field: field.to_string(),
    })
}
