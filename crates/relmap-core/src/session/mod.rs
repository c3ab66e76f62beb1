//! Unit of work
//!
//! A [`UnitOfWork`] is the persistence context: it owns the identity map,
//! tracks the lifecycle state of every entity it has seen, loads associations
//! on demand and writes all pending changes in one store transaction on
//! [`UnitOfWork::commit`].

mod identity;

pub use identity::{EntityRef, EntityState};
pub(crate) use identity::{Collection, IdentityMap, Slot, ToOne};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use relmap_core_types::{RequestContext, UnitOfWorkId};
use uuid::Uuid;

use crate::cascade;
use crate::config::SessionConfig;
use crate::errors::{RelmapError, Result};
use crate::fetch::{FetchPlan, FetchPlanner, FetchRequest};
use crate::flush;
use crate::logging_facility::render_params;
use crate::model::component::member_field;
use crate::model::{CascadeOp, EntityData, Key, Value};
use crate::registry::{AssociationMapping, Registry};
use crate::sql::Statement;
use crate::stats::Statistics;
use crate::store::{Row, RowStore};
use crate::{log_op_end, log_op_error, log_op_start};

static NEXT_HANDLE_TAG: AtomicU64 = AtomicU64::new(1);

/// Root-entity query
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub(crate) entity_type: String,
    pub(crate) filters: Vec<(String, Value)>,
    pub(crate) fetch: FetchRequest,
}

impl Query {
    /// All entities of a type (including subtypes), ordered by key
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            filters: Vec::new(),
            fetch: FetchRequest::Declared,
        }
    }

    /// Equality filter on a field, or on the target key of an owning to-one
    /// relationship. `Value::Null` matches NULL.
    #[must_use]
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    /// Join the given relationship path into the query
    #[must_use]
    pub fn join_fetch(mut self, path: impl Into<String>) -> Self {
        match &mut self.fetch {
            FetchRequest::JoinFetch(paths) => paths.push(path.into()),
            _ => self.fetch = FetchRequest::JoinFetch(vec![path.into()]),
        }
        self
    }

    /// Load according to a fetch graph instead of the declared modes
    #[must_use]
    pub fn with_graph(mut self, graph: crate::model::FetchGraph) -> Self {
        self.fetch = FetchRequest::Graph(graph);
        self
    }

    /// Load according to a graph declared on the root type
    #[must_use]
    pub fn named_graph(mut self, name: impl Into<String>) -> Self {
        self.fetch = FetchRequest::NamedGraph(name.into());
        self
    }

    #[must_use]
    pub fn fetch(mut self, request: FetchRequest) -> Self {
        self.fetch = request;
        self
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn fetch_request(&self) -> &FetchRequest {
        &self.fetch
    }
}

/// Persistence context bound to one store connection
pub struct UnitOfWork<'a, S: RowStore + ?Sized> {
    pub(crate) registry: &'a Registry,
    pub(crate) store: &'a mut S,
    pub(crate) config: SessionConfig,
    pub(crate) map: IdentityMap,
    pub(crate) stats: Statistics,
    pub(crate) id: UnitOfWorkId,
    pub(crate) context: RequestContext,
    pub(crate) tag: u64,
    pub(crate) closed: bool,
}

impl<'a, S: RowStore + ?Sized> UnitOfWork<'a, S> {
    pub fn new(registry: &'a Registry, store: &'a mut S) -> Self {
        Self::with_config(registry, store, SessionConfig::default())
    }

    pub fn with_config(registry: &'a Registry, store: &'a mut S, config: SessionConfig) -> Self {
        Self {
            registry,
            store,
            config,
            map: IdentityMap::default(),
            stats: Statistics::default(),
            id: UnitOfWorkId::new(),
            context: RequestContext::new(),
            tag: NEXT_HANDLE_TAG.fetch_add(1, Ordering::Relaxed),
            closed: false,
        }
    }

    /// Attach the caller's request context for log and error correlation
    #[must_use]
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn id(&self) -> &UnitOfWorkId {
        &self.id
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub fn registry(&self) -> &'a Registry {
        self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn statistics(&self) -> Statistics {
        self.stats
    }

    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Plan a query without running it
    pub fn plan(&self, query: &Query) -> Result<FetchPlan> {
        FetchPlanner::new(self.registry, &self.config).plan(&query.entity_type, &query.fetch)
    }

    // ===== handles =====

    pub(crate) fn handle(&self, slot: usize) -> EntityRef {
        EntityRef {
            uow: self.tag,
            epoch: self.map.epoch(),
            slot,
        }
    }

    pub(crate) fn slot_index(&self, entity: EntityRef) -> Result<usize> {
        if entity.uow != self.tag {
            return Err(RelmapError::ForeignEntity);
        }
        if entity.epoch != self.map.epoch() {
            return Err(RelmapError::ReleasedEntity);
        }
        if entity.slot >= self.map.len() {
            return Err(RelmapError::ForeignEntity);
        }
        Ok(entity.slot)
    }

    pub(crate) fn slot(&self, entity: EntityRef) -> Result<&Slot> {
        let i = self.slot_index(entity)?;
        self.map.get(i).ok_or(RelmapError::ForeignEntity)
    }

    pub(crate) fn slot_mut(&mut self, entity: EntityRef) -> Result<&mut Slot> {
        let i = self.slot_index(entity)?;
        self.map.get_mut(i).ok_or(RelmapError::ForeignEntity)
    }

    pub(crate) fn ensure_open(&self, op: &str) -> Result<()> {
        if self.closed {
            return Err(RelmapError::UnitOfWorkClosed { op: op.to_string() });
        }
        Ok(())
    }

    /// Whether the entity is the managed instance of its identity here
    pub fn contains(&self, entity: EntityRef) -> bool {
        self.slot_index(entity)
            .map(|i| self.map.is_managed(i))
            .unwrap_or(false)
    }

    pub fn state(&self, entity: EntityRef) -> Result<EntityState> {
        Ok(self.slot(entity)?.state)
    }

    pub fn entity_type(&self, entity: EntityRef) -> Result<&str> {
        Ok(self.slot(entity)?.entity_type.as_str())
    }

    pub fn key(&self, entity: EntityRef) -> Result<Option<Key>> {
        Ok(self.slot(entity)?.key.clone())
    }

    /// Whether the association has been materialised
    pub fn is_loaded(&self, entity: EntityRef, relationship: &str) -> Result<bool> {
        let slot = self.slot(entity)?;
        self.registry.relationship(&slot.entity_type, relationship)?;
        Ok(match (slot.collections.get(relationship), slot.to_one.get(relationship)) {
            (Some(Collection::Loaded { .. }), _) => true,
            (_, Some(ToOne::Loaded { .. })) => true,
            _ => false,
        })
    }

    /// Number of entities currently managed
    pub fn managed_count(&self) -> usize {
        self.map.managed().len()
    }

    /// Number of entities held in memory, managed or not. Drops to zero on
    /// [`UnitOfWork::clear`].
    pub fn retained_count(&self) -> usize {
        self.map.len()
    }

    // ===== creation =====

    /// New transient entity of a concrete type
    pub fn create(&mut self, entity_type: &str) -> Result<EntityRef> {
        let meta = self.registry.entity(entity_type)?;
        if meta.descriptor.is_abstract {
            return Err(RelmapError::InvalidState {
                op: "create".to_string(),
                entity_type: entity_type.to_string(),
                state: "abstract".to_string(),
            });
        }
        let mut slot = Slot::new(entity_type, &meta.root);
        for rel in meta.relationships.values() {
            if rel.is_to_many() {
                slot.collections
                    .insert(rel.name().to_string(), Collection::empty());
            } else {
                slot.to_one.insert(rel.name().to_string(), ToOne::fresh(None));
            }
        }
        let i = self.map.push(slot);
        Ok(self.handle(i))
    }

    /// New transient entity initialised from `data`
    pub fn create_from(&mut self, data: &EntityData) -> Result<EntityRef> {
        let entity = self.create(&data.entity_type)?;
        for (field, value) in &data.values {
            self.set(entity, field, value.clone())?;
        }
        Ok(entity)
    }

    /// Track a row that already exists in the store
    ///
    /// Returns the existing handle when the identity is already managed; the
    /// managed state is not overwritten.
    pub fn attach(&mut self, data: &EntityData) -> Result<EntityRef> {
        self.ensure_open("attach")?;
        let meta = self.registry.entity(&data.entity_type)?;
        let pk = &meta.descriptor.primary_key;
        let key = data
            .values
            .get(&pk.field)
            .and_then(Key::from_value)
            .ok_or_else(|| RelmapError::MissingPrimaryKey {
                entity_type: data.entity_type.clone(),
                field: pk.field.clone(),
            })?;
        if let Some(existing) = self.map.lookup(&meta.root, &key) {
            return Ok(self.handle(existing));
        }
        if meta.descriptor.is_abstract {
            return Err(RelmapError::InvalidState {
                op: "attach".to_string(),
                entity_type: data.entity_type.clone(),
                state: "abstract".to_string(),
            });
        }

        let mut slot = Slot::new(&data.entity_type, &meta.root);
        for (field, value) in &data.values {
            if field == &pk.field {
                continue;
            }
            let column = meta.descriptor.column_for(field).ok_or_else(|| {
                RelmapError::UnknownField {
                    entity_type: data.entity_type.clone(),
                    field: field.clone(),
                }
            })?;
            let coerced = column.accept(value.clone()).map_err(|reason| {
                RelmapError::InvalidValue {
                    entity_type: data.entity_type.clone(),
                    field: field.clone(),
                    reason,
                }
            })?;
            slot.values.insert(field.clone(), coerced);
        }
        for rel in meta.relationships.values() {
            let name = rel.name().to_string();
            if rel.is_to_many() {
                slot.collections.insert(name, Collection::Unloaded);
                continue;
            }
            let to_one = match &rel.mapping {
                AssociationMapping::FkOnSource { .. } => {
                    let fk = data.references.get(&name).cloned();
                    slot.fk_snapshot.insert(name.clone(), fk.clone());
                    self.resolve_fk(rel.target(), fk)?
                }
                _ => ToOne::Unloaded { fk: None },
            };
            slot.to_one.insert(name, to_one);
        }
        slot.snapshot = slot.values.clone();
        slot.key = Some(key);
        slot.state = EntityState::Persistent;
        slot.in_store = true;
        slot.seq = self.map.next_seq();
        slot.load_seq = Some(slot.seq);
        let i = self.map.push(slot);
        self.map.register(i);
        Ok(self.handle(i))
    }

    /// To-one state for a stored foreign key: loaded when the target is
    /// already managed or the key is null
    pub(crate) fn resolve_fk(&self, target_type: &str, fk: Option<Key>) -> Result<ToOne> {
        let root = self.registry.root_of(target_type)?;
        Ok(match fk {
            None => ToOne::fresh(None),
            Some(key) => match self.map.lookup(root, &key) {
                Some(target) => ToOne::fresh(Some(target)),
                None => ToOne::Unloaded { fk: Some(key) },
            },
        })
    }

    // ===== field access =====

    /// Value of a field or of the primary key. Unset fields read as null.
    pub fn get(&self, entity: EntityRef, field: &str) -> Result<Value> {
        let slot = self.slot(entity)?;
        let desc = self.registry.describe(&slot.entity_type)?;
        if field == desc.primary_key.field {
            return Ok(slot.key.as_ref().map(Key::to_value).unwrap_or(Value::Null));
        }
        if desc.column_for(field).is_none() {
            return Err(RelmapError::UnknownField {
                entity_type: slot.entity_type.clone(),
                field: field.to_string(),
            });
        }
        Ok(slot.values.get(field).cloned().unwrap_or(Value::Null))
    }

    /// Members of an embedded component by member name, `None` when every
    /// member is null
    pub fn component(
        &self,
        entity: EntityRef,
        field: &str,
    ) -> Result<Option<BTreeMap<String, Value>>> {
        let slot = self.slot(entity)?;
        let members = self.members(&slot.entity_type, field)?;
        let values: BTreeMap<String, Value> = members
            .iter()
            .map(|member| {
                let value = slot
                    .values
                    .get(&member_field(field, member))
                    .cloned()
                    .unwrap_or(Value::Null);
                (member.clone(), value)
            })
            .collect();
        if values.values().all(Value::is_null) {
            return Ok(None);
        }
        Ok(Some(values))
    }

    /// Replace every member of an embedded component; members missing from
    /// `values` and a `None` component are stored as null
    pub fn set_component(
        &mut self,
        entity: EntityRef,
        field: &str,
        values: Option<&BTreeMap<String, Value>>,
    ) -> Result<()> {
        let entity_type = self.slot(entity)?.entity_type.clone();
        let members = self.members(&entity_type, field)?;
        if let Some(unknown) = values
            .into_iter()
            .flat_map(BTreeMap::keys)
            .find(|name| !members.contains(*name))
        {
            return Err(RelmapError::UnknownField {
                entity_type,
                field: member_field(field, unknown),
            });
        }
        for member in &members {
            let value = values
                .and_then(|v| v.get(member))
                .cloned()
                .unwrap_or(Value::Null);
            self.set(entity, &member_field(field, member), value)?;
        }
        Ok(())
    }

    fn members(&self, entity_type: &str, field: &str) -> Result<Vec<String>> {
        self.registry
            .describe(entity_type)?
            .components
            .get(field)
            .cloned()
            .ok_or_else(|| RelmapError::UnknownField {
                entity_type: entity_type.to_string(),
                field: field.to_string(),
            })
    }

    /// Set a field. The value is coerced to the column type.
    pub fn set(&mut self, entity: EntityRef, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let registry = self.registry;
        let entity_type = self.slot(entity)?.entity_type.clone();
        let desc = registry.describe(&entity_type)?;
        let invalid = |reason: String| RelmapError::InvalidValue {
            entity_type: entity_type.clone(),
            field: field.to_string(),
            reason,
        };

        if field == desc.primary_key.field {
            let coerced = desc.primary_key.ty.coerce(value).map_err(invalid)?;
            let slot = self.slot(entity)?;
            if slot.state != EntityState::Transient {
                if slot.key.as_ref().map(Key::to_value) == Some(coerced) {
                    return Ok(());
                }
                return Err(invalid("primary key of a tracked entity is immutable".to_string()));
            }
            let key = Key::from_value(&coerced);
            self.slot_mut(entity)?.key = key;
            return Ok(());
        }

        let column = desc
            .column_for(field)
            .ok_or_else(|| RelmapError::UnknownField {
                entity_type: entity_type.clone(),
                field: field.to_string(),
            })?;
        let coerced = column.accept(value).map_err(invalid)?;
        if coerced.is_null() && !column.nullable {
            tracing::debug!(
                entity_type = %entity_type,
                field,
                "null assigned to NOT NULL column; the store will reject it on commit"
            );
        }
        let slot = self.slot_mut(entity)?;
        if slot.state == EntityState::Removed {
            return Err(RelmapError::InvalidState {
                op: "set".to_string(),
                entity_type,
                state: EntityState::Removed.to_string(),
            });
        }
        slot.values.insert(field.to_string(), coerced);
        Ok(())
    }

    /// Detached copy of the entity's values and foreign keys
    pub fn snapshot(&self, entity: EntityRef) -> Result<EntityData> {
        let slot = self.slot(entity)?;
        let meta = self.registry.entity(&slot.entity_type)?;
        let mut data = EntityData::new(slot.entity_type.clone());
        if let Some(key) = &slot.key {
            data.values
                .insert(meta.descriptor.primary_key.field.clone(), key.to_value());
        }
        for (field, value) in &slot.values {
            data.values.insert(field.clone(), value.clone());
        }
        for rel in meta.descriptor.foreign_keys() {
            if let Some(key) = self.map.current_fk(slot, &rel.name) {
                data.references.insert(rel.name.clone(), key);
            }
        }
        Ok(data)
    }

    // ===== reading =====

    /// Entity by key, from the identity map or else the store
    ///
    /// Returns `None` when no row exists or the managed instance is scheduled
    /// for removal.
    pub fn find(&mut self, entity_type: &str, key: impl Into<Key>) -> Result<Option<EntityRef>> {
        let key = key.into();
        self.ensure_open("find")?;
        let root = self.registry.root_of(entity_type)?.to_string();
        if let Some(i) = self.map.lookup(&root, &key) {
            let slot = self.map.get(i).ok_or(RelmapError::ForeignEntity)?;
            if !self.registry.is_a(&slot.entity_type, entity_type)
                || slot.state == EntityState::Removed
            {
                return Ok(None);
            }
            return Ok(Some(self.handle(i)));
        }
        let pk = self.registry.describe(entity_type)?.primary_key.field.clone();
        let found = self.traced("find", entity_type, |uow| {
            uow.list(&Query::new(entity_type).filter(pk, key.to_value()))
        })?;
        Ok(found.into_iter().next())
    }

    /// Like [`UnitOfWork::find`] but fails with `EntityNotFound`
    pub fn get_by_key(&mut self, entity_type: &str, key: impl Into<Key>) -> Result<EntityRef> {
        let key = key.into();
        self.find(entity_type, key.clone())?
            .ok_or_else(|| RelmapError::EntityNotFound {
                entity_type: entity_type.to_string(),
                key: key.to_string(),
            })
    }

    /// Run a root query; results are deduplicated through the identity map
    pub fn list(&mut self, query: &Query) -> Result<Vec<EntityRef>> {
        self.ensure_open("list")?;
        let plan = self.plan(query)?;
        let slots = self.load_roots(query, &plan)?;
        Ok(slots.into_iter().map(|i| self.handle(i)).collect())
    }

    /// Targets of a relationship, loading it on first access
    ///
    /// For to-one relationships the result has at most one element.
    pub fn related(&mut self, entity: EntityRef, relationship: &str) -> Result<Vec<EntityRef>> {
        let i = self.slot_index(entity)?;
        self.ensure_loaded(i, relationship)?;
        let slot = self.slot(entity)?;
        let targets: Vec<usize> = match (
            slot.collections.get(relationship),
            slot.to_one.get(relationship),
        ) {
            (Some(Collection::Loaded { items, .. }), _) => items.clone(),
            (_, Some(ToOne::Loaded { current, .. })) => current.iter().copied().collect(),
            _ => Vec::new(),
        };
        Ok(targets.into_iter().map(|t| self.handle(t)).collect())
    }

    /// Target of a to-one relationship, loading it on first access
    pub fn related_one(
        &mut self,
        entity: EntityRef,
        relationship: &str,
    ) -> Result<Option<EntityRef>> {
        let entity_type = self.slot(entity)?.entity_type.clone();
        if self.registry.relationship(&entity_type, relationship)?.is_to_many() {
            return Err(RelmapError::InvalidValue {
                entity_type,
                field: relationship.to_string(),
                reason: "relationship is a collection".to_string(),
            });
        }
        Ok(self.related(entity, relationship)?.into_iter().next())
    }

    // ===== association editing =====

    /// Add `item` to a collection, this side only
    pub fn add_to(&mut self, owner: EntityRef, relationship: &str, item: EntityRef) -> Result<()> {
        let (o, t) = (self.slot_index(owner)?, self.slot_index(item)?);
        self.expect_collection(o, relationship)?;
        self.check_target(o, relationship, t)?;
        self.ensure_loaded(o, relationship)?;
        if let Some(Collection::Loaded { items, .. }) = self
            .map
            .get_mut(o)
            .and_then(|s| s.collections.get_mut(relationship))
        {
            if !items.contains(&t) {
                items.push(t);
            }
        }
        Ok(())
    }

    /// Remove `item` from a collection, this side only
    pub fn remove_from(
        &mut self,
        owner: EntityRef,
        relationship: &str,
        item: EntityRef,
    ) -> Result<()> {
        let (o, t) = (self.slot_index(owner)?, self.slot_index(item)?);
        self.expect_collection(o, relationship)?;
        self.ensure_loaded(o, relationship)?;
        if let Some(Collection::Loaded { items, .. }) = self
            .map
            .get_mut(o)
            .and_then(|s| s.collections.get_mut(relationship))
        {
            items.retain(|x| *x != t);
        }
        Ok(())
    }

    /// Point a to-one relationship at `target`, this side only
    pub fn set_reference(
        &mut self,
        owner: EntityRef,
        relationship: &str,
        target: Option<EntityRef>,
    ) -> Result<()> {
        let o = self.slot_index(owner)?;
        let t = target.map(|t| self.slot_index(t)).transpose()?;
        let entity_type = self.map.get(o).map(|s| s.entity_type.clone()).unwrap_or_default();
        let rel = self.registry.relationship(&entity_type, relationship)?;
        if rel.is_to_many() {
            return Err(RelmapError::InvalidValue {
                entity_type,
                field: relationship.to_string(),
                reason: "relationship is a collection".to_string(),
            });
        }
        if let Some(t) = t {
            self.check_target(o, relationship, t)?;
        }
        // Learn the original target first so orphan detection sees it
        if self.can_load(o) {
            self.ensure_loaded(o, relationship)?;
        }
        let slot = self.map.get_mut(o).ok_or(RelmapError::ForeignEntity)?;
        let original = match slot.to_one.get(relationship) {
            Some(ToOne::Loaded { original, .. }) => *original,
            _ => None,
        };
        slot.to_one.insert(
            relationship.to_string(),
            ToOne::Loaded {
                current: t,
                original,
            },
        );
        Ok(())
    }

    /// Associate `a` and `b` on both sides of a relationship
    pub fn link(&mut self, a: EntityRef, relationship: &str, b: EntityRef) -> Result<()> {
        let (ai, bi) = (self.slot_index(a)?, self.slot_index(b)?);
        let entity_type = self.map.get(ai).map(|s| s.entity_type.clone()).unwrap_or_default();
        let rel = self.registry.relationship(&entity_type, relationship)?.clone();
        self.check_target(ai, relationship, bi)?;

        if rel.is_to_many() {
            self.add_to(a, relationship, b)?;
        } else {
            let previous = self.current_target(ai, relationship)?;
            if let (Some(previous), Some(inverse)) = (previous, &rel.inverse) {
                if previous != bi {
                    self.drop_back_reference(previous, inverse, ai)?;
                }
            }
            self.set_reference(a, relationship, Some(b))?;
        }

        if let Some(inverse) = &rel.inverse {
            let b_type = self.map.get(bi).map(|s| s.entity_type.clone()).unwrap_or_default();
            let back = self.registry.relationship(&b_type, inverse)?;
            if back.is_to_many() {
                self.add_to(b, inverse, a)?;
            } else {
                if let Some(previous) = self.current_target(bi, inverse)? {
                    if previous != ai {
                        self.drop_back_reference(previous, relationship, bi)?;
                    }
                }
                self.set_reference(b, inverse, Some(a))?;
            }
        }
        Ok(())
    }

    /// Dissociate `a` and `b` on both sides of a relationship
    pub fn unlink(&mut self, a: EntityRef, relationship: &str, b: EntityRef) -> Result<()> {
        let (ai, bi) = (self.slot_index(a)?, self.slot_index(b)?);
        let entity_type = self.map.get(ai).map(|s| s.entity_type.clone()).unwrap_or_default();
        let rel = self.registry.relationship(&entity_type, relationship)?.clone();

        if rel.is_to_many() {
            self.remove_from(a, relationship, b)?;
        } else if self.current_target(ai, relationship)? == Some(bi) {
            self.set_reference(a, relationship, None)?;
        }

        if let Some(inverse) = &rel.inverse {
            self.drop_back_reference(bi, inverse, ai)?;
        }
        Ok(())
    }

    /// Remove `target` from `owner.relationship` without loading anything
    fn drop_back_reference(&mut self, owner: usize, relationship: &str, target: usize) -> Result<()> {
        let loaded = self.is_loaded(self.handle(owner), relationship)?;
        let slot = self.map.get_mut(owner).ok_or(RelmapError::ForeignEntity)?;
        if let Some(Collection::Loaded { items, .. }) = slot.collections.get_mut(relationship) {
            items.retain(|x| *x != target);
            return Ok(());
        }
        let points_back = matches!(
            slot.to_one.get(relationship),
            Some(ToOne::Loaded { current: Some(t), .. }) if *t == target
        );
        if points_back {
            return self.set_reference(self.handle(owner), relationship, None);
        }
        if !loaded && slot.to_one.contains_key(relationship) {
            // Unloaded to-one: its stored key may still point at `target`
            if self.can_load(owner) {
                self.ensure_loaded(owner, relationship)?;
                if self.loaded_target(owner, relationship) == Some(target) {
                    return self.set_reference(self.handle(owner), relationship, None);
                }
            }
        }
        Ok(())
    }

    fn loaded_target(&self, slot: usize, relationship: &str) -> Option<usize> {
        match self.map.get(slot)?.to_one.get(relationship)? {
            ToOne::Loaded { current, .. } => *current,
            ToOne::Unloaded { .. } => None,
        }
    }

    fn current_target(&mut self, slot: usize, relationship: &str) -> Result<Option<usize>> {
        if self.can_load(slot) {
            self.ensure_loaded(slot, relationship)?;
        }
        Ok(self.loaded_target(slot, relationship))
    }

    fn expect_collection(&self, owner: usize, relationship: &str) -> Result<()> {
        let entity_type = self.map.get(owner).map(|s| s.entity_type.clone()).unwrap_or_default();
        if !self.registry.relationship(&entity_type, relationship)?.is_to_many() {
            return Err(RelmapError::InvalidValue {
                entity_type,
                field: relationship.to_string(),
                reason: "relationship is not a collection".to_string(),
            });
        }
        Ok(())
    }

    fn check_target(&self, owner: usize, relationship: &str, target: usize) -> Result<()> {
        let owner_type = self.map.get(owner).map(|s| s.entity_type.clone()).unwrap_or_default();
        let target_type = self.map.get(target).map(|s| s.entity_type.clone()).unwrap_or_default();
        let rel = self.registry.relationship(&owner_type, relationship)?;
        if !self.registry.is_a(&target_type, rel.target()) {
            return Err(RelmapError::InvalidValue {
                entity_type: owner_type,
                field: relationship.to_string(),
                reason: format!("expected {}, got {}", rel.target(), target_type),
            });
        }
        Ok(())
    }

    /// Whether unloaded associations of the slot can still be fetched
    pub(crate) fn can_load(&self, slot: usize) -> bool {
        !self.closed
            && self.map.is_managed(slot)
            && self
                .map
                .get(slot)
                .is_some_and(|s| s.in_store && s.state != EntityState::Detached)
    }

    // ===== lifecycle =====

    /// Make a transient entity persistent, cascading along `persist` edges
    ///
    /// All checks run before any state changes: a failure leaves every
    /// entity as it was.
    pub fn persist(&mut self, entity: EntityRef) -> Result<()> {
        self.ensure_open("persist")?;
        let i = self.slot_index(entity)?;
        self.traced("persist", "", |uow| {
            cascade::persist(uow.registry, &mut uow.map, i, &mut || {
                Key::Text(Uuid::now_v7().to_string())
            })
        })
    }

    /// Schedule deletion on commit, cascading along `remove` edges
    ///
    /// Removing a transient entity is a no-op; removing a detached entity
    /// fails with `InvalidState`.
    pub fn remove(&mut self, entity: EntityRef) -> Result<()> {
        self.ensure_open("remove")?;
        let i = self.slot_index(entity)?;
        let slot = self.slot(entity)?;
        match slot.state {
            EntityState::Transient | EntityState::Removed => return Ok(()),
            EntityState::Detached => {
                return Err(RelmapError::InvalidState {
                    op: "remove".to_string(),
                    entity_type: slot.entity_type.clone(),
                    state: slot.state.to_string(),
                })
            }
            EntityState::Persistent => {}
        }
        self.traced("remove", "", |uow| {
            uow.preload_cascade(&[i], CascadeOp::Remove)?;
            cascade::remove(uow.registry, &mut uow.map, i);
            Ok(())
        })
    }

    /// Alias of [`UnitOfWork::remove`]
    pub fn mark_removed(&mut self, entity: EntityRef) -> Result<()> {
        self.remove(entity)
    }

    /// Stop tracking the entity, cascading along `detach` edges. Pending
    /// changes of detached entities are not written.
    pub fn detach(&mut self, entity: EntityRef) -> Result<()> {
        let i = self.slot_index(entity)?;
        cascade::detach(self.registry, &mut self.map, i);
        Ok(())
    }

    /// Copy the state of a detached entity of this unit of work onto the
    /// managed instance of its identity, cascading along `merge` edges
    pub fn merge(&mut self, entity: EntityRef) -> Result<EntityRef> {
        self.ensure_open("merge")?;
        let i = self.slot_index(entity)?;
        let graph = cascade::DetachedGraph::collect(self.registry, &self.map, i)?;
        let merged = self.traced("merge", "", |uow| uow.apply_merge(&graph))?;
        Ok(self.handle(merged))
    }

    /// Merge an entity from another unit of work (typically a closed one)
    pub fn merge_from<T: RowStore + ?Sized>(
        &mut self,
        source: &UnitOfWork<'_, T>,
        entity: EntityRef,
    ) -> Result<EntityRef> {
        self.ensure_open("merge")?;
        let i = source.slot_index(entity)?;
        let graph = cascade::DetachedGraph::collect(source.registry, &source.map, i)?;
        let merged = self.traced("merge", "", |uow| uow.apply_merge(&graph))?;
        Ok(self.handle(merged))
    }

    /// Merge plain detached data (no associations besides foreign keys)
    pub fn merge_data(&mut self, data: &EntityData) -> Result<EntityRef> {
        self.ensure_open("merge")?;
        let graph = cascade::DetachedGraph::from_data(self.registry, data)?;
        let merged = self.traced("merge", &data.entity_type, |uow| uow.apply_merge(&graph))?;
        Ok(self.handle(merged))
    }

    fn apply_merge(&mut self, graph: &cascade::DetachedGraph) -> Result<usize> {
        let mut targets = Vec::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            let existing = match &node.key {
                Some(key) => self.find(&node.entity_type, key.clone())?.map(|e| e.slot),
                None => None,
            };
            let target = match existing {
                Some(t) => t,
                None => {
                    let created = self.create(&node.entity_type)?;
                    if let Some(key) = &node.key {
                        let pk = self.registry.describe(&node.entity_type)?.primary_key.field.clone();
                        self.set(created, &pk, key.to_value())?;
                    }
                    self.persist_single(created.slot)?;
                    created.slot
                }
            };
            targets.push(target);
        }

        for (node, &target) in graph.nodes.iter().zip(&targets) {
            let handle = self.handle(target);
            for (field, value) in &node.values {
                self.set(handle, field, value.clone())?;
            }
            for (relationship, reference) in &node.references {
                let resolved = match reference {
                    cascade::MergedRef::Node(n) => ToOne::fresh(targets.get(*n).copied()),
                    cascade::MergedRef::Key(fk) => {
                        let target_type = self
                            .registry
                            .relationship(&node.entity_type, relationship)?
                            .target()
                            .to_string();
                        self.resolve_fk(&target_type, fk.clone())?
                    }
                };
                let slot = self.map.get_mut(target).ok_or(RelmapError::ForeignEntity)?;
                let original = match slot.to_one.get(relationship) {
                    Some(ToOne::Loaded { original, .. }) => *original,
                    _ => None,
                };
                let current = match resolved {
                    ToOne::Loaded { current, .. } => current,
                    unloaded @ ToOne::Unloaded { .. } => {
                        slot.to_one.insert(relationship.clone(), unloaded);
                        continue;
                    }
                };
                slot.to_one
                    .insert(relationship.clone(), ToOne::Loaded { current, original });
            }
            for (relationship, members) in &node.collections {
                if self.can_load(target) {
                    self.ensure_loaded(target, relationship)?;
                }
                let items: Vec<usize> = members.iter().filter_map(|n| targets.get(*n).copied()).collect();
                let slot = self.map.get_mut(target).ok_or(RelmapError::ForeignEntity)?;
                match slot.collections.get_mut(relationship) {
                    Some(Collection::Loaded { items: current, .. }) => *current = items,
                    _ => {
                        slot.collections.insert(
                            relationship.clone(),
                            Collection::Loaded {
                                items,
                                snapshot: Vec::new(),
                            },
                        );
                    }
                }
            }
        }
        targets.first().copied().ok_or_else(|| RelmapError::Serialization {
            message: "merge of an empty graph".to_string(),
        })
    }

    fn persist_single(&mut self, slot: usize) -> Result<()> {
        cascade::persist_one(self.registry, &mut self.map, slot, &mut || {
            Key::Text(Uuid::now_v7().to_string())
        })
    }

    /// Reload the entity's columns and foreign keys from the store,
    /// discarding unflushed changes, cascading along `refresh` edges.
    /// Collections are reset and reload on next access.
    pub fn refresh(&mut self, entity: EntityRef) -> Result<()> {
        self.ensure_open("refresh")?;
        let i = self.slot_index(entity)?;
        let slot = self.slot(entity)?;
        if slot.state != EntityState::Persistent || !slot.in_store || !self.map.is_managed(i) {
            return Err(RelmapError::InvalidState {
                op: "refresh".to_string(),
                entity_type: slot.entity_type.clone(),
                state: if slot.in_store {
                    slot.state.to_string()
                } else {
                    "not yet stored".to_string()
                },
            });
        }
        let targets = cascade::reachable(self.registry, &self.map, i, CascadeOp::Refresh);
        self.traced("refresh", "", |uow| {
            for t in targets {
                let stored = uow.map.get(t).is_some_and(|s| s.in_store && s.state == EntityState::Persistent);
                if stored {
                    uow.reload(t)?;
                }
            }
            Ok(())
        })
    }

    /// Drop every entity, pending changes included; the unit of work stays
    /// usable
    ///
    /// Memory held for entities is released, so handles issued before fail
    /// with `ReleasedEntity` afterwards. Keep state across a clear with
    /// [`UnitOfWork::snapshot`] and bring it back with
    /// [`UnitOfWork::merge_data`].
    pub fn clear(&mut self) {
        let released = self.map.len();
        self.map.release();
        tracing::debug!(uow_id = %self.id, released = released as u64, "unit of work cleared");
    }

    /// Detach everything and refuse further store access. Loaded state
    /// stays readable through existing handles.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for slot in self.map.slots_mut() {
            if matches!(slot.state, EntityState::Persistent | EntityState::Removed) {
                slot.state = EntityState::Detached;
            }
        }
        self.map.clear_index();
        self.closed = true;
        tracing::debug!(uow_id = %self.id, "unit of work closed");
    }

    // ===== commit =====

    /// Write all pending changes atomically
    ///
    /// # Errors
    ///
    /// `TransientObject` before anything is written; `ConstraintViolation`
    /// or `Store` after the transaction was rolled back. On error the
    /// in-memory state is unchanged.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open("commit")?;
        log_op_start!("commit", uow_id = %self.id, request_id = %self.context.request_id);
        let start = Instant::now();
        match self.commit_inner() {
            Ok(()) => {
                log_op_end!(
                    "commit",
                    duration_ms = start.elapsed().as_millis() as u64,
                    uow_id = %self.id,
                );
                Ok(())
            }
            Err(err) => {
                log_op_error!(
                    "commit",
                    err.clone(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    uow_id = %self.id,
                );
                Err(err)
            }
        }
    }

    fn commit_inner(&mut self) -> Result<()> {
        let removal_roots = cascade::removal_roots(self.registry, &self.map);
        self.preload_cascade(&removal_roots, CascadeOp::Remove)?;

        let mut staged = self.map.clone();
        let plan = flush::prepare(self.registry, &mut staged, &mut || {
            Key::Text(Uuid::now_v7().to_string())
        })?;

        if !plan.statements.is_empty() {
            self.store
                .begin_transaction()
                .map_err(|e| RelmapError::from_store("commit", e))?;
            if let Err(err) = self.execute_plan(&mut staged, &plan) {
                self.rollback_after_failure();
                return Err(err);
            }
            if let Err(cause) = self.store.commit() {
                self.rollback_after_failure();
                return Err(RelmapError::from_store("commit", cause));
            }
        }

        flush::finish(self.registry, &mut staged, &plan);
        self.map = staged;
        plan.count_into(&mut self.stats);
        self.stats.commits += 1;
        Ok(())
    }

    /// Send the planned writes in order, installing generated keys into
    /// `staged` as their inserts return
    fn execute_plan(&mut self, staged: &mut IdentityMap, plan: &flush::FlushPlan) -> Result<()> {
        for planned in &plan.statements {
            let statement = planned.resolve(staged)?;
            let rows = self.write(&statement)?;
            if let Some(slot) = planned.generates {
                let key = flush::generated_key(&rows).ok_or_else(|| RelmapError::Serialization {
                    message: format!("{}: insert returned no generated key", statement.sql),
                })?;
                tracing::trace!(slot = slot as u64, key = %key, "generated key installed");
                staged.install_key(slot, key);
            }
        }
        Ok(())
    }

    fn rollback_after_failure(&mut self) {
        self.stats.rollbacks += 1;
        if let Err(cause) = self.store.rollback() {
            tracing::warn!(uow_id = %self.id, error = %cause, "rollback after failed commit also failed");
        }
    }

    /// Load unloaded associations along `op` edges of everything reachable
    /// from `roots`, so that cascades see complete graphs
    pub(crate) fn preload_cascade(&mut self, roots: &[usize], op: CascadeOp) -> Result<()> {
        loop {
            let mut pending = Vec::new();
            for &root in roots {
                for slot in cascade::reachable(self.registry, &self.map, root, op) {
                    for relationship in cascade::unloaded_edges(self.registry, &self.map, slot, op) {
                        pending.push((slot, relationship));
                    }
                }
            }
            pending.retain(|(slot, _)| self.can_load(*slot));
            if pending.is_empty() {
                return Ok(());
            }
            for (slot, relationship) in pending {
                self.ensure_loaded(slot, &relationship)?;
            }
        }
    }

    // ===== store round-trips =====

    pub(crate) fn query(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        self.stats.queries_executed += 1;
        let rows = self
            .store
            .execute(&statement.sql, &statement.params)
            .map_err(|e| RelmapError::from_store("query", e))?;
        tracing::debug!(
            uow_id = %self.id,
            request_id = %self.context.request_id,
            sql = %statement.sql,
            params = %render_params(&statement.params, &statement.redact),
            row_count = rows.len() as u64,
            "query"
        );
        Ok(rows)
    }

    fn write(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        self.stats.statements_executed += 1;
        tracing::debug!(
            uow_id = %self.id,
            request_id = %self.context.request_id,
            sql = %statement.sql,
            params = %render_params(&statement.params, &statement.redact),
            "write"
        );
        self.store
            .execute(&statement.sql, &statement.params)
            .map_err(|e| RelmapError::from_store("commit", e))
    }

    /// Run `f` between start/end log events
    fn traced<T>(
        &mut self,
        op: &'static str,
        entity_type: &str,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        log_op_start!(op, uow_id = %self.id, entity_type = entity_type);
        let start = Instant::now();
        let result = f(self);
        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                log_op_end!(op, duration_ms = duration_ms, uow_id = %self.id);
            }
            Err(err) => {
                log_op_error!(op, err.clone(), duration_ms = duration_ms, uow_id = %self.id);
            }
        }
        result
    }
}
