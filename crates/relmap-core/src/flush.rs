//! Flush planning
//!
//! [`prepare`] turns the pending state of a staged identity map into an
//! ordered list of write statements:
//!
//! 1. link rows dropped from owning many-to-many collections
//! 2. inserts, parents before children
//! 3. updates of changed columns and owning foreign keys
//! 4. link rows added to owning many-to-many collections
//! 5. remaining link rows of deleted entities
//! 6. deletes, children before parents
//!
//! Rows with store-generated keys have no key while the plan is built. Their
//! insert omits the key column and returns the generated value, and every
//! later parameter naming that row is resolved against the staged map right
//! before it is sent.
//!
//! [`finish`] rebases the staged map once the store accepted every statement.

use std::collections::HashSet;

use crate::cascade;
use crate::errors::{RelmapError, Result};
use crate::model::{ColumnMapping, Key, Value};
use crate::registry::{AssociationMapping, Registry};
use crate::session::{Collection, EntityState, IdentityMap, Slot, ToOne};
use crate::store::Row;
use crate::sql::{self, Statement};
use crate::stats::Statistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    Insert,
    Update,
    Delete,
    LinkInsert,
    LinkDelete,
}

/// Parameter that takes the generated key of `slot`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeferredKey {
    param: usize,
    slot: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedStatement {
    pub statement: Statement,
    pub kind: WriteKind,
    deferred: Vec<DeferredKey>,
    /// Slot receiving the key this insert returns
    pub generates: Option<usize>,
}

impl PlannedStatement {
    /// The statement with every deferred key filled in from `map`
    pub(crate) fn resolve(&self, map: &IdentityMap) -> Result<Statement> {
        let mut statement = self.statement.clone();
        for deferred in &self.deferred {
            let s = map.get(deferred.slot).ok_or(RelmapError::ForeignEntity)?;
            let key = s.key.as_ref().ok_or_else(|| RelmapError::InvalidState {
                op: "commit".to_string(),
                entity_type: s.entity_type.clone(),
                state: "referenced before its generated key is known".to_string(),
            })?;
            if let Some(param) = statement.params.get_mut(deferred.param) {
                *param = key.to_value();
            }
        }
        Ok(statement)
    }
}

/// Key returned by an insert: the first column of the first row
pub(crate) fn generated_key(rows: &[Row]) -> Option<Key> {
    rows.first()
        .and_then(|row| row.values().first())
        .and_then(Key::from_value)
}

/// Statement under construction, tracking parameters bound to pending keys
struct Draft {
    statement: Statement,
    deferred: Vec<DeferredKey>,
}

impl Draft {
    fn new(sql: impl Into<String>) -> Self {
        Self {
            statement: Statement::new(sql),
            deferred: Vec::new(),
        }
    }

    fn push(&mut self, value: Value, sensitive: bool) {
        self.statement.push(value, sensitive);
    }

    /// Bind the key of `slot`, or a placeholder filled in at commit
    fn key(&mut self, map: &IdentityMap, slot: usize) {
        match key_of(map, slot) {
            Some(key) => self.push(key.to_value(), false),
            None => self.pending(slot),
        }
    }

    fn reference(&mut self, reference: Reference) {
        match reference {
            Reference::Known(key) => {
                self.push(key.map(|k| k.to_value()).unwrap_or(Value::Null), false)
            }
            Reference::Pending(slot) => self.pending(slot),
        }
    }

    fn pending(&mut self, slot: usize) {
        self.deferred.push(DeferredKey {
            param: self.statement.params.len(),
            slot,
        });
        self.push(Value::Null, false);
    }
}

/// Target of an owning foreign key
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reference {
    Known(Option<Key>),
    /// Loaded target whose key the store has not generated yet
    Pending(usize),
}

fn reference(map: &IdentityMap, slot: &Slot, relationship: &str) -> Reference {
    if let Some(ToOne::Loaded {
        current: Some(target),
        ..
    }) = slot.to_one.get(relationship)
    {
        if key_of(map, *target).is_none() {
            return Reference::Pending(*target);
        }
    }
    Reference::Known(map.current_fk(slot, relationship))
}

#[derive(Debug, Default)]
pub(crate) struct FlushPlan {
    pub statements: Vec<PlannedStatement>,
    inserted: Vec<usize>,
    deleted: Vec<usize>,
}

impl FlushPlan {
    fn push(&mut self, kind: WriteKind, statement: Statement) {
        self.statements.push(PlannedStatement {
            statement,
            kind,
            deferred: Vec::new(),
            generates: None,
        });
    }

    fn push_draft(&mut self, kind: WriteKind, draft: Draft, generates: Option<usize>) {
        self.statements.push(PlannedStatement {
            statement: draft.statement,
            kind,
            deferred: draft.deferred,
            generates,
        });
    }

    pub(crate) fn count_into(&self, stats: &mut Statistics) {
        for planned in &self.statements {
            match planned.kind {
                WriteKind::Insert => stats.inserts += 1,
                WriteKind::Update => stats.updates += 1,
                WriteKind::Delete => stats.deletes += 1,
                WriteKind::LinkInsert => stats.link_rows_inserted += 1,
                WriteKind::LinkDelete => stats.link_rows_deleted += 1,
            }
        }
    }
}

fn key_of(map: &IdentityMap, slot: usize) -> Option<Key> {
    map.get(slot).and_then(|s| s.key.clone())
}

fn state_of(map: &IdentityMap, slot: usize) -> Option<EntityState> {
    map.get(slot).map(|s| s.state)
}

/// Apply flush-time cascades to `map` and plan the writes
///
/// # Errors
///
/// `TransientObject` when a persistent entity still references a transient
/// one through an owning association; nothing has been written then.
pub(crate) fn prepare(
    registry: &Registry,
    map: &mut IdentityMap,
    next_key: &mut dyn FnMut() -> Key,
) -> Result<FlushPlan> {
    for i in map.managed() {
        if state_of(map, i) == Some(EntityState::Persistent) {
            cascade::persist(registry, map, i, next_key)?;
        }
    }
    for orphan in cascade::orphans(registry, map) {
        tracing::debug!(slot = orphan as u64, "orphan scheduled for removal");
        cascade::remove(registry, map, orphan);
    }

    let managed = map.managed();
    let live: Vec<usize> = managed
        .iter()
        .copied()
        .filter(|&i| state_of(map, i) == Some(EntityState::Persistent))
        .collect();
    for &i in &live {
        cascade::check_references(registry, map, i, |_| false)?;
    }
    let deleted: Vec<usize> = managed
        .iter()
        .copied()
        .filter(|&i| {
            map.get(i)
                .is_some_and(|s| s.state == EntityState::Removed && s.in_store)
        })
        .collect();
    let deleted_set: HashSet<usize> = deleted.iter().copied().collect();
    let inserted: Vec<usize> = live
        .iter()
        .copied()
        .filter(|&i| map.get(i).is_some_and(|s| !s.in_store))
        .collect();

    let mut plan = FlushPlan::default();
    link_changes(registry, map, &live, &deleted_set, &mut plan, WriteKind::LinkDelete)?;
    for i in insert_order(registry, map, &inserted)? {
        let draft = insert_statement(registry, map, i)?;
        let generates = key_of(map, i).is_none().then_some(i);
        plan.push_draft(WriteKind::Insert, draft, generates);
    }
    for &i in &live {
        if let Some(draft) = update_statement(registry, map, i)? {
            plan.push_draft(WriteKind::Update, draft, None);
        }
    }
    link_changes(registry, map, &live, &deleted_set, &mut plan, WriteKind::LinkInsert)?;
    for &i in &deleted {
        let (entity_type, key) = identity(map, i)?;
        for (table, column) in registry.link_references(&entity_type) {
            plan.push(
                WriteKind::LinkDelete,
                Statement::new(sql::delete(&table, &column)).bind(key.to_value()),
            );
        }
    }
    let mut delete_order = insert_order_by_snapshot(registry, map, &deleted)?;
    delete_order.reverse();
    for i in delete_order {
        let (entity_type, key) = identity(map, i)?;
        let desc = registry.describe(&entity_type)?;
        plan.push(
            WriteKind::Delete,
            Statement::new(sql::delete(&desc.table, &desc.primary_key.column))
                .bind(key.to_value()),
        );
    }

    plan.inserted = inserted;
    plan.deleted = deleted;
    tracing::debug!(
        statements = plan.statements.len() as u64,
        inserts = plan.inserted.len() as u64,
        deletes = plan.deleted.len() as u64,
        "flush planned"
    );
    Ok(plan)
}

fn identity(map: &IdentityMap, slot: usize) -> Result<(String, Key)> {
    let s = map.get(slot).ok_or(RelmapError::ForeignEntity)?;
    let key = s.key.clone().ok_or_else(|| RelmapError::InvalidState {
        op: "flush".to_string(),
        entity_type: s.entity_type.clone(),
        state: "no key".to_string(),
    })?;
    Ok((s.entity_type.clone(), key))
}

/// Link rows removed (`LinkDelete`) or added (`LinkInsert`) on owning
/// many-to-many collections
fn link_changes(
    registry: &Registry,
    map: &IdentityMap,
    owners: &[usize],
    deleted: &HashSet<usize>,
    plan: &mut FlushPlan,
    kind: WriteKind,
) -> Result<()> {
    for &owner in owners {
        let Some(slot) = map.get(owner) else { continue };
        if kind == WriteKind::LinkDelete && !slot.in_store {
            continue;
        }
        let meta = registry.entity(&slot.entity_type)?;
        for rel in meta.relationships.values().filter(|r| r.is_owning()) {
            let AssociationMapping::JoinTable {
                table,
                owner_column,
                target_column,
            } = &rel.mapping
            else {
                continue;
            };
            let Some(Collection::Loaded { items, snapshot }) = slot.collections.get(rel.name())
            else {
                continue;
            };
            let (changed, text) = match kind {
                WriteKind::LinkDelete => (
                    diff(snapshot, items),
                    sql::delete_link(table, owner_column, target_column),
                ),
                _ => (
                    diff(items, snapshot),
                    sql::insert(table, &[owner_column.clone(), target_column.clone()]),
                ),
            };
            for t in changed {
                if deleted.contains(&t) || state_of(map, t) == Some(EntityState::Removed) {
                    continue;
                }
                let mut draft = Draft::new(text.clone());
                draft.key(map, owner);
                draft.key(map, t);
                plan.push_draft(kind, draft, None);
            }
        }
    }
    Ok(())
}

/// Elements of `a` missing from `b`
fn diff(a: &[usize], b: &[usize]) -> Vec<usize> {
    a.iter().copied().filter(|x| !b.contains(x)).collect()
}

/// Order `slots` so that targets of current owning foreign keys come first;
/// ties keep persist order
fn insert_order(registry: &Registry, map: &IdentityMap, slots: &[usize]) -> Result<Vec<usize>> {
    let mut parents = Vec::with_capacity(slots.len());
    for &i in slots {
        let s = map.get(i).ok_or(RelmapError::ForeignEntity)?;
        let meta = registry.entity(&s.entity_type)?;
        let targets: Vec<usize> = meta
            .relationships
            .values()
            .filter(|r| matches!(r.mapping, AssociationMapping::FkOnSource { .. }))
            .filter_map(|r| match s.to_one.get(r.name()) {
                Some(ToOne::Loaded {
                    current: Some(t), ..
                }) => Some(*t),
                _ => None,
            })
            .collect();
        parents.push((i, s.seq, targets));
    }
    Ok(topological(parents))
}

/// Like [`insert_order`] but following the foreign keys as stored
fn insert_order_by_snapshot(
    registry: &Registry,
    map: &IdentityMap,
    slots: &[usize],
) -> Result<Vec<usize>> {
    let mut parents = Vec::with_capacity(slots.len());
    for &i in slots {
        let s = map.get(i).ok_or(RelmapError::ForeignEntity)?;
        let meta = registry.entity(&s.entity_type)?;
        let mut targets = Vec::new();
        for rel in meta.relationships.values() {
            if let Some(Some(fk)) = s.fk_snapshot.get(rel.name()) {
                if let Some(t) = map.lookup(registry.root_of(rel.target())?, fk) {
                    targets.push(t);
                }
            }
        }
        parents.push((i, s.seq, targets));
    }
    Ok(topological(parents))
}

/// Parents-first order of `(slot, seq, parents)`; parents outside the set
/// are ignored and cycles are broken in seq order
fn topological(mut nodes: Vec<(usize, u64, Vec<usize>)>) -> Vec<usize> {
    nodes.sort_by_key(|(i, seq, _)| (*seq, *i));
    let members: HashSet<usize> = nodes.iter().map(|(i, _, _)| *i).collect();
    let mut emitted: HashSet<usize> = HashSet::new();
    let mut order = Vec::with_capacity(nodes.len());
    while order.len() < nodes.len() {
        let ready = nodes.iter().find(|(i, _, parents)| {
            !emitted.contains(i)
                && parents
                    .iter()
                    .all(|p| p == i || !members.contains(p) || emitted.contains(p))
        });
        let next = match ready {
            Some((i, _, _)) => *i,
            None => match nodes.iter().find(|(i, _, _)| !emitted.contains(i)) {
                Some((i, _, _)) => *i,
                None => break,
            },
        };
        emitted.insert(next);
        order.push(next);
    }
    order
}

/// INSERT of every column; without a key the store generates one and the
/// statement returns it
fn insert_statement(registry: &Registry, map: &IdentityMap, slot: usize) -> Result<Draft> {
    let s = map.get(slot).ok_or(RelmapError::ForeignEntity)?;
    let meta = registry.entity(&s.entity_type)?;
    let desc = &meta.descriptor;

    let mut draft = match &s.key {
        Some(key) => {
            let mut draft = Draft::new(sql::insert(&desc.table, &meta.table_columns()));
            draft.push(key.to_value(), false);
            draft
        }
        None => {
            let columns: Vec<String> = meta.table_columns().into_iter().skip(1).collect();
            Draft::new(sql::insert_returning(
                &desc.table,
                &columns,
                &desc.primary_key.column,
            ))
        }
    };
    for column in &desc.columns {
        let value = s.values.get(&column.field).cloned().unwrap_or(Value::Null);
        draft.push(stored(&s.entity_type, column, value)?, column.sensitive);
    }
    for rel in desc.foreign_keys() {
        draft.reference(reference(map, s, &rel.name));
    }
    Ok(draft)
}

fn stored(entity_type: &str, column: &ColumnMapping, value: Value) -> Result<Value> {
    column
        .to_store(value)
        .map_err(|reason| RelmapError::InvalidValue {
            entity_type: entity_type.to_string(),
            field: column.field.clone(),
            reason,
        })
}

/// UPDATE of changed columns and foreign keys, if anything changed
fn update_statement(
    registry: &Registry,
    map: &IdentityMap,
    slot: usize,
) -> Result<Option<Draft>> {
    let s = map.get(slot).ok_or(RelmapError::ForeignEntity)?;
    if !s.in_store {
        return Ok(None);
    }
    let desc = &registry.entity(&s.entity_type)?.descriptor;
    let mut columns = Vec::new();
    let mut draft = Draft::new(String::new());

    for column in &desc.columns {
        let current = s.values.get(&column.field).unwrap_or(&Value::Null);
        let snapshot = s.snapshot.get(&column.field).unwrap_or(&Value::Null);
        if current != snapshot {
            columns.push(column.column.clone());
            draft.push(stored(&s.entity_type, column, current.clone())?, column.sensitive);
        }
    }
    for rel in desc.foreign_keys() {
        if !matches!(s.to_one.get(&rel.name), Some(ToOne::Loaded { .. })) {
            continue;
        }
        let current = reference(map, s, &rel.name);
        let stored = s.fk_snapshot.get(&rel.name).cloned().flatten();
        // A pending target is a new row, so the key always changes
        if current != Reference::Known(stored) {
            if let Some(column) = &rel.join_column {
                columns.push(column.clone());
                draft.reference(current);
            }
        }
    }
    if columns.is_empty() {
        return Ok(None);
    }
    let (_, key) = identity(map, slot)?;
    draft.statement.sql = sql::update(&desc.table, &columns, &desc.primary_key.column);
    draft.push(key.to_value(), false);
    Ok(Some(draft))
}

/// Rebase the staged map after the store accepted the flush
pub(crate) fn finish(registry: &Registry, map: &mut IdentityMap, plan: &FlushPlan) {
    let deleted: HashSet<usize> = plan.deleted.iter().copied().collect();
    for &i in &plan.deleted {
        map.evict(i);
        if let Some(s) = map.get_mut(i) {
            s.state = EntityState::Transient;
            s.in_store = false;
            s.snapshot.clear();
            s.fk_snapshot.clear();
        }
    }
    for &i in &plan.inserted {
        if let Some(s) = map.get_mut(i) {
            s.in_store = true;
        }
    }

    let managed = map.managed();
    let mut rebased_fks = Vec::with_capacity(managed.len());
    for &i in &managed {
        let Some(s) = map.get(i) else { continue };
        let Ok(meta) = registry.entity(&s.entity_type) else {
            continue;
        };
        let fks: Vec<(String, Option<Key>)> = meta
            .descriptor
            .foreign_keys()
            .map(|r| (r.name.clone(), map.current_fk(s, &r.name)))
            .collect();
        rebased_fks.push((i, fks));
    }

    for slot in map.slots_mut() {
        for collection in slot.collections.values_mut() {
            if let Collection::Loaded { items, snapshot } = collection {
                items.retain(|t| !deleted.contains(t));
                snapshot.retain(|t| !deleted.contains(t));
            }
        }
        for to_one in slot.to_one.values_mut() {
            if let ToOne::Loaded { current, original } = to_one {
                if current.is_some_and(|t| deleted.contains(&t)) {
                    *current = None;
                }
                if original.is_some_and(|t| deleted.contains(&t)) {
                    *original = None;
                }
            }
        }
    }

    for (i, fks) in rebased_fks {
        let Some(s) = map.get_mut(i) else { continue };
        s.snapshot = s.values.clone();
        for (name, fk) in fks {
            let deleted_target = matches!(
                s.to_one.get(&name),
                Some(ToOne::Loaded { current: None, .. })
            );
            s.fk_snapshot
                .insert(name, if deleted_target { None } else { fk });
        }
        for collection in s.collections.values_mut() {
            if let Collection::Loaded { items, snapshot } = collection {
                *snapshot = items.clone();
            }
        }
        for to_one in s.to_one.values_mut() {
            if let ToOne::Loaded { current, original } = to_one {
                *original = *current;
            }
        }
    }
}
