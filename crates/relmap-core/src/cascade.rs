//! Cascade traversal and lifecycle transitions
//!
//! Cascades only follow associations that are loaded in memory. Callers that
//! need complete graphs (remove, commit) load the relevant edges first.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::errors::{RelmapError, Result};
use crate::model::{CascadeOp, EntityData, IdStrategy, Key, Value};
use crate::registry::{AssociationMapping, Registry, ResolvedRelationship};
use crate::session::{Collection, EntityState, IdentityMap, Slot, ToOne};

fn follows(rel: &ResolvedRelationship, op: CascadeOp) -> bool {
    rel.descriptor.cascade.contains(op) || (op == CascadeOp::Remove && rel.descriptor.orphan_removal)
}

/// Loaded targets of one association
pub(crate) fn loaded_targets(slot: &Slot, relationship: &str) -> Vec<usize> {
    match (slot.collections.get(relationship), slot.to_one.get(relationship)) {
        (Some(Collection::Loaded { items, .. }), _) => items.clone(),
        (_, Some(ToOne::Loaded { current, .. })) => current.iter().copied().collect(),
        _ => Vec::new(),
    }
}

/// Slots reachable from `start` over loaded edges that cascade `op`,
/// `start` first
pub(crate) fn reachable(
    registry: &Registry,
    map: &IdentityMap,
    start: usize,
    op: CascadeOp,
) -> Vec<usize> {
    let mut seen = HashSet::from([start]);
    let mut order = vec![start];
    let mut queue = VecDeque::from([start]);
    while let Some(i) = queue.pop_front() {
        let Some(slot) = map.get(i) else { continue };
        let Ok(meta) = registry.entity(&slot.entity_type) else {
            continue;
        };
        for rel in meta.relationships.values().filter(|r| follows(r, op)) {
            for t in loaded_targets(slot, rel.name()) {
                if seen.insert(t) {
                    order.push(t);
                    queue.push_back(t);
                }
            }
        }
    }
    order
}

/// Relationships of `slot` that cascade `op` but are not loaded yet
pub(crate) fn unloaded_edges(
    registry: &Registry,
    map: &IdentityMap,
    slot: usize,
    op: CascadeOp,
) -> Vec<String> {
    let Some(s) = map.get(slot) else {
        return Vec::new();
    };
    let Ok(meta) = registry.entity(&s.entity_type) else {
        return Vec::new();
    };
    meta.relationships
        .values()
        .filter(|r| follows(r, op))
        .filter(|r| {
            matches!(s.collections.get(r.name()), Some(Collection::Unloaded))
                || matches!(s.to_one.get(r.name()), Some(ToOne::Unloaded { .. }))
        })
        .map(|r| r.name().to_string())
        .collect()
}

/// Fail with `TransientObject` if an owning association of `slot` points at
/// a transient entity that `accepted` does not cover
pub(crate) fn check_references(
    registry: &Registry,
    map: &IdentityMap,
    slot: usize,
    accepted: impl Fn(usize) -> bool,
) -> Result<()> {
    let Some(s) = map.get(slot) else {
        return Ok(());
    };
    let meta = registry.entity(&s.entity_type)?;
    for rel in meta.relationships.values().filter(|r| r.is_owning()) {
        for t in loaded_targets(s, rel.name()) {
            let Some(target) = map.get(t) else { continue };
            if target.state == EntityState::Transient && !accepted(t) {
                return Err(RelmapError::TransientObject {
                    entity_type: s.entity_type.clone(),
                    relationship: rel.name().to_string(),
                    target_type: target.entity_type.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Make `start` and everything reachable over `persist` edges persistent
///
/// Every check runs before the first state change.
pub(crate) fn persist(
    registry: &Registry,
    map: &mut IdentityMap,
    start: usize,
    next_key: &mut dyn FnMut() -> Key,
) -> Result<()> {
    let closure = reachable(registry, map, start, CascadeOp::Persist);
    make_persistent(registry, map, &closure, next_key)
}

/// Make a single entity persistent without cascading
pub(crate) fn persist_one(
    registry: &Registry,
    map: &mut IdentityMap,
    slot: usize,
    next_key: &mut dyn FnMut() -> Key,
) -> Result<()> {
    make_persistent(registry, map, &[slot], next_key)
}

fn make_persistent(
    registry: &Registry,
    map: &mut IdentityMap,
    closure: &[usize],
    next_key: &mut dyn FnMut() -> Key,
) -> Result<()> {
    let mut claimed: HashSet<(String, Key)> = HashSet::new();
    let mut pending = Vec::new();
    for &i in closure {
        let Some(slot) = map.get(i) else { continue };
        match slot.state {
            EntityState::Persistent => continue,
            EntityState::Removed => {
                pending.push(i);
                continue;
            }
            EntityState::Detached => {
                return Err(RelmapError::InvalidState {
                    op: "persist".to_string(),
                    entity_type: slot.entity_type.clone(),
                    state: slot.state.to_string(),
                })
            }
            EntityState::Transient => {}
        }
        let pk = &registry.describe(&slot.entity_type)?.primary_key;
        match &slot.key {
            None if pk.strategy == IdStrategy::Assigned => {
                return Err(RelmapError::MissingPrimaryKey {
                    entity_type: slot.entity_type.clone(),
                    field: pk.field.clone(),
                })
            }
            None => {}
            Some(key) => {
                let taken = map.lookup(&slot.root, key).is_some_and(|other| other != i);
                if taken || !claimed.insert((slot.root.clone(), key.clone())) {
                    return Err(RelmapError::EntityExists {
                        entity_type: slot.entity_type.clone(),
                        key: key.to_string(),
                    });
                }
            }
        }
        pending.push(i);
    }

    for &i in &pending {
        check_references(registry, map, i, |t| closure.contains(&t))?;
    }

    for i in pending {
        let seq = map.next_seq();
        let generated = map
            .get(i)
            .and_then(|s| registry.describe(&s.entity_type).ok())
            .is_some_and(|d| d.primary_key.strategy == IdStrategy::Uuid);
        let Some(slot) = map.get_mut(i) else { continue };
        if slot.state == EntityState::Removed {
            slot.state = EntityState::Persistent;
            continue;
        }
        // Identity keys stay empty until the insert returns them
        if slot.key.is_none() && generated {
            slot.key = Some(next_key());
        }
        slot.state = EntityState::Persistent;
        slot.in_store = false;
        slot.seq = seq;
        map.register(i);
        tracing::trace!(slot = i as u64, "scheduled for insert");
    }
    Ok(())
}

/// Schedule `start` and everything reachable over `remove` edges for
/// deletion. Entities that were never stored simply become transient again.
pub(crate) fn remove(registry: &Registry, map: &mut IdentityMap, start: usize) {
    for i in reachable(registry, map, start, CascadeOp::Remove) {
        let Some(slot) = map.get_mut(i) else { continue };
        match (slot.state, slot.in_store) {
            (EntityState::Persistent, true) => slot.state = EntityState::Removed,
            (EntityState::Persistent, false) => {
                slot.state = EntityState::Transient;
                map.evict(i);
            }
            _ => {}
        }
    }
}

pub(crate) fn detach(registry: &Registry, map: &mut IdentityMap, start: usize) {
    for i in reachable(registry, map, start, CascadeOp::Detach) {
        let Some(slot) = map.get_mut(i) else { continue };
        if matches!(slot.state, EntityState::Persistent | EntityState::Removed) {
            slot.state = EntityState::Detached;
            map.evict(i);
        }
    }
}

/// Entities dropped from an orphan-removal association since the last load
/// or commit, and not picked up by another owner of the same association
pub(crate) fn orphans(registry: &Registry, map: &IdentityMap) -> Vec<usize> {
    let managed = map.managed();
    let mut found = Vec::new();
    for &owner in &managed {
        let Some(slot) = map.get(owner) else { continue };
        if slot.state != EntityState::Persistent {
            continue;
        }
        let Ok(meta) = registry.entity(&slot.entity_type) else {
            continue;
        };
        for rel in meta.relationships.values() {
            if !rel.descriptor.orphan_removal {
                continue;
            }
            let dropped: Vec<usize> = match (
                slot.collections.get(rel.name()),
                slot.to_one.get(rel.name()),
            ) {
                (Some(Collection::Loaded { items, snapshot }), _) => snapshot
                    .iter()
                    .copied()
                    .filter(|t| !items.contains(t))
                    .collect(),
                (
                    _,
                    Some(ToOne::Loaded {
                        current,
                        original: Some(original),
                    }),
                ) if *current != Some(*original) => vec![*original],
                _ => Vec::new(),
            };
            for t in dropped {
                let adopted = managed.iter().any(|&other| {
                    other != owner
                        && map
                            .get(other)
                            .is_some_and(|o| loaded_targets(o, rel.name()).contains(&t))
                });
                let live = map.is_managed(t)
                    && map.get(t).is_some_and(|s| s.state == EntityState::Persistent);
                if live && !adopted && !found.contains(&t) {
                    found.push(t);
                }
            }
        }
    }
    found
}

/// Starting points of removal at commit: removed entities and orphans
pub(crate) fn removal_roots(registry: &Registry, map: &IdentityMap) -> Vec<usize> {
    let mut roots: Vec<usize> = map
        .managed()
        .into_iter()
        .filter(|&i| map.get(i).is_some_and(|s| s.state == EntityState::Removed))
        .collect();
    for orphan in orphans(registry, map) {
        if !roots.contains(&orphan) {
            roots.push(orphan);
        }
    }
    roots
}

/// A to-one reference inside a merged graph
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MergedRef {
    /// Another node of the same graph
    Node(usize),
    /// A stored foreign key
    Key(Option<Key>),
}

#[derive(Debug, Clone)]
pub(crate) struct MergedNode {
    pub entity_type: String,
    pub key: Option<Key>,
    pub values: BTreeMap<String, Value>,
    pub references: BTreeMap<String, MergedRef>,
    /// Collection members, as node indices
    pub collections: BTreeMap<String, Vec<usize>>,
}

/// Immutable copy of the state to merge, root first
#[derive(Debug, Clone)]
pub(crate) struct DetachedGraph {
    pub nodes: Vec<MergedNode>,
}

impl DetachedGraph {
    /// Copy `start` and everything reachable over `merge` edges
    pub(crate) fn collect(registry: &Registry, map: &IdentityMap, start: usize) -> Result<Self> {
        let order = reachable(registry, map, start, CascadeOp::Merge);
        let index: HashMap<usize, usize> =
            order.iter().enumerate().map(|(n, &i)| (i, n)).collect();

        let mut nodes = Vec::with_capacity(order.len());
        for &i in &order {
            let slot = map.get(i).ok_or(RelmapError::ForeignEntity)?;
            let meta = registry.entity(&slot.entity_type)?;
            let mut node = MergedNode {
                entity_type: slot.entity_type.clone(),
                key: slot.key.clone(),
                values: slot.values.clone(),
                references: BTreeMap::new(),
                collections: BTreeMap::new(),
            };
            for rel in meta.relationships.values() {
                let cascades = rel.descriptor.cascade.contains(CascadeOp::Merge);
                if rel.is_to_many() {
                    if let (true, Some(Collection::Loaded { items, .. })) =
                        (cascades, slot.collections.get(rel.name()))
                    {
                        let members = items.iter().filter_map(|t| index.get(t).copied()).collect();
                        node.collections.insert(rel.name().to_string(), members);
                    }
                    continue;
                }
                if !matches!(rel.mapping, AssociationMapping::FkOnSource { .. }) {
                    continue;
                }
                let reference = match slot.to_one.get(rel.name()) {
                    Some(ToOne::Loaded {
                        current: Some(t), ..
                    }) if cascades && index.contains_key(t) => MergedRef::Node(index[t]),
                    _ => MergedRef::Key(map.current_fk(slot, rel.name())),
                };
                node.references.insert(rel.name().to_string(), reference);
            }
            nodes.push(node);
        }
        Ok(Self { nodes })
    }

    /// Single-node graph from detached data
    pub(crate) fn from_data(registry: &Registry, data: &EntityData) -> Result<Self> {
        let meta = registry.entity(&data.entity_type)?;
        let pk = &meta.descriptor.primary_key;
        let key = data.values.get(&pk.field).and_then(Key::from_value);
        let mut values = data.values.clone();
        values.remove(&pk.field);

        let mut references = BTreeMap::new();
        for (name, fk) in &data.references {
            let rel = registry.relationship(&data.entity_type, name)?;
            if !matches!(rel.mapping, AssociationMapping::FkOnSource { .. }) {
                return Err(RelmapError::InvalidValue {
                    entity_type: data.entity_type.clone(),
                    field: name.clone(),
                    reason: "only owning to-one relationships carry a reference".to_string(),
                });
            }
            references.insert(name.clone(), MergedRef::Key(Some(fk.clone())));
        }
        Ok(Self {
            nodes: vec![MergedNode {
                entity_type: data.entity_type.clone(),
                key,
                values,
                references,
                collections: BTreeMap::new(),
            }],
        })
    }
}
