//! Entity arena and identity index
//!
//! Every entity a unit of work has seen lives in a slot of the arena until
//! the arena is released; handles are slot indices tagged with the owning
//! unit of work and the arena epoch. Releasing empties the arena and starts
//! a new epoch, so handles from before fail instead of aliasing new slots.
//! The index maps (hierarchy root, key) to the one managed slot for that
//! identity; managed entities still waiting for a store-generated key are
//! tracked separately. Associations refer to slots by index.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;

use crate::model::{Key, Value};

/// Lifecycle state of an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntityState {
    /// Not associated with any identity in the unit of work
    Transient,
    /// Managed; changes are flushed on commit
    Persistent,
    /// Was managed; the unit of work no longer tracks it
    Detached,
    /// Managed and scheduled for deletion on commit
    Removed,
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityState::Transient => "TRANSIENT",
            EntityState::Persistent => "PERSISTENT",
            EntityState::Detached => "DETACHED",
            EntityState::Removed => "REMOVED",
        };
        f.write_str(s)
    }
}

/// Handle to an entity inside one unit of work
///
/// Two handles are equal exactly when they denote the same in-memory entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub(crate) uow: u64,
    pub(crate) epoch: u64,
    pub(crate) slot: usize,
}

/// State of a single-valued association
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ToOne {
    /// Not loaded. `fk` is known when this side holds the foreign key.
    Unloaded { fk: Option<Key> },
    /// Loaded; `original` is the target as of the last load or commit
    Loaded {
        current: Option<usize>,
        original: Option<usize>,
    },
}

impl ToOne {
    pub(crate) fn fresh(target: Option<usize>) -> Self {
        ToOne::Loaded {
            current: target,
            original: target,
        }
    }
}

/// State of a collection association
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Collection {
    Unloaded,
    /// Loaded; `snapshot` is the membership as of the last load or commit
    Loaded {
        items: Vec<usize>,
        snapshot: Vec<usize>,
    },
}

impl Collection {
    pub(crate) fn empty() -> Self {
        Collection::Loaded {
            items: Vec::new(),
            snapshot: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    /// Concrete type
    pub entity_type: String,
    /// Hierarchy root of `entity_type`
    pub root: String,
    pub state: EntityState,
    pub key: Option<Key>,
    pub values: BTreeMap<String, Value>,
    /// Column values as stored, for dirty checking
    pub snapshot: BTreeMap<String, Value>,
    /// Foreign keys as stored, per owning to-one relationship
    pub fk_snapshot: BTreeMap<String, Option<Key>>,
    pub to_one: BTreeMap<String, ToOne>,
    pub collections: BTreeMap<String, Collection>,
    /// Whether a row for this entity exists in the store
    pub in_store: bool,
    /// Order in which the entity became persistent, for insert ordering
    pub seq: u64,
    /// Order in which the entity was loaded, for batch formation
    pub load_seq: Option<u64>,
}

impl Slot {
    pub(crate) fn new(entity_type: &str, root: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            root: root.to_string(),
            state: EntityState::Transient,
            key: None,
            values: BTreeMap::new(),
            snapshot: BTreeMap::new(),
            fk_snapshot: BTreeMap::new(),
            to_one: BTreeMap::new(),
            collections: BTreeMap::new(),
            in_store: false,
            seq: 0,
            load_seq: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct IdentityMap {
    slots: Vec<Slot>,
    index: HashMap<(String, Key), usize>,
    /// Managed slots without a key yet
    keyless: BTreeSet<usize>,
    epoch: u64,
    next_seq: u64,
}

impl IdentityMap {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn push(&mut self, slot: Slot) -> usize {
        self.slots.push(slot);
        self.slots.len() - 1
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&Slot> {
        self.slots.get(slot)
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut Slot> {
        self.slots.get_mut(slot)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn lookup(&self, root: &str, key: &Key) -> Option<usize> {
        self.index.get(&(root.to_string(), key.clone())).copied()
    }

    /// Make `slot` the managed instance of its identity. A slot without a
    /// key stays managed and joins the index once its key is installed.
    pub(crate) fn register(&mut self, slot: usize) {
        if let Some(s) = self.slots.get(slot) {
            match &s.key {
                Some(key) => {
                    self.index.insert((s.root.clone(), key.clone()), slot);
                    self.keyless.remove(&slot);
                }
                None => {
                    self.keyless.insert(slot);
                }
            }
        }
    }

    /// Give a managed keyless slot the key the store generated for it
    pub(crate) fn install_key(&mut self, slot: usize, key: Key) {
        if let Some(s) = self.slots.get_mut(slot) {
            s.key = Some(key);
            self.register(slot);
        }
    }

    pub(crate) fn evict(&mut self, slot: usize) {
        self.keyless.remove(&slot);
        if let Some(s) = self.slots.get(slot) {
            if let Some(key) = &s.key {
                let id = (s.root.clone(), key.clone());
                if self.index.get(&id) == Some(&slot) {
                    self.index.remove(&id);
                }
            }
        }
    }

    pub(crate) fn is_managed(&self, slot: usize) -> bool {
        self.keyless.contains(&slot)
            || self
                .slots
                .get(slot)
                .and_then(|s| s.key.as_ref().map(|k| (s.root.clone(), k.clone())))
                .is_some_and(|id| self.index.get(&id) == Some(&slot))
    }

    /// Managed slots in arena order
    pub(crate) fn managed(&self) -> Vec<usize> {
        let mut slots: Vec<usize> = self.index.values().copied().collect();
        slots.extend(self.keyless.iter().copied());
        slots.sort_unstable();
        slots
    }

    pub(crate) fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Drop every identity; slots stay readable
    pub(crate) fn clear_index(&mut self) {
        self.index.clear();
        self.keyless.clear();
    }

    /// Drop every slot and start a new epoch
    pub(crate) fn release(&mut self) {
        self.slots = Vec::new();
        self.index = HashMap::new();
        self.keyless.clear();
        self.epoch += 1;
    }

    pub(crate) fn slots_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut()
    }

    /// Key of the current target of a to-one association
    pub(crate) fn current_fk(&self, slot: &Slot, relationship: &str) -> Option<Key> {
        match slot.to_one.get(relationship) {
            Some(ToOne::Unloaded { fk }) => fk.clone(),
            Some(ToOne::Loaded {
                current: Some(target),
                ..
            }) => self.slots.get(*target).and_then(|t| t.key.clone()),
            Some(ToOne::Loaded { current: None, .. }) | None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistent(map: &mut IdentityMap, key: i64) -> usize {
        let mut slot = Slot::new("Author", "Author");
        slot.key = Some(Key::Int(key));
        slot.state = EntityState::Persistent;
        let i = map.push(slot);
        map.register(i);
        i
    }

    #[test]
    fn test_lookup_by_root_and_key() {
        let mut map = IdentityMap::default();
        let a = persistent(&mut map, 1);
        assert_eq!(map.lookup("Author", &Key::Int(1)), Some(a));
        assert_eq!(map.lookup("Book", &Key::Int(1)), None);
        assert!(map.is_managed(a));
    }

    #[test]
    fn test_evict_keeps_slot_readable() {
        let mut map = IdentityMap::default();
        let a = persistent(&mut map, 1);
        map.evict(a);
        assert!(!map.is_managed(a));
        assert_eq!(map.get(a).and_then(|s| s.key.clone()), Some(Key::Int(1)));
    }

    #[test]
    fn test_evict_ignores_stale_slot() {
        let mut map = IdentityMap::default();
        let old = persistent(&mut map, 1);
        map.evict(old);
        let new = persistent(&mut map, 1);
        map.evict(old);
        assert_eq!(map.lookup("Author", &Key::Int(1)), Some(new));
    }

    #[test]
    fn test_keyless_slot_is_managed_until_key_installed() {
        let mut map = IdentityMap::default();
        let mut slot = Slot::new("Course", "Course");
        slot.state = EntityState::Persistent;
        let i = map.push(slot);
        map.register(i);
        assert!(map.is_managed(i));
        assert_eq!(map.managed(), vec![i]);

        map.install_key(i, Key::Int(41));

        assert_eq!(map.lookup("Course", &Key::Int(41)), Some(i));
        assert_eq!(map.managed(), vec![i]);
    }

    #[test]
    fn test_release_empties_arena_and_bumps_epoch() {
        let mut map = IdentityMap::default();
        persistent(&mut map, 1);
        persistent(&mut map, 2);
        let epoch = map.epoch();

        map.release();

        assert_eq!(map.len(), 0);
        assert_eq!(map.lookup("Author", &Key::Int(1)), None);
        assert_eq!(map.epoch(), epoch + 1);
    }

    #[test]
    fn test_current_fk_follows_loaded_target() {
        let mut map = IdentityMap::default();
        let author = persistent(&mut map, 7);
        let mut book = Slot::new("Book", "Book");
        book.to_one.insert("author".to_string(), ToOne::fresh(Some(author)));
        assert_eq!(map.current_fk(&book, "author"), Some(Key::Int(7)));
        book.to_one
            .insert("author".to_string(), ToOne::Unloaded { fk: Some(Key::Int(9)) });
        assert_eq!(map.current_fk(&book, "author"), Some(Key::Int(9)));
    }
}
