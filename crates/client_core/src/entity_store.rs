//! Keyed arena owning every cached entity of one kind.
//!
//! Entities live in generation-checked slots. Removing an entity detaches it
//! from the key index right away but keeps the slot alive in a retired list
//! until [`EntityStore::flush_retired`] runs, so handles taken earlier in the
//! same reconciliation pass keep resolving.

use std::{collections::HashMap, fmt, hash::Hash, marker::PhantomData};

/// Where an entity update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provenance {
    LivePush,
    PullResponse,
    StoreReplay,
    LocalOptimistic,
}

impl Provenance {
    /// Whether updates with this provenance are written through to the durable store.
    pub fn persists(&self) -> bool {
        matches!(self, Provenance::LivePush | Provenance::PullResponse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    /// A replayed value lost against live data already in the store.
    Ignored,
}

pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

enum SlotState<T> {
    Vacant,
    Live {
        value: T,
        provenance: Provenance,
    },
    Retired {
        value: T,
    },
}

struct Slot<T> {
    generation: u32,
    state: SlotState<T>,
}

pub struct EntityStore<K, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    index: HashMap<K, u32>,
    retired: Vec<u32>,
    placeholder: T,
}

impl<K, T> Default for EntityStore<K, T>
where
    K: Copy + Eq + Hash,
    T: Default + PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> EntityStore<K, T>
where
    K: Copy + Eq + Hash,
    T: Default + PartialEq,
{
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            retired: Vec::new(),
            placeholder: T::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Never fails: unknown keys resolve to the shared placeholder.
    pub fn get(&self, key: &K) -> &T {
        self.lookup(key).unwrap_or(&self.placeholder)
    }

    pub fn placeholder(&self) -> &T {
        &self.placeholder
    }

    pub fn lookup(&self, key: &K) -> Option<&T> {
        let index = *self.index.get(key)?;
        match &self.slots[index as usize].state {
            SlotState::Live { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn provenance(&self, key: &K) -> Option<Provenance> {
        let index = *self.index.get(key)?;
        match &self.slots[index as usize].state {
            SlotState::Live { provenance, .. } => Some(*provenance),
            _ => None,
        }
    }

    pub fn handle(&self, key: &K) -> Option<Handle<T>> {
        let index = *self.index.get(key)?;
        Some(Handle {
            index,
            generation: self.slots[index as usize].generation,
            _marker: PhantomData,
        })
    }

    /// Resolves live and retired-but-not-yet-flushed entities.
    pub fn resolve(&self, handle: Handle<T>) -> Option<&T> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        match &slot.state {
            SlotState::Live { value, .. } | SlotState::Retired { value } => Some(value),
            SlotState::Vacant => None,
        }
    }

    pub fn upsert(&mut self, key: K, value: T, provenance: Provenance) -> UpsertOutcome {
        let Some(&index) = self.index.get(&key) else {
            let index = self.allocate(value, provenance);
            self.index.insert(key, index);
            return UpsertOutcome::Inserted;
        };

        let SlotState::Live {
            value: existing,
            provenance: existing_provenance,
        } = &mut self.slots[index as usize].state
        else {
            // The index only ever points at live slots.
            return UpsertOutcome::Ignored;
        };

        if provenance == Provenance::StoreReplay && *existing_provenance != Provenance::StoreReplay
        {
            return UpsertOutcome::Ignored;
        }

        *existing_provenance = provenance;
        if *existing == value {
            return UpsertOutcome::Unchanged;
        }
        *existing = value;
        UpsertOutcome::Updated
    }

    /// Mutates a live entity in place. Returns `false` for unknown keys.
    pub fn modify(&mut self, key: &K, f: impl FnOnce(&mut T)) -> bool {
        let Some(&index) = self.index.get(key) else {
            return false;
        };
        match &mut self.slots[index as usize].state {
            SlotState::Live { value, .. } => {
                f(value);
                true
            }
            _ => false,
        }
    }

    /// Detaches the entity from the index; destruction waits for the next flush.
    pub fn retire(&mut self, key: &K) -> bool {
        let Some(index) = self.index.remove(key) else {
            return false;
        };
        let slot = &mut self.slots[index as usize];
        let state = std::mem::replace(&mut slot.state, SlotState::Vacant);
        if let SlotState::Live { value, .. } = state {
            slot.state = SlotState::Retired { value };
            self.retired.push(index);
        }
        true
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    /// Destroys every retired entity and recycles its slot.
    pub fn flush_retired(&mut self) -> usize {
        let flushed = self.retired.len();
        for index in self.retired.drain(..) {
            let slot = &mut self.slots[index as usize];
            slot.state = SlotState::Vacant;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index);
        }
        flushed
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.index.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &T)> + '_ {
        self.index
            .iter()
            .filter_map(|(key, &index)| match &self.slots[index as usize].state {
                SlotState::Live { value, .. } => Some((key, value)),
                _ => None,
            })
    }

    fn allocate(&mut self, value: T, provenance: Provenance) -> u32 {
        let state = SlotState::Live { value, provenance };
        if let Some(index) = self.free.pop() {
            self.slots[index as usize].state = state;
            return index;
        }
        self.slots.push(Slot {
            generation: 0,
            state,
        });
        (self.slots.len() - 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Note {
        text: String,
    }

    fn note(text: &str) -> Note {
        Note { text: text.into() }
    }

    #[test]
    fn unknown_keys_resolve_to_shared_placeholder() {
        let store: EntityStore<i64, Note> = EntityStore::new();
        let first = store.get(&1) as *const Note;
        let second = store.get(&2) as *const Note;
        assert_eq!(first, second);
        assert_eq!(store.get(&1), &Note::default());
    }

    #[test]
    fn update_keeps_slot_identity() {
        let mut store = EntityStore::new();
        assert_eq!(
            store.upsert(1, note("a"), Provenance::LivePush),
            UpsertOutcome::Inserted
        );
        let handle = store.handle(&1).expect("handle");
        assert_eq!(
            store.upsert(1, note("b"), Provenance::PullResponse),
            UpsertOutcome::Updated
        );
        assert_eq!(store.handle(&1), Some(handle));
        assert_eq!(store.resolve(handle).map(|n| n.text.as_str()), Some("b"));
    }

    #[test]
    fn replay_never_overwrites_live_data() {
        let mut store = EntityStore::new();
        store.upsert(1, note("live"), Provenance::LivePush);
        assert_eq!(
            store.upsert(1, note("stale"), Provenance::StoreReplay),
            UpsertOutcome::Ignored
        );
        assert_eq!(store.get(&1).text, "live");
    }

    #[test]
    fn replay_over_replay_updates() {
        let mut store = EntityStore::new();
        store.upsert(1, note("old"), Provenance::StoreReplay);
        assert_eq!(
            store.upsert(1, note("newer"), Provenance::StoreReplay),
            UpsertOutcome::Updated
        );
    }

    #[test]
    fn identical_payload_is_unchanged() {
        let mut store = EntityStore::new();
        store.upsert(1, note("same"), Provenance::LivePush);
        assert_eq!(
            store.upsert(1, note("same"), Provenance::LivePush),
            UpsertOutcome::Unchanged
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn retired_entities_resolve_until_flush() {
        let mut store = EntityStore::new();
        store.upsert(1, note("gone soon"), Provenance::LivePush);
        let handle = store.handle(&1).expect("handle");

        assert!(store.retire(&1));
        assert!(!store.contains(&1));
        assert_eq!(store.get(&1), store.placeholder());
        assert_eq!(
            store.resolve(handle).map(|n| n.text.as_str()),
            Some("gone soon")
        );

        assert_eq!(store.flush_retired(), 1);
        assert!(store.resolve(handle).is_none());
    }

    #[test]
    fn recycled_slot_rejects_stale_handles() {
        let mut store = EntityStore::new();
        store.upsert(1, note("first"), Provenance::LivePush);
        let stale = store.handle(&1).expect("handle");
        store.retire(&1);
        store.flush_retired();

        store.upsert(2, note("second"), Provenance::LivePush);
        let fresh = store.handle(&2).expect("handle");
        assert_ne!(stale, fresh);
        assert!(store.resolve(stale).is_none());
        assert_eq!(store.resolve(fresh).map(|n| n.text.as_str()), Some("second"));
    }

    #[test]
    fn reinsert_after_retire_gets_new_slot() {
        let mut store = EntityStore::new();
        store.upsert(1, note("v1"), Provenance::LivePush);
        let old = store.handle(&1).expect("handle");
        store.retire(&1);
        assert_eq!(
            store.upsert(1, note("v2"), Provenance::LivePush),
            UpsertOutcome::Inserted
        );
        assert_ne!(store.handle(&1), Some(old));
        assert_eq!(store.resolve(old).map(|n| n.text.as_str()), Some("v1"));
    }
}
