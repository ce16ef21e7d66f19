//! Mutation lanes: per-frame records of adds, removes and dirty components.
//!
//! Any number of threads record into the front lane through `&self`. The upload
//! pipeline swaps lanes through `&mut`, so no producer can be mid-write while a
//! lane is closed and drained. A drained lane is handed out by value and the
//! lane itself is left empty, ready to be the front lane again next cycle.
//!
//! Each lane guards its add set, remove set and dirty tracker with separate
//! locks, and only exposes add-if-absent and drain.

use bevy::prelude::*;
use hashbrown::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

// =============================================================================
// CONCURRENT SET
// =============================================================================

struct SetInner<T> {
    order: Vec<T>,
    members: HashSet<T>,
}

/// Insertion-ordered set shared between producer threads.
pub struct ConcurrentSet<T> {
    inner: Mutex<SetInner<T>>,
}

impl<T> Default for ConcurrentSet<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(SetInner { order: Vec::new(), members: HashSet::new() }),
        }
    }
}

impl<T: Copy + Eq + Hash> ConcurrentSet<T> {
    /// Adds `value` if absent. Returns whether it was added.
    pub fn insert(&self, value: T) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.members.insert(value) {
            return false;
        }
        inner.order.push(value);
        true
    }

    pub fn contains(&self, value: &T) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.members.contains(value)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes every element in insertion order, leaving the set empty.
    pub fn drain(&mut self) -> Vec<T> {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        inner.members.clear();
        std::mem::take(&mut inner.order)
    }
}

// =============================================================================
// DIRTY TRACKING
// =============================================================================

/// Dirty entities and, per entity, a bit per registry ordinal.
#[derive(Default, Debug)]
pub struct DirtyState {
    pub entities: Vec<Entity>,
    pub masks: HashMap<Entity, u64>,
    pub component_count: u32,
    pub byte_total: u64,
}

#[derive(Default)]
pub struct DirtyTracker {
    state: Mutex<DirtyState>,
}

impl DirtyTracker {
    /// Marks component `ordinal` of `entity` dirty. Counts bytes only the first time.
    pub fn mark(&self, entity: Entity, ordinal: usize, element_size: u32) -> bool {
        let bit = 1u64 << ordinal;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let state = &mut *state;
        let entities = &mut state.entities;
        let mask = state.masks.entry(entity).or_insert_with(|| {
            entities.push(entity);
            0
        });
        if *mask & bit != 0 {
            return false;
        }
        *mask |= bit;
        state.component_count += 1;
        state.byte_total += element_size as u64;
        true
    }

    pub fn is_dirty(&self, entity: Entity, ordinal: usize) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.masks.get(&entity).is_some_and(|m| m & (1u64 << ordinal) != 0)
    }

    pub fn component_count(&self) -> u32 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).component_count
    }

    pub fn byte_total(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).byte_total
    }

    pub fn entity_count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).entities.len()
    }

    pub fn take(&mut self) -> DirtyState {
        std::mem::take(self.state.get_mut().unwrap_or_else(PoisonError::into_inner))
    }
}

// =============================================================================
// LANES
// =============================================================================

#[derive(Default)]
pub struct MutationLane {
    adds: ConcurrentSet<Entity>,
    removes: ConcurrentSet<Entity>,
    dirty: DirtyTracker,
}

/// Everything one lane recorded, owned by the upload pipeline.
#[derive(Default, Debug)]
pub struct DrainedLane {
    pub adds: Vec<Entity>,
    pub removes: Vec<Entity>,
    pub dirty: DirtyState,
}

impl MutationLane {
    pub fn add(&self, entity: Entity) -> bool {
        self.adds.insert(entity)
    }

    pub fn remove(&self, entity: Entity) -> bool {
        self.removes.insert(entity)
    }

    pub fn require_upload(&self, entity: Entity, ordinal: usize, element_size: u32) -> bool {
        self.dirty.mark(entity, ordinal, element_size)
    }

    pub fn is_added(&self, entity: Entity) -> bool {
        self.adds.contains(&entity)
    }

    pub fn dirty(&self) -> &DirtyTracker {
        &self.dirty
    }

    pub fn pending_adds(&self) -> usize {
        self.adds.len()
    }

    pub fn pending_removes(&self) -> usize {
        self.removes.len()
    }

    fn drain(&mut self) -> DrainedLane {
        DrainedLane {
            adds: self.adds.drain(),
            removes: self.removes.drain(),
            dirty: self.dirty.take(),
        }
    }
}

/// Two lanes, one open for writes.
#[derive(Default)]
pub struct LanePair {
    lanes: [MutationLane; 2],
    front: usize,
}

impl LanePair {
    /// The lane producers write into.
    pub fn front(&self) -> &MutationLane {
        &self.lanes[self.front]
    }

    /// Close the front lane, open the other, and drain the closed one.
    pub fn swap(&mut self) -> DrainedLane {
        let closed = self.front;
        self.front ^= 1;
        self.lanes[closed].drain()
    }

    pub fn front_index(&self) -> usize {
        self.front
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities(n: usize) -> Vec<Entity> {
        let mut world = World::new();
        (0..n).map(|_| world.spawn_empty().id()).collect()
    }

    #[test]
    fn set_keeps_first_insertion_order() {
        let mut set = ConcurrentSet::default();
        assert!(set.insert(3));
        assert!(set.insert(1));
        assert!(!set.insert(3));
        assert!(set.contains(&1));
        assert_eq!(set.drain(), vec![3, 1]);
        assert!(set.is_empty());
        assert!(set.insert(3));
    }

    #[test]
    fn marking_twice_counts_once() {
        let e = entities(2);
        let tracker = DirtyTracker::default();
        assert!(tracker.mark(e[0], 0, 12));
        assert!(!tracker.mark(e[0], 0, 12));
        assert!(tracker.mark(e[0], 2, 16));
        assert!(tracker.mark(e[1], 0, 12));
        assert_eq!(tracker.component_count(), 3);
        assert_eq!(tracker.byte_total(), 40);
        assert_eq!(tracker.entity_count(), 2);
        assert!(tracker.is_dirty(e[0], 2));
        assert!(!tracker.is_dirty(e[1], 2));
    }

    #[test]
    fn swap_alternates_and_resets() {
        let e = entities(2);
        let mut lanes = LanePair::default();
        let first = lanes.front_index();
        lanes.front().add(e[0]);
        lanes.front().require_upload(e[0], 0, 8);

        let drained = lanes.swap();
        assert_ne!(lanes.front_index(), first);
        assert_eq!(drained.adds, vec![e[0]]);
        assert_eq!(drained.dirty.byte_total, 8);
        assert_eq!(lanes.front().pending_adds(), 0);

        lanes.front().remove(e[1]);
        let drained = lanes.swap();
        assert_eq!(lanes.front_index(), first);
        assert_eq!(drained.removes, vec![e[1]]);
        assert!(drained.adds.is_empty());
        // the lane drained first comes back empty
        assert_eq!(lanes.front().dirty().component_count(), 0);
    }

    #[test]
    fn concurrent_marks_are_idempotent() {
        let e = entities(256);
        let tracker = DirtyTracker::default();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for (n, &entity) in e.iter().enumerate() {
                        tracker.mark(entity, n % 3, 4);
                        tracker.mark(entity, n % 3, 4);
                    }
                });
            }
        });
        assert_eq!(tracker.component_count(), 256);
        assert_eq!(tracker.byte_total(), 1024);
        assert_eq!(tracker.entity_count(), 256);
    }
}
