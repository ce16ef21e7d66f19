//! Instance index allocation with slot reuse.
//!
//! Freed indices go to a FIFO queue and are handed out before the monotonic
//! counter advances, so the SoA buffer stays dense. Allocation past the
//! current buffer capacity fails until the upload pipeline grows the buffer.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct InstanceAllocator {
    free: Mutex<VecDeque<u32>>,
    free_count: AtomicU32,
    next_index: AtomicU32,
    capacity: AtomicU32,
}

impl InstanceAllocator {
    pub fn new(capacity: u32) -> Self {
        Self {
            free: Mutex::new(VecDeque::new()),
            free_count: AtomicU32::new(0),
            next_index: AtomicU32::new(0),
            capacity: AtomicU32::new(capacity),
        }
    }

    /// Hand out a free index, or `None` when the counter has reached capacity.
    pub fn allocate(&self) -> Option<u32> {
        {
            let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(index) = free.pop_front() {
                self.free_count.fetch_sub(1, Ordering::AcqRel);
                return Some(index);
            }
        }

        let capacity = self.capacity.load(Ordering::Acquire);
        self.next_index
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < capacity).then_some(next + 1)
            })
            .ok()
    }

    /// Return `index` to the free queue. The caller clears GPU-visible records first.
    pub fn free(&self, index: u32) {
        debug_assert!(index < self.next_index.load(Ordering::Acquire));
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push_back(index);
        self.free_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_capacity(&self, capacity: u32) {
        self.capacity.fetch_max(capacity, Ordering::AcqRel);
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> u32 {
        self.free_count.load(Ordering::Acquire)
    }

    /// Highest index ever issued plus one.
    pub fn high_water(&self) -> u32 {
        self.next_index.load(Ordering::Acquire)
    }

    /// Instances the buffer must hold after `adds` more allocations.
    pub fn required_capacity(&self, adds: u32) -> u32 {
        self.high_water()
            .saturating_add(adds.saturating_sub(self.free_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashSet;
    use rand::Rng;

    #[test]
    fn reuses_freed_indices_before_advancing() {
        let alloc = InstanceAllocator::new(8);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        let c = alloc.allocate().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));

        alloc.free(b);
        alloc.free(a);
        assert_eq!(alloc.free_count(), 2);
        assert_eq!(alloc.allocate(), Some(b));
        assert_eq!(alloc.allocate(), Some(a));
        assert_eq!(alloc.allocate(), Some(3));
        assert_eq!(alloc.high_water(), 4);
    }

    #[test]
    fn fails_at_capacity_until_grown() {
        let alloc = InstanceAllocator::new(2);
        assert!(alloc.allocate().is_some());
        assert!(alloc.allocate().is_some());
        assert_eq!(alloc.allocate(), None);
        assert_eq!(alloc.required_capacity(3), 5);

        alloc.set_capacity(4);
        assert_eq!(alloc.allocate(), Some(2));
        // capacity never shrinks
        alloc.set_capacity(1);
        assert_eq!(alloc.capacity(), 4);
    }

    #[test]
    fn required_capacity_counts_free_slots() {
        let alloc = InstanceAllocator::new(16);
        for _ in 0..4 {
            alloc.allocate();
        }
        alloc.free(1);
        alloc.free(2);
        assert_eq!(alloc.required_capacity(1), 4);
        assert_eq!(alloc.required_capacity(5), 7);
    }

    #[test]
    fn random_churn_keeps_live_indices_unique() {
        let alloc = InstanceAllocator::new(64);
        let mut live: Vec<u32> = Vec::new();
        let mut rng = rand::rng();
        for _ in 0..2000 {
            if live.is_empty() || rng.random_bool(0.6) {
                if let Some(index) = alloc.allocate() {
                    live.push(index);
                }
            } else {
                let victim = live.swap_remove(rng.random_range(0..live.len()));
                alloc.free(victim);
            }
            let unique: HashSet<u32> = live.iter().copied().collect();
            assert_eq!(unique.len(), live.len());
            assert!(live.iter().all(|&i| i < 64));
        }
    }
}
