//! Upload scan: dirty components to packed staging bytes and scatter descriptors.
//!
//! Scan tasks run in parallel over batches of dirty entities. Each copy
//! reserves its staging bytes and its descriptor slot with a `fetch_add` on a
//! shared cursor, then writes into the reserved region with no lock held.
//! Reservations past capacity fail and the operation is reported back as an
//! [`UploadOverflow`]; nothing is retried within the frame.

use bevy::ecs::component::ComponentId;
use bevy::prelude::*;
use hashbrown::HashMap;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::accel::{AccelSource, TlasUpdateRequest};
use crate::gpu::UploadOp;
use crate::registry::ComponentRegistry;
use crate::soa::SoaLayout;
use crate::world::SceneWorld;

// =============================================================================
// CLAIM BUFFER
// =============================================================================

/// Fixed-capacity array filled concurrently through disjoint reservations.
pub struct ClaimBuffer<T> {
    cells: Box<[UnsafeCell<T>]>,
    capacity: usize,
    cursor: AtomicUsize,
}

// Claims hand out disjoint ranges, and reads need `&mut self`.
unsafe impl<T: Send> Sync for ClaimBuffer<T> {}

impl<T: Copy + Default> Default for ClaimBuffer<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

/// A reserved, not yet written range of a [`ClaimBuffer`].
pub struct Claim<'a, T> {
    buffer: &'a ClaimBuffer<T>,
    start: usize,
    len: usize,
}

impl<T: Copy + Default> ClaimBuffer<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cells: (0..capacity).map(|_| UnsafeCell::new(T::default())).collect(),
            capacity,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Empty the buffer and make room for `capacity` elements, reusing storage when it fits.
    pub fn reset(&mut self, capacity: usize) {
        if self.cells.len() < capacity {
            *self = Self::with_capacity(capacity);
        }
        self.capacity = capacity;
        *self.cursor.get_mut() = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserve `len` elements. `None` once the reservation would run past capacity.
    pub fn claim(&self, len: usize) -> Option<Claim<'_, T>> {
        let start = self.cursor.fetch_add(len, Ordering::Relaxed);
        (start + len <= self.capacity).then_some(Claim { buffer: self, start, len })
    }

    /// Everything written so far.
    pub fn filled(&mut self) -> &[T] {
        let len = (*self.cursor.get_mut()).min(self.capacity);
        let cells = &self.cells[..len];
        // SAFETY: UnsafeCell<T> has the layout of T and `&mut self` excludes writers.
        unsafe { std::slice::from_raw_parts(cells.as_ptr().cast::<T>(), len) }
    }
}

impl<T: Copy> Claim<'_, T> {
    pub fn offset(&self) -> usize {
        self.start
    }

    pub fn write(self, data: &[T]) {
        assert_eq!(data.len(), self.len, "claim written with the wrong length");
        // SAFETY: `start..start + len` was reserved by this claim alone and is
        // in bounds; writes go through UnsafeCell.
        unsafe {
            let dst = UnsafeCell::raw_get(self.buffer.cells.as_ptr().add(self.start));
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, self.len);
        }
    }
}

// =============================================================================
// SCAN
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowKind {
    /// The staging cache had no room left.
    Staging,
    /// The descriptor list had no slot left.
    Operations,
}

/// One dropped (entity, component) upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadOverflow {
    pub entity: Entity,
    pub component: ComponentId,
    pub ordinal: usize,
    pub kind: OverflowKind,
}

pub(crate) struct ScanInput<'a, W> {
    pub world: &'a W,
    pub registry: &'a ComponentRegistry,
    pub layout: &'a SoaLayout,
    pub instances: &'a HashMap<Entity, u32>,
    pub masks: &'a HashMap<Entity, u64>,
    pub staging: &'a ClaimBuffer<u8>,
    pub operations: &'a ClaimBuffer<UploadOp>,
}

#[derive(Default)]
pub(crate) struct ScanOutput {
    pub overflows: Vec<UploadOverflow>,
    /// Transform refreshes for the acceleration table, by instance index.
    pub transforms: Vec<(u32, AccelSource)>,
    /// Dirty entities with no live instance.
    pub skipped: u32,
}

pub(crate) fn scan_batch<W: SceneWorld>(input: &ScanInput<'_, W>, batch: &[Entity]) -> ScanOutput {
    let mut out = ScanOutput::default();
    let transform = input.registry.transform_ordinal();

    for &entity in batch {
        let Some(&instance) = input.instances.get(&entity) else {
            out.skipped += 1;
            continue;
        };
        let mut mask = input.masks.get(&entity).copied().unwrap_or(0);

        while mask != 0 {
            let ordinal = mask.trailing_zeros() as usize;
            mask &= mask - 1;

            let Some(info) = input.registry.get(ordinal) else { continue };
            let size = info.element_size() as usize;
            // Absent components keep whatever the buffer already holds.
            // SAFETY: registry entries only describe padding-free components.
            let bytes = unsafe { input.world.component_bytes(entity, info.component_id()) };
            let Some(data) = bytes.and_then(|bytes| bytes.get(..size)) else {
                continue;
            };
            let Some(dst) = input.layout.component_offset(info.soa_index(), instance) else {
                continue;
            };

            let overflow = |kind| UploadOverflow { entity, component: info.component_id(), ordinal, kind };
            let Some(staged) = input.staging.claim(size) else {
                out.overflows.push(overflow(OverflowKind::Staging));
                continue;
            };
            let Some(slot) = input.operations.claim(1) else {
                out.overflows.push(overflow(OverflowKind::Operations));
                continue;
            };

            let op = UploadOp {
                src_offset: staged.offset() as u32,
                dst_offset: dst as u32,
                data_size: info.element_size(),
            };
            staged.write(data);
            slot.write(&[op]);

            if transform == Some(ordinal) {
                if let Some(source) = input.world.acceleration_source(entity) {
                    out.transforms.push((instance, source));
                }
            }
        }
    }
    out
}

// =============================================================================
// REPORT
// =============================================================================

/// What one `execute_upload` did.
#[derive(Clone, Debug, Default)]
pub struct UploadReport {
    pub frame: u64,
    pub added: u32,
    pub removed: u32,
    /// Adds that could not get an instance index this frame.
    pub deferred_adds: u32,
    pub operations: u32,
    pub upload_bytes: u64,
    pub dispatches: u32,
    /// Dirty entities that held no instance and were passed over.
    pub skipped: u32,
    pub overflows: Vec<UploadOverflow>,
    /// Old and new instance capacity when the buffer grew.
    pub resized: Option<(u32, u32)>,
    pub released_buffers: u32,
    pub tlas_request: Option<TlasUpdateRequest>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ComponentTypeInfo;
    use crate::soa::SoaLayoutBuilder;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Component, Clone, Copy, Pod, Zeroable)]
    struct Position([f32; 3]);

    #[test]
    fn claims_are_disjoint_and_bounded() {
        let mut buffer = ClaimBuffer::<u8>::with_capacity(8);
        let a = buffer.claim(4).unwrap();
        let b = buffer.claim(4).unwrap();
        assert_eq!((a.offset(), b.offset()), (0, 4));
        assert!(buffer.claim(1).is_none());
        b.write(&[5, 6, 7, 8]);
        a.write(&[1, 2, 3, 4]);
        assert_eq!(buffer.filled(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn reset_reuses_storage() {
        let mut buffer = ClaimBuffer::<u32>::with_capacity(4);
        buffer.claim(2).unwrap().write(&[1, 2]);
        buffer.reset(3);
        assert!(buffer.filled().is_empty());
        assert_eq!(buffer.capacity(), 3);
        assert!(buffer.claim(4).is_none());

        buffer.reset(16);
        assert_eq!(buffer.capacity(), 16);
        buffer.claim(16).unwrap().write(&[7; 16]);
        assert_eq!(buffer.filled().len(), 16);
    }

    #[test]
    fn parallel_claims_fill_every_slot_once() {
        let mut buffer = ClaimBuffer::<u32>::with_capacity(1000);
        std::thread::scope(|s| {
            for t in 0..4u32 {
                let buffer = &buffer;
                s.spawn(move || {
                    for i in 0..300u32 {
                        if let Some(claim) = buffer.claim(1) {
                            claim.write(&[t * 1000 + i]);
                        }
                    }
                });
            }
        });
        let mut values = buffer.filled().to_vec();
        assert_eq!(values.len(), 1000);
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 1000);
    }

    #[test]
    fn staging_overflow_keeps_written_operations() {
        let mut world = World::new();
        let info = ComponentTypeInfo::of::<Position>(&mut world, 0, "Position");
        let layout = SoaLayoutBuilder::new().add_component(&info).build(4).unwrap();
        let registry = ComponentRegistry::new(vec![info]).unwrap();

        let first = world.spawn(Position([1.0, 2.0, 3.0])).id();
        let second = world.spawn(Position([4.0, 5.0, 6.0])).id();
        let instances: HashMap<Entity, u32> = [(first, 0), (second, 1)].into_iter().collect();
        let masks: HashMap<Entity, u64> = [(first, 1), (second, 1)].into_iter().collect();

        // Room for one position only.
        let mut staging = ClaimBuffer::<u8>::with_capacity(12);
        let mut operations = ClaimBuffer::<UploadOp>::with_capacity(4);
        let out = scan_batch(
            &ScanInput {
                world: &world,
                registry: &registry,
                layout: &layout,
                instances: &instances,
                masks: &masks,
                staging: &staging,
                operations: &operations,
            },
            &[first, second],
        );

        assert_eq!(out.overflows.len(), 1);
        assert_eq!(out.overflows[0].entity, second);
        assert_eq!(out.overflows[0].kind, OverflowKind::Staging);
        assert_eq!(out.skipped, 0);
        assert_eq!(
            operations.filled(),
            &[UploadOp { src_offset: 0, dst_offset: 0, data_size: 12 }]
        );
        assert_eq!(staging.filled(), bytemuck::bytes_of(&Position([1.0, 2.0, 3.0])));
    }
}
