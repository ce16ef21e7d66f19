//! GPU Scene - mirrors registered ECS components into one SoA buffer.
//!
//! Producers (any thread, any time during simulation) call `add_entity`,
//! `remove_entity` and `require_upload`, which only record into the front
//! mutation lane. Once per frame the upload thread calls `execute_upload`:
//!
//! 1. BufferAdjust: swap lanes, reconcile removes, grow the SoA buffer if the
//!    pending adds don't fit, then hand out instance indices.
//! 2. StagingPrepare: size the upload and descriptor buffers for the drained
//!    dirty bytes, growing this frame slot's buffers lazily.
//! 3. Scan: parallel over dirty entities on the task pool, filling the staging
//!    cache and descriptor list through atomic reservations.
//! 4. Sync: end of the task scope, the only barrier.
//! 5. CpuCopyIn: staging cache and descriptors into the upload buffers.
//! 6. GpuScatterDispatch: one scatter pass per descriptor batch.
//! 7. Acceleration structure request, then back to Idle.
//!
//! Buffers retired by a resize sit in the frame slot that retired them and
//! are freed when that slot comes around again, `frames_in_flight + 1`
//! frames later.

use bevy::ecs::component::ComponentId;
use bevy::prelude::*;
use bevy::tasks::TaskPool;
use hashbrown::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::accel::{AccelInstance, AccelSource, BlasHandle, TlasDescriptor, TlasUpdateRequest};
use crate::error::GpuSceneError;
use crate::gpu::{
    dispatch_groups, operations_per_dispatch, BufferDesc, BufferRole, SceneDevice,
    SparseUploadConstants, SparseUploadDispatch, UploadOp,
};
use crate::instance::InstanceAllocator;
use crate::lane::{LanePair, MutationLane};
use crate::registry::{ComponentRegistry, ComponentTypeInfo};
use crate::settings::GpuSceneConfig;
use crate::soa::{align_up, grown_capacity, SegmentedSoaBuffer, SoaLayout, SoaLayoutBuilder};
use crate::upload::{scan_batch, ClaimBuffer, OverflowKind, ScanInput, ScanOutput, UploadReport};
use crate::world::SceneWorld;

const SCENE_BUFFER_LABEL: &str = "gpu_scene_soa";
const UPLOAD_BUFFER_LABEL: &str = "gpu_scene_upload";
const OPERATIONS_BUFFER_LABEL: &str = "gpu_scene_upload_operations";

/// Where `execute_upload` currently is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UploadPhase {
    #[default]
    Idle,
    BufferAdjust,
    StagingPrepare,
    Scan,
    Sync,
    CpuCopyIn,
    GpuScatterDispatch,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Size of the live SoA buffer.
    pub capacity_bytes: u64,
    /// Bytes covered by instance indices handed out so far.
    pub used_bytes: u64,
    /// Upload and descriptor buffers across all frame slots.
    pub upload_bytes: u64,
    /// Retired SoA buffers waiting for their frame slot.
    pub pending_discard_bytes: u64,
}

// =============================================================================
// FRAME RESOURCES
// =============================================================================

struct SizedBuffer<B> {
    buffer: B,
    size: u64,
}

struct UploadContext<B> {
    upload_buffer: Option<SizedBuffer<B>>,
    operations_buffer: Option<SizedBuffer<B>>,
    staging: ClaimBuffer<u8>,
    operations: ClaimBuffer<UploadOp>,
}

struct FrameResources<B> {
    buffer_to_discard: Option<SizedBuffer<B>>,
    upload: UploadContext<B>,
}

impl<B> Default for FrameResources<B> {
    fn default() -> Self {
        Self {
            buffer_to_discard: None,
            upload: UploadContext {
                upload_buffer: None,
                operations_buffer: None,
                staging: ClaimBuffer::default(),
                operations: ClaimBuffer::default(),
            },
        }
    }
}

/// Grow `slot` to at least `size` bytes, recreating it when too small.
fn ensure_buffer<D: SceneDevice>(
    device: &mut D,
    slot: &mut Option<SizedBuffer<D::Buffer>>,
    size: u64,
    label: &str,
    role: BufferRole,
) -> Option<D::Buffer> {
    if let Some(current) = slot.as_ref() {
        if current.size >= size {
            return Some(current.buffer.clone());
        }
    }
    // This slot's previous upload finished frames_in_flight frames ago.
    if let Some(old) = slot.take() {
        device.free_buffer(old.buffer);
    }
    let buffer = device.create_buffer(&BufferDesc { label, size, role })?;
    *slot = Some(SizedBuffer { buffer: buffer.clone(), size });
    Some(buffer)
}

// =============================================================================
// ACCELERATION TABLE
// =============================================================================

#[derive(Default)]
struct AccelTable {
    instances: Vec<AccelInstance>,
    dirty: bool,
    pending_blases: Vec<BlasHandle>,
    known_blases: HashSet<BlasHandle>,
}

impl AccelTable {
    fn set(&mut self, index: u32, instance: AccelInstance) {
        let i = index as usize;
        if self.instances.len() <= i {
            self.instances.resize(i + 1, AccelInstance::default());
        }
        if let Some(blas) = instance.blas {
            if self.known_blases.insert(blas) {
                self.pending_blases.push(blas);
            }
        }
        self.instances[i] = instance;
        self.dirty = true;
    }

    fn refresh(&mut self, index: u32, source: &AccelSource) {
        if let Some(slot) = self.instances.get(index as usize) {
            if slot.blas.is_some() || source.blas.is_some() {
                self.set(index, AccelInstance::new(index, source));
            }
        }
    }

    /// Zero a freed slot in place.
    fn clear(&mut self, index: u32) {
        if let Some(slot) = self.instances.get_mut(index as usize) {
            *slot = AccelInstance::default();
            self.dirty = true;
        }
    }
}

// =============================================================================
// BUILDER
// =============================================================================

pub struct GpuSceneBuilder {
    config: GpuSceneConfig,
    components: Vec<ComponentTypeInfo>,
    bundles: Vec<Vec<ComponentTypeInfo>>,
    transform_slot: Option<u32>,
}

impl GpuSceneBuilder {
    pub fn new(config: GpuSceneConfig) -> Self {
        Self { config, components: Vec::new(), bundles: Vec::new(), transform_slot: None }
    }

    pub fn with_component(mut self, info: ComponentTypeInfo) -> Self {
        self.components.push(info);
        self
    }

    /// Components stored interleaved in one segment.
    pub fn with_bundle(mut self, infos: Vec<ComponentTypeInfo>) -> Self {
        self.bundles.push(infos);
        self
    }

    /// Slot whose uploads also refresh acceleration-structure transforms.
    pub fn with_transform_slot(mut self, soa_index: u32) -> Self {
        self.transform_slot = Some(soa_index);
        self
    }

    pub fn config(&self) -> &GpuSceneConfig {
        &self.config
    }

    pub fn components(&self) -> impl Iterator<Item = &ComponentTypeInfo> {
        self.components.iter().chain(self.bundles.iter().flatten())
    }

    pub fn build<D: SceneDevice>(self, device: &mut D) -> Result<GpuScene<D::Buffer>, GpuSceneError> {
        self.config.validate()?;

        let mut layout = SoaLayoutBuilder::new().page_size(self.config.page_size);
        for info in &self.components {
            layout = layout.add_component(info);
        }
        for bundle in &self.bundles {
            layout = layout.add_bundle(bundle);
        }
        let capacity = self.config.initial_instances.max(1);
        let layout = layout.build(capacity)?;

        let infos = self.components.into_iter().chain(self.bundles.into_iter().flatten()).collect();
        let mut registry = ComponentRegistry::new(infos)?;
        if let Some(slot) = self.transform_slot {
            registry.set_transform_slot(slot)?;
        }

        let soa = SegmentedSoaBuffer::new(device, layout, SCENE_BUFFER_LABEL)?;
        let frames = (0..=self.config.frames_in_flight).map(|_| FrameResources::default()).collect();
        info!(
            "GPU scene initialized: {} component types, {} instances, {} bytes",
            registry.len(),
            soa.instance_capacity(),
            soa.layout().size_bytes()
        );

        Ok(GpuScene {
            allocator: InstanceAllocator::new(soa.instance_capacity()),
            config: self.config,
            registry,
            soa,
            lanes: LanePair::default(),
            instances: Mutex::new(HashMap::new()),
            accel: Mutex::new(AccelTable::default()),
            instance_count: AtomicU32::new(0),
            frames,
            frame: 0,
            phase: UploadPhase::Idle,
        })
    }
}

// =============================================================================
// SCENE
// =============================================================================

#[derive(Resource)]
pub struct GpuScene<B: Send + Sync + 'static> {
    config: GpuSceneConfig,
    registry: ComponentRegistry,
    soa: SegmentedSoaBuffer<B>,
    allocator: InstanceAllocator,
    lanes: LanePair,
    instances: Mutex<HashMap<Entity, u32>>,
    accel: Mutex<AccelTable>,
    instance_count: AtomicU32,
    frames: Vec<FrameResources<B>>,
    frame: u64,
    phase: UploadPhase,
}

impl<B: Clone + Send + Sync + 'static> GpuScene<B> {
    // -------------------------------------------------------------------------
    // Producer entry points
    // -------------------------------------------------------------------------

    /// Stage `entity` for an instance and mark all its mirrored components dirty.
    pub fn add_entity(&self, entity: Entity) {
        let lane = self.lanes.front();
        lane.add(entity);
        for (ordinal, info) in self.registry.iter().enumerate() {
            lane.require_upload(entity, ordinal, info.element_size());
        }
    }

    /// Release `entity`'s instance now if it has one, else cancel its staged add.
    /// Within one lane a removal wins over an add of the same entity.
    pub fn remove_entity(&self, entity: Entity) {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        match instances.remove(&entity) {
            Some(index) => {
                self.accel.lock().unwrap_or_else(PoisonError::into_inner).clear(index);
                self.allocator.free(index);
                self.instance_count.fetch_sub(1, Ordering::AcqRel);
                // A re-add staged this frame must not resurrect it.
                let lane = self.lanes.front();
                if lane.is_added(entity) {
                    lane.remove(entity);
                }
            }
            None => {
                self.lanes.front().remove(entity);
            }
        }
    }

    /// Mark one component of `entity` for upload. Returns false for unregistered types.
    pub fn require_upload(&self, entity: Entity, component: ComponentId) -> bool {
        let Some((ordinal, info)) = self.registry.lookup(component) else {
            return false;
        };
        self.lanes.front().require_upload(entity, ordinal, info.element_size());
        true
    }

    pub fn can_remove_entity(&self, entity: Entity) -> bool {
        self.instance_index(entity).is_some() || self.lanes.front().is_added(entity)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn component_soa_index(&self, component: ComponentId) -> Option<u32> {
        self.registry.component_soa_index(component)
    }

    pub fn component_type(&self, soa_index: u32) -> Option<ComponentId> {
        self.registry.component_type(soa_index)
    }

    pub fn is_component_type_registered(&self, component: ComponentId) -> bool {
        self.registry.is_registered(component)
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn instance_index(&self, entity: Entity) -> Option<u32> {
        let instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        instances.get(&entity).copied()
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count.load(Ordering::Acquire)
    }

    pub fn instance_capacity(&self) -> u32 {
        self.soa.instance_capacity()
    }

    /// Byte offset of `soa_index` for `instance` in the current buffer.
    pub fn component_offset(&self, soa_index: u32, instance: u32) -> Option<u64> {
        self.soa.component_offset(soa_index, instance)
    }

    pub fn layout(&self) -> &SoaLayout {
        self.soa.layout()
    }

    /// The live SoA buffer, for binding as a shader resource.
    pub fn scene_buffer(&self) -> &B {
        self.soa.buffer()
    }

    pub fn accel_instance(&self, index: u32) -> Option<AccelInstance> {
        let accel = self.accel.lock().unwrap_or_else(PoisonError::into_inner);
        accel.instances.get(index as usize).copied()
    }

    /// The lane producers currently record into.
    pub fn front_lane(&self) -> &MutationLane {
        self.lanes.front()
    }

    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn config(&self) -> &GpuSceneConfig {
        &self.config
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        let mut usage = MemoryUsage {
            capacity_bytes: self.soa.layout().size_bytes(),
            used_bytes: self.allocator.high_water() as u64 * self.registry.instance_bytes(),
            ..default()
        };
        for frame in &self.frames {
            usage.upload_bytes += frame.upload.upload_buffer.as_ref().map_or(0, |b| b.size);
            usage.upload_bytes += frame.upload.operations_buffer.as_ref().map_or(0, |b| b.size);
            usage.pending_discard_bytes += frame.buffer_to_discard.as_ref().map_or(0, |b| b.size);
        }
        usage
    }

    // -------------------------------------------------------------------------
    // Upload pipeline
    // -------------------------------------------------------------------------

    /// Drain the recorded mutations and push them to the GPU. Never fails; problems are logged.
    pub fn execute_upload<W, D>(&mut self, world: &W, device: &mut D, tasks: &TaskPool) -> UploadReport
    where
        W: SceneWorld,
        D: SceneDevice<Buffer = B>,
    {
        let _span = info_span!("gpu_scene_upload").entered();
        self.frame += 1;
        let slot = (self.frame % self.frames.len() as u64) as usize;
        let mut report = UploadReport { frame: self.frame, ..default() };

        // Whatever this slot retired last time around is no longer referenced.
        if let Some(old) = self.frames[slot].buffer_to_discard.take() {
            device.free_buffer(old.buffer);
            report.released_buffers += 1;
        }

        let drained = self.lanes.swap();

        self.phase = UploadPhase::BufferAdjust;
        let deferred = self.adjust_buffer(world, device, slot, &drained.adds, &drained.removes, &mut report);

        let dirty = drained.dirty;
        if dirty.byte_total > 0 {
            self.phase = UploadPhase::StagingPrepare;
            let op_budget = self
                .config
                .max_upload_operations
                .map_or(dirty.component_count, |max| max.min(dirty.component_count));
            let upload_size = align_up(dirty.byte_total, self.config.upload_alignment as u64);
            let ops_size = align_up(
                op_budget.max(1) as u64 * std::mem::size_of::<UploadOp>() as u64,
                self.config.upload_alignment as u64,
            );

            let ctx = &mut self.frames[slot].upload;
            let buffers = ensure_buffer(device, &mut ctx.upload_buffer, upload_size, UPLOAD_BUFFER_LABEL, BufferRole::Upload)
                .zip(ensure_buffer(device, &mut ctx.operations_buffer, ops_size, OPERATIONS_BUFFER_LABEL, BufferRole::Operations));

            match buffers {
                Some((upload_buffer, operations_buffer)) => {
                    ctx.staging.reset(upload_size as usize);
                    ctx.operations.reset(op_budget as usize);
                    self.scan_and_dispatch(world, device, tasks, slot, &dirty, &upload_buffer, &operations_buffer, &mut report);
                }
                None => {
                    error!(
                        "GPU scene could not allocate {} upload bytes, {} dirty components wait for next frame",
                        upload_size, dirty.component_count
                    );
                    let front = self.lanes.front();
                    for (entity, mask) in &dirty.masks {
                        requeue_mask(front, &self.registry, *entity, *mask);
                    }
                }
            }
        }

        report.tlas_request = self.take_tlas_request();

        // Adds that found no index retry next frame.
        for entity in deferred {
            self.add_entity(entity);
        }

        device.submit();
        self.phase = UploadPhase::Idle;
        report
    }

    fn adjust_buffer<W, D>(
        &mut self,
        world: &W,
        device: &mut D,
        slot: usize,
        adds: &[Entity],
        removes: &[Entity],
        report: &mut UploadReport,
    ) -> Vec<Entity>
    where
        W: SceneWorld,
        D: SceneDevice<Buffer = B>,
    {
        let _span = info_span!("gpu_scene_buffer_adjust").entered();
        let removed: HashSet<Entity> = removes.iter().copied().collect();
        let instances = self.instances.get_mut().unwrap_or_else(PoisonError::into_inner);
        let accel = self.accel.get_mut().unwrap_or_else(PoisonError::into_inner);

        for entity in &removed {
            if let Some(index) = instances.remove(entity) {
                accel.clear(index);
                self.allocator.free(index);
                self.instance_count.fetch_sub(1, Ordering::AcqRel);
                report.removed += 1;
            }
        }

        let pending: Vec<Entity> = adds
            .iter()
            .copied()
            .filter(|e| !removed.contains(e) && !instances.contains_key(e))
            .collect();

        let required = self.allocator.required_capacity(pending.len() as u32);
        if self.soa.needs_resize(required) {
            let current = self.soa.instance_capacity();
            let target = grown_capacity(current, required, self.config.resize_growth_factor);
            match self.soa.resize(device, target) {
                Ok(Some(retired)) => {
                    self.soa.copy_segments(device, &retired, self.allocator.high_water());
                    self.allocator.set_capacity(self.soa.instance_capacity());
                    let size = retired.layout.size_bytes();
                    self.frames[slot].buffer_to_discard = Some(SizedBuffer { buffer: retired.buffer, size });
                    report.resized = Some((current, self.soa.instance_capacity()));
                }
                Ok(None) => {}
                Err(e) => warn!("GPU scene buffer resize to {} instances failed: {}", target, e),
            }
        }

        let mut deferred = Vec::new();
        for entity in pending {
            let Some(index) = self.allocator.allocate() else {
                deferred.push(entity);
                continue;
            };
            let source = world.acceleration_source(entity).unwrap_or(AccelSource {
                blas: None,
                object_to_world: Mat4::IDENTITY,
            });
            accel.set(index, AccelInstance::new(index, &source));
            instances.insert(entity, index);
            self.instance_count.fetch_add(1, Ordering::AcqRel);
            report.added += 1;
        }

        if !deferred.is_empty() {
            warn!(
                "GPU scene has no instance slots for {} entities, retrying next frame",
                deferred.len()
            );
        }
        report.deferred_adds = deferred.len() as u32;
        deferred
    }

    #[allow(clippy::too_many_arguments)]
    fn scan_and_dispatch<W, D>(
        &mut self,
        world: &W,
        device: &mut D,
        tasks: &TaskPool,
        slot: usize,
        dirty: &crate::lane::DirtyState,
        upload_buffer: &B,
        operations_buffer: &B,
        report: &mut UploadReport,
    ) where
        W: SceneWorld,
        D: SceneDevice<Buffer = B>,
    {
        self.phase = UploadPhase::Scan;
        let outputs: Vec<ScanOutput> = {
            let _span = info_span!("gpu_scene_scan").entered();
            let ctx = &self.frames[slot].upload;
            let input = ScanInput {
                world,
                registry: &self.registry,
                layout: self.soa.layout(),
                instances: self.instances.get_mut().unwrap_or_else(PoisonError::into_inner),
                masks: &dirty.masks,
                staging: &ctx.staging,
                operations: &ctx.operations,
            };
            let batch_size = (dirty.entities.len() / self.config.scan_batch_divisor.max(1))
                .max(self.config.scan_batch_min.max(1));
            tasks.scope(|s| {
                let input = &input;
                for batch in dirty.entities.chunks(batch_size) {
                    s.spawn(async move { scan_batch(input, batch) });
                }
            })
        };

        // The scope has joined every scan task.
        self.phase = UploadPhase::Sync;
        let front = self.lanes.front();
        let accel = self.accel.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut staging_overflows = 0;
        for output in outputs {
            for (index, source) in &output.transforms {
                accel.refresh(*index, source);
            }
            report.skipped += output.skipped;
            for overflow in output.overflows {
                if overflow.kind == OverflowKind::Staging {
                    staging_overflows += 1;
                }
                debug!("GPU scene upload dropped {:?}", overflow);
                if self.config.requeue_on_overflow {
                    if let Some(info) = self.registry.get(overflow.ordinal) {
                        front.require_upload(overflow.entity, overflow.ordinal, info.element_size());
                    }
                }
                report.overflows.push(overflow);
            }
        }
        if !report.overflows.is_empty() {
            error!(
                "GPU scene upload overflow: {} operations dropped ({} staging, {} descriptor list){}",
                report.overflows.len(),
                staging_overflows,
                report.overflows.len() - staging_overflows,
                if self.config.requeue_on_overflow { ", requeued for next frame" } else { "" }
            );
        }

        self.phase = UploadPhase::CpuCopyIn;
        let ctx = &mut self.frames[slot].upload;
        let staged = ctx.staging.filled();
        device.write_buffer(upload_buffer, 0, staged);
        report.upload_bytes = staged.len() as u64;
        let ops = ctx.operations.filled();
        device.write_buffer(operations_buffer, 0, bytemuck::cast_slice(ops));
        report.operations = ops.len() as u32;

        self.phase = UploadPhase::GpuScatterDispatch;
        let _span = info_span!("gpu_scene_scatter").entered();
        let total = ops.len() as u32;
        let threads_per_op = self.config.max_threads_per_op;
        let per_dispatch = operations_per_dispatch(
            self.config.max_operations_per_dispatch,
            threads_per_op,
            device.max_workgroups_per_dimension(),
        );
        let mut first = 0;
        while first < total {
            let count = per_dispatch.min(total - first);
            device.dispatch_sparse_upload(&SparseUploadDispatch {
                upload: upload_buffer,
                operations: operations_buffer,
                target: self.soa.buffer(),
                constants: SparseUploadConstants {
                    num_operations: count,
                    max_threads_per_op: threads_per_op,
                    first_operation: first,
                    _pad: 0,
                },
                workgroups: dispatch_groups(count, threads_per_op),
            });
            report.dispatches += 1;
            first += count;
        }
    }

    fn take_tlas_request(&mut self) -> Option<TlasUpdateRequest> {
        let accel = self.accel.get_mut().unwrap_or_else(PoisonError::into_inner);
        let blases_to_build = std::mem::take(&mut accel.pending_blases);
        let live = self.instance_count.load(Ordering::Acquire);

        let tlas = (accel.dirty && live > 0).then(|| {
            let end = (self.allocator.high_water() as usize).min(accel.instances.len());
            TlasDescriptor { instances: accel.instances[..end].to_vec(), instance_count: live }
        });
        accel.dirty = false;

        let request = TlasUpdateRequest { blases_to_build, tlas };
        (!request.is_empty()).then_some(request)
    }

    /// Free every buffer the scene owns.
    pub fn release<D: SceneDevice<Buffer = B>>(mut self, device: &mut D) {
        for frame in self.frames.drain(..) {
            let buffers = [frame.buffer_to_discard, frame.upload.upload_buffer, frame.upload.operations_buffer];
            for sized in buffers.into_iter().flatten() {
                device.free_buffer(sized.buffer);
            }
        }
        self.soa.release(device);
    }
}

fn requeue_mask(lane: &MutationLane, registry: &ComponentRegistry, entity: Entity, mut mask: u64) {
    while mask != 0 {
        let ordinal = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        if let Some(info) = registry.get(ordinal) {
            lane.require_upload(entity, ordinal, info.element_size());
        }
    }
}
