//! Segmented Structure-of-Arrays buffer.
//!
//! One GPU buffer holds a column ("segment") per registered component, or per
//! bundle of components interleaved into one segment. Two layouts:
//!
//! - Continuous: segments back to back, each `stride * capacity` bytes. Growth
//!   moves every segment, so migration copies each segment separately.
//! - Paged: instances are grouped in pages of `page_size`; every page holds a
//!   slice of every segment. Growth appends pages, so existing offsets never
//!   move and migration is a single prefix copy.
//!
//! Capacity only grows. A resize hands back the old buffer together with its
//! layout; the caller migrates live data and retires the buffer later.

use bevy::prelude::*;
use hashbrown::HashMap;

use crate::error::GpuSceneError;
use crate::gpu::{BufferDesc, BufferRole, SceneDevice};
use crate::registry::ComponentTypeInfo;

/// Page strides are aligned so every page starts on an upload boundary.
pub const PAGE_ALIGNMENT: u64 = 256;
/// Upload descriptors address the buffer with 32-bit byte offsets.
pub const MAX_BUFFER_BYTES: u64 = u32::MAX as u64;

pub fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

// =============================================================================
// LAYOUT
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub stride: u32,
    pub align: u32,
    /// Continuous: start of the column. Paged: offset inside each page.
    pub buffer_offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Mapping {
    segment: usize,
    element_offset: u32,
    element_size: u32,
}

/// A byte range to migrate from an old buffer into a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct SoaLayout {
    segments: Vec<Segment>,
    mappings: HashMap<u32, Mapping>,
    page_size: Option<u32>,
    instance_capacity: u32,
    page_stride: u64,
    size_bytes: u64,
}

impl SoaLayout {
    pub fn instance_capacity(&self) -> u32 {
        self.instance_capacity
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn page_size(&self) -> Option<u32> {
        self.page_size
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Byte offset of component `soa_index` for `instance`. Pure function of the segment table.
    pub fn component_offset(&self, soa_index: u32, instance: u32) -> Option<u64> {
        if instance >= self.instance_capacity {
            return None;
        }
        let mapping = self.mappings.get(&soa_index)?;
        let segment = &self.segments[mapping.segment];
        let stride = segment.stride as u64;
        let offset = match self.page_size {
            None => segment.buffer_offset + instance as u64 * stride,
            Some(page) => {
                let (page_index, in_page) = (instance / page, instance % page);
                page_index as u64 * self.page_stride
                    + segment.buffer_offset
                    + in_page as u64 * stride
            }
        };
        Some(offset + mapping.element_offset as u64)
    }

    /// Same segment table, laid out for `capacity` instances.
    pub fn with_capacity(&self, capacity: u32) -> SoaLayout {
        let mut layout = self.clone();
        layout.relayout(capacity);
        layout
    }

    fn relayout(&mut self, capacity: u32) {
        match self.page_size {
            None => {
                let mut offset = 0u64;
                for segment in &mut self.segments {
                    offset = align_up(offset, segment.align as u64);
                    segment.buffer_offset = offset;
                    offset += segment.stride as u64 * capacity as u64;
                }
                self.instance_capacity = capacity;
                self.page_stride = 0;
                self.size_bytes = align_up(offset, 4);
            }
            Some(page) => {
                let pages = capacity.div_ceil(page).max(1);
                let mut offset = 0u64;
                for segment in &mut self.segments {
                    offset = align_up(offset, segment.align as u64);
                    segment.buffer_offset = offset;
                    offset += segment.stride as u64 * page as u64;
                }
                self.page_stride = align_up(offset, PAGE_ALIGNMENT);
                self.instance_capacity = pages.saturating_mul(page);
                self.size_bytes = self.page_stride * pages as u64;
            }
        }
    }

    /// Regions that move the first `live` instances of `self` into `new`.
    pub fn migration_regions(&self, new: &SoaLayout, live: u32) -> Vec<CopyRegion> {
        let live = live.min(self.instance_capacity);
        if live == 0 {
            return Vec::new();
        }
        match (self.page_size, new.page_size) {
            (Some(page), Some(new_page)) if page == new_page && self.page_stride == new.page_stride => {
                let pages = live.div_ceil(page) as u64;
                vec![CopyRegion { src_offset: 0, dst_offset: 0, size: pages * self.page_stride }]
            }
            (None, None) => self
                .segments
                .iter()
                .zip(&new.segments)
                .map(|(old, new)| CopyRegion {
                    src_offset: old.buffer_offset,
                    dst_offset: new.buffer_offset,
                    size: old.stride as u64 * live as u64,
                })
                .collect(),
            _ => {
                // Mismatched layouts fall back to per-element moves.
                let mut regions = Vec::new();
                for (&slot, mapping) in &self.mappings {
                    for instance in 0..live {
                        if let (Some(src), Some(dst)) =
                            (self.component_offset(slot, instance), new.component_offset(slot, instance))
                        {
                            regions.push(CopyRegion {
                                src_offset: src,
                                dst_offset: dst,
                                size: mapping.element_size as u64,
                            });
                        }
                    }
                }
                regions
            }
        }
    }
}

// =============================================================================
// LAYOUT BUILDER
// =============================================================================

#[derive(Default)]
pub struct SoaLayoutBuilder {
    segments: Vec<Vec<(u32, u32, u32)>>,
    page_size: Option<u32>,
}

impl SoaLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size;
        self
    }

    /// One component in its own segment.
    pub fn add_component(mut self, info: &ComponentTypeInfo) -> Self {
        self.segments
            .push(vec![(info.soa_index(), info.element_size(), info.element_align())]);
        self
    }

    /// Several components interleaved in one segment, in the given order.
    pub fn add_bundle<'a>(mut self, infos: impl IntoIterator<Item = &'a ComponentTypeInfo>) -> Self {
        let fields: Vec<_> = infos
            .into_iter()
            .map(|i| (i.soa_index(), i.element_size(), i.element_align()))
            .collect();
        if !fields.is_empty() {
            self.segments.push(fields);
        }
        self
    }

    pub fn build(self, instance_capacity: u32) -> Result<SoaLayout, GpuSceneError> {
        let mut segments = Vec::with_capacity(self.segments.len());
        let mut mappings = HashMap::new();

        for (segment_index, fields) in self.segments.into_iter().enumerate() {
            let mut stride = 0u32;
            let mut align = 4u32;
            for (soa_index, size, element_align) in fields {
                let element_offset = align_up(stride as u64, element_align as u64) as u32;
                stride = element_offset + size;
                align = align.max(element_align);
                let mapping = Mapping { segment: segment_index, element_offset, element_size: size };
                if mappings.insert(soa_index, mapping).is_some() {
                    return Err(GpuSceneError::DuplicateSlot(soa_index));
                }
            }
            let stride = align_up(stride as u64, align as u64) as u32;
            segments.push(Segment { stride, align, buffer_offset: 0 });
        }

        let mut layout = SoaLayout {
            segments,
            mappings,
            page_size: self.page_size,
            instance_capacity: 0,
            page_stride: 0,
            size_bytes: 0,
        };
        layout.relayout(instance_capacity);
        if layout.size_bytes > MAX_BUFFER_BYTES {
            return Err(GpuSceneError::CapacityExceeded {
                requested: layout.size_bytes,
                limit: MAX_BUFFER_BYTES,
            });
        }
        Ok(layout)
    }
}

/// Capacity after growing to fit `required` instances.
pub fn grown_capacity(current: u32, required: u32, growth_factor: f32) -> u32 {
    let scaled = (required as f64 * growth_factor as f64).ceil();
    let scaled = if scaled >= u32::MAX as f64 { u32::MAX } else { scaled as u32 };
    scaled.max(required).max(current)
}

// =============================================================================
// BUFFER
// =============================================================================

/// Buffer taken out of service by a resize, with the layout its data is in.
#[derive(Debug)]
pub struct RetiredBuffer<B> {
    pub buffer: B,
    pub layout: SoaLayout,
}

pub struct SegmentedSoaBuffer<B> {
    layout: SoaLayout,
    buffer: B,
    label: String,
}

impl<B: Clone> SegmentedSoaBuffer<B> {
    pub fn new<D>(device: &mut D, layout: SoaLayout, label: &str) -> Result<Self, GpuSceneError>
    where
        D: SceneDevice<Buffer = B>,
    {
        let buffer = create_scene_buffer(device, &layout, label)?;
        Ok(Self { layout, buffer, label: label.to_string() })
    }

    pub fn needs_resize(&self, required_instances: u32) -> bool {
        required_instances > self.layout.instance_capacity
    }

    /// Swap in a buffer sized for `new_capacity` and return the old one, unfreed.
    ///
    /// A capacity at or below the current one is a no-op. On failure the
    /// current buffer and layout stay in place.
    pub fn resize<D>(
        &mut self,
        device: &mut D,
        new_capacity: u32,
    ) -> Result<Option<RetiredBuffer<B>>, GpuSceneError>
    where
        D: SceneDevice<Buffer = B>,
    {
        if new_capacity <= self.layout.instance_capacity {
            warn!(
                "SoA resize to {} ignored, capacity is already {}",
                new_capacity, self.layout.instance_capacity
            );
            return Ok(None);
        }

        let layout = self.layout.with_capacity(new_capacity);
        if layout.size_bytes > MAX_BUFFER_BYTES {
            return Err(GpuSceneError::CapacityExceeded {
                requested: layout.size_bytes,
                limit: MAX_BUFFER_BYTES,
            });
        }
        let buffer = create_scene_buffer(device, &layout, &self.label)?;
        info!(
            "SoA buffer `{}` grown {} -> {} instances ({} bytes)",
            self.label, self.layout.instance_capacity, layout.instance_capacity, layout.size_bytes
        );

        let old_layout = std::mem::replace(&mut self.layout, layout);
        let old_buffer = std::mem::replace(&mut self.buffer, buffer);
        Ok(Some(RetiredBuffer { buffer: old_buffer, layout: old_layout }))
    }

    /// Record GPU copies of the first `live_instances` entries of every segment.
    pub fn copy_segments<D>(&self, device: &mut D, old: &RetiredBuffer<B>, live_instances: u32)
    where
        D: SceneDevice<Buffer = B>,
    {
        for region in old.layout.migration_regions(&self.layout, live_instances) {
            device.copy_buffer(&old.buffer, region.src_offset, &self.buffer, region.dst_offset, region.size);
        }
    }

    pub fn component_offset(&self, soa_index: u32, instance: u32) -> Option<u64> {
        self.layout.component_offset(soa_index, instance)
    }

    pub fn layout(&self) -> &SoaLayout {
        &self.layout
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn instance_capacity(&self) -> u32 {
        self.layout.instance_capacity
    }

    /// Hand the live buffer back to `device`.
    pub fn release<D>(self, device: &mut D)
    where
        D: SceneDevice<Buffer = B>,
    {
        device.free_buffer(self.buffer);
    }
}

fn create_scene_buffer<D: SceneDevice>(
    device: &mut D,
    layout: &SoaLayout,
    label: &str,
) -> Result<D::Buffer, GpuSceneError> {
    // Empty registries still get a bindable buffer.
    let size = layout.size_bytes.max(4);
    device
        .create_buffer(&BufferDesc { label, size, role: BufferRole::Scene })
        .ok_or_else(|| GpuSceneError::BufferCreation { label: label.to_string(), size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HostDevice;
    use bevy::ecs::component::ComponentId;

    fn info(slot: u32, size: u32, align: u32) -> ComponentTypeInfo {
        // SAFETY: these ids are never read from a world.
        unsafe { ComponentTypeInfo::new(ComponentId::new(slot as usize), slot, size, align, format!("s{slot}")) }
    }

    #[test]
    fn continuous_offsets() {
        let layout = SoaLayoutBuilder::new()
            .add_component(&info(0, 12, 4))
            .add_component(&info(1, 16, 16))
            .build(10)
            .unwrap();
        // 12 * 10 = 120, aligned to 16 -> 128
        assert_eq!(layout.segments()[1].buffer_offset, 128);
        assert_eq!(layout.component_offset(0, 3), Some(36));
        assert_eq!(layout.component_offset(1, 2), Some(128 + 32));
        assert_eq!(layout.component_offset(1, 10), None);
        assert_eq!(layout.component_offset(7, 0), None);
        assert_eq!(layout.size_bytes(), 128 + 160);
    }

    #[test]
    fn paged_offsets_are_stable_across_growth() {
        let layout = SoaLayoutBuilder::new()
            .page_size(Some(8))
            .add_component(&info(0, 12, 4))
            .add_component(&info(1, 4, 4))
            .build(10)
            .unwrap();
        // 10 rounds up to two pages
        assert_eq!(layout.instance_capacity(), 16);
        // page body: 96 + 32 = 128, aligned to 256
        assert_eq!(layout.component_offset(1, 9), Some(256 + 96 + 4));

        let grown = layout.with_capacity(40);
        assert_eq!(grown.instance_capacity(), 40);
        for i in 0..16 {
            assert_eq!(grown.component_offset(0, i), layout.component_offset(0, i));
        }
        let regions = layout.migration_regions(&grown, 9);
        assert_eq!(regions, vec![CopyRegion { src_offset: 0, dst_offset: 0, size: 512 }]);
    }

    #[test]
    fn bundles_interleave_fields() {
        let layout = SoaLayoutBuilder::new()
            .add_bundle([&info(0, 4, 4), &info(1, 8, 8)])
            .build(4)
            .unwrap();
        assert_eq!(layout.segments().len(), 1);
        assert_eq!(layout.segments()[0].stride, 16);
        assert_eq!(layout.component_offset(0, 1), Some(16));
        assert_eq!(layout.component_offset(1, 1), Some(24));
    }

    #[test]
    fn grown_capacity_is_monotonic() {
        assert_eq!(grown_capacity(100, 101, 1.5), 152);
        assert_eq!(grown_capacity(100, 10, 1.5), 100);
        assert_eq!(grown_capacity(0, u32::MAX, 1.5), u32::MAX);
    }

    #[test]
    fn resize_migrates_live_segments() {
        let mut device = HostDevice::new();
        let layout = SoaLayoutBuilder::new()
            .add_component(&info(0, 4, 4))
            .add_component(&info(1, 4, 4))
            .build(2)
            .unwrap();
        let mut soa = SegmentedSoaBuffer::new(&mut device, layout, "scene").unwrap();
        device.write_buffer(soa.buffer(), 0, bytemuck::cast_slice(&[1u32, 2, 3, 4]));
        device.submit();

        assert!(soa.needs_resize(3));
        let retired = soa.resize(&mut device, 4).unwrap().unwrap();
        assert_eq!(soa.instance_capacity(), 4);
        assert!(device.is_live(&retired.buffer));

        soa.copy_segments(&mut device, &retired, 2);
        device.submit();
        let data: Vec<u32> = device
            .read(soa.buffer())
            .unwrap()
            .chunks_exact(4)
            .map(bytemuck::pod_read_unaligned)
            .collect();
        assert_eq!(data, vec![1, 2, 0, 0, 3, 4, 0, 0]);

        // shrinking is ignored
        assert!(soa.resize(&mut device, 3).unwrap().is_none());
        assert_eq!(soa.instance_capacity(), 4);
    }

    #[test]
    fn failed_resize_keeps_current_buffer() {
        let mut device = HostDevice::new().with_max_buffer_size(64);
        let layout = SoaLayoutBuilder::new().add_component(&info(0, 16, 4)).build(4).unwrap();
        let mut soa = SegmentedSoaBuffer::new(&mut device, layout, "scene").unwrap();
        let before = *soa.buffer();
        assert!(soa.resize(&mut device, 8).is_err());
        assert_eq!(*soa.buffer(), before);
        assert_eq!(soa.instance_capacity(), 4);
    }
}
