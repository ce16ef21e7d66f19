//! GPU device seam for the scene.
//!
//! The upload pipeline only needs a handful of primitives: buffer
//! create/free, queue writes, buffer-to-buffer copies and the sparse scatter
//! dispatch. [`SceneDevice`] names exactly those. `wgpu_device` implements it
//! on bevy's render device, `host` emulates it in system memory.
//!
//! Recorded work becomes visible to the GPU at [`SceneDevice::submit`].

pub mod host;
pub mod wgpu_device;

use bytemuck::{Pod, Zeroable};
use std::fmt::Debug;

pub use host::{HostBuffer, HostDevice, RecordedDispatch};
pub use wgpu_device::WgpuSceneDevice;

// =============================================================================
// CONSTANTS
// =============================================================================

pub const SPARSE_UPLOAD_SHADER: &str = include_str!("../../assets/shaders/sparse_upload.wgsl");
pub const SPARSE_UPLOAD_ENTRY: &str = "main";
/// `@workgroup_size` of the scatter shader.
pub const SPARSE_UPLOAD_WORKGROUP_SIZE: u32 = 256;
/// wgpu's default `max_compute_workgroups_per_dimension`.
pub const DEFAULT_MAX_WORKGROUPS_PER_DIMENSION: u32 = 65535;

// =============================================================================
// TYPES
// =============================================================================

/// What a buffer is used for. Devices pick usage flags from this.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Persistent SoA storage, read by renderers and written by the scatter pass.
    Scene,
    /// Packed staging bytes for one frame's uploads.
    Upload,
    /// Upload descriptor list for one frame.
    Operations,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub role: BufferRole,
}

/// One scatter copy: `data_size` bytes from the upload buffer to the scene buffer.
/// Layout matches `UploadOp` in `sparse_upload.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct UploadOp {
    pub src_offset: u32,
    pub dst_offset: u32,
    pub data_size: u32,
}

/// Per-dispatch constants (uniform buffer).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SparseUploadConstants {
    pub num_operations: u32,
    pub max_threads_per_op: u32,
    /// Index of this batch's first descriptor in the operations buffer.
    pub first_operation: u32,
    pub _pad: u32,
}

/// Everything one scatter dispatch binds.
pub struct SparseUploadDispatch<'a, B> {
    pub upload: &'a B,
    pub operations: &'a B,
    pub target: &'a B,
    pub constants: SparseUploadConstants,
    pub workgroups: u32,
}

/// Workgroups of the scatter shader needed to give every operation `threads_per_op` threads.
pub fn dispatch_groups(num_operations: u32, threads_per_op: u32) -> u32 {
    let threads = num_operations as u64 * threads_per_op as u64;
    threads.div_ceil(SPARSE_UPLOAD_WORKGROUP_SIZE as u64) as u32
}

/// Largest batch whose `dispatch_groups` fits in `max_groups`, capped at `max_operations`.
pub fn operations_per_dispatch(max_operations: u32, threads_per_op: u32, max_groups: u32) -> u32 {
    let fit = max_groups as u64 * SPARSE_UPLOAD_WORKGROUP_SIZE as u64 / threads_per_op.max(1) as u64;
    fit.min(max_operations as u64).max(1) as u32
}

// =============================================================================
// DEVICE TRAIT
// =============================================================================

pub trait SceneDevice {
    type Buffer: Clone + Debug + Send + Sync + 'static;

    /// `None` when the device cannot allocate a buffer of that size.
    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Option<Self::Buffer>;

    /// Release a buffer. Callers guarantee no in-flight frame still reads it.
    fn free_buffer(&mut self, buffer: Self::Buffer);

    fn buffer_size(&self, buffer: &Self::Buffer) -> u64;

    /// Queue a CPU to GPU write, ordered before work recorded for the next submit.
    fn write_buffer(&mut self, buffer: &Self::Buffer, offset: u64, data: &[u8]);

    fn copy_buffer(
        &mut self,
        src: &Self::Buffer,
        src_offset: u64,
        dst: &Self::Buffer,
        dst_offset: u64,
        size: u64,
    );

    fn dispatch_sparse_upload(&mut self, dispatch: &SparseUploadDispatch<'_, Self::Buffer>);

    /// Most workgroups one dispatch may launch along x.
    fn max_workgroups_per_dimension(&self) -> u32 {
        DEFAULT_MAX_WORKGROUPS_PER_DIMENSION
    }

    /// Flush everything recorded since the last submit.
    fn submit(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_count_rounds_up() {
        assert_eq!(dispatch_groups(0, 4), 0);
        assert_eq!(dispatch_groups(1, 4), 1);
        assert_eq!(dispatch_groups(64, 4), 1);
        assert_eq!(dispatch_groups(65, 4), 2);
        assert_eq!(dispatch_groups(1000, 4), (1000 * 4 + 255) / 256);
    }

    #[test]
    fn batches_fit_the_group_limit() {
        for threads in [1, 3, 4, 64, 256] {
            for max_groups in [1, 7, DEFAULT_MAX_WORKGROUPS_PER_DIMENSION] {
                let count = operations_per_dispatch(u32::MAX, threads, max_groups);
                let groups = dispatch_groups(count, threads);
                assert!(groups <= max_groups, "{count} ops x {threads} threads needs {groups} groups");
                assert!(groups as u64 * SPARSE_UPLOAD_WORKGROUP_SIZE as u64 >= count as u64 * threads as u64);
            }
        }
        assert_eq!(operations_per_dispatch(10, 4, 65535), 10);
        assert_eq!(operations_per_dispatch(1_000_000, 256, 2), 2);
    }

    #[test]
    fn upload_op_is_three_words() {
        assert_eq!(std::mem::size_of::<UploadOp>(), 12);
        assert_eq!(std::mem::size_of::<SparseUploadConstants>(), 16);
    }
}
