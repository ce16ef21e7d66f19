//! System-memory emulation of [`SceneDevice`].
//!
//! Buffers are byte vectors in a slab. Writes, copies and scatter dispatches
//! are recorded and applied in order at `submit`, like a queue would. Freed
//! slots are tombstoned, so tests can tell whether a retired buffer is still
//! alive and reads of freed buffers fail loudly. Scatter only copies what the
//! launched invocations would reach, so an undersized dispatch drops data here
//! just as it does on the GPU.

use bevy::prelude::*;

use super::{
    BufferDesc, BufferRole, SceneDevice, SparseUploadConstants, SparseUploadDispatch, UploadOp,
    DEFAULT_MAX_WORKGROUPS_PER_DIMENSION, SPARSE_UPLOAD_WORKGROUP_SIZE,
};

/// Handle into a [`HostDevice`] slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostBuffer {
    id: u32,
}

impl HostBuffer {
    pub fn id(&self) -> u32 {
        self.id
    }
}

struct Slot {
    role: BufferRole,
    data: Option<Vec<u8>>,
}

enum Command {
    Write { buffer: u32, offset: u64, data: Vec<u8> },
    Copy { src: u32, src_offset: u64, dst: u32, dst_offset: u64, size: u64 },
    Scatter { upload: u32, operations: u32, target: u32, constants: SparseUploadConstants, workgroups: u32 },
}

/// One recorded scatter dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordedDispatch {
    pub constants: SparseUploadConstants,
    pub workgroups: u32,
}

#[derive(Resource, Default)]
pub struct HostDevice {
    slots: Vec<Slot>,
    pending: Vec<Command>,
    /// Refuse allocations larger than this, to exercise allocation failure.
    pub max_buffer_size: Option<u64>,
    /// Workgroup limit per dispatch. Defaults to wgpu's.
    pub max_workgroups: Option<u32>,
    pub submits: u32,
    pub dispatches: u32,
    pub dispatch_log: Vec<RecordedDispatch>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_buffer_size(mut self, max: u64) -> Self {
        self.max_buffer_size = Some(max);
        self
    }

    pub fn with_max_workgroups(mut self, max: u32) -> Self {
        self.max_workgroups = Some(max);
        self
    }

    pub fn is_live(&self, buffer: &HostBuffer) -> bool {
        self.slots
            .get(buffer.id as usize)
            .is_some_and(|slot| slot.data.is_some())
    }

    pub fn live_buffers(&self, role: BufferRole) -> usize {
        self.slots
            .iter()
            .filter(|s| s.role == role && s.data.is_some())
            .count()
    }

    /// Submitted contents of a live buffer.
    pub fn read(&self, buffer: &HostBuffer) -> Option<&[u8]> {
        self.slots
            .get(buffer.id as usize)
            .and_then(|s| s.data.as_deref())
    }

    fn bytes_mut(&mut self, id: u32) -> Option<&mut Vec<u8>> {
        self.slots.get_mut(id as usize).and_then(|s| s.data.as_mut())
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Write { buffer, offset, data } => {
                let Some(bytes) = self.bytes_mut(buffer) else {
                    error!("write to freed host buffer {}", buffer);
                    return;
                };
                let start = offset as usize;
                let Some(dst) = bytes.get_mut(start..start + data.len()) else {
                    error!("host buffer {} write out of bounds", buffer);
                    return;
                };
                dst.copy_from_slice(&data);
            }
            Command::Copy { src, src_offset, dst, dst_offset, size } => {
                let Some(source) = self.read(&HostBuffer { id: src }) else {
                    error!("copy from freed host buffer {}", src);
                    return;
                };
                let (s, n) = (src_offset as usize, size as usize);
                let Some(chunk) = source.get(s..s + n).map(<[u8]>::to_vec) else {
                    error!("host buffer {} copy source out of bounds", src);
                    return;
                };
                let Some(target) = self.bytes_mut(dst) else {
                    error!("copy into freed host buffer {}", dst);
                    return;
                };
                let d = dst_offset as usize;
                match target.get_mut(d..d + n) {
                    Some(out) => out.copy_from_slice(&chunk),
                    None => error!("host buffer {} copy target out of bounds", dst),
                }
            }
            Command::Scatter { upload, operations, target, constants, workgroups } => {
                let (Some(upload), Some(ops)) = (
                    self.read(&HostBuffer { id: upload }).map(<[u8]>::to_vec),
                    self.read(&HostBuffer { id: operations }).map(<[u8]>::to_vec),
                ) else {
                    error!("scatter reads a freed host buffer");
                    return;
                };
                let Some(target) = self.bytes_mut(target) else {
                    error!("scatter into freed host buffer {}", target);
                    return;
                };
                let threads_per_op = constants.max_threads_per_op.max(1) as u64;
                let invocations = workgroups as u64 * SPARSE_UPLOAD_WORKGROUP_SIZE as u64;
                let op_size = std::mem::size_of::<UploadOp>();
                for i in 0..constants.num_operations as u64 {
                    // Lanes of this op that were actually launched.
                    let lanes = invocations.saturating_sub(i * threads_per_op).min(threads_per_op);
                    if lanes == 0 {
                        break;
                    }
                    let at = (constants.first_operation as u64 + i) as usize * op_size;
                    let Some(raw) = ops.get(at..at + op_size) else { break };
                    let op: UploadOp = bytemuck::pod_read_unaligned(raw);
                    let (s, d) = (op.src_offset as usize, op.dst_offset as usize);
                    for word in 0..op.data_size as usize / 4 {
                        if (word as u64 % threads_per_op) >= lanes {
                            continue;
                        }
                        let (from, to) = (s + word * 4, d + word * 4);
                        // Out-of-range words are skipped, as robust buffer access would.
                        if let (Some(src), Some(dst)) = (upload.get(from..from + 4), target.get_mut(to..to + 4)) {
                            dst.copy_from_slice(src);
                        }
                    }
                }
            }
        }
    }
}

impl SceneDevice for HostDevice {
    type Buffer = HostBuffer;

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Option<HostBuffer> {
        if self.max_buffer_size.is_some_and(|max| desc.size > max) {
            return None;
        }
        let id = self.slots.len() as u32;
        self.slots.push(Slot {
            role: desc.role,
            data: Some(vec![0; desc.size as usize]),
        });
        Some(HostBuffer { id })
    }

    fn free_buffer(&mut self, buffer: HostBuffer) {
        match self.slots.get_mut(buffer.id as usize) {
            Some(slot) if slot.data.is_some() => slot.data = None,
            _ => error!("double free of host buffer {}", buffer.id),
        }
    }

    fn buffer_size(&self, buffer: &HostBuffer) -> u64 {
        self.read(buffer).map_or(0, |b| b.len() as u64)
    }

    fn write_buffer(&mut self, buffer: &HostBuffer, offset: u64, data: &[u8]) {
        self.pending.push(Command::Write { buffer: buffer.id, offset, data: data.to_vec() });
    }

    fn copy_buffer(
        &mut self,
        src: &HostBuffer,
        src_offset: u64,
        dst: &HostBuffer,
        dst_offset: u64,
        size: u64,
    ) {
        self.pending.push(Command::Copy {
            src: src.id,
            src_offset,
            dst: dst.id,
            dst_offset,
            size,
        });
    }

    fn dispatch_sparse_upload(&mut self, dispatch: &SparseUploadDispatch<'_, HostBuffer>) {
        self.dispatches += 1;
        self.dispatch_log.push(RecordedDispatch {
            constants: dispatch.constants,
            workgroups: dispatch.workgroups,
        });
        if dispatch.workgroups > self.max_workgroups_per_dimension() {
            error!(
                "scatter dispatch of {} workgroups exceeds the limit of {}",
                dispatch.workgroups,
                self.max_workgroups_per_dimension()
            );
            return;
        }
        self.pending.push(Command::Scatter {
            upload: dispatch.upload.id,
            operations: dispatch.operations.id,
            target: dispatch.target.id,
            constants: dispatch.constants,
            workgroups: dispatch.workgroups,
        });
    }

    fn max_workgroups_per_dimension(&self) -> u32 {
        self.max_workgroups.unwrap_or(DEFAULT_MAX_WORKGROUPS_PER_DIMENSION)
    }

    fn submit(&mut self) {
        // Queue writes land before recorded commands, as on a real queue.
        let (writes, commands): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|c| matches!(c, Command::Write { .. }));
        for command in writes.into_iter().chain(commands) {
            self.apply(command);
        }
        self.submits += 1;
    }
}
