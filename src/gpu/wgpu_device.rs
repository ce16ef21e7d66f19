//! [`SceneDevice`] on bevy's render device (wgpu).
//!
//! Buffers come from `RenderDevice`, so the scene buffer can be bound by any
//! render-world pipeline. Copies and scatter passes are recorded into one
//! command encoder per frame and submitted together; queue writes land
//! before them.

use bevy::{
    prelude::*,
    render::{
        render_resource::{Buffer, BufferDescriptor, BufferUsages},
        renderer::{RenderDevice, RenderQueue},
    },
};
use std::borrow::Cow;
use wgpu::util::DeviceExt;

use super::{
    BufferDesc, BufferRole, SceneDevice, SparseUploadDispatch, SPARSE_UPLOAD_ENTRY,
    SPARSE_UPLOAD_SHADER,
};

#[derive(Resource)]
pub struct WgpuSceneDevice {
    device: RenderDevice,
    queue: RenderQueue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    encoder: Option<wgpu::CommandEncoder>,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl WgpuSceneDevice {
    pub fn new(device: RenderDevice, queue: RenderQueue) -> Self {
        let raw = device.wgpu_device();
        let shader = raw.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("gpu_scene_sparse_upload"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(SPARSE_UPLOAD_SHADER)),
        });

        let bind_group_layout = raw.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("gpu_scene_sparse_upload_layout"),
            entries: &[
                // 0: upload buffer
                storage_entry(0, true),
                // 1: upload operations
                storage_entry(1, true),
                // 2: scene buffer
                storage_entry(2, false),
                // 3: constants
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = raw.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("gpu_scene_sparse_upload_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            ..Default::default()
        });

        let pipeline = raw.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("gpu_scene_sparse_upload_pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some(SPARSE_UPLOAD_ENTRY),
            compilation_options: Default::default(),
            cache: None,
        });

        info!("GPU scene sparse upload pipeline created");
        Self { device, queue, pipeline, bind_group_layout, encoder: None }
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device
                .wgpu_device()
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("gpu_scene_upload"),
                })
        })
    }
}

impl SceneDevice for WgpuSceneDevice {
    type Buffer = Buffer;

    fn create_buffer(&mut self, desc: &BufferDesc<'_>) -> Option<Buffer> {
        if desc.size > self.device.limits().max_buffer_size {
            return None;
        }
        let usage = match desc.role {
            BufferRole::Scene => {
                BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC
            }
            BufferRole::Upload | BufferRole::Operations => {
                BufferUsages::STORAGE | BufferUsages::COPY_DST
            }
        };
        Some(self.device.create_buffer(&BufferDescriptor {
            label: Some(desc.label),
            size: desc.size,
            usage,
            mapped_at_creation: false,
        }))
    }

    fn free_buffer(&mut self, buffer: Buffer) {
        buffer.destroy();
    }

    fn buffer_size(&self, buffer: &Buffer) -> u64 {
        buffer.size()
    }

    fn write_buffer(&mut self, buffer: &Buffer, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.queue.write_buffer(buffer, offset, data);
    }

    fn copy_buffer(&mut self, src: &Buffer, src_offset: u64, dst: &Buffer, dst_offset: u64, size: u64) {
        if size == 0 {
            return;
        }
        self.encoder()
            .copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size);
    }

    fn dispatch_sparse_upload(&mut self, dispatch: &SparseUploadDispatch<'_, Buffer>) {
        if dispatch.workgroups == 0 {
            return;
        }
        let raw = self.device.wgpu_device();
        let constants = raw.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("gpu_scene_sparse_upload_constants"),
            contents: bytemuck::bytes_of(&dispatch.constants),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = raw.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("gpu_scene_sparse_upload_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: dispatch.upload.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 1, resource: dispatch.operations.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 2, resource: dispatch.target.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: constants.as_entire_binding() },
            ],
        });

        let pipeline = self.pipeline.clone();
        let encoder = self.encoder();
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("gpu_scene_sparse_upload"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(dispatch.workgroups, 1, 1);
    }

    fn max_workgroups_per_dimension(&self) -> u32 {
        self.device.limits().max_compute_workgroups_per_dimension
    }

    fn submit(&mut self) {
        let commands = self.encoder.take().map(|e| e.finish());
        self.queue.submit(commands);
    }
}
