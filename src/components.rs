//! ECS Components - mirrored into the GPU scene

use bevy::prelude::*;
use bytemuck::{Pod, Zeroable};

use crate::accel::BlasHandle;

// ============================================================================
// TRACKING
// ============================================================================

/// Entities carrying this marker get a GPU instance.
/// Adding it calls `add_entity`; removing it (or despawning) calls `remove_entity`.
#[derive(Component, Clone, Copy, Default, Debug)]
pub struct GpuSceneTracked;

/// Bottom-level acceleration structure the instance renders with.
#[derive(Component, Clone, Copy, Debug)]
pub struct RayTracingMesh {
    pub blas: BlasHandle,
}

// ============================================================================
// MIRRORED DATA
// ============================================================================

/// Object-to-world matrix, column-major like `Mat4`.
#[repr(C)]
#[derive(Component, Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ObjectToWorld {
    pub matrix: [f32; 16],
}

impl ObjectToWorld {
    pub fn from_mat4(m: Mat4) -> Self {
        Self { matrix: m.to_cols_array() }
    }

    pub fn mat4(&self) -> Mat4 {
        Mat4::from_cols_array(&self.matrix)
    }
}

impl Default for ObjectToWorld {
    fn default() -> Self {
        Self::from_mat4(Mat4::IDENTITY)
    }
}

/// Linear RGBA tint.
#[repr(C)]
#[derive(Component, Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct InstanceColor {
    pub rgba: [f32; 4],
}

impl InstanceColor {
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { rgba: [r, g, b, a] }
    }
}

impl Default for InstanceColor {
    fn default() -> Self {
        Self::new(1.0, 1.0, 1.0, 1.0)
    }
}
