//! Ray-tracing acceleration structure touchpoint.
//!
//! The scene keeps one [`AccelInstance`] per instance index and, after each
//! upload, hands an [`TlasUpdateRequest`] to whatever builds the structures.
//! Freed slots are zeroed in place so other indices never shift.

use bevy::prelude::*;
use bevy::render::extract_resource::ExtractResource;

/// Opaque bottom-level structure handle, owned by the acceleration manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlasHandle(pub u64);

/// Where an instance's acceleration record comes from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AccelSource {
    pub blas: Option<BlasHandle>,
    pub object_to_world: Mat4,
}

/// One top-level instance record.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AccelInstance {
    pub blas: Option<BlasHandle>,
    pub instance_id: u32,
    pub instance_mask: u8,
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
}

pub const INSTANCE_MASK_ALL: u8 = 0xFF;
/// Largest id a TLAS instance can carry: the custom index field is 24 bits.
pub const MAX_INSTANCE_CUSTOM_INDEX: u32 = 0x00FF_FFFF;

impl AccelInstance {
    /// Ids past [`MAX_INSTANCE_CUSTOM_INDEX`] would alias a lower instance in
    /// hit shaders, so such records are masked out.
    pub fn new(instance_id: u32, source: &AccelSource) -> Self {
        let representable = instance_id <= MAX_INSTANCE_CUSTOM_INDEX;
        if !representable {
            warn_once!(
                "instance {} exceeds the 24-bit TLAS custom index, excluded from ray tracing",
                instance_id
            );
        }
        Self {
            blas: source.blas,
            instance_id: instance_id & MAX_INSTANCE_CUSTOM_INDEX,
            instance_mask: if source.blas.is_some() && representable { INSTANCE_MASK_ALL } else { 0 },
            transform: row_major_3x4(&source.object_to_world),
        }
    }

    pub fn is_active(&self) -> bool {
        self.blas.is_some() && self.instance_mask != 0
    }
}

/// First three rows of `m`, row by row.
pub fn row_major_3x4(m: &Mat4) -> [f32; 12] {
    let t = m.transpose().to_cols_array();
    let mut out = [0.0; 12];
    out.copy_from_slice(&t[..12]);
    out
}

/// Top-level build input: a snapshot of the instance table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TlasDescriptor {
    pub instances: Vec<AccelInstance>,
    pub instance_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TlasUpdateRequest {
    pub blases_to_build: Vec<BlasHandle>,
    pub tlas: Option<TlasDescriptor>,
}

impl TlasUpdateRequest {
    pub fn is_empty(&self) -> bool {
        self.blases_to_build.is_empty() && self.tlas.is_none()
    }
}

/// Receives acceleration structure rebuild requests after each upload.
pub trait AccelerationStructureManager {
    fn request_update(&mut self, request: TlasUpdateRequest);
}

/// Default manager: keeps the latest request for the render world to pick up.
#[derive(Resource, Clone, Default, ExtractResource)]
pub struct TlasRequestQueue {
    pub pending: Option<TlasUpdateRequest>,
    pub requests: u64,
}

impl AccelerationStructureManager for TlasRequestQueue {
    fn request_update(&mut self, request: TlasUpdateRequest) {
        // Unconsumed BLAS builds carry over; the TLAS snapshot is replaced.
        let blases = match self.pending.take() {
            Some(mut previous) => {
                for blas in request.blases_to_build {
                    if !previous.blases_to_build.contains(&blas) {
                        previous.blases_to_build.push(blas);
                    }
                }
                previous.blases_to_build
            }
            None => request.blases_to_build,
        };
        self.pending = Some(TlasUpdateRequest { blases_to_build: blases, tlas: request.tlas });
        self.requests += 1;
    }
}

impl TlasRequestQueue {
    pub fn take(&mut self) -> Option<TlasUpdateRequest> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_is_row_major() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let t = row_major_3x4(&m);
        assert_eq!(t, [1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 3.0]);
    }

    #[test]
    fn instances_without_blas_are_masked_out() {
        let source = AccelSource { blas: None, object_to_world: Mat4::IDENTITY };
        let inst = AccelInstance::new(4, &source);
        assert_eq!(inst.instance_mask, 0);
        assert!(!inst.is_active());

        let source = AccelSource { blas: Some(BlasHandle(9)), ..source };
        let inst = AccelInstance::new(4, &source);
        assert_eq!(inst.instance_mask, 0xFF);
        assert_eq!(inst.instance_id, 4);
    }

    #[test]
    fn queue_merges_unconsumed_blases() {
        let mut queue = TlasRequestQueue::default();
        queue.request_update(TlasUpdateRequest { blases_to_build: vec![BlasHandle(1)], tlas: None });
        queue.request_update(TlasUpdateRequest {
            blases_to_build: vec![BlasHandle(1), BlasHandle(2)],
            tlas: Some(TlasDescriptor::default()),
        });
        let request = queue.take().unwrap();
        assert_eq!(request.blases_to_build, vec![BlasHandle(1), BlasHandle(2)]);
        assert!(request.tlas.is_some());
        assert_eq!(queue.requests, 2);
        assert!(queue.take().is_none());
    }

    #[test]
    fn ids_past_24_bits_are_masked_out() {
        let source = AccelSource { blas: Some(BlasHandle(1)), object_to_world: Mat4::IDENTITY };
        let last = AccelInstance::new(MAX_INSTANCE_CUSTOM_INDEX, &source);
        assert!(last.is_active());
        assert_eq!(last.instance_id, MAX_INSTANCE_CUSTOM_INDEX);

        let wrapped = AccelInstance::new(MAX_INSTANCE_CUSTOM_INDEX + 1, &source);
        assert!(!wrapped.is_active());
        assert_eq!(wrapped.instance_mask, 0);
        assert!(wrapped.instance_id <= MAX_INSTANCE_CUSTOM_INDEX);
    }
}
