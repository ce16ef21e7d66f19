//! Read access to component data for the upload scan.

use bevy::ecs::component::ComponentId;
use bevy::prelude::*;

use crate::accel::AccelSource;
use crate::components::{ObjectToWorld, RayTracingMesh};

/// What the upload pipeline reads from the ECS. Shared across scan tasks.
pub trait SceneWorld: Sync {
    /// Raw bytes of `component` on `entity`, or `None` when absent.
    ///
    /// # Safety
    ///
    /// `component` must be a type with no padding or other uninitialized
    /// bytes. Every component in a [`ComponentRegistry`](crate::registry::ComponentRegistry)
    /// satisfies this.
    unsafe fn component_bytes(&self, entity: Entity, component: ComponentId) -> Option<&[u8]>;

    /// Acceleration record input for `entity`.
    fn acceleration_source(&self, _entity: Entity) -> Option<AccelSource> {
        None
    }
}

impl SceneWorld for World {
    unsafe fn component_bytes(&self, entity: Entity, component: ComponentId) -> Option<&[u8]> {
        let size = self.components().get_info(component)?.layout().size();
        let ptr = self.get_entity(entity).ok()?.get_by_id(component).ok()?;
        // SAFETY: the pointer addresses a live value of this component, which is
        // `size` bytes, all initialized per the caller's contract.
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr().cast_const(), size) })
    }

    fn acceleration_source(&self, entity: Entity) -> Option<AccelSource> {
        let entity = self.get_entity(entity).ok()?;
        Some(AccelSource {
            blas: entity.get::<RayTracingMesh>().map(|m| m.blas),
            object_to_world: entity.get::<ObjectToWorld>().map_or(Mat4::IDENTITY, ObjectToWorld::mat4),
        })
    }
}
