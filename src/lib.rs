//! GPU Scene - mirrors ECS component data into a GPU structure-of-arrays buffer.
//!
//! Producers record mutations into a mutex-guarded front lane. Once per frame
//! the upload thread swaps lanes, allocates instance indices and grows the SoA
//! buffer when needed. Scan tasks then pack dirty components into an upload
//! buffer through lock-free atomic reservations, and a compute pass scatters
//! them into place.

// ============================================================================
// MODULES
// ============================================================================

pub mod accel;
pub mod components;
pub mod error;
pub mod gpu;
pub mod instance;
pub mod lane;
pub mod plugin;
pub mod registry;
pub mod scene;
pub mod settings;
pub mod soa;
pub mod upload;
pub mod world;

pub mod prelude {
    pub use crate::accel::{
        AccelInstance, AccelerationStructureManager, BlasHandle, TlasDescriptor, TlasRequestQueue,
        TlasUpdateRequest,
    };
    pub use crate::components::{
        GpuSceneTracked, InstanceColor, ObjectToWorld, RayTracingMesh,
    };
    pub use crate::error::GpuSceneError;
    pub use crate::gpu::{HostBuffer, HostDevice, SceneDevice, WgpuSceneDevice};
    pub use crate::plugin::{
        GpuSceneAppExt, GpuSceneBuffer, GpuScenePlugin, GpuSceneStats, GpuSceneSystems,
        RenderGpuScene, SceneBackend,
    };
    pub use crate::registry::ComponentTypeInfo;
    pub use crate::scene::{GpuScene, GpuSceneBuilder, MemoryUsage, UploadPhase};
    pub use crate::settings::{ComponentSlotConfig, GpuSceneConfig};
    pub use crate::upload::UploadReport;
    pub use crate::world::SceneWorld;
}
