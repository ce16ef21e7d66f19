//! Bevy integration for the GPU scene.
//!
//! Data flow:
//! - Main world: `Added<GpuSceneTracked>` calls add_entity, removals call remove_entity
//! - Main world: `Changed<T>` on every registered component calls require_upload
//! - Main world: upload_gpu_scene (exclusive, PostUpdate) runs execute_upload on the compute pool
//! - Extract: GpuSceneBuffer and TlasRequestQueue copied to render world

use bevy::{
    ecs::component::Components,
    prelude::*,
    render::{
        extract_resource::{ExtractResource, ExtractResourcePlugin},
        render_resource::Buffer,
        renderer::{RenderDevice, RenderQueue},
    },
    tasks::{ComputeTaskPool, TaskPool},
};
use bytemuck::Pod;

use crate::accel::{AccelerationStructureManager, TlasRequestQueue};
use crate::components::GpuSceneTracked;
use crate::error::GpuSceneError;
use crate::gpu::{HostBuffer, HostDevice, SceneDevice, WgpuSceneDevice};
use crate::registry::ComponentTypeInfo;
use crate::scene::{GpuScene, GpuSceneBuilder, MemoryUsage};
use crate::settings::GpuSceneConfig;
use crate::upload::UploadReport;

/// The scene as the render backend stores it.
pub type RenderGpuScene = GpuScene<Buffer>;

// =============================================================================
// RESOURCES (Main World)
// =============================================================================

#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub enum GpuSceneSystems {
    /// Change tracking into the front lane.
    Record,
    /// Lane drain and GPU upload.
    Upload,
}

/// Which device the scene uploads through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SceneBackend {
    /// bevy's render device.
    #[default]
    Render,
    /// System memory, for headless tools and tests.
    Host,
}

/// Registrations collected until the plugin finishes.
#[derive(Resource)]
struct PendingGpuScene {
    config: GpuSceneConfig,
    components: Vec<ComponentTypeInfo>,
    transform_slot: Option<u32>,
    backend: SceneBackend,
}

impl PendingGpuScene {
    /// Lowest slot not taken and not pinned to another name by the config.
    fn free_slot(&self) -> u32 {
        (0..)
            .find(|slot| {
                !self.components.iter().any(|c| c.soa_index() == *slot)
                    && !self.config.components.iter().any(|c| c.soa_index == *slot)
            })
            .unwrap_or(u32::MAX)
    }
}

/// Scene buffer handle for render-world consumers.
#[derive(Resource, Clone, Default)]
pub struct GpuSceneBuffer {
    pub buffer: Option<Buffer>,
    pub instance_count: u32,
    pub instance_capacity: u32,
    pub size_bytes: u64,
}

impl ExtractResource for GpuSceneBuffer {
    type Source = GpuSceneBuffer;

    fn extract_resource(source: &Self::Source) -> Self {
        source.clone()
    }
}

/// Outcome of the most recent upload.
#[derive(Resource, Default, Debug)]
pub struct GpuSceneStats {
    pub last: UploadReport,
    pub memory: MemoryUsage,
    pub total_overflows: u64,
}

// =============================================================================
// PLUGIN
// =============================================================================

#[derive(Default)]
pub struct GpuScenePlugin {
    pub config: GpuSceneConfig,
    pub backend: SceneBackend,
}

impl GpuScenePlugin {
    pub fn new(config: GpuSceneConfig) -> Self {
        Self { config, backend: SceneBackend::Render }
    }

    pub fn headless(config: GpuSceneConfig) -> Self {
        Self { config, backend: SceneBackend::Host }
    }
}

impl Plugin for GpuScenePlugin {
    fn build(&self, app: &mut App) {
        app.insert_resource(self.config.clone())
            .insert_resource(PendingGpuScene {
                config: self.config.clone(),
                components: Vec::new(),
                transform_slot: None,
                backend: self.backend,
            })
            .init_resource::<TlasRequestQueue>()
            .init_resource::<GpuSceneStats>()
            .configure_sets(PostUpdate, (GpuSceneSystems::Record, GpuSceneSystems::Upload).chain());

        match self.backend {
            SceneBackend::Render => {
                app.init_resource::<GpuSceneBuffer>()
                    .add_systems(
                        PostUpdate,
                        (upload_gpu_scene::<WgpuSceneDevice>, publish_scene_buffer)
                            .chain()
                            .in_set(GpuSceneSystems::Upload),
                    )
                    .add_plugins((
                        ExtractResourcePlugin::<GpuSceneBuffer>::default(),
                        ExtractResourcePlugin::<TlasRequestQueue>::default(),
                    ));
                add_tracking_systems::<Buffer>(app);
            }
            SceneBackend::Host => {
                app.add_systems(PostUpdate, upload_gpu_scene::<HostDevice>.in_set(GpuSceneSystems::Upload));
                add_tracking_systems::<HostBuffer>(app);
            }
        }
    }

    fn finish(&self, app: &mut App) {
        let world = app.world_mut();
        let Some(pending) = world.remove_resource::<PendingGpuScene>() else { return };

        let mut builder = GpuSceneBuilder::new(pending.config);
        for info in pending.components {
            builder = builder.with_component(info);
        }
        if let Some(slot) = pending.transform_slot {
            builder = builder.with_transform_slot(slot);
        }

        match pending.backend {
            SceneBackend::Render => {
                let (Some(device), Some(queue)) = (
                    world.get_resource::<RenderDevice>().cloned(),
                    world.get_resource::<RenderQueue>().cloned(),
                ) else {
                    error!("{}", GpuSceneError::MissingDevice);
                    return;
                };
                let mut device = WgpuSceneDevice::new(device, queue);
                install_scene(world, builder, &mut device);
                world.insert_resource(device);
            }
            SceneBackend::Host => {
                let mut device = HostDevice::new();
                install_scene(world, builder, &mut device);
                world.insert_resource(device);
            }
        }
    }
}

fn install_scene<D: SceneDevice>(world: &mut World, builder: GpuSceneBuilder, device: &mut D) {
    match builder.build(device) {
        Ok(scene) => {
            world.insert_resource(scene);
            info!("GPU scene plugin initialized");
        }
        Err(e) => error!("GPU scene initialization failed: {}", e),
    }
}

fn add_tracking_systems<B: Clone + Send + Sync + 'static>(app: &mut App) {
    app.add_systems(
        PostUpdate,
        (track_added::<B>, track_removed::<B>).in_set(GpuSceneSystems::Record),
    );
}

/// Component registration on [`App`].
pub trait GpuSceneAppExt {
    /// Mirror `T` into the scene buffer. The slot comes from the config by name, else the lowest free one.
    fn register_gpu_component<T: Component + Pod>(&mut self, name: &str) -> &mut Self;

    /// Like `register_gpu_component`, and `T`'s uploads also refresh acceleration transforms.
    fn register_gpu_transform<T: Component + Pod>(&mut self, name: &str) -> &mut Self;
}

impl GpuSceneAppExt for App {
    fn register_gpu_component<T: Component + Pod>(&mut self, name: &str) -> &mut Self {
        register_component::<T>(self, name, false);
        self
    }

    fn register_gpu_transform<T: Component + Pod>(&mut self, name: &str) -> &mut Self {
        register_component::<T>(self, name, true);
        self
    }
}

fn register_component<T: Component + Pod>(app: &mut App, name: &str, transform: bool) {
    let world = app.world_mut();
    let Some(mut pending) = world.remove_resource::<PendingGpuScene>() else {
        warn!("GPU component `{}` registered without GpuScenePlugin or after startup", name);
        return;
    };

    let slot = pending.config.slot_for(name).unwrap_or_else(|| pending.free_slot());
    let info = ComponentTypeInfo::of::<T>(world, slot, name);
    if transform {
        pending.transform_slot = Some(slot);
    }
    pending.components.push(info);
    let backend = pending.backend;
    world.insert_resource(pending);

    match backend {
        SceneBackend::Render => app.add_systems(
            PostUpdate,
            mark_changed::<T, Buffer>.in_set(GpuSceneSystems::Record),
        ),
        SceneBackend::Host => app.add_systems(
            PostUpdate,
            mark_changed::<T, HostBuffer>.in_set(GpuSceneSystems::Record),
        ),
    };
}

// =============================================================================
// SYSTEMS
// =============================================================================

fn track_added<B: Clone + Send + Sync + 'static>(
    scene: Option<Res<GpuScene<B>>>,
    added: Query<Entity, Added<GpuSceneTracked>>,
) {
    let Some(scene) = scene else { return };
    for entity in &added {
        scene.add_entity(entity);
    }
}

fn track_removed<B: Clone + Send + Sync + 'static>(
    scene: Option<Res<GpuScene<B>>>,
    mut removed: RemovedComponents<GpuSceneTracked>,
) {
    let Some(scene) = scene else {
        removed.clear();
        return;
    };
    for entity in removed.read() {
        scene.remove_entity(entity);
    }
}

fn mark_changed<T: Component, B: Clone + Send + Sync + 'static>(
    scene: Option<Res<GpuScene<B>>>,
    components: &Components,
    changed: Query<Entity, (Changed<T>, With<GpuSceneTracked>)>,
) {
    let Some(scene) = scene else { return };
    let Some(id) = components.component_id::<T>() else { return };
    for entity in &changed {
        scene.require_upload(entity, id);
    }
}

fn upload_gpu_scene<D: SceneDevice + Resource>(world: &mut World) {
    if !world.contains_resource::<D>() || !world.contains_resource::<GpuScene<D::Buffer>>() {
        return;
    }
    let pool = ComputeTaskPool::get_or_init(TaskPool::default);

    let (report, memory) = world.resource_scope(|world, mut device: Mut<D>| {
        world.resource_scope(|world, mut scene: Mut<GpuScene<D::Buffer>>| {
            let report = scene.execute_upload(&*world, &mut *device, pool);
            (report, scene.memory_usage())
        })
    });

    let mut report = report;
    if let Some(request) = report.tlas_request.take() {
        world.resource_mut::<TlasRequestQueue>().request_update(request);
    }
    let mut stats = world.resource_mut::<GpuSceneStats>();
    stats.total_overflows += report.overflows.len() as u64;
    stats.memory = memory;
    stats.last = report;
}

fn publish_scene_buffer(scene: Option<Res<RenderGpuScene>>, mut published: ResMut<GpuSceneBuffer>) {
    let Some(scene) = scene else { return };
    published.buffer = Some(scene.scene_buffer().clone());
    published.instance_count = scene.instance_count();
    published.instance_capacity = scene.instance_capacity();
    published.size_bytes = scene.layout().size_bytes();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::{InstanceColor, ObjectToWorld};
    use crate::settings::ComponentSlotConfig;

    fn headless_app(config: GpuSceneConfig) -> App {
        let mut app = App::new();
        app.add_plugins(GpuScenePlugin::headless(config));
        app.register_gpu_component::<InstanceColor>("InstanceColor")
            .register_gpu_transform::<ObjectToWorld>("ObjectToWorld");
        app.finish();
        app.cleanup();
        app
    }

    fn read_color(app: &App, entity: Entity) -> [f32; 4] {
        let world = app.world();
        let scene = world.resource::<GpuScene<HostBuffer>>();
        let device = world.resource::<HostDevice>();
        let slot = scene
            .component_soa_index(world.component_id::<InstanceColor>().unwrap())
            .unwrap();
        let index = scene.instance_index(entity).unwrap();
        let offset = scene.component_offset(slot, index).unwrap() as usize;
        let bytes = &device.read(scene.scene_buffer()).unwrap()[offset..offset + 16];
        bytemuck::pod_read_unaligned(bytes)
    }

    #[test]
    fn tracked_entities_are_mirrored() {
        let mut app = headless_app(GpuSceneConfig::default());
        let e = app
            .world_mut()
            .spawn((GpuSceneTracked, InstanceColor::new(0.5, 0.25, 1.0, 1.0)))
            .id();
        app.update();

        let scene = app.world().resource::<GpuScene<HostBuffer>>();
        assert_eq!(scene.instance_count(), 1);
        assert_eq!(read_color(&app, e), [0.5, 0.25, 1.0, 1.0]);

        app.world_mut().get_mut::<InstanceColor>(e).unwrap().rgba[0] = 0.75;
        app.update();
        assert_eq!(read_color(&app, e), [0.75, 0.25, 1.0, 1.0]);

        app.world_mut().despawn(e);
        app.update();
        let scene = app.world().resource::<GpuScene<HostBuffer>>();
        assert_eq!(scene.instance_count(), 0);
        assert_eq!(scene.instance_index(e), None);
    }

    #[test]
    fn config_pins_slots_by_name() {
        let mut config = GpuSceneConfig::default();
        config.components.push(ComponentSlotConfig { name: "ObjectToWorld".into(), soa_index: 0 });
        let app = headless_app(config);

        let world = app.world();
        let scene = world.resource::<GpuScene<HostBuffer>>();
        let transform = world.component_id::<ObjectToWorld>().unwrap();
        let color = world.component_id::<InstanceColor>().unwrap();
        assert_eq!(scene.component_soa_index(transform), Some(0));
        assert_eq!(scene.component_soa_index(color), Some(1));
        assert_eq!(scene.component_type(0), Some(transform));
    }

    #[test]
    fn missing_render_device_leaves_scene_uninitialized() {
        let mut app = App::new();
        app.add_plugins(GpuScenePlugin::new(GpuSceneConfig::default()));
        app.register_gpu_component::<InstanceColor>("InstanceColor");
        app.finish();
        app.cleanup();

        app.world_mut().spawn((GpuSceneTracked, InstanceColor::default()));
        app.update();
        assert!(!app.world().contains_resource::<RenderGpuScene>());
        assert!(app.world().resource::<GpuSceneBuffer>().buffer.is_none());
    }

    #[test]
    fn invalid_config_is_logged_not_fatal() {
        let mut config = GpuSceneConfig::default();
        config.resize_growth_factor = 0.5;
        let mut app = headless_app(config);
        app.world_mut().spawn(GpuSceneTracked);
        app.update();
        assert!(!app.world().contains_resource::<GpuScene<HostBuffer>>());
    }
}
