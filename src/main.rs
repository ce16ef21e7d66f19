//! GPU scene demo - a field of drifting instances mirrored into the scene buffer.

use bevy::prelude::*;
use gpu_scene::prelude::*;
use rand::Rng;
use std::path::Path;

const CONFIG_PATH: &str = "gpu_scene.json";
const INSTANCE_COUNT: usize = 4096;
const RESPAWN_PER_FRAME: usize = 16;

#[derive(Component)]
struct Drift {
    velocity: Vec3,
}

fn main() {
    let config = GpuSceneConfig::load_or_default(Path::new(CONFIG_PATH));

    let mut app = App::new();
    app.add_plugins(DefaultPlugins.set(WindowPlugin {
        primary_window: Some(Window {
            title: "GPU Scene".into(),
            resolution: (1280, 720).into(),
            ..default()
        }),
        ..default()
    }))
    .add_plugins(GpuScenePlugin::new(config))
    .register_gpu_component::<InstanceColor>("InstanceColor")
    .register_gpu_transform::<ObjectToWorld>("ObjectToWorld")
    .add_systems(Startup, spawn_instances)
    .add_systems(Update, (drift, churn))
    .add_systems(Last, log_stats);

    app.run();
}

fn random_instance(rng: &mut impl Rng) -> (GpuSceneTracked, InstanceColor, ObjectToWorld, Drift) {
    let position = Vec3::new(
        rng.random_range(-50.0..50.0),
        rng.random_range(-50.0..50.0),
        rng.random_range(-50.0..50.0),
    );
    (
        GpuSceneTracked,
        InstanceColor::new(rng.random(), rng.random(), rng.random(), 1.0),
        ObjectToWorld::from_mat4(Mat4::from_translation(position)),
        Drift {
            velocity: Vec3::new(
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
                rng.random_range(-1.0..1.0),
            ),
        },
    )
}

fn spawn_instances(mut commands: Commands) {
    let mut rng = rand::rng();
    for _ in 0..INSTANCE_COUNT {
        commands.spawn(random_instance(&mut rng));
    }
    info!("Spawned {} GPU scene instances", INSTANCE_COUNT);
}

fn drift(time: Res<Time>, mut query: Query<(&Drift, &mut ObjectToWorld)>) {
    let dt = time.delta_secs();
    for (drift, mut transform) in &mut query {
        let moved = Mat4::from_translation(drift.velocity * dt) * transform.mat4();
        *transform = ObjectToWorld::from_mat4(moved);
    }
}

/// Despawn and respawn a few instances each frame to exercise slot reuse.
fn churn(mut commands: Commands, query: Query<Entity, With<Drift>>) {
    let mut rng = rand::rng();
    for entity in query.iter().take(RESPAWN_PER_FRAME) {
        commands.entity(entity).despawn();
        commands.spawn(random_instance(&mut rng));
    }
}

fn log_stats(stats: Res<GpuSceneStats>, mut frames: Local<u32>) {
    *frames += 1;
    if *frames % 300 != 0 {
        return;
    }
    info!(
        "GPU scene: {} ops, {} bytes uploaded, capacity {} B, used {} B, {} overflows total",
        stats.last.operations,
        stats.last.upload_bytes,
        stats.memory.capacity_bytes,
        stats.memory.used_bytes,
        stats.total_overflows
    );
}
