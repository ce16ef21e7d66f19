use std::hint::black_box;

use bevy::ecs::component::ComponentId;
use bevy::prelude::*;
use bevy::tasks::TaskPool;
use bytemuck::{Pod, Zeroable};
use criterion::*;

use gpu_scene::lane::{LanePair, MutationLane};
use gpu_scene::prelude::*;

const ENTITIES: usize = 10_000;

#[repr(C)]
#[derive(Component, Clone, Copy, Pod, Zeroable)]
struct Position {
    xyz: [f32; 3],
}

fn setup(config: GpuSceneConfig) -> (World, HostDevice, GpuScene<HostBuffer>, ComponentId, Vec<Entity>) {
    let mut world = World::new();
    let mut device = HostDevice::new();
    let info = ComponentTypeInfo::of::<Position>(&mut world, 0, "Position");
    let id = info.component_id();
    let scene = GpuSceneBuilder::new(config)
        .with_component(info)
        .build(&mut device)
        .expect("scene setup failed in benchmark");
    let entities = (0..ENTITIES)
        .map(|i| world.spawn(Position { xyz: [i as f32; 3] }).id())
        .collect();
    (world, device, scene, id, entities)
}

fn lane_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("lane");

    group.bench_function("require_upload_4_threads", |b| {
        let (_world, _device, _scene, _id, entities) = setup(GpuSceneConfig::default());
        let pool = TaskPool::new();
        b.iter_batched(
            MutationLane::default,
            |lane| {
                pool.scope(|s| {
                    for chunk in entities.chunks(ENTITIES / 4) {
                        let lane = &lane;
                        s.spawn(async move {
                            for &e in chunk {
                                black_box(lane.require_upload(e, 0, 12));
                            }
                        });
                    }
                });
                lane
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("add_then_drain", |b| {
        let (_world, _device, _scene, _id, entities) = setup(GpuSceneConfig::default());
        let mut lanes = LanePair::default();
        b.iter(|| {
            for &e in &entities {
                lanes.front().add(e);
            }
            black_box(lanes.swap());
        });
    });

    group.finish();
}

fn upload_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("upload");
    group.throughput(Throughput::Elements(ENTITIES as u64));

    group.bench_function("execute_upload_10k_dirty", |b| {
        let config = GpuSceneConfig { initial_instances: ENTITIES as u32, ..default() };
        let (world, mut device, mut scene, id, entities) = setup(config);
        let pool = TaskPool::new();
        for &e in &entities {
            scene.add_entity(e);
        }
        scene.execute_upload(&world, &mut device, &pool);

        b.iter(|| {
            for &e in &entities {
                scene.require_upload(e, id);
            }
            black_box(scene.execute_upload(&world, &mut device, &pool));
        });
    });

    group.finish();
}

criterion_group!(benches, lane_benchmark, upload_benchmark);
criterion_main!(benches);
