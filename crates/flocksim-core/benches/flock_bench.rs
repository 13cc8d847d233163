use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use flocksim_core::{FlockConfig, FlockWorld};
use glam::Vec2;
use std::time::Duration;

fn bench_world_steps(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_step");
    // Allow env overrides for longer, more stable local runs.
    let samples: usize = std::env::var("FLOCK_BENCH_SAMPLES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(30);
    let warm: u64 = std::env::var("FLOCK_BENCH_WARMUP_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(2);
    let measure: u64 = std::env::var("FLOCK_BENCH_MEASURE_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10);
    group.sample_size(samples);
    group.warm_up_time(Duration::from_secs(warm));
    group.measurement_time(Duration::from_secs(measure));
    let steps: usize = std::env::var("FLOCK_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64);
    let boid_counts: Vec<usize> = std::env::var("FLOCK_BENCH_BOIDS")
        .ok()
        .map(|s| {
            s.split(',')
                .filter_map(|t| t.trim().parse::<usize>().ok())
                .collect::<Vec<_>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec![500_usize, 2_000, 5_000]);

    for &boids in &boid_counts {
        group.bench_function(format!("steps{}_boids{}", steps, boids), |b| {
            b.iter_batched(
                || {
                    let config = FlockConfig {
                        world_width: 1_600.0,
                        world_height: 1_200.0,
                        rng_seed: Some(0xBEEF),
                        ..FlockConfig::default()
                    };
                    let mut world = FlockWorld::new(config).expect("world");
                    world.spawn_boids(boids, Vec2::new(800.0, 600.0), 500.0);
                    world.add_obstacle(Vec2::new(400.0, 300.0), Vec2::ONE, Vec2::new(60.0, 25.0));
                    world.add_obstacle(Vec2::new(1_200.0, 900.0), Vec2::X, Vec2::new(40.0, 40.0));
                    world
                },
                |mut world| {
                    for _ in 0..steps {
                        world.step(16.0, None);
                    }
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_world_steps);
criterion_main!(benches);
