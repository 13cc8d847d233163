use flocksim_core::{BoidData, FlockConfig, FlockWorld, HitOrder, Tick};
use glam::Vec2;

fn seeded_config(seed: u64) -> FlockConfig {
    FlockConfig {
        rng_seed: Some(seed),
        ..FlockConfig::default()
    }
}

fn populated_world(seed: u64) -> FlockWorld {
    let mut world = FlockWorld::new(seeded_config(seed)).expect("world");
    world.spawn_boids(100, Vec2::new(400.0, 300.0), 200.0);
    world.add_obstacle(Vec2::new(250.0, 150.0), Vec2::ONE, Vec2::new(50.0, 20.0));
    world.add_obstacle(Vec2::new(550.0, 450.0), Vec2::Y, Vec2::new(30.0, 60.0));
    world.add_circle_obstacle(Vec2::new(400.0, 500.0), 35.0);
    world
}

#[test]
fn seeded_worlds_advance_deterministically() {
    let run = |seed: u64| {
        let mut world = populated_world(seed);
        for tick in 0..60 {
            let target = if tick % 2 == 0 {
                Some(Vec2::new(600.0, 100.0))
            } else {
                None
            };
            world.step(16.0, target);
        }
        (
            world.tick(),
            world.boids().columns().positions().to_vec(),
            world.boids().columns().velocities().to_vec(),
        )
    };

    let (tick_a, positions_a, velocities_a) = run(0xDEADBEEF);
    let (tick_b, positions_b, velocities_b) = run(0xDEADBEEF);
    assert_eq!(tick_a, Tick(60));
    assert_eq!(tick_a, tick_b);
    assert_eq!(
        positions_a, positions_b,
        "identical seeds should produce identical positions"
    );
    assert_eq!(
        velocities_a, velocities_b,
        "identical seeds should produce identical velocities"
    );

    let (_, positions_c, _) = run(0xF00DF00D);
    assert_ne!(positions_a, positions_c, "different seeds should diverge");
}

#[test]
fn speed_envelope_and_bounds_hold_over_a_long_run() {
    let mut world = populated_world(7);
    let min_speed = world.config().min_speed;
    let max_speed = world.config().max_speed;
    let width = world.config().world_width;
    let height = world.config().world_height;
    // One integration step can carry a clamped boid slightly past the edge
    // before the next tick clamps it again.
    let slack = max_speed * 0.016 + 1e-3;

    for _ in 0..100 {
        world.step(16.0, Some(Vec2::new(100.0, 100.0)));
        let columns = world.boids().columns();
        for (position, velocity) in columns.positions().iter().zip(columns.velocities()) {
            assert!(position.is_finite());
            assert!(velocity.is_finite());
            let speed = velocity.length();
            assert!(speed >= min_speed - 1e-3, "speed {speed} under envelope");
            assert!(speed <= max_speed + 1e-3, "speed {speed} over envelope");
            assert!(position.x >= -slack && position.x <= width + slack);
            assert!(position.y >= -slack && position.y <= height + slack);
        }
    }
}

#[test]
fn lone_boid_velocity_is_stable_in_an_empty_world() {
    let config = FlockConfig {
        jitter_strength: 0.0,
        boundary_margin: 0.0,
        rng_seed: Some(1),
        ..FlockConfig::default()
    };
    let mut world = FlockWorld::new(config).expect("world");
    let velocity = Vec2::new(6.0, 3.0);
    let id = world.boids_mut().insert(BoidData {
        position: Vec2::new(400.0, 300.0),
        direction: velocity.normalize(),
        velocity,
        previous_velocity: velocity,
    });

    for _ in 0..50 {
        world.step(16.0, None);
        let state = world.snapshot_boid(id).expect("snapshot");
        assert_eq!(
            state.data.velocity, velocity,
            "no neighbors, no target, no jitter: velocity must not drift"
        );
    }
}

#[test]
fn ray_probes_never_mutate_simulation_state() {
    let mut world = populated_world(11);
    world.step(16.0, None);
    let before = world.boids().columns().positions().to_vec();

    let closest = world.query_ray_all(Vec2::ZERO, Vec2::ONE, 2_000.0, HitOrder::ClosestFirst);
    for pair in closest.windows(2) {
        assert!(pair[0].distance <= pair[1].distance);
    }
    let farthest = world.query_ray_all(Vec2::ZERO, Vec2::ONE, 2_000.0, HitOrder::FarthestFirst);
    for pair in farthest.windows(2) {
        assert!(pair[0].distance >= pair[1].distance);
    }
    assert_eq!(closest.len(), farthest.len());
    assert!(
        world
            .query_ray(Vec2::ZERO, -Vec2::ONE, 2_000.0, HitOrder::ClosestFirst)
            .is_none()
    );

    assert_eq!(before, world.boids().columns().positions());
}
