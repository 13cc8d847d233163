//! Flocking simulation core.
//!
//! A tick runs four strictly ordered phases over the boid population:
//!
//! 1. **Grid rehash**: migrate each boid to the cell its position hashes to
//!    and rebuild per-cell aggregates. Single writer, no concurrent readers.
//! 2. **Flocking forces**: for every boid, gather candidates from the
//!    surrounding 3×3 cell window and integrate separation, cohesion,
//!    alignment, optional target-seeking and jitter into its velocity.
//!    Embarrassingly parallel: each worker reads the frozen grid plus
//!    snapshots of `position`/`previous_velocity` and writes only its own
//!    velocity. An obstacle-avoidance pass with the same guarantees follows.
//! 3. **Boundary constraint**: soft turn-back margin, hard clamp with a
//!    velocity redirect, and the `[min_speed, max_speed]` envelope; freezes
//!    `previous_velocity` for the next tick.
//! 4. **Motion integration**: position from velocity, heading from the new
//!    velocity.
//!
//! Ray queries against the oriented obstacles are pure and read-only; they
//! serve both the avoidance pass and external line-of-sight probes. The core
//! performs no I/O and never renders.

use std::f32::consts::TAU;

use glam::Vec2;
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use thiserror::Error;
use tracing::{debug, trace};

pub use flocksim_index::{CellAggregate, CellId, GridConfig, IndexError, SpatialGrid};

new_key_type! {
    /// Stable handle for boids backed by a generational slot map.
    pub struct BoidId;
}

new_key_type! {
    /// Stable handle for obstacles.
    pub struct ObstacleId;
}

/// Monotonic tick counter.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Advances to the next tick value.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Counters emitted after processing one simulation tick.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickEvents {
    /// Tick the world advanced to.
    pub tick: Tick,
    /// Boids that migrated to a different grid cell during rehash.
    pub cells_changed: usize,
    /// Boids whose forward ray struck an obstacle this tick.
    pub avoidance_hits: usize,
}

/// Scalar fields for a single boid used when inserting or snapshotting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoidData {
    /// World-space position; the source of truth for cell membership.
    pub position: Vec2,
    /// Unit heading. Keeps its last value while velocity is zero.
    pub direction: Vec2,
    /// Current velocity.
    pub velocity: Vec2,
    /// Velocity frozen at the end of the previous tick; the alignment
    /// reference, so force computation is independent of iteration order.
    pub previous_velocity: Vec2,
}

impl Default for BoidData {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            direction: Vec2::X,
            velocity: Vec2::ZERO,
            previous_velocity: Vec2::ZERO,
        }
    }
}

/// Collection of per-boid columns for hot-path iteration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct BoidColumns {
    positions: Vec<Vec2>,
    directions: Vec<Vec2>,
    velocities: Vec<Vec2>,
    previous_velocities: Vec<Vec2>,
    cells: Vec<Option<CellId>>,
}

impl BoidColumns {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection with reserved capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            directions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            previous_velocities: Vec::with_capacity(capacity),
            cells: Vec::with_capacity(capacity),
        }
    }

    /// Number of active rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true if there are no active rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve additional capacity in each backing vector.
    pub fn reserve(&mut self, additional: usize) {
        self.positions.reserve(additional);
        self.directions.reserve(additional);
        self.velocities.reserve(additional);
        self.previous_velocities.reserve(additional);
        self.cells.reserve(additional);
    }

    /// Remove all rows while retaining capacity.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.directions.clear();
        self.velocities.clear();
        self.previous_velocities.clear();
        self.cells.clear();
    }

    /// Push a new row onto each column. The cell column starts unassigned.
    pub fn push(&mut self, boid: BoidData) {
        self.positions.push(boid.position);
        self.directions.push(boid.direction);
        self.velocities.push(boid.velocity);
        self.previous_velocities.push(boid.previous_velocity);
        self.cells.push(None);
        self.debug_assert_coherent();
    }

    /// Swap-remove the row at `index` and return its scalar fields.
    pub fn swap_remove(&mut self, index: usize) -> BoidData {
        let removed = BoidData {
            position: self.positions.swap_remove(index),
            direction: self.directions.swap_remove(index),
            velocity: self.velocities.swap_remove(index),
            previous_velocity: self.previous_velocities.swap_remove(index),
        };
        self.cells.swap_remove(index);
        self.debug_assert_coherent();
        removed
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> BoidData {
        BoidData {
            position: self.positions[index],
            direction: self.directions[index],
            velocity: self.velocities[index],
            previous_velocity: self.previous_velocities[index],
        }
    }

    /// Immutable access to the positions slice.
    #[must_use]
    pub fn positions(&self) -> &[Vec2] {
        &self.positions
    }

    /// Mutable access to the positions slice.
    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Vec2] {
        &mut self.positions
    }

    /// Immutable access to the unit headings.
    #[must_use]
    pub fn directions(&self) -> &[Vec2] {
        &self.directions
    }

    /// Mutable access to the unit headings.
    #[must_use]
    pub fn directions_mut(&mut self) -> &mut [Vec2] {
        &mut self.directions
    }

    /// Immutable access to the velocities slice.
    #[must_use]
    pub fn velocities(&self) -> &[Vec2] {
        &self.velocities
    }

    /// Mutable access to the velocities slice.
    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Vec2] {
        &mut self.velocities
    }

    /// Immutable access to the previous-tick velocities.
    #[must_use]
    pub fn previous_velocities(&self) -> &[Vec2] {
        &self.previous_velocities
    }

    /// Mutable access to the previous-tick velocities.
    #[must_use]
    pub fn previous_velocities_mut(&mut self) -> &mut [Vec2] {
        &mut self.previous_velocities
    }

    /// Immutable access to the grid cell assignments.
    #[must_use]
    pub fn cells(&self) -> &[Option<CellId>] {
        &self.cells
    }

    /// Mutable access to the grid cell assignments.
    #[must_use]
    pub fn cells_mut(&mut self) -> &mut [Option<CellId>] {
        &mut self.cells
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.directions.len());
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.previous_velocities.len());
        debug_assert_eq!(self.positions.len(), self.cells.len());
    }
}

/// Dense SoA storage with generational handles for boid access.
#[derive(Debug, Default)]
pub struct BoidArena {
    slots: SlotMap<BoidId, usize>,
    handles: Vec<BoidId>,
    columns: BoidColumns,
}

impl BoidArena {
    /// Create an empty arena.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            columns: BoidColumns::new(),
        }
    }

    /// Number of active boids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when no boids are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Reserve space for additional boids.
    pub fn reserve(&mut self, additional: usize) {
        self.slots.reserve(additional);
        self.handles.reserve(additional);
        self.columns.reserve(additional);
    }

    /// Iterate over active boid handles in dense iteration order.
    pub fn iter_handles(&self) -> impl Iterator<Item = BoidId> + '_ {
        self.handles.iter().copied()
    }

    /// Borrow the underlying column storage.
    #[must_use]
    pub fn columns(&self) -> &BoidColumns {
        &self.columns
    }

    /// Mutably borrow the underlying column storage.
    #[must_use]
    pub fn columns_mut(&mut self) -> &mut BoidColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: BoidId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    /// Returns true if `id` refers to a live boid.
    #[must_use]
    pub fn contains(&self, id: BoidId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new boid and return its handle.
    pub fn insert(&mut self, boid: BoidData) -> BoidId {
        let index = self.columns.len();
        self.columns.push(boid);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id` returning its scalar data if it was present.
    pub fn remove(&mut self, id: BoidId) -> Option<BoidData> {
        let index = self.slots.remove(id)?;
        let removed = self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Produce a copy of the scalar data for `id`.
    #[must_use]
    pub fn snapshot(&self, id: BoidId) -> Option<BoidData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }

    /// Clear all stored boids.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.columns.clear();
    }
}

/// Combined snapshot of one boid's columns and its grid cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoidState {
    pub id: BoidId,
    pub data: BoidData,
    pub cell: Option<CellId>,
}

/// Errors that can occur when constructing a flock world.
#[derive(Debug, Error)]
pub enum FlockWorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Spatial grid rejected its derived configuration.
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// How velocity is redirected when a boid crosses the hard world edge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BoundaryMode {
    /// Preserve speed, point the full velocity at the world center.
    #[default]
    RedirectTowardCenter,
    /// Flip the offending velocity component back inside.
    Reflect,
}

/// How separation contributions are accumulated per neighbor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SeparationScheme {
    /// Push away from the centroid of neighbors inside the separation radius.
    #[default]
    CentroidThreshold,
    /// Per-neighbor inverse-distance push, clamped per neighbor.
    InverseDistance,
}

/// Per-neighbor strength ceiling for [`SeparationScheme::InverseDistance`].
const INVERSE_SEPARATION_CLAMP: f32 = 30.0;

/// Static configuration for a flock world. All parameters are fixed at
/// construction; changing world extents means constructing a new world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlockConfig {
    /// World extent along x, in world units.
    pub world_width: f32,
    /// World extent along y, in world units.
    pub world_height: f32,
    /// Edge length of one spatial hash cell.
    pub cell_size: f32,
    /// Neighbors closer than this repel.
    pub separation_radius: f32,
    /// Neighbors closer than this attract and contribute to alignment.
    pub cohesion_radius: f32,
    /// Weight of the separation force.
    pub separation_weight: f32,
    /// Weight of the cohesion force.
    pub cohesion_weight: f32,
    /// Weight of the alignment force.
    pub alignment_weight: f32,
    /// Weight of the optional target-seeking force.
    pub target_weight: f32,
    /// Magnitude of per-boid random jitter; 0 disables it.
    pub jitter_strength: f32,
    /// Speed assigned to freshly spawned boids.
    pub spawn_speed: f32,
    /// Lower bound of the speed envelope.
    pub min_speed: f32,
    /// Upper bound of the speed envelope.
    pub max_speed: f32,
    /// Speeds at or below this count as stalled and trigger a center nudge.
    pub stall_epsilon: f32,
    /// Distance from each edge where the turn-back force starts.
    pub boundary_margin: f32,
    /// Magnitude of the turn-back force inside the margin.
    pub boundary_turn_force: f32,
    /// Velocity redirect policy at the hard world edge.
    pub boundary_mode: BoundaryMode,
    /// Separation accumulation scheme.
    pub separation_scheme: SeparationScheme,
    /// Length of the forward obstacle-probe ray; 0 disables avoidance.
    pub avoid_distance: f32,
    /// Heading interpolation rate (per second) when avoiding an obstacle.
    pub avoid_turn_rate: f32,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            world_width: 800.0,
            world_height: 600.0,
            cell_size: 50.0,
            separation_radius: 25.0,
            cohesion_radius: 50.0,
            separation_weight: 40.0,
            cohesion_weight: 30.0,
            alignment_weight: 20.0,
            target_weight: 30.0,
            jitter_strength: 4.0,
            spawn_speed: 20.0,
            min_speed: 5.0,
            max_speed: 40.0,
            stall_epsilon: 0.05,
            boundary_margin: 50.0,
            boundary_turn_force: 60.0,
            boundary_mode: BoundaryMode::default(),
            separation_scheme: SeparationScheme::default(),
            avoid_distance: 30.0,
            avoid_turn_rate: 2.0,
            rng_seed: None,
        }
    }
}

impl FlockConfig {
    fn validate(&self) -> Result<(), FlockWorldError> {
        if !(self.world_width.is_finite() && self.world_width > 0.0)
            || !(self.world_height.is_finite() && self.world_height > 0.0)
        {
            return Err(FlockWorldError::InvalidConfig(
                "world extents must be positive",
            ));
        }
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(FlockWorldError::InvalidConfig("cell_size must be positive"));
        }
        if !(self.separation_radius.is_finite() && self.separation_radius > 0.0)
            || !(self.cohesion_radius.is_finite() && self.cohesion_radius > 0.0)
        {
            return Err(FlockWorldError::InvalidConfig(
                "interaction radii must be positive",
            ));
        }
        for weight in [
            self.separation_weight,
            self.cohesion_weight,
            self.alignment_weight,
            self.target_weight,
            self.jitter_strength,
        ] {
            if !(weight.is_finite() && weight >= 0.0) {
                return Err(FlockWorldError::InvalidConfig(
                    "force weights must be non-negative",
                ));
            }
        }
        if !(self.min_speed.is_finite() && self.min_speed >= 0.0)
            || !(self.max_speed.is_finite() && self.max_speed >= self.min_speed)
        {
            return Err(FlockWorldError::InvalidConfig(
                "speed envelope requires 0 <= min_speed <= max_speed",
            ));
        }
        if !(self.spawn_speed.is_finite() && self.spawn_speed >= 0.0) {
            return Err(FlockWorldError::InvalidConfig(
                "spawn_speed must be non-negative",
            ));
        }
        if !(self.stall_epsilon.is_finite() && self.stall_epsilon >= 0.0) {
            return Err(FlockWorldError::InvalidConfig(
                "stall_epsilon must be non-negative",
            ));
        }
        if !(self.boundary_margin.is_finite() && self.boundary_margin >= 0.0)
            || !(self.boundary_turn_force.is_finite() && self.boundary_turn_force >= 0.0)
        {
            return Err(FlockWorldError::InvalidConfig(
                "boundary margin and turn force must be non-negative",
            ));
        }
        if !(self.avoid_distance.is_finite() && self.avoid_distance >= 0.0)
            || !(self.avoid_turn_rate.is_finite() && self.avoid_turn_rate >= 0.0)
        {
            return Err(FlockWorldError::InvalidConfig(
                "avoidance parameters must be non-negative",
            ));
        }
        Ok(())
    }

    /// Grid geometry derived from the world extents and cell size.
    #[must_use]
    pub fn grid_config(&self) -> GridConfig {
        GridConfig::new(self.cell_size, self.world_width, self.world_height)
    }
}

/// Shape of an obstacle, tested in its local (unrotated, centered) frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum ObstacleShape {
    /// Axis-aligned box of the given half extents in the local frame.
    Rect { half_extents: Vec2 },
    /// Circle of the given radius.
    Circle { radius: f32 },
}

/// An oriented obstacle. Immutable for the lifetime of the simulation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Obstacle {
    /// World-space center.
    pub center: Vec2,
    /// Unit vector defining the rotation of the local frame.
    pub orientation: Vec2,
    /// Shape in the local frame.
    pub shape: ObstacleShape,
}

impl Obstacle {
    /// An oriented rectangle. A zero orientation falls back to +x.
    #[must_use]
    pub fn rect(center: Vec2, orientation: Vec2, half_extents: Vec2) -> Self {
        Self {
            center,
            orientation: orientation.try_normalize().unwrap_or(Vec2::X),
            shape: ObstacleShape::Rect {
                half_extents: half_extents.abs(),
            },
        }
    }

    /// A circle; rotation is irrelevant so the orientation is +x.
    #[must_use]
    pub fn circle(center: Vec2, radius: f32) -> Self {
        Self {
            center,
            orientation: Vec2::X,
            shape: ObstacleShape::Circle { radius },
        }
    }

    /// Rotation angle implied by the orientation vector.
    #[must_use]
    pub fn angle(&self) -> f32 {
        self.orientation.y.atan2(self.orientation.x)
    }
}

/// A ray intersection in world space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RayHit {
    /// Distance from the ray origin to the hit point.
    pub distance: f32,
    /// World-space hit point.
    pub point: Vec2,
    /// World-space unit normal at the hit point.
    pub normal: Vec2,
}

/// Sort direction for multi-hit ray queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum HitOrder {
    /// Nearest hit first; the usual line-of-sight query.
    #[default]
    ClosestFirst,
    /// Farthest hit first; exit-point queries for penetration resolution.
    FarthestFirst,
}

/// Intersect a ray against every obstacle, returning all hits within range.
///
/// The direction need not be normalized; a zero direction yields no hits.
/// Pure and read-only.
pub fn cast_ray_all<'a>(
    obstacles: impl IntoIterator<Item = &'a Obstacle>,
    origin: Vec2,
    direction: Vec2,
    max_distance: f32,
    order: HitOrder,
) -> Vec<RayHit> {
    let Some(direction) = direction.try_normalize() else {
        return Vec::new();
    };
    let mut hits = Vec::new();
    for obstacle in obstacles {
        let conjugate = Vec2::new(obstacle.orientation.x, -obstacle.orientation.y);
        let local_origin = conjugate.rotate(origin - obstacle.center);
        let local_direction = conjugate.rotate(direction);
        let Some((distance, local_point, local_normal)) =
            local_hit(obstacle.shape, local_origin, local_direction)
        else {
            continue;
        };
        if distance > max_distance {
            continue;
        }
        hits.push(RayHit {
            distance,
            point: obstacle.orientation.rotate(local_point) + obstacle.center,
            normal: obstacle.orientation.rotate(local_normal),
        });
    }
    hits.sort_by_key(|hit| OrderedFloat(hit.distance));
    if order == HitOrder::FarthestFirst {
        hits.reverse();
    }
    hits
}

/// Intersect a ray against every obstacle, returning the first hit in the
/// requested order, or `None` when nothing intersects within range.
pub fn cast_ray<'a>(
    obstacles: impl IntoIterator<Item = &'a Obstacle>,
    origin: Vec2,
    direction: Vec2,
    max_distance: f32,
    order: HitOrder,
) -> Option<RayHit> {
    cast_ray_all(obstacles, origin, direction, max_distance, order)
        .into_iter()
        .next()
}

fn local_hit(shape: ObstacleShape, origin: Vec2, direction: Vec2) -> Option<(f32, Vec2, Vec2)> {
    match shape {
        ObstacleShape::Rect { half_extents } => slab_hit(half_extents, origin, direction),
        ObstacleShape::Circle { radius } => circle_hit(radius, origin, direction),
    }
}

/// Slab test against an axis-aligned box centered at the local origin.
/// Rays starting inside the box hit the exit face.
fn slab_hit(half_extents: Vec2, origin: Vec2, direction: Vec2) -> Option<(f32, Vec2, Vec2)> {
    let mut t_enter = f32::NEG_INFINITY;
    let mut t_exit = f32::INFINITY;
    let mut enter_normal = Vec2::ZERO;
    let mut exit_normal = Vec2::ZERO;

    for (o, d, h, axis) in [
        (origin.x, direction.x, half_extents.x, Vec2::X),
        (origin.y, direction.y, half_extents.y, Vec2::Y),
    ] {
        if d.abs() <= f32::EPSILON {
            if o < -h || o > h {
                return None;
            }
            continue;
        }
        let inv = d.recip();
        let mut t0 = (-h - o) * inv;
        let mut t1 = (h - o) * inv;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        if t0 > t_enter {
            t_enter = t0;
            enter_normal = axis * -d.signum();
        }
        if t1 < t_exit {
            t_exit = t1;
            exit_normal = axis * d.signum();
        }
    }

    if t_exit < t_enter.max(0.0) {
        return None;
    }
    let (t, normal) = if t_enter >= 0.0 {
        (t_enter, enter_normal)
    } else {
        (t_exit, exit_normal)
    };
    Some((t, origin + direction * t, normal))
}

fn circle_hit(radius: f32, origin: Vec2, direction: Vec2) -> Option<(f32, Vec2, Vec2)> {
    if radius <= 0.0 {
        return None;
    }
    let b = origin.dot(direction);
    let c = origin.length_squared() - radius * radius;
    let discriminant = b * b - c;
    if discriminant < 0.0 {
        return None;
    }
    let sqrt_d = discriminant.sqrt();
    let t_enter = -b - sqrt_d;
    let t_exit = -b + sqrt_d;
    if t_exit < 0.0 {
        return None;
    }
    let t = if t_enter >= 0.0 { t_enter } else { t_exit };
    let point = origin + direction * t;
    Some((t, point, point.normalize_or_zero()))
}

#[derive(Debug, Clone, Copy)]
struct BoundaryDelta {
    position: Vec2,
    velocity: Vec2,
}

/// The simulation world: boid arena, spatial grid and obstacle set.
pub struct FlockWorld {
    config: FlockConfig,
    tick: Tick,
    rng: SmallRng,
    jitter_seed: u64,
    boids: BoidArena,
    obstacles: SlotMap<ObstacleId, Obstacle>,
    grid: SpatialGrid<BoidId>,
}

impl std::fmt::Debug for FlockWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlockWorld")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("boid_count", &self.boids.len())
            .field("obstacle_count", &self.obstacles.len())
            .finish()
    }
}

impl FlockWorld {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: FlockConfig) -> Result<Self, FlockWorldError> {
        config.validate()?;
        let grid = SpatialGrid::new(config.grid_config())?;
        let seed = config.rng_seed.unwrap_or_else(rand::random);
        Ok(Self {
            config,
            tick: Tick::zero(),
            rng: SmallRng::seed_from_u64(seed),
            jitter_seed: seed,
            boids: BoidArena::new(),
            obstacles: SlotMap::with_key(),
            grid,
        })
    }

    /// Migrate boids whose position hashes to a new cell, then rebuild the
    /// per-cell aggregates from membership. Returns the number of migrations.
    fn stage_rehash(&mut self) -> usize {
        let mut moved = 0;
        let handles: Vec<BoidId> = self.boids.iter_handles().collect();
        for (idx, &id) in handles.iter().enumerate() {
            let position = self.boids.columns().positions()[idx];
            let next_cell = self.grid.cell_at(position);
            let current = self.boids.columns().cells()[idx];
            if current == Some(next_cell) {
                continue;
            }
            if let Some(previous) = current {
                self.grid.remove(id, previous);
            }
            self.grid.insert(id, next_cell);
            self.boids.columns_mut().cells_mut()[idx] = Some(next_cell);
            moved += 1;
        }

        let boids = &self.boids;
        self.grid.rebuild_aggregates(|id| {
            boids.index_of(id).map_or((Vec2::ZERO, Vec2::ZERO), |idx| {
                let columns = boids.columns();
                (columns.positions()[idx], columns.directions()[idx])
            })
        });
        moved
    }

    /// Parallel force pass: separation, cohesion, alignment, target, jitter.
    ///
    /// Integration starts from `previous_velocity`, frozen at the end of the
    /// last tick, so neighbor reads are consistent regardless of worker
    /// scheduling.
    fn stage_flocking(&mut self, dt: f32, target: Option<Vec2>, next_tick: Tick) {
        if self.boids.is_empty() {
            return;
        }
        let columns = self.boids.columns();
        let positions = columns.positions().to_vec();
        let previous_velocities = columns.previous_velocities().to_vec();
        let cells = columns.cells().to_vec();
        let handles: Vec<BoidId> = self.boids.iter_handles().collect();

        let separation_radius_sq = self.config.separation_radius * self.config.separation_radius;
        let cohesion_radius_sq = self.config.cohesion_radius * self.config.cohesion_radius;
        let cohesion_radius = self.config.cohesion_radius;
        let separation_weight = self.config.separation_weight;
        let cohesion_weight = self.config.cohesion_weight;
        let alignment_weight = self.config.alignment_weight;
        let target_weight = self.config.target_weight;
        let jitter_strength = self.config.jitter_strength;
        let scheme = self.config.separation_scheme;
        let jitter_seed = self.jitter_seed;
        let tick_bits = next_tick.0;
        let grid = &self.grid;
        let arena = &self.boids;

        let next_velocities: Vec<Vec2> = handles
            .par_iter()
            .enumerate()
            .map(|(idx, &id)| {
                let position = positions[idx];
                let mut separation_centroid = Vec2::ZERO;
                let mut separation_push = Vec2::ZERO;
                let mut separation_count = 0u32;
                let mut cohesion_centroid = Vec2::ZERO;
                let mut alignment_sum = Vec2::ZERO;
                let mut cohesion_count = 0u32;

                if let Some(cell) = cells[idx] {
                    for close in grid.close_cells(cell) {
                        for other in grid.members(close) {
                            if other == id {
                                continue;
                            }
                            let Some(other_idx) = arena.index_of(other) else {
                                continue;
                            };
                            let other_position = positions[other_idx];
                            let offset = position - other_position;
                            let distance_sq = offset.length_squared();
                            if distance_sq < separation_radius_sq {
                                separation_count += 1;
                                match scheme {
                                    SeparationScheme::CentroidThreshold => {
                                        separation_centroid += other_position;
                                    }
                                    SeparationScheme::InverseDistance => {
                                        let push = offset.normalize_or_zero();
                                        let strength = if distance_sq > 0.0 {
                                            distance_sq
                                                .sqrt()
                                                .recip()
                                                .min(INVERSE_SEPARATION_CLAMP)
                                        } else {
                                            INVERSE_SEPARATION_CLAMP
                                        };
                                        separation_push +=
                                            push * (strength / INVERSE_SEPARATION_CLAMP);
                                    }
                                }
                            }
                            if distance_sq < cohesion_radius_sq {
                                cohesion_centroid += other_position;
                                alignment_sum += previous_velocities[other_idx];
                                cohesion_count += 1;
                            }
                        }
                    }
                }

                let separation = if separation_count > 0 {
                    match scheme {
                        SeparationScheme::CentroidThreshold => {
                            let centroid = separation_centroid / separation_count as f32;
                            (position - centroid).normalize_or_zero() * separation_weight
                        }
                        SeparationScheme::InverseDistance => {
                            separation_push / separation_count as f32 * separation_weight
                        }
                    }
                } else {
                    Vec2::ZERO
                };
                let (cohesion, alignment) = if cohesion_count > 0 {
                    let centroid = cohesion_centroid / cohesion_count as f32;
                    let average_velocity = alignment_sum / cohesion_count as f32;
                    (
                        (centroid - position).normalize_or_zero() * cohesion_weight,
                        average_velocity.normalize_or_zero() * alignment_weight,
                    )
                } else {
                    (Vec2::ZERO, Vec2::ZERO)
                };
                // Saturates once the attractor is beyond the cohesion radius.
                let seek = target.map_or(Vec2::ZERO, |point| {
                    let to_target = point - position;
                    let reach = (to_target.length() / cohesion_radius).min(1.0);
                    to_target.normalize_or_zero() * (reach * target_weight)
                });
                let jitter = if jitter_strength > 0.0 {
                    let mut rng = SmallRng::seed_from_u64(
                        jitter_seed
                            ^ tick_bits.wrapping_mul(0x9E37_79B9_7F4A_7C15)
                            ^ (idx as u64).wrapping_mul(0xD134_2543_DE82_EF95),
                    );
                    Vec2::from_angle(rng.random_range(0.0..TAU)) * jitter_strength
                } else {
                    Vec2::ZERO
                };

                let total = separation + cohesion + alignment + seek + jitter;
                previous_velocities[idx] + total * dt
            })
            .collect();

        self.boids
            .columns_mut()
            .velocities_mut()
            .copy_from_slice(&next_velocities);
    }

    /// Steer boids whose forward probe ray hits an obstacle. Returns the
    /// number of boids that had to steer.
    fn stage_avoidance(&mut self, dt: f32) -> usize {
        if self.obstacles.is_empty() || self.config.avoid_distance <= 0.0 || self.boids.is_empty() {
            return 0;
        }
        let obstacles: Vec<Obstacle> = self.obstacles.values().copied().collect();
        let columns = self.boids.columns();
        let positions = columns.positions().to_vec();
        let directions = columns.directions().to_vec();
        let velocities = columns.velocities().to_vec();
        let avoid_distance = self.config.avoid_distance;
        let turn_rate = self.config.avoid_turn_rate;
        let min_speed = self.config.min_speed;

        let steered: Vec<Option<Vec2>> = (0..positions.len())
            .into_par_iter()
            .map(|idx| {
                let direction = directions[idx];
                let hit = cast_ray(
                    obstacles.iter(),
                    positions[idx],
                    direction,
                    avoid_distance,
                    HitOrder::ClosestFirst,
                )?;
                // Half-vector between the hit normal and the tangent on the
                // side the boid is already traveling; disambiguates which way
                // to deflect along the surface.
                let mut tangent = hit.normal.perp();
                if direction.dot(tangent) < 0.0 {
                    tangent = -tangent;
                }
                let deflection = (hit.normal + tangent).normalize_or_zero();
                let blend = (turn_rate * dt).clamp(0.0, 1.0);
                let heading = direction.lerp(deflection, blend).normalize_or_zero();
                if heading == Vec2::ZERO {
                    return None;
                }
                // Stalled boids still need enough speed to turn away.
                let speed = velocities[idx].length().max(min_speed);
                Some(heading * speed)
            })
            .collect();

        let mut hits = 0;
        let velocities = self.boids.columns_mut().velocities_mut();
        for (idx, steered) in steered.iter().enumerate() {
            if let Some(velocity) = steered {
                velocities[idx] = *velocity;
                hits += 1;
            }
        }
        hits
    }

    /// Soft margin force, hard edge clamp with redirect, speed envelope, and
    /// the `previous_velocity` copy that closes the tick for the force pass.
    fn stage_boundary(&mut self, dt: f32) {
        if self.boids.is_empty() {
            return;
        }
        let width = self.config.world_width;
        let height = self.config.world_height;
        let margin = self.config.boundary_margin;
        let turn_force = self.config.boundary_turn_force;
        let mode = self.config.boundary_mode;
        let min_speed = self.config.min_speed;
        let max_speed = self.config.max_speed;
        let stall_epsilon = self.config.stall_epsilon;
        let center = Vec2::new(width * 0.5, height * 0.5);

        let columns = self.boids.columns();
        let deltas: Vec<BoundaryDelta> = columns
            .positions()
            .iter()
            .zip(columns.velocities())
            .map(|(&position, &velocity)| {
                let mut position = position;
                let mut velocity = velocity;

                if margin > 0.0 {
                    let mut steer = Vec2::ZERO;
                    if position.x < margin {
                        steer.x += turn_force;
                    }
                    if position.x > width - margin {
                        steer.x -= turn_force;
                    }
                    if position.y < margin {
                        steer.y += turn_force;
                    }
                    if position.y > height - margin {
                        steer.y -= turn_force;
                    }
                    velocity += steer * dt;
                }

                let mut escaped_x = 0i8;
                let mut escaped_y = 0i8;
                if position.x < 0.0 {
                    position.x = 0.0;
                    escaped_x = -1;
                } else if position.x > width {
                    position.x = width;
                    escaped_x = 1;
                }
                if position.y < 0.0 {
                    position.y = 0.0;
                    escaped_y = -1;
                } else if position.y > height {
                    position.y = height;
                    escaped_y = 1;
                }
                if escaped_x != 0 || escaped_y != 0 {
                    match mode {
                        BoundaryMode::RedirectTowardCenter => {
                            let inward = (center - position).normalize_or_zero();
                            if inward != Vec2::ZERO {
                                velocity = inward * velocity.length();
                            }
                        }
                        BoundaryMode::Reflect => {
                            if escaped_x < 0 {
                                velocity.x = velocity.x.abs();
                            } else if escaped_x > 0 {
                                velocity.x = -velocity.x.abs();
                            }
                            if escaped_y < 0 {
                                velocity.y = velocity.y.abs();
                            } else if escaped_y > 0 {
                                velocity.y = -velocity.y.abs();
                            }
                        }
                    }
                }

                let speed = velocity.length();
                if speed <= stall_epsilon {
                    let inward = (center - position).normalize_or_zero();
                    velocity = if inward == Vec2::ZERO {
                        Vec2::X * min_speed
                    } else {
                        inward * min_speed
                    };
                } else if speed < min_speed {
                    velocity *= min_speed / speed;
                } else if speed > max_speed {
                    velocity *= max_speed / speed;
                }

                BoundaryDelta { position, velocity }
            })
            .collect();

        let columns = self.boids.columns_mut();
        {
            let positions = columns.positions_mut();
            for (idx, delta) in deltas.iter().enumerate() {
                positions[idx] = delta.position;
            }
        }
        {
            let velocities = columns.velocities_mut();
            for (idx, delta) in deltas.iter().enumerate() {
                velocities[idx] = delta.velocity;
            }
        }
        {
            let previous = columns.previous_velocities_mut();
            for (idx, delta) in deltas.iter().enumerate() {
                previous[idx] = delta.velocity;
            }
        }
    }

    /// Advance positions from velocities and refresh unit headings.
    fn stage_motion(&mut self, dt: f32) {
        if self.boids.is_empty() {
            return;
        }
        let velocities = self.boids.columns().velocities().to_vec();
        let columns = self.boids.columns_mut();
        {
            let positions = columns.positions_mut();
            for (idx, velocity) in velocities.iter().enumerate() {
                positions[idx] += *velocity * dt;
            }
        }
        {
            let directions = columns.directions_mut();
            for (idx, velocity) in velocities.iter().enumerate() {
                // Zero velocity keeps the last heading.
                if let Some(heading) = velocity.try_normalize() {
                    directions[idx] = heading;
                }
            }
        }
    }

    /// Execute one simulation tick: rehash, forces, boundary, motion.
    ///
    /// `target` is an optional attractor (e.g. a cursor position) the flock
    /// seeks this tick. Negative or non-finite `delta_time_ms` is treated as
    /// zero.
    pub fn step(&mut self, delta_time_ms: f32, target: Option<Vec2>) -> TickEvents {
        let dt = if delta_time_ms.is_finite() {
            (delta_time_ms / 1_000.0).max(0.0)
        } else {
            0.0
        };
        let next_tick = self.tick.next();
        let cells_changed = self.stage_rehash();
        self.stage_flocking(dt, target, next_tick);
        let avoidance_hits = self.stage_avoidance(dt);
        self.stage_boundary(dt);
        self.stage_motion(dt);
        self.tick = next_tick;
        trace!(
            tick = self.tick.0,
            cells_changed, avoidance_hits, "tick complete"
        );
        TickEvents {
            tick: self.tick,
            cells_changed,
            avoidance_hits,
        }
    }

    /// Batch-spawn boids with positions uniform in a disk around `center`
    /// and random unit headings at `spawn_speed`.
    pub fn spawn_boids(&mut self, count: usize, center: Vec2, radius: f32) -> Vec<BoidId> {
        let mut ids = Vec::with_capacity(count);
        self.boids.reserve(count);
        for _ in 0..count {
            let angle = self.rng.random_range(0.0..TAU);
            let distance = radius.max(0.0) * self.rng.random::<f32>().sqrt();
            let position = center + Vec2::from_angle(angle) * distance;
            let heading = Vec2::from_angle(self.rng.random_range(0.0..TAU));
            let velocity = heading * self.config.spawn_speed;
            let id = self.boids.insert(BoidData {
                position,
                direction: heading,
                velocity,
                previous_velocity: velocity,
            });
            let cell = self.grid.cell_at(position);
            self.grid.insert(id, cell);
            if let Some(idx) = self.boids.index_of(id) {
                self.boids.columns_mut().cells_mut()[idx] = Some(cell);
            }
            ids.push(id);
        }
        debug!(count, "spawned boids");
        ids
    }

    /// Remove a boid: erase it from its grid cell, then drop the row.
    pub fn remove_boid(&mut self, id: BoidId) -> Option<BoidData> {
        if let Some(idx) = self.boids.index_of(id)
            && let Some(cell) = self.boids.columns().cells()[idx]
        {
            self.grid.remove(id, cell);
        }
        self.boids.remove(id)
    }

    /// Register an oriented rectangular obstacle.
    pub fn add_obstacle(
        &mut self,
        center: Vec2,
        orientation: Vec2,
        half_extents: Vec2,
    ) -> ObstacleId {
        self.obstacles
            .insert(Obstacle::rect(center, orientation, half_extents))
    }

    /// Register a circular obstacle.
    pub fn add_circle_obstacle(&mut self, center: Vec2, radius: f32) -> ObstacleId {
        self.obstacles.insert(Obstacle::circle(center, radius))
    }

    /// Closest (or farthest) obstacle hit along a ray, if any.
    #[must_use]
    pub fn query_ray(
        &self,
        origin: Vec2,
        direction: Vec2,
        max_distance: f32,
        order: HitOrder,
    ) -> Option<RayHit> {
        cast_ray(self.obstacles.values(), origin, direction, max_distance, order)
    }

    /// Every obstacle hit along a ray, sorted per `order`.
    #[must_use]
    pub fn query_ray_all(
        &self,
        origin: Vec2,
        direction: Vec2,
        max_distance: f32,
        order: HitOrder,
    ) -> Vec<RayHit> {
        cast_ray_all(self.obstacles.values(), origin, direction, max_distance, order)
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &FlockConfig {
        &self.config
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Read-only access to the boid arena.
    #[must_use]
    pub fn boids(&self) -> &BoidArena {
        &self.boids
    }

    /// Mutable access to the boid arena. The next rehash reconciles grid
    /// membership with whatever positions callers write.
    #[must_use]
    pub fn boids_mut(&mut self) -> &mut BoidArena {
        &mut self.boids
    }

    /// Number of live boids.
    #[must_use]
    pub fn boid_count(&self) -> usize {
        self.boids.len()
    }

    /// Read-only access to the spatial grid (occupancy and aggregates).
    #[must_use]
    pub fn grid(&self) -> &SpatialGrid<BoidId> {
        &self.grid
    }

    /// Look up an obstacle by handle.
    #[must_use]
    pub fn obstacle(&self, id: ObstacleId) -> Option<&Obstacle> {
        self.obstacles.get(id)
    }

    /// Iterate all obstacles.
    pub fn obstacles(&self) -> impl Iterator<Item = (ObstacleId, &Obstacle)> {
        self.obstacles.iter()
    }

    /// Number of registered obstacles.
    #[must_use]
    pub fn obstacle_count(&self) -> usize {
        self.obstacles.len()
    }

    /// Produce a combined snapshot of one boid's columns and grid cell.
    #[must_use]
    pub fn snapshot_boid(&self, id: BoidId) -> Option<BoidState> {
        let index = self.boids.index_of(id)?;
        Some(BoidState {
            id,
            data: self.boids.columns().snapshot(index),
            cell: self.boids.columns().cells()[index],
        })
    }
}
