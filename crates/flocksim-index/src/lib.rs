//! Uniform-cell spatial hash index for flock neighborhood queries.
//!
//! The grid maps 2D positions to fixed-size cells and tracks, per cell, the
//! set of member ids plus an aggregated summary (position sum, direction sum,
//! count). Membership is a derived index over caller-owned positions: cells
//! are created lazily when the first member arrives and pruned when the last
//! one leaves, so an empty cell and an absent cell are indistinguishable to
//! queries.
//!
//! Membership and cell storage use ordered containers so iteration order is
//! deterministic across runs; seeded simulations replay bit-identically.

use std::collections::{BTreeMap, BTreeSet};

use glam::Vec2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by the spatial grid.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Identifier of one grid cell, packed as `cell_x + cell_y * columns`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct CellId(pub u64);

/// Summary of a cell's membership, rebuilt once per tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CellAggregate {
    /// Sum of member positions.
    pub position_sum: Vec2,
    /// Sum of member unit headings.
    pub direction_sum: Vec2,
    /// Number of members the sums cover.
    pub count: u32,
}

/// Geometry of the grid: cell edge length and the world rectangle it covers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    /// Edge length of each cell in world units.
    pub cell_size: f32,
    /// World extent along x, starting at 0.
    pub world_width: f32,
    /// World extent along y, starting at 0.
    pub world_height: f32,
}

impl GridConfig {
    /// Construct a new grid configuration.
    #[must_use]
    pub const fn new(cell_size: f32, world_width: f32, world_height: f32) -> Self {
        Self {
            cell_size,
            world_width,
            world_height,
        }
    }
}

#[derive(Debug, Clone)]
struct GridCell<K> {
    members: BTreeSet<K>,
    aggregate: CellAggregate,
}

impl<K> Default for GridCell<K> {
    fn default() -> Self {
        Self {
            members: BTreeSet::new(),
            aggregate: CellAggregate::default(),
        }
    }
}

/// Uniform-cell spatial hash over 2D positions, generic over the member id type.
#[derive(Debug, Clone)]
pub struct SpatialGrid<K> {
    cell_size: f32,
    columns: u64,
    rows: u64,
    cells: BTreeMap<CellId, GridCell<K>>,
}

impl<K: Copy + Ord> SpatialGrid<K> {
    /// Create a grid covering the configured world rectangle.
    pub fn new(config: GridConfig) -> Result<Self, IndexError> {
        if !(config.cell_size.is_finite() && config.cell_size > 0.0) {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if !(config.world_width.is_finite() && config.world_width > 0.0)
            || !(config.world_height.is_finite() && config.world_height > 0.0)
        {
            return Err(IndexError::InvalidConfig("world extents must be positive"));
        }
        let columns = (config.world_width / config.cell_size).ceil().max(1.0) as u64;
        let rows = (config.world_height / config.cell_size).ceil().max(1.0) as u64;
        Ok(Self {
            cell_size: config.cell_size,
            columns,
            rows,
            cells: BTreeMap::new(),
        })
    }

    /// Edge length of one cell.
    #[must_use]
    pub const fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Number of columns in the grid.
    #[must_use]
    pub const fn columns(&self) -> u64 {
        self.columns
    }

    /// Number of rows in the grid.
    #[must_use]
    pub const fn rows(&self) -> u64 {
        self.rows
    }

    /// Map a position to its cell id.
    ///
    /// Coordinates are clamped into the world rectangle first, so the mapping
    /// is total for any finite position and `cell_to_coords` inverts it for
    /// every id this function can return.
    #[must_use]
    pub fn cell_at(&self, position: Vec2) -> CellId {
        let cx = ((position.x / self.cell_size).floor() as i64).clamp(0, self.columns as i64 - 1);
        let cy = ((position.y / self.cell_size).floor() as i64).clamp(0, self.rows as i64 - 1);
        CellId(cx as u64 + cy as u64 * self.columns)
    }

    /// Unpack a cell id into `(cell_x, cell_y)` grid coordinates.
    #[must_use]
    pub const fn cell_to_coords(&self, cell: CellId) -> (u64, u64) {
        (cell.0 % self.columns, cell.0 / self.columns)
    }

    /// Whether a cell id lies inside the grid rectangle.
    #[must_use]
    pub const fn contains_cell(&self, cell: CellId) -> bool {
        cell.0 < self.columns * self.rows
    }

    /// Add a member to a cell. Adding an id already present is a no-op.
    pub fn insert(&mut self, id: K, cell: CellId) {
        self.cells.entry(cell).or_default().members.insert(id);
    }

    /// Remove a member from a cell. Removing an absent id is a no-op.
    ///
    /// Cells left without members are pruned so queries see them as absent.
    pub fn remove(&mut self, id: K, cell: CellId) {
        if let Some(entry) = self.cells.get_mut(&cell) {
            entry.members.remove(&id);
            if entry.members.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }

    /// Iterate the members of a cell; unknown cells yield nothing.
    pub fn members(&self, cell: CellId) -> impl Iterator<Item = K> + '_ {
        self.cells
            .get(&cell)
            .into_iter()
            .flat_map(|entry| entry.members.iter().copied())
    }

    /// Number of members currently hashed to a cell.
    #[must_use]
    pub fn occupants(&self, cell: CellId) -> usize {
        self.cells.get(&cell).map_or(0, |entry| entry.members.len())
    }

    /// The cell itself plus its 8-connected in-bounds neighbors, row-major.
    #[must_use]
    pub fn close_cells(&self, cell: CellId) -> Vec<CellId> {
        let (cx, cy) = self.cell_to_coords(cell);
        let mut neighborhood = Vec::with_capacity(9);
        for dy in -1i64..=1 {
            let ny = cy as i64 + dy;
            if ny < 0 || ny >= self.rows as i64 {
                continue;
            }
            for dx in -1i64..=1 {
                let nx = cx as i64 + dx;
                if nx < 0 || nx >= self.columns as i64 {
                    continue;
                }
                neighborhood.push(CellId(nx as u64 + ny as u64 * self.columns));
            }
        }
        neighborhood
    }

    /// Overwrite the stored aggregate for an occupied cell.
    ///
    /// Unknown cells are ignored: a cell without members has no storage to
    /// write into, and its aggregate already reads as zero.
    pub fn set_aggregate(&mut self, cell: CellId, aggregate: CellAggregate) {
        if let Some(entry) = self.cells.get_mut(&cell) {
            entry.aggregate = aggregate;
        }
    }

    /// Read a cell's aggregate; unknown cells read as the zero aggregate.
    #[must_use]
    pub fn aggregate(&self, cell: CellId) -> CellAggregate {
        self.cells
            .get(&cell)
            .map_or_else(CellAggregate::default, |entry| entry.aggregate)
    }

    /// Recompute every occupied cell's aggregate from its membership.
    ///
    /// `sample` maps a member id to its `(position, direction)` pair.
    pub fn rebuild_aggregates(&mut self, mut sample: impl FnMut(K) -> (Vec2, Vec2)) {
        for entry in self.cells.values_mut() {
            let mut aggregate = CellAggregate::default();
            for &member in &entry.members {
                let (position, direction) = sample(member);
                aggregate.position_sum += position;
                aggregate.direction_sum += direction;
                aggregate.count += 1;
            }
            entry.aggregate = aggregate;
        }
    }

    /// Iterate occupied cells as `(cell, occupant count)`.
    pub fn occupied_cells(&self) -> impl Iterator<Item = (CellId, usize)> + '_ {
        self.cells
            .iter()
            .map(|(&cell, entry)| (cell, entry.members.len()))
    }

    /// Number of occupied cells.
    #[must_use]
    pub fn occupied_count(&self) -> usize {
        self.cells.len()
    }

    /// Drop all membership and aggregate state, keeping the geometry.
    pub fn clear(&mut self) {
        self.cells.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> SpatialGrid<u32> {
        SpatialGrid::new(GridConfig::new(50.0, 800.0, 600.0)).expect("grid")
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(SpatialGrid::<u32>::new(GridConfig::new(0.0, 800.0, 600.0)).is_err());
        assert!(SpatialGrid::<u32>::new(GridConfig::new(-1.0, 800.0, 600.0)).is_err());
        assert!(SpatialGrid::<u32>::new(GridConfig::new(50.0, 0.0, 600.0)).is_err());
        assert!(SpatialGrid::<u32>::new(GridConfig::new(f32::NAN, 800.0, 600.0)).is_err());
    }

    #[test]
    fn cell_mapping_round_trips() {
        let grid = grid();
        assert_eq!(grid.columns(), 16);
        assert_eq!(grid.rows(), 12);
        for (x, y) in [(0.0, 0.0), (49.9, 49.9), (410.0, 90.0), (799.9, 599.9)] {
            let cell = grid.cell_at(Vec2::new(x, y));
            let (cx, cy) = grid.cell_to_coords(cell);
            assert_eq!(cx, (x / 50.0).floor() as u64);
            assert_eq!(cy, (y / 50.0).floor() as u64);
            assert_eq!(CellId(cx + cy * grid.columns()), cell);
            assert!(grid.contains_cell(cell));
        }
    }

    #[test]
    fn out_of_bounds_positions_clamp_to_edge_cells() {
        let grid = grid();
        assert_eq!(grid.cell_at(Vec2::new(-25.0, -5.0)), CellId(0));
        let far = grid.cell_at(Vec2::new(10_000.0, 10_000.0));
        assert_eq!(grid.cell_to_coords(far), (15, 11));
    }

    #[test]
    fn insert_and_remove_are_idempotent() {
        let mut grid = grid();
        let cell = grid.cell_at(Vec2::new(10.0, 10.0));
        grid.insert(7, cell);
        grid.insert(7, cell);
        assert_eq!(grid.occupants(cell), 1);

        grid.remove(3, cell);
        assert_eq!(grid.occupants(cell), 1);
        grid.remove(7, cell);
        grid.remove(7, cell);
        assert_eq!(grid.occupants(cell), 0);
        assert_eq!(grid.occupied_count(), 0, "empty cells are pruned");
    }

    #[test]
    fn unknown_cells_read_as_empty() {
        let grid = grid();
        let cell = CellId(42);
        assert_eq!(grid.members(cell).count(), 0);
        assert_eq!(grid.occupants(cell), 0);
        assert_eq!(grid.aggregate(cell), CellAggregate::default());
    }

    #[test]
    fn close_cells_respects_grid_bounds() {
        let grid = grid();
        let corner = grid.cell_at(Vec2::new(0.0, 0.0));
        assert_eq!(grid.close_cells(corner).len(), 4);

        let edge = grid.cell_at(Vec2::new(410.0, 0.0));
        assert_eq!(grid.close_cells(edge).len(), 6);

        let middle = grid.cell_at(Vec2::new(410.0, 290.0));
        let neighborhood = grid.close_cells(middle);
        assert_eq!(neighborhood.len(), 9);
        assert!(neighborhood.contains(&middle));
        for cell in &neighborhood {
            assert!(grid.contains_cell(*cell));
        }
    }

    #[test]
    fn close_cells_order_is_stable() {
        let grid = grid();
        let middle = grid.cell_at(Vec2::new(410.0, 290.0));
        assert_eq!(grid.close_cells(middle), grid.close_cells(middle));
    }

    #[test]
    fn aggregates_rebuild_from_membership() {
        let mut grid = grid();
        let cell = grid.cell_at(Vec2::new(10.0, 10.0));
        grid.insert(1, cell);
        grid.insert(2, cell);

        grid.rebuild_aggregates(|id| match id {
            1 => (Vec2::new(10.0, 10.0), Vec2::X),
            _ => (Vec2::new(20.0, 30.0), Vec2::Y),
        });

        let aggregate = grid.aggregate(cell);
        assert_eq!(aggregate.count, 2);
        assert_eq!(aggregate.position_sum, Vec2::new(30.0, 40.0));
        assert_eq!(aggregate.direction_sum, Vec2::new(1.0, 1.0));

        grid.set_aggregate(cell, CellAggregate::default());
        assert_eq!(grid.aggregate(cell).count, 0);
    }
}
