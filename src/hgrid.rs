//! A single level of the hash tree: an open-addressed spatial hash from
//! quantized voxel coordinates to dense indices.

use fnv::FnvHasher;

use std::hash::{BuildHasher, Hasher};

use crate::Real;
use na::{Point3, Vector3};
use parry::bounding_volume::Aabb;

/// Seeded FNV hasher builder, identical across runs and platforms.
#[derive(Copy, Clone, Debug)]
pub struct DeterministicState;

impl Default for DeterministicState {
    fn default() -> Self {
        DeterministicState
    }
}

impl BuildHasher for DeterministicState {
    type Hasher = FnvHasher;

    fn build_hasher(&self) -> FnvHasher {
        FnvHasher::with_key(1820)
    }
}

const EMPTY: u32 = u32::MAX;
const MIN_CAPACITY: usize = 16;

/// Hash of a voxel coordinate.
///
/// FNV alone leaves the high bits poorly mixed for small integer keys, so its
/// output goes through the 64-bit murmur3 finalizer before being masked.
pub fn voxel_hash(coord: &Point3<i64>) -> u64 {
    let mut hasher = DeterministicState.build_hasher();
    hasher.write_i64(coord.x);
    hasher.write_i64(coord.y);
    hasher.write_i64(coord.z);

    let mut h = hasher.finish();
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// A grid based on spacial hashing.
///
/// Occupied cells are numbered densely in insertion order; the numbering never
/// changes afterwards. Negative coordinates are supported. Collisions are
/// resolved with linear probing.
#[derive(PartialEq, Debug, Clone)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct HGrid {
    cell_width: Real,
    cells: Vec<Point3<i64>>,
    slots: Vec<u32>,
}

impl HGrid {
    /// Initialize a grid where each cell has the width `cell_width`.
    pub fn new(cell_width: Real) -> Self {
        Self::with_capacity(cell_width, 0)
    }

    /// Initialize a grid pre-sized for `capacity` occupied cells.
    pub fn with_capacity(cell_width: Real, capacity: usize) -> Self {
        Self {
            cell_width,
            cells: Vec::with_capacity(capacity),
            slots: vec![EMPTY; Self::slot_count(capacity)],
        }
    }

    /// A grid whose occupied cells are exactly `cells`, numbered in order.
    ///
    /// Duplicates are ignored.
    pub fn from_cells(cell_width: Real, cells: impl IntoIterator<Item = Point3<i64>>) -> Self {
        let cells = cells.into_iter();
        let mut grid = Self::with_capacity(cell_width, cells.size_hint().0);
        for cell in cells {
            let _ = grid.insert(cell);
        }
        grid
    }

    fn slot_count(capacity: usize) -> usize {
        (capacity * 2).next_power_of_two().max(MIN_CAPACITY)
    }

    /// The width of a cell of this spacial grid.
    pub fn cell_width(&self) -> Real {
        self.cell_width
    }

    /// Number of occupied cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Does this grid have no occupied cell?
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// The occupied cells, in index order.
    pub fn cells(&self) -> &[Point3<i64>] {
        &self.cells
    }

    /// The cell with the dense index `id`.
    pub fn cell(&self, id: usize) -> Point3<i64> {
        self.cells[id]
    }

    fn quantify(value: Real, cell_width: Real) -> i64 {
        (value / cell_width).floor() as i64
    }

    /// Computes the logical grid cell containing `point`.
    pub fn key(&self, point: &Point3<Real>) -> Point3<i64> {
        Point3::from(point.coords.map(|e| Self::quantify(e, self.cell_width)))
    }

    /// Coordinates of `point` in cell units, relative to the center of cell `(0, 0, 0)`.
    ///
    /// The integer part of this value (rounded to the nearest) identifies the cell
    /// whose center is the closest to `point`.
    pub fn local_coords(&self, point: &Point3<Real>) -> Vector3<Real> {
        point.coords.map(|e| e / self.cell_width - 0.5)
    }

    /// The center of the given cell.
    pub fn cell_center(&self, cell: &Point3<i64>) -> Point3<Real> {
        Point3::from(cell.coords.map(|x| (x as Real + 0.5) * self.cell_width))
    }

    /// The axis-aligned box covered by `cell`.
    pub fn cell_aabb(&self, cell: &Point3<i64>) -> Aabb {
        Aabb::from_half_extents(
            self.cell_center(cell),
            Vector3::repeat(self.cell_width / 2.0),
        )
    }

    fn probe_start(&self, cell: &Point3<i64>) -> usize {
        (voxel_hash(cell) as usize) & (self.slots.len() - 1)
    }

    /// The dense index of `cell`, if it is occupied.
    pub fn get(&self, cell: &Point3<i64>) -> Option<usize> {
        let mask = self.slots.len() - 1;
        let mut slot = self.probe_start(cell);

        loop {
            match self.slots[slot] {
                EMPTY => return None,
                id if self.cells[id as usize] == *cell => return Some(id as usize),
                _ => slot = (slot + 1) & mask,
            }
        }
    }

    /// Is `cell` occupied?
    pub fn contains(&self, cell: &Point3<i64>) -> bool {
        self.get(cell).is_some()
    }

    /// Inserts `cell`, returning its dense index and whether it was newly inserted.
    pub fn insert(&mut self, cell: Point3<i64>) -> (usize, bool) {
        if (self.cells.len() + 1) * 2 > self.slots.len() {
            self.grow();
        }

        let mask = self.slots.len() - 1;
        let mut slot = self.probe_start(&cell);

        loop {
            match self.slots[slot] {
                EMPTY => {
                    let id = self.cells.len();
                    self.slots[slot] = id as u32;
                    self.cells.push(cell);
                    return (id, true);
                }
                id if self.cells[id as usize] == cell => return (id as usize, false),
                _ => slot = (slot + 1) & mask,
            }
        }
    }

    fn grow(&mut self) {
        self.slots = vec![EMPTY; self.slots.len() * 2];
        let mask = self.slots.len() - 1;

        for (id, cell) in self.cells.iter().enumerate() {
            let mut slot = (voxel_hash(cell) as usize) & mask;
            while self.slots[slot] != EMPTY {
                slot = (slot + 1) & mask;
            }
            self.slots[slot] = id as u32;
        }
    }

    /// An iterator through all the occupied neighbors of the given cell, with their index.
    ///
    /// The given cell itself will be yielded by this iterator too if it is occupied.
    pub fn neighbor_cells(
        &self,
        cell: &Point3<i64>,
        radius: i64,
    ) -> impl Iterator<Item = (Point3<i64>, usize)> + '_ {
        CellRangeIterator::with_center(*cell, radius)
            .filter_map(move |cell| self.get(&cell).map(|id| (cell, id)))
    }

    /// An iterator through all the occupied cells intersecting the given Aabb.
    pub fn cells_intersecting_aabb(
        &self,
        mins: &Point3<Real>,
        maxs: &Point3<Real>,
    ) -> impl Iterator<Item = (Point3<i64>, usize)> + '_ {
        CellRangeIterator::new(self.key(mins), self.key(maxs))
            .filter_map(move |cell| self.get(&cell).map(|id| (cell, id)))
    }
}

/// Iterates through every integer point of a box, bounds included.
pub struct CellRangeIterator {
    start: Point3<i64>,
    end: Point3<i64>,
    curr: Point3<i64>,
    done: bool,
}

impl CellRangeIterator {
    /// Iterates from `start` to `end`, both included. Empty if `start > end` along any axis.
    pub fn new(start: Point3<i64>, end: Point3<i64>) -> Self {
        Self {
            start,
            end,
            curr: start,
            done: start.x > end.x || start.y > end.y || start.z > end.z,
        }
    }

    /// Iterates through the cube of half-width `radius` around `center`.
    pub fn with_center(center: Point3<i64>, radius: i64) -> Self {
        Self::new(
            center - Vector3::repeat(radius),
            center + Vector3::repeat(radius),
        )
    }
}

impl Iterator for CellRangeIterator {
    type Item = Point3<i64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.curr == self.end {
            self.done = true;
            Some(self.curr)
        } else {
            let result = self.curr;

            for i in 0..3 {
                if self.curr[i] < self.end[i] {
                    self.curr[i] += 1;
                    break;
                }

                self.curr[i] = self.start[i];
            }

            Some(result)
        }
    }
}
