//! The adaptive sparse voxel hierarchy.
//!
//! Level `0` is the coarsest. Every level stores its occupied voxels in an
//! [`HGrid`]; voxel coordinates are absolute (the grids of all levels are
//! anchored at the world origin), so the parent of a voxel is obtained by
//! halving its coordinates.

use crate::basis::{Basis, BasisFunction};
use crate::config::HashTreeConfig;
use crate::hgrid::{CellRangeIterator, HGrid};
use crate::point_cloud::PointCloud;
use crate::transfer::{child_cell, parent_cell, LevelTransfer};
use crate::{Error, Real, Result};
use na::{Point3, Vector3};
use parry::bounding_volume::{Aabb, BoundingVolume};
use rayon::prelude::*;
use std::ops::{AddAssign, Mul};

// Minimum number of points handled by one rayon job when splatting.
const SPLAT_CHUNK: usize = 1024;

/// One of the two labelings of the hierarchy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// Voxels occupied by at least one input point.
    Encoder,
    /// Encoder voxels padded with everything the basis support and the solver stencil reach.
    Decoder,
}

/// An occupied voxel together with its dense index on its level.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VoxelRef {
    /// Level of the voxel.
    pub depth: usize,
    /// Integer coordinates of the voxel on its level.
    pub coord: Point3<i64>,
    /// Dense index of the voxel on its level.
    pub index: usize,
}

/// Hierarchical sparse grid built from a point cloud.
///
/// The topology is fixed once [`HashTree::reflect_decoder`] has run; it can then
/// be shared read-only by any number of reconstructors.
#[derive(Clone, Debug)]
pub struct HashTree {
    config: HashTreeConfig,
    encoder: Vec<HGrid>,
    decoder: Vec<HGrid>,
    point_counts: Vec<Vec<Real>>,
    reflection_radius: Option<i64>,
}

impl HashTree {
    /// Builds the encoder hierarchy of `cloud`.
    ///
    /// The decoder side starts as a copy of the encoder side; call
    /// [`Self::reflect_decoder`] before assembling a Poisson system on it.
    pub fn build(cloud: &PointCloud, config: &HashTreeConfig) -> Result<Self> {
        config.validate()?;
        let points = cloud.points();
        let finest = config.depth - 1;
        let width = |depth: usize| level_width(config, depth);

        let mut encoder = vec![occupied_cells(points, width(finest))];
        let mut point_counts = vec![count_points(&encoder[0], points)];

        for depth in (0..finest).rev() {
            let fine = &encoder[encoder.len() - 1];
            let coarse = HGrid::from_cells(
                width(depth),
                sorted_unique(fine.cells().par_iter().map(parent_cell).collect()),
            );
            let transfer = LevelTransfer::new(&coarse, fine, depth + 1)?;
            let counts = transfer.restrict(&point_counts[point_counts.len() - 1])?;
            encoder.push(coarse);
            point_counts.push(counts);
        }

        encoder.reverse();
        point_counts.reverse();

        if let Some(min_density) = config.min_density {
            let dense: Vec<Real> = point_counts[finest]
                .iter()
                .map(|count| if *count >= min_density { 1.0 } else { 0.0 })
                .collect();

            if dense.iter().any(|flag| *flag != 0.0) {
                let candidates = occupied_cells(points, width(finest + 1));
                let transfer = LevelTransfer::new(&encoder[finest], &candidates, finest + 1)?;
                let flags = transfer.prolong(&dense)?;
                let refined = HGrid::from_cells(
                    width(finest + 1),
                    candidates
                        .cells()
                        .iter()
                        .zip(flags.iter())
                        .filter(|(_, flag)| **flag != 0.0)
                        .map(|(cell, _)| *cell),
                );
                let counts = count_points(&refined, points);
                log::debug!(
                    "adaptive refinement: {} of {} finest voxels refined into {} voxels",
                    dense.iter().filter(|flag| **flag != 0.0).count(),
                    dense.len(),
                    refined.len()
                );
                encoder.push(refined);
                point_counts.push(counts);
            }
        }

        for (depth, level) in encoder.iter().enumerate() {
            log::debug!(
                "hash tree level {depth}: {} encoder voxels of width {}",
                level.len(),
                level.cell_width()
            );
        }

        Ok(Self {
            config: config.clone(),
            decoder: encoder.clone(),
            encoder,
            point_counts,
            reflection_radius: None,
        })
    }

    /// Pads the decoder side so that every voxel whose basis support reaches an
    /// encoder voxel, and every parent of a decoder voxel, is present.
    ///
    /// The decoder side is always recomputed from the encoder side, so calling
    /// this twice with the same basis has no effect.
    pub fn reflect_decoder(&mut self, basis: &Basis) {
        let radius = basis.stencil_radius();

        if self.reflection_radius == Some(radius) {
            return;
        }

        let mut decoder: Vec<HGrid> = Vec::with_capacity(self.encoder.len());

        for depth in (0..self.encoder.len()).rev() {
            let encoder = &self.encoder[depth];
            let mut cells: Vec<_> = encoder
                .cells()
                .par_iter()
                .flat_map_iter(|cell| CellRangeIterator::with_center(*cell, radius))
                .collect();

            if let Some(finer) = decoder.last() {
                cells.extend(finer.cells().iter().map(parent_cell));
            }

            let level = HGrid::from_cells(encoder.cell_width(), sorted_unique(cells));
            log::debug!(
                "decoder level {depth}: {} voxels ({} encoder voxels, padding {radius})",
                level.len(),
                encoder.len()
            );
            decoder.push(level);
        }

        decoder.reverse();
        self.decoder = decoder;
        self.reflection_radius = Some(radius);
    }

    /// Has [`Self::reflect_decoder`] been called?
    pub fn is_reflected(&self) -> bool {
        self.reflection_radius.is_some()
    }

    /// Padding radius, in voxels, of the last decoder reflection.
    pub fn reflection_radius(&self) -> Option<i64> {
        self.reflection_radius
    }

    /// The configuration this tree was built with.
    pub fn config(&self) -> &HashTreeConfig {
        &self.config
    }

    /// Number of levels, including the adaptive refinement level if any.
    pub fn num_levels(&self) -> usize {
        self.encoder.len()
    }

    /// Index of the finest level.
    pub fn finest_depth(&self) -> usize {
        self.encoder.len() - 1
    }

    /// Width of the voxels at `depth`.
    pub fn voxel_width(&self, depth: usize) -> Real {
        level_width(&self.config, depth)
    }

    /// The grid of one level.
    pub fn level(&self, side: Side, depth: usize) -> Result<&HGrid> {
        let levels = match side {
            Side::Encoder => &self.encoder,
            Side::Decoder => &self.decoder,
        };
        levels.get(depth).ok_or(Error::DepthOutOfRange {
            depth,
            levels: levels.len(),
        })
    }

    /// Number of input points inside each encoder voxel at `depth`.
    pub fn point_counts(&self, depth: usize) -> Result<&[Real]> {
        self.point_counts
            .get(depth)
            .map(|counts| &counts[..])
            .ok_or(Error::DepthOutOfRange {
                depth,
                levels: self.point_counts.len(),
            })
    }

    /// Dense index of `coord` at `depth`.
    pub fn index_of(&self, side: Side, depth: usize, coord: &Point3<i64>) -> Result<usize> {
        self.level(side, depth)?
            .get(coord)
            .ok_or(Error::NotFound {
                depth,
                coord: coord.coords.into(),
            })
    }

    /// Is `coord` occupied at `depth`?
    pub fn contains(&self, side: Side, depth: usize, coord: &Point3<i64>) -> bool {
        self.level(side, depth)
            .map(|level| level.contains(coord))
            .unwrap_or(false)
    }

    /// The voxel containing `pt` at `depth`.
    pub fn voxel_containing(
        &self,
        side: Side,
        depth: usize,
        pt: &Point3<Real>,
    ) -> Result<VoxelRef> {
        let coord = self.level(side, depth)?.key(pt);
        let index = self.index_of(side, depth, &coord)?;
        Ok(VoxelRef {
            depth,
            coord,
            index,
        })
    }

    /// The parent of the occupied voxel `coord`, or `None` at the root level.
    pub fn parent(
        &self,
        side: Side,
        depth: usize,
        coord: &Point3<i64>,
    ) -> Result<Option<VoxelRef>> {
        let _ = self.index_of(side, depth, coord)?;

        if depth == 0 {
            return Ok(None);
        }

        let parent = parent_cell(coord);
        let index = self.index_of(side, depth - 1, &parent)?;
        Ok(Some(VoxelRef {
            depth: depth - 1,
            coord: parent,
            index,
        }))
    }

    /// The occupied children of the occupied voxel `coord`.
    pub fn children(
        &self,
        side: Side,
        depth: usize,
        coord: &Point3<i64>,
    ) -> Result<Vec<VoxelRef>> {
        let _ = self.index_of(side, depth, coord)?;

        let Ok(finer) = self.level(side, depth + 1) else {
            return Ok(vec![]);
        };

        Ok((0..8)
            .filter_map(|octant| {
                let child = child_cell(coord, octant);
                finer.get(&child).map(|index| VoxelRef {
                    depth: depth + 1,
                    coord: child,
                    index,
                })
            })
            .collect())
    }

    /// The occupied voxels within `radius` voxels (per axis) of the occupied voxel `coord`.
    ///
    /// The voxel itself is included.
    pub fn neighbors(
        &self,
        side: Side,
        depth: usize,
        coord: &Point3<i64>,
        radius: i64,
    ) -> Result<Vec<VoxelRef>> {
        let _ = self.index_of(side, depth, coord)?;
        let level = self.level(side, depth)?;

        Ok(level
            .neighbor_cells(coord, radius)
            .map(|(coord, index)| VoxelRef {
                depth,
                coord,
                index,
            })
            .collect())
    }

    /// Child-to-parent map between `depth` and `depth + 1` on one side.
    pub fn transfer(&self, side: Side, depth: usize) -> Result<LevelTransfer> {
        LevelTransfer::new(
            self.level(side, depth)?,
            self.level(side, depth + 1)?,
            depth + 1,
        )
    }

    /// Distributes per-point `values` onto the voxels of one level.
    ///
    /// Each point adds `basis(Δ) * value` to every voxel of the level whose
    /// basis support contains it. Contributions accumulate, so the result does
    /// not depend on the order of the points (up to rounding). Supporting voxels
    /// absent from the level are skipped.
    pub fn splat<T>(
        &self,
        basis: &Basis,
        side: Side,
        depth: usize,
        points: &[Point3<Real>],
        values: &[T],
    ) -> Result<Vec<T>>
    where
        T: Copy + Default + AddAssign + Mul<Real, Output = T> + Send + Sync,
    {
        let level = self.level(side, depth)?;

        if values.len() != points.len() {
            return Err(Error::LengthMismatch {
                what: "splatted values",
                expected: points.len(),
                got: values.len(),
            });
        }

        Ok(splat_on_level(level, basis, points, values))
    }

    /// Evaluates `Σ buffer[v] * basis(pt - v)` over the voxels `v` of one level.
    pub fn sample<T>(
        &self,
        basis: &Basis,
        side: Side,
        depth: usize,
        buffer: &[T],
        pt: &Point3<Real>,
    ) -> Result<T>
    where
        T: Copy + Default + AddAssign + Mul<Real, Output = T>,
    {
        let level = self.level(side, depth)?;

        if buffer.len() != level.len() {
            return Err(Error::LengthMismatch {
                what: "sampled buffer",
                expected: level.len(),
                got: buffer.len(),
            });
        }

        Ok(sample_level(level, basis, buffer, pt))
    }

    /// Bounding box of every decoder voxel.
    pub fn aabb(&self) -> Aabb {
        let mut cells = self.decoder[0].cells().iter();
        let first = cells.next().map(|cell| self.decoder[0].cell_aabb(cell));

        match first {
            Some(mut aabb) => {
                for cell in cells {
                    aabb.merge(&self.decoder[0].cell_aabb(cell));
                }
                aabb
            }
            None => Aabb::new_invalid(),
        }
    }
}

fn level_width(config: &HashTreeConfig, depth: usize) -> Real {
    config.voxel_size * (2.0 as Real).powi(config.depth as i32 - 1 - depth as i32)
}

fn sorted_unique(mut cells: Vec<Point3<i64>>) -> Vec<Point3<i64>> {
    cells.par_sort_unstable_by_key(|cell| (cell.x, cell.y, cell.z));
    cells.dedup();
    cells
}

fn occupied_cells(points: &[Point3<Real>], cell_width: Real) -> HGrid {
    let quantizer = HGrid::new(cell_width);
    let cells = points.par_iter().map(|pt| quantizer.key(pt)).collect();
    HGrid::from_cells(cell_width, sorted_unique(cells))
}

fn count_points(level: &HGrid, points: &[Point3<Real>]) -> Vec<Real> {
    let mut counts = vec![0.0; level.len()];
    for pt in points {
        if let Some(id) = level.get(&level.key(pt)) {
            counts[id] += 1.0;
        }
    }
    counts
}

// Beyond this many voxels from the origin, integer voxel coordinates overflow.
const MAX_LOCAL_COORD: Real = (1i64 << 62) as Real;

/// Calls `f(index, delta)` for every voxel of `level` whose basis support contains `pt`.
///
/// `delta` is the displacement from the voxel center to `pt`, in voxel units.
/// Points too far away to be quantized, or with non-finite coordinates, have
/// no supporting voxel.
pub(crate) fn for_each_supporting_cell(
    level: &HGrid,
    basis: &Basis,
    pt: &Point3<Real>,
    mut f: impl FnMut(usize, Point3<i64>, Vector3<Real>),
) {
    let u = level.local_coords(pt);
    if !u.iter().all(|e| e.is_finite() && e.abs() < MAX_LOCAL_COORD) {
        return;
    }

    let start = Point3::new(
        *basis.support_range(u.x).start(),
        *basis.support_range(u.y).start(),
        *basis.support_range(u.z).start(),
    );
    let end = Point3::new(
        *basis.support_range(u.x).end(),
        *basis.support_range(u.y).end(),
        *basis.support_range(u.z).end(),
    );

    for cell in CellRangeIterator::new(start, end) {
        if let Some(id) = level.get(&cell) {
            f(id, cell, u - cell.coords.cast::<Real>());
        }
    }
}

pub(crate) fn splat_on_level<T>(
    level: &HGrid,
    basis: &Basis,
    points: &[Point3<Real>],
    values: &[T],
) -> Vec<T>
where
    T: Copy + Default + AddAssign + Mul<Real, Output = T> + Send + Sync,
{
    let len = level.len();

    points
        .par_iter()
        .zip(values.par_iter())
        .with_min_len(SPLAT_CHUNK)
        .fold(
            || vec![T::default(); len],
            |mut acc, (pt, val)| {
                for_each_supporting_cell(level, basis, pt, |id, _, delta| {
                    let w = basis.weight(&delta);
                    if w != 0.0 {
                        acc[id] += *val * w;
                    }
                });
                acc
            },
        )
        .reduce(
            || vec![T::default(); len],
            |mut lhs, rhs| {
                for (l, r) in lhs.iter_mut().zip(rhs) {
                    *l += r;
                }
                lhs
            },
        )
}

pub(crate) fn sample_level<T>(level: &HGrid, basis: &Basis, buffer: &[T], pt: &Point3<Real>) -> T
where
    T: Copy + Default + AddAssign + Mul<Real, Output = T>,
{
    let mut result = T::default();

    for_each_supporting_cell(level, basis, pt, |id, _, delta| {
        let w = basis.weight(&delta);
        if w != 0.0 {
            result += buffer[id] * w;
        }
    });

    result
}

/// Gradient, in world units, of `Σ buffer[v] * basis(pt - v)`.
pub(crate) fn sample_level_gradient(
    level: &HGrid,
    basis: &Basis,
    buffer: &[Real],
    pt: &Point3<Real>,
) -> Vector3<Real> {
    let mut result = Vector3::zeros();

    for_each_supporting_cell(level, basis, pt, |id, _, delta| {
        result += basis.gradient(&delta) * buffer[id];
    });

    result / level.cell_width()
}

#[cfg(test)]
mod test {
    use super::{HashTree, Side};
    use crate::basis::{Basis, BasisFunction};
    use crate::config::HashTreeConfig;
    use crate::hgrid::CellRangeIterator;
    use crate::point_cloud::PointCloud;
    use crate::Error;
    use approx::assert_relative_eq;
    use na::{point, Point3, Vector3};

    fn sphere_points(n: usize, radius: f64) -> Vec<Point3<f64>> {
        // Fibonacci sphere.
        let golden = std::f64::consts::PI * (3.0 - 5.0f64.sqrt());
        (0..n)
            .map(|i| {
                let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
                let r = (1.0 - y * y).sqrt();
                let theta = golden * i as f64;
                Point3::new(r * theta.cos(), y, r * theta.sin()) * radius
            })
            .collect()
    }

    fn sphere_tree(min_density: Option<f64>) -> (PointCloud, HashTree) {
        let cloud = PointCloud::new(sphere_points(500, 1.0), None).unwrap();
        let config = HashTreeConfig {
            voxel_size: 0.25,
            depth: 4,
            min_density,
        };
        let tree = HashTree::build(&cloud, &config).unwrap();
        (cloud, tree)
    }

    #[test]
    fn every_point_is_contained_at_every_depth() {
        let (cloud, tree) = sphere_tree(None);
        assert_eq!(tree.num_levels(), 4);

        for depth in 0..tree.num_levels() {
            let level = tree.level(Side::Encoder, depth).unwrap();
            assert_relative_eq!(level.cell_width(), 0.25 * 2.0f64.powi(3 - depth as i32));
            for pt in cloud.points() {
                assert!(level.contains(&level.key(pt)));
            }
            let total: f64 = tree.point_counts(depth).unwrap().iter().sum();
            assert_relative_eq!(total, cloud.len() as f64);
        }
    }

    #[test]
    fn every_voxel_has_its_arithmetic_parent() {
        let (_, mut tree) = sphere_tree(Some(4.0));
        tree.reflect_decoder(&Basis::BEZIER);

        for side in [Side::Encoder, Side::Decoder] {
            for depth in 1..tree.num_levels() {
                for cell in tree.level(side, depth).unwrap().cells() {
                    let parent = tree.parent(side, depth, cell).unwrap().unwrap();
                    assert_eq!(parent.coord, cell.map(|e| e.div_euclid(2)));
                    let siblings = tree.children(side, depth - 1, &parent.coord).unwrap();
                    assert!(siblings.iter().any(|c| c.coord == *cell));
                }
            }
            let root = tree.level(side, 0).unwrap().cell(0);
            assert_eq!(tree.parent(side, 0, &root).unwrap(), None);
        }
    }

    #[test]
    fn decoder_covers_basis_support_of_encoder() {
        let (_, mut tree) = sphere_tree(None);
        let basis = Basis::BEZIER;
        tree.reflect_decoder(&basis);
        let radius = basis.stencil_radius();

        for depth in 0..tree.num_levels() {
            let decoder = tree.level(Side::Decoder, depth).unwrap();
            for cell in tree.level(Side::Encoder, depth).unwrap().cells() {
                for neighbor in CellRangeIterator::with_center(*cell, radius) {
                    assert!(decoder.contains(&neighbor));
                }
            }
        }
    }

    #[test]
    fn reflection_is_idempotent() {
        let (_, mut tree) = sphere_tree(None);
        tree.reflect_decoder(&Basis::BEZIER);
        let first: Vec<_> = (0..tree.num_levels())
            .map(|d| tree.level(Side::Decoder, d).unwrap().clone())
            .collect();
        tree.reflect_decoder(&Basis::BEZIER);
        for (depth, level) in first.iter().enumerate() {
            assert_eq!(tree.level(Side::Decoder, depth).unwrap(), level);
        }
    }

    #[test]
    fn adaptive_refinement_adds_a_partial_level() {
        let mut points = sphere_points(200, 1.0);
        // A dense cluster inside a single finest voxel.
        for i in 0..20 {
            points.push(Point3::new(0.51 + 0.005 * i as f64, 0.52, 0.53));
        }
        let cloud = PointCloud::new(points, None).unwrap();
        let config = HashTreeConfig {
            voxel_size: 0.25,
            depth: 3,
            min_density: Some(15.0),
        };
        let tree = HashTree::build(&cloud, &config).unwrap();

        assert_eq!(tree.num_levels(), 4);
        let refined = tree.level(Side::Encoder, 3).unwrap();
        assert_relative_eq!(refined.cell_width(), 0.125);
        for cell in refined.cells() {
            assert_eq!(cell.map(|e| e.div_euclid(2)), point![2, 2, 2]);
        }
        assert!(refined.contains(&point![4, 4, 4]));
    }

    #[test]
    fn neighbor_and_transfer_queries() {
        let (cloud, mut tree) = sphere_tree(None);
        assert!(!tree.is_reflected());
        tree.reflect_decoder(&Basis::BEZIER);
        assert!(tree.is_reflected());
        assert_eq!(tree.reflection_radius(), Some(2));

        let voxel = tree
            .voxel_containing(Side::Encoder, 3, &cloud.points()[0])
            .unwrap();
        assert_eq!(
            tree.index_of(Side::Encoder, 3, &voxel.coord).unwrap(),
            voxel.index
        );

        // The decoder holds the whole 5x5x5 block around an encoder voxel.
        let neighbors = tree.neighbors(Side::Decoder, 3, &voxel.coord, 2).unwrap();
        assert_eq!(neighbors.len(), 125);
        assert!(neighbors.iter().any(|n| n.coord == voxel.coord));

        let transfer = tree.transfer(Side::Decoder, 2).unwrap();
        assert_eq!(transfer.fine_len(), tree.level(Side::Decoder, 3).unwrap().len());
        assert_eq!(transfer.coarse_len(), tree.level(Side::Decoder, 2).unwrap().len());
        let parent = tree.parent(Side::Decoder, 3, &voxel.coord).unwrap().unwrap();
        let fine_id = tree.index_of(Side::Decoder, 3, &voxel.coord).unwrap();
        assert_eq!(transfer.parent(fine_id), parent.index);
    }

    #[test]
    fn queries_on_unoccupied_voxels_fail() {
        let (_, tree) = sphere_tree(None);
        let far = point![1000, 0, 0];
        assert!(matches!(
            tree.index_of(Side::Encoder, 2, &far),
            Err(Error::NotFound { depth: 2, .. })
        ));
        assert!(tree.parent(Side::Encoder, 2, &far).is_err());
        assert!(tree.children(Side::Decoder, 1, &far).is_err());
        assert!(matches!(
            tree.level(Side::Encoder, 9),
            Err(Error::DepthOutOfRange { depth: 9, levels: 4 })
        ));
    }

    #[test]
    fn splat_with_tent_basis_preserves_mass() {
        let (cloud, mut tree) = sphere_tree(None);
        tree.reflect_decoder(&Basis::TENT);
        let normals: Vec<_> = cloud.points().iter().map(|p| p.coords).collect();
        let splatted = tree
            .splat(&Basis::TENT, Side::Decoder, 3, cloud.points(), &normals)
            .unwrap();

        let total: Vector3<f64> = splatted.iter().sum();
        let expected: Vector3<f64> = normals.iter().sum();
        assert_relative_eq!(total, expected, epsilon = 1.0e-9);
    }

    #[test]
    fn sample_interpolates_splatted_constant() {
        let (cloud, mut tree) = sphere_tree(None);
        tree.reflect_decoder(&Basis::BEZIER);
        let level = tree.level(Side::Decoder, 1).unwrap();
        let ones = vec![1.0; level.len()];

        // Partition of unity: every point deep inside the decoder sees 1.
        for pt in cloud.points() {
            let val = tree.sample(&Basis::BEZIER, Side::Decoder, 1, &ones, pt).unwrap();
            assert_relative_eq!(val, 1.0, epsilon = 1.0e-12);
        }
    }
}
