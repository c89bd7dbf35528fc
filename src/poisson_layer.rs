use crate::basis::{Basis, BasisFunction, IntegralTable};
use crate::conjugate_gradient::inverse_diagonal;
use crate::hash_tree::{for_each_supporting_cell, splat_on_level, HashTree, Side};
use crate::hgrid::{CellRangeIterator, DeterministicState, HGrid};
use crate::{Real, Result};
use na::{DVector, Point3};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use rayon::prelude::*;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;

/// The screening term `α Σ_p w_p χ(p)²` of the energy.
#[derive(Clone, Debug)]
pub(crate) struct Screening {
    pub alpha: Real,
    pub points: Vec<Point3<Real>>,
    /// `α * area` of each sample.
    pub weights: Vec<Real>,
    /// Identifies the samples and weights a level system was assembled with.
    pub key: u64,
}

impl Screening {
    pub fn new(alpha: Real, points: Vec<Point3<Real>>, areas: &[Real]) -> Self {
        let weights: Vec<Real> = areas.iter().map(|a| alpha * *a).collect();
        let mut hasher = DeterministicState.build_hasher();
        hasher.write_u64(alpha.to_bits());
        for (pt, w) in points.iter().zip(weights.iter()) {
            hasher.write_u64(pt.x.to_bits());
            hasher.write_u64(pt.y.to_bits());
            hasher.write_u64(pt.z.to_bits());
            hasher.write_u64(w.to_bits());
        }

        Self {
            alpha,
            points,
            weights,
            key: hasher.finish(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.alpha != 0.0 && !self.points.is_empty()
    }
}

/// The screening samples bucketed by the voxel containing them on one level.
struct SampleBuckets {
    grid: HGrid,
    members: Vec<Vec<usize>>,
}

impl SampleBuckets {
    fn new(cell_width: Real, points: &[Point3<Real>]) -> Self {
        let mut grid = HGrid::new(cell_width);
        let mut members: Vec<Vec<usize>> = vec![];

        for (pid, pt) in points.iter().enumerate() {
            let (id, inserted) = grid.insert(grid.key(pt));
            if inserted {
                members.push(vec![]);
            }
            members[id].push(pid);
        }

        Self { grid, members }
    }

    /// Samples located in the voxels within `radius` of `cell`.
    fn around(&self, cell: Point3<i64>, radius: i64) -> impl Iterator<Item = usize> + '_ {
        CellRangeIterator::with_center(cell, radius)
            .filter_map(|adj| self.grid.get(&adj))
            .flat_map(|id| self.members[id].iter().copied())
    }
}

/// The sparse linear system of one level: stiffness plus screening.
///
/// Rows and columns follow the dense numbering of the decoder voxels of the
/// level. The matrix is symmetric positive semi-definite, and definite as soon
/// as screening is active.
#[derive(Clone, Debug)]
pub struct LevelSystem {
    depth: usize,
    matrix: CsrMatrix<Real>,
    inv_diagonal: DVector<Real>,
    screening_key: u64,
}

impl LevelSystem {
    pub(crate) fn assemble(
        tree: &HashTree,
        depth: usize,
        basis: &Basis,
        table: &IntegralTable,
        screening: &Screening,
    ) -> Result<Self> {
        let level = tree.level(Side::Decoder, depth)?;
        let cell_width = level.cell_width();
        let stencil = basis.stencil_radius();
        // Offsets between a voxel and the voxels containing the samples it supports.
        let sample_reach = (basis.support_radius() - 0.5).ceil() as i64;
        let buckets = screening
            .is_active()
            .then(|| SampleBuckets::new(cell_width, &screening.points));

        let rows: Vec<Vec<(usize, Real)>> = level
            .cells()
            .par_iter()
            .map(|cell| {
                let mut entries: Vec<(usize, Real)> = level
                    .neighbor_cells(cell, stencil)
                    .map(|(other, j)| (j, cell_width * table.stiffness(&(cell - other))))
                    .collect();
                entries.sort_unstable_by_key(|e| e.0);

                if let Some(buckets) = &buckets {
                    for pid in buckets.around(*cell, sample_reach) {
                        let pt = &screening.points[pid];
                        let w_row = basis.weight(&(level.local_coords(pt) - cell.coords.cast()));
                        if w_row == 0.0 {
                            continue;
                        }

                        let factor = screening.weights[pid] * w_row;
                        for_each_supporting_cell(level, basis, pt, |j, _, delta| {
                            if let Ok(pos) = entries.binary_search_by_key(&j, |e| e.0) {
                                entries[pos].1 += factor * basis.weight(&delta);
                            }
                        });
                    }
                }

                entries
            })
            .collect();

        let mut coo = CooMatrix::new(level.len(), level.len());
        for (i, row) in rows.iter().enumerate() {
            for (j, val) in row {
                coo.push(i, *j, *val);
            }
        }

        let matrix = CsrMatrix::from(&coo);
        let inv_diagonal = inverse_diagonal(&matrix);
        log::debug!(
            "level {depth}: assembled {} unknowns, {} non-zeros",
            matrix.nrows(),
            matrix.nnz()
        );

        Ok(Self {
            depth,
            matrix,
            inv_diagonal,
            screening_key: screening.key,
        })
    }

    /// The level this system was assembled for.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The system matrix.
    pub fn matrix(&self) -> &CsrMatrix<Real> {
        &self.matrix
    }

    /// Jacobi preconditioner of the system matrix.
    pub fn inverse_diagonal(&self) -> &DVector<Real> {
        &self.inv_diagonal
    }

    pub(crate) fn screening_key(&self) -> u64 {
        self.screening_key
    }
}

/// `Σ_{d' < depth} K_{depth,d'} x_{d'}`: the stiffness coupling between the
/// voxels of `depth` and the solutions of every coarser level.
pub(crate) fn coarse_stiffness_correction(
    tree: &HashTree,
    depth: usize,
    tables: &[IntegralTable],
    coefficients: &[Arc<DVector<Real>>],
) -> Result<DVector<Real>> {
    let level = tree.level(Side::Decoder, depth)?;
    let cell_width = level.cell_width();
    let mut result = DVector::zeros(level.len());

    for (coarse_depth, coarse_coeffs) in coefficients.iter().enumerate().take(depth) {
        if coarse_coeffs.iter().all(|c| *c == 0.0) {
            continue;
        }

        let coarse_level = tree.level(Side::Decoder, coarse_depth)?;
        let table = &tables[depth - coarse_depth];

        result
            .as_mut_slice()
            .par_iter_mut()
            .zip(level.cells().par_iter())
            .for_each(|(out, cell)| {
                let start = cell.map(|e| *table.coarse_range(e).start());
                let end = cell.map(|e| *table.coarse_range(e).end());

                for coarse in CellRangeIterator::new(start, end) {
                    if let Some(id) = coarse_level.get(&coarse) {
                        let o = cell - coarse * table.scale();
                        *out += cell_width * table.stiffness(&o) * coarse_coeffs[id];
                    }
                }
            });
    }

    Ok(result)
}

/// `α Σ_p w_p B_i(p) χ_coarse(p)`: the screening coupling between the voxels of
/// one level and the implicit function accumulated over the coarser levels,
/// given its values at the screening samples.
pub(crate) fn coarse_screening_correction(
    level: &HGrid,
    basis: &Basis,
    screening: &Screening,
    coarse_chi: &[Real],
) -> DVector<Real> {
    if !screening.is_active() {
        return DVector::zeros(level.len());
    }

    let values: Vec<Real> = screening
        .weights
        .iter()
        .zip(coarse_chi.iter())
        .map(|(w, chi)| *w * *chi)
        .collect();
    DVector::from_vec(splat_on_level(level, basis, &screening.points, &values))
}

#[cfg(test)]
mod test {
    use super::{coarse_screening_correction, coarse_stiffness_correction, LevelSystem, Screening};
    use crate::basis::{Basis, BasisFunction};
    use crate::config::HashTreeConfig;
    use crate::hash_tree::{HashTree, Side};
    use crate::point_cloud::PointCloud;
    use approx::assert_relative_eq;
    use na::{DMatrix, DVector, Point3};
    use std::sync::Arc;

    fn tree_and_points() -> (HashTree, Vec<Point3<f64>>) {
        let points: Vec<_> = (0..60)
            .map(|i| {
                let t = i as f64 * 0.1;
                Point3::new(t.cos() * 0.4, t.sin() * 0.4, 0.05 * (t * 3.0).sin())
            })
            .collect();
        let cloud = PointCloud::new(points.clone(), None).unwrap();
        let config = HashTreeConfig {
            voxel_size: 0.1,
            depth: 3,
            min_density: None,
        };
        let mut tree = HashTree::build(&cloud, &config).unwrap();
        tree.reflect_decoder(&Basis::BEZIER);
        (tree, points)
    }

    fn areas(n: usize) -> Vec<f64> {
        vec![0.01; n]
    }

    #[test]
    fn system_is_symmetric_with_positive_diagonal() {
        let (tree, points) = tree_and_points();
        let basis = Basis::BEZIER;
        let table = basis.integral_table(0);
        let screening = Screening::new(4.0, points.clone(), &areas(points.len()));
        let system = LevelSystem::assemble(&tree, 2, &basis, &table, &screening).unwrap();

        let dense = DMatrix::from(system.matrix());
        assert_eq!(dense.nrows(), tree.level(Side::Decoder, 2).unwrap().len());
        assert_relative_eq!(dense, dense.transpose(), epsilon = 1.0e-12);
        assert!(dense.diagonal().iter().all(|d| *d > 0.0));
    }

    #[test]
    fn screening_adds_the_sample_outer_products() {
        let (tree, points) = tree_and_points();
        let basis = Basis::BEZIER;
        let table = basis.integral_table(0);
        let no_screen = Screening::new(0.0, points.clone(), &areas(points.len()));
        let screen = Screening::new(2.0, points.clone(), &areas(points.len()));
        let k = LevelSystem::assemble(&tree, 1, &basis, &table, &no_screen).unwrap();
        let a = LevelSystem::assemble(&tree, 1, &basis, &table, &screen).unwrap();
        assert_ne!(k.screening_key(), a.screening_key());

        // x^T (A - K) x == α Σ_p w_p χ(p)² for χ = Σ x_i B_i.
        let level = tree.level(Side::Decoder, 1).unwrap();
        let x = DVector::from_fn(level.len(), |i, _| ((i * 7) % 5) as f64 - 2.0);
        let diff = DMatrix::from(a.matrix()) - DMatrix::from(k.matrix());
        let quad = x.dot(&(&diff * &x));

        let expected: f64 = points
            .iter()
            .map(|pt| {
                let chi = tree
                    .sample(&basis, Side::Decoder, 1, x.as_slice(), pt)
                    .unwrap();
                2.0 * 0.01 * chi * chi
            })
            .sum();
        assert_relative_eq!(quad, expected, max_relative = 1.0e-9);
    }

    #[test]
    fn stiffness_annihilates_constants() {
        let (tree, points) = tree_and_points();
        let basis = Basis::BEZIER;
        let table = basis.integral_table(0);
        let screening = Screening::new(0.0, points, &[]);
        let system = LevelSystem::assemble(&tree, 1, &basis, &table, &screening).unwrap();
        let level = tree.level(Side::Decoder, 1).unwrap();

        // Rows whose full stencil is present see a constant function as flat.
        let ones = DVector::repeat(level.len(), 1.0);
        let product = DMatrix::from(system.matrix()) * ones;
        for (i, cell) in level.cells().iter().enumerate() {
            if tree.level(Side::Encoder, 1).unwrap().contains(cell) {
                assert_relative_eq!(product[i], 0.0, epsilon = 1.0e-12);
            }
        }
    }

    #[test]
    fn coarse_corrections_vanish_for_zero_coefficients() {
        let (tree, points) = tree_and_points();
        let basis = Basis::BEZIER;
        let tables: Vec<_> = (0..tree.num_levels())
            .map(|gap| basis.integral_table(gap))
            .collect();
        let coeffs: Vec<_> = (0..tree.num_levels())
            .map(|d| Arc::new(DVector::zeros(tree.level(Side::Decoder, d).unwrap().len())))
            .collect();

        let correction = coarse_stiffness_correction(&tree, 2, &tables, &coeffs).unwrap();
        assert_eq!(correction, DVector::zeros(correction.len()));

        let screening = Screening::new(1.0, points.clone(), &areas(points.len()));
        let level = tree.level(Side::Decoder, 2).unwrap();
        let correction =
            coarse_screening_correction(level, &basis, &screening, &vec![0.0; points.len()]);
        assert_eq!(correction, DVector::zeros(level.len()));
    }

    #[test]
    fn constant_coarse_solution_has_no_stiffness_coupling() {
        let (tree, _) = tree_and_points();
        let basis = Basis::BEZIER;
        let tables: Vec<_> = (0..tree.num_levels())
            .map(|gap| basis.integral_table(gap))
            .collect();
        let coeffs: Vec<_> = (0..tree.num_levels())
            .map(|d| Arc::new(DVector::repeat(tree.level(Side::Decoder, d).unwrap().len(), 1.0)))
            .collect();

        // A coarse constant function has no gradient, hence no coupling with
        // the fine voxels whose support is covered by the coarse levels.
        let correction = coarse_stiffness_correction(&tree, 2, &tables, &coeffs).unwrap();
        let encoder = tree.level(Side::Encoder, 2).unwrap();
        let decoder = tree.level(Side::Decoder, 2).unwrap();
        for (i, cell) in decoder.cells().iter().enumerate() {
            if encoder.contains(cell) {
                assert_relative_eq!(correction[i], 0.0, epsilon = 1.0e-12);
            }
        }
    }
}
