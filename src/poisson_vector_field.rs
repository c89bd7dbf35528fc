use crate::basis::{Basis, IntegralTable};
use crate::hash_tree::{sample_level, splat_on_level, HashTree, Side};
use crate::hgrid::CellRangeIterator;
use crate::{Error, Real, Result};
use itertools::multizip;
use na::{DVector, Point3, Vector3};
use rayon::prelude::*;

/// Per-sample density estimates, and the level each sample is splatted on.
///
/// A sample lives on the finest regular level, unless it falls inside a voxel of
/// the adaptive refinement level.
#[derive(Clone, Debug)]
pub struct PoissonVectorField {
    pub(crate) depths: Vec<usize>,
    pub(crate) densities: Vec<Real>,
    pub(crate) areas: Vec<Real>,
}

/// Splatted normals, one buffer per level holding samples.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalField {
    /// `(depth, per-decoder-voxel normal)` pairs.
    pub levels: Vec<(usize, Vec<Vector3<Real>>)>,
}

impl PoissonVectorField {
    pub fn new(tree: &HashTree, basis: &Basis, points: &[Point3<Real>]) -> Result<Self> {
        let regular = tree.config().depth - 1;
        let refined = tree.finest_depth();
        let refined_level = tree.level(Side::Encoder, refined)?;

        let depths: Vec<usize> = points
            .par_iter()
            .map(|pt| {
                if refined > regular && refined_level.contains(&refined_level.key(pt)) {
                    refined
                } else {
                    regular
                }
            })
            .collect();

        let mut densities = vec![0.0; points.len()];

        for depth in regular..=refined {
            let level = tree.level(Side::Decoder, depth)?;
            let (ids, pts): (Vec<usize>, Vec<Point3<Real>>) = points
                .iter()
                .enumerate()
                .filter(|(id, _)| depths[*id] == depth)
                .map(|(id, pt)| (id, *pt))
                .unzip();
            let ones = vec![1.0; pts.len()];
            let splat_values = splat_on_level(level, basis, &pts, &ones);

            for (id, pt) in ids.iter().zip(pts.iter()) {
                densities[*id] = sample_level(level, basis, &splat_values, pt);
            }
        }

        if let Some(id) = densities.iter().position(|d| !(*d > 0.0)) {
            // Only possible if the decoder does not cover the support of the sample.
            let level = tree.level(Side::Decoder, depths[id])?;
            return Err(Error::NotFound {
                depth: depths[id],
                coord: level.key(&points[id]).coords.into(),
            });
        }

        let areas = depths
            .iter()
            .zip(densities.iter())
            .map(|(depth, density)| tree.voxel_width(*depth).powi(2) / *density)
            .collect();

        Ok(Self {
            depths,
            densities,
            areas,
        })
    }

    /// Estimated surface area represented by each sample.
    pub fn areas(&self) -> &[Real] {
        &self.areas
    }

    /// Inverse local density, normalized so that the weights average to one.
    pub fn sample_weights(&self) -> Vec<Real> {
        let avg_density =
            self.densities.iter().copied().sum::<Real>() / (self.densities.len() as Real);
        self.densities.iter().map(|d| avg_density / *d).collect()
    }

    pub fn area_approximation(&self) -> Real {
        self.areas.iter().sum()
    }

    /// Splats `normals`, weighted by the sample areas, on the level of each sample.
    ///
    /// The resulting vector field `V = Σ n_k B_k` integrates each normal over
    /// the area of its sample.
    pub fn splat_normals(
        &self,
        tree: &HashTree,
        basis: &Basis,
        points: &[Point3<Real>],
        normals: &[Vector3<Real>],
    ) -> Result<NormalField> {
        if normals.len() != points.len() || points.len() != self.depths.len() {
            return Err(Error::LengthMismatch {
                what: "normals",
                expected: self.depths.len(),
                got: normals.len().min(points.len()),
            });
        }

        let mut depths = self.depths.clone();
        depths.sort_unstable();
        depths.dedup();

        let mut levels = vec![];

        for depth in depths {
            let level = tree.level(Side::Decoder, depth)?;
            let width = tree.voxel_width(depth);
            let (pts, vals): (Vec<_>, Vec<_>) =
                multizip((points, normals, &self.depths, &self.areas))
                    .filter(|(_, _, d, _)| **d == depth)
                    .map(|(pt, n, _, area)| (*pt, *n * (*area / width.powi(3))))
                    .unzip();
            levels.push((depth, splat_on_level(level, basis, &pts, &vals)));
        }

        Ok(NormalField { levels })
    }

    /// Right-hand side `b_d,i = ∫ ∇B_d,i · V` of every level of the decoder.
    ///
    /// `tables[k]` must hold the integrals between levels `k` apart.
    pub fn divergence_rhs(
        tree: &HashTree,
        tables: &[IntegralTable],
        field: &NormalField,
    ) -> Result<Vec<DVector<Real>>> {
        let mut result = (0..tree.num_levels())
            .map(|depth| Ok(DVector::zeros(tree.level(Side::Decoder, depth)?.len())))
            .collect::<Result<Vec<_>>>()?;

        for (data_depth, normals) in &field.levels {
            let data_level = tree.level(Side::Decoder, *data_depth)?;
            if normals.len() != data_level.len() {
                return Err(Error::LengthMismatch {
                    what: "splatted normals",
                    expected: data_level.len(),
                    got: normals.len(),
                });
            }

            for (test_depth, rhs) in result.iter_mut().enumerate() {
                let test_level = tree.level(Side::Decoder, test_depth)?;

                if test_depth <= *data_depth {
                    // The test basis is coarser: scatter from each data voxel.
                    let table = &tables[*data_depth - test_depth];
                    let factor = tree.voxel_width(*data_depth).powi(2);
                    let len = test_level.len();

                    let contrib = data_level
                        .cells()
                        .par_iter()
                        .zip(normals.par_iter())
                        .filter(|(_, n)| **n != Vector3::zeros())
                        .fold(
                            || vec![0.0; len],
                            |mut acc, (cell, n)| {
                                let start = cell.map(|e| *table.coarse_range(e).start());
                                let end = cell.map(|e| *table.coarse_range(e).end());

                                for coarse in CellRangeIterator::new(start, end) {
                                    if let Some(id) = test_level.get(&coarse) {
                                        let o = cell - coarse * table.scale();
                                        acc[id] += factor * table.divergence(&o, n);
                                    }
                                }
                                acc
                            },
                        )
                        .reduce(
                            || vec![0.0; len],
                            |mut lhs, rhs| {
                                for (l, r) in lhs.iter_mut().zip(rhs) {
                                    *l += r;
                                }
                                lhs
                            },
                        );

                    for (r, c) in rhs.iter_mut().zip(contrib) {
                        *r += c;
                    }
                } else {
                    // The test basis is finer: gather from the coarse data voxels.
                    let table = &tables[test_depth - *data_depth];
                    let factor = tree.voxel_width(test_depth).powi(2);

                    rhs.as_mut_slice()
                        .par_iter_mut()
                        .zip(test_level.cells().par_iter())
                        .for_each(|(rhs, cell)| {
                            let start = cell.map(|e| *table.coarse_range(e).start());
                            let end = cell.map(|e| *table.coarse_range(e).end());

                            for coarse in CellRangeIterator::new(start, end) {
                                if let Some(id) = data_level.get(&coarse) {
                                    let o = cell - coarse * table.scale();
                                    *rhs += factor * table.divergence_fine(&o, &normals[id]);
                                }
                            }
                        });
                }
            }
        }

        Ok(result)
    }
}
