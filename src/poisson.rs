use crate::config::{HashTreeConfig, ReconstructionConfig};
use crate::hash_tree::{HashTree, Side};
use crate::point_cloud::PointCloud;
use crate::reconstructor::{Reconstructor, SolveParams, SolveReport};
use crate::{Error, Real, Result};
use na::{Point3, Vector3};
use parry::bounding_volume::Aabb;
use std::sync::Arc;

/// An implicit surface reconstructed with the Screened Poisson reconstruction algorithm.
#[derive(Clone, Debug)]
pub struct PoissonReconstruction {
    reconstructor: Reconstructor,
    report: SolveReport,
    aabb: Aabb,
}

impl PoissonReconstruction {
    /// Reconstruct a surface from an oriented point cloud.
    ///
    /// Builds the hash tree, pads its decoder side for `config.basis`, then
    /// solves every level, coarse to fine. A level that does not reach the
    /// solver tolerance is not an error: check [`Self::solve_report`].
    pub fn from_point_cloud(cloud: &PointCloud, config: &ReconstructionConfig) -> Result<Self> {
        config.validate()?;
        let normals = cloud.normals().ok_or_else(|| {
            Error::InvalidGeometry("the point cloud must carry one normal per point".to_string())
        })?;

        let mut tree = HashTree::build(cloud, &config.tree)?;
        tree.reflect_decoder(&config.basis);
        let tree = Arc::new(tree);

        let mut reconstructor = Reconstructor::new(tree.clone(), config.basis, cloud.points())?;
        let rhs = reconstructor.divergence_rhs(normals)?;
        let params = SolveParams {
            finest_depth: tree.finest_depth(),
            coarsest_depth: 0,
            screen_alpha: config.screen_alpha,
            screen_xyz: config.screen_xyz.as_deref(),
            solver: config.solver,
        };
        let report = reconstructor.solve_multigrid(&rhs, &params)?;

        Ok(Self {
            reconstructor,
            report,
            aabb: tree.aabb(),
        })
    }

    /// Reconstruct a surface using the Screened Poisson reconstruction algorithm,
    /// given a set of sample points and normals at these points.
    ///
    /// # Parameters
    /// - `points`: the sample points.
    /// - `normals`: the normals at the sample points. Must have the same length as `points`.
    /// - `screening`: the screening coefficient. Larger values increase the fitting of the
    ///   reconstructed surface relative to the sample point’s positions. Setting this to `0.0`
    ///   disables screening.
    /// - `voxel_size`: the width of the finest grid cells.
    /// - `depth`: the number of levels of the multigrid solver.
    /// - `max_relaxation_iters`: the maximum number of iterations of the
    ///   conjugate-gradient solver on each level.
    pub fn from_points_and_normals(
        points: &[Point3<Real>],
        normals: &[Vector3<Real>],
        screening: Real,
        voxel_size: Real,
        depth: usize,
        max_relaxation_iters: usize,
    ) -> Result<Self> {
        let cloud = PointCloud::with_normals(points.to_vec(), normals.to_vec())?;
        let mut config = ReconstructionConfig {
            tree: HashTreeConfig {
                voxel_size,
                depth,
                min_density: None,
            },
            screen_alpha: screening,
            ..Default::default()
        };
        config.solver.max_iterations = max_relaxation_iters;
        Self::from_point_cloud(&cloud, &config)
    }

    /// The domain where the surface’s implicit function is defined.
    pub fn aabb(&self) -> &Aabb {
        &self.aabb
    }

    /// Does the given AABB intersect any of the smallest regular grid cells of the reconstruction?
    pub fn leaf_cells_intersect_aabb(&self, aabb: &Aabb) -> bool {
        let tree = self.reconstructor.tree();
        let leaf_depth = tree.config().depth - 1;

        tree.level(Side::Decoder, leaf_depth)
            .map(|level| {
                level
                    .cells_intersecting_aabb(&aabb.mins, &aabb.maxs)
                    .next()
                    .is_some()
            })
            .unwrap_or(false)
    }

    /// Evaluates the value of the implicit function at the given 3D point.
    ///
    /// The reconstructed surface is the zero level set of this function. In
    /// order to get a meaningful value, the point must be located inside of
    /// [`Self::aabb`].
    pub fn eval(&self, pt: &Point3<Real>) -> Real {
        self.reconstructor.chi_at(pt) - self.reconstructor.isovalue()
    }

    /// Evaluates the value of the implicit function’s gradient at the given 3D point.
    ///
    /// In order to get a meaningful value, the point must be located inside of [`Self::aabb`].
    pub fn eval_gradient(&self, pt: &Point3<Real>) -> Vector3<Real> {
        self.reconstructor.gradient_at(pt)
    }

    /// Convergence diagnostic of every level.
    pub fn solve_report(&self) -> &SolveReport {
        &self.report
    }

    /// The underlying solver, for access to the coefficients and the level systems.
    pub fn reconstructor(&self) -> &Reconstructor {
        &self.reconstructor
    }
}
