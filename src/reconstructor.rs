//! Screened Poisson solve over a shared [`HashTree`].
//!
//! The implicit function is `χ(x) = Σ_d Σ_i x_d,i B_d,i(x)`, summed over every
//! decoder voxel of every level. It minimizes
//! `∫|∇χ - V|² + α Σ_p a_p χ(p)²` where `V` is the splatted normal field and
//! `a_p` the area of the screening sample `p`. Levels are solved one after the
//! other, coarse to fine, each level seeing the already solved coarser levels
//! as a fixed part of `χ`.

use crate::basis::{Basis, BasisFunction, IntegralTable};
use crate::config::{validate_screen_alpha, SolverConfig, SolverKind};
use crate::conjugate_gradient::solve_conjugate_gradient;
use crate::hash_tree::{sample_level, sample_level_gradient, HashTree, Side};
use crate::poisson_layer::{
    coarse_screening_correction, coarse_stiffness_correction, LevelSystem, Screening,
};
use crate::poisson_vector_field::PoissonVectorField;
use crate::{Error, Real, Result};
use na::{DVector, Point3, Vector3};
use rayon::prelude::*;
use std::sync::Arc;

/// Lifecycle of a [`Reconstructor`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Bound to a hierarchy; nothing assembled or solved yet.
    HierarchyBound,
    /// At least one level system was assembled, no solve ran yet.
    Assembled,
    /// Coefficients are available.
    Solved,
}

/// Parameters of one [`Reconstructor::solve_multigrid`] call.
#[derive(Clone, Debug, PartialEq)]
pub struct SolveParams<'a> {
    /// Finest level solved (inclusive).
    pub finest_depth: usize,
    /// Coarsest level solved (inclusive). Levels coarser than this one keep
    /// zero coefficients.
    pub coarsest_depth: usize,
    /// Screening strength. `0.0` disables screening.
    pub screen_alpha: Real,
    /// Screening sample locations. `None` screens at the input points.
    pub screen_xyz: Option<&'a [Point3<Real>]>,
    /// Krylov method and stopping criteria of every level.
    pub solver: SolverConfig,
}

/// Convergence diagnostic of one level.
#[derive(Clone, Debug, PartialEq)]
pub struct LevelReport {
    /// The solved level.
    pub depth: usize,
    /// Number of unknowns of the level.
    pub unknowns: usize,
    /// Iterations performed.
    pub iterations: usize,
    /// Norm of the final residual.
    pub residual_norm: Real,
    /// Did the residual reach the tolerance?
    pub converged: bool,
    /// Residual norm before the first iteration, then after each iteration.
    pub residual_history: Vec<Real>,
}

/// Convergence diagnostic of a whole cascadic solve.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SolveReport {
    /// One entry per solved level, coarse to fine.
    pub levels: Vec<LevelReport>,
}

impl SolveReport {
    /// Did every level reach its tolerance?
    pub fn converged(&self) -> bool {
        self.levels.iter().all(|level| level.converged)
    }

    /// Total number of iterations over all levels.
    pub fn total_iterations(&self) -> usize {
        self.levels.iter().map(|level| level.iterations).sum()
    }

    /// Turns the first level that hit its iteration cap into an [`Error::Convergence`].
    pub fn ensure_converged(&self) -> Result<()> {
        match self.levels.iter().find(|level| !level.converged) {
            Some(level) => Err(Error::Convergence {
                depth: level.depth,
                iterations: level.iterations,
                residual: level.residual_norm,
            }),
            None => Ok(()),
        }
    }
}

/// The data produced by the last assembly and solve.
///
/// Buffers are shared, never mutated: a later assembly or solve installs new
/// buffers in the reconstructor and leaves the ones referenced here intact.
#[derive(Clone, Debug)]
pub struct ForwardTrace {
    /// Assembled system of each level, if any.
    pub systems: Vec<Option<Arc<LevelSystem>>>,
    /// Solved coefficients of each level.
    pub coefficients: Vec<Arc<DVector<Real>>>,
    /// Value of the implicit function on the reconstructed surface.
    pub isovalue: Real,
}

/// Assembles and solves the screened Poisson system of a point set.
#[derive(Clone, Debug)]
pub struct Reconstructor {
    tree: Arc<HashTree>,
    basis: Basis,
    tables: Vec<IntegralTable>,
    points: Vec<Point3<Real>>,
    field: PoissonVectorField,
    systems: Vec<Option<Arc<LevelSystem>>>,
    coefficients: Vec<Arc<DVector<Real>>>,
    isovalue: Real,
    stage: Stage,
    report: Option<SolveReport>,
}

impl Reconstructor {
    /// Binds a reconstructor to the points `points` sampled on the hierarchy `tree`.
    ///
    /// The decoder side of `tree` must have been reflected with a basis whose
    /// stencil is at least as wide as the one of `basis`.
    pub fn new(tree: Arc<HashTree>, basis: Basis, points: &[Point3<Real>]) -> Result<Self> {
        match tree.reflection_radius() {
            Some(radius) if radius >= basis.stencil_radius() => {}
            _ => return Err(Error::UnreflectedDecoder),
        }

        if points.is_empty() {
            return Err(Error::InvalidGeometry("no input points".to_string()));
        }

        let field = PoissonVectorField::new(&tree, &basis, points)?;
        let tables = (0..tree.num_levels())
            .map(|gap| basis.integral_table(gap))
            .collect();
        let coefficients = (0..tree.num_levels())
            .map(|depth| {
                Ok(Arc::new(DVector::zeros(
                    tree.level(Side::Decoder, depth)?.len(),
                )))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            systems: vec![None; tree.num_levels()],
            tree,
            basis,
            tables,
            points: points.to_vec(),
            field,
            coefficients,
            isovalue: 0.0,
            stage: Stage::HierarchyBound,
            report: None,
        })
    }

    /// The shared hierarchy.
    pub fn tree(&self) -> &Arc<HashTree> {
        &self.tree
    }

    /// The basis of every level.
    pub fn basis(&self) -> &Basis {
        &self.basis
    }

    /// Current lifecycle stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Inverse local density of each input point, normalized to average to one.
    pub fn sample_weights(&self) -> Vec<Real> {
        self.field.sample_weights()
    }

    /// Estimated surface area represented by each input point.
    pub fn sample_areas(&self) -> &[Real] {
        self.field.areas()
    }

    /// Right-hand side of every level for the oriented normals `normals` of
    /// the input points.
    pub fn divergence_rhs(&self, normals: &[Vector3<Real>]) -> Result<Vec<DVector<Real>>> {
        let field = self
            .field
            .splat_normals(&self.tree, &self.basis, &self.points, normals)?;
        PoissonVectorField::divergence_rhs(&self.tree, &self.tables, &field)
    }

    fn screening(
        &self,
        screen_alpha: Real,
        screen_xyz: Option<&[Point3<Real>]>,
    ) -> Result<Screening> {
        validate_screen_alpha(screen_alpha)?;

        match screen_xyz {
            None => Ok(Screening::new(
                screen_alpha,
                self.points.clone(),
                self.field.areas(),
            )),
            Some(samples) => {
                if samples
                    .iter()
                    .any(|pt| !pt.coords.iter().all(|e| e.is_finite()))
                {
                    return Err(Error::InvalidGeometry(
                        "screening sample with a non-finite coordinate".to_string(),
                    ));
                }
                // The explicit samples share the estimated surface area uniformly.
                let area = self.field.area_approximation() / (samples.len().max(1) as Real);
                Ok(Screening::new(
                    screen_alpha,
                    samples.to_vec(),
                    &vec![area; samples.len()],
                ))
            }
        }
    }

    fn check_depth(&self, depth: usize) -> Result<()> {
        if depth >= self.tree.num_levels() {
            return Err(Error::DepthOutOfRange {
                depth,
                levels: self.tree.num_levels(),
            });
        }
        Ok(())
    }

    /// The cached system of `depth` if it was assembled with `screening`,
    /// otherwise a freshly assembled one.
    fn system_for(&mut self, depth: usize, screening: &Screening) -> Result<Arc<LevelSystem>> {
        if let Some(system) = &self.systems[depth] {
            if system.screening_key() == screening.key {
                return Ok(system.clone());
            }
        }

        let system = Arc::new(LevelSystem::assemble(
            &self.tree,
            depth,
            &self.basis,
            &self.tables[0],
            screening,
        )?);
        self.systems[depth] = Some(system.clone());
        Ok(system)
    }

    /// Assembles the stiffness and screening matrix of the decoder voxels at `depth`.
    ///
    /// The new system replaces the cached one; the previous one stays valid for
    /// anyone still holding it.
    pub fn assemble_level(
        &mut self,
        depth: usize,
        screen_alpha: Real,
        screen_xyz: Option<&[Point3<Real>]>,
    ) -> Result<Arc<LevelSystem>> {
        self.check_depth(depth)?;
        let screening = self.screening(screen_alpha, screen_xyz)?;
        self.systems[depth] = None;
        let system = self.system_for(depth, &screening)?;

        if self.stage == Stage::HierarchyBound {
            self.stage = Stage::Assembled;
        }

        Ok(system)
    }

    /// Cascadic multigrid solve, from `coarsest_depth` to `finest_depth`.
    ///
    /// `rhs` holds one right-hand side per level of the tree, co-indexed with
    /// its decoder voxels (see [`Self::divergence_rhs`]). Each level solves for
    /// its own coefficients, the coarser solutions entering its right-hand
    /// side. Every coefficient buffer is replaced, even the ones of the levels
    /// outside of the solved range, which are reset to zero.
    ///
    /// Levels that hit their iteration cap keep their last iterate; the
    /// returned report tells which ones (see [`SolveReport::ensure_converged`]).
    pub fn solve_multigrid(
        &mut self,
        rhs: &[DVector<Real>],
        params: &SolveParams,
    ) -> Result<SolveReport> {
        params.solver.validate()?;
        self.check_depth(params.finest_depth)?;

        if params.coarsest_depth > params.finest_depth {
            return Err(Error::InvalidConfig(format!(
                "coarsest depth {} is finer than finest depth {}",
                params.coarsest_depth, params.finest_depth
            )));
        }

        if rhs.len() != self.tree.num_levels() {
            return Err(Error::LengthMismatch {
                what: "right-hand sides",
                expected: self.tree.num_levels(),
                got: rhs.len(),
            });
        }

        for (depth, b) in rhs.iter().enumerate() {
            let len = self.tree.level(Side::Decoder, depth)?.len();
            if b.len() != len {
                return Err(Error::LengthMismatch {
                    what: "right-hand side",
                    expected: len,
                    got: b.len(),
                });
            }
        }

        let screening = self.screening(params.screen_alpha, params.screen_xyz)?;
        let previous = std::mem::take(&mut self.coefficients);
        self.coefficients = previous
            .iter()
            .map(|coeffs| Arc::new(DVector::zeros(coeffs.len())))
            .collect();

        // χ restricted to the already solved levels, at the screening samples.
        let mut coarse_chi = vec![0.0; screening.points.len()];
        let mut report = SolveReport::default();

        for depth in params.coarsest_depth..=params.finest_depth {
            let system = self.system_for(depth, &screening)?;
            let level = self.tree.level(Side::Decoder, depth)?;

            let mut b = rhs[depth].clone();
            b -= coarse_stiffness_correction(&self.tree, depth, &self.tables, &self.coefficients)?;
            b -= coarse_screening_correction(level, &self.basis, &screening, &coarse_chi);

            let mut x = if params.solver.warm_start {
                previous[depth].as_ref().clone()
            } else {
                DVector::zeros(level.len())
            };

            let preconditioner = match params.solver.kind {
                SolverKind::Pcg => Some(system.inverse_diagonal()),
                SolverKind::Cg => None,
            };

            let outcome = solve_conjugate_gradient(
                system.matrix(),
                &b,
                &mut x,
                preconditioner,
                params.solver.max_iterations,
                params.solver.tolerance,
            )?;

            if outcome.converged {
                log::debug!(
                    "level {depth}: {} unknowns, converged in {} iterations (residual {:e})",
                    level.len(),
                    outcome.iterations,
                    outcome.residual_norm
                );
            } else {
                log::warn!(
                    "level {depth}: no convergence after {} iterations (residual {:e})",
                    outcome.iterations,
                    outcome.residual_norm
                );
            }

            if screening.is_active() {
                let basis = &self.basis;
                coarse_chi
                    .par_iter_mut()
                    .zip(screening.points.par_iter())
                    .for_each(|(chi, pt)| *chi += sample_level(level, basis, x.as_slice(), pt));
            }

            self.coefficients[depth] = Arc::new(x);
            report.levels.push(LevelReport {
                depth,
                unknowns: level.len(),
                iterations: outcome.iterations,
                residual_norm: outcome.residual_norm,
                converged: outcome.converged,
                residual_history: outcome.residual_history,
            });
        }

        let chi = self.evaluate_chi(&self.points);
        let areas = self.field.areas();
        self.isovalue = chi.iter().zip(areas.iter()).map(|(c, a)| c * a).sum::<Real>()
            / self.field.area_approximation();

        log::info!(
            "solved levels {}..={} with {} iterations in total, isovalue {}",
            params.coarsest_depth,
            params.finest_depth,
            report.total_iterations(),
            self.isovalue
        );

        self.stage = Stage::Solved;
        self.report = Some(report.clone());
        Ok(report)
    }

    pub(crate) fn chi_at(&self, pt: &Point3<Real>) -> Real {
        self.coefficients
            .iter()
            .enumerate()
            .filter_map(|(depth, coeffs)| {
                let level = self.tree.level(Side::Decoder, depth).ok()?;
                Some(sample_level(level, &self.basis, coeffs.as_slice(), pt))
            })
            .sum()
    }

    pub(crate) fn gradient_at(&self, pt: &Point3<Real>) -> Vector3<Real> {
        self.coefficients
            .iter()
            .enumerate()
            .filter_map(|(depth, coeffs)| {
                let level = self.tree.level(Side::Decoder, depth).ok()?;
                Some(sample_level_gradient(
                    level,
                    &self.basis,
                    coeffs.as_slice(),
                    pt,
                ))
            })
            .sum()
    }

    /// The implicit function at each query point.
    ///
    /// Points outside of the decoder coverage evaluate to zero; before the
    /// first solve every point does.
    pub fn evaluate_chi(&self, query: &[Point3<Real>]) -> Vec<Real> {
        query.par_iter().map(|pt| self.chi_at(pt)).collect()
    }

    /// The gradient of the implicit function at each query point.
    pub fn evaluate_gradient(&self, query: &[Point3<Real>]) -> Vec<Vector3<Real>> {
        query.par_iter().map(|pt| self.gradient_at(pt)).collect()
    }

    /// The implicit function shifted so that the reconstructed surface is its
    /// zero level set: negative inside, positive outside.
    pub fn evaluate_level_set(&self, query: &[Point3<Real>]) -> Vec<Real> {
        query
            .par_iter()
            .map(|pt| self.chi_at(pt) - self.isovalue)
            .collect()
    }

    /// Value of the implicit function on the reconstructed surface.
    pub fn isovalue(&self) -> Real {
        self.isovalue
    }

    /// The solved coefficients of `depth`, co-indexed with its decoder voxels.
    pub fn coefficients(&self, depth: usize) -> Result<&DVector<Real>> {
        self.check_depth(depth)?;
        Ok(self.coefficients[depth].as_ref())
    }

    /// The cached system of `depth`, if assembled.
    pub fn level_system(&self, depth: usize) -> Option<Arc<LevelSystem>> {
        self.systems.get(depth).cloned().flatten()
    }

    /// Diagnostic of the last solve.
    pub fn solve_report(&self) -> Option<&SolveReport> {
        self.report.as_ref()
    }

    /// Snapshot of the buffers of the last assembly and solve.
    pub fn trace(&self) -> ForwardTrace {
        ForwardTrace {
            systems: self.systems.clone(),
            coefficients: self.coefficients.clone(),
            isovalue: self.isovalue,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Reconstructor, SolveParams, Stage};
    use crate::basis::Basis;
    use crate::config::{HashTreeConfig, SolverConfig};
    use crate::conjugate_gradient::spmv;
    use crate::hash_tree::HashTree;
    use crate::point_cloud::PointCloud;
    use crate::Error;
    use approx::assert_relative_eq;
    use na::{DVector, Point3, Vector3};
    use std::sync::Arc;

    fn circle_cloud() -> PointCloud {
        let points: Vec<_> = (0..200)
            .map(|i| {
                let t = i as f64 * std::f64::consts::TAU / 200.0;
                Point3::new(0.6 * t.cos(), 0.6 * t.sin(), 0.03 * (i % 3) as f64)
            })
            .collect();
        let normals = points
            .iter()
            .map(|p| Vector3::new(p.x, p.y, 0.0).normalize())
            .collect();
        PointCloud::with_normals(points, normals).unwrap()
    }

    fn reflected_tree(cloud: &PointCloud) -> Arc<HashTree> {
        let config = HashTreeConfig {
            voxel_size: 0.2,
            depth: 3,
            min_density: None,
        };
        let mut tree = HashTree::build(cloud, &config).unwrap();
        tree.reflect_decoder(&Basis::BEZIER);
        Arc::new(tree)
    }

    fn params(screen_alpha: f64) -> SolveParams<'static> {
        SolveParams {
            finest_depth: 2,
            coarsest_depth: 0,
            screen_alpha,
            screen_xyz: None,
            solver: SolverConfig {
                max_iterations: 1000,
                tolerance: 1.0e-8,
                ..Default::default()
            },
        }
    }

    #[test]
    fn requires_a_reflected_decoder() {
        let cloud = circle_cloud();
        let tree = HashTree::build(&cloud, &HashTreeConfig::default()).unwrap();
        assert_eq!(
            Reconstructor::new(Arc::new(tree), Basis::BEZIER, cloud.points()).unwrap_err(),
            Error::UnreflectedDecoder
        );

        // A stencil narrower than the one of the basis is not enough either.
        let mut tree = HashTree::build(&cloud, &HashTreeConfig::default()).unwrap();
        tree.reflect_decoder(&Basis::TENT);
        assert_eq!(
            Reconstructor::new(Arc::new(tree), Basis::BEZIER, cloud.points()).unwrap_err(),
            Error::UnreflectedDecoder
        );
    }

    #[test]
    fn stages_follow_the_lifecycle() {
        let cloud = circle_cloud();
        let mut rec = Reconstructor::new(reflected_tree(&cloud), Basis::BEZIER, cloud.points())
            .unwrap();
        assert_eq!(rec.stage(), Stage::HierarchyBound);
        assert!(rec.evaluate_chi(cloud.points()).iter().all(|v| *v == 0.0));

        rec.assemble_level(1, 4.0, None).unwrap();
        assert_eq!(rec.stage(), Stage::Assembled);

        let rhs = rec.divergence_rhs(cloud.normals().unwrap()).unwrap();
        let report = rec.solve_multigrid(&rhs, &params(4.0)).unwrap();
        assert_eq!(rec.stage(), Stage::Solved);
        assert_eq!(report.levels.len(), 3);
        assert!(report.ensure_converged().is_ok());
        assert_eq!(rec.solve_report(), Some(&report));
    }

    #[test]
    fn far_and_non_finite_queries_evaluate_to_zero() {
        let cloud = circle_cloud();
        let mut rec = Reconstructor::new(reflected_tree(&cloud), Basis::BEZIER, cloud.points())
            .unwrap();
        let rhs = rec.divergence_rhs(cloud.normals().unwrap()).unwrap();
        rec.solve_multigrid(&rhs, &params(4.0)).unwrap();

        let queries = [
            Point3::new(1.0e20, 0.0, 0.0),
            Point3::new(0.0, -1.0e300, 0.0),
            Point3::new(f64::INFINITY, 0.0, 0.0),
            Point3::new(0.0, 0.0, f64::NEG_INFINITY),
            Point3::new(f64::NAN, 0.0, 0.0),
        ];
        assert!(rec.evaluate_chi(&queries).iter().all(|v| *v == 0.0));
        assert!(rec
            .evaluate_gradient(&queries)
            .iter()
            .all(|g| *g == Vector3::zeros()));
    }

    #[test]
    fn solved_levels_satisfy_their_systems() {
        let cloud = circle_cloud();
        let mut rec = Reconstructor::new(reflected_tree(&cloud), Basis::BEZIER, cloud.points())
            .unwrap();
        let rhs = rec.divergence_rhs(cloud.normals().unwrap()).unwrap();
        rec.solve_multigrid(&rhs, &params(4.0)).unwrap();

        // The coarsest level sees no correction: A_0 x_0 == b_0.
        let system = rec.level_system(0).unwrap();
        let x = rec.coefficients(0).unwrap();
        let mut ax = DVector::zeros(x.len());
        spmv(system.matrix(), x, &mut ax);
        assert!((ax - &rhs[0]).norm() <= 1.0e-7 * rhs[0].norm());
    }

    #[test]
    fn resolving_does_not_leak_state() {
        let cloud = circle_cloud();
        let mut rec = Reconstructor::new(reflected_tree(&cloud), Basis::BEZIER, cloud.points())
            .unwrap();
        let rhs = rec.divergence_rhs(cloud.normals().unwrap()).unwrap();

        rec.solve_multigrid(&rhs, &params(4.0)).unwrap();
        let first = rec.trace();
        let first_values = rec.evaluate_chi(cloud.points());

        // A different solve in between, then the original one again.
        let scaled: Vec<DVector<f64>> = rhs.iter().map(|b| b * 3.0).collect();
        rec.solve_multigrid(&scaled, &params(1.0)).unwrap();
        rec.solve_multigrid(&rhs, &params(4.0)).unwrap();
        let second_values = rec.evaluate_chi(cloud.points());

        for (a, b) in first_values.iter().zip(second_values.iter()) {
            assert_relative_eq!(*a, *b, epsilon = 1.0e-6);
        }

        // The snapshot still holds the buffers of the first solve.
        let second = rec.trace();
        for (a, b) in first.coefficients.iter().zip(second.coefficients.iter()) {
            assert!(!Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn explicit_screening_samples_are_used() {
        let cloud = circle_cloud();
        let mut rec = Reconstructor::new(reflected_tree(&cloud), Basis::BEZIER, cloud.points())
            .unwrap();
        let samples = [Point3::new(0.6, 0.0, 0.0), Point3::new(-0.6, 0.0, 0.0)];
        let default = rec.assemble_level(2, 4.0, None).unwrap();
        let explicit = rec.assemble_level(2, 4.0, Some(&samples[..])).unwrap();
        assert_ne!(default.matrix(), explicit.matrix());

        assert!(matches!(
            rec.assemble_level(2, -1.0, None),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            rec.assemble_level(7, 4.0, None),
            Err(Error::DepthOutOfRange { depth: 7, .. })
        ));
    }

    #[test]
    fn warm_start_reuses_the_previous_solution() {
        let cloud = circle_cloud();
        let mut rec = Reconstructor::new(reflected_tree(&cloud), Basis::BEZIER, cloud.points())
            .unwrap();
        let rhs = rec.divergence_rhs(cloud.normals().unwrap()).unwrap();
        let cold = rec.solve_multigrid(&rhs, &params(4.0)).unwrap();

        let mut warm_params = params(4.0);
        warm_params.solver.warm_start = true;
        let warm = rec.solve_multigrid(&rhs, &warm_params).unwrap();

        assert!(warm.converged());
        assert!(warm.total_iterations() < cold.total_iterations());
    }
}
