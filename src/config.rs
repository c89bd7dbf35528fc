//! Configuration of the hierarchy, the solver, and full reconstructions.

use crate::basis::Basis;
use crate::{Error, Real, Result};
use na::Point3;
use std::fmt;
use std::str::FromStr;

/// Parameters of the hash tree construction.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct HashTreeConfig {
    /// Width of the voxels of the finest regular level.
    pub voxel_size: Real,
    /// Number of regular levels. Level `depth - 1` has voxels of width `voxel_size`,
    /// and each coarser level doubles the width.
    pub depth: usize,
    /// Adaptive refinement threshold: a finest-level voxel containing at least
    /// this many input points is refined once more. `None` disables refinement.
    pub min_density: Option<Real>,
}

/// Largest accepted [`HashTreeConfig::depth`].
///
/// Cross-level integral tables hold about `3 * 2^gap` entries per level gap,
/// and the adaptive level adds one more gap.
pub const MAX_DEPTH: usize = 12;

impl Default for HashTreeConfig {
    fn default() -> Self {
        Self {
            voxel_size: 0.01,
            depth: 6,
            min_density: None,
        }
    }
}

impl HashTreeConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if !(self.voxel_size.is_finite() && self.voxel_size > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "voxel_size must be a positive number, got {}",
                self.voxel_size
            )));
        }
        if self.depth == 0 {
            return Err(Error::InvalidConfig("depth must be > 0".to_string()));
        }
        if self.depth > MAX_DEPTH {
            return Err(Error::InvalidConfig(format!(
                "depth must be <= {MAX_DEPTH}, got {}",
                self.depth
            )));
        }
        if let Some(min_density) = self.min_density {
            if !(min_density.is_finite() && min_density > 0.0) {
                return Err(Error::InvalidConfig(format!(
                    "min_density must be a positive number, got {min_density}"
                )));
            }
        }
        Ok(())
    }
}

/// The Krylov method used to relax each level.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum SolverKind {
    /// Conjugate gradient with a Jacobi (diagonal) preconditioner.
    #[default]
    Pcg,
    /// Unpreconditioned conjugate gradient.
    Cg,
}

impl FromStr for SolverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pcg" => Ok(SolverKind::Pcg),
            "cg" => Ok(SolverKind::Cg),
            other => Err(Error::InvalidConfig(format!("unknown solver `{other}`"))),
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolverKind::Pcg => write!(f, "pcg"),
            SolverKind::Cg => write!(f, "cg"),
        }
    }
}

/// Stopping criteria of the per-level iterative solver.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SolverConfig {
    /// Krylov method of every level.
    pub kind: SolverKind,
    /// Iteration cap of each level's solve.
    pub max_iterations: usize,
    /// Relative residual-norm tolerance.
    pub tolerance: Real,
    /// Start each level from the coefficients of the previous solve instead of zero.
    pub warm_start: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            kind: SolverKind::Pcg,
            max_iterations: 200,
            tolerance: 1.0e-6,
            warm_start: false,
        }
    }
}

impl SolverConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(Error::InvalidConfig(
                "max_iterations must be > 0".to_string(),
            ));
        }
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(Error::InvalidConfig(format!(
                "tolerance must be a non-negative number, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// Every recognized option of a full reconstruction.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ReconstructionConfig {
    /// Hierarchy construction.
    pub tree: HashTreeConfig,
    /// Basis centered on every voxel.
    pub basis: Basis,
    /// Screening strength. `0.0` disables screening.
    pub screen_alpha: Real,
    /// Screening sample locations. Defaults to the input points.
    pub screen_xyz: Option<Vec<Point3<Real>>>,
    /// Per-level solver.
    pub solver: SolverConfig,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            tree: HashTreeConfig::default(),
            basis: Basis::default(),
            screen_alpha: 4.0,
            screen_xyz: None,
            solver: SolverConfig::default(),
        }
    }
}

impl ReconstructionConfig {
    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.tree.validate()?;
        self.solver.validate()?;
        validate_screen_alpha(self.screen_alpha)?;
        if let Some(screen_xyz) = &self.screen_xyz {
            if screen_xyz
                .iter()
                .any(|pt| !pt.coords.iter().all(|e| e.is_finite()))
            {
                return Err(Error::InvalidConfig(
                    "screen_xyz contains a non-finite coordinate".to_string(),
                ));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_screen_alpha(screen_alpha: Real) -> Result<()> {
    if !(screen_alpha.is_finite() && screen_alpha >= 0.0) {
        return Err(Error::InvalidConfig(format!(
            "screen_alpha must be a non-negative number, got {screen_alpha}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{HashTreeConfig, ReconstructionConfig, SolverConfig, SolverKind, MAX_DEPTH};
    use crate::Error;

    #[test]
    fn defaults_are_valid() {
        assert!(ReconstructionConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let tree = HashTreeConfig {
            voxel_size: 0.0,
            ..Default::default()
        };
        assert!(tree.validate().is_err());

        let tree = HashTreeConfig {
            depth: 0,
            ..Default::default()
        };
        assert!(tree.validate().is_err());

        let tree = HashTreeConfig {
            depth: MAX_DEPTH,
            ..Default::default()
        };
        assert!(tree.validate().is_ok());

        let tree = HashTreeConfig {
            depth: MAX_DEPTH + 1,
            ..Default::default()
        };
        assert!(matches!(tree.validate(), Err(Error::InvalidConfig(_))));

        let tree = HashTreeConfig {
            min_density: Some(-1.0),
            ..Default::default()
        };
        assert!(tree.validate().is_err());

        let solver = SolverConfig {
            max_iterations: 0,
            ..Default::default()
        };
        assert!(solver.validate().is_err());

        let config = ReconstructionConfig {
            screen_alpha: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parse_solver_kind() {
        assert_eq!("pcg".parse::<SolverKind>().unwrap(), SolverKind::Pcg);
        assert_eq!(" CG ".parse::<SolverKind>().unwrap(), SolverKind::Cg);
        assert!("gmres".parse::<SolverKind>().is_err());
        assert_eq!(SolverKind::Pcg.to_string(), "pcg");
    }
}
