/*!
Rust implementation of the [Screened poisson reconstruction](https://www.cs.jhu.edu/~misha/MyPapers/ToG13.pdf)
by Kazhdan and Hoppe, over an adaptive sparse hash tree.

The input points are quantized into a hierarchy of sparse voxel levels ([`HashTree`]),
each storing its occupied voxels in a spatial hash ([`HGrid`]). A compactly supported
basis function ([`Basis`]) is centered on every voxel of every level, and the implicit
function is solved level by level, coarse to fine, with a (preconditioned) conjugate
gradient ([`Reconstructor`]). [`PoissonReconstruction`] runs the whole pipeline in one call.
*/

#![allow(clippy::type_complexity, clippy::too_many_arguments)]
#![warn(missing_docs)]

/// Floating-point type used by this library.
pub type Real = f64;

extern crate nalgebra as na;
extern crate parry3d_f64 as parry;

pub use self::basis::{Basis, BasisFunction, BezierBasis, BoxBasis, IntegralTable, TentBasis};
pub use self::config::{HashTreeConfig, ReconstructionConfig, SolverConfig, SolverKind, MAX_DEPTH};
pub use self::error::{Error, Result};
pub use self::hash_tree::{HashTree, Side, VoxelRef};
pub use self::hgrid::HGrid;
pub use self::point_cloud::PointCloud;
pub use self::poisson::PoissonReconstruction;
pub use self::poisson_layer::LevelSystem;
pub use self::reconstructor::{
    ForwardTrace, LevelReport, Reconstructor, SolveParams, SolveReport, Stage,
};
pub use self::transfer::LevelTransfer;

pub mod basis;
pub mod config;
pub mod conjugate_gradient;
mod error;
pub mod hash_tree;
pub mod hgrid;
pub mod point_cloud;
mod poisson;
mod poisson_layer;
mod poisson_vector_field;
pub mod polynomial;
pub mod reconstructor;
pub mod transfer;
