use crate::Real;

/// Errors produced while building the hash tree, assembling, or solving.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The input point set is empty, non-finite, or has zero spatial extent.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A configuration value is out of its admissible range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two buffers that must be co-indexed have different lengths.
    #[error("{what}: expected {expected} entries, got {got}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// The requested depth does not exist in the hierarchy.
    #[error("depth {depth} is out of range (the hierarchy has {levels} levels)")]
    DepthOutOfRange { depth: usize, levels: usize },

    /// The voxel is not occupied at the given depth.
    #[error("voxel {coord:?} is not occupied at depth {depth}")]
    NotFound { depth: usize, coord: [i64; 3] },

    /// The decoder side of the hash tree must be reflected before assembly.
    #[error("the decoder hierarchy has not been reflected")]
    UnreflectedDecoder,

    /// The iterative solver hit its iteration cap before reaching the tolerance.
    ///
    /// This is not fatal: the coefficients of the last iterate are kept.
    #[error(
        "solver did not converge at depth {depth} after {iterations} iterations \
         (residual {residual:e})"
    )]
    Convergence {
        depth: usize,
        iterations: usize,
        residual: Real,
    },
}

/// Result type of this crate.
pub type Result<T> = std::result::Result<T, Error>;
