//! # Symmetric Eigenproblems
//!
//! Closed-form solvers for symmetric 2x2 and 3x3 matrices, and a simultaneous (block power)
//! iteration that extracts the top one or two eigenpairs of a larger symmetric matrix by
//! reducing every step to a 3x3 Rayleigh-Ritz problem.

mod simultaneous;
mod small;

pub use simultaneous::{dominant_eigenpair, dominant_eigenpairs, IterationParams};
pub use small::{
    sym_eigen_2x2, sym_eigen_3x3, sym_eigenvalues_2x2, sym_eigenvalues_3x3, SymEigen2, SymEigen3,
};

pub(crate) use simultaneous::{top_one, top_two};

/// Relative size below which off-diagonal mass or an eigenvalue gap counts as zero.
pub(crate) const DIAGONAL_EPS: f64 = 1.0e-8;

/// `sqrt(DIAGONAL_EPS)`: floor for Cholesky pivots and for cross-product norms.
pub(crate) const PIVOT_FLOOR: f64 = 1.0e-4;
