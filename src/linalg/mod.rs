//! Numerical primitives: symmetric eigendecomposition and Cholesky factors.
//!
//! Nothing here knows about mixtures. The one non-textbook piece is the
//! incremental Cholesky machinery in [`cholesky`], which lets the E-step move
//! from the factor of one observed-dimension subset to a neighbouring one
//! without refactoring from scratch.
//!
//! ```rust
//! use gaussmix::linalg::{update_factor_from_previous, IndexedFactor};
//! use ndarray::array;
//!
//! let cov = array![[2.0, 0.3, 0.1], [0.3, 1.0, 0.2], [0.1, 0.2, 1.5]];
//! let f = IndexedFactor::from_scratch(cov.view(), &[0, 1]).unwrap();
//! let g = update_factor_from_previous(&f, &[1, 2], cov.view()).unwrap();
//! assert_eq!(g.dims(), &[1, 2]);
//! ```

pub mod cholesky;
pub mod eigen;
mod faer_bridge;

pub use cholesky::{
    cholesky_append_dimension, cholesky_factor, cholesky_remove_dimension, solve_lower,
    solve_upper_transposed, update_factor_from_previous, IndexedFactor,
};
pub use eigen::{eigen_decompose, inverse_via_eigen};
