use thiserror::Error;

/// Result alias for `gaussmix`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the mixture, clustering and linear algebra primitives.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Input was empty.
    #[error("empty input provided")]
    EmptyInput,

    /// Vector or matrix dimension mismatch.
    #[error("dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Found dimension.
        found: usize,
    },

    /// Invalid number of clusters requested.
    #[error("cannot create {requested} clusters from {n_items} items")]
    InvalidClusterCount {
        /// Requested count.
        requested: usize,
        /// Number of items.
        n_items: usize,
    },

    /// Invalid parameter value.
    #[error("invalid parameter '{name}': {message}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// Error message.
        message: &'static str,
    },

    /// Covariance kind string not recognised.
    #[error("unknown covariance kind '{0}' (expected spherical, diagonal or general)")]
    UnknownCovarianceKind(String),

    /// More eigenpairs requested than the matrix has.
    #[error("cannot compute {requested} eigenpairs of a {dim}x{dim} matrix")]
    EigenCountExceedsDimension {
        /// Requested number of eigenpairs.
        requested: usize,
        /// Matrix dimension.
        dim: usize,
    },

    /// Cholesky factorization hit a non-positive pivot.
    #[error("{dim}x{dim} matrix is not positive definite")]
    NotPositiveDefinite {
        /// Dimension of the matrix being factored.
        dim: usize,
    },

    /// The symmetric eigensolver failed.
    #[error("eigendecomposition failed to converge")]
    EigenFailed,

    /// A conditional query was made before `set_predictor`.
    #[error("no predictor has been set")]
    PredictorNotSet,

    /// Generic error with message.
    #[error("{0}")]
    Other(String),
}
