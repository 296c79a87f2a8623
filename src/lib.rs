//! # gaussmix
//!
//! Gaussian mixture density estimation by EM, with missing values (NaN)
//! marginalised exactly rather than imputed away.
//!
//! - [`linalg`]: Cholesky factors that move between subsets of dimensions by
//!   rank-one updates, and a symmetric eigensolver.
//! - [`missing`]: distinct missing patterns, their k-median clustering, and
//!   spanning-tree traversals that bound how many factors are alive at once.
//! - [`mixture`]: components, the EM trainer, and density/conditional queries.
//! - [`cluster`]: k-means seeding and the [`Clustering`]/[`SoftClustering`]
//!   traits.
//!
//! ```rust
//! use gaussmix::{train, CovarianceKind, GaussMixConfig};
//! use ndarray::array;
//!
//! let data = array![
//!     [0.0, 0.1], [0.2, -0.1], [-0.1, 0.0], [0.1, f64::NAN],
//!     [5.0, 5.1], [5.2, 4.9], [4.9, 5.0], [f64::NAN, 5.0],
//! ];
//! let config = GaussMixConfig::new(2)
//!     .with_covariance(CovarianceKind::Diagonal)
//!     .with_stages(5);
//! let (model, _stats) = train(&data, &config).unwrap();
//! assert!((model.weights().sum() - 1.0).abs() < 1e-6);
//! let near = model.log_density(array![0.0, f64::NAN].view()).unwrap();
//! let far = model.log_density(array![2.5, f64::NAN].view()).unwrap();
//! assert!(near > far);
//! ```

pub mod cluster;
pub mod config;
pub mod dataset;
/// Error types used across `gaussmix`.
pub mod error;
pub mod linalg;
pub mod missing;
pub mod mixture;

pub use cluster::{Clustering, Kmeans, SoftClustering};
pub use config::{CovarianceKind, GaussMixConfig};
pub use dataset::{Dataset, FeatureStats};
pub use error::{Error, Result};
pub use missing::{MissingPatternClusterer, SpanningTraversal, TraversalStep};
pub use mixture::{
    train, ComponentState, Covariance, GaussMixTrainer, GaussianComponent, MixtureModel,
    ModelState, ReplacementEvent, TrainStats, TrainerState,
};
