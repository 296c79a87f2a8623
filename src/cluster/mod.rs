//! Hard and soft clustering of rows that may contain missing values.
//!
//! ## Hard vs Soft Clustering
//!
//! **Hard clustering** assigns each row to exactly one cluster. [`Kmeans`]
//! does this, and its labels seed the mixture's first M-step.
//!
//! **Soft clustering** gives each row a probability distribution over
//! clusters. A trained Gaussian mixture does this through its posteriors;
//! [`crate::GaussMixConfig`] implements [`SoftClustering`] by training a
//! mixture and returning `P(component | row)` for every input row.
//!
//! ## Usage
//!
//! ```rust
//! use gaussmix::cluster::{Clustering, Kmeans, SoftClustering};
//! use gaussmix::GaussMixConfig;
//!
//! let data = vec![
//!     vec![0.0, 0.0],
//!     vec![0.1, f64::NAN],
//!     vec![10.0, 10.0],
//!     vec![10.1, 10.1],
//! ];
//!
//! let labels = Kmeans::new(2).with_seed(1).fit_predict(&data).unwrap();
//! assert_eq!(labels[0], labels[1]);
//! assert_ne!(labels[0], labels[2]);
//!
//! let probs = GaussMixConfig::new(2).with_stages(3).fit_predict_proba(&data).unwrap();
//! assert_eq!(probs.len(), 4);
//! ```

mod kmeans;
mod traits;

pub use kmeans::Kmeans;
pub use traits::{Clustering, SoftClustering};
