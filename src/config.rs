//! Training options.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// How each component's covariance is parameterized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CovarianceKind {
    /// One standard deviation shared by every direction.
    Spherical,
    /// One standard deviation per dimension.
    Diagonal,
    /// Truncated eigenbasis of a full covariance matrix.
    General,
}

impl FromStr for CovarianceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spherical" => Ok(Self::Spherical),
            "diagonal" => Ok(Self::Diagonal),
            "general" => Ok(Self::General),
            _ => Err(Error::UnknownCovarianceKind(s.to_string())),
        }
    }
}

impl fmt::Display for CovarianceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Spherical => "spherical",
            Self::Diagonal => "diagonal",
            Self::General => "general",
        };
        f.write_str(name)
    }
}

/// A variance floor must be positive and finite.
pub(crate) fn check_variance_floor(floor: f64) -> Result<()> {
    if floor > 0.0 && floor.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidParameter {
            name: "variance_floor",
            message: "must be positive and finite",
        })
    }
}

/// Options of a Gaussian mixture training run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GaussMixConfig {
    /// Number of components `L`.
    pub n_components: usize,
    /// Covariance parameterization.
    pub covariance: CovarianceKind,
    /// Number of EM stages after initialization.
    pub n_stages: usize,
    /// Components whose weight drops below this are replaced.
    pub alpha_min: f64,
    /// Lower bound on every variance and eigenvalue.
    pub variance_floor: f64,
    /// Eigenvectors kept per General component (`None` = all).
    pub n_eigen: Option<usize>,
    /// Number of missing-pattern clusters.
    pub k_median_clusters: usize,
    /// Iteration cap of the missing-pattern k-median.
    pub k_median_max_iter: usize,
    /// Correct the M-step for missing values with conditional imputation.
    pub impute_missing: bool,
    /// Derive per-pattern Cholesky factors incrementally along spanning traversals.
    pub efficient_missing: bool,
    /// Iterations of the k-means seeding.
    pub kmeans_iterations: usize,
    /// Leading dimensions treated as the predictor `x` of `p(y | x)`.
    pub predictor_size: usize,
    /// Seed of the training run's random generator.
    pub seed: u64,
}

impl Default for GaussMixConfig {
    fn default() -> Self {
        Self {
            n_components: 2,
            covariance: CovarianceKind::Spherical,
            n_stages: 10,
            alpha_min: 1e-6,
            variance_floor: 1e-6,
            n_eigen: None,
            k_median_clusters: 1,
            k_median_max_iter: 100,
            impute_missing: false,
            efficient_missing: true,
            kmeans_iterations: 5,
            predictor_size: 0,
            seed: 42,
        }
    }
}

impl GaussMixConfig {
    /// Configuration with `n_components` components and defaults elsewhere.
    pub fn new(n_components: usize) -> Self {
        Self {
            n_components,
            ..Self::default()
        }
    }

    /// Set the covariance parameterization.
    pub fn with_covariance(mut self, kind: CovarianceKind) -> Self {
        self.covariance = kind;
        self
    }

    /// Set the number of EM stages.
    pub fn with_stages(mut self, n_stages: usize) -> Self {
        self.n_stages = n_stages;
        self
    }

    /// Set the replacement threshold.
    pub fn with_alpha_min(mut self, alpha_min: f64) -> Self {
        self.alpha_min = alpha_min;
        self
    }

    /// Set the variance floor.
    pub fn with_variance_floor(mut self, floor: f64) -> Self {
        self.variance_floor = floor;
        self
    }

    /// Keep only the `n` leading eigenvectors of General components.
    pub fn with_n_eigen(mut self, n: usize) -> Self {
        self.n_eigen = Some(n);
        self
    }

    /// Set the missing-pattern k-median size and iteration cap.
    pub fn with_k_median(mut self, clusters: usize, max_iter: usize) -> Self {
        self.k_median_clusters = clusters;
        self.k_median_max_iter = max_iter;
        self
    }

    /// Enable or disable conditional imputation in the M-step.
    pub fn with_impute_missing(mut self, impute: bool) -> Self {
        self.impute_missing = impute;
        self
    }

    /// Enable or disable incremental factor updates.
    pub fn with_efficient_missing(mut self, efficient: bool) -> Self {
        self.efficient_missing = efficient;
        self
    }

    /// Set the k-means seeding iterations.
    pub fn with_kmeans_iterations(mut self, iterations: usize) -> Self {
        self.kmeans_iterations = iterations;
        self
    }

    /// Set the predictor size used by conditional queries.
    pub fn with_predictor_size(mut self, size: usize) -> Self {
        self.predictor_size = size;
        self
    }

    /// Set the random seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Eigenvectors kept for inputs of dimension `width`.
    pub fn n_eigen_for(&self, width: usize) -> usize {
        self.n_eigen.unwrap_or(width).min(width)
    }

    /// Check the options against an input dimension.
    pub fn validate(&self, width: usize) -> Result<()> {
        if width == 0 {
            return Err(Error::EmptyInput);
        }
        if self.n_components == 0 {
            return Err(Error::InvalidParameter {
                name: "n_components",
                message: "must be > 0",
            });
        }
        check_variance_floor(self.variance_floor)?;
        if !(self.alpha_min >= 0.0) {
            return Err(Error::InvalidParameter {
                name: "alpha_min",
                message: "must be >= 0",
            });
        }
        if self.alpha_min * self.n_components as f64 >= 1.0 {
            return Err(Error::InvalidParameter {
                name: "alpha_min",
                message: "must be < 1 / n_components",
            });
        }
        match self.n_eigen {
            Some(0) => {
                return Err(Error::InvalidParameter {
                    name: "n_eigen",
                    message: "must be > 0",
                })
            }
            Some(n) if n > width => {
                return Err(Error::InvalidParameter {
                    name: "n_eigen",
                    message: "exceeds input dimension",
                })
            }
            _ => {}
        }
        if self.k_median_clusters == 0 {
            return Err(Error::InvalidParameter {
                name: "k_median_clusters",
                message: "must be > 0",
            });
        }
        if self.predictor_size > width {
            return Err(Error::InvalidParameter {
                name: "predictor_size",
                message: "exceeds input dimension",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covariance_kind_parse() {
        assert_eq!("general".parse::<CovarianceKind>(), Ok(CovarianceKind::General));
        assert_eq!(" Diagonal ".parse::<CovarianceKind>(), Ok(CovarianceKind::Diagonal));
        assert_eq!(
            "full".parse::<CovarianceKind>(),
            Err(Error::UnknownCovarianceKind("full".to_string()))
        );
        assert_eq!(CovarianceKind::Spherical.to_string(), "spherical");
    }

    #[test]
    fn test_validate_defaults() {
        assert!(GaussMixConfig::default().validate(3).is_ok());
    }

    #[test]
    fn test_validate_rejects_inconsistent_dimensions() {
        let cfg = GaussMixConfig::new(2).with_n_eigen(4);
        assert!(matches!(
            cfg.validate(3),
            Err(Error::InvalidParameter { name: "n_eigen", .. })
        ));
        let cfg = GaussMixConfig::new(2).with_predictor_size(5);
        assert!(cfg.validate(3).is_err());
        assert_eq!(GaussMixConfig::new(2).n_eigen_for(3), 3);
    }

    #[test]
    fn test_validate_rejects_bad_numbers() {
        assert!(GaussMixConfig::new(0).validate(2).is_err());
        assert!(GaussMixConfig::new(2).with_variance_floor(0.0).validate(2).is_err());
        assert!(GaussMixConfig::new(4).with_alpha_min(0.3).validate(2).is_err());
        assert!(GaussMixConfig::new(2).with_k_median(0, 10).validate(2).is_err());
        assert_eq!(GaussMixConfig::new(2).validate(0), Err(Error::EmptyInput));
    }
}
