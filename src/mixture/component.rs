//! One Gaussian component and its covariance representations.
//!
//! # General covariance
//!
//! A General component keeps the `n` leading eigenpairs of its covariance,
//! `e_0 >= ... >= e_{n-1} = λ₀`, and treats every direction outside their
//! span as having variance `λ₀`:
//!
//! ```text
//! C = λ₀ I + Σ_k (e_k - λ₀) v_k v_kᵀ
//! log det C = Σ_k ln e_k + (D - n) ln λ₀
//! (x-μ)ᵀ C⁻¹ (x-μ) = |y|²/λ₀ + Σ_k (1/e_k - 1/λ₀) (v_k·y)²,   y = x - μ
//! ```
//!
//! so a fully observed row never needs a factorization. Rows with missing
//! values need the observed sub-block `C[o,o]`; the dense `C` is rebuilt
//! lazily and dropped whenever the parameters change.

use crate::config::{check_variance_floor, CovarianceKind};
use crate::error::{Error, Result};
use crate::linalg::IndexedFactor;
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use std::sync::OnceLock;

pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Covariance of one component.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Covariance {
    /// `σ² I`.
    Spherical {
        /// Standard deviation.
        sigma: f64,
    },
    /// `diag(σ_d²)`.
    Diagonal {
        /// Standard deviation of each dimension.
        sigma: Array1<f64>,
    },
    /// Truncated eigenbasis.
    General {
        /// Leading eigenvalues, descending.
        eigenvalues: Array1<f64>,
        /// Unit eigenvectors, one per row.
        eigenvectors: Array2<f64>,
    },
}

impl Covariance {
    /// Identity covariance of the given kind.
    pub fn identity(kind: CovarianceKind, dim: usize) -> Self {
        match kind {
            CovarianceKind::Spherical => Self::Spherical { sigma: 1.0 },
            CovarianceKind::Diagonal => Self::Diagonal {
                sigma: Array1::ones(dim),
            },
            CovarianceKind::General => Self::General {
                eigenvalues: Array1::ones(dim),
                eigenvectors: Array2::eye(dim),
            },
        }
    }

    /// Kind of this representation.
    pub fn kind(&self) -> CovarianceKind {
        match self {
            Self::Spherical { .. } => CovarianceKind::Spherical,
            Self::Diagonal { .. } => CovarianceKind::Diagonal,
            Self::General { .. } => CovarianceKind::General,
        }
    }

    fn check(&self, dim: usize) -> Result<()> {
        match self {
            Self::Spherical { sigma } if !sigma.is_finite() => Err(Error::InvalidParameter {
                name: "sigma",
                message: "must be finite",
            }),
            Self::Diagonal { sigma } if sigma.len() != dim => Err(Error::DimensionMismatch {
                expected: dim,
                found: sigma.len(),
            }),
            Self::General {
                eigenvalues,
                eigenvectors,
            } => {
                if eigenvalues.is_empty() {
                    return Err(Error::InvalidParameter {
                        name: "eigenvalues",
                        message: "at least one eigenpair is required",
                    });
                }
                if eigenvalues.len() > dim {
                    return Err(Error::EigenCountExceedsDimension {
                        requested: eigenvalues.len(),
                        dim,
                    });
                }
                if eigenvectors.dim() != (eigenvalues.len(), dim) {
                    return Err(Error::DimensionMismatch {
                        expected: dim,
                        found: eigenvectors.ncols(),
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Clamp every variance to `floor` and keep eigenvalues descending.
    fn apply_floor(&mut self, floor: f64) {
        match self {
            Self::Spherical { sigma } => *sigma = sigma.abs().max(floor.sqrt()),
            Self::Diagonal { sigma } => sigma.mapv_inplace(|s| s.abs().max(floor.sqrt())),
            Self::General {
                eigenvalues,
                eigenvectors,
            } => {
                eigenvalues.mapv_inplace(|e| if e.is_nan() { floor } else { e.max(floor) });
                let sorted = eigenvalues
                    .iter()
                    .zip(eigenvalues.iter().skip(1))
                    .all(|(a, b)| a >= b);
                if !sorted {
                    let mut order: Vec<usize> = (0..eigenvalues.len()).collect();
                    order.sort_by(|&i, &j| eigenvalues[j].total_cmp(&eigenvalues[i]));
                    let values = Array1::from_iter(order.iter().map(|&i| eigenvalues[i]));
                    let mut vectors = Array2::zeros(eigenvectors.dim());
                    for (row, &i) in order.iter().enumerate() {
                        vectors.row_mut(row).assign(&eigenvectors.row(i));
                    }
                    *eigenvalues = values;
                    *eigenvectors = vectors;
                }
            }
        }
    }

    fn log_det(&self, dim: usize) -> f64 {
        match self {
            Self::Spherical { sigma } => dim as f64 * (sigma * sigma).ln(),
            Self::Diagonal { sigma } => sigma.iter().map(|s| (s * s).ln()).sum(),
            Self::General { eigenvalues, .. } => {
                let lambda0 = eigenvalues[eigenvalues.len() - 1];
                eigenvalues.iter().map(|e| e.ln()).sum::<f64>()
                    + (dim - eigenvalues.len()) as f64 * lambda0.ln()
            }
        }
    }

    fn dense(&self, dim: usize) -> Array2<f64> {
        match self {
            Self::Spherical { sigma } => Array2::eye(dim) * (sigma * sigma),
            Self::Diagonal { sigma } => Array2::from_diag(&sigma.mapv(|s| s * s)),
            Self::General {
                eigenvalues,
                eigenvectors,
            } => {
                let lambda0 = eigenvalues[eigenvalues.len() - 1];
                let mut c = Array2::eye(dim) * lambda0;
                for (e, v) in eigenvalues.iter().zip(eigenvectors.rows()) {
                    let scale = e - lambda0;
                    if scale == 0.0 {
                        continue;
                    }
                    for i in 0..dim {
                        let vi = v[i] * scale;
                        for j in 0..dim {
                            c[(i, j)] += vi * v[j];
                        }
                    }
                }
                c
            }
        }
    }
}

/// Conditional distribution of the missing coordinates of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Imputation {
    /// The row with its missing coordinates replaced by their conditional mean.
    pub filled: Array1<f64>,
    /// Missing dimensions, ascending.
    pub missing: Vec<usize>,
    /// Conditional covariance over `missing`, in that order.
    pub covariance: Array2<f64>,
}

/// A weighted Gaussian.
#[derive(Debug, Clone)]
pub struct GaussianComponent {
    weight: f64,
    mean: Array1<f64>,
    covariance: Covariance,
    variance_floor: f64,
    log_coeff: f64,
    dense: OnceLock<Array2<f64>>,
}

impl PartialEq for GaussianComponent {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight
            && self.mean == other.mean
            && self.covariance == other.covariance
            && self.variance_floor == other.variance_floor
    }
}

impl GaussianComponent {
    /// Build a component, flooring its variances.
    ///
    /// `variance_floor` must be positive and finite.
    pub fn new(
        weight: f64,
        mean: Array1<f64>,
        covariance: Covariance,
        variance_floor: f64,
    ) -> Result<Self> {
        if mean.is_empty() {
            return Err(Error::EmptyInput);
        }
        check_variance_floor(variance_floor)?;
        covariance.check(mean.len())?;
        let mut component = Self {
            weight,
            mean,
            covariance,
            variance_floor,
            log_coeff: 0.0,
            dense: OnceLock::new(),
        };
        component.refresh();
        Ok(component)
    }

    fn refresh(&mut self) {
        self.covariance.apply_floor(self.variance_floor);
        let d = self.mean.len();
        self.log_coeff = -0.5 * (d as f64 * LN_2PI + self.covariance.log_det(d));
        self.dense = OnceLock::new();
    }

    /// Mixing weight.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Set the mixing weight.
    pub fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }

    /// Mean vector.
    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    /// Covariance representation.
    pub fn covariance(&self) -> &Covariance {
        &self.covariance
    }

    /// Variance floor applied to this component.
    pub fn variance_floor(&self) -> f64 {
        self.variance_floor
    }

    /// Input dimension.
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    /// `-½ (D ln 2π + ln det C)`.
    pub fn log_coeff(&self) -> f64 {
        self.log_coeff
    }

    /// Replace mean and covariance; cached quantities are rebuilt.
    pub fn set_parameters(&mut self, mean: Array1<f64>, covariance: Covariance) -> Result<()> {
        if mean.len() != self.mean.len() {
            return Err(Error::DimensionMismatch {
                expected: self.mean.len(),
                found: mean.len(),
            });
        }
        covariance.check(mean.len())?;
        self.mean = mean;
        self.covariance = covariance;
        self.refresh();
        Ok(())
    }

    /// Dense covariance matrix, built on first use.
    pub fn full_covariance(&self) -> &Array2<f64> {
        self.dense.get_or_init(|| self.covariance.dense(self.mean.len()))
    }

    fn check_len(&self, x: &ArrayView1<'_, f64>) -> Result<()> {
        if x.len() != self.mean.len() {
            return Err(Error::DimensionMismatch {
                expected: self.mean.len(),
                found: x.len(),
            });
        }
        Ok(())
    }

    /// `ln N(x; μ, C)`, marginalising NaN coordinates.
    ///
    /// Spherical and Diagonal components sum over observed coordinates. A
    /// fully observed row of a General component uses the eigenbasis; a row
    /// with missing values factors `C[o,o]` from scratch.
    pub fn log_likelihood(&self, x: ArrayView1<'_, f64>) -> Result<f64> {
        self.check_len(&x)?;
        let observed: Vec<usize> = (0..x.len()).filter(|&d| !x[d].is_nan()).collect();
        if observed.is_empty() {
            return Ok(0.0);
        }
        match &self.covariance {
            Covariance::Spherical { sigma } => {
                let var = sigma * sigma;
                let sq: f64 = observed.iter().map(|&d| (x[d] - self.mean[d]).powi(2)).sum();
                let n = observed.len() as f64;
                Ok(-0.5 * (n * LN_2PI + n * var.ln() + sq / var))
            }
            Covariance::Diagonal { sigma } => Ok(observed
                .iter()
                .map(|&d| {
                    let var = sigma[d] * sigma[d];
                    -0.5 * (LN_2PI + var.ln() + (x[d] - self.mean[d]).powi(2) / var)
                })
                .sum()),
            Covariance::General { .. } if observed.len() == x.len() => {
                Ok(self.log_coeff - 0.5 * self.mahalanobis_eigen(x))
            }
            Covariance::General { .. } => {
                let factor = IndexedFactor::from_scratch(self.full_covariance().view(), &observed)?;
                Ok(self.log_likelihood_with_factor(x, &factor))
            }
        }
    }

    /// Squared Mahalanobis distance of a fully observed row through the eigenbasis.
    fn mahalanobis_eigen(&self, x: ArrayView1<'_, f64>) -> f64 {
        let y = &x - &self.mean;
        match &self.covariance {
            Covariance::General {
                eigenvalues,
                eigenvectors,
            } => {
                let lambda0 = eigenvalues[eigenvalues.len() - 1];
                let mut dist = y.dot(&y) / lambda0;
                for (e, v) in eigenvalues.iter().zip(eigenvectors.rows()) {
                    let proj = v.dot(&y);
                    dist += (1.0 / e - 1.0 / lambda0) * proj * proj;
                }
                dist
            }
            Covariance::Spherical { sigma } => y.dot(&y) / (sigma * sigma),
            Covariance::Diagonal { sigma } => y
                .iter()
                .zip(sigma.iter())
                .map(|(v, s)| v * v / (s * s))
                .sum(),
        }
    }

    /// `ln N(x_o; μ_o, C_oo)` using a factor of `C[o,o]` where `o = factor.dims()`.
    ///
    /// Coordinates outside the factor are ignored.
    pub fn log_likelihood_with_factor(&self, x: ArrayView1<'_, f64>, factor: &IndexedFactor) -> f64 {
        if factor.is_empty() {
            return 0.0;
        }
        let diff = Array1::from_iter(factor.dims().iter().map(|&d| x[d] - self.mean[d]));
        -0.5 * (factor.len() as f64 * LN_2PI + factor.log_det() + factor.mahalanobis(diff.view()))
    }

    /// Conditional mean and covariance of the missing coordinates of `x`
    /// given its observed ones, with `factor` covering the observed dims.
    pub fn impute_with_factor(
        &self,
        x: ArrayView1<'_, f64>,
        factor: &IndexedFactor,
    ) -> Imputation {
        let c = self.full_covariance();
        let observed = factor.dims();
        let mut is_observed = vec![false; x.len()];
        for &d in observed {
            is_observed[d] = true;
        }
        let missing: Vec<usize> = (0..x.len()).filter(|&d| !is_observed[d]).collect();

        let diff = Array1::from_iter(observed.iter().map(|&d| x[d] - self.mean[d]));
        let alpha = factor.solve(diff.view());

        let mut filled = x.to_owned();
        let mut w = Array2::zeros((missing.len(), observed.len()));
        for (a, &m) in missing.iter().enumerate() {
            let c_om = Array1::from_iter(observed.iter().map(|&o| c[(o, m)]));
            filled[m] = self.mean[m] + c_om.dot(&alpha);
            w.row_mut(a).assign(&factor.solve_lower(c_om.view()));
        }

        let mut covariance = Array2::from_shape_fn((missing.len(), missing.len()), |(a, b)| {
            c[(missing[a], missing[b])]
        });
        covariance -= &w.dot(&w.t());

        Imputation {
            filled,
            missing,
            covariance,
        }
    }

    /// `μ + C^{1/2} z` with `z ~ N(0, I)`.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Array1<f64> {
        let d = self.mean.len();
        let z: Array1<f64> = Array1::from_shape_fn(d, |_| StandardNormal.sample(rng));
        let offset = match &self.covariance {
            Covariance::Spherical { sigma } => &z * *sigma,
            Covariance::Diagonal { sigma } => &z * sigma,
            Covariance::General {
                eigenvalues,
                eigenvectors,
            } => {
                let root0 = eigenvalues[eigenvalues.len() - 1].sqrt();
                let mut out = &z * root0;
                for (e, v) in eigenvalues.iter().zip(eigenvectors.rows()) {
                    let scale = (e.sqrt() - root0) * v.dot(&z);
                    out.scaled_add(scale, &v);
                }
                out
            }
        };
        &self.mean + &offset
    }
}
