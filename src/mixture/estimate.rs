//! Weighted moment estimates for the M-step.

use super::component::Covariance;
use crate::config::CovarianceKind;
use crate::dataset::FeatureStats;
use crate::error::{Error, Result};
use crate::linalg::eigen_decompose;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Posterior mass below which a component or dimension counts as unobserved.
pub(crate) const MIN_MASS: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Spread {
    Variances(Array1<f64>),
    Matrix(Array2<f64>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Moments {
    pub mean: Array1<f64>,
    pub spread: Spread,
    /// Dimensions that carried posterior mass.
    pub observed: Vec<bool>,
}

/// Moments from observed entries only, covariance estimated pairwise.
///
/// A dimension never observed under positive weight gets a mean drawn from
/// the global feature distribution and variance `floor`, uncorrelated with
/// the rest. Returns `None` when the weights carry no mass at all.
pub(crate) fn observed_moments<R: Rng + ?Sized>(
    data: ArrayView2<'_, f64>,
    weights: ArrayView1<'_, f64>,
    kind: CovarianceKind,
    stats: &FeatureStats,
    floor: f64,
    rng: &mut R,
) -> Result<Option<Moments>> {
    let (n, d) = data.dim();
    if weights.sum() <= MIN_MASS {
        return Ok(None);
    }

    let mut num = Array1::<f64>::zeros(d);
    let mut den = Array1::<f64>::zeros(d);
    for i in 0..n {
        let w = weights[i];
        if w == 0.0 {
            continue;
        }
        for (k, &v) in data.row(i).iter().enumerate() {
            if !v.is_nan() {
                num[k] += w * v;
                den[k] += w;
            }
        }
    }

    let mut mean = Array1::zeros(d);
    let mut observed = vec![false; d];
    for k in 0..d {
        if den[k] > MIN_MASS {
            mean[k] = num[k] / den[k];
            observed[k] = true;
        } else {
            let normal = Normal::new(stats.mean[k], stats.std[k])
                .map_err(|e| Error::Other(e.to_string()))?;
            mean[k] = normal.sample(rng);
        }
    }

    let spread = match kind {
        CovarianceKind::Spherical | CovarianceKind::Diagonal => {
            let mut acc = Array1::<f64>::zeros(d);
            for i in 0..n {
                let w = weights[i];
                for (k, &v) in data.row(i).iter().enumerate() {
                    if !v.is_nan() {
                        acc[k] += w * (v - mean[k]).powi(2);
                    }
                }
            }
            Spread::Variances(Array1::from_shape_fn(d, |k| {
                if observed[k] {
                    acc[k] / den[k]
                } else {
                    floor
                }
            }))
        }
        CovarianceKind::General => {
            let mut acc = Array2::<f64>::zeros((d, d));
            let mut mass = Array2::<f64>::zeros((d, d));
            let mut obs = Vec::with_capacity(d);
            for i in 0..n {
                let w = weights[i];
                if w == 0.0 {
                    continue;
                }
                let row = data.row(i);
                obs.clear();
                obs.extend((0..d).filter(|&k| !row[k].is_nan()));
                for (p, &a) in obs.iter().enumerate() {
                    let da = row[a] - mean[a];
                    for &b in &obs[p..] {
                        acc[(a, b)] += w * da * (row[b] - mean[b]);
                        mass[(a, b)] += w;
                    }
                }
            }
            let mut cov = Array2::zeros((d, d));
            for a in 0..d {
                for b in a..d {
                    let value = if a == b && !observed[a] {
                        floor
                    } else if observed[a] && observed[b] && mass[(a, b)] > MIN_MASS {
                        acc[(a, b)] / mass[(a, b)]
                    } else {
                        0.0
                    };
                    cov[(a, b)] = value;
                    cov[(b, a)] = value;
                }
            }
            Spread::Matrix(cov)
        }
    };

    Ok(Some(Moments {
        mean,
        spread,
        observed,
    }))
}

/// Moments of fully imputed rows, plus the accumulated conditional
/// covariance `correction = Σ_i w_i Cov(x_m | x_o)` embedded at the missing
/// dimensions.
pub(crate) fn imputed_moments(
    filled: ArrayView2<'_, f64>,
    weights: ArrayView1<'_, f64>,
    correction: Option<&Array2<f64>>,
    kind: CovarianceKind,
) -> Option<Moments> {
    let (n, d) = filled.dim();
    let total = weights.sum();
    if total <= MIN_MASS {
        return None;
    }

    let mean = filled.t().dot(&weights) / total;
    let spread = match kind {
        CovarianceKind::Spherical | CovarianceKind::Diagonal => {
            let mut var = Array1::<f64>::zeros(d);
            for i in 0..n {
                let w = weights[i];
                for k in 0..d {
                    var[k] += w * (filled[(i, k)] - mean[k]).powi(2);
                }
            }
            if let Some(c) = correction {
                var += &c.diag();
            }
            Spread::Variances(var / total)
        }
        CovarianceKind::General => {
            let mut cov = Array2::<f64>::zeros((d, d));
            for i in 0..n {
                let w = weights[i];
                if w == 0.0 {
                    continue;
                }
                let diff = &filled.row(i) - &mean;
                for a in 0..d {
                    let wa = w * diff[a];
                    for b in 0..d {
                        cov[(a, b)] += wa * diff[b];
                    }
                }
            }
            if let Some(c) = correction {
                cov += c;
            }
            Spread::Matrix(cov / total)
        }
    };

    Some(Moments {
        mean,
        spread,
        observed: vec![true; d],
    })
}

/// Turn moments into a covariance of the requested kind.
pub(crate) fn covariance_from_moments(
    kind: CovarianceKind,
    moments: &Moments,
    n_eigen: usize,
    floor: f64,
) -> Result<Covariance> {
    let variances = |spread: &Spread| match spread {
        Spread::Variances(v) => v.clone(),
        Spread::Matrix(m) => m.diag().to_owned(),
    };
    match kind {
        CovarianceKind::Spherical => {
            let var = variances(&moments.spread);
            let observed: Vec<f64> = var
                .iter()
                .zip(&moments.observed)
                .filter(|(_, o)| **o)
                .map(|(&v, _)| v)
                .collect();
            let pooled = if observed.is_empty() {
                floor
            } else {
                observed.iter().sum::<f64>() / observed.len() as f64
            };
            Ok(Covariance::Spherical {
                sigma: pooled.max(floor).sqrt(),
            })
        }
        CovarianceKind::Diagonal => Ok(Covariance::Diagonal {
            sigma: variances(&moments.spread).mapv(|v| v.max(floor).sqrt()),
        }),
        CovarianceKind::General => {
            let matrix = match &moments.spread {
                Spread::Matrix(m) => m.clone(),
                Spread::Variances(v) => Array2::from_diag(v),
            };
            let (eigenvalues, eigenvectors) = eigen_decompose(matrix.view(), n_eigen)?;
            Ok(Covariance::General {
                eigenvalues,
                eigenvectors,
            })
        }
    }
}
