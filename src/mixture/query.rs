//! Density, posterior, conditional and sampling queries.
//!
//! With `x` the first `p = predictor_size` coordinates and `y` the rest,
//! each component conditions as
//!
//! ```text
//! m_j = μ_y + C_yx C_xx⁻¹ (x - μ_x)
//! S_j = C_yy - C_yx C_xx⁻¹ C_xy
//! P(j | x) ∝ α_j N(x | μ_x, C_xx)
//! ```
//!
//! `C_xx⁻¹` goes through the floored eigenbasis so an ill-conditioned
//! predictor block never fails. NaN predictor entries are marginalised.

use super::component::GaussianComponent;
use super::MixtureModel;
use crate::error::{Error, Result};
use crate::linalg::{eigen_decompose, inverse_via_eigen, IndexedFactor};
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use std::borrow::Cow;

/// `ln Σ exp(v)`, `-inf` for an empty or all `-inf` input.
pub(crate) fn logsumexp(values: &[f64]) -> f64 {
    let max_val = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val.is_infinite() {
        return max_val;
    }
    max_val
        + values
            .iter()
            .map(|&v| (v - max_val).exp())
            .sum::<f64>()
            .ln()
}

/// Index drawn with probability proportional to `probs`.
fn pick<R: Rng + ?Sized>(probs: impl Iterator<Item = f64>, rng: &mut R) -> usize {
    let probs: Vec<f64> = probs.collect();
    let total: f64 = probs.iter().sum();
    let threshold = rng.random::<f64>() * total;
    let mut cumsum = 0.0;
    let mut last = 0;
    for (j, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        last = j;
        cumsum += p;
        if cumsum >= threshold {
            return j;
        }
    }
    last
}

/// Symmetrize and clamp eigenvalues to at least `floor`.
fn floored(mut s: Array2<f64>, floor: f64) -> Result<Array2<f64>> {
    let q = s.nrows();
    if q == 0 {
        return Ok(s);
    }
    let sym = (&s + &s.t()) / 2.0;
    s = sym;
    let (values, vectors) = eigen_decompose(s.view(), q)?;
    if values.iter().all(|&v| v >= floor) {
        return Ok(s);
    }
    let mut out = Array2::zeros((q, q));
    for (v, row) in values.iter().zip(vectors.rows()) {
        let scale = v.max(floor);
        for i in 0..q {
            for j in 0..q {
                out[(i, j)] += scale * row[i] * row[j];
            }
        }
    }
    Ok(out)
}

/// `P(y | x)` for one predictor value.
#[derive(Debug, Clone)]
pub(crate) struct Conditional {
    predictor: Array1<f64>,
    /// Normalised `ln P(j | x)`.
    log_weights: Array1<f64>,
    means: Vec<Array1<f64>>,
    covariances: Vec<Array2<f64>>,
    factors: Vec<IndexedFactor>,
}

impl Conditional {
    fn build(model: &MixtureModel, x: ArrayView1<'_, f64>) -> Result<Self> {
        let p = model.predictor_size;
        let d = model.dim;
        let q = d - p;
        let observed: Vec<usize> = (0..p).filter(|&k| !x[k].is_nan()).collect();

        let mut padded = Array1::from_elem(d, f64::NAN);
        padded.slice_mut(ndarray::s![..p]).assign(&x);

        let mut log_weights = Vec::with_capacity(model.n_components());
        let mut means = Vec::with_capacity(model.n_components());
        let mut covariances = Vec::with_capacity(model.n_components());
        let mut factors = Vec::with_capacity(model.n_components());

        for comp in &model.components {
            log_weights.push(comp.weight().ln() + comp.log_likelihood(padded.view())?);
            let (m, s) = condition(comp, x, &observed, p, model.variance_floor)?;
            let s = floored(s, model.variance_floor)?;
            let all: Vec<usize> = (0..q).collect();
            factors.push(IndexedFactor::from_scratch(s.view(), &all)?);
            means.push(m);
            covariances.push(s);
        }

        let norm = logsumexp(&log_weights);
        let log_weights = Array1::from_iter(log_weights.iter().map(|v| v - norm));
        Ok(Self {
            predictor: x.to_owned(),
            log_weights,
            means,
            covariances,
            factors,
        })
    }
}

/// Conditional mean and covariance of `y` given the observed predictor entries.
fn condition(
    comp: &GaussianComponent,
    x: ArrayView1<'_, f64>,
    observed: &[usize],
    p: usize,
    floor: f64,
) -> Result<(Array1<f64>, Array2<f64>)> {
    let c = comp.full_covariance();
    let mu = comp.mean();
    let d = mu.len();
    let q = d - p;

    let mut mean = Array1::from_shape_fn(q, |a| mu[p + a]);
    let mut cov = Array2::from_shape_fn((q, q), |(a, b)| c[(p + a, p + b)]);
    if observed.is_empty() || q == 0 {
        return Ok((mean, cov));
    }

    let o = observed.len();
    let c_xx = Array2::from_shape_fn((o, o), |(a, b)| c[(observed[a], observed[b])]);
    let inv = inverse_via_eigen(c_xx.view(), floor)?;
    let c_yx = Array2::from_shape_fn((q, o), |(a, b)| c[(p + a, observed[b])]);
    let gain = c_yx.dot(&inv);
    let diff = Array1::from_iter(observed.iter().map(|&k| x[k] - mu[k]));
    mean += &gain.dot(&diff);
    cov -= &gain.dot(&c_yx.t());
    Ok((mean, cov))
}

impl MixtureModel {
    fn check_dim(&self, x: &ArrayView1<'_, f64>, expected: usize) -> Result<()> {
        if x.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                found: x.len(),
            });
        }
        Ok(())
    }

    /// `ln α_j + ln N(x | μ_j, C_j)` for every component.
    fn joint_log_terms(&self, x: ArrayView1<'_, f64>) -> Result<Vec<f64>> {
        self.check_dim(&x, self.dim)?;
        self.components
            .iter()
            .map(|c| Ok(c.weight().ln() + c.log_likelihood(x)?))
            .collect()
    }

    /// `ln P(x)`; NaN coordinates are marginalised.
    pub fn log_density(&self, x: ArrayView1<'_, f64>) -> Result<f64> {
        Ok(logsumexp(&self.joint_log_terms(x)?))
    }

    /// `P(j | x)` for every component.
    pub fn posteriors(&self, x: ArrayView1<'_, f64>) -> Result<Array1<f64>> {
        let terms = self.joint_log_terms(x)?;
        let norm = logsumexp(&terms);
        Ok(terms.iter().map(|t| (t - norm).exp()).collect())
    }

    /// `ln N(x | μ_j, C_j)` of one component.
    ///
    /// With `predictor_only`, `x` holds just the predictor coordinates and
    /// the rest are marginalised.
    pub fn log_likelihood(
        &self,
        x: ArrayView1<'_, f64>,
        component: usize,
        predictor_only: bool,
    ) -> Result<f64> {
        let comp = self.components.get(component).ok_or(Error::InvalidParameter {
            name: "component",
            message: "index out of range",
        })?;
        if predictor_only {
            self.check_dim(&x, self.predictor_size)?;
            let mut padded = Array1::from_elem(self.dim, f64::NAN);
            padded
                .slice_mut(ndarray::s![..self.predictor_size])
                .assign(&x);
            comp.log_likelihood(padded.view())
        } else {
            self.check_dim(&x, self.dim)?;
            comp.log_likelihood(x)
        }
    }

    /// Fix the predictor `x` of `P(y | x)`; its length must be `predictor_size`.
    pub fn set_predictor(&mut self, x: ArrayView1<'_, f64>) -> Result<()> {
        self.check_dim(&x, self.predictor_size)?;
        self.conditional = Some(Conditional::build(self, x)?);
        Ok(())
    }

    /// Forget the predictor.
    pub fn clear_predictor(&mut self) {
        self.conditional = None;
    }

    /// The current predictor, if any.
    pub fn predictor(&self) -> Option<&Array1<f64>> {
        self.conditional.as_ref().map(|c| &c.predictor)
    }

    fn active_conditional(&self) -> Result<Cow<'_, Conditional>> {
        match &self.conditional {
            Some(c) => Ok(Cow::Borrowed(c)),
            None if self.predictor_size == 0 => {
                Ok(Cow::Owned(Conditional::build(self, Array1::zeros(0).view())?))
            }
            None => Err(Error::PredictorNotSet),
        }
    }

    /// `P(j | x)` under the current predictor.
    pub fn predicted_posteriors(&self) -> Result<Array1<f64>> {
        Ok(self.active_conditional()?.log_weights.mapv(f64::exp))
    }

    /// `E[y | x]`.
    pub fn expectation(&self) -> Result<Array1<f64>> {
        let cond = self.active_conditional()?;
        let mut out = Array1::zeros(self.dim - self.predictor_size);
        for (lw, m) in cond.log_weights.iter().zip(&cond.means) {
            out.scaled_add(lw.exp(), m);
        }
        Ok(out)
    }

    /// `Cov[y | x]` of the mixture (within- plus between-component spread).
    pub fn variance(&self) -> Result<Array2<f64>> {
        let cond = self.active_conditional()?;
        let q = self.dim - self.predictor_size;
        let mean = self.expectation()?;
        let mut out = Array2::zeros((q, q));
        for ((lw, m), s) in cond.log_weights.iter().zip(&cond.means).zip(&cond.covariances) {
            let w = lw.exp();
            out.scaled_add(w, s);
            let diff = m - &mean;
            for a in 0..q {
                for b in 0..q {
                    out[(a, b)] += w * diff[a] * diff[b];
                }
            }
        }
        Ok(out)
    }

    /// `ln P(y | x)`; NaN entries of `y` are marginalised.
    pub fn log_density_predicted(&self, y: ArrayView1<'_, f64>) -> Result<f64> {
        let cond = self.active_conditional()?;
        let q = self.dim - self.predictor_size;
        self.check_dim(&y, q)?;
        let observed: Vec<usize> = (0..q).filter(|&k| !y[k].is_nan()).collect();
        let mut terms = Vec::with_capacity(self.n_components());
        for ((lw, m), (s, factor)) in cond
            .log_weights
            .iter()
            .zip(&cond.means)
            .zip(cond.covariances.iter().zip(&cond.factors))
        {
            let local;
            let f = if observed.len() == q {
                factor
            } else {
                local = IndexedFactor::from_scratch(s.view(), &observed)?;
                &local
            };
            let diff = Array1::from_iter(f.dims().iter().map(|&k| y[k] - m[k]));
            let ll = -0.5
                * (f.len() as f64 * super::component::LN_2PI + f.log_det() + f.mahalanobis(diff.view()));
            terms.push(lw + ll);
        }
        Ok(logsumexp(&terms))
    }

    /// Ancestral sample: a component by weight, then a draw from it.
    ///
    /// With a predictor set the draw is of `y ~ P(y | x)` (length
    /// `D - predictor_size`); otherwise of the full joint (length `D`).
    pub fn generate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Array1<f64>> {
        match &self.conditional {
            Some(cond) => {
                let j = pick(cond.log_weights.iter().map(|lw| lw.exp()), rng);
                let l = cond.factors[j].lower();
                let z: Array1<f64> = Array1::from_shape_fn(l.nrows(), |_| StandardNormal.sample(rng));
                Ok(&cond.means[j] + &l.dot(&z))
            }
            None => {
                let j = pick(self.components.iter().map(GaussianComponent::weight), rng);
                Ok(self.components[j].sample(rng))
            }
        }
    }
}
