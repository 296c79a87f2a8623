//! Gaussian mixture density estimation by EM.
//!
//! ```text
//! P(x) = Σ_j α_j N(x | μ_j, C_j),    α_j >= 0,  Σ_j α_j = 1
//! ```
//!
//! # Training
//!
//! ```text
//! k-means ──→ one-hot posteriors ──→ M-step ──┐
//!                                             ▼
//!                      ┌──── E-step ◄──── stage s ────┐
//!                      ▼                              │
//!                    M-step ─ collapse? ─ replace ─ E-step again
//!                      │                              │
//!                      └──────────────► stage s+1 ────┘
//! ```
//!
//! Missing values are NaN and are marginalised, never imputed with a
//! constant. For General covariances the E-step needs one Cholesky factor of
//! `C[o,o]` per distinct observed set `o`; [`crate::missing`] orders the rows
//! so that each factor is derived from a neighbouring one by a few
//! append/remove updates instead of an O(|o|³) factorization.
//!
//! # Queries
//!
//! A trained [`MixtureModel`] answers `ln P(x)`, posteriors, sampling, and,
//! after [`MixtureModel::set_predictor`], the conditional `P(y | x)` where
//! `x` is the first `predictor_size` coordinates.
//!
//! # Persistence
//!
//! [`ModelState`] is the serialisable form: kind, weights, means, covariance
//! parameters and the predictor size. Caches are rebuilt on load; the
//! missing-pattern analysis is training-only state and is not part of it.

mod component;
mod estimate;
mod query;
mod trainer;

pub use component::{Covariance, GaussianComponent, Imputation};
pub use trainer::{train, GaussMixTrainer, ReplacementEvent, TrainStats, TrainerState};

use crate::config::{check_variance_floor, CovarianceKind};
use crate::error::{Error, Result};
use ndarray::Array1;
use query::Conditional;
use rand::Rng;

/// Tolerance on the sum of the mixing weights.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// A fitted mixture.
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "ModelState", into = "ModelState")
)]
pub struct MixtureModel {
    kind: CovarianceKind,
    dim: usize,
    variance_floor: f64,
    predictor_size: usize,
    components: Vec<GaussianComponent>,
    conditional: Option<Conditional>,
}

impl PartialEq for MixtureModel {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.dim == other.dim
            && self.predictor_size == other.predictor_size
            && self.components == other.components
    }
}

impl MixtureModel {
    /// Assemble a model from components.
    ///
    /// Components must share kind and dimension; weights must be
    /// non-negative and sum to one.
    pub fn new(components: Vec<GaussianComponent>, predictor_size: usize) -> Result<Self> {
        let first = components.first().ok_or(Error::EmptyInput)?;
        let kind = first.covariance().kind();
        let dim = first.dim();
        let variance_floor = first.variance_floor();
        for c in &components {
            if c.dim() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    found: c.dim(),
                });
            }
            if c.covariance().kind() != kind {
                return Err(Error::InvalidParameter {
                    name: "covariance",
                    message: "all components must share one covariance kind",
                });
            }
            if !(c.weight() >= 0.0 && c.weight().is_finite()) {
                return Err(Error::InvalidParameter {
                    name: "weight",
                    message: "must be finite and non-negative",
                });
            }
        }
        let total: f64 = components.iter().map(GaussianComponent::weight).sum();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(Error::InvalidParameter {
                name: "weight",
                message: "weights must sum to 1",
            });
        }
        if predictor_size > dim {
            return Err(Error::InvalidParameter {
                name: "predictor_size",
                message: "exceeds input dimension",
            });
        }
        Ok(Self {
            kind,
            dim,
            variance_floor,
            predictor_size,
            components,
            conditional: None,
        })
    }

    /// Covariance kind shared by every component.
    pub fn kind(&self) -> CovarianceKind {
        self.kind
    }

    /// Input dimension `D`.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of components `L`.
    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    /// Components in index order.
    pub fn components(&self) -> &[GaussianComponent] {
        &self.components
    }

    /// Mixing weights.
    pub fn weights(&self) -> Array1<f64> {
        self.components.iter().map(GaussianComponent::weight).collect()
    }

    /// Minimum variance.
    pub fn variance_floor(&self) -> f64 {
        self.variance_floor
    }

    /// Number of leading coordinates forming the predictor.
    pub fn predictor_size(&self) -> usize {
        self.predictor_size
    }

    pub(crate) fn components_mut(&mut self) -> &mut [GaussianComponent] {
        self.conditional = None;
        &mut self.components
    }

    /// Re-seed component `replaced` from `donor`: new mean sampled from the
    /// donor, covariance copied, and the donor's weight split evenly.
    pub(crate) fn replace_component<R: Rng + ?Sized>(
        &mut self,
        replaced: usize,
        donor: usize,
        rng: &mut R,
    ) -> Result<ReplacementEvent> {
        let donor_weight_before = self.components[donor].weight();
        let mean = self.components[donor].sample(rng);
        let covariance = self.components[donor].covariance().clone();
        let half = donor_weight_before / 2.0;
        let components = self.components_mut();
        components[replaced].set_parameters(mean, covariance)?;
        components[replaced].set_weight(half);
        components[donor].set_weight(half);
        Ok(ReplacementEvent {
            replaced,
            donor,
            donor_weight_before,
            split_weight: half,
        })
    }

    /// Serialisable snapshot.
    pub fn to_state(&self) -> ModelState {
        ModelState {
            kind: self.kind,
            variance_floor: self.variance_floor,
            predictor_size: self.predictor_size,
            components: self
                .components
                .iter()
                .map(|c| ComponentState {
                    weight: c.weight(),
                    mean: c.mean().to_vec(),
                    covariance: c.covariance().clone(),
                })
                .collect(),
        }
    }

    /// Rebuild a model from a snapshot.
    pub fn from_state(state: ModelState) -> Result<Self> {
        check_variance_floor(state.variance_floor)?;
        let components = state
            .components
            .into_iter()
            .map(|c| {
                GaussianComponent::new(c.weight, Array1::from(c.mean), c.covariance, state.variance_floor)
            })
            .collect::<Result<Vec<_>>>()?;
        let model = Self::new(components, state.predictor_size)?;
        if model.kind != state.kind {
            return Err(Error::InvalidParameter {
                name: "kind",
                message: "does not match the component covariances",
            });
        }
        Ok(model)
    }
}

/// Persisted parameters of one component.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ComponentState {
    /// Mixing weight.
    pub weight: f64,
    /// Mean vector.
    pub mean: Vec<f64>,
    /// Covariance parameters.
    pub covariance: Covariance,
}

/// Persisted form of a [`MixtureModel`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModelState {
    /// Covariance kind.
    pub kind: CovarianceKind,
    /// Minimum variance re-applied on load.
    pub variance_floor: f64,
    /// Predictor size for conditional queries.
    pub predictor_size: usize,
    /// One entry per component.
    pub components: Vec<ComponentState>,
}

impl From<MixtureModel> for ModelState {
    fn from(model: MixtureModel) -> Self {
        model.to_state()
    }
}

impl TryFrom<ModelState> for MixtureModel {
    type Error = Error;

    fn try_from(state: ModelState) -> Result<Self> {
        Self::from_state(state)
    }
}
