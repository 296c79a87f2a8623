//! The EM training loop.
//!
//! # States
//!
//! ```text
//! Uninitialized ──initialize──► Initialized ──step──► Running{stage} ──step──► ...
//!                                                         │
//!                                         stage == n_stages ──► StageLimitReached
//! ```
//!
//! There is no convergence test: training runs for exactly `n_stages`
//! stages after initialization.
//!
//! # E-step with missing values
//!
//! For General covariances each component walks every pattern cluster's
//! [`SpanningTraversal`], keeping a stack of live [`IndexedFactor`]s:
//!
//! ```text
//! same_covariance  → reuse the factor on top of the stack
//! otherwise        → retarget a copy of the top (or factor from scratch at a root)
//! releases_source  → the parent factor is no longer needed: retarget it in place
//! can_free         → nothing below this step needs the factor: drop it
//! ```
//!
//! # Component collapse
//!
//! After the weights are recomputed, any component below `alpha_min` is
//! re-seeded from the heaviest component (see
//! [`ReplacementEvent`]) and the E-step is redone. Each component is replaced
//! at most once per stage.

use super::component::GaussianComponent;
use super::estimate::{covariance_from_moments, imputed_moments, observed_moments};
use super::query::logsumexp;
use super::{Covariance, MixtureModel};
use crate::cluster::{Clustering, Kmeans, SoftClustering};
use crate::config::{CovarianceKind, GaussMixConfig};
use crate::dataset::{to_array, Dataset, FeatureStats};
use crate::error::{Error, Result};
use crate::linalg::{update_factor_from_previous, IndexedFactor};
use crate::missing::{MissingPatternClusterer, SpanningTraversal};
use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};

/// Where a trainer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Data loaded, no parameters yet.
    Uninitialized,
    /// Parameters seeded, no EM stage run.
    Initialized,
    /// `stage` EM stages completed, more to go.
    Running {
        /// Completed stages.
        stage: usize,
    },
    /// All configured stages completed.
    StageLimitReached,
}

/// A collapsed component re-seeded from a donor.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReplacementEvent {
    /// Index of the component that was replaced.
    pub replaced: usize,
    /// Index of the highest-weight component it was seeded from.
    pub donor: usize,
    /// Donor weight before it was split in half.
    pub donor_weight_before: f64,
    /// Weight given to both the replaced component and the donor, exactly
    /// `donor_weight_before / 2`.
    pub split_weight: f64,
}

/// Training statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrainStats {
    /// EM stages completed.
    pub stages: usize,
    /// Wall-clock time spent in initialization and EM stages.
    pub training_time: Duration,
}

/// Per-component conditional imputations of the last E-step.
#[derive(Debug, Clone)]
struct ImputationStore {
    /// Rows with missing coordinates set to their conditional mean.
    filled: Vec<Array2<f64>>,
    /// Missing dims and conditional covariance of every incomplete row.
    conditional: Vec<Vec<Option<(Vec<usize>, Array2<f64>)>>>,
}

impl ImputationStore {
    fn new(n_components: usize, data: &Array2<f64>) -> Self {
        Self {
            filled: vec![data.clone(); n_components],
            conditional: vec![vec![None; data.nrows()]; n_components],
        }
    }

    fn record(&mut self, component: usize, sample: usize, imputation: super::Imputation) {
        self.filled[component]
            .row_mut(sample)
            .assign(&imputation.filled);
        self.conditional[component][sample] = Some((imputation.missing, imputation.covariance));
    }

    /// `Σ_i w_i Cov(x_m | x_o)` embedded in a `D x D` matrix.
    fn correction(&self, component: usize, weights: ArrayView1<'_, f64>, d: usize) -> Array2<f64> {
        let mut out = Array2::zeros((d, d));
        for (i, entry) in self.conditional[component].iter().enumerate() {
            let Some((missing, cov)) = entry else {
                continue;
            };
            let w = weights[i];
            if w == 0.0 {
                continue;
            }
            for (a, &ma) in missing.iter().enumerate() {
                for (b, &mb) in missing.iter().enumerate() {
                    out[(ma, mb)] += w * cov[(a, b)];
                }
            }
        }
        out
    }
}

/// Execute a traversal for one component, calling `visit` with each row and
/// the factor of the component's covariance over that row's observed dims.
fn walk_factors<F>(
    component: &GaussianComponent,
    traversal: &SpanningTraversal,
    clusterer: &MissingPatternClusterer,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(usize, &IndexedFactor) -> Result<()>,
{
    let full = component.full_covariance().view();
    let broken = || Error::Other("traversal step has no factor to derive from".to_string());
    let mut stack: Vec<IndexedFactor> = Vec::new();

    for step in traversal.steps() {
        if step.same_covariance {
            let top = stack.last().ok_or_else(broken)?;
            visit(step.sample, top)?;
            match (step.releases_source, step.can_free) {
                (false, false) => {
                    let copy = top.clone();
                    stack.push(copy);
                }
                (true, true) => {
                    let _ = stack.pop();
                }
                _ => {}
            }
            continue;
        }

        let observed = clusterer.pattern_of(step.sample).observed_dims();
        if step.releases_source {
            let top = stack.last_mut().ok_or_else(broken)?;
            if top.retarget(&observed, full).is_err() {
                *top = IndexedFactor::from_scratch(full, &observed)?;
            }
            visit(step.sample, top)?;
            if step.can_free {
                let _ = stack.pop();
            }
        } else {
            let factor = match stack.last() {
                Some(source) => update_factor_from_previous(source, &observed, full)
                    .or_else(|_| IndexedFactor::from_scratch(full, &observed))?,
                None => IndexedFactor::from_scratch(full, &observed)?,
            };
            visit(step.sample, &factor)?;
            if !step.can_free {
                stack.push(factor);
            }
        }
    }
    Ok(())
}

/// Drives EM over one training set.
#[derive(Debug, Clone)]
pub struct GaussMixTrainer {
    config: GaussMixConfig,
    data: Array2<f64>,
    stats: FeatureStats,
    rng: StdRng,
    state: TrainerState,
    has_missing: bool,
    clusterer: Option<MissingPatternClusterer>,
    model: Option<MixtureModel>,
    posteriors: Array2<f64>,
    imputation: Option<ImputationStore>,
    replacements: Vec<ReplacementEvent>,
    stage: usize,
    mean_log_likelihood: Option<f64>,
    training_time: Duration,
}

impl GaussMixTrainer {
    /// Load and validate a training set. Nothing is fitted yet.
    pub fn new<D: Dataset + ?Sized>(data: &D, config: GaussMixConfig) -> Result<Self> {
        let data = to_array(data)?;
        config.validate(data.ncols())?;
        if config.n_components > data.nrows() {
            return Err(Error::InvalidClusterCount {
                requested: config.n_components,
                n_items: data.nrows(),
            });
        }
        let stats = FeatureStats::from_data(data.view());
        let rng = StdRng::seed_from_u64(config.seed);
        let has_missing = data.iter().any(|v| v.is_nan());
        let posteriors = Array2::zeros((data.nrows(), config.n_components));
        Ok(Self {
            config,
            data,
            stats,
            rng,
            state: TrainerState::Uninitialized,
            has_missing,
            clusterer: None,
            model: None,
            posteriors,
            imputation: None,
            replacements: Vec::new(),
            stage: 0,
            mean_log_likelihood: None,
            training_time: Duration::ZERO,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// The configuration in use.
    pub fn config(&self) -> &GaussMixConfig {
        &self.config
    }

    /// Current model, once initialized.
    pub fn model(&self) -> Option<&MixtureModel> {
        self.model.as_ref()
    }

    /// Consume the trainer, returning its model.
    pub fn into_model(self) -> Option<MixtureModel> {
        self.model
    }

    /// Posterior matrix of the last E-step (`n x L`).
    pub fn posteriors(&self) -> &Array2<f64> {
        &self.posteriors
    }

    /// Missing-pattern analysis, present when the data has missing values and
    /// the E-step walks factor traversals (General covariance with
    /// `efficient_missing`).
    pub fn missing_patterns(&self) -> Option<&MissingPatternClusterer> {
        self.clusterer.as_ref()
    }

    /// Every replacement performed so far, in order.
    pub fn replacements(&self) -> &[ReplacementEvent] {
        &self.replacements
    }

    /// Mean per-row log-likelihood computed by the last E-step.
    pub fn mean_log_likelihood(&self) -> Option<f64> {
        self.mean_log_likelihood
    }

    /// Stages completed and time spent.
    pub fn stats(&self) -> TrainStats {
        TrainStats {
            stages: self.stage,
            training_time: self.training_time,
        }
    }

    fn uses_traversals(&self) -> bool {
        self.config.covariance == CovarianceKind::General && self.config.efficient_missing
    }

    fn analyse_missing(&mut self) -> Result<()> {
        // Forked unconditionally so the main stream does not depend on whether
        // the patterns are analysed.
        let mut pattern_rng = StdRng::from_rng(&mut self.rng);
        self.clusterer = if self.has_missing && self.uses_traversals() {
            Some(MissingPatternClusterer::fit(
                self.data.view(),
                self.config.k_median_clusters,
                self.config.k_median_max_iter,
                &mut pattern_rng,
            )?)
        } else {
            None
        };
        Ok(())
    }

    /// Seed the mixture with k-means and run the first M-step on its hard
    /// assignments.
    pub fn initialize(&mut self) -> Result<()> {
        let start = Instant::now();
        let (n, d) = self.data.dim();
        let l = self.config.n_components;
        info!(
            "training {} {} components on {} rows x {} features for {} stages",
            l, self.config.covariance, n, d, self.config.n_stages
        );

        self.analyse_missing()?;

        let labels = Kmeans::new(l)
            .with_max_iter(self.config.kmeans_iterations)
            .fit_array(self.data.view(), &self.stats, &mut self.rng)?;
        self.posteriors = Array2::zeros((n, l));
        for (i, &label) in labels.iter().enumerate() {
            self.posteriors[(i, label)] = 1.0;
        }

        let components = (0..l)
            .map(|_| {
                GaussianComponent::new(
                    1.0 / l as f64,
                    Array1::zeros(d),
                    Covariance::identity(self.config.covariance, d),
                    self.config.variance_floor,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        self.model = Some(MixtureModel::new(components, self.config.predictor_size)?);
        self.imputation = None;
        self.update_weights()?;
        self.estimate_parameters()?;

        self.state = TrainerState::Initialized;
        self.training_time += start.elapsed();
        Ok(())
    }

    /// Start EM from an existing model instead of k-means.
    pub fn initialize_from(&mut self, model: MixtureModel) -> Result<()> {
        if model.dim() != self.data.ncols() {
            return Err(Error::DimensionMismatch {
                expected: self.data.ncols(),
                found: model.dim(),
            });
        }
        if model.n_components() != self.config.n_components || model.kind() != self.config.covariance
        {
            return Err(Error::InvalidParameter {
                name: "model",
                message: "component count or covariance kind differs from the configuration",
            });
        }
        let start = Instant::now();
        self.analyse_missing()?;
        self.model = Some(model);
        self.imputation = None;
        self.state = TrainerState::Initialized;
        self.training_time += start.elapsed();
        Ok(())
    }

    /// Run one EM stage (initializing first if needed).
    pub fn step(&mut self) -> Result<()> {
        if self.state == TrainerState::Uninitialized {
            self.initialize()?;
        }
        let start = Instant::now();
        let ll = self.e_step()?;
        self.m_step()?;
        self.stage += 1;
        debug!("stage {}: mean log-likelihood {:.6}", self.stage, ll);

        self.state = if self.stage >= self.config.n_stages {
            TrainerState::StageLimitReached
        } else {
            TrainerState::Running { stage: self.stage }
        };
        self.training_time += start.elapsed();
        Ok(())
    }

    /// Run the remaining stages.
    pub fn train(&mut self) -> Result<TrainStats> {
        if self.state == TrainerState::Uninitialized {
            self.initialize()?;
        }
        while self.stage < self.config.n_stages {
            self.step()?;
        }
        if self.config.n_stages == 0 {
            self.state = TrainerState::StageLimitReached;
        }
        let stats = self.stats();
        info!(
            "trained {} stages in {:.3}s ({} replacements)",
            stats.stages,
            stats.training_time.as_secs_f64(),
            self.replacements.len()
        );
        Ok(stats)
    }

    fn model_ref(&self) -> Result<&MixtureModel> {
        self.model
            .as_ref()
            .ok_or_else(|| Error::Other("trainer is not initialized".to_string()))
    }

    /// Fill the posterior matrix; returns the mean row log-likelihood.
    fn e_step(&mut self) -> Result<f64> {
        let (n, d) = self.data.dim();
        let data = &self.data;
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| Error::Other("trainer is not initialized".to_string()))?;
        let l = model.n_components();
        let clusterer = self.clusterer.as_ref();
        let use_traversal = model.kind() == CovarianceKind::General && self.config.efficient_missing;
        let mut store = if self.config.impute_missing && self.has_missing {
            Some(ImputationStore::new(l, data))
        } else {
            None
        };

        let mut log_terms = Array2::<f64>::zeros((n, l));
        for (j, comp) in model.components().iter().enumerate() {
            let mut column = log_terms.column_mut(j);
            match clusterer {
                Some(c) if use_traversal => {
                    for traversal in c.traversals() {
                        walk_factors(comp, traversal, c, |sample, factor| {
                            let row = data.row(sample);
                            column[sample] = comp.log_likelihood_with_factor(row, factor);
                            if let Some(store) = store.as_mut() {
                                if factor.len() < d {
                                    store.record(j, sample, comp.impute_with_factor(row, factor));
                                }
                            }
                            Ok(())
                        })?;
                    }
                }
                _ => {
                    for i in 0..n {
                        let row = data.row(i);
                        column[i] = comp.log_likelihood(row)?;
                        if let Some(store) = store.as_mut() {
                            let observed: Vec<usize> = (0..d).filter(|&k| !row[k].is_nan()).collect();
                            if observed.len() < d {
                                let factor =
                                    IndexedFactor::from_scratch(comp.full_covariance().view(), &observed)?;
                                store.record(j, i, comp.impute_with_factor(row, &factor));
                            }
                        }
                    }
                }
            }
            let log_weight = comp.weight().ln();
            column.mapv_inplace(|v| v + log_weight);
        }

        let mut total = 0.0;
        let mut posteriors = Array2::zeros((n, l));
        for (i, terms) in log_terms.rows().into_iter().enumerate() {
            let terms = terms.to_vec();
            let norm = logsumexp(&terms);
            if norm.is_finite() {
                total += norm;
                for (j, t) in terms.iter().enumerate() {
                    posteriors[(i, j)] = (t - norm).exp();
                }
            } else {
                posteriors.row_mut(i).fill(1.0 / l as f64);
            }
        }

        self.posteriors = posteriors;
        self.imputation = store;
        let mean = total / n as f64;
        self.mean_log_likelihood = Some(mean);
        Ok(mean)
    }

    /// Weights = mean posterior.
    fn update_weights(&mut self) -> Result<()> {
        let mass = self.posteriors.sum_axis(ndarray::Axis(0));
        let total = mass.sum();
        let model = self
            .model
            .as_mut()
            .ok_or_else(|| Error::Other("trainer is not initialized".to_string()))?;
        let l = model.n_components();
        for (j, comp) in model.components_mut().iter_mut().enumerate() {
            let w = if total > 0.0 {
                mass[j] / total
            } else {
                1.0 / l as f64
            };
            comp.set_weight(w);
        }
        Ok(())
    }

    fn m_step(&mut self) -> Result<()> {
        let l = self.model_ref()?.n_components();
        let mut replaced = vec![false; l];
        loop {
            self.update_weights()?;
            let model = self.model_ref()?;
            let collapsed: Vec<usize> = model
                .components()
                .iter()
                .enumerate()
                .filter(|(j, c)| !replaced[*j] && c.weight() < self.config.alpha_min)
                .map(|(j, _)| j)
                .collect();
            if collapsed.is_empty() {
                break;
            }

            for j in collapsed {
                let model = self
                    .model
                    .as_mut()
                    .ok_or_else(|| Error::Other("trainer is not initialized".to_string()))?;
                let donor = model
                    .components()
                    .iter()
                    .enumerate()
                    .filter(|&(k, _)| k != j)
                    .fold(None, |best: Option<(usize, f64)>, (k, c)| match best {
                        Some((_, w)) if w >= c.weight() => best,
                        _ => Some((k, c.weight())),
                    })
                    .map(|(k, _)| k);
                let Some(donor) = donor else {
                    break;
                };
                let event = model.replace_component(j, donor, &mut self.rng)?;
                debug!(
                    "stage {}: component {} (weight below {}) replaced from component {} (weight {:.6})",
                    self.stage, j, self.config.alpha_min, donor, event.donor_weight_before
                );
                self.replacements.push(event);
                replaced[j] = true;
            }
            let _ = self.e_step()?;
        }
        self.estimate_parameters()
    }

    /// Re-estimate every component's mean and covariance from the posteriors.
    fn estimate_parameters(&mut self) -> Result<()> {
        let kind = self.config.covariance;
        let d = self.data.ncols();
        let n_eigen = self.config.n_eigen_for(d);
        let floor = self.config.variance_floor;
        let model = self
            .model
            .as_mut()
            .ok_or_else(|| Error::Other("trainer is not initialized".to_string()))?;
        let components = model.components_mut();

        for (j, comp) in components.iter_mut().enumerate() {
            let weights = self.posteriors.column(j);
            let moments = match &self.imputation {
                Some(store) => {
                    let correction = store.correction(j, weights, d);
                    imputed_moments(store.filled[j].view(), weights, Some(&correction), kind)
                }
                None => observed_moments(
                    self.data.view(),
                    weights,
                    kind,
                    &self.stats,
                    floor,
                    &mut self.rng,
                )?,
            };
            let Some(moments) = moments else {
                continue;
            };
            let covariance = covariance_from_moments(kind, &moments, n_eigen, floor)?;
            comp.set_parameters(moments.mean, covariance)?;
        }
        Ok(())
    }
}

/// Fit a mixture to `data` with `config`.
pub fn train<D: Dataset + ?Sized>(
    data: &D,
    config: &GaussMixConfig,
) -> Result<(MixtureModel, TrainStats)> {
    let mut trainer = GaussMixTrainer::new(data, config.clone())?;
    let stats = trainer.train()?;
    let model = trainer
        .into_model()
        .ok_or_else(|| Error::Other("training produced no model".to_string()))?;
    Ok((model, stats))
}

impl Clustering for GaussMixConfig {
    fn fit_predict(&self, data: &[Vec<f64>]) -> Result<Vec<usize>> {
        let probs = self.fit_predict_proba(data)?;
        Ok(probs
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            })
            .collect())
    }

    fn n_clusters(&self) -> usize {
        self.n_components
    }
}

impl SoftClustering for GaussMixConfig {
    fn fit_predict_proba(&self, data: &[Vec<f64>]) -> Result<Vec<Vec<f64>>> {
        let (model, _) = train(data, self)?;
        data.iter()
            .map(|row| Ok(model.posteriors(ArrayView1::from(row.as_slice()))?.to_vec()))
            .collect()
    }
}
