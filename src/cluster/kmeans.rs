//! K-means seeding for the mixture.
//!
//! Lloyd's algorithm with k-means++ initialization, adapted to rows that
//! contain missing values:
//!
//! ```text
//! dist(x, c) = Σ_{d observed in x} |x_d - c_d|
//! ```
//!
//! Distances use only the observed coordinates of each row (L1, so that a
//! row with many missing entries is not pulled toward centroids with large
//! coordinates). Centroids are averages over a filled copy of the data in
//! which every missing entry is drawn once from `Normal(mean_d, std_d)` of its
//! column; the draws come from the caller's generator, so a seeded run is
//! reproducible.
//!
//! The resulting hard labels become one-hot posteriors for the first M-step
//! of the mixture.

use super::traits::Clustering;
use crate::dataset::{to_array, FeatureStats};
use crate::error::{Error, Result};
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::prelude::*;
use rand_distr::Normal;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// K-means clustering algorithm.
#[derive(Debug, Clone)]
pub struct Kmeans {
    /// Number of clusters.
    k: usize,
    /// Maximum iterations.
    max_iter: usize,
    /// Convergence tolerance on the squared centroid shift.
    tol: f64,
    /// Random seed.
    seed: Option<u64>,
}

impl Kmeans {
    /// Create a new K-means clusterer.
    pub fn new(k: usize) -> Self {
        Self {
            k,
            max_iter: 100,
            tol: 1e-4,
            seed: None,
        }
    }

    /// Set maximum iterations.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Set convergence tolerance.
    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    /// Set random seed for reproducibility.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// L1 distance over the observed coordinates of `point`.
    fn observed_l1(point: &ArrayView1<'_, f64>, centroid: &ArrayView1<'_, f64>) -> f64 {
        point
            .iter()
            .zip(centroid.iter())
            .filter(|(x, _)| !x.is_nan())
            .map(|(x, c)| (x - c).abs())
            .sum()
    }

    fn nearest(point: &ArrayView1<'_, f64>, centroids: &Array2<f64>) -> usize {
        let mut best_cluster = 0;
        let mut best_dist = f64::MAX;
        for (k, centroid) in centroids.rows().into_iter().enumerate() {
            let dist = Self::observed_l1(point, &centroid);
            if dist < best_dist {
                best_dist = dist;
                best_cluster = k;
            }
        }
        best_cluster
    }

    /// Copy of `data` with every NaN replaced by a draw from its column's
    /// `Normal(mean, std)`.
    fn fill_missing<R: Rng + ?Sized>(
        data: ArrayView2<'_, f64>,
        stats: &FeatureStats,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        let mut filled = data.to_owned();
        for j in 0..filled.ncols() {
            let normal =
                Normal::new(stats.mean[j], stats.std[j]).map_err(|e| Error::Other(e.to_string()))?;
            for v in filled.column_mut(j).iter_mut() {
                if v.is_nan() {
                    *v = normal.sample(rng);
                }
            }
        }
        Ok(filled)
    }

    /// Initialize centroids using k-means++ on the filled data.
    fn init_centroids<R: Rng + ?Sized>(
        &self,
        data: ArrayView2<'_, f64>,
        filled: &Array2<f64>,
        rng: &mut R,
    ) -> Array2<f64> {
        let n = data.nrows();
        let d = data.ncols();
        let mut centroids = Array2::zeros((self.k, d));

        let first = rng.random_range(0..n);
        centroids.row_mut(0).assign(&filled.row(first));

        for i in 1..self.k {
            let distances: Vec<f64> = (0..n)
                .map(|j| {
                    let point = data.row(j);
                    (0..i)
                        .map(|c| Self::observed_l1(&point, &centroids.row(c)).powi(2))
                        .fold(f64::MAX, f64::min)
                })
                .collect();

            let total: f64 = distances.iter().sum();
            if total == 0.0 || !total.is_finite() {
                let idx = rng.random_range(0..n);
                centroids.row_mut(i).assign(&filled.row(idx));
                continue;
            }

            let threshold = rng.random::<f64>() * total;
            let mut cumsum = 0.0;
            let mut selected = n - 1;
            for (j, &dist) in distances.iter().enumerate() {
                cumsum += dist;
                if cumsum >= threshold {
                    selected = j;
                    break;
                }
            }
            centroids.row_mut(i).assign(&filled.row(selected));
        }

        centroids
    }

    /// Cluster `data` (NaN = missing), drawing every random decision from `rng`.
    pub fn fit_array<R: Rng + ?Sized>(
        &self,
        data: ArrayView2<'_, f64>,
        stats: &FeatureStats,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        let n = data.nrows();
        let d = data.ncols();
        if n == 0 || d == 0 {
            return Err(Error::EmptyInput);
        }
        if self.k == 0 || self.k > n {
            return Err(Error::InvalidClusterCount {
                requested: self.k,
                n_items: n,
            });
        }
        if stats.mean.len() != d {
            return Err(Error::DimensionMismatch {
                expected: d,
                found: stats.mean.len(),
            });
        }

        let filled = Self::fill_missing(data, stats, rng)?;
        let mut centroids = self.init_centroids(data, &filled, rng);
        let mut labels = vec![0usize; n];

        for _iter in 0..self.max_iter.max(1) {
            // Assignment step - parallel when feature enabled
            #[cfg(feature = "parallel")]
            {
                let centroids_ref = &centroids;
                labels.par_iter_mut().enumerate().for_each(|(i, label)| {
                    *label = Self::nearest(&data.row(i), centroids_ref);
                });
            }

            #[cfg(not(feature = "parallel"))]
            for (i, label) in labels.iter_mut().enumerate() {
                *label = Self::nearest(&data.row(i), &centroids);
            }

            // Update step
            let mut new_centroids = Array2::zeros((self.k, d));
            let mut counts = vec![0usize; self.k];
            for (i, &k) in labels.iter().enumerate() {
                let mut row = new_centroids.row_mut(k);
                row += &filled.row(i);
                counts[k] += 1;
            }
            for k in 0..self.k {
                if counts[k] > 0 {
                    new_centroids
                        .row_mut(k)
                        .mapv_inplace(|v| v / counts[k] as f64);
                } else {
                    // Empty cluster: reseed from a random row
                    let idx = rng.random_range(0..n);
                    new_centroids.row_mut(k).assign(&filled.row(idx));
                }
            }

            let shift: f64 = centroids
                .iter()
                .zip(new_centroids.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum();
            centroids = new_centroids;
            if shift < self.tol {
                break;
            }
        }

        Ok(labels)
    }
}

impl Clustering for Kmeans {
    fn fit_predict(&self, data: &[Vec<f64>]) -> Result<Vec<usize>> {
        let data_arr = to_array(data)?;
        let stats = FeatureStats::from_data(data_arr.view());
        let mut rng: Box<dyn RngCore> = match self.seed {
            Some(s) => Box::new(StdRng::seed_from_u64(s)),
            None => Box::new(rand::rng()),
        };
        self.fit_array(data_arr.view(), &stats, &mut rng)
    }

    fn n_clusters(&self) -> usize {
        self.k
    }
}
