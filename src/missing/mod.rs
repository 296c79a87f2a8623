//! Missing-value pattern analysis for the E-step.
//!
//! # Pipeline
//!
//! ```text
//! rows ─(trie)→ distinct patterns ─(k-median)→ clusters ─(MST + messages)→ traversals
//! ```
//!
//! 1. [`discover_patterns`]: each row's NaN mask is pushed through a binary
//!    trie, so identical masks collapse to one pattern in O(D) per row.
//! 2. [`cluster_patterns`]: k-median under Hamming distance groups patterns
//!    into a bounded number of templates; each row belongs to exactly one.
//! 3. [`SpanningTraversal::build`]: per cluster, a minimum spanning tree of
//!    the Hamming graph and an ordering that bounds the number of Cholesky
//!    factors kept alive while walking it.
//!
//! Everything here is training-time scratch state: it depends only on which
//! entries are missing, is built once per training set, and is never
//! persisted with the model.

mod kmedian;
mod pattern;
mod traversal;

pub use kmedian::{cluster_patterns, PatternClustering};
pub use pattern::{discover_patterns, MissingPattern, PatternSet, PatternTrie};
pub use traversal::{
    SpanningTraversal, SpanningTree, TraversalStep, TreeMessages, MAX_GRAPH_EDGES,
};

use crate::error::Result;
use log::debug;
use ndarray::ArrayView2;
use rand::Rng;

/// Patterns, their clustering, and one traversal per cluster.
#[derive(Debug, Clone)]
pub struct MissingPatternClusterer {
    patterns: PatternSet,
    clustering: PatternClustering,
    clusters: Vec<Vec<usize>>,
    traversals: Vec<SpanningTraversal>,
}

impl MissingPatternClusterer {
    /// Analyse `data` (NaN = missing) into at most `k` pattern clusters.
    pub fn fit<R: Rng + ?Sized>(
        data: ArrayView2<'_, f64>,
        k: usize,
        max_iter: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let patterns = discover_patterns(data);
        let clustering = cluster_patterns(&patterns.patterns, k, max_iter, rng)?;

        let mut clusters = vec![Vec::new(); clustering.n_clusters()];
        for (sample, &pid) in patterns.sample_pattern.iter().enumerate() {
            clusters[clustering.assignment[pid]].push(sample);
        }

        let traversals: Vec<SpanningTraversal> = clusters
            .iter()
            .map(|samples| {
                SpanningTraversal::build(samples, &patterns.sample_pattern, &patterns.patterns)
            })
            .collect();

        debug!(
            "{} distinct missing patterns in {} clusters (k-median stopped after {} passes), peak live factors {}",
            patterns.patterns.len(),
            clusters.len(),
            clustering.iterations,
            traversals
                .iter()
                .map(SpanningTraversal::max_live_factors)
                .max()
                .unwrap_or(0)
        );

        Ok(Self {
            patterns,
            clustering,
            clusters,
            traversals,
        })
    }

    /// Distinct patterns and the pattern of every row.
    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    /// Missing pattern of row `sample`.
    pub fn pattern_of(&self, sample: usize) -> &MissingPattern {
        &self.patterns.patterns[self.patterns.sample_pattern[sample]]
    }

    /// The k-median result.
    pub fn clustering(&self) -> &PatternClustering {
        &self.clustering
    }

    /// Template patterns.
    pub fn templates(&self) -> &[MissingPattern] {
        &self.clustering.templates
    }

    /// Rows of each cluster.
    pub fn clusters(&self) -> &[Vec<usize>] {
        &self.clusters
    }

    /// Cluster of row `sample`.
    pub fn sample_cluster(&self, sample: usize) -> usize {
        self.clustering.assignment[self.patterns.sample_pattern[sample]]
    }

    /// One traversal per cluster, aligned with [`Self::clusters`].
    pub fn traversals(&self) -> &[SpanningTraversal] {
        &self.traversals
    }

    /// Whether any row has a missing value.
    pub fn has_missing(&self) -> bool {
        self.patterns.has_missing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn data_with_holes(n: usize, d: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, d), |(i, j)| {
            if (i * 7 + j * 3) % 5 == 0 {
                f64::NAN
            } else {
                (i + j) as f64
            }
        })
    }

    #[test]
    fn test_every_row_in_exactly_one_traversal() {
        let data = data_with_holes(60, 5);
        let mut rng = StdRng::seed_from_u64(1);
        let clusterer = MissingPatternClusterer::fit(data.view(), 3, 20, &mut rng).unwrap();

        let mut seen = vec![0usize; 60];
        for (c, traversal) in clusterer.traversals().iter().enumerate() {
            assert_eq!(traversal.len(), clusterer.clusters()[c].len());
            for step in traversal.steps() {
                seen[step.sample] += 1;
                assert_eq!(clusterer.sample_cluster(step.sample), c);
            }
        }
        assert!(seen.iter().all(|&s| s == 1));
        assert!(clusterer.has_missing());
    }

    #[test]
    fn test_same_covariance_steps_share_pattern() {
        let data = data_with_holes(40, 4);
        let mut rng = StdRng::seed_from_u64(5);
        let clusterer = MissingPatternClusterer::fit(data.view(), 2, 20, &mut rng).unwrap();
        for traversal in clusterer.traversals() {
            let mut stack: Vec<usize> = Vec::new();
            for step in traversal.steps() {
                if step.same_covariance {
                    let top = stack.last().copied().unwrap();
                    assert_eq!(clusterer.pattern_of(top), clusterer.pattern_of(step.sample));
                }
                match (step.releases_source, step.can_free) {
                    (false, false) => stack.push(step.sample),
                    (true, false) => *stack.last_mut().unwrap() = step.sample,
                    (true, true) => {
                        let _ = stack.pop();
                    }
                    (false, true) => {}
                }
            }
        }
    }

    #[test]
    fn test_fit_is_deterministic() {
        let data = data_with_holes(50, 6);
        let a = MissingPatternClusterer::fit(data.view(), 4, 30, &mut StdRng::seed_from_u64(2))
            .unwrap();
        let b = MissingPatternClusterer::fit(data.view(), 4, 30, &mut StdRng::seed_from_u64(2))
            .unwrap();
        assert_eq!(a.clustering(), b.clustering());
        assert_eq!(a.traversals(), b.traversals());
    }
}
