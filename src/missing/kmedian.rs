//! K-median clustering of missing patterns under Hamming distance.
//!
//! The median of a set of bit vectors under Hamming distance is the per-bit
//! majority vote, so the Lloyd-style loop is:
//!
//! 1. **Assign**: each pattern → nearest template (ties → lowest template index)
//! 2. **Update**: each template → bitwise majority of its patterns
//! 3. Repeat until no pattern changes cluster
//!
//! Exact 50/50 votes alternate between "missing" and "observed" so that ties
//! do not systematically bias templates one way.

use super::pattern::MissingPattern;
use crate::error::{Error, Result};
use rand::prelude::*;

/// Templates and the template index of every input pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternClustering {
    /// Representative pattern of each cluster.
    pub templates: Vec<MissingPattern>,
    /// `assignment[p]` is the cluster of pattern `p`.
    pub assignment: Vec<usize>,
    /// Assignment passes performed.
    pub iterations: usize,
}

impl PatternClustering {
    /// Number of clusters.
    pub fn n_clusters(&self) -> usize {
        self.templates.len()
    }
}

fn nearest(pattern: &MissingPattern, templates: &[MissingPattern]) -> usize {
    let mut best = 0;
    let mut best_dist = usize::MAX;
    for (c, template) in templates.iter().enumerate() {
        let dist = pattern.hamming(template);
        if dist < best_dist {
            best_dist = dist;
            best = c;
        }
    }
    best
}

/// Cluster distinct patterns into at most `k` templates.
///
/// `k` is clamped to the number of patterns. Templates start from a random
/// subset of the patterns; an empty cluster is reseeded with a random pattern
/// taken from a cluster that can spare it.
pub fn cluster_patterns<R: Rng + ?Sized>(
    patterns: &[MissingPattern],
    k: usize,
    max_iter: usize,
    rng: &mut R,
) -> Result<PatternClustering> {
    if patterns.is_empty() {
        return Err(Error::EmptyInput);
    }
    if k == 0 {
        return Err(Error::InvalidParameter {
            name: "k_median_clusters",
            message: "must be > 0",
        });
    }
    let d = patterns[0].len();
    if let Some(bad) = patterns.iter().find(|p| p.len() != d) {
        return Err(Error::DimensionMismatch {
            expected: d,
            found: bad.len(),
        });
    }

    let n = patterns.len();
    let k = k.min(n);
    let mut templates: Vec<MissingPattern> = rand::seq::index::sample(rng, n, k)
        .into_iter()
        .map(|i| patterns[i].clone())
        .collect();
    let mut assignment = vec![usize::MAX; n];
    let mut coin = false;
    let mut iterations = 0;

    for _ in 0..max_iter.max(1) {
        iterations += 1;
        let mut changed = false;
        for (i, pattern) in patterns.iter().enumerate() {
            let best = nearest(pattern, &templates);
            if assignment[i] != best {
                assignment[i] = best;
                changed = true;
            }
        }

        let mut counts = vec![0usize; k];
        for &c in &assignment {
            counts[c] += 1;
        }
        for c in 0..k {
            if counts[c] > 0 {
                continue;
            }
            // k <= n, so some other cluster holds at least two patterns.
            let donors: Vec<usize> = (0..n).filter(|&i| counts[assignment[i]] >= 2).collect();
            if donors.is_empty() {
                break;
            }
            let i = donors[rng.random_range(0..donors.len())];
            counts[assignment[i]] -= 1;
            assignment[i] = c;
            counts[c] = 1;
            templates[c] = patterns[i].clone();
            changed = true;
        }

        if !changed {
            break;
        }

        for (c, template) in templates.iter_mut().enumerate() {
            let mut votes = vec![0usize; d];
            let mut size = 0usize;
            for (i, pattern) in patterns.iter().enumerate() {
                if assignment[i] != c {
                    continue;
                }
                size += 1;
                for (v, &bit) in votes.iter_mut().zip(pattern.bits()) {
                    *v += usize::from(bit);
                }
            }
            let bits = votes
                .iter()
                .map(|&v| match (2 * v).cmp(&size) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => {
                        coin = !coin;
                        coin
                    }
                })
                .collect();
            *template = MissingPattern::new(bits);
        }
    }

    Ok(PatternClustering {
        templates,
        assignment,
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(bits: &[u8]) -> MissingPattern {
        MissingPattern::new(bits.iter().map(|&b| b == 1).collect())
    }

    fn two_families() -> Vec<MissingPattern> {
        vec![
            p(&[1, 1, 1, 1, 0, 0, 0, 0]),
            p(&[1, 1, 1, 0, 0, 0, 0, 0]),
            p(&[0, 0, 0, 0, 1, 1, 1, 1]),
            p(&[0, 0, 0, 0, 0, 1, 1, 1]),
        ]
    }

    #[test]
    fn test_kmedian_separates_families() {
        let patterns = two_families();
        for seed in 0..8 {
            let mut rng = StdRng::seed_from_u64(seed);
            let result = cluster_patterns(&patterns, 2, 50, &mut rng).unwrap();
            assert_eq!(result.n_clusters(), 2);
            assert_eq!(result.assignment[0], result.assignment[1]);
            assert_eq!(result.assignment[2], result.assignment[3]);
            assert_ne!(result.assignment[0], result.assignment[2]);
        }
    }

    #[test]
    fn test_kmedian_deterministic_with_seed() {
        let patterns = two_families();
        let a = cluster_patterns(&patterns, 3, 20, &mut StdRng::seed_from_u64(9)).unwrap();
        let b = cluster_patterns(&patterns, 3, 20, &mut StdRng::seed_from_u64(9)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_kmedian_clamps_k() {
        let patterns = vec![p(&[0, 1]), p(&[1, 0])];
        let result = cluster_patterns(&patterns, 5, 10, &mut StdRng::seed_from_u64(0)).unwrap();
        assert_eq!(result.n_clusters(), 2);
        assert_ne!(result.assignment[0], result.assignment[1]);
    }

    #[test]
    fn test_kmedian_no_empty_clusters() {
        let patterns: Vec<MissingPattern> = (0..12)
            .map(|i| MissingPattern::new((0..4).map(|b| (i >> b) & 1 == 1).collect()))
            .collect();
        for seed in 0..10 {
            let result =
                cluster_patterns(&patterns, 6, 30, &mut StdRng::seed_from_u64(seed)).unwrap();
            for c in 0..result.n_clusters() {
                assert!(result.assignment.contains(&c), "cluster {c} empty");
            }
        }
    }

    #[test]
    fn test_kmedian_errors() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(cluster_patterns(&[], 2, 10, &mut rng), Err(Error::EmptyInput));
        assert!(cluster_patterns(&[p(&[0])], 0, 10, &mut rng).is_err());
        assert!(cluster_patterns(&[p(&[0]), p(&[0, 1])], 1, 10, &mut rng).is_err());
    }
}
