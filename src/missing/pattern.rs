//! Missing-value patterns and their discovery.

use ndarray::ArrayView2;

/// Which dimensions of a sample are unobserved (`true` = missing).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MissingPattern {
    bits: Vec<bool>,
}

impl MissingPattern {
    /// Wrap a bit vector (`true` = missing).
    pub fn new(bits: Vec<bool>) -> Self {
        Self { bits }
    }

    /// Pattern of a row, where NaN marks a missing value.
    pub fn from_row(row: &[f64]) -> Self {
        Self {
            bits: row.iter().map(|v| v.is_nan()).collect(),
        }
    }

    /// Pattern with every dimension observed.
    pub fn complete(d: usize) -> Self {
        Self {
            bits: vec![false; d],
        }
    }

    /// Number of dimensions.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True for a zero-dimensional pattern.
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Whether dimension `d` is missing.
    pub fn is_missing(&self, d: usize) -> bool {
        self.bits[d]
    }

    /// The raw bits.
    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    /// Number of missing dimensions.
    pub fn n_missing(&self) -> usize {
        self.bits.iter().filter(|&&b| b).count()
    }

    /// Observed dimensions, ascending.
    pub fn observed_dims(&self) -> Vec<usize> {
        (0..self.bits.len()).filter(|&d| !self.bits[d]).collect()
    }

    /// Missing dimensions, ascending.
    pub fn missing_dims(&self) -> Vec<usize> {
        (0..self.bits.len()).filter(|&d| self.bits[d]).collect()
    }

    /// Number of positions where the two patterns differ.
    pub fn hamming(&self, other: &MissingPattern) -> usize {
        self.bits
            .iter()
            .zip(other.bits.iter())
            .filter(|(a, b)| a != b)
            .count()
    }
}

/// Binary trie over pattern bits; identical patterns share a leaf.
#[derive(Debug, Clone)]
pub struct PatternTrie {
    /// `children[node][bit]`, indices into the arena.
    children: Vec<[Option<usize>; 2]>,
    /// Pattern index stored at a leaf.
    leaf: Vec<Option<usize>>,
    depth: usize,
}

impl PatternTrie {
    /// Empty trie for patterns of length `depth`.
    pub fn new(depth: usize) -> Self {
        Self {
            children: vec![[None, None]],
            leaf: vec![None],
            depth,
        }
    }

    /// Insert a pattern given by its bits; returns `(index, is_new)`.
    ///
    /// `next_index` is assigned when the pattern was not seen before. O(D).
    pub fn insert<I: IntoIterator<Item = bool>>(&mut self, bits: I, next_index: usize) -> (usize, bool) {
        let mut node = 0;
        let mut seen = 0;
        for bit in bits {
            seen += 1;
            let b = usize::from(bit);
            node = match self.children[node][b] {
                Some(child) => child,
                None => {
                    let child = self.children.len();
                    self.children.push([None, None]);
                    self.leaf.push(None);
                    self.children[node][b] = Some(child);
                    child
                }
            };
        }
        debug_assert_eq!(seen, self.depth);
        match self.leaf[node] {
            Some(idx) => (idx, false),
            None => {
                self.leaf[node] = Some(next_index);
                (next_index, true)
            }
        }
    }
}

/// Distinct patterns of a dataset and the pattern index of every sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternSet {
    /// Distinct patterns, in order of first appearance.
    pub patterns: Vec<MissingPattern>,
    /// `sample_pattern[i]` indexes `patterns`.
    pub sample_pattern: Vec<usize>,
}

impl PatternSet {
    /// Number of samples with `pattern`.
    pub fn count(&self, pattern: usize) -> usize {
        self.sample_pattern.iter().filter(|&&p| p == pattern).count()
    }

    /// Whether any sample has a missing value.
    pub fn has_missing(&self) -> bool {
        self.patterns.iter().any(|p| p.n_missing() > 0)
    }
}

/// Collapse the rows of `data` (NaN = missing) to their distinct patterns.
pub fn discover_patterns(data: ArrayView2<'_, f64>) -> PatternSet {
    let mut trie = PatternTrie::new(data.ncols());
    let mut patterns = Vec::new();
    let mut sample_pattern = Vec::with_capacity(data.nrows());

    for row in data.rows() {
        let (idx, is_new) = trie.insert(row.iter().map(|v| v.is_nan()), patterns.len());
        if is_new {
            patterns.push(MissingPattern::new(row.iter().map(|v| v.is_nan()).collect()));
        }
        sample_pattern.push(idx);
    }

    PatternSet {
        patterns,
        sample_pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_hamming_and_dims() {
        let a = MissingPattern::new(vec![true, false, false, true]);
        let b = MissingPattern::new(vec![false, false, true, true]);
        assert_eq!(a.hamming(&b), 2);
        assert_eq!(a.observed_dims(), vec![1, 2]);
        assert_eq!(a.missing_dims(), vec![0, 3]);
        assert_eq!(a.n_missing(), 2);
    }

    #[test]
    fn test_discover_collapses_identical_patterns() {
        let nan = f64::NAN;
        let data = array![
            [1.0, nan, 3.0],
            [4.0, 5.0, 6.0],
            [7.0, nan, 9.0],
            [nan, nan, 1.0],
            [2.0, 2.0, 2.0],
        ];
        let set = discover_patterns(data.view());
        assert_eq!(set.patterns.len(), 3);
        assert_eq!(set.sample_pattern, vec![0, 1, 0, 2, 1]);
        assert_eq!(set.patterns[0].bits(), &[false, true, false]);
        assert_eq!(set.count(0), 2);
        assert!(set.has_missing());
    }

    #[test]
    fn test_discover_no_missing() {
        let data = array![[1.0, 2.0], [3.0, 4.0]];
        let set = discover_patterns(data.view());
        assert_eq!(set.patterns, vec![MissingPattern::complete(2)]);
        assert!(!set.has_missing());
    }

    #[test]
    fn test_trie_prefix_patterns_are_distinct() {
        let mut trie = PatternTrie::new(2);
        assert_eq!(trie.insert([false, true], 0), (0, true));
        assert_eq!(trie.insert([false, false], 1), (1, true));
        assert_eq!(trie.insert([false, true], 2), (0, false));
    }
}
