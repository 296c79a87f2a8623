//! Spanning traversals: the order in which a cluster's samples are visited so
//! that each covariance factor is derived from a neighbouring one.
//!
//! # The Problem
//!
//! Walking a minimum spanning tree of missing patterns depth-first, every node
//! derives its Cholesky factor from its parent's. A node with several children
//! must keep its factor alive until the last child is done, so factors pile up
//! on a stack. The stack height depends on the order children are visited.
//!
//! # The Ordering
//!
//! Let `need(v)` be the peak number of live factors while processing the
//! subtree of `v`, counting `v`'s own factor. Visiting the children in
//! increasing `need` and letting the last child *replace* its parent's factor:
//!
//! ```text
//! need(leaf) = 1
//! need(v)    = max(2, need(c_last), 1 + need(c_second_to_last))
//! ```
//!
//! This is a Strahler-style number, so `need <= log2(n) + 2`.
//!
//! # Two Passes
//!
//! The upward pass computes `need` with the tree rooted at node 0. The downward
//! pass computes, for every node, the `need` of the part of the tree hanging
//! off its parent side, which gives the peak for every choice of root. The root
//! with the smallest peak is kept. Both passes are flat loops over a BFS order.
//!
//! # Executing a Traversal
//!
//! ```text
//! for step in steps:
//!     F = same_covariance ? top : derive(top or scratch, pattern(step.sample))
//!     (releases_source, can_free):
//!         (false, false) -> push F
//!         (false, true)  -> drop F
//!         (true,  false) -> replace top with F
//!         (true,  true)  -> pop top, drop F
//! ```

use super::pattern::MissingPattern;
use log::warn;
use petgraph::algo::min_spanning_tree;
use petgraph::data::Element;
use petgraph::graph::UnGraph;
use std::collections::VecDeque;

/// Above this many candidate edges, building a cluster's graph gets slow.
pub const MAX_GRAPH_EDGES: usize = 1_000_000;

/// One entry of a [`SpanningTraversal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraversalStep {
    /// Dataset row visited at this step.
    pub sample: usize,
    /// Same pattern as the factor it derives from: reuse that factor as is.
    pub same_covariance: bool,
    /// The factor computed here is not needed by any later step.
    pub can_free: bool,
    /// Last child of its parent: the parent's factor may be dropped once this
    /// step's factor has been derived from it.
    pub releases_source: bool,
}

/// An arena tree: parent and children arrays over local node indices.
#[derive(Debug, Clone)]
pub struct SpanningTree {
    parent: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    /// Nodes in breadth-first order from the root.
    order: Vec<usize>,
}

impl SpanningTree {
    /// Root the tree given by undirected `edges` over `n` nodes at `root`.
    ///
    /// Nodes unreachable from `root` are attached to it directly.
    pub fn rooted(n: usize, edges: &[(usize, usize)], root: usize) -> Self {
        let mut adjacency = vec![Vec::new(); n];
        for &(a, b) in edges {
            adjacency[a].push(b);
            adjacency[b].push(a);
        }

        let mut parent = vec![None; n];
        let mut children = vec![Vec::new(); n];
        let mut order = Vec::with_capacity(n);
        let mut seen = vec![false; n];
        let mut queue = VecDeque::new();

        if n > 0 {
            seen[root] = true;
            queue.push_back(root);
        }
        loop {
            while let Some(v) = queue.pop_front() {
                order.push(v);
                for &u in &adjacency[v] {
                    if !seen[u] {
                        seen[u] = true;
                        parent[u] = Some(v);
                        children[v].push(u);
                        queue.push_back(u);
                    }
                }
            }
            match seen.iter().position(|&s| !s) {
                Some(u) => {
                    seen[u] = true;
                    parent[u] = Some(root);
                    children[root].push(u);
                    queue.push_back(u);
                }
                None => break,
            }
        }

        Self {
            parent,
            children,
            order,
        }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    /// True for an empty tree.
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Parent of `v` (None for the root).
    pub fn parent(&self, v: usize) -> Option<usize> {
        self.parent[v]
    }

    /// Children of `v`.
    pub fn children(&self, v: usize) -> &[usize] {
        &self.children[v]
    }

    /// Breadth-first order from the root.
    pub fn bfs_order(&self) -> &[usize] {
        &self.order
    }

    /// All tree neighbours of `v`.
    pub fn neighbors(&self, v: usize) -> impl Iterator<Item = usize> + '_ {
        self.parent[v].into_iter().chain(self.children[v].iter().copied())
    }
}

/// `need` of a node whose subtrees have the given needs.
fn peak(top1: Option<u32>, top2: Option<u32>) -> u32 {
    match (top1, top2) {
        (None, _) => 1,
        (Some(t1), None) => t1.max(2),
        (Some(t1), Some(t2)) => t1.max(t2 + 1).max(2),
    }
}

/// Largest two values of `sorted_desc`, skipping one occurrence of `skip`.
fn top_two_without(sorted_desc: &[u32], skip: Option<u32>) -> (Option<u32>, Option<u32>) {
    let mut out = [None, None];
    let mut filled = 0;
    let mut skipped = skip.is_none();
    for &v in sorted_desc {
        if !skipped && Some(v) == skip {
            skipped = true;
            continue;
        }
        out[filled] = Some(v);
        filled += 1;
        if filled == 2 {
            break;
        }
    }
    (out[0], out[1])
}

/// Upward and downward messages over a tree rooted at its BFS root.
#[derive(Debug, Clone)]
pub struct TreeMessages {
    /// `up[v]`: need of `v`'s subtree.
    pub up: Vec<u32>,
    /// `down[v]`: need of the part of the tree above `v`, seen as a child of `v`.
    pub down: Vec<u32>,
    /// `as_root[v]`: peak live factors when the traversal starts at `v`.
    pub as_root: Vec<u32>,
}

impl TreeMessages {
    /// Run both passes.
    pub fn compute(tree: &SpanningTree) -> Self {
        let n = tree.len();
        let mut up = vec![1u32; n];
        for &v in tree.bfs_order().iter().rev() {
            let mut msgs: Vec<u32> = tree.children(v).iter().map(|&c| up[c]).collect();
            msgs.sort_unstable_by(|a, b| b.cmp(a));
            let (t1, t2) = top_two_without(&msgs, None);
            up[v] = peak(t1, t2);
        }

        let mut down = vec![0u32; n];
        let mut as_root = vec![1u32; n];
        for &p in tree.bfs_order() {
            let mut msgs: Vec<u32> = tree.children(p).iter().map(|&c| up[c]).collect();
            if tree.parent(p).is_some() {
                msgs.push(down[p]);
            }
            msgs.sort_unstable_by(|a, b| b.cmp(a));

            let (t1, t2) = top_two_without(&msgs, None);
            as_root[p] = peak(t1, t2);

            for &c in tree.children(p) {
                let (t1, t2) = top_two_without(&msgs, Some(up[c]));
                down[c] = peak(t1, t2);
            }
        }

        Self { up, down, as_root }
    }

    /// Need of the neighbour `u` of `v` when the traversal comes from `v`.
    fn toward(&self, tree: &SpanningTree, v: usize, u: usize) -> u32 {
        if tree.parent(u) == Some(v) {
            self.up[u]
        } else {
            self.down[v]
        }
    }
}

/// Visiting order of one cluster's samples. See the module docs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpanningTraversal {
    steps: Vec<TraversalStep>,
}

impl SpanningTraversal {
    /// Build the traversal of `samples` (dataset rows), where
    /// `patterns[sample_pattern[i]]` is the missing pattern of row `i`.
    ///
    /// The minimum spanning tree is computed over the distinct patterns of the
    /// cluster; further samples sharing a pattern hang off its first sample
    /// with distance zero.
    pub fn build(samples: &[usize], sample_pattern: &[usize], patterns: &[MissingPattern]) -> Self {
        let n = samples.len();
        if n == 0 {
            return Self::default();
        }

        // local pattern groups, in order of first appearance
        let mut group_of_pattern = std::collections::HashMap::new();
        let mut representatives: Vec<usize> = Vec::new();
        let mut local_pattern = Vec::with_capacity(n);
        let mut edges = Vec::with_capacity(n);
        for (local, &sample) in samples.iter().enumerate() {
            let pid = sample_pattern[sample];
            local_pattern.push(pid);
            match group_of_pattern.get(&pid) {
                Some(&rep) => edges.push((rep, local)),
                None => {
                    let _ = group_of_pattern.insert(pid, local);
                    representatives.push(local);
                }
            }
        }

        let m = representatives.len();
        let candidate_edges = m * m.saturating_sub(1) / 2;
        if candidate_edges > MAX_GRAPH_EDGES {
            warn!(
                "missing-pattern graph has {} edges over {} patterns; traversal construction will be slow",
                candidate_edges, m
            );
        }

        let mut graph = UnGraph::<usize, usize>::with_capacity(m, candidate_edges);
        let nodes: Vec<_> = representatives.iter().map(|&r| graph.add_node(r)).collect();
        for a in 0..m {
            let pa = &patterns[local_pattern[representatives[a]]];
            for b in (a + 1)..m {
                let pb = &patterns[local_pattern[representatives[b]]];
                let _ = graph.add_edge(nodes[a], nodes[b], pa.hamming(pb));
            }
        }
        for element in min_spanning_tree(&graph) {
            if let Element::Edge { source, target, .. } = element {
                edges.push((representatives[source], representatives[target]));
            }
        }

        let tree = SpanningTree::rooted(n, &edges, 0);
        let messages = TreeMessages::compute(&tree);
        let root = (0..n)
            .min_by_key(|&v| (messages.as_root[v], v))
            .unwrap_or(0);

        let distance = |a: usize, b: usize| -> usize {
            patterns[local_pattern[a]].hamming(&patterns[local_pattern[b]])
        };

        let mut steps = Vec::with_capacity(n);
        let mut stack: Vec<(usize, Option<usize>, bool)> = vec![(root, None, false)];
        while let Some((v, from, is_last)) = stack.pop() {
            let mut next: Vec<usize> = tree.neighbors(v).filter(|&u| Some(u) != from).collect();
            next.sort_by_key(|&u| (messages.toward(&tree, v, u), distance(v, u), u));

            steps.push(TraversalStep {
                sample: samples[v],
                same_covariance: from.is_some_and(|f| local_pattern[f] == local_pattern[v]),
                can_free: next.is_empty(),
                releases_source: is_last,
            });

            let last = next.len().wrapping_sub(1);
            for (pos, &u) in next.iter().enumerate().rev() {
                stack.push((u, Some(v), pos == last));
            }
        }

        Self { steps }
    }

    /// Traversal of a list of patterns, one sample per pattern.
    pub fn from_patterns(patterns: &[MissingPattern]) -> Self {
        let samples: Vec<usize> = (0..patterns.len()).collect();
        Self::build(&samples, &samples, patterns)
    }

    /// The steps, in visiting order.
    pub fn steps(&self) -> &[TraversalStep] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True for an empty traversal.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Peak number of factors alive at once when executing the traversal:
    /// the stack plus the one being derived.
    pub fn max_live_factors(&self) -> usize {
        let mut depth = 0usize;
        let mut peak = 0usize;
        for step in &self.steps {
            peak = peak.max(depth + 1);
            match (step.releases_source, step.can_free) {
                (false, false) => depth += 1,
                (false, true) | (true, false) => {}
                (true, true) => depth = depth.saturating_sub(1),
            }
        }
        peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn p(bits: &[u8]) -> MissingPattern {
        MissingPattern::new(bits.iter().map(|&b| b == 1).collect())
    }

    /// Replays the stack discipline and checks every step derives from its
    /// tree parent's pattern.
    fn replay(traversal: &SpanningTraversal, patterns: &[MissingPattern]) -> Vec<usize> {
        let mut stack: Vec<usize> = Vec::new();
        let mut visited = Vec::new();
        for step in traversal.steps() {
            let pattern = step.sample;
            if step.same_covariance {
                let top = *stack.last().expect("same_covariance needs a source");
                assert_eq!(patterns[top], patterns[pattern]);
            }
            match (step.releases_source, step.can_free) {
                (false, false) => stack.push(pattern),
                (false, true) => {}
                (true, false) => *stack.last_mut().expect("source to replace") = pattern,
                (true, true) => {
                    stack.pop().expect("source to release");
                }
            }
            visited.push(pattern);
        }
        assert!(stack.is_empty(), "factors leaked: {:?}", stack);
        visited
    }

    #[test]
    fn test_single_sample_traversal() {
        let t = SpanningTraversal::from_patterns(&[p(&[1, 0, 0])]);
        assert_eq!(
            t.steps(),
            &[TraversalStep {
                sample: 0,
                same_covariance: false,
                can_free: true,
                releases_source: false,
            }]
        );
        assert_eq!(t.max_live_factors(), 1);
    }

    #[test]
    fn test_known_five_node_tree() {
        // center 0000 with leaves 1000, 0010, 0001; 1100 hangs off 1000
        let patterns = vec![
            p(&[0, 0, 0, 0]),
            p(&[1, 0, 0, 0]),
            p(&[1, 1, 0, 0]),
            p(&[0, 0, 1, 0]),
            p(&[0, 0, 0, 1]),
        ];
        let t = SpanningTraversal::from_patterns(&patterns);
        assert_eq!(t.len(), 5);
        let mut visited = replay(&t, &patterns);
        visited.sort_unstable();
        assert_eq!(visited, vec![0, 1, 2, 3, 4]);

        let bound = (5f64).log2().ceil() as usize + 1;
        assert!(t.max_live_factors() <= bound);
        assert!(t.max_live_factors() <= 2);
    }

    #[test]
    fn test_duplicate_patterns_reuse_factor() {
        let patterns = vec![p(&[0, 1]), p(&[1, 0])];
        // rows 0,2,3 share pattern 0; row 1 has pattern 1
        let sample_pattern = vec![0, 1, 0, 0];
        let t = SpanningTraversal::build(&[0, 1, 2, 3], &sample_pattern, &patterns);
        assert_eq!(t.len(), 4);
        let same = t.steps().iter().filter(|s| s.same_covariance).count();
        assert_eq!(same, 2);
        assert!(!t.steps()[0].same_covariance);
    }

    #[test]
    fn test_messages_on_binary_tree() {
        // complete binary tree of 7 nodes rooted at 0
        let edges = vec![(0, 1), (0, 2), (1, 3), (1, 4), (2, 5), (2, 6)];
        let tree = SpanningTree::rooted(7, &edges, 0);
        let msgs = TreeMessages::compute(&tree);
        assert_eq!(msgs.up[3], 1);
        assert_eq!(msgs.up[1], 2);
        assert_eq!(msgs.up[0], 3);
        // starting from a leaf turns the path to the far side into a chain
        assert_eq!(msgs.as_root[3], 2);
        assert_eq!(msgs.as_root[0], 3);
    }

    #[test]
    fn test_chain_needs_two() {
        let edges = vec![(0, 1), (1, 2), (2, 3), (3, 4)];
        let tree = SpanningTree::rooted(5, &edges, 2);
        let msgs = TreeMessages::compute(&tree);
        assert_eq!(msgs.as_root[0], 2);
        assert_eq!(msgs.as_root[2], 3);
    }

    #[test]
    fn test_rooted_attaches_disconnected_nodes() {
        let tree = SpanningTree::rooted(3, &[(0, 1)], 0);
        assert_eq!(tree.parent(2), Some(0));
        assert_eq!(tree.bfs_order().len(), 3);
    }

    proptest! {
        #[test]
        fn traversal_is_a_valid_schedule(
            raw in proptest::collection::vec(proptest::collection::vec(any::<bool>(), 6), 1..40),
        ) {
            let patterns: Vec<MissingPattern> = raw.into_iter().map(MissingPattern::new).collect();
            let t = SpanningTraversal::from_patterns(&patterns);
            let mut visited = replay(&t, &patterns);
            visited.sort_unstable();
            prop_assert_eq!(visited, (0..patterns.len()).collect::<Vec<_>>());

            let n = patterns.len() as f64;
            prop_assert!(t.max_live_factors() <= n.log2().floor() as usize + 2);
        }
    }
}
