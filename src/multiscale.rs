//! Kernel-truncated softmin over a pair of cluster hierarchies.
//!
//! For the entropic kernel `exp(-C/ε)`, two clusters `A`, `B` whose gap
//! `dist(c_A, c_B) - r_A - r_B` satisfies `gap^p / p > TRUNC·ε` contribute
//! less than `exp(-TRUNC) ≈ 5e-15` of any surviving term — below f32
//! resolution — and are dropped without expanding them. Surviving internal
//! pairs expand the larger-radius node; surviving leaf pairs are evaluated
//! exactly. Annealing makes this effective: at early, warm temperatures
//! everything interacts through a handful of coarse pairs, and by the time
//! the temperature is cold the potentials only need local refinement.
//!
//! Truncation decisions are a pure function of `(tree_x, tree_y, ε)` and
//! are rebuilt whenever the ladder moves to a new temperature.
//!
//! # References
//!
//! - Schmitzer (2019). "Stabilized Sparse Scaling Algorithms for Entropy
//!   Regularized Transport Problems" (kernel truncation)
//! - Gray & Moore (2001). "N-Body Problems in Statistical Learning"
//!   (dual-tree traversals)

use log::trace;
use ndarray::{Array1, ArrayView1, ArrayView2};
use rayon::prelude::*;

use crate::cluster::ClusterTree;
use crate::kernel::ground_cost;
use crate::softmin::OnlineLse;

/// Truncation threshold on the cost scale, in units of ε.
pub(crate) const TRUNC: f32 = 33.0;

#[inline]
fn centroid_gap(a: &crate::cluster::Node, b: &crate::cluster::Node, dim: usize) -> f32 {
    let mut sq = 0.0f32;
    for k in 0..dim {
        let d = a.centroid[k] - b.centroid[k];
        sq += d * d;
    }
    (sq.sqrt() - a.radius - b.radius).max(0.0)
}

#[inline]
fn gap_cost(gap: f32, p: u32) -> f32 {
    match p {
        1 => gap,
        _ => 0.5 * gap * gap,
    }
}

/// Multiscale evaluator for one ordered measure pair.
pub(crate) struct TruncatedEval<'a> {
    x: ArrayView2<'a, f32>,
    y: ArrayView2<'a, f32>,
    p: u32,
    tree_x: &'a ClusterTree,
    tree_y: &'a ClusterTree,
    eps: f32,
    /// Per x-leaf ordinal: ids of surviving y leaves.
    rows: Vec<Vec<u32>>,
    /// Per y-leaf ordinal: ids of surviving x leaves.
    cols: Vec<Vec<u32>>,
}

impl<'a> TruncatedEval<'a> {
    pub fn new(
        p: u32,
        x: ArrayView2<'a, f32>,
        y: ArrayView2<'a, f32>,
        tree_x: &'a ClusterTree,
        tree_y: &'a ClusterTree,
    ) -> Self {
        Self {
            x,
            y,
            p,
            tree_x,
            tree_y,
            eps: f32::NAN,
            rows: Vec::new(),
            cols: Vec::new(),
        }
    }

    /// Rebuild the interaction lists for a new temperature.
    pub fn prepare(&mut self, eps: f32) {
        if self.eps == eps && !self.rows.is_empty() {
            return;
        }
        self.eps = eps;
        self.rows = vec![Vec::new(); self.tree_x.n_leaves()];
        self.cols = vec![Vec::new(); self.tree_y.n_leaves()];

        let dim = self.tree_x.dim();
        let cutoff = TRUNC * eps;
        let mut pruned = 0usize;
        let mut kept = 0usize;

        let mut stack = vec![(0u32, 0u32)];
        while let Some((ai, bi)) = stack.pop() {
            let a = &self.tree_x.nodes[ai as usize];
            let b = &self.tree_y.nodes[bi as usize];

            if gap_cost(centroid_gap(a, b, dim), self.p) > cutoff {
                pruned += 1;
                continue;
            }

            match (a.is_leaf(), b.is_leaf()) {
                (true, true) => {
                    kept += 1;
                    self.rows[self.tree_x.leaf_index[ai as usize] as usize].push(bi);
                    self.cols[self.tree_y.leaf_index[bi as usize] as usize].push(ai);
                }
                (false, true) => {
                    for &c in &a.children {
                        stack.push((c, bi));
                    }
                }
                (true, false) => {
                    for &c in &b.children {
                        stack.push((ai, c));
                    }
                }
                (false, false) => {
                    // Expand the coarser side first; its children shrink the
                    // gap bound fastest.
                    if a.radius >= b.radius {
                        for &c in &a.children {
                            stack.push((c, bi));
                        }
                    } else {
                        for &c in &b.children {
                            stack.push((ai, c));
                        }
                    }
                }
            }
        }

        // Far-separated supports at a cold temperature can leave a leaf with
        // nothing to interact with; softmin of an empty set is +∞. Keep the
        // greedily-nearest opposite leaf so potentials stay finite.
        for ord in 0..self.rows.len() {
            if self.rows[ord].is_empty() {
                let leaf = self.tree_x.leaves[ord];
                let nearest = nearest_leaf(self.tree_y, self.tree_x, leaf, dim);
                self.rows[ord].push(nearest);
                self.cols[self.tree_y.leaf_index[nearest as usize] as usize].push(leaf);
            }
        }
        for ord in 0..self.cols.len() {
            if self.cols[ord].is_empty() {
                let leaf = self.tree_y.leaves[ord];
                let nearest = nearest_leaf(self.tree_x, self.tree_y, leaf, dim);
                self.cols[ord].push(nearest);
                self.rows[self.tree_x.leaf_index[nearest as usize] as usize].push(leaf);
            }
        }

        trace!(
            "truncation at eps={:.3e}: {} leaf pairs kept, {} subtrees pruned",
            eps,
            kept,
            pruned
        );
    }

    pub fn softmin_rows(&self, eps: f32, h: &ArrayView1<f32>) -> Array1<f32> {
        debug_assert_eq!(self.eps, eps, "prepare() must run for this eps first");
        softmin_side(
            eps, self.p, &self.x, &self.y, self.tree_x, self.tree_y, &self.rows, h,
        )
    }

    pub fn softmin_cols(&self, eps: f32, h: &ArrayView1<f32>) -> Array1<f32> {
        debug_assert_eq!(self.eps, eps, "prepare() must run for this eps first");
        softmin_side(
            eps, self.p, &self.y, &self.x, self.tree_y, self.tree_x, &self.cols, h,
        )
    }
}

/// Greedy descent to the opposite-tree leaf closest to `from_leaf`.
fn nearest_leaf(into: &ClusterTree, from: &ClusterTree, from_leaf: u32, dim: usize) -> u32 {
    let target = &from.nodes[from_leaf as usize];
    let mut id = 0u32;
    loop {
        let node = &into.nodes[id as usize];
        if node.is_leaf() {
            return id;
        }
        let mut best = node.children[0];
        let mut best_gap = f32::INFINITY;
        for &c in &node.children {
            let gap = centroid_gap(&into.nodes[c as usize], target, dim);
            if gap < best_gap {
                best_gap = gap;
                best = c;
            }
        }
        id = best;
    }
}

/// Exact softmin of each point in the `a`-side leaves against the surviving
/// `b`-side leaves, parallel over `a` leaves.
#[allow(clippy::too_many_arguments)]
fn softmin_side(
    eps: f32,
    p: u32,
    a_pts: &ArrayView2<f32>,
    b_pts: &ArrayView2<f32>,
    tree_a: &ClusterTree,
    tree_b: &ClusterTree,
    lists: &[Vec<u32>],
    h: &ArrayView1<f32>,
) -> Array1<f32> {
    debug_assert_eq!(h.len(), b_pts.nrows());

    let per_leaf: Vec<(u32, Vec<f32>)> = (0..tree_a.n_leaves())
        .into_par_iter()
        .map(|ord| {
            let leaf = &tree_a.nodes[tree_a.leaves[ord] as usize];
            let mut vals = Vec::with_capacity(leaf.len());
            for &ia in &tree_a.perm[leaf.start as usize..leaf.end as usize] {
                let xi = a_pts.row(ia as usize);
                let mut lse = OnlineLse::new();
                for &bid in &lists[ord] {
                    let b = &tree_b.nodes[bid as usize];
                    let mut bm = f32::NEG_INFINITY;
                    let mut terms = Vec::with_capacity(b.len());
                    for &jb in &tree_b.perm[b.start as usize..b.end as usize] {
                        let l = h[jb as usize] - ground_cost(p, &xi, &b_pts.row(jb as usize)) / eps;
                        bm = bm.max(l);
                        terms.push(l);
                    }
                    if bm > f32::NEG_INFINITY {
                        let bs: f32 = terms.iter().map(|&l| (l - bm).exp()).sum();
                        lse.merge(bm, bs);
                    }
                }
                vals.push(-eps * lse.value());
            }
            (tree_a.leaves[ord], vals)
        })
        .collect();

    let mut out = Array1::zeros(a_pts.nrows());
    for (leaf_id, vals) in per_leaf {
        let leaf = &tree_a.nodes[leaf_id as usize];
        for (slot, &ia) in tree_a.perm[leaf.start as usize..leaf.end as usize]
            .iter()
            .enumerate()
        {
            out[ia as usize] = vals[slot];
        }
    }
    out
}
