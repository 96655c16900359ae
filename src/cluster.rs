//! Spatial cluster hierarchy over a measure's support.
//!
//! An octree-style subdivision (2^d children per node, d ≤ 3): each node
//! owns a contiguous range of a permuted index array — a view into the
//! caller's point order, never a copy — plus its aggregated weight, weighted
//! centroid and covering radius. The tree is an arena of nodes addressed by
//! integer id, built once per call and read-only afterwards, so concurrent
//! traversals need no synchronization.
//!
//! Construction is a pure function of the input: the split point is always
//! the bounding-box center, recursion stops at [`LEAF_SIZE`] points, and
//! ties are resolved by index order. Identical input yields an identical
//! tree.

use ndarray::{ArrayView1, ArrayView2};

use crate::{Error, Result, MULTISCALE_MAX_DIM};

/// Max points a leaf may own.
pub const LEAF_SIZE: usize = 16;

/// Recursion limit; reached only by pathological coincident-point inputs.
const MAX_DEPTH: usize = 32;

/// One cluster in the arena.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    /// Owned range `perm[start..end]`.
    pub start: u32,
    pub end: u32,
    /// Child node ids; empty for leaves.
    pub children: Vec<u32>,
    /// Sum of owned weights.
    pub weight: f32,
    /// Weighted mean position (plain mean if the owned weight is zero).
    pub centroid: [f32; 3],
    /// Max distance from the centroid to any owned point.
    pub radius: f32,
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }
}

/// Octree arena over one point set. Root is node 0.
#[derive(Debug, Clone)]
pub struct ClusterTree {
    dim: usize,
    n_points: usize,
    pub(crate) perm: Vec<u32>,
    pub(crate) nodes: Vec<Node>,
    /// Ids of leaf nodes, in depth-first order.
    pub(crate) leaves: Vec<u32>,
    /// Leaf ordinal per node id; `u32::MAX` for internal nodes.
    pub(crate) leaf_index: Vec<u32>,
}

impl ClusterTree {
    /// Build the hierarchy for `(N, d)` positions with per-point weights.
    pub fn build(positions: &ArrayView2<f32>, weights: &ArrayView1<f32>) -> Result<Self> {
        let n = positions.nrows();
        let dim = positions.ncols();
        if dim == 0 || dim > MULTISCALE_MAX_DIM {
            return Err(Error::Domain("cluster hierarchy supports dimensions 1..=3"));
        }
        if n == 0 {
            return Err(Error::Domain("cannot cluster an empty point set"));
        }
        if weights.len() != n {
            return Err(Error::WeightCountMismatch(weights.len(), n));
        }

        let mut tree = Self {
            dim,
            n_points: n,
            perm: (0..n as u32).collect(),
            nodes: Vec::new(),
            leaves: Vec::new(),
            leaf_index: Vec::new(),
        };

        let mut lo = [f32::INFINITY; 3];
        let mut hi = [f32::NEG_INFINITY; 3];
        for i in 0..n {
            for k in 0..dim {
                let v = positions[[i, k]];
                lo[k] = lo[k].min(v);
                hi[k] = hi[k].max(v);
            }
        }

        tree.split(positions, weights, 0, n, lo, hi, 0);
        tree.enforce_radius_monotonicity(0);

        tree.leaf_index = vec![u32::MAX; tree.nodes.len()];
        for (ord, &id) in tree.leaves.iter().enumerate() {
            tree.leaf_index[id as usize] = ord as u32;
        }
        Ok(tree)
    }

    /// Number of points the tree covers.
    pub fn n_points(&self) -> usize {
        self.n_points
    }

    /// Ambient dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of nodes in the arena.
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaves.
    pub fn n_leaves(&self) -> usize {
        self.leaves.len()
    }

    /// Recursively subdivide `perm[start..end]`; returns the new node id.
    fn split(
        &mut self,
        positions: &ArrayView2<f32>,
        weights: &ArrayView1<f32>,
        start: usize,
        end: usize,
        lo: [f32; 3],
        hi: [f32; 3],
        depth: usize,
    ) -> u32 {
        let id = self.nodes.len() as u32;
        let (weight, centroid, radius) = self.summarize(positions, weights, start, end);
        self.nodes.push(Node {
            start: start as u32,
            end: end as u32,
            children: Vec::new(),
            weight,
            centroid,
            radius,
        });

        let count = end - start;
        if count <= LEAF_SIZE || depth >= MAX_DEPTH {
            self.leaves.push(id);
            return id;
        }

        let n_octants = 1usize << self.dim;
        let mut lo = lo;
        let mut hi = hi;
        let mut buckets: Vec<Vec<u32>>;
        let mut mid = [0.0f32; 3];

        // Tighten the box while every point falls into a single octant, so
        // corner-clustered data never produces chains of single-child nodes.
        let mut tighten = 0;
        loop {
            if (0..self.dim).all(|k| hi[k] - lo[k] <= 0.0) || tighten >= MAX_DEPTH {
                // Coincident (or float-indistinguishable) points.
                self.leaves.push(id);
                return id;
            }
            for k in 0..self.dim {
                mid[k] = 0.5 * (lo[k] + hi[k]);
            }

            buckets = vec![Vec::new(); n_octants];
            for &idx in &self.perm[start..end] {
                let mut o = 0usize;
                for k in 0..self.dim {
                    if positions[[idx as usize, k]] > mid[k] {
                        o |= 1 << k;
                    }
                }
                buckets[o].push(idx);
            }

            let occupied: Vec<usize> = (0..n_octants).filter(|&o| !buckets[o].is_empty()).collect();
            if occupied.len() > 1 {
                break;
            }
            let o = occupied[0];
            for k in 0..self.dim {
                if o & (1 << k) != 0 {
                    lo[k] = mid[k];
                } else {
                    hi[k] = mid[k];
                }
            }
            tighten += 1;
        }

        // Stable counting partition of perm[start..end] into octants.
        let mut cursor = start;
        let mut ranges = Vec::with_capacity(n_octants);
        for bucket in &buckets {
            let b_start = cursor;
            for &idx in bucket {
                self.perm[cursor] = idx;
                cursor += 1;
            }
            ranges.push((b_start, cursor));
        }
        debug_assert_eq!(cursor, end);

        let mut children = Vec::new();
        for (o, &(b_start, b_end)) in ranges.iter().enumerate() {
            if b_start == b_end {
                continue;
            }
            let mut c_lo = lo;
            let mut c_hi = hi;
            for k in 0..self.dim {
                if o & (1 << k) != 0 {
                    c_lo[k] = mid[k];
                } else {
                    c_hi[k] = mid[k];
                }
            }
            children.push(self.split(positions, weights, b_start, b_end, c_lo, c_hi, depth + 1));
        }

        self.nodes[id as usize].children = children;
        id
    }

    fn summarize(
        &self,
        positions: &ArrayView2<f32>,
        weights: &ArrayView1<f32>,
        start: usize,
        end: usize,
    ) -> (f32, [f32; 3], f32) {
        let mut wsum = 0.0f64;
        let mut acc = [0.0f64; 3];
        for &idx in &self.perm[start..end] {
            let w = weights[idx as usize] as f64;
            wsum += w;
            for k in 0..self.dim {
                acc[k] += w * positions[[idx as usize, k]] as f64;
            }
        }

        let mut centroid = [0.0f32; 3];
        if wsum > 0.0 {
            for k in 0..self.dim {
                centroid[k] = (acc[k] / wsum) as f32;
            }
        } else {
            // Zero-mass cluster: fall back to the unweighted mean.
            let count = (end - start) as f64;
            let mut acc = [0.0f64; 3];
            for &idx in &self.perm[start..end] {
                for k in 0..self.dim {
                    acc[k] += positions[[idx as usize, k]] as f64;
                }
            }
            for k in 0..self.dim {
                centroid[k] = (acc[k] / count) as f32;
            }
        }

        let mut radius_sq = 0.0f32;
        for &idx in &self.perm[start..end] {
            let mut sq = 0.0f32;
            for k in 0..self.dim {
                let d = positions[[idx as usize, k]] - centroid[k];
                sq += d * d;
            }
            radius_sq = radius_sq.max(sq);
        }

        (wsum as f32, centroid, radius_sq.sqrt())
    }

    /// Covering radii must not grow downward: widen a parent to its largest
    /// child if the weighted centroids ever make a child stick out. The
    /// widened radius is still a valid upper bound.
    fn enforce_radius_monotonicity(&mut self, id: u32) -> f32 {
        let children = self.nodes[id as usize].children.clone();
        let mut r = self.nodes[id as usize].radius;
        for c in children {
            r = r.max(self.enforce_radius_monotonicity(c));
        }
        self.nodes[id as usize].radius = r;
        r
    }
}
