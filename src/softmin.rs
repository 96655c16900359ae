//! Softmin (log-sum-exp) reductions over pairwise costs.
//!
//! Everything the Sinkhorn loop needs from a backend is one reduction:
//!
//! \[
//! \text{out}[i] = -\varepsilon \log \sum_j \exp\big(h_j - C(x_i, y_j)/\varepsilon\big)
//! \]
//!
//! computed with max-subtraction so that no raw exponential of an unbounded
//! quantity is ever taken. The dense path materializes the cost tile once
//! and reuses it across iterations; the streaming path recomputes costs
//! tile-by-tile and keeps memory linear in the point count; the multiscale
//! path (see [`crate::multiscale`]) additionally skips cluster pairs that
//! cannot contribute above floating-point precision.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;

use crate::kernel::{ground_cost, ground_cost_grad};
use crate::logsumexp_by;
use crate::multiscale::TruncatedEval;

/// Column-block width for the streaming reductions.
pub(crate) const BLOCK: usize = 1_024;

/// Running log-sum-exp accumulator: merge per-block `(max, sum)` pairs
/// without ever exponentiating an unshifted term.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OnlineLse {
    m: f32,
    s: f32,
}

impl OnlineLse {
    pub fn new() -> Self {
        Self {
            m: f32::NEG_INFINITY,
            s: 0.0,
        }
    }

    /// Fold one block's `(max, sum-of-shifted-exps)` into the running state.
    pub fn merge(&mut self, bm: f32, bs: f32) {
        if bs <= 0.0 || bm == f32::NEG_INFINITY {
            return;
        }
        if bm <= self.m {
            self.s += bs * (bm - self.m).exp();
        } else {
            self.s = self.s * (self.m - bm).exp() + bs;
            self.m = bm;
        }
    }

    pub fn value(&self) -> f32 {
        if self.s <= 0.0 {
            f32::NEG_INFINITY
        } else {
            self.m + self.s.ln()
        }
    }
}

/// Dense evaluator: the full cost tile, built once per solve.
pub(crate) struct DenseEval {
    cost: Array2<f32>,
}

impl DenseEval {
    pub fn new(p: u32, x: &ArrayView2<f32>, y: &ArrayView2<f32>) -> Self {
        let n = x.nrows();
        let m = y.nrows();
        let rows: Vec<Vec<f32>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let xi = x.row(i);
                (0..m).map(|j| ground_cost(p, &xi, &y.row(j))).collect()
            })
            .collect();
        let mut cost = Array2::zeros((n, m));
        for (i, row) in rows.into_iter().enumerate() {
            for (j, c) in row.into_iter().enumerate() {
                cost[[i, j]] = c;
            }
        }
        Self { cost }
    }

    pub fn softmin_rows(&self, eps: f32, h: &ArrayView1<f32>) -> Array1<f32> {
        softmin_tile(eps, &self.cost.view(), h)
    }

    pub fn softmin_cols(&self, eps: f32, h: &ArrayView1<f32>) -> Array1<f32> {
        softmin_tile(eps, &self.cost.t(), h)
    }
}

/// Row softmin over a materialized cost tile.
fn softmin_tile(eps: f32, cost: &ArrayView2<f32>, h: &ArrayView1<f32>) -> Array1<f32> {
    debug_assert_eq!(cost.ncols(), h.len());
    let m = cost.ncols();
    let out: Vec<f32> = (0..cost.nrows())
        .into_par_iter()
        .map(|i| {
            let row = cost.row(i);
            -eps * logsumexp_by(m, |j| h[j] - row[j] / eps)
        })
        .collect();
    Array1::from_vec(out)
}

/// Streaming evaluator: positions only, costs recomputed per tile.
pub(crate) struct StreamEval<'a> {
    pub x: ArrayView2<'a, f32>,
    pub y: ArrayView2<'a, f32>,
    pub p: u32,
}

impl<'a> StreamEval<'a> {
    pub fn new(p: u32, x: ArrayView2<'a, f32>, y: ArrayView2<'a, f32>) -> Self {
        Self { x, y, p }
    }

    pub fn softmin_rows(&self, eps: f32, h: &ArrayView1<f32>) -> Array1<f32> {
        streaming_softmin(eps, self.p, &self.x, &self.y, h)
    }

    pub fn softmin_cols(&self, eps: f32, h: &ArrayView1<f32>) -> Array1<f32> {
        // The ground cost is symmetric in its arguments.
        streaming_softmin(eps, self.p, &self.y, &self.x, h)
    }
}

/// Row softmin without materializing the tile: per row, fold fixed-size
/// column blocks into a running log-sum-exp and discard them.
pub(crate) fn streaming_softmin(
    eps: f32,
    p: u32,
    x: &ArrayView2<f32>,
    y: &ArrayView2<f32>,
    h: &ArrayView1<f32>,
) -> Array1<f32> {
    debug_assert_eq!(y.nrows(), h.len());
    let m = y.nrows();
    let out: Vec<f32> = (0..x.nrows())
        .into_par_iter()
        .map(|i| {
            let xi = x.row(i);
            let mut lse = OnlineLse::new();
            let mut block = Vec::with_capacity(BLOCK.min(m));
            let mut start = 0;
            while start < m {
                let end = (start + BLOCK).min(m);
                block.clear();
                let mut bm = f32::NEG_INFINITY;
                for j in start..end {
                    let l = h[j] - ground_cost(p, &xi, &y.row(j)) / eps;
                    bm = bm.max(l);
                    block.push(l);
                }
                if bm > f32::NEG_INFINITY {
                    let bs: f32 = block.iter().map(|&l| (l - bm).exp()).sum();
                    lse.merge(bm, bs);
                }
                start = end;
            }
            -eps * lse.value()
        })
        .collect();
    Array1::from_vec(out)
}

/// Transport-gradient reduction used by the envelope-theorem backward pass.
///
/// Per row `i`, with `l_j = h_j - C(x_i, y_j)/ε`:
///
/// \[
/// \text{out}[i] = e^{\,\text{pot}_i/\varepsilon + \mathrm{lse}_i}
/// \sum_j \mathrm{softmax}_j(l)\, \nabla_x C(x_i, y_j)
/// \]
///
/// which is exactly `(1/a_i) Σ_j π_ij ∇_x C` for the primal plan `π`
/// induced by the dual potentials. Streaming, parallel over rows.
pub(crate) fn softmax_transport_grad(
    eps: f32,
    p: u32,
    x: &ArrayView2<f32>,
    y: &ArrayView2<f32>,
    h: &ArrayView1<f32>,
    pot: &ArrayView1<f32>,
) -> Array2<f32> {
    debug_assert_eq!(y.nrows(), h.len());
    debug_assert_eq!(x.nrows(), pot.len());
    let n = x.nrows();
    let m = y.nrows();
    let d = x.ncols();

    let rows: Vec<Vec<f32>> = (0..n)
        .into_par_iter()
        .map(|i| {
            let xi = x.row(i);
            let mut run_m = f32::NEG_INFINITY;
            let mut run_s = 0.0f32;
            let mut acc = vec![0.0f32; d];
            let mut grad = vec![0.0f32; d];

            for j in 0..m {
                let yj = y.row(j);
                let l = h[j] - ground_cost(p, &xi, &yj) / eps;
                ground_cost_grad(p, &xi, &yj, &mut grad);
                if l <= run_m {
                    let w = (l - run_m).exp();
                    run_s += w;
                    for c in 0..d {
                        acc[c] += w * grad[c];
                    }
                } else {
                    let r = if run_m == f32::NEG_INFINITY {
                        0.0
                    } else {
                        (run_m - l).exp()
                    };
                    run_s = run_s * r + 1.0;
                    for c in 0..d {
                        acc[c] = acc[c] * r + grad[c];
                    }
                    run_m = l;
                }
            }

            if run_s <= 0.0 {
                return vec![0.0f32; d];
            }
            let lse = run_m + run_s.ln();
            let factor = (pot[i] / eps + lse).exp() / run_s;
            for a in acc.iter_mut() {
                *a *= factor;
            }
            acc
        })
        .collect();

    let mut out = Array2::zeros((n, d));
    for (i, row) in rows.into_iter().enumerate() {
        for c in 0..d {
            out[[i, c]] = row[c];
        }
    }
    out
}

/// Backend-tagged evaluator for one measure pair, dispatched once per call.
pub(crate) enum PairEvaluator<'a> {
    Dense(DenseEval),
    Streaming(StreamEval<'a>),
    Multiscale(TruncatedEval<'a>),
}

impl<'a> PairEvaluator<'a> {
    /// Refresh any bandwidth-dependent state (multiscale truncation lists).
    pub fn prepare(&mut self, eps: f32) {
        if let PairEvaluator::Multiscale(t) = self {
            t.prepare(eps);
        }
    }

    /// `out[i] = -ε log Σ_j exp(h_j - C(x_i, y_j)/ε)`.
    pub fn softmin_rows(&self, eps: f32, h: &ArrayView1<f32>) -> Array1<f32> {
        match self {
            PairEvaluator::Dense(e) => e.softmin_rows(eps, h),
            PairEvaluator::Streaming(e) => e.softmin_rows(eps, h),
            PairEvaluator::Multiscale(e) => e.softmin_rows(eps, h),
        }
    }

    /// `out[j] = -ε log Σ_i exp(h_i - C(x_i, y_j)/ε)`.
    pub fn softmin_cols(&self, eps: f32, h: &ArrayView1<f32>) -> Array1<f32> {
        match self {
            PairEvaluator::Dense(e) => e.softmin_cols(eps, h),
            PairEvaluator::Streaming(e) => e.softmin_cols(eps, h),
            PairEvaluator::Multiscale(e) => e.softmin_cols(eps, h),
        }
    }
}
