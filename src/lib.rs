//! # sinkdiv
//!
//! Geometric divergences between weighted point clouds: move mass from one
//! measure to another at minimum cost, and get a gradient back.
//!
//! ## The Problem
//!
//! Given two weighted point sets ("measures"), produce a single scalar that
//! behaves like a distance — zero iff the measures coincide, smooth in the
//! point positions and weights — without ever building objects that scale
//! worse than the data itself.
//!
//! ## Key Entry Points
//!
//! | Function | Use Case | Memory |
//! |----------|----------|--------|
//! | [`compute_loss`] | Sinkhorn divergence between two measures | backend-dependent |
//! | [`compute_loss_batch`] | Independent measure pairs, in parallel | backend-dependent |
//! | [`compute_loss_with_trees`] | Reuse prebuilt cluster hierarchies | `O(N + M)` |
//! | [`hausdorff_divergence`] | Cheaper symmetric-potential divergence | backend-dependent |
//! | [`kernel::mmd_loss`] | Kernel norms (Gaussian / Laplace / energy) | `O(N + M)` |
//!
//! ## Quick Start
//!
//! ```rust
//! use ndarray::array;
//! use sinkdiv::{compute_loss, Measure, SinkhornConfig};
//!
//! let alpha = Measure::new(array![0.5, 0.5], array![[0.0, 0.0], [1.0, 0.0]]).unwrap();
//! let beta = Measure::new(array![0.5, 0.5], array![[0.0, 0.0], [2.0, 0.0]]).unwrap();
//!
//! let cfg = SinkhornConfig { blur: 0.1, ..Default::default() };
//! let out = compute_loss(&alpha, &beta, &cfg).unwrap();
//! assert!(out.loss > 0.0);
//!
//! // Closed-form gradients from the converged dual potentials.
//! let grads = out.gradients(&alpha, &beta, 1.0).unwrap();
//! assert_eq!(grads.positions_x.dim(), (2, 2));
//! ```
//!
//! ## Backends
//!
//! Three interchangeable evaluators drive the same log-domain solver:
//!
//! - **Dense**: materializes the full `N×M` cost tile. Exact, `O(N·M)`
//!   memory, the correctness reference. Chosen automatically for small
//!   problems.
//! - **Streaming**: identical reduction, tiled so memory stays `O(N + M)`.
//!   Works in any dimension.
//! - **Multiscale**: octree cluster hierarchies plus kernel truncation skip
//!   cluster pairs whose interaction is below floating-point significance.
//!   Dimension ≤ 3.
//!
//! ## What Can Go Wrong
//!
//! 1. **Tiny blur, no annealing**: convergence stalls. Keep `scaling < 1`
//!    so the solver anneals from the data diameter down to the target blur.
//! 2. **Raw OT cost as a metric**: `OT_ε(α, α) > 0`. Keep `debias = true`
//!    when you need `Loss(α, α) = 0`.
//! 3. **Mismatched total masses with `reach = None`**: balanced transport
//!    has no way to create or destroy mass. Set `reach` for unbalanced
//!    problems.
//! 4. **Multiscale in high dimension**: the octree degrades past d = 3 and
//!    is rejected; use the streaming backend there.
//!
//! ## References
//!
//! - Cuturi (2013). "Sinkhorn Distances: Lightspeed Computation of Optimal Transport"
//! - Feydy et al. (2019). "Interpolating between Optimal Transport and MMD using Sinkhorn Divergences"
//! - Schmitzer (2019). "Stabilized Sparse Scaling Algorithms for Entropy Regularized Transport Problems"
//! - Séjourné et al. (2019). "Sinkhorn Divergences for Unbalanced Optimal Transport"
//! - Peyré & Cuturi (2019). "Computational Optimal Transport"

use ndarray::{Array1, Array2};
use thiserror::Error;

pub mod annealing;
pub mod cluster;
pub mod grad;
pub mod kernel;
pub mod multiscale;
pub mod sinkhorn;
pub mod softmin;

pub use cluster::ClusterTree;
pub use grad::Gradients;
pub use sinkhorn::{
    compute_loss, compute_loss_batch, compute_loss_with_trees, hausdorff_divergence,
    Potentials, SinkhornOutput, SolveStatus,
};

/// Divergence-engine error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// Point dimensions differ between the two measures.
    #[error("point dimensions differ between measures: {0} vs {1}")]
    DimensionMismatch(usize, usize),

    /// Weight vector and position matrix disagree on the point count.
    #[error("weight/position count mismatch: {0} weights vs {1} points")]
    WeightCountMismatch(usize, usize),

    /// A weight is negative, NaN or infinite.
    #[error("weights must be finite and nonnegative (weight[{0}] = {1})")]
    InvalidWeight(usize, f32),

    /// Invalid entropic bandwidth.
    #[error("blur must be positive and finite, got {0}")]
    InvalidBlur(f32),

    /// Invalid annealing ratio.
    #[error("scaling must lie in (0, 1), got {0}")]
    InvalidScaling(f32),

    /// Invalid marginal-softening strength for unbalanced transport.
    #[error("reach must be positive and finite, got {0}")]
    InvalidReach(f32),

    /// Unsupported ground-cost exponent.
    #[error("cost exponent must be 1 or 2, got {0}")]
    InvalidExponent(u32),

    /// The requested backend cannot handle this input dimension.
    #[error("backend {0:?} does not support dimension {1}")]
    BackendUnsupported(Backend, usize),

    /// Domain error (invalid inputs for the mathematical definition).
    #[error("{0}")]
    Domain(&'static str),
}

/// Result type for divergence-engine operations.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) const EPSILON: f32 = 1e-7;

/// Hard support exclusion: `ln w` for zero weights, kept finite so that
/// potential arithmetic never produces `∞ - ∞`.
pub(crate) const LOG_ZERO_WEIGHT: f32 = -1.0e5;

/// Numerically stable \(\log \sum_i \exp(x_i)\) for an indexable family.
///
/// The classic "log-sum-exp trick":
/// \[
/// \log \sum_i \exp(x_i) = m + \log \sum_i \exp(x_i - m), \quad m = \max_i x_i
/// \]
///
/// Returns `-∞` if `len == 0`.
#[inline]
pub(crate) fn logsumexp_by(len: usize, mut f: impl FnMut(usize) -> f32) -> f32 {
    if len == 0 {
        return f32::NEG_INFINITY;
    }

    let mut max_val = f32::NEG_INFINITY;
    for i in 0..len {
        max_val = max_val.max(f(i));
    }
    if !max_val.is_finite() {
        // If everything is -inf (or NaN), propagate the max.
        return max_val;
    }

    let mut sum_exp = 0.0;
    for i in 0..len {
        sum_exp += (f(i) - max_val).exp();
    }
    max_val + sum_exp.ln()
}

/// A weighted point set in `ℝ^d`.
///
/// Weights are nonnegative and need *not* sum to one: total mass carries
/// information for unbalanced transport. Positions are an `(N, d)` array.
#[derive(Debug, Clone)]
pub struct Measure {
    weights: Array1<f32>,
    positions: Array2<f32>,
}

impl Measure {
    /// Build a measure, validating shapes and weight values.
    pub fn new(weights: Array1<f32>, positions: Array2<f32>) -> Result<Self> {
        if weights.len() != positions.nrows() {
            return Err(Error::WeightCountMismatch(weights.len(), positions.nrows()));
        }
        if weights.is_empty() {
            return Err(Error::Domain("a measure needs at least one point"));
        }
        if positions.ncols() == 0 {
            return Err(Error::Domain("points must have positive dimension"));
        }
        for (i, &w) in weights.iter().enumerate() {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::InvalidWeight(i, w));
            }
        }
        if weights.sum() <= 0.0 {
            return Err(Error::Domain("a measure needs positive total mass"));
        }
        if positions.iter().any(|x| !x.is_finite()) {
            return Err(Error::Domain("positions must be finite"));
        }
        Ok(Self { weights, positions })
    }

    /// Uniform weights `1/N` over the given positions.
    pub fn uniform(positions: Array2<f32>) -> Result<Self> {
        let n = positions.nrows();
        if n == 0 {
            return Err(Error::Domain("a measure needs at least one point"));
        }
        Self::new(Array1::from_elem(n, 1.0 / n as f32), positions)
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// True when the measure holds no points (never, post-validation).
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Ambient dimension `d`.
    pub fn dim(&self) -> usize {
        self.positions.ncols()
    }

    /// Per-point weights.
    pub fn weights(&self) -> &Array1<f32> {
        &self.weights
    }

    /// `(N, d)` point positions.
    pub fn positions(&self) -> &Array2<f32> {
        &self.positions
    }

    /// Total mass `Σ w_i`.
    pub fn total_mass(&self) -> f32 {
        self.weights.sum()
    }

    /// Log-weights with zero mass mapped to a large negative constant
    /// rather than `-∞`.
    pub(crate) fn log_weights(&self) -> Array1<f32> {
        self.weights
            .mapv(|w| if w <= 0.0 { LOG_ZERO_WEIGHT } else { w.ln() })
    }
}

/// Which evaluator drives the softmin reductions inside the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Pick automatically from problem size and dimension.
    #[default]
    Auto,
    /// Materialize the full `N×M` cost tile. Exact reference.
    Dense,
    /// Tiled reduction, `O(N + M)` memory, any dimension.
    Streaming,
    /// Octree hierarchy + kernel truncation, dimension ≤ 3.
    Multiscale,
}

/// Below this point count, `Backend::Auto` resolves to `Dense`.
pub const DENSE_CUTOFF: usize = 5_000;

/// Largest dimension the octree hierarchy supports.
pub const MULTISCALE_MAX_DIM: usize = 3;

/// Resolve `Auto` and reject impossible requests.
pub(crate) fn resolve_backend(
    requested: Backend,
    n: usize,
    m: usize,
    dim: usize,
) -> Result<Backend> {
    match requested {
        Backend::Auto => {
            if n.max(m) <= DENSE_CUTOFF {
                Ok(Backend::Dense)
            } else if dim <= MULTISCALE_MAX_DIM {
                Ok(Backend::Multiscale)
            } else {
                Ok(Backend::Streaming)
            }
        }
        Backend::Multiscale if dim > MULTISCALE_MAX_DIM => {
            Err(Error::BackendUnsupported(Backend::Multiscale, dim))
        }
        other => Ok(other),
    }
}

/// Solver configuration.
///
/// The defaults follow the annealing heuristic: blur starts at the data
/// diameter and decays geometrically by `scaling` per outer step until it
/// reaches the target `blur`; the temperature is `blur^p` throughout.
#[derive(Debug, Clone)]
pub struct SinkhornConfig {
    /// Exponent of the ground cost `|x−y|^p / p`. Supported: 1, 2.
    pub p: u32,
    /// Target entropic bandwidth (a length, not a temperature).
    pub blur: f32,
    /// Geometric decay ratio of the annealing ladder, in `(0, 1)`.
    pub scaling: f32,
    /// Marginal-constraint softening for unbalanced transport.
    /// `None` means hard marginals (balanced OT).
    pub reach: Option<f32>,
    /// Remove the entropic bias so that `Loss(α, α) = 0`.
    pub debias: bool,
    /// Evaluator selection.
    pub backend: Backend,
    /// Optional upper bound on the largest inter-point distance. Estimated
    /// from the data when absent.
    pub diameter: Option<f32>,
    /// Inner-update tolerance: an annealing step ends early once the max
    /// potential change drops below this.
    pub tol: f32,
    /// Cap on inner updates per annealing step.
    pub inner_cap: usize,
    /// Global budget on potential-vector updates across the whole solve.
    /// Exhausting it yields `SolveStatus::MaxIterReached`, not an error.
    pub max_updates: usize,
}

impl Default for SinkhornConfig {
    fn default() -> Self {
        Self {
            p: 2,
            blur: 0.05,
            scaling: 0.5,
            reach: None,
            debias: true,
            backend: Backend::Auto,
            diameter: None,
            tol: 1e-3,
            inner_cap: 10,
            max_updates: 10_000,
        }
    }
}

impl SinkhornConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.p != 1 && self.p != 2 {
            return Err(Error::InvalidExponent(self.p));
        }
        if !(self.blur > 0.0) || !self.blur.is_finite() {
            return Err(Error::InvalidBlur(self.blur));
        }
        if !(self.scaling > 0.0 && self.scaling < 1.0) {
            return Err(Error::InvalidScaling(self.scaling));
        }
        if let Some(r) = self.reach {
            if !(r > 0.0) || !r.is_finite() {
                return Err(Error::InvalidReach(r));
            }
        }
        if let Some(d) = self.diameter {
            if !(d > 0.0) || !d.is_finite() {
                return Err(Error::Domain("diameter hint must be positive and finite"));
            }
        }
        if !(self.tol > 0.0) || !self.tol.is_finite() {
            return Err(Error::Domain("tol must be positive and finite"));
        }
        if self.inner_cap == 0 || self.max_updates == 0 {
            return Err(Error::Domain("inner_cap and max_updates must be >= 1"));
        }
        Ok(())
    }
}
