//! Log-domain Sinkhorn solver with epsilon-scaling.
//!
//! The loop maintains dual potentials and repeatedly applies the damped,
//! averaged softmin updates
//!
//! \[
//! f \leftarrow \tfrac{1}{2}\Big(f + \lambda\,\mathrm{softmin}_\varepsilon
//!     \big(\log b + g/\varepsilon\big)\Big), \qquad
//! \lambda = \frac{\rho}{\rho + \varepsilon} \;(\text{or } 1 \text{ balanced}),
//! \]
//!
//! walking the temperature down the annealing ladder. Every exponential
//! lives inside a max-subtracted log-sum-exp, so potentials stay finite for
//! arbitrarily small blur. On convergence the loss is assembled from the
//! potentials alone; gradients come from the envelope theorem (see
//! [`crate::grad`]), never from differentiating through the iterations.
//!
//! Exhausting the iteration budget is *not* an error: the best available
//! potentials still induce a valid, slightly less accurate loss, so the
//! condition is reported through [`SolveStatus`] and a warning.
//!
//! # References
//!
//! - Feydy et al. (2019). "Interpolating between Optimal Transport and MMD
//!   using Sinkhorn Divergences" (debiasing, symmetric updates)
//! - Séjourné et al. (2019). "Sinkhorn Divergences for Unbalanced Optimal
//!   Transport" (reach, dual cost formulas)

use log::{debug, warn};
use ndarray::{Array1, ArrayView2};
use rayon::prelude::*;

use crate::annealing::{damping, max_diameter, reach_to_rho, BlurSchedule};
use crate::cluster::ClusterTree;
use crate::multiscale::TruncatedEval;
use crate::softmin::{DenseEval, PairEvaluator, StreamEval};
use crate::{resolve_backend, Backend, Error, Measure, Result, SinkhornConfig};

/// Terminal state of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// The final annealing step stabilized below the tolerance.
    Converged,
    /// The update budget ran out first; the returned potentials are the
    /// best available and the loss is valid at degraded precision.
    MaxIterReached,
}

/// Dual potentials at the end of a solve, one scalar per point.
#[derive(Debug, Clone)]
pub struct Potentials {
    /// Potential on α's points for the (α, β) problem.
    pub f_ba: Array1<f32>,
    /// Potential on β's points for the (α, β) problem.
    pub g_ab: Array1<f32>,
    /// Symmetric potential for (α, α); present iff debiasing.
    pub f_aa: Option<Array1<f32>>,
    /// Symmetric potential for (β, β); present iff debiasing.
    pub g_bb: Option<Array1<f32>>,
}

/// Loss value plus everything the backward pass needs.
#[derive(Debug, Clone)]
pub struct SinkhornOutput {
    /// The divergence value.
    pub loss: f32,
    /// Whether the solve stabilized or ran out of budget.
    pub status: SolveStatus,
    /// Potential-vector updates spent.
    pub updates: usize,
    /// `(ladder step, max potential change)` per inner update, for
    /// convergence diagnostics.
    pub drift_log: Vec<(u32, f32)>,
    /// Evaluator that drove the iterations.
    pub backend: Backend,
    /// Converged (or best-available) dual potentials.
    pub potentials: Potentials,
    pub(crate) eps: f32,
    pub(crate) rho: Option<f32>,
    pub(crate) p: u32,
    pub(crate) debias: bool,
}

/// Entropic transport loss between two measures.
///
/// This is the core entry point: it validates inputs, resolves the backend,
/// builds the annealing ladder, runs the solver and assembles the loss from
/// the dual potentials. See [`SinkhornOutput::gradients`] for the backward
/// pass.
pub fn compute_loss(alpha: &Measure, beta: &Measure, cfg: &SinkhornConfig) -> Result<SinkhornOutput> {
    solve(alpha, beta, cfg, None)
}

/// Like [`compute_loss`], forcing the multiscale backend with prebuilt
/// hierarchies. Only worthwhile when the same geometry is solved repeatedly;
/// the trees are read, never mutated.
pub fn compute_loss_with_trees(
    alpha: &Measure,
    beta: &Measure,
    tree_x: &ClusterTree,
    tree_y: &ClusterTree,
    cfg: &SinkhornConfig,
) -> Result<SinkhornOutput> {
    if tree_x.n_points() != alpha.len() {
        return Err(Error::WeightCountMismatch(alpha.len(), tree_x.n_points()));
    }
    if tree_y.n_points() != beta.len() {
        return Err(Error::WeightCountMismatch(beta.len(), tree_y.n_points()));
    }
    if tree_x.dim() != alpha.dim() || tree_y.dim() != beta.dim() {
        return Err(Error::Domain("cluster hierarchy dimension does not match measure"));
    }
    solve(alpha, beta, cfg, Some((tree_x, tree_y)))
}

/// Independent measure pairs, solved fully concurrently. Entries share the
/// configuration but no state.
pub fn compute_loss_batch(
    pairs: &[(Measure, Measure)],
    cfg: &SinkhornConfig,
) -> Result<Vec<SinkhornOutput>> {
    pairs
        .par_iter()
        .map(|(a, b)| compute_loss(a, b, cfg))
        .collect()
}

fn solve(
    alpha: &Measure,
    beta: &Measure,
    cfg: &SinkhornConfig,
    trees: Option<(&ClusterTree, &ClusterTree)>,
) -> Result<SinkhornOutput> {
    cfg.validate()?;
    if alpha.dim() != beta.dim() {
        return Err(Error::DimensionMismatch(alpha.dim(), beta.dim()));
    }

    let backend = match trees {
        Some(_) => resolve_backend(Backend::Multiscale, alpha.len(), beta.len(), alpha.dim())?,
        None => resolve_backend(cfg.backend, alpha.len(), beta.len(), alpha.dim())?,
    };

    let diameter = cfg
        .diameter
        .unwrap_or_else(|| max_diameter(&alpha.positions().view(), &beta.positions().view()));
    let diameter = if diameter > 0.0 { diameter } else { cfg.blur };
    let schedule = BlurSchedule::new(diameter, cfg.blur, cfg.scaling, cfg.p);
    let rho = reach_to_rho(cfg.reach, cfg.p);
    debug!(
        "sinkhorn: {}x{} points (d={}), backend {:?}, {} ladder steps, eps {:.3e} -> {:.3e}",
        alpha.len(),
        beta.len(),
        alpha.dim(),
        backend,
        schedule.len(),
        schedule.eps(0),
        schedule.eps_final()
    );

    // Hierarchies: provided by the caller, or built here and dropped with
    // the solve.
    let built: Option<(ClusterTree, ClusterTree)> = match (backend, trees) {
        (Backend::Multiscale, None) => Some((
            ClusterTree::build(&alpha.positions().view(), &alpha.weights().view())?,
            ClusterTree::build(&beta.positions().view(), &beta.weights().view())?,
        )),
        _ => None,
    };
    let tree_refs: Option<(&ClusterTree, &ClusterTree)> = match &built {
        Some((a, b)) => Some((a, b)),
        None => trees,
    };

    let xv = alpha.positions().view();
    let yv = beta.positions().view();
    let mut eval_ab = make_eval(backend, cfg.p, xv, yv, tree_refs)?;
    let mut eval_aa = if cfg.debias {
        Some(make_eval(
            backend,
            cfg.p,
            xv,
            xv,
            tree_refs.map(|(tx, _)| (tx, tx)),
        )?)
    } else {
        None
    };
    let mut eval_bb = if cfg.debias {
        Some(make_eval(
            backend,
            cfg.p,
            yv,
            yv,
            tree_refs.map(|(_, ty)| (ty, ty)),
        )?)
    } else {
        None
    };

    let a_log = alpha.log_weights();
    let b_log = beta.log_weights();

    // Init: one damped softmin of the raw log-weights at the warmest
    // temperature.
    let eps0 = schedule.eps(0);
    let lam0 = damping(rho, eps0);
    eval_ab.prepare(eps0);
    let mut f_ba = eval_ab.softmin_rows(eps0, &b_log.view()) * lam0;
    let mut g_ab = eval_ab.softmin_cols(eps0, &a_log.view()) * lam0;
    let mut updates = 2usize;

    let mut f_aa = if let Some(e) = eval_aa.as_mut() {
        e.prepare(eps0);
        updates += 1;
        Some(e.softmin_rows(eps0, &a_log.view()) * lam0)
    } else {
        None
    };
    let mut g_bb = if let Some(e) = eval_bb.as_mut() {
        e.prepare(eps0);
        updates += 1;
        Some(e.softmin_rows(eps0, &b_log.view()) * lam0)
    } else {
        None
    };

    let mut drift_log: Vec<(u32, f32)> = Vec::new();
    let mut status = SolveStatus::Converged;

    'ladder: for k in 0..schedule.len() {
        let eps = schedule.eps(k);
        let lam = damping(rho, eps);
        eval_ab.prepare(eps);
        if let Some(e) = eval_aa.as_mut() {
            e.prepare(eps);
        }
        if let Some(e) = eval_bb.as_mut() {
            e.prepare(eps);
        }

        let mut step_stable = false;
        for _ in 0..cfg.inner_cap {
            if updates >= cfg.max_updates {
                status = SolveStatus::MaxIterReached;
                break 'ladder;
            }

            let h_b = &b_log + &g_ab.mapv(|v| v / eps);
            let h_a = &a_log + &f_ba.mapv(|v| v / eps);
            let ft = eval_ab.softmin_rows(eps, &h_b.view()) * lam;
            let gt = eval_ab.softmin_cols(eps, &h_a.view()) * lam;
            let f_new = 0.5 * (&f_ba + &ft);
            let g_new = 0.5 * (&g_ab + &gt);
            let mut drift = max_abs_diff(&f_new, &f_ba).max(max_abs_diff(&g_new, &g_ab));
            f_ba = f_new;
            g_ab = g_new;
            updates += 2;

            if let (Some(e), Some(f_s)) = (eval_aa.as_mut(), f_aa.as_mut()) {
                let h = &a_log + &f_s.mapv(|v| v / eps);
                let ft_s = e.softmin_rows(eps, &h.view()) * lam;
                let f_s_new = 0.5 * (&*f_s + &ft_s);
                drift = drift.max(max_abs_diff(&f_s_new, f_s));
                *f_s = f_s_new;
                updates += 1;
            }
            if let (Some(e), Some(g_s)) = (eval_bb.as_mut(), g_bb.as_mut()) {
                let h = &b_log + &g_s.mapv(|v| v / eps);
                let gt_s = e.softmin_rows(eps, &h.view()) * lam;
                let g_s_new = 0.5 * (&*g_s + &gt_s);
                drift = drift.max(max_abs_diff(&g_s_new, g_s));
                *g_s = g_s_new;
                updates += 1;
            }

            drift_log.push((k as u32, drift));
            if drift < cfg.tol {
                step_stable = true;
                break;
            }
        }

        if k + 1 == schedule.len() && !step_stable && status == SolveStatus::Converged {
            status = SolveStatus::MaxIterReached;
        }
    }

    // One full (un-averaged) update at the target temperature: the
    // potentials land exactly on the softmin of their counterparts, which
    // is what the envelope-theorem gradient formula assumes.
    let eps = schedule.eps_final();
    let lam = damping(rho, eps);
    eval_ab.prepare(eps);
    {
        let h_b = &b_log + &g_ab.mapv(|v| v / eps);
        let h_a = &a_log + &f_ba.mapv(|v| v / eps);
        let f_x = eval_ab.softmin_rows(eps, &h_b.view()) * lam;
        let g_y = eval_ab.softmin_cols(eps, &h_a.view()) * lam;
        f_ba = f_x;
        g_ab = g_y;
        updates += 2;
    }
    if let (Some(e), Some(f_s)) = (eval_aa.as_mut(), f_aa.as_mut()) {
        e.prepare(eps);
        let h = &a_log + &f_s.mapv(|v| v / eps);
        *f_s = e.softmin_rows(eps, &h.view()) * lam;
        updates += 1;
    }
    if let (Some(e), Some(g_s)) = (eval_bb.as_mut(), g_bb.as_mut()) {
        e.prepare(eps);
        let h = &b_log + &g_s.mapv(|v| v / eps);
        *g_s = e.softmin_rows(eps, &h.view()) * lam;
        updates += 1;
    }

    if status == SolveStatus::MaxIterReached {
        warn!(
            "sinkhorn stalled after {} updates (budget {}); returning best-available potentials",
            updates, cfg.max_updates
        );
    }

    let potentials = Potentials { f_ba, g_ab, f_aa, g_bb };
    let loss = assemble_cost(alpha, beta, &potentials, eps, rho, cfg.debias);

    Ok(SinkhornOutput {
        loss,
        status,
        updates,
        drift_log,
        backend,
        potentials,
        eps,
        rho,
        p: cfg.p,
        debias: cfg.debias,
    })
}

fn make_eval<'a>(
    backend: Backend,
    p: u32,
    x: ArrayView2<'a, f32>,
    y: ArrayView2<'a, f32>,
    trees: Option<(&'a ClusterTree, &'a ClusterTree)>,
) -> Result<PairEvaluator<'a>> {
    Ok(match backend {
        Backend::Auto | Backend::Dense => PairEvaluator::Dense(DenseEval::new(p, &x, &y)),
        Backend::Streaming => PairEvaluator::Streaming(StreamEval::new(p, x, y)),
        Backend::Multiscale => {
            let (tx, ty) =
                trees.ok_or(Error::Domain("multiscale backend needs cluster hierarchies"))?;
            PairEvaluator::Multiscale(TruncatedEval::new(p, x, y, tx, ty))
        }
    })
}

fn max_abs_diff(a: &Array1<f32>, b: &Array1<f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Bounded marginal ratio `exp(-pot / rho)`; the clamp keeps the value
/// finite even for potentials far from the fixed point.
pub(crate) fn marginal_ratio(pot: f32, rho: f32) -> f32 {
    (-pot / rho).min(60.0).exp()
}

/// Loss from converged potentials.
///
/// Balanced, debiased: `⟨a, f_ba − f_aa⟩ + ⟨b, g_ab − g_bb⟩`.
/// Unbalanced, debiased (Séjourné et al.):
/// `(ρ + ε/2)·[⟨a, e^{−f_aa/ρ} − e^{−f_ba/ρ}⟩ + ⟨b, e^{−g_bb/ρ} − e^{−g_ab/ρ}⟩]`.
/// At the dual fixed point these brackets already equal
/// `OT(α,β) − ½OT(α,α) − ½OT(β,β) + (ε/2)(m(α) − m(β))²` — the mass
/// penalty is baked into the `ρ + ε/2` scaling and must not be added again.
fn assemble_cost(
    alpha: &Measure,
    beta: &Measure,
    pots: &Potentials,
    eps: f32,
    rho: Option<f32>,
    debias: bool,
) -> f32 {
    let a = alpha.weights();
    let b = beta.weights();

    match (rho, debias) {
        (None, true) => {
            let f_aa = pots.f_aa.as_ref().map(|v| v.view());
            let g_bb = pots.g_bb.as_ref().map(|v| v.view());
            let mut acc = 0.0f64;
            for i in 0..a.len() {
                let bias = f_aa.as_ref().map_or(0.0, |v| v[i]);
                acc += (a[i] * (pots.f_ba[i] - bias)) as f64;
            }
            for j in 0..b.len() {
                let bias = g_bb.as_ref().map_or(0.0, |v| v[j]);
                acc += (b[j] * (pots.g_ab[j] - bias)) as f64;
            }
            // Nonnegative in exact arithmetic; trim float drift.
            (acc as f32).max(0.0)
        }
        (None, false) => {
            let mut acc = 0.0f64;
            for i in 0..a.len() {
                acc += (a[i] * pots.f_ba[i]) as f64;
            }
            for j in 0..b.len() {
                acc += (b[j] * pots.g_ab[j]) as f64;
            }
            acc as f32
        }
        (Some(rho), true) => {
            let scale = (rho + 0.5 * eps) as f64;
            let f_aa = pots.f_aa.as_ref().map(|v| v.view());
            let g_bb = pots.g_bb.as_ref().map(|v| v.view());
            let mut acc = 0.0f64;
            for i in 0..a.len() {
                if a[i] == 0.0 {
                    continue;
                }
                let bias = f_aa.as_ref().map_or(0.0, |v| v[i]);
                let x = marginal_ratio(bias, rho) - marginal_ratio(pots.f_ba[i], rho);
                acc += (a[i] as f64) * scale * (x as f64);
            }
            for j in 0..b.len() {
                if b[j] == 0.0 {
                    continue;
                }
                let bias = g_bb.as_ref().map_or(0.0, |v| v[j]);
                let x = marginal_ratio(bias, rho) - marginal_ratio(pots.g_ab[j], rho);
                acc += (b[j] as f64) * scale * (x as f64);
            }
            acc as f32
        }
        (Some(rho), false) => {
            let scale = (rho + 0.5 * eps) as f64;
            let mut acc = 0.0f64;
            for i in 0..a.len() {
                if a[i] == 0.0 {
                    continue;
                }
                acc += (a[i] as f64) * scale * ((1.0 - marginal_ratio(pots.f_ba[i], rho)) as f64);
            }
            for j in 0..b.len() {
                if b[j] == 0.0 {
                    continue;
                }
                acc += (b[j] as f64) * scale * ((1.0 - marginal_ratio(pots.g_ab[j], rho)) as f64);
            }
            acc as f32
        }
    }
}

/// Hausdorff divergence: solve only the two symmetric problems and compare
/// each measure against the other's symmetric potential,
///
/// \[
/// \mathrm{H}_\varepsilon(\alpha, \beta) = \tfrac{1}{2}\big(
///   \langle \beta,\, \varphi_\alpha - g_{\beta\beta} \rangle
/// + \langle \alpha,\, \varphi_\beta - f_{\alpha\alpha} \rangle \big)
/// \]
///
/// where `φ_α` extrapolates α's symmetric potential onto β's points. Zero
/// on the diagonal by construction and cheaper than the full divergence:
/// the cross interaction is evaluated once instead of every iteration.
pub fn hausdorff_divergence(
    alpha: &Measure,
    beta: &Measure,
    cfg: &SinkhornConfig,
) -> Result<f32> {
    cfg.validate()?;
    if alpha.dim() != beta.dim() {
        return Err(Error::DimensionMismatch(alpha.dim(), beta.dim()));
    }
    let backend = resolve_backend(cfg.backend, alpha.len(), beta.len(), alpha.dim())?;

    let diameter = cfg
        .diameter
        .unwrap_or_else(|| max_diameter(&alpha.positions().view(), &beta.positions().view()));
    let diameter = if diameter > 0.0 { diameter } else { cfg.blur };
    let schedule = BlurSchedule::new(diameter, cfg.blur, cfg.scaling, cfg.p);
    let rho = reach_to_rho(cfg.reach, cfg.p);

    let built: Option<(ClusterTree, ClusterTree)> = match backend {
        Backend::Multiscale => Some((
            ClusterTree::build(&alpha.positions().view(), &alpha.weights().view())?,
            ClusterTree::build(&beta.positions().view(), &beta.weights().view())?,
        )),
        _ => None,
    };
    let tree_refs: Option<(&ClusterTree, &ClusterTree)> = built.as_ref().map(|(a, b)| (a, b));

    let xv = alpha.positions().view();
    let yv = beta.positions().view();
    let mut eval_aa = make_eval(backend, cfg.p, xv, xv, tree_refs.map(|(tx, _)| (tx, tx)))?;
    let mut eval_bb = make_eval(backend, cfg.p, yv, yv, tree_refs.map(|(_, ty)| (ty, ty)))?;

    let a_log = alpha.log_weights();
    let b_log = beta.log_weights();

    let eps0 = schedule.eps(0);
    let lam0 = damping(rho, eps0);
    eval_aa.prepare(eps0);
    eval_bb.prepare(eps0);
    let mut f_aa = eval_aa.softmin_rows(eps0, &a_log.view()) * lam0;
    let mut g_bb = eval_bb.softmin_rows(eps0, &b_log.view()) * lam0;
    let mut updates = 2usize;

    'rungs: for k in 0..schedule.len() {
        let eps = schedule.eps(k);
        let lam = damping(rho, eps);
        eval_aa.prepare(eps);
        eval_bb.prepare(eps);

        for _ in 0..cfg.inner_cap {
            if updates >= cfg.max_updates {
                warn!("hausdorff solve stalled after {} updates", updates);
                break 'rungs;
            }
            let h_a = &a_log + &f_aa.mapv(|v| v / eps);
            let h_b = &b_log + &g_bb.mapv(|v| v / eps);
            let ft = eval_aa.softmin_rows(eps, &h_a.view()) * lam;
            let gt = eval_bb.softmin_rows(eps, &h_b.view()) * lam;
            let f_new = 0.5 * (&f_aa + &ft);
            let g_new = 0.5 * (&g_bb + &gt);
            let drift = max_abs_diff(&f_new, &f_aa).max(max_abs_diff(&g_new, &g_bb));
            f_aa = f_new;
            g_bb = g_new;
            updates += 2;
            if drift < cfg.tol {
                break;
            }
        }
    }

    // Cross extrapolation of each symmetric potential onto the other support.
    let eps = schedule.eps_final();
    let lam = damping(rho, eps);
    let mut eval_ab = make_eval(backend, cfg.p, xv, yv, tree_refs)?;
    eval_ab.prepare(eps);
    let phi_alpha_on_y = eval_ab.softmin_cols(eps, &(&a_log + &f_aa.mapv(|v| v / eps)).view()) * lam;
    let phi_beta_on_x = eval_ab.softmin_rows(eps, &(&b_log + &g_bb.mapv(|v| v / eps)).view()) * lam;

    let a = alpha.weights();
    let b = beta.weights();
    let mut acc = 0.0f64;
    for j in 0..b.len() {
        acc += 0.5 * (b[j] * (phi_alpha_on_y[j] - g_bb[j])) as f64;
    }
    for i in 0..a.len() {
        acc += 0.5 * (a[i] * (phi_beta_on_x[i] - f_aa[i])) as f64;
    }
    Ok((acc as f32).max(0.0))
}
