//! Envelope-theorem gradients from converged dual potentials.
//!
//! At a fixed point of the Sinkhorn updates, the loss equals the dual
//! objective evaluated at the potentials, and the potentials' own
//! sensitivity to the inputs contributes nothing. The gradient is therefore
//! an explicit formula — one more softmax reduction over the data — rather
//! than a differentiation through the iteration sequence, which would be
//! slower and would reintroduce exactly the instabilities the log-domain
//! solver removes.
//!
//! With the primal plan `π_ij = a_i b_j exp((f_i + g_j − C_ij)/ε)`:
//!
//! - positions: `∂L/∂x_i = Σ_j π_ij ∇_x C(x_i, y_j)` (minus the same
//!   reduction against the measure's own support when debiasing);
//! - weights, balanced: the dual brackets `f_ba` / `f_ba − f_aa`. Balanced
//!   transport constrains the total masses, so these are gradients along
//!   mass-preserving perturbations (project before use in a raw descent);
//! - weights, unbalanced: the exponentiated potentials are rescaled by
//!   `ρ + ε` — not the `ρ + ε/2` of the forward cost (Séjourné et al.,
//!   Prop. 12). Debiased, every constant term cancels, leaving exactly
//!   `(ρ+ε)(e^{−f_aa/ρ} − e^{−f_ba/ρ})`; raw, differentiating the returned
//!   bracket cost gives `ρ + ε/2 − (ρ+ε)e^{−f_ba/ρ}`.
//!
//! Gradient reductions always stream (linear memory): they run once per
//! solve, so there is no reason to let truncation error into the backward
//! contract.

use ndarray::{Array1, Array2};

use crate::sinkhorn::{marginal_ratio, SinkhornOutput};
use crate::softmin::softmax_transport_grad;
use crate::{Error, Measure, Result};

/// Gradients of the loss with respect to both measures, already scaled by
/// the upstream factor.
#[derive(Debug, Clone)]
pub struct Gradients {
    /// `∂L/∂a` over α's weights.
    pub weights_x: Array1<f32>,
    /// `∂L/∂x` over α's positions, `(N, d)`.
    pub positions_x: Array2<f32>,
    /// `∂L/∂b` over β's weights.
    pub weights_y: Array1<f32>,
    /// `∂L/∂y` over β's positions, `(M, d)`.
    pub positions_y: Array2<f32>,
}

impl SinkhornOutput {
    /// Backward rule: gradients of `upstream · loss` with respect to the
    /// inputs of the solve that produced this output.
    ///
    /// `alpha` and `beta` must be the measures passed to the forward call;
    /// shapes are checked, contents are trusted.
    pub fn gradients(&self, alpha: &Measure, beta: &Measure, upstream: f32) -> Result<Gradients> {
        if self.potentials.f_ba.len() != alpha.len() {
            return Err(Error::WeightCountMismatch(alpha.len(), self.potentials.f_ba.len()));
        }
        if self.potentials.g_ab.len() != beta.len() {
            return Err(Error::WeightCountMismatch(beta.len(), self.potentials.g_ab.len()));
        }
        if alpha.dim() != beta.dim() {
            return Err(Error::DimensionMismatch(alpha.dim(), beta.dim()));
        }

        let eps = self.eps;
        let p = self.p;
        let f_ba = &self.potentials.f_ba;
        let g_ab = &self.potentials.g_ab;
        let a_log = alpha.log_weights();
        let b_log = beta.log_weights();
        let xv = alpha.positions().view();
        let yv = beta.positions().view();

        // --- positions -----------------------------------------------------
        let h_b = &b_log + &g_ab.mapv(|v| v / eps);
        let h_a = &a_log + &f_ba.mapv(|v| v / eps);
        let mut gp_x = softmax_transport_grad(eps, p, &xv, &yv, &h_b.view(), &f_ba.view());
        let mut gp_y = softmax_transport_grad(eps, p, &yv, &xv, &h_a.view(), &g_ab.view());

        if self.debias {
            let f_aa = self.required_self_potential(&self.potentials.f_aa)?;
            let g_bb = self.required_self_potential(&self.potentials.g_bb)?;

            let h_aa = &a_log + &f_aa.mapv(|v| v / eps);
            let self_x = softmax_transport_grad(eps, p, &xv, &xv, &h_aa.view(), &f_aa.view());
            gp_x -= &self_x;

            let h_bb = &b_log + &g_bb.mapv(|v| v / eps);
            let self_y = softmax_transport_grad(eps, p, &yv, &yv, &h_bb.view(), &g_bb.view());
            gp_y -= &self_y;
        }

        let a = alpha.weights();
        let b = beta.weights();
        for i in 0..alpha.len() {
            let s = upstream * a[i];
            for c in 0..alpha.dim() {
                gp_x[[i, c]] *= s;
            }
        }
        for j in 0..beta.len() {
            let s = upstream * b[j];
            for c in 0..beta.dim() {
                gp_y[[j, c]] *= s;
            }
        }

        // --- weights -------------------------------------------------------
        let (gw_x, gw_y) = match (self.rho, self.debias) {
            (None, false) => (
                f_ba.mapv(|v| upstream * v),
                g_ab.mapv(|v| upstream * v),
            ),
            (None, true) => {
                let f_aa = self.required_self_potential(&self.potentials.f_aa)?;
                let g_bb = self.required_self_potential(&self.potentials.g_bb)?;
                let mut gx = Array1::zeros(alpha.len());
                for i in 0..alpha.len() {
                    gx[i] = upstream * (f_ba[i] - f_aa[i]);
                }
                let mut gy = Array1::zeros(beta.len());
                for j in 0..beta.len() {
                    gy[j] = upstream * (g_ab[j] - g_bb[j]);
                }
                (gx, gy)
            }
            (Some(rho), false) => {
                let scale = rho + eps;
                let offset = rho + 0.5 * eps;
                (
                    f_ba.mapv(|v| upstream * (offset - scale * marginal_ratio(v, rho))),
                    g_ab.mapv(|v| upstream * (offset - scale * marginal_ratio(v, rho))),
                )
            }
            (Some(rho), true) => {
                let f_aa = self.required_self_potential(&self.potentials.f_aa)?;
                let g_bb = self.required_self_potential(&self.potentials.g_bb)?;
                let scale = rho + eps;
                let mut gx = Array1::zeros(alpha.len());
                for i in 0..alpha.len() {
                    gx[i] = upstream
                        * scale
                        * (marginal_ratio(f_aa[i], rho) - marginal_ratio(f_ba[i], rho));
                }
                let mut gy = Array1::zeros(beta.len());
                for j in 0..beta.len() {
                    gy[j] = upstream
                        * scale
                        * (marginal_ratio(g_bb[j], rho) - marginal_ratio(g_ab[j], rho));
                }
                (gx, gy)
            }
        };

        Ok(Gradients {
            weights_x: gw_x,
            positions_x: gp_x,
            weights_y: gw_y,
            positions_y: gp_y,
        })
    }

    fn required_self_potential<'a>(
        &self,
        pot: &'a Option<Array1<f32>>,
    ) -> Result<&'a Array1<f32>> {
        pot.as_ref()
            .ok_or(Error::Domain("debiased gradient needs the symmetric potentials"))
    }
}
