//! Ground costs and positive-definite kernels.
//!
//! The transport side of the crate uses the power cost
//! \(\text{C}(x, y) = \tfrac{1}{p}\|x-y\|^p\); the kernel-norm side uses a
//! positive-definite kernel directly. Both are pure functions of a pair of
//! positions, shared bit-for-bit by every backend.
//!
//! Kernel norms (squared MMD) are the \(\varepsilon \to \infty\) limit of
//! the Sinkhorn divergence: cheap, no iteration, but blind to geometry at
//! scales below the kernel bandwidth.
//!
//! # References
//!
//! - Gretton et al. (2012). "A Kernel Two-Sample Test"
//! - Székely & Rizzo (2013). "Energy statistics" (the energy-distance kernel)

use log::debug;
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;

use crate::grad::Gradients;
use crate::{Error, Measure, Result, EPSILON};

/// Squared Euclidean distance.
#[inline]
pub(crate) fn squared_distance(x: &ArrayView1<f32>, y: &ArrayView1<f32>) -> f32 {
    debug_assert_eq!(x.len(), y.len());
    let mut acc = 0.0f32;
    for k in 0..x.len() {
        let d = x[k] - y[k];
        acc += d * d;
    }
    acc
}

/// Power cost `|x − y|^p / p` for p ∈ {1, 2}.
#[inline]
pub(crate) fn ground_cost(p: u32, x: &ArrayView1<f32>, y: &ArrayView1<f32>) -> f32 {
    let sq = squared_distance(x, y);
    match p {
        1 => sq.sqrt(),
        _ => 0.5 * sq,
    }
}

/// Gradient of the power cost with respect to `x`, written into `out`.
///
/// For p = 1 the gradient is the unit vector toward `x`; coincident points
/// get a zero subgradient.
#[inline]
pub(crate) fn ground_cost_grad(p: u32, x: &ArrayView1<f32>, y: &ArrayView1<f32>, out: &mut [f32]) {
    debug_assert_eq!(out.len(), x.len());
    match p {
        1 => {
            let dist = squared_distance(x, y).sqrt();
            if dist < EPSILON {
                out.fill(0.0);
            } else {
                for k in 0..x.len() {
                    out[k] = (x[k] - y[k]) / dist;
                }
            }
        }
        _ => {
            for k in 0..x.len() {
                out[k] = x[k] - y[k];
            }
        }
    }
}

/// Positive-definite kernels for the kernel-norm loss family.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    /// `exp(−|x−y|² / 2σ²)`.
    Gaussian {
        /// Bandwidth σ.
        sigma: f32,
    },
    /// `exp(−|x−y| / σ)`.
    Laplace {
        /// Bandwidth σ.
        sigma: f32,
    },
    /// `−|x−y|`; conditionally positive definite, bandwidth-free. The
    /// induced norm is the energy distance.
    Energy,
}

impl Kernel {
    fn validate(&self) -> Result<()> {
        match *self {
            Kernel::Gaussian { sigma } | Kernel::Laplace { sigma } => {
                if !(sigma > 0.0) || !sigma.is_finite() {
                    return Err(Error::Domain("kernel bandwidth must be positive and finite"));
                }
            }
            Kernel::Energy => {}
        }
        Ok(())
    }

    /// Kernel value `k(x, y)`.
    pub fn value(&self, x: &ArrayView1<f32>, y: &ArrayView1<f32>) -> f32 {
        let sq = squared_distance(x, y);
        match *self {
            Kernel::Gaussian { sigma } => (-sq / (2.0 * sigma * sigma)).exp(),
            Kernel::Laplace { sigma } => (-sq.sqrt() / sigma).exp(),
            Kernel::Energy => -sq.sqrt(),
        }
    }

    /// Gradient of `k(x, y)` with respect to `x`, written into `out`.
    pub(crate) fn grad_x(&self, x: &ArrayView1<f32>, y: &ArrayView1<f32>, out: &mut [f32]) {
        let sq = squared_distance(x, y);
        let dist = sq.sqrt();
        match *self {
            Kernel::Gaussian { sigma } => {
                let k = (-sq / (2.0 * sigma * sigma)).exp();
                let scale = -k / (sigma * sigma);
                for c in 0..x.len() {
                    out[c] = scale * (x[c] - y[c]);
                }
            }
            Kernel::Laplace { sigma } => {
                if dist < EPSILON {
                    out.fill(0.0);
                    return;
                }
                let k = (-dist / sigma).exp();
                let scale = -k / (sigma * dist);
                for c in 0..x.len() {
                    out[c] = scale * (x[c] - y[c]);
                }
            }
            Kernel::Energy => {
                if dist < EPSILON {
                    out.fill(0.0);
                    return;
                }
                for c in 0..x.len() {
                    out[c] = -(x[c] - y[c]) / dist;
                }
            }
        }
    }
}

/// Squared kernel norm (MMD²) of the difference measure `α − β`:
///
/// \[
/// \tfrac{1}{2}\langle \alpha, k \star \alpha \rangle
/// + \tfrac{1}{2}\langle \beta, k \star \beta \rangle
/// - \langle \alpha, k \star \beta \rangle
/// \]
///
/// Tiled evaluation, `O(N + M)` memory, parallel over rows.
pub fn mmd_loss(alpha: &Measure, beta: &Measure, kernel: Kernel) -> Result<f32> {
    kernel.validate()?;
    if alpha.dim() != beta.dim() {
        return Err(Error::DimensionMismatch(alpha.dim(), beta.dim()));
    }
    debug!(
        "mmd_loss: {} x {} points, dim {}, kernel {:?}",
        alpha.len(),
        beta.len(),
        alpha.dim(),
        kernel
    );

    let aa = weighted_kernel_sum(alpha, alpha, kernel);
    let bb = weighted_kernel_sum(beta, beta, kernel);
    let ab = weighted_kernel_sum(alpha, beta, kernel);
    Ok((0.5 * aa + 0.5 * bb - ab) as f32)
}

/// `mmd_loss` plus analytic gradients with respect to both position sets
/// and both weight vectors, scaled by `upstream`.
pub fn mmd_loss_with_grad(
    alpha: &Measure,
    beta: &Measure,
    kernel: Kernel,
    upstream: f32,
) -> Result<(f32, Gradients)> {
    let loss = mmd_loss(alpha, beta, kernel)?;

    let (gw_x, gp_x) = mmd_side_grads(alpha, beta, kernel, upstream);
    let (gw_y, gp_y) = mmd_side_grads(beta, alpha, kernel, upstream);

    Ok((
        loss,
        Gradients {
            weights_x: gw_x,
            positions_x: gp_x,
            weights_y: gw_y,
            positions_y: gp_y,
        },
    ))
}

/// `Σ_ij u_i v_j k(x_i, y_j)` with an f64 accumulator.
fn weighted_kernel_sum(mu: &Measure, nu: &Measure, kernel: Kernel) -> f64 {
    let xs = mu.positions();
    let ys = nu.positions();
    let u = mu.weights();
    let v = nu.weights();

    (0..mu.len())
        .into_par_iter()
        .map(|i| {
            let xi = xs.row(i);
            let mut acc = 0.0f64;
            for j in 0..nu.len() {
                acc += (v[j] * kernel.value(&xi, &ys.row(j))) as f64;
            }
            (u[i] as f64) * acc
        })
        .sum()
}

/// Gradients of the kernel norm for the `mu` side, with `nu` as the
/// opposite measure:
///
/// `∂L/∂u_i = Σ_j u_j k(x_i, x_j) − Σ_j v_j k(x_i, y_j)` and
/// `∂L/∂x_i = u_i [Σ_j u_j ∇k(x_i, x_j) − Σ_j v_j ∇k(x_i, y_j)]`.
fn mmd_side_grads(
    mu: &Measure,
    nu: &Measure,
    kernel: Kernel,
    upstream: f32,
) -> (Array1<f32>, Array2<f32>) {
    let xs = mu.positions();
    let ys = nu.positions();
    let u = mu.weights();
    let v = nu.weights();
    let d = mu.dim();

    let rows: Vec<(f32, Vec<f32>)> = (0..mu.len())
        .into_par_iter()
        .map(|i| {
            let xi = xs.row(i);
            let mut gw = 0.0f64;
            let mut gp = vec![0.0f32; d];
            let mut tmp = vec![0.0f32; d];

            for j in 0..mu.len() {
                let xj = xs.row(j);
                gw += (u[j] * kernel.value(&xi, &xj)) as f64;
                kernel.grad_x(&xi, &xj, &mut tmp);
                for c in 0..d {
                    gp[c] += u[j] * tmp[c];
                }
            }
            for j in 0..nu.len() {
                let yj = ys.row(j);
                gw -= (v[j] * kernel.value(&xi, &yj)) as f64;
                kernel.grad_x(&xi, &yj, &mut tmp);
                for c in 0..d {
                    gp[c] -= v[j] * tmp[c];
                }
            }

            let wi = upstream * u[i];
            for g in gp.iter_mut() {
                *g *= wi;
            }
            (upstream * gw as f32, gp)
        })
        .collect();

    let mut grad_w = Array1::zeros(mu.len());
    let mut grad_p = Array2::zeros((mu.len(), d));
    for (i, (gw, gp)) in rows.into_iter().enumerate() {
        grad_w[i] = gw;
        for c in 0..d {
            grad_p[[i, c]] = gp[c];
        }
    }
    (grad_w, grad_p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn power_cost_values() {
        let x = array![0.0f32, 0.0];
        let y = array![3.0f32, 4.0];
        assert!((ground_cost(1, &x.view(), &y.view()) - 5.0).abs() < 1e-6);
        assert!((ground_cost(2, &x.view(), &y.view()) - 12.5).abs() < 1e-6);
    }

    #[test]
    fn cost_grad_p2_is_displacement() {
        let x = array![1.0f32, 2.0];
        let y = array![0.0f32, 0.0];
        let mut g = [0.0f32; 2];
        ground_cost_grad(2, &x.view(), &y.view(), &mut g);
        assert!((g[0] - 1.0).abs() < 1e-6);
        assert!((g[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn cost_grad_p1_is_unit_vector() {
        let x = array![3.0f32, 4.0];
        let y = array![0.0f32, 0.0];
        let mut g = [0.0f32; 2];
        ground_cost_grad(1, &x.view(), &y.view(), &mut g);
        assert!((g[0] - 0.6).abs() < 1e-6);
        assert!((g[1] - 0.8).abs() < 1e-6);

        // Coincident points: zero subgradient, not NaN.
        ground_cost_grad(1, &x.view(), &x.view(), &mut g);
        assert_eq!(g, [0.0, 0.0]);
    }

    #[test]
    fn gaussian_kernel_at_zero_distance_is_one() {
        let k = Kernel::Gaussian { sigma: 0.7 };
        let x = array![1.0f32, -2.0];
        assert!((k.value(&x.view(), &x.view()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mmd_vanishes_on_identical_measures() {
        let m = Measure::uniform(array![[0.0f32, 0.0], [1.0, 0.0], [0.0, 1.0]]).unwrap();
        for kernel in [
            Kernel::Gaussian { sigma: 0.5 },
            Kernel::Laplace { sigma: 0.5 },
            Kernel::Energy,
        ] {
            let loss = mmd_loss(&m, &m, kernel).unwrap();
            assert!(loss.abs() < 1e-6, "{kernel:?}: {loss}");
        }
    }

    #[test]
    fn mmd_positive_on_distinct_measures() {
        let a = Measure::uniform(array![[0.0f32, 0.0], [1.0, 0.0]]).unwrap();
        let b = Measure::uniform(array![[0.0f32, 2.0], [1.0, 2.0]]).unwrap();
        for kernel in [
            Kernel::Gaussian { sigma: 0.5 },
            Kernel::Laplace { sigma: 0.5 },
            Kernel::Energy,
        ] {
            let loss = mmd_loss(&a, &b, kernel).unwrap();
            assert!(loss > 1e-4, "{kernel:?}: {loss}");
        }
    }

    #[test]
    fn mmd_rejects_bad_bandwidth() {
        let m = Measure::uniform(array![[0.0f32]]).unwrap();
        assert!(mmd_loss(&m, &m, Kernel::Gaussian { sigma: 0.0 }).is_err());
    }

    #[test]
    fn mmd_gradient_matches_finite_differences() {
        let a = Measure::new(array![0.4, 0.6], array![[0.0f32, 0.0], [1.0, 0.5]]).unwrap();
        let b = Measure::new(array![0.5, 0.5], array![[0.2f32, 0.1], [0.8, 0.9]]).unwrap();
        let kernel = Kernel::Gaussian { sigma: 0.8 };

        let (_, grads) = mmd_loss_with_grad(&a, &b, kernel, 1.0).unwrap();

        let h = 1e-2f32;
        for i in 0..a.len() {
            for c in 0..a.dim() {
                let mut plus = a.positions().clone();
                plus[[i, c]] += h;
                let mut minus = a.positions().clone();
                minus[[i, c]] -= h;
                let lp = mmd_loss(
                    &Measure::new(a.weights().clone(), plus).unwrap(),
                    &b,
                    kernel,
                )
                .unwrap();
                let lm = mmd_loss(
                    &Measure::new(a.weights().clone(), minus).unwrap(),
                    &b,
                    kernel,
                )
                .unwrap();
                let fd = (lp - lm) / (2.0 * h);
                let an = grads.positions_x[[i, c]];
                assert!(
                    (fd - an).abs() < 2e-3,
                    "position ({i},{c}): fd={fd} analytic={an}"
                );
            }
        }
    }
}
