//! Annealing schedule ("epsilon-scaling") for the Sinkhorn loop.
//!
//! Starting from the data diameter, the blur scale decays geometrically by a
//! fixed ratio per outer step until it reaches the target value, where it
//! stays. Temperatures are homogeneous to the cost function: `eps = blur^p`.
//! Early, large temperatures make the fixed point easy to reach; each step
//! then warm-starts the next, colder one.
//!
//! # References
//!
//! - Kosowsky & Yuille (1994). "The Invisible Hand Algorithm: Solving the
//!   Assignment Problem with Statistical Physics"
//! - Schmitzer (2019). "Stabilized Sparse Scaling Algorithms for Entropy
//!   Regularized Transport Problems"

use ndarray::ArrayView2;

/// Upper bound on the largest distance between any two sample locations,
/// from the corners of the joint bounding box.
pub fn max_diameter(x: &ArrayView2<f32>, y: &ArrayView2<f32>) -> f32 {
    let d = x.ncols();
    debug_assert_eq!(y.ncols(), d);

    let mut sq = 0.0f32;
    for k in 0..d {
        let mut lo = f32::INFINITY;
        let mut hi = f32::NEG_INFINITY;
        for v in x.column(k).iter().chain(y.column(k).iter()) {
            lo = lo.min(*v);
            hi = hi.max(*v);
        }
        let side = hi - lo;
        sq += side * side;
    }
    sq.sqrt()
}

/// The blur ladder driving one solve.
#[derive(Debug, Clone)]
pub struct BlurSchedule {
    /// Diameter actually used (clamped to be >= the target blur).
    pub diameter: f32,
    /// Strictly decreasing blur values, floored at the target; the last
    /// entry equals the target blur.
    pub blurs: Vec<f32>,
    /// Ground-cost exponent, relating blur scales to temperatures.
    pub p: u32,
}

impl BlurSchedule {
    /// Build the geometric ladder `blur_k = max(diameter · scaling^k, blur)`.
    ///
    /// The step count is the smallest `n` such that `diameter · scaling^(n-2)`
    /// has dropped below `blur`, plus a repeat of the floor value — so the
    /// final temperature is always visited at least twice.
    pub fn new(diameter: f32, blur: f32, scaling: f32, p: u32) -> Self {
        debug_assert!(blur > 0.0 && blur.is_finite());
        debug_assert!(scaling > 0.0 && scaling < 1.0);

        let diameter = diameter.max(blur);
        let n_steps = if diameter <= blur {
            2
        } else {
            // f64 with a one-ulp nudge: the ratio often lands exactly on an
            // integer (diameter/blur a power of the scaling) and must not
            // round down across platforms.
            let ratio = (blur.ln() as f64 - diameter.ln() as f64) / scaling.ln() as f64;
            (ratio + 1e-6).floor() as usize + 2
        };

        let mut blurs = Vec::with_capacity(n_steps);
        let log_d = diameter.ln();
        let log_s = scaling.ln();
        for k in 0..n_steps {
            let b = (log_d + k as f32 * log_s).exp();
            blurs.push(b.max(blur));
        }
        // Guard against float drift in the last rung.
        if let Some(last) = blurs.last_mut() {
            *last = blur;
        }

        Self { diameter, blurs, p }
    }

    /// Number of outer steps.
    pub fn len(&self) -> usize {
        self.blurs.len()
    }

    /// True when the ladder is empty (never, by construction).
    pub fn is_empty(&self) -> bool {
        self.blurs.is_empty()
    }

    /// Temperature at step `k`: `eps_k = blur_k^p`.
    pub fn eps(&self, k: usize) -> f32 {
        self.blurs[k].powi(self.p as i32)
    }

    /// Final temperature, `blur^p`.
    pub fn eps_final(&self) -> f32 {
        self.eps(self.blurs.len() - 1)
    }
}

/// Marginal-constraint strength on the cost scale: `rho = reach^p`.
/// `None` stands for `rho = +∞`, i.e. balanced transport.
pub fn reach_to_rho(reach: Option<f32>, p: u32) -> Option<f32> {
    reach.map(|r| r.powi(p as i32))
}

/// Damping factor for the dual updates: `rho / (rho + eps)` for unbalanced
/// transport, 1 for balanced.
pub fn damping(rho: Option<f32>, eps: f32) -> f32 {
    match rho {
        Some(rho) => rho / (rho + eps),
        None => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn diameter_of_unit_segment() {
        let x = array![[0.0f32, 0.0], [1.0, 0.0]];
        let y = array![[0.5f32, 0.0]];
        let d = max_diameter(&x.view(), &y.view());
        assert!((d - 1.0).abs() < 1e-6);
    }

    #[test]
    fn diameter_uses_joint_bounding_box() {
        let x = array![[0.0f32, 0.0]];
        let y = array![[3.0f32, 4.0]];
        let d = max_diameter(&x.view(), &y.view());
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn ladder_decays_to_target() {
        let s = BlurSchedule::new(1.0, 0.01, 0.5, 2);
        assert!(s.len() >= 2);
        assert!((s.blurs[0] - 1.0).abs() < 1e-6);
        assert_eq!(*s.blurs.last().unwrap(), 0.01);
        for w in s.blurs.windows(2) {
            assert!(w[1] <= w[0] + 1e-7, "ladder must be nonincreasing: {:?}", s.blurs);
        }
        for &b in &s.blurs {
            assert!(b >= 0.01 - 1e-7);
        }
    }

    #[test]
    fn ladder_geomloss_example() {
        // diameter = 1, blur = 0.01, scaling = 0.1 -> 4 rungs [1, 0.1, 0.01, 0.01].
        let s = BlurSchedule::new(1.0, 0.01, 0.1, 2);
        assert_eq!(s.len(), 4);
        assert!((s.blurs[0] - 1.0).abs() < 1e-6);
        assert!((s.blurs[1] - 0.1).abs() < 1e-6);
        assert!((s.blurs[2] - 0.01).abs() < 1e-6);
        assert!((s.blurs[3] - 0.01).abs() < 1e-9);
    }

    #[test]
    fn ladder_degenerates_when_blur_exceeds_diameter() {
        let s = BlurSchedule::new(0.5, 2.0, 0.5, 2);
        assert_eq!(s.len(), 2);
        assert_eq!(s.blurs, vec![2.0, 2.0]);
        assert!((s.diameter - 2.0).abs() < 1e-6);
    }

    #[test]
    fn temperatures_follow_exponent() {
        let s = BlurSchedule::new(1.0, 0.1, 0.5, 2);
        assert!((s.eps_final() - 0.01).abs() < 1e-7);
        let s1 = BlurSchedule::new(1.0, 0.1, 0.5, 1);
        assert!((s1.eps_final() - 0.1).abs() < 1e-7);
    }

    #[test]
    fn damping_is_one_for_balanced() {
        assert_eq!(damping(None, 0.3), 1.0);
        let d = damping(Some(1.0), 1.0);
        assert!((d - 0.5).abs() < 1e-7);
    }

    #[test]
    fn rho_is_reach_to_the_p() {
        assert_eq!(reach_to_rho(None, 2), None);
        let rho = reach_to_rho(Some(0.5), 2).unwrap();
        assert!((rho - 0.25).abs() < 1e-7);
    }
}
