// The point of the closed-form backward pass: plain gradient descent on
// raw point positions should drive one cloud onto another using nothing
// but the loss gradients.

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use sinkdiv::{
    compute_loss, hausdorff_divergence,
    kernel::{mmd_loss_with_grad, Kernel},
    Measure, SinkhornConfig,
};

fn cloud(seed: u64, n: usize, shift: [f32; 2]) -> Measure {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut pos = Array2::zeros((n, 2));
    for i in 0..n {
        for k in 0..2 {
            pos[[i, k]] = shift[k] + 0.3 * rng.sample::<f32, _>(StandardNormal);
        }
    }
    Measure::uniform(pos).unwrap()
}

#[test]
fn sinkhorn_gradient_flow_registers_the_clouds() {
    let target = cloud(81, 40, [0.0, 0.0]);
    let mut moving = cloud(82, 40, [1.5, -0.8]);

    let cfg = SinkhornConfig { blur: 0.2, tol: 1e-4, inner_cap: 30, ..Default::default() };

    let initial = compute_loss(&moving, &target, &cfg).unwrap().loss;
    let mut last = initial;
    for _ in 0..60 {
        let out = compute_loss(&moving, &target, &cfg).unwrap();
        last = out.loss;
        let grads = out.gradients(&moving, &target, 1.0).unwrap();

        // The position gradient carries the weight a_i = 1/n; scale the
        // step by n for an even per-point flow.
        let lr = 0.5 * moving.len() as f32;
        let mut pos = moving.positions().clone();
        for i in 0..moving.len() {
            for c in 0..2 {
                pos[[i, c]] -= lr * grads.positions_x[[i, c]];
            }
        }
        moving = Measure::new(moving.weights().clone(), pos).unwrap();
    }

    assert!(
        last < 0.05 * initial,
        "descent should collapse the divergence: {initial} -> {last}"
    );
}

#[test]
fn mmd_gradient_flow_also_converges() {
    let target = cloud(91, 30, [0.0, 0.0]);
    let mut moving = cloud(92, 30, [1.0, 0.5]);
    let kernel = Kernel::Gaussian { sigma: 0.6 };

    let (initial, _) = mmd_loss_with_grad(&moving, &target, kernel, 1.0).unwrap();
    let mut last = initial;
    for _ in 0..80 {
        let (loss, grads) = mmd_loss_with_grad(&moving, &target, kernel, 1.0).unwrap();
        last = loss;
        let mut pos = moving.positions().clone();
        for i in 0..moving.len() {
            for c in 0..2 {
                pos[[i, c]] -= 20.0 * grads.positions_x[[i, c]];
            }
        }
        moving = Measure::new(moving.weights().clone(), pos).unwrap();
    }
    assert!(
        last < 0.2 * initial,
        "MMD descent should shrink the loss: {initial} -> {last}"
    );
}

#[test]
fn hausdorff_tracks_the_sinkhorn_divergence_loosely() {
    let alpha = cloud(93, 35, [0.0, 0.0]);
    let near = cloud(94, 35, [0.3, 0.0]);
    let far = cloud(95, 35, [2.0, 0.0]);
    let cfg = SinkhornConfig { blur: 0.2, ..Default::default() };

    let h_near = hausdorff_divergence(&alpha, &near, &cfg).unwrap();
    let h_far = hausdorff_divergence(&alpha, &far, &cfg).unwrap();
    assert!(h_near >= 0.0 && h_far.is_finite());
    assert!(h_far > h_near, "near {h_near} vs far {h_far}");
}
