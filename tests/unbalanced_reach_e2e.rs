use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use sinkdiv::{compute_loss, Measure, SinkhornConfig};

fn cloud(seed: u64, n: usize, center: [f32; 2], mass: f32) -> Measure {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut pos = Array2::zeros((n, 2));
    for i in 0..n {
        for k in 0..2 {
            pos[[i, k]] = center[k] + 0.2 * rng.sample::<f32, _>(StandardNormal);
        }
    }
    Measure::new(Array1::from_elem(n, mass / n as f32), pos).unwrap()
}

#[test]
fn unbalanced_divergence_is_symmetric_and_zero_on_diagonal() {
    let alpha = cloud(21, 40, [0.0, 0.0], 1.0);
    let beta = cloud(22, 50, [1.0, 0.5], 1.6);
    let cfg = SinkhornConfig {
        blur: 0.1,
        reach: Some(0.5),
        tol: 1e-4,
        inner_cap: 30,
        ..Default::default()
    };

    let self_loss = compute_loss(&alpha, &alpha, &cfg).unwrap().loss;
    assert!(self_loss.abs() < 1e-4, "self loss = {self_loss}");

    let ab = compute_loss(&alpha, &beta, &cfg).unwrap().loss;
    let ba = compute_loss(&beta, &alpha, &cfg).unwrap().loss;
    assert!((ab - ba).abs() < 1e-3 * (1.0 + ab.abs()), "ab={ab} ba={ba}");
    assert!(ab > 0.0);
}

#[test]
fn outlier_cost_saturates_with_a_short_reach() {
    // An outlier blob drifting away. Balanced transport must pay for the
    // full trip; with a short reach the solver prefers to destroy/create
    // that mass, so the loss saturates.
    let alpha = cloud(31, 40, [0.0, 0.0], 1.0);

    let balanced = SinkhornConfig { blur: 0.1, ..Default::default() };
    let leashed = SinkhornConfig { reach: Some(0.5), ..balanced.clone() };

    let make_beta = |offset: f32| {
        let main = cloud(32, 36, [0.0, 0.0], 0.9);
        let stray = cloud(33, 4, [offset, 0.0], 0.1);
        let mut pos = Array2::zeros((40, 2));
        let mut w = Array1::zeros(40);
        for i in 0..36 {
            pos.row_mut(i).assign(&main.positions().row(i));
            w[i] = main.weights()[i];
        }
        for i in 0..4 {
            pos.row_mut(36 + i).assign(&stray.positions().row(i));
            w[36 + i] = stray.weights()[i];
        }
        Measure::new(w, pos).unwrap()
    };

    let near = make_beta(3.0);
    let far = make_beta(12.0);

    let bal_near = compute_loss(&alpha, &near, &balanced).unwrap().loss;
    let bal_far = compute_loss(&alpha, &far, &balanced).unwrap().loss;
    let un_near = compute_loss(&alpha, &near, &leashed).unwrap().loss;
    let un_far = compute_loss(&alpha, &far, &leashed).unwrap().loss;

    // Balanced: the outlier's trip dominates and keeps growing.
    assert!(bal_far > bal_near * 2.0, "bal near={bal_near} far={bal_far}");
    // Short reach: moving the outlier further barely changes the bill.
    let growth = (un_far - un_near) / un_near.abs().max(1e-6);
    assert!(
        growth < 0.5,
        "leashed loss should saturate: near={un_near} far={un_far}"
    );
    // And the leashed bill stays below the balanced one for the far case.
    assert!(un_far < bal_far);
}

#[test]
fn longer_reach_approaches_the_balanced_loss() {
    let alpha = cloud(41, 30, [0.0, 0.0], 1.0);
    let beta = cloud(42, 30, [1.5, 0.0], 1.0);

    let balanced = SinkhornConfig { blur: 0.1, tol: 1e-4, inner_cap: 40, ..Default::default() };
    let bal = compute_loss(&alpha, &beta, &balanced).unwrap().loss;

    let mut prev_gap = f32::INFINITY;
    for reach in [1.0f32, 4.0, 16.0] {
        let cfg = SinkhornConfig { reach: Some(reach), ..balanced.clone() };
        let loss = compute_loss(&alpha, &beta, &cfg).unwrap().loss;
        let gap = (bal - loss).abs();
        assert!(
            gap <= prev_gap + 1e-4,
            "reach {reach}: gap {gap} grew from {prev_gap}"
        );
        prev_gap = gap;
    }
}
