use ndarray::{array, Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use sinkdiv::{compute_loss, Measure, SinkhornConfig, SolveStatus};

fn gaussian_cloud(seed: u64, n: usize, shift: f32) -> Measure {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut pos = Array2::zeros((n, 2));
    for i in 0..n {
        for k in 0..2 {
            pos[[i, k]] = shift + rng.sample::<f32, _>(StandardNormal);
        }
    }
    Measure::uniform(pos).unwrap()
}

#[test]
fn two_point_scenario_zero_then_strictly_positive() {
    // Identical 2-point measures -> divergence ~ 0.
    let alpha = Measure::new(array![0.5, 0.5], array![[0.0, 0.0], [1.0, 0.0]]).unwrap();
    let beta = Measure::new(array![0.5, 0.5], array![[0.0, 0.0], [1.0, 0.0]]).unwrap();
    let cfg = SinkhornConfig { blur: 0.1, ..Default::default() };

    let same = compute_loss(&alpha, &beta, &cfg).unwrap();
    assert!(same.loss.abs() < 1e-4, "identical measures: {}", same.loss);

    // Move the second point out to (2, 0): the loss must strictly increase
    // and stay finite.
    let moved = Measure::new(array![0.5, 0.5], array![[0.0, 0.0], [2.0, 0.0]]).unwrap();
    let far = compute_loss(&alpha, &moved, &cfg).unwrap();
    assert!(far.loss.is_finite());
    assert!(far.loss > same.loss + 1e-3, "{} !> {}", far.loss, same.loss);
}

#[test]
fn divergence_is_symmetric() {
    let alpha = gaussian_cloud(42, 60, 0.0);
    let beta = gaussian_cloud(43, 80, 0.7);
    let cfg = SinkhornConfig { blur: 0.1, tol: 1e-4, inner_cap: 30, ..Default::default() };

    let ab = compute_loss(&alpha, &beta, &cfg).unwrap().loss;
    let ba = compute_loss(&beta, &alpha, &cfg).unwrap().loss;
    assert!(
        (ab - ba).abs() < 1e-3 * (1.0 + ab.abs()),
        "ab = {ab}, ba = {ba}"
    );
}

#[test]
fn divergence_is_nonnegative_across_random_pairs() {
    let cfg = SinkhornConfig { blur: 0.15, ..Default::default() };
    for seed in 0..6u64 {
        let alpha = gaussian_cloud(seed, 30, 0.0);
        let beta = gaussian_cloud(seed + 100, 35, 0.2 * seed as f32);
        let out = compute_loss(&alpha, &beta, &cfg).unwrap();
        assert!(out.loss >= 0.0, "seed {seed}: {}", out.loss);
        assert!(out.loss.is_finite());
    }
}

#[test]
fn zero_on_the_diagonal_requires_debias() {
    let alpha = gaussian_cloud(7, 50, 0.0);

    let debiased = SinkhornConfig { blur: 0.2, ..Default::default() };
    let raw = SinkhornConfig { debias: false, ..debiased.clone() };

    let zero = compute_loss(&alpha, &alpha, &debiased).unwrap().loss;
    assert!(zero.abs() < 1e-4, "debiased self loss: {zero}");

    let biased = compute_loss(&alpha, &alpha, &raw).unwrap().loss;
    assert!(biased.abs() > 1e-5, "raw entropic self cost should be nonzero");
}

#[test]
fn interpolation_moves_the_loss_monotonically() {
    // Pull beta from alpha's support toward a translate; the divergence to
    // alpha should grow with the translation.
    let alpha = gaussian_cloud(9, 40, 0.0);
    let cfg = SinkhornConfig { blur: 0.1, tol: 1e-4, inner_cap: 30, ..Default::default() };

    let mut prev = -1.0f32;
    for step in 0..5 {
        let t = step as f32 * 0.4;
        let shifted = {
            let mut pos = alpha.positions().clone();
            pos.mapv_inplace(|v| v + t);
            Measure::new(alpha.weights().clone(), pos).unwrap()
        };
        let loss = compute_loss(&alpha, &shifted, &cfg).unwrap().loss;
        assert!(
            loss >= prev - 1e-4,
            "loss should not shrink along the translation: {loss} after {prev}"
        );
        prev = loss;
    }
}

#[test]
fn weighted_and_uniform_measures_mix() {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let n = 40;
    let mut pos = Array2::zeros((n, 2));
    let mut w = Array1::zeros(n);
    for i in 0..n {
        pos[[i, 0]] = rng.sample::<f32, _>(StandardNormal);
        pos[[i, 1]] = rng.sample::<f32, _>(StandardNormal);
        w[i] = rng.gen::<f32>();
    }
    let total = w.sum();
    w.mapv_inplace(|v| v / total);

    let alpha = Measure::new(w, pos).unwrap();
    let beta = gaussian_cloud(6, 55, 0.3);
    let out = compute_loss(&alpha, &beta, &SinkhornConfig::default()).unwrap();
    assert!(out.loss.is_finite());
    assert!(out.loss >= 0.0);
    // Whatever the convergence verdict, it must be reported, not thrown.
    assert!(matches!(
        out.status,
        SolveStatus::Converged | SolveStatus::MaxIterReached
    ));
}
