// Within a fixed temperature the damped, averaged updates are a
// contraction: the max potential change must shrink from one inner update
// to the next until the tolerance cuts the loop. The drift log exposes the
// sequence.

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use sinkdiv::{compute_loss, Measure, SinkhornConfig, SolveStatus};

fn small_cloud(seed: u64, n: usize, shift: f32) -> Measure {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut pos = Array2::zeros((n, 2));
    for i in 0..n {
        for k in 0..2 {
            pos[[i, k]] = shift + 0.15 * rng.sample::<f32, _>(StandardNormal);
        }
    }
    Measure::uniform(pos).unwrap()
}

#[test]
fn update_magnitude_shrinks_within_a_fixed_bandwidth() {
    // Compact clouds against a generous blur: the update map is a strong
    // contraction here, so the tolerance is reachable well inside the cap.
    let alpha = small_cloud(61, 40, 0.0);
    let beta = small_cloud(62, 45, 0.3);

    // Pinning the diameter hint to the blur collapses the ladder to a
    // single temperature, so every logged drift lives at one bandwidth.
    let cfg = SinkhornConfig {
        blur: 0.6,
        diameter: Some(0.6),
        tol: 1e-6,
        inner_cap: 40,
        ..Default::default()
    };

    let out = compute_loss(&alpha, &beta, &cfg).unwrap();
    assert_eq!(out.status, SolveStatus::Converged);

    for step in [0u32, 1u32] {
        let drifts: Vec<f32> = out
            .drift_log
            .iter()
            .filter(|(k, _)| *k == step)
            .map(|&(_, d)| d)
            .collect();
        assert!(!drifts.is_empty());
        for w in drifts.windows(2) {
            assert!(
                w[1] <= w[0] * 1.05 + 1e-7,
                "drift grew within step {step}: {:?}",
                drifts
            );
        }
    }
}

#[test]
fn annealed_drift_resets_per_rung_but_decays_inside_each() {
    let alpha = small_cloud(71, 35, 0.0);
    let beta = small_cloud(72, 35, 0.4);
    let cfg = SinkhornConfig {
        blur: 0.2,
        tol: 1e-4,
        inner_cap: 25,
        ..Default::default()
    };

    let out = compute_loss(&alpha, &beta, &cfg).unwrap();
    let max_step = out.drift_log.iter().map(|&(k, _)| k).max().unwrap();

    for step in 0..=max_step {
        let drifts: Vec<f32> = out
            .drift_log
            .iter()
            .filter(|(k, _)| *k == step)
            .map(|&(_, d)| d)
            .collect();
        for w in drifts.windows(2) {
            assert!(
                w[1] <= w[0] * 1.05 + 1e-7,
                "drift grew within rung {step}: {:?}",
                drifts
            );
        }
    }

    // Each rung must end no worse than it started.
    let final_drifts: Vec<f32> = out
        .drift_log
        .iter()
        .filter(|(k, _)| *k == max_step)
        .map(|&(_, d)| d)
        .collect();
    assert!(final_drifts.last().unwrap() <= final_drifts.first().unwrap());
}
