//! Numeric fixtures for the host-side optimizer kernels and the gradient
//! accumulator, pinning the exact arithmetic contract the update nodes carry.

use ndarray::ArrayD;
use training_graph::accumulation::GradientAccumulator;
use training_graph::optimizer::{adam_step, lamb_step, sgd_step, MomentState, OptimizerNodeConfig};
use training_graph::{DType, TensorValue};

fn tensor(values: Vec<f32>) -> TensorValue {
    let len = values.len();
    TensorValue::from_vec_shape(values, &[len]).unwrap()
}

fn values(t: &TensorValue) -> Vec<f32> {
    t.to_f32_array().unwrap().iter().copied().collect()
}

#[test]
fn sgd_update_is_exact() {
    let out = sgd_step(0.5, &tensor(vec![1.0, 2.0, 3.0]), &tensor(vec![4.0, 5.0, 6.0])).unwrap();
    assert_eq!(values(&out), vec![-1.0, -0.5, 0.0]);
}

#[test]
fn adam_update_matches_reference_values() {
    let cfg = OptimizerNodeConfig::default();
    let moments = MomentState {
        moment_1: ArrayD::from_shape_vec(ndarray::IxDyn(&[3]), vec![0.1, 0.2, 0.3]).unwrap(),
        moment_2: ArrayD::from_shape_vec(ndarray::IxDyn(&[3]), vec![0.4, 0.5, 0.6]).unwrap(),
    };
    let out = adam_step(
        &cfg,
        0.5,
        3,
        &tensor(vec![1.0, 2.0, 3.0]),
        &tensor(vec![4.0, 5.0, 6.0]),
        &moments,
        None,
        true,
    )
    .unwrap();

    let expected = [0.9232284f32, 1.9051629, 2.8897603];
    for (got, want) in values(&out.weight).iter().zip(expected) {
        assert!((got - want).abs() < 1e-4, "got {got}, want {want}");
    }
    assert_eq!(out.update_count, 4);
    // Moment recurrences straight from the decay rates.
    let m1 = out.moments.moment_1;
    assert!((m1[[0]] - 0.49).abs() < 1e-6);
    assert!((m1[[2]] - 0.87).abs() < 1e-6);
    let m2 = out.moments.moment_2;
    assert!((m2[[0]] - 0.4156).abs() < 1e-6);
}

#[test]
fn gated_update_returns_state_unchanged() {
    let cfg = OptimizerNodeConfig::default();
    let w = tensor(vec![1.0, 2.0]);
    let g = tensor(vec![f32::INFINITY, 3.0]);
    let moments = MomentState::zeros_like(&w);
    let shadow = w.cast(DType::F16).unwrap();

    let adam = adam_step(&cfg, 0.5, 11, &w, &g, &moments, Some(&shadow), false).unwrap();
    assert_eq!(adam.weight, w);
    assert_eq!(adam.update_count, 11);
    assert_eq!(adam.moments, moments);
    assert_eq!(adam.fp16_weight.unwrap(), shadow);

    let lamb_cfg = OptimizerNodeConfig::lamb();
    let lamb = lamb_step(&lamb_cfg, 0.5, &w, &g, &moments, Some(&shadow), false).unwrap();
    assert_eq!(lamb.weight, w);
    assert_eq!(lamb.moments, moments);
    assert_eq!(lamb.fp16_weight.unwrap(), shadow);
}

#[test]
fn lamb_matches_a_scalar_reference() {
    let cfg = OptimizerNodeConfig::lamb();
    let w = tensor(vec![2.0]);
    let g = tensor(vec![1.0]);
    let moments = MomentState::zeros_like(&w);
    let out = lamb_step(&cfg, 0.1, &w, &g, &moments, None, true).unwrap();

    let m1 = 0.1f32;
    let m2 = 0.001f32;
    let r = m1 / (m2.sqrt() + 1e-8);
    let trust = (2.0 / r).min(cfg.lamb_threshold);
    let expected = 2.0 - 0.1 * trust * r;
    assert!((values(&out.weight)[0] - expected).abs() < 1e-5);
}

#[test]
fn lamb_handles_multi_dimensional_weights() {
    let cfg = OptimizerNodeConfig::lamb();
    let w = TensorValue::from_vec_shape(vec![1.0f32, -2.0, 3.0, -4.0, 5.0, -6.0], &[2, 3]).unwrap();
    let g = TensorValue::filled(DType::F32, &[2, 3], 0.5).unwrap();
    let moments = MomentState::zeros_like(&w);
    let out = lamb_step(&cfg, 0.01, &w, &g, &moments, None, true).unwrap();
    assert_eq!(out.weight.shape(), vec![2, 3]);
    // Every element moved against the (uniform) gradient.
    for (before, after) in values(&w).iter().zip(values(&out.weight)) {
        assert!(after < *before);
    }
}

#[test]
fn mixed_precision_step_refreshes_the_shadow() {
    let cfg = OptimizerNodeConfig::default();
    let w = tensor(vec![1.0, 2.0, 3.0]);
    let g = tensor(vec![0.5, 0.5, 0.5]);
    let moments = MomentState::zeros_like(&w);
    let shadow = w.cast(DType::F16).unwrap();
    let out = adam_step(&cfg, 0.1, 1, &w, &g, &moments, Some(&shadow), true).unwrap();
    let shadow_out = out.fp16_weight.unwrap();
    assert_eq!(shadow_out.dtype(), DType::F16);
    // Shadow tracks the f32 result to f16 resolution.
    for (full, half) in values(&out.weight).iter().zip(values(&shadow_out)) {
        assert!((full - half).abs() < 1e-2);
    }
}

#[test]
fn accumulator_sums_mixed_precision_pairs() {
    let mut acc = GradientAccumulator::new(TensorValue::zeros(DType::F32, &[3]));
    acc.accumulate(&tensor(vec![1.0, 2.0, 3.0])).unwrap();
    let half = TensorValue::from_vec_shape(vec![4.0f32, 5.0, 6.0], &[3])
        .unwrap()
        .cast(DType::F16)
        .unwrap();
    acc.accumulate(&half).unwrap();
    assert_eq!(values(&acc.take()), vec![5.0, 7.0, 9.0]);
    assert_eq!(values(acc.buffer()), vec![0.0, 0.0, 0.0]);
}
