//! Host-side reference implementations of the optimizer update nodes. The
//! math here defines what an external executor must compute for the nodes the
//! builder inserts; tests pin both against each other.
//!
//! All arithmetic runs in f32 regardless of storage precision. Weights come
//! back in their original dtype, moments stay f32, and the optional f16
//! shadow is re-narrowed from the updated f32 weight.

use crate::tensor::{TensorValue, TensorValueError};
use ndarray::{ArrayD, IxDyn};

use super::config::OptimizerNodeConfig;

#[derive(Debug, thiserror::Error)]
pub enum OptimizerStepError {
    #[error("Weight/gradient shape mismatch: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),
    #[error(transparent)]
    TensorValue(#[from] TensorValueError),
}

/// First and second moment accumulators, kept in full precision.
#[derive(Clone, Debug, PartialEq)]
pub struct MomentState {
    pub moment_1: ArrayD<f32>,
    pub moment_2: ArrayD<f32>,
}

impl MomentState {
    pub fn zeros_like(weight: &TensorValue) -> Self {
        let shape = IxDyn(&weight.shape());
        Self {
            moment_1: ArrayD::zeros(shape.clone()),
            moment_2: ArrayD::zeros(shape),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AdamStepResult {
    pub weight: TensorValue,
    pub moments: MomentState,
    pub update_count: i64,
    pub fp16_weight: Option<TensorValue>,
}

#[derive(Clone, Debug)]
pub struct LambStepResult {
    pub weight: TensorValue,
    pub moments: MomentState,
    pub fp16_weight: Option<TensorValue>,
}

fn check_shapes(weight: &TensorValue, gradient: &TensorValue) -> Result<(), OptimizerStepError> {
    if weight.shape() != gradient.shape() {
        return Err(OptimizerStepError::ShapeMismatch(
            weight.shape(),
            gradient.shape(),
        ));
    }
    Ok(())
}

/// W <- W - eta * G
pub fn sgd_step(
    eta: f32,
    weight: &TensorValue,
    gradient: &TensorValue,
) -> Result<TensorValue, OptimizerStepError> {
    check_shapes(weight, gradient)?;
    let w = weight.to_f32_array()?;
    let g = gradient.to_f32_array()?;
    let updated = &w - &(g * eta);
    Ok(TensorValue::from_f32_array(updated, weight.dtype())?)
}

/// One Adam update. `update_count` is the 1-based step this update performs;
/// bias correction divides each moment by its decay deficit at that step.
/// With `do_update` false every state passes through untouched, including the
/// step counter.
#[allow(clippy::too_many_arguments)]
pub fn adam_step(
    cfg: &OptimizerNodeConfig,
    eta: f32,
    update_count: i64,
    weight: &TensorValue,
    gradient: &TensorValue,
    moments: &MomentState,
    fp16_weight: Option<&TensorValue>,
    do_update: bool,
) -> Result<AdamStepResult, OptimizerStepError> {
    check_shapes(weight, gradient)?;
    if !do_update {
        return Ok(AdamStepResult {
            weight: weight.clone(),
            moments: moments.clone(),
            update_count,
            fp16_weight: fp16_weight.cloned(),
        });
    }

    let w = weight.to_f32_array()?;
    let g = gradient.to_f32_array()?;

    let m1 = &moments.moment_1 * cfg.alpha + &(&g * (1.0 - cfg.alpha));
    let m2 = &moments.moment_2 * cfg.beta + &(&g * &g * (1.0 - cfg.beta));

    let (alpha_correction, beta_correction) = if cfg.do_bias_correction {
        (
            1.0 - cfg.alpha.powi(update_count as i32),
            1.0 - cfg.beta.powi(update_count as i32),
        )
    } else {
        (1.0, 1.0)
    };

    let m1_hat = &m1 / alpha_correction;
    let m2_hat = &m2 / beta_correction;
    let update = &m1_hat / &(m2_hat.mapv(f32::sqrt) + cfg.epsilon) + &(&w * cfg.lambda);
    let updated = &w - &(update * eta);

    let fp16_weight = match fp16_weight {
        Some(shadow) => Some(TensorValue::from_f32_array(updated.clone(), shadow.dtype())?),
        None => None,
    };
    Ok(AdamStepResult {
        weight: TensorValue::from_f32_array(updated, weight.dtype())?,
        moments: MomentState {
            moment_1: m1,
            moment_2: m2,
        },
        update_count: update_count + 1,
        fp16_weight,
    })
}

/// One Lamb update: Adam-style direction `r = m1 / (sqrt(m2) + eps) +
/// lambda * W`, scaled by the layerwise trust ratio `||W|| / ||r||` clamped
/// to the configured threshold.
#[allow(clippy::too_many_arguments)]
pub fn lamb_step(
    cfg: &OptimizerNodeConfig,
    eta: f32,
    weight: &TensorValue,
    gradient: &TensorValue,
    moments: &MomentState,
    fp16_weight: Option<&TensorValue>,
    do_update: bool,
) -> Result<LambStepResult, OptimizerStepError> {
    check_shapes(weight, gradient)?;
    if !do_update {
        return Ok(LambStepResult {
            weight: weight.clone(),
            moments: moments.clone(),
            fp16_weight: fp16_weight.cloned(),
        });
    }

    let w = weight.to_f32_array()?;
    let g = gradient.to_f32_array()?;

    let m1 = &moments.moment_1 * cfg.alpha + &(&g * (1.0 - cfg.alpha));
    let m2 = &moments.moment_2 * cfg.beta + &(&g * &g * (1.0 - cfg.beta));
    let direction = &m1 / &(m2.mapv(f32::sqrt) + cfg.epsilon) + &(&w * cfg.lambda);

    let w_norm = l2_norm(&w);
    let r_norm = l2_norm(&direction);
    let trust_ratio = if w_norm > 0.0 && r_norm > 0.0 {
        (w_norm / r_norm).min(cfg.lamb_threshold)
    } else {
        1.0
    };
    let updated = &w - &(direction * (eta * trust_ratio));

    let fp16_weight = match fp16_weight {
        Some(shadow) => Some(TensorValue::from_f32_array(updated.clone(), shadow.dtype())?),
        None => None,
    };
    Ok(LambStepResult {
        weight: TensorValue::from_f32_array(updated, weight.dtype())?,
        moments: MomentState {
            moment_1: m1,
            moment_2: m2,
        },
        fp16_weight,
    })
}

fn l2_norm(values: &ArrayD<f32>) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::config::OptimizerAlgorithm;

    fn tensor(values: Vec<f32>) -> TensorValue {
        let len = values.len();
        TensorValue::from_vec_shape(values, &[len]).unwrap()
    }

    #[test]
    fn sgd_moves_against_the_gradient() {
        let w = tensor(vec![1.0, 2.0, 3.0]);
        let g = tensor(vec![4.0, 5.0, 6.0]);
        let out = sgd_step(0.5, &w, &g).unwrap();
        let out = out.to_f32_array().unwrap();
        assert_eq!(out.as_slice().unwrap(), &[-1.0, -0.5, 0.0]);
    }

    #[test]
    fn adam_first_step_matches_closed_form() {
        let cfg = OptimizerNodeConfig::default();
        let w = tensor(vec![1.0]);
        let g = tensor(vec![0.5]);
        let moments = MomentState::zeros_like(&w);
        let out = adam_step(&cfg, 0.1, 1, &w, &g, &moments, None, true).unwrap();

        // m1 = 0.1*g, m2 = 0.001*g^2; bias correction at step 1 divides those
        // factors back out, so the update direction is g/(|g| + eps).
        let m1 = 0.1 * 0.5;
        let m2 = 0.001 * 0.25;
        let m1_hat = m1 / (1.0 - 0.9f32);
        let m2_hat = m2 / (1.0 - 0.999f32);
        let expected = 1.0 - 0.1 * m1_hat / (m2_hat.sqrt() + 1e-8);

        let w_out = out.weight.to_f32_array().unwrap();
        assert!((w_out[[0]] - expected).abs() < 1e-6);
        assert_eq!(out.update_count, 2);
        assert!((out.moments.moment_1[[0]] - m1).abs() < 1e-6);
        assert!((out.moments.moment_2[[0]] - m2).abs() < 1e-6);
    }

    #[test]
    fn gated_step_passes_everything_through() {
        let cfg = OptimizerNodeConfig::default();
        let w = tensor(vec![1.0, 2.0]);
        let g = tensor(vec![f32::NAN, 1.0]);
        let moments = MomentState::zeros_like(&w);
        let out = adam_step(&cfg, 0.1, 7, &w, &g, &moments, None, false).unwrap();
        assert_eq!(out.weight, w);
        assert_eq!(out.update_count, 7);
        assert_eq!(out.moments, moments);
    }

    #[test]
    fn lamb_trust_ratio_is_clamped() {
        let cfg = OptimizerNodeConfig {
            algorithm: OptimizerAlgorithm::Lamb,
            ..Default::default()
        };
        let w = tensor(vec![100.0, 100.0]);
        let g = tensor(vec![0.001, 0.001]);
        let moments = MomentState::zeros_like(&w);
        let out = lamb_step(&cfg, 0.1, &w, &g, &moments, None, true).unwrap();

        // ||w|| / ||r|| is enormous here; the clamp caps it at the threshold,
        // so the step is exactly eta * threshold * r.
        let m1: f32 = 0.1 * 0.001;
        let m2: f32 = 0.001 * 0.001 * 0.001;
        let r: f32 = m1 / (m2.sqrt() + 1e-8);
        let expected = 100.0 - 0.1 * 1.0 * r;
        let w_out = out.weight.to_f32_array().unwrap();
        assert!((w_out[[0]] - expected).abs() < 1e-3);
    }
}
