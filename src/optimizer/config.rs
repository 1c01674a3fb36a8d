//! Optimizer configuration: global graph-level settings and per-weight
//! hyperparameters, with validation up front so builder errors surface before
//! any graph mutation happens.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use super::OptimizerBuilderError;

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum OptimizerAlgorithm {
    Sgd,
    Adam,
    Lamb,
}

impl OptimizerAlgorithm {
    /// Operator type of the update node this algorithm inserts.
    pub fn op_type(&self) -> &'static str {
        match self {
            OptimizerAlgorithm::Sgd => "SGDOptimizer",
            OptimizerAlgorithm::Adam => "AdamOptimizer",
            OptimizerAlgorithm::Lamb => "LambOptimizer",
        }
    }

}

/// Hyperparameters attached to one weight's update node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerNodeConfig {
    pub algorithm: OptimizerAlgorithm,
    /// First-moment decay.
    pub alpha: f32,
    /// Second-moment decay.
    pub beta: f32,
    /// Decoupled weight decay.
    pub lambda: f32,
    pub epsilon: f32,
    pub do_bias_correction: bool,
    /// Upper clamp on the Lamb trust ratio ||w|| / ||r||.
    pub lamb_threshold: f32,
    /// Maintain an f16 shadow copy of this weight.
    pub mixed_precision_weight: bool,
    /// Keep moment buffers in f16 instead of f32.
    pub mixed_precision_moments: bool,
}

impl Default for OptimizerNodeConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerAlgorithm::Adam,
            alpha: 0.9,
            beta: 0.999,
            lambda: 0.0,
            epsilon: 1e-8,
            do_bias_correction: true,
            lamb_threshold: 1.0,
            mixed_precision_weight: false,
            mixed_precision_moments: false,
        }
    }
}

impl OptimizerNodeConfig {
    pub fn sgd() -> Self {
        Self {
            algorithm: OptimizerAlgorithm::Sgd,
            ..Self::default()
        }
    }

    pub fn lamb() -> Self {
        Self {
            algorithm: OptimizerAlgorithm::Lamb,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), OptimizerBuilderError> {
        let check = |name: &str, ok: bool| {
            if ok {
                Ok(())
            } else {
                Err(OptimizerBuilderError::InvalidHyperparameter(
                    name.to_string(),
                ))
            }
        };
        check("alpha", (0.0..=1.0).contains(&self.alpha))?;
        check("beta", (0.0..=1.0).contains(&self.beta))?;
        check("lambda", self.lambda >= 0.0)?;
        check("epsilon", self.epsilon > 0.0)?;
        check("lamb_threshold", self.lamb_threshold > 0.0)?;
        Ok(())
    }
}

/// Graph-level optimizer settings shared by every weight.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerGraphConfig {
    pub world_rank: usize,
    pub world_size: usize,
    /// Partition optimizer state across ranks (ZeRO stage 1).
    pub partition_optimizer: bool,
    /// Number of micro-steps accumulated into one optimizer step.
    pub gradient_accumulation_steps: usize,
    pub use_mixed_precision: bool,
    /// Cross-rank gradient reduction in f16 instead of f32.
    pub allreduce_in_fp16: bool,
    /// Scalar f32 graph input fed with the learning rate each step.
    pub learning_rate_input_name: String,
    /// Scalar bool graph input gating the update under mixed precision.
    pub do_update_input_name: String,
}

impl Default for OptimizerGraphConfig {
    fn default() -> Self {
        Self {
            world_rank: 0,
            world_size: 1,
            partition_optimizer: false,
            gradient_accumulation_steps: 1,
            use_mixed_precision: false,
            allreduce_in_fp16: false,
            learning_rate_input_name: "Learning_Rate".to_string(),
            do_update_input_name: "Update_Signal".to_string(),
        }
    }
}

impl OptimizerGraphConfig {
    pub fn validate(&self) -> Result<(), OptimizerBuilderError> {
        if self.world_size == 0 || self.world_rank >= self.world_size {
            return Err(OptimizerBuilderError::InvalidWorldConfig {
                rank: self.world_rank,
                size: self.world_size,
            });
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(OptimizerBuilderError::InvalidHyperparameter(
                "gradient_accumulation_steps".to_string(),
            ));
        }
        if self.partition_optimizer && self.world_size <= 1 {
            return Err(OptimizerBuilderError::InvalidWorldConfig {
                rank: self.world_rank,
                size: self.world_size,
            });
        }
        Ok(())
    }
}

/// Which graph-building strategy a configuration selects. Pure function of
/// the config, so every rank agrees without communicating.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum OptimizerBuilderKind {
    Default,
    Allreduce,
    ZeRO,
}

pub fn builder_kind(config: &OptimizerGraphConfig) -> OptimizerBuilderKind {
    if config.world_size > 1 {
        if config.partition_optimizer {
            OptimizerBuilderKind::ZeRO
        } else {
            OptimizerBuilderKind::Allreduce
        }
    } else {
        OptimizerBuilderKind::Default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_kind_selection() {
        let mut cfg = OptimizerGraphConfig::default();
        assert_eq!(builder_kind(&cfg), OptimizerBuilderKind::Default);
        cfg.world_size = 4;
        assert_eq!(builder_kind(&cfg), OptimizerBuilderKind::Allreduce);
        cfg.partition_optimizer = true;
        assert_eq!(builder_kind(&cfg), OptimizerBuilderKind::ZeRO);
        // Single process never selects a distributed builder.
        cfg.world_size = 1;
        cfg.partition_optimizer = false;
        assert_eq!(builder_kind(&cfg), OptimizerBuilderKind::Default);
    }

    #[test]
    fn hyperparameters_are_validated() {
        let mut cfg = OptimizerNodeConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.beta = 1.5;
        assert!(matches!(
            cfg.validate(),
            Err(OptimizerBuilderError::InvalidHyperparameter(_))
        ));
    }

    #[test]
    fn zero_requires_multiple_ranks() {
        let cfg = OptimizerGraphConfig {
            partition_optimizer: true,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
