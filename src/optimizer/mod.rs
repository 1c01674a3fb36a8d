//! Optimizer graph construction. One update node per trainable weight, with
//! optimizer state (moments, step counter, f16 shadow) materialized as
//! initializers and the updated values exposed through `_Out` tensors.
//!
//! Three strategies share this code path and differ only in what happens to
//! the gradient before the update node and to the weight after it:
//! Default (single process), Allreduce (replicated state, averaged
//! gradients), and ZeRO (optimizer state partitioned across ranks).

pub mod config;
pub mod steps;

pub use config::{
    builder_kind, OptimizerAlgorithm, OptimizerBuilderKind, OptimizerGraphConfig,
    OptimizerNodeConfig,
};
pub use steps::{adam_step, lamb_step, sgd_step, AdamStepResult, LambStepResult, MomentState};

use crate::distributed::{self, DistributedError};
use crate::dtype::DType;
use crate::graph::{Attribute, GraphError, GraphMutator, NodeDef, TensorId};
use crate::tensor::{TensorValue, TensorValueError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum OptimizerBuilderError {
    #[error("Invalid hyperparameter \"{0}\"")]
    InvalidHyperparameter(String),
    #[error("Invalid process group: rank {rank} out of world size {size}")]
    InvalidWorldConfig { rank: usize, size: usize },
    #[error("Unknown weight \"{0}\"")]
    UnknownWeight(String),
    #[error("No gradient tensor \"{0}\" in the graph")]
    MissingGradient(String),
    #[error("Weight \"{0}\" has no initializer value to derive optimizer state from")]
    MissingWeightValue(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    TensorValue(#[from] TensorValueError),
    #[error(transparent)]
    Distributed(#[from] DistributedError),
}

/// Per-weight request: which gradient feeds the update and with what
/// hyperparameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WeightOptimizer {
    pub gradient_name: String,
    pub node_config: OptimizerNodeConfig,
}

/// Names of the state tensors created for one weight. Everything an external
/// runtime needs to fetch results and carry state across steps.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WeightStateNames {
    /// Gradient actually consumed by the update node, after accumulation
    /// and collectives.
    pub gradient: String,
    pub weight_out: String,
    pub moment_1: Option<String>,
    pub moment_1_out: Option<String>,
    pub moment_2: Option<String>,
    pub moment_2_out: Option<String>,
    pub update_count: Option<String>,
    pub update_count_out: Option<String>,
    pub fp16_weight: Option<String>,
    pub fp16_weight_out: Option<String>,
    /// Accumulation buffer feeding the update, when micro-batching is on.
    pub accumulation_buffer: Option<String>,
}

#[derive(Clone, Debug)]
pub struct OptimizerBuildResult {
    pub kind: OptimizerBuilderKind,
    pub learning_rate_input: String,
    /// Present under mixed precision: the all-finite gate feed.
    pub do_update_input: Option<String>,
    pub weight_state: BTreeMap<String, WeightStateNames>,
    /// ZeRO only: owning rank per weight.
    pub partition: Option<BTreeMap<String, usize>>,
}

pub struct OptimizerGraphBuilder {
    config: OptimizerGraphConfig,
    weights: BTreeMap<String, WeightOptimizer>,
}

impl OptimizerGraphBuilder {
    pub fn new(config: OptimizerGraphConfig) -> Self {
        Self {
            config,
            weights: BTreeMap::new(),
        }
    }

    pub fn add_weight(
        &mut self,
        weight_name: &str,
        gradient_name: &str,
        node_config: OptimizerNodeConfig,
    ) -> &mut Self {
        self.weights.insert(
            weight_name.to_string(),
            WeightOptimizer {
                gradient_name: gradient_name.to_string(),
                node_config,
            },
        );
        self
    }

    pub fn build(
        &self,
        m: &mut GraphMutator,
    ) -> Result<OptimizerBuildResult, OptimizerBuilderError> {
        self.config.validate()?;
        for w in self.weights.values() {
            w.node_config.validate()?;
        }
        let kind = builder_kind(&self.config);
        log::info!(
            "building {} optimizer graph for {} weights (world size {})",
            kind,
            self.weights.len(),
            self.config.world_size
        );

        let lr_name = self.config.learning_rate_input_name.clone();
        let lr_id = match m.tensor_id_by_name(&lr_name) {
            Some(id) => id,
            None => m.add_input(&lr_name, DType::F32, vec![])?,
        };
        let do_update = if self.config.use_mixed_precision {
            let name = self.config.do_update_input_name.clone();
            let id = match m.tensor_id_by_name(&name) {
                Some(id) => id,
                None => m.add_input(&name, DType::BOOL, vec![])?,
            };
            Some((name, id))
        } else {
            None
        };

        let partition = if kind == OptimizerBuilderKind::ZeRO {
            let mut elements = BTreeMap::new();
            for name in self.weights.keys() {
                let id = m
                    .tensor_id_by_name(name)
                    .ok_or_else(|| OptimizerBuilderError::UnknownWeight(name.clone()))?;
                let info = m.graph().get_tensor(id).expect("weight tensor");
                let count = info
                    .shape
                    .as_ref()
                    .map(|s| s.iter().product())
                    .unwrap_or(0usize);
                elements.insert(name.clone(), count);
            }
            Some(distributed::partition_weights(
                &elements,
                self.config.world_size,
            ))
        } else {
            None
        };

        let mut weight_state = BTreeMap::new();
        for (weight_name, w) in &self.weights {
            let weight_id = m
                .tensor_id_by_name(weight_name)
                .ok_or_else(|| OptimizerBuilderError::UnknownWeight(weight_name.clone()))?;
            let mut gradient = w.gradient_name.clone();
            if m.tensor_id_by_name(&gradient).is_none() {
                return Err(OptimizerBuilderError::MissingGradient(gradient));
            }

            // Micro-batch accumulation happens before any cross-rank traffic,
            // so only the per-boundary gradient crosses the wire.
            let mut accumulation_buffer = None;
            if self.config.gradient_accumulation_steps > 1 {
                let (buffer, accumulated) = self.insert_accumulator(m, weight_id, &gradient)?;
                accumulation_buffer = Some(buffer);
                gradient = accumulated;
            }

            let owner = partition.as_ref().map(|p| p[weight_name]);
            match kind {
                OptimizerBuilderKind::Default => {}
                OptimizerBuilderKind::Allreduce => {
                    gradient = distributed::all_reduce_mean(
                        m,
                        &gradient,
                        self.config.world_size,
                        self.config.allreduce_in_fp16,
                    )?;
                }
                OptimizerBuilderKind::ZeRO => {
                    gradient = distributed::reduce_scatter(m, &gradient)?;
                }
            }

            let updates_here = owner.map(|o| o == self.config.world_rank).unwrap_or(true);
            let mut state = if updates_here {
                self.insert_update_node(
                    m,
                    weight_name,
                    weight_id,
                    &gradient,
                    &w.node_config,
                    lr_id,
                    do_update.as_ref().map(|(_, id)| *id),
                )?
            } else {
                WeightStateNames {
                    gradient: gradient.clone(),
                    weight_out: weight_name.clone(),
                    ..Default::default()
                }
            };
            state.gradient = gradient;
            state.accumulation_buffer = accumulation_buffer.clone();

            if let Some(owner) = owner {
                // Every rank leaves this step holding the full updated weight.
                let gathered = distributed::broadcast(m, &state.weight_out, owner)?;
                m.mark_output(&gathered)?;
                state.weight_out = gathered;
            }

            if let Some(buffer) = &accumulation_buffer {
                if updates_here {
                    self.insert_zero_gradient(m, buffer, &state.weight_out)?;
                }
            }

            weight_state.insert(weight_name.clone(), state);
        }

        m.graph().verify_acyclic()?;
        Ok(OptimizerBuildResult {
            kind,
            learning_rate_input: lr_name,
            do_update_input: do_update.map(|(name, _)| name),
            weight_state,
            partition,
        })
    }

    /// Running gradient buffer plus the node adding this step's gradient into
    /// it. The buffer is updated in place (alias 0 -> 0).
    fn insert_accumulator(
        &self,
        m: &mut GraphMutator,
        weight_id: TensorId,
        gradient: &str,
    ) -> Result<(String, String), OptimizerBuilderError> {
        let info = m
            .graph()
            .get_tensor(weight_id)
            .cloned()
            .expect("weight tensor");
        let shape = info.shape.clone().unwrap_or_default();
        let buffer = m.name_gen().unique(&format!("{gradient}_accumulation_buffer"));
        let buffer_id = m.add_initializer(&buffer, TensorValue::zeros(DType::F32, &shape))?;
        let grad_id = m
            .tensor_id_by_name(gradient)
            .ok_or_else(|| OptimizerBuilderError::MissingGradient(gradient.to_string()))?;
        let accumulated = m.name_gen().unique(&format!("{gradient}_accumulated"));
        let accumulated_id = m.add_intermediate(&accumulated, Some(DType::F32), Some(shape))?;
        m.add_node(NodeDef {
            name: format!("{gradient}_GradientAccumulator"),
            op_type: "GradientAccumulator".to_string(),
            inputs: vec![buffer_id, grad_id],
            outputs: vec![accumulated_id],
            attributes: BTreeMap::new(),
            aliases: vec![(0, 0)],
        })?;
        Ok((buffer, accumulated))
    }

    /// Reset node for the accumulation buffer, sequenced after the update by
    /// taking the updated weight as its second input.
    fn insert_zero_gradient(
        &self,
        m: &mut GraphMutator,
        buffer: &str,
        weight_out: &str,
    ) -> Result<(), OptimizerBuilderError> {
        let buffer_id = m
            .tensor_id_by_name(buffer)
            .ok_or_else(|| OptimizerBuilderError::MissingGradient(buffer.to_string()))?;
        let weight_out_id = m
            .tensor_id_by_name(weight_out)
            .ok_or_else(|| OptimizerBuilderError::UnknownWeight(weight_out.to_string()))?;
        let zeroed = m.name_gen().unique(&format!("{buffer}_zeroed"));
        let zeroed_id = m.get_or_add_tensor(&zeroed)?;
        m.add_node(NodeDef {
            name: format!("{buffer}_ZeroGradient"),
            op_type: "ZeroGradient".to_string(),
            inputs: vec![buffer_id, weight_out_id],
            outputs: vec![zeroed_id],
            attributes: BTreeMap::new(),
            aliases: vec![(0, 0)],
        })?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_update_node(
        &self,
        m: &mut GraphMutator,
        weight_name: &str,
        weight_id: TensorId,
        gradient: &str,
        cfg: &OptimizerNodeConfig,
        lr_id: TensorId,
        do_update_id: Option<TensorId>,
    ) -> Result<WeightStateNames, OptimizerBuilderError> {
        let info = m
            .graph()
            .get_tensor(weight_id)
            .cloned()
            .expect("weight tensor");
        let dtype = info.dtype.unwrap_or(DType::F32);
        let shape = info.shape.clone().unwrap_or_default();
        let grad_id = m
            .tensor_id_by_name(gradient)
            .ok_or_else(|| OptimizerBuilderError::MissingGradient(gradient.to_string()))?;

        let mut state = WeightStateNames {
            gradient: gradient.to_string(),
            ..Default::default()
        };

        let weight_out = format!("{weight_name}_Out");
        let weight_out_id = m.add_intermediate(&weight_out, Some(dtype), Some(shape.clone()))?;
        m.mark_output(&weight_out)?;
        state.weight_out = weight_out;

        let mut inputs: Vec<TensorId>;
        let mut outputs: Vec<TensorId> = vec![weight_out_id];
        let mut aliases: Vec<(usize, usize)>;
        let mut attributes: BTreeMap<String, Attribute> = BTreeMap::new();

        match cfg.algorithm {
            OptimizerAlgorithm::Sgd => {
                inputs = vec![lr_id, weight_id, grad_id];
                aliases = vec![(1, 0)];
            }
            OptimizerAlgorithm::Adam | OptimizerAlgorithm::Lamb => {
                let moment_dtype = if cfg.mixed_precision_moments {
                    DType::F16
                } else {
                    DType::F32
                };
                let m1 = format!("{weight_name}_Moment_1");
                let m1_id = m.add_initializer(&m1, TensorValue::zeros(moment_dtype, &shape))?;
                let m1_out = format!("{weight_name}_Moment_1_Out");
                let m1_out_id =
                    m.add_intermediate(&m1_out, Some(moment_dtype), Some(shape.clone()))?;
                m.mark_output(&m1_out)?;
                let m2 = format!("{weight_name}_Moment_2");
                let m2_id = m.add_initializer(&m2, TensorValue::zeros(moment_dtype, &shape))?;
                let m2_out = format!("{weight_name}_Moment_2_Out");
                let m2_out_id =
                    m.add_intermediate(&m2_out, Some(moment_dtype), Some(shape.clone()))?;
                m.mark_output(&m2_out)?;

                attributes.insert("alpha".to_string(), Attribute::Float(cfg.alpha));
                attributes.insert("beta".to_string(), Attribute::Float(cfg.beta));
                attributes.insert("lambda".to_string(), Attribute::Float(cfg.lambda));
                attributes.insert("epsilon".to_string(), Attribute::Float(cfg.epsilon));

                if cfg.algorithm == OptimizerAlgorithm::Adam {
                    let count = format!("{weight_name}_Update_Count");
                    let count_id = m.add_initializer(&count, TensorValue::scalar_i64(1))?;
                    let count_out = format!("{weight_name}_Update_Count_Out");
                    let count_out_id =
                        m.add_intermediate(&count_out, Some(DType::I64), Some(vec![]))?;
                    m.mark_output(&count_out)?;
                    attributes.insert(
                        "do_bias_correction".to_string(),
                        Attribute::Int(cfg.do_bias_correction as i64),
                    );

                    inputs = vec![lr_id, count_id, weight_id, grad_id, m1_id, m2_id];
                    outputs.extend([m1_out_id, m2_out_id, count_out_id]);
                    // step, weight, moment 1, moment 2 update in place
                    aliases = vec![(1, 3), (2, 0), (4, 1), (5, 2)];
                    state.update_count = Some(count);
                    state.update_count_out = Some(count_out);
                } else {
                    attributes.insert(
                        "threshold".to_string(),
                        Attribute::Float(cfg.lamb_threshold),
                    );
                    inputs = vec![lr_id, weight_id, grad_id, m1_id, m2_id];
                    outputs.extend([m1_out_id, m2_out_id]);
                    aliases = vec![(1, 0), (3, 1), (4, 2)];
                }
                state.moment_1 = Some(m1);
                state.moment_1_out = Some(m1_out);
                state.moment_2 = Some(m2);
                state.moment_2_out = Some(m2_out);
            }
        }

        if cfg.mixed_precision_weight && cfg.algorithm != OptimizerAlgorithm::Sgd {
            let value = info
                .initializer_value()
                .ok_or_else(|| OptimizerBuilderError::MissingWeightValue(weight_name.to_string()))?
                .cast(DType::F16)?;
            let fp16 = format!("FP16_{weight_name}");
            let fp16_id = m.add_initializer(&fp16, value)?;
            let fp16_out = format!("FP16_{weight_name}_Out");
            let fp16_out_id = m.add_intermediate(&fp16_out, Some(DType::F16), Some(shape))?;
            m.mark_output(&fp16_out)?;
            let in_idx = inputs.len();
            let out_idx = outputs.len();
            inputs.push(fp16_id);
            outputs.push(fp16_out_id);
            aliases.push((in_idx, out_idx));
            state.fp16_weight = Some(fp16);
            state.fp16_weight_out = Some(fp16_out);
        }
        if let Some(id) = do_update_id {
            if cfg.algorithm != OptimizerAlgorithm::Sgd {
                inputs.push(id);
            }
        }

        m.add_node(NodeDef {
            name: format!("{}_{weight_name}", cfg.algorithm.op_type()),
            op_type: cfg.algorithm.op_type().to_string(),
            inputs,
            outputs,
            attributes,
            aliases,
        })?;
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TensorKind;

    fn graph_with_weight_and_grad() -> GraphMutator {
        let mut m = GraphMutator::new();
        m.add_initializer(
            "W",
            TensorValue::from_vec_shape(vec![1.0f32, 2.0, 3.0, 4.0], &[2, 2]).unwrap(),
        )
        .unwrap();
        m.add_intermediate("W_grad", Some(DType::F32), Some(vec![2, 2]))
            .unwrap();
        m
    }

    #[test]
    fn adam_node_creates_state_and_aliases() {
        let mut m = graph_with_weight_and_grad();
        let mut builder = OptimizerGraphBuilder::new(OptimizerGraphConfig::default());
        builder.add_weight("W", "W_grad", OptimizerNodeConfig::default());
        let result = builder.build(&mut m).unwrap();

        assert_eq!(result.kind, OptimizerBuilderKind::Default);
        let state = &result.weight_state["W"];
        assert_eq!(state.weight_out, "W_Out");
        assert_eq!(state.moment_1.as_deref(), Some("W_Moment_1"));
        assert_eq!(state.update_count_out.as_deref(), Some("W_Update_Count_Out"));

        let g = m.into_inner();
        let (_, node) = g
            .nodes()
            .find(|(_, n)| n.op_type == "AdamOptimizer")
            .unwrap();
        assert_eq!(node.aliases, vec![(1, 3), (2, 0), (4, 1), (5, 2)]);
        // Moments start at zero, step counter at one.
        let m1 = g.get_tensor(g.tensor_id_by_name("W_Moment_1").unwrap()).unwrap();
        assert!(matches!(m1.kind, TensorKind::Initializer(_)));
        let count_id = g.tensor_id_by_name("W_Update_Count").unwrap();
        let count = g.get_tensor(count_id).unwrap().initializer_value().unwrap();
        assert_eq!(count, &TensorValue::scalar_i64(1));
    }

    #[test]
    fn sgd_node_is_minimal() {
        let mut m = graph_with_weight_and_grad();
        let mut builder = OptimizerGraphBuilder::new(OptimizerGraphConfig::default());
        builder.add_weight("W", "W_grad", OptimizerNodeConfig::sgd());
        let result = builder.build(&mut m).unwrap();
        let state = &result.weight_state["W"];
        assert!(state.moment_1.is_none());
        assert!(state.update_count.is_none());

        let g = m.into_inner();
        let (_, node) = g.nodes().find(|(_, n)| n.op_type == "SGDOptimizer").unwrap();
        assert_eq!(node.inputs.len(), 3);
        assert_eq!(node.aliases, vec![(1, 0)]);
    }

    #[test]
    fn allreduce_inserts_collective_before_update() {
        let mut m = graph_with_weight_and_grad();
        let cfg = OptimizerGraphConfig {
            world_size: 4,
            ..Default::default()
        };
        let mut builder = OptimizerGraphBuilder::new(cfg);
        builder.add_weight("W", "W_grad", OptimizerNodeConfig::default());
        let result = builder.build(&mut m).unwrap();
        assert_eq!(result.kind, OptimizerBuilderKind::Allreduce);
        // The update consumes the averaged gradient, not the raw one.
        assert_ne!(result.weight_state["W"].gradient, "W_grad");

        let g = m.into_inner();
        assert!(g.nodes().any(|(_, n)| n.op_type == "AllReduceSum"));
    }

    #[test]
    fn zero_partitions_update_to_owner_rank() {
        for rank in 0..2 {
            let mut m = graph_with_weight_and_grad();
            let cfg = OptimizerGraphConfig {
                world_rank: rank,
                world_size: 2,
                partition_optimizer: true,
                ..Default::default()
            };
            let mut builder = OptimizerGraphBuilder::new(cfg);
            builder.add_weight("W", "W_grad", OptimizerNodeConfig::default());
            let result = builder.build(&mut m).unwrap();
            assert_eq!(result.kind, OptimizerBuilderKind::ZeRO);
            let owner = result.partition.as_ref().unwrap()["W"];
            assert_eq!(owner, 0);

            let g = m.into_inner();
            let has_update = g.nodes().any(|(_, n)| n.op_type == "AdamOptimizer");
            assert_eq!(has_update, rank == owner);
            assert!(g.nodes().any(|(_, n)| n.op_type == "ReduceScatter"));
            assert!(g.nodes().any(|(_, n)| n.op_type == "Broadcast"));
        }
    }

    #[test]
    fn accumulation_adds_buffer_and_reset() {
        let mut m = graph_with_weight_and_grad();
        let cfg = OptimizerGraphConfig {
            gradient_accumulation_steps: 4,
            ..Default::default()
        };
        let mut builder = OptimizerGraphBuilder::new(cfg);
        builder.add_weight("W", "W_grad", OptimizerNodeConfig::sgd());
        let result = builder.build(&mut m).unwrap();
        let state = &result.weight_state["W"];
        assert!(state.accumulation_buffer.is_some());

        let g = m.into_inner();
        assert!(g.nodes().any(|(_, n)| n.op_type == "GradientAccumulator"));
        assert!(g.nodes().any(|(_, n)| n.op_type == "ZeroGradient"));
    }

    #[test]
    fn mixed_precision_adds_shadow_and_gate() {
        let mut m = graph_with_weight_and_grad();
        let cfg = OptimizerGraphConfig {
            use_mixed_precision: true,
            ..Default::default()
        };
        let mut builder = OptimizerGraphBuilder::new(cfg);
        builder.add_weight(
            "W",
            "W_grad",
            OptimizerNodeConfig {
                mixed_precision_weight: true,
                ..Default::default()
            },
        );
        let result = builder.build(&mut m).unwrap();
        assert_eq!(result.do_update_input.as_deref(), Some("Update_Signal"));
        let state = &result.weight_state["W"];
        assert_eq!(state.fp16_weight.as_deref(), Some("FP16_W"));
        assert_eq!(state.fp16_weight_out.as_deref(), Some("FP16_W_Out"));

        let g = m.into_inner();
        let (_, node) = g
            .nodes()
            .find(|(_, n)| n.op_type == "AdamOptimizer")
            .unwrap();
        // fp16 shadow aliases in place at the end of the positional lists.
        assert!(node.aliases.contains(&(6, 4)));
        assert_eq!(node.inputs.len(), 8);
    }

    #[test]
    fn fp16_moments_are_created_in_half_precision() {
        let mut m = graph_with_weight_and_grad();
        let mut builder = OptimizerGraphBuilder::new(OptimizerGraphConfig::default());
        builder.add_weight(
            "W",
            "W_grad",
            OptimizerNodeConfig {
                mixed_precision_moments: true,
                ..Default::default()
            },
        );
        builder.build(&mut m).unwrap();

        let g = m.into_inner();
        let m1 = g.get_tensor(g.tensor_id_by_name("W_Moment_1").unwrap()).unwrap();
        assert_eq!(m1.initializer_value().unwrap().dtype(), DType::F16);
        let m2_out = g.get_tensor(g.tensor_id_by_name("W_Moment_2_Out").unwrap()).unwrap();
        assert_eq!(m2_out.dtype, Some(DType::F16));
    }
}
