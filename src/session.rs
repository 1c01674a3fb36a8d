//! Training-session glue: a `TrainingSession` carries a forward graph through
//! loss attachment, gradient construction and optimizer construction, keeping
//! a snapshot at each stage so any of the save options can be produced later.

use crate::gradients::{
    GradientBuildResult, GradientBuilderError, GradientGraphBuilder, GradientGraphConfig,
};
use crate::graph::{Graph, GraphError, GraphMutator, TensorKind};
use crate::loss::{AttachedLoss, LossAttachError, LossFunction};
use crate::loss_scaler::LossScaler;
use crate::optimizer::{
    OptimizerBuildResult, OptimizerBuilderError, OptimizerGraphBuilder, OptimizerGraphConfig,
    OptimizerNodeConfig,
};
use crate::tensor::TensorValue;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use strum_macros::{Display, EnumString};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("A loss function must be attached first")]
    LossNotAttached,
    #[error("The gradient graph must be built first")]
    GradientsNotBuilt,
    #[error("{0} was already built for this session")]
    AlreadyBuilt(&'static str),
    #[error("weights_to_train and weights_not_to_train are mutually exclusive")]
    ConflictingWeightSelection,
    #[error("Save option {0} requires a stage this session has not reached")]
    StageNotReached(SaveOption),
    #[error(transparent)]
    Loss(#[from] LossAttachError),
    #[error(transparent)]
    Gradient(#[from] GradientBuilderError),
    #[error(transparent)]
    Optimizer(#[from] OptimizerBuilderError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which stage of the session to persist. Updated weights means the
/// snapshot's initializers are refreshed from the current graph before
/// serialization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
pub enum SaveOption {
    NoReload,
    WithUpdatedWeights,
    WithUpdatedWeightsAndLossFunc,
    WithUpdatedWeightsAndLossFuncAndGradients,
}

pub struct TrainingSession {
    original: Graph,
    mutator: GraphMutator,
    loss: Option<AttachedLoss>,
    loss_snapshot: Option<Graph>,
    gradient_snapshot: Option<Graph>,
    gradients: Option<GradientBuildResult>,
    optimizer: Option<OptimizerBuildResult>,
}

impl TrainingSession {
    pub fn new(graph: Graph) -> Self {
        Self {
            original: graph.clone(),
            mutator: GraphMutator::from_graph(graph),
            loss: None,
            loss_snapshot: None,
            gradient_snapshot: None,
            gradients: None,
            optimizer: None,
        }
    }

    pub fn graph(&self) -> &Graph {
        self.mutator.graph()
    }

    pub fn attached_loss(&self) -> Option<&AttachedLoss> {
        self.loss.as_ref()
    }

    pub fn gradient_result(&self) -> Option<&GradientBuildResult> {
        self.gradients.as_ref()
    }

    pub fn optimizer_result(&self) -> Option<&OptimizerBuildResult> {
        self.optimizer.as_ref()
    }

    /// Float initializers to train. Passing names in `weights_to_train`
    /// selects exactly those; otherwise every float initializer minus
    /// `weights_not_to_train`. The two selectors are mutually exclusive.
    pub fn trainable_weights(
        &self,
        weights_to_train: &BTreeSet<String>,
        weights_not_to_train: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, SessionError> {
        if !weights_to_train.is_empty() && !weights_not_to_train.is_empty() {
            return Err(SessionError::ConflictingWeightSelection);
        }
        if !weights_to_train.is_empty() {
            return Ok(weights_to_train.clone());
        }
        Ok(self
            .graph()
            .trainable_initializer_names(weights_not_to_train))
    }

    pub fn attach_loss_function(
        &mut self,
        loss: &LossFunction,
        loss_name: &str,
    ) -> Result<&AttachedLoss, SessionError> {
        if self.loss.is_some() {
            return Err(SessionError::AlreadyBuilt("the loss function"));
        }
        let attached = crate::loss::attach_loss(&mut self.mutator, loss, loss_name)?;
        log::info!("attached loss {} ({} added inputs)", attached.loss_name, attached.added_inputs.len());
        self.loss_snapshot = Some(self.mutator.graph().clone());
        self.loss = Some(attached);
        Ok(self.loss.as_ref().expect("just set"))
    }

    pub fn build_gradient_graph(
        &mut self,
        config: GradientGraphConfig,
    ) -> Result<&GradientBuildResult, SessionError> {
        if self.loss.is_none() {
            return Err(SessionError::LossNotAttached);
        }
        if self.gradients.is_some() {
            return Err(SessionError::AlreadyBuilt("the gradient graph"));
        }
        let result = GradientGraphBuilder::new(config).build(&mut self.mutator)?;
        log::info!(
            "gradient graph built for {} weights",
            result.weight_gradients.len()
        );
        self.gradient_snapshot = Some(self.mutator.graph().clone());
        self.gradients = Some(result);
        Ok(self.gradients.as_ref().expect("just set"))
    }

    /// Build the optimizer subgraph, applying `node_config` to every weight
    /// the gradient pass produced a gradient for.
    pub fn build_optimizer(
        &mut self,
        config: OptimizerGraphConfig,
        node_config: OptimizerNodeConfig,
    ) -> Result<&OptimizerBuildResult, SessionError> {
        if self.optimizer.is_some() {
            return Err(SessionError::AlreadyBuilt("the optimizer graph"));
        }
        let gradients = self
            .gradients
            .as_ref()
            .ok_or(SessionError::GradientsNotBuilt)?;
        let mut builder = OptimizerGraphBuilder::new(config);
        for (weight, gradient) in &gradients.weight_gradients {
            builder.add_weight(weight, gradient, node_config.clone());
        }
        let result = builder.build(&mut self.mutator)?;
        log::info!(
            "optimizer graph built ({} kind, {} weights)",
            result.kind,
            result.weight_state.len()
        );
        self.optimizer = Some(result);
        Ok(self.optimizer.as_ref().expect("just set"))
    }

    /// Replace a weight initializer's value, e.g. after a host-driven update
    /// step. Dtype and shape must match the existing initializer.
    pub fn set_weight_value(
        &mut self,
        name: &str,
        value: TensorValue,
    ) -> Result<(), SessionError> {
        self.mutator.set_initializer_value(name, value)?;
        Ok(())
    }

    /// Serialize the requested stage as JSON. Weight-updating options refresh
    /// the snapshot's initializers from the live graph first.
    pub fn save<W: std::io::Write>(
        &self,
        writer: W,
        option: SaveOption,
    ) -> Result<(), SessionError> {
        let graph = self.graph_for_save(option)?;
        graph.save_json(writer)?;
        Ok(())
    }

    pub fn save_to_path(&self, path: &Path, option: SaveOption) -> Result<(), SessionError> {
        let file = File::create(path)?;
        self.save(BufWriter::new(file), option)
    }

    fn graph_for_save(&self, option: SaveOption) -> Result<Graph, SessionError> {
        let snapshot = match option {
            SaveOption::NoReload => return Ok(self.original.clone()),
            SaveOption::WithUpdatedWeights => &self.original,
            SaveOption::WithUpdatedWeightsAndLossFunc => self
                .loss_snapshot
                .as_ref()
                .ok_or(SessionError::StageNotReached(option))?,
            SaveOption::WithUpdatedWeightsAndLossFuncAndGradients => self
                .gradient_snapshot
                .as_ref()
                .ok_or(SessionError::StageNotReached(option))?,
        };
        let mut m = GraphMutator::from_graph(snapshot.clone());
        for (_, info) in self.graph().tensors() {
            if let TensorKind::Initializer(value) = &info.kind {
                // Only initializers the snapshot also carries are refreshed;
                // optimizer state stays out of earlier stages.
                if m.tensor_id_by_name(&info.name).is_some() {
                    m.set_initializer_value(&info.name, value.clone())?;
                }
            }
        }
        Ok(m.into_inner())
    }
}

/// Host-side verdicts for one training step under (optional) dynamic loss
/// scaling.
#[derive(Clone, Copy, Debug)]
pub struct StepSignals {
    pub all_finite: bool,
    /// Feed for the optimizer's update gate.
    pub do_update: bool,
    /// Loss scale to feed on the next step.
    pub next_loss_scale: f32,
}

/// Per-step host contract: inspect the produced gradients, gate the update
/// on overflow and advance the loss scaler.
pub struct StepHost {
    scaler: LossScaler,
}

impl StepHost {
    pub fn new(scaler: LossScaler) -> Self {
        Self { scaler }
    }

    pub fn loss_scale(&self) -> f32 {
        self.scaler.loss_scale()
    }

    pub fn step(&mut self, gradients: &[&TensorValue]) -> StepSignals {
        let all_finite = !gradients.iter().any(|g| g.has_non_finite());
        if !all_finite {
            log::warn!("non-finite gradients, skipping this update");
        }
        let next_loss_scale = self.scaler.update(all_finite);
        StepSignals {
            all_finite,
            do_update: all_finite,
            next_loss_scale,
        }
    }
}

/// Running loss statistics, owned by the caller and passed through the step
/// loop rather than kept in any global.
#[derive(Clone, Debug, Default)]
pub struct MetricsAccumulator {
    total_loss: f64,
    steps: usize,
}

impl MetricsAccumulator {
    pub fn record(&mut self, loss: f32) {
        self.total_loss += f64::from(loss);
        self.steps += 1;
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn mean_loss(&self) -> Option<f32> {
        if self.steps == 0 {
            None
        } else {
            Some((self.total_loss / self.steps as f64) as f32)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn stage_ordering_is_enforced() {
        let mut session = TrainingSession::new(Graph::new());
        let err = session.build_gradient_graph(GradientGraphConfig::new("loss", std::iter::empty()));
        assert!(matches!(err, Err(SessionError::LossNotAttached)));
        let err = session.build_optimizer(
            OptimizerGraphConfig::default(),
            OptimizerNodeConfig::default(),
        );
        assert!(matches!(err, Err(SessionError::GradientsNotBuilt)));
    }

    #[test]
    fn weight_selectors_are_mutually_exclusive() {
        let mut m = GraphMutator::new();
        m.add_initializer("w", TensorValue::zeros(DType::F32, &[2]))
            .unwrap();
        let session = TrainingSession::new(m.into_inner());
        let take: BTreeSet<String> = ["w".to_string()].into();
        let skip: BTreeSet<String> = ["w".to_string()].into();
        assert!(matches!(
            session.trainable_weights(&take, &skip),
            Err(SessionError::ConflictingWeightSelection)
        ));
        assert_eq!(
            session.trainable_weights(&BTreeSet::new(), &BTreeSet::new()).unwrap(),
            take
        );
    }

    #[test]
    fn step_host_gates_on_overflow() {
        let mut host = StepHost::new(LossScaler::new(8.0));
        let bad = TensorValue::filled(DType::F32, &[2], f32::INFINITY).unwrap();
        let good = TensorValue::filled(DType::F32, &[2], 1.0).unwrap();
        let signals = host.step(&[&good, &bad]);
        assert!(!signals.do_update);
        assert_eq!(signals.next_loss_scale, 4.0);
        let signals = host.step(&[&good]);
        assert!(signals.do_update);
    }

    #[test]
    fn metrics_accumulate_a_running_mean() {
        let mut metrics = MetricsAccumulator::default();
        assert_eq!(metrics.mean_loss(), None);
        metrics.record(2.0);
        metrics.record(4.0);
        assert_eq!(metrics.steps(), 2);
        assert_eq!(metrics.mean_loss(), Some(3.0));
    }
}
