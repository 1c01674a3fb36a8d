//! Loss function attachment. Training needs a scalar loss at the end of the
//! forward graph; these helpers append one and register the label feed the
//! runtime must supply each step.

use crate::dtype::DType;
use crate::graph::{Attribute, GraphError, GraphMutator, NodeDef, TensorId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum LossAttachError {
    #[error("Unknown tensor \"{0}\"")]
    UnknownTensor(String),
    #[error("Tensor \"{0}\" has no recorded shape, cannot derive the label shape")]
    MissingShape(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reduction {
    Mean,
    Sum,
}

impl Reduction {
    fn as_attr(&self) -> Attribute {
        Attribute::String(
            match self {
                Reduction::Mean => "mean",
                Reduction::Sum => "sum",
            }
            .to_string(),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LossFunction {
    /// mean((prediction - target)^2), decomposed into primitive ops.
    MeanSquaredError { prediction: String, target: String },
    /// Dense cross entropy over one-hot (or soft) labels shaped like scores.
    SoftmaxCrossEntropy {
        scores: String,
        labels: String,
        reduction: Reduction,
    },
    /// Cross entropy over integer class labels, optionally class-weighted.
    SparseSoftmaxCrossEntropy {
        scores: String,
        labels: String,
        weight: Option<String>,
        reduction: Reduction,
    },
}

#[derive(Clone, Debug)]
pub struct AttachedLoss {
    pub loss_name: String,
    /// Graph inputs added for the labels (and weights), in feed order.
    pub added_inputs: Vec<String>,
}

/// Append the loss computation to the forward graph and mark it as a graph
/// output. The label tensor is created as a graph input when it does not
/// already exist, with dtype and shape derived from the prediction.
pub fn attach_loss(
    m: &mut GraphMutator,
    loss: &LossFunction,
    loss_name: &str,
) -> Result<AttachedLoss, LossAttachError> {
    match loss {
        LossFunction::MeanSquaredError { prediction, target } => {
            let (pred_id, dtype, shape) = resolve(m, prediction)?;
            let mut added_inputs = Vec::new();
            let target_id = match m.tensor_id_by_name(target) {
                Some(id) => id,
                None => {
                    added_inputs.push(target.clone());
                    m.add_input(target, dtype, shape.clone())?
                }
            };

            let diff = m.name_gen().unique(&format!("{loss_name}/diff"));
            let diff_id = m.add_intermediate(&diff, Some(dtype), Some(shape.clone()))?;
            add_node(m, loss_name, "Sub", vec![pred_id, target_id], vec![diff_id], BTreeMap::new())?;

            let sq = m.name_gen().unique(&format!("{loss_name}/sq"));
            let sq_id = m.add_intermediate(&sq, Some(dtype), Some(shape))?;
            add_node(m, loss_name, "Mul", vec![diff_id, diff_id], vec![sq_id], BTreeMap::new())?;

            let loss_id = m.add_intermediate(loss_name, Some(dtype), Some(vec![]))?;
            let mut attrs = BTreeMap::new();
            attrs.insert("keepdims".to_string(), Attribute::Int(0));
            add_node(m, loss_name, "ReduceMean", vec![sq_id], vec![loss_id], attrs)?;

            m.mark_output(loss_name)?;
            Ok(AttachedLoss {
                loss_name: loss_name.to_string(),
                added_inputs,
            })
        }
        LossFunction::SoftmaxCrossEntropy {
            scores,
            labels,
            reduction,
        } => {
            let (scores_id, dtype, shape) = resolve(m, scores)?;
            let mut added_inputs = Vec::new();
            let labels_id = match m.tensor_id_by_name(labels) {
                Some(id) => id,
                None => {
                    added_inputs.push(labels.clone());
                    m.add_input(labels, dtype, shape.clone())?
                }
            };

            let log_prob = m.name_gen().unique(&format!("{loss_name}/log_prob"));
            let log_prob_id = m.add_intermediate(&log_prob, Some(dtype), Some(shape))?;
            let loss_id = m.add_intermediate(loss_name, Some(dtype), Some(vec![]))?;
            let mut attrs = BTreeMap::new();
            attrs.insert("reduction".to_string(), reduction.as_attr());
            add_node(
                m,
                loss_name,
                "SoftmaxCrossEntropy",
                vec![scores_id, labels_id],
                vec![loss_id, log_prob_id],
                attrs,
            )?;

            m.mark_output(loss_name)?;
            Ok(AttachedLoss {
                loss_name: loss_name.to_string(),
                added_inputs,
            })
        }
        LossFunction::SparseSoftmaxCrossEntropy {
            scores,
            labels,
            weight,
            reduction,
        } => {
            let (scores_id, dtype, shape) = resolve(m, scores)?;
            // Integer labels drop the class axis.
            let label_shape: Vec<usize> = shape[..shape.len().saturating_sub(1)].to_vec();
            let mut added_inputs = Vec::new();
            let labels_id = match m.tensor_id_by_name(labels) {
                Some(id) => id,
                None => {
                    added_inputs.push(labels.clone());
                    m.add_input(labels, DType::I64, label_shape.clone())?
                }
            };
            let mut inputs = vec![scores_id, labels_id];
            if let Some(weight) = weight {
                let id = match m.tensor_id_by_name(weight) {
                    Some(id) => id,
                    None => {
                        added_inputs.push(weight.clone());
                        m.add_input(weight, dtype, label_shape)?
                    }
                };
                inputs.push(id);
            }

            let prob = m.name_gen().unique(&format!("{loss_name}/prob"));
            let prob_id = m.add_intermediate(&prob, Some(dtype), Some(shape))?;
            let loss_id = m.add_intermediate(loss_name, Some(dtype), Some(vec![]))?;
            let mut attrs = BTreeMap::new();
            attrs.insert("reduction".to_string(), reduction.as_attr());
            add_node(
                m,
                loss_name,
                "SparseSoftmaxCrossEntropy",
                inputs,
                vec![loss_id, prob_id],
                attrs,
            )?;

            m.mark_output(loss_name)?;
            Ok(AttachedLoss {
                loss_name: loss_name.to_string(),
                added_inputs,
            })
        }
    }
}

fn resolve(
    m: &GraphMutator,
    name: &str,
) -> Result<(TensorId, DType, Vec<usize>), LossAttachError> {
    let id = m
        .tensor_id_by_name(name)
        .ok_or_else(|| LossAttachError::UnknownTensor(name.to_string()))?;
    let info = m.graph().get_tensor(id).expect("tensor by id");
    let dtype = info.dtype.unwrap_or(DType::F32);
    let shape = info
        .shape
        .clone()
        .ok_or_else(|| LossAttachError::MissingShape(name.to_string()))?;
    Ok((id, dtype, shape))
}

fn add_node(
    m: &mut GraphMutator,
    loss_name: &str,
    op_type: &str,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    attributes: BTreeMap<String, Attribute>,
) -> Result<(), LossAttachError> {
    m.add_node(NodeDef {
        name: format!("{loss_name}/{op_type}"),
        op_type: op_type.to_string(),
        inputs,
        outputs,
        attributes,
        aliases: vec![],
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TensorKind;

    #[test]
    fn mse_adds_target_input_and_scalar_loss() {
        let mut m = GraphMutator::new();
        m.add_input("pred", DType::F32, vec![4, 2]).unwrap();
        let attached = attach_loss(
            &mut m,
            &LossFunction::MeanSquaredError {
                prediction: "pred".to_string(),
                target: "target".to_string(),
            },
            "loss",
        )
        .unwrap();
        assert_eq!(attached.added_inputs, vec!["target".to_string()]);
        let g = m.into_inner();
        let loss_id = g.tensor_id_by_name("loss").unwrap();
        let info = g.get_tensor(loss_id).unwrap();
        assert_eq!(info.shape.as_deref(), Some(&[][..]));
        assert!(matches!(info.kind, TensorKind::Output));
    }

    #[test]
    fn sparse_cross_entropy_labels_drop_class_axis() {
        let mut m = GraphMutator::new();
        m.add_input("scores", DType::F32, vec![8, 10]).unwrap();
        attach_loss(
            &mut m,
            &LossFunction::SparseSoftmaxCrossEntropy {
                scores: "scores".to_string(),
                labels: "labels".to_string(),
                weight: None,
                reduction: Reduction::Mean,
            },
            "loss",
        )
        .unwrap();
        let g = m.into_inner();
        let labels = g.get_tensor(g.tensor_id_by_name("labels").unwrap()).unwrap();
        assert_eq!(labels.dtype, Some(DType::I64));
        assert_eq!(labels.shape.as_deref(), Some(&[8][..]));
    }
}
