//! Reverse-mode gradient graph construction.
//!
//! The builder walks the forward graph once, backwards, and appends gradient
//! nodes produced by per-operator formulas. It never executes anything; the
//! result is a larger graph whose extra outputs are the weight gradients.

pub mod context;
pub mod formulas;
pub mod registry;

pub use context::{ArgInfo, GradientContext, NodeSpec};
pub use registry::{gradient_formula, GradientFormula};

use crate::dtype::DType;
use crate::graph::{
    Attribute, GraphError, GraphMutator, NodeDef, NodeId, TensorId,
};
use crate::tensor::{TensorValue, TensorValueError};
use context::node_def_from_spec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum GradientBuilderError {
    #[error("No gradient formula registered for operator \"{0}\"")]
    UnsupportedOperator(String),
    #[error("Node \"{0}\" received no gradient for output {1}")]
    MissingOutputGradient(String, usize),
    #[error("Node \"{0}\": tensor \"{1}\" has no recorded shape")]
    MissingShape(String, String),
    #[error("Node \"{0}\": tensor \"{1}\" has no recorded dtype")]
    MissingDType(String, String),
    #[error("Node \"{0}\" is missing forward output \"{1}\" required by its gradient")]
    MissingForwardOutput(String, String),
    #[error("Node \"{0}\": no gradient is defined with respect to input \"{1}\"")]
    NonDifferentiableArgument(String, String),
    #[error("Loss tensor \"{0}\" must be a scalar")]
    NonScalarLoss(String),
    #[error("Unknown tensor \"{0}\"")]
    UnknownTensor(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    TensorValue(#[from] TensorValueError),
}

/// How the loss is scaled before backpropagation. Scaling keeps small
/// half-precision gradients away from underflow; the builder divides the
/// scale back out of the weight gradients unless told to defer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum LossScale {
    #[default]
    None,
    /// Fixed scale baked into the gradient seed constant.
    Static(f32),
    /// Scale fed at runtime through a scalar f32 graph input of this name.
    Dynamic(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GradientGraphConfig {
    pub loss_name: String,
    pub weight_names: BTreeSet<String>,
    /// Graph inputs whose gradients should also be materialized.
    pub input_names_requiring_grads: BTreeSet<String>,
    pub loss_scale: LossScale,
    /// Leave weight gradients scaled; the optimizer divides during the step.
    pub defer_unscale: bool,
    /// Mark every produced gradient as a graph output.
    pub gradients_as_graph_outputs: bool,
}

impl GradientGraphConfig {
    pub fn new(loss_name: &str, weight_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            loss_name: loss_name.to_string(),
            weight_names: weight_names.into_iter().collect(),
            input_names_requiring_grads: BTreeSet::new(),
            loss_scale: LossScale::None,
            defer_unscale: false,
            gradients_as_graph_outputs: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GradientBuildResult {
    /// Weight name to the tensor holding its (unscaled) gradient.
    pub weight_gradients: BTreeMap<String, String>,
    pub input_gradients: BTreeMap<String, String>,
    /// Name of the runtime loss-scale feed, when dynamic scaling is on.
    pub loss_scale_input: Option<String>,
}

pub struct GradientGraphBuilder {
    config: GradientGraphConfig,
}

impl GradientGraphBuilder {
    pub fn new(config: GradientGraphConfig) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        m: &mut GraphMutator,
    ) -> Result<GradientBuildResult, GradientBuilderError> {
        let cfg = &self.config;

        let loss_id = m
            .tensor_id_by_name(&cfg.loss_name)
            .ok_or_else(|| GradientBuilderError::UnknownTensor(cfg.loss_name.clone()))?;
        let mut weight_ids: BTreeMap<String, TensorId> = BTreeMap::new();
        for name in &cfg.weight_names {
            let id = m
                .tensor_id_by_name(name)
                .ok_or_else(|| GradientBuilderError::UnknownTensor(name.clone()))?;
            weight_ids.insert(name.clone(), id);
        }
        let mut extra_input_ids: BTreeMap<String, TensorId> = BTreeMap::new();
        for name in &cfg.input_names_requiring_grads {
            let id = m
                .tensor_id_by_name(name)
                .ok_or_else(|| GradientBuilderError::UnknownTensor(name.clone()))?;
            extra_input_ids.insert(name.clone(), id);
        }

        let topo = m.graph().topological_order()?;
        let nodes: HashMap<NodeId, NodeDef> = topo
            .iter()
            .map(|id| {
                (
                    *id,
                    m.graph()
                        .get_node(*id)
                        .cloned()
                        .expect("node from topological order"),
                )
            })
            .collect();

        // Forward sweep: tensors reachable from the differentiation sources,
        // and the nodes touched on the way.
        let sources: HashSet<TensorId> = weight_ids
            .values()
            .chain(extra_input_ids.values())
            .copied()
            .collect();
        let mut reach: HashSet<TensorId> = sources.clone();
        let mut fwd_nodes: HashSet<NodeId> = HashSet::new();
        for id in &topo {
            let node = &nodes[id];
            if node.inputs.iter().any(|t| reach.contains(t)) {
                fwd_nodes.insert(*id);
                reach.extend(node.outputs.iter().copied());
            }
        }

        // Backward sweep: nodes from which the loss is reachable.
        let mut loss_reach: HashSet<TensorId> = HashSet::from([loss_id]);
        let mut back_nodes: HashSet<NodeId> = HashSet::new();
        for id in topo.iter().rev() {
            let node = &nodes[id];
            if node.outputs.iter().any(|t| loss_reach.contains(t)) {
                back_nodes.insert(*id);
                loss_reach.extend(node.inputs.iter().copied());
            }
        }

        // Only nodes on a source-to-loss path get gradients.
        let pruned: HashSet<NodeId> = fwd_nodes.intersection(&back_nodes).copied().collect();
        log::debug!(
            "gradient build: {} of {} forward nodes require gradients",
            pruned.len(),
            nodes.len()
        );

        let producer_of = m.graph().producers();
        // Partial-gradient contributors expected per tensor: one per pruned
        // consumer occurrence. Two uses inside one node count twice.
        let mut expected: HashMap<TensorId, usize> = HashMap::new();
        for id in &pruned {
            for t in &nodes[id].inputs {
                *expected.entry(*t).or_insert(0) += 1;
            }
        }
        let needs_grad = |t: TensorId| -> bool {
            reach.contains(&t)
                && (sources.contains(&t)
                    || producer_of.get(&t).map(|n| pruned.contains(n)).unwrap_or(false))
        };

        let mut canonical: HashMap<TensorId, String> = HashMap::new();
        let mut partials: HashMap<TensorId, Vec<String>> = HashMap::new();
        let mut finalized: HashMap<TensorId, String> = HashMap::new();

        let loss_scale_input = self.seed_loss_gradient(m, loss_id, &mut canonical, &mut finalized)?;

        for node_id in topo.iter().rev().filter(|id| pruned.contains(id)) {
            let node = &nodes[node_id];

            let mut output_grads: Vec<Option<String>> = Vec::with_capacity(node.outputs.len());
            for out in &node.outputs {
                output_grads.push(finalize_gradient(
                    m,
                    &mut partials,
                    &mut finalized,
                    &mut canonical,
                    *out,
                )?);
            }
            if output_grads.iter().all(Option::is_none) {
                log::debug!("node {} receives no gradient, skipping", node.name);
                continue;
            }

            let formula = registry::gradient_formula(&node.op_type)
                .ok_or_else(|| GradientBuilderError::UnsupportedOperator(node.op_type.clone()))?;

            let inputs: Vec<context::ArgInfo> =
                node.inputs.iter().map(|t| arg_info(m, *t)).collect();
            let outputs: Vec<context::ArgInfo> =
                node.outputs.iter().map(|t| arg_info(m, *t)).collect();
            let input_needs_grad: Vec<bool> =
                node.inputs.iter().map(|t| needs_grad(*t)).collect();
            let mut input_grad_targets: Vec<Option<String>> = Vec::with_capacity(node.inputs.len());
            for (idx, t) in node.inputs.iter().enumerate() {
                if input_needs_grad[idx] {
                    input_grad_targets.push(Some(partial_grad_name(
                        m,
                        &mut canonical,
                        *t,
                        expected.get(t).copied().unwrap_or(0),
                    )));
                } else {
                    input_grad_targets.push(None);
                }
            }

            let n_inputs = node.inputs.len();
            let mut ctx = GradientContext {
                node_name: node.name.clone(),
                op_type: node.op_type.clone(),
                attributes: node.attributes.clone(),
                inputs,
                outputs,
                output_grads,
                input_needs_grad,
                input_grad_targets,
                name_gen: m.name_gen(),
                emitted: Vec::new(),
                constants: Vec::new(),
                produced_input_grads: vec![None; n_inputs],
            };
            (formula.get_gradient_defs)(&mut ctx)?;
            let GradientContext {
                mut emitted,
                constants,
                produced_input_grads,
                ..
            } = ctx;

            if formula.copy_attributes {
                for spec in &mut emitted {
                    for (k, v) in &node.attributes {
                        spec.attributes.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }

            for (name, value) in constants {
                m.add_initializer(&name, value)?;
            }
            for spec in &emitted {
                let in_ids = spec
                    .inputs
                    .iter()
                    .map(|n| m.get_or_add_tensor(n))
                    .collect::<Result<Vec<_>, _>>()?;
                let out_ids = spec
                    .outputs
                    .iter()
                    .map(|n| m.get_or_add_tensor(n))
                    .collect::<Result<Vec<_>, _>>()?;
                m.add_node(node_def_from_spec(spec, in_ids, out_ids))?;
            }

            for (idx, produced) in produced_input_grads.iter().enumerate() {
                let Some(grad) = produced else { continue };
                let forward = node.inputs[idx];
                refine_like(m, grad, forward)?;
                partials.entry(forward).or_default().push(grad.clone());
            }
        }

        let mut weight_gradients = BTreeMap::new();
        for (name, id) in &weight_ids {
            match finalize_gradient(m, &mut partials, &mut finalized, &mut canonical, *id)? {
                Some(g) => {
                    weight_gradients.insert(name.clone(), g);
                }
                None => log::warn!("weight \"{name}\" does not affect the loss, skipping"),
            }
        }
        let mut input_gradients = BTreeMap::new();
        for (name, id) in &extra_input_ids {
            match finalize_gradient(m, &mut partials, &mut finalized, &mut canonical, *id)? {
                Some(g) => {
                    input_gradients.insert(name.clone(), g);
                }
                None => log::warn!("input \"{name}\" does not affect the loss, skipping"),
            }
        }

        if !cfg.defer_unscale {
            for grad in weight_gradients.values_mut().chain(input_gradients.values_mut()) {
                if let Some(unscaled) = unscale_gradient(m, grad, &cfg.loss_scale)? {
                    *grad = unscaled;
                }
            }
        }

        if cfg.gradients_as_graph_outputs {
            for grad in weight_gradients.values().chain(input_gradients.values()) {
                m.mark_output(grad)?;
            }
        }

        m.graph().verify_acyclic()?;
        Ok(GradientBuildResult {
            weight_gradients,
            input_gradients,
            loss_scale_input,
        })
    }

    /// Install the backpropagation seed `d loss / d loss`. Static scales
    /// become a constant initializer; a dynamic scale becomes a scalar graph
    /// input routed through a copy (or cast, for reduced-precision losses).
    fn seed_loss_gradient(
        &self,
        m: &mut GraphMutator,
        loss_id: TensorId,
        canonical: &mut HashMap<TensorId, String>,
        finalized: &mut HashMap<TensorId, String>,
    ) -> Result<Option<String>, GradientBuilderError> {
        let loss_info = m
            .graph()
            .get_tensor(loss_id)
            .cloned()
            .ok_or_else(|| GradientBuilderError::UnknownTensor(self.config.loss_name.clone()))?;
        let loss_dtype = loss_info.dtype.unwrap_or(DType::F32);
        let loss_shape = loss_info.shape.clone().unwrap_or_default();
        if !loss_shape.is_empty() {
            return Err(GradientBuilderError::NonScalarLoss(loss_info.name.clone()));
        }

        let seed_name = canonical_grad_name(m, canonical, loss_id);
        let result = match &self.config.loss_scale {
            LossScale::None => {
                m.add_initializer(&seed_name, TensorValue::filled(loss_dtype, &[], 1.0)?)?;
                None
            }
            LossScale::Static(scale) => {
                m.add_initializer(&seed_name, TensorValue::filled(loss_dtype, &[], *scale)?)?;
                None
            }
            LossScale::Dynamic(feed) => {
                let feed_id = m.add_input(feed, DType::F32, vec![])?;
                let seed_id = m.add_intermediate(&seed_name, Some(loss_dtype), Some(vec![]))?;
                let (op_type, attributes) = if loss_dtype == DType::F32 {
                    ("Identity", BTreeMap::new())
                } else {
                    let mut attrs = BTreeMap::new();
                    attrs.insert(
                        "to".to_string(),
                        Attribute::String(loss_dtype.to_string()),
                    );
                    ("Cast", attrs)
                };
                m.add_node(NodeDef {
                    name: format!("{seed_name}_seed"),
                    op_type: op_type.to_string(),
                    inputs: vec![feed_id],
                    outputs: vec![seed_id],
                    attributes,
                    aliases: vec![],
                })?;
                Some(feed.clone())
            }
        };
        finalized.insert(loss_id, seed_name);
        Ok(result)
    }
}

fn arg_info(m: &GraphMutator, id: TensorId) -> context::ArgInfo {
    let t = m.graph().get_tensor(id).expect("tensor referenced by node");
    context::ArgInfo {
        id,
        name: t.name.clone(),
        dtype: t.dtype,
        shape: t.shape.clone(),
    }
}

fn canonical_grad_name(
    m: &mut GraphMutator,
    cache: &mut HashMap<TensorId, String>,
    id: TensorId,
) -> String {
    if let Some(name) = cache.get(&id) {
        return name.clone();
    }
    let tensor = m
        .graph()
        .tensor_name(id)
        .unwrap_or_default()
        .to_string();
    let grad = m.name_gen().grad_name(&tensor);
    cache.insert(id, grad.clone());
    grad
}

/// Name a single gradient contribution. Sole contributors write straight to
/// the canonical `<tensor>_grad`; fan-out consumers each get a `_part` name
/// that the accumulation step later sums into the canonical one.
fn partial_grad_name(
    m: &mut GraphMutator,
    cache: &mut HashMap<TensorId, String>,
    id: TensorId,
    expected_contributors: usize,
) -> String {
    let canonical = canonical_grad_name(m, cache, id);
    if expected_contributors <= 1 {
        canonical
    } else {
        m.name_gen().unique(&format!("{canonical}_part"))
    }
}

/// Resolve the final gradient of a tensor once every contributor has run.
/// Two partials become an Add, more become a Sum, and a lone `_part` partial
/// (others vanished as non-differentiable) is forwarded through an Identity.
/// Accumulation order is the contribution order of the backward walk.
fn finalize_gradient(
    m: &mut GraphMutator,
    partials: &mut HashMap<TensorId, Vec<String>>,
    finalized: &mut HashMap<TensorId, String>,
    cache: &mut HashMap<TensorId, String>,
    id: TensorId,
) -> Result<Option<String>, GradientBuilderError> {
    if let Some(g) = finalized.get(&id) {
        return Ok(Some(g.clone()));
    }
    let Some(parts) = partials.remove(&id) else {
        return Ok(None);
    };
    let target = canonical_grad_name(m, cache, id);
    let result = if parts.len() == 1 && parts[0] == target {
        target
    } else {
        let op_type = match parts.len() {
            1 => "Identity",
            2 => "Add",
            _ => "Sum",
        };
        let in_ids = parts
            .iter()
            .map(|p| m.get_or_add_tensor(p))
            .collect::<Result<Vec<_>, _>>()?;
        let out_id = m.get_or_add_tensor(&target)?;
        m.add_node(NodeDef {
            name: format!("{target}_sum"),
            op_type: op_type.to_string(),
            inputs: in_ids,
            outputs: vec![out_id],
            attributes: BTreeMap::new(),
            aliases: vec![],
        })?;
        target
    };
    refine_like(m, &result, id)?;
    finalized.insert(id, result.clone());
    Ok(Some(result))
}

/// Give a gradient tensor the dtype/shape recorded on its forward tensor.
fn refine_like(
    m: &mut GraphMutator,
    grad: &str,
    forward: TensorId,
) -> Result<(), GradientBuilderError> {
    let info = m
        .graph()
        .get_tensor(forward)
        .cloned()
        .ok_or_else(|| GradientBuilderError::UnknownTensor(format!("#{forward}")))?;
    let gid = m.get_or_add_tensor(grad)?;
    m.refine_tensor(gid, info.dtype, info.shape)?;
    Ok(())
}

/// Divide the loss scale back out of a finished gradient. Returns the new
/// tensor name, or None when no scaling was applied.
fn unscale_gradient(
    m: &mut GraphMutator,
    grad: &str,
    loss_scale: &LossScale,
) -> Result<Option<String>, GradientBuilderError> {
    let (op_type, input_names, attributes) = match loss_scale {
        LossScale::None => return Ok(None),
        LossScale::Static(s) if *s == 1.0 => return Ok(None),
        LossScale::Static(s) => {
            let mut attrs = BTreeMap::new();
            attrs.insert("scale".to_string(), Attribute::Float(1.0 / s));
            ("Scale", vec![grad.to_string()], attrs)
        }
        LossScale::Dynamic(feed) => (
            "Div",
            vec![grad.to_string(), feed.clone()],
            BTreeMap::new(),
        ),
    };
    let out = m.name_gen().unique(&format!("{grad}_unscaled"));
    let in_ids = input_names
        .iter()
        .map(|n| m.get_or_add_tensor(n))
        .collect::<Result<Vec<_>, _>>()?;
    let out_id = m.get_or_add_tensor(&out)?;
    m.add_node(NodeDef {
        name: format!("{grad}_unscale"),
        op_type: op_type.to_string(),
        inputs: in_ids,
        outputs: vec![out_id],
        attributes,
        aliases: vec![],
    })?;
    let grad_id = m
        .tensor_id_by_name(grad)
        .ok_or_else(|| GradientBuilderError::UnknownTensor(grad.to_string()))?;
    refine_like(m, &out, grad_id)?;
    Ok(Some(out))
}
