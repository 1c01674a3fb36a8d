use crate::dtype::DType;
use crate::graph::{Attribute, NameGenerator, NodeDef, TensorId};
use crate::gradients::GradientBuilderError;
use crate::tensor::TensorValue;
use std::collections::BTreeMap;

/// Snapshot of one forward argument (input or output edge) as recorded at
/// build time. Broadcast reductions in the backward pass are derived from
/// these recorded shapes, never re-inferred from broadcast rules.
#[derive(Clone, Debug)]
pub struct ArgInfo {
    pub id: TensorId,
    pub name: String,
    pub dtype: Option<DType>,
    pub shape: Option<Vec<usize>>,
}

/// A new node requested by a gradient formula. Tensors are referenced by
/// name; the builder materializes ids and refines gradient edge metadata.
#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, Attribute>,
}

/// Everything a gradient formula may read, plus collectors for what it emits.
/// Formulas are pure with respect to graph state: they see only this snapshot
/// and append node specs / constants to it.
pub struct GradientContext<'a> {
    pub(crate) node_name: String,
    pub(crate) op_type: String,
    pub(crate) attributes: BTreeMap<String, Attribute>,
    pub(crate) inputs: Vec<ArgInfo>,
    pub(crate) outputs: Vec<ArgInfo>,
    /// Finalized gradient name per forward output, if any gradient flows.
    pub(crate) output_grads: Vec<Option<String>>,
    /// Whether each forward input lies on a path from a trainable weight.
    pub(crate) input_needs_grad: Vec<bool>,
    /// Target name for each produced input gradient, assigned by the caller's
    /// name generator so multi-consumer partials never collide.
    pub(crate) input_grad_targets: Vec<Option<String>>,
    pub(crate) name_gen: &'a mut NameGenerator,

    pub(crate) emitted: Vec<NodeSpec>,
    pub(crate) constants: Vec<(String, TensorValue)>,
    pub(crate) produced_input_grads: Vec<Option<String>>,
}

impl<'a> GradientContext<'a> {
    pub fn op_type(&self) -> &str {
        &self.op_type
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn input(&self, idx: usize) -> &ArgInfo {
        &self.inputs[idx]
    }

    pub fn output(&self, idx: usize) -> &ArgInfo {
        &self.outputs[idx]
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    /// Gradient flowing into forward output `idx`, if any.
    pub fn output_grad(&self, idx: usize) -> Option<&str> {
        self.output_grads.get(idx).and_then(|x| x.as_deref())
    }

    /// Gradient of output `idx`, required. Formulas for single-output ops use
    /// this; the builder never invokes a formula with no output gradients.
    pub fn require_output_grad(&self, idx: usize) -> Result<String, GradientBuilderError> {
        self.output_grad(idx)
            .map(|x| x.to_string())
            .ok_or_else(|| GradientBuilderError::MissingOutputGradient(self.node_name.clone(), idx))
    }

    pub fn needs_input_grad(&self, idx: usize) -> bool {
        self.input_needs_grad.get(idx).copied().unwrap_or(false)
    }

    /// The caller-assigned name the gradient of input `idx` must be written to.
    pub fn input_grad_target(&self, idx: usize) -> Option<String> {
        self.input_grad_targets.get(idx).and_then(|x| x.clone())
    }

    /// Fresh intermediate name scoped under this node's gradient namespace,
    /// e.g. `dense1_Grad/0`.
    pub fn intermediate(&mut self) -> String {
        let base = format!("{}_Grad/t", self.node_name);
        self.name_gen.unique(&base)
    }

    pub fn emit(
        &mut self,
        op_type: &str,
        inputs: Vec<String>,
        outputs: Vec<String>,
        attributes: BTreeMap<String, Attribute>,
    ) {
        let name = self
            .name_gen
            .unique(&format!("{}_Grad/{}", self.node_name, op_type));
        self.emitted.push(NodeSpec {
            name,
            op_type: op_type.to_string(),
            inputs,
            outputs,
            attributes,
        });
    }

    /// Emit a node whose single output is a fresh intermediate; returns it.
    pub fn emit_simple(&mut self, op_type: &str, inputs: Vec<String>) -> String {
        let out = self.intermediate();
        self.emit(op_type, inputs, vec![out.clone()], BTreeMap::new());
        out
    }

    pub fn emit_with_attrs(
        &mut self,
        op_type: &str,
        inputs: Vec<String>,
        attributes: BTreeMap<String, Attribute>,
    ) -> String {
        let out = self.intermediate();
        self.emit(op_type, inputs, vec![out.clone()], attributes);
        out
    }

    /// Request a named constant initializer scoped to this gradient.
    pub fn constant(&mut self, value: TensorValue) -> String {
        let name = self.name_gen.unique(&format!("{}_Grad/const", self.node_name));
        self.constants.push((name.clone(), value));
        name
    }

    /// Record the final gradient for input `idx`, written to the caller's
    /// target name. `produced` must be the tensor the last emitted node wrote.
    pub fn set_input_grad(&mut self, idx: usize, produced: String) {
        self.produced_input_grads[idx] = Some(produced);
    }

    /// Copy `source` into the caller-assigned gradient target for input `idx`
    /// by rewriting the last emitted node's output, avoiding an Identity hop.
    /// Falls back to an Identity node when `source` is not locally produced.
    pub fn finish_input_grad(&mut self, idx: usize, source: String) {
        let Some(target) = self.input_grad_target(idx) else {
            return;
        };
        if let Some(spec) = self
            .emitted
            .iter_mut()
            .rev()
            .find(|spec| spec.outputs.iter().any(|o| *o == source))
        {
            for o in spec.outputs.iter_mut() {
                if *o == source {
                    *o = target.clone();
                }
            }
        } else {
            self.emit(
                "Identity",
                vec![source],
                vec![target.clone()],
                BTreeMap::new(),
            );
        }
        self.set_input_grad(idx, target);
    }

    /// Reduce `grad` (shaped like `from_shape`) back to `to_shape`, undoing a
    /// forward broadcast. Axis sets come from the recorded shapes: extra
    /// leading axes are summed away, and axes where the target length is 1 are
    /// summed with keepdims. Returns the (possibly unchanged) gradient name.
    pub fn reduce_broadcast(
        &mut self,
        grad: String,
        from_shape: &[usize],
        to_shape: &[usize],
    ) -> String {
        if from_shape == to_shape {
            return grad;
        }
        let rank_diff = from_shape.len().saturating_sub(to_shape.len());
        let mut leading: Vec<i64> = (0..rank_diff as i64).collect();
        let mut kept: Vec<i64> = Vec::new();
        for (i, dim) in to_shape.iter().enumerate() {
            if *dim == 1 && from_shape[rank_diff + i] != 1 {
                kept.push((rank_diff + i) as i64);
            }
        }

        let mut current = grad;
        if !leading.is_empty() || !kept.is_empty() {
            let mut axes = std::mem::take(&mut leading);
            axes.append(&mut kept);
            let mut attrs = BTreeMap::new();
            attrs.insert("axes".to_string(), Attribute::Ints(axes));
            attrs.insert("keepdims".to_string(), Attribute::Int(0));
            current = self.emit_with_attrs("ReduceSum", vec![current], attrs);
        }
        // Summed ranks no longer match the target; restore the exact shape.
        let mut attrs = BTreeMap::new();
        attrs.insert(
            "shape".to_string(),
            Attribute::Ints(to_shape.iter().map(|x| *x as i64).collect()),
        );
        self.emit_with_attrs("Reshape", vec![current], attrs)
    }

    /// Recorded shape of an argument; formulas that must derive reduction
    /// axes fail loudly when the forward pass never recorded one.
    pub fn require_shape(&self, arg: &ArgInfo) -> Result<Vec<usize>, GradientBuilderError> {
        arg.shape.clone().ok_or_else(|| {
            GradientBuilderError::MissingShape(self.node_name.clone(), arg.name.clone())
        })
    }
}

/// Convert an emitted spec plus resolved tensor ids into a concrete NodeDef.
pub(crate) fn node_def_from_spec(
    spec: &NodeSpec,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
) -> NodeDef {
    NodeDef {
        name: spec.name.clone(),
        op_type: spec.op_type.clone(),
        inputs,
        outputs,
        attributes: spec.attributes.clone(),
        aliases: vec![],
    }
}
