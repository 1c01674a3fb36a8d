//! Reference graph evaluator used by tests and the finite-difference
//! checker. It executes the operator subset the builders emit, computing in
//! f32 and narrowing results to each tensor's declared dtype so reduced
//! precision behaves the way a real executor would.
//!
//! This is a correctness oracle, not a runtime: no parallelism, no in-place
//! aliasing, every intermediate materialized.

use crate::dtype::DType;
use crate::graph::{Attribute, Graph, GraphError, NodeDef, NodeId, TensorId, TensorKind};
use crate::tensor::{TensorValue, TensorValueError};
use ndarray::{concatenate, Array2, ArrayD, Axis, Dimension, Ix2, IxDyn, Slice, Zip};
use std::collections::{HashMap, HashSet};

#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    #[error("Operator \"{0}\" is not supported by the reference evaluator")]
    UnsupportedOp(String),
    #[error("No value available for tensor \"{0}\"")]
    MissingValue(String),
    #[error("Node \"{0}\": missing attribute \"{1}\"")]
    MissingAttribute(String, String),
    #[error("Node \"{0}\": incompatible shapes {1:?} and {2:?}")]
    ShapeMismatch(String, Vec<usize>, Vec<usize>),
    #[error("Unknown fetch \"{0}\"")]
    UnknownFetch(String),
    #[error(transparent)]
    Tensor(#[from] TensorValueError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

pub struct Interpreter<'g> {
    graph: &'g Graph,
}

impl<'g> Interpreter<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self { graph }
    }

    /// Evaluate `fetches` given `feeds`, running only the nodes the fetches
    /// actually depend on.
    pub fn run(
        &self,
        feeds: &HashMap<String, TensorValue>,
        fetches: &[&str],
    ) -> Result<Vec<TensorValue>, InterpreterError> {
        let by_name = self.graph.tensors_by_name();
        let mut values: HashMap<TensorId, TensorValue> = HashMap::new();
        for (id, info) in self.graph.tensors() {
            if let TensorKind::Initializer(v) = &info.kind {
                values.insert(id, v.clone());
            }
        }
        for (name, value) in feeds {
            let id = by_name
                .get(name)
                .ok_or_else(|| InterpreterError::MissingValue(name.clone()))?;
            values.insert(*id, value.clone());
        }
        let fetch_ids: Vec<TensorId> = fetches
            .iter()
            .map(|name| {
                by_name
                    .get(*name)
                    .copied()
                    .ok_or_else(|| InterpreterError::UnknownFetch(name.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let topo = self.graph.topological_order()?;
        let mut needed_tensors: HashSet<TensorId> = fetch_ids
            .iter()
            .copied()
            .filter(|id| !values.contains_key(id))
            .collect();
        let mut needed_nodes: HashSet<NodeId> = HashSet::new();
        for node_id in topo.iter().rev() {
            let node = self.graph.get_node(*node_id).expect("node in topo order");
            if node.outputs.iter().any(|t| needed_tensors.contains(t)) {
                needed_nodes.insert(*node_id);
                for input in &node.inputs {
                    if !values.contains_key(input) {
                        needed_tensors.insert(*input);
                    }
                }
            }
        }

        for node_id in &topo {
            if !needed_nodes.contains(node_id) {
                continue;
            }
            let node = self.graph.get_node(*node_id).expect("node in topo order");
            let inputs: Vec<TensorValue> = node
                .inputs
                .iter()
                .map(|t| {
                    values.get(t).cloned().ok_or_else(|| {
                        InterpreterError::MissingValue(
                            self.graph.tensor_name(*t).unwrap_or_default().to_string(),
                        )
                    })
                })
                .collect::<Result<_, _>>()?;
            let outputs = self.eval_node(node, &inputs)?;
            for (tid, value) in node.outputs.iter().zip(outputs) {
                values.insert(*tid, self.narrow(*tid, value)?);
            }
        }

        fetch_ids
            .iter()
            .map(|id| {
                values.get(id).cloned().ok_or_else(|| {
                    InterpreterError::MissingValue(
                        self.graph.tensor_name(*id).unwrap_or_default().to_string(),
                    )
                })
            })
            .collect()
    }

    /// Narrow a freshly computed value to the tensor's declared float dtype.
    fn narrow(&self, id: TensorId, value: TensorValue) -> Result<TensorValue, InterpreterError> {
        let declared = self.graph.get_tensor(id).and_then(|t| t.dtype);
        match declared {
            Some(dtype) if dtype.is_float() && dtype != value.dtype() => Ok(value.cast(dtype)?),
            _ => Ok(value),
        }
    }

    fn eval_node(
        &self,
        node: &NodeDef,
        inputs: &[TensorValue],
    ) -> Result<Vec<TensorValue>, InterpreterError> {
        let f = |i: usize| -> Result<ArrayD<f32>, InterpreterError> {
            Ok(inputs[i].to_f32_array()?)
        };
        let attr_float =
            |name: &str, default: f32| node.attributes.get(name).and_then(Attribute::as_float).unwrap_or(default);
        let attr_int =
            |name: &str, default: i64| node.attributes.get(name).and_then(Attribute::as_int).unwrap_or(default);

        Ok(match node.op_type.as_str() {
            "Identity" => vec![inputs[0].clone()],
            "Neg" => one(f(0)?.mapv(|v| -v)),
            "Abs" => one(f(0)?.mapv(f32::abs)),
            "Sign" => one(f(0)?.mapv(|v| {
                if v > 0.0 {
                    1.0
                } else if v < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            })),
            "Sin" => one(f(0)?.mapv(f32::sin)),
            "Cos" => one(f(0)?.mapv(f32::cos)),
            "Exp" => one(f(0)?.mapv(f32::exp)),
            "Log" => one(f(0)?.mapv(f32::ln)),
            "Sqrt" => one(f(0)?.mapv(f32::sqrt)),
            "Tanh" => one(f(0)?.mapv(f32::tanh)),
            "Sigmoid" => one(f(0)?.mapv(|v| 1.0 / (1.0 + (-v).exp()))),
            "Relu" => one(f(0)?.mapv(|v| v.max(0.0))),
            "Erf" => one(f(0)?.mapv(erf)),
            "Gelu" => {
                one(f(0)?.mapv(|v| 0.5 * v * (1.0 + erf(v * std::f32::consts::FRAC_1_SQRT_2))))
            }
            "Scale" => {
                let scale = attr_float("scale", 1.0);
                one(f(0)?.mapv(|v| v * scale))
            }
            "Add" => one(binary(node, &f(0)?, &f(1)?, |a, b| a + b)?),
            "Sub" => one(binary(node, &f(0)?, &f(1)?, |a, b| a - b)?),
            "Mul" => one(binary(node, &f(0)?, &f(1)?, |a, b| a * b)?),
            "Div" => one(binary(node, &f(0)?, &f(1)?, |a, b| a / b)?),
            "Pow" => one(binary(node, &f(0)?, &f(1)?, f32::powf)?),
            "Sum" => {
                let mut acc = f(0)?;
                for i in 1..inputs.len() {
                    acc = binary(node, &acc, &f(i)?, |a, b| a + b)?;
                }
                one(acc)
            }
            "MatMul" => one(matmul(node, &f(0)?, &f(1)?)?),
            "Gemm" => {
                let trans_a = attr_int("transA", 0) != 0;
                let trans_b = attr_int("transB", 0) != 0;
                let alpha = attr_float("alpha", 1.0);
                let beta = attr_float("beta", 1.0);
                let a = as_2d(node, &f(0)?, trans_a)?;
                let b = as_2d(node, &f(1)?, trans_b)?;
                let mut y = a.dot(&b).into_dyn().mapv(|v| v * alpha);
                if inputs.len() > 2 {
                    let c = f(2)?.mapv(|v| v * beta);
                    y = binary(node, &y, &c, |a, b| a + b)?;
                }
                one(y)
            }
            "Reshape" => {
                let shape = require_ints(node, "shape")?;
                let shape: Vec<usize> = shape.iter().map(|x| *x as usize).collect();
                let x = f(0)?;
                let flat: Vec<f32> = x.iter().copied().collect();
                let out = ArrayD::from_shape_vec(IxDyn(&shape), flat).map_err(|_| {
                    InterpreterError::ShapeMismatch(node.name.clone(), x.shape().to_vec(), shape)
                })?;
                one(out)
            }
            "Transpose" => {
                let x = f(0)?;
                let perm: Vec<usize> = match node.attributes.get("perm").and_then(Attribute::as_ints) {
                    Some(p) => p.iter().map(|v| *v as usize).collect(),
                    None => (0..x.ndim()).rev().collect(),
                };
                one(x.view().permuted_axes(perm).to_owned())
            }
            "Expand" => {
                let shape = require_ints(node, "shape")?;
                let shape: Vec<usize> = shape.iter().map(|x| *x as usize).collect();
                let x = f(0)?;
                let view = x.broadcast(IxDyn(&shape)).ok_or_else(|| {
                    InterpreterError::ShapeMismatch(node.name.clone(), x.shape().to_vec(), shape.clone())
                })?;
                one(view.to_owned())
            }
            "ReduceSum" | "ReduceMean" => {
                let x = f(0)?;
                let rank = x.ndim();
                let mut axes: Vec<usize> = match node.attributes.get("axes").and_then(Attribute::as_ints) {
                    Some(a) => a
                        .iter()
                        .map(|v| if *v < 0 { (*v + rank as i64) as usize } else { *v as usize })
                        .collect(),
                    None => (0..rank).collect(),
                };
                axes.sort_unstable();
                let keepdims = attr_int("keepdims", 1) != 0;
                let count: usize = axes.iter().map(|a| x.shape()[*a]).product::<usize>().max(1);
                let mut out = x;
                for axis in axes.iter().rev() {
                    out = out.sum_axis(Axis(*axis));
                }
                if keepdims {
                    for axis in &axes {
                        out = out.insert_axis(Axis(*axis));
                    }
                }
                if node.op_type == "ReduceMean" {
                    out = out.mapv(|v| v / count as f32);
                }
                one(out)
            }
            "Concat" => {
                let axis = attr_int("axis", 0) as usize;
                let arrays: Vec<ArrayD<f32>> =
                    (0..inputs.len()).map(f).collect::<Result<_, _>>()?;
                let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
                let out = concatenate(Axis(axis), &views).map_err(|_| {
                    InterpreterError::ShapeMismatch(
                        node.name.clone(),
                        arrays[0].shape().to_vec(),
                        vec![],
                    )
                })?;
                one(out)
            }
            "Split" => {
                let axis = attr_int("axis", 0) as usize;
                let x = f(0)?;
                let sizes: Vec<usize> = match node.attributes.get("split").and_then(Attribute::as_ints) {
                    Some(s) => s.iter().map(|v| *v as usize).collect(),
                    None => {
                        let n = node.outputs.len();
                        vec![x.shape()[axis] / n; n]
                    }
                };
                let mut out = Vec::with_capacity(sizes.len());
                let mut start = 0isize;
                for size in sizes {
                    let end = start + size as isize;
                    let piece = x
                        .slice_axis(Axis(axis), Slice::from(start..end))
                        .to_owned();
                    out.push(TensorValue::F32(piece));
                    start = end;
                }
                out
            }
            "Cast" => {
                let to = node
                    .attributes
                    .get("to")
                    .and_then(Attribute::as_str)
                    .and_then(DType::from_name)
                    .ok_or_else(|| {
                        InterpreterError::MissingAttribute(node.name.clone(), "to".to_string())
                    })?;
                vec![inputs[0].cast(to)?]
            }
            "Softmax" => {
                let x = f(0)?;
                let axis = normalize_axis(attr_int("axis", -1), x.ndim());
                one(softmax(&x, axis))
            }
            "SoftmaxGrad" => {
                // dX = (dY - sum(dY * Y, axis)) * Y
                let dy = f(0)?;
                let y = f(1)?;
                let axis = normalize_axis(attr_int("axis", -1), y.ndim());
                let inner = (&dy * &y).sum_axis(Axis(axis)).insert_axis(Axis(axis));
                one((dy - inner) * &y)
            }
            "ReluGrad" => {
                let dy = f(0)?;
                let y = f(1)?;
                one(Zip::from(&dy)
                    .and(&y)
                    .map_collect(|d, v| if *v > 0.0 { *d } else { 0.0 }))
            }
            "SigmoidGrad" => {
                let dy = f(0)?;
                let y = f(1)?;
                one(Zip::from(&dy).and(&y).map_collect(|d, v| d * v * (1.0 - v)))
            }
            "TanhGrad" => {
                let dy = f(0)?;
                let y = f(1)?;
                one(Zip::from(&dy).and(&y).map_collect(|d, v| d * (1.0 - v * v)))
            }
            "SqrtGrad" => {
                let dy = f(0)?;
                let y = f(1)?;
                one(Zip::from(&dy).and(&y).map_collect(|d, v| d / (2.0 * v)))
            }
            "ErfGrad" => {
                let dy = f(0)?;
                let x = f(1)?;
                one(Zip::from(&dy)
                    .and(&x)
                    .map_collect(|d, v| d * std::f32::consts::FRAC_2_SQRT_PI * (-v * v).exp()))
            }
            "GeluGrad" => {
                let dy = f(0)?;
                let x = f(1)?;
                one(Zip::from(&dy).and(&x).map_collect(|d, v| {
                    let cdf = 0.5 * (1.0 + erf(v * std::f32::consts::FRAC_1_SQRT_2));
                    let pdf = (-0.5 * v * v).exp() / (2.0 * std::f32::consts::PI).sqrt();
                    d * (cdf + v * pdf)
                }))
            }
            "Gather" => {
                let x = f(0)?;
                let axis = normalize_axis(attr_int("axis", 0), x.ndim());
                let dim = x.shape()[axis] as i64;
                let idx_shape = inputs[1].shape();
                let idx = index_vec(&inputs[1], dim)?;
                let picked = x.select(Axis(axis), &idx);
                let mut out_shape: Vec<usize> = x.shape()[..axis].to_vec();
                out_shape.extend(&idx_shape);
                out_shape.extend(&x.shape()[axis + 1..]);
                let flat: Vec<f32> = picked.iter().copied().collect();
                let out = ArrayD::from_shape_vec(IxDyn(&out_shape), flat).map_err(|_| {
                    InterpreterError::ShapeMismatch(node.name.clone(), x.shape().to_vec(), out_shape)
                })?;
                one(out)
            }
            "GatherGrad" => {
                // Scatter-add of dy back into the data shape; repeated indices
                // accumulate.
                let shape: Vec<usize> =
                    require_ints(node, "shape")?.iter().map(|v| *v as usize).collect();
                let axis = normalize_axis(attr_int("axis", 0), shape.len());
                let idx = index_vec(&inputs[0], shape[axis] as i64)?;
                let dy = f(1)?;
                let mut collapsed: Vec<usize> = shape[..axis].to_vec();
                collapsed.push(idx.len());
                collapsed.extend(&shape[axis + 1..]);
                let flat: Vec<f32> = dy.iter().copied().collect();
                let dy = ArrayD::from_shape_vec(IxDyn(&collapsed), flat).map_err(|_| {
                    InterpreterError::ShapeMismatch(node.name.clone(), shape.clone(), collapsed)
                })?;
                let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));
                for (k, target) in idx.iter().enumerate() {
                    let piece = dy.index_axis(Axis(axis), k);
                    let mut slot = out.index_axis_mut(Axis(axis), *target);
                    slot += &piece;
                }
                one(out)
            }
            "LayerNormalization" => {
                let x = f(0)?;
                let scale = f(1)?;
                let rank = x.ndim();
                let axis = normalize_axis(attr_int("axis", -1), rank);
                let epsilon = attr_float("epsilon", 1e-5);
                let d: usize = x.shape()[axis..].iter().product();
                let n = x.len() / d;
                let xs: Vec<f32> = x.iter().copied().collect();
                let sv: Vec<f32> = scale.iter().copied().collect();
                let bv: Vec<f32> = if inputs.len() > 2 {
                    f(2)?.iter().copied().collect()
                } else {
                    vec![0.0; d]
                };
                let mut y = vec![0.0f32; xs.len()];
                let mut means = vec![0.0f32; n];
                let mut inv_stds = vec![0.0f32; n];
                for k in 0..n {
                    let row = &xs[k * d..(k + 1) * d];
                    let mean = row.iter().sum::<f32>() / d as f32;
                    let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / d as f32;
                    let inv_std = 1.0 / (var + epsilon).sqrt();
                    means[k] = mean;
                    inv_stds[k] = inv_std;
                    for j in 0..d {
                        y[k * d + j] = (row[j] - mean) * inv_std * sv[j] + bv[j];
                    }
                }
                let mut stat_shape: Vec<usize> = x.shape().to_vec();
                for s in stat_shape[axis..].iter_mut() {
                    *s = 1;
                }
                let mut out = vec![from_flat(node, y, x.shape())?];
                if node.outputs.len() > 1 {
                    out.push(from_flat(node, means, &stat_shape)?);
                }
                if node.outputs.len() > 2 {
                    out.push(from_flat(node, inv_stds, &stat_shape)?);
                }
                out
            }
            "LayerNormalizationGrad" => {
                let dy = f(0)?;
                let x = f(1)?;
                let scale = f(2)?;
                let mean = f(3)?;
                let inv_std = f(4)?;
                let d = scale.len();
                let n = x.len() / d;
                let dyv: Vec<f32> = dy.iter().copied().collect();
                let xv: Vec<f32> = x.iter().copied().collect();
                let sv: Vec<f32> = scale.iter().copied().collect();
                let mv: Vec<f32> = mean.iter().copied().collect();
                let isv: Vec<f32> = inv_std.iter().copied().collect();
                let mut dx = vec![0.0f32; xv.len()];
                let mut dscale = vec![0.0f32; d];
                let mut dbias = vec![0.0f32; d];
                for k in 0..n {
                    let mut sum_dxhat = 0.0;
                    let mut sum_dxhat_xhat = 0.0;
                    for j in 0..d {
                        let xhat = (xv[k * d + j] - mv[k]) * isv[k];
                        let dxhat = dyv[k * d + j] * sv[j];
                        sum_dxhat += dxhat;
                        sum_dxhat_xhat += dxhat * xhat;
                        dscale[j] += dyv[k * d + j] * xhat;
                        dbias[j] += dyv[k * d + j];
                    }
                    for j in 0..d {
                        let xhat = (xv[k * d + j] - mv[k]) * isv[k];
                        let dxhat = dyv[k * d + j] * sv[j];
                        dx[k * d + j] = isv[k]
                            * (dxhat - sum_dxhat / d as f32 - xhat * sum_dxhat_xhat / d as f32);
                    }
                }
                vec![
                    from_flat(node, dx, x.shape())?,
                    from_flat(node, dscale, scale.shape())?,
                    from_flat(node, dbias, scale.shape())?,
                ]
            }
            "BatchNormalization" => {
                let x = f(0)?;
                let scale = f(1)?;
                let bias = f(2)?;
                let epsilon = attr_float("epsilon", 1e-5);
                let momentum = attr_float("momentum", 0.9);
                let c = x.shape()[1];
                let inner: usize = x.shape()[2..].iter().product();
                let m = (x.len() / c) as f32;
                let xv: Vec<f32> = x.iter().copied().collect();
                let sv: Vec<f32> = scale.iter().copied().collect();
                let bv: Vec<f32> = bias.iter().copied().collect();
                let mut mean = vec![0.0f32; c];
                let mut var = vec![0.0f32; c];
                for (i, v) in xv.iter().enumerate() {
                    mean[(i / inner) % c] += v;
                }
                for v in mean.iter_mut() {
                    *v /= m;
                }
                for (i, v) in xv.iter().enumerate() {
                    let delta = v - mean[(i / inner) % c];
                    var[(i / inner) % c] += delta * delta;
                }
                for v in var.iter_mut() {
                    *v /= m;
                }
                let mut y = vec![0.0f32; xv.len()];
                for (i, v) in xv.iter().enumerate() {
                    let ch = (i / inner) % c;
                    y[i] = (v - mean[ch]) / (var[ch] + epsilon).sqrt() * sv[ch] + bv[ch];
                }
                let mut out = vec![from_flat(node, y, x.shape())?];
                if node.outputs.len() > 1 {
                    let rm: Vec<f32> = f(3)?.iter().copied().collect();
                    let rv: Vec<f32> = f(4)?.iter().copied().collect();
                    let run_mean: Vec<f32> = rm
                        .iter()
                        .zip(&mean)
                        .map(|(r, b)| r * momentum + b * (1.0 - momentum))
                        .collect();
                    let run_var: Vec<f32> = rv
                        .iter()
                        .zip(&var)
                        .map(|(r, b)| r * momentum + b * (1.0 - momentum))
                        .collect();
                    for stat in [run_mean, run_var, mean, var] {
                        out.push(from_flat(node, stat, &[c])?);
                    }
                    out.truncate(node.outputs.len());
                }
                out
            }
            "BatchNormalizationGrad" => {
                let dy = f(0)?;
                let x = f(1)?;
                let scale = f(2)?;
                let mean = f(3)?;
                let var = f(4)?;
                let epsilon = attr_float("epsilon", 1e-5);
                let c = x.shape()[1];
                let inner: usize = x.shape()[2..].iter().product();
                let m = (x.len() / c) as f32;
                let dyv: Vec<f32> = dy.iter().copied().collect();
                let xv: Vec<f32> = x.iter().copied().collect();
                let sv: Vec<f32> = scale.iter().copied().collect();
                let mv: Vec<f32> = mean.iter().copied().collect();
                let vv: Vec<f32> = var.iter().copied().collect();
                let isv: Vec<f32> = vv.iter().map(|v| 1.0 / (v + epsilon).sqrt()).collect();
                let mut sum_dxhat = vec![0.0f32; c];
                let mut sum_dxhat_xhat = vec![0.0f32; c];
                let mut dscale = vec![0.0f32; c];
                let mut dbias = vec![0.0f32; c];
                for (i, (&xi, &di)) in xv.iter().zip(&dyv).enumerate() {
                    let ch = (i / inner) % c;
                    let xhat = (xi - mv[ch]) * isv[ch];
                    let dxhat = di * sv[ch];
                    sum_dxhat[ch] += dxhat;
                    sum_dxhat_xhat[ch] += dxhat * xhat;
                    dscale[ch] += di * xhat;
                    dbias[ch] += di;
                }
                let mut dx = vec![0.0f32; xv.len()];
                for (i, (&xi, &di)) in xv.iter().zip(&dyv).enumerate() {
                    let ch = (i / inner) % c;
                    let xhat = (xi - mv[ch]) * isv[ch];
                    let dxhat = di * sv[ch];
                    dx[i] =
                        isv[ch] * (dxhat - sum_dxhat[ch] / m - xhat * sum_dxhat_xhat[ch] / m);
                }
                vec![
                    from_flat(node, dx, x.shape())?,
                    from_flat(node, dscale, &[c])?,
                    from_flat(node, dbias, &[c])?,
                ]
            }
            "Conv" => {
                let x = f(0)?;
                let w = f(1)?;
                let b = if inputs.len() > 2 { Some(f(2)?) } else { None };
                let geom = ConvGeometry::from_node(node, &x, w.shape()[2], w.shape()[3])?;
                let (n, c) = (x.shape()[0], x.shape()[1]);
                let m = w.shape()[0];
                let mut y = ArrayD::<f32>::zeros(IxDyn(&[n, m, geom.h_out, geom.w_out]));
                for ni in 0..n {
                    for mi in 0..m {
                        for oy in 0..geom.h_out {
                            for ox in 0..geom.w_out {
                                let mut acc = b.as_ref().map(|b| b[[mi]]).unwrap_or(0.0);
                                for ci in 0..c {
                                    for ky in 0..geom.kh {
                                        for kx in 0..geom.kw {
                                            if let Some((iy, ix)) = geom.source(oy, ox, ky, kx) {
                                                acc += x[[ni, ci, iy, ix]] * w[[mi, ci, ky, kx]];
                                            }
                                        }
                                    }
                                }
                                y[[ni, mi, oy, ox]] = acc;
                            }
                        }
                    }
                }
                one(y)
            }
            "ConvGrad" => {
                let dy = f(0)?;
                let x = f(1)?;
                let w = f(2)?;
                let geom = ConvGeometry::from_node(node, &x, w.shape()[2], w.shape()[3])?;
                let (n, c) = (x.shape()[0], x.shape()[1]);
                let m = w.shape()[0];
                let mut dx = ArrayD::<f32>::zeros(x.raw_dim());
                let mut dw = ArrayD::<f32>::zeros(w.raw_dim());
                let mut db = vec![0.0f32; m];
                for ni in 0..n {
                    for mi in 0..m {
                        for oy in 0..geom.h_out {
                            for ox in 0..geom.w_out {
                                let d = dy[[ni, mi, oy, ox]];
                                db[mi] += d;
                                for ci in 0..c {
                                    for ky in 0..geom.kh {
                                        for kx in 0..geom.kw {
                                            if let Some((iy, ix)) = geom.source(oy, ox, ky, kx) {
                                                dw[[mi, ci, ky, kx]] += d * x[[ni, ci, iy, ix]];
                                                dx[[ni, ci, iy, ix]] += d * w[[mi, ci, ky, kx]];
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                let mut out = vec![TensorValue::F32(dx), TensorValue::F32(dw)];
                if node.outputs.len() > 2 {
                    out.push(from_flat(node, db, &[m])?);
                }
                out
            }
            "MaxPool" => {
                let x = f(0)?;
                let geom = ConvGeometry::from_attrs(node, &x)?;
                one(pool(&x, &geom, |window| {
                    window.iter().fold(f32::NEG_INFINITY, |m, v| m.max(*v))
                }))
            }
            "MaxPoolGrad" => {
                // Route each output gradient to the first maximal element of
                // its window, recomputed from the forward input.
                let dy = f(0)?;
                let x = f(1)?;
                let geom = ConvGeometry::from_attrs(node, &x)?;
                let (n, c) = (x.shape()[0], x.shape()[1]);
                let mut dx = ArrayD::<f32>::zeros(x.raw_dim());
                for ni in 0..n {
                    for ci in 0..c {
                        for oy in 0..geom.h_out {
                            for ox in 0..geom.w_out {
                                let mut best = f32::NEG_INFINITY;
                                let mut arg = None;
                                for ky in 0..geom.kh {
                                    for kx in 0..geom.kw {
                                        if let Some((iy, ix)) = geom.source(oy, ox, ky, kx) {
                                            let v = x[[ni, ci, iy, ix]];
                                            if v > best {
                                                best = v;
                                                arg = Some((iy, ix));
                                            }
                                        }
                                    }
                                }
                                if let Some((iy, ix)) = arg {
                                    dx[[ni, ci, iy, ix]] += dy[[ni, ci, oy, ox]];
                                }
                            }
                        }
                    }
                }
                one(dx)
            }
            "AveragePool" => {
                let x = f(0)?;
                let geom = ConvGeometry::from_attrs(node, &x)?;
                one(pool(&x, &geom, |window| {
                    window.iter().sum::<f32>() / window.len().max(1) as f32
                }))
            }
            "AveragePoolGrad" => {
                let dy = f(0)?;
                let shape: Vec<usize> =
                    require_ints(node, "input_shape")?.iter().map(|v| *v as usize).collect();
                let mut dx = ArrayD::<f32>::zeros(IxDyn(&shape));
                let geom = ConvGeometry::from_attrs(node, &dx)?;
                let (n, c) = (shape[0], shape[1]);
                for ni in 0..n {
                    for ci in 0..c {
                        for oy in 0..geom.h_out {
                            for ox in 0..geom.w_out {
                                let mut count = 0usize;
                                for ky in 0..geom.kh {
                                    for kx in 0..geom.kw {
                                        if geom.source(oy, ox, ky, kx).is_some() {
                                            count += 1;
                                        }
                                    }
                                }
                                let share = dy[[ni, ci, oy, ox]] / count.max(1) as f32;
                                for ky in 0..geom.kh {
                                    for kx in 0..geom.kw {
                                        if let Some((iy, ix)) = geom.source(oy, ox, ky, kx) {
                                            dx[[ni, ci, iy, ix]] += share;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                one(dx)
            }
            "SoftmaxCrossEntropy" => {
                let scores = f(0)?;
                let labels = f(1)?;
                let axis = scores.ndim() - 1;
                let log_prob = log_softmax(&scores, axis);
                let per_sample = -(&labels * &log_prob).sum_axis(Axis(axis));
                let reduction = node
                    .attributes
                    .get("reduction")
                    .and_then(Attribute::as_str)
                    .unwrap_or("mean");
                let total = per_sample.sum();
                let loss = if reduction == "mean" {
                    total / per_sample.len().max(1) as f32
                } else {
                    total
                };
                vec![
                    TensorValue::F32(ArrayD::from_elem(IxDyn(&[]), loss)),
                    TensorValue::F32(log_prob),
                ]
            }
            "SoftmaxCrossEntropyGrad" => {
                let d_loss = f(0)?;
                let log_prob = f(1)?;
                let labels = f(2)?;
                let axis = log_prob.ndim() - 1;
                let batch = (log_prob.len() / log_prob.shape()[axis]).max(1);
                let reduction = node
                    .attributes
                    .get("reduction")
                    .and_then(Attribute::as_str)
                    .unwrap_or("mean");
                let scale = if reduction == "mean" {
                    d_loss.sum() / batch as f32
                } else {
                    d_loss.sum()
                };
                one((log_prob.mapv(f32::exp) - labels).mapv(|v| v * scale))
            }
            "SparseSoftmaxCrossEntropy" => {
                let scores = f(0)?;
                let axis = scores.ndim() - 1;
                let classes = scores.shape()[axis];
                let n = scores.len() / classes;
                let prob = softmax(&scores, axis);
                let labels = index_vec(&inputs[1], classes as i64)?;
                let weights: Option<Vec<f32>> = if inputs.len() > 2 {
                    Some(f(2)?.iter().copied().collect())
                } else {
                    None
                };
                let flat: Vec<f32> = prob.iter().copied().collect();
                let mut total = 0.0;
                let mut weight_sum = 0.0;
                for k in 0..n {
                    let w = weights.as_ref().map(|w| w[k]).unwrap_or(1.0);
                    let p = flat[k * classes + labels[k]];
                    total += -w * p.max(f32::MIN_POSITIVE).ln();
                    weight_sum += w;
                }
                let reduction = node
                    .attributes
                    .get("reduction")
                    .and_then(Attribute::as_str)
                    .unwrap_or("mean");
                let loss = if reduction == "mean" {
                    total / weight_sum.max(f32::MIN_POSITIVE)
                } else {
                    total
                };
                vec![
                    TensorValue::F32(ArrayD::from_elem(IxDyn(&[]), loss)),
                    TensorValue::F32(prob),
                ]
            }
            "SparseSoftmaxCrossEntropyGrad" => {
                let d_loss = f(0)?.sum();
                let prob = f(1)?;
                let axis = prob.ndim() - 1;
                let classes = prob.shape()[axis];
                let n = prob.len() / classes;
                let labels = index_vec(&inputs[2], classes as i64)?;
                let weights: Option<Vec<f32>> = if inputs.len() > 3 {
                    Some(f(3)?.iter().copied().collect())
                } else {
                    None
                };
                let reduction = node
                    .attributes
                    .get("reduction")
                    .and_then(Attribute::as_str)
                    .unwrap_or("mean");
                let denom = if reduction == "mean" {
                    weights
                        .as_ref()
                        .map(|w| w.iter().sum::<f32>())
                        .unwrap_or(n as f32)
                        .max(f32::MIN_POSITIVE)
                } else {
                    1.0
                };
                let mut flat: Vec<f32> = prob.iter().copied().collect();
                for k in 0..n {
                    let w = weights.as_ref().map(|w| w[k]).unwrap_or(1.0);
                    for c in 0..classes {
                        let indicator = if c == labels[k] { 1.0 } else { 0.0 };
                        let slot = &mut flat[k * classes + c];
                        *slot = d_loss * w / denom * (*slot - indicator);
                    }
                }
                vec![from_flat(node, flat, prob.shape())?]
            }
            "Dropout" => {
                // Evaluation mode: pass-through with an all-true mask.
                let shape = inputs[0].shape();
                let mut out = vec![inputs[0].clone()];
                if node.outputs.len() > 1 {
                    out.push(TensorValue::BOOL(ArrayD::from_elem(IxDyn(&shape), true)));
                }
                out
            }
            "DropoutGrad" => {
                let dy = f(0)?;
                let mask = f(1)?;
                one(Zip::from(&dy)
                    .and(&mask)
                    .map_collect(|d, m| if *m != 0.0 { *d } else { 0.0 }))
            }
            other => return Err(InterpreterError::UnsupportedOp(other.to_string())),
        })
    }
}

fn one(value: ArrayD<f32>) -> Vec<TensorValue> {
    vec![TensorValue::F32(value)]
}

/// Abramowitz & Stegun 7.1.26 rational approximation, |error| < 1.5e-7.
fn erf(x: f32) -> f32 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Integer tensor flattened to non-negative indices, resolving negatives
/// against `dim`.
fn index_vec(t: &TensorValue, dim: i64) -> Result<Vec<usize>, InterpreterError> {
    Ok(t.to_f32_array()?
        .iter()
        .map(|v| {
            let i = *v as i64;
            (if i < 0 { i + dim } else { i }) as usize
        })
        .collect())
}

fn from_flat(
    node: &NodeDef,
    values: Vec<f32>,
    shape: &[usize],
) -> Result<TensorValue, InterpreterError> {
    let len = values.len();
    let out = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
        InterpreterError::ShapeMismatch(node.name.clone(), shape.to_vec(), vec![len])
    })?;
    Ok(TensorValue::F32(out))
}

/// Spatial bookkeeping shared by Conv and the 2-D pooling kernels: kernel
/// extent, strides, explicit pads and the resulting output size over NCHW.
struct ConvGeometry {
    kh: usize,
    kw: usize,
    sh: usize,
    sw: usize,
    ph: usize,
    pw: usize,
    h: usize,
    w: usize,
    h_out: usize,
    w_out: usize,
}

impl ConvGeometry {
    /// Conv form: the kernel extent comes from the weight tensor.
    fn from_node(
        node: &NodeDef,
        x: &ArrayD<f32>,
        kh: usize,
        kw: usize,
    ) -> Result<Self, InterpreterError> {
        Self::build(node, x, kh, kw)
    }

    /// Pooling form: the kernel extent comes from the `kernel_shape` attribute.
    fn from_attrs(node: &NodeDef, x: &ArrayD<f32>) -> Result<Self, InterpreterError> {
        let kernel = require_ints(node, "kernel_shape")?;
        Self::build(node, x, kernel[0] as usize, kernel[1] as usize)
    }

    fn build(
        node: &NodeDef,
        x: &ArrayD<f32>,
        kh: usize,
        kw: usize,
    ) -> Result<Self, InterpreterError> {
        if x.ndim() != 4 {
            return Err(InterpreterError::ShapeMismatch(
                node.name.clone(),
                x.shape().to_vec(),
                vec![],
            ));
        }
        let (h, w) = (x.shape()[2], x.shape()[3]);
        let (sh, sw) = match node.attributes.get("strides").and_then(Attribute::as_ints) {
            Some(s) => (s[0] as usize, s[1] as usize),
            None => (1, 1),
        };
        // ONNX pad layout: [begin_h, begin_w, end_h, end_w].
        let pads = match node.attributes.get("pads").and_then(Attribute::as_ints) {
            Some(p) => [p[0] as usize, p[1] as usize, p[2] as usize, p[3] as usize],
            None => [0; 4],
        };
        let h_out = (h + pads[0] + pads[2] - kh) / sh + 1;
        let w_out = (w + pads[1] + pads[3] - kw) / sw + 1;
        Ok(Self {
            kh,
            kw,
            sh,
            sw,
            ph: pads[0],
            pw: pads[1],
            h,
            w,
            h_out,
            w_out,
        })
    }

    /// Input coordinate feeding output position (oy, ox) through kernel tap
    /// (ky, kx), or None when the tap lands in padding.
    fn source(&self, oy: usize, ox: usize, ky: usize, kx: usize) -> Option<(usize, usize)> {
        let iy = (oy * self.sh + ky) as isize - self.ph as isize;
        let ix = (ox * self.sw + kx) as isize - self.pw as isize;
        if iy >= 0 && (iy as usize) < self.h && ix >= 0 && (ix as usize) < self.w {
            Some((iy as usize, ix as usize))
        } else {
            None
        }
    }
}

/// Per-channel 2-D pooling with an arbitrary window reducer over the
/// in-bounds elements.
fn pool(x: &ArrayD<f32>, geom: &ConvGeometry, reduce: impl Fn(&[f32]) -> f32) -> ArrayD<f32> {
    let (n, c) = (x.shape()[0], x.shape()[1]);
    let mut y = ArrayD::<f32>::zeros(IxDyn(&[n, c, geom.h_out, geom.w_out]));
    let mut window = Vec::with_capacity(geom.kh * geom.kw);
    for ni in 0..n {
        for ci in 0..c {
            for oy in 0..geom.h_out {
                for ox in 0..geom.w_out {
                    window.clear();
                    for ky in 0..geom.kh {
                        for kx in 0..geom.kw {
                            if let Some((iy, ix)) = geom.source(oy, ox, ky, kx) {
                                window.push(x[[ni, ci, iy, ix]]);
                            }
                        }
                    }
                    y[[ni, ci, oy, ox]] = reduce(&window);
                }
            }
        }
    }
    y
}

fn require_ints<'a>(node: &'a NodeDef, name: &str) -> Result<&'a [i64], InterpreterError> {
    node.attributes
        .get(name)
        .and_then(Attribute::as_ints)
        .ok_or_else(|| InterpreterError::MissingAttribute(node.name.clone(), name.to_string()))
}

fn normalize_axis(axis: i64, rank: usize) -> usize {
    if axis < 0 {
        (axis + rank as i64) as usize
    } else {
        axis as usize
    }
}

fn broadcast_shape(
    node: &NodeDef,
    a: &[usize],
    b: &[usize],
) -> Result<Vec<usize>, InterpreterError> {
    let rank = a.len().max(b.len());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let ai = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let bi = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        if ai == bi || ai == 1 || bi == 1 {
            out.push(ai.max(bi));
        } else {
            return Err(InterpreterError::ShapeMismatch(
                node.name.clone(),
                a.to_vec(),
                b.to_vec(),
            ));
        }
    }
    Ok(out)
}

fn binary(
    node: &NodeDef,
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>, InterpreterError> {
    let shape = broadcast_shape(node, a.shape(), b.shape())?;
    let av = a.broadcast(IxDyn(&shape)).ok_or_else(|| {
        InterpreterError::ShapeMismatch(node.name.clone(), a.shape().to_vec(), shape.clone())
    })?;
    let bv = b.broadcast(IxDyn(&shape)).ok_or_else(|| {
        InterpreterError::ShapeMismatch(node.name.clone(), b.shape().to_vec(), shape.clone())
    })?;
    Ok(Zip::from(&av).and(&bv).map_collect(|x, y| f(*x, *y)))
}

fn as_2d(
    node: &NodeDef,
    x: &ArrayD<f32>,
    transpose: bool,
) -> Result<Array2<f32>, InterpreterError> {
    let x2 = x
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| {
            InterpreterError::ShapeMismatch(node.name.clone(), x.shape().to_vec(), vec![])
        })?;
    Ok(if transpose {
        x2.t().to_owned()
    } else {
        x2.to_owned()
    })
}

/// NumPy-style batched matmul over the last two axes, broadcasting leading
/// batch dimensions.
fn matmul(
    node: &NodeDef,
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
) -> Result<ArrayD<f32>, InterpreterError> {
    if a.ndim() == 2 && b.ndim() == 2 {
        return Ok(as_2d(node, a, false)?.dot(&as_2d(node, b, false)?).into_dyn());
    }
    let mismatch =
        || InterpreterError::ShapeMismatch(node.name.clone(), a.shape().to_vec(), b.shape().to_vec());
    if a.ndim() < 2 || b.ndim() < 2 {
        return Err(mismatch());
    }
    let (m, ka) = (a.shape()[a.ndim() - 2], a.shape()[a.ndim() - 1]);
    let (kb, n) = (b.shape()[b.ndim() - 2], b.shape()[b.ndim() - 1]);
    if ka != kb {
        return Err(mismatch());
    }
    let batch = broadcast_shape(
        node,
        &a.shape()[..a.ndim() - 2],
        &b.shape()[..b.ndim() - 2],
    )?;
    let mut out_shape = batch.clone();
    out_shape.extend([m, n]);
    let mut out = ArrayD::<f32>::zeros(IxDyn(&out_shape));
    for index in ndarray::indices(IxDyn(&batch)) {
        let idx: Vec<usize> = index.slice().to_vec();
        let a2 = batch_slice(a, &idx)?;
        let b2 = batch_slice(b, &idx)?;
        let product = a2.dot(&b2);
        let mut slot = out.view_mut();
        for i in &idx {
            slot = slot.index_axis_move(Axis(0), *i);
        }
        let mut slot2 = slot
            .into_dimensionality::<Ix2>()
            .map_err(|_| mismatch())?;
        slot2.assign(&product);
    }
    Ok(out)
}

/// Select the 2-D panel of `t` addressed by a (right-aligned, broadcasting)
/// batch index.
fn batch_slice(t: &ArrayD<f32>, batch_idx: &[usize]) -> Result<Array2<f32>, InterpreterError> {
    let t_batch = t.ndim() - 2;
    let mut view = t.view();
    for i in 0..t_batch {
        let global = batch_idx.len() - t_batch + i;
        let len = view.shape()[0];
        let idx = if len == 1 { 0 } else { batch_idx[global] };
        view = view.index_axis_move(Axis(0), idx);
    }
    Ok(view
        .into_dimensionality::<Ix2>()
        .expect("two trailing axes")
        .to_owned())
}

fn softmax(x: &ArrayD<f32>, axis: usize) -> ArrayD<f32> {
    let max = x
        .fold_axis(Axis(axis), f32::NEG_INFINITY, |m, v| m.max(*v))
        .insert_axis(Axis(axis));
    let e = (x - &max).mapv(f32::exp);
    let sum = e.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    e / sum
}

fn log_softmax(x: &ArrayD<f32>, axis: usize) -> ArrayD<f32> {
    let max = x
        .fold_axis(Axis(axis), f32::NEG_INFINITY, |m, v| m.max(*v))
        .insert_axis(Axis(axis));
    let shifted = x - &max;
    let log_sum = shifted
        .mapv(f32::exp)
        .sum_axis(Axis(axis))
        .insert_axis(Axis(axis))
        .mapv(f32::ln);
    shifted - log_sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphMutator;
    use std::collections::BTreeMap;

    fn feed(values: Vec<f32>, shape: &[usize]) -> TensorValue {
        TensorValue::from_vec_shape(values, shape).unwrap()
    }

    #[test]
    fn evaluates_a_small_expression() {
        let mut m = GraphMutator::new();
        let x = m.add_input("x", DType::F32, vec![2]).unwrap();
        let y = m.add_input("y", DType::F32, vec![2]).unwrap();
        let s = m.add_intermediate("s", Some(DType::F32), Some(vec![2])).unwrap();
        let r = m.add_intermediate("r", Some(DType::F32), Some(vec![2])).unwrap();
        m.add_node(crate::graph::NodeDef {
            name: "add".into(),
            op_type: "Add".into(),
            inputs: vec![x, y],
            outputs: vec![s],
            attributes: BTreeMap::new(),
            aliases: vec![],
        })
        .unwrap();
        m.add_node(crate::graph::NodeDef {
            name: "relu".into(),
            op_type: "Relu".into(),
            inputs: vec![s],
            outputs: vec![r],
            attributes: BTreeMap::new(),
            aliases: vec![],
        })
        .unwrap();
        let g = m.into_inner();

        let mut feeds = HashMap::new();
        feeds.insert("x".to_string(), feed(vec![1.0, -4.0], &[2]));
        feeds.insert("y".to_string(), feed(vec![2.0, 1.0], &[2]));
        let out = Interpreter::new(&g).run(&feeds, &["r"]).unwrap();
        let out = out[0].to_f32_array().unwrap();
        assert_eq!(out.as_slice().unwrap(), &[3.0, 0.0]);
    }

    #[test]
    fn batched_matmul_broadcasts_rank_2_rhs() {
        let a = feed((0..12).map(|v| v as f32).collect(), &[2, 2, 3])
            .to_f32_array()
            .unwrap();
        let b = feed(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2])
            .to_f32_array()
            .unwrap();
        let node = NodeDef {
            name: "mm".into(),
            op_type: "MatMul".into(),
            inputs: vec![],
            outputs: vec![],
            attributes: BTreeMap::new(),
            aliases: vec![],
        };
        let out = matmul(&node, &a, &b).unwrap();
        assert_eq!(out.shape(), &[2, 2, 2]);
        // First panel: [[0,1,2],[3,4,5]] . [[1,0],[0,1],[1,1]]
        assert_eq!(out[[0, 0, 0]], 2.0);
        assert_eq!(out[[0, 0, 1]], 3.0);
        assert_eq!(out[[0, 1, 0]], 8.0);
        assert_eq!(out[[0, 1, 1]], 9.0);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let x = feed(vec![1.0, 2.0, 3.0, 1.0, 1.0, 1.0], &[2, 3])
            .to_f32_array()
            .unwrap();
        let s = softmax(&x, 1);
        for row in 0..2 {
            let sum: f32 = (0..3).map(|c| s[[row, c]]).sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }
}
