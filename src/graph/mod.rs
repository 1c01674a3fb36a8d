mod name_gen;

pub use name_gen::NameGenerator;

use crate::dtype::DType;
use crate::tensor::TensorValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Unknown tensor \"{0}\"")]
    UnknownTensor(String),
    #[error("Duplicate tensor name \"{0}\"")]
    DuplicateTensorName(String),
    #[error("Tensor \"{0}\" already has a producer")]
    DuplicateProducer(String),
    #[error("Cycle detected involving node \"{0}\"")]
    CycleDetected(String),
    #[error("Type mismatch on \"{0}\": declared {1}, inferred {2}")]
    TypeMismatch(String, DType, DType),
    #[error("Shape mismatch on \"{0}\": declared {1:?}, inferred {2:?}")]
    ShapeMismatch(String, Vec<usize>, Vec<usize>),
    #[error("Graph decoding error")]
    DecodingError(#[from] serde_json::Error),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type TensorId = usize;
pub type NodeId = usize;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    String(String),
}

impl Attribute {
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Attribute::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::Int(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Attribute::Ints(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attribute::String(x) => Some(x),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TensorKind {
    Input,
    Output,
    Intermediate,
    Initializer(TensorValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    pub name: String,
    pub dtype: Option<DType>,
    pub shape: Option<Vec<usize>>,
    pub kind: TensorKind,
}

impl TensorInfo {
    pub fn initializer_value(&self) -> Option<&TensorValue> {
        match &self.kind {
            TensorKind::Initializer(v) => Some(v),
            _ => None,
        }
    }
}

/// An operator instance. Tensors are referenced by id, never by pointer, so
/// the graph can be rewritten while node definitions stay valid.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    pub attributes: BTreeMap<String, Attribute>,
    /// (input index, output index) pairs whose storage is shared. The external
    /// scheduler must not read the input after the node has executed.
    pub aliases: Vec<(usize, usize)>,
}

/// Tensors and nodes live in ordered maps so that iteration and serde output
/// are byte-identical across builds of the same graph.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Graph {
    tensors: BTreeMap<TensorId, TensorInfo>,
    nodes: BTreeMap<NodeId, NodeDef>,
    next_tensor_id: TensorId,
    next_node_id: NodeId,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tensors(&self) -> impl Iterator<Item = (TensorId, &TensorInfo)> {
        self.tensors.iter().map(|(id, t)| (*id, t))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &NodeDef)> {
        self.nodes.iter().map(|(id, n)| (*id, n))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn get_tensor(&self, id: TensorId) -> Option<&TensorInfo> {
        self.tensors.get(&id)
    }

    pub fn get_node(&self, id: NodeId) -> Option<&NodeDef> {
        self.nodes.get(&id)
    }

    pub fn tensors_by_name(&self) -> HashMap<String, TensorId> {
        self.tensors
            .iter()
            .map(|(id, t)| (t.name.clone(), *id))
            .collect()
    }

    pub fn tensor_id_by_name(&self, name: &str) -> Option<TensorId> {
        self.tensors
            .iter()
            .find(|(_, t)| t.name == name)
            .map(|(id, _)| *id)
    }

    pub fn tensor_name(&self, id: TensorId) -> Option<&str> {
        self.tensors.get(&id).map(|t| t.name.as_str())
    }

    pub fn inputs(&self) -> Vec<TensorId> {
        self.sorted_tensor_ids_where(|t| matches!(t.kind, TensorKind::Input))
    }

    pub fn outputs(&self) -> Vec<TensorId> {
        self.sorted_tensor_ids_where(|t| matches!(t.kind, TensorKind::Output))
    }

    pub fn initializers(&self) -> Vec<TensorId> {
        self.sorted_tensor_ids_where(|t| matches!(t.kind, TensorKind::Initializer(_)))
    }

    fn sorted_tensor_ids_where(&self, pred: impl Fn(&TensorInfo) -> bool) -> Vec<TensorId> {
        let mut ids: Vec<_> = self
            .tensors
            .iter()
            .filter(|(_, t)| pred(t))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Initializer names that are candidates for training, minus the
    /// explicitly immutable ones.
    pub fn trainable_initializer_names(&self, immutable: &BTreeSet<String>) -> BTreeSet<String> {
        self.initializers()
            .into_iter()
            .filter_map(|id| self.tensors.get(&id))
            .filter(|t| t.dtype.map(|d| d.is_float()).unwrap_or(false))
            .map(|t| t.name.clone())
            .filter(|n| !immutable.contains(n))
            .collect()
    }

    /// Node producing each tensor. A tensor has at most one producer.
    pub fn producers(&self) -> HashMap<TensorId, NodeId> {
        let mut out = HashMap::new();
        for (id, node) in &self.nodes {
            for output in &node.outputs {
                out.insert(*output, *id);
            }
        }
        out
    }

    /// Nodes consuming each tensor, in node-id order.
    pub fn consumers(&self) -> HashMap<TensorId, Vec<NodeId>> {
        let mut out: HashMap<TensorId, Vec<NodeId>> = HashMap::new();
        for (id, node) in &self.nodes {
            for input in &node.inputs {
                out.entry(*input).or_default().push(*id);
            }
        }
        for v in out.values_mut() {
            v.sort_unstable();
            v.dedup();
        }
        out
    }

    /// Topological order over nodes. Ties are broken by node id so that two
    /// builds of the same graph walk it identically; every rank in a
    /// distributed job must produce structurally identical graphs.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let producers = self.producers();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut dependents: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (id, node) in &self.nodes {
            let mut degree = 0;
            for input in &node.inputs {
                if let Some(producer) = producers.get(input) {
                    degree += 1;
                    dependents.entry(*producer).or_default().push(*id);
                }
            }
            in_degree.insert(*id, degree);
        }

        let mut ready: BTreeSet<NodeId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            if let Some(deps) = dependents.get(&id) {
                for dep in deps {
                    let d = in_degree.get_mut(dep).expect("node in degree map");
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*dep);
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = self
                .nodes
                .keys()
                .find(|id| !order.contains(id))
                .and_then(|id| self.nodes.get(id))
                .map(|n| n.name.clone())
                .unwrap_or_default();
            return Err(GraphError::CycleDetected(stuck));
        }
        Ok(order)
    }

    /// DAG invariant check, run after every gradient/optimizer insertion pass.
    pub fn verify_acyclic(&self) -> Result<(), GraphError> {
        self.topological_order().map(|_| ())
    }

    pub fn save_json<W: std::io::Write>(&self, writer: W) -> Result<(), GraphError> {
        serde_json::to_writer(writer, self)?;
        Ok(())
    }

    pub fn load_json<R: std::io::Read>(reader: R) -> Result<Self, GraphError> {
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Mutating wrapper over a [`Graph`] that maintains the by-name lookup and the
/// unique-name invariant while builders insert tensors and nodes.
pub struct GraphMutator {
    graph: Graph,
    tensors_by_name: HashMap<String, TensorId>,
    name_gen: NameGenerator,
}

impl GraphMutator {
    pub fn new() -> Self {
        Self::from_graph(Graph::new())
    }

    pub fn from_graph(graph: Graph) -> Self {
        let tensors_by_name = graph.tensors_by_name();
        let mut name_gen = NameGenerator::new();
        for name in tensors_by_name.keys() {
            name_gen.reserve(name);
        }
        for (_, node) in graph.nodes() {
            name_gen.reserve(&node.name);
        }
        Self {
            graph,
            tensors_by_name,
            name_gen,
        }
    }

    pub fn into_inner(self) -> Graph {
        self.graph
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn name_gen(&mut self) -> &mut NameGenerator {
        &mut self.name_gen
    }

    pub fn tensor_id_by_name(&self, name: &str) -> Option<TensorId> {
        self.tensors_by_name.get(name).copied()
    }

    fn insert_tensor(&mut self, info: TensorInfo) -> Result<TensorId, GraphError> {
        if self.tensors_by_name.contains_key(&info.name) {
            return Err(GraphError::DuplicateTensorName(info.name));
        }
        let id = self.graph.next_tensor_id;
        self.graph.next_tensor_id += 1;
        self.name_gen.reserve(&info.name);
        self.tensors_by_name.insert(info.name.clone(), id);
        self.graph.tensors.insert(id, info);
        Ok(id)
    }

    pub fn add_input(
        &mut self,
        name: &str,
        dtype: DType,
        shape: Vec<usize>,
    ) -> Result<TensorId, GraphError> {
        self.insert_tensor(TensorInfo {
            name: name.to_string(),
            dtype: Some(dtype),
            shape: Some(shape),
            kind: TensorKind::Input,
        })
    }

    pub fn add_intermediate(
        &mut self,
        name: &str,
        dtype: Option<DType>,
        shape: Option<Vec<usize>>,
    ) -> Result<TensorId, GraphError> {
        self.insert_tensor(TensorInfo {
            name: name.to_string(),
            dtype,
            shape,
            kind: TensorKind::Intermediate,
        })
    }

    pub fn add_initializer(&mut self, name: &str, value: TensorValue) -> Result<TensorId, GraphError> {
        self.insert_tensor(TensorInfo {
            name: name.to_string(),
            dtype: Some(value.dtype()),
            shape: Some(value.shape()),
            kind: TensorKind::Initializer(value),
        })
    }

    /// Resolve a tensor by name, creating an untyped intermediate when absent.
    pub fn get_or_add_tensor(&mut self, name: &str) -> Result<TensorId, GraphError> {
        if let Some(id) = self.tensors_by_name.get(name) {
            return Ok(*id);
        }
        self.add_intermediate(name, None, None)
    }

    pub fn mark_output(&mut self, name: &str) -> Result<TensorId, GraphError> {
        let id = self
            .tensor_id_by_name(name)
            .ok_or_else(|| GraphError::UnknownTensor(name.to_string()))?;
        let info = self.graph.tensors.get_mut(&id).expect("tensor exists");
        if !matches!(info.kind, TensorKind::Initializer(_)) {
            info.kind = TensorKind::Output;
        }
        Ok(id)
    }

    /// Type/shape refinement: only fills in missing metadata, and rejects
    /// disagreements with what was already declared.
    pub fn refine_tensor(
        &mut self,
        id: TensorId,
        dtype: Option<DType>,
        shape: Option<Vec<usize>>,
    ) -> Result<(), GraphError> {
        let info = self
            .graph
            .tensors
            .get_mut(&id)
            .ok_or_else(|| GraphError::UnknownTensor(format!("#{id}")))?;
        if let Some(dtype) = dtype {
            match info.dtype {
                None => info.dtype = Some(dtype),
                Some(existing) if existing != dtype => {
                    return Err(GraphError::TypeMismatch(info.name.clone(), existing, dtype));
                }
                _ => {}
            }
        }
        if let Some(shape) = shape {
            match &info.shape {
                None => info.shape = Some(shape),
                Some(existing) if *existing != shape => {
                    return Err(GraphError::ShapeMismatch(
                        info.name.clone(),
                        existing.clone(),
                        shape,
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Replace an initializer's value in place. Dtype and shape must match
    /// the current value; anything else would invalidate downstream metadata.
    pub fn set_initializer_value(
        &mut self,
        name: &str,
        value: TensorValue,
    ) -> Result<(), GraphError> {
        let id = self
            .tensor_id_by_name(name)
            .ok_or_else(|| GraphError::UnknownTensor(name.to_string()))?;
        let info = self.graph.tensors.get_mut(&id).expect("tensor exists");
        match &info.kind {
            TensorKind::Initializer(existing) => {
                if existing.dtype() != value.dtype() {
                    return Err(GraphError::TypeMismatch(
                        info.name.clone(),
                        existing.dtype(),
                        value.dtype(),
                    ));
                }
                if existing.shape() != value.shape() {
                    return Err(GraphError::ShapeMismatch(
                        info.name.clone(),
                        existing.shape(),
                        value.shape(),
                    ));
                }
                info.kind = TensorKind::Initializer(value);
                Ok(())
            }
            _ => Err(GraphError::UnknownTensor(name.to_string())),
        }
    }

    pub fn add_node(&mut self, mut node: NodeDef) -> Result<NodeId, GraphError> {
        let producers = self.graph.producers();
        for output in &node.outputs {
            if producers.contains_key(output) {
                let name = self.graph.tensor_name(*output).unwrap_or_default().to_string();
                return Err(GraphError::DuplicateProducer(name));
            }
        }
        node.name = self.name_gen.unique(&node.name);
        let id = self.graph.next_node_id;
        self.graph.next_node_id += 1;
        log::debug!("inserting node {} ({})", node.name, node.op_type);
        self.graph.nodes.insert(id, node);
        Ok(id)
    }
}

impl Default for GraphMutator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn simple_node(name: &str, inputs: Vec<TensorId>, outputs: Vec<TensorId>) -> NodeDef {
        NodeDef {
            name: name.to_string(),
            op_type: "Identity".to_string(),
            inputs,
            outputs,
            attributes: BTreeMap::new(),
            aliases: vec![],
        }
    }

    #[test]
    fn topological_order_is_deterministic() {
        let mut m = GraphMutator::new();
        let a = m.add_input("a", DType::F32, vec![2]).unwrap();
        let b = m.add_intermediate("b", None, None).unwrap();
        let c = m.add_intermediate("c", None, None).unwrap();
        let d = m.add_intermediate("d", None, None).unwrap();
        m.add_node(simple_node("n0", vec![a], vec![b])).unwrap();
        m.add_node(simple_node("n1", vec![a], vec![c])).unwrap();
        m.add_node(simple_node("n2", vec![b, c], vec![d])).unwrap();
        let g = m.into_inner();
        let order = g.topological_order().unwrap();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn cycle_is_detected() {
        let mut m = GraphMutator::new();
        let a = m.add_intermediate("a", None, None).unwrap();
        let b = m.add_intermediate("b", None, None).unwrap();
        m.add_node(simple_node("fwd", vec![a], vec![b])).unwrap();
        m.add_node(simple_node("back", vec![b], vec![a])).unwrap();
        let g = m.into_inner();
        assert!(matches!(g.verify_acyclic(), Err(GraphError::CycleDetected(_))));
    }

    #[test]
    fn serialization_is_stable_across_a_reload() {
        let mut m = GraphMutator::new();
        let x = m.add_input("x", DType::F32, vec![4]).unwrap();
        let mut prev = x;
        // Enough tensors/nodes that an unordered map would almost surely
        // permute them on the way back out.
        for i in 0..32 {
            let out = m.add_intermediate(&format!("t{i}"), None, None).unwrap();
            m.add_node(simple_node(&format!("n{i}"), vec![prev], vec![out]))
                .unwrap();
            prev = out;
        }
        let g = m.into_inner();

        let mut first = Vec::new();
        g.save_json(&mut first).unwrap();
        let reloaded = Graph::load_json(first.as_slice()).unwrap();
        let mut second = Vec::new();
        reloaded.save_json(&mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut m = GraphMutator::new();
        m.add_input("x", DType::F32, vec![1]).unwrap();
        assert!(matches!(
            m.add_input("x", DType::F32, vec![1]),
            Err(GraphError::DuplicateTensorName(_))
        ));
    }
}
