//! Data-parallel training support: process-group description, collective
//! node emission, and the ZeRO weight partition.
//!
//! Collectives are graph nodes like everything else; the external scheduler
//! binds them to whatever transport it has. Every rank must build a
//! structurally identical graph, which is why all iteration here is over
//! name-sorted collections.

use crate::dtype::DType;
use crate::graph::{Attribute, GraphError, GraphMutator, NodeDef, TensorId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum DistributedError {
    #[error("Invalid process group: rank {rank} out of world size {size}")]
    InvalidWorldConfig { rank: usize, size: usize },
    #[error("Unknown tensor \"{0}\"")]
    UnknownTensor(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Identity of this process within the training job.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpiContext {
    pub world_rank: usize,
    pub world_size: usize,
    pub local_rank: usize,
    pub local_size: usize,
}

impl MpiContext {
    pub fn single_process() -> Self {
        Self {
            world_rank: 0,
            world_size: 1,
            local_rank: 0,
            local_size: 1,
        }
    }

    pub fn new(world_rank: usize, world_size: usize) -> Result<Self, DistributedError> {
        if world_size == 0 || world_rank >= world_size {
            return Err(DistributedError::InvalidWorldConfig {
                rank: world_rank,
                size: world_size,
            });
        }
        Ok(Self {
            world_rank,
            world_size,
            local_rank: world_rank,
            local_size: world_size,
        })
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

/// Assign each weight to the rank that will own its optimizer state under
/// ZeRO. Greedy least-loaded by element count, walking weights in name order;
/// ties go to the lowest rank. Deterministic across ranks by construction.
pub fn partition_weights(
    weight_elements: &BTreeMap<String, usize>,
    world_size: usize,
) -> BTreeMap<String, usize> {
    let mut load = vec![0usize; world_size.max(1)];
    let mut assignment = BTreeMap::new();
    for (name, elements) in weight_elements {
        let owner = load
            .iter()
            .enumerate()
            .min_by_key(|(rank, total)| (**total, *rank))
            .map(|(rank, _)| rank)
            .unwrap_or(0);
        load[owner] += *elements;
        assignment.insert(name.clone(), owner);
    }
    assignment
}

fn emit_collective(
    m: &mut GraphMutator,
    op_type: &str,
    input: &str,
    attributes: BTreeMap<String, Attribute>,
) -> Result<String, DistributedError> {
    let in_id = m
        .tensor_id_by_name(input)
        .ok_or_else(|| DistributedError::UnknownTensor(input.to_string()))?;
    let out = m.name_gen().unique(&format!("{input}_{op_type}_Out"));
    let out_id = m.get_or_add_tensor(&out)?;
    copy_meta(m, in_id, out_id)?;
    m.add_node(NodeDef {
        name: format!("{input}_{op_type}"),
        op_type: op_type.to_string(),
        inputs: vec![in_id],
        outputs: vec![out_id],
        attributes,
        aliases: vec![],
    })?;
    Ok(out)
}

fn copy_meta(m: &mut GraphMutator, from: TensorId, to: TensorId) -> Result<(), DistributedError> {
    let info = m
        .graph()
        .get_tensor(from)
        .cloned()
        .ok_or_else(|| DistributedError::UnknownTensor(format!("#{from}")))?;
    m.refine_tensor(to, info.dtype, info.shape)?;
    Ok(())
}

/// Sum a gradient across ranks and divide by the world size. With
/// `reduce_in_half` the tensor crosses the wire in f16 and is cast back.
pub fn all_reduce_mean(
    m: &mut GraphMutator,
    gradient: &str,
    world_size: usize,
    reduce_in_half: bool,
) -> Result<String, DistributedError> {
    let original_dtype = m
        .tensor_id_by_name(gradient)
        .and_then(|id| m.graph().get_tensor(id))
        .and_then(|t| t.dtype);

    let mut current = gradient.to_string();
    let needs_cast = reduce_in_half && original_dtype == Some(DType::F32);
    if needs_cast {
        current = emit_cast(m, &current, DType::F16)?;
    }
    current = emit_collective(m, "AllReduceSum", &current, BTreeMap::new())?;
    let mut attrs = BTreeMap::new();
    attrs.insert(
        "scale".to_string(),
        Attribute::Float(1.0 / world_size as f32),
    );
    current = emit_collective(m, "Scale", &current, attrs)?;
    if needs_cast {
        current = emit_cast(m, &current, DType::F32)?;
    }
    Ok(current)
}

/// Each rank keeps the shard of the summed gradient it owns under ZeRO.
pub fn reduce_scatter(m: &mut GraphMutator, gradient: &str) -> Result<String, DistributedError> {
    emit_collective(m, "ReduceScatter", gradient, BTreeMap::new())
}

/// Broadcast a tensor from the owning rank to everyone else.
pub fn broadcast(
    m: &mut GraphMutator,
    tensor: &str,
    root_rank: usize,
) -> Result<String, DistributedError> {
    let mut attrs = BTreeMap::new();
    attrs.insert("root".to_string(), Attribute::Int(root_rank as i64));
    emit_collective(m, "Broadcast", tensor, attrs)
}

fn emit_cast(
    m: &mut GraphMutator,
    input: &str,
    to: DType,
) -> Result<String, DistributedError> {
    let in_id = m
        .tensor_id_by_name(input)
        .ok_or_else(|| DistributedError::UnknownTensor(input.to_string()))?;
    let shape = m.graph().get_tensor(in_id).and_then(|t| t.shape.clone());
    let out = m.name_gen().unique(&format!("{input}_{to}"));
    let out_id = m.get_or_add_tensor(&out)?;
    m.refine_tensor(out_id, Some(to), shape)?;
    let mut attrs = BTreeMap::new();
    attrs.insert("to".to_string(), Attribute::String(to.to_string()));
    m.add_node(NodeDef {
        name: format!("{input}_cast_{to}"),
        op_type: "Cast".to_string(),
        inputs: vec![in_id],
        outputs: vec![out_id],
        attributes: attrs,
        aliases: vec![],
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_is_balanced_and_deterministic() {
        let mut weights = BTreeMap::new();
        weights.insert("a".to_string(), 100);
        weights.insert("b".to_string(), 10);
        weights.insert("c".to_string(), 10);
        weights.insert("d".to_string(), 80);
        let p = partition_weights(&weights, 2);
        // a -> rank 0, b -> rank 1 (lighter), c -> rank 1, d -> rank 1
        assert_eq!(p["a"], 0);
        assert_eq!(p["b"], 1);
        assert_eq!(p["c"], 1);
        assert_eq!(p["d"], 1);
        assert_eq!(p, partition_weights(&weights, 2));
    }

    #[test]
    fn invalid_process_group_rejected() {
        assert!(MpiContext::new(2, 2).is_err());
        assert!(MpiContext::new(0, 0).is_err());
        assert!(MpiContext::new(1, 4).is_ok());
    }
}
