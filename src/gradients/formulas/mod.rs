//! Per-operator gradient formulas. Each function reads the forward node
//! snapshot from the [`GradientContext`](super::context::GradientContext) and
//! emits the backward nodes for whichever inputs require a gradient.

pub mod binary;
pub mod conv;
pub mod loss;
pub mod matmul;
pub mod normalization;
pub mod reduction;
pub mod structural;
pub mod unary;

use crate::graph::Attribute;
use std::collections::BTreeMap;

pub(crate) fn single_attr(key: &str, value: Attribute) -> BTreeMap<String, Attribute> {
    let mut attrs = BTreeMap::new();
    attrs.insert(key.to_string(), value);
    attrs
}

pub(crate) fn shape_to_ints(shape: &[usize]) -> Vec<i64> {
    shape.iter().map(|x| *x as i64).collect()
}
