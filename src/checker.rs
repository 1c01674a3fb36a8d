//! Finite-difference validation of built gradient graphs. The checker
//! attaches gradients to a copy of the forward graph, evaluates them with the
//! reference interpreter, and compares each weight gradient against central
//! differences of the loss.

use crate::dtype::DType;
use crate::gradients::{GradientBuilderError, GradientGraphBuilder, GradientGraphConfig};
use crate::graph::{Graph, GraphError, GraphMutator, TensorKind};
use crate::interpreter::{Interpreter, InterpreterError};
use crate::tensor::{TensorValue, TensorValueError};
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, thiserror::Error)]
pub enum GradientCheckError {
    #[error("Weight \"{0}\" has no stored value to perturb")]
    MissingWeightValue(String),
    #[error("Loss \"{0}\" did not evaluate to a scalar")]
    NonScalarLoss(String),
    #[error(transparent)]
    Gradient(#[from] GradientBuilderError),
    #[error(transparent)]
    Interpreter(#[from] InterpreterError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Tensor(#[from] TensorValueError),
}

/// Worst observed error per weight, normalized by `max(1, |numeric|)`.
#[derive(Clone, Debug, Default)]
pub struct CheckReport {
    pub max_error: f32,
    pub per_weight: BTreeMap<String, f32>,
}

pub struct GradientChecker {
    epsilon: f32,
}

impl Default for GradientChecker {
    fn default() -> Self {
        Self { epsilon: 1e-3 }
    }
}

impl GradientChecker {
    pub fn new(epsilon: f32) -> Self {
        Self { epsilon }
    }

    /// Compare analytic weight gradients of `graph` against central
    /// differences. `config` should leave loss scaling off so both sides see
    /// the same loss.
    pub fn check(
        &self,
        graph: &Graph,
        config: GradientGraphConfig,
        feeds: &HashMap<String, TensorValue>,
    ) -> Result<CheckReport, GradientCheckError> {
        let loss_name = config.loss_name.clone();
        let weight_names: Vec<String> = config.weight_names.iter().cloned().collect();
        let mut m = GraphMutator::from_graph(graph.clone());
        let result = GradientGraphBuilder::new(config).build(&mut m)?;

        let grad_names: Vec<&str> = weight_names
            .iter()
            .filter_map(|w| result.weight_gradients.get(w).map(String::as_str))
            .collect();
        let analytic = Interpreter::new(m.graph()).run(feeds, &grad_names)?;
        let analytic: HashMap<&str, ArrayD<f32>> = grad_names
            .iter()
            .copied()
            .zip(analytic.iter().map(TensorValue::to_f32_array))
            .map(|(n, a)| Ok((n, a?)))
            .collect::<Result<_, TensorValueError>>()?;

        let mut report = CheckReport::default();
        for weight in &weight_names {
            let Some(grad_name) = result.weight_gradients.get(weight) else {
                log::warn!("weight {weight} has no gradient, skipping");
                continue;
            };
            let analytic = &analytic[grad_name.as_str()];
            let baseline = self.weight_value(m.graph(), weight)?;
            let dtype = baseline.dtype();
            let flat: Vec<f32> = baseline.to_f32_array()?.iter().copied().collect();
            let shape = baseline.shape();

            let mut worst = 0.0f32;
            for i in 0..flat.len() {
                let mut plus = flat.clone();
                plus[i] += self.epsilon;
                let mut minus = flat.clone();
                minus[i] -= self.epsilon;
                let loss_plus = self.loss_at(&mut m, weight, plus, &shape, dtype, feeds, &loss_name)?;
                let loss_minus =
                    self.loss_at(&mut m, weight, minus, &shape, dtype, feeds, &loss_name)?;
                let numeric = (loss_plus - loss_minus) / (2.0 * self.epsilon);
                let got = analytic.as_slice().map(|s| s[i]).unwrap_or_else(|| {
                    analytic.iter().nth(i).copied().unwrap_or(f32::NAN)
                });
                let error = (got - numeric).abs() / numeric.abs().max(1.0);
                worst = worst.max(error);
            }
            m.set_initializer_value(weight, baseline)?;
            report.max_error = report.max_error.max(worst);
            report.per_weight.insert(weight.clone(), worst);
        }
        Ok(report)
    }

    fn weight_value(&self, graph: &Graph, name: &str) -> Result<TensorValue, GradientCheckError> {
        graph
            .tensors()
            .find_map(|(_, t)| match (&t.kind, t.name == name) {
                (TensorKind::Initializer(v), true) => Some(v.clone()),
                _ => None,
            })
            .ok_or_else(|| GradientCheckError::MissingWeightValue(name.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    fn loss_at(
        &self,
        m: &mut GraphMutator,
        weight: &str,
        values: Vec<f32>,
        shape: &[usize],
        dtype: DType,
        feeds: &HashMap<String, TensorValue>,
        loss_name: &str,
    ) -> Result<f32, GradientCheckError> {
        let perturbed = TensorValue::from_f32_array(
            ArrayD::from_shape_vec(ndarray::IxDyn(shape), values)
                .map_err(|_| GradientCheckError::MissingWeightValue(weight.to_string()))?,
            dtype,
        )?;
        m.set_initializer_value(weight, perturbed)?;
        let out = Interpreter::new(m.graph()).run(feeds, &[loss_name])?;
        let loss = out[0].to_f32_array()?;
        loss.iter()
            .next()
            .copied()
            .filter(|_| loss.len() == 1)
            .ok_or_else(|| GradientCheckError::NonScalarLoss(loss_name.to_string()))
    }
}

/// Uniform random tensor for checker fixtures, deterministic under a seeded
/// generator.
pub fn random_tensor(
    rng: &mut StdRng,
    dtype: DType,
    shape: &[usize],
    low: f32,
    high: f32,
) -> Result<TensorValue, TensorValueError> {
    let count: usize = shape.iter().product();
    let values: Vec<f32> = (0..count).map(|_| rng.gen_range(low..high)).collect();
    TensorValue::from_f32_array(ArrayD::from_shape_vec(ndarray::IxDyn(shape), values).expect("count matches shape"), dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn random_tensor_is_deterministic_per_seed() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        let x = random_tensor(&mut a, DType::F32, &[2, 3], -1.0, 1.0).unwrap();
        let y = random_tensor(&mut b, DType::F32, &[2, 3], -1.0, 1.0).unwrap();
        assert_eq!(
            x.to_f32_array().unwrap(),
            y.to_f32_array().unwrap()
        );
    }
}
