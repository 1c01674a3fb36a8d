//! Host-side semantics of the GradientAccumulator and ZeroGradient nodes.
//! The buffer keeps full precision even when incoming micro-batch gradients
//! arrive in f16.

use crate::tensor::{TensorValue, TensorValueError};

#[derive(Debug, thiserror::Error)]
pub enum AccumulationError {
    #[error("Buffer/gradient shape mismatch: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),
    #[error(transparent)]
    TensorValue(#[from] TensorValueError),
}

/// Running sum of micro-batch gradients for one weight.
#[derive(Clone, Debug)]
pub struct GradientAccumulator {
    buffer: TensorValue,
}

impl GradientAccumulator {
    pub fn new(buffer: TensorValue) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &TensorValue {
        &self.buffer
    }

    /// buffer <- buffer + gradient, widening to f32 for the addition.
    pub fn accumulate(&mut self, gradient: &TensorValue) -> Result<(), AccumulationError> {
        if self.buffer.shape() != gradient.shape() {
            return Err(AccumulationError::ShapeMismatch(
                self.buffer.shape(),
                gradient.shape(),
            ));
        }
        let sum = self.buffer.to_f32_array()? + gradient.to_f32_array()?;
        self.buffer = TensorValue::from_f32_array(sum, self.buffer.dtype())?;
        Ok(())
    }

    /// Take the accumulated gradient and reset the buffer to zero, as the
    /// ZeroGradient node does after the boundary update.
    pub fn take(&mut self) -> TensorValue {
        let out = self.buffer.clone();
        self.buffer = TensorValue::zeros(out.dtype(), &out.shape());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    #[test]
    fn accumulates_and_resets() {
        let mut acc = GradientAccumulator::new(TensorValue::zeros(DType::F32, &[3]));
        acc.accumulate(&TensorValue::from_vec_shape(vec![1.0f32, 2.0, 3.0], &[3]).unwrap())
            .unwrap();
        acc.accumulate(&TensorValue::from_vec_shape(vec![4.0f32, 5.0, 6.0], &[3]).unwrap())
            .unwrap();
        let total = acc.take().to_f32_array().unwrap();
        assert_eq!(total.as_slice().unwrap(), &[5.0, 7.0, 9.0]);
        assert_eq!(
            acc.buffer().to_f32_array().unwrap().as_slice().unwrap(),
            &[0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn half_precision_gradients_widen() {
        let mut acc = GradientAccumulator::new(TensorValue::zeros(DType::F32, &[2]));
        let g = TensorValue::filled(DType::F16, &[2], 0.25).unwrap();
        acc.accumulate(&g).unwrap();
        acc.accumulate(&g).unwrap();
        assert_eq!(acc.buffer().dtype(), DType::F32);
        assert_eq!(
            acc.buffer().to_f32_array().unwrap().as_slice().unwrap(),
            &[0.5, 0.5]
        );
    }

    #[test]
    fn shape_mismatch_rejected() {
        let mut acc = GradientAccumulator::new(TensorValue::zeros(DType::F32, &[3]));
        let g = TensorValue::zeros(DType::F32, &[2]);
        assert!(matches!(
            acc.accumulate(&g),
            Err(AccumulationError::ShapeMismatch(_, _))
        ));
    }
}
