use crate::dtype::{DType, DTypeError, DTypeOfPrimitive};
use half::{bf16, f16};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TensorValueError {
    #[error(transparent)]
    DTypeError(#[from] DTypeError),
    #[error("Shape {0:?} does not match {1} elements")]
    ShapeMismatch(Vec<usize>, usize),
}

/// A concrete tensor value held by the graph (initializers, seed constants)
/// and by the host-side optimizer step kernels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TensorValue {
    F64(ArrayD<f64>),
    F32(ArrayD<f32>),
    BF16(ArrayD<bf16>),
    F16(ArrayD<f16>),
    I64(ArrayD<i64>),
    I32(ArrayD<i32>),
    U8(ArrayD<u8>),
    BOOL(ArrayD<bool>),
}

impl TensorValue {
    pub fn dtype(&self) -> DType {
        match self {
            TensorValue::F64(_) => DType::F64,
            TensorValue::F32(_) => DType::F32,
            TensorValue::BF16(_) => DType::BF16,
            TensorValue::F16(_) => DType::F16,
            TensorValue::I64(_) => DType::I64,
            TensorValue::I32(_) => DType::I32,
            TensorValue::U8(_) => DType::U8,
            TensorValue::BOOL(_) => DType::BOOL,
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            TensorValue::F64(x) => x.shape().to_vec(),
            TensorValue::F32(x) => x.shape().to_vec(),
            TensorValue::BF16(x) => x.shape().to_vec(),
            TensorValue::F16(x) => x.shape().to_vec(),
            TensorValue::I64(x) => x.shape().to_vec(),
            TensorValue::I32(x) => x.shape().to_vec(),
            TensorValue::U8(x) => x.shape().to_vec(),
            TensorValue::BOOL(x) => x.shape().to_vec(),
        }
    }

    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        let ix = IxDyn(shape);
        match dtype {
            DType::F64 => TensorValue::F64(ArrayD::zeros(ix)),
            DType::F32 => TensorValue::F32(ArrayD::zeros(ix)),
            DType::BF16 => TensorValue::BF16(ArrayD::from_elem(ix, bf16::ZERO)),
            DType::F16 => TensorValue::F16(ArrayD::from_elem(ix, f16::ZERO)),
            DType::I64 => TensorValue::I64(ArrayD::zeros(ix)),
            DType::I32 => TensorValue::I32(ArrayD::zeros(ix)),
            DType::U8 => TensorValue::U8(ArrayD::zeros(ix)),
            DType::BOOL => TensorValue::BOOL(ArrayD::from_elem(ix, false)),
        }
    }

    /// Float tensor filled with a single value, in the requested precision.
    pub fn filled(dtype: DType, shape: &[usize], value: f32) -> Result<Self, TensorValueError> {
        let ix = IxDyn(shape);
        Ok(match dtype {
            DType::F64 => TensorValue::F64(ArrayD::from_elem(ix, value as f64)),
            DType::F32 => TensorValue::F32(ArrayD::from_elem(ix, value)),
            DType::BF16 => TensorValue::BF16(ArrayD::from_elem(ix, bf16::from_f32(value))),
            DType::F16 => TensorValue::F16(ArrayD::from_elem(ix, f16::from_f32(value))),
            _ => Err(DTypeError::UnsupportedDType(dtype))?,
        })
    }

    pub fn scalar_f32(value: f32) -> Self {
        TensorValue::F32(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn scalar_i64(value: i64) -> Self {
        TensorValue::I64(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn from_vec_shape<T: TensorValuePrimitive>(
        values: Vec<T>,
        shape: &[usize],
    ) -> Result<Self, TensorValueError> {
        let count = shape.iter().product::<usize>();
        if values.len() != count {
            return Err(TensorValueError::ShapeMismatch(shape.to_vec(), values.len()));
        }
        let arr = ArrayD::from_shape_vec(IxDyn(shape), values)
            .map_err(|_| TensorValueError::ShapeMismatch(shape.to_vec(), count))?;
        Ok(T::wrap(arr))
    }

    /// Widen to an f32 array. Lossless for every float dtype narrower than f32.
    pub fn to_f32_array(&self) -> Result<ArrayD<f32>, TensorValueError> {
        Ok(match self {
            TensorValue::F64(x) => x.mapv(|v| v as f32),
            TensorValue::F32(x) => x.clone(),
            TensorValue::BF16(x) => x.mapv(|v| v.to_f32()),
            TensorValue::F16(x) => x.mapv(|v| v.to_f32()),
            TensorValue::I64(x) => x.mapv(|v| v as f32),
            TensorValue::I32(x) => x.mapv(|v| v as f32),
            TensorValue::U8(x) => x.mapv(|v| v as f32),
            TensorValue::BOOL(x) => x.mapv(|v| if v { 1.0 } else { 0.0 }),
        })
    }

    /// Narrow an f32 array into the requested float precision.
    pub fn from_f32_array(values: ArrayD<f32>, dtype: DType) -> Result<Self, TensorValueError> {
        Ok(match dtype {
            DType::F64 => TensorValue::F64(values.mapv(|v| v as f64)),
            DType::F32 => TensorValue::F32(values),
            DType::BF16 => TensorValue::BF16(values.mapv(bf16::from_f32)),
            DType::F16 => TensorValue::F16(values.mapv(f16::from_f32)),
            _ => Err(DTypeError::UnsupportedDType(dtype))?,
        })
    }

    pub fn cast(&self, dtype: DType) -> Result<Self, TensorValueError> {
        if dtype == self.dtype() {
            return Ok(self.clone());
        }
        Self::from_f32_array(self.to_f32_array()?, dtype)
    }

    /// True when any element of a float tensor is NaN or infinite. Used by the
    /// host-side step logic to decide the DoUpdate gate.
    pub fn has_non_finite(&self) -> bool {
        match self {
            TensorValue::F64(x) => x.iter().any(|v| !v.is_finite()),
            TensorValue::F32(x) => x.iter().any(|v| !v.is_finite()),
            TensorValue::BF16(x) => x.iter().any(|v| !v.is_finite()),
            TensorValue::F16(x) => x.iter().any(|v| !v.is_finite()),
            _ => false,
        }
    }
}

pub trait TensorValuePrimitive: DTypeOfPrimitive + Clone {
    fn wrap(values: ArrayD<Self>) -> TensorValue;
}

macro_rules! impl_tensor_value_primitive {
    ($ty:ty, $variant:ident) => {
        impl TensorValuePrimitive for $ty {
            fn wrap(values: ArrayD<Self>) -> TensorValue {
                TensorValue::$variant(values)
            }
        }
    };
}

impl_tensor_value_primitive!(f64, F64);
impl_tensor_value_primitive!(f32, F32);
impl_tensor_value_primitive!(bf16, BF16);
impl_tensor_value_primitive!(f16, F16);
impl_tensor_value_primitive!(i64, I64);
impl_tensor_value_primitive!(i32, I32);
impl_tensor_value_primitive!(u8, U8);
impl_tensor_value_primitive!(bool, BOOL);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_round_trips_through_f16() {
        let t = TensorValue::filled(DType::F16, &[2, 2], 1.5).unwrap();
        assert_eq!(t.dtype(), DType::F16);
        let back = t.to_f32_array().unwrap();
        assert!(back.iter().all(|v| *v == 1.5));
    }

    #[test]
    fn from_vec_shape_rejects_bad_shape() {
        let r = TensorValue::from_vec_shape(vec![1.0f32, 2.0], &[3]);
        assert!(r.is_err());
    }
}
