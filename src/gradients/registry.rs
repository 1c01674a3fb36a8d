//! Operator-to-gradient-formula dispatch.
//!
//! One explicit match table, no trait objects: a formula is a plain function
//! over a [`GradientContext`] plus a flag saying whether the forward node's
//! attributes should be copied onto the emitted nodes. Dedicated `*Grad`
//! kernels mirror their forward attributes; formulas that decompose into
//! primitives set every attribute themselves.

use super::context::GradientContext;
use super::formulas;
use super::GradientBuilderError;

pub type FormulaFn = fn(&mut GradientContext) -> Result<(), GradientBuilderError>;

#[derive(Copy, Clone)]
pub struct GradientFormula {
    pub get_gradient_defs: FormulaFn,
    pub copy_attributes: bool,
}

const fn primitive(f: FormulaFn) -> GradientFormula {
    GradientFormula {
        get_gradient_defs: f,
        copy_attributes: false,
    }
}

const fn mirrored(f: FormulaFn) -> GradientFormula {
    GradientFormula {
        get_gradient_defs: f,
        copy_attributes: true,
    }
}

pub fn gradient_formula(op_type: &str) -> Option<GradientFormula> {
    Some(match op_type {
        "Identity" => primitive(formulas::unary::identity),
        "Neg" => primitive(formulas::unary::neg),
        "Sin" => primitive(formulas::unary::sin),
        "Cos" => primitive(formulas::unary::cos),
        "Exp" => primitive(formulas::unary::exp),
        "Log" => primitive(formulas::unary::log),
        "Sqrt" => primitive(formulas::unary::sqrt),
        "Abs" => primitive(formulas::unary::abs),
        "Tanh" => primitive(formulas::unary::tanh),
        "Sigmoid" => primitive(formulas::unary::sigmoid),
        "Relu" => primitive(formulas::unary::relu),
        "Erf" => primitive(formulas::unary::erf),
        "Gelu" => primitive(formulas::unary::gelu),
        "Scale" => mirrored(formulas::unary::scale),

        "Add" => primitive(formulas::binary::add),
        "Sub" => primitive(formulas::binary::sub),
        "Mul" => primitive(formulas::binary::mul),
        "Div" => primitive(formulas::binary::div),
        "Pow" => primitive(formulas::binary::pow),
        "Sum" => primitive(formulas::binary::sum),

        "MatMul" => primitive(formulas::matmul::matmul),
        "Gemm" => primitive(formulas::matmul::gemm),

        "ReduceSum" => primitive(formulas::reduction::reduce_sum),
        "ReduceMean" => primitive(formulas::reduction::reduce_mean),
        "GlobalAveragePool" => primitive(formulas::reduction::global_average_pool),

        "Reshape" => primitive(formulas::structural::reshape),
        "Flatten" => primitive(formulas::structural::reshape),
        "Squeeze" => primitive(formulas::structural::reshape),
        "Unsqueeze" => primitive(formulas::structural::reshape),
        "Transpose" => primitive(formulas::structural::transpose),
        "Cast" => primitive(formulas::structural::cast),
        "Concat" => primitive(formulas::structural::concat),
        "Split" => primitive(formulas::structural::split),
        "Gather" => primitive(formulas::structural::gather),
        "GatherND" => primitive(formulas::structural::gather_nd),
        "Dropout" => primitive(formulas::structural::dropout),

        "Softmax" => mirrored(formulas::normalization::softmax),
        "LogSoftmax" => mirrored(formulas::normalization::log_softmax),
        "LayerNormalization" => mirrored(formulas::normalization::layer_normalization),
        "BatchNormalization" => mirrored(formulas::normalization::batch_normalization),

        "SoftmaxCrossEntropy" => mirrored(formulas::loss::softmax_cross_entropy),
        "SparseSoftmaxCrossEntropy" => mirrored(formulas::loss::sparse_softmax_cross_entropy),

        "Conv" => mirrored(formulas::conv::conv),
        "MaxPool" => mirrored(formulas::conv::max_pool),
        "AveragePool" => mirrored(formulas::conv::average_pool),

        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_operators_are_registered() {
        for op in ["Add", "MatMul", "Relu", "Softmax", "Conv", "Gemm"] {
            assert!(gradient_formula(op).is_some(), "missing formula for {op}");
        }
        assert!(gradient_formula("NonExistentOp").is_none());
    }

    #[test]
    fn dedicated_kernels_mirror_attributes() {
        assert!(gradient_formula("Softmax").unwrap().copy_attributes);
        assert!(!gradient_formula("Gemm").unwrap().copy_attributes);
    }

    // Mirroring would put the forward ratio/seed (Dropout) or a stale axis
    // (Gather) on backward nodes that define their own attribute sets.
    #[test]
    fn indexing_and_dropout_set_their_own_attributes() {
        for op in ["Gather", "GatherND", "Dropout"] {
            assert!(
                !gradient_formula(op).unwrap().copy_attributes,
                "{op} must not mirror forward attributes"
            );
        }
    }
}
