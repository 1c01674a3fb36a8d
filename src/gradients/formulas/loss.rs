//! Cross-entropy loss gradients. Each forward loss op emits its log-prob or
//! prob tensor as a second output precisely so the backward kernel can reuse
//! it here. The reduction attribute is mirrored from the forward node.

use crate::gradients::context::GradientContext;
use crate::gradients::GradientBuilderError;
use std::collections::BTreeMap;

pub fn softmax_cross_entropy(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.output_count() < 2 {
        return Err(GradientBuilderError::MissingForwardOutput(
            ctx.node_name().to_string(),
            "log_prob".to_string(),
        ));
    }
    if ctx.needs_input_grad(0) {
        let d_loss = ctx.require_output_grad(0)?;
        let log_prob = ctx.output(1).name.clone();
        let labels = ctx.input(1).name.clone();
        let g = ctx.emit_simple("SoftmaxCrossEntropyGrad", vec![d_loss, log_prob, labels]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn sparse_softmax_cross_entropy(
    ctx: &mut GradientContext,
) -> Result<(), GradientBuilderError> {
    if ctx.output_count() < 2 {
        return Err(GradientBuilderError::MissingForwardOutput(
            ctx.node_name().to_string(),
            "prob".to_string(),
        ));
    }
    if ctx.needs_input_grad(0) {
        let d_loss = ctx.require_output_grad(0)?;
        let prob = ctx.output(1).name.clone();
        let labels = ctx.input(1).name.clone();
        let mut inputs = vec![d_loss, prob, labels];
        if ctx.input_count() > 2 {
            // Optional per-sample weight tensor.
            inputs.push(ctx.input(2).name.clone());
        }
        let out = ctx.intermediate();
        ctx.emit(
            "SparseSoftmaxCrossEntropyGrad",
            inputs,
            vec![out.clone()],
            BTreeMap::new(),
        );
        ctx.finish_input_grad(0, out);
    }
    Ok(())
}
