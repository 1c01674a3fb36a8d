//! Softmax and normalization gradients. These all dispatch to dedicated
//! backward kernels that consume saved forward statistics.

use crate::gradients::context::GradientContext;
use crate::gradients::GradientBuilderError;
use std::collections::BTreeMap;

pub fn softmax(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let y = ctx.output(0).name.clone();
        let g = ctx.emit_simple("SoftmaxGrad", vec![dy, y]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn log_softmax(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let y = ctx.output(0).name.clone();
        let g = ctx.emit_simple("LogSoftmaxGrad", vec![dy, y]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

/// Needs the saved mean and inverse standard deviation from the forward
/// node's second and third outputs; a two-output forward cannot be trained.
pub fn layer_normalization(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.output_count() < 3 {
        return Err(GradientBuilderError::MissingForwardOutput(
            ctx.node_name().to_string(),
            "InvStdDev".to_string(),
        ));
    }
    let dy = ctx.require_output_grad(0)?;
    let x = ctx.input(0).name.clone();
    let scale = ctx.input(1).name.clone();
    let mean = ctx.output(1).name.clone();
    let inv_std = ctx.output(2).name.clone();

    let dx = ctx.intermediate();
    let dscale = ctx.intermediate();
    let dbias = ctx.intermediate();
    ctx.emit(
        "LayerNormalizationGrad",
        vec![dy, x, scale, mean, inv_std],
        vec![dx.clone(), dscale.clone(), dbias.clone()],
        BTreeMap::new(),
    );
    for (idx, grad) in [dx, dscale, dbias].into_iter().enumerate() {
        if idx < ctx.input_count() && ctx.needs_input_grad(idx) {
            ctx.finish_input_grad(idx, grad);
        }
    }
    Ok(())
}

/// Training-mode BatchNormalization saves batch statistics as outputs 3 and
/// 4; fall back to the running estimates when they are absent.
pub fn batch_normalization(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    let dy = ctx.require_output_grad(0)?;
    let x = ctx.input(0).name.clone();
    let scale = ctx.input(1).name.clone();
    let saved_mean = if ctx.output_count() > 3 {
        ctx.output(3).name.clone()
    } else {
        ctx.input(3).name.clone()
    };
    let saved_var = if ctx.output_count() > 4 {
        ctx.output(4).name.clone()
    } else {
        ctx.input(4).name.clone()
    };

    let dx = ctx.intermediate();
    let dscale = ctx.intermediate();
    let dbias = ctx.intermediate();
    ctx.emit(
        "BatchNormalizationGrad",
        vec![dy, x, scale, saved_mean, saved_var],
        vec![dx.clone(), dscale.clone(), dbias.clone()],
        BTreeMap::new(),
    );
    for (idx, grad) in [dx, dscale, dbias].into_iter().enumerate() {
        if ctx.needs_input_grad(idx) {
            ctx.finish_input_grad(idx, grad);
        }
    }
    Ok(())
}
