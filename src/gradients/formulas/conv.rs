//! Convolution and pooling gradients, all dedicated backward kernels with
//! the forward attributes (kernel shape, strides, pads, ...) mirrored on.

use super::{shape_to_ints, single_attr};
use crate::gradients::context::GradientContext;
use crate::gradients::GradientBuilderError;
use crate::graph::Attribute;
use std::collections::BTreeMap;

/// Single ConvGrad node with positional outputs [dX, dW, dB]. The kernel
/// computes the weight gradient whether or not it is consumed; the unused
/// positions stay dangling intermediates.
pub fn conv(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    let dy = ctx.require_output_grad(0)?;
    let x = ctx.input(0).name.clone();
    let w = ctx.input(1).name.clone();

    let mut outputs = vec![ctx.intermediate(), ctx.intermediate()];
    if ctx.input_count() > 2 {
        outputs.push(ctx.intermediate());
    }
    ctx.emit("ConvGrad", vec![dy, x, w], outputs.clone(), BTreeMap::new());
    for (idx, grad) in outputs.into_iter().enumerate() {
        if ctx.needs_input_grad(idx) {
            ctx.finish_input_grad(idx, grad);
        }
    }
    Ok(())
}

pub fn max_pool(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x = ctx.input(0).name.clone();
        let g = ctx.emit_simple("MaxPoolGrad", vec![dy, x]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn average_pool(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x_shape = ctx.require_shape(&ctx.input(0).clone())?;
        let g = ctx.emit_with_attrs(
            "AveragePoolGrad",
            vec![dy],
            single_attr("input_shape", Attribute::Ints(shape_to_ints(&x_shape))),
        );
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}
