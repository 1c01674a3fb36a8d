//! Elementwise single-input operators. Shapes never change across these, so
//! no broadcast reduction is involved.

use crate::gradients::context::GradientContext;
use crate::gradients::GradientBuilderError;

pub fn identity(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        ctx.finish_input_grad(0, dy);
    }
    Ok(())
}

pub fn neg(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let g = ctx.emit_simple("Neg", vec![dy]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn sin(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x = ctx.input(0).name.clone();
        let cos_x = ctx.emit_simple("Cos", vec![x]);
        let g = ctx.emit_simple("Mul", vec![dy, cos_x]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn cos(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x = ctx.input(0).name.clone();
        let sin_x = ctx.emit_simple("Sin", vec![x]);
        let neg_sin = ctx.emit_simple("Neg", vec![sin_x]);
        let g = ctx.emit_simple("Mul", vec![dy, neg_sin]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

// d(e^x) = e^x dx, and e^x is already materialized as the forward output.
pub fn exp(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let y = ctx.output(0).name.clone();
        let g = ctx.emit_simple("Mul", vec![dy, y]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn log(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x = ctx.input(0).name.clone();
        let g = ctx.emit_simple("Div", vec![dy, x]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn sqrt(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let y = ctx.output(0).name.clone();
        let g = ctx.emit_simple("SqrtGrad", vec![dy, y]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn abs(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x = ctx.input(0).name.clone();
        let sign = ctx.emit_simple("Sign", vec![x]);
        let g = ctx.emit_simple("Mul", vec![dy, sign]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn tanh(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let y = ctx.output(0).name.clone();
        let g = ctx.emit_simple("TanhGrad", vec![dy, y]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn sigmoid(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let y = ctx.output(0).name.clone();
        let g = ctx.emit_simple("SigmoidGrad", vec![dy, y]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn relu(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let y = ctx.output(0).name.clone();
        let g = ctx.emit_simple("ReluGrad", vec![dy, y]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn erf(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x = ctx.input(0).name.clone();
        let g = ctx.emit_simple("ErfGrad", vec![dy, x]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn gelu(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x = ctx.input(0).name.clone();
        let g = ctx.emit_simple("GeluGrad", vec![dy, x]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

// Scale is linear; its gradient is the same scaling (attribute mirrored).
pub fn scale(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let g = ctx.emit_simple("Scale", vec![dy]);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}
