//! Broadcasting binary operators. Every branch reduces its raw gradient back
//! to the recorded input shape with `reduce_broadcast`, which derives the
//! summed axes from recorded shapes rather than re-running broadcast rules.

use crate::gradients::context::GradientContext;
use crate::gradients::GradientBuilderError;
use crate::tensor::TensorValue;

pub fn add(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    let dy = ctx.require_output_grad(0)?;
    let y_shape = ctx.require_shape(&ctx.output(0).clone())?;
    for idx in 0..2 {
        if !ctx.needs_input_grad(idx) {
            continue;
        }
        let x = ctx.input(idx).clone();
        let x_shape = ctx.require_shape(&x)?;
        let g = ctx.reduce_broadcast(dy.clone(), &y_shape, &x_shape);
        ctx.finish_input_grad(idx, g);
    }
    Ok(())
}

pub fn sub(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    let dy = ctx.require_output_grad(0)?;
    let y_shape = ctx.require_shape(&ctx.output(0).clone())?;
    for idx in 0..2 {
        if !ctx.needs_input_grad(idx) {
            continue;
        }
        let x = ctx.input(idx).clone();
        let x_shape = ctx.require_shape(&x)?;
        let mut g = dy.clone();
        if idx == 1 {
            g = ctx.emit_simple("Neg", vec![g]);
        }
        let g = ctx.reduce_broadcast(g, &y_shape, &x_shape);
        ctx.finish_input_grad(idx, g);
    }
    Ok(())
}

pub fn mul(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    let dy = ctx.require_output_grad(0)?;
    let y_shape = ctx.require_shape(&ctx.output(0).clone())?;
    for idx in 0..2 {
        if !ctx.needs_input_grad(idx) {
            continue;
        }
        let x = ctx.input(idx).clone();
        let other = ctx.input(1 - idx).name.clone();
        let x_shape = ctx.require_shape(&x)?;
        let g = ctx.emit_simple("Mul", vec![dy.clone(), other]);
        let g = ctx.reduce_broadcast(g, &y_shape, &x_shape);
        ctx.finish_input_grad(idx, g);
    }
    Ok(())
}

pub fn div(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    let dy = ctx.require_output_grad(0)?;
    let y = ctx.output(0).clone();
    let y_shape = ctx.require_shape(&y)?;
    let b = ctx.input(1).name.clone();
    if ctx.needs_input_grad(0) {
        let a_shape = ctx.require_shape(&ctx.input(0).clone())?;
        let g = ctx.emit_simple("Div", vec![dy.clone(), b.clone()]);
        let g = ctx.reduce_broadcast(g, &y_shape, &a_shape);
        ctx.finish_input_grad(0, g);
    }
    if ctx.needs_input_grad(1) {
        // dB = -dY * (A / B) / B = -dY * Y / B
        let b_shape = ctx.require_shape(&ctx.input(1).clone())?;
        let dy_y = ctx.emit_simple("Mul", vec![dy, y.name]);
        let over_b = ctx.emit_simple("Div", vec![dy_y, b]);
        let g = ctx.emit_simple("Neg", vec![over_b]);
        let g = ctx.reduce_broadcast(g, &y_shape, &b_shape);
        ctx.finish_input_grad(1, g);
    }
    Ok(())
}

/// Power rule w.r.t. the base only: d(A^e) = e * A^(e-1) dA. The gradient
/// w.r.t. a non-constant exponent is not implemented.
pub fn pow(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(1) {
        return Err(GradientBuilderError::NonDifferentiableArgument(
            ctx.node_name().to_string(),
            ctx.input(1).name.clone(),
        ));
    }
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let y_shape = ctx.require_shape(&ctx.output(0).clone())?;
        let a = ctx.input(0).name.clone();
        let e = ctx.input(1).name.clone();
        let a_shape = ctx.require_shape(&ctx.input(0).clone())?;
        let one = ctx.constant(TensorValue::scalar_f32(1.0));
        let e_minus_1 = ctx.emit_simple("Sub", vec![e.clone(), one]);
        let a_pow = ctx.emit_simple("Pow", vec![a, e_minus_1]);
        let scaled = ctx.emit_simple("Mul", vec![a_pow, e]);
        let g = ctx.emit_simple("Mul", vec![dy, scaled]);
        let g = ctx.reduce_broadcast(g, &y_shape, &a_shape);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

/// N-ary Sum: the gradient passes through to every addend.
pub fn sum(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    let dy = ctx.require_output_grad(0)?;
    let y_shape = ctx.require_shape(&ctx.output(0).clone())?;
    for idx in 0..ctx.input_count() {
        if !ctx.needs_input_grad(idx) {
            continue;
        }
        let x_shape = ctx.require_shape(&ctx.input(idx).clone())?;
        let g = ctx.reduce_broadcast(dy.clone(), &y_shape, &x_shape);
        ctx.finish_input_grad(idx, g);
    }
    Ok(())
}
