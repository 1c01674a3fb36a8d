//! MatMul and Gemm gradients. Batched MatMul follows the usual transpose
//! identities, with broadcast batch dimensions summed back out using the
//! recorded operand shapes.

use super::single_attr;
use crate::gradients::context::GradientContext;
use crate::gradients::GradientBuilderError;
use crate::graph::Attribute;

fn transpose_last_two(ctx: &mut GradientContext, tensor: String, rank: usize) -> String {
    let mut perm: Vec<i64> = (0..rank as i64).collect();
    perm.swap(rank - 2, rank - 1);
    ctx.emit_with_attrs("Transpose", vec![tensor], single_attr("perm", Attribute::Ints(perm)))
}

fn scale_by(ctx: &mut GradientContext, tensor: String, factor: f32) -> String {
    if factor == 1.0 {
        tensor
    } else {
        ctx.emit_with_attrs("Scale", vec![tensor], single_attr("scale", Attribute::Float(factor)))
    }
}

pub fn matmul(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    let dy = ctx.require_output_grad(0)?;
    let a = ctx.input(0).clone();
    let b = ctx.input(1).clone();
    let a_shape = ctx.require_shape(&a)?;
    let b_shape = ctx.require_shape(&b)?;
    let y_shape = ctx.require_shape(&ctx.output(0).clone())?;
    if a_shape.len() < 2 || b_shape.len() < 2 {
        // 1-D operands are promoted by the runtime; gradients for them are not.
        return Err(GradientBuilderError::MissingShape(
            ctx.node_name().to_string(),
            if a_shape.len() < 2 { a.name } else { b.name },
        ));
    }

    if ctx.needs_input_grad(0) {
        // dA = dY . B^T, then sum broadcast batch dims back to A's shape.
        let b_t = transpose_last_two(ctx, b.name.clone(), b_shape.len());
        let g = ctx.emit_simple("MatMul", vec![dy.clone(), b_t]);
        let mut raw_shape = y_shape.clone();
        let n = raw_shape.len();
        raw_shape[n - 2] = a_shape[a_shape.len() - 2];
        raw_shape[n - 1] = a_shape[a_shape.len() - 1];
        let g = ctx.reduce_broadcast(g, &raw_shape, &a_shape);
        ctx.finish_input_grad(0, g);
    }
    if ctx.needs_input_grad(1) {
        // dB = A^T . dY
        let a_t = transpose_last_two(ctx, a.name.clone(), a_shape.len());
        let g = ctx.emit_simple("MatMul", vec![a_t, dy]);
        let mut raw_shape = y_shape.clone();
        let n = raw_shape.len();
        raw_shape[n - 2] = b_shape[b_shape.len() - 2];
        raw_shape[n - 1] = b_shape[b_shape.len() - 1];
        let g = ctx.reduce_broadcast(g, &raw_shape, &b_shape);
        ctx.finish_input_grad(1, g);
    }
    Ok(())
}

pub fn gemm(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    let trans_a = ctx.attribute("transA").and_then(|a| a.as_int()).unwrap_or(0) != 0;
    let trans_b = ctx.attribute("transB").and_then(|a| a.as_int()).unwrap_or(0) != 0;
    let alpha = ctx.attribute("alpha").and_then(|a| a.as_float()).unwrap_or(1.0);
    let beta = ctx.attribute("beta").and_then(|a| a.as_float()).unwrap_or(1.0);

    let dy = ctx.require_output_grad(0)?;
    let a = ctx.input(0).name.clone();
    let b = ctx.input(1).name.clone();

    if ctx.needs_input_grad(0) {
        // dA' = dY . B'^T with A' the effective (possibly transposed) operand.
        let b_eff_t = if trans_b {
            b.clone()
        } else {
            transpose_last_two(ctx, b.clone(), 2)
        };
        let mut g = ctx.emit_simple("MatMul", vec![dy.clone(), b_eff_t]);
        if trans_a {
            g = transpose_last_two(ctx, g, 2);
        }
        let g = scale_by(ctx, g, alpha);
        ctx.finish_input_grad(0, g);
    }
    if ctx.needs_input_grad(1) {
        let a_eff_t = if trans_a {
            a.clone()
        } else {
            transpose_last_two(ctx, a.clone(), 2)
        };
        let mut g = ctx.emit_simple("MatMul", vec![a_eff_t, dy.clone()]);
        if trans_b {
            g = transpose_last_two(ctx, g, 2);
        }
        let g = scale_by(ctx, g, alpha);
        ctx.finish_input_grad(1, g);
    }
    if ctx.input_count() > 2 && ctx.needs_input_grad(2) {
        let y_shape = ctx.require_shape(&ctx.output(0).clone())?;
        let c_shape = ctx.require_shape(&ctx.input(2).clone())?;
        let g = scale_by(ctx, dy, beta);
        let g = ctx.reduce_broadcast(g, &y_shape, &c_shape);
        ctx.finish_input_grad(2, g);
    }
    Ok(())
}
