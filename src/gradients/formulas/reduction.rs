//! Reduction gradients: the incoming gradient is rescaled where the forward
//! op averaged, then broadcast back over the reduced axes with Expand.

use super::{shape_to_ints, single_attr};
use crate::gradients::context::GradientContext;
use crate::gradients::GradientBuilderError;
use crate::graph::Attribute;

fn reduced_axes(ctx: &GradientContext, rank: usize) -> Vec<usize> {
    match ctx.attribute("axes").and_then(|a| a.as_ints()) {
        Some(axes) => axes
            .iter()
            .map(|a| if *a < 0 { (*a + rank as i64) as usize } else { *a as usize })
            .collect(),
        None => (0..rank).collect(),
    }
}

fn expand_back(
    ctx: &mut GradientContext,
    dy: String,
    x_shape: &[usize],
    axes: &[usize],
    keepdims: bool,
) -> String {
    let mut g = dy;
    if !keepdims {
        // Restore singleton dims so Expand can broadcast along them.
        let mut kept: Vec<i64> = Vec::with_capacity(x_shape.len());
        for (i, dim) in x_shape.iter().enumerate() {
            kept.push(if axes.contains(&i) { 1 } else { *dim as i64 });
        }
        g = ctx.emit_with_attrs("Reshape", vec![g], single_attr("shape", Attribute::Ints(kept)));
    }
    ctx.emit_with_attrs(
        "Expand",
        vec![g],
        single_attr("shape", Attribute::Ints(shape_to_ints(x_shape))),
    )
}

pub fn reduce_sum(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x_shape = ctx.require_shape(&ctx.input(0).clone())?;
        let axes = reduced_axes(ctx, x_shape.len());
        let keepdims = ctx.attribute("keepdims").and_then(|a| a.as_int()).unwrap_or(1) != 0;
        let g = expand_back(ctx, dy, &x_shape, &axes, keepdims);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn reduce_mean(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x_shape = ctx.require_shape(&ctx.input(0).clone())?;
        let axes = reduced_axes(ctx, x_shape.len());
        let keepdims = ctx.attribute("keepdims").and_then(|a| a.as_int()).unwrap_or(1) != 0;
        let count: usize = axes.iter().map(|a| x_shape[*a]).product::<usize>().max(1);
        let g = ctx.emit_with_attrs(
            "Scale",
            vec![dy],
            single_attr("scale", Attribute::Float(1.0 / count as f32)),
        );
        let g = expand_back(ctx, g, &x_shape, &axes, keepdims);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

/// GlobalAveragePool reduces every spatial axis with keepdims, so the
/// incoming [N, C, 1, ...] gradient broadcasts straight back after scaling.
pub fn global_average_pool(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x_shape = ctx.require_shape(&ctx.input(0).clone())?;
        let count: usize = x_shape[2..].iter().product::<usize>().max(1);
        let g = ctx.emit_with_attrs(
            "Scale",
            vec![dy],
            single_attr("scale", Attribute::Float(1.0 / count as f32)),
        );
        let g = ctx.emit_with_attrs(
            "Expand",
            vec![g],
            single_attr("shape", Attribute::Ints(shape_to_ints(&x_shape))),
        );
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}
