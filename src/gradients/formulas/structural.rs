//! Shape- and layout-manipulating operators. Most of these invert to another
//! structural op parameterized by the recorded forward shapes.

use super::{shape_to_ints, single_attr};
use crate::gradients::context::GradientContext;
use crate::gradients::GradientBuilderError;
use crate::graph::Attribute;
use crate::tensor::TensorValue;

/// Shared by Reshape, Flatten, Squeeze and Unsqueeze: the gradient is the
/// incoming gradient reshaped to the recorded input shape. Forward attributes
/// are deliberately not mirrored.
pub fn reshape(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x_shape = ctx.require_shape(&ctx.input(0).clone())?;
        let g = ctx.emit_with_attrs(
            "Reshape",
            vec![dy],
            single_attr("shape", Attribute::Ints(shape_to_ints(&x_shape))),
        );
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn transpose(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x_shape = ctx.require_shape(&ctx.input(0).clone())?;
        let rank = x_shape.len();
        let perm: Vec<usize> = match ctx.attribute("perm").and_then(|a| a.as_ints()) {
            Some(p) => p.iter().map(|x| *x as usize).collect(),
            None => (0..rank).rev().collect(),
        };
        let mut inverse = vec![0i64; rank];
        for (i, p) in perm.iter().enumerate() {
            inverse[*p] = i as i64;
        }
        let g = ctx.emit_with_attrs(
            "Transpose",
            vec![dy],
            single_attr("perm", Attribute::Ints(inverse)),
        );
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

/// Cast back to the recorded input dtype. Attributes are not mirrored; the
/// forward "to" attribute would point the wrong way.
pub fn cast(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x = ctx.input(0).clone();
        let dtype = x.dtype.ok_or_else(|| {
            GradientBuilderError::MissingDType(ctx.node_name().to_string(), x.name.clone())
        })?;
        let g = ctx.emit_with_attrs(
            "Cast",
            vec![dy],
            single_attr("to", Attribute::String(dtype.to_string())),
        );
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn concat(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    let dy = ctx.require_output_grad(0)?;
    let y_shape = ctx.require_shape(&ctx.output(0).clone())?;
    let rank = y_shape.len() as i64;
    let mut axis = ctx.attribute("axis").and_then(|a| a.as_int()).unwrap_or(0);
    if axis < 0 {
        axis += rank;
    }

    let mut split_sizes = Vec::with_capacity(ctx.input_count());
    for idx in 0..ctx.input_count() {
        let shape = ctx.require_shape(&ctx.input(idx).clone())?;
        split_sizes.push(shape[axis as usize] as i64);
    }
    let split_outs: Vec<String> = (0..ctx.input_count()).map(|_| ctx.intermediate()).collect();
    let mut attrs = single_attr("axis", Attribute::Int(axis));
    attrs.insert("split".to_string(), Attribute::Ints(split_sizes));
    ctx.emit("Split", vec![dy], split_outs.clone(), attrs);

    for (idx, out) in split_outs.into_iter().enumerate() {
        if ctx.needs_input_grad(idx) {
            ctx.finish_input_grad(idx, out);
        }
    }
    Ok(())
}

/// Concat the output gradients back together. Outputs with no gradient flow
/// contribute zeros of their recorded shape.
pub fn split(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if !ctx.needs_input_grad(0) {
        return Ok(());
    }
    let axis = ctx.attribute("axis").and_then(|a| a.as_int()).unwrap_or(0);
    let mut parts = Vec::with_capacity(ctx.output_count());
    for idx in 0..ctx.output_count() {
        match ctx.output_grad(idx) {
            Some(g) => parts.push(g.to_string()),
            None => {
                let out = ctx.output(idx).clone();
                let shape = ctx.require_shape(&out)?;
                let dtype = out.dtype.unwrap_or(crate::dtype::DType::F32);
                let zeros = ctx.constant(TensorValue::zeros(dtype, &shape));
                parts.push(zeros);
            }
        }
    }
    let g = ctx.emit_with_attrs("Concat", parts, single_attr("axis", Attribute::Int(axis)));
    ctx.finish_input_grad(0, g);
    Ok(())
}

/// Scatter-add of the sliced gradient back into the data shape. The data
/// shape and axis travel as attributes so the backward kernel needs no shape
/// input, and nothing else from the forward node carries over.
pub fn gather(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x_shape = ctx.require_shape(&ctx.input(0).clone())?;
        let indices = ctx.input(1).name.clone();
        let axis = ctx.attribute("axis").and_then(|a| a.as_int()).unwrap_or(0);
        let mut attrs = single_attr("shape", Attribute::Ints(shape_to_ints(&x_shape)));
        attrs.insert("axis".to_string(), Attribute::Int(axis));
        let g = ctx.emit_with_attrs("GatherGrad", vec![indices, dy], attrs);
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

pub fn gather_nd(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let x_shape = ctx.require_shape(&ctx.input(0).clone())?;
        let indices = ctx.input(1).name.clone();
        let g = ctx.emit_with_attrs(
            "GatherNDGrad",
            vec![indices, dy],
            single_attr("shape", Attribute::Ints(shape_to_ints(&x_shape))),
        );
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}

/// Replays the forward mask when the forward node exposed one; a Dropout
/// without a mask output is treated as inference mode, i.e. identity.
pub fn dropout(ctx: &mut GradientContext) -> Result<(), GradientBuilderError> {
    if ctx.needs_input_grad(0) {
        let dy = ctx.require_output_grad(0)?;
        let g = if ctx.output_count() > 1 {
            let mask = ctx.output(1).name.clone();
            ctx.emit_simple("DropoutGrad", vec![dy, mask])
        } else {
            ctx.emit_simple("Identity", vec![dy])
        };
        ctx.finish_input_grad(0, g);
    }
    Ok(())
}
