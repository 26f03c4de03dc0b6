//! Element-wise activation pipelines
//!
//! ReLU and tanh share the same shape rules, so each direction is one
//! builder parameterized by the shader module.

use crate::buffer::BufferView;
use crate::context::Context;
use crate::dispatch::linear_fit;
use crate::error::NnError;
use crate::invocation::Invocation;
use crate::shader::ShaderModule;

use super::{
    compile_pipeline, require_bound, write_descriptor_set, BINDING_INPUT_GRAD,
    BINDING_INPUT_VALUE, BINDING_OUTPUT_GRAD, BINDING_OUTPUT_VALUE,
};

/// Build `output[i] = f(input[i])` over the whole flattened batch.
pub fn forward(
    ctx: &Context,
    shader: &ShaderModule,
    input_value: &BufferView<f32>,
    output_value: &BufferView<f32>,
) -> Result<Invocation, NnError> {
    let input_range = require_bound(input_value)?;
    let output_range = require_bound(output_value)?;
    let limits = ctx.limits();

    if input_value.len() != output_value.len() {
        return Err(NnError::InvalidDataLength);
    }
    let width = input_value.len() as u32;
    let fit = linear_fit(width, limits)?;

    let spec_data = [fit.local_size, 1, width];
    let slots = [BINDING_INPUT_VALUE, BINDING_OUTPUT_VALUE];
    let pipeline = compile_pipeline(ctx, shader, &slots, &spec_data)?;
    let descriptor_set = write_descriptor_set(
        ctx,
        &pipeline,
        &[
            (BINDING_INPUT_VALUE, input_range),
            (BINDING_OUTPUT_VALUE, output_range),
        ],
    )?;

    Ok(Invocation::new(
        ctx.device().clone(),
        pipeline,
        descriptor_set,
        [fit.group_count, 1, 1],
        1,
        None,
        vec![input_range, output_range],
    ))
}

/// Build `input_grad[i] = f'(input[i]) * output_grad[i]`.
///
/// `input_value` is the pre-activation value, `output_value` the activated
/// one; kernels pick whichever form of the derivative is cheaper.
pub fn backward(
    ctx: &Context,
    shader: &ShaderModule,
    input_value: &BufferView<f32>,
    output_value: &BufferView<f32>,
    input_grad: &BufferView<f32>,
    output_grad: &BufferView<f32>,
) -> Result<Invocation, NnError> {
    let input_range = require_bound(input_value)?;
    let output_range = require_bound(output_value)?;
    let input_grad_range = require_bound(input_grad)?;
    let output_grad_range = require_bound(output_grad)?;
    let limits = ctx.limits();

    let width = input_value.len() as u32;
    if output_value.len() != width as usize
        || input_grad.len() != width as usize
        || output_grad.len() != width as usize
    {
        return Err(NnError::InvalidDataLength);
    }
    let fit = linear_fit(width, limits)?;

    let spec_data = [fit.local_size, 1, width];
    let slots = [
        BINDING_INPUT_VALUE,
        BINDING_OUTPUT_VALUE,
        BINDING_INPUT_GRAD,
        BINDING_OUTPUT_GRAD,
    ];
    let pipeline = compile_pipeline(ctx, shader, &slots, &spec_data)?;
    let descriptor_set = write_descriptor_set(
        ctx,
        &pipeline,
        &[
            (BINDING_INPUT_VALUE, input_range),
            (BINDING_OUTPUT_VALUE, output_range),
            (BINDING_INPUT_GRAD, input_grad_range),
            (BINDING_OUTPUT_GRAD, output_grad_range),
        ],
    )?;

    Ok(Invocation::new(
        ctx.device().clone(),
        pipeline,
        descriptor_set,
        [fit.group_count, 1, 1],
        1,
        None,
        vec![input_range, output_range, input_grad_range, output_grad_range],
    ))
}
