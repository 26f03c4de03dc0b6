//! Fully connected layer pipelines
//!
//! The forward pass walks output units; the backward pass is a single
//! kernel that both accumulates the weight update and produces the input
//! gradient, one workgroup column per input unit reducing over the output
//! width.

use crate::buffer::{BufferView, WeightVec};
use crate::context::Context;
use crate::dispatch::align_up;
use crate::error::NnError;
use crate::invocation::Invocation;
use crate::shader::ShaderModule;

use super::{
    compile_pipeline, require_bound, write_descriptor_set, BINDING_INPUT_GRAD,
    BINDING_INPUT_VALUE, BINDING_OUTPUT_GRAD, BINDING_OUTPUT_VALUE, BINDING_WEIGHT,
};

/// Build `output = weight * input` over a batch.
pub fn forward(
    ctx: &Context,
    shader: &ShaderModule,
    input_value: &BufferView<f32>,
    output_value: &BufferView<f32>,
    weight: &BufferView<WeightVec>,
    batch_size: u32,
) -> Result<Invocation, NnError> {
    let input_range = require_bound(input_value)?;
    let output_range = require_bound(output_value)?;
    let weight_range = require_bound(weight)?;
    let limits = ctx.limits();

    if input_value.len() % batch_size as usize != 0
        || output_value.len() % batch_size as usize != 0
    {
        return Err(NnError::InvalidDataLength);
    }
    let input_width = (input_value.len() / batch_size as usize) as u32;
    let output_width = (output_value.len() / batch_size as usize) as u32;
    if weight.len() != input_width as usize * output_width as usize {
        return Err(NnError::InvalidDataLength);
    }
    if output_width > limits.max_group_count[0] {
        return Err(NnError::TooLargeData);
    }
    if batch_size > limits.max_group_count[2] {
        return Err(NnError::TooLargeData);
    }

    // One workgroup per output unit, reducing over the input width
    let system_max = limits.max_group_size[1].min(limits.max_group_count[1]);
    let aligned_input = align_up(input_width, limits.subgroup_size);
    let spec_data = [
        aligned_input.min(system_max),
        1,
        input_width,
        aligned_input / limits.subgroup_size,
        batch_size,
    ];

    let slots = [BINDING_INPUT_VALUE, BINDING_OUTPUT_VALUE, BINDING_WEIGHT];
    let pipeline = compile_pipeline(ctx, shader, &slots, &spec_data)?;
    let descriptor_set = write_descriptor_set(
        ctx,
        &pipeline,
        &[
            (BINDING_INPUT_VALUE, input_range),
            (BINDING_OUTPUT_VALUE, output_range),
            (BINDING_WEIGHT, weight_range),
        ],
    )?;

    Ok(Invocation::new(
        ctx.device().clone(),
        pipeline,
        descriptor_set,
        [output_width, 1, 1],
        batch_size,
        None,
        vec![input_range, output_range, weight_range],
    ))
}

/// Build the combined weight-update and input-gradient pass.
pub fn backward(
    ctx: &Context,
    shader: &ShaderModule,
    input_value: &BufferView<f32>,
    output_value: &BufferView<f32>,
    weight: &BufferView<WeightVec>,
    input_grad: &BufferView<f32>,
    output_grad: &BufferView<f32>,
    batch_size: u32,
) -> Result<Invocation, NnError> {
    let input_range = require_bound(input_value)?;
    let output_range = require_bound(output_value)?;
    let weight_range = require_bound(weight)?;
    let input_grad_range = require_bound(input_grad)?;
    let output_grad_range = require_bound(output_grad)?;
    let limits = ctx.limits();

    if input_grad.len() % batch_size as usize != 0
        || output_grad.len() % batch_size as usize != 0
    {
        return Err(NnError::InvalidDataLength);
    }
    let width = (input_grad.len() / batch_size as usize) as u32;
    let height = (output_grad.len() / batch_size as usize) as u32;
    if input_value.len() != input_grad.len() || output_value.len() != output_grad.len() {
        return Err(NnError::InvalidDataLength);
    }
    if weight.len() != width as usize * height as usize {
        return Err(NnError::InvalidDataLength);
    }
    if width > limits.max_group_count[0] {
        return Err(NnError::TooLargeData);
    }
    if batch_size > limits.max_group_count[2] {
        return Err(NnError::TooLargeData);
    }

    let system_max = limits.max_group_size[1].min(limits.max_group_count[1]);
    let aligned_height = align_up(height, limits.subgroup_size);
    let spec_data = [
        aligned_height.min(system_max),
        1,
        height,
        aligned_height / limits.subgroup_size,
        batch_size,
    ];

    let slots = [
        BINDING_INPUT_VALUE,
        BINDING_OUTPUT_VALUE,
        BINDING_WEIGHT,
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
            (BINDING_WEIGHT, weight_range),
            (BINDING_INPUT_GRAD, input_grad_range),
            (BINDING_OUTPUT_GRAD, output_grad_range),
        ],
    )?;

    Ok(Invocation::new(
        ctx.device().clone(),
        pipeline,
        descriptor_set,
        [width, 1, 1],
        batch_size,
        None,
        vec![
            input_range,
            output_range,
            weight_range,
            input_grad_range,
            output_grad_range,
        ],
    ))
}
