//! Fused softmax, cross entropy, and loss gradient
//!
//! One kernel reads the network output and the teacher labels, writes the
//! per-example loss and the gradient of the loss with respect to the
//! network output. The whole class width reduces inside one workgroup, so
//! one workgroup per batch element on axis 2 is the entire grid.

use crate::buffer::BufferView;
use crate::context::Context;
use crate::dispatch::align_up;
use crate::error::NnError;
use crate::invocation::Invocation;
use crate::shader::ShaderModule;

use super::{
    compile_pipeline, require_bound, write_descriptor_set, BINDING_INPUT_GRAD,
    BINDING_INPUT_VALUE, BINDING_OUTPUT_VALUE, BINDING_TEACHER,
};

/// Build the combined loss head.
///
/// `output_value` holds one loss scalar per batch element; its length is
/// the batch size. `input_grad` receives the gradient with respect to
/// `input_value`.
pub fn combined(
    ctx: &Context,
    shader: &ShaderModule,
    input_value: &BufferView<f32>,
    output_value: &BufferView<f32>,
    input_grad: &BufferView<f32>,
    teacher_value: &BufferView<f32>,
) -> Result<Invocation, NnError> {
    let input_range = require_bound(input_value)?;
    let output_range = require_bound(output_value)?;
    let input_grad_range = require_bound(input_grad)?;
    let teacher_range = require_bound(teacher_value)?;
    let limits = ctx.limits();

    let batch_size = output_value.len() as u32;
    if input_value.len() % batch_size as usize != 0 {
        return Err(NnError::InvalidDataLength);
    }
    let width = (input_value.len() / batch_size as usize) as u32;
    if teacher_value.len() != input_value.len() || input_grad.len() != input_value.len() {
        return Err(NnError::InvalidDataLength);
    }
    if width > limits.max_group_size[0] {
        return Err(NnError::TooLargeData);
    }
    if batch_size > limits.max_group_count[2] {
        return Err(NnError::TooLargeData);
    }

    let aligned_width = align_up(width, limits.subgroup_size);
    let spec_data = [
        aligned_width,
        1,
        width,
        aligned_width / limits.subgroup_size,
    ];

    let slots = [
        BINDING_INPUT_VALUE,
        BINDING_OUTPUT_VALUE,
        BINDING_INPUT_GRAD,
        BINDING_TEACHER,
    ];
    let pipeline = compile_pipeline(ctx, shader, &slots, &spec_data)?;
    let descriptor_set = write_descriptor_set(
        ctx,
        &pipeline,
        &[
            (BINDING_INPUT_VALUE, input_range),
            (BINDING_OUTPUT_VALUE, output_range),
            (BINDING_INPUT_GRAD, input_grad_range),
            (BINDING_TEACHER, teacher_range),
        ],
    )?;

    Ok(Invocation::new(
        ctx.device().clone(),
        pipeline,
        descriptor_set,
        [1, 1, batch_size],
        batch_size,
        None,
        vec![input_range, output_range, input_grad_range, teacher_range],
    ))
}
