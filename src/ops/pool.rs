//! Max pooling pipelines

use crate::buffer::BufferView;
use crate::context::Context;
use crate::dispatch::{batched_grid, linear_fit};
use crate::error::NnError;
use crate::invocation::Invocation;
use crate::shader::ShaderModule;

use super::{
    compile_pipeline, require_bound, write_descriptor_set, BINDING_INPUT_GRAD,
    BINDING_INPUT_VALUE, BINDING_OUTPUT_GRAD, BINDING_OUTPUT_VALUE,
};

/// Output-side pooling shape; the input extent is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShape {
    pub output_width: u32,
    pub output_height: u32,
    pub channels: u32,
    pub filter_width: u32,
    pub filter_height: u32,
    pub xstride: u32,
    pub ystride: u32,
}

impl PoolShape {
    pub fn input_width(&self) -> Result<u32, NnError> {
        if self.output_width == 0 {
            return Err(NnError::InvalidDataLength);
        }
        Ok((self.output_width - 1) * self.xstride + self.filter_width)
    }

    pub fn input_height(&self) -> Result<u32, NnError> {
        if self.output_height == 0 {
            return Err(NnError::InvalidDataLength);
        }
        Ok((self.output_height - 1) * self.ystride + self.filter_height)
    }

    pub fn input_plane(&self) -> Result<usize, NnError> {
        Ok(self.input_width()? as usize * self.input_height()? as usize * self.channels as usize)
    }

    pub fn output_plane(&self) -> usize {
        self.output_width as usize * self.output_height as usize * self.channels as usize
    }

    fn spec_data(&self, subgroup: u32) -> [u32; 9] {
        [
            subgroup,
            1,
            self.output_width,
            self.output_height,
            self.channels,
            self.filter_width,
            self.filter_height,
            self.xstride,
            self.ystride,
        ]
    }
}

fn pool_grid(ctx: &Context, shape: &PoolShape, batch_size: u32) -> Result<[u32; 3], NnError> {
    let limits = ctx.limits();
    let fit = linear_fit(shape.output_plane() as u32, limits)?;
    batched_grid(fit.group_count, batch_size, limits)
}

/// Build the pooling forward pass.
pub fn forward(
    ctx: &Context,
    shader: &ShaderModule,
    input_value: &BufferView<f32>,
    output_value: &BufferView<f32>,
    shape: &PoolShape,
    batch_size: u32,
) -> Result<Invocation, NnError> {
    let input_range = require_bound(input_value)?;
    let output_range = require_bound(output_value)?;

    if input_value.len() != shape.input_plane()? * batch_size as usize {
        return Err(NnError::InvalidDataLength);
    }
    if output_value.len() != shape.output_plane() * batch_size as usize {
        return Err(NnError::InvalidDataLength);
    }
    let grid = pool_grid(ctx, shape, batch_size)?;

    let spec_data = shape.spec_data(ctx.limits().subgroup_size);
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
        grid,
        batch_size,
        None,
        vec![input_range, output_range],
    ))
}

/// Build the pooling backward pass. The gradient routes to the input
/// position that won the forward max, everything else receives zero.
pub fn backward(
    ctx: &Context,
    shader: &ShaderModule,
    input_value: &BufferView<f32>,
    output_value: &BufferView<f32>,
    input_grad: &BufferView<f32>,
    output_grad: &BufferView<f32>,
    shape: &PoolShape,
    batch_size: u32,
) -> Result<Invocation, NnError> {
    let input_range = require_bound(input_value)?;
    let output_range = require_bound(output_value)?;
    let input_grad_range = require_bound(input_grad)?;
    let output_grad_range = require_bound(output_grad)?;

    let input_len = shape.input_plane()? * batch_size as usize;
    let output_len = shape.output_plane() * batch_size as usize;
    if input_value.len() != input_len
        || output_value.len() != output_len
        || input_grad.len() != input_len
        || output_grad.len() != output_len
    {
        return Err(NnError::InvalidDataLength);
    }
    let grid = pool_grid(ctx, shape, batch_size)?;

    let spec_data = shape.spec_data(ctx.limits().subgroup_size);
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
        grid,
        batch_size,
        None,
        vec![input_range, output_range, input_grad_range, output_grad_range],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_extent_derivation() {
        let shape = PoolShape {
            output_width: 14,
            output_height: 14,
            channels: 8,
            filter_width: 2,
            filter_height: 2,
            xstride: 2,
            ystride: 2,
        };
        assert_eq!(shape.input_width().unwrap(), 28);
        assert_eq!(shape.input_height().unwrap(), 28);
        assert_eq!(shape.input_plane().unwrap(), 28 * 28 * 8);
        assert_eq!(shape.output_plane(), 14 * 14 * 8);
    }

    #[test]
    fn test_zero_extent_rejected() {
        let shape = PoolShape {
            output_width: 0,
            output_height: 14,
            channels: 8,
            filter_width: 2,
            filter_height: 2,
            xstride: 2,
            ystride: 2,
        };
        assert!(matches!(shape.input_width(), Err(NnError::InvalidDataLength)));
        assert!(matches!(shape.input_plane(), Err(NnError::InvalidDataLength)));
    }

    #[test]
    fn test_overlapping_window_extent() {
        let shape = PoolShape {
            output_width: 13,
            output_height: 13,
            channels: 1,
            filter_width: 3,
            filter_height: 3,
            xstride: 2,
            ystride: 2,
        };
        assert_eq!(shape.input_width().unwrap(), 27);
        assert_eq!(shape.input_height().unwrap(), 27);
    }
}
