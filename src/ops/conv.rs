//! Convolution pipelines
//!
//! Two families share these builders: the full convolution mixing input
//! channels into a different output channel count, and the channel
//! preserving ("straight") convolution applying one filter slice per
//! channel. The backward pass is split in two invocations: the input
//! gradient pass scatters through overlapping filter windows into a
//! zero-filled destination, the weight pass accumulates the filter update
//! over the whole batch.

use crate::buffer::{BufferView, WeightVec};
use crate::context::Context;
use crate::dispatch::{batched_grid, linear_fit};
use crate::error::NnError;
use crate::invocation::Invocation;
use crate::shader::ShaderModule;

use super::{
    compile_pipeline, require_bound, write_descriptor_set, BINDING_INPUT_GRAD,
    BINDING_INPUT_VALUE, BINDING_OUTPUT_GRAD, BINDING_OUTPUT_VALUE, BINDING_WEIGHT,
};

/// Output-side shape of a convolution; the input extent is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub output_width: u32,
    pub output_height: u32,
    pub in_channels: u32,
    pub out_channels: u32,
    pub filter_width: u32,
    pub filter_height: u32,
    pub xstride: u32,
    pub ystride: u32,
    pub xmargin: u32,
    pub ymargin: u32,
    /// Channel-preserving variant: one filter slice per channel
    pub straight: bool,
}

impl ConvShape {
    pub fn input_width(&self) -> Result<u32, NnError> {
        if self.output_width == 0 {
            return Err(NnError::InvalidDataLength);
        }
        let span = (self.output_width - 1) * self.xstride + self.filter_width;
        if span <= 2 * self.xmargin {
            return Err(NnError::InvalidDataLength);
        }
        Ok(span - 2 * self.xmargin)
    }

    pub fn input_height(&self) -> Result<u32, NnError> {
        if self.output_height == 0 {
            return Err(NnError::InvalidDataLength);
        }
        let span = (self.output_height - 1) * self.ystride + self.filter_height;
        if span <= 2 * self.ymargin {
            return Err(NnError::InvalidDataLength);
        }
        Ok(span - 2 * self.ymargin)
    }

    pub fn input_plane(&self) -> Result<usize, NnError> {
        Ok(self.input_width()? as usize * self.input_height()? as usize * self.in_channels as usize)
    }

    pub fn output_plane(&self) -> usize {
        self.output_width as usize * self.output_height as usize * self.out_channels as usize
    }

    /// Weight element count in vec4 units.
    pub fn weight_len(&self) -> usize {
        let per_filter = self.filter_width as usize * self.filter_height as usize;
        if self.straight {
            per_filter * self.in_channels as usize
        } else {
            per_filter * self.in_channels as usize * self.out_channels as usize
        }
    }

    fn spec_data(&self, subgroup: u32, batch_size: u32) -> Vec<u32> {
        let mut data = vec![
            subgroup,
            1,
            batch_size,
            self.output_width,
            self.output_height,
            self.filter_width,
            self.filter_height,
            self.in_channels,
        ];
        if !self.straight {
            data.push(self.out_channels);
        }
        data.extend_from_slice(&[self.xstride, self.ystride, self.xmargin, self.ymargin]);
        data
    }

    fn validate(
        &self,
        input_len: usize,
        output_len: usize,
        weight_len: usize,
        batch_size: u32,
    ) -> Result<(), NnError> {
        if self.straight && self.in_channels != self.out_channels {
            return Err(NnError::InvalidDataLength);
        }
        if input_len != self.input_plane()? * batch_size as usize {
            return Err(NnError::InvalidDataLength);
        }
        if output_len != self.output_plane() * batch_size as usize {
            return Err(NnError::InvalidDataLength);
        }
        if weight_len != self.weight_len() {
            return Err(NnError::InvalidDataLength);
        }
        Ok(())
    }
}

/// Workgroups covering `elements`, batch on axis 2.
fn output_grid(
    ctx: &Context,
    elements: usize,
    batch_size: u32,
) -> Result<([u32; 3], u32), NnError> {
    let limits = ctx.limits();
    let fit = linear_fit(elements as u32, limits)?;
    let grid = batched_grid(fit.group_count, batch_size, limits)?;
    Ok((grid, fit.local_size))
}

/// Build the forward convolution.
pub fn forward(
    ctx: &Context,
    shader: &ShaderModule,
    input_value: &BufferView<f32>,
    output_value: &BufferView<f32>,
    weight: &BufferView<WeightVec>,
    shape: &ConvShape,
    batch_size: u32,
) -> Result<Invocation, NnError> {
    let input_range = require_bound(input_value)?;
    let output_range = require_bound(output_value)?;
    let weight_range = require_bound(weight)?;

    shape.validate(input_value.len(), output_value.len(), weight.len(), batch_size)?;
    let (grid, subgroup) = output_grid(ctx, shape.output_plane(), batch_size)?;

    let spec_data = shape.spec_data(subgroup, batch_size);
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
        grid,
        batch_size,
        None,
        vec![input_range, output_range, weight_range],
    ))
}

/// Build the input-gradient pass.
///
/// Overlapping filter windows accumulate into shared destination elements,
/// so the destination is zero-filled through the invocation's clear step
/// before the dispatch runs.
pub fn backward_input(
    ctx: &Context,
    shader: &ShaderModule,
    input_value: &BufferView<f32>,
    output_value: &BufferView<f32>,
    weight: &BufferView<WeightVec>,
    input_grad: &BufferView<f32>,
    output_grad: &BufferView<f32>,
    shape: &ConvShape,
    batch_size: u32,
) -> Result<Invocation, NnError> {
    let input_range = require_bound(input_value)?;
    let output_range = require_bound(output_value)?;
    let weight_range = require_bound(weight)?;
    let input_grad_range = require_bound(input_grad)?;
    let output_grad_range = require_bound(output_grad)?;

    shape.validate(input_value.len(), output_value.len(), weight.len(), batch_size)?;
    if input_grad.len() != input_value.len() || output_grad.len() != output_value.len() {
        return Err(NnError::InvalidDataLength);
    }
    let (grid, subgroup) = output_grid(ctx, shape.output_plane(), batch_size)?;

    let spec_data = shape.spec_data(subgroup, batch_size);
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
        grid,
        batch_size,
        Some(input_grad_range),
        vec![
            input_range,
            output_range,
            weight_range,
            input_grad_range,
            output_grad_range,
        ],
    ))
}

/// Build the weight-update pass, one invocation per filter element.
pub fn backward_weight(
    ctx: &Context,
    shader: &ShaderModule,
    input_value: &BufferView<f32>,
    output_value: &BufferView<f32>,
    weight: &BufferView<WeightVec>,
    output_grad: &BufferView<f32>,
    shape: &ConvShape,
    batch_size: u32,
) -> Result<Invocation, NnError> {
    let input_range = require_bound(input_value)?;
    let output_range = require_bound(output_value)?;
    let weight_range = require_bound(weight)?;
    let output_grad_range = require_bound(output_grad)?;

    shape.validate(input_value.len(), output_value.len(), weight.len(), batch_size)?;
    if output_grad.len() != output_value.len() {
        return Err(NnError::InvalidDataLength);
    }
    let fit = linear_fit(shape.weight_len() as u32, ctx.limits())?;

    let spec_data = shape.spec_data(fit.local_size, batch_size);
    let slots = [
        BINDING_INPUT_VALUE,
        BINDING_OUTPUT_VALUE,
        BINDING_WEIGHT,
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
            (BINDING_OUTPUT_GRAD, output_grad_range),
        ],
    )?;

    Ok(Invocation::new(
        ctx.device().clone(),
        pipeline,
        descriptor_set,
        [fit.group_count, 1, 1],
        batch_size,
        None,
        vec![input_range, output_range, weight_range, output_grad_range],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> ConvShape {
        ConvShape {
            output_width: 28,
            output_height: 28,
            in_channels: 1,
            out_channels: 8,
            filter_width: 3,
            filter_height: 3,
            xstride: 1,
            ystride: 1,
            xmargin: 1,
            ymargin: 1,
            straight: false,
        }
    }

    #[test]
    fn test_margin_one_keeps_extent() {
        let s = shape();
        assert_eq!(s.input_width().unwrap(), 28);
        assert_eq!(s.input_height().unwrap(), 28);
    }

    #[test]
    fn test_weight_len_full_vs_straight() {
        let full = shape();
        assert_eq!(full.weight_len(), 3 * 3 * 1 * 8);

        let mut straight = shape();
        straight.in_channels = 8;
        straight.straight = true;
        assert_eq!(straight.weight_len(), 3 * 3 * 8);
    }

    #[test]
    fn test_validate_rejects_wrong_lengths() {
        let s = shape();
        let batch = 4u32;
        let input_len = s.input_plane().unwrap() * batch as usize;
        let output_len = s.output_plane() * batch as usize;
        assert!(s.validate(input_len, output_len, s.weight_len(), batch).is_ok());
        assert!(matches!(
            s.validate(input_len - 1, output_len, s.weight_len(), batch),
            Err(NnError::InvalidDataLength)
        ));
        assert!(matches!(
            s.validate(input_len, output_len, s.weight_len() + 1, batch),
            Err(NnError::InvalidDataLength)
        ));
    }

    #[test]
    fn test_zero_extent_rejected() {
        let mut s = shape();
        s.output_width = 0;
        assert!(matches!(s.input_width(), Err(NnError::InvalidDataLength)));
        s.output_width = 28;
        s.output_height = 0;
        assert!(matches!(s.input_height(), Err(NnError::InvalidDataLength)));
    }

    #[test]
    fn test_excessive_margin_rejected() {
        let mut s = shape();
        s.xmargin = 16;
        assert!(matches!(s.input_width(), Err(NnError::InvalidDataLength)));
    }

    #[test]
    fn test_spec_data_layout() {
        let s = shape();
        let data = s.spec_data(32, 16);
        // local size pair, batch, output extent, filter extent, channels,
        // strides, margins
        assert_eq!(data.len(), 13);
        assert_eq!(data[0], 32);
        assert_eq!(data[2], 16);
        assert_eq!(&data[3..5], &[28, 28]);
        assert_eq!(data[8], 8);

        let mut straight = s;
        straight.in_channels = 8;
        straight.straight = true;
        assert_eq!(straight.spec_data(32, 16).len(), 12);
    }
}
