//! Weight initialization pipeline
//!
//! Fills one weight buffer with random values scaled by the layer's fan-in.
//! Runs once at startup and never appears in the per-step sequences.

use crate::buffer::{BufferView, WeightVec};
use crate::context::Context;
use crate::dispatch::{gcd, plane_grid};
use crate::error::NnError;
use crate::invocation::Invocation;
use crate::shader::ShaderModule;

use super::{compile_pipeline, require_bound, write_descriptor_set, BINDING_WEIGHT};

/// Build the one-shot fill of `weight`.
///
/// `fan_in` is the element count feeding one unit of the layer; the kernel
/// scales its distribution by it.
pub fn init(
    ctx: &Context,
    shader: &ShaderModule,
    weight: &BufferView<WeightVec>,
    fan_in: u32,
) -> Result<Invocation, NnError> {
    let weight_range = require_bound(weight)?;
    let limits = ctx.limits();

    // Exact cover: the local size divides the element count, the grid
    // split is exact, so no invocation falls outside the buffer.
    let size = weight.len() as u32;
    let local_size = gcd(size, limits.subgroup_size).max(1);
    let grid = plane_grid(size / local_size, limits)?;

    let spec_data = [local_size, 1, fan_in];
    let pipeline = compile_pipeline(ctx, shader, &[BINDING_WEIGHT], &spec_data)?;
    let descriptor_set =
        write_descriptor_set(ctx, &pipeline, &[(BINDING_WEIGHT, weight_range)])?;

    Ok(Invocation::new(
        ctx.device().clone(),
        pipeline,
        descriptor_set,
        grid,
        1,
        None,
        vec![weight_range],
    ))
}
