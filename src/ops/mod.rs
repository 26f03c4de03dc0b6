//! Pipeline factories
//!
//! One factory per operator kind. Each factory validates every buffer view
//! length against the shape-derived expectation and checks the dispatch fit
//! against device limits before compiling anything; a failed build raises
//! an error with no pipeline left behind.
//!
//! Binding slots are fixed across all operators:
//!
//! | slot | content        |
//! |------|----------------|
//! | 0    | input value    |
//! | 1    | output value   |
//! | 2    | weight         |
//! | 3    | input gradient |
//! | 4    | output gradient|
//! | 5    | teacher value  |
//!
//! Specialization constants use IDs 1..=N in declaration order; IDs 1 and 2
//! are the local workgroup size on x and y by convention.

pub mod activation;
pub mod affine;
pub mod conv;
pub mod init;
pub mod pool;
pub mod softmax;

use ash::vk;
use bytemuck::Pod;
use std::ffi::CStr;
use std::sync::Arc;

use crate::buffer::BufferView;
use crate::context::Context;
use crate::error::NnError;
use crate::invocation::{BoundRange, PipelineResources, PUSH_CONSTANT_SIZE};
use crate::shader::ShaderModule;

pub const BINDING_INPUT_VALUE: u32 = 0;
pub const BINDING_OUTPUT_VALUE: u32 = 1;
pub const BINDING_WEIGHT: u32 = 2;
pub const BINDING_INPUT_GRAD: u32 = 3;
pub const BINDING_OUTPUT_GRAD: u32 = 4;
pub const BINDING_TEACHER: u32 = 5;

const ENTRY_POINT: &CStr = c"main";

/// Storage buffer layout bindings for the given slot set.
pub(crate) fn storage_bindings(slots: &[u32]) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    slots
        .iter()
        .map(|slot| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(*slot)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
        })
        .collect()
}

/// Reject unbound or empty views before they reach a descriptor write.
pub(crate) fn require_bound<T: Pod>(view: &BufferView<T>) -> Result<BoundRange, NnError> {
    if !view.is_bound() || view.is_empty() {
        return Err(NnError::InvalidDataLength);
    }
    Ok(BoundRange {
        buffer: view.raw(),
        offset: view.byte_offset(),
        size: view.byte_len(),
    })
}

/// Compile one compute pipeline with the fixed push constant block and the
/// given specialization data at constant IDs 1..=N.
pub(crate) fn compile_pipeline(
    ctx: &Context,
    shader: &ShaderModule,
    slots: &[u32],
    spec_data: &[u32],
) -> Result<Arc<PipelineResources>, NnError> {
    let device = ctx.device().clone();

    let bindings = storage_bindings(slots);
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    let descriptor_set_layout =
        unsafe { device.create_descriptor_set_layout(&layout_info, None) }?;

    let push_range = vk::PushConstantRange::default()
        .stage_flags(vk::ShaderStageFlags::COMPUTE)
        .offset(0)
        .size(PUSH_CONSTANT_SIZE);
    let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(std::slice::from_ref(&descriptor_set_layout))
        .push_constant_ranges(std::slice::from_ref(&push_range));
    let pipeline_layout =
        match unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(descriptor_set_layout, None) };
                return Err(e.into());
            }
        };

    let spec_entries: Vec<vk::SpecializationMapEntry> = (0..spec_data.len())
        .map(|i| vk::SpecializationMapEntry {
            constant_id: i as u32 + 1,
            offset: (i * 4) as u32,
            size: 4,
        })
        .collect();
    let spec_info = vk::SpecializationInfo::default()
        .map_entries(&spec_entries)
        .data(bytemuck::cast_slice(spec_data));

    let stage_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(shader.handle())
        .name(ENTRY_POINT)
        .specialization_info(&spec_info);

    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage_info)
        .layout(pipeline_layout);

    let pipelines = unsafe {
        ctx.device()
            .create_compute_pipelines(ctx.pipeline_cache(), &[pipeline_info], None)
    };
    let pipeline = match pipelines {
        Ok(pipelines) => pipelines[0],
        Err((_, e)) => {
            unsafe {
                device.destroy_pipeline_layout(pipeline_layout, None);
                device.destroy_descriptor_set_layout(descriptor_set_layout, None);
            }
            return Err(e.into());
        }
    };

    log::debug!(
        "Compiled pipeline: {} bindings, {} spec constants",
        slots.len(),
        spec_data.len()
    );
    Ok(Arc::new(PipelineResources::new(
        device,
        pipeline,
        pipeline_layout,
        descriptor_set_layout,
    )))
}

/// Allocate a descriptor set from the shared pool and point every slot at
/// its bound range.
pub(crate) fn write_descriptor_set(
    ctx: &Context,
    resources: &PipelineResources,
    writes: &[(u32, BoundRange)],
) -> Result<vk::DescriptorSet, NnError> {
    let layouts = [resources.descriptor_set_layout()];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(ctx.descriptor_pool())
        .set_layouts(&layouts);
    let descriptor_set = unsafe { ctx.device().allocate_descriptor_sets(&alloc_info) }?[0];

    let buffer_infos: Vec<vk::DescriptorBufferInfo> = writes
        .iter()
        .map(|(_, range)| {
            vk::DescriptorBufferInfo::default()
                .buffer(range.buffer)
                .offset(range.offset)
                .range(range.size)
        })
        .collect();
    let descriptor_writes: Vec<vk::WriteDescriptorSet> = writes
        .iter()
        .enumerate()
        .map(|(idx, (slot, _))| {
            vk::WriteDescriptorSet::default()
                .dst_set(descriptor_set)
                .dst_binding(*slot)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(std::slice::from_ref(&buffer_infos[idx]))
        })
        .collect();

    unsafe { ctx.device().update_descriptor_sets(&descriptor_writes, &[]) };
    Ok(descriptor_set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_bindings_slots() {
        let bindings = storage_bindings(&[0, 1, 2, 4]);
        assert_eq!(bindings.len(), 4);
        assert_eq!(bindings[3].binding, 4);
        for b in &bindings {
            assert_eq!(b.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
            assert_eq!(b.descriptor_count, 1);
        }
    }

    #[test]
    fn test_require_bound_rejects_default_view() {
        let view: BufferView<f32> = BufferView::default();
        assert!(matches!(
            require_bound(&view),
            Err(NnError::InvalidDataLength)
        ));
    }

    #[test]
    fn test_spec_constant_packing() {
        // Mirrors the entry layout compile_pipeline produces
        let spec_data = [32u32, 1, 128, 4, 16];
        let entries: Vec<(u32, u32)> = (0..spec_data.len())
            .map(|i| (i as u32 + 1, (i * 4) as u32))
            .collect();
        assert_eq!(entries[0], (1, 0));
        assert_eq!(entries[4], (5, 16));
        let bytes: &[u8] = bytemuck::cast_slice(&spec_data);
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[8..12], &128u32.to_le_bytes());
    }
}
