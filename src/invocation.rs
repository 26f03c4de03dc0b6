//! Recorded compute dispatches
//!
//! An `Invocation` is one operator applied to a fixed set of buffer ranges:
//! pipeline, descriptor set, grid, and push data are all decided at
//! construction and never change afterwards. Command sequences are built by
//! recording invocations back to back; the barriers recorded here are what
//! orders them on the device.

use ash::{vk, Device};
use std::sync::Arc;

use crate::error::NnError;

/// Byte range of one bound buffer, kept for barrier recording.
#[derive(Debug, Clone, Copy)]
pub struct BoundRange {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// Compiled pipeline plus the layouts it was compiled against.
///
/// Shared by every replica of an invocation; dropped last through Arc.
pub struct PipelineResources {
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    descriptor_set_layout: vk::DescriptorSetLayout,
    device: Arc<Device>,
}

impl PipelineResources {
    pub fn new(
        device: Arc<Device>,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        descriptor_set_layout: vk::DescriptorSetLayout,
    ) -> Self {
        Self {
            pipeline,
            layout,
            descriptor_set_layout,
            device,
        }
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn descriptor_set_layout(&self) -> vk::DescriptorSetLayout {
        self.descriptor_set_layout
    }
}

impl Drop for PipelineResources {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            self.device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
    }
}

/// Size of the push constant block every operator layout declares.
/// Only the first word (the batch count) is meaningful.
pub const PUSH_CONSTANT_SIZE: u32 = 8;

/// One immutable compute dispatch.
pub struct Invocation {
    pipeline: Arc<PipelineResources>,
    descriptor_set: vk::DescriptorSet,
    grid: [u32; 3],
    batch_count: u32,
    /// Zero-filled before dispatch when set (gradient accumulation targets)
    clear_range: Option<BoundRange>,
    bound_ranges: Vec<BoundRange>,
    device: Arc<Device>,
}

impl Invocation {
    pub fn new(
        device: Arc<Device>,
        pipeline: Arc<PipelineResources>,
        descriptor_set: vk::DescriptorSet,
        grid: [u32; 3],
        batch_count: u32,
        clear_range: Option<BoundRange>,
        bound_ranges: Vec<BoundRange>,
    ) -> Self {
        Self {
            pipeline,
            descriptor_set,
            grid,
            batch_count,
            clear_range,
            bound_ranges,
            device,
        }
    }

    pub fn grid(&self) -> [u32; 3] {
        self.grid
    }

    pub fn batch_count(&self) -> u32 {
        self.batch_count
    }

    /// Record this dispatch into `cmd`.
    ///
    /// Order is fixed: bind, optional clear with its publishing barrier,
    /// push, dispatch, then one barrier per bound range so the next
    /// invocation in the sequence observes every write.
    pub fn record(&self, cmd: vk::CommandBuffer) -> Result<(), NnError> {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline.layout(),
                0,
                &[self.descriptor_set],
                &[],
            );
            self.device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline.pipeline(),
            );

            if let Some(range) = self.clear_range {
                self.device
                    .cmd_fill_buffer(cmd, range.buffer, range.offset, range.size, 0);
                let barrier = vk::BufferMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(range.buffer)
                    .offset(range.offset)
                    .size(range.size);
                self.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[barrier],
                    &[],
                );
            }

            let push = [self.batch_count, 0u32];
            self.device.cmd_push_constants(
                cmd,
                self.pipeline.layout(),
                vk::ShaderStageFlags::COMPUTE,
                0,
                bytemuck::bytes_of(&push),
            );

            self.device
                .cmd_dispatch(cmd, self.grid[0], self.grid[1], self.grid[2]);

            // Conservative read|write barrier per bound range; the same
            // recorded sequence replays every step.
            let barriers: Vec<vk::BufferMemoryBarrier> = self
                .bound_ranges
                .iter()
                .map(|range| {
                    vk::BufferMemoryBarrier::default()
                        .src_access_mask(
                            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                        )
                        .dst_access_mask(
                            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                        )
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(range.buffer)
                        .offset(range.offset)
                        .size(range.size)
                })
                .collect();
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &barriers,
                &[],
            );
        }

        log::debug!(
            "Recorded dispatch: grid=({}, {}, {}), batch={}, clears={}",
            self.grid[0],
            self.grid[1],
            self.grid[2],
            self.batch_count,
            self.clear_range.is_some()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_block_layout() {
        // One meaningful word pushed into the declared 8-byte block
        let push = [7u32, 0u32];
        let bytes = bytemuck::bytes_of(&push);
        assert_eq!(bytes.len(), PUSH_CONSTANT_SIZE as usize);
        assert_eq!(&bytes[0..4], &7u32.to_le_bytes());
    }
}
