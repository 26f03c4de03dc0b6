//! SPIR-V shader module loading
//!
//! `ShaderModule` wraps one VkShaderModule; `OperatorModules` loads the
//! fixed set of operator kernels from a shader directory by name, once,
//! at startup.

use ash::{vk, Device};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use crate::context::Context;
use crate::error::NnError;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Wrapper around VkShaderModule.
pub struct ShaderModule {
    handle: vk::ShaderModule,
    device: Arc<Device>,
}

impl ShaderModule {
    /// Create a shader module from raw SPIR-V bytes.
    ///
    /// Rejects byte streams without the SPIR-V magic number before handing
    /// them to the driver.
    pub fn from_bytes(ctx: &Context, bytes: &[u8]) -> Result<Arc<Self>, NnError> {
        let words = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|_| NnError::InvalidDataLength)?;
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(NnError::InvalidDataLength);
        }

        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let handle = unsafe { ctx.device().create_shader_module(&create_info, None) }?;

        log::debug!("Created shader module ({} words)", words.len());
        Ok(Arc::new(Self {
            handle,
            device: ctx.device().clone(),
        }))
    }

    /// Load and create a shader module from a `.spv` file.
    pub fn from_file(ctx: &Context, path: &Path) -> Result<Arc<Self>, NnError> {
        let bytes =
            std::fs::read(path).map_err(|_| NnError::UnableToLoadFile(path.to_path_buf()))?;
        log::debug!("Loaded shader {:?} ({} bytes)", path, bytes.len());
        Self::from_bytes(ctx, &bytes)
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.handle, None);
        }
    }
}

/// One shader module per operator kernel.
pub struct OperatorModules {
    pub init: Arc<ShaderModule>,
    pub affine_forward: Arc<ShaderModule>,
    pub affine_backward: Arc<ShaderModule>,
    pub relu_forward: Arc<ShaderModule>,
    pub relu_backward: Arc<ShaderModule>,
    pub tanh_forward: Arc<ShaderModule>,
    pub tanh_backward: Arc<ShaderModule>,
    pub conv_forward: Arc<ShaderModule>,
    pub conv_backward_weight: Arc<ShaderModule>,
    pub conv_backward_input: Arc<ShaderModule>,
    pub conv_straight_forward: Arc<ShaderModule>,
    pub conv_straight_backward_weight: Arc<ShaderModule>,
    pub conv_straight_backward_input: Arc<ShaderModule>,
    pub maxpool_forward: Arc<ShaderModule>,
    pub maxpool_backward: Arc<ShaderModule>,
    pub softmax_combined: Arc<ShaderModule>,
}

impl OperatorModules {
    /// Load every operator kernel from `dir` by its fixed file name.
    pub fn load(ctx: &Context, dir: &Path) -> Result<Self, NnError> {
        let load = |name: &str| ShaderModule::from_file(ctx, &dir.join(name));
        let modules = Self {
            init: load("init.comp.spv")?,
            affine_forward: load("affine_forward.comp.spv")?,
            affine_backward: load("affine_backward.comp.spv")?,
            relu_forward: load("relu_forward.comp.spv")?,
            relu_backward: load("relu_backward.comp.spv")?,
            tanh_forward: load("tanh_forward.comp.spv")?,
            tanh_backward: load("tanh_backward.comp.spv")?,
            conv_forward: load("conv_forward.comp.spv")?,
            conv_backward_weight: load("conv_backward_weight.comp.spv")?,
            conv_backward_input: load("conv_backward_input.comp.spv")?,
            conv_straight_forward: load("conv_straight_forward.comp.spv")?,
            conv_straight_backward_weight: load("conv_straight_backward_weight.comp.spv")?,
            conv_straight_backward_input: load("conv_straight_backward_input.comp.spv")?,
            maxpool_forward: load("maxpool_forward.comp.spv")?,
            maxpool_backward: load("maxpool_backward.comp.spv")?,
            softmax_combined: load("softmax_combined.comp.spv")?,
        };
        log::info!("Loaded operator kernels from {:?}", dir);
        Ok(modules)
    }
}

#[cfg(test)]
mod tests {
    use super::SPIRV_MAGIC;

    #[test]
    fn test_spirv_magic_value() {
        // First word of every valid SPIR-V binary
        assert_eq!(SPIRV_MAGIC.to_le_bytes(), [0x03, 0x02, 0x23, 0x07]);
    }
}
