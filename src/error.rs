//! Error types for the training engine
//!
//! One enum covers every failure class: bootstrap, graph construction,
//! dispatch sizing, and weight-file persistence. Construction errors are
//! raised before any pipeline is compiled, so a failed build leaves no
//! partially-initialized network behind.

use std::path::PathBuf;
use thiserror::Error;

/// Enumeration of all engine errors.
#[derive(Error, Debug)]
pub enum NnError {
    /// Vulkan loader or instance creation failed
    #[error("Vulkan unavailable: {0}")]
    VulkanUnavailable(String),

    /// No physical device usable for compute
    #[error("No suitable GPU found with compute queue support")]
    DeviceUnavailable,

    /// Selected device index past the end of the enumeration
    #[error("Device index {index} out of range ({count} devices present)")]
    DeviceIndexOutOfRange { index: usize, count: usize },

    /// No queue family on the selected device supports compute
    #[error("No compute queue family on the selected device")]
    QueueUnavailable,

    /// A derived dispatch dimension exceeds a device limit
    #[error("Work size exceeds device dispatch limits")]
    TooLargeData,

    /// A buffer view length disagrees with the shape-derived expectation
    #[error("Data length does not match the declared shape")]
    InvalidDataLength,

    /// Weight or shader file could not be read or written
    #[error("Unable to load file: {0}")]
    UnableToLoadFile(PathBuf),

    /// Weight file checksum mismatch
    #[error("Weight file is corrupted (checksum mismatch)")]
    CorruptedFile,

    /// Vulkan API returned an error
    #[error("Vulkan API error: {0:?}")]
    Api(ash::vk::Result),
}

impl From<ash::vk::Result> for NnError {
    fn from(result: ash::vk::Result) -> Self {
        NnError::Api(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NnError::DeviceIndexOutOfRange { index: 3, count: 1 };
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_api_conversion() {
        let err: NnError = ash::vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, NnError::Api(ash::vk::Result::ERROR_DEVICE_LOST)));
    }

    #[test]
    fn test_file_error_carries_path() {
        let err = NnError::UnableToLoadFile(PathBuf::from("weights.bin"));
        assert!(err.to_string().contains("weights.bin"));
    }
}
