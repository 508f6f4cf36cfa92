//! Error types for the rendering backend.

use ash::vk;

use crate::command::CommandBufferState;

pub type RhiResult<T> = Result<T, RhiError>;

/// Errors surfaced by device setup and resource management.
#[derive(Debug)]
pub enum RhiError {
    /// Requested configuration cannot be satisfied by any adapter.
    Config(String),
    /// Device memory allocation failed.
    Allocation(gpu_allocator::AllocationError),
    /// Staging copy to a device resource failed.
    Upload(String),
    /// The logical device was lost; the device must be rebuilt.
    DeviceLost,
    /// A command buffer was used in the wrong state.
    Record {
        state: CommandBufferState,
        operation: &'static str,
    },
    /// A Vulkan call returned an error code.
    Vulkan(vk::Result),
    /// Library or instance loading failed.
    Loading(String),
}

impl std::fmt::Display for RhiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RhiError::Config(msg) => write!(f, "Configuration not supported: {}", msg),
            RhiError::Allocation(e) => write!(f, "Device allocation failed: {}", e),
            RhiError::Upload(msg) => write!(f, "Upload failed: {}", msg),
            RhiError::DeviceLost => write!(f, "Device lost"),
            RhiError::Record { state, operation } => write!(
                f,
                "Command buffer in state {:?} cannot perform {}",
                state, operation
            ),
            RhiError::Vulkan(r) => write!(f, "Vulkan call failed: {:?}", r),
            RhiError::Loading(msg) => write!(f, "Loading failed: {}", msg),
        }
    }
}

impl std::error::Error for RhiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RhiError::Allocation(e) => Some(e),
            RhiError::Vulkan(r) => Some(r),
            _ => None,
        }
    }
}

impl From<vk::Result> for RhiError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => RhiError::DeviceLost,
            other => RhiError::Vulkan(other),
        }
    }
}

impl From<gpu_allocator::AllocationError> for RhiError {
    fn from(e: gpu_allocator::AllocationError) -> Self {
        RhiError::Allocation(e)
    }
}

impl From<ash::LoadingError> for RhiError {
    fn from(e: ash::LoadingError) -> Self {
        RhiError::Loading(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_is_mapped_from_vk() {
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_DEVICE_LOST),
            RhiError::DeviceLost
        ));
        assert!(matches!(
            RhiError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RhiError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));
    }
}
