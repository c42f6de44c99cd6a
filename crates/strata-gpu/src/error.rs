//! GPU error types.

use ash::vk;
use thiserror::Error;

use crate::transient::TransientUsage;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loader(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// No queue family supports graphics, compute and (when windowed) present.
    #[error("No queue family with graphics+compute+present support")]
    NoSuitableQueueFamily,

    /// No memory type satisfies the required property flags.
    #[error("No memory type with flags {required:?} in type bits {type_bits:#b}")]
    NoSuitableMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The per-frame transient arena has no room left. Retry after a frame retires.
    #[error("Transient {usage:?} memory exhausted: requested {requested} bytes, {available} left this frame")]
    OutOfTransientMemory {
        usage: TransientUsage,
        requested: u64,
        available: u64,
    },

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// The swapchain no longer matches the surface and must be recreated.
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Shader module creation failed.
    #[error("Shader compilation failed: {0}")]
    ShaderCompilation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Pixel format has no Vulkan equivalent.
    #[error("Unsupported pixel format: {0}")]
    UnsupportedFormat(String),

    /// A usage transition has no well-defined layout or destination stage.
    #[error("Invalid usage transition: {0}")]
    InvalidUsageTransition(String),

    /// A submission asked to wait on more semaphores than configured.
    #[error("Too many wait semaphores: {count} (max {max})")]
    TooManyWaitSemaphores { count: usize, max: usize },

    /// A resource group exceeds the configured descriptor limits.
    #[error("Descriptor limit exceeded: {0}")]
    DescriptorLimit(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Whether the caller may retry the operation once more frame budget frees up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OutOfTransientMemory { .. })
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Logs the single fatal message of a failed initialization step.
pub(crate) trait InitStep<T> {
    fn init_step(self, subsystem: &str) -> Result<T>;
}

impl<T, E: Into<GpuError>> InitStep<T> for std::result::Result<T, E> {
    fn init_step(self, subsystem: &str) -> Result<T> {
        self.map_err(|e| {
            let e = e.into();
            tracing::error!("GPU initialization failed in {subsystem}: {e}");
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_exhaustion_is_retryable() {
        let exhausted = GpuError::OutOfTransientMemory {
            usage: TransientUsage::Uniform,
            requested: 512,
            available: 64,
        };
        assert!(exhausted.is_retryable());
        assert!(!GpuError::NoSuitableDevice.is_retryable());
        assert!(!GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST).is_retryable());
    }
}
