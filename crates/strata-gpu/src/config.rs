//! Initialization-time configuration.

use serde::{Deserialize, Serialize};

/// Number of frames the CPU may run ahead of the GPU. Also the swapchain image count.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Maximum color attachments of a framebuffer or pipeline.
pub const MAX_COLOR_ATTACHMENTS: usize = 4;

/// Maximum vertex buffer bindings of a resource group.
pub const MAX_VERTEX_ATTRIBUTES: usize = 8;

/// Per-frame budgets of the transient rings, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientMemoryConfig {
    pub uniform_per_frame: u64,
    pub storage_per_frame: u64,
    pub transfer_per_frame: u64,
}

impl Default for TransientMemoryConfig {
    fn default() -> Self {
        Self {
            uniform_per_frame: 1024 * 1024,
            storage_per_frame: 1024 * 1024,
            transfer_per_frame: 16 * 1024 * 1024,
        }
    }
}

/// Sizing of the global descriptor-set layout shared by every resource group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorLimits {
    pub max_textures: u32,
    pub max_uniform_buffers: u32,
    pub max_storage_buffers: u32,
    /// Upper bound of live resource groups (descriptor pool capacity).
    pub max_resource_groups: u32,
    /// Descriptor sets in the global pipeline layout.
    pub max_bound_resource_groups: u32,
}

impl Default for DescriptorLimits {
    fn default() -> Self {
        Self {
            max_textures: 10,
            max_uniform_buffers: 4,
            max_storage_buffers: 4,
            max_resource_groups: 1024,
            max_bound_resource_groups: 2,
        }
    }
}

impl DescriptorLimits {
    /// Binding index of the first uniform buffer in the global layout.
    pub fn first_uniform_binding(&self) -> u32 {
        self.max_textures
    }

    /// Binding index of the first storage buffer in the global layout.
    pub fn first_storage_binding(&self) -> u32 {
        self.max_textures + self.max_uniform_buffers
    }

    /// Number of dynamic offsets every descriptor-set bind must supply.
    pub fn dynamic_offset_count(&self) -> usize {
        (self.max_uniform_buffers + self.max_storage_buffers) as usize
    }
}

/// Configuration consumed by [`crate::GrManager::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GrConfig {
    pub app_name: String,
    /// Enable validation layers.
    pub validation: bool,
    /// FIFO presentation when true, mailbox/immediate otherwise.
    pub vsync: bool,
    /// Used only when the surface does not dictate its extent.
    pub width: u32,
    pub height: u32,
    pub transient: TransientMemoryConfig,
    pub descriptors: DescriptorLimits,
    /// Upper bound of semaphores a single submission may wait on.
    pub max_wait_semaphores: usize,
}

impl Default for GrConfig {
    fn default() -> Self {
        Self {
            app_name: "Strata".to_string(),
            validation: cfg!(debug_assertions),
            vsync: true,
            width: 1280,
            height: 720,
            transient: TransientMemoryConfig::default(),
            descriptors: DescriptorLimits::default(),
            max_wait_semaphores: 16,
        }
    }
}

impl GrConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Set the surface size hint.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the transient ring budgets.
    pub fn with_transient(mut self, transient: TransientMemoryConfig) -> Self {
        self.transient = transient;
        self
    }

    /// Set the descriptor limits.
    pub fn with_descriptors(mut self, descriptors: DescriptorLimits) -> Self {
        self.descriptors = descriptors;
        self
    }

    /// Set the per-submission wait semaphore limit.
    pub fn with_max_wait_semaphores(mut self, max: usize) -> Self {
        self.max_wait_semaphores = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_ranges_are_contiguous() {
        let limits = DescriptorLimits {
            max_textures: 3,
            max_uniform_buffers: 2,
            max_storage_buffers: 5,
            ..DescriptorLimits::default()
        };
        assert_eq!(limits.first_uniform_binding(), 3);
        assert_eq!(limits.first_storage_binding(), 5);
        assert_eq!(limits.dynamic_offset_count(), 7);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = GrConfig::new()
            .with_app_name("soak")
            .with_validation(false)
            .with_max_wait_semaphores(4);
        assert_eq!(config.app_name, "soak");
        assert!(!config.validation);
        assert_eq!(config.max_wait_semaphores, 4);
        assert_eq!(config.transient, TransientMemoryConfig::default());
    }
}
