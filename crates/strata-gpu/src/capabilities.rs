//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

use crate::config::{DescriptorLimits, MAX_COLOR_ATTACHMENTS};
use crate::error::{GpuError, Result};

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone, Default)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: Option<GpuVendor>,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    // Memory info
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,
    /// Granularity of flush/invalidate ranges on non-coherent memory.
    pub non_coherent_atom_size: u64,

    // Offset alignments
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub optimal_buffer_copy_offset_alignment: u64,

    // Descriptor limits
    pub max_bound_descriptor_sets: u32,
    pub max_per_stage_descriptor_samplers: u32,
    pub max_descriptor_set_uniform_buffers_dynamic: u32,
    pub max_descriptor_set_storage_buffers_dynamic: u32,

    // Rasterization
    pub max_color_attachments: u32,
    pub max_sampler_anisotropy: f32,
    pub supports_sampler_anisotropy: bool,
    pub supports_occlusion_query_precise: bool,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                ext.extension_name_as_c_str()
                    .ok()
                    .and_then(|name| name.to_str().ok())
                    .map(String::from)
            })
            .collect();

        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let limits = &properties.limits;

        Self {
            vendor: Some(GpuVendor::from_vendor_id(properties.vendor_id)),
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            device_local_memory_mb,
            max_memory_allocation_count: limits.max_memory_allocation_count,
            non_coherent_atom_size: limits.non_coherent_atom_size,

            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            optimal_buffer_copy_offset_alignment: limits.optimal_buffer_copy_offset_alignment,

            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
            max_per_stage_descriptor_samplers: limits.max_per_stage_descriptor_samplers,
            max_descriptor_set_uniform_buffers_dynamic: limits
                .max_descriptor_set_uniform_buffers_dynamic,
            max_descriptor_set_storage_buffers_dynamic: limits
                .max_descriptor_set_storage_buffers_dynamic,

            max_color_attachments: limits.max_color_attachments,
            max_sampler_anisotropy: limits.max_sampler_anisotropy,
            supports_sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            supports_occlusion_query_precise: features.occlusion_query_precise == vk::TRUE,

            available_extensions,
        }
    }

    /// Whether the device extension `name` is available.
    pub fn has_extension(&self, name: &CStr) -> bool {
        name.to_str()
            .is_ok_and(|name| self.available_extensions.contains(name))
    }

    /// Check if the GPU meets minimum requirements.
    pub fn meets_requirements(&self) -> bool {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);

        if api_major < 1 || (api_major == 1 && api_minor < 1) {
            return false;
        }

        self.max_color_attachments as usize >= MAX_COLOR_ATTACHMENTS
    }

    /// Verify the device can hold the global descriptor layout described by `limits`.
    pub fn check_descriptor_limits(&self, limits: &DescriptorLimits) -> Result<()> {
        if limits.max_bound_resource_groups == 0 {
            return Err(GpuError::DescriptorLimit(
                "max_bound_resource_groups must be at least 1".to_string(),
            ));
        }
        if limits.max_bound_resource_groups > self.max_bound_descriptor_sets {
            return Err(GpuError::DescriptorLimit(format!(
                "{} bound resource groups requested, device allows {} descriptor sets",
                limits.max_bound_resource_groups, self.max_bound_descriptor_sets
            )));
        }
        if limits.max_textures > self.max_per_stage_descriptor_samplers {
            return Err(GpuError::DescriptorLimit(format!(
                "{} textures requested, device allows {} samplers per stage",
                limits.max_textures, self.max_per_stage_descriptor_samplers
            )));
        }
        let uniforms = limits.max_uniform_buffers * limits.max_bound_resource_groups;
        if uniforms > self.max_descriptor_set_uniform_buffers_dynamic {
            return Err(GpuError::DescriptorLimit(format!(
                "{uniforms} dynamic uniform buffers requested, device allows {}",
                self.max_descriptor_set_uniform_buffers_dynamic
            )));
        }
        let storages = limits.max_storage_buffers * limits.max_bound_resource_groups;
        if storages > self.max_descriptor_set_storage_buffers_dynamic {
            return Err(GpuError::DescriptorLimit(format!(
                "{storages} dynamic storage buffers requested, device allows {}",
                self.max_descriptor_set_storage_buffers_dynamic
            )));
        }
        Ok(())
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desktop_caps() -> GpuCapabilities {
        GpuCapabilities {
            api_version: vk::API_VERSION_1_2,
            max_bound_descriptor_sets: 8,
            max_per_stage_descriptor_samplers: 16,
            max_descriptor_set_uniform_buffers_dynamic: 8,
            max_descriptor_set_storage_buffers_dynamic: 8,
            max_color_attachments: 8,
            ..Default::default()
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn requires_vulkan_1_1() {
        let mut caps = desktop_caps();
        assert!(caps.meets_requirements());
        caps.api_version = vk::API_VERSION_1_0;
        assert!(!caps.meets_requirements());
    }

    #[test]
    fn default_descriptor_limits_fit_desktop_device() {
        desktop_caps()
            .check_descriptor_limits(&DescriptorLimits::default())
            .unwrap();
    }

    #[test]
    fn descriptor_limits_are_checked_per_bound_group() {
        let limits = DescriptorLimits {
            max_uniform_buffers: 5,
            ..Default::default()
        };
        let err = desktop_caps().check_descriptor_limits(&limits).unwrap_err();
        assert!(matches!(err, GpuError::DescriptorLimit(_)));

        let limits = DescriptorLimits {
            max_bound_resource_groups: 0,
            ..Default::default()
        };
        assert!(desktop_caps().check_descriptor_limits(&limits).is_err());
    }
}
