//! Descriptor set management.
//!
//! Every resource group is a descriptor set of one global layout: textures
//! first, then dynamic uniform buffers, then dynamic storage buffers. The
//! pipeline layout repeats that set layout once per bindable group.

use std::sync::Arc;

use crate::config::DescriptorLimits;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::Mutex;

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None)? };
        Ok(layout)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Binding index and descriptor type of every slot of the global layout.
pub fn global_bindings(limits: &DescriptorLimits) -> Vec<(u32, vk::DescriptorType)> {
    let textures = (0..limits.max_textures).map(|i| (i, vk::DescriptorType::COMBINED_IMAGE_SAMPLER));
    let uniforms = (0..limits.max_uniform_buffers).map(|i| {
        (
            limits.first_uniform_binding() + i,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        )
    });
    let storages = (0..limits.max_storage_buffers).map(|i| {
        (
            limits.first_storage_binding() + i,
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        )
    });
    textures.chain(uniforms).chain(storages).collect()
}

/// Pool sizes that fit `max_resource_groups` fully populated sets.
pub fn global_pool_sizes(limits: &DescriptorLimits) -> Vec<vk::DescriptorPoolSize> {
    [
        (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, limits.max_textures),
        (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, limits.max_uniform_buffers),
        (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, limits.max_storage_buffers),
    ]
    .into_iter()
    .filter(|(_, per_set)| *per_set > 0)
    .map(|(ty, per_set)| {
        vk::DescriptorPoolSize::default()
            .ty(ty)
            .descriptor_count(per_set * limits.max_resource_groups)
    })
    .collect()
}

/// A descriptor pool whose sets can be freed from any thread.
///
/// Shared between the global descriptor state and the deferred-deletion queue,
/// so freed sets never outlive the pool.
pub struct SharedDescriptorPool {
    device: ash::Device,
    pool: Mutex<vk::DescriptorPool>,
}

impl SharedDescriptorPool {
    /// Create a new descriptor pool.
    ///
    /// # Safety
    /// The device must be valid and outlive the pool.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = unsafe { device.create_descriptor_pool(&create_info, None)? };
        Ok(Self {
            device: device.clone(),
            pool: Mutex::new(pool),
        })
    }

    /// Allocate one descriptor set.
    pub fn allocate(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let pool = self.pool.lock();
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(*pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }.map_err(|e| {
            match e {
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    GpuError::DescriptorLimit(format!("Resource group pool exhausted: {e}"))
                }
                e => GpuError::from(e),
            }
        })?;
        sets.into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("No descriptor set allocated".to_string()))
    }

    /// Return a set to the pool. The GPU must be done with it.
    pub fn free(&self, set: vk::DescriptorSet) {
        let pool = self.pool.lock();
        if let Err(e) = unsafe { self.device.free_descriptor_sets(*pool, &[set]) } {
            tracing::error!("Failed to free descriptor set: {e}");
        }
    }
}

impl Drop for SharedDescriptorPool {
    fn drop(&mut self) {
        unsafe { self.device.destroy_descriptor_pool(*self.pool.get_mut(), None) };
    }
}

/// The descriptor set layout and pipeline layout shared by every resource group.
pub struct GlobalDescriptors {
    ctx: Arc<GpuContext>,
    limits: DescriptorLimits,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pool: Arc<SharedDescriptorPool>,
}

impl GlobalDescriptors {
    pub fn new(ctx: Arc<GpuContext>, limits: &DescriptorLimits) -> Result<Self> {
        ctx.capabilities().check_descriptor_limits(limits)?;
        let device = ctx.device();

        let set_layout = global_bindings(limits)
            .into_iter()
            .fold(DescriptorSetLayoutBuilder::new(), |builder, (binding, ty)| {
                builder.binding(binding, ty, 1, vk::ShaderStageFlags::ALL)
            });
        let set_layout = unsafe { set_layout.build(device)? };

        let set_layouts = vec![set_layout; limits.max_bound_resource_groups as usize];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let pipeline_layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(e.into());
            }
        };

        let pool = unsafe {
            SharedDescriptorPool::new(
                device,
                limits.max_resource_groups,
                &global_pool_sizes(limits),
            )
        };
        let pool = match pool {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                unsafe {
                    device.destroy_pipeline_layout(pipeline_layout, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(e);
            }
        };

        tracing::info!(
            "Global descriptor layout: {} textures, {} uniform, {} storage, {} groups",
            limits.max_textures,
            limits.max_uniform_buffers,
            limits.max_storage_buffers,
            limits.max_resource_groups
        );

        Ok(Self {
            ctx,
            limits: *limits,
            set_layout,
            pipeline_layout,
            pool,
        })
    }

    pub fn limits(&self) -> &DescriptorLimits {
        &self.limits
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn pool(&self) -> &Arc<SharedDescriptorPool> {
        &self.pool
    }

    /// Allocate a set with the global layout.
    pub fn allocate(&self) -> Result<vk::DescriptorSet> {
        self.pool.allocate(self.set_layout)
    }
}

impl Drop for GlobalDescriptors {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_pipeline_layout(self.pipeline_layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_are_textures_then_uniforms_then_storage() {
        let limits = DescriptorLimits {
            max_textures: 2,
            max_uniform_buffers: 1,
            max_storage_buffers: 2,
            ..Default::default()
        };
        let bindings = global_bindings(&limits);
        assert_eq!(
            bindings,
            vec![
                (0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
                (1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
                (2, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC),
                (3, vk::DescriptorType::STORAGE_BUFFER_DYNAMIC),
                (4, vk::DescriptorType::STORAGE_BUFFER_DYNAMIC),
            ]
        );
    }

    #[test]
    fn default_layout_has_contiguous_bindings() {
        let limits = DescriptorLimits::default();
        let bindings = global_bindings(&limits);
        assert_eq!(bindings.len(), 18);
        for (i, (binding, _)) in bindings.iter().enumerate() {
            assert_eq!(*binding as usize, i);
        }
    }

    #[test]
    fn pool_sizes_scale_with_group_count() {
        let limits = DescriptorLimits {
            max_textures: 3,
            max_uniform_buffers: 0,
            max_storage_buffers: 1,
            max_resource_groups: 10,
            max_bound_resource_groups: 2,
        };
        let sizes = global_pool_sizes(&limits);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes[0].ty, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(sizes[0].descriptor_count, 30);
        assert_eq!(sizes[1].ty, vk::DescriptorType::STORAGE_BUFFER_DYNAMIC);
        assert_eq!(sizes[1].descriptor_count, 10);
    }
}
