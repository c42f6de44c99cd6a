//! GPU memory management.
//!
//! Memory types are chosen explicitly from prefer/avoid property flags and
//! the sub-allocation inside each type is delegated to gpu-allocator.

use std::ptr::NonNull;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;

use crate::error::{GpuError, Result};

/// Pick a memory type from `type_bits`.
///
/// Returns the first type that has every `prefer` flag and none of the `avoid`
/// flags. Falls back to the first type that only has the `prefer` flags.
pub fn select_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    prefer: vk::MemoryPropertyFlags,
    avoid: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let mut acceptable = None;

    for i in 0..properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32) {
        if type_bits & (1 << i) == 0 {
            continue;
        }
        let flags = properties.memory_types[i as usize].property_flags;
        if !flags.contains(prefer) {
            continue;
        }
        if !flags.intersects(avoid) {
            return Ok(i);
        }
        acceptable.get_or_insert(i);
    }

    acceptable.ok_or(GpuError::NoSuitableMemoryType {
        type_bits,
        required: prefer,
    })
}

/// A sub-allocation owned by exactly one buffer or image.
pub struct GpuMemoryAllocation {
    memory_type_index: u32,
    allocation: Allocation,
}

impl GpuMemoryAllocation {
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        unsafe { self.allocation.memory() }
    }

    pub fn offset(&self) -> u64 {
        self.allocation.offset()
    }

    pub fn size(&self) -> u64 {
        self.allocation.size()
    }

    /// Start of the allocation in host address space, for host-visible types.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation.mapped_ptr().map(NonNull::cast)
    }
}

/// Device memory allocator shared by every thread.
pub struct GpuMemoryManager {
    allocator: Mutex<Option<Allocator>>,
    properties: vk::PhysicalDeviceMemoryProperties,
}

impl GpuMemoryManager {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        tracing::info!(
            "Memory: {} types, {} heaps",
            properties.memory_type_count,
            properties.memory_heap_count
        );

        Ok(Self {
            allocator: Mutex::new(Some(allocator)),
            properties,
        })
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.properties
    }

    /// See [`select_memory_type`].
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        prefer: vk::MemoryPropertyFlags,
        avoid: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        select_memory_type(&self.properties, type_bits, prefer, avoid)
    }

    pub fn memory_type_flags(&self, memory_type_index: u32) -> vk::MemoryPropertyFlags {
        self.properties.memory_types[memory_type_index as usize].property_flags
    }

    /// Allocate from a specific memory type.
    pub fn allocate(
        &self,
        name: &str,
        mut requirements: vk::MemoryRequirements,
        memory_type_index: u32,
        linear: bool,
    ) -> Result<GpuMemoryAllocation> {
        // A single bit with no location flags pins gpu-allocator to our choice.
        requirements.memory_type_bits = 1 << memory_type_index;

        let allocation = self
            .allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::Unknown,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(GpuMemoryAllocation {
            memory_type_index,
            allocation,
        })
    }

    /// Return an allocation to its memory type.
    pub fn free(&self, allocation: GpuMemoryAllocation) -> Result<()> {
        self.allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .free(allocation.allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))
    }

    /// Shutdown the allocator, freeing all GPU memory.
    ///
    /// This must be called before the Vulkan device is destroyed.
    /// Any remaining allocations will be freed (and logged as leaks).
    pub fn shutdown(&self) {
        drop(self.allocator.lock().take());
    }
}

impl Drop for GpuMemoryManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            memory_heap_count: 1,
            ..Default::default()
        };
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: *flags,
                heap_index: 0,
            };
        }
        props
    }

    const DEVICE_LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    const HOST_VISIBLE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const HOST_COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;

    #[test]
    fn prefers_device_local_without_host_visibility() {
        let props = properties(&[
            DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT,
            HOST_VISIBLE | HOST_COHERENT,
            DEVICE_LOCAL,
        ]);
        let index = select_memory_type(&props, 0b111, DEVICE_LOCAL, HOST_VISIBLE).unwrap();
        assert_eq!(index, 2);
    }

    #[test]
    fn falls_back_when_every_candidate_has_avoided_flags() {
        let props = properties(&[
            HOST_VISIBLE | HOST_COHERENT,
            DEVICE_LOCAL | HOST_VISIBLE,
            DEVICE_LOCAL | HOST_VISIBLE | HOST_COHERENT,
        ]);
        let index = select_memory_type(&props, 0b111, DEVICE_LOCAL, HOST_VISIBLE).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn first_unavoided_type_wins() {
        let props = properties(&[HOST_VISIBLE, DEVICE_LOCAL, DEVICE_LOCAL]);
        let index = select_memory_type(&props, 0b111, DEVICE_LOCAL, HOST_VISIBLE).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn respects_type_bits() {
        let props = properties(&[DEVICE_LOCAL, DEVICE_LOCAL | HOST_VISIBLE]);
        let index = select_memory_type(&props, 0b10, DEVICE_LOCAL, HOST_VISIBLE).unwrap();
        assert_eq!(index, 1);
    }

    #[test]
    fn fails_without_preferred_flags() {
        let props = properties(&[HOST_VISIBLE, HOST_VISIBLE | HOST_COHERENT]);
        let err = select_memory_type(&props, 0b11, DEVICE_LOCAL, vk::MemoryPropertyFlags::empty())
            .unwrap_err();
        assert!(matches!(
            err,
            GpuError::NoSuitableMemoryType { type_bits: 0b11, .. }
        ));
    }

    #[test]
    fn empty_avoid_accepts_any_match() {
        let props = properties(&[HOST_VISIBLE | HOST_COHERENT]);
        let index = select_memory_type(
            &props,
            0b1,
            HOST_VISIBLE | HOST_COHERENT,
            vk::MemoryPropertyFlags::empty(),
        )
        .unwrap();
        assert_eq!(index, 0);
    }
}
