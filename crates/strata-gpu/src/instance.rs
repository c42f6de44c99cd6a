//! Vulkan instance creation and physical device selection.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_char, CStr, CString};

/// Instance extensions needed by a headless context.
pub fn headless_instance_extensions() -> Vec<*const c_char> {
    #[allow(unused_mut)]
    let mut extensions = Vec::new();
    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        extensions.push(ash::khr::get_physical_device_properties2::NAME.as_ptr());
    }
    extensions
}

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance with the given extensions.
///
/// # Safety
/// The entry must be a valid Vulkan entry point and every extension pointer a
/// nul-terminated string that outlives the call.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    extension_names: &[*const c_char],
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::InvalidState(format!("Invalid application name: {e}")))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Strata")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let requested = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Missing layers are skipped rather than failing instance creation.
    let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
    let layers: Vec<&CStr> = requested
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| props.layer_name_as_c_str() == Ok(*layer));
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect();

    let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None)? };

    Ok(instance)
}

/// Select the best physical device that has a queue family accepted by
/// `queue_family`. Returns the device and the family index.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    mut queue_family: impl FnMut(vk::PhysicalDevice) -> Option<u32>,
) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices()? };

    if devices.is_empty() {
        return Err(GpuError::NoSuitableDevice);
    }

    let mut best = None;
    let mut best_score = 0i32;
    let mut any_scored = false;

    for device in devices {
        let score = unsafe { score_physical_device(instance, device) };
        if score < 0 {
            continue;
        }
        any_scored = true;
        let Some(family) = queue_family(device) else {
            continue;
        };
        if best.is_none() || score > best_score {
            best_score = score;
            best = Some((device, family));
        }
    }

    match best {
        Some(best) => Ok(best),
        None if any_scored => Err(GpuError::NoSuitableQueueFamily),
        None => Err(GpuError::NoSuitableDevice),
    }
}

/// Find a queue family supporting graphics and compute, plus presentation
/// when `supports_present` says so.
pub fn find_queue_family(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: impl FnMut(u32) -> bool,
) -> Option<u32> {
    let required = vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE;
    families
        .iter()
        .enumerate()
        .filter(|(_, family)| family.queue_count > 0 && family.queue_flags.contains(required))
        .map(|(i, _)| i as u32)
        .find(|&i| supports_present(i))
}

/// Score a physical device for selection. Negative means unusable.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i32 {
    let properties = unsafe { instance.get_physical_device_properties(device) };

    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 1)
    {
        return -1;
    }

    let mut score = 0;

    // Prefer discrete GPUs
    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    // Prefer more VRAM
    let memory = unsafe { instance.get_physical_device_memory_properties(device) };
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();
    score += i32::try_from(vram_mb / 1024).unwrap_or(i32::MAX / 2); // +1 per GB

    score
}
