//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::deferred::{DeferredDeletionQueue, Garbage};
use crate::error::{GpuError, InitStep, Result};
use crate::instance::{
    create_instance, find_queue_family, headless_instance_extensions, select_physical_device,
};
use crate::memory::GpuMemoryManager;
use crate::surface::{required_extensions, SurfaceContext};
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_char, CStr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Device, queue and memory shared by every GPU object.
///
/// Objects hold an `Arc<GpuContext>`, so the device outlives all of them. Their
/// destruction is routed through [`GpuContext::defer_destroy`].
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) memory: GpuMemoryManager,

    // A single graphics+compute(+present) queue.
    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,

    pub(crate) surface: Option<SurfaceContext>,

    deferred: Mutex<DeferredDeletionQueue<Garbage>>,
    generation: AtomicU64,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the device memory allocator.
    pub fn memory(&self) -> &GpuMemoryManager {
        &self.memory
    }

    /// The submission queue. Callers must serialize access to it.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// The window surface, if created with [`GpuContextBuilder::build_with_window`].
    pub fn surface(&self) -> Option<&SurfaceContext> {
        self.surface.as_ref()
    }

    /// Generation new garbage is tagged with.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    /// Destroy `garbage` once the current generation has completed.
    pub fn defer_destroy(&self, garbage: Garbage) {
        let generation = self.generation();
        self.deferred.lock().queue(garbage, generation);
    }

    /// Destroy all garbage of generations up to `completed`.
    pub fn collect_garbage(&self, completed: u64) {
        let retired = self.deferred.lock().retire(completed);
        if !retired.is_empty() {
            tracing::trace!("Destroying {} deferred objects", retired.len());
        }
        for garbage in retired {
            garbage.destroy(self);
        }
    }

    /// Destroy all garbage. The device must be idle.
    pub(crate) fn collect_all_garbage(&self) {
        let drained = self.deferred.lock().drain();
        for garbage in drained {
            garbage.destroy(self);
        }
    }

    /// Objects waiting for their generation to complete.
    pub fn pending_garbage(&self) -> usize {
        self.deferred.lock().pending_count()
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.collect_all_garbage();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.memory.shutdown();

            self.device.destroy_device(None);
            if let Some(surface) = &self.surface {
                surface.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Strata".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build a context without presentation support.
    pub fn build(self) -> Result<Arc<GpuContext>> {
        let entry = load_entry()?;
        let extensions = headless_instance_extensions();
        let instance = unsafe {
            create_instance(&entry, &self.app_name, self.enable_validation, &extensions)
        }
        .init_step("instance")?;

        finish(entry, instance, None)
    }

    /// Build a context that can present to `window`.
    pub fn build_with_window<W>(self, window: &W) -> Result<Arc<GpuContext>>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = load_entry()?;
        let mut extensions = required_extensions(window).init_step("surface")?;
        extensions.extend(headless_instance_extensions());

        let instance = unsafe {
            create_instance(&entry, &self.app_name, self.enable_validation, &extensions)
        }
        .init_step("instance")?;

        let surface = match unsafe { SurfaceContext::from_window(&entry, &instance, window) }
            .init_step("surface")
        {
            Ok(surface) => surface,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        finish(entry, instance, Some(surface))
    }
}

fn load_entry() -> Result<ash::Entry> {
    unsafe { ash::Entry::load() }
        .map_err(|e| GpuError::Loader(e.to_string()))
        .init_step("loader")
}

/// Pick the device and create everything that depends on it. Destroys the
/// instance and surface when a later step fails.
fn finish(
    entry: ash::Entry,
    instance: ash::Instance,
    surface: Option<SurfaceContext>,
) -> Result<Arc<GpuContext>> {
    let device_parts = unsafe { create_device_parts(&instance, surface.as_ref()) };
    let (physical_device, queue_family, capabilities, device) = match device_parts {
        Ok(parts) => parts,
        Err(e) => {
            unsafe {
                if let Some(surface) = &surface {
                    surface.destroy();
                }
                instance.destroy_instance(None);
            }
            return Err(e);
        }
    };

    let memory = match unsafe { GpuMemoryManager::new(&instance, &device, physical_device) }
        .init_step("memory allocator")
    {
        Ok(memory) => memory,
        Err(e) => {
            unsafe {
                device.destroy_device(None);
                if let Some(surface) = &surface {
                    surface.destroy();
                }
                instance.destroy_instance(None);
            }
            return Err(e);
        }
    };

    let queue = unsafe { device.get_device_queue(queue_family, 0) };

    Ok(Arc::new(GpuContext {
        entry,
        instance,
        physical_device,
        device: Arc::new(device),
        capabilities,
        memory,
        queue_family,
        queue,
        surface,
        deferred: Mutex::new(DeferredDeletionQueue::new()),
        generation: AtomicU64::new(0),
    }))
}

/// # Safety
/// The instance and surface must be valid.
unsafe fn create_device_parts(
    instance: &ash::Instance,
    surface: Option<&SurfaceContext>,
) -> Result<(vk::PhysicalDevice, u32, GpuCapabilities, ash::Device)> {
    let (physical_device, queue_family) = unsafe {
        select_physical_device(instance, |physical_device| {
            let families =
                instance.get_physical_device_queue_family_properties(physical_device);
            find_queue_family(&families, |family| {
                surface.map_or(true, |s| s.supports_present(physical_device, family))
            })
        })
    }
    .init_step("physical device selection")?;

    let capabilities = unsafe { GpuCapabilities::query(instance, physical_device) };

    if !capabilities.meets_requirements() {
        tracing::error!(
            "GPU initialization failed in physical device selection: {} does not meet requirements",
            capabilities.summary()
        );
        return Err(GpuError::NoSuitableDevice);
    }

    tracing::info!("Selected GPU: {}", capabilities.summary());

    let device = unsafe {
        create_device(
            instance,
            physical_device,
            queue_family,
            &capabilities,
            surface.is_some(),
        )
    }
    .init_step("logical device")?;

    Ok((physical_device, queue_family, capabilities, device))
}

const PORTABILITY_SUBSET: &CStr = c"VK_KHR_portability_subset";

/// Required device extensions.
fn required_device_extensions(
    capabilities: &GpuCapabilities,
    presentable: bool,
) -> Vec<&'static CStr> {
    let mut extensions = Vec::new();
    if presentable {
        extensions.push(ash::khr::swapchain::NAME);
    }
    // MoltenVK requires enabling the portability subset when it is exposed.
    if capabilities.has_extension(PORTABILITY_SUBSET) {
        extensions.push(PORTABILITY_SUBSET);
    }
    extensions
}

/// Create the logical device with one queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    capabilities: &GpuCapabilities,
    presentable: bool,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extensions = required_device_extensions(capabilities, presentable);
    let extension_names: Vec<*const c_char> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(capabilities.supports_sampler_anisotropy)
        .occlusion_query_precise(capabilities.supports_occlusion_query_precise);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(GpuError::from)?;

    Ok(device)
}
