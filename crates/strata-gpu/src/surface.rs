//! Surface management for windowed rendering.
//!
//! Hides the raw-window-handle plumbing from application code. The surface is
//! created together with the instance because device selection needs to know
//! which queue family can present to it.

use std::ffi::c_char;

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Instance extensions required to present to `window`.
pub fn required_extensions<W>(window: &W) -> Result<Vec<*const c_char>>
where
    W: HasDisplayHandle,
{
    let display = window
        .display_handle()
        .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;

    let extensions = ash_window::enumerate_required_extensions(display.as_raw())
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

    Ok(extensions.to_vec())
}

/// A window surface and its extension loader.
pub struct SurfaceContext {
    /// The Vulkan surface handle.
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader.
    pub surface_loader: ash::khr::surface::Instance,
}

impl SurfaceContext {
    /// Create a surface for a window.
    ///
    /// # Safety
    /// The instance must have been created with [`required_extensions`] and the
    /// window must outlive the surface.
    pub unsafe fn from_window<W>(
        entry: &ash::Entry,
        instance: &ash::Instance,
        window: &W,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(entry, instance);

        Ok(Self {
            surface,
            surface_loader,
        })
    }

    /// Whether `queue_family` of `physical_device` can present to this surface.
    pub fn supports_present(&self, physical_device: vk::PhysicalDevice, queue_family: u32) -> bool {
        unsafe {
            self.surface_loader.get_physical_device_surface_support(
                physical_device,
                queue_family,
                self.surface,
            )
        }
        .unwrap_or(false)
    }

    /// Query surface capabilities.
    pub fn capabilities(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceCapabilities> {
        unsafe {
            let caps = self
                .surface_loader
                .get_physical_device_surface_capabilities(physical_device, self.surface)?;

            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(physical_device, self.surface)?;

            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(physical_device, self.surface)?;

            Ok(SurfaceCapabilities {
                capabilities: caps,
                formats,
                present_modes,
            })
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// The surface must not be in use.
    pub unsafe fn destroy(&self) {
        unsafe { self.surface_loader.destroy_surface(self.surface, None) };
    }
}

/// Surface capabilities query result.
pub struct SurfaceCapabilities {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}
