//! Swapchain management.

use std::sync::Arc;

use crate::config::MAX_FRAMES_IN_FLIGHT;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::format::PixelFormat;
use ash::vk;

/// Swapchain of exactly `MAX_FRAMES_IN_FLIGHT` images and their views.
pub struct SwapchainState {
    ctx: Arc<GpuContext>,
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: PixelFormat,
    extent: vk::Extent2D,
}

impl SwapchainState {
    /// Create the swapchain for the context's surface.
    pub fn new(ctx: Arc<GpuContext>, width: u32, height: u32, vsync: bool) -> Result<Self> {
        let surface = ctx
            .surface()
            .ok_or_else(|| GpuError::SwapchainCreation("Context has no surface".to_string()))?;
        let caps = surface.capabilities(ctx.physical_device())?;

        let image_count = select_image_count(&caps.capabilities)?;
        let (surface_format, format) = select_surface_format(&caps.formats)?;
        let present_mode = select_present_mode(&caps.present_modes, vsync);
        let extent = calculate_extent(&caps.capabilities, width, height);

        let loader = ash::khr::swapchain::Device::new(ctx.instance(), ctx.device());

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let images = match unsafe { loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };

        let mut state = Self {
            ctx,
            loader,
            swapchain,
            images,
            views: Vec::new(),
            format,
            extent,
        };
        state.create_views(surface_format.format)?;

        tracing::info!(
            "Swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            state.images.len(),
            surface_format.format,
            present_mode
        );

        Ok(state)
    }

    fn create_views(&mut self, format: vk::Format) -> Result<()> {
        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );

            // Views created so far are released by Drop on failure.
            let view = unsafe { self.ctx.device().create_image_view(&view_info, None)? };
            self.views.push(view);
        }
        Ok(())
    }

    /// Acquire the next image, signaling `semaphore` when it is ready.
    ///
    /// # Safety
    /// `semaphore` must be unsignaled with no pending signal operation.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<u32> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    tracing::debug!("Swapchain is suboptimal");
                }
                Ok(index)
            }
            // No image was acquired; the caller must recreate the swapchain.
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::SwapchainOutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    /// Present an image.
    ///
    /// # Safety
    /// The caller must hold exclusive access to `queue`.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<()> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(_) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::SwapchainOutOfDate),
            Err(e) => Err(GpuError::from(e)),
        }
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl Drop for SwapchainState {
    fn drop(&mut self) {
        unsafe {
            for &view in &self.views {
                self.ctx.device().destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

/// Request exactly `MAX_FRAMES_IN_FLIGHT` images.
pub fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> Result<u32> {
    let wanted = MAX_FRAMES_IN_FLIGHT as u32;
    let below_max = capabilities.max_image_count == 0 || wanted <= capabilities.max_image_count;
    if wanted < capabilities.min_image_count || !below_max {
        return Err(GpuError::SwapchainCreation(format!(
            "Surface supports {}..{} images, {wanted} required",
            capabilities.min_image_count, capabilities.max_image_count
        )));
    }
    Ok(wanted)
}

/// Select the surface format. Only formats with a [`PixelFormat`] equivalent are
/// usable because pipelines describe their attachments with one.
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
) -> Result<(vk::SurfaceFormatKHR, PixelFormat)> {
    const PREFERRED: [vk::Format; 2] = [vk::Format::R8G8B8A8_UNORM, vk::Format::B8G8R8A8_UNORM];

    let preferred = PREFERRED.iter().find_map(|&wanted| {
        available.iter().find(|format| {
            format.format == wanted && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
    });

    preferred
        .into_iter()
        .chain(available)
        .find_map(|format| PixelFormat::from_vk(format.format).map(|pixel| (*format, pixel)))
        .ok_or_else(|| {
            GpuError::SwapchainCreation(format!("No usable surface format in {available:?}"))
        })
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        // Prefer FIFO (vsync)
        vk::PresentModeKHR::FIFO
    } else {
        // Prefer mailbox (triple buffering without vsync)
        for &mode in available {
            if mode == vk::PresentModeKHR::MAILBOX {
                return mode;
            }
        }
        // Fall back to immediate
        for &mode in available {
            if mode == vk::PresentModeKHR::IMMEDIATE {
                return mode;
            }
        }
        // Fall back to FIFO (always supported)
        vk::PresentModeKHR::FIFO
    }
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ComponentFormat, TransformFormat};

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn prefers_rgba_then_bgra() {
        let available = [
            surface_format(vk::Format::B8G8R8A8_SRGB),
            surface_format(vk::Format::B8G8R8A8_UNORM),
            surface_format(vk::Format::R8G8B8A8_UNORM),
        ];
        let (chosen, pixel) = select_surface_format(&available).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(
            pixel,
            PixelFormat::new(ComponentFormat::R8G8B8A8, TransformFormat::Unorm)
        );

        let (chosen, _) = select_surface_format(&available[..2]).unwrap();
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_UNORM);
    }

    #[test]
    fn surface_without_known_formats_fails() {
        let available = [surface_format(vk::Format::B8G8R8A8_SRGB)];
        assert!(matches!(
            select_surface_format(&available),
            Err(GpuError::SwapchainCreation(_))
        ));
    }

    #[test]
    fn image_count_is_exactly_frames_in_flight() {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            ..Default::default()
        };
        assert_eq!(select_image_count(&caps).unwrap(), MAX_FRAMES_IN_FLIGHT as u32);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 1,
            max_image_count: 0,
            ..Default::default()
        };
        assert!(select_image_count(&unbounded).is_ok());

        let too_few = vk::SurfaceCapabilitiesKHR {
            min_image_count: 1,
            max_image_count: 2,
            ..Default::default()
        };
        assert!(select_image_count(&too_few).is_err());
    }

    #[test]
    fn present_mode_follows_vsync() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(select_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_is_clamped_when_surface_is_flexible() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&caps, 4096, 8);
        assert_eq!((extent.width, extent.height), (1024, 16));
    }
}
