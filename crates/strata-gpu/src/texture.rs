//! Textures, their views and samplers.

use std::sync::Arc;

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::context::GpuContext;
use crate::convert::{CompareOperation, SamplingFilter, TextureType};
use crate::deferred::Garbage;
use crate::error::{GpuError, Result};
use crate::format::PixelFormat;
use crate::memory::GpuMemoryAllocation;
use crate::usage::TextureUsage;

/// Sampler state baked into a texture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerInitInfo {
    pub min_lod: f32,
    pub max_lod: f32,
    pub min_mag_filter: SamplingFilter,
    /// [`SamplingFilter::Base`] samples the base level only.
    pub mipmap_filter: SamplingFilter,
    /// Anything but `Always` makes this a depth-compare sampler.
    pub compare_operation: CompareOperation,
    pub anisotropy_level: u8,
    pub repeat: bool,
}

impl Default for SamplerInitInfo {
    fn default() -> Self {
        Self {
            min_lod: -1000.0,
            max_lod: 1000.0,
            min_mag_filter: SamplingFilter::Nearest,
            mipmap_filter: SamplingFilter::Base,
            compare_operation: CompareOperation::Always,
            anisotropy_level: 0,
            repeat: true,
        }
    }
}

impl SamplerInitInfo {
    /// Vulkan sampler description. `max_anisotropy` is the device limit, or
    /// zero when anisotropic filtering is unsupported.
    pub fn to_vk(&self, max_anisotropy: f32) -> vk::SamplerCreateInfo<'static> {
        let address_mode = if self.repeat {
            vk::SamplerAddressMode::REPEAT
        } else {
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        };

        let (min_lod, max_lod) = if self.mipmap_filter == SamplingFilter::Base {
            (0.0, 0.0)
        } else {
            (self.min_lod.max(0.0), self.max_lod)
        };

        let anisotropy = f32::from(self.anisotropy_level).min(max_anisotropy);
        let compare = self.compare_operation != CompareOperation::Always;

        vk::SamplerCreateInfo::default()
            .mag_filter(self.min_mag_filter.to_vk_filter())
            .min_filter(self.min_mag_filter.to_vk_filter())
            .mipmap_mode(self.mipmap_filter.to_vk_mipmap_mode())
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .min_lod(min_lod)
            .max_lod(max_lod)
            .anisotropy_enable(anisotropy > 1.0)
            .max_anisotropy(anisotropy.max(1.0))
            .compare_enable(compare)
            .compare_op(self.compare_operation.into())
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK)
    }
}

/// Parameters of [`Texture::new`].
#[derive(Debug, Clone, PartialEq)]
pub struct TextureInitInfo {
    pub name: String,
    pub texture_type: TextureType,
    pub width: u32,
    pub height: u32,
    /// Depth of 3D textures, 1 otherwise.
    pub depth: u32,
    /// Array layers of array textures, 1 otherwise.
    pub layer_count: u32,
    pub mipmap_count: u32,
    /// Only single-sampled textures are supported.
    pub samples: u32,
    pub format: PixelFormat,
    /// Every usage the texture will ever have.
    pub usage: TextureUsage,
    /// Usage the texture is transitioned to right after creation.
    pub initial_usage: TextureUsage,
    pub sampling: SamplerInitInfo,
}

impl Default for TextureInitInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            texture_type: TextureType::Texture2D,
            width: 0,
            height: 0,
            depth: 1,
            layer_count: 1,
            mipmap_count: 1,
            samples: 1,
            format: PixelFormat::NONE,
            usage: TextureUsage::empty(),
            initial_usage: TextureUsage::empty(),
            sampling: SamplerInitInfo::default(),
        }
    }
}

impl TextureInitInfo {
    /// Check the dimensions against the texture type.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(GpuError::InvalidState(format!(
                "Texture '{}' ({:?}): {reason}",
                self.name, self.texture_type
            )))
        };

        if self.mipmap_count == 0 || self.width == 0 {
            return invalid("mipmap count and width must be positive");
        }
        if self.samples != 1 {
            return invalid("only single-sampled textures are supported");
        }
        if self.format.is_none() {
            return invalid("format is missing");
        }
        if self.usage.is_empty() {
            return invalid("usage is empty");
        }
        if !self.initial_usage.is_empty() && !self.usage.contains(self.initial_usage) {
            return invalid("initial usage is not part of the declared usage");
        }

        let max_dim = self.width.max(self.height).max(self.depth);
        if self.mipmap_count > 32 - max_dim.leading_zeros() {
            return invalid("too many mipmaps for the dimensions");
        }

        match self.texture_type {
            TextureType::Texture1D => {
                if self.height != 1 || self.depth != 1 || self.layer_count != 1 {
                    return invalid("1D textures need height, depth and layer count of 1");
                }
            }
            TextureType::Texture2D | TextureType::Cube => {
                if self.height == 0 || self.depth != 1 || self.layer_count != 1 {
                    return invalid("needs a height, depth of 1 and a single layer");
                }
            }
            TextureType::Texture3D => {
                if self.height == 0 || self.depth == 0 || self.layer_count != 1 {
                    return invalid("3D textures need a height, a depth and a single layer");
                }
            }
            TextureType::Texture2DArray | TextureType::CubeArray => {
                if self.height == 0 || self.depth != 1 || self.layer_count == 0 {
                    return invalid("array textures need a height, depth of 1 and layers");
                }
            }
        }

        if self.texture_type.is_cube() && self.width != self.height {
            return invalid("cube faces must be square");
        }

        Ok(())
    }

    /// Array layers of the Vulkan image (six per cube).
    pub fn vk_layer_count(&self) -> u32 {
        if self.texture_type.is_cube() {
            self.layer_count * 6
        } else {
            self.layer_count
        }
    }
}

/// One 2D surface of a texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TextureSurfaceInfo {
    pub level: u32,
    /// Slice of a 3D texture.
    pub depth: u32,
    /// Cube face.
    pub face: u32,
    /// Array layer.
    pub layer: u32,
}

impl TextureSurfaceInfo {
    pub fn new(level: u32, depth: u32, face: u32, layer: u32) -> Self {
        Self {
            level,
            depth,
            face,
            layer,
        }
    }
}

/// A GPU texture with its view and sampler.
pub struct Texture {
    ctx: Arc<GpuContext>,
    image: vk::Image,
    view: vk::ImageView,
    sampler: vk::Sampler,
    memory: Option<GpuMemoryAllocation>,
    texture_type: TextureType,
    width: u32,
    height: u32,
    depth: u32,
    layer_count: u32,
    mipmap_count: u32,
    format: PixelFormat,
    usage: TextureUsage,
}

impl Texture {
    /// Create the image, bind device-local memory, and create the view and
    /// sampler. The contents start undefined.
    pub fn new(ctx: Arc<GpuContext>, info: &TextureInitInfo) -> Result<Self> {
        info.validate()?;
        let format = info.format.to_vk()?;
        let device = ctx.device();

        let flags = if info.texture_type.is_cube() {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(info.texture_type.to_vk_image_type())
            .format(format)
            .extent(vk::Extent3D {
                width: info.width,
                height: info.height,
                depth: info.depth,
            })
            .mip_levels(info.mipmap_count)
            .array_layers(info.vk_layer_count())
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(info.usage.to_vk(info.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None)? };

        let mut texture = Self {
            ctx: ctx.clone(),
            image,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            memory: None,
            texture_type: info.texture_type,
            width: info.width,
            height: info.height,
            depth: info.depth,
            layer_count: info.layer_count,
            mipmap_count: info.mipmap_count,
            format: info.format,
            usage: info.usage,
        };

        // From here on a failure hands the partial texture to deferred deletion.
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type = ctx.memory().find_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )?;
        let memory = ctx
            .memory()
            .allocate(&info.name, requirements, memory_type, false)?;
        unsafe { device.bind_image_memory(image, memory.memory(), memory.offset())? };
        texture.memory = Some(memory);

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(info.texture_type.to_vk_view_type())
            .format(format)
            .subresource_range(texture.full_range());
        texture.view = unsafe { device.create_image_view(&view_info, None)? };

        let max_anisotropy = if ctx.capabilities().supports_sampler_anisotropy {
            ctx.capabilities().max_sampler_anisotropy
        } else {
            0.0
        };
        let sampler_info = info.sampling.to_vk(max_anisotropy);
        texture.sampler = unsafe { device.create_sampler(&sampler_info, None)? };

        tracing::debug!(
            "Created texture '{}': {:?} {}x{}x{} layers {} mips {} {:?}",
            info.name,
            info.texture_type,
            info.width,
            info.height,
            info.depth,
            info.layer_count,
            info.mipmap_count,
            info.format
        );

        Ok(texture)
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub fn texture_type(&self) -> TextureType {
        self.texture_type
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    pub fn mipmap_count(&self) -> u32 {
        self.mipmap_count
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    pub fn is_depth_stencil(&self) -> bool {
        self.format.is_depth_stencil()
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        self.format.aspect()
    }

    /// Every level and layer.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.mipmap_count,
            base_array_layer: 0,
            layer_count: self.vk_layer_count(),
        }
    }

    /// Every layer of one level.
    pub fn level_range(&self, level: u32) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            base_mip_level: level,
            level_count: 1,
            ..self.full_range()
        }
    }

    fn vk_layer_count(&self) -> u32 {
        if self.texture_type.is_cube() {
            self.layer_count * 6
        } else {
            self.layer_count
        }
    }

    /// Width and height of a mip level.
    pub fn level_extent(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    /// Check that `surface` exists in this texture.
    pub fn check_surface(&self, surface: &TextureSurfaceInfo) -> Result<()> {
        let faces = if self.texture_type.is_cube() { 6 } else { 1 };
        let depth = if self.texture_type == TextureType::Texture3D {
            (self.depth >> surface.level).max(1)
        } else {
            1
        };
        if surface.level >= self.mipmap_count
            || surface.depth >= depth
            || surface.face >= faces
            || surface.layer >= self.layer_count
        {
            return Err(GpuError::InvalidState(format!(
                "{surface:?} out of bounds for {:?} with {} mips, {} layers",
                self.texture_type, self.mipmap_count, self.layer_count
            )));
        }
        Ok(())
    }

    /// Subresource layers addressing `surface`.
    pub fn surface_layers(&self, surface: &TextureSurfaceInfo) -> vk::ImageSubresourceLayers {
        let faces = if self.texture_type.is_cube() { 6 } else { 1 };
        vk::ImageSubresourceLayers {
            aspect_mask: self.aspect(),
            mip_level: surface.level,
            base_array_layer: surface.layer * faces + surface.face,
            layer_count: 1,
        }
    }

    /// Subresource range addressing `surface`.
    pub fn surface_range(&self, surface: &TextureSurfaceInfo) -> vk::ImageSubresourceRange {
        let layers = self.surface_layers(surface);
        vk::ImageSubresourceRange {
            aspect_mask: layers.aspect_mask,
            base_mip_level: layers.mip_level,
            level_count: 1,
            base_array_layer: layers.base_array_layer,
            layer_count: 1,
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.ctx.defer_destroy(Garbage::Image {
            image: self.image,
            view: self.view,
            sampler: self.sampler,
            memory: self.memory.take(),
        });
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("image", &self.image)
            .field("type", &self.texture_type)
            .field("extent", &(self.width, self.height, self.depth))
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ComponentFormat, TransformFormat};

    fn info(texture_type: TextureType) -> TextureInitInfo {
        TextureInitInfo {
            name: "test".to_string(),
            texture_type,
            width: 64,
            height: 64,
            mipmap_count: 4,
            format: PixelFormat::new(ComponentFormat::R8G8B8A8, TransformFormat::Unorm),
            usage: TextureUsage::FRAGMENT_SHADER_SAMPLED | TextureUsage::UPLOAD,
            ..Default::default()
        }
    }

    #[test]
    fn valid_textures_of_every_type() {
        info(TextureType::Texture2D).validate().unwrap();
        info(TextureType::Cube).validate().unwrap();
        TextureInitInfo {
            depth: 8,
            ..info(TextureType::Texture3D)
        }
        .validate()
        .unwrap();
        TextureInitInfo {
            layer_count: 3,
            ..info(TextureType::Texture2DArray)
        }
        .validate()
        .unwrap();
        TextureInitInfo {
            height: 1,
            mipmap_count: 1,
            ..info(TextureType::Texture1D)
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn dimension_mismatches_are_rejected() {
        let cases = [
            TextureInitInfo {
                depth: 2,
                ..info(TextureType::Texture2D)
            },
            TextureInitInfo {
                layer_count: 2,
                ..info(TextureType::Cube)
            },
            TextureInitInfo {
                depth: 0,
                ..info(TextureType::Texture3D)
            },
            TextureInitInfo {
                layer_count: 0,
                ..info(TextureType::Texture2DArray)
            },
            TextureInitInfo {
                mipmap_count: 0,
                ..info(TextureType::Texture2D)
            },
            TextureInitInfo {
                mipmap_count: 8,
                ..info(TextureType::Texture2D)
            },
            TextureInitInfo {
                width: 32,
                ..info(TextureType::Cube)
            },
            TextureInitInfo {
                samples: 4,
                ..info(TextureType::Texture2D)
            },
            TextureInitInfo {
                initial_usage: TextureUsage::GENERATE_MIPMAPS,
                ..info(TextureType::Texture2D)
            },
        ];
        for case in cases {
            assert!(case.validate().is_err(), "{case:?} should be invalid");
        }
    }

    #[test]
    fn cube_arrays_have_six_layers_per_element() {
        let cube_array = TextureInitInfo {
            layer_count: 2,
            ..info(TextureType::CubeArray)
        };
        cube_array.validate().unwrap();
        assert_eq!(cube_array.vk_layer_count(), 12);
        assert_eq!(info(TextureType::Texture2D).vk_layer_count(), 1);
    }

    #[test]
    fn sampler_defaults() {
        let sampler = SamplerInitInfo::default();
        assert_eq!(sampler.min_lod, -1000.0);
        assert_eq!(sampler.max_lod, 1000.0);
        assert!(sampler.repeat);

        let vk_info = sampler.to_vk(16.0);
        assert_eq!(vk_info.min_filter, vk::Filter::NEAREST);
        assert_eq!(vk_info.mipmap_mode, vk::SamplerMipmapMode::NEAREST);
        assert_eq!(vk_info.address_mode_u, vk::SamplerAddressMode::REPEAT);
        assert_eq!(vk_info.max_lod, 0.0);
        assert_eq!(vk_info.anisotropy_enable, vk::FALSE);
        assert_eq!(vk_info.compare_enable, vk::FALSE);
    }

    #[test]
    fn sampler_clamps_anisotropy_and_enables_compare() {
        let sampler = SamplerInitInfo {
            min_mag_filter: SamplingFilter::Linear,
            mipmap_filter: SamplingFilter::Linear,
            anisotropy_level: 16,
            compare_operation: CompareOperation::LessEqual,
            repeat: false,
            ..Default::default()
        };
        let vk_info = sampler.to_vk(8.0);
        assert_eq!(vk_info.max_anisotropy, 8.0);
        assert_eq!(vk_info.anisotropy_enable, vk::TRUE);
        assert_eq!(vk_info.compare_enable, vk::TRUE);
        assert_eq!(vk_info.compare_op, vk::CompareOp::LESS_OR_EQUAL);
        assert_eq!(vk_info.address_mode_v, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(vk_info.min_lod, 0.0);
        assert_eq!(vk_info.max_lod, 1000.0);

        let unsupported = sampler.to_vk(0.0);
        assert_eq!(unsupported.anisotropy_enable, vk::FALSE);
        assert_eq!(unsupported.max_anisotropy, 1.0);
    }
}
