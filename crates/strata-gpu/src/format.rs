//! Pixel formats and their Vulkan equivalents.

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::error::{GpuError, Result};

/// Channel layout of a pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentFormat {
    None,
    R8,
    R8G8,
    R8G8B8,
    R8G8B8A8,
    /// Swapchain-only channel order.
    B8G8R8A8,
    R10G10B10A2,
    R16,
    R16G16,
    R16G16B16,
    R16G16B16A16,
    R32,
    R32G32,
    R32G32B32,
    R32G32B32A32,
    R11G11B10,
    D16,
    D24,
    D32,
    R8G8B8S3tc,
    R8G8B8A8S3tc,
    R8G8B8Etc2,
    R8G8B8A8Etc2,
}

/// Numeric interpretation of the channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformFormat {
    None,
    Unorm,
    Snorm,
    Uint,
    Sint,
    Float,
}

/// A portable pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelFormat {
    pub components: ComponentFormat,
    pub transform: TransformFormat,
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::NONE
    }
}

use ComponentFormat as C;
use TransformFormat as T;

const fn entry(components: C, transform: T, vk: vk::Format) -> (PixelFormat, vk::Format) {
    (
        PixelFormat {
            components,
            transform,
        },
        vk,
    )
}

/// Every supported combination.
static FORMAT_TABLE: &[(PixelFormat, vk::Format)] = &[
    entry(C::R8, T::Unorm, vk::Format::R8_UNORM),
    entry(C::R8, T::Snorm, vk::Format::R8_SNORM),
    entry(C::R8, T::Uint, vk::Format::R8_UINT),
    entry(C::R8, T::Sint, vk::Format::R8_SINT),
    entry(C::R8G8, T::Unorm, vk::Format::R8G8_UNORM),
    entry(C::R8G8, T::Snorm, vk::Format::R8G8_SNORM),
    entry(C::R8G8, T::Uint, vk::Format::R8G8_UINT),
    entry(C::R8G8, T::Sint, vk::Format::R8G8_SINT),
    entry(C::R8G8B8, T::Unorm, vk::Format::R8G8B8_UNORM),
    entry(C::R8G8B8, T::Snorm, vk::Format::R8G8B8_SNORM),
    entry(C::R8G8B8, T::Uint, vk::Format::R8G8B8_UINT),
    entry(C::R8G8B8, T::Sint, vk::Format::R8G8B8_SINT),
    entry(C::R8G8B8A8, T::Unorm, vk::Format::R8G8B8A8_UNORM),
    entry(C::R8G8B8A8, T::Snorm, vk::Format::R8G8B8A8_SNORM),
    entry(C::R8G8B8A8, T::Uint, vk::Format::R8G8B8A8_UINT),
    entry(C::R8G8B8A8, T::Sint, vk::Format::R8G8B8A8_SINT),
    entry(C::B8G8R8A8, T::Unorm, vk::Format::B8G8R8A8_UNORM),
    entry(C::R10G10B10A2, T::Unorm, vk::Format::A2B10G10R10_UNORM_PACK32),
    entry(C::R10G10B10A2, T::Snorm, vk::Format::A2B10G10R10_SNORM_PACK32),
    entry(C::R10G10B10A2, T::Uint, vk::Format::A2B10G10R10_UINT_PACK32),
    entry(C::R10G10B10A2, T::Sint, vk::Format::A2B10G10R10_SINT_PACK32),
    entry(C::R16, T::Unorm, vk::Format::R16_UNORM),
    entry(C::R16, T::Snorm, vk::Format::R16_SNORM),
    entry(C::R16, T::Uint, vk::Format::R16_UINT),
    entry(C::R16, T::Sint, vk::Format::R16_SINT),
    entry(C::R16, T::Float, vk::Format::R16_SFLOAT),
    entry(C::R16G16, T::Unorm, vk::Format::R16G16_UNORM),
    entry(C::R16G16, T::Snorm, vk::Format::R16G16_SNORM),
    entry(C::R16G16, T::Uint, vk::Format::R16G16_UINT),
    entry(C::R16G16, T::Sint, vk::Format::R16G16_SINT),
    entry(C::R16G16, T::Float, vk::Format::R16G16_SFLOAT),
    entry(C::R16G16B16, T::Unorm, vk::Format::R16G16B16_UNORM),
    entry(C::R16G16B16, T::Snorm, vk::Format::R16G16B16_SNORM),
    entry(C::R16G16B16, T::Uint, vk::Format::R16G16B16_UINT),
    entry(C::R16G16B16, T::Sint, vk::Format::R16G16B16_SINT),
    entry(C::R16G16B16, T::Float, vk::Format::R16G16B16_SFLOAT),
    entry(C::R16G16B16A16, T::Unorm, vk::Format::R16G16B16A16_UNORM),
    entry(C::R16G16B16A16, T::Snorm, vk::Format::R16G16B16A16_SNORM),
    entry(C::R16G16B16A16, T::Uint, vk::Format::R16G16B16A16_UINT),
    entry(C::R16G16B16A16, T::Sint, vk::Format::R16G16B16A16_SINT),
    entry(C::R16G16B16A16, T::Float, vk::Format::R16G16B16A16_SFLOAT),
    entry(C::R32, T::Uint, vk::Format::R32_UINT),
    entry(C::R32, T::Sint, vk::Format::R32_SINT),
    entry(C::R32, T::Float, vk::Format::R32_SFLOAT),
    entry(C::R32G32, T::Uint, vk::Format::R32G32_UINT),
    entry(C::R32G32, T::Sint, vk::Format::R32G32_SINT),
    entry(C::R32G32, T::Float, vk::Format::R32G32_SFLOAT),
    entry(C::R32G32B32, T::Uint, vk::Format::R32G32B32_UINT),
    entry(C::R32G32B32, T::Sint, vk::Format::R32G32B32_SINT),
    entry(C::R32G32B32, T::Float, vk::Format::R32G32B32_SFLOAT),
    entry(C::R32G32B32A32, T::Uint, vk::Format::R32G32B32A32_UINT),
    entry(C::R32G32B32A32, T::Sint, vk::Format::R32G32B32A32_SINT),
    entry(C::R32G32B32A32, T::Float, vk::Format::R32G32B32A32_SFLOAT),
    entry(C::R11G11B10, T::Float, vk::Format::B10G11R11_UFLOAT_PACK32),
    entry(C::D16, T::Unorm, vk::Format::D16_UNORM),
    entry(C::D24, T::Unorm, vk::Format::D24_UNORM_S8_UINT),
    entry(C::D32, T::Float, vk::Format::D32_SFLOAT),
    entry(C::R8G8B8S3tc, T::None, vk::Format::BC1_RGB_UNORM_BLOCK),
    entry(C::R8G8B8A8S3tc, T::None, vk::Format::BC3_UNORM_BLOCK),
    entry(C::R8G8B8Etc2, T::None, vk::Format::ETC2_R8G8B8_UNORM_BLOCK),
    entry(C::R8G8B8A8Etc2, T::None, vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK),
];

impl PixelFormat {
    /// The absent format. Used for "no depth attachment".
    pub const NONE: Self = Self {
        components: ComponentFormat::None,
        transform: TransformFormat::None,
    };

    pub const fn new(components: ComponentFormat, transform: TransformFormat) -> Self {
        Self {
            components,
            transform,
        }
    }

    pub fn is_none(&self) -> bool {
        self.components == ComponentFormat::None
    }

    /// Look up the Vulkan format.
    pub fn to_vk(self) -> Result<vk::Format> {
        FORMAT_TABLE
            .iter()
            .find(|(format, _)| *format == self)
            .map(|(_, vk)| *vk)
            .ok_or_else(|| GpuError::UnsupportedFormat(format!("{self:?}")))
    }

    /// Reverse lookup, for formats chosen by the driver such as the swapchain's.
    pub fn from_vk(format: vk::Format) -> Option<Self> {
        FORMAT_TABLE
            .iter()
            .find(|(_, vk)| *vk == format)
            .map(|(format, _)| *format)
    }

    pub fn is_depth_stencil(&self) -> bool {
        matches!(self.components, C::D16 | C::D24 | C::D32)
    }

    pub fn has_stencil(&self) -> bool {
        self.components == C::D24
    }

    pub fn is_compressed(&self) -> bool {
        matches!(
            self.components,
            C::R8G8B8S3tc | C::R8G8B8A8S3tc | C::R8G8B8Etc2 | C::R8G8B8A8Etc2
        )
    }

    /// Image aspect of views and copies.
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        match self.components {
            C::D16 | C::D32 => vk::ImageAspectFlags::DEPTH,
            C::D24 => vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            _ => vk::ImageAspectFlags::COLOR,
        }
    }

    /// Bytes of a tightly packed `width` x `height` surface.
    pub fn surface_size(&self, width: u32, height: u32) -> u64 {
        let (width, height) = (u64::from(width.max(1)), u64::from(height.max(1)));
        match self.components {
            C::R8G8B8S3tc | C::R8G8B8Etc2 => width.div_ceil(4) * height.div_ceil(4) * 8,
            C::R8G8B8A8S3tc | C::R8G8B8A8Etc2 => width.div_ceil(4) * height.div_ceil(4) * 16,
            _ => width * height * self.texel_size(),
        }
    }

    fn texel_size(&self) -> u64 {
        match self.components {
            C::None => 0,
            C::R8 => 1,
            C::R8G8 | C::R16 | C::D16 => 2,
            C::R8G8B8 => 3,
            C::R8G8B8A8
            | C::B8G8R8A8
            | C::R10G10B10A2
            | C::R16G16
            | C::R32
            | C::R11G11B10
            | C::D24
            | C::D32 => 4,
            C::R16G16B16 => 6,
            C::R16G16B16A16 | C::R32G32 => 8,
            C::R32G32B32 => 12,
            C::R32G32B32A32 => 16,
            C::R8G8B8S3tc | C::R8G8B8A8S3tc | C::R8G8B8Etc2 | C::R8G8B8A8Etc2 => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_COMPONENTS: [ComponentFormat; 23] = [
        C::None,
        C::R8,
        C::R8G8,
        C::R8G8B8,
        C::R8G8B8A8,
        C::B8G8R8A8,
        C::R10G10B10A2,
        C::R16,
        C::R16G16,
        C::R16G16B16,
        C::R16G16B16A16,
        C::R32,
        C::R32G32,
        C::R32G32B32,
        C::R32G32B32A32,
        C::R11G11B10,
        C::D16,
        C::D24,
        C::D32,
        C::R8G8B8S3tc,
        C::R8G8B8A8S3tc,
        C::R8G8B8Etc2,
        C::R8G8B8A8Etc2,
    ];

    const ALL_TRANSFORMS: [TransformFormat; 6] =
        [T::None, T::Unorm, T::Snorm, T::Uint, T::Sint, T::Float];

    #[test]
    fn every_table_entry_is_unique_and_defined() {
        for (i, (format, vk)) in FORMAT_TABLE.iter().enumerate() {
            assert_ne!(*vk, vk::Format::UNDEFINED);
            assert!(
                FORMAT_TABLE[i + 1..].iter().all(|(other, _)| other != format),
                "{format:?} listed twice"
            );
        }
    }

    #[test]
    fn every_combination_converts_or_errors() {
        let mut supported = 0;
        for components in ALL_COMPONENTS {
            for transform in ALL_TRANSFORMS {
                let format = PixelFormat::new(components, transform);
                match format.to_vk() {
                    Ok(vk) => {
                        supported += 1;
                        assert_ne!(vk, vk::Format::UNDEFINED);
                    }
                    Err(err) => assert!(matches!(err, GpuError::UnsupportedFormat(_))),
                }
            }
        }
        assert_eq!(supported, FORMAT_TABLE.len());
    }

    #[test]
    fn depth_formats() {
        let d24 = PixelFormat::new(C::D24, T::Unorm);
        assert!(d24.is_depth_stencil());
        assert_eq!(d24.to_vk().unwrap(), vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(
            d24.aspect(),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );

        let d32 = PixelFormat::new(C::D32, T::Float);
        assert_eq!(d32.aspect(), vk::ImageAspectFlags::DEPTH);

        let color = PixelFormat::new(C::R11G11B10, T::Float);
        assert!(!color.is_depth_stencil());
        assert_eq!(color.to_vk().unwrap(), vk::Format::B10G11R11_UFLOAT_PACK32);
        assert!(PixelFormat::NONE.to_vk().is_err());
    }

    #[test]
    fn reverse_lookup_matches_table() {
        for (format, vk) in FORMAT_TABLE {
            assert_eq!(PixelFormat::from_vk(*vk), Some(*format));
        }
        assert_eq!(PixelFormat::from_vk(vk::Format::B8G8R8A8_SRGB), None);
    }

    #[test]
    fn surface_sizes() {
        let rgba8 = PixelFormat::new(C::R8G8B8A8, T::Unorm);
        assert_eq!(rgba8.surface_size(4, 2), 32);
        let bc1 = PixelFormat::new(C::R8G8B8S3tc, T::None);
        assert_eq!(bc1.surface_size(5, 4), 16);
        assert_eq!(bc1.surface_size(1, 1), 8);
    }
}
