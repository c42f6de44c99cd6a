//! Semantic usage bitmasks for buffers and textures.
//!
//! A resource declares every way it may be used at creation time. Barrier
//! computation and Vulkan usage flags are both derived from these masks.

use ash::vk;
use bitflags::bitflags;

use crate::format::PixelFormat;

bitflags! {
    /// How a texture is accessed by the GPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u8 {
        const FRAGMENT_SHADER_SAMPLED = 1 << 0;
        const COMPUTE_SHADER_SAMPLED = 1 << 1;
        const FRAMEBUFFER_ATTACHMENT_READ = 1 << 2;
        const FRAMEBUFFER_ATTACHMENT_WRITE = 1 << 3;
        const GENERATE_MIPMAPS = 1 << 4;
        const UPLOAD = 1 << 5;

        const ANY_SHADER_SAMPLED =
            Self::FRAGMENT_SHADER_SAMPLED.bits() | Self::COMPUTE_SHADER_SAMPLED.bits();
        const FRAMEBUFFER_ATTACHMENT_READ_WRITE =
            Self::FRAMEBUFFER_ATTACHMENT_READ.bits() | Self::FRAMEBUFFER_ATTACHMENT_WRITE.bits();
    }
}

bitflags! {
    /// How a buffer is accessed by the GPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u16 {
        const UNIFORM_VERTEX = 1 << 0;
        const UNIFORM_FRAGMENT = 1 << 1;
        const UNIFORM_COMPUTE = 1 << 2;
        const STORAGE_COMPUTE_READ = 1 << 3;
        const STORAGE_COMPUTE_WRITE = 1 << 4;
        const STORAGE_FRAGMENT_READ = 1 << 5;
        const STORAGE_FRAGMENT_WRITE = 1 << 6;
        const INDEX = 1 << 7;
        const VERTEX = 1 << 8;
        const INDIRECT = 1 << 9;
        const TRANSFER_SOURCE = 1 << 10;
        const TRANSFER_DESTINATION = 1 << 11;

        const UNIFORM_ANY_SHADER = Self::UNIFORM_VERTEX.bits()
            | Self::UNIFORM_FRAGMENT.bits()
            | Self::UNIFORM_COMPUTE.bits();
        const STORAGE_ANY = Self::STORAGE_COMPUTE_READ.bits()
            | Self::STORAGE_COMPUTE_WRITE.bits()
            | Self::STORAGE_FRAGMENT_READ.bits()
            | Self::STORAGE_FRAGMENT_WRITE.bits();
    }
}

bitflags! {
    /// CPU access to a buffer's memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferMapAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl BufferUsage {
    /// Vulkan buffer usage flags required by this mask.
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        let mut out = vk::BufferUsageFlags::empty();
        if self.intersects(Self::UNIFORM_ANY_SHADER) {
            out |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.intersects(Self::STORAGE_ANY) {
            out |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(Self::INDEX) {
            out |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::VERTEX) {
            out |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDIRECT) {
            out |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        if self.contains(Self::TRANSFER_DESTINATION) {
            out |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.contains(Self::TRANSFER_SOURCE) {
            out |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        out
    }
}

impl TextureUsage {
    /// Vulkan image usage flags required by this mask for the given format.
    pub fn to_vk(self, format: PixelFormat) -> vk::ImageUsageFlags {
        let mut out = vk::ImageUsageFlags::empty();
        if self.intersects(Self::ANY_SHADER_SAMPLED) {
            out |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.intersects(Self::FRAMEBUFFER_ATTACHMENT_READ_WRITE) {
            if format.is_depth_stencil() {
                out |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
            } else {
                out |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
            }
        }
        if self.contains(Self::GENERATE_MIPMAPS) {
            out |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        }
        if self.contains(Self::UPLOAD) {
            out |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ComponentFormat, TransformFormat};

    #[test]
    fn buffer_usage_flags() {
        let usage = BufferUsage::VERTEX | BufferUsage::TRANSFER_DESTINATION;
        assert_eq!(
            usage.to_vk(),
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert_eq!(
            BufferUsage::UNIFORM_FRAGMENT.to_vk(),
            vk::BufferUsageFlags::UNIFORM_BUFFER
        );
        assert_eq!(
            BufferUsage::STORAGE_COMPUTE_WRITE.to_vk(),
            vk::BufferUsageFlags::STORAGE_BUFFER
        );
    }

    #[test]
    fn attachment_usage_depends_on_format() {
        let depth = PixelFormat::new(ComponentFormat::D24, TransformFormat::Unorm);
        let color = PixelFormat::new(ComponentFormat::R8G8B8A8, TransformFormat::Unorm);
        let usage = TextureUsage::FRAMEBUFFER_ATTACHMENT_WRITE;

        assert_eq!(
            usage.to_vk(depth),
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        );
        assert_eq!(usage.to_vk(color), vk::ImageUsageFlags::COLOR_ATTACHMENT);
        assert_eq!(
            TextureUsage::GENERATE_MIPMAPS.to_vk(color),
            vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST
        );
    }
}
