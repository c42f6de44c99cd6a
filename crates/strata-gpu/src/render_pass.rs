//! Render pass construction and the compatible render pass cache.
//!
//! Pipelines only need a render pass that is compatible with the framebuffer
//! they draw into, which depends on attachment formats alone. One such render
//! pass is created per format signature and kept for the process lifetime.

use std::sync::Arc;

use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::MAX_COLOR_ATTACHMENTS;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::format::PixelFormat;

/// Attachment format signature of a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassKey {
    colors: [PixelFormat; MAX_COLOR_ATTACHMENTS],
    color_count: u8,
    depth_stencil: PixelFormat,
}

impl RenderPassKey {
    /// `depth_stencil` is [`PixelFormat::NONE`] when there is no depth attachment.
    pub fn new(colors: &[PixelFormat], depth_stencil: PixelFormat) -> Result<Self> {
        if colors.len() > MAX_COLOR_ATTACHMENTS {
            return Err(GpuError::InvalidState(format!(
                "{} color attachments, at most {MAX_COLOR_ATTACHMENTS} supported",
                colors.len()
            )));
        }
        let mut key = Self {
            colors: [PixelFormat::NONE; MAX_COLOR_ATTACHMENTS],
            color_count: colors.len() as u8,
            depth_stencil,
        };
        key.colors[..colors.len()].copy_from_slice(colors);
        Ok(key)
    }

    pub fn colors(&self) -> &[PixelFormat] {
        &self.colors[..self.color_count as usize]
    }

    pub fn depth_stencil(&self) -> Option<PixelFormat> {
        (!self.depth_stencil.is_none()).then_some(self.depth_stencil)
    }
}

/// One attachment of a render pass.
#[derive(Debug, Clone, Copy)]
pub struct AttachmentDesc {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    /// Layout during the subpass.
    pub subpass_layout: vk::ImageLayout,
}

impl AttachmentDesc {
    /// Format-only attachment used for compatibility.
    pub fn compatible(format: vk::Format) -> Self {
        Self {
            format,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::GENERAL,
            final_layout: vk::ImageLayout::GENERAL,
            subpass_layout: vk::ImageLayout::GENERAL,
        }
    }
}

/// Create a single-subpass render pass.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_render_pass(
    device: &ash::Device,
    colors: &[AttachmentDesc],
    depth_stencil: Option<&AttachmentDesc>,
) -> Result<vk::RenderPass> {
    let attachments: Vec<vk::AttachmentDescription> = colors
        .iter()
        .chain(depth_stencil)
        .map(|desc| {
            vk::AttachmentDescription::default()
                .format(desc.format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(desc.load_op)
                .store_op(desc.store_op)
                .stencil_load_op(desc.stencil_load_op)
                .stencil_store_op(desc.stencil_store_op)
                .initial_layout(desc.initial_layout)
                .final_layout(desc.final_layout)
        })
        .collect();

    let color_refs: Vec<vk::AttachmentReference> = colors
        .iter()
        .enumerate()
        .map(|(i, desc)| vk::AttachmentReference {
            attachment: i as u32,
            layout: desc.subpass_layout,
        })
        .collect();

    let depth_ref = depth_stencil.map(|desc| vk::AttachmentReference {
        attachment: colors.len() as u32,
        layout: desc.subpass_layout,
    });

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if let Some(depth_ref) = depth_ref.as_ref() {
        subpass = subpass.depth_stencil_attachment(depth_ref);
    }

    let subpasses = [subpass];
    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses);

    let render_pass = unsafe { device.create_render_pass(&create_info, None)? };
    Ok(render_pass)
}

/// Lookup-or-create map from format signature to render pass.
///
/// The lock is held across creation, so concurrent first requests for the same
/// signature create exactly one render pass.
#[derive(Default)]
pub struct CompatibleRenderPasses {
    entries: Mutex<HashMap<RenderPassKey, vk::RenderPass>>,
}

impl CompatibleRenderPasses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create_with<F>(&self, key: &RenderPassKey, create: F) -> Result<vk::RenderPass>
    where
        F: FnOnce(&RenderPassKey) -> Result<vk::RenderPass>,
    {
        let mut entries = self.entries.lock();
        if let Some(&render_pass) = entries.get(key) {
            return Ok(render_pass);
        }
        let render_pass = create(key)?;
        entries.insert(*key, render_pass);
        Ok(render_pass)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&mut self) -> Vec<vk::RenderPass> {
        self.entries.get_mut().drain().map(|(_, rp)| rp).collect()
    }
}

/// Render passes shared by every pipeline with the same attachment formats.
pub struct RenderPassCache {
    ctx: Arc<GpuContext>,
    passes: CompatibleRenderPasses,
}

impl RenderPassCache {
    pub fn new(ctx: Arc<GpuContext>) -> Self {
        Self {
            ctx,
            passes: CompatibleRenderPasses::new(),
        }
    }

    /// Get the render pass compatible with `key`, creating it on first use.
    pub fn get_or_create_compatible(&self, key: &RenderPassKey) -> Result<vk::RenderPass> {
        self.passes.get_or_create_with(key, |key| {
            let colors = key
                .colors()
                .iter()
                .map(|format| Ok(AttachmentDesc::compatible(format.to_vk()?)))
                .collect::<Result<Vec<_>>>()?;
            let depth_stencil = key
                .depth_stencil()
                .map(|format| Ok::<_, GpuError>(AttachmentDesc::compatible(format.to_vk()?)))
                .transpose()?;

            let render_pass =
                unsafe { create_render_pass(self.ctx.device(), &colors, depth_stencil.as_ref())? };
            tracing::debug!("Created compatible render pass for {:?}", key);
            Ok(render_pass)
        })
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }
}

impl Drop for RenderPassCache {
    fn drop(&mut self) {
        for render_pass in self.passes.drain() {
            unsafe { self.ctx.device().destroy_render_pass(render_pass, None) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ComponentFormat, TransformFormat};
    use ash::vk::Handle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn rgba8() -> PixelFormat {
        PixelFormat::new(ComponentFormat::R8G8B8A8, TransformFormat::Unorm)
    }

    fn d24() -> PixelFormat {
        PixelFormat::new(ComponentFormat::D24, TransformFormat::Unorm)
    }

    #[test]
    fn keys_compare_by_signature() {
        let a = RenderPassKey::new(&[rgba8()], d24()).unwrap();
        let b = RenderPassKey::new(&[rgba8()], d24()).unwrap();
        let c = RenderPassKey::new(&[rgba8()], PixelFormat::NONE).unwrap();
        let d = RenderPassKey::new(&[rgba8(), rgba8()], d24()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(c.depth_stencil(), None);
        assert_eq!(d.colors().len(), 2);
        assert!(RenderPassKey::new(&[rgba8(); MAX_COLOR_ATTACHMENTS + 1], d24()).is_err());
    }

    #[test]
    fn repeated_lookups_return_the_same_handle() {
        let cache = CompatibleRenderPasses::new();
        let key = RenderPassKey::new(&[rgba8()], d24()).unwrap();
        let created = AtomicUsize::new(0);
        let create = |_: &RenderPassKey| {
            let n = created.fetch_add(1, Ordering::SeqCst) as u64;
            Ok(vk::RenderPass::from_raw(0x1000 + n))
        };

        let first = cache.get_or_create_with(&key, create).unwrap();
        let second = cache.get_or_create_with(&key, create).unwrap();
        assert_eq!(first, second);
        assert_eq!(created.load(Ordering::SeqCst), 1);

        let other = RenderPassKey::new(&[rgba8()], PixelFormat::NONE).unwrap();
        let third = cache.get_or_create_with(&other, create).unwrap();
        assert_ne!(first, third);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn concurrent_first_use_creates_once() {
        let cache = Arc::new(CompatibleRenderPasses::new());
        let created = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let cache = cache.clone();
                let created = created.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let key = RenderPassKey::new(&[rgba8()], d24()).unwrap();
                    barrier.wait();
                    cache
                        .get_or_create_with(&key, |_| {
                            let n = created.fetch_add(1, Ordering::SeqCst) as u64;
                            std::thread::sleep(std::time::Duration::from_millis(10));
                            Ok(vk::RenderPass::from_raw(0x2000 + n))
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], results[1]);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_creation_is_not_cached() {
        let cache = CompatibleRenderPasses::new();
        let key = RenderPassKey::new(&[rgba8()], d24()).unwrap();
        let err = cache
            .get_or_create_with(&key, |_| Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY)));
        assert!(err.is_err());
        assert!(cache.is_empty());
        let rp = cache
            .get_or_create_with(&key, |_| Ok(vk::RenderPass::from_raw(7)))
            .unwrap();
        assert_eq!(rp.as_raw(), 7);
    }
}
