//! Render targets: offscreen framebuffers and the default (swapchain) one.

use std::sync::Arc;

use ash::vk;

use crate::config::MAX_COLOR_ATTACHMENTS;
use crate::context::GpuContext;
use crate::convert::{AttachmentLoadOperation, AttachmentStoreOperation, TextureType};
use crate::deferred::Garbage;
use crate::error::{GpuError, Result};
use crate::format::PixelFormat;
use crate::render_pass::{create_render_pass, AttachmentDesc, RenderPassKey};
use crate::swapchain::SwapchainState;
use crate::texture::{Texture, TextureSurfaceInfo};
use crate::usage::TextureUsage;

/// Value an attachment is cleared to when its load op is `Clear`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn to_vk(self) -> vk::ClearValue {
        match self {
            Self::Color(float32) => vk::ClearValue {
                color: vk::ClearColorValue { float32 },
            },
            Self::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// One texture surface bound as an attachment.
#[derive(Debug, Clone)]
pub struct FramebufferAttachmentInfo {
    pub texture: Arc<Texture>,
    pub surface: TextureSurfaceInfo,
    pub load_op: AttachmentLoadOperation,
    pub store_op: AttachmentStoreOperation,
    pub stencil_load_op: AttachmentLoadOperation,
    pub stencil_store_op: AttachmentStoreOperation,
    pub clear_value: ClearValue,
}

impl FramebufferAttachmentInfo {
    /// Level 0 of `texture`, cleared to zero (or depth 1.0) and stored.
    pub fn new(texture: Arc<Texture>) -> Self {
        let clear_value = if texture.is_depth_stencil() {
            ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            }
        } else {
            ClearValue::Color([0.0; 4])
        };
        Self {
            texture,
            surface: TextureSurfaceInfo::default(),
            load_op: AttachmentLoadOperation::Clear,
            store_op: AttachmentStoreOperation::Store,
            stencil_load_op: AttachmentLoadOperation::DontCare,
            stencil_store_op: AttachmentStoreOperation::DontCare,
            clear_value,
        }
    }

    pub fn with_surface(mut self, surface: TextureSurfaceInfo) -> Self {
        self.surface = surface;
        self
    }

    pub fn with_load_op(mut self, load_op: AttachmentLoadOperation) -> Self {
        self.load_op = load_op;
        self
    }

    pub fn with_store_op(mut self, store_op: AttachmentStoreOperation) -> Self {
        self.store_op = store_op;
        self
    }

    pub fn with_stencil_ops(
        mut self,
        load_op: AttachmentLoadOperation,
        store_op: AttachmentStoreOperation,
    ) -> Self {
        self.stencil_load_op = load_op;
        self.stencil_store_op = store_op;
        self
    }

    pub fn with_clear_value(mut self, clear_value: ClearValue) -> Self {
        self.clear_value = clear_value;
        self
    }
}

/// Parameters of [`Framebuffer::new`].
#[derive(Debug, Clone, Default)]
pub struct FramebufferInitInfo {
    pub name: String,
    pub color_attachments: Vec<FramebufferAttachmentInfo>,
    pub depth_stencil_attachment: Option<FramebufferAttachmentInfo>,
}

/// Parameters of [`Framebuffer::new_default`].
///
/// The previous contents of a swapchain image are never preserved, so
/// `Load` behaves like `DontCare`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefaultFramebufferInfo {
    pub load_op: AttachmentLoadOperation,
    pub clear_color: [f32; 4],
}

impl Default for DefaultFramebufferInfo {
    fn default() -> Self {
        Self {
            load_op: AttachmentLoadOperation::Clear,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Render pass attachment of an offscreen color target.
pub fn color_attachment_desc(
    format: vk::Format,
    load_op: AttachmentLoadOperation,
    store_op: AttachmentStoreOperation,
) -> AttachmentDesc {
    AttachmentDesc {
        format,
        load_op: load_op.into(),
        store_op: store_op.into(),
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        subpass_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }
}

/// Render pass attachment of a depth/stencil target. Stencil ops only apply
/// to formats with a stencil aspect.
pub fn depth_stencil_attachment_desc(
    format: PixelFormat,
    info: &FramebufferAttachmentInfo,
) -> Result<AttachmentDesc> {
    let (stencil_load_op, stencil_store_op) = if format.has_stencil() {
        (info.stencil_load_op.into(), info.stencil_store_op.into())
    } else {
        (
            vk::AttachmentLoadOp::DONT_CARE,
            vk::AttachmentStoreOp::DONT_CARE,
        )
    };
    Ok(AttachmentDesc {
        format: format.to_vk()?,
        load_op: info.load_op.into(),
        store_op: info.store_op.into(),
        stencil_load_op,
        stencil_store_op,
        initial_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        subpass_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    })
}

/// Render pass attachment of a swapchain image.
pub fn default_attachment_desc(format: vk::Format, load_op: AttachmentLoadOperation) -> AttachmentDesc {
    let load_op = match load_op {
        AttachmentLoadOperation::Clear => vk::AttachmentLoadOp::CLEAR,
        AttachmentLoadOperation::Load | AttachmentLoadOperation::DontCare => {
            vk::AttachmentLoadOp::DONT_CARE
        }
    };
    AttachmentDesc {
        format,
        load_op,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        subpass_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }
}

fn check_attachment(info: &FramebufferAttachmentInfo, depth_stencil: bool) -> Result<vk::Extent2D> {
    let texture = &info.texture;
    texture.check_surface(&info.surface)?;

    let reason = if texture.texture_type() == TextureType::Texture3D {
        Some("3D textures cannot be attachments")
    } else if !texture
        .usage()
        .intersects(TextureUsage::FRAMEBUFFER_ATTACHMENT_READ_WRITE)
    {
        Some("texture was not created with an attachment usage")
    } else if texture.is_depth_stencil() != depth_stencil {
        Some("attachment slot does not match the texture format")
    } else {
        None
    };
    if let Some(reason) = reason {
        return Err(GpuError::InvalidState(format!("{texture:?}: {reason}")));
    }

    let (width, height) = texture.level_extent(info.surface.level);
    Ok(vk::Extent2D { width, height })
}

/// A render pass plus the framebuffer objects drawn through it.
pub struct Framebuffer {
    ctx: Arc<GpuContext>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    views: Vec<vk::ImageView>,
    key: RenderPassKey,
    extent: vk::Extent2D,
    clear_values: Vec<vk::ClearValue>,
    attachments: Vec<Arc<Texture>>,
    swapchain: Option<Arc<SwapchainState>>,
}

impl Framebuffer {
    /// Offscreen framebuffer. Attachments are expected in their attachment
    /// layouts when the render pass begins and are left in them.
    pub fn new(ctx: Arc<GpuContext>, info: &FramebufferInitInfo) -> Result<Self> {
        if info.color_attachments.len() > MAX_COLOR_ATTACHMENTS {
            return Err(GpuError::InvalidState(format!(
                "Framebuffer '{}': {} color attachments, at most {MAX_COLOR_ATTACHMENTS}",
                info.name,
                info.color_attachments.len()
            )));
        }

        let mut extent = None;
        for (attachment, depth_stencil) in info
            .color_attachments
            .iter()
            .map(|a| (a, false))
            .chain(info.depth_stencil_attachment.iter().map(|a| (a, true)))
        {
            let attachment_extent = check_attachment(attachment, depth_stencil)?;
            if extent.is_some_and(|e| e != attachment_extent) {
                return Err(GpuError::InvalidState(format!(
                    "Framebuffer '{}': attachments differ in size",
                    info.name
                )));
            }
            extent = Some(attachment_extent);
        }
        let extent = extent.ok_or_else(|| {
            GpuError::InvalidState(format!("Framebuffer '{}' has no attachments", info.name))
        })?;

        let color_formats: Vec<PixelFormat> = info
            .color_attachments
            .iter()
            .map(|a| a.texture.format())
            .collect();
        let depth_format = info
            .depth_stencil_attachment
            .as_ref()
            .map_or(PixelFormat::NONE, |a| a.texture.format());
        let key = RenderPassKey::new(&color_formats, depth_format)?;

        let colors = info
            .color_attachments
            .iter()
            .map(|a| {
                Ok(color_attachment_desc(
                    a.texture.format().to_vk()?,
                    a.load_op,
                    a.store_op,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let depth_stencil = info
            .depth_stencil_attachment
            .as_ref()
            .map(|a| depth_stencil_attachment_desc(a.texture.format(), a))
            .transpose()?;

        let attachments: Vec<&FramebufferAttachmentInfo> = info
            .color_attachments
            .iter()
            .chain(info.depth_stencil_attachment.as_ref())
            .collect();

        let mut framebuffer = Self {
            ctx: ctx.clone(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            views: Vec::with_capacity(attachments.len()),
            key,
            extent,
            clear_values: attachments.iter().map(|a| a.clear_value.to_vk()).collect(),
            attachments: attachments.iter().map(|a| a.texture.clone()).collect(),
            swapchain: None,
        };

        let device = ctx.device();
        framebuffer.render_pass =
            unsafe { create_render_pass(device, &colors, depth_stencil.as_ref())? };

        for attachment in &attachments {
            let texture = &attachment.texture;
            let view_info = vk::ImageViewCreateInfo::default()
                .image(texture.image())
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(texture.format().to_vk()?)
                .subresource_range(texture.surface_range(&attachment.surface));
            framebuffer
                .views
                .push(unsafe { device.create_image_view(&view_info, None)? });
        }

        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(framebuffer.render_pass)
            .attachments(&framebuffer.views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let handle = unsafe { device.create_framebuffer(&create_info, None)? };
        framebuffer.framebuffers.push(handle);

        tracing::debug!(
            "Created framebuffer '{}': {}x{}, {:?}",
            info.name,
            extent.width,
            extent.height,
            framebuffer.key
        );

        Ok(framebuffer)
    }

    /// Framebuffer drawing into the swapchain, one framebuffer object per
    /// image. Rendering leaves the image ready for presentation.
    pub fn new_default(
        ctx: Arc<GpuContext>,
        swapchain: Arc<SwapchainState>,
        info: &DefaultFramebufferInfo,
    ) -> Result<Self> {
        let format = swapchain.format();
        let key = RenderPassKey::new(&[format], PixelFormat::NONE)?;
        let extent = swapchain.extent();

        let mut framebuffer = Self {
            ctx: ctx.clone(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::with_capacity(swapchain.views().len()),
            views: Vec::new(),
            key,
            extent,
            clear_values: vec![ClearValue::Color(info.clear_color).to_vk()],
            attachments: Vec::new(),
            swapchain: None,
        };

        let device = ctx.device();
        let color = default_attachment_desc(format.to_vk()?, info.load_op);
        framebuffer.render_pass = unsafe { create_render_pass(device, &[color], None)? };

        for &view in swapchain.views() {
            let views = [view];
            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(framebuffer.render_pass)
                .attachments(&views)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            framebuffer
                .framebuffers
                .push(unsafe { device.create_framebuffer(&create_info, None)? });
        }
        framebuffer.swapchain = Some(swapchain);

        tracing::debug!(
            "Created default framebuffer: {}x{}, {:?}",
            extent.width,
            extent.height,
            format
        );

        Ok(framebuffer)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Framebuffer object to draw into. `image_index` selects the swapchain
    /// image of the default framebuffer and is ignored otherwise.
    pub fn handle(&self, image_index: u32) -> Option<vk::Framebuffer> {
        let index = if self.is_default() {
            image_index as usize
        } else {
            0
        };
        self.framebuffers.get(index).copied()
    }

    /// Whether this framebuffer draws into the swapchain.
    pub fn is_default(&self) -> bool {
        self.swapchain.is_some()
    }

    pub fn key(&self) -> &RenderPassKey {
        &self.key
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn clear_values(&self) -> &[vk::ClearValue] {
        &self.clear_values
    }

    pub fn color_attachment_count(&self) -> usize {
        self.key.colors().len()
    }

    /// Textures bound as attachments, depth/stencil last.
    pub fn attachments(&self) -> &[Arc<Texture>] {
        &self.attachments
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.ctx.defer_destroy(Garbage::Framebuffer {
            framebuffers: std::mem::take(&mut self.framebuffers),
            views: std::mem::take(&mut self.views),
            render_pass: self.render_pass,
        });
    }
}

impl std::fmt::Debug for Framebuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Framebuffer")
            .field("render_pass", &self.render_pass)
            .field("key", &self.key)
            .field("extent", &self.extent)
            .field("default", &self.is_default())
            .finish_non_exhaustive()
    }
}
