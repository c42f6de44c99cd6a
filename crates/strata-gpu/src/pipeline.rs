//! Pipeline creation.
//!
//! Every pipeline uses the global pipeline layout and is built against the
//! cached render pass compatible with its attachment formats, so it can draw
//! into any framebuffer with the same format signature.

use std::io::Cursor;
use std::sync::Arc;

use ash::vk;

use crate::config::{MAX_COLOR_ATTACHMENTS, MAX_VERTEX_ATTRIBUTES};
use crate::context::GpuContext;
use crate::convert::{
    BlendFunction, BlendMethod, CompareOperation, CullMode, FillMode, PrimitiveTopology,
};
use crate::deferred::Garbage;
use crate::descriptors::GlobalDescriptors;
use crate::error::{GpuError, Result};
use crate::format::PixelFormat;
use crate::framebuffer::Framebuffer;
use crate::render_pass::{RenderPassCache, RenderPassKey};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode a SPIR-V binary into words.
pub fn spirv_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| GpuError::ShaderCompilation(format!("Invalid SPIR-V: {e}")))?;
    check_spirv(&words)?;
    Ok(words)
}

fn check_spirv(words: &[u32]) -> Result<()> {
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(()),
        Some(word) => Err(GpuError::ShaderCompilation(format!(
            "Invalid SPIR-V magic number {word:#010x}"
        ))),
        None => Err(GpuError::ShaderCompilation("Empty shader".to_string())),
    }
}

/// Shader module destroyed when it goes out of scope.
struct ShaderModule<'a> {
    device: &'a ash::Device,
    module: vk::ShaderModule,
}

impl<'a> ShaderModule<'a> {
    fn new(device: &'a ash::Device, code: &[u32], stage: &str) -> Result<Self> {
        check_spirv(code).map_err(|e| GpuError::ShaderCompilation(format!("{stage}: {e}")))?;
        let shader_info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = unsafe { device.create_shader_module(&shader_info, None) }
            .map_err(|e| GpuError::ShaderCompilation(format!("{stage}: {e}")))?;
        Ok(Self { device, module })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

/// One vertex buffer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBindingInfo {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
}

/// One vertex attribute read from a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttributeInfo {
    pub location: u32,
    pub binding: u32,
    pub format: PixelFormat,
    pub offset: u32,
}

/// Rasterizer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterizerInfo {
    pub fill_mode: FillMode,
    pub cull_mode: Option<CullMode>,
    pub front_face_ccw: bool,
    /// Enables polygon offset, set per draw with `set_polygon_offset`.
    pub depth_bias: bool,
}

impl Default for RasterizerInfo {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: Some(CullMode::Back),
            front_face_ccw: true,
            depth_bias: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilStateInfo {
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareOperation,
}

impl Default for DepthStencilStateInfo {
    fn default() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            depth_compare: CompareOperation::Less,
        }
    }
}

/// Blending of one color attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendInfo {
    pub enabled: bool,
    pub src_color: BlendMethod,
    pub dst_color: BlendMethod,
    pub color_function: BlendFunction,
    pub src_alpha: BlendMethod,
    pub dst_alpha: BlendMethod,
    pub alpha_function: BlendFunction,
    pub write_mask: vk::ColorComponentFlags,
}

impl Default for BlendInfo {
    fn default() -> Self {
        Self {
            enabled: false,
            src_color: BlendMethod::One,
            dst_color: BlendMethod::Zero,
            color_function: BlendFunction::Add,
            src_alpha: BlendMethod::One,
            dst_alpha: BlendMethod::Zero,
            alpha_function: BlendFunction::Add,
            write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

impl BlendInfo {
    /// Classic `src * a + dst * (1 - a)` blending.
    pub fn alpha_blending() -> Self {
        Self {
            enabled: true,
            src_color: BlendMethod::SrcAlpha,
            dst_color: BlendMethod::OneMinusSrcAlpha,
            src_alpha: BlendMethod::One,
            dst_alpha: BlendMethod::OneMinusSrcAlpha,
            ..Self::default()
        }
    }

    fn to_vk(self) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(self.enabled)
            .src_color_blend_factor(self.src_color.into())
            .dst_color_blend_factor(self.dst_color.into())
            .color_blend_op(self.color_function.into())
            .src_alpha_blend_factor(self.src_alpha.into())
            .dst_alpha_blend_factor(self.dst_alpha.into())
            .alpha_blend_op(self.alpha_function.into())
            .color_write_mask(self.write_mask)
    }
}

/// Graphics pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct GraphicsPipelineInfo {
    pub name: String,
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    pub vertex_bindings: Vec<VertexBindingInfo>,
    pub vertex_attributes: Vec<VertexAttributeInfo>,
    pub topology: PrimitiveTopology,
    pub rasterizer: RasterizerInfo,
    pub depth_stencil: DepthStencilStateInfo,
    /// Per color attachment. Missing entries use [`BlendInfo::default`].
    pub blending: Vec<BlendInfo>,
    pub color_formats: Vec<PixelFormat>,
    /// [`PixelFormat::NONE`] without a depth attachment.
    pub depth_stencil_format: PixelFormat,
}

impl GraphicsPipelineInfo {
    /// Take the attachment formats from `framebuffer`.
    pub fn with_framebuffer(mut self, framebuffer: &Framebuffer) -> Self {
        let key = framebuffer.key();
        self.color_formats = key.colors().to_vec();
        self.depth_stencil_format = key.depth_stencil().unwrap_or(PixelFormat::NONE);
        self
    }

    /// Check counts and locations against the fixed limits.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            Err(GpuError::PipelineCreation(format!(
                "Pipeline '{}': {reason}",
                self.name
            )))
        };

        if self.color_formats.len() > MAX_COLOR_ATTACHMENTS {
            return invalid(format!("{} color attachments", self.color_formats.len()));
        }
        if self.blending.len() > self.color_formats.len() {
            return invalid("more blend states than color attachments".to_string());
        }
        if self.vertex_attributes.len() > MAX_VERTEX_ATTRIBUTES
            || self.vertex_bindings.len() > MAX_VERTEX_ATTRIBUTES
        {
            return invalid(format!(
                "at most {MAX_VERTEX_ATTRIBUTES} vertex attributes and bindings"
            ));
        }
        for attribute in &self.vertex_attributes {
            if !self
                .vertex_bindings
                .iter()
                .any(|b| b.binding == attribute.binding)
            {
                return invalid(format!(
                    "attribute {} reads undeclared binding {}",
                    attribute.location, attribute.binding
                ));
            }
        }
        if self.color_formats.is_empty() && self.depth_stencil_format.is_none() {
            return invalid("no attachments".to_string());
        }
        if !self.depth_stencil_format.is_none() && !self.depth_stencil_format.is_depth_stencil() {
            return invalid(format!(
                "{:?} is not a depth format",
                self.depth_stencil_format
            ));
        }
        Ok(())
    }

    fn render_pass_key(&self) -> Result<RenderPassKey> {
        RenderPassKey::new(&self.color_formats, self.depth_stencil_format)
    }
}

/// Compute pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct ComputePipelineInfo {
    pub name: String,
    pub shader: Vec<u32>,
}

/// Graphics or compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Graphics,
    Compute,
}

/// A pipeline using the global pipeline layout.
pub struct Pipeline {
    ctx: Arc<GpuContext>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    kind: PipelineKind,
    key: Option<RenderPassKey>,
}

impl Pipeline {
    /// Create a graphics pipeline. Viewport, scissor and depth bias are
    /// dynamic state.
    pub fn new_graphics(
        ctx: Arc<GpuContext>,
        render_passes: &RenderPassCache,
        descriptors: &GlobalDescriptors,
        info: &GraphicsPipelineInfo,
    ) -> Result<Self> {
        info.validate()?;
        let device = ctx.device();

        let key = info.render_pass_key()?;
        let render_pass = render_passes.get_or_create_compatible(&key)?;
        let layout = descriptors.pipeline_layout();

        let vert_module = ShaderModule::new(device, &info.vertex_shader, "Vertex")?;
        let frag_module = ShaderModule::new(device, &info.fragment_shader, "Fragment")?;

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module.module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module.module)
                .name(c"main"),
        ];

        let vertex_bindings: Vec<_> = info
            .vertex_bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: if b.per_instance {
                    vk::VertexInputRate::INSTANCE
                } else {
                    vk::VertexInputRate::VERTEX
                },
            })
            .collect();
        let vertex_attributes = info
            .vertex_attributes
            .iter()
            .map(|a| {
                Ok(vk::VertexInputAttributeDescription {
                    location: a.location,
                    binding: a.binding,
                    format: a.format.to_vk()?,
                    offset: a.offset,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vertex_bindings)
            .vertex_attribute_descriptions(&vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(info.topology.into())
            .primitive_restart_enable(false);

        // Viewport (dynamic)
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = &info.rasterizer;
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(rasterizer.fill_mode.into())
            .cull_mode(rasterizer.cull_mode.map_or(vk::CullModeFlags::NONE, Into::into))
            .front_face(if rasterizer.front_face_ccw {
                vk::FrontFace::COUNTER_CLOCKWISE
            } else {
                vk::FrontFace::CLOCKWISE
            })
            .depth_bias_enable(rasterizer.depth_bias)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let has_depth = !info.depth_stencil_format.is_none();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(has_depth && info.depth_stencil.depth_test)
            .depth_write_enable(has_depth && info.depth_stencil.depth_write)
            .depth_compare_op(info.depth_stencil.depth_compare.into())
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments: Vec<_> = (0..info.color_formats.len())
            .map(|i| info.blending.get(i).copied().unwrap_or_default().to_vk())
            .collect();

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::DEPTH_BIAS,
        ];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0);

        let pipelines = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_pipelines, e)| {
            GpuError::PipelineCreation(format!("Pipeline '{}': {e}", info.name))
        })?;
        let handle = pipelines
            .first()
            .copied()
            .ok_or_else(|| GpuError::PipelineCreation("No pipeline created".to_string()))?;

        drop(vert_module);
        drop(frag_module);
        tracing::debug!("Created graphics pipeline '{}' for {:?}", info.name, key);

        Ok(Self {
            ctx,
            handle,
            layout,
            kind: PipelineKind::Graphics,
            key: Some(key),
        })
    }

    /// Create a compute pipeline.
    pub fn new_compute(
        ctx: Arc<GpuContext>,
        descriptors: &GlobalDescriptors,
        info: &ComputePipelineInfo,
    ) -> Result<Self> {
        let device = ctx.device();
        let layout = descriptors.pipeline_layout();
        let shader_module = ShaderModule::new(device, &info.shader, "Compute")?;

        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module.module)
            .name(c"main");

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        }
        .map_err(|(_pipelines, e)| {
            GpuError::PipelineCreation(format!("Pipeline '{}': {e}", info.name))
        })?;
        let handle = pipelines
            .first()
            .copied()
            .ok_or_else(|| GpuError::PipelineCreation("No pipeline created".to_string()))?;

        drop(shader_module);
        tracing::debug!("Created compute pipeline '{}'", info.name);

        Ok(Self {
            ctx,
            handle,
            layout,
            kind: PipelineKind::Compute,
            key: None,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            PipelineKind::Graphics => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }

    /// Attachment signature of a graphics pipeline.
    pub fn render_pass_key(&self) -> Option<&RenderPassKey> {
        self.key.as_ref()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.ctx.defer_destroy(Garbage::Pipeline(self.handle));
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ComponentFormat, TransformFormat};

    fn rgba8() -> PixelFormat {
        PixelFormat::new(ComponentFormat::R8G8B8A8, TransformFormat::Unorm)
    }

    fn info() -> GraphicsPipelineInfo {
        GraphicsPipelineInfo {
            name: "test".to_string(),
            vertex_bindings: vec![VertexBindingInfo {
                binding: 0,
                stride: 12,
                per_instance: false,
            }],
            vertex_attributes: vec![VertexAttributeInfo {
                location: 0,
                binding: 0,
                format: PixelFormat::new(ComponentFormat::R32G32B32, TransformFormat::Float),
                offset: 0,
            }],
            color_formats: vec![rgba8()],
            depth_stencil_format: PixelFormat::new(ComponentFormat::D32, TransformFormat::Float),
            ..Default::default()
        }
    }

    #[test]
    fn spirv_words_are_checked() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 4]);
        assert_eq!(spirv_from_bytes(&bytes).unwrap(), vec![SPIRV_MAGIC, 0]);

        assert!(spirv_from_bytes(&[1, 2, 3]).is_err());
        assert!(spirv_from_bytes(&[0; 8]).is_err());
        assert!(check_spirv(&[]).is_err());
    }

    #[test]
    fn valid_pipeline_info() {
        info().validate().unwrap();
        let key = info().render_pass_key().unwrap();
        assert_eq!(key.colors(), &[rgba8()]);
    }

    #[test]
    fn attributes_must_reference_declared_bindings() {
        let mut bad = info();
        bad.vertex_attributes[0].binding = 3;
        assert!(matches!(bad.validate(), Err(GpuError::PipelineCreation(_))));
    }

    #[test]
    fn attachment_counts_are_limited() {
        let too_many = GraphicsPipelineInfo {
            color_formats: vec![rgba8(); MAX_COLOR_ATTACHMENTS + 1],
            ..info()
        };
        assert!(too_many.validate().is_err());

        let extra_blend = GraphicsPipelineInfo {
            blending: vec![BlendInfo::default(); 2],
            ..info()
        };
        assert!(extra_blend.validate().is_err());

        let no_targets = GraphicsPipelineInfo {
            color_formats: Vec::new(),
            depth_stencil_format: PixelFormat::NONE,
            ..info()
        };
        assert!(no_targets.validate().is_err());

        let color_as_depth = GraphicsPipelineInfo {
            depth_stencil_format: rgba8(),
            ..info()
        };
        assert!(color_as_depth.validate().is_err());
    }

    #[test]
    fn alpha_blending_state() {
        let state = BlendInfo::alpha_blending().to_vk();
        assert_eq!(state.blend_enable, vk::TRUE);
        assert_eq!(state.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        assert_eq!(
            state.dst_color_blend_factor,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
        assert_eq!(state.color_write_mask, vk::ColorComponentFlags::RGBA);

        let opaque = BlendInfo::default().to_vk();
        assert_eq!(opaque.blend_enable, vk::FALSE);
    }
}
