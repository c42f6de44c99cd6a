//! Explicit-API GPU abstraction layer over Vulkan.
//!
//! This crate provides:
//! - Device, queue and swapchain management with bounded frame pacing
//! - Persistent memory allocation via gpu-allocator and a per-frame transient arena
//! - Translation of semantic resource usages into barriers and image layouts
//! - Per-thread command buffer recycling and recording
//! - Render-pass and descriptor-layout caching
//! - Deferred destruction of GPU objects until their frame retires

pub mod barrier;
pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod config;
pub mod context;
pub mod convert;
pub mod deferred;
pub mod descriptors;
pub mod error;
pub mod format;
pub mod frame;
pub mod framebuffer;
pub mod instance;
pub mod loader;
pub mod manager;
pub mod memory;
pub mod pipeline;
pub mod query;
pub mod render_pass;
pub mod resource_group;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod transient;
pub mod usage;

pub use barrier::{
    compute_barrier_info, compute_buffer_barrier_info, compute_image_barrier, compute_layout,
    BarrierInfo, ImageBarrierInfo,
};
pub use buffer::{Buffer, BufferInitInfo, BufferMapping};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{
    CommandBuffer, CommandBufferInitInfo, CommandBufferLevel, RecordingState, RenderPassContents,
};
pub use config::{
    DescriptorLimits, GrConfig, TransientMemoryConfig, MAX_COLOR_ATTACHMENTS,
    MAX_FRAMES_IN_FLIGHT, MAX_VERTEX_ATTRIBUTES,
};
pub use context::{GpuContext, GpuContextBuilder};
pub use convert::{
    AttachmentLoadOperation, AttachmentStoreOperation, BlendFunction, BlendMethod,
    CompareOperation, CullMode, FillMode, IndexType, PrimitiveTopology, SamplingFilter,
    TextureType,
};
pub use error::{GpuError, Result};
pub use format::{ComponentFormat, PixelFormat, TransformFormat};
pub use framebuffer::{
    ClearValue, DefaultFramebufferInfo, Framebuffer, FramebufferAttachmentInfo,
    FramebufferInitInfo,
};
pub use loader::{AsyncLoader, AsyncLoaderTask, TaskOutcome};
pub use manager::{GrManager, SubmitInfo};
pub use pipeline::{
    spirv_from_bytes, BlendInfo, ComputePipelineInfo, DepthStencilStateInfo,
    GraphicsPipelineInfo, Pipeline, PipelineKind, RasterizerInfo, VertexAttributeInfo,
    VertexBindingInfo,
};
pub use query::OcclusionQuery;
pub use render_pass::{RenderPassCache, RenderPassKey};
pub use resource_group::{
    BufferBinding, IndexBufferBinding, ResourceGroup, ResourceGroupInitInfo, TransientBindings,
    VertexBufferBinding,
};
pub use sync::{Fence, Semaphore};
pub use texture::{SamplerInitInfo, Texture, TextureInitInfo, TextureSurfaceInfo};
pub use transient::{TransientAllocation, TransientMemoryToken, TransientUsage};
pub use usage::{BufferMapAccess, BufferUsage, TextureUsage};
