//! Command buffer management and recording.
//!
//! Every recording thread owns a [`CommandBufferRecycler`] wrapping its own
//! command pool. Dropped command buffers go back to the recycler that created
//! them and are reset the next time that recycler hands out a buffer.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::barrier::{
    compute_buffer_barrier_info, compute_image_barrier, mip_level_handoff, ImageBarrierInfo,
};
use crate::buffer::Buffer;
use crate::context::GpuContext;
use crate::convert::TextureType;
use crate::error::{GpuError, Result};
use crate::framebuffer::Framebuffer;
use crate::pipeline::{Pipeline, PipelineKind};
use crate::query::OcclusionQuery;
use crate::resource_group::{ResourceGroup, TransientBindings};
use crate::texture::{Texture, TextureSurfaceInfo};
use crate::transient::{TransientMemoryToken, TransientUsage};
use crate::usage::{BufferUsage, TextureUsage};

/// Command pool for allocating command buffers.
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info, None)? };

        Ok(Self { pool, queue_family })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate a single command buffer.
    ///
    /// # Safety
    /// The device must be valid and the pool externally synchronized.
    pub unsafe fn allocate_command_buffer(
        &self,
        device: &ash::Device,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(1);

        let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("No command buffer allocated".to_string()))
    }

    /// Destroy the command pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        unsafe { device.destroy_command_pool(self.pool, None) };
    }
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid and the caller must hold exclusive access to `queue`.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffers(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    unsafe { device.queue_submit(queue, &[submit_info], fence)? };
    Ok(())
}

/// Primary or secondary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

impl CommandBufferLevel {
    fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
        }
    }
}

impl From<CommandBufferLevel> for vk::CommandBufferLevel {
    fn from(level: CommandBufferLevel) -> Self {
        match level {
            CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
        }
    }
}

/// Per-thread pool of reusable command buffers.
pub struct CommandBufferRecycler {
    ctx: Arc<GpuContext>,
    pool: CommandPool,
    free: [Vec<vk::CommandBuffer>; 2],
    /// Dropped buffers that still need a reset.
    returned: Vec<(vk::CommandBuffer, CommandBufferLevel)>,
    allocated: usize,
}

impl CommandBufferRecycler {
    pub fn new(ctx: Arc<GpuContext>) -> Result<Self> {
        let pool = unsafe {
            CommandPool::new(
                ctx.device(),
                ctx.queue_family(),
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )?
        };
        tracing::debug!(
            "Created command buffer recycler for thread {:?}",
            std::thread::current().id()
        );
        Ok(Self {
            ctx,
            pool,
            free: [Vec::new(), Vec::new()],
            returned: Vec::new(),
            allocated: 0,
        })
    }

    /// A reset command buffer, reused when one is free.
    fn acquire(&mut self, level: CommandBufferLevel) -> Result<vk::CommandBuffer> {
        let device = self.ctx.device();
        for (handle, returned_level) in self.returned.drain(..) {
            unsafe {
                device.reset_command_buffer(handle, vk::CommandBufferResetFlags::empty())?;
            }
            self.free[returned_level.index()].push(handle);
        }

        if let Some(handle) = self.free[level.index()].pop() {
            return Ok(handle);
        }
        let handle = unsafe { self.pool.allocate_command_buffer(device, level.into())? };
        self.allocated += 1;
        Ok(handle)
    }

    /// The GPU must be done with `handle`.
    fn release(&mut self, handle: vk::CommandBuffer, level: CommandBufferLevel) {
        self.returned.push((handle, level));
    }

    /// Buffers ready for reuse, including those awaiting a reset.
    pub fn free_count(&self) -> usize {
        self.free.iter().map(Vec::len).sum::<usize>() + self.returned.len()
    }

    /// Buffers ever allocated from the device.
    pub fn allocated_count(&self) -> usize {
        self.allocated
    }
}

impl Drop for CommandBufferRecycler {
    fn drop(&mut self) {
        // Destroying the pool frees every buffer allocated from it.
        unsafe { self.pool.destroy(self.ctx.device()) };
    }
}

/// How the commands of a render pass are provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderPassContents {
    #[default]
    Inline,
    /// Only secondary command buffers are executed inside the pass.
    SecondLevel,
}

impl From<RenderPassContents> for vk::SubpassContents {
    fn from(contents: RenderPassContents) -> Self {
        match contents {
            RenderPassContents::Inline => vk::SubpassContents::INLINE,
            RenderPassContents::SecondLevel => vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Recording,
    Ended,
    Submitted,
}

/// Debug-only bookkeeping of what a command buffer may record next.
#[derive(Debug, Clone)]
pub struct RecordingTracker {
    state: RecordingState,
    secondary: bool,
    render_pass: Option<RenderPassContents>,
    pipeline: Option<PipelineKind>,
}

impl RecordingTracker {
    pub fn primary() -> Self {
        Self {
            state: RecordingState::Recording,
            secondary: false,
            render_pass: None,
            pipeline: None,
        }
    }

    /// Secondary buffers live entirely inside their render pass.
    pub fn secondary() -> Self {
        Self {
            secondary: true,
            render_pass: Some(RenderPassContents::Inline),
            ..Self::primary()
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn in_render_pass(&self) -> bool {
        self.render_pass.is_some()
    }

    pub fn check_recording(&self) {
        debug_assert!(
            self.state == RecordingState::Recording,
            "command buffer is not recording ({:?})",
            self.state
        );
    }

    pub fn check_outside_render_pass(&self) {
        self.check_recording();
        debug_assert!(
            self.render_pass.is_none(),
            "command not allowed inside a render pass"
        );
    }

    pub fn begin_render_pass(&mut self, contents: RenderPassContents) {
        self.check_outside_render_pass();
        debug_assert!(!self.secondary, "secondary command buffers cannot begin render passes");
        self.render_pass = Some(contents);
    }

    pub fn end_render_pass(&mut self) {
        self.check_recording();
        debug_assert!(
            !self.secondary && self.render_pass.is_some(),
            "no render pass to end"
        );
        self.render_pass = None;
    }

    pub fn bind_pipeline(&mut self, kind: PipelineKind) {
        self.check_recording();
        debug_assert!(
            kind == PipelineKind::Graphics || self.render_pass.is_none(),
            "compute pipelines cannot be bound inside a render pass"
        );
        self.pipeline = Some(kind);
    }

    pub fn check_pipeline_bound(&self) {
        self.check_recording();
        debug_assert!(self.pipeline.is_some(), "no pipeline bound");
    }

    pub fn check_draw(&self) {
        self.check_recording();
        debug_assert!(
            self.render_pass == Some(RenderPassContents::Inline),
            "draws need an inline render pass"
        );
        debug_assert!(
            self.pipeline == Some(PipelineKind::Graphics),
            "draws need a graphics pipeline"
        );
    }

    pub fn check_dispatch(&self) {
        self.check_outside_render_pass();
        debug_assert!(
            self.pipeline == Some(PipelineKind::Compute),
            "dispatches need a compute pipeline"
        );
    }

    pub fn check_execute_secondary(&self) {
        self.check_recording();
        debug_assert!(
            self.render_pass == Some(RenderPassContents::SecondLevel),
            "secondary command buffers need a second-level render pass"
        );
    }

    pub fn end(&mut self) {
        self.check_recording();
        debug_assert!(
            self.secondary || self.render_pass.is_none(),
            "render pass still open"
        );
        self.state = RecordingState::Ended;
    }

    pub fn mark_submitted(&mut self) {
        debug_assert!(
            self.state == RecordingState::Ended,
            "only ended command buffers can be submitted ({:?})",
            self.state
        );
        self.state = RecordingState::Submitted;
    }
}

/// An object kept alive by a command buffer that references it.
#[derive(Debug)]
pub enum RetainedObject {
    Buffer(Arc<Buffer>),
    Texture(Arc<Texture>),
    Pipeline(Arc<Pipeline>),
    Framebuffer(Arc<Framebuffer>),
    ResourceGroup(Arc<ResourceGroup>),
    Query(Arc<OcclusionQuery>),
    CommandBuffer(Box<CommandBuffer>),
}

/// Frame state a command buffer records against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameRecordingInfo {
    pub frame: u64,
    pub image_index: Option<u32>,
    pub transfer_buffer: vk::Buffer,
}

/// Parameters of a new command buffer.
#[derive(Debug, Clone, Default)]
pub enum CommandBufferInitInfo {
    #[default]
    Primary,
    /// Recorded inside a render pass on `framebuffer` and executed from a primary.
    Secondary { framebuffer: Arc<Framebuffer> },
}

/// A command buffer being recorded by the thread that created it.
pub struct CommandBuffer {
    ctx: Arc<GpuContext>,
    handle: vk::CommandBuffer,
    level: CommandBufferLevel,
    recycler: Arc<Mutex<CommandBufferRecycler>>,
    tracker: RecordingTracker,
    frame: FrameRecordingInfo,
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    renders_to_default: bool,
    retained: Vec<RetainedObject>,
}

impl CommandBuffer {
    pub(crate) fn new(
        ctx: Arc<GpuContext>,
        recycler: Arc<Mutex<CommandBufferRecycler>>,
        frame: FrameRecordingInfo,
        info: &CommandBufferInitInfo,
    ) -> Result<Self> {
        let level = match info {
            CommandBufferInitInfo::Primary => CommandBufferLevel::Primary,
            CommandBufferInitInfo::Secondary { .. } => CommandBufferLevel::Secondary,
        };
        let handle = recycler.lock().acquire(level)?;

        let mut cmdb = Self {
            ctx,
            handle,
            level,
            recycler,
            tracker: RecordingTracker::primary(),
            frame,
            layout: vk::PipelineLayout::null(),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            renders_to_default: false,
            retained: Vec::new(),
        };

        match info {
            CommandBufferInitInfo::Primary => {
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                unsafe { cmdb.device().begin_command_buffer(handle, &begin_info)? };
            }
            CommandBufferInitInfo::Secondary { framebuffer } => {
                let target = framebuffer
                    .handle(frame.image_index.unwrap_or(0))
                    .filter(|_| !framebuffer.is_default() || frame.image_index.is_some())
                    .ok_or_else(|| {
                        GpuError::InvalidState(
                            "Default framebuffer used before begin_frame".to_string(),
                        )
                    })?;
                let inheritance = vk::CommandBufferInheritanceInfo::default()
                    .render_pass(framebuffer.render_pass())
                    .subpass(0)
                    .framebuffer(target);
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(
                        vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
                            | vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
                    )
                    .inheritance_info(&inheritance);
                unsafe { cmdb.device().begin_command_buffer(handle, &begin_info)? };

                cmdb.tracker = RecordingTracker::secondary();
                cmdb.renders_to_default = framebuffer.is_default();
                cmdb.retained
                    .push(RetainedObject::Framebuffer(framebuffer.clone()));
            }
        }

        Ok(cmdb)
    }

    fn device(&self) -> &ash::Device {
        self.ctx.device()
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    pub fn state(&self) -> RecordingState {
        self.tracker.state()
    }

    /// Generation of the frame this buffer records for.
    pub fn frame(&self) -> u64 {
        self.frame.frame
    }

    /// Whether a render pass on the default framebuffer was recorded.
    pub fn renders_to_default_framebuffer(&self) -> bool {
        self.renders_to_default
    }

    /// Keep `object` alive until this command buffer is recycled.
    pub fn retain(&mut self, object: RetainedObject) {
        self.retained.push(object);
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.tracker.mark_submitted();
    }

    /// Begin a render pass covering the whole framebuffer.
    pub fn begin_render_pass(
        &mut self,
        framebuffer: &Arc<Framebuffer>,
        contents: RenderPassContents,
    ) -> Result<()> {
        self.tracker.begin_render_pass(contents);

        let image_index = if framebuffer.is_default() {
            self.frame.image_index.ok_or_else(|| {
                GpuError::InvalidState("Default framebuffer used before begin_frame".to_string())
            })?
        } else {
            0
        };
        let target = framebuffer.handle(image_index).ok_or_else(|| {
            GpuError::InvalidState(format!("No framebuffer for swapchain image {image_index}"))
        })?;

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(framebuffer.render_pass())
            .framebuffer(target)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: framebuffer.extent(),
            })
            .clear_values(framebuffer.clear_values());

        unsafe {
            self.device()
                .cmd_begin_render_pass(self.handle, &begin_info, contents.into());
        }

        if framebuffer.is_default() {
            debug_assert!(
                !self.renders_to_default,
                "default framebuffer drawn twice by one command buffer"
            );
            self.renders_to_default = true;
        }
        self.retained
            .push(RetainedObject::Framebuffer(framebuffer.clone()));
        Ok(())
    }

    pub fn end_render_pass(&mut self) {
        self.tracker.end_render_pass();
        unsafe { self.device().cmd_end_render_pass(self.handle) };
    }

    pub fn bind_pipeline(&mut self, pipeline: &Arc<Pipeline>) {
        self.tracker.bind_pipeline(pipeline.kind());
        unsafe {
            self.device()
                .cmd_bind_pipeline(self.handle, pipeline.bind_point(), pipeline.handle());
        }
        self.layout = pipeline.layout();
        self.bind_point = pipeline.bind_point();
        self.retained
            .push(RetainedObject::Pipeline(pipeline.clone()));
    }

    /// Bind `group` as descriptor set `set`, plus its vertex and index buffers
    /// for graphics. Transient slots take their offsets from `transient`.
    pub fn bind_resource_group(
        &mut self,
        group: &Arc<ResourceGroup>,
        set: u32,
        transient: Option<&TransientBindings>,
    ) -> Result<()> {
        self.tracker.check_pipeline_bound();

        if group.descriptor_set() != vk::DescriptorSet::null() {
            let offsets = group.dynamic_offsets(transient, self.frame.frame)?;
            unsafe {
                self.device().cmd_bind_descriptor_sets(
                    self.handle,
                    self.bind_point,
                    self.layout,
                    set,
                    &[group.descriptor_set()],
                    &offsets,
                );
            }
        }

        if self.bind_point == vk::PipelineBindPoint::GRAPHICS {
            let vertex_buffers = group.vertex_buffers();
            if !vertex_buffers.is_empty() {
                let buffers: Vec<_> = vertex_buffers.iter().map(|b| b.buffer.handle()).collect();
                let offsets: Vec<_> = vertex_buffers.iter().map(|b| b.offset).collect();
                unsafe {
                    self.device()
                        .cmd_bind_vertex_buffers(self.handle, 0, &buffers, &offsets);
                }
            }
            if let Some(index) = group.index_buffer() {
                unsafe {
                    self.device().cmd_bind_index_buffer(
                        self.handle,
                        index.buffer.handle(),
                        index.offset,
                        index.index_type.into(),
                    );
                }
            }
        }

        self.retained
            .push(RetainedObject::ResourceGroup(group.clone()));
        Ok(())
    }

    /// Set the viewport. The scissor always matches it.
    pub fn set_viewport(&mut self, x: u32, y: u32, width: u32, height: u32) {
        self.tracker.check_recording();
        let viewport = vk::Viewport {
            x: x as f32,
            y: y as f32,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: x as i32,
                y: y as i32,
            },
            extent: vk::Extent2D { width, height },
        };
        unsafe {
            self.device().cmd_set_viewport(self.handle, 0, &[viewport]);
            self.device().cmd_set_scissor(self.handle, 0, &[scissor]);
        }
    }

    /// Polygon offset of pipelines created with depth bias enabled.
    pub fn set_polygon_offset(&mut self, factor: f32, units: f32) {
        self.tracker.check_recording();
        unsafe { self.device().cmd_set_depth_bias(self.handle, units, 0.0, factor) };
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.tracker.check_draw();
        unsafe {
            self.device().cmd_draw(
                self.handle,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        self.tracker.check_draw();
        unsafe {
            self.device().cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                base_vertex,
                first_instance,
            );
        }
    }

    pub fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        self.tracker.check_dispatch();
        unsafe {
            self.device()
                .cmd_dispatch(self.handle, group_count_x, group_count_y, group_count_z);
        }
    }

    fn pipeline_barrier(
        &self,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: &[vk::BufferMemoryBarrier],
        image_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device().cmd_pipeline_barrier(
                self.handle,
                src_stages,
                dst_stages,
                vk::DependencyFlags::empty(),
                &[],
                buffer_barriers,
                image_barriers,
            );
        }
    }

    /// Transition every level and layer of `texture` from `before` to `after`.
    pub fn set_texture_barrier(
        &mut self,
        texture: &Arc<Texture>,
        before: TextureUsage,
        after: TextureUsage,
    ) -> Result<()> {
        self.tracker.check_outside_render_pass();
        debug_assert!(
            texture.usage().contains(before) && texture.usage().contains(after),
            "{before:?} -> {after:?} not declared by {texture:?}"
        );

        let level_count = texture.mipmap_count();
        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();
        let mut barriers = Vec::with_capacity(level_count as usize);
        for level in 0..level_count {
            let info = compute_image_barrier(
                before,
                after,
                texture.is_depth_stencil(),
                level,
                level_count,
            )?;
            src_stages |= info.stages.src_stages;
            dst_stages |= info.stages.dst_stages;
            barriers.push(image_barrier(texture.image(), texture.level_range(level), &info));
        }

        self.pipeline_barrier(src_stages, dst_stages, &[], &barriers);
        self.retained.push(RetainedObject::Texture(texture.clone()));
        Ok(())
    }

    /// Transition a single surface of `texture`.
    pub fn set_texture_surface_barrier(
        &mut self,
        texture: &Arc<Texture>,
        before: TextureUsage,
        after: TextureUsage,
        surface: &TextureSurfaceInfo,
    ) -> Result<()> {
        self.tracker.check_outside_render_pass();
        texture.check_surface(surface)?;

        let info = compute_image_barrier(
            before,
            after,
            texture.is_depth_stencil(),
            surface.level,
            texture.mipmap_count(),
        )?;
        let barrier = image_barrier(texture.image(), texture.surface_range(surface), &info);
        self.pipeline_barrier(info.stages.src_stages, info.stages.dst_stages, &[], &[barrier]);
        self.retained.push(RetainedObject::Texture(texture.clone()));
        Ok(())
    }

    /// Make `size` bytes at `offset` written as `before` visible to `after`.
    pub fn set_buffer_barrier(
        &mut self,
        buffer: &Arc<Buffer>,
        before: BufferUsage,
        after: BufferUsage,
        offset: u64,
        size: u64,
    ) -> Result<()> {
        self.tracker.check_outside_render_pass();
        let info = compute_buffer_barrier_info(before, after)?;
        let barrier = vk::BufferMemoryBarrier::default()
            .src_access_mask(info.src_access)
            .dst_access_mask(info.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.handle())
            .offset(offset)
            .size(size);
        self.pipeline_barrier(info.src_stages, info.dst_stages, &[barrier], &[]);
        self.retained.push(RetainedObject::Buffer(buffer.clone()));
        Ok(())
    }

    fn check_transfer_token(&self, token: &TransientMemoryToken) {
        debug_assert!(
            token.usage == TransientUsage::Transfer,
            "{token:?} is not transfer memory"
        );
        debug_assert!(
            token.generation == self.frame.frame,
            "{token:?} does not belong to frame {}",
            self.frame.frame
        );
    }

    /// Copy an upload from transient memory into one surface of `texture`,
    /// which must be in the upload layout.
    pub fn copy_buffer_to_texture_surface(
        &mut self,
        token: &TransientMemoryToken,
        texture: &Arc<Texture>,
        surface: &TextureSurfaceInfo,
    ) -> Result<()> {
        self.tracker.check_outside_render_pass();
        self.check_transfer_token(token);
        debug_assert!(
            texture.usage().contains(TextureUsage::UPLOAD),
            "{texture:?} was not created for uploads"
        );
        texture.check_surface(surface)?;

        let (width, height) = texture.level_extent(surface.level);
        debug_assert!(
            token.range >= texture.format().surface_size(width, height),
            "{token:?} too small for a {width}x{height} surface"
        );

        let mut subresource = texture.surface_layers(surface);
        if texture.is_depth_stencil() {
            subresource.aspect_mask = vk::ImageAspectFlags::DEPTH;
        }
        let z = if texture.texture_type() == TextureType::Texture3D {
            surface.depth as i32
        } else {
            0
        };
        let region = vk::BufferImageCopy {
            buffer_offset: token.offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: subresource,
            image_offset: vk::Offset3D { x: 0, y: 0, z },
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };

        unsafe {
            self.device().cmd_copy_buffer_to_image(
                self.handle,
                self.frame.transfer_buffer,
                texture.image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        self.retained.push(RetainedObject::Texture(texture.clone()));
        Ok(())
    }

    /// Copy an upload from transient memory into `dst`.
    pub fn copy_transient_to_buffer(
        &mut self,
        token: &TransientMemoryToken,
        dst: &Arc<Buffer>,
        dst_offset: u64,
    ) {
        self.tracker.check_outside_render_pass();
        self.check_transfer_token(token);
        let region = vk::BufferCopy {
            src_offset: token.offset,
            dst_offset,
            size: token.range,
        };
        unsafe {
            self.device().cmd_copy_buffer(
                self.handle,
                self.frame.transfer_buffer,
                dst.handle(),
                &[region],
            );
        }
        self.retained.push(RetainedObject::Buffer(dst.clone()));
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &Arc<Buffer>,
        src_offset: u64,
        dst: &Arc<Buffer>,
        dst_offset: u64,
        size: u64,
    ) {
        self.tracker.check_outside_render_pass();
        debug_assert!(
            src.usage().contains(BufferUsage::TRANSFER_SOURCE)
                && dst.usage().contains(BufferUsage::TRANSFER_DESTINATION),
            "copy needs transfer usages"
        );
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        unsafe {
            self.device()
                .cmd_copy_buffer(self.handle, src.handle(), dst.handle(), &[region]);
        }
        self.retained.push(RetainedObject::Buffer(src.clone()));
        self.retained.push(RetainedObject::Buffer(dst.clone()));
    }

    /// Fill `size` bytes at `offset` with a repeated 32-bit value.
    pub fn fill_buffer(&mut self, buffer: &Arc<Buffer>, offset: u64, size: u64, value: u32) {
        self.tracker.check_outside_render_pass();
        unsafe {
            self.device()
                .cmd_fill_buffer(self.handle, buffer.handle(), offset, size, value);
        }
        self.retained.push(RetainedObject::Buffer(buffer.clone()));
    }

    /// Blit level `k` into level `k + 1` for every level of one face/layer.
    ///
    /// Level 0 must be a transfer source and every other level a transfer
    /// destination, as left by a transition to [`TextureUsage::GENERATE_MIPMAPS`].
    /// Afterwards every level but the last is a transfer source.
    pub fn generate_mipmaps(&mut self, texture: &Arc<Texture>, face: u32, layer: u32) -> Result<()> {
        self.tracker.check_outside_render_pass();
        debug_assert!(
            texture.usage().contains(TextureUsage::GENERATE_MIPMAPS),
            "{texture:?} was not created for mip generation"
        );
        if texture.texture_type() == TextureType::Texture3D {
            return Err(GpuError::InvalidState(
                "Mip generation of 3D textures is not supported".to_string(),
            ));
        }
        texture.check_surface(&TextureSurfaceInfo::new(0, 0, face, layer))?;

        let filter = if texture.is_depth_stencil() {
            vk::Filter::NEAREST
        } else {
            vk::Filter::LINEAR
        };
        let level_count = texture.mipmap_count();
        let handoff = mip_level_handoff();

        for level in 0..level_count.saturating_sub(1) {
            let src = TextureSurfaceInfo::new(level, 0, face, layer);
            let dst = TextureSurfaceInfo::new(level + 1, 0, face, layer);
            let (src_width, src_height) = texture.level_extent(level);
            let (dst_width, dst_height) = texture.level_extent(level + 1);

            let blit = vk::ImageBlit {
                src_subresource: texture.surface_layers(&src),
                src_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: src_width as i32,
                        y: src_height as i32,
                        z: 1,
                    },
                ],
                dst_subresource: texture.surface_layers(&dst),
                dst_offsets: [
                    vk::Offset3D::default(),
                    vk::Offset3D {
                        x: dst_width as i32,
                        y: dst_height as i32,
                        z: 1,
                    },
                ],
            };

            unsafe {
                self.device().cmd_blit_image(
                    self.handle,
                    texture.image(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    texture.image(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[blit],
                    filter,
                );
            }

            // The last level stays a transfer destination.
            if level + 2 < level_count {
                let barrier = image_barrier(texture.image(), texture.surface_range(&dst), &handoff);
                self.pipeline_barrier(
                    handoff.stages.src_stages,
                    handoff.stages.dst_stages,
                    &[],
                    &[barrier],
                );
            }
        }

        self.retained.push(RetainedObject::Texture(texture.clone()));
        Ok(())
    }

    /// Reset and begin `query`. Both happen outside render passes, so the
    /// query covers whole passes.
    pub fn begin_occlusion_query(&mut self, query: &Arc<OcclusionQuery>) {
        self.tracker.check_outside_render_pass();
        let flags = if query.is_precise() {
            vk::QueryControlFlags::PRECISE
        } else {
            vk::QueryControlFlags::empty()
        };
        unsafe {
            self.device()
                .cmd_reset_query_pool(self.handle, query.pool(), 0, 1);
            self.device()
                .cmd_begin_query(self.handle, query.pool(), 0, flags);
        }
        self.retained.push(RetainedObject::Query(query.clone()));
    }

    pub fn end_occlusion_query(&mut self, query: &Arc<OcclusionQuery>) {
        self.tracker.check_outside_render_pass();
        unsafe { self.device().cmd_end_query(self.handle, query.pool(), 0) };
        self.retained.push(RetainedObject::Query(query.clone()));
    }

    /// Move a swapchain image nobody rendered to into the present layout.
    pub(crate) fn transition_for_present(&mut self, image: vk::Image) {
        self.tracker.check_outside_render_pass();
        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        self.pipeline_barrier(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            &[],
            &[barrier],
        );
        self.renders_to_default = true;
    }

    /// Execute an ended secondary buffer inside a second-level render pass.
    pub fn execute_secondary(&mut self, secondary: CommandBuffer) {
        self.tracker.check_execute_secondary();
        debug_assert!(
            secondary.level == CommandBufferLevel::Secondary
                && secondary.state() == RecordingState::Ended,
            "only ended secondary command buffers can be executed"
        );
        unsafe {
            self.device()
                .cmd_execute_commands(self.handle, &[secondary.handle]);
        }
        self.retained
            .push(RetainedObject::CommandBuffer(Box::new(secondary)));
    }

    /// Finish recording.
    pub fn end(&mut self) -> Result<()> {
        self.tracker.end();
        unsafe { self.device().end_command_buffer(self.handle)? };
        Ok(())
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.recycler.lock().release(self.handle, self.level);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("level", &self.level)
            .field("state", &self.tracker.state())
            .field("frame", &self.frame.frame)
            .field("retained", &self.retained.len())
            .finish_non_exhaustive()
    }
}

fn image_barrier(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    info: &ImageBarrierInfo,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .src_access_mask(info.stages.src_access)
        .dst_access_mask(info.stages.dst_access)
        .old_layout(info.old_layout)
        .new_layout(info.new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_recording_flow() {
        let mut tracker = RecordingTracker::primary();
        tracker.check_outside_render_pass();
        tracker.bind_pipeline(PipelineKind::Compute);
        tracker.check_dispatch();

        tracker.begin_render_pass(RenderPassContents::Inline);
        assert!(tracker.in_render_pass());
        tracker.bind_pipeline(PipelineKind::Graphics);
        tracker.check_draw();
        tracker.end_render_pass();

        tracker.begin_render_pass(RenderPassContents::SecondLevel);
        tracker.check_execute_secondary();
        tracker.end_render_pass();

        tracker.end();
        assert_eq!(tracker.state(), RecordingState::Ended);
        tracker.mark_submitted();
        assert_eq!(tracker.state(), RecordingState::Submitted);
    }

    #[test]
    fn secondary_buffers_start_inside_their_pass() {
        let mut tracker = RecordingTracker::secondary();
        assert!(tracker.in_render_pass());
        tracker.bind_pipeline(PipelineKind::Graphics);
        tracker.check_draw();
        tracker.end();
        assert_eq!(tracker.state(), RecordingState::Ended);
    }

    #[test]
    fn levels_map_to_vulkan() {
        assert_eq!(
            vk::CommandBufferLevel::from(CommandBufferLevel::Secondary),
            vk::CommandBufferLevel::SECONDARY
        );
        assert_eq!(
            vk::SubpassContents::from(RenderPassContents::SecondLevel),
            vk::SubpassContents::SECONDARY_COMMAND_BUFFERS
        );
    }

    #[test]
    fn barrier_builder_copies_layouts() {
        let info = mip_level_handoff();
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 2,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let barrier = image_barrier(vk::Image::null(), range, &info);
        assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barrier.subresource_range.base_mip_level, 2);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "not recording")]
    fn recording_after_end_panics() {
        let mut tracker = RecordingTracker::primary();
        tracker.end();
        tracker.check_recording();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "inline render pass")]
    fn draw_outside_render_pass_panics() {
        let mut tracker = RecordingTracker::primary();
        tracker.bind_pipeline(PipelineKind::Graphics);
        tracker.check_draw();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "inside a render pass")]
    fn dispatch_inside_render_pass_panics() {
        let mut tracker = RecordingTracker::primary();
        tracker.bind_pipeline(PipelineKind::Compute);
        tracker.begin_render_pass(RenderPassContents::Inline);
        tracker.check_dispatch();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "render pass still open")]
    fn ending_inside_render_pass_panics() {
        let mut tracker = RecordingTracker::primary();
        tracker.begin_render_pass(RenderPassContents::Inline);
        tracker.end();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "only ended command buffers")]
    fn submitting_while_recording_panics() {
        let mut tracker = RecordingTracker::primary();
        tracker.mark_submitted();
    }
}
