//! The device and frame manager.
//!
//! [`GrManager`] owns every device-wide object, drives the frame loop and
//! serializes queue access. All methods take `&self`, so the manager can be
//! shared across recording threads through an `Arc`.

use std::sync::Arc;

use ash::vk;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use thread_local::ThreadLocal;

use crate::buffer::{Buffer, BufferInitInfo};
use crate::command::{
    submit_command_buffers, CommandBuffer, CommandBufferInitInfo, CommandBufferRecycler,
    FrameRecordingInfo,
};
use crate::config::{GrConfig, MAX_FRAMES_IN_FLIGHT};
use crate::context::{GpuContext, GpuContextBuilder};
use crate::descriptors::GlobalDescriptors;
use crate::error::{GpuError, InitStep, Result};
use crate::frame::{slot_of, FramePacer};
use crate::framebuffer::{DefaultFramebufferInfo, Framebuffer, FramebufferInitInfo};
use crate::loader::FrameSignal;
use crate::pipeline::{ComputePipelineInfo, GraphicsPipelineInfo, Pipeline};
use crate::query::OcclusionQuery;
use crate::render_pass::RenderPassCache;
use crate::resource_group::{ResourceGroup, ResourceGroupInitInfo};
use crate::swapchain::SwapchainState;
use crate::sync::{Fence, FencePool, Semaphore, SemaphorePool};
use crate::texture::{Texture, TextureInitInfo};
use crate::transient::{TransientAllocation, TransientMemoryManager, TransientUsage};
use crate::usage::TextureUsage;

/// State of one of the `MAX_FRAMES_IN_FLIGHT` frame slots.
#[derive(Default)]
struct FrameSlot {
    /// Kept until the frame retires, then returned to their recyclers.
    command_buffers: Vec<CommandBuffer>,
    acquire_semaphore: Option<Arc<Semaphore>>,
    render_semaphore: Option<Arc<Semaphore>>,
    image_index: Option<u32>,
}

impl FrameSlot {
    fn reset(&mut self) {
        self.command_buffers.clear();
        self.acquire_semaphore = None;
        self.render_semaphore = None;
        self.image_index = None;
    }
}

/// A frame ready to hand to the presentation engine.
struct PendingPresent {
    image_index: u32,
    render: Arc<Semaphore>,
}

/// Everything guarded by the queue mutex.
struct QueueState {
    pacer: FramePacer<Fence>,
    slots: [FrameSlot; MAX_FRAMES_IN_FLIGHT],
}

impl QueueState {
    fn current(&mut self) -> &mut FrameSlot {
        let slot = self.pacer.slot();
        &mut self.slots[slot]
    }
}

/// Semaphores a submission waits on before the given stages.
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    pub wait_semaphores: Vec<Arc<Semaphore>>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphore: Option<Arc<Semaphore>>,
}

impl SubmitInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wait(mut self, semaphore: Arc<Semaphore>, stages: vk::PipelineStageFlags) -> Self {
        self.wait_semaphores.push(semaphore);
        self.wait_stages.push(stages);
        self
    }

    pub fn with_signal(mut self, semaphore: Arc<Semaphore>) -> Self {
        self.signal_semaphore = Some(semaphore);
        self
    }
}

/// Owns the device, swapchain and per-frame state.
pub struct GrManager {
    ctx: Arc<GpuContext>,
    config: GrConfig,
    descriptors: GlobalDescriptors,
    render_passes: RenderPassCache,
    transient: TransientMemoryManager,
    fences: Arc<FencePool>,
    semaphores: Arc<SemaphorePool>,
    recyclers: ThreadLocal<Arc<Mutex<CommandBufferRecycler>>>,
    queue: Mutex<QueueState>,
    swapchain: Option<Arc<SwapchainState>>,
    /// Held shared by work that must stay within one frame, exclusively by `end_frame`.
    frame_lock: RwLock<()>,
    frame_signal: FrameSignal,
}

impl GrManager {
    /// Create a manager without presentation.
    pub fn new(config: GrConfig) -> Result<Self> {
        let ctx = GpuContextBuilder::new()
            .app_name(&config.app_name)
            .validation(config.validation)
            .build()?;
        Self::from_context(ctx, config)
    }

    /// Create a manager presenting to `window`.
    pub fn with_window<W>(config: GrConfig, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let ctx = GpuContextBuilder::new()
            .app_name(&config.app_name)
            .validation(config.validation)
            .build_with_window(window)?;
        Self::from_context(ctx, config)
    }

    /// Build the device-wide objects on top of `ctx`. A swapchain is created
    /// when the context has a surface.
    pub fn from_context(ctx: Arc<GpuContext>, config: GrConfig) -> Result<Self> {
        let descriptors =
            GlobalDescriptors::new(ctx.clone(), &config.descriptors).init_step("descriptors")?;
        let transient = TransientMemoryManager::new(ctx.clone(), &config.transient)
            .init_step("transient memory")?;

        let swapchain = if ctx.surface().is_some() {
            let swapchain = SwapchainState::new(ctx.clone(), config.width, config.height, config.vsync)
                .init_step("swapchain")?;
            Some(Arc::new(swapchain))
        } else {
            None
        };

        tracing::info!(
            "GPU manager initialized ({}, {} frames in flight)",
            if swapchain.is_some() {
                "windowed"
            } else {
                "headless"
            },
            MAX_FRAMES_IN_FLIGHT
        );

        Ok(Self {
            render_passes: RenderPassCache::new(ctx.clone()),
            fences: FencePool::new(ctx.clone()),
            semaphores: SemaphorePool::new(ctx.clone()),
            recyclers: ThreadLocal::new(),
            queue: Mutex::new(QueueState {
                pacer: FramePacer::new(),
                slots: std::array::from_fn(|_| FrameSlot::default()),
            }),
            frame_lock: RwLock::new(()),
            frame_signal: FrameSignal::new(),
            ctx,
            config,
            descriptors,
            transient,
            swapchain,
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    pub fn config(&self) -> &GrConfig {
        &self.config
    }

    pub fn descriptors(&self) -> &GlobalDescriptors {
        &self.descriptors
    }

    pub fn render_pass_cache(&self) -> &RenderPassCache {
        &self.render_passes
    }

    pub fn transient_memory(&self) -> &TransientMemoryManager {
        &self.transient
    }

    pub fn swapchain(&self) -> Option<&Arc<SwapchainState>> {
        self.swapchain.as_ref()
    }

    pub fn is_headless(&self) -> bool {
        self.swapchain.is_none()
    }

    /// Generation of the frame being recorded.
    pub fn frame(&self) -> u64 {
        self.ctx.generation()
    }

    /// Keep the current frame from ending while the guard lives.
    ///
    /// Threads other than the one driving the frame loop hold this while
    /// allocating transient memory and submitting the work that reads it.
    /// Calling [`Self::end_frame`] while holding it deadlocks.
    pub fn frame_scope(&self) -> RwLockReadGuard<'_, ()> {
        self.frame_lock.read_recursive()
    }

    pub(crate) fn frame_signal(&self) -> &FrameSignal {
        &self.frame_signal
    }

    /// Submitted frames the GPU has not finished yet.
    pub fn frames_in_flight(&self) -> usize {
        self.queue.lock().pacer.frames_in_flight()
    }

    /// Acquire the swapchain image of the current frame. Does nothing headless.
    ///
    /// [`GpuError::SwapchainOutOfDate`] asks the caller to recreate the swapchain.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame(&self) -> Result<()> {
        let Some(swapchain) = &self.swapchain else {
            return Ok(());
        };

        let semaphore = self.semaphores.new_semaphore()?;
        let image_index = unsafe { swapchain.acquire_next_image(semaphore.handle())? };
        semaphore.mark_signaled(None);

        let mut queue = self.queue.lock();
        let slot = queue.current();
        debug_assert!(
            slot.image_index.is_none(),
            "begin_frame called twice in one frame"
        );
        slot.acquire_semaphore = Some(semaphore);
        slot.image_index = Some(image_index);
        Ok(())
    }

    /// Block until the slot of the next frame is free, then present and recycle
    /// what the retired frame used.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn end_frame(&self) -> Result<()> {
        let frame_lock = self.frame_lock.write();
        let mut queue = self.queue.lock();

        let pending = match &self.swapchain {
            Some(swapchain) => self.prepare_present(&mut queue, swapchain),
            None => Ok(None),
        };

        // Waits on the frame `MAX_FRAMES_IN_FLIGHT - 1` behind this one.
        let retired = queue.pacer.end_frame()?;
        let next = queue.pacer.frame();
        let next_slot = slot_of(next);

        let presented = match (pending, &self.swapchain) {
            (Ok(Some(pending)), Some(swapchain)) => self.present(swapchain, &pending),
            (Ok(_), _) => Ok(()),
            (Err(e), _) => Err(e),
        };

        queue.slots[next_slot].reset();
        self.transient.reset_slot(next_slot);
        if let Some(retired) = retired {
            self.ctx.collect_garbage(retired);
        }
        self.ctx.set_generation(next);
        drop(queue);
        drop(frame_lock);

        self.frame_signal.notify(next);
        presented
    }

    /// Make sure the acquired image has a render semaphore to present with.
    fn prepare_present(
        &self,
        queue: &mut QueueState,
        swapchain: &SwapchainState,
    ) -> Result<Option<PendingPresent>> {
        let Some(image_index) = queue.current().image_index else {
            tracing::warn!("end_frame without begin_frame, nothing to present");
            return Ok(None);
        };

        if queue.current().render_semaphore.is_none() {
            tracing::warn!("Nobody draw to the default framebuffer");
            // The acquired image still has to reach the present layout.
            let image = swapchain.images()[image_index as usize];
            let mut cmdb = self.new_command_buffer_locked(queue, &CommandBufferInitInfo::Primary)?;
            cmdb.transition_for_present(image);
            cmdb.end()?;
            self.submit_locked(queue, cmdb, &SubmitInfo::default())?;
        }

        let render = queue
            .current()
            .render_semaphore
            .clone()
            .ok_or_else(|| GpuError::InvalidState("No render semaphore".to_string()))?;
        Ok(Some(PendingPresent {
            image_index,
            render,
        }))
    }

    fn present(&self, swapchain: &SwapchainState, pending: &PendingPresent) -> Result<()> {
        let render = &pending.render;
        let result =
            unsafe { swapchain.present(self.ctx.queue(), pending.image_index, &[render.handle()]) };
        if let Some(fence) = render.fence() {
            render.mark_waited(fence);
        }
        result
    }

    /// A command buffer recorded by the calling thread for the current frame.
    pub fn new_command_buffer(&self, info: &CommandBufferInitInfo) -> Result<CommandBuffer> {
        let image_index = self.queue.lock().current().image_index;
        self.create_command_buffer(image_index, info)
    }

    fn new_command_buffer_locked(
        &self,
        queue: &mut QueueState,
        info: &CommandBufferInitInfo,
    ) -> Result<CommandBuffer> {
        let image_index = queue.current().image_index;
        self.create_command_buffer(image_index, info)
    }

    fn create_command_buffer(
        &self,
        image_index: Option<u32>,
        info: &CommandBufferInitInfo,
    ) -> Result<CommandBuffer> {
        let recycler = self
            .recyclers
            .get_or_try(|| CommandBufferRecycler::new(self.ctx.clone()).map(|r| Arc::new(Mutex::new(r))))?
            .clone();
        let frame = FrameRecordingInfo {
            frame: self.frame(),
            image_index,
            transfer_buffer: self.transient.buffer(TransientUsage::Transfer),
        };
        CommandBuffer::new(self.ctx.clone(), recycler, frame, info)
    }

    /// Submit an ended command buffer. Returns the fence of the submission.
    ///
    /// A command buffer that drew to the default framebuffer also waits on the
    /// acquired image and signals the semaphore presentation waits on. Only one
    /// such submission is allowed per frame.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, cmdb: CommandBuffer, info: &SubmitInfo) -> Result<Arc<Fence>> {
        let mut queue = self.queue.lock();
        self.submit_locked(&mut queue, cmdb, info)
    }

    fn submit_locked(
        &self,
        queue: &mut QueueState,
        mut cmdb: CommandBuffer,
        info: &SubmitInfo,
    ) -> Result<Arc<Fence>> {
        debug_assert_eq!(
            info.wait_semaphores.len(),
            info.wait_stages.len(),
            "one stage mask per wait semaphore"
        );
        debug_assert_eq!(
            cmdb.frame(),
            queue.pacer.frame(),
            "command buffer recorded for another frame"
        );

        let renders_to_default = cmdb.renders_to_default_framebuffer();
        check_wait_semaphores(
            info.wait_semaphores.len(),
            renders_to_default,
            self.config.max_wait_semaphores,
        )?;

        let mut wait_semaphores: Vec<_> = info.wait_semaphores.iter().map(|s| s.handle()).collect();
        let mut wait_stages = info.wait_stages.clone();
        let mut signal_semaphores: Vec<_> = info.signal_semaphore.iter().map(|s| s.handle()).collect();

        let mut frame_semaphores = None;
        if renders_to_default {
            let slot = queue.current();
            debug_assert!(
                slot.render_semaphore.is_none(),
                "only one submission per frame may draw to the default framebuffer"
            );
            let acquire = slot.acquire_semaphore.clone().ok_or_else(|| {
                GpuError::InvalidState("Default framebuffer drawn before begin_frame".to_string())
            })?;
            let render = self.semaphores.new_semaphore()?;
            wait_semaphores.push(acquire.handle());
            wait_stages.push(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
            signal_semaphores.push(render.handle());
            frame_semaphores = Some((acquire, render));
        }

        let fence = self.fences.new_fence()?;
        unsafe {
            submit_command_buffers(
                self.ctx.device(),
                self.ctx.queue(),
                &[cmdb.handle()],
                &wait_semaphores,
                &wait_stages,
                &signal_semaphores,
                fence.handle(),
            )?;
        }

        for semaphore in &info.wait_semaphores {
            semaphore.mark_waited(fence.clone());
        }
        if let Some(semaphore) = &info.signal_semaphore {
            semaphore.mark_signaled(Some(fence.clone()));
        }
        if let Some((acquire, render)) = frame_semaphores {
            acquire.mark_waited(fence.clone());
            render.mark_signaled(Some(fence.clone()));
            queue.current().render_semaphore = Some(render);
        }

        cmdb.mark_submitted();
        queue.pacer.on_submit(fence.clone());
        queue.current().command_buffers.push(cmdb);
        Ok(fence)
    }

    /// Bump-allocate transient memory for the current frame.
    ///
    /// The allocation keeps the frame from ending, so drop it before calling
    /// [`Self::end_frame`] on the same thread.
    /// [`GpuError::OutOfTransientMemory`] is retryable once a frame retires.
    pub fn allocate_frame_transient_memory(
        &self,
        size: u64,
        usage: TransientUsage,
    ) -> Result<TransientAllocation<'_>> {
        let frame = self.frame_lock.read_recursive();
        // SAFETY: the slot is reset by end_frame only, which the read guard
        // holds off until the allocation is dropped.
        let (token, data) = unsafe { self.transient.allocate(size, usage, self.frame())? };
        Ok(TransientAllocation::new(token, data, frame))
    }

    pub fn new_semaphore(&self) -> Result<Arc<Semaphore>> {
        self.semaphores.new_semaphore()
    }

    pub fn new_buffer(&self, info: &BufferInitInfo) -> Result<Arc<Buffer>> {
        Buffer::new(self.ctx.clone(), info).map(Arc::new)
    }

    /// Create a texture and, when it declares an initial usage, submit the
    /// transition into it.
    pub fn new_texture(&self, info: &TextureInitInfo) -> Result<Arc<Texture>> {
        let texture = Arc::new(Texture::new(self.ctx.clone(), info)?);

        if !info.initial_usage.is_empty() {
            let mut cmdb = self.new_command_buffer(&CommandBufferInitInfo::Primary)?;
            cmdb.set_texture_barrier(&texture, TextureUsage::empty(), info.initial_usage)?;
            cmdb.end()?;
            self.submit(cmdb, &SubmitInfo::default())?;
        }

        Ok(texture)
    }

    pub fn new_framebuffer(&self, info: &FramebufferInitInfo) -> Result<Arc<Framebuffer>> {
        Framebuffer::new(self.ctx.clone(), info).map(Arc::new)
    }

    /// The framebuffer drawing into the swapchain.
    pub fn new_default_framebuffer(&self, info: &DefaultFramebufferInfo) -> Result<Arc<Framebuffer>> {
        let swapchain = self.swapchain.clone().ok_or_else(|| {
            GpuError::InvalidState("Headless manager has no default framebuffer".to_string())
        })?;
        Framebuffer::new_default(self.ctx.clone(), swapchain, info).map(Arc::new)
    }

    pub fn new_graphics_pipeline(&self, info: &GraphicsPipelineInfo) -> Result<Arc<Pipeline>> {
        Pipeline::new_graphics(self.ctx.clone(), &self.render_passes, &self.descriptors, info)
            .map(Arc::new)
    }

    pub fn new_compute_pipeline(&self, info: &ComputePipelineInfo) -> Result<Arc<Pipeline>> {
        Pipeline::new_compute(self.ctx.clone(), &self.descriptors, info).map(Arc::new)
    }

    pub fn new_resource_group(&self, info: &ResourceGroupInitInfo) -> Result<Arc<ResourceGroup>> {
        ResourceGroup::new(self.ctx.clone(), &self.descriptors, &self.transient, info).map(Arc::new)
    }

    pub fn new_occlusion_query(&self) -> Result<Arc<OcclusionQuery>> {
        OcclusionQuery::new(self.ctx.clone()).map(Arc::new)
    }

    /// Block until the GPU has finished everything submitted so far.
    pub fn finish(&self) -> Result<()> {
        self.queue.lock().pacer.wait_all()
    }
}

impl Drop for GrManager {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            tracing::error!("Failed to wait for device idle: {e}");
        }

        let queue = self.queue.get_mut();
        for slot in &mut queue.slots {
            slot.reset();
        }
        if let Err(e) = queue.pacer.wait_all() {
            tracing::error!("Failed to wait for in-flight frames: {e}");
        }

        self.ctx.collect_all_garbage();
        self.swapchain = None;
        tracing::info!("GPU manager destroyed");
    }
}

impl std::fmt::Debug for GrManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrManager")
            .field("frame", &self.frame())
            .field("headless", &self.is_headless())
            .finish_non_exhaustive()
    }
}

/// Count the semaphores a submission waits on, including the implicit wait on
/// the acquired image when it draws to the default framebuffer.
fn check_wait_semaphores(explicit: usize, renders_to_default: bool, max: usize) -> Result<usize> {
    let count = explicit + usize::from(renders_to_default);
    if count > max {
        return Err(GpuError::TooManyWaitSemaphores { count, max });
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_semaphores_up_to_the_limit_are_accepted() {
        assert_eq!(check_wait_semaphores(0, false, 0).unwrap(), 0);
        assert_eq!(check_wait_semaphores(4, false, 4).unwrap(), 4);
        assert_eq!(check_wait_semaphores(3, true, 4).unwrap(), 4);
    }

    #[test]
    fn acquire_wait_counts_against_the_limit() {
        let err = check_wait_semaphores(4, true, 4).unwrap_err();
        assert!(matches!(
            err,
            GpuError::TooManyWaitSemaphores { count: 5, max: 4 }
        ));
        assert!(!err.is_retryable());

        assert!(matches!(
            check_wait_semaphores(0, true, 0),
            Err(GpuError::TooManyWaitSemaphores { count: 1, max: 0 })
        ));
    }
}
