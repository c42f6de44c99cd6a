//! Synchronization primitives and their recycling pools.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::context::GpuContext;
use crate::deferred::Garbage;
use crate::error::Result;
use crate::frame::FrameFence;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = unsafe { device.create_fence(&create_info, None)? };
    Ok(fence)
}

/// Wait for a fence to be signaled. Returns `false` on timeout.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<bool> {
    match unsafe { device.wait_for_fences(&[fence], true, timeout_ns) } {
        Ok(()) => Ok(true),
        Err(vk::Result::TIMEOUT) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.reset_fences(&[fence])? };
    Ok(())
}

/// Recycles fences once the GPU has signaled them.
pub struct FencePool {
    ctx: Arc<GpuContext>,
    free: Mutex<Vec<vk::Fence>>,
    /// Released while possibly still in flight. Polled on every request.
    pending: Mutex<Vec<vk::Fence>>,
}

impl FencePool {
    pub fn new(ctx: Arc<GpuContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            free: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// Get an unsignaled fence.
    pub fn new_fence(self: &Arc<Self>) -> Result<Arc<Fence>> {
        self.reclaim_pending();

        let handle = match self.free.lock().pop() {
            Some(handle) => handle,
            None => unsafe { create_fence(self.ctx.device(), false)? },
        };

        Ok(Arc::new(Fence {
            handle,
            pool: self.clone(),
        }))
    }

    fn reclaim_pending(&self) {
        let device = self.ctx.device();
        let mut pending = self.pending.lock();
        let mut reclaimed = Vec::new();
        pending.retain(|&fence| {
            let signaled = unsafe { device.get_fence_status(fence) }.unwrap_or(false);
            if signaled {
                reclaimed.push(fence);
            }
            !signaled
        });
        drop(pending);

        for fence in reclaimed {
            self.recycle(fence);
        }
    }

    fn recycle(&self, fence: vk::Fence) {
        match unsafe { reset_fence(self.ctx.device(), fence) } {
            Ok(()) => self.free.lock().push(fence),
            Err(e) => {
                tracing::error!("Failed to reset fence: {e}");
                unsafe { self.ctx.device().destroy_fence(fence, None) };
            }
        }
    }

    /// Fences available without creating new ones.
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl Drop for FencePool {
    fn drop(&mut self) {
        let device = self.ctx.device();
        for fence in self.free.get_mut().drain(..).chain(self.pending.get_mut().drain(..)) {
            unsafe { device.destroy_fence(fence, None) };
        }
    }
}

/// A pooled fence. Returned to its pool when the last reference drops.
pub struct Fence {
    handle: vk::Fence,
    pool: Arc<FencePool>,
}

impl Fence {
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Wait up to `timeout_ns`. Returns `false` on timeout.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_timeout(&self, timeout_ns: u64) -> Result<bool> {
        unsafe { wait_for_fence(self.pool.ctx.device(), self.handle, timeout_ns) }
    }

    pub fn is_done(&self) -> Result<bool> {
        Ok(unsafe { self.pool.ctx.device().get_fence_status(self.handle)? })
    }
}

impl FrameFence for Fence {
    fn wait(&self) -> Result<()> {
        self.wait_timeout(u64::MAX).map(|_| ())
    }

    fn is_signaled(&self) -> bool {
        self.is_done().unwrap_or(false)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if self.is_signaled() {
            self.pool.recycle(self.handle);
        } else {
            self.pool.pending.lock().push(self.handle);
        }
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Fence").field(&self.handle).finish()
    }
}

#[derive(Default)]
struct SemaphoreState {
    /// Fence of the last submission that signaled or waited on the semaphore.
    fence: Option<Arc<Fence>>,
    signaled: bool,
    waited: bool,
}

/// Recycles binary semaphores whose signal has been consumed.
pub struct SemaphorePool {
    ctx: Arc<GpuContext>,
    free: Mutex<Vec<vk::Semaphore>>,
}

impl SemaphorePool {
    pub fn new(ctx: Arc<GpuContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn new_semaphore(self: &Arc<Self>) -> Result<Arc<Semaphore>> {
        let handle = match self.free.lock().pop() {
            Some(handle) => handle,
            None => unsafe { create_semaphore(self.ctx.device())? },
        };

        Ok(Arc::new(Semaphore {
            handle,
            pool: self.clone(),
            state: Mutex::new(SemaphoreState::default()),
        }))
    }
}

impl Drop for SemaphorePool {
    fn drop(&mut self) {
        let device = self.ctx.device();
        for semaphore in self.free.get_mut().drain(..) {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
    }
}

/// A pooled binary semaphore.
pub struct Semaphore {
    handle: vk::Semaphore,
    pool: Arc<SemaphorePool>,
    state: Mutex<SemaphoreState>,
}

impl Semaphore {
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }

    /// Record a pending signal, by a submission or by image acquisition.
    pub(crate) fn mark_signaled(&self, fence: Option<Arc<Fence>>) {
        let mut state = self.state.lock();
        state.signaled = true;
        state.waited = false;
        if fence.is_some() {
            state.fence = fence;
        }
    }

    /// Record that the submission fenced by `fence` consumes the signal.
    pub(crate) fn mark_waited(&self, fence: Arc<Fence>) {
        let mut state = self.state.lock();
        debug_assert!(state.signaled, "waiting on a semaphore nobody signals");
        state.waited = true;
        state.fence = Some(fence);
    }

    /// The fence of the submission that last used the semaphore.
    pub fn fence(&self) -> Option<Arc<Fence>> {
        self.state.lock().fence.clone()
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let unused = !state.signaled;
        let consumed =
            state.waited && state.fence.as_ref().is_some_and(|fence| fence.is_signaled());

        if unused || consumed {
            self.pool.free.lock().push(self.handle);
        } else {
            self.pool
                .ctx
                .defer_destroy(Garbage::Semaphore(self.handle));
        }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Semaphore").field(&self.handle).finish()
    }
}
