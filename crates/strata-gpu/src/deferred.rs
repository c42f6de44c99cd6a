//! Deferred destruction of GPU objects.
//!
//! A GPU object cannot be destroyed while a frame that may reference it is still
//! executing. Dropped objects are queued here tagged with the frame generation
//! current at drop time and destroyed once that generation's fence has been
//! observed signaled.

use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk;

use crate::context::GpuContext;
use crate::descriptors::SharedDescriptorPool;
use crate::memory::GpuMemoryAllocation;

/// An item pending deletion.
struct PendingDeletion<T> {
    item: T,
    /// Frame generation when this item was queued for deletion.
    generation: u64,
}

/// FIFO of items tagged with the generation that last may have used them.
pub struct DeferredDeletionQueue<T> {
    pending: VecDeque<PendingDeletion<T>>,
}

impl<T> Default for DeferredDeletionQueue<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }
}

impl<T> DeferredDeletionQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item` for deletion after `generation` completes.
    pub fn queue(&mut self, item: T, generation: u64) {
        debug_assert!(
            self.pending
                .back()
                .map_or(true, |last| last.generation <= generation),
            "generations must be queued in non-decreasing order"
        );
        self.pending.push_back(PendingDeletion { item, generation });
    }

    /// Remove every item whose generation is at most `completed`.
    pub fn retire(&mut self, completed: u64) -> Vec<T> {
        let mut retired = Vec::new();
        // Generations are non-decreasing, so only the front can mature.
        while let Some(pending) = self.pending.front() {
            if pending.generation > completed {
                break;
            }
            if let Some(pending) = self.pending.pop_front() {
                retired.push(pending.item);
            }
        }
        retired
    }

    /// Remove everything. Only valid once the device is idle.
    pub fn drain(&mut self) -> Vec<T> {
        self.pending.drain(..).map(|p| p.item).collect()
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// A GPU object whose destruction has been deferred.
pub enum Garbage {
    Buffer {
        buffer: vk::Buffer,
        memory: Option<GpuMemoryAllocation>,
    },
    Image {
        image: vk::Image,
        view: vk::ImageView,
        sampler: vk::Sampler,
        memory: Option<GpuMemoryAllocation>,
    },
    Pipeline(vk::Pipeline),
    Framebuffer {
        framebuffers: Vec<vk::Framebuffer>,
        views: Vec<vk::ImageView>,
        render_pass: vk::RenderPass,
    },
    QueryPool(vk::QueryPool),
    DescriptorSet {
        pool: Arc<SharedDescriptorPool>,
        set: vk::DescriptorSet,
    },
    Semaphore(vk::Semaphore),
}

impl Garbage {
    /// Destroy the object. The generation it was tagged with must have completed.
    pub(crate) fn destroy(self, ctx: &GpuContext) {
        let device = ctx.device();
        unsafe {
            match self {
                Self::Buffer { buffer, memory } => {
                    device.destroy_buffer(buffer, None);
                    free_memory(ctx, memory);
                }
                Self::Image {
                    image,
                    view,
                    sampler,
                    memory,
                } => {
                    if sampler != vk::Sampler::null() {
                        device.destroy_sampler(sampler, None);
                    }
                    if view != vk::ImageView::null() {
                        device.destroy_image_view(view, None);
                    }
                    device.destroy_image(image, None);
                    free_memory(ctx, memory);
                }
                Self::Pipeline(pipeline) => device.destroy_pipeline(pipeline, None),
                Self::Framebuffer {
                    framebuffers,
                    views,
                    render_pass,
                } => {
                    for framebuffer in framebuffers {
                        device.destroy_framebuffer(framebuffer, None);
                    }
                    for view in views {
                        device.destroy_image_view(view, None);
                    }
                    device.destroy_render_pass(render_pass, None);
                }
                Self::QueryPool(pool) => device.destroy_query_pool(pool, None),
                Self::DescriptorSet { pool, set } => pool.free(set),
                Self::Semaphore(semaphore) => device.destroy_semaphore(semaphore, None),
            }
        }
    }
}

fn free_memory(ctx: &GpuContext, memory: Option<GpuMemoryAllocation>) {
    if let Some(memory) = memory {
        if let Err(e) = ctx.memory().free(memory) {
            tracing::error!("Failed to free GPU memory: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retires_only_completed_generations() {
        let mut queue = DeferredDeletionQueue::new();
        queue.queue(10u32, 0);
        queue.queue(11, 1);
        queue.queue(12, 1);
        queue.queue(13, 4);

        assert_eq!(queue.retire(0), vec![10]);
        assert_eq!(queue.pending_count(), 3);
        assert_eq!(queue.retire(3), vec![11, 12]);
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.retire(3).is_empty());
        assert_eq!(queue.retire(4), vec![13]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_returns_everything_in_order() {
        let mut queue = DeferredDeletionQueue::new();
        for generation in 0..5u64 {
            queue.queue(generation, generation);
        }
        assert_eq!(queue.drain(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }
}
