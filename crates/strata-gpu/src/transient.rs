//! Per-frame transient memory.
//!
//! Each usage category owns one host-visible buffer split into
//! `MAX_FRAMES_IN_FLIGHT` regions. Allocations bump a cursor inside the region of
//! the current frame. A region is rewound only after the fence of the frame that
//! last wrote it has signaled.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::RwLockReadGuard;

use crate::capabilities::GpuCapabilities;
use crate::config::{TransientMemoryConfig, MAX_FRAMES_IN_FLIGHT};
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::GpuMemoryAllocation;

/// What a transient allocation is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientUsage {
    Uniform,
    Storage,
    Transfer,
}

impl TransientUsage {
    pub const ALL: [Self; 3] = [Self::Uniform, Self::Storage, Self::Transfer];

    fn index(self) -> usize {
        match self {
            Self::Uniform => 0,
            Self::Storage => 1,
            Self::Transfer => 2,
        }
    }

    fn buffer_usage(self) -> vk::BufferUsageFlags {
        match self {
            Self::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            Self::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            Self::Transfer => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }
}

/// A slice of transient memory valid for the frame it was allocated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransientMemoryToken {
    pub usage: TransientUsage,
    /// Offset from the start of the usage's buffer.
    pub offset: u64,
    pub range: u64,
    /// Frame number the token belongs to.
    pub generation: u64,
}

/// Mapped transient memory of the current frame.
///
/// Holds the frame open: the region it points into cannot be rewound until the
/// allocation is dropped.
pub struct TransientAllocation<'a> {
    token: TransientMemoryToken,
    data: &'a mut [u8],
    _frame: RwLockReadGuard<'a, ()>,
}

impl<'a> TransientAllocation<'a> {
    pub(crate) fn new(
        token: TransientMemoryToken,
        data: &'a mut [u8],
        frame: RwLockReadGuard<'a, ()>,
    ) -> Self {
        Self {
            token,
            data,
            _frame: frame,
        }
    }

    pub fn token(&self) -> TransientMemoryToken {
        self.token
    }
}

impl Deref for TransientAllocation<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &*self.data
    }
}

impl DerefMut for TransientAllocation<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut *self.data
    }
}

impl std::fmt::Debug for TransientAllocation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientAllocation")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Bump allocator over `MAX_FRAMES_IN_FLIGHT` equally sized regions.
///
/// Holds no GPU memory, only offsets.
#[derive(Debug)]
pub struct TransientRing {
    per_frame: u64,
    alignment: u64,
    cursors: [AtomicU64; MAX_FRAMES_IN_FLIGHT],
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

impl TransientRing {
    /// `alignment` must be a power of two.
    pub fn new(per_frame: u64, alignment: u64) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            per_frame: align_up(per_frame, alignment),
            alignment,
            cursors: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.per_frame * MAX_FRAMES_IN_FLIGHT as u64
    }

    pub fn per_frame(&self) -> u64 {
        self.per_frame
    }

    /// Reserve `size` bytes in `slot`. Returns the absolute offset, or the bytes
    /// still available when the region is full.
    pub fn allocate(&self, slot: usize, size: u64) -> std::result::Result<u64, u64> {
        let cursor = &self.cursors[slot];
        let mut current = cursor.load(Ordering::Relaxed);
        loop {
            let start = align_up(current, self.alignment);
            let end = start.saturating_add(size);
            if size == 0 || end > self.per_frame {
                return Err(self.per_frame.saturating_sub(start));
            }
            match cursor.compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Ok(slot as u64 * self.per_frame + start),
                Err(actual) => current = actual,
            }
        }
    }

    /// Error for a failed [`Self::allocate`]. Only a request that fits an
    /// empty region can succeed after a frame retires.
    pub fn allocation_error(&self, usage: TransientUsage, requested: u64, available: u64) -> GpuError {
        if requested == 0 {
            GpuError::InvalidState(format!("Zero sized {usage:?} transient allocation"))
        } else if requested > self.per_frame {
            GpuError::InvalidState(format!(
                "{usage:?} transient allocation of {requested} bytes exceeds the per frame budget of {} bytes",
                self.per_frame
            ))
        } else {
            GpuError::OutOfTransientMemory {
                usage,
                requested,
                available,
            }
        }
    }

    /// Rewind `slot`. The frame that last used it must have completed.
    pub fn reset(&self, slot: usize) {
        self.cursors[slot].store(0, Ordering::Release);
    }

    pub fn used(&self, slot: usize) -> u64 {
        self.cursors[slot].load(Ordering::Acquire)
    }
}

struct TransientBuffer {
    buffer: vk::Buffer,
    memory: Option<GpuMemoryAllocation>,
    mapped: NonNull<u8>,
}

/// One ring and its backing buffer per [`TransientUsage`].
pub struct TransientMemoryManager {
    ctx: Arc<GpuContext>,
    rings: [TransientRing; 3],
    buffers: [Option<TransientBuffer>; 3],
}

// SAFETY: the mapped pointer is only dereferenced for disjoint ranges handed out
// by the atomic ring.
unsafe impl Send for TransientMemoryManager {}
unsafe impl Sync for TransientMemoryManager {}

impl TransientMemoryManager {
    pub fn new(ctx: Arc<GpuContext>, config: &TransientMemoryConfig) -> Result<Self> {
        let rings = transient_rings(config, ctx.capabilities());

        let mut buffers: [Option<TransientBuffer>; 3] = [None, None, None];
        for usage in TransientUsage::ALL {
            let ring = &rings[usage.index()];
            if ring.capacity() == 0 {
                continue;
            }
            buffers[usage.index()] = Some(create_transient_buffer(&ctx, usage, ring.capacity())?);
        }

        tracing::info!(
            "Transient memory: uniform {} KB, storage {} KB, transfer {} KB per frame",
            rings[0].per_frame() / 1024,
            rings[1].per_frame() / 1024,
            rings[2].per_frame() / 1024,
        );

        Ok(Self {
            ctx,
            rings,
            buffers,
        })
    }

    /// Allocate `size` bytes for `frame`. Exhaustion is a retryable error.
    ///
    /// # Safety
    ///
    /// The slot of `frame` must not be reset while the returned slice lives.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn allocate(
        &self,
        size: u64,
        usage: TransientUsage,
        frame: u64,
    ) -> Result<(TransientMemoryToken, &mut [u8])> {
        let ring = &self.rings[usage.index()];
        let slot = (frame % MAX_FRAMES_IN_FLIGHT as u64) as usize;
        let offset = ring
            .allocate(slot, size)
            .map_err(|available| ring.allocation_error(usage, size, available))?;

        let buffer = self.buffers[usage.index()]
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState(format!("No {usage:?} transient buffer")))?;

        // SAFETY: `offset..offset + size` lies inside the mapped buffer and no other
        // caller can receive an overlapping range until the slot is reset.
        let data =
            std::slice::from_raw_parts_mut(buffer.mapped.as_ptr().add(offset as usize), size as usize);

        Ok((
            TransientMemoryToken {
                usage,
                offset,
                range: size,
                generation: frame,
            },
            data,
        ))
    }

    /// Rewind the region of `slot`. Its frame's fence must have signaled.
    pub(crate) fn reset_slot(&self, slot: usize) {
        for ring in &self.rings {
            ring.reset(slot);
        }
    }

    /// Buffer backing a usage category.
    pub fn buffer(&self, usage: TransientUsage) -> vk::Buffer {
        self.buffers[usage.index()]
            .as_ref()
            .map_or(vk::Buffer::null(), |b| b.buffer)
    }

    /// Bytes allocated so far in `slot` for `usage`.
    pub fn used(&self, usage: TransientUsage, slot: usize) -> u64 {
        self.rings[usage.index()].used(slot)
    }
}

impl Drop for TransientMemoryManager {
    fn drop(&mut self) {
        for buffer in self.buffers.iter_mut().flatten() {
            unsafe {
                self.ctx.device().destroy_buffer(buffer.buffer, None);
            }
            if let Some(memory) = buffer.memory.take() {
                if let Err(e) = self.ctx.memory().free(memory) {
                    tracing::error!("Failed to free transient memory: {e}");
                }
            }
        }
    }
}

fn transient_rings(config: &TransientMemoryConfig, caps: &GpuCapabilities) -> [TransientRing; 3] {
    [
        TransientRing::new(
            config.uniform_per_frame,
            caps.min_uniform_buffer_offset_alignment.max(1),
        ),
        TransientRing::new(
            config.storage_per_frame,
            caps.min_storage_buffer_offset_alignment.max(1),
        ),
        // Buffer-to-image copies need 4-byte and texel-size alignment.
        TransientRing::new(
            config.transfer_per_frame,
            caps.optimal_buffer_copy_offset_alignment.max(16),
        ),
    ]
}

fn create_transient_buffer(
    ctx: &GpuContext,
    usage: TransientUsage,
    size: u64,
) -> Result<TransientBuffer> {
    let device = ctx.device();
    let info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage.buffer_usage())
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.create_buffer(&info, None)? };
    let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

    let memory_type = ctx.memory().find_memory_type(
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        vk::MemoryPropertyFlags::HOST_CACHED,
    );
    let memory = memory_type.and_then(|memory_type| {
        ctx.memory()
            .allocate(&format!("transient {usage:?}"), requirements, memory_type, true)
    });
    let memory = match memory {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    unsafe {
        device.bind_buffer_memory(buffer, memory.memory(), memory.offset())?;
    }

    let mapped = memory
        .mapped_ptr()
        .ok_or_else(|| GpuError::InvalidState("Transient memory is not host visible".into()))?;

    Ok(TransientBuffer {
        buffer,
        memory: Some(memory),
        mapped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_never_overlap() {
        let ring = TransientRing::new(1000, 64);
        let mut ranges = Vec::new();
        while let Ok(offset) = ring.allocate(1, 100) {
            assert_eq!(offset % 64, 0);
            ranges.push(offset..offset + 100);
        }
        assert!(!ranges.is_empty());
        for (i, a) in ranges.iter().enumerate() {
            for b in &ranges[i + 1..] {
                assert!(a.end <= b.start || b.end <= a.start, "{a:?} overlaps {b:?}");
            }
            // Stays inside slot 1.
            assert!(a.start >= ring.per_frame() && a.end <= 2 * ring.per_frame());
        }
    }

    #[test]
    fn exhaustion_reports_remaining_budget() {
        let ring = TransientRing::new(256, 16);
        assert_eq!(ring.allocate(0, 200), Ok(0));
        assert_eq!(ring.allocate(0, 100), Err(48));
        // Other slots are untouched.
        assert_eq!(ring.allocate(2, 256), Ok(512));
        ring.reset(0);
        assert_eq!(ring.allocate(0, 256), Ok(0));
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let ring = Arc::new(TransientRing::new(64 * 1024, 256));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    let mut offsets = Vec::new();
                    while let Ok(offset) = ring.allocate(0, 300) {
                        offsets.push(offset);
                    }
                    offsets
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        for pair in all.windows(2) {
            assert!(pair[1] - pair[0] >= 300);
        }
        // 512 byte stride fits 128 allocations in 64 KB.
        assert_eq!(all.len(), 128);
    }

    #[test]
    fn zero_sized_requests_are_rejected() {
        let ring = TransientRing::new(256, 16);
        let available = ring.allocate(0, 0).unwrap_err();
        let err = ring.allocation_error(TransientUsage::Uniform, 0, available);
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn requests_larger_than_a_frame_are_not_retryable() {
        let ring = TransientRing::new(256, 16);
        let available = ring.allocate(0, 257).unwrap_err();
        assert_eq!(available, 256);
        let err = ring.allocation_error(TransientUsage::Storage, 257, available);
        assert!(matches!(err, GpuError::InvalidState(_)));
        assert!(!err.is_retryable());

        let empty = TransientRing::new(0, 16);
        assert_eq!(empty.allocate(0, 1), Err(0));
        assert!(!empty.allocation_error(TransientUsage::Transfer, 1, 0).is_retryable());
    }

    #[test]
    fn exhaustion_error_is_retryable() {
        let ring = TransientRing::new(64, 16);
        assert_eq!(ring.allocate(0, 48), Ok(0));
        let available = ring.allocate(0, 64).unwrap_err();
        let err = ring.allocation_error(TransientUsage::Transfer, 64, available);
        assert!(matches!(
            err,
            GpuError::OutOfTransientMemory {
                requested: 64,
                available: 16,
                ..
            }
        ));
        assert!(err.is_retryable());

        ring.reset(0);
        assert_eq!(ring.allocate(0, 64), Ok(0));
    }
}
