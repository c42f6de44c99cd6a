//! GPU buffers and host mapping.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;

use crate::context::GpuContext;
use crate::deferred::Garbage;
use crate::error::{GpuError, Result};
use crate::memory::GpuMemoryAllocation;
use crate::usage::{BufferMapAccess, BufferUsage};

/// Parameters of [`Buffer::new`].
#[derive(Debug, Clone)]
pub struct BufferInitInfo {
    pub name: String,
    pub size: u64,
    pub usage: BufferUsage,
    /// CPU access. Empty for GPU-only buffers.
    pub access: BufferMapAccess,
}

impl BufferInitInfo {
    pub fn new(size: u64, usage: BufferUsage, access: BufferMapAccess) -> Self {
        Self {
            name: String::new(),
            size,
            usage,
            access,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Memory property preferences for a map access, most preferred first.
///
/// Each entry is `(prefer, avoid)` for [`crate::memory::select_memory_type`].
pub fn memory_preferences(
    access: BufferMapAccess,
) -> [(vk::MemoryPropertyFlags, vk::MemoryPropertyFlags); 2] {
    type F = vk::MemoryPropertyFlags;
    if access.is_empty() {
        [
            (F::DEVICE_LOCAL, F::HOST_VISIBLE),
            (F::DEVICE_LOCAL, F::empty()),
        ]
    } else if access.contains(BufferMapAccess::READ) {
        [
            (F::HOST_VISIBLE | F::HOST_CACHED | F::HOST_COHERENT, F::empty()),
            (F::HOST_VISIBLE | F::HOST_COHERENT, F::empty()),
        ]
    } else {
        [
            (F::HOST_VISIBLE | F::HOST_COHERENT, F::DEVICE_LOCAL),
            (F::HOST_VISIBLE, F::empty()),
        ]
    }
}

/// A GPU buffer. Destruction is deferred until the current frame completes.
pub struct Buffer {
    ctx: Arc<GpuContext>,
    handle: vk::Buffer,
    memory: Option<GpuMemoryAllocation>,
    size: u64,
    usage: BufferUsage,
    access: BufferMapAccess,
    coherent: bool,
    mapped: AtomicBool,
}

impl Buffer {
    pub fn new(ctx: Arc<GpuContext>, info: &BufferInitInfo) -> Result<Self> {
        if info.size == 0 || info.usage.is_empty() {
            return Err(GpuError::InvalidState(format!(
                "Buffer '{}' needs a size and a usage",
                info.name
            )));
        }

        let device = ctx.device();
        let create_info = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(info.usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.create_buffer(&create_info, None)? };

        let memory = match allocate_buffer_memory(&ctx, handle, info) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(handle, None) };
                return Err(e);
            }
        };

        let coherent = ctx
            .memory()
            .memory_type_flags(memory.memory_type_index())
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);

        tracing::debug!(
            "Created buffer '{}': {} bytes, {:?}, access {:?}",
            info.name,
            info.size,
            info.usage,
            info.access
        );

        Ok(Self {
            ctx,
            handle,
            memory: Some(memory),
            size: info.size,
            usage: info.usage,
            access: info.access,
            coherent,
            mapped: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn map_access(&self) -> BufferMapAccess {
        self.access
    }

    /// Map `range` bytes starting at `offset`.
    ///
    /// The caller must not access a region the GPU is still using. Mapping a
    /// buffer that is already mapped is a programming error.
    pub fn map(&self, offset: u64, range: u64, access: BufferMapAccess) -> Result<BufferMapping<'_>> {
        debug_assert!(
            !access.is_empty() && self.access.contains(access),
            "map access {access:?} not declared at creation ({:?})",
            self.access
        );
        if !range_in_bounds(offset, range, self.size) {
            return Err(GpuError::InvalidState(format!(
                "Mapped range {offset}+{range} exceeds buffer size {}",
                self.size
            )));
        }
        let was_mapped = self.mapped.swap(true, Ordering::AcqRel);
        debug_assert!(!was_mapped, "buffer is already mapped");

        let base = match self.memory.as_ref().and_then(GpuMemoryAllocation::mapped_ptr) {
            Some(base) => base,
            None => {
                self.mapped.store(false, Ordering::Release);
                return Err(GpuError::InvalidState(
                    "Buffer memory is not host visible".to_string(),
                ));
            }
        };

        if access.contains(BufferMapAccess::READ) && !self.coherent {
            if let Err(e) = self.invalidate() {
                self.mapped.store(false, Ordering::Release);
                return Err(e);
            }
        }

        // SAFETY: the range lies inside the allocation, which is persistently mapped.
        let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) };

        Ok(BufferMapping {
            buffer: self,
            ptr,
            len: range as usize,
            access,
        })
    }

    fn memory_range(&self) -> Option<vk::MappedMemoryRange<'static>> {
        let memory = self.memory.as_ref()?;
        let atom = self.ctx.capabilities().non_coherent_atom_size.max(1);
        Some(
            vk::MappedMemoryRange::default()
                .memory(memory.memory())
                .offset(memory.offset() / atom * atom)
                .size(vk::WHOLE_SIZE),
        )
    }

    fn invalidate(&self) -> Result<()> {
        if let Some(range) = self.memory_range() {
            unsafe { self.ctx.device().invalidate_mapped_memory_ranges(&[range])? };
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if let Some(range) = self.memory_range() {
            unsafe { self.ctx.device().flush_mapped_memory_ranges(&[range])? };
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.ctx.defer_destroy(Garbage::Buffer {
            buffer: self.handle,
            memory: self.memory.take(),
        });
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}

fn allocate_buffer_memory(
    ctx: &GpuContext,
    buffer: vk::Buffer,
    info: &BufferInitInfo,
) -> Result<GpuMemoryAllocation> {
    let requirements = unsafe { ctx.device().get_buffer_memory_requirements(buffer) };

    let [(prefer, avoid), (fallback, _)] = memory_preferences(info.access);
    let memory_type = ctx
        .memory()
        .find_memory_type(requirements.memory_type_bits, prefer, avoid)
        .or_else(|_| {
            ctx.memory().find_memory_type(
                requirements.memory_type_bits,
                fallback,
                vk::MemoryPropertyFlags::empty(),
            )
        })?;

    let memory = ctx
        .memory()
        .allocate(&info.name, requirements, memory_type, true)?;

    let bound = unsafe {
        ctx.device()
            .bind_buffer_memory(buffer, memory.memory(), memory.offset())
    };
    if let Err(e) = bound {
        ctx.memory().free(memory)?;
        return Err(e.into());
    }

    if !info.access.is_empty() && memory.mapped_ptr().is_none() {
        ctx.memory().free(memory)?;
        return Err(GpuError::InvalidState(format!(
            "Mappable buffer '{}' got memory without a host mapping",
            info.name
        )));
    }

    Ok(memory)
}

/// A mapped range of a [`Buffer`]. Unmaps on drop.
pub struct BufferMapping<'a> {
    buffer: &'a Buffer,
    ptr: NonNull<u8>,
    len: usize,
    access: BufferMapAccess,
}

impl BufferMapping<'_> {
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr..ptr + len` is mapped for the lifetime of the mapping.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert!(
            self.access.contains(BufferMapAccess::WRITE),
            "mapping was not created for writing"
        );
        // SAFETY: as above, and the buffer cannot be mapped twice.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy plain data to the start of the mapping.
    pub fn write<T: bytemuck::Pod>(&mut self, data: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Unmap explicitly, reporting flush failures.
    pub fn unmap(self) -> Result<()> {
        let result = self.finish();
        std::mem::forget(self);
        result
    }

    fn finish(&self) -> Result<()> {
        let result = if self.access.contains(BufferMapAccess::WRITE) && !self.buffer.coherent {
            self.buffer.flush()
        } else {
            Ok(())
        };
        let was_mapped = self.buffer.mapped.swap(false, Ordering::AcqRel);
        debug_assert!(was_mapped, "buffer was not mapped");
        result
    }
}

impl Drop for BufferMapping<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::error!("Failed to flush mapped buffer: {e}");
        }
    }
}

/// Whether `offset..offset + range` lies inside a buffer of `size` bytes.
pub(crate) fn range_in_bounds(offset: u64, range: u64, size: u64) -> bool {
    offset.checked_add(range).is_some_and(|end| end <= size)
}
