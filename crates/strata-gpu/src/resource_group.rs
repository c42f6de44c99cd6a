//! Resource groups: immutable binding tables used by draws and dispatches.
//!
//! A group is one descriptor set of the global layout plus the vertex and
//! index buffers of a draw. Uniform and storage buffers are dynamic
//! descriptors. Persistent buffers bind with a zero dynamic offset, transient
//! ones take their offset from the frame's [`TransientMemoryToken`]s at bind
//! time.

use std::sync::Arc;

use ash::vk;

use crate::buffer::{range_in_bounds, Buffer};
use crate::config::{DescriptorLimits, MAX_VERTEX_ATTRIBUTES};
use crate::context::GpuContext;
use crate::convert::IndexType;
use crate::deferred::Garbage;
use crate::descriptors::{GlobalDescriptors, SharedDescriptorPool};
use crate::error::{GpuError, Result};
use crate::texture::Texture;
use crate::transient::{TransientMemoryManager, TransientMemoryToken, TransientUsage};
use crate::usage::{BufferUsage, TextureUsage};

/// A uniform or storage buffer slot.
#[derive(Debug, Clone)]
pub enum BufferBinding {
    Persistent {
        buffer: Arc<Buffer>,
        offset: u64,
        range: u64,
    },
    /// Backed by frame-transient memory of this size.
    Transient { size: u64 },
}

impl BufferBinding {
    /// The whole of `buffer`.
    pub fn persistent(buffer: Arc<Buffer>) -> Self {
        let range = buffer.size();
        Self::Persistent {
            buffer,
            offset: 0,
            range,
        }
    }

    pub fn transient(size: u64) -> Self {
        Self::Transient { size }
    }

    fn transient_size(&self) -> Option<u64> {
        match self {
            Self::Transient { size } => Some(*size),
            Self::Persistent { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VertexBufferBinding {
    pub buffer: Arc<Buffer>,
    pub offset: u64,
}

#[derive(Debug, Clone)]
pub struct IndexBufferBinding {
    pub buffer: Arc<Buffer>,
    pub offset: u64,
    pub index_type: IndexType,
}

/// Parameters of [`ResourceGroup::new`]. Slot `i` of each list is binding `i`
/// of its kind.
#[derive(Debug, Clone, Default)]
pub struct ResourceGroupInitInfo {
    pub name: String,
    pub textures: Vec<Arc<Texture>>,
    pub uniform_buffers: Vec<BufferBinding>,
    pub storage_buffers: Vec<BufferBinding>,
    pub vertex_buffers: Vec<VertexBufferBinding>,
    pub index_buffer: Option<IndexBufferBinding>,
}

impl ResourceGroupInitInfo {
    fn validate(&self, limits: &DescriptorLimits) -> Result<()> {
        let check = |what: &str, count: usize, max: u32| {
            if count > max as usize {
                return Err(GpuError::DescriptorLimit(format!(
                    "Resource group '{}': {count} {what}, at most {max}",
                    self.name
                )));
            }
            Ok(())
        };
        check("textures", self.textures.len(), limits.max_textures)?;
        check("uniform buffers", self.uniform_buffers.len(), limits.max_uniform_buffers)?;
        check("storage buffers", self.storage_buffers.len(), limits.max_storage_buffers)?;
        check(
            "vertex buffers",
            self.vertex_buffers.len(),
            MAX_VERTEX_ATTRIBUTES as u32,
        )?;

        let invalid = |reason: String| {
            Err(GpuError::InvalidState(format!(
                "Resource group '{}': {reason}",
                self.name
            )))
        };

        for (i, texture) in self.textures.iter().enumerate() {
            if !texture.usage().intersects(TextureUsage::ANY_SHADER_SAMPLED) {
                return invalid(format!("texture {i} is not sampleable"));
            }
        }

        let buffers = [
            (&self.uniform_buffers, BufferUsage::UNIFORM_ANY_SHADER, "uniform"),
            (&self.storage_buffers, BufferUsage::STORAGE_ANY, "storage"),
        ];
        for (bindings, usage, what) in buffers {
            for (i, binding) in bindings.iter().enumerate() {
                match binding {
                    BufferBinding::Persistent {
                        buffer,
                        offset,
                        range,
                    } => {
                        if !buffer.usage().intersects(usage) {
                            return invalid(format!("{what} buffer {i} lacks {what} usage"));
                        }
                        if *range == 0 || !range_in_bounds(*offset, *range, buffer.size()) {
                            return invalid(format!("{what} buffer {i} range out of bounds"));
                        }
                    }
                    BufferBinding::Transient { size } => {
                        if *size == 0 {
                            return invalid(format!("transient {what} buffer {i} has no size"));
                        }
                    }
                }
            }
        }

        for (i, binding) in self.vertex_buffers.iter().enumerate() {
            if !binding.buffer.usage().contains(BufferUsage::VERTEX) {
                return invalid(format!("vertex buffer {i} lacks vertex usage"));
            }
        }
        if let Some(binding) = &self.index_buffer {
            if !binding.buffer.usage().contains(BufferUsage::INDEX) {
                return invalid("index buffer lacks index usage".to_string());
            }
        }
        Ok(())
    }
}

/// Transient memory backing a group's transient bindings for one bind.
/// Entry `i` belongs to uniform (or storage) binding `i`.
#[derive(Debug, Clone, Default)]
pub struct TransientBindings {
    pub uniform: Vec<Option<TransientMemoryToken>>,
    pub storage: Vec<Option<TransientMemoryToken>>,
}

impl TransientBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uniform(mut self, binding: usize, token: TransientMemoryToken) -> Self {
        set_token(&mut self.uniform, binding, token);
        self
    }

    pub fn with_storage(mut self, binding: usize, token: TransientMemoryToken) -> Self {
        set_token(&mut self.storage, binding, token);
        self
    }
}

fn set_token(tokens: &mut Vec<Option<TransientMemoryToken>>, binding: usize, token: TransientMemoryToken) {
    if tokens.len() <= binding {
        tokens.resize(binding + 1, None);
    }
    tokens[binding] = Some(token);
}

/// Declared size of every transient slot, `None` for persistent ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TransientLayout {
    uniform: Vec<Option<u64>>,
    storage: Vec<Option<u64>>,
}

impl TransientLayout {
    fn has_transient(&self) -> bool {
        self.uniform.iter().chain(&self.storage).any(Option::is_some)
    }

    /// One dynamic offset per dynamic binding of the global layout, uniform
    /// slots first.
    fn dynamic_offsets(
        &self,
        limits: &DescriptorLimits,
        tokens: Option<&TransientBindings>,
        frame: u64,
    ) -> Result<Vec<u32>> {
        let mut offsets = vec![0u32; limits.dynamic_offset_count()];
        let empty = TransientBindings::default();
        let tokens = tokens.unwrap_or(&empty);

        let kinds = [
            (&self.uniform, &tokens.uniform, TransientUsage::Uniform, 0usize),
            (
                &self.storage,
                &tokens.storage,
                TransientUsage::Storage,
                limits.max_uniform_buffers as usize,
            ),
        ];
        for (slots, tokens, usage, base) in kinds {
            for (i, slot) in slots.iter().enumerate() {
                let Some(size) = slot else { continue };
                let token = tokens.get(i).copied().flatten().ok_or_else(|| {
                    GpuError::InvalidState(format!("No transient memory for {usage:?} binding {i}"))
                })?;
                if token.usage != usage || token.range < *size {
                    return Err(GpuError::InvalidState(format!(
                        "{token:?} does not fit {usage:?} binding {i} of {size} bytes"
                    )));
                }
                if token.generation != frame {
                    return Err(GpuError::InvalidState(format!(
                        "{token:?} belongs to frame {}, current frame is {frame}",
                        token.generation
                    )));
                }
                offsets[base + i] = u32::try_from(token.offset).map_err(|_| {
                    GpuError::InvalidState(format!("Transient offset {} too large", token.offset))
                })?;
            }
        }
        Ok(offsets)
    }
}

/// An immutable binding table.
pub struct ResourceGroup {
    ctx: Arc<GpuContext>,
    pool: Arc<SharedDescriptorPool>,
    set: vk::DescriptorSet,
    limits: DescriptorLimits,
    transient: TransientLayout,
    textures: Vec<Arc<Texture>>,
    uniform_buffers: Vec<BufferBinding>,
    storage_buffers: Vec<BufferBinding>,
    vertex_buffers: Vec<VertexBufferBinding>,
    index_buffer: Option<IndexBufferBinding>,
}

impl ResourceGroup {
    pub fn new(
        ctx: Arc<GpuContext>,
        descriptors: &GlobalDescriptors,
        transient: &TransientMemoryManager,
        info: &ResourceGroupInitInfo,
    ) -> Result<Self> {
        let limits = *descriptors.limits();
        info.validate(&limits)?;

        let needs_set = !info.textures.is_empty()
            || !info.uniform_buffers.is_empty()
            || !info.storage_buffers.is_empty();
        let set = if needs_set {
            descriptors.allocate()?
        } else {
            vk::DescriptorSet::null()
        };

        let group = Self {
            ctx,
            pool: descriptors.pool().clone(),
            set,
            limits,
            transient: TransientLayout {
                uniform: info
                    .uniform_buffers
                    .iter()
                    .map(BufferBinding::transient_size)
                    .collect(),
                storage: info
                    .storage_buffers
                    .iter()
                    .map(BufferBinding::transient_size)
                    .collect(),
            },
            textures: info.textures.clone(),
            uniform_buffers: info.uniform_buffers.clone(),
            storage_buffers: info.storage_buffers.clone(),
            vertex_buffers: info.vertex_buffers.clone(),
            index_buffer: info.index_buffer.clone(),
        };

        if needs_set {
            group.write_descriptors(transient)?;
        }

        tracing::debug!(
            "Created resource group '{}': {} textures, {} uniform, {} storage, {} vertex buffers",
            info.name,
            info.textures.len(),
            info.uniform_buffers.len(),
            info.storage_buffers.len(),
            info.vertex_buffers.len()
        );

        Ok(group)
    }

    fn write_descriptors(&self, transient: &TransientMemoryManager) -> Result<()> {
        let image_infos: Vec<vk::DescriptorImageInfo> = self
            .textures
            .iter()
            .map(|texture| {
                vk::DescriptorImageInfo::default()
                    .sampler(texture.sampler())
                    .image_view(texture.view())
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            })
            .collect();

        let buffer_info = |binding: &BufferBinding, usage: TransientUsage| {
            let info = match binding {
                BufferBinding::Persistent {
                    buffer,
                    offset,
                    range,
                } => vk::DescriptorBufferInfo::default()
                    .buffer(buffer.handle())
                    .offset(*offset)
                    .range(*range),
                BufferBinding::Transient { size } => {
                    let buffer = transient.buffer(usage);
                    if buffer == vk::Buffer::null() {
                        return Err(GpuError::InvalidState(format!(
                            "No {usage:?} transient memory configured"
                        )));
                    }
                    vk::DescriptorBufferInfo::default()
                        .buffer(buffer)
                        .offset(0)
                        .range(*size)
                }
            };
            Ok(info)
        };
        let uniform_infos = self
            .uniform_buffers
            .iter()
            .map(|b| buffer_info(b, TransientUsage::Uniform))
            .collect::<Result<Vec<_>>>()?;
        let storage_infos = self
            .storage_buffers
            .iter()
            .map(|b| buffer_info(b, TransientUsage::Storage))
            .collect::<Result<Vec<_>>>()?;

        let textures = image_infos.iter().enumerate().map(|(i, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(self.set)
                .dst_binding(i as u32)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(info))
        });
        let uniforms = uniform_infos.iter().enumerate().map(|(i, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(self.set)
                .dst_binding(self.limits.first_uniform_binding() + i as u32)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(std::slice::from_ref(info))
        });
        let storages = storage_infos.iter().enumerate().map(|(i, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(self.set)
                .dst_binding(self.limits.first_storage_binding() + i as u32)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER_DYNAMIC)
                .buffer_info(std::slice::from_ref(info))
        });
        let writes: Vec<_> = textures.chain(uniforms).chain(storages).collect();

        unsafe { self.ctx.device().update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    /// Null when the group only carries vertex and index buffers.
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Whether any uniform or storage slot is transient-backed.
    pub fn has_transient_bindings(&self) -> bool {
        self.transient.has_transient()
    }

    /// Dynamic offsets for binding this group in `frame`.
    pub fn dynamic_offsets(&self, tokens: Option<&TransientBindings>, frame: u64) -> Result<Vec<u32>> {
        self.transient.dynamic_offsets(&self.limits, tokens, frame)
    }

    pub fn textures(&self) -> &[Arc<Texture>] {
        &self.textures
    }

    pub fn vertex_buffers(&self) -> &[VertexBufferBinding] {
        &self.vertex_buffers
    }

    pub fn index_buffer(&self) -> Option<&IndexBufferBinding> {
        self.index_buffer.as_ref()
    }
}

impl Drop for ResourceGroup {
    fn drop(&mut self) {
        if self.set != vk::DescriptorSet::null() {
            self.ctx.defer_destroy(Garbage::DescriptorSet {
                pool: self.pool.clone(),
                set: self.set,
            });
        }
    }
}

impl std::fmt::Debug for ResourceGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGroup")
            .field("set", &self.set)
            .field("textures", &self.textures.len())
            .field("uniform_buffers", &self.uniform_buffers.len())
            .field("storage_buffers", &self.storage_buffers.len())
            .field("vertex_buffers", &self.vertex_buffers.len())
            .finish_non_exhaustive()
    }
}
