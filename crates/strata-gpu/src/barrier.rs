//! Translation of usage transitions into pipeline barriers.
//!
//! Every usage bit contributes its own stage and access bits, which are OR-ed
//! together. Layouts are a separate function of a single usage because an image
//! subresource can only be in one layout at a time.
//!
//! Mip generation is level aware. While mips are generated, level `k` is blitted
//! into level `k + 1`, so a level that is about to be generated is a transfer
//! destination and every finished level except the last one is a transfer
//! source. The last level stays a transfer destination.

use ash::vk;

use crate::error::{GpuError, Result};
use crate::usage::{BufferUsage, TextureUsage};

/// Stage and access masks of both sides of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierInfo {
    pub src_stages: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stages: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

/// A complete image barrier for one subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrierInfo {
    pub stages: BarrierInfo,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
}

fn check_level(level: u32, level_count: u32) -> Result<()> {
    if level_count == 0 || level >= level_count {
        return Err(GpuError::InvalidUsageTransition(format!(
            "mip level {level} out of range for {level_count} levels"
        )));
    }
    Ok(())
}

/// After mip generation, only the last level was written without being handed
/// off as a source. A single-level texture is never written.
fn is_last_blit_target(level: u32, level_count: u32) -> bool {
    level > 0 && level + 1 == level_count
}

/// Stage and access of a texture that was last used as `usage`.
fn texture_src(
    usage: TextureUsage,
    is_depth_stencil: bool,
    last_blit_target: bool,
) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let mut stages = vk::PipelineStageFlags::empty();
    let mut access = vk::AccessFlags::empty();

    if usage.contains(TextureUsage::FRAGMENT_SHADER_SAMPLED) {
        stages |= vk::PipelineStageFlags::FRAGMENT_SHADER;
        access |= vk::AccessFlags::SHADER_READ;
    }

    if usage.contains(TextureUsage::COMPUTE_SHADER_SAMPLED) {
        stages |= vk::PipelineStageFlags::COMPUTE_SHADER;
        access |= vk::AccessFlags::SHADER_READ;
    }

    if usage.contains(TextureUsage::FRAMEBUFFER_ATTACHMENT_READ) {
        if is_depth_stencil {
            stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
        } else {
            stages |= vk::PipelineStageFlags::ALL_GRAPHICS;
            access |= vk::AccessFlags::COLOR_ATTACHMENT_READ;
        }
    }

    if usage.contains(TextureUsage::FRAMEBUFFER_ATTACHMENT_WRITE) {
        stages |= vk::PipelineStageFlags::ALL_GRAPHICS;
        access |= if is_depth_stencil {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        } else {
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        };
    }

    if usage.contains(TextureUsage::GENERATE_MIPMAPS) {
        stages |= vk::PipelineStageFlags::TRANSFER;
        access |= if last_blit_target {
            vk::AccessFlags::TRANSFER_WRITE
        } else {
            vk::AccessFlags::TRANSFER_READ
        };
    }

    if usage.contains(TextureUsage::UPLOAD) {
        stages |= vk::PipelineStageFlags::TRANSFER;
        access |= vk::AccessFlags::TRANSFER_WRITE;
    }

    if stages.is_empty() {
        stages = vk::PipelineStageFlags::TOP_OF_PIPE;
    }

    (stages, access)
}

/// Stage and access of a texture that is about to be used as `usage`.
fn texture_dst(
    usage: TextureUsage,
    is_depth_stencil: bool,
    level: u32,
) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    let mut stages = vk::PipelineStageFlags::empty();
    let mut access = vk::AccessFlags::empty();

    if usage.contains(TextureUsage::FRAGMENT_SHADER_SAMPLED) {
        stages |= vk::PipelineStageFlags::FRAGMENT_SHADER;
        access |= vk::AccessFlags::SHADER_READ;
    }

    if usage.contains(TextureUsage::COMPUTE_SHADER_SAMPLED) {
        stages |= vk::PipelineStageFlags::COMPUTE_SHADER;
        access |= vk::AccessFlags::SHADER_READ;
    }

    if usage.contains(TextureUsage::FRAMEBUFFER_ATTACHMENT_READ) {
        if is_depth_stencil {
            stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
        } else {
            stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
            access |= vk::AccessFlags::COLOR_ATTACHMENT_READ;
        }
    }

    if usage.contains(TextureUsage::FRAMEBUFFER_ATTACHMENT_WRITE) {
        if is_depth_stencil {
            stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        } else {
            stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
            access |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        }
    }

    if usage.contains(TextureUsage::GENERATE_MIPMAPS) {
        stages |= vk::PipelineStageFlags::TRANSFER;
        // Level 0 is the blit source, every other level receives a blit.
        access |= if level == 0 {
            vk::AccessFlags::TRANSFER_READ
        } else {
            vk::AccessFlags::TRANSFER_WRITE
        };
    }

    if usage.contains(TextureUsage::UPLOAD) {
        stages |= vk::PipelineStageFlags::TRANSFER;
        access |= vk::AccessFlags::TRANSFER_WRITE;
    }

    (stages, access)
}

/// Stage and access masks for a texture transition from `before` to `after`.
pub fn compute_barrier_info(
    before: TextureUsage,
    after: TextureUsage,
    is_depth_stencil: bool,
    level: u32,
    level_count: u32,
) -> Result<BarrierInfo> {
    check_level(level, level_count)?;
    let (src_stages, src_access) =
        texture_src(before, is_depth_stencil, is_last_blit_target(level, level_count));
    let (dst_stages, dst_access) = texture_dst(after, is_depth_stencil, level);

    if dst_stages.is_empty() {
        return Err(GpuError::InvalidUsageTransition(format!(
            "{before:?} -> {after:?} has no destination stage"
        )));
    }

    Ok(BarrierInfo {
        src_stages,
        src_access,
        dst_stages,
        dst_access,
    })
}

/// Layout a subresource is in once `usage` has completed.
pub fn compute_layout(
    usage: TextureUsage,
    is_depth_stencil: bool,
    level: u32,
    level_count: u32,
) -> Result<vk::ImageLayout> {
    check_level(level, level_count)?;

    type U = TextureUsage;
    let sampled = usage == U::FRAGMENT_SHADER_SAMPLED
        || usage == U::COMPUTE_SHADER_SAMPLED
        || usage == U::ANY_SHADER_SAMPLED;

    let layout = if usage.is_empty() {
        Some(vk::ImageLayout::UNDEFINED)
    } else if usage == U::GENERATE_MIPMAPS {
        Some(if is_last_blit_target(level, level_count) {
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        } else {
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        })
    } else if usage == U::UPLOAD {
        Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
    } else if sampled {
        Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    } else if is_depth_stencil {
        if usage == U::FRAMEBUFFER_ATTACHMENT_WRITE || usage == U::FRAMEBUFFER_ATTACHMENT_READ_WRITE
        {
            Some(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        } else if usage == U::FRAMEBUFFER_ATTACHMENT_READ
            || usage == U::FRAMEBUFFER_ATTACHMENT_READ | U::FRAGMENT_SHADER_SAMPLED
            || usage == U::FRAMEBUFFER_ATTACHMENT_READ | U::ANY_SHADER_SAMPLED
        {
            Some(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)
        } else {
            None
        }
    } else if usage == U::FRAMEBUFFER_ATTACHMENT_READ
        || usage == U::FRAMEBUFFER_ATTACHMENT_WRITE
        || usage == U::FRAMEBUFFER_ATTACHMENT_READ_WRITE
    {
        Some(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
    } else {
        None
    };

    layout.ok_or_else(|| {
        GpuError::InvalidUsageTransition(format!(
            "no layout for {usage:?} (depth/stencil: {is_depth_stencil})"
        ))
    })
}

/// Layout a subresource must be moved into before `usage` starts.
///
/// Identical to [`compute_layout`] except for mip generation, where every level
/// but the first is about to be written and therefore enters as a transfer
/// destination.
pub fn compute_target_layout(
    usage: TextureUsage,
    is_depth_stencil: bool,
    level: u32,
    level_count: u32,
) -> Result<vk::ImageLayout> {
    if usage == TextureUsage::GENERATE_MIPMAPS {
        check_level(level, level_count)?;
        return Ok(if level == 0 {
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        } else {
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        });
    }
    compute_layout(usage, is_depth_stencil, level, level_count)
}

/// Full barrier for one mip level of a texture.
pub fn compute_image_barrier(
    before: TextureUsage,
    after: TextureUsage,
    is_depth_stencil: bool,
    level: u32,
    level_count: u32,
) -> Result<ImageBarrierInfo> {
    let stages = compute_barrier_info(before, after, is_depth_stencil, level, level_count)?;
    let old_layout = compute_layout(before, is_depth_stencil, level, level_count)?;
    let new_layout = compute_target_layout(after, is_depth_stencil, level, level_count)?;
    if new_layout == vk::ImageLayout::UNDEFINED {
        return Err(GpuError::InvalidUsageTransition(format!(
            "{after:?} cannot be a transition target"
        )));
    }
    Ok(ImageBarrierInfo {
        stages,
        old_layout,
        new_layout,
    })
}

/// Barrier between blitting into a mip level and blitting out of it.
pub fn mip_level_handoff() -> ImageBarrierInfo {
    ImageBarrierInfo {
        stages: BarrierInfo {
            src_stages: vk::PipelineStageFlags::TRANSFER,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_stages: vk::PipelineStageFlags::TRANSFER,
            dst_access: vk::AccessFlags::TRANSFER_READ,
        },
        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    }
}

fn buffer_stages(usage: BufferUsage) -> (vk::PipelineStageFlags, vk::AccessFlags) {
    const TABLE: &[(BufferUsage, vk::PipelineStageFlags, vk::AccessFlags)] = &[
        (
            BufferUsage::UNIFORM_VERTEX,
            vk::PipelineStageFlags::VERTEX_SHADER,
            vk::AccessFlags::UNIFORM_READ,
        ),
        (
            BufferUsage::UNIFORM_FRAGMENT,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::UNIFORM_READ,
        ),
        (
            BufferUsage::UNIFORM_COMPUTE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::UNIFORM_READ,
        ),
        (
            BufferUsage::STORAGE_COMPUTE_READ,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        (
            BufferUsage::STORAGE_COMPUTE_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE,
        ),
        (
            BufferUsage::STORAGE_FRAGMENT_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
        ),
        (
            BufferUsage::STORAGE_FRAGMENT_WRITE,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_WRITE,
        ),
        (
            BufferUsage::INDEX,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::INDEX_READ,
        ),
        (
            BufferUsage::VERTEX,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
        ),
        (
            BufferUsage::INDIRECT,
            vk::PipelineStageFlags::DRAW_INDIRECT,
            vk::AccessFlags::INDIRECT_COMMAND_READ,
        ),
        (
            BufferUsage::TRANSFER_SOURCE,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
        ),
        (
            BufferUsage::TRANSFER_DESTINATION,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
        ),
    ];

    TABLE
        .iter()
        .filter(|(bit, _, _)| usage.contains(*bit))
        .fold(
            (vk::PipelineStageFlags::empty(), vk::AccessFlags::empty()),
            |(stages, access), (_, s, a)| (stages | *s, access | *a),
        )
}

/// Stage and access masks for a buffer transition from `before` to `after`.
pub fn compute_buffer_barrier_info(before: BufferUsage, after: BufferUsage) -> Result<BarrierInfo> {
    let (mut src_stages, src_access) = buffer_stages(before);
    if src_stages.is_empty() {
        src_stages = vk::PipelineStageFlags::TOP_OF_PIPE;
    }

    let (dst_stages, dst_access) = buffer_stages(after);
    if dst_stages.is_empty() {
        return Err(GpuError::InvalidUsageTransition(format!(
            "{before:?} -> {after:?} has no destination stage"
        )));
    }

    Ok(BarrierInfo {
        src_stages,
        src_access,
        dst_stages,
        dst_access,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUTS: [vk::ImageLayout; 7] = [
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
    ];

    fn all_usages() -> impl Iterator<Item = TextureUsage> {
        (0..=TextureUsage::all().bits()).map(TextureUsage::from_bits_truncate)
    }

    /// Usages with a well defined layout for every level.
    fn legal_usages(is_depth_stencil: bool) -> Vec<TextureUsage> {
        all_usages()
            .filter(|usage| !usage.is_empty())
            .filter(|usage| compute_layout(*usage, is_depth_stencil, 0, 1).is_ok())
            .collect()
    }

    #[test]
    fn every_legal_transition_has_a_destination_and_layout() {
        for is_depth_stencil in [false, true] {
            let legal = legal_usages(is_depth_stencil);
            assert!(legal.len() >= 6);

            let befores = std::iter::once(TextureUsage::empty()).chain(legal.iter().copied());
            for before in befores {
                for &after in &legal {
                    for level_count in [1, 4] {
                        for level in 0..level_count {
                            let barrier = compute_image_barrier(
                                before,
                                after,
                                is_depth_stencil,
                                level,
                                level_count,
                            )
                            .unwrap_or_else(|e| panic!("{before:?} -> {after:?}: {e}"));

                            assert!(!barrier.stages.dst_stages.is_empty());
                            assert!(!barrier.stages.src_stages.is_empty());
                            assert_ne!(barrier.new_layout, vk::ImageLayout::UNDEFINED);
                            assert!(LAYOUTS.contains(&barrier.new_layout));
                            assert!(LAYOUTS.contains(&barrier.old_layout));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn unlisted_combinations_are_rejected() {
        let usage = TextureUsage::UPLOAD | TextureUsage::FRAGMENT_SHADER_SAMPLED;
        assert!(matches!(
            compute_layout(usage, false, 0, 1),
            Err(GpuError::InvalidUsageTransition(_))
        ));
        assert!(compute_layout(TextureUsage::GENERATE_MIPMAPS, false, 4, 4).is_err());
        assert!(compute_barrier_info(
            TextureUsage::UPLOAD,
            TextureUsage::empty(),
            false,
            0,
            1
        )
        .is_err());
    }

    #[test]
    fn no_prior_use_waits_on_top_of_pipe() {
        let info = compute_barrier_info(
            TextureUsage::empty(),
            TextureUsage::UPLOAD,
            false,
            0,
            1,
        )
        .unwrap();
        assert_eq!(info.src_stages, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert!(info.src_access.is_empty());
        assert_eq!(info.dst_stages, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(info.dst_access, vk::AccessFlags::TRANSFER_WRITE);
    }

    #[test]
    fn sampled_by_several_stages_combines_bits() {
        let info = compute_barrier_info(
            TextureUsage::ANY_SHADER_SAMPLED,
            TextureUsage::FRAMEBUFFER_ATTACHMENT_WRITE,
            true,
            0,
            1,
        )
        .unwrap();
        assert_eq!(
            info.src_stages,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::COMPUTE_SHADER
        );
        assert_eq!(
            info.dst_stages,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        );
        assert_eq!(info.dst_access, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE);
    }

    #[test]
    fn mip_generation_layouts_per_level() {
        let upload_to_mips = compute_image_barrier(
            TextureUsage::UPLOAD,
            TextureUsage::GENERATE_MIPMAPS,
            false,
            0,
            4,
        )
        .unwrap();
        assert_eq!(upload_to_mips.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(upload_to_mips.stages.dst_access, vk::AccessFlags::TRANSFER_READ);

        assert_eq!(
            compute_layout(TextureUsage::GENERATE_MIPMAPS, false, 0, 4).unwrap(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(
            compute_layout(TextureUsage::GENERATE_MIPMAPS, false, 3, 4).unwrap(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );

        for level in 1..4 {
            let entering = compute_image_barrier(
                TextureUsage::empty(),
                TextureUsage::GENERATE_MIPMAPS,
                false,
                level,
                4,
            )
            .unwrap();
            assert_eq!(entering.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            assert_eq!(entering.stages.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        }
    }

    #[test]
    fn generated_mips_to_sampled() {
        let middle = compute_image_barrier(
            TextureUsage::GENERATE_MIPMAPS,
            TextureUsage::FRAGMENT_SHADER_SAMPLED,
            false,
            1,
            4,
        )
        .unwrap();
        assert_eq!(middle.old_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(middle.stages.src_access, vk::AccessFlags::TRANSFER_READ);

        let last = compute_image_barrier(
            TextureUsage::GENERATE_MIPMAPS,
            TextureUsage::FRAGMENT_SHADER_SAMPLED,
            false,
            3,
            4,
        )
        .unwrap();
        assert_eq!(last.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(last.stages.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(last.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn buffer_transitions() {
        let info = compute_buffer_barrier_info(
            BufferUsage::TRANSFER_DESTINATION,
            BufferUsage::VERTEX | BufferUsage::INDEX,
        )
        .unwrap();
        assert_eq!(info.src_stages, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(info.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(info.dst_stages, vk::PipelineStageFlags::VERTEX_INPUT);
        assert_eq!(
            info.dst_access,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ | vk::AccessFlags::INDEX_READ
        );

        let first_use =
            compute_buffer_barrier_info(BufferUsage::empty(), BufferUsage::UNIFORM_COMPUTE)
                .unwrap();
        assert_eq!(first_use.src_stages, vk::PipelineStageFlags::TOP_OF_PIPE);

        assert!(compute_buffer_barrier_info(BufferUsage::VERTEX, BufferUsage::empty()).is_err());
    }

    #[test]
    fn translation_is_deterministic() {
        for usage in all_usages() {
            let a = compute_layout(usage, false, 0, 2).ok();
            let b = compute_layout(usage, false, 0, 2).ok();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn mip_generation_exit_matches_entry_for_every_level() {
        let handoff = mip_level_handoff();
        for level_count in 1..=6 {
            for level in 0..level_count {
                let enter = compute_image_barrier(
                    TextureUsage::UPLOAD,
                    TextureUsage::GENERATE_MIPMAPS,
                    false,
                    level,
                    level_count,
                )
                .unwrap();
                let leave = compute_image_barrier(
                    TextureUsage::GENERATE_MIPMAPS,
                    TextureUsage::FRAGMENT_SHADER_SAMPLED,
                    false,
                    level,
                    level_count,
                )
                .unwrap();

                // Levels between the first and the last are handed off once written.
                let handed_off = level > 0 && level + 1 < level_count;
                let settled = if handed_off {
                    handoff.new_layout
                } else {
                    enter.new_layout
                };
                assert_eq!(
                    leave.old_layout, settled,
                    "level {level} of {level_count}"
                );

                let expected_access = if settled == vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
                    vk::AccessFlags::TRANSFER_READ
                } else {
                    vk::AccessFlags::TRANSFER_WRITE
                };
                assert_eq!(
                    leave.stages.src_access, expected_access,
                    "level {level} of {level_count}"
                );
            }
        }
    }

    #[test]
    fn single_level_mip_generation_stays_a_source() {
        assert_eq!(
            compute_layout(TextureUsage::GENERATE_MIPMAPS, false, 0, 1).unwrap(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(
            compute_target_layout(TextureUsage::GENERATE_MIPMAPS, false, 0, 1).unwrap(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
    }

    #[test]
    fn mip_handoff_leaves_generated_levels_as_sources() {
        let handoff = mip_level_handoff();
        // Every level but the last ends as a blit source, matching the settled
        // layout of mip generation.
        for level in 1..3 {
            assert_eq!(
                handoff.new_layout,
                compute_layout(TextureUsage::GENERATE_MIPMAPS, false, level, 4).unwrap()
            );
            assert_eq!(
                handoff.old_layout,
                compute_target_layout(TextureUsage::GENERATE_MIPMAPS, false, level, 4).unwrap()
            );
        }
    }
}
