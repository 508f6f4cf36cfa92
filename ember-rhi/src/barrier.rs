//! Synchronization state tracking and barrier construction.
//!
//! Buffers and textures carry the stage, access and (for textures) layout
//! of their last recorded use. Before a batch of work is recorded, the
//! requested use is diffed against the tracked state; a barrier is emitted
//! only when something actually changes.

use ash::vk;

/// Tracked synchronization state of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BufferState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

/// Tracked synchronization state of a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

impl Default for TextureState {
    fn default() -> Self {
        Self {
            stage: vk::PipelineStageFlags2::NONE,
            access: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

/// Decide whether moving a buffer from `current` to `requested` needs a
/// barrier. Returns the (src, dst) pair to record, or `None` when the
/// requested state matches the tracked one.
pub fn buffer_transition(
    current: BufferState,
    requested: BufferState,
) -> Option<(BufferState, BufferState)> {
    if current == requested {
        return None;
    }
    Some((current, requested))
}

/// Same as [`buffer_transition`] for textures, additionally covering
/// layout changes.
pub fn texture_transition(
    current: TextureState,
    requested: TextureState,
) -> Option<(TextureState, TextureState)> {
    if current == requested {
        return None;
    }
    Some((current, requested))
}

pub fn buffer_memory_barrier(
    buffer: vk::Buffer,
    src: BufferState,
    dst: BufferState,
) -> vk::BufferMemoryBarrier2<'static> {
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(src.stage)
        .src_access_mask(src.access)
        .dst_stage_mask(dst.stage)
        .dst_access_mask(dst.access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

pub fn image_memory_barrier(
    image: vk::Image,
    aspect_mask: vk::ImageAspectFlags,
    src: TextureState,
    dst: TextureState,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(src.stage)
        .src_access_mask(src.access)
        .dst_stage_mask(dst.stage)
        .dst_access_mask(dst.access)
        .old_layout(src.layout)
        .new_layout(dst.layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        })
}

/// Aspect flags implied by a format.
pub fn aspect_mask_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_buffer_state_is_elided() {
        let state = BufferState {
            stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access: vk::AccessFlags2::SHADER_STORAGE_READ,
        };
        assert!(buffer_transition(state, state).is_none());
    }

    #[test]
    fn buffer_access_change_needs_a_barrier() {
        let current = BufferState {
            stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access: vk::AccessFlags2::SHADER_STORAGE_WRITE,
        };
        let requested = BufferState {
            stage: vk::PipelineStageFlags2::ALL_GRAPHICS,
            access: vk::AccessFlags2::SHADER_STORAGE_READ,
        };

        let (src, dst) = buffer_transition(current, requested).unwrap();
        assert_eq!(src, current);
        assert_eq!(dst, requested);
    }

    #[test]
    fn texture_layout_change_alone_needs_a_barrier() {
        let current = TextureState {
            stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
            access: vk::AccessFlags2::SHADER_SAMPLED_READ,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        let mut requested = current;
        requested.layout = vk::ImageLayout::GENERAL;

        assert!(texture_transition(current, current).is_none());
        let (_, dst) = texture_transition(current, requested).unwrap();
        assert_eq!(dst.layout, vk::ImageLayout::GENERAL);
    }

    #[test]
    fn depth_formats_map_to_depth_aspects() {
        assert_eq!(
            aspect_mask_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_mask_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask_for_format(vk::Format::R8G8B8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
    }
}
