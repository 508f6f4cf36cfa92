//! Execution wrappers.
//!
//! Passes declare the buffers and textures they touch with the access
//! (and layout) they need; the wrapper diffs those against each
//! resource's tracked state, emits one `pipelineBarrier2` for everything
//! that changed and then runs the recording closure. On exit every
//! listed resource's tracked state equals the requested one.

use ash::vk;
use ember_core::collections::SmallVec;

use crate::barrier::{
    BufferState, TextureState, aspect_mask_for_format, buffer_memory_barrier, buffer_transition,
    image_memory_barrier, texture_transition,
};
use crate::buffer::Buffer;
use crate::command::CommandBuffer;
use crate::texture::Texture;

pub struct BufferUse<'a> {
    pub buffer: &'a mut Buffer,
    pub access: vk::AccessFlags2,
}

pub struct TextureUse<'a> {
    pub texture: &'a mut Texture,
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionKind {
    Graphics,
    Compute,
    ComputeIndirect,
    Transfer,
}

/// The destination stage mask a wrapper synchronizes its inputs to.
pub fn execution_stage(kind: ExecutionKind) -> vk::PipelineStageFlags2 {
    match kind {
        ExecutionKind::Graphics => vk::PipelineStageFlags2::ALL_GRAPHICS,
        ExecutionKind::Compute => vk::PipelineStageFlags2::COMPUTE_SHADER,
        ExecutionKind::ComputeIndirect => {
            vk::PipelineStageFlags2::COMPUTE_SHADER | vk::PipelineStageFlags2::DRAW_INDIRECT
        }
        ExecutionKind::Transfer => vk::PipelineStageFlags2::ALL_COMMANDS,
    }
}

/// Barrier half of the wrappers: diffs every input against its tracked
/// state, emits one batched barrier and commits the requested states.
pub fn transition_resources(
    cmd: &mut CommandBuffer,
    stage: vk::PipelineStageFlags2,
    buffers: &mut [BufferUse<'_>],
    textures: &mut [TextureUse<'_>],
) {
    let mut buffer_barriers: SmallVec<[vk::BufferMemoryBarrier2; 8]> = SmallVec::new();
    let mut image_barriers: SmallVec<[vk::ImageMemoryBarrier2; 8]> = SmallVec::new();

    for input in buffers.iter_mut() {
        let requested = BufferState {
            stage,
            access: input.access,
        };
        if let Some((src, dst)) = buffer_transition(input.buffer.state, requested) {
            buffer_barriers.push(buffer_memory_barrier(input.buffer.handle(), src, dst));
        }
        input.buffer.state = requested;
    }
    for input in textures.iter_mut() {
        let requested = TextureState {
            stage,
            access: input.access,
            layout: input.layout,
        };
        if let Some((src, dst)) = texture_transition(input.texture.state, requested) {
            image_barriers.push(image_memory_barrier(
                input.texture.image(),
                aspect_mask_for_format(input.texture.format()),
                src,
                dst,
            ));
        }
        input.texture.state = requested;
    }

    cmd.pipeline_barrier(&buffer_barriers, &image_barriers);
}

/// Synchronizes the inputs for graphics work and runs `record` inside a
/// dynamic rendering scope.
pub fn execute_graphics(
    cmd: &mut CommandBuffer,
    rendering_info: &vk::RenderingInfo,
    buffers: &mut [BufferUse<'_>],
    textures: &mut [TextureUse<'_>],
    record: impl FnOnce(&mut CommandBuffer),
) {
    transition_resources(
        cmd,
        execution_stage(ExecutionKind::Graphics),
        buffers,
        textures,
    );
    cmd.begin_rendering(rendering_info);
    record(cmd);
    cmd.end_rendering();
}

pub fn execute_compute(
    cmd: &mut CommandBuffer,
    buffers: &mut [BufferUse<'_>],
    textures: &mut [TextureUse<'_>],
    record: impl FnOnce(&mut CommandBuffer),
) {
    transition_resources(
        cmd,
        execution_stage(ExecutionKind::Compute),
        buffers,
        textures,
    );
    record(cmd);
}

/// Compute work that also reads indirect dispatch arguments; the inputs
/// are made visible to the indirect stage as well.
pub fn execute_compute_indirect(
    cmd: &mut CommandBuffer,
    buffers: &mut [BufferUse<'_>],
    textures: &mut [TextureUse<'_>],
    record: impl FnOnce(&mut CommandBuffer),
) {
    transition_resources(
        cmd,
        execution_stage(ExecutionKind::ComputeIndirect),
        buffers,
        textures,
    );
    record(cmd);
}

pub fn execute_transfer(
    cmd: &mut CommandBuffer,
    buffers: &mut [BufferUse<'_>],
    textures: &mut [TextureUse<'_>],
    record: impl FnOnce(&mut CommandBuffer),
) {
    transition_resources(
        cmd,
        execution_stage(ExecutionKind::Transfer),
        buffers,
        textures,
    );
    record(cmd);
}

/// Manual one-off transition outside any wrapper.
pub fn change_texture_access_layout(
    cmd: &mut CommandBuffer,
    texture: &mut Texture,
    new_layout: vk::ImageLayout,
    new_access: vk::AccessFlags2,
) {
    let requested = TextureState {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: new_access,
        layout: new_layout,
    };
    if let Some((src, dst)) = texture_transition(texture.state, requested) {
        let barrier = image_memory_barrier(
            texture.image(),
            aspect_mask_for_format(texture.format()),
            src,
            dst,
        );
        cmd.pipeline_barrier(&[], &[barrier]);
    }
    texture.state = requested;
}

/// Fills mips 1.. by blitting down the chain. The texture must already
/// be in `TRANSFER_DST_OPTIMAL` with mip 0 populated; on return the
/// whole image is in `TRANSFER_SRC_OPTIMAL`.
pub fn generate_mipmaps(cmd: &mut CommandBuffer, texture: &mut Texture) {
    debug_assert_eq!(texture.state.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    let aspect_mask = aspect_mask_for_format(texture.format());

    let mip_to_source = |mip: u32| {
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_READ)
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(texture.image())
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: mip,
                level_count: 1,
                base_array_layer: 0,
                layer_count: texture.layer_count(),
            })
    };

    for mip in 1..texture.mip_count() {
        cmd.pipeline_barrier(&[], &[mip_to_source(mip - 1)]);

        let src_width = (texture.width() >> (mip - 1)).max(1) as i32;
        let src_height = (texture.height() >> (mip - 1)).max(1) as i32;
        let dst_width = (texture.width() >> mip).max(1) as i32;
        let dst_height = (texture.height() >> mip).max(1) as i32;

        let region = vk::ImageBlit2::default()
            .src_subresource(vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: mip - 1,
                base_array_layer: 0,
                layer_count: texture.layer_count(),
            })
            .src_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: src_width,
                    y: src_height,
                    z: 1,
                },
            ])
            .dst_subresource(vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: mip,
                base_array_layer: 0,
                layer_count: texture.layer_count(),
            })
            .dst_offsets([
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: dst_width,
                    y: dst_height,
                    z: 1,
                },
            ]);
        let regions = [region];
        let info = vk::BlitImageInfo2::default()
            .src_image(texture.image())
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_image(texture.image())
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .filter(vk::Filter::LINEAR)
            .regions(&regions);
        cmd.blit(&info);
    }

    // Bring the last mip in line so the whole image shares one layout.
    cmd.pipeline_barrier(&[], &[mip_to_source(texture.mip_count() - 1)]);
    texture.state = TextureState {
        stage: vk::PipelineStageFlags2::TRANSFER,
        access: vk::AccessFlags2::TRANSFER_READ,
        layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapper_stages() {
        assert_eq!(
            execution_stage(ExecutionKind::Graphics),
            vk::PipelineStageFlags2::ALL_GRAPHICS
        );
        assert_eq!(
            execution_stage(ExecutionKind::Compute),
            vk::PipelineStageFlags2::COMPUTE_SHADER
        );
        assert!(
            execution_stage(ExecutionKind::ComputeIndirect)
                .contains(vk::PipelineStageFlags2::DRAW_INDIRECT)
        );
        assert_eq!(
            execution_stage(ExecutionKind::Transfer),
            vk::PipelineStageFlags2::ALL_COMMANDS
        );
    }
}
