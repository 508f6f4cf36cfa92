//! Command buffer recording.
//!
//! A [`CommandBuffer`] wraps a Vulkan command buffer together with an
//! explicit lifecycle state. Fallible transitions (`begin`, `end`, reset,
//! submit) return errors; individual recording commands assert the
//! recording state in debug builds, since misuse there is a programmer
//! bug rather than a runtime condition.

use ash::vk;

use crate::buffer::Buffer;
use crate::error::{RhiError, RhiResult};
use crate::pipeline::Pipeline;
use crate::texture::Texture;

/// Lifecycle of a command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    NotAllocated,
    Idle,
    Recording,
    Recorded,
    Submitted,
    Invalid,
}

impl CommandBufferState {
    #[inline]
    pub fn can_begin(self) -> bool {
        matches!(self, CommandBufferState::Idle)
    }

    #[inline]
    pub fn is_recording(self) -> bool {
        matches!(self, CommandBufferState::Recording)
    }

    #[inline]
    pub fn can_submit(self) -> bool {
        matches!(self, CommandBufferState::Recorded)
    }

    /// States a reset may be issued from.
    #[inline]
    pub fn can_reset(self) -> bool {
        matches!(
            self,
            CommandBufferState::Idle
                | CommandBufferState::Recorded
                | CommandBufferState::Submitted
                | CommandBufferState::Invalid
        )
    }
}

pub struct CommandBuffer {
    device: ash::Device,
    handle: vk::CommandBuffer,
    pipeline_layout: vk::PipelineLayout,
    bindless_set: vk::DescriptorSet,
    state: CommandBufferState,
}

impl CommandBuffer {
    pub(crate) fn new(
        device: ash::Device,
        handle: vk::CommandBuffer,
        pipeline_layout: vk::PipelineLayout,
        bindless_set: vk::DescriptorSet,
    ) -> Self {
        Self {
            device,
            handle,
            pipeline_layout,
            bindless_set,
            state: CommandBufferState::Idle,
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: CommandBufferState) {
        self.state = state;
    }

    #[inline]
    fn assert_recording(&self, operation: &'static str) {
        debug_assert!(
            self.state.is_recording(),
            "{} recorded outside begin/end (state {:?})",
            operation,
            self.state
        );
    }

    pub fn begin(&mut self, flags: vk::CommandBufferUsageFlags) -> RhiResult<()> {
        if !self.state.can_begin() {
            return Err(RhiError::Record {
                state: self.state,
                operation: "begin",
            });
        }

        let info = vk::CommandBufferBeginInfo::default().flags(flags);
        match unsafe { self.device.begin_command_buffer(self.handle, &info) } {
            Ok(()) => {
                self.state = CommandBufferState::Recording;
                Ok(())
            }
            Err(e) => {
                self.state = CommandBufferState::Invalid;
                Err(e.into())
            }
        }
    }

    pub fn end(&mut self) -> RhiResult<()> {
        if !self.state.is_recording() {
            return Err(RhiError::Record {
                state: self.state,
                operation: "end",
            });
        }

        match unsafe { self.device.end_command_buffer(self.handle) } {
            Ok(()) => {
                self.state = CommandBufferState::Recorded;
                Ok(())
            }
            Err(e) => {
                self.state = CommandBufferState::Invalid;
                Err(e.into())
            }
        }
    }

    pub fn reset(&mut self) -> RhiResult<()> {
        if !self.state.can_reset() {
            return Err(RhiError::Record {
                state: self.state,
                operation: "reset",
            });
        }

        match unsafe {
            self.device
                .reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())
        } {
            Ok(()) => {
                self.state = CommandBufferState::Idle;
                Ok(())
            }
            Err(e) => {
                self.state = CommandBufferState::Invalid;
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Pipeline binding
    // ------------------------------------------------------------------

    /// Binds a pipeline and the global bindless set at its bind point.
    pub fn bind_pipeline(&mut self, pipeline: &Pipeline) {
        self.assert_recording("bind_pipeline");
        unsafe {
            self.device
                .cmd_bind_pipeline(self.handle, pipeline.bind_point(), pipeline.handle());
            self.device.cmd_bind_descriptor_sets(
                self.handle,
                pipeline.bind_point(),
                self.pipeline_layout,
                0,
                &[self.bindless_set],
                &[],
            );
        }
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer, index_type: vk::IndexType) {
        self.assert_recording("bind_index_buffer");
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.handle, buffer.handle(), 0, index_type);
        }
    }

    // ------------------------------------------------------------------
    // Dynamic state and constants
    // ------------------------------------------------------------------

    pub fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) {
        self.assert_recording("set_viewport");
        let viewport = vk::Viewport {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device.cmd_set_viewport(self.handle, 0, &[viewport]);
        }
    }

    pub fn set_scissor(&mut self, offset: vk::Offset2D, extent: vk::Extent2D) {
        self.assert_recording("set_scissor");
        let scissor = vk::Rect2D { offset, extent };
        unsafe {
            self.device.cmd_set_scissor(self.handle, 0, &[scissor]);
        }
    }

    /// Pushes `data` through the shared pipeline layout, visible to all
    /// shader stages.
    pub fn push_constants<T: bytemuck::Pod>(&mut self, offset: u32, data: &T) {
        self.assert_recording("push_constants");
        let bytes = bytemuck::bytes_of(data);
        debug_assert!(offset as usize + bytes.len() <= crate::device::PUSH_CONSTANT_SIZE as usize);
        unsafe {
            self.device.cmd_push_constants(
                self.handle,
                self.pipeline_layout,
                vk::ShaderStageFlags::ALL,
                offset,
                bytes,
            );
        }
    }

    // ------------------------------------------------------------------
    // Draws and dispatches
    // ------------------------------------------------------------------

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.assert_recording("draw");
        unsafe {
            self.device.cmd_draw(
                self.handle,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.assert_recording("draw_indexed");
        unsafe {
            self.device.cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn draw_indirect_count(
        &mut self,
        args: &Buffer,
        args_offset: vk::DeviceSize,
        count: &Buffer,
        count_offset: vk::DeviceSize,
        max_draw_count: u32,
        stride: u32,
    ) {
        self.assert_recording("draw_indirect_count");
        unsafe {
            self.device.cmd_draw_indirect_count(
                self.handle,
                args.handle(),
                args_offset,
                count.handle(),
                count_offset,
                max_draw_count,
                stride,
            );
        }
    }

    pub fn draw_indexed_indirect_count(
        &mut self,
        args: &Buffer,
        args_offset: vk::DeviceSize,
        count: &Buffer,
        count_offset: vk::DeviceSize,
        max_draw_count: u32,
        stride: u32,
    ) {
        self.assert_recording("draw_indexed_indirect_count");
        unsafe {
            self.device.cmd_draw_indexed_indirect_count(
                self.handle,
                args.handle(),
                args_offset,
                count.handle(),
                count_offset,
                max_draw_count,
                stride,
            );
        }
    }

    pub fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        self.assert_recording("dispatch");
        unsafe {
            self.device
                .cmd_dispatch(self.handle, group_count_x, group_count_y, group_count_z);
        }
    }

    pub fn dispatch_indirect(&mut self, args: &Buffer, offset: vk::DeviceSize) {
        self.assert_recording("dispatch_indirect");
        unsafe {
            self.device
                .cmd_dispatch_indirect(self.handle, args.handle(), offset);
        }
    }

    // ------------------------------------------------------------------
    // Transfers and clears
    // ------------------------------------------------------------------

    /// Fills a buffer range with a repeated 32 bit word. A `size` of zero
    /// fills from `offset` to the end of the buffer.
    pub fn fill_buffer(
        &mut self,
        buffer: &Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        data: u32,
    ) {
        self.assert_recording("fill_buffer");
        let size = if size == 0 { vk::WHOLE_SIZE } else { size };
        unsafe {
            self.device
                .cmd_fill_buffer(self.handle, buffer.handle(), offset, size, data);
        }
    }

    pub fn copy_buffer(
        &mut self,
        src: &Buffer,
        src_offset: vk::DeviceSize,
        dst: &Buffer,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        self.assert_recording("copy_buffer");
        let region = vk::BufferCopy2::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);
        let regions = [region];
        let info = vk::CopyBufferInfo2::default()
            .src_buffer(src.handle())
            .dst_buffer(dst.handle())
            .regions(&regions);
        unsafe {
            self.device.cmd_copy_buffer2(self.handle, &info);
        }
    }

    /// Copies tightly packed buffer contents into one mip level of a
    /// texture. The texture must be in `TRANSFER_DST_OPTIMAL`.
    pub fn copy_buffer_to_texture(&mut self, src: &Buffer, dst: &Texture, mip_level: u32) {
        self.assert_recording("copy_buffer_to_texture");
        debug_assert_eq!(dst.state().layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let region = buffer_image_copy(dst, mip_level);
        let regions = [region];
        let info = vk::CopyBufferToImageInfo2::default()
            .src_buffer(src.handle())
            .dst_image(dst.image())
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(&regions);
        unsafe {
            self.device.cmd_copy_buffer_to_image2(self.handle, &info);
        }
    }

    /// Copies explicit regions from a buffer into a texture in
    /// `TRANSFER_DST_OPTIMAL`, one region per subresource range.
    pub fn copy_buffer_to_texture_regions(
        &mut self,
        src: &Buffer,
        dst: &Texture,
        regions: &[vk::BufferImageCopy2],
    ) {
        self.assert_recording("copy_buffer_to_texture_regions");
        let info = vk::CopyBufferToImageInfo2::default()
            .src_buffer(src.handle())
            .dst_image(dst.image())
            .dst_image_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .regions(regions);
        unsafe {
            self.device.cmd_copy_buffer_to_image2(self.handle, &info);
        }
    }

    /// Reads one mip level of a texture back into a buffer. The texture
    /// must be in `TRANSFER_SRC_OPTIMAL`.
    pub fn copy_texture_to_buffer(&mut self, src: &Texture, dst: &Buffer, mip_level: u32) {
        self.assert_recording("copy_texture_to_buffer");
        debug_assert_eq!(src.state().layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);

        let region = buffer_image_copy(src, mip_level);
        let regions = [region];
        let info = vk::CopyImageToBufferInfo2::default()
            .src_image(src.image())
            .src_image_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .dst_buffer(dst.handle())
            .regions(&regions);
        unsafe {
            self.device.cmd_copy_image_to_buffer2(self.handle, &info);
        }
    }

    pub fn blit(&mut self, info: &vk::BlitImageInfo2) {
        self.assert_recording("blit");
        unsafe {
            self.device.cmd_blit_image2(self.handle, info);
        }
    }

    /// Clears every mip and layer of a color texture. The texture must be
    /// in `TRANSFER_DST_OPTIMAL`.
    pub fn clear_color(&mut self, texture: &Texture, r: f32, g: f32, b: f32, a: f32) {
        self.assert_recording("clear_color");
        debug_assert_eq!(
            texture.state().layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );

        let clear_value = vk::ClearColorValue {
            float32: [r, g, b, a],
        };
        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        };
        unsafe {
            self.device.cmd_clear_color_image(
                self.handle,
                texture.image(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &clear_value,
                &[range],
            );
        }
    }

    // ------------------------------------------------------------------
    // Synchronization and queries
    // ------------------------------------------------------------------

    pub fn pipeline_barrier(
        &mut self,
        buffer_barriers: &[vk::BufferMemoryBarrier2],
        image_barriers: &[vk::ImageMemoryBarrier2],
    ) {
        self.assert_recording("pipeline_barrier");
        if buffer_barriers.is_empty() && image_barriers.is_empty() {
            return;
        }
        let dependency = vk::DependencyInfo::default()
            .buffer_memory_barriers(buffer_barriers)
            .image_memory_barriers(image_barriers);
        unsafe {
            self.device.cmd_pipeline_barrier2(self.handle, &dependency);
        }
    }

    /// Global execution and memory dependency, not tied to a resource.
    pub fn memory_barrier(
        &mut self,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) {
        self.assert_recording("memory_barrier");
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(src_stage)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stage)
            .dst_access_mask(dst_access);
        let barriers = [barrier];
        let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
        unsafe {
            self.device.cmd_pipeline_barrier2(self.handle, &dependency);
        }
    }

    pub fn reset_query_pool(&mut self, pool: vk::QueryPool, first_query: u32, query_count: u32) {
        self.assert_recording("reset_query_pool");
        unsafe {
            self.device
                .cmd_reset_query_pool(self.handle, pool, first_query, query_count);
        }
    }

    pub fn write_timestamp(
        &mut self,
        stage: vk::PipelineStageFlags2,
        pool: vk::QueryPool,
        query: u32,
    ) {
        self.assert_recording("write_timestamp");
        unsafe {
            self.device
                .cmd_write_timestamp2(self.handle, stage, pool, query);
        }
    }

    // ------------------------------------------------------------------
    // Dynamic rendering
    // ------------------------------------------------------------------

    pub fn begin_rendering(&mut self, info: &vk::RenderingInfo) {
        self.assert_recording("begin_rendering");
        unsafe {
            self.device.cmd_begin_rendering(self.handle, info);
        }
    }

    pub fn end_rendering(&mut self) {
        self.assert_recording("end_rendering");
        unsafe {
            self.device.cmd_end_rendering(self.handle);
        }
    }
}

fn buffer_image_copy(texture: &Texture, mip_level: u32) -> vk::BufferImageCopy2<'static> {
    debug_assert!(mip_level < texture.mip_count());
    vk::BufferImageCopy2::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: crate::barrier::aspect_mask_for_format(texture.format()),
            mip_level,
            base_array_layer: 0,
            layer_count: texture.layer_count(),
        })
        .image_offset(vk::Offset3D::default())
        .image_extent(vk::Extent3D {
            width: (texture.width() >> mip_level).max(1),
            height: (texture.height() >> mip_level).max(1),
            depth: 1,
        })
}

// ----------------------------------------------------------------------
// Attachment and rendering info builders
// ----------------------------------------------------------------------

pub fn color_attachment_info(
    view: vk::ImageView,
    layout: vk::ImageLayout,
    load_op: vk::AttachmentLoadOp,
    store_op: vk::AttachmentStoreOp,
    clear_value: vk::ClearValue,
) -> vk::RenderingAttachmentInfo<'static> {
    vk::RenderingAttachmentInfo::default()
        .image_view(view)
        .image_layout(layout)
        .load_op(load_op)
        .store_op(store_op)
        .clear_value(clear_value)
}

pub fn depth_attachment_info(
    view: vk::ImageView,
    load_op: vk::AttachmentLoadOp,
    store_op: vk::AttachmentStoreOp,
    clear_depth: f32,
) -> vk::RenderingAttachmentInfo<'static> {
    vk::RenderingAttachmentInfo::default()
        .image_view(view)
        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .load_op(load_op)
        .store_op(store_op)
        .clear_value(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: clear_depth,
                stencil: 0,
            },
        })
}

pub fn rendering_info<'a>(
    render_area: vk::Rect2D,
    color_attachments: &'a [vk::RenderingAttachmentInfo<'a>],
    depth_attachment: Option<&'a vk::RenderingAttachmentInfo<'a>>,
) -> vk::RenderingInfo<'a> {
    let mut info = vk::RenderingInfo::default()
        .render_area(render_area)
        .layer_count(1)
        .color_attachments(color_attachments);
    if let Some(depth) = depth_attachment {
        info = info.depth_attachment(depth);
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_predicates() {
        assert!(CommandBufferState::Idle.can_begin());
        assert!(!CommandBufferState::Recording.can_begin());
        assert!(!CommandBufferState::Submitted.can_begin());

        assert!(CommandBufferState::Recording.is_recording());
        assert!(!CommandBufferState::Recorded.is_recording());

        assert!(CommandBufferState::Recorded.can_submit());
        assert!(!CommandBufferState::Idle.can_submit());

        assert!(CommandBufferState::Submitted.can_reset());
        assert!(CommandBufferState::Invalid.can_reset());
        assert!(!CommandBufferState::Recording.can_reset());
        assert!(!CommandBufferState::NotAllocated.can_reset());
    }

    #[test]
    fn color_attachment_builder_carries_ops() {
        let info = color_attachment_info(
            vk::ImageView::null(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
            vk::ClearValue::default(),
        );
        assert_eq!(info.image_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(info.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(info.store_op, vk::AttachmentStoreOp::STORE);
    }

    #[test]
    fn rendering_info_wires_attachments() {
        let color = [color_attachment_info(
            vk::ImageView::null(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::AttachmentLoadOp::LOAD,
            vk::AttachmentStoreOp::STORE,
            vk::ClearValue::default(),
        )];
        let depth = depth_attachment_info(
            vk::ImageView::null(),
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::DONT_CARE,
            1.0,
        );
        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
        };

        let info = rendering_info(area, &color, Some(&depth));
        assert_eq!(info.color_attachment_count, 1);
        assert_eq!(info.layer_count, 1);
        assert!(!info.p_depth_attachment.is_null());
    }
}
