//! Graphics and compute pipelines.
//!
//! Every pipeline binds against the single device-wide pipeline layout,
//! so binding a pipeline never invalidates descriptor bindings.

use ash::vk;
use ember_core::collections::SmallVec;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};
use crate::shader::{ShaderProgram, ShaderStage};

pub struct Pipeline {
    handle: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

impl Pipeline {
    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.bind_point
    }
}

/// Fixed-function state for graphics pipeline creation. Viewport and
/// scissor are always dynamic; vertex data is pulled from storage
/// buffers, so there is no vertex input state.
pub struct GraphicsPipelineFixedState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    /// One entry per color attachment; when empty, a disabled blend
    /// state is used for every color format.
    pub blend_attachments: SmallVec<[vk::PipelineColorBlendAttachmentState; 4]>,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: vk::CompareOp,
    pub sample_count: vk::SampleCountFlags,
    pub color_formats: SmallVec<[vk::Format; 4]>,
    pub depth_format: Option<vk::Format>,
    pub stencil_format: Option<vk::Format>,
    pub view_mask: u32,
}

impl Default for GraphicsPipelineFixedState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            blend_attachments: SmallVec::new(),
            depth_test_enable: false,
            depth_write_enable: false,
            depth_compare_op: vk::CompareOp::GREATER_OR_EQUAL,
            sample_count: vk::SampleCountFlags::TYPE_1,
            color_formats: SmallVec::new(),
            depth_format: None,
            stencil_format: None,
            view_mask: 0,
        }
    }
}

pub fn disabled_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(false)
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

pub fn alpha_blend_attachment() -> vk::PipelineColorBlendAttachmentState {
    vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(true)
        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .color_blend_op(vk::BlendOp::ADD)
        .src_alpha_blend_factor(vk::BlendFactor::ONE)
        .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
        .alpha_blend_op(vk::BlendOp::ADD)
        .color_write_mask(vk::ColorComponentFlags::RGBA)
}

impl Device {
    pub fn create_graphics_pipeline(
        &mut self,
        state: &GraphicsPipelineFixedState,
        program: &ShaderProgram,
    ) -> RhiResult<Pipeline> {
        let entry_point = c"main";
        let mut stages: SmallVec<[vk::PipelineShaderStageCreateInfo; 2]> = SmallVec::new();
        for stage in [ShaderStage::Vertex, ShaderStage::Fragment] {
            if let Some(shader) = program.get(stage) {
                stages.push(
                    vk::PipelineShaderStageCreateInfo::default()
                        .stage(stage.vk_flags())
                        .module(shader.module())
                        .name(entry_point),
                );
            }
        }
        if stages.is_empty() {
            return Err(RhiError::Config(
                "graphics pipeline needs at least a vertex shader".into(),
            ));
        }

        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly_state =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(state.topology);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(state.polygon_mode)
            .cull_mode(state.cull_mode)
            .front_face(state.front_face)
            .line_width(1.0);
        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(state.sample_count);
        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth_test_enable)
            .depth_write_enable(state.depth_write_enable)
            .depth_compare_op(state.depth_compare_op);

        let blend_attachments: SmallVec<[vk::PipelineColorBlendAttachmentState; 4]> =
            if state.blend_attachments.is_empty() {
                state
                    .color_formats
                    .iter()
                    .map(|_| disabled_blend_attachment())
                    .collect()
            } else {
                debug_assert_eq!(state.blend_attachments.len(), state.color_formats.len());
                state.blend_attachments.clone()
            };
        let color_blend_state =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .view_mask(state.view_mask)
            .color_attachment_formats(&state.color_formats);
        if let Some(depth_format) = state.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }
        if let Some(stencil_format) = state.stencil_format {
            rendering_info = rendering_info.stencil_attachment_format(stencil_format);
        }

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(self.pipeline_layout())
            .push_next(&mut rendering_info);

        let pipelines = unsafe {
            self.raw()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|e| e.1)?;

        Ok(Pipeline {
            handle: pipelines[0],
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }

    pub fn create_compute_pipeline(&mut self, program: &ShaderProgram) -> RhiResult<Pipeline> {
        let shader = program.get(ShaderStage::Compute).ok_or_else(|| {
            RhiError::Config("compute pipeline needs a compute shader".into())
        })?;

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module())
            .name(c"main");
        let info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(self.pipeline_layout());

        let pipelines = unsafe {
            self.raw()
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|e| e.1)?;

        Ok(Pipeline {
            handle: pipelines[0],
            bind_point: vk::PipelineBindPoint::COMPUTE,
        })
    }

    pub fn destroy_pipeline(&mut self, pipeline: &mut Pipeline) {
        if pipeline.handle == vk::Pipeline::null() {
            return;
        }
        unsafe {
            self.raw().destroy_pipeline(pipeline.handle, None);
        }
        pipeline.handle = vk::Pipeline::null();
    }
}
