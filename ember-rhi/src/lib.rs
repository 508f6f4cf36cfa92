//! Vulkan rendering backend.
//!
//! Built on bindless descriptors, dynamic rendering and synchronization2.
//! A [`Context`] selects an adapter, a [`Device`] owns the queue, the
//! frame loop and all resource creation; recorded work goes through
//! [`CommandBuffer`] and the execution wrappers in [`execute`].

pub mod acceleration_structure;
pub mod barrier;
pub mod buffer;
pub mod command;
pub mod context;
pub mod device;
pub mod error;
pub mod execute;
pub mod pipeline;
pub mod sampler;
pub mod shader;
pub mod swapchain;
pub mod texture;

pub use acceleration_structure::{AccelerationStructure, AccelerationStructureDesc};
pub use barrier::{BufferState, TextureState, aspect_mask_for_format};
pub use buffer::{Buffer, BufferDesc};
pub use command::{CommandBuffer, CommandBufferState};
pub use context::{Adapter, Context, ContextDesc, DeviceFeatures, MAX_ADAPTER_COUNT};
pub use device::{
    ACCELERATION_STRUCTURE_BINDING, BINDLESS_HANDLE_INVALID, DEPTH_FORMAT, DESCRIPTOR_MAX_COUNT,
    Device, FRAME_IN_FLIGHT_COUNT, PUSH_CONSTANT_SIZE, QueryPool, SAMPLED_TEXTURE_BINDING,
    STORAGE_BUFFER_BINDING, STORAGE_TEXTURE_BINDING, SWAPCHAIN_IMAGE_MAX_COUNT,
    UNIFORM_BUFFER_BINDING,
};
pub use error::{RhiError, RhiResult};
pub use execute::{BufferUse, ExecutionKind, TextureUse};
pub use pipeline::{GraphicsPipelineFixedState, Pipeline};
pub use sampler::{FilterMode, Sampler, WrapMode};
pub use shader::{SHADER_STAGE_COUNT, Shader, ShaderProgram, ShaderStage};
pub use swapchain::Swapchain;
pub use texture::{Texture, TextureDesc, mip_level_count};

pub use ash::vk;
