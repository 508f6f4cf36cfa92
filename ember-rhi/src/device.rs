//! Logical device, frame loop and bindless descriptor management.
//!
//! The device owns one graphics+compute queue, the global bindless
//! descriptor set, the shared pipeline layout, per-frame submission
//! state for [`FRAME_IN_FLIGHT_COUNT`] frames and a synchronous transfer
//! cell for one-time submits.

use ash::vk;
use ember_core::collections::SmallVec;
use ember_core::log;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};

use crate::barrier::{TextureState, image_memory_barrier};
use crate::command::{CommandBuffer, CommandBufferState};
use crate::context::{Context, DeviceFeatures};
use crate::error::{RhiError, RhiResult};
use crate::swapchain::Swapchain;
use crate::texture::Texture;

pub const FRAME_IN_FLIGHT_COUNT: usize = 2;
pub const SWAPCHAIN_IMAGE_MAX_COUNT: usize = 8;

pub const UNIFORM_BUFFER_BINDING: u32 = 0;
pub const STORAGE_BUFFER_BINDING: u32 = 1;
pub const SAMPLED_TEXTURE_BINDING: u32 = 2;
pub const STORAGE_TEXTURE_BINDING: u32 = 3;
pub const ACCELERATION_STRUCTURE_BINDING: u32 = 4;

pub const DESCRIPTOR_MAX_COUNT: u32 = 100_000;
pub const PUSH_CONSTANT_SIZE: u32 = 128;

/// Format of the depth texture paired with the swapchain.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Sentinel for "not registered"; bindless slots are never recycled.
pub const BINDLESS_HANDLE_INVALID: u32 = u32::MAX;

struct FrameData {
    command_pool: vk::CommandPool,
    command_buffer: CommandBuffer,
    swapchain_semaphore: vk::Semaphore,
    render_semaphore: vk::Semaphore,
    render_fence: vk::Fence,
}

struct TransferData {
    command_pool: vk::CommandPool,
    command_buffer: CommandBuffer,
    fence: vk::Fence,
}

/// Upper bounds of each bindless array, clamped to the adapter's
/// update-after-bind limits.
#[derive(Clone, Copy, Debug)]
struct BindlessLimits {
    uniform_buffers: u32,
    storage_buffers: u32,
    sampled_textures: u32,
    storage_textures: u32,
    acceleration_structures: u32,
}

pub struct Device {
    name: String,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    limits: vk::PhysicalDeviceLimits,
    features: DeviceFeatures,
    allocator: Option<Allocator>,

    graphics_compute_family: u32,
    queue: vk::Queue,
    present_queue: vk::Queue,

    descriptor_pool: vk::DescriptorPool,
    bindless_layout: vk::DescriptorSetLayout,
    bindless_set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
    bindless_limits: BindlessLimits,
    uniform_count: u32,
    storage_count: u32,
    sampled_count: u32,
    storage_texture_count: u32,
    acceleration_structure_count: u32,

    #[cfg(feature = "validation")]
    debug_utils: Option<ash::ext::debug_utils::Device>,
    accel_loader: Option<ash::khr::acceleration_structure::Device>,

    frames: [FrameData; FRAME_IN_FLIGHT_COUNT],
    transfer: TransferData,

    swapchain: Option<Swapchain>,
    depth_texture: Option<Texture>,
    surface: Option<(ash::khr::surface::Instance, vk::SurfaceKHR)>,
    swapchain_loader: ash::khr::swapchain::Device,
    swapchain_recreate_requested: bool,
    swapchain_recreated_callback: Option<Box<dyn FnMut(u32, u32)>>,

    frame_index: usize,
}

impl Device {
    /// Creates a logical device on the given adapter, with a swapchain
    /// when the context has a surface.
    #[profiling::function]
    pub fn new(
        context: &Context,
        adapter_index: usize,
        desired_extent: vk::Extent2D,
    ) -> RhiResult<Self> {
        let adapter = context
            .adapters()
            .get(adapter_index)
            .ok_or_else(|| RhiError::Config(format!("no adapter at index {}", adapter_index)))?;
        let instance = context.instance();
        let physical_device = adapter.handle();
        let features = *context.requested_features();

        let graphics_compute_family = adapter.graphics_compute_family();
        let present_family = adapter.present_family();

        let mut queue_families: SmallVec<[u32; 2]> = SmallVec::new();
        queue_families.push(graphics_compute_family);
        if let Some(family) = present_family {
            if family != graphics_compute_family {
                queue_families.push(family);
            }
        }
        let priorities = [1.0f32];
        let queue_infos: SmallVec<[vk::DeviceQueueCreateInfo; 2]> = queue_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let enabled_features =
            vk::PhysicalDeviceFeatures::default().sampler_anisotropy(features.sampler_anisotropy);
        let mut v12 = vk::PhysicalDeviceVulkan12Features::default()
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_uniform_buffer_update_after_bind(true)
            .descriptor_binding_storage_buffer_update_after_bind(true)
            .descriptor_binding_sampled_image_update_after_bind(true)
            .descriptor_binding_storage_image_update_after_bind(true)
            .buffer_device_address(features.buffer_device_address || features.ray_tracing)
            .shader_sampled_image_array_non_uniform_indexing(true)
            .shader_storage_buffer_array_non_uniform_indexing(true);
        let mut v13 = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(true)
            .synchronization2(true);
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
        let mut ray_query_features =
            vk::PhysicalDeviceRayQueryFeaturesKHR::default().ray_query(true);

        let extensions: Vec<*const i8> = context
            .device_extensions()
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();

        let mut device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&enabled_features)
            .push_next(&mut v12)
            .push_next(&mut v13);
        if features.ray_tracing {
            device_info = device_info
                .push_next(&mut accel_features)
                .push_next(&mut ray_query_features);
        }

        let device = unsafe { instance.create_device(physical_device, &device_info, None) }?;
        let queue = unsafe { device.get_device_queue(graphics_compute_family, 0) };
        let present_queue = match present_family {
            Some(family) => unsafe { device.get_device_queue(family, 0) },
            None => queue,
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: features.buffer_device_address || features.ray_tracing,
            allocation_sizes: Default::default(),
        })
        .map_err(RhiError::Allocation)?;

        let bindless_limits = query_bindless_limits(instance, physical_device, &features);
        let (descriptor_pool, bindless_layout, bindless_set) =
            create_bindless_set(&device, &bindless_limits, features.ray_tracing)?;

        let push_constant_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::ALL)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE);
        let set_layouts = [bindless_layout];
        let push_constant_ranges = [push_constant_range];
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let pipeline_layout = unsafe { device.create_pipeline_layout(&layout_info, None) }?;

        #[cfg(feature = "validation")]
        let debug_utils = Some(ash::ext::debug_utils::Device::new(instance, &device));

        let accel_loader = features
            .ray_tracing
            .then(|| ash::khr::acceleration_structure::Device::new(instance, &device));

        let frames = [
            create_frame_data(
                &device,
                graphics_compute_family,
                pipeline_layout,
                bindless_set,
            )?,
            create_frame_data(
                &device,
                graphics_compute_family,
                pipeline_layout,
                bindless_set,
            )?,
        ];
        let transfer = create_transfer_data(
            &device,
            graphics_compute_family,
            pipeline_layout,
            bindless_set,
        )?;

        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);
        let surface = context
            .surface()
            .map(|s| (s.loader.clone(), s.handle));
        let swapchain = match &surface {
            Some((loader, handle)) => Some(Swapchain::new(
                swapchain_loader.clone(),
                loader,
                *handle,
                physical_device,
                &device,
                desired_extent,
                None,
            )?),
            None => None,
        };

        let name = adapter.name();
        log::info!("created device on {}", name);

        let mut device = Self {
            name,
            physical_device,
            device,
            limits: adapter.properties().limits,
            features,
            allocator: Some(allocator),
            graphics_compute_family,
            queue,
            present_queue,
            descriptor_pool,
            bindless_layout,
            bindless_set,
            pipeline_layout,
            bindless_limits,
            uniform_count: 0,
            storage_count: 0,
            sampled_count: 0,
            storage_texture_count: 0,
            acceleration_structure_count: 0,
            #[cfg(feature = "validation")]
            debug_utils,
            accel_loader,
            frames,
            transfer,
            swapchain,
            depth_texture: None,
            surface,
            swapchain_loader,
            swapchain_recreate_requested: false,
            swapchain_recreated_callback: None,
            frame_index: 0,
        };

        if let Some(extent) = device.swapchain.as_ref().map(|s| s.extent()) {
            device.depth_texture = Some(device.create_depth_texture(
                "swapchain depth",
                extent.width,
                extent.height,
                DEPTH_FORMAT,
            )?);
        }
        Ok(device)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn raw(&self) -> &ash::Device {
        &self.device
    }

    #[inline]
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    #[inline]
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.limits
    }

    #[inline]
    pub fn features(&self) -> &DeviceFeatures {
        &self.features
    }

    pub(crate) fn allocator_mut(&mut self) -> &mut Allocator {
        match self.allocator.as_mut() {
            Some(allocator) => allocator,
            None => unreachable!("allocator only detaches on drop"),
        }
    }

    #[inline]
    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    #[inline]
    pub fn bindless_set(&self) -> vk::DescriptorSet {
        self.bindless_set
    }

    #[inline]
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    #[inline]
    pub fn graphics_compute_family(&self) -> u32 {
        self.graphics_compute_family
    }

    pub(crate) fn accel_loader(&self) -> RhiResult<&ash::khr::acceleration_structure::Device> {
        self.accel_loader
            .as_ref()
            .ok_or_else(|| RhiError::Config("device created without ray tracing".into()))
    }

    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index
    }

    #[inline]
    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    /// The command buffer recording the current render frame.
    pub fn frame_command_buffer_mut(&mut self) -> &mut CommandBuffer {
        &mut self.frames[self.frame_index].command_buffer
    }

    pub fn current_swapchain_texture_mut(&mut self) -> Option<&mut Texture> {
        self.swapchain.as_mut().map(|s| s.current_texture_mut())
    }

    /// Depth texture matching the swapchain extent; rebuilt with it.
    #[inline]
    pub fn depth_texture(&self) -> Option<&Texture> {
        self.depth_texture.as_ref()
    }

    pub fn depth_texture_mut(&mut self) -> Option<&mut Texture> {
        self.depth_texture.as_mut()
    }

    /// Registered callback runs after every swapchain rebuild with the
    /// new extent, so callers can resize size-dependent resources.
    pub fn set_swapchain_recreated_callback(&mut self, callback: impl FnMut(u32, u32) + 'static) {
        self.swapchain_recreated_callback = Some(Box::new(callback));
    }

    #[inline]
    pub fn swapchain_recreate_requested(&self) -> bool {
        self.swapchain_recreate_requested
    }

    // ------------------------------------------------------------------
    // Render frame protocol
    // ------------------------------------------------------------------

    /// Starts a render frame: waits for this frame slot's previous
    /// submission, acquires a swapchain image and begins the frame
    /// command buffer with the swapchain image already transitioned to
    /// color attachment layout.
    ///
    /// Returns `Ok(false)` without starting the frame when the swapchain
    /// is out of date; the caller should call [`Self::recreate_swapchain`]
    /// and retry. A suboptimal acquire still runs the frame but raises
    /// the recreate request flag.
    #[profiling::function]
    pub fn begin_render_frame(&mut self) -> RhiResult<bool> {
        if self.swapchain.is_none() {
            return Err(RhiError::Config("begin_render_frame without a swapchain".into()));
        }

        let frame = &self.frames[self.frame_index];
        unsafe {
            self.device
                .wait_for_fences(&[frame.render_fence], true, u64::MAX)?;
        }

        let swapchain = match self.swapchain.as_mut() {
            Some(s) => s,
            None => unreachable!("checked above"),
        };
        match swapchain.acquire(frame.swapchain_semaphore) {
            Ok(suboptimal) => {
                if suboptimal {
                    self.swapchain_recreate_requested = true;
                }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.swapchain_recreate_requested = true;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let frame = &mut self.frames[self.frame_index];
        unsafe {
            self.device.reset_fences(&[frame.render_fence])?;
            self.device
                .reset_command_pool(frame.command_pool, vk::CommandPoolResetFlags::empty())?;
        }
        frame.command_buffer.set_state(CommandBufferState::Idle);
        frame
            .command_buffer
            .begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;

        // The acquired image starts undefined; move it straight to color
        // attachment layout so passes can render without caring.
        let swapchain = match self.swapchain.as_mut() {
            Some(s) => s,
            None => unreachable!("checked above"),
        };
        let texture = swapchain.current_texture_mut();
        let attachment_state = TextureState {
            stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let barrier = image_memory_barrier(
            texture.image(),
            vk::ImageAspectFlags::COLOR,
            texture.state,
            attachment_state,
        );
        texture.state = attachment_state;
        frame.command_buffer.pipeline_barrier(&[], &[barrier]);

        Ok(true)
    }

    /// Ends the render frame: transitions the swapchain image to present
    /// layout, submits the frame command buffer and presents.
    pub fn end_render_frame(&mut self) -> RhiResult<()> {
        self.end_render_frame_ext(&[], &[])
    }

    /// [`Self::end_render_frame`] with extra wait/signal semaphores
    /// attached to the frame submission.
    #[profiling::function]
    pub fn end_render_frame_ext(
        &mut self,
        extra_waits: &[(vk::Semaphore, vk::PipelineStageFlags2)],
        extra_signals: &[vk::Semaphore],
    ) -> RhiResult<()> {
        let frame = &mut self.frames[self.frame_index];
        let swapchain = self
            .swapchain
            .as_mut()
            .ok_or_else(|| RhiError::Config("end_render_frame without a swapchain".into()))?;

        let texture = swapchain.current_texture_mut();
        let present_state = TextureState {
            stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            access: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::PRESENT_SRC_KHR,
        };
        let barrier = image_memory_barrier(
            texture.image(),
            vk::ImageAspectFlags::COLOR,
            texture.state,
            present_state,
        );
        texture.state = present_state;
        frame.command_buffer.pipeline_barrier(&[], &[barrier]);
        frame.command_buffer.end()?;

        let mut wait_infos: SmallVec<[vk::SemaphoreSubmitInfo; 4]> = SmallVec::new();
        wait_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(frame.swapchain_semaphore)
                .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT),
        );
        for &(semaphore, stage) in extra_waits {
            wait_infos.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .stage_mask(stage),
            );
        }
        let mut signal_infos: SmallVec<[vk::SemaphoreSubmitInfo; 4]> = SmallVec::new();
        signal_infos.push(
            vk::SemaphoreSubmitInfo::default()
                .semaphore(frame.render_semaphore)
                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
        );
        for &semaphore in extra_signals {
            signal_infos.push(
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
            );
        }
        let command_buffer_infos = [vk::CommandBufferSubmitInfo::default()
            .command_buffer(frame.command_buffer.handle())];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&command_buffer_infos)
            .signal_semaphore_infos(&signal_infos);
        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit], frame.render_fence)?;
        }
        frame.command_buffer.set_state(CommandBufferState::Submitted);

        match swapchain.present(self.present_queue, frame.render_semaphore) {
            Ok(suboptimal) => {
                if suboptimal {
                    self.swapchain_recreate_requested = true;
                }
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.swapchain_recreate_requested = true;
            }
            Err(e) => return Err(e.into()),
        }

        self.frame_index = (self.frame_index + 1) % FRAME_IN_FLIGHT_COUNT;
        Ok(())
    }

    /// Rebuilds the swapchain, waiting for the device to go idle first.
    /// Runs the recreated callback with the new extent.
    #[profiling::function]
    pub fn recreate_swapchain(&mut self, desired_extent: vk::Extent2D) -> RhiResult<()> {
        let (surface_loader, surface_handle) = match &self.surface {
            Some((loader, handle)) => (loader.clone(), *handle),
            None => return Err(RhiError::Config("no surface to recreate from".into())),
        };
        let mut old = match self.swapchain.take() {
            Some(s) => s,
            None => return Err(RhiError::Config("no swapchain to recreate".into())),
        };

        unsafe {
            self.device.device_wait_idle()?;
        }

        let new = Swapchain::new(
            self.swapchain_loader.clone(),
            &surface_loader,
            surface_handle,
            self.physical_device,
            &self.device,
            desired_extent,
            Some(old.handle()),
        );
        old.destroy(&self.device);
        let new = new?;

        let extent = new.extent();
        log::info!("swapchain recreated at {}x{}", extent.width, extent.height);
        self.swapchain = Some(new);
        self.swapchain_recreate_requested = false;

        if let Some(mut depth) = self.depth_texture.take() {
            self.destroy_texture(&mut depth);
        }
        self.depth_texture = Some(self.create_depth_texture(
            "swapchain depth",
            extent.width,
            extent.height,
            DEPTH_FORMAT,
        )?);

        if let Some(mut callback) = self.swapchain_recreated_callback.take() {
            callback(extent.width, extent.height);
            self.swapchain_recreated_callback = Some(callback);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // One-time submits
    // ------------------------------------------------------------------

    /// Begins recording on the transfer command buffer. Finish with
    /// [`Self::end_transfer`], which submits and waits inline.
    pub fn begin_transfer(&mut self) -> RhiResult<()> {
        unsafe {
            self.device.reset_fences(&[self.transfer.fence])?;
            self.device.reset_command_pool(
                self.transfer.command_pool,
                vk::CommandPoolResetFlags::empty(),
            )?;
        }
        self.transfer.command_buffer.set_state(CommandBufferState::Idle);
        self.transfer
            .command_buffer
            .begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
    }

    pub fn transfer_command_buffer_mut(&mut self) -> &mut CommandBuffer {
        &mut self.transfer.command_buffer
    }

    /// Submits the transfer command buffer and blocks until the GPU has
    /// finished it.
    #[profiling::function]
    pub fn end_transfer(&mut self) -> RhiResult<()> {
        self.transfer.command_buffer.end()?;

        let command_buffer_infos = [vk::CommandBufferSubmitInfo::default()
            .command_buffer(self.transfer.command_buffer.handle())];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&command_buffer_infos);
        unsafe {
            self.device
                .queue_submit2(self.queue, &[submit], self.transfer.fence)?;
            self.device
                .wait_for_fences(&[self.transfer.fence], true, u64::MAX)?;
        }
        self.transfer
            .command_buffer
            .set_state(CommandBufferState::Submitted);
        Ok(())
    }

    pub fn wait_idle(&self) -> RhiResult<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bindless registration
    // ------------------------------------------------------------------

    pub(crate) fn register_uniform_buffer(
        &mut self,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> u32 {
        let index = self.uniform_count;
        assert!(index < self.bindless_limits.uniform_buffers);
        self.uniform_count += 1;

        let info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(0)
            .range(size);
        let infos = [info];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.bindless_set)
            .dst_binding(UNIFORM_BUFFER_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&infos);
        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
        index
    }

    pub(crate) fn register_storage_buffer(
        &mut self,
        buffer: vk::Buffer,
        size: vk::DeviceSize,
    ) -> u32 {
        let index = self.storage_count;
        assert!(index < self.bindless_limits.storage_buffers);
        self.storage_count += 1;

        let info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(0)
            .range(size);
        let infos = [info];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.bindless_set)
            .dst_binding(STORAGE_BUFFER_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&infos);
        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
        index
    }

    pub(crate) fn register_sampled_texture(
        &mut self,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> u32 {
        let index = self.sampled_count;
        assert!(index < self.bindless_limits.sampled_textures);
        self.sampled_count += 1;

        let info = vk::DescriptorImageInfo::default()
            .sampler(sampler)
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let infos = [info];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.bindless_set)
            .dst_binding(SAMPLED_TEXTURE_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&infos);
        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
        index
    }

    pub(crate) fn register_storage_texture(&mut self, view: vk::ImageView) -> u32 {
        let index = self.storage_texture_count;
        assert!(index < self.bindless_limits.storage_textures);
        self.storage_texture_count += 1;

        let info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::GENERAL);
        let infos = [info];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.bindless_set)
            .dst_binding(STORAGE_TEXTURE_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(&infos);
        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
        index
    }

    pub(crate) fn register_acceleration_structure(
        &mut self,
        acceleration_structure: vk::AccelerationStructureKHR,
    ) -> u32 {
        let index = self.acceleration_structure_count;
        assert!(index < self.bindless_limits.acceleration_structures);
        self.acceleration_structure_count += 1;

        let structures = [acceleration_structure];
        let mut accel_write = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&structures);
        let mut write = vk::WriteDescriptorSet::default()
            .dst_set(self.bindless_set)
            .dst_binding(ACCELERATION_STRUCTURE_BINDING)
            .dst_array_element(index)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut accel_write);
        // The acceleration structure count lives in the pNext struct.
        write.descriptor_count = 1;
        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
        index
    }

    // ------------------------------------------------------------------
    // Query pools
    // ------------------------------------------------------------------

    pub fn create_query_pool(&mut self, ty: vk::QueryType, count: u32) -> RhiResult<QueryPool> {
        let info = vk::QueryPoolCreateInfo::default().query_type(ty).query_count(count);
        let handle = unsafe { self.device.create_query_pool(&info, None) }?;
        Ok(QueryPool { handle, ty, count })
    }

    pub fn destroy_query_pool(&mut self, pool: &mut QueryPool) {
        if pool.handle == vk::QueryPool::null() {
            return;
        }
        unsafe {
            self.device.destroy_query_pool(pool.handle, None);
        }
        pool.handle = vk::QueryPool::null();
    }

    pub fn query_pool_results_u64(
        &self,
        pool: &QueryPool,
        first_query: u32,
        results: &mut [u64],
        flags: vk::QueryResultFlags,
    ) -> RhiResult<()> {
        unsafe {
            self.device.get_query_pool_results(
                pool.handle,
                first_query,
                results,
                flags | vk::QueryResultFlags::TYPE_64,
            )?;
        }
        Ok(())
    }

    /// Nanoseconds per timestamp tick.
    #[inline]
    pub fn timestamp_period(&self) -> f32 {
        self.limits.timestamp_period
    }

    // ------------------------------------------------------------------
    // Debug names
    // ------------------------------------------------------------------

    #[cfg(feature = "validation")]
    pub fn set_object_name<T: vk::Handle>(&self, handle: T, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name) = std::ffi::CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(handle)
            .object_name(&name);
        let _ = unsafe { debug_utils.set_debug_utils_object_name(&info) };
    }

    #[cfg(not(feature = "validation"))]
    pub fn set_object_name<T: vk::Handle>(&self, _handle: T, _name: &str) {}
}

impl Drop for Device {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }

        if let Some(mut depth) = self.depth_texture.take() {
            self.destroy_texture(&mut depth);
        }
        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.destroy(&self.device);
        }

        unsafe {
            for frame in &self.frames {
                self.device.destroy_semaphore(frame.swapchain_semaphore, None);
                self.device.destroy_semaphore(frame.render_semaphore, None);
                self.device.destroy_fence(frame.render_fence, None);
                self.device.destroy_command_pool(frame.command_pool, None);
            }
            self.device.destroy_fence(self.transfer.fence, None);
            self.device
                .destroy_command_pool(self.transfer.command_pool, None);

            self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.bindless_layout, None);
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
        }

        // The allocator's own drop reports leaks; it must go before the
        // device it allocates from.
        self.allocator = None;

        unsafe {
            self.device.destroy_device(None);
        }
    }
}

pub struct QueryPool {
    handle: vk::QueryPool,
    ty: vk::QueryType,
    count: u32,
}

impl QueryPool {
    #[inline]
    pub fn handle(&self) -> vk::QueryPool {
        self.handle
    }

    #[inline]
    pub fn query_type(&self) -> vk::QueryType {
        self.ty
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }
}

fn query_bindless_limits(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    features: &DeviceFeatures,
) -> BindlessLimits {
    let mut v12_props = vk::PhysicalDeviceVulkan12Properties::default();
    let mut accel_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut v12_props);
    if features.ray_tracing {
        props2 = props2.push_next(&mut accel_props);
    }
    unsafe {
        instance.get_physical_device_properties2(physical_device, &mut props2);
    }

    BindlessLimits {
        uniform_buffers: DESCRIPTOR_MAX_COUNT
            .min(v12_props.max_per_stage_descriptor_update_after_bind_uniform_buffers),
        storage_buffers: DESCRIPTOR_MAX_COUNT
            .min(v12_props.max_per_stage_descriptor_update_after_bind_storage_buffers),
        sampled_textures: DESCRIPTOR_MAX_COUNT
            .min(v12_props.max_per_stage_descriptor_update_after_bind_sampled_images),
        storage_textures: DESCRIPTOR_MAX_COUNT
            .min(v12_props.max_per_stage_descriptor_update_after_bind_storage_images),
        acceleration_structures: if features.ray_tracing {
            DESCRIPTOR_MAX_COUNT.min(
                accel_props.max_per_stage_descriptor_update_after_bind_acceleration_structures,
            )
        } else {
            0
        },
    }
}

fn create_bindless_set(
    device: &ash::Device,
    limits: &BindlessLimits,
    ray_tracing: bool,
) -> RhiResult<(vk::DescriptorPool, vk::DescriptorSetLayout, vk::DescriptorSet)> {
    let mut pool_sizes: SmallVec<[vk::DescriptorPoolSize; 5]> = SmallVec::new();
    let mut bindings: SmallVec<[vk::DescriptorSetLayoutBinding; 5]> = SmallVec::new();
    let mut binding_flags: SmallVec<[vk::DescriptorBindingFlags; 5]> = SmallVec::new();

    let mut add = |binding: u32, ty: vk::DescriptorType, count: u32| {
        pool_sizes.push(vk::DescriptorPoolSize {
            ty,
            descriptor_count: count,
        });
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(count)
                .stage_flags(vk::ShaderStageFlags::ALL),
        );
        binding_flags.push(
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND,
        );
    };
    add(
        UNIFORM_BUFFER_BINDING,
        vk::DescriptorType::UNIFORM_BUFFER,
        limits.uniform_buffers,
    );
    add(
        STORAGE_BUFFER_BINDING,
        vk::DescriptorType::STORAGE_BUFFER,
        limits.storage_buffers,
    );
    add(
        SAMPLED_TEXTURE_BINDING,
        vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        limits.sampled_textures,
    );
    add(
        STORAGE_TEXTURE_BINDING,
        vk::DescriptorType::STORAGE_IMAGE,
        limits.storage_textures,
    );
    if ray_tracing {
        add(
            ACCELERATION_STRUCTURE_BINDING,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            limits.acceleration_structures,
        );
    }

    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
        .max_sets(1)
        .pool_sizes(&pool_sizes);
    let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }?;

    let mut flags_info =
        vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(&binding_flags);
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
        .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
        .bindings(&bindings)
        .push_next(&mut flags_info);
    let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }?;

    let layouts = [layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&layouts);
    let set = unsafe { device.allocate_descriptor_sets(&alloc_info) }?[0];

    Ok((pool, layout, set))
}

fn create_frame_data(
    device: &ash::Device,
    queue_family: u32,
    pipeline_layout: vk::PipelineLayout,
    bindless_set: vk::DescriptorSet,
) -> RhiResult<FrameData> {
    let (command_pool, command_buffer) =
        create_pool_and_buffer(device, queue_family, pipeline_layout, bindless_set)?;

    let semaphore_info = vk::SemaphoreCreateInfo::default();
    let swapchain_semaphore = unsafe { device.create_semaphore(&semaphore_info, None) }?;
    let render_semaphore = unsafe { device.create_semaphore(&semaphore_info, None) }?;

    // Signaled so the first frame's wait passes immediately.
    let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
    let render_fence = unsafe { device.create_fence(&fence_info, None) }?;

    Ok(FrameData {
        command_pool,
        command_buffer,
        swapchain_semaphore,
        render_semaphore,
        render_fence,
    })
}

fn create_transfer_data(
    device: &ash::Device,
    queue_family: u32,
    pipeline_layout: vk::PipelineLayout,
    bindless_set: vk::DescriptorSet,
) -> RhiResult<TransferData> {
    let (command_pool, command_buffer) =
        create_pool_and_buffer(device, queue_family, pipeline_layout, bindless_set)?;
    let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }?;
    Ok(TransferData {
        command_pool,
        command_buffer,
        fence,
    })
}

fn create_pool_and_buffer(
    device: &ash::Device,
    queue_family: u32,
    pipeline_layout: vk::PipelineLayout,
    bindless_set: vk::DescriptorSet,
) -> RhiResult<(vk::CommandPool, CommandBuffer)> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .flags(
            vk::CommandPoolCreateFlags::TRANSIENT
                | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
        .queue_family_index(queue_family);
    let command_pool = unsafe { device.create_command_pool(&pool_info, None) }?;

    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let handle = unsafe { device.allocate_command_buffers(&alloc_info) }?[0];

    Ok((
        command_pool,
        CommandBuffer::new(device.clone(), handle, pipeline_layout, bindless_set),
    ))
}
