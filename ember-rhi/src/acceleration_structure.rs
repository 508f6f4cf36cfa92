//! Ray tracing acceleration structures.
//!
//! Bottom and top level structures are built synchronously on the
//! transfer cell. When the build flags allow compaction, the build is
//! followed by a compacted-size query and a copy into a right-sized
//! structure; the oversized originals are destroyed. Top level
//! structures register themselves in the bindless set.

use ash::vk;
use ember_core::log;
use ember_core::thread_context::with_thread_context;

use crate::buffer::{Buffer, BufferDesc};
use crate::device::{BINDLESS_HANDLE_INVALID, Device};
use crate::error::RhiResult;

pub struct AccelerationStructureDesc<'a> {
    pub name: &'a str,
    pub ty: vk::AccelerationStructureTypeKHR,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub geometries: &'a [vk::AccelerationStructureGeometryKHR<'a>],
    pub range_infos: &'a [vk::AccelerationStructureBuildRangeInfoKHR],
}

pub struct AccelerationStructure {
    handle: vk::AccelerationStructureKHR,
    buffer: Buffer,
    address: vk::DeviceAddress,
    ty: vk::AccelerationStructureTypeKHR,
    bindless_handle: u32,
}

impl AccelerationStructure {
    #[inline]
    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.handle
    }

    /// GPU address used to reference bottom level structures from
    /// instance buffers.
    #[inline]
    pub fn address(&self) -> vk::DeviceAddress {
        self.address
    }

    #[inline]
    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        self.ty
    }

    /// Bindless index of a top level structure, or
    /// [`BINDLESS_HANDLE_INVALID`] for bottom level ones.
    #[inline]
    pub fn bindless_handle(&self) -> u32 {
        self.bindless_handle
    }
}

impl Device {
    #[profiling::function]
    pub fn create_acceleration_structure(
        &mut self,
        desc: &AccelerationStructureDesc,
    ) -> RhiResult<AccelerationStructure> {
        let loader = self.accel_loader()?.clone();
        assert_eq!(desc.geometries.len(), desc.range_infos.len());

        // Build size query wants max primitive counts as a plain array.
        let sizes = with_thread_context(|ctx| {
            let arena = ctx.scratch();
            let marker = arena.marker();
            let counts = arena.push::<u32>(desc.range_infos.len());
            let counts = unsafe {
                for (i, range) in desc.range_infos.iter().enumerate() {
                    counts.as_ptr().add(i).write(range.primitive_count);
                }
                std::slice::from_raw_parts(counts.as_ptr(), desc.range_infos.len())
            };

            let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(desc.ty)
                .flags(desc.flags)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(desc.geometries);
            let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
            unsafe {
                loader.get_acceleration_structure_build_sizes(
                    vk::AccelerationStructureBuildTypeKHR::DEVICE,
                    &build_info,
                    counts,
                    &mut sizes,
                );
            }
            arena.pop_to_marker(marker);
            sizes
        });

        let mut scratch = self.create_buffer(&BufferDesc {
            name: "acceleration structure scratch",
            size: sizes.build_scratch_size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ..Default::default()
        })?;

        let (handle, buffer) =
            self.create_structure_storage(desc, sizes.acceleration_structure_size, &loader)?;

        let compacted = desc
            .flags
            .contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION);
        let (handle, buffer) = if compacted {
            self.build_and_compact(desc, &loader, handle, buffer, &scratch)?
        } else {
            self.build_structure(desc, &loader, handle, &scratch)?;
            (handle, buffer)
        };

        self.destroy_buffer(&mut scratch);

        let address = unsafe {
            loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(handle),
            )
        };

        let bindless_handle = if desc.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            self.register_acceleration_structure(handle)
        } else {
            BINDLESS_HANDLE_INVALID
        };

        Ok(AccelerationStructure {
            handle,
            buffer,
            address,
            ty: desc.ty,
            bindless_handle,
        })
    }

    fn create_structure_storage(
        &mut self,
        desc: &AccelerationStructureDesc,
        size: vk::DeviceSize,
        loader: &ash::khr::acceleration_structure::Device,
    ) -> RhiResult<(vk::AccelerationStructureKHR, Buffer)> {
        let buffer = self.create_buffer(&BufferDesc {
            name: desc.name,
            size,
            usage: vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            ..Default::default()
        })?;

        let info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle())
            .offset(0)
            .size(size)
            .ty(desc.ty);
        let handle = unsafe { loader.create_acceleration_structure(&info, None) }?;
        Ok((handle, buffer))
    }

    fn build_structure(
        &mut self,
        desc: &AccelerationStructureDesc,
        loader: &ash::khr::acceleration_structure::Device,
        dst: vk::AccelerationStructureKHR,
        scratch: &Buffer,
    ) -> RhiResult<()> {
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(desc.ty)
            .flags(desc.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(dst)
            .geometries(desc.geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.device_address(),
            });

        self.begin_transfer()?;
        unsafe {
            loader.cmd_build_acceleration_structures(
                self.transfer_command_buffer_mut().handle(),
                &[build_info],
                &[desc.range_infos],
            );
        }
        self.end_transfer()
    }

    /// Builds into the oversized structure, reads back the compacted
    /// size and copies into a right-sized replacement.
    fn build_and_compact(
        &mut self,
        desc: &AccelerationStructureDesc,
        loader: &ash::khr::acceleration_structure::Device,
        handle: vk::AccelerationStructureKHR,
        mut buffer: Buffer,
        scratch: &Buffer,
    ) -> RhiResult<(vk::AccelerationStructureKHR, Buffer)> {
        let mut query_pool = self
            .create_query_pool(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR, 1)?;

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(desc.ty)
            .flags(desc.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(handle)
            .geometries(desc.geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.device_address(),
            });

        self.begin_transfer()?;
        {
            let cmd = self.transfer_command_buffer_mut();
            cmd.reset_query_pool(query_pool.handle(), 0, 1);
            let cmd_handle = cmd.handle();
            unsafe {
                loader.cmd_build_acceleration_structures(
                    cmd_handle,
                    &[build_info],
                    &[desc.range_infos],
                );
            }
            // The size query reads the freshly built structure.
            cmd.memory_barrier(
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
            );
            unsafe {
                loader.cmd_write_acceleration_structures_properties(
                    cmd_handle,
                    &[handle],
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    query_pool.handle(),
                    0,
                );
            }
        }
        self.end_transfer()?;

        let mut compacted_size = [0u64];
        self.query_pool_results_u64(
            &query_pool,
            0,
            &mut compacted_size,
            vk::QueryResultFlags::WAIT,
        )?;
        self.destroy_query_pool(&mut query_pool);
        log::debug!(
            "{}: compacting {} -> {} bytes",
            desc.name,
            buffer.size(),
            compacted_size[0]
        );

        let (compact_handle, compact_buffer) =
            self.create_structure_storage(desc, compacted_size[0], loader)?;

        self.begin_transfer()?;
        unsafe {
            loader.cmd_copy_acceleration_structure(
                self.transfer_command_buffer_mut().handle(),
                &vk::CopyAccelerationStructureInfoKHR::default()
                    .src(handle)
                    .dst(compact_handle)
                    .mode(vk::CopyAccelerationStructureModeKHR::COMPACT),
            );
        }
        self.end_transfer()?;

        unsafe {
            loader.destroy_acceleration_structure(handle, None);
        }
        self.destroy_buffer(&mut buffer);

        Ok((compact_handle, compact_buffer))
    }

    pub fn destroy_acceleration_structure(&mut self, structure: &mut AccelerationStructure) {
        if structure.handle == vk::AccelerationStructureKHR::null() {
            return;
        }
        if let Ok(loader) = self.accel_loader() {
            let loader = loader.clone();
            unsafe {
                loader.destroy_acceleration_structure(structure.handle, None);
            }
        }
        structure.handle = vk::AccelerationStructureKHR::null();
        self.destroy_buffer(&mut structure.buffer);
        structure.bindless_handle = BINDLESS_HANDLE_INVALID;
    }
}
