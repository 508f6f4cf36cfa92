//! Buffer resources.
//!
//! Buffers are created through the [`Device`] and registered in the
//! bindless descriptor set according to their usage. Host visible buffers
//! are written through a persistent mapping; device local buffers go
//! through a staging copy on the transfer command buffer.

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};

use crate::barrier::BufferState;
use crate::device::{BINDLESS_HANDLE_INVALID, Device};
use crate::error::{RhiError, RhiResult};

pub struct BufferDesc<'a> {
    pub name: &'a str,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub host_visible: bool,
    pub data: Option<&'a [u8]>,
}

impl Default for BufferDesc<'_> {
    fn default() -> Self {
        Self {
            name: "buffer",
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            host_visible: false,
            data: None,
        }
    }
}

pub struct Buffer {
    handle: vk::Buffer,
    allocation: Option<Allocation>,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    host_visible: bool,
    device_address: vk::DeviceAddress,
    pub(crate) state: BufferState,
    uniform_handle: u32,
    storage_handle: u32,
}

impl Buffer {
    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    #[inline]
    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    /// GPU virtual address, zero unless created with
    /// `SHADER_DEVICE_ADDRESS` usage.
    #[inline]
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    #[inline]
    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Bindless index in the uniform buffer array, or
    /// [`BINDLESS_HANDLE_INVALID`].
    #[inline]
    pub fn uniform_handle(&self) -> u32 {
        self.uniform_handle
    }

    /// Bindless index in the storage buffer array, or
    /// [`BINDLESS_HANDLE_INVALID`].
    #[inline]
    pub fn storage_handle(&self) -> u32 {
        self.storage_handle
    }

    /// Persistent mapping of a host visible buffer.
    pub fn mapped_ptr(&self) -> Option<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .map(|p| p.as_ptr().cast())
    }
}

impl Device {
    pub fn create_buffer(&mut self, desc: &BufferDesc) -> RhiResult<Buffer> {
        let data_size = desc.data.map_or(0, |d| d.len() as vk::DeviceSize);
        let size = desc.size.max(data_size);
        assert!(size > 0, "buffer created with zero size");

        let usage = desc.usage | vk::BufferUsageFlags::TRANSFER_DST;
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = unsafe { self.raw().create_buffer(&info, None) }?;

        let requirements = unsafe { self.raw().get_buffer_memory_requirements(handle) };
        let location = if desc.host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = self.allocator_mut().allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        unsafe {
            self.raw()
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())?;
        }

        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let info = vk::BufferDeviceAddressInfo::default().buffer(handle);
            unsafe { self.raw().get_buffer_device_address(&info) }
        } else {
            0
        };

        let mut buffer = Buffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            host_visible: desc.host_visible,
            device_address,
            state: BufferState::default(),
            uniform_handle: BINDLESS_HANDLE_INVALID,
            storage_handle: BINDLESS_HANDLE_INVALID,
        };

        if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            buffer.uniform_handle = self.register_uniform_buffer(handle, size);
        }
        if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
            buffer.storage_handle = self.register_storage_buffer(handle, size);
        }

        if let Some(data) = desc.data {
            self.write_buffer(&mut buffer, data, 0)?;
        }
        Ok(buffer)
    }

    pub fn create_uniform_buffer(&mut self, name: &str, data: &[u8]) -> RhiResult<Buffer> {
        self.create_buffer(&BufferDesc {
            name,
            usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
            host_visible: true,
            data: Some(data),
            ..Default::default()
        })
    }

    pub fn create_storage_buffer(&mut self, name: &str, size: vk::DeviceSize) -> RhiResult<Buffer> {
        self.create_buffer(&BufferDesc {
            name,
            size,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            ..Default::default()
        })
    }

    pub fn create_index_buffer(&mut self, name: &str, data: &[u8]) -> RhiResult<Buffer> {
        self.create_buffer(&BufferDesc {
            name,
            usage: vk::BufferUsageFlags::INDEX_BUFFER,
            data: Some(data),
            ..Default::default()
        })
    }

    pub fn create_indirect_buffer(&mut self, name: &str, size: vk::DeviceSize) -> RhiResult<Buffer> {
        self.create_buffer(&BufferDesc {
            name,
            size,
            usage: vk::BufferUsageFlags::INDIRECT_BUFFER | vk::BufferUsageFlags::STORAGE_BUFFER,
            ..Default::default()
        })
    }

    /// Writes `data` into `buffer` at `offset`. Host visible buffers are
    /// written through the mapping; device local buffers go through a
    /// staging copy that completes before this returns.
    pub fn write_buffer(
        &mut self,
        buffer: &mut Buffer,
        data: &[u8],
        offset: vk::DeviceSize,
    ) -> RhiResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if offset + data.len() as vk::DeviceSize > buffer.size {
            return Err(RhiError::Upload(format!(
                "write of {} bytes at offset {} exceeds buffer size {}",
                data.len(),
                offset,
                buffer.size
            )));
        }

        if buffer.host_visible {
            let base = buffer
                .mapped_ptr()
                .ok_or_else(|| RhiError::Upload("host visible buffer has no mapping".into()))?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    base.add(offset as usize),
                    data.len(),
                );
            }
            return Ok(());
        }

        let mut staging = self.create_buffer(&BufferDesc {
            name: "staging",
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            host_visible: true,
            data: Some(data),
            ..Default::default()
        })?;

        self.begin_transfer()?;
        self.transfer_command_buffer_mut().copy_buffer(
            &staging,
            0,
            buffer,
            offset,
            data.len() as vk::DeviceSize,
        );
        self.end_transfer()?;

        buffer.state = BufferState {
            stage: vk::PipelineStageFlags2::TRANSFER,
            access: vk::AccessFlags2::TRANSFER_WRITE,
        };

        self.destroy_buffer(&mut staging);
        Ok(())
    }

    /// Destroys a buffer. Safe to call more than once; bindless slots are
    /// never recycled, so its handles simply go stale.
    pub fn destroy_buffer(&mut self, buffer: &mut Buffer) {
        if buffer.handle == vk::Buffer::null() {
            return;
        }
        if let Some(allocation) = buffer.allocation.take() {
            // Freeing can only fail for allocations this allocator does
            // not own; ours always came from it.
            let _ = self.allocator_mut().free(allocation);
        }
        unsafe {
            self.raw().destroy_buffer(buffer.handle, None);
        }
        buffer.handle = vk::Buffer::null();
        buffer.uniform_handle = BINDLESS_HANDLE_INVALID;
        buffer.storage_handle = BINDLESS_HANDLE_INVALID;
    }
}
