//! Resource descriptors declared by pass build callbacks.

use ash::vk;
use ember_rhi::sampler::{FilterMode, WrapMode};

/// Caller-chosen identifier for a declared resource. Handles are shared
/// across passes; a [`ResourceDescriptor::Reference`] in one pass names
/// a handle declared by another.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceAccess {
    Read,
    Write,
    ReadWrite,
}

/// What a pass declares about one resource it touches.
pub enum ResourceDescriptor {
    /// Graph-owned buffer, optionally pre-filled.
    Buffer {
        usage: vk::BufferUsageFlags,
        host_visible: bool,
        data: Option<Vec<u8>>,
        size: vk::DeviceSize,
        access: ResourceAccess,
    },
    /// Graph-owned 2D texture.
    Texture2D {
        usage: vk::ImageUsageFlags,
        width: u32,
        height: u32,
        format: vk::Format,
        filter: FilterMode,
        wrap: WrapMode,
        access: ResourceAccess,
    },
    /// Render attachment over an externally owned image view.
    Attachment {
        view: vk::ImageView,
        layout: vk::ImageLayout,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        clear_value: vk::ClearValue,
    },
    /// Color attachment bound to the current frame's swapchain image,
    /// resolved at execute time.
    SwapchainAttachment {
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        clear_value: vk::ClearValue,
    },
    /// Use of a resource declared by another pass; creates an ordering
    /// edge from the declaring pass to this one.
    Reference {
        handle: ResourceHandle,
        access: ResourceAccess,
    },
}

impl ResourceDescriptor {
    /// Whether this descriptor declares storage the graph must create.
    pub fn is_graph_owned(&self) -> bool {
        matches!(
            self,
            ResourceDescriptor::Buffer { .. } | ResourceDescriptor::Texture2D { .. }
        )
    }

    pub fn is_attachment(&self) -> bool {
        matches!(
            self,
            ResourceDescriptor::Attachment { .. } | ResourceDescriptor::SwapchainAttachment { .. }
        )
    }
}

/// Access flags a buffer use maps to, from its usage and declared
/// access direction.
pub fn buffer_access_flags(
    usage: vk::BufferUsageFlags,
    access: ResourceAccess,
) -> vk::AccessFlags2 {
    let mut flags = vk::AccessFlags2::NONE;
    let reads = !matches!(access, ResourceAccess::Write);
    let writes = !matches!(access, ResourceAccess::Read);

    if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) && reads {
        flags |= vk::AccessFlags2::UNIFORM_READ;
    }
    if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
        if reads {
            flags |= vk::AccessFlags2::SHADER_STORAGE_READ;
        }
        if writes {
            flags |= vk::AccessFlags2::SHADER_STORAGE_WRITE;
        }
    }
    if usage.contains(vk::BufferUsageFlags::INDIRECT_BUFFER) && reads {
        flags |= vk::AccessFlags2::INDIRECT_COMMAND_READ;
    }
    if usage.contains(vk::BufferUsageFlags::INDEX_BUFFER) && reads {
        flags |= vk::AccessFlags2::INDEX_READ;
    }
    if flags == vk::AccessFlags2::NONE {
        // Plain transfer use.
        if reads {
            flags |= vk::AccessFlags2::TRANSFER_READ;
        }
        if writes {
            flags |= vk::AccessFlags2::TRANSFER_WRITE;
        }
    }
    flags
}

/// Layout and access a texture use maps to. Reads sample; writes go
/// through storage image access in general layout.
pub fn texture_layout_access(access: ResourceAccess) -> (vk::ImageLayout, vk::AccessFlags2) {
    match access {
        ResourceAccess::Read => (
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::AccessFlags2::SHADER_SAMPLED_READ,
        ),
        ResourceAccess::Write => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags2::SHADER_STORAGE_WRITE,
        ),
        ResourceAccess::ReadWrite => (
            vk::ImageLayout::GENERAL,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_buffer_reads_and_writes() {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER;
        assert_eq!(
            buffer_access_flags(usage, ResourceAccess::Read),
            vk::AccessFlags2::SHADER_STORAGE_READ
        );
        assert_eq!(
            buffer_access_flags(usage, ResourceAccess::Write),
            vk::AccessFlags2::SHADER_STORAGE_WRITE
        );
        assert_eq!(
            buffer_access_flags(usage, ResourceAccess::ReadWrite),
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE
        );
    }

    #[test]
    fn indirect_storage_buffer_read_includes_indirect_args() {
        let usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::INDIRECT_BUFFER;
        let flags = buffer_access_flags(usage, ResourceAccess::Read);
        assert!(flags.contains(vk::AccessFlags2::INDIRECT_COMMAND_READ));
        assert!(flags.contains(vk::AccessFlags2::SHADER_STORAGE_READ));
    }

    #[test]
    fn transfer_only_buffer_falls_back_to_transfer_access() {
        let flags = buffer_access_flags(vk::BufferUsageFlags::TRANSFER_DST, ResourceAccess::Write);
        assert_eq!(flags, vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn texture_read_samples_and_write_is_general() {
        let (layout, access) = texture_layout_access(ResourceAccess::Read);
        assert_eq!(layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(access, vk::AccessFlags2::SHADER_SAMPLED_READ);

        let (layout, access) = texture_layout_access(ResourceAccess::ReadWrite);
        assert_eq!(layout, vk::ImageLayout::GENERAL);
        assert!(access.contains(vk::AccessFlags2::SHADER_STORAGE_WRITE));
    }
}
