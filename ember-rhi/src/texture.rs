//! Texture resources.
//!
//! Covers 2D sampled textures, read-write (storage) textures, cubemaps
//! and depth targets. Every texture tracks its current layout, stage and
//! access so the execution wrappers can derive barriers, and registers
//! its views in the bindless set according to usage.

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};

use crate::barrier::{TextureState, aspect_mask_for_format, image_memory_barrier};
use crate::buffer::BufferDesc;
use crate::device::{BINDLESS_HANDLE_INVALID, Device};
use crate::error::{RhiError, RhiResult};
use crate::sampler::{FilterMode, Sampler, WrapMode};

pub const CUBEMAP_LAYER_COUNT: u32 = 6;

pub struct TextureDesc<'a> {
    pub name: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub mip_count: u32,
    pub filter: FilterMode,
    pub wrap: WrapMode,
    pub data: Option<&'a [u8]>,
}

impl Default for TextureDesc<'_> {
    fn default() -> Self {
        Self {
            name: "texture",
            width: 1,
            height: 1,
            format: vk::Format::R8G8B8A8_SRGB,
            mip_count: 1,
            filter: FilterMode::default(),
            wrap: WrapMode::default(),
            data: None,
        }
    }
}

pub struct Texture {
    image: vk::Image,
    view: vk::ImageView,
    /// 2D array view over all layers, present on cubemaps for use as a
    /// render target.
    array_view: vk::ImageView,
    sampler: Option<Sampler>,
    format: vk::Format,
    width: u32,
    height: u32,
    mip_count: u32,
    layer_count: u32,
    allocation: Option<Allocation>,
    /// Image owned elsewhere (swapchain); destroy leaves it alone.
    external: bool,
    pub(crate) state: TextureState,
    sampled_handle: u32,
    storage_handle: u32,
}

impl Texture {
    #[inline]
    pub fn image(&self) -> vk::Image {
        self.image
    }

    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// The render-target view: the array view when present, otherwise the
    /// default view.
    #[inline]
    pub fn attachment_view(&self) -> vk::ImageView {
        if self.array_view != vk::ImageView::null() {
            self.array_view
        } else {
            self.view
        }
    }

    #[inline]
    pub fn sampler(&self) -> Option<&Sampler> {
        self.sampler.as_ref()
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn mip_count(&self) -> u32 {
        self.mip_count
    }

    #[inline]
    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    #[inline]
    pub fn state(&self) -> TextureState {
        self.state
    }

    #[inline]
    pub fn sampled_handle(&self) -> u32 {
        self.sampled_handle
    }

    #[inline]
    pub fn storage_handle(&self) -> u32 {
        self.storage_handle
    }

    pub(crate) fn from_swapchain_image(
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            image,
            view,
            array_view: vk::ImageView::null(),
            sampler: None,
            format,
            width,
            height,
            mip_count: 1,
            layer_count: 1,
            allocation: None,
            external: true,
            state: TextureState::default(),
            sampled_handle: BINDLESS_HANDLE_INVALID,
            storage_handle: BINDLESS_HANDLE_INVALID,
        }
    }
}

/// Number of mip levels of a full chain for the given extent.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Bytes per texel block and block edge length for the formats the
/// engine cooks. `None` for formats with no defined packing here.
pub fn format_block_info(format: vk::Format) -> Option<(u32, u32)> {
    let info = match format {
        vk::Format::BC1_RGB_SRGB_BLOCK
        | vk::Format::BC1_RGB_UNORM_BLOCK
        | vk::Format::BC1_RGBA_SRGB_BLOCK
        | vk::Format::BC1_RGBA_UNORM_BLOCK
        | vk::Format::BC4_UNORM_BLOCK
        | vk::Format::BC4_SNORM_BLOCK => (8, 4),
        vk::Format::BC3_SRGB_BLOCK
        | vk::Format::BC3_UNORM_BLOCK
        | vk::Format::BC5_UNORM_BLOCK
        | vk::Format::BC5_SNORM_BLOCK => (16, 4),
        vk::Format::R8_UNORM => (1, 1),
        vk::Format::R8G8_UNORM => (2, 1),
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB | vk::Format::B8G8R8A8_SRGB => {
            (4, 1)
        }
        vk::Format::R16G16B16A16_SFLOAT => (8, 1),
        vk::Format::R32G32_SFLOAT => (8, 1),
        vk::Format::R32G32B32A32_SFLOAT => (16, 1),
        vk::Format::D32_SFLOAT => (4, 1),
        _ => return None,
    };
    Some(info)
}

/// Size in bytes of one mip level of one layer.
pub fn mip_data_size(format: vk::Format, width: u32, height: u32, mip: u32) -> Option<u64> {
    let (block_bytes, block_dim) = format_block_info(format)?;
    let w = (width >> mip).max(1);
    let h = (height >> mip).max(1);
    let blocks_x = w.div_ceil(block_dim) as u64;
    let blocks_y = h.div_ceil(block_dim) as u64;
    Some(blocks_x * blocks_y * block_bytes as u64)
}

/// Total tightly packed size of a full upload: mip-major, layers
/// consecutive within each mip.
pub fn texture_data_size(
    format: vk::Format,
    width: u32,
    height: u32,
    mip_count: u32,
    layer_count: u32,
) -> Option<u64> {
    let mut total = 0;
    for mip in 0..mip_count {
        total += mip_data_size(format, width, height, mip)? * layer_count as u64;
    }
    Some(total)
}

impl Device {
    /// A 2D sampled texture, optionally pre-filled from tightly packed
    /// mip data. Left in `TRANSFER_DST_OPTIMAL` after an upload.
    pub fn create_texture_2d(&mut self, desc: &TextureDesc) -> RhiResult<Texture> {
        let usage = vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC;
        let mut texture = self.create_texture_internal(desc, usage, 1, false)?;

        texture.sampled_handle = self.register_sampled_texture(
            texture.view,
            match texture.sampler.as_ref() {
                Some(s) => s.handle(),
                None => vk::Sampler::null(),
            },
        );

        if let Some(data) = desc.data {
            self.upload_texture_data(&mut texture, data)?;
        }
        Ok(texture)
    }

    /// A storage texture that is also sampleable; registered in both
    /// bindless arrays.
    pub fn create_read_write_texture(&mut self, desc: &TextureDesc) -> RhiResult<Texture> {
        let usage = vk::ImageUsageFlags::STORAGE
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC;
        let mut texture = self.create_texture_internal(desc, usage, 1, false)?;

        texture.sampled_handle = self.register_sampled_texture(
            texture.view,
            match texture.sampler.as_ref() {
                Some(s) => s.handle(),
                None => vk::Sampler::null(),
            },
        );
        texture.storage_handle = self.register_storage_texture(texture.view);
        Ok(texture)
    }

    /// A cubemap with a cube view for sampling and a 2D array view over
    /// the 6 faces for rendering.
    pub fn create_cubemap(&mut self, desc: &TextureDesc) -> RhiResult<Texture> {
        let usage = vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_DST
            | vk::ImageUsageFlags::TRANSFER_SRC;
        let mut texture = self.create_texture_internal(desc, usage, CUBEMAP_LAYER_COUNT, true)?;

        texture.sampled_handle = self.register_sampled_texture(
            texture.view,
            match texture.sampler.as_ref() {
                Some(s) => s.handle(),
                None => vk::Sampler::null(),
            },
        );

        if let Some(data) = desc.data {
            self.upload_texture_data(&mut texture, data)?;
        }
        Ok(texture)
    }

    pub fn create_depth_texture(
        &mut self,
        name: &str,
        width: u32,
        height: u32,
        format: vk::Format,
    ) -> RhiResult<Texture> {
        let desc = TextureDesc {
            name,
            width,
            height,
            format,
            mip_count: 1,
            ..Default::default()
        };
        self.create_texture_internal(
            &desc,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            1,
            false,
        )
    }

    fn create_texture_internal(
        &mut self,
        desc: &TextureDesc,
        usage: vk::ImageUsageFlags,
        layer_count: u32,
        cube_compatible: bool,
    ) -> RhiResult<Texture> {
        assert!(desc.width > 0 && desc.height > 0);
        assert!(desc.mip_count >= 1 && desc.mip_count <= mip_level_count(desc.width, desc.height));

        let flags = if cube_compatible {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_count)
            .array_layers(layer_count)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.raw().create_image(&info, None) }?;

        let requirements = unsafe { self.raw().get_image_memory_requirements(image) };
        let allocation = self.allocator_mut().allocate(&AllocationCreateDesc {
            name: desc.name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        unsafe {
            self.raw()
                .bind_image_memory(image, allocation.memory(), allocation.offset())?;
        }

        let aspect_mask = aspect_mask_for_format(desc.format);
        let full_range = vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: desc.mip_count,
            base_array_layer: 0,
            layer_count,
        };

        let view_type = if cube_compatible {
            vk::ImageViewType::CUBE
        } else {
            vk::ImageViewType::TYPE_2D
        };
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(desc.format)
            .subresource_range(full_range);
        let view = unsafe { self.raw().create_image_view(&view_info, None) }?;

        let array_view = if cube_compatible {
            let array_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D_ARRAY)
                .format(desc.format)
                .subresource_range(full_range);
            unsafe { self.raw().create_image_view(&array_info, None) }?
        } else {
            vk::ImageView::null()
        };

        let sampler = if usage.contains(vk::ImageUsageFlags::SAMPLED) {
            Some(self.create_sampler(desc.filter, desc.wrap, desc.mip_count)?)
        } else {
            None
        };

        Ok(Texture {
            image,
            view,
            array_view,
            sampler,
            format: desc.format,
            width: desc.width,
            height: desc.height,
            mip_count: desc.mip_count,
            layer_count,
            allocation: Some(allocation),
            external: false,
            state: TextureState::default(),
            sampled_handle: BINDLESS_HANDLE_INVALID,
            storage_handle: BINDLESS_HANDLE_INVALID,
        })
    }

    fn upload_texture_data(&mut self, texture: &mut Texture, data: &[u8]) -> RhiResult<()> {
        let expected = texture_data_size(
            texture.format,
            texture.width,
            texture.height,
            texture.mip_count,
            texture.layer_count,
        )
        .ok_or_else(|| {
            RhiError::Upload(format!("no packing rule for format {:?}", texture.format))
        })?;
        if (data.len() as u64) < expected {
            return Err(RhiError::Upload(format!(
                "texture data is {} bytes, expected {}",
                data.len(),
                expected
            )));
        }

        let mut staging = self.create_buffer(&BufferDesc {
            name: "texture staging",
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            host_visible: true,
            data: Some(data),
            ..Default::default()
        })?;

        let aspect_mask = aspect_mask_for_format(texture.format);
        let mut regions = Vec::with_capacity(texture.mip_count as usize);
        let mut offset = 0u64;
        for mip in 0..texture.mip_count {
            let mip_size = match mip_data_size(texture.format, texture.width, texture.height, mip)
            {
                Some(s) => s,
                None => unreachable!("format was validated above"),
            };
            regions.push(
                vk::BufferImageCopy2::default()
                    .buffer_offset(offset)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask,
                        mip_level: mip,
                        base_array_layer: 0,
                        layer_count: texture.layer_count,
                    })
                    .image_extent(vk::Extent3D {
                        width: (texture.width >> mip).max(1),
                        height: (texture.height >> mip).max(1),
                        depth: 1,
                    }),
            );
            offset += mip_size * texture.layer_count as u64;
        }

        let dst_state = TextureState {
            stage: vk::PipelineStageFlags2::TRANSFER,
            access: vk::AccessFlags2::TRANSFER_WRITE,
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        };
        let to_transfer = image_memory_barrier(texture.image, aspect_mask, texture.state, dst_state);

        self.begin_transfer()?;
        {
            let cmd = self.transfer_command_buffer_mut();
            cmd.pipeline_barrier(&[], &[to_transfer]);
            cmd.copy_buffer_to_texture_regions(&staging, texture, &regions);
        }
        self.end_transfer()?;
        texture.state = dst_state;

        self.destroy_buffer(&mut staging);
        Ok(())
    }

    /// Destroys a texture and its views. Safe to call more than once;
    /// swapchain-owned images are left untouched.
    pub fn destroy_texture(&mut self, texture: &mut Texture) {
        if texture.image == vk::Image::null() {
            return;
        }
        if let Some(mut sampler) = texture.sampler.take() {
            self.destroy_sampler(&mut sampler);
        }
        unsafe {
            self.raw().destroy_image_view(texture.view, None);
            if texture.array_view != vk::ImageView::null() {
                self.raw().destroy_image_view(texture.array_view, None);
            }
        }
        if !texture.external {
            if let Some(allocation) = texture.allocation.take() {
                let _ = self.allocator_mut().free(allocation);
            }
            unsafe {
                self.raw().destroy_image(texture.image, None);
            }
        }
        texture.image = vk::Image::null();
        texture.view = vk::ImageView::null();
        texture.array_view = vk::ImageView::null();
        texture.sampled_handle = BINDLESS_HANDLE_INVALID;
        texture.storage_handle = BINDLESS_HANDLE_INVALID;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_length() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(1024, 512), 11);
        assert_eq!(mip_level_count(640, 480), 10);
    }

    #[test]
    fn block_compressed_mip_sizes_round_up_to_blocks() {
        // BC1: 8 bytes per 4x4 block.
        assert_eq!(
            mip_data_size(vk::Format::BC1_RGBA_SRGB_BLOCK, 256, 256, 0),
            Some(64 * 64 * 8)
        );
        // The 1x1 tail mip still occupies one full block.
        assert_eq!(
            mip_data_size(vk::Format::BC1_RGBA_SRGB_BLOCK, 256, 256, 8),
            Some(8)
        );
        assert_eq!(
            mip_data_size(vk::Format::BC5_UNORM_BLOCK, 10, 10, 0),
            Some(3 * 3 * 16)
        );
    }

    #[test]
    fn uncompressed_sizes_are_linear() {
        assert_eq!(
            mip_data_size(vk::Format::R8G8B8A8_SRGB, 128, 64, 0),
            Some(128 * 64 * 4)
        );
        assert_eq!(
            texture_data_size(vk::Format::R8G8B8A8_SRGB, 4, 4, 3, 1),
            Some((16 + 4 + 1) * 4)
        );
    }

    #[test]
    fn cubemap_data_counts_all_layers() {
        assert_eq!(
            texture_data_size(vk::Format::R16G16B16A16_SFLOAT, 64, 64, 1, 6),
            Some(64 * 64 * 8 * 6)
        );
    }

    #[test]
    fn unknown_format_has_no_packing() {
        assert_eq!(format_block_info(vk::Format::E5B9G9R9_UFLOAT_PACK32), None);
    }
}
