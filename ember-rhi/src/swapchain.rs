//! Swapchain creation and per-image wrappers.

use ash::vk;

use crate::device::{FRAME_IN_FLIGHT_COUNT, SWAPCHAIN_IMAGE_MAX_COUNT};
use crate::error::RhiResult;
use crate::texture::Texture;

/// Prefers an 8 bit sRGB format; falls back to the first advertised one.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    formats
        .iter()
        .find(|f| {
            (f.format == vk::Format::R8G8B8A8_SRGB || f.format == vk::Format::B8G8R8A8_SRGB)
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .copied()
        .unwrap_or_else(|| formats[0])
}

/// Mailbox when available, otherwise FIFO (always supported).
pub fn choose_present_mode(modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// One image more than the frames in flight, clamped to the surface
/// limits. A `max_image_count` of zero means unbounded.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = (FRAME_IN_FLIGHT_COUNT as u32 + 1).max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count = count.min(caps.max_image_count);
    }
    count
}

/// The surface's fixed extent when it has one, otherwise `desired`
/// clamped to the supported range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: desired
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: desired
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    handle: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    textures: Vec<Texture>,
    image_index: u32,
}

impl Swapchain {
    pub(crate) fn new(
        loader: ash::khr::swapchain::Device,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        physical_device: vk::PhysicalDevice,
        device: &ash::Device,
        desired_extent: vk::Extent2D,
        old_swapchain: Option<vk::SwapchainKHR>,
    ) -> RhiResult<Self> {
        let (caps, formats, modes) = unsafe {
            (
                surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?,
                surface_loader.get_physical_device_surface_formats(physical_device, surface)?,
                surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)?,
            )
        };

        let surface_format = choose_surface_format(&formats);
        let present_mode = choose_present_mode(&modes);
        let image_count = choose_image_count(&caps);
        let extent = choose_extent(&caps, desired_extent);

        let info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or_default());

        let handle = unsafe { loader.create_swapchain(&info, None) }?;
        let images = unsafe { loader.get_swapchain_images(handle) }?;
        assert!(
            images.len() <= SWAPCHAIN_IMAGE_MAX_COUNT,
            "swapchain delivered {} images, supported maximum is {}",
            images.len(),
            SWAPCHAIN_IMAGE_MAX_COUNT
        );

        let mut textures = Vec::with_capacity(images.len());
        for image in images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { device.create_image_view(&view_info, None) }?;
            textures.push(Texture::from_swapchain_image(
                image,
                view,
                surface_format.format,
                extent.width,
                extent.height,
            ));
        }

        Ok(Self {
            loader,
            handle,
            surface_format,
            present_mode,
            extent,
            textures,
            image_index: 0,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn image_count(&self) -> usize {
        self.textures.len()
    }

    #[inline]
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    #[inline]
    pub fn current_texture(&self) -> &Texture {
        &self.textures[self.image_index as usize]
    }

    #[inline]
    pub fn current_texture_mut(&mut self) -> &mut Texture {
        &mut self.textures[self.image_index as usize]
    }

    pub(crate) fn acquire(&mut self, semaphore: vk::Semaphore) -> ash::prelude::VkResult<bool> {
        let (index, suboptimal) = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        }?;
        self.image_index = index;
        // A fresh acquire starts from an undefined layout.
        self.textures[index as usize].state = crate::barrier::TextureState::default();
        Ok(suboptimal)
    }

    pub(crate) fn present(
        &mut self,
        queue: vk::Queue,
        wait_semaphore: vk::Semaphore,
    ) -> ash::prelude::VkResult<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.handle];
        let indices = [self.image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);
        unsafe { self.loader.queue_present(queue, &info) }
    }

    pub(crate) fn destroy(&mut self, device: &ash::Device) {
        for texture in &mut self.textures {
            unsafe {
                device.destroy_image_view(texture.view(), None);
            }
        }
        self.textures.clear();
        unsafe {
            self.loader.destroy_swapchain(self.handle, None);
        }
        self.handle = vk::SwapchainKHR::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_format_is_preferred() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R16G16B16A16_SFLOAT,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R5G6B5_UNORM_PACK16,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(
            choose_surface_format(&formats).format,
            vk::Format::R5G6B5_UNORM_PACK16
        );
    }

    #[test]
    fn mailbox_wins_over_fifo() {
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE]),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn image_count_respects_surface_limits() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.min_image_count = 2;
        caps.max_image_count = 0;
        assert_eq!(choose_image_count(&caps), FRAME_IN_FLIGHT_COUNT as u32 + 1);

        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);

        caps.min_image_count = 4;
        caps.max_image_count = 8;
        assert_eq!(choose_image_count(&caps), 4);
    }

    #[test]
    fn requested_image_count_fits_the_image_cap() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.min_image_count = 1;
        caps.max_image_count = 0;
        assert!(choose_image_count(&caps) <= SWAPCHAIN_IMAGE_MAX_COUNT as u32);
    }

    #[test]
    fn extent_uses_surface_value_when_fixed() {
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        caps.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let desired = vk::Extent2D {
            width: 1920,
            height: 1080,
        };
        assert_eq!(choose_extent(&caps, desired), caps.current_extent);

        caps.current_extent.width = u32::MAX;
        caps.min_image_extent = vk::Extent2D {
            width: 100,
            height: 100,
        };
        caps.max_image_extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        assert_eq!(
            choose_extent(&caps, desired),
            vk::Extent2D {
                width: 1280,
                height: 720
            }
        );
    }
}
