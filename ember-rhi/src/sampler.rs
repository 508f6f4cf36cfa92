//! Samplers and their configuration enums.

use ash::vk;

use crate::device::Device;
use crate::error::RhiResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Bilinear,
    Anisotropy4x,
    Anisotropy8x,
}

impl FilterMode {
    pub fn vk_filter(self) -> vk::Filter {
        match self {
            FilterMode::Nearest => vk::Filter::NEAREST,
            FilterMode::Bilinear | FilterMode::Anisotropy4x | FilterMode::Anisotropy8x => {
                vk::Filter::LINEAR
            }
        }
    }

    pub fn mipmap_mode(self) -> vk::SamplerMipmapMode {
        match self {
            FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
            _ => vk::SamplerMipmapMode::LINEAR,
        }
    }

    pub fn max_anisotropy(self) -> Option<f32> {
        match self {
            FilterMode::Anisotropy4x => Some(4.0),
            FilterMode::Anisotropy8x => Some(8.0),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WrapMode {
    #[default]
    Repeat,
    Clamp,
    Mirror,
    Border,
}

impl WrapMode {
    pub fn vk_address_mode(self) -> vk::SamplerAddressMode {
        match self {
            WrapMode::Repeat => vk::SamplerAddressMode::REPEAT,
            WrapMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
            WrapMode::Mirror => vk::SamplerAddressMode::MIRRORED_REPEAT,
            WrapMode::Border => vk::SamplerAddressMode::CLAMP_TO_BORDER,
        }
    }
}

pub struct Sampler {
    handle: vk::Sampler,
    filter: FilterMode,
    wrap: WrapMode,
}

impl Sampler {
    #[inline]
    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    #[inline]
    pub fn filter(&self) -> FilterMode {
        self.filter
    }

    #[inline]
    pub fn wrap(&self) -> WrapMode {
        self.wrap
    }
}

impl Device {
    pub fn create_sampler(
        &mut self,
        filter: FilterMode,
        wrap: WrapMode,
        mip_count: u32,
    ) -> RhiResult<Sampler> {
        let address_mode = wrap.vk_address_mode();
        let mut info = vk::SamplerCreateInfo::default()
            .mag_filter(filter.vk_filter())
            .min_filter(filter.vk_filter())
            .mipmap_mode(filter.mipmap_mode())
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .min_lod(0.0)
            .max_lod(mip_count as f32)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK);
        if let Some(max_anisotropy) = filter.max_anisotropy() {
            info = info.anisotropy_enable(true).max_anisotropy(max_anisotropy);
        }

        let handle = unsafe { self.raw().create_sampler(&info, None) }?;
        Ok(Sampler {
            handle,
            filter,
            wrap,
        })
    }

    pub fn destroy_sampler(&mut self, sampler: &mut Sampler) {
        if sampler.handle == vk::Sampler::null() {
            return;
        }
        unsafe {
            self.raw().destroy_sampler(sampler.handle, None);
        }
        sampler.handle = vk::Sampler::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anisotropic_filters_are_linear_with_anisotropy() {
        assert_eq!(FilterMode::Anisotropy4x.vk_filter(), vk::Filter::LINEAR);
        assert_eq!(FilterMode::Anisotropy4x.max_anisotropy(), Some(4.0));
        assert_eq!(FilterMode::Anisotropy8x.max_anisotropy(), Some(8.0));
        assert_eq!(FilterMode::Nearest.max_anisotropy(), None);
        assert_eq!(FilterMode::Bilinear.max_anisotropy(), None);
    }

    #[test]
    fn wrap_modes_map_to_address_modes() {
        assert_eq!(
            WrapMode::Repeat.vk_address_mode(),
            vk::SamplerAddressMode::REPEAT
        );
        assert_eq!(
            WrapMode::Clamp.vk_address_mode(),
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        );
        assert_eq!(
            WrapMode::Mirror.vk_address_mode(),
            vk::SamplerAddressMode::MIRRORED_REPEAT
        );
        assert_eq!(
            WrapMode::Border.vk_address_mode(),
            vk::SamplerAddressMode::CLAMP_TO_BORDER
        );
    }
}
