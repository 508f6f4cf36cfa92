//! Shader modules and stage programs.
//!
//! Shaders are consumed as pre-compiled SPIR-V blobs; no compilation or
//! reflection happens here. A [`ShaderProgram`] groups one module per
//! stage for pipeline creation.

use std::io;

use ash::vk;

use crate::device::Device;
use crate::error::{RhiError, RhiResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    RayGeneration,
    Miss,
    ClosestHit,
}

pub const SHADER_STAGE_COUNT: usize = 6;

impl ShaderStage {
    pub fn vk_flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
            ShaderStage::RayGeneration => vk::ShaderStageFlags::RAYGEN_KHR,
            ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
            ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        match self {
            ShaderStage::Vertex => 0,
            ShaderStage::Fragment => 1,
            ShaderStage::Compute => 2,
            ShaderStage::RayGeneration => 3,
            ShaderStage::Miss => 4,
            ShaderStage::ClosestHit => 5,
        }
    }
}

pub struct Shader {
    module: vk::ShaderModule,
    stage: ShaderStage,
}

impl Shader {
    #[inline]
    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }
}

/// One shader per stage, indexed by [`ShaderStage`].
#[derive(Default)]
pub struct ShaderProgram {
    shaders: [Option<Shader>; SHADER_STAGE_COUNT],
}

impl ShaderProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, shader: Shader) {
        let index = shader.stage.index();
        self.shaders[index] = Some(shader);
    }

    pub fn get(&self, stage: ShaderStage) -> Option<&Shader> {
        self.shaders[stage.index()].as_ref()
    }

    pub fn take(&mut self, stage: ShaderStage) -> Option<Shader> {
        self.shaders[stage.index()].take()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Shader> {
        self.shaders.iter().filter_map(|s| s.as_ref())
    }
}

impl Device {
    /// Wraps a compiled SPIR-V blob in a shader module.
    pub fn create_shader(&mut self, spirv: &[u8], stage: ShaderStage) -> RhiResult<Shader> {
        let words = ash::util::read_spv(&mut io::Cursor::new(spirv))
            .map_err(|e| RhiError::Loading(format!("invalid SPIR-V blob: {}", e)))?;

        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { self.raw().create_shader_module(&info, None) }?;
        Ok(Shader { module, stage })
    }

    pub fn destroy_shader(&mut self, shader: &mut Shader) {
        if shader.module == vk::ShaderModule::null() {
            return;
        }
        unsafe {
            self.raw().destroy_shader_module(shader.module, None);
        }
        shader.module = vk::ShaderModule::null();
    }

    pub fn destroy_shader_program(&mut self, program: &mut ShaderProgram) {
        for slot in program.shaders.iter_mut() {
            if let Some(mut shader) = slot.take() {
                self.destroy_shader(&mut shader);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_indices_are_distinct() {
        let stages = [
            ShaderStage::Vertex,
            ShaderStage::Fragment,
            ShaderStage::Compute,
            ShaderStage::RayGeneration,
            ShaderStage::Miss,
            ShaderStage::ClosestHit,
        ];
        let mut seen = [false; SHADER_STAGE_COUNT];
        for stage in stages {
            assert!(!seen[stage.index()]);
            seen[stage.index()] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    fn null_shader(stage: ShaderStage) -> Shader {
        Shader {
            module: vk::ShaderModule::null(),
            stage,
        }
    }

    #[test]
    fn program_stores_one_shader_per_stage() {
        let mut program = ShaderProgram::new();
        program.set(null_shader(ShaderStage::Vertex));
        program.set(null_shader(ShaderStage::Fragment));

        assert!(program.get(ShaderStage::Vertex).is_some());
        assert!(program.get(ShaderStage::Compute).is_none());
        assert_eq!(program.iter().count(), 2);

        let taken = program.take(ShaderStage::Fragment).unwrap();
        assert_eq!(taken.stage(), ShaderStage::Fragment);
        assert!(program.get(ShaderStage::Fragment).is_none());
    }
}
