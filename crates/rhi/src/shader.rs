//! Shader module management.
//!
//! Shaders arrive as precompiled SPIR-V blobs. This module only turns them
//! into `VkShaderModule` handles and the stage create-infos a pipeline needs.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::path::Path;
//! use presenter_rhi::device::Device;
//! use presenter_rhi::shader::{Shader, ShaderStage};
//!
//! # fn example(device: Arc<Device>) -> Result<(), presenter_rhi::RhiError> {
//! let vertex_shader = Shader::from_spirv_file(
//!     device.clone(),
//!     Path::new("shaders/spirv/quad.vert.spv"),
//!     ShaderStage::Vertex,
//!     "main",
//! )?;
//! let _stage_info = vertex_shader.stage_create_info();
//! # Ok(())
//! # }
//! ```

use std::ffi::{CStr, CString};
use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::error::{RhiError, RhiResult};
use crate::gpu::Gpu;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Shader stage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    TessControl,
    TessEvaluation,
}

impl ShaderStage {
    /// Converts the shader stage to Vulkan shader stage flags.
    pub fn to_vk_stage(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
            ShaderStage::TessEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
        }
    }

    /// Returns a human-readable name for the shader stage.
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
            ShaderStage::TessControl => "tessellation control",
            ShaderStage::TessEvaluation => "tessellation evaluation",
        }
    }
}

impl std::fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Reinterprets little-endian SPIR-V bytes as code words.
///
/// # Errors
///
/// [`RhiError::ShaderError`] if the blob is empty, not a multiple of 4 bytes
/// or does not start with the SPIR-V magic number.
pub fn spirv_words(bytes: &[u8]) -> RhiResult<Vec<u32>> {
    if bytes.is_empty() || !bytes.len().is_multiple_of(4) {
        return Err(RhiError::ShaderError(format!(
            "SPIR-V code must be a non-empty multiple of 4 bytes, got {} bytes",
            bytes.len()
        )));
    }

    let code: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if code[0] != SPIRV_MAGIC {
        return Err(RhiError::ShaderError(format!(
            "Bad SPIR-V magic number {:#010x}",
            code[0]
        )));
    }

    Ok(code)
}

/// Shader module with its stage and entry point.
pub struct Shader<G: Gpu> {
    gpu: Arc<G>,
    module: vk::ShaderModule,
    stage: ShaderStage,
    entry_point: CString,
}

impl<G: Gpu> Shader<G> {
    /// Creates a shader module from a SPIR-V file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the SPIR-V is malformed
    /// or module creation fails.
    pub fn from_spirv_file(
        gpu: Arc<G>,
        path: &Path,
        stage: ShaderStage,
        entry_point: &str,
    ) -> RhiResult<Self> {
        debug!("Loading {} shader from {:?}", stage, path);

        let bytes = std::fs::read(path).map_err(|e| {
            RhiError::ShaderError(format!("Failed to read shader file {:?}: {}", path, e))
        })?;

        Self::from_spirv_bytes(gpu, &bytes, stage, entry_point)
    }

    /// Creates a shader module from SPIR-V bytes.
    pub fn from_spirv_bytes(
        gpu: Arc<G>,
        bytes: &[u8],
        stage: ShaderStage,
        entry_point: &str,
    ) -> RhiResult<Self> {
        let code = spirv_words(bytes)?;

        let entry_point_cstring = CString::new(entry_point)
            .map_err(|e| RhiError::ShaderError(format!("Invalid entry point name: {}", e)))?;

        let module = gpu.create_shader_module(&code)?;

        info!(
            "Created {} shader module with entry point '{}'",
            stage, entry_point
        );

        Ok(Self {
            gpu,
            module,
            stage,
            entry_point: entry_point_cstring,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    #[inline]
    pub fn entry_point(&self) -> &CStr {
        &self.entry_point
    }

    /// Creates the pipeline stage description for this shader.
    ///
    /// The returned structure borrows the entry point and must not outlive
    /// the shader.
    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.to_vk_stage())
            .module(self.module)
            .name(&self.entry_point)
    }
}

impl<G: Gpu> Drop for Shader<G> {
    fn drop(&mut self) {
        self.gpu.destroy_shader_module(self.module);
        debug!("Destroyed {} shader module", self.stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGpu;
    use crate::physical_device::QueueRoles;

    fn blob(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_shader_stage_to_vk_stage() {
        assert_eq!(
            ShaderStage::Vertex.to_vk_stage(),
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            ShaderStage::Fragment.to_vk_stage(),
            vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            ShaderStage::TessControl.to_vk_stage(),
            vk::ShaderStageFlags::TESSELLATION_CONTROL
        );
        assert_eq!(
            ShaderStage::TessEvaluation.to_vk_stage(),
            vk::ShaderStageFlags::TESSELLATION_EVALUATION
        );
    }

    #[test]
    fn test_shader_stage_display() {
        assert_eq!(format!("{}", ShaderStage::Vertex), "vertex");
        assert_eq!(
            format!("{}", ShaderStage::TessEvaluation),
            "tessellation evaluation"
        );
    }

    #[test]
    fn test_spirv_words_rejects_malformed_blobs() {
        assert!(spirv_words(&[]).is_err());
        assert!(spirv_words(&[0u8; 5]).is_err());
        assert!(spirv_words(&blob(&[0xdead_beef, 0])).is_err());

        let words = spirv_words(&blob(&[SPIRV_MAGIC, 0x0001_0000])).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn test_shader_module_lifecycle() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let shader = Shader::from_spirv_bytes(
            gpu.clone(),
            &blob(&[SPIRV_MAGIC, 0, 0, 0]),
            ShaderStage::Fragment,
            "main",
        )
        .unwrap();

        let info = shader.stage_create_info();
        assert_eq!(info.stage, vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(info.module, shader.handle());
        assert_eq!(shader.entry_point(), c"main");

        drop(shader);
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn test_missing_file_is_shader_error() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let result = Shader::from_spirv_file(
            gpu,
            Path::new("does/not/exist.spv"),
            ShaderStage::Vertex,
            "main",
        );
        assert!(matches!(result, Err(RhiError::ShaderError(_))));
    }
}
