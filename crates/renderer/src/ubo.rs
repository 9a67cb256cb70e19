//! Per-frame uniform block.
//!
//! Must match the `FrameData` uniform block in the quad shaders. Uses
//! `#[repr(C)]` and `Pod` so it can be written to a mapped buffer as bytes.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// Transform and tessellation levels written into each frame slot.
///
/// # Memory Layout
///
/// - Offset 0: model matrix (64 bytes)
/// - Offset 64: view matrix (64 bytes)
/// - Offset 128: projection matrix (64 bytes)
/// - Offset 192: outer tessellation levels (12 bytes)
/// - Offset 204: inner tessellation level (4 bytes)
/// - Total size: 208 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub model: Mat4,
    pub view: Mat4,
    pub projection: Mat4,
    pub tess_level_outer: Vec3,
    /// Packs into the std140 slot after `tess_level_outer`.
    pub tess_level_inner: f32,
}

impl FrameUniforms {
    /// Size of the struct in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn new(model: Mat4, view: Mat4, projection: Mat4) -> Self {
        Self {
            model,
            view,
            projection,
            ..Self::default()
        }
    }

    pub fn with_tess_levels(mut self, outer: Vec3, inner: f32) -> Self {
        self.tess_level_outer = outer;
        self.tess_level_inner = inner;
        self
    }
}

impl Default for FrameUniforms {
    /// Identity transforms and undivided patches.
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            tess_level_outer: Vec3::ONE,
            tess_level_inner: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_uniforms_layout() {
        // 3 Mat4 (3 * 64) + Vec3 (12) + f32 (4) = 208 bytes
        assert_eq!(FrameUniforms::SIZE, 208);
        assert_eq!(std::mem::align_of::<FrameUniforms>(), 16);
        assert_eq!(
            std::mem::offset_of!(FrameUniforms, tess_level_inner),
            204
        );
    }

    #[test]
    fn test_default_is_identity() {
        let uniforms = FrameUniforms::default();
        assert_eq!(uniforms.model, Mat4::IDENTITY);
        assert_eq!(uniforms.projection, Mat4::IDENTITY);
        assert_eq!(uniforms.tess_level_outer, Vec3::ONE);
        assert_eq!(uniforms.tess_level_inner, 1.0);
    }

    #[test]
    fn test_bytes_cover_whole_block() {
        let uniforms = FrameUniforms::new(
            Mat4::from_scale(Vec3::splat(2.0)),
            Mat4::IDENTITY,
            Mat4::IDENTITY,
        )
        .with_tess_levels(Vec3::new(4.0, 4.0, 4.0), 3.0);
        let bytes = bytemuck::bytes_of(&uniforms);
        assert_eq!(bytes.len(), FrameUniforms::SIZE);
        assert_eq!(&bytes[204..208], &3.0f32.to_le_bytes());
    }
}
