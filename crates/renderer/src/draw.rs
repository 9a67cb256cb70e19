//! Draw list entries and built-in geometry.

use ash::vk;
use glam::{Vec2, Vec3};

use presenter_rhi::arena::{ResourceArena, ResourceHandle};
use presenter_rhi::vertex::Vertex;
use presenter_rhi::{Gpu, RhiError, RhiResult};

/// Indices of the unit quad: two counter-clockwise triangles.
pub const QUAD_INDICES: [u32; 6] = [0, 1, 2, 0, 2, 3];

/// Unit quad in the XY plane centered on the origin, UVs covering [0, 1].
pub fn quad_vertices() -> [Vertex; 4] {
    [
        Vertex::new(Vec3::new(-0.5, -0.5, 0.0), Vec2::new(0.0, 0.0)),
        Vertex::new(Vec3::new(0.5, -0.5, 0.0), Vec2::new(1.0, 0.0)),
        Vertex::new(Vec3::new(0.5, 0.5, 0.0), Vec2::new(1.0, 1.0)),
        Vertex::new(Vec3::new(-0.5, 0.5, 0.0), Vec2::new(0.0, 1.0)),
    ]
}

/// A mesh uploaded to device-local buffers, drawn with one indexed draw.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshDraw {
    pub vertex_buffer: ResourceHandle,
    pub index_buffer: ResourceHandle,
    pub index_count: u32,
    /// Bound at set 0 before the draw, when non-empty.
    pub descriptor_sets: Vec<vk::DescriptorSet>,
}

impl MeshDraw {
    /// Resolves the arena handles for recording.
    ///
    /// # Errors
    ///
    /// [`RhiError::InvalidHandle`] if either buffer has been retired.
    pub fn resolve<'a, G: Gpu>(&'a self, arena: &ResourceArena<G>) -> RhiResult<DrawCall<'a>> {
        let vertex_buffer = arena
            .buffer(self.vertex_buffer)
            .ok_or_else(|| RhiError::InvalidHandle("stale vertex buffer handle".to_string()))?;
        let index_buffer = arena
            .buffer(self.index_buffer)
            .ok_or_else(|| RhiError::InvalidHandle("stale index buffer handle".to_string()))?;

        Ok(DrawCall {
            vertex_buffer: vertex_buffer.handle(),
            index_buffer: index_buffer.handle(),
            index_count: self.index_count,
            descriptor_sets: &self.descriptor_sets,
        })
    }
}

/// A draw with raw handles, as recorded into a frame.
#[derive(Debug, Clone, Copy)]
pub struct DrawCall<'a> {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub descriptor_sets: &'a [vk::DescriptorSet],
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use presenter_rhi::buffer::{Buffer, BufferUsage};
    use presenter_rhi::mock::MockGpu;
    use presenter_rhi::physical_device::QueueRoles;

    #[test]
    fn test_quad_indices_reference_every_vertex() {
        let vertices = quad_vertices();
        for i in 0..vertices.len() as u32 {
            assert!(QUAD_INDICES.contains(&i));
        }
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < vertices.len()));
    }

    #[test]
    fn test_quad_bytes() {
        let vertices = quad_vertices();
        assert_eq!(bytemuck::cast_slice::<Vertex, u8>(&vertices).len(), 80);
        assert_eq!(bytemuck::cast_slice::<u32, u8>(&QUAD_INDICES).len(), 24);
    }

    #[test]
    fn test_resolve_rejects_retired_buffers() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let mut arena = ResourceArena::new(gpu.clone());
        let vertex = arena.insert_buffer(Buffer::new(gpu.clone(), BufferUsage::Vertex, 80).unwrap());
        let index = arena.insert_buffer(Buffer::new(gpu.clone(), BufferUsage::Index, 24).unwrap());
        let mesh = MeshDraw {
            vertex_buffer: vertex,
            index_buffer: index,
            index_count: 6,
            descriptor_sets: Vec::new(),
        };

        let call = mesh.resolve(&arena).unwrap();
        assert_eq!(Some(call.vertex_buffer), arena.buffer(vertex).map(|b| b.handle()));
        assert_eq!(call.index_count, 6);

        assert!(arena.retire(index));
        assert!(matches!(
            mesh.resolve(&arena),
            Err(RhiError::InvalidHandle(_))
        ));
    }
}
