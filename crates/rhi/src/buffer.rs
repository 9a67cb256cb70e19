//! GPU buffer management.
//!
//! # Overview
//!
//! - [`BufferUsage`] fixes usage flags, memory properties and the pipeline
//!   stage that consumes the buffer.
//! - [`Buffer`] owns a `VkBuffer` and its dedicated allocation.
//!
//! Device-local buffers are filled through the
//! [`TransferEngine`](crate::transfer::TransferEngine); host-visible ones
//! with [`Buffer::write`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use presenter_rhi::buffer::{Buffer, BufferUsage};
//! use presenter_rhi::device::Device;
//!
//! # fn example(device: Arc<Device>) -> Result<(), presenter_rhi::RhiError> {
//! let mvp = [0.0f32; 16];
//! let uniform = Buffer::new_with_data(device, BufferUsage::Uniform, bytemuck::cast_slice(&mvp))?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::error::{RhiError, RhiResult};
use crate::gpu::Gpu;
use crate::memory::{allocate_and_bind_buffer, allocate_buffer, write_mapped};

/// Buffer usage type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Device-local vertex data, filled by transfer
    Vertex,
    /// Device-local index data, filled by transfer
    Index,
    /// Host-visible, coherent shader uniforms
    Uniform,
    /// Host-visible upload source
    Staging,
}

impl BufferUsage {
    /// Converts to Vulkan buffer usage flags.
    pub fn to_vk_usage(self) -> vk::BufferUsageFlags {
        match self {
            BufferUsage::Vertex => {
                vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Index => {
                vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
            }
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
            BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    /// Memory properties the backing allocation must have.
    pub fn memory_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            BufferUsage::Vertex | BufferUsage::Index => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            BufferUsage::Uniform => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            // Coherence not required; writes are flushed explicitly.
            BufferUsage::Staging => vk::MemoryPropertyFlags::HOST_VISIBLE,
        }
    }

    /// Access mask and stage of the first read after an upload.
    pub fn consumer(self) -> (vk::AccessFlags, vk::PipelineStageFlags) {
        match self {
            BufferUsage::Vertex => (
                vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
                vk::PipelineStageFlags::VERTEX_INPUT,
            ),
            BufferUsage::Index => (
                vk::AccessFlags::INDEX_READ,
                vk::PipelineStageFlags::VERTEX_INPUT,
            ),
            BufferUsage::Uniform => (
                vk::AccessFlags::UNIFORM_READ,
                vk::PipelineStageFlags::VERTEX_SHADER,
            ),
            BufferUsage::Staging => (
                vk::AccessFlags::TRANSFER_READ,
                vk::PipelineStageFlags::TRANSFER,
            ),
        }
    }

    #[inline]
    pub fn is_host_visible(self) -> bool {
        self.memory_flags()
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Returns a human-readable name for the buffer type.
    pub fn name(self) -> &'static str {
        match self {
            BufferUsage::Vertex => "vertex",
            BufferUsage::Index => "index",
            BufferUsage::Uniform => "uniform",
            BufferUsage::Staging => "staging",
        }
    }
}

/// GPU buffer with a dedicated allocation.
///
/// The byte size is kept alongside the handle since the allocation size
/// reported by the driver may be larger.
pub struct Buffer<G: Gpu> {
    gpu: Arc<G>,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    memory_requirements: vk::MemoryRequirements,
    size: vk::DeviceSize,
    usage: BufferUsage,
}

impl<G: Gpu> Buffer<G> {
    /// Creates a buffer of `size` bytes and binds fresh memory to it.
    ///
    /// # Errors
    ///
    /// Returns an error if buffer creation, memory type lookup, allocation
    /// or binding fails. Nothing is leaked on failure.
    pub fn new(gpu: Arc<G>, usage: BufferUsage, size: vk::DeviceSize) -> RhiResult<Self> {
        let buffer = allocate_buffer(gpu.as_ref(), size, usage.to_vk_usage())?;

        let (memory, memory_requirements) =
            match allocate_and_bind_buffer(gpu.as_ref(), buffer, usage.memory_flags()) {
                Ok(bound) => bound,
                Err(e) => {
                    gpu.destroy_buffer(buffer);
                    return Err(e);
                }
            };

        debug!("Created {} buffer: {} bytes", usage.name(), size);

        Ok(Self {
            gpu,
            buffer,
            memory,
            memory_requirements,
            size,
            usage,
        })
    }

    /// Creates a host-visible buffer sized for `data` and writes it.
    pub fn new_with_data(gpu: Arc<G>, usage: BufferUsage, data: &[u8]) -> RhiResult<Self> {
        let buffer = Self::new(gpu, usage, data.len() as vk::DeviceSize)?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Overwrites the whole buffer with `data` through a flushed mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not host-visible or `data` is not
    /// exactly [`size`](Self::size) bytes.
    pub fn write(&self, data: &[u8]) -> RhiResult<()> {
        if !self.usage.is_host_visible() {
            return Err(RhiError::InvalidHandle(format!(
                "{} buffer is not host-visible",
                self.usage.name()
            )));
        }
        write_mapped(self.gpu.as_ref(), self.memory, self.size, data)
    }

    #[inline]
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    #[inline]
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    #[inline]
    pub fn memory_requirements(&self) -> &vk::MemoryRequirements {
        &self.memory_requirements
    }

    /// Returns the buffer size in bytes.
    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }
}

impl<G: Gpu> Drop for Buffer<G> {
    fn drop(&mut self) {
        self.gpu.destroy_buffer(self.buffer);
        self.gpu.free_memory(self.memory);
        debug!("Destroyed {} buffer", self.usage.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGpu;
    use crate::physical_device::QueueRoles;

    #[test]
    fn test_buffer_usage_to_vk_usage() {
        assert!(
            BufferUsage::Vertex
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        );
        assert!(
            BufferUsage::Index
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST)
        );
        assert!(
            BufferUsage::Uniform
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::UNIFORM_BUFFER)
        );
        assert!(
            BufferUsage::Staging
                .to_vk_usage()
                .contains(vk::BufferUsageFlags::TRANSFER_SRC)
        );
    }

    #[test]
    fn test_buffer_usage_memory_flags() {
        assert!(!BufferUsage::Vertex.is_host_visible());
        assert!(!BufferUsage::Index.is_host_visible());
        assert!(BufferUsage::Uniform.is_host_visible());
        assert!(BufferUsage::Staging.is_host_visible());
    }

    #[test]
    fn test_buffer_usage_name() {
        assert_eq!(BufferUsage::Vertex.name(), "vertex");
        assert_eq!(BufferUsage::Index.name(), "index");
        assert_eq!(BufferUsage::Uniform.name(), "uniform");
        assert_eq!(BufferUsage::Staging.name(), "staging");
    }

    #[test]
    fn test_device_local_buffer_lands_in_device_local_memory() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let buffer = Buffer::new(gpu.clone(), BufferUsage::Vertex, 80).unwrap();

        assert_eq!(gpu.buffer_memory_type(buffer.handle()), Some(0));
        assert_eq!(buffer.size(), 80);
        assert!(buffer.memory_requirements().size >= 80);
        assert!(buffer.write(&[0; 80]).is_err());
    }

    #[test]
    fn test_new_with_data_round_trips_through_mapping() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let data: Vec<u8> = (0..64).collect();
        let buffer = Buffer::new_with_data(gpu.clone(), BufferUsage::Uniform, &data).unwrap();

        assert_eq!(gpu.buffer_contents(buffer.handle()).unwrap(), data);
        drop(buffer);
        assert_eq!(gpu.live_objects(), 0);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn test_failed_allocation_does_not_leak() {
        let mut props = crate::mock::default_memory_properties();
        props.memory_type_count = 1;
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)).with_memory_properties(props));

        let result = Buffer::new(gpu.clone(), BufferUsage::Staging, 16);
        assert!(matches!(
            result,
            Err(RhiError::NoCompatibleMemoryType { .. })
        ));
        assert_eq!(gpu.live_objects(), 0);
    }
}
