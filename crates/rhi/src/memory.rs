//! Device memory allocation.
//!
//! One allocation per resource, bound at offset 0. Resource creation and
//! memory binding are separate steps so callers can inspect requirements in
//! between.

use ash::vk;
use tracing::debug;

use crate::error::{RhiError, RhiResult};
use crate::gpu::Gpu;

/// Returns the first memory type allowed by `type_bits` whose property flags
/// contain all of `wanted`.
///
/// # Errors
///
/// [`RhiError::NoCompatibleMemoryType`] if no type matches.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    wanted: vk::MemoryPropertyFlags,
) -> RhiResult<u32> {
    let count = properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32);
    (0..count)
        .find(|&i| {
            type_bits & (1 << i) != 0
                && properties.memory_types[i as usize]
                    .property_flags
                    .contains(wanted)
        })
        .ok_or(RhiError::NoCompatibleMemoryType {
            type_bits,
            flags: wanted,
        })
}

/// Creates an exclusive buffer with no memory bound.
pub fn allocate_buffer<G: Gpu>(
    gpu: &G,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
) -> RhiResult<vk::Buffer> {
    if size == 0 {
        return Err(RhiError::AllocationFailed(
            "Buffer size must be greater than 0".to_string(),
        ));
    }

    let create_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    gpu.create_buffer(&create_info)
}

/// Creates an optimally tiled, single-mip 2D image with no memory bound.
pub fn allocate_image2d<G: Gpu>(
    gpu: &G,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> RhiResult<vk::Image> {
    if extent.width == 0 || extent.height == 0 {
        return Err(RhiError::AllocationFailed(format!(
            "Image extent {}x{} has no area",
            extent.width, extent.height
        )));
    }

    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    gpu.create_image(&create_info)
}

fn allocate<G: Gpu>(
    gpu: &G,
    requirements: &vk::MemoryRequirements,
    flags: vk::MemoryPropertyFlags,
) -> RhiResult<vk::DeviceMemory> {
    let memory_type_index =
        find_memory_type(gpu.memory_properties(), requirements.memory_type_bits, flags)?;

    let allocate_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    let memory = gpu.allocate_memory(&allocate_info)?;
    debug!(
        "Allocated {} bytes from memory type {} ({:?})",
        requirements.size, memory_type_index, flags
    );
    Ok(memory)
}

/// Allocates memory matching `flags` for `buffer` and binds it at offset 0.
pub fn allocate_and_bind_buffer<G: Gpu>(
    gpu: &G,
    buffer: vk::Buffer,
    flags: vk::MemoryPropertyFlags,
) -> RhiResult<(vk::DeviceMemory, vk::MemoryRequirements)> {
    let requirements = gpu.buffer_memory_requirements(buffer);
    let memory = allocate(gpu, &requirements, flags)?;
    if let Err(e) = gpu.bind_buffer_memory(buffer, memory, 0) {
        gpu.free_memory(memory);
        return Err(e);
    }
    Ok((memory, requirements))
}

/// Allocates memory matching `flags` for `image` and binds it at offset 0.
pub fn allocate_and_bind_image<G: Gpu>(
    gpu: &G,
    image: vk::Image,
    flags: vk::MemoryPropertyFlags,
) -> RhiResult<(vk::DeviceMemory, vk::MemoryRequirements)> {
    let requirements = gpu.image_memory_requirements(image);
    let memory = allocate(gpu, &requirements, flags)?;
    if let Err(e) = gpu.bind_image_memory(image, memory, 0) {
        gpu.free_memory(memory);
        return Err(e);
    }
    Ok((memory, requirements))
}

/// Maps `size` bytes of `memory`, copies `data` in, flushes the whole mapping
/// and unmaps.
///
/// The flush covers memory types that are not host-coherent. The memory must
/// not be in use by a pending submission.
pub fn write_mapped<G: Gpu>(
    gpu: &G,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    data: &[u8],
) -> RhiResult<()> {
    if data.len() as vk::DeviceSize != size {
        return Err(RhiError::AllocationFailed(format!(
            "Write of {} bytes into a {} byte allocation",
            data.len(),
            size
        )));
    }

    let ptr = gpu.map_memory(memory, 0, size)?;
    // SAFETY: the mapping covers `size` bytes and `data` has exactly that length.
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
    }
    let flushed = gpu.flush_mapped_memory(memory, 0, vk::WHOLE_SIZE);
    gpu.unmap_memory(memory);
    flushed
}
