//! Host-to-device uploads through staging buffers.
//!
//! Every upload runs the same cycle on the transfer
//! [`CommandBufferStructure`]:
//!
//! 1. wait on the structure's fence, then reset it;
//! 2. record the copy with the barriers around it;
//! 3. submit with no semaphores, the fence signaling completion.
//!
//! When the transfer family differs from the graphics family the destination
//! changes owner. The transfer queue records a release barrier and the
//! graphics queue records the matching acquire barrier in a second
//! submission, issued only after the release has completed. When the
//! families match, barriers carry `QUEUE_FAMILY_IGNORED` on both sides and no
//! graphics submission is made.
//!
//! Staging buffers are handed to the [`ResourceArena`] behind the completion
//! fence. Uploaded resources are inserted into the arena with that fence as
//! their last use.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::arena::{Resource, ResourceArena, ResourceHandle};
use crate::buffer::{Buffer, BufferUsage};
use crate::command::{
    CommandBuffer, CommandBufferStructure, CommandPool, begin_command_buffer,
    submit_command_buffer, wait_for_fences,
};
use crate::error::{RhiError, RhiResult};
use crate::gpu::{BufferBarrier, Gpu, ImageBarrier};
use crate::texture::Texture2D;

/// Queue families on either side of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnershipTransfer {
    pub src_family: u32,
    pub dst_family: u32,
}

impl OwnershipTransfer {
    #[inline]
    pub fn is_required(&self) -> bool {
        self.src_family != self.dst_family
    }

    /// Family indices to put in a barrier: the real pair when ownership moves,
    /// `QUEUE_FAMILY_IGNORED` on both sides otherwise.
    #[inline]
    pub fn barrier_families(&self) -> (u32, u32) {
        if self.is_required() {
            (self.src_family, self.dst_family)
        } else {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        }
    }
}

/// Uploads buffer and texture data into device-local memory.
pub struct TransferEngine<G: Gpu> {
    gpu: Arc<G>,
    // Structures hold command buffers from these pools; pools drop last.
    transfer: CommandBufferStructure<G>,
    graphics: CommandBufferStructure<G>,
    _transfer_pool: CommandPool<G>,
    _graphics_pool: CommandPool<G>,
}

impl<G: Gpu> TransferEngine<G> {
    /// Creates command pools and structures for the transfer and graphics
    /// queues of `gpu`.
    pub fn new(gpu: Arc<G>) -> RhiResult<Self> {
        let roles = gpu.queue_roles();
        let transfer_pool = CommandPool::new(gpu.clone(), roles.transfer)?;
        let graphics_pool = CommandPool::new(gpu.clone(), roles.graphics)?;
        let transfer =
            CommandBufferStructure::new(gpu.clone(), &transfer_pool, gpu.transfer_queue())?;
        let graphics =
            CommandBufferStructure::new(gpu.clone(), &graphics_pool, gpu.graphics_queue())?;

        info!(
            "Transfer engine ready (transfer family {}, graphics family {})",
            roles.transfer, roles.graphics
        );

        Ok(Self {
            gpu,
            transfer,
            graphics,
            _transfer_pool: transfer_pool,
            _graphics_pool: graphics_pool,
        })
    }

    /// Source and destination families of every upload made by this engine.
    #[inline]
    pub fn ownership(&self) -> OwnershipTransfer {
        OwnershipTransfer {
            src_family: self.transfer.queue_family_index,
            dst_family: self.graphics.queue_family_index,
        }
    }

    /// Uploads `data` into a new device-local buffer.
    ///
    /// Returns the arena handle of the destination buffer.
    ///
    /// # Errors
    ///
    /// Allocation failures are returned as they are. Recording and
    /// submission failures are returned as [`RhiError::TransferFailed`].
    pub fn upload_buffer(
        &mut self,
        arena: &mut ResourceArena<G>,
        usage: BufferUsage,
        data: &[u8],
    ) -> RhiResult<ResourceHandle> {
        if usage.is_host_visible() {
            return Err(RhiError::TransferFailed(format!(
                "{} buffers are written directly, not uploaded",
                usage.name()
            )));
        }

        let size = data.len() as vk::DeviceSize;
        let staging = Buffer::new_with_data(self.gpu.clone(), BufferUsage::Staging, data)?;
        let destination = Buffer::new(self.gpu.clone(), usage, size)?;

        let ownership = self.ownership();
        let (src_family, dst_family) = ownership.barrier_families();
        let (consumer_access, consumer_stage) = usage.consumer();

        let fence = self
            .record_and_submit(
                |cmd| {
                    cmd.copy_buffer(
                        staging.handle(),
                        destination.handle(),
                        &[vk::BufferCopy {
                            src_offset: 0,
                            dst_offset: 0,
                            size,
                        }],
                    );
                    let barrier = BufferBarrier {
                        buffer: destination.handle(),
                        src_access: vk::AccessFlags::TRANSFER_WRITE,
                        dst_access: if ownership.is_required() {
                            vk::AccessFlags::empty()
                        } else {
                            consumer_access
                        },
                        src_queue_family: src_family,
                        dst_queue_family: dst_family,
                        offset: 0,
                        size: vk::WHOLE_SIZE,
                    };
                    cmd.pipeline_barrier(
                        vk::PipelineStageFlags::TRANSFER,
                        if ownership.is_required() {
                            vk::PipelineStageFlags::BOTTOM_OF_PIPE
                        } else {
                            consumer_stage
                        },
                        &[barrier],
                        &[],
                    );
                },
                |cmd| {
                    let barrier = BufferBarrier {
                        buffer: destination.handle(),
                        src_access: vk::AccessFlags::empty(),
                        dst_access: consumer_access,
                        src_queue_family: src_family,
                        dst_queue_family: dst_family,
                        offset: 0,
                        size: vk::WHOLE_SIZE,
                    };
                    cmd.pipeline_barrier(
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        consumer_stage,
                        &[barrier],
                        &[],
                    );
                },
            )
            .map_err(|e| RhiError::TransferFailed(format!("{} upload: {}", usage.name(), e)))?;

        debug!("Uploaded {} bytes into {} buffer", size, usage.name());

        arena.retire_with(Resource::Buffer(staging), fence);
        let handle = arena.insert_buffer(destination);
        arena.mark_used(handle, fence);
        Ok(handle)
    }

    /// Uploads tightly packed RGBA8 `pixels` into a new sampled texture.
    ///
    /// The texture ends in `SHADER_READ_ONLY_OPTIMAL`, owned by the graphics
    /// family.
    pub fn upload_texture(
        &mut self,
        arena: &mut ResourceArena<G>,
        extent: vk::Extent2D,
        pixels: &[u8],
    ) -> RhiResult<ResourceHandle> {
        let texture = Texture2D::new(self.gpu.clone(), extent)?;
        texture.check_pixels(pixels)?;
        let staging = Buffer::new_with_data(self.gpu.clone(), BufferUsage::Staging, pixels)?;

        let ownership = self.ownership();
        let (src_family, dst_family) = ownership.barrier_families();

        let fence = self
            .record_and_submit(
                |cmd| {
                    let to_transfer_dst = ImageBarrier {
                        image: texture.image(),
                        old_layout: vk::ImageLayout::UNDEFINED,
                        new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        src_access: vk::AccessFlags::empty(),
                        dst_access: vk::AccessFlags::TRANSFER_WRITE,
                        src_queue_family: vk::QUEUE_FAMILY_IGNORED,
                        dst_queue_family: vk::QUEUE_FAMILY_IGNORED,
                    };
                    cmd.pipeline_barrier(
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::TRANSFER,
                        &[],
                        &[to_transfer_dst],
                    );

                    cmd.copy_buffer_to_image(
                        staging.handle(),
                        texture.image(),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[vk::BufferImageCopy {
                            buffer_offset: 0,
                            buffer_row_length: 0,
                            buffer_image_height: 0,
                            image_subresource: vk::ImageSubresourceLayers {
                                aspect_mask: vk::ImageAspectFlags::COLOR,
                                mip_level: 0,
                                base_array_layer: 0,
                                layer_count: 1,
                            },
                            image_offset: vk::Offset3D::default(),
                            image_extent: vk::Extent3D {
                                width: extent.width,
                                height: extent.height,
                                depth: 1,
                            },
                        }],
                    );

                    let to_shader_read = ImageBarrier {
                        image: texture.image(),
                        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        src_access: vk::AccessFlags::TRANSFER_WRITE,
                        dst_access: if ownership.is_required() {
                            vk::AccessFlags::empty()
                        } else {
                            vk::AccessFlags::SHADER_READ
                        },
                        src_queue_family: src_family,
                        dst_queue_family: dst_family,
                    };
                    cmd.pipeline_barrier(
                        vk::PipelineStageFlags::TRANSFER,
                        if ownership.is_required() {
                            vk::PipelineStageFlags::BOTTOM_OF_PIPE
                        } else {
                            vk::PipelineStageFlags::FRAGMENT_SHADER
                        },
                        &[],
                        &[to_shader_read],
                    );
                },
                |cmd| {
                    let acquire = ImageBarrier {
                        image: texture.image(),
                        old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        src_access: vk::AccessFlags::empty(),
                        dst_access: vk::AccessFlags::SHADER_READ,
                        src_queue_family: src_family,
                        dst_queue_family: dst_family,
                    };
                    cmd.pipeline_barrier(
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::FRAGMENT_SHADER,
                        &[],
                        &[acquire],
                    );
                },
            )
            .map_err(|e| RhiError::TransferFailed(format!("texture upload: {}", e)))?;

        debug!("Uploaded {}x{} texture", extent.width, extent.height);

        arena.retire_with(Resource::Buffer(staging), fence);
        let handle = arena.insert_texture(texture);
        arena.mark_used(handle, fence);
        Ok(handle)
    }

    /// Blocks until every upload issued so far has completed.
    pub fn wait_idle(&self) -> RhiResult<()> {
        wait_for_fences(
            self.gpu.as_ref(),
            &[self.transfer.fence.handle(), self.graphics.fence.handle()],
            false,
        )
    }

    /// Runs one upload cycle and returns the fence that signals its completion.
    ///
    /// `record` fills the transfer command buffer. `acquire` fills the
    /// graphics command buffer and only runs when ownership moves.
    fn record_and_submit(
        &mut self,
        record: impl FnOnce(&CommandBuffer<G>),
        acquire: impl FnOnce(&CommandBuffer<G>),
    ) -> RhiResult<vk::Fence> {
        let gpu = self.gpu.as_ref();
        let transfer = &self.transfer;

        begin_command_buffer(
            gpu,
            transfer.command_buffer.handle(),
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            &[transfer.fence.handle()],
            false,
        )?;
        record(&transfer.command_buffer);
        // Reset last so a failed begin leaves the fence signaled.
        transfer.fence.reset()?;
        submit_command_buffer(
            gpu,
            transfer.queue,
            transfer.command_buffer.handle(),
            &[],
            &[],
            &[],
            transfer.fence.handle(),
        )?;

        if !self.ownership().is_required() {
            return Ok(transfer.fence.handle());
        }

        // The acquire must not run before the release; wait without resetting
        // so the next upload's wait still returns.
        wait_for_fences(gpu, &[transfer.fence.handle()], false)?;

        let graphics = &self.graphics;
        begin_command_buffer(
            gpu,
            graphics.command_buffer.handle(),
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            &[graphics.fence.handle()],
            false,
        )?;
        acquire(&graphics.command_buffer);
        graphics.fence.reset()?;
        submit_command_buffer(
            gpu,
            graphics.queue,
            graphics.command_buffer.handle(),
            &[],
            &[],
            &[],
            graphics.fence.handle(),
        )?;

        Ok(graphics.fence.handle())
    }
}
