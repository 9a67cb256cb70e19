//! Command pool and command buffer management.
//!
//! # Overview
//!
//! - [`CommandPool`] owns a pool for one queue family and allocates buffers.
//! - [`CommandBuffer`] records typed commands into one buffer.
//! - [`begin_command_buffer`], [`wait_for_fences`] and
//!   [`submit_command_buffer`] are the small primitives both the transfer path
//!   and the frame loop are built on.
//! - [`CommandBufferStructure`] bundles a buffer with its fence, queue and
//!   queue family for one-shot, fire-and-wait work.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use presenter_rhi::command::{CommandBuffer, CommandPool};
//! use presenter_rhi::device::Device;
//! use presenter_rhi::gpu::Gpu;
//! use presenter_rhi::vk;
//!
//! # fn example(device: Arc<Device>) -> Result<(), presenter_rhi::RhiError> {
//! let pool = CommandPool::new(device.clone(), device.queue_roles().graphics)?;
//! let cmd = pool.allocate_command_buffer()?;
//!
//! cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
//! // ... record commands ...
//! cmd.end()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info};

use crate::error::{RhiError, RhiResult};
use crate::gpu::{BufferBarrier, Command, Gpu, ImageBarrier, SubmitDesc};
use crate::sync::Fence;

/// Command pool wrapper.
///
/// Created with `RESET_COMMAND_BUFFER` so buffers can be re-begun
/// individually. Destroying the pool frees every buffer allocated from it.
pub struct CommandPool<G: Gpu> {
    gpu: Arc<G>,
    pool: vk::CommandPool,
    queue_family_index: u32,
}

impl<G: Gpu> CommandPool<G> {
    /// Creates a new command pool for the specified queue family.
    ///
    /// # Errors
    ///
    /// Returns an error if command pool creation fails.
    pub fn new(gpu: Arc<G>, queue_family_index: u32) -> RhiResult<Self> {
        let pool = gpu.create_command_pool(
            queue_family_index,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )?;

        info!(
            "Command pool created for queue family {}",
            queue_family_index
        );

        Ok(Self {
            gpu,
            pool,
            queue_family_index,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    #[inline]
    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    /// Allocates a single primary command buffer.
    pub fn allocate_command_buffer(&self) -> RhiResult<CommandBuffer<G>> {
        let mut buffers = self.allocate_command_buffers(1)?;
        buffers.pop().ok_or_else(|| {
            RhiError::AllocationFailed("Command buffer allocation returned nothing".into())
        })
    }

    /// Allocates `count` primary command buffers.
    pub fn allocate_command_buffers(&self, count: u32) -> RhiResult<Vec<CommandBuffer<G>>> {
        let handles = self.gpu.allocate_command_buffers(self.pool, count)?;
        debug!(
            "Allocated {} command buffers from pool {:?}",
            handles.len(),
            self.pool
        );
        Ok(handles
            .into_iter()
            .map(|buffer| CommandBuffer::from_handle(self.gpu.clone(), buffer))
            .collect())
    }
}

impl<G: Gpu> Drop for CommandPool<G> {
    fn drop(&mut self) {
        self.gpu.destroy_command_pool(self.pool);
        info!(
            "Command pool destroyed for queue family {}",
            self.queue_family_index
        );
    }
}

/// Command buffer recorder.
///
/// Does not own the buffer; it is freed together with its pool.
pub struct CommandBuffer<G: Gpu> {
    gpu: Arc<G>,
    buffer: vk::CommandBuffer,
}

impl<G: Gpu> CommandBuffer<G> {
    /// Wraps an existing command buffer handle.
    pub fn from_handle(gpu: Arc<G>, buffer: vk::CommandBuffer) -> Self {
        Self { gpu, buffer }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.buffer
    }

    // =========================================================================
    // Recording lifecycle
    // =========================================================================

    /// Begins recording.
    ///
    /// The previous submission of this buffer must have completed.
    pub fn begin(&self, flags: vk::CommandBufferUsageFlags) -> RhiResult<()> {
        self.gpu.begin_command_buffer(self.buffer, flags)
    }

    /// Ends recording.
    pub fn end(&self) -> RhiResult<()> {
        self.gpu.end_command_buffer(self.buffer)
    }

    fn push(&self, command: Command) {
        self.gpu.record(self.buffer, &command);
    }

    // =========================================================================
    // Render pass
    // =========================================================================

    /// Begins a render pass clearing the single color attachment.
    pub fn begin_render_pass(
        &self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        render_area: vk::Rect2D,
        clear_color: [f32; 4],
    ) {
        self.push(Command::BeginRenderPass {
            render_pass,
            framebuffer,
            render_area,
            clear_color,
        });
    }

    pub fn end_render_pass(&self) {
        self.push(Command::EndRenderPass);
    }

    // =========================================================================
    // Binding
    // =========================================================================

    pub fn bind_pipeline(&self, bind_point: vk::PipelineBindPoint, pipeline: vk::Pipeline) {
        self.push(Command::BindPipeline {
            bind_point,
            pipeline,
        });
    }

    pub fn bind_vertex_buffers(
        &self,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        self.push(Command::BindVertexBuffers {
            first_binding,
            buffers: buffers.to_vec(),
            offsets: offsets.to_vec(),
        });
    }

    pub fn bind_index_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.push(Command::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
    }

    pub fn bind_descriptor_sets(
        &self,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.push(Command::BindDescriptorSets {
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    // =========================================================================
    // Drawing
    // =========================================================================

    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        self.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        });
    }

    // =========================================================================
    // Synchronization and transfer
    // =========================================================================

    pub fn pipeline_barrier(
        &self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        buffer_barriers: &[BufferBarrier],
        image_barriers: &[ImageBarrier],
    ) {
        self.push(Command::PipelineBarrier {
            src_stage,
            dst_stage,
            buffer_barriers: buffer_barriers.to_vec(),
            image_barriers: image_barriers.to_vec(),
        });
    }

    pub fn copy_buffer(&self, src: vk::Buffer, dst: vk::Buffer, regions: &[vk::BufferCopy]) {
        self.push(Command::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    pub fn copy_buffer_to_image(
        &self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.push(Command::CopyBufferToImage {
            src,
            dst,
            dst_layout,
            regions: regions.to_vec(),
        });
    }
}

/// Waits on every fence in `fences`, then optionally resets all of them.
///
/// An empty list is a no-op.
pub fn wait_for_fences<G: Gpu>(gpu: &G, fences: &[vk::Fence], reset: bool) -> RhiResult<()> {
    if fences.is_empty() {
        return Ok(());
    }
    gpu.wait_for_fences(fences, u64::MAX)?;
    if reset {
        gpu.reset_fences(fences)?;
    }
    Ok(())
}

/// Waits on `fences` (see [`wait_for_fences`]) and then begins recording.
pub fn begin_command_buffer<G: Gpu>(
    gpu: &G,
    command_buffer: vk::CommandBuffer,
    flags: vk::CommandBufferUsageFlags,
    fences: &[vk::Fence],
    reset: bool,
) -> RhiResult<()> {
    wait_for_fences(gpu, fences, reset)?;
    gpu.begin_command_buffer(command_buffer, flags)
}

/// Ends `command_buffer` and submits it alone to `queue`.
///
/// `wait_stages` holds one stage mask per entry in `wait_semaphores`.
pub fn submit_command_buffer<G: Gpu>(
    gpu: &G,
    queue: vk::Queue,
    command_buffer: vk::CommandBuffer,
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> RhiResult<()> {
    gpu.end_command_buffer(command_buffer)?;
    let command_buffers = [command_buffer];
    let submit = SubmitDesc {
        wait_semaphores,
        wait_stages,
        command_buffers: &command_buffers,
        signal_semaphores,
    };
    gpu.queue_submit(queue, &submit, fence)
}

/// One command buffer with the fence that guards it, the queue it is
/// submitted to, and that queue's family.
pub struct CommandBufferStructure<G: Gpu> {
    pub command_buffer: CommandBuffer<G>,
    /// Starts signaled so the first use does not block.
    pub fence: Fence<G>,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
}

impl<G: Gpu> CommandBufferStructure<G> {
    /// Allocates a buffer from `pool` for submission to `queue`.
    pub fn new(gpu: Arc<G>, pool: &CommandPool<G>, queue: vk::Queue) -> RhiResult<Self> {
        let command_buffer = pool.allocate_command_buffer()?;
        let fence = Fence::new(gpu, true)?;
        Ok(Self {
            command_buffer,
            fence,
            queue,
            queue_family_index: pool.queue_family_index(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGpu;
    use crate::physical_device::QueueRoles;

    fn setup() -> (Arc<MockGpu>, CommandPool<MockGpu>) {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let pool = CommandPool::new(gpu.clone(), 0).unwrap();
        (gpu, pool)
    }

    #[test]
    fn test_wait_for_no_fences_is_noop() {
        let (gpu, _pool) = setup();
        wait_for_fences(gpu.as_ref(), &[], true).unwrap();
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn test_wait_resets_every_fence() {
        let (gpu, _pool) = setup();
        let a = Fence::new(gpu.clone(), true).unwrap();
        let b = Fence::new(gpu.clone(), true).unwrap();

        wait_for_fences(gpu.as_ref(), &[a.handle(), b.handle()], true).unwrap();
        assert!(!a.is_signaled().unwrap());
        assert!(!b.is_signaled().unwrap());

        let c = Fence::new(gpu.clone(), true).unwrap();
        wait_for_fences(gpu.as_ref(), &[c.handle()], false).unwrap();
        assert!(c.is_signaled().unwrap());
    }

    #[test]
    fn test_submit_ends_then_submits_with_semaphores() {
        let (gpu, pool) = setup();
        let structure = CommandBufferStructure::new(gpu.clone(), &pool, gpu.graphics_queue()).unwrap();
        let wait = gpu.create_semaphore().unwrap();
        let signal = gpu.create_semaphore().unwrap();
        let cb = structure.command_buffer.handle();

        // Simulate an acquire having signaled `wait`.
        let other = pool.allocate_command_buffer().unwrap();
        other.begin(vk::CommandBufferUsageFlags::empty()).unwrap();
        submit_command_buffer(
            gpu.as_ref(),
            gpu.graphics_queue(),
            other.handle(),
            &[],
            &[],
            &[wait],
            vk::Fence::null(),
        )
        .unwrap();

        begin_command_buffer(
            gpu.as_ref(),
            cb,
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            &[structure.fence.handle()],
            true,
        )
        .unwrap();
        structure.command_buffer.draw_indexed(6, 1, 0, 0, 0);
        submit_command_buffer(
            gpu.as_ref(),
            structure.queue,
            cb,
            &[wait],
            &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            &[signal],
            structure.fence.handle(),
        )
        .unwrap();

        let submissions = gpu.submissions();
        let last = submissions.last().unwrap();
        assert_eq!(last.command_buffers, vec![cb]);
        assert_eq!(last.wait_semaphores, vec![wait]);
        assert_eq!(last.signal_semaphores, vec![signal]);
        assert_eq!(last.fence, structure.fence.handle());
        assert!(matches!(
            last.commands[0].as_slice(),
            [Command::DrawIndexed { index_count: 6, .. }]
        ));
        assert_eq!(structure.queue_family_index, 0);
        assert!(gpu.violations().is_empty());

        structure.fence.wait().unwrap();
        gpu.destroy_semaphore(wait);
        gpu.destroy_semaphore(signal);
    }

    #[test]
    fn test_fence_round_trip_allows_rerecording() {
        let (gpu, pool) = setup();
        let structure = CommandBufferStructure::new(gpu.clone(), &pool, gpu.graphics_queue()).unwrap();
        let cb = structure.command_buffer.handle();

        for _ in 0..16 {
            begin_command_buffer(
                gpu.as_ref(),
                cb,
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                &[structure.fence.handle()],
                true,
            )
            .unwrap();
            submit_command_buffer(
                gpu.as_ref(),
                structure.queue,
                cb,
                &[],
                &[],
                &[],
                structure.fence.handle(),
            )
            .unwrap();
        }

        assert_eq!(gpu.begin_count(cb), 16);
        assert_eq!(gpu.fence_waits(structure.fence.handle()), 16);
        assert!(gpu.violations().is_empty());
        structure.fence.wait().unwrap();
    }
}
