//! Per-slot frame context.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use presenter_rhi::buffer::{Buffer, BufferUsage};
use presenter_rhi::command::CommandBuffer;
use presenter_rhi::swapchain::Swapchain;
use presenter_rhi::sync::{Fence, Semaphore};
use presenter_rhi::{Gpu, RhiError, RhiResult};

use crate::ubo::FrameUniforms;

/// One rotating slot of CPU-side frame resources.
///
/// # Synchronization Flow
///
/// ```text
/// 1. Wait on in_flight (the previous use of this slot has finished)
/// 2. Write this frame's uniforms into uniform_buffer
/// 3. Acquire a swapchain image, signaling image_ready
/// 4. Rebuild the framebuffer for the acquired image
/// 5. Record into command_buffer
/// 6. Reset in_flight and submit:
///    - Wait on image_ready at COLOR_ATTACHMENT_OUTPUT
///    - Signal presentation_ready
///    - Signal in_flight
/// 7. Present, waiting on presentation_ready
/// ```
pub struct RenderFrame<G: Gpu> {
    gpu: Arc<G>,
    command_buffer: CommandBuffer<G>,
    image_ready: Semaphore<G>,
    presentation_ready: Semaphore<G>,
    /// Created signaled so the first wait returns immediately.
    in_flight: Fence<G>,
    /// Host-visible; only written once in_flight has been waited on.
    uniform_buffer: Buffer<G>,
    framebuffer: vk::Framebuffer,
}

impl<G: Gpu> RenderFrame<G> {
    pub(crate) fn new(gpu: Arc<G>, command_buffer: CommandBuffer<G>) -> RhiResult<Self> {
        let image_ready = Semaphore::new(gpu.clone())?;
        let presentation_ready = Semaphore::new(gpu.clone())?;
        let in_flight = Fence::new(gpu.clone(), true)?;
        let uniform_buffer = Buffer::new(
            gpu.clone(),
            BufferUsage::Uniform,
            FrameUniforms::SIZE as vk::DeviceSize,
        )?;

        Ok(Self {
            gpu,
            command_buffer,
            image_ready,
            presentation_ready,
            in_flight,
            uniform_buffer,
            framebuffer: vk::Framebuffer::null(),
        })
    }

    #[inline]
    pub fn command_buffer(&self) -> &CommandBuffer<G> {
        &self.command_buffer
    }

    #[inline]
    pub fn image_ready(&self) -> vk::Semaphore {
        self.image_ready.handle()
    }

    #[inline]
    pub fn presentation_ready(&self) -> vk::Semaphore {
        self.presentation_ready.handle()
    }

    #[inline]
    pub fn in_flight(&self) -> &Fence<G> {
        &self.in_flight
    }

    /// Buffer holding this slot's [`FrameUniforms`], for the caller's
    /// descriptor sets.
    #[inline]
    pub fn uniform_buffer(&self) -> &Buffer<G> {
        &self.uniform_buffer
    }

    /// Overwrites the slot's uniform buffer.
    ///
    /// Must only be called after [`in_flight`](Self::in_flight) has been
    /// waited on: the previous submission from this slot may still read it.
    pub(crate) fn write_uniforms(&self, uniforms: &FrameUniforms) -> RhiResult<()> {
        self.uniform_buffer.write(bytemuck::bytes_of(uniforms))
    }

    /// Framebuffer built for the most recently acquired image, or null.
    #[inline]
    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    /// Destroys the previous framebuffer and builds one over the view of
    /// `image_index`.
    ///
    /// Acquire order does not follow slot rotation, so the slot cannot keep a
    /// fixed image. Must only be called after [`in_flight`](Self::in_flight)
    /// has been waited on.
    pub(crate) fn rebuild_framebuffer(
        &mut self,
        swapchain: &Swapchain<G>,
        render_pass: vk::RenderPass,
        image_index: u32,
    ) -> RhiResult<vk::Framebuffer> {
        self.release_framebuffer();

        let view = swapchain.image_view(image_index).ok_or_else(|| {
            RhiError::InvalidHandle(format!(
                "acquired image index {} out of range for {} swapchain images",
                image_index,
                swapchain.references().len()
            ))
        })?;

        self.framebuffer = self
            .gpu
            .create_framebuffer(render_pass, &[view], swapchain.extent())?;
        debug!(
            "Framebuffer {:?} built for swapchain image {}",
            self.framebuffer, image_index
        );
        Ok(self.framebuffer)
    }

    /// Destroys the framebuffer, if any.
    ///
    /// Needed before the swapchain views it references are destroyed.
    pub(crate) fn release_framebuffer(&mut self) {
        if self.framebuffer != vk::Framebuffer::null() {
            self.gpu.destroy_framebuffer(self.framebuffer);
            self.framebuffer = vk::Framebuffer::null();
        }
    }
}

impl<G: Gpu> Drop for RenderFrame<G> {
    fn drop(&mut self) {
        self.release_framebuffer();
    }
}
