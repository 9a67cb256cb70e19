//! Frame orchestration and synchronization.
//!
//! This module provides the [`FrameOrchestrator`], which drives the
//! wait → acquire → record → submit → present cycle over a small ring of
//! [`RenderFrame`] slots.
//!
//! # Overview
//!
//! The orchestrator implements a "frames in flight" pattern:
//!
//! 1. While the GPU renders frame N, the CPU prepares frame N+1
//! 2. Each slot has its own command buffer, semaphores, fence and uniform
//!    buffer
//! 3. A slot's fence is waited on before the slot is touched again
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use presenter_renderer::FrameUniforms;
//! use presenter_renderer::frame_manager::{FrameOrchestrator, FrameOutcome};
//! use presenter_rhi::device::Device;
//! use presenter_rhi::pipeline::{GraphicsPipeline, RenderPass};
//! use presenter_rhi::swapchain::Swapchain;
//!
//! # fn example(
//! #     device: Arc<Device>,
//! #     swapchain: &Swapchain<Device>,
//! #     render_pass: &RenderPass<Device>,
//! #     pipeline: &GraphicsPipeline<Device>,
//! # ) -> Result<(), presenter_rhi::RhiError> {
//! let mut frames = FrameOrchestrator::new(device, 2)?;
//!
//! let uniforms = FrameUniforms::default();
//! match frames.render(swapchain, render_pass, pipeline, &uniforms, &[])? {
//!     FrameOutcome::Presented { status, .. } => println!("presented: {:?}", status),
//!     FrameOutcome::Skipped(status) => println!("skipped: {:?}", status),
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use tracing::{debug, info, warn};

use presenter_core::MAX_FRAMES_IN_FLIGHT;
use presenter_rhi::command::{CommandPool, submit_command_buffer};
use presenter_rhi::pipeline::{GraphicsPipeline, RenderPass};
use presenter_rhi::buffer::Buffer;
use presenter_rhi::swapchain::{Acquired, PresentResult, Swapchain};
use presenter_rhi::{Gpu, RhiResult};

use crate::draw::DrawCall;
use crate::frame::RenderFrame;
use crate::ubo::FrameUniforms;

/// Frames between full blue peaks of the animated clear color.
const CLEAR_PULSE_PERIOD: f32 = 500.0;

/// Clear color of frame `frame_number`: black with a pulsing blue channel.
pub fn clear_color(frame_number: u64) -> [f32; 4] {
    let flash = (frame_number as f32 / CLEAR_PULSE_PERIOD).sin().abs();
    [0.0, 0.0, flash, 1.0]
}

/// Result of one [`FrameOrchestrator::render`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and handed to the presentation engine.
    Presented {
        image_index: u32,
        /// Signaled when the GPU has finished this frame's commands.
        fence: vk::Fence,
        /// Present status, [`PresentResult::OutOfDate`] if the acquire was
        /// already suboptimal.
        status: PresentResult,
    },
    /// No image could be acquired. Nothing was submitted and the slot was
    /// left as it was.
    Skipped(PresentResult),
}

impl FrameOutcome {
    /// Presentation status of the frame, whether presented or not.
    #[inline]
    pub fn status(&self) -> PresentResult {
        match *self {
            FrameOutcome::Presented { status, .. } => status,
            FrameOutcome::Skipped(status) => status,
        }
    }
}

/// Drives the frame loop over `N` frame contexts in round-robin.
///
/// # Thread Safety
///
/// The orchestrator is not thread-safe. It should only be accessed
/// from a single thread (typically the main/render thread).
pub struct FrameOrchestrator<G: Gpu> {
    gpu: Arc<G>,
    frames: Vec<RenderFrame<G>>,
    current: usize,
    /// Frames submitted since creation; drives the clear color.
    frame_number: u64,
    // Command buffers are freed with the pool, after the frames.
    _pool: CommandPool<G>,
}

impl<G: Gpu> FrameOrchestrator<G> {
    /// Creates `frames_in_flight` frame contexts on the graphics family.
    ///
    /// The count is clamped to `1..=MAX_FRAMES_IN_FLIGHT`.
    ///
    /// # Errors
    ///
    /// Returns an error if any pool, command buffer or sync object creation
    /// fails.
    pub fn new(gpu: Arc<G>, frames_in_flight: usize) -> RhiResult<Self> {
        let count = frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);
        if count != frames_in_flight {
            warn!(
                "Clamped frames in flight from {} to {}",
                frames_in_flight, count
            );
        }

        let pool = CommandPool::new(gpu.clone(), gpu.queue_roles().graphics)?;
        let mut frames = Vec::with_capacity(count);
        for (i, command_buffer) in pool
            .allocate_command_buffers(count as u32)?
            .into_iter()
            .enumerate()
        {
            frames.push(RenderFrame::new(gpu.clone(), command_buffer)?);
            debug!("Created frame context {}", i);
        }

        info!("Frame orchestrator created with {} frames in flight", count);

        Ok(Self {
            gpu,
            frames,
            current: 0,
            frame_number: 0,
            _pool: pool,
        })
    }

    /// Renders and presents one frame on the current slot.
    ///
    /// 1. Waits on the slot's fence, then writes `uniforms` into the slot's
    ///    uniform buffer.
    /// 2. Acquires an image, signaling the slot's `image_ready` semaphore.
    ///    If none is available the slot is left untouched and the status is
    ///    returned as [`FrameOutcome::Skipped`].
    /// 3. Rebuilds the slot's framebuffer.
    /// 4. Records one render pass issuing every draw in `draws`.
    /// 5. Resets the fence and submits on the graphics queue, waiting on
    ///    `image_ready` at color attachment output and signaling
    ///    `presentation_ready` and the fence.
    /// 6. Presents on the present queue, waiting on `presentation_ready`.
    ///
    /// # Errors
    ///
    /// Any failure that is not a stale-swapchain or lost-device status.
    pub fn render(
        &mut self,
        swapchain: &Swapchain<G>,
        render_pass: &RenderPass<G>,
        pipeline: &GraphicsPipeline<G>,
        uniforms: &FrameUniforms,
        draws: &[DrawCall<'_>],
    ) -> RhiResult<FrameOutcome> {
        let slot = self.current;
        let frame = &mut self.frames[slot];

        frame.in_flight().wait()?;
        frame.write_uniforms(uniforms)?;

        let (image_index, suboptimal) = match swapchain.acquire(frame.image_ready())? {
            Acquired::Image { index, suboptimal } => (index, suboptimal),
            Acquired::Unavailable(status) => {
                debug!("Frame slot {} skipped: acquire reported {:?}", slot, status);
                return Ok(FrameOutcome::Skipped(status));
            }
        };

        let framebuffer = frame.rebuild_framebuffer(swapchain, render_pass.handle(), image_index)?;

        let cmd = frame.command_buffer();
        cmd.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)?;
        cmd.begin_render_pass(
            render_pass.handle(),
            framebuffer,
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: swapchain.extent(),
            },
            clear_color(self.frame_number),
        );
        cmd.bind_pipeline(pipeline.bind_point(), pipeline.handle());
        for draw in draws {
            cmd.bind_vertex_buffers(0, &[draw.vertex_buffer], &[0]);
            cmd.bind_index_buffer(draw.index_buffer, 0, vk::IndexType::UINT32);
            if !draw.descriptor_sets.is_empty() {
                cmd.bind_descriptor_sets(pipeline.layout(), 0, draw.descriptor_sets);
            }
            cmd.draw_indexed(draw.index_count, 1, 0, 0, 0);
        }
        cmd.end_render_pass();

        // Only reset once a submission is certain to re-signal the fence.
        frame.in_flight().reset()?;
        let fence = frame.in_flight().handle();
        submit_command_buffer(
            self.gpu.as_ref(),
            self.gpu.graphics_queue(),
            cmd.handle(),
            &[frame.image_ready()],
            &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            &[frame.presentation_ready()],
            fence,
        )?;

        let presentation_ready = frame.presentation_ready();
        self.current = (self.current + 1) % self.frames.len();
        self.frame_number += 1;

        let mut status =
            swapchain.present(self.gpu.present_queue(), image_index, &[presentation_ready])?;
        if suboptimal && status == PresentResult::Ok {
            status = PresentResult::OutOfDate;
        }

        debug!(
            "Frame {} presented image {} from slot {} ({:?})",
            self.frame_number, image_index, slot, status
        );

        Ok(FrameOutcome::Presented {
            image_index,
            fence,
            status,
        })
    }

    /// Destroys every slot's framebuffer.
    ///
    /// Call before the swapchain views are destroyed. The device must be
    /// idle.
    pub fn release_framebuffers(&mut self) {
        for frame in &mut self.frames {
            frame.release_framebuffer();
        }
    }

    /// Uniform buffer of every slot, in slot order.
    pub fn uniform_buffers(&self) -> impl Iterator<Item = &Buffer<G>> {
        self.frames.iter().map(RenderFrame::uniform_buffer)
    }

    /// Returns the frame contexts in slot order.
    #[inline]
    pub fn frames(&self) -> &[RenderFrame<G>] {
        &self.frames
    }

    /// Returns the number of frames in flight.
    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    /// Slot the next [`render`](Self::render) call will use.
    #[inline]
    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Frames submitted so far.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }
}
