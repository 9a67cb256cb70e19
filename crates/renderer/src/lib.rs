//! Frame orchestration and the presentation loop.
//!
//! This crate drives the RHI layer:
//! - Per-frame command buffers, semaphores, fences and uniform buffers
//! - Recording and submitting the fixed render pass each frame
//! - Swapchain rebuilds on resize, out-of-date and surface loss
//! - Window-backed Vulkan bootstrap

pub mod context;
pub mod draw;
pub mod frame;
pub mod frame_manager;
pub mod renderer;
pub mod ubo;

pub use context::VulkanContext;
pub use draw::{DrawCall, MeshDraw, QUAD_INDICES, quad_vertices};
pub use frame::RenderFrame;
pub use frame_manager::{FrameOrchestrator, FrameOutcome, clear_color};
pub use renderer::{RenderStats, Renderer, ShaderSources};
pub use ubo::FrameUniforms;

pub use presenter_core::MAX_FRAMES_IN_FLIGHT;
pub use presenter_rhi::vk;
