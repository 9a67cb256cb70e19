//! Platform layer for the presenter.
//!
//! This crate provides:
//! - Window management via winit
//! - Platform instance extensions and Vulkan surface creation via ash-window

mod window;

pub use window::{Surface, Window};

// Re-export winit types that users might need
pub use winit::event::WindowEvent;
pub use winit::event_loop::EventLoop;
