//! Vulkan abstraction layer (Render Hardware Interface).
//!
//! This crate provides a safe abstraction over Vulkan using the `ash` crate.
//! It handles:
//! - Instance creation and physical device selection
//! - Logical device and swapchain management
//! - Command buffer recording and synchronization primitives
//! - Buffer, texture and memory management
//! - Staging uploads with queue family ownership transfer
//! - Render pass and pipeline creation
//!
//! Everything above the instance is generic over the [`Gpu`] trait.
//! [`Device`](device::Device) is the real backend; `MockGpu` (feature
//! `mock`) records calls for tests.

mod error;

pub mod arena;
pub mod buffer;
pub mod command;
pub mod device;
pub mod gpu;
pub mod instance;
pub mod memory;
pub mod physical_device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod transfer;
pub mod vertex;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use error::{ErrorKind, RhiError, RhiResult};
pub use gpu::Gpu;

// Re-export ash types that users might need
pub use ash::vk;
