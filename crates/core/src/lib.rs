//! Core utilities for the presenter workspace.
//!
//! This crate provides foundational types used across the other crates:
//! - Immutable configuration
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing

mod config;
mod error;
mod logging;
mod timer;

pub use config::{
    DEBUG_UTILS_EXTENSION, ExtentPolicy, FillMode, MAX_FRAMES_IN_FLIGHT, RendererConfig,
    SWAPCHAIN_EXTENSION, VALIDATION_LAYER,
};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use timer::{FrameReport, FrameStats, Timer};
