//! Immutable renderer configuration.
//!
//! A [`RendererConfig`] is assembled once at startup and handed to the setup
//! entry points by reference. Nothing in the workspace mutates it afterwards;
//! the `with_*` methods consume the value and return a new one.

use std::ffi::CStr;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// The Khronos validation layer.
pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extension needed for the validation debug messenger.
pub const DEBUG_UTILS_EXTENSION: &CStr = c"VK_EXT_debug_utils";

/// Device extension needed to present anything at all.
pub const SWAPCHAIN_EXTENSION: &CStr = c"VK_KHR_swapchain";

/// Upper bound on frame contexts; beyond triple buffering only latency grows.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// How the swapchain extent is derived from the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtentPolicy {
    /// Always use the surface's minimum image extent.
    SurfaceMinimum,
    /// Use the surface's current extent, or the window size clamped into the
    /// supported range when the surface leaves the choice to the swapchain.
    #[default]
    FollowWindow,
}

/// Rasterization fill mode for the fixed pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    #[default]
    Fill,
    Wireframe,
}

/// Settings consumed by instance, device, swapchain and frame-loop setup.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    window_width: u32,
    window_height: u32,
    window_title: String,
    validation_layers: Vec<&'static CStr>,
    instance_extensions: Vec<&'static CStr>,
    device_extensions: Vec<&'static CStr>,
    frames_in_flight: usize,
    extent_policy: ExtentPolicy,
    fill_mode: FillMode,
    vertex_shader: PathBuf,
    fragment_shader: PathBuf,
    /// Control and evaluation stages, used only on devices with
    /// `tessellationShader`.
    tessellation_shaders: Option<(PathBuf, PathBuf)>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        let validation = cfg!(debug_assertions);
        Self {
            window_width: 800,
            window_height: 600,
            window_title: "Presenter".to_string(),
            validation_layers: if validation {
                vec![VALIDATION_LAYER]
            } else {
                Vec::new()
            },
            instance_extensions: if validation {
                vec![DEBUG_UTILS_EXTENSION]
            } else {
                Vec::new()
            },
            device_extensions: vec![SWAPCHAIN_EXTENSION],
            frames_in_flight: 2,
            extent_policy: ExtentPolicy::default(),
            fill_mode: FillMode::default(),
            vertex_shader: PathBuf::from("shaders/spirv/quad.vert.spv"),
            fragment_shader: PathBuf::from("shaders/spirv/quad.frag.spv"),
            tessellation_shaders: None,
        }
    }
}

impl RendererConfig {
    /// Checks the configuration for values the setup code cannot honor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero-sized window, a frame count outside
    /// `1..=MAX_FRAMES_IN_FLIGHT`, or a device extension list without
    /// `VK_KHR_swapchain`.
    pub fn validate(&self) -> Result<()> {
        if self.window_width == 0 || self.window_height == 0 {
            return Err(Error::Config(format!(
                "window size must be non-zero, got {}x{}",
                self.window_width, self.window_height
            )));
        }
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&self.frames_in_flight) {
            return Err(Error::Config(format!(
                "frames_in_flight must be in 1..={}, got {}",
                MAX_FRAMES_IN_FLIGHT, self.frames_in_flight
            )));
        }
        if !self.device_extensions.contains(&SWAPCHAIN_EXTENSION) {
            return Err(Error::Config(
                "device extensions must include VK_KHR_swapchain".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_window_size(mut self, width: u32, height: u32) -> Self {
        self.window_width = width;
        self.window_height = height;
        self
    }

    pub fn with_window_title(mut self, title: impl Into<String>) -> Self {
        self.window_title = title.into();
        self
    }

    /// Replaces the validation layer list. The debug utils extension follows
    /// the layers: it is requested exactly when at least one layer is.
    pub fn with_validation_layers(mut self, layers: Vec<&'static CStr>) -> Self {
        self.instance_extensions.retain(|ext| *ext != DEBUG_UTILS_EXTENSION);
        if !layers.is_empty() {
            self.instance_extensions.push(DEBUG_UTILS_EXTENSION);
        }
        self.validation_layers = layers;
        self
    }

    pub fn with_device_extensions(mut self, extensions: Vec<&'static CStr>) -> Self {
        self.device_extensions = extensions;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    pub fn with_extent_policy(mut self, policy: ExtentPolicy) -> Self {
        self.extent_policy = policy;
        self
    }

    pub fn with_fill_mode(mut self, mode: FillMode) -> Self {
        self.fill_mode = mode;
        self
    }

    pub fn with_shaders(mut self, vertex: impl Into<PathBuf>, fragment: impl Into<PathBuf>) -> Self {
        self.vertex_shader = vertex.into();
        self.fragment_shader = fragment.into();
        self
    }

    pub fn with_tessellation_shaders(
        mut self,
        control: impl Into<PathBuf>,
        evaluation: impl Into<PathBuf>,
    ) -> Self {
        self.tessellation_shaders = Some((control.into(), evaluation.into()));
        self
    }

    #[inline]
    pub fn window_width(&self) -> u32 {
        self.window_width
    }

    #[inline]
    pub fn window_height(&self) -> u32 {
        self.window_height
    }

    #[inline]
    pub fn window_title(&self) -> &str {
        &self.window_title
    }

    #[inline]
    pub fn validation_layers(&self) -> &[&'static CStr] {
        &self.validation_layers
    }

    /// Returns true when any validation layer is requested.
    #[inline]
    pub fn validation_enabled(&self) -> bool {
        !self.validation_layers.is_empty()
    }

    /// Extra instance extensions on top of the platform surface extensions.
    #[inline]
    pub fn instance_extensions(&self) -> &[&'static CStr] {
        &self.instance_extensions
    }

    #[inline]
    pub fn device_extensions(&self) -> &[&'static CStr] {
        &self.device_extensions
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    #[inline]
    pub fn extent_policy(&self) -> ExtentPolicy {
        self.extent_policy
    }

    #[inline]
    pub fn fill_mode(&self) -> FillMode {
        self.fill_mode
    }

    #[inline]
    pub fn vertex_shader(&self) -> &Path {
        &self.vertex_shader
    }

    #[inline]
    pub fn fragment_shader(&self) -> &Path {
        &self.fragment_shader
    }

    /// Tessellation control and evaluation shader paths, if configured.
    #[inline]
    pub fn tessellation_shaders(&self) -> Option<(&Path, &Path)> {
        self.tessellation_shaders
            .as_ref()
            .map(|(control, evaluation)| (control.as_path(), evaluation.as_path()))
    }
}
