//! Window-backed Vulkan bootstrap.
//!
//! [`VulkanContext`] owns every object between the instance and the
//! renderer, and tears them down in reverse creation order.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use tracing::info;

use presenter_core::{RendererConfig, Result};
use presenter_platform::{Surface, Window};
use presenter_rhi::device::Device;
use presenter_rhi::instance::Instance;
use presenter_rhi::physical_device::select_physical_device;
use presenter_rhi::swapchain::PresentResult;

use crate::renderer::{Renderer, ShaderSources};

/// Instance, surface, device and renderer for one window.
pub struct VulkanContext {
    renderer: ManuallyDrop<Renderer<Device>>,
    device: ManuallyDrop<Arc<Device>>,
    surface: ManuallyDrop<Surface>,
    instance: ManuallyDrop<Instance>,
}

impl VulkanContext {
    /// Creates the instance with the window's surface extensions, picks a
    /// physical device, creates the logical device and builds the renderer
    /// with the shaders named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or any Vulkan
    /// object cannot be created.
    pub fn new(window: &Window, config: &RendererConfig) -> Result<Self> {
        config.validate()?;

        let surface_extensions = window.required_extensions()?;
        let instance = Instance::new(config, &surface_extensions)?;
        let surface = window.create_surface(instance.entry(), instance.handle())?;

        let info = select_physical_device(&instance, surface.handle(), config.device_extensions())?;
        let device = Device::new(&instance, &info, config.device_extensions())?;

        let sources = ShaderSources::load(config)?;
        let renderer = Renderer::new(device.clone(), surface.handle(), config, &sources)?;

        info!("Vulkan context ready on '{}'", info.device_name());

        Ok(Self {
            renderer: ManuallyDrop::new(renderer),
            device: ManuallyDrop::new(device),
            surface: ManuallyDrop::new(surface),
            instance: ManuallyDrop::new(instance),
        })
    }

    #[inline]
    pub fn renderer(&self) -> &Renderer<Device> {
        &self.renderer
    }

    #[inline]
    pub fn renderer_mut(&mut self) -> &mut Renderer<Device> {
        &mut self.renderer
    }

    #[inline]
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.renderer.resize(width, height);
    }

    /// Renders and presents one frame.
    pub fn render_frame(&mut self) -> Result<PresentResult> {
        Ok(self.renderer.render_frame()?)
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        // SAFETY: Each field is dropped exactly once, here. The renderer holds
        // device clones, so it goes first; the device must be gone before the
        // surface, and the surface before the instance.
        unsafe {
            ManuallyDrop::drop(&mut self.renderer);
            ManuallyDrop::drop(&mut self.device);
            ManuallyDrop::drop(&mut self.surface);
            ManuallyDrop::drop(&mut self.instance);
        }
        info!("Vulkan context destroyed");
    }
}
