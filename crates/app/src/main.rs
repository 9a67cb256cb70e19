//! Presenter - Main Entry Point
//!
//! Opens a window, uploads a textured quad and presents it every frame
//! through a double-buffered Vulkan swapchain.

use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::WindowId;

use presenter_core::{FrameStats, RendererConfig, Timer};
use presenter_platform::Window;
use presenter_renderer::{QUAD_INDICES, VulkanContext, quad_vertices, vk};

const REPORT_INTERVAL: Duration = Duration::from_secs(5);
const CHECKER_SIZE: u32 = 8;

/// RGBA8 checkerboard used as the quad's texture.
fn checkerboard(size: u32) -> Vec<u8> {
    (0..size * size)
        .flat_map(|i| {
            let (x, y) = (i % size, i / size);
            if (x + y) % 2 == 0 {
                [255, 255, 255, 255]
            } else {
                [40, 40, 40, 255]
            }
        })
        .collect()
}

struct App {
    config: RendererConfig,
    // Field order is drop order: the context must go before its window.
    context: Option<VulkanContext>,
    window: Option<Window>,
    timer: Timer,
    stats: FrameStats,
}

impl App {
    fn new(config: RendererConfig) -> Self {
        Self {
            config,
            context: None,
            window: None,
            timer: Timer::new(),
            stats: FrameStats::new(REPORT_INTERVAL),
        }
    }

    fn init(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Window::new(event_loop, &self.config)?;
        let mut context = VulkanContext::new(&window, &self.config)?;

        let renderer = context.renderer_mut();
        let quad = renderer.upload_mesh(&quad_vertices(), &QUAD_INDICES)?;
        renderer.add_draw(quad);
        let extent = vk::Extent2D {
            width: CHECKER_SIZE,
            height: CHECKER_SIZE,
        };
        renderer.upload_texture(extent, &checkerboard(CHECKER_SIZE))?;

        self.context = Some(context);
        self.window = Some(window);
        Ok(())
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(context) = self.context.as_mut() else {
            return;
        };

        let frame_time = self.timer.tick();
        match context.render_frame() {
            Ok(_) => self.stats.record(frame_time),
            Err(e) if e.is_presentation_lost() => {
                error!("{}; shutting down", e);
                event_loop.exit();
                return;
            }
            Err(e) => {
                error!("Render error: {}", e);
                event_loop.exit();
                return;
            }
        }

        if let Some(report) = self.stats.take_report() {
            info!(
                "{} frames ({} total), {:.2} ms/frame, {:.1} fps",
                report.frames, report.total_frames, report.average_frame_ms, report.fps
            );
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.context.is_some() {
            return;
        }
        match self.init(event_loop) {
            Ok(()) => info!("Initialization complete, entering main loop"),
            Err(e) => {
                error!("Failed to initialize: {:#}", e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, shutting down");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(ref mut window) = self.window {
                    window.resize(size.width, size.height);
                }
                if let Some(ref mut context) = self.context {
                    context.resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(context) = self.context.take() {
            let stats = context.renderer().stats();
            info!(
                "Presented {} frames, {} skipped, {} swapchain rebuilds",
                stats.frames_presented, stats.skipped, stats.recreations
            );
        }
        if self.stats.total_frames() == 0 {
            warn!("Exited before any frame was presented");
        }
    }
}

fn main() -> Result<()> {
    presenter_core::init_logging();
    info!("Starting presenter");

    let config = RendererConfig::default();
    config.validate()?;

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkerboard_is_rgba8() {
        let pixels = checkerboard(4);
        assert_eq!(pixels.len(), 4 * 4 * 4);
        assert_eq!(&pixels[0..4], &[255, 255, 255, 255]);
        assert_eq!(&pixels[4..8], &[40, 40, 40, 255]);
        assert_eq!(&pixels[16..20], &[40, 40, 40, 255]);
    }
}
