//! Main renderer orchestration.
//!
//! This module provides the [`Renderer`], which owns the swapchain, the
//! fixed pipeline, the uploaded meshes and the frame contexts, and turns
//! every presentation status into either a normal frame or a swapchain
//! rebuild.

use std::path::Path;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info, warn};

use presenter_core::RendererConfig;
use presenter_rhi::arena::{ResourceArena, ResourceHandle};
use presenter_rhi::buffer::BufferUsage;
use presenter_rhi::pipeline::{
    GraphicsPipeline, PipelineConfig, PipelineLayout, PipelineShaders, RenderPass,
};
use presenter_rhi::shader::{Shader, ShaderStage};
use presenter_rhi::swapchain::{PresentResult, Swapchain};
use presenter_rhi::transfer::TransferEngine;
use presenter_rhi::vertex::Vertex;
use presenter_rhi::{Gpu, RhiError, RhiResult};

use crate::draw::MeshDraw;
use crate::frame_manager::{FrameOrchestrator, FrameOutcome};
use crate::ubo::FrameUniforms;

const SHADER_ENTRY_POINT: &str = "main";

/// SPIR-V blobs for the fixed pipeline.
#[derive(Debug, Clone, Default)]
pub struct ShaderSources {
    pub vertex: Vec<u8>,
    pub fragment: Vec<u8>,
    /// Control and evaluation stages.
    pub tessellation: Option<(Vec<u8>, Vec<u8>)>,
}

impl ShaderSources {
    pub fn new(vertex: Vec<u8>, fragment: Vec<u8>) -> Self {
        Self {
            vertex,
            fragment,
            tessellation: None,
        }
    }

    pub fn with_tessellation(mut self, control: Vec<u8>, evaluation: Vec<u8>) -> Self {
        self.tessellation = Some((control, evaluation));
        self
    }

    /// Reads the shader blobs named by `config`, including the tessellation
    /// pair when one is configured.
    ///
    /// # Errors
    ///
    /// [`RhiError::ShaderError`] if any configured file cannot be read.
    pub fn load(config: &RendererConfig) -> RhiResult<Self> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|e| {
                RhiError::ShaderError(format!("Failed to read shader file {:?}: {}", path, e))
            })
        };
        let sources = Self::new(
            read(config.vertex_shader())?,
            read(config.fragment_shader())?,
        );
        Ok(match config.tessellation_shaders() {
            Some((control, evaluation)) => {
                sources.with_tessellation(read(control)?, read(evaluation)?)
            }
            None => sources,
        })
    }
}

/// Shader modules kept alive for pipeline rebuilds.
struct ShaderSet<G: Gpu> {
    vertex: Shader<G>,
    fragment: Shader<G>,
    tessellation: Option<(Shader<G>, Shader<G>)>,
}

impl<G: Gpu> ShaderSet<G> {
    fn new(gpu: &Arc<G>, sources: &ShaderSources) -> RhiResult<Self> {
        let module = |bytes: &[u8], stage| {
            Shader::from_spirv_bytes(gpu.clone(), bytes, stage, SHADER_ENTRY_POINT)
        };

        let tessellation = match &sources.tessellation {
            Some((control, evaluation)) if gpu.features().tessellation_shader == vk::TRUE => {
                Some((
                    module(control, ShaderStage::TessControl)?,
                    module(evaluation, ShaderStage::TessEvaluation)?,
                ))
            }
            Some(_) => {
                warn!("Device lacks tessellationShader; drawing without tessellation stages");
                None
            }
            None => None,
        };

        Ok(Self {
            vertex: module(&sources.vertex, ShaderStage::Vertex)?,
            fragment: module(&sources.fragment, ShaderStage::Fragment)?,
            tessellation,
        })
    }

    fn stages(&self) -> PipelineShaders<'_, G> {
        let stages = PipelineShaders::new(&self.vertex, &self.fragment);
        match &self.tessellation {
            Some((control, evaluation)) => stages.with_tessellation(control, evaluation),
            None => stages,
        }
    }
}

/// Counters reported by [`Renderer::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub frames_presented: u64,
    pub recreations: u64,
    /// Frames that could not acquire an image or had no surface area.
    pub skipped: u64,
}

/// Steady-state presentation loop over one surface.
///
/// # Resource Destruction Order
///
/// Fields drop in declaration order after [`Drop::drop`] has waited for the
/// device to go idle:
/// 1. Frame contexts (framebuffers, semaphores, fences, command pool)
/// 2. Pipeline, pipeline layout, shader modules, render pass
/// 3. Swapchain views and swapchain
/// 4. Meshes and every buffer or texture in the arena
/// 5. Transfer command pools
///
/// The device itself is shared and outlives the renderer.
pub struct Renderer<G: Gpu> {
    frames: FrameOrchestrator<G>,
    pipeline: GraphicsPipeline<G>,
    layout: PipelineLayout<G>,
    shaders: ShaderSet<G>,
    render_pass: RenderPass<G>,
    swapchain: Swapchain<G>,
    meshes: Vec<MeshDraw>,
    arena: ResourceArena<G>,
    transfer: TransferEngine<G>,
    pipeline_config: PipelineConfig,
    /// Last window size reported through [`resize`](Self::resize).
    window_extent: vk::Extent2D,
    needs_recreate: bool,
    /// Uploads submitted since the last frame.
    uploads_pending: bool,
    /// Written into each slot's uniform buffer as the slot is reused.
    uniforms: FrameUniforms,
    stats: RenderStats,
    gpu: Arc<G>,
}

impl<G: Gpu> Renderer<G> {
    /// Creates the swapchain, render pass, pipeline, transfer engine and
    /// frame contexts for `surface`.
    ///
    /// # Errors
    ///
    /// Returns an error if any of those objects cannot be created.
    pub fn new(
        gpu: Arc<G>,
        surface: vk::SurfaceKHR,
        config: &RendererConfig,
        sources: &ShaderSources,
    ) -> RhiResult<Self> {
        let window_extent = vk::Extent2D {
            width: config.window_width(),
            height: config.window_height(),
        };

        info!(
            "Initializing renderer ({}x{}, {} frames in flight)",
            window_extent.width,
            window_extent.height,
            config.frames_in_flight()
        );

        let swapchain = Swapchain::new(
            gpu.clone(),
            surface,
            config.extent_policy(),
            window_extent,
        )?;
        let render_pass = RenderPass::new(gpu.clone(), swapchain.format())?;
        let shaders = ShaderSet::new(&gpu, sources)?;
        let layout = PipelineLayout::new(gpu.clone(), &[], &[])?;
        let pipeline_config = PipelineConfig::default().with_fill_mode(config.fill_mode());
        let pipeline = GraphicsPipeline::new(
            gpu.clone(),
            &render_pass,
            &layout,
            &shaders.stages(),
            &pipeline_config,
            swapchain.extent(),
        )?;
        let transfer = TransferEngine::new(gpu.clone())?;
        let arena = ResourceArena::new(gpu.clone());
        let frames = FrameOrchestrator::new(gpu.clone(), config.frames_in_flight())?;

        info!(
            "Renderer initialized: {} swapchain images, {} frames in flight",
            swapchain.image_count(),
            frames.frames_in_flight()
        );

        Ok(Self {
            frames,
            pipeline,
            layout,
            shaders,
            render_pass,
            swapchain,
            meshes: Vec::new(),
            arena,
            transfer,
            pipeline_config,
            window_extent,
            needs_recreate: false,
            uploads_pending: false,
            uniforms: FrameUniforms::default(),
            stats: RenderStats::default(),
            gpu,
        })
    }

    /// Uploads a mesh into device-local vertex and index buffers.
    ///
    /// The mesh is not drawn until passed to [`add_draw`](Self::add_draw).
    ///
    /// # Errors
    ///
    /// [`RhiError::TransferFailed`] for an empty mesh, or any allocation or
    /// transfer error.
    pub fn upload_mesh(&mut self, vertices: &[Vertex], indices: &[u32]) -> RhiResult<MeshDraw> {
        if vertices.is_empty() || indices.is_empty() {
            return Err(RhiError::TransferFailed(format!(
                "mesh needs vertices and indices, got {} and {}",
                vertices.len(),
                indices.len()
            )));
        }

        let vertex_buffer = self.transfer.upload_buffer(
            &mut self.arena,
            BufferUsage::Vertex,
            bytemuck::cast_slice(vertices),
        )?;
        let index_buffer = match self.transfer.upload_buffer(
            &mut self.arena,
            BufferUsage::Index,
            bytemuck::cast_slice(indices),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.arena.retire(vertex_buffer);
                return Err(e);
            }
        };
        self.uploads_pending = true;

        debug!(
            "Uploaded mesh: {} vertices, {} indices",
            vertices.len(),
            indices.len()
        );

        Ok(MeshDraw {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
            descriptor_sets: Vec::new(),
        })
    }

    /// Uploads tightly packed RGBA8 pixels into a sampled texture.
    pub fn upload_texture(&mut self, extent: vk::Extent2D, pixels: &[u8]) -> RhiResult<ResourceHandle> {
        let handle = self
            .transfer
            .upload_texture(&mut self.arena, extent, pixels)?;
        self.uploads_pending = true;
        Ok(handle)
    }

    /// Adds a mesh to the draw list of every following frame.
    pub fn add_draw(&mut self, mesh: MeshDraw) {
        self.meshes.push(mesh);
    }

    /// Removes every draw and retires its buffers.
    ///
    /// Buffers still referenced by a frame in flight are freed by a later
    /// reclaim pass.
    pub fn clear_draws(&mut self) {
        for mesh in self.meshes.drain(..) {
            self.arena.retire(mesh.vertex_buffer);
            self.arena.retire(mesh.index_buffer);
        }
    }

    /// Notifies the renderer that the window has been resized.
    ///
    /// The swapchain is rebuilt at the start of the next frame. Zero sizes
    /// (minimized windows) are ignored.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            debug!("Ignoring resize to zero dimensions");
            return;
        }

        if width != self.window_extent.width || height != self.window_extent.height {
            debug!(
                "Resize triggered: {}x{} -> {}x{}",
                self.window_extent.width, self.window_extent.height, width, height
            );
            self.window_extent = vk::Extent2D { width, height };
            self.needs_recreate = true;
        }
    }

    /// Sets the uniforms every following frame writes into its slot.
    pub fn set_uniforms(&mut self, uniforms: FrameUniforms) {
        self.uniforms = uniforms;
    }

    #[inline]
    pub fn uniforms(&self) -> &FrameUniforms {
        &self.uniforms
    }

    /// Renders and presents one frame.
    ///
    /// Returns the presentation status of the frame. Stale swapchains are
    /// rebuilt before returning; a lost device or surface gets exactly one
    /// rebuild attempt.
    ///
    /// # Errors
    ///
    /// [`RhiError::DeviceLost`] if recovery from a lost status fails, or any
    /// other fatal error.
    pub fn render_frame(&mut self) -> RhiResult<PresentResult> {
        if self.needs_recreate && !self.recreate_swapchain()? {
            self.stats.skipped += 1;
            return Ok(PresentResult::OutOfDate);
        }

        if self.uploads_pending {
            self.transfer.wait_idle()?;
            self.uploads_pending = false;
        }
        self.arena.reclaim()?;

        let outcome = {
            let draws = self
                .meshes
                .iter()
                .map(|mesh| mesh.resolve(&self.arena))
                .collect::<RhiResult<Vec<_>>>()?;
            self.frames.render(
                &self.swapchain,
                &self.render_pass,
                &self.pipeline,
                &self.uniforms,
                &draws,
            )?
        };

        match outcome {
            FrameOutcome::Presented { fence, status, .. } => {
                for mesh in &self.meshes {
                    self.arena.mark_used(mesh.vertex_buffer, fence);
                    self.arena.mark_used(mesh.index_buffer, fence);
                }
                self.stats.frames_presented += 1;
                self.handle_status(status)
            }
            FrameOutcome::Skipped(status) => {
                self.stats.skipped += 1;
                self.handle_status(status)
            }
        }
    }

    fn handle_status(&mut self, status: PresentResult) -> RhiResult<PresentResult> {
        match status {
            PresentResult::Ok => {}
            PresentResult::OutOfDate => {
                warn!("Swapchain out of date, recreating");
                self.needs_recreate = true;
                self.recreate_swapchain()?;
            }
            PresentResult::Lost => {
                warn!("Device or surface lost, attempting one swapchain rebuild");
                self.needs_recreate = true;
                match self.recreate_swapchain() {
                    Ok(true) => info!("Recovered from lost presentation"),
                    Ok(false) => {
                        return Err(RhiError::DeviceLost(
                            "surface has no area after loss".to_string(),
                        ));
                    }
                    Err(e) => {
                        error!("Recovery failed: {}", e);
                        return Err(RhiError::DeviceLost(e.to_string()));
                    }
                }
            }
        }
        Ok(status)
    }

    /// Rebuilds everything that depends on the swapchain images or extent.
    ///
    /// Returns `Ok(false)` when the surface has no area; the rebuild stays
    /// pending.
    fn recreate_swapchain(&mut self) -> RhiResult<bool> {
        self.gpu.wait_idle()?;
        self.frames.release_framebuffers();

        if !self.swapchain.recreate(self.window_extent)? {
            debug!("Swapchain rebuild deferred until the surface has an area");
            return Ok(false);
        }

        if self.swapchain.format() != self.render_pass.format() {
            info!(
                "Surface format changed {:?} -> {:?}, rebuilding render pass",
                self.render_pass.format(),
                self.swapchain.format()
            );
            self.render_pass = RenderPass::new(self.gpu.clone(), self.swapchain.format())?;
        }

        self.pipeline = GraphicsPipeline::new(
            self.gpu.clone(),
            &self.render_pass,
            &self.layout,
            &self.shaders.stages(),
            &self.pipeline_config,
            self.swapchain.extent(),
        )?;

        self.needs_recreate = false;
        self.stats.recreations += 1;

        let extent = self.swapchain.extent();
        info!(
            "Swapchain rebuilt at {}x{} (generation {})",
            extent.width,
            extent.height,
            self.swapchain.generation()
        );
        Ok(true)
    }

    #[inline]
    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    #[inline]
    pub fn format(&self) -> vk::Format {
        self.swapchain.format()
    }

    #[inline]
    pub fn swapchain(&self) -> &Swapchain<G> {
        &self.swapchain
    }

    #[inline]
    pub fn pipeline(&self) -> &GraphicsPipeline<G> {
        &self.pipeline
    }

    #[inline]
    pub fn frames(&self) -> &FrameOrchestrator<G> {
        &self.frames
    }

    #[inline]
    pub fn arena(&self) -> &ResourceArena<G> {
        &self.arena
    }

    #[inline]
    pub fn draws(&self) -> &[MeshDraw] {
        &self.meshes
    }

    /// Returns true while a resize or stale swapchain awaits a rebuild.
    #[inline]
    pub fn needs_recreate(&self) -> bool {
        self.needs_recreate
    }
}

impl<G: Gpu> Drop for Renderer<G> {
    fn drop(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            error!(
                "Failed to wait for device idle during renderer drop: {:?}",
                e
            );
        }
        info!(
            "Renderer destroyed after {} frames ({} swapchain rebuilds)",
            self.stats.frames_presented, self.stats.recreations
        );
    }
}
