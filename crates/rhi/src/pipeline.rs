//! Render pass and graphics pipeline creation.
//!
//! # Overview
//!
//! - [`RenderPass`] has one color attachment that is cleared, stored and
//!   left in `PRESENT_SRC_KHR`.
//! - [`PipelineLayout`] wraps `VkPipelineLayout`.
//! - [`PipelineConfig`] is the fixed-function state supplied by the caller.
//! - [`GraphicsPipeline`] combines shaders, configuration and a baked
//!   viewport. The viewport is part of the pipeline, so a new extent means a
//!   new pipeline.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::path::Path;
//! use presenter_rhi::device::Device;
//! use presenter_rhi::pipeline::{
//!     GraphicsPipeline, PipelineConfig, PipelineLayout, PipelineShaders, RenderPass,
//! };
//! use presenter_rhi::shader::{Shader, ShaderStage};
//! use presenter_rhi::vk;
//!
//! # fn example(device: Arc<Device>) -> Result<(), presenter_rhi::RhiError> {
//! let vertex = Shader::from_spirv_file(device.clone(), Path::new("a.spv"), ShaderStage::Vertex, "main")?;
//! let fragment = Shader::from_spirv_file(device.clone(), Path::new("b.spv"), ShaderStage::Fragment, "main")?;
//! let render_pass = RenderPass::new(device.clone(), vk::Format::B8G8R8A8_SRGB)?;
//! let layout = PipelineLayout::new(device.clone(), &[], &[])?;
//!
//! let pipeline = GraphicsPipeline::new(
//!     device,
//!     &render_pass,
//!     &layout,
//!     &PipelineShaders::new(&vertex, &fragment),
//!     &PipelineConfig::default(),
//!     vk::Extent2D { width: 800, height: 600 },
//! )?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ash::vk;
use presenter_core::FillMode;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};
use crate::gpu::Gpu;
use crate::shader::{Shader, ShaderStage};
use crate::vertex::Vertex;

/// Render pass with a single color attachment.
pub struct RenderPass<G: Gpu> {
    gpu: Arc<G>,
    render_pass: vk::RenderPass,
    format: vk::Format,
}

impl<G: Gpu> RenderPass<G> {
    /// Creates a render pass for swapchain images of `format`.
    ///
    /// The attachment is cleared on load, stored, and transitions
    /// `UNDEFINED → PRESENT_SRC_KHR`. One external dependency orders the
    /// attachment write after the image is acquired.
    pub fn new(gpu: Arc<G>, format: vk::Format) -> RhiResult<Self> {
        let attachments = [vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];

        let color_refs = [vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }];

        let subpasses = [vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)];

        let dependencies = [vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        }];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let render_pass = gpu.create_render_pass(&create_info)?;
        debug!("Created render pass for {:?}", format);

        Ok(Self {
            gpu,
            render_pass,
            format,
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Color attachment format this render pass was created for.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl<G: Gpu> Drop for RenderPass<G> {
    fn drop(&mut self) {
        self.gpu.destroy_render_pass(self.render_pass);
        debug!("Render pass destroyed");
    }
}

/// Vulkan pipeline layout wrapper.
pub struct PipelineLayout<G: Gpu> {
    gpu: Arc<G>,
    layout: vk::PipelineLayout,
}

impl<G: Gpu> PipelineLayout<G> {
    /// Creates a new pipeline layout.
    ///
    /// # Errors
    ///
    /// Returns an error if pipeline layout creation fails.
    pub fn new(
        gpu: Arc<G>,
        descriptor_set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> RhiResult<Self> {
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(descriptor_set_layouts)
            .push_constant_ranges(push_constant_ranges);

        let layout = gpu.create_pipeline_layout(&create_info)?;

        debug!(
            "Created pipeline layout with {} descriptor set layout(s) and {} push constant range(s)",
            descriptor_set_layouts.len(),
            push_constant_ranges.len()
        );

        Ok(Self { gpu, layout })
    }

    #[inline]
    pub fn handle(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl<G: Gpu> Drop for PipelineLayout<G> {
    fn drop(&mut self) {
        self.gpu.destroy_pipeline_layout(self.layout);
        debug!("Pipeline layout destroyed");
    }
}

/// Polygon rasterization mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolygonMode {
    /// Fill the polygon interior.
    #[default]
    Fill,
    /// Draw polygon edges as lines.
    Line,
}

impl PolygonMode {
    /// Converts to Vulkan polygon mode.
    pub fn to_vk(self) -> vk::PolygonMode {
        match self {
            PolygonMode::Fill => vk::PolygonMode::FILL,
            PolygonMode::Line => vk::PolygonMode::LINE,
        }
    }
}

impl From<FillMode> for PolygonMode {
    fn from(mode: FillMode) -> Self {
        match mode {
            FillMode::Fill => PolygonMode::Fill,
            FillMode::Wireframe => PolygonMode::Line,
        }
    }
}

/// Face culling mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CullMode {
    /// Do not cull any faces.
    #[default]
    None,
    /// Cull front-facing triangles.
    Front,
    /// Cull back-facing triangles.
    Back,
}

impl CullMode {
    /// Converts to Vulkan cull mode flags.
    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
        }
    }
}

/// Front face winding order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrontFace {
    /// Counter-clockwise winding is front-facing.
    #[default]
    CounterClockwise,
    /// Clockwise winding is front-facing.
    Clockwise,
}

impl FrontFace {
    /// Converts to Vulkan front face.
    pub fn to_vk(self) -> vk::FrontFace {
        match self {
            FrontFace::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
            FrontFace::Clockwise => vk::FrontFace::CLOCKWISE,
        }
    }
}

/// Fixed-function pipeline state.
///
/// The default is a filled triangle list with no culling and
/// counter-clockwise front faces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    /// Control points per patch when tessellation is active.
    pub patch_control_points: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::None,
            front_face: FrontFace::CounterClockwise,
            patch_control_points: 3,
        }
    }
}

impl PipelineConfig {
    pub fn with_fill_mode(mut self, mode: FillMode) -> Self {
        self.polygon_mode = mode.into();
        self
    }
}

/// Shader stages of a graphics pipeline.
pub struct PipelineShaders<'a, G: Gpu> {
    pub vertex: &'a Shader<G>,
    pub fragment: &'a Shader<G>,
    /// Control and evaluation stages.
    pub tessellation: Option<(&'a Shader<G>, &'a Shader<G>)>,
}

impl<'a, G: Gpu> PipelineShaders<'a, G> {
    pub fn new(vertex: &'a Shader<G>, fragment: &'a Shader<G>) -> Self {
        Self {
            vertex,
            fragment,
            tessellation: None,
        }
    }

    pub fn with_tessellation(mut self, control: &'a Shader<G>, evaluation: &'a Shader<G>) -> Self {
        self.tessellation = Some((control, evaluation));
        self
    }

    fn validate(&self) -> RhiResult<()> {
        let expect = |shader: &Shader<G>, stage: ShaderStage| {
            if shader.stage() == stage {
                Ok(())
            } else {
                Err(RhiError::PipelineError(format!(
                    "Expected a {} shader, got a {} shader",
                    stage,
                    shader.stage()
                )))
            }
        };
        expect(self.vertex, ShaderStage::Vertex)?;
        expect(self.fragment, ShaderStage::Fragment)?;
        if let Some((control, evaluation)) = self.tessellation {
            expect(control, ShaderStage::TessControl)?;
            expect(evaluation, ShaderStage::TessEvaluation)?;
        }
        Ok(())
    }
}

/// Graphics pipeline with its viewport and scissor baked in.
pub struct GraphicsPipeline<G: Gpu> {
    gpu: Arc<G>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
    extent: vk::Extent2D,
    tessellation: bool,
}

impl<G: Gpu> GraphicsPipeline<G> {
    /// Creates a pipeline drawing [`Vertex`] triangles into `render_pass`
    /// over the full `extent`.
    ///
    /// Tessellation shaders are only used when the device reports
    /// `tessellationShader`; otherwise they are ignored with a warning.
    ///
    /// # Errors
    ///
    /// [`RhiError::PipelineError`] if a shader has the wrong stage, or any
    /// error from pipeline creation.
    pub fn new(
        gpu: Arc<G>,
        render_pass: &RenderPass<G>,
        layout: &PipelineLayout<G>,
        shaders: &PipelineShaders<'_, G>,
        config: &PipelineConfig,
        extent: vk::Extent2D,
    ) -> RhiResult<Self> {
        shaders.validate()?;

        let tessellation = match shaders.tessellation {
            Some(pair) if gpu.features().tessellation_shader == vk::TRUE => Some(pair),
            Some(_) => {
                warn!("Tessellation shaders supplied but not supported by the device");
                None
            }
            None => None,
        };

        let mut stages = vec![shaders.vertex.stage_create_info()];
        if let Some((control, evaluation)) = tessellation {
            stages.push(control.stage_create_info());
            stages.push(evaluation.stage_create_info());
        }
        stages.push(shaders.fragment.stage_create_info());

        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let topology = if tessellation.is_some() {
            vk::PrimitiveTopology::PATCH_LIST
        } else {
            vk::PrimitiveTopology::TRIANGLE_LIST
        };
        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(topology)
            .primitive_restart_enable(false);

        let tessellation_state = vk::PipelineTessellationStateCreateInfo::default()
            .patch_control_points(config.patch_control_points);

        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(config.polygon_mode.to_vk())
            .line_width(1.0)
            .cull_mode(config.cull_mode.to_vk())
            .front_face(config.front_face.to_vk())
            .depth_bias_enable(false);

        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::FALSE,
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        }];
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .layout(layout.handle())
            .render_pass(render_pass.handle())
            .subpass(0);
        if tessellation.is_some() {
            pipeline_info = pipeline_info.tessellation_state(&tessellation_state);
        }

        let pipeline = gpu.create_graphics_pipeline(&pipeline_info)?;

        info!(
            "Graphics pipeline created for {}x{} ({:?}{})",
            extent.width,
            extent.height,
            config.polygon_mode,
            if tessellation.is_some() {
                ", tessellated"
            } else {
                ""
            }
        );

        Ok(Self {
            gpu,
            pipeline,
            layout: layout.handle(),
            extent,
            tessellation: tessellation.is_some(),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    #[inline]
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    #[inline]
    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::GRAPHICS
    }

    /// Extent the viewport and scissor were baked for.
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    #[inline]
    pub fn has_tessellation(&self) -> bool {
        self.tessellation
    }
}

impl<G: Gpu> Drop for GraphicsPipeline<G> {
    fn drop(&mut self) {
        self.gpu.destroy_pipeline(self.pipeline);
        info!("Graphics pipeline destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGpu;
    use crate::physical_device::QueueRoles;
    use crate::shader::SPIRV_MAGIC;

    fn shader(gpu: &Arc<MockGpu>, stage: ShaderStage) -> Shader<MockGpu> {
        let code: Vec<u8> = [SPIRV_MAGIC, 0x0001_0000, 0, 0]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        Shader::from_spirv_bytes(gpu.clone(), &code, stage, "main").unwrap()
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_fill_mode_maps_to_polygon_mode() {
        assert_eq!(PolygonMode::from(FillMode::Fill).to_vk(), vk::PolygonMode::FILL);
        assert_eq!(
            PolygonMode::from(FillMode::Wireframe).to_vk(),
            vk::PolygonMode::LINE
        );
        assert_eq!(
            PipelineConfig::default()
                .with_fill_mode(FillMode::Wireframe)
                .polygon_mode,
            PolygonMode::Line
        );
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.cull_mode.to_vk(), vk::CullModeFlags::NONE);
        assert_eq!(config.front_face.to_vk(), vk::FrontFace::COUNTER_CLOCKWISE);
        assert_eq!(config.patch_control_points, 3);
    }

    #[test]
    fn test_pipeline_bakes_viewport_from_extent() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let vertex = shader(&gpu, ShaderStage::Vertex);
        let fragment = shader(&gpu, ShaderStage::Fragment);
        let render_pass = RenderPass::new(gpu.clone(), vk::Format::B8G8R8A8_SRGB).unwrap();
        let layout = PipelineLayout::new(gpu.clone(), &[], &[]).unwrap();

        let pipeline = GraphicsPipeline::new(
            gpu.clone(),
            &render_pass,
            &layout,
            &PipelineShaders::new(&vertex, &fragment),
            &PipelineConfig::default(),
            extent(640, 480),
        )
        .unwrap();

        let records = gpu.pipelines_created();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].viewport, (640, 480));
        assert_eq!(records[0].stage_count, 2);
        assert_eq!(records[0].topology, vk::PrimitiveTopology::TRIANGLE_LIST);
        assert_eq!(records[0].cull_mode, vk::CullModeFlags::NONE);
        assert_eq!(records[0].patch_control_points, None);
        assert!(!pipeline.has_tessellation());
        assert_eq!(pipeline.layout(), layout.handle());
    }

    #[test]
    fn test_tessellation_requires_device_support() {
        let features = vk::PhysicalDeviceFeatures {
            tessellation_shader: vk::TRUE,
            ..Default::default()
        };
        let supported = Arc::new(MockGpu::new(QueueRoles::single(0)).with_features(features));
        let unsupported = Arc::new(MockGpu::new(QueueRoles::single(0)));

        for (gpu, expect_tessellation) in [(supported, true), (unsupported, false)] {
            let vertex = shader(&gpu, ShaderStage::Vertex);
            let fragment = shader(&gpu, ShaderStage::Fragment);
            let control = shader(&gpu, ShaderStage::TessControl);
            let evaluation = shader(&gpu, ShaderStage::TessEvaluation);
            let render_pass = RenderPass::new(gpu.clone(), vk::Format::B8G8R8A8_SRGB).unwrap();
            let layout = PipelineLayout::new(gpu.clone(), &[], &[]).unwrap();

            let pipeline = GraphicsPipeline::new(
                gpu.clone(),
                &render_pass,
                &layout,
                &PipelineShaders::new(&vertex, &fragment).with_tessellation(&control, &evaluation),
                &PipelineConfig::default(),
                extent(100, 100),
            )
            .unwrap();

            let record = gpu.pipelines_created()[0];
            assert_eq!(pipeline.has_tessellation(), expect_tessellation);
            if expect_tessellation {
                assert_eq!(record.stage_count, 4);
                assert_eq!(record.patch_control_points, Some(3));
                assert_eq!(record.topology, vk::PrimitiveTopology::PATCH_LIST);
            } else {
                assert_eq!(record.stage_count, 2);
                assert_eq!(record.patch_control_points, None);
            }
        }
    }

    #[test]
    fn test_wrong_shader_stage_rejected() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let vertex = shader(&gpu, ShaderStage::Vertex);
        let render_pass = RenderPass::new(gpu.clone(), vk::Format::B8G8R8A8_SRGB).unwrap();
        let layout = PipelineLayout::new(gpu.clone(), &[], &[]).unwrap();

        let result = GraphicsPipeline::new(
            gpu.clone(),
            &render_pass,
            &layout,
            &PipelineShaders::new(&vertex, &vertex),
            &PipelineConfig::default(),
            extent(100, 100),
        );
        assert!(matches!(result, Err(RhiError::PipelineError(_))));
        assert!(gpu.pipelines_created().is_empty());
    }

    #[test]
    fn test_everything_is_destroyed() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        {
            let vertex = shader(&gpu, ShaderStage::Vertex);
            let fragment = shader(&gpu, ShaderStage::Fragment);
            let render_pass = RenderPass::new(gpu.clone(), vk::Format::B8G8R8A8_SRGB).unwrap();
            let layout = PipelineLayout::new(gpu.clone(), &[], &[]).unwrap();
            let _pipeline = GraphicsPipeline::new(
                gpu.clone(),
                &render_pass,
                &layout,
                &PipelineShaders::new(&vertex, &fragment),
                &PipelineConfig::default(),
                extent(8, 8),
            )
            .unwrap();
            assert_eq!(render_pass.format(), vk::Format::B8G8R8A8_SRGB);
        }
        assert_eq!(gpu.live_objects(), 0);
        assert!(gpu.violations().is_empty());
    }
}
