//! Presentation loop behavior against the recording mock device.

use std::path::PathBuf;
use std::sync::Arc;

use ash::vk;
use glam::Vec3;

use presenter_core::{FillMode, RendererConfig};
use presenter_renderer::{FrameUniforms, QUAD_INDICES, Renderer, ShaderSources, quad_vertices};
use presenter_rhi::gpu::Command;
use presenter_rhi::mock::{MockAcquire, MockGpu, MockPresent};
use presenter_rhi::physical_device::QueueRoles;
use presenter_rhi::shader::SPIRV_MAGIC;
use presenter_rhi::swapchain::PresentResult;
use presenter_rhi::vertex::Vertex;
use presenter_rhi::{Gpu, RhiError};

fn spirv(bound: u32) -> Vec<u8> {
    [SPIRV_MAGIC, 0x0001_0000, 0, bound, 0]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect()
}

fn sources() -> ShaderSources {
    ShaderSources::new(spirv(1), spirv(1))
}

/// Writes `blobs` under a fresh temporary directory and returns their paths.
fn write_shader_files(tag: &str, blobs: &[(&str, Vec<u8>)]) -> Vec<PathBuf> {
    let dir = std::env::temp_dir().join(format!("presenter-{}-{}", tag, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    blobs
        .iter()
        .map(|(name, bytes)| {
            let path = dir.join(name);
            std::fs::write(&path, bytes).unwrap();
            path
        })
        .collect()
}

fn renderer_with(gpu: &Arc<MockGpu>, config: RendererConfig) -> Renderer<MockGpu> {
    Renderer::new(gpu.clone(), vk::SurfaceKHR::null(), &config, &sources()).unwrap()
}

fn renderer(gpu: &Arc<MockGpu>, frames_in_flight: usize) -> Renderer<MockGpu> {
    renderer_with(
        gpu,
        RendererConfig::default().with_frames_in_flight(frames_in_flight),
    )
}

fn frame_commands(gpu: &MockGpu) -> Vec<Command> {
    let submission = gpu
        .submissions()
        .into_iter()
        .rev()
        .find(|s| s.queue == gpu.graphics_queue() && !s.signal_semaphores.is_empty())
        .expect("a frame submission");
    submission.commands.into_iter().flatten().collect()
}

#[test]
fn test_shared_family_uses_exclusive_sharing() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let _renderer = renderer(&gpu, 2);

    let history = gpu.swapchain_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sharing_mode, vk::SharingMode::EXCLUSIVE);
    assert_eq!(history[0].queue_family_indices, vec![0]);
}

#[test]
fn test_split_families_use_concurrent_sharing() {
    let gpu = Arc::new(MockGpu::new(QueueRoles {
        graphics: 1,
        presentation: 0,
        transfer: 1,
    }));
    let mut renderer = renderer(&gpu, 2);

    let history = gpu.swapchain_history();
    assert_eq!(history[0].sharing_mode, vk::SharingMode::CONCURRENT);
    let mut families = history[0].queue_family_indices.clone();
    families.sort_unstable();
    assert_eq!(families, vec![0, 1]);

    assert_eq!(renderer.render_frame().unwrap(), PresentResult::Ok);
    let presentations = gpu.presentations();
    assert_eq!(presentations.len(), 1);
    assert_eq!(presentations[0].queue, gpu.present_queue());
    assert_ne!(gpu.present_queue(), gpu.graphics_queue());
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn test_quad_frame_binds_uploaded_buffers() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);

    let vertices = quad_vertices();
    let mesh = renderer.upload_mesh(&vertices, &QUAD_INDICES).unwrap();
    assert_eq!(mesh.index_count, 6);
    renderer.add_draw(mesh.clone());

    assert_eq!(renderer.render_frame().unwrap(), PresentResult::Ok);

    let vertex_buffer = renderer.arena().buffer(mesh.vertex_buffer).unwrap().handle();
    let index_buffer = renderer.arena().buffer(mesh.index_buffer).unwrap().handle();
    assert_eq!(
        gpu.buffer_contents(vertex_buffer).unwrap(),
        bytemuck::cast_slice::<Vertex, u8>(&vertices)
    );
    assert_eq!(
        gpu.buffer_contents(index_buffer).unwrap(),
        bytemuck::cast_slice::<u32, u8>(&QUAD_INDICES)
    );

    let commands = frame_commands(&gpu);
    assert!(matches!(
        commands.first(),
        Some(Command::BeginRenderPass { .. })
    ));
    assert!(matches!(commands.last(), Some(Command::EndRenderPass)));
    assert!(commands.iter().any(|c| matches!(
        c,
        Command::BindVertexBuffers { first_binding: 0, buffers, offsets }
            if buffers == &[vertex_buffer] && offsets == &[0]
    )));
    assert!(commands.iter().any(|c| matches!(
        c,
        Command::BindIndexBuffer { buffer, offset: 0, index_type }
            if *buffer == index_buffer && *index_type == vk::IndexType::UINT32
    )));

    let draws: Vec<(u32, u32, u32, i32, u32)> = commands
        .iter()
        .filter_map(|c| match *c {
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            } => Some((
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )),
            _ => None,
        })
        .collect();
    assert_eq!(draws, vec![(6, 1, 0, 0, 0)]);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn test_each_fence_waited_once_per_rotation() {
    for frames_in_flight in 1..=3 {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let mut renderer = renderer(&gpu, frames_in_flight);
        let mesh = renderer
            .upload_mesh(&quad_vertices(), &QUAD_INDICES)
            .unwrap();
        renderer.add_draw(mesh);

        for _ in 0..3 * frames_in_flight {
            assert_eq!(renderer.render_frame().unwrap(), PresentResult::Ok);
        }

        for frame in renderer.frames().frames() {
            assert_eq!(gpu.fence_waits(frame.in_flight().handle()), 3);
            assert_eq!(gpu.begin_count(frame.command_buffer().handle()), 3);
        }
        assert_eq!(gpu.presentations().len(), 3 * frames_in_flight);
        assert_eq!(
            renderer.stats().frames_presented,
            3 * frames_in_flight as u64
        );
        assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
    }
}

#[test]
fn test_resize_rebuilds_swapchain_and_pipeline() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);
    renderer.render_frame().unwrap();

    let idle_before = gpu.wait_idle_calls();
    renderer.resize(1024, 768);
    gpu.set_surface_extent(1024, 768);
    assert!(renderer.needs_recreate());

    assert_eq!(renderer.render_frame().unwrap(), PresentResult::Ok);
    assert!(!renderer.needs_recreate());
    assert!(gpu.wait_idle_calls() > idle_before);
    assert_eq!(
        (renderer.extent().width, renderer.extent().height),
        (1024, 768)
    );
    assert_eq!(renderer.stats().recreations, 1);
    assert_eq!(gpu.swapchain_history().len(), 2);
    assert_eq!(gpu.pipelines_created().last().unwrap().viewport, (1024, 768));
    assert_eq!(
        (renderer.pipeline().extent().width, renderer.pipeline().extent().height),
        (1024, 768)
    );
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn test_zero_area_defers_rebuild() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);

    renderer.resize(640, 480);
    gpu.set_surface_extent(0, 0);
    assert_eq!(renderer.render_frame().unwrap(), PresentResult::OutOfDate);
    assert!(renderer.needs_recreate());
    assert_eq!(renderer.stats().skipped, 1);
    assert_eq!(renderer.stats().recreations, 0);
    assert!(gpu.presentations().is_empty());

    gpu.set_surface_extent(640, 480);
    assert_eq!(renderer.render_frame().unwrap(), PresentResult::Ok);
    assert_eq!(renderer.stats().recreations, 1);
    assert_eq!(gpu.presentations().len(), 1);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn test_zero_resize_is_ignored() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);

    renderer.resize(0, 600);
    renderer.resize(800, 600);
    assert!(!renderer.needs_recreate());
}

#[test]
fn test_out_of_date_acquire_rebuilds() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);

    gpu.script_acquire([MockAcquire::Error(vk::Result::ERROR_OUT_OF_DATE_KHR)]);
    assert_eq!(renderer.render_frame().unwrap(), PresentResult::OutOfDate);
    assert!(gpu.presentations().is_empty());
    assert_eq!(renderer.stats().skipped, 1);
    assert_eq!(renderer.stats().recreations, 1);

    assert_eq!(renderer.render_frame().unwrap(), PresentResult::Ok);
    assert_eq!(renderer.stats().frames_presented, 1);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn test_suboptimal_present_rebuilds_after_presenting() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);

    gpu.script_present([MockPresent::Suboptimal]);
    assert_eq!(renderer.render_frame().unwrap(), PresentResult::OutOfDate);
    assert_eq!(gpu.presentations().len(), 1);
    assert_eq!(renderer.stats().frames_presented, 1);
    assert_eq!(renderer.stats().recreations, 1);

    assert_eq!(renderer.render_frame().unwrap(), PresentResult::Ok);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn test_lost_surface_recovers_once() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);

    gpu.script_acquire([MockAcquire::Error(vk::Result::ERROR_SURFACE_LOST_KHR)]);
    assert_eq!(renderer.render_frame().unwrap(), PresentResult::Lost);
    assert_eq!(renderer.stats().recreations, 1);

    assert_eq!(renderer.render_frame().unwrap(), PresentResult::Ok);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn test_lost_surface_without_area_is_fatal() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);

    gpu.set_surface_extent(0, 0);
    gpu.script_present([MockPresent::Error(vk::Result::ERROR_SURFACE_LOST_KHR)]);
    assert!(matches!(
        renderer.render_frame(),
        Err(RhiError::DeviceLost(_))
    ));
}

#[test]
fn test_fatal_present_error_propagates() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);

    gpu.script_present([MockPresent::Error(vk::Result::ERROR_OUT_OF_HOST_MEMORY)]);
    assert!(matches!(
        renderer.render_frame(),
        Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
    ));
}

#[test]
fn test_cleared_draws_are_reclaimed() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);
    let mesh = renderer
        .upload_mesh(&quad_vertices(), &QUAD_INDICES)
        .unwrap();
    renderer.add_draw(mesh.clone());
    renderer.render_frame().unwrap();

    let vertex_buffer = renderer.arena().buffer(mesh.vertex_buffer).unwrap().handle();
    renderer.clear_draws();
    assert!(renderer.draws().is_empty());
    assert!(!renderer.arena().contains(mesh.vertex_buffer));
    assert!(gpu.is_live_buffer(vertex_buffer));

    gpu.complete_all();
    renderer.render_frame().unwrap();
    assert_eq!(renderer.arena().pending(), 0);
    assert!(!gpu.is_live_buffer(vertex_buffer));

    let commands = frame_commands(&gpu);
    assert!(!commands.iter().any(|c| matches!(c, Command::DrawIndexed { .. })));
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn test_empty_mesh_is_rejected() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);
    assert!(matches!(
        renderer.upload_mesh(&[], &QUAD_INDICES),
        Err(RhiError::TransferFailed(_))
    ));
    assert!(renderer.arena().is_empty());
}

#[test]
fn test_dedicated_transfer_family_upload() {
    let gpu = Arc::new(MockGpu::new(QueueRoles {
        graphics: 0,
        presentation: 0,
        transfer: 1,
    }));
    let mut renderer = renderer(&gpu, 2);
    let mesh = renderer
        .upload_mesh(&quad_vertices(), &QUAD_INDICES)
        .unwrap();
    renderer.add_draw(mesh);

    assert_eq!(renderer.render_frame().unwrap(), PresentResult::Ok);
    assert!(
        gpu.submissions()
            .iter()
            .any(|s| s.queue == gpu.transfer_queue())
    );
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn test_wireframe_and_tessellation_survive_rebuild() {
    let gpu = Arc::new(
        MockGpu::new(QueueRoles::single(0)).with_features(vk::PhysicalDeviceFeatures {
            tessellation_shader: vk::TRUE,
            fill_mode_non_solid: vk::TRUE,
            ..Default::default()
        }),
    );
    let stages = sources();
    let tessellated = stages
        .clone()
        .with_tessellation(stages.vertex.clone(), stages.vertex.clone());
    let config = RendererConfig::default().with_fill_mode(FillMode::Wireframe);
    let mut renderer =
        Renderer::new(gpu.clone(), vk::SurfaceKHR::null(), &config, &tessellated).unwrap();
    assert!(renderer.pipeline().has_tessellation());

    renderer.resize(1024, 768);
    gpu.set_surface_extent(1024, 768);
    renderer.render_frame().unwrap();

    let pipelines = gpu.pipelines_created();
    assert_eq!(pipelines.len(), 2);
    for record in pipelines {
        assert_eq!(record.stage_count, 4);
        assert_eq!(record.polygon_mode, vk::PolygonMode::LINE);
        assert_eq!(record.topology, vk::PrimitiveTopology::PATCH_LIST);
    }
}

#[test]
fn test_teardown_releases_every_object() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    {
        let mut renderer = renderer(&gpu, 3);
        let mesh = renderer
            .upload_mesh(&quad_vertices(), &QUAD_INDICES)
            .unwrap();
        renderer.add_draw(mesh);
        renderer.upload_texture(vk::Extent2D { width: 2, height: 2 }, &[255; 16]).unwrap();
        for _ in 0..4 {
            renderer.render_frame().unwrap();
        }
        renderer.resize(1024, 768);
        renderer.render_frame().unwrap();
    }
    assert_eq!(gpu.live_objects(), 0);
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn test_uniform_writes_wait_for_their_slot() {
    let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let mut renderer = renderer(&gpu, 2);
    let mesh = renderer
        .upload_mesh(&quad_vertices(), &QUAD_INDICES)
        .unwrap();
    renderer.add_draw(mesh);

    let slots: Vec<(vk::DeviceMemory, vk::Fence)> = renderer
        .frames()
        .frames()
        .iter()
        .map(|frame| (frame.uniform_buffer().memory(), frame.in_flight().handle()))
        .collect();

    // Fences only signal when waited on, so the other slot is always still
    // in flight while this one is written.
    for frame in 0..6 {
        renderer.set_uniforms(
            FrameUniforms::default().with_tess_levels(Vec3::splat(frame as f32 + 1.0), 1.0),
        );
        assert_eq!(renderer.render_frame().unwrap(), PresentResult::Ok);
    }

    for (memory, fence) in &slots {
        let writes = gpu.flushes_of(*memory);
        assert_eq!(writes.len(), 3);
        for write in &writes {
            assert!(
                !write.pending_fences.contains(fence),
                "uniforms overwritten while their submission was pending"
            );
        }
    }
    assert!(
        gpu.flushes_of(slots[1].0)
            .iter()
            .all(|write| write.pending_fences.contains(&slots[0].1))
    );

    let last_slot = renderer.frames().frames()[1].uniform_buffer().handle();
    assert_eq!(
        gpu.buffer_contents(last_slot).unwrap(),
        bytemuck::bytes_of(renderer.uniforms())
    );
    assert!(gpu.violations().is_empty(), "{:?}", gpu.violations());
}

#[test]
fn test_configured_tessellation_shaders_reach_pipeline() {
    let paths = write_shader_files(
        "tessellation",
        &[
            ("quad.vert.spv", spirv(1)),
            ("quad.frag.spv", spirv(2)),
            ("quad.tesc.spv", spirv(3)),
            ("quad.tese.spv", spirv(4)),
        ],
    );
    let config = RendererConfig::default()
        .with_shaders(&paths[0], &paths[1])
        .with_tessellation_shaders(&paths[2], &paths[3]);

    let loaded = ShaderSources::load(&config).unwrap();
    assert_eq!(loaded.vertex, spirv(1));
    assert_eq!(loaded.fragment, spirv(2));
    assert_eq!(loaded.tessellation, Some((spirv(3), spirv(4))));

    let supported = Arc::new(MockGpu::new(QueueRoles::single(0)).with_features(
        vk::PhysicalDeviceFeatures {
            tessellation_shader: vk::TRUE,
            ..Default::default()
        },
    ));
    let renderer = Renderer::new(supported.clone(), vk::SurfaceKHR::null(), &config, &loaded)
        .unwrap();
    assert!(renderer.pipeline().has_tessellation());
    let record = supported.pipelines_created()[0];
    assert_eq!(record.stage_count, 4);
    assert_eq!(record.topology, vk::PrimitiveTopology::PATCH_LIST);
    assert_eq!(record.patch_control_points, Some(3));

    let unsupported = Arc::new(MockGpu::new(QueueRoles::single(0)));
    let renderer = Renderer::new(unsupported.clone(), vk::SurfaceKHR::null(), &config, &loaded)
        .unwrap();
    assert!(!renderer.pipeline().has_tessellation());
    assert_eq!(unsupported.pipelines_created()[0].stage_count, 2);

    let missing = config.with_tessellation_shaders(&paths[2], "missing/quad.tese.spv");
    assert!(matches!(
        ShaderSources::load(&missing),
        Err(RhiError::ShaderError(_))
    ));

    for path in &paths {
        let _ = std::fs::remove_file(path);
    }
}
