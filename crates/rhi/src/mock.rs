//! In-memory [`Gpu`] backend for tests.
//!
//! `MockGpu` hands out fake handles and keeps enough state to check the
//! ordering rules the presentation core relies on:
//!
//! - A fence attached to a submission stays unsignaled until somebody waits
//!   on it (or calls [`MockGpu::complete_all`]), which models a GPU that is
//!   always behind the CPU.
//! - Beginning a command buffer whose last submission has not completed,
//!   resetting a fence that is still pending, waiting on a fence nothing will
//!   ever signal, and waiting on a semaphore nothing signaled are all recorded
//!   as violations.
//! - Device memory is backed by host bytes and copy commands are executed at
//!   submit time, so uploaded data can be read back.
//! - Acquire and present outcomes can be scripted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ash::vk;
use ash::vk::Handle;

use crate::error::{RhiError, RhiResult};
use crate::gpu::{Command, Gpu, SubmitDesc, SwapchainDesc};
use crate::physical_device::QueueRoles;
use crate::swapchain::SurfaceSupport;

/// Scripted outcome of the next `acquire_next_image`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockAcquire {
    Image(u32),
    Suboptimal(u32),
    Error(vk::Result),
}

/// Scripted outcome of the next `queue_present`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockPresent {
    Ok,
    Suboptimal,
    Error(vk::Result),
}

/// One recorded queue submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    /// Commands of each submitted buffer, as recorded at submit time.
    pub commands: Vec<Vec<Command>>,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
    pub fence: vk::Fence,
}

/// Fixed-function state captured from one `create_graphics_pipeline` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineRecord {
    /// Size of the first baked viewport.
    pub viewport: (u32, u32),
    pub stage_count: u32,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub topology: vk::PrimitiveTopology,
    /// Patch control points when a tessellation state is present.
    pub patch_control_points: Option<u32>,
}

/// One recorded present call.
#[derive(Debug, Clone)]
pub struct Presentation {
    pub queue: vk::Queue,
    pub swapchain: vk::SwapchainKHR,
    pub image_index: u32,
    pub wait_semaphores: Vec<vk::Semaphore>,
}

/// One flushed host write to mapped memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flush {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    /// Fences whose submissions had not completed when the write landed.
    pub pending_fences: Vec<vk::Fence>,
}

#[derive(Debug, Default, Clone, Copy)]
struct FenceState {
    signaled: bool,
    pending: bool,
    waits: usize,
}

#[derive(Debug, Default)]
struct CommandBufferState {
    commands: Vec<Command>,
    recording: bool,
    in_flight: Option<vk::Fence>,
    begins: usize,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    memory: u64,
    offset: u64,
}

#[derive(Debug)]
struct BufferState {
    size: u64,
    usage: vk::BufferUsageFlags,
    binding: Option<Binding>,
}

#[derive(Debug)]
struct ImageState {
    extent: vk::Extent3D,
    binding: Option<Binding>,
}

#[derive(Debug)]
struct MemoryState {
    type_index: u32,
    bytes: Box<[u8]>,
    mapped: bool,
}

#[derive(Debug)]
struct SwapchainState {
    images: Vec<vk::Image>,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    fences: HashMap<u64, FenceState>,
    semaphores: HashMap<u64, bool>,
    command_pools: HashSet<u64>,
    command_buffers: HashMap<u64, CommandBufferState>,
    buffers: HashMap<u64, BufferState>,
    images: HashMap<u64, ImageState>,
    memory: HashMap<u64, MemoryState>,
    image_views: HashMap<u64, vk::Image>,
    samplers: HashSet<u64>,
    framebuffers: HashMap<u64, Vec<vk::ImageView>>,
    shader_modules: HashSet<u64>,
    render_passes: HashSet<u64>,
    pipeline_layouts: HashSet<u64>,
    pipelines: HashSet<u64>,
    swapchains: HashMap<u64, SwapchainState>,
    swapchain_history: Vec<SwapchainDesc>,
    pipelines_created: Vec<PipelineRecord>,
    submissions: Vec<Submission>,
    presentations: Vec<Presentation>,
    flushes: Vec<Flush>,
    /// Pending fence count at each surface capability query.
    surface_query_backlog: Vec<usize>,
    acquire_script: VecDeque<MockAcquire>,
    present_script: VecDeque<MockPresent>,
    begin_failure: Option<vk::Result>,
    next_image: u32,
    wait_idle_calls: usize,
    framebuffers_created: usize,
    violations: Vec<String>,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn violation(&mut self, message: String) {
        tracing::warn!("mock gpu violation: {}", message);
        self.violations.push(message);
    }

    /// Marks a fence signaled and releases the command buffers it guarded.
    fn signal_fence(&mut self, fence: u64) {
        if let Some(state) = self.fences.get_mut(&fence) {
            state.pending = false;
            state.signaled = true;
        }
        for cb in self.command_buffers.values_mut() {
            if cb.in_flight.map(|f| f.as_raw()) == Some(fence) {
                cb.in_flight = None;
            }
        }
    }

    fn pending_fences(&self) -> Vec<vk::Fence> {
        let mut pending: Vec<vk::Fence> = self
            .fences
            .iter()
            .filter(|(_, state)| state.pending)
            .map(|(&raw, _)| vk::Fence::from_raw(raw))
            .collect();
        pending.sort_by_key(|fence| fence.as_raw());
        pending
    }

    fn complete_all(&mut self) {
        let pending: Vec<u64> = self
            .fences
            .iter()
            .filter(|(_, state)| state.pending)
            .map(|(&raw, _)| raw)
            .collect();
        for raw in pending {
            self.signal_fence(raw);
        }
        for cb in self.command_buffers.values_mut() {
            cb.in_flight = None;
        }
    }

    fn memory_slice(&mut self, binding: Binding, offset: u64, len: u64) -> Option<&mut [u8]> {
        let memory = self.memory.get_mut(&binding.memory)?;
        let start = (binding.offset + offset) as usize;
        let end = start.checked_add(len as usize)?;
        memory.bytes.get_mut(start..end)
    }

    fn read_bytes(&mut self, binding: Binding, offset: u64, len: u64) -> Option<Vec<u8>> {
        self.memory_slice(binding, offset, len).map(|s| s.to_vec())
    }

    /// Executes the data-moving commands of a submitted buffer.
    fn execute(&mut self, commands: &[Command]) {
        for command in commands {
            match command {
                Command::CopyBuffer { src, dst, regions } => {
                    let src_binding = self.buffers.get(&src.as_raw()).and_then(|b| b.binding);
                    let dst_binding = self.buffers.get(&dst.as_raw()).and_then(|b| b.binding);
                    let (Some(src_binding), Some(dst_binding)) = (src_binding, dst_binding) else {
                        self.violation(format!("copy between unbound buffers {:?} -> {:?}", src, dst));
                        continue;
                    };
                    for region in regions {
                        let Some(data) = self.read_bytes(src_binding, region.src_offset, region.size)
                        else {
                            self.violation(format!("copy region out of range: {:?}", region));
                            continue;
                        };
                        match self.memory_slice(dst_binding, region.dst_offset, region.size) {
                            Some(dst) => dst.copy_from_slice(&data),
                            None => self.violation(format!("copy region out of range: {:?}", region)),
                        }
                    }
                }
                Command::CopyBufferToImage {
                    src,
                    dst,
                    dst_layout,
                    regions,
                } => {
                    if *dst_layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                        self.violation(format!("copy into image in layout {:?}", dst_layout));
                    }
                    let src_binding = self.buffers.get(&src.as_raw()).and_then(|b| b.binding);
                    let image = self.images.get(&dst.as_raw()).map(|i| (i.binding, i.extent));
                    let (Some(src_binding), Some((Some(dst_binding), extent))) = (src_binding, image)
                    else {
                        self.violation(format!("copy into unbound image {:?}", dst));
                        continue;
                    };
                    let len = u64::from(extent.width) * u64::from(extent.height) * 4;
                    for region in regions {
                        let Some(data) = self.read_bytes(src_binding, region.buffer_offset, len) else {
                            self.violation("image copy out of range".to_string());
                            continue;
                        };
                        match self.memory_slice(dst_binding, 0, len) {
                            Some(dst) => dst.copy_from_slice(&data),
                            None => self.violation("image copy out of range".to_string()),
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A recording, memory-backed stand-in for a Vulkan device.
#[derive(Debug)]
pub struct MockGpu {
    roles: QueueRoles,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    features: vk::PhysicalDeviceFeatures,
    surface: Mutex<SurfaceSupport>,
    state: Mutex<MockState>,
}

/// Memory types exposed by default:
/// 0 device-local, 1 host-visible + coherent, 2 host-visible only.
pub fn default_memory_properties() -> vk::PhysicalDeviceMemoryProperties {
    let mut props = vk::PhysicalDeviceMemoryProperties {
        memory_type_count: 3,
        memory_heap_count: 2,
        ..Default::default()
    };
    props.memory_types[0] = vk::MemoryType {
        property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        heap_index: 0,
    };
    props.memory_types[1] = vk::MemoryType {
        property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT,
        heap_index: 1,
    };
    props.memory_types[2] = vk::MemoryType {
        property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
        heap_index: 1,
    };
    props.memory_heaps[0] = vk::MemoryHeap {
        size: 256 << 20,
        flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
    };
    props.memory_heaps[1] = vk::MemoryHeap {
        size: 256 << 20,
        flags: vk::MemoryHeapFlags::empty(),
    };
    props
}

/// A surface offering FIFO and MAILBOX, an sRGB format, and a fixed
/// `width`x`height` current extent.
pub fn default_surface(width: u32, height: u32) -> SurfaceSupport {
    SurfaceSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 4,
            current_extent: vk::Extent2D { width, height },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            ..Default::default()
        },
        formats: vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ],
        present_modes: vec![vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO],
    }
}

const ALIGNMENT: u64 = 256;

fn aligned(size: u64) -> u64 {
    size.div_ceil(ALIGNMENT).max(1) * ALIGNMENT
}

impl MockGpu {
    /// Creates a mock device whose queues follow `roles`.
    pub fn new(roles: QueueRoles) -> Self {
        Self {
            roles,
            memory_properties: default_memory_properties(),
            features: vk::PhysicalDeviceFeatures::default(),
            surface: Mutex::new(default_surface(800, 600)),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_surface(self, surface: SurfaceSupport) -> Self {
        *self.surface.lock().unwrap_or_else(PoisonError::into_inner) = surface;
        self
    }

    pub fn with_memory_properties(mut self, props: vk::PhysicalDeviceMemoryProperties) -> Self {
        self.memory_properties = props;
        self
    }

    pub fn with_features(mut self, features: vk::PhysicalDeviceFeatures) -> Self {
        self.features = features;
        self
    }

    /// Changes the surface's current extent, as a window resize would.
    pub fn set_surface_extent(&self, width: u32, height: u32) {
        let mut surface = self.surface.lock().unwrap_or_else(PoisonError::into_inner);
        surface.capabilities.current_extent = vk::Extent2D { width, height };
    }

    pub fn script_acquire<I: IntoIterator<Item = MockAcquire>>(&self, steps: I) {
        lock(&self.state).acquire_script.extend(steps);
    }

    pub fn script_present<I: IntoIterator<Item = MockPresent>>(&self, steps: I) {
        lock(&self.state).present_script.extend(steps);
    }

    /// Makes the next `begin_command_buffer` fail with `result`.
    pub fn fail_next_begin(&self, result: vk::Result) {
        lock(&self.state).begin_failure = Some(result);
    }

    /// Lets the "GPU" catch up: every pending fence becomes signaled.
    pub fn complete_all(&self) {
        lock(&self.state).complete_all();
    }

    pub fn violations(&self) -> Vec<String> {
        lock(&self.state).violations.clone()
    }

    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.state).submissions.clone()
    }

    pub fn presentations(&self) -> Vec<Presentation> {
        lock(&self.state).presentations.clone()
    }

    /// Every swapchain description passed to `create_swapchain`, in order.
    pub fn swapchain_history(&self) -> Vec<SwapchainDesc> {
        lock(&self.state).swapchain_history.clone()
    }

    /// Viewport extent of every pipeline created, in order.
    pub fn pipelines_created(&self) -> Vec<PipelineRecord> {
        lock(&self.state).pipelines_created.clone()
    }

    /// Number of times `fence` has been waited on.
    pub fn fence_waits(&self, fence: vk::Fence) -> usize {
        lock(&self.state)
            .fences
            .get(&fence.as_raw())
            .map_or(0, |f| f.waits)
    }

    /// Number of `begin_command_buffer` calls on `command_buffer`.
    pub fn begin_count(&self, command_buffer: vk::CommandBuffer) -> usize {
        lock(&self.state)
            .command_buffers
            .get(&command_buffer.as_raw())
            .map_or(0, |cb| cb.begins)
    }

    /// Commands of the most recent recording of `command_buffer`.
    pub fn commands(&self, command_buffer: vk::CommandBuffer) -> Vec<Command> {
        lock(&self.state)
            .command_buffers
            .get(&command_buffer.as_raw())
            .map(|cb| cb.commands.clone())
            .unwrap_or_default()
    }

    pub fn flushes(&self) -> Vec<Flush> {
        lock(&self.state).flushes.clone()
    }

    /// Flushes that landed on `memory`, in order.
    pub fn flushes_of(&self, memory: vk::DeviceMemory) -> Vec<Flush> {
        lock(&self.state)
            .flushes
            .iter()
            .filter(|flush| flush.memory == memory)
            .cloned()
            .collect()
    }

    /// Number of fences still pending at each surface capability query.
    pub fn surface_query_backlog(&self) -> Vec<usize> {
        lock(&self.state).surface_query_backlog.clone()
    }

    pub fn wait_idle_calls(&self) -> usize {
        lock(&self.state).wait_idle_calls
    }

    pub fn framebuffers_created(&self) -> usize {
        lock(&self.state).framebuffers_created
    }

    pub fn framebuffer_attachments(&self, framebuffer: vk::Framebuffer) -> Option<Vec<vk::ImageView>> {
        lock(&self.state)
            .framebuffers
            .get(&framebuffer.as_raw())
            .cloned()
    }

    /// Image a swapchain or texture view was created for.
    pub fn view_image(&self, view: vk::ImageView) -> Option<vk::Image> {
        lock(&self.state).image_views.get(&view.as_raw()).copied()
    }

    /// Bytes currently stored in the memory bound to `buffer`.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        let mut state = lock(&self.state);
        let (binding, size) = state
            .buffers
            .get(&buffer.as_raw())
            .and_then(|b| b.binding.map(|binding| (binding, b.size)))?;
        state.read_bytes(binding, 0, size)
    }

    /// Bytes currently stored in the memory bound to `image` (RGBA8, tightly packed).
    pub fn image_contents(&self, image: vk::Image) -> Option<Vec<u8>> {
        let mut state = lock(&self.state);
        let (binding, extent) = state
            .images
            .get(&image.as_raw())
            .and_then(|i| i.binding.map(|binding| (binding, i.extent)))?;
        let len = u64::from(extent.width) * u64::from(extent.height) * 4;
        state.read_bytes(binding, 0, len)
    }

    pub fn buffer_usage(&self, buffer: vk::Buffer) -> Option<vk::BufferUsageFlags> {
        lock(&self.state).buffers.get(&buffer.as_raw()).map(|b| b.usage)
    }

    /// Memory type index backing `buffer`.
    pub fn buffer_memory_type(&self, buffer: vk::Buffer) -> Option<u32> {
        let state = lock(&self.state);
        let binding = state.buffers.get(&buffer.as_raw())?.binding?;
        state.memory.get(&binding.memory).map(|m| m.type_index)
    }

    pub fn is_live_buffer(&self, buffer: vk::Buffer) -> bool {
        lock(&self.state).buffers.contains_key(&buffer.as_raw())
    }

    /// Count of objects created and not yet destroyed (swapchain images excluded).
    pub fn live_objects(&self) -> usize {
        let state = lock(&self.state);
        let swapchain_images: usize = state.swapchains.values().map(|s| s.images.len()).sum();
        state.fences.len()
            + state.semaphores.len()
            + state.command_pools.len()
            + state.buffers.len()
            + (state.images.len() - swapchain_images)
            + state.memory.len()
            + state.image_views.len()
            + state.samplers.len()
            + state.framebuffers.len()
            + state.shader_modules.len()
            + state.render_passes.len()
            + state.pipeline_layouts.len()
            + state.pipelines.len()
            + state.swapchains.len()
    }

    fn queue_for(family: u32) -> vk::Queue {
        vk::Queue::from_raw(0x1000 + u64::from(family))
    }
}

fn check_destroyed<T>(state: &mut MockState, removed: Option<T>, what: &str, raw: u64) {
    if removed.is_none() {
        state.violation(format!("destroyed unknown {} {:#x}", what, raw));
    }
}

impl Gpu for MockGpu {
    fn queue_roles(&self) -> QueueRoles {
        self.roles
    }

    fn graphics_queue(&self) -> vk::Queue {
        Self::queue_for(self.roles.graphics)
    }

    fn present_queue(&self) -> vk::Queue {
        Self::queue_for(self.roles.presentation)
    }

    fn transfer_queue(&self) -> vk::Queue {
        Self::queue_for(self.roles.transfer)
    }

    fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn features(&self) -> &vk::PhysicalDeviceFeatures {
        &self.features
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = lock(&self.state);
        state.wait_idle_calls += 1;
        state.complete_all();
        Ok(())
    }

    fn create_semaphore(&self) -> RhiResult<vk::Semaphore> {
        let mut state = lock(&self.state);
        let raw = state.handle();
        state.semaphores.insert(raw, false);
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let mut state = lock(&self.state);
        let removed = state.semaphores.remove(&semaphore.as_raw());
        check_destroyed(&mut state, removed, "semaphore", semaphore.as_raw());
    }

    fn create_fence(&self, signaled: bool) -> RhiResult<vk::Fence> {
        let mut state = lock(&self.state);
        let raw = state.handle();
        state.fences.insert(
            raw,
            FenceState {
                signaled,
                ..Default::default()
            },
        );
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = lock(&self.state);
        if state.fences.get(&fence.as_raw()).is_some_and(|f| f.pending) {
            state.violation(format!("destroyed pending fence {:?}", fence));
        }
        let removed = state.fences.remove(&fence.as_raw());
        check_destroyed(&mut state, removed, "fence", fence.as_raw());
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout: u64) -> RhiResult<()> {
        let mut state = lock(&self.state);
        for fence in fences {
            let raw = fence.as_raw();
            let Some(fence_state) = state.fences.get_mut(&raw) else {
                state.violation(format!("wait on unknown fence {:?}", fence));
                return Err(RhiError::InvalidHandle(format!("{:?}", fence)));
            };
            fence_state.waits += 1;
            let FenceState {
                signaled, pending, ..
            } = *fence_state;
            if pending {
                state.signal_fence(raw);
            } else if !signaled {
                state.violation(format!("wait on fence {:?} that nothing will signal", fence));
                return Err(RhiError::VulkanError(vk::Result::TIMEOUT));
            }
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> RhiResult<()> {
        let mut state = lock(&self.state);
        for fence in fences {
            let pending = state.fences.get(&fence.as_raw()).map(|f| f.pending);
            match pending {
                Some(true) => state.violation(format!("reset of pending fence {:?}", fence)),
                Some(false) => {}
                None => {
                    state.violation(format!("reset of unknown fence {:?}", fence));
                    continue;
                }
            }
            if let Some(f) = state.fences.get_mut(&fence.as_raw()) {
                f.signaled = false;
            }
        }
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> RhiResult<bool> {
        lock(&self.state)
            .fences
            .get(&fence.as_raw())
            .map(|f| f.signaled)
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", fence)))
    }

    fn create_command_pool(
        &self,
        _queue_family_index: u32,
        _flags: vk::CommandPoolCreateFlags,
    ) -> RhiResult<vk::CommandPool> {
        let mut state = lock(&self.state);
        let raw = state.handle();
        state.command_pools.insert(raw);
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = lock(&self.state);
        let removed = state.command_pools.remove(&pool.as_raw()).then_some(());
        check_destroyed(&mut state, removed, "command pool", pool.as_raw());
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> RhiResult<Vec<vk::CommandBuffer>> {
        let mut state = lock(&self.state);
        if !state.command_pools.contains(&pool.as_raw()) {
            return Err(RhiError::InvalidHandle(format!("{:?}", pool)));
        }
        Ok((0..count)
            .map(|_| {
                let raw = state.handle();
                state.command_buffers.insert(raw, CommandBufferState::default());
                vk::CommandBuffer::from_raw(raw)
            })
            .collect())
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
    ) -> RhiResult<()> {
        let mut state = lock(&self.state);
        if let Some(result) = state.begin_failure.take() {
            return Err(RhiError::VulkanError(result));
        }
        let Some(cb) = state.command_buffers.get_mut(&command_buffer.as_raw()) else {
            return Err(RhiError::InvalidHandle(format!("{:?}", command_buffer)));
        };
        let in_flight = cb.in_flight;
        cb.commands.clear();
        cb.recording = true;
        cb.begins += 1;
        if let Some(fence) = in_flight {
            state.violation(format!(
                "command buffer {:?} re-recorded while fence {:?} is unsignaled",
                command_buffer, fence
            ));
        }
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> RhiResult<()> {
        let mut state = lock(&self.state);
        let recording = state
            .command_buffers
            .get_mut(&command_buffer.as_raw())
            .map(|cb| std::mem::replace(&mut cb.recording, false));
        match recording {
            Some(true) => Ok(()),
            Some(false) => {
                state.violation(format!("end of command buffer {:?} not recording", command_buffer));
                Ok(())
            }
            None => Err(RhiError::InvalidHandle(format!("{:?}", command_buffer))),
        }
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &Command) {
        let mut state = lock(&self.state);
        let recording = match state.command_buffers.get_mut(&command_buffer.as_raw()) {
            Some(cb) if cb.recording => {
                cb.commands.push(command.clone());
                true
            }
            _ => false,
        };
        if !recording {
            state.violation(format!(
                "{:?} recorded into {:?} outside begin/end",
                command, command_buffer
            ));
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submit: &SubmitDesc<'_>,
        fence: vk::Fence,
    ) -> RhiResult<()> {
        let mut state = lock(&self.state);

        if submit.wait_semaphores.len() != submit.wait_stages.len() {
            state.violation("wait semaphore and stage counts differ".to_string());
        }
        for semaphore in submit.wait_semaphores {
            match state.semaphores.get_mut(&semaphore.as_raw()) {
                Some(signaled) if *signaled => *signaled = false,
                _ => state.violation(format!("submit waits on unsignaled semaphore {:?}", semaphore)),
            }
        }

        let mut commands = Vec::with_capacity(submit.command_buffers.len());
        for cb in submit.command_buffers {
            let recorded = match state.command_buffers.get_mut(&cb.as_raw()) {
                Some(cb_state) if !cb_state.recording => {
                    cb_state.in_flight = (fence != vk::Fence::null()).then_some(fence);
                    Some(cb_state.commands.clone())
                }
                _ => None,
            };
            match recorded {
                Some(list) => commands.push(list),
                None => {
                    state.violation(format!("submitted command buffer {:?} still recording", cb));
                    commands.push(Vec::new());
                }
            }
        }

        for list in &commands {
            state.execute(list);
        }

        for semaphore in submit.signal_semaphores {
            if let Some(signaled) = state.semaphores.get_mut(&semaphore.as_raw()) {
                *signaled = true;
            }
        }

        if fence != vk::Fence::null() {
            match state.fences.get_mut(&fence.as_raw()) {
                Some(f) if f.signaled || f.pending => {
                    state.violation(format!("submit with fence {:?} not reset", fence))
                }
                Some(f) => f.pending = true,
                None => return Err(RhiError::InvalidHandle(format!("{:?}", fence))),
            }
        }

        state.submissions.push(Submission {
            queue,
            command_buffers: submit.command_buffers.to_vec(),
            commands,
            wait_semaphores: submit.wait_semaphores.to_vec(),
            wait_stages: submit.wait_stages.to_vec(),
            signal_semaphores: submit.signal_semaphores.to_vec(),
            fence,
        });
        Ok(())
    }

    fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> RhiResult<vk::Buffer> {
        let mut state = lock(&self.state);
        let raw = state.handle();
        state.buffers.insert(
            raw,
            BufferState {
                size: info.size,
                usage: info.usage,
                binding: None,
            },
        );
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = lock(&self.state);
        let removed = state.buffers.remove(&buffer.as_raw());
        check_destroyed(&mut state, removed, "buffer", buffer.as_raw());
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = lock(&self.state)
            .buffers
            .get(&buffer.as_raw())
            .map_or(0, |b| b.size);
        vk::MemoryRequirements {
            size: aligned(size),
            alignment: ALIGNMENT,
            memory_type_bits: (1 << self.memory_properties.memory_type_count) - 1,
        }
    }

    fn create_image(&self, info: &vk::ImageCreateInfo<'_>) -> RhiResult<vk::Image> {
        let mut state = lock(&self.state);
        let raw = state.handle();
        state.images.insert(
            raw,
            ImageState {
                extent: info.extent,
                binding: None,
            },
        );
        Ok(vk::Image::from_raw(raw))
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = lock(&self.state);
        let removed = state.images.remove(&image.as_raw());
        check_destroyed(&mut state, removed, "image", image.as_raw());
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        let size = lock(&self.state).images.get(&image.as_raw()).map_or(0, |i| {
            u64::from(i.extent.width) * u64::from(i.extent.height) * 4
        });
        vk::MemoryRequirements {
            size: aligned(size),
            alignment: ALIGNMENT,
            // Images only live in device-local memory here.
            memory_type_bits: 0b1,
        }
    }

    fn allocate_memory(&self, info: &vk::MemoryAllocateInfo<'_>) -> RhiResult<vk::DeviceMemory> {
        if info.memory_type_index >= self.memory_properties.memory_type_count {
            return Err(RhiError::VulkanError(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let mut state = lock(&self.state);
        let raw = state.handle();
        state.memory.insert(
            raw,
            MemoryState {
                type_index: info.memory_type_index,
                bytes: vec![0u8; info.allocation_size as usize].into_boxed_slice(),
                mapped: false,
            },
        );
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        let mut state = lock(&self.state);
        let removed = state.memory.remove(&memory.as_raw());
        check_destroyed(&mut state, removed, "memory", memory.as_raw());
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> RhiResult<()> {
        let mut state = lock(&self.state);
        if !state.memory.contains_key(&memory.as_raw()) {
            return Err(RhiError::InvalidHandle(format!("{:?}", memory)));
        }
        let buffer_state = state
            .buffers
            .get_mut(&buffer.as_raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", buffer)))?;
        buffer_state.binding = Some(Binding {
            memory: memory.as_raw(),
            offset,
        });
        Ok(())
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> RhiResult<()> {
        let mut state = lock(&self.state);
        if !state.memory.contains_key(&memory.as_raw()) {
            return Err(RhiError::InvalidHandle(format!("{:?}", memory)));
        }
        let image_state = state
            .images
            .get_mut(&image.as_raw())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", image)))?;
        image_state.binding = Some(Binding {
            memory: memory.as_raw(),
            offset,
        });
        Ok(())
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> RhiResult<*mut u8> {
        let mut state = lock(&self.state);
        let host_visible = state.memory.get(&memory.as_raw()).map(|m| {
            self.memory_properties.memory_types[m.type_index as usize]
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        });
        match host_visible {
            None => return Err(RhiError::InvalidHandle(format!("{:?}", memory))),
            Some(false) => {
                state.violation(format!("mapped device-local memory {:?}", memory));
                return Err(RhiError::VulkanError(vk::Result::ERROR_MEMORY_MAP_FAILED));
            }
            Some(true) => {}
        }
        let Some(mem) = state.memory.get_mut(&memory.as_raw()) else {
            return Err(RhiError::InvalidHandle(format!("{:?}", memory)));
        };
        if mem.mapped {
            return Err(RhiError::VulkanError(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        let end = offset.saturating_add(size);
        if end > mem.bytes.len() as u64 {
            return Err(RhiError::VulkanError(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        mem.mapped = true;
        // The boxed slice never reallocates, so the pointer stays valid until unmap.
        Ok(unsafe { mem.bytes.as_mut_ptr().add(offset as usize) })
    }

    fn flush_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> RhiResult<()> {
        let mut state = lock(&self.state);
        if !state.memory.get(&memory.as_raw()).is_some_and(|m| m.mapped) {
            state.violation(format!("flush of unmapped memory {:?}", memory));
        }
        let pending_fences = state.pending_fences();
        state.flushes.push(Flush {
            memory,
            offset,
            size,
            pending_fences,
        });
        Ok(())
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let mut state = lock(&self.state);
        match state.memory.get_mut(&memory.as_raw()) {
            Some(m) if m.mapped => m.mapped = false,
            _ => state.violation(format!("unmap of unmapped memory {:?}", memory)),
        }
    }

    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> RhiResult<vk::ImageView> {
        let mut state = lock(&self.state);
        if !state.images.contains_key(&info.image.as_raw()) {
            return Err(RhiError::InvalidHandle(format!("{:?}", info.image)));
        }
        let raw = state.handle();
        state.image_views.insert(raw, info.image);
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = lock(&self.state);
        let removed = state.image_views.remove(&view.as_raw());
        check_destroyed(&mut state, removed, "image view", view.as_raw());
    }

    fn create_sampler(&self, _info: &vk::SamplerCreateInfo<'_>) -> RhiResult<vk::Sampler> {
        let mut state = lock(&self.state);
        let raw = state.handle();
        state.samplers.insert(raw);
        Ok(vk::Sampler::from_raw(raw))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        let mut state = lock(&self.state);
        let removed = state.samplers.remove(&sampler.as_raw()).then_some(());
        check_destroyed(&mut state, removed, "sampler", sampler.as_raw());
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> RhiResult<vk::Framebuffer> {
        let mut state = lock(&self.state);
        if !state.render_passes.contains(&render_pass.as_raw()) {
            return Err(RhiError::InvalidHandle(format!("{:?}", render_pass)));
        }
        if let Some(missing) = attachments
            .iter()
            .find(|view| !state.image_views.contains_key(&view.as_raw()))
        {
            return Err(RhiError::InvalidHandle(format!("{:?}", missing)));
        }
        let raw = state.handle();
        state.framebuffers.insert(raw, attachments.to_vec());
        state.framebuffers_created += 1;
        Ok(vk::Framebuffer::from_raw(raw))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        let mut state = lock(&self.state);
        let removed = state.framebuffers.remove(&framebuffer.as_raw());
        check_destroyed(&mut state, removed, "framebuffer", framebuffer.as_raw());
    }

    fn surface_support(&self, _surface: vk::SurfaceKHR) -> RhiResult<SurfaceSupport> {
        {
            let mut state = lock(&self.state);
            let backlog = state.pending_fences().len();
            state.surface_query_backlog.push(backlog);
        }
        Ok(self
            .surface
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> RhiResult<vk::SwapchainKHR> {
        let mut state = lock(&self.state);
        if old_swapchain != vk::SwapchainKHR::null()
            && !state.swapchains.contains_key(&old_swapchain.as_raw())
        {
            return Err(RhiError::InvalidHandle(format!("{:?}", old_swapchain)));
        }
        let raw = state.handle();
        let images: Vec<vk::Image> = (0..desc.min_image_count.max(1))
            .map(|_| {
                let image_raw = state.handle();
                state.images.insert(
                    image_raw,
                    ImageState {
                        extent: vk::Extent3D {
                            width: desc.extent.width,
                            height: desc.extent.height,
                            depth: 1,
                        },
                        binding: None,
                    },
                );
                vk::Image::from_raw(image_raw)
            })
            .collect();
        state.swapchains.insert(raw, SwapchainState { images });
        state.swapchain_history.push(desc.clone());
        state.next_image = 0;
        Ok(vk::SwapchainKHR::from_raw(raw))
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RhiResult<Vec<vk::Image>> {
        lock(&self.state)
            .swapchains
            .get(&swapchain.as_raw())
            .map(|s| s.images.clone())
            .ok_or_else(|| RhiError::InvalidHandle(format!("{:?}", swapchain)))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = lock(&self.state);
        match state.swapchains.remove(&swapchain.as_raw()) {
            Some(removed) => {
                for image in removed.images {
                    state.images.remove(&image.as_raw());
                }
            }
            None => state.violation(format!("destroyed unknown swapchain {:?}", swapchain)),
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<(u32, bool), vk::Result> {
        let mut state = lock(&self.state);
        let Some(image_count) = state
            .swapchains
            .get(&swapchain.as_raw())
            .map(|s| s.images.len() as u32)
        else {
            return Err(vk::Result::ERROR_SURFACE_LOST_KHR);
        };

        let (index, suboptimal) = match state.acquire_script.pop_front() {
            Some(MockAcquire::Error(result)) => return Err(result),
            Some(MockAcquire::Image(index)) => (index, false),
            Some(MockAcquire::Suboptimal(index)) => (index, true),
            None => {
                let index = state.next_image % image_count;
                state.next_image = index + 1;
                (index, false)
            }
        };

        match state.semaphores.get_mut(&semaphore.as_raw()) {
            Some(signaled) if !*signaled => *signaled = true,
            _ => state.violation(format!(
                "acquire signals semaphore {:?} that is already signaled or unknown",
                semaphore
            )),
        }
        Ok((index, suboptimal))
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool, vk::Result> {
        let mut state = lock(&self.state);
        for semaphore in wait_semaphores {
            match state.semaphores.get_mut(&semaphore.as_raw()) {
                Some(signaled) if *signaled => *signaled = false,
                _ => state.violation(format!("present waits on unsignaled semaphore {:?}", semaphore)),
            }
        }
        state.presentations.push(Presentation {
            queue,
            swapchain,
            image_index,
            wait_semaphores: wait_semaphores.to_vec(),
        });
        match state.present_script.pop_front() {
            None | Some(MockPresent::Ok) => Ok(false),
            Some(MockPresent::Suboptimal) => Ok(true),
            Some(MockPresent::Error(result)) => Err(result),
        }
    }

    fn create_shader_module(&self, code: &[u32]) -> RhiResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(RhiError::ShaderError("empty SPIR-V module".to_string()));
        }
        let mut state = lock(&self.state);
        let raw = state.handle();
        state.shader_modules.insert(raw);
        Ok(vk::ShaderModule::from_raw(raw))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        let mut state = lock(&self.state);
        let removed = state.shader_modules.remove(&module.as_raw()).then_some(());
        check_destroyed(&mut state, removed, "shader module", module.as_raw());
    }

    fn create_render_pass(&self, _info: &vk::RenderPassCreateInfo<'_>) -> RhiResult<vk::RenderPass> {
        let mut state = lock(&self.state);
        let raw = state.handle();
        state.render_passes.insert(raw);
        Ok(vk::RenderPass::from_raw(raw))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        let mut state = lock(&self.state);
        let removed = state.render_passes.remove(&render_pass.as_raw()).then_some(());
        check_destroyed(&mut state, removed, "render pass", render_pass.as_raw());
    }

    fn create_pipeline_layout(
        &self,
        _info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> RhiResult<vk::PipelineLayout> {
        let mut state = lock(&self.state);
        let raw = state.handle();
        state.pipeline_layouts.insert(raw);
        Ok(vk::PipelineLayout::from_raw(raw))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        let mut state = lock(&self.state);
        let removed = state.pipeline_layouts.remove(&layout.as_raw()).then_some(());
        check_destroyed(&mut state, removed, "pipeline layout", layout.as_raw());
    }

    fn create_graphics_pipeline(
        &self,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> RhiResult<vk::Pipeline> {
        // SAFETY: the create info and everything it points to outlive this call.
        let record = unsafe {
            let viewport = info
                .p_viewport_state
                .as_ref()
                .filter(|vs| vs.viewport_count > 0)
                .and_then(|vs| vs.p_viewports.as_ref())
                .map(|vp| (vp.width as u32, vp.height as u32));
            let rasterization = info.p_rasterization_state.as_ref();
            let assembly = info.p_input_assembly_state.as_ref();
            match (viewport, rasterization, assembly) {
                (Some(viewport), Some(raster), Some(assembly)) => Some(PipelineRecord {
                    viewport,
                    stage_count: info.stage_count,
                    polygon_mode: raster.polygon_mode,
                    cull_mode: raster.cull_mode,
                    front_face: raster.front_face,
                    topology: assembly.topology,
                    patch_control_points: info
                        .p_tessellation_state
                        .as_ref()
                        .map(|t| t.patch_control_points),
                }),
                _ => None,
            }
        };
        let mut state = lock(&self.state);
        if !state.render_passes.contains(&info.render_pass.as_raw()) {
            return Err(RhiError::InvalidHandle(format!("{:?}", info.render_pass)));
        }
        let Some(record) = record else {
            state.violation("graphics pipeline with incomplete fixed-function state".to_string());
            return Err(RhiError::PipelineError("incomplete pipeline state".into()));
        };
        state.pipelines_created.push(record);
        let raw = state.handle();
        state.pipelines.insert(raw);
        Ok(vk::Pipeline::from_raw(raw))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let mut state = lock(&self.state);
        let removed = state.pipelines.remove(&pipeline.as_raw()).then_some(());
        check_destroyed(&mut state, removed, "pipeline", pipeline.as_raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu() -> MockGpu {
        MockGpu::new(QueueRoles::single(0))
    }

    #[test]
    fn test_fence_signals_only_when_waited() {
        let gpu = gpu();
        let fence = gpu.create_fence(false).unwrap();
        let pool = gpu.create_command_pool(0, vk::CommandPoolCreateFlags::empty()).unwrap();
        let cb = gpu.allocate_command_buffers(pool, 1).unwrap()[0];

        gpu.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty()).unwrap();
        gpu.end_command_buffer(cb).unwrap();
        let submit = SubmitDesc {
            command_buffers: &[cb],
            ..Default::default()
        };
        gpu.queue_submit(gpu.graphics_queue(), &submit, fence).unwrap();

        assert!(!gpu.fence_signaled(fence).unwrap());
        gpu.wait_for_fences(&[fence], u64::MAX).unwrap();
        assert!(gpu.fence_signaled(fence).unwrap());
        assert_eq!(gpu.fence_waits(fence), 1);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn test_rerecord_in_flight_is_flagged() {
        let gpu = gpu();
        let fence = gpu.create_fence(false).unwrap();
        let pool = gpu.create_command_pool(0, vk::CommandPoolCreateFlags::empty()).unwrap();
        let cb = gpu.allocate_command_buffers(pool, 1).unwrap()[0];

        gpu.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty()).unwrap();
        gpu.end_command_buffer(cb).unwrap();
        let submit = SubmitDesc {
            command_buffers: &[cb],
            ..Default::default()
        };
        gpu.queue_submit(gpu.graphics_queue(), &submit, fence).unwrap();
        gpu.begin_command_buffer(cb, vk::CommandBufferUsageFlags::empty()).unwrap();

        assert_eq!(gpu.violations().len(), 1);
    }

    #[test]
    fn test_wait_on_unsubmitted_fence_fails() {
        let gpu = gpu();
        let fence = gpu.create_fence(false).unwrap();
        assert!(gpu.wait_for_fences(&[fence], u64::MAX).is_err());
        assert_eq!(gpu.violations().len(), 1);
    }

    #[test]
    fn test_scripted_acquire() {
        let gpu = gpu();
        let desc = SwapchainDesc {
            surface: vk::SurfaceKHR::null(),
            min_image_count: 3,
            surface_format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D {
                width: 4,
                height: 4,
            },
            present_mode: vk::PresentModeKHR::FIFO,
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            queue_family_indices: vec![0],
        };
        let swapchain = gpu.create_swapchain(&desc, vk::SwapchainKHR::null()).unwrap();
        let semaphore = gpu.create_semaphore().unwrap();

        gpu.script_acquire([
            MockAcquire::Image(2),
            MockAcquire::Error(vk::Result::ERROR_OUT_OF_DATE_KHR),
        ]);
        assert_eq!(gpu.acquire_next_image(swapchain, u64::MAX, semaphore), Ok((2, false)));
        assert_eq!(
            gpu.acquire_next_image(swapchain, u64::MAX, semaphore),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR)
        );
    }

    #[test]
    fn test_live_objects_track_destruction() {
        let gpu = gpu();
        let fence = gpu.create_fence(true).unwrap();
        let semaphore = gpu.create_semaphore().unwrap();
        assert_eq!(gpu.live_objects(), 2);
        gpu.destroy_fence(fence);
        gpu.destroy_semaphore(semaphore);
        assert_eq!(gpu.live_objects(), 0);
        assert!(gpu.violations().is_empty());
    }
}
