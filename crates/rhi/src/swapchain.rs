//! Swapchain management.
//!
//! This module negotiates presentation parameters with the surface and owns
//! the swapchain together with the views of its images.
//!
//! # Overview
//!
//! - [`SurfaceSupport`] is the raw capability query for one surface.
//! - [`negotiate_presentation`] turns it into a [`PresentationEngineInfo`]:
//!   sRGB format if offered, FIFO if offered, extent per [`ExtentPolicy`].
//! - [`Swapchain`] creates the swapchain, re-queries its images, builds one
//!   view per image and rebuilds all of it on [`Swapchain::recreate`].
//! - Acquire and present outcomes are reported as [`PresentResult`] so the
//!   caller can recover from a stale swapchain instead of aborting.

use std::sync::Arc;

use ash::vk;
use presenter_core::ExtentPolicy;
use tracing::{debug, info, warn};

use crate::device::color_subresource_range;
use crate::error::{RhiError, RhiResult};
use crate::gpu::{Gpu, SwapchainDesc};
use crate::physical_device::QueueRoles;

/// Swapchain surface support details.
///
/// Contains information about what the surface supports for swapchain creation.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    /// Surface capabilities (min/max image count, extents, transforms, etc.)
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats (format and color space combinations)
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes (FIFO, MAILBOX, IMMEDIATE, etc.)
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// Queries swapchain support details for a physical device and surface.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the queries fail.
    pub fn query(
        surface_loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> RhiResult<Self> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)?
        };

        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)?
        };

        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)?
        };

        debug!(
            "Surface support: {} formats, {} present modes, image count: {}-{}",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count,
            if capabilities.max_image_count == 0 {
                "unlimited".to_string()
            } else {
                capabilities.max_image_count.to_string()
            }
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// Returns true if at least one format and one present mode are available.
    #[inline]
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Negotiated swapchain parameters.
#[derive(Debug, Clone, Copy)]
pub struct PresentationEngineInfo {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    /// Image count requested at creation.
    pub min_image_count: u32,
    /// Image count the presentation engine actually created.
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl PresentationEngineInfo {
    /// True when the extent has no area, as for a minimized window.
    #[inline]
    pub fn is_zero_area(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }
}

/// Chooses format, present mode and extent for a surface.
///
/// `window_extent` is only consulted under [`ExtentPolicy::FollowWindow`] when
/// the surface leaves the extent to the swapchain.
///
/// # Errors
///
/// Returns [`RhiError::SwapchainError`] if the surface reports no formats or
/// no present modes.
pub fn negotiate_presentation(
    support: &SurfaceSupport,
    policy: ExtentPolicy,
    window_extent: vk::Extent2D,
) -> RhiResult<PresentationEngineInfo> {
    let surface_format = choose_surface_format(&support.formats).ok_or_else(|| {
        RhiError::SwapchainError("Surface reports no formats".to_string())
    })?;
    let present_mode = choose_present_mode(&support.present_modes).ok_or_else(|| {
        RhiError::SwapchainError("Surface reports no present modes".to_string())
    })?;
    let extent = choose_extent(&support.capabilities, policy, window_extent);
    let min_image_count = support.capabilities.min_image_count;

    Ok(PresentationEngineInfo {
        surface_format,
        present_mode,
        extent,
        min_image_count,
        image_count: min_image_count,
        pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
    })
}

/// Prefers B8G8R8A8_SRGB with SRGB_NONLINEAR, otherwise the first reported format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = formats.iter().find(|f| {
        f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    });

    if let Some(&format) = preferred {
        debug!("Selected preferred surface format: B8G8R8A8_SRGB with SRGB_NONLINEAR");
        return Some(format);
    }

    let first = formats.first().copied();
    if let Some(format) = first {
        warn!(
            "Using first available surface format: {:?} / {:?}",
            format.format, format.color_space
        );
    }
    first
}

/// Prefers FIFO, otherwise the first reported mode.
pub fn choose_present_mode(present_modes: &[vk::PresentModeKHR]) -> Option<vk::PresentModeKHR> {
    if present_modes.contains(&vk::PresentModeKHR::FIFO) {
        debug!("Selected FIFO present mode (vsync)");
        return Some(vk::PresentModeKHR::FIFO);
    }

    let first = present_modes.first().copied();
    if let Some(mode) = first {
        warn!("FIFO not reported, using {:?}", mode);
    }
    first
}

/// Chooses the swapchain extent (resolution).
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    policy: ExtentPolicy,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    match policy {
        ExtentPolicy::SurfaceMinimum => capabilities.min_image_extent,
        ExtentPolicy::FollowWindow if capabilities.current_extent.width != u32::MAX => {
            capabilities.current_extent
        }
        ExtentPolicy::FollowWindow => vk::Extent2D {
            width: window_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        },
    }
}

/// Sharing mode and queue family list for swapchain images.
///
/// Exclusive with the single shared family when graphics and presentation
/// coincide, concurrent across both otherwise.
pub fn sharing(roles: QueueRoles) -> (vk::SharingMode, Vec<u32>) {
    if roles.graphics == roles.presentation {
        (vk::SharingMode::EXCLUSIVE, vec![roles.graphics])
    } else {
        (
            vk::SharingMode::CONCURRENT,
            vec![roles.graphics, roles.presentation],
        )
    }
}

/// Outcome of an acquire or present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentResult {
    Ok,
    /// Suboptimal or out of date; recreate the swapchain.
    OutOfDate,
    /// Device or surface lost.
    Lost,
}

impl PresentResult {
    /// Classifies a failed acquire or present. Errors that are not about
    /// presentation staleness are returned as fatal.
    pub fn from_error(result: vk::Result) -> RhiResult<Self> {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR => Ok(Self::OutOfDate),
            vk::Result::ERROR_DEVICE_LOST | vk::Result::ERROR_SURFACE_LOST_KHR => Ok(Self::Lost),
            other => Err(RhiError::VulkanError(other)),
        }
    }
}

/// Result of [`Swapchain::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// An image was acquired and its semaphore will be signaled.
    Image { index: u32, suboptimal: bool },
    /// No image; nothing was signaled.
    Unavailable(PresentResult),
}

/// Swapchain images and their views, indexed by acquired image index.
#[derive(Debug, Default)]
pub struct SwapchainReferences {
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
}

impl SwapchainReferences {
    #[inline]
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    #[inline]
    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    #[inline]
    pub fn view(&self, image_index: u32) -> Option<vk::ImageView> {
        self.views.get(image_index as usize).copied()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.images.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Vulkan swapchain wrapper.
///
/// Owns the swapchain handle and the image views. The images belong to the
/// presentation engine and are never destroyed here.
///
/// Every successful (re)creation bumps [`generation`](Self::generation), which
/// lets frame contexts detect that their cached framebuffers are stale.
pub struct Swapchain<G: Gpu> {
    gpu: Arc<G>,
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    references: SwapchainReferences,
    info: PresentationEngineInfo,
    policy: ExtentPolicy,
    generation: u64,
}

impl<G: Gpu> Swapchain<G> {
    /// Creates a new swapchain for `surface`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Surface queries fail
    /// - No format or present mode is available
    /// - The negotiated extent has zero area
    /// - Swapchain or image view creation fails
    pub fn new(
        gpu: Arc<G>,
        surface: vk::SurfaceKHR,
        policy: ExtentPolicy,
        window_extent: vk::Extent2D,
    ) -> RhiResult<Self> {
        let support = gpu.surface_support(surface)?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "Inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        }

        let info = negotiate_presentation(&support, policy, window_extent)?;
        if info.is_zero_area() {
            return Err(RhiError::SwapchainError(format!(
                "Surface extent {}x{} has no area",
                info.extent.width, info.extent.height
            )));
        }

        let (handle, references, info) = build(gpu.as_ref(), surface, info)?;

        Ok(Self {
            gpu,
            surface,
            handle,
            references,
            info,
            policy,
            generation: 0,
        })
    }

    /// Rebuilds the swapchain from the surface's current capabilities.
    ///
    /// Waits for the device to go idle before querying the surface, then
    /// destroys the views and the old swapchain, creates the new swapchain,
    /// re-queries its images and builds views for them. Framebuffers
    /// referencing the old views must be dropped by the caller before
    /// calling this.
    ///
    /// Returns `Ok(false)` and leaves the current swapchain untouched when the
    /// surface currently has no area (minimized window).
    pub fn recreate(&mut self, window_extent: vk::Extent2D) -> RhiResult<bool> {
        // Capabilities read while frames are still in flight can be stale.
        self.gpu.wait_idle()?;

        let support = self.gpu.surface_support(self.surface)?;
        if !support.is_adequate() {
            return Err(RhiError::SwapchainError(
                "Inadequate swapchain support (no formats or present modes)".to_string(),
            ));
        }

        let info = negotiate_presentation(&support, self.policy, window_extent)?;
        if info.is_zero_area() {
            debug!("Skipping swapchain recreation: zero-area surface");
            return Ok(false);
        }

        info!(
            "Recreating swapchain: {}x{} -> {}x{}",
            self.info.extent.width, self.info.extent.height, info.extent.width, info.extent.height
        );

        self.destroy_views();
        if self.handle != vk::SwapchainKHR::null() {
            self.gpu.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }

        let (handle, references, info) = build(self.gpu.as_ref(), self.surface, info)?;
        self.handle = handle;
        self.references = references;
        self.info = info;
        self.generation += 1;

        Ok(true)
    }

    /// Acquires the next image, signaling `semaphore` when it is ready.
    ///
    /// Waits without timeout.
    pub fn acquire(&self, semaphore: vk::Semaphore) -> RhiResult<Acquired> {
        match self
            .gpu
            .acquire_next_image(self.handle, u64::MAX, semaphore)
        {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(result) => {
                let status = PresentResult::from_error(result)?;
                warn!("Acquire reported {:?} ({:?})", status, result);
                Ok(Acquired::Unavailable(status))
            }
        }
    }

    /// Presents `image_index` after `wait_semaphores` are signaled.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> RhiResult<PresentResult> {
        match self
            .gpu
            .queue_present(queue, self.handle, image_index, wait_semaphores)
        {
            Ok(false) => Ok(PresentResult::Ok),
            Ok(true) => {
                warn!("Present reported a suboptimal swapchain");
                Ok(PresentResult::OutOfDate)
            }
            Err(result) => {
                let status = PresentResult::from_error(result)?;
                warn!("Present reported {:?} ({:?})", status, result);
                Ok(status)
            }
        }
    }

    #[inline]
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    #[inline]
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    #[inline]
    pub fn info(&self) -> &PresentationEngineInfo {
        &self.info
    }

    /// Returns the swapchain image format.
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.info.surface_format.format
    }

    /// Returns the swapchain extent (resolution).
    #[inline]
    pub fn extent(&self) -> vk::Extent2D {
        self.info.extent
    }

    #[inline]
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.info.present_mode
    }

    /// Returns the number of swapchain images.
    #[inline]
    pub fn image_count(&self) -> u32 {
        self.info.image_count
    }

    #[inline]
    pub fn references(&self) -> &SwapchainReferences {
        &self.references
    }

    /// Returns the image view for an acquired image index.
    #[inline]
    pub fn image_view(&self, image_index: u32) -> Option<vk::ImageView> {
        self.references.view(image_index)
    }

    /// Number of successful recreations since creation.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn destroy_views(&mut self) {
        for &view in &self.references.views {
            self.gpu.destroy_image_view(view);
        }
        self.references = SwapchainReferences::default();
    }
}

impl<G: Gpu> Drop for Swapchain<G> {
    fn drop(&mut self) {
        self.destroy_views();

        if self.handle != vk::SwapchainKHR::null() {
            self.gpu.destroy_swapchain(self.handle);

            info!(
                "Swapchain destroyed (was {}x{}, {} images)",
                self.info.extent.width, self.info.extent.height, self.info.image_count
            );
        }
    }
}

/// Creates the swapchain, then queries its images, then builds their views.
fn build<G: Gpu>(
    gpu: &G,
    surface: vk::SurfaceKHR,
    mut info: PresentationEngineInfo,
) -> RhiResult<(vk::SwapchainKHR, SwapchainReferences, PresentationEngineInfo)> {
    let (sharing_mode, queue_family_indices) = sharing(gpu.queue_roles());
    debug!(
        "Swapchain sharing {:?} across families {:?}",
        sharing_mode, queue_family_indices
    );

    let desc = SwapchainDesc {
        surface,
        min_image_count: info.min_image_count,
        surface_format: info.surface_format,
        extent: info.extent,
        present_mode: info.present_mode,
        pre_transform: info.pre_transform,
        sharing_mode,
        queue_family_indices,
    };

    let handle = gpu.create_swapchain(&desc, vk::SwapchainKHR::null())?;

    let images = match gpu.swapchain_images(handle) {
        Ok(images) => images,
        Err(e) => {
            gpu.destroy_swapchain(handle);
            return Err(e);
        }
    };
    info.image_count = images.len() as u32;

    let views = match create_image_views(gpu, &images, info.surface_format.format) {
        Ok(views) => views,
        Err(e) => {
            gpu.destroy_swapchain(handle);
            return Err(e);
        }
    };

    info!(
        "Swapchain created: {}x{}, format {:?}, present mode {:?}, {} images",
        info.extent.width,
        info.extent.height,
        info.surface_format.format,
        info.present_mode,
        info.image_count
    );

    Ok((handle, SwapchainReferences { images, views }, info))
}

/// Creates one view per swapchain image. Already created views are destroyed
/// if a later one fails.
fn create_image_views<G: Gpu>(
    gpu: &G,
    images: &[vk::Image],
    format: vk::Format,
) -> RhiResult<Vec<vk::ImageView>> {
    let mut views = Vec::with_capacity(images.len());

    for (i, &image) in images.iter().enumerate() {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(color_subresource_range());

        match gpu.create_image_view(&create_info) {
            Ok(view) => views.push(view),
            Err(e) => {
                for view in views {
                    gpu.destroy_image_view(view);
                }
                return Err(RhiError::SwapchainError(format!(
                    "Failed to create image view {}: {}",
                    i, e
                )));
            }
        }
    }

    debug!("Created {} image views", views.len());
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandPool, submit_command_buffer};
    use crate::mock::{MockAcquire, MockGpu, MockPresent};
    use crate::sync::Fence;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn dims(e: vk::Extent2D) -> (u32, u32) {
        (e.width, e.height)
    }

    fn support() -> SurfaceSupport {
        crate::mock::default_surface(800, 600)
    }

    #[test]
    fn test_choose_surface_format_prefers_srgb() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];

        let selected = choose_surface_format(&formats).unwrap();
        assert_eq!(selected.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(selected.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
    }

    #[test]
    fn test_choose_surface_format_falls_back_to_first() {
        let formats = vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
            },
        ];

        let selected = choose_surface_format(&formats).unwrap();
        assert_eq!(selected.format, vk::Format::R8G8B8A8_UNORM);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn test_choose_present_mode() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(&modes), Some(vk::PresentModeKHR::FIFO));

        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes),
            Some(vk::PresentModeKHR::IMMEDIATE)
        );
        assert_eq!(choose_present_mode(&[]), None);
    }

    #[test]
    fn test_choose_extent_policies() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: extent(1920, 1080),
            min_image_extent: extent(100, 100),
            max_image_extent: extent(2000, 2000),
            ..Default::default()
        };

        assert_eq!(
            dims(choose_extent(&caps, ExtentPolicy::SurfaceMinimum, extent(800, 600))),
            (100, 100)
        );
        assert_eq!(
            dims(choose_extent(&caps, ExtentPolicy::FollowWindow, extent(800, 600))),
            (1920, 1080)
        );

        caps.current_extent = extent(u32::MAX, u32::MAX);
        assert_eq!(
            dims(choose_extent(&caps, ExtentPolicy::FollowWindow, extent(3000, 50))),
            (2000, 100)
        );
        assert_eq!(
            dims(choose_extent(&caps, ExtentPolicy::FollowWindow, extent(800, 600))),
            (800, 600)
        );
    }

    #[test]
    fn test_negotiate_uses_min_image_count_and_identity() {
        let info = negotiate_presentation(&support(), ExtentPolicy::FollowWindow, extent(1, 1))
            .unwrap();
        assert_eq!(info.min_image_count, 2);
        assert_eq!(info.pre_transform, vk::SurfaceTransformFlagsKHR::IDENTITY);
        assert_eq!(info.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(dims(info.extent), (800, 600));
    }

    #[test]
    fn test_negotiate_rejects_empty_support() {
        let mut empty = support();
        empty.formats.clear();
        assert!(matches!(
            negotiate_presentation(&empty, ExtentPolicy::FollowWindow, extent(1, 1)),
            Err(RhiError::SwapchainError(_))
        ));
    }

    #[test]
    fn test_sharing_combined_family_is_exclusive() {
        let (mode, families) = sharing(QueueRoles::single(0));
        assert_eq!(mode, vk::SharingMode::EXCLUSIVE);
        assert_eq!(families, vec![0]);
    }

    #[test]
    fn test_sharing_split_families_is_concurrent() {
        let roles = QueueRoles {
            graphics: 2,
            presentation: 1,
            transfer: 0,
        };
        let (mode, mut families) = sharing(roles);
        families.sort_unstable();
        assert_eq!(mode, vk::SharingMode::CONCURRENT);
        assert_eq!(families, vec![1, 2]);
    }

    #[test]
    fn test_present_result_mapping() {
        assert_eq!(
            PresentResult::from_error(vk::Result::ERROR_OUT_OF_DATE_KHR).unwrap(),
            PresentResult::OutOfDate
        );
        assert_eq!(
            PresentResult::from_error(vk::Result::ERROR_DEVICE_LOST).unwrap(),
            PresentResult::Lost
        );
        assert_eq!(
            PresentResult::from_error(vk::Result::ERROR_SURFACE_LOST_KHR).unwrap(),
            PresentResult::Lost
        );
        assert!(PresentResult::from_error(vk::Result::ERROR_OUT_OF_HOST_MEMORY).is_err());
    }

    #[test]
    fn test_swapchain_creates_one_view_per_image() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let swapchain = Swapchain::new(
            gpu.clone(),
            vk::SurfaceKHR::null(),
            ExtentPolicy::FollowWindow,
            extent(800, 600),
        )
        .unwrap();

        assert_eq!(swapchain.image_count(), 2);
        assert_eq!(swapchain.references().views().len(), 2);
        for (i, &image) in swapchain.references().images().iter().enumerate() {
            let view = swapchain.image_view(i as u32).unwrap();
            assert_eq!(gpu.view_image(view), Some(image));
        }

        let history = gpu.swapchain_history();
        assert_eq!(history[0].sharing_mode, vk::SharingMode::EXCLUSIVE);
        assert_eq!(history[0].queue_family_indices, vec![0]);

        drop(swapchain);
        assert_eq!(gpu.live_objects(), 0);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn test_recreate_follows_surface_and_bumps_generation() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let mut swapchain = Swapchain::new(
            gpu.clone(),
            vk::SurfaceKHR::null(),
            ExtentPolicy::FollowWindow,
            extent(800, 600),
        )
        .unwrap();
        let old_views = swapchain.references().views().to_vec();

        gpu.set_surface_extent(1024, 768);
        assert!(swapchain.recreate(extent(1024, 768)).unwrap());

        assert_eq!(dims(swapchain.extent()), (1024, 768));
        assert_eq!(swapchain.generation(), 1);
        assert_eq!(gpu.wait_idle_calls(), 1);
        for view in old_views {
            assert_eq!(gpu.view_image(view), None);
        }
        assert_eq!(gpu.swapchain_history().len(), 2);
    }

    #[test]
    fn test_recreate_skips_zero_area() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let mut swapchain = Swapchain::new(
            gpu.clone(),
            vk::SurfaceKHR::null(),
            ExtentPolicy::FollowWindow,
            extent(800, 600),
        )
        .unwrap();

        gpu.set_surface_extent(0, 0);
        assert!(!swapchain.recreate(extent(0, 0)).unwrap());
        assert_eq!(swapchain.generation(), 0);
        assert_eq!(dims(swapchain.extent()), (800, 600));
    }

    #[test]
    fn test_recreate_drains_in_flight_work_before_surface_query() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let mut swapchain = Swapchain::new(
            gpu.clone(),
            vk::SurfaceKHR::null(),
            ExtentPolicy::FollowWindow,
            extent(800, 600),
        )
        .unwrap();

        // Leave one submission in flight.
        let pool = CommandPool::new(gpu.clone(), 0).unwrap();
        let cb = pool.allocate_command_buffer().unwrap();
        let fence = Fence::new(gpu.clone(), false).unwrap();
        cb.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT).unwrap();
        submit_command_buffer(
            gpu.as_ref(),
            gpu.graphics_queue(),
            cb.handle(),
            &[],
            &[],
            &[],
            fence.handle(),
        )
        .unwrap();
        assert!(!gpu.fence_signaled(fence.handle()).unwrap());

        gpu.set_surface_extent(640, 480);
        assert!(swapchain.recreate(extent(640, 480)).unwrap());

        let backlog = gpu.surface_query_backlog();
        assert_eq!(backlog.last(), Some(&0));
        assert!(gpu.fence_signaled(fence.handle()).unwrap());

        // A minimized surface still drains the queue before deferring.
        gpu.set_surface_extent(0, 0);
        assert!(!swapchain.recreate(extent(0, 0)).unwrap());
        assert_eq!(gpu.wait_idle_calls(), 2);
        assert!(gpu.violations().is_empty());
    }

    #[test]
    fn test_acquire_and_present_report_status() {
        let gpu = Arc::new(MockGpu::new(QueueRoles::single(0)));
        let swapchain = Swapchain::new(
            gpu.clone(),
            vk::SurfaceKHR::null(),
            ExtentPolicy::FollowWindow,
            extent(800, 600),
        )
        .unwrap();
        let semaphore = gpu.create_semaphore().unwrap();

        gpu.script_acquire([
            MockAcquire::Suboptimal(1),
            MockAcquire::Error(vk::Result::ERROR_OUT_OF_DATE_KHR),
        ]);
        assert_eq!(
            swapchain.acquire(semaphore).unwrap(),
            Acquired::Image {
                index: 1,
                suboptimal: true
            }
        );
        assert_eq!(
            swapchain.acquire(semaphore).unwrap(),
            Acquired::Unavailable(PresentResult::OutOfDate)
        );

        gpu.script_present([
            MockPresent::Suboptimal,
            MockPresent::Error(vk::Result::ERROR_DEVICE_LOST),
        ]);
        let queue = gpu.present_queue();
        assert_eq!(
            swapchain.present(queue, 1, &[semaphore]).unwrap(),
            PresentResult::OutOfDate
        );
        assert_eq!(
            swapchain.present(queue, 1, &[]).unwrap(),
            PresentResult::Lost
        );
    }
}
