//! Physical device (GPU) probing and selection.
//!
//! # Overview
//!
//! Selection runs in four steps:
//! 1. Enumerate every physical device and drop those missing a required
//!    device extension (at minimum `VK_KHR_swapchain`)
//! 2. Probe each survivor into a [`PhysicalDeviceInfo`] snapshot
//! 3. Derive its queue roles with an ascending scan over queue families
//! 4. Score the snapshots and keep the first highest-scoring one
//!
//! Steps 3 and 4 are plain functions over the snapshot so they can be
//! tested without a Vulkan driver.
//!
//! # Example
//!
//! ```no_run
//! use presenter_rhi::instance::Instance;
//! use presenter_rhi::physical_device::select_physical_device;
//! use presenter_core::RendererConfig;
//! use ash::vk;
//!
//! # fn example(instance: &Instance, surface: vk::SurfaceKHR) -> presenter_rhi::RhiResult<()> {
//! let config = RendererConfig::default();
//! let info = select_physical_device(instance, surface, config.device_extensions())?;
//! println!("Selected GPU: {}", info.device_name());
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::ffi::CStr;

use ash::vk;
use tracing::{debug, info, warn};

use crate::error::{RhiError, RhiResult};
use crate::instance::Instance;

/// Queue family indices discovered for each role.
///
/// A single family may fill several roles. `None` means no family offering
/// the role has been found yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    /// Family that supports graphics operations.
    pub graphics: Option<u32>,
    /// Family that can present to the surface.
    pub presentation: Option<u32>,
    /// Family that supports transfer operations.
    pub transfer: Option<u32>,
}

impl QueueFamilyInfo {
    /// A device is only usable with both a graphics and a presentation family.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.presentation.is_some()
    }

    /// Resolves the roles into concrete indices, falling back to the
    /// graphics family for transfers.
    pub fn roles(&self) -> Option<QueueRoles> {
        let graphics = self.graphics?;
        let presentation = self.presentation?;
        Some(QueueRoles {
            graphics,
            presentation,
            transfer: self.transfer.unwrap_or(graphics),
        })
    }
}

/// Queue family indices of a usable device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueRoles {
    pub graphics: u32,
    pub presentation: u32,
    pub transfer: u32,
}

impl QueueRoles {
    /// All roles served by one family.
    pub const fn single(family: u32) -> Self {
        Self {
            graphics: family,
            presentation: family,
            transfer: family,
        }
    }

    /// Distinct family indices in ascending order, one entry per family that
    /// needs a queue.
    pub fn unique_families(&self) -> Vec<u32> {
        [self.graphics, self.presentation, self.transfer]
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Returns true when uploads must move ownership from the transfer family
    /// to the graphics family.
    #[inline]
    pub fn dedicated_transfer(&self) -> bool {
        self.transfer != self.graphics
    }
}

/// Capability snapshot of one candidate device.
///
/// Immutable once selected; every later setup phase reads from it.
#[derive(Clone, Default)]
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle.
    pub device: vk::PhysicalDevice,
    /// Device properties (name, type, limits).
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported device features; enabled wholesale on the logical device.
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and the memory-type table.
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Surface capabilities at probe time.
    pub surface_capabilities: vk::SurfaceCapabilitiesKHR,
    /// Surface formats in driver order.
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    /// Present modes in driver order.
    pub present_modes: Vec<vk::PresentModeKHR>,
    /// Raw queue family properties.
    pub queue_family_properties: Vec<vk::QueueFamilyProperties>,
    /// Roles derived from `queue_family_properties`.
    pub queue_families: QueueFamilyInfo,
}

impl PhysicalDeviceInfo {
    /// Returns the device name as a string.
    pub fn device_name(&self) -> &str {
        self.properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("Unknown Device")
    }

    /// Returns a human-readable string for the device type.
    pub fn device_type_name(&self) -> &'static str {
        match self.properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => "Discrete GPU",
            vk::PhysicalDeviceType::INTEGRATED_GPU => "Integrated GPU",
            vk::PhysicalDeviceType::VIRTUAL_GPU => "Virtual GPU",
            vk::PhysicalDeviceType::CPU => "CPU",
            _ => "Other",
        }
    }

    /// Returns true if tessellation shaders may be enabled on this device.
    #[inline]
    pub fn supports_tessellation(&self) -> bool {
        self.features.tessellation_shader == vk::TRUE
    }
}

impl std::fmt::Debug for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalDeviceInfo")
            .field("name", &self.device_name())
            .field("type", &self.device_type_name())
            .field("queue_families", &self.queue_families)
            .field("formats", &self.surface_formats.len())
            .field("present_modes", &self.present_modes)
            .finish()
    }
}

/// Derives queue roles from a device's queue families.
///
/// Families are scanned in ascending index order and every qualifying family
/// overwrites the previous choice, so the highest-indexed match wins for each
/// role. Families exposing no queues are skipped. Without a transfer-capable
/// family the graphics family takes the transfer role.
///
/// `supports_present` answers whether family `i` can present to the surface.
pub fn derive_queue_roles<F>(
    families: &[vk::QueueFamilyProperties],
    mut supports_present: F,
) -> RhiResult<QueueFamilyInfo>
where
    F: FnMut(u32) -> RhiResult<bool>,
{
    let mut info = QueueFamilyInfo::default();

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if family.queue_count == 0 {
            continue;
        }
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            info.graphics = Some(i);
        }
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER) {
            info.transfer = Some(i);
        }
        if supports_present(i)? {
            info.presentation = Some(i);
        }
    }

    if info.transfer.is_none() {
        info.transfer = info.graphics;
    }

    Ok(info)
}

/// Scores a candidate: -1 rejects it, otherwise 10 for a discrete GPU and
/// 5 for anything else.
pub fn score(info: &PhysicalDeviceInfo) -> i32 {
    if !info.queue_families.is_complete() {
        return -1;
    }
    match info.properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 10,
        _ => 5,
    }
}

/// Picks the highest-scoring candidate; ties keep the first one seen.
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] when no candidate scores above zero.
pub fn select_best<I>(candidates: I) -> RhiResult<PhysicalDeviceInfo>
where
    I: IntoIterator<Item = PhysicalDeviceInfo>,
{
    let mut best: Option<(PhysicalDeviceInfo, i32)> = None;

    for candidate in candidates {
        let candidate_score = score(&candidate);
        debug!(
            "GPU '{}' ({}) - Score: {}",
            candidate.device_name(),
            candidate.device_type_name(),
            candidate_score
        );
        let best_score = best.as_ref().map_or(0, |(_, s)| *s);
        if candidate_score > best_score {
            best = Some((candidate, candidate_score));
        }
    }

    best.map(|(info, _)| info).ok_or(RhiError::NoSuitableGpu)
}

/// Returns the first required extension missing from `available`.
pub fn missing_extension<'a>(
    available: &[vk::ExtensionProperties],
    required: &[&'a CStr],
) -> Option<&'a CStr> {
    required.iter().copied().find(|wanted| {
        !available
            .iter()
            .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == *wanted))
    })
}

/// Reads the full capability snapshot of one device.
///
/// # Errors
///
/// Returns an error if any surface or queue query fails.
pub fn probe(
    instance: &Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> RhiResult<PhysicalDeviceInfo> {
    let raw = instance.handle();
    let surface_loader = instance.surface_loader();

    let (properties, features, memory_properties, queue_family_properties) = unsafe {
        (
            raw.get_physical_device_properties(device),
            raw.get_physical_device_features(device),
            raw.get_physical_device_memory_properties(device),
            raw.get_physical_device_queue_family_properties(device),
        )
    };

    let (surface_capabilities, surface_formats, present_modes) = unsafe {
        (
            surface_loader.get_physical_device_surface_capabilities(device, surface)?,
            surface_loader.get_physical_device_surface_formats(device, surface)?,
            surface_loader.get_physical_device_surface_present_modes(device, surface)?,
        )
    };

    let queue_families = derive_queue_roles(&queue_family_properties, |i| unsafe {
        surface_loader
            .get_physical_device_surface_support(device, i, surface)
            .map_err(RhiError::from)
    })?;

    Ok(PhysicalDeviceInfo {
        device,
        properties,
        features,
        memory_properties,
        surface_capabilities,
        surface_formats,
        present_modes,
        queue_family_properties,
        queue_families,
    })
}

/// Selects the most suitable physical device for presenting to `surface`.
///
/// # Arguments
///
/// * `instance` - The Vulkan instance
/// * `surface` - The window surface used for presentation support checks
/// * `required_extensions` - Device extensions every candidate must expose
///
/// # Errors
///
/// Returns [`RhiError::NoSuitableGpu`] if no candidate is usable.
pub fn select_physical_device(
    instance: &Instance,
    surface: vk::SurfaceKHR,
    required_extensions: &[&CStr],
) -> RhiResult<PhysicalDeviceInfo> {
    let devices = unsafe { instance.handle().enumerate_physical_devices()? };
    if devices.is_empty() {
        warn!("No Vulkan-capable GPUs found");
        return Err(RhiError::NoSuitableGpu);
    }
    info!("Found {} GPU(s)", devices.len());

    let mut candidates = Vec::with_capacity(devices.len());
    for device in devices {
        let available = unsafe {
            instance
                .handle()
                .enumerate_device_extension_properties(device)?
        };
        if let Some(missing) = missing_extension(&available, required_extensions) {
            debug!("GPU {:?} skipped: missing extension {:?}", device, missing);
            continue;
        }
        candidates.push(probe(instance, device, surface)?);
    }

    let selected = select_best(candidates)?;
    info!(
        "Selected GPU: '{}' ({}), queue families {:?}, max tessellation level {}",
        selected.device_name(),
        selected.device_type_name(),
        selected.queue_families,
        selected.properties.limits.max_tessellation_generation_level
    );
    Ok(selected)
}
