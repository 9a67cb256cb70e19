//! Vulkan instance management.
//!
//! This module handles VkInstance creation, layer and extension validation,
//! and the debug messenger that routes validation output into `tracing`.
//!
//! # Example
//!
//! ```no_run
//! use presenter_core::RendererConfig;
//! use presenter_rhi::instance::Instance;
//!
//! # fn example() -> presenter_rhi::RhiResult<()> {
//! let config = RendererConfig::default();
//! // Surface extensions normally come from the windowing layer.
//! let instance = Instance::new(&config, &[ash::khr::surface::NAME])?;
//! let vk_instance = instance.handle();
//! # Ok(())
//! # }
//! ```

use std::ffi::{CStr, c_char};

use ash::{Entry, vk};
use presenter_core::RendererConfig;
use tracing::{debug, error, info, warn};

use crate::error::{RhiError, RhiResult};

/// Vulkan instance wrapper.
///
/// Owns the entry loader, the instance, the surface extension loader and the
/// optional debug messenger. Dropping it destroys the messenger and then the
/// instance, so every surface and device created from it must be gone first.
pub struct Instance {
    /// Vulkan entry point loader
    entry: Entry,
    /// Vulkan instance handle
    instance: ash::Instance,
    /// `VK_KHR_surface` loader shared by device probing and presentation
    surface_loader: ash::khr::surface::Instance,
    /// Debug utils extension loader (only present when validation is enabled)
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    /// Debug messenger handle (only present when validation is enabled)
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl Instance {
    /// Creates a new Vulkan instance.
    ///
    /// # Arguments
    ///
    /// * `config` - Supplies the validation layers and extra instance extensions
    /// * `surface_extensions` - Platform surface extensions from the windowing layer
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Vulkan library cannot be loaded
    /// - A configured layer is not installed ([`RhiError::MissingLayer`])
    /// - A required extension is not available ([`RhiError::MissingExtension`])
    /// - Instance creation or debug messenger setup fails
    pub fn new(config: &RendererConfig, surface_extensions: &[&CStr]) -> RhiResult<Self> {
        let entry = unsafe { Entry::load()? };

        let available_layers = unsafe { entry.enumerate_instance_layer_properties()? };
        let layer_names: Vec<&CStr> = available_layers
            .iter()
            .filter_map(|layer| layer.layer_name_as_c_str().ok())
            .collect();
        if let Some(missing) = first_missing(&layer_names, config.validation_layers()) {
            return Err(RhiError::MissingLayer(missing.to_string_lossy().into_owned()));
        }

        let mut extensions: Vec<&CStr> = surface_extensions.to_vec();
        for ext in config.instance_extensions() {
            if !extensions.contains(ext) {
                extensions.push(ext);
            }
        }

        let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None)? };
        let extension_names: Vec<&CStr> = available_extensions
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .collect();
        if let Some(missing) = first_missing(&extension_names, &extensions) {
            return Err(RhiError::MissingExtension(
                missing.to_string_lossy().into_owned(),
            ));
        }

        let app_name = c"Presenter";
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"No Engine")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_1);

        let extension_ptrs: Vec<*const c_char> = extensions.iter().map(|e| e.as_ptr()).collect();
        let layer_ptrs: Vec<*const c_char> = config
            .validation_layers()
            .iter()
            .map(|l| l.as_ptr())
            .collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .map_err(RhiError::from)?
        };

        info!(
            "Vulkan instance created ({} extensions, {} layers)",
            extension_ptrs.len(),
            layer_ptrs.len()
        );
        debug!("Instance extensions: {:?}", extensions);

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let wants_messenger = config.validation_enabled()
            && extensions.contains(&ash::ext::debug_utils::NAME);
        let (debug_utils, debug_messenger) = if wants_messenger {
            let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger = Self::setup_debug_messenger(&debug_utils)?;
            info!("Validation layers enabled with debug messenger");
            (Some(debug_utils), Some(messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            instance,
            surface_loader,
            debug_utils,
            debug_messenger,
        })
    }

    /// Returns the Vulkan instance handle.
    #[inline]
    pub fn handle(&self) -> &ash::Instance {
        &self.instance
    }

    /// Returns the Vulkan entry point loader.
    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Returns the `VK_KHR_surface` loader.
    #[inline]
    pub fn surface_loader(&self) -> &ash::khr::surface::Instance {
        &self.surface_loader
    }

    /// Returns whether the debug messenger is installed.
    #[inline]
    pub fn has_validation(&self) -> bool {
        self.debug_messenger.is_some()
    }

    /// Sets up the debug messenger for validation layer callbacks.
    fn setup_debug_messenger(
        debug_utils: &ash::ext::debug_utils::Instance,
    ) -> RhiResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(RhiError::from)?
        };

        Ok(messenger)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            // Destroy debug messenger before instance
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
        info!("Vulkan instance destroyed");
    }
}

/// Returns the first name in `required` that is not in `available`.
fn first_missing<'a>(available: &[&CStr], required: &[&'a CStr]) -> Option<&'a CStr> {
    required
        .iter()
        .copied()
        .find(|wanted| !available.contains(wanted))
}

/// Debug callback function for validation layer messages.
///
/// This function is called by the Vulkan validation layer when it detects
/// issues with API usage. Messages are logged using the tracing crate.
///
/// # Safety
///
/// This function is called from the Vulkan driver and must follow the
/// Vulkan specification for debug callbacks.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }

    let callback_data = unsafe { &*p_callback_data };
    let message = if callback_data.p_message.is_null() {
        std::borrow::Cow::Borrowed("(no message)")
    } else {
        unsafe { CStr::from_ptr(callback_data.p_message).to_string_lossy() }
    };

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "General",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "Validation",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "Performance",
        _ => "Unknown",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            error!("[Vulkan {}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            warn!("[Vulkan {}] {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            info!("[Vulkan {}] {}", type_str, message);
        }
        _ => {
            debug!("[Vulkan {} Verbose] {}", type_str, message);
        }
    }

    // Returning VK_FALSE indicates the call should not be aborted
    vk::FALSE
}
