//! RHI-specific error types.

use ash::vk;
use thiserror::Error;

/// RHI-specific error type.
#[derive(Error, Debug)]
pub enum RhiError {
    /// Vulkan API error
    #[error("Vulkan error: {0}")]
    VulkanError(#[from] vk::Result),

    /// Failed to load Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    LoadingError(#[from] ash::LoadingError),

    /// A configured instance layer is not installed
    #[error("Required layer not available: {0}")]
    MissingLayer(String),

    /// A configured instance or device extension is not available
    #[error("Required extension not available: {0}")]
    MissingExtension(String),

    /// No physical device scored above the rejection threshold
    #[error("No suitable GPU found")]
    NoSuitableGpu,

    /// No memory type satisfies both the resource's type mask and the wanted flags
    #[error("No memory type matches type bits {type_bits:#b} with flags {flags:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    },

    /// Device memory allocation or binding failed
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// A staging upload could not be recorded or submitted
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// Shader blob error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Swapchain error
    #[error("Swapchain error: {0}")]
    SwapchainError(String),

    /// The device or surface was lost and could not be recovered
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),
}

/// Failure classes; every class is fatal to the caller except where the
/// frame loop explicitly recovers from a stale swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing layer, extension or usable device.
    SetupFailure,
    /// Allocation, memory type lookup or bind failure.
    ResourceFailure,
    /// Copy or barrier submission failure.
    TransferFailure,
    /// Out-of-date swapchain or lost device/surface.
    DeviceLossOrSwapchainStale,
}

impl RhiError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LoadingError(_)
            | Self::MissingLayer(_)
            | Self::MissingExtension(_)
            | Self::NoSuitableGpu
            | Self::ShaderError(_)
            | Self::PipelineError(_) => ErrorKind::SetupFailure,
            Self::NoCompatibleMemoryType { .. }
            | Self::AllocationFailed(_)
            | Self::InvalidHandle(_) => ErrorKind::ResourceFailure,
            Self::TransferFailed(_) => ErrorKind::TransferFailure,
            Self::SwapchainError(_) | Self::DeviceLost(_) => ErrorKind::DeviceLossOrSwapchainStale,
            Self::VulkanError(result) => match *result {
                vk::Result::ERROR_OUT_OF_DATE_KHR
                | vk::Result::ERROR_DEVICE_LOST
                | vk::Result::ERROR_SURFACE_LOST_KHR => ErrorKind::DeviceLossOrSwapchainStale,
                vk::Result::ERROR_OUT_OF_HOST_MEMORY
                | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                | vk::Result::ERROR_TOO_MANY_OBJECTS => ErrorKind::ResourceFailure,
                _ => ErrorKind::SetupFailure,
            },
        }
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;

impl From<RhiError> for presenter_core::Error {
    fn from(err: RhiError) -> Self {
        use presenter_core::Error;

        if let RhiError::ShaderError(message) = err {
            return Error::Shader(message);
        }
        let message = err.to_string();
        match err.kind() {
            ErrorKind::SetupFailure => Error::Setup(message),
            ErrorKind::ResourceFailure => Error::Resource(message),
            ErrorKind::TransferFailure => Error::Transfer(message),
            ErrorKind::DeviceLossOrSwapchainStale => Error::PresentationLost(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(RhiError::NoSuitableGpu.kind(), ErrorKind::SetupFailure);
        assert_eq!(
            RhiError::NoCompatibleMemoryType {
                type_bits: 0b10,
                flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            }
            .kind(),
            ErrorKind::ResourceFailure
        );
        assert_eq!(
            RhiError::TransferFailed("copy".into()).kind(),
            ErrorKind::TransferFailure
        );
        assert_eq!(
            RhiError::from(vk::Result::ERROR_DEVICE_LOST).kind(),
            ErrorKind::DeviceLossOrSwapchainStale
        );
        assert_eq!(
            RhiError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).kind(),
            ErrorKind::ResourceFailure
        );
    }

    #[test]
    fn test_conversion_to_application_error() {
        let shader: presenter_core::Error = RhiError::ShaderError("bad magic".into()).into();
        assert!(matches!(shader, presenter_core::Error::Shader(m) if m == "bad magic"));

        let lost: presenter_core::Error = RhiError::DeviceLost("gone".into()).into();
        assert!(lost.is_presentation_lost());
        assert!(lost.to_string().contains("gone"));

        let surface: presenter_core::Error =
            RhiError::from(vk::Result::ERROR_SURFACE_LOST_KHR).into();
        assert!(surface.is_presentation_lost());

        let gpu: presenter_core::Error = RhiError::NoSuitableGpu.into();
        assert!(matches!(gpu, presenter_core::Error::Setup(_)));

        let memory: presenter_core::Error = RhiError::NoCompatibleMemoryType {
            type_bits: 0b1,
            flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
        }
        .into();
        assert!(matches!(memory, presenter_core::Error::Resource(_)));

        let upload: presenter_core::Error = RhiError::TransferFailed("copy".into()).into();
        assert!(matches!(upload, presenter_core::Error::Transfer(m) if m.contains("copy")));
    }

    #[test]
    fn test_memory_type_message() {
        let err = RhiError::NoCompatibleMemoryType {
            type_bits: 0b101,
            flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
        };
        assert!(err.to_string().contains("0b101"));
    }
}
