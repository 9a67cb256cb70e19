//! Errors surfaced to the application.
//!
//! The RHI layer classifies its own failures; at this boundary they are
//! folded into the stage of presenter bring-up or the frame loop that
//! failed, so the caller can report a single readable cause.

use thiserror::Error;

/// Application-level error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected configuration, caught before any Vulkan object exists
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Windowing system failures
    #[error("Window error: {0}")]
    Window(String),

    /// Surface extension lookup or surface creation failed
    #[error("Surface error: {0}")]
    Surface(String),

    /// Unreadable or malformed SPIR-V
    #[error("Shader error: {0}")]
    Shader(String),

    /// Instance, device, swapchain or pipeline bring-up failed
    #[error("GPU setup failed: {0}")]
    Setup(String),

    /// Allocation or binding of a GPU resource failed
    #[error("GPU resource failure: {0}")]
    Resource(String),

    /// A staging upload failed
    #[error("Upload failed: {0}")]
    Transfer(String),

    /// The device or surface is gone and presentation cannot continue
    #[error("Presentation lost: {0}")]
    PresentationLost(String),
}

impl Error {
    /// True when the device or surface was lost rather than misconfigured.
    pub fn is_presentation_lost(&self) -> bool {
        matches!(self, Error::PresentationLost(_))
    }
}

/// Result type alias using the shared Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_failing_stage() {
        assert_eq!(
            Error::Config("frames_in_flight is 0".into()).to_string(),
            "Invalid configuration: frames_in_flight is 0"
        );
        assert_eq!(
            Error::Surface("no display".into()).to_string(),
            "Surface error: no display"
        );
        assert_eq!(
            Error::PresentationLost("device lost".into()).to_string(),
            "Presentation lost: device lost"
        );
    }

    #[test]
    fn test_only_lost_presentation_is_flagged() {
        assert!(Error::PresentationLost("surface".into()).is_presentation_lost());
        assert!(!Error::Setup("no gpu".into()).is_presentation_lost());
        assert!(!Error::Transfer("copy".into()).is_presentation_lost());
    }
}
