//! Error types for Peephole

use thiserror::Error;

/// Result type alias using PeepholeError
pub type Result<T> = std::result::Result<T, PeepholeError>;

/// Main error type for Peephole operations
#[derive(Debug, Error)]
pub enum PeepholeError {
    /// The capture process could not be launched
    #[error("Failed to spawn capture process: {0}")]
    Spawn(String),

    /// A hot swap was abandoned; the previous device keeps streaming
    #[error("Device switch aborted: {0}")]
    SwapAborted(String),

    /// Another device switch has not finished yet
    #[error("A device switch is already in progress")]
    SwitchInProgress,

    /// The pipeline supervisor task has exited
    #[error("Pipeline supervisor is not running")]
    SupervisorGone,

    /// Still capture requested before the pipeline produced a frame
    #[error("No frame captured yet")]
    NoFrame,

    /// Device enumeration failed
    #[error("Device listing failed: {0}")]
    DeviceList(String),

    /// Device identifier without a usable index
    #[error("Invalid device identifier: {0}")]
    InvalidDevice(String),

    /// No tethered camera answered
    #[error("No camera detected: {0}")]
    NoCamera(String),

    /// Tethered still capture failed
    #[error("Still capture failed: {0}")]
    Capture(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PeepholeError>,
    },
}

impl PeepholeError {
    /// Create a spawn error
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    /// Create a swap-aborted error
    pub fn swap_aborted(msg: impl Into<String>) -> Self {
        Self::SwapAborted(msg.into())
    }

    /// Create a device listing error
    pub fn device_list(msg: impl Into<String>) -> Self {
        Self::DeviceList(msg.into())
    }

    /// Create a still capture error
    pub fn capture(msg: impl Into<String>) -> Self {
        Self::Capture(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context wrappers
    pub fn root(&self) -> &PeepholeError {
        match self {
            Self::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Short hint for the operator, if there is something they can do
    pub fn user_hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::Spawn(_) | Self::DeviceList(_) => {
                Some("Check that ffmpeg is installed and on PATH ([capture] binary in config.toml)")
            }
            Self::InvalidDevice(_) => {
                Some("Device identifiers look like \"0:none\"; run `peephole devices` to list them")
            }
            Self::NoCamera(_) | Self::Capture(_) => {
                Some("Check that gphoto2 is installed and the camera is connected over USB")
            }
            Self::Config(_) => Some("Check config.toml and the PORT/PREVIEW_* environment variables"),
            Self::SwapAborted(_) => Some("The previous device is still streaming; try another device"),
            Self::SwitchInProgress => Some("Wait for the current device switch to finish"),
            _ => None,
        }
    }

    /// Whether the operator can fix this without a code change
    pub fn is_user_recoverable(&self) -> bool {
        matches!(
            self.root(),
            Self::Spawn(_)
                | Self::SwapAborted(_)
                | Self::SwitchInProgress
                | Self::NoFrame
                | Self::DeviceList(_)
                | Self::InvalidDevice(_)
                | Self::NoCamera(_)
                | Self::Config(_)
        )
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }
}
