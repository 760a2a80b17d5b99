//! Configuration for Peephole
//!
//! Settings come from three layers, later ones winning: the TOML config
//! file, environment variables, then command line flags (applied by the
//! CLI directly on [`PeepholeConfig`]).

mod file;

pub use file::{
    CaptureSettings, ConfigFile, PipelineSettings, PreviewSettings, ServerSettings,
    sample_config,
};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::capture::CaptureSpec;
use crate::error::{PeepholeError, Result};
use crate::types::DeviceId;

/// Environment variable overriding the listen port
pub const ENV_PORT: &str = "PORT";
/// Environment variable overriding the initial device
pub const ENV_DEVICE: &str = "AVFOUNDATION_DEVICE";
/// Environment variable overriding the capture width
pub const ENV_WIDTH: &str = "PREVIEW_WIDTH";
/// Environment variable overriding the capture height
pub const ENV_HEIGHT: &str = "PREVIEW_HEIGHT";
/// Environment variable overriding the capture framerate
pub const ENV_FPS: &str = "PREVIEW_FPS";
/// Environment variable overriding the capture directory
pub const ENV_DATA_DIR: &str = "PEEPHOLE_DATA_DIR";

/// Supervisor timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTimings {
    /// Watchdog check period
    pub watchdog_interval: Duration,
    /// Time without frames that counts as a stall
    pub stall_threshold: Duration,
    /// Dead client pruning period
    pub janitor_interval: Duration,
    /// Per-client keep-alive period
    pub keepalive_interval: Duration,
    /// Overlap between old and new device during a hot swap
    pub swap_grace: Duration,
    /// Deadline for a new device's first frame
    pub swap_timeout: Duration,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        PipelineSettings::default().into()
    }
}

impl From<PipelineSettings> for PipelineTimings {
    fn from(settings: PipelineSettings) -> Self {
        Self {
            watchdog_interval: Duration::from_millis(settings.watchdog_interval_ms),
            stall_threshold: Duration::from_millis(settings.stall_threshold_ms),
            janitor_interval: Duration::from_millis(settings.janitor_interval_ms),
            keepalive_interval: Duration::from_millis(settings.keepalive_interval_ms),
            swap_grace: Duration::from_millis(settings.swap_grace_ms),
            swap_timeout: Duration::from_millis(settings.swap_timeout_ms),
        }
    }
}

/// Fully resolved runtime configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PeepholeConfig {
    /// HTTP server settings
    pub server: ServerSettings,
    /// Initial device and capture format
    pub preview: PreviewSettings,
    /// Capture binary settings
    pub capture: CaptureSettings,
    /// Supervisor timers
    pub timings: PipelineTimings,
}

impl Default for PeepholeConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default())
    }
}

impl From<ConfigFile> for PeepholeConfig {
    fn from(file: ConfigFile) -> Self {
        Self::from_file(file)
    }
}

impl PeepholeConfig {
    /// Build from a parsed config file
    pub fn from_file(file: ConfigFile) -> Self {
        Self {
            server: file.server,
            preview: file.preview,
            capture: file.capture,
            timings: file.pipeline.into(),
        }
    }

    /// Load the config file (default path if `path` is `None`) and apply
    /// environment overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let file = match path {
            Some(path) => ConfigFile::load_from(path)?,
            None => ConfigFile::load()?,
        };
        let mut config = Self::from_file(file);
        config.apply_env()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(port) = get(ENV_PORT) {
            self.server.port = parse_var(ENV_PORT, &port)?;
        }
        if let Some(dir) = get(ENV_DATA_DIR) {
            self.server.data_dir = PathBuf::from(dir);
        }
        if let Some(device) = get(ENV_DEVICE) {
            self.preview.device = device
                .parse::<DeviceId>()
                .map_err(|e| PeepholeError::config(format!("Invalid {}: {}", ENV_DEVICE, e)))?;
        }
        if let Some(width) = get(ENV_WIDTH) {
            self.preview.width = parse_var(ENV_WIDTH, &width)?;
        }
        if let Some(height) = get(ENV_HEIGHT) {
            self.preview.height = parse_var(ENV_HEIGHT, &height)?;
        }
        if let Some(fps) = get(ENV_FPS) {
            self.preview.fps = parse_var(ENV_FPS, &fps)?;
        }
        Ok(())
    }

    /// Validate configuration and return warnings (non-fatal issues)
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.preview.fps > 60 {
            warnings.push(format!(
                "{}fps is above what most webcams deliver; ffmpeg may refuse the format",
                self.preview.fps
            ));
        }
        if self.timings.stall_threshold <= self.timings.watchdog_interval {
            warnings.push(
                "stall_threshold_ms should be larger than watchdog_interval_ms, \
                 or every check may restart the pipeline"
                    .to_string(),
            );
        }
        if self.timings.swap_timeout < self.timings.stall_threshold {
            warnings.push(
                "swap_timeout_ms is shorter than stall_threshold_ms; slow cameras may never switch"
                    .to_string(),
            );
        }
        if self.preview.device.index().is_none() {
            warnings.push(format!(
                "Device '{}' has no numeric index; the pipeline will fail to start",
                self.preview.device
            ));
        }

        warnings
    }

    /// Validate configuration, returning an error for invalid settings
    pub fn validate_strict(&self) -> Result<()> {
        if self.preview.width == 0 || self.preview.height == 0 {
            return Err(PeepholeError::config(format!(
                "Invalid resolution {}x{}",
                self.preview.width, self.preview.height
            )));
        }
        if self.preview.fps == 0 {
            return Err(PeepholeError::config("fps must be greater than zero"));
        }
        if !(2..=31).contains(&self.capture.quality) {
            return Err(PeepholeError::config(format!(
                "MJPEG quality must be between 2 and 31, got {}",
                self.capture.quality
            )));
        }
        if self.capture.binary.trim().is_empty() {
            return Err(PeepholeError::config("capture binary must not be empty"));
        }

        let timers = [
            ("watchdog_interval_ms", self.timings.watchdog_interval),
            ("stall_threshold_ms", self.timings.stall_threshold),
            ("janitor_interval_ms", self.timings.janitor_interval),
            ("keepalive_interval_ms", self.timings.keepalive_interval),
            ("swap_timeout_ms", self.timings.swap_timeout),
        ];
        for (name, value) in timers {
            if value.is_zero() {
                return Err(PeepholeError::config(format!("{} must be greater than zero", name)));
            }
        }

        Ok(())
    }

    /// Capture request for the initial device
    pub fn capture_spec(&self) -> CaptureSpec {
        CaptureSpec {
            device: self.preview.device.clone(),
            width: self.preview.width,
            height: self.preview.height,
            fps: self.preview.fps,
        }
    }

    /// Address the HTTP server binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.server.port))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| PeepholeError::config(format!("Invalid {} '{}': {}", key, value, e)))
}
