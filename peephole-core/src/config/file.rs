//! Configuration file loading
//!
//! Loads user configuration from `~/.config/peephole/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::error::{PeepholeError, Result};
use crate::types::DeviceId;

/// Configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Initial preview device and format
    #[serde(default)]
    pub preview: PreviewSettings,

    /// Capture binary settings
    #[serde(default)]
    pub capture: CaptureSettings,

    /// Supervisor timers
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory for still captures, served under /files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Initial preview configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSettings {
    /// Capture device, e.g. "0:none"
    #[serde(default)]
    pub device: DeviceId,

    /// Frame width in pixels
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels
    #[serde(default = "default_height")]
    pub height: u32,

    /// Capture framerate
    #[serde(default = "default_fps")]
    pub fps: u32,
}

/// How the capture process is invoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Capture binary (looked up on PATH)
    #[serde(default = "default_binary")]
    pub binary: String,

    /// ffmpeg input format driver (avfoundation, v4l2, dshow)
    #[serde(default = "default_input_format")]
    pub input_format: String,

    /// Mirror the image horizontally
    #[serde(default = "default_true")]
    pub mirror: bool,

    /// MJPEG quality scale (2 = best, 31 = worst)
    #[serde(default = "default_quality")]
    pub quality: u8,

    /// Tethered camera binary for /capture-gphoto2
    #[serde(default = "default_gphoto2")]
    pub gphoto2: String,
}

/// Supervisor timer settings, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// How often the watchdog checks for a stalled stream
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_ms: u64,

    /// Time without frames before the pipeline is restarted
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold_ms: u64,

    /// How often dead clients are pruned
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_ms: u64,

    /// How often idle clients get the latest frame re-sent
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_ms: u64,

    /// Delay between switching to a new device and stopping the old one
    #[serde(default = "default_swap_grace")]
    pub swap_grace_ms: u64,

    /// How long a new device gets to produce its first frame
    #[serde(default = "default_swap_timeout")]
    pub swap_timeout_ms: u64,
}

// Default value functions
fn default_port() -> u16 {
    5000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/files")
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_fps() -> u32 {
    30
}

fn default_binary() -> String {
    "ffmpeg".to_string()
}

fn default_input_format() -> String {
    "avfoundation".to_string()
}

fn default_quality() -> u8 {
    5
}

fn default_gphoto2() -> String {
    "gphoto2".to_string()
}

fn default_true() -> bool {
    true
}

fn default_watchdog_interval() -> u64 {
    2_000
}

fn default_stall_threshold() -> u64 {
    5_000
}

fn default_janitor_interval() -> u64 {
    10_000
}

fn default_keepalive_interval() -> u64 {
    15_000
}

fn default_swap_grace() -> u64 {
    100
}

fn default_swap_timeout() -> u64 {
    10_000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            device: DeviceId::default(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            input_format: default_input_format(),
            mirror: true,
            quality: default_quality(),
            gphoto2: default_gphoto2(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            watchdog_interval_ms: default_watchdog_interval(),
            stall_threshold_ms: default_stall_threshold(),
            janitor_interval_ms: default_janitor_interval(),
            keepalive_interval_ms: default_keepalive_interval(),
            swap_grace_ms: default_swap_grace(),
            swap_timeout_ms: default_swap_timeout(),
        }
    }
}

impl ConfigFile {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("peephole").join("config.toml")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("peephole")
                .join("config.toml")
        } else {
            PathBuf::from("/etc/peephole/config.toml")
        }
    }

    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| PeepholeError::Config(format!("Failed to read config file: {}", e)))?;

        let config: ConfigFile = toml::from_str(&content)
            .map_err(|e| PeepholeError::Config(format!("Failed to parse config file: {}", e)))?;

        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    PeepholeError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| PeepholeError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&path, content)
            .map_err(|e| PeepholeError::Config(format!("Failed to write config file: {}", e)))?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }
}

/// Generate a sample configuration file
pub fn sample_config() -> String {
    r#"# Peephole Configuration

[server]
# HTTP port (overridden by PORT)
port = 5000

# Where still captures are written; served under /files
data_dir = "./data/files"

[preview]
# Initial capture device, "<index>:<audio>" (overridden by AVFOUNDATION_DEVICE)
device = "0:none"

# Capture format (overridden by PREVIEW_WIDTH, PREVIEW_HEIGHT, PREVIEW_FPS)
width = 1280
height = 720
fps = 30

[capture]
# Capture binary and input driver: avfoundation (macOS), v4l2 (Linux), dshow (Windows)
binary = "ffmpeg"
input_format = "avfoundation"

# Mirror the preview horizontally
mirror = true

# MJPEG quality, 2 (best) to 31 (worst)
quality = 5

# Tethered camera tool used by POST /capture-gphoto2
gphoto2 = "gphoto2"

[pipeline]
# Watchdog: restart the capture process when no frame arrived for
# stall_threshold_ms while viewers are connected
watchdog_interval_ms = 2000
stall_threshold_ms = 5000

# Prune disconnected viewers and stop capturing when none remain
janitor_interval_ms = 10000

# Re-send the latest frame to idle viewers to keep proxies from timing out
keepalive_interval_ms = 15000

# Device switching: wait this long before stopping the old device,
# and give up if the new device produces no frame in swap_timeout_ms
swap_grace_ms = 100
swap_timeout_ms = 10000
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConfigFile::default();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.preview.device.as_str(), "0:none");
        assert_eq!(config.preview.width, 1280);
        assert_eq!(config.capture.binary, "ffmpeg");
        assert_eq!(config.pipeline.stall_threshold_ms, 5000);
    }

    #[test]
    fn test_sample_config_parses() {
        let sample = sample_config();
        let config: ConfigFile = toml::from_str(&sample).unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ConfigFile = toml::from_str("[preview]\ndevice = \"1:none\"\n").unwrap();
        assert_eq!(config.preview.device.as_str(), "1:none");
        assert_eq!(config.preview.fps, 30);
        assert_eq!(config.server.port, 5000);
    }
}
