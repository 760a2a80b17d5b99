//! Capture device enumeration
//!
//! ffmpeg has no machine-readable device listing; the list is printed to
//! stderr as log lines, e.g.
//!
//! ```text
//! [AVFoundation indev @ 0x7f8] AVFoundation video devices:
//! [AVFoundation indev @ 0x7f8] [0] FaceTime HD Camera
//! [AVFoundation indev @ 0x7f8] [1] Capture screen 0
//! [AVFoundation indev @ 0x7f8] AVFoundation audio devices:
//! [AVFoundation indev @ 0x7f8] [0] MacBook Pro Microphone
//! ```

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::CaptureSettings;
use crate::error::{PeepholeError, Result};
use crate::types::DeviceId;

/// Upper bound on a device listing run
const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// A video capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Video device index
    pub index: u32,
    /// Human-readable name
    pub name: String,
    /// Identifier to pass to a device switch
    pub device: DeviceId,
}

/// Parse the video device section of ffmpeg's `-list_devices` output
pub fn parse_device_list(output: &str) -> Vec<DeviceInfo> {
    let mut devices = Vec::new();
    let mut in_video = false;

    for line in output.lines() {
        if line.contains("video devices:") {
            in_video = true;
            continue;
        }
        if line.contains("audio devices:") {
            break;
        }
        if !in_video || !line.contains("] [") {
            continue;
        }
        if let Some((index, name)) = parse_device_line(line) {
            devices.push(DeviceInfo {
                index,
                name,
                device: DeviceId::from_index(index),
            });
        }
    }

    devices
}

/// Find the first `[N] name` in a log line
fn parse_device_line(line: &str) -> Option<(u32, String)> {
    let mut rest = line;
    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let close = after.find(']')?;
        let digits = &after[..close];
        let tail = &after[close + 1..];

        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            let name = tail.trim();
            if tail.starts_with(char::is_whitespace) && !name.is_empty() {
                if let Ok(index) = digits.parse() {
                    return Some((index, name.to_string()));
                }
            }
        }
        rest = after;
    }
    None
}

/// Lists devices by running the capture binary in list mode
#[derive(Debug, Clone)]
pub struct DeviceLister {
    binary: String,
    input_format: String,
}

impl DeviceLister {
    /// Create a lister using the configured binary and input format
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            input_format: settings.input_format.clone(),
        }
    }

    /// Enumerate video devices
    pub async fn list(&self) -> Result<Vec<DeviceInfo>> {
        let run = Command::new(&self.binary)
            .args(["-hide_banner", "-f", self.input_format.as_str(), "-list_devices", "true", "-i", ""])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(LIST_TIMEOUT, run)
            .await
            .map_err(|_| PeepholeError::device_list("timed out waiting for device list"))?
            .map_err(|e| PeepholeError::device_list(format!("{}: {}", self.binary, e)))?;

        // ffmpeg exits non-zero here because there is no real input
        let stderr = String::from_utf8_lossy(&output.stderr);
        let devices = parse_device_list(&stderr);
        debug!("Found {} video devices", devices.len());
        Ok(devices)
    }

    /// Human-readable name of a device, if it is currently attached
    pub async fn resolve_name(&self, device: &DeviceId) -> Result<Option<String>> {
        let Some(index) = device.index() else {
            return Ok(None);
        };
        let devices = self.list().await?;
        Ok(devices.into_iter().find(|d| d.index == index).map(|d| d.name))
    }
}
