//! Camera capture via an external ffmpeg process
//!
//! This module handles:
//! - Spawning and stopping the capture process
//! - Splitting its MJPEG output into frames
//! - Enumerating capture devices

pub mod devices;
pub mod extractor;
pub mod process;

pub use devices::{DeviceInfo, DeviceLister, parse_device_list};
pub use extractor::FrameExtractor;
pub use process::{
    CaptureEvent, CaptureLauncher, CaptureProcess, CaptureSpec, EventSender, ExitInfo,
    FfmpegLauncher, SessionEvent, capture_args,
};

use crate::config::CaptureSettings;
use crate::error::Result;

/// List available video capture devices
pub async fn list_devices(settings: &CaptureSettings) -> Result<Vec<DeviceInfo>> {
    DeviceLister::new(settings).list().await
}
