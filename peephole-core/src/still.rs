//! Still captures
//!
//! Saves the latest preview frame, or a full-resolution shot from a tethered
//! camera through gphoto2, into the data directory.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{PeepholeError, Result, ResultExt};
use crate::types::Frame;

/// Upper bound on `gphoto2 --summary`
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a tethered capture, which includes autofocus and download
const TETHERED_TIMEOUT: Duration = Duration::from_secs(60);

/// A finished still capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureJob {
    /// 12 hex digit id, also the file stem
    pub job_id: String,
    /// Always "done"; captures complete before the response is sent
    pub status: String,
    /// URL path the image is served under
    pub file: String,
    /// Capture backend, when not the preview stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl CaptureJob {
    fn done(id: &str, method: Option<&str>) -> Self {
        Self {
            job_id: id.to_string(),
            status: "done".to_string(),
            file: format!("/files/{}.jpg", id),
            method: method.map(str::to_string),
        }
    }
}

/// New capture id: 12 lowercase hex digits
pub fn new_capture_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

/// Writes still captures to the data directory
#[derive(Debug, Clone)]
pub struct StillCapture {
    data_dir: PathBuf,
    gphoto2: String,
}

impl StillCapture {
    /// Create a still capture writer for `data_dir`, using `gphoto2` for
    /// tethered shots
    pub fn new(data_dir: impl Into<PathBuf>, gphoto2: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            gphoto2: gphoto2.into(),
        }
    }

    /// Directory captures are written to
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Create the data directory if needed
    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(PeepholeError::from)
            .context(format!("creating {}", self.data_dir.display()))
    }

    /// Save a preview frame as `<id>.jpg`
    pub async fn save_frame(&self, frame: &Frame) -> Result<CaptureJob> {
        self.ensure_dir().await?;

        let id = new_capture_id();
        let path = self.data_dir.join(format!("{}.jpg", id));
        tokio::fs::write(&path, frame.as_ref())
            .await
            .map_err(PeepholeError::from)
            .context(format!("writing {}", path.display()))?;

        info!("Saved still {} ({} bytes)", path.display(), frame.len());
        Ok(CaptureJob::done(&id, None))
    }

    /// Save the cached preview frame, if the pipeline has produced one
    pub async fn save_latest(&self, frame: Option<Frame>) -> Result<CaptureJob> {
        let frame = frame.ok_or(PeepholeError::NoFrame)?;
        self.save_frame(&frame).await
    }

    /// Trigger a tethered camera and download the shot as `<id>.jpg`
    pub async fn capture_gphoto2(&self) -> Result<CaptureJob> {
        self.ensure_dir().await?;
        self.check_camera().await?;

        let id = new_capture_id();
        let file_name = format!("{}.jpg", id);
        info!("Capturing tethered still {}", file_name);

        let run = Command::new(&self.gphoto2)
            .args([
                "--capture-image-and-download",
                "--filename",
                file_name.as_str(),
                "--force-overwrite",
            ])
            .current_dir(&self.data_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(TETHERED_TIMEOUT, run)
            .await
            .map_err(|_| PeepholeError::capture("timed out waiting for the camera"))?
            .map_err(|e| PeepholeError::capture(format!("failed to run {}: {}", self.gphoto2, e)))?;

        let path = self.data_dir.join(&file_name);
        if output.status.success() && path.exists() {
            info!("Tethered still saved to {}", path.display());
            return Ok(CaptureJob::done(&id, Some("gphoto2")));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let details = if stderr.trim().is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        warn!("gphoto2 capture failed ({}): {}", output.status, details);
        Err(PeepholeError::capture(details))
    }

    async fn check_camera(&self) -> Result<()> {
        let run = Command::new(&self.gphoto2)
            .arg("--summary")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        let status = tokio::time::timeout(SUMMARY_TIMEOUT, run)
            .await
            .map_err(|_| PeepholeError::NoCamera("camera did not answer".to_string()))?
            .map_err(|e| {
                PeepholeError::capture(format!("{} not available: {}", self.gphoto2, e))
            })?;

        if !status.success() {
            debug!("{} --summary exited with {}", self.gphoto2, status);
            return Err(PeepholeError::NoCamera(
                "no gphoto2-compatible camera detected".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of a served capture, or `None` if `name` could escape the data
    /// directory
    pub fn resolve_file(&self, name: &str) -> Option<PathBuf> {
        let safe = !name.is_empty()
            && name != "."
            && !name.contains("..")
            && !name.contains('/')
            && !name.contains('\\')
            && !name.contains('\0');
        safe.then(|| self.data_dir.join(name))
    }
}

/// Content type for a served capture
pub fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}
