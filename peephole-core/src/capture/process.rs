//! Capture process handling
//!
//! Spawns the external capture binary (ffmpeg) for one device and turns its
//! stdout into a stream of [`SessionEvent`]s. Every session reports exactly
//! one [`CaptureEvent::Exited`], whether it died on its own or was stopped.

use bytes::Bytes;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::CaptureSettings;
use crate::error::{PeepholeError, Result};
use crate::types::{DeviceId, SessionId};

/// Size of each stdout read
const READ_CHUNK: usize = 64 * 1024;

/// How long a process gets to exit after SIGTERM before it is killed
const KILL_GRACE: Duration = Duration::from_secs(2);

/// What to capture and at which format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSpec {
    /// Device to open
    pub device: DeviceId,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Target framerate
    pub fps: u32,
}

/// How a capture process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if any
    pub signal: Option<i32>,
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code={}", code),
            (None, Some(signal)) => write!(f, "signal={}", signal),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Output of a capture process
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// A chunk of stdout
    Data(Bytes),
    /// The process has ended; no further events follow
    Exited(ExitInfo),
}

/// A capture event tagged with the session that produced it
#[derive(Debug, Clone)]
pub struct SessionEvent {
    /// Originating session
    pub session: SessionId,
    /// What happened
    pub event: CaptureEvent,
}

/// Channel on which capture sessions report their events
pub type EventSender = mpsc::UnboundedSender<SessionEvent>;

/// A running capture process
pub trait CaptureProcess: Send {
    /// Session this process belongs to
    fn session(&self) -> SessionId;

    /// Request termination
    ///
    /// Idempotent, and a no-op for a process that has already exited.
    fn stop(&mut self);
}

/// Starts capture processes
pub trait CaptureLauncher: Send + Sync {
    /// Spawn a capture process for `spec`, reporting its output on `events`
    fn launch(
        &self,
        session: SessionId,
        spec: &CaptureSpec,
        events: EventSender,
    ) -> Result<Box<dyn CaptureProcess>>;
}

/// Build the argument list for the capture binary
pub fn capture_args(settings: &CaptureSettings, spec: &CaptureSpec) -> Result<Vec<String>> {
    let index = spec
        .device
        .index()
        .ok_or_else(|| PeepholeError::InvalidDevice(spec.device.to_string()))?;

    if spec.width == 0 || spec.height == 0 || spec.fps == 0 {
        return Err(PeepholeError::spawn(format!(
            "invalid capture format {}x{} @ {}fps",
            spec.width, spec.height, spec.fps
        )));
    }

    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        settings.input_format.as_str(),
        "-framerate",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push(spec.fps.to_string());
    args.push("-video_size".into());
    args.push(format!("{}x{}", spec.width, spec.height));
    args.extend(
        [
            "-capture_cursor",
            "0",
            "-capture_mouse_clicks",
            "0",
            "-pixel_format",
            "yuyv422",
            "-video_device_index",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(index.to_string());
    args.extend(
        ["-audio_device_index", "none", "-i", "", "-an"]
            .iter()
            .map(|s| s.to_string()),
    );

    if settings.mirror {
        args.push("-vf".into());
        args.push("hflip".into());
    }

    args.push("-f".into());
    args.push("mjpeg".into());
    args.push("-q:v".into());
    args.push(settings.quality.to_string());
    args.push("pipe:1".into());

    Ok(args)
}

/// Launches ffmpeg as the capture process
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    settings: CaptureSettings,
}

impl FfmpegLauncher {
    /// Create a launcher using the given capture settings
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }
}

impl CaptureLauncher for FfmpegLauncher {
    fn launch(
        &self,
        session: SessionId,
        spec: &CaptureSpec,
        events: EventSender,
    ) -> Result<Box<dyn CaptureProcess>> {
        let args = capture_args(&self.settings, spec)?;
        info!(
            "Starting {} for {} ({}): {}",
            self.settings.binary,
            spec.device,
            session,
            args.join(" ")
        );

        let mut child = Command::new(&self.settings.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PeepholeError::spawn(format!("{}: {}", self.settings.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PeepholeError::spawn("capture process has no stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(session, stderr));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(run_process(session, child, stdout, events, stop_rx));

        Ok(Box::new(FfmpegProcess {
            session,
            stop_tx: Some(stop_tx),
        }))
    }
}

/// Handle to a spawned ffmpeg process
///
/// Dropping the handle stops the process.
struct FfmpegProcess {
    session: SessionId,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl CaptureProcess for FfmpegProcess {
    fn session(&self) -> SessionId {
        self.session
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            debug!("Stopping capture process {}", self.session);
            // The process task may already be gone if ffmpeg exited
            let _ = tx.send(());
        }
    }
}

/// Pump stdout into the event channel until EOF or a stop request
async fn run_process(
    session: SessionId,
    mut child: Child,
    mut stdout: ChildStdout,
    events: EventSender,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut stop_requested = false;

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    trace!("{}: {} bytes", session, n);
                    let event = SessionEvent {
                        session,
                        event: CaptureEvent::Data(Bytes::copy_from_slice(&buf[..n])),
                    };
                    if events.send(event).is_err() {
                        // Supervisor gone, nobody wants the output
                        stop_requested = true;
                        break;
                    }
                }
                Err(e) => {
                    warn!("{}: stdout read failed: {}", session, e);
                    break;
                }
            },
            // Also fires when the handle is dropped
            _ = &mut stop_rx => {
                stop_requested = true;
                break;
            }
        }
    }

    drop(stdout);
    if stop_requested {
        terminate(&mut child);
    }

    let info = match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => exit_info(status),
        Ok(Err(e)) => {
            warn!("{}: failed to wait for capture process: {}", session, e);
            ExitInfo::default()
        }
        Err(_) => {
            warn!("{}: capture process ignored SIGTERM, killing", session);
            if let Err(e) = child.kill().await {
                debug!("{}: kill failed: {}", session, e);
            }
            child.try_wait().ok().flatten().map(exit_info).unwrap_or_default()
        }
    };

    if stop_requested {
        debug!("{}: capture process stopped ({})", session, info);
    } else {
        warn!("{}: capture process exited ({})", session, info);
    }

    let _ = events.send(SessionEvent {
        session,
        event: CaptureEvent::Exited(info),
    });
}

/// Best-effort SIGTERM, falling back to a hard kill
fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        // Already reaped
        return;
    };

    // SAFETY: kill(2) has no memory-safety preconditions. `pid` belongs to a
    // child we spawned and have not yet reaped, so it cannot have been reused.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!("SIGTERM to {} failed, killing", pid);
        let _ = child.start_kill();
    }
}

fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;

    ExitInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

/// Log stderr lines until EOF
///
/// The pipe must stay open for the life of the process, otherwise ffmpeg
/// dies of SIGPIPE on its next diagnostic.
async fn log_stderr(session: SessionId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(line)) => {
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if !line.is_empty() {
                    warn!(target: "peephole_core::ffmpeg", "{}: {}", session, line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("{}: stderr read failed: {}", session, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(device: &str) -> CaptureSpec {
        CaptureSpec {
            device: DeviceId::new(device),
            width: 1280,
            height: 720,
            fps: 30,
        }
    }

    #[test]
    fn test_capture_args_default() {
        let args = capture_args(&CaptureSettings::default(), &spec("1:none")).unwrap();
        let joined = args.join(" ");
        assert!(joined.starts_with("-hide_banner -loglevel error -f avfoundation -framerate 30"));
        assert!(joined.contains("-video_size 1280x720"));
        assert!(joined.contains("-video_device_index 1 -audio_device_index none"));
        assert!(joined.contains("-vf hflip"));
        assert!(joined.ends_with("-f mjpeg -q:v 5 pipe:1"));

        // The empty input name is its own argument
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "");
    }

    #[test]
    fn test_capture_args_without_mirror() {
        let settings = CaptureSettings {
            mirror: false,
            ..Default::default()
        };
        let args = capture_args(&settings, &spec("0:none")).unwrap();
        assert!(!args.iter().any(|a| a == "hflip"));
    }

    #[test]
    fn test_capture_args_rejects_bad_device() {
        let err = capture_args(&CaptureSettings::default(), &spec("front:none")).unwrap_err();
        assert!(matches!(err, PeepholeError::InvalidDevice(_)));
    }

    #[test]
    fn test_capture_args_rejects_zero_fps() {
        let mut spec = spec("0:none");
        spec.fps = 0;
        assert!(capture_args(&CaptureSettings::default(), &spec).is_err());
    }

    #[test]
    fn test_exit_info_display() {
        let info = ExitInfo {
            code: Some(1),
            signal: None,
        };
        assert_eq!(info.to_string(), "code=1");
        let info = ExitInfo {
            code: None,
            signal: Some(15),
        };
        assert_eq!(info.to_string(), "signal=15");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let settings = CaptureSettings {
            binary: "/nonexistent/peephole-ffmpeg".to_string(),
            ..Default::default()
        };
        let launcher = FfmpegLauncher::new(settings);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = launcher.launch(SessionId::next(), &spec("0:none"), tx);
        assert!(matches!(result, Err(PeepholeError::Spawn(_))));
    }
}
