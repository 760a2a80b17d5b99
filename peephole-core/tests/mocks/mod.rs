//! Mock infrastructure for testing
//!
//! Provides a scripted capture launcher and JPEG builders, so the supervisor
//! can be driven without ffmpeg or a camera.

#![allow(dead_code)]

use bytes::Bytes;
use parking_lot::Mutex;
use peephole_core::capture::{
    CaptureEvent, CaptureLauncher, CaptureProcess, CaptureSpec, EventSender, ExitInfo,
    SessionEvent,
};
use peephole_core::error::{PeepholeError, Result};
use peephole_core::types::{EOI, Frame, SOI, SessionId};
use peephole_core::{PipelineTimings, Supervisor, SupervisorHandle};
use std::collections::HashSet;
use std::sync::Arc;

/// Bytes of a fake JPEG: SOI, `len` filler bytes, EOI
///
/// The filler never contains 0xFF, so the only markers are the outer ones.
pub fn jpeg_bytes(fill: u8, len: usize) -> Vec<u8> {
    let fill = if fill == 0xFF { 0xFE } else { fill };
    let mut data = Vec::with_capacity(len + 4);
    data.extend_from_slice(&SOI);
    data.extend(std::iter::repeat_n(fill, len));
    data.extend_from_slice(&EOI);
    data
}

/// A fake JPEG frame
pub fn jpeg_frame(fill: u8) -> Frame {
    Frame::new(jpeg_bytes(fill, 16)).expect("valid test frame")
}

struct MockSession {
    id: SessionId,
    spec: CaptureSpec,
    events: EventSender,
    stopped: bool,
    exited: bool,
}

#[derive(Default)]
struct MockState {
    sessions: Vec<MockSession>,
    failing: HashSet<String>,
}

impl MockState {
    fn get_mut(&mut self, id: SessionId) -> &mut MockSession {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .expect("unknown mock session")
    }

    fn get(&self, id: SessionId) -> &MockSession {
        self.sessions
            .iter()
            .find(|s| s.id == id)
            .expect("unknown mock session")
    }
}

/// Capture launcher that records every launch and lets tests script the
/// output of each session
#[derive(Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
}

impl MockLauncher {
    /// Create a new mock launcher
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make launches for `device` fail with a spawn error
    pub fn fail_device(&self, device: &str) {
        self.state.lock().failing.insert(device.to_string());
    }

    /// Number of sessions launched so far
    pub fn launch_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// The `n`th launched session
    pub fn session(&self, n: usize) -> SessionId {
        self.state.lock().sessions[n].id
    }

    /// The most recently launched session
    pub fn last_session(&self) -> SessionId {
        let state = self.state.lock();
        state.sessions.last().expect("no session launched").id
    }

    /// Device a session was launched for
    pub fn device_of(&self, session: SessionId) -> String {
        self.state.lock().get(session).spec.device.to_string()
    }

    /// Capture request a session was launched with
    pub fn spec_of(&self, session: SessionId) -> CaptureSpec {
        self.state.lock().get(session).spec.clone()
    }

    /// Whether the supervisor stopped a session
    pub fn is_stopped(&self, session: SessionId) -> bool {
        self.state.lock().get(session).stopped
    }

    /// Sessions neither stopped nor exited
    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .sessions
            .iter()
            .filter(|s| !s.stopped && !s.exited)
            .count()
    }

    /// Emit a chunk of stdout for a session
    pub fn emit(&self, session: SessionId, data: impl Into<Bytes>) {
        let state = self.state.lock();
        let _ = state.get(session).events.send(SessionEvent {
            session,
            event: CaptureEvent::Data(data.into()),
        });
    }

    /// Emit one complete frame for a session
    pub fn emit_frame(&self, session: SessionId, fill: u8) {
        self.emit(session, jpeg_bytes(fill, 16));
    }

    /// Make a session's process exit on its own
    pub fn exit(&self, session: SessionId, code: i32) {
        let mut state = self.state.lock();
        let mock = state.get_mut(session);
        if mock.exited {
            return;
        }
        mock.exited = true;
        let _ = mock.events.send(SessionEvent {
            session,
            event: CaptureEvent::Exited(ExitInfo {
                code: Some(code),
                signal: None,
            }),
        });
    }
}

impl CaptureLauncher for MockLauncher {
    fn launch(
        &self,
        session: SessionId,
        spec: &CaptureSpec,
        events: EventSender,
    ) -> Result<Box<dyn CaptureProcess>> {
        let mut state = self.state.lock();
        if state.failing.contains(spec.device.as_str()) {
            return Err(PeepholeError::spawn(format!("mock: cannot open {}", spec.device)));
        }

        state.sessions.push(MockSession {
            id: session,
            spec: spec.clone(),
            events,
            stopped: false,
            exited: false,
        });

        Ok(Box::new(MockProcess {
            session,
            state: self.state.clone(),
        }))
    }
}

struct MockProcess {
    session: SessionId,
    state: Arc<Mutex<MockState>>,
}

impl CaptureProcess for MockProcess {
    fn session(&self) -> SessionId {
        self.session
    }

    fn stop(&mut self) {
        let mut state = self.state.lock();
        let mock = state.get_mut(self.session);
        if mock.stopped {
            return;
        }
        mock.stopped = true;
        if !mock.exited {
            mock.exited = true;
            let _ = mock.events.send(SessionEvent {
                session: self.session,
                event: CaptureEvent::Exited(ExitInfo {
                    code: None,
                    signal: Some(15),
                }),
            });
        }
    }
}

/// Initial capture request used by the tests
pub fn initial_capture() -> CaptureSpec {
    CaptureSpec {
        device: "0:none".into(),
        width: 1280,
        height: 720,
        fps: 30,
    }
}

/// Spawn a supervisor driven by `launcher`
pub fn spawn_supervisor(launcher: &Arc<MockLauncher>, timings: PipelineTimings) -> SupervisorHandle {
    Supervisor::spawn(launcher.clone(), initial_capture(), timings)
}

/// Let the supervisor drain everything queued so far
pub async fn settle(handle: &SupervisorHandle) {
    for _ in 0..3 {
        handle.status().await.expect("supervisor alive");
    }
}

/// Wait until `n` sessions have been launched
pub async fn wait_for_launches(launcher: &MockLauncher, handle: &SupervisorHandle, n: usize) {
    for _ in 0..50 {
        if launcher.launch_count() >= n {
            return;
        }
        settle(handle).await;
    }
    panic!(
        "expected {} launches, saw {}",
        n,
        launcher.launch_count()
    );
}
