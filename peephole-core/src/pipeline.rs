//! Pipeline supervisor
//!
//! Owns the capture process, the frame extractor and the broadcast registry,
//! and runs the state machine that ties them together:
//!
//! ```text
//!            first client / start            switch (clients connected)
//!   ┌──────┐ ─────────────────────▶ ┌─────────┐ ──────────────▶ ┌──────────┐
//!   │ Idle │                        │ Running │                 │ Swapping │
//!   └──────┘ ◀───────────────────── └─────────┘ ◀────────────── └──────────┘
//!            no clients / stop          │  ▲     first frame from new device,
//!                                       └──┘     timeout or failure
//!                                  watchdog restart
//! ```
//!
//! Everything runs on one task. Callers talk to it through a cloneable
//! [`SupervisorHandle`]; capture processes report their output on a channel
//! that the same task drains, so state is only ever touched by one writer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_stream::Stream;
use tracing::{debug, info, trace, warn};

use crate::capture::{
    CaptureEvent, CaptureLauncher, CaptureProcess, CaptureSpec, EventSender, ExitInfo,
    FrameExtractor, SessionEvent,
};
use crate::config::PipelineTimings;
use crate::error::{PeepholeError, Result};
use crate::registry::{FrameSink, Registry, RemovalReason};
use crate::types::{ClientId, DeviceId, Frame, SessionId};

/// Parts buffered per streaming client before frames are dropped for it
pub const CLIENT_QUEUE_DEPTH: usize = 4;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    /// No capture process
    Idle,
    /// One capture process feeding the registry
    Running,
    /// A second capture process is being brought up for a device switch
    Swapping,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Swapping => "swapping",
        };
        f.write_str(name)
    }
}

/// Snapshot of the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    /// Current state
    pub state: PipelineState,
    /// Device frames are currently taken from
    pub device: DeviceId,
    /// Connected streaming clients
    pub clients: usize,
    /// Whether a frame is cached for stills and late joiners
    pub has_frame: bool,
    /// Frames broadcast since the supervisor started
    pub frames_broadcast: u64,
    /// Watchdog restarts
    pub restarts: u64,
    /// Completed device switches
    pub swaps: u64,
    /// Time since the pipeline last left Idle
    pub uptime_seconds: f64,
    /// Id of the active capture session
    pub session: Option<u64>,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pipeline {} on {}: {} clients, {} frames, {} restarts, {} swaps, up {:.1}s",
            self.state,
            self.device,
            self.clients,
            self.frames_broadcast,
            self.restarts,
            self.swaps,
            self.uptime_seconds
        )
    }
}

enum Command {
    Connect {
        sink: Box<dyn FrameSink>,
        max_fps: u32,
        reply: oneshot::Sender<Result<ClientId>>,
    },
    Disconnect {
        client: ClientId,
        reason: RemovalReason,
    },
    KeepAlive(ClientId),
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Switch {
        device: DeviceId,
        reply: oneshot::Sender<Result<DeviceId>>,
    },
    CurrentDevice {
        reply: oneshot::Sender<DeviceId>,
    },
    LatestFrame {
        reply: oneshot::Sender<Option<Frame>>,
    },
    Status {
        reply: oneshot::Sender<PipelineStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl SupervisorHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| PeepholeError::SupervisorGone)?;
        rx.await.map_err(|_| PeepholeError::SupervisorGone)
    }

    /// Register a client sink, starting the pipeline if it is idle
    pub async fn connect(&self, sink: impl FrameSink + 'static, max_fps: u32) -> Result<ClientId> {
        let sink: Box<dyn FrameSink> = Box::new(sink);
        self.request(|reply| Command::Connect {
            sink,
            max_fps,
            reply,
        })
        .await?
    }

    /// Register a client and return its stream of multipart parts
    ///
    /// Dropping the stream deregisters the client.
    pub async fn subscribe(&self, max_fps: u32) -> Result<ClientStream> {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let id = self.connect(tx, max_fps).await?;
        Ok(ClientStream {
            id,
            rx,
            handle: self.clone(),
        })
    }

    /// Deregister a client; a no-op if it is already gone
    pub fn disconnect(&self, client: ClientId) {
        let _ = self.tx.send(Command::Disconnect {
            client,
            reason: RemovalReason::Disconnect,
        });
    }

    /// Start capturing from the current device; a no-op while running
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| Command::Start { reply }).await?
    }

    /// Stop capturing; a no-op while idle. Clients stay registered.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Switch to another device
    ///
    /// With viewers connected the new device is brought up next to the old
    /// one and the stream moves over once it delivers a frame. Resolves with
    /// the device now in use.
    pub async fn switch_device(&self, device: DeviceId) -> Result<DeviceId> {
        self.request(|reply| Command::Switch { device, reply })
            .await?
    }

    /// Device frames are currently taken from
    pub async fn current_device(&self) -> Result<DeviceId> {
        self.request(|reply| Command::CurrentDevice { reply }).await
    }

    /// Most recently broadcast frame
    pub async fn latest_frame(&self) -> Result<Option<Frame>> {
        self.request(|reply| Command::LatestFrame { reply }).await
    }

    /// Snapshot of the supervisor state
    pub async fn status(&self) -> Result<PipelineStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stop capturing, drop every client and end the supervisor task
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Whether the supervisor task has ended
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Stream of multipart parts for one client
pub struct ClientStream {
    id: ClientId,
    rx: mpsc::Receiver<Bytes>,
    handle: SupervisorHandle,
}

impl ClientStream {
    /// Registry id of this client
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl Stream for ClientStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.handle.disconnect(self.id);
    }
}

/// One capture process and the extractor fed by its output
struct CaptureSession {
    id: SessionId,
    device: DeviceId,
    process: Box<dyn CaptureProcess>,
    extractor: FrameExtractor,
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.process.stop();
    }
}

/// A new session waiting for its first frame
struct PendingSwap {
    session: CaptureSession,
    reply: oneshot::Sender<Result<DeviceId>>,
    deadline: Instant,
}

/// A replaced session kept alive for the grace period
struct RetiringSession {
    session: CaptureSession,
    deadline: Instant,
    device: DeviceId,
    reply: oneshot::Sender<Result<DeviceId>>,
}

enum Wake {
    Event(SessionEvent),
    Deadline,
    Watchdog,
    Janitor,
    Command(Option<Command>),
}

/// The pipeline state machine
pub struct Supervisor {
    launcher: Arc<dyn CaptureLauncher>,
    spec: CaptureSpec,
    timings: PipelineTimings,
    registry: Registry,
    events: EventSender,
    commands: mpsc::WeakUnboundedSender<Command>,
    running: bool,
    active: Option<CaptureSession>,
    pending: Option<PendingSwap>,
    retiring: Vec<RetiringSession>,
    /// Start of the current staleness window
    stall_since: Instant,
    started_at: Option<Instant>,
    watchdog: Option<Interval>,
    janitor: Option<Interval>,
    restarts: u64,
    swaps: u64,
}

impl Supervisor {
    /// Spawn a supervisor task and return its handle
    ///
    /// `spec` holds the initial device and the capture format used for
    /// every session. The pipeline starts idle.
    pub fn spawn(
        launcher: Arc<dyn CaptureLauncher>,
        spec: CaptureSpec,
        timings: PipelineTimings,
    ) -> SupervisorHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            launcher,
            spec,
            timings,
            registry: Registry::new(),
            events: event_tx,
            commands: command_tx.downgrade(),
            running: false,
            active: None,
            pending: None,
            retiring: Vec::new(),
            stall_since: Instant::now(),
            started_at: None,
            watchdog: None,
            janitor: None,
            restarts: 0,
            swaps: 0,
        };
        tokio::spawn(supervisor.run(command_rx, event_rx));

        SupervisorHandle { tx: command_tx }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        debug!("Supervisor started for {}", self.spec.device);

        loop {
            let deadline = self.next_deadline();
            let wake = tokio::select! {
                // Commands and timers ahead of capture output
                biased;
                command = commands.recv() => Wake::Command(command),
                _ = sleep_until(deadline) => Wake::Deadline,
                _ = tick(&mut self.watchdog) => Wake::Watchdog,
                _ = tick(&mut self.janitor) => Wake::Janitor,
                Some(event) = events.recv() => Wake::Event(event),
            };

            match wake {
                Wake::Event(event) => self.handle_event(event),
                Wake::Deadline => self.handle_deadlines(),
                Wake::Watchdog => self.check_stall(),
                Wake::Janitor => self.prune_clients(),
                Wake::Command(Some(Command::Shutdown { reply })) => {
                    self.shutdown();
                    let _ = reply.send(());
                    break;
                }
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Command(None) => {
                    self.shutdown();
                    break;
                }
            }
        }

        debug!("Supervisor stopped");
    }

    fn state(&self) -> PipelineState {
        if self.swap_in_flight() {
            PipelineState::Swapping
        } else if self.running {
            PipelineState::Running
        } else {
            PipelineState::Idle
        }
    }

    fn swap_in_flight(&self) -> bool {
        self.pending.is_some() || !self.retiring.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        let pending = self.pending.as_ref().map(|p| p.deadline);
        let retiring = self.retiring.iter().map(|r| r.deadline).min();
        match (pending, retiring) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                sink,
                max_fps,
                reply,
            } => {
                let _ = reply.send(self.connect(sink, max_fps));
            }
            Command::Disconnect { client, reason } => {
                self.registry.remove(client, reason);
            }
            Command::KeepAlive(client) => {
                self.registry.keep_alive(client);
            }
            Command::Start { reply } => {
                let _ = reply.send(self.start());
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::Switch { device, reply } => self.switch_device(device, reply),
            Command::CurrentDevice { reply } => {
                let _ = reply.send(self.spec.device.clone());
            }
            Command::LatestFrame { reply } => {
                let _ = reply.send(self.registry.latest().cloned());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self, sink: Box<dyn FrameSink>, max_fps: u32) -> Result<ClientId> {
        let client = self.registry.add(sink, max_fps).ok_or_else(|| {
            PeepholeError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "client went away during registration",
            ))
        })?;

        let keepalive = spawn_keepalive(
            self.commands.clone(),
            client,
            self.timings.keepalive_interval,
        );
        self.registry.attach_keepalive(client, keepalive);

        if let Err(e) = self.start() {
            self.registry.remove(client, RemovalReason::StartFailed);
            return Err(e);
        }
        Ok(client)
    }

    fn launch(&self, device: &DeviceId) -> Result<CaptureSession> {
        let id = SessionId::next();
        let spec = CaptureSpec {
            device: device.clone(),
            ..self.spec.clone()
        };
        let process = self.launcher.launch(id, &spec, self.events.clone())?;
        Ok(CaptureSession {
            id,
            device: device.clone(),
            process,
            extractor: FrameExtractor::new(),
        })
    }

    fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }

        let session = self.launch(&self.spec.device)?;
        info!("Pipeline started on {} ({})", session.device, session.id);

        let now = Instant::now();
        self.active = Some(session);
        self.running = true;
        self.started_at = Some(now);
        self.stall_since = now;
        self.watchdog = Some(periodic(self.timings.watchdog_interval));
        self.janitor = Some(periodic(self.timings.janitor_interval));
        Ok(())
    }

    fn stop(&mut self) {
        if !self.running && self.active.is_none() && !self.swap_in_flight() {
            return;
        }

        self.abort_swap(PeepholeError::swap_aborted("pipeline stopped"));
        self.finish_retiring(true);
        self.active = None;
        self.registry.clear_latest();
        self.watchdog = None;
        self.janitor = None;
        self.running = false;
        self.started_at = None;
        info!("Pipeline stopped");
    }

    fn shutdown(&mut self) {
        self.stop();
        self.registry.clear(RemovalReason::Shutdown);
    }

    /// Tear down the active session and start a fresh one on the same device
    fn restart(&mut self) {
        self.active = None;
        self.registry.clear_latest();
        self.stall_since = Instant::now();
        self.restarts += 1;

        match self.launch(&self.spec.device) {
            Ok(session) => {
                info!("Pipeline restarted on {} ({})", session.device, session.id);
                self.active = Some(session);
            }
            Err(e) => warn!(
                "Restart on {} failed: {}; retrying in {:?}",
                self.spec.device, e, self.timings.watchdog_interval
            ),
        }
    }

    fn switch_device(&mut self, device: DeviceId, reply: oneshot::Sender<Result<DeviceId>>) {
        if device.index().is_none() {
            let _ = reply.send(Err(PeepholeError::InvalidDevice(device.to_string())));
            return;
        }
        if self.swap_in_flight() {
            let _ = reply.send(Err(PeepholeError::SwitchInProgress));
            return;
        }

        info!("Switching to device {}", device);

        if self.active.is_some() && !self.registry.is_empty() {
            match self.launch(&device) {
                Ok(session) => {
                    debug!("Waiting for first frame from {} ({})", device, session.id);
                    self.pending = Some(PendingSwap {
                        session,
                        reply,
                        deadline: Instant::now() + self.timings.swap_timeout,
                    });
                }
                Err(e) => {
                    warn!("Could not start {}: {}", device, e);
                    let _ = reply.send(Err(e));
                }
            }
            return;
        }

        // Nobody is watching, so there is nothing to keep alive
        self.stop();
        let previous = std::mem::replace(&mut self.spec.device, device.clone());
        match self.start() {
            Ok(()) => {
                let _ = reply.send(Ok(device));
            }
            Err(e) => {
                self.spec.device = previous;
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Make the pending session the active one
    fn complete_swap(&mut self) {
        let Some(PendingSwap { session, reply, .. }) = self.pending.take() else {
            return;
        };

        let device = session.device.clone();
        let now = Instant::now();
        info!("Now streaming from {} ({})", device, session.id);

        self.spec.device = device.clone();
        self.stall_since = now;
        self.swaps += 1;

        match self.active.replace(session) {
            Some(old) => self.retiring.push(RetiringSession {
                session: old,
                deadline: now + self.timings.swap_grace,
                device,
                reply,
            }),
            None => {
                let _ = reply.send(Ok(device));
            }
        }
    }

    fn abort_swap(&mut self, error: PeepholeError) {
        if let Some(pending) = self.pending.take() {
            warn!("Switch to {} abandoned: {}", pending.session.device, error);
            let _ = pending.reply.send(Err(error));
        }
    }

    /// Stop replaced sessions, all of them or only those past their grace
    fn finish_retiring(&mut self, all: bool) {
        let now = Instant::now();
        let (done, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retiring)
            .into_iter()
            .partition(|r| all || r.deadline <= now);
        self.retiring = keep;

        for retired in done {
            debug!("Stopping replaced session {}", retired.session.id);
            let RetiringSession { session, device, reply, .. } = retired;
            drop(session);
            let _ = reply.send(Ok(device));
        }
    }

    fn handle_deadlines(&mut self) {
        let now = Instant::now();
        if self.pending.as_ref().is_some_and(|p| p.deadline <= now) {
            self.abort_swap(PeepholeError::swap_aborted(format!(
                "no frame within {:?}",
                self.timings.swap_timeout
            )));
        }
        self.finish_retiring(false);
    }

    fn handle_event(&mut self, SessionEvent { session, event }: SessionEvent) {
        match event {
            CaptureEvent::Data(chunk) => self.handle_data(session, &chunk),
            CaptureEvent::Exited(info) => self.handle_exit(session, info),
        }
    }

    fn handle_data(&mut self, session: SessionId, chunk: &[u8]) {
        if let Some(active) = self.active.as_mut().filter(|s| s.id == session) {
            let frames = active.extractor.push(chunk);
            for frame in frames {
                self.registry.broadcast_latest(frame);
            }
            return;
        }

        if let Some(pending) = self.pending.as_mut().filter(|p| p.session.id == session) {
            let frames = pending.session.extractor.push(chunk);
            if frames.is_empty() {
                return;
            }
            self.complete_swap();
            for frame in frames {
                self.registry.broadcast_latest(frame);
            }
            return;
        }

        trace!("Ignoring {} bytes from {}", chunk.len(), session);
    }

    fn handle_exit(&mut self, session: SessionId, info: ExitInfo) {
        if self.active.as_ref().is_some_and(|s| s.id == session) {
            warn!("Capture process {} exited ({})", session, info);
            self.active = None;
            if self.registry.is_empty() {
                self.stop();
            }
            return;
        }

        if self.pending.as_ref().is_some_and(|p| p.session.id == session) {
            self.abort_swap(PeepholeError::swap_aborted(format!(
                "capture process exited before producing a frame ({})",
                info
            )));
            return;
        }

        debug!("{} exited ({})", session, info);
    }

    fn check_stall(&mut self) {
        if !self.running || self.registry.is_empty() {
            return;
        }
        // A pending switch is bounded by the swap timeout instead
        if self.pending.is_some() {
            return;
        }

        let last = match self.registry.last_frame_at() {
            Some(at) => at.max(self.stall_since),
            None => self.stall_since,
        };
        let stalled = Instant::now().duration_since(last);
        if stalled > self.timings.stall_threshold {
            warn!(
                "No frames for {:.1}s, restarting capture on {}",
                stalled.as_secs_f64(),
                self.spec.device
            );
            self.restart();
        }
    }

    fn prune_clients(&mut self) {
        self.registry.prune_dead();
        if self.running && self.registry.is_empty() {
            info!("No clients remaining, stopping pipeline");
            self.stop();
        }
    }

    fn status(&self) -> PipelineStatus {
        PipelineStatus {
            state: self.state(),
            device: self.spec.device.clone(),
            clients: self.registry.len(),
            has_frame: self.registry.latest().is_some(),
            frames_broadcast: self.registry.frames_broadcast(),
            restarts: self.restarts,
            swaps: self.swaps,
            uptime_seconds: self
                .started_at
                .map(|t| t.elapsed().as_secs_f64())
                .unwrap_or(0.0),
            session: self.active.as_ref().map(|s| s.id.as_u64()),
        }
    }
}

fn periodic(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Periodically ask the supervisor to re-send the cached frame to `client`
fn spawn_keepalive(
    commands: mpsc::WeakUnboundedSender<Command>,
    client: ClientId,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = periodic(period);
        loop {
            interval.tick().await;
            let Some(commands) = commands.upgrade() else {
                break;
            };
            if commands.send(Command::KeepAlive(client)).is_err() {
                break;
            }
        }
    })
}
