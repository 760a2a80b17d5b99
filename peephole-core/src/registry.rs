//! Broadcast registry for streaming clients
//!
//! Holds every connected preview client and the most recent frame. Frames are
//! written as `multipart/x-mixed-replace` parts into a non-blocking sink per
//! client, so a slow viewer only ever loses frames and never holds up the
//! others.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::types::{ClientId, Frame};

/// Multipart boundary used on the preview stream
pub const BOUNDARY: &str = "frame";

/// Encode one frame as a multipart part, trailing CRLF included
pub fn multipart_part(frame: &Frame) -> Bytes {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        frame.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + frame.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(frame.as_ref());
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Result of a non-blocking write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued for the client
    Sent,
    /// The client's queue is full; this frame was dropped for it
    Busy,
}

/// The client's connection is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Destination for encoded multipart parts
pub trait FrameSink: Send {
    /// Queue `part` without waiting
    fn try_send(&self, part: Bytes) -> Result<SendOutcome, SinkClosed>;

    /// Whether the receiving side has gone away
    fn is_closed(&self) -> bool;
}

impl FrameSink for mpsc::Sender<Bytes> {
    fn try_send(&self, part: Bytes) -> Result<SendOutcome, SinkClosed> {
        match mpsc::Sender::try_send(self, part) {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(TrySendError::Full(_)) => Ok(SendOutcome::Busy),
            Err(TrySendError::Closed(_)) => Err(SinkClosed),
        }
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

/// Why a client was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The viewer closed the connection
    Disconnect,
    /// A broadcast write failed
    WriteError,
    /// Priming the new client with the cached frame failed
    InitialWriteError,
    /// A keep-alive write failed
    KeepaliveError,
    /// Found closed by the janitor
    DeadClient,
    /// The pipeline could not be started for this client
    StartFailed,
    /// The supervisor is shutting down
    Shutdown,
}

impl RemovalReason {
    /// Short name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnect => "disconnect",
            Self::WriteError => "write-error",
            Self::InitialWriteError => "initial-write-error",
            Self::KeepaliveError => "keepalive-error",
            Self::DeadClient => "dead-client",
            Self::StartFailed => "start-failed",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One connected client
struct ClientRegistration {
    sink: Box<dyn FrameSink>,
    /// Minimum spacing between frames, `None` for unthrottled
    min_interval: Option<Duration>,
    last_sent: Option<Instant>,
    keepalive: Option<JoinHandle<()>>,
}

impl ClientRegistration {
    /// Write a part, updating the last-sent time when it was queued
    fn send(&mut self, part: Bytes, now: Instant) -> Result<SendOutcome, SinkClosed> {
        let outcome = self.sink.try_send(part)?;
        if outcome == SendOutcome::Sent {
            self.last_sent = Some(now);
        }
        Ok(outcome)
    }

    fn throttled(&self, now: Instant) -> bool {
        match (self.min_interval, self.last_sent) {
            (Some(min), Some(last)) => now.duration_since(last) < min,
            _ => false,
        }
    }
}

impl Drop for ClientRegistration {
    fn drop(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
    }
}

/// Set of streaming clients plus the cached latest frame
#[derive(Default)]
pub struct Registry {
    clients: HashMap<ClientId, ClientRegistration>,
    latest: Option<Frame>,
    last_frame_at: Option<Instant>,
    frames_broadcast: u64,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, throttled to `max_fps` (0 = unlimited)
    ///
    /// A cached frame is written to the new client right away. Returns `None`
    /// if that write failed, in which case the client is not registered.
    pub fn add(&mut self, sink: Box<dyn FrameSink>, max_fps: u32) -> Option<ClientId> {
        let id = ClientId::next();
        let min_interval = (max_fps > 0).then(|| Duration::from_millis(1000) / max_fps);
        let mut registration = ClientRegistration {
            sink,
            min_interval,
            last_sent: None,
            keepalive: None,
        };

        if let Some(frame) = &self.latest {
            if registration.send(multipart_part(frame), Instant::now()).is_err() {
                warn!("{}: initial write failed, dropping client", id);
                info!(
                    "Client removed ({}). Remaining: {}",
                    RemovalReason::InitialWriteError,
                    self.clients.len()
                );
                return None;
            }
        }

        self.clients.insert(id, registration);
        info!(
            "Client connected. Total clients: {} (fps={})",
            self.clients.len(),
            if max_fps > 0 {
                max_fps.to_string()
            } else {
                "unlimited".to_string()
            }
        );
        Some(id)
    }

    /// Tie a keep-alive task to a client; it is aborted when the client goes
    pub fn attach_keepalive(&mut self, id: ClientId, task: JoinHandle<()>) {
        match self.clients.get_mut(&id) {
            Some(client) => {
                if let Some(old) = client.keepalive.replace(task) {
                    old.abort();
                }
            }
            None => task.abort(),
        }
    }

    /// Remove a client; returns false if it was not registered
    pub fn remove(&mut self, id: ClientId, reason: RemovalReason) -> bool {
        if self.clients.remove(&id).is_none() {
            return false;
        }
        info!(
            "Client removed ({}). Remaining: {}",
            reason,
            self.clients.len()
        );
        true
    }

    /// Cache `frame` and deliver it to every client not currently throttled
    ///
    /// Returns how many clients the frame was queued for.
    pub fn broadcast_latest(&mut self, frame: Frame) -> usize {
        let now = Instant::now();
        let part = multipart_part(&frame);
        self.latest = Some(frame);
        self.last_frame_at = Some(now);
        self.frames_broadcast += 1;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            if client.throttled(now) {
                continue;
            }
            match client.send(part.clone(), now) {
                Ok(SendOutcome::Sent) => delivered += 1,
                Ok(SendOutcome::Busy) => trace!("{}: queue full, frame dropped", id),
                Err(SinkClosed) => failed.push(*id),
            }
        }

        for id in failed {
            warn!("{}: write failed, dropping client", id);
            self.remove(id, RemovalReason::WriteError);
        }
        delivered
    }

    /// Re-send the cached frame to one client
    ///
    /// Returns false if there was nothing to send or the client is gone.
    pub fn keep_alive(&mut self, id: ClientId) -> bool {
        let Some(frame) = &self.latest else {
            return false;
        };
        let part = multipart_part(frame);
        let Some(client) = self.clients.get_mut(&id) else {
            return false;
        };

        match client.send(part, Instant::now()) {
            Ok(outcome) => {
                debug!("{}: keep-alive {:?}", id, outcome);
                outcome == SendOutcome::Sent
            }
            Err(SinkClosed) => {
                self.remove(id, RemovalReason::KeepaliveError);
                false
            }
        }
    }

    /// Remove every client whose connection has closed
    pub fn prune_dead(&mut self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.sink.is_closed())
            .map(|(id, _)| *id)
            .collect();

        if !dead.is_empty() {
            info!("Removing {} dead clients", dead.len());
        }
        for id in &dead {
            self.remove(*id, RemovalReason::DeadClient);
        }
        dead.len()
    }

    /// Remove every client
    pub fn clear(&mut self, reason: RemovalReason) {
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.remove(id, reason);
        }
    }

    /// Forget the cached frame
    pub fn clear_latest(&mut self) {
        self.latest = None;
        self.last_frame_at = None;
    }

    /// Most recently broadcast frame
    pub fn latest(&self) -> Option<&Frame> {
        self.latest.as_ref()
    }

    /// When the cached frame was broadcast
    pub fn last_frame_at(&self) -> Option<Instant> {
        self.last_frame_at
    }

    /// Total frames broadcast since creation
    pub fn frames_broadcast(&self) -> u64 {
        self.frames_broadcast
    }

    /// Number of registered clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client is registered
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Whether `id` is registered
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }
}
