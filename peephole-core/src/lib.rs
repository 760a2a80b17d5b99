//! Peephole Core Library
//!
//! Low-latency camera preview over plain HTTP.
//!
//! This library provides:
//! - Capture through an external ffmpeg process, split into JPEG frames
//! - Fan-out of frames to any number of MJPEG viewers
//! - A supervisor that restarts stalled capture and switches devices
//!   without dropping viewers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │ ffmpeg (MJPEG)  │───▶│ Frame Extractor │───▶│ Broadcast       │──▶ viewers
//! │ stdout chunks   │    │ SOI..EOI        │    │ Registry        │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          ▲                                             │
//!          └────────────── Pipeline Supervisor ◀─────────┘
//!                   (watchdog, janitor, hot swap)
//! ```

pub mod capture;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod still;
pub mod types;

pub use config::{ConfigFile, PeepholeConfig, PipelineTimings};
pub use error::{PeepholeError, Result};
pub use pipeline::{PipelineState, PipelineStatus, Supervisor, SupervisorHandle};
pub use types::{ClientId, DeviceId, Frame, SessionId};
