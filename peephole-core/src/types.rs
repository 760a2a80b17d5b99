//! Core types for Peephole
//!
//! Frames, device identifiers and the ids handed out for capture sessions
//! and streaming clients.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// JPEG start-of-image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);
static CLIENT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// One complete encoded JPEG image
///
/// Always starts with [`SOI`] and ends with [`EOI`]. Cloning is cheap, the
/// underlying buffer is reference counted and shared between every client
/// the frame is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    /// Wrap bytes that are known to be a complete JPEG image
    ///
    /// Returns `None` if the buffer does not start with SOI and end with EOI.
    pub fn new(data: impl Into<Bytes>) -> Option<Self> {
        let data = data.into();
        if data.len() >= 4 && data.starts_with(&SOI) && data.ends_with(&EOI) {
            Some(Self(data))
        } else {
            None
        }
    }

    /// Used by the extractor, which has already located both markers
    pub(crate) fn from_extracted(data: Bytes) -> Self {
        debug_assert!(data.starts_with(&SOI) && data.ends_with(&EOI));
        Self(data)
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Frames always hold at least both markers, so this is never true
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consume the frame, returning the encoded bytes
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Capture device identifier, e.g. `"0:none"`
///
/// The part before the first `:` is the video device index handed to the
/// capture binary. The rest is passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier from its string form
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier for a device index with no audio device attached
    pub fn from_index(index: u32) -> Self {
        Self(format!("{}:none", index))
    }

    /// Raw string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Text before the first separator
    pub fn index_str(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }

    /// Numeric video device index, if the identifier has one
    pub fn index(&self) -> Option<u32> {
        self.index_str().trim().parse().ok()
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::from_index(0)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("device identifier must not be empty".to_string());
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique id of one capture process instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate a new unique session id
    pub fn next() -> Self {
        Self(SESSION_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw id value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Unique id of one streaming client registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Allocate a new unique client id
    pub fn next() -> Self {
        Self(CLIENT_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw id value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_requires_markers() {
        assert!(Frame::new(vec![0xFF, 0xD8, 0x01, 0xFF, 0xD9]).is_some());
        assert!(Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9]).is_some());
        assert!(Frame::new(vec![0xFF, 0xD8, 0x01]).is_none());
        assert!(Frame::new(vec![0x00, 0xFF, 0xD8, 0xFF, 0xD9]).is_none());
        assert!(Frame::new(vec![0xFF, 0xD9]).is_none());
    }

    #[test]
    fn test_device_index() {
        assert_eq!(DeviceId::new("0:none").index(), Some(0));
        assert_eq!(DeviceId::new("12:3").index(), Some(12));
        assert_eq!(DeviceId::new("2").index(), Some(2));
        assert_eq!(DeviceId::new("cam:none").index(), None);
        assert_eq!(DeviceId::new("cam:none").index_str(), "cam");
        assert_eq!(DeviceId::from_index(1).as_str(), "1:none");
        assert_eq!(DeviceId::default().as_str(), "0:none");
    }

    #[test]
    fn test_device_from_str() {
        assert_eq!("  1:none ".parse::<DeviceId>().unwrap().as_str(), "1:none");
        assert!("".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(SessionId::next(), SessionId::next());
        assert_ne!(ClientId::next(), ClientId::next());
    }
}
