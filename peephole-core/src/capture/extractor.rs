//! JPEG frame extraction from a raw MJPEG byte stream
//!
//! The capture process writes back-to-back JPEG images to stdout with no
//! container framing. Frames are recovered by scanning for the SOI/EOI
//! markers; anything outside a marker pair is discarded.

use bytes::{Buf, BytesMut};

use crate::types::{EOI, Frame, SOI};

/// Incremental frame splitter for one capture session
///
/// Feed stdout chunks in arrival order with [`push`](Self::push). The
/// internal buffer never holds more than one in-flight frame plus the most
/// recent chunk.
#[derive(Debug, Default)]
pub struct FrameExtractor {
    buf: BytesMut,
    /// Bytes of an in-progress frame already searched for EOI
    scanned: usize,
}

impl FrameExtractor {
    /// Create an empty extractor
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buf, SOI, 0) else {
                // Keep a trailing 0xFF, it may be the first half of an SOI
                let keep = usize::from(self.buf.last() == Some(&SOI[0]));
                let drop = self.buf.len() - keep;
                self.buf.advance(drop);
                self.scanned = 0;
                break;
            };

            // Resume the EOI search where the previous chunk left off
            let from = if start == 0 {
                self.scanned.max(2)
            } else {
                start + 2
            };

            let Some(end) = find_marker(&self.buf, EOI, from) else {
                if start > 0 {
                    self.buf.advance(start);
                }
                // The last byte may be the first half of an EOI
                self.scanned = self.buf.len().saturating_sub(1).max(2);
                break;
            };

            let mut frame = self.buf.split_to(end + 2);
            frame.advance(start);
            self.scanned = 0;
            frames.push(Frame::from_extracted(frame.freeze()));
        }

        frames
    }

    /// Bytes retained for the next chunk
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }
}

fn find_marker(haystack: &[u8], marker: [u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == marker)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut data = SOI.to_vec();
        data.extend_from_slice(body);
        data.extend_from_slice(&EOI);
        data
    }

    #[test]
    fn test_single_frame_in_one_chunk() {
        let mut extractor = FrameExtractor::new();
        let frames = extractor.push(&jpeg(b"abc"));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), jpeg(b"abc").as_slice());
        assert_eq!(extractor.buffered(), 0);
    }

    #[test]
    fn test_no_start_marker_discards_everything() {
        let mut extractor = FrameExtractor::new();
        assert!(extractor.push(b"garbage without markers").is_empty());
        assert_eq!(extractor.buffered(), 0);
        assert!(extractor.push(&[0x00, 0xFF, 0xD9, 0x12]).is_empty());
        assert_eq!(extractor.buffered(), 0);
    }

    #[test]
    fn test_leading_garbage_is_skipped() {
        let mut extractor = FrameExtractor::new();
        let mut stream = b"noise".to_vec();
        stream.extend_from_slice(&jpeg(b"x"));
        let frames = extractor.push(&stream);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), jpeg(b"x").as_slice());
    }

    #[test]
    fn test_partial_frame_is_retained_from_start_marker() {
        let mut extractor = FrameExtractor::new();
        let mut stream = b"zz".to_vec();
        stream.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3]);
        assert!(extractor.push(&stream).is_empty());
        assert_eq!(extractor.buffered(), 5);

        let frames = extractor.push(&[4, 0xFF, 0xD9]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), &[0xFF, 0xD8, 1, 2, 3, 4, 0xFF, 0xD9]);
    }

    #[test]
    fn test_end_marker_split_across_chunks() {
        let mut extractor = FrameExtractor::new();
        assert!(extractor.push(&[0xFF, 0xD8, 7, 0xFF]).is_empty());
        let frames = extractor.push(&[0xD9]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), &[0xFF, 0xD8, 7, 0xFF, 0xD9]);
    }

    #[test]
    fn test_start_marker_split_across_chunks() {
        let mut extractor = FrameExtractor::new();
        assert!(extractor.push(&[9, 9, 0xFF]).is_empty());
        assert_eq!(extractor.buffered(), 1);
        let frames = extractor.push(&[0xD8, 5, 0xFF, 0xD9]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref(), &[0xFF, 0xD8, 5, 0xFF, 0xD9]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut extractor = FrameExtractor::new();
        let mut stream = jpeg(b"one");
        stream.extend_from_slice(&jpeg(b"two"));
        stream.extend_from_slice(&jpeg(b"three"));
        let frames = extractor.push(&stream);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].as_ref(), jpeg(b"three").as_slice());
    }

    #[test]
    fn test_end_marker_must_follow_start_marker() {
        // SOI immediately followed by D9 must not be read as SOI+EOI overlap
        let mut extractor = FrameExtractor::new();
        assert!(extractor.push(&[0xFF, 0xD8, 0xD9]).is_empty());
        assert_eq!(extractor.buffered(), 3);
    }

    #[test]
    fn test_reset_clears_partial_frame() {
        let mut extractor = FrameExtractor::new();
        extractor.push(&[0xFF, 0xD8, 1, 2]);
        extractor.reset();
        assert_eq!(extractor.buffered(), 0);
        assert!(extractor.push(&[3, 0xFF, 0xD9]).is_empty());
    }
}
