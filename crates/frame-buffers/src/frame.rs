use std::time::Instant;

use bytes::Bytes;

/// A captured image handed between pipeline stages.
///
/// The pixel payload is reference counted, so cloning a frame (or the `Arc`
/// that usually wraps it) never copies image data.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw pixel data in the capture device's native layout.
    pub data: Bytes,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Monotonic sequence number assigned by the capture stage.
    pub seq: u64,
    /// When the frame was read from the device.
    pub captured_at: Instant,
}

impl Frame {
    /// Create a frame stamped with the current instant.
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, seq: u64) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            seq,
            captured_at: Instant::now(),
        }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Time elapsed since capture.
    pub fn age(&self) -> std::time::Duration {
        self.captured_at.elapsed()
    }
}
