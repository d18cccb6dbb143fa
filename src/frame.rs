//! Captured frame container.
//!
//! - `Frame`: Immutable pixel buffer with capture metadata. Cheap to clone (shared ownership).
//! - `FrameSlot`: Single-occupant "latest frame" cell shared between the capture loop and readers.
//!
//! A frame's bytes are never mutated after construction. Every holder (event subscriber,
//! latest-frame slot, inference worker) owns a reference; the buffer is freed when the last
//! holder drops it. There is no manual dispose path.

use anyhow::{anyhow, Result};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

/// Bytes per pixel for all supported capture formats.
pub const BYTES_PER_PIXEL: usize = 4;

/// Pixel layout of a captured buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Blue, green, red, alpha. The layout produced by compositor capture paths.
    Bgra8,
    /// Red, green, blue, alpha. The layout produced by most pixel-copy paths.
    Rgba8,
}

impl PixelFormat {
    /// Byte offsets of the (red, green, blue) channels within one pixel.
    pub fn rgb_offsets(self) -> (usize, usize, usize) {
        match self {
            PixelFormat::Bgra8 => (2, 1, 0),
            PixelFormat::Rgba8 => (0, 1, 2),
        }
    }
}

// ----------------------------------------------------------------------------
// Frame: shared immutable pixel buffer
// ----------------------------------------------------------------------------

struct FrameData {
    pixels: Box<[u8]>,
    format: PixelFormat,
    width: u32,
    height: u32,
    stride: usize,
    captured_at: SystemTime,
    sequence: u64,
    capture_started: Instant,
}

/// One captured frame.
///
/// Cloning a `Frame` clones the reference, not the pixels.
#[derive(Clone)]
pub struct Frame {
    inner: Arc<FrameData>,
}

impl Frame {
    /// Build a frame from a raw capture.
    ///
    /// `stride` is the byte length of one row and must be at least `width * 4`.
    /// `capture_started` is the instant the capture call began, for latency accounting.
    pub fn new(
        pixels: Vec<u8>,
        format: PixelFormat,
        width: u32,
        height: u32,
        stride: usize,
        sequence: u64,
        capture_started: Instant,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("frame dimensions must be non-zero ({}x{})", width, height));
        }
        let row_bytes = (width as usize)
            .checked_mul(BYTES_PER_PIXEL)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if stride < row_bytes {
            return Err(anyhow!(
                "frame stride {} is smaller than row length {}",
                stride,
                row_bytes
            ));
        }
        let expected = stride
            .checked_mul(height as usize - 1)
            .and_then(|v| v.checked_add(row_bytes))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() < expected {
            return Err(anyhow!(
                "frame buffer too small: expected at least {} bytes, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            inner: Arc::new(FrameData {
                pixels: pixels.into_boxed_slice(),
                format,
                width,
                height,
                stride,
                captured_at: SystemTime::now(),
                sequence,
                capture_started,
            }),
        })
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn stride(&self) -> usize {
        self.inner.stride
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }

    /// Monotonic sequence id assigned by the frame source.
    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    /// Wall-clock capture time.
    pub fn captured_at(&self) -> SystemTime {
        self.inner.captured_at
    }

    /// High-resolution instant at which the capture call started.
    pub fn capture_started(&self) -> Instant {
        self.inner.capture_started
    }

    /// Read-only pixel bytes, `stride` bytes per row.
    pub fn pixels(&self) -> &[u8] {
        &self.inner.pixels
    }

    /// One row of pixels, without stride padding.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.inner.stride;
        let end = start + self.inner.width as usize * BYTES_PER_PIXEL;
        &self.inner.pixels[start..end]
    }

    /// Number of live references to this frame's buffer.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.inner.sequence)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("format", &self.inner.format)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameSlot: latest-frame cell
// ----------------------------------------------------------------------------

/// Holds at most one frame: the most recent one.
///
/// `store` releases the previous occupant; `latest` hands out a new reference.
/// Readers and the writer may race freely since no reader ever sees a buffer being freed.
#[derive(Default)]
pub struct FrameSlot {
    current: Mutex<Option<Frame>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the occupant. The previous frame is released here (or later by other holders).
    pub fn store(&self, frame: Frame) {
        let previous = {
            let mut guard = self.current.lock().unwrap_or_else(|e| e.into_inner());
            guard.replace(frame)
        };
        drop(previous);
    }

    /// Most recent frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Release the occupant.
    pub fn clear(&self) {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(previous);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(sequence: u64) -> Frame {
        Frame::new(
            vec![sequence as u8; 4 * 4 * 2],
            PixelFormat::Bgra8,
            4,
            2,
            16,
            sequence,
            Instant::now(),
        )
        .expect("frame")
    }

    #[test]
    fn frame_rejects_short_buffer() {
        let result = Frame::new(vec![0u8; 10], PixelFormat::Bgra8, 4, 2, 16, 0, Instant::now());
        assert!(result.is_err());
    }

    #[test]
    fn frame_rejects_stride_smaller_than_row() {
        let result = Frame::new(vec![0u8; 64], PixelFormat::Rgba8, 4, 2, 8, 0, Instant::now());
        assert!(result.is_err());
    }

    #[test]
    fn frame_row_skips_stride_padding() -> Result<()> {
        let mut pixels = vec![0u8; 24 * 2];
        pixels[24..40].fill(7);
        let frame = Frame::new(pixels, PixelFormat::Bgra8, 4, 2, 24, 1, Instant::now())?;
        assert_eq!(frame.row(1), &[7u8; 16]);
        assert_eq!(frame.row(0).len(), 16);
        Ok(())
    }

    #[test]
    fn clones_share_buffer() {
        let frame = make_test_frame(3);
        let other = frame.clone();
        assert_eq!(frame.holders(), 2);
        assert!(std::ptr::eq(frame.pixels().as_ptr(), other.pixels().as_ptr()));
    }

    #[test]
    fn slot_releases_previous_occupant() {
        let slot = FrameSlot::new();
        let first = make_test_frame(1);
        slot.store(first.clone());
        assert_eq!(first.holders(), 2);

        slot.store(make_test_frame(2));
        assert_eq!(first.holders(), 1);
        assert_eq!(slot.latest().map(|f| f.sequence()), Some(2));
    }

    #[test]
    fn reader_reference_outlives_replacement() {
        let slot = FrameSlot::new();
        slot.store(make_test_frame(1));
        let held = slot.latest().expect("frame");
        slot.store(make_test_frame(2));
        slot.clear();
        assert_eq!(held.sequence(), 1);
        assert_eq!(held.pixels()[0], 1);
        assert!(slot.latest().is_none());
    }
}
