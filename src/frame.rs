//! Frame slots and the single-slot latest-frame register.
//!
//! - `FrameSlot`: one captured frame, tagged with its source and sequence.
//! - `LatestFrame`: the register a capture thread publishes into. It holds at
//!   most one frame; publishing replaces the previous one, which is dropped if
//!   nobody read it.
//!
//! Pixel buffers are immutable and shared (`Arc<[u8]>`), so handing a slot to
//! the batch assembler, the accelerator and the display never copies pixels.

use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::time::Instant;

use crate::SourceId;

/// One captured frame. Cloning is cheap: the pixel buffer is shared.
#[derive(Clone, Debug)]
pub struct FrameSlot {
    pub source_id: SourceId,
    /// Per-source capture counter. Strictly increases with every successful
    /// capture, including across reconnects of the same device.
    pub sequence: u64,
    /// Monotonic capture instant.
    pub captured_at: Instant,
    /// Packed RGB24 pixels.
    pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
}

impl FrameSlot {
    pub fn new(
        source_id: SourceId,
        sequence: u64,
        pixels: impl Into<Arc<[u8]>>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            source_id,
            sequence,
            captured_at: Instant::now(),
            pixels: pixels.into(),
            width,
            height,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Shared handle to the pixel buffer.
    pub fn shared_pixels(&self) -> Arc<[u8]> {
        Arc::clone(&self.pixels)
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Milliseconds since capture.
    pub fn age_ms(&self) -> u128 {
        self.captured_at.elapsed().as_millis()
    }
}

/// Single-slot register holding the newest frame of one source.
///
/// One writer (the capture thread) replaces the slot; any number of readers
/// copy it out. Reads never block on the writer and never clear the slot, so
/// two reads with no capture in between return the same frame.
#[derive(Default)]
pub struct LatestFrame {
    slot: ArcSwapOption<FrameSlot>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held frame. The previous frame is dropped, not queued.
    pub fn publish(&self, frame: FrameSlot) {
        self.slot.store(Some(Arc::new(frame)));
    }

    /// Non-blocking read of the current frame, `None` before the first capture.
    pub fn latest(&self) -> Option<FrameSlot> {
        self.slot.load_full().map(|frame| (*frame).clone())
    }

    pub fn is_empty(&self) -> bool {
        self.slot.load().is_none()
    }
}
