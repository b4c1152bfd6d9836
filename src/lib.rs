//! Multi-camera inference pipeline.
//!
//! This crate feeds frames from any number of independent, unreliable cameras
//! into one shared inference accelerator that wants batches, and routes every
//! result back to the camera it came from.
//!
//! # Architecture
//!
//! The pipeline keeps four promises by construction:
//!
//! 1. **Latest frame only**: each camera publishes into a single-slot register.
//!    Old frames are replaced, never queued.
//! 2. **No cross-source stalls**: capture runs on one thread per camera and the
//!    tick loop never waits on camera I/O or on the accelerator.
//! 3. **Exact demultiplexing**: every result is paired with the frame it was
//!    computed from by `(source_id, sequence)`.
//! 4. **Fault isolation**: a failing camera changes its own state and nothing
//!    else.
//!
//! # Module Structure
//!
//! - `frame`: `FrameSlot` and the single-slot `LatestFrame` register
//! - `ingest`: capture devices (V4L2, synthetic `stub://` cameras)
//! - `source`: `SourceHandle` (capture thread) and `SourceRegistry` (health)
//! - `batch`: cross-source `BatchAssembler`
//! - `detect`: accelerator interface, backends, post-processing
//! - `dispatch`: asynchronous submission and result demultiplexing
//! - `router`, `metrics`, `display`: delivery to per-source sinks
//! - `pacing`, `controller`: tick loop, adaptive pacing and shutdown

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod batch;
pub mod config;
pub mod controller;
pub mod detect;
pub mod dispatch;
pub mod display;
pub mod frame;
pub mod ingest;
pub mod metrics;
pub mod pacing;
pub mod router;
pub mod source;

pub use batch::{BatchAssembler, BatchRequest, SlotTag};
pub use config::PipelineConfig;
pub use controller::{PipelineController, TickReport};
pub use detect::{
    Accelerator, AcceleratorRegistry, BatchImage, BoundingBox, CompletionCallback,
    CompletionToken, DetectionResult, RawDetections, StubAccelerator, StubConfig, StubControl,
};
#[cfg(feature = "backend-tract")]
pub use detect::{TractAccelerator, TractConfig};
pub use dispatch::{DispatchStats, DrainReport, InferenceDispatcher, SubmitOutcome};
pub use display::{Delivery, Display, DisplaySink, LogDisplay, MemoryDisplay, ShutdownSignal};
pub use frame::{FrameSlot, LatestFrame};
pub use ingest::{
    provider_for, CaptureDevice, CapturedFrame, DeviceProvider, SyntheticConfig, SyntheticControl,
    SyntheticProvider,
};
#[cfg(feature = "ingest-v4l2")]
pub use ingest::{V4l2Config, V4l2Provider};
pub use metrics::{MetricsSnapshot, PipelineMetrics, SourceHealth, SourceMetrics};
pub use pacing::{next_tick_interval, TickBounds};
pub use router::{ResultRouter, RouteOutcome};
pub use source::{
    CaptureStats, FrameSource, HealthReport, SourceHandle, SourceRegistry, SourceState,
};

/// Stable identifier of one capture device for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceId(pub u32);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "source:{}", self.0)
    }
}
