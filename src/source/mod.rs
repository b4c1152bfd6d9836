//! Sources: one capture thread per camera plus the registry that supervises them.

mod handle;
mod registry;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::frame::FrameSlot;
use crate::SourceId;

pub use handle::{CaptureStats, SourceHandle};
pub use registry::{HealthReport, SourceRegistry};

/// Lifecycle of one source.
///
/// `Discovering → Open → Streaming`; capture failures move a source to
/// `Disconnected`, re-open probes run in `Reconnecting`, and `Closed` is final.
/// Only `Streaming` sources contribute frames to batches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SourceState {
    Discovering,
    Open,
    Streaming,
    Disconnected,
    Reconnecting,
    Closed,
}

impl SourceState {
    pub fn label(self) -> &'static str {
        match self {
            SourceState::Discovering => "discovering",
            SourceState::Open => "open",
            SourceState::Streaming => "streaming",
            SourceState::Disconnected => "disconnected",
            SourceState::Reconnecting => "reconnecting",
            SourceState::Closed => "closed",
        }
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Anything the batch assembler can pull a latest frame from.
pub trait FrameSource {
    fn source_id(&self) -> SourceId;

    /// Newest frame, without consuming it.
    fn latest(&self) -> Option<FrameSlot>;
}

impl<T: FrameSource + ?Sized> FrameSource for Arc<T> {
    fn source_id(&self) -> SourceId {
        (**self).source_id()
    }

    fn latest(&self) -> Option<FrameSlot> {
        (**self).latest()
    }
}
