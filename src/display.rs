//! Display collaborators.
//!
//! The pipeline only needs two things from a display: a sink per source to
//! hand annotated frames to, and a way to learn that the operator asked to
//! stop. `LogDisplay` renders to the log; `MemoryDisplay` records deliveries
//! for tests and run summaries.

use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::detect::BoundingBox;
use crate::frame::FrameSlot;
use crate::SourceId;

/// Per-source display destination.
pub trait DisplaySink: Send {
    /// Show one frame with the detections computed from it.
    fn show(&mut self, frame: &FrameSlot, boxes: &[BoundingBox]);

    /// Release the viewport. Called once, when the source is closed.
    fn close(&mut self) {}
}

pub trait Display: Send + Sync {
    fn register_sink(&self, source_id: SourceId) -> Result<Box<dyn DisplaySink>>;

    /// True once the operator asked the pipeline to stop.
    fn shutdown_requested(&self) -> bool;
}

/// Process-wide stop flag, raised by signal handlers or the display.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    raised: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

/// Renders detections as log lines.
///
/// Only the primary source is rendered per frame (at `debug`); other sinks are
/// headless and just count. Every sink logs a status line every `log_every`
/// frames.
pub struct LogDisplay {
    roster: Arc<Mutex<Roster>>,
    log_every: u64,
    signal: ShutdownSignal,
}

/// Which sources hold a sink, and which of them is rendered.
#[derive(Default)]
struct Roster {
    configured: Option<SourceId>,
    registered: BTreeSet<SourceId>,
}

impl Roster {
    /// The configured primary, else the lowest registered id.
    fn primary(&self) -> Option<SourceId> {
        self.configured
            .or_else(|| self.registered.iter().next().copied())
    }
}

fn lock_roster(roster: &Mutex<Roster>) -> MutexGuard<'_, Roster> {
    roster.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LogDisplay {
    /// `primary` of `None` renders the lowest-numbered registered source.
    pub fn new(primary: Option<SourceId>, log_every: u64, signal: ShutdownSignal) -> Self {
        Self {
            roster: Arc::new(Mutex::new(Roster {
                configured: primary,
                registered: BTreeSet::new(),
            })),
            log_every: log_every.max(1),
            signal,
        }
    }

    fn is_primary(&self, source_id: SourceId) -> bool {
        lock_roster(&self.roster).primary() == Some(source_id)
    }
}

impl Display for LogDisplay {
    fn register_sink(&self, source_id: SourceId) -> Result<Box<dyn DisplaySink>> {
        let primary = {
            let mut roster = lock_roster(&self.roster);
            roster.registered.insert(source_id);
            roster.primary()
        };
        log::info!(
            "LogDisplay: sink for {} ({})",
            source_id,
            if primary == Some(source_id) { "primary" } else { "headless" }
        );
        Ok(Box::new(LogSink {
            source_id,
            roster: Arc::clone(&self.roster),
            log_every: self.log_every,
            shown: 0,
            detections: 0,
        }))
    }

    fn shutdown_requested(&self) -> bool {
        self.signal.is_raised()
    }
}

struct LogSink {
    source_id: SourceId,
    roster: Arc<Mutex<Roster>>,
    log_every: u64,
    shown: u64,
    detections: u64,
}

impl DisplaySink for LogSink {
    fn show(&mut self, frame: &FrameSlot, boxes: &[BoundingBox]) {
        self.shown += 1;
        self.detections += boxes.len() as u64;
        if lock_roster(&self.roster).primary() == Some(self.source_id) {
            log::debug!(
                "{} seq={} {}x{} age={}ms boxes={:?}",
                self.source_id,
                frame.sequence,
                frame.width,
                frame.height,
                frame.age_ms(),
                boxes
                    .iter()
                    .map(|b| (b.class_id, (b.score * 100.0).round() / 100.0))
                    .collect::<Vec<_>>()
            );
        }
        if self.shown % self.log_every == 0 {
            log::info!(
                "{}: {} frames shown, {} detections, last seq {}",
                self.source_id,
                self.shown,
                self.detections,
                frame.sequence
            );
        }
    }

    fn close(&mut self) {
        lock_roster(&self.roster).registered.remove(&self.source_id);
        log::info!(
            "LogDisplay: {} closed after {} frames",
            self.source_id,
            self.shown
        );
    }
}

/// One frame handed to a `MemoryDisplay` sink.
#[derive(Clone, Debug, Serialize)]
pub struct Delivery {
    pub source_id: SourceId,
    pub sequence: u64,
    pub boxes: Vec<BoundingBox>,
}

#[derive(Default)]
struct MemoryState {
    deliveries: BTreeMap<SourceId, Vec<Delivery>>,
    registered: Vec<SourceId>,
    closed: BTreeSet<SourceId>,
}

/// Display that keeps every delivery in memory.
#[derive(Clone, Default)]
pub struct MemoryDisplay {
    state: Arc<Mutex<MemoryState>>,
    signal: ShutdownSignal,
}

impl MemoryDisplay {
    pub fn new(signal: ShutdownSignal) -> Self {
        Self {
            state: Arc::default(),
            signal,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn deliveries(&self, source_id: SourceId) -> Vec<Delivery> {
        self.with_state(|state| {
            state
                .deliveries
                .get(&source_id)
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn all_deliveries(&self) -> Vec<Delivery> {
        self.with_state(|state| state.deliveries.values().flatten().cloned().collect())
    }

    pub fn delivered_count(&self, source_id: SourceId) -> usize {
        self.with_state(|state| state.deliveries.get(&source_id).map_or(0, Vec::len))
    }

    pub fn total_delivered(&self) -> usize {
        self.with_state(|state| state.deliveries.values().map(Vec::len).sum())
    }

    /// Sources in registration order; a source appears again if re-registered.
    pub fn registered(&self) -> Vec<SourceId> {
        self.with_state(|state| state.registered.clone())
    }

    pub fn is_closed(&self, source_id: SourceId) -> bool {
        self.with_state(|state| state.closed.contains(&source_id))
    }
}

impl Display for MemoryDisplay {
    fn register_sink(&self, source_id: SourceId) -> Result<Box<dyn DisplaySink>> {
        self.with_state(|state| {
            state.registered.push(source_id);
            state.closed.remove(&source_id);
        });
        Ok(Box::new(MemorySink {
            source_id,
            state: Arc::clone(&self.state),
        }))
    }

    fn shutdown_requested(&self) -> bool {
        self.signal.is_raised()
    }
}

struct MemorySink {
    source_id: SourceId,
    state: Arc<Mutex<MemoryState>>,
}

impl DisplaySink for MemorySink {
    fn show(&mut self, frame: &FrameSlot, boxes: &[BoundingBox]) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state
            .deliveries
            .entry(self.source_id)
            .or_default()
            .push(Delivery {
                source_id: frame.source_id,
                sequence: frame.sequence,
                boxes: boxes.to_vec(),
            });
    }

    fn close(&mut self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.closed.insert(self.source_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_registered_source_is_primary() -> Result<()> {
        let display = LogDisplay::new(None, 10, ShutdownSignal::new());
        assert!(!display.is_primary(SourceId(0)));
        let _two = display.register_sink(SourceId(2))?;
        assert!(display.is_primary(SourceId(2)));

        let mut zero = display.register_sink(SourceId(0))?;
        assert!(display.is_primary(SourceId(0)));
        assert!(!display.is_primary(SourceId(2)));

        zero.close();
        assert!(display.is_primary(SourceId(2)));
        Ok(())
    }

    #[test]
    fn configured_primary_wins() -> Result<()> {
        let display = LogDisplay::new(Some(SourceId(1)), 10, ShutdownSignal::new());
        let _zero = display.register_sink(SourceId(0))?;
        assert!(!display.is_primary(SourceId(0)));
        assert!(display.is_primary(SourceId(1)));
        Ok(())
    }

    #[test]
    fn shutdown_signal_is_shared() {
        let signal = ShutdownSignal::new();
        let display = LogDisplay::new(None, 10, signal.clone());
        assert!(!display.shutdown_requested());
        signal.raise();
        assert!(display.shutdown_requested());
    }

    #[test]
    fn memory_display_records_and_closes() -> Result<()> {
        let display = MemoryDisplay::new(ShutdownSignal::new());
        let mut sink = display.register_sink(SourceId(4))?;
        sink.show(&FrameSlot::new(SourceId(4), 9, vec![0u8; 3], 1, 1), &[]);
        sink.close();

        let deliveries = display.deliveries(SourceId(4));
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].sequence, 9);
        assert!(display.is_closed(SourceId(4)));
        assert_eq!(display.registered(), vec![SourceId(4)]);
        Ok(())
    }
}
