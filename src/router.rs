//! Delivery of detection results to per-source sinks.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::MetricsSettings;
use crate::detect::DetectionResult;
use crate::display::DisplaySink;
use crate::frame::FrameSlot;
use crate::metrics::{MetricsSampler, MetricsSnapshot, PipelineMetrics};
use crate::SourceId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RouteOutcome {
    /// Shown on the source's sink and counted.
    Delivered,
    /// No sink for the source any more. Dropped silently.
    Discarded,
    /// Older than a result already shown for the source. Dropped.
    OutOfOrder,
}

struct SinkEntry {
    sink: Box<dyn DisplaySink>,
    last_sequence: Option<u64>,
    closed: bool,
}

/// Routes each `DetectionResult` to its source's sink and owns the pipeline
/// metrics.
///
/// Sinks are registered and deregistered in step with source lifecycle. Each
/// sink has its own lock, so a slow sink only delays its own source. Within a
/// source, results reach the sink in non-decreasing sequence order; a result
/// that would regress is dropped.
pub struct ResultRouter {
    sinks: Mutex<HashMap<SourceId, Arc<Mutex<SinkEntry>>>>,
    metrics: Arc<PipelineMetrics>,
    settings: MetricsSettings,
    sampler: Mutex<Option<MetricsSampler>>,
}

impl ResultRouter {
    pub fn new(settings: &MetricsSettings) -> Self {
        Self {
            sinks: Mutex::new(HashMap::new()),
            metrics: Arc::new(PipelineMetrics::new(settings)),
            settings: settings.clone(),
            sampler: Mutex::new(None),
        }
    }

    /// Start periodic FPS sampling and dashboard logging.
    pub fn start_sampler(&self) -> Result<()> {
        let mut sampler = self
            .sampler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if sampler.is_none() {
            *sampler = Some(
                self.metrics
                    .spawn_sampler(self.settings.sample_interval, self.settings.report_interval)?,
            );
        }
        Ok(())
    }

    /// Read-only access for the controller and telemetry.
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Attach a sink. A sink already registered for the source is closed first.
    pub fn register_sink(&self, source_id: SourceId, sink: Box<dyn DisplaySink>) {
        let entry = Arc::new(Mutex::new(SinkEntry {
            sink,
            last_sequence: None,
            closed: false,
        }));
        let previous = self.lock_sinks().insert(source_id, entry);
        if let Some(previous) = previous {
            close_entry(&previous);
        }
        log::debug!("ResultRouter: sink registered for {}", source_id);
    }

    /// Detach and close a source's sink. Late results for it are discarded.
    pub fn deregister_sink(&self, source_id: SourceId) -> bool {
        let removed = self.lock_sinks().remove(&source_id);
        match removed {
            Some(entry) => {
                close_entry(&entry);
                log::debug!("ResultRouter: sink closed for {}", source_id);
                true
            }
            None => false,
        }
    }

    pub fn has_sink(&self, source_id: SourceId) -> bool {
        self.lock_sinks().contains_key(&source_id)
    }

    pub fn sink_count(&self) -> usize {
        self.lock_sinks().len()
    }

    /// Deliver one result together with the frame it was computed from.
    pub fn route(&self, result: DetectionResult, frame: &FrameSlot) -> RouteOutcome {
        let entry = self.lock_sinks().get(&result.source_id).cloned();
        let Some(entry) = entry else {
            log::debug!(
                "ResultRouter: no sink for {}, discarding seq {}",
                result.source_id,
                result.sequence
            );
            return RouteOutcome::Discarded;
        };

        {
            let mut entry = entry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if entry.closed {
                return RouteOutcome::Discarded;
            }
            if entry.last_sequence.is_some_and(|last| result.sequence < last) {
                log::debug!(
                    "ResultRouter: {} seq {} arrived after seq {:?}, dropping",
                    result.source_id,
                    result.sequence,
                    entry.last_sequence
                );
                return RouteOutcome::OutOfOrder;
            }
            entry.sink.show(frame, &result.boxes);
            entry.last_sequence = Some(result.sequence);
        }

        self.metrics
            .record(result.source_id, result.boxes.len(), Instant::now());
        RouteOutcome::Delivered
    }

    /// Stop sampling, close every sink and return the final metrics.
    pub fn shutdown(&self) -> MetricsSnapshot {
        let sampler = self
            .sampler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut sampler) = sampler {
            sampler.stop();
        }

        let entries: Vec<Arc<Mutex<SinkEntry>>> =
            self.lock_sinks().drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            close_entry(entry);
        }

        self.metrics.sample(Instant::now());
        self.metrics.log_dashboard();
        self.metrics.snapshot()
    }

    fn lock_sinks(&self) -> std::sync::MutexGuard<'_, HashMap<SourceId, Arc<Mutex<SinkEntry>>>> {
        self.sinks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn close_entry(entry: &Mutex<SinkEntry>) {
    let mut entry = entry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if !entry.closed {
        entry.closed = true;
        entry.sink.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::display::{Display, MemoryDisplay, ShutdownSignal};

    fn router() -> ResultRouter {
        ResultRouter::new(&PipelineConfig::default().metrics)
    }

    fn frame(source: u32, sequence: u64) -> FrameSlot {
        FrameSlot::new(SourceId(source), sequence, vec![0u8; 3], 1, 1)
    }

    fn result(source: u32, sequence: u64) -> DetectionResult {
        DetectionResult {
            source_id: SourceId(source),
            sequence,
            boxes: Vec::new(),
        }
    }

    #[test]
    fn delivers_to_the_matching_sink_and_counts_once() -> Result<()> {
        let router = router();
        let display = MemoryDisplay::new(ShutdownSignal::new());
        router.register_sink(SourceId(0), display.register_sink(SourceId(0))?);
        router.register_sink(SourceId(1), display.register_sink(SourceId(1))?);

        assert_eq!(router.route(result(1, 3), &frame(1, 3)), RouteOutcome::Delivered);
        assert_eq!(display.delivered_count(SourceId(1)), 1);
        assert_eq!(display.delivered_count(SourceId(0)), 0);
        assert_eq!(router.metrics().frames_processed(), 1);
        Ok(())
    }

    #[test]
    fn missing_sink_discards_without_counting() {
        let router = router();
        assert_eq!(router.route(result(7, 1), &frame(7, 1)), RouteOutcome::Discarded);
        assert_eq!(router.metrics().frames_processed(), 0);
    }

    #[test]
    fn deregistered_sink_is_closed_and_late_results_dropped() -> Result<()> {
        let router = router();
        let display = MemoryDisplay::new(ShutdownSignal::new());
        router.register_sink(SourceId(2), display.register_sink(SourceId(2))?);
        assert!(router.deregister_sink(SourceId(2)));
        assert!(display.is_closed(SourceId(2)));
        assert!(!router.deregister_sink(SourceId(2)));
        assert_eq!(router.route(result(2, 5), &frame(2, 5)), RouteOutcome::Discarded);
        Ok(())
    }

    #[test]
    fn regressing_sequence_is_dropped_but_duplicates_pass() -> Result<()> {
        let router = router();
        let display = MemoryDisplay::new(ShutdownSignal::new());
        router.register_sink(SourceId(0), display.register_sink(SourceId(0))?);

        assert_eq!(router.route(result(0, 5), &frame(0, 5)), RouteOutcome::Delivered);
        assert_eq!(router.route(result(0, 5), &frame(0, 5)), RouteOutcome::Delivered);
        assert_eq!(router.route(result(0, 4), &frame(0, 4)), RouteOutcome::OutOfOrder);
        assert_eq!(router.route(result(0, 6), &frame(0, 6)), RouteOutcome::Delivered);

        let sequences: Vec<u64> = display
            .deliveries(SourceId(0))
            .iter()
            .map(|delivery| delivery.sequence)
            .collect();
        assert_eq!(sequences, vec![5, 5, 6]);
        assert_eq!(router.metrics().frames_processed(), 3);
        Ok(())
    }

    #[test]
    fn shutdown_closes_every_sink() -> Result<()> {
        let router = router();
        let display = MemoryDisplay::new(ShutdownSignal::new());
        router.start_sampler()?;
        for id in 0..3 {
            router.register_sink(SourceId(id), display.register_sink(SourceId(id))?);
        }
        router.route(result(0, 1), &frame(0, 1));

        let snapshot = router.shutdown();
        assert_eq!(snapshot.frames_processed, 1);
        assert_eq!(router.sink_count(), 0);
        assert!((0..3).all(|id| display.is_closed(SourceId(id))));
        Ok(())
    }
}
