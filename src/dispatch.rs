//! Asynchronous batch submission and result demultiplexing.
//!
//! The tick loop calls `submit`, which hands the batch to the accelerator and
//! returns at once. The accelerator's completion callback runs on a thread
//! the dispatcher does not own, so it does nothing but post a message. The
//! dispatcher's own completion thread picks the message up, pairs output `i`
//! with slot `i` of the pending request and forwards each result to the
//! `ResultRouter`.
//!
//! The pending table is the only state shared between the two sides. It is
//! inserted into on submit, erased from on completion before any result is
//! routed, and guarded by one mutex. `submit` holds that mutex across the accelerator call, so a
//! completion that fires before `submit` returns still finds its record.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::batch::{BatchRequest, SlotTag};
use crate::detect::{Accelerator, BatchImage, CompletionToken, DetectionResult, RawDetections};
use crate::frame::FrameSlot;
use crate::router::{ResultRouter, RouteOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SubmitOutcome {
    /// Accepted by the accelerator; results arrive later.
    Submitted(CompletionToken),
    /// Refused by the accelerator. The batch is dropped, not retried.
    Rejected,
    /// Not offered: the in-flight cap is reached or the dispatcher is draining.
    Skipped,
}

/// What `drain` waited for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Requests that completed during the wait.
    pub completed: usize,
    /// Requests still pending at the deadline; their results will be ignored.
    pub abandoned: usize,
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct DispatchStats {
    pub submitted: u64,
    pub rejected: u64,
    pub skipped: u64,
    /// Batches whose completion reported a hardware error or a wrong count.
    pub failed: u64,
    pub completed: u64,
    /// Images whose output arrays disagreed in length.
    pub malformed: u64,
    pub routed: u64,
    pub discarded: u64,
}

struct PendingRequest {
    request_id: u64,
    slots: Vec<FrameSlot>,
    submitted_at: Instant,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    completed: AtomicU64,
    malformed: AtomicU64,
    routed: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<CompletionToken, PendingRequest>>,
    resolved: Condvar,
    counters: Counters,
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<CompletionToken, PendingRequest>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Message {
    Completed {
        token: CompletionToken,
        outcome: Result<Vec<RawDetections>>,
    },
    Shutdown,
}

pub struct InferenceDispatcher {
    accelerator: Arc<dyn Accelerator>,
    shared: Arc<Shared>,
    sender: Sender<Message>,
    worker: Mutex<Option<JoinHandle<()>>>,
    max_in_flight: usize,
    accepting: AtomicBool,
}

impl InferenceDispatcher {
    pub fn new(
        accelerator: Arc<dyn Accelerator>,
        router: Arc<ResultRouter>,
        max_in_flight: usize,
    ) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared::default());
        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("dispatch-completions".to_string())
                .spawn(move || completion_loop(&receiver, &shared, &router))
                .context("spawn completion thread")?
        };
        log::info!(
            "InferenceDispatcher: using accelerator '{}', max {} in flight",
            accelerator.name(),
            max_in_flight
        );
        Ok(Self {
            accelerator,
            shared,
            sender,
            worker: Mutex::new(Some(worker)),
            max_in_flight: max_in_flight.max(1),
            accepting: AtomicBool::new(true),
        })
    }

    /// Offer a batch to the accelerator without waiting for inference.
    ///
    /// Ownership of the batch's frames moves into the pending table until the
    /// completion is processed or abandoned.
    pub fn submit(&self, batch: BatchRequest) -> SubmitOutcome {
        let counters = &self.shared.counters;
        if !self.accepting.load(Ordering::SeqCst) {
            counters.skipped.fetch_add(1, Ordering::SeqCst);
            return SubmitOutcome::Skipped;
        }

        let mut pending = self.shared.lock_pending();
        if pending.len() >= self.max_in_flight {
            counters.skipped.fetch_add(1, Ordering::SeqCst);
            log::debug!(
                "InferenceDispatcher: {} requests in flight, skipping batch {}",
                pending.len(),
                batch.request_id
            );
            return SubmitOutcome::Skipped;
        }

        let images = batch
            .slots
            .iter()
            .map(|slot| BatchImage {
                pixels: slot.shared_pixels(),
                width: slot.width,
                height: slot.height,
            })
            .collect();
        let sender = self.sender.clone();
        let on_complete = Box::new(move |token, outcome| {
            // The dispatcher may already be gone; the result is then moot.
            let _ = sender.send(Message::Completed { token, outcome });
        });

        match self.accelerator.submit(images, on_complete) {
            Ok(token) => {
                log::debug!(
                    "InferenceDispatcher: batch {} ({} slots) submitted as {}",
                    batch.request_id,
                    batch.slots.len(),
                    token
                );
                pending.insert(
                    token,
                    PendingRequest {
                        request_id: batch.request_id,
                        slots: batch.slots,
                        submitted_at: Instant::now(),
                    },
                );
                counters.submitted.fetch_add(1, Ordering::SeqCst);
                SubmitOutcome::Submitted(token)
            }
            Err(err) => {
                counters.rejected.fetch_add(1, Ordering::SeqCst);
                log::warn!(
                    "InferenceDispatcher: batch {} rejected: {:#}",
                    batch.request_id,
                    err
                );
                SubmitOutcome::Rejected
            }
        }
    }

    /// Whether a batch offered now would reach the accelerator.
    pub fn has_capacity(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && self.in_flight() < self.max_in_flight
    }

    /// Count a tick whose batch was withheld because `has_capacity` said no.
    pub fn record_skip(&self) {
        self.shared.counters.skipped.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "InferenceDispatcher: {} requests in flight, skipping tick",
            self.in_flight()
        );
    }

    pub fn in_flight(&self) -> usize {
        self.shared.lock_pending().len()
    }

    /// Slot tags of every pending request, oldest first.
    pub fn pending_tags(&self) -> Vec<(u64, Vec<SlotTag>)> {
        let pending = self.shared.lock_pending();
        let mut requests: Vec<&PendingRequest> = pending.values().collect();
        requests.sort_by_key(|request| request.request_id);
        requests
            .into_iter()
            .map(|request| {
                (
                    request.request_id,
                    request.slots.iter().map(SlotTag::from).collect(),
                )
            })
            .collect()
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.shared.counters;
        DispatchStats {
            submitted: c.submitted.load(Ordering::SeqCst),
            rejected: c.rejected.load(Ordering::SeqCst),
            skipped: c.skipped.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::SeqCst),
            malformed: c.malformed.load(Ordering::SeqCst),
            routed: c.routed.load(Ordering::SeqCst),
            discarded: c.discarded.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting batches and wait up to `timeout` for in-flight ones.
    ///
    /// Requests still pending at the deadline are abandoned: their records
    /// and frames are released and a late completion is ignored.
    pub fn drain(&self, timeout: Duration) -> DrainReport {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.lock_pending();
        let initial = pending.len();

        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            pending = match self.shared.resolved.wait_timeout(pending, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        let abandoned = pending.len();
        for (token, request) in pending.drain() {
            log::warn!(
                "InferenceDispatcher: abandoning batch {} ({}), in flight for {:?}",
                request.request_id,
                token,
                request.submitted_at.elapsed()
            );
        }
        let report = DrainReport {
            completed: initial.saturating_sub(abandoned),
            abandoned,
        };
        log::info!(
            "InferenceDispatcher: drained {} request(s), abandoned {}",
            report.completed,
            report.abandoned
        );
        report
    }

    /// Stop the completion thread. Later completions are dropped.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let _ = self.sender.send(Message::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                log::error!("InferenceDispatcher: completion thread panicked");
            }
        }
    }
}

impl Drop for InferenceDispatcher {
    fn drop(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
    }
}

fn completion_loop(receiver: &Receiver<Message>, shared: &Shared, router: &ResultRouter) {
    for message in receiver.iter() {
        match message {
            Message::Completed { token, outcome } => {
                handle_completion(shared, router, token, outcome)
            }
            Message::Shutdown => break,
        }
    }
    log::debug!("InferenceDispatcher: completion thread exited");
}

fn handle_completion(
    shared: &Shared,
    router: &ResultRouter,
    token: CompletionToken,
    outcome: Result<Vec<RawDetections>>,
) {
    // Resolve the record first so a drain waiting on it counts this request
    // as completed, even while its results are still being routed.
    let record = shared.lock_pending().remove(&token);
    shared.resolved.notify_all();
    let Some(PendingRequest {
        request_id, slots, ..
    }) = record
    else {
        log::debug!("InferenceDispatcher: ignoring completion for unknown {}", token);
        return;
    };

    let counters = &shared.counters;
    match outcome {
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            log::warn!(
                "InferenceDispatcher: batch {} failed, dropping {} results: {:#}",
                request_id,
                slots.len(),
                err
            );
        }
        Ok(outputs) if outputs.len() != slots.len() => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            log::warn!(
                "InferenceDispatcher: batch {} returned {} outputs for {} images, dropping",
                request_id,
                outputs.len(),
                slots.len()
            );
        }
        Ok(outputs) => {
            counters.completed.fetch_add(1, Ordering::SeqCst);
            for (slot, raw) in slots.iter().zip(outputs) {
                let Some(boxes) = raw.into_boxes() else {
                    counters.malformed.fetch_add(1, Ordering::SeqCst);
                    log::warn!(
                        "InferenceDispatcher: malformed output for {} seq {} in batch {}",
                        slot.source_id,
                        slot.sequence,
                        request_id
                    );
                    continue;
                };
                let result = DetectionResult {
                    source_id: slot.source_id,
                    sequence: slot.sequence,
                    boxes,
                };
                match router.route(result, slot) {
                    RouteOutcome::Delivered => counters.routed.fetch_add(1, Ordering::SeqCst),
                    RouteOutcome::Discarded | RouteOutcome::OutOfOrder => {
                        counters.discarded.fetch_add(1, Ordering::SeqCst)
                    }
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::detect::{BoundingBox, CompletionCallback, StubAccelerator, StubConfig};
    use crate::display::{Display, DisplaySink, MemoryDisplay, ShutdownSignal};
    use crate::SourceId;
    use anyhow::anyhow;
    use crossbeam_channel::bounded;

    fn batch(request_id: u64, sources: &[(u32, u64)]) -> BatchRequest {
        BatchRequest {
            request_id,
            slots: sources
                .iter()
                .map(|(id, sequence)| FrameSlot::new(SourceId(*id), *sequence, vec![*sequence as u8; 12], 2, 2))
                .collect(),
        }
    }

    fn setup(
        accelerator: Arc<dyn Accelerator>,
        max_in_flight: usize,
        sources: u32,
    ) -> Result<(InferenceDispatcher, Arc<ResultRouter>, MemoryDisplay)> {
        let router = Arc::new(ResultRouter::new(&PipelineConfig::default().metrics));
        let display = MemoryDisplay::new(ShutdownSignal::new());
        for id in 0..sources {
            router.register_sink(SourceId(id), display.register_sink(SourceId(id))?);
        }
        let dispatcher = InferenceDispatcher::new(accelerator, Arc::clone(&router), max_in_flight)?;
        Ok((dispatcher, router, display))
    }

    fn stub(latency_ms: u64) -> Result<Arc<StubAccelerator>> {
        Ok(Arc::new(StubAccelerator::new(StubConfig {
            latency: Duration::from_millis(latency_ms),
            ..StubConfig::default()
        })?))
    }

    fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    /// Completes synchronously inside `submit`, with scripted outputs.
    struct InlineAccelerator {
        outputs: Mutex<Vec<Result<Vec<RawDetections>>>>,
        next: AtomicU64,
    }

    impl Accelerator for InlineAccelerator {
        fn name(&self) -> &'static str {
            "inline"
        }

        fn submit(
            &self,
            _batch: Vec<BatchImage>,
            on_complete: CompletionCallback,
        ) -> Result<CompletionToken> {
            let token = CompletionToken(self.next.fetch_add(1, Ordering::SeqCst));
            let outcome = self
                .outputs
                .lock()
                .expect("outputs")
                .pop()
                .unwrap_or_else(|| Err(anyhow!("no scripted output")));
            on_complete(token, outcome);
            Ok(token)
        }
    }

    fn raw(count: usize) -> RawDetections {
        RawDetections {
            boxes: vec![[0.0, 0.0, 1.0, 1.0]; count],
            scores: vec![0.9; count],
            class_ids: vec![1; count],
        }
    }

    #[test]
    fn results_reach_the_source_they_came_from() -> Result<()> {
        let (dispatcher, router, display) = setup(stub(1)?, 2, 3)?;
        let outcome = dispatcher.submit(batch(1, &[(0, 4), (1, 9), (2, 2)]));
        assert!(matches!(outcome, SubmitOutcome::Submitted(_)));

        assert!(wait_for(Duration::from_secs(2), || router
            .metrics()
            .frames_processed()
            == 3));
        assert_eq!(display.deliveries(SourceId(0))[0].sequence, 4);
        assert_eq!(display.deliveries(SourceId(1))[0].sequence, 9);
        assert_eq!(display.deliveries(SourceId(2))[0].sequence, 2);
        assert!(display
            .all_deliveries()
            .iter()
            .all(|delivery| delivery.source_id.0 <= 2));
        assert_eq!(dispatcher.in_flight(), 0);
        dispatcher.shutdown();
        Ok(())
    }

    #[test]
    fn completion_before_submit_returns_is_still_matched() -> Result<()> {
        let accelerator = Arc::new(InlineAccelerator {
            outputs: Mutex::new(vec![Ok(vec![raw(2), raw(0)])]),
            next: AtomicU64::new(1),
        });
        let (dispatcher, router, display) = setup(accelerator, 2, 2)?;
        dispatcher.submit(batch(1, &[(0, 1), (1, 1)]));
        assert!(wait_for(Duration::from_secs(2), || router
            .metrics()
            .frames_processed()
            == 2));
        assert_eq!(display.deliveries(SourceId(0))[0].boxes.len(), 2);
        assert!(display.deliveries(SourceId(1))[0].boxes.is_empty());
        dispatcher.shutdown();
        Ok(())
    }

    #[test]
    fn hardware_error_drops_the_whole_batch() -> Result<()> {
        let accelerator = stub(1)?;
        accelerator.control().fail_next(1);
        let (dispatcher, router, display) = setup(accelerator.clone(), 2, 2)?;

        dispatcher.submit(batch(1, &[(0, 1), (1, 1)]));
        assert!(wait_for(Duration::from_secs(2), || dispatcher.stats().failed == 1));
        assert!(wait_for(Duration::from_secs(2), || dispatcher.in_flight() == 0));
        assert_eq!(display.total_delivered(), 0);
        assert_eq!(router.metrics().frames_processed(), 0);

        dispatcher.submit(batch(2, &[(0, 2), (1, 2)]));
        assert!(wait_for(Duration::from_secs(2), || router
            .metrics()
            .frames_processed()
            == 2));
        dispatcher.shutdown();
        Ok(())
    }

    #[test]
    fn wrong_output_count_is_a_batch_failure() -> Result<()> {
        let accelerator = Arc::new(InlineAccelerator {
            outputs: Mutex::new(vec![Ok(vec![raw(1)])]),
            next: AtomicU64::new(1),
        });
        let (dispatcher, _router, display) = setup(accelerator, 2, 2)?;
        dispatcher.submit(batch(1, &[(0, 1), (1, 1)]));
        assert!(wait_for(Duration::from_secs(2), || dispatcher.stats().failed == 1));
        assert_eq!(display.total_delivered(), 0);
        dispatcher.shutdown();
        Ok(())
    }

    #[test]
    fn malformed_image_output_only_drops_that_image() -> Result<()> {
        let mut bad = raw(2);
        bad.scores.pop();
        let accelerator = Arc::new(InlineAccelerator {
            outputs: Mutex::new(vec![Ok(vec![bad, raw(1)])]),
            next: AtomicU64::new(1),
        });
        let (dispatcher, _router, display) = setup(accelerator, 2, 2)?;
        dispatcher.submit(batch(1, &[(0, 1), (1, 1)]));
        assert!(wait_for(Duration::from_secs(2), || dispatcher.stats().malformed == 1));
        assert!(wait_for(Duration::from_secs(2), || display.total_delivered() == 1));
        assert_eq!(display.delivered_count(SourceId(1)), 1);
        dispatcher.shutdown();
        Ok(())
    }

    #[test]
    fn rejected_batch_is_dropped_without_retry() -> Result<()> {
        let accelerator = stub(1)?;
        accelerator.control().reject_next(1);
        let (dispatcher, _router, _display) = setup(accelerator, 2, 1)?;
        assert_eq!(dispatcher.submit(batch(1, &[(0, 1)])), SubmitOutcome::Rejected);
        assert_eq!(dispatcher.in_flight(), 0);
        assert_eq!(dispatcher.stats().rejected, 1);
        dispatcher.shutdown();
        Ok(())
    }

    #[test]
    fn in_flight_cap_skips_without_blocking() -> Result<()> {
        let accelerator = stub(1)?;
        accelerator.control().set_paused(true);
        let (dispatcher, _router, _display) = setup(accelerator.clone(), 1, 1)?;

        assert!(matches!(
            dispatcher.submit(batch(1, &[(0, 1)])),
            SubmitOutcome::Submitted(_)
        ));
        let started = Instant::now();
        assert_eq!(dispatcher.submit(batch(2, &[(0, 2)])), SubmitOutcome::Skipped);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(dispatcher.pending_tags()[0].0, 1);

        accelerator.control().set_paused(false);
        assert!(wait_for(Duration::from_secs(2), || dispatcher.in_flight() == 0));
        dispatcher.shutdown();
        Ok(())
    }

    #[test]
    fn drain_waits_for_completions() -> Result<()> {
        let (dispatcher, router, _display) = setup(stub(20)?, 2, 2)?;
        dispatcher.submit(batch(1, &[(0, 1)]));
        dispatcher.submit(batch(2, &[(1, 1)]));
        let report = dispatcher.drain(Duration::from_secs(2));
        assert_eq!(report, DrainReport { completed: 2, abandoned: 0 });
        assert_eq!(router.metrics().frames_processed(), 2);
        assert_eq!(dispatcher.submit(batch(3, &[(0, 2)])), SubmitOutcome::Skipped);
        dispatcher.shutdown();
        Ok(())
    }

    #[test]
    fn drain_abandons_requests_past_the_deadline() -> Result<()> {
        let accelerator = stub(1)?;
        accelerator.control().set_paused(true);
        let (dispatcher, router, _display) = setup(accelerator.clone(), 2, 1)?;
        dispatcher.submit(batch(1, &[(0, 1)]));

        let started = Instant::now();
        let report = dispatcher.drain(Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report, DrainReport { completed: 0, abandoned: 1 });
        assert_eq!(dispatcher.in_flight(), 0);

        // The late completion finds no record and is ignored.
        accelerator.control().set_paused(false);
        assert!(wait_for(Duration::from_secs(2), || accelerator.control().completed() == 1));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(router.metrics().frames_processed(), 0);
        dispatcher.shutdown();
        Ok(())
    }

    /// Blocks in `show` until released.
    struct GatedSink {
        entered: Sender<()>,
        release: Receiver<()>,
    }

    impl DisplaySink for GatedSink {
        fn show(&mut self, _frame: &FrameSlot, _boxes: &[BoundingBox]) {
            let _ = self.entered.send(());
            let _ = self.release.recv_timeout(Duration::from_secs(5));
        }
    }

    #[test]
    fn drain_does_not_abandon_a_request_whose_results_are_routing() -> Result<()> {
        let (dispatcher, router, _display) = setup(stub(1)?, 2, 0)?;
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        router.register_sink(
            SourceId(0),
            Box::new(GatedSink {
                entered: entered_tx,
                release: release_rx,
            }),
        );

        dispatcher.submit(batch(1, &[(0, 1)]));
        entered_rx.recv_timeout(Duration::from_secs(2))?;
        assert_eq!(dispatcher.in_flight(), 0);

        let report = dispatcher.drain(Duration::from_millis(50));
        assert_eq!(report.abandoned, 0);

        release_tx.send(())?;
        assert!(wait_for(Duration::from_secs(2), || router
            .metrics()
            .frames_processed()
            == 1));
        dispatcher.shutdown();
        Ok(())
    }

    #[test]
    fn capacity_tracks_the_in_flight_cap_and_draining() -> Result<()> {
        let accelerator = stub(1)?;
        accelerator.control().set_paused(true);
        let (dispatcher, _router, _display) = setup(accelerator.clone(), 1, 1)?;
        assert!(dispatcher.has_capacity());

        dispatcher.submit(batch(1, &[(0, 1)]));
        assert!(!dispatcher.has_capacity());
        dispatcher.record_skip();
        assert_eq!(dispatcher.stats().skipped, 1);

        accelerator.control().set_paused(false);
        assert!(wait_for(Duration::from_secs(2), || dispatcher.has_capacity()));
        dispatcher.drain(Duration::from_secs(1));
        assert!(!dispatcher.has_capacity());
        dispatcher.shutdown();
        Ok(())
    }
}
