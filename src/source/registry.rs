use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{CaptureStats, SourceHandle, SourceState};
use crate::config::{CaptureSettings, RecoverySettings};
use crate::ingest::{CaptureDevice, DeviceProvider};
use crate::SourceId;

type ProbeOutcome = Result<Box<dyn CaptureDevice>>;

/// State changes observed by one `poll_health` pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Sources that delivered their first frame since the last poll.
    pub newly_streaming: Vec<SourceId>,
    /// Sources that crossed the failure threshold.
    pub newly_disconnected: Vec<SourceId>,
    /// Sources that gave up reconnecting.
    pub closed: Vec<SourceId>,
    /// Sources in `Streaming` after this pass.
    pub live: usize,
}

impl HealthReport {
    pub fn is_idle(&self) -> bool {
        self.live == 0
    }
}

struct PendingProbe {
    receiver: Receiver<ProbeOutcome>,
    started_at: Instant,
}

struct SourceEntry {
    path: String,
    state: SourceState,
    handle: Option<Arc<SourceHandle>>,
    /// Last sequence handed out, carried across reconnects.
    last_sequence: u64,
    backoff: Duration,
    next_retry_at: Option<Instant>,
    attempts: u32,
    probe: Option<PendingProbe>,
}

/// Owns every `SourceHandle` and supervises its health.
///
/// The registry is driven from the tick loop: `discover()` at start (and while
/// idle), `poll_health()` once per tick. Neither call blocks on a camera except
/// `discover`, which bounds each open-and-grab probe by the probe timeout.
/// Reconnect probes run on their own threads and are only polled.
pub struct SourceRegistry {
    provider: Arc<dyn DeviceProvider>,
    capture: CaptureSettings,
    recovery: RecoverySettings,
    ids_by_path: HashMap<String, SourceId>,
    next_id: u32,
    entries: BTreeMap<SourceId, SourceEntry>,
}

impl SourceRegistry {
    pub fn new(
        provider: Arc<dyn DeviceProvider>,
        capture: CaptureSettings,
        recovery: RecoverySettings,
    ) -> Self {
        Self {
            provider,
            capture,
            recovery,
            ids_by_path: HashMap::new(),
            next_id: 0,
            entries: BTreeMap::new(),
        }
    }

    fn id_for(&mut self, path: &str) -> SourceId {
        if let Some(id) = self.ids_by_path.get(path) {
            return *id;
        }
        let id = SourceId(self.next_id);
        self.next_id += 1;
        self.ids_by_path.insert(path.to_string(), id);
        id
    }

    /// Probe every unknown candidate and start capture on the ones that work.
    ///
    /// A candidate must open and return one frame within the probe timeout.
    /// Probes run concurrently; a probe still stuck at the deadline is
    /// abandoned and its path excluded until the next discovery. Paths already
    /// known to the registry are left to `poll_health`, except `Closed` ones:
    /// those are probed again and, when they answer, reopen under the same id
    /// with their sequence continuing where it stopped.
    pub fn discover(&mut self) -> Vec<SourceId> {
        let candidates: Vec<String> = self
            .provider
            .candidates()
            .into_iter()
            .filter(|path| {
                self.ids_by_path.get(path.as_str()).map_or(true, |id| {
                    self.entries
                        .get(id)
                        .map_or(true, |entry| entry.state == SourceState::Closed)
                })
            })
            .collect();
        if candidates.is_empty() {
            log::debug!("SourceRegistry: no new capture devices found");
            return Vec::new();
        }

        let mut probes = Vec::with_capacity(candidates.len());
        for path in candidates {
            let id = self.id_for(&path);
            let closed_at = self.entries.get(&id).map(|entry| entry.last_sequence);
            let resume_sequence = closed_at.unwrap_or(0);
            self.entries.insert(
                id,
                SourceEntry {
                    path: path.clone(),
                    state: SourceState::Discovering,
                    handle: None,
                    last_sequence: resume_sequence,
                    backoff: self.recovery.backoff_initial,
                    next_retry_at: None,
                    attempts: 0,
                    probe: None,
                },
            );
            let receiver = spawn_probe(Arc::clone(&self.provider), path.clone());
            probes.push((id, path, closed_at.is_some(), receiver));
        }

        let deadline = Instant::now() + self.capture.probe_timeout;
        let mut found = Vec::new();
        for (id, path, reopening, receiver) in probes {
            let wait = deadline.saturating_duration_since(Instant::now());
            let outcome = match receiver.recv_timeout(wait) {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow!(
                    "no frame within {:?}",
                    self.capture.probe_timeout
                )),
            };
            let resume_sequence = self.entries.get(&id).map_or(0, |entry| entry.last_sequence);
            match outcome.and_then(|device| self.start_capture(id, device, resume_sequence)) {
                Ok(handle) => {
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.handle = Some(handle);
                        entry.state = SourceState::Open;
                    }
                    if reopening {
                        log::info!(
                            "SourceRegistry: {} reopened at {}, resuming after seq {}",
                            id,
                            path,
                            resume_sequence
                        );
                    } else {
                        log::info!("SourceRegistry: {} discovered at {}", id, path);
                    }
                    found.push(id);
                }
                Err(err) if reopening => {
                    log::debug!("SourceRegistry: {} still unavailable: {:#}", path, err);
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.state = SourceState::Closed;
                    }
                }
                Err(err) => {
                    log::warn!("SourceRegistry: excluding {}: {:#}", path, err);
                    self.entries.remove(&id);
                }
            }
        }
        found
    }

    fn start_capture(
        &self,
        id: SourceId,
        device: Box<dyn CaptureDevice>,
        resume_sequence: u64,
    ) -> Result<Arc<SourceHandle>> {
        let handle = SourceHandle::spawn(
            id,
            device,
            self.capture.failure_backoff,
            resume_sequence,
        )?;
        Ok(Arc::new(handle))
    }

    /// Advance every source's lifecycle by one step. Never blocks.
    pub fn poll_health(&mut self, now: Instant) -> HealthReport {
        let mut report = HealthReport::default();
        let ids: Vec<SourceId> = self.entries.keys().copied().collect();
        for id in ids {
            let Some(state) = self.entries.get(&id).map(|entry| entry.state) else {
                continue;
            };
            match state {
                SourceState::Open | SourceState::Streaming => {
                    self.check_capture(id, now, &mut report)
                }
                SourceState::Disconnected => self.maybe_retry(id, now, &mut report),
                SourceState::Reconnecting => self.check_probe(id, now),
                SourceState::Discovering | SourceState::Closed => {}
            }
        }
        report.live = self.live_count();
        report
    }

    fn check_capture(&mut self, id: SourceId, now: Instant, report: &mut HealthReport) {
        let threshold = self.capture.failure_threshold;
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let Some(handle) = entry.handle.as_ref() else {
            entry.state = SourceState::Disconnected;
            entry.next_retry_at = Some(now);
            return;
        };

        let failures = handle.consecutive_failures();
        if failures >= threshold || handle.is_finished() {
            entry.last_sequence = handle.last_sequence();
            handle.stop();
            entry.handle = None;
            entry.state = SourceState::Disconnected;
            entry.backoff = self.recovery.backoff_initial;
            entry.next_retry_at = Some(now + entry.backoff);
            log::warn!(
                "SourceRegistry: {} disconnected after {} consecutive capture failures",
                id,
                failures
            );
            report.newly_disconnected.push(id);
        } else if entry.state == SourceState::Open && handle.has_frame() {
            entry.state = SourceState::Streaming;
            log::info!("SourceRegistry: {} streaming from {}", id, entry.path);
            report.newly_streaming.push(id);
        }
    }

    fn maybe_retry(&mut self, id: SourceId, now: Instant, report: &mut HealthReport) {
        let max_attempts = self.recovery.max_reconnect_attempts;
        let provider = Arc::clone(&self.provider);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.next_retry_at.is_some_and(|at| at > now) {
            return;
        }
        if max_attempts.is_some_and(|max| entry.attempts >= max) {
            entry.state = SourceState::Closed;
            log::warn!(
                "SourceRegistry: {} closed after {} reconnect attempts",
                id,
                entry.attempts
            );
            report.closed.push(id);
            return;
        }

        entry.attempts += 1;
        entry.state = SourceState::Reconnecting;
        entry.probe = Some(PendingProbe {
            receiver: spawn_probe(provider, entry.path.clone()),
            started_at: now,
        });
        log::debug!(
            "SourceRegistry: {} reconnect attempt {} on {}",
            id,
            entry.attempts,
            entry.path
        );
    }

    fn check_probe(&mut self, id: SourceId, now: Instant) {
        let probe_timeout = self.capture.probe_timeout;
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let Some(probe) = entry.probe.as_ref() else {
            entry.state = SourceState::Disconnected;
            return;
        };

        let outcome = match probe.receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(TryRecvError::Empty) => {
                if now.saturating_duration_since(probe.started_at) < probe_timeout {
                    return;
                }
                Err(anyhow!("no frame within {:?}", probe_timeout))
            }
            Err(TryRecvError::Disconnected) => Err(anyhow!("probe thread exited")),
        };
        entry.probe = None;
        let resume_sequence = entry.last_sequence;

        let started = outcome.and_then(|device| self.start_capture(id, device, resume_sequence));
        let jitter = self.jitter();
        let backoff_max = self.recovery.backoff_max;
        let backoff_initial = self.recovery.backoff_initial;
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        match started {
            Ok(handle) => {
                log::info!(
                    "SourceRegistry: {} reconnected on {} after {} attempt(s)",
                    id,
                    entry.path,
                    entry.attempts
                );
                entry.handle = Some(handle);
                entry.state = SourceState::Open;
                entry.attempts = 0;
                entry.backoff = backoff_initial;
                entry.next_retry_at = None;
            }
            Err(err) => {
                entry.backoff = (entry.backoff * 2).min(backoff_max);
                entry.next_retry_at = Some(now + entry.backoff + jitter);
                entry.state = SourceState::Disconnected;
                log::debug!(
                    "SourceRegistry: {} reconnect failed ({:#}), next try in {:?}",
                    id,
                    err,
                    entry.backoff
                );
            }
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.recovery.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Streaming sources in id order. Only these may contribute to batches.
    pub fn streaming_sources(&self) -> Vec<Arc<SourceHandle>> {
        self.entries
            .values()
            .filter(|entry| entry.state == SourceState::Streaming)
            .filter_map(|entry| entry.handle.clone())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.state == SourceState::Streaming)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, id: SourceId) -> Option<SourceState> {
        self.entries.get(&id).map(|entry| entry.state)
    }

    pub fn states(&self) -> Vec<(SourceId, SourceState)> {
        self.entries
            .iter()
            .map(|(id, entry)| (*id, entry.state))
            .collect()
    }

    pub fn path(&self, id: SourceId) -> Option<&str> {
        self.entries.get(&id).map(|entry| entry.path.as_str())
    }

    pub fn stats(&self, id: SourceId) -> Option<CaptureStats> {
        self.entries
            .get(&id)
            .and_then(|entry| entry.handle.as_ref())
            .map(|handle| handle.stats())
    }

    /// Close one source for good.
    pub fn close(&mut self, id: SourceId, timeout: Duration) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&id)
            .with_context(|| format!("unknown source {}", id))?;
        entry.state = SourceState::Closed;
        entry.probe = None;
        if let Some(handle) = entry.handle.take() {
            entry.last_sequence = handle.last_sequence();
            if !handle.release(timeout) {
                log::warn!("SourceRegistry: {} capture thread did not exit in time", id);
            }
        }
        Ok(())
    }

    /// Stop every capture thread and wait up to `timeout` for them in total.
    ///
    /// Returns the number of threads still blocked in a grab at the deadline;
    /// those are detached.
    pub fn close_all(&mut self, timeout: Duration) -> usize {
        let handles: Vec<Arc<SourceHandle>> = self
            .entries
            .values_mut()
            .filter_map(|entry| {
                entry.state = SourceState::Closed;
                entry.probe = None;
                let handle = entry.handle.take()?;
                entry.last_sequence = handle.last_sequence();
                Some(handle)
            })
            .collect();
        for handle in &handles {
            handle.stop();
        }

        let deadline = Instant::now() + timeout;
        let mut stuck = 0;
        for handle in &handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !handle.release(remaining) {
                log::warn!(
                    "SourceRegistry: {} capture thread still blocked, detaching",
                    handle.id()
                );
                stuck += 1;
            }
        }
        log::info!(
            "SourceRegistry: released {} source(s), {} detached",
            handles.len() - stuck,
            stuck
        );
        stuck
    }
}

/// Open `path` and grab one frame on a throwaway thread.
fn spawn_probe(provider: Arc<dyn DeviceProvider>, path: String) -> Receiver<ProbeOutcome> {
    let (sender, receiver) = bounded(1);
    let spawned = thread::Builder::new()
        .name("source-probe".to_string())
        .spawn(move || {
            let outcome = probe_device(provider.as_ref(), &path);
            // The registry may have given up on this probe; the device is
            // dropped with the unsent outcome.
            let _ = sender.send(outcome);
        });
    if let Err(err) = spawned {
        log::error!("SourceRegistry: failed to spawn probe thread: {}", err);
    }
    receiver
}

fn probe_device(provider: &dyn DeviceProvider, path: &str) -> ProbeOutcome {
    let mut device = provider
        .open(path)
        .with_context(|| format!("open {}", path))?;
    device
        .grab()
        .with_context(|| format!("first frame from {}", path))?;
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::ingest::{SyntheticConfig, SyntheticProvider};

    fn settings() -> (CaptureSettings, RecoverySettings) {
        let cfg = PipelineConfig::default();
        let mut capture = cfg.capture;
        capture.failure_threshold = 3;
        capture.failure_backoff = Duration::from_millis(2);
        capture.probe_timeout = Duration::from_millis(300);
        let mut recovery = cfg.recovery;
        recovery.backoff_initial = Duration::from_millis(10);
        recovery.backoff_max = Duration::from_millis(40);
        recovery.jitter = Duration::ZERO;
        (capture, recovery)
    }

    fn synthetic(count: usize) -> Arc<SyntheticProvider> {
        Arc::new(SyntheticProvider::new(
            count,
            SyntheticConfig {
                width: 8,
                height: 6,
                target_fps: 200,
            },
        ))
    }

    fn registry(provider: &Arc<SyntheticProvider>) -> SourceRegistry {
        let (capture, recovery) = settings();
        let provider: Arc<dyn DeviceProvider> = provider.clone();
        SourceRegistry::new(provider, capture, recovery)
    }

    fn poll_until(
        registry: &mut SourceRegistry,
        timeout: Duration,
        mut done: impl FnMut(&SourceRegistry) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            registry.poll_health(Instant::now());
            if done(registry) {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn discover_excludes_devices_that_cannot_produce_a_frame() {
        let provider = synthetic(3);
        provider
            .control("stub://cam1")
            .expect("control")
            .set_failing(true);
        let mut registry = registry(&provider);

        let found = registry.discover();
        assert_eq!(found, vec![SourceId(0), SourceId(2)]);
        assert_eq!(registry.path(SourceId(2)), Some("stub://cam2"));
        assert_eq!(registry.state(SourceId(1)), None);
        assert_eq!(registry.state(SourceId(0)), Some(SourceState::Open));
        assert_eq!(registry.close_all(Duration::from_secs(1)), 0);
    }

    #[test]
    fn stalled_probe_is_abandoned_at_the_deadline() {
        let provider = synthetic(2);
        let control = provider.control("stub://cam0").expect("control");
        control.set_stalled(true);
        let mut registry = registry(&provider);

        let started = Instant::now();
        let found = registry.discover();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(found.len(), 1);
        assert_eq!(registry.path(found[0]), Some("stub://cam1"));
        control.set_stalled(false);
        registry.close_all(Duration::from_secs(1));
    }

    #[test]
    fn open_sources_become_streaming() {
        let provider = synthetic(2);
        let mut registry = registry(&provider);
        registry.discover();
        assert!(poll_until(&mut registry, Duration::from_secs(2), |r| r
            .live_count()
            == 2));
        let ids: Vec<SourceId> = registry
            .streaming_sources()
            .iter()
            .map(|handle| handle.id())
            .collect();
        assert_eq!(ids, vec![SourceId(0), SourceId(1)]);
        registry.close_all(Duration::from_secs(1));
    }

    #[test]
    fn failing_source_disconnects_and_reconnects_with_continued_sequence() {
        let provider = synthetic(2);
        let control = provider.control("stub://cam1").expect("control");
        let mut registry = registry(&provider);
        registry.discover();
        assert!(poll_until(&mut registry, Duration::from_secs(2), |r| r
            .live_count()
            == 2));

        control.set_failing(true);
        assert!(poll_until(&mut registry, Duration::from_secs(2), |r| r
            .state(SourceId(1))
            != Some(SourceState::Streaming)));
        assert_eq!(registry.live_count(), 1);
        assert_eq!(registry.state(SourceId(0)), Some(SourceState::Streaming));
        let sequence_before = registry.entries[&SourceId(1)].last_sequence;
        assert!(sequence_before > 0);

        control.set_failing(false);
        assert!(poll_until(&mut registry, Duration::from_secs(3), |r| r
            .state(SourceId(1))
            == Some(SourceState::Streaming)));
        let resumed = registry
            .streaming_sources()
            .into_iter()
            .find(|handle| handle.id() == SourceId(1))
            .expect("reconnected handle");
        let frame = resumed.latest().expect("frame after reconnect");
        assert!(frame.sequence > sequence_before);
        registry.close_all(Duration::from_secs(1));
    }

    #[test]
    fn removed_device_is_retried_at_a_capped_rate() {
        let provider = synthetic(1);
        let control = provider.control("stub://cam0").expect("control");
        let mut registry = registry(&provider);
        registry.discover();
        assert!(poll_until(&mut registry, Duration::from_secs(2), |r| r
            .live_count()
            == 1));

        control.set_removed(true);
        assert!(poll_until(&mut registry, Duration::from_secs(2), |r| {
            r.entries[&SourceId(0)].attempts >= 3
        }));
        let entry = &registry.entries[&SourceId(0)];
        assert!(entry.backoff <= Duration::from_millis(40));
        assert_ne!(registry.state(SourceId(0)), Some(SourceState::Closed));

        control.set_removed(false);
        assert!(poll_until(&mut registry, Duration::from_secs(3), |r| r
            .live_count()
            == 1));
        registry.close_all(Duration::from_secs(1));
    }

    #[test]
    fn exhausted_reconnects_close_the_source() {
        let provider = synthetic(1);
        let control = provider.control("stub://cam0").expect("control");
        let (capture, mut recovery) = settings();
        recovery.max_reconnect_attempts = Some(2);
        let dyn_provider: Arc<dyn DeviceProvider> = provider.clone();
        let mut registry = SourceRegistry::new(dyn_provider, capture, recovery);
        registry.discover();
        assert!(poll_until(&mut registry, Duration::from_secs(2), |r| r
            .live_count()
            == 1));

        control.set_removed(true);
        assert!(poll_until(&mut registry, Duration::from_secs(3), |r| r
            .state(SourceId(0))
            == Some(SourceState::Closed)));
        assert!(registry.streaming_sources().is_empty());
    }

    #[test]
    fn rediscovery_keeps_ids_stable() {
        let provider = synthetic(2);
        let control = provider.control("stub://cam0").expect("control");
        control.set_failing(true);
        let mut registry = registry(&provider);
        assert_eq!(registry.discover(), vec![SourceId(1)]);

        control.set_failing(false);
        assert_eq!(registry.discover(), vec![SourceId(0)]);
        assert!(registry.discover().is_empty());
        assert_eq!(registry.len(), 2);
        registry.close_all(Duration::from_secs(1));
    }

    #[test]
    fn closed_source_reopens_under_its_old_id() {
        let provider = synthetic(2);
        let control = provider.control("stub://cam0").expect("control");
        let (capture, mut recovery) = settings();
        recovery.max_reconnect_attempts = Some(1);
        let dyn_provider: Arc<dyn DeviceProvider> = provider.clone();
        let mut registry = SourceRegistry::new(dyn_provider, capture, recovery);
        registry.discover();
        assert!(poll_until(&mut registry, Duration::from_secs(2), |r| r
            .live_count()
            == 2));

        control.set_removed(true);
        assert!(poll_until(&mut registry, Duration::from_secs(3), |r| r
            .state(SourceId(0))
            == Some(SourceState::Closed)));
        let closed_at = registry.entries[&SourceId(0)].last_sequence;
        assert!(closed_at > 0);
        assert!(registry.discover().is_empty());

        // Back in enumeration but not yet delivering: stays closed.
        control.set_failing(true);
        control.set_removed(false);
        assert!(registry.discover().is_empty());
        assert_eq!(registry.state(SourceId(0)), Some(SourceState::Closed));
        assert_eq!(registry.entries[&SourceId(0)].last_sequence, closed_at);

        control.set_failing(false);
        assert_eq!(registry.discover(), vec![SourceId(0)]);
        assert_eq!(registry.len(), 2);
        assert!(poll_until(&mut registry, Duration::from_secs(2), |r| r
            .state(SourceId(0))
            == Some(SourceState::Streaming)));
        let reopened = registry
            .streaming_sources()
            .into_iter()
            .find(|handle| handle.id() == SourceId(0))
            .expect("reopened handle");
        let frame = reopened.latest().expect("frame after reopen");
        assert!(frame.sequence > closed_at);
        registry.close_all(Duration::from_secs(1));
    }

    #[test]
    fn explicit_close_remembers_the_last_sequence() -> Result<()> {
        let provider = synthetic(1);
        let mut registry = registry(&provider);
        registry.discover();
        assert!(poll_until(&mut registry, Duration::from_secs(2), |r| r
            .live_count()
            == 1));
        registry.close(SourceId(0), Duration::from_secs(1))?;
        assert!(registry.entries[&SourceId(0)].last_sequence > 0);

        assert_eq!(registry.discover(), vec![SourceId(0)]);
        registry.close_all(Duration::from_secs(1));
        Ok(())
    }
}
