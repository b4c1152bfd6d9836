//! The tick loop.
//!
//! Each tick: advance source health, keep sinks in step with source
//! lifecycle, assemble one batch from the streaming sources and hand it to the
//! dispatcher. A tick never waits on a camera or on inference; the only
//! blocking calls are discovery (at start and while idle) and the shutdown
//! drain.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::batch::{BatchAssembler, SlotTag};
use crate::config::PipelineConfig;
use crate::detect::{Accelerator, AcceleratorRegistry};
use crate::dispatch::{DispatchStats, InferenceDispatcher, SubmitOutcome};
use crate::display::{Display, ShutdownSignal};
use crate::ingest::{provider_for, DeviceProvider};
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::pacing::next_tick_interval;
use crate::router::ResultRouter;
use crate::source::{HealthReport, SourceRegistry};
use crate::SourceId;

/// What one tick did.
#[derive(Clone, Debug, Serialize)]
pub struct TickReport {
    pub live_sources: usize,
    pub request_id: Option<u64>,
    pub slots: Vec<SlotTag>,
    pub outcome: Option<SubmitOutcome>,
    /// No source was streaming.
    pub idle: bool,
    /// Suggested wait before the next tick.
    #[serde(skip)]
    pub next_interval: Duration,
}

pub struct PipelineController {
    config: PipelineConfig,
    registry: SourceRegistry,
    assembler: BatchAssembler,
    accelerator: Arc<dyn Accelerator>,
    dispatcher: InferenceDispatcher,
    router: Arc<ResultRouter>,
    display: Arc<dyn Display>,
    signal: ShutdownSignal,
    last_discovery: Option<Instant>,
    ticks: u64,
}

impl PipelineController {
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn DeviceProvider>,
        accelerator: Arc<dyn Accelerator>,
        display: Arc<dyn Display>,
    ) -> Result<Self> {
        config.validate()?;
        let router = Arc::new(ResultRouter::new(&config.metrics));
        let dispatcher = InferenceDispatcher::new(
            Arc::clone(&accelerator),
            Arc::clone(&router),
            config.batch.max_in_flight,
        )?;
        let registry = SourceRegistry::new(
            provider,
            config.capture.clone(),
            config.recovery.clone(),
        );
        Ok(Self {
            assembler: BatchAssembler::new(config.batch.max_batch_size),
            config,
            registry,
            accelerator,
            dispatcher,
            router,
            display,
            signal: ShutdownSignal::new(),
            last_discovery: None,
            ticks: 0,
        })
    }

    /// Build the device provider and accelerator the configuration names.
    pub fn from_config(config: PipelineConfig, display: Arc<dyn Display>) -> Result<Self> {
        let provider = provider_for(&config.capture)?;
        let accelerators =
            AcceleratorRegistry::from_settings(&config.accelerator, config.batch.max_batch_size)?;
        let accelerator = accelerators.default_accelerator().ok_or_else(|| {
            anyhow!(
                "no accelerator registered for backend '{}'",
                config.accelerator.backend
            )
        })?;
        Self::new(config, provider, accelerator, display)
    }

    /// Use an externally owned stop flag (e.g. one raised by a signal handler).
    pub fn with_shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.signal = signal;
        self
    }

    /// Warm up the accelerator, start metrics sampling and discover cameras.
    pub fn start(&mut self) -> Result<Vec<SourceId>> {
        self.accelerator
            .warm_up()
            .with_context(|| format!("warm up accelerator '{}'", self.accelerator.name()))?;
        self.router.start_sampler()?;
        let found = self.discover(Instant::now());
        if found.is_empty() {
            log::warn!("PipelineController: no cameras found, waiting for devices");
        } else {
            log::info!(
                "PipelineController: started with {} camera(s), batch cap {}",
                found.len(),
                self.config.batch.max_batch_size
            );
        }
        Ok(found)
    }

    fn discover(&mut self, now: Instant) -> Vec<SourceId> {
        self.last_discovery = Some(now);
        self.registry.discover()
    }

    /// One assembly-and-dispatch cycle.
    pub fn tick(&mut self) -> TickReport {
        let now = Instant::now();
        self.ticks += 1;
        let health = self.registry.poll_health(now);
        self.sync_sinks(&health);

        if health.is_idle() {
            let rediscover_interval = self.config.recovery.rediscover_interval;
            let due = self
                .last_discovery
                .map_or(true, |at| now.saturating_duration_since(at) >= rediscover_interval);
            if due {
                let found = self.discover(now);
                if !found.is_empty() {
                    log::info!("PipelineController: rediscovered {:?}", found);
                }
            }
            return TickReport {
                live_sources: 0,
                request_id: None,
                slots: Vec::new(),
                outcome: None,
                idle: true,
                next_interval: self.config.tick.idle_interval,
            };
        }

        let sources = self.registry.streaming_sources();
        let next_interval = next_tick_interval(sources.len(), &self.config.tick.bounds);
        if !self.dispatcher.has_capacity() {
            self.dispatcher.record_skip();
            return TickReport {
                live_sources: sources.len(),
                request_id: None,
                slots: Vec::new(),
                outcome: Some(SubmitOutcome::Skipped),
                idle: false,
                next_interval,
            };
        }
        let Some(batch) = self.assembler.plan(&sources) else {
            return TickReport {
                live_sources: sources.len(),
                request_id: None,
                slots: Vec::new(),
                outcome: None,
                idle: false,
                next_interval,
            };
        };

        let request_id = batch.request_id;
        let slots = batch.tags();
        let committed = batch.clone();
        let outcome = self.dispatcher.submit(batch);
        if matches!(outcome, SubmitOutcome::Submitted(_)) {
            self.assembler.commit(&committed);
        }
        log::debug!(
            "PipelineController: tick {} batch {} {:?} -> {:?}",
            self.ticks,
            request_id,
            slots,
            outcome
        );
        TickReport {
            live_sources: sources.len(),
            request_id: Some(request_id),
            slots,
            outcome: Some(outcome),
            idle: false,
            next_interval,
        }
    }

    fn sync_sinks(&mut self, health: &HealthReport) {
        for id in &health.newly_streaming {
            if self.router.has_sink(*id) {
                continue;
            }
            match self.display.register_sink(*id) {
                Ok(sink) => self.router.register_sink(*id, sink),
                Err(err) => log::warn!(
                    "PipelineController: no display sink for {}: {:#}",
                    id,
                    err
                ),
            }
        }
        for id in &health.closed {
            self.router.deregister_sink(*id);
            self.assembler.forget(*id);
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.signal.is_raised() || self.display.shutdown_requested()
    }

    /// Tick until shutdown is requested.
    pub fn run(&mut self) {
        self.run_until(None);
    }

    /// Tick until shutdown is requested or `duration` has elapsed.
    pub fn run_for(&mut self, duration: Duration) {
        self.run_until(Some(Instant::now() + duration));
    }

    fn run_until(&mut self, deadline: Option<Instant>) {
        while !self.shutdown_requested() {
            if deadline.is_some_and(|at| Instant::now() >= at) {
                break;
            }
            let started = Instant::now();
            let report = self.tick();
            let mut wait = report.next_interval.saturating_sub(started.elapsed());
            if let Some(at) = deadline {
                wait = wait.min(at.saturating_duration_since(Instant::now()));
            }
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }
        log::info!("PipelineController: tick loop stopped after {} ticks", self.ticks);
    }

    /// Drain in-flight batches, release every camera and return final metrics.
    pub fn shutdown(mut self) -> Result<MetricsSnapshot> {
        let drain = self.dispatcher.drain(self.config.shutdown.drain_timeout);
        self.dispatcher.shutdown();
        let stuck = self.registry.close_all(self.config.shutdown.release_timeout);
        let snapshot = self.router.shutdown();
        log::info!(
            "PipelineController: shut down ({} drained, {} abandoned, {} capture thread(s) detached)",
            drain.completed,
            drain.abandoned,
            stuck
        );
        Ok(snapshot)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn router(&self) -> &ResultRouter {
        &self.router
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        self.router.metrics()
    }

    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}
