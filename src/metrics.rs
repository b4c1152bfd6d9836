//! Throughput metrics.
//!
//! `PipelineMetrics` is created by the `ResultRouter` and only the router
//! records into it; everyone else reads snapshots. Counters are monotonic.
//! A sampler thread turns the aggregate counter into a rolling FPS figure at
//! a fixed interval and logs a per-source dashboard periodically.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::MetricsSettings;
use crate::SourceId;

const SAMPLER_POLL: Duration = Duration::from_millis(50);
const GOOD_FPS: f64 = 20.0;
const FAIR_FPS: f64 = 10.0;

struct SourceCounters {
    frames: u64,
    detections: u64,
    first_at: Instant,
    recent: VecDeque<Instant>,
}

impl SourceCounters {
    fn current_fps(&self) -> f64 {
        match (self.recent.front(), self.recent.back()) {
            (Some(first), Some(last)) if self.recent.len() >= 2 => {
                let span = last.duration_since(*first).as_secs_f64();
                if span > 0.0 {
                    (self.recent.len() - 1) as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    fn average_fps(&self, now: Instant) -> f64 {
        let elapsed = now.duration_since(self.first_at).as_secs_f64();
        if elapsed > 0.0 {
            self.frames as f64 / elapsed
        } else {
            0.0
        }
    }
}

struct RateSample {
    at: Instant,
    frames: u64,
    fps: f64,
}

/// Health band of one source's delivered frame rate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceHealth {
    Good,
    Fair,
    Poor,
}

impl SourceHealth {
    pub fn from_fps(fps: f64) -> Self {
        if fps > GOOD_FPS {
            SourceHealth::Good
        } else if fps > FAIR_FPS {
            SourceHealth::Fair
        } else {
            SourceHealth::Poor
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SourceMetrics {
    pub source_id: SourceId,
    pub frames: u64,
    pub detections: u64,
    pub current_fps: f64,
    pub average_fps: f64,
    pub health: SourceHealth,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: f64,
    pub frames_processed: u64,
    pub detections: u64,
    /// Aggregate delivered frames per second over the last sample interval.
    pub rolling_fps: f64,
    /// Sum of per-source window FPS.
    pub combined_fps: f64,
    /// `combined_fps` against every source running at the nominal rate.
    pub efficiency_pct: f64,
    pub sources: Vec<SourceMetrics>,
}

pub struct PipelineMetrics {
    started_at: Instant,
    frames_processed: AtomicU64,
    detections: AtomicU64,
    window: usize,
    nominal_fps: f64,
    per_source: Mutex<BTreeMap<SourceId, SourceCounters>>,
    rate: Mutex<RateSample>,
}

impl PipelineMetrics {
    pub fn new(settings: &MetricsSettings) -> Self {
        let now = Instant::now();
        Self {
            started_at: now,
            frames_processed: AtomicU64::new(0),
            detections: AtomicU64::new(0),
            window: settings.fps_window.max(2),
            nominal_fps: settings.nominal_fps,
            per_source: Mutex::new(BTreeMap::new()),
            rate: Mutex::new(RateSample {
                at: now,
                frames: 0,
                fps: 0.0,
            }),
        }
    }

    /// Count one delivered result.
    pub(crate) fn record(&self, source_id: SourceId, detections: usize, now: Instant) {
        self.frames_processed.fetch_add(1, Ordering::SeqCst);
        self.detections
            .fetch_add(detections as u64, Ordering::SeqCst);

        let mut per_source = self
            .per_source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counters = per_source.entry(source_id).or_insert_with(|| SourceCounters {
            frames: 0,
            detections: 0,
            first_at: now,
            recent: VecDeque::with_capacity(self.window),
        });
        counters.frames += 1;
        counters.detections += detections as u64;
        if counters.recent.len() == self.window {
            counters.recent.pop_front();
        }
        counters.recent.push_back(now);
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::SeqCst)
    }

    pub fn detections(&self) -> u64 {
        self.detections.load(Ordering::SeqCst)
    }

    pub fn source_frames(&self, source_id: SourceId) -> u64 {
        self.per_source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&source_id)
            .map_or(0, |counters| counters.frames)
    }

    /// Recompute the rolling FPS from frames delivered since the last sample.
    pub fn sample(&self, now: Instant) -> f64 {
        let frames = self.frames_processed();
        let mut rate = self
            .rate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let elapsed = now.saturating_duration_since(rate.at).as_secs_f64();
        if elapsed > 0.0 {
            rate.fps = frames.saturating_sub(rate.frames) as f64 / elapsed;
            rate.at = now;
            rate.frames = frames;
        }
        rate.fps
    }

    /// FPS as of the last `sample`.
    pub fn rolling_fps(&self) -> f64 {
        self.rate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .fps
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let sources: Vec<SourceMetrics> = self
            .per_source
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(source_id, counters)| {
                let current_fps = counters.current_fps();
                SourceMetrics {
                    source_id: *source_id,
                    frames: counters.frames,
                    detections: counters.detections,
                    current_fps,
                    average_fps: counters.average_fps(now),
                    health: SourceHealth::from_fps(current_fps),
                }
            })
            .collect();

        let combined_fps: f64 = sources.iter().map(|source| source.current_fps).sum();
        let capacity = sources.len() as f64 * self.nominal_fps;
        MetricsSnapshot {
            uptime_secs: now.duration_since(self.started_at).as_secs_f64(),
            frames_processed: self.frames_processed(),
            detections: self.detections(),
            rolling_fps: self.rolling_fps(),
            combined_fps,
            efficiency_pct: if capacity > 0.0 {
                combined_fps / capacity * 100.0
            } else {
                0.0
            },
            sources,
        }
    }

    /// Log the performance dashboard at `info`.
    pub fn log_dashboard(&self) {
        let snapshot = self.snapshot();
        log::info!(
            "PipelineMetrics: uptime {:.0}s, {} frames, {:.1} fps rolling",
            snapshot.uptime_secs,
            snapshot.frames_processed,
            snapshot.rolling_fps
        );
        for source in &snapshot.sources {
            log::info!(
                "  {} [{:?}] frames={} fps={:.1} avg={:.1} detections={}",
                source.source_id,
                source.health,
                source.frames,
                source.current_fps,
                source.average_fps,
                source.detections
            );
        }
        log::info!(
            "PipelineMetrics: {} sources, combined {:.1} fps, {} detections, efficiency {:.1}%",
            snapshot.sources.len(),
            snapshot.combined_fps,
            snapshot.detections,
            snapshot.efficiency_pct
        );
    }

    /// Start the sampler thread.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        sample_interval: Duration,
        report_interval: Duration,
    ) -> Result<MetricsSampler> {
        let stop = Arc::new(AtomicBool::new(false));
        let join = {
            let metrics = Arc::clone(self);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("metrics-sampler".to_string())
                .spawn(move || {
                    let mut next_sample = Instant::now() + sample_interval;
                    let mut next_report = Instant::now() + report_interval;
                    while !stop.load(Ordering::SeqCst) {
                        thread::sleep(SAMPLER_POLL.min(sample_interval));
                        let now = Instant::now();
                        if now >= next_sample {
                            metrics.sample(now);
                            next_sample = now + sample_interval;
                        }
                        if now >= next_report {
                            metrics.log_dashboard();
                            next_report = now + report_interval;
                        }
                    }
                })
                .context("spawn metrics sampler")?
        };
        Ok(MetricsSampler {
            stop,
            join: Some(join),
        })
    }
}

/// Running sampler thread; stopped on `stop()` or drop.
pub struct MetricsSampler {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl MetricsSampler {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("PipelineMetrics: sampler thread panicked");
            }
        }
    }
}

impl Drop for MetricsSampler {
    fn drop(&mut self) {
        self.stop();
    }
}
