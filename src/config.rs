use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pacing::TickBounds;

const DEFAULT_DEVICE_PREFIX: &str = "/dev/video";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_TARGET_FPS: u32 = 30;
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_FAILURE_BACKOFF_MS: u64 = 50;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;
const DEFAULT_BACKOFF_JITTER_MS: u64 = 250;
const DEFAULT_REDISCOVER_MS: u64 = 2_000;
const DEFAULT_MAX_BATCH: usize = 4;
const DEFAULT_MAX_IN_FLIGHT: usize = 2;
const DEFAULT_TICK_MIN_MS: u64 = 20;
const DEFAULT_TICK_MAX_MS: u64 = 100;
const DEFAULT_TICK_PER_SOURCE_MS: u64 = 10;
const DEFAULT_TICK_IDLE_MS: u64 = 250;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_MODEL_PATH: &str = "models/yolo11l.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const DEFAULT_QUEUE_DEPTH: usize = 4;
const DEFAULT_STUB_LATENCY_MS: u64 = 15;
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_REPORT_INTERVAL_SECS: u64 = 15;
const DEFAULT_FPS_WINDOW: usize = 60;
const DEFAULT_NOMINAL_FPS: f64 = 30.0;
const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_RELEASE_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_LOG_EVERY: u64 = 90;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    capture: Option<CaptureConfigFile>,
    recovery: Option<RecoveryConfigFile>,
    batch: Option<BatchConfigFile>,
    tick: Option<TickConfigFile>,
    accelerator: Option<AcceleratorConfigFile>,
    metrics: Option<MetricsConfigFile>,
    shutdown: Option<ShutdownConfigFile>,
    display: Option<DisplayConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    device_prefix: Option<String>,
    devices: Option<Vec<String>>,
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
    failure_threshold: Option<u32>,
    failure_backoff_ms: Option<u64>,
    probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecoveryConfigFile {
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    jitter_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    rediscover_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct BatchConfigFile {
    max_batch_size: Option<usize>,
    max_in_flight: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct TickConfigFile {
    min_interval_ms: Option<u64>,
    max_interval_ms: Option<u64>,
    per_source_ms: Option<u64>,
    idle_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct AcceleratorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    fallback_model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    score_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    queue_depth: Option<usize>,
    stub_latency_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MetricsConfigFile {
    sample_interval_ms: Option<u64>,
    report_interval_secs: Option<u64>,
    fps_window: Option<usize>,
    nominal_fps: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct ShutdownConfigFile {
    drain_timeout_ms: Option<u64>,
    release_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DisplayConfigFile {
    primary: Option<u32>,
    log_every: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub capture: CaptureSettings,
    pub recovery: RecoverySettings,
    pub batch: BatchSettings,
    pub tick: TickSettings,
    pub accelerator: AcceleratorSettings,
    pub metrics: MetricsSettings,
    pub shutdown: ShutdownSettings,
    pub display: DisplaySettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Device namespace scanned when `devices` is empty.
    pub device_prefix: String,
    /// Explicit candidate paths. Empty means "scan `device_prefix`*".
    pub devices: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    /// Consecutive capture failures that mark a source disconnected.
    pub failure_threshold: u32,
    /// Pause after a failed capture before the next attempt.
    pub failure_backoff: Duration,
    /// Bound on open + first grab during discovery and reconnects.
    pub probe_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RecoverySettings {
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub jitter: Duration,
    /// `None` retries a vanished device forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Discovery rescan interval while no source is live.
    pub rediscover_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub max_in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct TickSettings {
    pub bounds: TickBounds,
    pub idle_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AcceleratorSettings {
    pub backend: String,
    pub model_path: PathBuf,
    pub fallback_model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub queue_depth: usize,
    /// Simulated inference latency of the stub backend.
    pub stub_latency: Duration,
}

#[derive(Debug, Clone)]
pub struct MetricsSettings {
    pub sample_interval: Duration,
    pub report_interval: Duration,
    pub fps_window: usize,
    /// Per-source frame rate used as 100% in the efficiency figure.
    pub nominal_fps: f64,
}

#[derive(Debug, Clone)]
pub struct ShutdownSettings {
    pub drain_timeout: Duration,
    pub release_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DisplaySettings {
    /// Source rendered in full; `None` picks the lowest id.
    pub primary: Option<u32>,
    /// Per-sink status line interval, in delivered frames.
    pub log_every: u64,
}

impl PipelineConfig {
    /// Load from `MULTICAM_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MULTICAM_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let recovery = file.recovery.unwrap_or_default();
        let batch = file.batch.unwrap_or_default();
        let tick = file.tick.unwrap_or_default();
        let accelerator = file.accelerator.unwrap_or_default();
        let metrics = file.metrics.unwrap_or_default();
        let shutdown = file.shutdown.unwrap_or_default();
        let display = file.display.unwrap_or_default();

        Self {
            capture: CaptureSettings {
                device_prefix: capture
                    .device_prefix
                    .unwrap_or_else(|| DEFAULT_DEVICE_PREFIX.to_string()),
                devices: capture.devices.unwrap_or_default(),
                width: capture.width.unwrap_or(DEFAULT_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_HEIGHT),
                target_fps: capture.target_fps.unwrap_or(DEFAULT_TARGET_FPS),
                failure_threshold: capture
                    .failure_threshold
                    .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
                failure_backoff: Duration::from_millis(
                    capture
                        .failure_backoff_ms
                        .unwrap_or(DEFAULT_FAILURE_BACKOFF_MS),
                ),
                probe_timeout: Duration::from_millis(
                    capture.probe_timeout_ms.unwrap_or(DEFAULT_PROBE_TIMEOUT_MS),
                ),
            },
            recovery: RecoverySettings {
                backoff_initial: Duration::from_millis(
                    recovery
                        .backoff_initial_ms
                        .unwrap_or(DEFAULT_BACKOFF_INITIAL_MS),
                ),
                backoff_max: Duration::from_millis(
                    recovery.backoff_max_ms.unwrap_or(DEFAULT_BACKOFF_MAX_MS),
                ),
                jitter: Duration::from_millis(
                    recovery.jitter_ms.unwrap_or(DEFAULT_BACKOFF_JITTER_MS),
                ),
                max_reconnect_attempts: recovery.max_reconnect_attempts,
                rediscover_interval: Duration::from_millis(
                    recovery
                        .rediscover_interval_ms
                        .unwrap_or(DEFAULT_REDISCOVER_MS),
                ),
            },
            batch: BatchSettings {
                max_batch_size: batch.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH),
                max_in_flight: batch.max_in_flight.unwrap_or(DEFAULT_MAX_IN_FLIGHT),
            },
            tick: TickSettings {
                bounds: TickBounds {
                    min: Duration::from_millis(tick.min_interval_ms.unwrap_or(DEFAULT_TICK_MIN_MS)),
                    max: Duration::from_millis(tick.max_interval_ms.unwrap_or(DEFAULT_TICK_MAX_MS)),
                    per_source: Duration::from_millis(
                        tick.per_source_ms.unwrap_or(DEFAULT_TICK_PER_SOURCE_MS),
                    ),
                },
                idle_interval: Duration::from_millis(
                    tick.idle_interval_ms.unwrap_or(DEFAULT_TICK_IDLE_MS),
                ),
            },
            accelerator: AcceleratorSettings {
                backend: accelerator
                    .backend
                    .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
                model_path: accelerator
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                fallback_model_path: accelerator.fallback_model_path,
                input_width: accelerator.input_width.unwrap_or(DEFAULT_INPUT_SIZE),
                input_height: accelerator.input_height.unwrap_or(DEFAULT_INPUT_SIZE),
                score_threshold: accelerator
                    .score_threshold
                    .unwrap_or(DEFAULT_SCORE_THRESHOLD),
                iou_threshold: accelerator.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
                queue_depth: accelerator.queue_depth.unwrap_or(DEFAULT_QUEUE_DEPTH),
                stub_latency: Duration::from_millis(
                    accelerator
                        .stub_latency_ms
                        .unwrap_or(DEFAULT_STUB_LATENCY_MS),
                ),
            },
            metrics: MetricsSettings {
                sample_interval: Duration::from_millis(
                    metrics
                        .sample_interval_ms
                        .unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS),
                ),
                report_interval: Duration::from_secs(
                    metrics
                        .report_interval_secs
                        .unwrap_or(DEFAULT_REPORT_INTERVAL_SECS),
                ),
                fps_window: metrics.fps_window.unwrap_or(DEFAULT_FPS_WINDOW),
                nominal_fps: metrics.nominal_fps.unwrap_or(DEFAULT_NOMINAL_FPS),
            },
            shutdown: ShutdownSettings {
                drain_timeout: Duration::from_millis(
                    shutdown.drain_timeout_ms.unwrap_or(DEFAULT_DRAIN_TIMEOUT_MS),
                ),
                release_timeout: Duration::from_millis(
                    shutdown
                        .release_timeout_ms
                        .unwrap_or(DEFAULT_RELEASE_TIMEOUT_MS),
                ),
            },
            display: DisplaySettings {
                primary: display.primary,
                log_every: display.log_every.unwrap_or(DEFAULT_LOG_EVERY),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(devices) = std::env::var("MULTICAM_DEVICES") {
            let parsed = split_csv(&devices);
            if !parsed.is_empty() {
                self.capture.devices = parsed;
            }
        }
        if let Ok(max_batch) = std::env::var("MULTICAM_MAX_BATCH") {
            self.batch.max_batch_size = max_batch
                .trim()
                .parse()
                .map_err(|_| anyhow!("MULTICAM_MAX_BATCH must be a positive integer"))?;
        }
        if let Ok(path) = std::env::var("MULTICAM_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.accelerator.model_path = PathBuf::from(path);
            }
        }
        if let Ok(backend) = std::env::var("MULTICAM_BACKEND") {
            if !backend.trim().is_empty() {
                self.accelerator.backend = backend.trim().to_lowercase();
            }
        }
        if let Ok(ms) = std::env::var("MULTICAM_TICK_MIN_MS") {
            self.tick.bounds.min = parse_millis("MULTICAM_TICK_MIN_MS", &ms)?;
        }
        if let Ok(ms) = std::env::var("MULTICAM_TICK_MAX_MS") {
            self.tick.bounds.max = parse_millis("MULTICAM_TICK_MAX_MS", &ms)?;
        }
        if let Ok(ms) = std::env::var("MULTICAM_DRAIN_TIMEOUT_MS") {
            self.shutdown.drain_timeout = parse_millis("MULTICAM_DRAIN_TIMEOUT_MS", &ms)?;
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch.max_batch_size == 0 {
            return Err(anyhow!("max_batch_size must be greater than zero"));
        }
        if self.batch.max_in_flight == 0 {
            return Err(anyhow!("max_in_flight must be greater than zero"));
        }
        if self.tick.bounds.min > self.tick.bounds.max {
            return Err(anyhow!(
                "tick min interval ({:?}) exceeds max interval ({:?})",
                self.tick.bounds.min,
                self.tick.bounds.max
            ));
        }
        if self.capture.failure_threshold == 0 {
            return Err(anyhow!("failure_threshold must be at least 1"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture dimensions must be non-zero"));
        }
        if self.accelerator.input_width == 0 || self.accelerator.input_height == 0 {
            return Err(anyhow!("accelerator input dimensions must be non-zero"));
        }
        for (name, value) in [
            ("score_threshold", self.accelerator.score_threshold),
            ("iou_threshold", self.accelerator.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within 0..=1, got {}", name, value));
            }
        }
        if self.accelerator.queue_depth == 0 {
            return Err(anyhow!("accelerator queue_depth must be greater than zero"));
        }
        if self.metrics.fps_window < 2 {
            return Err(anyhow!("fps_window must hold at least two samples"));
        }
        if self.recovery.backoff_initial > self.recovery.backoff_max {
            return Err(anyhow!("recovery backoff_initial exceeds backoff_max"));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_file(PipelineConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_millis(name: &str, value: &str) -> Result<Duration> {
    let ms: u64 = value
        .trim()
        .parse()
        .map_err(|_| anyhow!("{} must be an integer number of milliseconds", name))?;
    Ok(Duration::from_millis(ms))
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = PipelineConfig::default();
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.batch.max_batch_size, 4);
        assert_eq!(cfg.accelerator.score_threshold, 0.25);
        assert_eq!(cfg.accelerator.iou_threshold, 0.45);
        assert_eq!(cfg.capture.device_prefix, "/dev/video");
        assert!(cfg.recovery.max_reconnect_attempts.is_none());
    }

    #[test]
    fn rejects_inverted_tick_bounds() {
        let mut cfg = PipelineConfig::default();
        cfg.tick.bounds.min = Duration::from_millis(200);
        cfg.tick.bounds.max = Duration::from_millis(100);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_cap() {
        let mut cfg = PipelineConfig::default();
        cfg.batch.max_batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let mut cfg = PipelineConfig::default();
        cfg.accelerator.iou_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn split_csv_drops_blanks() {
        assert_eq!(
            split_csv(" stub://a, ,stub://b,"),
            vec!["stub://a".to_string(), "stub://b".to_string()]
        );
    }
}
