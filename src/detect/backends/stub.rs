use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Sender};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::AcceleratorSettings;
use crate::detect::accelerator::{Accelerator, BatchImage, CompletionCallback, CompletionToken};
use crate::detect::postprocess::{finalize, Candidate};
use crate::detect::RawDetections;

const PAUSE_POLL: Duration = Duration::from_millis(2);
const STUB_CLASSES: u32 = 80;

#[derive(Clone, Debug)]
pub struct StubConfig {
    /// Simulated inference time per batch.
    pub latency: Duration,
    /// Accepted-but-unfinished batches beyond which submissions are rejected.
    pub queue_depth: usize,
    pub score_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(15),
            queue_depth: 4,
            score_threshold: 0.25,
            iou_threshold: 0.45,
        }
    }
}

impl From<&AcceleratorSettings> for StubConfig {
    fn from(settings: &AcceleratorSettings) -> Self {
        Self {
            latency: settings.stub_latency,
            queue_depth: settings.queue_depth,
            score_threshold: settings.score_threshold,
            iou_threshold: settings.iou_threshold,
        }
    }
}

#[derive(Default)]
struct ControlState {
    fail_next: AtomicUsize,
    reject_next: AtomicUsize,
    paused: AtomicBool,
    shutdown: AtomicBool,
    completed: AtomicU64,
}

/// Fault injection for the stub accelerator.
#[derive(Clone, Default)]
pub struct StubControl {
    state: Arc<ControlState>,
}

impl StubControl {
    /// Complete the next `count` accepted batches with a hardware error.
    pub fn fail_next(&self, count: usize) {
        self.state.fail_next.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` submissions outright.
    pub fn reject_next(&self, count: usize) {
        self.state.reject_next.store(count, Ordering::SeqCst);
    }

    /// Hold completions until unpaused.
    pub fn set_paused(&self, paused: bool) {
        self.state.paused.store(paused, Ordering::SeqCst);
    }

    /// Callbacks invoked so far, successful or not.
    pub fn completed(&self) -> u64 {
        self.state.completed.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct Job {
    token: CompletionToken,
    images: Vec<BatchImage>,
    on_complete: CompletionCallback,
    fail: bool,
}

/// Stub accelerator for tests and demos.
///
/// Runs "inference" on one worker thread: sleeps for the configured latency,
/// then derives a deterministic handful of boxes per image from a SHA-256 of
/// its pixels, filtered and suppressed like a real backend. Identical frames
/// always produce identical detections.
pub struct StubAccelerator {
    config: StubConfig,
    control: StubControl,
    sender: Sender<Job>,
    next_token: AtomicU64,
    queued: Arc<AtomicUsize>,
}

impl StubAccelerator {
    pub fn new(config: StubConfig) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let control = StubControl::default();
        let queued = Arc::new(AtomicUsize::new(0));

        {
            let config = config.clone();
            let control = control.clone();
            let queued = Arc::clone(&queued);
            thread::Builder::new()
                .name("stub-accelerator".to_string())
                .spawn(move || {
                    for job in receiver.iter() {
                        while control.state.paused.load(Ordering::SeqCst)
                            && !control.state.shutdown.load(Ordering::SeqCst)
                        {
                            thread::sleep(PAUSE_POLL);
                        }
                        thread::sleep(config.latency);
                        let outcome = if job.fail {
                            Err(anyhow!("stub accelerator: simulated hardware error"))
                        } else {
                            Ok(job
                                .images
                                .iter()
                                .map(|image| synthesize(image, &config))
                                .collect())
                        };
                        queued.fetch_sub(1, Ordering::SeqCst);
                        control.state.completed.fetch_add(1, Ordering::SeqCst);
                        (job.on_complete)(job.token, outcome);
                    }
                })
                .context("spawn stub accelerator worker")?;
        }

        Ok(Self {
            config,
            control,
            sender,
            next_token: AtomicU64::new(1),
            queued,
        })
    }

    pub fn control(&self) -> StubControl {
        self.control.clone()
    }

    /// Accepted batches whose callback has not run yet.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

impl Accelerator for StubAccelerator {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn submit(
        &self,
        batch: Vec<BatchImage>,
        on_complete: CompletionCallback,
    ) -> Result<CompletionToken> {
        if batch.is_empty() {
            return Err(anyhow!("stub accelerator: empty batch"));
        }
        if let Some(index) = batch.iter().position(|image| !image.is_well_formed()) {
            return Err(anyhow!(
                "stub accelerator: image {} is not {}x{} RGB24",
                index,
                batch[index].width,
                batch[index].height
            ));
        }
        if StubControl::take(&self.control.state.reject_next) {
            return Err(anyhow!("stub accelerator: submission rejected"));
        }
        let depth = self.config.queue_depth;
        if self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < depth).then_some(n + 1)
            })
            .is_err()
        {
            return Err(anyhow!("stub accelerator: busy ({} batches queued)", depth));
        }

        let token = CompletionToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let job = Job {
            token,
            images: batch,
            on_complete,
            fail: StubControl::take(&self.control.state.fail_next),
        };
        if self.sender.send(job).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(anyhow!("stub accelerator: worker stopped"));
        }
        Ok(token)
    }
}

impl Drop for StubAccelerator {
    fn drop(&mut self) {
        self.control.state.shutdown.store(true, Ordering::SeqCst);
    }
}

fn synthesize(image: &BatchImage, config: &StubConfig) -> RawDetections {
    let digest: [u8; 32] = Sha256::digest(image.pixels.as_ref()).into();
    let count = (digest[0] % 4) as usize;
    let width = image.width as f32;
    let height = image.height as f32;

    let candidates = (0..count)
        .map(|i| {
            let b = &digest[1 + i * 6..7 + i * 6];
            let w = width * (0.1 + b[0] as f32 / 255.0 * 0.3);
            let h = height * (0.1 + b[1] as f32 / 255.0 * 0.3);
            Candidate {
                bbox: [
                    (width - w) * b[2] as f32 / 255.0,
                    (height - h) * b[3] as f32 / 255.0,
                    w,
                    h,
                ],
                score: b[4] as f32 / 255.0,
                class_id: b[5] as u32 % STUB_CLASSES,
            }
        })
        .collect();
    finalize(candidates, config.score_threshold, config.iou_threshold)
}
