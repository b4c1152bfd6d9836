use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::frame::{FrameSlot, LatestFrame};
use crate::ingest::CaptureDevice;
use crate::SourceId;

const JOIN_POLL: Duration = Duration::from_millis(5);

#[derive(Default)]
struct CaptureShared {
    stop: AtomicBool,
    frames_captured: AtomicU64,
    consecutive_failures: AtomicU32,
    failures_total: AtomicU64,
    last_sequence: AtomicU64,
    last_error: Mutex<Option<String>>,
}

/// Capture counters for one source.
#[derive(Clone, Debug, Serialize)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub consecutive_failures: u32,
    pub failures_total: u64,
    pub last_sequence: u64,
    pub last_error: Option<String>,
}

/// One camera's capture thread and its latest-frame register.
///
/// The thread owns the device and loops on blocking grabs. Each success
/// replaces the register's frame; each failure bumps the failure counters the
/// registry's health check reads. Readers call `latest()` and never touch the
/// device, so a slow camera only delays its own frames.
pub struct SourceHandle {
    id: SourceId,
    path: String,
    register: Arc<LatestFrame>,
    shared: Arc<CaptureShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SourceHandle {
    /// Start capturing from an opened device.
    ///
    /// `resume_sequence` is the last sequence handed out for this source, so a
    /// reconnected device keeps numbering where the old handle stopped.
    pub fn spawn(
        id: SourceId,
        device: Box<dyn CaptureDevice>,
        failure_backoff: Duration,
        resume_sequence: u64,
    ) -> Result<Self> {
        let path = device.path().to_string();
        let register = Arc::new(LatestFrame::new());
        let shared = Arc::new(CaptureShared::default());
        shared
            .last_sequence
            .store(resume_sequence, Ordering::SeqCst);

        let join = {
            let register = Arc::clone(&register);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("capture-{}", id.0))
                .spawn(move || {
                    capture_loop(id, device, &register, &shared, failure_backoff, resume_sequence)
                })
                .with_context(|| format!("spawn capture thread for {}", path))?
        };

        log::info!("{}: capture started on {}", id, path);
        Ok(Self {
            id,
            path,
            register,
            shared,
            join: Mutex::new(Some(join)),
        })
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Newest captured frame, `None` until the first successful grab.
    pub fn latest(&self) -> Option<FrameSlot> {
        self.register.latest()
    }

    pub fn has_frame(&self) -> bool {
        !self.register.is_empty()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Last sequence published (or resumed from).
    pub fn last_sequence(&self) -> u64 {
        self.shared.last_sequence.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.shared.frames_captured.load(Ordering::SeqCst),
            consecutive_failures: self.consecutive_failures(),
            failures_total: self.shared.failures_total.load(Ordering::SeqCst),
            last_sequence: self.last_sequence(),
            last_error: self
                .shared
                .last_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }

    /// Ask the capture thread to exit after its current grab.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        match self.join.lock() {
            Ok(guard) => guard.as_ref().map_or(true, |join| join.is_finished()),
            Err(_) => true,
        }
    }

    /// Stop and wait up to `timeout` for the thread to exit.
    ///
    /// Returns false if the thread is still inside a blocking grab; it is then
    /// left to finish on its own.
    pub fn release(&self, timeout: Duration) -> bool {
        self.stop();
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(JOIN_POLL);
        }
        let join = self
            .join
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(join) = join {
            if join.join().is_err() {
                log::error!("{}: capture thread panicked", self.id);
            }
        }
        true
    }
}

impl FrameSource for SourceHandle {
    fn source_id(&self) -> SourceId {
        self.id
    }

    fn latest(&self) -> Option<FrameSlot> {
        self.register.latest()
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    id: SourceId,
    mut device: Box<dyn CaptureDevice>,
    register: &LatestFrame,
    shared: &CaptureShared,
    failure_backoff: Duration,
    resume_sequence: u64,
) {
    let mut sequence = resume_sequence;
    while !shared.stop.load(Ordering::SeqCst) {
        match device.grab() {
            Ok(frame) => {
                sequence += 1;
                register.publish(FrameSlot::new(
                    id,
                    sequence,
                    frame.pixels,
                    frame.width,
                    frame.height,
                ));
                shared.last_sequence.store(sequence, Ordering::SeqCst);
                shared.frames_captured.fetch_add(1, Ordering::SeqCst);
                shared.consecutive_failures.store(0, Ordering::SeqCst);
            }
            Err(err) => {
                let failures = shared.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                shared.failures_total.fetch_add(1, Ordering::SeqCst);
                log::debug!("{}: capture failed ({} in a row): {}", id, failures, err);
                if let Ok(mut last_error) = shared.last_error.lock() {
                    *last_error = Some(err.to_string());
                }
                thread::sleep(failure_backoff);
            }
        }
    }
    log::debug!("{}: capture loop exited", id);
}
