//! Synthetic `stub://` cameras.
//!
//! Synthetic devices generate a moving RGB test pattern at a target frame rate.
//! Each one has a `SyntheticControl` that tests and demos use to script faults:
//! - `set_failing`: every grab errors (a camera that stopped delivering)
//! - `set_removed`: the device node is gone (grabs and opens fail, the path
//!   disappears from enumeration)
//! - `set_stalled`: grabs block until released (a slow camera)

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::{CaptureDevice, CapturedFrame, DeviceProvider};

const STALL_POLL: Duration = Duration::from_millis(5);

/// Frame geometry and rate for synthetic cameras.
#[derive(Clone, Copy, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second. Zero means "as fast as grabs are issued".
    pub target_fps: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            target_fps: 30,
        }
    }
}

#[derive(Default)]
struct ControlState {
    failing: AtomicBool,
    removed: AtomicBool,
    stalled: AtomicBool,
    grabs: AtomicU64,
    opens: AtomicU64,
}

/// Fault-injection handle shared by a synthetic device and its provider.
#[derive(Clone, Default)]
pub struct SyntheticControl {
    state: Arc<ControlState>,
}

impl SyntheticControl {
    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_removed(&self, removed: bool) {
        self.state.removed.store(removed, Ordering::SeqCst);
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.state.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn is_removed(&self) -> bool {
        self.state.removed.load(Ordering::SeqCst)
    }

    /// Successful grabs across every device opened from this path.
    pub fn grabs(&self) -> u64 {
        self.state.grabs.load(Ordering::SeqCst)
    }

    /// Successful opens of this path.
    pub fn opens(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }
}

/// Provider for a fixed set of `stub://` paths.
pub struct SyntheticProvider {
    config: SyntheticConfig,
    controls: BTreeMap<String, SyntheticControl>,
}

impl SyntheticProvider {
    /// `count` cameras named `stub://cam0`, `stub://cam1`, ...
    pub fn new(count: usize, config: SyntheticConfig) -> Self {
        Self::with_paths((0..count).map(|i| format!("stub://cam{}", i)), config)
    }

    pub fn with_paths(paths: impl IntoIterator<Item = String>, config: SyntheticConfig) -> Self {
        let controls = paths
            .into_iter()
            .map(|path| (path, SyntheticControl::default()))
            .collect();
        Self { config, controls }
    }

    pub fn control(&self, path: &str) -> Option<SyntheticControl> {
        self.controls.get(path).cloned()
    }
}

impl DeviceProvider for SyntheticProvider {
    fn candidates(&self) -> Vec<String> {
        self.controls
            .iter()
            .filter(|(_, control)| !control.is_removed())
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn open(&self, path: &str) -> Result<Box<dyn CaptureDevice>> {
        let control = self
            .controls
            .get(path)
            .ok_or_else(|| anyhow!("no synthetic device at {}", path))?;
        if control.is_removed() {
            return Err(anyhow!("synthetic device {} is not present", path));
        }
        control.state.opens.fetch_add(1, Ordering::SeqCst);
        log::info!("SyntheticDevice: opened {} (synthetic)", path);
        Ok(Box::new(SyntheticDevice::new(
            path.to_string(),
            self.config,
            control.clone(),
        )))
    }
}

/// One synthetic camera.
pub struct SyntheticDevice {
    path: String,
    config: SyntheticConfig,
    control: SyntheticControl,
    frame_count: u64,
    next_frame_at: Option<Instant>,
    /// Simulated scene state; shifts the pattern every 50 frames.
    scene_state: u8,
}

impl SyntheticDevice {
    pub fn new(path: String, config: SyntheticConfig, control: SyntheticControl) -> Self {
        Self {
            path,
            config,
            control,
            frame_count: 0,
            next_frame_at: None,
            scene_state: 0,
        }
    }

    fn frame_interval(&self) -> Option<Duration> {
        (self.config.target_fps > 0)
            .then(|| Duration::from_secs_f64(1.0 / self.config.target_fps as f64))
    }

    fn wait_for_exposure(&mut self) {
        let Some(interval) = self.frame_interval() else {
            return;
        };
        let now = Instant::now();
        let due = self.next_frame_at.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        // Re-anchor after long gaps so a paused consumer doesn't trigger a burst.
        let next = due + interval;
        self.next_frame_at = Some(if next < Instant::now() {
            Instant::now() + interval
        } else {
            next
        });
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width * self.config.height * 3) as usize;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl CaptureDevice for SyntheticDevice {
    fn path(&self) -> &str {
        &self.path
    }

    fn grab(&mut self) -> Result<CapturedFrame> {
        while self.control.state.stalled.load(Ordering::SeqCst) {
            thread::sleep(STALL_POLL);
        }
        if self.control.is_removed() {
            return Err(anyhow!("{}: device removed", self.path));
        }
        if self.control.state.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("{}: capture failed", self.path));
        }

        self.wait_for_exposure();
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        self.control.state.grabs.fetch_add(1, Ordering::SeqCst);

        Ok(CapturedFrame {
            pixels,
            width: self.config.width,
            height: self.config.height,
        })
    }
}
