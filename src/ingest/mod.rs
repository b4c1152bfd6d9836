//! Capture devices.
//!
//! This module provides the device side of the pipeline:
//! - USB/V4L2 cameras (feature: ingest-v4l2)
//! - Synthetic `stub://` cameras (testing and demos)
//!
//! A `DeviceProvider` enumerates candidate paths in a fixed namespace and opens
//! them; a `CaptureDevice` performs blocking grabs. Nothing here knows about
//! sequences, batches or health: `source::SourceHandle` drives the device and
//! `source::SourceRegistry` decides what a failure means.
//!
//! Devices MUST:
//! - Return the most recently exposed frame from `grab` (no deep driver queues)
//! - Return packed RGB24 pixels
//! - Report failures as errors rather than blocking forever where avoidable

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::config::CaptureSettings;

pub use synthetic::{SyntheticConfig, SyntheticControl, SyntheticDevice, SyntheticProvider};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Device, V4l2Provider};

/// Pixels returned by one grab.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    /// Packed RGB24.
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One opened camera. `grab` blocks until a frame is available or fails.
pub trait CaptureDevice: Send {
    /// Device path this handle was opened from.
    fn path(&self) -> &str;

    /// Capture the newest frame.
    fn grab(&mut self) -> Result<CapturedFrame>;
}

/// Enumerates and opens devices in one namespace.
pub trait DeviceProvider: Send + Sync {
    /// Candidate device paths, in a stable order.
    fn candidates(&self) -> Vec<String>;

    /// Open one device. May block; callers bound it with a probe timeout.
    fn open(&self, path: &str) -> Result<Box<dyn CaptureDevice>>;
}

/// Pick a provider for the configured devices.
///
/// An explicit device list made only of `stub://` paths yields synthetic
/// cameras; anything else needs the V4L2 backend.
pub fn provider_for(settings: &CaptureSettings) -> Result<Arc<dyn DeviceProvider>> {
    let all_stub = !settings.devices.is_empty()
        && settings
            .devices
            .iter()
            .all(|path| path.starts_with("stub://"));
    if all_stub {
        let config = SyntheticConfig {
            width: settings.width,
            height: settings.height,
            target_fps: settings.target_fps,
        };
        return Ok(Arc::new(SyntheticProvider::with_paths(
            settings.devices.clone(),
            config,
        )));
    }
    if settings
        .devices
        .iter()
        .any(|path| path.starts_with("stub://"))
    {
        return Err(anyhow!(
            "cannot mix stub:// and real device paths in one capture configuration"
        ));
    }

    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Arc::new(V4l2Provider::new(settings)))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        Err(anyhow!(
            "capturing from {} requires the ingest-v4l2 feature",
            if settings.devices.is_empty() {
                format!("{}*", settings.device_prefix)
            } else {
                settings.devices.join(",")
            }
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;

    #[test]
    fn stub_paths_select_synthetic_provider() -> Result<()> {
        let mut settings = PipelineConfig::default().capture;
        settings.devices = vec!["stub://cam0".into(), "stub://cam1".into()];
        let provider = provider_for(&settings)?;
        assert_eq!(provider.candidates(), settings.devices);
        Ok(())
    }

    #[test]
    fn mixed_paths_are_rejected() {
        let mut settings = PipelineConfig::default().capture;
        settings.devices = vec!["stub://cam0".into(), "/dev/video0".into()];
        assert!(provider_for(&settings).is_err());
    }
}
