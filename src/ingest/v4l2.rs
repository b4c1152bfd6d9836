//! V4L2 capture devices.
//!
//! This module provides `V4l2Provider` and `V4l2Device` for local cameras.
//!
//! The V4L2 device is responsible for:
//! - Opening a device node (e.g., /dev/video0) and negotiating RGB output
//! - Streaming through a single mmap buffer so a grab returns the newest
//!   exposure instead of a queued stale one
//! - Normalising YUYV/NV12 buffers to RGB24 when the driver refuses RGB3
//!
//! The V4L2 device MUST NOT:
//! - Queue frames beyond the one driver buffer
//! - Retain frames beyond handoff to the source handle
//! - Move the mmap stream off the thread that created it
//!
//! Each device owns a stream thread that opens the node, builds the mmap
//! stream and serves grab requests. `V4l2Device` itself only holds the
//! channel ends, so it can be handed from the probe to the capture thread
//! while the mapped buffers stay where they were created. Dropping the device
//! ends the stream thread after its current grab.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use ouroboros::self_referencing;
use std::path::Path;
use std::thread;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{CaptureDevice, CapturedFrame, DeviceProvider};
use crate::config::CaptureSettings;

/// Driver buffers requested per stream. One buffer means no backlog.
const STREAM_BUFFERS: u32 = 1;

/// Format requested from each V4L2 device.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Target frame rate (frames per second).
    pub target_fps: u32,
    /// Preferred frame width.
    pub width: u32,
    /// Preferred frame height.
    pub height: u32,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            target_fps: 30,
            width: 640,
            height: 480,
        }
    }
}

/// Enumerates `/dev/video*` style nodes (or an explicit list) and opens them.
pub struct V4l2Provider {
    config: V4l2Config,
    device_prefix: String,
    devices: Vec<String>,
}

impl V4l2Provider {
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            config: V4l2Config {
                target_fps: settings.target_fps,
                width: settings.width,
                height: settings.height,
            },
            device_prefix: settings.device_prefix.clone(),
            devices: settings.devices.clone(),
        }
    }

    fn scan_namespace(&self) -> Vec<String> {
        let prefix = Path::new(&self.device_prefix);
        let (Some(dir), Some(stem)) = (
            prefix.parent(),
            prefix.file_name().and_then(|name| name.to_str()),
        ) else {
            return Vec::new();
        };
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("V4l2Provider: cannot scan {}: {}", dir.display(), err);
                return Vec::new();
            }
        };
        let mut found: Vec<(u32, String)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let index: u32 = name.strip_prefix(stem)?.parse().ok()?;
                Some((index, entry.path().to_string_lossy().into_owned()))
            })
            .collect();
        found.sort();
        found.into_iter().map(|(_, path)| path).collect()
    }
}

impl DeviceProvider for V4l2Provider {
    fn candidates(&self) -> Vec<String> {
        if self.devices.is_empty() {
            self.scan_namespace()
        } else {
            self.devices
                .iter()
                .filter(|path| Path::new(path).exists())
                .cloned()
                .collect()
        }
    }

    fn open(&self, path: &str) -> Result<Box<dyn CaptureDevice>> {
        Ok(Box::new(V4l2Device::open(path, &self.config)?))
    }
}

/// One streaming V4L2 camera.
pub struct V4l2Device {
    path: String,
    requests: Sender<()>,
    frames: Receiver<Result<Vec<u8>>>,
    width: u32,
    height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

/// A negotiated stream, living on the thread that opened it.
struct OpenStream {
    state: DeviceState,
    format: PixelFormat,
    width: u32,
    height: u32,
}

impl OpenStream {
    fn open(path: &str, config: &V4l2Config) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device =
            v4l::Device::with_path(path).with_context(|| format!("open v4l2 device {}", path))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = config.width;
        format.height = config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Device: failed to set format on {}: {}", path, err);
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "{}: unsupported pixel format {}",
                path,
                format.fourcc.str().unwrap_or("????")
            )
        })?;

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Device: failed to set fps on {}: {}", path, err);
            }
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Device: opened {} ({}x{}, {:?}, {} buffer)",
            path,
            format.width,
            format.height,
            pixel_format,
            STREAM_BUFFERS
        );
        Ok(Self {
            state,
            format: pixel_format,
            width: format.width,
            height: format.height,
        })
    }

    fn grab(&mut self) -> Result<Vec<u8>> {
        use v4l::io::traits::CaptureStream;

        let (width, height, format) = (self.width, self.height, self.format);
        self.state.with_mut(|fields| {
            let (buf, _meta) = fields
                .stream
                .next()
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;
            normalize_to_rgb(buf, width, height, format)
        })
    }
}

/// Body of a device's stream thread: open, report the size, then serve grabs
/// until the device handle is dropped.
fn serve_stream(
    path: &str,
    config: &V4l2Config,
    ready: Sender<Result<(u32, u32)>>,
    requests: Receiver<()>,
    frames: Sender<Result<Vec<u8>>>,
) {
    let mut stream = match OpenStream::open(path, config) {
        Ok(stream) => stream,
        Err(err) => {
            let _ = ready.send(Err(err));
            return;
        }
    };
    if ready.send(Ok((stream.width, stream.height))).is_err() {
        return;
    }
    for () in requests.iter() {
        if frames.send(stream.grab()).is_err() {
            break;
        }
    }
    log::debug!("V4l2Device: stream thread for {} exited", path);
}

impl V4l2Device {
    pub fn open(path: &str, config: &V4l2Config) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded(1);
        let (request_tx, request_rx) = bounded(1);
        let (frame_tx, frame_rx) = bounded(1);
        {
            let path = path.to_string();
            let config = config.clone();
            thread::Builder::new()
                .name(format!("v4l2-{}", path.rsplit('/').next().unwrap_or("device")))
                .spawn(move || serve_stream(&path, &config, ready_tx, request_rx, frame_tx))
                .with_context(|| format!("spawn stream thread for {}", path))?;
        }

        let (width, height) = ready_rx
            .recv()
            .map_err(|_| anyhow!("{}: stream thread exited during open", path))??;
        Ok(Self {
            path: path.to_string(),
            requests: request_tx,
            frames: frame_rx,
            width,
            height,
        })
    }
}

impl CaptureDevice for V4l2Device {
    fn path(&self) -> &str {
        &self.path
    }

    fn grab(&mut self) -> Result<CapturedFrame> {
        self.requests
            .send(())
            .map_err(|_| anyhow!("{}: stream thread is gone", self.path))?;
        let pixels = self
            .frames
            .recv()
            .map_err(|_| anyhow!("{}: stream thread is gone", self.path))??;
        Ok(CapturedFrame {
            pixels,
            width: self.width,
            height: self.height,
        })
    }
}
