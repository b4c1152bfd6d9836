#![cfg(feature = "backend-tract")]

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Sender};
use tract_onnx::prelude::*;

use crate::config::AcceleratorSettings;
use crate::detect::accelerator::{Accelerator, BatchImage, CompletionCallback, CompletionToken};
use crate::detect::postprocess::{decode_yolo, finalize};
use crate::detect::RawDetections;

type Plan = TypedRunnableModel<TypedModel>;

#[derive(Clone, Debug)]
pub struct TractConfig {
    pub model_path: PathBuf,
    /// Fixed batch dimension of the model; partial batches are zero-padded.
    pub batch_size: usize,
    pub input_width: u32,
    pub input_height: u32,
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub queue_depth: usize,
}

impl TractConfig {
    pub fn from_settings(settings: &AcceleratorSettings, model_path: PathBuf, batch_size: usize) -> Self {
        Self {
            model_path,
            batch_size,
            input_width: settings.input_width,
            input_height: settings.input_height,
            score_threshold: settings.score_threshold,
            iou_threshold: settings.iou_threshold,
            queue_depth: settings.queue_depth,
        }
    }
}

struct Job {
    token: CompletionToken,
    images: Vec<BatchImage>,
    on_complete: CompletionCallback,
}

/// Tract-based accelerator for YOLO-style ONNX detectors.
///
/// The model is compiled once for a `[batch, 3, H, W]` input and owned by a
/// worker thread that runs queued batches in order. It loads a local model file
/// and performs no network I/O.
pub struct TractAccelerator {
    config: TractConfig,
    sender: Sender<Job>,
    next_token: AtomicU64,
    queued: Arc<AtomicUsize>,
}

impl TractAccelerator {
    /// Load and optimise the model, then start the worker.
    pub fn new(config: TractConfig) -> Result<Self> {
        let model_path = &config.model_path;
        let plan: Plan = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(
                        config.batch_size,
                        3,
                        config.input_height as usize,
                        config.input_width as usize
                    ),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        log::info!(
            "TractAccelerator: loaded {} (batch {}, {}x{})",
            model_path.display(),
            config.batch_size,
            config.input_width,
            config.input_height
        );

        let (sender, receiver) = unbounded::<Job>();
        let queued = Arc::new(AtomicUsize::new(0));
        {
            let config = config.clone();
            let queued = Arc::clone(&queued);
            thread::Builder::new()
                .name("tract-accelerator".to_string())
                .spawn(move || {
                    for job in receiver.iter() {
                        let outcome = run_batch(&plan, &config, &job.images);
                        queued.fetch_sub(1, Ordering::SeqCst);
                        (job.on_complete)(job.token, outcome);
                    }
                })
                .context("spawn tract accelerator worker")?;
        }

        Ok(Self {
            config,
            sender,
            next_token: AtomicU64::new(1),
            queued,
        })
    }
}

impl Accelerator for TractAccelerator {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn submit(
        &self,
        batch: Vec<BatchImage>,
        on_complete: CompletionCallback,
    ) -> Result<CompletionToken> {
        if batch.is_empty() || batch.len() > self.config.batch_size {
            return Err(anyhow!(
                "batch of {} does not fit model batch size {}",
                batch.len(),
                self.config.batch_size
            ));
        }
        if let Some(index) = batch.iter().position(|image| !image.is_well_formed()) {
            return Err(anyhow!("image {} is not well-formed RGB24", index));
        }
        let depth = self.config.queue_depth;
        if self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < depth).then_some(n + 1)
            })
            .is_err()
        {
            return Err(anyhow!("tract accelerator busy ({} batches queued)", depth));
        }

        let token = CompletionToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let job = Job {
            token,
            images: batch,
            on_complete,
        };
        if self.sender.send(job).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(anyhow!("tract accelerator worker stopped"));
        }
        Ok(token)
    }
}

fn run_batch(plan: &Plan, config: &TractConfig, images: &[BatchImage]) -> Result<Vec<RawDetections>> {
    let input = build_input(config, images);
    let outputs = plan
        .run(tvec!(input.into()))
        .context("ONNX inference failed")?;
    let output = outputs
        .first()
        .ok_or_else(|| anyhow!("model produced no outputs"))?;
    let view = output
        .to_array_view::<f32>()
        .context("model output tensor was not f32")?;

    let shape = view.shape();
    if shape.len() != 3 || shape[0] < images.len() || shape[1] <= 4 {
        return Err(anyhow!("unexpected model output shape {:?}", shape));
    }
    let classes = shape[1] - 4;
    let anchors = shape[2];

    let mut results = Vec::with_capacity(images.len());
    for (index, image) in images.iter().enumerate() {
        let data: Vec<f32> = view
            .index_axis(tract_ndarray::Axis(0), index)
            .iter()
            .copied()
            .collect();
        let scale = (
            image.width as f32 / config.input_width as f32,
            image.height as f32 / config.input_height as f32,
        );
        let candidates = decode_yolo(&data, anchors, classes, config.score_threshold, scale);
        results.push(finalize(
            candidates,
            config.score_threshold,
            config.iou_threshold,
        ));
    }
    Ok(results)
}

/// Nearest-neighbour resize of every image into one normalised NCHW tensor.
fn build_input(config: &TractConfig, images: &[BatchImage]) -> Tensor {
    let width = config.input_width as usize;
    let height = config.input_height as usize;
    let input = tract_ndarray::Array4::from_shape_fn(
        (config.batch_size, 3, height, width),
        |(n, channel, y, x)| match images.get(n) {
            Some(image) => {
                let src_w = image.width as usize;
                let src_h = image.height as usize;
                let sx = (x * src_w / width).min(src_w - 1);
                let sy = (y * src_h / height).min(src_h - 1);
                image.pixels[(sy * src_w + sx) * 3 + channel] as f32 / 255.0
            }
            None => 0.0,
        },
    );
    input.into_tensor()
}
