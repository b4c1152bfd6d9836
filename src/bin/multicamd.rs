//! multicamd - multi-camera inference daemon
//!
//! This daemon:
//! 1. Discovers cameras in the configured namespace (or an explicit list)
//! 2. Captures each camera on its own thread, keeping only the latest frame
//! 3. Assembles one cross-camera batch per tick and submits it to the accelerator
//! 4. Routes every result back to its camera's display sink
//! 5. Drains in-flight work and releases every camera on Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use multicam::{LogDisplay, PipelineConfig, PipelineController, ShutdownSignal, SourceId};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON or TOML configuration file.
    #[arg(long, env = "MULTICAM_CONFIG")]
    config: Option<PathBuf>,
    /// Accelerator backend (stub, tract).
    #[arg(long)]
    backend: Option<String>,
    /// Comma-separated device paths; overrides discovery.
    #[arg(long, value_delimiter = ',')]
    devices: Vec<String>,
    /// Maximum frames per batch.
    #[arg(long)]
    max_batch: Option<usize>,
    /// Source rendered in full by the log display.
    #[arg(long)]
    primary: Option<u32>,
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = PipelineConfig::load_from(args.config.as_deref())?;
    if let Some(backend) = args.backend {
        cfg.accelerator.backend = backend.trim().to_lowercase();
    }
    if !args.devices.is_empty() {
        cfg.capture.devices = args.devices;
    }
    if let Some(max_batch) = args.max_batch {
        cfg.batch.max_batch_size = max_batch;
    }
    if args.primary.is_some() {
        cfg.display.primary = args.primary;
    }
    cfg.validate()?;

    let signal = ShutdownSignal::new();
    {
        let signal = signal.clone();
        ctrlc::set_handler(move || {
            log::info!("interrupt received, shutting down");
            signal.raise();
        })
        .context("install Ctrl-C handler")?;
    }

    let display = Arc::new(LogDisplay::new(
        cfg.display.primary.map(SourceId),
        cfg.display.log_every,
        signal.clone(),
    ));
    log::info!(
        "multicamd {}: backend={} max_batch={} tick={:?}..{:?}",
        env!("CARGO_PKG_VERSION"),
        cfg.accelerator.backend,
        cfg.batch.max_batch_size,
        cfg.tick.bounds.min,
        cfg.tick.bounds.max
    );

    let mut controller = PipelineController::from_config(cfg, display)?.with_shutdown_signal(signal);
    controller.start()?;
    match args.duration_secs {
        Some(secs) => controller.run_for(Duration::from_secs(secs)),
        None => controller.run(),
    }

    let stats = controller.dispatch_stats();
    let snapshot = controller.shutdown()?;
    log::info!(
        "batches: {} submitted, {} rejected, {} skipped, {} failed",
        stats.submitted,
        stats.rejected,
        stats.skipped,
        stats.failed
    );
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
