//! demo - end-to-end synthetic run of the multi-camera pipeline

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use multicam::{
    MemoryDisplay, PipelineConfig, PipelineController, ShutdownSignal, SourceId, SourceState,
    StubAccelerator, StubConfig, SyntheticConfig, SyntheticProvider,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Number of synthetic cameras.
    #[arg(long, default_value_t = 4)]
    cameras: usize,
    /// Total run time in seconds.
    #[arg(long, default_value_t = 5)]
    seconds: u64,
    /// Frames per second per camera.
    #[arg(long, default_value_t = 15)]
    fps: u32,
    /// Maximum frames per batch.
    #[arg(long, default_value_t = 4)]
    max_batch: usize,
    /// Camera index to break partway through the run.
    #[arg(long)]
    fail_camera: Option<usize>,
    /// Seconds before the failing camera breaks.
    #[arg(long, default_value_t = 2)]
    fail_after: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.cameras == 0 {
        return Err(anyhow!("cameras must be >= 1"));
    }
    if args.fail_camera.is_some_and(|index| index >= args.cameras) {
        return Err(anyhow!("fail-camera must be below {}", args.cameras));
    }

    let mut cfg = PipelineConfig::default();
    cfg.batch.max_batch_size = args.max_batch;
    cfg.capture.target_fps = args.fps;
    cfg.capture.width = 64;
    cfg.capture.height = 48;
    cfg.recovery.max_reconnect_attempts = Some(3);
    cfg.recovery.backoff_initial = Duration::from_millis(200);
    cfg.recovery.backoff_max = Duration::from_millis(800);
    cfg.validate()?;

    stage("start synthetic cameras + stub accelerator");
    let provider = Arc::new(SyntheticProvider::new(
        args.cameras,
        SyntheticConfig {
            width: cfg.capture.width,
            height: cfg.capture.height,
            target_fps: args.fps,
        },
    ));
    let accelerator = Arc::new(StubAccelerator::new(StubConfig::from(&cfg.accelerator))?);
    let display = MemoryDisplay::new(ShutdownSignal::new());
    let mut controller = PipelineController::new(
        cfg,
        provider.clone(),
        accelerator,
        Arc::new(display.clone()),
    )?;
    let found = controller.start()?;
    stage(&format!("discovered {} camera(s)", found.len()));

    let total = Duration::from_secs(args.seconds);
    match args.fail_camera {
        Some(index) => {
            let fail_after = Duration::from_secs(args.fail_after).min(total);
            controller.run_for(fail_after);
            let path = format!("stub://cam{}", index);
            let control = provider
                .control(&path)
                .ok_or_else(|| anyhow!("no synthetic camera at {}", path))?;
            stage(&format!("breaking {}", path));
            control.set_removed(true);
            controller.run_for(total.saturating_sub(fail_after));
        }
        None => controller.run_for(total),
    }

    stage("drain + shut down");
    let registry = controller.registry();
    let cameras: Vec<(SourceId, SourceState, String)> = registry
        .states()
        .into_iter()
        .map(|(id, state)| (id, state, registry.path(id).unwrap_or("?").to_string()))
        .collect();
    let stats = controller.dispatch_stats();
    let snapshot = controller.shutdown()?;

    println!("demo summary:");
    println!("  cameras: {}", args.cameras);
    println!(
        "  batches: {} submitted, {} rejected, {} skipped, {} failed",
        stats.submitted, stats.rejected, stats.skipped, stats.failed
    );
    println!("  frames processed: {}", snapshot.frames_processed);
    println!("  detections: {}", snapshot.detections);
    println!("  combined fps: {:.1}", snapshot.combined_fps);
    for (id, state, path) in &cameras {
        println!(
            "  {} {} [{}]: {} frames delivered",
            id,
            path,
            state,
            display.delivered_count(*id)
        );
    }
    Ok(())
}

fn stage(msg: &str) {
    eprintln!("demo: {}", msg);
}
