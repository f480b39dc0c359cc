//! Subforge - resumable multi-language subtitle pipeline
//!
//! Entry point of the parent process: probes the hardware, then runs every
//! input video through transcription, isolated translation and muxing.

use anyhow::{bail, Result};
use clap::Parser;
use tracing::{error, info, warn};

use subforge::cli::Args;
use subforge::config::Config;
use subforge::hardware::HardwareProfile;
use subforge::logging;
use subforge::media::MediaProcessorFactory;
use subforge::models::{ExternalModelProvider, ModelManager};
use subforge::process::{find_worker_binary, spawn_signal_listener, ProcessRegistry};
use subforge::translate::BinaryLauncher;
use subforge::workflow::{collect_videos, Pipeline};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    args.apply_to(&mut config)?;
    config.validate()?;

    let _guard = logging::init("subforge.log", args.verbose || config.debug_logging)?;
    info!("Starting subforge");

    if !args.input.exists() {
        bail!("Input not found: {}", args.input.display());
    }

    let hardware = HardwareProfile::probe(&config.performance, config.translator.num_beams);
    hardware.log_summary();

    let media = MediaProcessorFactory::create_processor(config.media.clone(), hardware.tuning.ffmpeg_threads);
    media.check_availability()?;

    let registry = ProcessRegistry::new();
    spawn_signal_listener(registry.clone(), config.worker.terminate_grace());

    let worker = find_worker_binary(config.worker.binary_path.as_deref());
    info!("Translation worker: {}", worker.display());
    let config_path = args
        .config
        .as_ref()
        .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()));
    let launcher = BinaryLauncher::new(worker, config_path, config.performance.force_cpu);

    let models = ModelManager::new(Box::new(ExternalModelProvider::new(config.clone(), hardware.clone())));
    let videos = collect_videos(&args.input, &config.media.video_extensions);
    if videos.is_empty() {
        warn!("No videos found in {}", args.input.display());
        return Ok(());
    }
    info!("Found {} videos to process", videos.len());

    let mut pipeline = Pipeline::new(config, hardware, media, models, Box::new(launcher), registry);
    let report = pipeline.process_all(&videos).await;

    info!(
        "Finished: {} completed, {} already done, {} without speech, {} failed",
        report.completed,
        report.done,
        report.no_speech,
        report.failed.len()
    );
    if !report.failed.is_empty() {
        for video in &report.failed {
            error!("Failed: {}", video.display());
        }
        bail!("{} of {} videos failed", report.failed.len(), videos.len());
    }
    Ok(())
}
