//! Subforge translation worker
//!
//! Loads the translation model once, runs the jobs it was given and exits,
//! returning every byte of accelerator memory to the system.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use subforge::cli::{WorkerArgs, WorkerMode};
use subforge::config::Config;
use subforge::hardware::HardwareProfile;
use subforge::logging;
use subforge::models::{ExternalModelProvider, ModelManager};
use subforge::translate::CONFIG_ENV;
use subforge::worker::{JobRunner, WorkerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let args = WorkerArgs::parse();
    let mode = args.mode().map_err(anyhow::Error::msg)?;

    let config_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let _guard = logging::init("subforge-worker.log", args.verbose || config.debug_logging)?;
    info!("Translation worker started (pid {})", std::process::id());

    let hardware = HardwareProfile::probe(&config.performance, config.translator.num_beams);
    hardware.log_summary();

    let mut models = ModelManager::new(Box::new(ExternalModelProvider::new(config.clone(), hardware.clone())));
    let result = run(mode, &config, &hardware, &mut models).await;
    models.offload_all().await;
    result
}

async fn run(mode: WorkerMode, config: &Config, hardware: &HardwareProfile, models: &mut ModelManager) -> Result<()> {
    let engine = models
        .get_translator()
        .await
        .context("Failed to load the translation model")?;

    match mode {
        WorkerMode::Batch(manifest) => {
            let settings = WorkerSettings::new(&config.worker, hardware.tuning.translation_batch);
            let mut runner = JobRunner::new(engine, settings);
            let summary = runner
                .run_manifest(&manifest)
                .await
                .with_context(|| format!("Failed to run manifest {}", manifest.display()))?;
            if !summary.failed.is_empty() {
                warn!("Jobs failed: {}", summary.failed.join(", "));
            }
            info!("Worker done: {} of {} jobs succeeded", summary.succeeded.len(), summary.succeeded.len() + summary.failed.len());
        }
        WorkerMode::Single(job) => {
            let batch_size = job.batch_size.unwrap_or(hardware.tuning.translation_batch);
            let settings = WorkerSettings::new(&config.worker, batch_size);
            let mut runner = JobRunner::new(engine, settings);
            runner
                .run_job(&job.job(), job.step, false)
                .await
                .with_context(|| format!("Job {} -> {} failed", job.src_code, job.tgt_code))?;
            info!("Wrote {}", job.output.display());
        }
    }
    Ok(())
}
