//! Isolated translation worker.
//!
//! Runs in its own process so that the translation model's accelerator
//! memory is returned to the system when the process exits. Results are
//! handed to the parent through files: each one is published atomically and
//! the worker then waits for the parent to delete it before moving on.

use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::models::TranslationEngine;
use crate::subtitle::Segment;
use crate::translate::{read_source_items, write_result_file, Manifest, TranslationJob};

/// Substituted for every item of a batch the engine failed on.
pub const BATCH_ERROR_TEXT: &str = "Translation Error";

/// Pads results the engine silently dropped.
pub const MISSING_TRANSLATION_TEXT: &str = "[Translation Error]";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub handshake_timeout: Duration,
    pub handshake_poll: Duration,
}

impl WorkerSettings {
    pub fn new(config: &WorkerConfig, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            handshake_timeout: config.handshake_timeout(),
            handshake_poll: config.handshake_poll(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

/// Force `lines` to exactly `expected` entries.
pub fn pad_translations(mut lines: Vec<String>, expected: usize) -> Vec<String> {
    if lines.len() < expected {
        lines.resize(expected, MISSING_TRANSLATION_TEXT.to_string());
    } else {
        lines.truncate(expected);
    }
    lines
}

/// Wait until `path` is gone. Returns false when the timeout elapsed first.
pub async fn wait_until_absent(path: &Path, timeout: Duration, poll: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while path.exists() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
    true
}

fn progress_bar(items: &[Segment], label: &str, step: Option<(usize, usize)>) -> ProgressBar {
    let total_ms = items.last().map(|s| (s.end * 1000.0) as u64).unwrap_or(0).max(1);
    let pb = ProgressBar::new(total_ms);
    let style = ProgressStyle::default_bar()
        .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% ({eta})")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    match step {
        Some((current, total)) => pb.set_message(format!("[{}/{}] {}", current, total, label)),
        None => pb.set_message(label.to_string()),
    }
    pb
}

pub struct JobRunner<'a> {
    engine: &'a mut dyn TranslationEngine,
    settings: WorkerSettings,
}

impl<'a> JobRunner<'a> {
    pub fn new(engine: &'a mut dyn TranslationEngine, settings: WorkerSettings) -> Self {
        Self { engine, settings }
    }

    /// Run every job of a manifest in order. A failed job is logged and the
    /// next one still runs.
    pub async fn run_manifest(&mut self, manifest_path: &Path) -> Result<BatchSummary> {
        let manifest = Manifest::read(manifest_path).await?;
        let total = manifest.jobs.len();
        info!("Worker received {} jobs", total);

        let mut summary = BatchSummary::default();
        for (i, job) in manifest.jobs.iter().enumerate() {
            match self.run_job(job, Some((i + 1, total)), true).await {
                Ok(()) => summary.succeeded.push(job.lang.clone()),
                Err(e) => {
                    error!("Job {} failed: {}", job.lang, e);
                    summary.failed.push(job.lang.clone());
                }
            }
        }
        Ok(summary)
    }

    /// Translate one job and publish its result file. With `await_ack` the
    /// call returns only once the parent deleted the file, or the handshake
    /// timed out.
    pub async fn run_job(&mut self, job: &TranslationJob, step: Option<(usize, usize)>, await_ack: bool) -> Result<()> {
        let items = read_source_items(&job.input_path).await?;
        info!(
            "Translating {} segments {} -> {} ({})",
            items.len(),
            job.src_code,
            job.tgt_code,
            job.label
        );

        let translations = self
            .translate_items(&items, &job.src_code, &job.tgt_code, &job.label, step)
            .await;

        let output = job.output_path.as_path();
        if !wait_until_absent(output, self.settings.handshake_timeout, self.settings.handshake_poll).await {
            warn!("Previous result {} was never consumed, replacing it", output.display());
        }
        write_result_file(output, &translations).await?;

        if await_ack
            && !wait_until_absent(output, self.settings.handshake_timeout, self.settings.handshake_poll).await
        {
            warn!(
                "Parent did not consume {} within {:?}, continuing",
                output.display(),
                self.settings.handshake_timeout
            );
        }
        Ok(())
    }

    /// Translate in batches; a failing batch turns into placeholders.
    pub async fn translate_items(
        &mut self,
        items: &[Segment],
        src_code: &str,
        tgt_code: &str,
        label: &str,
        step: Option<(usize, usize)>,
    ) -> Vec<String> {
        let texts: Vec<String> = items.iter().map(|s| s.text.clone()).collect();
        let pb = progress_bar(items, label, step);
        let mut translations = Vec::with_capacity(texts.len());

        for (batch_no, (chunk, timed)) in texts
            .chunks(self.settings.batch_size)
            .zip(items.chunks(self.settings.batch_size))
            .enumerate()
        {
            match self.engine.translate(chunk, src_code, tgt_code).await {
                Ok(lines) => {
                    if lines.len() != chunk.len() {
                        warn!(
                            "Batch {} returned {} lines for {} inputs",
                            batch_no + 1,
                            lines.len(),
                            chunk.len()
                        );
                    }
                    translations.extend(pad_translations(lines, chunk.len()));
                }
                Err(e) => {
                    warn!("Batch {} failed: {}", batch_no + 1, e);
                    translations.extend(std::iter::repeat_n(BATCH_ERROR_TEXT.to_string(), chunk.len()));
                }
            }
            if let Some(last) = timed.last() {
                pb.set_position((last.end * 1000.0) as u64);
            }
        }
        pb.finish_and_clear();

        pad_translations(translations, texts.len())
    }
}
