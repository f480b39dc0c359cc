use tracing::{debug, info};

use super::manifest::{read_result_file, remove_quietly, write_source_items, WorkArea};
use super::WorkerLauncher;
use crate::config::WorkerConfig;
use crate::error::{Result, SubforgeError};
use crate::process::{kill_process_group, ProcessRegistry};
use crate::subtitle::Segment;

/// One synchronous source → pivot translation through a legacy-mode worker.
pub struct PivotPass<'a> {
    pub launcher: &'a dyn WorkerLauncher,
    pub registry: &'a ProcessRegistry,
    pub worker: &'a WorkerConfig,
    pub area: &'a WorkArea,
    pub batch_size: usize,
}

impl PivotPass<'_> {
    /// Translate `source` into the pivot language. The returned lines are
    /// aligned with `source`; the temp files are removed on every path.
    pub async fn run(&self, source: &[Segment], src_code: &str, pivot_code: &str, label: &str) -> Result<Vec<String>> {
        let input = self.area.pivot_input_path();
        let output = self.area.pivot_output_path();

        let result = self.translate(source, src_code, pivot_code, label).await;

        remove_quietly(&input).await;
        remove_quietly(&output).await;
        result
    }

    async fn translate(&self, source: &[Segment], src_code: &str, pivot_code: &str, label: &str) -> Result<Vec<String>> {
        let input = self.area.pivot_input_path();
        let output = self.area.pivot_output_path();
        remove_quietly(&output).await;
        write_source_items(&input, source).await?;

        info!("Pivot pass {} -> {} ({} segments)", src_code, pivot_code, source.len());
        let mut cmd = self.launcher.command();
        cmd.arg(&input)
            .arg(&output)
            .arg(src_code)
            .arg(pivot_code)
            .arg(self.batch_size.to_string())
            .arg(label);

        let mut child = cmd
            .spawn()
            .map_err(|e| SubforgeError::Worker(format!("Failed to start pivot worker: {}", e)))?;
        let pid = child.id();
        if let Some(pid) = pid {
            self.registry.register(pid);
        }
        let status = child.wait().await;
        if let Some(pid) = pid {
            kill_process_group(pid).await;
            self.registry.unregister(pid);
        }

        let status = status?;
        if !status.success() {
            return Err(SubforgeError::Worker(format!("Pivot worker exited with {}", status)));
        }
        if !output.exists() {
            return Err(SubforgeError::Worker("Pivot worker produced no output".to_string()));
        }

        let lines = read_result_file(&output, self.worker.read_retries, self.worker.read_backoff()).await?;
        if lines.len() != source.len() {
            return Err(SubforgeError::Worker(format!(
                "Pivot output has {} lines for {} segments",
                lines.len(),
                source.len()
            )));
        }
        debug!("Pivot pass produced {} lines", lines.len());
        Ok(lines)
    }
}

/// Pivot text carrying the original timings.
pub fn pivot_source(source: &[Segment], lines: &[String]) -> Vec<Segment> {
    source
        .iter()
        .zip(lines)
        .map(|(seg, text)| Segment::new(seg.start, seg.end, text.clone()))
        .collect()
}
