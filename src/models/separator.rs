use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::VocalSeparator;
use crate::config::SeparatorConfig;
use crate::error::{Result, SubforgeError};

/// Runs the configured vocal separation CLI.
pub struct CliSeparator {
    config: SeparatorConfig,
}

impl CliSeparator {
    pub fn new(config: SeparatorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl VocalSeparator for CliSeparator {
    async fn separate(&self, audio: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        info!("Separating vocals from {}", audio.display());
        tokio::fs::create_dir_all(output_dir).await?;

        let output = Command::new(&self.config.binary_path)
            .arg(audio)
            .arg("--model_filename")
            .arg(&self.config.model)
            .arg("--model_file_dir")
            .arg(&self.config.model_dir)
            .arg("--output_dir")
            .arg(output_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SubforgeError::Separation(format!("Failed to execute separator: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SubforgeError::Separation(format!("Separator failed: {}", stderr.trim())));
        }

        let stem = audio
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut stems = Vec::new();
        let mut entries = tokio::fs::read_dir(output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&stem) && name.contains('(') && name != audio_name(audio) {
                stems.push(entry.path());
            }
        }
        stems.sort();
        debug!("Separator produced {:?}", stems);
        Ok(stems)
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

fn audio_name(audio: &Path) -> String {
    audio
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
