//! Files exchanged between the pipeline and the isolated worker.
//!
//! All of them live next to the video and are named after its base name:
//! - `<base>.manifest.json`: the job list
//! - `<base>.common_input.json`: source items shared by every job
//! - `.temp_output.<base>.<lang>.json`: one result array per job
//! - `<base>.pivot_input.json` / `<base>.pivot_output.json`: pivot pass

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{Result, SubforgeError};
use crate::subtitle::{write_atomic, Segment};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationJob {
    /// ISO code, names the checkpoint
    pub lang: String,
    pub label: String,
    pub tgt_code: String,
    pub src_code: String,
    #[serde(rename = "input")]
    pub input_path: PathBuf,
    #[serde(rename = "output")]
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub jobs: Vec<TranslationJob>,
}

impl Manifest {
    pub async fn write(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &content).await
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let content = fs::read(path).await?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// Names of every transient file for one video.
#[derive(Debug, Clone)]
pub struct WorkArea {
    folder: PathBuf,
    base_name: String,
}

impl WorkArea {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(folder: P, base_name: S) -> Self {
        Self {
            folder: folder.into(),
            base_name: base_name.into(),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.folder.join(format!("{}.manifest.json", self.base_name))
    }

    pub fn common_input_path(&self) -> PathBuf {
        self.folder.join(format!("{}.common_input.json", self.base_name))
    }

    pub fn result_path(&self, lang: &str) -> PathBuf {
        self.folder.join(format!(".temp_output.{}.{}.json", self.base_name, lang))
    }

    pub fn pivot_input_path(&self) -> PathBuf {
        self.folder.join(format!("{}.pivot_input.json", self.base_name))
    }

    pub fn pivot_output_path(&self) -> PathBuf {
        self.folder.join(format!("{}.pivot_output.json", self.base_name))
    }
}

/// Keep only segments with text, trimmed.
pub fn prepare_source(segments: &[Segment]) -> Vec<Segment> {
    segments
        .iter()
        .filter(|s| !s.text.trim().is_empty())
        .map(|s| Segment::new(s.start, s.end, s.text.trim()))
        .collect()
}

pub async fn write_source_items(path: &Path, items: &[Segment]) -> Result<()> {
    let content = serde_json::to_vec(items)?;
    write_atomic(path, &content).await
}

pub async fn read_source_items(path: &Path) -> Result<Vec<Segment>> {
    let content = fs::read(path).await?;
    Ok(serde_json::from_slice(&content)?)
}

/// Atomically publish a result array.
pub async fn write_result_file(path: &Path, translations: &[String]) -> Result<()> {
    let content = serde_json::to_vec(translations)?;
    write_atomic(path, &content).await
}

/// Read a result array, retrying transient failures a bounded number of times.
pub async fn read_result_file(path: &Path, attempts: u32, backoff: Duration) -> Result<Vec<String>> {
    let attempts = attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
                Ok(lines) => return Ok(lines),
                Err(e) => last_error = e.to_string(),
            },
            Err(e) => last_error = e.to_string(),
        }
        debug!("Read attempt {}/{} for {} failed: {}", attempt, attempts, path.display(), last_error);
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }

    Err(SubforgeError::Worker(format!(
        "Could not read {}: {}",
        path.display(),
        last_error
    )))
}

/// Remove a file if present; failures are logged, never raised.
pub async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove {}: {}", path.display(), e),
    }
}
