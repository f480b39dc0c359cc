//! Per-language checkpoints.
//!
//! A `<base>.<lang>.srt` file next to the video marks a stage as complete
//! once it passes [`validate_srt`]. Corrupt or missing files mean the stage
//! runs again.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{Result, SubforgeError};
use crate::subtitle::{read_srt, save_translated_srt, validate_srt, write_srt, Segment};

/// Segments recovered from an existing checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub lang: String,
    pub path: PathBuf,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
pub struct ResumeStore {
    folder: PathBuf,
    base_name: String,
    probe_order: Vec<String>,
}

/// File stem of a video, used to name every derived artifact.
pub fn base_name(video: &Path) -> Result<String> {
    video
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| SubforgeError::FileNotFound(format!("No file name in {}", video.display())))
}

/// Directory holding a video; `.` for bare file names.
pub fn video_folder(video: &Path) -> PathBuf {
    match video.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

impl ResumeStore {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(folder: P, base_name: S, probe_order: Vec<String>) -> Self {
        Self {
            folder: folder.into(),
            base_name: base_name.into(),
            probe_order,
        }
    }

    pub fn for_video(video: &Path, probe_order: Vec<String>) -> Result<Self> {
        Ok(Self::new(video_folder(video), base_name(video)?, probe_order))
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn checkpoint_path(&self, lang: &str) -> PathBuf {
        self.folder.join(format!("{}.{}.srt", self.base_name, lang))
    }

    /// True when the language's checkpoint exists and is structurally valid.
    pub async fn is_target_satisfied(&self, lang: &str) -> bool {
        validate_srt(&self.checkpoint_path(lang)).await
    }

    /// Forced language: only that file. Otherwise the probe order, first
    /// valid non-empty checkpoint wins.
    pub async fn find_checkpoint(&self, language: Option<&str>) -> Option<Checkpoint> {
        let candidates: Vec<&str> = match language {
            Some(lang) => vec![lang],
            None => self.probe_order.iter().map(String::as_str).collect(),
        };

        for lang in candidates {
            if let Some(checkpoint) = self.load(lang).await {
                info!("Found valid checkpoint: {}", checkpoint.path.display());
                return Some(checkpoint);
            }
        }
        None
    }

    async fn load(&self, lang: &str) -> Option<Checkpoint> {
        let path = self.checkpoint_path(lang);
        if !path.exists() {
            return None;
        }
        match read_srt(&path).await {
            Ok(segments) if !segments.is_empty() => Some(Checkpoint {
                lang: lang.to_string(),
                path,
                segments,
            }),
            Ok(_) => {
                warn!("Checkpoint {} holds no cues, ignoring it", path.display());
                None
            }
            Err(e) => {
                warn!("Checkpoint {} is corrupted, ignoring it: {}", path.display(), e);
                None
            }
        }
    }

    /// Atomically write the checkpoint for `lang`.
    pub async fn save(&self, lang: &str, segments: &[Segment]) -> Result<PathBuf> {
        let path = self.checkpoint_path(lang);
        write_srt(segments, &path).await?;
        Ok(path)
    }

    /// Atomically write a translated checkpoint aligned with `segments`.
    pub async fn save_translated(
        &self,
        lang: &str,
        segments: &[Segment],
        translations: &[String],
    ) -> Result<PathBuf> {
        let path = self.checkpoint_path(lang);
        save_translated_srt(segments, translations, &path).await?;
        Ok(path)
    }
}
