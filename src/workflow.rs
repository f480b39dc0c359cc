use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::Result;
use crate::hardware::HardwareProfile;
use crate::media::{multilang_output_path, partial_output_prefix, MediaProcessor, SubtitleTrack};
use crate::models::ModelManager;
use crate::process::ProcessRegistry;
use crate::resume::{base_name, video_folder, ResumeStore};
use crate::subtitle::Segment;
use crate::transcribe::TranscriptionStage;
use crate::translate::{TranslationOrchestrator, WorkerLauncher};

/// Extensions of intermediate files removed after each video.
const TEMP_SUFFIXES: [&str; 4] = [".wav", ".mp3", ".json", ".False.srt"];
const CLEANUP_ATTEMPTS: u32 = 3;
const CLEANUP_RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Pipeline stages, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CheckOutput,
    Resume,
    Transcribe,
    PersistSource,
    Translate,
    Finalize,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::CheckOutput => "check-output",
            Stage::Resume => "resume",
            Stage::Transcribe => "transcribe",
            Stage::PersistSource => "persist-source",
            Stage::Translate => "translate",
            Stage::Finalize => "finalize",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// How processing of one video ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// The multi-language output already existed
    Done,
    /// Transcription produced no usable speech
    DoneNoSpeech,
    /// Output written with this many subtitle tracks
    Completed { tracks: usize },
    Failed(String),
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Done => write!(f, "already done"),
            PipelineOutcome::DoneNoSpeech => write!(f, "no speech"),
            PipelineOutcome::Completed { tracks } => write!(f, "completed with {} subtitle tracks", tracks),
            PipelineOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub done: usize,
    pub no_speech: usize,
    pub completed: usize,
    pub failed: Vec<PathBuf>,
}

pub struct Pipeline {
    config: Config,
    hardware: HardwareProfile,
    media: Box<dyn MediaProcessor>,
    models: ModelManager,
    launcher: Box<dyn WorkerLauncher>,
    registry: ProcessRegistry,
    forced_language: Option<String>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        hardware: HardwareProfile,
        media: Box<dyn MediaProcessor>,
        models: ModelManager,
        launcher: Box<dyn WorkerLauncher>,
        registry: ProcessRegistry,
    ) -> Self {
        let forced_language = config.transcriber.language.clone();
        Self {
            config,
            hardware,
            media,
            models,
            launcher,
            registry,
            forced_language,
        }
    }

    /// Process videos one after another; a failed video never stops the batch.
    pub async fn process_all(&mut self, videos: &[PathBuf]) -> BatchReport {
        let mut report = BatchReport::default();
        for (i, video) in videos.iter().enumerate() {
            info!("[{}/{}] {}", i + 1, videos.len(), video.display());
            match self.process_video(video).await {
                PipelineOutcome::Done => report.done += 1,
                PipelineOutcome::DoneNoSpeech => report.no_speech += 1,
                PipelineOutcome::Completed { .. } => report.completed += 1,
                PipelineOutcome::Failed(_) => report.failed.push(video.clone()),
            }
        }
        report
    }

    /// Run the whole state machine for one video. Cleanup runs on every
    /// path except the already-done short circuit.
    pub async fn process_video(&mut self, video: &Path) -> PipelineOutcome {
        debug!("Stage {} for {}", Stage::CheckOutput, video.display());
        let output = multilang_output_path(video);
        if output.exists() {
            info!("Output already exists, skipping: {}", output.display());
            return PipelineOutcome::Done;
        }

        let outcome = match self.run_stages(video, &output).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Processing {} failed: {}", video.display(), e);
                PipelineOutcome::Failed(e.to_string())
            }
        };

        debug!("Stage {} for {}", Stage::Cleanup, video.display());
        self.models.offload_all().await;
        let removed = cleanup_temp_files(video).await;
        debug!("Removed {} temporary files", removed);

        info!("{}: {}", video.display(), outcome);
        outcome
    }

    async fn run_stages(&mut self, video: &Path, output: &Path) -> Result<PipelineOutcome> {
        let store = ResumeStore::for_video(video, self.config.resume_languages.clone())?;

        debug!("Stage {}", Stage::Resume);
        let (segments, src_lang) = match store.find_checkpoint(self.forced_language.as_deref()).await {
            Some(checkpoint) => {
                info!("Resuming from {} checkpoint, skipping transcription", checkpoint.lang);
                (checkpoint.segments, checkpoint.lang)
            }
            None => {
                debug!("Stage {}", Stage::Transcribe);
                let stage = TranscriptionStage::new(&self.config, self.media.as_ref(), &self.hardware.tuning);
                let result = stage
                    .run(video, self.forced_language.as_deref(), &mut self.models)
                    .await?;
                if result.segments.is_empty() {
                    warn!("No speech detected in {}", video.display());
                    return Ok(PipelineOutcome::DoneNoSpeech);
                }

                debug!("Stage {}", Stage::PersistSource);
                self.persist_source(&store, &result.language, &result.segments).await;
                (result.segments, result.language)
            }
        };

        debug!("Stage {}", Stage::Translate);
        self.models.offload_transcriber().await;
        self.models.offload_separator().await;
        let orchestrator = TranslationOrchestrator::new(
            &self.config,
            self.launcher.as_ref(),
            self.registry.clone(),
            self.hardware.tuning.translation_batch,
        );
        match orchestrator.translate(&segments, &src_lang, &store, &mut self.models).await {
            Ok(report) => info!(
                "Translation: {} done now, {} already done, {} pending",
                report.completed.len(),
                report.skipped.len(),
                report.pending.len()
            ),
            Err(e) => error!("Translation stage failed: {}", e),
        }

        debug!("Stage {}", Stage::Finalize);
        let tracks = self.collect_tracks(&store, &src_lang).await;
        if tracks.is_empty() {
            warn!("No valid subtitles to embed for {}", video.display());
            return Ok(PipelineOutcome::Completed { tracks: 0 });
        }
        self.media.mux_subtitles(video, &tracks, output).await?;
        Ok(PipelineOutcome::Completed { tracks: tracks.len() })
    }

    async fn persist_source(&self, store: &ResumeStore, lang: &str, segments: &[Segment]) {
        match store.save(lang, segments).await {
            Ok(path) => info!("Source checkpoint saved: {}", path.display()),
            Err(e) => error!("Could not save source checkpoint, continuing in memory: {}", e),
        }
    }

    /// Source checkpoint first, then every satisfied target in configured order.
    pub async fn collect_tracks(&self, store: &ResumeStore, src_lang: &str) -> Vec<SubtitleTrack> {
        let mut tracks = Vec::new();
        if store.is_target_satisfied(src_lang).await {
            tracks.push(SubtitleTrack {
                path: store.checkpoint_path(src_lang),
                lang: src_lang.to_string(),
                label: self.config.label(src_lang),
            });
        }
        for target in &self.config.target_languages {
            if target.lang == src_lang {
                continue;
            }
            if store.is_target_satisfied(&target.lang).await {
                tracks.push(SubtitleTrack {
                    path: store.checkpoint_path(&target.lang),
                    lang: target.lang.clone(),
                    label: target.label.clone(),
                });
            }
        }
        tracks
    }
}

fn is_temp_artifact(name: &str, base: &str) -> bool {
    let own_name = name
        .strip_prefix(base)
        .is_some_and(|rest| rest.starts_with('_') || rest.starts_with('.'));
    let owned = own_name || name.starts_with(&format!(".temp_output.{}.", base));
    owned && TEMP_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

/// Remove intermediate audio and text files tied to the video's base name.
/// Returns how many were removed; failures are logged only.
pub async fn cleanup_temp_files(video: &Path) -> usize {
    let Ok(base) = base_name(video) else {
        return 0;
    };
    let Ok(mut entries) = fs::read_dir(video_folder(video)).await else {
        return 0;
    };

    let partial_prefix = partial_output_prefix(video);
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let interrupted_mux = name.starts_with(&partial_prefix);
        if path == video || !(interrupted_mux || is_temp_artifact(&name, &base)) {
            continue;
        }
        if remove_with_retry(&path).await {
            removed += 1;
        }
    }
    removed
}

async fn remove_with_retry(path: &Path) -> bool {
    for attempt in 1..=CLEANUP_ATTEMPTS {
        match fs::remove_file(path).await {
            Ok(()) => {
                debug!("Cleaned up {}", path.display());
                return true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
            Err(e) if attempt < CLEANUP_ATTEMPTS => {
                debug!("Removing {} failed (attempt {}): {}", path.display(), attempt, e);
                tokio::time::sleep(CLEANUP_RETRY_PAUSE).await;
            }
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }
    false
}

/// Videos to process: the file itself, or every video under a directory,
/// skipping outputs of earlier runs.
pub fn collect_videos(input: &Path, extensions: &[String]) -> Vec<PathBuf> {
    if input.is_file() {
        return vec![input.to_path_buf()];
    }

    let wanted: Vec<String> = extensions
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect();

    let mut videos: Vec<PathBuf> = WalkDir::new(input)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|path| {
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            wanted.contains(&ext) && !stem.ends_with("_multilang")
        })
        .collect();
    videos.sort();
    videos
}
