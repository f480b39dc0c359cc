// Transcription stage
//
// Turns a video into filtered source-language segments:
// - Separation: optional vocal isolation ahead of transcription
// - Transcription with a single out-of-memory retry at half beam width
// - Hallucination filtering of the raw segments

pub mod separation;

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub use separation::*;

use crate::config::Config;
use crate::error::Result;
use crate::hardware::Tuning;
use crate::media::MediaProcessor;
use crate::models::{ModelManager, TranscribeOptions, TranscriptionOutput};
use crate::quality::{warn_on_low_confidence, FilterReport, HallucinationFilter};
use crate::subtitle::Segment;

/// Pause between offloading after an out-of-memory error and the retry.
pub const OOM_RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TranscriptionResult {
    pub segments: Vec<Segment>,
    pub language: String,
    pub duration: f64,
    pub filtered: FilterReport,
}

pub struct TranscriptionStage<'a> {
    config: &'a Config,
    media: &'a dyn MediaProcessor,
    tuning: &'a Tuning,
}

impl<'a> TranscriptionStage<'a> {
    pub fn new(config: &'a Config, media: &'a dyn MediaProcessor, tuning: &'a Tuning) -> Self {
        Self { config, media, tuning }
    }

    /// Transcribe `video`. `language` forces the source language, otherwise
    /// the transcriber detects it.
    pub async fn run(&self, video: &Path, language: Option<&str>, models: &mut ModelManager) -> Result<TranscriptionResult> {
        let audio = self.prepare_audio(video, models).await?;

        let options = TranscribeOptions {
            language: language.map(str::to_string),
            initial_prompt: self.config.effective_prompt().map(str::to_string),
            beam_size: self.tuning.whisper_beam,
        };
        info!("Transcribing {} (beam {})", audio.display(), options.beam_size);
        let output = transcribe_with_retry(models, &audio, options).await?;
        models.offload_transcriber().await;

        let language = language.map(str::to_string).unwrap_or_else(|| output.language.clone());
        warn_on_low_confidence(&output.language, output.language_probability);

        let filter = HallucinationFilter::new(&self.config.hallucinations);
        let (segments, filtered) = filter.apply(output.segments);
        info!("Transcribed {} segments in '{}'", segments.len(), language);

        Ok(TranscriptionResult {
            segments,
            language,
            duration: output.duration,
            filtered,
        })
    }

    /// Audio handed to the transcriber: the isolated vocal track when
    /// separation is enabled and works, the clean extracted audio otherwise.
    async fn prepare_audio(&self, video: &Path, models: &mut ModelManager) -> Result<PathBuf> {
        if !self.config.separator.enabled {
            return self.media.extract_clean_audio(video).await;
        }

        if let Some(vocals) = find_existing_vocals(video).await {
            info!("Reusing separated vocals {}", vocals.display());
            return Ok(vocals);
        }

        let clean = self.media.extract_clean_audio(video).await?;
        let audio = match separate_vocals(&clean, video, models).await {
            Ok(Some(vocals)) => vocals,
            Ok(None) => {
                warn!("Separator produced no vocal track, using extracted audio");
                clean
            }
            Err(e) => {
                warn!("Vocal separation failed, using extracted audio: {}", e);
                clean
            }
        };
        models.offload_separator().await;
        Ok(audio)
    }
}

/// Transcribe once; on an out-of-memory failure reclaim memory and retry
/// exactly once with half the beam width.
pub async fn transcribe_with_retry(
    models: &mut ModelManager,
    audio: &Path,
    mut options: TranscribeOptions,
) -> Result<TranscriptionOutput> {
    let first = {
        let transcriber = models.get_transcriber().await?;
        transcriber.transcribe(audio, &options).await
    };

    match first {
        Err(e) if e.is_out_of_memory() => {
            let reduced = (options.beam_size / 2).max(1);
            warn!("Out of memory during transcription, retrying with beam {}: {}", reduced, e);
            models.offload_transcriber().await;
            tokio::time::sleep(OOM_RETRY_PAUSE).await;

            options.beam_size = reduced;
            let transcriber = models.get_transcriber().await?;
            transcriber.transcribe(audio, &options).await
        }
        other => other,
    }
}
