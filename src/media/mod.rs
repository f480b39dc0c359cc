// Media processing
//
// - Processor: ffmpeg/ffprobe-backed implementation
// - Commands: command builders

pub mod commands;
pub mod processor;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use commands::*;
pub use processor::*;

use crate::config::MediaConfig;
use crate::error::Result;

/// Media operations the pipeline delegates to external tools
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Extract normalized mono audio next to the video, reusing a valid one.
    async fn extract_clean_audio(&self, video: &Path) -> Result<PathBuf>;

    /// Duration in seconds, 0.0 when it cannot be determined.
    async fn probe_duration(&self, media: &Path) -> f64;

    /// Write `output` with every track of `video` plus the subtitle tracks.
    async fn mux_subtitles(&self, video: &Path, tracks: &[SubtitleTrack], output: &Path) -> Result<()>;

    /// Check if media processor is available
    fn check_availability(&self) -> Result<()>;
}

/// Factory for creating media processor instances
pub struct MediaProcessorFactory;

impl MediaProcessorFactory {
    pub fn create_processor(config: MediaConfig, threads: usize) -> Box<dyn MediaProcessor> {
        Box::new(processor::FfmpegProcessor::new(config, threads))
    }
}
