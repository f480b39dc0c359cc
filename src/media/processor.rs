use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{MediaCommandBuilder, MediaProcessor, SubtitleTrack};
use crate::config::MediaConfig;
use crate::error::{Result, SubforgeError};

/// Extracted audio smaller than this is treated as a failed extraction.
pub const MIN_AUDIO_BYTES: u64 = 1024;

/// `<folder>/<base>_temp.wav`
pub fn clean_audio_path(video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    video.with_file_name(format!("{}_temp.wav", stem))
}

/// `<folder>/<base>_multilang<ext>`
pub fn multilang_output_path(video: &Path) -> PathBuf {
    let stem = video
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match video.extension() {
        Some(ext) => format!("{}_multilang.{}", stem, ext.to_string_lossy()),
        None => format!("{}_multilang", stem),
    };
    video.with_file_name(name)
}

/// Infix of the hidden file a mux writes before it is renamed into place.
pub const PARTIAL_MARKER: &str = ".partial-";

/// `<folder>/.<output stem>.partial-<id><ext>`, keeping the container
/// extension so ffmpeg picks the right muxer.
pub fn partial_output_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let id = Uuid::new_v4().simple();
    let name = match output.extension() {
        Some(ext) => format!(".{}{}{}.{}", stem, PARTIAL_MARKER, id, ext.to_string_lossy()),
        None => format!(".{}{}{}", stem, PARTIAL_MARKER, id),
    };
    output.with_file_name(name)
}

/// File name prefix of interrupted muxes for `video`.
pub fn partial_output_prefix(video: &Path) -> String {
    let stem = multilang_output_path(video)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    format!(".{}{}", stem, PARTIAL_MARKER)
}

/// FFmpeg-backed media processor
pub struct FfmpegProcessor {
    config: MediaConfig,
    command_builder: MediaCommandBuilder,
    threads: usize,
}

impl FfmpegProcessor {
    pub fn new(config: MediaConfig, threads: usize) -> Self {
        let command_builder = MediaCommandBuilder::new(&config.ffmpeg_path, &config.ffprobe_path);
        Self {
            config,
            command_builder,
            threads,
        }
    }

    async fn remove_with_retry(path: &Path) {
        for attempt in 0..3 {
            match tokio::fs::remove_file(path).await {
                Ok(()) => return,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) => {
                    debug!("Could not remove {} (attempt {}): {}", path.display(), attempt + 1, e);
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }
    }
}

#[async_trait]
impl MediaProcessor for FfmpegProcessor {
    async fn extract_clean_audio(&self, video: &Path) -> Result<PathBuf> {
        let wav = clean_audio_path(video);

        if wav.exists() && self.probe_duration(&wav).await > 0.0 {
            info!("Reusing extracted audio {}", wav.display());
            return Ok(wav);
        }

        info!("Extracting and normalizing audio from {}", video.display());
        let command = self.command_builder.extract_clean_audio(video, wav.as_path(), self.threads);
        if let Err(e) = command.execute().await {
            Self::remove_with_retry(&wav).await;
            return Err(e);
        }

        let size = tokio::fs::metadata(&wav).await.map(|m| m.len()).unwrap_or(0);
        if size < MIN_AUDIO_BYTES {
            return Err(SubforgeError::Media(format!(
                "Extracted audio {} is invalid or empty",
                wav.display()
            )));
        }
        Ok(wav)
    }

    async fn probe_duration(&self, media: &Path) -> f64 {
        match self.command_builder.probe_duration(media).execute_output().await {
            Ok(stdout) => stdout.trim().parse::<f64>().unwrap_or(0.0),
            Err(e) => {
                debug!("Duration probe failed for {}: {}", media.display(), e);
                0.0
            }
        }
    }

    async fn mux_subtitles(&self, video: &Path, tracks: &[SubtitleTrack], output: &Path) -> Result<()> {
        if tracks.is_empty() {
            warn!("No subtitle tracks to embed into {}", video.display());
            return Ok(());
        }
        info!("Muxing {} subtitle tracks into {}", tracks.len(), output.display());

        let partial = partial_output_path(output);
        let command = self.command_builder.mux_subtitles(video, tracks, &partial);
        if let Err(e) = command.execute().await {
            Self::remove_with_retry(&partial).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&partial, output).await {
            Self::remove_with_retry(&partial).await;
            return Err(SubforgeError::Media(format!(
                "Failed to move muxed output to {}: {}",
                output.display(),
                e
            )));
        }
        info!("Output written: {}", output.display());
        Ok(())
    }

    fn check_availability(&self) -> Result<()> {
        let output = Command::new(&self.config.ffmpeg_path)
            .arg("-version")
            .output()
            .map_err(|e| SubforgeError::Media(format!("Media processor not found: {}", e)))?;

        if output.status.success() {
            debug!("Media processor is available");
            Ok(())
        } else {
            Err(SubforgeError::Media("Media processor version check failed".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths() {
        assert_eq!(clean_audio_path(Path::new("/v/film.mkv")), PathBuf::from("/v/film_temp.wav"));
        assert_eq!(
            multilang_output_path(Path::new("/v/film.mkv")),
            PathBuf::from("/v/film_multilang.mkv")
        );
        assert_eq!(multilang_output_path(Path::new("clip")), PathBuf::from("clip_multilang"));
    }

    #[test]
    fn partial_output_keeps_the_container_extension() {
        let video = Path::new("/v/film.mkv");
        let partial = partial_output_path(&multilang_output_path(video));
        let name = partial.file_name().unwrap().to_string_lossy().to_string();

        assert_eq!(partial.parent(), Some(Path::new("/v")));
        assert!(name.starts_with(&partial_output_prefix(video)));
        assert!(name.ends_with(".mkv"));
        assert_ne!(partial, partial_output_path(&multilang_output_path(video)));
    }

    /// A stand-in ffmpeg that writes "muxed" to its last argument.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, exit_code: i32) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ffmpeg");
        let script = format!("#!/bin/sh\nfor last; do :; done\nprintf muxed > \"$last\"\nexit {}\n", exit_code);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    fn track(dir: &Path) -> Vec<SubtitleTrack> {
        vec![SubtitleTrack {
            path: dir.join("film.en.srt"),
            lang: "en".to_string(),
            label: "English".to_string(),
        }]
    }

    #[cfg(unix)]
    fn names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn mux_moves_the_finished_file_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let config = MediaConfig {
            ffmpeg_path: fake_ffmpeg(dir.path(), 0),
            ..MediaConfig::default()
        };
        let processor = FfmpegProcessor::new(config, 1);
        let video = dir.path().join("film.mkv");
        let output = multilang_output_path(&video);

        processor.mux_subtitles(&video, &track(dir.path()), &output).await.unwrap();

        assert_eq!(std::fs::read_to_string(&output).unwrap(), "muxed");
        assert_eq!(names(dir.path()), vec!["ffmpeg", "film_multilang.mkv"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_mux_never_leaves_an_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = MediaConfig {
            ffmpeg_path: fake_ffmpeg(dir.path(), 1),
            ..MediaConfig::default()
        };
        let processor = FfmpegProcessor::new(config, 1);
        let video = dir.path().join("film.mkv");
        let output = multilang_output_path(&video);

        assert!(processor.mux_subtitles(&video, &track(dir.path()), &output).await.is_err());
        assert_eq!(names(dir.path()), vec!["ffmpeg"]);
    }

    #[tokio::test]
    async fn missing_ffprobe_reports_zero_duration() {
        let config = MediaConfig {
            ffprobe_path: "/nonexistent/ffprobe".to_string(),
            ..MediaConfig::default()
        };
        let processor = FfmpegProcessor::new(config, 1);
        assert_eq!(processor.probe_duration(Path::new("x.wav")).await, 0.0);
    }
}
