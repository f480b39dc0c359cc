use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SubforgeError};

/// Loudness normalization applied to audio handed to the transcriber.
pub const LOUDNORM_FILTER: &str = "loudnorm=I=-16:TP=-1.5:LRA=11";

/// One subtitle stream to embed.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleTrack {
    pub path: std::path::PathBuf,
    pub lang: String,
    pub label: String,
}

/// Abstract media processing command representation
#[derive(Debug, Clone)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Force overwrite output
    pub fn overwrite(self) -> Self {
        self.arg("-y")
    }

    pub fn map<S: Into<String>>(self, spec: S) -> Self {
        self.arg("-map").arg(spec)
    }

    pub fn copy_video(self) -> Self {
        self.arg("-c:v").arg("copy")
    }

    pub fn copy_audio(self) -> Self {
        self.arg("-c:a").arg("copy")
    }

    pub fn no_video(self) -> Self {
        self.arg("-vn")
    }

    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    pub fn subtitle_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:s").arg(codec)
    }

    pub fn audio_sample_rate(self, rate: u32) -> Self {
        self.arg("-ar").arg(rate.to_string())
    }

    pub fn audio_channels(self, channels: u32) -> Self {
        self.arg("-ac").arg(channels.to_string())
    }

    pub fn audio_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-af").arg(filter)
    }

    pub fn threads(self, threads: usize) -> Self {
        self.arg("-threads").arg(threads.max(1).to_string())
    }

    /// Per-subtitle-stream metadata (`-metadata:s:s:<index> key=value`).
    pub fn subtitle_metadata(self, index: usize, key: &str, value: &str) -> Self {
        self.arg(format!("-metadata:s:s:{}", index))
            .arg(format!("{}={}", key, value))
    }

    /// Run to completion, discarding stdout.
    pub async fn execute(&self) -> Result<()> {
        self.execute_output().await.map(|_| ())
    }

    /// Run to completion and return stdout.
    pub async fn execute_output(&self) -> Result<String> {
        debug!("Executing media processing command: {} {:?}", self.binary_path, self.args);

        let output = Command::new(&self.binary_path)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SubforgeError::Media(format!("Failed to execute {}: {}", self.binary_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SubforgeError::Media(format!("{} failed: {}", self.description, stderr.trim())));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Subtitle codec accepted by the output container.
pub fn subtitle_codec_for(output: &Path) -> &'static str {
    let ext = output
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" | "mov" => "mov_text",
        _ => "srt",
    }
}

/// Builder for the commands the pipeline needs
pub struct MediaCommandBuilder {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl MediaCommandBuilder {
    pub fn new<S1: Into<String>, S2: Into<String>>(ffmpeg_path: S1, ffprobe_path: S2) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// Mono 16 kHz float WAV with loudness normalization.
    pub fn extract_clean_audio<P: AsRef<Path>>(&self, video_path: P, audio_path: P, threads: usize) -> MediaCommand {
        MediaCommand::new(&self.ffmpeg_path, "Audio extraction")
            .overwrite()
            .input(video_path)
            .no_video()
            .audio_channels(1)
            .audio_sample_rate(16000)
            .audio_codec("pcm_f32le")
            .audio_filter(LOUDNORM_FILTER)
            .threads(threads)
            .output(audio_path)
    }

    /// Copy every video/audio stream and add one subtitle stream per track.
    pub fn mux_subtitles(&self, video_path: &Path, tracks: &[SubtitleTrack], output_path: &Path) -> MediaCommand {
        let mut cmd = MediaCommand::new(&self.ffmpeg_path, "Subtitle muxing")
            .overwrite()
            .input(video_path);

        for track in tracks {
            cmd = cmd.args(["-sub_charenc", "UTF-8"]).input(&track.path);
        }

        cmd = cmd.map("0:v").map("0:a");
        for i in 0..tracks.len() {
            cmd = cmd.map((i + 1).to_string());
        }

        cmd = cmd
            .copy_video()
            .copy_audio()
            .subtitle_codec(subtitle_codec_for(output_path));

        for (i, track) in tracks.iter().enumerate() {
            cmd = cmd
                .subtitle_metadata(i, "language", &track.lang)
                .subtitle_metadata(i, "title", &track.label);
        }

        cmd.args(["-loglevel", "error"]).output(output_path)
    }

    /// Container duration in seconds on stdout.
    pub fn probe_duration<P: AsRef<Path>>(&self, media_path: P) -> MediaCommand {
        MediaCommand::new(&self.ffprobe_path, "Duration probe")
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .output(media_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn builder() -> MediaCommandBuilder {
        MediaCommandBuilder::new("ffmpeg", "ffprobe")
    }

    #[test]
    fn mux_maps_every_track_with_metadata() {
        let tracks = vec![
            SubtitleTrack {
                path: PathBuf::from("/v/film.ro.srt"),
                lang: "ro".to_string(),
                label: "RO".to_string(),
            },
            SubtitleTrack {
                path: PathBuf::from("/v/film.en.srt"),
                lang: "en".to_string(),
                label: "English".to_string(),
            },
        ];
        let cmd = builder().mux_subtitles(Path::new("/v/film.mp4"), &tracks, Path::new("/v/film_multilang.mp4"));
        let args = cmd.args.join(" ");

        assert!(args.starts_with("-y -i /v/film.mp4 -sub_charenc UTF-8 -i /v/film.ro.srt"));
        assert!(args.contains("-map 0:v -map 0:a -map 1 -map 2"));
        assert!(args.contains("-c:s mov_text"));
        assert!(args.contains("-metadata:s:s:1 language=en -metadata:s:s:1 title=English"));
        assert_eq!(cmd.args.last().unwrap(), "/v/film_multilang.mp4");
    }

    #[test]
    fn subtitle_codec_follows_container() {
        assert_eq!(subtitle_codec_for(Path::new("a.MP4")), "mov_text");
        assert_eq!(subtitle_codec_for(Path::new("a.mov")), "mov_text");
        assert_eq!(subtitle_codec_for(Path::new("a.mkv")), "srt");
    }

    #[test]
    fn audio_extraction_normalizes_to_mono_16k() {
        let cmd = builder().extract_clean_audio("in.mkv", "in_temp.wav", 6);
        let args = cmd.args.join(" ");
        assert!(args.contains("-vn -ac 1 -ar 16000 -c:a pcm_f32le"));
        assert!(args.contains(LOUDNORM_FILTER));
        assert!(args.contains("-threads 6"));
        assert_eq!(cmd.args.last().unwrap(), "in_temp.wav");
    }
}
