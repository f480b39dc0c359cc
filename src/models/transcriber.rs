use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use super::{TranscribeOptions, Transcriber, TranscriptionOutput};
use crate::config::TranscriberConfig;
use crate::error::{Result, SubforgeError};
use crate::hardware::Tuning;

/// Runs the configured transcriber CLI and reads its JSON output.
///
/// The CLI receives the audio path plus `--output_dir <dir> --output_format json`
/// and writes `<dir>/<audio stem>.json` shaped like [`TranscriptionOutput`].
pub struct CliTranscriber {
    config: TranscriberConfig,
    tuning: Tuning,
}

impl CliTranscriber {
    pub fn new(config: TranscriberConfig, tuning: Tuning) -> Self {
        Self { config, tuning }
    }

    pub fn build_args(&self, audio: &Path, output_dir: &Path, options: &TranscribeOptions) -> Vec<String> {
        let mut args = vec![
            audio.to_string_lossy().to_string(),
            "--model".to_string(),
            self.config.model.clone(),
            "--output_dir".to_string(),
            output_dir.to_string_lossy().to_string(),
            "--output_format".to_string(),
            "json".to_string(),
            "--device".to_string(),
            self.tuning.device.as_str().to_string(),
            "--compute_type".to_string(),
            self.tuning.whisper_compute.clone(),
            "--beam_size".to_string(),
            options.beam_size.to_string(),
            "--batch_size".to_string(),
            self.tuning.whisper_batch.to_string(),
            "--num_workers".to_string(),
            self.tuning.whisper_workers.to_string(),
            "--vad_filter".to_string(),
            "true".to_string(),
            "--vad_min_silence_ms".to_string(),
            self.config.vad_min_silence_ms.to_string(),
            "--no_speech_threshold".to_string(),
            self.config.no_speech_threshold.to_string(),
        ];

        if let Some(language) = &options.language {
            args.push("--language".to_string());
            args.push(language.clone());
        }
        if let Some(prompt) = &options.initial_prompt {
            args.push("--initial_prompt".to_string());
            args.push(prompt.clone());
        }
        args
    }
}

/// Accelerator memory exhaustion as reported on stderr.
pub fn is_oom_message(stderr: &str) -> bool {
    stderr.to_lowercase().contains("out of memory")
}

#[async_trait]
impl Transcriber for CliTranscriber {
    async fn transcribe(&self, audio: &Path, options: &TranscribeOptions) -> Result<TranscriptionOutput> {
        info!(
            "Transcribing {} (beam {}, language {})",
            audio.display(),
            options.beam_size,
            options.language.as_deref().unwrap_or("auto")
        );

        let temp_dir = tempfile::tempdir()
            .map_err(|e| SubforgeError::Transcription(format!("Failed to create temp directory: {}", e)))?;
        let args = self.build_args(audio, temp_dir.path(), options);
        debug!("Running {} {:?}", self.config.binary_path, args);

        let output = Command::new(&self.config.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SubforgeError::Transcription(format!("Failed to execute transcriber: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_oom_message(&stderr) {
                return Err(SubforgeError::OutOfMemory(stderr.trim().to_string()));
            }
            return Err(SubforgeError::Transcription(format!("Transcriber failed: {}", stderr.trim())));
        }

        let stem = audio
            .file_stem()
            .ok_or_else(|| SubforgeError::Transcription("Invalid audio filename".to_string()))?;
        let json_file = temp_dir.path().join(format!("{}.json", stem.to_string_lossy()));

        let content = tokio::fs::read_to_string(&json_file)
            .await
            .map_err(|e| SubforgeError::Transcription(format!("Failed to read transcriber output: {}", e)))?;
        let parsed: TranscriptionOutput = serde_json::from_str(&content)
            .map_err(|e| SubforgeError::Transcription(format!("Failed to parse transcriber output: {}", e)))?;

        Ok(parsed)
    }

    async fn release(&mut self) -> Result<()> {
        // each run is its own process, nothing stays resident
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Device, Tuning};
    use std::path::PathBuf;

    fn tuning() -> Tuning {
        Tuning {
            device: Device::Cuda,
            whisper_beam: 5,
            whisper_compute: "float16".to_string(),
            whisper_workers: 4,
            whisper_batch: 8,
            translation_batch: 16,
            ffmpeg_threads: 8,
        }
    }

    #[test]
    fn args_carry_tuning_and_options() {
        let transcriber = CliTranscriber::new(TranscriberConfig::default(), tuning());
        let options = TranscribeOptions {
            language: Some("ro".to_string()),
            initial_prompt: None,
            beam_size: 2,
        };
        let args = transcriber.build_args(&PathBuf::from("a.wav"), &PathBuf::from("/tmp/out"), &options);

        let value_of = |flag: &str| {
            let pos = args.iter().position(|a| a == flag).unwrap();
            args[pos + 1].clone()
        };
        assert_eq!(args[0], "a.wav");
        assert_eq!(value_of("--beam_size"), "2");
        assert_eq!(value_of("--batch_size"), "8");
        assert_eq!(value_of("--device"), "cuda");
        assert_eq!(value_of("--language"), "ro");
        assert!(!args.contains(&"--initial_prompt".to_string()));
    }

    #[test]
    fn detects_oom_messages() {
        assert!(is_oom_message("RuntimeError: CUDA failed with error out of memory"));
        assert!(is_oom_message("CUDA OUT OF MEMORY"));
        assert!(!is_oom_message("file not found"));
    }

    #[test]
    fn output_json_parses_with_optional_fields() {
        let parsed: TranscriptionOutput = serde_json::from_str(
            r#"{"language":"en","segments":[{"start":0.0,"end":1.5,"text":" Hi"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.segments[0].no_speech_prob, 0.0);
        assert_eq!(parsed.duration, 0.0);
    }
}
