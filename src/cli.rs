use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;
use crate::error::SubforgeError;
use crate::translate::TranslationJob;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Force the source language (ISO code) instead of detecting it
    #[arg(short, long)]
    pub lang: Option<String>,

    /// Initial prompt for the transcriber
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// Ignore any GPU and run on the CPU
    #[arg(long)]
    pub cpu: bool,

    /// Target languages (comma-separated), replacing the configured set
    #[arg(short, long)]
    pub targets: Option<String>,

    /// Video file, or directory searched recursively for videos
    pub input: PathBuf,
}

impl Args {
    /// Fold command line overrides into the loaded configuration.
    pub fn apply_to(&self, config: &mut Config) -> Result<(), SubforgeError> {
        if let Some(lang) = &self.lang {
            config.transcriber.language = Some(lang.clone());
        }
        if let Some(prompt) = &self.prompt {
            config.transcriber.initial_prompt = Some(prompt.clone());
            config.transcriber.use_prompt = true;
        }
        if self.cpu {
            config.performance.force_cpu = true;
        }
        if let Some(targets) = &self.targets {
            config.restrict_targets(targets)?;
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(name = "subforge-worker", author, version)]
#[command(about = "Isolated translation worker: `--batch <manifest>` or a single legacy job")]
pub struct WorkerArgs {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Manifest listing every job to run
    #[arg(long, value_name = "MANIFEST", conflicts_with = "job")]
    pub batch: Option<PathBuf>,

    /// <input> <output> <src_code> <tgt_code> <batch_size> <label> [<step> <total>]
    #[arg(num_args = 6..=8, value_name = "JOB", allow_negative_numbers = true)]
    pub job: Vec<String>,
}

/// A job given positionally on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub src_code: String,
    pub tgt_code: String,
    /// `None` when the caller asked for the tuned batch size
    pub batch_size: Option<usize>,
    pub label: String,
    pub step: Option<(usize, usize)>,
}

impl SingleJob {
    pub fn job(&self) -> TranslationJob {
        TranslationJob {
            lang: self.tgt_code.clone(),
            label: self.label.clone(),
            tgt_code: self.tgt_code.clone(),
            src_code: self.src_code.clone(),
            input_path: self.input.clone(),
            output_path: self.output.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMode {
    Batch(PathBuf),
    Single(SingleJob),
}

impl WorkerArgs {
    pub fn mode(&self) -> Result<WorkerMode, String> {
        if let Some(manifest) = &self.batch {
            return Ok(WorkerMode::Batch(manifest.clone()));
        }
        let [input, output, src_code, tgt_code, batch_size, label, rest @ ..] = self.job.as_slice() else {
            return Err("expected --batch <manifest> or six job arguments".to_string());
        };

        let batch_size = batch_size
            .parse::<i64>()
            .map_err(|_| format!("invalid batch size '{}'", batch_size))?;
        let step = match rest {
            [current, total] => {
                let current = current.parse::<usize>().map_err(|_| format!("invalid step '{}'", current))?;
                let total = total.parse::<usize>().map_err(|_| format!("invalid step total '{}'", total))?;
                Some((current, total))
            }
            _ => None,
        };

        Ok(WorkerMode::Single(SingleJob {
            input: PathBuf::from(input),
            output: PathBuf::from(output),
            src_code: src_code.clone(),
            tgt_code: tgt_code.clone(),
            batch_size: usize::try_from(batch_size).ok().filter(|b| *b > 0),
            label: label.clone(),
            step,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_fold_into_config() {
        let args = Args::try_parse_from(["subforge", "--lang", "ro", "--cpu", "--targets", "en,de", "--prompt", "Hi", "video.mkv"])
            .unwrap();
        let mut config = Config::default();
        config.transcriber.use_prompt = false;
        args.apply_to(&mut config).unwrap();

        assert_eq!(config.transcriber.language.as_deref(), Some("ro"));
        assert!(config.performance.force_cpu);
        assert_eq!(config.effective_prompt(), Some("Hi"));
        let langs: Vec<&str> = config.target_languages.iter().map(|t| t.lang.as_str()).collect();
        assert_eq!(langs, vec!["en", "de"]);
    }

    #[test]
    fn unknown_target_is_a_config_error() {
        let args = Args::try_parse_from(["subforge", "--targets", "en,klingon", "video.mkv"]).unwrap();
        let mut config = Config::default();
        assert!(matches!(args.apply_to(&mut config), Err(SubforgeError::Config(_))));
    }

    #[test]
    fn worker_batch_mode() {
        let args = WorkerArgs::try_parse_from(["subforge-worker", "--batch", "/v/film.manifest.json"]).unwrap();
        assert_eq!(args.mode().unwrap(), WorkerMode::Batch(PathBuf::from("/v/film.manifest.json")));
    }

    #[test]
    fn worker_legacy_mode_uses_tuned_batch_for_non_positive_sizes() {
        let args = WorkerArgs::try_parse_from([
            "subforge-worker",
            "in.json",
            "out.json",
            "ron_Latn",
            "eng_Latn",
            "0",
            "Pivot: English",
            "1",
            "3",
        ])
        .unwrap();
        let WorkerMode::Single(job) = args.mode().unwrap() else {
            panic!("expected a single job");
        };
        assert_eq!(job.batch_size, None);
        assert_eq!(job.step, Some((1, 3)));
        assert_eq!(job.job().tgt_code, "eng_Latn");

        let args =
            WorkerArgs::try_parse_from(["subforge-worker", "in.json", "out.json", "a", "b", "-1", "L"]).unwrap();
        let WorkerMode::Single(job) = args.mode().unwrap() else {
            panic!("expected a single job");
        };
        assert_eq!(job.batch_size, None);
        assert_eq!(job.step, None);
    }

    #[test]
    fn worker_rejects_incomplete_jobs() {
        assert!(WorkerArgs::try_parse_from(["subforge-worker", "in.json", "out.json"]).is_err());
        let args = WorkerArgs::try_parse_from(["subforge-worker"]).unwrap();
        assert!(args.mode().is_err());
    }
}
