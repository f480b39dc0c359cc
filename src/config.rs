use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{Result, SubforgeError};
use crate::hardware::BatchConstants;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "subforge.toml";

/// Model code used when an ISO code is unknown to every table.
pub const FALLBACK_MODEL_CODE: &str = "eng_Latn";

/// ISO 639-1 to translation-model code mapping (static fallback).
const ISO_TO_MODEL_CODE: &[(&str, &str)] = &[
    // Major European
    ("en", "eng_Latn"), ("es", "spa_Latn"), ("fr", "fra_Latn"), ("de", "deu_Latn"),
    ("it", "ita_Latn"), ("pt", "por_Latn"), ("ru", "rus_Cyrl"), ("zh", "zho_Hans"),
    ("ja", "jpn_Jpan"), ("ko", "kor_Hang"), ("hi", "hin_Deva"), ("ar", "arb_Arab"),
    // Eastern European
    ("ro", "ron_Latn"), ("bg", "bul_Cyrl"), ("cs", "ces_Latn"), ("pl", "pol_Latn"),
    ("hu", "hun_Latn"), ("uk", "ukr_Cyrl"), ("sk", "slk_Latn"), ("sl", "slv_Latn"),
    ("sr", "srp_Cyrl"), ("hr", "hrv_Latn"), ("el", "ell_Grek"), ("tr", "tur_Latn"),
    // Northern European
    ("nl", "nld_Latn"), ("sv", "swe_Latn"), ("da", "dan_Latn"), ("fi", "fin_Latn"),
    ("no", "nob_Latn"), ("et", "est_Latn"), ("lv", "lav_Latn"), ("lt", "lit_Latn"),
    // Asian
    ("th", "tha_Thai"), ("vi", "vie_Latn"), ("id", "ind_Latn"), ("ms", "zsm_Latn"),
    ("he", "heb_Hebr"), ("sd", "snd_Arab"), ("gu", "guj_Gujr"), ("mr", "mar_Deva"),
    ("bn", "ben_Beng"), ("pa", "pan_Guru"), ("ta", "tam_Taml"), ("te", "tel_Telu"),
    ("kn", "kan_Knda"), ("ml", "mal_Mlym"),
    // African
    ("sw", "swh_Latn"), ("am", "amh_Ethi"), ("yo", "yor_Latn"), ("ig", "ibo_Latn"),
    ("ha", "hau_Latn"), ("zu", "zul_Latn"), ("xh", "xho_Latn"), ("af", "afr_Latn"),
    ("so", "som_Latn"), ("lg", "lug_Latn"), ("sn", "sna_Latn"), ("ny", "nya_Latn"),
    ("rw", "kin_Latn"), ("mg", "plt_Latn"),
    // Others
    ("hy", "hye_Armn"), ("ka", "kat_Geor"), ("az", "azj_Latn"), ("be", "bel_Cyrl"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Send DEBUG records to the console
    pub debug_logging: bool,
    /// Languages probed, in order, when resuming without a forced language
    pub resume_languages: Vec<String>,
    /// Ordered target languages; order drives manifest and subtitle track order
    pub target_languages: Vec<TargetLanguage>,
    pub transcriber: TranscriberConfig,
    pub separator: SeparatorConfig,
    pub translator: TranslatorConfig,
    pub worker: WorkerConfig,
    pub hallucinations: HallucinationConfig,
    pub media: MediaConfig,
    pub performance: PerformanceOverrides,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetLanguage {
    /// ISO 639-1 code, also used in checkpoint file names
    pub lang: String,
    /// Translation-model language code (e.g. `spa_Latn`)
    pub code: String,
    /// Display label written into the subtitle track title
    pub label: String,
}

impl TargetLanguage {
    pub fn new(lang: &str, code: &str, label: &str) -> Self {
        Self {
            lang: lang.to_string(),
            code: code.to_string(),
            label: label.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriberConfig {
    /// Path to the transcriber CLI
    pub binary_path: String,
    /// Model name passed to the transcriber
    pub model: String,
    /// Forced source language; auto-detect when absent
    pub language: Option<String>,
    /// Prompt biasing the decoder
    pub initial_prompt: Option<String>,
    /// Disable to send no prompt at all
    pub use_prompt: bool,
    /// Minimum silence for the voice-activity filter
    pub vad_min_silence_ms: u32,
    /// Decoder no-speech threshold
    pub no_speech_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparatorConfig {
    pub enabled: bool,
    /// Path to the vocal separation CLI
    pub binary_path: String,
    /// Separation model file name
    pub model: String,
    /// Directory holding separation model files
    pub model_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorConfig {
    /// Command starting the JSON-lines inference sidecar
    pub sidecar_command: String,
    /// Extra arguments for the sidecar command
    pub sidecar_args: Vec<String>,
    /// Translation model identifier
    pub model: String,
    pub num_beams: u32,
    pub length_penalty: f32,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: u32,
    /// Intermediate language used for non-pivot sources
    pub pivot_language: String,
    /// Translate through the pivot language first
    pub pivot_enabled: bool,
    /// Timeout for a single sidecar request
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker binary; defaults to `subforge-worker` next to the running executable
    pub binary_path: Option<PathBuf>,
    /// Parent poll interval for result files
    pub poll_interval_ms: u64,
    /// How long the worker waits for the parent to consume a result file
    pub handshake_timeout_secs: u64,
    /// Worker poll interval while waiting for consumption
    pub handshake_poll_ms: u64,
    /// Grace period between terminate and kill
    pub terminate_grace_secs: u64,
    /// Attempts to read a result file before giving up
    pub read_retries: u32,
    pub read_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HallucinationConfig {
    /// Discard segments whose no-speech probability exceeds this
    pub silence_threshold: f32,
    /// Drop identical consecutive segments repeated this many times or more
    pub repetition_threshold: usize,
    /// Phrases emitted by the transcriber on unintelligible audio
    pub known_phrases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Path to ffmpeg binary
    pub ffmpeg_path: String,
    /// Path to ffprobe binary
    pub ffprobe_path: String,
    /// Extensions (with leading dot) treated as videos in batch mode
    pub video_extensions: Vec<String>,
}

/// Explicit user overrides applied on top of the hardware profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceOverrides {
    /// Force a named profile instead of deriving it from VRAM
    pub profile: Option<String>,
    /// Ignore any accelerator
    pub force_cpu: bool,
    pub whisper_beam: Option<u32>,
    pub translation_batch: Option<usize>,
    pub whisper_batch: Option<usize>,
    pub whisper_workers: Option<usize>,
    pub ffmpeg_threads: Option<usize>,
    /// Empirical constants of the batch-size formulas
    pub batch_constants: BatchConstants,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug_logging: false,
            resume_languages: ["en", "ro", "es", "fr"].iter().map(|s| s.to_string()).collect(),
            target_languages: vec![
                TargetLanguage::new("en", "eng_Latn", "English"),
                TargetLanguage::new("es", "spa_Latn", "Spanish"),
                TargetLanguage::new("fr", "fra_Latn", "French"),
            ],
            transcriber: TranscriberConfig::default(),
            separator: SeparatorConfig::default(),
            translator: TranslatorConfig::default(),
            worker: WorkerConfig::default(),
            hallucinations: HallucinationConfig::default(),
            media: MediaConfig::default(),
            performance: PerformanceOverrides::default(),
        }
    }
}

impl Default for TranscriberConfig {
    fn default() -> Self {
        Self {
            binary_path: "whisper-cli".to_string(),
            model: "large-v3".to_string(),
            language: None,
            initial_prompt: Some("Transcribe the following audio file.".to_string()),
            use_prompt: true,
            vad_min_silence_ms: 500,
            no_speech_threshold: 0.6,
        }
    }
}

impl Default for SeparatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary_path: "audio-separator".to_string(),
            model: "model_bs_roformer_ep_317_sdr_12.9755.ckpt".to_string(),
            model_dir: PathBuf::from("models"),
        }
    }
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            sidecar_command: "nllb-sidecar".to_string(),
            sidecar_args: Vec::new(),
            model: "facebook/nllb-200-3.3B".to_string(),
            num_beams: 5,
            length_penalty: 1.0,
            repetition_penalty: 1.0,
            no_repeat_ngram_size: 0,
            pivot_language: "en".to_string(),
            pivot_enabled: true,
            request_timeout_secs: 600,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary_path: None,
            poll_interval_ms: 100,
            handshake_timeout_secs: 10,
            handshake_poll_ms: 50,
            terminate_grace_secs: 5,
            read_retries: 3,
            read_backoff_ms: 100,
        }
    }
}

impl Default for HallucinationConfig {
    fn default() -> Self {
        let known_phrases = [
            // Romanian
            "nu uitați să dați like", "nu uitati sa dati like",
            "să lăsați un comentariu", "sa lasati un comentariu",
            "să distribuiți", "sa distribuiti",
            "abonați-vă la canal", "abonati-va la canal",
            "nu uitați să vă abonați", "nu uitati sa va abonati",
            "pentru a nu rata videoclipurile noastre",
            "vă mulțumim pentru vizionare", "va multumim pentru vizionare",
            "nu uitați să apăsați butonul de like",
            // English
            "thank you for watching", "thanks for watching",
            "subscribe to my channel", "please subscribe",
            "like and subscribe", "hit the like button",
            "leave a comment", "share this video",
            "see you in the next", "bye bye",
            // French
            "merci d'avoir regardé", "n'oubliez pas de vous abonner",
            "laissez un commentaire", "à bientôt",
            // German
            "danke fürs zuschauen", "vergisst nicht zu abonnieren",
            // Spanish
            "gracias por ver", "no olvides suscribirte",
            // Italian
            "grazie per aver guardato", "non dimenticare di iscriverti",
        ];

        Self {
            silence_threshold: 0.9,
            repetition_threshold: 15,
            known_phrases: known_phrases.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            video_extensions: [".mp4", ".mkv", ".mov", ".avi", ".webm", ".flv", ".m4v", ".ts", ".mts"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn handshake_poll(&self) -> Duration {
        Duration::from_millis(self.handshake_poll_ms.max(1))
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    pub fn read_backoff(&self) -> Duration {
        Duration::from_millis(self.read_backoff_ms)
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SubforgeError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| SubforgeError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SubforgeError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| SubforgeError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Load an explicit config file, else `subforge.toml` in the working
    /// directory, else built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let local = Path::new(DEFAULT_CONFIG_FILE);
                if local.exists() {
                    info!("Found {} in current directory, loading...", DEFAULT_CONFIG_FILE);
                    Self::from_file(local)
                } else {
                    info!("No config file found, using internal defaults");
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for target in &self.target_languages {
            if target.lang.trim().is_empty() || target.code.trim().is_empty() {
                return Err(SubforgeError::Config(
                    "Target languages need both `lang` and `code`".to_string(),
                ));
            }
            if !seen.insert(target.lang.as_str()) {
                return Err(SubforgeError::Config(format!(
                    "Duplicate target language '{}'",
                    target.lang
                )));
            }
        }
        if self.translator.pivot_language.trim().is_empty() {
            return Err(SubforgeError::Config("Pivot language must not be empty".to_string()));
        }
        if self.worker.read_retries == 0 {
            return Err(SubforgeError::Config("worker.read_retries must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn target(&self, lang: &str) -> Option<&TargetLanguage> {
        self.target_languages.iter().find(|t| t.lang == lang)
    }

    /// Translation-model code for an ISO code: configured targets first, then
    /// the static table, then English.
    pub fn model_code(&self, iso: &str) -> String {
        if let Some(target) = self.target(iso) {
            return target.code.clone();
        }
        ISO_TO_MODEL_CODE
            .iter()
            .find(|(k, _)| *k == iso)
            .map(|(_, v)| v.to_string())
            .unwrap_or_else(|| FALLBACK_MODEL_CODE.to_string())
    }

    /// Display label for a language, falling back to the upper-cased code.
    pub fn label(&self, lang: &str) -> String {
        self.target(lang)
            .map(|t| t.label.clone())
            .unwrap_or_else(|| lang.to_uppercase())
    }

    /// Replace the target set with a comma-separated list of ISO codes.
    /// Codes that are neither configured nor known to the model are rejected.
    pub fn restrict_targets(&mut self, langs: &str) -> Result<()> {
        let wanted: Vec<String> = langs
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut targets = Vec::with_capacity(wanted.len());
        for lang in wanted {
            let entry = match self.target(&lang) {
                Some(existing) => existing.clone(),
                None => {
                    let code = ISO_TO_MODEL_CODE
                        .iter()
                        .find(|(k, _)| *k == lang)
                        .map(|(_, v)| v.to_string())
                        .ok_or_else(|| SubforgeError::Config(format!("Unknown target language: {}", lang)))?;
                    TargetLanguage {
                        code,
                        label: lang.to_uppercase(),
                        lang: lang.clone(),
                    }
                }
            };
            targets.push(entry);
        }
        self.target_languages = targets;
        Ok(())
    }

    /// Prompt actually sent to the transcriber.
    pub fn effective_prompt(&self) -> Option<&str> {
        if self.transcriber.use_prompt {
            self.transcriber.initial_prompt.as_deref().filter(|p| !p.is_empty())
        } else {
            None
        }
    }
}
