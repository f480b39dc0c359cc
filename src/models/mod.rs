// Model lifecycle
//
// Three heavyweight models live behind traits so the pipeline never depends
// on how inference runs:
// - Transcriber: speech to timed text
// - TranslationEngine: batched text translation
// - VocalSeparator: isolates the vocal stem of an audio track
//
// ModelManager loads each lazily and keeps at most one model family
// resident on the accelerator.

pub mod separator;
pub mod transcriber;
pub mod translator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, SubforgeError};
use crate::hardware::HardwareProfile;

/// Segment as produced by the transcriber, before filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribedSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default)]
    pub no_speech_prob: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeOptions {
    pub language: Option<String>,
    pub initial_prompt: Option<String>,
    pub beam_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionOutput {
    pub segments: Vec<TranscribedSegment>,
    pub language: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub language_probability: f32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe an audio (or video) file.
    async fn transcribe(&self, audio: &Path, options: &TranscribeOptions) -> Result<TranscriptionOutput>;

    /// Free every resource held by the model.
    async fn release(&mut self) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TranslationEngine: Send + Sync {
    /// Translate `texts` positionally from `src_code` to `tgt_code`.
    async fn translate(&mut self, texts: &[String], src_code: &str, tgt_code: &str) -> Result<Vec<String>>;

    async fn release(&mut self) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VocalSeparator: Send + Sync {
    /// Split `audio` into stems written under `output_dir`.
    async fn separate(&self, audio: &Path, output_dir: &Path) -> Result<Vec<PathBuf>>;

    async fn release(&mut self) -> Result<()>;
}

/// Constructs model handles on demand.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn load_transcriber(&self) -> Result<Box<dyn Transcriber>>;
    async fn load_translator(&self) -> Result<Box<dyn TranslationEngine>>;
    async fn load_separator(&self) -> Result<Box<dyn VocalSeparator>>;
}

/// Provider backed by the configured external tools.
pub struct ExternalModelProvider {
    config: Config,
    hardware: HardwareProfile,
}

impl ExternalModelProvider {
    pub fn new(config: Config, hardware: HardwareProfile) -> Self {
        Self { config, hardware }
    }
}

#[async_trait]
impl ModelProvider for ExternalModelProvider {
    async fn load_transcriber(&self) -> Result<Box<dyn Transcriber>> {
        Ok(Box::new(transcriber::CliTranscriber::new(
            self.config.transcriber.clone(),
            self.hardware.tuning.clone(),
        )))
    }

    async fn load_translator(&self) -> Result<Box<dyn TranslationEngine>> {
        let engine =
            translator::SidecarTranslator::start(&self.config.translator, self.hardware.device).await?;
        Ok(Box::new(engine))
    }

    async fn load_separator(&self) -> Result<Box<dyn VocalSeparator>> {
        Ok(Box::new(separator::CliSeparator::new(self.config.separator.clone())))
    }
}

/// Residency state of one model.
pub enum Slot<T: ?Sized> {
    Unloaded,
    Loaded(Box<T>),
}

impl<T: ?Sized> Slot<T> {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Slot::Loaded(_))
    }

    fn take(&mut self) -> Option<Box<T>> {
        match std::mem::replace(self, Slot::Unloaded) {
            Slot::Loaded(model) => Some(model),
            Slot::Unloaded => None,
        }
    }
}

/// How many times each model has been constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounters {
    pub transcriber: usize,
    pub translator: usize,
    pub separator: usize,
}

pub struct ModelManager {
    provider: Box<dyn ModelProvider>,
    transcriber: Slot<dyn Transcriber>,
    translator: Slot<dyn TranslationEngine>,
    separator: Slot<dyn VocalSeparator>,
    loads: LoadCounters,
}

impl ModelManager {
    pub fn new(provider: Box<dyn ModelProvider>) -> Self {
        Self {
            provider,
            transcriber: Slot::Unloaded,
            translator: Slot::Unloaded,
            separator: Slot::Unloaded,
            loads: LoadCounters::default(),
        }
    }

    pub async fn get_transcriber(&mut self) -> Result<&dyn Transcriber> {
        if !self.transcriber.is_loaded() {
            info!("Loading transcription model");
            self.transcriber = Slot::Loaded(self.provider.load_transcriber().await?);
            self.loads.transcriber += 1;
        }
        match &self.transcriber {
            Slot::Loaded(model) => Ok(model.as_ref()),
            Slot::Unloaded => Err(SubforgeError::Transcription("Transcriber not loaded".to_string())),
        }
    }

    /// Always offloads the transcriber and separator before the translator
    /// is touched, even when it is already resident.
    pub async fn get_translator(&mut self) -> Result<&mut dyn TranslationEngine> {
        self.offload_transcriber().await;
        self.offload_separator().await;

        if !self.translator.is_loaded() {
            info!("Loading translation model");
            self.translator = Slot::Loaded(self.provider.load_translator().await?);
            self.loads.translator += 1;
        }
        match &mut self.translator {
            Slot::Loaded(model) => Ok(model.as_mut()),
            Slot::Unloaded => Err(SubforgeError::Translation("Translator not loaded".to_string())),
        }
    }

    pub async fn get_separator(&mut self) -> Result<&dyn VocalSeparator> {
        if !self.separator.is_loaded() {
            info!("Loading vocal separation model");
            self.separator = Slot::Loaded(self.provider.load_separator().await?);
            self.loads.separator += 1;
        }
        match &self.separator {
            Slot::Loaded(model) => Ok(model.as_ref()),
            Slot::Unloaded => Err(SubforgeError::Separation("Separator not loaded".to_string())),
        }
    }

    /// No-op when nothing is loaded.
    pub async fn offload_transcriber(&mut self) {
        if let Some(mut model) = self.transcriber.take() {
            info!("Offloading transcription model");
            if let Err(e) = model.release().await {
                warn!("Transcriber release reported an error: {}", e);
            }
        }
    }

    pub async fn offload_translator(&mut self) {
        if let Some(mut model) = self.translator.take() {
            info!("Offloading translation model");
            if let Err(e) = model.release().await {
                warn!("Translator release reported an error: {}", e);
            }
        }
    }

    pub async fn offload_separator(&mut self) {
        if let Some(mut model) = self.separator.take() {
            info!("Offloading vocal separation model");
            if let Err(e) = model.release().await {
                warn!("Separator release reported an error: {}", e);
            }
        }
    }

    pub async fn offload_all(&mut self) {
        debug!("Offloading every resident model");
        self.offload_separator().await;
        self.offload_transcriber().await;
        self.offload_translator().await;
    }

    pub fn is_transcriber_loaded(&self) -> bool {
        self.transcriber.is_loaded()
    }

    pub fn is_translator_loaded(&self) -> bool {
        self.translator.is_loaded()
    }

    pub fn is_separator_loaded(&self) -> bool {
        self.separator.is_loaded()
    }

    pub fn loads(&self) -> LoadCounters {
        self.loads
    }
}
