use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubforgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Transcription error: {0}")]
    Transcription(String),

    #[error("Accelerator out of memory: {0}")]
    OutOfMemory(String),

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Vocal separation error: {0}")]
    Separation(String),

    #[error("Media processing error: {0}")]
    Media(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Translation worker error: {0}")]
    Worker(String),

    #[error("Inference sidecar error: {0}")]
    Sidecar(String),
}

impl SubforgeError {
    /// True when the failure came from the accelerator running out of memory.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, SubforgeError::OutOfMemory(_))
    }
}

pub type Result<T> = std::result::Result<T, SubforgeError>;
