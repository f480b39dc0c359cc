//! Translation model hosted in a JSON-lines sidecar process.
//!
//! Each request is one line `{"id","method","params"}` on the sidecar's
//! stdin; each response is one line `{"id","result"}` or `{"id","error"}`
//! on its stdout. The sidecar is killed on release or when dropped, so the
//! model's memory is reclaimed with the process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::TranslationEngine;
use crate::config::TranslatorConfig;
use crate::error::{Result, SubforgeError};
use crate::hardware::Device;

#[derive(Debug, Serialize)]
struct SidecarRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct SidecarResponse {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<SidecarError>,
}

#[derive(Debug, Deserialize)]
struct SidecarError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct TranslateResult {
    translations: Vec<String>,
}

/// Decoding parameters forwarded with every translate request.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationParams {
    pub num_beams: u32,
    pub length_penalty: f32,
    pub repetition_penalty: f32,
    pub no_repeat_ngram_size: u32,
}

impl From<&TranslatorConfig> for GenerationParams {
    fn from(config: &TranslatorConfig) -> Self {
        Self {
            num_beams: config.num_beams,
            length_penalty: config.length_penalty,
            repetition_penalty: config.repetition_penalty,
            no_repeat_ngram_size: config.no_repeat_ngram_size,
        }
    }
}

struct SidecarProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    request_id: u64,
}

impl SidecarProcess {
    async fn send_request(&mut self, method: &str, params: Value) -> Result<Value> {
        self.request_id += 1;
        let id = self.request_id;
        let request = serde_json::to_string(&SidecarRequest { id, method, params })?;

        self.stdin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| SubforgeError::Sidecar(format!("Failed to write to sidecar: {}", e)))?;
        self.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| SubforgeError::Sidecar(format!("Failed to write newline: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| SubforgeError::Sidecar(format!("Failed to flush: {}", e)))?;

        loop {
            let mut line = String::new();
            let read = self
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| SubforgeError::Sidecar(format!("Failed to read from sidecar: {}", e)))?;
            if read == 0 {
                return Err(SubforgeError::Sidecar("Sidecar closed its output".to_string()));
            }

            let response: SidecarResponse = match serde_json::from_str(line.trim()) {
                Ok(response) => response,
                Err(_) => {
                    // library chatter on stdout
                    debug!("sidecar: {}", line.trim_end());
                    continue;
                }
            };
            if response.id != id {
                warn!("Discarding stale sidecar response {}", response.id);
                continue;
            }
            if let Some(error) = response.error {
                return Err(SubforgeError::Sidecar(error.message));
            }
            return response
                .result
                .ok_or_else(|| SubforgeError::Sidecar("Empty response".to_string()));
        }
    }
}

pub struct SidecarTranslator {
    process: Option<SidecarProcess>,
    generation: GenerationParams,
    timeout: Duration,
}

impl SidecarTranslator {
    /// Start the sidecar and load the model inside it.
    pub async fn start(config: &TranslatorConfig, device: Device) -> Result<Self> {
        info!("Starting translation sidecar: {}", config.sidecar_command);
        let mut child = Command::new(&config.sidecar_command)
            .args(&config.sidecar_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SubforgeError::Sidecar(format!("Failed to spawn sidecar: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SubforgeError::Sidecar("Sidecar stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SubforgeError::Sidecar("Sidecar stdout unavailable".to_string()))?;

        let mut translator = Self {
            process: Some(SidecarProcess {
                child,
                stdin,
                stdout: BufReader::new(stdout),
                request_id: 0,
            }),
            generation: GenerationParams::from(config),
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        };

        translator
            .request("load", json!({ "model": config.model, "device": device.as_str() }))
            .await?;
        info!("Translation model {} loaded on {}", config.model, device.as_str());
        Ok(translator)
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value> {
        let process = self
            .process
            .as_mut()
            .ok_or_else(|| SubforgeError::Sidecar("Sidecar already released".to_string()))?;

        match tokio::time::timeout(self.timeout, process.send_request(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(SubforgeError::Sidecar(format!(
                "Sidecar did not answer '{}' within {:?}",
                method, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl TranslationEngine for SidecarTranslator {
    async fn translate(&mut self, texts: &[String], src_code: &str, tgt_code: &str) -> Result<Vec<String>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let params = json!({
            "texts": texts,
            "src_lang": src_code,
            "tgt_lang": tgt_code,
            "generation": self.generation,
        });
        let result = self.request("translate", params).await?;
        let parsed: TranslateResult = serde_json::from_value(result)?;
        Ok(parsed.translations)
    }

    async fn release(&mut self) -> Result<()> {
        if self.process.is_none() {
            return Ok(());
        }
        if let Err(e) = self.request("shutdown", json!({})).await {
            debug!("Sidecar shutdown request failed: {}", e);
        }
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.child.kill().await {
                debug!("Sidecar already exited: {}", e);
            }
        }
        info!("Translation sidecar stopped");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    // Answers every request with one fixed translation, echoing the id.
    const ECHO_SIDECAR: &str = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
  echo "warming up"
  printf '{"id":%s,"result":{"translations":["salut"]}}\n' "$id"
done"#;

    fn config(script: &str) -> TranslatorConfig {
        TranslatorConfig {
            sidecar_command: "sh".to_string(),
            sidecar_args: vec!["-c".to_string(), script.to_string()],
            request_timeout_secs: 5,
            ..TranslatorConfig::default()
        }
    }

    #[tokio::test]
    async fn round_trips_requests_and_skips_noise() {
        let mut translator = SidecarTranslator::start(&config(ECHO_SIDECAR), Device::Cpu)
            .await
            .unwrap();
        let out = translator
            .translate(&["hello".to_string()], "eng_Latn", "ron_Latn")
            .await
            .unwrap();
        assert_eq!(out, vec!["salut".to_string()]);

        translator.release().await.unwrap();
        assert!(translator.translate(&["x".to_string()], "a", "b").await.is_err());
        // second release is a no-op
        translator.release().await.unwrap();
    }

    #[tokio::test]
    async fn error_responses_surface() {
        let script = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
  printf '{"id":%s,"error":{"message":"model missing"}}\n' "$id"
done"#;
        let err = SidecarTranslator::start(&config(script), Device::Cpu).await.err().unwrap();
        assert!(err.to_string().contains("model missing"));
    }

    #[tokio::test]
    async fn dead_sidecar_is_an_error() {
        let err = SidecarTranslator::start(&config("exit 0"), Device::Cpu).await.err().unwrap();
        assert!(matches!(err, SubforgeError::Sidecar(_)));
    }
}
