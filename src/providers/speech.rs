//! Text-to-speech client.

use std::path::Path;

use async_trait::async_trait;

use super::build_client;
use super::error::{check_status, ApiError};
use crate::config::{ProviderConfig, SpeechConfig};

/// Voice and delivery parameters for one synthesis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechStyle {
    pub model: String,
    pub voice: String,
    pub instructions: Option<String>,
    /// Container format; also used as the segment file extension.
    pub format: String,
}

impl SpeechStyle {
    pub fn from_config(config: &SpeechConfig) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            instructions: config.instructions.clone(),
            format: config.format.clone(),
        }
    }
}

/// Object-safe, thread-safe interface for speech synthesis.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` and write the audio to `out`.
    async fn synthesize(&self, text: &str, style: &SpeechStyle, out: &Path)
        -> Result<(), ApiError>;
}

/// Calls `/v1/audio/speech`.
pub struct OpenAiSpeech {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl OpenAiSpeech {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            client: build_client(config.timeout_secs),
            config: config.clone(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(
        &self,
        text: &str,
        style: &SpeechStyle,
        out: &Path,
    ) -> Result<(), ApiError> {
        let key = self.config.resolved_api_key().ok_or(ApiError::MissingApiKey)?;
        let url = format!("{}/v1/audio/speech", self.config.base_url);

        let mut body = serde_json::json!({
            "model":           style.model,
            "voice":           style.voice,
            "input":           text,
            "response_format": style.format,
        });
        if let Some(instructions) = &style.instructions {
            body["instructions"] = serde_json::json!(instructions);
        }

        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;
        let response = check_status("speech", response).await?;

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(ApiError::EmptyResponse);
        }
        if let Some(parent) = out.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(out, &bytes).await?;
        Ok(())
    }
}
