//! Speech-to-text client.
//!
//! [`Transcriber`] is the seam the orchestrator calls; [`OpenAiTranscriber`]
//! uploads the recording as multipart form data to
//! `/v1/audio/transcriptions`.

use std::path::Path;

use async_trait::async_trait;

use super::error::{check_status, ApiError};
use super::{build_client, mime_for};
use crate::config::ProviderConfig;

/// Object-safe, thread-safe interface for speech-to-text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe the recording at `audio` and return its text.
    async fn transcribe(&self, audio: &Path) -> Result<String, ApiError>;
}

pub struct OpenAiTranscriber {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl OpenAiTranscriber {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            client: build_client(config.timeout_secs),
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(&self, audio: &Path) -> Result<String, ApiError> {
        let key = self.config.resolved_api_key().ok_or(ApiError::MissingApiKey)?;
        let bytes = tokio::fs::read(audio).await?;
        log::debug!(
            "transcribe: uploading {} ({} bytes)",
            audio.display(),
            bytes.len()
        );

        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording.wav".into());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime_for(audio))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.config.transcription_model.clone())
            .text("response_format", "json")
            .part("file", part);

        let url = format!("{}/v1/audio/transcriptions", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .multipart(form)
            .send()
            .await?;
        let response = check_status("transcription", response).await?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;
        let text = json["text"]
            .as_str()
            .ok_or(ApiError::EmptyResponse)?
            .trim()
            .to_string();

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcriber_is_object_safe() {
        let t: Box<dyn Transcriber> =
            Box::new(OpenAiTranscriber::from_config(&ProviderConfig::default()));
        drop(t);
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_io() {
        let config = ProviderConfig {
            api_key: Some(String::new()),
            ..ProviderConfig::default()
        };
        // Only meaningful when the environment does not provide a key.
        if config.resolved_api_key().is_some() {
            return;
        }
        let t = OpenAiTranscriber::from_config(&config);
        let err = t
            .transcribe(Path::new("/definitely/not/here.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::MissingApiKey));
    }
}
