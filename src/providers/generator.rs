//! Language-model answer generation.
//!
//! Two backends share the [`AnswerGenerator`] trait:
//!
//! * [`ResponsesGenerator`] calls `/v1/responses` and links turns of a
//!   conversation through `previous_response_id`, so the server keeps the
//!   history.
//! * [`ChatGenerator`] calls any OpenAI-compatible `/v1/chat/completions`
//!   endpoint and replays the full history on every request.
//!
//! All connection details come from config; nothing is hardcoded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::build_client;
use super::error::{check_status, ApiError};
use crate::config::{AnswerBackend, AnswerConfig, ProviderConfig};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// One earlier question/answer pair of the same conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Default)]
pub struct AnswerRequest {
    pub question: String,
    /// Earlier turns, oldest first. Only filled for backends that
    /// [`uses_history`](AnswerGenerator::uses_history).
    pub history: Vec<HistoryTurn>,
    /// Id of the answer this question follows up on.
    pub previous_answer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    /// Provider id of the answer; empty when the provider sent none.
    pub id: String,
}

// ---------------------------------------------------------------------------
// AnswerGenerator trait
// ---------------------------------------------------------------------------

/// Object-safe, thread-safe interface for answer generation.
#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(&self, request: &AnswerRequest) -> Result<Answer, ApiError>;

    /// Model identifier recorded with each exchange.
    fn model(&self) -> &str;

    /// Reasoning effort label shown while thinking.
    fn effort_label(&self) -> Option<&str> {
        None
    }

    /// Whether the backend can continue a conversation, which the follow-up
    /// loop requires.
    fn supports_follow_up(&self) -> bool {
        true
    }

    /// Whether the caller must supply the conversation history.
    fn uses_history(&self) -> bool {
        false
    }
}

/// Build the backend selected in config.
pub fn generator_from_config(
    provider: &ProviderConfig,
    answer: &AnswerConfig,
) -> Arc<dyn AnswerGenerator> {
    match answer.backend {
        AnswerBackend::Responses => Arc::new(ResponsesGenerator::from_config(provider, answer)),
        AnswerBackend::ChatCompletions => Arc::new(ChatGenerator::from_config(provider, answer)),
    }
}

// ---------------------------------------------------------------------------
// ResponsesGenerator
// ---------------------------------------------------------------------------

pub struct ResponsesGenerator {
    client: reqwest::Client,
    provider: ProviderConfig,
    config: AnswerConfig,
}

impl ResponsesGenerator {
    pub fn from_config(provider: &ProviderConfig, config: &AnswerConfig) -> Self {
        Self {
            client: build_client(config.timeout_secs),
            provider: provider.clone(),
            config: config.clone(),
        }
    }

    fn body(&self, request: &AnswerRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model":        self.config.model,
            "instructions": self.config.system_prompt,
            "input":        request.question,
        });
        if let Some(prev) = request.previous_answer_id.as_deref().filter(|p| !p.is_empty()) {
            body["previous_response_id"] = serde_json::json!(prev);
        }
        if let Some(effort) = &self.config.reasoning_effort {
            body["reasoning"] = serde_json::json!({ "effort": effort });
        }
        body
    }
}

/// Concatenate every `output_text` part of a Responses API payload.
pub(crate) fn responses_output_text(json: &serde_json::Value) -> String {
    if let Some(text) = json["output_text"].as_str() {
        return text.to_string();
    }
    let mut out = String::new();
    for item in json["output"].as_array().into_iter().flatten() {
        if item["type"] != "message" {
            continue;
        }
        for part in item["content"].as_array().into_iter().flatten() {
            if part["type"] == "output_text" {
                if let Some(text) = part["text"].as_str() {
                    out.push_str(text);
                }
            }
        }
    }
    out
}

#[async_trait]
impl AnswerGenerator for ResponsesGenerator {
    async fn generate(&self, request: &AnswerRequest) -> Result<Answer, ApiError> {
        let key = self.provider.resolved_api_key().ok_or(ApiError::MissingApiKey)?;
        let url = format!("{}/v1/responses", self.provider.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&self.body(request))
            .send()
            .await?;
        let response = check_status("responses", response).await?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        let text = responses_output_text(&json).trim().to_string();
        if text.is_empty() {
            return Err(ApiError::EmptyResponse);
        }
        let id = json["id"].as_str().unwrap_or_default().to_string();

        Ok(Answer { text, id })
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn effort_label(&self) -> Option<&str> {
        self.config.reasoning_effort.as_deref()
    }
}

// ---------------------------------------------------------------------------
// ChatGenerator
// ---------------------------------------------------------------------------

/// Calls an OpenAI-compatible `/v1/chat/completions` endpoint.
///
/// The `Authorization: Bearer …` header is attached only when a key is
/// configured, so local servers without authentication work too.
pub struct ChatGenerator {
    client: reqwest::Client,
    provider: ProviderConfig,
    config: AnswerConfig,
}

impl ChatGenerator {
    pub fn from_config(provider: &ProviderConfig, config: &AnswerConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            provider: provider.clone(),
            config: config.clone(),
        }
    }

    fn messages(&self, request: &AnswerRequest) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(request.history.len() * 2 + 2);
        messages.push(serde_json::json!({ "role": "system", "content": self.config.system_prompt }));
        for turn in &request.history {
            messages.push(serde_json::json!({ "role": "user",      "content": turn.question }));
            messages.push(serde_json::json!({ "role": "assistant", "content": turn.answer }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.question }));
        messages
    }
}

#[async_trait]
impl AnswerGenerator for ChatGenerator {
    async fn generate(&self, request: &AnswerRequest) -> Result<Answer, ApiError> {
        let url = format!("{}/v1/chat/completions", self.provider.base_url);

        let body = serde_json::json!({
            "model":       self.config.model,
            "messages":    self.messages(request),
            "stream":      false,
            "temperature": self.config.temperature,
        });

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = self.provider.resolved_api_key() {
            req = req.bearer_auth(key);
        }

        let response = check_status("chat", req.send().await?).await?;
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ApiError::Parse(e.to_string()))?;

        let text = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(ApiError::EmptyResponse)?
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(ApiError::EmptyResponse);
        }
        let id = json["id"].as_str().unwrap_or_default().to_string();

        Ok(Answer { text, id })
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn uses_history(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
