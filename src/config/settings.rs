//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.
//! Every section is `#[serde(default)]`, so a partial `settings.toml` only
//! overrides the keys it names.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

/// Environment variable consulted when `provider.api_key` is not set.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

// ---------------------------------------------------------------------------
// ProviderConfig
// ---------------------------------------------------------------------------

/// Connection settings shared by the transcription, answer and speech
/// clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible API (no trailing `/v1`).
    pub base_url: String,
    /// API key. Falls back to `OPENAI_API_KEY` when `None`.
    pub api_key: Option<String>,
    /// Speech-to-text model.
    pub transcription_model: String,
    /// Per-request timeout for transcription and speech calls.
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: None,
            transcription_model: "gpt-4o-transcribe".into(),
            timeout_secs: 60,
        }
    }
}

impl ProviderConfig {
    /// The configured key, or the environment fallback.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()))
    }
}

// ---------------------------------------------------------------------------
// AnswerBackend / AnswerConfig
// ---------------------------------------------------------------------------

/// Which wire protocol the answer generator speaks.
///
/// | Variant         | Conversation memory                       |
/// |-----------------|-------------------------------------------|
/// | Responses       | server-side, linked by previous answer id |
/// | ChatCompletions | client-side, full history replayed         |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerBackend {
    Responses,
    ChatCompletions,
}

impl Default for AnswerBackend {
    fn default() -> Self {
        Self::Responses
    }
}

/// Settings for the language-model call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnswerConfig {
    pub backend: AnswerBackend,
    /// Model identifier sent to the API.
    pub model: String,
    /// Reasoning effort label (`"low"`, `"medium"`, `"high"`), also shown in
    /// the thinking state.
    pub reasoning_effort: Option<String>,
    /// System instructions prepended to every request.
    pub system_prompt: String,
    /// Sampling temperature; only sent to the chat-completions backend.
    pub temperature: f32,
    /// Maximum seconds to wait for an answer.
    pub timeout_secs: u64,
}

impl Default for AnswerConfig {
    fn default() -> Self {
        Self {
            backend: AnswerBackend::default(),
            model: "gpt-5".into(),
            reasoning_effort: Some("low".into()),
            system_prompt: "You are a helpful voice assistant. Answers are read aloud, \
                            so write plain conversational prose without tables or markup."
                .into(),
            temperature: 0.7,
            timeout_secs: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// SpeechConfig
// ---------------------------------------------------------------------------

/// Settings for text-to-speech synthesis and chunking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    pub model: String,
    pub voice: String,
    /// Free-form delivery instructions (tone, pacing).
    pub instructions: Option<String>,
    /// Output container requested from the provider; also the file extension.
    pub format: String,
    /// Strip markdown, citations and URLs before synthesis.
    pub clean_markdown: bool,
    /// Maximum characters per synthesis request.
    pub max_chunk_chars: usize,
    /// How far back from the limit a sentence end is searched for.
    pub lookback_chars: usize,
    /// Chunks synthesized concurrently.
    pub max_concurrent: usize,
    /// Attempts per chunk, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per attempt after that.
    pub retry_base_delay_ms: u64,
    /// How many times one chunk may be bisected on a length-limit failure.
    pub max_split_depth: u32,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini-tts".into(),
            voice: "marin".into(),
            instructions: None,
            format: "wav".into(),
            clean_markdown: true,
            max_chunk_chars: 4096,
            lookback_chars: 500,
            max_concurrent: 3,
            max_attempts: 3,
            retry_base_delay_ms: 2000,
            max_split_depth: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// PlaybackConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Initial playback speed, clamped to 0.5 – 2.0.
    pub speed: f32,
    /// Skip playback and the follow-up loop entirely.
    pub muted: bool,
    /// Output device name; unset plays on the system default.
    pub output_device: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            muted: false,
            output_device: None,
        }
    }
}

// ---------------------------------------------------------------------------
// FollowUpConfig
// ---------------------------------------------------------------------------

/// Settings for the hands-free follow-up loop after an answer finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowUpConfig {
    /// Interactive mode: listen for a follow-up question after playback.
    pub enabled: bool,
    /// Spoken prompt played before listening.
    pub prompt: String,
    /// Silence after speech that ends a capture.
    pub silence_timeout_ms: u64,
    /// Time to wait for any speech before giving up.
    pub no_speech_timeout_ms: u64,
    /// Gap between the prompt and the start of capture.
    pub prompt_pause_ms: u64,
    /// Normalized replies up to this many characters count as dismissal.
    pub min_question_chars: usize,
}

impl Default for FollowUpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            prompt: "Any follow-up questions?".into(),
            silence_timeout_ms: 2000,
            no_speech_timeout_ms: 8000,
            prompt_pause_ms: 300,
            min_question_chars: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Timings of the orchestrator's transient states.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How long `Complete` is shown before returning to `Idle`.
    pub complete_linger_ms: u64,
    /// How long `InteractiveEnding` is shown before returning to `Idle`.
    pub interactive_ending_linger_ms: u64,
    /// Interval of the thinking timer.
    pub thinking_tick_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            complete_linger_ms: 1000,
            interactive_ending_linger_ms: 1500,
            thinking_tick_ms: 1000,
        }
    }
}

impl PipelineConfig {
    pub fn complete_linger(&self) -> Duration {
        Duration::from_millis(self.complete_linger_ms)
    }

    pub fn interactive_ending_linger(&self) -> Duration {
        Duration::from_millis(self.interactive_ending_linger_ms)
    }

    pub fn thinking_tick(&self) -> Duration {
        Duration::from_millis(self.thinking_tick_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_answer::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub answer: AnswerConfig,
    pub speech: SpeechConfig,
    pub playback: PlaybackConfig,
    pub follow_up: FollowUpConfig,
    pub pipeline: PipelineConfig,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
