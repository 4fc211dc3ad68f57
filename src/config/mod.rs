//! Configuration module for voice-answer.
//!
//! Provides `AppConfig` (top-level settings), sub-configs for each pipeline
//! stage, `AppPaths` for cross-platform data directories, and TOML
//! persistence via `AppConfig::load` / `AppConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AnswerBackend, AnswerConfig, AppConfig, FollowUpConfig, PipelineConfig, PlaybackConfig,
    ProviderConfig, SpeechConfig, API_KEY_ENV,
};
