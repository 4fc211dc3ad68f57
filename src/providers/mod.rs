//! Network collaborators of the pipeline.
//!
//! This module provides:
//! * [`Transcriber`] / [`OpenAiTranscriber`]: speech-to-text.
//! * [`AnswerGenerator`] with [`ResponsesGenerator`] (previous-response
//!   linking) and [`ChatGenerator`] (full history replay).
//! * [`SpeechSynthesizer`] / [`OpenAiSpeech`]: text-to-speech into a file.
//! * [`ApiError`]: shared error type carrying the retryable flag.
//!
//! The pipeline only depends on the traits, so tests substitute in-memory
//! doubles.

pub mod error;
pub mod generator;
pub mod speech;
pub mod transcriber;

use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use error::{status_is_retryable, ApiError};
pub use generator::{
    generator_from_config, Answer, AnswerGenerator, AnswerRequest, ChatGenerator, HistoryTurn,
    ResponsesGenerator,
};
pub use speech::{OpenAiSpeech, SpeechStyle, SpeechSynthesizer};
pub use transcriber::{OpenAiTranscriber, Transcriber};

/// HTTP client with a per-request timeout.
fn build_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Upload MIME type for a recording, by extension.
fn mime_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("ogg") | Some("opus") => "audio/ogg",
        Some("webm") => "audio/webm",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types_by_extension() {
        assert_eq!(mime_for(Path::new("q.wav")), "audio/wav");
        assert_eq!(mime_for(Path::new("q.M4A")), "audio/mp4");
        assert_eq!(mime_for(Path::new("q")), "application/octet-stream");
    }
}
