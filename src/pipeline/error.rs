//! Failures of one pipeline step, converted into [`PipelineState::Error`].
//!
//! [`PipelineState::Error`]: super::PipelineState::Error

use thiserror::Error;

use super::state::{FailedStep, RecoveredContext};
use crate::playback::PlaybackError;
use crate::providers::ApiError;
use crate::synthesis::SynthesisError;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("transcription failed: {0}")]
    Transcription(ApiError),

    #[error("no speech was recognized in the recording")]
    NothingHeard,

    #[error("the model call failed: {0}")]
    Model(ApiError),

    #[error(transparent)]
    Synthesis(SynthesisError),

    #[error("playback failed: {0}")]
    Playback(PlaybackError),

    /// A stage stopped without reporting a result (panicked task).
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl PipelineError {
    pub fn failed_step(&self, context: &RecoveredContext) -> FailedStep {
        match self {
            PipelineError::Transcription(_) | PipelineError::NothingHeard => {
                FailedStep::Transcription
            }
            PipelineError::Model(_) => FailedStep::Model,
            PipelineError::Synthesis(_) => FailedStep::Synthesis,
            PipelineError::Playback(_) => FailedStep::Playback,
            PipelineError::Unexpected(_) => FailedStep::infer(context),
        }
    }

    /// Transcription keeps the provider's verdict (bad credentials are
    /// final); every later step can be retried from saved context.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Transcription(e) => e.is_retryable(),
            PipelineError::NothingHeard => false,
            PipelineError::Model(_)
            | PipelineError::Synthesis(_)
            | PipelineError::Playback(_)
            | PipelineError::Unexpected(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> ApiError {
        ApiError::Status {
            provider: "test",
            status: code,
            code: None,
            message: "nope".into(),
        }
    }

    #[test]
    fn transcription_keeps_provider_flag() {
        assert!(!PipelineError::Transcription(status(401)).is_retryable());
        assert!(!PipelineError::Transcription(ApiError::MissingApiKey).is_retryable());
        assert!(PipelineError::Transcription(status(503)).is_retryable());
    }

    #[test]
    fn later_steps_are_always_retryable() {
        assert!(PipelineError::Model(status(401)).is_retryable());
        assert!(PipelineError::Playback(PlaybackError::NothingPlayable(2)).is_retryable());
        assert!(PipelineError::Synthesis(SynthesisError::Provider {
            source: status(400),
            length_limit: false
        })
        .is_retryable());
    }

    #[test]
    fn unexpected_failure_maps_from_context() {
        let ctx = RecoveredContext {
            question: Some("q".into()),
            answer: Some("a".into()),
            ..RecoveredContext::default()
        };
        let err = PipelineError::Unexpected("worker panicked".into());
        assert_eq!(err.failed_step(&ctx), FailedStep::Synthesis);
        assert_eq!(
            err.failed_step(&RecoveredContext::default()),
            FailedStep::Model
        );
    }

    #[test]
    fn messages_name_the_step() {
        let msg = PipelineError::Model(ApiError::Timeout).to_string();
        assert!(msg.starts_with("the model call failed"), "{msg}");
    }
}
