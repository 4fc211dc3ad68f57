//! Pipeline state machine.
//!
//! [`PipelineState`] is published to observers as an immutable snapshot on
//! every transition. Transitions of one run:
//!
//! ```text
//! Idle ─▶ Transcribing ─▶ Transcribed ─▶ Thinking ─▶ ThinkingComplete
//!      ─▶ GeneratingAudio ─▶ Playing ─┬▶ Complete ─(linger)─▶ Idle
//!                                     └▶ ListeningForFollowUp
//!                                          ├─ question ─▶ Transcribing / Transcribed …
//!                                          └─ silence, dismissal ─▶ InteractiveEnding ─▶ Idle
//! any step ──failure──▶ Error ──retry_from_error──▶ failed step
//!                             ──cancel──▶ Idle
//! ```

use std::path::PathBuf;

use crate::store::{ConversationId, ExchangeId};

// ---------------------------------------------------------------------------
// FailedStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailedStep {
    Transcription,
    Model,
    Synthesis,
    Playback,
}

impl FailedStep {
    pub fn label(self) -> &'static str {
        match self {
            FailedStep::Transcription => "transcription",
            FailedStep::Model => "model",
            FailedStep::Synthesis => "speech synthesis",
            FailedStep::Playback => "playback",
        }
    }

    /// Most specific step the saved context can resume from; the model step
    /// when nothing decides it.
    pub fn infer(context: &RecoveredContext) -> Self {
        if !context.segments.is_empty() {
            FailedStep::Playback
        } else if context.has_answer() {
            FailedStep::Synthesis
        } else if context.question.is_some() {
            FailedStep::Model
        } else if context.recording.is_some() {
            FailedStep::Transcription
        } else {
            FailedStep::Model
        }
    }
}

// ---------------------------------------------------------------------------
// RecoveredContext
// ---------------------------------------------------------------------------

/// Everything a run has produced so far.
///
/// Carried inside [`PipelineState::Error`] so a retry resumes at the failed
/// step without repeating finished ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveredContext {
    pub recording: Option<PathBuf>,
    pub question: Option<String>,
    pub answer: Option<String>,
    pub answer_id: Option<String>,
    pub conversation_id: Option<ConversationId>,
    /// `conversation_id` was opened by this run rather than handed in.
    pub created_conversation: bool,
    /// Answer the question follows up on.
    pub prior_answer_id: Option<String>,
    pub exchange_id: Option<ExchangeId>,
    pub segments: Vec<PathBuf>,
    pub model: Option<String>,
    pub effort: Option<String>,
    pub elapsed_seconds: u64,
}

impl RecoveredContext {
    pub fn has_answer(&self) -> bool {
        self.answer.as_deref().is_some_and(|a| !a.is_empty())
    }

    pub fn question(&self) -> &str {
        self.question.as_deref().unwrap_or_default()
    }

    pub fn answer(&self) -> &str {
        self.answer.as_deref().unwrap_or_default()
    }

    pub fn answer_id(&self) -> &str {
        self.answer_id.as_deref().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// CompletedRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    pub question: String,
    pub answer: String,
    pub answer_id: String,
    pub conversation_id: Option<ConversationId>,
    pub segments: Vec<PathBuf>,
    pub model: String,
    pub effort: Option<String>,
    pub elapsed_seconds: u64,
}

impl From<&RecoveredContext> for CompletedRun {
    fn from(ctx: &RecoveredContext) -> Self {
        Self {
            question: ctx.question().to_string(),
            answer: ctx.answer().to_string(),
            answer_id: ctx.answer_id().to_string(),
            conversation_id: ctx.conversation_id,
            segments: ctx.segments.clone(),
            model: ctx.model.clone().unwrap_or_default(),
            effort: ctx.effort.clone(),
            elapsed_seconds: ctx.elapsed_seconds,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub enum PipelineState {
    #[default]
    Idle,

    Transcribing,

    Transcribed {
        question: String,
    },

    /// Waiting for the model. Republished every tick with a new
    /// `elapsed_seconds`.
    Thinking {
        question: String,
        effort_label: Option<String>,
        elapsed_seconds: u64,
        status_message: String,
    },

    ThinkingComplete {
        question: String,
        answer: String,
        answer_id: String,
    },

    GeneratingAudio {
        question: String,
        answer: String,
        completed: usize,
        total: usize,
        status_message: String,
    },

    Playing {
        question: String,
        answer: String,
        answer_id: String,
        conversation_id: Option<ConversationId>,
        current_segment: usize,
        total_segments: usize,
        is_paused: bool,
    },

    Complete(CompletedRun),

    ListeningForFollowUp {
        conversation_id: ConversationId,
        prior_answer_id: String,
        prompt_playing: bool,
        listening: bool,
        speech_detected: bool,
    },

    InteractiveEnding {
        conversation_id: ConversationId,
    },

    Error {
        message: String,
        failed_step: FailedStep,
        retryable: bool,
        recovered: RecoveredContext,
    },
}

impl PipelineState {
    /// `true` from transcription until playback ends.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            PipelineState::Transcribing
                | PipelineState::Transcribed { .. }
                | PipelineState::Thinking { .. }
                | PipelineState::ThinkingComplete { .. }
                | PipelineState::GeneratingAudio { .. }
                | PipelineState::Playing { .. }
        )
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, PipelineState::Playing { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Transcribing => "Transcribing",
            PipelineState::Transcribed { .. } => "Transcribed",
            PipelineState::Thinking { .. } => "Thinking",
            PipelineState::ThinkingComplete { .. } => "Answer ready",
            PipelineState::GeneratingAudio { .. } => "Generating audio",
            PipelineState::Playing { .. } => "Playing",
            PipelineState::Complete(_) => "Done",
            PipelineState::ListeningForFollowUp { .. } => "Listening",
            PipelineState::InteractiveEnding { .. } => "Ending conversation",
            PipelineState::Error { .. } => "Error",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_idle() {
        assert_eq!(PipelineState::default(), PipelineState::Idle);
    }

    #[test]
    fn busy_states() {
        assert!(!PipelineState::Idle.is_busy());
        assert!(PipelineState::Transcribing.is_busy());
        assert!(PipelineState::Transcribed {
            question: "q".into()
        }
        .is_busy());
        assert!(!PipelineState::InteractiveEnding {
            conversation_id: ConversationId(1)
        }
        .is_busy());
    }

    #[test]
    fn labels() {
        assert_eq!(PipelineState::Idle.label(), "Idle");
        assert_eq!(PipelineState::Transcribing.label(), "Transcribing");
        assert_eq!(
            PipelineState::Complete(CompletedRun::from(&RecoveredContext::default())).label(),
            "Done"
        );
    }

    // ---- FailedStep::infer ---

    #[test]
    fn infer_picks_the_most_specific_step() {
        let mut ctx = RecoveredContext::default();
        assert_eq!(FailedStep::infer(&ctx), FailedStep::Model);

        ctx.recording = Some("q.wav".into());
        assert_eq!(FailedStep::infer(&ctx), FailedStep::Transcription);

        ctx.question = Some("why".into());
        assert_eq!(FailedStep::infer(&ctx), FailedStep::Model);

        ctx.answer = Some(String::new());
        assert_eq!(FailedStep::infer(&ctx), FailedStep::Model);

        ctx.answer = Some("because".into());
        assert_eq!(FailedStep::infer(&ctx), FailedStep::Synthesis);

        ctx.segments = vec!["chunk_000.wav".into()];
        assert_eq!(FailedStep::infer(&ctx), FailedStep::Playback);
    }

    #[test]
    fn completed_run_copies_context() {
        let ctx = RecoveredContext {
            question: Some("q".into()),
            answer: Some("a".into()),
            answer_id: Some("resp_1".into()),
            model: Some("m".into()),
            elapsed_seconds: 3,
            ..RecoveredContext::default()
        };
        let run = CompletedRun::from(&ctx);
        assert_eq!(run.answer_id, "resp_1");
        assert_eq!(run.model, "m");
        assert_eq!(run.elapsed_seconds, 3);
    }
}
