//! Pipeline orchestration for voice-answer.
//!
//! This module drives one spoken question from recording to played answer
//! and publishes every transition as a [`PipelineState`] snapshot.
//!
//! # Architecture
//!
//! ```text
//! start(recording) / start_from_text(question)
//!        │
//!        ▼
//! PipelineOrchestrator  ← one tokio task per run, cancelled by token
//!        │
//!        ├─ Transcriber::transcribe              → Transcribing, Transcribed
//!        ├─ ExchangeStore::create_exchange       (placeholder record)
//!        ├─ AnswerGenerator::generate            → Thinking (ticking), ThinkingComplete
//!        ├─ SynthesisEngine::synthesize          → GeneratingAudio (progress mirrored)
//!        ├─ ExchangeStore::finalize_exchange
//!        ├─ PlaybackEngine::play                 → Playing (snapshots mirrored)
//!        └─ follow-up enabled?
//!              ├─ prompt, SpeechCapture, transcribe → ListeningForFollowUp
//!              │     └─ question → next run step in the same conversation
//!              └─ silence / dismissal            → InteractiveEnding → Idle
//!
//! watch::Receiver<PipelineState> ←─── subscribe()
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voice_answer::config::{AppConfig, AppPaths};
//! use voice_answer::pipeline::{NullCapture, PipelineDeps, PipelineOrchestrator, UnmanagedFocus};
//! use voice_answer::playback::{PlaybackEngine, RodioOutput};
//! use voice_answer::providers::{generator_from_config, OpenAiSpeech, OpenAiTranscriber};
//! use voice_answer::store::MemoryStore;
//! use voice_answer::synthesis::{SynthesisEngine, SynthesisSettings};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AppConfig::default();
//!     let deps = PipelineDeps {
//!         transcriber: Arc::new(OpenAiTranscriber::from_config(&config.provider)),
//!         generator: generator_from_config(&config.provider, &config.answer),
//!         synthesis: Arc::new(SynthesisEngine::new(
//!             Arc::new(OpenAiSpeech::from_config(&config.provider)),
//!             SynthesisSettings::from_config(&config.speech),
//!         )),
//!         playback: Arc::new(PlaybackEngine::new(
//!             Arc::new(RodioOutput::from_config(&config.playback)),
//!             config.playback.speed,
//!         )),
//!         store: Arc::new(MemoryStore::new()),
//!         capture: Arc::new(NullCapture),
//!         focus: Arc::new(UnmanagedFocus),
//!     };
//!     let orchestrator = PipelineOrchestrator::new(deps, config, AppPaths::new());
//!
//!     let mut states = orchestrator.subscribe();
//!     orchestrator.start("question.wav", None, None).await;
//!     while states.changed().await.is_ok() {
//!         println!("{}", states.borrow().label());
//!     }
//! }
//! ```

pub mod collaborators;
pub mod error;
pub mod follow_up;
pub mod orchestrator;
pub mod state;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use collaborators::{
    AudioFocus, CaptureError, CaptureEvent, CaptureGuard, CaptureLimits, CaptureOutcome,
    FocusChange, FocusGuard, NullCapture, SpeechCapture, UnmanagedFocus,
};
pub use error::PipelineError;
pub use follow_up::{is_dismissal, DISMISSAL_PHRASES};
pub use orchestrator::{PipelineDeps, PipelineOrchestrator};
pub use state::{CompletedRun, FailedStep, PipelineState, RecoveredContext};
