//! voice-answer: ask a question out loud, hear the answer.
//!
//! * [`pipeline`]: the orchestrator state machine and its collaborators.
//! * [`synthesis`]: answer text → ordered audio segments.
//! * [`playback`]: segments played back as one track.
//! * [`providers`]: transcription, answer and speech HTTP backends.
//! * [`store`]: conversation history.
//! * [`config`]: `settings.toml` and platform paths.

pub mod config;
pub mod pipeline;
pub mod playback;
pub mod providers;
pub mod store;
pub mod synthesis;
