//! Answer text → ordered audio segments.
//!
//! * [`ChunkSplitter`]: pure sentence-aware split and bisect.
//! * [`clean_for_speech`]: strips markdown, citations and URLs.
//! * [`SynthesisEngine`]: bounded-concurrency synthesis with retry and
//!   adaptive re-splitting, publishing [`SynthesisProgress`].

pub mod chunker;
pub mod cleaner;
pub mod engine;

pub use chunker::{ChunkSplitter, LOOKBACK_CHARS, MAX_CHUNK_CHARS};
pub use cleaner::clean_for_speech;
pub use engine::{SynthesisEngine, SynthesisError, SynthesisProgress, SynthesisSettings};
