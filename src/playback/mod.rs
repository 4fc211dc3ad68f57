//! Ordered audio segments played as one continuous track.
//!
//! ```text
//! PlaybackEngine ──▶ Timeline          (global ↔ segment positions)
//!        │
//!        └──────────▶ dyn AudioOutput  (RodioOutput, or a test double)
//! ```

pub mod device;
pub mod engine;
pub mod output;
pub mod timeline;

pub use device::RodioOutput;
pub use engine::{clamp_speed, PlaybackEngine, PlaybackSnapshot, MAX_SPEED, MIN_SPEED};
pub use output::{AudioOutput, OpenedSegment, PlaybackError, SegmentHandle};
pub use timeline::Timeline;

#[cfg(test)]
pub use output::MockOutput;
