//! Audio output seam used by the playback engine.
//!
//! [`AudioOutput`] loads one segment at a time and hands back a
//! [`SegmentHandle`] plus a `finished` signal that fires when the segment
//! plays to its end. The engine never touches audio samples itself.
//!
//! [`MockOutput`] (available under `#[cfg(test)]`) records every call and
//! lets tests decide when a segment finishes.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::sync::oneshot;

// ---------------------------------------------------------------------------
// PlaybackError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum PlaybackError {
    /// The output device cannot be used at all.
    #[error("audio output unavailable: {0}")]
    Device(String),

    /// One segment could not be decoded; playback skips it.
    #[error("failed to load {}: {message}", .path.display())]
    Load { path: PathBuf, message: String },

    #[error("none of the {0} audio segment(s) could be played")]
    NothingPlayable(usize),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Controls of one loaded segment. Dropping the handle releases it.
pub trait SegmentHandle: Send {
    fn start(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, offset_ms: u64);
    fn position_ms(&self) -> u64;
    /// Apply a new speed immediately. Returns `false` when the segment cannot
    /// change speed while loaded.
    fn set_speed(&mut self, speed: f32) -> bool;
    fn stop(&mut self);
}

pub struct OpenedSegment {
    pub handle: Box<dyn SegmentHandle>,
    /// Fires (or is dropped) when the segment reaches its end.
    pub finished: oneshot::Receiver<()>,
}

/// Object-safe, thread-safe audio sink.
///
/// Both methods may block on file I/O; the engine calls them from
/// `spawn_blocking`.
pub trait AudioOutput: Send + Sync {
    /// Duration of the segment, `None` when it cannot be read.
    fn probe_duration_ms(&self, path: &Path) -> Option<u64>;

    /// Load `path`, ready to start at `speed`. The segment stays silent until
    /// [`SegmentHandle::start`].
    fn open(&self, path: &Path, speed: f32) -> Result<OpenedSegment, PlaybackError>;
}

// ---------------------------------------------------------------------------
// MockOutput  (test-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use mock::MockOutput;

#[cfg(test)]
mod mock {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    type FinishSlot = Arc<Mutex<Option<oneshot::Sender<()>>>>;

    /// Records `open`/`start`/`pause`/`seek`/`speed`/`stop` events by file
    /// name. With `auto_finish` a segment ends as soon as it starts;
    /// otherwise call [`finish_current`](MockOutput::finish_current).
    pub struct MockOutput {
        default_duration_ms: u64,
        durations: Mutex<HashMap<PathBuf, u64>>,
        broken: Mutex<HashSet<PathBuf>>,
        device_down: AtomicBool,
        auto_finish: bool,
        events: Arc<Mutex<Vec<String>>>,
        current: FinishSlot,
    }

    impl MockOutput {
        pub fn manual() -> Self {
            Self::new(false)
        }

        pub fn auto_finish() -> Self {
            Self::new(true)
        }

        fn new(auto_finish: bool) -> Self {
            Self {
                default_duration_ms: 1_000,
                durations: Mutex::new(HashMap::new()),
                broken: Mutex::new(HashSet::new()),
                device_down: AtomicBool::new(false),
                auto_finish,
                events: Arc::new(Mutex::new(Vec::new())),
                current: Arc::new(Mutex::new(None)),
            }
        }

        pub fn set_duration(&self, path: impl Into<PathBuf>, ms: u64) {
            self.durations.lock().unwrap().insert(path.into(), ms);
        }

        pub fn break_segment(&self, path: impl Into<PathBuf>) {
            self.broken.lock().unwrap().insert(path.into());
        }

        pub fn set_device_down(&self, down: bool) {
            self.device_down.store(down, Ordering::SeqCst);
        }

        /// End the most recently opened segment.
        pub fn finish_current(&self) {
            if let Some(tx) = self.current.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }

        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        pub fn has_event(&self, event: &str) -> bool {
            self.events.lock().unwrap().iter().any(|e| e == event)
        }
    }

    fn name(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    impl AudioOutput for MockOutput {
        fn probe_duration_ms(&self, path: &Path) -> Option<u64> {
            if self.broken.lock().unwrap().contains(path) {
                return None;
            }
            Some(
                self.durations
                    .lock()
                    .unwrap()
                    .get(path)
                    .copied()
                    .unwrap_or(self.default_duration_ms),
            )
        }

        fn open(&self, path: &Path, speed: f32) -> Result<OpenedSegment, PlaybackError> {
            if self.device_down.load(Ordering::SeqCst) {
                return Err(PlaybackError::Device("no output device".into()));
            }
            let file = name(path);
            if self.broken.lock().unwrap().contains(path) {
                self.events.lock().unwrap().push(format!("broken {file}"));
                return Err(PlaybackError::Load {
                    path: path.to_path_buf(),
                    message: "corrupt".into(),
                });
            }

            let (tx, rx) = oneshot::channel();
            *self.current.lock().unwrap() = Some(tx);
            self.events
                .lock()
                .unwrap()
                .push(format!("open {file} x{speed}"));

            Ok(OpenedSegment {
                handle: Box::new(MockHandle {
                    file,
                    position: 0,
                    auto_finish: self.auto_finish,
                    events: Arc::clone(&self.events),
                    finish: Arc::clone(&self.current),
                }),
                finished: rx,
            })
        }
    }

    struct MockHandle {
        file: String,
        position: u64,
        auto_finish: bool,
        events: Arc<Mutex<Vec<String>>>,
        finish: FinishSlot,
    }

    impl MockHandle {
        fn log(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl SegmentHandle for MockHandle {
        fn start(&mut self) {
            self.log(format!("start {}", self.file));
            if self.auto_finish {
                if let Some(tx) = self.finish.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        }

        fn pause(&mut self) {
            self.log(format!("pause {}", self.file));
        }

        fn seek(&mut self, offset_ms: u64) {
            self.position = offset_ms;
            self.log(format!("seek {} {offset_ms}", self.file));
        }

        fn position_ms(&self) -> u64 {
            self.position
        }

        fn set_speed(&mut self, speed: f32) -> bool {
            self.log(format!("speed {} x{speed}", self.file));
            true
        }

        fn stop(&mut self) {
            self.log(format!("stop {}", self.file));
        }
    }
}
