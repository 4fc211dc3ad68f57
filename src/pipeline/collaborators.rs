//! Device-side collaborators: follow-up speech capture and audio focus.
//!
//! Both are held through RAII guards so every exit path of a run,
//! cancellation included, releases them.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// SpeechCapture
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    /// Trailing silence that ends an utterance.
    pub silence_timeout_ms: u64,
    /// Give up when nobody starts speaking within this window.
    pub no_speech_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    SpeechDetected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Speech(PathBuf),
    NoSpeech,
    /// The recording hit the device's length cap; still usable speech.
    MaxDuration(PathBuf),
}

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("no capture device available: {0}")]
    Unavailable(String),

    #[error("capture failed: {0}")]
    Failed(String),
}

/// Records one utterance, ending on silence.
#[async_trait]
pub trait SpeechCapture: Send + Sync {
    async fn capture_until_silence(
        &self,
        limits: CaptureLimits,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<CaptureOutcome, CaptureError>;

    /// Release the recording route. Called when capture ends or is abandoned.
    fn release(&self) {}
}

/// Calls [`SpeechCapture::release`] on drop.
pub struct CaptureGuard {
    capture: Arc<dyn SpeechCapture>,
}

impl CaptureGuard {
    pub fn new(capture: Arc<dyn SpeechCapture>) -> Self {
        Self { capture }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.capture.release();
    }
}

/// Capture backend for hosts without a microphone path: never hears anyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCapture;

#[async_trait]
impl SpeechCapture for NullCapture {
    async fn capture_until_silence(
        &self,
        _limits: CaptureLimits,
        _events: mpsc::Sender<CaptureEvent>,
    ) -> Result<CaptureOutcome, CaptureError> {
        Ok(CaptureOutcome::NoSpeech)
    }
}

// ---------------------------------------------------------------------------
// AudioFocus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusChange {
    Gained,
    /// Another stream needs the output briefly.
    LostTransient,
    Lost,
}

pub trait AudioFocus: Send + Sync {
    /// `true` when playback may proceed.
    fn request_playback_focus(&self) -> bool;
    fn abandon(&self);
}

/// Holds playback focus until dropped.
pub struct FocusGuard {
    focus: Arc<dyn AudioFocus>,
    granted: bool,
}

impl FocusGuard {
    pub fn acquire(focus: Arc<dyn AudioFocus>) -> Self {
        let granted = focus.request_playback_focus();
        if !granted {
            log::warn!("pipeline: audio focus denied, playing anyway");
        }
        Self { focus, granted }
    }

    pub fn granted(&self) -> bool {
        self.granted
    }
}

impl Drop for FocusGuard {
    fn drop(&mut self) {
        self.focus.abandon();
    }
}

/// Focus backend for platforms without focus arbitration.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnmanagedFocus;

impl AudioFocus for UnmanagedFocus {
    fn request_playback_focus(&self) -> bool {
        true
    }

    fn abandon(&self) {}
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use mock::{CountingFocus, ScriptedCapture};


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn focus_guard_abandons_on_drop() {
        let focus = Arc::new(CountingFocus::default());
        {
            let guard = FocusGuard::acquire(focus.clone());
            assert!(guard.granted());
        }
        assert_eq!(focus.requests.load(Ordering::SeqCst), 1);
        assert_eq!(focus.abandons.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn capture_guard_releases_when_capture_is_abandoned() {
        let capture = Arc::new(ScriptedCapture::default());
        let (tx, _rx) = mpsc::channel(4);
        {
            let _guard = CaptureGuard::new(capture.clone());
            let pending = capture.capture_until_silence(
                CaptureLimits {
                    silence_timeout_ms: 10,
                    no_speech_timeout_ms: 10,
                },
                tx,
            );
            drop(pending);
        }
        assert_eq!(capture.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn null_capture_hears_nothing() {
        let (tx, _rx) = mpsc::channel(1);
        let outcome = NullCapture
            .capture_until_silence(
                CaptureLimits {
                    silence_timeout_ms: 1,
                    no_speech_timeout_ms: 1,
                },
                tx,
            )
            .await
            .unwrap();
        assert_eq!(outcome, CaptureOutcome::NoSpeech);
    }
}
