//! Sequential playback of answer segments as one continuous track.
//!
//! # Play loop
//!
//! ```text
//! play(segments)
//!   ├─ probe durations ─▶ Timeline
//!   └─ loop over `current`
//!        ├─ spawn_blocking(AudioOutput::open)   load failure → skip
//!        ├─ apply queued start offset, start unless paused
//!        ├─ select! { finished, interrupt }     interrupt = stop / cross-segment seek
//!        └─ next = pending redirect or current + 1
//! ```
//!
//! Every control call takes the same mutex as the loop, and each `play`
//! call owns a generation number: `stop()` bumps it, and a loop that finds
//! its generation outdated exits instead of touching the new state.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, watch};

use super::output::{AudioOutput, OpenedSegment, PlaybackError, SegmentHandle};
use super::timeline::Timeline;

pub const MIN_SPEED: f32 = 0.5;
pub const MAX_SPEED: f32 = 2.0;

// ---------------------------------------------------------------------------
// PlaybackSnapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSnapshot {
    pub is_playing: bool,
    pub is_paused: bool,
    /// Zero-based index of the segment being played.
    pub current_segment_index: usize,
    pub total_segments: usize,
    pub speed_multiplier: f32,
}

impl Default for PlaybackSnapshot {
    fn default() -> Self {
        Self {
            is_playing: false,
            is_paused: false,
            current_segment_index: 0,
            total_segments: 0,
            speed_multiplier: 1.0,
        }
    }
}

pub fn clamp_speed(speed: f32) -> f32 {
    if speed.is_nan() {
        return 1.0;
    }
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

// ---------------------------------------------------------------------------
// Inner state
// ---------------------------------------------------------------------------

struct Inner {
    generation: u64,
    segments: Vec<PathBuf>,
    timeline: Timeline,
    current: usize,
    /// Cross-segment seek target consumed by the loop after the current
    /// segment is released.
    pending: Option<(usize, u64)>,
    /// Offset applied when the next segment is loaded.
    start_offset_ms: u64,
    handle: Option<Box<dyn SegmentHandle>>,
    interrupt: Option<oneshot::Sender<()>>,
    speed: f32,
    playing: bool,
    paused: bool,
}

impl Inner {
    fn snapshot(&self) -> PlaybackSnapshot {
        PlaybackSnapshot {
            is_playing: self.playing,
            is_paused: self.paused,
            current_segment_index: self.current,
            total_segments: self.segments.len(),
            speed_multiplier: self.speed,
        }
    }

    /// Stop and drop the loaded segment and wake the loop.
    fn release_segment(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.stop();
        }
        if let Some(tx) = self.interrupt.take() {
            let _ = tx.send(());
        }
    }

    fn position_in_segment(&self) -> u64 {
        self.handle
            .as_ref()
            .map_or(self.start_offset_ms, |h| h.position_ms())
    }

    fn advance(&mut self) {
        match self.pending.take() {
            Some((index, offset)) => {
                self.current = index;
                self.start_offset_ms = offset;
            }
            None => {
                self.current += 1;
                self.start_offset_ms = 0;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PlaybackEngine
// ---------------------------------------------------------------------------

pub struct PlaybackEngine {
    output: Arc<dyn AudioOutput>,
    inner: Mutex<Inner>,
    snapshot: watch::Sender<PlaybackSnapshot>,
}

impl PlaybackEngine {
    pub fn new(output: Arc<dyn AudioOutput>, initial_speed: f32) -> Self {
        let speed = clamp_speed(initial_speed);
        let (snapshot, _) = watch::channel(PlaybackSnapshot {
            speed_multiplier: speed,
            ..PlaybackSnapshot::default()
        });
        Self {
            output,
            inner: Mutex::new(Inner {
                generation: 0,
                segments: Vec::new(),
                timeline: Timeline::default(),
                current: 0,
                pending: None,
                start_offset_ms: 0,
                handle: None,
                interrupt: None,
                speed,
                playing: false,
                paused: false,
            }),
            snapshot,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.snapshot.borrow().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot.send_replace(inner.snapshot());
    }

    /// Play `segments` in order and return when the last one finishes or
    /// playback is stopped.
    ///
    /// Segments that fail to load are skipped.
    ///
    /// # Errors
    ///
    /// [`PlaybackError::Device`] when the output is unusable, and
    /// [`PlaybackError::NothingPlayable`] when every segment failed to load.
    pub async fn play(&self, segments: Vec<PathBuf>) -> Result<(), PlaybackError> {
        if segments.is_empty() {
            return Ok(());
        }
        let total = segments.len();
        let durations = self.probe_durations(&segments).await;

        let generation = {
            let mut inner = self.lock();
            inner.release_segment();
            inner.generation += 1;
            inner.segments = segments;
            inner.timeline = Timeline::new(durations);
            inner.current = 0;
            inner.pending = None;
            inner.start_offset_ms = 0;
            inner.playing = true;
            inner.paused = false;
            self.publish(&inner);
            inner.generation
        };
        let _guard = PlayGuard {
            engine: self,
            generation,
        };
        log::debug!("playback: starting {total} segment(s)");

        let mut played = 0usize;
        let mut skipped = 0usize;

        loop {
            let (path, speed) = {
                let mut inner = self.lock();
                if inner.generation != generation || !inner.playing {
                    break;
                }
                if inner.current >= inner.segments.len() {
                    break;
                }
                self.publish(&inner);
                (inner.segments[inner.current].clone(), inner.speed)
            };

            let output = Arc::clone(&self.output);
            let load_path = path.clone();
            let opened = tokio::task::spawn_blocking(move || output.open(&load_path, speed))
                .await
                .unwrap_or_else(|e| {
                    Err(PlaybackError::Load {
                        path: path.clone(),
                        message: e.to_string(),
                    })
                });

            let OpenedSegment {
                mut handle,
                finished,
            } = match opened {
                Ok(opened) => opened,
                Err(PlaybackError::Load { path, message }) => {
                    log::warn!("playback: skipping {} ({message})", path.display());
                    skipped += 1;
                    let mut inner = self.lock();
                    if inner.generation != generation {
                        break;
                    }
                    inner.advance();
                    continue;
                }
                Err(err) => {
                    log::error!("playback: {err}");
                    return Err(err);
                }
            };

            let (interrupt_tx, interrupt_rx) = oneshot::channel();
            {
                let mut inner = self.lock();
                if inner.generation != generation {
                    handle.stop();
                    break;
                }
                if inner.pending.is_some() {
                    // Redirected while loading.
                    handle.stop();
                    inner.advance();
                    continue;
                }
                let offset = std::mem::take(&mut inner.start_offset_ms);
                if offset > 0 {
                    handle.seek(offset);
                }
                if !inner.paused {
                    handle.start();
                }
                inner.handle = Some(handle);
                inner.interrupt = Some(interrupt_tx);
                self.publish(&inner);
            }
            played += 1;

            tokio::select! {
                _ = finished => {}
                _ = interrupt_rx => {}
            }

            let mut inner = self.lock();
            if inner.generation != generation {
                break;
            }
            if let Some(mut handle) = inner.handle.take() {
                handle.stop();
            }
            inner.interrupt = None;
            inner.advance();
        }

        if played == 0 && skipped == total {
            return Err(PlaybackError::NothingPlayable(total));
        }
        Ok(())
    }

    async fn probe_durations(&self, segments: &[PathBuf]) -> Vec<u64> {
        let output = Arc::clone(&self.output);
        let paths = segments.to_vec();
        tokio::task::spawn_blocking(move || {
            paths
                .iter()
                .map(|p| output.probe_duration_ms(p).unwrap_or(0))
                .collect()
        })
        .await
        .unwrap_or_else(|_| vec![0; segments.len()])
    }

    /// Move `delta_ms` along the whole answer, crossing segments as needed.
    pub fn seek_global(&self, delta_ms: i64) {
        let mut inner = self.lock();
        if !inner.playing {
            return;
        }
        let here = inner.position_in_segment();
        let (index, offset) = inner.timeline.seek_relative(inner.current, here, delta_ms);
        self.seek_locked(&mut inner, index, offset);
    }

    /// Jump to `offset_ms` inside segment `index`.
    pub fn seek_to(&self, index: usize, offset_ms: u64) {
        let mut inner = self.lock();
        if !inner.playing || index >= inner.segments.len() {
            return;
        }
        self.seek_locked(&mut inner, index, offset_ms);
    }

    fn seek_locked(&self, inner: &mut Inner, index: usize, offset_ms: u64) {
        if index == inner.current {
            match inner.handle.as_mut() {
                Some(handle) => handle.seek(offset_ms),
                None => inner.start_offset_ms = offset_ms,
            }
            return;
        }
        log::debug!("playback: redirect to segment {index} at {offset_ms}ms");
        inner.pending = Some((index, offset_ms));
        inner.release_segment();
    }

    pub fn pause(&self) {
        let mut inner = self.lock();
        if !inner.playing || inner.paused {
            return;
        }
        if let Some(handle) = inner.handle.as_mut() {
            handle.pause();
        }
        inner.paused = true;
        self.publish(&inner);
    }

    /// Continue from the paused position, including an offset queued for a
    /// segment that had not started yet.
    pub fn resume(&self) {
        let mut inner = self.lock();
        if !inner.playing || !inner.paused {
            return;
        }
        if let Some(handle) = inner.handle.as_mut() {
            handle.start();
        }
        inner.paused = false;
        self.publish(&inner);
    }

    /// Clamp to [0.5, 2.0] and apply now if the loaded segment supports it;
    /// otherwise the next segment opens at the new speed.
    pub fn set_speed(&self, speed: f32) -> f32 {
        let speed = clamp_speed(speed);
        let mut inner = self.lock();
        inner.speed = speed;
        if let Some(handle) = inner.handle.as_mut() {
            if !handle.set_speed(speed) {
                log::debug!("playback: speed {speed} applies from the next segment");
            }
        }
        self.publish(&inner);
        speed
    }

    /// Release the loaded segment and return to idle. A pending
    /// [`play`](Self::play) call returns.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.release_segment();
        inner.segments.clear();
        inner.timeline = Timeline::default();
        inner.current = 0;
        inner.pending = None;
        inner.start_offset_ms = 0;
        inner.playing = false;
        inner.paused = false;
        self.publish(&inner);
    }

    /// Same as [`stop`](Self::stop); the speed setting survives both.
    pub fn reset(&self) {
        self.stop();
    }

    pub fn is_playing(&self) -> bool {
        self.lock().playing
    }

    /// Position on the global timeline.
    pub fn position_ms(&self) -> u64 {
        let inner = self.lock();
        inner
            .timeline
            .global_position(inner.current, inner.position_in_segment())
    }

    pub fn duration_ms(&self) -> u64 {
        self.lock().timeline.total_ms()
    }

    /// End of one `play` call, normal or cancelled.
    fn finish(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.release_segment();
        inner.pending = None;
        inner.playing = false;
        inner.paused = false;
        self.publish(&inner);
    }
}

/// Releases the output when a `play` future completes or is dropped.
struct PlayGuard<'a> {
    engine: &'a PlaybackEngine,
    generation: u64,
}

impl Drop for PlayGuard<'_> {
    fn drop(&mut self) {
        self.engine.finish(self.generation);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::output::MockOutput;
    use std::time::Duration;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from(format!("/seg/{n}"))).collect()
    }

    async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn engine(output: &Arc<MockOutput>) -> Arc<PlaybackEngine> {
        Arc::new(PlaybackEngine::new(output.clone(), 1.0))
    }

    #[tokio::test]
    async fn plays_every_segment_in_order() {
        let output = Arc::new(MockOutput::auto_finish());
        let engine = engine(&output);

        engine.play(paths(&["a", "b", "c"])).await.expect("play");

        let starts: Vec<String> = output
            .events()
            .into_iter()
            .filter(|e| e.starts_with("start"))
            .collect();
        assert_eq!(starts, ["start a", "start b", "start c"]);
        assert!(!engine.snapshot().is_playing);
    }

    #[tokio::test]
    async fn broken_segment_is_skipped() {
        let output = Arc::new(MockOutput::auto_finish());
        output.break_segment("/seg/b");
        let engine = engine(&output);

        engine.play(paths(&["a", "b", "c"])).await.expect("play");

        assert!(output.has_event("broken b"));
        assert!(output.has_event("start a"));
        assert!(output.has_event("start c"));
    }

    #[tokio::test]
    async fn all_segments_broken_is_an_error() {
        let output = Arc::new(MockOutput::auto_finish());
        output.break_segment("/seg/a");
        output.break_segment("/seg/b");
        let engine = engine(&output);

        let err = engine.play(paths(&["a", "b"])).await.unwrap_err();
        assert!(matches!(err, PlaybackError::NothingPlayable(2)));
    }

    #[tokio::test]
    async fn device_failure_aborts_playback() {
        let output = Arc::new(MockOutput::auto_finish());
        output.set_device_down(true);
        let engine = engine(&output);

        let err = engine.play(paths(&["a"])).await.unwrap_err();
        assert!(matches!(err, PlaybackError::Device(_)));
        assert!(!engine.is_playing());
    }

    #[tokio::test]
    async fn global_seek_redirects_into_the_right_segment() {
        let output = Arc::new(MockOutput::manual());
        output.set_duration("/seg/a", 10_000);
        output.set_duration("/seg/b", 8_000);
        output.set_duration("/seg/c", 12_000);
        let engine = engine(&output);

        let player = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.play(paths(&["a", "b", "c"])).await })
        };
        wait_until("a to start", || output.has_event("start a")).await;
        assert_eq!(engine.duration_ms(), 30_000);

        engine.seek_global(15_000);
        wait_until("b to start", || output.has_event("start b")).await;

        let events = output.events();
        let stop_a = events.iter().position(|e| e == "stop a").expect("a stopped");
        let seek_b = events.iter().position(|e| e == "seek b 5000").expect("b seeked");
        let start_b = events.iter().position(|e| e == "start b").expect("b started");
        assert!(stop_a < seek_b && seek_b < start_b);
        assert_eq!(engine.snapshot().current_segment_index, 1);
        assert_eq!(engine.position_ms(), 15_000);

        output.finish_current();
        wait_until("c to start", || output.has_event("start c")).await;
        output.finish_current();

        player.await.expect("join").expect("play");
        assert_eq!(
            output.events().iter().filter(|e| *e == "start a").count(),
            1
        );
    }

    #[tokio::test]
    async fn seek_within_current_segment_is_immediate() {
        let output = Arc::new(MockOutput::manual());
        output.set_duration("/seg/a", 10_000);
        let engine = engine(&output);

        let player = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.play(paths(&["a", "b"])).await })
        };
        wait_until("a to start", || output.has_event("start a")).await;

        engine.seek_to(0, 4_000);
        assert!(output.has_event("seek a 4000"));
        assert!(!output.has_event("stop a"));

        engine.seek_global(0);
        assert_eq!(engine.position_ms(), 4_000);

        engine.stop();
        player.await.expect("join").expect("play");
    }

    #[tokio::test]
    async fn pause_and_resume_keep_the_position() {
        let output = Arc::new(MockOutput::manual());
        let engine = engine(&output);

        let player = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.play(paths(&["a", "b"])).await })
        };
        wait_until("a to start", || output.has_event("start a")).await;

        engine.pause();
        assert!(engine.snapshot().is_paused);
        assert!(output.has_event("pause a"));

        // Finishing while paused: the next segment loads but stays silent.
        output.finish_current();
        wait_until("b to open", || output.has_event("open b x1")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!output.has_event("start b"));

        engine.resume();
        assert!(output.has_event("start b"));
        assert!(!engine.snapshot().is_paused);

        output.finish_current();
        player.await.expect("join").expect("play");
    }

    #[tokio::test]
    async fn stop_unblocks_the_play_call() {
        let output = Arc::new(MockOutput::manual());
        let engine = engine(&output);

        let player = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.play(paths(&["a", "b"])).await })
        };
        wait_until("a to start", || output.has_event("start a")).await;

        engine.stop();
        tokio::time::timeout(Duration::from_secs(2), player)
            .await
            .expect("play returned")
            .expect("join")
            .expect("play");

        assert!(output.has_event("stop a"));
        assert!(!output.has_event("open b x1"));
        let snap = engine.snapshot();
        assert!(!snap.is_playing);
        assert_eq!(snap.total_segments, 0);
    }

    #[tokio::test]
    async fn dropping_the_play_future_releases_the_segment() {
        let output = Arc::new(MockOutput::manual());
        let engine = engine(&output);

        let player = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.play(paths(&["a"])).await })
        };
        wait_until("a to start", || output.has_event("start a")).await;

        player.abort();
        let _ = player.await;
        assert!(output.has_event("stop a"));
        assert!(!engine.is_playing());
    }

    #[tokio::test]
    async fn speed_is_clamped_and_applied() {
        let output = Arc::new(MockOutput::manual());
        let engine = engine(&output);

        assert_eq!(engine.set_speed(3.0), 2.0);
        assert_eq!(engine.set_speed(0.1), 0.5);

        let player = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.play(paths(&["a"])).await })
        };
        wait_until("a to open", || output.has_event("open a x0.5")).await;
        wait_until("a to start", || output.has_event("start a")).await;

        engine.set_speed(1.5);
        assert!(output.has_event("speed a x1.5"));
        assert_eq!(engine.snapshot().speed_multiplier, 1.5);

        engine.stop();
        player.await.expect("join").expect("play");
        assert_eq!(engine.snapshot().speed_multiplier, 1.5);
    }
}
