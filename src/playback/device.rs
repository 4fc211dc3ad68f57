//! [`AudioOutput`] that plays segments through `rodio`.
//!
//! Every segment gets its own output stream and [`Sink`]. The stream lives on
//! a dedicated thread (`cpal` streams are not `Send` on every platform); the
//! sink is shared with the segment handle and the same thread watches it to
//! report the natural end of the segment.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink, Source};
use tokio::sync::oneshot;

use super::output::{AudioOutput, OpenedSegment, PlaybackError, SegmentHandle};
use crate::config::PlaybackConfig;

/// How often the output thread checks whether the sink ran dry.
const END_POLL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn decode(path: &Path) -> Result<Decoder<BufReader<File>>, PlaybackError> {
    let load_err = |message: String| PlaybackError::Load {
        path: path.to_path_buf(),
        message,
    };
    let file = File::open(path).map_err(|e| load_err(e.to_string()))?;
    Decoder::new(BufReader::new(file)).map_err(|e| load_err(e.to_string()))
}

/// Duration read from the WAV header without decoding samples.
pub fn wav_duration_ms(path: &Path) -> Option<u64> {
    let reader = hound::WavReader::open(path).ok()?;
    let rate = reader.spec().sample_rate;
    if rate == 0 {
        return None;
    }
    Some(u64::from(reader.duration()) * 1000 / u64::from(rate))
}

// ---------------------------------------------------------------------------
// Device selection
// ---------------------------------------------------------------------------

fn find_device(name: &str) -> Option<cpal::Device> {
    let host = cpal::default_host();
    let mut devices = host.output_devices().ok()?;
    devices.find(|d| d.name().is_ok_and(|n| n == name))
}

/// Runs on the output thread.
fn open_stream(device_name: Option<&str>) -> Result<OutputStream, PlaybackError> {
    let builder = match device_name {
        Some(name) => match find_device(name) {
            Some(device) => OutputStreamBuilder::from_device(device),
            None => {
                log::warn!("playback: output device '{name}' not found, using default");
                OutputStreamBuilder::from_default_device()
            }
        },
        None => OutputStreamBuilder::from_default_device(),
    }
    .map_err(|e| PlaybackError::Device(e.to_string()))?;

    let mut stream = builder
        .open_stream()
        .map_err(|e| PlaybackError::Device(e.to_string()))?;
    stream.log_on_drop(false);
    Ok(stream)
}

/// Block until the handle stops (or is dropped), firing `finished` once the
/// sink has played everything it was given.
fn watch_until_stopped(sink: &Sink, stop: &mpsc::Receiver<()>, finished: oneshot::Sender<()>) {
    let mut finished = Some(finished);
    loop {
        match stop.recv_timeout(END_POLL) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if sink.empty() {
                    if let Some(tx) = finished.take() {
                        let _ = tx.send(());
                    }
                }
            }
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => return,
        }
    }
}

// ---------------------------------------------------------------------------
// RodioOutput
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct RodioOutput {
    /// Output device name; `None` plays on the system default.
    device: Option<String>,
}

impl RodioOutput {
    pub fn new(device: Option<String>) -> Self {
        Self { device }
    }

    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self::new(config.output_device.clone())
    }
}

impl AudioOutput for RodioOutput {
    fn probe_duration_ms(&self, path: &Path) -> Option<u64> {
        wav_duration_ms(path).or_else(|| {
            let source = decode(path).ok()?;
            source.total_duration().map(|d| d.as_millis() as u64)
        })
    }

    fn open(&self, path: &Path, speed: f32) -> Result<OpenedSegment, PlaybackError> {
        let source = decode(path)?;

        let (finished_tx, finished_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<Arc<Sink>, PlaybackError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let device = self.device.clone();

        std::thread::Builder::new()
            .name("playback-output".into())
            .spawn(move || {
                let stream = match open_stream(device.as_deref()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let sink = Arc::new(Sink::connect_new(stream.mixer()));
                sink.pause();
                sink.set_speed(speed);
                sink.append(source);
                let _ = ready_tx.send(Ok(Arc::clone(&sink)));

                watch_until_stopped(&sink, &stop_rx, finished_tx);
                sink.stop();
                drop(stream);
            })
            .map_err(|e| PlaybackError::Device(e.to_string()))?;

        let sink = ready_rx
            .recv()
            .map_err(|_| PlaybackError::Device("output thread exited".into()))??;
        log::debug!("playback: loaded {}", path.display());

        Ok(OpenedSegment {
            handle: Box::new(SinkHandle {
                sink,
                stop: Some(stop_tx),
            }),
            finished: finished_rx,
        })
    }
}

struct SinkHandle {
    sink: Arc<Sink>,
    stop: Option<mpsc::Sender<()>>,
}

impl SegmentHandle for SinkHandle {
    fn start(&mut self) {
        self.sink.play();
    }

    fn pause(&mut self) {
        self.sink.pause();
    }

    fn seek(&mut self, offset_ms: u64) {
        if let Err(e) = self.sink.try_seek(Duration::from_millis(offset_ms)) {
            log::warn!("playback: seek to {offset_ms} ms failed: {e}");
        }
    }

    fn position_ms(&self) -> u64 {
        self.sink.get_pos().as_millis() as u64
    }

    fn set_speed(&mut self, speed: f32) -> bool {
        self.sink.set_speed(speed);
        true
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop.take() {
            self.sink.stop();
            let _ = tx.send(());
        }
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
