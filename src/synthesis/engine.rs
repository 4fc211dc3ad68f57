//! Chunked speech synthesis with bounded concurrency.
//!
//! # Flow
//!
//! ```text
//! answer text
//!   └─▶ clean_for_speech (optional)
//!         └─▶ ChunkSplitter::split ─▶ chunk_000 … chunk_NNN
//!               │
//!               ├─ JoinSet worker per chunk, at most `max_concurrent`
//!               │  holding a Semaphore permit at a time
//!               │    ├─ transient failure  → backoff, retry (max_attempts)
//!               │    └─ input too long     → bisect, recurse (max_split_depth)
//!               │
//!               └─▶ segments re-assembled in chunk order
//! ```
//!
//! Workers run as tasks of a [`JoinSet`] owned by the
//! [`synthesize`](SynthesisEngine::synthesize) future. Dropping that future
//! (run cancelled) or returning on the first failure aborts every worker
//! still in flight.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use super::chunker::ChunkSplitter;
use super::cleaner::clean_for_speech;
use crate::config::SpeechConfig;
use crate::providers::{ApiError, SpeechStyle, SpeechSynthesizer};

// ---------------------------------------------------------------------------
// SynthesisProgress
// ---------------------------------------------------------------------------

/// Aggregate progress of one synthesis call, published after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisProgress {
    pub total_chunks: usize,
    /// Top-level chunks fully synthesized, including all their sub-chunks.
    pub completed_chunks: usize,
    pub is_complete: bool,
    pub status_message: String,
}

// ---------------------------------------------------------------------------
// SynthesisError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum SynthesisError {
    #[error("speech synthesis failed: {source}")]
    Provider { source: ApiError, length_limit: bool },

    #[error("nothing left to synthesize after cleaning the answer")]
    EmptyText,

    #[error("could not create {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },

    /// A worker task panicked.
    #[error("synthesis worker stopped unexpectedly: {0}")]
    Worker(String),
}

impl SynthesisError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SynthesisError::Provider {
                source,
                length_limit,
            } => !length_limit && source.is_retryable(),
            SynthesisError::EmptyText => false,
            SynthesisError::Io { .. } | SynthesisError::Worker(_) => true,
        }
    }

    /// The provider kept rejecting the text as too long even after the
    /// maximum number of bisections.
    pub fn is_length_limit(&self) -> bool {
        matches!(
            self,
            SynthesisError::Provider {
                length_limit: true,
                ..
            }
        )
    }
}

// ---------------------------------------------------------------------------
// SynthesisSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    pub max_chunk_chars: usize,
    pub lookback_chars: usize,
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub max_split_depth: u32,
    pub clean_markdown: bool,
}

impl SynthesisSettings {
    pub fn from_config(config: &SpeechConfig) -> Self {
        Self {
            max_chunk_chars: config.max_chunk_chars,
            lookback_chars: config.lookback_chars,
            max_concurrent: config.max_concurrent,
            max_attempts: config.max_attempts,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_split_depth: config.max_split_depth,
            clean_markdown: config.clean_markdown,
        }
    }

    /// Delay before attempt `attempt` (1-based): none before the first,
    /// `base` before the second, doubling after that.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.retry_base_delay.saturating_mul(factor)
    }
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self::from_config(&SpeechConfig::default())
    }
}

// ---------------------------------------------------------------------------
// SynthesisEngine
// ---------------------------------------------------------------------------

struct Shared {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    settings: SynthesisSettings,
    splitter: ChunkSplitter,
    progress: watch::Sender<SynthesisProgress>,
}

impl Shared {
    /// Single point of mutation for progress; `send_modify` holds the
    /// channel's lock for the whole update.
    fn update(&self, f: impl FnOnce(&mut SynthesisProgress)) {
        self.progress.send_modify(f);
    }
}

/// Turns answer text into an ordered list of audio segment files.
///
/// Cheap to share behind an `Arc`; one engine serves every run, and
/// [`subscribe`](Self::subscribe) exposes its progress.
pub struct SynthesisEngine {
    shared: Arc<Shared>,
}

impl SynthesisEngine {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, settings: SynthesisSettings) -> Self {
        let splitter = ChunkSplitter::new(settings.max_chunk_chars, settings.lookback_chars);
        let (progress, _) = watch::channel(SynthesisProgress::default());
        Self {
            shared: Arc::new(Shared {
                synthesizer,
                settings,
                splitter,
                progress,
            }),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SynthesisProgress> {
        self.shared.progress.subscribe()
    }

    pub fn progress(&self) -> SynthesisProgress {
        self.shared.progress.borrow().clone()
    }

    pub fn reset(&self) {
        self.shared.progress.send_replace(SynthesisProgress::default());
    }

    /// Synthesize `text` into `session_dir`, returning segment paths in text
    /// order.
    ///
    /// Files are named `chunk_NNN.<format>`; a chunk that had to be bisected
    /// contributes `chunk_NNN_0…`, `chunk_NNN_1…` in its place.
    ///
    /// # Errors
    ///
    /// The first chunk failure aborts all other workers and is returned.
    pub async fn synthesize(
        &self,
        text: &str,
        session_dir: &Path,
        style: &SpeechStyle,
    ) -> Result<Vec<PathBuf>, SynthesisError> {
        let started = Instant::now();
        let settings = &self.shared.settings;

        let text = if settings.clean_markdown {
            clean_for_speech(text)
        } else {
            text.trim().to_string()
        };
        if text.is_empty() {
            return Err(SynthesisError::EmptyText);
        }

        tokio::fs::create_dir_all(session_dir)
            .await
            .map_err(|e| SynthesisError::Io {
                path: session_dir.to_path_buf(),
                message: e.to_string(),
            })?;

        let chunks = self.shared.splitter.split(&text);
        let total = chunks.len();
        let char_count = text.chars().count();
        log::info!("tts: {total} chunk(s), {char_count} chars");
        self.shared.progress.send_replace(SynthesisProgress {
            total_chunks: total,
            completed_chunks: 0,
            is_complete: false,
            status_message: format!("Splitting text: {total} chunks ({char_count} chars)"),
        });

        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        let mut workers = JoinSet::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            let shared = Arc::clone(&self.shared);
            let permits = Arc::clone(&permits);
            let dir = session_dir.to_path_buf();
            let style = style.clone();

            workers.spawn(async move {
                let chars = chunk.chars().count();
                shared.update(|p| {
                    p.status_message =
                        format!("Sending chunk {}/{} ({chars} chars)...", index + 1, p.total_chunks);
                });

                let stem = format!("chunk_{index:03}");
                let result = process_chunk(&shared, &permits, chunk, stem, &dir, &style, 0).await;

                if result.is_ok() {
                    shared.update(|p| {
                        p.completed_chunks += 1;
                        p.status_message = format!(
                            "Chunk {} done ({chars} chars). {}/{} complete [{:.1}s total]",
                            index + 1,
                            p.completed_chunks,
                            p.total_chunks,
                            started.elapsed().as_secs_f32()
                        );
                    });
                }
                (index, result)
            });
        }

        let mut ordered: Vec<Option<Vec<PathBuf>>> = vec![None; total];
        while let Some(joined) = workers.join_next().await {
            let (index, result) = joined.map_err(|e| SynthesisError::Worker(e.to_string()))?;
            match result {
                Ok(segments) => ordered[index] = Some(segments),
                Err(err) => {
                    log::error!("tts: chunk {} failed: {err}", index + 1);
                    return Err(err);
                }
            }
        }

        let segments: Vec<PathBuf> = ordered.into_iter().flatten().flatten().collect();
        let secs = started.elapsed().as_secs_f32();
        log::info!("tts: {} segment(s) from {total} chunk(s) in {secs:.1}s", segments.len());
        self.shared.update(|p| {
            p.is_complete = true;
            p.status_message = format!("All {total} chunks generated in {secs:.1}s");
        });

        Ok(segments)
    }

    /// Synthesize a short fixed text straight into `out`, with the usual
    /// retry policy but without splitting or progress updates.
    pub async fn synthesize_one(
        &self,
        text: &str,
        out: &Path,
        style: &SpeechStyle,
    ) -> Result<(), SynthesisError> {
        if let Some(parent) = out.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SynthesisError::Io {
                    path: parent.to_path_buf(),
                    message: e.to_string(),
                })?;
        }
        let permits = Semaphore::new(1);
        synthesize_with_retry(&self.shared, &permits, text, style, out)
            .await
            .map_err(|source| SynthesisError::Provider {
                length_limit: source.is_input_too_long(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

type ChunkFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<PathBuf>, SynthesisError>> + Send + 'a>>;

/// Synthesize one chunk, bisecting it on a length-limit rejection.
fn process_chunk<'a>(
    shared: &'a Shared,
    permits: &'a Semaphore,
    text: String,
    stem: String,
    dir: &'a Path,
    style: &'a SpeechStyle,
    depth: u32,
) -> ChunkFuture<'a> {
    Box::pin(async move {
        let path = dir.join(format!("{stem}.{}", style.format));

        let err = match synthesize_with_retry(shared, permits, &text, style, &path).await {
            Ok(()) => return Ok(vec![path]),
            Err(err) if err.is_input_too_long() => err,
            Err(err) => {
                return Err(SynthesisError::Provider {
                    source: err,
                    length_limit: false,
                })
            }
        };

        let halves = if depth < shared.settings.max_split_depth {
            shared.splitter.bisect(&text)
        } else {
            Vec::new()
        };
        if halves.len() < 2 {
            log::error!(
                "tts: {stem} still too long at split depth {depth} ({} chars)",
                text.chars().count()
            );
            return Err(SynthesisError::Provider {
                source: err,
                length_limit: true,
            });
        }

        log::warn!(
            "tts: {stem} too long ({} chars), splitting at depth {}",
            text.chars().count(),
            depth + 1
        );
        let mut segments = Vec::new();
        for (k, half) in halves.into_iter().enumerate() {
            let sub_stem = format!("{stem}_{k}");
            segments.extend(
                process_chunk(shared, permits, half, sub_stem, dir, style, depth + 1).await?,
            );
        }
        Ok(segments)
    })
}

/// One permit-guarded request with retry. The permit is released before the
/// caller recurses into sub-chunks.
async fn synthesize_with_retry(
    shared: &Shared,
    permits: &Semaphore,
    text: &str,
    style: &SpeechStyle,
    path: &Path,
) -> Result<(), ApiError> {
    let _permit = permits
        .acquire()
        .await
        .map_err(|_| ApiError::Request("synthesis permits closed".into()))?;

    let attempts = shared.settings.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match shared.synthesizer.synthesize(text, style, path).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_input_too_long() || !err.is_retryable() || attempt >= attempts => {
                return Err(err)
            }
            Err(err) => {
                attempt += 1;
                let delay = shared.settings.backoff(attempt);
                log::warn!(
                    "tts: {} attempt {}/{attempts} failed ({err}), retrying in {delay:?}",
                    path.display(),
                    attempt - 1
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
