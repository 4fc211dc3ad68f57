//! Pipeline orchestrator: transcription → answer → speech → playback →
//! optional follow-up loop.
//!
//! # Runs
//!
//! ```text
//! start / start_from_text / retry_from_error
//!   └─▶ launch ─▶ supervisor task ─▶ worker task (drive)
//!                   │                  select! { cancelled, run_steps }
//!                   └─ worker panicked → Error at the most specific step
//! ```
//!
//! One run owns one [`CancellationToken`]; cancelling it drops the worker
//! future at its next suspension point, which also drops in-flight network
//! calls and the RAII focus/capture guards.
//!
//! # Control state
//!
//! Everything shared between the run, the public operations and a history
//! replay lives in one [`Control`] value behind a mutex. State broadcasts go
//! through that mutex too, so observers see them in order and a superseded
//! run's broadcasts can be held back.
//!
//! # Supersession
//!
//! While a replay plays, the live run keeps working but its broadcasts are
//! suppressed. A run that reaches playback in that window parks its result in
//! the single pending slot; when the replay ends the pending result starts
//! playing, otherwise the last suppressed state is republished.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::collaborators::{
    AudioFocus, CaptureEvent, CaptureGuard, CaptureLimits, CaptureOutcome, FocusChange,
    FocusGuard, SpeechCapture,
};
use super::error::PipelineError;
use super::follow_up::{ensure_prompt, is_dismissal};
use super::state::{CompletedRun, FailedStep, PipelineState, RecoveredContext};
use crate::config::{AppConfig, AppPaths};
use crate::playback::{PlaybackEngine, PlaybackError, PlaybackSnapshot};
use crate::providers::{AnswerGenerator, AnswerRequest, ApiError, SpeechStyle, Transcriber};
use crate::store::{
    ConversationId, ExchangeId, ExchangeResult, ExchangeStore, NewExchange,
};
use crate::synthesis::{SynthesisEngine, SynthesisProgress};

const THINKING_STATUS: &str = "Waiting for response...";
const PREPARING_AUDIO_STATUS: &str = "Preparing audio...";
const MIN_THINKING_TICK: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// PipelineDeps
// ---------------------------------------------------------------------------

/// Collaborators the orchestrator drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn AnswerGenerator>,
    pub synthesis: Arc<SynthesisEngine>,
    pub playback: Arc<PlaybackEngine>,
    pub store: Arc<dyn ExchangeStore>,
    pub capture: Arc<dyn SpeechCapture>,
    pub focus: Arc<dyn AudioFocus>,
}

// ---------------------------------------------------------------------------
// Control state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Step {
    Transcribe,
    /// Question known: publish it and write the placeholder exchange.
    Record,
    Answer,
    Synthesize,
    Play,
}

impl Step {
    /// Where a retry re-enters, skipping every step whose output is saved.
    fn resume(failed: FailedStep, ctx: &RecoveredContext) -> Step {
        let from_question = if ctx.exchange_id.is_some() {
            Step::Answer
        } else {
            Step::Record
        };
        if ctx.question.is_none() {
            return Step::Transcribe;
        }
        match failed {
            FailedStep::Transcription | FailedStep::Model => from_question,
            FailedStep::Synthesis if ctx.has_answer() => Step::Synthesize,
            FailedStep::Playback if !ctx.segments.is_empty() => Step::Play,
            FailedStep::Playback if ctx.has_answer() => Step::Synthesize,
            FailedStep::Synthesis | FailedStep::Playback => from_question,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Phase {
    #[default]
    Working,
    Playing,
    Listening,
    /// Result stashed in the pending slot while a replay plays.
    Parked,
}

/// The exchange record of the current (or failed) run.
#[derive(Debug, Clone, Copy)]
struct Placeholder {
    exchange_id: ExchangeId,
    conversation_id: ConversationId,
    /// Delete the conversation too if it ends up empty.
    created_conversation: bool,
    finalized: bool,
}

#[derive(Debug, Default)]
struct BroadcastGate {
    superseded: bool,
    last_suppressed: Option<PipelineState>,
    pending: Option<RecoveredContext>,
}

struct ActiveRun {
    id: u64,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Control {
    next_run: u64,
    next_replay: u64,
    run: Option<ActiveRun>,
    replay: Option<u64>,
    /// Latest state of the live pipeline, broadcast or not.
    state: PipelineState,
    /// Checkpoint of the run's context for unexpected failures.
    context: RecoveredContext,
    phase: Phase,
    gate: BroadcastGate,
    /// Kept through `Error` so a retry reuses the record.
    placeholder: Option<Placeholder>,
    /// Placeholders whose deletion failed or raced with cancellation.
    stale: Vec<Placeholder>,
    listening: Option<CancellationToken>,
    stop_requested: bool,
    /// A replay cut the live answer off; it must be played again even if the
    /// replay is already over when the run notices.
    cut_by_replay: bool,
    paused_by_focus_loss: bool,
    muted: bool,
}

impl Control {
    fn owns(&self, run_id: u64) -> bool {
        self.run.as_ref().is_some_and(|r| r.id == run_id)
    }
}

enum Flow {
    Completed,
    Ended,
    Parked,
    Stale,
}

enum Played {
    /// `Some` when the follow-up loop should start in that conversation.
    Finished { follow_up: Option<ConversationId> },
    /// Cut off by a replay that has already ended; play from the start.
    Restart,
    Parked,
    Stale,
}

enum FollowUp {
    Question(String),
    Ended,
}

// ---------------------------------------------------------------------------
// PipelineOrchestrator
// ---------------------------------------------------------------------------

struct Inner {
    deps: PipelineDeps,
    config: AppConfig,
    paths: AppPaths,
    style: SpeechStyle,
    state_tx: watch::Sender<PipelineState>,
    control: Mutex<Control>,
}

/// Cheap-to-clone handle; every clone drives the same pipeline.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

impl PipelineOrchestrator {
    pub fn new(deps: PipelineDeps, config: AppConfig, paths: AppPaths) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Idle);
        let control = Control {
            muted: config.playback.muted,
            ..Control::default()
        };
        Self {
            inner: Arc::new(Inner {
                style: SpeechStyle::from_config(&config.speech),
                deps,
                config,
                paths,
                state_tx,
                control: Mutex::new(control),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe_synthesis(&self) -> watch::Receiver<SynthesisProgress> {
        self.inner.deps.synthesis.subscribe()
    }

    pub fn subscribe_playback(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.inner.deps.playback.subscribe()
    }

    /// The state observers currently see.
    pub fn current_state(&self) -> PipelineState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn has_active_run(&self) -> bool {
        self.lock().run.is_some()
    }

    // -----------------------------------------------------------------------
    // Run control
    // -----------------------------------------------------------------------

    /// Start a run from a recorded question. An active run is cancelled
    /// first.
    pub async fn start(
        &self,
        recording: impl Into<PathBuf>,
        conversation_id: Option<ConversationId>,
        prior_answer_id: Option<String>,
    ) {
        self.cancel_run().await;
        let ctx = RecoveredContext {
            recording: Some(recording.into()),
            conversation_id,
            prior_answer_id,
            ..RecoveredContext::default()
        };
        self.launch(ctx, Step::Transcribe);
    }

    /// Start a run from a question that is already text.
    pub async fn start_from_text(
        &self,
        question: impl Into<String>,
        conversation_id: Option<ConversationId>,
        prior_answer_id: Option<String>,
    ) {
        self.cancel_run().await;
        let ctx = RecoveredContext {
            question: Some(question.into()),
            conversation_id,
            prior_answer_id,
            ..RecoveredContext::default()
        };
        self.launch(ctx, Step::Record);
    }

    /// Cancel in-flight work, drop the unfinished exchange of the current or
    /// failed run and return to `Idle`.
    pub async fn cancel(&self) {
        self.cancel_run().await;
        let mut c = self.lock();
        if c.run.is_none() && c.state != PipelineState::Idle {
            self.set_state(&mut c, PipelineState::Idle);
        }
    }

    /// Re-enter the pipeline at the failed step. Returns `false` unless the
    /// pipeline shows a retryable `Error`.
    pub fn retry_from_error(&self) -> bool {
        let (ctx, failed_step) = {
            let c = self.lock();
            if c.run.is_some() {
                return false;
            }
            match &c.state {
                PipelineState::Error {
                    failed_step,
                    retryable: true,
                    recovered,
                    ..
                } => (recovered.clone(), *failed_step),
                _ => return false,
            }
        };
        let step = Step::resume(failed_step, &ctx);
        log::info!(
            "pipeline: retrying after {} failure from {step:?}",
            failed_step.label()
        );
        self.launch(ctx, step);
        true
    }

    // -----------------------------------------------------------------------
    // Playback control
    // -----------------------------------------------------------------------

    /// Stop playback (the run then completes without a follow-up), or end
    /// follow-up listening.
    pub fn stop(&self) {
        let mut c = self.lock();
        if c.replay.is_some() {
            drop(c);
            self.inner.deps.playback.stop();
            return;
        }
        match c.phase {
            Phase::Playing => {
                c.stop_requested = true;
                drop(c);
                self.inner.deps.playback.stop();
            }
            Phase::Listening => {
                if let Some(listen) = c.listening.take() {
                    log::info!("pipeline: follow-up listening stopped");
                    listen.cancel();
                }
            }
            Phase::Working | Phase::Parked => {}
        }
    }

    pub fn pause(&self) {
        if self.output_in_use() {
            self.inner.deps.playback.pause();
        }
    }

    pub fn resume(&self) {
        if self.output_in_use() {
            self.lock().paused_by_focus_loss = false;
            self.inner.deps.playback.resume();
        }
    }

    pub fn seek_relative(&self, delta_ms: i64) {
        if self.output_in_use() {
            self.inner.deps.playback.seek_global(delta_ms);
        }
    }

    /// Returns the clamped speed actually applied.
    pub fn set_speed(&self, multiplier: f32) -> f32 {
        self.inner.deps.playback.set_speed(multiplier)
    }

    /// Muted runs still answer and persist but skip playback and the
    /// follow-up loop.
    pub fn set_muted(&self, muted: bool) {
        let mut c = self.lock();
        c.muted = muted;
        if muted && c.phase == Phase::Playing && c.replay.is_none() {
            c.stop_requested = true;
            drop(c);
            self.inner.deps.playback.stop();
        }
    }

    pub fn is_muted(&self) -> bool {
        self.lock().muted
    }

    pub fn on_focus_change(&self, change: FocusChange) {
        let playback = &self.inner.deps.playback;
        let mut c = self.lock();
        let audible = c.phase == Phase::Playing || c.replay.is_some();
        match change {
            FocusChange::LostTransient => {
                if audible && !playback.snapshot().is_paused {
                    log::info!("pipeline: focus lost briefly, pausing");
                    c.paused_by_focus_loss = true;
                    drop(c);
                    playback.pause();
                }
            }
            FocusChange::Gained => {
                if std::mem::take(&mut c.paused_by_focus_loss) {
                    log::info!("pipeline: focus regained, resuming");
                    drop(c);
                    playback.resume();
                }
            }
            FocusChange::Lost => {
                c.paused_by_focus_loss = false;
                if c.phase == Phase::Listening {
                    if let Some(listen) = c.listening.take() {
                        log::info!("pipeline: focus lost, ending follow-up");
                        listen.cancel();
                    }
                } else if audible {
                    log::info!("pipeline: focus lost, stopping playback");
                    if c.replay.is_none() {
                        c.stop_requested = true;
                    }
                    drop(c);
                    playback.stop();
                }
            }
        }
    }

    fn output_in_use(&self) -> bool {
        let c = self.lock();
        c.phase == Phase::Playing || c.replay.is_some()
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Play a stored exchange. The live run, if any, is superseded until the
    /// replay ends; a live answer that was playing restarts afterwards.
    ///
    /// Returns when the replay finishes or is stopped.
    pub async fn replay(
        &self,
        segments: Vec<PathBuf>,
        question: String,
        answer: String,
    ) -> Result<(), PlaybackError> {
        let replay_id = {
            let mut c = self.lock();
            c.next_replay += 1;
            let id = c.next_replay;
            if c.replay.is_none() {
                c.gate.superseded = true;
                c.gate.last_suppressed = Some(c.state.clone());
            }
            if c.phase == Phase::Playing {
                c.cut_by_replay = true;
            }
            c.replay = Some(id);
            c.paused_by_focus_loss = false;
            id
        };
        let _end = ReplayGuard {
            orchestrator: self,
            replay_id,
        };
        log::info!("pipeline: replaying {} segment(s)", segments.len());

        // Ends the live run's playback or an earlier replay.
        self.inner.deps.playback.stop();

        let total = segments.len();
        let playing = |s: &PlaybackSnapshot| PipelineState::Playing {
            question: question.clone(),
            answer: answer.clone(),
            answer_id: String::new(),
            conversation_id: None,
            current_segment: s.current_segment_index,
            total_segments: total,
            is_paused: s.is_paused,
        };
        self.publish_replay(replay_id, playing(&PlaybackSnapshot::default()));

        let _focus = FocusGuard::acquire(Arc::clone(&self.inner.deps.focus));
        self.play_segments(segments, |s| self.publish_replay(replay_id, playing(s)))
            .await
    }

    pub fn stop_replay(&self) {
        if self.lock().replay.is_some() {
            self.inner.deps.playback.stop();
        }
    }

    fn publish_replay(&self, replay_id: u64, state: PipelineState) {
        let c = self.lock();
        if c.replay == Some(replay_id) {
            self.inner.state_tx.send_replace(state);
        }
    }

    fn end_replay(&self, replay_id: u64) {
        let mut c = self.lock();
        if c.replay != Some(replay_id) {
            return;
        }
        c.replay = None;
        c.gate.superseded = false;
        let restored = c.gate.last_suppressed.take();

        if let Some(ctx) = c.gate.pending.take() {
            if let Some((run_id, token)) = c.run.as_ref().map(|r| (r.id, r.token.clone())) {
                log::info!("pipeline: replay ended, playing the pending answer");
                c.phase = Phase::Working;
                let task = self.spawn_run(run_id, token, ctx, Step::Play);
                if let Some(run) = c.run.as_mut() {
                    run.task = Some(task);
                }
                return;
            }
        }

        let state = restored.unwrap_or_else(|| c.state.clone());
        c.state = state.clone();
        self.inner.state_tx.send_replace(state);
    }

    // -----------------------------------------------------------------------
    // Launch / cancel
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.inner
            .control
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn launch(&self, ctx: RecoveredContext, step: Step) {
        let mut c = self.lock();
        c.next_run += 1;
        let run_id = c.next_run;
        let token = CancellationToken::new();

        c.placeholder = match (ctx.exchange_id, ctx.conversation_id) {
            (Some(exchange_id), Some(conversation_id)) => Some(Placeholder {
                exchange_id,
                conversation_id,
                created_conversation: ctx.created_conversation,
                finalized: false,
            }),
            _ => None,
        };
        c.context = ctx.clone();
        c.phase = Phase::Working;
        c.gate.pending = None;
        c.listening = None;
        c.stop_requested = false;
        c.cut_by_replay = false;
        c.paused_by_focus_loss = false;

        log::info!("pipeline: run {run_id} starting at {step:?}");
        // The worker's first broadcast waits for this lock, so the run is
        // registered before it can publish anything.
        let task = self.spawn_run(run_id, token.clone(), ctx, step);
        c.run = Some(ActiveRun {
            id: run_id,
            token,
            task: Some(task),
        });
    }

    /// Spawn the worker under a supervisor that turns a panic into an
    /// `Error` state.
    fn spawn_run(
        &self,
        run_id: u64,
        token: CancellationToken,
        ctx: RecoveredContext,
        step: Step,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let worker = tokio::spawn(this.clone().drive(run_id, token, ctx, step));
            if let Err(e) = worker.await {
                if e.is_panic() {
                    let ctx = this.lock().context.clone();
                    this.fail(run_id, PipelineError::Unexpected(e.to_string()), &ctx);
                }
            }
        })
    }

    /// Cancel the active run, wait for it to wind down and drop the
    /// unfinished exchange it (or a failed run) left behind.
    async fn cancel_run(&self) {
        let (run, placeholder, stop_playback) = {
            let mut c = self.lock();
            let run = c.run.take();
            if let Some(run) = &run {
                run.token.cancel();
            }
            c.gate.pending = None;
            c.phase = Phase::Working;
            c.listening = None;
            c.stop_requested = false;
            c.cut_by_replay = false;
            c.paused_by_focus_loss = false;
            // During a replay the output belongs to the replay.
            let stop_playback = run.is_some() && !c.gate.superseded;
            (run, c.placeholder.take(), stop_playback)
        };

        if let Some(run) = run {
            if stop_playback {
                self.inner.deps.playback.stop();
            }
            self.inner.deps.synthesis.reset();
            if let Some(task) = run.task {
                let _ = task.await;
            }
            log::info!("pipeline: run {} cancelled", run.id);
        }
        if let Some(placeholder) = placeholder {
            self.discard_placeholder(placeholder).await;
        }
        self.clear_stale_placeholders().await;
    }

    /// Delete an unfinished exchange, then its conversation if the run opened
    /// it and nothing else is left in it.
    async fn discard_placeholder(&self, p: Placeholder) {
        if p.finalized {
            return;
        }
        let store = &self.inner.deps.store;

        match store.get_exchange(p.exchange_id).await {
            Ok(Some(record)) if record.is_finalized() => return,
            Ok(_) => {}
            Err(e) => {
                log::warn!("pipeline: could not check exchange {}: {e}", p.exchange_id);
                self.lock().stale.push(p);
                return;
            }
        }
        if let Err(e) = store.delete_exchange(p.exchange_id).await {
            log::warn!("pipeline: could not delete exchange {}: {e}", p.exchange_id);
            self.lock().stale.push(p);
            return;
        }
        log::debug!("pipeline: deleted placeholder exchange {}", p.exchange_id);
        if !p.created_conversation {
            return;
        }

        match store.count_exchanges(p.conversation_id).await {
            Ok(0) => {
                if let Err(e) = store.delete_conversation(p.conversation_id).await {
                    log::warn!(
                        "pipeline: could not delete conversation {}: {e}",
                        p.conversation_id
                    );
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("pipeline: could not count exchanges: {e}"),
        }
    }

    async fn clear_stale_placeholders(&self) {
        let stale = std::mem::take(&mut self.lock().stale);
        for placeholder in stale {
            self.discard_placeholder(placeholder).await;
        }
    }

    // -----------------------------------------------------------------------
    // Broadcasting
    // -----------------------------------------------------------------------

    fn set_state(&self, c: &mut Control, state: PipelineState) {
        c.state = state.clone();
        if c.gate.superseded {
            c.gate.last_suppressed = Some(state);
        } else {
            self.inner.state_tx.send_replace(state);
        }
    }

    /// Publish on behalf of `run_id`; ignored once that run is no longer
    /// active.
    fn emit(&self, run_id: u64, state: PipelineState) -> bool {
        let mut c = self.lock();
        if !c.owns(run_id) {
            return false;
        }
        self.set_state(&mut c, state);
        true
    }

    fn checkpoint(&self, run_id: u64, ctx: &RecoveredContext) {
        let mut c = self.lock();
        if c.owns(run_id) {
            c.context = ctx.clone();
        }
    }

    fn fail(&self, run_id: u64, err: PipelineError, ctx: &RecoveredContext) {
        let mut c = self.lock();
        if !c.owns(run_id) {
            return;
        }
        let failed_step = err.failed_step(ctx);
        let retryable = err.is_retryable();
        log::error!(
            "pipeline: {} step failed (retryable: {retryable}): {err}",
            failed_step.label()
        );
        c.run = None;
        c.phase = Phase::Working;
        c.listening = None;
        self.set_state(
            &mut c,
            PipelineState::Error {
                message: err.to_string(),
                failed_step,
                retryable,
                recovered: ctx.clone(),
            },
        );
    }

    /// End the run after its final state has lingered.
    fn finish_run(&self, run_id: u64) {
        let mut c = self.lock();
        if !c.owns(run_id) {
            return;
        }
        c.run = None;
        c.placeholder = None;
        c.phase = Phase::Working;
        self.set_state(&mut c, PipelineState::Idle);
    }

    // -----------------------------------------------------------------------
    // Run driver
    // -----------------------------------------------------------------------

    async fn drive(
        self,
        run_id: u64,
        token: CancellationToken,
        mut ctx: RecoveredContext,
        step: Step,
    ) {
        let flow = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            flow = self.run_steps(run_id, &token, &mut ctx, step) => flow,
        };

        let linger = match flow {
            Ok(Flow::Completed) => self.inner.config.pipeline.complete_linger(),
            Ok(Flow::Ended) => self.inner.config.pipeline.interactive_ending_linger(),
            Ok(Flow::Parked) | Ok(Flow::Stale) => return,
            Err(err) => {
                self.fail(run_id, err, &ctx);
                return;
            }
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(linger) => self.finish_run(run_id),
        }
    }

    async fn run_steps(
        &self,
        run_id: u64,
        token: &CancellationToken,
        ctx: &mut RecoveredContext,
        first: Step,
    ) -> Result<Flow, PipelineError> {
        let mut step = first;
        loop {
            self.checkpoint(run_id, ctx);
            step = match step {
                Step::Transcribe => {
                    self.transcribe(run_id, ctx).await?;
                    Step::Record
                }
                Step::Record => {
                    self.record_question(run_id, ctx).await;
                    Step::Answer
                }
                Step::Answer => {
                    self.think(run_id, ctx).await?;
                    Step::Synthesize
                }
                Step::Synthesize => {
                    self.synthesize(run_id, ctx).await?;
                    Step::Play
                }
                Step::Play => match self.play(run_id, ctx).await? {
                    Played::Restart => Step::Play,
                    Played::Parked => return Ok(Flow::Parked),
                    Played::Stale => return Ok(Flow::Stale),
                    Played::Finished { follow_up: None } => {
                        self.emit(run_id, PipelineState::Complete(CompletedRun::from(&*ctx)));
                        log::info!("pipeline: run {run_id} complete");
                        return Ok(Flow::Completed);
                    }
                    Played::Finished {
                        follow_up: Some(conversation_id),
                    } => match self.follow_up(run_id, token, conversation_id, ctx).await {
                        FollowUp::Question(question) => {
                            *ctx = RecoveredContext {
                                question: Some(question),
                                conversation_id: Some(conversation_id),
                                prior_answer_id: ctx.answer_id.clone(),
                                ..RecoveredContext::default()
                            };
                            Step::Record
                        }
                        FollowUp::Ended => {
                            self.emit(
                                run_id,
                                PipelineState::InteractiveEnding { conversation_id },
                            );
                            return Ok(Flow::Ended);
                        }
                    },
                },
            };
        }
    }

    // ---- Transcribe --------------------------------------------------------

    async fn transcribe(
        &self,
        run_id: u64,
        ctx: &mut RecoveredContext,
    ) -> Result<(), PipelineError> {
        self.emit(run_id, PipelineState::Transcribing);
        let recording = ctx.recording.clone().ok_or(PipelineError::NothingHeard)?;
        log::info!("pipeline: transcribing {}", recording.display());

        let text = self
            .inner
            .deps
            .transcriber
            .transcribe(&recording)
            .await
            .map_err(PipelineError::Transcription)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::NothingHeard);
        }
        ctx.question = Some(text.to_string());
        Ok(())
    }

    // ---- Record ------------------------------------------------------------

    /// Publish the question and write the placeholder exchange. Storage
    /// failures are logged; the answer is still produced.
    async fn record_question(&self, run_id: u64, ctx: &mut RecoveredContext) {
        let question = ctx.question().to_string();
        self.emit(
            run_id,
            PipelineState::Transcribed {
                question: question.clone(),
            },
        );
        if ctx.exchange_id.is_some() {
            return;
        }

        let store = &self.inner.deps.store;
        let conversation_id = match ctx.conversation_id {
            Some(id) => id,
            None => match store.create_conversation().await {
                Ok(id) => {
                    ctx.created_conversation = true;
                    id
                }
                Err(e) => {
                    log::warn!("pipeline: could not create conversation: {e}");
                    return;
                }
            },
        };
        ctx.conversation_id = Some(conversation_id);

        let placeholder = NewExchange {
            conversation_id,
            question,
            model: self.inner.deps.generator.model().to_string(),
        };
        match store.create_exchange(placeholder).await {
            Ok(exchange_id) => {
                ctx.exchange_id = Some(exchange_id);
                let placeholder = Placeholder {
                    exchange_id,
                    conversation_id,
                    created_conversation: ctx.created_conversation,
                    finalized: false,
                };
                let mut c = self.lock();
                if c.owns(run_id) {
                    c.placeholder = Some(placeholder);
                } else {
                    c.stale.push(placeholder);
                }
            }
            Err(e) => log::warn!("pipeline: could not record exchange: {e}"),
        }
    }

    // ---- Answer ------------------------------------------------------------

    async fn think(&self, run_id: u64, ctx: &mut RecoveredContext) -> Result<(), PipelineError> {
        let generator = &self.inner.deps.generator;
        let question = ctx.question().to_string();

        let history = match ctx.conversation_id {
            Some(conversation) if generator.uses_history() => self
                .inner
                .deps
                .store
                .load_history(conversation)
                .await
                .unwrap_or_else(|e| {
                    log::warn!("pipeline: history unavailable: {e}");
                    Vec::new()
                }),
            _ => Vec::new(),
        };
        let request = AnswerRequest {
            question: question.clone(),
            history,
            previous_answer_id: ctx.prior_answer_id.clone(),
        };

        let effort_label = generator.effort_label().map(str::to_string);
        let thinking = |elapsed_seconds| PipelineState::Thinking {
            question: question.clone(),
            effort_label: effort_label.clone(),
            elapsed_seconds,
            status_message: THINKING_STATUS.to_string(),
        };
        self.emit(run_id, thinking(0));
        log::info!("pipeline: asking {}", generator.model());

        let started = Instant::now();
        let tick = self
            .inner
            .config
            .pipeline
            .thinking_tick()
            .max(MIN_THINKING_TICK);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
        let mut elapsed = 0;
        let mut call = generator.generate(&request);

        let answer = loop {
            tokio::select! {
                result = &mut call => break result,
                _ = ticker.tick() => {
                    elapsed += 1;
                    self.emit(run_id, thinking(elapsed));
                }
            }
        }
        .map_err(PipelineError::Model)?;

        if answer.text.trim().is_empty() {
            return Err(PipelineError::Model(ApiError::EmptyResponse));
        }
        ctx.elapsed_seconds = started.elapsed().as_secs();
        log::info!(
            "pipeline: answer received ({} chars, {}s)",
            answer.text.chars().count(),
            ctx.elapsed_seconds
        );
        ctx.model = Some(generator.model().to_string());
        ctx.effort = effort_label;
        ctx.answer = Some(answer.text);
        ctx.answer_id = Some(answer.id);

        self.emit(
            run_id,
            PipelineState::ThinkingComplete {
                question,
                answer: ctx.answer().to_string(),
                answer_id: ctx.answer_id().to_string(),
            },
        );
        Ok(())
    }

    // ---- Synthesize --------------------------------------------------------

    async fn synthesize(
        &self,
        run_id: u64,
        ctx: &mut RecoveredContext,
    ) -> Result<(), PipelineError> {
        let synthesis = &self.inner.deps.synthesis;
        synthesis.reset();

        let question = ctx.question().to_string();
        let answer = ctx.answer().to_string();
        let generating = |p: &SynthesisProgress| PipelineState::GeneratingAudio {
            question: question.clone(),
            answer: answer.clone(),
            completed: p.completed_chunks,
            total: p.total_chunks,
            status_message: p.status_message.clone(),
        };
        self.emit(
            run_id,
            generating(&SynthesisProgress {
                status_message: PREPARING_AUDIO_STATUS.to_string(),
                ..SynthesisProgress::default()
            }),
        );

        let session = match ctx.exchange_id {
            Some(id) => format!("exchange-{id}"),
            None => format!("run-{}-{run_id}", crate::store::unix_now()),
        };
        let session_dir = self.inner.paths.session_dir(&session);

        let mut progress = synthesis.subscribe();
        let job = synthesis.synthesize(&answer, &session_dir, &self.inner.style);
        tokio::pin!(job);
        let segments = loop {
            tokio::select! {
                result = &mut job => break result,
                Ok(()) = progress.changed() => {
                    let p = progress.borrow_and_update().clone();
                    self.emit(run_id, generating(&p));
                }
            }
        }
        .map_err(PipelineError::Synthesis)?;

        ctx.segments = segments;
        self.finalize_exchange(ctx).await;
        Ok(())
    }

    async fn finalize_exchange(&self, ctx: &RecoveredContext) {
        let Some(exchange_id) = ctx.exchange_id else {
            return;
        };
        let result = ExchangeResult {
            answer: ctx.answer().to_string(),
            answer_id: ctx.answer_id().to_string(),
            segments: ctx.segments.clone(),
            model: ctx.model.clone().unwrap_or_default(),
            effort: ctx.effort.clone(),
            elapsed_seconds: ctx.elapsed_seconds,
        };
        match self
            .inner
            .deps
            .store
            .finalize_exchange(exchange_id, result)
            .await
        {
            Ok(()) => {
                let mut c = self.lock();
                if let Some(p) = c
                    .placeholder
                    .as_mut()
                    .filter(|p| p.exchange_id == exchange_id)
                {
                    p.finalized = true;
                }
            }
            Err(e) => log::warn!("pipeline: could not finalize exchange {exchange_id}: {e}"),
        }
    }

    // ---- Play --------------------------------------------------------------

    /// Park the result when superseded; otherwise play it and decide
    /// whether the follow-up loop runs.
    fn enter_playback(&self, run_id: u64, ctx: &RecoveredContext) -> Option<Played> {
        let mut c = self.lock();
        if !c.owns(run_id) {
            return Some(Played::Stale);
        }
        if c.gate.superseded {
            log::info!("pipeline: replay in progress, holding the answer");
            c.gate.pending = Some(ctx.clone());
            c.phase = Phase::Parked;
            return Some(Played::Parked);
        }
        if c.muted {
            log::info!("pipeline: muted, skipping playback");
            return Some(Played::Finished { follow_up: None });
        }
        c.phase = Phase::Playing;
        c.stop_requested = false;
        None
    }

    async fn play(&self, run_id: u64, ctx: &RecoveredContext) -> Result<Played, PipelineError> {
        if let Some(played) = self.enter_playback(run_id, ctx) {
            return Ok(played);
        }

        let total = ctx.segments.len();
        let playing = |s: &PlaybackSnapshot| PipelineState::Playing {
            question: ctx.question().to_string(),
            answer: ctx.answer().to_string(),
            answer_id: ctx.answer_id().to_string(),
            conversation_id: ctx.conversation_id,
            current_segment: s.current_segment_index,
            total_segments: total,
            is_paused: s.is_paused,
        };
        self.emit(run_id, playing(&PlaybackSnapshot::default()));
        log::info!("pipeline: playing {total} segment(s)");

        let focus = FocusGuard::acquire(Arc::clone(&self.inner.deps.focus));
        let result = self
            .play_segments(ctx.segments.clone(), |s| {
                self.emit(run_id, playing(s));
            })
            .await;
        drop(focus);

        let stopped = {
            let mut c = self.lock();
            if !c.owns(run_id) {
                return Ok(Played::Stale);
            }
            c.phase = Phase::Working;
            c.paused_by_focus_loss = false;
            let cut = std::mem::take(&mut c.cut_by_replay);
            if c.gate.superseded {
                log::info!("pipeline: playback interrupted by replay, holding the answer");
                c.gate.pending = Some(ctx.clone());
                c.phase = Phase::Parked;
                return Ok(Played::Parked);
            }
            if cut {
                log::info!("pipeline: replay already over, playing the answer again");
                return Ok(Played::Restart);
            }
            std::mem::take(&mut c.stop_requested) || c.muted
        };
        result.map_err(PipelineError::Playback)?;

        let follow_up = if stopped {
            None
        } else {
            self.follow_up_conversation(ctx)
        };
        Ok(Played::Finished { follow_up })
    }

    /// Play `segments`, reporting playback snapshots while they play.
    async fn play_segments(
        &self,
        segments: Vec<PathBuf>,
        on_snapshot: impl Fn(&PlaybackSnapshot),
    ) -> Result<(), PlaybackError> {
        let playback = &self.inner.deps.playback;
        let mut snapshots = playback.subscribe();
        snapshots.borrow_and_update();

        let play = playback.play(segments);
        tokio::pin!(play);
        loop {
            tokio::select! {
                result = &mut play => return result,
                Ok(()) = snapshots.changed() => {
                    let snapshot = snapshots.borrow_and_update().clone();
                    if snapshot.is_playing {
                        on_snapshot(&snapshot);
                    }
                }
            }
        }
    }

    fn follow_up_conversation(&self, ctx: &RecoveredContext) -> Option<ConversationId> {
        let enabled = self.inner.config.follow_up.enabled
            && self.inner.deps.generator.supports_follow_up()
            && !ctx.answer_id().is_empty();
        if enabled {
            ctx.conversation_id
        } else {
            None
        }
    }

    // ---- Follow-up ---------------------------------------------------------

    async fn follow_up(
        &self,
        run_id: u64,
        token: &CancellationToken,
        conversation_id: ConversationId,
        ctx: &RecoveredContext,
    ) -> FollowUp {
        let listen = token.child_token();
        {
            let mut c = self.lock();
            if !c.owns(run_id) {
                return FollowUp::Ended;
            }
            c.listening = Some(listen.clone());
            c.phase = Phase::Listening;
        }

        let prior_answer_id = ctx.answer_id().to_string();
        let listening = |prompt_playing, listening, speech_detected| {
            PipelineState::ListeningForFollowUp {
                conversation_id,
                prior_answer_id: prior_answer_id.clone(),
                prompt_playing,
                listening,
                speech_detected,
            }
        };
        self.emit(run_id, listening(true, false, false));

        let reply = tokio::select! {
            _ = listen.cancelled() => None,
            reply = self.listen_for_question(run_id, &listening) => reply,
        };

        {
            let mut c = self.lock();
            if c.owns(run_id) {
                c.listening = None;
                c.phase = Phase::Working;
            }
        }

        let min_chars = self.inner.config.follow_up.min_question_chars;
        match reply {
            Some(text) if !is_dismissal(&text, min_chars) => {
                log::info!("pipeline: follow-up question in conversation {conversation_id}");
                FollowUp::Question(text)
            }
            Some(text) => {
                log::info!("pipeline: follow-up dismissed ({text:?})");
                FollowUp::Ended
            }
            None => FollowUp::Ended,
        }
    }

    /// Prompt, capture and transcribe one follow-up reply. `None` when
    /// nothing usable was heard.
    async fn listen_for_question(
        &self,
        run_id: u64,
        listening: &impl Fn(bool, bool, bool) -> PipelineState,
    ) -> Option<String> {
        let deps = &self.inner.deps;
        let config = &self.inner.config.follow_up;

        match ensure_prompt(
            &deps.synthesis,
            &self.inner.paths.prompt_cache_dir,
            &self.inner.style,
            &config.prompt,
        )
        .await
        {
            Ok(prompt) => {
                let _focus = FocusGuard::acquire(Arc::clone(&deps.focus));
                if let Err(e) = deps.playback.play(vec![prompt]).await {
                    log::warn!("pipeline: follow-up prompt did not play: {e}");
                }
            }
            Err(e) => log::warn!("pipeline: follow-up prompt unavailable ({e}), listening anyway"),
        }
        tokio::time::sleep(Duration::from_millis(config.prompt_pause_ms)).await;
        self.emit(run_id, listening(false, true, false));

        let limits = CaptureLimits {
            silence_timeout_ms: config.silence_timeout_ms,
            no_speech_timeout_ms: config.no_speech_timeout_ms,
        };
        let (events_tx, mut events) = mpsc::channel(8);
        let guard = CaptureGuard::new(Arc::clone(&deps.capture));
        let mut capture = deps.capture.capture_until_silence(limits, events_tx);
        let outcome = loop {
            tokio::select! {
                outcome = &mut capture => break outcome,
                Some(CaptureEvent::SpeechDetected) = events.recv() => {
                    self.emit(run_id, listening(false, true, true));
                }
            }
        };
        drop(capture);
        drop(guard);

        let recording = match outcome {
            Ok(CaptureOutcome::Speech(path)) | Ok(CaptureOutcome::MaxDuration(path)) => path,
            Ok(CaptureOutcome::NoSpeech) => {
                log::info!("pipeline: no follow-up speech");
                return None;
            }
            Err(e) => {
                log::warn!("pipeline: follow-up capture failed: {e}");
                return None;
            }
        };

        self.emit(run_id, PipelineState::Transcribing);
        match deps.transcriber.transcribe(&recording).await {
            Ok(text) => Some(text.trim().to_string()),
            Err(e) => {
                log::warn!("pipeline: follow-up transcription failed: {e}");
                None
            }
        }
    }
}

/// Ends supersession when a replay finishes, fails or is dropped.
struct ReplayGuard<'a> {
    orchestrator: &'a PipelineOrchestrator,
    replay_id: u64,
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.end_replay(self.replay_id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
