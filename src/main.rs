//! Command-line entry point for voice-answer.
//!
//! # Startup sequence
//!
//! 1. Parse arguments and initialise logging.
//! 2. Load [`AppConfig`] from disk (returns default on first run).
//! 3. Create [`tokio`] runtime (multi-thread, 2 workers).
//! 4. Open the JSON history file.
//! 5. Build providers, the synthesis engine and the rodio playback engine.
//! 6. Run the subcommand; `ask` and `text` follow the pipeline state until
//!    the run ends.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use voice_answer::config::{AppConfig, AppPaths};
use voice_answer::pipeline::{
    NullCapture, PipelineDeps, PipelineOrchestrator, PipelineState, UnmanagedFocus,
};
use voice_answer::playback::{PlaybackEngine, RodioOutput};
use voice_answer::providers::{generator_from_config, OpenAiSpeech, OpenAiTranscriber};
use voice_answer::store::{ConversationId, ExchangeId, ExchangeStore, JsonFileStore};
use voice_answer::synthesis::{SynthesisEngine, SynthesisSettings};

/// Ask a question out loud and hear the answer
#[derive(Parser)]
#[command(name = "voice-answer", version, about)]
struct Cli {
    /// Settings file to use instead of the platform default
    #[arg(long, env = "VOICE_ANSWER_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Answer and save without playing audio
    #[arg(long)]
    muted: bool,

    /// Playback speed, 0.5 to 2.0
    #[arg(long)]
    speed: Option<f32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask the question spoken in a recording
    Ask {
        recording: PathBuf,
        /// Continue an earlier conversation
        #[arg(short, long)]
        conversation: Option<u64>,
    },
    /// Ask a typed question
    Text {
        question: String,
        /// Continue an earlier conversation
        #[arg(short, long)]
        conversation: Option<u64>,
    },
    /// List conversations, or the exchanges of one conversation
    History { conversation: Option<u64> },
    /// Play a stored answer again
    Replay { exchange: u64 },
    /// Print resolved paths and settings
    Config,
}

enum Question {
    Recording(PathBuf),
    Text(String),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let paths = AppPaths::new();
    let settings_file = cli
        .config
        .clone()
        .unwrap_or_else(|| paths.settings_file.clone());

    let mut config = AppConfig::load_from(&settings_file).unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        AppConfig::default()
    });
    if cli.muted {
        config.playback.muted = true;
    }
    if let Some(speed) = cli.speed {
        config.playback.speed = speed;
    }

    if let Command::Config = cli.command {
        print_config(&config, &paths, &settings_file)?;
        return Ok(ExitCode::SUCCESS);
    }

    paths
        .ensure_dirs()
        .context("failed to create data directories")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(async move {
        let store: Arc<dyn ExchangeStore> = Arc::new(
            JsonFileStore::open(&paths.history_file)
                .await
                .with_context(|| format!("failed to open {}", paths.history_file.display()))?,
        );

        match cli.command {
            Command::Ask {
                recording,
                conversation,
            } => {
                let orchestrator = build_orchestrator(config, paths, Arc::clone(&store));
                ask(&orchestrator, store.as_ref(), Question::Recording(recording), conversation)
                    .await
            }
            Command::Text {
                question,
                conversation,
            } => {
                let orchestrator = build_orchestrator(config, paths, Arc::clone(&store));
                ask(&orchestrator, store.as_ref(), Question::Text(question), conversation).await
            }
            Command::History { conversation } => history(store.as_ref(), conversation).await,
            Command::Replay { exchange } => {
                let orchestrator = build_orchestrator(config, paths, Arc::clone(&store));
                replay(&orchestrator, store.as_ref(), ExchangeId(exchange)).await
            }
            Command::Config => Ok(ExitCode::SUCCESS),
        }
    })
}

fn build_orchestrator(
    config: AppConfig,
    paths: AppPaths,
    store: Arc<dyn ExchangeStore>,
) -> PipelineOrchestrator {
    if config.follow_up.enabled {
        log::warn!(
            "follow-up listening needs a capture device; the conversation ends after the prompt"
        );
    }
    let synthesis = SynthesisEngine::new(
        Arc::new(OpenAiSpeech::from_config(&config.provider)),
        SynthesisSettings::from_config(&config.speech),
    );
    let deps = PipelineDeps {
        transcriber: Arc::new(OpenAiTranscriber::from_config(&config.provider)),
        generator: generator_from_config(&config.provider, &config.answer),
        synthesis: Arc::new(synthesis),
        playback: Arc::new(PlaybackEngine::new(
            Arc::new(RodioOutput::from_config(&config.playback)),
            config.playback.speed,
        )),
        store,
        capture: Arc::new(NullCapture),
        focus: Arc::new(UnmanagedFocus),
    };
    PipelineOrchestrator::new(deps, config, paths)
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn ask(
    orchestrator: &PipelineOrchestrator,
    store: &dyn ExchangeStore,
    question: Question,
    conversation: Option<u64>,
) -> Result<ExitCode> {
    let conversation_id = conversation.map(ConversationId);
    let prior_answer_id = match conversation_id {
        Some(id) => last_answer_id(store, id).await?,
        None => None,
    };

    let mut states = orchestrator.subscribe();
    match question {
        Question::Recording(path) => {
            if !path.exists() {
                bail!("recording {} does not exist", path.display());
            }
            orchestrator
                .start(path, conversation_id, prior_answer_id)
                .await
        }
        Question::Text(text) => {
            orchestrator
                .start_from_text(text, conversation_id, prior_answer_id)
                .await
        }
    }

    let mut label = "";
    let mut shown_question = String::new();
    let mut shown_answer = String::new();
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    return Ok(ExitCode::FAILURE);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted; cancelling");
                orchestrator.cancel().await;
                return Ok(ExitCode::from(130));
            }
        }
        let state = states.borrow_and_update().clone();
        if state.label() != label {
            label = state.label();
            log::info!("{label}");
        }

        if let Some(question) = question_of(&state) {
            if question != shown_question {
                println!("> {question}");
                shown_question = question.to_string();
            }
        }
        if let Some(answer) = answer_of(&state) {
            if answer != shown_answer {
                println!("{answer}\n");
                shown_answer = answer.to_string();
            }
        }

        match state {
            PipelineState::Complete(run) => {
                if let Some(id) = run.conversation_id {
                    println!("(conversation {id}, {}s)", run.elapsed_seconds);
                }
                return Ok(ExitCode::SUCCESS);
            }
            PipelineState::InteractiveEnding { conversation_id } => {
                println!("(conversation {conversation_id} ended)");
                return Ok(ExitCode::SUCCESS);
            }
            PipelineState::Error {
                message,
                failed_step,
                retryable,
                ..
            } => {
                eprintln!("error during {}: {message}", failed_step.label());
                if retryable {
                    eprintln!("the failure may be temporary; run the command again");
                }
                return Ok(ExitCode::FAILURE);
            }
            _ => {}
        }
    }
}

fn question_of(state: &PipelineState) -> Option<&str> {
    match state {
        PipelineState::Transcribed { question }
        | PipelineState::Thinking { question, .. }
        | PipelineState::ThinkingComplete { question, .. }
        | PipelineState::GeneratingAudio { question, .. }
        | PipelineState::Playing { question, .. } => Some(question),
        PipelineState::Complete(run) => Some(&run.question),
        _ => None,
    }
}

fn answer_of(state: &PipelineState) -> Option<&str> {
    match state {
        PipelineState::ThinkingComplete { answer, .. }
        | PipelineState::GeneratingAudio { answer, .. }
        | PipelineState::Playing { answer, .. } => Some(answer),
        PipelineState::Complete(run) => Some(&run.answer),
        _ => None,
    }
}

/// Answer id the next question in `conversation` follows up on.
async fn last_answer_id(
    store: &dyn ExchangeStore,
    conversation: ConversationId,
) -> Result<Option<String>> {
    let exchanges = store.list_exchanges(conversation).await?;
    if exchanges.is_empty() {
        bail!("conversation {conversation} does not exist");
    }
    Ok(exchanges
        .iter()
        .rev()
        .find(|e| e.is_finalized())
        .and_then(|e| e.answer_id.clone()))
}

async fn history(store: &dyn ExchangeStore, conversation: Option<u64>) -> Result<ExitCode> {
    let Some(conversation) = conversation.map(ConversationId) else {
        let conversations = store.list_conversations().await?;
        if conversations.is_empty() {
            println!("No conversations yet.");
        }
        for c in conversations {
            println!(
                "#{:<4} {:>3} exchange(s)  {}",
                c.id,
                c.exchange_count,
                c.title.as_deref().unwrap_or("(untitled)")
            );
        }
        return Ok(ExitCode::SUCCESS);
    };

    let exchanges = store.list_exchanges(conversation).await?;
    if exchanges.is_empty() {
        bail!("conversation {conversation} does not exist");
    }
    for e in exchanges {
        println!("[{}] > {}", e.id, e.question);
        if e.is_finalized() {
            println!("      {}", e.answer);
        } else {
            println!("      (unanswered)");
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn replay(
    orchestrator: &PipelineOrchestrator,
    store: &dyn ExchangeStore,
    exchange: ExchangeId,
) -> Result<ExitCode> {
    let record = store
        .get_exchange(exchange)
        .await?
        .with_context(|| format!("exchange {exchange} does not exist"))?;
    if !record.segments.iter().any(|p| p.exists()) {
        bail!("exchange {exchange} has no saved audio");
    }

    println!("> {}", record.question);
    tokio::select! {
        result = orchestrator.replay(record.segments, record.question, record.answer) => {
            result.context("replay failed")?;
        }
        _ = tokio::signal::ctrl_c() => log::info!("Replay stopped"),
    }
    Ok(ExitCode::SUCCESS)
}

fn print_config(config: &AppConfig, paths: &AppPaths, settings_file: &Path) -> Result<()> {
    let mut shown = config.clone();
    if shown.provider.api_key.is_some() {
        shown.provider.api_key = Some("********".into());
    }
    println!("settings file : {}", settings_file.display());
    println!("history file  : {}", paths.history_file.display());
    println!("audio dir     : {}", paths.audio_dir.display());
    println!("prompt cache  : {}", paths.prompt_cache_dir.display());
    let key = if config.provider.resolved_api_key().is_some() {
        "configured"
    } else {
        "missing"
    };
    println!("api key       : {key}");
    println!();
    print!("{}", toml::to_string_pretty(&shown).context("failed to render settings")?);
    Ok(())
}
