//! Follow-up conversation helpers: dismissal detection and the cached
//! spoken prompt.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::providers::SpeechStyle;
use crate::synthesis::{SynthesisEngine, SynthesisError};

const PROMPT_FILE_PREFIX: &str = "follow_up_prompt_";

/// Normalized replies that end the conversation.
pub const DISMISSAL_PHRASES: &[&str] = &[
    "no",
    "no thanks",
    "no thank you",
    "nope",
    "nah",
    "i'm done",
    "im done",
    "i am done",
    "that's all",
    "thats all",
    "that is all",
    "nothing",
    "never mind",
    "nevermind",
    "stop",
    "end",
    "bye",
    "goodbye",
    "good bye",
    "no follow up",
    "no followup",
    "no follow-up",
    "no more questions",
    "no questions",
];

/// Trim, lowercase and drop `.`, `!`, `?` and `,`.
pub fn normalize(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '.' | '!' | '?' | ','))
        .collect::<String>()
        .trim()
        .to_string()
}

/// `true` for a dismissal phrase, or for any reply of at most
/// `min_question_chars` characters once normalized.
pub fn is_dismissal(text: &str, min_question_chars: usize) -> bool {
    let normalized = normalize(text);
    normalized.chars().count() <= min_question_chars
        || DISMISSAL_PHRASES.contains(&normalized.as_str())
}

// ---------------------------------------------------------------------------
// Prompt cache
// ---------------------------------------------------------------------------

/// First 16 hex digits of the SHA-256 of `parts`, each NUL-terminated.
fn content_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Cache file name for `prompt` spoken with `style`.
pub fn prompt_file_name(style: &SpeechStyle, prompt: &str) -> String {
    let voice: String = style
        .voice
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let key = content_key(&[&style.model, &style.voice, prompt]);
    format!("{PROMPT_FILE_PREFIX}{voice}_{key}.{}", style.format)
}

/// Return the cached prompt audio, synthesizing it on first use.
///
/// Prompts cached for another voice or text are deleted.
pub async fn ensure_prompt(
    synthesis: &SynthesisEngine,
    cache_dir: &Path,
    style: &SpeechStyle,
    prompt: &str,
) -> Result<PathBuf, SynthesisError> {
    let path = cache_dir.join(prompt_file_name(style, prompt));
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(path);
    }

    remove_stale_prompts(cache_dir, &path).await;
    log::info!("pipeline: synthesizing follow-up prompt");
    synthesis.synthesize_one(prompt, &path, style).await?;
    Ok(path)
}

async fn remove_stale_prompts(cache_dir: &Path, keep: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(cache_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_prompt = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(PROMPT_FILE_PREFIX));
        if is_prompt && path != keep {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                log::warn!("pipeline: could not remove {}: {e}", path.display());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
