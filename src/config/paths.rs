//! Cross-platform application paths using the `dirs` crate.
//!
//! Layout:
//!
//! Config dir (settings):
//!   Windows: %APPDATA%\voice-answer\
//!   macOS:   ~/Library/Application Support/voice-answer/
//!   Linux:   ~/.config/voice-answer/
//!
//! Data dir (history, synthesized audio, cached prompts):
//!   Windows: %LOCALAPPDATA%\voice-answer\
//!   macOS:   ~/Library/Application Support/voice-answer/
//!   Linux:   ~/.local/share/voice-answer/

use std::path::{Path, PathBuf};

/// Holds all resolved application directory/file paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory for `settings.toml`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
    /// Root of the local data directory.
    pub data_dir: PathBuf,
    /// Full path to `history.json`.
    pub history_file: PathBuf,
    /// Parent of the per-run session directories holding answer segments.
    pub audio_dir: PathBuf,
    /// Cache directory for the synthesized follow-up prompt.
    pub prompt_cache_dir: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "voice-answer";

    /// Resolves all paths using the `dirs` crate.
    ///
    /// Falls back to the current directory if the platform cannot provide a
    /// standard path.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        Self::with_roots(config_dir, data_dir)
    }

    /// Build the layout under explicit roots (tests, portable installs).
    pub fn with_roots(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            settings_file: config_dir.join("settings.toml"),
            history_file: data_dir.join("history.json"),
            audio_dir: data_dir.join("audio"),
            prompt_cache_dir: data_dir.join("prompts"),
            config_dir,
            data_dir,
        }
    }

    /// Directory for one pipeline run's synthesized segments.
    pub fn session_dir(&self, session: &str) -> PathBuf {
        self.audio_dir.join(session)
    }

    /// Create every directory the application writes to.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            &self.config_dir,
            &self.data_dir,
            &self.audio_dir,
            &self.prompt_cache_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// `true` when `path` lives under the managed audio directory.
    pub fn owns_audio(&self, path: &Path) -> bool {
        path.starts_with(&self.audio_dir)
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
