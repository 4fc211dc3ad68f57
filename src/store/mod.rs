//! Conversation history: exchanges written in two phases.
//!
//! An exchange is created as a placeholder as soon as the question is known
//! ([`NewExchange`]) and finalized once the answer and its audio exist
//! ([`ExchangeResult`]). A cancelled run deletes its placeholder; a failed
//! run keeps it so a retry can finalize the same record.
//!
//! * [`MemoryStore`]: process-local, used by tests.
//! * [`JsonFileStore`]: the same model persisted as one JSON file.

pub mod json;
pub mod memory;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::providers::HistoryTurn;

pub use json::JsonFileStore;
pub use memory::{History, MemoryStore};

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(pub u64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Placeholder written when the question is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExchange {
    pub conversation_id: ConversationId,
    pub question: String,
    pub model: String,
}

/// Everything known once the answer has been synthesized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeResult {
    pub answer: String,
    pub answer_id: String,
    pub segments: Vec<PathBuf>,
    pub model: String,
    pub effort: Option<String>,
    /// Wall-clock seconds spent waiting for the model.
    pub elapsed_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub id: ExchangeId,
    pub conversation_id: ConversationId,
    pub question: String,
    /// Empty until finalized.
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub answer_id: Option<String>,
    #[serde(default)]
    pub segments: Vec<PathBuf>,
    pub model: String,
    #[serde(default)]
    pub effort: Option<String>,
    #[serde(default)]
    pub elapsed_seconds: u64,
    /// Unix seconds.
    pub created_at: u64,
}

impl ExchangeRecord {
    pub fn is_finalized(&self) -> bool {
        !self.answer.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub id: ConversationId,
    /// First question asked, if any.
    pub title: Option<String>,
    pub exchange_count: usize,
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// StoreError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation {0} does not exist")]
    UnknownConversation(ConversationId),

    #[error("exchange {0} does not exist")]
    UnknownExchange(ExchangeId),

    #[error("history file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("history file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// ExchangeStore trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ExchangeStore: Send + Sync {
    async fn create_conversation(&self) -> Result<ConversationId, StoreError>;

    async fn create_exchange(&self, exchange: NewExchange) -> Result<ExchangeId, StoreError>;

    async fn finalize_exchange(
        &self,
        id: ExchangeId,
        result: ExchangeResult,
    ) -> Result<(), StoreError>;

    /// Removing an exchange that does not exist is not an error.
    async fn delete_exchange(&self, id: ExchangeId) -> Result<(), StoreError>;

    async fn count_exchanges(&self, conversation: ConversationId) -> Result<usize, StoreError>;

    /// Removes the conversation and every exchange in it.
    async fn delete_conversation(&self, conversation: ConversationId) -> Result<(), StoreError>;

    /// Finalized turns in creation order; placeholders are skipped.
    async fn load_history(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<HistoryTurn>, StoreError>;

    /// Newest first.
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError>;

    async fn get_exchange(&self, id: ExchangeId) -> Result<Option<ExchangeRecord>, StoreError>;

    async fn list_exchanges(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<ExchangeRecord>, StoreError>;
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
