//! In-memory history model and the [`MemoryStore`] built on it.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    unix_now, ConversationId, ConversationSummary, ExchangeId, ExchangeRecord, ExchangeResult,
    ExchangeStore, NewExchange, StoreError,
};
use crate::providers::HistoryTurn;

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ConversationEntry {
    id: ConversationId,
    created_at: u64,
}

/// The whole history as one serializable value.
///
/// Ids are never reused, even after deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    next_conversation: u64,
    #[serde(default)]
    next_exchange: u64,
    #[serde(default)]
    conversations: Vec<ConversationEntry>,
    #[serde(default)]
    exchanges: Vec<ExchangeRecord>,
}

impl History {
    fn has_conversation(&self, id: ConversationId) -> bool {
        self.conversations.iter().any(|c| c.id == id)
    }

    pub fn create_conversation(&mut self) -> ConversationId {
        self.next_conversation += 1;
        let id = ConversationId(self.next_conversation);
        self.conversations.push(ConversationEntry {
            id,
            created_at: unix_now(),
        });
        id
    }

    pub fn create_exchange(&mut self, exchange: NewExchange) -> Result<ExchangeId, StoreError> {
        if !self.has_conversation(exchange.conversation_id) {
            return Err(StoreError::UnknownConversation(exchange.conversation_id));
        }
        self.next_exchange += 1;
        let id = ExchangeId(self.next_exchange);
        self.exchanges.push(ExchangeRecord {
            id,
            conversation_id: exchange.conversation_id,
            question: exchange.question,
            answer: String::new(),
            answer_id: None,
            segments: Vec::new(),
            model: exchange.model,
            effort: None,
            elapsed_seconds: 0,
            created_at: unix_now(),
        });
        Ok(id)
    }

    pub fn finalize_exchange(
        &mut self,
        id: ExchangeId,
        result: ExchangeResult,
    ) -> Result<(), StoreError> {
        let record = self
            .exchanges
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::UnknownExchange(id))?;
        record.answer = result.answer;
        record.answer_id = Some(result.answer_id).filter(|a| !a.is_empty());
        record.segments = result.segments;
        record.model = result.model;
        record.effort = result.effort;
        record.elapsed_seconds = result.elapsed_seconds;
        Ok(())
    }

    pub fn delete_exchange(&mut self, id: ExchangeId) {
        self.exchanges.retain(|e| e.id != id);
    }

    pub fn count_exchanges(&self, conversation: ConversationId) -> usize {
        self.exchanges
            .iter()
            .filter(|e| e.conversation_id == conversation)
            .count()
    }

    pub fn delete_conversation(&mut self, conversation: ConversationId) {
        self.conversations.retain(|c| c.id != conversation);
        self.exchanges.retain(|e| e.conversation_id != conversation);
    }

    pub fn load_history(&self, conversation: ConversationId) -> Vec<HistoryTurn> {
        self.exchanges
            .iter()
            .filter(|e| e.conversation_id == conversation && e.is_finalized())
            .map(|e| HistoryTurn {
                question: e.question.clone(),
                answer: e.answer.clone(),
            })
            .collect()
    }

    pub fn list_conversations(&self) -> Vec<ConversationSummary> {
        let mut out: Vec<ConversationSummary> = self
            .conversations
            .iter()
            .map(|c| {
                let title = self
                    .exchanges
                    .iter()
                    .find(|e| e.conversation_id == c.id)
                    .map(|e| e.question.clone());
                ConversationSummary {
                    id: c.id,
                    title,
                    exchange_count: self.count_exchanges(c.id),
                    created_at: c.created_at,
                }
            })
            .collect();
        out.sort_by(|a, b| b.id.cmp(&a.id));
        out
    }

    pub fn get_exchange(&self, id: ExchangeId) -> Option<ExchangeRecord> {
        self.exchanges.iter().find(|e| e.id == id).cloned()
    }

    pub fn list_exchanges(&self, conversation: ConversationId) -> Vec<ExchangeRecord> {
        self.exchanges
            .iter()
            .filter(|e| e.conversation_id == conversation)
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    history: Mutex<History>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ExchangeStore for MemoryStore {
    async fn create_conversation(&self) -> Result<ConversationId, StoreError> {
        Ok(self.lock().create_conversation())
    }

    async fn create_exchange(&self, exchange: NewExchange) -> Result<ExchangeId, StoreError> {
        self.lock().create_exchange(exchange)
    }

    async fn finalize_exchange(
        &self,
        id: ExchangeId,
        result: ExchangeResult,
    ) -> Result<(), StoreError> {
        self.lock().finalize_exchange(id, result)
    }

    async fn delete_exchange(&self, id: ExchangeId) -> Result<(), StoreError> {
        self.lock().delete_exchange(id);
        Ok(())
    }

    async fn count_exchanges(&self, conversation: ConversationId) -> Result<usize, StoreError> {
        Ok(self.lock().count_exchanges(conversation))
    }

    async fn delete_conversation(&self, conversation: ConversationId) -> Result<(), StoreError> {
        self.lock().delete_conversation(conversation);
        Ok(())
    }

    async fn load_history(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<HistoryTurn>, StoreError> {
        Ok(self.lock().load_history(conversation))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        Ok(self.lock().list_conversations())
    }

    async fn get_exchange(&self, id: ExchangeId) -> Result<Option<ExchangeRecord>, StoreError> {
        Ok(self.lock().get_exchange(id))
    }

    async fn list_exchanges(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<ExchangeRecord>, StoreError> {
        Ok(self.lock().list_exchanges(conversation))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn new_exchange(conversation_id: ConversationId, question: &str) -> NewExchange {
        NewExchange {
            conversation_id,
            question: question.into(),
            model: "test-model".into(),
        }
    }

    fn result(answer: &str) -> ExchangeResult {
        ExchangeResult {
            answer: answer.into(),
            answer_id: format!("resp_{answer}"),
            segments: vec!["chunk_000.wav".into()],
            model: "test-model".into(),
            effort: Some("low".into()),
            elapsed_seconds: 4,
        }
    }

    #[tokio::test]
    async fn two_phase_write() {
        let store = MemoryStore::new();
        let conv = store.create_conversation().await.unwrap();
        let id = store
            .create_exchange(new_exchange(conv, "what is rust"))
            .await
            .unwrap();

        let placeholder = store.get_exchange(id).await.unwrap().unwrap();
        assert!(!placeholder.is_finalized());
        assert_eq!(placeholder.question, "what is rust");

        store.finalize_exchange(id, result("a language")).await.unwrap();
        let record = store.get_exchange(id).await.unwrap().unwrap();
        assert!(record.is_finalized());
        assert_eq!(record.answer_id.as_deref(), Some("resp_a language"));
        assert_eq!(record.elapsed_seconds, 4);
    }

    #[tokio::test]
    async fn history_skips_placeholders() {
        let store = MemoryStore::new();
        let conv = store.create_conversation().await.unwrap();
        let first = store.create_exchange(new_exchange(conv, "q1")).await.unwrap();
        store.create_exchange(new_exchange(conv, "q2")).await.unwrap();
        store.finalize_exchange(first, result("a1")).await.unwrap();

        let turns = store.load_history(conv).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].question, "q1");
        assert_eq!(store.count_exchanges(conv).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn exchange_in_unknown_conversation_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .create_exchange(new_exchange(ConversationId(42), "q"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownConversation(ConversationId(42))));
    }

    #[tokio::test]
    async fn deleting_conversation_removes_its_exchanges() {
        let store = MemoryStore::new();
        let keep = store.create_conversation().await.unwrap();
        let drop = store.create_conversation().await.unwrap();
        let kept = store.create_exchange(new_exchange(keep, "k")).await.unwrap();
        let gone = store.create_exchange(new_exchange(drop, "d")).await.unwrap();

        store.delete_conversation(drop).await.unwrap();
        assert!(store.get_exchange(gone).await.unwrap().is_none());
        assert!(store.get_exchange(kept).await.unwrap().is_some());

        let list = store.list_conversations().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title.as_deref(), Some("k"));
    }

    #[tokio::test]
    async fn ids_are_not_reused_and_listing_is_newest_first() {
        let store = MemoryStore::new();
        let a = store.create_conversation().await.unwrap();
        let x = store.create_exchange(new_exchange(a, "q")).await.unwrap();
        store.delete_exchange(x).await.unwrap();
        store.delete_exchange(x).await.unwrap();
        let y = store.create_exchange(new_exchange(a, "q")).await.unwrap();
        assert_ne!(x, y);

        let b = store.create_conversation().await.unwrap();
        let list = store.list_conversations().await.unwrap();
        assert_eq!(list.iter().map(|c| c.id).collect::<Vec<_>>(), [b, a]);
        assert_eq!(list[1].exchange_count, 1);
    }

    #[tokio::test]
    async fn finalizing_unknown_exchange_fails() {
        let store = MemoryStore::new();
        let err = store
            .finalize_exchange(ExchangeId(9), result("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownExchange(ExchangeId(9))));
    }
}
