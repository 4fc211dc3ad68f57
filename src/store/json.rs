//! [`ExchangeStore`] persisted as a single JSON file.
//!
//! The whole [`History`] is loaded on open and rewritten after every
//! mutation (write to a sibling temp file, then rename).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    ConversationId, ConversationSummary, ExchangeId, ExchangeRecord, ExchangeResult,
    ExchangeStore, History, NewExchange, StoreError,
};
use crate::providers::HistoryTurn;

pub struct JsonFileStore {
    path: PathBuf,
    history: Mutex<History>,
}

impl JsonFileStore {
    /// Open `path`, starting empty if it does not exist yet.
    ///
    /// # Errors
    ///
    /// [`StoreError::Corrupt`] when the file exists but is not valid history.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let history = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => History::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("store: no history at {}, starting empty", path.display());
                History::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            history: Mutex::new(history),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, history: &History) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(history)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Apply `f` to a copy, write the copy to disk, then adopt it. Memory
    /// only changes once the file does.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut History) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut history = self.history.lock().await;
        let mut next = history.clone();
        let out = f(&mut next)?;
        self.persist(&next).await?;
        *history = next;
        Ok(out)
    }
}

#[async_trait]
impl ExchangeStore for JsonFileStore {
    async fn create_conversation(&self) -> Result<ConversationId, StoreError> {
        self.mutate(|h| Ok(h.create_conversation())).await
    }

    async fn create_exchange(&self, exchange: NewExchange) -> Result<ExchangeId, StoreError> {
        self.mutate(|h| h.create_exchange(exchange)).await
    }

    async fn finalize_exchange(
        &self,
        id: ExchangeId,
        result: ExchangeResult,
    ) -> Result<(), StoreError> {
        self.mutate(|h| h.finalize_exchange(id, result)).await
    }

    async fn delete_exchange(&self, id: ExchangeId) -> Result<(), StoreError> {
        self.mutate(|h| {
            h.delete_exchange(id);
            Ok(())
        })
        .await
    }

    async fn count_exchanges(&self, conversation: ConversationId) -> Result<usize, StoreError> {
        Ok(self.history.lock().await.count_exchanges(conversation))
    }

    async fn delete_conversation(&self, conversation: ConversationId) -> Result<(), StoreError> {
        self.mutate(|h| {
            h.delete_conversation(conversation);
            Ok(())
        })
        .await
    }

    async fn load_history(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<HistoryTurn>, StoreError> {
        Ok(self.history.lock().await.load_history(conversation))
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        Ok(self.history.lock().await.list_conversations())
    }

    async fn get_exchange(&self, id: ExchangeId) -> Result<Option<ExchangeRecord>, StoreError> {
        Ok(self.history.lock().await.get_exchange(id))
    }

    async fn list_exchanges(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<ExchangeRecord>, StoreError> {
        Ok(self.history.lock().await.list_exchanges(conversation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn history_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join("history.json");

        let store = JsonFileStore::open(&path).await.unwrap();
        let conv = store.create_conversation().await.unwrap();
        let id = store
            .create_exchange(NewExchange {
                conversation_id: conv,
                question: "how far is the moon".into(),
                model: "m".into(),
            })
            .await
            .unwrap();
        store
            .finalize_exchange(
                id,
                ExchangeResult {
                    answer: "about 384,000 km".into(),
                    answer_id: "resp_1".into(),
                    segments: vec![dir.path().join("chunk_000.wav")],
                    model: "m".into(),
                    effort: None,
                    elapsed_seconds: 2,
                },
            )
            .await
            .unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let record = reopened.get_exchange(id).await.unwrap().unwrap();
        assert_eq!(record.answer, "about 384,000 km");
        assert_eq!(reopened.load_history(conv).await.unwrap().len(), 1);

        // Counters survive too.
        let next = reopened.create_conversation().await.unwrap();
        assert!(next > conv);
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("none.json"))
            .await
            .unwrap();
        assert!(store.list_conversations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonFileStore::open(&path).await.err().unwrap();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn failed_mutation_does_not_touch_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let store = JsonFileStore::open(&path).await.unwrap();

        let err = store
            .create_exchange(NewExchange {
                conversation_id: ConversationId(7),
                question: "q".into(),
                model: "m".into(),
            })
            .await;
        assert!(err.is_err());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn failed_write_leaves_memory_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        let store = JsonFileStore::open(&path).await.unwrap();
        let conv = store.create_conversation().await.unwrap();

        // A directory in place of the file makes the final rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        let question = || NewExchange {
            conversation_id: conv,
            question: "what is a parsec".into(),
            model: "m".into(),
        };
        assert!(store.create_exchange(question()).await.is_err());
        assert!(store.list_exchanges(conv).await.unwrap().is_empty());
        assert_eq!(store.count_exchanges(conv).await.unwrap(), 0);

        std::fs::remove_dir(&path).unwrap();
        store.create_exchange(question()).await.unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.list_exchanges(conv).await.unwrap().len(), 1);
    }
}
