use std::sync::Arc;

use tracing::{error, info, warn};

use crate::db::kv_store::KeyValueStore;
use crate::errors::AppError;
use crate::models::Conversation;

pub const CONVERSATIONS_KEY: &str = "ollama-conversations";
/// Where an unreadable conversation list is set aside before starting empty.
pub const UNREADABLE_CONVERSATIONS_KEY: &str = "ollama-conversations.corrupt";

/// The conversation collection, held in memory and written through to the
/// key/value store as one JSON list.
///
/// Memory is authoritative. When a write fails the repository stays dirty and
/// the next write carries the full list again.
pub struct ConversationRepository {
    kv: Arc<dyn KeyValueStore>,
    conversations: Vec<Conversation>,
    dirty: bool,
}

impl ConversationRepository {
    pub async fn load(kv: Arc<dyn KeyValueStore>) -> Result<Self, AppError> {
        let conversations = match kv.get(CONVERSATIONS_KEY).await? {
            None => Vec::new(),
            Some(json) => match serde_json::from_str::<Vec<Conversation>>(&json) {
                Ok(conversations) => conversations,
                Err(e) => {
                    warn!("Stored conversations are unreadable, starting empty: {e}");
                    if let Err(e) = kv.set(UNREADABLE_CONVERSATIONS_KEY, &json).await {
                        error!("Failed to set aside unreadable conversations: {e}");
                    }
                    Vec::new()
                }
            },
        };
        info!("Loaded {} conversations", conversations.len());
        Ok(Self { kv, conversations, dirty: false })
    }

    /// All conversations in storage order.
    pub fn list(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    /// Replaces the conversation with the same id, or inserts it first.
    pub async fn upsert(&mut self, conversation: Conversation) -> Result<(), AppError> {
        match self.conversations.iter_mut().find(|c| c.id == conversation.id) {
            Some(existing) => *existing = conversation,
            None => self.conversations.insert(0, conversation),
        }
        self.flush().await
    }

    /// Removes `id`. Returns `false` without writing when it was absent.
    pub async fn delete(&mut self, id: &str) -> Result<bool, AppError> {
        let before = self.conversations.len();
        self.conversations.retain(|c| c.id != id);
        if self.conversations.len() == before {
            return Ok(false);
        }
        self.flush().await?;
        Ok(true)
    }

    /// Writes the whole collection.
    pub async fn flush(&mut self) -> Result<(), AppError> {
        let json = serde_json::to_string(&self.conversations)?;
        match self.kv.set(CONVERSATIONS_KEY, &json).await {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                error!("Failed to persist conversations: {e}");
                Err(AppError::PersistenceFailed {
                    key: CONVERSATIONS_KEY.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    /// True while the last write failed and memory is ahead of storage.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::kv_store::MemoryKvStore;

    fn stored(kv: &MemoryKvStore) -> Vec<Conversation> {
        serde_json::from_str(&kv.peek(CONVERSATIONS_KEY).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn upsert_inserts_first_and_replaces_in_place() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut repo = ConversationRepository::load(kv.clone()).await.unwrap();

        let first = Conversation::new("m");
        let second = Conversation::new("m");
        repo.upsert(first.clone()).await.unwrap();
        repo.upsert(second.clone()).await.unwrap();
        assert_eq!(repo.list()[0].id, second.id);

        let mut renamed = first.clone();
        renamed.title = "renamed".into();
        repo.upsert(renamed).await.unwrap();

        assert_eq!(repo.list().len(), 2);
        assert_eq!(repo.list()[1].title, "renamed");
        assert_eq!(stored(&kv)[1].title, "renamed");
    }

    #[tokio::test]
    async fn delete_of_missing_id_is_a_no_op() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut repo = ConversationRepository::load(kv.clone()).await.unwrap();
        assert!(!repo.delete("nope").await.unwrap());
        assert!(kv.written_values(CONVERSATIONS_KEY).is_empty());

        let conversation = Conversation::new("m");
        repo.upsert(conversation.clone()).await.unwrap();
        assert!(repo.delete(&conversation.id).await.unwrap());
        assert!(stored(&kv).is_empty());
    }

    #[tokio::test]
    async fn failed_write_keeps_memory_and_retries_on_next_write() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut repo = ConversationRepository::load(kv.clone()).await.unwrap();

        kv.set_fail_writes(true);
        let lost = Conversation::new("m");
        assert!(repo.upsert(lost.clone()).await.unwrap_err().is_persistence());
        assert!(repo.is_dirty());
        assert!(repo.get(&lost.id).is_some());

        kv.set_fail_writes(false);
        let next = Conversation::new("m");
        repo.upsert(next).await.unwrap();
        assert!(!repo.is_dirty());
        assert_eq!(stored(&kv).len(), 2);
    }

    #[tokio::test]
    async fn unreadable_storage_loads_empty_and_is_set_aside() {
        let kv = Arc::new(MemoryKvStore::new().with_entry(CONVERSATIONS_KEY, "{not json"));
        let mut repo = ConversationRepository::load(kv.clone()).await.unwrap();
        assert!(repo.list().is_empty());
        assert_eq!(kv.peek(UNREADABLE_CONVERSATIONS_KEY).as_deref(), Some("{not json"));

        repo.upsert(Conversation::new("m")).await.unwrap();
        assert_eq!(stored(&kv).len(), 1);
        assert_eq!(kv.peek(UNREADABLE_CONVERSATIONS_KEY).as_deref(), Some("{not json"));
    }
}
