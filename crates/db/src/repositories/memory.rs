use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use ichigo_core::domain::conversation::{ConversationId, ConversationSettings, Turn};

use super::{ConversationStore, StoreError, StoredConversation};

#[derive(Clone, Debug, Default)]
struct Entry {
    settings: Option<ConversationSettings>,
    turns: Vec<Turn>,
}

/// Conversation store kept in process memory. Used by tests and by dry runs.
#[derive(Default)]
pub struct InMemoryConversationStore {
    entries: RwLock<BTreeMap<ConversationId, Entry>>,
    unavailable: AtomicBool,
}

impl InMemoryConversationStore {
    /// Makes every later call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Stored turns of `id`, regardless of whether metadata exists.
    pub async fn turns(&self, id: ConversationId) -> Vec<Turn> {
        let entries = self.entries.read().await;
        entries.get(&id).map(|entry| entry.turns.clone()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<StoredConversation>, StoreError> {
        self.check()?;
        let entries = self.entries.read().await;
        Ok(entries.get(&id).and_then(|entry| {
            entry.settings.clone().map(|settings| StoredConversation {
                id,
                settings,
                turns: entry.turns.clone(),
            })
        }))
    }

    async fn update_metadata(
        &self,
        id: ConversationId,
        settings: &ConversationSettings,
    ) -> Result<(), StoreError> {
        self.check()?;
        let mut entries = self.entries.write().await;
        entries.entry(id).or_default().settings = Some(settings.clone());
        Ok(())
    }

    async fn append_turn(&self, id: ConversationId, turn: &Turn) -> Result<(), StoreError> {
        self.check()?;
        let mut entries = self.entries.write().await;
        entries.entry(id).or_default().turns.push(turn.clone());
        Ok(())
    }

    async fn trim_to_most_recent(
        &self,
        id: ConversationId,
        keep: usize,
    ) -> Result<u64, StoreError> {
        self.check()?;
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(&id) else {
            return Ok(0);
        };
        let overflow = entry.turns.len().saturating_sub(keep);
        entry.turns.drain(..overflow);
        Ok(overflow as u64)
    }

    async fn delete_last_turn(&self, id: ConversationId) -> Result<bool, StoreError> {
        self.check()?;
        let mut entries = self.entries.write().await;
        Ok(entries.get_mut(&id).and_then(|entry| entry.turns.pop()).is_some())
    }

    async fn clear_history(&self, id: ConversationId) -> Result<(), StoreError> {
        self.check()?;
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(&id) {
            entry.turns.clear();
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        self.check()?;
        self.entries.write().await.clear();
        Ok(())
    }

    async fn delete_conversations_not_in(
        &self,
        valid_ids: &[ConversationId],
    ) -> Result<u64, StoreError> {
        self.check()?;
        let mut entries = self.entries.write().await;
        let mut deleted = 0;
        entries.retain(|id, entry| {
            let keep = valid_ids.contains(id);
            if !keep && entry.settings.is_some() {
                deleted += 1;
            }
            keep
        });
        Ok(deleted)
    }

    async fn list_conversation_ids(&self) -> Result<Vec<ConversationId>, StoreError> {
        self.check()?;
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(_, entry)| entry.settings.is_some())
            .map(|(id, _)| *id)
            .collect())
    }
}
