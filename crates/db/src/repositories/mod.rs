use async_trait::async_trait;
use thiserror::Error;

use ichigo_core::domain::conversation::{ConversationId, ConversationSettings, Turn};

pub mod conversation;
pub mod memory;

pub use conversation::SqlConversationStore;
pub use memory::InMemoryConversationStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable copy of one conversation.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredConversation {
    pub id: ConversationId,
    pub settings: ConversationSettings,
    pub turns: Vec<Turn>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<StoredConversation>, StoreError>;

    /// Creates the conversation row if needed and overwrites its settings.
    async fn update_metadata(
        &self,
        id: ConversationId,
        settings: &ConversationSettings,
    ) -> Result<(), StoreError>;

    async fn append_turn(&self, id: ConversationId, turn: &Turn) -> Result<(), StoreError>;

    /// Keeps only the `keep` most recent turns. Returns the number deleted.
    async fn trim_to_most_recent(&self, id: ConversationId, keep: usize)
        -> Result<u64, StoreError>;

    /// Returns whether a turn was deleted.
    async fn delete_last_turn(&self, id: ConversationId) -> Result<bool, StoreError>;

    async fn clear_history(&self, id: ConversationId) -> Result<(), StoreError>;

    /// Deletes every conversation and every turn.
    async fn clear_all(&self) -> Result<(), StoreError>;

    /// Deletes conversations, and their turns, whose id is not in `valid_ids`.
    /// Returns the number of conversations deleted.
    async fn delete_conversations_not_in(
        &self,
        valid_ids: &[ConversationId],
    ) -> Result<u64, StoreError>;

    async fn list_conversation_ids(&self) -> Result<Vec<ConversationId>, StoreError>;
}
