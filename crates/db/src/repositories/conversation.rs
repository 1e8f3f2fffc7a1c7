use chrono::Utc;
use sqlx::Row;

use ichigo_core::domain::conversation::{ConversationId, ConversationSettings, Role, Turn};

use super::{ConversationStore, StoreError, StoredConversation};
use crate::DbPool;

pub struct SqlConversationStore {
    pool: DbPool,
}

impl SqlConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_turn(row: &sqlx::sqlite::SqliteRow) -> Result<Turn, StoreError> {
    let role: String = row.try_get("role").map_err(|e| StoreError::Decode(e.to_string()))?;
    let content: String =
        row.try_get("content").map_err(|e| StoreError::Decode(e.to_string()))?;
    let role = role.parse::<Role>().map_err(StoreError::Decode)?;
    Ok(Turn { role, text: content })
}

fn row_to_settings(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationSettings, StoreError> {
    let model: String = row.try_get("model").map_err(|e| StoreError::Decode(e.to_string()))?;
    let temperature: f64 =
        row.try_get("temperature").map_err(|e| StoreError::Decode(e.to_string()))?;
    let prompt: String = row.try_get("prompt").map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(ConversationSettings { model, temperature: temperature as f32, prompt })
}

#[async_trait::async_trait]
impl ConversationStore for SqlConversationStore {
    async fn load_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<StoredConversation>, StoreError> {
        let row = sqlx::query(
            "SELECT model, temperature, prompt FROM conversations WHERE conversation_id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let settings = row_to_settings(&row)?;

        let rows: Vec<sqlx::sqlite::SqliteRow> = sqlx::query(
            "SELECT role, content FROM conversation_turns
             WHERE conversation_id = ? ORDER BY id ASC",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;
        let turns = rows.iter().map(row_to_turn).collect::<Result<Vec<_>, _>>()?;

        Ok(Some(StoredConversation { id, settings, turns }))
    }

    async fn update_metadata(
        &self,
        id: ConversationId,
        settings: &ConversationSettings,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversations (conversation_id, model, temperature, prompt, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(conversation_id) DO UPDATE SET
                 model = excluded.model,
                 temperature = excluded.temperature,
                 prompt = excluded.prompt,
                 updated_at = excluded.updated_at",
        )
        .bind(id.0)
        .bind(&settings.model)
        .bind(f64::from(settings.temperature))
        .bind(&settings.prompt)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn append_turn(&self, id: ConversationId, turn: &Turn) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conversation_turns (conversation_id, role, content, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(id.0)
        .bind(turn.role.as_str())
        .bind(&turn.text)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn trim_to_most_recent(
        &self,
        id: ConversationId,
        keep: usize,
    ) -> Result<u64, StoreError> {
        let keep = i64::try_from(keep).unwrap_or(i64::MAX);
        let result = sqlx::query(
            "DELETE FROM conversation_turns
             WHERE conversation_id = ?
               AND id NOT IN (
                   SELECT id FROM conversation_turns
                   WHERE conversation_id = ?
                   ORDER BY id DESC
                   LIMIT ?
               )",
        )
        .bind(id.0)
        .bind(id.0)
        .bind(keep)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_last_turn(&self, id: ConversationId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM conversation_turns
             WHERE id = (
                 SELECT id FROM conversation_turns
                 WHERE conversation_id = ?
                 ORDER BY id DESC
                 LIMIT 1
             )",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_history(&self, id: ConversationId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM conversation_turns WHERE conversation_id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM conversation_turns").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM conversations").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_conversations_not_in(
        &self,
        valid_ids: &[ConversationId],
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let deleted = if valid_ids.is_empty() {
            sqlx::query("DELETE FROM conversation_turns").execute(&mut *tx).await?;
            sqlx::query("DELETE FROM conversations").execute(&mut *tx).await?.rows_affected()
        } else {
            let placeholders = vec!["?"; valid_ids.len()].join(", ");

            let turns_sql = format!(
                "DELETE FROM conversation_turns WHERE conversation_id NOT IN ({placeholders})"
            );
            let mut turns_query = sqlx::query(&turns_sql);
            for id in valid_ids {
                turns_query = turns_query.bind(id.0);
            }
            turns_query.execute(&mut *tx).await?;

            let conversations_sql =
                format!("DELETE FROM conversations WHERE conversation_id NOT IN ({placeholders})");
            let mut conversations_query = sqlx::query(&conversations_sql);
            for id in valid_ids {
                conversations_query = conversations_query.bind(id.0);
            }
            conversations_query.execute(&mut *tx).await?.rows_affected()
        };

        tx.commit().await?;
        Ok(deleted)
    }

    async fn list_conversation_ids(&self) -> Result<Vec<ConversationId>, StoreError> {
        let rows: Vec<sqlx::sqlite::SqliteRow> =
            sqlx::query("SELECT conversation_id FROM conversations ORDER BY conversation_id ASC")
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|row| {
                row.try_get::<i64, _>("conversation_id")
                    .map(ConversationId)
                    .map_err(|e| StoreError::Decode(e.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ichigo_core::domain::conversation::{ConversationId, ConversationSettings, Turn};

    use super::SqlConversationStore;
    use crate::repositories::ConversationStore;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlConversationStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlConversationStore::new(pool)
    }

    fn settings(model: &str) -> ConversationSettings {
        ConversationSettings {
            model: model.to_string(),
            temperature: 0.5,
            prompt: "default".to_string(),
        }
    }

    #[tokio::test]
    async fn missing_conversation_loads_as_none() {
        let store = setup().await;
        let loaded = store.load_conversation(ConversationId(1)).await.expect("load");
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn metadata_upsert_and_turns_round_trip() {
        let store = setup().await;
        let id = ConversationId(42);

        store.update_metadata(id, &settings("mini")).await.expect("insert metadata");
        store.update_metadata(id, &settings("large")).await.expect("update metadata");
        store.append_turn(id, &Turn::user("hello")).await.expect("append user");
        store.append_turn(id, &Turn::assistant("hi there")).await.expect("append assistant");

        let loaded = store.load_conversation(id).await.expect("load").expect("stored");
        assert_eq!(loaded.settings, settings("large"));
        assert_eq!(loaded.turns, vec![Turn::user("hello"), Turn::assistant("hi there")]);
    }

    #[tokio::test]
    async fn trim_keeps_most_recent_turns_in_order() {
        let store = setup().await;
        let id = ConversationId(7);
        store.update_metadata(id, &settings("mini")).await.expect("metadata");
        for index in 0..41 {
            store.append_turn(id, &Turn::user(format!("turn {index}"))).await.expect("append");
        }
        store.append_turn(ConversationId(8), &Turn::user("other")).await.expect("append other");

        let deleted = store.trim_to_most_recent(id, 32).await.expect("trim");
        assert_eq!(deleted, 9);

        let loaded = store.load_conversation(id).await.expect("load").expect("stored");
        let texts: Vec<String> = loaded.turns.into_iter().map(|turn| turn.text).collect();
        let expected: Vec<String> = (9..41).map(|index| format!("turn {index}")).collect();
        assert_eq!(texts, expected);

        store.update_metadata(ConversationId(8), &settings("mini")).await.expect("metadata");
        let other = store.load_conversation(ConversationId(8)).await.expect("load").expect("other");
        assert_eq!(other.turns.len(), 1);
    }

    #[tokio::test]
    async fn delete_last_turn_and_clear_history() {
        let store = setup().await;
        let id = ConversationId(3);
        store.update_metadata(id, &settings("mini")).await.expect("metadata");
        store.append_turn(id, &Turn::user("q")).await.expect("append");
        store.append_turn(id, &Turn::assistant("a")).await.expect("append");

        assert!(store.delete_last_turn(id).await.expect("delete"));
        let loaded = store.load_conversation(id).await.expect("load").expect("stored");
        assert_eq!(loaded.turns, vec![Turn::user("q")]);

        store.clear_history(id).await.expect("clear");
        assert!(!store.delete_last_turn(id).await.expect("delete on empty"));
        let loaded = store.load_conversation(id).await.expect("load").expect("stored");
        assert!(loaded.turns.is_empty());
        assert_eq!(loaded.settings, settings("mini"));
    }

    #[tokio::test]
    async fn tidy_deletes_conversations_outside_allow_list() {
        let store = setup().await;
        for raw in [1, 2, 3, 4] {
            let id = ConversationId(raw);
            store.update_metadata(id, &settings("mini")).await.expect("metadata");
            store.append_turn(id, &Turn::user("hello")).await.expect("append");
        }

        let deleted = store
            .delete_conversations_not_in(&[ConversationId(1), ConversationId(3)])
            .await
            .expect("tidy");
        assert_eq!(deleted, 2);
        assert_eq!(
            store.list_conversation_ids().await.expect("list"),
            vec![ConversationId(1), ConversationId(3)]
        );
        assert_eq!(store.load_conversation(ConversationId(2)).await.expect("load"), None);

        let deleted = store.delete_conversations_not_in(&[]).await.expect("tidy all");
        assert_eq!(deleted, 2);
        assert!(store.list_conversation_ids().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn clear_all_removes_everything() {
        let store = setup().await;
        store.update_metadata(ConversationId(1), &settings("mini")).await.expect("metadata");
        store.append_turn(ConversationId(1), &Turn::user("hello")).await.expect("append");

        store.clear_all().await.expect("clear all");

        assert_eq!(store.load_conversation(ConversationId(1)).await.expect("load"), None);
        assert!(store.list_conversation_ids().await.expect("list").is_empty());
    }
}
