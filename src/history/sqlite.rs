//! SQLite-backed conversation store.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::ConversationStore;

pub struct SqliteConversationStore {
    pool: SqlitePool,
    default_persona: Option<String>,
}

impl SqliteConversationStore {
    /// Open (creating if missing) and migrate the conversation tables.
    pub async fn connect(db_url: &str, default_persona: Option<String>) -> Result<Self, String> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(|e| format!("invalid sqlite url: {}", e))?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| format!("sqlite connect failed: {}", e))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                persona TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        // Migration: add persona to databases created before it existed
        let _ = sqlx::query("ALTER TABLE conversations ADD COLUMN persona TEXT")
            .execute(&pool)
            .await;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
            );",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self {
            pool,
            default_persona,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Bind a persona to a conversation.
    pub async fn set_persona(&self, conversation_id: &str, persona: &str) -> Result<(), String> {
        sqlx::query("UPDATE conversations SET persona = ? WHERE id = ?")
            .bind(persona)
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn get_or_create(&self, session_id: &str) -> Result<String, String> {
        let existing = sqlx::query(
            "SELECT id FROM conversations WHERE session_id = ? ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        if let Some(row) = existing {
            return Ok(row.get::<String, _>("id"));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO conversations (id, session_id, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(session_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(id)
    }

    async fn history(&self, conversation_id: &str) -> Result<Vec<Value>, String> {
        let rows = sqlx::query(
            "SELECT role, content FROM conversation_messages WHERE conversation_id = ? ORDER BY id",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(rows
            .iter()
            .map(|row| {
                let role: String = row.get("role");
                let content: String = row.get("content");
                serde_json::json!({"role": role, "content": content})
            })
            .collect())
    }

    async fn append_turn(
        &self,
        conversation_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<(), String> {
        let now = chrono::Utc::now().to_rfc3339();
        for (role, content) in [("user", user_text), ("assistant", assistant_text)] {
            sqlx::query(
                "INSERT INTO conversation_messages (conversation_id, role, content, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(conversation_id)
            .bind(role)
            .bind(content)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        }
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn system_prompt(
        &self,
        conversation_id: &str,
        _session_id: &str,
    ) -> Result<Option<String>, String> {
        let row = sqlx::query("SELECT persona FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(row) = row {
            if let Some(persona) = row.get::<Option<String>, _>("persona") {
                if !persona.is_empty() {
                    return Ok(Some(persona));
                }
            }
        }
        Ok(self.default_persona.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    async fn store() -> SqliteConversationStore {
        SqliteConversationStore::connect("sqlite::memory:", Some("default persona".to_string()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn creates_one_conversation_per_session() {
        let store = store().await;
        let a = store.get_or_create("tg:FriendMessage:1").await.unwrap();
        let b = store.get_or_create("tg:FriendMessage:1").await.unwrap();
        let c = store.get_or_create("tg:FriendMessage:2").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn appends_and_reads_turns_in_order() {
        let store = store().await;
        let conv = store.get_or_create("tg:FriendMessage:1").await.unwrap();
        assert_ok!(store.append_turn(&conv, "hello", "hi!").await);
        assert_ok!(store.append_turn(&conv, "more", "sure").await);

        let history = store.history(&conv).await.unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0]["role"], "user");
        assert_eq!(history[0]["content"], "hello");
        assert_eq!(history[3]["content"], "sure");
    }

    #[tokio::test]
    async fn persona_falls_back_to_the_default() {
        let store = store().await;
        let conv = store.get_or_create("tg:FriendMessage:1").await.unwrap();
        assert_eq!(
            store.system_prompt(&conv, "tg:FriendMessage:1").await.unwrap(),
            Some("default persona".to_string())
        );

        store.set_persona(&conv, "bound persona").await.unwrap();
        assert_eq!(
            store.system_prompt(&conv, "tg:FriendMessage:1").await.unwrap(),
            Some("bound persona".to_string())
        );
    }

    #[tokio::test]
    async fn missing_conversation_still_resolves_default_persona() {
        let store = store().await;
        assert_eq!(
            store.system_prompt("nope", "tg:FriendMessage:1").await.unwrap(),
            Some("default persona".to_string())
        );
    }
}
