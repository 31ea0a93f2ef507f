//! Conversation storage and optional long-term memory — host seams.

pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

pub use sqlite::SqliteConversationStore;

/// Host-provided conversation storage.
///
/// History entries come back as raw JSON values; the executor normalizes
/// them with [`crate::llm::sanitize_history`] before a generation call.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// The current conversation for a session, created when absent.
    async fn get_or_create(&self, session_id: &str) -> Result<String, String>;

    async fn history(&self, conversation_id: &str) -> Result<Vec<Value>, String>;

    async fn append_turn(
        &self,
        conversation_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<(), String>;

    /// Resolve the system prompt: the conversation-bound persona when one
    /// exists, else the host default. `None` means no persona resolves at
    /// all, which aborts the turn.
    async fn system_prompt(
        &self,
        conversation_id: &str,
        session_id: &str,
    ) -> Result<Option<String>, String>;
}

/// Optional long-term memory. Absence degrades silently to "no memory
/// injected" — never an error surface.
#[async_trait]
pub trait MemoryRecall: Send + Sync {
    async fn recall(
        &self,
        session_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<String>, String>;
}

// ── In-memory store ────────────────────────────────────

#[derive(Default)]
struct MemoryStoreInner {
    conversations: HashMap<String, String>,
    turns: HashMap<String, Vec<Value>>,
}

/// Map-backed conversation store, used in tests and as a throwaway default.
pub struct InMemoryConversationStore {
    default_persona: Option<String>,
    inner: Mutex<MemoryStoreInner>,
}

impl InMemoryConversationStore {
    pub fn new(default_persona: Option<String>) -> Self {
        Self {
            default_persona,
            inner: Mutex::new(MemoryStoreInner::default()),
        }
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get_or_create(&self, session_id: &str) -> Result<String, String> {
        let mut inner = self.inner.lock().await;
        let id = inner
            .conversations
            .entry(session_id.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone();
        Ok(id)
    }

    async fn history(&self, conversation_id: &str) -> Result<Vec<Value>, String> {
        let inner = self.inner.lock().await;
        Ok(inner.turns.get(conversation_id).cloned().unwrap_or_default())
    }

    async fn append_turn(
        &self,
        conversation_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> Result<(), String> {
        let mut inner = self.inner.lock().await;
        let turns = inner.turns.entry(conversation_id.to_string()).or_default();
        turns.push(serde_json::json!({"role": "user", "content": user_text}));
        turns.push(serde_json::json!({"role": "assistant", "content": assistant_text}));
        Ok(())
    }

    async fn system_prompt(
        &self,
        _conversation_id: &str,
        _session_id: &str,
    ) -> Result<Option<String>, String> {
        Ok(self.default_persona.clone())
    }
}
