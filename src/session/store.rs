//! Per-session scheduling state and its JSON persistence.
//!
//! All mutable session state lives in one map behind a single async mutex.
//! Every mutation that affects scheduling persists the whole document;
//! corrupt or missing files degrade to an empty state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, MutexGuard};

/// One contextually predicted follow-up, pending until it fires, is
/// cancelled, or expires across a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextTask {
    pub id: String,
    /// LLM-produced justification, e.g. "user is watching a movie".
    pub reason: String,
    /// LLM-produced suggested follow-up topic.
    pub hint: String,
    pub delay_minutes: i64,
    pub created_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
}

/// Scheduling state for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    /// Consecutive proactive messages sent without a user reply.
    pub unanswered_count: u32,
    /// When the next ordinary scheduled check is due (unix milliseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_trigger_time: Option<i64>,
    /// Last inbound user message (unix milliseconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_time: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_context_tasks: Vec<ContextTask>,
    /// Legacy single-task shape; merged into the list on load.
    #[serde(skip_serializing)]
    pub(crate) pending_context_task: Option<ContextTask>,
    /// Platform-assigned bot identity, recorded from inbound events so the
    /// outbound delivery context can be reconstructed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_id: Option<String>,
}

/// The persisted session map behind the process-wide async mutex.
pub struct SessionStore {
    path: PathBuf,
    data: Mutex<HashMap<String, SessionState>>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Load persisted state. Missing or corrupt files yield an empty map;
    /// entries that fail to deserialize individually are pruned.
    pub async fn load(&self) {
        let mut loaded: HashMap<String, SessionState> = HashMap::new();
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if !content.trim().is_empty() => {
                match serde_json::from_str::<HashMap<String, serde_json::Value>>(&content) {
                    Ok(raw) => {
                        for (sid, value) in raw {
                            match serde_json::from_value::<SessionState>(value) {
                                Ok(mut state) => {
                                    // Migrate the legacy single-task shape.
                                    if let Some(task) = state.pending_context_task.take() {
                                        state.pending_context_tasks.push(task);
                                    }
                                    loaded.insert(sid, state);
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        "dropping malformed session entry {}: {}",
                                        sid,
                                        e
                                    );
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!("failed to parse session data, starting empty: {}", e);
                    }
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!("failed to read session data, starting empty: {}", e);
            }
        }
        let mut data = self.data.lock().await;
        *data = loaded;
    }

    /// Acquire the state map. Hold the guard for the whole
    /// read-then-decide-then-write sequence, and pass it to [`persist`]
    /// before releasing when the mutation affects scheduling.
    ///
    /// [`persist`]: SessionStore::persist
    pub async fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionState>> {
        self.data.lock().await
    }

    /// Write the given state map to disk. Failures are logged, never raised.
    pub async fn persist(&self, data: &HashMap<String, SessionState>) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                tracing::error!("failed to create data directory: {}", e);
                return;
            }
        }
        match serde_json::to_string_pretty(data) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&self.path, json).await {
                    tracing::error!("failed to save session data: {}", e);
                }
            }
            Err(e) => tracing::error!("failed to serialize session data: {}", e),
        }
    }

    /// Mutate and persist inside one critical section.
    pub async fn update<R>(&self, f: impl FnOnce(&mut HashMap<String, SessionState>) -> R) -> R {
        let mut data = self.data.lock().await;
        let out = f(&mut data);
        self.persist(&data).await;
        out
    }

    /// Read without persisting.
    pub async fn read<R>(&self, f: impl FnOnce(&HashMap<String, SessionState>) -> R) -> R {
        let data = self.data.lock().await;
        f(&data)
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<SessionState> {
        self.read(|d| d.get(session_id).cloned()).await
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.read(|d| d.keys().cloned().collect()).await
    }
}

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
