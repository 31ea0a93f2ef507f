//! The pending context-task registry.
//!
//! Every task maps 1:1 to one scheduled callback keyed by the task id.
//! Mutations update the session store's pending list and the job registry
//! under the store's critical section, so the two never diverge.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::predictor::ContextPredictor;
use crate::jobs::{JobInvocation, JobScheduler};
use crate::session::store::{ContextTask, SessionStore};

/// Context jobs tolerate more scheduler jitter than ordinary turns.
pub const CONTEXT_MISFIRE_GRACE: Duration = Duration::from_secs(120);

pub struct ContextTaskStore {
    store: Arc<SessionStore>,
    scheduler: Arc<dyn JobScheduler>,
    counter: AtomicU64,
}

impl ContextTaskStore {
    pub fn new(store: Arc<SessionStore>, scheduler: Arc<dyn JobScheduler>) -> Self {
        Self {
            store,
            scheduler,
            counter: AtomicU64::new(0),
        }
    }

    /// Create a pending task and book its callback. Returns the task id.
    pub async fn create(
        &self,
        session_id: &str,
        delay_minutes: i64,
        reason: &str,
        hint: &str,
    ) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let task_id = format!("ctx_{}_{}", session_id, n);
        let now = Utc::now();
        let due_at = now + ChronoDuration::minutes(delay_minutes);

        let task = ContextTask {
            id: task_id.clone(),
            reason: reason.to_string(),
            hint: hint.to_string(),
            delay_minutes,
            created_at: now,
            due_at,
        };

        let mut data = self.store.lock().await;
        self.scheduler
            .schedule(
                &task_id,
                due_at,
                JobInvocation::contextual(session_id, &task_id),
                CONTEXT_MISFIRE_GRACE,
            )
            .await;
        data.entry(session_id.to_string())
            .or_default()
            .pending_context_tasks
            .push(task);
        self.store.persist(&data).await;

        tracing::info!(
            "{} context task booked for {} (+{}m, reason: {})",
            session_id,
            due_at.format("%Y-%m-%d %H:%M:%S"),
            delay_minutes,
            reason
        );
        task_id
    }

    /// Run the batched cancellation check over every pending task and drop
    /// the ones judged stale, cancelling their callbacks. Returns the
    /// removed tasks' reasons, semicolon-joined, for use as context in the
    /// next prediction call.
    pub async fn cancel_if_stale(
        &self,
        predictor: &ContextPredictor,
        session_id: &str,
        last_message: &str,
    ) -> String {
        let tasks = self
            .store
            .read(|d| {
                d.get(session_id)
                    .map(|s| s.pending_context_tasks.clone())
                    .unwrap_or_default()
            })
            .await;
        if tasks.is_empty() {
            return String::new();
        }

        // The LLM round trip happens outside the store lock.
        let verdicts = predictor
            .check_cancellations(session_id, last_message, &tasks)
            .await;
        let stale_ids: Vec<String> = tasks
            .iter()
            .enumerate()
            .filter(|(i, _)| verdicts.get(i).is_some_and(|v| v.should_cancel))
            .map(|(_, t)| t.id.clone())
            .collect();
        if stale_ids.is_empty() {
            return String::new();
        }

        let mut cancelled_reasons = Vec::new();
        let mut data = self.store.lock().await;
        if let Some(state) = data.get_mut(session_id) {
            for id in &stale_ids {
                // Re-match by id: the list may have changed during the call.
                if let Some(pos) = state.pending_context_tasks.iter().position(|t| &t.id == id) {
                    let removed = state.pending_context_tasks.remove(pos);
                    self.scheduler.cancel(&removed.id).await;
                    tracing::info!(
                        "{} context task {} cancelled: superseded by the user's new message",
                        session_id,
                        removed.id
                    );
                    cancelled_reasons.push(removed.reason);
                }
            }
        }
        if !cancelled_reasons.is_empty() {
            self.store.persist(&data).await;
        }
        cancelled_reasons.join("; ")
    }

    /// Unconditional removal, used after a contextual turn completes.
    pub async fn remove(&self, session_id: &str, task_id: &str) {
        let mut data = self.store.lock().await;
        self.scheduler.cancel(task_id).await;
        let mut changed = false;
        if let Some(state) = data.get_mut(session_id) {
            let before = state.pending_context_tasks.len();
            state.pending_context_tasks.retain(|t| t.id != task_id);
            changed = state.pending_context_tasks.len() != before;
        }
        if changed {
            self.store.persist(&data).await;
        }
    }

    /// Find a pending task by id.
    pub async fn find(&self, session_id: &str, task_id: &str) -> Option<ContextTask> {
        self.store
            .read(|d| {
                d.get(session_id)
                    .and_then(|s| s.pending_context_tasks.iter().find(|t| t.id == task_id).cloned())
            })
            .await
    }

    /// Restore pending tasks after a restart: drop anything already past
    /// due, book one callback per survivor, and report whether the pruned
    /// state needs re-persisting.
    pub async fn restore(&self) -> bool {
        let now = Utc::now();
        let mut needs_resave = false;
        let mut restored = 0usize;

        let mut data = self.store.lock().await;
        let session_ids: Vec<String> = data.keys().cloned().collect();
        for sid in session_ids {
            let Some(state) = data.get_mut(&sid) else {
                continue;
            };
            let before = state.pending_context_tasks.len();
            state.pending_context_tasks.retain(|t| t.due_at >= now);
            if state.pending_context_tasks.len() != before {
                needs_resave = true;
            }
            for task in state.pending_context_tasks.clone() {
                self.scheduler
                    .schedule(
                        &task.id,
                        task.due_at,
                        JobInvocation::contextual(&sid, &task.id),
                        CONTEXT_MISFIRE_GRACE,
                    )
                    .await;
                restored += 1;
            }
        }
        if needs_resave {
            self.store.persist(&data).await;
        }
        if restored > 0 {
            tracing::info!("restored {} pending context tasks", restored);
        }
        needs_resave
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::TokioJobScheduler;
    use crate::llm::{ChatModel, Message};
    use async_trait::async_trait;

    struct ScriptedModel(std::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn generate(
            &self,
            _prompt: &str,
            _history: &[Message],
            _system_prompt: &str,
        ) -> Result<String, String> {
            let mut responses = self.0.lock().unwrap();
            if responses.is_empty() {
                Err("script exhausted".to_string())
            } else {
                Ok(responses.remove(0))
            }
        }
        fn id(&self) -> &str {
            "scripted"
        }
    }

    fn fixture() -> (Arc<SessionStore>, Arc<TokioJobScheduler>, ContextTaskStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().join("session_data.json")));
        let (scheduler, _rx) = TokioJobScheduler::new();
        let scheduler = Arc::new(scheduler);
        let tasks = ContextTaskStore::new(store.clone(), scheduler.clone());
        (store, scheduler, tasks, dir)
    }

    #[tokio::test]
    async fn create_then_restore_reproduces_the_task() {
        let (store, scheduler, tasks, dir) = fixture();
        let id = tasks
            .create("tg:FriendMessage:1", 100, "user is watching a movie", "ask about it")
            .await;
        assert!(scheduler.contains(&id).await);
        let created = tasks.find("tg:FriendMessage:1", &id).await.unwrap();

        // Simulate a restart before the task fires.
        drop(tasks);
        scheduler.cancel_all().await;
        drop(store);
        let store = Arc::new(SessionStore::new(dir.path().join("session_data.json")));
        store.load().await;
        let (scheduler2, _rx2) = TokioJobScheduler::new();
        let scheduler2 = Arc::new(scheduler2);
        let tasks2 = ContextTaskStore::new(store.clone(), scheduler2.clone());

        let needs_resave = tasks2.restore().await;
        assert!(!needs_resave);
        let restored = tasks2.find("tg:FriendMessage:1", &id).await.unwrap();
        assert_eq!(restored.reason, created.reason);
        assert_eq!(restored.hint, created.hint);
        assert_eq!(restored.due_at, created.due_at);
        assert!(scheduler2.contains(&id).await, "restore re-arms the callback");
    }

    #[tokio::test]
    async fn restore_drops_expired_tasks_and_asks_for_resave() {
        let (store, _scheduler, tasks, _dir) = fixture();
        let id = tasks.create("tg:FriendMessage:1", 60, "r", "h").await;

        // Age the task past due by editing persisted state directly.
        store
            .update(|d| {
                let state = d.get_mut("tg:FriendMessage:1").unwrap();
                state.pending_context_tasks[0].due_at = Utc::now() - ChronoDuration::minutes(5);
            })
            .await;

        let needs_resave = tasks.restore().await;
        assert!(needs_resave);
        assert!(tasks.find("tg:FriendMessage:1", &id).await.is_none());
    }

    #[tokio::test]
    async fn batch_cancellation_removes_exactly_the_judged_tasks() {
        let (store, scheduler, tasks, _dir) = fixture();
        let movie = tasks
            .create("tg:FriendMessage:1", 100, "movie", "ask how the movie was")
            .await;
        let commute = tasks
            .create("tg:FriendMessage:1", 30, "commute", "ask if they arrived")
            .await;

        let model = Arc::new(ScriptedModel(std::sync::Mutex::new(vec![r#"[
            {"task_index": 0, "should_cancel": true, "reason": "the movie is over"},
            {"task_index": 1, "should_cancel": false, "reason": "still relevant"}
        ]"#
        .to_string()])));
        let predictor = ContextPredictor::new(model);

        let cancelled = tasks
            .cancel_if_stale(&predictor, "tg:FriendMessage:1", "I'm home now")
            .await;
        assert_eq!(cancelled, "movie");
        assert!(!scheduler.contains(&movie).await, "cancelled callback removed");
        assert!(scheduler.contains(&commute).await, "surviving callback kept");

        let remaining = store
            .snapshot("tg:FriendMessage:1")
            .await
            .unwrap()
            .pending_context_tasks;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].reason, "commute");
    }

    #[tokio::test]
    async fn failed_check_cancels_nothing() {
        let (_store, scheduler, tasks, _dir) = fixture();
        let id = tasks.create("tg:FriendMessage:1", 100, "movie", "h").await;

        let model = Arc::new(ScriptedModel(std::sync::Mutex::new(Vec::new())));
        let predictor = ContextPredictor::new(model);
        let cancelled = tasks
            .cancel_if_stale(&predictor, "tg:FriendMessage:1", "hello")
            .await;
        assert!(cancelled.is_empty());
        assert!(scheduler.contains(&id).await);
    }

    #[tokio::test]
    async fn remove_clears_task_and_callback() {
        let (store, scheduler, tasks, _dir) = fixture();
        let id = tasks.create("tg:FriendMessage:1", 100, "r", "h").await;
        tasks.remove("tg:FriendMessage:1", &id).await;
        assert!(!scheduler.contains(&id).await);
        assert!(store
            .snapshot("tg:FriendMessage:1")
            .await
            .unwrap()
            .pending_context_tasks
            .is_empty());
    }
}
