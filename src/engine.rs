//! The engine — the explicitly constructed context object owning all
//! shared state, plus the host-facing lifecycle and event surface.
//!
//! Inbound user messages reset per-session timers and (when enabled) kick
//! off a tracked context-prediction pass; the job scheduler's invocation
//! stream drives proactive turns through the executor.

use chrono::{Local, TimeZone, Timelike, Utc};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::{
    backup_configurations, get_session_config, validate_config, ContextAwareSettings, EngineConfig,
};
use crate::context::{ContextPredictor, ContextTaskStore};
use crate::delivery::{MessageSink, ProactiveSender, SpeechSynthesizer};
use crate::executor::{self, TURN_MISFIRE_GRACE};
use crate::history::{ConversationStore, MemoryRecall};
use crate::jobs::{JobInvocation, JobScheduler, TokioJobScheduler};
use crate::llm::{sanitize_history, ChatModel, Message};
use crate::schedule::compute_interval;
use crate::session::identity::{
    is_group_session_id, log_label_for, resolve_live_target, ChatKind, PlatformDirectory,
    SessionKey,
};
use crate::session::store::{now_millis, SessionStore};

/// The collaborators the host supplies.
pub struct HostBindings {
    pub model: Arc<dyn ChatModel>,
    /// Secondary call path when the primary model fails.
    pub fallback_model: Option<Arc<dyn ChatModel>>,
    /// Model for context prediction; defaults to the primary.
    pub context_model: Option<Arc<dyn ChatModel>>,
    pub conversations: Arc<dyn ConversationStore>,
    pub sink: Arc<dyn MessageSink>,
    pub tts: Option<Arc<dyn SpeechSynthesizer>>,
    pub platforms: Arc<dyn PlatformDirectory>,
    pub memory: Option<Arc<dyn MemoryRecall>>,
}

/// Everything a turn needs, in one place. Explicitly constructed and passed
/// around — never ambient.
pub struct EngineContext {
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub store: Arc<SessionStore>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub tasks: ContextTaskStore,
    pub predictor: ContextPredictor,
    pub conversations: Arc<dyn ConversationStore>,
    pub model: Arc<dyn ChatModel>,
    pub fallback_model: Option<Arc<dyn ChatModel>>,
    pub sender: ProactiveSender,
    pub platforms: Arc<dyn PlatformDirectory>,
    pub memory: Option<Arc<dyn MemoryRecall>>,
}

impl EngineContext {
    /// Book the next ordinary turn for a session and persist the trigger
    /// time. Resets the unanswered counter when asked (after a user reply).
    pub(crate) async fn schedule_next_chat(&self, session_id: &str, reset_counter: bool) {
        let Some(config) = get_session_config(&self.config, session_id) else {
            return;
        };
        let schedule = &config.settings.schedule_settings;

        let mut data = self.store.lock().await;
        if reset_counter {
            data.entry(session_id.to_string()).or_default().unanswered_count = 0;
        }
        let interval = compute_interval(schedule, Local::now().hour());
        let run_at = Utc::now() + chrono::Duration::seconds(interval as i64);
        self.scheduler
            .schedule(
                session_id,
                run_at,
                JobInvocation::ordinary(session_id),
                TURN_MISFIRE_GRACE,
            )
            .await;
        data.entry(session_id.to_string()).or_default().next_trigger_time =
            Some(now_millis() + interval as i64 * 1000);
        self.store.persist(&data).await;

        tracing::info!(
            "{} next proactive message booked for {}",
            log_label_for(session_id, config.session_name.as_deref()),
            run_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
    }

    /// Drop a stale persisted trigger time, if any.
    pub(crate) async fn clear_trigger_time(&self, session_id: &str) {
        let mut data = self.store.lock().await;
        let cleared = data
            .get_mut(session_id)
            .map(|state| state.next_trigger_time.take().is_some())
            .unwrap_or(false);
        if cleared {
            self.store.persist(&data).await;
        }
    }
}

struct EngineInner {
    ctx: Arc<EngineContext>,
    invocations: Mutex<Option<mpsc::UnboundedReceiver<JobInvocation>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    group_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    auto_trigger_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// In-flight context-prediction passes, tracked so shutdown can abort
    /// them instead of orphaning mid-flight LLM calls.
    prediction_tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at_ms: i64,
}

/// The engine handle. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ProactiveEngine {
    inner: Arc<EngineInner>,
}

impl ProactiveEngine {
    pub fn new(config: EngineConfig, data_dir: impl Into<PathBuf>, bindings: HostBindings) -> Self {
        let data_dir = data_dir.into();
        let (scheduler, invocations) = TokioJobScheduler::new();
        let scheduler: Arc<dyn JobScheduler> = Arc::new(scheduler);
        let store = Arc::new(SessionStore::new(data_dir.join("session_data.json")));
        let tasks = ContextTaskStore::new(store.clone(), scheduler.clone());
        let predictor = ContextPredictor::new(
            bindings
                .context_model
                .unwrap_or_else(|| bindings.model.clone()),
        );
        let sender = ProactiveSender::new(bindings.sink, bindings.tts);

        let ctx = Arc::new(EngineContext {
            config,
            data_dir,
            store,
            scheduler,
            tasks,
            predictor,
            conversations: bindings.conversations,
            model: bindings.model,
            fallback_model: bindings.fallback_model,
            sender,
            platforms: bindings.platforms,
            memory: bindings.memory,
        });

        Self {
            inner: Arc::new(EngineInner {
                ctx,
                invocations: Mutex::new(Some(invocations)),
                dispatch: Mutex::new(None),
                group_timers: Mutex::new(HashMap::new()),
                auto_trigger_timers: Mutex::new(HashMap::new()),
                prediction_tasks: Mutex::new(Vec::new()),
                started_at_ms: now_millis(),
            }),
        }
    }

    pub fn context(&self) -> Arc<EngineContext> {
        self.inner.ctx.clone()
    }

    // ── Lifecycle ──────────────────────────────────────

    /// Back up and validate the config, reload persisted state, restore
    /// jobs and context tasks, start the dispatch loop, arm auto-triggers.
    pub async fn start(&self) {
        let ctx = &self.inner.ctx;

        if let Err(e) = backup_configurations(&ctx.config, &ctx.data_dir) {
            tracing::warn!("config backup failed: {}", e);
        }
        validate_config(&ctx.config);

        ctx.store.load().await;
        self.restore_scheduled_jobs().await;
        // restore() persists its own pruning, so the resave flag is
        // informational here.
        let _ = ctx.tasks.restore().await;

        if let Some(mut rx) = self.inner.invocations.lock().await.take() {
            let engine = self.clone();
            let handle = tokio::spawn(async move {
                while let Some(invocation) = rx.recv().await {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        let outcome = executor::run_turn(&engine.inner.ctx, invocation).await;
                        // A delivered group turn hands scheduling back to
                        // the silence timer.
                        if outcome.delivered && is_group_session_id(&outcome.session_id) {
                            engine.reset_group_silence_timer(&outcome.session_id).await;
                        }
                    });
                }
            });
            *self.inner.dispatch.lock().await = Some(handle);
        }

        self.setup_auto_triggers().await;
        tracing::info!("proactive engine started");
    }

    /// Cancel every timer, job, and in-flight prediction, then flush state.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.dispatch.lock().await.take() {
            handle.abort();
        }
        for (_, handle) in self.inner.group_timers.lock().await.drain() {
            handle.abort();
        }
        for (_, handle) in self.inner.auto_trigger_timers.lock().await.drain() {
            handle.abort();
        }
        // Abort in-flight prediction passes, then wait for them to settle
        // so no LLM call is left mid-flight past shutdown.
        let predictions: Vec<JoinHandle<()>> =
            self.inner.prediction_tasks.lock().await.drain(..).collect();
        for handle in &predictions {
            handle.abort();
        }
        let _ = futures::future::join_all(predictions).await;
        self.inner.ctx.scheduler.cancel_all().await;

        let data = self.inner.ctx.store.lock().await;
        self.inner.ctx.store.persist(&data).await;
        tracing::info!("proactive engine stopped");
    }

    // ── Inbound events ─────────────────────────────────

    /// Handle an inbound user message: record its time and the bot's own
    /// id, cancel stale timers, reset the session's schedule, and (when
    /// enabled) kick off the context-prediction pass.
    pub async fn on_user_message(&self, session_id: &str, message_text: &str, self_id: Option<&str>) {
        let ctx = &self.inner.ctx;
        let now = now_millis();

        {
            let mut data = ctx.store.lock().await;
            let state = data.entry(session_id.to_string()).or_default();
            if let Some(self_id) = self_id {
                state.self_id = Some(self_id.to_string());
            }
            state.last_message_time = Some(now);
            ctx.store.persist(&data).await;
        }

        // The user is active; pending auto-triggers for this target (on any
        // platform) are moot.
        self.cancel_related_auto_triggers(session_id).await;

        let Some(config) = get_session_config(&ctx.config, session_id) else {
            return;
        };

        // A reply invalidates the interval the pending job was drawn from.
        ctx.scheduler.cancel(session_id).await;

        if config.is_group() {
            self.reset_group_silence_timer(session_id).await;
            let mut data = ctx.store.lock().await;
            let state = data.entry(session_id.to_string()).or_default();
            state.unanswered_count = 0;
            state.next_trigger_time = None;
            ctx.store.persist(&data).await;
        } else {
            ctx.schedule_next_chat(session_id, true).await;
        }

        let settings = config.settings.context_aware_settings.clone();
        if settings.enable && !message_text.trim().is_empty() {
            self.spawn_context_pass(session_id.to_string(), message_text.to_string(), settings)
                .await;
        }
    }

    /// The host reports an outbound bot message (any source). Group chats
    /// restart their silence countdown from it.
    pub async fn on_bot_message_sent(&self, session_id: &str) {
        if is_group_session_id(session_id) {
            self.reset_group_silence_timer(session_id).await;
        }
    }

    // ── Context-aware pass ─────────────────────────────

    async fn spawn_context_pass(
        &self,
        session_id: String,
        message_text: String,
        settings: ContextAwareSettings,
    ) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            let ctx = &engine.inner.ctx;
            // Cancellation check and history retrieval fan out together;
            // neither needs the other's answer.
            let (cancelled_reason, history) = tokio::join!(
                ctx.tasks
                    .cancel_if_stale(&ctx.predictor, &session_id, &message_text),
                fetch_history_for_prediction(ctx, &session_id),
            );

            let prediction = ctx
                .predictor
                .predict_timing(
                    &session_id,
                    &message_text,
                    &history,
                    Local::now(),
                    &settings,
                    &cancelled_reason,
                )
                .await;

            match prediction {
                Some(p) if p.should_schedule => {
                    ctx.tasks
                        .create(&session_id, p.delay_minutes, &p.reason, &p.message_hint)
                        .await;
                }
                _ => {
                    tracing::info!(
                        "{} context analysis done; no contextual follow-up needed",
                        log_label_for(&session_id, None)
                    );
                }
            }
        });

        let mut tasks = self.inner.prediction_tasks.lock().await;
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    // ── Timers ─────────────────────────────────────────

    /// Restart the group silence countdown; when it expires the session
    /// gets an ordinary turn booked (counter untouched).
    async fn reset_group_silence_timer(&self, session_id: &str) {
        let ctx = &self.inner.ctx;
        let Some(config) = get_session_config(&ctx.config, session_id) else {
            return;
        };
        let idle_minutes = config.settings.group_idle_trigger_minutes;
        let label = log_label_for(session_id, config.session_name.as_deref());

        let mut timers = self.inner.group_timers.lock().await;
        if let Some(old) = timers.remove(session_id) {
            old.abort();
        }

        let engine = self.clone();
        let sid = session_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(idle_minutes * 60)).await;
            let ctx = &engine.inner.ctx;
            {
                let mut data = ctx.store.lock().await;
                data.entry(sid.clone()).or_default();
            }
            tracing::info!(
                "{} silent for {} minutes, planning a proactive message",
                label,
                idle_minutes
            );
            ctx.schedule_next_chat(&sid, false).await;
        });
        timers.insert(session_id.to_string(), handle);
    }

    async fn cancel_related_auto_triggers(&self, session_id: &str) {
        let mut timers = self.inner.auto_trigger_timers.lock().await;
        let stale: Vec<String> = match SessionKey::parse(session_id) {
            Some(key) => {
                // The same target can appear under several platform ids.
                let suffix = format!(":{}", key.target);
                timers
                    .keys()
                    .filter(|sid| *sid == session_id || sid.ends_with(&suffix))
                    .cloned()
                    .collect()
            }
            None => timers
                .keys()
                .filter(|sid| *sid == session_id)
                .cloned()
                .collect(),
        };
        for sid in stale {
            if let Some(handle) = timers.remove(&sid) {
                handle.abort();
            }
        }
    }

    /// Arm auto-trigger timers for every enabled session, so sessions that
    /// never message the bot still get an initial schedule.
    async fn setup_auto_triggers(&self) {
        let ctx = &self.inner.ctx;
        let mut processed: HashSet<String> = HashSet::new();
        let mut count = 0usize;

        let mut planned: Vec<(String, ChatKind, crate::config::AutoTriggerSettings)> = Vec::new();
        for (overrides, kind) in [
            (&ctx.config.private_sessions, ChatKind::Private),
            (&ctx.config.group_sessions, ChatKind::Group),
        ] {
            for sc in overrides {
                if sc.session_id.is_empty() || !sc.settings.enable {
                    continue;
                }
                if processed.insert(sc.session_id.clone()) {
                    planned.push((sc.session_id.clone(), kind, sc.settings.auto_trigger_settings.clone()));
                }
            }
        }
        for (scope, kind) in [
            (&ctx.config.private_settings, ChatKind::Private),
            (&ctx.config.group_settings, ChatKind::Group),
        ] {
            if !scope.enable {
                continue;
            }
            for target in &scope.session_list {
                if processed.insert(target.clone()) {
                    planned.push((target.clone(), kind, scope.auto_trigger_settings.clone()));
                }
            }
        }

        for (target, kind, auto) in planned {
            if !auto.enable_auto_trigger || auto.auto_trigger_after_minutes == 0 {
                continue;
            }

            // A persisted unexpired job already covers this target.
            let suffix = format!(":{}:{}", kind.message_type(), target);
            let now = now_millis();
            let covered = ctx
                .store
                .read(|d| {
                    d.iter().any(|(sid, s)| {
                        sid.ends_with(&suffix)
                            && s.next_trigger_time.is_some_and(|t| now < t + 60_000)
                    })
                })
                .await;
            if covered {
                tracing::info!("{} already has a persisted job, skipping auto-trigger", target);
                continue;
            }

            // The target may itself be a full session id.
            let (preferred, real_target) = match SessionKey::parse(&target) {
                Some(key) if target.contains(':') => (Some(key.platform), key.target),
                _ => (None, target.clone()),
            };
            let known = ctx.store.session_ids().await;
            let session_id = resolve_live_target(
                &real_target,
                kind,
                ctx.platforms.as_ref(),
                &known,
                preferred.as_deref(),
            );
            self.arm_auto_trigger(&session_id, auto.auto_trigger_after_minutes)
                .await;
            count += 1;
        }

        if count > 0 {
            tracing::info!("armed auto-triggers for {} sessions", count);
        }
    }

    async fn arm_auto_trigger(&self, session_id: &str, minutes: u64) {
        let mut timers = self.inner.auto_trigger_timers.lock().await;
        if let Some(old) = timers.remove(session_id) {
            old.abort();
        }

        let engine = self.clone();
        let sid = session_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(minutes * 60)).await;
            let ctx = &engine.inner.ctx;
            let heard_from = ctx
                .store
                .read(|d| {
                    d.get(&sid)
                        .and_then(|s| s.last_message_time)
                        .is_some_and(|t| t >= engine.inner.started_at_ms)
                })
                .await;
            if heard_from || get_session_config(&ctx.config, &sid).is_none() {
                return;
            }
            tracing::info!(
                "{} never messaged since startup; booking an initial proactive turn",
                log_label_for(&sid, None)
            );
            ctx.schedule_next_chat(&sid, false).await;
        });
        timers.insert(session_id.to_string(), handle);
        tracing::info!(
            "{} auto-trigger armed, checking in {} minutes",
            log_label_for(session_id, None),
            minutes
        );
    }

    // ── Restart recovery ───────────────────────────────

    /// Rebuild jobs from persisted trigger times, dropping entries whose
    /// due time is past the grace window.
    async fn restore_scheduled_jobs(&self) {
        let ctx = &self.inner.ctx;
        let now = now_millis();
        let entries: Vec<(String, i64)> = ctx
            .store
            .read(|d| {
                d.iter()
                    .filter_map(|(sid, s)| s.next_trigger_time.map(|t| (sid.clone(), t)))
                    .collect()
            })
            .await;

        let mut restored = 0usize;
        for (sid, next) in entries {
            if get_session_config(&ctx.config, &sid).is_none() {
                continue;
            }
            if now >= next + 60_000 {
                continue;
            }
            let Some(run_at) = Utc.timestamp_millis_opt(next).single() else {
                continue;
            };
            ctx.scheduler
                .schedule(&sid, run_at, JobInvocation::ordinary(&sid), TURN_MISFIRE_GRACE)
                .await;
            restored += 1;
        }
        tracing::info!("restored {} scheduled turns", restored);
    }
}

async fn fetch_history_for_prediction(ctx: &EngineContext, session_id: &str) -> Vec<Message> {
    match ctx.conversations.get_or_create(session_id).await {
        Ok(conv_id) => match ctx.conversations.history(&conv_id).await {
            Ok(raw) => sanitize_history(&raw),
            Err(e) => {
                tracing::debug!("prediction history fetch failed: {}", e);
                Vec::new()
            }
        },
        Err(e) => {
            tracing::debug!("prediction conversation lookup failed: {}", e);
            Vec::new()
        }
    }
}
