//! The proactive-turn state machine.
//!
//! One run is: preconditions → identity resolution → request assembly →
//! prompt construction → generation → consistency check → delivery and
//! finalize, with a top-level recovery handler. Any step may end the turn
//! early; the abort variant decides whether a retry gets booked.

use chrono::{Local, TimeZone, Timelike, Utc};
use std::time::Duration;

use crate::config::{get_session_config, ResolvedSessionConfig};
use crate::engine::EngineContext;
use crate::error::{is_auth_error, TurnAbort};
use crate::history::{ConversationStore, MemoryRecall};
use crate::jobs::{JobInvocation, JobScheduler};
use crate::llm::{sanitize_history, ChatModel, Message};
use crate::schedule::{compute_interval, evaluate_decay, is_quiet_hours, DecayVerdict};
use crate::session::identity::{log_label_for, resolve_live_target, PlatformDirectory, SessionKey};
use crate::session::store::{now_millis, ContextTask};

/// Known-garbage completions, discarded outright. `[object Object]` is an
/// upstream serialization bug surfacing as text.
const INVALID_RESPONSES: [&str; 1] = ["[object Object]"];

/// Misfire grace for ordinary turn jobs.
pub(crate) const TURN_MISFIRE_GRACE: Duration = Duration::from_secs(60);

/// What a finished turn reports to the dispatcher.
#[derive(Debug)]
pub struct TurnOutcome {
    pub delivered: bool,
    /// The (possibly re-resolved) session id the turn ran against.
    pub session_id: String,
}

/// Run one proactive turn. Never panics outward; every failure is folded
/// into logging plus, where appropriate, a rescheduled retry.
pub async fn run_turn(ctx: &EngineContext, invocation: JobInvocation) -> TurnOutcome {
    let mut session_id = invocation.session_id.clone();
    let label = log_label_for(&session_id, None);

    match execute(ctx, &mut session_id, invocation.context_task_id.as_deref()).await {
        Ok(()) => TurnOutcome {
            delivered: true,
            session_id,
        },
        Err(TurnAbort::Silent(reason)) => {
            if !reason.is_empty() {
                tracing::info!("{} turn ended: {}", label, reason);
            }
            TurnOutcome {
                delivered: false,
                session_id,
            }
        }
        Err(TurnAbort::Reschedule(reason)) => {
            tracing::info!("{} turn ended, retry booked: {}", label, reason);
            ctx.schedule_next_chat(&session_id, false).await;
            TurnOutcome {
                delivered: false,
                session_id,
            }
        }
        Err(TurnAbort::Fatal(reason)) => {
            tracing::error!("{} fatal turn error: {}", label, reason);
            if !is_auth_error(&reason) {
                // Clear stale trigger bookkeeping, then retry best-effort.
                ctx.clear_trigger_time(&session_id).await;
                ctx.schedule_next_chat(&session_id, false).await;
            }
            TurnOutcome {
                delivered: false,
                session_id,
            }
        }
    }
}

async fn execute(
    ctx: &EngineContext,
    session_id: &mut String,
    context_task_id: Option<&str>,
) -> Result<(), TurnAbort> {
    let (config, unanswered) = check_preconditions(ctx, session_id).await?;
    resolve_identity(ctx, session_id).await?;
    let generation = prepare_and_generate(ctx, session_id, &config, unanswered, context_task_id).await?;
    deliver_and_finalize(ctx, session_id, &config, generation, unanswered, context_task_id).await
}

struct Generation {
    response: String,
    conv_id: String,
    prompt: String,
}

// ── Step 1: preconditions ──────────────────────────────

async fn check_preconditions(
    ctx: &EngineContext,
    session_id: &str,
) -> Result<(ResolvedSessionConfig, u32), TurnAbort> {
    let Some(config) = get_session_config(&ctx.config, session_id) else {
        return Err(TurnAbort::Silent(String::new()));
    };
    if !config.settings.enable {
        return Err(TurnAbort::Silent(String::new()));
    }

    let hour = Local::now().hour();
    if is_quiet_hours(&config.settings.schedule_settings.quiet_hours, hour) {
        return Err(TurnAbort::Reschedule("inside quiet hours".to_string()));
    }

    // Read the counter and roll the decay under one critical section, so
    // the decision sees a consistent snapshot. No persistence in here.
    let (unanswered, decision) = {
        let data = ctx.store.lock().await;
        let count = data
            .get(session_id)
            .map(|s| s.unanswered_count)
            .unwrap_or(0);
        let decision = evaluate_decay(count, &config.settings.schedule_settings, hour);
        (count, decision)
    };

    let label = log_label_for(session_id, config.session_name.as_deref());
    match decision.verdict {
        DecayVerdict::Trigger => {
            if !decision.reason.is_empty() {
                tracing::info!("{} {}", label, decision.reason);
            }
            Ok((config, unanswered))
        }
        // Probabilistic decay re-rolls on a future interval.
        DecayVerdict::Skip => Err(TurnAbort::Reschedule(decision.reason)),
        // The hard cap is terminal: no retry until the user replies.
        DecayVerdict::Stop => Err(TurnAbort::Silent(decision.reason)),
    }
}

// ── Step 2: identity resolution ────────────────────────

async fn resolve_identity(ctx: &EngineContext, session_id: &mut String) -> Result<(), TurnAbort> {
    let Some(key) = SessionKey::parse(session_id) else {
        return Ok(());
    };

    let known = ctx.store.session_ids().await;
    let new_id = resolve_live_target(
        &key.target,
        key.kind,
        ctx.platforms.as_ref(),
        &known,
        Some(&key.platform),
    );

    if let Some(new_key) = SessionKey::parse(&new_id) {
        if !ctx.platforms.is_running(&new_key.platform) {
            return Err(TurnAbort::Reschedule(format!(
                "platform {} is not running",
                new_key.platform
            )));
        }
    }

    if new_id != *session_id {
        tracing::info!("session {} re-resolved to {}", session_id, new_id);
        *session_id = new_id;
    }
    Ok(())
}

// ── Steps 3-6: request assembly, generation, consistency ───

async fn prepare_and_generate(
    ctx: &EngineContext,
    session_id: &str,
    config: &ResolvedSessionConfig,
    unanswered: u32,
    context_task_id: Option<&str>,
) -> Result<Generation, TurnAbort> {
    let label = log_label_for(session_id, config.session_name.as_deref());

    let conv_id = ctx
        .conversations
        .get_or_create(session_id)
        .await
        .map_err(|e| TurnAbort::Reschedule(format!("failed to open conversation: {}", e)))?;

    let raw_history = match ctx.conversations.history(&conv_id).await {
        Ok(h) => h,
        Err(e) => {
            tracing::debug!("{} history fetch failed: {}", label, e);
            Vec::new()
        }
    };

    let system_prompt = ctx
        .conversations
        .system_prompt(&conv_id, session_id)
        .await
        .unwrap_or_default();
    let Some(mut system_prompt) = system_prompt.filter(|p| !p.is_empty()) else {
        tracing::error!("{} no persona resolves, giving up this turn", label);
        return Err(TurnAbort::Reschedule("no persona available".to_string()));
    };

    // Snapshot before any LLM network call — generation may take
    // arbitrarily long, and step 6 compares against this.
    let snapshot_last_msg = ctx
        .store
        .read(|d| d.get(session_id).and_then(|s| s.last_message_time))
        .await
        .unwrap_or(0);

    let context_task = match context_task_id {
        Some(task_id) => ctx.tasks.find(session_id, task_id).await,
        None => None,
    };
    let prompt = build_final_prompt(
        &config.settings.proactive_prompt,
        unanswered,
        snapshot_last_msg,
        context_task.as_ref(),
    );

    inject_memories(ctx, session_id, config, context_task.as_ref(), &mut system_prompt).await;

    let history = sanitize_history(&raw_history);
    let response = call_model(ctx, &prompt, &history, &system_prompt).await?;
    let response = response.trim().to_string();
    if response.is_empty() {
        return Err(TurnAbort::Reschedule("empty completion".to_string()));
    }
    if INVALID_RESPONSES.contains(&response.as_str()) {
        return Err(TurnAbort::Reschedule(format!(
            "invalid completion {:?}",
            response
        )));
    }

    // Step 6: the user may have messaged while the model was generating.
    // Staleness is detected, not prevented — generation is never atomic
    // with inbound traffic. The inbound handler already rescheduled, so a
    // stale turn discards silently.
    let (current_last_msg, current_unanswered) = ctx
        .store
        .read(|d| {
            let state = d.get(session_id);
            (
                state.and_then(|s| s.last_message_time).unwrap_or(0),
                state.map(|s| s.unanswered_count).unwrap_or(0),
            )
        })
        .await;
    if current_last_msg > snapshot_last_msg || current_unanswered < unanswered {
        return Err(TurnAbort::Silent(
            "user messaged during generation; response discarded".to_string(),
        ));
    }

    Ok(Generation {
        response,
        conv_id,
        prompt,
    })
}

/// Primary model, then the fallback. Authentication-class failures abort
/// without retry; anything else reschedules.
async fn call_model(
    ctx: &EngineContext,
    prompt: &str,
    history: &[Message],
    system_prompt: &str,
) -> Result<String, TurnAbort> {
    match ctx.model.generate(prompt, history, system_prompt).await {
        Ok(text) => Ok(text),
        Err(primary_err) => {
            tracing::error!("llm call failed: {}", primary_err);
            if is_auth_error(&primary_err) {
                return Err(TurnAbort::Fatal(primary_err));
            }
            if let Some(fallback) = &ctx.fallback_model {
                match fallback.generate(prompt, history, system_prompt).await {
                    Ok(text) => return Ok(text),
                    Err(fallback_err) => {
                        if is_auth_error(&fallback_err) {
                            return Err(TurnAbort::Fatal(fallback_err));
                        }
                        tracing::error!("fallback llm call failed: {}", fallback_err);
                    }
                }
            }
            Err(TurnAbort::Reschedule("llm call failed".to_string()))
        }
    }
}

async fn inject_memories(
    ctx: &EngineContext,
    session_id: &str,
    config: &ResolvedSessionConfig,
    context_task: Option<&ContextTask>,
    system_prompt: &mut String,
) {
    let settings = &config.settings.context_aware_settings;
    if !settings.enable_memory || settings.memory_top_k == 0 {
        return;
    }
    let Some(memory) = &ctx.memory else {
        return;
    };

    // The context hint/reason anchors the retrieval; the clock is the
    // fallback query.
    let query = context_task
        .map(|t| {
            if t.hint.is_empty() {
                t.reason.clone()
            } else {
                t.hint.clone()
            }
        })
        .filter(|q| !q.is_empty())
        .unwrap_or_else(|| Local::now().format("%Y-%m-%d %H:%M").to_string());

    match memory.recall(session_id, &query, settings.memory_top_k).await {
        Ok(memories) if !memories.is_empty() => {
            let mut block = String::from("[Relevant long-term memories]");
            for (i, memory_text) in memories.iter().enumerate() {
                let mut text = memory_text.trim().to_string();
                if text.chars().count() > 200 {
                    text = text.chars().take(200).collect::<String>() + "...";
                }
                block.push_str(&format!("\n- memory {}: {}", i + 1, text));
            }
            system_prompt.push_str("\n\n");
            system_prompt.push_str(&block);
            tracing::info!(
                "{} injected {} memories into the system prompt",
                log_label_for(session_id, config.session_name.as_deref()),
                memories.len()
            );
        }
        Ok(_) => {}
        // Memory is best-effort; unavailability never blocks the turn.
        Err(e) => tracing::debug!("memory recall unavailable: {}", e),
    }
}

// ── Step 4 helpers: prompt construction ────────────────

fn build_final_prompt(
    template: &str,
    unanswered: u32,
    last_msg_millis: i64,
    context_task: Option<&ContextTask>,
) -> String {
    let now = Local::now();
    let mut prompt = template
        .replace("{{unanswered_count}}", &unanswered.to_string())
        .replace("{{current_time}}", &now.format("%Y-%m-%d %H:%M").to_string())
        .replace("{{last_reply_time}}", &format_last_reply(last_msg_millis));

    if let Some(task) = context_task {
        prompt.push_str(&format!(
            "\n\n[Context-aware trigger]\nThis message was scheduled because: {}\nSuggested follow-up topic: {}\nWeave this context naturally into your message.",
            task.reason, task.hint
        ));
    }
    prompt
}

fn format_last_reply(last_msg_millis: i64) -> String {
    if last_msg_millis <= 0 {
        return "unknown".to_string();
    }
    let Some(last) = Local.timestamp_millis_opt(last_msg_millis).single() else {
        return "unknown".to_string();
    };
    let elapsed_min = (now_millis() - last_msg_millis).max(0) / 60_000;
    let elapsed = if elapsed_min < 60 {
        format!("{} minutes", elapsed_min)
    } else {
        let hours = elapsed_min / 60;
        let minutes = elapsed_min % 60;
        if minutes == 0 {
            format!("{} hours", hours)
        } else {
            format!("{} hours {} minutes", hours, minutes)
        }
    };
    format!("{} ({} ago)", last.format("%Y-%m-%d %H:%M"), elapsed)
}

// ── Step 7: delivery and finalize ──────────────────────

async fn deliver_and_finalize(
    ctx: &EngineContext,
    session_id: &str,
    config: &ResolvedSessionConfig,
    generation: Generation,
    unanswered: u32,
    context_task_id: Option<&str>,
) -> Result<(), TurnAbort> {
    let label = log_label_for(session_id, config.session_name.as_deref());

    ctx.sender
        .send(
            session_id,
            &generation.response,
            &config.settings.tts_settings,
            &config.settings.segmented_reply_settings,
        )
        .await
        .map_err(|e| TurnAbort::Fatal(format!("delivery failed: {}", e)))?;

    // Archiving is best-effort; a failed append never unwinds a sent turn.
    if let Err(e) = ctx
        .conversations
        .append_turn(&generation.conv_id, &generation.prompt, &generation.response)
        .await
    {
        tracing::error!("{} failed to archive the turn: {}", label, e);
    }

    let is_group = config.is_group();
    {
        let mut data = ctx.store.lock().await;
        let state = data.entry(session_id.to_string()).or_default();
        state.unanswered_count = unanswered + 1;

        // Private chats book their own next turn; a group's schedule is
        // owned by the silence timer after this point.
        if !is_group {
            let interval = compute_interval(&config.settings.schedule_settings, Local::now().hour());
            let run_at = Utc::now() + chrono::Duration::seconds(interval as i64);
            ctx.scheduler
                .schedule(
                    session_id,
                    run_at,
                    JobInvocation::ordinary(session_id),
                    TURN_MISFIRE_GRACE,
                )
                .await;
            state.next_trigger_time = Some(now_millis() + interval as i64 * 1000);
            tracing::info!(
                "{} next proactive message booked for {}",
                label,
                run_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
            );
        }
        ctx.store.persist(&data).await;
    }

    if let Some(task_id) = context_task_id {
        ctx.tasks.remove(session_id, task_id).await;
    }

    if is_group {
        ctx.clear_trigger_time(session_id).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_substituted() {
        let template = "Now {{current_time}}, unanswered {{unanswered_count}}, last reply {{last_reply_time}}.";
        let prompt = build_final_prompt(template, 3, 0, None);
        assert!(prompt.contains("unanswered 3"));
        assert!(prompt.contains("last reply unknown"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn context_task_block_is_appended_and_delimited() {
        let task = ContextTask {
            id: "ctx_s_1".to_string(),
            reason: "user is watching a movie".to_string(),
            hint: "ask how the movie was".to_string(),
            delay_minutes: 100,
            created_at: Utc::now(),
            due_at: Utc::now(),
        };
        let prompt = build_final_prompt("hello", 0, 0, Some(&task));
        assert!(prompt.starts_with("hello"));
        assert!(prompt.contains("[Context-aware trigger]"));
        assert!(prompt.contains("user is watching a movie"));
        assert!(prompt.contains("ask how the movie was"));
    }

    #[test]
    fn last_reply_formats_minutes_and_hours() {
        let five_min_ago = now_millis() - 5 * 60_000;
        let text = format_last_reply(five_min_ago);
        assert!(text.contains("5 minutes ago"), "{}", text);

        let two_hours_ago = now_millis() - 125 * 60_000;
        let text = format_last_reply(two_hours_ago);
        assert!(text.contains("2 hours 5 minutes ago"), "{}", text);

        assert_eq!(format_last_reply(0), "unknown");
    }
}
