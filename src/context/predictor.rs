//! Context prediction — LLM judgments about when to follow up and whether
//! an already-scheduled follow-up is still wanted.

use chrono::{DateTime, Local};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ContextAwareSettings;
use crate::llm::json::{extract_array, extract_object};
use crate::llm::{ChatModel, Message};
use crate::session::store::ContextTask;

/// Prompt for predicting the next follow-up time from conversation context.
const PREDICT_TIMING_PROMPT: &str = r#"You are analyzing a chat conversation to decide the best time to send a proactive follow-up message.

Recent conversation (latest messages):
{recent_messages}

Current time: {current_time}

The user's latest message: "{last_message}"
{cancelled_context}
Based on the conversational context, decide:
1. Whether a proactive follow-up should be scheduled
2. If so, how many minutes to wait before sending it
3. What the follow-up should be about

Reference patterns:
- "I'm watching a movie" → about 90-120 minutes (ask how the movie was)
- "good night" / "going to sleep" → about 420-540 minutes (morning greeting)
- "heading into a meeting" → about 30-90 minutes (ask how the meeting went)
- "commuting" / "on my way" → about 20-60 minutes (ask if they arrived)
- "having lunch" / "eating" → about 30-60 minutes (light follow-up)
- "working" / "busy" → about 60-180 minutes (check in later)
- ordinary small talk with no clear activity → use the default schedule (return should_schedule: false)

IMPORTANT: you MUST return should_schedule: false when:
- The user says an activity just ended ("done eating", "finished the movie", "arrived", "meeting's over")
- The user's message wraps up a previous activity rather than starting a new one
- A scheduled task was just cancelled because of this message (the context has moved on)

Respond with ONLY a JSON object, no other text:
{
  "should_schedule": true/false,
  "delay_minutes": <number>,
  "reason": "<short reason>",
  "message_hint": "<what the follow-up should say>"
}

If the context does not suggest a specific time, return should_schedule: false.
"#;

/// Prompt for the batched cancellation check across all pending tasks.
const CHECK_CANCEL_PROMPT: &str = r#"You are reviewing previously scheduled proactive follow-up messages to decide whether any of them should be cancelled.

Pending follow-ups:
{task_list}

The user just said: "{last_message}"

For each follow-up, decide whether the user's new message means the activity has ended or the follow-up is no longer needed.

Cancellation examples:
- The task is "ask how the movie was" and the user says "finished the movie" → cancel
- The task is "morning greeting" and the user already messaged in the morning → cancel
- The task is "ask if they arrived" and the user says "I'm here" → cancel
- The user has started a completely new topic → cancel (the context has moved on)

Respond with ONLY a JSON array covering every follow-up:
[
  {"task_index": 0, "should_cancel": true/false, "reason": "<short reason>"}
]
"#;

/// A parsed timing prediction. `delay_minutes` is already clamped.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingPrediction {
    pub should_schedule: bool,
    pub delay_minutes: i64,
    pub reason: String,
    pub message_hint: String,
}

/// One entry of the batched cancellation answer.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelVerdict {
    pub should_cancel: bool,
    pub reason: String,
}

#[derive(Deserialize)]
struct RawPrediction {
    #[serde(default)]
    should_schedule: bool,
    #[serde(default)]
    delay_minutes: Option<serde_json::Value>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message_hint: String,
}

#[derive(Deserialize)]
struct RawCancel {
    task_index: i64,
    #[serde(default)]
    should_cancel: bool,
    #[serde(default)]
    reason: String,
}

pub struct ContextPredictor {
    model: Arc<dyn ChatModel>,
}

impl ContextPredictor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// One completion call scoring "should we schedule a contextual
    /// follow-up, and when". `None` means "treat as should_schedule=false":
    /// empty input, an unparseable answer, or a failed call.
    pub async fn predict_timing(
        &self,
        session_id: &str,
        last_message: &str,
        history: &[Message],
        now: DateTime<Local>,
        settings: &ContextAwareSettings,
        just_cancelled_reason: &str,
    ) -> Option<TimingPrediction> {
        let last_message = last_message.trim();
        if last_message.is_empty() {
            return None;
        }

        let cancelled_context = if just_cancelled_reason.is_empty() {
            String::new()
        } else {
            format!(
                "(Note: a scheduled task was just cancelled because of this message; its reason was \"{}\". The previous activity has ended or the context has moved on.)\n",
                just_cancelled_reason
            )
        };

        let mut prompt = PREDICT_TIMING_PROMPT
            .replace(
                "{recent_messages}",
                &build_recent_messages(history, settings.max_context_messages),
            )
            .replace("{current_time}", &now.format("%Y-%m-%d %H:%M").to_string())
            .replace("{last_message}", last_message)
            .replace("{cancelled_context}", &cancelled_context);
        if !settings.extra_prompt.is_empty() {
            prompt.push('\n');
            prompt.push_str(&settings.extra_prompt);
        }

        let response = match self
            .model
            .generate(
                &prompt,
                &[],
                "You are a timing prediction assistant. Respond with only the requested JSON object.",
            )
            .await
        {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("timing prediction call failed: {}", e);
                return None;
            }
        };

        let value = extract_object(&response)?;
        let raw: RawPrediction = serde_json::from_value(value).ok()?;

        let delay = if raw.should_schedule {
            let parsed = raw.delay_minutes.as_ref().and_then(coerce_minutes).unwrap_or(60);
            parsed.clamp(settings.min_delay_minutes, settings.max_delay_minutes)
        } else {
            0
        };

        let prediction = TimingPrediction {
            should_schedule: raw.should_schedule,
            delay_minutes: delay,
            reason: raw.reason,
            message_hint: raw.message_hint,
        };
        tracing::info!(
            "{} prediction: schedule={}, delay={}m, reason={}",
            session_id,
            prediction.should_schedule,
            prediction.delay_minutes,
            if prediction.reason.is_empty() {
                "none"
            } else {
                &prediction.reason
            }
        );
        Some(prediction)
    }

    /// One batched completion call judging every pending task at once —
    /// LLM cost stays linear in turns, not in pending-task count. Indexes
    /// outside the task list are discarded; empty input or an unparseable
    /// answer cancels nothing.
    pub async fn check_cancellations(
        &self,
        session_id: &str,
        last_message: &str,
        tasks: &[ContextTask],
    ) -> HashMap<usize, CancelVerdict> {
        let last_message = last_message.trim();
        if last_message.is_empty() || tasks.is_empty() {
            return HashMap::new();
        }

        let task_list = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| {
                format!(
                    "#{} scheduled because: \"{}\"; planned topic: \"{}\"",
                    i,
                    if t.reason.is_empty() {
                        "proactive follow-up"
                    } else {
                        &t.reason
                    },
                    if t.hint.is_empty() {
                        "check in with the user"
                    } else {
                        &t.hint
                    }
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = CHECK_CANCEL_PROMPT
            .replace("{task_list}", &task_list)
            .replace("{last_message}", last_message);

        let response = match self
            .model
            .generate(
                &prompt,
                &[],
                "You are a task cancellation judge. Respond with only the requested JSON array.",
            )
            .await
        {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("cancellation check call failed: {}", e);
                return HashMap::new();
            }
        };

        let Some(value) = extract_array(&response) else {
            tracing::warn!(
                "unparseable cancellation answer: {}",
                truncate_chars(&response, 200)
            );
            return HashMap::new();
        };
        let raw: Vec<RawCancel> = match serde_json::from_value(value) {
            Ok(items) => items,
            Err(_) => return HashMap::new(),
        };

        let mut verdicts = HashMap::new();
        for item in raw {
            if item.task_index < 0 || item.task_index as usize >= tasks.len() {
                continue;
            }
            if item.should_cancel {
                tracing::info!(
                    "{} cancellation suggested for task #{}: {}",
                    session_id,
                    item.task_index,
                    item.reason
                );
            }
            verdicts.insert(
                item.task_index as usize,
                CancelVerdict {
                    should_cancel: item.should_cancel,
                    reason: item.reason,
                },
            );
        }
        verdicts
    }
}

/// Flatten the last `max_messages` history turns to role-labeled lines,
/// each truncated to a fixed character cap.
pub fn build_recent_messages(history: &[Message], max_messages: usize) -> String {
    if history.is_empty() {
        return "(no recent messages)".to_string();
    }
    let start = if max_messages > 0 && history.len() > max_messages {
        history.len() - max_messages
    } else {
        0
    };
    let mut lines = Vec::new();
    for msg in &history[start..] {
        let content = msg.content.text();
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        let label = if msg.role == "user" { "user" } else { "assistant" };
        lines.push(format!("{}: {}", label, truncate_chars(content, 200)));
    }
    if lines.is_empty() {
        "(no recent messages)".to_string()
    } else {
        lines.join("\n")
    }
}

fn truncate_chars(text: &str, cap: usize) -> String {
    if text.chars().count() > cap {
        let mut out: String = text.chars().take(cap).collect();
        out.push_str("...");
        out
    } else {
        text.to_string()
    }
}

fn coerce_minutes(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}
