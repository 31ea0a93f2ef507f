//! Engine configuration — typed settings with JSON load/save,
//! per-session resolution, validation, and a startup backup snapshot.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::session::identity::{ChatKind, SessionKey};

/// Generic load for any Serde config type with a `Default` implementation.
/// Falls back to `T::default()` if the file is missing or unparsable.
pub fn load_json_config<T: DeserializeOwned + Default>(path: &Path, label: &str) -> T {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<T>(&content) {
            Ok(config) => {
                tracing::info!("[{}] loaded config from {}", label, path.display());
                config
            }
            Err(e) => {
                tracing::warn!(
                    "[{}] failed to parse config {}: {} — using defaults",
                    label,
                    path.display(),
                    e
                );
                T::default()
            }
        },
        Err(_) => {
            tracing::info!(
                "[{}] no config file at {} — using defaults",
                label,
                path.display()
            );
            T::default()
        }
    }
}

/// Generic save for any Serde config type.
pub fn save_json_config<T: Serialize>(path: &Path, config: &T, label: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {}", e))?;
    tracing::info!("[{}] saved config to {}", label, path.display());
    Ok(())
}

// ── Engine configuration ───────────────────────────────

/// Top-level engine configuration: one settings scope per chat kind plus
/// per-session override lists that take precedence over the scope lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub private_settings: ScopeSettings,
    pub group_settings: ScopeSettings,
    pub private_sessions: Vec<SessionOverride>,
    pub group_sessions: Vec<SessionOverride>,
}

/// Settings shared by a whole scope (all private chats / all group chats)
/// or, via [`SessionOverride`], by a single session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeSettings {
    pub enable: bool,
    /// Target ids covered by this scope when no per-session override matches.
    pub session_list: Vec<String>,
    /// Motivational prompt template. Recognized placeholders:
    /// `{{current_time}}`, `{{unanswered_count}}`, `{{last_reply_time}}`.
    pub proactive_prompt: String,
    pub schedule_settings: ScheduleSettings,
    pub context_aware_settings: ContextAwareSettings,
    pub tts_settings: TtsSettings,
    pub segmented_reply_settings: SegmentSettings,
    pub auto_trigger_settings: AutoTriggerSettings,
    /// Group chats only: minutes of conversational silence before the idle
    /// timer books the next proactive turn.
    pub group_idle_trigger_minutes: u64,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            enable: false,
            session_list: Vec::new(),
            proactive_prompt: String::new(),
            schedule_settings: ScheduleSettings::default(),
            context_aware_settings: ContextAwareSettings::default(),
            tts_settings: TtsSettings::default(),
            segmented_reply_settings: SegmentSettings::default(),
            auto_trigger_settings: AutoTriggerSettings::default(),
            group_idle_trigger_minutes: 10,
        }
    }
}

/// A per-session configuration entry. The flattened settings carry the
/// session's own `enable` switch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOverride {
    pub session_id: String,
    pub session_name: String,
    #[serde(flatten)]
    pub settings: ScopeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub min_interval_minutes: u64,
    pub max_interval_minutes: u64,
    /// Time-of-day window during which no proactive messages are sent,
    /// e.g. `"1-7"` or `"22-6"` (wraps past midnight). Empty disables.
    pub quiet_hours: String,
    pub schedule_rules: Vec<ScheduleRule>,
    /// Decay policy used when no matching rule carries its own.
    pub default_decay: DecaySpec,
    /// Hard cap on consecutive unanswered proactive messages, used when no
    /// decay policy is configured at all. `0` disables the cap.
    pub max_unanswered_times: u32,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            min_interval_minutes: 30,
            max_interval_minutes: 900,
            quiet_hours: "1-7".to_string(),
            schedule_rules: Vec::new(),
            default_decay: DecaySpec::default(),
            max_unanswered_times: 3,
        }
    }
}

/// A time-of-day scheduling rule. The window is `[start_hour, end_hour)`
/// and wraps past midnight when `start_hour > end_hour`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleRule {
    pub start_hour: u32,
    pub end_hour: u32,
    /// Weighted interval buckets, e.g. `"20-30:0.2,30-50:0.5,50-90:0.3"`
    /// (minute ranges with weights). Empty falls back to the global range.
    pub interval_weights: String,
    /// Window-specific decay policy; empty falls back to the default.
    pub decay: DecaySpec,
}

impl Default for ScheduleRule {
    fn default() -> Self {
        Self {
            start_hour: 0,
            end_hour: 24,
            interval_weights: String::new(),
            decay: DecaySpec::default(),
        }
    }
}

/// One decay-policy specification. At most one of the three forms is
/// consulted, in order: explicit probability list, threshold buckets,
/// bare per-step decrement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecaySpec {
    /// Trigger probability per unanswered count (index `count - 1`).
    pub probabilities: Vec<f64>,
    /// Per-step decrement extending the list past its end (or, with no
    /// list, generating an implicit one starting at 1.0).
    pub step: Option<f64>,
    /// Bucketed rules: the bucket with the highest `min_count <= count` wins.
    pub buckets: Vec<DecayBucket>,
}

impl DecaySpec {
    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty() && self.step.is_none() && self.buckets.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecayBucket {
    pub min_count: u32,
    pub probability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextAwareSettings {
    pub enable: bool,
    pub min_delay_minutes: i64,
    pub max_delay_minutes: i64,
    /// How many history turns the timing-prediction prompt embeds.
    pub max_context_messages: usize,
    pub enable_memory: bool,
    pub memory_top_k: usize,
    /// Extra instructions appended to the timing-prediction prompt.
    pub extra_prompt: String,
}

impl Default for ContextAwareSettings {
    fn default() -> Self {
        Self {
            enable: false,
            min_delay_minutes: 5,
            max_delay_minutes: 720,
            max_context_messages: 10,
            enable_memory: true,
            memory_top_k: 5,
            extra_prompt: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    pub enable_tts: bool,
    /// Send the text even when the voice path succeeded.
    pub always_send_text: bool,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            enable_tts: true,
            always_send_text: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentSettings {
    pub enable: bool,
    /// Messages longer than this many characters are sent whole.
    pub words_count_threshold: usize,
    /// Characters that end a segment.
    pub split_chars: String,
    /// `"random"` or `"log"`.
    pub interval_method: String,
    pub log_base: f64,
    /// Uniform range for the random method, e.g. `"1.5,3.5"` (seconds).
    pub interval: String,
}

impl Default for SegmentSettings {
    fn default() -> Self {
        Self {
            enable: false,
            words_count_threshold: 150,
            split_chars: "。？！~…\n".to_string(),
            interval_method: "random".to_string(),
            log_base: 1.8,
            interval: "1.5,3.5".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoTriggerSettings {
    pub enable_auto_trigger: bool,
    /// Minutes after startup before a never-heard-from session gets an
    /// initial schedule.
    pub auto_trigger_after_minutes: u64,
}

impl Default for AutoTriggerSettings {
    fn default() -> Self {
        Self {
            enable_auto_trigger: false,
            auto_trigger_after_minutes: 5,
        }
    }
}

// ── Per-session resolution ─────────────────────────────

/// The settings that apply to one concrete session, after override lookup.
#[derive(Debug, Clone)]
pub struct ResolvedSessionConfig {
    pub settings: ScopeSettings,
    pub session_name: Option<String>,
    pub kind: ChatKind,
}

impl ResolvedSessionConfig {
    pub fn is_group(&self) -> bool {
        self.kind == ChatKind::Group
    }
}

/// Look up the configuration for a session id: per-session overrides first,
/// then the scope-wide session list. Disabled matches resolve to `None`.
pub fn get_session_config(config: &EngineConfig, session_id: &str) -> Option<ResolvedSessionConfig> {
    let key = SessionKey::parse(session_id)?;
    let (overrides, scope) = match key.kind {
        ChatKind::Private => (&config.private_sessions, &config.private_settings),
        ChatKind::Group => (&config.group_sessions, &config.group_settings),
    };

    // 1) per-session override
    for sc in overrides {
        if sc.session_id.is_empty() {
            continue;
        }
        let matches =
            key.target == sc.session_id || key.target.ends_with(&format!(":{}", sc.session_id));
        if matches {
            if !sc.settings.enable {
                return None;
            }
            let name = if sc.session_name.is_empty() {
                None
            } else {
                Some(sc.session_name.clone())
            };
            return Some(ResolvedSessionConfig {
                settings: sc.settings.clone(),
                session_name: name,
                kind: key.kind,
            });
        }
    }

    // 2) scope-wide session list
    if !scope.enable {
        return None;
    }
    if scope.session_list.iter().any(|t| t == &key.target) {
        return Some(ResolvedSessionConfig {
            settings: scope.clone(),
            session_name: None,
            kind: key.kind,
        });
    }
    None
}

// ── Validation ─────────────────────────────────────────

/// Validate the configuration once at load time. Problems are warnings,
/// never hard failures — the engine runs with whatever it was given.
pub fn validate_config(config: &EngineConfig) {
    for (label, scope, overrides) in [
        ("private", &config.private_settings, &config.private_sessions),
        ("group", &config.group_settings, &config.group_sessions),
    ] {
        if scope.enable {
            let has_override = overrides
                .iter()
                .any(|sc| sc.settings.enable && !sc.session_id.is_empty());
            if !has_override && scope.session_list.is_empty() {
                tracing::warn!(
                    "{} proactive messaging is enabled but no sessions are configured",
                    label
                );
            }
        }
        let sched = &scope.schedule_settings;
        if sched.min_interval_minutes > sched.max_interval_minutes {
            tracing::warn!(
                "{} schedule has min interval above max interval; the max will be clamped up",
                label
            );
        }
    }
    tracing::info!("configuration validated");
}

// ── Backup ─────────────────────────────────────────────

/// Write a config snapshot plus a prompt collection into the data directory.
pub fn backup_configurations(config: &EngineConfig, data_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| format!("Failed to create data directory: {}", e))?;

    save_json_config(
        &data_dir.join("user_config_snapshot.json"),
        config,
        "backup",
    )?;

    let mut lines: Vec<String> = vec![
        "# Proactive prompt collection".to_string(),
        format!(
            "> backed up: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        ),
        String::new(),
    ];
    let mut add = |title: &str, settings: &ScopeSettings| {
        if !settings.proactive_prompt.is_empty() {
            lines.push(format!("## {}", title));
            lines.push("```text".to_string());
            lines.push(settings.proactive_prompt.clone());
            lines.push("```".to_string());
            lines.push(String::new());
        }
    };
    add("private default prompt", &config.private_settings);
    add("group default prompt", &config.group_settings);
    for (label, sessions) in [
        ("private", &config.private_sessions),
        ("group", &config.group_sessions),
    ] {
        for (i, sc) in sessions.iter().enumerate() {
            if !sc.session_id.is_empty() && sc.settings.enable {
                let name = if sc.session_name.is_empty() {
                    "unnamed"
                } else {
                    &sc.session_name
                };
                add(
                    &format!("{} session #{} ({} - {})", label, i + 1, sc.session_id, name),
                    &sc.settings,
                );
            }
        }
    }
    std::fs::write(data_dir.join("prompts_collection.md"), lines.join("\n"))
        .map_err(|e| format!("Failed to write prompt collection: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_override(session_id: &str, enable: bool) -> EngineConfig {
        let mut sc = SessionOverride {
            session_id: session_id.to_string(),
            session_name: "Alice".to_string(),
            ..Default::default()
        };
        sc.settings.enable = enable;
        EngineConfig {
            private_sessions: vec![sc],
            ..Default::default()
        }
    }

    #[test]
    fn override_matches_by_target_id() {
        let config = config_with_override("12345", true);
        let resolved = get_session_config(&config, "tg:FriendMessage:12345").unwrap();
        assert_eq!(resolved.session_name.as_deref(), Some("Alice"));
        assert_eq!(resolved.kind, ChatKind::Private);
    }

    #[test]
    fn disabled_override_resolves_to_none() {
        let config = config_with_override("12345", false);
        assert!(get_session_config(&config, "tg:FriendMessage:12345").is_none());
    }

    #[test]
    fn scope_session_list_is_fallback() {
        let mut config = EngineConfig::default();
        config.group_settings.enable = true;
        config.group_settings.session_list = vec!["999".to_string()];
        let resolved = get_session_config(&config, "qq:GroupMessage:999").unwrap();
        assert!(resolved.is_group());
        assert!(get_session_config(&config, "qq:GroupMessage:998").is_none());
    }

    #[test]
    fn config_defaults_survive_round_trip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.private_settings.schedule_settings.min_interval_minutes, 30);
        assert_eq!(back.private_settings.schedule_settings.max_unanswered_times, 3);
        assert_eq!(back.private_settings.context_aware_settings.max_delay_minutes, 720);
    }

    #[test]
    fn unknown_fields_and_missing_fields_use_defaults() {
        let json = r#"{"private_settings": {"enable": true, "unknown_key": 1}}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert!(config.private_settings.enable);
        assert_eq!(config.private_settings.schedule_settings.quiet_hours, "1-7");
    }
}
