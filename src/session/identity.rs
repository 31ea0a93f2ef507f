//! Session identity — parsing, display labels, and liveness re-resolution.
//!
//! Session ids use the host's `platform:type:target` triple. Platform
//! connector instances get new identifiers across host restarts, so a
//! pinned identity must be re-derived against the currently live platform
//! set rather than trusted.

use serde::{Deserialize, Serialize};

/// Message kinds the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChatKind {
    Private,
    Group,
}

impl ChatKind {
    /// The wire form used inside session ids.
    pub fn message_type(&self) -> &'static str {
        match self {
            ChatKind::Private => "FriendMessage",
            ChatKind::Group => "GroupMessage",
        }
    }

    /// The keyword used when scanning persisted session ids.
    pub fn keyword(&self) -> &'static str {
        match self {
            ChatKind::Private => "Friend",
            ChatKind::Group => "Group",
        }
    }

    pub fn from_message_type(message_type: &str) -> Self {
        if message_type.contains("Group") {
            ChatKind::Group
        } else {
            ChatKind::Private
        }
    }
}

/// A parsed session identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub platform: String,
    pub kind: ChatKind,
    pub target: String,
}

impl SessionKey {
    /// Parse `platform:type:target`. The two-part shorthand
    /// `platform:target` defaults to a private chat.
    pub fn parse(session_id: &str) -> Option<SessionKey> {
        if session_id.is_empty() {
            return None;
        }
        let parts: Vec<&str> = session_id.splitn(3, ':').collect();
        match parts.as_slice() {
            [platform, message_type, target] => Some(SessionKey {
                platform: (*platform).to_string(),
                kind: ChatKind::from_message_type(message_type),
                target: (*target).to_string(),
            }),
            [platform, target] => Some(SessionKey {
                platform: (*platform).to_string(),
                kind: ChatKind::Private,
                target: (*target).to_string(),
            }),
            _ => None,
        }
    }

    /// The canonical three-part id form.
    pub fn canonical(&self) -> String {
        format!("{}:{}:{}", self.platform, self.kind.message_type(), self.target)
    }

    /// A short description for log lines, e.g. `[private 12345 (Alice)]`.
    pub fn log_label(&self, session_name: Option<&str>) -> String {
        let kind = match self.kind {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
        };
        match session_name {
            Some(name) if !name.is_empty() => format!("[{} {} ({})]", kind, self.target, name),
            _ => format!("[{} {}]", kind, self.target),
        }
    }
}

/// Quick group check on a raw session id, without a full parse.
pub fn is_group_session_id(session_id: &str) -> bool {
    session_id.to_ascii_lowercase().contains("group")
}

/// Log label for a raw id that may not parse.
pub fn log_label_for(session_id: &str, session_name: Option<&str>) -> String {
    match SessionKey::parse(session_id) {
        Some(key) => key.log_label(session_name),
        None => format!("[{}]", session_id),
    }
}

// ── Liveness resolution ────────────────────────────────

/// Host-provided view of the platform connector instances.
pub trait PlatformDirectory: Send + Sync {
    /// Ids of every known platform instance, whatever its status.
    fn known_platforms(&self) -> Vec<String>;
    /// Whether the given platform instance exists and reports running.
    fn is_running(&self, platform_id: &str) -> bool;
}

/// Re-derive a live session id for a target.
///
/// Resolution order: the preferred platform if it is running, then a
/// persisted session id for the same target on a running platform, then any
/// running platform, then a synthetic placeholder. Web-chat instances are
/// never eligible.
pub fn resolve_live_target(
    target_id: &str,
    kind: ChatKind,
    directory: &dyn PlatformDirectory,
    known_session_ids: &[String],
    preferred_platform: Option<&str>,
) -> String {
    let active: Vec<String> = directory
        .known_platforms()
        .into_iter()
        .filter(|pid| !pid.is_empty() && !pid.to_ascii_lowercase().contains("webchat"))
        .collect();
    let running = |pid: &str| active.iter().any(|p| p == pid) && directory.is_running(pid);

    // 1) preferred platform
    if let Some(preferred) = preferred_platform {
        if running(preferred) {
            return format!("{}:{}:{}", preferred, kind.message_type(), target_id);
        }
    }

    // 2) a persisted session id for this target on a live platform
    let suffix = format!(":{}", target_id);
    for existing in known_session_ids {
        if existing.contains(kind.keyword()) && existing.ends_with(&suffix) {
            if let Some(pid) = existing.split(':').next() {
                if running(pid) {
                    return existing.clone();
                }
            }
        }
    }

    // 3) any running platform
    for pid in &active {
        if directory.is_running(pid) {
            return format!("{}:{}:{}", pid, kind.message_type(), target_id);
        }
    }

    // 4) placeholder
    let fallback = active.first().map(String::as_str).unwrap_or("default");
    format!("{}:{}:{}", fallback, kind.message_type(), target_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeDirectory {
        known: Vec<String>,
        running: Vec<String>,
    }

    impl PlatformDirectory for FakeDirectory {
        fn known_platforms(&self) -> Vec<String> {
            self.known.clone()
        }
        fn is_running(&self, platform_id: &str) -> bool {
            self.running.iter().any(|p| p == platform_id)
        }
    }

    fn directory(known: &[&str], running: &[&str]) -> FakeDirectory {
        FakeDirectory {
            known: known.iter().map(|s| s.to_string()).collect(),
            running: running.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn parses_three_part_and_shorthand_ids() {
        let key = SessionKey::parse("tg:GroupMessage:42").unwrap();
        assert_eq!(key.platform, "tg");
        assert_eq!(key.kind, ChatKind::Group);
        assert_eq!(key.target, "42");

        let short = SessionKey::parse("tg:42").unwrap();
        assert_eq!(short.kind, ChatKind::Private);
        assert_eq!(short.canonical(), "tg:FriendMessage:42");

        assert!(SessionKey::parse("").is_none());
        assert!(SessionKey::parse("loneid").is_none());
    }

    #[test]
    fn target_may_contain_colons() {
        let key = SessionKey::parse("tg:FriendMessage:a:b:c").unwrap();
        assert_eq!(key.target, "a:b:c");
    }

    #[test]
    fn prefers_the_preferred_platform_when_running() {
        let dir = directory(&["tg_1", "qq_1"], &["tg_1", "qq_1"]);
        let id = resolve_live_target("42", ChatKind::Private, &dir, &[], Some("qq_1"));
        assert_eq!(id, "qq_1:FriendMessage:42");
    }

    #[test]
    fn falls_back_to_persisted_session_on_live_platform() {
        let dir = directory(&["tg_2"], &["tg_2"]);
        let known = vec!["tg_2:FriendMessage:42".to_string()];
        let id = resolve_live_target("42", ChatKind::Private, &dir, &known, Some("tg_1"));
        assert_eq!(id, "tg_2:FriendMessage:42");
    }

    #[test]
    fn falls_back_to_any_running_platform_then_placeholder() {
        let dir = directory(&["qq_9"], &["qq_9"]);
        let id = resolve_live_target("7", ChatKind::Group, &dir, &[], None);
        assert_eq!(id, "qq_9:GroupMessage:7");

        let dead = directory(&["qq_9"], &[]);
        let id = resolve_live_target("7", ChatKind::Group, &dead, &[], None);
        assert_eq!(id, "qq_9:GroupMessage:7");

        let empty = directory(&[], &[]);
        let id = resolve_live_target("7", ChatKind::Group, &empty, &[], None);
        assert_eq!(id, "default:GroupMessage:7");
    }

    #[test]
    fn webchat_instances_are_never_eligible() {
        let dir = directory(&["webchat_main", "tg_1"], &["webchat_main", "tg_1"]);
        let id = resolve_live_target("42", ChatKind::Private, &dir, &[], Some("webchat_main"));
        assert_eq!(id, "tg_1:FriendMessage:42");
    }

    #[test]
    fn group_check_and_labels() {
        assert!(is_group_session_id("qq:GroupMessage:1"));
        assert!(!is_group_session_id("qq:FriendMessage:1"));
        let key = SessionKey::parse("qq:FriendMessage:1").unwrap();
        assert_eq!(key.log_label(Some("Bob")), "[private 1 (Bob)]");
        assert_eq!(key.log_label(None), "[private 1]");
    }
}
