//! ChatModel seam — the single-round-trip completion interface the engine
//! consumes, plus history normalization.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content (serializes as a JSON string)
    Text(String),
    /// Array of typed text parts
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
}

impl MessageContent {
    /// Flatten to plain text.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.as_str(),
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
        }
    }
}

/// Common interface for completion backends.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// One text completion round trip.
    async fn generate(
        &self,
        prompt: &str,
        history: &[Message],
        system_prompt: &str,
    ) -> Result<String, String>;

    /// Backend identifier (e.g. "openai").
    fn id(&self) -> &str;
}

/// Normalize raw history entries into typed messages.
///
/// Content that is a string stays a string; lists become typed text parts
/// (string elements and `{type: "text"}` objects are kept, anything else is
/// stringified); other values are stringified whole. Entries that are not
/// objects are skipped. Never raises.
pub fn sanitize_history(raw: &[serde_json::Value]) -> Vec<Message> {
    let mut out = Vec::with_capacity(raw.len());
    for entry in raw {
        let Some(obj) = entry.as_object() else {
            tracing::debug!("skipping non-object history entry");
            continue;
        };
        let role = obj
            .get("role")
            .and_then(|r| r.as_str())
            .unwrap_or("user")
            .to_string();
        let content = match obj.get("content") {
            Some(serde_json::Value::String(s)) => MessageContent::Text(s.clone()),
            Some(serde_json::Value::Array(parts)) => {
                let typed = parts
                    .iter()
                    .map(|p| match p {
                        serde_json::Value::String(s) => ContentPart::Text { text: s.clone() },
                        serde_json::Value::Object(o) => ContentPart::Text {
                            text: o
                                .get("text")
                                .and_then(|t| t.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        },
                        other => ContentPart::Text {
                            text: other.to_string(),
                        },
                    })
                    .collect();
                MessageContent::Parts(typed)
            }
            Some(serde_json::Value::Null) | None => MessageContent::Text(String::new()),
            Some(other) => MessageContent::Text(other.to_string()),
        };
        out.push(Message { role, content });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_content_passes_through() {
        let raw = vec![json!({"role": "user", "content": "hello"})];
        let sanitized = sanitize_history(&raw);
        assert_eq!(sanitized.len(), 1);
        assert_eq!(sanitized[0].content.text(), "hello");
    }

    #[test]
    fn list_content_becomes_typed_parts() {
        let raw = vec![json!({
            "role": "assistant",
            "content": [{"type": "text", "text": "a"}, "b", 3]
        })];
        let sanitized = sanitize_history(&raw);
        match &sanitized[0].content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 3),
            _ => panic!("expected parts"),
        }
        assert_eq!(sanitized[0].content.text(), "a b 3");
    }

    #[test]
    fn malformed_entries_are_tolerated() {
        let raw = vec![
            json!("just a string"),
            json!({"content": 42}),
            json!({"role": "user"}),
        ];
        let sanitized = sanitize_history(&raw);
        assert_eq!(sanitized.len(), 2);
        assert_eq!(sanitized[0].role, "user");
        assert_eq!(sanitized[0].content.text(), "42");
        assert_eq!(sanitized[1].content.text(), "");
    }

    #[test]
    fn text_content_serializes_as_plain_string() {
        let msg = Message::new("user", "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"], "hi");
    }
}
