//! Tolerant JSON extraction from completion text.
//!
//! Models wrap their JSON in markdown fences or chat filler often enough
//! that strict parsing is a losing game: strip fences first, then fall back
//! to scanning for an embedded object or array.

use serde_json::Value;

/// Strip markdown code fences if present.
pub fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    if trimmed.starts_with("```") {
        trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
    } else {
        trimmed
    }
}

/// Extract a JSON object from completion text, tolerating fences and
/// surrounding prose. `None` when nothing object-shaped parses.
pub fn extract_object(text: &str) -> Option<Value> {
    extract(text, '{', '}', Value::is_object)
}

/// Extract a JSON array from completion text.
pub fn extract_array(text: &str) -> Option<Value> {
    extract(text, '[', ']', Value::is_array)
}

fn extract(text: &str, open: char, close: char, accepts: fn(&Value) -> bool) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    let cleaned = strip_code_fences(text);

    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        if accepts(&value) {
            return Some(value);
        }
    }

    let candidate = find_balanced(cleaned, open, close)?;
    serde_json::from_str::<Value>(candidate)
        .ok()
        .filter(accepts)
}

/// The first balanced `open..close` span, depth-counted but not
/// string-aware — the same tolerance level a bracket-matching regex gives.
fn find_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(&text[start..start + offset + ch.len_utf8()]);
            }
        }
    }
    None
}
