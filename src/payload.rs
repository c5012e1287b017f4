//! Decoded response bodies and their log rendering.

use std::fmt;

use serde_json::Value;

/// Response body decoded by content type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Json(_) => None,
        }
    }

    /// JSON value, with text bodies wrapped as a JSON string.
    pub fn into_json(self) -> Value {
        match self {
            Payload::Json(value) => value,
            Payload::Text(text) => Value::String(text),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Json(value) => f.write_str(&format_value(value, 0)),
            Payload::Text(text) => f.write_str(text),
        }
    }
}

/// Pretty-prints `raw` when it parses as JSON, otherwise returns it as-is.
/// A non-zero `max_len` truncates the rendering.
pub fn format_payload(raw: &str, max_len: usize) -> String {
    let trimmed = raw.trim();
    let rendered = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if !trimmed.is_empty() => pretty(&value),
        _ => raw.to_string(),
    };
    truncate(rendered, max_len)
}

pub fn format_value(value: &Value, max_len: usize) -> String {
    truncate(pretty(value), max_len)
}

/// Placeholder used for binary bodies.
pub fn format_binary(len: usize) -> String {
    format!("<{} bytes>", len)
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn truncate(rendered: String, max_len: usize) -> String {
    if max_len == 0 || rendered.chars().count() <= max_len {
        return rendered;
    }
    let keep = max_len.saturating_sub(20);
    let mut cut: String = rendered.chars().take(keep).collect();
    cut.push_str("... (truncated)");
    cut
}
