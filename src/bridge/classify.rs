//! Event classification.
//!
//! The upstream assistant's event vocabulary has drifted across versions:
//! the discriminator and the textual payload each appear under several
//! historical key names. Classification probes an ordered list of known
//! aliases instead of assuming one fixed schema, so upstream instability is
//! contained in this module.

use log::warn;
use serde_json::Value;

/// Discriminator keys, tried in order.
const TYPE_KEYS: &[&str] = &["type", "event", "kind", "event_type"];

/// Content keys, tried in order.
const CONTENT_KEYS: &[&str] = &["content", "text", "delta", "message", "data"];

/// Type-name families, matched case-insensitively against the discriminator.
const DELTA_TYPES: &[&str] = &[
    "assistant_message_delta",
    "message_delta",
    "content_block_delta",
    "text_delta",
    "delta",
];
const FULL_MESSAGE_TYPES: &[&str] = &[
    "assistant_message",
    "assistant",
    "full_message",
    "message_end",
    "message",
];
const COMPLETION_TYPES: &[&str] = &[
    "session_idle",
    "idle",
    "done",
    "complete",
    "completed",
    "turn_end",
    "agent_end",
    "result",
];
const TOOL_TYPES: &[&str] = &[
    "tool_output",
    "tool_result",
    "tool_use",
    "tool_execution_end",
];
const ERROR_TYPES: &[&str] = &["error", "session_error", "agent_error"];

/// Semantic event kinds the bridge understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Incremental fragment of assistant output.
    Delta(String),
    /// Complete assistant message for the turn.
    FullMessage(String),
    /// Tool invocation or result, described for display.
    ToolActivity(String),
    /// The turn finished.
    Completion,
    /// The assistant reported a failure for this turn.
    Error(String),
    /// Unknown discriminator; carries any text we could extract.
    Unrecognized(Option<String>),
}

/// Map a raw event envelope to exactly one [`EventKind`].
///
/// Classification is by the first discriminator value (in key-alias order)
/// that names a known family. An unknown value under an earlier key does
/// not mask a recognized value under a later one.
pub fn classify(event: &Value) -> EventKind {
    let discriminators = extract_types(event);

    for discriminator in &discriminators {
        let folded = discriminator.to_lowercase();

        if matches_family(&folded, DELTA_TYPES) {
            return EventKind::Delta(extract_content(event).unwrap_or_default());
        }
        if matches_family(&folded, FULL_MESSAGE_TYPES) {
            return EventKind::FullMessage(extract_content(event).unwrap_or_default());
        }
        if matches_family(&folded, COMPLETION_TYPES) {
            return EventKind::Completion;
        }
        if matches_family(&folded, TOOL_TYPES) {
            let description = extract_content(event)
                .unwrap_or_else(|| tool_name(event).unwrap_or_else(|| discriminator.clone()));
            return EventKind::ToolActivity(description);
        }
        if matches_family(&folded, ERROR_TYPES) {
            let message = event
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| extract_content(event))
                .unwrap_or_else(|| "assistant reported an unspecified error".to_string());
            return EventKind::Error(message);
        }
    }

    match discriminators.first() {
        Some(first) => warn!("unrecognized event type '{first}'"),
        None => warn!("event without a recognizable type discriminator"),
    }
    EventKind::Unrecognized(extract_content(event))
}

fn matches_family(folded: &str, family: &[&str]) -> bool {
    family.iter().any(|name| folded == *name)
}

/// Collect the discriminator values under every key alias, in key order.
fn extract_types(event: &Value) -> Vec<String> {
    TYPE_KEYS
        .iter()
        .filter_map(|key| event.get(key).and_then(Value::as_str).map(str::to_string))
        .collect()
}

/// Probe the content key aliases in order. A content value may itself be an
/// object wrapping a `text` field (one historical schema), so descend one
/// level before giving up on it.
fn extract_content(event: &Value) -> Option<String> {
    for key in CONTENT_KEYS {
        match event.get(key) {
            Some(Value::String(text)) => return Some(text.clone()),
            Some(Value::Object(inner)) => {
                if let Some(Value::String(text)) = inner.get("text") {
                    return Some(text.clone());
                }
            }
            _ => {}
        }
    }
    None
}

fn tool_name(event: &Value) -> Option<String> {
    for key in ["tool_name", "toolName", "name", "tool"] {
        if let Some(name) = event.get(key).and_then(Value::as_str) {
            return Some(name.to_string());
        }
    }
    None
}
