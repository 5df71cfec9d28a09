//! Assistant wire protocol types.
//!
//! The assistant runs as a subprocess speaking newline-delimited JSON on
//! stdin/stdout. Commands and responses are the stable part of the
//! protocol; events are deliberately left as raw envelopes because their
//! schema has drifted across assistant versions (see `bridge::classify`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw event envelope from the assistant. Never interpreted here.
pub type RawEvent = Value;

/// Parameters for creating an upstream assistant session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub model: String,
    pub streaming: bool,
    pub skill_dirs: Vec<String>,
}

/// Commands written to the assistant's stdin.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantCommand {
    /// Liveness probe.
    Ping,
    /// Create a new conversational session.
    NewSession {
        model: String,
        streaming: bool,
        #[serde(rename = "skillDirectories")]
        skill_directories: Vec<String>,
    },
    /// Submit a prompt to an existing session.
    Prompt { session: String, message: String },
    /// Release an upstream session.
    CloseSession { session: String },
}

/// Response to a command (correlated by request id).
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantResponse {
    #[serde(rename = "type")]
    pub response_type: String,
    pub success: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A line read from the assistant's stdout: a command response or an event.
#[derive(Debug, Clone)]
pub enum AssistantMessage {
    Response(AssistantResponse),
    Event(RawEvent),
}

impl AssistantMessage {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        if value.get("type").and_then(Value::as_str) == Some("response") {
            let response: AssistantResponse = serde_json::from_value(value)?;
            return Ok(AssistantMessage::Response(response));
        }
        Ok(AssistantMessage::Event(value))
    }
}

/// Extract the session tag of an event, trying the known key spellings.
pub fn event_session(event: &Value) -> Option<&str> {
    for key in ["session", "session_id", "sessionId"] {
        if let Some(session) = event.get(key).and_then(Value::as_str) {
            return Some(session);
        }
    }
    None
}
