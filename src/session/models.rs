//! Session data models.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::assistant::AssistantSession;

/// One conversational context held open against the assistant.
///
/// The upstream handle is allocated exactly once at creation and reused for
/// every subsequent turn on this session.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    /// Number of prompts routed through this session so far.
    pub message_count: u64,
    pub handle: Arc<dyn AssistantSession>,
}

impl Session {
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            model: self.model.clone(),
            created_at: self.created_at,
            message_count: self.message_count,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("created_at", &self.created_at)
            .field("message_count", &self.message_count)
            .finish_non_exhaustive()
    }
}

/// Serializable snapshot for listings and API responses.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub message_count: u64,
}
