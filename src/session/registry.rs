//! In-memory session registry.
//!
//! Maps public session identifiers to live upstream handles. All state is
//! process-local; restarting the server forgets every session.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::assistant::{AssistantClient, SessionSpec};
use crate::bridge::{BridgeError, BridgeResult};

use super::models::{Session, SessionInfo};

/// Settings for the registry itself, independent of the upstream client.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    /// Cap on concurrently live sessions. `None` means unlimited.
    pub max_sessions: Option<usize>,
    /// Skill directories passed through on session creation.
    pub skill_dirs: Vec<String>,
}

/// Registry of live sessions, keyed by public id.
pub struct SessionRegistry {
    client: Arc<dyn AssistantClient>,
    sessions: DashMap<String, Session>,
    config: RegistryConfig,
    /// Serializes creation so the cap check and the insert cannot
    /// interleave across concurrent callers.
    create_lock: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(client: Arc<dyn AssistantClient>, config: RegistryConfig) -> Self {
        Self {
            client,
            sessions: DashMap::new(),
            config,
            create_lock: Mutex::new(()),
        }
    }

    /// Make sure the upstream assistant is running and responsive.
    ///
    /// The assistant is started lazily on first use. A failed ping gets one
    /// restart attempt; a second failure surfaces as `UpstreamUnavailable`,
    /// which is not sticky. The next call retries from scratch.
    pub async fn ensure_upstream(&self) -> BridgeResult<()> {
        self.client
            .start()
            .await
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("{e:#}")))?;

        if let Err(first) = self.client.ping().await {
            warn!("assistant ping failed, restarting: {first:#}");
            let _ = self.client.stop().await;
            self.client
                .start()
                .await
                .map_err(|e| BridgeError::UpstreamUnavailable(format!("{e:#}")))?;
            self.client
                .ping()
                .await
                .map_err(|e| BridgeError::UpstreamUnavailable(format!("{e:#}")))?;
        }
        Ok(())
    }

    /// Create a fresh session against the given model.
    pub async fn create_session(&self, model: &str) -> BridgeResult<Session> {
        let _guard = self.create_lock.lock().await;

        if let Some(cap) = self.config.max_sessions {
            if self.sessions.len() >= cap {
                return Err(BridgeError::SessionLimitReached(self.sessions.len()));
            }
        }

        self.ensure_upstream().await?;

        let handle = self
            .client
            .create_session(SessionSpec {
                model: model.to_string(),
                streaming: true,
                skill_dirs: self.config.skill_dirs.clone(),
            })
            .await
            .map_err(|e| BridgeError::SessionCreationFailed(format!("{e:#}")))?;

        let session = Session {
            id: Uuid::new_v4().to_string(),
            model: model.to_string(),
            created_at: Utc::now(),
            message_count: 0,
            handle,
        };
        info!("session {} created (model {})", session.id, session.model);
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Resolve a session for the next turn.
    ///
    /// A known id bumps its message counter and reuses the existing handle.
    /// An unknown or absent id allocates exactly one new session.
    pub async fn get_or_create(
        &self,
        id: Option<&str>,
        model: &str,
    ) -> BridgeResult<Session> {
        if let Some(id) = id {
            if let Some(mut entry) = self.sessions.get_mut(id) {
                entry.message_count += 1;
                return Ok(entry.clone());
            }
            debug!("unknown session id {id}, allocating a new session");
        }
        let mut session = self.create_session(model).await?;
        if let Some(mut entry) = self.sessions.get_mut(&session.id) {
            entry.message_count += 1;
            session = entry.clone();
        }
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|entry| entry.clone())
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> =
            self.sessions.iter().map(|entry| entry.info()).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Delete a session, releasing its upstream handle best-effort.
    pub async fn delete(&self, id: &str) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        if let Err(e) = session.handle.destroy().await {
            warn!("failed to release upstream session {id}: {e:#}");
        }
        info!("session {id} deleted");
        true
    }

    /// Tear down all sessions and stop the assistant process.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.id.clone()).collect();
        for id in ids {
            self.delete(&id).await;
        }
        if let Err(e) = self.client.stop().await {
            warn!("assistant shutdown error: {e:#}");
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
