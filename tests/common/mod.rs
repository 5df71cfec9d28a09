//! Test utilities and common setup.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::Router;
use tempfile::TempDir;
use tokio::sync::{Mutex, mpsc};

use parley::api::{self, AppState};
use parley::assistant::{AssistantClient, AssistantSession, RawEvent, SessionSpec};
use parley::bridge::{BridgeConfig, BridgeService};
use parley::session::{RegistryConfig, SessionRegistry};

type ScriptQueue = Arc<Mutex<VecDeque<Vec<RawEvent>>>>;

/// Scripted assistant double.
///
/// Each prompt consumes the next batch of raw events from the script and
/// replays it as the turn's event stream, then closes the stream. A prompt
/// with no remaining script gets an empty stream (immediate end of turn).
pub struct MockAssistant {
    scripts: ScriptQueue,
    /// Files written during the next `send()`, before its event stream is
    /// returned. Simulates an assistant that starts producing output while
    /// the prompt command is still in flight.
    writes_on_send: Arc<Mutex<Vec<(PathBuf, Vec<u8>)>>>,
    sessions_created: AtomicUsize,
    fail_pings: AtomicUsize,
}

impl MockAssistant {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Arc::new(Mutex::new(VecDeque::new())),
            writes_on_send: Arc::new(Mutex::new(Vec::new())),
            sessions_created: AtomicUsize::new(0),
            fail_pings: AtomicUsize::new(0),
        })
    }

    pub async fn script_turn(&self, events: Vec<RawEvent>) {
        self.scripts.lock().await.push_back(events);
    }

    #[allow(dead_code)]
    pub async fn write_file_on_send(&self, path: PathBuf, contents: Vec<u8>) {
        self.writes_on_send.lock().await.push((path, contents));
    }

    /// Number of upstream sessions allocated so far.
    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    /// Make the next `n` pings fail.
    #[allow(dead_code)]
    pub fn fail_next_pings(&self, n: usize) {
        self.fail_pings.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl AssistantClient for MockAssistant {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let remaining = self.fail_pings.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_pings.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("scripted ping failure"));
        }
        Ok(())
    }

    async fn create_session(&self, _spec: SessionSpec) -> Result<Arc<dyn AssistantSession>> {
        let n = self.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            id: format!("upstream-{n}"),
            // Sessions share the client's queues so turn order is global.
            scripts: self.scripts.clone(),
            writes_on_send: self.writes_on_send.clone(),
        }))
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

struct MockSession {
    id: String,
    scripts: ScriptQueue,
    writes_on_send: Arc<Mutex<Vec<(PathBuf, Vec<u8>)>>>,
}

#[async_trait]
impl AssistantSession for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, _prompt: &str) -> Result<mpsc::Receiver<RawEvent>> {
        for (path, contents) in self.writes_on_send.lock().await.drain(..) {
            std::fs::write(&path, &contents)?;
        }
        let events = self.scripts.lock().await.pop_front().unwrap_or_default();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.send(event).await.ok();
        }
        Ok(rx)
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }
}

/// A fully wired test application over a scripted assistant.
pub struct TestHarness {
    pub app: Router,
    pub assistant: Arc<MockAssistant>,
    #[allow(dead_code)]
    pub bridge: Arc<BridgeService>,
    /// Owns the artifact directory for the test's lifetime.
    pub artifacts: TempDir,
}

pub fn test_harness() -> TestHarness {
    let assistant = MockAssistant::new();
    let artifacts = TempDir::new().expect("creating artifact tempdir");

    let registry = Arc::new(SessionRegistry::new(
        assistant.clone(),
        RegistryConfig::default(),
    ));
    let bridge = Arc::new(BridgeService::new(
        registry,
        BridgeConfig {
            turn_timeout: Duration::from_secs(2),
            artifact_settle: Duration::ZERO,
            artifacts_dir: artifacts.path().to_path_buf(),
            default_model: "test-model".to_string(),
        },
    ));

    let app = api::create_router(AppState::new(bridge.clone()));
    TestHarness {
        app,
        assistant,
        bridge,
        artifacts,
    }
}
