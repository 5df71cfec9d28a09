//! Assistant subprocess client.
//!
//! Manages communication with the assistant process over stdin/stdout
//! NDJSON. The process is shared by all sessions; events are routed to the
//! session they are tagged with.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};

use super::types::{
    AssistantCommand, AssistantMessage, AssistantResponse, RawEvent, SessionSpec, event_session,
};

/// Handle to one upstream conversational session.
#[async_trait]
pub trait AssistantSession: Send + Sync {
    /// Upstream identifier of this session.
    fn id(&self) -> &str;

    /// Submit a prompt; returns the ordered stream of raw events for the
    /// resulting turn. The stream ends when the upstream closes it.
    async fn send(&self, prompt: &str) -> Result<mpsc::Receiver<RawEvent>>;

    /// Release the upstream session.
    async fn destroy(&self) -> Result<()>;
}

/// Client boundary to the assistant process.
#[async_trait]
pub trait AssistantClient: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn ping(&self) -> Result<()>;
    async fn create_session(&self, spec: SessionSpec) -> Result<Arc<dyn AssistantSession>>;
    async fn stop(&self) -> Result<()>;
}

/// Configuration for the subprocess client.
#[derive(Debug, Clone)]
pub struct ProcessAssistantConfig {
    /// Assistant executable (e.g. "assistant" or an absolute path).
    pub executable: String,
    /// Extra arguments appended after the RPC-mode flag.
    pub args: Vec<String>,
    /// Working directory for the process, if any.
    pub workdir: Option<PathBuf>,
    /// Buffer size for the command channel.
    pub command_buffer_size: usize,
    /// Buffer size per session event channel.
    pub event_buffer_size: usize,
    /// How long to wait for a command response.
    pub response_timeout: Duration,
}

impl Default for ProcessAssistantConfig {
    fn default() -> Self {
        Self {
            executable: "assistant".to_string(),
            args: Vec::new(),
            workdir: None,
            command_buffer_size: 64,
            event_buffer_size: 256,
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared state of a running assistant process.
struct ProcessState {
    command_tx: mpsc::Sender<String>,
    /// Pending response receivers, keyed by request id.
    pending: RwLock<HashMap<String, oneshot::Sender<AssistantResponse>>>,
    /// Event routes, keyed by upstream session id. Replaced per turn.
    routes: RwLock<HashMap<String, mpsc::Sender<RawEvent>>>,
    request_counter: AtomicU64,
    child: Mutex<Child>,
}

/// [`AssistantClient`] backed by a long-running subprocess.
pub struct ProcessAssistant {
    config: ProcessAssistantConfig,
    state: Mutex<Option<Arc<ProcessState>>>,
}

impl ProcessAssistant {
    pub fn new(config: ProcessAssistantConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    async fn spawn_process(&self) -> Result<Arc<ProcessState>> {
        let mut cmd = Command::new(&self.config.executable);
        cmd.arg("--mode").arg("rpc");
        for arg in &self.config.args {
            cmd.arg(arg);
        }
        if let Some(ref workdir) = self.config.workdir {
            cmd.current_dir(workdir);
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| {
            format!("spawning assistant process '{}'", self.config.executable)
        })?;

        let stdin = child.stdin.take().context("assistant process has no stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("assistant process has no stdout")?;
        let stderr = child.stderr.take();

        let (command_tx, command_rx) = mpsc::channel::<String>(self.config.command_buffer_size);
        let state = Arc::new(ProcessState {
            command_tx,
            pending: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            request_counter: AtomicU64::new(0),
            child: Mutex::new(child),
        });

        tokio::spawn(stdin_writer_task(stdin, command_rx));
        tokio::spawn(stdout_reader_task(stdout, Arc::clone(&state)));
        if let Some(stderr) = stderr {
            tokio::spawn(stderr_reader_task(stderr));
        }

        info!("assistant process '{}' started", self.config.executable);
        Ok(state)
    }

    async fn state(&self) -> Result<Arc<ProcessState>> {
        let mut guard = self.state.lock().await;
        if let Some(ref state) = *guard {
            return Ok(Arc::clone(state));
        }
        let state = self.spawn_process().await?;
        *guard = Some(Arc::clone(&state));
        Ok(state)
    }

    async fn send_command(&self, command: AssistantCommand) -> Result<AssistantResponse> {
        let state = self.state().await?;
        send_command_on(&state, command, self.config.response_timeout).await
    }
}

async fn send_command_on(
    state: &Arc<ProcessState>,
    command: AssistantCommand,
    timeout: Duration,
) -> Result<AssistantResponse> {
    let request_id = format!(
        "req-{}",
        state.request_counter.fetch_add(1, Ordering::SeqCst) + 1
    );

    // Serialize to a Value first, then inject the request id.
    let mut value = serde_json::to_value(&command).context("serializing command")?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "id".to_string(),
            serde_json::Value::String(request_id.clone()),
        );
    }
    let json = serde_json::to_string(&value).context("stringifying command")?;

    let (response_tx, response_rx) = oneshot::channel();
    {
        let mut pending = state.pending.write().await;
        pending.insert(request_id.clone(), response_tx);
    }

    if state.command_tx.send(json).await.is_err() {
        let mut pending = state.pending.write().await;
        pending.remove(&request_id);
        anyhow::bail!("assistant process is not accepting commands");
    }

    let response = tokio::time::timeout(timeout, response_rx)
        .await
        .context("timeout waiting for assistant response")?
        .context("assistant response channel closed")?;
    Ok(response)
}

#[async_trait]
impl AssistantClient for ProcessAssistant {
    async fn start(&self) -> Result<()> {
        self.state().await.map(|_| ())
    }

    async fn ping(&self) -> Result<()> {
        let response = self.send_command(AssistantCommand::Ping).await?;
        if !response.success {
            anyhow::bail!(
                "assistant ping failed: {}",
                response.error.unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(())
    }

    async fn create_session(&self, spec: SessionSpec) -> Result<Arc<dyn AssistantSession>> {
        let response = self
            .send_command(AssistantCommand::NewSession {
                model: spec.model.clone(),
                streaming: spec.streaming,
                skill_directories: spec.skill_dirs.clone(),
            })
            .await?;
        if !response.success {
            anyhow::bail!(
                "assistant refused session: {}",
                response.error.unwrap_or_else(|| "unknown".to_string())
            );
        }

        let data = response.data.context("new_session returned no data")?;
        let upstream_id = data
            .get("session")
            .or_else(|| data.get("id"))
            .and_then(serde_json::Value::as_str)
            .context("new_session response missing session id")?
            .to_string();

        debug!("created upstream session {} (model {})", upstream_id, spec.model);

        let state = self.state().await?;
        Ok(Arc::new(ProcessSession {
            upstream_id,
            state,
            event_buffer_size: self.config.event_buffer_size,
            response_timeout: self.config.response_timeout,
        }))
    }

    async fn stop(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        let Some(state) = guard.take() else {
            return Ok(());
        };
        let mut child = state.child.lock().await;
        if let Err(e) = child.start_kill() {
            warn!("failed to stop assistant process: {:?}", e);
        }
        let _ = child.wait().await;
        info!("assistant process stopped");
        Ok(())
    }
}

/// [`AssistantSession`] bound to one upstream session of the shared process.
struct ProcessSession {
    upstream_id: String,
    state: Arc<ProcessState>,
    event_buffer_size: usize,
    response_timeout: Duration,
}

#[async_trait]
impl AssistantSession for ProcessSession {
    fn id(&self) -> &str {
        &self.upstream_id
    }

    async fn send(&self, prompt: &str) -> Result<mpsc::Receiver<RawEvent>> {
        let (event_tx, event_rx) = mpsc::channel(self.event_buffer_size);
        {
            // A new turn replaces any stale route from a previous turn.
            let mut routes = self.state.routes.write().await;
            routes.insert(self.upstream_id.clone(), event_tx);
        }

        let response = send_command_on(
            &self.state,
            AssistantCommand::Prompt {
                session: self.upstream_id.clone(),
                message: prompt.to_string(),
            },
            self.response_timeout,
        )
        .await?;
        if !response.success {
            let mut routes = self.state.routes.write().await;
            routes.remove(&self.upstream_id);
            anyhow::bail!(
                "assistant rejected prompt: {}",
                response.error.unwrap_or_else(|| "unknown".to_string())
            );
        }

        Ok(event_rx)
    }

    async fn destroy(&self) -> Result<()> {
        {
            let mut routes = self.state.routes.write().await;
            routes.remove(&self.upstream_id);
        }
        let response = send_command_on(
            &self.state,
            AssistantCommand::CloseSession {
                session: self.upstream_id.clone(),
            },
            self.response_timeout,
        )
        .await?;
        if !response.success {
            anyhow::bail!(
                "assistant failed to close session {}: {}",
                self.upstream_id,
                response.error.unwrap_or_else(|| "unknown".to_string())
            );
        }
        Ok(())
    }
}

async fn stdin_writer_task(
    mut stdin: tokio::process::ChildStdin,
    mut command_rx: mpsc::Receiver<String>,
) {
    while let Some(command) = command_rx.recv().await {
        let line = format!("{}\n", command);
        // Truncate for logging on char boundaries.
        let display: String = command.chars().take(200).collect();
        debug!("sending to assistant: {}", display);
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!("failed to write to assistant stdin: {:?}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!("failed to flush assistant stdin: {:?}", e);
            break;
        }
    }
    debug!("assistant stdin writer task ended");
}

async fn stdout_reader_task(stdout: tokio::process::ChildStdout, state: Arc<ProcessState>) {
    let reader = BufReader::new(stdout);
    let mut lines = reader.lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match AssistantMessage::parse(&line) {
            Ok(AssistantMessage::Response(response)) => {
                let Some(ref id) = response.id else {
                    warn!("assistant response without request id");
                    continue;
                };
                let sender = {
                    let mut pending = state.pending.write().await;
                    pending.remove(id)
                };
                match sender {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => warn!("response for unknown request id {}", id),
                }
            }
            Ok(AssistantMessage::Event(event)) => {
                let Some(session) = event_session(&event).map(str::to_string) else {
                    debug!("event without session tag, dropping");
                    continue;
                };
                let route = {
                    let routes = state.routes.read().await;
                    routes.get(&session).cloned()
                };
                match route {
                    Some(tx) => {
                        if tx.send(event).await.is_err() {
                            // Receiver gone: the turn already terminated.
                            let mut routes = state.routes.write().await;
                            routes.remove(&session);
                        }
                    }
                    None => debug!("event for session {} with no active turn", session),
                }
            }
            Err(e) => {
                let display: String = line.chars().take(200).collect();
                warn!("unparseable assistant output: {:?}, line: {}", e, display);
            }
        }
    }

    // Process went away: fail all waiters so callers see UpstreamUnavailable
    // instead of hanging until their timeout.
    let mut pending = state.pending.write().await;
    pending.clear();
    let mut routes = state.routes.write().await;
    routes.clear();
    warn!("assistant stdout closed");
}

async fn stderr_reader_task(stderr: tokio::process::ChildStderr) {
    let reader = BufReader::new(stderr);
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!("assistant stderr: {}", line);
        }
    }
}
