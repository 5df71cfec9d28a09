//! Turn orchestration.
//!
//! One prompt submission is one "turn": the bridge resolves a session,
//! forwards the prompt upstream, and drives the raw event stream through
//! classification, echo filtering, artifact watching, and completion
//! detection until the turn reaches exactly one terminal update.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::assistant::RawEvent;
use crate::session::SessionRegistry;

use super::artifacts::ArtifactWatcher;
use super::classify::{EventKind, classify};
use super::completion::CompletionGate;
use super::echo::EchoFilter;
use super::error::{BridgeError, BridgeResult};

/// Tuning knobs for turn handling.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Safety timeout ending a turn when the upstream never signals
    /// completion.
    pub turn_timeout: Duration,
    /// Delay between noticing a new artifact and confirming its size.
    pub artifact_settle: Duration,
    /// Directory the assistant writes produced files into.
    pub artifacts_dir: PathBuf,
    /// Model used when the caller does not name one.
    pub default_model: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            turn_timeout: Duration::from_secs(120),
            artifact_settle: Duration::from_millis(500),
            artifacts_dir: PathBuf::from("artifacts"),
            default_model: "default".to_string(),
        }
    }
}

/// Updates emitted over a turn's output channel.
///
/// Every turn yields zero or more `Chunk`s followed by exactly one terminal
/// update (`Completed` or `Failed`), after which the channel closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnUpdate {
    /// A piece of displayable output.
    Chunk(String),
    /// The turn finished normally.
    Completed { session_id: String },
    /// The turn failed; the message is suitable for display.
    Failed { message: String },
}

/// Aggregated result of a non-streaming turn.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub session_id: String,
    pub reply: String,
}

/// The session/event bridge: resolves sessions and runs turns.
pub struct BridgeService {
    registry: Arc<SessionRegistry>,
    config: BridgeConfig,
}

impl BridgeService {
    pub fn new(registry: Arc<SessionRegistry>, config: BridgeConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start a turn and stream its updates.
    ///
    /// Returns the resolved session id together with the update channel. The
    /// turn keeps running in a background task; dropping the receiver cancels
    /// delivery (the upstream session itself is unaffected).
    pub async fn stream_prompt(
        &self,
        session_id: Option<&str>,
        model: Option<&str>,
        message: &str,
    ) -> BridgeResult<(String, mpsc::Receiver<TurnUpdate>)> {
        let model = model.unwrap_or(&self.config.default_model);
        let session = self.registry.get_or_create(session_id, model).await?;

        // Snapshot the artifact directory before the prompt goes upstream,
        // so files the assistant writes while the send is in flight still
        // count as produced by this turn.
        if let Err(e) = tokio::fs::create_dir_all(&self.config.artifacts_dir).await {
            warn!(
                "cannot create artifact directory {}: {e}",
                self.config.artifacts_dir.display()
            );
        }
        let artifacts =
            match ArtifactWatcher::start(&self.config.artifacts_dir, self.config.artifact_settle)
                .await
            {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!("artifact watching disabled for this turn: {e:#}");
                    None
                }
            };

        let events = session
            .handle
            .send(message)
            .await
            .map_err(|e| BridgeError::Upstream(format!("{e:#}")))?;

        let (tx, rx) = mpsc::channel(64);
        let turn = Turn {
            session_id: session.id.clone(),
            prompt: message.to_string(),
            timeout: self.config.turn_timeout,
        };
        tokio::spawn(run_turn(turn, events, artifacts, tx));

        Ok((session.id, rx))
    }

    /// Run a turn to completion and return the aggregated reply.
    pub async fn send_prompt(
        &self,
        session_id: Option<&str>,
        model: Option<&str>,
        message: &str,
    ) -> BridgeResult<ChatReply> {
        let (session_id, mut rx) = self.stream_prompt(session_id, model, message).await?;

        let mut reply = String::new();
        while let Some(update) = rx.recv().await {
            match update {
                TurnUpdate::Chunk(text) => reply.push_str(&text),
                TurnUpdate::Completed { .. } => {
                    return Ok(ChatReply { session_id, reply });
                }
                TurnUpdate::Failed { message } => {
                    return Err(BridgeError::Upstream(message));
                }
            }
        }
        // Channel closed without a terminal update: the turn task died.
        Err(BridgeError::Upstream(
            "turn ended without a completion signal".to_string(),
        ))
    }
}

struct Turn {
    session_id: String,
    prompt: String,
    timeout: Duration,
}

/// Drive one turn's event stream until a single terminal update.
async fn run_turn(
    turn: Turn,
    mut events: mpsc::Receiver<RawEvent>,
    mut artifacts: Option<ArtifactWatcher>,
    tx: mpsc::Sender<TurnUpdate>,
) {
    let gate = CompletionGate::new();
    let mut echo = EchoFilter::new(&turn.prompt);
    let mut saw_delta = false;

    let deadline = tokio::time::sleep(turn.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => {
                        let terminal = handle_event(
                            &event, &mut echo, &mut saw_delta, &turn, &gate, &tx,
                        )
                        .await;
                        match terminal {
                            Flow::Continue => {}
                            Flow::Finish(outcome) => {
                                finish_turn(&turn, &mut echo, artifacts.as_mut(), &tx, outcome)
                                    .await;
                                return;
                            }
                            Flow::ReceiverGone => return,
                        }
                    }
                    None => {
                        // Upstream closed the event stream without a
                        // completion event. Treat it as a quiet finish.
                        if gate.try_complete() {
                            debug!("turn on {} ended by upstream eof", turn.session_id);
                            finish_turn(&turn, &mut echo, artifacts.as_mut(), &tx, Outcome::Completed)
                                .await;
                        }
                        return;
                    }
                }
            }
            _ = wait_for_change(&mut artifacts) => {
                if let Some(watcher) = artifacts.as_mut() {
                    for notice in watcher.poll_new().await {
                        if tx.send(TurnUpdate::Chunk(notice.chunk())).await.is_err() {
                            return;
                        }
                    }
                }
            }
            _ = &mut deadline => {
                if gate.try_complete() {
                    info!(
                        "turn on {} hit the {}s safety timeout, completing",
                        turn.session_id,
                        turn.timeout.as_secs()
                    );
                    finish_turn(&turn, &mut echo, artifacts.as_mut(), &tx, Outcome::Completed)
                        .await;
                }
                return;
            }
        }
    }
}

enum Flow {
    Continue,
    Finish(Outcome),
    ReceiverGone,
}

enum Outcome {
    Completed,
    Failed(String),
}

async fn handle_event(
    event: &RawEvent,
    echo: &mut EchoFilter,
    saw_delta: &mut bool,
    turn: &Turn,
    gate: &CompletionGate,
    tx: &mpsc::Sender<TurnUpdate>,
) -> Flow {
    match classify(event) {
        EventKind::Delta(text) => {
            *saw_delta = true;
            if let Some(out) = echo.push(&text) {
                if tx.send(TurnUpdate::Chunk(out)).await.is_err() {
                    return Flow::ReceiverGone;
                }
            }
        }
        EventKind::FullMessage(text) => {
            // When deltas already streamed the answer, the trailing full
            // message is a duplicate and is dropped.
            if !*saw_delta {
                let stripped = EchoFilter::strip_full(&turn.prompt, &text);
                if !stripped.is_empty()
                    && tx.send(TurnUpdate::Chunk(stripped)).await.is_err()
                {
                    return Flow::ReceiverGone;
                }
            }
        }
        EventKind::ToolActivity(description) => {
            let chunk = format!("\n[tool] {description}\n");
            if tx.send(TurnUpdate::Chunk(chunk)).await.is_err() {
                return Flow::ReceiverGone;
            }
        }
        EventKind::Completion => {
            if gate.try_complete() {
                return Flow::Finish(Outcome::Completed);
            }
        }
        EventKind::Error(message) => {
            if gate.try_error() {
                return Flow::Finish(Outcome::Failed(message));
            }
        }
        EventKind::Unrecognized(Some(text)) => {
            // Unknown shape but it carried text; better shown than dropped.
            *saw_delta = true;
            if let Some(out) = echo.push(&text) {
                if tx.send(TurnUpdate::Chunk(out)).await.is_err() {
                    return Flow::ReceiverGone;
                }
            }
        }
        EventKind::Unrecognized(None) => {
            debug!("dropping event with no usable payload on {}", turn.session_id);
        }
    }
    Flow::Continue
}

/// Emit everything still pending, then the terminal update.
async fn finish_turn(
    turn: &Turn,
    echo: &mut EchoFilter,
    artifacts: Option<&mut ArtifactWatcher>,
    tx: &mpsc::Sender<TurnUpdate>,
    outcome: Outcome,
) {
    if let Some(withheld) = echo.flush() {
        if tx.send(TurnUpdate::Chunk(withheld)).await.is_err() {
            return;
        }
    }
    // One last poll so artifacts written just before completion still get
    // announced.
    if let Some(watcher) = artifacts {
        for notice in watcher.poll_new().await {
            if tx.send(TurnUpdate::Chunk(notice.chunk())).await.is_err() {
                return;
            }
        }
    }
    let update = match outcome {
        Outcome::Completed => TurnUpdate::Completed {
            session_id: turn.session_id.clone(),
        },
        Outcome::Failed(message) => TurnUpdate::Failed { message },
    };
    let _ = tx.send(update).await;
}

async fn wait_for_change(artifacts: &mut Option<ArtifactWatcher>) {
    match artifacts {
        Some(watcher) => watcher.changed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_turn(prompt: &str, timeout: Duration) -> Turn {
        Turn {
            session_id: "s-test".to_string(),
            prompt: prompt.to_string(),
            timeout,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<TurnUpdate>) -> Vec<TurnUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn streams_deltas_and_completes() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(16);

        for event in [
            json!({"type": "assistant_message_delta", "content": "Hello"}),
            json!({"type": "assistant_message_delta", "content": " world"}),
            json!({"type": "session_idle"}),
        ] {
            event_tx.send(event).await.unwrap();
        }
        drop(event_tx);

        run_turn(test_turn("ping", Duration::from_secs(5)), event_rx, None, tx).await;

        let updates = drain(rx).await;
        assert_eq!(
            updates,
            vec![
                TurnUpdate::Chunk("Hello".to_string()),
                TurnUpdate::Chunk(" world".to_string()),
                TurnUpdate::Completed {
                    session_id: "s-test".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn eof_without_completion_event_still_completes() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(16);

        event_tx
            .send(json!({"type": "message_delta", "delta": "partial"}))
            .await
            .unwrap();
        drop(event_tx);

        run_turn(test_turn("x", Duration::from_secs(5)), event_rx, None, tx).await;

        let updates = drain(rx).await;
        assert_eq!(
            updates.last(),
            Some(&TurnUpdate::Completed {
                session_id: "s-test".to_string()
            })
        );
    }

    #[tokio::test]
    async fn silent_upstream_hits_safety_timeout() {
        let (_event_tx, event_rx) = mpsc::channel::<RawEvent>(16);
        let (tx, rx) = mpsc::channel(16);

        // The sender stays alive but never speaks; only the timeout can end
        // this turn.
        run_turn(
            test_turn("anyone there", Duration::from_millis(50)),
            event_rx,
            None,
            tx,
        )
        .await;

        let updates = drain(rx).await;
        assert_eq!(updates.len(), 1);
        assert_eq!(
            updates[0],
            TurnUpdate::Completed {
                session_id: "s-test".to_string()
            }
        );
    }

    #[tokio::test]
    async fn error_event_fails_the_turn() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(16);

        for event in [
            json!({"type": "error", "error": "model exploded"}),
            // Late completion after the error must not produce a second
            // terminal update.
            json!({"type": "done"}),
        ] {
            event_tx.send(event).await.unwrap();
        }
        drop(event_tx);

        run_turn(test_turn("x", Duration::from_secs(5)), event_rx, None, tx).await;

        let updates = drain(rx).await;
        assert_eq!(
            updates,
            vec![TurnUpdate::Failed {
                message: "model exploded".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn echo_is_withheld_then_remainder_streams() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(16);

        for content in ["Hi", " there", "!"] {
            event_tx
                .send(json!({"type": "assistant_message_delta", "content": content}))
                .await
                .unwrap();
        }
        event_tx.send(json!({"type": "turn_end"})).await.unwrap();
        drop(event_tx);

        run_turn(test_turn("Hi", Duration::from_secs(5)), event_rx, None, tx).await;

        let updates = drain(rx).await;
        assert_eq!(
            updates,
            vec![
                TurnUpdate::Chunk("there".to_string()),
                TurnUpdate::Chunk("!".to_string()),
                TurnUpdate::Completed {
                    session_id: "s-test".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn full_message_is_dropped_after_deltas() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(16);

        for event in [
            json!({"type": "assistant_message_delta", "content": "streamed"}),
            json!({"type": "assistant_message", "content": "streamed"}),
            json!({"type": "done"}),
        ] {
            event_tx.send(event).await.unwrap();
        }
        drop(event_tx);

        run_turn(test_turn("q", Duration::from_secs(5)), event_rx, None, tx).await;

        let chunks: Vec<_> = drain(rx)
            .await
            .into_iter()
            .filter(|u| matches!(u, TurnUpdate::Chunk(_)))
            .collect();
        assert_eq!(chunks, vec![TurnUpdate::Chunk("streamed".to_string())]);
    }

    #[tokio::test]
    async fn full_message_without_deltas_is_forwarded_stripped() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(16);

        for event in [
            json!({"type": "assistant_message", "content": "What is 2+2? It is 4."}),
            json!({"type": "done"}),
        ] {
            event_tx.send(event).await.unwrap();
        }
        drop(event_tx);

        run_turn(
            test_turn("What is 2+2?", Duration::from_secs(5)),
            event_rx,
            None,
            tx,
        )
        .await;

        let updates = drain(rx).await;
        assert_eq!(updates[0], TurnUpdate::Chunk("It is 4.".to_string()));
    }

    #[tokio::test]
    async fn completion_poll_announces_new_artifacts() {
        let dir = tempfile::TempDir::new().unwrap();
        let watcher = ArtifactWatcher::start(dir.path(), Duration::ZERO)
            .await
            .unwrap();
        // Written after the snapshot, so it counts as produced this turn.
        std::fs::write(dir.path().join("out.csv"), b"a,b,c").unwrap();

        let (event_tx, event_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(16);
        event_tx.send(json!({"type": "done"})).await.unwrap();
        drop(event_tx);

        run_turn(
            test_turn("make a csv", Duration::from_secs(5)),
            event_rx,
            Some(watcher),
            tx,
        )
        .await;

        let updates = drain(rx).await;
        let text: String = updates
            .iter()
            .filter_map(|u| match u {
                TurnUpdate::Chunk(c) => Some(c.as_str()),
                _ => None,
            })
            .collect();
        assert!(text.contains("New file: out.csv (5 bytes)"));
        assert!(text.contains("/download/out.csv"));
    }

    #[tokio::test]
    async fn tool_activity_is_announced() {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (tx, rx) = mpsc::channel(16);

        for event in [
            json!({"type": "tool_use", "tool_name": "write_file"}),
            json!({"type": "done"}),
        ] {
            event_tx.send(event).await.unwrap();
        }
        drop(event_tx);

        run_turn(test_turn("make a file", Duration::from_secs(5)), event_rx, None, tx).await;

        let updates = drain(rx).await;
        assert_eq!(
            updates[0],
            TurnUpdate::Chunk("\n[tool] write_file\n".to_string())
        );
    }
}
