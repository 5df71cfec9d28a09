//! API request handlers.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{info, instrument, warn};

use crate::bridge::TurnUpdate;
use crate::session::SessionInfo;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Body for both chat endpoints.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub reply: String,
}

/// Submit a prompt and wait for the full reply.
#[instrument(skip(state, request), fields(session_id = ?request.session_id))]
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Json<ChatResponse>> {
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }

    let reply = state
        .bridge
        .send_prompt(
            request.session_id.as_deref(),
            request.model.as_deref(),
            &request.message,
        )
        .await?;

    Ok(Json(ChatResponse {
        session_id: reply.session_id,
        reply: reply.reply,
    }))
}

/// Wire format of one server-sent event on the streaming chat endpoint.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    Chunk { content: String },
    Done { session_id: String },
    Error { message: String },
}

impl From<TurnUpdate> for StreamEvent {
    fn from(update: TurnUpdate) -> Self {
        match update {
            TurnUpdate::Chunk(content) => StreamEvent::Chunk { content },
            TurnUpdate::Completed { session_id } => StreamEvent::Done { session_id },
            TurnUpdate::Failed { message } => StreamEvent::Error { message },
        }
    }
}

/// Submit a prompt and stream the reply as server-sent events.
#[instrument(skip(state, request), fields(session_id = ?request.session_id))]
pub async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>> {
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }

    let (_, updates) = state
        .bridge
        .stream_prompt(
            request.session_id.as_deref(),
            request.model.as_deref(),
            &request.message,
        )
        .await?;

    let stream = ReceiverStream::new(updates).map(|update| {
        let event = StreamEvent::from(update);
        let data = match serde_json::to_string(&event) {
            Ok(data) => data,
            Err(err) => {
                warn!("failed to serialize stream event: {:?}", err);
                "{\"type\":\"error\",\"message\":\"serialization failed\"}".to_string()
            }
        };
        Ok(Event::default().data(data))
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

/// List live sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.bridge.registry().list())
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub model: Option<String>,
}

/// Create a session up front, without sending a prompt yet.
#[instrument(skip(state, request))]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionInfo>)> {
    let model = request
        .model
        .as_deref()
        .unwrap_or(&state.bridge.config().default_model);
    let session = state.bridge.registry().create_session(model).await?;
    Ok((StatusCode::CREATED, Json(session.info())))
}

/// Delete a session.
#[instrument(skip(state))]
pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    if !state.bridge.registry().delete(&session_id).await {
        return Err(crate::bridge::BridgeError::SessionNotFound(session_id).into());
    }
    info!(session_id = %session_id, "Session deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Serve one produced artifact as a download.
///
/// The filename is a single path segment; anything that could escape the
/// artifact directory is rejected outright.
#[instrument(skip(state))]
pub async fn download_artifact(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return Err(ApiError::bad_request("invalid filename"));
    }

    let path = state.artifacts_dir.join(&filename);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ApiError::not_found(format!("no such artifact: {filename}")))?;

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let disposition = format!("attachment; filename=\"{filename}\"");

    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    ))
}
