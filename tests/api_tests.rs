//! API integration tests.

use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use serde_json::{Value, json};
use tower::ServiceExt;

mod common;
use common::test_harness;

fn json_request(uri: &str, method: Method, body: Value) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .method(method)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let harness = test_harness();

    let response = harness
        .app
        .oneshot(
            Request::builder()
                .uri("/health")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_chat_roundtrip() {
    let harness = test_harness();
    harness
        .assistant
        .script_turn(vec![
            json!({"type": "assistant_message_delta", "content": "It is "}),
            json!({"type": "assistant_message_delta", "content": "noon."}),
            json!({"type": "session_idle"}),
        ])
        .await;

    let response = harness
        .app
        .oneshot(json_request(
            "/chat",
            Method::POST,
            json!({"message": "What time is it?"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["reply"], "It is noon.");
    assert!(json["session_id"].is_string());
}

#[tokio::test]
async fn test_chat_reuses_session() {
    let harness = test_harness();
    for _ in 0..2 {
        harness
            .assistant
            .script_turn(vec![
                json!({"type": "assistant_message_delta", "content": "ok, sure thing"}),
                json!({"type": "done"}),
            ])
            .await;
    }

    let response = harness
        .app
        .clone()
        .oneshot(json_request(
            "/chat",
            Method::POST,
            json!({"message": "first"}),
        ))
        .await
        .unwrap();
    let session_id = body_json(response).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = harness
        .app
        .oneshot(json_request(
            "/chat",
            Method::POST,
            json!({"message": "second", "session_id": session_id.clone()}),
        ))
        .await
        .unwrap();
    let json = body_json(response).await;

    assert_eq!(json["session_id"], session_id.as_str());
    assert_eq!(harness.assistant.sessions_created(), 1);
}

#[tokio::test]
async fn test_chat_strips_prompt_echo() {
    let harness = test_harness();
    harness
        .assistant
        .script_turn(vec![
            json!({"type": "assistant_message_delta", "content": "Hi"}),
            json!({"type": "assistant_message_delta", "content": " there!"}),
            json!({"type": "done"}),
        ])
        .await;

    let response = harness
        .app
        .oneshot(json_request("/chat", Method::POST, json!({"message": "Hi"})))
        .await
        .unwrap();

    let json = body_json(response).await;
    assert_eq!(json["reply"], "there!");
}

#[tokio::test]
async fn test_chat_empty_message_rejected() {
    let harness = test_harness();

    let response = harness
        .app
        .oneshot(json_request("/chat", Method::POST, json!({"message": "  "})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert_eq!(json["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_chat_upstream_error_is_bad_gateway() {
    let harness = test_harness();
    harness
        .assistant
        .script_turn(vec![json!({"type": "error", "error": "model exploded"})])
        .await;

    let response = harness
        .app
        .oneshot(json_request("/chat", Method::POST, json!({"message": "hi"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let json = body_json(response).await;
    assert_eq!(json["code"], "BAD_GATEWAY");
    assert!(json["error"].as_str().unwrap().contains("model exploded"));
}

#[tokio::test]
async fn test_chat_stream_content_type() {
    let harness = test_harness();
    harness
        .assistant
        .script_turn(vec![
            json!({"type": "assistant_message_delta", "content": "streamed reply"}),
            json!({"type": "done"}),
        ])
        .await;

    let response = harness
        .app
        .oneshot(json_request(
            "/chat/stream",
            Method::POST,
            json!({"message": "go"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();
    assert!(content_type.starts_with("text/event-stream"));

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("\"type\":\"chunk\""));
    assert!(text.contains("streamed reply"));
    assert!(text.contains("\"type\":\"done\""));
}

#[tokio::test]
async fn test_session_lifecycle() {
    let harness = test_harness();

    // Create
    let response = harness
        .app
        .clone()
        .oneshot(json_request("/sessions", Method::POST, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["model"], "test-model");
    assert_eq!(created["message_count"], 0);

    // List
    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed = body_json(response).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], id.as_str());

    // Delete
    let response = harness
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/sessions/{id}"))
                .method(Method::DELETE)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Delete again
    let response = harness
        .app
        .oneshot(
            Request::builder()
                .uri(format!("/sessions/{id}"))
                .method(Method::DELETE)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_artifact() {
    let harness = test_harness();
    std::fs::write(harness.artifacts.path().join("report.txt"), b"the goods").unwrap();

    let response = harness
        .app
        .oneshot(
            Request::builder()
                .uri("/download/report.txt")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    assert_eq!(&body[..], b"the goods");
}

#[tokio::test]
async fn test_download_missing_artifact() {
    let harness = test_harness();

    let response = harness
        .app
        .oneshot(
            Request::builder()
                .uri("/download/no-such-file.bin")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_rejects_traversal() {
    let harness = test_harness();

    let response = harness
        .app
        .oneshot(
            Request::builder()
                .uri("/download/..%2F..%2Fetc%2Fpasswd")
                .method(Method::GET)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
