#[path = "common/mod.rs"]
mod common;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use http_body::Frame;
use http_body_util::StreamBody;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tokio_stream::iter;

async fn post_json(base: &str, body: &Value) -> reqwest::Response {
    Client::new()
        .post(format!("{}/sendMessage", base))
        .header("x-forwarded-for", "198.51.100.4")
        .json(body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn relays_message_and_mints_identifiers() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(RecordingModel::default());
    let state = stub_state(&test_config(), dir.path(), Some(model.clone()), None, None);
    let (base, handle) = spawn_app(state).await;

    let first: Value = post_json(&base, &json!({"message": "hi"})).await.json().await.unwrap();
    let second: Value = post_json(&base, &json!({"message": "hi"})).await.json().await.unwrap();

    assert_eq!(first["ok"], true);
    assert_eq!(first["response"], "answer to 2 chars");
    let s1 = first["session_id"].as_str().unwrap();
    let s2 = second["session_id"].as_str().unwrap();
    assert!(!s1.is_empty());
    assert_ne!(s1, s2);
    assert!(!first["conversation_id"].as_str().unwrap().is_empty());
    assert_eq!(model.inputs(), vec!["hi", "hi"]);
    handle.abort();
}

#[tokio::test]
async fn caller_identifiers_are_passed_through() {
    let dir = tempfile::tempdir().unwrap();
    let state = stub_state(
        &test_config(),
        dir.path(),
        Some(Arc::new(RecordingModel::default())),
        None,
        None,
    );
    let (base, handle) = spawn_app(state).await;

    let resp = Client::new()
        .post(format!("{}/sendMessage", base))
        .header("x-session-id", "sess-42")
        .json(&json!({"message": "  hello  ", "conversation_id": "conv-7"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["session_id"], "sess-42");
    assert_eq!(body["conversation_id"], "conv-7");
    assert_eq!(body["response"], "answer to 5 chars");
    handle.abort();
}

#[tokio::test]
async fn non_json_content_type_is_415_and_logged() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(RecordingModel::default());
    let state = stub_state(&test_config(), dir.path(), Some(model.clone()), None, None);
    let (base, handle) = spawn_app(state).await;

    let resp = Client::new()
        .post(format!("{}/sendMessage", base))
        .header("content-type", "text/plain")
        .header("x-forwarded-for", "203.0.113.9")
        .body(r#"{"message":"hi"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"ok": false, "error": "unsupported_media_type"}));
    assert!(model.inputs().is_empty());

    let records = security_records(dir.path());
    let events = records_of_kind(&records, "unsupported_media_type");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["clientIp"], "203.0.113.9");
    assert_eq!(events[0]["sessionId"], "-");
    handle.abort();
}

#[tokio::test]
async fn blank_message_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let state = stub_state(
        &test_config(),
        dir.path(),
        Some(Arc::new(RecordingModel::default())),
        None,
        None,
    );
    let (base, handle) = spawn_app(state).await;

    let resp = post_json(&base, &json!({"message": "   "})).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "empty_message");
    assert_eq!(records_of_kind(&security_records(dir.path()), "empty_message").len(), 1);
    handle.abort();
}

#[tokio::test]
async fn malformed_json_is_400() {
    let dir = tempfile::tempdir().unwrap();
    let state = stub_state(
        &test_config(),
        dir.path(),
        Some(Arc::new(RecordingModel::default())),
        None,
        None,
    );
    let (base, handle) = spawn_app(state).await;

    let resp = Client::new()
        .post(format!("{}/sendMessage", base))
        .header("content-type", "application/json")
        .body("{\"message\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "malformed_json");
    assert_eq!(records_of_kind(&security_records(dir.path()), "malformed_json").len(), 1);
    handle.abort();
}

#[tokio::test]
async fn declared_oversized_body_is_413() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.max_request_bytes = 256;
    let state = stub_state(
        &config,
        dir.path(),
        Some(Arc::new(RecordingModel::default())),
        None,
        None,
    );
    let (base, handle) = spawn_app(state).await;

    let resp = post_json(&base, &json!({"message": "X".repeat(2048)})).await;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"ok": false, "error": "payload_too_large"}));

    let records = security_records(dir.path());
    let events = records_of_kind(&records, "payload_too_large");
    assert_eq!(events.len(), 1);
    assert!(events[0]["detail"].as_str().unwrap().contains("limit 256"));
    assert_eq!(events[0]["level"], "WARN");
    handle.abort();
}

#[tokio::test]
async fn chunked_payload_over_limit_is_413() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.max_request_bytes = 256;
    let state = stub_state(
        &config,
        dir.path(),
        Some(Arc::new(RecordingModel::default())),
        None,
        None,
    );
    let (base, handle) = spawn_app(state).await;

    let payload = json!({"message": "X".repeat(2048)}).to_string();
    let chunks: Vec<_> = payload
        .as_bytes()
        .chunks(128)
        .map(Bytes::copy_from_slice)
        .collect();
    let stream = iter(
        chunks
            .into_iter()
            .map(|chunk| Ok::<_, Infallible>(Frame::data(chunk))),
    );
    let body = reqwest::Body::wrap(StreamBody::new(stream));

    let resp = Client::new()
        .post(format!("{}/sendMessage", base))
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "payload_too_large");
    handle.abort();
}

#[tokio::test]
async fn missing_model_is_generic_500() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RecordingStore::default());
    let state = stub_state(&test_config(), dir.path(), None, Some(store.clone()), None);
    let (base, handle) = spawn_app(state).await;

    let resp = post_json(&base, &json!({"message": "hi"})).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"ok": false, "error": "service_unavailable"}));
    assert!(store.records().is_empty());
    handle.abort();
}

#[tokio::test]
async fn no_retrieval_sources_is_generic_500() {
    let dir = tempfile::tempdir().unwrap();
    let config = chatrelay::AppConfig::default();
    let state = stub_state(
        &config,
        dir.path(),
        Some(Arc::new(RecordingModel::default())),
        None,
        None,
    );
    let (base, handle) = spawn_app(state).await;

    let resp = post_json(&base, &json!({"message": "hi"})).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let text = resp.text().await.unwrap();
    assert!(!text.contains("retrieval"));
    handle.abort();
}

#[tokio::test]
async fn model_failure_is_500_without_detail() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RecordingStore::default());
    let state = stub_state(
        &test_config(),
        dir.path(),
        Some(Arc::new(FailingModel)),
        Some(store.clone()),
        None,
    );
    let (base, handle) = spawn_app(state).await;

    let resp = post_json(&base, &json!({"message": "hi"})).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let text = resp.text().await.unwrap();
    assert!(!text.contains("502"));
    assert!(text.contains("service_unavailable"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.records().is_empty());
    handle.abort();
}

#[tokio::test]
async fn model_timeout_is_500() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.model.timeout = Duration::from_millis(50);
    let state = stub_state(
        &config,
        dir.path(),
        Some(Arc::new(RecordingModel::slow(Duration::from_secs(5)))),
        None,
        None,
    );
    let (base, handle) = spawn_app(state).await;

    let started = std::time::Instant::now();
    let resp = post_json(&base, &json!({"message": "hi"})).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(started.elapsed() < Duration::from_secs(4));
    handle.abort();
}

#[tokio::test]
async fn health_reports_model_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let configured = stub_state(
        &test_config(),
        dir.path(),
        Some(Arc::new(RecordingModel::default())),
        None,
        None,
    );
    let (base, handle) = spawn_app(configured).await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        body,
        json!({"ok": true, "status": "healthy", "modelConfigured": true})
    );
    handle.abort();

    let bare = stub_state(&test_config(), dir.path(), None, None, None);
    let (base, handle) = spawn_app(bare).await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["modelConfigured"], false);
    assert!(security_records(dir.path()).is_empty());
    handle.abort();
}

#[tokio::test]
async fn metrics_expose_counters() {
    let dir = tempfile::tempdir().unwrap();
    let state = stub_state(
        &test_config(),
        dir.path(),
        Some(Arc::new(RecordingModel::default())),
        None,
        None,
    );
    let (base, handle) = spawn_app(state).await;

    post_json(&base, &json!({"message": "hi"})).await;
    post_json(&base, &json!({"message": ""})).await;

    let resp = reqwest::get(format!("{}/metrics", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let text = resp.text().await.unwrap();
    assert!(text.contains("chatrelay_requests_total 2"));
    assert!(text.contains("chatrelay_rejected_total 1"));
    assert!(text.contains("chatrelay_completed_total 1"));
    assert!(text.contains("chatrelay_security_events_total 1"));
    assert!(text.contains("chatrelay_rate_tracked_clients 1"));
    assert!(text.contains("chatrelay_request_latency_ms_count 2"));
    assert!(text.contains("# TYPE chatrelay_build_info gauge"));
    handle.abort();
}

#[tokio::test]
async fn cors_allows_configured_origin_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.allowed_origins = Some(vec!["https://hotel.example".to_string()]);
    let state = stub_state(
        &config,
        dir.path(),
        Some(Arc::new(RecordingModel::default())),
        None,
        None,
    );
    let (base, handle) = spawn_app(state).await;

    let client = Client::new();
    let allowed = client
        .get(format!("{}/health", base))
        .header("origin", "https://hotel.example")
        .send()
        .await
        .unwrap();
    assert_eq!(
        allowed
            .headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("https://hotel.example")
    );

    let denied = client
        .get(format!("{}/health", base))
        .header("origin", "https://evil.example")
        .send()
        .await
        .unwrap();
    assert!(denied.headers().get("access-control-allow-origin").is_none());
    handle.abort();
}
