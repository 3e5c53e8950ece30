//! Integration tests for the HTTP control plane

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use portfwd_api::{models::*, ApiServer, ApiServerConfig};
use portfwd_core::{ForwardingSession, SessionConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt; // For `oneshot` method

const SECRET: &str = "test-secret";

/// Helper to create a test router and keep a handle on its session
fn create_test_app() -> (Router, Arc<ForwardingSession>) {
    let session = Arc::new(ForwardingSession::new(SessionConfig {
        dial_timeout: Duration::from_secs(2),
        bind_attempts: 1,
        ..SessionConfig::default()
    }));
    let config = ApiServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        auth_secret: SECRET.to_string(),
        version: "test".to_string(),
    };

    let server = ApiServer::new(config, session.clone());
    (server.build_router(), session)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .uri(uri)
        .method("GET")
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

async fn summary(app: &Router) -> ServerSummary {
    let (status, body) = get(app, "/ServerSummary").await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_slice(&body).unwrap()
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_forward_work_requires_auth() {
    let (app, _session) = create_test_app();

    let (status, body) = get(&app, "/ForwardWork?status=0").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let response: ApiResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response, ApiResponse::error("request no auth"));

    let (status, body) = get(&app, "/ForwardWork?auth=wrong&status=0").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let response: ApiResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response, ApiResponse::error("request auth failed"));
}

#[tokio::test]
async fn test_forward_work_rejects_malformed_requests() {
    let (app, session) = create_test_app();

    let (status, body) = get(&app, &format!("/ForwardWork?auth={}", SECRET)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let response: ApiResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.code, 1);
    assert!(!response.msg.is_empty());

    let (status, _) = get(
        &app,
        &format!("/ForwardWork?auth={}&status=1&fromAddr=127.0.0.1:0", SECRET),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!session.snapshot().await.running);
}

#[tokio::test]
async fn test_unparsable_query_gets_json_envelope() {
    let (app, _session) = create_test_app();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/ForwardWork?auth={}&status=0&status=1", SECRET))
                .method("GET")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("application/json"), "{}", content_type);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let response: ApiResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.code, 1);
    assert!(response.msg.contains("status"), "{}", response.msg);
}

#[tokio::test]
async fn test_unparsable_form_body_is_rejected() {
    let (app, session) = create_test_app();

    let request = Request::builder()
        .uri(format!("/ForwardWork?auth={}", SECRET))
        .method("POST")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from("status=1&status=0"))
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let response: ApiResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.code, 1);
    assert!(!response.msg.is_empty());
    assert!(!session.snapshot().await.running);
}

#[tokio::test]
async fn test_post_without_body_uses_query() {
    let (app, _session) = create_test_app();

    let request = Request::builder()
        .uri(format!("/ForwardWork?auth={}&status=0", SECRET))
        .method("POST")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    let response: ApiResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response, ApiResponse::ok());
}

#[tokio::test]
async fn test_stop_when_idle_succeeds() {
    let (app, _session) = create_test_app();

    let (status, body) = get(&app, &format!("/ForwardWork?auth={}&status=0", SECRET)).await;
    assert_eq!(status, StatusCode::OK);
    let response: ApiResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response, ApiResponse::ok());
}

#[tokio::test]
async fn test_start_relay_and_stop_through_api() {
    let (app, _session) = create_test_app();

    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_addr = target.local_addr().unwrap();
    let source_port = free_port().await;
    let source_addr = format!("127.0.0.1:{}", source_port);

    let (status, body) = get(
        &app,
        &format!(
            "/ForwardWork?auth={}&status=1&fromAddr={}&toAddr={}",
            SECRET, source_addr, target_addr
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));

    let before = summary(&app).await;
    assert_eq!(before.forward_info, format!("{} - {}", source_addr, target_addr));
    assert_eq!(before.clients_count, 0);
    assert!(before.clients_list.is_none());

    let mut client = TcpStream::connect(&source_addr).await.unwrap();
    let (mut peer, _) = tokio::time::timeout(Duration::from_secs(5), target.accept())
        .await
        .unwrap()
        .unwrap();

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    let during = summary(&app).await;
    assert_eq!(during.clients_count, 1);
    assert_eq!(
        during.clients_list,
        Some(vec![client.local_addr().unwrap().to_string()])
    );
    assert_eq!(during.clients[0].target_addr, target_addr.to_string());

    let (status, _) = get(&app, &format!("/ForwardWork?auth={}&status=0", SECRET)).await;
    assert_eq!(status, StatusCode::OK);

    let after = summary(&app).await;
    assert_eq!(after.clients_count, 0);
    assert_eq!(after.forward_info, "");

    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_start_with_form_body() {
    let (app, session) = create_test_app();
    let target_port = free_port().await;

    let form = format!(
        "auth={}&status=1&fromAddr=127.0.0.1:0&toAddr=127.0.0.1:{}",
        SECRET, target_port
    );
    let request = Request::builder()
        .uri("/ForwardWork")
        .method("POST")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(form))
        .unwrap();

    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&body));
    assert!(session.snapshot().await.running);

    session.stop().await;
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let (app, session) = create_test_app();
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let occupied_addr = occupied.local_addr().unwrap();

    let (status, body) = get(
        &app,
        &format!(
            "/ForwardWork?auth={}&status=1&fromAddr={}&toAddr=127.0.0.1:9",
            SECRET, occupied_addr
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let response: ApiResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(response.code, 1);
    assert!(response.msg.contains("Failed to bind"));

    assert!(!session.snapshot().await.running);
    assert_eq!(summary(&app).await.forward_info, "");
}

#[tokio::test]
async fn test_health_and_openapi() {
    let (app, _session) = create_test_app();

    let (status, body) = get(&app, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.version, "test");
    assert!(!health.forwarding);

    let (status, body) = get(&app, "/api/openapi.json").await;
    assert_eq!(status, StatusCode::OK);
    let doc: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!(doc["paths"]["/ServerSummary"].is_object());
}
