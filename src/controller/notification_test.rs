#![allow(clippy::unwrap_used)] // Tests can use unwrap for brevity
#![allow(clippy::expect_used)] // Tests can use expect for better error messages

use super::*;
use crate::config::{BasicAuth, WebhookAuth};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::TimeZone;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct Received {
    calls: Arc<Mutex<Vec<(Option<String>, WebhookPayload)>>>,
}

async fn receive(
    State(received): State<Received>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    received.calls.lock().unwrap().push((auth, payload));
    StatusCode::OK
}

async fn start_receiver(received: Received) -> String {
    let app = Router::new()
        .route("/hook", post(receive))
        .route("/broken", post(|| async { StatusCode::INTERNAL_SERVER_ERROR }))
        .with_state(received);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn payload() -> WebhookPayload {
    WebhookPayload::new(
        &semver::Version::new(1, 31, 2),
        BTreeMap::from([("k8s".to_string(), "1.27".to_string())]),
        "https://github.com/deckhouse/deckhouse/releases/tag/v1.31.2".to_string(),
        Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap(),
    )
}

fn config(webhook: String, auth: Option<WebhookAuth>) -> NotificationConfig {
    NotificationConfig {
        webhook,
        minimal_notification_time: Duration::from_secs(3600),
        skip_tls_verify: false,
        auth,
    }
}

#[test]
fn test_payload_carries_minor_and_apply_time() {
    let payload = payload();

    assert_eq!(payload.version, "1.31");
    assert_eq!(payload.apply_time, "2026-01-05T12:00:00Z");
    assert_eq!(
        payload.message,
        "New Deckhouse Release 1.31 is available. Release will be applied at: 2026-01-05T12:00:00Z"
    );
    let json = serde_json::to_value(&payload).unwrap();
    assert!(json.get("changelogLink").is_some());
    assert!(json.get("applyTime").is_some());
}

#[tokio::test]
async fn test_webhook_posts_payload_with_bearer_token() {
    // ARRANGE
    let received = Received::default();
    let base = start_receiver(received.clone()).await;
    let auth = WebhookAuth {
        basic: None,
        bearer_token: Some("t0ken".to_string()),
    };

    // ACT
    WebhookNotifier::new(Duration::from_secs(5))
        .notify(&config(format!("{base}/hook"), Some(auth)), &payload())
        .await
        .unwrap();

    // ASSERT
    let calls = received.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0.as_deref(), Some("Bearer t0ken"));
    assert_eq!(calls[0].1, payload());
}

#[tokio::test]
async fn test_webhook_uses_basic_auth() {
    let received = Received::default();
    let base = start_receiver(received.clone()).await;
    let auth = WebhookAuth {
        basic: Some(BasicAuth {
            username: "user".to_string(),
            password: "secret".to_string(),
        }),
        bearer_token: None,
    };

    WebhookNotifier::new(Duration::from_secs(5))
        .notify(&config(format!("{base}/hook"), Some(auth)), &payload())
        .await
        .unwrap();

    let calls = received.calls.lock().unwrap();
    // base64("user:secret")
    assert_eq!(calls[0].0.as_deref(), Some("Basic dXNlcjpzZWNyZXQ="));
}

#[tokio::test]
async fn test_webhook_error_status_is_reported() {
    let base = start_receiver(Received::default()).await;

    let err = WebhookNotifier::new(Duration::from_secs(5))
        .notify(&config(format!("{base}/broken"), None), &payload())
        .await
        .unwrap_err();

    assert!(matches!(err, NotificationError::Status { status: 500, .. }));
}
