//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to test Axum routes without a real HTTP server.
//! The driver runs against the in-memory store, ledger and continuation
//! queue, so no database is needed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use reqwest::Url;
use tower::ServiceExt;
use uuid::Uuid;

use cadence_api::middleware::auth::{SERVICE_ROLE, encode_jwt};
use cadence_api::routes::create_router;
use cadence_api::state::AppState;
use cadence_common::config::AppConfig;
use cadence_common::types::{CampaignEmail, EmailSend, QueueStatus, SendQueue, SendStatus};
use cadence_mailer::{DeliveryError, EmailProvider, OutgoingEmail};
use cadence_worker::continuation::InMemoryContinuationQueue;
use cadence_worker::credits::InMemoryCreditLedger;
use cadence_worker::driver::QueueDriver;
use cadence_worker::memory::InMemorySendStore;
use cadence_worker::settings::WorkerSettings;

// ============================================================
// Helpers
// ============================================================

const JWT_SECRET: &str = "test-jwt-secret-for-integration-tests";

fn test_config() -> AppConfig {
    AppConfig {
        database_url: "unused".to_string(),
        redis_url: "redis://localhost:6379".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        resend_api_key: None,
        resend_api_url: "http://unused".to_string(),
        email_from: None,
        app_url: "https://app.example.com".to_string(),
        send_batch_size: 10,
        send_delay_ms: 0,
        max_chain_length: 1000,
        failure_backoff_ms: 30_000,
        continuation_poll_interval_ms: 1000,
        stale_claim_timeout_secs: 600,
        provider_timeout_secs: 15,
        db_max_connections: 5,
        api_port: 3000,
    }
}

struct AcceptingProvider;

#[async_trait]
impl EmailProvider for AcceptingProvider {
    async fn send(&self, email: &OutgoingEmail) -> Result<String, DeliveryError> {
        Ok(format!("msg_{}", email.to))
    }
}

struct TestApp {
    app: Router,
    store: Arc<InMemorySendStore>,
    queue: SendQueue,
    sends: Vec<Uuid>,
}

impl TestApp {
    fn owner_token(&self) -> String {
        encode_jwt(&self.queue.user_id.to_string(), None, JWT_SECRET, 1).unwrap()
    }
}

fn service_token() -> String {
    encode_jwt("scheduler", Some(SERVICE_ROLE), JWT_SECRET, 1).unwrap()
}

fn stranger_token() -> String {
    encode_jwt(&Uuid::new_v4().to_string(), None, JWT_SECRET, 1).unwrap()
}

/// One pending queue with `send_count` due sends.
fn build_test_app(send_count: usize) -> TestApp {
    let store = Arc::new(InMemorySendStore::new());
    let now = Utc::now();

    let queue = SendQueue {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        campaign_id: Uuid::new_v4(),
        from_email: Some("team@example.com".to_string()),
        status: QueueStatus::Pending,
        emails_sent: 0,
        emails_failed: 0,
        started_at: None,
        completed_at: None,
        created_at: now,
    };
    store.insert_queue(queue.clone()).unwrap();
    store
        .insert_template(CampaignEmail {
            campaign_id: queue.campaign_id,
            sequence_step: 1,
            subject: "Hi".to_string(),
            body_html: "<p>Hello {{first_name}}</p>".to_string(),
        })
        .unwrap();

    let base = now - chrono::Duration::hours(1);
    let sends = (0..send_count)
        .map(|i| {
            let send = EmailSend {
                id: Uuid::new_v4(),
                metadata: serde_json::json!({ "queue_id": queue.id.to_string() }),
                campaign_id: queue.campaign_id,
                sequence_step: 1,
                recipient_email: format!("recipient{}@example.com", i),
                recipient_first_name: Some("Ada".to_string()),
                recipient_last_name: None,
                subject: "Hi {{first_name}}".to_string(),
                scheduled_at: base,
                status: SendStatus::Queued,
                provider_message_id: None,
                error_message: None,
                sent_at: None,
                created_at: base + chrono::Duration::seconds(i as i64),
                updated_at: base,
            };
            let id = send.id;
            store.insert_send(send).unwrap();
            id
        })
        .collect();

    let settings = WorkerSettings {
        batch_size: 10,
        send_delay: Duration::ZERO,
        max_chain_length: 1000,
        failure_backoff: Duration::from_secs(30),
        default_from: None,
        app_url: Url::parse("https://app.example.com").unwrap(),
        continuation_poll_interval: Duration::from_millis(10),
        stale_claim_timeout: Duration::from_secs(600),
    };
    let driver = QueueDriver::new(
        store.clone(),
        Arc::new(AcceptingProvider),
        Arc::new(InMemoryCreditLedger::new()),
        Arc::new(InMemoryContinuationQueue::new()),
        settings,
    );

    let app = create_router(AppState::new(Arc::new(driver), test_config()));

    TestApp {
        app,
        store,
        queue,
        sends,
    }
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
) -> (StatusCode, serde_json::Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    let response = app
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

// ============================================================
// Routes
// ============================================================

#[tokio::test]
async fn test_health_endpoint() {
    let t = build_test_app(0);
    let (status, json) = call(&t.app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "cadence-api");
}

#[tokio::test]
async fn test_process_requires_token() {
    let t = build_test_app(1);
    let uri = format!("/api/queues/{}/process", t.queue.id);

    let (status, json) = call(&t.app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(json["error"].is_string());

    let (status, _) = call(&t.app, "POST", &uri, Some("garbage")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_process_rejects_other_users() {
    let t = build_test_app(1);
    let uri = format!("/api/queues/{}/process", t.queue.id);

    let (status, _) = call(&t.app, "POST", &uri, Some(&stranger_token())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        t.store.send(t.sends[0]).unwrap().status,
        SendStatus::Queued
    );
}

#[tokio::test]
async fn test_process_drains_queue() {
    let t = build_test_app(3);
    let uri = format!("/api/queues/{}/process", t.queue.id);

    let (status, json) = call(&t.app, "POST", &uri, Some(&t.owner_token())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["processed"], 3);
    assert_eq!(json["sent"], 3);
    assert_eq!(json["failed"], 0);
    assert_eq!(json["deferred"], 0);
    assert_eq!(json["completed"], true);
    assert_eq!(json["continued"], false);

    let (status, queue) = call(
        &t.app,
        "GET",
        &format!("/api/queues/{}", t.queue.id),
        Some(&t.owner_token()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(queue["status"], "completed");
    assert_eq!(queue["emails_sent"], 3);
}

#[tokio::test]
async fn test_service_role_on_unknown_queue() {
    let t = build_test_app(0);
    let uri = format!("/api/queues/{}/process", Uuid::new_v4());

    let (status, json) = call(&t.app, "POST", &uri, Some(&service_token())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json.get("success").is_none());
}

#[tokio::test]
async fn test_list_sends_with_status_filter() {
    let t = build_test_app(2);
    t.store
        .set_send_status(t.sends[1], SendStatus::Failed)
        .unwrap();

    let base = format!("/api/queues/{}/sends", t.queue.id);
    let token = service_token();

    let (status, all) = call(&t.app, "GET", &base, Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (status, failed) = call(&t.app, "GET", &format!("{}?status=failed", base), Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    let failed = failed.as_array().unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["id"], t.sends[1].to_string());

    let (status, _) = call(&t.app, "GET", &format!("{}?status=bogus", base), Some(&token)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_requeue_reopens_completed_queue() {
    let t = build_test_app(1);
    t.store
        .set_send_status(t.sends[0], SendStatus::Failed)
        .unwrap();

    // Nothing due, so processing completes the queue.
    let (_, json) = call(
        &t.app,
        "POST",
        &format!("/api/queues/{}/process", t.queue.id),
        Some(&t.owner_token()),
    )
    .await;
    assert_eq!(json["completed"], true);

    let requeue = format!("/api/sends/{}/requeue", t.sends[0]);
    let (status, json) = call(&t.app, "POST", &requeue, Some(&t.owner_token())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["requeued"], true);
    assert_eq!(json["queue_reopened"], true);
    assert_eq!(
        t.store.send(t.sends[0]).unwrap().status,
        SendStatus::Queued
    );
    assert_eq!(
        t.store.queue(t.queue.id).unwrap().status,
        QueueStatus::Processing
    );

    // Already queued
    let (status, _) = call(&t.app, "POST", &requeue, Some(&t.owner_token())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The next invocation delivers it.
    let (_, json) = call(
        &t.app,
        "POST",
        &format!("/api/queues/{}/process", t.queue.id),
        Some(&t.owner_token()),
    )
    .await;
    assert_eq!(json["sent"], 1);
    assert_eq!(json["completed"], true);
}

#[tokio::test]
async fn test_requeue_unknown_send() {
    let t = build_test_app(0);
    let (status, _) = call(
        &t.app,
        "POST",
        &format!("/api/sends/{}/requeue", Uuid::new_v4()),
        Some(&service_token()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
