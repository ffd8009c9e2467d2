//! Collaborator-surface tests: create, signal, stop, events, replay,
//! trace, health, all over the in-memory kernel.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;
use uuid::Uuid;

use keel::memory::MemoryBackend;
use keel::{
    AppendContext, EventStore, EventType, JobStatus, JobWaiting, MetadataStore, NewEvent,
    WaitKind,
};
use server_core::server::build_app;
use server_core::JobKernel;

struct TestApp {
    app: Router,
    backend: Arc<MemoryBackend>,
}

fn test_app() -> TestApp {
    let backend = Arc::new(MemoryBackend::new());
    let kernel = JobKernel::from_memory_backend(backend.clone());
    TestApp {
        app: build_app(kernel, None),
        backend,
    }
}

async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).unwrap())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn create_test_job(app: &TestApp) -> Uuid {
    let (status, body) = request(
        &app.app,
        "POST",
        "/api/jobs",
        Some(serde_json::json!({"agent_id": "a1", "goal": "g1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["job_id"].as_str().unwrap().parse().unwrap()
}

async fn park_on_wait(app: &TestApp, job_id: Uuid, correlation_key: &str) {
    let (_, version) = app.backend.list_events(job_id).await.unwrap();
    let wait = JobWaiting {
        node_id: "approve".to_string(),
        wait_type: WaitKind::Human,
        correlation_key: correlation_key.to_string(),
        expires_at: None,
        resumption_context: serde_json::json!({}),
    };
    app.backend
        .append(
            &AppendContext::default(),
            job_id,
            version,
            NewEvent::new(EventType::JobWaiting, serde_json::to_value(&wait).unwrap()),
        )
        .await
        .unwrap();
    MetadataStore::set_status(app.backend.as_ref(), job_id, JobStatus::Waiting)
        .await
        .unwrap();
}

#[tokio::test]
async fn health_reports_ok_for_in_memory_kernel() {
    let app = test_app();
    let (status, body) = request(&app.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn create_job_returns_201_and_writes_the_first_event() {
    let app = test_app();
    let job_id = create_test_job(&app).await;

    let (events, version) = app.backend.list_events(job_id).await.unwrap();
    assert_eq!(version, 1);
    assert_eq!(events[0].event_type, EventType::JobCreated);
}

#[tokio::test]
async fn idempotent_create_returns_the_existing_job() {
    let app = test_app();
    let payload = serde_json::json!({
        "agent_id": "a1",
        "goal": "g1",
        "idempotency_key": "k1",
    });
    let (status, first) = request(&app.app, "POST", "/api/jobs", Some(payload.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["created"], true);

    let (status, second) = request(&app.app, "POST", "/api/jobs", Some(payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["created"], false);
    assert_eq!(second["job_id"], first["job_id"]);
}

#[tokio::test]
async fn signal_with_wrong_key_is_400_and_appends_nothing() {
    let app = test_app();
    let job_id = create_test_job(&app).await;
    park_on_wait(&app, job_id, "expected-key").await;

    let (status, _) = request(
        &app.app,
        "POST",
        &format!("/api/jobs/{job_id}/signal"),
        Some(serde_json::json!({"correlation_key": "wrong-key", "payload": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, version) = app.backend.list_events(job_id).await.unwrap();
    assert_eq!(version, 2);
    let meta = MetadataStore::get(app.backend.as_ref(), job_id).await.unwrap();
    assert_eq!(meta.status, JobStatus::Waiting);
}

#[tokio::test]
async fn signal_with_matching_key_unblocks_and_duplicates_are_200() {
    let app = test_app();
    let job_id = create_test_job(&app).await;
    park_on_wait(&app, job_id, "k").await;

    let body = serde_json::json!({"correlation_key": "k", "payload": {"approved": true}});
    let (status, first) = request(
        &app.app,
        "POST",
        &format!("/api/jobs/{job_id}/signal"),
        Some(body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["idempotent"], false);

    let (status, second) = request(
        &app.app,
        "POST",
        &format!("/api/jobs/{job_id}/signal"),
        Some(body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["idempotent"], true);

    let (events, _) = app.backend.list_events(job_id).await.unwrap();
    let completed = events
        .iter()
        .filter(|e| e.event_type == EventType::WaitCompleted)
        .count();
    assert_eq!(completed, 1);
}

#[tokio::test]
async fn signal_on_unknown_job_is_404() {
    let app = test_app();
    let (status, _) = request(
        &app.app,
        "POST",
        &format!("/api/jobs/{}/signal", Uuid::new_v4()),
        Some(serde_json::json!({"correlation_key": "k"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stop_is_200_until_terminal_then_409() {
    let app = test_app();
    let job_id = create_test_job(&app).await;

    let (status, body) = request(
        &app.app,
        "POST",
        &format!("/api/jobs/{job_id}/stop"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopping"], true);
    let meta = MetadataStore::get(app.backend.as_ref(), job_id).await.unwrap();
    assert!(meta.cancel_requested_at.is_some());

    MetadataStore::set_status(app.backend.as_ref(), job_id, JobStatus::Completed)
        .await
        .unwrap();
    let (status, _) = request(
        &app.app,
        "POST",
        &format!("/api/jobs/{job_id}/stop"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn events_endpoint_returns_the_ordered_stream() {
    let app = test_app();
    let job_id = create_test_job(&app).await;
    park_on_wait(&app, job_id, "k").await;

    let (status, body) = request(
        &app.app,
        "GET",
        &format!("/api/jobs/{job_id}/events"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = body.as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["version"], 1);
    assert_eq!(events[0]["type"], "job_created");
    assert_eq!(events[1]["type"], "job_waiting");
}

#[tokio::test]
async fn replay_endpoint_reports_hash_and_chain() {
    let app = test_app();
    let job_id = create_test_job(&app).await;

    let (status, body) = request(
        &app.app,
        "GET",
        &format!("/api/jobs/{job_id}/replay"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["chain_intact"], true);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["last_version"], 1);
    let hash = body["execution_hash"].as_str().unwrap();
    assert_eq!(hash.len(), 64);

    // Stable across reads.
    let (_, again) = request(
        &app.app,
        "GET",
        &format!("/api/jobs/{job_id}/replay"),
        None,
    )
    .await;
    assert_eq!(again["execution_hash"], hash);
}

#[tokio::test]
async fn trace_endpoint_groups_rows_by_node() {
    let app = test_app();
    let job_id = create_test_job(&app).await;
    park_on_wait(&app, job_id, "k").await;

    let (status, body) = request(
        &app.app,
        "GET",
        &format!("/api/jobs/{job_id}/trace"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let segments = body["segments"].as_array().unwrap();
    assert!(segments.iter().any(|s| s["node_id"] == "job"));
    assert!(segments.iter().any(|s| s["node_id"] == "approve"));
}
