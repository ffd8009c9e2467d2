//! HTTP surface consumed by external collaborators.
//!
//! The core contract only: create, signal, stop, events, replay, trace,
//! health. Planner/tool wiring lives with the embedding application.

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keel::{
    create_job, deliver_signal, derive_status, execution_hash, verify_chain, Event, EventStore,
    EventType, JobMeta, MetadataStore, NewJob, ReplayContext, SignalError, StoreError,
};

use super::AppState;

// ============================================================================
// Create
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub agent_id: String,
    pub goal: String,
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
    #[serde(default)]
    pub session_id: Option<Uuid>,
    #[serde(default)]
    pub queue_class: Option<String>,
    #[serde(default)]
    pub priority: Option<i16>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    /// False when the idempotency window returned an existing job.
    pub created: bool,
    pub status: String,
}

pub async fn create_job_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    let mut job = NewJob::new(request.agent_id, request.goal);
    job.tenant_id = request.tenant_id;
    job.session_id = request.session_id;
    job.required_capabilities = request.required_capabilities;
    job.idempotency_key = request.idempotency_key;
    if let Some(queue_class) = request.queue_class {
        job.queue_class = queue_class;
    }
    if let Some(priority) = request.priority {
        job.priority = priority;
    }

    let outcome = create_job(
        state.kernel.events.as_ref(),
        state.kernel.metadata.as_ref(),
        job,
    )
    .await?;

    let code = if outcome.is_created() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        code,
        Json(CreateJobResponse {
            job_id: outcome.job().id,
            created: outcome.is_created(),
            status: outcome.job().status.to_string(),
        }),
    ))
}

// ============================================================================
// Signal
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub correlation_key: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct SignalResponse {
    pub delivered: bool,
    pub idempotent: bool,
}

pub async fn signal_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<SignalRequest>,
) -> Result<Json<SignalResponse>, ApiError> {
    // 404 for unknown jobs before the 400-class wait checks.
    state.kernel.metadata.get(job_id).await?;

    let delivery = deliver_signal(
        state.kernel.events.as_ref(),
        state.kernel.metadata.as_ref(),
        state.kernel.inbox.as_ref(),
        job_id,
        &request.correlation_key,
        request.payload,
    )
    .await?;

    let idempotent = !matches!(delivery, keel::SignalDelivery::Delivered { .. });
    Ok(Json(SignalResponse {
        delivered: true,
        idempotent,
    }))
}

// ============================================================================
// Stop
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopping: bool,
}

pub async fn stop_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<StopResponse>, ApiError> {
    let accepted = state.kernel.metadata.request_cancel(job_id).await?;
    if !accepted {
        return Err(ApiError::Conflict("job is already terminal".to_string()));
    }
    Ok(Json(StopResponse { stopping: true }))
}

// ============================================================================
// Introspection
// ============================================================================

#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub agent_id: String,
    pub goal: String,
    pub status: String,
    pub queue_class: String,
    pub retry_count: i32,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<JobMeta> for JobView {
    fn from(meta: JobMeta) -> Self {
        Self {
            id: meta.id,
            agent_id: meta.agent_id,
            goal: meta.goal,
            status: meta.status.to_string(),
            queue_class: meta.queue_class,
            retry_count: meta.retry_count,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        }
    }
}

pub async fn get_job_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let meta = state.kernel.metadata.get(job_id).await?;
    Ok(Json(meta.into()))
}

#[derive(Debug, Serialize)]
pub struct EventView {
    pub version: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: chrono::DateTime<Utc>,
    pub hash: String,
    pub prev_hash: String,
}

impl From<&Event> for EventView {
    fn from(event: &Event) -> Self {
        Self {
            version: event.version,
            event_type: event.event_type.as_str().to_string(),
            payload: event.payload.clone(),
            created_at: event.created_at,
            hash: event.hash.clone(),
            prev_hash: event.prev_hash.clone(),
        }
    }
}

pub async fn events_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Vec<EventView>>, ApiError> {
    state.kernel.metadata.get(job_id).await?;
    let (events, _) = state.kernel.events.list_events(job_id).await?;
    Ok(Json(events.iter().map(EventView::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct WatchQuery {
    #[serde(default)]
    pub from_version: i64,
}

/// SSE stream of events appended after `from_version`. The underlying
/// watch channel drops on backpressure; lagging consumers should re-list
/// and reconnect.
pub async fn watch_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<Uuid>,
    axum::extract::Query(query): axum::extract::Query<WatchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
    use tokio_stream::wrappers::ReceiverStream;
    use tokio_stream::StreamExt;

    state.kernel.metadata.get(job_id).await?;
    let receiver = state
        .kernel
        .events
        .watch(job_id, query.from_version)
        .await?;

    let stream = ReceiverStream::new(receiver).map(|event| {
        let data = serde_json::to_string(&EventView::from(&event)).unwrap_or_default();
        Ok::<_, std::convert::Infallible>(
            SseEvent::default().event(event.event_type.as_str()).data(data),
        )
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Serialize)]
pub struct ReplayView {
    pub status: String,
    pub phase: keel::RunPhase,
    pub cursor_node: Option<String>,
    pub completed_node_ids: Vec<String>,
    pub pending_tool_invocations: Vec<String>,
    pub approved_correlation_keys: Vec<String>,
    pub last_version: i64,
    pub execution_hash: String,
    pub chain_intact: bool,
}

pub async fn replay_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<ReplayView>, ApiError> {
    state.kernel.metadata.get(job_id).await?;
    let (events, _) = state.kernel.events.list_events(job_id).await?;
    let ctx = ReplayContext::from_events(&events)?;
    Ok(Json(ReplayView {
        status: derive_status(&events, Utc::now()).to_string(),
        phase: ctx.phase,
        cursor_node: ctx.cursor_node,
        completed_node_ids: ctx.completed_node_ids.into_iter().collect(),
        pending_tool_invocations: ctx.pending_tool_invocations.into_iter().collect(),
        approved_correlation_keys: ctx.approved_correlation_keys.into_keys().collect(),
        last_version: ctx.last_version,
        execution_hash: execution_hash(&events),
        chain_intact: verify_chain(&events).is_ok(),
    }))
}

// ============================================================================
// Trace
// ============================================================================

#[derive(Debug, Serialize)]
pub struct TraceRow {
    pub at: chrono::DateTime<Utc>,
    pub kind: String,
    pub summary: String,
}

#[derive(Debug, Serialize)]
pub struct TraceSegment {
    pub node_id: String,
    pub rows: Vec<TraceRow>,
}

#[derive(Debug, Serialize)]
pub struct TraceView {
    pub job_id: Uuid,
    pub status: String,
    pub segments: Vec<TraceSegment>,
}

pub async fn trace_handler(
    Extension(state): Extension<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<TraceView>, ApiError> {
    state.kernel.metadata.get(job_id).await?;
    let (events, _) = state.kernel.events.list_events(job_id).await?;
    Ok(Json(TraceView {
        job_id,
        status: derive_status(&events, Utc::now()).to_string(),
        segments: build_trace(&events),
    }))
}

/// Group the semantic events into per-node segments with readable rows.
fn build_trace(events: &[Event]) -> Vec<TraceSegment> {
    let mut segments: Vec<TraceSegment> = Vec::new();

    let mut row = |node_id: &str, at, kind: &str, summary: String| {
        let idx = match segments.iter().position(|s| s.node_id == node_id) {
            Some(idx) => idx,
            None => {
                segments.push(TraceSegment {
                    node_id: node_id.to_string(),
                    rows: Vec::new(),
                });
                segments.len() - 1
            }
        };
        segments[idx].rows.push(TraceRow {
            at,
            kind: kind.to_string(),
            summary,
        });
    };

    for event in events {
        let node_id = event
            .payload
            .get("node_id")
            .or_else(|| event.payload.get("step_id"))
            .and_then(|v| v.as_str())
            .unwrap_or("job");
        let text = |key: &str| {
            event
                .payload
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        match event.event_type {
            EventType::JobCreated => row("job", event.created_at, "created", text("goal")),
            EventType::JobRunning => row("job", event.created_at, "running", text("worker_id")),
            EventType::JobWaiting => row(
                node_id,
                event.created_at,
                "waiting",
                format!("{} ({})", text("correlation_key"), text("wait_type")),
            ),
            EventType::WaitCompleted => row(
                node_id,
                event.created_at,
                "signal",
                text("correlation_key"),
            ),
            EventType::NodeStarted => row(node_id, event.created_at, "started", String::new()),
            EventType::NodeFinished => row(node_id, event.created_at, "finished", text("result_type")),
            EventType::AgentThoughtRecorded => row(node_id, event.created_at, "thought", text("text")),
            EventType::DecisionMade => row(
                node_id,
                event.created_at,
                "decision",
                format!("{}: {}", text("decision"), text("rationale")),
            ),
            EventType::ToolSelected => row(node_id, event.created_at, "tool_selected", text("tool_name")),
            EventType::ToolInvocationStarted => {
                row(node_id, event.created_at, "tool", text("tool_name"))
            }
            EventType::ToolInvocationFinished => {
                row(node_id, event.created_at, "tool_result", text("outcome"))
            }
            EventType::ToolResultSummarized => {
                row(node_id, event.created_at, "tool_summary", text("summary"))
            }
            EventType::StepCompensated => row(node_id, event.created_at, "compensated", String::new()),
            EventType::JobRequeued => row("job", event.created_at, "requeued", text("reason")),
            EventType::JobCompleted => row("job", event.created_at, "completed", String::new()),
            EventType::JobFailed => row("job", event.created_at, "failed", text("reason")),
            EventType::JobCancelled => row("job", event.created_at, "cancelled", String::new()),
            _ => {}
        }
    }
    segments
}

// ============================================================================
// Error mapping
// ============================================================================

/// Route-level error with its HTTP status.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::JobNotFound(id) => ApiError::NotFound(format!("job {id} not found")),
            StoreError::IdempotencyConflict { existing } => {
                ApiError::Conflict(format!("idempotency key used by job {existing}"))
            }
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<SignalError> for ApiError {
    fn from(error: SignalError) -> Self {
        match error {
            SignalError::NotWaiting(_) | SignalError::CorrelationMismatch => {
                ApiError::BadRequest(error.to_string())
            }
            SignalError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(m) => {
                tracing::error!(error = %m, "internal error on api surface");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: String,
}

pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let database = match &state.pool {
        Some(pool) => {
            match tokio::time::timeout(
                std::time::Duration::from_secs(5),
                sqlx::query("SELECT 1").execute(pool),
            )
            .await
            {
                Ok(Ok(_)) => "ok".to_string(),
                Ok(Err(e)) => format!("error: {e}"),
                Err(_) => "timeout".to_string(),
            }
        }
        None => "in-memory".to_string(),
    };

    let healthy = database == "ok" || database == "in-memory";
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            database,
        }),
    )
}
