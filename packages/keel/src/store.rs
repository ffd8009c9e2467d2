//! Storage traits: interfaces live in the engine, policy lives in the app.
//!
//! The server package provides the Postgres implementations; [`crate::memory`]
//! provides the in-memory reference backend the tests run against. Both sides
//! must honor the same contract: per-job linearizable appends, at most one
//! unexpired lease per job, and attempt-fenced writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{AppendContext, Event, NewEvent};
use crate::status::JobStatus;

// ============================================================================
// Leases
// ============================================================================

/// A successful claim: the right to execute one job until `expires_at`,
/// fenced by `attempt_id`.
#[derive(Debug, Clone)]
pub struct Claim {
    pub job_id: Uuid,
    /// Stream version at claim time.
    pub version: i64,
    pub attempt_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// A stored replay-context snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub job_id: Uuid,
    pub version: i64,
    pub blob: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Event store
// ============================================================================

/// Append-only per-job event log with optimistic versioning, the lease
/// table, and snapshots.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// All events for a job ordered by version; the returned number is the
    /// caller-visible stream version (`len(events)`).
    async fn list_events(&self, job_id: Uuid) -> Result<(Vec<Event>, i64), StoreError>;

    /// CAS append at `expected_version`. The store mints the event id,
    /// computes the hash chain link, and stamps `created_at` when unset.
    ///
    /// When `ctx` carries an attempt id it must match the live lease or the
    /// append fails with `StaleAttempt`. A lost race fails with
    /// `VersionMismatch` (including unique-violations on `(job_id, version)`).
    async fn append(
        &self,
        ctx: &AppendContext,
        job_id: Uuid,
        expected_version: i64,
        event: NewEvent,
    ) -> Result<i64, StoreError>;

    /// Atomically claim one job whose last event is non-terminal and whose
    /// lease is absent or expired. Mints a fresh attempt id. `NoJob` when
    /// nothing qualifies.
    async fn claim(&self, worker_id: &str) -> Result<Claim, StoreError>;

    /// Same as [`claim`](Self::claim), scoped to one job id. The scheduler
    /// uses this for capability- and queue-routed claims.
    async fn claim_job(&self, worker_id: &str, job_id: Uuid) -> Result<Claim, StoreError>;

    /// Extend the lease, only if this worker still holds it.
    async fn heartbeat(&self, worker_id: &str, job_id: Uuid) -> Result<(), StoreError>;

    /// Drop the lease held by this worker so the job is immediately
    /// claimable again (used when parking on a wait and on clean exits).
    async fn release_claim(&self, worker_id: &str, job_id: Uuid) -> Result<(), StoreError>;

    /// Jobs whose lease has expired (`expires_at <= now`).
    async fn expired_claims(&self) -> Result<Vec<Uuid>, StoreError>;

    /// The live lease's attempt id, if any. Fencing for write-side
    /// operations outside the hot append path.
    async fn current_attempt_id(&self, job_id: Uuid) -> Result<Option<Uuid>, StoreError>;

    /// Stream events appended after `from_version`. Polling-based
    /// implementations are fine (≤ 500 ms cadence). The channel is bounded
    /// and drops on full: slow consumers must re-list.
    async fn watch(&self, job_id: Uuid, from_version: i64)
        -> Result<mpsc::Receiver<Event>, StoreError>;

    async fn create_snapshot(
        &self,
        job_id: Uuid,
        up_to_version: i64,
        blob: Vec<u8>,
    ) -> Result<(), StoreError>;

    async fn latest_snapshot(&self, job_id: Uuid) -> Result<Option<Snapshot>, StoreError>;

    async fn delete_snapshots_before(&self, job_id: Uuid, version: i64)
        -> Result<u64, StoreError>;
}

// ============================================================================
// Job metadata
// ============================================================================

/// Denormalized job row. Status, cursor, and retry counters are projections
/// of the event stream; the row exists so claim selection is one cheap
/// indexed query instead of a fold over history.
#[derive(Debug, Clone)]
pub struct JobMeta {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub agent_id: String,
    pub session_id: Option<Uuid>,
    pub goal: String,
    pub status: JobStatus,
    pub cursor: Option<String>,
    pub retry_count: i32,
    pub priority: i16,
    pub queue_class: String,
    pub required_capabilities: Vec<String>,
    pub idempotency_key: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    pub execution_version: i32,
    pub plan_version: i32,
    /// Earliest time the scheduler may dispatch this job again (retry
    /// backoff, timer waits).
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input to [`MetadataStore::insert`].
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: Option<Uuid>,
    pub agent_id: String,
    pub session_id: Option<Uuid>,
    pub goal: String,
    pub priority: i16,
    pub queue_class: String,
    pub required_capabilities: Vec<String>,
    pub idempotency_key: Option<String>,
}

impl NewJob {
    pub fn new(agent_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            tenant_id: None,
            agent_id: agent_id.into(),
            session_id: None,
            goal: goal.into(),
            priority: 2,
            queue_class: "default".to_string(),
            required_capabilities: Vec::new(),
            idempotency_key: None,
        }
    }

    pub fn with_queue(mut self, queue_class: impl Into<String>) -> Self {
        self.queue_class = queue_class.into();
        self
    }

    pub fn with_capabilities(
        mut self,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }
}

/// Result of an insert that may hit the per-agent idempotency window.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Created(JobMeta),
    /// `(agent_id, idempotency_key)` matched an existing job; the caller
    /// gets that job instead of a duplicate.
    Duplicate(JobMeta),
}

impl InsertOutcome {
    pub fn job(&self) -> &JobMeta {
        match self {
            InsertOutcome::Created(job) | InsertOutcome::Duplicate(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

/// Claim selection filter used by the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ClaimSelector {
    /// Restrict to one queue class; `None` scans all queues.
    pub queue_class: Option<String>,
    /// The worker's capabilities; a job qualifies iff its
    /// `required_capabilities` are a subset.
    pub capabilities: Vec<String>,
    pub tenant_id: Option<Uuid>,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a job row, deduplicating on `(agent_id, idempotency_key)`.
    async fn insert(&self, job: NewJob) -> Result<InsertOutcome, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<JobMeta, StoreError>;

    async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError>;

    /// Compare-and-set Pending → Running. Returns false if another claimer
    /// won the row in between.
    async fn mark_running(&self, job_id: Uuid) -> Result<bool, StoreError>;

    /// Record a retryable failure: bump `retry_count`, set status Retrying,
    /// and push `next_run_at` out by the backoff.
    async fn mark_requeued(
        &self,
        job_id: Uuid,
        retry_count: i32,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Stamp `cancel_requested_at`; returns false when the job is already
    /// terminal.
    async fn request_cancel(&self, job_id: Uuid) -> Result<bool, StoreError>;

    /// Persist the replay cursor (most recently completed node) on the row.
    async fn record_cursor(&self, job_id: Uuid, cursor: Option<String>)
        -> Result<(), StoreError>;

    /// The next dispatchable pending job matching the selector, oldest
    /// first, honoring `priority` and `next_run_at`. Read-only: the real
    /// gate is the lease claim that follows.
    async fn next_pending(&self, selector: &ClaimSelector) -> Result<Option<JobMeta>, StoreError>;

    /// Oldest pending job that has been waiting since before `cutoff`,
    /// regardless of queue weights. Starvation relief.
    async fn oldest_pending_before(
        &self,
        cutoff: DateTime<Utc>,
        selector: &ClaimSelector,
    ) -> Result<Option<JobMeta>, StoreError>;

    /// Jobs currently in the given status (sweeper and introspection).
    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<JobMeta>, StoreError>;
}

// ============================================================================
// Signal inbox
// ============================================================================

/// A durably stored unblock signal. Rows stay until acked; the sweeper
/// re-delivers unacked rows, which is what makes delivery at-least-once
/// across API restarts.
#[derive(Debug, Clone)]
pub struct SignalRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub correlation_key: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub acked_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SignalInbox: Send + Sync {
    /// Durably store one signal; returns the inbox row id.
    async fn push(
        &self,
        job_id: Uuid,
        correlation_key: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, StoreError>;

    async fn mark_acked(&self, signal_id: Uuid) -> Result<(), StoreError>;

    async fn unacked(&self, limit: i64) -> Result<Vec<SignalRecord>, StoreError>;
}

// ============================================================================
// Tool invocation ledger
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolInvocationStatus {
    Started,
    Succeeded,
    Failed,
}

/// One row of the tool ledger: the only authority on whether an external
/// side effect has been committed.
#[derive(Debug, Clone)]
pub struct ToolInvocationRecord {
    pub job_id: Uuid,
    pub idempotency_key: String,
    pub invocation_id: Uuid,
    pub step_id: String,
    pub tool_name: String,
    pub args_hash: String,
    pub status: ToolInvocationStatus,
    pub result: Option<serde_json::Value>,
    pub committed: bool,
    pub external_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ToolInvocationLedger: Send + Sync {
    /// Record the start of an invocation. Lease-fenced: fails with
    /// `StaleAttempt` if `attempt_id` no longer holds the job's lease.
    /// Idempotent per `(job_id, idempotency_key)`: re-begins of an existing
    /// row return the stored record.
    async fn begin(
        &self,
        attempt_id: Uuid,
        record: ToolInvocationRecord,
    ) -> Result<ToolInvocationRecord, StoreError>;

    /// Commit the outcome. Lease-fenced like [`begin`](Self::begin).
    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        attempt_id: Uuid,
        job_id: Uuid,
        idempotency_key: &str,
        status: ToolInvocationStatus,
        result: Option<serde_json::Value>,
        external_id: Option<String>,
    ) -> Result<(), StoreError>;

    async fn find(
        &self,
        job_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<ToolInvocationRecord>, StoreError>;

    /// Rows still `started` and uncommitted: candidates for confirmation
    /// replay after a crash.
    async fn pending_for_job(&self, job_id: Uuid)
        -> Result<Vec<ToolInvocationRecord>, StoreError>;
}
