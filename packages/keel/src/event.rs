//! Event model: the append-only facts a job's history is made of.
//!
//! Every event carries a dense 1-based `version` within its job and a
//! SHA-256 hash chained to the previous event, making each job's history
//! tamper-evident. The event type enumeration is closed: the wire strings
//! below are canonical and must not drift, or forensic replay of old
//! histories breaks.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ============================================================================
// Event types
// ============================================================================

/// Closed enumeration of event types.
///
/// The serialized form is the canonical wire string (snake_case).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Lifecycle
    JobCreated,
    JobQueued,
    JobLeased,
    JobRunning,
    JobWaiting,
    JobRequeued,
    WaitCompleted,
    JobCompleted,
    JobFailed,
    JobCancelled,

    // Plan and nodes
    PlanGenerated,
    NodeStarted,
    NodeFinished,

    // Two-phase commands
    CommandEmitted,
    CommandCommitted,
    StepCommitted,

    // Tool calls
    ToolCalled,
    ToolReturned,
    ToolInvocationStarted,
    ToolInvocationFinished,

    // Recorded effects
    TimerFired,
    RandomRecorded,
    UuidRecorded,
    HttpRecorded,

    // Conversation
    AgentMessage,

    // State
    StateCheckpointed,
    StateChanged,

    // Semantic trace
    AgentThoughtRecorded,
    DecisionMade,
    ToolSelected,
    ToolResultSummarized,

    // Recovery
    RecoveryStarted,
    RecoveryCompleted,
    StepCompensated,

    // Snapshot-grade reasoning records
    ReasoningSnapshot,
    DecisionSnapshot,

    // Memory
    MemoryRead,
    MemoryWrite,
    PlanEvolution,

    // Retention
    JobArchived,
    JobDeleted,
    AccessAudited,

    // High-stakes audit marks
    CriticalDecisionMade,
    HumanApprovalGiven,
    PaymentExecuted,
    EmailSent,

    // Evidence export
    EvidenceExportRequested,
    EvidenceExportCompleted,
}

impl EventType {
    /// The canonical wire string for this event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobCreated => "job_created",
            EventType::JobQueued => "job_queued",
            EventType::JobLeased => "job_leased",
            EventType::JobRunning => "job_running",
            EventType::JobWaiting => "job_waiting",
            EventType::JobRequeued => "job_requeued",
            EventType::WaitCompleted => "wait_completed",
            EventType::JobCompleted => "job_completed",
            EventType::JobFailed => "job_failed",
            EventType::JobCancelled => "job_cancelled",
            EventType::PlanGenerated => "plan_generated",
            EventType::NodeStarted => "node_started",
            EventType::NodeFinished => "node_finished",
            EventType::CommandEmitted => "command_emitted",
            EventType::CommandCommitted => "command_committed",
            EventType::StepCommitted => "step_committed",
            EventType::ToolCalled => "tool_called",
            EventType::ToolReturned => "tool_returned",
            EventType::ToolInvocationStarted => "tool_invocation_started",
            EventType::ToolInvocationFinished => "tool_invocation_finished",
            EventType::TimerFired => "timer_fired",
            EventType::RandomRecorded => "random_recorded",
            EventType::UuidRecorded => "uuid_recorded",
            EventType::HttpRecorded => "http_recorded",
            EventType::AgentMessage => "agent_message",
            EventType::StateCheckpointed => "state_checkpointed",
            EventType::StateChanged => "state_changed",
            EventType::AgentThoughtRecorded => "agent_thought_recorded",
            EventType::DecisionMade => "decision_made",
            EventType::ToolSelected => "tool_selected",
            EventType::ToolResultSummarized => "tool_result_summarized",
            EventType::RecoveryStarted => "recovery_started",
            EventType::RecoveryCompleted => "recovery_completed",
            EventType::StepCompensated => "step_compensated",
            EventType::ReasoningSnapshot => "reasoning_snapshot",
            EventType::DecisionSnapshot => "decision_snapshot",
            EventType::MemoryRead => "memory_read",
            EventType::MemoryWrite => "memory_write",
            EventType::PlanEvolution => "plan_evolution",
            EventType::JobArchived => "job_archived",
            EventType::JobDeleted => "job_deleted",
            EventType::AccessAudited => "access_audited",
            EventType::CriticalDecisionMade => "critical_decision_made",
            EventType::HumanApprovalGiven => "human_approval_given",
            EventType::PaymentExecuted => "payment_executed",
            EventType::EmailSent => "email_sent",
            EventType::EvidenceExportRequested => "evidence_export_requested",
            EventType::EvidenceExportCompleted => "evidence_export_completed",
        }
    }

    /// True for events that end a job's life: nothing may be appended after
    /// them except via explicit archival.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::JobCompleted | EventType::JobFailed | EventType::JobCancelled
        )
    }

    /// True for events that participate in status derivation.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EventType::JobCreated
                | EventType::JobRunning
                | EventType::JobWaiting
                | EventType::JobRequeued
                | EventType::WaitCompleted
                | EventType::JobCompleted
                | EventType::JobFailed
                | EventType::JobCancelled
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| UnknownEventType(s.to_string()))
    }
}

/// Returned when a wire string is not part of the closed enumeration.
#[derive(Debug, thiserror::Error)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

// ============================================================================
// Event record
// ============================================================================

/// An immutable, hash-chained event in a job's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub job_id: Uuid,
    /// Dense, 1-based position within the job's stream.
    pub version: i64,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Hash of the previous event; empty for version 1.
    pub prev_hash: String,
    /// `SHA256(job_id | type | payload | rfc3339nano(created_at) | prev_hash)`.
    pub hash: String,
}

/// Input to `EventStore::append`: the store mints the id, version, timestamp
/// (when unset) and both hashes.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: EventType,
    pub payload: serde_json::Value,
    /// When `None`, the store stamps the current time.
    pub created_at: Option<DateTime<Utc>>,
}

impl NewEvent {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
            created_at: None,
        }
    }
}

/// Context carried by writers into `EventStore::append`.
///
/// When `attempt_id` is set, the store must verify it matches the live
/// lease's attempt before accepting the write (fencing).
#[derive(Debug, Clone, Default)]
pub struct AppendContext {
    pub attempt_id: Option<Uuid>,
}

impl AppendContext {
    pub fn fenced(attempt_id: Uuid) -> Self {
        Self {
            attempt_id: Some(attempt_id),
        }
    }
}

// ============================================================================
// Hash chain
// ============================================================================

/// Compute the chain hash for one event.
///
/// Preimage: `job_id "|" type "|" payload_bytes "|" rfc3339nano(created_at)
/// "|" prev_hash`, hex-encoded lowercase.
pub fn chain_hash(
    job_id: Uuid,
    event_type: EventType,
    payload: &serde_json::Value,
    created_at: DateTime<Utc>,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_payload_bytes(payload));
    hasher.update(b"|");
    hasher.update(
        created_at
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hasher.update(b"|");
    hasher.update(prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonical payload bytes for hashing. serde_json sorts object keys, so
/// the same logical payload always hashes identically.
fn canonical_payload_bytes(payload: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(payload).unwrap_or_default()
}

/// Seal a `NewEvent` into a full record at the given version.
pub fn seal_event(
    job_id: Uuid,
    version: i64,
    prev_hash: &str,
    event: NewEvent,
    default_created_at: DateTime<Utc>,
) -> Event {
    let created_at = event.created_at.unwrap_or(default_created_at);
    let hash = chain_hash(job_id, event.event_type, &event.payload, created_at, prev_hash);
    Event {
        event_id: Uuid::new_v4(),
        job_id,
        version,
        event_type: event.event_type,
        payload: event.payload,
        created_at,
        prev_hash: prev_hash.to_string(),
        hash,
    }
}

/// A broken link found by `verify_chain`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainViolation {
    #[error("version {found} at position {position}, expected {expected}")]
    SparseVersion {
        position: usize,
        expected: i64,
        found: i64,
    },
    #[error("prev_hash of version {version} does not match hash of version {}", .version - 1)]
    BrokenLink { version: i64 },
    #[error("stored hash of version {version} does not match its recomputation")]
    HashMismatch { version: i64 },
}

/// Walk a job's history and verify density, linkage, and hash recomputation.
pub fn verify_chain(events: &[Event]) -> Result<(), ChainViolation> {
    let mut prev_hash = String::new();
    for (i, event) in events.iter().enumerate() {
        let expected_version = i as i64 + 1;
        if event.version != expected_version {
            return Err(ChainViolation::SparseVersion {
                position: i,
                expected: expected_version,
                found: event.version,
            });
        }
        if event.prev_hash != prev_hash {
            return Err(ChainViolation::BrokenLink {
                version: event.version,
            });
        }
        let recomputed = chain_hash(
            event.job_id,
            event.event_type,
            &event.payload,
            event.created_at,
            &event.prev_hash,
        );
        if recomputed != event.hash {
            return Err(ChainViolation::HashMismatch {
                version: event.version,
            });
        }
        prev_hash = event.hash.clone();
    }
    Ok(())
}

/// Execution hash: `H(plan_hash ‖ (node_id, result_type) over NodeFinished)`.
///
/// Reproducible from events alone; two reads of the same stream always
/// produce the same value.
pub fn execution_hash(events: &[Event]) -> String {
    let mut hasher = Sha256::new();
    for event in events {
        if event.event_type == EventType::PlanGenerated {
            // Prefer the recorded plan hash; fall back to hashing the payload
            // so histories predating the field still verify.
            match event.payload.get("plan_hash").and_then(|v| v.as_str()) {
                Some(plan_hash) => hasher.update(plan_hash.as_bytes()),
                None => hasher.update(canonical_payload_bytes(&event.payload)),
            }
            break;
        }
    }
    for event in events {
        if event.event_type != EventType::NodeFinished {
            continue;
        }
        let node_id = event
            .payload
            .get("node_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let result_type = event
            .payload
            .get("result_type")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        hasher.update(node_id.as_bytes());
        hasher.update(b":");
        hasher.update(result_type.as_bytes());
        hasher.update(b"|");
    }
    hex::encode(hasher.finalize())
}
