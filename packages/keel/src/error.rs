//! Error taxonomy for the execution substrate.
//!
//! `StoreError` covers the storage plane (CAS conflicts, fencing, claims).
//! `StepFailure` covers the execution plane and carries the classification
//! the scheduler's retry policy dispatches on. `anyhow` stays internal
//! transport; what crosses component boundaries is one of these two types.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Storage-plane errors. CAS-class variants are recovered locally (reload
/// and retry, or re-derive); the rest surface to callers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic append lost the race: the stream moved past
    /// `expected`. Reload events and retry once if the write is logically
    /// idempotent.
    #[error("version mismatch: expected {expected}, current {current}")]
    VersionMismatch { expected: i64, current: i64 },

    /// The writer's attempt no longer holds the lease. Terminate the
    /// attempt; a newer worker owns the job now.
    #[error("stale attempt {attempt_id} for job {job_id}")]
    StaleAttempt { job_id: Uuid, attempt_id: Uuid },

    /// Heartbeat or release on a lease this worker does not hold.
    #[error("no live claim for job {job_id}")]
    ClaimNotFound { job_id: Uuid },

    /// Nothing claimable right now. Back off and poll.
    #[error("no claimable job")]
    NoJob,

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    /// Per-agent idempotency window hit; the existing job is returned to
    /// the caller instead of a new one.
    #[error("idempotency key already used by job {existing}")]
    IdempotencyConflict { existing: Uuid },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// CAS-class errors are handled inside the component that hit them.
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(self, StoreError::VersionMismatch { .. })
    }
}

/// Classification of executor failures, dispatched on by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient; requeue with backoff until `retry_max`.
    Retryable,
    /// Deterministic; fail the job immediately.
    Permanent,
    /// A side effect needs rollback: run the compensate callback, then fail.
    Compensatable,
    /// A side effect is known committed and must not be retried blindly.
    SideEffectCommitted,
    /// Compensation already ran; terminal.
    Compensated,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::Permanent => "permanent",
            FailureKind::Compensatable => "compensatable",
            FailureKind::SideEffectCommitted => "side_effect_committed",
            FailureKind::Compensated => "compensated",
        }
    }

    /// Whether the scheduler may requeue (subject to the retry budget).
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Retryable)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step failure: the tagged sum carried from the executor to the
/// scheduler's retry policy.
#[derive(Debug, Error)]
#[error("{kind} failure at node {node_id}: {inner}")]
pub struct StepFailure {
    pub kind: FailureKind,
    pub node_id: String,
    #[source]
    pub inner: anyhow::Error,
}

impl StepFailure {
    pub fn new(kind: FailureKind, node_id: impl Into<String>, inner: anyhow::Error) -> Self {
        Self {
            kind,
            node_id: node_id.into(),
            inner,
        }
    }

    pub fn retryable(node_id: impl Into<String>, inner: anyhow::Error) -> Self {
        Self::new(FailureKind::Retryable, node_id, inner)
    }

    pub fn permanent(node_id: impl Into<String>, inner: anyhow::Error) -> Self {
        Self::new(FailureKind::Permanent, node_id, inner)
    }

    pub fn compensatable(node_id: impl Into<String>, inner: anyhow::Error) -> Self {
        Self::new(FailureKind::Compensatable, node_id, inner)
    }

    /// An error nobody classified is treated as transient.
    pub fn unclassified(node_id: impl Into<String>, inner: anyhow::Error) -> Self {
        Self::new(FailureKind::Retryable, node_id, inner)
    }
}
