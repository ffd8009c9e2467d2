//! # Keel
//!
//! A durable, replayable execution substrate for long-running agent jobs.
//!
//! Keel separates **facts** from **execution**:
//! - [`Event`] = Facts (an append-only, hash-chained history per job)
//! - [`ReplayContext`] = Derived state (a pure fold over that history)
//! - [`Executor`] = Progress (drives the plan, never repeating committed
//!   side effects)
//!
//! The key principle: **a job is its event stream**. Workers are
//! interchangeable and disposable; any worker can pick up any job at any
//! point by replaying its history, and a fencing `attempt_id` guarantees a
//! dead worker's writes bounce off the store.
//!
//! ## Architecture
//!
//! ```text
//! API edge ── create_job() ──► jobs row + job_created
//!                                   │
//!                                   ▼
//! Scheduler ── fair queues ──► claim_job() ── lease + attempt_id
//!                                   │
//!                                   ▼
//! Worker ── list_events() ──► ReplayContext ──► Executor.drive()
//!              │                                    │
//!              │          node/command/tool/effect events (fenced)
//!              │                                    │
//!              ◄────────────── heartbeat ───────────┤
//!                                                   ▼
//!                         job_completed │ job_waiting │ failure
//!                                           │
//! Signal inbox ── deliver_signal() ──► wait_completed ──► Pending again
//! ```
//!
//! ## Key invariants
//!
//! 1. **Versions are dense** - exactly one event per `(job_id, version)`,
//!    starting at 1
//! 2. **The chain is closed** - `event[i].prev_hash == event[i-1].hash`
//! 3. **One live lease** - at most one unexpired claim per job, each with a
//!    unique attempt id
//! 4. **Terminal means terminal** - completed/failed/cancelled jobs are
//!    never claimable
//! 5. **Replay is pure** - the same events always rebuild the same context,
//!    byte for byte
//! 6. **Effects record once** - commands, tools, time, UUIDs, randomness,
//!    and HTTP run live exactly once and inject from history afterwards
//!
//! Interfaces live here; policy (polling cadence, queue weights, backoff,
//! HTTP wiring) lives in the application around this crate.

mod effects;
mod error;
mod event;
mod executor;
mod payload;
mod plan;
mod replay;
mod service;
mod status;
mod store;
mod writer;

// In-memory reference backend; the tests' storage plane.
pub mod memory;

// Re-export the event model
pub use event::{
    chain_hash, execution_hash, seal_event, verify_chain, AppendContext, ChainViolation, Event,
    EventType, NewEvent, UnknownEventType,
};

// Re-export typed payloads
pub use payload::{
    CommandCommitted, CommandEmitted, HttpRecorded, HttpRequestRecord, HttpResponseRecord,
    JobCancelled, JobCompleted, JobCreated, JobFailed, JobRequeued, JobRunning, JobWaiting,
    NodeFinished, NodeStarted, PlanGenerated, RandomRecorded, StateChanged, StepCompensated,
    TimerFired, ToolInvocationFinished, ToolInvocationStarted, ToolOutcome, UuidRecorded,
    WaitCompleted,
};

// Re-export the plan model
pub use plan::{NodeResultType, PlanError, TaskGraph, TaskNode, WaitKind};

// Re-export status derivation
pub use status::{derive_status, is_blocked, JobStatus, PARKED_AFTER_SECONDS};

// Re-export the error taxonomy
pub use error::{FailureKind, StepFailure, StoreError};

// Re-export storage traits and records
pub use store::{
    Claim, ClaimSelector, EventStore, InsertOutcome, JobMeta, MetadataStore, NewJob, SignalInbox,
    SignalRecord, Snapshot, ToolInvocationLedger, ToolInvocationRecord, ToolInvocationStatus,
};

// Re-export replay
pub use replay::{RecordedHttp, ReplayContext, RunPhase};

// Re-export effects
pub use effects::{EffectKind, EffectRecorder, HttpClient, RecordedEffects};

// Re-export the executor surface
pub use executor::{
    sha256_json, tool_idempotency_key, CompensationContext, Executor, HandlerRegistry,
    NodeHandler, NodeOutcome, Planner, RunOutcome, StepContext, ToolCallResult, ToolDispatcher,
    WaitRequest,
};

// Re-export core orchestration
pub use service::{
    create_job, current_wait, deliver_signal, fire_due_timers, reclaim_expired, redeliver_signal,
    SignalDelivery, SignalError,
};

// Re-export the write handle
pub use writer::EventWriter;

// Re-export commonly used external types
pub use async_trait::async_trait;
