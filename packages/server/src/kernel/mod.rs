//! The Postgres kernel: storage-plane implementations of the engine traits.
//!
//! - [`PostgresEventStore`] - event log, claims, snapshots
//! - [`PostgresJobStore`] - denormalized job rows
//! - [`PostgresSignalInbox`] - durable unblock signals
//! - [`PostgresToolLedger`] - idempotency-keyed tool invocations
//!
//! Everything here is storage and fencing; execution policy lives in the
//! scheduler, worker, and sweeper services.

mod event_store;
mod http;
mod job_row;
mod signals;
mod tools;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use keel::{EventStore, MetadataStore, SignalInbox, ToolInvocationLedger};

pub use event_store::PostgresEventStore;
pub use http::ReqwestHttpClient;
pub use job_row::{join_capabilities, split_capabilities, JobRow, PostgresJobStore};
pub use signals::PostgresSignalInbox;
pub use tools::PostgresToolLedger;

/// Handle bundle for the four storage planes. The scheduler, worker,
/// reclaimer, sweeper, and HTTP surface all run over this.
#[derive(Clone)]
pub struct JobKernel {
    pub events: Arc<dyn EventStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub inbox: Arc<dyn SignalInbox>,
    pub ledger: Arc<dyn ToolInvocationLedger>,
}

impl JobKernel {
    /// Wire all four planes to one Postgres pool.
    pub fn postgres(pool: PgPool, lease_ttl: Duration) -> Self {
        Self {
            events: Arc::new(PostgresEventStore::with_lease_ttl(pool.clone(), lease_ttl)),
            metadata: Arc::new(PostgresJobStore::new(pool.clone())),
            inbox: Arc::new(PostgresSignalInbox::new(pool.clone())),
            ledger: Arc::new(PostgresToolLedger::new(pool)),
        }
    }

    /// All four planes on the in-memory backend (tests, local runs).
    pub fn in_memory() -> Self {
        Self::from_memory_backend(Arc::new(keel::memory::MemoryBackend::new()))
    }

    /// Wrap an existing in-memory backend (tests keep the concrete handle
    /// for lease-expiry hooks).
    pub fn from_memory_backend(backend: Arc<keel::memory::MemoryBackend>) -> Self {
        Self {
            events: backend.clone(),
            metadata: backend.clone(),
            inbox: backend.clone(),
            ledger: backend,
        }
    }
}
