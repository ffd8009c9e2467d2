//! In-memory reference backend.
//!
//! One mutex over the whole state keeps every operation linearizable, the
//! same guarantee the relational implementation gets from row locks plus the
//! `(job_id, version)` unique index. Tests and the scheduler's unit tests
//! run against this backend; the server package provides the Postgres one.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{seal_event, AppendContext, Event, NewEvent};
use crate::status::JobStatus;
use crate::store::{
    Claim, ClaimSelector, EventStore, InsertOutcome, JobMeta, MetadataStore, NewJob, SignalInbox,
    SignalRecord, Snapshot, ToolInvocationLedger, ToolInvocationRecord, ToolInvocationStatus,
};

const WATCH_BUFFER: usize = 64;

#[derive(Debug, Clone)]
struct Lease {
    worker_id: String,
    expires_at: DateTime<Utc>,
    attempt_id: Uuid,
}

struct Watcher {
    job_id: Uuid,
    sender: mpsc::Sender<Event>,
}

#[derive(Default)]
struct Inner {
    events: HashMap<Uuid, Vec<Event>>,
    leases: HashMap<Uuid, Lease>,
    jobs: HashMap<Uuid, JobMeta>,
    signals: Vec<SignalRecord>,
    ledger: HashMap<(Uuid, String), ToolInvocationRecord>,
    snapshots: HashMap<Uuid, Vec<Snapshot>>,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn last_event_terminal(&self, job_id: Uuid) -> bool {
        self.events
            .get(&job_id)
            .and_then(|stream| stream.last())
            .map(|e| e.event_type.is_terminal())
            .unwrap_or(false)
    }

    fn live_lease(&self, job_id: Uuid, now: DateTime<Utc>) -> Option<&Lease> {
        self.leases
            .get(&job_id)
            .filter(|lease| lease.expires_at > now)
    }

    fn known_job_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<(DateTime<Utc>, Uuid)> = self
            .jobs
            .values()
            .map(|j| (j.created_at, j.id))
            .collect();
        for (id, stream) in &self.events {
            if !self.jobs.contains_key(id) {
                if let Some(first) = stream.first() {
                    ids.push((first.created_at, *id));
                }
            }
        }
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    fn mint_claim(&mut self, worker_id: &str, job_id: Uuid, ttl: Duration) -> Claim {
        let attempt_id = Uuid::new_v4();
        let expires_at = Utc::now() + ttl;
        self.leases.insert(
            job_id,
            Lease {
                worker_id: worker_id.to_string(),
                expires_at,
                attempt_id,
            },
        );
        let version = self.events.get(&job_id).map(|s| s.len() as i64).unwrap_or(0);
        Claim {
            job_id,
            version,
            attempt_id,
            expires_at,
        }
    }

    fn notify_watchers(&mut self, event: &Event) {
        self.watchers.retain(|w| {
            if w.job_id != event.job_id {
                return !w.sender.is_closed();
            }
            // Drop-on-full: slow consumers must re-list.
            match w.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

/// In-memory implementation of all four storage traits.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    lease_ttl: Duration,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_lease_ttl(Duration::seconds(30))
    }

    pub fn with_lease_ttl(lease_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            lease_ttl,
        }
    }

    /// Force a lease to expire immediately (test hook for crash scenarios).
    pub async fn expire_lease(&self, job_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if let Some(lease) = inner.leases.get_mut(&job_id) {
            lease.expires_at = Utc::now() - Duration::seconds(1);
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// EventStore
// ============================================================================

#[async_trait]
impl EventStore for MemoryBackend {
    async fn list_events(&self, job_id: Uuid) -> Result<(Vec<Event>, i64), StoreError> {
        let inner = self.inner.lock().await;
        let events = inner.events.get(&job_id).cloned().unwrap_or_default();
        let version = events.len() as i64;
        Ok((events, version))
    }

    async fn append(
        &self,
        ctx: &AppendContext,
        job_id: Uuid,
        expected_version: i64,
        event: NewEvent,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        if let Some(attempt_id) = ctx.attempt_id {
            let holds = inner
                .live_lease(job_id, now)
                .map(|lease| lease.attempt_id == attempt_id)
                .unwrap_or(false);
            if !holds {
                return Err(StoreError::StaleAttempt { job_id, attempt_id });
            }
        }

        let stream = inner.events.entry(job_id).or_default();
        let current = stream.len() as i64;
        if current != expected_version {
            return Err(StoreError::VersionMismatch {
                expected: expected_version,
                current,
            });
        }
        let prev_hash = stream.last().map(|e| e.hash.clone()).unwrap_or_default();
        let sealed = seal_event(job_id, current + 1, &prev_hash, event, now);
        stream.push(sealed.clone());
        let new_version = current + 1;
        inner.notify_watchers(&sealed);
        Ok(new_version)
    }

    async fn claim(&self, worker_id: &str) -> Result<Claim, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let candidate = inner.known_job_ids().into_iter().find(|&id| {
            !inner.last_event_terminal(id) && inner.live_lease(id, now).is_none()
        });
        match candidate {
            Some(job_id) => Ok(inner.mint_claim(worker_id, job_id, self.lease_ttl)),
            None => Err(StoreError::NoJob),
        }
    }

    async fn claim_job(&self, worker_id: &str, job_id: Uuid) -> Result<Claim, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let known = inner.events.contains_key(&job_id) || inner.jobs.contains_key(&job_id);
        if !known || inner.last_event_terminal(job_id) || inner.live_lease(job_id, now).is_some() {
            return Err(StoreError::NoJob);
        }
        Ok(inner.mint_claim(worker_id, job_id, self.lease_ttl))
    }

    async fn heartbeat(&self, worker_id: &str, job_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let ttl = self.lease_ttl;
        match inner.leases.get_mut(&job_id) {
            Some(lease) if lease.worker_id == worker_id && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(())
            }
            _ => Err(StoreError::ClaimNotFound { job_id }),
        }
    }

    async fn release_claim(&self, worker_id: &str, job_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.leases.get(&job_id) {
            Some(lease) if lease.worker_id == worker_id => {
                inner.leases.remove(&job_id);
                Ok(())
            }
            _ => Err(StoreError::ClaimNotFound { job_id }),
        }
    }

    async fn expired_claims(&self) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        Ok(inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn current_attempt_id(&self, job_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .live_lease(job_id, Utc::now())
            .map(|lease| lease.attempt_id))
    }

    async fn watch(
        &self,
        job_id: Uuid,
        from_version: i64,
    ) -> Result<mpsc::Receiver<Event>, StoreError> {
        let mut inner = self.inner.lock().await;
        let (sender, receiver) = mpsc::channel(WATCH_BUFFER);
        if let Some(stream) = inner.events.get(&job_id) {
            for event in stream.iter().filter(|e| e.version > from_version) {
                // Backlog beyond the buffer is dropped; the consumer re-lists.
                let _ = sender.try_send(event.clone());
            }
        }
        inner.watchers.push(Watcher { job_id, sender });
        Ok(receiver)
    }

    async fn create_snapshot(
        &self,
        job_id: Uuid,
        up_to_version: i64,
        blob: Vec<u8>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let snapshots = inner.snapshots.entry(job_id).or_default();
        snapshots.retain(|s| s.version != up_to_version);
        snapshots.push(Snapshot {
            job_id,
            version: up_to_version,
            blob,
            created_at: Utc::now(),
        });
        snapshots.sort_by_key(|s| s.version);
        Ok(())
    }

    async fn latest_snapshot(&self, job_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .snapshots
            .get(&job_id)
            .and_then(|s| s.last())
            .cloned())
    }

    async fn delete_snapshots_before(
        &self,
        job_id: Uuid,
        version: i64,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(snapshots) = inner.snapshots.get_mut(&job_id) else {
            return Ok(0);
        };
        let before = snapshots.len();
        snapshots.retain(|s| s.version >= version);
        Ok((before - snapshots.len()) as u64)
    }
}

// ============================================================================
// MetadataStore
// ============================================================================

fn capabilities_satisfied(required: &[String], offered: &[String]) -> bool {
    required.iter().all(|cap| offered.iter().any(|o| o == cap))
}

fn selector_matches(job: &JobMeta, selector: &ClaimSelector, now: DateTime<Utc>) -> bool {
    let dispatchable = matches!(job.status, JobStatus::Pending | JobStatus::Retrying);
    let due = job.next_run_at.map(|t| t <= now).unwrap_or(true);
    let queue_ok = selector
        .queue_class
        .as_deref()
        .map(|q| job.queue_class == q)
        .unwrap_or(true);
    let tenant_ok = selector
        .tenant_id
        .map(|t| job.tenant_id == Some(t))
        .unwrap_or(true);
    dispatchable
        && due
        && queue_ok
        && tenant_ok
        && capabilities_satisfied(&job.required_capabilities, &selector.capabilities)
}

#[async_trait]
impl MetadataStore for MemoryBackend {
    async fn insert(&self, job: NewJob) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(key) = &job.idempotency_key {
            let existing = inner
                .jobs
                .values()
                .find(|j| j.agent_id == job.agent_id && j.idempotency_key.as_ref() == Some(key));
            if let Some(existing) = existing {
                return Ok(InsertOutcome::Duplicate(existing.clone()));
            }
        }
        let now = Utc::now();
        let meta = JobMeta {
            id: Uuid::new_v4(),
            tenant_id: job.tenant_id,
            agent_id: job.agent_id,
            session_id: job.session_id,
            goal: job.goal,
            status: JobStatus::Pending,
            cursor: None,
            retry_count: 0,
            priority: job.priority,
            queue_class: job.queue_class,
            required_capabilities: job.required_capabilities,
            idempotency_key: job.idempotency_key,
            cancel_requested_at: None,
            execution_version: 1,
            plan_version: 1,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(meta.id, meta.clone());
        Ok(InsertOutcome::Created(meta))
    }

    async fn get(&self, job_id: Uuid) -> Result<JobMeta, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Retrying) {
            return Ok(false);
        }
        job.status = JobStatus::Running;
        job.next_run_at = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_requeued(
        &self,
        job_id: Uuid,
        retry_count: i32,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.status = JobStatus::Retrying;
        job.retry_count = retry_count;
        job.next_run_at = Some(next_run_at);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.cancel_requested_at = Some(Utc::now());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn record_cursor(
        &self,
        job_id: Uuid,
        cursor: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        job.cursor = cursor;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn next_pending(&self, selector: &ClaimSelector) -> Result<Option<JobMeta>, StoreError> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let mut candidates: Vec<&JobMeta> = inner
            .jobs
            .values()
            .filter(|j| selector_matches(j, selector, now))
            .collect();
        candidates.sort_by_key(|j| (j.priority, j.created_at));
        Ok(candidates.first().map(|j| (*j).clone()))
    }

    async fn oldest_pending_before(
        &self,
        cutoff: DateTime<Utc>,
        selector: &ClaimSelector,
    ) -> Result<Option<JobMeta>, StoreError> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let unqueued = ClaimSelector {
            queue_class: None,
            capabilities: selector.capabilities.clone(),
            tenant_id: selector.tenant_id,
        };
        let mut candidates: Vec<&JobMeta> = inner
            .jobs
            .values()
            .filter(|j| selector_matches(j, &unqueued, now) && j.created_at <= cutoff)
            .collect();
        candidates.sort_by_key(|j| j.created_at);
        Ok(candidates.first().map(|j| (*j).clone()))
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<JobMeta>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<JobMeta> = inner
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit as usize);
        Ok(jobs)
    }
}

// ============================================================================
// SignalInbox
// ============================================================================

#[async_trait]
impl SignalInbox for MemoryBackend {
    async fn push(
        &self,
        job_id: Uuid,
        correlation_key: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.lock().await;
        let id = Uuid::new_v4();
        inner.signals.push(SignalRecord {
            id,
            job_id,
            correlation_key: correlation_key.to_string(),
            payload,
            created_at: Utc::now(),
            acked_at: None,
        });
        Ok(id)
    }

    async fn mark_acked(&self, signal_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(signal) = inner.signals.iter_mut().find(|s| s.id == signal_id) {
            signal.acked_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn unacked(&self, limit: i64) -> Result<Vec<SignalRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .signals
            .iter()
            .filter(|s| s.acked_at.is_none())
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

// ============================================================================
// ToolInvocationLedger
// ============================================================================

impl Inner {
    fn fence(&self, job_id: Uuid, attempt_id: Uuid) -> Result<(), StoreError> {
        let holds = self
            .live_lease(job_id, Utc::now())
            .map(|lease| lease.attempt_id == attempt_id)
            .unwrap_or(false);
        if holds {
            Ok(())
        } else {
            Err(StoreError::StaleAttempt { job_id, attempt_id })
        }
    }
}

#[async_trait]
impl ToolInvocationLedger for MemoryBackend {
    async fn begin(
        &self,
        attempt_id: Uuid,
        record: ToolInvocationRecord,
    ) -> Result<ToolInvocationRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.fence(record.job_id, attempt_id)?;
        let key = (record.job_id, record.idempotency_key.clone());
        if let Some(existing) = inner.ledger.get(&key) {
            return Ok(existing.clone());
        }
        inner.ledger.insert(key, record.clone());
        Ok(record)
    }

    async fn commit(
        &self,
        attempt_id: Uuid,
        job_id: Uuid,
        idempotency_key: &str,
        status: ToolInvocationStatus,
        result: Option<serde_json::Value>,
        external_id: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.fence(job_id, attempt_id)?;
        let key = (job_id, idempotency_key.to_string());
        let record = inner.ledger.get_mut(&key).ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!(
                "commit for unknown invocation {idempotency_key}"
            ))
        })?;
        record.status = status;
        record.committed = status == ToolInvocationStatus::Succeeded;
        record.result = result;
        if external_id.is_some() {
            record.external_id = external_id;
        }
        record.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn find(
        &self,
        job_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<ToolInvocationRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .get(&(job_id, idempotency_key.to_string()))
            .cloned())
    }

    async fn pending_for_job(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<ToolInvocationRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .ledger
            .values()
            .filter(|r| r.job_id == job_id && r.status == ToolInvocationStatus::Started)
            .cloned()
            .collect())
    }
}
