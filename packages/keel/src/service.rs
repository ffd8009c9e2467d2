//! Core orchestration over the storage traits: job creation, signal
//! delivery, and reclaim of orphaned leases.
//!
//! These functions hold the protocol semantics; the server package wraps
//! them in HTTP handlers and long-running service loops.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{AppendContext, Event, EventType, NewEvent};
use crate::payload::{self, WaitCompleted};
use crate::status::{derive_status, is_blocked, JobStatus};
use crate::store::{EventStore, InsertOutcome, MetadataStore, NewJob, SignalInbox};

// ============================================================================
// Job creation
// ============================================================================

/// Insert the metadata row and write `job_created` at version 1.
///
/// Deduplicates per `(agent_id, idempotency_key)`: a duplicate returns the
/// existing job and appends nothing.
pub async fn create_job(
    events: &dyn EventStore,
    metadata: &dyn MetadataStore,
    job: NewJob,
) -> Result<InsertOutcome, StoreError> {
    let payload = payload::JobCreated {
        agent_id: job.agent_id.clone(),
        tenant_id: job.tenant_id,
        session_id: job.session_id,
        goal: job.goal.clone(),
        queue_class: job.queue_class.clone(),
        required_capabilities: job.required_capabilities.clone(),
        idempotency_key: job.idempotency_key.clone(),
    };
    let outcome = metadata.insert(job).await?;
    if outcome.is_created() {
        events
            .append(
                &AppendContext::default(),
                outcome.job().id,
                0,
                NewEvent::new(EventType::JobCreated, serde_json::to_value(&payload)?),
            )
            .await?;
        info!(job_id = %outcome.job().id, agent_id = %payload.agent_id, "job created");
    } else {
        debug!(job_id = %outcome.job().id, "idempotency window hit, returning existing job");
    }
    Ok(outcome)
}

// ============================================================================
// Signal delivery
// ============================================================================

/// Outcome of a successful signal POST. Every variant maps to HTTP 200.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalDelivery {
    /// A `wait_completed` was appended under this delivery.
    Delivered { signal_id: Uuid },
    /// A concurrent delivery won the append; same key, same effect.
    AlreadyDelivered,
    /// The wait had already completed before this request arrived.
    Idempotent,
}

/// Rejections of a signal POST.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    /// No `job_waiting` is currently open on this job.
    #[error("job {0} is not waiting")]
    NotWaiting(Uuid),
    /// The key does not match the open `job_waiting`.
    #[error("correlation key does not match the current wait")]
    CorrelationMismatch,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The currently open wait, if any: the most recent `job_waiting` with no
/// subsequent `wait_completed`.
pub fn current_wait(events: &[Event]) -> Option<payload::JobWaiting> {
    let (idx, wait) = events.iter().enumerate().rev().find_map(|(i, e)| {
        (e.event_type == EventType::JobWaiting)
            .then(|| serde_json::from_value::<payload::JobWaiting>(e.payload.clone()).ok())
            .flatten()
            .map(|w| (i, w))
    })?;
    let completed = events[idx + 1..].iter().any(|e| {
        e.event_type == EventType::WaitCompleted
            && e.payload.get("correlation_key").and_then(|k| k.as_str())
                == Some(wait.correlation_key.as_str())
    });
    (!completed).then_some(wait)
}

/// Deliver one external unblock signal:
///
/// 1. Reject when no wait is open or the key does not match.
/// 2. Durably append to the inbox.
/// 3. CAS-append `wait_completed` at the current version.
/// 4. On success flip metadata to Pending and ack the inbox row.
/// 5. On a lost race, re-read: a same-key `wait_completed` means a
///    concurrent delivery won (200); otherwise retry once.
pub async fn deliver_signal(
    events: &dyn EventStore,
    metadata: &dyn MetadataStore,
    inbox: &dyn SignalInbox,
    job_id: Uuid,
    correlation_key: &str,
    signal_payload: serde_json::Value,
) -> Result<SignalDelivery, SignalError> {
    let (history, version) = events.list_events(job_id).await?;

    let Some(wait) = current_wait(&history) else {
        // A duplicate of an already-handled delivery is success, not error.
        let already = history.iter().any(|e| {
            e.event_type == EventType::WaitCompleted
                && e.payload.get("correlation_key").and_then(|k| k.as_str())
                    == Some(correlation_key)
        });
        if already {
            return Ok(SignalDelivery::Idempotent);
        }
        return Err(SignalError::NotWaiting(job_id));
    };
    if wait.correlation_key != correlation_key {
        return Err(SignalError::CorrelationMismatch);
    }

    // The inbox row is the durable witness: once this returns, a sweeper
    // will finish delivery even if this process dies mid-protocol.
    let signal_id = inbox
        .push(job_id, correlation_key, signal_payload.clone())
        .await?;

    let completed = WaitCompleted {
        correlation_key: correlation_key.to_string(),
        payload: signal_payload,
    };
    let mut expected = version;
    for attempt in 0..2 {
        match events
            .append(
                &AppendContext::default(),
                job_id,
                expected,
                NewEvent::new(
                    EventType::WaitCompleted,
                    serde_json::to_value(&completed).map_err(StoreError::from)?,
                ),
            )
            .await
        {
            Ok(_) => {
                metadata.set_status(job_id, JobStatus::Pending).await?;
                inbox.mark_acked(signal_id).await?;
                info!(job_id = %job_id, correlation_key, "signal delivered");
                return Ok(SignalDelivery::Delivered { signal_id });
            }
            Err(StoreError::VersionMismatch { current, .. }) => {
                let (history, _) = events.list_events(job_id).await?;
                let raced = history.iter().any(|e| {
                    e.event_type == EventType::WaitCompleted
                        && e.payload.get("correlation_key").and_then(|k| k.as_str())
                            == Some(correlation_key)
                });
                if raced {
                    inbox.mark_acked(signal_id).await?;
                    return Ok(SignalDelivery::AlreadyDelivered);
                }
                if attempt == 0 {
                    expected = current;
                    continue;
                }
                return Err(StoreError::VersionMismatch {
                    expected,
                    current,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("signal delivery loop always returns within two attempts")
}

/// Finish delivery of a durably stored signal (sweeper path). Unlike
/// [`deliver_signal`] this never appends a new inbox row: the row already
/// exists, possibly from a process that died mid-protocol. Always acks the
/// row once it can no longer have an effect.
pub async fn redeliver_signal(
    events: &dyn EventStore,
    metadata: &dyn MetadataStore,
    inbox: &dyn SignalInbox,
    record: &crate::store::SignalRecord,
) -> Result<(), StoreError> {
    let (history, version) = events.list_events(record.job_id).await?;

    let open = current_wait(&history)
        .map(|w| w.correlation_key == record.correlation_key)
        .unwrap_or(false);
    if !open {
        // Either the wait completed (this delivery or a rival's) or the job
        // moved on; the signal can never apply again.
        inbox.mark_acked(record.id).await?;
        return Ok(());
    }

    let completed = WaitCompleted {
        correlation_key: record.correlation_key.clone(),
        payload: record.payload.clone(),
    };
    match events
        .append(
            &AppendContext::default(),
            record.job_id,
            version,
            NewEvent::new(EventType::WaitCompleted, serde_json::to_value(&completed)?),
        )
        .await
    {
        Ok(_) => {
            metadata
                .set_status(record.job_id, JobStatus::Pending)
                .await?;
            inbox.mark_acked(record.id).await?;
            info!(job_id = %record.job_id, correlation_key = %record.correlation_key, "signal redelivered");
            Ok(())
        }
        // Lost a race; the next sweep re-evaluates.
        Err(StoreError::VersionMismatch { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Wake `timer` waits whose expiry is due by appending the matching
/// `wait_completed`. Scanned from the scheduler-visible statuses.
pub async fn fire_due_timers(
    events: &dyn EventStore,
    metadata: &dyn MetadataStore,
    limit: i64,
) -> Result<Vec<Uuid>, StoreError> {
    let now = chrono::Utc::now();
    let mut woken = Vec::new();
    let mut waiting = metadata.list_by_status(JobStatus::Waiting, limit).await?;
    waiting.extend(metadata.list_by_status(JobStatus::Parked, limit).await?);

    for job in waiting {
        let (history, version) = events.list_events(job.id).await?;
        let Some(wait) = current_wait(&history) else {
            continue;
        };
        if wait.wait_type != crate::plan::WaitKind::Timer {
            continue;
        }
        let due = wait.expires_at.map(|t| t <= now).unwrap_or(false);
        if !due {
            continue;
        }
        let completed = WaitCompleted {
            correlation_key: wait.correlation_key.clone(),
            payload: serde_json::json!({"timer_expired": true}),
        };
        match events
            .append(
                &AppendContext::default(),
                job.id,
                version,
                NewEvent::new(EventType::WaitCompleted, serde_json::to_value(&completed)?),
            )
            .await
        {
            Ok(_) => {
                metadata.set_status(job.id, JobStatus::Pending).await?;
                info!(job_id = %job.id, "timer wait fired");
                woken.push(job.id);
            }
            Err(StoreError::VersionMismatch { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(woken)
}

// ============================================================================
// Reclaim
// ============================================================================

/// Move jobs with an expired lease back to Pending, unless they are blocked
/// on a wait or already terminal. Appends nothing: reclaim is a metadata
/// flip, and the expired lease row is simply overwritten by the next claim.
pub async fn reclaim_expired(
    events: &dyn EventStore,
    metadata: &dyn MetadataStore,
) -> Result<Vec<Uuid>, StoreError> {
    let mut reclaimed = Vec::new();
    for job_id in events.expired_claims().await? {
        let (history, _) = events.list_events(job_id).await?;
        let status = derive_status(&history, chrono::Utc::now());
        if status.is_terminal() {
            continue;
        }
        if is_blocked(&history) {
            debug!(job_id = %job_id, "expired lease on a blocked job, leaving parked");
            continue;
        }
        match metadata.set_status(job_id, JobStatus::Pending).await {
            Ok(()) => {
                warn!(job_id = %job_id, "reclaimed job with expired lease");
                reclaimed.push(job_id);
            }
            Err(StoreError::JobNotFound(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(reclaimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::plan::WaitKind;

    async fn waiting_job(backend: &MemoryBackend, key: &str) -> Uuid {
        let outcome = create_job(backend, backend, NewJob::new("a1", "g1"))
            .await
            .unwrap();
        let job_id = outcome.job().id;
        let wait = payload::JobWaiting {
            node_id: "n1".to_string(),
            wait_type: WaitKind::Webhook,
            correlation_key: key.to_string(),
            expires_at: None,
            resumption_context: serde_json::json!({}),
        };
        backend
            .append(
                &AppendContext::default(),
                job_id,
                1,
                NewEvent::new(
                    EventType::JobWaiting,
                    serde_json::to_value(&wait).unwrap(),
                ),
            )
            .await
            .unwrap();
        backend
            .set_status(job_id, JobStatus::Waiting)
            .await
            .unwrap();
        job_id
    }

    #[tokio::test]
    async fn create_job_writes_metadata_and_first_event() {
        let backend = MemoryBackend::new();
        let outcome = create_job(
            &backend,
            &backend,
            NewJob::new("a1", "summarize the incident"),
        )
        .await
        .unwrap();
        assert!(outcome.is_created());

        let (events, version) = backend.list_events(outcome.job().id).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(events[0].event_type, EventType::JobCreated);
        assert_eq!(events[0].payload["goal"], "summarize the incident");
    }

    #[tokio::test]
    async fn duplicate_create_appends_nothing() {
        let backend = MemoryBackend::new();
        let job = NewJob::new("a1", "g1").with_idempotency_key("k1");
        let first = create_job(&backend, &backend, job.clone()).await.unwrap();
        let second = create_job(&backend, &backend, job).await.unwrap();
        assert!(!second.is_created());
        assert_eq!(second.job().id, first.job().id);
        let (_, version) = backend.list_events(first.job().id).await.unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn signal_with_matching_key_completes_the_wait() {
        let backend = MemoryBackend::new();
        let job_id = waiting_job(&backend, "expected-key").await;

        let delivery = deliver_signal(
            &backend,
            &backend,
            &backend,
            job_id,
            "expected-key",
            serde_json::json!({"approved": true}),
        )
        .await
        .unwrap();
        assert!(matches!(delivery, SignalDelivery::Delivered { .. }));

        let (events, _) = backend.list_events(job_id).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::WaitCompleted);
        assert_eq!(last.payload["correlation_key"], "expected-key");
        let meta = backend.get(job_id).await.unwrap();
        assert_eq!(meta.status, JobStatus::Pending);
        assert!(backend.unacked(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_key_is_rejected_without_events() {
        let backend = MemoryBackend::new();
        let job_id = waiting_job(&backend, "expected-key").await;

        let err = deliver_signal(
            &backend,
            &backend,
            &backend,
            job_id,
            "wrong-key",
            serde_json::json!({}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalError::CorrelationMismatch));

        let (_, version) = backend.list_events(job_id).await.unwrap();
        assert_eq!(version, 2);
        assert_eq!(backend.get(job_id).await.unwrap().status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn signal_on_non_waiting_job_is_rejected() {
        let backend = MemoryBackend::new();
        let outcome = create_job(&backend, &backend, NewJob::new("a1", "g1"))
            .await
            .unwrap();
        let err = deliver_signal(
            &backend,
            &backend,
            &backend,
            outcome.job().id,
            "k",
            serde_json::json!({}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalError::NotWaiting(_)));
    }

    #[tokio::test]
    async fn duplicate_signal_is_idempotent() {
        let backend = MemoryBackend::new();
        let job_id = waiting_job(&backend, "k").await;

        deliver_signal(&backend, &backend, &backend, job_id, "k", serde_json::json!({}))
            .await
            .unwrap();
        let second = deliver_signal(
            &backend,
            &backend,
            &backend,
            job_id,
            "k",
            serde_json::json!({}),
        )
        .await
        .unwrap();
        assert_eq!(second, SignalDelivery::Idempotent);

        let (events, _) = backend.list_events(job_id).await.unwrap();
        let completed = events
            .iter()
            .filter(|e| e.event_type == EventType::WaitCompleted)
            .count();
        assert_eq!(completed, 1);
    }

    #[tokio::test]
    async fn concurrent_signals_append_exactly_one_wait_completed() {
        let backend = std::sync::Arc::new(MemoryBackend::new());
        let job_id = waiting_job(&backend, "k").await;

        let a = {
            let backend = backend.clone();
            tokio::spawn(async move {
                deliver_signal(
                    backend.as_ref(),
                    backend.as_ref(),
                    backend.as_ref(),
                    job_id,
                    "k",
                    serde_json::json!({"from": "a"}),
                )
                .await
            })
        };
        let b = {
            let backend = backend.clone();
            tokio::spawn(async move {
                deliver_signal(
                    backend.as_ref(),
                    backend.as_ref(),
                    backend.as_ref(),
                    job_id,
                    "k",
                    serde_json::json!({"from": "b"}),
                )
                .await
            })
        };
        // Both must succeed with an HTTP-200-class outcome.
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let (events, _) = backend.list_events(job_id).await.unwrap();
        let completed = events
            .iter()
            .filter(|e| e.event_type == EventType::WaitCompleted)
            .count();
        assert_eq!(completed, 1);
        assert_eq!(backend.get(job_id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn unacked_signal_is_redelivered_by_the_sweeper_path() {
        let backend = MemoryBackend::new();
        let job_id = waiting_job(&backend, "k").await;

        // The API process durably stored the signal, then died before the
        // wait_completed append.
        let signal_id = backend
            .push(job_id, "k", serde_json::json!({"approved": true}))
            .await
            .unwrap();

        let unacked = backend.unacked(10).await.unwrap();
        assert_eq!(unacked.len(), 1);
        redeliver_signal(&backend, &backend, &backend, &unacked[0])
            .await
            .unwrap();

        let (events, _) = backend.list_events(job_id).await.unwrap();
        assert_eq!(
            events.last().unwrap().event_type,
            EventType::WaitCompleted
        );
        assert_eq!(backend.get(job_id).await.unwrap().status, JobStatus::Pending);
        let _ = signal_id;
        assert!(backend.unacked(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_signal_is_acked_without_new_events() {
        let backend = MemoryBackend::new();
        let job_id = waiting_job(&backend, "k").await;
        deliver_signal(&backend, &backend, &backend, job_id, "k", serde_json::json!({}))
            .await
            .unwrap();

        // A second durable row for the same key can never apply again.
        backend
            .push(job_id, "k", serde_json::json!({}))
            .await
            .unwrap();
        let unacked = backend.unacked(10).await.unwrap();
        assert_eq!(unacked.len(), 1);

        let (before, _) = backend.list_events(job_id).await.unwrap();
        redeliver_signal(&backend, &backend, &backend, &unacked[0])
            .await
            .unwrap();
        let (after, _) = backend.list_events(job_id).await.unwrap();
        assert_eq!(before.len(), after.len());
        assert!(backend.unacked(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_timer_waits_are_woken() {
        let backend = MemoryBackend::new();
        let outcome = create_job(&backend, &backend, NewJob::new("a1", "g1"))
            .await
            .unwrap();
        let job_id = outcome.job().id;
        let wait = payload::JobWaiting {
            node_id: "sleep".to_string(),
            wait_type: WaitKind::Timer,
            correlation_key: "timer:sleep".to_string(),
            expires_at: Some(chrono::Utc::now() - chrono::Duration::seconds(1)),
            resumption_context: serde_json::json!({}),
        };
        backend
            .append(
                &AppendContext::default(),
                job_id,
                1,
                NewEvent::new(
                    EventType::JobWaiting,
                    serde_json::to_value(&wait).unwrap(),
                ),
            )
            .await
            .unwrap();
        backend
            .set_status(job_id, JobStatus::Waiting)
            .await
            .unwrap();

        let woken = fire_due_timers(&backend, &backend, 10).await.unwrap();
        assert_eq!(woken, vec![job_id]);
        let (events, _) = backend.list_events(job_id).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::WaitCompleted);
        assert_eq!(last.payload["correlation_key"], "timer:sleep");
    }

    #[tokio::test]
    async fn undue_timers_and_human_waits_are_left_alone() {
        let backend = MemoryBackend::new();
        let human = waiting_job(&backend, "needs-human").await;

        let outcome = create_job(&backend, &backend, NewJob::new("a1", "g2"))
            .await
            .unwrap();
        let timer = outcome.job().id;
        let wait = payload::JobWaiting {
            node_id: "sleep".to_string(),
            wait_type: WaitKind::Timer,
            correlation_key: "timer:sleep".to_string(),
            expires_at: Some(chrono::Utc::now() + chrono::Duration::minutes(5)),
            resumption_context: serde_json::json!({}),
        };
        backend
            .append(
                &AppendContext::default(),
                timer,
                1,
                NewEvent::new(
                    EventType::JobWaiting,
                    serde_json::to_value(&wait).unwrap(),
                ),
            )
            .await
            .unwrap();
        backend.set_status(timer, JobStatus::Waiting).await.unwrap();

        let woken = fire_due_timers(&backend, &backend, 10).await.unwrap();
        assert!(woken.is_empty());
        assert_eq!(backend.get(human).await.unwrap().status, JobStatus::Waiting);
        assert_eq!(backend.get(timer).await.unwrap().status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn reclaim_flips_expired_running_jobs_to_pending() {
        let backend = MemoryBackend::new();
        let outcome = create_job(&backend, &backend, NewJob::new("a1", "g1"))
            .await
            .unwrap();
        let job_id = outcome.job().id;
        let claim = backend.claim_job("w1", job_id).await.unwrap();
        backend
            .append(
                &AppendContext::fenced(claim.attempt_id),
                job_id,
                1,
                NewEvent::new(EventType::JobRunning, serde_json::json!({})),
            )
            .await
            .unwrap();
        backend.mark_running(job_id).await.unwrap();

        backend.expire_lease(job_id).await;
        let (before, _) = backend.list_events(job_id).await.unwrap();
        let reclaimed = reclaim_expired(&backend, &backend).await.unwrap();
        assert_eq!(reclaimed, vec![job_id]);
        assert_eq!(backend.get(job_id).await.unwrap().status, JobStatus::Pending);

        // Reclaim appends nothing.
        let (after, _) = backend.list_events(job_id).await.unwrap();
        assert_eq!(before.len(), after.len());
    }

    #[tokio::test]
    async fn reclaim_leaves_blocked_jobs_alone() {
        let backend = MemoryBackend::new();
        let job_id = waiting_job(&backend, "k").await;
        backend.claim_job("w1", job_id).await.unwrap();
        backend.expire_lease(job_id).await;

        let reclaimed = reclaim_expired(&backend, &backend).await.unwrap();
        assert!(reclaimed.is_empty());
        assert_eq!(backend.get(job_id).await.unwrap().status, JobStatus::Waiting);
    }
}
