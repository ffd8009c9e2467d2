//! Worker: runs one claimed job to its next stopping point.
//!
//! For every claim the worker loads history (snapshot fast-path), rebuilds
//! the replay context, starts an independent heartbeat loop, watches for
//! cooperative cancellation, and hands the context to the executor. The
//! heartbeat runs in its own task so a stuck execution still loses its
//! lease after TTL and becomes reclaimable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use keel::{
    AppendContext, Claim, EventStore, EventType, EventWriter, Executor, FailureKind, JobCancelled,
    JobFailed, JobRequeued, JobStatus, MetadataStore, ReplayContext, RunOutcome, StepFailure,
    StoreError,
};

use crate::kernel::JobKernel;

/// Configuration for job execution.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Recommended `lease_ttl / 2`.
    pub heartbeat_interval: Duration,
    /// How often the worker polls `cancel_requested_at`.
    pub cancel_poll_interval: Duration,
    /// Write a replay snapshot when a run ends past this many events.
    pub snapshot_every: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            heartbeat_interval: Duration::from_secs(15),
            cancel_poll_interval: Duration::from_secs(1),
            snapshot_every: 200,
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Retry policy applied to executor failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retry_max: i32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_max: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff from the base, capped at one hour.
    pub fn backoff_for(&self, retry_count: i32) -> Duration {
        let exp = retry_count.clamp(0, 20) as u32;
        let grown = self.backoff.saturating_mul(2u32.saturating_pow(exp));
        grown.min(Duration::from_secs(3600))
    }
}

/// Executes claimed jobs.
pub struct Worker {
    kernel: JobKernel,
    executor: Arc<Executor>,
    config: WorkerConfig,
    retry: RetryPolicy,
}

impl Worker {
    pub fn new(kernel: JobKernel, executor: Arc<Executor>) -> Self {
        Self {
            kernel,
            executor,
            config: WorkerConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_config(
        kernel: JobKernel,
        executor: Arc<Executor>,
        config: WorkerConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            kernel,
            executor,
            config,
            retry,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run one claimed job until it completes, parks, fails, or cancels.
    pub async fn run_claimed(&self, claim: Claim, shutdown: &CancellationToken) {
        let job_id = claim.job_id;
        if let Err(e) = self.run_inner(claim, shutdown).await {
            match e {
                StoreError::StaleAttempt { .. } => {
                    // A newer worker owns the job; everything this attempt
                    // tried to write bounced off the store. Nothing to undo.
                    warn!(job_id = %job_id, "attempt fenced off mid-run");
                }
                e => error!(job_id = %job_id, error = %e, "job run aborted"),
            }
        }
    }

    async fn run_inner(&self, claim: Claim, shutdown: &CancellationToken) -> Result<(), StoreError> {
        let job_id = claim.job_id;
        let meta = self.kernel.metadata.get(job_id).await?;

        debug!(
            job_id = %job_id,
            worker_id = %self.config.worker_id,
            version = claim.version,
            "running claimed job"
        );

        let mut ctx = self.load_context(job_id).await?;
        let writer = EventWriter::new(
            self.kernel.events.clone(),
            job_id,
            AppendContext::fenced(claim.attempt_id),
            claim.version,
        );
        writer
            .append_value(
                EventType::JobRunning,
                serde_json::to_value(keel::JobRunning {
                    worker_id: self.config.worker_id.clone(),
                    attempt_id: claim.attempt_id,
                })?,
            )
            .await?;

        let cancel = shutdown.child_token();
        let heartbeat = self.spawn_heartbeat(job_id, cancel.clone());
        let cancel_watch = self.spawn_cancel_watch(job_id, cancel.clone());

        let outcome = self
            .executor
            .drive(&meta.goal, &mut ctx, &writer, &cancel)
            .await;

        cancel.cancel();
        heartbeat.abort();
        cancel_watch.abort();

        let result = match outcome {
            Ok(outcome) => self.finish(&meta, ctx, &writer, outcome).await,
            Err(e) => Err(e),
        };

        // Whatever happened, this attempt is over: give the lease back so
        // the job is immediately claimable (terminal jobs never are).
        if let Err(e) = self
            .kernel
            .events
            .release_claim(&self.config.worker_id, job_id)
            .await
        {
            debug!(job_id = %job_id, error = %e, "lease already gone at release");
        }

        result
    }

    async fn load_context(&self, job_id: Uuid) -> Result<ReplayContext, StoreError> {
        let (events, _) = self.kernel.events.list_events(job_id).await?;
        match self.kernel.events.latest_snapshot(job_id).await? {
            Some(snapshot) if snapshot.version <= events.len() as i64 => {
                debug!(job_id = %job_id, snapshot_version = snapshot.version, "resuming from snapshot");
                ReplayContext::from_snapshot(&snapshot.blob, &events)
            }
            _ => ReplayContext::from_events(&events),
        }
    }

    async fn finish(
        &self,
        meta: &keel::JobMeta,
        ctx: ReplayContext,
        writer: &EventWriter,
        outcome: RunOutcome,
    ) -> Result<(), StoreError> {
        let job_id = meta.id;
        match outcome {
            RunOutcome::Completed => {
                self.kernel
                    .metadata
                    .set_status(job_id, JobStatus::Completed)
                    .await?;
                self.kernel
                    .metadata
                    .record_cursor(job_id, ctx.cursor_node.clone())
                    .await?;
                info!(job_id = %job_id, "job completed");
                self.maybe_snapshot(job_id, &ctx, writer).await;
            }
            RunOutcome::Waiting {
                node_id,
                correlation_key,
            } => {
                self.kernel
                    .metadata
                    .set_status(job_id, JobStatus::Waiting)
                    .await?;
                self.kernel
                    .metadata
                    .record_cursor(job_id, ctx.cursor_node.clone())
                    .await?;
                info!(job_id = %job_id, node_id, correlation_key, "job parked on wait");
                self.maybe_snapshot(job_id, &ctx, writer).await;
            }
            RunOutcome::Cancelled => {
                let requested = self
                    .kernel
                    .metadata
                    .get(job_id)
                    .await?
                    .cancel_requested_at
                    .is_some();
                if requested {
                    writer
                        .append(
                            EventType::JobCancelled,
                            &JobCancelled {
                                reason: Some("cancel requested".to_string()),
                            },
                        )
                        .await?;
                    self.kernel
                        .metadata
                        .set_status(job_id, JobStatus::Cancelled)
                        .await?;
                    info!(job_id = %job_id, "job cancelled");
                } else {
                    // Interrupted by shutdown or lease loss, not by a user:
                    // back to Pending so another worker picks it up.
                    writer
                        .append(
                            EventType::JobRequeued,
                            &JobRequeued {
                                retry_count: meta.retry_count,
                                backoff_ms: 0,
                                reason: "interrupted by worker shutdown".to_string(),
                            },
                        )
                        .await?;
                    self.kernel
                        .metadata
                        .set_status(job_id, JobStatus::Pending)
                        .await?;
                    info!(job_id = %job_id, "job requeued after interruption");
                }
            }
            RunOutcome::Failed(failure) => {
                self.apply_retry_policy(meta, ctx, writer, failure).await?;
            }
        }
        Ok(())
    }

    async fn apply_retry_policy(
        &self,
        meta: &keel::JobMeta,
        ctx: ReplayContext,
        writer: &EventWriter,
        failure: StepFailure,
    ) -> Result<(), StoreError> {
        let job_id = meta.id;
        match failure.kind {
            FailureKind::Retryable if meta.retry_count < self.retry.retry_max => {
                let retry_count = meta.retry_count + 1;
                let backoff = self.retry.backoff_for(meta.retry_count);
                writer
                    .append(
                        EventType::JobRequeued,
                        &JobRequeued {
                            retry_count,
                            backoff_ms: backoff.as_millis() as i64,
                            reason: failure.inner.to_string(),
                        },
                    )
                    .await?;
                self.kernel
                    .metadata
                    .mark_requeued(job_id, retry_count, Utc::now() + backoff)
                    .await?;
                warn!(
                    job_id = %job_id,
                    retry_count,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %failure.inner,
                    "job requeued after retryable failure"
                );
            }
            FailureKind::Compensatable => {
                self.executor
                    .compensate(&failure.node_id, &ctx, writer)
                    .await?;
                self.fail(job_id, writer, &failure).await?;
            }
            _ => {
                self.fail(job_id, writer, &failure).await?;
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        writer: &EventWriter,
        failure: &StepFailure,
    ) -> Result<(), StoreError> {
        writer
            .append(
                EventType::JobFailed,
                &JobFailed {
                    reason: failure.inner.to_string(),
                    failure_kind: failure.kind.as_str().to_string(),
                    node_id: Some(failure.node_id.clone()),
                },
            )
            .await?;
        self.kernel
            .metadata
            .set_status(job_id, JobStatus::Failed)
            .await?;
        warn!(job_id = %job_id, kind = %failure.kind, error = %failure.inner, "job failed");
        Ok(())
    }

    async fn maybe_snapshot(&self, job_id: Uuid, ctx: &ReplayContext, writer: &EventWriter) {
        let version = writer.version().await;
        if version < self.config.snapshot_every {
            return;
        }
        // ctx.last_version may lag the writer: snapshot what was folded.
        let blob = match ctx.to_snapshot() {
            Ok(blob) => blob,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "snapshot serialization failed");
                return;
            }
        };
        if let Err(e) = self
            .kernel
            .events
            .create_snapshot(job_id, ctx.last_version, blob)
            .await
        {
            warn!(job_id = %job_id, error = %e, "snapshot write failed");
        }
    }

    fn spawn_heartbeat(&self, job_id: Uuid, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let events = self.kernel.events.clone();
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // Skip the immediate tick.
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match events.heartbeat(&worker_id, job_id).await {
                            Ok(()) => {}
                            Err(StoreError::ClaimNotFound { .. }) => {
                                // Lease lost: stop heartbeating and abort the
                                // execution at its next suspension point.
                                warn!(job_id = %job_id, "lease lost, cancelling execution");
                                cancel.cancel();
                                break;
                            }
                            Err(e) => warn!(job_id = %job_id, error = %e, "heartbeat failed"),
                        }
                    }
                }
            }
        })
    }

    fn spawn_cancel_watch(
        &self,
        job_id: Uuid,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let metadata = self.kernel.metadata.clone();
        let interval = self.config.cancel_poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match metadata.get(job_id).await {
                            Ok(meta) if meta.cancel_requested_at.is_some() => {
                                info!(job_id = %job_id, "cancel requested, stopping run");
                                cancel.cancel();
                                break;
                            }
                            Ok(_) => {}
                            Err(e) => debug!(job_id = %job_id, error = %e, "cancel poll failed"),
                        }
                    }
                }
            }
        })
    }
}
