//! Scheduler: weighted fair queues, capability-routed claims, starvation
//! relief.
//!
//! One claimer loop selects jobs; execution fans out onto tasks bounded by
//! a semaphore of `max_concurrency`. Claim ordering is a ticket wheel:
//! each round mints tickets proportional to queue weight, each claim burns
//! one, and an empty wheel starts the next round. A job that has waited
//! past the starvation threshold is dispatched ahead of any ticket math.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use keel::{Claim, ClaimSelector, EventStore, JobMeta, MetadataStore, StoreError};

use crate::kernel::JobKernel;
use crate::worker::Worker;

/// One queue class and its weight in the ticket wheel.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub weight: u32,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Default queue weights.
pub fn default_queues() -> Vec<QueueConfig> {
    vec![
        QueueConfig::new("realtime", 70),
        QueueConfig::new("default", 20),
        QueueConfig::new("background", 8),
        QueueConfig::new("heavy", 2),
    ]
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub queues: Vec<QueueConfig>,
    /// Capabilities this scheduler's workers offer.
    pub capabilities: Vec<String>,
    /// Jobs pending longer than this jump the queue weights.
    pub starvation_threshold: Duration,
    /// Sleep when nothing is claimable.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            queues: default_queues(),
            capabilities: Vec::new(),
            starvation_threshold: Duration::from_secs(300),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Weighted ticket round-robin over queue classes.
///
/// `rotation()` yields queue names in claim-attempt order: funded queues
/// first (config order), exhausted ones after, so the scheduler stays
/// work-conserving when the funded queues are empty. `consume` burns a
/// ticket and refills the wheel when every queue hits zero.
#[derive(Debug)]
pub struct TicketWheel {
    queues: Vec<QueueConfig>,
    remaining: Vec<u32>,
}

impl TicketWheel {
    pub fn new(queues: Vec<QueueConfig>) -> Self {
        let remaining = queues.iter().map(|q| q.weight).collect();
        Self { queues, remaining }
    }

    pub fn rotation(&self) -> Vec<String> {
        let mut funded: Vec<String> = Vec::new();
        let mut exhausted: Vec<String> = Vec::new();
        for (queue, &left) in self.queues.iter().zip(&self.remaining) {
            if left > 0 {
                funded.push(queue.name.clone());
            } else {
                exhausted.push(queue.name.clone());
            }
        }
        funded.extend(exhausted);
        funded
    }

    pub fn consume(&mut self, queue: &str) {
        if let Some(idx) = self.queues.iter().position(|q| q.name == queue) {
            self.remaining[idx] = self.remaining[idx].saturating_sub(1);
        }
        if self.remaining.iter().all(|&left| left == 0) {
            for (idx, queue) in self.queues.iter().enumerate() {
                self.remaining[idx] = queue.weight;
            }
        }
    }

    pub fn remaining(&self, queue: &str) -> u32 {
        self.queues
            .iter()
            .position(|q| q.name == queue)
            .map(|idx| self.remaining[idx])
            .unwrap_or(0)
    }
}

/// The claim loop plus its execution pool.
pub struct Scheduler {
    kernel: JobKernel,
    worker: Arc<Worker>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(kernel: JobKernel, worker: Arc<Worker>, config: SchedulerConfig) -> Self {
        Self {
            kernel,
            worker,
            config,
        }
    }

    /// Run until shutdown, then drain in-flight jobs.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            worker_id = %self.worker.worker_id(),
            max_concurrency = self.config.max_concurrency,
            queues = self.config.queues.len(),
            "scheduler starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut wheel = TicketWheel::new(self.config.queues.clone());
        let mut handlers = JoinSet::new();

        loop {
            // Reap finished handlers without blocking.
            while handlers.try_join_next().is_some() {}

            if shutdown.is_cancelled() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim_next(&mut wheel).await {
                Ok(Some(claim)) => {
                    let worker = self.worker.clone();
                    let job_shutdown = shutdown.clone();
                    handlers.spawn(async move {
                        worker.run_claimed(claim, &job_shutdown).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "claim round failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!(
            in_flight = handlers.len(),
            "scheduler stopping, draining in-flight jobs"
        );
        while handlers.join_next().await.is_some() {}
        info!("scheduler stopped");
    }

    /// One claim attempt: starvation relief first, then the ticket wheel.
    async fn claim_next(&self, wheel: &mut TicketWheel) -> Result<Option<Claim>, StoreError> {
        if let Some(claim) = self.claim_starved().await? {
            return Ok(Some(claim));
        }

        for queue in wheel.rotation() {
            let selector = ClaimSelector {
                queue_class: Some(queue.clone()),
                capabilities: self.config.capabilities.clone(),
                tenant_id: None,
            };
            if let Some(claim) = self.claim_from(&selector).await? {
                wheel.consume(&queue);
                return Ok(Some(claim));
            }
        }
        Ok(None)
    }

    async fn claim_starved(&self) -> Result<Option<Claim>, StoreError> {
        let threshold = chrono::Duration::from_std(self.config.starvation_threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let cutoff = Utc::now() - threshold;
        let selector = ClaimSelector {
            queue_class: None,
            capabilities: self.config.capabilities.clone(),
            tenant_id: None,
        };
        let Some(candidate) = self
            .kernel
            .metadata
            .oldest_pending_before(cutoff, &selector)
            .await?
        else {
            return Ok(None);
        };
        debug!(job_id = %candidate.id, queue = %candidate.queue_class, "starvation relief dispatch");
        self.claim_candidate(candidate).await
    }

    async fn claim_from(&self, selector: &ClaimSelector) -> Result<Option<Claim>, StoreError> {
        let Some(candidate) = self.kernel.metadata.next_pending(selector).await? else {
            return Ok(None);
        };
        self.claim_candidate(candidate).await
    }

    /// Lease first (the real mutual exclusion), then flip the row. A rival
    /// scheduler that picked the same candidate loses at the lease and its
    /// round simply moves on.
    async fn claim_candidate(&self, candidate: JobMeta) -> Result<Option<Claim>, StoreError> {
        let claim = match self
            .kernel
            .events
            .claim_job(self.worker.worker_id(), candidate.id)
            .await
        {
            Ok(claim) => claim,
            Err(StoreError::NoJob) => return Ok(None),
            Err(e) => return Err(e),
        };

        if !self.kernel.metadata.mark_running(candidate.id).await? {
            // The row moved under us (cancelled, signalled, rival claim).
            warn!(job_id = %candidate.id, "claim raced on metadata, releasing lease");
            let _ = self
                .kernel
                .events
                .release_claim(self.worker.worker_id(), candidate.id)
                .await;
            return Ok(None);
        }

        Ok(Some(claim))
    }
}
