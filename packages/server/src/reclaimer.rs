//! Reclaimer: sweeps expired leases back to Pending.
//!
//! Blocked jobs (open `job_waiting`) are left parked; they come back only
//! through the signal inbox. The sweep never appends events.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::kernel::JobKernel;

pub struct Reclaimer {
    kernel: JobKernel,
    interval: Duration,
}

impl Reclaimer {
    /// Recommended interval: `lease_ttl / 2`.
    pub fn new(kernel: JobKernel, interval: Duration) -> Self {
        Self { kernel, interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "reclaimer starting");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match keel::reclaim_expired(
                        self.kernel.events.as_ref(),
                        self.kernel.metadata.as_ref(),
                    )
                    .await
                    {
                        Ok(reclaimed) if !reclaimed.is_empty() => {
                            info!(count = reclaimed.len(), "reclaimed orphaned jobs");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "reclaim sweep failed"),
                    }
                }
            }
        }
        info!("reclaimer stopped");
    }
}
