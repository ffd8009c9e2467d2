//! Signal sweeper: finishes interrupted deliveries and fires due timers.
//!
//! The inbox is the durable witness of the at-least-once contract; any row
//! left unacked by a crashed API process gets redelivered here. Timer waits
//! are the one wait type the platform wakes on its own.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use keel::SignalInbox;

use crate::kernel::JobKernel;

const SWEEP_BATCH: i64 = 100;

pub struct SignalSweeper {
    kernel: JobKernel,
    interval: Duration,
}

impl SignalSweeper {
    pub fn new(kernel: JobKernel, interval: Duration) -> Self {
        Self { kernel, interval }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "signal sweeper starting");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
        info!("signal sweeper stopped");
    }

    async fn sweep(&self) {
        match self.kernel.inbox.unacked(SWEEP_BATCH).await {
            Ok(signals) => {
                for signal in signals {
                    if let Err(e) = keel::redeliver_signal(
                        self.kernel.events.as_ref(),
                        self.kernel.metadata.as_ref(),
                        self.kernel.inbox.as_ref(),
                        &signal,
                    )
                    .await
                    {
                        error!(signal_id = %signal.id, error = %e, "signal redelivery failed");
                    }
                }
            }
            Err(e) => error!(error = %e, "listing unacked signals failed"),
        }

        match keel::fire_due_timers(
            self.kernel.events.as_ref(),
            self.kernel.metadata.as_ref(),
            SWEEP_BATCH,
        )
        .await
        {
            Ok(woken) if !woken.is_empty() => {
                info!(count = woken.len(), "timer waits fired");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "timer sweep failed"),
        }
    }
}
