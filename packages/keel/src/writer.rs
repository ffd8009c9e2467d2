//! Version-tracking append handle used by everything that writes into one
//! job's stream during a run.

use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{AppendContext, EventType, NewEvent};
use crate::store::EventStore;

/// Appends events for a single job, tracking the expected version locally.
///
/// On a `VersionMismatch` the writer reloads the current version and retries
/// once. That is safe for the worker's appends, which are logically
/// idempotent against concurrent signal delivery (the only other writer a
/// live lease admits); a second conflict propagates.
pub struct EventWriter {
    store: Arc<dyn EventStore>,
    job_id: Uuid,
    ctx: AppendContext,
    version: Mutex<i64>,
}

impl EventWriter {
    pub fn new(store: Arc<dyn EventStore>, job_id: Uuid, ctx: AppendContext, version: i64) -> Self {
        Self {
            store,
            job_id,
            ctx,
            version: Mutex::new(version),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn attempt_id(&self) -> Option<Uuid> {
        self.ctx.attempt_id
    }

    /// Current locally-tracked stream version.
    pub async fn version(&self) -> i64 {
        *self.version.lock().await
    }

    /// Append a typed payload, returning the new stream version.
    pub async fn append<P: serde::Serialize>(
        &self,
        event_type: EventType,
        payload: &P,
    ) -> Result<i64, StoreError> {
        self.append_value(event_type, serde_json::to_value(payload)?)
            .await
    }

    /// Append a raw JSON payload.
    pub async fn append_value(
        &self,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Result<i64, StoreError> {
        let mut version = self.version.lock().await;
        let event = NewEvent::new(event_type, payload);
        match self
            .store
            .append(&self.ctx, self.job_id, *version, event.clone())
            .await
        {
            Ok(new_version) => {
                *version = new_version;
                Ok(new_version)
            }
            Err(StoreError::VersionMismatch { current, .. }) => {
                let new_version = self
                    .store
                    .append(&self.ctx, self.job_id, current, event)
                    .await?;
                *version = new_version;
                Ok(new_version)
            }
            Err(e) => Err(e),
        }
    }
}
