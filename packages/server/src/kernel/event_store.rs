//! PostgreSQL-backed event store.
//!
//! Append is linearizable per job: the tail row is locked `FOR UPDATE`
//! inside the transaction, and the `(job_id, version)` primary key catches
//! any race the lock misses. Claims use `FOR UPDATE SKIP LOCKED` so
//! concurrent schedulers never hand the same job to two workers.

use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use keel::{
    seal_event, AppendContext, Claim, Event, EventStore, EventType, NewEvent, Snapshot, StoreError,
};

const WATCH_BUFFER: usize = 64;
const WATCH_POLL_INTERVAL: StdDuration = StdDuration::from_millis(250);

/// Event store over `job_events`, `job_claims`, and `job_snapshots`.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
    lease_ttl_ms: i64,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lease_ttl_ms: 30_000,
        }
    }

    pub fn with_lease_ttl(pool: PgPool, lease_ttl: StdDuration) -> Self {
        Self {
            pool,
            lease_ttl_ms: lease_ttl.as_millis() as i64,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_events(&self, job_id: Uuid) -> Result<Vec<Event>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT event_id, job_id, version, type, payload, created_at, prev_hash, hash
            FROM job_events
            WHERE job_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .context("listing job events")?;

        rows.into_iter().map(EventRow::into_event).collect()
    }

    /// One-statement claim: pick a candidate with `SKIP LOCKED`, upsert the
    /// lease, and report the stream version, all in one snapshot.
    async fn claim_inner(
        &self,
        worker_id: &str,
        job_id: Option<Uuid>,
    ) -> Result<Claim, StoreError> {
        let attempt_id = Uuid::new_v4();
        let row: Option<(Uuid, DateTime<Utc>, i64)> = sqlx::query_as(
            r#"
            WITH candidate AS (
                SELECT j.id
                FROM jobs j
                LEFT JOIN job_claims c ON c.job_id = j.id
                WHERE j.status NOT IN (5, 6, 7)
                  AND (c.job_id IS NULL OR c.expires_at <= NOW())
                  AND ($4::uuid IS NULL OR j.id = $4)
                ORDER BY j.created_at
                LIMIT 1
                FOR UPDATE OF j SKIP LOCKED
            ),
            lease AS (
                INSERT INTO job_claims (job_id, worker_id, expires_at, attempt_id)
                SELECT id, $1, NOW() + ($2 || ' milliseconds')::INTERVAL, $3
                FROM candidate
                ON CONFLICT (job_id) DO UPDATE SET
                    worker_id = EXCLUDED.worker_id,
                    expires_at = EXCLUDED.expires_at,
                    attempt_id = EXCLUDED.attempt_id
                RETURNING job_id, expires_at
            )
            SELECT l.job_id,
                   l.expires_at,
                   COALESCE((SELECT MAX(e.version) FROM job_events e WHERE e.job_id = l.job_id), 0)
            FROM lease l
            "#,
        )
        .bind(worker_id)
        .bind(self.lease_ttl_ms.to_string())
        .bind(attempt_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("claiming job")?;

        match row {
            Some((job_id, expires_at, version)) => Ok(Claim {
                job_id,
                version,
                attempt_id,
                expires_at,
            }),
            None => Err(StoreError::NoJob),
        }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn list_events(&self, job_id: Uuid) -> Result<(Vec<Event>, i64), StoreError> {
        let events = self.fetch_events(job_id).await?;
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
        let mut tx = self.pool.begin().await.context("starting append tx")?;

        // Lock the tail to serialize concurrent appenders on this job.
        let tail: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT version, hash
            FROM job_events
            WHERE job_id = $1
            ORDER BY version DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut *tx)
        .await
        .context("reading stream tail")?;

        let (current, prev_hash) = tail.unwrap_or((0, String::new()));
        if current != expected_version {
            return Err(StoreError::VersionMismatch {
                expected: expected_version,
                current,
            });
        }

        if let Some(attempt_id) = ctx.attempt_id {
            let live: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT attempt_id FROM job_claims
                WHERE job_id = $1 AND expires_at > NOW()
                "#,
            )
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await
            .context("checking lease fencing")?;
            if live != Some(attempt_id) {
                return Err(StoreError::StaleAttempt { job_id, attempt_id });
            }
        }

        let sealed = seal_event(job_id, current + 1, &prev_hash, event, Utc::now());
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_events (event_id, job_id, version, type, payload, created_at, prev_hash, hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(sealed.event_id)
        .bind(sealed.job_id)
        .bind(sealed.version)
        .bind(sealed.event_type.as_str())
        .bind(&sealed.payload)
        .bind(sealed.created_at)
        .bind(&sealed.prev_hash)
        .bind(&sealed.hash)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            // A racing appender slipped past the tail lock (first event of
            // a stream has no tail row to lock): same contract as a CAS miss.
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::VersionMismatch {
                    expected: expected_version,
                    current: expected_version + 1,
                });
            }
            Err(e) => return Err(StoreError::Backend(anyhow::Error::new(e).context("inserting event"))),
        }

        tx.commit().await.context("committing append")?;
        Ok(sealed.version)
    }

    async fn claim(&self, worker_id: &str) -> Result<Claim, StoreError> {
        self.claim_inner(worker_id, None).await
    }

    async fn claim_job(&self, worker_id: &str, job_id: Uuid) -> Result<Claim, StoreError> {
        self.claim_inner(worker_id, Some(job_id)).await
    }

    async fn heartbeat(&self, worker_id: &str, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_claims
            SET expires_at = NOW() + ($1 || ' milliseconds')::INTERVAL
            WHERE job_id = $2 AND worker_id = $3 AND expires_at > NOW()
            "#,
        )
        .bind(self.lease_ttl_ms.to_string())
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .context("extending lease")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimNotFound { job_id });
        }
        Ok(())
    }

    async fn release_claim(&self, worker_id: &str, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_claims WHERE job_id = $1 AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .context("releasing lease")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimNotFound { job_id });
        }
        Ok(())
    }

    async fn expired_claims(&self) -> Result<Vec<Uuid>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT job_id FROM job_claims WHERE expires_at <= NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing expired claims")?;
        Ok(ids)
    }

    async fn current_attempt_id(&self, job_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let attempt: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT attempt_id FROM job_claims
            WHERE job_id = $1 AND expires_at > NOW()
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("reading current attempt")?;
        Ok(attempt)
    }

    async fn watch(
        &self,
        job_id: Uuid,
        from_version: i64,
    ) -> Result<mpsc::Receiver<Event>, StoreError> {
        let (sender, receiver) = mpsc::channel(WATCH_BUFFER);
        let store = self.clone();
        tokio::spawn(async move {
            let mut cursor = from_version;
            let mut interval = tokio::time::interval(WATCH_POLL_INTERVAL);
            loop {
                interval.tick().await;
                if sender.is_closed() {
                    break;
                }
                let events = match store.fetch_events(job_id).await {
                    Ok(events) => events,
                    Err(e) => {
                        debug!(job_id = %job_id, error = %e, "watch poll failed");
                        continue;
                    }
                };
                for event in events.into_iter() {
                    if event.version <= cursor {
                        continue;
                    }
                    cursor = event.version;
                    // Drop-on-full: the consumer re-lists if it lags.
                    if sender.try_send(event).is_err() && sender.is_closed() {
                        return;
                    }
                }
            }
        });
        Ok(receiver)
    }

    async fn create_snapshot(
        &self,
        job_id: Uuid,
        up_to_version: i64,
        blob: Vec<u8>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_snapshots (job_id, version, snapshot, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (job_id, version) DO UPDATE SET
                snapshot = EXCLUDED.snapshot,
                created_at = NOW()
            "#,
        )
        .bind(job_id)
        .bind(up_to_version)
        .bind(&blob)
        .execute(&self.pool)
        .await
        .context("writing snapshot")?;
        Ok(())
    }

    async fn latest_snapshot(&self, job_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let row: Option<(Uuid, i64, Vec<u8>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT job_id, version, snapshot, created_at
            FROM job_snapshots
            WHERE job_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("reading latest snapshot")?;

        Ok(row.map(|(job_id, version, blob, created_at)| Snapshot {
            job_id,
            version,
            blob,
            created_at,
        }))
    }

    async fn delete_snapshots_before(
        &self,
        job_id: Uuid,
        version: i64,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM job_snapshots WHERE job_id = $1 AND version < $2
            "#,
        )
        .bind(job_id)
        .bind(version)
        .execute(&self.pool)
        .await
        .context("deleting snapshots")?;
        Ok(result.rows_affected())
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Raw `job_events` row; the wire `type` string is parsed back into the
/// closed enumeration.
#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    job_id: Uuid,
    version: i64,
    #[sqlx(rename = "type")]
    event_type: String,
    payload: serde_json::Value,
    created_at: DateTime<Utc>,
    prev_hash: String,
    hash: String,
}

impl EventRow {
    fn into_event(self) -> Result<Event, StoreError> {
        let event_type: EventType = self
            .event_type
            .parse()
            .map_err(|e: keel::UnknownEventType| StoreError::Backend(anyhow::Error::new(e)))?;
        Ok(Event {
            event_id: self.event_id,
            job_id: self.job_id,
            version: self.version,
            event_type,
            payload: self.payload,
            created_at: self.created_at,
            prev_hash: self.prev_hash,
            hash: self.hash,
        })
    }
}
