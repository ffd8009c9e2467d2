//! PostgreSQL signal inbox.
//!
//! Rows are the durable witness of delivery: the API path appends before
//! touching the event stream, and the sweeper retries anything left
//! unacked, which is what makes delivery at-least-once across restarts.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use keel::{SignalInbox, SignalRecord, StoreError};

#[derive(Clone)]
pub struct PostgresSignalInbox {
    pool: PgPool,
}

impl PostgresSignalInbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SignalInbox for PostgresSignalInbox {
    async fn push(
        &self,
        job_id: Uuid,
        correlation_key: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO signal_inbox (id, job_id, correlation_key, payload, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(id)
        .bind(job_id)
        .bind(correlation_key)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .context("appending signal")?;
        Ok(id)
    }

    async fn mark_acked(&self, signal_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE signal_inbox SET acked_at = NOW() WHERE id = $1 AND acked_at IS NULL
            "#,
        )
        .bind(signal_id)
        .execute(&self.pool)
        .await
        .context("acking signal")?;
        Ok(())
    }

    async fn unacked(&self, limit: i64) -> Result<Vec<SignalRecord>, StoreError> {
        let rows: Vec<(Uuid, Uuid, String, serde_json::Value, DateTime<Utc>, Option<DateTime<Utc>>)> =
            sqlx::query_as(
                r#"
                SELECT id, job_id, correlation_key, payload, created_at, acked_at
                FROM signal_inbox
                WHERE acked_at IS NULL
                ORDER BY created_at
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("listing unacked signals")?;

        Ok(rows
            .into_iter()
            .map(
                |(id, job_id, correlation_key, payload, created_at, acked_at)| SignalRecord {
                    id,
                    job_id,
                    correlation_key,
                    payload,
                    created_at,
                    acked_at,
                },
            )
            .collect())
    }
}
