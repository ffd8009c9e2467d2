//! PostgreSQL tool invocation ledger.
//!
//! Every write is lease-fenced inside its transaction: the attempt id must
//! match the live claim for the job or the write fails with `StaleAttempt`.
//! The `(job_id, idempotency_key)` primary key makes `begin` idempotent.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use keel::{
    StoreError, ToolInvocationLedger, ToolInvocationRecord, ToolInvocationStatus,
};

#[derive(Clone)]
pub struct PostgresToolLedger {
    pool: PgPool,
}

impl PostgresToolLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fence(
        tx: &mut Transaction<'_, Postgres>,
        job_id: Uuid,
        attempt_id: Uuid,
    ) -> Result<(), StoreError> {
        let live: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT attempt_id FROM job_claims
            WHERE job_id = $1 AND expires_at > NOW()
            "#,
        )
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await
        .context("checking ledger fencing")?;
        if live != Some(attempt_id) {
            return Err(StoreError::StaleAttempt { job_id, attempt_id });
        }
        Ok(())
    }
}

#[async_trait]
impl ToolInvocationLedger for PostgresToolLedger {
    async fn begin(
        &self,
        attempt_id: Uuid,
        record: ToolInvocationRecord,
    ) -> Result<ToolInvocationRecord, StoreError> {
        let mut tx = self.pool.begin().await.context("starting ledger tx")?;
        Self::fence(&mut tx, record.job_id, attempt_id).await?;

        let result_bytes = record
            .result
            .as_ref()
            .map(serde_json::to_vec)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO tool_invocations (
                job_id, idempotency_key, invocation_id, step_id, tool_name, args_hash,
                status, result, committed, external_id, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (job_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(record.job_id)
        .bind(&record.idempotency_key)
        .bind(record.invocation_id)
        .bind(&record.step_id)
        .bind(&record.tool_name)
        .bind(&record.args_hash)
        .bind(status_str(record.status))
        .bind(&result_bytes)
        .bind(record.committed)
        .bind(&record.external_id)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(&mut *tx)
        .await
        .context("beginning tool invocation")?;

        let stored = fetch_one(&mut tx, record.job_id, &record.idempotency_key).await?;
        tx.commit().await.context("committing ledger begin")?;
        stored.ok_or_else(|| {
            StoreError::Backend(anyhow::anyhow!("ledger row vanished during begin"))
        })
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
        let mut tx = self.pool.begin().await.context("starting ledger tx")?;
        Self::fence(&mut tx, job_id, attempt_id).await?;

        let result_bytes = result.as_ref().map(serde_json::to_vec).transpose()?;
        let updated = sqlx::query(
            r#"
            UPDATE tool_invocations
            SET status = $1,
                result = $2,
                committed = $3,
                external_id = COALESCE($4, external_id),
                finished_at = NOW()
            WHERE job_id = $5 AND idempotency_key = $6
            "#,
        )
        .bind(status_str(status))
        .bind(&result_bytes)
        .bind(status == ToolInvocationStatus::Succeeded)
        .bind(&external_id)
        .bind(job_id)
        .bind(idempotency_key)
        .execute(&mut *tx)
        .await
        .context("committing tool invocation")?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::Backend(anyhow::anyhow!(
                "commit for unknown invocation {idempotency_key}"
            )));
        }
        tx.commit().await.context("committing ledger tx")?;
        Ok(())
    }

    async fn find(
        &self,
        job_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<ToolInvocationRecord>, StoreError> {
        let mut tx = self.pool.begin().await.context("starting ledger read")?;
        let record = fetch_one(&mut tx, job_id, idempotency_key).await?;
        tx.commit().await.context("closing ledger read")?;
        Ok(record)
    }

    async fn pending_for_job(
        &self,
        job_id: Uuid,
    ) -> Result<Vec<ToolInvocationRecord>, StoreError> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT job_id, idempotency_key, invocation_id, step_id, tool_name, args_hash,
                   status, result, committed, external_id, started_at, finished_at
            FROM tool_invocations
            WHERE job_id = $1 AND status = 'started'
            ORDER BY started_at
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .context("listing pending invocations")?;
        rows.into_iter().map(LedgerRow::into_record).collect()
    }
}

async fn fetch_one(
    tx: &mut Transaction<'_, Postgres>,
    job_id: Uuid,
    idempotency_key: &str,
) -> Result<Option<ToolInvocationRecord>, StoreError> {
    let row: Option<LedgerRow> = sqlx::query_as(
        r#"
        SELECT job_id, idempotency_key, invocation_id, step_id, tool_name, args_hash,
               status, result, committed, external_id, started_at, finished_at
        FROM tool_invocations
        WHERE job_id = $1 AND idempotency_key = $2
        "#,
    )
    .bind(job_id)
    .bind(idempotency_key)
    .fetch_optional(&mut **tx)
    .await
    .context("reading ledger row")?;
    row.map(LedgerRow::into_record).transpose()
}

fn status_str(status: ToolInvocationStatus) -> &'static str {
    match status {
        ToolInvocationStatus::Started => "started",
        ToolInvocationStatus::Succeeded => "succeeded",
        ToolInvocationStatus::Failed => "failed",
    }
}

fn parse_status(raw: &str) -> Result<ToolInvocationStatus, StoreError> {
    match raw {
        "started" => Ok(ToolInvocationStatus::Started),
        "succeeded" => Ok(ToolInvocationStatus::Succeeded),
        "failed" => Ok(ToolInvocationStatus::Failed),
        other => Err(StoreError::Backend(anyhow::anyhow!(
            "unknown invocation status: {other}"
        ))),
    }
}

#[derive(sqlx::FromRow)]
struct LedgerRow {
    job_id: Uuid,
    idempotency_key: String,
    invocation_id: Uuid,
    step_id: String,
    tool_name: String,
    args_hash: String,
    status: String,
    result: Option<Vec<u8>>,
    committed: bool,
    external_id: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl LedgerRow {
    fn into_record(self) -> Result<ToolInvocationRecord, StoreError> {
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_slice)
            .transpose()?;
        Ok(ToolInvocationRecord {
            job_id: self.job_id,
            idempotency_key: self.idempotency_key,
            invocation_id: self.invocation_id,
            step_id: self.step_id,
            tool_name: self.tool_name,
            args_hash: self.args_hash,
            status: parse_status(&self.status)?,
            result,
            committed: self.committed,
            external_id: self.external_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}
