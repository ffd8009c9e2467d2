//! Job metadata rows.
//!
//! The row is a projection of the event stream kept denormalized so claim
//! selection is one indexed query. `required_capabilities` is stored as a
//! comma-separated list and compared with `string_to_array ... <@` during
//! selection.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use keel::{
    ClaimSelector, InsertOutcome, JobMeta, JobStatus, MetadataStore, NewJob, StoreError,
};

const JOB_COLUMNS: &str = r#"id, tenant_id, agent_id, session_id, goal, status, cursor,
       retry_count, priority, queue_class, required_capabilities, idempotency_key,
       cancel_requested_at, execution_version, plan_version, next_run_at,
       created_at, updated_at"#;

/// One row of `jobs`.
#[derive(FromRow, Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobRow {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    #[builder(default, setter(strip_option))]
    pub tenant_id: Option<Uuid>,
    pub agent_id: String,
    #[builder(default, setter(strip_option))]
    pub session_id: Option<Uuid>,
    pub goal: String,
    #[builder(default = JobStatus::Pending.as_i32())]
    pub status: i32,
    #[builder(default, setter(strip_option))]
    pub cursor: Option<String>,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 2)]
    pub priority: i16,
    #[builder(default = "default".to_string())]
    pub queue_class: String,
    #[builder(default)]
    pub required_capabilities: String,
    #[builder(default, setter(strip_option))]
    pub idempotency_key: Option<String>,
    #[builder(default, setter(strip_option))]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    #[builder(default = 1)]
    pub execution_version: i32,
    #[builder(default = 1)]
    pub plan_version: i32,
    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    pub fn into_meta(self) -> JobMeta {
        JobMeta {
            id: self.id,
            tenant_id: self.tenant_id,
            agent_id: self.agent_id,
            session_id: self.session_id,
            goal: self.goal,
            status: JobStatus::from_i32(self.status).unwrap_or_default(),
            cursor: self.cursor,
            retry_count: self.retry_count,
            priority: self.priority,
            queue_class: self.queue_class,
            required_capabilities: split_capabilities(&self.required_capabilities),
            idempotency_key: self.idempotency_key,
            cancel_requested_at: self.cancel_requested_at,
            execution_version: self.execution_version,
            plan_version: self.plan_version,
            next_run_at: self.next_run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

pub fn split_capabilities(stored: &str) -> Vec<String> {
    stored
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn join_capabilities(capabilities: &[String]) -> String {
    capabilities.join(",")
}

/// `MetadataStore` over the `jobs` table.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_idempotency_key(
        &self,
        agent_id: &str,
        key: &str,
    ) -> Result<Option<JobMeta>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE agent_id = $1 AND idempotency_key = $2
            LIMIT 1
            "#
        ))
        .bind(agent_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .context("looking up idempotency key")?;
        Ok(row.map(JobRow::into_meta))
    }
}

#[async_trait]
impl MetadataStore for PostgresJobStore {
    async fn insert(&self, job: NewJob) -> Result<InsertOutcome, StoreError> {
        if let Some(key) = &job.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(&job.agent_id, key).await? {
                return Ok(InsertOutcome::Duplicate(existing));
            }
        }

        let row = JobRow::builder()
            .agent_id(job.agent_id.clone())
            .goal(job.goal)
            .priority(job.priority)
            .queue_class(job.queue_class)
            .required_capabilities(join_capabilities(&job.required_capabilities))
            .build();
        let row = JobRow {
            tenant_id: job.tenant_id,
            session_id: job.session_id,
            idempotency_key: job.idempotency_key.clone(),
            ..row
        };

        let inserted: Result<JobRow, sqlx::Error> = sqlx::query_as(&format!(
            r#"
            INSERT INTO jobs (
                id, tenant_id, agent_id, session_id, goal, status, cursor,
                retry_count, priority, queue_class, required_capabilities, idempotency_key,
                cancel_requested_at, execution_version, plan_version, next_run_at,
                created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11, $12,
                $13, $14, $15, $16,
                $17, $18
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(row.id)
        .bind(row.tenant_id)
        .bind(&row.agent_id)
        .bind(row.session_id)
        .bind(&row.goal)
        .bind(row.status)
        .bind(&row.cursor)
        .bind(row.retry_count)
        .bind(row.priority)
        .bind(&row.queue_class)
        .bind(&row.required_capabilities)
        .bind(&row.idempotency_key)
        .bind(row.cancel_requested_at)
        .bind(row.execution_version)
        .bind(row.plan_version)
        .bind(row.next_run_at)
        .bind(row.created_at)
        .bind(row.updated_at)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok(InsertOutcome::Created(row.into_meta())),
            // The partial unique index is the backstop for insert races.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                let key = job.idempotency_key.as_deref().unwrap_or_default();
                let existing = self
                    .find_by_idempotency_key(&job.agent_id, key)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Backend(anyhow::anyhow!(
                            "unique violation without a matching job row"
                        ))
                    })?;
                Ok(InsertOutcome::Duplicate(existing))
            }
            Err(e) => Err(StoreError::Backend(
                anyhow::Error::new(e).context("inserting job row"),
            )),
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<JobMeta, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE id = $1
            "#
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("reading job row")?;
        row.map(JobRow::into_meta)
            .ok_or(StoreError::JobNotFound(job_id))
    }

    async fn set_status(&self, job_id: Uuid, status: JobStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = $1, updated_at = NOW() WHERE id = $2
            "#,
        )
        .bind(status.as_i32())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("updating job status")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1, next_run_at = NULL, updated_at = NOW()
            WHERE id = $2 AND status IN ($3, $4)
            "#,
        )
        .bind(JobStatus::Running.as_i32())
        .bind(job_id)
        .bind(JobStatus::Pending.as_i32())
        .bind(JobStatus::Retrying.as_i32())
        .execute(&self.pool)
        .await
        .context("marking job running")?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_requeued(
        &self,
        job_id: Uuid,
        retry_count: i32,
        next_run_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1, retry_count = $2, next_run_at = $3, updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(JobStatus::Retrying.as_i32())
        .bind(retry_count)
        .bind(next_run_at)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("requeueing job")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn request_cancel(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET cancel_requested_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status NOT IN ($2, $3, $4)
            "#,
        )
        .bind(job_id)
        .bind(JobStatus::Completed.as_i32())
        .bind(JobStatus::Failed.as_i32())
        .bind(JobStatus::Cancelled.as_i32())
        .execute(&self.pool)
        .await
        .context("requesting cancel")?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_cursor(
        &self,
        job_id: Uuid,
        cursor: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs SET cursor = $1, updated_at = NOW() WHERE id = $2
            "#,
        )
        .bind(cursor)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("recording cursor")?;
        Ok(())
    }

    async fn next_pending(&self, selector: &ClaimSelector) -> Result<Option<JobMeta>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status IN ($1, $2)
              AND (next_run_at IS NULL OR next_run_at <= NOW())
              AND ($3::text IS NULL OR queue_class = $3)
              AND ($4::uuid IS NULL OR tenant_id = $4)
              AND (required_capabilities = ''
                   OR string_to_array(required_capabilities, ',') <@ $5::text[])
            ORDER BY priority, created_at
            LIMIT 1
            "#
        ))
        .bind(JobStatus::Pending.as_i32())
        .bind(JobStatus::Retrying.as_i32())
        .bind(selector.queue_class.as_deref())
        .bind(selector.tenant_id)
        .bind(&selector.capabilities)
        .fetch_optional(&self.pool)
        .await
        .context("selecting next pending job")?;
        Ok(row.map(JobRow::into_meta))
    }

    async fn oldest_pending_before(
        &self,
        cutoff: DateTime<Utc>,
        selector: &ClaimSelector,
    ) -> Result<Option<JobMeta>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status IN ($1, $2)
              AND (next_run_at IS NULL OR next_run_at <= NOW())
              AND created_at <= $3
              AND ($4::uuid IS NULL OR tenant_id = $4)
              AND (required_capabilities = ''
                   OR string_to_array(required_capabilities, ',') <@ $5::text[])
            ORDER BY created_at
            LIMIT 1
            "#
        ))
        .bind(JobStatus::Pending.as_i32())
        .bind(JobStatus::Retrying.as_i32())
        .bind(cutoff)
        .bind(selector.tenant_id)
        .bind(&selector.capabilities)
        .fetch_optional(&self.pool)
        .await
        .context("selecting starved job")?;
        Ok(row.map(JobRow::into_meta))
    }

    async fn list_by_status(
        &self,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<JobMeta>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = $1
            ORDER BY created_at
            LIMIT $2
            "#
        ))
        .bind(status.as_i32())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing jobs by status")?;
        Ok(rows.into_iter().map(JobRow::into_meta).collect())
    }
}
