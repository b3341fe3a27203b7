//! PostgreSQL job store.

use super::DatabasePool;
use crate::error::{JobError, JobResult};
use crate::job::{CancelOutcome, FailOutcome, GenerationJob, JobStatus, NewGenerationJob};
use crate::retry::RetryConfig;
use crate::store::JobStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use horizon_core::{JobId, TemplateId};
use sqlx::{FromRow, PgExecutor};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Eligibility predicate shared by the candidate subquery and the outer
/// update, so a row that changed in between is not claimed.
const CLAIMABLE: &str = "((status = 'pending' AND scheduled_for <= NOW()) \
     OR (status = 'running' AND (available_at IS NULL OR available_at < NOW())))";

#[derive(Clone)]
pub struct PgJobStore {
    pool: Arc<DatabasePool>,
}

impl PgJobStore {
    #[must_use]
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }
}

/// Database row representation of a generation job.
#[derive(Debug, FromRow)]
pub(super) struct JobRow {
    id: Uuid,
    template_id: Uuid,
    generate_from: DateTime<Utc>,
    generate_until: DateTime<Utc>,
    scheduled_for: DateTime<Utc>,
    created_at: DateTime<Utc>,
    status: String,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    available_at: Option<DateTime<Utc>>,
    retry_count: i32,
    last_error: Option<String>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for GenerationJob {
    type Error = JobError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(GenerationJob {
            id: JobId::from_uuid(row.id),
            template_id: TemplateId::from_uuid(row.template_id),
            generate_from: row.generate_from,
            generate_until: row.generate_until,
            scheduled_for: row.scheduled_for,
            created_at: row.created_at,
            status: row.status.parse()?,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            available_at: row.available_at,
            retry_count: count_from_db(row.retry_count)?,
            last_error: row.last_error,
            completed_at: row.completed_at,
        })
    }
}

pub(super) fn count_from_db(value: i32) -> JobResult<u32> {
    u32::try_from(value).map_err(|_| JobError::Internal(format!("negative retry_count {value} in database")))
}

pub(super) fn count_to_db(value: u32) -> JobResult<i32> {
    i32::try_from(value).map_err(|_| JobError::Internal(format!("retry_count {value} out of range")))
}

/// Inserts one pending row. Shared with dead-letter retry, which runs it
/// inside its own transaction.
pub(super) async fn insert_pending<'e, E>(executor: E, job: &NewGenerationJob) -> JobResult<GenerationJob>
where
    E: PgExecutor<'e>,
{
    job.validate()?;
    let row: JobRow = sqlx::query_as(
        r#"
        INSERT INTO generation_jobs (id, template_id, generate_from, generate_until, scheduled_for)
        VALUES ($1, $2, $3, $4, COALESCE($5, NOW()))
        RETURNING *
        "#,
    )
    .bind(job.id.into_inner())
    .bind(job.template_id.into_inner())
    .bind(job.generate_from)
    .bind(job.generate_until)
    .bind(job.scheduled_for)
    .fetch_one(executor)
    .await?;

    row.try_into()
}

/// Explains why a guarded update touched no row: the job is gone, or it is
/// no longer running under `worker_id`.
pub(super) async fn missing_claim<'e, E>(executor: E, id: JobId, worker_id: &str) -> JobError
where
    E: PgExecutor<'e>,
{
    let exists: Result<bool, sqlx::Error> = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM generation_jobs WHERE id = $1)")
        .bind(id.into_inner())
        .fetch_one(executor)
        .await;

    match exists {
        Ok(true) => JobError::lease_lost(id, worker_id),
        Ok(false) => JobError::NotFound(format!("job {id}")),
        Err(e) => e.into(),
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, job: NewGenerationJob) -> JobResult<GenerationJob> {
        debug!(job_id = %job.id, template_id = %job.template_id, "Inserting generation job");
        insert_pending(self.pool.inner(), &job).await
    }

    async fn insert_many(&self, jobs: Vec<NewGenerationJob>) -> JobResult<Vec<GenerationJob>> {
        debug!(count = jobs.len(), "Inserting generation jobs");
        for job in &jobs {
            job.validate()?;
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(jobs.len());
        for job in &jobs {
            inserted.push(insert_pending(&mut *tx, job).await?);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_job(&self, id: JobId) -> JobResult<Option<GenerationJob>> {
        debug!(job_id = %id, "Finding generation job");
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM generation_jobs WHERE id = $1")
            .bind(id.into_inner())
            .fetch_optional(self.pool.inner())
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn claim_next(&self, worker_id: &str, lease: Duration) -> JobResult<Option<GenerationJob>> {
        debug!(worker_id, "Claiming next generation job");
        let sql = format!(
            r#"
            UPDATE generation_jobs
            SET status = 'running',
                claimed_by = $1,
                claimed_at = NOW(),
                available_at = NOW() + make_interval(secs => $2)
            WHERE id = (
                SELECT id FROM generation_jobs
                WHERE {CLAIMABLE}
                ORDER BY scheduled_for, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND {CLAIMABLE}
            RETURNING *
            "#
        );

        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(worker_id)
            .bind(lease.as_secs_f64())
            .fetch_optional(self.pool.inner())
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn extend_availability(&self, id: JobId, worker_id: &str, extension: Duration) -> JobResult<DateTime<Utc>> {
        debug!(job_id = %id, worker_id, "Extending job lease");
        let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            UPDATE generation_jobs
            SET available_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND status = 'running' AND claimed_by = $2
            RETURNING available_at
            "#,
        )
        .bind(id.into_inner())
        .bind(worker_id)
        .bind(extension.as_secs_f64())
        .fetch_optional(self.pool.inner())
        .await?;

        match expires_at {
            Some(at) => Ok(at),
            None => Err(missing_claim(self.pool.inner(), id, worker_id).await),
        }
    }

    async fn complete(&self, id: JobId, worker_id: &str) -> JobResult<()> {
        debug!(job_id = %id, worker_id, "Completing generation job");
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET status = 'completed', completed_at = NOW(), available_at = NULL
            WHERE id = $1 AND status = 'running' AND claimed_by = $2
            "#,
        )
        .bind(id.into_inner())
        .bind(worker_id)
        .execute(self.pool.inner())
        .await?;

        if result.rows_affected() == 0 {
            return Err(missing_claim(self.pool.inner(), id, worker_id).await);
        }
        Ok(())
    }

    async fn fail(&self, id: JobId, worker_id: &str, error_message: &str, retry: &RetryConfig) -> JobResult<FailOutcome> {
        debug!(job_id = %id, worker_id, "Failing generation job");
        let mut tx = self.pool.begin().await?;

        let current: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT retry_count FROM generation_jobs
            WHERE id = $1 AND status = 'running' AND claimed_by = $2
            FOR UPDATE
            "#,
        )
        .bind(id.into_inner())
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            let err = missing_claim(&mut *tx, id, worker_id).await;
            tx.rollback().await?;
            return Err(err);
        };

        let retry_count = count_from_db(current)?.saturating_add(1);

        if !retry.should_retry(retry_count) {
            // Stays running under this worker until it is dead-lettered.
            sqlx::query("UPDATE generation_jobs SET retry_count = $2, last_error = $3 WHERE id = $1")
                .bind(id.into_inner())
                .bind(count_to_db(retry_count)?)
                .bind(error_message)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(FailOutcome {
                will_retry: false,
                retry_count,
                next_attempt_at: None,
            });
        }

        let next_attempt_at: DateTime<Utc> = sqlx::query_scalar(
            r#"
            UPDATE generation_jobs
            SET status = 'pending',
                claimed_by = NULL,
                claimed_at = NULL,
                available_at = NULL,
                retry_count = $2,
                last_error = $3,
                scheduled_for = NOW() + make_interval(secs => $4)
            WHERE id = $1
            RETURNING scheduled_for
            "#,
        )
        .bind(id.into_inner())
        .bind(count_to_db(retry_count)?)
        .bind(error_message)
        .bind(retry.backoff(retry_count).as_secs_f64())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(FailOutcome {
            will_retry: true,
            retry_count,
            next_attempt_at: Some(next_attempt_at),
        })
    }

    async fn cancel(&self, id: JobId) -> JobResult<CancelOutcome> {
        debug!(job_id = %id, "Cancelling generation job");
        let cancelled: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE generation_jobs
            SET status = 'cancelled', available_at = NULL
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING id
            "#,
        )
        .bind(id.into_inner())
        .fetch_optional(self.pool.inner())
        .await?;

        if cancelled.is_some() {
            return Ok(CancelOutcome::Cancelled);
        }

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM generation_jobs WHERE id = $1")
            .bind(id.into_inner())
            .fetch_optional(self.pool.inner())
            .await?;

        match status {
            Some(status) => Ok(CancelOutcome::AlreadyTerminal(status.parse::<JobStatus>()?)),
            None => Err(JobError::NotFound(format!("job {id}"))),
        }
    }

    async fn has_open_job(&self, template_id: TemplateId) -> JobResult<bool> {
        let open: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM generation_jobs
                WHERE template_id = $1 AND status IN ('pending', 'running')
            )
            "#,
        )
        .bind(template_id.into_inner())
        .fetch_one(self.pool.inner())
        .await?;
        Ok(open)
    }

    async fn ping(&self) -> JobResult<()> {
        sqlx::query("SELECT 1").execute(self.pool.inner()).await?;
        Ok(())
    }
}
