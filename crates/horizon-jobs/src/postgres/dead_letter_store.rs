//! PostgreSQL dead-letter store.

use super::job_store::{count_from_db, count_to_db, insert_pending, missing_claim, JobRow};
use super::DatabasePool;
use crate::error::{JobError, JobResult};
use crate::job::{DeadLetterJob, DeadLetterReason, GenerationJob, NewGenerationJob};
use crate::store::DeadLetterStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use horizon_core::{DeadLetterId, JobId, TemplateId};
use sqlx::FromRow;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: Arc<DatabasePool>,
}

impl PgDeadLetterStore {
    #[must_use]
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct DeadLetterRow {
    id: Uuid,
    original_job_id: Uuid,
    template_id: Uuid,
    generate_from: DateTime<Utc>,
    generate_until: DateTime<Utc>,
    error_type: String,
    error_message: String,
    stack_trace: Option<String>,
    failed_at: DateTime<Utc>,
    retry_count: i32,
    last_worker_id: String,
    resolution: Option<String>,
    reviewed_by: Option<String>,
    reviewed_at: Option<DateTime<Utc>>,
    note: Option<String>,
    retried_job_id: Option<Uuid>,
}

impl TryFrom<DeadLetterRow> for DeadLetterJob {
    type Error = JobError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(DeadLetterJob {
            id: DeadLetterId::from_uuid(row.id),
            original_job_id: JobId::from_uuid(row.original_job_id),
            template_id: TemplateId::from_uuid(row.template_id),
            generate_from: row.generate_from,
            generate_until: row.generate_until,
            error_type: row.error_type,
            error_message: row.error_message,
            stack_trace: row.stack_trace,
            failed_at: row.failed_at,
            retry_count: count_from_db(row.retry_count)?,
            last_worker_id: row.last_worker_id,
            resolution: row.resolution.as_deref().map(str::parse).transpose()?,
            reviewed_by: row.reviewed_by,
            reviewed_at: row.reviewed_at,
            note: row.note,
            retried_job_id: row.retried_job_id.map(JobId::from_uuid),
        })
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn move_to_dead_letter(&self, job_id: JobId, worker_id: &str, reason: DeadLetterReason) -> JobResult<DeadLetterJob> {
        debug!(job_id = %job_id, worker_id, error_type = %reason.error_type, "Moving job to dead letter");
        let mut tx = self.pool.begin().await?;

        let job: Option<JobRow> = sqlx::query_as(
            r#"
            UPDATE generation_jobs
            SET status = 'dead_lettered', available_at = NULL
            WHERE id = $1 AND status = 'running' AND claimed_by = $2
            RETURNING *
            "#,
        )
        .bind(job_id.into_inner())
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            let err = missing_claim(&mut *tx, job_id, worker_id).await;
            tx.rollback().await?;
            return Err(err);
        };
        let job = GenerationJob::try_from(job)?;

        let row: DeadLetterRow = sqlx::query_as(
            r#"
            INSERT INTO dead_letter_jobs (
                id, original_job_id, template_id, generate_from, generate_until,
                error_type, error_message, stack_trace, failed_at, retry_count, last_worker_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), $9, $10)
            RETURNING *
            "#,
        )
        .bind(DeadLetterId::new().into_inner())
        .bind(job.id.into_inner())
        .bind(job.template_id.into_inner())
        .bind(job.generate_from)
        .bind(job.generate_until)
        .bind(&reason.error_type)
        .bind(&reason.error_message)
        .bind(&reason.stack_trace)
        .bind(count_to_db(job.retry_count)?)
        .bind(worker_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn list_unresolved(&self, limit: u32) -> JobResult<Vec<DeadLetterJob>> {
        debug!(limit, "Listing unresolved dead letters");
        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            r#"
            SELECT * FROM dead_letter_jobs
            WHERE resolution IS NULL
            ORDER BY failed_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(self.pool.inner())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> JobResult<Option<DeadLetterJob>> {
        let row: Option<DeadLetterRow> = sqlx::query_as("SELECT * FROM dead_letter_jobs WHERE id = $1")
            .bind(id.into_inner())
            .fetch_optional(self.pool.inner())
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn retry_dead_letter(&self, id: DeadLetterId, reviewed_by: &str) -> JobResult<GenerationJob> {
        debug!(dead_letter_id = %id, reviewed_by, "Retrying dead letter");
        let mut tx = self.pool.begin().await?;

        let record: Option<DeadLetterRow> = sqlx::query_as(
            "SELECT * FROM dead_letter_jobs WHERE id = $1 AND resolution IS NULL FOR UPDATE",
        )
        .bind(id.into_inner())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(record) = record else {
            tx.rollback().await?;
            return Err(JobError::NotFound(format!("unresolved dead-letter job {id}")));
        };

        let job = insert_pending(
            &mut *tx,
            &NewGenerationJob::new(
                TemplateId::from_uuid(record.template_id),
                record.generate_from,
                record.generate_until,
            ),
        )
        .await?;

        sqlx::query(
            r#"
            UPDATE dead_letter_jobs
            SET resolution = 'retried', reviewed_by = $2, reviewed_at = NOW(), retried_job_id = $3
            WHERE id = $1
            "#,
        )
        .bind(id.into_inner())
        .bind(reviewed_by)
        .bind(job.id.into_inner())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn discard_dead_letter(&self, id: DeadLetterId, reviewed_by: &str, note: &str) -> JobResult<()> {
        debug!(dead_letter_id = %id, reviewed_by, "Discarding dead letter");
        let result = sqlx::query(
            r#"
            UPDATE dead_letter_jobs
            SET resolution = 'discarded', reviewed_by = $2, reviewed_at = NOW(), note = $3
            WHERE id = $1 AND resolution IS NULL
            "#,
        )
        .bind(id.into_inner())
        .bind(reviewed_by)
        .bind(note)
        .execute(self.pool.inner())
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(format!("unresolved dead-letter job {id}")));
        }
        Ok(())
    }

    async fn has_unresolved(&self, template_id: TemplateId) -> JobResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM dead_letter_jobs WHERE template_id = $1 AND resolution IS NULL)",
        )
        .bind(template_id.into_inner())
        .fetch_one(self.pool.inner())
        .await?;

        Ok(exists)
    }
}
