//! PostgreSQL stores for templates, exceptions and generated items.

use super::DatabasePool;
use crate::error::{JobError, JobResult};
use crate::generator::{ExceptionKind, ExceptionStore, ItemStore, RecurringTemplate, TaskException, TemplateStore, TodoItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use horizon_core::{ItemId, TemplateId};
use sqlx::FromRow;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgTemplateStore {
    pool: Arc<DatabasePool>,
}

impl PgTemplateStore {
    #[must_use]
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }

    /// Creates or replaces a template.
    pub async fn save_template(&self, template: &RecurringTemplate) -> JobResult<()> {
        debug!(template_id = %template.id, "Saving recurring template");
        sqlx::query(
            r#"
            INSERT INTO recurring_templates (
                id, title, anchor_at, interval_secs, sync_horizon_days,
                generation_horizon_days, generated_through, active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET title = EXCLUDED.title,
                anchor_at = EXCLUDED.anchor_at,
                interval_secs = EXCLUDED.interval_secs,
                sync_horizon_days = EXCLUDED.sync_horizon_days,
                generation_horizon_days = EXCLUDED.generation_horizon_days,
                active = EXCLUDED.active
            "#,
        )
        .bind(template.id.into_inner())
        .bind(&template.title)
        .bind(template.anchor_at)
        .bind(template.interval_secs)
        .bind(days_to_db(template.sync_horizon_days)?)
        .bind(days_to_db(template.generation_horizon_days)?)
        .bind(template.generated_through)
        .bind(template.active)
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }

    /// Records a per-occurrence override.
    pub async fn save_exception(&self, exception: &TaskException) -> JobResult<()> {
        let (kind, reschedule_to) = match exception.kind {
            ExceptionKind::Skip => ("skip", None),
            ExceptionKind::Reschedule { to } => ("reschedule", Some(to)),
        };
        sqlx::query(
            r#"
            INSERT INTO task_exceptions (template_id, occurs_at, kind, reschedule_to)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (template_id, occurs_at) DO UPDATE
            SET kind = EXCLUDED.kind, reschedule_to = EXCLUDED.reschedule_to
            "#,
        )
        .bind(exception.template_id.into_inner())
        .bind(exception.occurs_at)
        .bind(kind)
        .bind(reschedule_to)
        .execute(self.pool.inner())
        .await?;
        Ok(())
    }
}

fn days_to_db(days: u32) -> JobResult<i32> {
    i32::try_from(days).map_err(|_| JobError::ConstraintViolation(format!("horizon of {days} days is out of range")))
}

fn days_from_db(days: i32) -> JobResult<u32> {
    u32::try_from(days).map_err(|_| JobError::Internal(format!("negative horizon {days} in database")))
}

#[derive(Debug, FromRow)]
struct TemplateRow {
    id: Uuid,
    title: String,
    anchor_at: DateTime<Utc>,
    interval_secs: i64,
    sync_horizon_days: i32,
    generation_horizon_days: i32,
    generated_through: Option<DateTime<Utc>>,
    active: bool,
}

impl TryFrom<TemplateRow> for RecurringTemplate {
    type Error = JobError;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        Ok(RecurringTemplate {
            id: TemplateId::from_uuid(row.id),
            title: row.title,
            anchor_at: row.anchor_at,
            interval_secs: row.interval_secs,
            sync_horizon_days: days_from_db(row.sync_horizon_days)?,
            generation_horizon_days: days_from_db(row.generation_horizon_days)?,
            generated_through: row.generated_through,
            active: row.active,
        })
    }
}

#[derive(Debug, FromRow)]
struct ExceptionRow {
    template_id: Uuid,
    occurs_at: DateTime<Utc>,
    kind: String,
    reschedule_to: Option<DateTime<Utc>>,
}

impl TryFrom<ExceptionRow> for TaskException {
    type Error = JobError;

    fn try_from(row: ExceptionRow) -> Result<Self, Self::Error> {
        let kind = match (row.kind.as_str(), row.reschedule_to) {
            ("skip", _) => ExceptionKind::Skip,
            ("reschedule", Some(to)) => ExceptionKind::Reschedule { to },
            (other, _) => {
                return Err(JobError::Internal(format!("malformed task exception of kind '{other}'")));
            }
        };
        Ok(TaskException {
            template_id: TemplateId::from_uuid(row.template_id),
            occurs_at: row.occurs_at,
            kind,
        })
    }
}

#[async_trait]
impl TemplateStore for PgTemplateStore {
    async fn get_template(&self, id: TemplateId) -> JobResult<Option<RecurringTemplate>> {
        let row: Option<TemplateRow> = sqlx::query_as("SELECT * FROM recurring_templates WHERE id = $1")
            .bind(id.into_inner())
            .fetch_optional(self.pool.inner())
            .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn find_stale_templates(&self, now: DateTime<Utc>, limit: u32) -> JobResult<Vec<RecurringTemplate>> {
        debug!(%now, limit, "Finding stale templates");
        let rows: Vec<TemplateRow> = sqlx::query_as(
            r#"
            SELECT * FROM recurring_templates
            WHERE active
              AND COALESCE(generated_through, anchor_at) < $1 + make_interval(days => sync_horizon_days)
            ORDER BY COALESCE(generated_through, anchor_at), id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(self.pool.inner())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_generated_through(&self, id: TemplateId, through: DateTime<Utc>) -> JobResult<()> {
        // GREATEST skips NULL, so the first write always lands.
        let result = sqlx::query(
            "UPDATE recurring_templates SET generated_through = GREATEST(generated_through, $2) WHERE id = $1",
        )
        .bind(id.into_inner())
        .bind(through)
        .execute(self.pool.inner())
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::NotFound(format!("template {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ExceptionStore for PgTemplateStore {
    async fn find_exceptions(
        &self,
        template_id: TemplateId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> JobResult<Vec<TaskException>> {
        let rows: Vec<ExceptionRow> = sqlx::query_as(
            r#"
            SELECT template_id, occurs_at, kind, reschedule_to
            FROM task_exceptions
            WHERE template_id = $1 AND occurs_at >= $2 AND occurs_at < $3
            ORDER BY occurs_at
            "#,
        )
        .bind(template_id.into_inner())
        .bind(from)
        .bind(until)
        .fetch_all(self.pool.inner())
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(Clone)]
pub struct PgItemStore {
    pool: Arc<DatabasePool>,
}

impl PgItemStore {
    #[must_use]
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }

    /// Items of a template in occurrence order.
    pub async fn items_for(&self, template_id: TemplateId) -> JobResult<Vec<TodoItem>> {
        let rows: Vec<ItemRow> = sqlx::query_as(
            "SELECT * FROM todo_items WHERE template_id = $1 ORDER BY occurs_at",
        )
        .bind(template_id.into_inner())
        .fetch_all(self.pool.inner())
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, FromRow)]
struct ItemRow {
    id: Uuid,
    template_id: Uuid,
    title: String,
    occurs_at: DateTime<Utc>,
    due_at: DateTime<Utc>,
}

impl From<ItemRow> for TodoItem {
    fn from(row: ItemRow) -> Self {
        TodoItem {
            id: ItemId::from_uuid(row.id),
            template_id: TemplateId::from_uuid(row.template_id),
            title: row.title,
            occurs_at: row.occurs_at,
            due_at: row.due_at,
        }
    }
}

#[async_trait]
impl ItemStore for PgItemStore {
    async fn batch_insert_ignore_conflict(&self, items: &[TodoItem]) -> JobResult<u64> {
        if items.is_empty() {
            return Ok(0);
        }
        debug!(count = items.len(), "Inserting todo items");

        let ids: Vec<Uuid> = items.iter().map(|i| i.id.into_inner()).collect();
        let template_ids: Vec<Uuid> = items.iter().map(|i| i.template_id.into_inner()).collect();
        let titles: Vec<String> = items.iter().map(|i| i.title.clone()).collect();
        let occurs: Vec<DateTime<Utc>> = items.iter().map(|i| i.occurs_at).collect();
        let dues: Vec<DateTime<Utc>> = items.iter().map(|i| i.due_at).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO todo_items (id, template_id, title, occurs_at, due_at)
            SELECT * FROM UNNEST($1::uuid[], $2::uuid[], $3::text[], $4::timestamptz[], $5::timestamptz[])
            ON CONFLICT (template_id, occurs_at) DO NOTHING
            "#,
        )
        .bind(ids)
        .bind(template_ids)
        .bind(titles)
        .bind(occurs)
        .bind(dues)
        .execute(self.pool.inner())
        .await?;

        Ok(result.rows_affected())
    }
}
