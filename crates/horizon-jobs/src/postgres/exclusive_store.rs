//! PostgreSQL exclusive run store.

use super::DatabasePool;
use crate::error::JobResult;
use crate::store::{ExclusiveRunLease, ExclusiveRunStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgExclusiveRunStore {
    pool: Arc<DatabasePool>,
}

impl PgExclusiveRunStore {
    #[must_use]
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }
}

#[derive(Debug, FromRow)]
struct LeaseRow {
    run_type: String,
    holder_id: String,
    token: Uuid,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<LeaseRow> for ExclusiveRunLease {
    fn from(row: LeaseRow) -> Self {
        Self {
            run_type: row.run_type,
            holder_id: row.holder_id,
            token: row.token,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
        }
    }
}

#[async_trait]
impl ExclusiveRunStore for PgExclusiveRunStore {
    async fn try_acquire(&self, run_type: &str, holder_id: &str, lease: Duration) -> JobResult<Option<ExclusiveRunLease>> {
        debug!(run_type, holder_id, "Trying exclusive run");
        // The conflict branch only fires for an expired row; otherwise the
        // statement returns nothing.
        let row: Option<LeaseRow> = sqlx::query_as(
            r#"
            INSERT INTO exclusive_runs (run_type, holder_id, token, acquired_at, expires_at)
            VALUES ($1, $2, $3, NOW(), NOW() + make_interval(secs => $4))
            ON CONFLICT (run_type) DO UPDATE
            SET holder_id = EXCLUDED.holder_id,
                token = EXCLUDED.token,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
            WHERE exclusive_runs.expires_at <= NOW()
            RETURNING run_type, holder_id, token, acquired_at, expires_at
            "#,
        )
        .bind(run_type)
        .bind(holder_id)
        .bind(Uuid::new_v4())
        .bind(lease.as_secs_f64())
        .fetch_optional(self.pool.inner())
        .await?;

        Ok(row.map(Into::into))
    }

    async fn release(&self, run_type: &str, token: Uuid) -> JobResult<bool> {
        let result = sqlx::query("DELETE FROM exclusive_runs WHERE run_type = $1 AND token = $2")
            .bind(run_type)
            .bind(token)
            .execute(self.pool.inner())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
