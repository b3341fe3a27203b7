//! Dead Letter Manager: parks exhausted jobs for administrator review.

use crate::coordinator::{with_deadline, DEFAULT_OPERATION_TIMEOUT};
use crate::error::JobResult;
use crate::job::{DeadLetterJob, DeadLetterReason};
use crate::metrics::JobMetrics;
use crate::store::DeadLetterStore;
use horizon_core::{DeadLetterId, JobId, TemplateId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Largest page `list_dead_letter_jobs` returns.
pub const MAX_LIST_LIMIT: u32 = 500;

#[derive(Clone)]
pub struct DeadLetterManager {
    store: Arc<dyn DeadLetterStore>,
    operation_timeout: Duration,
}

impl DeadLetterManager {
    pub fn new(store: Arc<dyn DeadLetterStore>) -> Self {
        Self {
            store,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Sets the per-call deadline.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> JobResult<T>
    where
        F: Future<Output = JobResult<T>>,
    {
        with_deadline(self.operation_timeout, operation, fut).await
    }

    /// Moves a job whose retries are exhausted into the dead-letter store.
    ///
    /// The caller must still hold the claim; otherwise `LeaseLost`.
    pub async fn move_to_dead_letter(
        &self,
        job_id: JobId,
        worker_id: &str,
        reason: DeadLetterReason,
    ) -> JobResult<DeadLetterJob> {
        let error_type = reason.error_type.clone();
        let record = self
            .call(
                "move_to_dead_letter",
                self.store.move_to_dead_letter(job_id, worker_id, reason),
            )
            .await?;

        JobMetrics::job_dead_lettered(&error_type);
        warn!(
            job_id = %job_id,
            dead_letter_id = %record.id,
            worker_id,
            error_type = %record.error_type,
            retry_count = record.retry_count,
            "Job moved to dead letter"
        );
        Ok(record)
    }

    /// Unresolved records, newest failure first. `limit` is capped at
    /// [`MAX_LIST_LIMIT`].
    pub async fn list_dead_letter_jobs(&self, limit: u32) -> JobResult<Vec<DeadLetterJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.call(
            "list_dead_letter_jobs",
            self.store.list_unresolved(limit.min(MAX_LIST_LIMIT)),
        )
        .await
    }

    /// Looks up a record, resolved or not.
    pub async fn get_dead_letter_job(&self, id: DeadLetterId) -> JobResult<Option<DeadLetterJob>> {
        self.call("get_dead_letter_job", self.store.get_dead_letter(id)).await
    }

    /// Re-enqueues the failed window as a fresh job with a zero retry count.
    /// `NotFound` if the record is missing or already resolved.
    pub async fn retry_dead_letter_job(&self, id: DeadLetterId, reviewed_by: &str) -> JobResult<JobId> {
        let job = self
            .call("retry_dead_letter_job", self.store.retry_dead_letter(id, reviewed_by))
            .await?;

        JobMetrics::dead_letter_resolved("retried");
        JobMetrics::jobs_enqueued(1);
        info!(dead_letter_id = %id, new_job_id = %job.id, reviewed_by, "Dead letter job retried");
        Ok(job.id)
    }

    /// Returns true while a failed window of the template awaits review.
    pub async fn has_unresolved_dead_letter(&self, template_id: TemplateId) -> JobResult<bool> {
        self.call("has_unresolved_dead_letter", self.store.has_unresolved(template_id))
            .await
    }

    /// Closes the record without re-running it.
    /// `NotFound` if the record is missing or already resolved.
    pub async fn discard_dead_letter_job(&self, id: DeadLetterId, reviewed_by: &str, note: &str) -> JobResult<()> {
        self.call(
            "discard_dead_letter_job",
            self.store.discard_dead_letter(id, reviewed_by, note),
        )
        .await?;

        JobMetrics::dead_letter_resolved("discarded");
        info!(dead_letter_id = %id, reviewed_by, note, "Dead letter job discarded");
        Ok(())
    }
}
