//! Storage traits behind the coordinator, the dead-letter manager and the
//! exclusive run lock.
//!
//! Every mutating call is a single compare-and-swap on the row it touches.
//! Implementations must use one clock for all lease comparisons.

use crate::error::JobResult;
use crate::job::{CancelOutcome, DeadLetterJob, DeadLetterReason, FailOutcome, GenerationJob, NewGenerationJob};
use crate::retry::RetryConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use horizon_core::{DeadLetterId, JobId, TemplateId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a pending job. Fails with `ConstraintViolation` if the
    /// template does not exist or the window is empty.
    async fn insert_job(&self, job: NewGenerationJob) -> JobResult<GenerationJob>;

    /// Persists all jobs or none of them.
    async fn insert_many(&self, jobs: Vec<NewGenerationJob>) -> JobResult<Vec<GenerationJob>>;

    async fn get_job(&self, id: JobId) -> JobResult<Option<GenerationJob>>;

    /// Claims the eligible job with the oldest `scheduled_for`: a due
    /// pending job, or a running job whose lease has expired.
    async fn claim_next(&self, worker_id: &str, lease: Duration) -> JobResult<Option<GenerationJob>>;

    /// Moves the lease expiry to `now + extension` and returns it.
    async fn extend_availability(&self, id: JobId, worker_id: &str, extension: Duration) -> JobResult<DateTime<Utc>>;

    async fn complete(&self, id: JobId, worker_id: &str) -> JobResult<()>;

    async fn fail(&self, id: JobId, worker_id: &str, error_message: &str, retry: &RetryConfig) -> JobResult<FailOutcome>;

    async fn cancel(&self, id: JobId) -> JobResult<CancelOutcome>;

    /// Returns true if the template has a pending or running job.
    async fn has_open_job(&self, template_id: TemplateId) -> JobResult<bool>;

    /// Cheap round-trip used by health checks.
    async fn ping(&self) -> JobResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Marks the job `dead_lettered` and records the failure, atomically.
    /// Requires the job to be running and claimed by `worker_id`.
    async fn move_to_dead_letter(&self, job_id: JobId, worker_id: &str, reason: DeadLetterReason) -> JobResult<DeadLetterJob>;

    /// Unresolved records, newest first.
    async fn list_unresolved(&self, limit: u32) -> JobResult<Vec<DeadLetterJob>>;

    async fn get_dead_letter(&self, id: DeadLetterId) -> JobResult<Option<DeadLetterJob>>;

    /// Re-enqueues the window as a fresh job and resolves the record.
    async fn retry_dead_letter(&self, id: DeadLetterId, reviewed_by: &str) -> JobResult<GenerationJob>;

    async fn discard_dead_letter(&self, id: DeadLetterId, reviewed_by: &str, note: &str) -> JobResult<()>;

    /// Returns true if the template has a record awaiting review.
    async fn has_unresolved(&self, template_id: TemplateId) -> JobResult<bool>;
}

/// A held leader lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusiveRunLease {
    pub run_type: String,
    pub holder_id: String,
    /// Distinguishes this acquisition from any later one by the same holder.
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ExclusiveRunStore: Send + Sync {
    /// Takes the lease if nobody holds it or the current one expired.
    async fn try_acquire(&self, run_type: &str, holder_id: &str, lease: Duration) -> JobResult<Option<ExclusiveRunLease>>;

    /// Clears the lease if it is still the one identified by `token`.
    /// Returns false when it already expired or was taken over.
    async fn release(&self, run_type: &str, token: Uuid) -> JobResult<bool>;
}
