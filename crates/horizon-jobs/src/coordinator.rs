//! Job Coordinator: claim, lease, complete, fail and cancel generation jobs.

use crate::error::{JobError, JobResult};
use crate::job::{CancelOutcome, FailOutcome, GenerationJob, NewGenerationJob};
use crate::metrics::JobMetrics;
use crate::notifier::CancellationNotifier;
use crate::retry::RetryConfig;
use crate::store::JobStore;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use horizon_core::{JobId, TemplateId};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub(crate) const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs one store call under `timeout`, recording its latency and outcome.
pub(crate) async fn with_deadline<T, F>(timeout: Duration, operation: &'static str, fut: F) -> JobResult<T>
where
    F: Future<Output = JobResult<T>>,
{
    let started = Instant::now();
    let result = match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(JobError::DeadlineExceeded(operation)),
    };

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) if e.is_lease_lost() => {
            JobMetrics::lease_lost(operation);
            "lease_lost"
        }
        Err(JobError::DeadlineExceeded(_)) => "deadline_exceeded",
        Err(_) => "error",
    };
    JobMetrics::operation(operation, outcome, started.elapsed());
    result
}

/// Front door to the job store.
///
/// Every call runs under `operation_timeout`; on expiry it returns
/// `DeadlineExceeded` and the caller must treat the outcome as unknown.
#[derive(Clone)]
pub struct JobCoordinator {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn CancellationNotifier>,
    operation_timeout: Duration,
}

impl JobCoordinator {
    pub fn new(store: Arc<dyn JobStore>, notifier: Arc<dyn CancellationNotifier>) -> Self {
        Self {
            store,
            notifier,
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

    /// Enqueues one job in `pending` state.
    pub async fn insert_job(&self, job: NewGenerationJob) -> JobResult<GenerationJob> {
        let inserted = self.call("insert_job", self.store.insert_job(job)).await?;
        JobMetrics::jobs_enqueued(1);
        debug!(
            job_id = %inserted.id,
            template_id = %inserted.template_id,
            from = %inserted.generate_from,
            until = %inserted.generate_until,
            "Generation job enqueued"
        );
        Ok(inserted)
    }

    /// Enqueues a batch atomically.
    pub async fn insert_many(&self, jobs: Vec<NewGenerationJob>) -> JobResult<Vec<GenerationJob>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let inserted = self.call("insert_many", self.store.insert_many(jobs)).await?;
        JobMetrics::jobs_enqueued(inserted.len());
        debug!(count = inserted.len(), "Generation jobs enqueued");
        Ok(inserted)
    }

    /// Claims the next eligible job for `worker_id`, leased for
    /// `availability_timeout`. `None` means there is nothing to do.
    pub async fn claim_next_job(&self, worker_id: &str, availability_timeout: Duration) -> JobResult<Option<GenerationJob>> {
        let claimed = self
            .call("claim_next_job", self.store.claim_next(worker_id, availability_timeout))
            .await?;
        if let Some(job) = &claimed {
            JobMetrics::job_claimed();
            debug!(
                job_id = %job.id,
                worker_id,
                retry_count = job.retry_count,
                available_at = ?job.available_at,
                "Job claimed"
            );
        }
        Ok(claimed)
    }

    /// Pushes the lease expiry to `now + extension`.
    pub async fn extend_availability(&self, job_id: JobId, worker_id: &str, extension: Duration) -> JobResult<DateTime<Utc>> {
        let expires_at = self
            .call(
                "extend_availability",
                self.store.extend_availability(job_id, worker_id, extension),
            )
            .await?;
        debug!(job_id = %job_id, worker_id, %expires_at, "Lease extended");
        Ok(expires_at)
    }

    /// Marks a claimed job completed.
    pub async fn complete_job(&self, job_id: JobId, worker_id: &str) -> JobResult<()> {
        self.call("complete_job", self.store.complete(job_id, worker_id)).await?;
        JobMetrics::job_completed();
        info!(job_id = %job_id, worker_id, "Job completed");
        Ok(())
    }

    /// Records a failed attempt. `will_retry == false` means the job stays
    /// with the caller, who must move it to the dead-letter store.
    pub async fn fail_job(
        &self,
        job_id: JobId,
        worker_id: &str,
        error_message: &str,
        retry: &RetryConfig,
    ) -> JobResult<FailOutcome> {
        retry.validate()?;
        let outcome = self
            .call("fail_job", self.store.fail(job_id, worker_id, error_message, retry))
            .await?;
        JobMetrics::job_failed(outcome.will_retry);

        if outcome.will_retry {
            warn!(
                job_id = %job_id,
                worker_id,
                retry_count = outcome.retry_count,
                next_attempt_at = ?outcome.next_attempt_at,
                error = error_message,
                "Job failed, scheduled for retry"
            );
        } else {
            warn!(
                job_id = %job_id,
                worker_id,
                retry_count = outcome.retry_count,
                error = error_message,
                "Job failed, retries exhausted"
            );
        }
        Ok(outcome)
    }

    /// Cancels a non-terminal job and notifies subscribers. Cancelling a
    /// terminal job is a no-op.
    pub async fn cancel_job(&self, job_id: JobId) -> JobResult<CancelOutcome> {
        let outcome = self.call("cancel_job", self.store.cancel(job_id)).await?;

        match outcome {
            CancelOutcome::Cancelled => {
                JobMetrics::job_cancelled();
                info!(job_id = %job_id, "Job cancelled");
                // The status change is authoritative; a lost notification
                // only delays the worker until its pre-commit re-check.
                if let Err(e) = self.call("publish_cancellation", self.notifier.publish(job_id)).await {
                    warn!(job_id = %job_id, error = %e, "Failed to publish cancellation");
                }
            }
            CancelOutcome::AlreadyTerminal(status) => {
                debug!(job_id = %job_id, %status, "Cancel ignored for terminal job");
            }
        }
        Ok(outcome)
    }

    /// Opens a live stream of cancelled job ids.
    pub async fn subscribe_to_cancellations(&self) -> JobResult<BoxStream<'static, JobId>> {
        self.call("subscribe_to_cancellations", self.notifier.subscribe()).await
    }

    /// Reads the authoritative state of a job.
    pub async fn get_job(&self, job_id: JobId) -> JobResult<Option<GenerationJob>> {
        self.call("get_job", self.store.get_job(job_id)).await
    }

    /// Returns true if the template already has pending or running work.
    pub async fn has_open_job(&self, template_id: TemplateId) -> JobResult<bool> {
        self.call("has_open_job", self.store.has_open_job(template_id)).await
    }

    /// Round-trips to the store.
    pub async fn health_check(&self) -> JobResult<()> {
        self.call("health_check", self.store.ping()).await
    }
}
