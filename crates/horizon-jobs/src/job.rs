//! Generation job and dead-letter records.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, Utc};
use horizon_core::{DeadLetterId, JobId, TemplateId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker (possibly delayed by retry backoff).
    #[default]
    Pending,
    /// Claimed by a worker under a lease.
    Running,
    /// Generation finished and its items were written.
    Completed,
    /// Cancelled before completion.
    Cancelled,
    /// Retries exhausted; a dead-letter record holds the failure.
    DeadLettered,
}

impl JobStatus {
    /// Stable storage representation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }

    /// Returns true if no further transition is possible.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::DeadLettered
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "dead_lettered" => Ok(JobStatus::DeadLettered),
            other => Err(JobError::Internal(format!("unknown job status '{other}'"))),
        }
    }
}

/// A unit of work: generate occurrences for one template over
/// `[generate_from, generate_until)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    /// Job ID.
    pub id: JobId,

    /// Template whose occurrences are generated.
    pub template_id: TemplateId,

    /// Window start (inclusive).
    pub generate_from: DateTime<Utc>,

    /// Window end (exclusive).
    pub generate_until: DateTime<Utc>,

    /// Earliest time the job may be claimed.
    pub scheduled_for: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    pub status: JobStatus,

    /// Worker holding (or last holding) the lease.
    pub claimed_by: Option<String>,

    pub claimed_at: Option<DateTime<Utc>>,

    /// Lease expiry. Once in the past, any worker may reclaim the job.
    pub available_at: Option<DateTime<Utc>>,

    /// Number of failed attempts so far.
    pub retry_count: u32,

    /// Message of the most recent failure.
    pub last_error: Option<String>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl GenerationJob {
    /// Returns true if a worker could claim this job at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.scheduled_for <= now,
            JobStatus::Running => self.available_at.map_or(true, |expiry| expiry < now),
            _ => false,
        }
    }

    /// Returns true if `worker_id` currently holds the claim.
    ///
    /// An expired lease still counts until another worker reclaims the job;
    /// the conditional updates only look at `claimed_by`.
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Running && self.claimed_by.as_deref() == Some(worker_id)
    }
}

/// Request to enqueue a generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGenerationJob {
    pub id: JobId,
    pub template_id: TemplateId,
    pub generate_from: DateTime<Utc>,
    pub generate_until: DateTime<Utc>,
    /// When unset, the job is due immediately.
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewGenerationJob {
    /// Creates a job for `[from, until)` that is due immediately.
    pub fn new(template_id: TemplateId, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            template_id,
            generate_from: from,
            generate_until: until,
            scheduled_for: None,
        }
    }

    /// Delays the job until `at`.
    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Rejects empty or inverted windows.
    pub fn validate(&self) -> JobResult<()> {
        if self.generate_from >= self.generate_until {
            return Err(JobError::ConstraintViolation(format!(
                "generation window must be non-empty: {} >= {}",
                self.generate_from, self.generate_until
            )));
        }
        Ok(())
    }

    /// Materializes the pending row as stored at `now`.
    pub fn into_job(self, now: DateTime<Utc>) -> GenerationJob {
        GenerationJob {
            id: self.id,
            template_id: self.template_id,
            generate_from: self.generate_from,
            generate_until: self.generate_until,
            scheduled_for: self.scheduled_for.unwrap_or(now),
            created_at: now,
            status: JobStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            available_at: None,
            retry_count: 0,
            last_error: None,
            completed_at: None,
        }
    }
}

/// Result of `fail_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailOutcome {
    /// True if the job was requeued; false if retries are exhausted and the
    /// caller must move it to the dead-letter store.
    pub will_retry: bool,

    /// Retry count after this failure.
    pub retry_count: u32,

    /// When the requeued job becomes claimable again.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Result of `cancel_job`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job moved to `cancelled` by this call.
    Cancelled,
    /// The job was already terminal; nothing changed.
    AlreadyTerminal(JobStatus),
}

/// Failure details recorded when a job is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterReason {
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: Option<String>,
}

impl DeadLetterReason {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }
}

impl From<&JobError> for DeadLetterReason {
    fn from(err: &JobError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// How a dead-letter record was disposed of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterResolution {
    /// Re-enqueued as a fresh job.
    Retried,
    /// Closed without re-running.
    Discarded,
}

impl DeadLetterResolution {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeadLetterResolution::Retried => "retried",
            DeadLetterResolution::Discarded => "discarded",
        }
    }
}

impl FromStr for DeadLetterResolution {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retried" => Ok(DeadLetterResolution::Retried),
            "discarded" => Ok(DeadLetterResolution::Discarded),
            other => Err(JobError::Internal(format!("unknown dead-letter resolution '{other}'"))),
        }
    }
}

/// A job that exhausted its retries, awaiting administrator review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: DeadLetterId,
    pub original_job_id: JobId,
    pub template_id: TemplateId,
    pub generate_from: DateTime<Utc>,
    pub generate_until: DateTime<Utc>,
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_worker_id: String,

    /// Set once the record has been retried or discarded.
    pub resolution: Option<DeadLetterResolution>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub note: Option<String>,

    /// Job created by a retry.
    pub retried_job_id: Option<JobId>,
}

impl DeadLetterJob {
    /// Builds the record for `job`, failed by `worker_id` at `now`.
    pub fn from_job(job: &GenerationJob, worker_id: &str, reason: DeadLetterReason, now: DateTime<Utc>) -> Self {
        Self {
            id: DeadLetterId::new(),
            original_job_id: job.id,
            template_id: job.template_id,
            generate_from: job.generate_from,
            generate_until: job.generate_until,
            error_type: reason.error_type,
            error_message: reason.error_message,
            stack_trace: reason.stack_trace,
            failed_at: now,
            retry_count: job.retry_count,
            last_worker_id: worker_id.to_string(),
            resolution: None,
            reviewed_by: None,
            reviewed_at: None,
            note: None,
            retried_job_id: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}
