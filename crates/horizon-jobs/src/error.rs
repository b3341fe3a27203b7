//! Job error types.

use horizon_core::{HorizonError, JobId};
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Errors produced by the coordinator, the dead-letter manager and the
/// exclusive run lock.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job, dead-letter record or template does not exist (or is already resolved).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller's claim on the job is no longer valid.
    #[error("Lease lost on job {job_id} for worker {worker_id}")]
    LeaseLost { job_id: JobId, worker_id: String },

    /// A store constraint rejected the write.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Temporary store or network failure; safe to retry.
    #[error("Transient store error: {0}")]
    Transient(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation did not finish before its deadline. Its effect on the
    /// store is unknown.
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(&'static str),

    /// The job was cancelled while it was being processed.
    #[error("Job was cancelled")]
    Cancelled,

    /// A generation collaborator failed.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if the failed call may be repeated unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::Transient(_) | JobError::DeadlineExceeded(_))
    }

    /// Returns true if the error means another worker owns the job now.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, JobError::LeaseLost { .. })
    }

    /// Short, stable name used as `error_type` on dead-letter records and
    /// as a metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::NotFound(_) => "not_found",
            JobError::LeaseLost { .. } => "lease_lost",
            JobError::ConstraintViolation(_) => "constraint_violation",
            JobError::Transient(_) => "transient",
            JobError::Configuration(_) => "configuration",
            JobError::DeadlineExceeded(_) => "deadline_exceeded",
            JobError::Cancelled => "cancelled",
            JobError::Generation(_) => "generation",
            JobError::Serialization(_) => "serialization",
            JobError::Internal(_) => "internal",
        }
    }

    pub(crate) fn lease_lost(job_id: JobId, worker_id: &str) -> Self {
        JobError::LeaseLost {
            job_id,
            worker_id: worker_id.to_string(),
        }
    }
}

impl From<sqlx::Error> for JobError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => JobError::NotFound("row".to_string()),
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => JobError::Transient(err.to_string()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("23503" | "23505" | "23514") => JobError::ConstraintViolation(db_err.message().to_string()),
                // serialization_failure, deadlock_detected, admin shutdown, cannot connect now
                Some("40001" | "40P01" | "57P01" | "57P03") => JobError::Transient(db_err.message().to_string()),
                _ => JobError::Internal(err.to_string()),
            },
            _ => JobError::Internal(err.to_string()),
        }
    }
}

impl From<HorizonError> for JobError {
    fn from(err: HorizonError) -> Self {
        match err {
            HorizonError::NotFound { resource_type, id } => JobError::NotFound(format!("{resource_type} {id}")),
            HorizonError::ConstraintViolation(msg) => JobError::ConstraintViolation(msg),
            HorizonError::Configuration(msg) => JobError::Configuration(msg),
            HorizonError::Unavailable(msg) | HorizonError::Database(msg) => JobError::Transient(msg),
            other => JobError::Internal(other.to_string()),
        }
    }
}

impl From<JobError> for HorizonError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(id) => HorizonError::not_found("job", id),
            lost @ JobError::LeaseLost { .. } => HorizonError::Conflict(lost.to_string()),
            JobError::ConstraintViolation(msg) => HorizonError::ConstraintViolation(msg),
            JobError::Transient(msg) => HorizonError::Unavailable(msg),
            JobError::Configuration(msg) => HorizonError::Configuration(msg),
            JobError::DeadlineExceeded(op) => HorizonError::Timeout(op.to_string()),
            other => HorizonError::Internal(other.to_string()),
        }
    }
}
