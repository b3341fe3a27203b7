//! Prometheus metrics for the generation pipeline.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "horizon_jobs_enqueued_total";
    /// Total jobs claimed (first claims and reclaims after lease expiry).
    pub const JOBS_CLAIMED_TOTAL: &str = "horizon_jobs_claimed_total";
    /// Total jobs completed.
    pub const JOBS_COMPLETED_TOTAL: &str = "horizon_jobs_completed_total";
    /// Total failed attempts.
    pub const JOBS_FAILED_TOTAL: &str = "horizon_jobs_failed_total";
    /// Total jobs moved to the dead-letter store.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "horizon_jobs_dead_lettered_total";
    /// Total jobs cancelled.
    pub const JOBS_CANCELLED_TOTAL: &str = "horizon_jobs_cancelled_total";
    /// Total operations rejected because the caller lost its lease.
    pub const LEASE_LOST_TOTAL: &str = "horizon_jobs_lease_lost_total";
    /// Total dead-letter records resolved by an administrator.
    pub const DEAD_LETTERS_RESOLVED_TOTAL: &str = "horizon_dead_letters_resolved_total";

    /// Coordinator call latency in seconds.
    pub const OPERATION_DURATION_SECONDS: &str = "horizon_jobs_operation_duration_seconds";
    /// Generation attempt duration in seconds.
    pub const GENERATION_DURATION_SECONDS: &str = "horizon_jobs_generation_duration_seconds";
    /// Items inserted by generation.
    pub const ITEMS_INSERTED_TOTAL: &str = "horizon_items_inserted_total";

    /// Jobs currently being processed.
    pub const WORKERS_BUSY: &str = "horizon_workers_busy";
    /// Worker pool concurrency.
    pub const WORKERS_CONCURRENCY: &str = "horizon_workers_concurrency";

    /// Sweep runs by outcome.
    pub const SWEEP_RUNS_TOTAL: &str = "horizon_sweep_runs_total";
    /// Whether this instance held the sweep lease on its last tick.
    pub const SWEEP_IS_LEADER: &str = "horizon_sweep_is_leader";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of generation jobs enqueued");
    describe_counter!(
        names::JOBS_CLAIMED_TOTAL,
        "Total number of generation jobs claimed, including reclaims after lease expiry"
    );
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of generation jobs completed");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of failed generation attempts");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of generation jobs moved to the dead-letter store"
    );
    describe_counter!(names::JOBS_CANCELLED_TOTAL, "Total number of generation jobs cancelled");
    describe_counter!(
        names::LEASE_LOST_TOTAL,
        "Total number of job operations rejected because the lease was lost"
    );
    describe_counter!(
        names::DEAD_LETTERS_RESOLVED_TOTAL,
        "Total number of dead-letter records retried or discarded"
    );

    describe_histogram!(
        names::OPERATION_DURATION_SECONDS,
        "Coordinator operation duration in seconds"
    );
    describe_histogram!(
        names::GENERATION_DURATION_SECONDS,
        "Generation attempt duration in seconds"
    );
    describe_counter!(names::ITEMS_INSERTED_TOTAL, "Total number of todo items inserted");

    describe_gauge!(names::WORKERS_BUSY, "Number of workers currently processing a job");
    describe_gauge!(names::WORKERS_CONCURRENCY, "Worker pool concurrency setting");

    describe_counter!(names::SWEEP_RUNS_TOTAL, "Total number of horizon sweep ticks by outcome");
    describe_gauge!(
        names::SWEEP_IS_LEADER,
        "Whether this instance held the sweep lease on its last tick (1) or not (0)"
    );
}

/// Job lifecycle recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    pub fn jobs_enqueued(count: usize) {
        counter!(names::JOBS_ENQUEUED_TOTAL).increment(count as u64);
    }

    pub fn job_claimed() {
        counter!(names::JOBS_CLAIMED_TOTAL).increment(1);
    }

    pub fn job_completed() {
        counter!(names::JOBS_COMPLETED_TOTAL).increment(1);
    }

    pub fn job_failed(will_retry: bool) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "will_retry" => if will_retry { "true" } else { "false" }
        )
        .increment(1);
    }

    pub fn job_dead_lettered(error_type: &str) {
        counter!(
            names::JOBS_DEAD_LETTERED_TOTAL,
            "error_type" => error_type.to_string()
        )
        .increment(1);
    }

    pub fn job_cancelled() {
        counter!(names::JOBS_CANCELLED_TOTAL).increment(1);
    }

    pub fn lease_lost(operation: &'static str) {
        counter!(names::LEASE_LOST_TOTAL, "operation" => operation).increment(1);
    }

    pub fn dead_letter_resolved(resolution: &'static str) {
        counter!(names::DEAD_LETTERS_RESOLVED_TOTAL, "resolution" => resolution).increment(1);
    }

    /// Record a coordinator call.
    pub fn operation(operation: &'static str, outcome: &'static str, duration: Duration) {
        histogram!(
            names::OPERATION_DURATION_SECONDS,
            "operation" => operation,
            "outcome" => outcome
        )
        .record(duration.as_secs_f64());
    }

    /// Record a generation attempt.
    pub fn generation(status: &'static str, duration: Duration, items_inserted: u64) {
        histogram!(names::GENERATION_DURATION_SECONDS, "status" => status).record(duration.as_secs_f64());
        if items_inserted > 0 {
            counter!(names::ITEMS_INSERTED_TOTAL).increment(items_inserted);
        }
    }
}

/// Worker pool recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    pub fn update_workers(pool_id: &str, busy: u64, concurrency: usize) {
        gauge!(names::WORKERS_BUSY, "pool_id" => pool_id.to_string()).set(busy as f64);
        gauge!(names::WORKERS_CONCURRENCY, "pool_id" => pool_id.to_string()).set(concurrency as f64);
    }
}

/// Sweep recorder.
#[derive(Clone)]
pub struct SweepMetrics;

impl SweepMetrics {
    pub fn sweep_run(holder_id: &str, outcome: &'static str) {
        counter!(names::SWEEP_RUNS_TOTAL, "outcome" => outcome).increment(1);
        gauge!(names::SWEEP_IS_LEADER, "holder_id" => holder_id.to_string())
            .set(if outcome == "skipped" { 0.0 } else { 1.0 });
    }
}
