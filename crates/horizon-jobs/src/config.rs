//! Job system configuration (the `jobs` section).

use crate::error::{JobError, JobResult};
use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Configuration for workers, retries, the horizon sweep and the
/// cancellation channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Retry policy applied when a generation attempt fails.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Horizon sweep configuration.
    #[serde(default)]
    pub sweep: SweepConfig,

    /// Cancellation notifier configuration.
    #[serde(default)]
    pub notifier: NotifierConfig,
}

impl JobsConfig {
    /// Validates every section.
    pub fn validate(&self) -> JobResult<()> {
        self.worker.validate()?;
        self.retry.validate()?;
        self.sweep.validate()?;
        self.notifier.validate()
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent generation workers per process.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Lease granted on claim, in seconds.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    /// How often a running job extends its lease, in seconds.
    #[serde(default = "default_lease_renew_interval")]
    pub lease_renew_interval_secs: u64,

    /// Sleep between claim attempts when the queue is empty, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Deadline for a single coordinator call, in milliseconds.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Upper bound on one generation attempt, in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Time allowed for in-flight jobs on shutdown, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Prefix of worker ids; the pool appends an index.
    #[serde(default = "default_worker_id_prefix")]
    pub worker_id_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            lease_secs: default_lease_secs(),
            lease_renew_interval_secs: default_lease_renew_interval(),
            poll_interval_ms: default_poll_interval(),
            operation_timeout_ms: default_operation_timeout(),
            job_timeout_secs: default_job_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            worker_id_prefix: default_worker_id_prefix(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_lease_secs() -> u64 {
    60
}

fn default_lease_renew_interval() -> u64 {
    20
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_operation_timeout() -> u64 {
    5000
}

fn default_job_timeout() -> u64 {
    600
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_worker_id_prefix() -> String {
    "horizon-worker".to_string()
}

impl WorkerConfig {
    /// Returns the claim lease as a Duration.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Returns the lease renewal interval as a Duration.
    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_secs(self.lease_renew_interval_secs)
    }

    /// Returns the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the per-call deadline as a Duration.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Returns the job timeout as a Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Returns the shutdown timeout as a Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn validate(&self) -> JobResult<()> {
        if self.concurrency == 0 {
            return Err(JobError::Configuration("worker.concurrency must be at least 1".into()));
        }
        if self.lease_secs == 0 {
            return Err(JobError::Configuration("worker.lease_secs must be at least 1".into()));
        }
        if self.lease_renew_interval_secs == 0 || self.lease_renew_interval_secs >= self.lease_secs {
            return Err(JobError::Configuration(format!(
                "worker.lease_renew_interval_secs ({}) must be positive and shorter than worker.lease_secs ({})",
                self.lease_renew_interval_secs, self.lease_secs
            )));
        }
        if self.operation_timeout_ms == 0 {
            return Err(JobError::Configuration("worker.operation_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Horizon sweep configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Run the sweeper in this process.
    #[serde(default = "default_sweep_enabled")]
    pub enabled: bool,

    /// Cron expression (with seconds) for sweep ticks.
    #[serde(default = "default_sweep_schedule")]
    pub schedule: String,

    /// Exclusive run name guarding the sweep.
    #[serde(default = "default_run_type")]
    pub run_type: String,

    /// Leader lease held for one sweep, in seconds.
    #[serde(default = "default_sweep_lease")]
    pub lease_secs: u64,

    /// Longest window a single job covers, in days.
    #[serde(default = "default_max_window_days")]
    pub max_window_days: u32,

    /// Jobs enqueued per template per sweep. A template further behind
    /// catches up over later sweeps.
    #[serde(default = "default_max_windows_per_tick")]
    pub max_windows_per_tick: u32,

    /// Templates examined per sweep.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweep_enabled(),
            schedule: default_sweep_schedule(),
            run_type: default_run_type(),
            lease_secs: default_sweep_lease(),
            max_window_days: default_max_window_days(),
            max_windows_per_tick: default_max_windows_per_tick(),
            batch_limit: default_batch_limit(),
        }
    }
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_sweep_schedule() -> String {
    "0 */5 * * * *".to_string()
}

fn default_run_type() -> String {
    "template-sweep".to_string()
}

fn default_sweep_lease() -> u64 {
    120
}

fn default_max_window_days() -> u32 {
    30
}

fn default_max_windows_per_tick() -> u32 {
    12
}

fn default_batch_limit() -> u32 {
    500
}

impl SweepConfig {
    /// Returns the leader lease as a Duration.
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Parses the cron schedule.
    pub fn parsed_schedule(&self) -> JobResult<cron::Schedule> {
        cron::Schedule::from_str(&self.schedule)
            .map_err(|e| JobError::Configuration(format!("invalid sweep.schedule '{}': {}", self.schedule, e)))
    }

    fn validate(&self) -> JobResult<()> {
        self.parsed_schedule()?;
        if self.run_type.is_empty() {
            return Err(JobError::Configuration("sweep.run_type must not be empty".into()));
        }
        if self.lease_secs == 0 || self.max_window_days == 0 || self.max_windows_per_tick == 0 || self.batch_limit == 0 {
            return Err(JobError::Configuration(
                "sweep.lease_secs, sweep.max_window_days, sweep.max_windows_per_tick and sweep.batch_limit must be positive"
                    .into(),
            ));
        }
        Ok(())
    }
}

/// Cancellation notifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    /// PostgreSQL NOTIFY channel.
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Per-subscriber buffer of the in-process fan-out.
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            buffer: default_buffer(),
        }
    }
}

fn default_channel() -> String {
    "generation_job_cancelled".to_string()
}

fn default_buffer() -> usize {
    256
}

impl NotifierConfig {
    fn validate(&self) -> JobResult<()> {
        let valid_ident = !self.channel.is_empty()
            && self
                .channel
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_ident {
            return Err(JobError::Configuration(format!(
                "notifier.channel '{}' must be a non-empty identifier",
                self.channel
            )));
        }
        if self.buffer == 0 {
            return Err(JobError::Configuration("notifier.buffer must be positive".into()));
        }
        Ok(())
    }
}
