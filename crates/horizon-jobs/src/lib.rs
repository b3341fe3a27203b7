//! Horizon Jobs - recurring-task generation coordination
//!
//! A lease-based job queue that keeps each recurring template's generated
//! items a fixed horizon ahead of now:
//! - Generation jobs claimed under time-bounded leases, reclaimable after expiry
//! - Compare-and-swap state transitions keyed on the claiming worker
//! - Retry with exponential backoff, then a reviewable dead-letter store
//! - Named exclusive runs so one instance sweeps templates per tick
//! - Best-effort cancellation fan-out with a pre-commit status re-check
//! - PostgreSQL and in-memory backends behind the same store traits
//!
//! # Flow
//!
//! ```text
//!  HorizonSweeper ──(exclusive run)──► insert_many ──► generation_jobs
//!                                                          │
//!                       claim_next_job / extend_availability
//!                                                          ▼
//!                                                   GenerationWorker
//!                                        ┌─────────────────┼──────────────────┐
//!                                        ▼                 ▼                  ▼
//!                                   complete_job      fail_job (retry)   move_to_dead_letter
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use horizon_jobs::{BroadcastNotifier, InMemoryStore, JobCoordinator, NewGenerationJob};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let coordinator = JobCoordinator::new(store.clone(), Arc::new(BroadcastNotifier::default()));
//!
//! coordinator.insert_job(NewGenerationJob::new(template_id, from, until)).await?;
//! if let Some(job) = coordinator.claim_next_job("worker-1", Duration::from_secs(60)).await? {
//!     // generate, then
//!     coordinator.complete_job(job.id, "worker-1").await?;
//! }
//! ```

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dead_letter;
pub mod error;
pub mod exclusive;
pub mod generator;
pub mod job;
pub mod memory;
pub mod metrics;
pub mod notifier;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod sweep;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{JobsConfig, NotifierConfig, SweepConfig, WorkerConfig};
pub use coordinator::JobCoordinator;
pub use dead_letter::{DeadLetterManager, MAX_LIST_LIMIT};
pub use error::{JobError, JobResult};
pub use exclusive::{ExclusiveRunGuard, ExclusiveRunLock};
pub use generator::{
    ExceptionKind, ExceptionStore, IntervalTaskGenerator, ItemStore, RecurringTemplate, TaskException, TaskGenerator,
    TemplateStore, TodoItem,
};
pub use job::{
    CancelOutcome, DeadLetterJob, DeadLetterReason, DeadLetterResolution, FailOutcome, GenerationJob, JobStatus,
    NewGenerationJob,
};
pub use memory::InMemoryStore;
pub use metrics::{register_metrics, JobMetrics, SweepMetrics, WorkerMetrics};
pub use notifier::{BroadcastNotifier, CancellationNotifier};
pub use retry::{RetryConfig, TransientRetry};
pub use store::{DeadLetterStore, ExclusiveRunLease, ExclusiveRunStore, JobStore};
pub use sweep::{plan_windows, HorizonSweeper, SweepReport};
pub use worker::{GenerationServices, GenerationWorker, ProcessOutcome, WorkerPool, WorkerPoolStats};
