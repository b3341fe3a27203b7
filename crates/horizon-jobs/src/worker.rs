//! Generation workers and the pool that runs them.
//!
//! A worker claims one job at a time, expands the template window while a
//! renewal ticker keeps its lease alive, re-checks ownership, writes the
//! items and completes the job. Failures go through `fail_job`, and a job
//! whose retries are exhausted is moved to the dead-letter store.

use crate::config::WorkerConfig;
use crate::coordinator::{with_deadline, JobCoordinator};
use crate::dead_letter::DeadLetterManager;
use crate::error::{JobError, JobResult};
use crate::generator::{ExceptionStore, ItemStore, TaskGenerator, TemplateStore};
use crate::job::{DeadLetterReason, FailOutcome, GenerationJob, JobStatus};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::retry::{RetryConfig, TransientRetry};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use horizon_core::JobId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::watch;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Everything a worker reads from and writes to.
#[derive(Clone)]
pub struct GenerationServices {
    pub coordinator: JobCoordinator,
    pub dead_letters: DeadLetterManager,
    pub templates: Arc<dyn TemplateStore>,
    pub exceptions: Arc<dyn ExceptionStore>,
    pub items: Arc<dyn ItemStore>,
    pub generator: Arc<dyn TaskGenerator>,
}

/// What one `process_next` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing was claimable.
    Idle,
    Completed { job_id: JobId, items_inserted: u64 },
    /// The attempt failed and the job was requeued.
    Retrying {
        job_id: JobId,
        retry_count: u32,
        next_attempt_at: Option<DateTime<Utc>>,
    },
    DeadLettered { job_id: JobId },
    /// The job was cancelled during the attempt; nothing was committed.
    Cancelled { job_id: JobId },
    /// Another worker owns the job now; this attempt was abandoned.
    LeaseLost { job_id: JobId },
}

impl ProcessOutcome {
    fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::Idle => "idle",
            ProcessOutcome::Completed { .. } => "completed",
            ProcessOutcome::Retrying { .. } => "retrying",
            ProcessOutcome::DeadLettered { .. } => "dead_lettered",
            ProcessOutcome::Cancelled { .. } => "cancelled",
            ProcessOutcome::LeaseLost { .. } => "lease_lost",
        }
    }

    fn items_inserted(&self) -> u64 {
        match self {
            ProcessOutcome::Completed { items_inserted, .. } => *items_inserted,
            _ => 0,
        }
    }
}

/// Routes cancellation notifications to the worker holding the job.
#[derive(Default)]
pub(crate) struct CancellationRegistry {
    watchers: Mutex<HashMap<JobId, watch::Sender<bool>>>,
}

impl CancellationRegistry {
    pub(crate) fn register(self: &Arc<Self>, job_id: JobId) -> CancellationWatch {
        let (sender, receiver) = watch::channel(false);
        self.watchers.lock().insert(job_id, sender);
        CancellationWatch {
            registry: Arc::clone(self),
            job_id,
            receiver,
        }
    }

    /// Signals the worker holding `job_id`, if any is local.
    pub(crate) fn cancel(&self, job_id: JobId) -> bool {
        match self.watchers.lock().get(&job_id) {
            Some(sender) => {
                sender.send_replace(true);
                true
            }
            None => false,
        }
    }
}

pub(crate) struct CancellationWatch {
    registry: Arc<CancellationRegistry>,
    job_id: JobId,
    receiver: watch::Receiver<bool>,
}

impl CancellationWatch {
    /// Resolves once the job is cancelled; never resolves otherwise.
    async fn cancelled(&mut self) {
        if self.receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for CancellationWatch {
    fn drop(&mut self) {
        self.registry.watchers.lock().remove(&self.job_id);
    }
}

/// A single claim-generate-commit loop body.
#[derive(Clone)]
pub struct GenerationWorker {
    id: String,
    services: GenerationServices,
    config: WorkerConfig,
    retry: RetryConfig,
    transient: TransientRetry,
    cancellations: Arc<CancellationRegistry>,
}

impl GenerationWorker {
    pub fn new(id: impl Into<String>, services: GenerationServices, config: WorkerConfig, retry: RetryConfig) -> Self {
        Self {
            id: id.into(),
            services,
            config,
            retry,
            transient: TransientRetry::default(),
            cancellations: Arc::new(CancellationRegistry::default()),
        }
    }

    pub(crate) fn with_cancellations(mut self, registry: Arc<CancellationRegistry>) -> Self {
        self.cancellations = registry;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claims and processes at most one job.
    ///
    /// Errors are store failures outside an attempt; a failing attempt is
    /// reported through the outcome.
    pub async fn process_next(&self) -> JobResult<ProcessOutcome> {
        let claimed = self
            .services
            .coordinator
            .claim_next_job(&self.id, self.config.lease())
            .await?;
        let Some(job) = claimed else {
            return Ok(ProcessOutcome::Idle);
        };

        let started = Instant::now();
        let outcome = if self.retry.should_retry(job.retry_count) {
            self.attempt(&job).await
        } else {
            // Exhausted by a previous holder that never dead-lettered it.
            warn!(
                job_id = %job.id,
                worker_id = %self.id,
                retry_count = job.retry_count,
                "Claimed job has no retries left; moving to dead letter"
            );
            let message = job
                .last_error
                .clone()
                .unwrap_or_else(|| "retries exhausted before the job was dead-lettered".to_string());
            self.dead_letter(job.id, DeadLetterReason::new("retries_exhausted", message))
                .await
        };

        if let Ok(outcome) = &outcome {
            JobMetrics::generation(outcome.label(), started.elapsed(), outcome.items_inserted());
        }
        outcome
    }

    async fn attempt(&self, job: &GenerationJob) -> JobResult<ProcessOutcome> {
        let mut watch = self.cancellations.register(job.id);
        let result = self.supervise(job, &mut watch).await;
        drop(watch);

        match result {
            Ok(inserted) => self.finish(job, inserted).await,
            Err(JobError::Cancelled) => {
                info!(job_id = %job.id, worker_id = %self.id, "Job cancelled during generation");
                Ok(ProcessOutcome::Cancelled { job_id: job.id })
            }
            Err(e) if e.is_lease_lost() => {
                warn!(job_id = %job.id, worker_id = %self.id, "Lease lost; abandoning attempt");
                Ok(ProcessOutcome::LeaseLost { job_id: job.id })
            }
            Err(e) => self.fail(job, e).await,
        }
    }

    /// Runs generation and the idempotent writes while renewing the lease,
    /// watching for cancellation and enforcing the job timeout.
    async fn supervise(&self, job: &GenerationJob, watch: &mut CancellationWatch) -> JobResult<u64> {
        let work = self.generate_and_write(job);
        tokio::pin!(work);
        let cancelled = watch.cancelled();
        tokio::pin!(cancelled);
        let deadline = tokio::time::sleep(self.config.job_timeout());
        tokio::pin!(deadline);

        let period = self.config.lease_renew_interval();
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut work => return result,
                () = &mut cancelled => return Err(JobError::Cancelled),
                () = &mut deadline => {
                    warn!(job_id = %job.id, timeout = ?self.config.job_timeout(), "Job timed out");
                    return Err(JobError::DeadlineExceeded("generation"));
                }
                _ = renew.tick() => {
                    match self
                        .services
                        .coordinator
                        .extend_availability(job.id, &self.id, self.config.lease())
                        .await
                    {
                        Ok(_) => {}
                        Err(e) if e.is_lease_lost() => return Err(e),
                        Err(e) => warn!(job_id = %job.id, error = %e, "Lease renewal failed; retrying on next tick"),
                    }
                }
            }
        }
    }

    async fn generate_and_write(&self, job: &GenerationJob) -> JobResult<u64> {
        let services = &self.services;
        let op_timeout = self.config.operation_timeout();

        let template = with_deadline(op_timeout, "get_template", services.templates.get_template(job.template_id))
            .await?
            .ok_or_else(|| JobError::Generation(format!("template {} no longer exists", job.template_id)))?;
        let exceptions = with_deadline(
            op_timeout,
            "find_exceptions",
            services
                .exceptions
                .find_exceptions(template.id, job.generate_from, job.generate_until),
        )
        .await?;

        let items = panic::catch_unwind(AssertUnwindSafe(|| {
            services
                .generator
                .generate(&template, job.generate_from, job.generate_until, &exceptions)
        }))
        .map_err(|_| JobError::Generation(format!("generator panicked expanding template {}", template.id)))??;
        debug!(job_id = %job.id, items = items.len(), "Generated items");

        self.ensure_still_owned(job.id).await?;

        let inserted = self
            .transient
            .execute("batch_insert_items", || {
                with_deadline(op_timeout, "batch_insert_items", services.items.batch_insert_ignore_conflict(&items))
            })
            .await?;
        self.transient
            .execute("set_generated_through", || {
                with_deadline(
                    op_timeout,
                    "set_generated_through",
                    services.templates.set_generated_through(template.id, job.generate_until),
                )
            })
            .await?;

        debug!(job_id = %job.id, inserted, through = %job.generate_until, "Items written");
        Ok(inserted)
    }

    /// Notifications can be missed, so ownership is re-read before writing.
    async fn ensure_still_owned(&self, job_id: JobId) -> JobResult<()> {
        match self.services.coordinator.get_job(job_id).await? {
            Some(job) if job.is_claimed_by(&self.id) => Ok(()),
            Some(job) if job.status == JobStatus::Cancelled => Err(JobError::Cancelled),
            Some(_) => Err(JobError::lease_lost(job_id, &self.id)),
            None => Err(JobError::NotFound(format!("job {job_id}"))),
        }
    }

    async fn finish(&self, job: &GenerationJob, inserted: u64) -> JobResult<ProcessOutcome> {
        let coordinator = &self.services.coordinator;
        let completed = ProcessOutcome::Completed {
            job_id: job.id,
            items_inserted: inserted,
        };

        match self
            .transient
            .execute("complete_job", || coordinator.complete_job(job.id, &self.id))
            .await
        {
            Ok(()) => Ok(completed),
            Err(e) if e.is_lease_lost() => self.confirm_after_lease_lost(job.id, JobStatus::Completed, completed).await,
            Err(e) => Err(e),
        }
    }

    async fn fail(&self, job: &GenerationJob, err: JobError) -> JobResult<ProcessOutcome> {
        let message = err.to_string();

        match self.record_failure(job, &message).await {
            Ok(outcome) if outcome.will_retry => Ok(ProcessOutcome::Retrying {
                job_id: job.id,
                retry_count: outcome.retry_count,
                next_attempt_at: outcome.next_attempt_at,
            }),
            Ok(_) => self.dead_letter(job.id, DeadLetterReason::from(&err)).await,
            Err(e) if e.is_lease_lost() => Ok(ProcessOutcome::LeaseLost { job_id: job.id }),
            Err(e) => Err(e),
        }
    }

    /// `fail_job` is not idempotent: a timed-out call may still have
    /// committed, so it is only re-issued once a read shows the failure did
    /// not land.
    async fn record_failure(&self, job: &GenerationJob, message: &str) -> JobResult<FailOutcome> {
        let coordinator = &self.services.coordinator;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match coordinator.fail_job(job.id, &self.id, message, &self.retry).await {
                Err(e) if e.is_transient() => {
                    if let Some(outcome) = self.landed_failure(job).await? {
                        debug!(job_id = %job.id, retry_count = outcome.retry_count, "Failure was recorded before the error");
                        return Ok(outcome);
                    }
                    if attempt >= self.transient.max_attempts {
                        return Err(e);
                    }
                    let delay = self.transient.delay_for_attempt(attempt);
                    debug!(job_id = %job.id, attempt, ?delay, error = %e, "fail_job did not land, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Re-derives the outcome of a failure that already moved `retry_count`
    /// past the value seen at claim.
    async fn landed_failure(&self, job: &GenerationJob) -> JobResult<Option<FailOutcome>> {
        let current = self.services.coordinator.get_job(job.id).await?;
        Ok(current.filter(|c| c.retry_count > job.retry_count).map(|c| {
            let will_retry = self.retry.should_retry(c.retry_count);
            FailOutcome {
                will_retry,
                retry_count: c.retry_count,
                next_attempt_at: will_retry.then_some(c.scheduled_for),
            }
        }))
    }

    async fn dead_letter(&self, job_id: JobId, reason: DeadLetterReason) -> JobResult<ProcessOutcome> {
        let dead_letters = &self.services.dead_letters;
        let moved = ProcessOutcome::DeadLettered { job_id };

        match self
            .transient
            .execute("move_to_dead_letter", || {
                dead_letters.move_to_dead_letter(job_id, &self.id, reason.clone())
            })
            .await
        {
            Ok(_) => Ok(moved),
            Err(e) if e.is_lease_lost() => self.confirm_after_lease_lost(job_id, JobStatus::DeadLettered, moved).await,
            Err(e) => Err(e),
        }
    }

    /// A terminal call that timed out may have landed before its retry saw
    /// `LeaseLost`. Re-read the job to tell the two apart.
    async fn confirm_after_lease_lost(
        &self,
        job_id: JobId,
        expected: JobStatus,
        applied: ProcessOutcome,
    ) -> JobResult<ProcessOutcome> {
        let current = self.services.coordinator.get_job(job_id).await?;
        match current {
            Some(job) if job.status == expected && job.claimed_by.as_deref() == Some(self.id.as_str()) => Ok(applied),
            Some(job) if job.status == JobStatus::Cancelled => Ok(ProcessOutcome::Cancelled { job_id }),
            _ => {
                warn!(job_id = %job_id, worker_id = %self.id, "Lease lost before the job was finalized");
                Ok(ProcessOutcome::LeaseLost { job_id })
            }
        }
    }
}

#[derive(Default)]
struct PoolCounters {
    busy: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    cancelled: AtomicU64,
}

impl PoolCounters {
    fn record(&self, outcome: &ProcessOutcome) {
        match outcome {
            ProcessOutcome::Idle | ProcessOutcome::LeaseLost { .. } => {}
            ProcessOutcome::Completed { .. } => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            ProcessOutcome::Retrying { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            ProcessOutcome::DeadLettered { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.dead_lettered.fetch_add(1, Ordering::Relaxed);
            }
            ProcessOutcome::Cancelled { .. } => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Worker pool for concurrent generation.
pub struct WorkerPool {
    id: String,
    services: GenerationServices,
    config: WorkerConfig,
    retry: RetryConfig,
    cancellations: Arc<CancellationRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    pub fn new(services: GenerationServices, config: WorkerConfig, retry: RetryConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            id: format!("worker-pool-{}", Uuid::new_v4()),
            services,
            config,
            retry,
            cancellations: Arc::new(CancellationRegistry::default()),
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// Runs the workers until [`stop`](Self::stop) is called, then waits up
    /// to `shutdown_timeout` for in-flight jobs.
    pub async fn start(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Internal("Worker pool already running".to_string()));
        }

        let concurrency = self.config.concurrency.max(1);
        info!(
            pool_id = %self.id,
            concurrency,
            lease = ?self.config.lease(),
            "Starting worker pool"
        );
        WorkerMetrics::update_workers(&self.id, 0, concurrency);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let listener = tokio::spawn(
            listen_for_cancellations(
                self.services.coordinator.clone(),
                self.cancellations.clone(),
                self.shutdown_tx.subscribe(),
                self.config.poll_interval(),
            )
            .instrument(info_span!("cancellation_listener", pool_id = %self.id)),
        );

        let mut handles = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let worker_id = format!("{}-{}", self.config.worker_id_prefix, Uuid::new_v4());
            let worker = GenerationWorker::new(
                worker_id.clone(),
                self.services.clone(),
                self.config.clone(),
                self.retry.clone(),
            )
            .with_cancellations(self.cancellations.clone());

            handles.push(tokio::spawn(
                run_worker(
                    worker,
                    self.shutdown_tx.subscribe(),
                    self.config.poll_interval(),
                    self.counters.clone(),
                    self.id.clone(),
                    concurrency,
                )
                .instrument(info_span!("worker", worker_id = %worker_id)),
            ));
        }

        let _ = shutdown_rx.recv().await;
        info!(pool_id = %self.id, "Received shutdown signal");

        info!(pool_id = %self.id, "Waiting for workers to finish...");
        if timeout(self.config.shutdown_timeout(), futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(pool_id = %self.id, "Shutdown timeout elapsed; unfinished jobs will be reclaimed after their leases expire");
        }
        listener.abort();

        self.running.store(false, Ordering::SeqCst);
        WorkerMetrics::update_workers(&self.id, 0, concurrency);

        let stats = self.stats();
        info!(
            pool_id = %self.id,
            completed = stats.jobs_completed,
            failed = stats.jobs_failed,
            dead_lettered = stats.jobs_dead_lettered,
            "Worker pool stopped"
        );
        Ok(())
    }

    /// Stop the worker pool.
    pub fn stop(&self) {
        info!(pool_id = %self.id, "Stopping worker pool...");
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            id: self.id.clone(),
            running: self.is_running(),
            concurrency: self.config.concurrency,
            busy: self.counters.busy.load(Ordering::Relaxed),
            jobs_completed: self.counters.completed.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            jobs_dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            jobs_cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Worker pool statistics.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    pub id: String,
    pub running: bool,
    pub concurrency: usize,
    /// Workers currently inside `process_next`.
    pub busy: u64,
    pub jobs_completed: u64,
    /// Failed attempts, whether requeued or dead-lettered.
    pub jobs_failed: u64,
    pub jobs_dead_lettered: u64,
    pub jobs_cancelled: u64,
}

async fn run_worker(
    worker: GenerationWorker,
    mut shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
    counters: Arc<PoolCounters>,
    pool_id: String,
    concurrency: usize,
) {
    debug!(worker_id = %worker.id(), "Worker started");
    loop {
        if !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty)) {
            break;
        }

        let busy = counters.busy.fetch_add(1, Ordering::Relaxed) + 1;
        WorkerMetrics::update_workers(&pool_id, busy, concurrency);
        let result = worker.process_next().await;
        let busy = counters.busy.fetch_sub(1, Ordering::Relaxed) - 1;
        WorkerMetrics::update_workers(&pool_id, busy, concurrency);

        let idle = match result {
            Ok(outcome) => {
                counters.record(&outcome);
                outcome == ProcessOutcome::Idle
            }
            Err(e) => {
                error!(worker_id = %worker.id(), error = %e, "Failed to process next job");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                () = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
    debug!(worker_id = %worker.id(), "Worker stopped");
}

/// Fans cancellation notifications out to local workers, re-subscribing
/// whenever the stream ends.
async fn listen_for_cancellations(
    coordinator: JobCoordinator,
    registry: Arc<CancellationRegistry>,
    mut shutdown_rx: broadcast::Receiver<()>,
    retry_delay: Duration,
) {
    loop {
        match coordinator.subscribe_to_cancellations().await {
            Ok(mut stream) => loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    next = stream.next() => match next {
                        Some(job_id) => {
                            if registry.cancel(job_id) {
                                debug!(job_id = %job_id, "Cancellation delivered to local worker");
                            }
                        }
                        None => {
                            debug!("Cancellation stream ended; resubscribing");
                            break;
                        }
                    },
                }
            },
            Err(e) => warn!(error = %e, "Failed to subscribe to cancellations"),
        }

        tokio::select! {
            _ = shutdown_rx.recv() => return,
            () = tokio::time::sleep(retry_delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::generator::{IntervalTaskGenerator, RecurringTemplate, TaskException};
    use crate::job::NewGenerationJob;
    use crate::memory::InMemoryStore;
    use crate::notifier::BroadcastNotifier;
    use crate::store::JobStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use horizon_core::TemplateId;
    use tokio::sync::Notify;

    /// Blocks `find_exceptions` until the test opens the gate.
    struct GatedExceptions {
        inner: Arc<InMemoryStore>,
        entered: Arc<Notify>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl ExceptionStore for GatedExceptions {
        async fn find_exceptions(
            &self,
            template_id: TemplateId,
            from: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> JobResult<Vec<TaskException>> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.find_exceptions(template_id, from, until).await
        }
    }

    struct FailingGenerator;

    impl TaskGenerator for FailingGenerator {
        fn generate(
            &self,
            _template: &RecurringTemplate,
            _from: DateTime<Utc>,
            _until: DateTime<Utc>,
            _exceptions: &[TaskException],
        ) -> JobResult<Vec<crate::generator::TodoItem>> {
            Err(JobError::Generation("calendar service unavailable".to_string()))
        }
    }

    /// Commits `fail` and then stalls, so the caller's deadline fires after
    /// the write has landed.
    struct SlowFailStore {
        inner: Arc<InMemoryStore>,
        stall: Duration,
    }

    #[async_trait]
    impl JobStore for SlowFailStore {
        async fn insert_job(&self, job: NewGenerationJob) -> JobResult<GenerationJob> {
            self.inner.insert_job(job).await
        }

        async fn insert_many(&self, jobs: Vec<NewGenerationJob>) -> JobResult<Vec<GenerationJob>> {
            self.inner.insert_many(jobs).await
        }

        async fn get_job(&self, id: JobId) -> JobResult<Option<GenerationJob>> {
            self.inner.get_job(id).await
        }

        async fn claim_next(&self, worker_id: &str, lease: Duration) -> JobResult<Option<GenerationJob>> {
            self.inner.claim_next(worker_id, lease).await
        }

        async fn extend_availability(&self, id: JobId, worker_id: &str, extension: Duration) -> JobResult<DateTime<Utc>> {
            self.inner.extend_availability(id, worker_id, extension).await
        }

        async fn complete(&self, id: JobId, worker_id: &str) -> JobResult<()> {
            self.inner.complete(id, worker_id).await
        }

        async fn fail(&self, id: JobId, worker_id: &str, error_message: &str, retry: &RetryConfig) -> JobResult<FailOutcome> {
            let outcome = self.inner.fail(id, worker_id, error_message, retry).await;
            tokio::time::sleep(self.stall).await;
            outcome
        }

        async fn cancel(&self, id: JobId) -> JobResult<crate::job::CancelOutcome> {
            self.inner.cancel(id).await
        }

        async fn has_open_job(&self, template_id: TemplateId) -> JobResult<bool> {
            self.inner.has_open_job(template_id).await
        }
    }

    struct PanickingGenerator;

    impl TaskGenerator for PanickingGenerator {
        fn generate(
            &self,
            template: &RecurringTemplate,
            _from: DateTime<Utc>,
            _until: DateTime<Utc>,
            _exceptions: &[TaskException],
        ) -> JobResult<Vec<crate::generator::TodoItem>> {
            panic!("recurrence rule for {} overflowed", template.id)
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryStore>,
        services: GenerationServices,
        template_id: TemplateId,
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            lease_secs: 10,
            lease_renew_interval_secs: 4,
            ..WorkerConfig::default()
        }
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let template_id = TemplateId::new();
        store.insert_template(RecurringTemplate {
            id: template_id,
            title: "Daily review".to_string(),
            anchor_at: clock.now(),
            interval_secs: 86_400,
            sync_horizon_days: 7,
            generation_horizon_days: 30,
            generated_through: None,
            active: true,
        });
        let services = GenerationServices {
            coordinator: JobCoordinator::new(store.clone(), Arc::new(BroadcastNotifier::default())),
            dead_letters: DeadLetterManager::new(store.clone()),
            templates: store.clone(),
            exceptions: store.clone(),
            items: store.clone(),
            generator: Arc::new(IntervalTaskGenerator),
        };
        Fixture {
            clock,
            store,
            services,
            template_id,
        }
    }

    impl Fixture {
        async fn enqueue_days(&self, days: i64) -> JobId {
            let from = self.clock.now();
            self.store
                .insert_job(NewGenerationJob::new(self.template_id, from, from + ChronoDuration::days(days)))
                .await
                .unwrap()
                .id
        }

        fn worker(&self, id: &str) -> GenerationWorker {
            GenerationWorker::new(id, self.services.clone(), worker_config(), RetryConfig::default())
        }

        fn gated(&mut self) -> (Arc<Notify>, Arc<Notify>) {
            let entered = Arc::new(Notify::new());
            let gate = Arc::new(Notify::new());
            self.services.exceptions = Arc::new(GatedExceptions {
                inner: self.store.clone(),
                entered: entered.clone(),
                gate: gate.clone(),
            });
            (entered, gate)
        }
    }

    #[tokio::test]
    async fn test_idle_when_nothing_claimable() {
        let fx = fixture();
        assert_eq!(fx.worker("w1").process_next().await.unwrap(), ProcessOutcome::Idle);
    }

    #[tokio::test]
    async fn test_completes_and_writes_items() {
        let fx = fixture();
        let job_id = fx.enqueue_days(30).await;

        let outcome = fx.worker("w1").process_next().await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Completed {
                job_id,
                items_inserted: 30
            }
        );

        let job = fx.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let template = fx.store.template(fx.template_id).unwrap();
        assert_eq!(template.generated_through, Some(job.generate_until));
        assert_eq!(fx.store.items_for(fx.template_id).len(), 30);
    }

    #[tokio::test]
    async fn test_failures_retry_then_dead_letter() {
        let mut fx = fixture();
        fx.services.generator = Arc::new(FailingGenerator);
        let job_id = fx.enqueue_days(1).await;
        let retry = RetryConfig::exponential(2).with_base_delay(Duration::ZERO);
        let worker = GenerationWorker::new("w1", fx.services.clone(), worker_config(), retry);

        match worker.process_next().await.unwrap() {
            ProcessOutcome::Retrying { retry_count, .. } => assert_eq!(retry_count, 1),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            worker.process_next().await.unwrap(),
            ProcessOutcome::DeadLettered { job_id }
        );

        let listed = fx.services.dead_letters.list_dead_letter_jobs(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].error_type, "generation");
        assert_eq!(listed[0].retry_count, 2);
        assert!(fx.store.items_for(fx.template_id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_failure_is_counted_once() {
        let mut fx = fixture();
        fx.services.generator = Arc::new(FailingGenerator);
        let slow = Arc::new(SlowFailStore {
            inner: fx.store.clone(),
            stall: Duration::from_millis(300),
        });
        fx.services.coordinator = JobCoordinator::new(slow, Arc::new(BroadcastNotifier::default()))
            .with_operation_timeout(Duration::from_millis(50));
        let job_id = fx.enqueue_days(1).await;
        let worker = GenerationWorker::new("w1", fx.services.clone(), worker_config(), RetryConfig::exponential(1));

        assert_eq!(
            worker.process_next().await.unwrap(),
            ProcessOutcome::DeadLettered { job_id }
        );

        let job = fx.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.status, JobStatus::DeadLettered);
        let listed = fx.services.dead_letters.list_dead_letter_jobs(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_failure_with_retries_left_is_requeued_once() {
        let mut fx = fixture();
        fx.services.generator = Arc::new(FailingGenerator);
        let slow = Arc::new(SlowFailStore {
            inner: fx.store.clone(),
            stall: Duration::from_millis(300),
        });
        fx.services.coordinator = JobCoordinator::new(slow, Arc::new(BroadcastNotifier::default()))
            .with_operation_timeout(Duration::from_millis(50));
        let job_id = fx.enqueue_days(1).await;
        let worker = GenerationWorker::new("w1", fx.services.clone(), worker_config(), RetryConfig::exponential(3));

        match worker.process_next().await.unwrap() {
            ProcessOutcome::Retrying { retry_count, .. } => assert_eq!(retry_count, 1),
            other => panic!("unexpected outcome {other:?}"),
        }
        let job = fx.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_generator_panic_fails_attempt() {
        let mut fx = fixture();
        fx.services.generator = Arc::new(PanickingGenerator);
        let job_id = fx.enqueue_days(1).await;
        let retry = RetryConfig::exponential(1);
        let worker = GenerationWorker::new("w1", fx.services.clone(), worker_config(), retry);

        assert_eq!(
            worker.process_next().await.unwrap(),
            ProcessOutcome::DeadLettered { job_id }
        );
        let listed = fx.services.dead_letters.list_dead_letter_jobs(10).await.unwrap();
        assert_eq!(listed[0].error_type, "generation");
        assert!(listed[0].error_message.contains("panicked"));
    }

    #[tokio::test]
    async fn test_orphaned_exhausted_job_is_dead_lettered_on_claim() {
        let fx = fixture();
        let job_id = fx.enqueue_days(1).await;
        let retry = RetryConfig::exponential(1);

        // A worker records the final failure and crashes before dead-lettering.
        fx.store.claim_next("crashed", Duration::from_secs(10)).await.unwrap();
        let outcome = fx.store.fail(job_id, "crashed", "boom", &retry).await.unwrap();
        assert!(!outcome.will_retry);
        fx.clock.advance(Duration::from_secs(11));

        let worker = GenerationWorker::new("w2", fx.services.clone(), worker_config(), retry);
        assert_eq!(
            worker.process_next().await.unwrap(),
            ProcessOutcome::DeadLettered { job_id }
        );

        let listed = fx.services.dead_letters.list_dead_letter_jobs(10).await.unwrap();
        assert_eq!(listed[0].error_type, "retries_exhausted");
        assert_eq!(listed[0].error_message, "boom");
        assert_eq!(listed[0].last_worker_id, "w2");
        assert!(fx.store.items_for(fx.template_id).is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_signal_aborts_attempt() {
        let mut fx = fixture();
        let (entered, gate) = fx.gated();
        let job_id = fx.enqueue_days(3).await;
        let worker = fx.worker("w1");

        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.process_next().await }
        });
        entered.notified().await;

        fx.services.coordinator.cancel_job(job_id).await.unwrap();
        assert!(worker.cancellations.cancel(job_id));
        gate.notify_one();

        assert_eq!(running.await.unwrap().unwrap(), ProcessOutcome::Cancelled { job_id });
        assert!(fx.store.items_for(fx.template_id).is_empty());
        assert_eq!(fx.store.get_job(job_id).await.unwrap().unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_missed_cancellation_caught_before_write() {
        let mut fx = fixture();
        let (entered, gate) = fx.gated();
        let job_id = fx.enqueue_days(3).await;
        let worker = fx.worker("w1");

        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.process_next().await }
        });
        entered.notified().await;

        // Status changes but the notification never reaches this worker.
        fx.store.cancel(job_id).await.unwrap();
        gate.notify_one();

        assert_eq!(running.await.unwrap().unwrap(), ProcessOutcome::Cancelled { job_id });
        assert!(fx.store.items_for(fx.template_id).is_empty());
        assert_eq!(fx.store.template(fx.template_id).unwrap().generated_through, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_lost_on_renewal_abandons_attempt() {
        let mut fx = fixture();
        let (entered, _gate) = fx.gated();
        let job_id = fx.enqueue_days(3).await;
        let worker = fx.worker("w1");

        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.process_next().await }
        });
        entered.notified().await;

        // W1 stalls past its lease and W2 takes the job over.
        fx.clock.advance(Duration::from_secs(11));
        let reclaimed = fx
            .services
            .coordinator
            .claim_next_job("w2", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, job_id);

        assert_eq!(running.await.unwrap().unwrap(), ProcessOutcome::LeaseLost { job_id });
        assert!(fx.store.items_for(fx.template_id).is_empty());
        let job = fx.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.claimed_by.as_deref(), Some("w2"));
        assert_eq!(job.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_slow_job_leased() {
        let mut fx = fixture();
        let (entered, gate) = fx.gated();
        let job_id = fx.enqueue_days(3).await;
        let worker = fx.worker("w1");

        let running = tokio::spawn({
            let worker = worker.clone();
            async move { worker.process_next().await }
        });
        entered.notified().await;

        // The renewal at 4s pushes expiry to T+3s+10s; T+11s is past the
        // original lease but inside the renewed one.
        fx.clock.advance(Duration::from_secs(3));
        tokio::time::sleep(Duration::from_secs(5)).await;
        fx.clock.advance(Duration::from_secs(8));
        assert!(fx
            .services
            .coordinator
            .claim_next_job("w2", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none());

        gate.notify_one();
        assert!(matches!(
            running.await.unwrap().unwrap(),
            ProcessOutcome::Completed { items_inserted: 3, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_fails_attempt() {
        let mut fx = fixture();
        let (entered, _gate) = fx.gated();
        let job_id = fx.enqueue_days(1).await;
        let config = WorkerConfig {
            job_timeout_secs: 2,
            ..worker_config()
        };
        let worker = GenerationWorker::new("w1", fx.services.clone(), config, RetryConfig::default());

        let running = tokio::spawn(async move { worker.process_next().await });
        entered.notified().await;

        match running.await.unwrap().unwrap() {
            ProcessOutcome::Retrying {
                job_id: id,
                retry_count,
                ..
            } => {
                assert_eq!(id, job_id);
                assert_eq!(retry_count, 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let job = fx.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.last_error.unwrap().contains("generation"));
    }

    #[test]
    fn test_registry_forgets_finished_jobs() {
        let registry = Arc::new(CancellationRegistry::default());
        let job_id = JobId::new();
        let watch = registry.register(job_id);
        assert!(registry.cancel(job_id));
        drop(watch);
        assert!(!registry.cancel(job_id));
    }
}
