//! Horizon sweeper: enqueues generation work for templates whose generated
//! range is about to run out.
//!
//! Every instance ticks on the same cron schedule; the exclusive run lock
//! makes sure only one of them sweeps per tick.

use crate::clock::{Clock, SystemClock};
use crate::config::SweepConfig;
use crate::coordinator::{with_deadline, JobCoordinator, DEFAULT_OPERATION_TIMEOUT};
use crate::dead_letter::DeadLetterManager;
use crate::error::{JobError, JobResult};
use crate::exclusive::ExclusiveRunLock;
use crate::generator::{RecurringTemplate, TemplateStore};
use crate::job::NewGenerationJob;
use crate::metrics::SweepMetrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// What one sweep tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// False when another instance held the sweep lease.
    pub acquired: bool,
    pub templates_scanned: usize,
    /// Templates left alone because work is already queued or nothing is due.
    pub templates_skipped: usize,
    pub templates_failed: usize,
    pub jobs_enqueued: usize,
}

/// Splits `[from, until)` into consecutive windows of at most `max_days`,
/// lazily, so callers can stop after as many as they want to enqueue.
pub fn plan_windows(
    from: DateTime<Utc>,
    until: DateTime<Utc>,
    max_days: u32,
) -> impl Iterator<Item = (DateTime<Utc>, DateTime<Utc>)> {
    let step = ChronoDuration::try_days(i64::from(max_days.max(1)));
    let mut start = from;
    std::iter::from_fn(move || {
        if start >= until {
            return None;
        }
        let end = step
            .and_then(|step| start.checked_add_signed(step))
            .map_or(until, |end| end.min(until));
        let window = (start, end);
        start = end;
        Some(window)
    })
}

pub struct HorizonSweeper {
    holder_id: String,
    lock: ExclusiveRunLock,
    coordinator: JobCoordinator,
    dead_letters: DeadLetterManager,
    templates: Arc<dyn TemplateStore>,
    clock: Arc<dyn Clock>,
    config: SweepConfig,
    operation_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
    runs: AtomicU64,
}

impl HorizonSweeper {
    pub fn new(
        holder_id: impl Into<String>,
        lock: ExclusiveRunLock,
        coordinator: JobCoordinator,
        dead_letters: DeadLetterManager,
        templates: Arc<dyn TemplateStore>,
        config: SweepConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            holder_id: holder_id.into(),
            lock,
            coordinator,
            dead_letters,
            templates,
            clock: Arc::new(SystemClock),
            config,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            shutdown_tx,
            running: AtomicBool::new(false),
            runs: AtomicU64::new(0),
        }
    }

    /// Evaluates staleness against `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Number of ticks that held the lease.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// One sweep tick. Contention is reported, not raised.
    pub async fn run_once(&self) -> JobResult<SweepReport> {
        let guard = self
            .lock
            .try_acquire_exclusive_run(&self.config.run_type, &self.holder_id, self.config.lease())
            .await?;
        let Some(guard) = guard else {
            SweepMetrics::sweep_run(&self.holder_id, "skipped");
            debug!(holder_id = %self.holder_id, "Sweep lease held elsewhere; skipping tick");
            return Ok(SweepReport::default());
        };

        let result = self.sweep(self.clock.now()).await;
        if let Err(e) = guard.release().await {
            warn!(holder_id = %self.holder_id, error = %e, "Failed to release sweep lease; it will expire");
        }
        self.runs.fetch_add(1, Ordering::Relaxed);

        match &result {
            Ok(report) => {
                SweepMetrics::sweep_run(&self.holder_id, "completed");
                info!(
                    holder_id = %self.holder_id,
                    scanned = report.templates_scanned,
                    skipped = report.templates_skipped,
                    failed = report.templates_failed,
                    enqueued = report.jobs_enqueued,
                    "Sweep completed"
                );
            }
            Err(e) => {
                SweepMetrics::sweep_run(&self.holder_id, "failed");
                error!(holder_id = %self.holder_id, error = %e, "Sweep failed");
            }
        }
        result
    }

    async fn sweep(&self, now: DateTime<Utc>) -> JobResult<SweepReport> {
        let stale = with_deadline(
            self.operation_timeout,
            "find_stale_templates",
            self.templates.find_stale_templates(now, self.config.batch_limit),
        )
        .await?;

        let mut report = SweepReport {
            acquired: true,
            ..SweepReport::default()
        };
        for template in &stale {
            report.templates_scanned += 1;
            match self.enqueue_template(template, now).await {
                Ok(0) => report.templates_skipped += 1,
                Ok(enqueued) => report.jobs_enqueued += enqueued,
                Err(e) => {
                    report.templates_failed += 1;
                    warn!(template_id = %template.id, error = %e, "Failed to enqueue generation for template");
                }
            }
        }
        Ok(report)
    }

    async fn enqueue_template(&self, template: &RecurringTemplate, now: DateTime<Utc>) -> JobResult<usize> {
        if self.coordinator.has_open_job(template.id).await? {
            debug!(template_id = %template.id, "Generation already queued");
            return Ok(0);
        }
        // A failed window stays parked until an operator retries or discards it.
        if self.dead_letters.has_unresolved_dead_letter(template.id).await? {
            debug!(template_id = %template.id, "Generation awaiting dead-letter review");
            return Ok(0);
        }

        let jobs: Vec<_> = plan_windows(
            template.generation_cursor(),
            template.generation_target(now)?,
            self.config.max_window_days,
        )
        .take(self.config.max_windows_per_tick as usize)
        .map(|(from, until)| NewGenerationJob::new(template.id, from, until))
        .collect();

        let inserted = self.coordinator.insert_many(jobs).await?;
        if !inserted.is_empty() {
            debug!(template_id = %template.id, jobs = inserted.len(), "Generation enqueued");
        }
        Ok(inserted.len())
    }

    /// Ticks on the cron schedule until [`stop`](Self::stop) is called.
    pub async fn start(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Configuration("Sweeper already running".to_string()));
        }
        let schedule = self.config.parsed_schedule()?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(
            holder_id = %self.holder_id,
            schedule = %self.config.schedule,
            run_type = %self.config.run_type,
            "Starting horizon sweeper"
        );

        loop {
            let now = Utc::now();
            let Some(next) = schedule.after(&now).next() else {
                warn!(schedule = %self.config.schedule, "Sweep schedule has no upcoming ticks");
                break;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(holder_id = %self.holder_id, "Received shutdown signal");
                    break;
                }
                () = tokio::time::sleep(wait) => {
                    // Errors are logged by run_once; the next tick tries again.
                    let _ = self.run_once().await;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!(holder_id = %self.holder_id, "Horizon sweeper stopped");
        Ok(())
    }

    pub fn stop(&self) {
        info!(holder_id = %self.holder_id, "Stopping horizon sweeper...");
        let _ = self.shutdown_tx.send(());
    }
}
