//! In-process implementation of every store trait.
//!
//! Backs single-process embeddings and tests. All state sits behind one
//! mutex, so each call is trivially atomic; time comes from the injected
//! [`Clock`].

use crate::clock::{offset, Clock, SystemClock};
use crate::error::{JobError, JobResult};
use crate::generator::{ExceptionStore, ItemStore, RecurringTemplate, TaskException, TemplateStore, TodoItem};
use crate::job::{
    CancelOutcome, DeadLetterJob, DeadLetterReason, DeadLetterResolution, FailOutcome, GenerationJob, JobStatus,
    NewGenerationJob,
};
use crate::retry::RetryConfig;
use crate::store::{DeadLetterStore, ExclusiveRunLease, ExclusiveRunStore, JobStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use horizon_core::{DeadLetterId, JobId, TemplateId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, GenerationJob>,
    dead_letters: HashMap<DeadLetterId, DeadLetterJob>,
    runs: HashMap<String, ExclusiveRunLease>,
    templates: HashMap<TemplateId, RecurringTemplate>,
    exceptions: Vec<TaskException>,
    items: BTreeMap<(TemplateId, DateTime<Utc>), TodoItem>,
}

impl State {
    fn insert_pending(&mut self, job: NewGenerationJob, now: DateTime<Utc>) -> JobResult<GenerationJob> {
        job.validate()?;
        if !self.templates.contains_key(&job.template_id) {
            return Err(JobError::ConstraintViolation(format!(
                "template {} does not exist",
                job.template_id
            )));
        }
        if self.jobs.contains_key(&job.id) {
            return Err(JobError::ConstraintViolation(format!("job {} already exists", job.id)));
        }
        let row = job.into_job(now);
        self.jobs.insert(row.id, row.clone());
        Ok(row)
    }

    fn claimed_job_mut(&mut self, id: JobId, worker_id: &str) -> JobResult<&mut GenerationJob> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| JobError::NotFound(format!("job {id}")))?;
        if !job.is_claimed_by(worker_id) {
            return Err(JobError::lease_lost(id, worker_id));
        }
        Ok(job)
    }

    fn unresolved_mut(&mut self, id: DeadLetterId) -> JobResult<&mut DeadLetterJob> {
        self.dead_letters
            .get_mut(&id)
            .filter(|dl| !dl.is_resolved())
            .ok_or_else(|| JobError::NotFound(format!("unresolved dead-letter job {id}")))
    }
}

/// Shared in-memory store.
pub struct InMemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates a store driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Adds or replaces a template.
    pub fn insert_template(&self, template: RecurringTemplate) {
        self.state.lock().templates.insert(template.id, template);
    }

    /// Returns the stored template.
    pub fn template(&self, id: TemplateId) -> Option<RecurringTemplate> {
        self.state.lock().templates.get(&id).cloned()
    }

    /// Adds a per-occurrence exception.
    pub fn add_exception(&self, exception: TaskException) {
        self.state.lock().exceptions.push(exception);
    }

    /// Items generated for a template, ordered by slot.
    pub fn items_for(&self, template_id: TemplateId) -> Vec<TodoItem> {
        self.state
            .lock()
            .items
            .values()
            .filter(|item| item.template_id == template_id)
            .cloned()
            .collect()
    }

    /// Every job in the store, oldest `scheduled_for` first.
    pub fn jobs(&self) -> Vec<GenerationJob> {
        let mut jobs: Vec<_> = self.state.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.scheduled_for, j.id));
        jobs
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(&self, job: NewGenerationJob) -> JobResult<GenerationJob> {
        let now = self.now();
        self.state.lock().insert_pending(job, now)
    }

    async fn insert_many(&self, jobs: Vec<NewGenerationJob>) -> JobResult<Vec<GenerationJob>> {
        let now = self.now();
        let mut state = self.state.lock();

        // Check everything up front so a rejected batch leaves no rows behind.
        for job in &jobs {
            job.validate()?;
            if !state.templates.contains_key(&job.template_id) {
                return Err(JobError::ConstraintViolation(format!(
                    "template {} does not exist",
                    job.template_id
                )));
            }
            if state.jobs.contains_key(&job.id) || jobs.iter().filter(|other| other.id == job.id).count() > 1 {
                return Err(JobError::ConstraintViolation(format!("job {} already exists", job.id)));
            }
        }

        jobs.into_iter().map(|job| state.insert_pending(job, now)).collect()
    }

    async fn get_job(&self, id: JobId) -> JobResult<Option<GenerationJob>> {
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn claim_next(&self, worker_id: &str, lease: Duration) -> JobResult<Option<GenerationJob>> {
        let now = self.now();
        let expires_at = now + offset(lease)?;
        let mut state = self.state.lock();

        let candidate = state
            .jobs
            .values()
            .filter(|job| job.is_claimable_at(now))
            .min_by_key(|job| (job.scheduled_for, job.id))
            .map(|job| job.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| JobError::Internal(format!("claimed job {id} vanished")))?;
        if let Some(previous) = job.claimed_by.as_deref().filter(|_| job.status == JobStatus::Running) {
            debug!(job_id = %id, previous_worker = %previous, worker_id, "Reclaiming job with expired lease");
        }
        job.status = JobStatus::Running;
        job.claimed_by = Some(worker_id.to_string());
        job.claimed_at = Some(now);
        job.available_at = Some(expires_at);
        Ok(Some(job.clone()))
    }

    async fn extend_availability(&self, id: JobId, worker_id: &str, extension: Duration) -> JobResult<DateTime<Utc>> {
        let expires_at = self.now() + offset(extension)?;
        let mut state = self.state.lock();
        let job = state.claimed_job_mut(id, worker_id)?;
        job.available_at = Some(expires_at);
        Ok(expires_at)
    }

    async fn complete(&self, id: JobId, worker_id: &str) -> JobResult<()> {
        let now = self.now();
        let mut state = self.state.lock();
        let job = state.claimed_job_mut(id, worker_id)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.available_at = None;
        Ok(())
    }

    async fn fail(&self, id: JobId, worker_id: &str, error_message: &str, retry: &RetryConfig) -> JobResult<FailOutcome> {
        let now = self.now();
        let mut state = self.state.lock();
        let job = state.claimed_job_mut(id, worker_id)?;

        let retry_count = job.retry_count + 1;
        let next_attempt_at = now + offset(retry.backoff(retry_count))?;
        job.retry_count = retry_count;
        job.last_error = Some(error_message.to_string());

        if !retry.should_retry(retry_count) {
            return Ok(FailOutcome {
                will_retry: false,
                retry_count,
                next_attempt_at: None,
            });
        }

        job.status = JobStatus::Pending;
        job.claimed_by = None;
        job.claimed_at = None;
        job.available_at = None;
        job.scheduled_for = next_attempt_at;

        Ok(FailOutcome {
            will_retry: true,
            retry_count,
            next_attempt_at: Some(next_attempt_at),
        })
    }

    async fn cancel(&self, id: JobId) -> JobResult<CancelOutcome> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| JobError::NotFound(format!("job {id}")))?;
        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(job.status));
        }
        job.status = JobStatus::Cancelled;
        job.available_at = None;
        Ok(CancelOutcome::Cancelled)
    }

    async fn has_open_job(&self, template_id: TemplateId) -> JobResult<bool> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .any(|job| job.template_id == template_id && matches!(job.status, JobStatus::Pending | JobStatus::Running)))
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryStore {
    async fn move_to_dead_letter(&self, job_id: JobId, worker_id: &str, reason: DeadLetterReason) -> JobResult<DeadLetterJob> {
        let now = self.now();
        let mut state = self.state.lock();
        let job = state.claimed_job_mut(job_id, worker_id)?;
        job.status = JobStatus::DeadLettered;
        job.available_at = None;

        let record = DeadLetterJob::from_job(job, worker_id, reason, now);
        state.dead_letters.insert(record.id, record.clone());
        Ok(record)
    }

    async fn list_unresolved(&self, limit: u32) -> JobResult<Vec<DeadLetterJob>> {
        let state = self.state.lock();
        let mut records: Vec<_> = state
            .dead_letters
            .values()
            .filter(|dl| !dl.is_resolved())
            .cloned()
            .collect();
        records.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then_with(|| b.id.cmp(&a.id)));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn get_dead_letter(&self, id: DeadLetterId) -> JobResult<Option<DeadLetterJob>> {
        Ok(self.state.lock().dead_letters.get(&id).cloned())
    }

    async fn retry_dead_letter(&self, id: DeadLetterId, reviewed_by: &str) -> JobResult<GenerationJob> {
        let now = self.now();
        let mut state = self.state.lock();
        let record = state.unresolved_mut(id)?.clone();

        let job = state.insert_pending(
            NewGenerationJob::new(record.template_id, record.generate_from, record.generate_until),
            now,
        )?;

        let record = state.unresolved_mut(id)?;
        record.resolution = Some(DeadLetterResolution::Retried);
        record.reviewed_by = Some(reviewed_by.to_string());
        record.reviewed_at = Some(now);
        record.retried_job_id = Some(job.id);
        Ok(job)
    }

    async fn discard_dead_letter(&self, id: DeadLetterId, reviewed_by: &str, note: &str) -> JobResult<()> {
        let now = self.now();
        let mut state = self.state.lock();
        let record = state.unresolved_mut(id)?;
        record.resolution = Some(DeadLetterResolution::Discarded);
        record.reviewed_by = Some(reviewed_by.to_string());
        record.reviewed_at = Some(now);
        record.note = Some(note.to_string());
        Ok(())
    }

    async fn has_unresolved(&self, template_id: TemplateId) -> JobResult<bool> {
        Ok(self
            .state
            .lock()
            .dead_letters
            .values()
            .any(|dl| dl.template_id == template_id && !dl.is_resolved()))
    }
}

#[async_trait]
impl ExclusiveRunStore for InMemoryStore {
    async fn try_acquire(&self, run_type: &str, holder_id: &str, lease: Duration) -> JobResult<Option<ExclusiveRunLease>> {
        let now = self.now();
        let expires_at = now + offset(lease)?;
        let mut state = self.state.lock();

        if let Some(current) = state.runs.get(run_type) {
            if current.expires_at > now {
                return Ok(None);
            }
        }

        let acquired = ExclusiveRunLease {
            run_type: run_type.to_string(),
            holder_id: holder_id.to_string(),
            token: Uuid::new_v4(),
            acquired_at: now,
            expires_at,
        };
        state.runs.insert(run_type.to_string(), acquired.clone());
        Ok(Some(acquired))
    }

    async fn release(&self, run_type: &str, token: Uuid) -> JobResult<bool> {
        let mut state = self.state.lock();
        match state.runs.get(run_type) {
            Some(current) if current.token == token => {
                state.runs.remove(run_type);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl TemplateStore for InMemoryStore {
    async fn get_template(&self, id: TemplateId) -> JobResult<Option<RecurringTemplate>> {
        Ok(self.template(id))
    }

    async fn find_stale_templates(&self, now: DateTime<Utc>, limit: u32) -> JobResult<Vec<RecurringTemplate>> {
        let state = self.state.lock();
        let mut stale: Vec<_> = state
            .templates
            .values()
            .filter(|t| t.is_stale_at(now))
            .cloned()
            .collect();
        stale.sort_by_key(|t| (t.generation_cursor(), t.id));
        stale.truncate(limit as usize);
        Ok(stale)
    }

    async fn set_generated_through(&self, id: TemplateId, through: DateTime<Utc>) -> JobResult<()> {
        let mut state = self.state.lock();
        let template = state
            .templates
            .get_mut(&id)
            .ok_or_else(|| JobError::NotFound(format!("template {id}")))?;
        if template.generated_through.map_or(true, |current| current < through) {
            template.generated_through = Some(through);
        }
        Ok(())
    }
}

#[async_trait]
impl ExceptionStore for InMemoryStore {
    async fn find_exceptions(
        &self,
        template_id: TemplateId,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> JobResult<Vec<TaskException>> {
        Ok(self
            .state
            .lock()
            .exceptions
            .iter()
            .filter(|e| e.template_id == template_id && e.occurs_at >= from && e.occurs_at < until)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ItemStore for InMemoryStore {
    async fn batch_insert_ignore_conflict(&self, items: &[TodoItem]) -> JobResult<u64> {
        let mut state = self.state.lock();
        let mut inserted = 0;
        for item in items {
            let key = (item.template_id, item.occurs_at);
            if !state.items.contains_key(&key) {
                state.items.insert(key, item.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}
