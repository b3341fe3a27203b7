//! Integration tests for the PostgreSQL backend.
//!
//! These tests run against a real PostgreSQL database using testcontainers
//! and need Docker: `cargo test -p horizon-jobs -- --ignored`.

mod common;

use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use common::TestDatabase;
use futures::StreamExt;
use horizon_core::{JobId, TemplateId};
use horizon_jobs::postgres::{
    PgCancellationNotifier, PgDeadLetterStore, PgExclusiveRunStore, PgItemStore, PgJobStore, PgTemplateStore,
};
use horizon_jobs::{
    CancelOutcome, DeadLetterManager, DeadLetterReason, ExceptionKind, ExclusiveRunLock, GenerationServices,
    GenerationWorker, IntervalTaskGenerator, JobCoordinator, JobError, JobStatus, NewGenerationJob, ProcessOutcome,
    RecurringTemplate, RetryConfig, TaskException, TemplateStore, WorkerConfig,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn midnight() -> DateTime<Utc> {
    Utc::now().duration_trunc(ChronoDuration::days(1)).expect("truncate to day")
}

fn daily_template(anchor_at: DateTime<Utc>) -> RecurringTemplate {
    RecurringTemplate {
        id: TemplateId::new(),
        title: "Stand-up notes".to_string(),
        anchor_at,
        interval_secs: 86_400,
        sync_horizon_days: 7,
        generation_horizon_days: 30,
        generated_through: None,
        active: true,
    }
}

struct Stores {
    templates: Arc<PgTemplateStore>,
    items: Arc<PgItemStore>,
    coordinator: JobCoordinator,
    dead_letters: DeadLetterManager,
}

impl Stores {
    fn new(db: &TestDatabase) -> Self {
        let pool = db.pool();
        Self {
            templates: Arc::new(PgTemplateStore::new(pool.clone())),
            items: Arc::new(PgItemStore::new(pool.clone())),
            coordinator: JobCoordinator::new(
                Arc::new(PgJobStore::new(pool.clone())),
                Arc::new(PgCancellationNotifier::new(pool.clone(), "horizon_job_cancellations")),
            ),
            dead_letters: DeadLetterManager::new(Arc::new(PgDeadLetterStore::new(pool))),
        }
    }

    async fn template(&self) -> RecurringTemplate {
        let template = daily_template(midnight());
        self.templates
            .save_template(&template)
            .await
            .expect("Failed to save template");
        template
    }

    fn worker(&self, id: &str) -> GenerationWorker {
        let services = GenerationServices {
            coordinator: self.coordinator.clone(),
            dead_letters: self.dead_letters.clone(),
            templates: self.templates.clone(),
            exceptions: self.templates.clone(),
            items: self.items.clone(),
            generator: Arc::new(IntervalTaskGenerator),
        };
        GenerationWorker::new(id, services, WorkerConfig::default(), RetryConfig::default())
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_claim_then_complete() {
    let db = TestDatabase::new().await;
    let stores = Stores::new(&db);
    let template = stores.template().await;
    let from = template.anchor_at;

    let inserted = stores
        .coordinator
        .insert_job(NewGenerationJob::new(template.id, from, from + ChronoDuration::days(1)))
        .await
        .expect("Failed to insert job");
    assert_eq!(inserted.status, JobStatus::Pending);

    let claimed = stores
        .coordinator
        .claim_next_job("w1", Duration::from_secs(30))
        .await
        .expect("Claim failed")
        .expect("No job claimed");
    assert_eq!(claimed.id, inserted.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.claimed_by.as_deref(), Some("w1"));
    assert!(claimed.available_at.expect("lease expiry") > Utc::now());

    assert!(stores
        .coordinator
        .claim_next_job("w2", Duration::from_secs(30))
        .await
        .expect("Claim failed")
        .is_none());

    stores.coordinator.complete_job(claimed.id, "w1").await.expect("Complete failed");
    let done = stores.coordinator.get_job(claimed.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.completed_at.is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_concurrent_claims_skip_locked_rows() {
    let db = TestDatabase::new().await;
    let stores = Stores::new(&db);
    let template = stores.template().await;
    let from = template.anchor_at;

    let jobs: Vec<_> = (0..5)
        .map(|n| {
            NewGenerationJob::new(
                template.id,
                from + ChronoDuration::days(n),
                from + ChronoDuration::days(n + 1),
            )
        })
        .collect();
    stores.coordinator.insert_many(jobs).await.expect("Failed to insert jobs");

    let mut handles = Vec::new();
    for n in 0..10 {
        let coordinator = stores.coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.claim_next_job(&format!("w{n}"), Duration::from_secs(30)).await
        }));
    }

    let mut claimed = HashSet::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap().expect("Claim failed") {
            assert!(claimed.insert(job.id), "job {} claimed twice", job.id);
        }
    }
    assert_eq!(claimed.len(), 5);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_expired_lease_is_reclaimed_and_stale_owner_rejected() {
    let db = TestDatabase::new().await;
    let stores = Stores::new(&db);
    let template = stores.template().await;
    let from = template.anchor_at;
    let job = stores
        .coordinator
        .insert_job(NewGenerationJob::new(template.id, from, from + ChronoDuration::days(1)))
        .await
        .unwrap();

    stores
        .coordinator
        .claim_next_job("w1", Duration::from_secs(1))
        .await
        .unwrap()
        .expect("first claim");
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let reclaimed = stores
        .coordinator
        .claim_next_job("w2", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("reclaim");
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.claimed_by.as_deref(), Some("w2"));

    let err = stores.coordinator.complete_job(job.id, "w1").await.unwrap_err();
    assert!(err.is_lease_lost());
    let err = stores
        .coordinator
        .extend_availability(job.id, "w1", Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(err.is_lease_lost());

    let missing = stores.coordinator.complete_job(JobId::new(), "w2").await.unwrap_err();
    assert!(matches!(missing, JobError::NotFound(_)));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_fail_retry_and_dead_letter_review() {
    let db = TestDatabase::new().await;
    let stores = Stores::new(&db);
    let template = stores.template().await;
    let from = template.anchor_at;
    let job = stores
        .coordinator
        .insert_job(NewGenerationJob::new(template.id, from, from + ChronoDuration::days(3)))
        .await
        .unwrap();
    let retry = RetryConfig::exponential(2).with_base_delay(Duration::ZERO);

    stores.coordinator.claim_next_job("w1", Duration::from_secs(30)).await.unwrap();
    let first = stores.coordinator.fail_job(job.id, "w1", "timeout", &retry).await.unwrap();
    assert!(first.will_retry);
    assert_eq!(first.retry_count, 1);

    stores.coordinator.claim_next_job("w1", Duration::from_secs(30)).await.unwrap().expect("requeued");
    let second = stores.coordinator.fail_job(job.id, "w1", "timeout again", &retry).await.unwrap();
    assert!(!second.will_retry);
    assert_eq!(second.retry_count, 2);

    let record = stores
        .dead_letters
        .move_to_dead_letter(job.id, "w1", DeadLetterReason::new("transient", "timeout again"))
        .await
        .expect("Failed to dead-letter");
    assert_eq!(record.retry_count, 2);
    assert_eq!(
        stores.coordinator.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::DeadLettered
    );

    let listed = stores.dead_letters.list_dead_letter_jobs(10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, record.id);
    assert!(stores.dead_letters.has_unresolved_dead_letter(template.id).await.unwrap());

    let new_job_id = stores
        .dead_letters
        .retry_dead_letter_job(record.id, "ops@example.com")
        .await
        .expect("Failed to retry");
    let fresh = stores.coordinator.get_job(new_job_id).await.unwrap().unwrap();
    assert_eq!(fresh.retry_count, 0);
    assert_eq!(fresh.generate_from, job.generate_from);
    assert_eq!(fresh.generate_until, job.generate_until);
    assert!(stores.dead_letters.list_dead_letter_jobs(10).await.unwrap().is_empty());
    assert!(!stores.dead_letters.has_unresolved_dead_letter(template.id).await.unwrap());

    let again = stores
        .dead_letters
        .retry_dead_letter_job(record.id, "ops@example.com")
        .await
        .unwrap_err();
    assert!(matches!(again, JobError::NotFound(_)));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_cancel_and_notification() {
    let db = TestDatabase::new().await;
    let stores = Stores::new(&db);
    let template = stores.template().await;
    let from = template.anchor_at;
    let job = stores
        .coordinator
        .insert_job(NewGenerationJob::new(template.id, from, from + ChronoDuration::days(1)))
        .await
        .unwrap();

    let mut cancellations = stores.coordinator.subscribe_to_cancellations().await.expect("subscribe");
    assert_eq!(stores.coordinator.cancel_job(job.id).await.unwrap(), CancelOutcome::Cancelled);

    let received = tokio::time::timeout(Duration::from_secs(5), cancellations.next())
        .await
        .expect("no notification within 5s");
    assert_eq!(received, Some(job.id));

    assert_eq!(
        stores.coordinator.cancel_job(job.id).await.unwrap(),
        CancelOutcome::AlreadyTerminal(JobStatus::Cancelled)
    );
    assert!(matches!(
        stores.coordinator.cancel_job(JobId::new()).await.unwrap_err(),
        JobError::NotFound(_)
    ));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_exclusive_run_lease() {
    let db = TestDatabase::new().await;
    let lock = ExclusiveRunLock::new(Arc::new(PgExclusiveRunStore::new(db.pool())));

    let a = lock
        .try_acquire_exclusive_run("template-sweep", "a", Duration::from_secs(1))
        .await
        .unwrap()
        .expect("a acquires");
    assert!(lock
        .try_acquire_exclusive_run("template-sweep", "b", Duration::from_secs(60))
        .await
        .unwrap()
        .is_none());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let b = lock
        .try_acquire_exclusive_run("template-sweep", "b", Duration::from_secs(60))
        .await
        .unwrap()
        .expect("b acquires after expiry");

    // a's release must not clear b's lease.
    a.release().await.unwrap();
    assert!(lock
        .try_acquire_exclusive_run("template-sweep", "c", Duration::from_secs(60))
        .await
        .unwrap()
        .is_none());

    b.release().await.unwrap();
    assert!(lock
        .try_acquire_exclusive_run("template-sweep", "c", Duration::from_secs(60))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_worker_generates_idempotently_with_exceptions() {
    let db = TestDatabase::new().await;
    let stores = Stores::new(&db);
    let template = stores.template().await;
    let from = template.anchor_at;
    let until = from + ChronoDuration::days(10);

    stores
        .templates
        .save_exception(&TaskException {
            template_id: template.id,
            occurs_at: from + ChronoDuration::days(2),
            kind: ExceptionKind::Skip,
        })
        .await
        .unwrap();

    let worker = stores.worker("w1");
    stores.coordinator.insert_job(NewGenerationJob::new(template.id, from, until)).await.unwrap();
    assert!(matches!(
        worker.process_next().await.unwrap(),
        ProcessOutcome::Completed { items_inserted: 9, .. }
    ));

    stores.coordinator.insert_job(NewGenerationJob::new(template.id, from, until)).await.unwrap();
    assert!(matches!(
        worker.process_next().await.unwrap(),
        ProcessOutcome::Completed { items_inserted: 0, .. }
    ));

    assert_eq!(stores.items.items_for(template.id).await.unwrap().len(), 9);
    let saved = stores.templates.get_template(template.id).await.unwrap().unwrap();
    assert_eq!(saved.generated_through, Some(until));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_stale_templates_and_cursor_only_moves_forward() {
    let db = TestDatabase::new().await;
    let stores = Stores::new(&db);
    let stale = stores.template().await;
    let mut fresh = daily_template(midnight());
    fresh.generated_through = Some(midnight() + ChronoDuration::days(20));
    stores.templates.save_template(&fresh).await.unwrap();

    let found = stores.templates.find_stale_templates(Utc::now(), 50).await.unwrap();
    let ids: Vec<_> = found.iter().map(|t| t.id).collect();
    assert!(ids.contains(&stale.id));
    assert!(!ids.contains(&fresh.id));

    let later = midnight() + ChronoDuration::days(30);
    stores.templates.set_generated_through(stale.id, later).await.unwrap();
    stores
        .templates
        .set_generated_through(stale.id, midnight() + ChronoDuration::days(5))
        .await
        .unwrap();
    let saved = stores.templates.get_template(stale.id).await.unwrap().unwrap();
    assert_eq!(saved.generated_through, Some(later));
}
