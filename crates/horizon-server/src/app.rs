//! Wiring of the PostgreSQL stores into the coordinator, the worker pool
//! and the sweeper.

use horizon_config::AppConfig;
use horizon_jobs::postgres::{
    DatabasePool, PgCancellationNotifier, PgDeadLetterStore, PgExclusiveRunStore, PgItemStore, PgJobStore,
    PgTemplateStore,
};
use horizon_jobs::{
    DeadLetterManager, ExclusiveRunLock, GenerationServices, HorizonSweeper, IntervalTaskGenerator, JobCoordinator,
    JobsConfig, WorkerPool,
};
use horizon_rest::AppState;
use std::sync::Arc;
use uuid::Uuid;

/// Long-running components of one server process.
pub struct Components {
    pub state: AppState,
    pub workers: Arc<WorkerPool>,
    pub sweeper: Option<Arc<HorizonSweeper>>,
}

/// Identity used as sweep lease holder. Configured, or generated per process.
pub fn instance_id(config: &AppConfig) -> String {
    let configured = config.app.instance_id.trim();
    if configured.is_empty() {
        format!("{}-{}", config.app.name, Uuid::new_v4())
    } else {
        configured.to_string()
    }
}

pub fn build(pool: Arc<DatabasePool>, jobs: &JobsConfig, instance_id: &str) -> Components {
    let operation_timeout = jobs.worker.operation_timeout();

    let templates = Arc::new(PgTemplateStore::new(pool.clone()));
    let coordinator = JobCoordinator::new(
        Arc::new(PgJobStore::new(pool.clone())),
        Arc::new(PgCancellationNotifier::new(pool.clone(), jobs.notifier.channel.clone())),
    )
    .with_operation_timeout(operation_timeout);
    let dead_letters =
        DeadLetterManager::new(Arc::new(PgDeadLetterStore::new(pool.clone()))).with_operation_timeout(operation_timeout);

    let services = GenerationServices {
        coordinator: coordinator.clone(),
        dead_letters: dead_letters.clone(),
        templates: templates.clone(),
        exceptions: templates.clone(),
        items: Arc::new(PgItemStore::new(pool.clone())),
        generator: Arc::new(IntervalTaskGenerator),
    };
    let workers = Arc::new(WorkerPool::new(services, jobs.worker.clone(), jobs.retry.clone()));

    let sweeper = jobs.sweep.enabled.then(|| {
        let lock = ExclusiveRunLock::new(Arc::new(PgExclusiveRunStore::new(pool))).with_operation_timeout(operation_timeout);
        Arc::new(
            HorizonSweeper::new(
                instance_id,
                lock,
                coordinator.clone(),
                dead_letters.clone(),
                templates,
                jobs.sweep.clone(),
            )
                .with_operation_timeout(operation_timeout),
        )
    });

    Components {
        state: AppState::new(coordinator, dead_letters),
        workers,
        sweeper,
    }
}
