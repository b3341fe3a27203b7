//! Application state for Axum handlers.

use horizon_jobs::{DeadLetterManager, JobCoordinator};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: JobCoordinator,
    pub dead_letters: DeadLetterManager,
}

impl AppState {
    pub fn new(coordinator: JobCoordinator, dead_letters: DeadLetterManager) -> Self {
        Self {
            coordinator,
            dead_letters,
        }
    }
}
