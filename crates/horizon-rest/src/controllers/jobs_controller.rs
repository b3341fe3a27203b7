//! Generation job lookup and cancellation.

use crate::responses::{no_content, ok, ApiResult, AppError};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Router,
};
use horizon_core::{HorizonError, JobId};
use horizon_jobs::{CancelOutcome, GenerationJob};
use tracing::{debug, info};

pub fn router() -> Router<AppState> {
    Router::new().route("/:id", get(get_job).delete(cancel_job))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<JobId>) -> ApiResult<GenerationJob> {
    match state.coordinator.get_job(id).await? {
        Some(job) => ok(job),
        None => Err(HorizonError::not_found("generation_job", id).into()),
    }
}

/// Cancels a pending or running job. Cancelling a finished job changes
/// nothing and still succeeds.
async fn cancel_job(State(state): State<AppState>, Path(id): Path<JobId>) -> Result<StatusCode, AppError> {
    match state.coordinator.cancel_job(id).await? {
        CancelOutcome::Cancelled => info!(job_id = %id, "Job cancelled via admin API"),
        CancelOutcome::AlreadyTerminal(status) => debug!(job_id = %id, %status, "Cancel ignored for finished job"),
    }
    Ok(no_content())
}
