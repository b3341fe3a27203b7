//! Dead-letter review endpoints.

use crate::responses::{no_content, ok, ApiResult, AppError};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use horizon_core::{DeadLetterId, HorizonError, JobId};
use horizon_jobs::{DeadLetterJob, MAX_LIST_LIMIT};
use serde::{Deserialize, Serialize};

const DEFAULT_LIST_LIMIT: u32 = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_dead_letters))
        .route("/:id", get(get_dead_letter))
        .route("/:id/retry", post(retry_dead_letter))
        .route("/:id/discard", post(discard_dead_letter))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_LIST_LIMIT
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub reviewed_by: String,
}

#[derive(Debug, Deserialize)]
pub struct DiscardRequest {
    pub reviewed_by: String,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetryResponse {
    pub new_job_id: JobId,
}

fn require_reviewer(reviewed_by: &str) -> Result<&str, AppError> {
    let reviewer = reviewed_by.trim();
    if reviewer.is_empty() {
        return Err(HorizonError::validation("reviewed_by must not be empty").into());
    }
    Ok(reviewer)
}

/// Unresolved dead-letter records, newest failure first.
async fn list_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Vec<DeadLetterJob>> {
    let records = state
        .dead_letters
        .list_dead_letter_jobs(params.limit.min(MAX_LIST_LIMIT))
        .await?;
    ok(records)
}

async fn get_dead_letter(State(state): State<AppState>, Path(id): Path<DeadLetterId>) -> ApiResult<DeadLetterJob> {
    match state.dead_letters.get_dead_letter_job(id).await? {
        Some(record) => ok(record),
        None => Err(HorizonError::not_found("dead_letter_job", id).into()),
    }
}

async fn retry_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<DeadLetterId>,
    Json(request): Json<RetryRequest>,
) -> ApiResult<RetryResponse> {
    let reviewer = require_reviewer(&request.reviewed_by)?;
    let new_job_id = state.dead_letters.retry_dead_letter_job(id, reviewer).await?;
    ok(RetryResponse { new_job_id })
}

async fn discard_dead_letter(
    State(state): State<AppState>,
    Path(id): Path<DeadLetterId>,
    Json(request): Json<DiscardRequest>,
) -> Result<StatusCode, AppError> {
    let reviewer = require_reviewer(&request.reviewed_by)?;
    state
        .dead_letters
        .discard_dead_letter_job(id, reviewer, &request.note)
        .await?;
    Ok(no_content())
}
