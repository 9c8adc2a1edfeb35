//! Job handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use validator::Validate;

use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::manager::BulkOutcome;
use crate::models::{BulkSubmitRequest, JobDetail, JobSummary, SubmitRequest};

/// Per-URL outcome inside a bulk submission response
#[derive(Debug, Serialize)]
pub struct BulkItemResponse {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobSummary>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response for a bulk submission
#[derive(Debug, Serialize)]
pub struct BulkSubmitResponse {
    pub results: Vec<BulkItemResponse>,
    pub admitted: usize,
    pub duplicates: usize,
}

/// Submit a single download
pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> AppResult<(StatusCode, Json<JobSummary>)> {
    request.validate()?;
    let url = request.url.trim();
    if url.is_empty() {
        return Err(AppError::Validation("url is required".to_string()));
    }

    let job = state.manager.submit(url)?;
    Ok((StatusCode::CREATED, Json(job.summary())))
}

/// Submit a batch of downloads, returning a per-URL outcome for each
pub async fn submit_bulk(
    State(state): State<AppState>,
    Json(request): Json<BulkSubmitRequest>,
) -> AppResult<Json<BulkSubmitResponse>> {
    request.validate()?;

    let results = state.manager.submit_bulk(&request.urls);

    let mut admitted = 0;
    let mut duplicates = 0;
    let results = results
        .into_iter()
        .map(|result| match result.outcome {
            BulkOutcome::Admitted(job) => {
                admitted += 1;
                BulkItemResponse {
                    url: result.url,
                    job: Some(job.summary()),
                    duplicate: false,
                    error: None,
                }
            }
            BulkOutcome::Duplicate => {
                duplicates += 1;
                BulkItemResponse {
                    url: result.url,
                    job: None,
                    duplicate: true,
                    error: None,
                }
            }
            BulkOutcome::Rejected(error) => BulkItemResponse {
                url: result.url,
                job: None,
                duplicate: false,
                error: Some(error),
            },
        })
        .collect();

    Ok(Json(BulkSubmitResponse {
        results,
        admitted,
        duplicates,
    }))
}

/// List all jobs, newest first
pub async fn list(State(state): State<AppState>) -> Json<Vec<JobSummary>> {
    let summaries = state
        .manager
        .list()
        .iter()
        .map(|job| job.summary())
        .collect();
    Json(summaries)
}

/// Full job detail including the output history
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<JobDetail>> {
    let job = state
        .manager
        .get(&id)
        .ok_or_else(|| AppError::NotFound("job not found".to_string()))?;
    Ok(Json(job.detail()))
}

/// Reset a failed job and run it again
pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<JobSummary>> {
    let job = state.manager.retry(&id)?;
    Ok(Json(job.summary()))
}

/// Delete a single job, cancelling it if running
pub async fn delete(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<StatusCode> {
    state.manager.delete(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Delete every job, cancelling any that are running
pub async fn delete_all(State(state): State<AppState>) -> StatusCode {
    state.manager.delete_all();
    StatusCode::NO_CONTENT
}
