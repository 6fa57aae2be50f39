//! Submission endpoints

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use crucible::{ResultPayload, Scheduler, Submission, SubmissionRequest};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::{AppState, SubmissionStatus};

#[derive(Debug, Serialize)]
pub struct SubmissionView {
    pub id: Uuid,
    #[serde(flatten)]
    pub status: SubmissionStatus,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub id: Uuid,
    pub cancelled: bool,
}

/// POST /run
pub async fn run(
    State(state): State<AppState>,
    payload: Result<Json<SubmissionRequest>, JsonRejection>,
) -> Result<Json<ResultPayload>, ApiError> {
    let Json(request) = payload?;
    let handle = state.scheduler.submit(Submission::from(request))?;

    let mut guard = CancelOnDrop {
        scheduler: state.scheduler.as_ref(),
        id: handle.id(),
        armed: true,
    };
    let result = handle.await;
    guard.armed = false;

    Ok(Json(result?.to_payload()))
}

/// POST /submissions
pub async fn submit(
    State(state): State<AppState>,
    payload: Result<Json<SubmissionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmissionView>), ApiError> {
    let Json(request) = payload?;
    let handle = state.scheduler.submit(Submission::from(request))?;
    let id = handle.id();
    state.results.track(handle);

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmissionView {
            id,
            status: SubmissionStatus::Pending,
        }),
    ))
}

/// GET /submissions/{id}
pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SubmissionView>, ApiError> {
    let status = state.results.get(&id).ok_or(ApiError::NotFound(id))?;
    Ok(Json(SubmissionView { id, status }))
}

/// POST /submissions/{id}/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    if state.scheduler.cancel(id) {
        return Ok((
            StatusCode::ACCEPTED,
            Json(CancelResponse {
                id,
                cancelled: true,
            }),
        ));
    }
    match state.results.get(&id) {
        Some(_) => Err(ApiError::AlreadyFinished(id)),
        None => Err(ApiError::NotFound(id)),
    }
}

/// Cancels a synchronous run whose client hung up
struct CancelOnDrop<'a> {
    scheduler: &'a Scheduler,
    id: Uuid,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed && self.scheduler.cancel(self.id) {
            info!(submission_id = %self.id, "client went away, submission cancelled");
        }
    }
}
