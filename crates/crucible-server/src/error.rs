use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use crucible::{SchedulerError, SubmissionError};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Error answered by a handler
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("malformed submission: {0}")]
    BadRequest(String),

    #[error("submission {0} not found")]
    NotFound(Uuid),

    #[error("submission {0} already finished")]
    AlreadyFinished(Uuid),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<SubmissionError> for ApiError {
    fn from(e: SubmissionError) -> Self {
        ApiError::Scheduler(SchedulerError::Submission(e))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Scheduler(e) => match e {
                SchedulerError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
                SchedulerError::UnsupportedLanguage(_) => StatusCode::BAD_REQUEST,
                SchedulerError::ShutDown | SchedulerError::Backend(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                SchedulerError::Submission(SubmissionError::Cancelled) => StatusCode::CONFLICT,
                SchedulerError::Submission(SubmissionError::WorkerLost) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AlreadyFinished(_) => StatusCode::CONFLICT,
        }
    }

    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Scheduler(e) => match e {
                SchedulerError::QueueFull(_) => "queue_full",
                SchedulerError::UnsupportedLanguage(_) => "unsupported_language",
                SchedulerError::ShutDown => "shut_down",
                SchedulerError::Backend(_) => "backend_unavailable",
                SchedulerError::Submission(SubmissionError::Cancelled) => "cancelled",
                SchedulerError::Submission(SubmissionError::WorkerLost) => "worker_lost",
            },
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::AlreadyFinished(_) => "already_finished",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }

        let body = Json(serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
            }
        }));
        if status == StatusCode::TOO_MANY_REQUESTS {
            return (status, [(header::RETRY_AFTER, "1")], body).into_response();
        }
        (status, body).into_response()
    }
}
