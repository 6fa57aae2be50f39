use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

/// GET /healthz
pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let config = state.scheduler.config();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        backend: config.backend.as_str(),
        workers: config.workers,
        queued: state.scheduler.queue_len(),
        queue_capacity: config.queue_capacity,
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub backend: &'static str,
    pub workers: usize,
    pub queued: usize,
    pub queue_capacity: usize,
}
