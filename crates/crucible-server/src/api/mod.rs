//! API routes

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod health;
mod submissions;

/// Build the API router over `state`
pub fn router(state: AppState) -> Router {
    let server = state.scheduler.config().server.clone();

    let router = Router::new()
        .route("/run", post(submissions::run))
        .route("/submissions", post(submissions::submit))
        .route("/submissions/{id}", get(submissions::status))
        .route("/submissions/{id}/cancel", post(submissions::cancel))
        .route("/healthz", get(health::healthz))
        .layer(DefaultBodyLimit::max(server.max_body))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    if server.cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}
