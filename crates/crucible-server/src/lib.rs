//! HTTP submission API for crucible
//!
//! Routes:
//!
//! - `POST /run`: run a submission and answer with its result
//! - `POST /submissions`: queue a submission and answer with its id
//! - `GET /submissions/{id}`: state of a queued submission, with the result once finished
//! - `POST /submissions/{id}/cancel`: cancel a queued or running submission
//! - `GET /healthz`: liveness and queue depth
//!
//! Submissions are `{language, source, stdin?, limits?}` JSON objects. Results
//! use the same camelCase payload as the CLI.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use crucible::Scheduler;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

pub use crate::api::router;
pub use crate::error::ApiError;
pub use crate::state::{AppState, ResultStore, SubmissionStatus};

mod api;
mod error;
mod state;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address '{0}'")]
    Address(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Serve the API on `scheduler.config().server.bind` until `shutdown` resolves
pub async fn serve(
    scheduler: Arc<Scheduler>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let bind = scheduler.config().server.bind.clone();
    let addr: SocketAddr = bind.parse().map_err(|_| ServerError::Address(bind))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "submission API listening");

    axum::serve(listener, router(AppState::new(scheduler)))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)?;

    info!("submission API stopped");
    Ok(())
}
