//! Background teardown
//!
//! Units and workspaces whose teardown failed on the request path are handed
//! to the reaper, which retries with backoff off the request path.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::isolation::{Isolation, UnitHandle};
use crate::retry::RetryConfig;

#[derive(Debug, Clone)]
pub enum ReapTarget {
    Unit(UnitHandle),
    Workspace(PathBuf),
}

impl ReapTarget {
    fn describe(&self) -> String {
        match self {
            ReapTarget::Unit(unit) => format!("unit {}", unit.id),
            ReapTarget::Workspace(path) => format!("workspace {}", path.display()),
        }
    }
}

/// Handle for queueing teardown work
#[derive(Debug, Clone)]
pub struct Reaper {
    tx: mpsc::UnboundedSender<ReapTarget>,
    pending: Arc<AtomicUsize>,
}

impl Reaper {
    /// Start the reaper task. It runs until every handle is dropped and the
    /// queued work is done.
    pub fn spawn(isolation: Arc<dyn Isolation>, retry: RetryConfig) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<ReapTarget>();
        let pending = Arc::new(AtomicUsize::new(0));

        let counter = pending.clone();
        let task = tokio::spawn(async move {
            let mut running = tokio::task::JoinSet::new();
            while let Some(target) = rx.recv().await {
                let isolation = isolation.clone();
                let retry = retry.clone();
                let counter = counter.clone();
                running.spawn(async move {
                    reap(isolation.as_ref(), &retry, &target).await;
                    counter.fetch_sub(1, Ordering::SeqCst);
                });
            }
            while running.join_next().await.is_some() {}
        });

        (Self { tx, pending }, task)
    }

    /// Queue `target` for teardown
    pub fn reap(&self, target: ReapTarget) {
        debug!(target = %target.describe(), "handing to reaper");
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(target)) = self.tx.send(target) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!(target = %target.describe(), "reaper is gone, resource leaked");
        }
    }

    /// Targets queued or being retried
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

async fn reap(isolation: &dyn Isolation, retry: &RetryConfig, target: &ReapTarget) {
    let attempts = retry.reaper_attempts.max(1);
    for attempt in 0..attempts {
        let result = match target {
            ReapTarget::Unit(unit) => isolation.remove(unit).await.map_err(|e| e.to_string()),
            ReapTarget::Workspace(path) => match tokio::fs::remove_dir_all(path).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.to_string()),
                _ => Ok(()),
            },
        };
        match result {
            Ok(()) => {
                debug!(target = %target.describe(), attempt, "reaped");
                return;
            }
            Err(e) => {
                warn!(target = %target.describe(), attempt, error = %e, "teardown retry failed");
                tokio::time::sleep(retry.delay(attempt)).await;
            }
        }
    }
    error!(target = %target.describe(), attempts, "giving up on teardown, resource leaked");
}
