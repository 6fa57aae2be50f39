//! Shared handler state

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use crucible::{ResultPayload, Scheduler, SubmissionError, SubmissionHandle};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub results: Arc<ResultStore>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        let retained = scheduler.config().server.retained_results;
        Self {
            scheduler,
            results: Arc::new(ResultStore::new(retained)),
        }
    }
}

/// Where an asynchronously submitted run stands
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionStatus {
    /// Queued or running
    Pending,
    Finished { result: ResultPayload },
    Cancelled,
    Failed { error: String },
}

#[derive(Default)]
struct Entries {
    status: HashMap<Uuid, SubmissionStatus>,

    /// Settled ids, oldest first
    settled: VecDeque<Uuid>,
}

/// Status of every asynchronous submission, keeping at most `retained`
/// settled ones
pub struct ResultStore {
    entries: Mutex<Entries>,
    retained: usize,
}

impl ResultStore {
    pub fn new(retained: usize) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            retained,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<SubmissionStatus> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
            .get(id)
            .cloned()
    }

    /// Track `handle` until it resolves
    pub fn track(self: &Arc<Self>, handle: SubmissionHandle) {
        let id = handle.id();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .status
            .insert(id, SubmissionStatus::Pending);

        let store = self.clone();
        tokio::spawn(async move {
            let status = match handle.await {
                Ok(result) => SubmissionStatus::Finished {
                    result: result.to_payload(),
                },
                Err(SubmissionError::Cancelled) => SubmissionStatus::Cancelled,
                Err(e) => SubmissionStatus::Failed {
                    error: e.to_string(),
                },
            };
            store.settle(id, status);
        });
    }

    fn settle(&self, id: Uuid, status: SubmissionStatus) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.status.insert(id, status);
        entries.settled.push_back(id);
        while entries.settled.len() > self.retained {
            if let Some(old) = entries.settled.pop_front() {
                entries.status.remove(&old);
                debug!(submission_id = %old, "dropped retained result");
            }
        }
    }
}
