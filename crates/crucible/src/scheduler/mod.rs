//! Scheduler and worker pool
//!
//! Submissions wait in a bounded FIFO queue until one of a fixed number of
//! workers is free. Each worker drives one submission at a time through the
//! staging, image, run and release pipeline, inside its own task so that a
//! panic is contained to that submission.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::config::{Backend, Config};
use crate::controller::{ExecutionController, Reaper};
use crate::image::{self, ImageBuilder, ImageProvider};
use crate::isolation::{self, Isolation, IsolationError};
use crate::scheduler::queue::{JobQueue, PushError};
use crate::scheduler::worker::Pipeline;
pub use crate::scheduler::worker::PipelineError;
use crate::submission::Submission;
use crate::types::ExecutionResult;
use crate::workspace::WorkspaceStager;

mod queue;
mod worker;

/// Submission rejected before it was queued
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("queue is full ({0} submissions pending)")]
    QueueFull(usize),

    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("scheduler is shut down")]
    ShutDown,

    #[error("isolation backend unavailable: {0}")]
    Backend(#[from] IsolationError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

/// Queued submission that ended without a result
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("submission cancelled")]
    Cancelled,

    #[error("worker dropped the submission")]
    WorkerLost,
}

type Reply = oneshot::Sender<Result<ExecutionResult, SubmissionError>>;

struct Job {
    submission: Submission,
    cancel: CancellationToken,
    reply: Reply,
}

struct Shared {
    queue: JobQueue<Job>,
    pipeline: Pipeline,

    /// Cancellation tokens of every accepted submission without a result yet
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Shared {
    fn finish(&self, id: &Uuid) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }
}

/// Pending result of a submission
#[derive(Debug)]
pub struct SubmissionHandle {
    id: Uuid,
    rx: oneshot::Receiver<Result<ExecutionResult, SubmissionError>>,
}

impl SubmissionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for SubmissionHandle {
    type Output = Result<ExecutionResult, SubmissionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|reply| reply.unwrap_or(Err(SubmissionError::WorkerLost)))
    }
}

/// Bounded queue plus fixed worker pool
pub struct Scheduler {
    config: Arc<Config>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Start `config.workers` workers over the given backend.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: Config,
        isolation: Arc<dyn Isolation>,
        builder: Arc<dyn ImageBuilder>,
    ) -> Self {
        let config = Arc::new(config);
        let (reaper, _reaper_task) = Reaper::spawn(isolation.clone(), config.retry.clone());

        let pipeline = Pipeline {
            stager: WorkspaceStager::new(
                &config.workspace_root,
                config.backend != Backend::Process,
            ),
            images: Arc::new(ImageProvider::new(&config, builder)),
            controller: ExecutionController::from_config(&config, isolation, reaper),
            config: config.clone(),
        };
        let shared = Arc::new(Shared {
            queue: JobQueue::new(config.queue_capacity),
            pipeline,
            active: Mutex::new(HashMap::new()),
        });

        let workers = (0..config.workers)
            .map(|index| tokio::spawn(worker_loop(index, shared.clone())))
            .collect();
        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            backend = shared.pipeline.controller.isolation().name(),
            "scheduler started"
        );

        Self {
            config,
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Build the isolation backend and image builder the config selects
    pub fn from_config(config: Config) -> Result<Self, SchedulerError> {
        let isolation = isolation::from_config(&config)?;
        let builder = image::builder_for(&config);
        Ok(Self::new(config, isolation, builder))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn images(&self) -> &Arc<ImageProvider> {
        &self.shared.pipeline.images
    }

    /// Submissions waiting for a worker
    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Queue a submission. Never waits: a full queue is rejected right away.
    #[instrument(skip_all, fields(submission_id = %submission.id, language = %submission.language))]
    pub fn submit(&self, submission: Submission) -> Result<SubmissionHandle, SchedulerError> {
        if !self.config.languages.contains_key(&submission.language) {
            return Err(SchedulerError::UnsupportedLanguage(submission.language));
        }

        let id = submission.id;
        let cancel = CancellationToken::new();
        let (reply, rx) = oneshot::channel();
        self.shared
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, cancel.clone());

        let job = Job {
            submission,
            cancel,
            reply,
        };
        match self.shared.queue.push(job) {
            Ok(()) => {
                info!("submission accepted");
                Ok(SubmissionHandle { id, rx })
            }
            Err(rejected) => {
                self.shared.finish(&id);
                Err(match rejected {
                    PushError::Full(_) => SchedulerError::QueueFull(self.config.queue_capacity),
                    PushError::Closed(_) => SchedulerError::ShutDown,
                })
            }
        }
    }

    /// Submit and wait for the result
    pub async fn run(&self, submission: Submission) -> Result<ExecutionResult, SchedulerError> {
        Ok(self.submit(submission)?.await?)
    }

    /// Cancel a submission.
    ///
    /// A queued submission is dropped from the queue; a running one is
    /// killed. Either way its handle resolves to
    /// [`SubmissionError::Cancelled`]. Returns false if the id is unknown or
    /// already finished.
    pub fn cancel(&self, id: Uuid) -> bool {
        if let Some(job) = self.shared.queue.remove(|job| job.submission.id == id) {
            self.shared.finish(&id);
            let _ = job.reply.send(Err(SubmissionError::Cancelled));
            info!(submission_id = %id, "queued submission cancelled");
            return true;
        }

        let active = self
            .shared
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match active.get(&id) {
            Some(token) => {
                token.cancel();
                info!(submission_id = %id, "running submission cancelled");
                true
            }
            None => false,
        }
    }

    /// Stop accepting submissions, finish the queued ones and wait for the
    /// workers to exit
    pub async fn shutdown(&self) {
        self.shared.queue.close();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker exited abnormally");
            }
        }
        info!("scheduler shut down");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Workers drain the queue and exit on their own.
        self.shared.queue.close();
    }
}

async fn worker_loop(index: usize, shared: Arc<Shared>) {
    debug!(worker = index, "worker started");
    while let Some(job) = shared.queue.next().await {
        let Job {
            submission,
            cancel,
            reply,
        } = job;
        let id = submission.id;

        let pipeline = shared.pipeline.clone();
        let task = tokio::spawn(async move { pipeline.execute(&submission, &cancel).await });
        let result = match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(worker = index, submission_id = %id, error = %e, "submission task failed");
                Ok(ExecutionResult::infrastructure(format!(
                    "worker task failed: {e}"
                )))
            }
        };
        shared.finish(&id);

        match result {
            Ok(ref result) => info!(
                worker = index,
                submission_id = %id,
                outcome = %result.outcome,
                duration = ?result.duration,
                "submission finished"
            ),
            Err(ref e) => info!(worker = index, submission_id = %id, error = %e, "submission ended"),
        }
        if reply.send(result).is_err() {
            debug!(submission_id = %id, "caller went away before the result");
        }
    }
    debug!(worker = index, "worker stopped");
}
