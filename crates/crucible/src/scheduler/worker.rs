//! Per-submission pipeline run by the workers
//!
//! stage → resolve image → run → release workspace, with bounded retries for
//! infrastructure failures.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

use crate::config::{Config, Language};
use crate::controller::{ControllerError, ExecutionController, ReapTarget, RunRequest};
use crate::image::{ImageError, ImageProvider};
use crate::retry::RetryConfig;
use crate::scheduler::SubmissionError;
use crate::submission::Submission;
use crate::types::ExecutionResult;
use crate::workspace::{StagingError, WorkspaceStager};

/// Failure of one pipeline attempt
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Controller(#[from] ControllerError),
}

impl PipelineError {
    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Image(ImageError::UnsupportedLanguage(_)) => false,
            PipelineError::Image(ImageError::BuildFailure { .. }) => true,
            PipelineError::Staging(_) => true,
            PipelineError::Controller(e) => e.is_transient(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct Pipeline {
    pub config: Arc<Config>,
    pub stager: WorkspaceStager,
    pub images: Arc<ImageProvider>,
    pub controller: ExecutionController,
}

impl Pipeline {
    fn retry(&self) -> &RetryConfig {
        &self.config.retry
    }

    /// Run `submission` to a terminal result.
    ///
    /// Infrastructure failures that outlast the retry budget become an
    /// infrastructure-error result; only cancellation is an `Err`.
    #[instrument(skip_all, fields(submission_id = %submission.id, language = %submission.language))]
    pub async fn execute(
        &self,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SubmissionError> {
        let language = match self.config.get_language(&submission.language) {
            Ok(language) => language,
            Err(e) => return Ok(ExecutionResult::infrastructure(e.to_string())),
        };

        let mut attempt = 0;
        loop {
            match self.attempt(submission, language, cancel).await {
                Ok(result) => return Ok(result),
                Err(PipelineError::Controller(ControllerError::Cancelled)) => {
                    return Err(SubmissionError::Cancelled);
                }
                Err(e) if e.is_transient() && attempt < self.retry().max_retries => {
                    let delay = self.retry().delay(attempt);
                    warn!(attempt, error = %e, ?delay, "infrastructure failure, retrying");
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = cancel.cancelled() => return Err(SubmissionError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempts = attempt + 1, error = %e, "infrastructure failure");
                    return Ok(ExecutionResult::infrastructure(e.to_string()));
                }
            }
        }
    }

    async fn attempt(
        &self,
        submission: &Submission,
        language: &Language,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, PipelineError> {
        if cancel.is_cancelled() {
            return Err(ControllerError::Cancelled.into());
        }

        let mut workspace = self.stager.stage(submission, language).await?;

        let result = async {
            let image = tokio::select! {
                image = self.images.resolve(&submission.language) => image?,
                () = cancel.cancelled() => return Err(ControllerError::Cancelled.into()),
            };
            let request = RunRequest {
                submission_id: submission.id,
                image,
                workspace: &workspace,
                language,
                compile_limits: self.config.compile_limits(language),
                run_limits: self.config.run_limits(language, submission.limits.as_ref()),
                cancel,
            };
            Ok::<_, PipelineError>(self.controller.run(request).await?)
        }
        .await;

        if let Err(e) = workspace.release().await {
            warn!(error = %e, "workspace release failed, handing to reaper");
            self.controller
                .reaper()
                .reap(ReapTarget::Workspace(workspace.disown()));
        }
        result
    }
}
