//! Execution unit controller
//!
//! Runs one submission inside one freshly created execution unit: the compile
//! step if the language has one, then the run step with stdin piped from the
//! workspace fixture. Every step is deadline-bound, and the unit is torn down
//! on every path out of [`ExecutionController::run`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use crate::controller::reaper::{ReapTarget, Reaper};
use crate::classify::{Signals, StepReport, classify};
use crate::config::{Config, Language};
use crate::image::ImageHandle;
use crate::isolation::{
    Isolation, IsolationError, StepCommand, StepKind, UnitHandle, UnitSpec, WaitStatus,
};
use crate::types::{ExecutionResult, ResourceLimits};
use crate::workspace::{STDIN_FIXTURE, Workspace};

mod reaper;

/// Deadline for steps that set neither a wall nor a CPU time limit
const DEFAULT_STEP_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("submission cancelled")]
    Cancelled,

    #[error(transparent)]
    Isolation(#[from] IsolationError),
}

impl ControllerError {
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Cancelled => false,
            ControllerError::Isolation(e) => e.is_transient(),
        }
    }
}

/// One submission's worth of work for the controller
#[derive(Debug)]
pub struct RunRequest<'a> {
    pub submission_id: Uuid,
    pub image: Arc<ImageHandle>,
    pub workspace: &'a Workspace,
    pub language: &'a Language,

    /// Limits for the compile step; `None` skips compilation
    pub compile_limits: Option<ResourceLimits>,
    pub run_limits: ResourceLimits,
    pub cancel: &'a CancellationToken,
}

/// Drives an [`Isolation`] backend through one submission at a time
#[derive(Clone)]
pub struct ExecutionController {
    isolation: Arc<dyn Isolation>,
    reaper: Reaper,

    /// How long a killed step may take to exit
    kill_grace: Duration,
    capture_limit: usize,
}

impl ExecutionController {
    pub fn new(
        isolation: Arc<dyn Isolation>,
        reaper: Reaper,
        kill_grace: Duration,
        capture_limit: usize,
    ) -> Self {
        Self {
            isolation,
            reaper,
            kill_grace,
            capture_limit,
        }
    }

    pub fn from_config(config: &Config, isolation: Arc<dyn Isolation>, reaper: Reaper) -> Self {
        Self::new(isolation, reaper, config.kill_grace(), config.capture_limit)
    }

    pub fn isolation(&self) -> &Arc<dyn Isolation> {
        &self.isolation
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    /// Run a submission to completion in a new execution unit.
    ///
    /// Errors are failures of the controller or backend, never of the
    /// submitted code; those are reported through the result's outcome.
    #[instrument(skip_all, fields(submission_id = %request.submission_id, backend = self.isolation.name()))]
    pub async fn run(&self, request: RunRequest<'_>) -> Result<ExecutionResult, ControllerError> {
        let spec = UnitSpec {
            submission_id: request.submission_id,
            image: request.image.clone(),
            workspace: request.workspace.path().to_owned(),
            limits: request.run_limits.clone(),
        };
        let unit = self.isolation.create(&spec).await?;
        debug!(unit = %unit.id, "unit created");

        let guard = UnitGuard {
            unit,
            reaper: &self.reaper,
            armed: true,
        };
        let result = self.run_steps(&guard.unit, &request).await;
        self.teardown(guard).await;
        result
    }

    async fn run_steps(
        &self,
        unit: &UnitHandle,
        request: &RunRequest<'_>,
    ) -> Result<ExecutionResult, ControllerError> {
        let language = request.language;
        let mut signals = Signals::default();

        if let (Some(compile), Some(argv), Some(limits)) = (
            language.compile.as_ref(),
            language.compile_argv(),
            request.compile_limits.as_ref(),
        ) {
            let step = StepCommand {
                kind: StepKind::Compile,
                argv,
                env: compile.env.clone(),
                path: language.run.path.clone(),
                stdin: None,
                mounts: language.run.mounts.clone(),
                limits: limits.clone(),
                capture_limit: self.capture_limit,
            };
            let report = self.step(unit, &step, request.cancel).await?;
            let compiled = report.exit.succeeded() && !report.deadline_exceeded;
            signals.compile = Some(report);
            if !compiled {
                debug!("compilation failed, run step skipped");
                return Ok(classify(signals));
            }
        }

        let step = StepCommand {
            kind: StepKind::Run,
            argv: language.run_argv(),
            env: language.run.env.clone(),
            path: language.run.path.clone(),
            stdin: Some(STDIN_FIXTURE.to_owned()),
            mounts: language.run.mounts.clone(),
            limits: request.run_limits.clone(),
            capture_limit: self.capture_limit,
        };
        signals.run = Some(self.step(unit, &step, request.cancel).await?);
        Ok(classify(signals))
    }

    #[instrument(skip_all, fields(unit = %unit.id, step = step.kind.as_str()))]
    async fn step(
        &self,
        unit: &UnitHandle,
        step: &StepCommand,
        cancel: &CancellationToken,
    ) -> Result<StepReport, ControllerError> {
        if cancel.is_cancelled() {
            return Err(ControllerError::Cancelled);
        }

        let deadline = step_deadline(&step.limits) + self.isolation.deadline_slack(&step.limits);
        debug!(argv = ?step.argv, ?deadline, "starting step");
        let started = Instant::now();
        self.isolation.start(unit, step).await?;

        let status = tokio::select! {
            status = self.isolation.wait(unit, deadline) => status?,
            () = cancel.cancelled() => {
                info!("cancelled, terminating unit");
                self.kill(unit).await;
                return Err(ControllerError::Cancelled);
            }
        };

        match status {
            WaitStatus::Exited(exit) => {
                debug!(
                    exit_code = ?exit.exit_code,
                    signal = ?exit.signal,
                    limit = ?exit.limit_exceeded,
                    duration = ?exit.duration,
                    "step finished"
                );
                Ok(StepReport::exited(exit))
            }
            WaitStatus::DeadlineExceeded => {
                warn!(?deadline, "deadline exceeded, killing unit");
                self.kill(unit).await;
                Ok(self.collect_killed(unit, started).await)
            }
        }
    }

    /// Collect whatever a killed step left behind within the kill grace
    async fn collect_killed(&self, unit: &UnitHandle, started: Instant) -> StepReport {
        match self.isolation.wait(unit, self.kill_grace).await {
            Ok(WaitStatus::Exited(exit)) => StepReport {
                exit,
                deadline_exceeded: true,
            },
            Ok(WaitStatus::DeadlineExceeded) => {
                warn!(grace = ?self.kill_grace, "step still running after kill");
                StepReport::deadline(started.elapsed())
            }
            Err(e) => {
                warn!(error = %e, "collecting killed step failed");
                StepReport::deadline(started.elapsed())
            }
        }
    }

    async fn kill(&self, unit: &UnitHandle) {
        if let Err(e) = self.isolation.kill(unit).await {
            // remove() force-stops the unit as well
            warn!(unit = %unit.id, error = %e, "kill failed");
        }
    }

    async fn teardown(&self, mut guard: UnitGuard<'_>) {
        match self.isolation.remove(&guard.unit).await {
            Ok(()) => {
                debug!(unit = %guard.unit.id, "unit removed");
                guard.armed = false;
            }
            Err(e) => {
                warn!(unit = %guard.unit.id, error = %e, "teardown failed, handing unit to reaper");
            }
        }
    }
}

/// Hands the unit to the reaper unless teardown completed
struct UnitGuard<'a> {
    unit: UnitHandle,
    reaper: &'a Reaper,
    armed: bool,
}

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.reaper.reap(ReapTarget::Unit(self.unit.clone()));
        }
    }
}

/// Wall time limit, falling back to the CPU time limit
fn step_deadline(limits: &ResourceLimits) -> Duration {
    limits
        .wall_time_limit
        .or(limits.time_limit)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(DEFAULT_STEP_DEADLINE)
}
