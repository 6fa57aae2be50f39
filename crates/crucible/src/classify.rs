//! Result classification
//!
//! Turns what the controller observed for the compile and run steps into one
//! [`Outcome`]. When several outcomes are signalled at once the one with the
//! highest [`Outcome::precedence`] wins, so an infrastructure fault is never
//! reported as a defect in the submitted code.

use std::time::Duration;

use crate::isolation::StepExit;
use crate::types::{CapturedOutput, ExecutionResult, LimitExceeded, Outcome};

/// How one step ended, as seen by the controller
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub exit: StepExit,

    /// The controller's deadline fired and it killed the unit
    pub deadline_exceeded: bool,
}

impl StepReport {
    pub fn exited(exit: StepExit) -> Self {
        Self {
            exit,
            deadline_exceeded: false,
        }
    }

    /// Report for a step that was killed after `duration`
    pub fn deadline(duration: Duration) -> Self {
        Self {
            exit: StepExit {
                duration,
                ..Default::default()
            },
            deadline_exceeded: true,
        }
    }

    /// Outcome of this step on its own. A failed compile step is a
    /// compile error, a failed run step a runtime error.
    fn outcome(&self, failure: Outcome) -> Outcome {
        if self.deadline_exceeded {
            return Outcome::Timeout;
        }
        match self.exit.limit_exceeded {
            LimitExceeded::Time | LimitExceeded::WallTime => Outcome::Timeout,
            LimitExceeded::Memory | LimitExceeded::Output => Outcome::ResourceLimitExceeded,
            LimitExceeded::NotExceeded if self.exit.succeeded() => Outcome::Success,
            LimitExceeded::NotExceeded => failure,
        }
    }
}

/// Everything observed for one submission
#[derive(Debug, Clone, Default)]
pub struct Signals {
    /// Set when the controller or backend itself failed
    pub infrastructure: Option<String>,
    pub compile: Option<StepReport>,
    pub run: Option<StepReport>,
}

/// Classify `signals` into an [`ExecutionResult`]
pub fn classify(signals: Signals) -> ExecutionResult {
    let Signals {
        infrastructure,
        compile,
        run,
    } = signals;

    let outcome = [
        infrastructure
            .as_ref()
            .map(|_| Outcome::InfrastructureError),
        compile
            .as_ref()
            .map(|step| step.outcome(Outcome::CompileError)),
        run.as_ref().map(|step| step.outcome(Outcome::RuntimeError)),
    ]
    .into_iter()
    .flatten()
    .max_by_key(|outcome| outcome.precedence())
    .unwrap_or(Outcome::InfrastructureError);

    let compile_output = compile.as_ref().map(|step| combined(&step.exit));

    // Report the last step that ran.
    let Some(last) = run.or(compile) else {
        return ExecutionResult {
            outcome,
            message: Some(infrastructure.unwrap_or_else(|| "no step was run".to_owned())),
            compile_output,
            ..Default::default()
        };
    };

    let exit = last.exit;
    ExecutionResult {
        outcome,
        exit_code: exit.exit_code,
        signal: exit.signal,
        duration: exit.duration,
        peak_memory_kb: exit.peak_memory_kb,
        stdout: exit.stdout,
        stderr: exit.stderr,
        compile_output,
        message: infrastructure.or(exit.message),
    }
}

/// Compiler stdout followed by stderr
fn combined(exit: &StepExit) -> CapturedOutput {
    let mut bytes = exit.stdout.bytes.clone();
    bytes.extend_from_slice(&exit.stderr.bytes);
    CapturedOutput {
        bytes,
        truncated: exit.stdout.truncated || exit.stderr.truncated,
    }
}
