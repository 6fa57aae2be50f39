//! Isolation backends
//!
//! An execution unit is one isolated container, box or process group bound to
//! one workspace. The [`Isolation`] trait is the capability the controller
//! drives: create a unit, start a step in it, wait with a deadline, kill and
//! remove. Backends differ only in the technology underneath.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use crate::isolation::capture::{read_capped, read_file_capped};
pub use crate::isolation::docker::DockerIsolation;
pub use crate::isolation::isolate::{IsolateIsolation, prepare_cgroup, resolve_command};
pub use crate::isolation::process::ProcessIsolation;
use crate::config::{Backend, Config};
use crate::image::ImageHandle;
use crate::types::{CapturedOutput, LimitExceeded, MountConfig, ResourceLimits};

mod capture;
mod child;
mod docker;
pub mod isolate;
mod process;
#[cfg(test)]
pub(crate) mod scripted;

/// Errors raised by an isolation backend itself, never by the submitted code
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("isolation backend unavailable: {0}")]
    Unavailable(String),

    #[error("failed to create execution unit: {0}")]
    CreateFailed(String),

    #[error("failed to start step in unit {unit}: {message}")]
    StartFailed { unit: String, message: String },

    #[error("step failed inside unit {unit}: {message}")]
    StepFailed { unit: String, message: String },

    #[error("no step running in unit {0}")]
    NoRunningStep(String),

    #[error("failed to kill unit {unit}: {message}")]
    KillFailed { unit: String, message: String },

    #[error("failed to remove unit {unit}: {message}")]
    RemoveFailed { unit: String, message: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid step command: {0}")]
    InvalidCommand(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IsolationError {
    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, IsolationError::InvalidCommand(_))
    }
}

/// Everything a backend needs to create one execution unit
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub submission_id: Uuid,
    pub image: Arc<ImageHandle>,

    /// Host path of the staged workspace
    pub workspace: PathBuf,

    /// Limits applied to the unit as a whole
    pub limits: ResourceLimits,
}

/// Handle to a created execution unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitHandle {
    /// Backend-specific unit id, unique for the lifetime of the process
    pub id: String,
    pub submission_id: Uuid,

    /// Host path of the workspace mounted into the unit
    pub workspace: PathBuf,

    /// Working directory of steps, as seen from inside the unit
    pub workdir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Compile,
    Run,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Compile => "compile",
            StepKind::Run => "run",
        }
    }
}

/// One command executed inside a unit
#[derive(Debug, Clone)]
pub struct StepCommand {
    pub kind: StepKind,

    /// Program and arguments with placeholders already expanded
    pub argv: Vec<String>,
    pub env: HashMap<String, String>,

    /// PATH inside the unit
    pub path: String,

    /// Workspace file piped to stdin; stdin is empty when unset
    pub stdin: Option<String>,
    pub mounts: Vec<MountConfig>,
    pub limits: ResourceLimits,

    /// Byte cap for each of stdout and stderr
    pub capture_limit: usize,
}

impl StepCommand {
    pub fn program(&self) -> Result<&str, IsolationError> {
        self.argv
            .first()
            .map(String::as_str)
            .ok_or_else(|| IsolationError::InvalidCommand("empty argv".to_owned()))
    }
}

/// Raw exit report of one step
#[derive(Debug, Clone, Default)]
pub struct StepExit {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration: Duration,
    pub peak_memory_kb: Option<u64>,

    /// Limit the backend saw the step run into
    pub limit_exceeded: LimitExceeded,

    /// Backend diagnostic, e.g. isolate's meta message
    pub message: Option<String>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
}

impl StepExit {
    /// Exited on its own with status 0
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none() && !self.limit_exceeded.is_exceeded()
    }
}

#[derive(Debug, Clone)]
pub enum WaitStatus {
    Exited(StepExit),
    DeadlineExceeded,
}

/// Create/start/wait/kill/remove over one isolation technology
///
/// A unit runs at most one step at a time. `kill` and `remove` must be safe
/// to call on a unit with no running step, and `remove` must be idempotent.
#[async_trait]
pub trait Isolation: Send + Sync {
    fn name(&self) -> &str;

    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle, IsolationError>;

    async fn start(&self, unit: &UnitHandle, step: &StepCommand) -> Result<(), IsolationError>;

    /// Wait up to `timeout` for the running step to exit.
    ///
    /// A step that is still running at the deadline stays running; the caller
    /// decides whether to kill it.
    async fn wait(&self, unit: &UnitHandle, timeout: Duration)
    -> Result<WaitStatus, IsolationError>;

    async fn kill(&self, unit: &UnitHandle) -> Result<(), IsolationError>;

    async fn remove(&self, unit: &UnitHandle) -> Result<(), IsolationError>;

    /// Time added to a step deadline so limits enforced natively by the
    /// backend are reported before the controller's own deadline fires
    fn deadline_slack(&self, _limits: &ResourceLimits) -> Duration {
        Duration::ZERO
    }
}

/// Build the isolation backend selected in the config
pub fn from_config(config: &Config) -> Result<Arc<dyn Isolation>, IsolationError> {
    Ok(match config.backend {
        Backend::Docker => Arc::new(DockerIsolation::from_config(config)),
        Backend::Isolate => Arc::new(IsolateIsolation::from_config(config)?),
        Backend::Process => Arc::new(ProcessIsolation::new()),
    })
}
