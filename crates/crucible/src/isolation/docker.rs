//! Docker backend
//!
//! One container per execution unit, driven through the docker CLI. The
//! container runs a keep-alive process; steps are `docker exec`ed into it so
//! the compile and run steps share the workspace mount and nothing else.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Output;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::isolation::child::{Finished, StepTable};
use crate::isolation::{
    Isolation, IsolationError, StepCommand, StepExit, UnitHandle, UnitSpec, WaitStatus,
};
use crate::types::{LimitExceeded, ResourceLimits};

/// Upper bound for a single docker CLI call other than a step
const CLI_TIMEOUT: Duration = Duration::from_secs(60);

/// Label put on every container, for finding strays
pub const SUBMISSION_LABEL: &str = "crucible.submission";

/// Keep-alive command of a unit's container
const KEEP_ALIVE: [&str; 2] = ["sleep", "2147483647"];

const SIGKILL: i32 = 9;

/// Docker CLI backend
pub struct DockerIsolation {
    binary: PathBuf,
    user: String,
    network: String,
    steps: StepTable,
    units: Mutex<HashMap<String, UnitState>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct UnitState {
    /// We killed the container, so a SIGKILL exit is not an OOM kill
    killed: bool,

    /// The running step has a memory ceiling
    memory_limited: bool,
}

impl DockerIsolation {
    pub fn new(
        binary: impl Into<PathBuf>,
        user: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            binary: binary.into(),
            user: user.into(),
            network: network.into(),
            steps: StepTable::new(),
            units: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.docker_binary(),
            config.docker.user.clone(),
            config.docker.network.clone(),
        )
    }

    fn state(&self, unit: &str) -> UnitState {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unit)
            .copied()
            .unwrap_or_default()
    }

    fn update_state(&self, unit: &str, f: impl FnOnce(&mut UnitState)) {
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        f(units.entry(unit.to_owned()).or_default());
    }

    fn program(&self) -> String {
        self.binary.to_string_lossy().into_owned()
    }

    /// Run a docker CLI command to completion
    async fn docker(&self, args: &[String]) -> Result<Output, IsolationError> {
        debug!(?args, "docker");
        let mut command = Command::new(&self.binary);
        command.args(args).kill_on_drop(true);

        match tokio::time::timeout(CLI_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(IsolationError::Unavailable(format!(
                    "docker binary {} not found",
                    self.binary.display()
                )))
            }
            Ok(Err(source)) => Err(IsolationError::Spawn {
                program: self.program(),
                source,
            }),
            Err(_) => Err(IsolationError::Unavailable(format!(
                "docker {} did not finish within {CLI_TIMEOUT:?}",
                args.first().map(String::as_str).unwrap_or_default()
            ))),
        }
    }

    /// Arguments of `docker create` for a unit
    pub fn create_args(&self, name: &str, spec: &UnitSpec) -> Vec<String> {
        let mut args = vec![
            "create".to_owned(),
            format!("--name={name}"),
            format!("--label={SUBMISSION_LABEL}={}", spec.submission_id),
            format!("--network={}", self.network),
            "--security-opt=no-new-privileges".to_owned(),
            "--cap-drop=ALL".to_owned(),
            format!("--user={}", self.user),
            "--read-only".to_owned(),
            "--tmpfs=/tmp:rw,nosuid,nodev,size=65536k".to_owned(),
            format!(
                "--volume={}:{}:rw",
                spec.workspace.display(),
                spec.image.workdir
            ),
            format!("--workdir={}", spec.image.workdir),
        ];
        args.extend(limit_args(&spec.limits));
        if let Some(files) = spec.limits.max_open_files {
            args.push(format!("--ulimit=nofile={files}:{files}"));
        }
        args.push(spec.image.reference.clone());
        args.extend(KEEP_ALIVE.iter().map(|s| (*s).to_owned()));
        args
    }

    /// Arguments of `docker exec` for a step
    pub fn exec_args(&self, unit: &UnitHandle, step: &StepCommand) -> Vec<String> {
        let mut args = vec!["exec".to_owned()];
        if step.stdin.is_some() {
            args.push("--interactive".to_owned());
        }
        args.push(format!("--workdir={}", unit.workdir));
        args.push(format!("--user={}", self.user));
        args.push(format!("--env=PATH={}", step.path));
        let mut env: Vec<_> = step.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push(format!("--env={key}={value}"));
        }
        args.push(unit.id.clone());
        args.extend(step.argv.iter().cloned());
        args
    }

    /// Whether the unit's container is still up, asked of the daemon
    async fn container_running(&self, unit: &str) -> bool {
        let args = [
            "inspect".to_owned(),
            "--format={{.State.Running}}".to_owned(),
            unit.to_owned(),
        ];
        match self.docker(&args).await {
            Ok(output) => {
                output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            Err(e) => {
                warn!(unit, error = %e, "container inspect failed");
                false
            }
        }
    }

    /// Turn the exit of a `docker exec` client into a step exit.
    ///
    /// `unit_alive` is the daemon's view of the container after the exit.
    /// The client's own failures share exit codes with the program, so only
    /// a container that went away without our kill makes this a backend
    /// failure. Step output is never consulted.
    fn to_step_exit(
        &self,
        unit: &UnitHandle,
        finished: Finished,
        unit_alive: bool,
    ) -> Result<StepExit, IsolationError> {
        let code = finished.exit_code();
        let state = self.state(&unit.id);

        if !unit_alive && !state.killed {
            return Err(IsolationError::StepFailed {
                unit: unit.id.clone(),
                message: format!("container is gone after docker exec exited with {code:?}"),
            });
        }

        // Exit statuses above 128 are signals delivered inside the container.
        let (exit_code, signal) = match (code, finished.signal()) {
            (Some(code), None) if code > 128 && code <= 128 + 64 => (None, Some(code - 128)),
            (code, signal) => (code, signal),
        };

        let limit_exceeded = if signal == Some(SIGKILL) && !state.killed && state.memory_limited {
            LimitExceeded::Memory
        } else {
            LimitExceeded::NotExceeded
        };

        Ok(StepExit {
            exit_code,
            signal,
            duration: finished.duration,
            peak_memory_kb: None,
            limit_exceeded,
            message: None,
            stdout: finished.stdout,
            stderr: finished.stderr,
        })
    }
}

/// Exit codes the docker client also uses for its own errors
fn client_may_have_failed(code: Option<i32>) -> bool {
    matches!(code, Some(1 | 125..=127))
}

fn limit_args(limits: &ResourceLimits) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(memory) = limits.memory_limit {
        args.push(format!("--memory={memory}k"));
        args.push(format!("--memory-swap={memory}k"));
    }
    if let Some(cpus) = limits.cpus {
        args.push(format!("--cpus={cpus}"));
    }
    if let Some(procs) = limits.max_processes {
        args.push(format!("--pids-limit={procs}"));
    }
    args
}

fn failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr.to_owned()
    }
}

fn is_missing(output: &Output) -> bool {
    String::from_utf8_lossy(&output.stderr).contains("No such container")
}

#[async_trait]
impl Isolation for DockerIsolation {
    fn name(&self) -> &str {
        "docker"
    }

    #[instrument(skip_all, fields(submission_id = %spec.submission_id, image = %spec.image.reference))]
    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle, IsolationError> {
        let name = format!("crucible-{}", Uuid::new_v4().simple());

        let output = self.docker(&self.create_args(&name, spec)).await?;
        if !output.status.success() {
            return Err(IsolationError::CreateFailed(failure(&output)));
        }

        let output = self.docker(&["start".to_owned(), name.clone()]).await?;
        if !output.status.success() {
            let message = failure(&output);
            // The container exists but never ran; don't leave it behind.
            let rm = ["rm".to_owned(), "--force".to_owned(), name.clone()];
            if let Err(e) = self.docker(&rm).await {
                warn!(unit = %name, error = %e, "failed to remove unstarted container");
            }
            return Err(IsolationError::CreateFailed(message));
        }

        debug!(unit = %name, "container started");
        Ok(UnitHandle {
            id: name,
            submission_id: spec.submission_id,
            workspace: spec.workspace.clone(),
            workdir: spec.image.workdir.clone(),
        })
    }

    #[instrument(skip_all, fields(unit = %unit.id, step = step.kind.as_str()))]
    async fn start(&self, unit: &UnitHandle, step: &StepCommand) -> Result<(), IsolationError> {
        step.program()?;

        let limits = limit_args(&step.limits);
        if !limits.is_empty() {
            let mut args = vec!["update".to_owned()];
            args.extend(limits);
            args.push(unit.id.clone());
            let output = self.docker(&args).await?;
            if !output.status.success() {
                return Err(IsolationError::StartFailed {
                    unit: unit.id.clone(),
                    message: failure(&output),
                });
            }
        }

        let mut command = Command::new(&self.binary);
        command.args(self.exec_args(unit, step));

        let stdin = step.stdin.as_ref().map(|name| unit.workspace.join(name));
        self.steps.spawn(
            &unit.id,
            command,
            &self.program(),
            stdin.as_deref(),
            step.capture_limit,
        )?;
        self.update_state(&unit.id, |state| {
            state.memory_limited = step.limits.memory_limit.is_some();
        });
        Ok(())
    }

    async fn wait(
        &self,
        unit: &UnitHandle,
        timeout: Duration,
    ) -> Result<WaitStatus, IsolationError> {
        Ok(match self.steps.wait(&unit.id, timeout).await? {
            Some(finished) => {
                let unit_alive = !client_may_have_failed(finished.exit_code())
                    || self.container_running(&unit.id).await;
                WaitStatus::Exited(self.to_step_exit(unit, finished, unit_alive)?)
            }
            None => WaitStatus::DeadlineExceeded,
        })
    }

    #[instrument(skip_all, fields(unit = %unit.id))]
    async fn kill(&self, unit: &UnitHandle) -> Result<(), IsolationError> {
        self.update_state(&unit.id, |state| state.killed = true);

        let output = self
            .docker(&["kill".to_owned(), unit.id.clone()])
            .await?;
        // Killing the container ends the exec'd step; the local client follows.
        self.steps.kill(&unit.id, false);

        if !output.status.success() {
            let message = failure(&output);
            if message.contains("is not running") || is_missing(&output) {
                return Ok(());
            }
            return Err(IsolationError::KillFailed {
                unit: unit.id.clone(),
                message,
            });
        }
        debug!("container killed");
        Ok(())
    }

    #[instrument(skip_all, fields(unit = %unit.id))]
    async fn remove(&self, unit: &UnitHandle) -> Result<(), IsolationError> {
        self.steps.forget(&unit.id);

        let output = self
            .docker(&["rm".to_owned(), "--force".to_owned(), unit.id.clone()])
            .await?;
        if !output.status.success() && !is_missing(&output) {
            return Err(IsolationError::RemoveFailed {
                unit: unit.id.clone(),
                message: failure(&output),
            });
        }

        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&unit.id);
        debug!("container removed");
        Ok(())
    }
}
