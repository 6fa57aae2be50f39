//! Local subprocess backend
//!
//! Runs steps as plain host processes in their own process group, with
//! rlimits applied before exec and the environment cleared. There is no
//! filesystem, network or pid isolation: use it for development and tests,
//! never for untrusted code.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::resource::{Resource, rlim_t, setrlimit};
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::isolation::child::{Finished, StepTable};
use crate::isolation::{
    Isolation, IsolationError, StepCommand, StepExit, UnitHandle, UnitSpec, WaitStatus,
};
use crate::types::{LimitExceeded, ResourceLimits};

const SIGABRT: i32 = 6;
const SIGBUS: i32 = 7;
const SIGKILL: i32 = 9;
const SIGSEGV: i32 = 11;
const SIGXCPU: i32 = 24;
const SIGXFSZ: i32 = 25;

/// Host process backend
pub struct ProcessIsolation {
    steps: StepTable,

    /// Units whose step we killed ourselves
    killed: Mutex<HashSet<String>>,

    /// Limits of the running step, keyed by unit
    limits: Mutex<HashMap<String, ResourceLimits>>,
}

impl ProcessIsolation {
    pub fn new() -> Self {
        warn!("process backend provides no isolation; do not run untrusted code with it");
        Self {
            steps: StepTable::new(),
            killed: Mutex::new(HashSet::new()),
            limits: Mutex::new(HashMap::new()),
        }
    }

    fn killed_by_us(&self, unit: &str) -> bool {
        self.killed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(unit)
    }

    fn to_step_exit(&self, unit: &str, finished: Finished) -> StepExit {
        let limits = self
            .limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(unit)
            .unwrap_or_else(ResourceLimits::unset);

        let signal = finished.signal();
        let exit_code = finished.exit_code();
        let killed_by_us = self.killed_by_us(unit);

        let limit_exceeded = match signal {
            Some(SIGXCPU) => LimitExceeded::Time,
            // RLIMIT_CPU hard limit
            Some(SIGKILL) if !killed_by_us && limits.time_limit.is_some() => LimitExceeded::Time,
            Some(SIGXFSZ) => LimitExceeded::Output,
            // A failed allocation under RLIMIT_AS crashes the program instead
            // of being reported by the kernel. Program output is never trusted.
            Some(SIGSEGV | SIGABRT | SIGBUS) if limits.memory_limit.is_some() => {
                LimitExceeded::Memory
            }
            _ => LimitExceeded::NotExceeded,
        };

        StepExit {
            exit_code,
            signal,
            duration: finished.duration,
            peak_memory_kb: None,
            limit_exceeded,
            message: None,
            stdout: finished.stdout,
            stderr: finished.stderr,
        }
    }
}

impl Default for ProcessIsolation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Isolation for ProcessIsolation {
    fn name(&self) -> &str {
        "process"
    }

    #[instrument(skip_all, fields(submission_id = %spec.submission_id))]
    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle, IsolationError> {
        let metadata = tokio::fs::metadata(&spec.workspace)
            .await
            .map_err(|e| IsolationError::CreateFailed(format!("workspace unavailable: {e}")))?;
        if !metadata.is_dir() {
            return Err(IsolationError::CreateFailed(format!(
                "workspace {} is not a directory",
                spec.workspace.display()
            )));
        }

        let id = format!("proc-{}", Uuid::new_v4().simple());
        debug!(unit = %id, "unit created");
        Ok(UnitHandle {
            id,
            submission_id: spec.submission_id,
            workspace: spec.workspace.clone(),
            workdir: spec.workspace.to_string_lossy().into_owned(),
        })
    }

    #[instrument(skip_all, fields(unit = %unit.id, step = step.kind.as_str()))]
    async fn start(&self, unit: &UnitHandle, step: &StepCommand) -> Result<(), IsolationError> {
        let program = step.program()?;

        let mut command = Command::new(program);
        command
            .args(&step.argv[1..])
            .current_dir(&unit.workspace)
            .env_clear()
            .env("PATH", &step.path)
            .envs(&step.env)
            .process_group(0);

        let rlimits = Rlimits::from_limits(&step.limits);
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe,
        // and allocates nothing between fork and exec.
        unsafe {
            command.pre_exec(move || rlimits.apply());
        }

        let stdin = step.stdin.as_ref().map(|name| unit.workspace.join(name));
        self.steps.spawn(
            &unit.id,
            command,
            program,
            stdin.as_deref(),
            step.capture_limit,
        )?;
        self.limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unit.id.clone(), step.limits.clone());
        Ok(())
    }

    async fn wait(
        &self,
        unit: &UnitHandle,
        timeout: Duration,
    ) -> Result<WaitStatus, IsolationError> {
        Ok(match self.steps.wait(&unit.id, timeout).await? {
            Some(finished) => WaitStatus::Exited(self.to_step_exit(&unit.id, finished)),
            None => WaitStatus::DeadlineExceeded,
        })
    }

    #[instrument(skip_all, fields(unit = %unit.id))]
    async fn kill(&self, unit: &UnitHandle) -> Result<(), IsolationError> {
        self.killed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unit.id.clone());
        if self.steps.kill(&unit.id, true) {
            debug!("process group killed");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(unit = %unit.id))]
    async fn remove(&self, unit: &UnitHandle) -> Result<(), IsolationError> {
        if self.steps.is_running(&unit.id) {
            self.steps.kill(&unit.id, true);
            self.steps.forget(&unit.id);
        }
        self.killed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&unit.id);
        self.limits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&unit.id);
        debug!("unit removed");
        Ok(())
    }
}

/// rlimit values resolved before fork
#[derive(Debug, Clone, Copy, Default)]
struct Rlimits {
    address_space: Option<rlim_t>,
    cpu_seconds: Option<rlim_t>,
    file_size: Option<rlim_t>,
    stack: Option<rlim_t>,
    open_files: Option<rlim_t>,
}

impl Rlimits {
    fn from_limits(limits: &ResourceLimits) -> Self {
        let kb = |v: u64| v.saturating_mul(1024) as rlim_t;
        Self {
            address_space: limits.memory_limit.map(kb),
            cpu_seconds: limits
                .time_limit
                .map(|secs| secs.ceil().max(1.0) as rlim_t),
            file_size: limits.max_output.map(kb),
            stack: limits.stack_limit.map(kb),
            open_files: limits.max_open_files.map(rlim_t::from),
        }
    }

    fn apply(&self) -> io::Result<()> {
        if let Some(bytes) = self.address_space {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(secs) = self.cpu_seconds {
            // SIGXCPU at the soft limit, SIGKILL one second later.
            setrlimit(Resource::RLIMIT_CPU, secs, secs.saturating_add(1))?;
        }
        if let Some(bytes) = self.file_size {
            setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
        }
        if let Some(bytes) = self.stack {
            setrlimit(Resource::RLIMIT_STACK, bytes, bytes)?;
        }
        if let Some(count) = self.open_files {
            setrlimit(Resource::RLIMIT_NOFILE, count, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::image::ImageHandle;
    use crate::isolation::StepKind;

    fn spec(workspace: &std::path::Path) -> UnitSpec {
        UnitSpec {
            submission_id: Uuid::new_v4(),
            image: Arc::new(ImageHandle::host("sample", "fp")),
            workspace: workspace.to_owned(),
            limits: ResourceLimits::default(),
        }
    }

    fn step(script: &str, limits: ResourceLimits) -> StepCommand {
        StepCommand {
            kind: StepKind::Run,
            argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
            env: HashMap::new(),
            path: crate::config::DEFAULT_SANDBOX_PATH.into(),
            stdin: None,
            mounts: vec![],
            limits,
            capture_limit: 1024,
        }
    }

    async fn exited(backend: &ProcessIsolation, unit: &UnitHandle) -> StepExit {
        match backend.wait(unit, Duration::from_secs(20)).await.unwrap() {
            WaitStatus::Exited(exit) => exit,
            WaitStatus::DeadlineExceeded => panic!("step did not exit"),
        }
    }

    #[test]
    fn rlimits_convert_units() {
        let limits = ResourceLimits::unset()
            .with_memory_limit(2)
            .with_time_limit(1.2)
            .with_max_output(3);
        let r = Rlimits::from_limits(&limits);
        assert_eq!(r.address_space, Some(2048));
        assert_eq!(r.cpu_seconds, Some(2));
        assert_eq!(r.file_size, Some(3072));
        assert_eq!(r.stack, None);
    }

    #[tokio::test]
    async fn runs_in_workspace_with_clean_environment() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input.txt"), b"in\n").unwrap();
        let backend = ProcessIsolation::new();
        let unit = backend.create(&spec(dir.path())).await.unwrap();

        let mut cmd = step("pwd; echo \"$HOME|$PATH\"; cat", ResourceLimits::unset());
        cmd.stdin = Some("input.txt".into());
        backend.start(&unit, &cmd).await.unwrap();
        let exit = exited(&backend, &unit).await;

        let stdout = exit.stdout.text();
        let mut lines = stdout.lines();
        assert_eq!(
            std::fs::canonicalize(lines.next().unwrap()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
        assert_eq!(
            lines.next().unwrap(),
            format!("|{}", crate::config::DEFAULT_SANDBOX_PATH)
        );
        assert_eq!(lines.next().unwrap(), "in");
        assert!(exit.succeeded());

        backend.remove(&unit).await.unwrap();
    }

    #[tokio::test]
    async fn kill_terminates_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessIsolation::new();
        let unit = backend.create(&spec(dir.path())).await.unwrap();

        backend
            .start(&unit, &step("sleep 30 & sleep 30; wait", ResourceLimits::unset()))
            .await
            .unwrap();
        let status = backend
            .wait(&unit, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(status, WaitStatus::DeadlineExceeded));

        backend.kill(&unit).await.unwrap();
        let exit = exited(&backend, &unit).await;
        assert_eq!(exit.signal, Some(SIGKILL));
        assert_eq!(exit.limit_exceeded, LimitExceeded::NotExceeded);

        backend.remove(&unit).await.unwrap();
        backend.remove(&unit).await.unwrap();
    }

    #[tokio::test]
    async fn cpu_limit_is_reported_as_time() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessIsolation::new();
        let unit = backend.create(&spec(dir.path())).await.unwrap();

        backend
            .start(
                &unit,
                &step("while :; do :; done", ResourceLimits::unset().with_time_limit(1.0)),
            )
            .await
            .unwrap();
        let exit = exited(&backend, &unit).await;
        assert_eq!(exit.limit_exceeded, LimitExceeded::Time);

        backend.remove(&unit).await.unwrap();
    }

    async fn run_to_exit(script: &str, limits: ResourceLimits) -> StepExit {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessIsolation::new();
        let unit = backend.create(&spec(dir.path())).await.unwrap();
        backend.start(&unit, &step(script, limits)).await.unwrap();
        let exit = exited(&backend, &unit).await;
        backend.remove(&unit).await.unwrap();
        exit
    }

    #[tokio::test]
    async fn program_output_never_signals_a_limit() {
        let limits = ResourceLimits::unset().with_memory_limit(64 * 1024);
        let exit = run_to_exit("echo 'memory check failed' >&2; exit 1", limits).await;
        assert_eq!(exit.exit_code, Some(1));
        assert_eq!(exit.limit_exceeded, LimitExceeded::NotExceeded);
    }

    #[tokio::test]
    async fn crash_under_memory_limit_is_memory() {
        let limited = ResourceLimits::unset().with_memory_limit(64 * 1024);
        let exit = run_to_exit("kill -SEGV $$", limited).await;
        assert_eq!(exit.signal, Some(SIGSEGV));
        assert_eq!(exit.limit_exceeded, LimitExceeded::Memory);

        // Without an address-space limit a crash is the program's own fault.
        let exit = run_to_exit("kill -SEGV $$", ResourceLimits::unset()).await;
        assert_eq!(exit.signal, Some(SIGSEGV));
        assert_eq!(exit.limit_exceeded, LimitExceeded::NotExceeded);
    }

    #[tokio::test]
    async fn missing_workspace_fails_create() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessIsolation::new();
        let err = backend
            .create(&spec(&dir.path().join("gone")))
            .await
            .unwrap_err();
        assert!(matches!(err, IsolationError::CreateFailed(_)));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessIsolation::new();
        let unit = backend.create(&spec(dir.path())).await.unwrap();

        let mut cmd = step("", ResourceLimits::unset());
        cmd.argv = vec!["/nonexistent/crucible-test-binary".into()];
        let err = backend.start(&unit, &cmd).await.unwrap_err();
        assert!(matches!(err, IsolationError::Spawn { .. }));
    }
}
