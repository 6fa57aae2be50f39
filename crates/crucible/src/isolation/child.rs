//! Bookkeeping for step processes spawned on the host
//!
//! Every backend runs a step as a host child: the program itself for the
//! process backend, a `docker exec` client or an `isolate --run` keeper
//! otherwise. The table maps unit ids to the child currently running in them.

use std::collections::HashMap;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::isolation::IsolationError;
use crate::isolation::capture::read_capped;
use crate::types::CapturedOutput;

/// How long output readers may lag behind the exit of the child
const READER_GRACE: Duration = Duration::from_secs(2);

type Reader = JoinHandle<io::Result<CapturedOutput>>;

struct RunningStep {
    child: Child,
    started: Instant,
    stdout: Option<Reader>,
    stderr: Option<Reader>,
}

struct StepSlot {
    pid: Option<u32>,
    inner: tokio::sync::Mutex<RunningStep>,
}

/// A child that has exited, with its captured streams
#[derive(Debug)]
pub(crate) struct Finished {
    pub status: ExitStatus,
    pub duration: Duration,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
}

impl Finished {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    pub fn signal(&self) -> Option<i32> {
        self.status.signal()
    }
}

#[derive(Default)]
pub(crate) struct StepTable {
    steps: Mutex<HashMap<String, Arc<StepSlot>>>,
}

impl StepTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, unit: &str) -> Option<Arc<StepSlot>> {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unit)
            .cloned()
    }

    pub fn is_running(&self, unit: &str) -> bool {
        self.slot(unit).is_some()
    }

    /// Spawn `command` as the running step of `unit`.
    ///
    /// stdin is read from `stdin` when given, otherwise it is empty. stdout
    /// and stderr are captured up to `capture_limit` bytes each.
    pub fn spawn(
        &self,
        unit: &str,
        mut command: Command,
        program: &str,
        stdin: Option<&Path>,
        capture_limit: usize,
    ) -> Result<(), IsolationError> {
        if self.is_running(unit) {
            return Err(IsolationError::StartFailed {
                unit: unit.to_owned(),
                message: "a step is already running".to_owned(),
            });
        }

        let stdin = match stdin {
            Some(path) => Stdio::from(std::fs::File::open(path)?),
            None => Stdio::null(),
        };

        let mut child = command
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| IsolationError::Spawn {
                program: program.to_owned(),
                source,
            })?;
        let started = Instant::now();
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_capped(out, capture_limit)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_capped(err, capture_limit)));

        debug!(unit, pid, program, "step spawned");

        let slot = Arc::new(StepSlot {
            pid,
            inner: tokio::sync::Mutex::new(RunningStep {
                child,
                started,
                stdout,
                stderr,
            }),
        });
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unit.to_owned(), slot);
        Ok(())
    }

    /// Wait up to `timeout` for the step of `unit` to exit.
    ///
    /// Returns `None` if the step is still running; it stays registered.
    pub async fn wait(
        &self,
        unit: &str,
        timeout: Duration,
    ) -> Result<Option<Finished>, IsolationError> {
        let slot = self
            .slot(unit)
            .ok_or_else(|| IsolationError::NoRunningStep(unit.to_owned()))?;
        let mut step = slot.inner.lock().await;

        let status = match tokio::time::timeout(timeout, step.child.wait()).await {
            Ok(status) => status?,
            Err(_) => return Ok(None),
        };
        let duration = step.started.elapsed();

        let stdout = collect(step.stdout.take(), unit, "stdout").await;
        let stderr = collect(step.stderr.take(), unit, "stderr").await;
        drop(step);
        self.forget(unit);

        debug!(unit, ?status, ?duration, "step exited");
        Ok(Some(Finished {
            status,
            duration,
            stdout,
            stderr,
        }))
    }

    /// Send SIGKILL to the step of `unit`, or to its whole process group.
    ///
    /// Returns false if no step is running.
    pub fn kill(&self, unit: &str, group: bool) -> bool {
        let Some(slot) = self.slot(unit) else {
            return false;
        };
        if let Some(pid) = slot.pid
            && let Ok(pid) = i32::try_from(pid)
        {
            let pid = Pid::from_raw(pid);
            let sent = if group {
                killpg(pid, Signal::SIGKILL)
            } else {
                kill(pid, Signal::SIGKILL)
            };
            if let Err(e) = sent {
                debug!(unit, error = %e, "kill signal not delivered");
            }
        }
        true
    }

    /// Send `signal` to the step's own process
    pub fn signal(&self, unit: &str, signal: Signal) -> bool {
        let Some(slot) = self.slot(unit) else {
            return false;
        };
        if let Some(pid) = slot.pid
            && let Ok(pid) = i32::try_from(pid)
            && let Err(e) = kill(Pid::from_raw(pid), signal)
        {
            debug!(unit, error = %e, "signal not delivered");
        }
        true
    }

    /// Drop the step of `unit`; a still-running child is killed on drop.
    pub fn forget(&self, unit: &str) -> bool {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(unit)
            .is_some()
    }
}

async fn collect(reader: Option<Reader>, unit: &str, stream: &str) -> CapturedOutput {
    let Some(mut reader) = reader else {
        return CapturedOutput::default();
    };
    match tokio::time::timeout(READER_GRACE, &mut reader).await {
        Ok(Ok(Ok(output))) => output,
        Ok(Ok(Err(e))) => {
            warn!(unit, stream, error = %e, "failed to read step output");
            CapturedOutput::default()
        }
        Ok(Err(e)) => {
            warn!(unit, stream, error = %e, "output reader task failed");
            CapturedOutput::default()
        }
        Err(_) => {
            // A descendant is still holding the pipe open.
            warn!(unit, stream, "output reader did not finish, abandoning it");
            reader.abort();
            CapturedOutput {
                bytes: Vec::new(),
                truncated: true,
            }
        }
    }
}
