//! IOI Isolate backend
//!
//! Each execution unit is one initialized isolate box. The workspace is bound
//! into the box at [`WORKDIR`]; steps run through `isolate --run` with their
//! limits as flags and report through a meta file.
//!
//! References for Isolate's CLI arguments and meta-files:
//! - https://www.ucw.cz/isolate/isolate.1.html
//! - https://github.com/ioi/isolate

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::process::Command;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

pub use crate::isolation::isolate::command::{IsolateAction, IsolateCommand, RunOptions};
pub use crate::isolation::isolate::meta::{MetaFile, MetaStatus};
use crate::config::Config;
use crate::isolation::capture::read_file_capped;
use crate::isolation::child::{Finished, StepTable};
use crate::isolation::{
    Isolation, IsolationError, StepCommand, StepExit, UnitHandle, UnitSpec, WaitStatus,
};
use crate::types::{MountConfig, ResourceLimits};

mod command;
mod meta;

/// Where the workspace is mounted inside a box
pub const WORKDIR: &str = "/workspace";

const CLI_TIMEOUT: Duration = Duration::from_secs(30);

/// Time the keeper gets to write its meta file after killing the box
const KEEPER_MARGIN: Duration = Duration::from_millis(250);

/// Cap on isolate's own stdout/stderr; program output goes to files
const ISOLATE_OUTPUT_CAP: usize = 16 * 1024;

/// Isolate backend
pub struct IsolateIsolation {
    binary: PathBuf,
    cgroup: bool,

    /// Mounts applied to every step
    mounts: Vec<MountConfig>,
    free_boxes: Mutex<BTreeSet<u32>>,
    boxes: Mutex<HashMap<String, BoxState>>,
    steps: StepTable,
}

#[derive(Debug, Clone)]
struct BoxState {
    box_id: u32,
    box_path: PathBuf,
    killed: bool,
    step: Option<StepFiles>,
}

/// Host paths of the files a running step reports through
#[derive(Debug, Clone)]
struct StepFiles {
    meta: PathBuf,
    stdout: PathBuf,
    stderr: PathBuf,
    capture_limit: usize,
}

impl IsolateIsolation {
    /// Backend owning boxes `first_box..first_box + count`
    pub fn new(
        binary: impl Into<PathBuf>,
        cgroup: bool,
        first_box: u32,
        count: u32,
        mounts: Vec<MountConfig>,
    ) -> Self {
        Self {
            binary: binary.into(),
            cgroup,
            mounts,
            free_boxes: Mutex::new((first_box..first_box.saturating_add(count)).collect()),
            boxes: Mutex::new(HashMap::new()),
            steps: StepTable::new(),
        }
    }

    /// Build the backend from config, preparing cgroups when requested.
    ///
    /// One box is reserved per worker.
    pub fn from_config(config: &Config) -> Result<Self, IsolationError> {
        validate_mounts(&config.isolate.mounts)?;

        let cgroup = config.isolate.cgroup
            && match prepare_cgroup(&config.isolate.cg_root) {
                Ok(true) => true,
                Ok(false) => {
                    warn!("cgroup v2 memory controller unavailable, falling back to RLIMIT_AS");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "cgroup setup failed, falling back to RLIMIT_AS");
                    false
                }
            };

        let count = u32::try_from(config.workers).unwrap_or(u32::MAX);
        Ok(Self::new(
            config.isolate_binary(),
            cgroup,
            config.isolate.box_id_start,
            count,
            config.isolate.mounts.clone(),
        ))
    }

    fn with_box<T>(&self, unit: &str, f: impl FnOnce(&mut BoxState) -> T) -> Option<T> {
        let mut boxes = self.boxes.lock().unwrap_or_else(PoisonError::into_inner);
        boxes.get_mut(unit).map(f)
    }

    fn release_box_id(&self, box_id: u32) {
        self.free_boxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(box_id);
    }

    fn command(&self, box_id: u32, action: IsolateAction) -> IsolateCommand {
        IsolateCommand {
            box_id,
            cgroup: self.cgroup,
            action,
        }
    }

    async fn isolate(&self, box_id: u32, action: IsolateAction) -> Result<Output, IsolationError> {
        let args = self.command(box_id, action).args();
        debug!(?args, "isolate");
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args).kill_on_drop(true);

        match tokio::time::timeout(CLI_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) if source.kind() == std::io::ErrorKind::NotFound => {
                Err(IsolationError::Unavailable(format!(
                    "isolate binary {} not found",
                    self.binary.display()
                )))
            }
            Ok(Err(source)) => Err(IsolationError::Spawn {
                program: self.binary.to_string_lossy().into_owned(),
                source,
            }),
            Err(_) => Err(IsolationError::Unavailable(format!(
                "isolate did not finish within {CLI_TIMEOUT:?}"
            ))),
        }
    }

    async fn to_step_exit(
        &self,
        unit: &UnitHandle,
        state: BoxState,
        finished: Finished,
    ) -> Result<StepExit, IsolationError> {
        let Some(files) = state.step else {
            return Err(IsolationError::NoRunningStep(unit.id.clone()));
        };

        let meta = match MetaFile::load(&files.meta).await {
            Ok(meta) => meta,
            Err(_) if state.killed => {
                // The keeper was terminated before it could report.
                return Ok(StepExit {
                    signal: Some(Signal::SIGKILL as i32),
                    duration: finished.duration,
                    ..Default::default()
                });
            }
            Err(e) => {
                let stderr = finished.stderr.text();
                return Err(IsolationError::StepFailed {
                    unit: unit.id.clone(),
                    message: format!("no meta file ({e}): {}", stderr.trim()),
                });
            }
        };

        if meta.status() == MetaStatus::InternalError {
            return Err(IsolationError::StepFailed {
                unit: unit.id.clone(),
                message: meta.message().unwrap_or("isolate internal error").to_owned(),
            });
        }

        let stdout = read_file_capped(&files.stdout, files.capture_limit).await?;
        let stderr = read_file_capped(&files.stderr, files.capture_limit).await?;
        Ok(meta.to_step_exit(stdout, stderr))
    }
}

#[async_trait]
impl Isolation for IsolateIsolation {
    fn name(&self) -> &str {
        "isolate"
    }

    #[instrument(skip_all, fields(submission_id = %spec.submission_id))]
    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle, IsolationError> {
        let box_id = self
            .free_boxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_first()
            .ok_or_else(|| IsolationError::CreateFailed("no free isolate box".to_owned()))?;

        let output = match self.isolate(box_id, IsolateAction::Init).await {
            Ok(output) => output,
            Err(e) => {
                self.release_box_id(box_id);
                return Err(e);
            }
        };
        if !output.status.success() {
            self.release_box_id(box_id);
            return Err(IsolationError::CreateFailed(format!(
                "isolate --init on box {box_id}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        let id = format!("isolate-{box_id}-{}", Uuid::new_v4().simple());
        debug!(unit = %id, box_path = %box_path.display(), "box initialized");

        self.boxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.clone(),
                BoxState {
                    box_id,
                    box_path,
                    killed: false,
                    step: None,
                },
            );

        Ok(UnitHandle {
            id,
            submission_id: spec.submission_id,
            workspace: spec.workspace.clone(),
            workdir: WORKDIR.to_owned(),
        })
    }

    #[instrument(skip_all, fields(unit = %unit.id, step = step.kind.as_str()))]
    async fn start(&self, unit: &UnitHandle, step: &StepCommand) -> Result<(), IsolationError> {
        let (box_id, box_path) = self
            .with_box(&unit.id, |state| (state.box_id, state.box_path.clone()))
            .ok_or_else(|| IsolationError::StartFailed {
                unit: unit.id.clone(),
                message: "unknown unit".to_owned(),
            })?;

        // isolate execve()s without a PATH search.
        let mut argv = step.argv.clone();
        resolve_command(&mut argv)?;

        let kind = step.kind.as_str();
        let files = StepFiles {
            meta: box_path.join(format!("{kind}.meta")),
            stdout: box_path.join("box").join(format!("{kind}.stdout")),
            stderr: box_path.join("box").join(format!("{kind}.stderr")),
            capture_limit: step.capture_limit,
        };

        let workspace = MountConfig {
            source: unit.workspace.to_string_lossy().into_owned(),
            target: WORKDIR.to_owned(),
            writable: true,
            optional: false,
        };
        let mut env: BTreeMap<_, _> = step.env.clone().into_iter().collect();
        env.insert("PATH".to_owned(), step.path.clone());
        let run = RunOptions {
            limits: Some(step.limits.clone()),
            mounts: self
                .mounts
                .iter()
                .chain(&step.mounts)
                .cloned()
                .chain([workspace])
                .collect(),
            env,
            meta: Some(files.meta.clone()),
            stdin: step.stdin.as_ref().map(|name| Path::new(WORKDIR).join(name)),
            stdout: Some(format!("/box/{kind}.stdout").into()),
            stderr: Some(format!("/box/{kind}.stderr").into()),
            chdir: Some(WORKDIR.to_owned()),
            argv,
        };

        let mut process = Command::new(&self.binary);
        process.args(self.command(box_id, IsolateAction::Run(run)).args());
        self.steps.spawn(
            &unit.id,
            process,
            &self.binary.to_string_lossy(),
            None,
            ISOLATE_OUTPUT_CAP,
        )?;

        self.with_box(&unit.id, |state| state.step = Some(files));
        Ok(())
    }

    async fn wait(
        &self,
        unit: &UnitHandle,
        timeout: Duration,
    ) -> Result<WaitStatus, IsolationError> {
        let Some(finished) = self.steps.wait(&unit.id, timeout).await? else {
            return Ok(WaitStatus::DeadlineExceeded);
        };
        let state = self
            .with_box(&unit.id, |state| {
                let snapshot = state.clone();
                state.step = None;
                snapshot
            })
            .ok_or_else(|| IsolationError::NoRunningStep(unit.id.clone()))?;

        Ok(WaitStatus::Exited(
            self.to_step_exit(unit, state, finished).await?,
        ))
    }

    #[instrument(skip_all, fields(unit = %unit.id))]
    async fn kill(&self, unit: &UnitHandle) -> Result<(), IsolationError> {
        self.with_box(&unit.id, |state| state.killed = true);
        // The keeper tears the box's processes down when terminated.
        if self.steps.signal(&unit.id, Signal::SIGTERM) {
            debug!("isolate keeper terminated");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(unit = %unit.id))]
    async fn remove(&self, unit: &UnitHandle) -> Result<(), IsolationError> {
        self.steps.forget(&unit.id);

        let Some(box_id) = self.with_box(&unit.id, |state| state.box_id) else {
            return Ok(());
        };
        let output = self.isolate(box_id, IsolateAction::Cleanup).await?;
        if !output.status.success() {
            // The box id stays reserved until cleanup succeeds.
            return Err(IsolationError::RemoveFailed {
                unit: unit.id.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        self.boxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&unit.id);
        self.release_box_id(box_id);
        debug!(box_id, "box cleaned up");
        Ok(())
    }

    /// isolate kills the box itself once `extra_time` has run out past a
    /// limit; the controller deadline only backs that up.
    fn deadline_slack(&self, limits: &ResourceLimits) -> Duration {
        let extra = limits
            .extra_time
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or_default();
        extra + KEEPER_MARGIN
    }
}

/// Attempt to set up the cgroup v2 hierarchy for isolate.
///
/// In container environments, `isolate-cg-keeper` (the systemd service that
/// normally manages isolate's cgroup) is not available. This function replicates
/// its job: creating the cgroup directory at `cg_root` and enabling the memory
/// and pids controllers so that per-box child cgroups work.
///
/// Returns `Ok(true)` if cgroups are ready, `Ok(false)` if the memory
/// controller is unavailable.
pub fn prepare_cgroup(cg_root: &Path) -> std::io::Result<bool> {
    let cg_base = Path::new("/sys/fs/cgroup");

    let controllers_path = cg_base.join("cgroup.controllers");
    if !controllers_path.exists() {
        return Ok(false);
    }
    let controllers = fs::read_to_string(&controllers_path)?;
    if !controllers.split_whitespace().any(|c| c == "memory") {
        return Ok(false);
    }

    if let Ok(content) = fs::read_to_string(cg_root.join("cgroup.subtree_control"))
        && content.split_whitespace().any(|c| c == "memory")
    {
        return Ok(true);
    }

    // cgroup v2's "no internal process" rule: move ourselves into a leaf
    // before enabling controllers at the root.
    let init_cg = cg_base.join("init");
    if !init_cg.exists() {
        fs::create_dir(&init_cg)?;
    }
    fs::write(init_cg.join("cgroup.procs"), std::process::id().to_string())?;
    fs::write(cg_base.join("cgroup.subtree_control"), "+memory +pids")?;

    if !cg_root.exists() {
        fs::create_dir(cg_root)?;
    }
    fs::write(cg_root.join("cgroup.subtree_control"), "+memory +pids")?;

    Ok(true)
}

/// Check that every non-optional mount source exists on the host
pub fn validate_mounts(mounts: &[MountConfig]) -> Result<(), IsolationError> {
    match mounts
        .iter()
        .find(|mount| !mount.optional && !Path::new(&mount.source).exists())
    {
        Some(mount) => Err(IsolationError::Unavailable(format!(
            "mount source {} does not exist",
            mount.source
        ))),
        None => Ok(()),
    }
}

/// Resolve a bare program name to an absolute host path using `PATH`.
///
/// Programs containing a `/` (like `./main`) are left unchanged. Symlinks are
/// resolved so the path stays valid across bind-mount boundaries.
pub fn resolve_command(command: &mut [String]) -> Result<(), IsolationError> {
    let Some(first) = command.first_mut() else {
        return Ok(());
    };
    if first.contains('/') {
        return Ok(());
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    let found = path_var
        .split(':')
        .map(|dir| Path::new(dir).join(&*first))
        .find(|candidate| candidate.is_file());

    match found {
        Some(candidate) => {
            *first = fs::canonicalize(&candidate)
                .unwrap_or(candidate)
                .to_string_lossy()
                .into_owned();
            Ok(())
        }
        None => Err(IsolationError::InvalidCommand(format!(
            "command '{first}' not found in PATH"
        ))),
    }
}
