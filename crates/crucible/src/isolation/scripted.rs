//! In-memory isolation backend for pipeline tests
//!
//! Steps don't run anything; each step kind follows a [`Behavior`]. The
//! backend counts lifecycle events and the peak number of live units.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::isolation::{
    Isolation, IsolationError, StepCommand, StepExit, StepKind, UnitHandle, UnitSpec, WaitStatus,
};
use crate::types::{CapturedOutput, LimitExceeded};

#[derive(Debug, Clone)]
pub(crate) enum Behavior {
    Exit { code: i32, stdout: &'static str },
    /// Exit 0 after a delay
    Sleep(Duration),
    /// Never exits on its own
    Hang,
    /// Killed by the backend for exceeding a limit
    Limit(LimitExceeded),
    /// The backend fails to run the step
    Fail,
    /// The backend panics while waiting on the step
    Panic,
}

#[derive(Debug, Default)]
pub(crate) struct Events {
    pub created: AtomicUsize,
    pub removed: AtomicUsize,
    pub killed: AtomicUsize,
    pub compiles: AtomicUsize,
    pub runs: AtomicUsize,
    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
}

impl Events {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub(crate) struct ScriptedIsolation {
    compile: Behavior,
    run: Behavior,
    pub events: Events,

    /// Number of upcoming creates that fail
    pub fail_creates: AtomicU32,

    /// Number of upcoming removes that fail
    pub fail_removes: AtomicU32,

    /// Number of upcoming run steps that panic instead of following `run`
    pub panic_runs: AtomicU32,
    units: Mutex<HashMap<String, UnitState>>,
}

#[derive(Debug, Default)]
struct UnitState {
    step: Option<Behavior>,
    killed: bool,
}

impl ScriptedIsolation {
    pub fn new(run: Behavior) -> Self {
        Self {
            compile: Behavior::Exit {
                code: 0,
                stdout: "",
            },
            run,
            events: Events::default(),
            fail_creates: AtomicU32::new(0),
            fail_removes: AtomicU32::new(0),
            panic_runs: AtomicU32::new(0),
            units: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_compile(mut self, compile: Behavior) -> Self {
        self.compile = compile;
        self
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn killed(&self, unit: &str) -> bool {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unit)
            .is_some_and(|state| state.killed)
    }
}

fn exited(code: i32, stdout: &str) -> WaitStatus {
    WaitStatus::Exited(StepExit {
        exit_code: Some(code),
        duration: Duration::from_millis(5),
        stdout: CapturedOutput::new(stdout),
        ..Default::default()
    })
}

fn sigkill(limit_exceeded: LimitExceeded) -> WaitStatus {
    WaitStatus::Exited(StepExit {
        signal: Some(9),
        limit_exceeded,
        ..Default::default()
    })
}

#[async_trait]
impl Isolation for ScriptedIsolation {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn create(&self, spec: &UnitSpec) -> Result<UnitHandle, IsolationError> {
        if Self::take_failure(&self.fail_creates) {
            return Err(IsolationError::CreateFailed("scripted failure".into()));
        }
        let id = format!("scripted-{}", Uuid::new_v4().simple());
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), UnitState::default());

        self.events.created.fetch_add(1, Ordering::SeqCst);
        let live = self.events.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(UnitHandle {
            id,
            submission_id: spec.submission_id,
            workspace: spec.workspace.clone(),
            workdir: spec.image.workdir.clone(),
        })
    }

    async fn start(&self, unit: &UnitHandle, step: &StepCommand) -> Result<(), IsolationError> {
        let behavior = match step.kind {
            StepKind::Compile => {
                self.events.compiles.fetch_add(1, Ordering::SeqCst);
                self.compile.clone()
            }
            StepKind::Run => {
                self.events.runs.fetch_add(1, Ordering::SeqCst);
                if Self::take_failure(&self.panic_runs) {
                    Behavior::Panic
                } else {
                    self.run.clone()
                }
            }
        };
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        let state = units
            .get_mut(&unit.id)
            .ok_or_else(|| IsolationError::StartFailed {
                unit: unit.id.clone(),
                message: "unknown unit".into(),
            })?;
        state.step = Some(behavior);
        Ok(())
    }

    async fn wait(
        &self,
        unit: &UnitHandle,
        timeout: Duration,
    ) -> Result<WaitStatus, IsolationError> {
        let behavior = self
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&unit.id)
            .and_then(|state| state.step.clone())
            .ok_or_else(|| IsolationError::NoRunningStep(unit.id.clone()))?;

        if self.killed(&unit.id) {
            return Ok(sigkill(LimitExceeded::NotExceeded));
        }
        match behavior {
            Behavior::Exit { code, stdout } => Ok(exited(code, stdout)),
            Behavior::Sleep(delay) if delay <= timeout => {
                tokio::time::sleep(delay).await;
                Ok(exited(0, ""))
            }
            Behavior::Sleep(_) | Behavior::Hang => {
                tokio::time::sleep(timeout).await;
                Ok(WaitStatus::DeadlineExceeded)
            }
            Behavior::Limit(limit) => Ok(sigkill(limit)),
            Behavior::Fail => Err(IsolationError::StepFailed {
                unit: unit.id.clone(),
                message: "scripted failure".into(),
            }),
            Behavior::Panic => panic!("scripted panic in unit {}", unit.id),
        }
    }

    async fn kill(&self, unit: &UnitHandle) -> Result<(), IsolationError> {
        self.events.killed.fetch_add(1, Ordering::SeqCst);
        if let Some(state) = self
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&unit.id)
        {
            state.killed = true;
        }
        Ok(())
    }

    async fn remove(&self, unit: &UnitHandle) -> Result<(), IsolationError> {
        if Self::take_failure(&self.fail_removes) {
            return Err(IsolationError::RemoveFailed {
                unit: unit.id.clone(),
                message: "scripted failure".into(),
            });
        }
        let existed = self
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&unit.id)
            .is_some();
        if existed {
            self.events.removed.fetch_add(1, Ordering::SeqCst);
            self.events.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
