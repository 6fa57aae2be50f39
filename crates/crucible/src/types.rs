use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time limit in seconds
    #[serde(default)]
    pub time_limit: Option<f64>,

    /// Wall clock time limit in seconds
    #[serde(default)]
    pub wall_time_limit: Option<f64>,

    /// Memory limit in kilobytes
    #[serde(default)]
    pub memory_limit: Option<u64>,

    /// Stack size limit in kilobytes
    #[serde(default)]
    pub stack_limit: Option<u64>,

    /// Maximum number of processes/threads
    #[serde(default)]
    pub max_processes: Option<u32>,

    /// Maximum size of any file written, in kilobytes
    #[serde(default)]
    pub max_output: Option<u64>,

    /// Maximum open files
    #[serde(default)]
    pub max_open_files: Option<u32>,

    /// Extra time before killing (grace period) in seconds
    #[serde(default)]
    pub extra_time: Option<f64>,

    /// CPU share, in whole or fractional cores
    #[serde(default)]
    pub cpus: Option<f64>,
}

impl ResourceLimits {
    /// 1 kilobyte in kilobytes
    pub const KB: u64 = 1;
    /// 1 megabyte in kilobytes
    pub const MB: u64 = 1024;
    /// 1 gigabyte in kilobytes
    pub const GB: u64 = 1024 * 1024;

    /// Create new resource limits populated with the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits with every field unset.
    ///
    /// Used for partial overrides, where only the fields that are set should
    /// replace a base value.
    pub const fn unset() -> Self {
        Self {
            time_limit: None,
            wall_time_limit: None,
            memory_limit: None,
            stack_limit: None,
            max_processes: None,
            max_output: None,
            max_open_files: None,
            extra_time: None,
            cpus: None,
        }
    }

    /// Set the CPU time limit in seconds
    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    /// Set the wall clock time limit in seconds
    pub fn with_wall_time_limit(mut self, seconds: f64) -> Self {
        self.wall_time_limit = Some(seconds);
        self
    }

    /// Set the memory limit in kilobytes
    pub fn with_memory_limit(mut self, kb: u64) -> Self {
        self.memory_limit = Some(kb);
        self
    }

    /// Set the stack size limit in kilobytes
    pub fn with_stack_limit(mut self, kb: u64) -> Self {
        self.stack_limit = Some(kb);
        self
    }

    /// Set the maximum number of processes
    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = Some(count);
        self
    }

    /// Set the maximum output size in kilobytes
    pub fn with_max_output(mut self, kb: u64) -> Self {
        self.max_output = Some(kb);
        self
    }

    /// Set the CPU share
    pub fn with_cpus(mut self, cpus: f64) -> Self {
        self.cpus = Some(cpus);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            time_limit: overrides.time_limit.or(self.time_limit),
            wall_time_limit: overrides.wall_time_limit.or(self.wall_time_limit),
            memory_limit: overrides.memory_limit.or(self.memory_limit),
            stack_limit: overrides.stack_limit.or(self.stack_limit),
            max_processes: overrides.max_processes.or(self.max_processes),
            max_output: overrides.max_output.or(self.max_output),
            max_open_files: overrides.max_open_files.or(self.max_open_files),
            extra_time: overrides.extra_time.or(self.extra_time),
            cpus: overrides.cpus.or(self.cpus),
        }
    }

    /// Clamp every set field to the corresponding field of `ceiling`.
    ///
    /// Fields the ceiling leaves unset are unbounded. Returns the clamped limits
    /// together with the names of the fields that had to be lowered.
    pub fn clamp_to(&self, ceiling: &ResourceLimits) -> (ResourceLimits, Vec<&'static str>) {
        let mut clamped = Vec::new();

        fn bound<T: PartialOrd + Copy>(
            name: &'static str,
            value: Option<T>,
            max: Option<T>,
            clamped: &mut Vec<&'static str>,
        ) -> Option<T> {
            match (value, max) {
                (Some(v), Some(m)) if v > m => {
                    clamped.push(name);
                    Some(m)
                }
                _ => value,
            }
        }

        let limits = ResourceLimits {
            time_limit: bound("time_limit", self.time_limit, ceiling.time_limit, &mut clamped),
            wall_time_limit: bound(
                "wall_time_limit",
                self.wall_time_limit,
                ceiling.wall_time_limit,
                &mut clamped,
            ),
            memory_limit: bound(
                "memory_limit",
                self.memory_limit,
                ceiling.memory_limit,
                &mut clamped,
            ),
            stack_limit: bound("stack_limit", self.stack_limit, ceiling.stack_limit, &mut clamped),
            max_processes: bound(
                "max_processes",
                self.max_processes,
                ceiling.max_processes,
                &mut clamped,
            ),
            max_output: bound("max_output", self.max_output, ceiling.max_output, &mut clamped),
            max_open_files: bound(
                "max_open_files",
                self.max_open_files,
                ceiling.max_open_files,
                &mut clamped,
            ),
            extra_time: bound("extra_time", self.extra_time, ceiling.extra_time, &mut clamped),
            cpus: bound("cpus", self.cpus, ceiling.cpus, &mut clamped),
        };

        (limits, clamped)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time_limit: Some(2.0),
            wall_time_limit: Some(5.0),
            memory_limit: Some(262144), // 256 MB
            stack_limit: Some(65536),   // 64 MB
            max_processes: Some(64),
            max_output: Some(65536), // 64 MB
            max_open_files: Some(64),
            extra_time: Some(0.5),
            cpus: Some(1.0),
        }
    }
}

/// Which resource limit a step ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LimitExceeded {
    /// No limit was exceeded
    #[default]
    #[serde(rename = "none")]
    NotExceeded,

    /// CPU time limit exceeded (TLE)
    #[serde(rename = "time")]
    Time,

    /// Wall clock time limit exceeded
    #[serde(rename = "wall_time")]
    WallTime,

    /// Memory limit exceeded (MLE)
    #[serde(rename = "memory")]
    Memory,

    /// Output limit exceeded (OLE)
    #[serde(rename = "output")]
    Output,
}

impl LimitExceeded {
    /// Infer which limit was exceeded from a sandbox status message, such as
    /// the `message` field of an isolate meta file.
    ///
    /// Never feed this text the submitted program wrote: a program can print
    /// anything.
    pub fn from_message(message: Option<&str>) -> Self {
        let Some(msg) = message else {
            return LimitExceeded::NotExceeded;
        };

        let msg_lower = msg.to_lowercase();

        if msg_lower.contains("time limit") {
            if msg_lower.contains("wall") {
                LimitExceeded::WallTime
            } else {
                LimitExceeded::Time
            }
        } else if msg_lower.contains("memory") {
            LimitExceeded::Memory
        } else if msg_lower.contains("output") {
            LimitExceeded::Output
        } else {
            LimitExceeded::NotExceeded
        }
    }

    /// Check if any limit was exceeded
    #[must_use]
    pub fn is_exceeded(&self) -> bool {
        !matches!(self, LimitExceeded::NotExceeded)
    }
}

/// Configuration for an additional directory mount inside an execution unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    /// Source path on the host
    pub source: String,

    /// Target path inside the unit
    pub target: String,

    /// Whether the mount is read-write (default: read-only)
    #[serde(default)]
    pub writable: bool,

    /// Whether this mount is optional (don't fail if source doesn't exist)
    #[serde(default)]
    pub optional: bool,
}

/// A captured output stream, bounded by the configured byte cap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,

    /// Whether bytes beyond the cap were discarded
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            truncated: false,
        }
    }

    /// Lossy UTF-8 view of the captured bytes
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Classified terminal status of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ResourceLimitExceeded,
    InfrastructureError,
}

impl Outcome {
    /// Rank used when several outcomes are signalled at once; higher wins.
    pub fn precedence(self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::RuntimeError => 1,
            Outcome::CompileError => 2,
            Outcome::Timeout => 3,
            Outcome::ResourceLimitExceeded => 4,
            Outcome::InfrastructureError => 5,
        }
    }

    /// Whether the outcome was caused by the submitted code rather than the host
    pub fn is_user_caused(self) -> bool {
        !matches!(self, Outcome::Success | Outcome::InfrastructureError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::CompileError => "compile_error",
            Outcome::RuntimeError => "runtime_error",
            Outcome::Timeout => "timeout",
            Outcome::ResourceLimitExceeded => "resource_limit_exceeded",
            Outcome::InfrastructureError => "infrastructure_error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of running one submission to completion
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: Outcome,

    /// Exit code of the last step that ran, if it exited normally
    pub exit_code: Option<i32>,

    /// Signal number if the last step was killed by a signal
    pub signal: Option<i32>,

    /// Wall clock time of the run step (or the compile step if it failed)
    pub duration: Duration,

    /// Peak memory usage in kilobytes, where the backend can observe it
    pub peak_memory_kb: Option<u64>,

    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,

    /// Combined compiler output, present when a compile step ran
    pub compile_output: Option<CapturedOutput>,

    /// Additional detail, e.g. the cause of an infrastructure error
    pub message: Option<String>,
}

impl ExecutionResult {
    /// Result for a submission that failed for reasons outside the submitted code
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::InfrastructureError,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Convert to the wire payload returned to callers
    pub fn to_payload(&self) -> ResultPayload {
        ResultPayload {
            outcome: self.outcome,
            exit_code: self.exit_code,
            signal: self.signal,
            duration_ms: u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
            peak_memory_kb: self.peak_memory_kb,
            stdout: self.stdout.text(),
            stdout_truncated: self.stdout.truncated,
            stderr: self.stderr.text(),
            stderr_truncated: self.stderr.truncated,
            compile_output: self.compile_output.as_ref().map(CapturedOutput::text),
            message: self.message.clone(),
        }
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            outcome: Outcome::Success,
            exit_code: None,
            signal: None,
            duration: Duration::ZERO,
            peak_memory_kb: None,
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            compile_output: None,
            message: None,
        }
    }
}

/// Serialized form of an [`ExecutionResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_memory_kb: Option<u64>,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
