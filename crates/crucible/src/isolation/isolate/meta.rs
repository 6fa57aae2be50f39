//! Isolate meta files
//!
//! `isolate --run --meta=FILE` writes one `key:value` pair per line
//! describing how the sandboxed program ended.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::isolation::StepExit;
use crate::types::{CapturedOutput, LimitExceeded};

/// The `status` field of a meta file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaStatus {
    /// No status line: the program exited with code 0
    Ok,
    /// RE: non-zero exit
    RuntimeError,
    /// SG: died on a signal
    Signaled,
    /// TO: time or wall-time limit
    TimedOut,
    /// XX: isolate itself failed
    InternalError,
}

impl MetaStatus {
    fn parse(status: &str) -> Self {
        match status {
            "RE" => MetaStatus::RuntimeError,
            "SG" => MetaStatus::Signaled,
            "TO" => MetaStatus::TimedOut,
            "XX" => MetaStatus::InternalError,
            _ => MetaStatus::Ok,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetaFile {
    entries: HashMap<String, String>,
}

impl MetaFile {
    /// Parse meta file content, skipping malformed lines
    pub fn parse(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| line.trim().split_once(':'))
            .map(|(key, value)| (key.trim(), value.trim()))
            .filter(|(key, _)| !key.is_empty())
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();
        Self { entries }
    }

    pub async fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(Self::parse(&content))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn status(&self) -> MetaStatus {
        self.get("status").map_or(MetaStatus::Ok, MetaStatus::parse)
    }

    pub fn message(&self) -> Option<&str> {
        self.get("message")
    }

    /// Wall clock time, falling back to CPU time
    pub fn duration(&self) -> Duration {
        self.parsed::<f64>("time-wall")
            .or_else(|| self.parsed("time"))
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or_default()
    }

    /// Peak memory in kilobytes; cgroup accounting wins over max-rss
    pub fn peak_memory_kb(&self) -> Option<u64> {
        self.parsed("cg-mem").or_else(|| self.parsed("max-rss"))
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.parsed("exitcode")
    }

    pub fn signal(&self) -> Option<i32> {
        self.parsed("exitsig")
    }

    /// Which limit the program ran into
    pub fn limit_exceeded(&self) -> LimitExceeded {
        // cg-oom-killed is present whenever the cgroup OOM killer fired.
        if self.get("cg-oom-killed").is_some() {
            return LimitExceeded::Memory;
        }
        let from_message = LimitExceeded::from_message(self.message());
        if from_message.is_exceeded() {
            return from_message;
        }
        match self.status() {
            MetaStatus::TimedOut => LimitExceeded::Time,
            _ => LimitExceeded::NotExceeded,
        }
    }

    pub fn to_step_exit(&self, stdout: CapturedOutput, stderr: CapturedOutput) -> StepExit {
        let signal = self.signal();
        StepExit {
            // isolate omits exitcode for signalled and timed-out runs
            exit_code: self.exit_code().or(match (self.status(), signal) {
                (MetaStatus::Ok, None) => Some(0),
                _ => None,
            }),
            signal,
            duration: self.duration(),
            peak_memory_kb: self.peak_memory_kb(),
            limit_exceeded: self.limit_exceeded(),
            message: self.message().map(str::to_owned),
            stdout,
            stderr,
        }
    }
}
