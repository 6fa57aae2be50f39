//! Argument lists for the isolate CLI

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{MountConfig, ResourceLimits};

/// What one isolate invocation does to its box
#[derive(Debug, Clone)]
pub enum IsolateAction {
    Init,
    Run(RunOptions),
    Cleanup,
}

/// Everything `isolate --run` needs besides the box id
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub limits: Option<ResourceLimits>,
    pub mounts: Vec<MountConfig>,

    /// Ordered so the argv is deterministic
    pub env: BTreeMap<String, String>,

    /// Host path
    pub meta: Option<PathBuf>,

    /// Sandbox paths
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub chdir: Option<String>,

    pub argv: Vec<String>,
}

/// One isolate invocation on one box
#[derive(Debug, Clone)]
pub struct IsolateCommand {
    pub box_id: u32,
    pub cgroup: bool,
    pub action: IsolateAction,
}

impl IsolateCommand {
    /// Arguments after the isolate binary
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![format!("--box-id={}", self.box_id)];
        if self.cgroup {
            args.push("--cg".to_owned());
        }

        let run = match self.action {
            IsolateAction::Init => {
                args.push("--init".to_owned());
                return args;
            }
            IsolateAction::Cleanup => {
                args.push("--cleanup".to_owned());
                return args;
            }
            IsolateAction::Run(ref run) => run,
        };

        args.push("--run".to_owned());
        if let Some(ref limits) = run.limits {
            args.extend(limit_flags(limits, self.cgroup));
        }
        args.extend(run.mounts.iter().filter_map(dir_flag));
        args.extend(run.env.iter().map(|(key, value)| format!("--env={key}={value}")));

        let paths = [
            ("--meta", &run.meta),
            ("--stdin", &run.stdin),
            ("--stdout", &run.stdout),
            ("--stderr", &run.stderr),
        ];
        for (flag, path) in paths {
            if let Some(path) = path {
                args.push(format!("{flag}={}", path.display()));
            }
        }
        if let Some(ref dir) = run.chdir {
            args.push(format!("--chdir={dir}"));
        }

        args.push("--".to_owned());
        args.extend(run.argv.iter().cloned());
        args
    }
}

/// `--dir` flag for a mount; optional mounts whose source is missing are skipped
fn dir_flag(mount: &MountConfig) -> Option<String> {
    if mount.optional && !Path::new(&mount.source).exists() {
        return None;
    }
    let rw = if mount.writable { ":rw" } else { "" };
    let maybe = if mount.optional { ":maybe" } else { "" };
    Some(format!("--dir={}={}{rw}{maybe}", mount.target, mount.source))
}

/// Limit flags. With cgroups, memory is charged by RSS instead of address space.
fn limit_flags(limits: &ResourceLimits, cgroup: bool) -> Vec<String> {
    let memory_flag = if cgroup { "--cg-mem" } else { "--mem" };
    [
        ("--time", limits.time_limit.map(|v| v.to_string())),
        ("--wall-time", limits.wall_time_limit.map(|v| v.to_string())),
        ("--extra-time", limits.extra_time.map(|v| v.to_string())),
        (memory_flag, limits.memory_limit.map(|v| v.to_string())),
        ("--stack", limits.stack_limit.map(|v| v.to_string())),
        ("--processes", limits.max_processes.map(|v| v.to_string())),
        ("--fsize", limits.max_output.map(|v| v.to_string())),
        ("--open-files", limits.max_open_files.map(|v| v.to_string())),
    ]
    .into_iter()
    .filter_map(|(flag, value)| Some(format!("{flag}={}", value?)))
    .collect()
}
