use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub use crate::config::language::{
    CompileConfig, DEFAULT_SANDBOX_PATH, Language, RunConfig, SourceName,
};
pub use crate::config::recipe::{DEFAULT_WORKDIR, Recipe};
use crate::retry::RetryConfig;
use crate::types::{MountConfig, ResourceLimits};

pub mod language;
mod loader;
pub mod recipe;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../crucible.example.toml");

/// Prefix for environment variable overrides, e.g. `CRUCIBLE_WORKERS=8`
pub const ENV_PREFIX: &str = "CRUCIBLE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid source file name '{0}'")]
    InvalidSourceName(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' not found in configuration")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which isolation technology execution units are built on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// One container per submission, via the docker CLI
    #[default]
    Docker,
    /// One IOI Isolate box per submission
    Isolate,
    /// Plain host processes with rlimits; no namespace isolation
    Process,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Docker => "docker",
            Backend::Isolate => "isolate",
            Backend::Process => "process",
        }
    }
}

/// Settings for the docker backend
#[derive(Debug, Clone, Deserialize)]
pub struct DockerConfig {
    /// Path to the docker binary (uses PATH if not specified)
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// User steps run as inside the container
    #[serde(default = "default_docker_user")]
    pub user: String,

    /// Network mode for execution units
    #[serde(default = "default_docker_network")]
    pub network: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            path: None,
            user: default_docker_user(),
            network: default_docker_network(),
        }
    }
}

/// Settings for the isolate backend
#[derive(Debug, Clone, Deserialize)]
pub struct IsolateConfig {
    /// Path to the Isolate binary (uses PATH if not specified).
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Use cgroup memory limiting instead of RLIMIT_AS.
    ///
    /// When enabled, isolate uses `--cg` and `--cg-mem` which limit actual memory
    /// usage (RSS) rather than virtual address space. This is required for runtimes
    /// like the JVM that map large amounts of virtual memory.
    #[serde(default)]
    pub cgroup: bool,

    /// Cgroup root path for isolate. Must match isolate's `cg_root` config value.
    #[serde(default = "default_cg_root")]
    pub cg_root: PathBuf,

    /// First box id handed out; boxes `box_id_start..box_id_start + workers` are used
    #[serde(default)]
    pub box_id_start: u32,

    /// Directory mounts applied to every step
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            path: None,
            cgroup: false,
            cg_root: default_cg_root(),
            box_id_start: 0,
            mounts: Vec::new(),
        }
    }
}

/// Settings for the HTTP submission API
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address the API listens on
    #[serde(default = "default_server_bind")]
    pub bind: String,

    /// Largest accepted request body in bytes
    #[serde(default = "default_max_body")]
    pub max_body: usize,

    /// Finished asynchronous results kept for retrieval; the oldest are
    /// dropped first
    #[serde(default = "default_retained_results")]
    pub retained_results: usize,

    /// Answer cross-origin requests from any origin
    #[serde(default)]
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_server_bind(),
            max_body: default_max_body(),
            retained_results: default_retained_results(),
            cors: false,
        }
    }
}

/// Config for Crucible
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: Backend,

    /// Number of submissions executed concurrently. Units waiting on the
    /// reaper are not counted, so live units may briefly exceed this.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Number of submissions that may wait for a free worker
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Byte cap applied to stdout and stderr of every step
    #[serde(default = "default_capture_limit")]
    pub capture_limit: usize,

    /// Seconds an image build may take before it counts as failed
    #[serde(default = "default_image_build_timeout")]
    pub image_build_timeout: f64,

    /// Seconds a killed step is given to exit before it is abandoned
    #[serde(default = "default_kill_grace")]
    pub kill_grace: f64,

    /// Directory under which per-submission workspaces are created
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Directory that relative recipe files are resolved against
    #[serde(default)]
    pub recipes_dir: Option<PathBuf>,

    /// Default resource limits for run steps.
    /// Language limits and caller overrides are layered on top.
    #[serde(default)]
    pub default_limits: ResourceLimits,

    /// Ceiling for caller-supplied limit overrides
    #[serde(default = "default_max_limits")]
    pub max_limits: ResourceLimits,

    /// Base limits for compile steps
    #[serde(default = "default_compile_limits")]
    pub compile_limits: ResourceLimits,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub isolate: IsolateConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Language configurations keyed by language ID
    #[serde(default)]
    pub languages: HashMap<String, Language>,
}

impl Config {
    /// Create a new config with the embedded default languages
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            backend: Backend::default(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            capture_limit: default_capture_limit(),
            image_build_timeout: default_image_build_timeout(),
            kill_grace: default_kill_grace(),
            workspace_root: default_workspace_root(),
            recipes_dir: None,
            default_limits: ResourceLimits::default(),
            max_limits: default_max_limits(),
            compile_limits: default_compile_limits(),
            retry: RetryConfig::default(),
            docker: DockerConfig::default(),
            isolate: IsolateConfig::default(),
            server: ServerConfig::default(),
            languages: HashMap::new(),
        }
    }

    /// Get a language by ID
    pub fn get_language(&self, id: &str) -> Result<&Language, ConfigError> {
        self.languages
            .get(id)
            .ok_or_else(|| ConfigError::LanguageNotFound(id.to_string()))
    }

    /// Get the path to the docker binary
    pub fn docker_binary(&self) -> PathBuf {
        self.docker
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("docker"))
    }

    /// Get the path to the isolate binary
    pub fn isolate_binary(&self) -> PathBuf {
        self.isolate
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from("isolate"))
    }

    pub fn image_build_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.image_build_timeout)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs_f64(self.kill_grace)
    }

    /// Effective run limits: config defaults, then language limits, then the
    /// caller's overrides clamped to `max_limits`.
    pub fn run_limits(
        &self,
        language: &Language,
        overrides: Option<&ResourceLimits>,
    ) -> ResourceLimits {
        let mut limits = self.default_limits.clone();
        if let Some(ref lang_limits) = language.run.limits {
            limits = limits.with_overrides(lang_limits);
        }
        if let Some(user_limits) = overrides {
            let (user_limits, clamped) = user_limits.clamp_to(&self.max_limits);
            if !clamped.is_empty() {
                warn!(language = %language.name, ?clamped, "limit overrides clamped to ceiling");
            }
            limits = limits.with_overrides(&user_limits);
        }
        limits
    }

    /// Effective compile limits, or None for interpreted languages
    pub fn compile_limits(&self, language: &Language) -> Option<ResourceLimits> {
        let compile = language.compile.as_ref()?;
        Some(match compile.limits {
            Some(ref lang) => self.compile_limits.with_overrides(lang),
            None => self.compile_limits.clone(),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_capture_limit() -> usize {
    64 * 1024
}

fn default_image_build_timeout() -> f64 {
    600.0
}

fn default_kill_grace() -> f64 {
    0.5
}

fn default_server_bind() -> String {
    "127.0.0.1:5001".to_owned()
}

fn default_max_body() -> usize {
    1024 * 1024
}

fn default_retained_results() -> usize {
    1024
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("crucible")
}

fn default_max_limits() -> ResourceLimits {
    ResourceLimits {
        time_limit: Some(10.0),
        wall_time_limit: Some(20.0),
        memory_limit: Some(ResourceLimits::GB),
        stack_limit: Some(ResourceLimits::GB),
        max_processes: Some(256),
        max_output: Some(ResourceLimits::GB),
        max_open_files: Some(256),
        extra_time: Some(2.0),
        cpus: Some(2.0),
    }
}

/// Default compilation limits
fn default_compile_limits() -> ResourceLimits {
    ResourceLimits {
        time_limit: Some(30.0),      // 30 seconds
        wall_time_limit: Some(60.0), // 60 seconds wall time
        memory_limit: Some(524288),  // 512 MB
        max_processes: Some(64),     // Allow multiple processes for compilers
        max_output: Some(65536),     // 64 MB output
        ..Default::default()
    }
}

fn default_cg_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/isolate")
}

fn default_docker_user() -> String {
    "65534:65534".to_owned()
}

fn default_docker_network() -> String {
    "none".to_owned()
}
