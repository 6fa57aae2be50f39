//! Integration tests for crucible
//!
//! The process backend and configuration tests run everywhere. Tests against
//! docker or the isolate binary need the `integration-tests` feature:
//!    cargo test -p crucible --features integration-tests -- --include-ignored

use std::path::Path;

use crucible::Config;

mod config_loading;
#[cfg(feature = "integration-tests")]
mod docker;
#[cfg(feature = "integration-tests")]
mod isolate;
mod process_backend;

/// Shell languages shared by every backend's tests
pub(crate) const SAMPLE_LANGUAGES: &str = r#"
[languages.sample]
name = "POSIX shell"
source_name = "main.sh"

[languages.sample.run]
command = ["/bin/sh", "{source}"]

[languages.sample.recipe]
base = "alpine:3.20"

[languages.sample-checked]
name = "POSIX shell (syntax checked)"
source_name = "main.sh"

[languages.sample-checked.compile]
command = ["/bin/sh", "-n", "{source}"]

[languages.sample-checked.run]
command = ["/bin/sh", "{source}"]

[languages.sample-checked.recipe]
base = "alpine:3.20"
"#;

/// Config for `backend` with workspaces under `root` and tight limits
pub(crate) fn test_config(backend: &str, root: &Path, workers: usize, queue: usize) -> Config {
    let toml = format!(
        r#"
backend = "{backend}"
workers = {workers}
queue_capacity = {queue}
capture_limit = 4096
kill_grace = 0.2
workspace_root = "{root}"

[retry]
max_retries = 1
backoff = 0.01
max_backoff = 0.05
reaper_attempts = 3

[default_limits]
time_limit = 1.0
wall_time_limit = 3.0
memory_limit = 262144
max_output = 1024
extra_time = 0.2

[isolate]
cgroup = true
{SAMPLE_LANGUAGES}"#,
        root = root.display(),
    );
    let mut config = Config::parse_toml(&toml).expect("test config should be valid");
    if config.backend == crucible::Backend::Isolate
        && !matches!(crucible::prepare_cgroup(&config.isolate.cg_root), Ok(true))
    {
        config.isolate.cgroup = false;
    }
    config
}
