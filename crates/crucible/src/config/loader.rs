//! Configuration loading for Crucible
//!
//! Loads TOML configuration with the config crate, layering `CRUCIBLE_*`
//! environment variables on top of files.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Backend, Config, ConfigError, ENV_PREFIX};

impl Config {
    /// Load configuration from a file, applying environment overrides
    ///
    /// Nested keys use a double underscore, e.g. `CRUCIBLE_DOCKER__USER`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .add_source(environment())
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load the embedded example configuration, applying environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(super::EXAMPLE_CONFIG, FileFormat::Toml))
            .add_source(environment())
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.capture_limit == 0 {
            return Err(ConfigError::Invalid(
                "capture_limit must be positive".into(),
            ));
        }
        if !self.image_build_timeout.is_finite() || self.image_build_timeout <= 0.0 {
            return Err(ConfigError::Invalid(
                "image_build_timeout must be positive".into(),
            ));
        }
        if !self.kill_grace.is_finite() || self.kill_grace < 0.0 {
            return Err(ConfigError::Invalid(
                "kill_grace must not be negative".into(),
            ));
        }
        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "server.bind '{}' is not a socket address",
                self.server.bind
            )));
        }
        if self.server.max_body == 0 || self.server.retained_results == 0 {
            return Err(ConfigError::Invalid(
                "server.max_body and server.retained_results must be positive".into(),
            ));
        }
        for (name, secs) in [
            ("retry.backoff", self.retry.backoff),
            ("retry.max_backoff", self.retry.max_backoff),
        ] {
            if !(0.0..=MAX_BACKOFF_SECS).contains(&secs) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 0 and {MAX_BACKOFF_SECS} seconds"
                )));
            }
        }

        for (id, lang) in &self.languages {
            if lang.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if lang.source_name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty source_name"
                )));
            }
            if lang.run.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty run command"
                )));
            }
            if let Some(ref compile) = lang.compile
                && compile.command.is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty compile command"
                )));
            }
            match lang.recipe {
                Some(ref recipe) => recipe.validate(id)?,
                None if self.backend == Backend::Docker => {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' has no recipe, which the docker backend requires"
                    )));
                }
                None => {}
            }
        }

        Ok(())
    }
}

/// Longest single retry backoff a config may ask for
const MAX_BACKOFF_SECS: f64 = 3600.0;

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
backend = "process"

[languages.test]
name = "Test Language"
source_name = "main.test"

[languages.test.run]
command = ["./test"]
"#;

        let config = Config::parse_toml(toml).unwrap();
        assert_eq!(config.backend, Backend::Process);
        assert!(config.languages.contains_key("test"));
        assert_eq!(config.languages["test"].name, "Test Language");
        assert!(config.languages["test"].recipe.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
backend = "docker"
workers = 8
queue_capacity = 16
capture_limit = 1024
image_build_timeout = 120.0
recipes_dir = "/etc/crucible/recipes"

[retry]
max_retries = 5
backoff = 0.1

[docker]
path = "/usr/local/bin/docker"
user = "1000:1000"

[default_limits]
time_limit = 2.0
memory_limit = 262144

[max_limits]
time_limit = 5.0

[languages.cpp]
name = "C++17 (GCC)"
source_name = "code.cpp"

[languages.cpp.compile]
command = ["g++", "-std=c++17", "-O2", "{source}", "-o", "{output}"]
output_name = "a.out"

[languages.cpp.run]
command = ["./{binary}"]

[languages.cpp.recipe]
base = "gcc:13"
workdir = "/app"
"#;

        let config = Config::parse_toml(toml).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.capture_limit, 1024);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_backoff, RetryConfig::default().max_backoff);
        assert_eq!(
            config.docker_binary(),
            std::path::PathBuf::from("/usr/local/bin/docker")
        );
        assert_eq!(config.docker.user, "1000:1000");
        assert_eq!(config.docker.network, "none");
        assert_eq!(config.default_limits.time_limit, Some(2.0));
        assert_eq!(config.max_limits.time_limit, Some(5.0));
        assert_eq!(config.max_limits.memory_limit, None);

        let cpp = &config.languages["cpp"];
        assert_eq!(cpp.compile_argv().unwrap().last().unwrap(), "a.out");
        assert_eq!(cpp.recipe.as_ref().unwrap().base.as_deref(), Some("gcc:13"));
    }

    #[test]
    fn test_default_languages_included() {
        let config = Config::default();
        assert!(config.languages.contains_key("cpp"));
        assert!(config.languages.contains_key("python"));
        assert!(config.languages.contains_key("java"));
        assert!(config.languages.contains_key("javascript"));
        assert_eq!(config.languages["java"].source_name.as_str(), "Main.java");
    }

    #[test]
    fn test_partial_limits_dont_override_unspecified_fields() {
        let toml = r#"
backend = "process"

[languages.go]
name = "Go"
source_name = "main.go"

[languages.go.compile]
command = ["go", "build", "-o", "{output}", "{source}"]

[languages.go.compile.limits]
max_processes = 50

[languages.go.run]
command = ["./{binary}"]
"#;

        let config = Config::parse_toml(toml).unwrap();
        let compile_limits = config.languages["go"]
            .compile
            .as_ref()
            .unwrap()
            .limits
            .as_ref()
            .unwrap();

        assert_eq!(compile_limits.max_processes, Some(50));
        assert_eq!(compile_limits.time_limit, None);
        assert_eq!(compile_limits.memory_limit, None);
        assert_eq!(compile_limits.wall_time_limit, None);
    }

    #[test]
    fn test_invalid_empty_name() {
        let toml = r#"
backend = "process"

[languages.test]
name = ""
source_name = "main.test"

[languages.test.run]
command = ["./test"]
"#;

        assert!(Config::parse_toml(toml).is_err());
    }

    #[test]
    fn test_invalid_source_name_with_path() {
        let toml = r#"
backend = "process"

[languages.test]
name = "Test"
source_name = "../main.test"

[languages.test.run]
command = ["./test"]
"#;

        assert!(Config::parse_toml(toml).is_err());
    }

    #[test]
    fn test_docker_backend_requires_recipe() {
        let toml = r#"
backend = "docker"

[languages.test]
name = "Test"
source_name = "main.test"

[languages.test.run]
command = ["./test"]
"#;

        let err = Config::parse_toml(toml).unwrap_err();
        assert!(err.to_string().contains("no recipe"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let toml = r#"
backend = "process"
workers = 0
"#;

        assert!(Config::parse_toml(toml).is_err());
    }

    #[test]
    fn test_unusable_backoff_rejected() {
        for backoff in ["max_backoff = 1e30", "backoff = -1.0", "max_backoff = inf", "backoff = nan"] {
            let toml = format!("backend = \"process\"\n[retry]\n{backoff}\n");
            let err = Config::parse_toml(&toml).unwrap_err();
            assert!(err.to_string().contains("backoff"), "{backoff}: {err}");
        }
    }

    #[test]
    fn test_server_section() {
        let toml = r#"
backend = "process"

[server]
bind = "0.0.0.0:8080"
cors = true
"#;
        let config = Config::parse_toml(toml).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert!(config.server.cors);
        assert_eq!(config.server.retained_results, 1024);

        let err = Config::parse_toml("backend = \"process\"\n[server]\nbind = \"localhost\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("server.bind"));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        assert!(Config::parse_toml("backend = \"kvm\"").is_err());
    }
}
