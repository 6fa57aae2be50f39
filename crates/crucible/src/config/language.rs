use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, de};

use crate::config::ConfigError;
use crate::config::recipe::Recipe;
use crate::types::{MountConfig, ResourceLimits};

/// Configuration for a supported language
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Language {
    /// Human-readable name for the language (e.g., "C++17 (GCC)")
    pub name: String,

    /// Name the submitted source is staged under (e.g., "Main.java")
    pub source_name: SourceName,

    /// Compilation configuration (None for interpreted languages)
    #[serde(default)]
    pub compile: Option<CompileConfig>,

    /// Execution configuration
    pub run: RunConfig,

    /// How to build the language's image (container backends only)
    #[serde(default)]
    pub recipe: Option<Recipe>,
}

impl Language {
    /// Check if the language is compiled
    pub fn is_compiled(&self) -> bool {
        self.compile.is_some()
    }

    /// Name of the artifact the run step executes
    pub fn binary_name(&self) -> &str {
        match self.compile {
            Some(ref compile) => &compile.output_name,
            None => self.source_name.as_str(),
        }
    }

    /// Compile argv with placeholders expanded
    pub fn compile_argv(&self) -> Option<Vec<String>> {
        self.compile.as_ref().map(|compile| {
            Self::expand_command(&compile.command, self.source_name.as_str(), self.binary_name())
        })
    }

    /// Run argv with placeholders expanded
    pub fn run_argv(&self) -> Vec<String> {
        Self::expand_command(&self.run.command, self.source_name.as_str(), self.binary_name())
    }

    /// Expand placeholders in the given command
    pub fn expand_command(command: &[String], source: &str, binary: &str) -> Vec<String> {
        command
            .iter()
            .map(|arg| {
                arg.replace("{source}", source)
                    .replace("{output}", binary)
                    .replace("{binary}", binary)
            })
            .collect()
    }
}

/// File name a submission's source is written to, relative to the workspace
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceName(String);

impl SourceName {
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        if name.contains('/') || name.contains('\0') || name == "." || name == ".." {
            return Err(ConfigError::InvalidSourceName(name.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for SourceName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        SourceName::new(&s).map_err(|_| {
            de::Error::invalid_value(
                de::Unexpected::Str(&s),
                &"a plain file name without '/' characters",
            )
        })
    }
}

impl AsRef<str> for SourceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for the compilation step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    /// Command and arguments with placeholders
    /// Placeholders: {source}, {output}
    pub command: Vec<String>,

    /// Output artifact name (e.g., "main")
    #[serde(default = "default_output_name")]
    pub output_name: String,

    /// Environment variables to set during compilation
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Resource limits for compilation (overrides the compile defaults)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

fn default_output_name() -> String {
    "main".to_owned()
}

/// Default PATH inside an execution unit
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Configuration for the execution step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Command and arguments with placeholders
    /// Placeholders: {source}, {binary}
    pub command: Vec<String>,

    /// Environment Variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Additional directory mounts
    #[serde(default)]
    pub mounts: Vec<MountConfig>,

    /// PATH environment variable inside the unit, for both steps
    #[serde(default = "default_sandbox_path")]
    pub path: String,

    /// Resource limits for execution (overrides defaults)
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

fn default_sandbox_path() -> String {
    DEFAULT_SANDBOX_PATH.to_owned()
}
