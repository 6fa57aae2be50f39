//! Image recipes
//!
//! A recipe is either a Dockerfile on disk or an inline definition made of a
//! base image and setup commands. Either way it renders to Dockerfile text,
//! which is what gets fingerprinted and built.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Working directory the workspace is mounted at when a recipe doesn't say
pub const DEFAULT_WORKDIR: &str = "/app";

/// Declarative build definition for a language's image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// Dockerfile to build, relative to `recipes_dir` unless absolute
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Base image for an inline recipe
    #[serde(default)]
    pub base: Option<String>,

    /// Shell commands run on top of `base`, one `RUN` line each
    #[serde(default)]
    pub setup: Vec<String>,

    /// Directory inside the image where the workspace is mounted
    #[serde(default = "default_workdir")]
    pub workdir: String,
}

impl Recipe {
    pub fn validate(&self, id: &str) -> Result<(), ConfigError> {
        match (&self.file, &self.base) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(format!(
                "recipe for '{id}' sets both 'file' and 'base'"
            ))),
            (None, None) => Err(ConfigError::Invalid(format!(
                "recipe for '{id}' needs either 'file' or 'base'"
            ))),
            (None, Some(base)) if base.trim().is_empty() => Err(ConfigError::Invalid(format!(
                "recipe for '{id}' has an empty base image"
            ))),
            _ if !self.workdir.starts_with('/') => Err(ConfigError::Invalid(format!(
                "recipe for '{id}' has a relative workdir '{}'",
                self.workdir
            ))),
            _ => Ok(()),
        }
    }

    /// Resolve the recipe file against the recipes directory
    pub fn file_path(&self, recipes_dir: Option<&Path>) -> Option<PathBuf> {
        let file = self.file.as_ref()?;
        Some(match recipes_dir {
            Some(dir) if file.is_relative() => dir.join(file),
            _ => file.clone(),
        })
    }

    /// Render the recipe to Dockerfile text
    pub async fn render(&self, recipes_dir: Option<&Path>) -> std::io::Result<String> {
        if let Some(path) = self.file_path(recipes_dir) {
            return tokio::fs::read_to_string(&path).await;
        }
        Ok(self.render_inline())
    }

    fn render_inline(&self) -> String {
        let mut dockerfile = format!("FROM {}\n", self.base.as_deref().unwrap_or_default());
        for step in &self.setup {
            dockerfile.push_str("RUN ");
            dockerfile.push_str(step);
            dockerfile.push('\n');
        }
        dockerfile.push_str("WORKDIR ");
        dockerfile.push_str(&self.workdir);
        dockerfile.push('\n');
        dockerfile
    }
}

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_owned()
}
