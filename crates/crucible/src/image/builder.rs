//! Image builders

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::image::{BuildRequest, ImageBuilder, ImageError};
use crate::isolation::resolve_command;

/// Builds recipes into docker images
#[derive(Debug, Clone)]
pub struct DockerImageBuilder {
    binary: PathBuf,
}

impl DockerImageBuilder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Whether the daemon already has `tag`
    async fn exists(&self, tag: &str) -> bool {
        Command::new(&self.binary)
            .args(["image", "inspect", "--format={{.Id}}", tag])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .is_ok_and(|status| status.success())
    }

    pub fn build_args(request: &BuildRequest) -> Vec<String> {
        vec![
            "build".to_owned(),
            "--quiet".to_owned(),
            format!("--tag={}", request.tag),
            format!("--label=crucible.language={}", request.language),
            format!("--label=crucible.fingerprint={}", request.fingerprint),
            // Dockerfile on stdin, no build context
            "-".to_owned(),
        ]
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    fn name(&self) -> &str {
        "docker"
    }

    #[instrument(skip_all, fields(tag = %request.tag))]
    async fn build(&self, request: &BuildRequest) -> Result<String, ImageError> {
        let Some(ref dockerfile) = request.dockerfile else {
            return Err(ImageError::build_failure(
                &request.language,
                "language has no recipe",
            ));
        };

        // Tags embed the fingerprint, so an existing tag is this exact recipe.
        if self.exists(&request.tag).await {
            debug!("image already present");
            return Ok(request.tag.clone());
        }

        let args = Self::build_args(request);
        debug!(?args, "docker build");
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ImageError::build_failure(
                    &request.language,
                    format!("failed to run {}: {e}", self.binary.display()),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(dockerfile.as_bytes()).await.map_err(|e| {
                ImageError::build_failure(&request.language, format!("writing recipe: {e}"))
            })?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            ImageError::build_failure(&request.language, format!("waiting for build: {e}"))
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("docker build failed");
            return Err(ImageError::build_failure(&request.language, reason.trim()));
        }

        Ok(request.tag.clone())
    }
}

/// "Builds" host images by checking the toolchain is installed
#[derive(Debug, Clone, Copy, Default)]
pub struct HostImageBuilder;

#[async_trait]
impl ImageBuilder for HostImageBuilder {
    fn name(&self) -> &str {
        "host"
    }

    async fn build(&self, request: &BuildRequest) -> Result<String, ImageError> {
        for program in &request.programs {
            // Programs produced by the compile step don't exist yet.
            if program.starts_with("./") {
                continue;
            }
            let mut argv = [program.clone()];
            resolve_command(&mut argv)
                .map_err(|e| ImageError::build_failure(&request.language, e.to_string()))?;
            if !std::path::Path::new(&argv[0]).exists() {
                return Err(ImageError::build_failure(
                    &request.language,
                    format!("{program} does not exist"),
                ));
            }
        }
        Ok(format!("host:{}", request.language))
    }
}
