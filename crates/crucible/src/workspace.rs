//! Workspace staging
//!
//! Every submission gets its own freshly created directory holding the source
//! file and the stdin fixture. The directory is mounted into the execution
//! unit and removed once the run is over.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::Language;
use crate::submission::Submission;

/// Name of the stdin fixture inside every workspace
pub const STDIN_FIXTURE: &str = "input.txt";

#[derive(Debug, Error)]
#[error("failed to stage workspace at {path}: {source}")]
pub struct StagingError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl StagingError {
    fn new(path: &Path, source: io::Error) -> Self {
        Self {
            path: path.to_owned(),
            source,
        }
    }
}

/// Creates per-submission workspaces under a root directory
#[derive(Debug, Clone)]
pub struct WorkspaceStager {
    root: PathBuf,

    /// Make workspaces writable by every user, for backends that run steps
    /// under a different uid than ours
    shared: bool,
}

impl WorkspaceStager {
    pub fn new(root: impl Into<PathBuf>, shared: bool) -> Self {
        Self {
            root: root.into(),
            shared,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stage a submission's source and stdin into a new workspace
    #[instrument(skip_all, fields(submission_id = %submission.id))]
    pub async fn stage(
        &self,
        submission: &Submission,
        language: &Language,
    ) -> Result<Workspace, StagingError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StagingError::new(&self.root, e))?;

        let id = Uuid::new_v4();
        let path = self.root.join(id.to_string());

        // create_dir (not create_dir_all) fails if the directory already
        // exists, so no two workspaces can ever share storage.
        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| StagingError::new(&path, e))?;

        let mut workspace = Workspace {
            id,
            path,
            source_name: language.source_name.to_string(),
            released: false,
        };

        if let Err(e) = self.populate(&workspace, submission).await {
            // Best effort; the Drop fallback covers a failure here.
            if workspace.release().await.is_ok() {
                debug!("removed partially staged workspace");
            }
            return Err(e);
        }

        debug!(path = %workspace.path.display(), "workspace staged");
        Ok(workspace)
    }

    async fn populate(
        &self,
        workspace: &Workspace,
        submission: &Submission,
    ) -> Result<(), StagingError> {
        let source_path = workspace.source_path();
        tokio::fs::write(&source_path, &submission.source)
            .await
            .map_err(|e| StagingError::new(&source_path, e))?;

        let stdin_path = workspace.stdin_path();
        let stdin = submission.stdin.as_deref().unwrap_or_default();
        tokio::fs::write(&stdin_path, stdin)
            .await
            .map_err(|e| StagingError::new(&stdin_path, e))?;

        if self.shared {
            set_mode(&workspace.path, 0o777).await?;
            set_mode(&source_path, 0o666).await?;
            set_mode(&stdin_path, 0o644).await?;
        }

        Ok(())
    }
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), StagingError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| StagingError::new(path, e))
}

/// A staged, submission-exclusive directory
///
/// # Cleanup
///
/// Call [`release()`](Self::release) once the run is over. Dropping an
/// unreleased workspace logs a warning and removes the directory synchronously.
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    path: PathBuf,
    source_name: String,
    released: bool,
}

impl Workspace {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Host path of the workspace directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn source_path(&self) -> PathBuf {
        self.path.join(&self.source_name)
    }

    pub fn stdin_path(&self) -> PathBuf {
        self.path.join(STDIN_FIXTURE)
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Remove the workspace directory. Calling this more than once is a no-op.
    #[instrument(skip(self), fields(workspace = %self.id))]
    pub async fn release(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.released = true;
        debug!("workspace released");
        Ok(())
    }

    /// Give up ownership of the directory without removing it.
    ///
    /// Used after cleanup has been handed to someone else (the reaper).
    pub fn disown(mut self) -> PathBuf {
        self.released = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(
            workspace = %self.id,
            path = %self.path.display(),
            "Workspace dropped without release, removing synchronously"
        );
        if let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(workspace = %self.id, error = %e, "workspace removal on drop failed");
        }
    }
}
