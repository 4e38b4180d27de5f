//! Per-job working directories.
//!
//! Every job gets a fresh directory under the run's work root, so concurrent
//! jobs never share files. The directory is removed when the job finishes
//! unless workspaces are kept for inspection.

use crate::error::StepError;
use std::path::{Component, Path, PathBuf};

#[derive(Debug)]
pub struct JobWorkspace {
    path: PathBuf,
    keep: bool,
}

impl JobWorkspace {
    /// Create `<work_root>/<slug>`, wiping anything left by a previous run.
    ///
    /// The slug must name exactly one directory below `work_root`; anything
    /// else (`..`, `.`, separators, absolute paths) is refused before the
    /// filesystem is touched.
    pub fn create(work_root: &Path, slug: &str, keep: bool) -> Result<Self, StepError> {
        let mut components = Path::new(slug).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        );
        if !single {
            return Err(StepError::Workspace(format!(
                "'{}' is not a valid workspace name",
                slug
            )));
        }
        let path = work_root.join(slug);
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(|e| {
                StepError::Workspace(format!("Failed to clear {}: {}", path.display(), e))
            })?;
        }
        std::fs::create_dir_all(&path).map_err(|e| {
            StepError::Workspace(format!("Failed to create {}: {}", path.display(), e))
        })?;
        Ok(JobWorkspace { path, keep })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory a step runs in. Relative paths stay inside the workspace
    /// and are created on demand.
    pub fn step_dir(&self, relative: Option<&Path>) -> Result<PathBuf, StepError> {
        let Some(relative) = relative else {
            return Ok(self.path.clone());
        };
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StepError::Workspace(format!(
                "working directory '{}' leaves the job workspace",
                relative.display()
            )));
        }
        let dir = self.path.join(relative);
        std::fs::create_dir_all(&dir).map_err(|e| {
            StepError::Workspace(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        Ok(dir)
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            log::warn!("Failed to remove workspace {}: {}", self.path.display(), e);
        }
    }
}
