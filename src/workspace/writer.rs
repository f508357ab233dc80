// Workspace writer: validated file mutations inside an app's sandbox
//
// Every write lands inside the app's workspace root - path containment
// is a security boundary, checked before any filesystem access - and
// is followed by a snapshot commit under the app's history lock.

use crate::runtime::protocol::AppId;
use crate::workspace::log::{SnapshotError, SnapshotLog};
use crate::workspace::models::CommitId;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Failure writing to or reading from an app workspace
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The relative path resolved outside the workspace root
    #[error("path '{path}' escapes the app workspace")]
    PathEscape { path: String },
    /// Plain filesystem failure
    #[error("file operation failed: {0}")]
    Io(#[from] io::Error),
    /// The file was written to disk but the follow-up commit failed;
    /// history is behind the workspace until a corrective commit
    #[error("file written but snapshot commit failed: {0}")]
    Commit(#[source] SnapshotError),
}

/// Applies file mutations and keeps history in sync
pub struct WorkspaceWriter {
    log: Arc<SnapshotLog>,
}

impl WorkspaceWriter {
    pub fn new(log: Arc<SnapshotLog>) -> Self {
        Self { log }
    }

    /// Write `content` to `rel_path` inside the workspace, then commit
    ///
    /// Intermediate directories are created as needed. The write and
    /// the commit run under the app's history lock so concurrent
    /// writes to one app serialize. A failed commit after a successful
    /// write is reported as `WorkspaceError::Commit`; the write itself
    /// stands.
    pub async fn write_file(
        &self,
        app_id: AppId,
        workspace: &Path,
        rel_path: &str,
        content: &str,
    ) -> Result<CommitId, WorkspaceError> {
        let full_path = resolve_workspace_path(workspace, rel_path)?;

        let lock = self.log.lock_for(app_id);
        let _guard = lock.lock().await;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full_path, content)?;

        self.log
            .commit_locked(workspace, &format!("Updated {}", rel_path))
            .map_err(WorkspaceError::Commit)
    }

    /// Read a file from the workspace, with the same containment check
    pub fn read_file(&self, workspace: &Path, rel_path: &str) -> Result<String, WorkspaceError> {
        let full_path = resolve_workspace_path(workspace, rel_path)?;
        Ok(fs::read_to_string(full_path)?)
    }
}

/// Resolve a client-supplied relative path against the workspace root
///
/// Rejects absolute paths and any `..` traversal before touching the
/// filesystem. A prefix comparison on the joined string is not enough
/// (`/apps/foo-evil` shares a prefix with `/apps/foo`), so the path is
/// judged component by component.
pub fn resolve_workspace_path(workspace: &Path, rel_path: &str) -> Result<PathBuf, WorkspaceError> {
    let escape = || WorkspaceError::PathEscape {
        path: rel_path.to_string(),
    };

    if rel_path.is_empty() {
        return Err(escape());
    }

    let mut resolved = PathBuf::new();
    for component in Path::new(rel_path).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(escape());
            }
        }
    }

    if resolved.as_os_str().is_empty() {
        return Err(escape());
    }

    Ok(workspace.join(resolved))
}
