// Snapshot log: append-only commit history with a per-app HEAD pointer
//
// Implements the undo stack: commits form a linear parent chain stored
// as immutable files in the snapshot store; revert moves the pointer to
// the parent and re-materializes its tree, never deleting history.

use crate::runtime::protocol::AppId;
use crate::workspace::models::{Commit, CommitId};
use crate::workspace::store::SnapshotStore;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex;

/// Snapshot history failure
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Storage failed or history is in an unusable state
    #[error("snapshot repository error: {0}")]
    Repository(String),
    /// The current commit has no parent; the workspace is at its
    /// initial state and there is nothing left to undo
    #[error("already at the initial snapshot; nothing to undo")]
    NoHistory,
}

/// Append-only history of workspace states for all managed apps
///
/// Operations for one app are serialized through a per-app lock so two
/// commits can never interleave into a corrupted tree; apps do not
/// block each other.
pub struct SnapshotLog {
    store: SnapshotStore,
    locks: StdMutex<HashMap<AppId, Arc<Mutex<()>>>>,
}

impl SnapshotLog {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// The per-app lock serializing history operations
    ///
    /// The workspace writer holds this across its write + commit pair.
    pub(crate) fn lock_for(&self, app_id: AppId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(locks.entry(app_id).or_default())
    }

    /// Capture the workspace as a new commit and advance HEAD to it
    ///
    /// The new commit's parent is the current HEAD; history is lazily
    /// initialized by giving the first commit no parent. Returns the
    /// new commit id.
    pub async fn commit(
        &self,
        app_id: AppId,
        workspace: &Path,
        description: &str,
    ) -> Result<CommitId, SnapshotError> {
        let lock = self.lock_for(app_id);
        let _guard = lock.lock().await;
        self.commit_locked(workspace, description)
    }

    /// Commit while the caller already holds the app's lock
    pub(crate) fn commit_locked(
        &self,
        workspace: &Path,
        description: &str,
    ) -> Result<CommitId, SnapshotError> {
        if !self.store.is_available() {
            return Err(SnapshotError::Repository(
                "snapshot store is unavailable".to_string(),
            ));
        }

        let parent = self
            .store
            .read_head(workspace)
            .map_err(|e| SnapshotError::Repository(format!("failed to read HEAD: {}", e)))?;

        let files = self
            .store
            .capture_tree(workspace)
            .map_err(|e| SnapshotError::Repository(format!("failed to capture tree: {}", e)))?;

        let commit = Commit::new(parent, description.to_string(), files);

        self.store
            .write_commit(workspace, &commit)
            .map_err(|e| SnapshotError::Repository(format!("failed to write commit: {}", e)))?;

        // HEAD moves last: a crash before this point leaves the old
        // commit current and the new one unreferenced
        self.store
            .write_head(workspace, &commit.id)
            .map_err(|e| SnapshotError::Repository(format!("failed to write HEAD: {}", e)))?;

        Ok(commit.id)
    }

    /// Restore the parent of the current commit and move HEAD to it
    ///
    /// Fails with `NoHistory` when the current commit is the initial
    /// one. Returns the id of the commit that is now current.
    pub async fn revert_to_parent(
        &self,
        app_id: AppId,
        workspace: &Path,
    ) -> Result<CommitId, SnapshotError> {
        let lock = self.lock_for(app_id);
        let _guard = lock.lock().await;

        let head = self
            .store
            .read_head(workspace)
            .map_err(|e| SnapshotError::Repository(format!("failed to read HEAD: {}", e)))?
            .ok_or_else(|| {
                SnapshotError::Repository("workspace has no initialized history".to_string())
            })?;

        let current = self
            .store
            .read_commit(workspace, &head)
            .map_err(|e| SnapshotError::Repository(format!("failed to read commit: {}", e)))?;

        let parent_id = current.parent.ok_or(SnapshotError::NoHistory)?;

        let parent = self
            .store
            .read_commit(workspace, &parent_id)
            .map_err(|e| SnapshotError::Repository(format!("failed to read parent: {}", e)))?;

        self.store
            .materialize_tree(workspace, &parent)
            .map_err(|e| SnapshotError::Repository(format!("failed to restore tree: {}", e)))?;

        self.store
            .write_head(workspace, &parent_id)
            .map_err(|e| SnapshotError::Repository(format!("failed to write HEAD: {}", e)))?;

        Ok(parent_id)
    }

    /// Current commit id, None when history is uninitialized
    pub fn head(&self, workspace: &Path) -> Result<Option<CommitId>, SnapshotError> {
        self.store
            .read_head(workspace)
            .map_err(|e| SnapshotError::Repository(format!("failed to read HEAD: {}", e)))
    }
}
