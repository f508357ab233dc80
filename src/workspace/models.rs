// Commit model for app workspace history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Commit identifier: truncated SHA-256 over the commit contents
pub type CommitId = String;

/// Relative file path -> UTF-8 content for one captured tree
pub type FileTree = BTreeMap<String, String>;

/// One immutable snapshot of an app's file tree
///
/// Commits form a linear chain: each has at most one child in the
/// active history, and only the first commit has no parent. History is
/// never rewritten; undo moves the per-app HEAD pointer to the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    /// Unique id, derived from parent, description, tree and timestamp
    pub id: CommitId,
    /// Previous commit in the chain; None for the initial commit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<CommitId>,
    /// Human-readable description of the change
    pub description: String,
    /// When the commit was captured
    pub created_at: DateTime<Utc>,
    /// Full workspace tree at this commit
    pub files: FileTree,
}

impl Commit {
    pub fn new(parent: Option<CommitId>, description: String, files: FileTree) -> Self {
        let created_at = Utc::now();
        let id = compute_id(parent.as_deref(), &description, &files, created_at);
        Self {
            id,
            parent,
            description,
            created_at,
            files,
        }
    }
}

/// Derive a commit id from the commit's contents
///
/// The timestamp participates so that re-committing an identical tree
/// still yields a distinct commit in the chain. Truncated to 16 hex
/// characters.
fn compute_id(
    parent: Option<&str>,
    description: &str,
    files: &FileTree,
    created_at: DateTime<Utc>,
) -> CommitId {
    let mut hasher = Sha256::new();
    hasher.update(parent.unwrap_or("").as_bytes());
    hasher.update([0]);
    hasher.update(description.as_bytes());
    hasher.update([0]);
    hasher.update(created_at.to_rfc3339().as_bytes());
    for (path, content) in files {
        hasher.update([0]);
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update(content.as_bytes());
    }
    let hash = hasher.finalize();

    hex::encode(&hash[..8])
}
