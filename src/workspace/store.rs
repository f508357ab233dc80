//! Snapshot store: disk I/O, paths, atomic writes, tree capture
//!
//! Provides the on-disk arena backing workspace history:
//! - Workspace-hash-based directory layout
//! - Atomic writes (temp file + fsync + rename)
//! - Strict file permissions (0600 files, 0700 dirs)
//! - Tree capture and materialization for commit/revert
//! - Bounded cleanup of stale temp files
//! - Availability flag with graceful degradation

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};

use super::models::{Commit, CommitId, FileTree};

/// Maximum number of files to scan per app history directory during cleanup
const CLEANUP_SCAN_LIMIT: usize = 1000;

/// Age threshold for temp file cleanup (1 hour)
const CLEANUP_AGE_THRESHOLD: Duration = Duration::from_secs(3600);

/// Directory names excluded from tree capture
///
/// Dependency and build output is regenerated by the dev server and
/// would bloat every commit.
const SKIPPED_DIRS: &[&str] = &["node_modules", "dist", "build", "target"];

/// Snapshot store for app workspace history
///
/// Manages on-disk storage under:
/// `<state_dir>/snapshots/<workspace-hash>/commits/<commit-id>.json`
/// with the per-app current pointer in
/// `<state_dir>/snapshots/<workspace-hash>/HEAD`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    /// Base directory: <state_dir>/snapshots/
    base_dir: PathBuf,
    /// Whether the store is available (base dir successfully created)
    available: bool,
}

impl SnapshotStore {
    /// Create a new snapshot store
    ///
    /// Attempts to create the base directory with strict permissions
    /// (0700). If creation fails, the store is marked unavailable and
    /// all operations return errors indicating unavailability.
    pub fn new(base_dir: PathBuf) -> Self {
        let available = Self::ensure_base_dir(&base_dir);

        Self {
            base_dir,
            available,
        }
    }

    /// Check if the store is available
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Ensure base directory exists with strict permissions
    fn ensure_base_dir(dir: &Path) -> bool {
        match fs::create_dir_all(dir) {
            Ok(()) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                        eprintln!(
                            "Warning: Failed to set permissions on {}: {}",
                            dir.display(),
                            e
                        );
                        return false;
                    }
                }
                true
            }
            Err(e) => {
                eprintln!(
                    "Error: Failed to create snapshot base directory {}: {}",
                    dir.display(),
                    e
                );
                false
            }
        }
    }

    /// Compute the history directory hash from a canonical workspace path
    ///
    /// Returns SHA-256 truncated to 16 hex characters.
    pub fn workspace_hash(workspace: &Path) -> String {
        let canonical = workspace
            .canonicalize()
            .unwrap_or_else(|_| workspace.to_path_buf());

        let mut hasher = Sha256::new();
        hasher.update(canonical.as_os_str().as_encoded_bytes());
        let hash = hasher.finalize();

        hex::encode(&hash[..8])
    }

    /// History directory for a workspace
    fn history_dir(&self, workspace: &Path) -> PathBuf {
        self.base_dir.join(Self::workspace_hash(workspace))
    }

    fn commits_dir(&self, workspace: &Path) -> PathBuf {
        self.history_dir(workspace).join("commits")
    }

    fn head_path(&self, workspace: &Path) -> PathBuf {
        self.history_dir(workspace).join("HEAD")
    }

    fn commit_path(&self, workspace: &Path, commit_id: &str) -> PathBuf {
        self.commits_dir(workspace).join(format!("{}.json", commit_id))
    }

    /// Ensure the commits directory exists with strict permissions
    fn ensure_commits_dir(&self, workspace: &Path) -> io::Result<PathBuf> {
        if !self.available {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "SnapshotStore is unavailable (base directory creation failed)",
            ));
        }

        let commits_dir = self.commits_dir(workspace);
        fs::create_dir_all(&commits_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let history_dir = self.history_dir(workspace);
            for dir in [&history_dir, &commits_dir] {
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }

        Ok(commits_dir)
    }

    /// Write a commit to disk atomically
    ///
    /// Uses temp file + fsync + rename so readers never see partial
    /// writes. Files are created with 0600 permissions on Unix.
    pub fn write_commit(&self, workspace: &Path, commit: &Commit) -> io::Result<PathBuf> {
        let commits_dir = self.ensure_commits_dir(workspace)?;
        let final_path = self.commit_path(workspace, &commit.id);

        let json = serde_json::to_string_pretty(commit)?;
        atomic_write_file(&commits_dir, &final_path, json.as_bytes())?;

        Ok(final_path)
    }

    /// Read a commit by id
    pub fn read_commit(&self, workspace: &Path, commit_id: &str) -> io::Result<Commit> {
        if !self.available {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "SnapshotStore is unavailable",
            ));
        }

        let path = self.commit_path(workspace, commit_id);
        let content = fs::read_to_string(&path)?;
        let commit: Commit = serde_json::from_str(&content)?;
        Ok(commit)
    }

    /// Read the current pointer, None when history is uninitialized
    pub fn read_head(&self, workspace: &Path) -> io::Result<Option<CommitId>> {
        if !self.available {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "SnapshotStore is unavailable",
            ));
        }

        let path = self.head_path(workspace);
        match fs::read_to_string(&path) {
            Ok(content) => {
                let trimmed = content.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(trimmed.to_string()))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Move the current pointer; written atomically and always last in
    /// a commit/revert so a crash leaves the previous state current
    pub fn write_head(&self, workspace: &Path, commit_id: &str) -> io::Result<()> {
        self.ensure_commits_dir(workspace)?;
        let history_dir = self.history_dir(workspace);
        let head_path = self.head_path(workspace);
        atomic_write_file(&history_dir, &head_path, commit_id.as_bytes())
    }

    /// Capture the workspace's current file tree
    ///
    /// Dot-directories and dependency/build output are excluded.
    /// Non-UTF-8 files are skipped with a warning; the workspace is an
    /// AI-edited source tree, so text is the norm.
    pub fn capture_tree(&self, workspace: &Path) -> io::Result<FileTree> {
        let mut files = BTreeMap::new();

        if !workspace.exists() {
            return Ok(files);
        }

        for entry in walkdir::WalkDir::new(workspace)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !is_skipped_dir(e))
        {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = entry
                .path()
                .strip_prefix(workspace)
                .map_err(io::Error::other)?
                .to_string_lossy()
                .into_owned();

            match fs::read_to_string(entry.path()) {
                Ok(content) => {
                    files.insert(rel, content);
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    eprintln!(
                        "Warning: Skipping non-UTF-8 file in capture: {}",
                        entry.path().display()
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Ok(files)
    }

    /// Materialize a commit's tree onto the workspace directory
    ///
    /// Every file is written via temp + rename, so other processes
    /// inspecting the directory never observe a partially written
    /// file. Files tracked on disk but absent from the commit are
    /// removed afterwards, then emptied directories are pruned.
    pub fn materialize_tree(&self, workspace: &Path, commit: &Commit) -> io::Result<()> {
        fs::create_dir_all(workspace)?;

        for (rel, content) in &commit.files {
            let full_path = workspace.join(rel);
            let parent = full_path.parent().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "commit path has no parent")
            })?;
            fs::create_dir_all(parent)?;
            atomic_write_file(parent, &full_path, content.as_bytes())?;
        }

        // Remove files the target commit does not contain
        let current = self.capture_tree(workspace)?;
        for rel in current.keys() {
            if !commit.files.contains_key(rel) {
                let path = workspace.join(rel);
                if let Err(e) = fs::remove_file(&path) {
                    eprintln!(
                        "Warning: Failed to remove {} during revert: {}",
                        path.display(),
                        e
                    );
                }
            }
        }

        prune_empty_dirs(workspace);

        Ok(())
    }

    /// Delete all history for a workspace (commits + HEAD)
    pub fn delete_history(&self, workspace: &Path) -> io::Result<()> {
        let history_dir = self.history_dir(workspace);
        if history_dir.exists() {
            fs::remove_dir_all(&history_dir)?;
        }
        Ok(())
    }

    /// Cleanup stale temp files in a workspace's history directory
    ///
    /// Deletes *.tmp.* files older than CLEANUP_AGE_THRESHOLD (1 hour).
    /// Scans at most CLEANUP_SCAN_LIMIT files to avoid blocking startup.
    ///
    /// Returns (deleted_count, scanned_count, hit_limit)
    pub fn cleanup_stale_temps(&self, workspace: &Path) -> io::Result<(usize, usize, bool)> {
        if !self.available {
            return Ok((0, 0, false));
        }

        let history_dir = self.history_dir(workspace);
        if !history_dir.exists() {
            return Ok((0, 0, false));
        }

        let mut scanned = 0;
        let mut deleted = 0;
        let now = SystemTime::now();

        for entry in walkdir::WalkDir::new(&history_dir)
            .max_depth(2) // <workspace-hash>/commits/<file>
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if scanned >= CLEANUP_SCAN_LIMIT {
                eprintln!(
                    "Warning: Hit cleanup scan limit ({}) for {}",
                    CLEANUP_SCAN_LIMIT,
                    history_dir.display()
                );
                return Ok((deleted, scanned, true));
            }

            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            scanned += 1;

            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if name.contains(".tmp.") {
                    if let Ok(metadata) = fs::metadata(path) {
                        if let Ok(modified) = metadata.modified() {
                            if let Ok(age) = now.duration_since(modified) {
                                if age > CLEANUP_AGE_THRESHOLD {
                                    if let Err(e) = fs::remove_file(path) {
                                        eprintln!(
                                            "Warning: Failed to delete stale temp file {}: {}",
                                            path.display(),
                                            e
                                        );
                                    } else {
                                        deleted += 1;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok((deleted, scanned, false))
    }
}

/// Whether a walked entry is a directory excluded from capture
fn is_skipped_dir(entry: &walkdir::DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.') || SKIPPED_DIRS.contains(&name))
        .unwrap_or(false)
}

/// Write bytes to `final_path` via a temp file in `dir` + fsync + rename
fn atomic_write_file(dir: &Path, final_path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_name = format!(
        "{}.tmp.{}",
        final_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown"),
        std::process::id()
    );
    let temp_path = dir.join(&temp_name);

    let mut file = fs::File::create(&temp_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(bytes)?;
    file.sync_all()?; // fsync
    drop(file);

    fs::rename(&temp_path, final_path)?;

    Ok(())
}

/// Remove directories a revert emptied out, deepest first
fn prune_empty_dirs(workspace: &Path) {
    let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(workspace)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();

    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        // Fails (and is ignored) for non-empty directories
        let _ = fs::remove_dir(&dir);
    }
}
