// Persistence helpers for the app registry
// Apps are persisted to <state_dir>/apps.json with file locking

use crate::runtime::config::Config;
use crate::runtime::protocol::{App, AppId};
use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

/// App registry persisted to disk
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AppRegistry {
    /// Next app ID to assign
    pub next_id: AppId,
    /// Map of app ID to app data
    pub apps: HashMap<AppId, App>,
}

impl AppRegistry {
    /// Load the app registry from disk, creating an empty one if it doesn't exist
    pub fn load(config: &Config) -> Result<Self> {
        let path = config.apps_file();

        if !path.exists() {
            return Ok(Self::default());
        }

        let mut file = File::open(&path)
            .with_context(|| format!("Failed to open apps file: {}", path.display()))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .with_context(|| format!("Failed to read apps file: {}", path.display()))?;

        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse apps file: {}", path.display()))
    }

    /// Save the app registry to disk with exclusive file locking
    pub fn save(&self, config: &Config) -> Result<()> {
        let path = config.apps_file();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to open apps file for writing: {}", path.display()))?;

        // Acquire exclusive lock (blocking)
        file.lock_exclusive()
            .with_context(|| "Failed to acquire exclusive lock on apps file")?;

        let contents =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize apps")?;

        file.write_all(contents.as_bytes())
            .with_context(|| "Failed to write apps file")?;

        // Lock is automatically released when file is dropped
        Ok(())
    }

    /// Allocate a new app ID
    pub fn allocate_id(&mut self) -> AppId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Insert an app into the registry
    pub fn insert(&mut self, app: App) {
        self.apps.insert(app.id, app);
    }

    /// Get an app by ID
    pub fn get(&self, id: AppId) -> Option<&App> {
        self.apps.get(&id)
    }

    /// Get a mutable reference to an app by ID
    pub fn get_mut(&mut self, id: AppId) -> Option<&mut App> {
        self.apps.get_mut(&id)
    }

    /// Remove an app by ID
    pub fn remove(&mut self, id: AppId) -> Option<App> {
        self.apps.remove(&id)
    }

    /// Find an app by name (exact, case-insensitive)
    pub fn find_by_name(&self, name: &str) -> Option<&App> {
        self.apps
            .values()
            .find(|a| a.name.to_lowercase() == name.to_lowercase())
    }

    /// Get all apps, sorted by ID for stable listings
    pub fn all_apps(&self) -> Vec<&App> {
        let mut apps: Vec<&App> = self.apps.values().collect();
        apps.sort_by_key(|a| a.id);
        apps
    }
}

/// Atomically save data to a file using write-to-temp + rename
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Invalid path: {}", path.display()))?;

    // Create temp file in same directory to ensure same filesystem for rename
    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown"),
        std::process::id()
    ));

    fs::write(&temp_path, contents)
        .with_context(|| format!("Failed to write temp file: {}", temp_path.display()))?;

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
