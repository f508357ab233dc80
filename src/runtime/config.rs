// Environment configuration helpers for the daemon
// Handles platform-specific paths for sockets, PID files, state and
// app workspace directories, plus process-launch settings

use std::path::PathBuf;
use std::time::Duration;

/// Default inclusive port range scanned for app dev servers
const DEFAULT_PORT_RANGE: (u16, u16) = (32100, 32199);

/// Default grace period between SIGTERM and SIGKILL when stopping an app
const DEFAULT_STOP_GRACE_MS: u64 = 5_000;

/// Configuration for daemon paths and process-launch settings
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for runtime files (socket, PID)
    pub runtime_dir: PathBuf,
    /// Directory for persistent state (apps.json, snapshot history)
    pub state_dir: PathBuf,
    /// Root directory containing one workspace directory per app
    pub apps_dir: PathBuf,
    /// Path to the Unix socket
    pub socket_path: PathBuf,
    /// Path to the daemon PID file
    pub pid_file: PathBuf,
    /// Inclusive port range for app dev servers
    pub port_range: (u16, u16),
    /// Grace period before a stopped process is force-killed
    pub stop_grace: Duration,
}

impl Config {
    /// Create configuration using default paths
    pub fn default_paths() -> Self {
        let runtime_dir = Self::default_runtime_dir();
        let state_dir = Self::default_state_dir();

        Self {
            socket_path: runtime_dir.join("daemon.sock"),
            pid_file: runtime_dir.join("daemon.pid"),
            apps_dir: state_dir.join("apps"),
            runtime_dir,
            state_dir,
            port_range: DEFAULT_PORT_RANGE,
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
        }
    }

    /// Create configuration from environment variables, falling back to defaults
    ///
    /// APPDOCK_DAEMON_DIR overrides runtime_dir, state_dir and apps_dir at
    /// once; APPDOCK_APPS_DIR overrides the workspace root separately.
    /// APPDOCK_PORT_RANGE ("32100-32199") and APPDOCK_STOP_GRACE_MS tune
    /// process launching.
    pub fn from_env() -> Self {
        let mut config = if let Ok(override_dir) = std::env::var("APPDOCK_DAEMON_DIR") {
            let base = PathBuf::from(override_dir);
            Self {
                socket_path: base.join("daemon.sock"),
                pid_file: base.join("daemon.pid"),
                apps_dir: base.join("apps"),
                runtime_dir: base.clone(),
                state_dir: base,
                port_range: DEFAULT_PORT_RANGE,
                stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            }
        } else {
            Self::default_paths()
        };

        if let Ok(apps_dir) = std::env::var("APPDOCK_APPS_DIR") {
            config.apps_dir = PathBuf::from(apps_dir);
        }

        if let Ok(range) = std::env::var("APPDOCK_PORT_RANGE") {
            match parse_port_range(&range) {
                Some(parsed) => config.port_range = parsed,
                None => {
                    eprintln!(
                        "Warning: Ignoring invalid APPDOCK_PORT_RANGE '{}' (expected 'start-end')",
                        range
                    );
                }
            }
        }

        if let Ok(grace) = std::env::var("APPDOCK_STOP_GRACE_MS") {
            match grace.parse::<u64>() {
                Ok(ms) => config.stop_grace = Duration::from_millis(ms),
                Err(_) => {
                    eprintln!(
                        "Warning: Ignoring invalid APPDOCK_STOP_GRACE_MS '{}'",
                        grace
                    );
                }
            }
        }

        config
    }

    /// Get the default runtime directory (socket + pid)
    fn default_runtime_dir() -> PathBuf {
        #[cfg(target_os = "linux")]
        {
            // Linux: prefer XDG_RUNTIME_DIR if set, else fall back to state_dir
            if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
                PathBuf::from(runtime_dir).join("appdock")
            } else {
                Self::default_state_dir()
            }
        }

        #[cfg(not(target_os = "linux"))]
        {
            Self::default_state_dir()
        }
    }

    /// Get the default state directory (apps.json, snapshots, workspaces)
    fn default_state_dir() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".appdock"))
            .unwrap_or_else(|| PathBuf::from("/tmp/appdock"))
    }

    /// Get the apps.json file path
    pub fn apps_file(&self) -> PathBuf {
        self.state_dir.join("apps.json")
    }

    /// Base directory for per-app snapshot history
    pub fn snapshots_dir(&self) -> PathBuf {
        self.state_dir.join("snapshots")
    }

    /// Absolute workspace directory for an app's relative path
    pub fn app_workspace(&self, app_path: &str) -> PathBuf {
        self.apps_dir.join(app_path)
    }

    /// Ensure runtime, state and workspace directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(&self.apps_dir)?;

        // Runtime directory holds the socket, keep it owner-only
        std::fs::create_dir_all(&self.runtime_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.runtime_dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(())
    }

    /// The start command used for apps that do not define their own
    ///
    /// APPDOCK_START_COMMAND overrides (whitespace-separated).
    pub fn default_start_command() -> Vec<String> {
        if let Ok(command) = std::env::var("APPDOCK_START_COMMAND") {
            let parts: Vec<String> = command.split_whitespace().map(str::to_string).collect();
            if !parts.is_empty() {
                return parts;
            }
        }

        vec!["npm".to_string(), "run".to_string(), "dev".to_string()]
    }

    /// Write the daemon PID to the PID file
    pub fn write_pid(&self) -> std::io::Result<()> {
        self.ensure_dirs()?;
        std::fs::write(&self.pid_file, std::process::id().to_string())
    }

    /// Read the daemon PID from the PID file
    pub fn read_pid(&self) -> Option<u32> {
        std::fs::read_to_string(&self.pid_file)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Remove the PID file
    pub fn remove_pid(&self) -> std::io::Result<()> {
        if self.pid_file.exists() {
            std::fs::remove_file(&self.pid_file)
        } else {
            Ok(())
        }
    }

    /// Remove the socket file
    pub fn remove_socket(&self) -> std::io::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
        } else {
            Ok(())
        }
    }

    /// Check if the daemon socket exists (indicating daemon may be running)
    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Check if a process with the stored PID is still running
    #[cfg(unix)]
    pub fn is_daemon_running(&self) -> bool {
        if let Some(pid) = self.read_pid() {
            // Check if process exists by sending signal 0
            unsafe { libc::kill(pid as i32, 0) == 0 }
        } else {
            false
        }
    }

    // TODO(windows): Implement Windows process check
    #[cfg(not(unix))]
    pub fn is_daemon_running(&self) -> bool {
        self.socket_exists()
    }
}

fn parse_port_range(raw: &str) -> Option<(u16, u16)> {
    let (start, end) = raw.split_once('-')?;
    let start: u16 = start.trim().parse().ok()?;
    let end: u16 = end.trim().parse().ok()?;
    if start == 0 || start > end {
        return None;
    }
    Some((start, end))
}
