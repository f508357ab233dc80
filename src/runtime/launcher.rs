// Process launcher: start/stop orchestration for app dev servers
//
// Ties the port allocator, process registry and event bus together.
// Start and stop for one app are serialized so a stop in progress can
// never race a concurrent start into a half-torn-down registry entry;
// different apps proceed independently.

use crate::runtime::config::Config;
use crate::runtime::events::EventBus;
use crate::runtime::ports::{PortAllocator, PortExhausted};
use crate::runtime::process::AppProcess;
use crate::runtime::protocol::{App, AppId};
use crate::runtime::registry::ProcessRegistry;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex;

/// Failure starting an app's process
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    PortUnavailable(#[from] PortExhausted),
    #[error("failed to spawn start command: {0}")]
    Spawn(#[source] io::Error),
}

pub struct ProcessLauncher {
    registry: Arc<ProcessRegistry>,
    ports: Arc<PortAllocator>,
    bus: Arc<EventBus>,
    stop_grace: std::time::Duration,
    default_command: Vec<String>,
    /// Per-app serialization of start/stop
    locks: StdMutex<HashMap<AppId, Arc<Mutex<()>>>>,
}

impl ProcessLauncher {
    pub fn new(
        config: &Config,
        registry: Arc<ProcessRegistry>,
        ports: Arc<PortAllocator>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            ports,
            bus,
            stop_grace: config.stop_grace,
            default_command: Config::default_start_command(),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, app_id: AppId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        Arc::clone(locks.entry(app_id).or_default())
    }

    /// Start the app's dev-server process in its workspace
    ///
    /// Returns the existing handle when the app is already running
    /// (start is idempotent; no second process is spawned). Otherwise
    /// picks a port - preferring the app's previously bound one - and
    /// spawns the start command with the port in its environment. The
    /// exit watcher releases the port and drops the registry entry
    /// when the process dies on its own.
    pub async fn start(&self, app: &App, workspace: &Path) -> Result<Arc<AppProcess>, LaunchError> {
        let lock = self.lock_for(app.id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.registry.lookup(app.id) {
            return Ok(existing);
        }

        let lease = self.ports.acquire(app.port)?;
        let command = app
            .start_command
            .clone()
            .unwrap_or_else(|| self.default_command.clone());

        let ports = Arc::clone(&self.ports);
        let registry = Arc::clone(&self.registry);
        let on_exit = Box::new(move |handle: Arc<AppProcess>| {
            ports.release(handle.port());
            registry.unregister_if_current(handle.app_id(), &handle);
        });

        let handle = AppProcess::spawn(
            app.id,
            &command,
            workspace,
            lease.port(),
            Arc::clone(&self.bus),
            on_exit,
        )
        .map_err(LaunchError::Spawn)?;
        // The spawned process now owns the port; release happens in
        // stop() or the exit watcher, whichever runs first
        lease.commit();

        self.registry.register(app.id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Stop the app's process
    ///
    /// No-op when the app has no registered process (a UI stop may race
    /// a process that already exited on its own). Sends the graceful
    /// signal, waits out the grace period, then force-kills; the port
    /// is released unconditionally and the registry entry is removed
    /// as the final step.
    pub async fn stop(&self, app_id: AppId) {
        let lock = self.lock_for(app_id);
        let _guard = lock.lock().await;

        let Some(handle) = self.registry.lookup(app_id) else {
            return;
        };

        handle.stop(self.stop_grace).await;
        self.ports.release(handle.port());
        self.registry.unregister(app_id);
    }

    /// The registry this launcher maintains
    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// The allocator backing this launcher's port leases
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::assert_eventually_bool;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_launcher(port_range: (u16, u16)) -> (ProcessLauncher, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            runtime_dir: temp_dir.path().to_path_buf(),
            state_dir: temp_dir.path().to_path_buf(),
            apps_dir: temp_dir.path().join("apps"),
            socket_path: temp_dir.path().join("daemon.sock"),
            pid_file: temp_dir.path().join("daemon.pid"),
            port_range,
            stop_grace: Duration::from_millis(500),
        };
        let launcher = ProcessLauncher::new(
            &config,
            ProcessRegistry::new(),
            PortAllocator::new(config.port_range),
            Arc::new(EventBus::new()),
        );
        (launcher, temp_dir)
    }

    fn sleeper_app(id: AppId) -> App {
        let mut app = App::new(id, format!("app-{}", id), None);
        app.start_command = Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "sleep 30".to_string(),
        ]);
        app
    }

    #[tokio::test]
    async fn test_start_registers_and_stop_clears() {
        let (launcher, temp) = test_launcher((48300, 48309));
        let app = sleeper_app(1);
        std::fs::create_dir_all(temp.path().join("apps/app-1")).unwrap();

        let handle = launcher
            .start(&app, &temp.path().join("apps/app-1"))
            .await
            .unwrap();
        assert!(handle.is_alive());
        assert_eq!(launcher.registry().count(), 1);
        assert_eq!(launcher.ports().leased_count(), 1);

        launcher.stop(app.id).await;
        assert_eq!(launcher.registry().count(), 0);
        assert_eq!(launcher.ports().leased_count(), 0);
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (launcher, temp) = test_launcher((48310, 48319));
        let app = sleeper_app(2);
        std::fs::create_dir_all(temp.path().join("apps/app-2")).unwrap();

        // Stopping an app that never started is a no-op, not an error
        launcher.stop(app.id).await;

        launcher
            .start(&app, &temp.path().join("apps/app-2"))
            .await
            .unwrap();
        launcher.stop(app.id).await;
        launcher.stop(app.id).await;

        assert_eq!(launcher.registry().count(), 0);
        assert_eq!(launcher.ports().leased_count(), 0);
    }

    #[tokio::test]
    async fn test_start_already_running_returns_existing_handle() {
        let (launcher, temp) = test_launcher((48320, 48329));
        let app = sleeper_app(3);
        std::fs::create_dir_all(temp.path().join("apps/app-3")).unwrap();
        let workspace = temp.path().join("apps/app-3");

        let first = launcher.start(&app, &workspace).await.unwrap();
        let second = launcher.start(&app, &workspace).await.unwrap();

        // Same process, same port, no duplicate spawn
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.port(), second.port());
        assert_eq!(launcher.registry().count(), 1);
        assert_eq!(launcher.ports().leased_count(), 1);

        launcher.stop(app.id).await;
    }

    #[tokio::test]
    async fn test_concurrent_apps_get_distinct_ports() {
        let (launcher, temp) = test_launcher((48330, 48339));

        let mut handles = Vec::new();
        for id in 1..=3 {
            let app = sleeper_app(id);
            let workspace = temp.path().join(format!("apps/app-{}", id));
            std::fs::create_dir_all(&workspace).unwrap();
            handles.push(launcher.start(&app, &workspace).await.unwrap());
        }

        let mut ports: Vec<u16> = handles.iter().map(|h| h.port()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 3, "each app must get its own port");

        for id in 1..=3 {
            launcher.stop(id).await;
        }
        assert_eq!(launcher.ports().leased_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_port() {
        let (launcher, temp) = test_launcher((48340, 48341));
        let mut app = App::new(4, "app-4".to_string(), None);
        app.start_command = Some(vec!["definitely-not-a-real-binary-here".to_string()]);
        let workspace = temp.path().join("apps/app-4");
        std::fs::create_dir_all(&workspace).unwrap();

        let err = launcher.start(&app, &workspace).await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn(_)));

        // The leased port went back to the pool and no entry was registered
        assert_eq!(launcher.ports().leased_count(), 0);
        assert_eq!(launcher.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_self_exit_cleans_up_registry_and_port() {
        let (launcher, temp) = test_launcher((48350, 48359));
        let mut app = App::new(5, "app-5".to_string(), None);
        app.start_command = Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "true".to_string(),
        ]);
        let workspace = temp.path().join("apps/app-5");
        std::fs::create_dir_all(&workspace).unwrap();

        launcher.start(&app, &workspace).await.unwrap();

        let registry = Arc::clone(launcher.registry());
        let ports = Arc::clone(launcher.ports());
        assert_eventually_bool(
            "exit watcher to clear registry and port",
            Duration::from_secs(5),
            Duration::from_millis(50),
            move || {
                let registry = Arc::clone(&registry);
                let ports = Arc::clone(&ports);
                async move { registry.count() == 0 && ports.leased_count() == 0 }
            },
        )
        .await;
    }

    #[tokio::test]
    async fn test_preferred_port_reused_on_restart() {
        let (launcher, temp) = test_launcher((48360, 48369));
        let mut app = sleeper_app(6);
        let workspace = temp.path().join("apps/app-6");
        std::fs::create_dir_all(&workspace).unwrap();

        let first = launcher.start(&app, &workspace).await.unwrap();
        let port = first.port();
        launcher.stop(app.id).await;

        app.port = Some(port);
        let second = launcher.start(&app, &workspace).await.unwrap();
        assert_eq!(second.port(), port);

        launcher.stop(app.id).await;
    }
}
