// appdock-daemon: Background daemon for managing AI-edited app workspaces
//
// Responsibilities:
// - Own the app registry and persist it to apps.json
// - Apply validated file writes and keep snapshot history in sync
// - Spawn/stop per-app dev-server processes on allocated ports
// - Route process output through the event bus to subscribed clients
// - Expose a Unix socket protocol for UI/CLI communication

use anyhow::{Context, Result};
use appdock::runtime::{
    config::Config,
    events::{EventBus, StreamCallbacks, SubscriptionToken},
    launcher::{LaunchError, ProcessLauncher},
    persistence::AppRegistry,
    ports::PortAllocator,
    protocol::{
        deserialize_message, serialize_message, App, AppId, CorrelationId, DaemonErrorCode,
        DaemonNotification, DaemonRequest, DaemonResponse, MAX_REQUEST_FRAME_SIZE,
        PROTOCOL_VERSION,
    },
    registry::ProcessRegistry,
};
use appdock::workspace::{
    log::{SnapshotError, SnapshotLog},
    store::SnapshotStore,
    writer::{WorkspaceWriter, WorkspaceError},
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::sync::{mpsc, RwLock};

const DEFAULT_TAIL_BYTES: usize = 4 * 1024;

/// Daemon state shared across all client connections
struct DaemonState {
    config: Config,
    apps: RwLock<AppRegistry>,
    snapshots: Arc<SnapshotLog>,
    writer: WorkspaceWriter,
    processes: Arc<ProcessRegistry>,
    launcher: ProcessLauncher,
    /// Single event bus instance injected into all producers
    bus: Arc<EventBus>,
}

impl DaemonState {
    fn new(config: Config) -> Result<Self> {
        // Load existing app registry or create an empty one
        let apps = AppRegistry::load(&config)?;

        let snapshots = Arc::new(SnapshotLog::new(SnapshotStore::new(config.snapshots_dir())));
        let writer = WorkspaceWriter::new(Arc::clone(&snapshots));

        let bus = Arc::new(EventBus::new());
        let processes = ProcessRegistry::new();
        let launcher = ProcessLauncher::new(
            &config,
            Arc::clone(&processes),
            PortAllocator::new(config.port_range),
            Arc::clone(&bus),
        );

        Ok(Self {
            config,
            apps: RwLock::new(apps),
            snapshots,
            writer,
            processes,
            launcher,
            bus,
        })
    }

    /// Save the app registry to disk
    async fn save_apps(&self) -> Result<()> {
        let apps = self.apps.read().await;
        apps.save(&self.config)
    }

    /// Absolute workspace directory for an app
    fn workspace_for(&self, app: &App) -> PathBuf {
        self.config.app_workspace(&app.path)
    }

    /// Sweep leftover temp files out of every app's history directory
    fn cleanup_stale_history_temps(&self, apps: &AppRegistry) {
        for app in apps.all_apps() {
            let workspace = self.workspace_for(app);
            match self.snapshots.store().cleanup_stale_temps(&workspace) {
                Ok((deleted, _, _)) if deleted > 0 => {
                    eprintln!(
                        "Cleaned {} stale temp file(s) for app '{}'",
                        deleted, app.name
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("Warning: Temp cleanup failed for app '{}': {}", app.name, e);
                }
            }
        }
    }

    /// Stop every running app process (used during shutdown)
    async fn stop_all_apps(&self) {
        for app_id in self.processes.running_apps() {
            self.launcher.stop(app_id).await;
        }
    }
}

/// Per-connection state: where notifications go and which event-bus
/// subscriptions this connection owns
struct ConnectionContext {
    notify_tx: mpsc::UnboundedSender<DaemonNotification>,
    tokens: HashMap<u64, SubscriptionToken>,
}

impl ConnectionContext {
    fn new(notify_tx: mpsc::UnboundedSender<DaemonNotification>) -> Self {
        Self {
            notify_tx,
            tokens: HashMap::new(),
        }
    }

    /// Drop every subscription this connection still holds
    fn cancel_all(&mut self, bus: &EventBus) {
        for (_, token) in self.tokens.drain() {
            bus.unsubscribe(token);
        }
    }
}

/// Handle a single client connection
async fn handle_client(
    state: Arc<DaemonState>,
    mut stream: UnixStream,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    // Streamed events subscribed on this connection arrive here
    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<DaemonNotification>();
    let mut conn = ConnectionContext::new(notify_tx);

    loop {
        tokio::select! {
            // Handle incoming requests
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => {
                        // Client disconnected
                        break;
                    }
                    Ok(_) => {
                        // Enforce max request frame size (1MB)
                        let response = if line.len() > MAX_REQUEST_FRAME_SIZE {
                            DaemonResponse::Error {
                                code: DaemonErrorCode::InvalidRequest,
                                message: format!(
                                    "Request frame too large: {} bytes (max {})",
                                    line.len(),
                                    MAX_REQUEST_FRAME_SIZE
                                ),
                            }
                        } else {
                            match deserialize_message::<DaemonRequest>(line.as_bytes()) {
                                Ok(request) => {
                                    handle_request(&state, request, &shutdown_tx, &mut conn).await
                                }
                                Err(e) => DaemonResponse::Error {
                                    code: DaemonErrorCode::InvalidRequest,
                                    message: format!("Failed to parse request: {}", e),
                                },
                            }
                        };

                        let bytes = serialize_message(&response)?;
                        writer.write_all(&bytes).await?;
                        writer.flush().await?;

                        line.clear();
                    }
                    Err(e) => {
                        eprintln!("Error reading from client: {}", e);
                        break;
                    }
                }
            }

            // Forward streamed events to the client
            notification = notify_rx.recv() => {
                match notification {
                    Some(notification) => {
                        let bytes = serialize_message(&notification)?;
                        if writer.write_all(&bytes).await.is_err() {
                            break; // Client disconnected
                        }
                        let _ = writer.flush().await;
                    }
                    None => break,
                }
            }
        }
    }

    // A vanished client must not keep receiving events
    conn.cancel_all(&state.bus);

    Ok(())
}

/// Handle a single request from a client
async fn handle_request(
    state: &Arc<DaemonState>,
    request: DaemonRequest,
    shutdown_tx: &mpsc::Sender<()>,
    conn: &mut ConnectionContext,
) -> DaemonResponse {
    match request {
        DaemonRequest::Handshake { client_version } => {
            if client_version != PROTOCOL_VERSION {
                let message = if client_version < PROTOCOL_VERSION {
                    "Daemon is newer than client—please update the client.".to_string()
                } else {
                    "Daemon is outdated—please restart daemon.".to_string()
                };
                return DaemonResponse::Error {
                    code: DaemonErrorCode::VersionMismatch,
                    message,
                };
            }
            DaemonResponse::Handshake {
                protocol_version: PROTOCOL_VERSION,
            }
        }

        DaemonRequest::Ping => DaemonResponse::Pong,

        DaemonRequest::Shutdown => {
            // Signal main loop to shut down
            let _ = shutdown_tx.send(()).await;
            DaemonResponse::ShuttingDown
        }

        DaemonRequest::CreateApp {
            name,
            start_command,
        } => {
            if let Err(reason) = validate_app_name(&name) {
                return DaemonResponse::Error {
                    code: DaemonErrorCode::InvalidRequest,
                    message: format!("Invalid app name '{}': {}", name, reason),
                };
            }

            let mut apps = state.apps.write().await;

            if apps.find_by_name(&name).is_some() {
                return DaemonResponse::Error {
                    code: DaemonErrorCode::InvalidRequest,
                    message: format!("An app named '{}' already exists", name),
                };
            }

            let id = apps.allocate_id();
            let app = App::new(id, name, start_command);
            let workspace = state.workspace_for(&app);

            if let Err(e) = std::fs::create_dir_all(&workspace) {
                return DaemonResponse::Error {
                    code: DaemonErrorCode::Internal,
                    message: format!(
                        "Failed to create workspace {}: {}",
                        workspace.display(),
                        e
                    ),
                };
            }

            // Root commit of the empty workspace; every undo chain
            // terminates here
            if let Err(e) = state.snapshots.commit(id, &workspace, "Initial snapshot").await {
                let _ = std::fs::remove_dir_all(&workspace);
                return DaemonResponse::Error {
                    code: DaemonErrorCode::Repository,
                    message: format!("Failed to initialize history: {}", e),
                };
            }

            apps.insert(app.clone());

            drop(apps);
            if let Err(e) = state.save_apps().await {
                return DaemonResponse::Error {
                    code: DaemonErrorCode::Internal,
                    message: format!("Failed to save apps: {}", e),
                };
            }

            DaemonResponse::AppCreated { app }
        }

        DaemonRequest::ListApps => {
            let apps = state.apps.read().await;
            DaemonResponse::AppList {
                apps: apps.all_apps().into_iter().cloned().collect(),
            }
        }

        DaemonRequest::GetApp { app_id } => {
            let apps = state.apps.read().await;
            match apps.get(app_id) {
                Some(app) => DaemonResponse::AppStatus {
                    app: app.clone(),
                    running: state.processes.lookup(app_id).is_some(),
                },
                None => not_found(app_id),
            }
        }

        DaemonRequest::DeleteApp { app_id } => {
            let app = {
                let apps = state.apps.read().await;
                match apps.get(app_id) {
                    Some(app) => app.clone(),
                    None => return not_found(app_id),
                }
            };

            // Tear the process down before removing anything it uses
            state.launcher.stop(app_id).await;

            {
                let mut apps = state.apps.write().await;
                apps.remove(app_id);
            }
            if let Err(e) = state.save_apps().await {
                return DaemonResponse::Error {
                    code: DaemonErrorCode::Internal,
                    message: format!("Failed to save apps: {}", e),
                };
            }

            let workspace = state.workspace_for(&app);
            if let Err(e) = state.snapshots.store().delete_history(&workspace) {
                eprintln!(
                    "Warning: Failed to delete history for app {}: {}",
                    app_id, e
                );
            }
            if workspace.exists() {
                if let Err(e) = std::fs::remove_dir_all(&workspace) {
                    eprintln!(
                        "Warning: Failed to delete workspace {}: {}",
                        workspace.display(),
                        e
                    );
                }
            }

            DaemonResponse::AppDeleted { app_id }
        }

        DaemonRequest::WriteFile {
            app_id,
            path,
            content,
        } => {
            let app = {
                let apps = state.apps.read().await;
                match apps.get(app_id) {
                    Some(app) => app.clone(),
                    None => return not_found(app_id),
                }
            };
            let workspace = state.workspace_for(&app);

            match state
                .writer
                .write_file(app_id, &workspace, &path, &content)
                .await
            {
                Ok(commit_id) => {
                    touch_app(state, app_id).await;
                    DaemonResponse::FileWritten { app_id, commit_id }
                }
                Err(e) => workspace_error_response(e),
            }
        }

        DaemonRequest::ReadFile { app_id, path } => {
            let app = {
                let apps = state.apps.read().await;
                match apps.get(app_id) {
                    Some(app) => app.clone(),
                    None => return not_found(app_id),
                }
            };
            let workspace = state.workspace_for(&app);

            match state.writer.read_file(&workspace, &path) {
                Ok(content) => DaemonResponse::FileContent {
                    app_id,
                    path,
                    content,
                },
                Err(WorkspaceError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    DaemonResponse::Error {
                        code: DaemonErrorCode::NotFound,
                        message: format!("No file '{}' in app {}", path, app_id),
                    }
                }
                Err(e) => workspace_error_response(e),
            }
        }

        DaemonRequest::Undo { app_id } => {
            let app = {
                let apps = state.apps.read().await;
                match apps.get(app_id) {
                    Some(app) => app.clone(),
                    None => return not_found(app_id),
                }
            };
            let workspace = state.workspace_for(&app);

            match state.snapshots.revert_to_parent(app_id, &workspace).await {
                Ok(commit_id) => {
                    touch_app(state, app_id).await;
                    DaemonResponse::Undone { app_id, commit_id }
                }
                Err(SnapshotError::NoHistory) => DaemonResponse::Error {
                    code: DaemonErrorCode::NoHistory,
                    message: format!("App {} is already at its initial state", app_id),
                },
                Err(e @ SnapshotError::Repository(_)) => DaemonResponse::Error {
                    code: DaemonErrorCode::Repository,
                    message: e.to_string(),
                },
            }
        }

        DaemonRequest::StartApp { app_id } => {
            let app = {
                let apps = state.apps.read().await;
                match apps.get(app_id) {
                    Some(app) => app.clone(),
                    None => return not_found(app_id),
                }
            };
            let workspace = state.workspace_for(&app);

            match state.launcher.start(&app, &workspace).await {
                Ok(handle) => {
                    let port = handle.port();

                    // Remember the bound port so restarts prefer it
                    let updated = {
                        let mut apps = state.apps.write().await;
                        if let Some(app) = apps.get_mut(app_id) {
                            app.port = Some(port);
                            app.updated_at = chrono::Utc::now();
                            app.clone()
                        } else {
                            app
                        }
                    };
                    if let Err(e) = state.save_apps().await {
                        eprintln!("Warning: Failed to save apps after start: {}", e);
                    }

                    DaemonResponse::AppStarted { app: updated, port }
                }
                Err(e @ LaunchError::PortUnavailable(_)) => DaemonResponse::Error {
                    code: DaemonErrorCode::PortUnavailable,
                    message: e.to_string(),
                },
                Err(e @ LaunchError::Spawn(_)) => DaemonResponse::Error {
                    code: DaemonErrorCode::Spawn,
                    message: e.to_string(),
                },
            }
        }

        DaemonRequest::StopApp { app_id } => {
            {
                let apps = state.apps.read().await;
                if apps.get(app_id).is_none() {
                    return not_found(app_id);
                }
            }

            // Idempotent: stopping an app with no process is a no-op
            state.launcher.stop(app_id).await;
            DaemonResponse::AppStopped { app_id }
        }

        DaemonRequest::TailOutput { app_id, bytes } => {
            {
                let apps = state.apps.read().await;
                if apps.get(app_id).is_none() {
                    return not_found(app_id);
                }
            }

            match state.processes.expect_running(app_id) {
                Ok(handle) => DaemonResponse::OutputTail {
                    app_id,
                    data: handle.recent_output(bytes.unwrap_or(DEFAULT_TAIL_BYTES)),
                },
                Err(e) => DaemonResponse::Error {
                    code: DaemonErrorCode::NotRunning,
                    message: e.to_string(),
                },
            }
        }

        DaemonRequest::SubscribeOutput { app_id } => {
            {
                let apps = state.apps.read().await;
                if apps.get(app_id).is_none() {
                    return not_found(app_id);
                }
            }

            let correlation_id = CorrelationId::App(app_id);
            let chunk_tx = conn.notify_tx.clone();
            let end_tx = conn.notify_tx.clone();
            let error_tx = conn.notify_tx.clone();

            let token = state.bus.subscribe(
                correlation_id,
                StreamCallbacks {
                    on_chunk: Box::new(move |payload| {
                        let _ = chunk_tx.send(DaemonNotification::Chunk {
                            correlation_id,
                            payload,
                        });
                    }),
                    on_end: Box::new(move |result| {
                        let _ = end_tx.send(DaemonNotification::End {
                            correlation_id,
                            result,
                        });
                    }),
                    on_error: Box::new(move |message| {
                        let _ = error_tx.send(DaemonNotification::StreamError {
                            correlation_id,
                            message,
                        });
                    }),
                },
            );

            conn.tokens.insert(token.id(), token);
            DaemonResponse::Subscribed {
                app_id,
                token: token.id(),
            }
        }

        DaemonRequest::UnsubscribeOutput { token } => {
            if let Some(subscription) = conn.tokens.remove(&token) {
                state.bus.unsubscribe(subscription);
            }
            DaemonResponse::Unsubscribed { token }
        }
    }
}

fn not_found(app_id: AppId) -> DaemonResponse {
    DaemonResponse::Error {
        code: DaemonErrorCode::NotFound,
        message: format!("App {} not found", app_id),
    }
}

/// Translate a workspace error into its wire code
fn workspace_error_response(error: WorkspaceError) -> DaemonResponse {
    let code = match &error {
        WorkspaceError::PathEscape { .. } => DaemonErrorCode::PathEscape,
        WorkspaceError::Commit(_) => DaemonErrorCode::Commit,
        WorkspaceError::Io(_) => DaemonErrorCode::Internal,
    };
    DaemonResponse::Error {
        code,
        message: error.to_string(),
    }
}

/// Bump an app's updated_at and persist, tolerating save failures
async fn touch_app(state: &Arc<DaemonState>, app_id: AppId) {
    {
        let mut apps = state.apps.write().await;
        if let Some(app) = apps.get_mut(app_id) {
            app.updated_at = chrono::Utc::now();
        }
    }
    if let Err(e) = state.save_apps().await {
        eprintln!("Warning: Failed to save apps: {}", e);
    }
}

/// App names become workspace directory names; keep them boring
fn validate_app_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name must not be empty");
    }
    if name.len() > 64 {
        return Err("name must be at most 64 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err("only ASCII letters, digits, '-' and '_' are allowed");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env();

    config
        .ensure_dirs()
        .context("Failed to create data directories")?;

    // Clean up stale socket if exists
    if config.socket_exists() {
        if config.is_daemon_running() {
            eprintln!("Daemon already running (PID: {:?})", config.read_pid());
            std::process::exit(1);
        }
        config
            .remove_socket()
            .context("Failed to remove stale socket")?;
    }

    config.write_pid().context("Failed to write PID file")?;

    let state = Arc::new(DaemonState::new(config.clone())?);

    // Sweep temp files left behind by a previous crash
    {
        let apps = state.apps.read().await;
        state.cleanup_stale_history_temps(&apps);
    }

    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("Failed to bind socket: {}", config.socket_path.display()))?;

    // Secure socket permissions (Unix only - owner-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config.socket_path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| {
                format!(
                    "Failed to set socket permissions: {}",
                    config.socket_path.display()
                )
            })?;
    }

    println!("Daemon listening on {}", config.socket_path.display());

    // Shutdown signal channel
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    // Handle SIGTERM/SIGINT for graceful shutdown
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        let _ = shutdown_tx_clone.send(()).await;
    });

    // Accept connections until shutdown
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let state = Arc::clone(&state);
                        let shutdown_tx = shutdown_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(state, stream, shutdown_tx).await {
                                eprintln!("Client error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        eprintln!("Accept error: {}", e);
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                println!("Shutting down daemon...");
                break;
            }
        }
    }

    // Stop every running app before releasing the socket
    state.stop_all_apps().await;

    config.remove_pid().ok();
    config.remove_socket().ok();

    println!("Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use appdock::runtime::protocol::{OutputSource, StreamPayload, StreamResult};
    use appdock::test_utils::assert_eventually_bool;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            runtime_dir: temp_dir.path().to_path_buf(),
            state_dir: temp_dir.path().to_path_buf(),
            apps_dir: temp_dir.path().join("apps"),
            socket_path: temp_dir.path().join("daemon.sock"),
            pid_file: temp_dir.path().join("daemon.pid"),
            port_range: (48400, 48499),
            stop_grace: Duration::from_millis(500),
        };
        (config, temp_dir)
    }

    struct TestClient {
        state: Arc<DaemonState>,
        shutdown_tx: mpsc::Sender<()>,
        conn: ConnectionContext,
        notify_rx: mpsc::UnboundedReceiver<DaemonNotification>,
    }

    impl TestClient {
        fn new(config: Config) -> Self {
            let state = Arc::new(DaemonState::new(config).unwrap());
            let (shutdown_tx, _) = mpsc::channel::<()>(1);
            let (notify_tx, notify_rx) = mpsc::unbounded_channel();
            Self {
                state,
                shutdown_tx,
                conn: ConnectionContext::new(notify_tx),
                notify_rx,
            }
        }

        async fn request(&mut self, request: DaemonRequest) -> DaemonResponse {
            handle_request(&self.state, request, &self.shutdown_tx, &mut self.conn).await
        }

        async fn create_app(&mut self, name: &str, start_command: Option<Vec<String>>) -> App {
            match self
                .request(DaemonRequest::CreateApp {
                    name: name.to_string(),
                    start_command,
                })
                .await
            {
                DaemonResponse::AppCreated { app } => app,
                other => panic!("Expected AppCreated, got {:?}", other),
            }
        }

        async fn write_file(&mut self, app_id: AppId, path: &str, content: &str) -> String {
            match self
                .request(DaemonRequest::WriteFile {
                    app_id,
                    path: path.to_string(),
                    content: content.to_string(),
                })
                .await
            {
                DaemonResponse::FileWritten { commit_id, .. } => commit_id,
                other => panic!("Expected FileWritten, got {:?}", other),
            }
        }

        async fn read_file(&mut self, app_id: AppId, path: &str) -> DaemonResponse {
            self.request(DaemonRequest::ReadFile {
                app_id,
                path: path.to_string(),
            })
            .await
        }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn error_code(response: &DaemonResponse) -> DaemonErrorCode {
        match response {
            DaemonResponse::Error { code, .. } => *code,
            other => panic!("Expected error response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_and_ping() {
        let (config, _temp) = test_config();
        let mut client = TestClient::new(config);

        let response = client
            .request(DaemonRequest::Handshake {
                client_version: PROTOCOL_VERSION,
            })
            .await;
        assert!(matches!(response, DaemonResponse::Handshake { .. }));

        let response = client
            .request(DaemonRequest::Handshake { client_version: 99 })
            .await;
        assert_eq!(error_code(&response), DaemonErrorCode::VersionMismatch);

        assert!(matches!(
            client.request(DaemonRequest::Ping).await,
            DaemonResponse::Pong
        ));
    }

    #[tokio::test]
    async fn test_create_app_initializes_history() {
        let (config, _temp) = test_config();
        let mut client = TestClient::new(config);

        let app = client.create_app("my-blog", None).await;
        assert_eq!(app.name, "my-blog");

        // Workspace directory exists and history has a root commit
        let workspace = client.state.workspace_for(&app);
        assert!(workspace.exists());
        let head = client.state.snapshots.head(&workspace).unwrap();
        assert!(head.is_some());

        // Registry survives a reload
        let reloaded = AppRegistry::load(&client.state.config).unwrap();
        assert!(reloaded.get(app.id).is_some());
    }

    #[tokio::test]
    async fn test_create_app_rejects_bad_and_duplicate_names() {
        let (config, _temp) = test_config();
        let mut client = TestClient::new(config);

        let too_long = "x".repeat(65);
        for bad in ["", "has space", "dots.are.out", too_long.as_str()] {
            let response = client
                .request(DaemonRequest::CreateApp {
                    name: bad.to_string(),
                    start_command: None,
                })
                .await;
            assert_eq!(
                error_code(&response),
                DaemonErrorCode::InvalidRequest,
                "name '{}' should be rejected",
                bad
            );
        }

        client.create_app("taken", None).await;
        let response = client
            .request(DaemonRequest::CreateApp {
                name: "TAKEN".to_string(),
                start_command: None,
            })
            .await;
        assert_eq!(error_code(&response), DaemonErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_unknown_app_is_not_found() {
        let (config, _temp) = test_config();
        let mut client = TestClient::new(config);

        let requests = vec![
            DaemonRequest::GetApp { app_id: 42 },
            DaemonRequest::DeleteApp { app_id: 42 },
            DaemonRequest::WriteFile {
                app_id: 42,
                path: "index.html".to_string(),
                content: String::new(),
            },
            DaemonRequest::ReadFile {
                app_id: 42,
                path: "index.html".to_string(),
            },
            DaemonRequest::Undo { app_id: 42 },
            DaemonRequest::StartApp { app_id: 42 },
            DaemonRequest::StopApp { app_id: 42 },
            DaemonRequest::TailOutput {
                app_id: 42,
                bytes: None,
            },
            DaemonRequest::SubscribeOutput { app_id: 42 },
        ];

        for request in requests {
            let response = client.request(request.clone()).await;
            assert_eq!(
                error_code(&response),
                DaemonErrorCode::NotFound,
                "request {:?} should report NotFound",
                request
            );
        }
    }

    #[tokio::test]
    async fn test_write_read_undo_end_to_end() {
        let (config, _temp) = test_config();
        let mut client = TestClient::new(config);
        let app = client.create_app("undo-app", None).await;

        // Two consecutive edits produce two consecutive commits
        let c1 = client.write_file(app.id, "index.html", "A").await;
        let c2 = client.write_file(app.id, "index.html", "B").await;
        assert_ne!(c1, c2);

        match client.read_file(app.id, "index.html").await {
            DaemonResponse::FileContent { content, .. } => assert_eq!(content, "B"),
            other => panic!("Expected FileContent, got {:?}", other),
        }

        // First undo: back to "A"
        match client.request(DaemonRequest::Undo { app_id: app.id }).await {
            DaemonResponse::Undone { commit_id, .. } => assert_eq!(commit_id, c1),
            other => panic!("Expected Undone, got {:?}", other),
        }
        match client.read_file(app.id, "index.html").await {
            DaemonResponse::FileContent { content, .. } => assert_eq!(content, "A"),
            other => panic!("Expected FileContent, got {:?}", other),
        }

        // Second undo: back to the empty initial workspace
        match client.request(DaemonRequest::Undo { app_id: app.id }).await {
            DaemonResponse::Undone { .. } => {}
            other => panic!("Expected Undone, got {:?}", other),
        }
        let response = client.read_file(app.id, "index.html").await;
        assert_eq!(error_code(&response), DaemonErrorCode::NotFound);

        // Third undo: nothing left to revert
        let response = client.request(DaemonRequest::Undo { app_id: app.id }).await;
        assert_eq!(error_code(&response), DaemonErrorCode::NoHistory);
    }

    #[tokio::test]
    async fn test_write_file_rejects_escaping_paths() {
        let (config, _temp) = test_config();
        let mut client = TestClient::new(config);
        let app = client.create_app("sandboxed", None).await;

        for path in ["../outside.txt", "/etc/passwd", "a/../../b"] {
            let response = client
                .request(DaemonRequest::WriteFile {
                    app_id: app.id,
                    path: path.to_string(),
                    content: "nope".to_string(),
                })
                .await;
            assert_eq!(
                error_code(&response),
                DaemonErrorCode::PathEscape,
                "path '{}' should be rejected",
                path
            );
        }
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let (config, _temp) = test_config();
        let port_range = config.port_range;
        let mut client = TestClient::new(config);
        let app = client
            .create_app("runner", Some(sh("echo booted; sleep 30")))
            .await;

        let (started, port) = match client
            .request(DaemonRequest::StartApp { app_id: app.id })
            .await
        {
            DaemonResponse::AppStarted { app, port } => (app, port),
            other => panic!("Expected AppStarted, got {:?}", other),
        };
        assert!(port >= port_range.0 && port <= port_range.1);
        assert_eq!(started.port, Some(port));

        match client.request(DaemonRequest::GetApp { app_id: app.id }).await {
            DaemonResponse::AppStatus { running, .. } => assert!(running),
            other => panic!("Expected AppStatus, got {:?}", other),
        }

        // Starting again returns the same port without a second process
        match client
            .request(DaemonRequest::StartApp { app_id: app.id })
            .await
        {
            DaemonResponse::AppStarted { port: again, .. } => assert_eq!(again, port),
            other => panic!("Expected AppStarted, got {:?}", other),
        }
        assert_eq!(client.state.processes.count(), 1);

        // Tail reaches the ring buffer
        let state = Arc::clone(&client.state);
        let app_id = app.id;
        assert_eventually_bool(
            "tail to contain boot output",
            Duration::from_secs(5),
            Duration::from_millis(50),
            move || {
                let state = Arc::clone(&state);
                async move {
                    state
                        .processes
                        .lookup(app_id)
                        .map(|h| {
                            String::from_utf8_lossy(&h.recent_output(4096)).contains("booted")
                        })
                        .unwrap_or(false)
                }
            },
        )
        .await;

        // Stop is acknowledged and idempotent
        assert!(matches!(
            client.request(DaemonRequest::StopApp { app_id: app.id }).await,
            DaemonResponse::AppStopped { .. }
        ));
        assert!(matches!(
            client.request(DaemonRequest::StopApp { app_id: app.id }).await,
            DaemonResponse::AppStopped { .. }
        ));
        assert_eq!(client.state.processes.count(), 0);
        assert_eq!(client.state.launcher.ports().leased_count(), 0);

        match client.request(DaemonRequest::GetApp { app_id: app.id }).await {
            DaemonResponse::AppStatus { running, .. } => assert!(!running),
            other => panic!("Expected AppStatus, got {:?}", other),
        }

        // Tail on a stopped app asserts a running process
        let response = client
            .request(DaemonRequest::TailOutput {
                app_id: app.id,
                bytes: None,
            })
            .await;
        assert_eq!(error_code(&response), DaemonErrorCode::NotRunning);
    }

    #[tokio::test]
    async fn test_subscribe_receives_chunks_then_end() {
        let (config, _temp) = test_config();
        let mut client = TestClient::new(config);
        let app = client
            .create_app("streamer", Some(sh("echo streaming-hello")))
            .await;

        let token = match client
            .request(DaemonRequest::SubscribeOutput { app_id: app.id })
            .await
        {
            DaemonResponse::Subscribed { token, .. } => token,
            other => panic!("Expected Subscribed, got {:?}", other),
        };
        assert!(client.conn.tokens.contains_key(&token));

        match client
            .request(DaemonRequest::StartApp { app_id: app.id })
            .await
        {
            DaemonResponse::AppStarted { .. } => {}
            other => panic!("Expected AppStarted, got {:?}", other),
        }

        // Drain notifications until the terminal end event
        let mut saw_hello = false;
        let mut end_result = None;
        while end_result.is_none() {
            let notification =
                tokio::time::timeout(Duration::from_secs(5), client.notify_rx.recv())
                    .await
                    .expect("timed out waiting for stream events")
                    .expect("notification channel closed");

            match notification {
                DaemonNotification::Chunk {
                    correlation_id,
                    payload,
                } => {
                    assert_eq!(correlation_id, CorrelationId::App(app.id));
                    if let StreamPayload::Output { source, data } = payload {
                        assert_eq!(source, OutputSource::Stdout);
                        if data.contains("streaming-hello") {
                            saw_hello = true;
                        }
                    }
                }
                DaemonNotification::End { result, .. } => end_result = Some(result),
                DaemonNotification::StreamError { message, .. } => {
                    panic!("Unexpected stream error: {}", message)
                }
            }
        }

        assert!(saw_hello, "expected process output to reach the subscriber");
        assert_eq!(
            end_result.unwrap(),
            StreamResult::Exited { exit_code: Some(0) }
        );

        // The terminal event removed the subscription
        assert_eq!(client.state.bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (config, _temp) = test_config();
        let mut client = TestClient::new(config);
        let app = client
            .create_app("quiet", Some(sh("echo never-seen")))
            .await;

        let token = match client
            .request(DaemonRequest::SubscribeOutput { app_id: app.id })
            .await
        {
            DaemonResponse::Subscribed { token, .. } => token,
            other => panic!("Expected Subscribed, got {:?}", other),
        };

        assert!(matches!(
            client
                .request(DaemonRequest::UnsubscribeOutput { token })
                .await,
            DaemonResponse::Unsubscribed { .. }
        ));
        assert_eq!(client.state.bus.subscription_count(), 0);

        match client
            .request(DaemonRequest::StartApp { app_id: app.id })
            .await
        {
            DaemonResponse::AppStarted { .. } => {}
            other => panic!("Expected AppStarted, got {:?}", other),
        }

        // Give the short-lived process time to finish; nothing may arrive
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(client.notify_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_surfaced() {
        let (config, _temp) = test_config();
        let mut client = TestClient::new(config);
        let app = client
            .create_app(
                "broken",
                Some(vec!["definitely-not-a-real-binary-here".to_string()]),
            )
            .await;

        let response = client
            .request(DaemonRequest::StartApp { app_id: app.id })
            .await;
        assert_eq!(error_code(&response), DaemonErrorCode::Spawn);

        // Failure leaves no registry entry or leased port behind
        assert_eq!(client.state.processes.count(), 0);
        assert_eq!(client.state.launcher.ports().leased_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_app_removes_workspace_and_process() {
        let (config, _temp) = test_config();
        let mut client = TestClient::new(config);
        let app = client
            .create_app("doomed", Some(sh("sleep 30")))
            .await;
        client.write_file(app.id, "index.html", "bye").await;

        match client
            .request(DaemonRequest::StartApp { app_id: app.id })
            .await
        {
            DaemonResponse::AppStarted { .. } => {}
            other => panic!("Expected AppStarted, got {:?}", other),
        }

        let workspace = client.state.workspace_for(&app);
        assert!(workspace.exists());

        assert!(matches!(
            client.request(DaemonRequest::DeleteApp { app_id: app.id }).await,
            DaemonResponse::AppDeleted { .. }
        ));

        assert!(!workspace.exists());
        assert_eq!(client.state.processes.count(), 0);
        let response = client.request(DaemonRequest::GetApp { app_id: app.id }).await;
        assert_eq!(error_code(&response), DaemonErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_one_apps_failure_leaves_others_untouched() {
        let (config, _temp) = test_config();
        let mut client = TestClient::new(config);

        let healthy = client
            .create_app("healthy", Some(sh("sleep 30")))
            .await;
        let broken = client
            .create_app(
                "broken",
                Some(vec!["definitely-not-a-real-binary-here".to_string()]),
            )
            .await;

        match client
            .request(DaemonRequest::StartApp { app_id: healthy.id })
            .await
        {
            DaemonResponse::AppStarted { .. } => {}
            other => panic!("Expected AppStarted, got {:?}", other),
        }

        let response = client
            .request(DaemonRequest::StartApp { app_id: broken.id })
            .await;
        assert_eq!(error_code(&response), DaemonErrorCode::Spawn);

        // The healthy app's process and registry entry are untouched
        match client
            .request(DaemonRequest::GetApp { app_id: healthy.id })
            .await
        {
            DaemonResponse::AppStatus { running, .. } => assert!(running),
            other => panic!("Expected AppStatus, got {:?}", other),
        }

        client
            .request(DaemonRequest::StopApp { app_id: healthy.id })
            .await;
    }
}
