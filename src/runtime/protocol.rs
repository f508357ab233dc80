// Wire protocol - shared structs for daemon <-> client communication
// Uses framed JSON messages over Unix sockets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workspace::models::CommitId;

/// Protocol version for handshake compatibility checks
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single request frame (1MB)
pub const MAX_REQUEST_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum size of a single response frame (10MB)
pub const MAX_RESPONSE_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Unique app identifier
pub type AppId = u64;

/// Key routing streamed events to the right subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum CorrelationId {
    /// Output stream of a managed app process
    App(AppId),
    /// Response stream of a chat with the text-generation service
    Chat(u64),
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrelationId::App(id) => write!(f, "app:{}", id),
            CorrelationId::Chat(id) => write!(f, "chat:{}", id),
        }
    }
}

/// Which process stream a chunk of output came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// Non-terminal stream payload delivered to a subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamPayload {
    /// Chunk of process output
    Output { source: OutputSource, data: String },
    /// Incremental chat response text
    ChatDelta { text: String },
}

/// Terminal result closing a stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamResult {
    /// Process exited (code is None when killed by signal)
    Exited { exit_code: Option<i32> },
    /// Chat response finished
    ChatComplete,
}

/// App metadata stored in persistence and exchanged via protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    /// Unique app ID
    pub id: AppId,
    /// Display name, also used as the workspace directory name
    pub name: String,
    /// Workspace directory relative to the configured apps root
    pub path: String,
    /// Last port the app's dev server was bound to (reused when free)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Start command for the dev server (daemon default when None)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_command: Option<Vec<String>>,
    /// When the app was registered
    pub created_at: DateTime<Utc>,
    /// When the app was last updated
    pub updated_at: DateTime<Utc>,
}

impl App {
    pub fn new(id: AppId, name: String, start_command: Option<Vec<String>>) -> Self {
        let now = Utc::now();
        Self {
            id,
            path: name.clone(),
            name,
            port: None,
            start_command,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Client -> Daemon requests
// ============================================================================

/// Request message from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Version handshake, must be the first request on a connection
    Handshake { client_version: u32 },
    /// Register a new app and initialize its workspace history
    CreateApp {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_command: Option<Vec<String>>,
    },
    /// List all registered apps
    ListApps,
    /// Get one app plus its live process state
    GetApp { app_id: AppId },
    /// Stop and unregister an app, deleting its workspace and history
    DeleteApp { app_id: AppId },
    /// Write a file inside an app's workspace and commit the change
    WriteFile {
        app_id: AppId,
        path: String,
        content: String,
    },
    /// Read a file from an app's workspace
    ReadFile { app_id: AppId, path: String },
    /// Revert the app's workspace to the previous snapshot
    Undo { app_id: AppId },
    /// Start the app's dev-server process
    StartApp { app_id: AppId },
    /// Stop the app's dev-server process (no-op when not running)
    StopApp { app_id: AppId },
    /// Fetch recent output of a running app from its ring buffer
    TailOutput {
        app_id: AppId,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes: Option<usize>,
    },
    /// Subscribe this connection to an app's output stream
    SubscribeOutput { app_id: AppId },
    /// Cancel a subscription created on this connection
    UnsubscribeOutput { token: u64 },
    /// Ping to check if daemon is alive
    Ping,
    /// Request daemon to shut down gracefully
    Shutdown,
}

// ============================================================================
// Daemon -> Client responses
// ============================================================================

/// Typed error codes surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonErrorCode {
    /// A file path resolved outside the app's workspace
    PathEscape,
    /// Snapshot storage failed or history is uninitialized
    Repository,
    /// Already at the initial snapshot, nothing to undo
    NoHistory,
    /// File written but the follow-up commit failed
    Commit,
    /// No free port in the configured range
    PortUnavailable,
    /// OS process creation failed
    Spawn,
    /// Operation asserted a running process that is absent
    NotRunning,
    /// Unknown app or resource
    NotFound,
    /// Malformed or oversized request
    InvalidRequest,
    /// Client/daemon protocol versions differ
    VersionMismatch,
    /// Anything else
    Internal,
}

/// Response message from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    /// Handshake accepted
    Handshake { protocol_version: u32 },
    /// App was registered
    AppCreated { app: App },
    /// All registered apps
    AppList { apps: Vec<App> },
    /// One app plus whether its process is currently registered
    AppStatus { app: App, running: bool },
    /// App was deleted
    AppDeleted { app_id: AppId },
    /// File written and committed
    FileWritten { app_id: AppId, commit_id: CommitId },
    /// File contents read back from the workspace
    FileContent {
        app_id: AppId,
        path: String,
        content: String,
    },
    /// Workspace reverted, now at this commit
    Undone { app_id: AppId, commit_id: CommitId },
    /// App process spawned (or already running) on this port
    AppStarted { app: App, port: u16 },
    /// App process stopped (or was not running)
    AppStopped { app_id: AppId },
    /// Recent output from the app's ring buffer
    OutputTail { app_id: AppId, data: Vec<u8> },
    /// Subscription established; token cancels it
    Subscribed { app_id: AppId, token: u64 },
    /// Subscription cancelled
    Unsubscribed { token: u64 },
    /// Pong response
    Pong,
    /// Shutdown acknowledged
    ShuttingDown,
    /// Error response
    Error {
        code: DaemonErrorCode,
        message: String,
    },
}

// ============================================================================
// Daemon -> Client push notifications (streaming)
// ============================================================================

/// Streamed event delivered to subscribed connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonNotification {
    /// Non-terminal stream data
    Chunk {
        correlation_id: CorrelationId,
        payload: StreamPayload,
    },
    /// Terminal: the stream finished normally
    End {
        correlation_id: CorrelationId,
        result: StreamResult,
    },
    /// Terminal: the stream failed
    StreamError {
        correlation_id: CorrelationId,
        message: String,
    },
}

// ============================================================================
// Helpers for message framing
// ============================================================================

/// Serialize a message to JSON bytes with newline delimiter
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Deserialize a message from JSON bytes (strips trailing newline)
pub fn deserialize_message<T: for<'de> Deserialize<'de>>(
    bytes: &[u8],
) -> Result<T, serde_json::Error> {
    let trimmed = if bytes.last() == Some(&b'\n') {
        &bytes[..bytes.len() - 1]
    } else {
        bytes
    };
    serde_json::from_slice(trimmed)
}
