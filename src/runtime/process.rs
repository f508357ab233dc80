// Dev-server process runtime
//
// Wraps tokio::process to provide async methods for app lifecycle:
// - Spawning the app's start command with its port injected
// - Forwarding chunked stdout/stderr into the event bus
// - Retaining recent output in a ring buffer
// - Graceful and forced termination

use crate::runtime::events::EventBus;
use crate::runtime::protocol::{AppId, CorrelationId, OutputSource, StreamPayload, StreamResult};
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::watch;

/// Output buffer size for the ring buffer
const OUTPUT_BUFFER_SIZE: usize = 64 * 1024; // 64KB

/// Read chunk size for stdout/stderr forwarding
const READ_CHUNK_SIZE: usize = 4096;

/// How long to wait for the process to die after a forced kill
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// Exit information published when the process terminates
#[derive(Debug, Clone, Copy)]
pub struct ProcessExit {
    /// Exit code; None when terminated by a signal
    pub code: Option<i32>,
}

/// Cleanup hook run by the exit watcher after the terminal event fires
pub type ExitCallback = Box<dyn FnOnce(Arc<AppProcess>) + Send>;

/// Handle for one running app process
///
/// Owned exclusively by the process registry entry for its app. The
/// child itself lives in the exit-watcher task; this handle carries
/// what stop/tail need: the pid, the bound port, the ring buffer and
/// the exit signal.
#[derive(Debug)]
pub struct AppProcess {
    app_id: AppId,
    pid: Option<u32>,
    port: u16,
    output_buffer: Arc<StdMutex<RingBuffer>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

/// Simple ring buffer for storing recent process output
#[derive(Debug)]
struct RingBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl RingBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        // If adding would exceed capacity, remove oldest data
        let total_len = self.data.len() + bytes.len();
        if total_len > self.capacity {
            let to_remove = total_len - self.capacity;
            if to_remove >= self.data.len() {
                self.data.clear();
            } else {
                self.data.drain(..to_remove);
            }
        }
        self.data.extend_from_slice(bytes);
    }

    fn get_tail(&self, max_bytes: usize) -> Vec<u8> {
        if self.data.len() <= max_bytes {
            self.data.clone()
        } else {
            self.data[self.data.len() - max_bytes..].to_vec()
        }
    }
}

impl AppProcess {
    /// Spawn the app's start command in its workspace directory
    ///
    /// The chosen port is injected via the PORT environment variable.
    /// Returns once the process has been spawned, not once it is ready
    /// to serve. Output is forwarded into the event bus under the
    /// app's correlation id; `on_exit` runs after the terminal event.
    pub fn spawn(
        app_id: AppId,
        command: &[String],
        workspace: &Path,
        port: u16,
        bus: Arc<EventBus>,
        on_exit: ExitCallback,
    ) -> io::Result<Arc<Self>> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty start command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workspace)
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let output_buffer = Arc::new(StdMutex::new(RingBuffer::new(OUTPUT_BUFFER_SIZE)));
        let (exit_tx, exit_rx) = watch::channel(None);

        let process = Arc::new(Self {
            app_id,
            pid,
            port,
            output_buffer: Arc::clone(&output_buffer),
            exit_rx,
        });

        let stdout_task = spawn_reader_task(
            stdout,
            OutputSource::Stdout,
            app_id,
            Arc::clone(&bus),
            Arc::clone(&output_buffer),
        );
        let stderr_task = spawn_reader_task(
            stderr,
            OutputSource::Stderr,
            app_id,
            Arc::clone(&bus),
            Arc::clone(&output_buffer),
        );

        // Exit watcher: wait for the readers to hit EOF, reap the child,
        // publish the terminal event after the final chunks, then run
        // the launcher's cleanup path
        let handle = Arc::clone(&process);
        tokio::spawn(async move {
            let _ = stdout_task.await;
            let _ = stderr_task.await;

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    eprintln!("Error waiting for app {} process: {}", app_id, e);
                    None
                }
            };

            let exit = ProcessExit { code };
            let _ = exit_tx.send(Some(exit));

            bus.publish_end(
                CorrelationId::App(app_id),
                StreamResult::Exited { exit_code: code },
            );
            on_exit(handle);
        });

        Ok(process)
    }

    pub fn app_id(&self) -> AppId {
        self.app_id
    }

    /// PID of the spawned process (if still known to the OS at spawn time)
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Port the process was bound to
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check if the process is still running
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit information once the process has terminated
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Get the last N bytes of output from the ring buffer
    pub fn recent_output(&self, max_bytes: usize) -> Vec<u8> {
        self.output_buffer.lock().unwrap().get_tail(max_bytes)
    }

    /// Stop the process: graceful signal, bounded wait, then force kill
    ///
    /// Returns once the process has exited or the forced-kill wait
    /// elapsed. Safe to call repeatedly and after the process exited
    /// on its own.
    pub async fn stop(&self, grace: Duration) {
        if !self.is_alive() {
            return;
        }

        self.terminate();
        if !self.wait_exit(grace).await {
            self.kill();
            self.wait_exit(FORCE_KILL_WAIT).await;
        }
    }

    #[cfg(unix)]
    fn terminate(&self) {
        self.signal(libc::SIGTERM);
    }

    #[cfg(unix)]
    fn kill(&self) {
        self.signal(libc::SIGKILL);
    }

    #[cfg(unix)]
    fn signal(&self, signal: i32) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as i32, signal);
            }
        }
    }

    // TODO(windows): TerminateProcess-based fallback
    #[cfg(not(unix))]
    fn terminate(&self) {}

    #[cfg(not(unix))]
    fn kill(&self) {}

    /// Wait up to `timeout` for the exit watcher to report termination
    async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut rx = self.exit_rx.clone();
        let result = tokio::time::timeout(timeout, rx.wait_for(|exit| exit.is_some()))
            .await
            .is_ok();
        result
    }
}

/// Forward one output stream into the ring buffer and event bus
///
/// Chunks for a single stream are published in production order; the
/// bus drops them when nobody is subscribed, so a missing consumer
/// never blocks the reader.
fn spawn_reader_task(
    stream: Option<impl Into<StreamHandle>>,
    source: OutputSource,
    app_id: AppId,
    bus: Arc<EventBus>,
    output_buffer: Arc<StdMutex<RingBuffer>>,
) -> tokio::task::JoinHandle<()> {
    let stream = stream.map(Into::into);
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return;
        };
        let mut buf = [0u8; READ_CHUNK_SIZE];

        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break, // EOF - process closed the stream
                Ok(n) => {
                    let data = &buf[..n];
                    {
                        let mut buffer = output_buffer.lock().unwrap();
                        buffer.push(data);
                    }
                    bus.publish_chunk(
                        CorrelationId::App(app_id),
                        StreamPayload::Output {
                            source,
                            data: String::from_utf8_lossy(data).into_owned(),
                        },
                    );
                }
                Err(e) => {
                    eprintln!("App {} {:?} read error: {}", app_id, source, e);
                    break;
                }
            }
        }
    })
}

/// Either half of the child's piped output
enum StreamHandle {
    Stdout(ChildStdout),
    Stderr(ChildStderr),
}

impl StreamHandle {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamHandle::Stdout(s) => s.read(buf).await,
            StreamHandle::Stderr(s) => s.read(buf).await,
        }
    }
}

impl From<ChildStdout> for StreamHandle {
    fn from(s: ChildStdout) -> Self {
        StreamHandle::Stdout(s)
    }
}

impl From<ChildStderr> for StreamHandle {
    fn from(s: ChildStderr) -> Self {
        StreamHandle::Stderr(s)
    }
}
