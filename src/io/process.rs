//! Process management layer
//!
//! Handles the debuggee process lifecycle and output draining, completely
//! separate from the socket transports the debugger protocol runs on.

use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Send SIGTERM and let the wait task observe the exit
    Graceful,
    /// Force kill immediately (SIGKILL)
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process has been stopped (either gracefully or forcefully)
    Stopped,
}

impl ProcessState {
    /// Get the process ID if the process is running
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Process Exit Events
// ============================================================================

/// Event fired when the process exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExitEvent {
    /// Process ID of the exited process
    pub pid: Option<u32>,
    /// Exit code, `None` when killed by a signal or when waiting failed
    pub exit_code: Option<i32>,
}

/// Trait for handling process exit events
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    /// Called when the process exits, whether expected or not
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Output Monitoring Trait
// ============================================================================

/// Which debuggee stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Callback receiving each non-empty output line of the debuggee
pub type OutputHandler = Arc<dyn Fn(OutputStream, String) + Send + Sync>;

/// Trait for monitoring stdout/stderr output from the debuggee
///
/// ldb reports diagnostics on stdout even in socket mode, so both streams
/// are always drained to keep the debuggee from blocking on a full pipe.
pub trait OutputMonitor: Send + Sync {
    /// Install a handler for output lines
    ///
    /// Only one handler can be active at a time - installing a new handler
    /// replaces the previous one. It takes effect on the next start.
    fn on_output_line<F>(&mut self, handler: F)
    where
        F: Fn(OutputStream, String) + Send + Sync + 'static;
}

// ============================================================================
// Process Management
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

/// Trait for managing external process lifecycle
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start the external process
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Stop the external process
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    /// Check if the process is currently running
    fn is_running(&self) -> bool;

    /// Process ID while running
    fn pid(&self) -> Option<u32>;

    /// Synchronous force kill for Drop trait implementations
    fn kill_sync(&mut self);
}

/// Manages child processes spawned via Command
pub struct ChildProcessManager {
    /// Command to execute
    command: String,

    /// Command arguments
    args: Vec<String>,

    /// Working directory for the process (optional)
    working_directory: Option<PathBuf>,

    /// Optional file receiving timestamped debuggee output
    output_log_path: Option<PathBuf>,

    /// Thread-safe process state
    state: Arc<Mutex<ProcessState>>,

    /// Output handler
    output_handler: Option<OutputHandler>,

    /// Output draining task handles
    output_tasks: Vec<JoinHandle<()>>,

    /// Process wait task handle (waits for child to exit)
    wait_task: Option<JoinHandle<()>>,

    /// Process exit event handler
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl ChildProcessManager {
    /// Create a new child process manager
    ///
    /// # Arguments
    /// * `command` - The command to execute
    /// * `args` - Command line arguments
    /// * `working_dir` - Optional working directory for the process
    pub fn new(command: String, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            command,
            args,
            working_directory: working_dir,
            output_log_path: None,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            output_handler: None,
            output_tasks: Vec::new(),
            wait_task: None,
            exit_handler: None,
        }
    }

    /// Append all debuggee output to `path` with timestamps
    pub fn with_output_log(mut self, path: Option<PathBuf>) -> Self {
        self.output_log_path = path;
        self
    }

    /// Install the exit handler fired by the wait task
    pub fn with_exit_handler(mut self, handler: Arc<dyn ProcessExitHandler>) -> Self {
        self.exit_handler = Some(handler);
        self
    }

    /// Command line as it will be executed, for diagnostics
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Get current process state (thread-safe)
    pub fn get_state(&self) -> ProcessState {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.state.lock().unwrap().clone()
    }

    async fn open_output_log(&self) -> Option<tokio::fs::File> {
        let path = self.output_log_path.as_ref()?;
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                warn!(
                    "Failed to open debuggee output log {}: {}. Output will only be traced.",
                    path.display(),
                    e
                );
                return None;
            }
        };

        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let header = format!("\n=== DEBUGGEE STARTED: {timestamp} ({}) ===\n", self.command_line());
        if let Err(e) = file.write_all(header.as_bytes()).await {
            warn!("Failed to write header to debuggee output log: {}", e);
        }
        Some(file)
    }

    /// Spawn one output draining task
    ///
    /// Always drains the pipe to prevent the child from blocking. If a
    /// handler is installed, lines are forwarded to it.
    fn spawn_output_monitor<R>(
        &mut self,
        stream: OutputStream,
        pipe: R,
        log_file: Option<Arc<tokio::sync::Mutex<tokio::fs::File>>>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let handler = self.output_handler.clone();

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut line = String::new();

            trace!(
                "ChildProcessManager: Starting {} monitoring (handler: {})",
                stream.as_str(),
                if handler.is_some() {
                    "installed"
                } else {
                    "draining only"
                }
            );

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        trace!("ChildProcessManager: {} EOF reached", stream.as_str());
                        break;
                    }
                    Ok(_) => {
                        let line_content = line.trim_end().to_string();
                        if line_content.is_empty() {
                            continue;
                        }

                        if let Some(file) = &log_file {
                            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S.%3f");
                            let entry =
                                format!("[{timestamp}] [{}] {line_content}\n", stream.as_str());
                            let mut file = file.lock().await;
                            if let Err(e) = file.write_all(entry.as_bytes()).await {
                                warn!("Failed to write to debuggee output log: {}", e);
                            } else {
                                let _ = file.flush().await;
                            }
                        }

                        match &handler {
                            Some(handler) => handler(stream, line_content),
                            None => debug!(stream = stream.as_str(), "debuggee: {}", line_content),
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from debuggee {}: {}", stream.as_str(), e);
                        break;
                    }
                }
            }

            trace!("ChildProcessManager: {} monitoring finished", stream.as_str());
        });

        self.output_tasks.push(task);
    }

    /// Spawn the wait task that monitors child process exit
    fn spawn_wait_task(&mut self, mut child: Child) {
        let current_pid = self.get_state().pid();
        let exit_handler = self.exit_handler.clone();
        let state = Arc::clone(&self.state);

        let task = tokio::spawn(async move {
            trace!(
                "ChildProcessManager: Starting wait task for PID {:?}",
                current_pid
            );

            let exit_code = match child.wait().await {
                Ok(exit_status) => {
                    info!(
                        "Process PID {:?} exited with status: {}",
                        current_pid, exit_status
                    );
                    exit_status.code()
                }
                Err(e) => {
                    error!("Error waiting for child process: {}", e);
                    None
                }
            };

            // Transition state to Stopped even on error
            if let Ok(mut process_state) = state.lock() {
                *process_state = ProcessState::Stopped;
            }

            if let Some(handler) = &exit_handler {
                handler
                    .on_process_exit(ProcessExitEvent {
                        pid: current_pid,
                        exit_code,
                    })
                    .await;
            }

            trace!(
                "ChildProcessManager: Wait task finished for PID {:?}",
                current_pid
            );
        });

        self.wait_task = Some(task);
    }

    fn abort_output_tasks(&mut self) {
        for task in self.output_tasks.drain(..) {
            task.abort();
        }
    }

    #[cfg(unix)]
    fn send_signal(pid: u32, signal: libc::c_int) -> bool {
        // SAFETY: kill(2) has no memory-safety preconditions
        unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
    }
}

#[async_trait]
impl ProcessManager for ChildProcessManager {
    type Error = ProcessError;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("Starting process: {} {:?}", self.command, self.args);

        let mut command_builder = Command::new(&self.command);
        command_builder
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(working_dir) = &self.working_directory {
            command_builder.current_dir(working_dir);
        }

        let mut child = command_builder
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("Failed to get process ID")))?;
        info!("Process started with PID: {}", pid);

        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        *self.state.lock().unwrap() = ProcessState::Running { pid };

        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::StderrNotAvailable)?;

        let log_file = self
            .open_output_log()
            .await
            .map(|file| Arc::new(tokio::sync::Mutex::new(file)));

        self.spawn_output_monitor(OutputStream::Stdout, stdout, log_file.clone());
        self.spawn_output_monitor(OutputStream::Stderr, stderr, log_file);

        // Start wait task with the child process (this consumes the child)
        self.spawn_wait_task(child);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return Err(ProcessError::NotStarted),
        };

        match mode {
            StopMode::Graceful => info!("Gracefully stopping process with PID: {}", pid),
            StopMode::Force => info!("Force killing process with PID: {}", pid),
        }

        #[cfg(unix)]
        {
            let signal = match mode {
                StopMode::Graceful => libc::SIGTERM,
                StopMode::Force => libc::SIGKILL,
            };
            if Self::send_signal(pid, signal) {
                info!("Sent signal {} to process {}", signal, pid);
            }
        }
        #[cfg(not(unix))]
        {
            warn!("Non-unix process termination not implemented");
        }

        // Output tasks end on their own at EOF; the wait task keeps running
        // so the exit handler still fires.
        *self.state.lock().unwrap() = ProcessState::Stopped;

        Ok(())
    }

    fn is_running(&self) -> bool {
        self.get_state().is_running()
    }

    fn pid(&self) -> Option<u32> {
        self.get_state().pid()
    }

    fn kill_sync(&mut self) {
        let pid = match self.get_state().pid() {
            Some(pid) => pid,
            None => return,
        };

        info!("Synchronously force killing process with PID: {}", pid);

        #[cfg(unix)]
        {
            if Self::send_signal(pid, libc::SIGKILL) {
                info!("Sent SIGKILL to process {}", pid);
            }
        }
        #[cfg(not(unix))]
        {
            warn!("Non-unix sync process kill not implemented - process may remain");
        }

        self.abort_output_tasks();
        *self.state.lock().unwrap() = ProcessState::Stopped;
    }
}

impl OutputMonitor for ChildProcessManager {
    fn on_output_line<F>(&mut self, handler: F)
    where
        F: Fn(OutputStream, String) + Send + Sync + 'static,
    {
        self.output_handler = Some(Arc::new(handler));
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        self.kill_sync();
    }
}
