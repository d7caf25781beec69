//! Debuggee launcher
//!
//! Starts ldb on two ports, connects the command channel and then the event
//! channel, and hands both to a new [`DebugTarget`].

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::debugger::config::LaunchConfig;
use crate::debugger::error::DebugError;
use crate::debugger::target::DebugTarget;
use crate::io::ports::{
    DEFAULT_PORT_ATTEMPTS, PortAllocator, PortError, PortPair, connect_with_retry,
};
use crate::io::process::{
    ChildProcessManager, OutputHandler, OutputMonitor, OutputStream, ProcessExitEvent,
    ProcessExitHandler, ProcessManager, ProcessState, StopMode,
};
use crate::io::transport::TcpTransport;

/// Publishes the debuggee's exit on a watch channel
struct ExitWatch {
    sender: watch::Sender<Option<ProcessExitEvent>>,
}

#[async_trait]
impl ProcessExitHandler for ExitWatch {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        info!(pid = ?event.pid, exit_code = ?event.exit_code, "Debuggee exited");
        self.sender.send_replace(Some(event));
    }
}

/// Launches ldb and attaches a debug target to it
#[derive(Clone, Default)]
pub struct Launcher {
    output_handler: Option<OutputHandler>,
}

impl Launcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive the script's stdout and stderr lines
    ///
    /// Without a handler the lines are only traced at debug level.
    pub fn with_output_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(OutputStream, String) + Send + Sync + 'static,
    {
        self.output_handler = Some(Arc::new(handler));
        self
    }

    /// Spawn the debuggee and connect to it
    ///
    /// The process is killed again if either connection cannot be made.
    pub async fn launch(&self, config: LaunchConfig) -> Result<LaunchedSession, DebugError> {
        let allocator = PortAllocator::new(config.host, DEFAULT_PORT_ATTEMPTS);
        let ports = resolve_ports(&allocator, config.command_port, config.event_port)?;
        info!(
            script = %config.script.display(),
            command_port = ports.command,
            event_port = ports.event,
            "Launching ldb"
        );

        let (exit_sender, exit) = watch::channel(None);
        let mut process = ChildProcessManager::new(
            config.ldb_path.to_string_lossy().into_owned(),
            config.ldb_args(ports),
            Some(config.working_directory.clone()),
        )
        .with_output_log(config.output_log.clone())
        .with_exit_handler(Arc::new(ExitWatch {
            sender: exit_sender,
        }));

        if let Some(handler) = self.output_handler.clone() {
            process.on_output_line(move |stream, line| handler(stream, line));
        }

        debug!("Command line: {}", process.command_line());
        process.start().await?;

        match connect_both(&config, ports, exit.clone()).await {
            Ok((command, event)) => {
                let target = DebugTarget::attach(command, event, config.session.clone());
                info!("Attached to ldb");
                Ok(LaunchedSession {
                    target,
                    process,
                    ports,
                    exit,
                    terminate_timeout: config.session.terminate_timeout,
                })
            }
            Err(e) => {
                warn!(error = %e, "Could not connect to ldb, stopping it");
                if process.is_running()
                    && let Err(stop_error) = process.stop(StopMode::Force).await
                {
                    debug!("Error stopping debuggee: {}", stop_error);
                }
                Err(e)
            }
        }
    }
}

/// Use the configured ports and allocate the missing ones
fn resolve_ports(
    allocator: &PortAllocator,
    command: Option<u16>,
    event: Option<u16>,
) -> Result<PortPair, PortError> {
    match (command, event) {
        (Some(command), Some(event)) => Ok(PortPair { command, event }),
        (Some(command), None) => Ok(PortPair {
            command,
            event: free_port_other_than(allocator, command)?,
        }),
        (None, Some(event)) => Ok(PortPair {
            command: free_port_other_than(allocator, event)?,
            event,
        }),
        (None, None) => allocator.allocate_pair(),
    }
}

fn free_port_other_than(allocator: &PortAllocator, taken: u16) -> Result<u16, PortError> {
    let port = allocator.find_free_port()?;
    if port != taken {
        return Ok(port);
    }
    // The fixed port was free, so it is handed out again; ask once more
    let pair = allocator.allocate_pair()?;
    Ok(if pair.command != taken {
        pair.command
    } else {
        pair.event
    })
}

/// ldb accepts the command connection before it listens on the event port
async fn connect_both(
    config: &LaunchConfig,
    ports: PortPair,
    exit: watch::Receiver<Option<ProcessExitEvent>>,
) -> Result<(TcpTransport, TcpTransport), DebugError> {
    let command =
        connect_unless_exited(config, ports.command_addr(config.host), exit.clone()).await?;
    let event = connect_unless_exited(config, ports.event_addr(config.host), exit).await?;
    Ok((command, event))
}

async fn connect_unless_exited(
    config: &LaunchConfig,
    addr: SocketAddr,
    mut exit: watch::Receiver<Option<ProcessExitEvent>>,
) -> Result<TcpTransport, DebugError> {
    let connect = connect_with_retry(addr, config.connect_timeout, config.connect_retry_interval);

    tokio::select! {
        connected = connect => Ok(connected?),
        exited = exit.wait_for(Option::is_some) => {
            let exit_code = exited
                .ok()
                .and_then(|event| (*event).as_ref().and_then(|e| e.exit_code));
            Err(DebugError::Connection {
                reason: format!(
                    "ldb exited (code {exit_code:?}) before accepting a connection on {addr}"
                ),
            })
        }
    }
}

/// A running debuggee with its attached target
pub struct LaunchedSession {
    target: DebugTarget,
    process: ChildProcessManager,
    ports: PortPair,
    exit: watch::Receiver<Option<ProcessExitEvent>>,
    terminate_timeout: Duration,
}

impl LaunchedSession {
    pub fn target(&self) -> &DebugTarget {
        &self.target
    }

    pub fn ports(&self) -> PortPair {
        self.ports
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn process_state(&self) -> ProcessState {
        self.process.get_state()
    }

    /// Exit of the debuggee, if it has exited
    pub fn exit_event(&self) -> Option<ProcessExitEvent> {
        self.exit.borrow().clone()
    }

    /// Wait until the debuggee exits
    pub async fn wait_for_exit(&mut self) -> Option<ProcessExitEvent> {
        self.exit
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|event| (*event).clone())
    }

    /// Terminate the target, then stop the process if it is still running
    pub async fn shutdown(mut self) -> Result<(), DebugError> {
        info!("Shutting down debug session");

        if self.target.can_terminate()
            && let Err(e) = self.target.terminate().await
        {
            warn!("Error terminating debug target: {}", e);
        }

        let timeout = self.terminate_timeout;
        if tokio::time::timeout(timeout, self.wait_for_exit())
            .await
            .is_err()
            && self.process.is_running()
        {
            debug!(?timeout, "Debuggee still running, stopping it");
            self.process.stop(StopMode::Graceful).await?;
        }

        info!("Debug session shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::config::LaunchConfigBuilder;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    // Auto-initialize logging for all tests in this module
    #[cfg(feature = "test-logging")]
    #[ctor::ctor]
    fn init_test_logging() {
        crate::test_utils::logging::init();
    }

    #[test]
    fn test_resolve_ports() {
        let allocator = PortAllocator::default();

        let fixed = resolve_ports(&allocator, Some(4000), Some(4001)).unwrap();
        assert_eq!(fixed, PortPair { command: 4000, event: 4001 });

        let allocated = resolve_ports(&allocator, None, None).unwrap();
        assert_ne!(allocated.command, allocated.event);

        let half = resolve_ports(&allocator, Some(4000), None).unwrap();
        assert_eq!(half.command, 4000);
        assert_ne!(half.event, 4000);

        let other_half = resolve_ports(&allocator, None, Some(4001)).unwrap();
        assert_eq!(other_half.event, 4001);
        assert_ne!(other_half.command, 4001);
    }

    #[cfg(unix)]
    fn fake_ldb(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("ldb");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(dir: &TempDir, ldb: &Path) -> LaunchConfig {
        let script = dir.path().join("sort.lua");
        std::fs::write(&script, "print('sorted')\n").unwrap();
        LaunchConfigBuilder::new()
            .ldb_path(ldb)
            .script(&script)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_fails_fast_when_ldb_exits() {
        let dir = tempfile::tempdir().unwrap();
        let ldb = fake_ldb(dir.path(), "exit 3");

        let started = std::time::Instant::now();
        let result = Launcher::new().launch(config(&dir, &ldb)).await;

        match result {
            Err(DebugError::Connection { reason }) => assert!(reason.contains("exited")),
            Err(other) => panic!("Expected Connection error, got: {other:?}"),
            Ok(_) => panic!("Expected launch to fail"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_times_out_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let ldb = fake_ldb(dir.path(), "sleep 10");
        let mut config = config(&dir, &ldb);
        config.connect_timeout = Duration::from_millis(300);

        let result = Launcher::new().launch(config).await;
        assert!(matches!(result, Err(DebugError::Connection { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_passes_ldb_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let ldb = fake_ldb(dir.path(), &format!("printf '%s\\n' \"$*\" > {}", args_file.display()));
        let mut config = config(&dir, &ldb);
        config.command_port = Some(4100);
        config.event_port = Some(4101);
        config.connect_timeout = Duration::from_millis(300);

        let _ = Launcher::new().launch(config.clone()).await;

        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(
            args.trim(),
            format!(
                "-n {} -b true -t ide -c 4100 -e 4101",
                config.script.display()
            )
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_forwards_debuggee_output() {
        let dir = tempfile::tempdir().unwrap();
        let ldb = fake_ldb(dir.path(), "echo 'cannot open sort.lua'; sleep 0.3; exit 1");

        let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&lines);
        let launcher = Launcher::new().with_output_handler(move |stream, line| {
            seen.lock().unwrap().push((stream, line));
        });

        assert!(launcher.launch(config(&dir, &ldb)).await.is_err());

        // The drain task may still be flushing the last line
        for _ in 0..50 {
            if !lines.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *lines.lock().unwrap(),
            vec![(OutputStream::Stdout, "cannot open sort.lua".to_string())]
        );
    }

    #[cfg(feature = "ldb-integration-tests")]
    #[tokio::test]
    async fn test_real_ldb_session() {
        use crate::debugger::target::DebugNotification;
        use crate::test_utils::get_test_ldb_path;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("count.lua");
        std::fs::write(&script, "local n = 1\nn = n + 1\nprint(n)\n").unwrap();

        let config = LaunchConfigBuilder::new()
            .ldb_path(get_test_ldb_path())
            .script(&script)
            .build()
            .unwrap();

        let session = Launcher::new().launch(config).await.unwrap();
        let mut notifications = session.target().subscribe();

        let snapshot = loop {
            let notification = tokio::time::timeout(Duration::from_secs(10), notifications.recv())
                .await
                .unwrap()
                .unwrap();
            if let DebugNotification::Suspended { snapshot, .. } = notification {
                break snapshot;
            }
        };
        assert!(!snapshot.is_empty());

        session.target().step_over().await.unwrap();
        session.shutdown().await.unwrap();
    }
}
