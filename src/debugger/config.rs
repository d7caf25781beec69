//! Configuration for debug sessions and debuggee launches
//!
//! Provides SessionConfig for an attached session and LaunchConfig for
//! starting ldb, with a validating builder and an optional JSON file layer.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::debugger::error::ConfigError;
use crate::io::ports::PortPair;
use crate::model::GlobalLabels;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default deadline for one command round trip (10 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Default deadline for the best-effort `terminate` command (2 seconds)
pub const DEFAULT_TERMINATE_TIMEOUT_SECS: u64 = 2;

/// Default time allowed for ldb to start accepting connections (10 seconds)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default pause between connection attempts (50 milliseconds)
pub const DEFAULT_CONNECT_RETRY_MS: u64 = 50;

/// Maximum allowed connect timeout (5 minutes)
pub const MAX_CONNECT_TIMEOUT_SECS: u64 = 300;

/// Default capacity of the session notification channel
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

// ============================================================================
// Core Configuration Types
// ============================================================================

/// Settings of an attached debug session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for each command round trip; `None` waits forever
    pub request_timeout: Option<Duration>,

    /// Deadline for the `terminate` command before the session gives up on it
    pub terminate_timeout: Duration,

    /// Whether frame variable lists carry the two global header entries
    pub global_labels: GlobalLabels,

    /// Buffered notifications per subscriber before the oldest are dropped
    pub notification_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Some(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
            terminate_timeout: Duration::from_secs(DEFAULT_TERMINATE_TIMEOUT_SECS),
            global_labels: GlobalLabels::Include,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

/// Complete debuggee launch configuration
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path to the ldb executable
    pub ldb_path: PathBuf,

    /// Absolute path of the Lua script to debug
    pub script: PathBuf,

    /// Fixed command port, allocated when `None`
    pub command_port: Option<u16>,

    /// Fixed event port, allocated when `None`
    pub event_port: Option<u16>,

    /// Working directory of the debuggee
    pub working_directory: PathBuf,

    /// Interface ldb listens on
    pub host: IpAddr,

    /// Time allowed for ldb to accept each connection
    pub connect_timeout: Duration,

    /// Pause between connection attempts
    pub connect_retry_interval: Duration,

    /// File receiving timestamped debuggee output
    pub output_log: Option<PathBuf>,

    pub session: SessionConfig,
}

impl LaunchConfig {
    pub fn builder() -> LaunchConfigBuilder {
        LaunchConfigBuilder::new()
    }

    /// Command-line arguments selecting buffered, socket-based debugging
    pub fn ldb_args(&self, ports: PortPair) -> Vec<String> {
        vec![
            "-n".to_string(),
            self.script.to_string_lossy().into_owned(),
            "-b".to_string(),
            "true".to_string(),
            "-t".to_string(),
            "ide".to_string(),
            "-c".to_string(),
            ports.command.to_string(),
            "-e".to_string(),
            ports.event.to_string(),
        ]
    }
}

// ============================================================================
// Configuration File
// ============================================================================

/// On-disk launch configuration; every field is optional
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaunchConfigFile {
    pub ldb_path: Option<PathBuf>,
    pub script: Option<PathBuf>,
    pub command_port: Option<u16>,
    pub event_port: Option<u16>,
    pub working_directory: Option<PathBuf>,
    /// `0` disables the request deadline
    pub request_timeout_ms: Option<u64>,
    pub terminate_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub connect_retry_ms: Option<u64>,
    pub global_labels: Option<bool>,
    pub output_log: Option<PathBuf>,
}

impl LaunchConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::FileParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// `0` means no deadline
pub fn request_timeout_from_millis(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

// ============================================================================
// Configuration Builder
// ============================================================================

/// Builder for LaunchConfig with validation and defaults
#[derive(Debug, Default)]
pub struct LaunchConfigBuilder {
    ldb_path: Option<PathBuf>,
    script: Option<PathBuf>,
    command_port: Option<u16>,
    event_port: Option<u16>,
    working_directory: Option<PathBuf>,
    host: Option<IpAddr>,
    connect_timeout: Option<Duration>,
    connect_retry_interval: Option<Duration>,
    output_log: Option<PathBuf>,
    request_timeout: Option<Option<Duration>>,
    terminate_timeout: Option<Duration>,
    global_labels: Option<GlobalLabels>,
    notification_capacity: Option<usize>,
}

impl LaunchConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the values of a configuration file
    pub fn from_file(file: LaunchConfigFile) -> Self {
        Self {
            ldb_path: file.ldb_path,
            script: file.script,
            command_port: file.command_port,
            event_port: file.event_port,
            working_directory: file.working_directory,
            connect_timeout: file.connect_timeout_ms.map(Duration::from_millis),
            connect_retry_interval: file.connect_retry_ms.map(Duration::from_millis),
            output_log: file.output_log,
            request_timeout: file.request_timeout_ms.map(request_timeout_from_millis),
            terminate_timeout: file.terminate_timeout_ms.map(Duration::from_millis),
            global_labels: file.global_labels.map(|include| {
                if include {
                    GlobalLabels::Include
                } else {
                    GlobalLabels::Omit
                }
            }),
            ..Self::default()
        }
    }

    /// Set the path to the ldb executable
    pub fn ldb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ldb_path = Some(path.into());
        self
    }

    /// Set the Lua script to debug
    pub fn script(mut self, path: impl Into<PathBuf>) -> Self {
        self.script = Some(path.into());
        self
    }

    pub fn command_port(mut self, port: u16) -> Self {
        self.command_port = Some(port);
        self
    }

    pub fn event_port(mut self, port: u16) -> Self {
        self.event_port = Some(port);
        self
    }

    pub fn working_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(path.into());
        self
    }

    pub fn host(mut self, host: IpAddr) -> Self {
        self.host = Some(host);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn connect_retry_interval(mut self, interval: Duration) -> Self {
        self.connect_retry_interval = Some(interval);
        self
    }

    pub fn output_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_log = Some(path.into());
        self
    }

    /// Set the command deadline; `None` waits forever
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = Some(timeout);
        self
    }

    pub fn global_labels(mut self, labels: GlobalLabels) -> Self {
        self.global_labels = Some(labels);
        self
    }

    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<LaunchConfig, ConfigError> {
        let ldb_path = self
            .ldb_path
            .ok_or_else(|| ConfigError::missing_field("ldb_path"))?;
        let script = self
            .script
            .ok_or_else(|| ConfigError::missing_field("script"))?;

        let ldb_path = Self::resolve_executable(&ldb_path)?;
        let script = Self::validate_script(&script)?;

        let working_directory = match self.working_directory {
            Some(dir) => dir,
            None => script
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        Self::validate_working_directory(&working_directory)?;

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            terminate_timeout: self
                .terminate_timeout
                .unwrap_or(defaults.terminate_timeout),
            global_labels: self.global_labels.unwrap_or(defaults.global_labels),
            notification_capacity: self
                .notification_capacity
                .unwrap_or(defaults.notification_capacity)
                .max(1),
        };

        let connect_timeout = self
            .connect_timeout
            .unwrap_or(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS));
        let connect_retry_interval = self
            .connect_retry_interval
            .unwrap_or(Duration::from_millis(DEFAULT_CONNECT_RETRY_MS));

        Self::validate_timeouts(connect_timeout, connect_retry_interval, &session)?;
        Self::validate_ports(self.command_port, self.event_port)?;

        Ok(LaunchConfig {
            ldb_path,
            script,
            command_port: self.command_port.filter(|port| *port != 0),
            event_port: self.event_port.filter(|port| *port != 0),
            working_directory,
            host: self.host.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            connect_timeout,
            connect_retry_interval,
            output_log: self.output_log,
            session,
        })
    }

    /// Check the executable exists; bare names are looked up on `PATH`
    fn resolve_executable(path: &Path) -> Result<PathBuf, ConfigError> {
        if path.as_os_str().is_empty() {
            return Err(ConfigError::invalid_path(path, "ldb path cannot be empty"));
        }

        if path.components().count() == 1 && !path.exists() {
            let found = std::env::var_os("PATH").and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(path))
                    .find(|candidate| candidate.is_file())
            });
            return found.ok_or_else(|| {
                ConfigError::invalid_path(path, "ldb executable not found on PATH")
            });
        }

        if !path.is_file() {
            return Err(ConfigError::invalid_path(
                path,
                "ldb executable does not exist or is not a file",
            ));
        }

        Ok(path.to_path_buf())
    }

    /// Check the script exists and make it absolute
    fn validate_script(path: &Path) -> Result<PathBuf, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::invalid_path(
                path,
                "Lua script does not exist or is not a file",
            ));
        }

        std::fs::canonicalize(path).map_err(|e| ConfigError::invalid_path(path, e.to_string()))
    }

    fn validate_working_directory(path: &Path) -> Result<(), ConfigError> {
        if !path.is_dir() {
            return Err(ConfigError::invalid_path(
                path,
                "Working directory does not exist or is not a directory",
            ));
        }
        Ok(())
    }

    fn validate_timeouts(
        connect_timeout: Duration,
        retry_interval: Duration,
        session: &SessionConfig,
    ) -> Result<(), ConfigError> {
        if connect_timeout.is_zero() {
            return Err(ConfigError::invalid_timeout(
                connect_timeout,
                "Connect timeout must be greater than zero",
            ));
        }

        if connect_timeout > Duration::from_secs(MAX_CONNECT_TIMEOUT_SECS) {
            return Err(ConfigError::invalid_timeout(
                connect_timeout,
                "Connect timeout too long (max 5 minutes)",
            ));
        }

        if retry_interval.is_zero() || retry_interval > connect_timeout {
            return Err(ConfigError::invalid_timeout(
                retry_interval,
                "Retry interval must be greater than zero and within the connect timeout",
            ));
        }

        if let Some(timeout) = session.request_timeout
            && timeout.is_zero()
        {
            return Err(ConfigError::invalid_timeout(
                timeout,
                "Request timeout must be greater than zero",
            ));
        }

        if session.terminate_timeout.is_zero() {
            return Err(ConfigError::invalid_timeout(
                session.terminate_timeout,
                "Terminate timeout must be greater than zero",
            ));
        }

        Ok(())
    }

    fn validate_ports(command: Option<u16>, event: Option<u16>) -> Result<(), ConfigError> {
        match (command, event) {
            (Some(command), Some(event)) if command == event && command != 0 => {
                Err(ConfigError::DuplicatePort { port: command })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _dir: TempDir,
        ldb: PathBuf,
        script: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let ldb = dir.path().join("ldb");
        std::fs::write(&ldb, "#!/bin/sh\n").unwrap();
        let script = dir.path().join("sort.lua");
        std::fs::write(&script, "print('hi')\n").unwrap();
        Fixture {
            _dir: dir,
            ldb,
            script,
        }
    }

    #[test]
    fn test_builder_defaults() {
        let fx = fixture();

        let config = LaunchConfig::builder()
            .ldb_path(&fx.ldb)
            .script(&fx.script)
            .build()
            .unwrap();

        assert_eq!(config.ldb_path, fx.ldb);
        assert!(config.script.is_absolute());
        assert_eq!(
            config.working_directory,
            std::fs::canonicalize(fx.script.parent().unwrap()).unwrap()
        );
        assert_eq!(config.command_port, None);
        assert_eq!(
            config.session.request_timeout,
            Some(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
        );
        assert_eq!(config.session.global_labels, GlobalLabels::Include);
        assert_eq!(config.connect_timeout, Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS));
    }

    #[test]
    fn test_builder_full() {
        let fx = fixture();

        let config = LaunchConfig::builder()
            .ldb_path(&fx.ldb)
            .script(&fx.script)
            .command_port(4000)
            .event_port(4001)
            .request_timeout(None)
            .terminate_timeout(Duration::from_millis(500))
            .connect_timeout(Duration::from_secs(3))
            .global_labels(GlobalLabels::Omit)
            .output_log("/tmp/ldb-output.log")
            .build()
            .unwrap();

        assert_eq!(config.command_port, Some(4000));
        assert_eq!(config.event_port, Some(4001));
        assert_eq!(config.session.request_timeout, None);
        assert_eq!(config.session.terminate_timeout, Duration::from_millis(500));
        assert_eq!(config.session.global_labels, GlobalLabels::Omit);
        assert_eq!(config.output_log, Some(PathBuf::from("/tmp/ldb-output.log")));
    }

    #[test]
    fn test_missing_fields() {
        let result = LaunchConfigBuilder::new().build();
        assert!(result.unwrap_err().to_string().contains("ldb_path"));

        let fx = fixture();
        let result = LaunchConfigBuilder::new().ldb_path(&fx.ldb).build();
        assert!(result.unwrap_err().to_string().contains("script"));
    }

    #[test]
    fn test_missing_paths_fail_fast() {
        let fx = fixture();

        let result = LaunchConfig::builder()
            .ldb_path(fx.ldb.with_file_name("missing-ldb"))
            .script(&fx.script)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidPath { .. })));

        let result = LaunchConfig::builder()
            .ldb_path(&fx.ldb)
            .script(fx.script.with_file_name("missing.lua"))
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidPath { .. })));

        let result = LaunchConfig::builder()
            .ldb_path("definitely-not-an-ldb-binary-on-path")
            .script(&fx.script)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidPath { .. })));
    }

    #[test]
    fn test_invalid_timeouts() {
        let fx = fixture();

        let result = LaunchConfig::builder()
            .ldb_path(&fx.ldb)
            .script(&fx.script)
            .connect_timeout(Duration::ZERO)
            .build();
        assert!(result.unwrap_err().to_string().contains("timeout"));

        let result = LaunchConfig::builder()
            .ldb_path(&fx.ldb)
            .script(&fx.script)
            .request_timeout(Some(Duration::ZERO))
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidTimeout { .. })));
    }

    #[test]
    fn test_duplicate_ports() {
        let fx = fixture();

        let result = LaunchConfig::builder()
            .ldb_path(&fx.ldb)
            .script(&fx.script)
            .command_port(4000)
            .event_port(4000)
            .build();
        assert!(matches!(result, Err(ConfigError::DuplicatePort { port: 4000 })));
    }

    #[test]
    fn test_ldb_args() {
        let fx = fixture();
        let config = LaunchConfig::builder()
            .ldb_path(&fx.ldb)
            .script(&fx.script)
            .build()
            .unwrap();

        let args = config.ldb_args(PortPair {
            command: 5000,
            event: 5001,
        });
        let script = config.script.to_string_lossy().into_owned();
        assert_eq!(
            args,
            vec!["-n", &script, "-b", "true", "-t", "ide", "-c", "5000", "-e", "5001"]
        );
    }

    #[test]
    fn test_config_file() {
        let fx = fixture();
        let file_path = fx.script.with_file_name("launch.json");
        let json = serde_json::json!({
            "ldb_path": fx.ldb,
            "script": fx.script,
            "request_timeout_ms": 0,
            "connect_timeout_ms": 2500,
            "global_labels": false
        });
        std::fs::write(&file_path, json.to_string()).unwrap();

        let file = LaunchConfigFile::load(&file_path).unwrap();
        let config = LaunchConfigBuilder::from_file(file)
            .event_port(6001)
            .build()
            .unwrap();

        assert_eq!(config.session.request_timeout, None);
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.session.global_labels, GlobalLabels::Omit);
        assert_eq!(config.event_port, Some(6001));
    }

    #[test]
    fn test_config_file_errors() {
        let fx = fixture();

        let missing = LaunchConfigFile::load(&fx.script.with_file_name("nope.json"));
        assert!(matches!(missing, Err(ConfigError::FileRead { .. })));

        let bad = fx.script.with_file_name("bad.json");
        std::fs::write(&bad, r#"{"ldb_path": 5}"#).unwrap();
        assert!(matches!(
            LaunchConfigFile::load(&bad),
            Err(ConfigError::FileParse { .. })
        ));

        let unknown = fx.script.with_file_name("unknown.json");
        std::fs::write(&unknown, r#"{"colour": "blue"}"#).unwrap();
        assert!(matches!(
            LaunchConfigFile::load(&unknown),
            Err(ConfigError::FileParse { .. })
        ));
    }
}
