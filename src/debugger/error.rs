//! Error types for debug sessions
//!
//! `DebugError` is what every public session and launch operation returns.
//! Lower layers keep their own error enums; conversions below map them onto
//! the session taxonomy.

use std::path::PathBuf;
use std::time::Duration;

use crate::io::ports::PortError;
use crate::io::process::ProcessError;
use crate::model::ModelError;
use crate::protocol::{CommandError, ProtocolError};

// ============================================================================
// Session Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    /// Launch configuration is unusable
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Socket refused, reset or closed
    #[error("Connection error: {reason}")]
    Connection { reason: String },

    /// Malformed data from the debuggee
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// No free port could be found for the debuggee
    #[error("Port exhaustion: {0}")]
    PortExhaustion(#[source] PortError),

    /// No reply within the configured deadline
    #[error("Operation timeout: {operation} took longer than {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The debuggee answered with an error reply
    #[error("Command {command:?} rejected: {reply}")]
    Rejected { command: String, reply: String },

    /// Debuggee process could not be started or stopped
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Operation not legal in the current run state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Caller input that cannot be put on the wire
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// No frame with this ordinal in the current suspension
    #[error("No stack frame {id} in the current suspension")]
    UnknownFrame { id: usize },

    /// Session already terminated
    #[error("Debug session terminated")]
    Terminated,
}

impl DebugError {
    /// Whether the session cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DebugError::Connection { .. } | DebugError::Terminated | DebugError::Process(_)
        )
    }
}

impl From<CommandError> for DebugError {
    fn from(error: CommandError) -> Self {
        match error {
            CommandError::Connection { command, message } => DebugError::Connection {
                reason: format!("{message} (while sending {command:?})"),
            },
            CommandError::Timeout { command, timeout } => DebugError::Timeout {
                operation: command,
                timeout,
            },
            CommandError::Rejected { command, reply } => DebugError::Rejected { command, reply },
            CommandError::InvalidCommand { command, reason } => DebugError::InvalidArgument {
                reason: format!("{reason} in {command:?}"),
            },
            CommandError::Closed => DebugError::Connection {
                reason: "command channel closed".to_string(),
            },
        }
    }
}

impl From<ModelError> for DebugError {
    fn from(error: ModelError) -> Self {
        match error {
            ModelError::Command(e) => e.into(),
            ModelError::Protocol(e) => e.into(),
        }
    }
}

impl From<PortError> for DebugError {
    fn from(error: PortError) -> Self {
        match error {
            PortError::Exhausted { .. } => DebugError::PortExhaustion(error),
            PortError::ConnectTimeout { .. } => DebugError::Connection {
                reason: error.to_string(),
            },
        }
    }
}

// ============================================================================
// Configuration Errors
// ============================================================================

/// Configuration validation and loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Missing required configuration field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Path missing or of the wrong kind
    #[error("Invalid path: {path} - {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// Invalid timeout value
    #[error("Invalid timeout: {timeout:?} - {reason}")]
    InvalidTimeout { timeout: Duration, reason: String },

    /// Command and event port configured to the same number
    #[error("Command and event port are both {port}")]
    DuplicatePort { port: u16 },

    /// Configuration file could not be read
    #[error("Cannot read configuration file {path}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid JSON for a launch configuration
    #[error("Cannot parse configuration file {path}")]
    FileParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_timeout(timeout: Duration, reason: impl Into<String>) -> Self {
        Self::InvalidTimeout {
            timeout,
            reason: reason.into(),
        }
    }
}
