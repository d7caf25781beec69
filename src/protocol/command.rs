//! Command channel
//!
//! Synchronous request/response exchange with the debuggee: one command
//! line out, exactly one reply line back. Requests never overlap; the shared
//! handle serializes callers behind an async mutex so replies cannot be
//! attributed to the wrong command.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{Level, debug, warn};

use crate::io::transport::Transport;
use crate::log_wire_message;
use crate::protocol::codec::Command;
use crate::protocol::framing::LineFraming;

/// Prefix ldb uses for replies to commands it could not execute
const ERROR_REPLY_PREFIX: &str = "ERROR";

/// Errors raised by a command round trip
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    #[error("Connection failure while sending {command:?}: {message}")]
    Connection { command: String, message: String },

    #[error("No reply to {command:?} within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Debuggee rejected {command:?}: {reply}")]
    Rejected { command: String, reply: String },

    /// Line was refused before sending; the channel stays usable
    #[error("Invalid command line {command:?}: {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("Command channel is closed")]
    Closed,
}

impl CommandError {
    /// Whether the channel is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, CommandError::Connection { .. } | CommandError::Closed)
    }
}

/// Something that can perform command round trips
///
/// Implemented by the live channel handle and by test doubles.
#[async_trait]
pub trait CommandSender: Send + Sync {
    /// Send one command and wait for its reply using the default timeout
    async fn request(&self, command: &Command) -> Result<String, CommandError>;

    /// Send one command with an explicit timeout (`None` waits forever)
    async fn request_with_timeout(
        &self,
        command: &Command,
        timeout: Option<Duration>,
    ) -> Result<String, CommandError>;

    /// Close the channel; later requests fail with [`CommandError::Closed`]
    async fn close(&self);
}

/// Request/response channel over a framed transport
pub struct CommandChannel<T: Transport> {
    framing: LineFraming<T>,
    timeout: Option<Duration>,
    /// Replies owed to commands that timed out; discarded before the next reply
    stale_replies: usize,
    awaiting_reply: bool,
    closed: bool,
}

impl<T: Transport> CommandChannel<T> {
    pub fn new(transport: T, timeout: Option<Duration>) -> Self {
        Self {
            framing: LineFraming::new(transport),
            timeout,
            stale_replies: 0,
            awaiting_reply: false,
            closed: false,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        !self.closed && self.framing.is_connected()
    }

    /// Get a reference to the underlying transport
    pub fn transport(&self) -> &T {
        self.framing.transport()
    }

    /// Send a command and return its reply line
    pub async fn send(&mut self, command: &Command) -> Result<String, CommandError> {
        let timeout = self.timeout;
        self.send_with_timeout(command, timeout).await
    }

    /// Send a command with an explicit timeout
    pub async fn send_with_timeout(
        &mut self,
        command: &Command,
        timeout: Option<Duration>,
    ) -> Result<String, CommandError> {
        let line = command.to_string();
        let reply = self.send_line_with_timeout(&line, timeout).await?;

        if reply.starts_with(ERROR_REPLY_PREFIX) {
            warn!(command = %line, %reply, "Debuggee rejected command");
            return Err(CommandError::Rejected {
                command: line,
                reply,
            });
        }

        Ok(reply)
    }

    /// Send a raw command line and return the raw reply line
    pub async fn send_line(&mut self, line: &str) -> Result<String, CommandError> {
        let timeout = self.timeout;
        self.send_line_with_timeout(line, timeout).await
    }

    async fn send_line_with_timeout(
        &mut self,
        line: &str,
        timeout: Option<Duration>,
    ) -> Result<String, CommandError> {
        if self.closed {
            return Err(CommandError::Closed);
        }
        if line.contains(['\n', '\r']) {
            return Err(CommandError::InvalidCommand {
                command: line.to_string(),
                reason: "line break inside a command".to_string(),
            });
        }

        match timeout {
            None => self.exchange(line).await,
            Some(limit) => match tokio::time::timeout(limit, self.exchange(line)).await {
                Ok(result) => result,
                Err(_) => {
                    if self.awaiting_reply {
                        self.awaiting_reply = false;
                        self.stale_replies += 1;
                    }
                    warn!(command = line, ?limit, "Command timed out");
                    Err(CommandError::Timeout {
                        command: line.to_string(),
                        timeout: limit,
                    })
                }
            },
        }
    }

    async fn exchange(&mut self, line: &str) -> Result<String, CommandError> {
        log_wire_message!(Level::DEBUG, "command", "outgoing", line);

        let sent = self.framing.send(line).await;
        sent.map_err(|e| self.connection_failure(line, e.to_string()))?;
        self.awaiting_reply = true;

        loop {
            let received = self.framing.receive().await;
            let reply = received.map_err(|e| self.connection_failure(line, e.to_string()))?;

            if self.stale_replies > 0 {
                self.stale_replies -= 1;
                debug!(%reply, "Discarding late reply to a timed out command");
                continue;
            }

            self.awaiting_reply = false;
            log_wire_message!(Level::DEBUG, "command", "incoming", &reply);
            return Ok(reply);
        }
    }

    fn connection_failure(&mut self, line: &str, message: String) -> CommandError {
        self.closed = true;
        self.awaiting_reply = false;
        CommandError::Connection {
            command: line.to_string(),
            message,
        }
    }

    /// Close the channel and its transport
    pub async fn close(&mut self) {
        if self.closed && !self.framing.is_connected() {
            return;
        }
        self.closed = true;
        if let Err(e) = self.framing.close().await {
            debug!("Error closing command transport: {}", e);
        }
    }
}

/// Cloneable handle serializing access to one [`CommandChannel`]
pub struct SharedCommandChannel<T: Transport> {
    inner: Arc<Mutex<CommandChannel<T>>>,
}

impl<T: Transport> Clone for SharedCommandChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> SharedCommandChannel<T> {
    pub fn new(channel: CommandChannel<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(channel)),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.is_connected()
    }
}

#[async_trait]
impl<T: Transport + 'static> CommandSender for SharedCommandChannel<T> {
    async fn request(&self, command: &Command) -> Result<String, CommandError> {
        self.inner.lock().await.send(command).await
    }

    async fn request_with_timeout(
        &self,
        command: &Command,
        timeout: Option<Duration>,
    ) -> Result<String, CommandError> {
        self.inner
            .lock()
            .await
            .send_with_timeout(command, timeout)
            .await
    }

    async fn close(&self) {
        self.inner.lock().await.close().await;
    }
}
