//! Event channel
//!
//! The debuggee pushes one line per state change on the event socket. A
//! background listener parses each line and forwards it on an mpsc queue in
//! arrival order; the session consumes the queue on its own task.

use regex::Regex;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, trace, warn};

use crate::io::transport::Transport;
use crate::log_wire_message;
use crate::protocol::framing::LineFraming;

/// Why the debuggee stopped
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SuspendReason {
    Client,
    Step,
    Breakpoint { line: u32 },
    Other(String),
}

impl fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendReason::Client => f.write_str("client request"),
            SuspendReason::Step => f.write_str("step"),
            SuspendReason::Breakpoint { line } => write!(f, "breakpoint at line {line}"),
            SuspendReason::Other(reason) => f.write_str(reason),
        }
    }
}

/// Why the debuggee continued
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResumeReason {
    Client,
    Step,
    Other(String),
}

/// One parsed event line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// Script loaded and about to run
    Started,
    Resumed(ResumeReason),
    Suspended(SuspendReason),
    /// Script finished
    Terminated,
    /// Script failed to load; the debuggee exits afterwards
    SyntaxError { file: String, message: String },
    /// Event socket closed by the peer
    Disconnected { reason: String },
    /// Line not in the known vocabulary
    Unknown(String),
}

/// Event parser trait for testing and extensibility
pub trait EventParser: Send + Sync {
    /// Parse one event line
    fn parse_line(&self, line: &str) -> DebugEvent;
}

/// Parser for the ldb event vocabulary
#[derive(Clone)]
pub struct LdbEventParser {
    suspended_regex: Regex,
    resumed_regex: Regex,
    syntax_error_regex: Regex,
}

impl LdbEventParser {
    /// Create a new ldb event parser with compiled regex patterns
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            // suspended breakpoint 12
            suspended_regex: Regex::new(r"^suspended\s+(\w+)(?:\s+(\d+))?\s*$")?,

            // resumed client
            resumed_regex: Regex::new(r"^resumed\s+(\w+)\s*$")?,

            // syntaxerror | foo.lua | '=' expected near 'x'
            syntax_error_regex: Regex::new(r"^syntaxerror\s*\|\s*(.*?)\s*\|\s*(.*?)\s*$")?,
        })
    }
}

impl Default for LdbEventParser {
    fn default() -> Self {
        Self::new().expect("Failed to compile regex patterns")
    }
}

impl EventParser for LdbEventParser {
    fn parse_line(&self, line: &str) -> DebugEvent {
        let line = line.trim();

        match line {
            "started" => return DebugEvent::Started,
            "terminated" => return DebugEvent::Terminated,
            _ => {}
        }

        if let Some(captures) = self.suspended_regex.captures(line) {
            let reason = &captures[1];
            let line_number = captures.get(2).and_then(|m| m.as_str().parse().ok());

            let reason = match (reason, line_number) {
                ("breakpoint", Some(line)) => SuspendReason::Breakpoint { line },
                ("step", _) => SuspendReason::Step,
                ("client", _) => SuspendReason::Client,
                (other, _) => SuspendReason::Other(other.to_string()),
            };
            return DebugEvent::Suspended(reason);
        }

        if let Some(captures) = self.resumed_regex.captures(line) {
            let reason = match &captures[1] {
                "client" => ResumeReason::Client,
                "step" => ResumeReason::Step,
                other => ResumeReason::Other(other.to_string()),
            };
            return DebugEvent::Resumed(reason);
        }

        if let Some(captures) = self.syntax_error_regex.captures(line) {
            return DebugEvent::SyntaxError {
                file: captures[1].to_string(),
                message: captures[2].to_string(),
            };
        }

        trace!("Unrecognized event line: {}", line);
        DebugEvent::Unknown(line.to_string())
    }
}

/// Background listener on the event socket
pub struct EventChannel {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EventChannel {
    /// Start listening; parsed events are sent to `sender` in arrival order
    pub fn spawn<T, P>(transport: T, parser: P, sender: mpsc::UnboundedSender<DebugEvent>) -> Self
    where
        T: Transport + 'static,
        P: EventParser + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listen(
            LineFraming::new(transport),
            parser,
            sender,
            cancel.clone(),
        ));
        Self { cancel, task }
    }

    /// Token that stops the listener when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the listener and wait for it to exit
    ///
    /// No event is dispatched after this returns.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await
            && !e.is_cancelled()
        {
            warn!("Event listener task failed: {}", e);
        }
    }
}

async fn listen<T, P>(
    mut framing: LineFraming<T>,
    parser: P,
    sender: mpsc::UnboundedSender<DebugEvent>,
    cancel: CancellationToken,
) where
    T: Transport,
    P: EventParser,
{
    debug!("Event listener started");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                trace!("Event listener cancelled");
                break;
            }

            received = framing.receive() => match received {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    log_wire_message!(Level::DEBUG, "event", "incoming", &line);

                    let event = parser.parse_line(&line);
                    if cancel.is_cancelled() || sender.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if !cancel.is_cancelled() {
                        debug!("Event channel closed: {}", e);
                        let _ = sender.send(DebugEvent::Disconnected {
                            reason: e.to_string(),
                        });
                    }
                    break;
                }
            },
        }
    }

    if let Err(e) = framing.close().await {
        trace!("Error closing event transport: {}", e);
    }
    debug!("Event listener stopped");
}
