//! Free port allocation and connection establishment
//!
//! The debuggee listens on two ports chosen by us. Ports are picked by
//! binding ephemeral listeners on the loopback interface and releasing them
//! right before the debuggee is spawned.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::io::transport::TcpTransport;

/// Number of bind attempts before giving up on finding two distinct ports
pub const DEFAULT_PORT_ATTEMPTS: usize = 8;

/// Error types for port allocation and connection
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("No free port found after {attempts} attempts")]
    Exhausted {
        attempts: usize,
        #[source]
        source: Option<io::Error>,
    },

    #[error("Could not connect to {addr} within {timeout:?}")]
    ConnectTimeout {
        addr: SocketAddr,
        timeout: Duration,
        #[source]
        source: Option<io::Error>,
    },
}

/// Command and event port of one debug session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub command: u16,
    pub event: u16,
}

impl PortPair {
    /// Address of the command channel on `host`
    pub fn command_addr(&self, host: IpAddr) -> SocketAddr {
        SocketAddr::new(host, self.command)
    }

    /// Address of the event channel on `host`
    pub fn event_addr(&self, host: IpAddr) -> SocketAddr {
        SocketAddr::new(host, self.event)
    }
}

/// Picks free ephemeral TCP ports on a host interface
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: IpAddr,
    attempts: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            attempts: DEFAULT_PORT_ATTEMPTS,
        }
    }
}

impl PortAllocator {
    pub fn new(host: IpAddr, attempts: usize) -> Self {
        Self {
            host,
            attempts: attempts.max(1),
        }
    }

    /// Find one free port
    pub fn find_free_port(&self) -> Result<u16, PortError> {
        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.bind_ephemeral() {
                Ok(listener) => return local_port(&listener).map_err(|e| self.exhausted(Some(e))),
                Err(e) => {
                    trace!("Port allocation attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
            }
        }
        Err(self.exhausted(last_error))
    }

    /// Find two distinct free ports for the command and event channels
    ///
    /// Both listeners stay bound until both ports are known, so the OS
    /// cannot hand out the same port twice.
    pub fn allocate_pair(&self) -> Result<PortPair, PortError> {
        let mut last_error = None;

        for attempt in 1..=self.attempts {
            let pair = self
                .bind_ephemeral()
                .and_then(|first| self.bind_ephemeral().map(|second| (first, second)));

            match pair {
                Ok((first, second)) => {
                    let command = local_port(&first).map_err(|e| self.exhausted(Some(e)))?;
                    let event = local_port(&second).map_err(|e| self.exhausted(Some(e)))?;
                    if command != event {
                        debug!(command, event, "Allocated debugger ports");
                        return Ok(PortPair { command, event });
                    }
                    warn!("Port allocator returned the same port twice: {}", command);
                }
                Err(e) => {
                    trace!("Port pair allocation attempt {} failed: {}", attempt, e);
                    last_error = Some(e);
                }
            }
        }

        Err(self.exhausted(last_error))
    }

    fn bind_ephemeral(&self) -> io::Result<TcpListener> {
        TcpListener::bind(SocketAddr::new(self.host, 0))
    }

    fn exhausted(&self, source: Option<io::Error>) -> PortError {
        PortError::Exhausted {
            attempts: self.attempts,
            source,
        }
    }
}

fn local_port(listener: &TcpListener) -> io::Result<u16> {
    listener.local_addr().map(|addr| addr.port())
}

/// Connect to `addr`, retrying until the debuggee starts accepting or the
/// timeout elapses
pub async fn connect_with_retry(
    addr: SocketAddr,
    timeout: Duration,
    retry_interval: Duration,
) -> Result<TcpTransport, PortError> {
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());

        let result = tokio::time::timeout(remaining, TcpTransport::connect(addr)).await;
        let last_error = match result {
            Ok(Ok(transport)) => {
                debug!(%addr, attempts, "Connected to debuggee");
                return Ok(transport);
            }
            Ok(Err(e)) => match e {
                crate::io::transport::TcpTransportError::Io(io_error) => Some(io_error),
                other => Some(io::Error::other(other.to_string())),
            },
            Err(_) => None,
        };

        if Instant::now() + retry_interval >= deadline {
            return Err(PortError::ConnectTimeout {
                addr,
                timeout,
                source: last_error,
            });
        }

        trace!(%addr, attempts, "Debuggee not accepting yet, retrying");
        tokio::time::sleep(retry_interval).await;
    }
}
