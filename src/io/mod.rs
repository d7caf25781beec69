//! I/O layer - Generic abstractions for process management and transport
//!
//! This module provides the I/O building blocks the debugger protocol runs on:
//!
//! - **Transport**: Pure I/O layer for bidirectional text exchange over TCP
//! - **Ports**: Free port allocation and connect-with-retry
//! - **Process**: Debuggee process lifecycle management with output draining
//!
//! None of these know about the ldb command vocabulary.

pub mod ports;
pub mod process;
pub mod transport;

// Re-export main types for convenience
pub use ports::{PortAllocator, PortError, PortPair, connect_with_retry};
pub use process::{
    ChildProcessManager, OutputHandler, OutputMonitor, OutputStream, ProcessError, ProcessExitEvent,
    ProcessExitHandler, ProcessManager, ProcessState, StopMode,
};
pub use transport::{MockTransport, TcpTransport, TcpTransportError, Transport};
