//! Client for the ldb Lua debugger
//!
//! ldb exposes a running Lua script over two TCP connections: a command
//! channel answering one reply line per request, and an event channel
//! pushing state changes. This crate launches ldb, speaks both channels and
//! keeps a stack and variable model of every suspension.

pub mod debugger;
pub mod io;
pub mod logging;
pub mod model;
pub mod protocol;

#[cfg(test)]
mod test_utils;

pub use debugger::{DebugError, DebugNotification, DebugTarget, LaunchConfig, Launcher, RunState};
