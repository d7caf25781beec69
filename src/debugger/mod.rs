//! Debug session layer
//!
//! Ties the protocol channels and the stack model into a debug target with a
//! run state machine, and launches ldb to attach one to.

pub mod config;
pub mod error;
pub mod launcher;
pub mod state;
pub mod target;

pub use config::{LaunchConfig, LaunchConfigBuilder, LaunchConfigFile, SessionConfig};
pub use error::{ConfigError, DebugError};
pub use launcher::{LaunchedSession, Launcher};
pub use state::RunState;
pub use target::{DebugNotification, DebugTarget};
