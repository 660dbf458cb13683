//! Continuous serving supervisor: keeps socket-based servers listening on
//! stable addresses across the process lifecycle, including zero-downtime
//! binary upgrades via fork-and-exec with inherited listening sockets.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
use clap as _;
#[cfg(test)]
use predicates as _;
use serde as _;
use serde_yaml as _;
use tracing_subscriber as _;

/// Listen targets and the listener abstraction.
pub mod endpoint;

/// Errors.
pub mod error;

/// Listener inheritance across exec.
pub mod inherit;

/// PID file handling.
pub mod pidfile;

/// The server capability set and registration fan-out.
pub mod server;

/// Signal decoding.
mod signal;

/// The signal-driven supervisor.
pub mod supervisor;

pub use endpoint::{Endpoint, Listener};
pub use error::{PidFileError, SupervisorError};
pub use server::Server;
pub use supervisor::{State, Supervisor};
