use std::io;

use thiserror::Error;

/// Defines all possible errors that can occur while supervising servers.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Error binding a listener for an endpoint.
    #[error("failed to listen on '{endpoint}': {source}")]
    Bind {
        /// The endpoint that could not be bound.
        endpoint: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error stopping a supervised server.
    #[error("failed to stop server on '{endpoint}': {source}")]
    Stop {
        /// The endpoint whose server failed to stop.
        endpoint: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error spawning the successor process during an upgrade.
    #[error("failed to start successor process: {0}")]
    Upgrade(#[source] io::Error),

    /// Malformed listener-inheritance envelope left by the parent process.
    #[error("invalid inheritance envelope: {0}")]
    Inherit(String),

    /// Error reading or writing the PID file.
    #[error("PID file error: {0}")]
    PidFile(#[from] PidFileError),

    /// Error registering the supervisor's signal handlers.
    #[error("failed to register signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors raised by the PID file helper.
#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("failed to write PID file: {0}")]
    WriteError(#[source] io::Error),

    #[error("failed to read PID file: {0}")]
    ReadError(#[source] io::Error),

    #[error("failed to rename PID file: {0}")]
    RenameError(#[source] io::Error),

    #[error("PID file does not contain a decimal pid")]
    ParseError,
}
