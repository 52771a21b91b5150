//! Fatal error kinds surfaced during startup and shutdown.
//!
//! Request-level failures (bad parse, missing file, permission bits) are not
//! errors in this sense: they become HTTP status codes inside the connection
//! object and the session continues. Everything in [`ServerError`] terminates
//! the process with a message on stderr.

use std::io;

use thiserror::Error;

/// Errors that abort server startup or an orderly shutdown.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket setup, event-loop registration, or signal-pipe failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Database pool initialization failed; one of the handles could not
    /// authenticate.
    #[error("database error: {0}")]
    Db(#[from] mysql::Error),

    /// The global logger was initialized twice, or another logger was
    /// already installed.
    #[error("logger already initialized")]
    LoggerInit,
}
