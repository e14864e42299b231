//! Error types and handling for the flight server core.
//!
//! This module defines the error types that can occur during server operations,
//! providing clear categorization of the different failure modes. None of these
//! are fatal to the process: stage errors lead to a restart, routing errors are
//! logged and dropped, and persistence errors become acknowledgements.

use crate::auth::AuthError;
use crate::connection::{ConnectionId, Role};
use crate::store::StoreError;

/// Top-level server errors surfaced by the public entry points.
///
/// Categorizes errors into network-related and internal server errors
/// to help with debugging and error handling.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Network-related errors such as binding failures or connection issues
    #[error("Network error: {0}")]
    Network(String),

    /// Internal server errors including stage failures and wiring problems
    #[error("Internal error: {0}")]
    Internal(String),

    /// A stage failed to open during startup
    #[error("Stage '{stage}' failed to open: {source}")]
    StageOpen {
        stage: String,
        #[source]
        source: StageError,
    },
}

/// Errors raised by a pipeline stage while opening or stepping.
///
/// A step error is treated exactly like a panic in the stage: the supervisor
/// logs it and restarts the stage with the same worker instance.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Socket or file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A hand-off queue the stage depends on has been closed
    #[error("Queue '{0}' closed")]
    QueueClosed(&'static str),

    /// The stage was stepped before it was opened
    #[error("Stage not open")]
    NotOpen,

    /// Any other failure with a description
    #[error("{0}")]
    Other(String),
}

/// Errors raised by the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// A connection with the same id is already registered
    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    /// The connection id does not resolve to a live connection
    #[error("Connection {0} not found")]
    NotFound(ConnectionId),
}

/// Errors raised by the queueing pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool has been shut down and no longer accepts work
    #[error("Pool '{0}' is shut down")]
    ShutDown(String),

    /// A worker thread could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// Why the router refused a client message.
///
/// Every variant is reported back to the sender as a negative
/// acknowledgement carrying the display text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouteError {
    /// The message requires a completed login
    #[error("Not logged in")]
    NotLoggedIn,

    /// The sender's role may not send this message
    #[error("Not permitted for role {0}")]
    WrongRole(Role),

    /// The referenced connection is gone or has the wrong role
    #[error("Connection {0} is not available")]
    Unavailable(ConnectionId),

    /// The message content was rejected
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Login failed: {0}")]
    Auth(#[from] AuthError),
}
