//! Errors.

use std::fmt::{Display, Formatter};

/// Various errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Generic socket failure (connect, read, write, flush).
    SocketError(String),
    /// Failure on the client side of the relay.
    ClientSocketError(String),
    /// Failure on the backend side of the relay.
    ServerSocketError(String),
    /// The two sides disagree about the protocol state.
    ProtocolSyncError(String),
    /// The backend rejected or aborted the startup exchange.
    ServerStartupError(String, ServerIdentifier),
    /// No backend connection could be produced for this acquire.
    PoolExhausted(String),
    /// A connection could not be shelved back into its slot.
    PoolReturnFailed(String),
    /// The worker management socket could not be bound.
    BindFailed(String),
    BadConfig(String),
    ShuttingDown,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::SocketError(msg) => write!(f, "socket error: {msg}"),
            Error::ClientSocketError(msg) => write!(f, "client socket error: {msg}"),
            Error::ServerSocketError(msg) => write!(f, "server socket error: {msg}"),
            Error::ProtocolSyncError(msg) => write!(f, "protocol synchronization error: {msg}"),
            Error::ServerStartupError(msg, id) => write!(f, "error on server startup {id}: {msg}"),
            Error::PoolExhausted(msg) => {
                write!(f, "could not get a connection from the pool: {msg}")
            }
            Error::PoolReturnFailed(msg) => {
                write!(f, "could not return a connection to the pool: {msg}")
            }
            Error::BindFailed(msg) => write!(f, "bind failed: {msg}"),
            Error::BadConfig(msg) => write!(f, "bad configuration: {msg}"),
            Error::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

impl std::error::Error for Error {}

/// Identifies a backend the pool talks to, for error context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentifier {
    pub username: String,
    pub database: String,
}

impl ServerIdentifier {
    pub fn new(username: &str, database: &str) -> ServerIdentifier {
        ServerIdentifier {
            username: username.into(),
            database: database.into(),
        }
    }
}

impl Display for ServerIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let Self { username, database } = self;
        write!(f, "{{ username: {username}, database: {database} }}")
    }
}
