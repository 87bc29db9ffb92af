//! Error types for the tiered cache engine

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can reach a caller of the cache engine.
///
/// Tier failures are absorbed inside the engine and never show up here; the
/// variants below cover configuration, caller-supplied fetch functions, and
/// decoding a cached value into the caller's type.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller-supplied fetch function failed.
    ///
    /// Shared so every caller coalesced onto the same fetch observes the same
    /// failure.
    #[error("Fetch failed for key {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: SharedError,
    },

    /// A cached or fetched value could not be converted to the requested type
    #[error("Serialization error for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Remote tier error
    #[error("Remote tier error: {0}")]
    Remote(#[from] RemoteError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

/// Cloneable wrapper around a fetch failure.
#[derive(Debug, Clone)]
pub struct SharedError(Arc<anyhow::Error>);

impl SharedError {
    pub fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    /// Access the underlying error
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// True when both handles point at the same failure
    pub fn ptr_eq(&self, other: &SharedError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Display for SharedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for SharedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Errors raised by a remote key-value store.
///
/// The remote tier uses the classification to decide whether a failure only
/// fails the current operation or also drops the connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Service unreachable, connection refused or reset, connect timeout
    #[error("connection error: {0}")]
    Connection(String),

    /// A single operation exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Service answered with something we could not use
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Stored payload could not be decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Tier is not connected and no connection attempt is allowed right now
    #[error("not connected")]
    NotConnected,
}

impl RemoteError {
    /// Connection-class errors flip the tier to disconnected
    pub fn is_connection(&self) -> bool {
        matches!(self, RemoteError::Connection(_) | RemoteError::NotConnected)
    }
}
