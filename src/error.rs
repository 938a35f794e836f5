//! Error types for ch-stream.
//!
//! Defines the error enum shared by the transports, the progress sources and
//! the execution coordinator.

use thiserror::Error;

/// Main error type for ch-stream operations.
#[derive(Error, Debug)]
pub enum StreamError {
    /// The server could not be reached or the primary request could not be opened.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Read failure on an already opened result stream.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered with something we cannot interpret
    /// (malformed HTTP head, bad progress header, wrong row/column count).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server rejected a service request (non-2xx status).
    #[error("Server error: {0}")]
    Server(String),

    /// Configuration errors (invalid config file, bad connection URL, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local sink write failures.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StreamError {
    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a transport error with the given message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a protocol error with the given message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Creates a server error with the given message.
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection(_) => "Connection Error",
            Self::Transport(_) => "Transport Error",
            Self::Protocol(_) => "Protocol Error",
            Self::Server(_) => "Server Error",
            Self::Config(_) => "Configuration Error",
            Self::Io(_) => "I/O Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using StreamError.
pub type Result<T> = std::result::Result<T, StreamError>;
