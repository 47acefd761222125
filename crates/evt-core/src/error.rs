//! Error types for evt-core.

use thiserror::Error;

/// Main error type for everterm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation or malformed packet.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Codec error during frame encoding/decoding.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Invalid configuration (CLI, passkey, tunnel spec).
    #[error("config error: {message}")]
    Config { message: String },

    /// Transport layer error.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// Port forward error.
    #[error("forward error: {message}")]
    Forward { message: String },

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Channel is shutting down and refuses new work.
    #[error("channel shutting down")]
    ShuttingDown,
}

impl Error {
    /// Returns true if this error is transient and reconnection may help.
    ///
    /// Transient errors are network failures where the server session may
    /// still be alive and a resume handshake could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::ConnectionClosed | Error::Timeout | Error::Io(_)
        )
    }

    /// Returns true if this error is fatal and reconnection won't help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol { .. } | Error::Codec { .. } | Error::Config { .. }
        )
    }

    /// Shorthand for a protocol error with a formatted message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Shorthand for a config error with a formatted message.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }
}

/// Convenience result type for everterm operations.
pub type Result<T> = std::result::Result<T, Error>;
