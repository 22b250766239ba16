//! Connection failure taxonomy.
//!
//! A closed connection carries at most one [`ConnectionError`]. A clean close
//! (peer hung up, local `close(None)`) carries none. Variants hold rendered
//! messages so the error can be cloned out to every observer of the close.

use thiserror::Error;

/// Why a connection closed abnormally.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer could not be reached at all.
    #[error("connection refused: {0}")]
    Refused(String),

    /// The peer answered but the upgrade handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Transport read or write failure.
    #[error("io error: {0}")]
    Io(String),

    /// WebSocket protocol error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The address could not be parsed or uses an unsupported scheme.
    #[error("invalid address '{address}': {reason}")]
    InvalidAddress {
        /// Address as given.
        address: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The peer did not answer a keepalive ping in time.
    #[error("keepalive timed out")]
    KeepaliveTimeout,

    /// The transport ended before the connection finished opening.
    #[error("connection closed before it opened")]
    Closed,
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
