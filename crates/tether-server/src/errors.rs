//! Process-level setup errors.
//!
//! Transport failures never surface here: they end up as a connection's
//! terminal [`ConnectionError`](tether_core::ConnectionError).

use thiserror::Error;

/// Errors starting or running the hub listener.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Neither the configured port nor an ephemeral port could be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address that was tried last.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The machine hostname could not be resolved for a `*` bind.
    #[error("failed to resolve hostname: {0}")]
    Hostname(#[source] std::io::Error),

    /// Settings were rejected.
    #[error(transparent)]
    Settings(#[from] tether_settings::SettingsError),

    /// Other socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for listener setup.
pub type Result<T> = std::result::Result<T, IpcError>;
