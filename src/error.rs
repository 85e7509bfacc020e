//! Error types for the drishti-vrd daemon

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Daemon error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// The dispatcher's control channel is closed (the dispatch loop is gone)
    #[error("Event dispatcher is no longer running")]
    DispatcherGone,

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Client violated the wire protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Message id not known to this protocol version
    #[error("Unknown message id: {0:#06x}")]
    UnknownMessage(u16),

    /// Message shorter than its fixed layout requires
    #[error("Truncated message: needed {needed} more byte(s), {available} available")]
    TruncatedMessage {
        /// Bytes the next field requires
        needed: usize,
        /// Bytes left in the buffer
        available: usize,
    },

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}
