//! Discovery error types

use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket could not be created or bound
    #[error("failed to bind discovery socket: {0}")]
    Bind(String),

    /// Announcement could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Datagram was not a valid announcement
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Datagram exceeded the announcement size limit
    #[error("announcement too large: {size} bytes (max {max})")]
    TooLarge {
        /// Encoded size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Socket I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
