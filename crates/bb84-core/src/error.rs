//! Error types for the BB84 core pipeline and frame codec.

use thiserror::Error;

/// Key pipeline errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// XOR stream requested with an empty key
    #[error("key is empty")]
    EmptyKey,

    /// Check-bit index outside the key
    #[error("index {index} out of range for key of length {len}")]
    IndexOutOfRange {
        /// Offending index
        index: usize,
        /// Key length
        len: usize,
    },
}

/// Frame-level errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Line was neither a structured frame nor a legacy plain message
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Line exceeded the configured maximum length
    #[error("frame too long: limit is {limit} bytes")]
    TooLong {
        /// Configured limit
        limit: usize,
    },

    /// Peer closed the stream
    #[error("connection closed by peer")]
    Closed,

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be encoded
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
