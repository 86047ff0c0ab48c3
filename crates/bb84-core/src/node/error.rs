//! Error types for the Node API
//!
//! Every variant terminates a single exchange or connection only; none of
//! them take down the accept loop. Errors are categorized to help callers
//! decide whether a retry makes sense.
//!
//! # Error Categories
//!
//! - **Transient**: transport failures and timeouts, may succeed on retry
//! - **Permanent**: unknown peers, bad configuration, rejected keys
//!
//! There is no automatic retry; that is left to the caller.
//!
//! # Example
//!
//! ```no_run
//! use bb84_core::node::NodeError;
//!
//! fn handle_error(err: NodeError) {
//!     if err.is_transient() {
//!         println!("Transient error, may retry: {}", err);
//!     } else {
//!         println!("Permanent error: {}", err);
//!     }
//! }
//! ```

use crate::error::{FrameError, KeyError};
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in Node operations
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    // ============ Addressing Errors ============
    /// Target name not present in the peer directory
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    // ============ Transport Errors ============
    /// Connect, send or receive failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    // ============ Protocol Errors ============
    /// Malformed or out-of-order frame, or mismatched sequence lengths
    #[error("Protocol violation: {0}")]
    Protocol(Cow<'static, str>),

    /// Check-bit error rate above threshold, or no usable check bits
    #[error("Key verification failed: {0}")]
    Verification(Cow<'static, str>),

    /// Ciphertext arrived before a key was established
    #[error("No key available for decryption")]
    DecryptionUnavailable,

    /// Privacy amplification left no key to encrypt with
    ///
    /// Only an empty sifted key amplifies to nothing, and an empty sifted key
    /// has no check bits, which a conforming responder already rejects. This
    /// guards against responders that confirm such a key anyway.
    #[error("Insufficient key material: sifted key of {sifted} bits yields no final key")]
    InsufficientKey {
        /// Length of the sifted key
        sifted: usize,
    },

    /// Key pipeline failure
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    // ============ Caller Errors ============
    /// Message cannot be sent as given
    #[error("Invalid message: {0}")]
    InvalidMessage(Cow<'static, str>),

    // ============ Configuration & State Errors ============
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    // ============ Operational Errors ============
    /// Socket I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(Cow<'static, str>),

    /// Discovery service failed
    #[error("Discovery error: {0}")]
    Discovery(Cow<'static, str>),
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout(_) | NodeError::Transport(_) | NodeError::Io(_)
        )
    }

    /// Returns true if this error is permanent and will not succeed on retry
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::PeerNotFound(_)
                | NodeError::InvalidConfig(_)
                | NodeError::InvalidMessage(_)
                | NodeError::InvalidState(_)
        )
    }

    /// Returns true if the remote side rejected or could not use the key
    #[must_use]
    pub fn is_key_rejection(&self) -> bool {
        matches!(
            self,
            NodeError::Verification(_)
                | NodeError::InsufficientKey { .. }
                | NodeError::DecryptionUnavailable
        )
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        NodeError::Transport(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NodeError::Timeout(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        NodeError::Protocol(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        NodeError::InvalidState(Cow::Borrowed(context))
    }

    /// Create an invalid config error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<FrameError> for NodeError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Closed => NodeError::transport("connection closed by peer"),
            FrameError::Io(e) => NodeError::Transport(e.to_string().into()),
            FrameError::Malformed(msg) => NodeError::Protocol(format!("malformed frame: {msg}").into()),
            FrameError::TooLong { limit } => {
                NodeError::Protocol(format!("frame too long: limit is {limit} bytes").into())
            }
            FrameError::Encode(e) => NodeError::Serialization(e.to_string().into()),
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

impl From<bb84_discovery::DiscoveryError> for NodeError {
    fn from(err: bb84_discovery::DiscoveryError) -> Self {
        NodeError::Discovery(err.to_string().into())
    }
}

/// Result type for Node operations
pub type Result<T> = std::result::Result<T, NodeError>;
