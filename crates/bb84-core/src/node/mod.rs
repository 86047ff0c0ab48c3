//! Node layer for BB84 Net
//!
//! This module ties the bit pipeline and frame codec to the network:
//! - Peer directory fed by discovery events (via bb84-discovery)
//! - Initiator state machine, one per outgoing message
//! - Responder state machine, one task per inbound connection
//! - Session table and error-rate history for observation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Node API                             │
//! │  (start/stop, send_message, peers, error rates)         │
//! ├─────────────────────────────────────────────────────────┤
//! │  Initiator  │  Responder  │  Directory  │  Sessions     │
//! ├─────────────────────────────────────────────────────────┤
//! │         FrameStream (line-delimited TCP)                │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod error_log;
pub mod initiator;
#[allow(clippy::module_inception)]
pub mod node;
pub mod responder;
pub mod session_manager;

pub use config::{BasisChoice, HandshakeConfig, NodeConfig};
pub use connection::FrameStream;
pub use directory::{PeerDirectory, PeerRecord};
pub use error::{NodeError, Result};
pub use error_log::ErrorRateLog;
pub use initiator::{ExchangeReport, Initiator, InitiatorState, SendOutcome, required_key_bits};
pub use node::Node;
pub use responder::{MessageCallback, Responder, ResponderContext};
pub use session_manager::{ExchangeId, ExchangeStage, SessionManager, SessionSummary};
