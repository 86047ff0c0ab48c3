//! # BB84 Core
//!
//! Core protocol implementation for BB84 Net, a classical simulation of the
//! BB84 key-distribution handshake between two peers on a local network.
//!
//! This crate provides:
//! - The bit/key pipeline (sifting, check bits, privacy amplification, XOR stream)
//! - The frame codec for the handshake messages
//! - Initiator and responder state machines
//! - The node: peer directory, accept loop, per-connection sessions
//! - Error types and handling
//!
//! Nothing here models a quantum channel. Bits and bases are ordinary random
//! values and eavesdropping detection is a heuristic error-rate threshold.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Node                                   │
//! │   (peer directory, accept loop, send_message entry point)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  Initiator  │  Responder                         │
//! │   (per-exchange handshake state machines over one TCP stream)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                  Frames     │  Bit/Key pipeline                  │
//! │   (line-delimited JSON)     │  (pure functions, no I/O)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bits;
pub mod error;
pub mod frame;
pub mod node;

pub use bits::{Basis, Bit, CheckSelection};
pub use error::{FrameError, KeyError};
pub use frame::{Frame, Inbound, LegacyMessage, Status};

/// Protocol version advertised by discovery announcements
pub use bb84_discovery::protocol::PROTOCOL_VERSION;

/// Default error-rate threshold above which a key is rejected
pub const DEFAULT_ERROR_THRESHOLD: f64 = 0.11;

/// Default fraction of the sifted key revealed as check bits
pub const DEFAULT_CHECK_FRACTION: f64 = 0.2;

/// Raw bits generated per plaintext bit to survive ~50% sifting loss
pub const RAW_BITS_PER_PLAINTEXT_BIT: usize = 2;
