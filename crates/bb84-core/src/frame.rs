//! Handshake frame definitions and line codec.
//!
//! Each frame is one JSON object on its own line, discriminated by a `type`
//! field. Lines that are not JSON may still be legacy plain-text messages of
//! the form `sender|message|timestamp`.
//!
//! # Message Flow
//!
//! ```text
//! Initiator                                  Responder
//!     |------------ init ---------------------->|
//!     |<----------- bases ----------------------|
//!     |------------ key_exchange -------------->|
//!     |------------ check_bits ---------------->|
//!     |<----------- check_bits_response --------|
//!     |<----------- key_confirmed --------------|
//!     |------------ encrypted_message --------->|
//!     |<----------- message_received -----------|
//! ```

use crate::bits::{Basis, Bit};
use crate::error::FrameError;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Acknowledgement token for legacy plain-text messages
pub const LEGACY_ACK: &str = "ACK";

/// Outcome carried by response frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Step succeeded
    Success,
    /// Step failed
    Error,
}

impl Status {
    /// Map a boolean outcome onto a status
    #[must_use]
    pub const fn from_ok(ok: bool) -> Self {
        if ok { Status::Success } else { Status::Error }
    }

    /// True for [`Status::Success`]
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Status::Success)
    }
}

/// Structured handshake frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Initiator announces how many raw bits it will send
    Init {
        /// Raw bit count for this exchange
        required_key_bits: usize,
    },

    /// Responder's randomly chosen bases
    Bases {
        /// One basis per raw bit
        receiver_bases: Vec<Basis>,
    },

    /// Initiator's raw bits and bases
    KeyExchange {
        /// Raw bits
        sender_bits: Vec<Bit>,
        /// Bases the raw bits were "encoded" in
        sender_bases: Vec<Basis>,
    },

    /// Sampled positions of the sifted key and the initiator's values there
    CheckBits {
        /// Initiator's values at the sampled positions
        check_bits: Vec<Bit>,
        /// Sampled positions into the sifted key
        check_bit_indices: Vec<usize>,
    },

    /// Verdict on the check bits
    CheckBitsResponse {
        /// Whether the error rate was acceptable
        status: Status,
        /// Failure reason, if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Responder has derived its final key
    KeyConfirmed {
        /// Always success when sent
        status: Status,
    },

    /// Ciphertext of the user's message
    EncryptedMessage {
        /// Display name of the sender
        sender: String,
        /// Ciphertext bits
        content: Vec<Bit>,
    },

    /// Delivery acknowledgement
    MessageReceived {
        /// Whether the message was decrypted and delivered
        status: Status,
    },
}

impl Frame {
    /// Wire name of the frame type
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Frame::Init { .. } => "init",
            Frame::Bases { .. } => "bases",
            Frame::KeyExchange { .. } => "key_exchange",
            Frame::CheckBits { .. } => "check_bits",
            Frame::CheckBitsResponse { .. } => "check_bits_response",
            Frame::KeyConfirmed { .. } => "key_confirmed",
            Frame::EncryptedMessage { .. } => "encrypted_message",
            Frame::MessageReceived { .. } => "message_received",
        }
    }

    /// Serialize to a single JSON line (without the trailing newline)
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Encode`] if serialization fails.
    pub fn to_line(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Legacy unencrypted message, `sender|message|timestamp`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyMessage {
    /// Display name of the sender
    pub sender: String,
    /// Message text
    pub message: String,
    /// Sender-side timestamp, seconds since the Unix epoch as text
    pub timestamp: String,
}

impl LegacyMessage {
    /// Create a message stamped with the current time
    #[must_use]
    pub fn now(sender: impl Into<String>, message: impl Into<String>) -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            sender: sender.into(),
            message: message.into(),
            timestamp: format!("{secs:.6}"),
        }
    }

    /// Parse `sender|message|timestamp`
    ///
    /// The sender ends at the first `|` and the timestamp starts after the
    /// last one, so the message itself may contain `|`.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let (sender, rest) = line.split_once('|')?;
        let (message, timestamp) = rest.rsplit_once('|')?;
        Some(Self {
            sender: sender.to_string(),
            message: message.to_string(),
            timestamp: timestamp.trim().to_string(),
        })
    }

    /// Encode as a single line (without the trailing newline)
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{}|{}|{}", self.sender, self.message, self.timestamp)
    }
}

/// A decoded inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Structured handshake frame
    Frame(Frame),
    /// Legacy plain-text message
    Legacy(LegacyMessage),
}

/// Decode one line, falling back to the legacy format when it is not JSON
///
/// A line that is neither JSON nor `sender|message|timestamp` is an error
/// rather than something to skip; the responder closes the connection on it.
///
/// # Errors
///
/// Returns [`FrameError::Malformed`] if the line is neither.
pub fn decode_line(line: &str) -> Result<Inbound, FrameError> {
    let line = line.trim_end_matches(['\r', '\n']);
    match serde_json::from_str::<Frame>(line) {
        Ok(frame) => Ok(Inbound::Frame(frame)),
        Err(json_err) => {
            // Valid JSON with an unknown shape is a malformed frame, not a legacy line
            if serde_json::from_str::<serde_json::Value>(line).is_ok() {
                return Err(FrameError::Malformed(json_err.to_string()));
            }
            LegacyMessage::parse(line)
                .map(Inbound::Legacy)
                .ok_or_else(|| FrameError::Malformed(json_err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_wire_format() {
        let frame = Frame::Init {
            required_key_bits: 32,
        };
        assert_eq!(
            frame.to_line().unwrap(),
            r#"{"type":"init","required_key_bits":32}"#
        );
    }

    #[test]
    fn test_check_bits_response_omits_empty_reason() {
        let frame = Frame::CheckBitsResponse {
            status: Status::Success,
            reason: None,
        };
        assert_eq!(
            frame.to_line().unwrap(),
            r#"{"type":"check_bits_response","status":"success"}"#
        );
    }

    #[test]
    fn test_decode_bases() {
        let line = r#"{"type":"bases","receiver_bases":["+","x","x"]}"#;
        let decoded = decode_line(line).unwrap();
        assert_eq!(
            decoded,
            Inbound::Frame(Frame::Bases {
                receiver_bases: vec![Basis::Rectilinear, Basis::Diagonal, Basis::Diagonal]
            })
        );
    }

    #[test]
    fn test_decode_error_reason() {
        let line = r#"{"type":"check_bits_response","status":"error","reason":"No valid check bit indices"}"#;
        match decode_line(line).unwrap() {
            Inbound::Frame(Frame::CheckBitsResponse { status, reason }) => {
                assert_eq!(status, Status::Error);
                assert_eq!(reason.as_deref(), Some("No valid check bit indices"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_legacy() {
        let decoded = decode_line("alice|hello there|1700000000.5\n").unwrap();
        assert_eq!(
            decoded,
            Inbound::Legacy(LegacyMessage {
                sender: "alice".into(),
                message: "hello there".into(),
                timestamp: "1700000000.5".into(),
            })
        );
    }

    #[test]
    fn test_legacy_message_with_pipe() {
        let msg = LegacyMessage::parse("bob|a|b|c|123").unwrap();
        assert_eq!(msg.sender, "bob");
        assert_eq!(msg.message, "a|b|c");
        assert_eq!(msg.timestamp, "123");
    }

    #[test]
    fn test_decode_unknown_json_type_is_malformed() {
        let err = decode_line(r#"{"type":"bb84_teleport","x":1}"#).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        assert!(matches!(
            decode_line("no delimiters here"),
            Err(FrameError::Malformed(_))
        ));
    }

    #[test]
    fn test_message_type_matches_tag() {
        let frame = Frame::EncryptedMessage {
            sender: "alice".into(),
            content: vec![1, 0],
        };
        let line = frame.to_line().unwrap();
        assert!(line.contains(&format!(r#""type":"{}""#, frame.message_type())));
    }
}
