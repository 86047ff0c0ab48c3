//! Initiator side of the key exchange
//!
//! One [`Initiator`] drives one outgoing message over its own TCP
//! connection: it generates fresh raw material, agrees on a key with the
//! responder, verifies it with check bits, and sends the ciphertext.
//!
//! ```text
//! Start -> SentInit -> GotBases -> SentKeyMaterial -> SentCheck
//!       -> Verified -> SentCiphertext -> Done
//! ```
//!
//! `Failed` is reachable from every non-terminal state. The connection is
//! owned by [`Initiator::execute`] and closed on every exit path.

use crate::bits::{self, Basis, Bit, CheckSelection};
use crate::frame::Frame;
use crate::node::config::{BasisChoice, HandshakeConfig};
use crate::node::connection::FrameStream;
use crate::node::directory::PeerDirectory;
use crate::node::error::{NodeError, Result};
use crate::RAW_BITS_PER_PLAINTEXT_BIT;
use rand::Rng;
use std::borrow::Cow;
use std::time::{Duration, Instant};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Initiator handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    /// Nothing sent yet
    Start,
    /// `init` sent, waiting for bases
    SentInit,
    /// Responder bases received
    GotBases,
    /// Raw bits and bases sent, sifted key computed
    SentKeyMaterial,
    /// Check bits sent, waiting for the verdict
    SentCheck,
    /// Check passed
    Verified,
    /// Ciphertext sent, waiting for the acknowledgement
    SentCiphertext,
    /// Exchange complete
    Done,
    /// Exchange aborted
    Failed,
}

impl InitiatorState {
    /// True for `Done` and `Failed`
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, InitiatorState::Done | InitiatorState::Failed)
    }
}

/// Raw material generated for one outgoing message
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ExchangeMaterial {
    /// Number of raw bits
    pub required_key_bits: usize,
    /// Raw bits
    pub raw_bits: Vec<Bit>,
    /// Bases the raw bits were prepared in
    #[zeroize(skip)]
    pub bases: Vec<Basis>,
}

impl ExchangeMaterial {
    /// Generate material for `required_key_bits` raw bits
    pub fn generate<R: Rng + ?Sized>(
        required_key_bits: usize,
        basis_choice: BasisChoice,
        rng: &mut R,
    ) -> Self {
        let raw_bits = bits::random_bits(required_key_bits, rng);
        let bases = match basis_choice {
            BasisChoice::Random => bits::random_bases(required_key_bits, rng),
            BasisChoice::Fixed(basis) => vec![basis; required_key_bits],
        };
        Self {
            required_key_bits,
            raw_bits,
            bases,
        }
    }
}

impl std::fmt::Debug for ExchangeMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeMaterial")
            .field("required_key_bits", &self.required_key_bits)
            .finish_non_exhaustive()
    }
}

/// Raw bits needed to carry `message`
#[must_use]
pub fn required_key_bits(message: &str) -> usize {
    message.len() * 8 * RAW_BITS_PER_PLAINTEXT_BIT
}

/// Result of a completed exchange
#[derive(Debug, Clone)]
pub struct ExchangeReport {
    /// Whether the responder acknowledged successful delivery
    pub delivered: bool,
    /// Key the message was encrypted under
    pub final_key: Vec<Bit>,
    /// Raw bit count sent
    pub required_key_bits: usize,
    /// Length of the final key
    pub final_key_len: usize,
    /// Length of the sifted key
    pub sifted_key_len: usize,
    /// Number of check bits revealed
    pub check_bit_count: usize,
    /// Wall time for the whole exchange
    pub elapsed: Duration,
}

/// Flat caller-facing result of a send
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendOutcome {
    /// Whether the message was delivered
    pub status: bool,
    /// Final key, when an exchange completed
    pub key_material: Option<Vec<Bit>>,
    /// Raw bit count sent (0 on failure)
    pub required_key_bits: usize,
    /// Final key length (0 on failure)
    pub final_key_length: usize,
}

impl From<Result<ExchangeReport>> for SendOutcome {
    fn from(result: Result<ExchangeReport>) -> Self {
        match result {
            Ok(report) => Self {
                status: report.delivered,
                required_key_bits: report.required_key_bits,
                final_key_length: report.final_key_len,
                key_material: Some(report.final_key),
            },
            Err(_) => Self::default(),
        }
    }
}

/// Drives one outgoing exchange
#[derive(Debug)]
pub struct Initiator {
    sender_name: String,
    config: HandshakeConfig,
    state: InitiatorState,
}

impl Initiator {
    /// Create an initiator sending as `sender_name`
    #[must_use]
    pub fn new(sender_name: impl Into<String>, config: HandshakeConfig) -> Self {
        Self {
            sender_name: sender_name.into(),
            config,
            state: InitiatorState::Start,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> InitiatorState {
        self.state
    }

    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(&self, to: InitiatorState) -> bool {
        use InitiatorState::*;
        match (self.state, to) {
            (from, Failed) => !from.is_terminal(),
            (Start, SentInit)
            | (SentInit, GotBases)
            | (GotBases, SentKeyMaterial)
            | (SentKeyMaterial, SentCheck)
            | (SentCheck, Verified)
            | (Verified, SentCiphertext)
            | (SentCiphertext, Done) => true,
            _ => false,
        }
    }

    fn transition_to(&mut self, new_state: InitiatorState) -> Result<()> {
        if !self.can_transition(new_state) {
            return Err(NodeError::InvalidState(
                format!("initiator cannot move from {:?} to {:?}", self.state, new_state).into(),
            ));
        }
        tracing::debug!(
            "Initiator state transition: {:?} -> {:?}",
            self.state,
            new_state
        );
        self.state = new_state;
        Ok(())
    }

    /// Deliver `message` to `peer_name`
    ///
    /// # Errors
    ///
    /// Returns the error that ended the exchange; the state is then `Failed`.
    pub async fn execute(
        &mut self,
        directory: &PeerDirectory,
        peer_name: &str,
        message: &str,
    ) -> Result<ExchangeReport> {
        let result = self.run(directory, peer_name, message).await;
        if let Err(e) = &result {
            tracing::warn!("Exchange with {} failed: {}", peer_name, e);
            if !self.state.is_terminal() {
                self.state = InitiatorState::Failed;
            }
        }
        result
    }

    async fn run(
        &mut self,
        directory: &PeerDirectory,
        peer_name: &str,
        message: &str,
    ) -> Result<ExchangeReport> {
        if self.state != InitiatorState::Start {
            return Err(NodeError::invalid_state("initiator already used"));
        }
        if message.is_empty() {
            return Err(NodeError::InvalidMessage(Cow::Borrowed("message is empty")));
        }
        let required_key_bits = required_key_bits(message);
        if required_key_bits > self.config.max_key_bits {
            return Err(NodeError::InvalidMessage(
                format!(
                    "message needs {} raw bits, limit is {}",
                    required_key_bits, self.config.max_key_bits
                )
                .into(),
            ));
        }

        let peer = directory.resolve(peer_name)?;
        let started = Instant::now();
        let timeout = self.config.response_timeout;

        let mut stream = FrameStream::connect(
            peer.socket_addr(),
            self.config.connect_timeout,
            self.config.max_frame_len,
        )
        .await?;
        tracing::info!(
            "Starting exchange with {} at {} ({} raw bits)",
            peer.name,
            peer.socket_addr(),
            required_key_bits
        );

        let material = {
            let mut rng = rand::thread_rng();
            ExchangeMaterial::generate(required_key_bits, self.config.basis_choice, &mut rng)
        };

        stream.send(&Frame::Init { required_key_bits }).await?;
        self.transition_to(InitiatorState::SentInit)?;

        let receiver_bases = match stream.recv_frame(timeout).await? {
            Frame::Bases { receiver_bases } => receiver_bases,
            other => return Err(unexpected("bases", &other)),
        };
        if receiver_bases.len() != required_key_bits {
            return Err(NodeError::Protocol(
                format!(
                    "expected {} bases, received {}",
                    required_key_bits,
                    receiver_bases.len()
                )
                .into(),
            ));
        }
        self.transition_to(InitiatorState::GotBases)?;

        stream
            .send(&Frame::KeyExchange {
                sender_bits: material.raw_bits.clone(),
                sender_bases: material.bases.clone(),
            })
            .await?;
        let sifted = Zeroizing::new(bits::sift(
            &material.raw_bits,
            &material.bases,
            &receiver_bases,
        ));
        self.transition_to(InitiatorState::SentKeyMaterial)?;

        let selection = {
            let mut rng = rand::thread_rng();
            CheckSelection::sample(&sifted, self.config.check_fraction, &mut rng)
        };
        let check_bit_count = selection.len();
        stream
            .send(&Frame::CheckBits {
                check_bits: selection.values,
                check_bit_indices: selection.indices,
            })
            .await?;
        self.transition_to(InitiatorState::SentCheck)?;

        match stream.recv_frame(timeout).await? {
            Frame::CheckBitsResponse { status, .. } if status.is_success() => {}
            Frame::CheckBitsResponse { reason, .. } => {
                return Err(NodeError::Verification(
                    reason.unwrap_or_else(|| "Unknown".to_string()).into(),
                ));
            }
            other => return Err(unexpected("check_bits_response", &other)),
        }
        self.transition_to(InitiatorState::Verified)?;

        match stream.recv_frame(timeout).await? {
            Frame::KeyConfirmed { status } if status.is_success() => {}
            Frame::KeyConfirmed { .. } => {
                return Err(NodeError::Verification(Cow::Borrowed(
                    "responder did not confirm the key",
                )));
            }
            other => return Err(unexpected("key_confirmed", &other)),
        }

        let final_key = bits::privacy_amplify(&sifted);
        if final_key.is_empty() {
            return Err(NodeError::InsufficientKey {
                sifted: sifted.len(),
            });
        }

        let content = bits::encrypt_message(&final_key, message)?;
        stream
            .send(&Frame::EncryptedMessage {
                sender: self.sender_name.clone(),
                content,
            })
            .await?;
        self.transition_to(InitiatorState::SentCiphertext)?;

        let delivered = match stream.recv_frame(timeout).await? {
            Frame::MessageReceived { status } => status.is_success(),
            other => return Err(unexpected("message_received", &other)),
        };
        self.transition_to(InitiatorState::Done)?;
        stream.shutdown().await;

        let report = ExchangeReport {
            delivered,
            final_key_len: final_key.len(),
            final_key,
            required_key_bits,
            sifted_key_len: sifted.len(),
            check_bit_count,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            "Exchange with {} finished in {:?}: delivered={}, sifted={} bits, final key={} bits",
            peer.name,
            report.elapsed,
            report.delivered,
            report.sifted_key_len,
            report.final_key_len
        );
        Ok(report)
    }
}

fn unexpected(expected: &str, got: &Frame) -> NodeError {
    NodeError::Protocol(
        format!(
            "expected {} frame, received {}",
            expected,
            got.message_type()
        )
        .into(),
    )
}
