//! Responder side of the key exchange
//!
//! One [`Responder`] runs per accepted connection on its own task. It owns
//! its [`ResponderSession`] outright; the node's session table only sees a
//! summary. Any error ends this connection and nothing else.

use crate::bits::{self, Basis, Bit};
use crate::error::FrameError;
use crate::frame::{Frame, Inbound, LEGACY_ACK, LegacyMessage, Status};
use crate::node::config::{BasisChoice, HandshakeConfig};
use crate::node::connection::FrameStream;
use crate::node::error::{NodeError, Result};
use crate::node::error_log::ErrorRateLog;
use crate::node::session_manager::{ExchangeId, ExchangeStage, SessionManager};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Callback invoked with `(sender, message)` for every delivered message
pub type MessageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Reason sent when none of the requested check positions exist
pub const NO_VALID_INDICES: &str = "No valid check bit indices";

/// Key state for one inbound exchange
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ResponderSession {
    #[zeroize(skip)]
    exchange_id: ExchangeId,
    #[zeroize(skip)]
    receiver_bases: Vec<Basis>,
    sifted_key: Option<Vec<Bit>>,
    final_key: Option<Vec<Bit>>,
}

impl ResponderSession {
    fn new(exchange_id: ExchangeId, receiver_bases: Vec<Basis>) -> Self {
        Self {
            exchange_id,
            receiver_bases,
            sifted_key: None,
            final_key: None,
        }
    }

    /// Identifier of the exchange
    #[must_use]
    pub fn exchange_id(&self) -> ExchangeId {
        self.exchange_id
    }
}

/// Shared state every responder task needs from the node
#[derive(Clone)]
pub struct ResponderContext {
    /// Handshake parameters
    pub config: HandshakeConfig,
    /// Session table
    pub sessions: Arc<SessionManager>,
    /// Check-bit error-rate history
    pub error_log: Arc<ErrorRateLog>,
    /// Application callback for delivered messages
    pub callback: Arc<RwLock<Option<MessageCallback>>>,
}

impl ResponderContext {
    async fn deliver(&self, sender: &str, message: &str) {
        let callback = self.callback.read().await.clone();
        match callback {
            Some(callback) => callback(sender, message),
            None => tracing::info!("Message from {} (no callback registered)", sender),
        }
    }
}

/// What the next frame on the connection must be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    /// Any frame that starts or continues an exchange
    WaitFrame,
    /// Key material received; only `check_bits` may follow
    AwaitCheckBits,
}

/// Handles one inbound connection
pub struct Responder {
    ctx: ResponderContext,
    stream: FrameStream,
    session: Option<ResponderSession>,
    state: ResponderState,
}

impl Responder {
    /// Create a responder for an accepted connection
    #[must_use]
    pub fn new(ctx: ResponderContext, stream: FrameStream) -> Self {
        Self {
            ctx,
            stream,
            session: None,
            state: ResponderState::WaitFrame,
        }
    }

    /// Serve the connection until EOF, a fatal error or the idle timeout
    pub async fn run(mut self) {
        let peer = self.stream.peer_addr();
        let idle = self.ctx.config.idle_timeout;
        tracing::debug!("Serving connection from {}", peer);

        loop {
            let inbound = match tokio::time::timeout(idle, self.stream.recv()).await {
                Err(_) => {
                    tracing::debug!("Connection from {} idle for {:?}, closing", peer, idle);
                    break;
                }
                Ok(Err(FrameError::Closed)) => break,
                Ok(Err(e)) => {
                    tracing::warn!("Dropping connection from {}: {}", peer, e);
                    break;
                }
                Ok(Ok(inbound)) => inbound,
            };

            if let Err(e) = self.handle(inbound).await {
                tracing::warn!("Dropping connection from {}: {}", peer, e);
                break;
            }
        }

        self.close_session();
        self.stream.shutdown().await;
        tracing::debug!("Connection from {} closed", peer);
    }

    async fn handle(&mut self, inbound: Inbound) -> Result<()> {
        if self.state == ResponderState::AwaitCheckBits
            && !matches!(inbound, Inbound::Frame(Frame::CheckBits { .. }))
        {
            return Err(NodeError::protocol("expected check_bits after key_exchange"));
        }

        match inbound {
            Inbound::Legacy(message) => self.on_legacy(message).await,
            Inbound::Frame(Frame::Init { required_key_bits }) => {
                self.on_init(required_key_bits).await
            }
            Inbound::Frame(Frame::KeyExchange {
                sender_bits,
                sender_bases,
            }) => self.on_key_exchange(sender_bits, &sender_bases),
            Inbound::Frame(Frame::CheckBits {
                check_bits,
                check_bit_indices,
            }) => self.on_check_bits(&check_bits, &check_bit_indices).await,
            Inbound::Frame(Frame::EncryptedMessage { sender, content }) => {
                self.on_encrypted_message(&sender, &content).await
            }
            Inbound::Frame(
                frame @ (Frame::Bases { .. }
                | Frame::CheckBitsResponse { .. }
                | Frame::KeyConfirmed { .. }
                | Frame::MessageReceived { .. }),
            ) => Err(NodeError::Protocol(
                format!("unexpected {} frame at responder", frame.message_type()).into(),
            )),
        }
    }

    async fn on_legacy(&mut self, message: LegacyMessage) -> Result<()> {
        tracing::debug!("Plain message from {}", message.sender);
        self.ctx.deliver(&message.sender, &message.message).await;
        self.stream.send_line(LEGACY_ACK).await?;
        Ok(())
    }

    async fn on_init(&mut self, required_key_bits: usize) -> Result<()> {
        let max = self.ctx.config.max_key_bits;
        if required_key_bits == 0 || required_key_bits > max {
            return Err(NodeError::Protocol(
                format!("required_key_bits {required_key_bits} outside 1..={max}").into(),
            ));
        }

        // A new init on the same connection starts over
        self.close_session();

        let receiver_bases = match self.ctx.config.basis_choice {
            BasisChoice::Random => {
                let mut rng = rand::thread_rng();
                bits::random_bases(required_key_bits, &mut rng)
            }
            BasisChoice::Fixed(basis) => vec![basis; required_key_bits],
        };

        let exchange_id = self
            .ctx
            .sessions
            .register(self.stream.peer_addr(), required_key_bits);
        self.session = Some(ResponderSession::new(exchange_id, receiver_bases.clone()));

        self.stream.send(&Frame::Bases { receiver_bases }).await?;
        Ok(())
    }

    fn on_key_exchange(&mut self, mut sender_bits: Vec<Bit>, sender_bases: &[Basis]) -> Result<()> {
        let noise = self.ctx.config.channel_noise;
        let session = self
            .session
            .as_mut()
            .ok_or(NodeError::protocol("key_exchange before init"))?;

        let expected = session.receiver_bases.len();
        if sender_bits.len() != expected || sender_bases.len() != expected {
            return Err(NodeError::Protocol(
                format!(
                    "key_exchange carries {} bits and {} bases, expected {}",
                    sender_bits.len(),
                    sender_bases.len(),
                    expected
                )
                .into(),
            ));
        }
        if sender_bits.iter().any(|bit| *bit > 1) {
            return Err(NodeError::protocol("key_exchange bits must be 0 or 1"));
        }

        if noise > 0.0 {
            let mut rng = rand::thread_rng();
            for bit in &mut sender_bits {
                if rng.gen_bool(noise) {
                    *bit ^= 1;
                }
            }
        }

        let sifted = bits::sift(&sender_bits, sender_bases, &session.receiver_bases);
        sender_bits.zeroize();
        tracing::debug!(
            "Exchange {}: sifted {} of {} bits",
            session.exchange_id,
            sifted.len(),
            expected
        );
        session.sifted_key = Some(sifted);
        session.final_key = None;

        self.ctx
            .sessions
            .update_stage(session.exchange_id, ExchangeStage::KeySifted);
        self.state = ResponderState::AwaitCheckBits;
        Ok(())
    }

    async fn on_check_bits(&mut self, check_bits: &[Bit], check_bit_indices: &[usize]) -> Result<()> {
        self.state = ResponderState::WaitFrame;
        let threshold = self.ctx.config.error_threshold;
        let session = self
            .session
            .as_mut()
            .ok_or(NodeError::protocol("check_bits before init"))?;
        let sifted = session
            .sifted_key
            .as_deref()
            .ok_or(NodeError::protocol("check_bits before key_exchange"))?;
        let exchange_id = session.exchange_id;

        if check_bits.len() != check_bit_indices.len() {
            self.ctx
                .sessions
                .update_stage(exchange_id, ExchangeStage::Rejected);
            return self.reply_check(Status::Error, Some("Check bit count mismatch")).await;
        }

        // Positional pairing: keep (index, value) pairs whose index exists
        let (indices, theirs): (Vec<usize>, Vec<Bit>) = check_bit_indices
            .iter()
            .zip(check_bits)
            .filter(|(index, _)| **index < sifted.len())
            .map(|(index, value)| (*index, *value))
            .unzip();

        if indices.is_empty() {
            tracing::debug!("Exchange {}: no valid check bit indices", exchange_id);
            self.ctx
                .sessions
                .update_stage(exchange_id, ExchangeStage::Rejected);
            return self.reply_check(Status::Error, Some(NO_VALID_INDICES)).await;
        }

        let ours: Vec<Bit> = indices.iter().map(|&i| sifted[i]).collect();
        let rate = bits::mismatch_fraction(&ours, &theirs).unwrap_or(1.0);
        self.ctx.error_log.record(rate).await;
        let passed = bits::error_check_with_threshold(&ours, &theirs, threshold);

        if !passed {
            tracing::warn!(
                "Exchange {}: error rate {:.2}% above threshold {:.2}%, possible eavesdropping",
                exchange_id,
                rate * 100.0,
                threshold * 100.0
            );
            self.ctx
                .sessions
                .update_stage(exchange_id, ExchangeStage::Rejected);
            return self.reply_check(Status::Error, Some("Error rate too high")).await;
        }

        let final_key = bits::privacy_amplify(sifted);
        tracing::debug!(
            "Exchange {}: check passed at {:.2}%, final key {} bits",
            exchange_id,
            rate * 100.0,
            final_key.len()
        );
        session.final_key = (!final_key.is_empty()).then_some(final_key);
        self.ctx
            .sessions
            .update_stage(exchange_id, ExchangeStage::Verified);

        self.reply_check(Status::Success, None).await?;
        self.stream
            .send(&Frame::KeyConfirmed {
                status: Status::Success,
            })
            .await?;
        Ok(())
    }

    async fn reply_check(&mut self, status: Status, reason: Option<&str>) -> Result<()> {
        self.stream
            .send(&Frame::CheckBitsResponse {
                status,
                reason: reason.map(str::to_string),
            })
            .await?;
        Ok(())
    }

    async fn on_encrypted_message(&mut self, sender: &str, content: &[Bit]) -> Result<()> {
        let plaintext = self
            .session
            .as_ref()
            .and_then(|session| session.final_key.as_deref())
            .ok_or(NodeError::DecryptionUnavailable)
            .and_then(|key| bits::decrypt_message(key, content).map_err(NodeError::from));

        let status = match plaintext {
            Ok(plaintext) => {
                self.ctx.deliver(sender, &plaintext).await;
                if let Some(session) = &self.session {
                    self.ctx
                        .sessions
                        .update_stage(session.exchange_id, ExchangeStage::Delivered);
                }
                Status::Success
            }
            Err(e) => {
                tracing::warn!("Cannot decrypt message from {}: {}", sender, e);
                Status::Error
            }
        };

        self.stream.send(&Frame::MessageReceived { status }).await?;
        Ok(())
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.ctx.sessions.remove(session.exchange_id);
        }
    }
}

/// True if a legacy reply line is the acknowledgement token
pub(crate) fn is_legacy_ack(line: &str) -> bool {
    line.trim() == LEGACY_ACK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::connection::FrameStream;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    struct Harness {
        client: FrameStream,
        sessions: Arc<SessionManager>,
        error_log: Arc<ErrorRateLog>,
        delivered: Arc<Mutex<Vec<(String, String)>>>,
        task: tokio::task::JoinHandle<()>,
    }

    async fn harness(config: HandshakeConfig) -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let callback: MessageCallback = Arc::new(move |sender: &str, message: &str| {
            sink.lock()
                .unwrap()
                .push((sender.to_string(), message.to_string()));
        });

        let ctx = ResponderContext {
            config,
            sessions: Arc::new(SessionManager::new()),
            error_log: Arc::new(ErrorRateLog::new(16)),
            callback: Arc::new(RwLock::new(Some(callback))),
        };
        let sessions = ctx.sessions.clone();
        let error_log = ctx.error_log.clone();

        let task = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let stream = FrameStream::new(socket, 1 << 16).unwrap();
            Responder::new(ctx, stream).run().await;
        });

        let client = FrameStream::new(TcpStream::connect(addr).await.unwrap(), 1 << 16).unwrap();
        Harness {
            client,
            sessions,
            error_log,
            delivered,
            task,
        }
    }

    fn fixed_config() -> HandshakeConfig {
        HandshakeConfig {
            basis_choice: BasisChoice::Fixed(Basis::Rectilinear),
            ..HandshakeConfig::default()
        }
    }

    async fn expect(client: &mut FrameStream) -> Frame {
        client.recv_frame(Duration::from_secs(5)).await.unwrap()
    }

    #[tokio::test]
    async fn test_full_exchange() {
        let mut h = harness(fixed_config()).await;
        let raw: Vec<Bit> = (0..32).map(|i| (i % 3 == 0) as Bit).collect();

        h.client
            .send(&Frame::Init {
                required_key_bits: 32,
            })
            .await
            .unwrap();
        let Frame::Bases { receiver_bases } = expect(&mut h.client).await else {
            panic!("expected bases");
        };
        assert_eq!(receiver_bases, vec![Basis::Rectilinear; 32]);
        assert_eq!(h.sessions.active_count(), 1);

        h.client
            .send(&Frame::KeyExchange {
                sender_bits: raw.clone(),
                sender_bases: vec![Basis::Rectilinear; 32],
            })
            .await
            .unwrap();
        h.client
            .send(&Frame::CheckBits {
                check_bits: vec![raw[0], raw[1], raw[5]],
                check_bit_indices: vec![0, 1, 5],
            })
            .await
            .unwrap();

        assert_eq!(
            expect(&mut h.client).await,
            Frame::CheckBitsResponse {
                status: Status::Success,
                reason: None
            }
        );
        assert_eq!(
            expect(&mut h.client).await,
            Frame::KeyConfirmed {
                status: Status::Success
            }
        );

        let key = bits::privacy_amplify(&raw);
        let content = bits::encrypt_message(&key, "HI").unwrap();
        h.client
            .send(&Frame::EncryptedMessage {
                sender: "alice".into(),
                content,
            })
            .await
            .unwrap();
        assert_eq!(
            expect(&mut h.client).await,
            Frame::MessageReceived {
                status: Status::Success
            }
        );

        assert_eq!(
            h.delivered.lock().unwrap().as_slice(),
            &[("alice".to_string(), "HI".to_string())]
        );
        assert_eq!(h.error_log.snapshot().await, vec![0.0]);

        h.client.shutdown().await;
        h.task.await.unwrap();
        assert_eq!(h.sessions.active_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_indices_rejected() {
        let mut h = harness(fixed_config()).await;
        h.client
            .send(&Frame::Init {
                required_key_bits: 4,
            })
            .await
            .unwrap();
        expect(&mut h.client).await;
        h.client
            .send(&Frame::KeyExchange {
                sender_bits: vec![0, 1, 0, 1],
                sender_bases: vec![Basis::Rectilinear; 4],
            })
            .await
            .unwrap();
        h.client
            .send(&Frame::CheckBits {
                check_bits: vec![1, 1],
                check_bit_indices: vec![10, 99],
            })
            .await
            .unwrap();

        assert_eq!(
            expect(&mut h.client).await,
            Frame::CheckBitsResponse {
                status: Status::Error,
                reason: Some(NO_VALID_INDICES.to_string())
            }
        );
        assert!(h.error_log.is_empty().await);
    }

    #[tokio::test]
    async fn test_check_bit_count_mismatch_rejected() {
        let mut h = harness(fixed_config()).await;
        h.client
            .send(&Frame::Init {
                required_key_bits: 8,
            })
            .await
            .unwrap();
        expect(&mut h.client).await;
        h.client
            .send(&Frame::KeyExchange {
                sender_bits: vec![0, 1, 1, 0, 0, 1, 0, 1],
                sender_bases: vec![Basis::Rectilinear; 8],
            })
            .await
            .unwrap();
        h.client
            .send(&Frame::CheckBits {
                check_bits: vec![0],
                check_bit_indices: vec![0, 1],
            })
            .await
            .unwrap();

        assert_eq!(
            expect(&mut h.client).await,
            Frame::CheckBitsResponse {
                status: Status::Error,
                reason: Some("Check bit count mismatch".to_string())
            }
        );
        assert!(h.error_log.is_empty().await);

        let summaries = h.sessions.snapshot();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].stage, ExchangeStage::Rejected);
    }

    #[tokio::test]
    async fn test_high_error_rate_rejected_and_logged() {
        let mut h = harness(fixed_config()).await;
        h.client
            .send(&Frame::Init {
                required_key_bits: 8,
            })
            .await
            .unwrap();
        expect(&mut h.client).await;
        h.client
            .send(&Frame::KeyExchange {
                sender_bits: vec![0; 8],
                sender_bases: vec![Basis::Rectilinear; 8],
            })
            .await
            .unwrap();
        h.client
            .send(&Frame::CheckBits {
                check_bits: vec![1, 1, 0, 0],
                check_bit_indices: vec![0, 1, 2, 3],
            })
            .await
            .unwrap();

        let Frame::CheckBitsResponse { status, .. } = expect(&mut h.client).await else {
            panic!("expected check_bits_response");
        };
        assert_eq!(status, Status::Error);
        assert_eq!(h.error_log.snapshot().await, vec![0.5]);
    }

    #[tokio::test]
    async fn test_ciphertext_without_key() {
        let mut h = harness(fixed_config()).await;
        h.client
            .send(&Frame::EncryptedMessage {
                sender: "mallory".into(),
                content: vec![1, 0, 1],
            })
            .await
            .unwrap();

        assert_eq!(
            expect(&mut h.client).await,
            Frame::MessageReceived {
                status: Status::Error
            }
        );
        assert!(h.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_message_acknowledged() {
        let mut h = harness(fixed_config()).await;
        h.client.send_line("carol|hello|1700000000.0").await.unwrap();

        assert_eq!(h.client.recv_line().await.unwrap(), LEGACY_ACK);
        assert_eq!(
            h.delivered.lock().unwrap().as_slice(),
            &[("carol".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn test_frame_after_key_exchange_must_be_check_bits() {
        let mut h = harness(fixed_config()).await;
        h.client
            .send(&Frame::Init {
                required_key_bits: 4,
            })
            .await
            .unwrap();
        expect(&mut h.client).await;
        h.client
            .send(&Frame::KeyExchange {
                sender_bits: vec![0, 1, 0, 1],
                sender_bases: vec![Basis::Rectilinear; 4],
            })
            .await
            .unwrap();
        h.client
            .send(&Frame::Init {
                required_key_bits: 4,
            })
            .await
            .unwrap();

        assert!(h.client.recv().await.is_err());
        h.task.await.unwrap();
        assert_eq!(h.sessions.active_count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_length_key_material_closes_connection() {
        let mut h = harness(fixed_config()).await;
        h.client
            .send(&Frame::Init {
                required_key_bits: 4,
            })
            .await
            .unwrap();
        expect(&mut h.client).await;
        h.client
            .send(&Frame::KeyExchange {
                sender_bits: vec![0, 1],
                sender_bases: vec![Basis::Rectilinear; 4],
            })
            .await
            .unwrap();

        assert!(h.client.recv().await.is_err());
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let config = HandshakeConfig {
            idle_timeout: Duration::from_millis(50),
            ..fixed_config()
        };
        let mut h = harness(config).await;

        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(h.client.recv().await, Err(FrameError::Closed)));
    }

    #[test]
    fn test_is_legacy_ack() {
        assert!(is_legacy_ack("ACK"));
        assert!(is_legacy_ack("ACK\n"));
        assert!(!is_legacy_ack("NACK"));
    }
}
