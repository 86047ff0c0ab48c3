//! Node implementation - accept loop, peer directory and send entry points
//!
//! The Node is the primary entry point for BB84 Net applications. It owns
//! the peer directory, the inbound session table, the error-rate history
//! and the message callback, and it spawns one responder task per accepted
//! connection.
//!
//! # Example
//!
//! ```no_run
//! use bb84_core::node::{Node, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new(NodeConfig::with_name("alice"))?;
//!     node.on_message_received(|sender, message| println!("{sender}: {message}"))
//!         .await;
//!     node.start().await?;
//!
//!     node.add_peer("bob", "192.168.1.20:7000".parse()?);
//!     let report = node.send_message("bob", "HI").await?;
//!     println!("final key: {} bits", report.final_key_len);
//!
//!     node.stop().await?;
//!     Ok(())
//! }
//! ```

use crate::frame::LegacyMessage;
use crate::node::config::NodeConfig;
use crate::node::connection::FrameStream;
use crate::node::directory::{PeerDirectory, PeerRecord};
use crate::node::error::{NodeError, Result};
use crate::node::error_log::ErrorRateLog;
use crate::node::initiator::{ExchangeReport, Initiator, SendOutcome};
use crate::node::responder::{self, MessageCallback, Responder, ResponderContext};
use crate::node::session_manager::{SessionManager, SessionSummary};
use bb84_discovery::{DiscoveryService, PeerEventSink};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

/// Shared node state
pub(crate) struct NodeInner {
    config: NodeConfig,
    directory: Arc<PeerDirectory>,
    sessions: Arc<SessionManager>,
    error_log: Arc<ErrorRateLog>,
    callback: Arc<RwLock<Option<MessageCallback>>>,
    running: AtomicBool,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    discovery: Mutex<Option<DiscoveryService>>,
}

/// BB84 Net node
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    /// Create a node from configuration
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let (shutdown, _) = watch::channel(false);
        let inner = NodeInner {
            error_log: Arc::new(ErrorRateLog::new(config.error_log_capacity)),
            directory: Arc::new(PeerDirectory::new()),
            sessions: Arc::new(SessionManager::new()),
            callback: Arc::new(RwLock::new(None)),
            running: AtomicBool::new(false),
            local_addr: RwLock::new(None),
            shutdown,
            accept_task: Mutex::new(None),
            discovery: Mutex::new(None),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Display name of this node
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Node configuration
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Peer directory
    #[must_use]
    pub fn directory(&self) -> Arc<PeerDirectory> {
        Arc::clone(&self.inner.directory)
    }

    /// Address the listener is bound to, while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read().await
    }

    fn responder_context(&self) -> ResponderContext {
        ResponderContext {
            config: self.inner.config.handshake.clone(),
            sessions: Arc::clone(&self.inner.sessions),
            error_log: Arc::clone(&self.inner.error_log),
            callback: Arc::clone(&self.inner.callback),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Start the node
    ///
    /// Binds the listener, spawns the accept loop and, if enabled, starts
    /// LAN discovery.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] if already running, or a
    /// transport or discovery error if startup fails.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::InvalidState(Cow::Borrowed("Node already running")));
        }

        if let Err(e) = self.start_inner().await {
            self.inner.shutdown.send_replace(true);
            *self.inner.local_addr.write().await = None;
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    async fn start_inner(&self) -> Result<()> {
        let config = &self.inner.config;
        tracing::info!("Starting node {} on {}", config.name, config.listen_addr);

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .map_err(|e| NodeError::Transport(format!("Failed to bind listener: {e}").into()))?;
        let local_addr = listener.local_addr()?;
        *self.inner.local_addr.write().await = Some(local_addr);

        self.inner.shutdown.send_replace(false);
        let shutdown = self.inner.shutdown.subscribe();
        let node = self.clone();
        let task = tokio::spawn(async move {
            node.accept_loop(listener, shutdown).await;
        });
        *self.inner.accept_task.lock().await = Some(task);

        if config.discovery.enabled {
            let sink: Arc<dyn PeerEventSink> = self.inner.directory.clone();
            let discovery = DiscoveryService::start(
                config.discovery.clone(),
                config.name.clone(),
                local_addr.port(),
                sink,
            )
            .await?;
            *self.inner.discovery.lock().await = Some(discovery);
        }

        tracing::info!("Node {} listening on {}", config.name, local_addr);
        Ok(())
    }

    /// Stop the node
    ///
    /// Stops accepting connections and withdraws from discovery. Responder
    /// tasks already running finish on their own.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidState`] if the node is not running.
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::InvalidState(Cow::Borrowed("Node not running")));
        }

        self.inner.shutdown.send_replace(true);

        if let Some(discovery) = self.inner.discovery.lock().await.take() {
            discovery.stop().await;
        }

        if let Some(task) = self.inner.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("Accept loop ended abnormally: {}", e);
            }
        }

        *self.inner.local_addr.write().await = None;
        tracing::info!("Node {} stopped", self.inner.config.name);
        Ok(())
    }

    /// Check if node is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    async fn accept_loop(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let ctx = self.responder_context();
        let max_frame_len = self.inner.config.handshake.max_frame_len;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => match FrameStream::new(socket, max_frame_len) {
                        Ok(stream) => {
                            tokio::spawn(Responder::new(ctx.clone(), stream).run());
                        }
                        Err(e) => tracing::warn!("Failed to set up connection from {}: {}", peer, e),
                    },
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        tracing::debug!("Accept loop stopped");
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Messaging
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Send `message` to `peer_name` over a freshly agreed key
    ///
    /// # Errors
    ///
    /// Returns the error that ended the exchange.
    pub async fn send_message(&self, peer_name: &str, message: &str) -> Result<ExchangeReport> {
        let mut initiator = Initiator::new(
            self.inner.config.name.clone(),
            self.inner.config.handshake.clone(),
        );
        initiator
            .execute(&self.inner.directory, peer_name, message)
            .await
    }

    /// [`Node::send_message`] flattened into a [`SendOutcome`]
    pub async fn send_message_outcome(&self, peer_name: &str, message: &str) -> SendOutcome {
        SendOutcome::from(self.send_message(peer_name, message).await)
    }

    /// Send `message` unencrypted in the legacy `sender|message|timestamp` form
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Protocol`] if the peer does not acknowledge.
    pub async fn send_plain_message(&self, peer_name: &str, message: &str) -> Result<()> {
        if message.contains('\n') {
            return Err(NodeError::InvalidMessage(Cow::Borrowed(
                "plain messages cannot contain newlines",
            )));
        }
        let handshake = &self.inner.config.handshake;
        let peer = self.inner.directory.resolve(peer_name)?;

        let mut stream = FrameStream::connect(
            peer.socket_addr(),
            handshake.connect_timeout,
            handshake.max_frame_len,
        )
        .await?;
        let line = LegacyMessage::now(self.inner.config.name.clone(), message).to_line();
        stream.send_line(&line).await?;

        let reply = tokio::time::timeout(handshake.response_timeout, stream.recv_line())
            .await
            .map_err(|_| NodeError::timeout("waiting for ACK"))??
            .to_string();
        stream.shutdown().await;

        if responder::is_legacy_ack(&reply) {
            tracing::debug!("Plain message to {} acknowledged", peer_name);
            Ok(())
        } else {
            Err(NodeError::Protocol(
                format!("expected ACK, received {reply:?}").into(),
            ))
        }
    }

    /// Register the callback invoked for every delivered message
    pub async fn on_message_received<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        *self.inner.callback.write().await = Some(Arc::new(callback));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Peers & Statistics
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Register a peer by hand
    pub fn add_peer(&self, name: &str, addr: SocketAddr) {
        self.inner
            .directory
            .on_peer_added(name, addr.ip(), addr.port());
    }

    /// Sorted names of every known peer except this node
    #[must_use]
    pub fn list_other_peers(&self) -> Vec<String> {
        self.inner.directory.list_others(&self.inner.config.name)
    }

    /// Address of a known peer
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerNotFound`] if the name is unknown.
    pub fn resolve_address(&self, name: &str) -> Result<SocketAddr> {
        self.inner
            .directory
            .resolve(name)
            .map(|record| record.socket_addr())
    }

    /// Full record of a known peer
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerNotFound`] if the name is unknown.
    pub fn peer(&self, name: &str) -> Result<PeerRecord> {
        self.inner.directory.resolve(name)
    }

    /// Observed check-bit error rates, oldest first
    pub async fn error_rates(&self) -> Vec<f64> {
        self.inner.error_log.snapshot().await
    }

    /// Mean observed error rate (0.0 before any exchange)
    pub async fn average_error_rate(&self) -> f64 {
        self.inner.error_log.average().await
    }

    /// In-flight inbound exchanges
    #[must_use]
    pub fn active_exchanges(&self) -> Vec<SessionSummary> {
        self.inner.sessions.snapshot()
    }

    /// Inbound exchanges opened since creation
    #[must_use]
    pub fn total_exchanges(&self) -> u64 {
        self.inner.sessions.total_exchanges()
    }
}
