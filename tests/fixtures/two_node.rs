//! Two-node test fixture for integration testing
//!
//! Starts an initiator and a responder on loopback with discovery off and
//! the responder registered in the initiator's directory. Messages the
//! responder delivers are captured on a channel.
//!
//! # Example
//!
//! ```no_run
//! use bb84_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_basic_exchange() {
//!     let mut fixture = TwoNodeFixture::new().await.unwrap();
//!     let report = fixture.send("HI").await.unwrap();
//!     assert!(report.delivered);
//!
//!     fixture.cleanup().await.unwrap();
//! }
//! ```

use bb84_core::node::{ExchangeReport, Node, NodeConfig, NodeError};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;

/// A delivered message: `(sender, text)`
pub type Delivered = (String, String);

/// Two-node test fixture
pub struct TwoNodeFixture {
    /// Node that sends messages
    pub initiator: Node,
    /// Node that accepts exchanges
    pub responder: Node,
    /// Where the responder listens
    pub responder_addr: SocketAddr,
    delivered: mpsc::UnboundedReceiver<Delivered>,
}

impl TwoNodeFixture {
    /// Loopback configuration with an ephemeral port and discovery off
    #[must_use]
    pub fn loopback_config(name: &str) -> NodeConfig {
        let mut config = NodeConfig::with_name(name);
        config.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        config.discovery.enabled = false;
        config.handshake.idle_timeout = Duration::from_secs(5);
        config.handshake.response_timeout = Duration::from_secs(5);
        config
    }

    /// Create and start `alice` and `bob` with default handshake settings
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Transport` if either listener cannot be bound.
    pub async fn new() -> Result<Self, NodeError> {
        Self::new_with_config(Self::loopback_config("alice"), Self::loopback_config("bob")).await
    }

    /// Create and start both nodes from custom configurations
    ///
    /// Listen addresses are forced onto loopback with ephemeral ports.
    ///
    /// # Errors
    ///
    /// Returns an error if either configuration is invalid or a node fails to start.
    pub async fn new_with_config(
        mut initiator_config: NodeConfig,
        mut responder_config: NodeConfig,
    ) -> Result<Self, NodeError> {
        initiator_config.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
        responder_config.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));

        let initiator = Node::new(initiator_config)?;
        let responder = Node::new(responder_config)?;

        let (tx, delivered) = mpsc::unbounded_channel();
        responder
            .on_message_received(move |sender, message| {
                let _ = tx.send((sender.to_string(), message.to_string()));
            })
            .await;

        initiator.start().await?;
        responder.start().await?;

        let responder_addr = responder
            .local_addr()
            .await
            .ok_or(NodeError::invalid_state("responder has no listen address"))?;
        initiator.add_peer(responder.name(), responder_addr);

        Ok(Self {
            initiator,
            responder,
            responder_addr,
            delivered,
        })
    }

    /// Run one exchange from the initiator to the responder
    ///
    /// # Errors
    ///
    /// Returns whatever error aborted the exchange.
    pub async fn send(&self, message: &str) -> Result<ExchangeReport, NodeError> {
        self.initiator
            .send_message(self.responder.name(), message)
            .await
    }

    /// Wait up to `wait` for the responder to deliver a message
    pub async fn next_delivered(&mut self, wait: Duration) -> Option<Delivered> {
        tokio::time::timeout(wait, self.delivered.recv())
            .await
            .ok()
            .flatten()
    }

    /// Start another sender that knows only the responder
    ///
    /// # Errors
    ///
    /// Returns an error if the node fails to start.
    pub async fn extra_sender(&self, name: &str) -> Result<Node, NodeError> {
        let node = Node::new(Self::loopback_config(name))?;
        node.start().await?;
        node.add_peer(self.responder.name(), self.responder_addr);
        Ok(node)
    }

    /// Stop both nodes
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if a node was already stopped.
    pub async fn cleanup(self) -> Result<(), NodeError> {
        self.initiator.stop().await?;
        self.responder.stop().await?;
        Ok(())
    }
}
