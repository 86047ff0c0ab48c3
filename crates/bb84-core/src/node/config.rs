//! Node configuration

use crate::bits::Basis;
use crate::node::error::{NodeError, Result};
use crate::{DEFAULT_CHECK_FRACTION, DEFAULT_ERROR_THRESHOLD};
use bb84_discovery::DiscoveryConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Display name announced to peers and used as `sender` on outgoing messages
    pub name: String,

    /// Listen address for incoming connections (port 0 picks an ephemeral port)
    pub listen_addr: SocketAddr,

    /// Handshake parameters
    pub handshake: HandshakeConfig,

    /// LAN discovery configuration
    pub discovery: DiscoveryConfig,

    /// Number of error-rate observations kept before the oldest are dropped
    pub error_log_capacity: usize,
}

impl NodeConfig {
    /// Configuration for a node with the given display name
    #[must_use]
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(NodeError::invalid_config("node name must not be empty"));
        }
        if self.name.contains('|') || self.name.contains('\n') {
            return Err(NodeError::invalid_config(
                "node name must not contain '|' or newlines",
            ));
        }
        if self.error_log_capacity == 0 {
            return Err(NodeError::invalid_config(
                "error log capacity must be at least 1",
            ));
        }
        self.handshake.validate()
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "node".to_string(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            handshake: HandshakeConfig::default(),
            discovery: DiscoveryConfig::default(),
            error_log_capacity: 1024,
        }
    }
}

/// How a party picks the basis for each raw bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BasisChoice {
    /// Independent uniform choice per bit
    #[default]
    Random,
    /// Always the same basis; two parties both using `Fixed` with the
    /// same basis sift every bit, which makes runs deterministic
    Fixed(Basis),
}

/// Handshake parameters shared by the initiator and responder sides
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Responder closes a connection that stays silent this long
    pub idle_timeout: Duration,

    /// Initiator gives up connecting after this long
    pub connect_timeout: Duration,

    /// Initiator gives up waiting for any single response after this long
    pub response_timeout: Duration,

    /// Maximum acceptable check-bit mismatch fraction
    pub error_threshold: f64,

    /// Fraction of the sifted key revealed as check bits
    pub check_fraction: f64,

    /// Largest `required_key_bits` either side will accept
    pub max_key_bits: usize,

    /// Longest accepted frame line in bytes
    pub max_frame_len: usize,

    /// Basis selection strategy
    pub basis_choice: BasisChoice,

    /// Probability that the responder reads a raw bit flipped, simulating a
    /// noisy or eavesdropped channel
    pub channel_noise: f64,
}

impl HandshakeConfig {
    /// Validate handshake parameters
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout.is_zero()
            || self.connect_timeout.is_zero()
            || self.response_timeout.is_zero()
        {
            return Err(NodeError::invalid_config("timeouts must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.error_threshold) {
            return Err(NodeError::invalid_config(
                "error threshold must be within 0.0..=1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.check_fraction) {
            return Err(NodeError::invalid_config(
                "check fraction must be within 0.0..=1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.channel_noise) {
            return Err(NodeError::invalid_config(
                "channel noise must be within 0.0..=1.0",
            ));
        }
        if self.max_key_bits == 0 {
            return Err(NodeError::invalid_config("max key bits must be at least 1"));
        }
        if self.max_frame_len < 64 {
            return Err(NodeError::invalid_config(
                "max frame length must be at least 64 bytes",
            ));
        }
        Ok(())
    }
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            check_fraction: DEFAULT_CHECK_FRACTION,
            max_key_bits: 1 << 20,
            max_frame_len: 16 * 1024 * 1024, // 16 MiB, a 1 Mbit key_exchange is ~10 MiB of JSON
            basis_choice: BasisChoice::Random,
            channel_noise: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr.port(), 0);
        assert_eq!(config.handshake.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.handshake.error_threshold, 0.11);
        assert_eq!(config.handshake.check_fraction, 0.2);
        assert!(!config.discovery.enabled);
    }

    #[test]
    fn test_invalid_name() {
        assert!(NodeConfig::with_name("").validate().is_err());
        assert!(NodeConfig::with_name("a|b").validate().is_err());
        assert!(NodeConfig::with_name("alice").validate().is_ok());
    }

    #[test]
    fn test_invalid_handshake_values() {
        let mut config = HandshakeConfig::default();
        config.error_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = HandshakeConfig::default();
        config.idle_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = HandshakeConfig::default();
        config.channel_noise = -0.1;
        assert!(config.validate().is_err());

        let mut config = HandshakeConfig::default();
        config.max_key_bits = 0;
        assert!(config.validate().is_err());
    }
}
