//! Configuration system for the BB84 Net CLI.

use bb84_core::node::{HandshakeConfig, NodeConfig as CoreNodeConfig};
use bb84_discovery::{DEFAULT_DISCOVERY_PORT, DiscoveryConfig as CoreDiscoveryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node identity
    #[serde(default)]
    pub node: NodeConfig,

    /// Network settings
    #[serde(default)]
    pub network: NetworkConfig,

    /// Key exchange parameters
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// LAN discovery
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Statically known peers
    #[serde(default)]
    pub peers: PeersConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Display name announced to peers
    #[serde(default = "default_name")]
    pub name: String,
}

/// Network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-response timeout in seconds
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// Inbound idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Key exchange parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Maximum acceptable check-bit error rate
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,

    /// Fraction of the sifted key revealed as check bits
    #[serde(default = "default_check_fraction")]
    pub check_fraction: f64,

    /// Largest raw key this node will generate or accept
    #[serde(default = "default_max_key_bits")]
    pub max_key_bits: usize,

    /// Simulated channel noise applied to inbound raw bits
    #[serde(default)]
    pub channel_noise: f64,
}

/// LAN discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Broadcast announcements and listen for peers
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// UDP discovery port
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Announcement destination address
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,

    /// Seconds between announcements
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,

    /// Seconds of silence before a peer is dropped
    #[serde(default = "default_peer_ttl")]
    pub peer_ttl_secs: u64,
}

/// Statically known peers
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PeersConfig {
    /// Entries of the form `name=host:port`
    #[serde(default)]
    pub static_peers: Vec<String>,
}

/// Logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_name() -> String {
    "bb84-node".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_response_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    10
}

fn default_error_threshold() -> f64 {
    bb84_core::DEFAULT_ERROR_THRESHOLD
}

fn default_check_fraction() -> f64 {
    bb84_core::DEFAULT_CHECK_FRACTION
}

fn default_max_key_bits() -> usize {
    1 << 20
}

fn default_true() -> bool {
    true
}

fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_broadcast_addr() -> String {
    "255.255.255.255".to_string()
}

fn default_announce_interval() -> u64 {
    2
}

fn default_peer_ttl() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_secs: default_connect_timeout(),
            response_timeout_secs: default_response_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            check_fraction: default_check_fraction(),
            max_key_bits: default_max_key_bits(),
            channel_noise: 0.0,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_discovery_port(),
            broadcast_addr: default_broadcast_addr(),
            announce_interval_secs: default_announce_interval(),
            peer_ttl_secs: default_peer_ttl(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A `name=host:port` peer entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPeer {
    /// Display name
    pub name: String,
    /// Resolved address
    pub addr: SocketAddr,
}

impl StaticPeer {
    /// Parse `name=host:port`, resolving the host
    pub fn parse(entry: &str) -> anyhow::Result<Self> {
        let (name, addr) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Peer '{}' must be name=host:port", entry))?;
        if name.is_empty() {
            anyhow::bail!("Peer '{}' has an empty name", entry);
        }
        let addr = addr
            .to_socket_addrs()
            .map_err(|e| anyhow::anyhow!("Peer '{}' has invalid address: {}", entry, e))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("Peer '{}' did not resolve", entry))?;
        Ok(Self {
            name: name.to_string(),
            addr,
        })
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration file location
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("bb84/config.toml")
    }

    /// Load the default file, creating it with defaults if missing
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse the listen address
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.network.listen_addr.parse()?)
    }

    /// Parse every static peer entry
    pub fn static_peers(&self) -> anyhow::Result<Vec<StaticPeer>> {
        self.peers
            .static_peers
            .iter()
            .map(|entry| StaticPeer::parse(entry))
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        if self.node.name.is_empty() || self.node.name.contains(['|', '\n']) {
            anyhow::bail!("Invalid node name: {:?}", self.node.name);
        }

        for (value, label) in [
            (self.protocol.error_threshold, "Error threshold"),
            (self.protocol.check_fraction, "Check fraction"),
            (self.protocol.channel_noise, "Channel noise"),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be between 0.0 and 1.0, got {}", label, value);
            }
        }

        if self.protocol.max_key_bits == 0 {
            anyhow::bail!("Max key bits must be at least 1");
        }

        if self.network.connect_timeout_secs == 0
            || self.network.response_timeout_secs == 0
            || self.network.idle_timeout_secs == 0
        {
            anyhow::bail!("Timeouts must be at least 1 second");
        }

        self.discovery
            .broadcast_addr
            .parse::<IpAddr>()
            .map_err(|e| anyhow::anyhow!("Invalid broadcast address: {}", e))?;
        if self.discovery.announce_interval_secs == 0 || self.discovery.peer_ttl_secs == 0 {
            anyhow::bail!("Discovery intervals must be at least 1 second");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.static_peers()?;
        Ok(())
    }

    /// Build the library node configuration
    pub fn to_node_config(&self) -> anyhow::Result<CoreNodeConfig> {
        let handshake = HandshakeConfig {
            idle_timeout: Duration::from_secs(self.network.idle_timeout_secs),
            connect_timeout: Duration::from_secs(self.network.connect_timeout_secs),
            response_timeout: Duration::from_secs(self.network.response_timeout_secs),
            error_threshold: self.protocol.error_threshold,
            check_fraction: self.protocol.check_fraction,
            max_key_bits: self.protocol.max_key_bits,
            channel_noise: self.protocol.channel_noise,
            ..HandshakeConfig::default()
        };

        let discovery = CoreDiscoveryConfig {
            enabled: self.discovery.enabled,
            port: self.discovery.port,
            broadcast_addr: self.discovery.broadcast_addr.parse()?,
            announce_interval: Duration::from_secs(self.discovery.announce_interval_secs),
            peer_ttl: Duration::from_secs(self.discovery.peer_ttl_secs),
            ..CoreDiscoveryConfig::default()
        };

        let config = CoreNodeConfig {
            name: self.node.name.clone(),
            listen_addr: self.parse_listen_addr()?,
            handshake,
            discovery,
            ..CoreNodeConfig::default()
        };
        config.validate()?;
        Ok(config)
    }
}
