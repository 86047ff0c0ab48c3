//! Peer directory
//!
//! Maps display names to network addresses. Only discovery events (or a
//! caller registering a peer by hand) mutate the table; everything else
//! reads snapshots.

use crate::node::error::{NodeError, Result};
use bb84_discovery::PeerEventSink;
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};

/// A known peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Display name
    pub name: String,
    /// IP address the peer listens on
    pub address: IpAddr,
    /// TCP port the peer listens on
    pub port: u16,
}

impl PeerRecord {
    /// Address to connect to
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Concurrent table of known peers keyed by display name
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: DashMap<String, PeerRecord>,
}

impl PeerDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A peer appeared
    pub fn on_peer_added(&self, name: &str, address: IpAddr, port: u16) {
        let record = PeerRecord {
            name: name.to_string(),
            address,
            port,
        };
        if self.peers.insert(name.to_string(), record).is_none() {
            tracing::info!("Peer added: {} at {}:{}", name, address, port);
        }
    }

    /// A peer changed address or port
    pub fn on_peer_updated(&self, name: &str, address: IpAddr, port: u16) {
        let record = PeerRecord {
            name: name.to_string(),
            address,
            port,
        };
        if let Some(old) = self.peers.insert(name.to_string(), record) {
            if old.address != address || old.port != port {
                tracing::debug!(
                    "Peer updated: {} {} -> {}:{}",
                    name,
                    old.socket_addr(),
                    address,
                    port
                );
            }
        }
    }

    /// A peer went away
    pub fn on_peer_removed(&self, name: &str) {
        if self.peers.remove(name).is_some() {
            tracing::info!("Peer removed: {}", name);
        }
    }

    /// Look up a peer by display name
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::PeerNotFound`] if no such peer is known.
    pub fn resolve(&self, name: &str) -> Result<PeerRecord> {
        self.peers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| NodeError::PeerNotFound(name.to_string()))
    }

    /// Sorted names of every peer except `self_name`
    #[must_use]
    pub fn list_others(&self, self_name: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| entry.key() != self_name)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Snapshot of every record, sorted by name
    #[must_use]
    pub fn records(&self) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> =
            self.peers.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Number of known peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True if no peers are known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerEventSink for PeerDirectory {
    fn peer_added(&self, name: &str, address: IpAddr, port: u16) {
        self.on_peer_added(name, address, port);
    }

    fn peer_updated(&self, name: &str, address: IpAddr, port: u16) {
        self.on_peer_updated(name, address, port);
    }

    fn peer_removed(&self, name: &str) {
        self.on_peer_removed(name);
    }
}
