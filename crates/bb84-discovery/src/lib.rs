//! # BB84 Discovery
//!
//! LAN peer discovery for BB84 Net.
//!
//! Each node periodically broadcasts a small `Hello` datagram carrying its
//! display name and TCP port, and a `Goodbye` when it stops. Listeners turn
//! these into add/update/remove events for a [`PeerEventSink`]; peers that
//! fall silent for longer than the configured TTL are removed.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bb84_discovery::{DiscoveryConfig, DiscoveryService, PeerEventSink};
//! use std::net::IpAddr;
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl PeerEventSink for Printer {
//!     fn peer_added(&self, name: &str, address: IpAddr, port: u16) {
//!         println!("+ {name} {address}:{port}");
//!     }
//!     fn peer_updated(&self, name: &str, address: IpAddr, port: u16) {
//!         println!("~ {name} {address}:{port}");
//!     }
//!     fn peer_removed(&self, name: &str) {
//!         println!("- {name}");
//!     }
//! }
//!
//! # async fn example() -> Result<(), bb84_discovery::DiscoveryError> {
//! let config = DiscoveryConfig {
//!     enabled: true,
//!     ..DiscoveryConfig::default()
//! };
//! let service = DiscoveryService::start(config, "alice".into(), 7000, Arc::new(Printer)).await?;
//! service.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod protocol;
pub mod service;

pub use error::DiscoveryError;
pub use protocol::Announcement;
pub use service::{DEFAULT_DISCOVERY_PORT, DiscoveryConfig, DiscoveryService};

use std::net::IpAddr;

/// Receiver of peer lifecycle events
pub trait PeerEventSink: Send + Sync {
    /// A peer announced itself for the first time
    fn peer_added(&self, name: &str, address: IpAddr, port: u16);

    /// A known peer announced a different address or port
    fn peer_updated(&self, name: &str, address: IpAddr, port: u16);

    /// A peer said goodbye or expired
    fn peer_removed(&self, name: &str);
}
