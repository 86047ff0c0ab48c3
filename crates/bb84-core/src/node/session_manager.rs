//! Session table for inbound exchanges
//!
//! Each accepted `init` frame opens an exchange identified by an
//! [`ExchangeId`]. The table holds a read-only summary per exchange for
//! observation; the key material itself stays inside the connection task
//! that owns the responder session and is never shared.

use dashmap::DashMap;
use rand::Rng;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Opaque handle for one key exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(u64);

impl ExchangeId {
    /// Generate a random identifier
    #[must_use]
    pub fn random() -> Self {
        Self(rand::thread_rng().r#gen())
    }

    /// Raw value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ExchangeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// Progress of an inbound exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStage {
    /// Bases sent, waiting for key material
    BasesSent,
    /// Sifted key computed, waiting for check bits
    KeySifted,
    /// Check passed, final key held
    Verified,
    /// Check failed
    Rejected,
    /// Ciphertext decrypted and delivered
    Delivered,
}

/// Observable summary of one inbound exchange
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Exchange identifier
    pub exchange_id: ExchangeId,
    /// Remote address of the initiator
    pub peer_addr: SocketAddr,
    /// Raw bit count announced by the initiator
    pub required_key_bits: usize,
    /// Current stage
    pub stage: ExchangeStage,
    /// When the `init` frame was accepted
    pub started_at: Instant,
}

/// Concurrent table of in-flight inbound exchanges
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: DashMap<ExchangeId, SessionSummary>,
    total_exchanges: AtomicU64,
}

impl SessionManager {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new exchange and return its identifier
    pub fn register(&self, peer_addr: SocketAddr, required_key_bits: usize) -> ExchangeId {
        let mut exchange_id = ExchangeId::random();
        while self.sessions.contains_key(&exchange_id) {
            exchange_id = ExchangeId::random();
        }

        self.sessions.insert(
            exchange_id,
            SessionSummary {
                exchange_id,
                peer_addr,
                required_key_bits,
                stage: ExchangeStage::BasesSent,
                started_at: Instant::now(),
            },
        );
        self.total_exchanges.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            "Exchange {} opened by {} ({} raw bits)",
            exchange_id,
            peer_addr,
            required_key_bits
        );
        exchange_id
    }

    /// Record progress of an exchange
    pub fn update_stage(&self, exchange_id: ExchangeId, stage: ExchangeStage) {
        if let Some(mut summary) = self.sessions.get_mut(&exchange_id) {
            summary.stage = stage;
        }
    }

    /// Close an exchange
    pub fn remove(&self, exchange_id: ExchangeId) -> Option<SessionSummary> {
        let removed = self.sessions.remove(&exchange_id).map(|(_, summary)| summary);
        if let Some(summary) = &removed {
            tracing::debug!(
                "Exchange {} closed at stage {:?} after {:?}",
                exchange_id,
                summary.stage,
                summary.started_at.elapsed()
            );
        }
        removed
    }

    /// Summary of one exchange
    #[must_use]
    pub fn get(&self, exchange_id: ExchangeId) -> Option<SessionSummary> {
        self.sessions.get(&exchange_id).map(|entry| entry.value().clone())
    }

    /// Summaries of every in-flight exchange
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionSummary> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of in-flight exchanges
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of exchanges opened since the node started
    #[must_use]
    pub fn total_exchanges(&self) -> u64 {
        self.total_exchanges.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[test]
    fn test_exchange_id_display_is_hex() {
        let id = ExchangeId::from(0x0123_4567_89ab_cdef);
        assert_eq!(id.to_string(), "0123456789abcdef");
    }

    #[test]
    fn test_register_and_remove() {
        let manager = SessionManager::new();
        let id = manager.register(addr(), 32);

        assert_eq!(manager.active_count(), 1);
        assert_eq!(manager.get(id).unwrap().stage, ExchangeStage::BasesSent);

        manager.update_stage(id, ExchangeStage::Verified);
        assert_eq!(manager.get(id).unwrap().stage, ExchangeStage::Verified);

        let removed = manager.remove(id).unwrap();
        assert_eq!(removed.required_key_bits, 32);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.total_exchanges(), 1);
    }

    #[test]
    fn test_distinct_ids() {
        let manager = SessionManager::new();
        let a = manager.register(addr(), 16);
        let b = manager.register(addr(), 16);
        assert_ne!(a, b);
        assert_eq!(manager.snapshot().len(), 2);
    }

    #[test]
    fn test_update_unknown_is_noop() {
        let manager = SessionManager::new();
        manager.update_stage(ExchangeId::from(7), ExchangeStage::Delivered);
        assert!(manager.remove(ExchangeId::from(7)).is_none());
    }
}
