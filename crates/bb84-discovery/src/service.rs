//! Broadcast discovery service.
//!
//! One UDP socket per node, bound with `SO_REUSEADDR` and `SO_BROADCAST` so
//! several nodes on one host can share the discovery port. The datagram's
//! source address is taken as the peer's address; the port comes from the
//! announcement.

use crate::PeerEventSink;
use crate::error::DiscoveryError;
use crate::protocol::{Announcement, MAX_ANNOUNCEMENT_SIZE, PROTOCOL_VERSION};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

/// Default UDP port for announcements
pub const DEFAULT_DISCOVERY_PORT: u16 = 48484;

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Whether the node runs discovery at all
    pub enabled: bool,
    /// Local address the discovery socket binds to
    pub bind_addr: IpAddr,
    /// UDP port announcements are sent to and received on
    pub port: u16,
    /// Destination address for announcements
    pub broadcast_addr: IpAddr,
    /// Interval between `Hello` announcements
    pub announce_interval: Duration,
    /// A peer not heard from for this long is removed
    pub peer_ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_DISCOVERY_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            announce_interval: Duration::from_secs(2),
            peer_ttl: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
struct PeerEntry {
    name: String,
    address: IpAddr,
    port: u16,
    last_seen: Instant,
}

/// Peer table and event fan-out, shared by the service tasks
struct ServiceState {
    instance: u64,
    peers: RwLock<HashMap<u64, PeerEntry>>,
    sink: Arc<dyn PeerEventSink>,
}

impl ServiceState {
    fn new(instance: u64, sink: Arc<dyn PeerEventSink>) -> Self {
        Self {
            instance,
            peers: RwLock::new(HashMap::new()),
            sink,
        }
    }

    async fn handle_announcement(&self, announcement: Announcement, from: IpAddr) {
        if announcement.instance() == self.instance {
            return;
        }

        match announcement {
            Announcement::Hello {
                instance,
                name,
                port,
                version,
            } => {
                if version != PROTOCOL_VERSION {
                    tracing::debug!(
                        "Ignoring {} from {}: protocol version {:#x}",
                        name,
                        from,
                        version
                    );
                    return;
                }

                let mut peers = self.peers.write().await;
                let previous = peers.insert(
                    instance,
                    PeerEntry {
                        name: name.clone(),
                        address: from,
                        port,
                        last_seen: Instant::now(),
                    },
                );

                match previous {
                    None => self.sink.peer_added(&name, from, port),
                    Some(old) if old.name != name => {
                        self.release_name(&peers, &old.name);
                        self.sink.peer_added(&name, from, port);
                    }
                    Some(old) if old.address != from || old.port != port => {
                        self.sink.peer_updated(&name, from, port);
                    }
                    Some(_) => {}
                }
            }
            Announcement::Goodbye { instance } => {
                let mut peers = self.peers.write().await;
                if let Some(entry) = peers.remove(&instance) {
                    tracing::debug!("Peer {} said goodbye", entry.name);
                    self.release_name(&peers, &entry.name);
                }
            }
        }
    }

    /// Remove peers silent for longer than `ttl`; returns how many expired
    async fn expire(&self, ttl: Duration) -> usize {
        let mut peers = self.peers.write().await;
        let expired: Vec<u64> = peers
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() > ttl)
            .map(|(instance, _)| *instance)
            .collect();

        let removed: Vec<PeerEntry> = expired
            .iter()
            .filter_map(|instance| peers.remove(instance))
            .collect();
        for entry in &removed {
            tracing::debug!("Peer {} expired", entry.name);
            self.release_name(&peers, &entry.name);
        }
        removed.len()
    }

    /// An instance gave up `name`: repoint it at another live holder, or drop it
    fn release_name(&self, peers: &HashMap<u64, PeerEntry>, name: &str) {
        let holder = peers
            .values()
            .filter(|entry| entry.name == name)
            .max_by_key(|entry| entry.last_seen);
        match holder {
            Some(entry) => self.sink.peer_updated(name, entry.address, entry.port),
            None => self.sink.peer_removed(name),
        }
    }
}

fn bind_socket(addr: SocketAddr) -> Result<UdpSocket, DiscoveryError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DiscoveryError::Bind(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| DiscoveryError::Bind(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| DiscoveryError::Bind(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| DiscoveryError::Bind(format!("{addr}: {e}")))?;

    // Convert to std socket, then to tokio socket
    socket
        .set_nonblocking(true)
        .map_err(|e| DiscoveryError::Bind(e.to_string()))?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| DiscoveryError::Bind(e.to_string()))
}

/// Running discovery service
pub struct DiscoveryService {
    config: DiscoveryConfig,
    name: String,
    port: u16,
    socket: Arc<UdpSocket>,
    state: Arc<ServiceState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    /// Bind the discovery socket and start announcing `name` with TCP `port`
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Bind`] if the socket cannot be set up.
    pub async fn start(
        config: DiscoveryConfig,
        name: String,
        port: u16,
        sink: Arc<dyn PeerEventSink>,
    ) -> Result<Self, DiscoveryError> {
        let socket = Arc::new(bind_socket(SocketAddr::new(config.bind_addr, config.port))?);
        let instance: u64 = rand::thread_rng().r#gen();
        let state = Arc::new(ServiceState::new(instance, sink));
        let (shutdown, _) = watch::channel(false);

        let service = Self {
            config,
            name,
            port,
            socket,
            state,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        };

        let receive = tokio::spawn(receive_loop(
            Arc::clone(&service.socket),
            Arc::clone(&service.state),
            service.shutdown.subscribe(),
        ));
        let announce = tokio::spawn(announce_loop(
            Arc::clone(&service.socket),
            Arc::clone(&service.state),
            service.hello(),
            service.target(),
            service.config.announce_interval,
            service.config.peer_ttl,
            service.shutdown.subscribe(),
        ));
        service.tasks.lock().await.extend([receive, announce]);

        tracing::info!(
            "Discovery started for {} on {} (instance {:016x})",
            service.name,
            service.socket.local_addr()?,
            instance
        );
        Ok(service)
    }

    fn hello(&self) -> Announcement {
        Announcement::Hello {
            instance: self.state.instance,
            name: self.name.clone(),
            port: self.port,
            version: PROTOCOL_VERSION,
        }
    }

    fn target(&self) -> SocketAddr {
        SocketAddr::new(self.config.broadcast_addr, self.config.port)
    }

    /// Address the discovery socket is bound to
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }

    /// Random identifier this service announces under
    #[must_use]
    pub fn instance(&self) -> u64 {
        self.state.instance
    }

    /// Number of peers currently known
    pub async fn peer_count(&self) -> usize {
        self.state.peers.read().await.len()
    }

    /// Send a goodbye and stop all service tasks
    pub async fn stop(self) {
        let goodbye = Announcement::Goodbye {
            instance: self.state.instance,
        };
        match goodbye.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, self.target()).await {
                    tracing::debug!("Failed to send goodbye: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode goodbye: {}", e),
        }

        self.shutdown.send_replace(true);
        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("Discovery task ended abnormally: {}", e);
            }
        }
        tracing::info!("Discovery stopped for {}", self.name);
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    state: Arc<ServiceState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_ANNOUNCEMENT_SIZE + 1];

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => match Announcement::from_bytes(&buf[..len]) {
                    Ok(announcement) => state.handle_announcement(announcement, from.ip()).await,
                    Err(e) => tracing::trace!("Ignoring datagram from {}: {}", from, e),
                },
                Err(e) => {
                    tracing::debug!("Discovery receive error: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    state: Arc<ServiceState>,
    hello: Announcement,
    target: SocketAddr,
    interval: Duration,
    ttl: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let bytes = match hello.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Cannot announce: {}", e);
            return;
        }
    };
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&bytes, target).await {
                    tracing::debug!("Failed to announce to {}: {}", target, e);
                }
                let expired = state.expire(ttl).await;
                if expired > 0 {
                    tracing::debug!("Expired {} peers", expired);
                }
            }
        }
    }
}
