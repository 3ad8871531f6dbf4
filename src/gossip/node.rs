//! Gossip node: TCP transport, peer sessions and flood relay
//!
//! Each connection gets its own task reading length-prefixed frames and a
//! writer task draining a bounded queue. Inbound messages are validated,
//! signature-checked and deduplicated before being published to local
//! subscribers and flooded to every other peer with bounded concurrency.

use super::codec::{
    hash_message, prepare_for_relay, sign_message, validate_message, verify_message_signature,
    GossipCodec, RejectReason, SignatureStatus,
};
use super::dedup::{SeenCache, DEFAULT_DEDUP_CAPACITY};
use super::peers::PeerStore;
use super::protocol::{
    GossipMessage, HelloPayload, MessageType, PeerInfo, PeerListPayload, PeerListRequestPayload,
    PingPayload, PongPayload, DEFAULT_PORT, MESSAGE_TTL, PROTOCOL_VERSION,
};
use crate::crypto::NodeIdentity;
use crate::utils::current_timestamp_millis;
use crate::{Error, Result};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Per-peer outbound queue depth
const OUTBOUND_QUEUE: usize = 256;

/// Subscriber channel depth
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Peers returned when a `PEER_LIST_REQUEST` carries no limit
const DEFAULT_PEER_LIST_LIMIT: usize = 50;

/// Gossip node settings
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub listen_addr: SocketAddr,
    /// `host:port` peers dialed at startup and redialed when dropped
    pub bootstrap_peers: Vec<String>,
    pub max_peers: usize,
    /// Upper bound on concurrent sends per flood
    pub relay_concurrency: usize,
    pub dedup_capacity: usize,
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
    pub capabilities: Vec<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            bootstrap_peers: Vec::new(),
            max_peers: 50,
            relay_concurrency: 8,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            keepalive_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            capabilities: vec!["mining".to_string(), "relay".to_string()],
        }
    }
}

/// An application message received from a peer
#[derive(Debug, Clone)]
pub struct GossipEvent {
    pub topic: &'static str,
    pub message: GossipMessage,
    pub from: SocketAddr,
}

/// Gossip observability snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GossipStatus {
    pub node_id: String,
    pub listen_addr: Option<String>,
    pub connected_peers: usize,
    pub known_peers: usize,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_relayed: u64,
    pub duplicates_dropped: u64,
    pub messages_rejected: u64,
}

#[derive(Debug, Default)]
struct GossipCounters {
    received: AtomicU64,
    sent: AtomicU64,
    relayed: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
}

struct PeerConnection {
    addr: SocketAddr,
    peer_id: RwLock<Option<String>>,
    tx: mpsc::Sender<GossipMessage>,
    cancel: CancellationToken,
}

impl PeerConnection {
    /// Reputation key: the announced node id, or the remote IP before the
    /// handshake so a fresh source port does not reset the score
    fn peer_key(&self) -> String {
        self.peer_id
            .read()
            .clone()
            .unwrap_or_else(|| address_key(&self.addr))
    }
}

struct GossipShared {
    config: GossipConfig,
    identity: NodeIdentity,
    node_id: String,
    connections: DashMap<SocketAddr, Arc<PeerConnection>>,
    store: Arc<dyn PeerStore>,
    seen: SeenCache,
    events: broadcast::Sender<GossipEvent>,
    counters: GossipCounters,
    shutdown: CancellationToken,
    local_addr: RwLock<Option<SocketAddr>>,
    tokens_count: AtomicU64,
    dial_tx: RwLock<Option<mpsc::UnboundedSender<SocketAddr>>>,
}

/// Handle to a running gossip node
#[derive(Clone)]
pub struct GossipNode {
    shared: Arc<GossipShared>,
}

impl GossipNode {
    /// Create a node; nothing is bound until [`GossipNode::start`]
    pub fn new(config: GossipConfig, identity: NodeIdentity, store: Arc<dyn PeerStore>) -> Self {
        let node_id = identity.node_id();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let seen = SeenCache::new(
            config.dedup_capacity,
            Duration::from_secs(MESSAGE_TTL as u64),
        );

        Self {
            shared: Arc::new(GossipShared {
                config,
                identity,
                node_id,
                connections: DashMap::new(),
                store,
                seen,
                events,
                counters: GossipCounters::default(),
                shutdown: CancellationToken::new(),
                local_addr: RwLock::new(None),
                tokens_count: AtomicU64::new(0),
                dial_tx: RwLock::new(None),
            }),
        }
    }

    /// This node's id (hex ed25519 public key)
    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    /// Bound listener address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.read()
    }

    /// Bind the listener, start the dialer and dial bootstrap peers
    pub async fn start(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.shared.config.listen_addr)
            .await
            .map_err(|e| {
                Error::network(format!(
                    "Failed to bind gossip listener on {}: {}",
                    self.shared.config.listen_addr, e
                ))
            })?;
        let local_addr = listener.local_addr()?;
        *self.shared.local_addr.write() = Some(local_addr);

        info!(
            node_id = %self.shared.node_id,
            "Gossip node listening on {} (protocol {})",
            local_addr,
            PROTOCOL_VERSION
        );

        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        *self.shared.dial_tx.write() = Some(dial_tx);

        tokio::spawn(Self::accept_loop(Arc::clone(&self.shared), listener));
        tokio::spawn(Self::dial_loop(Arc::clone(&self.shared), dial_rx));
        tokio::spawn(Self::maintenance_loop(Arc::clone(&self.shared)));

        Ok(local_addr)
    }

    /// Dial a peer and run the session in the background
    pub async fn connect(&self, addr: &str) -> Result<SocketAddr> {
        let resolved = resolve(addr).await?;
        GossipShared::connect(&self.shared, resolved).await?;
        Ok(resolved)
    }

    /// Receive application messages from peers
    pub fn subscribe(&self) -> broadcast::Receiver<GossipEvent> {
        self.shared.events.subscribe()
    }

    /// Sign and flood a locally created message, returning the number of
    /// peers it was queued to
    pub async fn publish(&self, mut msg: GossipMessage) -> usize {
        sign_message(&mut msg, &self.shared.identity);
        self.shared.seen.insert(&hash_message(&msg));
        let sent = self.shared.flood(msg, None).await;
        self.shared
            .counters
            .sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    /// Tokens announced in `HELLO`
    pub fn set_tokens_count(&self, count: u64) {
        self.shared.tokens_count.store(count, Ordering::Relaxed);
    }

    pub fn connected_peers(&self) -> usize {
        self.shared.connections.len()
    }

    /// Node ids of peers that completed the handshake
    pub fn peer_ids(&self) -> Vec<String> {
        self.shared
            .connections
            .iter()
            .filter_map(|c| c.value().peer_id.read().clone())
            .collect()
    }

    pub fn status(&self) -> GossipStatus {
        let counters = &self.shared.counters;
        GossipStatus {
            node_id: self.shared.node_id.clone(),
            listen_addr: self.local_addr().map(|a| a.to_string()),
            connected_peers: self.shared.connections.len(),
            known_peers: self.shared.store.len(),
            messages_received: counters.received.load(Ordering::Relaxed),
            messages_sent: counters.sent.load(Ordering::Relaxed),
            messages_relayed: counters.relayed.load(Ordering::Relaxed),
            duplicates_dropped: counters.duplicates.load(Ordering::Relaxed),
            messages_rejected: counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Close the listener and every session
    pub fn shutdown(&self) {
        info!("Shutting down gossip node");
        self.shared.shutdown.cancel();
        self.shared.dial_tx.write().take();
    }

    async fn accept_loop(shared: Arc<GossipShared>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if shared.connections.len() >= shared.config.max_peers {
                            warn!("Max peers reached, rejecting {}", addr);
                            continue;
                        }
                        if shared.store.is_banned(&address_key(&addr)) {
                            debug!("Refusing connection from banned address {}", addr);
                            continue;
                        }
                        debug!("Accepted gossip connection from {}", addr);
                        tokio::spawn(GossipShared::run_connection(
                            Arc::clone(&shared),
                            stream,
                            addr,
                            false,
                        ));
                    }
                    Err(e) => warn!("Failed to accept gossip connection: {}", e),
                },
            }
        }
        debug!("Gossip accept loop stopped");
    }

    async fn dial_loop(shared: Arc<GossipShared>, mut dial_rx: mpsc::UnboundedReceiver<SocketAddr>) {
        loop {
            let addr = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                addr = dial_rx.recv() => match addr {
                    Some(addr) => addr,
                    None => break,
                },
            };
            if let Err(e) = GossipShared::connect(&shared, addr).await {
                debug!("Dial to {} failed: {}", addr, e);
            }
        }
    }

    /// Redial bootstrap peers that are not connected
    async fn maintenance_loop(shared: Arc<GossipShared>) {
        let mut ticker = tokio::time::interval(shared.config.keepalive_interval);
        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for peer in &shared.config.bootstrap_peers {
                        match resolve(peer).await {
                            Ok(addr) if !shared.connections.contains_key(&addr) => {
                                shared.dial(addr);
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Cannot resolve bootstrap peer {}: {}", peer, e),
                        }
                    }
                }
            }
        }
    }
}

impl GossipShared {
    async fn connect(shared: &Arc<GossipShared>, addr: SocketAddr) -> Result<()> {
        if shared.connections.contains_key(&addr) {
            return Ok(());
        }
        if shared.connections.len() >= shared.config.max_peers {
            return Err(Error::network(format!(
                "Max peers ({}) reached, not dialing {}",
                shared.config.max_peers, addr
            )));
        }
        if Some(addr) == *shared.local_addr.read() {
            return Err(Error::network("Refusing to dial own listener"));
        }
        if shared.store.is_banned(&address_key(&addr)) {
            return Err(Error::network(format!("Not dialing banned address {}", addr)));
        }

        let stream = tokio::time::timeout(shared.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout(format!("connect to {}", addr)))?
            .map_err(|e| Error::network(format!("Failed to connect to {}: {}", addr, e)))?;

        info!("Connected to gossip peer {}", addr);
        tokio::spawn(Self::run_connection(Arc::clone(shared), stream, addr, true));
        Ok(())
    }

    fn dial(&self, addr: SocketAddr) {
        if let Some(tx) = self.dial_tx.read().as_ref() {
            let _ = tx.send(addr);
        }
    }

    async fn run_connection(
        shared: Arc<GossipShared>,
        stream: TcpStream,
        addr: SocketAddr,
        outbound: bool,
    ) {
        let (mut sink, mut frames) = Framed::new(stream, GossipCodec::new()).split();
        let (tx, mut rx) = mpsc::channel::<GossipMessage>(OUTBOUND_QUEUE);
        let conn = Arc::new(PeerConnection {
            addr,
            peer_id: RwLock::new(None),
            tx,
            cancel: shared.shutdown.child_token(),
        });
        shared.connections.insert(addr, Arc::clone(&conn));

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!("Write to {} failed: {}", addr, e);
                    break;
                }
            }
        });

        if outbound {
            match GossipMessage::hello(&shared.node_id, &shared.hello_payload()) {
                Ok(hello) => shared.send_direct(&conn, hello).await,
                Err(e) => warn!("Failed to build HELLO: {}", e),
            }
        }

        let mut keepalive = tokio::time::interval(shared.config.keepalive_interval);
        keepalive.tick().await;

        loop {
            tokio::select! {
                _ = conn.cancel.cancelled() => break,
                _ = keepalive.tick() => {
                    match GossipMessage::ping(&shared.node_id) {
                        Ok(ping) => shared.send_direct(&conn, ping).await,
                        Err(e) => warn!("Failed to build PING: {}", e),
                    }
                }
                frame = frames.next() => match frame {
                    Some(Ok(msg)) => shared.handle_inbound(&conn, msg).await,
                    Some(Err(Error::Protocol { message })) => {
                        shared.counters.received.fetch_add(1, Ordering::Relaxed);
                        shared.reject(&conn, RejectReason::MalformedPayload {
                            message_type: "frame".to_string(),
                            detail: message,
                        });
                    }
                    Some(Err(e)) => {
                        debug!("Read from {} failed: {}", addr, e);
                        break;
                    }
                    None => break,
                },
            }
        }

        shared.connections.remove(&addr);
        writer.abort();
        info!(peer = %conn.peer_key(), "Gossip peer {} disconnected", addr);
    }

    async fn handle_inbound(self: &Arc<Self>, conn: &PeerConnection, msg: GossipMessage) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if let Err(reason) = validate_message(&msg) {
            self.reject(conn, reason);
            return;
        }
        if verify_message_signature(&msg) == SignatureStatus::Invalid {
            self.reject(conn, RejectReason::InvalidSignature);
            return;
        }

        if msg.message_type.is_direct() {
            if let Err(reason) = self.handle_direct(conn, &msg).await {
                self.reject(conn, reason);
                return;
            }
            self.store.record_valid(&conn.peer_key());
            return;
        }

        let fingerprint = hash_message(&msg);
        if !self.seen.insert(&fingerprint) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            trace!(fingerprint = %fingerprint, "Dropping duplicate {}", msg.message_type);
            return;
        }
        self.store.record_valid(&conn.peer_key());

        if let Some(topic) = msg.topic() {
            let _ = self.events.send(GossipEvent {
                topic,
                message: msg.clone(),
                from: conn.addr,
            });
        }

        // Relay off the read loop: a slow neighbour must not stall this session.
        match prepare_for_relay(&msg) {
            Some(relayed) => {
                let shared = Arc::clone(self);
                let from = conn.addr;
                tokio::spawn(async move {
                    let message_type = relayed.message_type.clone();
                    let hops = relayed.hops;
                    let count = shared.flood(relayed, Some(from)).await;
                    shared
                        .counters
                        .relayed
                        .fetch_add(count as u64, Ordering::Relaxed);
                    trace!(hops = hops, peers = count, "Relayed {}", message_type);
                });
            }
            None => debug!(hops = msg.hops, "Not relaying exhausted {}", msg.message_type),
        }
    }

    async fn handle_direct(
        &self,
        conn: &PeerConnection,
        msg: &GossipMessage,
    ) -> std::result::Result<(), RejectReason> {
        match msg.message_type {
            MessageType::Hello | MessageType::HelloAck => {
                let hello: HelloPayload = decode_payload(msg)?;
                if hello.version != PROTOCOL_VERSION {
                    conn.cancel.cancel();
                    return Err(RejectReason::VersionMismatch(hello.version));
                }
                if hello.node_id == self.node_id {
                    debug!("Dropping connection to self at {}", conn.addr);
                    conn.cancel.cancel();
                    return Ok(());
                }
                if self.store.is_banned(&hello.node_id) {
                    conn.cancel.cancel();
                    return Err(RejectReason::BannedPeer(hello.node_id));
                }

                *conn.peer_id.write() = Some(hello.node_id.clone());
                self.store
                    .upsert(&hello.node_id, &conn.addr.ip().to_string(), hello.listening_port);
                info!(
                    peer = %hello.node_id,
                    capabilities = ?hello.capabilities,
                    "Handshake with {} complete",
                    conn.addr
                );

                let reply = if msg.message_type == MessageType::Hello {
                    GossipMessage::hello_ack(&self.node_id, &self.hello_payload())
                } else {
                    GossipMessage::peer_list_request(&self.node_id, DEFAULT_PEER_LIST_LIMIT)
                };
                match reply {
                    Ok(reply) => self.send_direct(conn, reply).await,
                    Err(e) => warn!("Failed to build handshake reply: {}", e),
                }
            }
            MessageType::PeerListRequest => {
                let request: PeerListRequestPayload = decode_payload(msg)?;
                let limit = if request.limit == 0 {
                    DEFAULT_PEER_LIST_LIMIT
                } else {
                    request.limit
                };
                let requester = conn.peer_key();
                let peers: Vec<PeerInfo> = self
                    .store
                    .list(limit + 1)
                    .into_iter()
                    .filter(|p| p.peer_id != requester && p.port != 0 && !p.is_banned())
                    .take(limit)
                    .map(|p| p.to_peer_info())
                    .collect();
                match GossipMessage::peer_list(&self.node_id, peers) {
                    Ok(reply) => self.send_direct(conn, reply).await,
                    Err(e) => warn!("Failed to build PEER_LIST: {}", e),
                }
            }
            MessageType::PeerList => {
                let list: PeerListPayload = decode_payload(msg)?;
                let connected = self.connected_peer_ids();
                for peer in list.peers {
                    if peer.peer_id == self.node_id || connected.contains(&peer.peer_id) {
                        continue;
                    }
                    if self.connections.len() >= self.config.max_peers {
                        break;
                    }
                    match format!("{}:{}", peer.host, peer.port).parse::<SocketAddr>() {
                        Ok(addr) => {
                            debug!(peer = %peer.peer_id, "Discovered peer at {}", addr);
                            self.dial(addr);
                        }
                        Err(_) => trace!("Ignoring unparsable peer address {}:{}", peer.host, peer.port),
                    }
                }
            }
            MessageType::Ping => {
                let ping: PingPayload = decode_payload(msg)?;
                match GossipMessage::pong(&self.node_id, &ping) {
                    Ok(pong) => self.send_direct(conn, pong).await,
                    Err(e) => warn!("Failed to build PONG: {}", e),
                }
            }
            MessageType::Pong => {
                let pong: PongPayload = decode_payload(msg)?;
                let now = current_timestamp_millis() as i64;
                let rtt = now.saturating_sub(pong.request_timestamp);
                trace!(peer = %conn.peer_key(), rtt_ms = rtt, "Keepalive answered");
            }
            _ => {}
        }
        Ok(())
    }

    fn reject(&self, conn: &PeerConnection, reason: RejectReason) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        let peer = conn.peer_key();
        let reputation = self.store.record_invalid(&peer);
        debug!(peer = %peer, reputation = reputation, "Rejected message from {}: {}", conn.addr, reason);

        if reputation <= 0 {
            warn!(peer = %peer, "Disconnecting peer {} with exhausted reputation", conn.addr);
            conn.cancel.cancel();
        }
    }

    fn hello_payload(&self) -> HelloPayload {
        let listening_port = self
            .local_addr
            .read()
            .map(|a| a.port())
            .unwrap_or(self.config.listen_addr.port());
        HelloPayload {
            node_id: self.node_id.clone(),
            version: PROTOCOL_VERSION.to_string(),
            capabilities: self.config.capabilities.clone(),
            tokens_count: self.tokens_count.load(Ordering::Relaxed),
            listening_port,
        }
    }

    fn connected_peer_ids(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter_map(|c| c.value().peer_id.read().clone())
            .collect()
    }

    async fn send_direct(&self, conn: &PeerConnection, mut msg: GossipMessage) {
        sign_message(&mut msg, &self.identity);
        match tokio::time::timeout(self.config.send_timeout, conn.tx.send(msg)).await {
            Ok(Ok(())) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(_)) => debug!("Session with {} already closed", conn.addr),
            Err(_) => warn!("Timed out queueing message for {}", conn.addr),
        }
    }

    /// Queue `msg` to every connection except `exclude`
    async fn flood(&self, msg: GossipMessage, exclude: Option<SocketAddr>) -> usize {
        let targets: Vec<Arc<PeerConnection>> = self
            .connections
            .iter()
            .filter(|c| Some(*c.key()) != exclude)
            .map(|c| Arc::clone(c.value()))
            .collect();

        let sent = AtomicUsize::new(0);
        let send_timeout = self.config.send_timeout;
        futures::stream::iter(targets)
            .for_each_concurrent(self.config.relay_concurrency.max(1), |conn| {
                let msg = msg.clone();
                let sent = &sent;
                async move {
                    match tokio::time::timeout(send_timeout, conn.tx.send(msg)).await {
                        Ok(Ok(())) => {
                            sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(_)) => trace!("Skipping closed session {}", conn.addr),
                        Err(_) => warn!("Slow peer {}, dropped flooded message", conn.addr),
                    }
                }
            })
            .await;
        sent.into_inner()
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    msg: &GossipMessage,
) -> std::result::Result<T, RejectReason> {
    msg.payload_as().map_err(|e| RejectReason::MalformedPayload {
        message_type: msg.message_type.to_string(),
        detail: e.to_string(),
    })
}

fn address_key(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| Error::network(format!("Failed to resolve {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| Error::network(format!("No address found for {}", addr)))
}
