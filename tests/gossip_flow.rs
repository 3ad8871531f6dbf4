//! Gossip between live nodes over loopback TCP

use futures::{SinkExt, StreamExt};
use poi_node::crypto::NodeIdentity;
use poi_node::gossip::codec::sign_message;
use poi_node::gossip::peers::PeerStore;
use poi_node::gossip::protocol::{ChatPayload, HelloPayload, TOPIC_CHAT, TOPIC_CONTENT};
use poi_node::gossip::{
    GossipCodec, GossipConfig, GossipEvent, GossipMessage, GossipNode, InMemoryPeerStore,
    PROTOCOL_VERSION,
};
use poi_node::pow::mine_block;
use poi_node::{BlockHeader, Bits, GENESIS_PREV_HASH, HEADER_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

fn loopback_node() -> GossipNode {
    loopback_node_with_store(Arc::new(InMemoryPeerStore::new()))
}

fn loopback_node_with_store(store: Arc<InMemoryPeerStore>) -> GossipNode {
    let config = GossipConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        keepalive_interval: Duration::from_secs(60),
        ..GossipConfig::default()
    };
    GossipNode::new(config, NodeIdentity::generate(), store)
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn next_event(rx: &mut broadcast::Receiver<GossipEvent>) -> GossipEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no gossip event within 5s")
        .unwrap()
}

fn chat(sender_id: &str, content: &str) -> GossipMessage {
    GossipMessage::chat(
        sender_id,
        &ChatPayload {
            token_id: None,
            channel: "general".to_string(),
            content: content.to_string(),
            sender_handle: None,
            sender_address: "1Sender".to_string(),
            signature: None,
            timestamp: 1_700_000_000_000,
        },
    )
    .unwrap()
}

/// Speaks the wire protocol directly, without a listener of its own
struct RawPeer {
    framed: Framed<TcpStream, GossipCodec>,
}

impl RawPeer {
    async fn connect(addr: SocketAddr) -> Self {
        Self::connect_as(addr, "raw-peer").await
    }

    /// Open a session without sending `HELLO`
    async fn unannounced(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, GossipCodec::new()),
        }
    }

    async fn connect_as(addr: SocketAddr, node_id: &str) -> Self {
        let mut peer = Self::unannounced(addr).await;
        let hello = GossipMessage::hello(
            node_id,
            &HelloPayload {
                node_id: node_id.to_string(),
                version: PROTOCOL_VERSION.to_string(),
                capabilities: vec![],
                tokens_count: 0,
                listening_port: 0,
            },
        )
        .unwrap();
        peer.send(hello).await;
        peer
    }

    async fn send(&mut self, msg: GossipMessage) {
        self.framed.send(msg).await.unwrap();
    }

    /// True once the node has closed the session without answering
    async fn closed_by_node(&mut self) -> bool {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("node neither answered nor closed the session");
        !matches!(frame, Some(Ok(_)))
    }
}

fn forged_chat(author: &NodeIdentity) -> GossipMessage {
    let mut msg = chat(&author.node_id(), "original");
    sign_message(&mut msg, author);
    msg.payload = Some(serde_json::json!({
        "channel": "general",
        "content": "tampered",
        "sender_address": "1Sender",
        "timestamp": 1_700_000_000_000i64,
    }));
    msg
}

#[tokio::test]
async fn test_two_nodes_handshake() {
    let a = loopback_node();
    let b = loopback_node();
    a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();

    a.connect(&b_addr.to_string()).await.unwrap();

    wait_until("handshake", || {
        a.peer_ids() == vec![b.node_id().to_string()]
            && b.peer_ids() == vec![a.node_id().to_string()]
    })
    .await;
    assert_eq!(a.status().connected_peers, 1);
    assert_eq!(b.status().known_peers, 1);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_block_announcement_reaches_peer() {
    let a = loopback_node();
    let b = loopback_node();
    a.start().await.unwrap();
    let b_addr = b.start().await.unwrap();
    let mut events = b.subscribe();

    a.connect(&b_addr.to_string()).await.unwrap();
    wait_until("handshake", || a.peer_ids().len() == 1).await;

    let header = BlockHeader {
        version: HEADER_VERSION,
        prev_hash: GENESIS_PREV_HASH.to_string(),
        merkle_root: "ab".repeat(32),
        timestamp: 1_700_000_000_000,
        bits: Bits::LeadingZeros(1),
        nonce: 0,
        miner_address: "1Miner".to_string(),
    };
    let block = mine_block(header, 100_000, 1_000, &CancellationToken::new()).unwrap();

    let announcement =
        GossipMessage::block_announcement(a.node_id(), "$402/tokens/test", &block).unwrap();
    assert_eq!(a.publish(announcement).await, 1);

    let event = next_event(&mut events).await;
    assert_eq!(event.topic, TOPIC_CONTENT);
    assert_eq!(event.message.sender_id, a.node_id());
    assert_eq!(event.message.hops, 0);
    assert_eq!(event.message.as_block_announcement(), Some(block));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_relay_increments_hops_and_drops_duplicates() {
    let b = loopback_node();
    let c = loopback_node();
    let b_addr = b.start().await.unwrap();
    c.start().await.unwrap();
    let mut b_events = b.subscribe();
    let mut c_events = c.subscribe();

    c.connect(&b_addr.to_string()).await.unwrap();
    wait_until("handshake", || c.peer_ids().len() == 1).await;

    let mut raw = RawPeer::connect(b_addr).await;
    raw.send(chat("raw-peer", "gm")).await;

    let at_b = next_event(&mut b_events).await;
    assert_eq!(at_b.topic, TOPIC_CHAT);
    assert_eq!(at_b.message.hops, 0);

    let at_c = next_event(&mut c_events).await;
    assert_eq!(at_c.topic, TOPIC_CHAT);
    assert_eq!(at_c.message.hops, 1);
    wait_until("relay counter", || b.status().messages_relayed == 1).await;

    // Same logical message under a fresh id.
    raw.send(chat("raw-peer", "gm")).await;
    wait_until("duplicate drop", || b.status().duplicates_dropped == 1).await;
    assert_eq!(b.status().messages_relayed, 1);

    b.shutdown();
    c.shutdown();
}

#[tokio::test]
async fn test_tampered_signature_is_rejected() {
    let b = loopback_node();
    let b_addr = b.start().await.unwrap();
    let mut events = b.subscribe();

    let author = NodeIdentity::generate();
    let mut raw = RawPeer::connect(b_addr).await;
    raw.send(forged_chat(&author)).await;
    wait_until("rejection", || b.status().messages_rejected == 1).await;

    // A well-formed message on the same session still goes through.
    let mut honest = chat(&author.node_id(), "hello");
    sign_message(&mut honest, &author);
    raw.send(honest).await;
    let event = next_event(&mut events).await;
    assert_eq!(
        event.message.payload_as::<ChatPayload>().unwrap().content,
        "hello"
    );

    b.shutdown();
}

#[tokio::test]
async fn test_banned_node_id_cannot_rejoin() {
    let store = Arc::new(InMemoryPeerStore::new());
    for _ in 0..5 {
        store.record_invalid("banned-peer");
    }
    let b = loopback_node_with_store(Arc::clone(&store));
    let b_addr = b.start().await.unwrap();

    let mut raw = RawPeer::connect_as(b_addr, "banned-peer").await;
    assert!(raw.closed_by_node().await);
    wait_until("ban rejection", || b.status().messages_rejected == 1).await;
    assert!(b.peer_ids().is_empty());

    b.shutdown();
}

#[tokio::test]
async fn test_exhausted_address_is_refused_on_new_port() {
    let b = loopback_node();
    let b_addr = b.start().await.unwrap();
    let author = NodeIdentity::generate();

    // Five invalid frames before any handshake take 127.0.0.1 from 50 to 0.
    let mut first = RawPeer::unannounced(b_addr).await;
    for _ in 0..5 {
        first.send(forged_chat(&author)).await;
    }
    assert!(first.closed_by_node().await);
    wait_until("disconnect", || b.status().connected_peers == 0).await;
    assert_eq!(b.status().messages_rejected, 5);

    // Reconnecting from a fresh ephemeral port does not reset the score.
    let mut second = RawPeer::unannounced(b_addr).await;
    assert!(second.closed_by_node().await);
    assert_eq!(b.status().messages_rejected, 5);
    assert_eq!(b.status().connected_peers, 0);

    b.shutdown();
}
