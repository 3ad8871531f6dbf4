//! Peer-to-peer gossip
//!
//! Wire protocol, validation and framing, deduplication, peer reputation
//! and the TCP node that floods messages across the fleet.

pub mod codec;
pub mod dedup;
pub mod node;
pub mod peers;
pub mod protocol;

pub use codec::{
    deserialize_message, hash_message, prepare_for_relay, serialize_message, validate_message,
    GossipCodec, RejectReason, SignatureStatus,
};
pub use dedup::SeenCache;
pub use node::{GossipConfig, GossipEvent, GossipNode, GossipStatus};
pub use peers::{InMemoryPeerStore, PeerRecord, PeerStore};
pub use protocol::{
    GossipMessage, MessageType, MAX_HOPS, MAX_MESSAGE_SIZE, MESSAGE_TTL, PROTOCOL_VERSION,
};
