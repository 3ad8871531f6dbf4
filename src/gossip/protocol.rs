//! Gossip wire protocol definitions
//!
//! Envelope, message types, payload schemas and protocol constants. Field
//! names here are wire contracts shared with independent peer
//! implementations; rename nothing.

use crate::types::SolvedBlock;
use crate::utils::current_timestamp_millis;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol semver; peers must match exactly
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Default gossip TCP port
pub const DEFAULT_PORT: u16 = 4020;

/// Default message lifetime in seconds
pub const MESSAGE_TTL: i64 = 300;

/// Lifetime of keepalive messages in seconds
pub const KEEPALIVE_TTL: i64 = 30;

/// Maximum number of relays a message may undergo
pub const MAX_HOPS: i64 = 10;

/// Maximum encoded message size in bytes
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Token announcements and token state
pub const TOPIC_TOKENS: &str = "$402/tokens/v1";
/// Transfer events
pub const TOPIC_TRANSFERS: &str = "$402/transfers/v1";
/// Ticket stamps
pub const TOPIC_STAMPS: &str = "$402/stamps/v1";
/// Chat
pub const TOPIC_CHAT: &str = "$402/chat/v1";
/// Content requests and offers (including block announcements)
pub const TOPIC_CONTENT: &str = "$402/content/v1";

/// Every pub/sub topic
pub const TOPICS: [&str; 5] = [
    TOPIC_TOKENS,
    TOPIC_TRANSFERS,
    TOPIC_STAMPS,
    TOPIC_CHAT,
    TOPIC_CONTENT,
];

/// Content type marking a `CONTENT_OFFER` that carries a solved block
pub const BLOCK_CONTENT_TYPE: &str = "application/x-poi-block";

/// Gossip message type
///
/// Unknown wire strings deserialize into [`MessageType::Unrecognized`] so
/// that validation can reject them with a reason instead of failing the
/// whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Hello,
    HelloAck,
    PeerListRequest,
    PeerList,
    AnnounceToken,
    RequestToken,
    TokenData,
    TransferEvent,
    HolderUpdate,
    ContentRequest,
    ContentOffer,
    TicketStamp,
    ChatMessage,
    Ping,
    Pong,
    Unrecognized(String),
}

impl MessageType {
    /// Every recognized message type
    pub const ALL: [MessageType; 15] = [
        MessageType::Hello,
        MessageType::HelloAck,
        MessageType::PeerListRequest,
        MessageType::PeerList,
        MessageType::AnnounceToken,
        MessageType::RequestToken,
        MessageType::TokenData,
        MessageType::TransferEvent,
        MessageType::HolderUpdate,
        MessageType::ContentRequest,
        MessageType::ContentOffer,
        MessageType::TicketStamp,
        MessageType::ChatMessage,
        MessageType::Ping,
        MessageType::Pong,
    ];

    /// Wire string
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::HelloAck => "HELLO_ACK",
            MessageType::PeerListRequest => "PEER_LIST_REQUEST",
            MessageType::PeerList => "PEER_LIST",
            MessageType::AnnounceToken => "ANNOUNCE_TOKEN",
            MessageType::RequestToken => "REQUEST_TOKEN",
            MessageType::TokenData => "TOKEN_DATA",
            MessageType::TransferEvent => "TRANSFER_EVENT",
            MessageType::HolderUpdate => "HOLDER_UPDATE",
            MessageType::ContentRequest => "CONTENT_REQUEST",
            MessageType::ContentOffer => "CONTENT_OFFER",
            MessageType::TicketStamp => "TICKET_STAMP",
            MessageType::ChatMessage => "CHAT_MESSAGE",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Unrecognized(raw) => raw.as_str(),
        }
    }

    /// Whether this is one of the fifteen protocol types
    pub fn is_recognized(&self) -> bool {
        !matches!(self, MessageType::Unrecognized(_))
    }

    /// Default lifetime in seconds
    pub fn default_ttl(&self) -> i64 {
        match self {
            MessageType::Ping | MessageType::Pong => KEEPALIVE_TTL,
            _ => MESSAGE_TTL,
        }
    }

    /// Point-to-point types are answered but never flooded
    pub fn is_direct(&self) -> bool {
        matches!(
            self,
            MessageType::Hello
                | MessageType::HelloAck
                | MessageType::PeerListRequest
                | MessageType::PeerList
                | MessageType::Ping
                | MessageType::Pong
        )
    }

    /// Pub/sub topic for flooded types
    pub fn topic(&self) -> Option<&'static str> {
        match self {
            MessageType::AnnounceToken
            | MessageType::RequestToken
            | MessageType::TokenData
            | MessageType::HolderUpdate => Some(TOPIC_TOKENS),
            MessageType::TransferEvent => Some(TOPIC_TRANSFERS),
            MessageType::TicketStamp => Some(TOPIC_STAMPS),
            MessageType::ChatMessage => Some(TOPIC_CHAT),
            MessageType::ContentRequest | MessageType::ContentOffer => Some(TOPIC_CONTENT),
            _ => None,
        }
    }
}

impl From<String> for MessageType {
    fn from(raw: String) -> Self {
        MessageType::ALL
            .iter()
            .find(|t| t.as_str() == raw)
            .cloned()
            .unwrap_or(MessageType::Unrecognized(raw))
    }
}

impl Default for MessageType {
    fn default() -> Self {
        MessageType::Unrecognized(String::new())
    }
}

impl From<&str> for MessageType {
    fn from(raw: &str) -> Self {
        MessageType::from(raw.to_string())
    }
}

impl From<MessageType> for String {
    fn from(message_type: MessageType) -> Self {
        message_type.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire envelope
///
/// `timestamp`, `ttl` and `hops` are signed so that malformed negative
/// values from other implementations survive decoding and are rejected by
/// validation with a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipMessage {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub sender_id: String,
    /// Milliseconds since the Unix epoch, at creation
    #[serde(default)]
    pub timestamp: i64,
    /// Seconds
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub hops: i64,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Random 128-bit id, 32 lowercase hex chars
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl GossipMessage {
    /// Stamp a new message with id, version, timestamp, `hops = 0` and the
    /// type's default ttl
    pub fn new<P: Serialize>(message_type: MessageType, sender_id: &str, payload: &P) -> Result<Self> {
        Ok(Self {
            id: new_message_id(),
            ttl: message_type.default_ttl(),
            message_type,
            version: PROTOCOL_VERSION.to_string(),
            sender_id: sender_id.to_string(),
            timestamp: current_timestamp_millis() as i64,
            hops: 0,
            payload: Some(serde_json::to_value(payload)?),
            signature: None,
        })
    }

    /// Decode the payload into its typed schema
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .payload
            .clone()
            .ok_or_else(|| crate::Error::protocol(format!("{} message has no payload", self.message_type)))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Topic this message is published under, if flooded
    pub fn topic(&self) -> Option<&'static str> {
        self.message_type.topic()
    }

    pub fn hello(sender_id: &str, payload: &HelloPayload) -> Result<Self> {
        Self::new(MessageType::Hello, sender_id, payload)
    }

    pub fn hello_ack(sender_id: &str, payload: &HelloPayload) -> Result<Self> {
        Self::new(MessageType::HelloAck, sender_id, payload)
    }

    pub fn peer_list_request(sender_id: &str, limit: usize) -> Result<Self> {
        Self::new(
            MessageType::PeerListRequest,
            sender_id,
            &PeerListRequestPayload { limit },
        )
    }

    pub fn peer_list(sender_id: &str, peers: Vec<PeerInfo>) -> Result<Self> {
        Self::new(MessageType::PeerList, sender_id, &PeerListPayload { peers })
    }

    pub fn announce_token(sender_id: &str, payload: &AnnounceTokenPayload) -> Result<Self> {
        Self::new(MessageType::AnnounceToken, sender_id, payload)
    }

    pub fn request_token(sender_id: &str, token_id: &str) -> Result<Self> {
        Self::new(
            MessageType::RequestToken,
            sender_id,
            &RequestTokenPayload {
                token_id: token_id.to_string(),
            },
        )
    }

    pub fn token_data(sender_id: &str, payload: &TokenDataPayload) -> Result<Self> {
        Self::new(MessageType::TokenData, sender_id, payload)
    }

    pub fn transfer_event(sender_id: &str, payload: &TransferEventPayload) -> Result<Self> {
        Self::new(MessageType::TransferEvent, sender_id, payload)
    }

    pub fn holder_update(sender_id: &str, payload: &HolderUpdatePayload) -> Result<Self> {
        Self::new(MessageType::HolderUpdate, sender_id, payload)
    }

    pub fn content_request(sender_id: &str, payload: &ContentRequestPayload) -> Result<Self> {
        Self::new(MessageType::ContentRequest, sender_id, payload)
    }

    pub fn content_offer(sender_id: &str, payload: &ContentOfferPayload) -> Result<Self> {
        Self::new(MessageType::ContentOffer, sender_id, payload)
    }

    pub fn ticket_stamp(sender_id: &str, payload: &TicketStampPayload) -> Result<Self> {
        Self::new(MessageType::TicketStamp, sender_id, payload)
    }

    pub fn chat(sender_id: &str, payload: &ChatPayload) -> Result<Self> {
        Self::new(MessageType::ChatMessage, sender_id, payload)
    }

    /// Keepalive request with a random nonce
    pub fn ping(sender_id: &str) -> Result<Self> {
        Self::new(
            MessageType::Ping,
            sender_id,
            &PingPayload {
                timestamp: current_timestamp_millis() as i64,
                nonce: rand::random(),
            },
        )
    }

    /// Answer to `ping`, echoing its nonce and timestamp
    pub fn pong(sender_id: &str, ping: &PingPayload) -> Result<Self> {
        Self::new(
            MessageType::Pong,
            sender_id,
            &PongPayload {
                timestamp: current_timestamp_millis() as i64,
                nonce: ping.nonce,
                request_timestamp: ping.timestamp,
            },
        )
    }

    /// Announce a solved block as a `CONTENT_OFFER`
    pub fn block_announcement(sender_id: &str, token_id: &str, block: &SolvedBlock) -> Result<Self> {
        let encoded_size = serde_json::to_vec(block)?.len() as u64;
        Self::content_offer(
            sender_id,
            &ContentOfferPayload {
                token_id: token_id.to_string(),
                content_hash: block.hash.clone(),
                content_type: BLOCK_CONTENT_TYPE.to_string(),
                content_size: encoded_size,
                price_sats: 0,
                server_address: None,
                block: Some(block.clone()),
            },
        )
    }

    /// The solved block carried by a block announcement, if this is one
    pub fn as_block_announcement(&self) -> Option<SolvedBlock> {
        if self.message_type != MessageType::ContentOffer {
            return None;
        }
        let offer: ContentOfferPayload = self.payload_as().ok()?;
        if offer.content_type != BLOCK_CONTENT_TYPE {
            return None;
        }
        offer.block
    }
}

/// `HELLO` / `HELLO_ACK`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub node_id: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tokens_count: u64,
    #[serde(default)]
    pub listening_port: u16,
}

/// Peer entry exchanged in `PEER_LIST`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub host: String,
    pub port: u16,
    /// Milliseconds since the Unix epoch
    pub last_seen: i64,
    pub reputation: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListRequestPayload {
    #[serde(default)]
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListPayload {
    #[serde(default)]
    pub peers: Vec<PeerInfo>,
}

/// `ANNOUNCE_TOKEN`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceTokenPayload {
    pub token_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_handle: Option<String>,
    pub current_supply: u64,
    pub current_price_sats: u64,
    pub base_price_sats: u64,
    pub pricing_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_txid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTokenPayload {
    pub token_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenDataPayload {
    pub token_id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// `TRANSFER_EVENT`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEventPayload {
    pub token_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
    pub to_address: String,
    pub amount: u64,
    pub txid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderUpdatePayload {
    pub token_id: String,
    pub address: String,
    pub balance: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRequestPayload {
    pub token_id: String,
    pub content_hash: String,
}

/// `CONTENT_OFFER`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentOfferPayload {
    pub token_id: String,
    pub content_hash: String,
    pub content_type: String,
    pub content_size: u64,
    #[serde(default)]
    pub price_sats: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<SolvedBlock>,
}

/// `TICKET_STAMP`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketStampPayload {
    pub token_id: String,
    pub address: String,
    pub path: String,
    pub timestamp: i64,
    pub indexer_pubkey: String,
    pub indexer_signature: String,
}

/// `CHAT_MESSAGE`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    pub channel: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_handle: Option<String>,
    pub sender_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: i64,
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    pub timestamp: i64,
    pub nonce: u64,
    pub request_timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockHeader, Bits, GENESIS_PREV_HASH};

    #[test]
    fn test_message_type_wire_strings() {
        assert_eq!(MessageType::ALL.len(), 15);
        for t in MessageType::ALL.iter() {
            assert_eq!(&MessageType::from(t.as_str()), t);
            assert!(t.is_recognized());
        }
        assert_eq!(
            MessageType::from("BLOCK"),
            MessageType::Unrecognized("BLOCK".to_string())
        );
        assert_eq!(
            serde_json::to_string(&MessageType::PeerListRequest).unwrap(),
            "\"PEER_LIST_REQUEST\""
        );
    }

    #[test]
    fn test_factory_defaults() {
        let msg = GossipMessage::ping("node-a").unwrap();
        assert_eq!(msg.id.len(), 32);
        assert_eq!(msg.version, PROTOCOL_VERSION);
        assert_eq!(msg.hops, 0);
        assert_eq!(msg.ttl, KEEPALIVE_TTL);
        assert!(msg.timestamp > 0);

        let chat = GossipMessage::chat(
            "node-a",
            &ChatPayload {
                token_id: None,
                channel: "general".into(),
                content: "hi".into(),
                sender_handle: None,
                sender_address: "1Addr".into(),
                signature: None,
                timestamp: 1,
            },
        )
        .unwrap();
        assert_eq!(chat.ttl, MESSAGE_TTL);
        assert_eq!(chat.topic(), Some(TOPIC_CHAT));
        assert_ne!(chat.id, msg.id);
    }

    #[test]
    fn test_envelope_field_names() {
        let msg = GossipMessage::request_token("node-a", "$402/x").unwrap();
        let value = serde_json::to_value(&msg).unwrap();
        for field in ["id", "type", "version", "sender_id", "timestamp", "ttl", "hops", "payload"] {
            assert!(value.get(field).is_some(), "missing {}", field);
        }
        assert!(value.get("signature").is_none());
        assert_eq!(value["type"], "REQUEST_TOKEN");
        assert_eq!(value["payload"]["token_id"], "$402/x");
    }

    #[test]
    fn test_topics_and_direct_types() {
        assert_eq!(MessageType::HolderUpdate.topic(), Some(TOPIC_TOKENS));
        assert_eq!(MessageType::TransferEvent.topic(), Some(TOPIC_TRANSFERS));
        assert_eq!(MessageType::TicketStamp.topic(), Some(TOPIC_STAMPS));
        assert_eq!(MessageType::ContentOffer.topic(), Some(TOPIC_CONTENT));
        for t in MessageType::ALL.iter() {
            assert_eq!(t.is_direct(), t.topic().is_none());
        }
    }

    #[test]
    fn test_block_announcement_roundtrip() {
        let block = SolvedBlock {
            header: BlockHeader {
                version: 1,
                prev_hash: GENESIS_PREV_HASH.to_string(),
                merkle_root: "cd".repeat(32),
                timestamp: 1_700_000_000_000,
                bits: Bits::LeadingZeros(2),
                nonce: 99,
                miner_address: "1Miner".into(),
            },
            hash: format!("00{}", "e".repeat(62)),
        };
        let msg = GossipMessage::block_announcement("node-a", "$402/t", &block).unwrap();
        assert_eq!(msg.message_type, MessageType::ContentOffer);
        assert_eq!(msg.as_block_announcement(), Some(block));

        let plain = GossipMessage::content_request(
            "node-a",
            &ContentRequestPayload {
                token_id: "$402/t".into(),
                content_hash: "ab".into(),
            },
        )
        .unwrap();
        assert!(plain.as_block_announcement().is_none());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let payload = TransferEventPayload {
            token_id: "$402/t".into(),
            from_address: None,
            to_address: "1To".into(),
            amount: 5,
            txid: "ff".repeat(32),
            block_height: None,
            block_time: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("from_address").is_none());
        assert!(value.get("block_height").is_none());
        assert_eq!(value["amount"], 5);
    }
}
