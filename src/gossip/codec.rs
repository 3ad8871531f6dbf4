//! Gossip message validation, fingerprinting and framing
//!
//! Validation never mutates a message and never produces an [`Error`]: a bad
//! message yields a [`RejectReason`] and is dropped by the caller. Size
//! limits are enforced on both encode and decode, and decode checks the
//! length before parsing anything.

use super::protocol::{GossipMessage, MAX_HOPS, MAX_MESSAGE_SIZE};
use crate::crypto::{self, NodeIdentity};
use crate::utils::current_timestamp_millis;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use thiserror::Error as ThisError;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Hex length of a message fingerprint (128 bits)
pub const FINGERPRINT_LEN: usize = 32;

/// Why a message was rejected
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum RejectReason {
    #[error("missing id")]
    MissingId,
    #[error("unrecognized message type: {0:?}")]
    UnrecognizedType(String),
    #[error("missing version")]
    MissingVersion,
    #[error("missing sender_id")]
    MissingSenderId,
    #[error("zero timestamp")]
    ZeroTimestamp,
    #[error("negative ttl: {0}")]
    NegativeTtl(i64),
    #[error("negative hops: {0}")]
    NegativeHops(i64),
    #[error("missing payload")]
    MissingPayload,
    #[error("message expired: age {age_secs}s exceeds ttl {ttl}s")]
    Expired { age_secs: i64, ttl: i64 },
    #[error("timestamp {ahead_secs}s in the future exceeds ttl {ttl}s")]
    FutureTimestamp { ahead_secs: i64, ttl: i64 },
    #[error("hop limit exceeded: {hops} > {max}")]
    TooManyHops { hops: i64, max: i64 },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("malformed {message_type} payload: {detail}")]
    MalformedPayload { message_type: String, detail: String },
    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),
    #[error("peer {0} is banned")]
    BannedPeer(String),
}

/// Validate a message against the current clock
pub fn validate_message(msg: &GossipMessage) -> std::result::Result<(), RejectReason> {
    validate_message_at(msg, current_timestamp_millis() as i64)
}

/// Validate a message as of `now_ms`
pub fn validate_message_at(msg: &GossipMessage, now_ms: i64) -> std::result::Result<(), RejectReason> {
    if msg.id.is_empty() {
        return Err(RejectReason::MissingId);
    }
    if !msg.message_type.is_recognized() {
        return Err(RejectReason::UnrecognizedType(msg.message_type.to_string()));
    }
    if msg.version.is_empty() {
        return Err(RejectReason::MissingVersion);
    }
    if msg.sender_id.is_empty() {
        return Err(RejectReason::MissingSenderId);
    }
    if msg.timestamp == 0 {
        return Err(RejectReason::ZeroTimestamp);
    }
    if msg.ttl < 0 {
        return Err(RejectReason::NegativeTtl(msg.ttl));
    }
    if msg.hops < 0 {
        return Err(RejectReason::NegativeHops(msg.hops));
    }
    if msg.payload.as_ref().map_or(true, |p| p.is_null()) {
        return Err(RejectReason::MissingPayload);
    }
    let age = age_secs(msg, now_ms);
    if age > msg.ttl {
        return Err(RejectReason::Expired {
            age_secs: age,
            ttl: msg.ttl,
        });
    }
    if age.saturating_neg() > msg.ttl {
        return Err(RejectReason::FutureTimestamp {
            ahead_secs: age.saturating_neg(),
            ttl: msg.ttl,
        });
    }
    if msg.hops > MAX_HOPS {
        return Err(RejectReason::TooManyHops {
            hops: msg.hops,
            max: MAX_HOPS,
        });
    }
    Ok(())
}

/// Whole seconds since `timestamp`, negative for stamps ahead of `now_ms`
fn age_secs(msg: &GossipMessage, now_ms: i64) -> i64 {
    now_ms.saturating_sub(msg.timestamp) / 1000
}

/// Age outside `[-ttl, ttl]` whole seconds
///
/// Stamps that far ahead of the local clock count as expired too, so a
/// peer cannot mint a message that circulates forever.
pub fn is_expired_at(msg: &GossipMessage, now_ms: i64) -> bool {
    age_secs(msg, now_ms).unsigned_abs() > msg.ttl.max(0) as u64
}

/// Dedup fingerprint over `{type, sender_id, payload}`
///
/// `id`, `timestamp`, `hops` and `signature` are excluded so every relayed
/// copy of one logical message fingerprints identically. The JSON is built
/// with a fixed key order; payload objects serialize with sorted keys.
pub fn hash_message(msg: &GossipMessage) -> String {
    let null = serde_json::Value::Null;
    let payload = msg.payload.as_ref().unwrap_or(&null);
    let canonical = format!(
        "{{\"type\":{},\"sender_id\":{},\"payload\":{}}}",
        serde_json::Value::from(msg.message_type.as_str()),
        serde_json::Value::from(msg.sender_id.as_str()),
        payload
    );
    let mut digest = crypto::sha256_hex(canonical.as_bytes());
    digest.truncate(FINGERPRINT_LEN);
    digest
}

/// Derive the copy forwarded to peers
///
/// `None` once the hop budget or ttl is spent; otherwise a new message with
/// `hops + 1`.
pub fn prepare_for_relay(msg: &GossipMessage) -> Option<GossipMessage> {
    prepare_for_relay_at(msg, current_timestamp_millis() as i64)
}

/// [`prepare_for_relay`] as of `now_ms`
pub fn prepare_for_relay_at(msg: &GossipMessage, now_ms: i64) -> Option<GossipMessage> {
    if msg.hops >= MAX_HOPS || is_expired_at(msg, now_ms) {
        return None;
    }
    let mut relayed = msg.clone();
    relayed.hops += 1;
    Some(relayed)
}

/// Encode to JSON, refusing anything over [`MAX_MESSAGE_SIZE`]
pub fn serialize_message(msg: &GossipMessage) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(msg)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge {
            size: bytes.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    Ok(bytes)
}

/// Decode JSON, rejecting oversized input before parsing
pub fn deserialize_message(bytes: &[u8]) -> Result<GossipMessage> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge {
            size: bytes.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    serde_json::from_slice(bytes)
        .map_err(|e| Error::protocol(format!("Malformed gossip message: {}", e)))
}

/// Sign the fingerprint of `msg` with the node identity
pub fn sign_message(msg: &mut GossipMessage, identity: &NodeIdentity) {
    let fingerprint = hash_message(msg);
    msg.signature = Some(identity.sign(fingerprint.as_bytes()));
}

/// Outcome of checking a message signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureStatus {
    /// No signature attached
    Unsigned,
    /// Signed, but `sender_id` is not a public key
    Unverifiable,
    Valid,
    Invalid,
}

/// Check the signature of `msg` against its `sender_id`
pub fn verify_message_signature(msg: &GossipMessage) -> SignatureStatus {
    let Some(signature) = msg.signature.as_deref() else {
        return SignatureStatus::Unsigned;
    };
    if !crypto::is_verifiable_node_id(&msg.sender_id) {
        return SignatureStatus::Unverifiable;
    }
    let fingerprint = hash_message(msg);
    match crypto::verify_signature(&msg.sender_id, fingerprint.as_bytes(), signature) {
        Ok(()) => SignatureStatus::Valid,
        Err(_) => SignatureStatus::Invalid,
    }
}

/// Length-prefixed JSON frames for a TCP stream
#[derive(Debug)]
pub struct GossipCodec {
    frames: LengthDelimitedCodec,
}

impl GossipCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_MESSAGE_SIZE)
                .new_codec(),
        }
    }
}

impl Default for GossipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for GossipCodec {
    type Item = GossipMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<GossipMessage>> {
        match self.frames.decode(src)? {
            Some(frame) => deserialize_message(&frame).map(Some),
            None => Ok(None),
        }
    }
}

impl Encoder<GossipMessage> for GossipCodec {
    type Error = Error;

    fn encode(&mut self, msg: GossipMessage, dst: &mut BytesMut) -> Result<()> {
        let bytes = serialize_message(&msg)?;
        self.frames.encode(Bytes::from(bytes), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::protocol::{
        ChatPayload, MessageType, MESSAGE_TTL, PROTOCOL_VERSION,
    };
    use assert_matches::assert_matches;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn message() -> GossipMessage {
        GossipMessage {
            id: "0123456789abcdef0123456789abcdef".into(),
            message_type: MessageType::ChatMessage,
            version: PROTOCOL_VERSION.into(),
            sender_id: "node-a".into(),
            timestamp: NOW,
            ttl: MESSAGE_TTL,
            hops: 0,
            payload: Some(json!({"channel": "general", "content": "hi"})),
            signature: None,
        }
    }

    #[test]
    fn test_valid_message() {
        assert_eq!(validate_message_at(&message(), NOW + 1_000), Ok(()));
    }

    fn rejected(mutate: impl FnOnce(&mut GossipMessage)) -> std::result::Result<(), RejectReason> {
        let mut msg = message();
        mutate(&mut msg);
        validate_message_at(&msg, NOW)
    }

    #[test]
    fn test_reject_reasons() {
        assert_eq!(rejected(|m| m.id.clear()), Err(RejectReason::MissingId));
        assert_eq!(
            rejected(|m| m.message_type = MessageType::from("BLOCK")),
            Err(RejectReason::UnrecognizedType("BLOCK".into()))
        );
        assert_eq!(rejected(|m| m.version.clear()), Err(RejectReason::MissingVersion));
        assert_eq!(rejected(|m| m.sender_id.clear()), Err(RejectReason::MissingSenderId));
        assert_eq!(rejected(|m| m.timestamp = 0), Err(RejectReason::ZeroTimestamp));
        assert_eq!(rejected(|m| m.ttl = -1), Err(RejectReason::NegativeTtl(-1)));
        assert_eq!(rejected(|m| m.hops = -2), Err(RejectReason::NegativeHops(-2)));
        assert_eq!(rejected(|m| m.payload = None), Err(RejectReason::MissingPayload));
        assert_eq!(
            rejected(|m| m.hops = MAX_HOPS + 1),
            Err(RejectReason::TooManyHops {
                hops: MAX_HOPS + 1,
                max: MAX_HOPS,
            })
        );
        assert_eq!(rejected(|m| m.hops = MAX_HOPS), Ok(()));
    }

    #[test]
    fn test_expiry_uses_whole_seconds() {
        let msg = message();
        // 300.999s old: integer age 300 is not > 300
        assert_eq!(validate_message_at(&msg, NOW + 300_999), Ok(()));
        assert_matches!(
            validate_message_at(&msg, NOW + 301_000),
            Err(RejectReason::Expired { age_secs: 301, ttl: 300 })
        );
    }

    #[test]
    fn test_extreme_timestamps_are_rejected() {
        let mut ancient = message();
        ancient.timestamp = i64::MIN;
        assert_matches!(
            validate_message_at(&ancient, NOW),
            Err(RejectReason::Expired { ttl: 300, .. })
        );
        assert!(is_expired_at(&ancient, NOW));
        assert_eq!(prepare_for_relay_at(&ancient, NOW), None);

        let mut future = message();
        future.timestamp = i64::MAX;
        assert_matches!(
            validate_message_at(&future, NOW),
            Err(RejectReason::FutureTimestamp { ttl: 300, .. })
        );
        assert!(is_expired_at(&future, NOW));
        assert_eq!(prepare_for_relay_at(&future, NOW), None);
    }

    #[test]
    fn test_small_clock_skew_is_tolerated() {
        let mut msg = message();
        msg.timestamp = NOW + 300_999;
        assert_eq!(validate_message_at(&msg, NOW), Ok(()));

        msg.timestamp = NOW + 301_000;
        assert_eq!(
            validate_message_at(&msg, NOW),
            Err(RejectReason::FutureTimestamp {
                ahead_secs: 301,
                ttl: 300,
            })
        );
    }

    #[test]
    fn test_validation_does_not_mutate() {
        let msg = message();
        let before = msg.clone();
        let _ = validate_message_at(&msg, NOW);
        assert_eq!(msg, before);
    }

    #[test]
    fn test_hash_ignores_relay_artifacts() {
        let a = message();
        let mut b = message();
        b.id = "ffffffffffffffffffffffffffffffff".into();
        b.hops = 7;
        b.timestamp = NOW + 5_000;
        b.signature = Some("00".into());
        assert_eq!(hash_message(&a), hash_message(&b));
        assert_eq!(hash_message(&a).len(), FINGERPRINT_LEN);

        let mut c = message();
        c.sender_id = "node-b".into();
        assert_ne!(hash_message(&a), hash_message(&c));
    }

    #[test]
    fn test_prepare_for_relay() {
        let msg = message();
        let relayed = prepare_for_relay_at(&msg, NOW).unwrap();
        assert_eq!(relayed.hops, 1);
        assert_eq!(msg.hops, 0);
        assert_eq!(relayed.id, msg.id);

        let mut exhausted = message();
        exhausted.hops = MAX_HOPS;
        assert!(prepare_for_relay_at(&exhausted, NOW).is_none());

        assert!(prepare_for_relay_at(&msg, NOW + 400_000).is_none());
    }

    #[test]
    fn test_size_limit_both_directions() {
        let mut big = message();
        big.payload = Some(json!({"content": "x".repeat(MAX_MESSAGE_SIZE)}));
        assert_matches!(serialize_message(&big), Err(Error::MessageTooLarge { .. }));

        let oversized = vec![b'{'; MAX_MESSAGE_SIZE + 1];
        assert_matches!(
            deserialize_message(&oversized),
            Err(Error::MessageTooLarge { size, .. }) if size == MAX_MESSAGE_SIZE + 1
        );
        assert_matches!(deserialize_message(b"not json"), Err(Error::Protocol { .. }));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let msg = GossipMessage::chat(
            "node-a",
            &ChatPayload {
                token_id: Some("$402/t".into()),
                channel: "general".into(),
                content: "hello".into(),
                sender_handle: None,
                sender_address: "1Addr".into(),
                signature: None,
                timestamp: NOW,
            },
        )
        .unwrap();
        let decoded = deserialize_message(&serialize_message(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_signatures() {
        let identity = NodeIdentity::generate();
        let mut msg = message();
        msg.sender_id = identity.node_id();
        assert_eq!(verify_message_signature(&msg), SignatureStatus::Unsigned);

        sign_message(&mut msg, &identity);
        assert_eq!(verify_message_signature(&msg), SignatureStatus::Valid);

        // relaying does not invalidate the signature
        let relayed = prepare_for_relay_at(&msg, NOW).unwrap();
        assert_eq!(verify_message_signature(&relayed), SignatureStatus::Valid);

        let mut tampered = msg.clone();
        tampered.payload = Some(json!({"content": "forged"}));
        assert_eq!(verify_message_signature(&tampered), SignatureStatus::Invalid);

        let mut anonymous = msg;
        anonymous.sender_id = "node-a".into();
        assert_eq!(verify_message_signature(&anonymous), SignatureStatus::Unverifiable);
    }

    #[test]
    fn test_codec_frames() {
        let mut codec = GossipCodec::new();
        let msg = message();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        codec.encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg.clone()));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
