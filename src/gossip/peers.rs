//! Peer bookkeeping
//!
//! [`PeerStore`] is the boundary to whatever persists peers (an embedded
//! database in a full deployment). The gossip node reads and adjusts
//! reputation through it on every validation outcome.

use super::protocol::PeerInfo;
use crate::utils::current_timestamp_millis;
use dashmap::DashMap;
use serde::Serialize;

/// Reputation assigned to a newly seen peer
pub const INITIAL_REPUTATION: i32 = 50;
/// Reputation ceiling
pub const MAX_REPUTATION: i32 = 100;
/// Gain per valid message
pub const VALID_MESSAGE_REWARD: i32 = 1;
/// Loss per invalid message
pub const INVALID_MESSAGE_PENALTY: i32 = 10;

/// Everything known about one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerRecord {
    pub peer_id: String,
    pub host: String,
    /// Gossip listening port announced in `HELLO`
    pub port: u16,
    pub last_seen: i64,
    pub reputation: i32,
    pub valid_messages: u64,
    pub invalid_messages: u64,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id: peer_id.into(),
            host: host.into(),
            port,
            last_seen: current_timestamp_millis() as i64,
            reputation: INITIAL_REPUTATION,
            valid_messages: 0,
            invalid_messages: 0,
        }
    }

    /// Wire form exchanged in `PEER_LIST`
    pub fn to_peer_info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            host: self.host.clone(),
            port: self.port,
            last_seen: self.last_seen,
            reputation: self.reputation,
        }
    }

    /// Whether the peer should be disconnected
    pub fn is_banned(&self) -> bool {
        self.reputation <= 0
    }
}

/// Storage boundary for peers and their reputation
pub trait PeerStore: Send + Sync {
    /// Insert or refresh a peer, keeping its reputation and counters
    fn upsert(&self, peer_id: &str, host: &str, port: u16);

    fn get(&self, peer_id: &str) -> Option<PeerRecord>;

    /// Peers by descending reputation
    fn list(&self, limit: usize) -> Vec<PeerRecord>;

    /// Count a valid message, returning the new reputation
    fn record_valid(&self, peer_id: &str) -> i32;

    /// Count an invalid message, returning the new reputation
    fn record_invalid(&self, peer_id: &str) -> i32;

    fn remove(&self, peer_id: &str);

    /// Whether `peer_id` (a node id or address key) has exhausted its reputation
    fn is_banned(&self, peer_id: &str) -> bool {
        self.get(peer_id).is_some_and(|record| record.is_banned())
    }

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local [`PeerStore`]
#[derive(Debug, Default)]
pub struct InMemoryPeerStore {
    peers: DashMap<String, PeerRecord>,
}

impl InMemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn adjust(&self, peer_id: &str, valid: bool) -> i32 {
        let mut entry = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerRecord::new(peer_id, "", 0));
        let record = entry.value_mut();
        record.last_seen = current_timestamp_millis() as i64;
        if valid {
            record.valid_messages += 1;
            record.reputation = (record.reputation + VALID_MESSAGE_REWARD).min(MAX_REPUTATION);
        } else {
            record.invalid_messages += 1;
            record.reputation = (record.reputation - INVALID_MESSAGE_PENALTY).max(0);
        }
        record.reputation
    }
}

impl PeerStore for InMemoryPeerStore {
    fn upsert(&self, peer_id: &str, host: &str, port: u16) {
        self.peers
            .entry(peer_id.to_string())
            .and_modify(|record| {
                record.host = host.to_string();
                record.port = port;
                record.last_seen = current_timestamp_millis() as i64;
            })
            .or_insert_with(|| PeerRecord::new(peer_id, host, port));
    }

    fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.get(peer_id).map(|r| r.value().clone())
    }

    fn list(&self, limit: usize) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.iter().map(|r| r.value().clone()).collect();
        peers.sort_by(|a, b| b.reputation.cmp(&a.reputation).then(a.peer_id.cmp(&b.peer_id)));
        peers.truncate(limit);
        peers
    }

    fn record_valid(&self, peer_id: &str) -> i32 {
        self.adjust(peer_id, true)
    }

    fn record_invalid(&self, peer_id: &str) -> i32 {
        self.adjust(peer_id, false)
    }

    fn remove(&self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    fn len(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reputation_bounds() {
        let store = InMemoryPeerStore::new();
        store.upsert("peer-a", "10.0.0.1", 4020);

        for _ in 0..100 {
            store.record_valid("peer-a");
        }
        assert_eq!(store.get("peer-a").unwrap().reputation, MAX_REPUTATION);

        for _ in 0..20 {
            store.record_invalid("peer-a");
        }
        let record = store.get("peer-a").unwrap();
        assert_eq!(record.reputation, 0);
        assert!(record.is_banned());
        assert_eq!(record.invalid_messages, 20);
    }

    #[test]
    fn test_is_banned_only_for_exhausted_peers() {
        let store = InMemoryPeerStore::new();
        assert!(!store.is_banned("unknown"));

        store.upsert("peer-a", "10.0.0.1", 4020);
        for _ in 0..4 {
            store.record_invalid("peer-a");
        }
        assert!(!store.is_banned("peer-a"));
        store.record_invalid("peer-a");
        assert!(store.is_banned("peer-a"));
    }

    #[test]
    fn test_upsert_keeps_reputation() {
        let store = InMemoryPeerStore::new();
        store.upsert("peer-a", "10.0.0.1", 4020);
        assert_eq!(store.record_invalid("peer-a"), INITIAL_REPUTATION - INVALID_MESSAGE_PENALTY);

        store.upsert("peer-a", "10.0.0.2", 4021);
        let record = store.get("peer-a").unwrap();
        assert_eq!(record.host, "10.0.0.2");
        assert_eq!(record.port, 4021);
        assert_eq!(record.reputation, INITIAL_REPUTATION - INVALID_MESSAGE_PENALTY);
    }

    #[test]
    fn test_list_orders_by_reputation() {
        let store = InMemoryPeerStore::new();
        store.upsert("low", "h", 1);
        store.upsert("high", "h", 2);
        store.record_invalid("low");
        store.record_valid("high");

        let peers = store.list(10);
        assert_eq!(peers[0].peer_id, "high");
        assert_eq!(store.list(1).len(), 1);

        let info = peers[0].to_peer_info();
        assert_eq!(info.port, 2);
        assert_eq!(info.reputation, INITIAL_REPUTATION + VALID_MESSAGE_REWARD);
    }
}
