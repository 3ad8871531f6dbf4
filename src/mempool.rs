//! Work mempool and block template builder
//!
//! The mempool is a capacity-bounded, insertion-ordered set of work items
//! keyed by id. Templates commit to their items through a sorted-join
//! commitment: ids are sorted, joined with `|` and hashed once with SHA-256.
//! This is not a binary merkle tree; peers only agree if they sort first.

use crate::crypto::sha256_hex;
use crate::types::{BlockHeader, Bits, WorkItem, HEADER_VERSION};
use crate::utils::current_timestamp_millis;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, trace};

/// Delimiter between sorted ids in the commitment
pub const MERKLE_DELIMITER: &str = "|";

/// String hashed in place of an empty id list
pub const EMPTY_MERKLE_SENTINEL: &str = "empty";

/// Default mempool capacity
pub const DEFAULT_MEMPOOL_CAPACITY: usize = 10_000;

#[derive(Debug, Default)]
struct MempoolInner {
    items: VecDeque<WorkItem>,
    ids: HashSet<String>,
}

/// Deduplicated pool of pending work items
#[derive(Debug)]
pub struct Mempool {
    inner: RwLock<MempoolInner>,
    capacity: usize,
}

impl Mempool {
    /// Create a mempool holding at most `capacity` items
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(MempoolInner::default()),
            capacity,
        }
    }

    /// Insert an item
    ///
    /// Returns `Ok(false)` when the id is already present (no-op) and an
    /// error when the pool is full.
    pub fn add(&self, item: WorkItem) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.ids.contains(&item.id) {
            trace!(id = %item.id, "Ignoring duplicate work item");
            return Ok(false);
        }
        if inner.items.len() >= self.capacity {
            return Err(Error::mempool(format!(
                "Mempool full ({} items), rejecting {}",
                self.capacity, item.id
            )));
        }
        debug!(id = %item.id, item_type = %item.item_type, "Added work item");
        inner.ids.insert(item.id.clone());
        inner.items.push_back(item);
        Ok(true)
    }

    /// Up to `count` items in insertion order
    ///
    /// The result is a consistent snapshot taken under one lock.
    pub fn get_items(&self, count: usize) -> Vec<WorkItem> {
        self.inner.read().items.iter().take(count).cloned().collect()
    }

    /// Evict items by id, returning how many were removed
    pub fn remove_items<S: AsRef<str>>(&self, ids: &[S]) -> usize {
        let doomed: HashSet<&str> = ids.iter().map(|id| id.as_ref()).collect();
        let mut inner = self.inner.write();
        let before = inner.items.len();
        inner.items.retain(|item| !doomed.contains(item.id.as_str()));
        for id in &doomed {
            inner.ids.remove(*id);
        }
        let removed = before - inner.items.len();
        if removed > 0 {
            debug!(removed = removed, remaining = inner.items.len(), "Evicted work items");
        }
        removed
    }

    /// Whether an id is pending
    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().ids.contains(id)
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of pending items
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(DEFAULT_MEMPOOL_CAPACITY)
    }
}

/// Sorted-join commitment over a set of ids
pub fn merkle_root_of_ids<S: AsRef<str>>(ids: &[S]) -> String {
    if ids.is_empty() {
        return sha256_hex(EMPTY_MERKLE_SENTINEL.as_bytes());
    }
    let mut sorted: Vec<&str> = ids.iter().map(|id| id.as_ref()).collect();
    sorted.sort_unstable();
    sha256_hex(sorted.join(MERKLE_DELIMITER).as_bytes())
}

/// Commitment over the ids of `items`
pub fn calculate_merkle_root(items: &[WorkItem]) -> String {
    let ids: Vec<&str> = items.iter().map(|item| item.id.as_str()).collect();
    merkle_root_of_ids(&ids)
}

/// Build an unsolved header committing to `items`
pub fn create_block_template(
    items: &[WorkItem],
    prev_hash: &str,
    miner_address: &str,
    bits: Bits,
) -> BlockHeader {
    BlockHeader {
        version: HEADER_VERSION,
        prev_hash: prev_hash.to_string(),
        merkle_root: calculate_merkle_root(items),
        timestamp: current_timestamp_millis(),
        bits,
        nonce: 0,
        miner_address: miner_address.to_string(),
    }
}
