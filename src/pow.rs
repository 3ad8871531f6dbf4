//! Proof-of-work engine
//!
//! Header serialization, block hashing and the bounded nonce search. The
//! serialized form is a wire contract shared with independent peer
//! implementations: the seven header fields joined by `:` in a fixed order.

use crate::crypto::double_sha256_hex;
use crate::types::{BlockHeader, SolvedBlock};
use crate::utils::current_timestamp_millis;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Field delimiter in the serialized header
pub const HEADER_DELIMITER: char = ':';

/// Default number of iterations between timestamp refreshes
pub const DEFAULT_REFRESH_INTERVAL: u64 = 10_000;

/// Default iteration budget for one call to [`mine_block`]
pub const DEFAULT_MAX_ITERATIONS: u64 = 1_000_000;

/// Deterministic string encoding of a header
///
/// `version:prevHash:merkleRoot:timestamp:bits:nonce:minerAddress`
pub fn serialize_header(header: &BlockHeader) -> String {
    format!(
        "{}{d}{}{d}{}{d}{}{d}{}{d}{}{d}{}",
        header.version,
        header.prev_hash,
        header.merkle_root,
        header.timestamp,
        header.bits,
        header.nonce,
        header.miner_address,
        d = HEADER_DELIMITER
    )
}

/// `hex(SHA256(SHA256(serialize_header(header))))`
pub fn calculate_block_hash(header: &BlockHeader) -> String {
    double_sha256_hex(serialize_header(header).as_bytes())
}

/// True iff `hash` starts with `leading_zeros` `'0'` characters
pub fn check_difficulty(hash: &str, leading_zeros: u32) -> bool {
    let zeros = leading_zeros as usize;
    hash.len() >= zeros && hash.bytes().take(zeros).all(|b| b == b'0')
}

/// Bounded nonce search
///
/// Increments the nonce from its starting value for at most `max_iterations`
/// hashes. Every `refresh_interval` iterations the timestamp is refreshed
/// and `cancel` is checked. Returns `None` on exhaustion or cancellation;
/// callers re-invoke with a fresh template.
pub fn mine_block(
    header: BlockHeader,
    max_iterations: u64,
    refresh_interval: u64,
    cancel: &CancellationToken,
) -> Option<SolvedBlock> {
    mine_block_counted(header, max_iterations, refresh_interval, cancel, None)
}

/// [`mine_block`], adding every computed hash to `hash_counter`
pub fn mine_block_counted(
    mut header: BlockHeader,
    max_iterations: u64,
    refresh_interval: u64,
    cancel: &CancellationToken,
    hash_counter: Option<&AtomicU64>,
) -> Option<SolvedBlock> {
    let refresh_interval = refresh_interval.max(1);
    let start_nonce = header.nonce;
    let mut pending = 0u64;

    for i in 0..max_iterations {
        if i > 0 && i % refresh_interval == 0 {
            if let Some(counter) = hash_counter {
                counter.fetch_add(pending, Ordering::Relaxed);
                pending = 0;
            }
            if cancel.is_cancelled() {
                debug!(iterations = i, "Nonce search cancelled");
                return None;
            }
            header.timestamp = current_timestamp_millis();
            trace!(nonce = header.nonce, "Refreshed header timestamp");
        }

        let hash = calculate_block_hash(&header);
        pending += 1;

        if header.bits.is_met_by(&hash) {
            if let Some(counter) = hash_counter {
                counter.fetch_add(pending, Ordering::Relaxed);
            }
            debug!(
                nonce = header.nonce,
                iterations = i + 1,
                "Found hash {} meeting bits {}",
                hash,
                header.bits
            );
            return Some(SolvedBlock { header, hash });
        }

        header.nonce = header.nonce.wrapping_add(1);
    }

    if let Some(counter) = hash_counter {
        counter.fetch_add(pending, Ordering::Relaxed);
    }
    debug!(
        start_nonce = start_nonce,
        iterations = max_iterations,
        "Iteration budget exhausted without a solution"
    );
    None
}
