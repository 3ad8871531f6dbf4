//! Core types for Proof-of-Indexing mining
//!
//! Fundamental types used throughout the node with proper validation and
//! JSON serialization. Hashes and targets travel as lowercase hex on the wire.

use crate::{Error, Result};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a hex-encoded 256-bit value
pub const HASH_HEX_LEN: usize = 64;

/// Previous-hash sentinel used by the first block a node mines
pub const GENESIS_PREV_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Block header format version
pub const HEADER_VERSION: u32 = 1;

/// Check that a string is exactly 64 lowercase hex characters
pub fn is_hash_hex(s: &str) -> bool {
    s.len() == HASH_HEX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Mining target: a 256-bit unsigned integer stored big-endian
///
/// A hash meets the target when, read as a big-endian integer, it is less
/// than or equal to the target. Smaller targets are harder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target([u8; 32]);

impl Target {
    /// Create a target from big-endian bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Big-endian bytes of the target
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Maximum possible target (every hash qualifies)
    pub const fn max() -> Self {
        Self([0xFF; 32])
    }

    /// Minimum possible target (only the zero hash qualifies)
    pub const fn min() -> Self {
        Self([0; 32])
    }

    /// Target with `leading_zeros` leading hex zeros followed by `f`s
    ///
    /// `from_difficulty(3)` is `"000" + "f" * 61`.
    pub fn from_difficulty(leading_zeros: u32) -> Self {
        let zeros = (leading_zeros as usize).min(HASH_HEX_LEN);
        let mut bytes = [0xFFu8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let high = 2 * i;
            let low = 2 * i + 1;
            let high_nibble: u8 = if high < zeros { 0 } else { 0xF };
            let low_nibble: u8 = if low < zeros { 0 } else { 0xF };
            *byte = (high_nibble << 4) | low_nibble;
        }
        Self(bytes)
    }

    /// Parse a 64-char hex target
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != HASH_HEX_LEN {
            return Err(Error::target(format!(
                "Invalid target hex length: expected {} chars, got {}",
                HASH_HEX_LEN,
                hex.len()
            )));
        }
        let bytes =
            hex::decode(hex).map_err(|e| Error::target(format!("Invalid hex: {}", e)))?;
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }

    /// 64 lowercase hex chars, zero-padded
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Convert to an arbitrary precision integer
    pub fn to_biguint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// Convert from an arbitrary precision integer
    ///
    /// Values wider than 256 bits saturate to [`Target::max`].
    pub fn from_biguint(value: &BigUint) -> Self {
        let bytes = value.to_bytes_be();
        if bytes.len() > 32 {
            return Self::max();
        }
        let mut array = [0u8; 32];
        array[32 - bytes.len()..].copy_from_slice(&bytes);
        Self(array)
    }

    /// Number of leading hex zeros
    pub fn difficulty(&self) -> u32 {
        leading_hex_zeros(&self.to_hex())
    }

    /// Check raw hash bytes against the target
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        hash <= &self.0
    }

    /// Check a hex hash against the target
    ///
    /// Malformed hashes never meet a target.
    pub fn is_met_by_hex(&self, hash_hex: &str) -> bool {
        if hash_hex.len() != HASH_HEX_LEN {
            return false;
        }
        match hex::decode(hash_hex) {
            Ok(bytes) => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                self.is_met_by(&hash)
            }
            Err(_) => false,
        }
    }
}

/// Count the leading `'0'` characters of a hex string
pub fn leading_hex_zeros(hex: &str) -> u32 {
    hex.bytes().take_while(|&b| b == b'0').count() as u32
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Target {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Target::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Difficulty encoded in a block header
///
/// The lightweight local variant counts leading hex zeros; the on-chain
/// mint path carries a full 256-bit target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bits {
    /// Required number of leading hex zeros
    LeadingZeros(u32),
    /// Full numeric target
    Target(Target),
}

impl Bits {
    /// Check whether a hex hash satisfies these bits
    pub fn is_met_by(&self, hash_hex: &str) -> bool {
        match self {
            Bits::LeadingZeros(zeros) => crate::pow::check_difficulty(hash_hex, *zeros),
            Bits::Target(target) => target.is_met_by_hex(hash_hex),
        }
    }

    /// Equivalent numeric target
    pub fn to_target(&self) -> Target {
        match self {
            Bits::LeadingZeros(zeros) => Target::from_difficulty(*zeros),
            Bits::Target(target) => *target,
        }
    }
}

impl fmt::Display for Bits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bits::LeadingZeros(zeros) => write!(f, "{}", zeros),
            Bits::Target(target) => write!(f, "{}", target),
        }
    }
}

/// Mining input: the seven header fields committed to by the block hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_hash: String,
    pub merkle_root: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub bits: Bits,
    pub nonce: u64,
    pub miner_address: String,
}

/// A header whose double hash satisfies its own bits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolvedBlock {
    pub header: BlockHeader,
    pub hash: String,
}

impl SolvedBlock {
    /// Recompute the hash and check it against the header's bits
    pub fn verify(&self) -> Result<()> {
        let computed = crate::pow::calculate_block_hash(&self.header);
        if computed != self.hash {
            return Err(Error::mining(format!(
                "Block hash mismatch: claimed {}, computed {}",
                self.hash, computed
            )));
        }
        if !self.header.bits.is_met_by(&self.hash) {
            return Err(Error::mining(format!(
                "Block hash {} does not satisfy bits {}",
                self.hash, self.header.bits
            )));
        }
        Ok(())
    }
}

/// Kind of indexing work claimed by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkItemType {
    Validation,
    ContentServe,
    Relay,
    Heartbeat,
}

impl fmt::Display for WorkItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItemType::Validation => write!(f, "validation"),
            WorkItemType::ContentServe => write!(f, "content-serve"),
            WorkItemType::Relay => write!(f, "relay"),
            WorkItemType::Heartbeat => write!(f, "heartbeat"),
        }
    }
}

/// A unit of claimed indexing work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique id, used as the mempool dedup key
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: WorkItemType,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl WorkItem {
    /// Create a work item stamped with the current time
    pub fn new(id: impl Into<String>, item_type: WorkItemType, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            item_type,
            data,
            timestamp: crate::utils::current_timestamp_millis(),
        }
    }
}

/// Commitment over a block's work item ids (64 lowercase hex chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MerkleRoot(String);

impl MerkleRoot {
    /// Validate and wrap a merkle root
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if !is_hash_hex(&value) {
            return Err(Error::mint(format!(
                "Invalid merkle root: expected 64 lowercase hex chars, got {:?}",
                value
            )));
        }
        Ok(Self(value))
    }

    /// Hex string form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MerkleRoot {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MerkleRoot> for String {
    fn from(root: MerkleRoot) -> Self {
        root.0
    }
}

impl fmt::Display for MerkleRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validate a miner payout address
pub fn validate_miner_address(address: &str) -> Result<()> {
    if address.is_empty() || address.len() > 128 {
        return Err(Error::config(format!(
            "Invalid miner address length: {}",
            address.len()
        )));
    }
    if !address.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::config(
            "Miner address must contain only ASCII letters and digits",
        ));
    }
    Ok(())
}

/// Validate a token identifier
///
/// Token ids are either a `$`-prefixed path (`$402/some/path`) or an
/// outpoint-style `<64 hex txid>_<vout>`.
pub fn validate_token_id(token_id: &str) -> Result<()> {
    if token_id.is_empty() || token_id.len() > 256 {
        return Err(Error::config("Token id must be 1-256 characters"));
    }
    if token_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::config("Token id must not contain whitespace"));
    }
    if token_id.starts_with('$') {
        return Ok(());
    }
    match token_id.split_once('_') {
        Some((txid, vout)) if is_hash_hex(txid) && vout.parse::<u32>().is_ok() => Ok(()),
        _ => Err(Error::config(format!(
            "Invalid token id format: {:?} (expected $path or <txid>_<vout>)",
            token_id
        ))),
    }
}
