//! Mint submission
//!
//! A solved block's merkle root becomes an on-chain mint through the
//! [`MintBroadcaster`] boundary. Each mint spends the output of the previous
//! one, so [`MintService`] runs at most one broadcast at a time and caches
//! outcomes per merkle root.

pub mod http;
pub mod server;
pub mod service;

pub use http::HttpMintBroadcaster;
pub use server::{mint_router, MintApiState, MintApiStatus, NodeStatusFn};
pub use service::{MintService, MintStatus, DEFAULT_MINT_CACHE_TTL};

use crate::types::MerkleRoot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error as ThisError;

/// What the caller should do after a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MintAction {
    /// Terminal, successful or not; do not retry
    Done,
    /// The contract UTXO moved underneath us; refetch and resubmit
    Retry,
    /// Supply exhausted; cease all mint attempts
    Stop,
}

impl fmt::Display for MintAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MintAction::Done => write!(f, "done"),
            MintAction::Retry => write!(f, "retry"),
            MintAction::Stop => write!(f, "stop"),
        }
    }
}

/// A mint transaction accepted by the settlement layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintReceipt {
    pub txid: String,
    pub amount: u64,
}

/// Typed failure reported by the settlement collaborator
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum BroadcastError {
    #[error("contract UTXO already spent: {0}")]
    UtxoSpent(String),
    #[error("mempool conflict: {0}")]
    MempoolConflict(String),
    #[error("missing inputs: {0}")]
    MissingInputs(String),
    #[error("failed to fetch contract UTXO: {0}")]
    UtxoFetch(String),
    #[error("token supply exhausted")]
    SupplyExhausted,
    #[error("mint rejected: {0}")]
    Rejected(String),
    #[error("settlement layer unavailable: {0}")]
    Unavailable(String),
}

impl BroadcastError {
    /// Next action implied by this failure
    pub fn action(&self) -> MintAction {
        match self {
            BroadcastError::UtxoSpent(_)
            | BroadcastError::MempoolConflict(_)
            | BroadcastError::MissingInputs(_)
            | BroadcastError::UtxoFetch(_) => MintAction::Retry,
            BroadcastError::SupplyExhausted => MintAction::Stop,
            BroadcastError::Rejected(_) | BroadcastError::Unavailable(_) => MintAction::Done,
        }
    }

    /// Classify a prose error from a collaborator that has no typed errors
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let owned = message.to_string();

        if ["supply exhausted", "supply_exhausted", "mining complete", "max supply reached"]
            .iter()
            .any(|m| lower.contains(m))
        {
            BroadcastError::SupplyExhausted
        } else if lower.contains("mempool-conflict") || lower.contains("mempool conflict") {
            BroadcastError::MempoolConflict(owned)
        } else if lower.contains("missing inputs") || lower.contains("missing-inputs") {
            BroadcastError::MissingInputs(owned)
        } else if lower.contains("utxo_spent") || lower.contains("spent") {
            BroadcastError::UtxoSpent(owned)
        } else if lower.contains("utxo_fetch") || lower.contains("fetch utxo") || lower.contains("utxo not found") {
            BroadcastError::UtxoFetch(owned)
        } else {
            BroadcastError::Rejected(owned)
        }
    }
}

/// Outcome of one submission, cached per merkle root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MintResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub action: MintAction,
}

impl MintResult {
    pub fn minted(receipt: MintReceipt) -> Self {
        Self {
            success: true,
            txid: Some(receipt.txid),
            amount: Some(receipt.amount),
            error: None,
            action: MintAction::Done,
        }
    }

    pub fn failed(error: &BroadcastError) -> Self {
        Self {
            success: false,
            txid: None,
            amount: None,
            error: Some(error.to_string()),
            action: error.action(),
        }
    }

    /// Failure that did not reach the broadcaster
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            success: false,
            txid: None,
            amount: None,
            error: Some(message.into()),
            action: MintAction::Retry,
        }
    }
}

impl From<std::result::Result<MintReceipt, BroadcastError>> for MintResult {
    fn from(outcome: std::result::Result<MintReceipt, BroadcastError>) -> Self {
        match outcome {
            Ok(receipt) => MintResult::minted(receipt),
            Err(e) => MintResult::failed(&e),
        }
    }
}

/// Boundary to the contract-interaction collaborator
#[async_trait]
pub trait MintBroadcaster: Send + Sync {
    /// Build, sign and broadcast a mint spending the current contract UTXO
    async fn broadcast_mint(
        &self,
        merkle_root: &MerkleRoot,
    ) -> std::result::Result<MintReceipt, BroadcastError>;
}
