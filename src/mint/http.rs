//! HTTP client for the settlement collaborator
//!
//! The collaborator builds, signs and broadcasts mint transactions. It
//! answers in prose, so failures are classified here into
//! [`BroadcastError`] values.

use super::{BroadcastError, MintAction, MintBroadcaster, MintReceipt};
use crate::types::MerkleRoot;
use crate::utils::retry::RetryPolicy;
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

#[derive(Debug, Serialize)]
struct BroadcastRequest<'a> {
    merkle_root: &'a str,
    miner_address: &'a str,
    token_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    amount: Option<u64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    action: Option<MintAction>,
}

impl BroadcastResponse {
    fn into_outcome(self, status: StatusCode) -> std::result::Result<MintReceipt, BroadcastError> {
        if self.success {
            if let Some(txid) = self.txid {
                return Ok(MintReceipt {
                    txid,
                    amount: self.amount.unwrap_or(0),
                });
            }
            return Err(BroadcastError::Rejected(
                "settlement layer reported success without a txid".to_string(),
            ));
        }

        let message = self
            .error
            .unwrap_or_else(|| format!("settlement layer returned HTTP {}", status));
        let classified = BroadcastError::from_message(&message);

        // An explicit action from the collaborator overrides the text.
        match (self.action, classified) {
            (Some(MintAction::Stop), _) => Err(BroadcastError::SupplyExhausted),
            (Some(MintAction::Retry), BroadcastError::Rejected(msg)) => {
                Err(BroadcastError::UtxoFetch(msg))
            }
            (Some(MintAction::Done), e) if e.action() != MintAction::Done => {
                Err(BroadcastError::Rejected(message))
            }
            (_, e) => Err(e),
        }
    }
}

/// [`MintBroadcaster`] that POSTs to `<settlement_url>/broadcast`
#[derive(Debug, Clone)]
pub struct HttpMintBroadcaster {
    client: Client,
    broadcast_url: Url,
    miner_address: String,
    token_id: String,
    retry: RetryPolicy,
}

impl HttpMintBroadcaster {
    pub fn new(
        settlement_url: impl AsRef<str>,
        miner_address: impl Into<String>,
        token_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut broadcast_url = Url::parse(settlement_url.as_ref())
            .map_err(|e| Error::config(format!("Invalid settlement URL: {}", e)))?;
        broadcast_url
            .path_segments_mut()
            .map_err(|_| Error::config("Settlement URL cannot be a base URL"))?
            .pop_if_empty()
            .push("broadcast");

        let client = ClientBuilder::new()
            .timeout(timeout)
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            client,
            broadcast_url,
            miner_address: miner_address.into(),
            token_id: token_id.into(),
            retry: RetryPolicy::default(),
        })
    }

    /// Set custom retry policy for transport failures
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn broadcast_url(&self) -> &Url {
        &self.broadcast_url
    }

    /// One POST; transport errors and unparsable 5xx bodies are retryable
    async fn post_once(
        &self,
        merkle_root: &MerkleRoot,
    ) -> Result<std::result::Result<MintReceipt, BroadcastError>> {
        let request = BroadcastRequest {
            merkle_root: merkle_root.as_str(),
            miner_address: &self.miner_address,
            token_id: &self.token_id,
        };

        let response = self
            .client
            .post(self.broadcast_url.clone())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        match serde_json::from_slice::<BroadcastResponse>(&body) {
            Ok(parsed) => Ok(parsed.into_outcome(status)),
            Err(_) if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
                Err(Error::network(format!("Settlement layer returned HTTP {}", status)))
            }
            Err(e) => {
                debug!("Unparsable broadcast response ({}): {}", status, e);
                let text = String::from_utf8_lossy(&body);
                Ok(Err(BroadcastError::from_message(&format!(
                    "HTTP {}: {}",
                    status,
                    text.trim()
                ))))
            }
        }
    }
}

#[async_trait]
impl MintBroadcaster for HttpMintBroadcaster {
    #[instrument(skip(self), fields(url = %self.broadcast_url))]
    async fn broadcast_mint(
        &self,
        merkle_root: &MerkleRoot,
    ) -> std::result::Result<MintReceipt, BroadcastError> {
        match self.retry.execute(|| self.post_once(merkle_root)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Settlement layer unreachable: {}", e);
                Err(BroadcastError::Unavailable(e.to_string()))
            }
        }
    }
}
