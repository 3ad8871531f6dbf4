//! HTTP surface for mint submission and node status

use super::{MintAction, MintResult, MintService};
use crate::node::NodeStatus;
use crate::types::MerkleRoot;
use crate::{Error, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Produces the node-wide status served at `GET /node/status`
pub type NodeStatusFn = Arc<dyn Fn() -> NodeStatus + Send + Sync>;

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct MintApiState {
    pub service: Arc<MintService>,
    pub token_id: String,
    pub miner_address: String,
    pub node_status: Option<NodeStatusFn>,
}

impl MintApiState {
    pub fn new(
        service: Arc<MintService>,
        token_id: impl Into<String>,
        miner_address: impl Into<String>,
    ) -> Self {
        Self {
            service,
            token_id: token_id.into(),
            miner_address: miner_address.into(),
            node_status: None,
        }
    }

    pub fn with_node_status(mut self, node_status: NodeStatusFn) -> Self {
        self.node_status = Some(node_status);
        self
    }
}

#[derive(Debug, Deserialize)]
struct MintRequest {
    #[serde(default)]
    merkle_root: Option<String>,
    #[serde(default)]
    miner_address: Option<String>,
    #[serde(default)]
    token_id: Option<String>,
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MintApiStatus {
    pub token_id: String,
    pub miner_address: String,
    pub total_mints: u64,
    pub dedup_hits: u64,
    pub last_mint_at: Option<DateTime<Utc>>,
}

/// Build the router: `POST /mint`, `GET /health`, `GET /status`, `GET /node/status`
pub fn mint_router(state: MintApiState) -> Router {
    Router::new()
        .route("/mint", post(mint_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/node/status", get(node_status_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    state: MintApiState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Mint API listening on {}", addr);

    axum::serve(listener, mint_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::network(format!("HTTP server error: {}", e)))?;

    info!("Mint API stopped");
    Ok(())
}

fn bad_request(message: impl Into<String>) -> Response {
    let body = MintResult {
        success: false,
        txid: None,
        amount: None,
        error: Some(message.into()),
        action: MintAction::Done,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

async fn mint_handler(State(state): State<MintApiState>, body: Bytes) -> Response {
    let request: MintRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return bad_request(format!("Invalid request body: {}", e)),
    };

    let merkle_root = match request.merkle_root.map(MerkleRoot::new) {
        Some(Ok(root)) => root,
        Some(Err(e)) => return bad_request(e.to_string()),
        None => return bad_request("merkle_root is required"),
    };

    if let Some(token_id) = request.token_id.as_deref() {
        if token_id != state.token_id {
            return bad_request(format!(
                "token_id {} does not match configured token {}",
                token_id, state.token_id
            ));
        }
    }
    if let Some(miner_address) = request.miner_address.as_deref() {
        if miner_address != state.miner_address {
            return bad_request(format!(
                "miner_address {} does not match configured miner",
                miner_address
            ));
        }
    }

    debug!(merkle_root = %merkle_root, "Mint requested over HTTP");

    match state.service.submit(merkle_root).await {
        Ok(result) => {
            let status = if !result.success && result.action == MintAction::Done {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            (status, Json(result)).into_response()
        }
        Err(e) => {
            warn!(category = e.category(), "Mint submission unavailable: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(MintResult::unavailable(e.to_string())),
            )
                .into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn status_handler(State(state): State<MintApiState>) -> impl IntoResponse {
    let mint = state.service.status();
    Json(MintApiStatus {
        token_id: state.token_id.clone(),
        miner_address: state.miner_address.clone(),
        total_mints: mint.total_mints,
        dedup_hits: mint.dedup_hits,
        last_mint_at: mint.last_mint_at,
    })
}

async fn node_status_handler(State(state): State<MintApiState>) -> Response {
    match &state.node_status {
        Some(node_status) => Json(node_status()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "node status not available" })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mint::{BroadcastError, MintBroadcaster, MintReceipt, DEFAULT_MINT_CACHE_TTL};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    const TOKEN: &str = "$402/tokens/test";

    struct FixedBroadcaster(std::result::Result<MintReceipt, BroadcastError>);

    #[async_trait]
    impl MintBroadcaster for FixedBroadcaster {
        async fn broadcast_mint(
            &self,
            _merkle_root: &MerkleRoot,
        ) -> std::result::Result<MintReceipt, BroadcastError> {
            self.0.clone()
        }
    }

    fn router(outcome: std::result::Result<MintReceipt, BroadcastError>) -> Router {
        let service = Arc::new(MintService::new(
            Arc::new(FixedBroadcaster(outcome)),
            DEFAULT_MINT_CACHE_TTL,
        ));
        mint_router(MintApiState::new(service, TOKEN, "1Miner"))
    }

    fn ok_receipt() -> std::result::Result<MintReceipt, BroadcastError> {
        Ok(MintReceipt {
            txid: "ef".repeat(32),
            amount: 1_000,
        })
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn mint_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/mint")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = call(router(ok_receipt()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_mint_success() {
        let request = mint_request(json!({
            "merkle_root": "ab".repeat(32),
            "miner_address": "1Miner",
            "token_id": TOKEN,
        }));
        let (status, body) = call(router(ok_receipt()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["action"], "done");
        assert_eq!(body["amount"], 1_000);
    }

    #[tokio::test]
    async fn test_mint_rejects_bad_root() {
        let request = mint_request(json!({"merkle_root": "xyz"}));
        let (status, body) = call(router(ok_receipt()), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["action"], "done");

        let request = mint_request(json!({}));
        let (status, _) = call(router(ok_receipt()), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mint_rejects_token_mismatch() {
        let request = mint_request(json!({
            "merkle_root": "ab".repeat(32),
            "token_id": "$402/tokens/other",
        }));
        let (status, _) = call(router(ok_receipt()), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mint_status_mapping() {
        let request = mint_request(json!({"merkle_root": "ab".repeat(32)}));
        let (status, body) = call(
            router(Err(BroadcastError::UtxoSpent("raced".into()))),
            request,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "retry");

        let request = mint_request(json!({"merkle_root": "ab".repeat(32)}));
        let (status, body) = call(
            router(Err(BroadcastError::Rejected("bad proof".into()))),
            request,
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["action"], "done");
        assert!(body["error"].as_str().unwrap().contains("bad proof"));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let service = Arc::new(MintService::new(
            Arc::new(FixedBroadcaster(ok_receipt())),
            DEFAULT_MINT_CACHE_TTL,
        ));
        let app = mint_router(MintApiState::new(Arc::clone(&service), TOKEN, "1Miner"));

        let root = MerkleRoot::new("cd".repeat(32)).unwrap();
        service.submit(root.clone()).await.unwrap();
        service.submit(root).await.unwrap();

        let request = Request::builder().uri("/status").body(Body::empty()).unwrap();
        let (status, body) = call(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["token_id"], TOKEN);
        assert_eq!(body["total_mints"], 1);
        assert_eq!(body["dedup_hits"], 1);
        assert!(body["last_mint_at"].is_string());
    }

    #[tokio::test]
    async fn test_node_status_without_provider() {
        let request = Request::builder().uri("/node/status").body(Body::empty()).unwrap();
        let (status, _) = call(router(ok_receipt()), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
