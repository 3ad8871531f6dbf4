//! Node coordinator
//!
//! Wires the gossip node, mempool, difficulty adjuster, mining loop and mint
//! service into one running instance. [`NodeLauncher`] hands out at most one
//! live [`NodeHandle`] at a time; every entry point goes through the handle.

use crate::config::Config;
use crate::difficulty::{DifficultyAdjuster, DifficultySnapshot, DifficultyStats, SharedDifficulty};
use crate::gossip::{GossipEvent, GossipMessage, GossipNode, GossipStatus, InMemoryPeerStore, MessageType};
use crate::mempool::{create_block_template, Mempool};
use crate::mint::server::{self, MintApiState};
use crate::mint::{HttpMintBroadcaster, MintAction, MintBroadcaster, MintService, MintStatus};
use crate::types::{Bits, MerkleRoot, SolvedBlock, WorkItem, WorkItemType, GENESIS_PREV_HASH};
use crate::utils::Backoff;
use crate::worker::{CpuWorker, MiningStats, MiningWorker};
use crate::{Error, Result, APP_VERSION};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between periodic status log lines and state saves
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Pause when there is nothing to mine
const IDLE_DELAY: Duration = Duration::from_secs(1);

/// Low 48 bits of the starting nonce; the upper bits belong to the threads
const NONCE_RANDOM_MASK: u64 = (1 << 48) - 1;

/// Mining loop observability snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MiningStatus {
    pub enabled: bool,
    pub active: bool,
    pub tip: String,
    pub blocks_mined: u64,
    pub blocks_accepted: u64,
    pub blocks_rejected: u64,
    pub stale_solutions: u64,
    pub last_block_hash: Option<String>,
    pub mempool_size: usize,
    pub total_hashes: u64,
    pub hash_rate: f64,
    pub difficulty: DifficultyStats,
}

/// Everything `GET /node/status` reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub version: String,
    pub uptime_secs: u64,
    pub mining: MiningStatus,
    pub gossip: GossipStatus,
    pub mint: Option<MintStatus>,
}

/// State persisted across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    pub tip: String,
    pub difficulty: DifficultySnapshot,
}

impl PersistedState {
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temporary file so a crash never leaves half a file
    pub async fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct NodeCounters {
    blocks_mined: AtomicU64,
    blocks_accepted: AtomicU64,
    blocks_rejected: AtomicU64,
    stale_solutions: AtomicU64,
}

#[derive(Debug, PartialEq, Eq)]
enum TipUpdate {
    Extended,
    AlreadyTip,
    /// Carries the tip the block failed to extend
    Stale(String),
}

struct NodeShared {
    config: Config,
    gossip: GossipNode,
    mempool: Arc<Mempool>,
    difficulty: SharedDifficulty,
    mint: Option<Arc<MintService>>,
    tip: RwLock<String>,
    last_block_hash: RwLock<Option<String>>,
    /// Cancelled when the current template goes stale
    round: RwLock<CancellationToken>,
    shutdown: CancellationToken,
    mining_enabled: AtomicBool,
    mining_active: AtomicBool,
    worker_stats: RwLock<MiningStats>,
    counters: NodeCounters,
    started_at: Instant,
}

/// Starts nodes, refusing a second one while a handle is alive
#[derive(Debug, Clone, Default)]
pub struct NodeLauncher {
    active: Arc<AtomicBool>,
}

/// Releases the launcher slot when the handle goes away
#[derive(Debug)]
struct InstanceGuard(Arc<AtomicBool>);

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl NodeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a handle from this launcher is alive
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Launch with the HTTP settlement client when a settlement URL is set
    pub async fn launch(&self, config: Config) -> Result<NodeHandle> {
        let broadcaster = match &config.settlement_url {
            Some(url) => {
                let miner_address = config.miner_address.clone().unwrap_or_default();
                let token_id = config.token_id.clone().unwrap_or_default();
                Some(Arc::new(HttpMintBroadcaster::new(
                    url,
                    miner_address,
                    token_id,
                    config.http_timeout_duration(),
                )?) as Arc<dyn MintBroadcaster>)
            }
            None => None,
        };
        self.launch_with_broadcaster(config, broadcaster).await
    }

    /// Launch with an explicit settlement collaborator (or none)
    pub async fn launch_with_broadcaster(
        &self,
        config: Config,
        broadcaster: Option<Arc<dyn MintBroadcaster>>,
    ) -> Result<NodeHandle> {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyRunning);
        }
        let guard = InstanceGuard(Arc::clone(&self.active));

        config.validate()?;
        let identity = config.identity()?;

        let mut adjuster = DifficultyAdjuster::new(config.difficulty_params());
        let mut tip = GENESIS_PREV_HASH.to_string();
        if let Some(path) = &config.state_file {
            if let Some(state) = PersistedState::load(path).await? {
                adjuster.restore_snapshot(&state.difficulty);
                tip = state.tip;
            }
        }

        let mint = broadcaster
            .map(|b| -> Result<Arc<MintService>> {
                Ok(Arc::new(MintService::new(b, config.mint_cache_ttl()?)))
            })
            .transpose()?;

        let http_listener = match &mint {
            Some(_) => Some(
                tokio::net::TcpListener::bind(config.http_socket_addr()?)
                    .await
                    .map_err(|e| Error::network(format!("Failed to bind mint API: {}", e)))?,
            ),
            None => None,
        };

        let gossip = GossipNode::new(
            config.to_gossip_config()?,
            identity,
            Arc::new(InMemoryPeerStore::new()),
        );
        let gossip_addr = gossip.start().await?;
        let events = gossip.subscribe();

        let shutdown = CancellationToken::new();
        let shared = Arc::new(NodeShared {
            mempool: Arc::new(Mempool::new(config.mempool_capacity)),
            difficulty: adjuster.shared(),
            tip: RwLock::new(tip),
            last_block_hash: RwLock::new(None),
            round: RwLock::new(shutdown.child_token()),
            mining_enabled: AtomicBool::new(config.mine),
            mining_active: AtomicBool::new(false),
            worker_stats: RwLock::new(MiningStats::default()),
            counters: NodeCounters::default(),
            started_at: Instant::now(),
            gossip,
            mint,
            shutdown,
            config,
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(NodeShared::gossip_loop(Arc::clone(&shared), events)));
        tasks.push(tokio::spawn(NodeShared::status_loop(Arc::clone(&shared))));
        if shared.config.mine {
            tasks.push(tokio::spawn(NodeShared::mining_loop(Arc::clone(&shared))));
        }

        let mut http_addr = None;
        if let (Some(mint), Some(listener)) = (&shared.mint, http_listener) {
            http_addr = listener.local_addr().ok();

            let status_source = Arc::downgrade(&shared);
            let state = MintApiState::new(
                Arc::clone(mint),
                shared.config.token_id.clone().unwrap_or_default(),
                shared.config.miner_address.clone().unwrap_or_default(),
            )
            .with_node_status(Arc::new(move || match status_source.upgrade() {
                Some(shared) => shared.status(),
                None => NodeStatus::stopped(),
            }));

            let shutdown = shared.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = server::serve(listener, state, shutdown).await {
                    error!("Mint API failed: {}", e);
                }
            }));
        }

        info!(
            node_id = %shared.gossip.node_id(),
            gossip = %gossip_addr,
            http = ?http_addr,
            mining = shared.config.mine,
            "Node started"
        );

        Ok(NodeHandle {
            shared,
            tasks,
            gossip_addr,
            http_addr,
            _guard: guard,
        })
    }
}

/// The one running node
pub struct NodeHandle {
    shared: Arc<NodeShared>,
    tasks: Vec<JoinHandle<()>>,
    gossip_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    _guard: InstanceGuard,
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("gossip_addr", &self.gossip_addr)
            .field("http_addr", &self.http_addr)
            .finish_non_exhaustive()
    }
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        self.shared.gossip.node_id()
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        self.gossip_addr
    }

    /// Mint API address, when a settlement collaborator is configured
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    pub fn gossip(&self) -> &GossipNode {
        &self.shared.gossip
    }

    pub fn mempool(&self) -> Arc<Mempool> {
        Arc::clone(&self.shared.mempool)
    }

    pub fn difficulty(&self) -> SharedDifficulty {
        Arc::clone(&self.shared.difficulty)
    }

    pub fn mint(&self) -> Option<Arc<MintService>> {
        self.shared.mint.clone()
    }

    /// Hash of the newest accepted block
    pub fn tip(&self) -> String {
        self.shared.tip.read().clone()
    }

    /// Queue claimed indexing work for the next block
    pub fn add_work(&self, item: WorkItem) -> Result<bool> {
        self.shared.mempool.add(item)
    }

    /// Dial an extra peer
    pub async fn connect(&self, addr: &str) -> Result<SocketAddr> {
        self.shared.gossip.connect(addr).await
    }

    /// Offer a block from outside the gossip network (e.g. a local indexer)
    pub fn submit_block(&self, block: SolvedBlock) -> Result<()> {
        self.shared.accept_remote_block(block)
    }

    pub fn status(&self) -> NodeStatus {
        self.shared.status()
    }

    /// Stop every task, drain the mint queue and persist state
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down node");
        self.shared.shutdown.cancel();
        self.shared.gossip.shutdown();

        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Node task ended abnormally: {}", e);
            }
        }

        if let Some(mint) = &self.shared.mint {
            mint.shutdown().await;
        }

        self.shared.save_state().await?;
        info!("Node stopped");
        Ok(())
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.shared.gossip.shutdown();
    }
}

impl NodeStatus {
    fn stopped() -> Self {
        Self {
            node_id: String::new(),
            version: APP_VERSION.to_string(),
            uptime_secs: 0,
            mining: MiningStatus {
                enabled: false,
                active: false,
                tip: String::new(),
                blocks_mined: 0,
                blocks_accepted: 0,
                blocks_rejected: 0,
                stale_solutions: 0,
                last_block_hash: None,
                mempool_size: 0,
                total_hashes: 0,
                hash_rate: 0.0,
                difficulty: DifficultyAdjuster::default().stats(),
            },
            gossip: GossipStatus {
                node_id: String::new(),
                listen_addr: None,
                connected_peers: 0,
                known_peers: 0,
                messages_received: 0,
                messages_sent: 0,
                messages_relayed: 0,
                duplicates_dropped: 0,
                messages_rejected: 0,
            },
            mint: None,
        }
    }
}

impl NodeShared {
    fn status(&self) -> NodeStatus {
        let worker_stats = self.worker_stats.read().clone();
        NodeStatus {
            node_id: self.gossip.node_id().to_string(),
            version: APP_VERSION.to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            mining: MiningStatus {
                enabled: self.mining_enabled.load(Ordering::Relaxed),
                active: self.mining_active.load(Ordering::Relaxed),
                tip: self.tip.read().clone(),
                blocks_mined: self.counters.blocks_mined.load(Ordering::Relaxed),
                blocks_accepted: self.counters.blocks_accepted.load(Ordering::Relaxed),
                blocks_rejected: self.counters.blocks_rejected.load(Ordering::Relaxed),
                stale_solutions: self.counters.stale_solutions.load(Ordering::Relaxed),
                last_block_hash: self.last_block_hash.read().clone(),
                mempool_size: self.mempool.len(),
                total_hashes: worker_stats.total_hashes,
                hash_rate: worker_stats.hash_rate,
                difficulty: self.difficulty.read().stats(),
            },
            gossip: self.gossip.status(),
            mint: self.mint.as_ref().map(|m| m.status()),
        }
    }

    async fn save_state(&self) -> Result<()> {
        let Some(path) = &self.config.state_file else {
            return Ok(());
        };
        let state = PersistedState {
            tip: self.tip.read().clone(),
            difficulty: self.difficulty.read().snapshot(),
        };
        state.save(path).await?;
        debug!("Saved node state to {}", path.display());
        Ok(())
    }

    /// Advance the tip to `block` and feed the adjuster if `block` builds on
    /// the current tip
    ///
    /// The tip stays write-locked from the comparison through the adjuster
    /// update. Lock order is tip, then difficulty.
    fn extend_tip(&self, block: &SolvedBlock) -> TipUpdate {
        let mut tip = self.tip.write();
        if block.hash == *tip {
            return TipUpdate::AlreadyTip;
        }
        if block.header.prev_hash != *tip {
            return TipUpdate::Stale(tip.clone());
        }

        if let Some(adjustment) = self.difficulty.write().record_block(block.header.timestamp) {
            info!(
                ratio = adjustment.ratio,
                old = %adjustment.old_target,
                new = %adjustment.new_target,
                "Difficulty retargeted"
            );
        }
        *tip = block.hash.clone();
        *self.last_block_hash.write() = Some(block.hash.clone());
        TipUpdate::Extended
    }

    /// Accept a block solved elsewhere if it extends our tip
    fn accept_remote_block(&self, block: SolvedBlock) -> Result<()> {
        let rejected = |reason: String| {
            self.counters.blocks_rejected.fetch_add(1, Ordering::Relaxed);
            debug!(hash = %block.hash, "Rejected block: {}", reason);
            Err(Error::mining(reason))
        };

        if let Err(e) = block.verify() {
            return rejected(e.to_string());
        }
        if !self.difficulty.read().check_hash(&block.hash) {
            return rejected("hash does not meet the local target".to_string());
        }

        match self.extend_tip(&block) {
            TipUpdate::Extended => {}
            TipUpdate::AlreadyTip => return Ok(()),
            TipUpdate::Stale(tip) => return rejected(format!("block does not extend tip {}", tip)),
        }
        self.counters.blocks_accepted.fetch_add(1, Ordering::Relaxed);
        info!(hash = %block.hash, miner = %block.header.miner_address, "Accepted block from peer");

        // The in-flight template now builds on a stale tip.
        self.round.read().cancel();
        Ok(())
    }

    /// Bookkeeping after the local worker solves a template
    async fn on_block_solved(self: &Arc<Self>, block: SolvedBlock, items: &[WorkItem]) {
        if self.extend_tip(&block) != TipUpdate::Extended {
            self.counters.stale_solutions.fetch_add(1, Ordering::Relaxed);
            debug!(hash = %block.hash, "Discarding solution on a stale tip");
            return;
        }
        let ids: Vec<&str> = items.iter().map(|item| item.id.as_str()).collect();
        let removed = self.mempool.remove_items(&ids);
        self.counters.blocks_mined.fetch_add(1, Ordering::Relaxed);
        info!(
            hash = %block.hash,
            nonce = block.header.nonce,
            items = removed,
            "Mined block"
        );

        let token_id = self.config.token_id.as_deref().unwrap_or_default();
        match GossipMessage::block_announcement(self.gossip.node_id(), token_id, &block) {
            Ok(announcement) => {
                let peers = self.gossip.publish(announcement).await;
                debug!("Announced block to {} peers", peers);
            }
            Err(e) => warn!("Failed to build block announcement: {}", e),
        }

        if self.mint.is_some() {
            match MerkleRoot::new(block.header.merkle_root.clone()) {
                Ok(root) => {
                    tokio::spawn(Self::mint_with_retries(Arc::clone(self), root));
                }
                Err(e) => warn!("Solved block has an unusable merkle root: {}", e),
            }
        }
    }

    /// Submit a mint, resubmitting on `retry` with backoff
    async fn mint_with_retries(self: Arc<Self>, merkle_root: MerkleRoot) {
        let Some(mint) = self.mint.clone() else {
            return;
        };
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut outcome = mint.submit(merkle_root.clone()).await;

        loop {
            match outcome {
                Ok(result) if result.action == MintAction::Retry => {
                    if backoff.attempt() >= self.config.mint_max_retries {
                        warn!(merkle_root = %merkle_root, "Giving up on mint after {} retries", backoff.attempt());
                        return;
                    }
                    let delay = backoff.next_delay();
                    debug!(merkle_root = %merkle_root, "Mint contention, resubmitting in {:?}", delay);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    outcome = mint.resubmit(merkle_root.clone()).await;
                }
                Ok(result) if result.action == MintAction::Stop => {
                    if self.mining_enabled.swap(false, Ordering::AcqRel) {
                        warn!("Mint supply exhausted, disabling mining");
                    }
                    self.round.read().cancel();
                    return;
                }
                Ok(_) => return,
                Err(e) => {
                    warn!(merkle_root = %merkle_root, "Mint submission failed: {}", e);
                    return;
                }
            }
        }
    }

    async fn mining_loop(shared: Arc<Self>) {
        let config = &shared.config;
        let Some(miner_address) = config.miner_address.clone() else {
            error!("Mining enabled without a miner address");
            return;
        };

        let mut worker = CpuWorker::new(
            config.threads,
            config.max_iterations,
            config.timestamp_refresh_interval,
        );
        if let Err(e) = worker.prepare().await {
            error!("Failed to prepare mining worker: {}", e);
            return;
        }

        let (stats_tx, mut stats_rx) = mpsc::unbounded_channel();
        let stats_sink = Arc::clone(&shared);
        let stats_task = tokio::spawn(async move {
            while let Some(stats) = stats_rx.recv().await {
                *stats_sink.worker_stats.write() = stats;
            }
        });

        info!("Mining loop started with {} threads", worker.thread_count());

        while !shared.shutdown.is_cancelled() && shared.mining_enabled.load(Ordering::Acquire) {
            let items = shared.mempool.get_items(config.items_per_block);
            if items.is_empty() && !config.mine_empty_blocks {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(IDLE_DELAY) => continue,
                }
            }

            let prev_hash = shared.tip.read().clone();
            let target = shared.difficulty.read().target();
            let mut header =
                create_block_template(&items, &prev_hash, &miner_address, Bits::Target(target));
            header.nonce = rand::random::<u64>() & NONCE_RANDOM_MASK;

            let round = shared.shutdown.child_token();
            *shared.round.write() = round.clone();

            shared.mining_active.store(true, Ordering::Relaxed);
            let outcome = worker.mine(header, round, Some(stats_tx.clone())).await;
            shared.mining_active.store(false, Ordering::Relaxed);
            *shared.worker_stats.write() = worker.stats();

            match outcome {
                Ok(Some(block)) => shared.on_block_solved(block, &items).await,
                Ok(None) => debug!("Iteration budget spent, rebuilding template"),
                Err(Error::Cancelled { .. }) => {
                    debug!("Mining round superseded");
                }
                Err(e) => {
                    warn!("Mining round failed: {}", e);
                    tokio::select! {
                        _ = shared.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(IDLE_DELAY) => {}
                    }
                }
            }
        }

        drop(stats_tx);
        let _ = stats_task.await;
        if let Err(e) = worker.cleanup().await {
            warn!("Mining worker cleanup failed: {}", e);
        }
        info!("Mining loop stopped");
    }

    async fn gossip_loop(shared: Arc<Self>, mut events: broadcast::Receiver<GossipEvent>) {
        loop {
            let event = tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(event) => shared.handle_gossip(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Gossip subscriber lagged, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn handle_gossip(&self, event: GossipEvent) {
        if let Some(block) = event.message.as_block_announcement() {
            if let Err(e) = self.accept_remote_block(block) {
                debug!(
                    from = %event.from,
                    sender = %event.message.sender_id,
                    "Ignoring announced block: {}",
                    e
                );
            }
            return;
        }

        // Relayed application traffic is indexing work this node performed.
        let item_type = match event.message.message_type {
            MessageType::TicketStamp => WorkItemType::Validation,
            MessageType::ContentOffer | MessageType::ContentRequest => WorkItemType::ContentServe,
            _ => WorkItemType::Relay,
        };
        let item = WorkItem::new(
            format!("{}:{}", item_type, event.message.id),
            item_type,
            serde_json::json!({
                "topic": event.topic,
                "type": event.message.message_type,
                "sender_id": event.message.sender_id,
            }),
        );
        if let Err(e) = self.mempool.add(item) {
            debug!("Dropping work item: {}", e);
        }
    }

    async fn status_loop(shared: Arc<Self>) {
        let mut interval = tokio::time::interval(STATUS_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let status = shared.status();
            info!(
                peers = status.gossip.connected_peers,
                mempool = status.mining.mempool_size,
                blocks_mined = status.mining.blocks_mined,
                blocks_accepted = status.mining.blocks_accepted,
                difficulty = status.mining.difficulty.difficulty,
                "Node status"
            );

            if let Err(e) = shared.save_state().await {
                warn!("Failed to save node state: {}", e);
            }
        }
    }
}
