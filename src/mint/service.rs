//! Single-flight mint submission queue with result caching

use super::{MintAction, MintBroadcaster, MintResult};
use crate::types::MerkleRoot;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default lifetime of a cached outcome
pub const DEFAULT_MINT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Jobs waiting behind the in-flight broadcast
const QUEUE_CAPACITY: usize = 64;

/// Mint observability snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MintStatus {
    pub total_mints: u64,
    pub dedup_hits: u64,
    pub submissions: u64,
    pub failures: u64,
    pub last_mint_at: Option<DateTime<Utc>>,
    pub last_txid: Option<String>,
    pub stopped: bool,
    pub cached_results: usize,
}

struct CachedResult {
    result: MintResult,
    stored_at: Instant,
}

struct MintJob {
    merkle_root: MerkleRoot,
    reply: oneshot::Sender<MintResult>,
}

struct MintShared {
    broadcaster: Arc<dyn MintBroadcaster>,
    cache: DashMap<MerkleRoot, CachedResult>,
    cache_ttl: Duration,
    total_mints: AtomicU64,
    dedup_hits: AtomicU64,
    submissions: AtomicU64,
    failures: AtomicU64,
    last_mint: RwLock<Option<(DateTime<Utc>, String)>>,
    stop_result: RwLock<Option<MintResult>>,
    stopped: AtomicBool,
}

impl MintShared {
    fn cached(&self, merkle_root: &MerkleRoot) -> Option<MintResult> {
        let hit = self.cache.get(merkle_root).and_then(|entry| {
            if entry.stored_at.elapsed() <= self.cache_ttl {
                Some(entry.result.clone())
            } else {
                None
            }
        });
        match hit {
            Some(result) => {
                self.dedup_hits.fetch_add(1, Ordering::Relaxed);
                debug!(merkle_root = %merkle_root, "Returning cached mint result");
                Some(result)
            }
            None => {
                self.cache
                    .remove_if(merkle_root, |_, entry| entry.stored_at.elapsed() > self.cache_ttl);
                None
            }
        }
    }

    fn latched_stop(&self) -> Option<MintResult> {
        if self.stopped.load(Ordering::Acquire) {
            self.stop_result.read().clone()
        } else {
            None
        }
    }

    /// Runs on the single queue worker only
    async fn process(&self, merkle_root: MerkleRoot) -> MintResult {
        if let Some(result) = self.cached(&merkle_root) {
            return result;
        }
        if let Some(result) = self.latched_stop() {
            return result;
        }

        self.submissions.fetch_add(1, Ordering::Relaxed);
        debug!(merkle_root = %merkle_root, "Broadcasting mint");
        let result = MintResult::from(self.broadcaster.broadcast_mint(&merkle_root).await);

        if result.success {
            self.total_mints.fetch_add(1, Ordering::Relaxed);
            let txid = result.txid.clone().unwrap_or_default();
            info!(
                merkle_root = %merkle_root,
                amount = ?result.amount,
                "Mint broadcast accepted: {}",
                txid
            );
            *self.last_mint.write() = Some((Utc::now(), txid));
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                merkle_root = %merkle_root,
                action = %result.action,
                "Mint broadcast failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            );
        }

        if result.action == MintAction::Stop {
            warn!("Token supply exhausted, no further mints will be attempted");
            *self.stop_result.write() = Some(result.clone());
            self.stopped.store(true, Ordering::Release);
        }

        self.cache.retain(|_, entry| entry.stored_at.elapsed() <= self.cache_ttl);
        self.cache.insert(
            merkle_root,
            CachedResult {
                result: result.clone(),
                stored_at: Instant::now(),
            },
        );
        result
    }
}

/// Serializes mint broadcasts and deduplicates them by merkle root
///
/// Exactly one broadcast runs at a time, in FIFO order. Every outcome is
/// cached for the configured ttl, failures included.
pub struct MintService {
    shared: Arc<MintShared>,
    queue_tx: RwLock<Option<mpsc::Sender<MintJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MintService {
    /// Start the queue worker; must be called inside a Tokio runtime
    pub fn new(broadcaster: Arc<dyn MintBroadcaster>, cache_ttl: Duration) -> Self {
        let shared = Arc::new(MintShared {
            broadcaster,
            cache: DashMap::new(),
            cache_ttl,
            total_mints: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_mint: RwLock::new(None),
            stop_result: RwLock::new(None),
            stopped: AtomicBool::new(false),
        });

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let worker = tokio::spawn(Self::run_queue(Arc::clone(&shared), queue_rx));

        Self {
            shared,
            queue_tx: RwLock::new(Some(queue_tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn run_queue(shared: Arc<MintShared>, mut queue_rx: mpsc::Receiver<MintJob>) {
        debug!("Mint queue worker started");
        while let Some(job) = queue_rx.recv().await {
            let result = shared.process(job.merkle_root).await;
            // The submitter may have given up; the result is cached either way.
            let _ = job.reply.send(result);
        }
        debug!("Mint queue drained");
    }

    /// Submit a merkle root, returning a cached result when one is fresh
    pub async fn submit(&self, merkle_root: MerkleRoot) -> Result<MintResult> {
        if let Some(result) = self.shared.cached(&merkle_root) {
            return Ok(result);
        }
        if let Some(result) = self.shared.latched_stop() {
            return Ok(result);
        }

        let queue_tx = self
            .queue_tx
            .read()
            .clone()
            .ok_or_else(|| Error::mint("Mint queue is shut down"))?;

        let (reply, response) = oneshot::channel();
        queue_tx
            .send(MintJob { merkle_root, reply })
            .await
            .map_err(|_| Error::mint("Mint queue is closed"))?;

        response
            .await
            .map_err(|_| Error::mint("Mint queue dropped the submission"))
    }

    /// Evict any cached outcome for `merkle_root`, then submit again
    pub async fn resubmit(&self, merkle_root: MerkleRoot) -> Result<MintResult> {
        self.shared.cache.remove(&merkle_root);
        self.submit(merkle_root).await
    }

    /// Whether a `stop` outcome has been seen
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub fn status(&self) -> MintStatus {
        let last_mint = self.shared.last_mint.read().clone();
        MintStatus {
            total_mints: self.shared.total_mints.load(Ordering::Relaxed),
            dedup_hits: self.shared.dedup_hits.load(Ordering::Relaxed),
            submissions: self.shared.submissions.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
            last_mint_at: last_mint.as_ref().map(|(at, _)| *at),
            last_txid: last_mint.map(|(_, txid)| txid),
            stopped: self.is_stopped(),
            cached_results: self.shared.cache.len(),
        }
    }

    /// Close the queue and wait for queued jobs to finish
    ///
    /// The in-flight broadcast is never aborted.
    pub async fn shutdown(&self) {
        self.queue_tx.write().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Mint queue worker ended abnormally: {}", e);
            }
        }
        info!("Mint service stopped");
    }
}
