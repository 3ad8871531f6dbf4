//! CPU mining worker implementation
//!
//! Multi-threaded double SHA-256 nonce search. Each thread owns a disjoint
//! slice of the nonce space and shares the iteration budget.

use super::{mining_span, MiningStats, MiningWorker};
use crate::pow;
use crate::types::{BlockHeader, SolvedBlock};
use crate::utils::format_hash_rate;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

/// CPU mining worker using multiple threads
pub struct CpuWorker {
    thread_count: usize,
    max_iterations: u64,
    refresh_interval: u64,
    stats: Arc<CpuMiningStats>,
}

/// Thread-safe mining statistics for CPU worker
#[derive(Debug)]
struct CpuMiningStats {
    total_hashes: AtomicU64,
    solutions_found: AtomicU64,
    start_time: Instant,
    is_mining: AtomicBool,
}

impl CpuMiningStats {
    fn new() -> Self {
        Self {
            total_hashes: AtomicU64::new(0),
            solutions_found: AtomicU64::new(0),
            start_time: Instant::now(),
            is_mining: AtomicBool::new(false),
        }
    }

    fn to_mining_stats(&self) -> MiningStats {
        MiningStats::from_counters(
            self.total_hashes.load(Ordering::Relaxed),
            self.solutions_found.load(Ordering::Relaxed),
            self.start_time.elapsed(),
        )
    }
}

impl CpuWorker {
    /// Create a new CPU worker; `thread_count == 0` uses every core
    pub fn new(thread_count: usize, max_iterations: u64, refresh_interval: u64) -> Self {
        let thread_count = if thread_count == 0 {
            num_cpus::get()
        } else {
            thread_count
        };

        info!("Creating CPU worker with {} threads", thread_count);

        Self {
            thread_count,
            max_iterations,
            refresh_interval,
            stats: Arc::new(CpuMiningStats::new()),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Whether a search is in progress
    pub fn is_mining(&self) -> bool {
        self.stats.is_mining.load(Ordering::Relaxed)
    }

    /// Starting nonce for `thread_id`: the upper 16 bits carry the thread id
    fn thread_nonce(initial: u64, thread_id: usize) -> u64 {
        initial.wrapping_add((thread_id as u64) << 48)
    }
}

#[async_trait]
impl MiningWorker for CpuWorker {
    fn worker_type(&self) -> &'static str {
        "cpu"
    }

    async fn mine(
        &mut self,
        header: BlockHeader,
        cancellation: CancellationToken,
        stats_tx: Option<mpsc::UnboundedSender<MiningStats>>,
    ) -> Result<Option<SolvedBlock>> {
        let span = mining_span(self.worker_type(), &header);

        async move {
            if cancellation.is_cancelled() {
                return Err(Error::cancelled("CPU mining"));
            }

            debug!(
                "Starting CPU mining with {} threads, budget {} iterations",
                self.thread_count, self.max_iterations
            );
            self.stats.is_mining.store(true, Ordering::Relaxed);

            // Stops sibling threads once one solves without cancelling the caller.
            let search = cancellation.child_token();
            let per_thread = self.max_iterations.div_ceil(self.thread_count as u64);
            let (solution_tx, mut solution_rx) = mpsc::unbounded_channel();

            let mut handles = Vec::with_capacity(self.thread_count);
            for thread_id in 0..self.thread_count {
                let mut thread_header = header.clone();
                thread_header.nonce = Self::thread_nonce(header.nonce, thread_id);
                let stats = Arc::clone(&self.stats);
                let search = search.clone();
                let solution_tx = solution_tx.clone();
                let refresh_interval = self.refresh_interval;

                handles.push(task::spawn_blocking(move || {
                    let solved = pow::mine_block_counted(
                        thread_header,
                        per_thread,
                        refresh_interval,
                        &search,
                        Some(&stats.total_hashes),
                    );
                    if let Some(block) = solved {
                        debug!("Solution found by thread {} with nonce {}", thread_id, block.header.nonce);
                        let _ = solution_tx.send(block);
                    }
                }));
            }

            // The channel closes once every thread has finished.
            drop(solution_tx);

            let stats_handle = stats_tx.map(|stats_tx| {
                let stats = Arc::clone(&self.stats);
                let search = search.clone();
                task::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(5));
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                let _ = stats_tx.send(stats.to_mining_stats());
                            }
                            _ = search.cancelled() => break,
                        }
                    }
                })
            });

            let result = tokio::select! {
                solution = solution_rx.recv() => match solution {
                    Some(block) => {
                        self.stats.solutions_found.fetch_add(1, Ordering::Relaxed);
                        info!(nonce = block.header.nonce, "CPU mining found block {}", block.hash);
                        Ok(Some(block))
                    }
                    None => {
                        debug!("Iteration budget spent without a solution");
                        Ok(None)
                    }
                },
                _ = cancellation.cancelled() => {
                    debug!("CPU mining cancelled");
                    Err(Error::cancelled("CPU mining"))
                }
            };

            search.cancel();
            for handle in handles {
                let _ = handle.await;
            }
            if let Some(handle) = stats_handle {
                let _ = handle.await;
            }

            self.stats.is_mining.store(false, Ordering::Relaxed);

            let final_stats = self.stats.to_mining_stats();
            debug!(
                "CPU mining round done. Total hashes: {}, hash rate: {}",
                final_stats.total_hashes,
                format_hash_rate(final_stats.hash_rate)
            );

            result
        }
        .instrument(span)
        .await
    }

    fn stats(&self) -> MiningStats {
        self.stats.to_mining_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bits, GENESIS_PREV_HASH, HEADER_VERSION};
    use assert_matches::assert_matches;

    fn header(bits: Bits) -> BlockHeader {
        BlockHeader {
            version: HEADER_VERSION,
            prev_hash: GENESIS_PREV_HASH.to_string(),
            merkle_root: "ab".repeat(32),
            timestamp: 1_700_000_000_000,
            bits,
            nonce: 0,
            miner_address: "1Miner".to_string(),
        }
    }

    #[tokio::test]
    async fn test_cpu_worker_creation() {
        let worker = CpuWorker::new(2, 1_000, 100);
        assert_eq!(worker.thread_count(), 2);
        assert_eq!(worker.worker_type(), "cpu");
        assert!(!worker.is_mining());
    }

    #[tokio::test]
    async fn test_cpu_worker_easy_mining() {
        let mut worker = CpuWorker::new(2, 100_000, 1_000);
        let result = worker
            .mine(header(Bits::LeadingZeros(1)), CancellationToken::new(), None)
            .await
            .unwrap();

        let block = result.unwrap();
        assert!(block.verify().is_ok());
        assert_eq!(worker.stats().solutions_found, 1);
        assert!(worker.stats().total_hashes >= 1);
    }

    #[tokio::test]
    async fn test_cpu_worker_budget_exhausted() {
        let mut worker = CpuWorker::new(2, 200, 50);
        let result = worker
            .mine(header(Bits::LeadingZeros(64)), CancellationToken::new(), None)
            .await;
        assert_matches!(result, Ok(None));
        assert_eq!(worker.stats().total_hashes, 200);
    }

    #[tokio::test]
    async fn test_cpu_worker_cancellation() {
        let mut worker = CpuWorker::new(1, u64::MAX, 1_000);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let result = worker
            .mine(header(Bits::LeadingZeros(64)), cancellation, None)
            .await;
        assert_matches!(result, Err(Error::Cancelled { .. }));
    }

    #[test]
    fn test_thread_nonce_partition() {
        assert_eq!(CpuWorker::thread_nonce(5, 0), 5);
        assert_eq!(CpuWorker::thread_nonce(5, 1), 5 + (1 << 48));
    }
}
