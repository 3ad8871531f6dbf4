//! Mining worker implementations
//!
//! The nonce search is CPU-bound and runs on dedicated blocking threads so
//! it never stalls gossip or HTTP handling.

use crate::types::{BlockHeader, SolvedBlock};
use crate::utils::compute_hash_rate;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Span;

pub mod cpu;

pub use cpu::CpuWorker;

/// Counters reported by a worker while it searches
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MiningStats {
    pub total_hashes: u64,
    pub solutions_found: u64,
    /// Whole seconds since the worker was created
    pub mining_time_secs: u64,
    /// Hashes per second over the worker's lifetime
    pub hash_rate: f64,
}

impl MiningStats {
    pub fn from_counters(total_hashes: u64, solutions_found: u64, elapsed: Duration) -> Self {
        Self {
            total_hashes,
            solutions_found,
            mining_time_secs: elapsed.as_secs(),
            hash_rate: compute_hash_rate(total_hashes, elapsed),
        }
    }
}

/// Mining worker trait
#[async_trait]
pub trait MiningWorker: Send + Sync {
    /// Short name used in spans and logs
    fn worker_type(&self) -> &'static str;

    /// Search for a nonce solving `header`
    ///
    /// Returns `Ok(Some(block))` on a solve and `Ok(None)` when the iteration
    /// budget is spent; callers retry with a fresh template. Cancellation
    /// yields [`crate::Error::Cancelled`].
    async fn mine(
        &mut self,
        header: BlockHeader,
        cancellation: CancellationToken,
        stats_tx: Option<mpsc::UnboundedSender<MiningStats>>,
    ) -> Result<Option<SolvedBlock>>;

    /// Snapshot of the counters; workers without counters report zeros
    fn stats(&self) -> MiningStats {
        MiningStats::default()
    }

    /// Called once before the first template is handed over
    async fn prepare(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once the mining loop exits, even after cancellation
    async fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Span wrapping one template search
pub fn mining_span(worker_type: &str, header: &BlockHeader) -> Span {
    tracing::info_span!(
        "mining",
        worker_type = worker_type,
        prev_hash = %&header.prev_hash[..header.prev_hash.len().min(16)],
        bits = %header.bits,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_from_counters() {
        let stats = MiningStats::from_counters(1_500, 2, Duration::from_millis(15_400));
        assert_eq!(stats.total_hashes, 1_500);
        assert_eq!(stats.solutions_found, 2);
        assert_eq!(stats.mining_time_secs, 15);
        assert!((stats.hash_rate - 1_500.0 / 15.4).abs() < 1e-9);
    }

    #[test]
    fn test_fresh_worker_has_no_rate() {
        let stats = MiningStats::from_counters(0, 0, Duration::ZERO);
        assert_eq!(stats, MiningStats::default());
    }

    #[test]
    fn test_worker_as_trait_object() {
        let worker: Box<dyn MiningWorker> = Box::new(CpuWorker::new(2, 1_000, 100));
        assert_eq!(worker.worker_type(), "cpu");
        assert_eq!(worker.stats().total_hashes, 0);
    }
}
